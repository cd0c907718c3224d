//! Request handlers backed by the store.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::protocol::{Request, Response, Status};
use crate::db::{Host, Store, StoreError};

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HostQuery {
    pub host: String,
}

#[derive(Debug, Deserialize)]
pub struct FavoriteUpdate {
    pub host: String,
    pub favorite: bool,
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse the request body as JSON, answering BadRequest when it does not fit.
fn decode<T: DeserializeOwned>(req: &Request, resp: &mut Response) -> Option<T> {
    match serde_json::from_slice(req.body()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Bad payload for {} (request {}): {}", req.resource, req.id, e);
            resp.fail(Status::BadRequest, format!("invalid payload: {}", e));
            None
        }
    }
}

fn status_for(err: &StoreError) -> Status {
    match err {
        StoreError::NotFound => Status::NotFound,
        StoreError::Duplicate => Status::Duplicate,
        StoreError::Constraint(_) => Status::BadRequest,
        StoreError::Sqlite(_) | StoreError::Migration(_) => Status::Internal,
    }
}

/// Fill the response from a store result.
fn respond<T: Serialize>(req: &Request, resp: &mut Response, result: Result<T, StoreError>) {
    match result {
        Ok(data) => resp.succeed(&data),
        Err(e) => {
            let status = status_for(&e);
            if status == Status::Internal {
                tracing::error!("{} {} failed: {}", req.resource, req.id, e);
            } else {
                tracing::debug!("{} {} rejected: {}", req.resource, req.id, e);
            }
            resp.fail(status, e.to_string());
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Liveness check.
pub fn handle_ping(_req: &Request, _resp: &mut Response) {}

pub fn handle_list_hosts(store: &Store, req: &Request, resp: &mut Response) {
    respond(req, resp, store.list_hosts());
}

pub fn handle_get_host(store: &Store, req: &Request, resp: &mut Response) {
    if let Some(q) = decode::<HostQuery>(req, resp) {
        respond(req, resp, store.get_host_by_name(&q.host));
    }
}

pub fn handle_host_metrics(store: &Store, req: &Request, resp: &mut Response) {
    if let Some(q) = decode::<HostQuery>(req, resp) {
        respond(req, resp, store.metrics_by_host(&q.host));
    }
}

pub fn handle_update_favorite(store: &Store, req: &Request, resp: &mut Response) {
    if let Some(update) = decode::<FavoriteUpdate>(req, resp) {
        respond(req, resp, store.update_favorite_by_name(&update.host, update.favorite));
    }
}

pub fn handle_add_host(store: &Store, req: &Request, resp: &mut Response) {
    let Some(host) = decode::<Host>(req, resp) else {
        return;
    };

    if host.hostname.trim().is_empty() {
        resp.fail(Status::BadRequest, "hostname is required");
        return;
    }

    tracing::info!("Adding host {} ({})", host.hostname, host.id);
    respond(req, resp, store.add_host(&host));
}

pub fn handle_delete_host(store: &Store, req: &Request, resp: &mut Response) {
    if let Some(q) = decode::<HostQuery>(req, resp) {
        tracing::info!("Deleting host {}", q.host);
        respond(req, resp, store.delete_host_by_name(&q.host));
    }
}
