//! Verb and resource based request routing.

use std::collections::HashMap;
use std::sync::Arc;

use super::protocol::{Action, Request, Response, Status};

pub const NO_HANDLER: &str = "No handler registered for resource";

pub type Handler = Arc<dyn Fn(&Request, &mut Response) + Send + Sync>;

/// Handler registry, one table per verb. Built once at startup.
#[derive(Default, Clone)]
pub struct Router {
    get: HashMap<String, Handler>,
    put: HashMap<String, Handler>,
    post: HashMap<String, Handler>,
    delete: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_get<F>(self, resource: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.add(Action::Get, resource, handler)
    }

    pub fn add_put<F>(self, resource: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.add(Action::Put, resource, handler)
    }

    pub fn add_post<F>(self, resource: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.add(Action::Post, resource, handler)
    }

    pub fn add_delete<F>(self, resource: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.add(Action::Delete, resource, handler)
    }

    fn add<F>(mut self, action: Action, resource: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        if let Some(table) = self.table_mut(action) {
            table.insert(resource.to_string(), Arc::new(handler));
        }
        self
    }

    fn table(&self, action: Action) -> Option<&HashMap<String, Handler>> {
        match action {
            Action::Get => Some(&self.get),
            Action::Put => Some(&self.put),
            Action::Post => Some(&self.post),
            Action::Delete => Some(&self.delete),
            Action::Unknown => None,
        }
    }

    fn table_mut(&mut self, action: Action) -> Option<&mut HashMap<String, Handler>> {
        match action {
            Action::Get => Some(&mut self.get),
            Action::Put => Some(&mut self.put),
            Action::Post => Some(&mut self.post),
            Action::Delete => Some(&mut self.delete),
            Action::Unknown => None,
        }
    }

    /// Run the handler registered for the request's verb and resource.
    pub fn dispatch(&self, req: &Request, resp: &mut Response) {
        match self.table(req.action).and_then(|t| t.get(&req.resource)) {
            Some(handler) => handler(req, resp),
            None => {
                tracing::warn!("No handler for {:?} {}", req.action, req.resource);
                resp.fail(Status::BadRequest, NO_HANDLER);
            }
        }
    }
}
