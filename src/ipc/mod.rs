//! Local RPC server: a Unix domain socket speaking newline-delimited JSON.

mod handlers;
mod listener;
mod protocol;
mod router;

pub use listener::*;
pub use protocol::*;
pub use router::*;

use crate::db::Store;

use std::sync::Arc;

type StoreHandler = fn(&Store, &Request, &mut Response);

/// Bind a store-backed handler to its own handle on `store`.
fn with_store(
    store: &Arc<Store>,
    handler: StoreHandler,
) -> impl Fn(&Request, &mut Response) + Send + Sync + 'static {
    let store = store.clone();
    move |req: &Request, resp: &mut Response| handler(&store, req, resp)
}

/// Build the router with all routes bound to `store`.
pub fn routes(store: Arc<Store>) -> Router {
    Router::new()
        // Liveness
        .add_get("/", handlers::handle_ping)
        // Hosts
        .add_get("/server/all", with_store(&store, handlers::handle_list_hosts))
        .add_get("/server/host", with_store(&store, handlers::handle_get_host))
        .add_put("/server/favorite", with_store(&store, handlers::handle_update_favorite))
        .add_post("/server", with_store(&store, handlers::handle_add_host))
        .add_delete("/server/host", with_store(&store, handlers::handle_delete_host))
        // Metrics
        .add_get("/metric/host", with_store(&store, handlers::handle_host_metrics))
}
