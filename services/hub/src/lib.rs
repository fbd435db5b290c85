pub mod config;
pub mod directories;
pub mod dispatcher;
pub mod extension;
pub mod http;
pub mod network;
pub mod security;
pub mod session;
pub mod state;

pub use config::HubConfig;
pub use state::{Hub, ShutdownKind};

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

pub fn build_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(network::ws_handler))
        .route("/proxy", get(http::proxy_handler))
        .route("/asset", get(http::asset_handler))
        .with_state(hub)
}
