use axum::{routing::get, Router};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use tiller_core::TillerConfig;
use tiller_store::Store;
use tiller_turn::{TurnCoordinator, TurnRegistry};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: TillerConfig,
    pub store: Arc<Store>,
    pub registry: Arc<TurnRegistry>,
    pub coordinator: Arc<TurnCoordinator>,
    /// Active WS connections: conn_id -> outbound frame sender.
    pub ws_clients: DashMap<String, mpsc::Sender<String>>,
}

impl AppState {
    pub fn new(
        config: TillerConfig,
        store: Arc<Store>,
        registry: Arc<TurnRegistry>,
        coordinator: Arc<TurnCoordinator>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            coordinator,
            ws_clients: DashMap::new(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
