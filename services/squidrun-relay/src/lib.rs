pub mod config;
pub mod health;
pub mod pairing;
pub mod pending;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::routing::get;
use axum::Router;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/relay", get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(state)
}
