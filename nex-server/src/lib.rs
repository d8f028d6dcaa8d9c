//! nex-server: host telemetry and media control over WebSocket
//!
//! Clients log in over HTTP, trade the login token for a short-lived session
//! token and socket URL, then authenticate in-band on the socket. The hub
//! pushes a host snapshot to every authenticated session once per tick and
//! closes sessions whose token lifetime ran out.

pub mod handlers;
pub mod host;
pub mod hub;
pub mod media;
pub mod session;
pub mod state;
pub mod telemetry;

#[cfg(test)]
mod testing;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Build the HTTP router
pub fn app(state: AppState) -> Router {
    let art_route = format!(
        "{}/{{encoded}}",
        state.config.telemetry.art_route_prefix.trim_end_matches('/')
    );

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/v1/login", post(handlers::login_handler))
        .route("/v1/websocket", get(handlers::websocket_token_handler))
        .route("/v1/monitor/{socket_id}/ws", get(handlers::ws_handler))
        .route(&art_route, get(handlers::image_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
