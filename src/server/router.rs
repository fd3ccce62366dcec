//! Axum router construction.

use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::server::handlers;
use crate::server::state::SharedState;

/// Build the complete Axum router with the management API, the inbound
/// webhook endpoint, and the Bot API proxy surface.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(handlers::health::health_handler))
        // Tenant management API
        .route(
            "/api/bots",
            get(handlers::bots::list_bots_handler).post(handlers::bots::register_bot_handler),
        )
        .route(
            "/api/bots/:bot_id",
            delete(handlers::bots::delete_bot_handler),
        )
        .route(
            "/api/bots/:bot_id/webhook",
            put(handlers::bots::set_webhook_handler)
                .delete(handlers::bots::delete_webhook_handler),
        )
        // Inbound webhook deliveries from the platform
        .route(
            "/telegram/bots/:bot_id/webhook",
            post(handlers::webhook::handle_update),
        )
        // Bot API proxy
        .route(
            "/telegram/bot/:token/:method",
            get(handlers::proxy::proxy_method).post(handlers::proxy::proxy_method),
        )
        .route(
            "/telegram/file/bot/:token/*file_path",
            get(handlers::proxy::proxy_file).post(handlers::proxy::proxy_file),
        )
        .with_state(state)
}
