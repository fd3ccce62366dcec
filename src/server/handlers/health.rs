//! Health check handler.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::server::state::SharedState;
use crate::server::utils::api_error;

pub async fn health_handler(State(state): State<SharedState>) -> Response {
    let st = state.lock().await;
    match st.storage.list_bot_ids() {
        Ok(ids) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({
                "status": "ok",
                "bots": ids.len(),
            })),
        )
            .into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
