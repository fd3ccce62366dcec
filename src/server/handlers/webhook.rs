//! Inbound webhook handler: the platform delivers one update per request.
//!
//! The flow is: authenticate the delivery against the stored secret, run the
//! update through the synchronization pipeline in its own transaction, then
//! relay the raw body to the tenant's redirect URL if one is configured.
//! Synchronization and redirect delivery are independent, sequential steps;
//! neither can fail the acknowledgment.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::crypto::SecretKind;
use crate::pipeline::run_webhook_sync;
use crate::server::config::REDIRECT_TIMEOUT_SECS;
use crate::server::state::SharedState;
use crate::server::utils::{api_error, now_secs};
use crate::upstream::deliver_redirect;

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub async fn handle_update(
    State(state): State<SharedState>,
    Path(bot_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    // Authenticate, synchronize, and pull out the redirect config in one
    // lock scope; the redirect round trip happens after release.
    let redirect = {
        let mut st = state.lock().await;

        let webhook = match st.storage.get_webhook(bot_id) {
            Ok(Some(webhook)) => webhook,
            Ok(None) => return api_error(StatusCode::UNAUTHORIZED, "invalid token"),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        match st.secrets.open(&webhook.secret_token, SecretKind::WebhookToken) {
            Ok(expected) if expected == presented => {}
            _ => return api_error(StatusCode::UNAUTHORIZED, "invalid token"),
        }

        let payload: Value = match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(_) => return api_error(StatusCode::BAD_REQUEST, "JSON body expected"),
        };

        run_webhook_sync(&mut st.storage, &payload, bot_id, now_secs());

        let url = webhook
            .redirect_url
            .as_deref()
            .and_then(|sealed| st.secrets.open(sealed, SecretKind::WebhookUrl).ok());
        let secret = webhook
            .redirect_token
            .as_deref()
            .and_then(|sealed| {
                st.secrets
                    .open(sealed, SecretKind::WebhookRedirectToken)
                    .ok()
            });
        url.map(|url| (url, secret))
    };
    // Lock released.

    if let Some((url, secret)) = redirect {
        if let Err(e) = deliver_redirect(&url, secret.as_deref(), &body, REDIRECT_TIMEOUT_SECS) {
            crate::mlog!(
                "webhook: {} redirect delivery failed: {e}",
                crate::logging::bot_tag(bot_id)
            );
        }
    }

    StatusCode::OK.into_response()
}
