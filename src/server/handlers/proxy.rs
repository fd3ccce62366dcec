//! Outbound proxy handlers: forward method calls and file downloads to the
//! remote Bot API on behalf of a registered bot, and synchronize every
//! successful decoded result as a side effect.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value};

use crate::crypto::SecretKind;
use crate::pipeline::run_response_sync;
use crate::server::state::{AppState, SharedState};
use crate::server::utils::{api_error, now_secs, parse_bot_token};

/// Check a presented token against the stored credential. Unknown bots and
/// wrong credentials both answer 404.
fn authorize(st: &AppState, token: &str) -> Result<i64, Response> {
    let Some(bot_id) = parse_bot_token(token) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid bot token format",
        ));
    };
    let bot = match st.storage.get_bot(bot_id) {
        Ok(Some(bot)) => bot,
        Ok(None) => return Err(api_error(StatusCode::NOT_FOUND, "bot not found")),
        Err(e) => return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };
    match st.secrets.open(&bot.token, SecretKind::BotToken) {
        Ok(stored) if stored == token => Ok(bot_id),
        _ => Err(api_error(StatusCode::NOT_FOUND, "bot not found")),
    }
}

/// Forward one method call. Query parameters and the JSON body are merged
/// into a single request map; the decoded upstream result feeds the
/// synchronization pipeline when the call succeeded.
pub async fn proxy_method(
    State(state): State<SharedState>,
    Path((token, method)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let method = method.trim_end_matches('/').to_string();

    let (api, bot_id) = {
        let st = state.lock().await;
        let bot_id = match authorize(&st, &token) {
            Ok(bot_id) => bot_id,
            Err(response) => return response,
        };
        (std::sync::Arc::clone(&st.api), bot_id)
    };

    let body_map: Map<String, Value> = if body.is_empty() {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => map,
            _ => return api_error(StatusCode::NOT_FOUND, "JSON request expected"),
        }
    };

    let mut merged = Map::new();
    for (key, value) in &query {
        merged.insert(key.clone(), Value::String(value.clone()));
    }
    for (key, value) in body_map {
        merged.insert(key, value);
    }

    // Upstream round trip without holding the state lock.
    let raw = match api.forward(&token, &method, &Value::Object(merged.clone())) {
        Ok(raw) => raw,
        Err(e) => {
            crate::mlog!(
                "proxy: {} {} unreachable: {e}",
                crate::logging::bot_tag(bot_id),
                crate::logging::method_tag(&method)
            );
            return api_error(StatusCode::BAD_GATEWAY, "failed to reach the remote API");
        }
    };

    if raw.status == 200 {
        if let Ok(envelope) = serde_json::from_slice::<Value>(&raw.body) {
            if envelope.get("ok").and_then(Value::as_bool) == Some(true) {
                let result = envelope.get("result").cloned().unwrap_or(Value::Null);
                let mut st = state.lock().await;
                let api = std::sync::Arc::clone(&st.api);
                run_response_sync(
                    &mut st.storage,
                    &merged,
                    &result,
                    &method,
                    bot_id,
                    &token,
                    api.as_ref(),
                    now_secs(),
                );
            }
        }
    }

    let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [(header::CONTENT_TYPE, raw.content_type)],
        raw.body,
    )
        .into_response()
}

/// Forward a file download. The response body passes through unchanged; no
/// synchronization happens here, file sightings come from payloads.
pub async fn proxy_file(
    State(state): State<SharedState>,
    Path((token, file_path)): Path<(String, String)>,
) -> Response {
    let api = {
        let st = state.lock().await;
        if let Err(response) = authorize(&st, &token) {
            return response;
        }
        std::sync::Arc::clone(&st.api)
    };

    match api.download_file(&token, &file_path) {
        Ok(raw) => {
            let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (
                status,
                [(header::CONTENT_TYPE, raw.content_type)],
                raw.body,
            )
                .into_response()
        }
        Err(e) => {
            crate::mlog!("proxy: file download failed: {e}");
            api_error(StatusCode::BAD_GATEWAY, "failed to reach the remote API")
        }
    }
}
