//! Tenant registration and webhook configuration handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;

use crate::crypto::{generate_secret_token, SecretKind};
use crate::server::state::SharedState;
use crate::server::utils::{api_error, now_secs, parse_bot_token};
use crate::storage::{upsert_user_profile, BotRow, BotWebhookRow};

#[derive(Deserialize)]
pub struct RegisterBotRequest {
    token: String,
}

/// Register a bot credential: verify the token against the upstream with a
/// `getMe` call, record the bot's own user profile, and store the sealed
/// token.
pub async fn register_bot_handler(
    State(state): State<SharedState>,
    axum::Json(req): axum::Json<RegisterBotRequest>,
) -> Response {
    let Some(bot_id) = parse_bot_token(&req.token) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid bot token format");
    };

    // Verify against the upstream before persisting anything.
    let api = {
        let st = state.lock().await;
        std::sync::Arc::clone(&st.api)
    };
    let me = match api.get_me(&req.token) {
        Ok(me) => me,
        Err(e) => {
            crate::mlog!("bots: token verification failed: {e}");
            return api_error(StatusCode::BAD_GATEWAY, "token verification failed");
        }
    };
    if me.id != bot_id {
        return api_error(StatusCode::BAD_REQUEST, "token does not match its id prefix");
    }

    let capability = |key: &str| me.extra.get(key).and_then(Value::as_bool).unwrap_or(false);
    let row = BotRow {
        id: bot_id,
        token: Vec::new(), // sealed once the lock is held
        can_join_groups: capability("can_join_groups"),
        can_read_all_group_messages: capability("can_read_all_group_messages"),
        supports_inline_queries: capability("supports_inline_queries"),
        can_connect_to_business: capability("can_connect_to_business"),
        has_main_web_app: capability("has_main_web_app"),
        created_at: now_secs(),
    };

    let st = state.lock().await;
    let sealed = match st.secrets.seal(&req.token, SecretKind::BotToken) {
        Ok(sealed) => sealed,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let row = BotRow { token: sealed, ..row };

    // The bot's identity row must exist before the credential row can
    // reference it.
    if let Err(e) = upsert_user_profile(st.storage.conn(), &me) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    match st.storage.insert_bot(&row) {
        Ok(()) => {
            crate::mlog!("bots: registered {}", crate::logging::bot_tag(bot_id));
            (
                StatusCode::CREATED,
                axum::Json(serde_json::json!({"id": bot_id})),
            )
                .into_response()
        }
        Err(e) if e.is_unique_violation() => {
            api_error(StatusCode::CONFLICT, "bot already registered")
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn list_bots_handler(State(state): State<SharedState>) -> Response {
    let st = state.lock().await;
    match st.storage.list_bot_ids() {
        Ok(ids) => (StatusCode::OK, axum::Json(serde_json::json!(ids))).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn delete_bot_handler(
    State(state): State<SharedState>,
    Path(bot_id): Path<i64>,
) -> Response {
    let st = state.lock().await;
    match st.storage.delete_bot(bot_id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "bot not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct SetWebhookRequest {
    /// Optional tenant endpoint that receives a copy of every update.
    redirect_url: Option<String>,
    /// Secret header value to present to the redirect endpoint.
    redirect_token: Option<String>,
}

/// Configure the webhook for a bot: generate a fresh secret, register the
/// proxy's endpoint with the upstream, and store the sealed configuration.
pub async fn set_webhook_handler(
    State(state): State<SharedState>,
    Path(bot_id): Path<i64>,
    axum::Json(req): axum::Json<SetWebhookRequest>,
) -> Response {
    let (api, token, public_url) = {
        let st = state.lock().await;
        let bot = match st.storage.get_bot(bot_id) {
            Ok(Some(bot)) => bot,
            Ok(None) => return api_error(StatusCode::NOT_FOUND, "bot not found"),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        let token = match st.secrets.open(&bot.token, SecretKind::BotToken) {
            Ok(token) => token,
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        let Some(public_url) = st.public_url.clone() else {
            return api_error(
                StatusCode::CONFLICT,
                "no public URL configured; cannot register a webhook",
            );
        };
        (std::sync::Arc::clone(&st.api), token, public_url)
    };
    // Lock released for the upstream round trip.

    let secret = generate_secret_token();
    let endpoint = format!(
        "{}/telegram/bots/{}/webhook",
        public_url.trim_end_matches('/'),
        bot_id
    );
    if let Err(e) = api.set_webhook(&token, &endpoint, &secret) {
        crate::mlog!(
            "bots: {} upstream webhook registration failed: {e}",
            crate::logging::bot_tag(bot_id)
        );
        return api_error(StatusCode::BAD_GATEWAY, "upstream webhook registration failed");
    }

    let st = state.lock().await;
    let seal_opt = |value: Option<&str>, kind: SecretKind| -> Result<Option<Vec<u8>>, Response> {
        match value {
            Some(v) => st
                .secrets
                .seal(v, kind)
                .map(Some)
                .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
            None => Ok(None),
        }
    };

    let secret_token = match st.secrets.seal(&secret, SecretKind::WebhookToken) {
        Ok(sealed) => sealed,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let redirect_url = match seal_opt(req.redirect_url.as_deref(), SecretKind::WebhookUrl) {
        Ok(sealed) => sealed,
        Err(response) => return response,
    };
    let redirect_token = match seal_opt(
        req.redirect_token.as_deref(),
        SecretKind::WebhookRedirectToken,
    ) {
        Ok(sealed) => sealed,
        Err(response) => return response,
    };

    let row = BotWebhookRow {
        bot_id,
        secret_token,
        redirect_url,
        redirect_token,
        updated_at: now_secs(),
    };
    match st.storage.upsert_webhook(&row) {
        Ok(()) => {
            crate::mlog!("bots: {} webhook configured", crate::logging::bot_tag(bot_id));
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({"endpoint": endpoint})),
            )
                .into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct DeleteWebhookQuery {
    #[serde(default)]
    drop_pending_updates: bool,
}

pub async fn delete_webhook_handler(
    State(state): State<SharedState>,
    Path(bot_id): Path<i64>,
    Query(params): Query<DeleteWebhookQuery>,
) -> Response {
    let (api, token) = {
        let st = state.lock().await;
        if matches!(st.storage.get_webhook(bot_id), Ok(None)) {
            return api_error(StatusCode::NOT_FOUND, "webhook not found");
        }
        let bot = match st.storage.get_bot(bot_id) {
            Ok(Some(bot)) => bot,
            Ok(None) => return api_error(StatusCode::NOT_FOUND, "bot not found"),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        let token = match st.secrets.open(&bot.token, SecretKind::BotToken) {
            Ok(token) => token,
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (std::sync::Arc::clone(&st.api), token)
    };

    if let Err(e) = api.delete_webhook(&token, params.drop_pending_updates) {
        crate::mlog!(
            "bots: {} upstream webhook removal failed: {e}",
            crate::logging::bot_tag(bot_id)
        );
        return api_error(StatusCode::BAD_GATEWAY, "upstream webhook removal failed");
    }

    let st = state.lock().await;
    match st.storage.delete_webhook(bot_id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "webhook not found"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
