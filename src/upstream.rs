//! Outbound HTTP to the remote Bot API and to tenant redirect targets.
//!
//! These functions encapsulate every network operation the proxy performs on
//! its own behalf: verifying tokens (`getMe`), resolving unknown chats
//! (`getChat`), registering webhooks, forwarding proxied method calls, and
//! best-effort delivery of webhook bodies to a tenant-configured redirect
//! URL. The [`ChatInfoFetcher`] trait is the seam the synthesizer uses so
//! tests can resolve chats without a live upstream.

use std::io::Read as _;
use std::time::Duration;

use serde_json::Value;

use crate::payload::{ChatFullInfo, User};

#[derive(Debug)]
pub enum UpstreamError {
    /// Transport-level failure: connect, timeout, TLS.
    Transport(String),
    /// The upstream answered, but with a non-success payload.
    Api { status: u16, description: String },
    /// The upstream answered with something that does not decode.
    Decode(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Transport(msg) => write!(f, "upstream unreachable: {msg}"),
            UpstreamError::Api {
                status,
                description,
            } => write!(f, "upstream api error {status}: {description}"),
            UpstreamError::Decode(msg) => write!(f, "upstream response decode: {msg}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<serde_json::Error> for UpstreamError {
    fn from(error: serde_json::Error) -> Self {
        UpstreamError::Decode(error.to_string())
    }
}

/// Resolves a chat reference (`"<id>"` or `"@handle"`) to a full chat
/// snapshot. Implemented by [`BotApi`] with a live `getChat` call.
pub trait ChatInfoFetcher {
    fn fetch_chat(&self, token: &str, chat: &str) -> Result<ChatFullInfo, UpstreamError>;
}

/// A raw response forwarded back to the proxy caller.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Client for the remote Bot API.
pub struct BotApi {
    agent: ureq::Agent,
    base_url: String,
    file_base_url: String,
}

impl BotApi {
    pub fn new(base_url: &str, file_base_url: &str, timeout_secs: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(timeout_secs))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            file_base_url: file_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn method_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, token, method)
    }

    /// Forward a method call and return the upstream response verbatim,
    /// whatever its status. Used by the proxy handlers, which must relay
    /// upstream errors to the caller unchanged.
    pub fn forward(
        &self,
        token: &str,
        method: &str,
        params: &Value,
    ) -> Result<RawResponse, UpstreamError> {
        let url = self.method_url(token, method);
        let result = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&params.to_string());

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => return Err(UpstreamError::Transport(e.to_string())),
        };

        let status = response.status();
        let content_type = response.content_type().to_string();
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }

    /// Call a method on the proxy's own behalf and unwrap the `result`
    /// field. Non-`ok` responses become [`UpstreamError::Api`].
    fn call(&self, token: &str, method: &str, params: &Value) -> Result<Value, UpstreamError> {
        let raw = self.forward(token, method, params)?;
        let envelope: Value = serde_json::from_slice(&raw.body)
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        if envelope.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let description = envelope
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(UpstreamError::Api {
                status: raw.status,
                description,
            })
        }
    }

    /// Fetch the bot's own identity.
    pub fn get_me(&self, token: &str) -> Result<User, UpstreamError> {
        let result = self.call(token, "getMe", &Value::Object(Default::default()))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fetch the full info snapshot for a chat id or `@username`.
    pub fn get_chat(&self, token: &str, chat: &str) -> Result<ChatFullInfo, UpstreamError> {
        let result = self.call(token, "getChat", &serde_json::json!({"chat_id": chat}))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Point the upstream webhook at `url`, authenticated with `secret`.
    pub fn set_webhook(&self, token: &str, url: &str, secret: &str) -> Result<(), UpstreamError> {
        self.call(
            token,
            "setWebhook",
            &serde_json::json!({"url": url, "secret_token": secret}),
        )?;
        Ok(())
    }

    /// Remove the upstream webhook registration.
    pub fn delete_webhook(
        &self,
        token: &str,
        drop_pending_updates: bool,
    ) -> Result<(), UpstreamError> {
        self.call(
            token,
            "deleteWebhook",
            &serde_json::json!({"drop_pending_updates": drop_pending_updates}),
        )?;
        Ok(())
    }

    /// Stream a file's bytes through the proxy.
    pub fn download_file(&self, token: &str, file_path: &str) -> Result<RawResponse, UpstreamError> {
        let url = format!(
            "{}/file/bot{}/{}",
            self.file_base_url,
            token,
            file_path.trim_start_matches('/')
        );
        let result = self.agent.get(&url).call();
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => return Err(UpstreamError::Transport(e.to_string())),
        };

        let status = response.status();
        let content_type = response.content_type().to_string();
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

impl ChatInfoFetcher for BotApi {
    fn fetch_chat(&self, token: &str, chat: &str) -> Result<ChatFullInfo, UpstreamError> {
        self.get_chat(token, chat)
    }
}

/// Deliver a webhook body to a tenant's redirect URL. Best-effort: the
/// caller logs and swallows any error; delivery never affects the primary
/// synchronization transaction, which has already committed.
pub fn deliver_redirect(
    url: &str,
    secret: Option<&str>,
    body: &[u8],
    timeout_secs: u64,
) -> Result<(), UpstreamError> {
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(timeout_secs))
        .build();

    let mut request = agent.post(url).set("Content-Type", "application/json");
    if let Some(secret) = secret {
        request = request.set("X-Telegram-Bot-Api-Secret-Token", secret);
    }
    request
        .send_bytes(body)
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;
    Ok(())
}
