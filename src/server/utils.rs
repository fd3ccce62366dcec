//! Shared utility functions for the server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Build a standard JSON error response.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, axum::Json(body)).into_response()
}

/// Current time as seconds since UNIX epoch.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Validate a bot token's shape (`<numeric id>:<35-char secret>`) and return
/// the numeric bot id. The id prefix is what scopes every catalog query.
pub fn parse_bot_token(token: &str) -> Option<i64> {
    let (id_part, secret_part) = token.split_once(':')?;
    if !(8..=10).contains(&id_part.len()) || !id_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if secret_part.len() != 35
        || !secret_part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return None;
    }
    id_part.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shape_validation() {
        let valid = format!("{}:{}", "8457201934", "A".repeat(35));
        assert_eq!(parse_bot_token(&valid), Some(8457201934));

        assert_eq!(parse_bot_token("no-colon"), None);
        assert_eq!(parse_bot_token("123:short"), None);
        let bad_id = format!("{}:{}", "12ab5678", "A".repeat(35));
        assert_eq!(parse_bot_token(&bad_id), None);
        let bad_secret = format!("{}:{}", "84572019", "A".repeat(34) + "!");
        assert_eq!(parse_bot_token(&bad_secret), None);
    }
}
