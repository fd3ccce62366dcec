//! Derived-message reconstruction for copy and forward operations.
//!
//! The upstream API answers a copy/forward call with nothing but the newly
//! assigned message ids, so the catalog would have a hole for every copied
//! message. This module fills it: it clones the stored source rows, patches
//! identifiers and request overrides onto the clones, and feeds them back
//! through the extractor/reconciler as if they had been observed directly.
//!
//! Everything here is best-effort. A source message that was never logged,
//! a destination that cannot be resolved, or a malformed request skips the
//! operation with a warning; synthesis is a side effect and must not fail
//! the proxied call.

use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::payload::Message;
use crate::reconcile::{record_payload, refresh_chat_full_info, ReconcileOutcome};
use crate::storage::{
    chat_exists, find_chat_id_by_username, get_chat, get_messages_in_chat, MessageRow,
    StorageError,
};
use crate::upstream::ChatInfoFetcher;

/// Which copy/forward variant produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// `copyMessage`: one message, caption overrides allowed.
    Single,
    /// `copyMessages`: many messages, `remove_caption` allowed.
    Batch,
    /// `forwardMessages`: many messages, captions always kept.
    Forward,
}

/// The destination as given in the request: a numeric id or a public
/// `@username` handle.
#[derive(Debug, Clone, PartialEq)]
enum ChatTarget {
    Id(i64),
    Username(String),
}

fn parse_chat_target(value: Option<&Value>) -> Option<ChatTarget> {
    match value? {
        Value::Number(n) => n.as_i64().map(ChatTarget::Id),
        Value::String(s) => {
            if let Some(handle) = s.strip_prefix('@') {
                if handle.is_empty() {
                    None
                } else {
                    Some(ChatTarget::Username(handle.to_string()))
                }
            } else {
                s.parse::<i64>().ok().map(ChatTarget::Id)
            }
        }
        _ => None,
    }
}

fn parse_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn flag(req: &Map<String, Value>, key: &str) -> bool {
    req.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// The `(source id, assigned id)` pairs for one operation, decoded from the
/// request and the upstream result. `None` when the shapes don't line up.
fn id_pairs(req: &Map<String, Value>, result: &Value, mode: CopyMode) -> Option<Vec<(i64, i64)>> {
    match mode {
        CopyMode::Single => {
            let source = parse_i64(req.get("message_id"))?;
            let assigned = parse_i64(result.get("message_id"))?;
            Some(vec![(source, assigned)])
        }
        CopyMode::Batch | CopyMode::Forward => {
            let sources: Vec<i64> = req
                .get("message_ids")?
                .as_array()?
                .iter()
                .map(|v| v.as_i64())
                .collect::<Option<_>>()?;
            let assigned: Vec<i64> = result
                .as_array()?
                .iter()
                .map(|v| parse_i64(v.get("message_id")))
                .collect::<Option<_>>()?;
            if sources.is_empty() || sources.len() != assigned.len() {
                return None;
            }
            Some(sources.into_iter().zip(assigned).collect())
        }
    }
}

/// Resolve the destination to a known chat id, fetching its profile from
/// upstream when the catalog has never seen it. Returns `None` when the
/// destination cannot be resolved even after a live fetch.
fn resolve_destination(
    conn: &Connection,
    target: &ChatTarget,
    bot_id: i64,
    token: &str,
    fetcher: &dyn ChatInfoFetcher,
    now: i64,
) -> Result<Option<i64>, StorageError> {
    let (known, fetch_ref) = match target {
        ChatTarget::Id(id) => (
            chat_exists(conn, *id)?.then_some(*id),
            id.to_string(),
        ),
        ChatTarget::Username(handle) => (
            find_chat_id_by_username(conn, handle)?,
            format!("@{handle}"),
        ),
    };

    if let Some(id) = known {
        return Ok(Some(id));
    }

    match fetcher.fetch_chat(token, &fetch_ref) {
        Ok(info) => {
            refresh_chat_full_info(conn, &info, bot_id, now)?;
            Ok(Some(info.id))
        }
        Err(e) => {
            crate::mlog!("synthesize: destination {fetch_ref} unresolved: {e}");
            Ok(None)
        }
    }
}

/// Clone one stored row into a payload-shaped value for the new identity.
fn clone_row(
    row: &MessageRow,
    dest_chat_id: i64,
    dest_chat_kind: crate::payload::ChatKind,
    new_id: i64,
    req: &Map<String, Value>,
    mode: CopyMode,
) -> Option<Value> {
    let mut value = row.to_payload_value(dest_chat_kind);
    let map = value.as_object_mut()?;

    // A copy is never "edited", whatever the source was.
    map.remove("edit_date");
    map.insert("message_id".to_string(), Value::from(new_id));
    map.insert(
        "chat".to_string(),
        serde_json::json!({"id": dest_chat_id, "type": dest_chat_kind.as_str()}),
    );

    if let Some(thread_id) = parse_i64(req.get("message_thread_id")) {
        map.insert("message_thread_id".to_string(), Value::from(thread_id));
    }

    if mode == CopyMode::Batch && flag(req, "remove_caption") {
        map.remove("caption");
    }

    if flag(req, "protect_content") {
        map.insert("has_protected_content".to_string(), Value::Bool(true));
    }

    if mode == CopyMode::Single {
        // Caption overrides apply to the single-message variant only. Each
        // request field replaces exactly the named field on the clone.
        if let Some(caption) = req.get("caption").and_then(Value::as_str) {
            map.insert("caption".to_string(), Value::from(caption));
        }
        if let Some(entities) = req.get("caption_entities") {
            if !entities.is_null() {
                map.insert("caption_entities".to_string(), entities.clone());
            }
        }
        if let Some(above) = req.get("show_caption_above_media").and_then(Value::as_bool) {
            map.insert("show_caption_above_media".to_string(), Value::Bool(above));
        }
        if let Some(markup) = req.get("reply_markup") {
            if !markup.is_null() {
                map.insert("reply_markup".to_string(), markup.clone());
            }
        }
    }

    // The clone must still decode as a message before it re-enters the
    // extraction path.
    if serde_json::from_value::<Message>(value.clone()).is_err() {
        return None;
    }
    Some(value)
}

/// Reconstruct the messages created by one copy/forward operation and
/// reconcile them. Returns `None` when the operation was skipped.
#[allow(clippy::too_many_arguments)]
pub fn synthesize_copies(
    conn: &Connection,
    req: &Map<String, Value>,
    result: &Value,
    mode: CopyMode,
    bot_id: i64,
    token: &str,
    fetcher: &dyn ChatInfoFetcher,
    now: i64,
) -> Result<Option<ReconcileOutcome>, StorageError> {
    let Some(target) = parse_chat_target(req.get("chat_id")) else {
        crate::mlog!("synthesize: request missing destination chat, skipping");
        return Ok(None);
    };
    let Some(from_chat_id) = parse_i64(req.get("from_chat_id")) else {
        crate::mlog!("synthesize: request missing source chat, skipping");
        return Ok(None);
    };
    let Some(pairs) = id_pairs(req, result, mode) else {
        crate::mlog!("synthesize: message id sets missing or mismatched, skipping");
        return Ok(None);
    };

    let source_ids: Vec<i64> = pairs.iter().map(|(source, _)| *source).collect();
    let sources = get_messages_in_chat(conn, from_chat_id, &source_ids)?;
    if sources.is_empty() {
        // The originals were never logged; a recoverable gap, not an error.
        crate::mlog!(
            "synthesize: no stored originals in {} for {} id(s), skipping",
            crate::logging::chat_tag(from_chat_id),
            source_ids.len()
        );
        return Ok(None);
    }

    let Some(dest_chat_id) = resolve_destination(conn, &target, bot_id, token, fetcher, now)?
    else {
        return Ok(None);
    };
    let Some(dest_chat) = get_chat(conn, dest_chat_id)? else {
        crate::mlog!(
            "synthesize: destination {} vanished after resolution, skipping",
            crate::logging::chat_tag(dest_chat_id)
        );
        return Ok(None);
    };

    let mut clones: Vec<Value> = Vec::new();
    for (source_id, new_id) in &pairs {
        let Some(row) = sources.iter().find(|m| m.message_id == *source_id) else {
            continue;
        };
        if let Some(clone) = clone_row(row, dest_chat_id, dest_chat.kind, *new_id, req, mode) {
            clones.push(clone);
        }
    }

    if clones.is_empty() {
        return Ok(None);
    }

    let outcome = record_payload(conn, &Value::Array(clones), bot_id, now)?;
    Ok(Some(outcome))
}
