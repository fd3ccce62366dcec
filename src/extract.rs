//! Entity extraction from arbitrary decoded payloads.
//!
//! The extractor walks a decoded JSON tree — a single update, a list of
//! updates, a single message, or a list of messages — and collects every
//! embedded user, chat, message, and file into four maps keyed by entity
//! identity. Each node is visited at most once, tracked by address, so
//! shared subtrees and self-referential structures terminate.
//!
//! Recognition is structural: an object is a user, chat, or message when it
//! carries that kind's identifying fields, and a file when it exposes both a
//! `file_unique_id` and a bot-scoped `file_id` under an attribute key that
//! names a known file shape. Duplicate keys keep the first occurrence;
//! payloads are internally consistent, so this is a tie-break rather than a
//! correctness decision.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::payload::{Chat, FileKind, Message, User};

/// One file occurrence found inside a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSighting {
    pub file_unique_id: String,
    /// Bot-scoped handle used to fetch the bytes. Short-lived, never a key.
    pub file_id: String,
    pub kind: FileKind,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    /// The full object as decoded, for overflow storage.
    pub raw: Map<String, Value>,
}

/// Deduplicated entities collected from one payload.
#[derive(Debug, Default)]
pub struct EntityBatch {
    pub users: BTreeMap<i64, User>,
    pub chats: BTreeMap<i64, Chat>,
    pub messages: BTreeMap<(i64, i64), Message>,
    pub files: BTreeMap<String, FileSighting>,
}

impl EntityBatch {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.chats.is_empty()
            && self.messages.is_empty()
            && self.files.is_empty()
    }
}

/// Walk `payload` and collect every embedded entity.
pub fn collect_entities(payload: &Value) -> EntityBatch {
    let mut batch = EntityBatch::default();
    let mut seen: HashSet<usize> = HashSet::new();
    walk(payload, None, &mut seen, &mut batch);
    batch
}

fn walk(
    value: &Value,
    context_key: Option<&str>,
    seen: &mut HashSet<usize>,
    batch: &mut EntityBatch,
) {
    let addr = value as *const Value as usize;
    if !seen.insert(addr) {
        return;
    }

    match value {
        Value::Object(map) => {
            recognize(map, context_key, batch);
            for (key, nested) in map {
                walk(nested, Some(key.as_str()), seen, batch);
            }
        }
        Value::Array(items) => {
            // Items inherit the carrying key: `photo` holds a list of sizes,
            // each of which is still a photo-shaped file.
            for item in items {
                walk(item, context_key, seen, batch);
            }
        }
        _ => {}
    }
}

fn recognize(map: &Map<String, Value>, context_key: Option<&str>, batch: &mut EntityBatch) {
    if looks_like_user(map) {
        if let Ok(user) = serde_json::from_value::<User>(Value::Object(map.clone())) {
            batch.users.entry(user.id).or_insert(user);
        }
        return;
    }

    if looks_like_message(map) {
        if let Ok(message) = serde_json::from_value::<Message>(Value::Object(map.clone())) {
            let key = (message.chat.id, message.message_id);
            batch.messages.entry(key).or_insert(message);
        }
        return;
    }

    if looks_like_chat(map) {
        if let Ok(chat) = serde_json::from_value::<Chat>(Value::Object(map.clone())) {
            batch.chats.entry(chat.id).or_insert(chat);
        }
        return;
    }

    if let Some(sighting) = recognize_file(map, context_key) {
        batch
            .files
            .entry(sighting.file_unique_id.clone())
            .or_insert(sighting);
    }
}

fn looks_like_user(map: &Map<String, Value>) -> bool {
    map.get("id").is_some_and(Value::is_i64)
        && map.get("is_bot").is_some_and(Value::is_boolean)
        && map.get("first_name").is_some_and(Value::is_string)
}

fn looks_like_chat(map: &Map<String, Value>) -> bool {
    map.get("id").is_some_and(Value::is_i64)
        && map
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|s| crate::payload::ChatKind::parse(s).is_some())
}

fn looks_like_message(map: &Map<String, Value>) -> bool {
    map.get("message_id").is_some_and(Value::is_i64)
        && map.get("chat").is_some_and(Value::is_object)
        && map.get("date").is_some_and(Value::is_number)
}

fn recognize_file(map: &Map<String, Value>, context_key: Option<&str>) -> Option<FileSighting> {
    let file_unique_id = map.get("file_unique_id")?.as_str()?;
    let file_id = map.get("file_id")?.as_str()?;
    let kind = FileKind::from_context_key(context_key?)?;

    Some(FileSighting {
        file_unique_id: file_unique_id.to_string(),
        file_id: file_id.to_string(),
        kind,
        file_size: map.get("file_size").and_then(Value::as_i64),
        mime_type: map
            .get("mime_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        raw: map.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_update() -> Value {
        json!({
            "update_id": 100,
            "message": {
                "message_id": 7,
                "chat": {"id": -100200, "type": "supergroup", "title": "den"},
                "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
                "date": 1700000000,
                "reply_to_message": {
                    "message_id": 3,
                    "chat": {"id": -100200, "type": "supergroup", "title": "den"},
                    "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
                    "date": 1699990000,
                    "text": "earlier",
                },
                "photo": [
                    {"file_id": "small", "file_unique_id": "uniq-a", "file_size": 120, "width": 90, "height": 90},
                    {"file_id": "large", "file_unique_id": "uniq-b", "file_size": 900, "width": 720, "height": 720},
                ],
                "caption": "a photo",
            },
        })
    }

    #[test]
    fn collects_all_four_kinds() {
        let batch = collect_entities(&sample_update());
        assert_eq!(batch.users.len(), 1);
        assert_eq!(batch.chats.len(), 1);
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.files.len(), 2);
        assert!(batch.messages.contains_key(&(-100200, 7)));
        assert!(batch.messages.contains_key(&(-100200, 3)));
        assert_eq!(batch.files["uniq-a"].kind, FileKind::Photo);
        assert_eq!(batch.files["uniq-b"].file_id, "large");
    }

    #[test]
    fn extraction_is_deterministic() {
        let payload = sample_update();
        let a = collect_entities(&payload);
        let b = collect_entities(&payload);
        assert_eq!(
            a.users.keys().collect::<Vec<_>>(),
            b.users.keys().collect::<Vec<_>>()
        );
        assert_eq!(
            a.messages.keys().collect::<Vec<_>>(),
            b.messages.keys().collect::<Vec<_>>()
        );
        assert_eq!(
            a.files.keys().collect::<Vec<_>>(),
            b.files.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn first_occurrence_wins_on_duplicate_keys() {
        let payload = json!([
            {"id": 9, "is_bot": false, "first_name": "First"},
            {"id": 9, "is_bot": false, "first_name": "Second"},
        ]);
        let batch = collect_entities(&payload);
        assert_eq!(batch.users.len(), 1);
        assert_eq!(batch.users[&9].first_name, "First");
    }

    #[test]
    fn list_of_updates_is_walked() {
        let payload = json!([sample_update(), {
            "update_id": 101,
            "message": {
                "message_id": 8,
                "chat": {"id": 555, "type": "private", "first_name": "Bo"},
                "from": {"id": 77, "is_bot": false, "first_name": "Bo"},
                "date": 1700000100,
                "text": "hello",
            },
        }]);
        let batch = collect_entities(&payload);
        assert_eq!(batch.users.len(), 2);
        assert_eq!(batch.chats.len(), 2);
        assert_eq!(batch.messages.len(), 3);
    }

    #[test]
    fn file_like_object_under_unknown_key_is_ignored() {
        let payload = json!({
            "result": {
                "file_id": "abc",
                "file_unique_id": "uniq-x",
                "file_path": "documents/file.bin",
            },
        });
        let batch = collect_entities(&payload);
        assert!(batch.files.is_empty());
    }

    #[test]
    fn voice_and_document_kinds_inferred_from_keys() {
        let payload = json!({
            "message_id": 1,
            "chat": {"id": 5, "type": "private"},
            "date": 1700000000,
            "voice": {"file_id": "v", "file_unique_id": "uniq-v", "duration": 3,
                      "mime_type": "audio/ogg"},
            "document": {"file_id": "d", "file_unique_id": "uniq-d",
                         "thumbnail": {"file_id": "t", "file_unique_id": "uniq-t", "width": 4, "height": 4}},
        });
        let batch = collect_entities(&payload);
        assert_eq!(batch.files["uniq-v"].kind, FileKind::Voice);
        assert_eq!(batch.files["uniq-v"].mime_type.as_deref(), Some("audio/ogg"));
        assert_eq!(batch.files["uniq-d"].kind, FileKind::Document);
        assert_eq!(batch.files["uniq-t"].kind, FileKind::Photo);
    }

    #[test]
    fn chat_avatar_shape_is_not_a_generic_file() {
        // ChatPhoto uses small_/big_-prefixed field names; the generic
        // detection must not pick it up.
        let payload = json!({
            "id": 5,
            "type": "private",
            "photo": {
                "small_file_id": "s", "small_file_unique_id": "su",
                "big_file_id": "b", "big_file_unique_id": "bu",
            },
        });
        let batch = collect_entities(&payload);
        assert!(batch.files.is_empty());
        assert_eq!(batch.chats.len(), 1);
    }
}
