//! Typed object graph for decoded Bot API payloads.
//!
//! - Every entity struct promotes the columns the catalog stores and keeps
//!   all remaining fields in a serde-flattened `extra` map, so unknown or
//!   future upstream fields survive a decode/encode round trip.
//! - A message's kind is never sent by the platform; it is computed from
//!   which content attribute is present, in a fixed priority order.
//! - The exclusion lists below define exactly which fields are promoted out
//!   of each overflow map. An overflow map must never shadow a column.
//!
//! These types are intentionally small and self-contained so the extractor,
//! the storage layer, and the synthesizer can share them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Kind tags
// ---------------------------------------------------------------------------

/// Discriminated chat type as sent by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Supergroup => "supergroup",
            ChatKind::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(ChatKind::Private),
            "group" => Some(ChatKind::Group),
            "supergroup" => Some(ChatKind::Supergroup),
            "channel" => Some(ChatKind::Channel),
            _ => None,
        }
    }
}

/// Computed message kind. Never received directly from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Photo,
    Audio,
    Document,
    Video,
    Animation,
    Voice,
    VideoNote,
    PaidMedia,
    Location,
    Venue,
    Contact,
    Poll,
    Checklist,
    Dice,
    Sticker,
    Story,
    Invoice,
    Game,
    Giveaway,
    Passport,
    Service,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Photo => "photo",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
            MessageKind::Video => "video",
            MessageKind::Animation => "animation",
            MessageKind::Voice => "voice",
            MessageKind::VideoNote => "video_note",
            MessageKind::PaidMedia => "paid_media",
            MessageKind::Location => "location",
            MessageKind::Venue => "venue",
            MessageKind::Contact => "contact",
            MessageKind::Poll => "poll",
            MessageKind::Checklist => "checklist",
            MessageKind::Dice => "dice",
            MessageKind::Sticker => "sticker",
            MessageKind::Story => "story",
            MessageKind::Invoice => "invoice",
            MessageKind::Game => "game",
            MessageKind::Giveaway => "giveaway",
            MessageKind::Passport => "passport",
            MessageKind::Service => "service",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "photo" => Some(MessageKind::Photo),
            "audio" => Some(MessageKind::Audio),
            "document" => Some(MessageKind::Document),
            "video" => Some(MessageKind::Video),
            "animation" => Some(MessageKind::Animation),
            "voice" => Some(MessageKind::Voice),
            "video_note" => Some(MessageKind::VideoNote),
            "paid_media" => Some(MessageKind::PaidMedia),
            "location" => Some(MessageKind::Location),
            "venue" => Some(MessageKind::Venue),
            "contact" => Some(MessageKind::Contact),
            "poll" => Some(MessageKind::Poll),
            "checklist" => Some(MessageKind::Checklist),
            "dice" => Some(MessageKind::Dice),
            "sticker" => Some(MessageKind::Sticker),
            "story" => Some(MessageKind::Story),
            "invoice" => Some(MessageKind::Invoice),
            "game" => Some(MessageKind::Game),
            "giveaway" => Some(MessageKind::Giveaway),
            "passport" => Some(MessageKind::Passport),
            "service" => Some(MessageKind::Service),
            _ => None,
        }
    }
}

/// Discriminated file kind, inferred at extraction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    ChatPhoto,
    Photo,
    Animation,
    Audio,
    Document,
    Video,
    VideoNote,
    Voice,
    Sticker,
    Passport,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::ChatPhoto => "chat_photo",
            FileKind::Photo => "photo",
            FileKind::Animation => "animation",
            FileKind::Audio => "audio",
            FileKind::Document => "document",
            FileKind::Video => "video",
            FileKind::VideoNote => "video_note",
            FileKind::Voice => "voice",
            FileKind::Sticker => "sticker",
            FileKind::Passport => "passport",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat_photo" => Some(FileKind::ChatPhoto),
            "photo" => Some(FileKind::Photo),
            "animation" => Some(FileKind::Animation),
            "audio" => Some(FileKind::Audio),
            "document" => Some(FileKind::Document),
            "video" => Some(FileKind::Video),
            "video_note" => Some(FileKind::VideoNote),
            "voice" => Some(FileKind::Voice),
            "sticker" => Some(FileKind::Sticker),
            "passport" => Some(FileKind::Passport),
            _ => None,
        }
    }

    /// Infer the file kind from the attribute key the object was found under.
    ///
    /// The upstream decoder picks a concrete shape for a file object based on
    /// the field that carries it, so the carrying key is the shape tag.
    /// Objects under any other key are not files.
    pub fn from_context_key(key: &str) -> Option<Self> {
        match key {
            "photo" | "thumbnail" | "new_chat_photo" => Some(FileKind::Photo),
            "animation" => Some(FileKind::Animation),
            "audio" => Some(FileKind::Audio),
            "document" => Some(FileKind::Document),
            "video" => Some(FileKind::Video),
            "video_note" => Some(FileKind::VideoNote),
            "voice" => Some(FileKind::Voice),
            "sticker" => Some(FileKind::Sticker),
            "front_side" | "reverse_side" | "selfie" | "files" | "translation" => {
                Some(FileKind::Passport)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity objects
// ---------------------------------------------------------------------------

/// A platform user as it appears inside payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_premium: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A chat as it appears inside payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_forum: bool,
    #[serde(default)]
    pub is_direct_messages: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The avatar of a chat. Field names differ from ordinary file objects, so
/// the generic file detection never matches it; the reconciler and the
/// profile refresher handle it explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPhoto {
    pub small_file_id: String,
    pub small_file_unique_id: String,
    pub big_file_id: String,
    pub big_file_unique_id: String,
}

/// An authoritative full chat snapshot (`getChat` result).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFullInfo {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_forum: bool,
    #[serde(default)]
    pub is_direct_messages: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<ChatPhoto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_chat: Option<Chat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chat: Option<Chat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_message: Option<Box<Message>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A message as it appears inside payloads.
///
/// Timestamps are UNIX epoch seconds, exactly as the platform sends them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_chat: Option<Chat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_boost_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_business_bot: Option<User>,
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_connection_id: Option<String>,
    #[serde(default)]
    pub is_topic_message: bool,
    #[serde(default)]
    pub is_automatic_forward: bool,
    #[serde(default)]
    pub has_media_spoiler: bool,
    #[serde(default)]
    pub has_protected_content: bool,
    #[serde(default)]
    pub is_from_offline: bool,
    #[serde(default)]
    pub is_paid_post: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_star_count: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One inbound update, as delivered to a webhook or returned by `getUpdates`.
///
/// Only the message-bearing variants are promoted; every other update kind
/// (callback queries, reactions, inline queries, ...) stays in `extra` and is
/// still walked by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_message: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_post: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_channel_post: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_message: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_business_message: Option<Box<Message>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Update {
    /// The edited message carried by this update, if any.
    pub fn edited(&self) -> Option<&Message> {
        self.edited_message
            .as_deref()
            .or(self.edited_channel_post.as_deref())
            .or(self.edited_business_message.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Kind classification
// ---------------------------------------------------------------------------

/// Content attributes checked in order to classify a message. The first
/// present attribute wins; a message with none of them is a service message.
const MESSAGE_KIND_ATTRIBUTES: &[(&str, MessageKind)] = &[
    ("text", MessageKind::Text),
    ("animation", MessageKind::Animation),
    ("audio", MessageKind::Audio),
    ("document", MessageKind::Document),
    ("paid_media", MessageKind::PaidMedia),
    ("photo", MessageKind::Photo),
    ("sticker", MessageKind::Sticker),
    ("story", MessageKind::Story),
    ("video", MessageKind::Video),
    ("video_note", MessageKind::VideoNote),
    ("voice", MessageKind::Voice),
    ("checklist", MessageKind::Checklist),
    ("contact", MessageKind::Contact),
    ("dice", MessageKind::Dice),
    ("game", MessageKind::Game),
    ("poll", MessageKind::Poll),
    ("venue", MessageKind::Venue),
    ("location", MessageKind::Location),
    ("invoice", MessageKind::Invoice),
    ("giveaway", MessageKind::Giveaway),
    ("passport_data", MessageKind::Passport),
];

/// Compute the kind tag for a message.
pub fn classify_message(message: &Message) -> MessageKind {
    for (attr, kind) in MESSAGE_KIND_ATTRIBUTES {
        let present = match *attr {
            "text" => message.text.is_some(),
            key => message.extra.get(key).is_some_and(|v| !v.is_null()),
        };
        if present {
            return *kind;
        }
    }
    MessageKind::Service
}

// ---------------------------------------------------------------------------
// Overflow exclusion lists
// ---------------------------------------------------------------------------

/// Message fields that never enter the overflow map: either promoted to
/// columns, or service flags that are only kept when set.
const MESSAGE_EXCLUDED_FIELDS: &[&str] = &[
    "message_id",
    "chat",
    "message_thread_id",
    "text",
    "caption",
    "from",
    "sender_chat",
    "sender_boost_count",
    "sender_business_bot",
    "date",
    "edit_date",
    "business_connection_id",
    "is_topic_message",
    "is_automatic_forward",
    "has_media_spoiler",
    "has_protected_content",
    "is_from_offline",
    "is_paid_post",
    "author_signature",
    "paid_star_count",
    "delete_chat_photo",
    "group_chat_created",
    "supergroup_chat_created",
    "channel_chat_created",
];

/// Service-event flags that are dropped when false but kept when the event
/// actually happened.
const MESSAGE_CONDITIONAL_FLAGS: &[&str] = &[
    "delete_chat_photo",
    "group_chat_created",
    "supergroup_chat_created",
    "channel_chat_created",
];

/// Fields stripped recursively from message overflow at any nesting depth.
/// The bot-scoped file id is normalized into the association table instead.
pub const MESSAGE_NESTED_EXCLUDED_FIELDS: &[&str] = &["file_id"];

/// Chat fields promoted to columns and excluded from chat overflow.
pub const CHAT_EXCLUDED_FIELDS: &[&str] = &[
    "id",
    "type",
    "title",
    "username",
    "first_name",
    "last_name",
    "is_forum",
    "is_direct_messages",
    "personal_chat",
    "parent_chat",
    "pinned_message",
    "photo",
];

/// File fields promoted to columns (or normalized away) and excluded from
/// file overflow.
pub const FILE_EXCLUDED_FIELDS: &[&str] = &["file_unique_id", "file_id", "file_size", "mime_type"];

/// The exclusion set for one concrete message: the static list, minus any
/// conditional service flag that is set in this payload.
pub fn message_excluded_fields(message: &Message) -> Vec<&'static str> {
    MESSAGE_EXCLUDED_FIELDS
        .iter()
        .copied()
        .filter(|field| {
            if !MESSAGE_CONDITIONAL_FLAGS.contains(field) {
                return true;
            }
            // Keep the flag in overflow when the event happened.
            !message
                .extra
                .get(*field)
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Field stripping
// ---------------------------------------------------------------------------

/// Remove `exclude` keys from the top level of `data` and `exclude_nested`
/// keys at every depth. Returns `None` when nothing is left.
pub fn strip_fields(
    mut data: Map<String, Value>,
    exclude: &[&str],
    exclude_nested: &[&str],
) -> Option<Map<String, Value>> {
    for field in exclude {
        data.remove(*field);
    }

    if !exclude_nested.is_empty() {
        for value in data.values_mut() {
            strip_nested(value, exclude_nested);
        }
    }

    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

fn strip_nested(value: &mut Value, exclude: &[&str]) {
    match value {
        Value::Object(map) => {
            for field in exclude {
                map.remove(*field);
            }
            for nested in map.values_mut() {
                strip_nested(nested, exclude);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_nested(item, exclude);
            }
        }
        _ => {}
    }
}

/// Serialize a payload object to a JSON map. Non-object values (which the
/// types above never produce) collapse to an empty map.
pub fn to_json_map<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_from(value: Value) -> Message {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn classify_prefers_text() {
        let msg = message_from(json!({
            "message_id": 1,
            "chat": {"id": 7, "type": "private"},
            "date": 1700000000,
            "text": "hi",
        }));
        assert_eq!(classify_message(&msg), MessageKind::Text);
    }

    #[test]
    fn classify_media_from_overflow() {
        let msg = message_from(json!({
            "message_id": 2,
            "chat": {"id": 7, "type": "private"},
            "date": 1700000000,
            "caption": "look",
            "photo": [{"file_id": "f", "file_unique_id": "u", "width": 1, "height": 1}],
        }));
        assert_eq!(classify_message(&msg), MessageKind::Photo);
    }

    #[test]
    fn classify_service_when_no_content() {
        let msg = message_from(json!({
            "message_id": 3,
            "chat": {"id": 7, "type": "group"},
            "date": 1700000000,
            "new_chat_members": [{"id": 1, "is_bot": false, "first_name": "A"}],
        }));
        assert_eq!(classify_message(&msg), MessageKind::Service);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = json!({
            "message_id": 4,
            "chat": {"id": 7, "type": "private"},
            "date": 1700000000,
            "some_future_field": {"a": 1},
        });
        let msg = message_from(raw);
        assert_eq!(msg.extra.get("some_future_field"), Some(&json!({"a": 1})));
        let back = to_json_map(&msg);
        assert_eq!(back.get("some_future_field"), Some(&json!({"a": 1})));
    }

    #[test]
    fn strip_fields_removes_nested_file_ids() {
        let map = to_json_map(&json!({
            "photo": [
                {"file_id": "secret", "file_unique_id": "u1", "width": 10},
                {"file_id": "secret2", "file_unique_id": "u2", "width": 20},
            ],
            "date": 5,
        }));
        let stripped = strip_fields(map, &["date"], MESSAGE_NESTED_EXCLUDED_FIELDS).unwrap();
        let photos = stripped.get("photo").unwrap().as_array().unwrap();
        assert!(photos.iter().all(|p| p.get("file_id").is_none()));
        assert!(photos.iter().all(|p| p.get("file_unique_id").is_some()));
        assert!(stripped.get("date").is_none());
    }

    #[test]
    fn strip_fields_empty_becomes_none() {
        let map = to_json_map(&json!({"date": 5}));
        assert!(strip_fields(map, &["date"], &[]).is_none());
    }

    #[test]
    fn conditional_service_flags_kept_when_set() {
        let msg = message_from(json!({
            "message_id": 5,
            "chat": {"id": 7, "type": "group"},
            "date": 1700000000,
            "group_chat_created": true,
        }));
        let excluded = message_excluded_fields(&msg);
        assert!(!excluded.contains(&"group_chat_created"));
        assert!(excluded.contains(&"delete_chat_photo"));

        let overflow = strip_fields(
            to_json_map(&msg),
            &excluded,
            MESSAGE_NESTED_EXCLUDED_FIELDS,
        )
        .unwrap();
        assert_eq!(overflow.get("group_chat_created"), Some(&json!(true)));
    }

    #[test]
    fn update_edited_accessor() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 10,
            "edited_channel_post": {
                "message_id": 8,
                "chat": {"id": -100, "type": "channel"},
                "date": 1700000000,
                "text": "edited",
            },
        }))
        .unwrap();
        assert_eq!(update.edited().unwrap().message_id, 8);
    }

    #[test]
    fn file_kind_context_keys() {
        assert_eq!(FileKind::from_context_key("photo"), Some(FileKind::Photo));
        assert_eq!(
            FileKind::from_context_key("thumbnail"),
            Some(FileKind::Photo)
        );
        assert_eq!(
            FileKind::from_context_key("video_note"),
            Some(FileKind::VideoNote)
        );
        assert_eq!(
            FileKind::from_context_key("selfie"),
            Some(FileKind::Passport)
        );
        assert_eq!(FileKind::from_context_key("reply_markup"), None);
    }
}
