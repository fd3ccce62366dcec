//! Reconciliation of extracted entities against the catalog.
//!
//! One call = one payload = one existence round trip plus ordered bulk
//! inserts, all on the caller's transaction. Entities already known are left
//! untouched; authoritative overwrites go through the profile refresher
//! instead. Users and chats are inserted before messages because messages
//! reference them by foreign key; association rows follow their entities.

use rusqlite::Connection;
use serde_json::Value;

use crate::extract::{collect_entities, EntityBatch};
use crate::payload::{Chat, ChatFullInfo, ChatPhoto, Message, User};
use crate::storage::{
    bulk_insert_bot_files, bulk_insert_bot_messages, bulk_insert_chats, bulk_insert_files,
    bulk_insert_messages, bulk_insert_users, check_entities, check_files, upsert_basic_chat,
    upsert_chat_full_info, CheckKind, FileRow, StorageError,
};

/// Keys newly written by one reconciliation pass. Empty vectors mean the
/// payload only contained already-known entities.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub new_users: Vec<i64>,
    pub new_chats: Vec<i64>,
    pub new_messages: Vec<(i64, i64)>,
    pub new_bot_messages: Vec<(i64, i64)>,
    pub new_files: Vec<String>,
    pub new_bot_files: Vec<String>,
}

impl ReconcileOutcome {
    pub fn wrote_anything(&self) -> bool {
        !self.new_users.is_empty()
            || !self.new_chats.is_empty()
            || !self.new_messages.is_empty()
            || !self.new_bot_messages.is_empty()
            || !self.new_files.is_empty()
            || !self.new_bot_files.is_empty()
    }
}

/// Extract every entity from `payload` and reconcile them for `bot_id`.
pub fn record_payload(
    conn: &Connection,
    payload: &Value,
    bot_id: i64,
    now: i64,
) -> Result<ReconcileOutcome, StorageError> {
    let batch = collect_entities(payload);
    record_batch(conn, &batch, bot_id, now)
}

/// Reconcile an already-extracted batch for `bot_id`.
pub fn record_batch(
    conn: &Connection,
    batch: &EntityBatch,
    bot_id: i64,
    now: i64,
) -> Result<ReconcileOutcome, StorageError> {
    if batch.is_empty() {
        return Ok(ReconcileOutcome::default());
    }

    let chat_ids: Vec<i64> = batch.chats.keys().copied().collect();
    let user_ids: Vec<i64> = batch.users.keys().copied().collect();
    let message_keys: Vec<(i64, i64)> = batch.messages.keys().copied().collect();
    let file_ids: Vec<&str> = batch.files.keys().map(String::as_str).collect();

    let report = check_entities(conn, bot_id, &chat_ids, &user_ids, &message_keys, &file_ids)?;

    let mut new_users: Vec<&User> = Vec::new();
    let mut new_chats: Vec<&Chat> = Vec::new();
    let mut new_messages: Vec<&Message> = Vec::new();
    let mut new_bot_messages: Vec<(i64, i64)> = Vec::new();
    let mut new_files: Vec<FileRow> = Vec::new();
    let mut new_bot_files: Vec<(String, String)> = Vec::new();

    for check in &report {
        match check.kind {
            CheckKind::User => {
                if let Some(user_id) = check.user_id {
                    if !check.exists {
                        if let Some(user) = batch.users.get(&user_id) {
                            new_users.push(user);
                        }
                    }
                }
            }
            CheckKind::Chat => {
                if let Some(chat_id) = check.chat_id {
                    if !check.exists {
                        if let Some(chat) = batch.chats.get(&chat_id) {
                            new_chats.push(chat);
                        }
                    }
                }
            }
            CheckKind::Message => {
                if let (Some(chat_id), Some(message_id)) = (check.chat_id, check.message_id) {
                    let key = (chat_id, message_id);
                    if let Some(message) = batch.messages.get(&key) {
                        if !check.exists {
                            new_messages.push(message);
                        }
                        if check.bot_relation != Some(true) {
                            new_bot_messages.push(key);
                        }
                    }
                }
            }
            CheckKind::File => {
                if let Some(file_unique_id) = &check.file_unique_id {
                    if let Some(sighting) = batch.files.get(file_unique_id) {
                        if !check.exists {
                            new_files.push(FileRow::from_sighting(sighting));
                        }
                        if check.bot_relation != Some(true) {
                            new_bot_files
                                .push((sighting.file_unique_id.clone(), sighting.file_id.clone()));
                        }
                    }
                }
            }
        }
    }

    // Avatars carried inside chat sightings become file rows too. They use
    // the same check + insert-only-if-missing pattern, scoped to each chat's
    // two avatar ids, and join the main file batch below.
    for chat in batch.chats.values() {
        if let Some(photo) = chat_avatar(chat) {
            merge_avatar_files(
                conn,
                &photo,
                bot_id,
                &mut new_files,
                &mut new_bot_files,
            )?;
        }
    }

    if !new_users.is_empty() {
        bulk_insert_users(conn, &new_users)?;
    }
    if !new_chats.is_empty() {
        bulk_insert_chats(conn, &new_chats)?;
    }
    if !new_messages.is_empty() {
        bulk_insert_messages(conn, &new_messages)?;
    }
    if !new_bot_messages.is_empty() {
        bulk_insert_bot_messages(conn, bot_id, &new_bot_messages, now)?;
    }
    if !new_files.is_empty() {
        bulk_insert_files(conn, &new_files, now)?;
    }
    if !new_bot_files.is_empty() {
        bulk_insert_bot_files(conn, bot_id, &new_bot_files, now)?;
    }

    Ok(ReconcileOutcome {
        new_users: new_users.iter().map(|u| u.id).collect(),
        new_chats: new_chats.iter().map(|c| c.id).collect(),
        new_messages: new_messages
            .iter()
            .map(|m| (m.chat.id, m.message_id))
            .collect(),
        new_bot_messages,
        new_files: new_files.iter().map(|f| f.file_unique_id.clone()).collect(),
        new_bot_files: new_bot_files.iter().map(|(id, _)| id.clone()).collect(),
    })
}

/// A chat sighting's avatar, when the payload carried one.
fn chat_avatar(chat: &Chat) -> Option<ChatPhoto> {
    let photo = chat.extra.get("photo")?;
    serde_json::from_value(photo.clone()).ok()
}

/// Check a chat avatar's two file ids and append the missing rows and
/// associations to the pending batches.
fn merge_avatar_files(
    conn: &Connection,
    photo: &ChatPhoto,
    bot_id: i64,
    new_files: &mut Vec<FileRow>,
    new_bot_files: &mut Vec<(String, String)>,
) -> Result<(), StorageError> {
    let report = check_files(
        conn,
        bot_id,
        &[
            photo.small_file_unique_id.as_str(),
            photo.big_file_unique_id.as_str(),
        ],
    )?;

    for (file_unique_id, exists, bot_relation) in report {
        let already_batched = new_files.iter().any(|f| f.file_unique_id == file_unique_id);
        if !exists && !already_batched {
            new_files.push(FileRow::avatar(&file_unique_id));
        }
        if !bot_relation && !new_bot_files.iter().any(|(id, _)| *id == file_unique_id) {
            let file_id = if file_unique_id == photo.small_file_unique_id {
                photo.small_file_id.clone()
            } else {
                photo.big_file_id.clone()
            };
            new_bot_files.push((file_unique_id, file_id));
        }
    }
    Ok(())
}

/// Insert a chat avatar's missing file rows and bot associations. Used by
/// the profile refresher outside a batch context.
pub fn insert_chat_avatar_if_missing(
    conn: &Connection,
    photo: &ChatPhoto,
    bot_id: i64,
    now: i64,
) -> Result<(), StorageError> {
    let mut new_files: Vec<FileRow> = Vec::new();
    let mut new_bot_files: Vec<(String, String)> = Vec::new();
    merge_avatar_files(conn, photo, bot_id, &mut new_files, &mut new_bot_files)?;

    if !new_files.is_empty() {
        bulk_insert_files(conn, &new_files, now)?;
    }
    if !new_bot_files.is_empty() {
        bulk_insert_bot_files(conn, bot_id, &new_bot_files, now)?;
    }
    Ok(())
}

/// Apply an authoritative full chat snapshot: referenced personal/parent
/// chats first, then avatar files, then the chat row itself so its file
/// references resolve.
pub fn refresh_chat_full_info(
    conn: &Connection,
    info: &ChatFullInfo,
    bot_id: i64,
    now: i64,
) -> Result<(), StorageError> {
    if let Some(personal) = &info.personal_chat {
        upsert_basic_chat(conn, personal)?;
    }
    if let Some(parent) = &info.parent_chat {
        upsert_basic_chat(conn, parent)?;
    }
    if let Some(photo) = &info.photo {
        insert_chat_avatar_if_missing(conn, photo, bot_id, now)?;
    }
    upsert_chat_full_info(conn, info)
}
