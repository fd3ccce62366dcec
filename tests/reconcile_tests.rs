//! Integration tests for the extract → resolve → reconcile path:
//!
//! - a sighting creates each entity row exactly once, however often it recurs
//! - an already-known entity seen by a new bot gains only an association row
//! - a fresh sighting of a known key never mutates the stored row
//! - chat avatars merge into the file batch with the same insert-if-missing
//!   pattern
//! - one unit of work is atomic: an uncommitted transaction leaves nothing

use serde_json::{json, Value};

use botmirror::payload::User;
use botmirror::reconcile::record_payload;
use botmirror::storage::{upsert_user_profile, BotRow, Storage};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_storage() -> Storage {
    Storage::open_in_memory().unwrap()
}

fn seed_bot(storage: &Storage, bot_id: i64) {
    let me: User = serde_json::from_value(json!({
        "id": bot_id, "is_bot": true, "first_name": "mirror",
    }))
    .unwrap();
    upsert_user_profile(storage.conn(), &me).unwrap();
    storage
        .insert_bot(&BotRow {
            id: bot_id,
            token: vec![0; 8],
            can_join_groups: false,
            can_read_all_group_messages: false,
            supports_inline_queries: false,
            can_connect_to_business: false,
            has_main_web_app: false,
            created_at: 1_700_000_000,
        })
        .unwrap();
}

fn photo_update(update_id: i64) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": 7,
            "chat": {"id": -100200, "type": "supergroup", "title": "den"},
            "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
            "date": 1_700_000_000,
            "caption": "a photo",
            "photo": [
                {"file_id": "small", "file_unique_id": "uniq-a", "file_size": 120,
                 "width": 90, "height": 90},
                {"file_id": "large", "file_unique_id": "uniq-b", "file_size": 900,
                 "width": 720, "height": 720},
            ],
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn first_sighting_inserts_everything() {
    let storage = test_storage();
    seed_bot(&storage, 900);

    let outcome = record_payload(storage.conn(), &photo_update(1), 900, 100).unwrap();
    assert_eq!(outcome.new_users, vec![42]);
    assert_eq!(outcome.new_chats, vec![-100200]);
    assert_eq!(outcome.new_messages, vec![(-100200, 7)]);
    assert_eq!(outcome.new_bot_messages, vec![(-100200, 7)]);
    assert_eq!(outcome.new_files.len(), 2);
    assert_eq!(outcome.new_bot_files.len(), 2);

    let message = storage.get_message(-100200, 7).unwrap().unwrap();
    assert_eq!(message.caption.as_deref(), Some("a photo"));
    assert!(storage.bot_message_associated(900, -100200, 7).unwrap());
    assert_eq!(
        storage.bot_file_association(900, "uniq-b").unwrap().as_deref(),
        Some("large")
    );
}

#[test]
fn second_sighting_is_idempotent() {
    let storage = test_storage();
    seed_bot(&storage, 900);

    record_payload(storage.conn(), &photo_update(1), 900, 100).unwrap();
    let outcome = record_payload(storage.conn(), &photo_update(2), 900, 200).unwrap();
    assert!(!outcome.wrote_anything());

    // Exactly one association row: re-associating would violate the
    // primary key, and the outcome above shows no second insert happened.
    assert!(storage.bot_message_associated(900, -100200, 7).unwrap());
}

#[test]
fn known_entity_new_bot_gains_association_only() {
    let storage = test_storage();
    seed_bot(&storage, 900);
    seed_bot(&storage, 901);

    record_payload(storage.conn(), &photo_update(1), 900, 100).unwrap();
    let outcome = record_payload(storage.conn(), &photo_update(1), 901, 200).unwrap();

    assert!(outcome.new_users.is_empty());
    assert!(outcome.new_chats.is_empty());
    assert!(outcome.new_messages.is_empty());
    assert!(outcome.new_files.is_empty());
    assert_eq!(outcome.new_bot_messages, vec![(-100200, 7)]);
    assert_eq!(outcome.new_bot_files.len(), 2);

    assert!(storage.bot_message_associated(900, -100200, 7).unwrap());
    assert!(storage.bot_message_associated(901, -100200, 7).unwrap());
}

#[test]
fn fresh_sighting_never_mutates_existing_rows() {
    let storage = test_storage();
    seed_bot(&storage, 900);
    record_payload(storage.conn(), &photo_update(1), 900, 100).unwrap();

    // Same composite key, different content: the reconciler must leave the
    // stored row alone. Content changes go through the explicit edit path.
    let conflicting = json!({
        "update_id": 3,
        "message": {
            "message_id": 7,
            "chat": {"id": -100200, "type": "supergroup", "title": "den"},
            "date": 1_700_000_500,
            "text": "completely different",
        },
    });
    record_payload(storage.conn(), &conflicting, 900, 300).unwrap();

    let message = storage.get_message(-100200, 7).unwrap().unwrap();
    assert_eq!(message.caption.as_deref(), Some("a photo"));
    assert!(message.text.is_none());
    assert_eq!(message.date, 1_700_000_000);
}

#[test]
fn user_resighted_with_new_name_keeps_original_row() {
    let storage = test_storage();
    seed_bot(&storage, 900);

    record_payload(
        storage.conn(),
        &json!({"id": 42, "is_bot": false, "first_name": "Ada"}),
        900,
        100,
    )
    .unwrap();
    record_payload(
        storage.conn(),
        &json!({"id": 42, "is_bot": false, "first_name": "Renamed"}),
        900,
        200,
    )
    .unwrap();

    let user = storage.get_user(42).unwrap().unwrap();
    assert_eq!(user.first_name, "Ada");
}

#[test]
fn chat_avatar_files_merge_into_batch() {
    let storage = test_storage();
    seed_bot(&storage, 900);

    let payload = json!({
        "id": -500,
        "type": "channel",
        "title": "news",
        "photo": {
            "small_file_id": "s-fetch", "small_file_unique_id": "s-uniq",
            "big_file_id": "b-fetch", "big_file_unique_id": "b-uniq",
        },
    });
    let outcome = record_payload(storage.conn(), &payload, 900, 100).unwrap();
    assert_eq!(outcome.new_chats, vec![-500]);
    assert_eq!(outcome.new_files.len(), 2);

    let small = storage.get_file("s-uniq").unwrap().unwrap();
    assert_eq!(small.kind, botmirror::payload::FileKind::ChatPhoto);
    assert_eq!(
        storage.bot_file_association(900, "s-uniq").unwrap().as_deref(),
        Some("s-fetch")
    );

    // Second sighting of the same avatar inserts nothing new.
    let outcome = record_payload(storage.conn(), &payload, 900, 200).unwrap();
    assert!(!outcome.wrote_anything());
}

#[test]
fn uncommitted_transaction_leaves_no_rows() {
    let mut storage = test_storage();
    seed_bot(&storage, 900);

    {
        let tx = storage.transaction().unwrap();
        record_payload(&tx, &photo_update(1), 900, 100).unwrap();
        // Dropped without commit: simulates a caller aborting mid-pipeline.
    }

    assert!(storage.get_message(-100200, 7).unwrap().is_none());
    assert!(storage.get_user(42).unwrap().is_none());
    assert!(storage.get_file("uniq-a").unwrap().is_none());
}

#[test]
fn committed_transaction_persists_all_kinds_together() {
    let mut storage = test_storage();
    seed_bot(&storage, 900);

    {
        let tx = storage.transaction().unwrap();
        record_payload(&tx, &photo_update(1), 900, 100).unwrap();
        tx.commit().unwrap();
    }

    assert!(storage.get_message(-100200, 7).unwrap().is_some());
    assert!(storage.get_user(42).unwrap().is_some());
    assert!(storage.get_chat(-100200).unwrap().is_some());
    assert!(storage.get_file("uniq-a").unwrap().is_some());
}
