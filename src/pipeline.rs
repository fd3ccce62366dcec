//! Delivery pipeline: the two ingestion entry points.
//!
//! Inbound webhook updates and outbound proxied responses both end up here.
//! Each call is one unit of work on one transaction; synchronization is a
//! side effect of the proxied traffic, so no error escaping this module may
//! ever fail the primary response. The [`run_webhook_sync`] and
//! [`run_response_sync`] wrappers own that boundary: they open the
//! transaction, commit on success, and reduce every failure to a log line —
//! treating a lost duplicate-insert race as success, since the entity is
//! known either way.

use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::payload::{ChatFullInfo, Update, User};
use crate::reconcile::{record_payload, refresh_chat_full_info};
use crate::storage::{update_message_content, upsert_user_profile, Storage, StorageError};
use crate::synthesize::{synthesize_copies, CopyMode};
use crate::upstream::ChatInfoFetcher;

// ---------------------------------------------------------------------------
// Method classification
// ---------------------------------------------------------------------------

/// Handling strategy for one Bot API method's decoded result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// `getUpdates`: a list of updates, with edited-message follow-up.
    UpdateList,
    /// `sendMediaGroup`: a list of messages.
    MessageList,
    /// `copyMessage`: one synthesized clone with caption overrides.
    CopySingle,
    /// `copyMessages`: a batch of synthesized clones.
    CopyBatch,
    /// `forwardMessages`: a batch of synthesized clones, captions kept.
    ForwardBatch,
    /// A full chat snapshot for the profile refresher.
    ChatFullInfo,
    /// The bot's own identity snapshot.
    SelfProfile,
    /// Returns a single message to extract.
    Message,
    /// Returns a single edited message for the in-place content update.
    EditedMessage,
    /// Nothing to synchronize.
    Ignored,
}

/// Map a Bot API method name to its handling strategy.
pub fn classify_method(method: &str) -> MethodKind {
    match method {
        "getUpdates" => MethodKind::UpdateList,
        "sendMediaGroup" => MethodKind::MessageList,
        "copyMessage" => MethodKind::CopySingle,
        "copyMessages" => MethodKind::CopyBatch,
        "forwardMessages" => MethodKind::ForwardBatch,
        "getChat" | "getChatFullInfo" => MethodKind::ChatFullInfo,
        "getMe" => MethodKind::SelfProfile,
        "sendMessage" | "forwardMessage" | "sendPhoto" | "sendAudio" | "sendDocument"
        | "sendVideo" | "sendAnimation" | "sendVoice" | "sendVideoNote" | "sendPaidMedia"
        | "sendLocation" | "sendVenue" | "sendContact" | "sendPoll" | "sendChecklist"
        | "sendDice" | "sendSticker" | "sendInvoice" | "sendGame" => MethodKind::Message,
        "editMessageText" | "editMessageCaption" | "editMessageMedia"
        | "editMessageLiveLocation" | "stopMessageLiveLocation" | "editMessageChecklist"
        | "editMessageReplyMarkup" | "setGameScore" => MethodKind::EditedMessage,
        _ => MethodKind::Ignored,
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Record one inbound webhook update: extract and reconcile everything in
/// it, then apply the in-place edit when the update carries an edited
/// message that was already known. A message first seen by this very event
/// skips the edit-apply step; its insert already holds the latest content.
pub fn ingest_webhook_update(
    conn: &Connection,
    body: &Value,
    bot_id: i64,
    now: i64,
) -> Result<(), StorageError> {
    let update: Option<Update> = serde_json::from_value(body.clone()).ok();

    let outcome = record_payload(conn, body, bot_id, now)?;
    if outcome.wrote_anything() {
        crate::mlog!(
            "webhook: {} recorded {}u/{}c/{}m/{}f new",
            crate::logging::bot_tag(bot_id),
            outcome.new_users.len(),
            outcome.new_chats.len(),
            outcome.new_messages.len(),
            outcome.new_files.len()
        );
    }

    if let Some(edited) = update.as_ref().and_then(Update::edited) {
        let key = (edited.chat.id, edited.message_id);
        if !outcome.new_messages.contains(&key) {
            update_message_content(conn, edited)?;
        }
    }
    Ok(())
}

/// Record one proxied method response, dispatched by method name.
#[allow(clippy::too_many_arguments)]
pub fn ingest_api_response(
    conn: &Connection,
    req: &Map<String, Value>,
    result: &Value,
    method: &str,
    bot_id: i64,
    token: &str,
    fetcher: &dyn ChatInfoFetcher,
    now: i64,
) -> Result<(), StorageError> {
    // Many methods return plain `true`; there is nothing to record.
    if result.is_boolean() || result.is_null() {
        return Ok(());
    }

    match classify_method(method) {
        MethodKind::UpdateList => {
            let updates: Vec<Update> = match serde_json::from_value(result.clone()) {
                Ok(updates) => updates,
                Err(e) => {
                    crate::mlog!("proxy: getUpdates result did not decode: {e}");
                    return Ok(());
                }
            };
            let outcome = record_payload(conn, result, bot_id, now)?;
            for update in &updates {
                if let Some(edited) = update.edited() {
                    let key = (edited.chat.id, edited.message_id);
                    if !outcome.new_messages.contains(&key) {
                        update_message_content(conn, edited)?;
                    }
                }
            }
        }
        MethodKind::MessageList | MethodKind::Message => {
            record_payload(conn, result, bot_id, now)?;
        }
        MethodKind::EditedMessage => {
            let message: crate::payload::Message = match serde_json::from_value(result.clone()) {
                Ok(message) => message,
                Err(e) => {
                    crate::mlog!(
                        "proxy: {} result did not decode: {e}",
                        crate::logging::method_tag(method)
                    );
                    return Ok(());
                }
            };
            let outcome = record_payload(conn, result, bot_id, now)?;
            let key = (message.chat.id, message.message_id);
            if !outcome.new_messages.contains(&key) {
                update_message_content(conn, &message)?;
            }
        }
        MethodKind::ChatFullInfo => {
            let info: ChatFullInfo = match serde_json::from_value(result.clone()) {
                Ok(info) => info,
                Err(e) => {
                    crate::mlog!("proxy: chat info result did not decode: {e}");
                    return Ok(());
                }
            };
            refresh_chat_full_info(conn, &info, bot_id, now)?;
        }
        MethodKind::SelfProfile => {
            let me: User = match serde_json::from_value(result.clone()) {
                Ok(me) => me,
                Err(e) => {
                    crate::mlog!("proxy: getMe result did not decode: {e}");
                    return Ok(());
                }
            };
            upsert_user_profile(conn, &me)?;
        }
        MethodKind::CopySingle => {
            synthesize_copies(
                conn,
                req,
                result,
                CopyMode::Single,
                bot_id,
                token,
                fetcher,
                now,
            )?;
        }
        MethodKind::CopyBatch => {
            synthesize_copies(
                conn,
                req,
                result,
                CopyMode::Batch,
                bot_id,
                token,
                fetcher,
                now,
            )?;
        }
        MethodKind::ForwardBatch => {
            synthesize_copies(
                conn,
                req,
                result,
                CopyMode::Forward,
                bot_id,
                token,
                fetcher,
                now,
            )?;
        }
        MethodKind::Ignored => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transaction boundary
// ---------------------------------------------------------------------------

/// Synchronize a webhook body inside one transaction, swallowing every
/// failure. The webhook acknowledgment must not depend on this.
pub fn run_webhook_sync(storage: &mut Storage, body: &Value, bot_id: i64, now: i64) {
    let result = (|| -> Result<(), StorageError> {
        let tx = storage.transaction()?;
        ingest_webhook_update(&tx, body, bot_id, now)?;
        tx.commit()?;
        Ok(())
    })();

    if let Err(e) = result {
        if e.is_unique_violation() {
            // A concurrent sighting inserted the same key first; the entity
            // is known either way.
            crate::mlog!(
                "webhook: {} lost an insert race, already recorded",
                crate::logging::bot_tag(bot_id)
            );
        } else {
            crate::mlog!("webhook: {} sync failed: {e}", crate::logging::bot_tag(bot_id));
        }
    }
}

/// Synchronize a proxied response inside one transaction, swallowing every
/// failure. The proxied response has already been produced and must be
/// relayed unchanged.
#[allow(clippy::too_many_arguments)]
pub fn run_response_sync(
    storage: &mut Storage,
    req: &Map<String, Value>,
    result: &Value,
    method: &str,
    bot_id: i64,
    token: &str,
    fetcher: &dyn ChatInfoFetcher,
    now: i64,
) {
    let outcome = (|| -> Result<(), StorageError> {
        let tx = storage.transaction()?;
        ingest_api_response(&tx, req, result, method, bot_id, token, fetcher, now)?;
        tx.commit()?;
        Ok(())
    })();

    if let Err(e) = outcome {
        if e.is_unique_violation() {
            crate::mlog!(
                "proxy: {} {} lost an insert race, already recorded",
                crate::logging::bot_tag(bot_id),
                crate::logging::method_tag(method)
            );
        } else {
            crate::mlog!(
                "proxy: {} {} sync failed: {e}",
                crate::logging::bot_tag(bot_id),
                crate::logging::method_tag(method)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_named_methods() {
        assert_eq!(classify_method("getUpdates"), MethodKind::UpdateList);
        assert_eq!(classify_method("sendMediaGroup"), MethodKind::MessageList);
        assert_eq!(classify_method("copyMessage"), MethodKind::CopySingle);
        assert_eq!(classify_method("copyMessages"), MethodKind::CopyBatch);
        assert_eq!(classify_method("forwardMessages"), MethodKind::ForwardBatch);
        assert_eq!(classify_method("getChat"), MethodKind::ChatFullInfo);
        assert_eq!(classify_method("getChatFullInfo"), MethodKind::ChatFullInfo);
        assert_eq!(classify_method("getMe"), MethodKind::SelfProfile);
        assert_eq!(classify_method("setWebhook"), MethodKind::Ignored);
        assert_eq!(classify_method("answerCallbackQuery"), MethodKind::Ignored);
    }

    #[test]
    fn single_message_methods_route_to_extraction() {
        for method in [
            "sendMessage",
            "forwardMessage",
            "sendPhoto",
            "sendAudio",
            "sendDocument",
            "sendVideo",
            "sendAnimation",
            "sendVoice",
            "sendVideoNote",
            "sendPaidMedia",
            "sendLocation",
            "sendVenue",
            "sendContact",
            "sendPoll",
            "sendChecklist",
            "sendDice",
            "sendSticker",
            "sendInvoice",
            "sendGame",
        ] {
            assert_eq!(classify_method(method), MethodKind::Message, "{method}");
        }
    }

    #[test]
    fn edited_message_methods_route_to_update() {
        for method in [
            "editMessageText",
            "editMessageCaption",
            "editMessageMedia",
            "editMessageLiveLocation",
            "stopMessageLiveLocation",
            "editMessageChecklist",
            "editMessageReplyMarkup",
            "setGameScore",
        ] {
            assert_eq!(
                classify_method(method),
                MethodKind::EditedMessage,
                "{method}"
            );
        }
    }

    #[test]
    fn message_and_edited_sets_are_disjoint() {
        // The dispatch table relies on a method never being in both sets.
        let all = [
            "sendMessage",
            "editMessageText",
            "forwardMessage",
            "setGameScore",
        ];
        for method in all {
            let kind = classify_method(method);
            assert!(kind == MethodKind::Message || kind == MethodKind::EditedMessage);
        }
    }
}
