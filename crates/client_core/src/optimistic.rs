//! Provisional messages: fabricated locally, spliced into place once the backend
//! confirms them, removed when it refuses.

use chrono::{DateTime, Duration, Utc};
use shared::domain::{
    DeliveryStatus, MediaRef, Message, MessageId, MessageKind, ThreadKey, UserId,
};
use tracing::debug;

use crate::{
    cache::{CacheStore, ListKind, MessagePages},
    conversations::{refresh_preview_text, replace_preview_id, restore_preview, set_preview},
};

pub fn fabricate(
    thread: &ThreadKey,
    sender_id: &UserId,
    content: Option<String>,
    kind: MessageKind,
    media: Option<MediaRef>,
    now: DateTime<Utc>,
) -> Message {
    Message {
        id: MessageId::provisional(),
        thread: thread.clone(),
        sender_id: sender_id.clone(),
        content,
        kind,
        media,
        status: DeliveryStatus::Sending,
        is_edited: false,
        is_deleted: false,
        created_at: now,
        updated_at: now,
    }
}

/// First provisional entry, oldest first, that `incoming` confirms: same sender, same
/// content, timestamps no further apart than `window`.
pub fn find_match(pages: &MessagePages, incoming: &Message, window: Duration) -> Option<MessageId> {
    pages
        .iter()
        .rev()
        .find(|candidate| {
            candidate.is_provisional()
                && candidate.sender_id == incoming.sender_id
                && candidate.content == incoming.content
                && (candidate.created_at - incoming.created_at).abs() <= window
        })
        .map(|candidate| candidate.id.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceOutcome {
    Replaced,
    /// The durable message was already cached; the provisional copy was dropped.
    Collapsed,
    /// Neither copy is cached any more; the confirmation is stale.
    Stale,
}

/// Replaces a provisional entry with its durable counterpart at the same position,
/// keeping the provisional timestamps.
pub fn splice(pages: &mut MessagePages, provisional_id: &MessageId, durable: Message) -> SpliceOutcome {
    if pages.contains(&durable.id) {
        return match pages.remove(provisional_id) {
            Some(_) => SpliceOutcome::Collapsed,
            None => SpliceOutcome::Stale,
        };
    }

    let Some(entry) = pages.get_mut(provisional_id) else {
        return SpliceOutcome::Stale;
    };
    let created_at = entry.created_at;
    let updated_at = entry.updated_at;
    let status = DeliveryStatus::Sent.advanced_to(durable.status);
    *entry = Message {
        created_at,
        updated_at,
        status,
        ..durable
    };
    SpliceOutcome::Replaced
}

pub fn insert_provisional(cache: &CacheStore, message: &Message) {
    cache.update_messages(&message.thread, |pages| pages.insert_newest(message.clone()));
    cache.update_thread_list(ListKind::of(&message.thread), |list| {
        set_preview(list, message)
    });
    debug!(thread = %message.thread, message_id = %message.id, "optimistic: inserted provisional message");
}

/// Applies a successful durable write. Results for threads that are no longer cached
/// are ignored.
pub fn confirm(cache: &CacheStore, provisional_id: &MessageId, durable: Message) -> SpliceOutcome {
    let thread = durable.thread.clone();
    let durable_id = durable.id.clone();
    let outcome = cache
        .update_existing_messages(&thread, |pages| splice(pages, provisional_id, durable))
        .unwrap_or(SpliceOutcome::Stale);

    if outcome != SpliceOutcome::Stale {
        cache.update_thread_list(ListKind::of(&thread), |list| {
            replace_preview_id(list, &thread, provisional_id, &durable_id)
        });
    }
    debug!(thread = %thread, provisional_id = %provisional_id, message_id = %durable_id, ?outcome, "optimistic: confirmed send");
    outcome
}

/// Removes a provisional entry after its write failed and rolls the preview back.
pub fn reject(cache: &CacheStore, thread: &ThreadKey, provisional_id: &MessageId) -> bool {
    let Some((removed, fallback)) = cache.update_existing_messages(thread, |pages| {
        let removed = pages.remove(provisional_id).is_some();
        (removed, pages.newest().cloned())
    }) else {
        return false;
    };
    if removed {
        cache.update_thread_list(ListKind::of(thread), |list| {
            restore_preview(list, thread, provisional_id, fallback.as_ref())
        });
    }
    removed
}

/// Patches content in place and returns the message as it was before the edit.
pub fn apply_edit(
    cache: &CacheStore,
    thread: &ThreadKey,
    message_id: &MessageId,
    content: &str,
    now: DateTime<Utc>,
) -> Option<Message> {
    let previous = cache
        .update_existing_messages(thread, |pages| {
            let entry = pages.get_mut(message_id)?;
            let previous = entry.clone();
            entry.content = Some(content.to_string());
            entry.is_edited = true;
            entry.updated_at = now;
            Some(previous)
        })
        .flatten()?;

    let edited = Message {
        content: Some(content.to_string()),
        is_edited: true,
        ..previous.clone()
    };
    cache.update_thread_list(ListKind::of(thread), |list| {
        refresh_preview_text(list, &edited)
    });
    Some(previous)
}

/// Restores the pre-edit copy while the cached entry still carries the failed edit.
pub fn revert_edit(cache: &CacheStore, previous: &Message, attempted: &str) -> bool {
    let reverted = cache
        .update_existing_messages(&previous.thread, |pages| match pages.get_mut(&previous.id) {
            Some(entry) if entry.content.as_deref() == Some(attempted) => {
                entry.content = previous.content.clone();
                entry.is_edited = previous.is_edited;
                entry.updated_at = previous.updated_at;
                true
            }
            _ => false,
        })
        .unwrap_or(false);
    if reverted {
        cache.update_thread_list(ListKind::of(&previous.thread), |list| {
            refresh_preview_text(list, previous)
        });
    }
    reverted
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
