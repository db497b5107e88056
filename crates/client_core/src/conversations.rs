use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, Utc};
use shared::domain::{ConversationSummary, LastMessagePreview, Message, MessageId, ThreadKey, UserId};
use storage::ThreadPreferences;

/// Pinned first, then most recent activity, then a stable tiebreak on the key.
pub fn compare_threads(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    b.is_pinned
        .cmp(&a.is_pinned)
        .then_with(|| match (a.last_message_time, b.last_message_time) {
            (Some(a_time), Some(b_time)) => b_time.cmp(&a_time),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.thread.cmp(&b.thread))
}

pub fn sort_threads(list: &mut [ConversationSummary]) {
    list.sort_by(compare_threads);
}

pub fn is_sorted(list: &[ConversationSummary]) -> bool {
    list.windows(2)
        .all(|pair| compare_threads(&pair[0], &pair[1]) != Ordering::Greater)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewOutcome {
    Applied,
    /// Echo of an own message already previewed optimistically; timestamp untouched.
    KeptTimestamp,
    /// Older than the preview already shown.
    Superseded,
    /// The thread is not in the list.
    Missing,
}

pub fn set_preview(list: &mut [ConversationSummary], message: &Message) -> bool {
    let Some(entry) = list.iter_mut().find(|entry| entry.thread == message.thread) else {
        return false;
    };
    entry.last_message = Some(LastMessagePreview {
        message_id: Some(message.id.clone()),
        content: message.preview_text(),
        sender_id: message.sender_id.clone(),
    });
    entry.last_message_time = Some(message.created_at);
    sort_threads(list);
    true
}

pub fn apply_preview(
    list: &mut [ConversationSummary],
    message: &Message,
    own_user: &UserId,
) -> PreviewOutcome {
    let Some(entry) = list.iter_mut().find(|entry| entry.thread == message.thread) else {
        return PreviewOutcome::Missing;
    };

    let text = message.preview_text();
    if &message.sender_id == own_user {
        if let Some(preview) = entry.last_message.as_mut() {
            let optimistic_source = preview
                .message_id
                .as_ref()
                .is_some_and(|id| id.is_provisional() || id == &message.id);
            if optimistic_source && preview.content == text && &preview.sender_id == own_user {
                preview.message_id = Some(message.id.clone());
                return PreviewOutcome::KeptTimestamp;
            }
        }
    }

    let same_source = entry
        .last_message
        .as_ref()
        .and_then(|preview| preview.message_id.as_ref())
        == Some(&message.id);
    if let Some(current) = entry.last_message_time {
        if current > message.created_at && !same_source {
            return PreviewOutcome::Superseded;
        }
    }

    set_preview(list, message);
    PreviewOutcome::Applied
}

pub fn refresh_preview_for_update(list: &mut [ConversationSummary], message: &Message) -> bool {
    let Some(entry) = list.iter_mut().find(|entry| entry.thread == message.thread) else {
        return false;
    };
    let Some(preview) = entry.last_message.as_mut() else {
        return false;
    };
    if preview.message_id.as_ref() != Some(&message.id) {
        return false;
    }
    preview.content = message.preview_text();
    entry.last_message_time = Some(message.updated_at);
    sort_threads(list);
    true
}

pub fn refresh_preview_text(list: &mut [ConversationSummary], message: &Message) -> bool {
    let preview = list
        .iter_mut()
        .find(|entry| entry.thread == message.thread)
        .and_then(|entry| entry.last_message.as_mut())
        .filter(|preview| preview.message_id.as_ref() == Some(&message.id));
    match preview {
        Some(preview) => {
            preview.content = message.preview_text();
            true
        }
        None => false,
    }
}

pub fn replace_preview_id(
    list: &mut [ConversationSummary],
    thread: &ThreadKey,
    provisional: &MessageId,
    durable: &MessageId,
) -> bool {
    let preview = list
        .iter_mut()
        .find(|entry| &entry.thread == thread)
        .and_then(|entry| entry.last_message.as_mut())
        .filter(|preview| preview.message_id.as_ref() == Some(provisional));
    match preview {
        Some(preview) => {
            preview.message_id = Some(durable.clone());
            true
        }
        None => false,
    }
}

pub fn restore_preview(
    list: &mut [ConversationSummary],
    thread: &ThreadKey,
    removed: &MessageId,
    fallback: Option<&Message>,
) -> bool {
    let Some(entry) = list.iter_mut().find(|entry| &entry.thread == thread) else {
        return false;
    };
    let was_source = entry
        .last_message
        .as_ref()
        .and_then(|preview| preview.message_id.as_ref())
        == Some(removed);
    if !was_source {
        return false;
    }
    match fallback {
        Some(message) => {
            set_preview(list, message);
        }
        None => {
            entry.last_message = None;
            entry.last_message_time = None;
            sort_threads(list);
        }
    }
    true
}

pub fn set_unread(list: &mut [ConversationSummary], thread: &ThreadKey, count: u32) -> bool {
    match list.iter_mut().find(|entry| &entry.thread == thread) {
        Some(entry) => {
            entry.unread_count = count;
            true
        }
        None => false,
    }
}

pub fn apply_preferences(list: &mut [ConversationSummary], prefs: &ThreadPreferences) {
    for entry in list.iter_mut() {
        entry.is_pinned = prefs.pinned.contains(&entry.thread);
        entry.is_favorite = prefs.favorites.contains(&entry.thread);
    }
    sort_threads(list);
}

/// Drops threads hidden by a delete-for-me tombstone. A message newer than the
/// tombstone brings the thread back.
pub fn hide_tombstoned(
    list: &mut Vec<ConversationSummary>,
    tombstones: &HashMap<ThreadKey, DateTime<Utc>>,
) {
    list.retain(|entry| match tombstones.get(&entry.thread) {
        Some(deleted_at) => entry
            .last_message_time
            .is_some_and(|last| last > *deleted_at),
        None => true,
    });
}

pub fn upsert_summary(list: &mut Vec<ConversationSummary>, summary: ConversationSummary) {
    match list.iter_mut().find(|entry| entry.thread == summary.thread) {
        Some(entry) => *entry = summary,
        None => list.insert(0, summary),
    }
    sort_threads(list);
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
