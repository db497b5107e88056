use shared::{
    domain::{DeliveryStatus, MessageId, ThreadKey, UserId},
    protocol::{MessagesReadPayload, UnreadCounter},
};
use tracing::debug;

use crate::{
    cache::{CacheStore, ListKind},
    conversations::set_unread,
    view::ViewState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    /// Counter row for another user.
    Ignored,
    Applied(u32),
    /// Thread is open and visible; the cached counter stays at zero. `reset_backend`
    /// is set when the backend still believes the thread has unread messages.
    ForcedZero { reset_backend: bool },
}

pub fn apply_counter(
    cache: &CacheStore,
    view: &ViewState,
    own_user: &UserId,
    counter: &UnreadCounter,
) -> CounterOutcome {
    if &counter.user_id != own_user {
        return CounterOutcome::Ignored;
    }

    let kind = ListKind::of(&counter.thread);
    if view.is_active_and_visible(&counter.thread) {
        cache.update_thread_list(kind, |list| set_unread(list, &counter.thread, 0));
        debug!(thread = %counter.thread, pushed = counter.unread_count, "unread: active thread forced to zero");
        return CounterOutcome::ForcedZero {
            reset_backend: counter.unread_count > 0,
        };
    }

    cache.update_thread_list(kind, |list| {
        set_unread(list, &counter.thread, counter.unread_count)
    });
    CounterOutcome::Applied(counter.unread_count)
}

/// Applies a peer's read receipt. Returns how many cached messages changed.
pub fn apply_read_receipt(
    cache: &CacheStore,
    own_user: &UserId,
    thread: &ThreadKey,
    payload: &MessagesReadPayload,
) -> usize {
    if &payload.reader_id == own_user {
        return 0;
    }
    cache
        .update_existing_messages(thread, |pages| {
            let mut patched = 0;
            for id in &payload.message_ids {
                if let Some(message) = pages.get_mut(id) {
                    let next = message.status.advanced_to(DeliveryStatus::Read);
                    if next != message.status {
                        message.status = next;
                        patched += 1;
                    }
                }
            }
            patched
        })
        .unwrap_or(0)
}

/// Marks every cached inbound message of `thread` as read and zeroes its counter.
/// Returns the ids that moved to `read`, oldest first.
pub fn mark_thread_read_locally(
    cache: &CacheStore,
    own_user: &UserId,
    thread: &ThreadKey,
) -> Vec<MessageId> {
    let ids = cache
        .update_existing_messages(thread, |pages| {
            let mut ids = Vec::new();
            for page in pages.pages.iter_mut().rev() {
                for message in page.messages.iter_mut().rev() {
                    if &message.sender_id == own_user
                        || message.is_provisional()
                        || message.status == DeliveryStatus::Read
                    {
                        continue;
                    }
                    message.status = DeliveryStatus::Read;
                    ids.push(message.id.clone());
                }
            }
            ids
        })
        .unwrap_or_default();
    cache.update_thread_list(ListKind::of(thread), |list| set_unread(list, thread, 0));
    ids
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
