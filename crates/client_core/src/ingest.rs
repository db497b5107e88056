//! Applies change-feed and broadcast events to the cache.
//!
//! Handlers are synchronous and run one at a time; anything that needs the network
//! is returned as [`IngestEffects`] for the engine to perform afterwards.

use std::sync::Arc;

use chrono::Duration;
use shared::{
    domain::{DeliveryStatus, Message, MessageId, ThreadKey, UserId},
    error::ProtocolError,
    protocol::{BroadcastEvent, ChangeEvent, InboundFrame},
};
use tracing::{debug, warn};

use crate::{
    cache::{CacheStore, ListKind},
    conversations::{apply_preview, refresh_preview_for_update, set_unread, PreviewOutcome},
    optimistic::{find_match, splice, SpliceOutcome},
    unread::{apply_counter, apply_read_receipt, CounterOutcome},
    view::ViewState,
};

/// One validated realtime event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Change(ChangeEvent),
    Broadcast(BroadcastEvent),
}

impl IngestEvent {
    /// Validates a raw frame. Control frames (`joined`, `error`) carry no event.
    pub fn from_frame(frame: InboundFrame) -> Result<Option<Self>, ProtocolError> {
        match frame {
            InboundFrame::Change {
                table,
                operation,
                row,
            } => ChangeEvent::decode(&table, operation, row).map(|event| Some(Self::Change(event))),
            InboundFrame::Broadcast {
                topic,
                event,
                payload,
            } => BroadcastEvent::decode(&topic, &event, payload)
                .map(|event| Some(Self::Broadcast(event))),
            InboundFrame::Joined { topic } => {
                debug!(topic = %topic, "realtime: joined topic");
                Ok(None)
            }
            InboundFrame::Error { message } => {
                warn!(error = %message, "realtime: server reported error");
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Duplicate,
    Reconciled(SpliceOutcome),
    Inserted,
}

/// Network follow-ups produced by a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestEffects {
    /// Messages that just became read in the open thread.
    pub mark_read: Option<(ThreadKey, Vec<MessageId>)>,
    pub reset_unread: Option<ThreadKey>,
    pub refetch_list: Option<ListKind>,
}

impl IngestEffects {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

pub struct Ingestor {
    cache: Arc<CacheStore>,
    view: Arc<ViewState>,
    reconcile_window: Duration,
}

impl Ingestor {
    pub fn new(
        cache: Arc<CacheStore>,
        view: Arc<ViewState>,
        reconcile_window: Duration,
    ) -> Self {
        Self {
            cache,
            view,
            reconcile_window,
        }
    }

    /// Applies a change-feed event. Broadcast events go through the engine, which owns
    /// typing presence.
    pub fn apply_change(&self, event: ChangeEvent, own_user: &UserId) -> IngestEffects {
        match event {
            ChangeEvent::MessageInserted(message) => self.ingest_insert(message, own_user).1,
            ChangeEvent::MessageUpdated(message) => self.ingest_update(message),
            ChangeEvent::UnreadCounter(counter) => {
                let mut effects = IngestEffects::default();
                if let CounterOutcome::ForcedZero {
                    reset_backend: true,
                } = apply_counter(&self.cache, &self.view, own_user, &counter)
                {
                    effects.reset_unread = Some(counter.thread);
                }
                effects
            }
        }
    }

    pub fn apply_read_receipt(&self, event: &BroadcastEvent, own_user: &UserId) -> usize {
        match event {
            BroadcastEvent::MessagesRead { thread, payload } => {
                apply_read_receipt(&self.cache, own_user, thread, payload)
            }
            BroadcastEvent::Typing { .. } => 0,
        }
    }

    pub fn ingest_insert(&self, message: Message, own_user: &UserId) -> (InsertOutcome, IngestEffects) {
        let thread = message.thread.clone();
        let inbound = &message.sender_id != own_user;
        let open = self.view.is_active_and_visible(&thread);
        let window = self.reconcile_window;
        let mut effects = IngestEffects::default();

        let local_status = match (inbound, open) {
            (true, true) => Some(DeliveryStatus::Read),
            (true, false) => Some(DeliveryStatus::Delivered),
            (false, _) => None,
        };

        let preview_source = message.clone();
        let outcome = self.cache.update_messages(&thread, |pages| {
            if pages.contains(&message.id) {
                return InsertOutcome::Duplicate;
            }
            let id = message.id.clone();
            let outcome = match find_match(pages, &message, window) {
                Some(provisional_id) => {
                    InsertOutcome::Reconciled(splice(pages, &provisional_id, message))
                }
                None => {
                    pages.insert_newest(message);
                    InsertOutcome::Inserted
                }
            };
            if let (Some(status), Some(entry)) = (local_status, pages.get_mut(&id)) {
                entry.status = entry.status.advanced_to(status);
            }
            outcome
        });

        if outcome == InsertOutcome::Duplicate {
            debug!(thread = %thread, message_id = %preview_source.id, "ingest: duplicate insert dropped");
            return (outcome, effects);
        }
        if let InsertOutcome::Reconciled(splice_outcome) = outcome {
            debug!(thread = %thread, message_id = %preview_source.id, ?splice_outcome, "ingest: reconciled provisional message");
        }

        let kind = ListKind::of(&thread);
        let preview = self.cache.update_thread_list(kind, |list| {
            let preview = apply_preview(list, &preview_source, own_user);
            if inbound && open {
                set_unread(list, &thread, 0);
            }
            preview
        });
        if preview == Some(PreviewOutcome::Missing) {
            effects.refetch_list = Some(kind);
        }

        if inbound && open {
            effects.mark_read = Some((thread, vec![preview_source.id]));
        }
        (outcome, effects)
    }

    pub fn ingest_update(&self, message: Message) -> IngestEffects {
        let patched = self
            .cache
            .update_existing_messages(&message.thread, |pages| match pages.get_mut(&message.id) {
                Some(entry) => {
                    entry.content = message.content.clone();
                    entry.kind = message.kind;
                    entry.media = message.media.clone();
                    entry.is_edited = message.is_edited;
                    entry.is_deleted = message.is_deleted;
                    entry.updated_at = message.updated_at;
                    entry.status = entry.status.advanced_to(message.status);
                    true
                }
                None => false,
            })
            .unwrap_or(false);
        if !patched {
            debug!(thread = %message.thread, message_id = %message.id, "ingest: update for uncached message");
        }

        self.cache.update_thread_list(ListKind::of(&message.thread), |list| {
            refresh_preview_for_update(list, &message)
        });
        IngestEffects::default()
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
