//! Backward history paging and scroll anchoring.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use shared::domain::{Message, MessageId, ThreadKey};
use tracing::debug;

use crate::cache::{lock, Cursor, MessagePages};

pub const SCROLL_RESTORE_MAX_FRAMES: u32 = 6;

/// Cursor for the page after `messages`, or `None` when the backend returned a short
/// page and there is nothing older.
pub fn next_cursor(messages: &[Message], limit: u32) -> Option<Cursor> {
    if messages.len() < limit as usize {
        return None;
    }
    messages.iter().map(|message| message.created_at).min()
}

/// Builds the cached pages for a freshly fetched first page. Provisional sends still in
/// flight and realtime arrivals newer than the fetch survive the replacement.
pub fn merge_initial_page(
    existing: Option<&MessagePages>,
    mut fetched: Vec<Message>,
    limit: u32,
) -> MessagePages {
    let cursor = next_cursor(&fetched, limit);
    let fetched_ids: HashSet<MessageId> = fetched.iter().map(|message| message.id.clone()).collect();
    let newest_fetched = fetched.iter().map(|message| message.created_at).max();

    if let Some(existing) = existing {
        let carried: Vec<Message> = existing
            .iter()
            .filter(|message| !fetched_ids.contains(&message.id))
            .filter(|message| {
                message.is_provisional()
                    || newest_fetched.map_or(true, |newest| message.created_at > newest)
            })
            .cloned()
            .collect();
        fetched.extend(carried);
    }

    fetched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    MessagePages::single(fetched, cursor)
}

/// Collapses a thread's pages to its newest `retain` messages in one page.
pub fn trim_for_switch(pages: &MessagePages, retain: usize) -> MessagePages {
    let total = pages.len();
    let kept: Vec<Message> = pages.iter().take(retain).cloned().collect();
    let cursor = if total > retain {
        kept.last().map(|message| message.created_at)
    } else {
        pages.oldest_cursor()
    };
    MessagePages::single(kept, cursor)
}

/// Appends an older page, dropping anything already cached. Returns how many
/// messages were added.
pub fn append_older_page(pages: &mut MessagePages, fetched: Vec<Message>, limit: u32) -> usize {
    let cursor = next_cursor(&fetched, limit);
    let added = pages.push_older(fetched, cursor);
    if added == 0 && pages.pages.last().is_some_and(|page| page.messages.is_empty()) {
        pages.pages.pop();
        if let Some(last) = pages.pages.last_mut() {
            last.next_cursor = cursor;
        }
    }
    added
}

/// Threads with an older-page fetch in flight. A second fetch for the same thread is
/// refused until the guard of the first is dropped.
#[derive(Clone, Default)]
pub struct InFlightFetches {
    threads: Arc<Mutex<HashSet<ThreadKey>>>,
}

pub struct FetchGuard {
    thread: ThreadKey,
    threads: Arc<Mutex<HashSet<ThreadKey>>>,
}

impl InFlightFetches {
    pub fn begin(&self, thread: &ThreadKey) -> Option<FetchGuard> {
        if !lock(&self.threads).insert(thread.clone()) {
            debug!(thread = %thread, "pagination: fetch already in flight");
            return None;
        }
        Some(FetchGuard {
            thread: thread.clone(),
            threads: Arc::clone(&self.threads),
        })
    }

    pub fn is_fetching(&self, thread: &ThreadKey) -> bool {
        lock(&self.threads).contains(thread)
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        lock(&self.threads).remove(&self.thread);
    }
}

/// The scrollable message list as the renderer exposes it.
#[async_trait]
pub trait ScrollViewport: Send + Sync {
    fn scroll_top(&self) -> f64;
    fn scroll_height(&self) -> f64;
    fn set_scroll_top(&self, value: f64);
    /// Resolves after the renderer has laid out one more frame.
    async fn next_frame(&self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub scroll_top: f64,
    pub scroll_height: f64,
}

impl ScrollAnchor {
    pub fn capture(viewport: &dyn ScrollViewport) -> Self {
        Self {
            scroll_top: viewport.scroll_top(),
            scroll_height: viewport.scroll_height(),
        }
    }

    /// Scroll offset that keeps the anchored content in place once the list has grown
    /// to `height_after`.
    pub fn target(&self, height_after: f64) -> f64 {
        self.scroll_top + (height_after - self.scroll_height)
    }
}

/// Reapplies the anchor on each frame until layout stops moving, at most `max_frames`
/// times. Returns the offset applied last.
pub async fn restore_scroll(
    viewport: &dyn ScrollViewport,
    anchor: ScrollAnchor,
    max_frames: u32,
) -> f64 {
    let mut applied = anchor.target(viewport.scroll_height());
    viewport.set_scroll_top(applied);

    for _ in 0..max_frames {
        viewport.next_frame().await;
        let target = anchor.target(viewport.scroll_height());
        if (target - applied).abs() < 0.5 && (viewport.scroll_top() - target).abs() < 0.5 {
            break;
        }
        applied = target;
        viewport.set_scroll_top(applied);
    }
    applied
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
