//! In-memory query cache that the UI renders from.
//!
//! Every mutation is a synchronous read-modify-write under one lock, so event
//! handlers never observe each other's partial updates.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use shared::domain::{ConversationSummary, GroupId, GroupMember, Message, MessageId, ThreadKey};
use tokio::sync::broadcast;

use crate::conversations::sort_threads;

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pagination cursor: creation time of the oldest message already loaded.
pub type Cursor = DateTime<Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Conversations,
    Groups,
}

impl ListKind {
    pub fn of(thread: &ThreadKey) -> Self {
        match thread {
            ThreadKey::Direct(_) => Self::Conversations,
            ThreadKey::Group(_) => Self::Groups,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    ThreadList(ListKind),
    Messages(ThreadKey),
    GroupMembers(GroupId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheNotification {
    Updated(QueryKey),
    Invalidated(QueryKey),
    Removed(QueryKey),
}

/// One fetched page, newest message first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// `None` once the backend has nothing older than this page.
    pub next_cursor: Option<Cursor>,
}

/// All cached pages of a thread, newest page first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePages {
    pub pages: Vec<MessagePage>,
}

impl MessagePages {
    pub fn single(messages: Vec<Message>, next_cursor: Option<Cursor>) -> Self {
        Self {
            pages: vec![MessagePage {
                messages,
                next_cursor,
            }],
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.pages.iter().flat_map(|page| page.messages.iter())
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|page| page.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.iter().any(|message| &message.id == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.iter().find(|message| &message.id == id)
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.pages
            .iter_mut()
            .flat_map(|page| page.messages.iter_mut())
            .find(|message| &message.id == id)
    }

    pub fn newest(&self) -> Option<&Message> {
        self.iter().next()
    }

    pub fn has_more(&self) -> bool {
        self.pages
            .last()
            .map(|page| page.next_cursor.is_some())
            .unwrap_or(true)
    }

    pub fn oldest_cursor(&self) -> Option<Cursor> {
        self.pages.last().and_then(|page| page.next_cursor)
    }

    /// Inserts into the first page, keeping it ordered newest first. A message newer
    /// than everything cached lands at the head.
    pub fn insert_newest(&mut self, message: Message) {
        if self.pages.is_empty() {
            self.pages.push(MessagePage::default());
        }
        let first = &mut self.pages[0].messages;
        let at = first
            .iter()
            .position(|existing| existing.created_at <= message.created_at)
            .unwrap_or(first.len());
        first.insert(at, message);
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        for page in &mut self.pages {
            if let Some(index) = page.messages.iter().position(|message| &message.id == id) {
                return Some(page.messages.remove(index));
            }
        }
        None
    }

    pub fn push_older(&mut self, messages: Vec<Message>, next_cursor: Option<Cursor>) -> usize {
        let known: HashSet<MessageId> = self.iter().map(|message| message.id.clone()).collect();
        let fresh: Vec<Message> = messages
            .into_iter()
            .filter(|message| !known.contains(&message.id))
            .collect();
        let added = fresh.len();
        self.pages.push(MessagePage {
            messages: fresh,
            next_cursor,
        });
        added
    }

    pub fn display_order(&self) -> Vec<Message> {
        self.iter().rev().cloned().collect()
    }
}

#[derive(Default)]
struct CacheInner {
    conversations: Option<Vec<ConversationSummary>>,
    groups: Option<Vec<ConversationSummary>>,
    messages: HashMap<ThreadKey, MessagePages>,
    members: HashMap<GroupId, Vec<GroupMember>>,
    stale: HashSet<QueryKey>,
}

impl CacheInner {
    fn list_mut(&mut self, kind: ListKind) -> &mut Option<Vec<ConversationSummary>> {
        match kind {
            ListKind::Conversations => &mut self.conversations,
            ListKind::Groups => &mut self.groups,
        }
    }

    fn list(&self, kind: ListKind) -> &Option<Vec<ConversationSummary>> {
        match kind {
            ListKind::Conversations => &self.conversations,
            ListKind::Groups => &self.groups,
        }
    }
}

pub struct CacheStore {
    inner: RwLock<CacheInner>,
    notifications: broadcast::Sender<CacheNotification>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(CacheInner::default()),
            notifications,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheNotification> {
        self.notifications.subscribe()
    }

    fn notify(&self, notification: CacheNotification) {
        let _ = self.notifications.send(notification);
    }

    pub fn thread_list(&self, kind: ListKind) -> Option<Vec<ConversationSummary>> {
        read_lock(&self.inner).list(kind).clone()
    }

    pub fn thread_summary(&self, thread: &ThreadKey) -> Option<ConversationSummary> {
        read_lock(&self.inner)
            .list(ListKind::of(thread))
            .as_ref()
            .and_then(|list| list.iter().find(|entry| &entry.thread == thread).cloned())
    }

    pub fn set_thread_list(&self, kind: ListKind, mut list: Vec<ConversationSummary>) {
        sort_threads(&mut list);
        {
            let mut inner = write_lock(&self.inner);
            *inner.list_mut(kind) = Some(list);
            inner.stale.remove(&QueryKey::ThreadList(kind));
        }
        self.notify(CacheNotification::Updated(QueryKey::ThreadList(kind)));
    }

    pub fn update_thread_list<R>(
        &self,
        kind: ListKind,
        f: impl FnOnce(&mut Vec<ConversationSummary>) -> R,
    ) -> Option<R> {
        let result = {
            let mut inner = write_lock(&self.inner);
            inner.list_mut(kind).as_mut().map(f)
        };
        if result.is_some() {
            self.notify(CacheNotification::Updated(QueryKey::ThreadList(kind)));
        }
        result
    }

    pub fn messages(&self, thread: &ThreadKey) -> Option<MessagePages> {
        read_lock(&self.inner).messages.get(thread).cloned()
    }

    pub fn has_messages(&self, thread: &ThreadKey) -> bool {
        read_lock(&self.inner).messages.contains_key(thread)
    }

    pub fn set_messages(&self, thread: &ThreadKey, pages: MessagePages) {
        let key = QueryKey::Messages(thread.clone());
        {
            let mut inner = write_lock(&self.inner);
            inner.messages.insert(thread.clone(), pages);
            inner.stale.remove(&key);
        }
        self.notify(CacheNotification::Updated(key));
    }

    /// Runs `f` against a thread's pages, creating an empty entry when the thread was
    /// never loaded. Such an entry only holds what realtime delivered, so it is marked
    /// stale until a real fetch replaces it.
    pub fn update_messages<R>(&self, thread: &ThreadKey, f: impl FnOnce(&mut MessagePages) -> R) -> R {
        let key = QueryKey::Messages(thread.clone());
        let result = {
            let mut inner = write_lock(&self.inner);
            if !inner.messages.contains_key(thread) {
                inner.stale.insert(key.clone());
            }
            let pages = inner.messages.entry(thread.clone()).or_default();
            f(pages)
        };
        self.notify(CacheNotification::Updated(key));
        result
    }

    pub fn update_existing_messages<R>(
        &self,
        thread: &ThreadKey,
        f: impl FnOnce(&mut MessagePages) -> R,
    ) -> Option<R> {
        let result = {
            let mut inner = write_lock(&self.inner);
            inner.messages.get_mut(thread).map(f)
        };
        if result.is_some() {
            self.notify(CacheNotification::Updated(QueryKey::Messages(thread.clone())));
        }
        result
    }

    pub fn remove_messages(&self, thread: &ThreadKey) {
        let key = QueryKey::Messages(thread.clone());
        let removed = {
            let mut inner = write_lock(&self.inner);
            inner.stale.remove(&key);
            inner.messages.remove(thread).is_some()
        };
        if removed {
            self.notify(CacheNotification::Removed(key));
        }
    }

    pub fn members(&self, group_id: &GroupId) -> Option<Vec<GroupMember>> {
        read_lock(&self.inner).members.get(group_id).cloned()
    }

    pub fn set_members(&self, group_id: &GroupId, members: Vec<GroupMember>) {
        let key = QueryKey::GroupMembers(group_id.clone());
        {
            let mut inner = write_lock(&self.inner);
            inner.members.insert(group_id.clone(), members);
            inner.stale.remove(&key);
        }
        self.notify(CacheNotification::Updated(key));
    }

    pub fn update_members<R>(
        &self,
        group_id: &GroupId,
        f: impl FnOnce(&mut Vec<GroupMember>) -> R,
    ) -> Option<R> {
        let result = {
            let mut inner = write_lock(&self.inner);
            inner.members.get_mut(group_id).map(f)
        };
        if result.is_some() {
            self.notify(CacheNotification::Updated(QueryKey::GroupMembers(group_id.clone())));
        }
        result
    }

    pub fn invalidate(&self, key: QueryKey) {
        write_lock(&self.inner).stale.insert(key.clone());
        self.notify(CacheNotification::Invalidated(key));
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        read_lock(&self.inner).stale.contains(key)
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
