use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{ThreadKey, TypingUser, UserId},
    protocol::TypingPayload,
};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{cache::lock, ClientEvent};

struct TypingEntry {
    user: TypingUser,
    generation: u64,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    threads: HashMap<ThreadKey, HashMap<UserId, TypingEntry>>,
    next_generation: u64,
}

/// Ephemeral per-thread typing sets. Every entry carries its own expiry timer so a
/// lost stop broadcast cannot leave a typist stuck.
#[derive(Clone)]
pub struct TypingTracker {
    state: Arc<Mutex<TypingState>>,
    expiry: Duration,
    collapse_threshold: usize,
    events: broadcast::Sender<ClientEvent>,
}

impl TypingTracker {
    pub fn new(
        expiry: Duration,
        collapse_threshold: usize,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(TypingState::default())),
            expiry,
            collapse_threshold,
            events,
        }
    }

    /// Must run inside a tokio runtime; expiry timers are spawned tasks.
    pub fn on_typing(&self, thread: &ThreadKey, payload: &TypingPayload, own_user: &UserId) {
        if &payload.user_id == own_user {
            return;
        }

        let changed = {
            let mut state = lock(&self.state);
            if payload.is_typing {
                state.next_generation += 1;
                let generation = state.next_generation;
                let expiry = self.spawn_expiry(thread.clone(), payload.user_id.clone(), generation);
                let entry = TypingEntry {
                    user: TypingUser {
                        user_id: payload.user_id.clone(),
                        display_name: payload.display_name.clone(),
                        avatar_url: payload.avatar_url.clone(),
                        last_seen: Utc::now(),
                    },
                    generation,
                    expiry,
                };
                if let Some(previous) = state
                    .threads
                    .entry(thread.clone())
                    .or_default()
                    .insert(payload.user_id.clone(), entry)
                {
                    previous.expiry.abort();
                }
                true
            } else {
                remove_entry(&mut state, thread, &payload.user_id, None)
            }
        };

        if changed {
            self.emit(thread);
        }
    }

    fn spawn_expiry(&self, thread: ThreadKey, user_id: UserId, generation: u64) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.expiry).await;
            let expired = {
                let mut state = lock(&tracker.state);
                remove_entry(&mut state, &thread, &user_id, Some(generation))
            };
            if expired {
                tracker.emit(&thread);
            }
        })
    }

    /// Current typists, in the order they started typing.
    pub fn typists(&self, thread: &ThreadKey) -> Vec<TypingUser> {
        let state = lock(&self.state);
        let mut entries: Vec<(u64, TypingUser)> = state
            .threads
            .get(thread)
            .map(|users| {
                users
                    .values()
                    .map(|entry| (entry.generation, entry.user.clone()))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by_key(|(generation, _)| *generation);
        entries.into_iter().map(|(_, user)| user).collect()
    }

    pub fn label(&self, thread: &ThreadKey) -> Option<String> {
        typing_label(&self.typists(thread), self.collapse_threshold)
    }

    pub fn clear_thread(&self, thread: &ThreadKey) {
        let removed = lock(&self.state).threads.remove(thread);
        if let Some(users) = removed {
            for entry in users.into_values() {
                entry.expiry.abort();
            }
            self.emit(thread);
        }
    }

    pub fn clear_all(&self) {
        let threads = std::mem::take(&mut lock(&self.state).threads);
        for users in threads.into_values() {
            for entry in users.into_values() {
                entry.expiry.abort();
            }
        }
    }

    fn emit(&self, thread: &ThreadKey) {
        let typists = self.typists(thread);
        let label = typing_label(&typists, self.collapse_threshold);
        let _ = self.events.send(ClientEvent::TypingChanged {
            thread: thread.clone(),
            typists,
            label,
        });
    }
}

/// Removes one typist. With `generation` set, only an entry from that exact upsert
/// is removed, so a stale timer never clears a fresh entry.
fn remove_entry(
    state: &mut TypingState,
    thread: &ThreadKey,
    user_id: &UserId,
    generation: Option<u64>,
) -> bool {
    let Some(users) = state.threads.get_mut(thread) else {
        return false;
    };
    let matches = users
        .get(user_id)
        .is_some_and(|entry| generation.map_or(true, |g| g == entry.generation));
    if !matches {
        return false;
    }
    if let Some(entry) = users.remove(user_id) {
        if generation.is_none() {
            entry.expiry.abort();
        }
    }
    if users.is_empty() {
        state.threads.remove(thread);
    }
    true
}

pub fn typing_label(typists: &[TypingUser], collapse_threshold: usize) -> Option<String> {
    match typists {
        [] => None,
        [only] => Some(format!("{} is typing…", only.display_name)),
        many if many.len() > collapse_threshold => {
            Some(format!("{} people are typing…", many.len()))
        }
        [init @ .., last] => {
            let names: Vec<&str> = init.iter().map(|user| user.display_name.as_str()).collect();
            Some(format!(
                "{} and {} are typing…",
                names.join(", "),
                last.display_name
            ))
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
