//! Explicit state cell for the UI context that event handlers consult on every event.

use std::{sync::RwLock, time::Duration};

use shared::domain::ThreadKey;
use tokio::time::Instant;

use crate::cache::{read_lock, write_lock};

#[derive(Debug, Clone)]
struct ViewInner {
    active_thread: Option<ThreadKey>,
    visible: bool,
    online: bool,
    hidden_since: Option<Instant>,
}

#[derive(Debug)]
pub struct ViewState {
    inner: RwLock<ViewInner>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            inner: RwLock::new(ViewInner {
                active_thread: None,
                visible: true,
                online: true,
                hidden_since: None,
            }),
        }
    }
}

impl ViewState {
    pub fn active_thread(&self) -> Option<ThreadKey> {
        read_lock(&self.inner).active_thread.clone()
    }

    pub fn is_visible(&self) -> bool {
        read_lock(&self.inner).visible
    }

    pub fn is_online(&self) -> bool {
        read_lock(&self.inner).online
    }

    pub fn is_active_and_visible(&self, thread: &ThreadKey) -> bool {
        let inner = read_lock(&self.inner);
        inner.visible && inner.active_thread.as_ref() == Some(thread)
    }

    /// Returns the previously active thread.
    pub fn set_active_thread(&self, thread: Option<ThreadKey>) -> Option<ThreadKey> {
        std::mem::replace(&mut write_lock(&self.inner).active_thread, thread)
    }

    /// Records a visibility change. On becoming visible, returns how long the view
    /// was hidden.
    pub fn set_visible(&self, visible: bool) -> Option<Duration> {
        let mut inner = write_lock(&self.inner);
        let was_visible = std::mem::replace(&mut inner.visible, visible);
        match (was_visible, visible) {
            (true, false) => {
                inner.hidden_since = Some(Instant::now());
                None
            }
            (false, true) => inner.hidden_since.take().map(|since| since.elapsed()),
            _ => None,
        }
    }

    /// Returns the previous connectivity flag.
    pub fn set_online(&self, online: bool) -> bool {
        std::mem::replace(&mut write_lock(&self.inner).online, online)
    }
}
