use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use shared::{
    domain::{Message, UserId},
    error::{ApiError, ApiResult},
};
use storage::{EnqueueOutcome, QueuedSend, Storage};
use tracing::{info, warn};

/// Cancellation flag checked between queue entries.
#[derive(Debug, Clone, Default)]
pub struct DrainCancel(Arc<AtomicBool>);

impl DrainCancel {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum DrainStep {
    Sent { entry: QueuedSend, message: Message },
    Retrying { entry: QueuedSend, retry_count: u32, error: ApiError },
    Dropped { entry: QueuedSend, error: ApiError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub retrying: usize,
    pub dropped: usize,
    pub cancelled: bool,
    /// Another drain was already running.
    pub skipped: bool,
}

/// Durable FIFO of text sends captured while offline, scoped to one account.
pub struct OfflineQueue {
    storage: Storage,
    owner: UserId,
    max_retries: u32,
    draining: AtomicBool,
}

struct DrainingGuard<'a>(&'a AtomicBool);

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineQueue {
    pub fn new(storage: Storage, owner: UserId, max_retries: u32) -> Self {
        Self {
            storage,
            owner,
            max_retries,
            draining: AtomicBool::new(false),
        }
    }

    pub async fn enqueue(&self, entry: &QueuedSend) -> Result<EnqueueOutcome> {
        let outcome = self.storage.enqueue_send(entry).await?;
        if outcome == EnqueueOutcome::PreviouslyDropped {
            warn!(message_id = %entry.message_id, "offline queue: refusing previously dropped send");
        }
        Ok(outcome)
    }

    pub async fn pending(&self) -> Result<Vec<QueuedSend>> {
        self.storage.queued_sends(&self.owner).await
    }

    pub async fn len(&self) -> Result<u64> {
        self.storage.queue_len(&self.owner).await
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Retries every queued entry once, strictly one at a time, in FIFO order. A
    /// failure bumps the entry's retry count; reaching the ceiling drops it for good.
    pub async fn drain<F, Fut>(
        &self,
        cancel: &DrainCancel,
        mut send: F,
        mut on_step: impl FnMut(DrainStep),
    ) -> Result<DrainReport>
    where
        F: FnMut(QueuedSend) -> Fut,
        Fut: Future<Output = ApiResult<Message>>,
    {
        let mut report = DrainReport::default();
        if self.draining.swap(true, Ordering::SeqCst) {
            report.skipped = true;
            return Ok(report);
        }
        let _guard = DrainingGuard(&self.draining);

        let entries = self.storage.queued_sends(&self.owner).await?;
        info!(pending = entries.len(), "offline queue: draining");
        for entry in entries {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match send(entry.clone()).await {
                Ok(message) => {
                    self.storage.remove_queued_send(&entry.message_id).await?;
                    report.sent += 1;
                    on_step(DrainStep::Sent { entry, message });
                }
                Err(error) => {
                    let retry_count = self.storage.record_send_failure(&entry.message_id).await?;
                    if retry_count >= self.max_retries {
                        self.storage.drop_queued_send(&entry.message_id).await?;
                        warn!(message_id = %entry.message_id, retry_count, error = %error, "offline queue: dropping send");
                        report.dropped += 1;
                        on_step(DrainStep::Dropped { entry, error });
                    } else {
                        warn!(message_id = %entry.message_id, retry_count, error = %error, "offline queue: send failed, will retry");
                        report.retrying += 1;
                        on_step(DrainStep::Retrying {
                            entry,
                            retry_count,
                            error,
                        });
                    }
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
#[path = "tests/offline_queue_tests.rs"]
mod tests;
