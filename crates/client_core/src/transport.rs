//! Websocket connection carrying the change feed and the broadcast channel.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::protocol::{InboundFrame, OutboundFrame};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::{backend::BroadcastSink, cache::lock};

/// Exponential reconnect delays: `base * 2^(attempt - 1)`, capped at `max`, for at most
/// `max_attempts` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based); `None` once attempts are
    /// exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts are exhausted; missed events are recovered by the next
    /// visibility reconciliation.
    GaveUp,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(InboundFrame),
    Status(TransportStatus),
}

pub fn realtime_url(base: &str, access_token: &str) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid realtime url: {base}"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| anyhow!("cannot convert {base} to ws://"))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| anyhow!("cannot convert {base} to wss://"))?,
        other => return Err(anyhow!("unsupported realtime url scheme '{other}'")),
    }
    url.query_pairs_mut().append_pair("access_token", access_token);
    Ok(url)
}

/// Handle to the background connection task. Joined topics are remembered and
/// re-joined after every reconnect.
pub struct RealtimeTransport {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    topics: Arc<Mutex<HashSet<String>>>,
    task: JoinHandle<()>,
}

impl RealtimeTransport {
    pub fn spawn(url: Url, policy: BackoffPolicy) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::channel(256);
        let topics = Arc::new(Mutex::new(HashSet::new()));
        let task = tokio::spawn(run_connection(
            url,
            policy,
            Arc::clone(&topics),
            outbound_rx,
            events,
        ));
        (
            Self {
                outbound,
                topics,
                task,
            },
            events_rx,
        )
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.topics).iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }

    fn queue(&self, frame: OutboundFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| anyhow!("realtime transport closed"))
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl BroadcastSink for RealtimeTransport {
    async fn join(&self, topic: &str) -> Result<()> {
        if lock(&self.topics).insert(topic.to_string()) {
            self.queue(OutboundFrame::Join {
                topic: topic.to_string(),
            })?;
        }
        Ok(())
    }

    async fn leave(&self, topic: &str) -> Result<()> {
        if lock(&self.topics).remove(topic) {
            self.queue(OutboundFrame::Leave {
                topic: topic.to_string(),
            })?;
        }
        Ok(())
    }

    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> Result<()> {
        self.queue(OutboundFrame::Broadcast {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        })
    }
}

enum SessionEnd {
    /// Socket dropped; reconnect.
    Disconnected,
    /// Handle or consumer is gone; stop for good.
    Closed,
}

async fn run_connection(
    url: Url,
    policy: BackoffPolicy,
    topics: Arc<Mutex<HashSet<String>>>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut attempt = 0u32;
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                attempt = 0;
                info!(host = url.host_str().unwrap_or_default(), "realtime: connected");
                if events
                    .send(TransportEvent::Status(TransportStatus::Connected))
                    .await
                    .is_err()
                {
                    return;
                }
                // Frames queued while disconnected are stale; joins are replayed below.
                while outbound.try_recv().is_ok() {}
                match run_session(stream, &topics, &mut outbound, &events).await {
                    SessionEnd::Closed => return,
                    SessionEnd::Disconnected => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "realtime: connect failed");
            }
        }

        attempt += 1;
        let Some(delay) = policy.delay_for(attempt) else {
            warn!(attempts = policy.max_attempts, "realtime: giving up on reconnect");
            let _ = events
                .send(TransportEvent::Status(TransportStatus::GaveUp))
                .await;
            return;
        };
        info!(attempt, delay_ms = delay.as_millis() as u64, "realtime: reconnecting");
        if events
            .send(TransportEvent::Status(TransportStatus::Reconnecting {
                attempt,
                delay,
            }))
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

async fn run_session<S>(
    stream: S,
    topics: &Arc<Mutex<HashSet<String>>>,
    outbound: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    events: &mpsc::Sender<TransportEvent>,
) -> SessionEnd
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut writer, mut reader) = stream.split();

    let joined: Vec<String> = lock(topics).iter().cloned().collect();
    for topic in joined {
        if let Err(err) = write_frame(&mut writer, &OutboundFrame::Join { topic }).await {
            warn!(error = %err, "realtime: failed to re-join topic");
            return SessionEnd::Disconnected;
        }
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return SessionEnd::Closed;
                };
                if let Err(err) = write_frame(&mut writer, &frame).await {
                    warn!(error = %err, "realtime: send failed");
                    return SessionEnd::Disconnected;
                }
            }
            message = reader.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(frame) => {
                        if events.send(TransportEvent::Frame(frame)).await.is_err() {
                            return SessionEnd::Closed;
                        }
                    }
                    Err(err) => warn!(error = %err, "realtime: dropping undecodable frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!("realtime: socket closed");
                    return SessionEnd::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "realtime: receive failed");
                    return SessionEnd::Disconnected;
                }
            }
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &OutboundFrame) -> Result<()>
where
    W: futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    writer.send(WsMessage::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
