use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConversationSummary, DeliveryStatus, GroupId, GroupMember, MediaRef, Message, MessageId,
        MessageKind, ThreadKey, TypingUser, UserId, UserProfile,
    },
    error::{ApiError, ApiResult},
    protocol::{
        thread_topic, AddMemberRequest, BroadcastEvent, CreateGroupRequest, EditMessageRequest,
        FetchMessagesRequest, InboundFrame, MarkReadRequest, MediaUpload, MessagesReadPayload,
        ResetUnreadRequest, SendMessageRequest, TypingPayload, EVENT_MESSAGES_READ, EVENT_TYPING,
    },
    validation::{validate_group_name, validate_outgoing, validate_search_query, validate_text_message},
};
use storage::{EnqueueOutcome, QueuedSend, Storage, ThreadPreferences};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod backend;
pub mod cache;
pub mod config;
pub mod conversations;
pub mod http_backend;
pub mod ingest;
pub mod offline_queue;
pub mod optimistic;
pub mod pagination;
pub mod transport;
pub mod typing;
pub mod unread;
pub mod view;

pub use backend::{BroadcastSink, ChatBackend, MissingBroadcastSink, MissingChatBackend};
pub use cache::{CacheNotification, CacheStore, ListKind, MessagePages, QueryKey};
pub use config::{load_settings, EngineSettings};
pub use http_backend::HttpChatBackend;
pub use offline_queue::{DrainCancel, DrainReport, DrainStep, OfflineQueue};
pub use pagination::{ScrollAnchor, ScrollViewport};
pub use transport::{BackoffPolicy, RealtimeTransport, TransportEvent, TransportStatus};

use conversations::{apply_preferences, hide_tombstoned, set_unread, upsert_summary};
use ingest::{IngestEffects, IngestEvent, Ingestor};
use pagination::{
    append_older_page, merge_initial_page, restore_scroll, trim_for_switch, InFlightFetches,
    SCROLL_RESTORE_MAX_FRAMES,
};
use typing::TypingTracker;
use view::ViewState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SendFailed {
        thread: ThreadKey,
        message_id: MessageId,
        error: ApiError,
    },
    EditFailed {
        thread: ThreadKey,
        message_id: MessageId,
        error: ApiError,
    },
    QueuedSendDropped {
        thread: ThreadKey,
        message_id: MessageId,
        error: ApiError,
    },
    SearchFailed {
        query: String,
        error: ApiError,
    },
    TypingChanged {
        thread: ThreadKey,
        typists: Vec<TypingUser>,
        label: Option<String>,
    },
    TransportStatus(TransportStatus),
    Error(String),
}

/// Client-side reconciliation engine. Owns the cache and applies optimistic writes,
/// realtime events and fetched pages to it.
pub struct ChatEngine {
    settings: EngineSettings,
    session: Session,
    backend: Arc<dyn ChatBackend>,
    storage: Storage,
    cache: Arc<CacheStore>,
    view: Arc<ViewState>,
    ingestor: Ingestor,
    typing: TypingTracker,
    offline: OfflineQueue,
    fetches: InFlightFetches,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<ClientEvent>,
}

struct EngineState {
    sink: Arc<dyn BroadcastSink>,
    transport: Option<Arc<RealtimeTransport>>,
    pump_task: Option<JoinHandle<()>>,
    drain_task: Option<JoinHandle<()>>,
    drain_cancel: DrainCancel,
    reconnecting: bool,
    preferences: ThreadPreferences,
    tombstones: HashMap<ThreadKey, DateTime<Utc>>,
}

fn queued_to_message(entry: &QueuedSend) -> Message {
    Message {
        id: entry.message_id.clone(),
        thread: entry.thread.clone(),
        sender_id: entry.sender_id.clone(),
        content: Some(entry.content.clone()),
        kind: MessageKind::Text,
        media: None,
        status: DeliveryStatus::Sending,
        is_edited: false,
        is_deleted: false,
        created_at: entry.enqueued_at,
        updated_at: entry.enqueued_at,
    }
}

impl ChatEngine {
    pub fn new(settings: EngineSettings, session: Session, storage: Storage) -> Arc<Self> {
        let backend = Arc::new(HttpChatBackend::new(
            settings.api_url.clone(),
            session.access_token.clone(),
        ));
        Self::new_with_dependencies(settings, session, storage, backend, Arc::new(MissingBroadcastSink))
    }

    pub fn new_with_dependencies(
        settings: EngineSettings,
        session: Session,
        storage: Storage,
        backend: Arc<dyn ChatBackend>,
        sink: Arc<dyn BroadcastSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let cache = Arc::new(CacheStore::new());
        let view = Arc::new(ViewState::default());
        let ingestor = Ingestor::new(
            Arc::clone(&cache),
            Arc::clone(&view),
            settings.reconcile_window(),
        );
        let typing = TypingTracker::new(
            settings.typing_expiry(),
            settings.typing_collapse_threshold,
            events.clone(),
        );
        let offline = OfflineQueue::new(
            storage.clone(),
            session.user_id.clone(),
            settings.offline_max_retries,
        );
        Arc::new(Self {
            settings,
            session,
            backend,
            storage,
            cache,
            view,
            ingestor,
            typing,
            offline,
            fetches: InFlightFetches::default(),
            inner: Mutex::new(EngineState {
                sink,
                transport: None,
                pump_task: None,
                drain_task: None,
                drain_cancel: DrainCancel::default(),
                reconnecting: false,
                preferences: ThreadPreferences::default(),
                tombstones: HashMap::new(),
            }),
            events,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn view(&self) -> &Arc<ViewState> {
        &self.view
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.offline
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn messages(&self, thread: &ThreadKey) -> Vec<Message> {
        self.cache
            .messages(thread)
            .map(|pages| pages.display_order())
            .unwrap_or_default()
    }

    pub fn thread_list(&self, kind: ListKind) -> Vec<ConversationSummary> {
        self.cache.thread_list(kind).unwrap_or_default()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        match self.settings.tombstone_cutoff(Utc::now()) {
            Some(cutoff) => {
                let purged = self
                    .storage
                    .purge_tombstones_before(cutoff)
                    .await
                    .context("failed to purge expired tombstones")?;
                if purged > 0 {
                    info!(purged, "bootstrap: purged expired tombstones");
                }
            }
            None => warn!(
                ttl_days = self.settings.tombstone_ttl_days,
                "bootstrap: tombstone ttl out of range, skipping purge"
            ),
        }

        let preferences = self.storage.thread_preferences(&self.session.user_id).await?;
        let tombstones = self.storage.tombstones(&self.session.user_id).await?;
        {
            let mut guard = self.inner.lock().await;
            guard.preferences = preferences;
            guard.tombstones = tombstones;
        }

        for entry in self.offline.pending().await? {
            optimistic::insert_provisional(&self.cache, &queued_to_message(&entry));
        }

        for kind in [ListKind::Conversations, ListKind::Groups] {
            if let Err(err) = self.refresh_thread_list(kind).await {
                warn!(?kind, error = %err, "bootstrap: thread list fetch failed");
                self.emit(ClientEvent::Error(format!("failed to load {kind:?}: {err}")));
            }
        }

        if self.view.is_online() {
            self.start_drain().await;
        }
        Ok(())
    }

    pub async fn refresh_thread_list(&self, kind: ListKind) -> ApiResult<()> {
        let mut list = self.backend.list_threads(kind).await?;
        {
            let guard = self.inner.lock().await;
            hide_tombstoned(&mut list, &guard.tombstones);
            apply_preferences(&mut list, &guard.preferences);
        }
        if let Some(active) = self.view.active_thread() {
            if self.view.is_active_and_visible(&active) {
                set_unread(&mut list, &active, 0);
            }
        }
        self.cache.set_thread_list(kind, list);
        Ok(())
    }

    pub async fn connect_realtime(self: &Arc<Self>) -> Result<()> {
        let token = self
            .session
            .access_token
            .as_deref()
            .ok_or_else(|| anyhow!("not signed in: missing access token"))?;
        let url = transport::realtime_url(&self.settings.realtime_url(), token)?;
        let (transport, mut transport_events) =
            RealtimeTransport::spawn(url, self.settings.backoff());
        let transport = Arc::new(transport);

        let engine = Arc::downgrade(self);
        let pump_task = tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.handle_transport_event(event).await;
            }
        });

        let (old_transport, old_pump) = {
            let mut guard = self.inner.lock().await;
            guard.sink = transport.clone() as Arc<dyn BroadcastSink>;
            guard.reconnecting = false;
            (
                guard.transport.replace(Arc::clone(&transport)),
                guard.pump_task.replace(pump_task),
            )
        };
        if let Some(old_transport) = old_transport {
            old_transport.shutdown();
        }
        if let Some(old_pump) = old_pump {
            old_pump.abort();
        }

        if let Some(active) = self.view.active_thread() {
            transport.join(&thread_topic(&active)).await?;
        }
        Ok(())
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.handle_frame(frame).await,
            TransportEvent::Status(status) => {
                let recovered = {
                    let mut guard = self.inner.lock().await;
                    let recovered = status == TransportStatus::Connected && guard.reconnecting;
                    guard.reconnecting = matches!(status, TransportStatus::Reconnecting { .. });
                    recovered
                };
                self.emit(ClientEvent::TransportStatus(status));
                if recovered {
                    info!("realtime: reconnected, reconciling");
                    self.reconcile().await;
                }
            }
        }
    }

    pub async fn handle_frame(self: &Arc<Self>, frame: InboundFrame) {
        let event = match IngestEvent::from_frame(frame) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "ingest: dropping malformed realtime frame");
                return;
            }
        };

        let own_user = &self.session.user_id;
        match event {
            IngestEvent::Change(change) => {
                let effects = self.ingestor.apply_change(change, own_user);
                self.spawn_effects(effects);
            }
            IngestEvent::Broadcast(broadcast) => match &broadcast {
                BroadcastEvent::Typing { thread, payload } => {
                    self.typing.on_typing(thread, payload, own_user);
                }
                BroadcastEvent::MessagesRead { thread, .. } => {
                    let patched = self.ingestor.apply_read_receipt(&broadcast, own_user);
                    debug!(thread = %thread, patched, "ingest: applied read receipt");
                }
            },
        }
    }

    fn spawn_effects(self: &Arc<Self>, effects: IngestEffects) {
        if effects.is_empty() {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Some((thread, message_ids)) = effects.mark_read {
                engine.push_read(&thread, message_ids).await;
            }
            if let Some(thread) = effects.reset_unread {
                engine.reset_unread(&thread).await;
            }
            if let Some(kind) = effects.refetch_list {
                if let Err(err) = engine.refresh_thread_list(kind).await {
                    warn!(?kind, error = %err, "ingest: thread list refetch failed");
                }
            }
        });
    }

    async fn push_read(&self, thread: &ThreadKey, message_ids: Vec<MessageId>) {
        if message_ids.is_empty() {
            return;
        }
        let request = MarkReadRequest {
            thread: thread.clone(),
            reader_id: self.session.user_id.clone(),
            message_ids: message_ids.clone(),
        };
        if let Err(err) = self.backend.mark_read(request).await {
            warn!(thread = %thread, error = %err, "unread: mark-read failed");
            return;
        }
        let payload = MessagesReadPayload {
            reader_id: self.session.user_id.clone(),
            message_ids,
        };
        let sink = self.inner.lock().await.sink.clone();
        match serde_json::to_value(&payload) {
            Ok(payload) => {
                if let Err(err) = sink
                    .broadcast(&thread_topic(thread), EVENT_MESSAGES_READ, payload)
                    .await
                {
                    debug!(thread = %thread, error = %err, "unread: read receipt not broadcast");
                }
            }
            Err(err) => warn!(error = %err, "unread: failed to encode read receipt"),
        }
    }

    async fn reset_unread(&self, thread: &ThreadKey) {
        let request = ResetUnreadRequest {
            thread: thread.clone(),
            user_id: self.session.user_id.clone(),
        };
        if let Err(err) = self.backend.reset_unread(request).await {
            warn!(thread = %thread, error = %err, "unread: counter reset failed");
        }
    }

    pub async fn select_thread(self: &Arc<Self>, thread: Option<ThreadKey>) -> ApiResult<()> {
        let previous = self.view.set_active_thread(thread.clone());
        if previous == thread {
            return Ok(());
        }

        let sink = self.inner.lock().await.sink.clone();
        if let Some(previous) = &previous {
            if let Some(pages) = self.cache.messages(previous) {
                let trimmed = trim_for_switch(&pages, self.settings.retained_messages_on_switch);
                self.cache.update_existing_messages(previous, |current| *current = trimmed);
            }
            self.typing.clear_thread(previous);
            if let Err(err) = sink.leave(&thread_topic(previous)).await {
                debug!(thread = %previous, error = %err, "select: leave failed");
            }
        }

        let Some(thread) = thread else {
            return Ok(());
        };
        if let Err(err) = sink.join(&thread_topic(&thread)).await {
            debug!(thread = %thread, error = %err, "select: join failed");
        }

        let cached = self.cache.has_messages(&thread)
            && !self.cache.is_stale(&QueryKey::Messages(thread.clone()));
        if !cached {
            self.load_thread(&thread).await?;
        }
        if self.view.is_active_and_visible(&thread) {
            self.mark_thread_read(&thread).await?;
        }
        Ok(())
    }

    pub async fn load_thread(&self, thread: &ThreadKey) -> ApiResult<()> {
        let limit = self.settings.initial_page_size;
        let fetched = self
            .backend
            .fetch_messages(FetchMessagesRequest {
                thread: thread.clone(),
                before: None,
                limit,
            })
            .await?;
        let pages = merge_initial_page(self.cache.messages(thread).as_ref(), fetched, limit);
        self.cache.set_messages(thread, pages);
        Ok(())
    }

    pub async fn fetch_older(&self, thread: &ThreadKey) -> ApiResult<usize> {
        let Some(_guard) = self.fetches.begin(thread) else {
            return Ok(0);
        };
        let Some(pages) = self.cache.messages(thread) else {
            self.load_thread(thread).await?;
            return Ok(self.cache.messages(thread).map(|p| p.len()).unwrap_or(0));
        };
        let Some(before) = pages.oldest_cursor() else {
            return Ok(0);
        };

        let limit = self.settings.older_page_size;
        let fetched = self
            .backend
            .fetch_messages(FetchMessagesRequest {
                thread: thread.clone(),
                before: Some(before),
                limit,
            })
            .await?;
        let added = self
            .cache
            .update_existing_messages(thread, |pages| append_older_page(pages, fetched, limit))
            .unwrap_or(0);
        debug!(thread = %thread, added, "pagination: appended older page");
        Ok(added)
    }

    pub async fn fetch_older_anchored(
        &self,
        thread: &ThreadKey,
        viewport: &dyn ScrollViewport,
    ) -> ApiResult<usize> {
        let anchor = ScrollAnchor::capture(viewport);
        let added = self.fetch_older(thread).await?;
        if added > 0 {
            restore_scroll(viewport, anchor, SCROLL_RESTORE_MAX_FRAMES).await;
        }
        Ok(added)
    }

    pub async fn mark_thread_read(&self, thread: &ThreadKey) -> ApiResult<()> {
        let had_unread = self
            .cache
            .thread_summary(thread)
            .is_some_and(|summary| summary.unread_count > 0);
        let ids = unread::mark_thread_read_locally(&self.cache, &self.session.user_id, thread);
        self.push_read(thread, ids).await;
        if had_unread {
            self.reset_unread(thread).await;
        }
        Ok(())
    }

    /// Returns `true` when the view was hidden long enough to force a reconciliation.
    pub async fn set_visibility(&self, visible: bool) -> Result<bool> {
        let hidden_for = self.view.set_visible(visible);
        if !visible {
            return Ok(false);
        }

        let stale = hidden_for.is_some_and(|hidden| hidden >= self.settings.visibility_refresh_after());
        if stale {
            info!(hidden_secs = hidden_for.map(|d| d.as_secs()).unwrap_or_default(), "visibility: reconciling after long absence");
            self.reconcile().await;
        }
        if let Some(active) = self.view.active_thread() {
            self.mark_thread_read(&active).await?;
        }
        Ok(stale)
    }

    pub async fn reconcile(&self) {
        self.cache.invalidate(QueryKey::ThreadList(ListKind::Conversations));
        self.cache.invalidate(QueryKey::ThreadList(ListKind::Groups));
        let active = self.view.active_thread();
        if let Some(active) = &active {
            self.cache.invalidate(QueryKey::Messages(active.clone()));
        }

        for kind in [ListKind::Conversations, ListKind::Groups] {
            if let Err(err) = self.refresh_thread_list(kind).await {
                warn!(?kind, error = %err, "reconcile: thread list refetch failed");
            }
        }
        if let Some(active) = active {
            if let Err(err) = self.load_thread(&active).await {
                warn!(thread = %active, error = %err, "reconcile: thread refetch failed");
            }
        }
    }

    pub async fn set_online(self: &Arc<Self>, online: bool) {
        let was_online = self.view.set_online(online);
        match (was_online, online) {
            (false, true) => {
                info!("connectivity: online");
                self.start_drain().await;
            }
            (true, false) => {
                info!("connectivity: offline");
                self.inner.lock().await.drain_cancel.cancel();
            }
            _ => {}
        }
    }

    async fn start_drain(self: &Arc<Self>) {
        let cancel = DrainCancel::default();
        let mut guard = self.inner.lock().await;
        guard.drain_cancel.cancel();
        guard.drain_cancel = cancel.clone();
        // The cancelled drain finishes its in-flight entry before this one reads the queue.
        let previous = guard.drain_task.take();
        let engine = Arc::clone(self);
        guard.drain_task = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(err) = engine.drain_offline_queue(&cancel).await {
                warn!(error = %err, "offline queue: drain failed");
                engine.emit(ClientEvent::Error(format!("offline queue drain failed: {err}")));
            }
        }));
    }

    pub async fn wait_for_drain(&self) {
        let task = self.inner.lock().await.drain_task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub async fn drain_offline_queue(&self, cancel: &DrainCancel) -> Result<DrainReport> {
        let backend = Arc::clone(&self.backend);
        let report = self
            .offline
            .drain(
                cancel,
                |entry| {
                    let backend = Arc::clone(&backend);
                    async move {
                        backend
                            .send_message(SendMessageRequest {
                                thread: entry.thread,
                                sender_id: entry.sender_id,
                                content: Some(entry.content),
                                kind: MessageKind::Text,
                                media: None,
                            })
                            .await
                    }
                },
                |step| match step {
                    DrainStep::Sent { entry, message } => {
                        optimistic::confirm(&self.cache, &entry.message_id, message);
                    }
                    DrainStep::Retrying { .. } => {}
                    DrainStep::Dropped { entry, error } => {
                        optimistic::reject(&self.cache, &entry.thread, &entry.message_id);
                        self.emit(ClientEvent::QueuedSendDropped {
                            thread: entry.thread,
                            message_id: entry.message_id,
                            error,
                        });
                    }
                },
            )
            .await?;
        info!(
            sent = report.sent,
            retrying = report.retrying,
            dropped = report.dropped,
            cancelled = report.cancelled,
            "offline queue: drain finished"
        );
        Ok(report)
    }

    /// Shows a text message immediately and writes it in the background. While offline
    /// the message is queued instead. Returns the provisional id.
    pub async fn send_text(
        self: &Arc<Self>,
        thread: &ThreadKey,
        content: &str,
    ) -> ApiResult<MessageId> {
        validate_text_message(content, self.settings.max_message_length)?;
        let message = optimistic::fabricate(
            thread,
            &self.session.user_id,
            Some(content.to_string()),
            MessageKind::Text,
            None,
            Utc::now(),
        );
        let provisional_id = message.id.clone();
        optimistic::insert_provisional(&self.cache, &message);

        if !self.view.is_online() {
            let entry = QueuedSend {
                message_id: provisional_id.clone(),
                thread: thread.clone(),
                sender_id: self.session.user_id.clone(),
                content: content.to_string(),
                retry_count: 0,
                enqueued_at: message.created_at,
            };
            return match self.offline.enqueue(&entry).await {
                Ok(EnqueueOutcome::Queued | EnqueueOutcome::AlreadyQueued) => {
                    info!(thread = %thread, message_id = %provisional_id, "send: queued while offline");
                    Ok(provisional_id)
                }
                Ok(EnqueueOutcome::PreviouslyDropped) => {
                    let error = ApiError::network("message was already dropped");
                    self.fail_send(thread, &provisional_id, error.clone());
                    Err(error)
                }
                Err(err) => {
                    let error = ApiError::network(format!("failed to queue message: {err}"));
                    self.fail_send(thread, &provisional_id, error.clone());
                    Err(error)
                }
            };
        }

        let request = SendMessageRequest {
            thread: thread.clone(),
            sender_id: self.session.user_id.clone(),
            content: Some(content.to_string()),
            kind: MessageKind::Text,
            media: None,
        };
        let engine = Arc::clone(self);
        let id = provisional_id.clone();
        tokio::spawn(async move {
            let _ = engine.complete_send(&id, request).await;
        });
        Ok(provisional_id)
    }

    pub async fn send_image(
        self: &Arc<Self>,
        thread: &ThreadKey,
        upload: MediaUpload,
        caption: Option<String>,
    ) -> ApiResult<MessageId> {
        let local_media = MediaRef {
            url: format!("local://{}", upload.filename),
            width: upload.width,
            height: upload.height,
        };
        validate_outgoing(
            MessageKind::Image,
            caption.as_deref(),
            Some(&local_media),
            self.settings.max_message_length,
        )?;
        if !self.view.is_online() {
            return Err(ApiError::network("cannot send images while offline"));
        }

        let message = optimistic::fabricate(
            thread,
            &self.session.user_id,
            caption.clone(),
            MessageKind::Image,
            Some(local_media),
            Utc::now(),
        );
        let provisional_id = message.id.clone();
        optimistic::insert_provisional(&self.cache, &message);

        let engine = Arc::clone(self);
        let id = provisional_id.clone();
        let thread = thread.clone();
        tokio::spawn(async move {
            let media = match engine.backend.upload_media(upload).await {
                Ok(media) => media,
                Err(error) => {
                    engine.fail_send(&thread, &id, error);
                    return;
                }
            };
            let request = SendMessageRequest {
                thread,
                sender_id: engine.session.user_id.clone(),
                content: caption,
                kind: MessageKind::Image,
                media: Some(media),
            };
            let _ = engine.complete_send(&id, request).await;
        });
        Ok(provisional_id)
    }

    async fn complete_send(
        &self,
        provisional_id: &MessageId,
        request: SendMessageRequest,
    ) -> ApiResult<Message> {
        let thread = request.thread.clone();
        match self.backend.send_message(request).await {
            Ok(message) => {
                optimistic::confirm(&self.cache, provisional_id, message.clone());
                Ok(message)
            }
            Err(error) => {
                self.fail_send(&thread, provisional_id, error.clone());
                Err(error)
            }
        }
    }

    fn fail_send(&self, thread: &ThreadKey, provisional_id: &MessageId, error: ApiError) {
        warn!(thread = %thread, message_id = %provisional_id, error = %error, "send: durable write failed");
        optimistic::reject(&self.cache, thread, provisional_id);
        self.emit(ClientEvent::SendFailed {
            thread: thread.clone(),
            message_id: provisional_id.clone(),
            error,
        });
    }

    pub async fn edit_message(
        &self,
        thread: &ThreadKey,
        message_id: &MessageId,
        content: &str,
    ) -> ApiResult<()> {
        validate_text_message(content, self.settings.max_message_length)?;
        if message_id.is_provisional() {
            return Err(ApiError::validation("Message is still sending"));
        }
        let previous = optimistic::apply_edit(&self.cache, thread, message_id, content, Utc::now())
            .ok_or_else(|| ApiError::not_found("Message not found"))?;

        let request = EditMessageRequest {
            thread: thread.clone(),
            message_id: message_id.clone(),
            content: content.to_string(),
        };
        match self.backend.edit_message(request).await {
            Ok(updated) => {
                self.ingestor.ingest_update(updated);
                Ok(())
            }
            Err(error) => {
                warn!(thread = %thread, message_id = %message_id, error = %error, "edit: reverting");
                optimistic::revert_edit(&self.cache, &previous, content);
                self.emit(ClientEvent::EditFailed {
                    thread: thread.clone(),
                    message_id: message_id.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    pub async fn notify_typing(&self, thread: &ThreadKey, is_typing: bool) -> Result<()> {
        let payload = TypingPayload {
            user_id: self.session.user_id.clone(),
            display_name: self.session.display_name.clone(),
            avatar_url: self.session.avatar_url.clone(),
            is_typing,
        };
        let sink = self.inner.lock().await.sink.clone();
        sink.broadcast(&thread_topic(thread), EVENT_TYPING, serde_json::to_value(payload)?)
            .await
    }

    pub async fn toggle_pinned(&self, thread: &ThreadKey) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let pinned = !guard.preferences.pinned.contains(thread);
        self.storage
            .set_pinned(&self.session.user_id, thread, pinned)
            .await?;
        if pinned {
            guard.preferences.pinned.insert(thread.clone());
        } else {
            guard.preferences.pinned.remove(thread);
        }
        let preferences = guard.preferences.clone();
        drop(guard);

        self.cache
            .update_thread_list(ListKind::of(thread), |list| apply_preferences(list, &preferences));
        Ok(pinned)
    }

    pub async fn toggle_favorite(&self, thread: &ThreadKey) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let favorite = !guard.preferences.favorites.contains(thread);
        self.storage
            .set_favorite(&self.session.user_id, thread, favorite)
            .await?;
        if favorite {
            guard.preferences.favorites.insert(thread.clone());
        } else {
            guard.preferences.favorites.remove(thread);
        }
        let preferences = guard.preferences.clone();
        drop(guard);

        self.cache
            .update_thread_list(ListKind::of(thread), |list| apply_preferences(list, &preferences));
        Ok(favorite)
    }

    pub async fn delete_thread_for_me(self: &Arc<Self>, thread: &ThreadKey) -> Result<()> {
        let deleted_at = Utc::now();
        self.storage
            .set_tombstone(&self.session.user_id, thread, deleted_at)
            .await?;
        self.inner
            .lock()
            .await
            .tombstones
            .insert(thread.clone(), deleted_at);

        self.cache.update_thread_list(ListKind::of(thread), |list| {
            list.retain(|entry| &entry.thread != thread)
        });
        if self.view.active_thread().as_ref() == Some(thread) {
            self.select_thread(None)
                .await
                .map_err(|err| anyhow!("failed to close deleted thread: {err}"))?;
        }
        self.cache.remove_messages(thread);
        info!(thread = %thread, "delete-for-me: thread hidden");
        Ok(())
    }

    pub async fn create_group(
        &self,
        name: &str,
        member_ids: Vec<UserId>,
    ) -> ApiResult<ConversationSummary> {
        validate_group_name(name)?;
        let summary = self
            .backend
            .create_group(CreateGroupRequest {
                name: name.trim().to_string(),
                owner_id: self.session.user_id.clone(),
                member_ids,
            })
            .await?;
        self.cache.update_thread_list(ListKind::Groups, |list| {
            upsert_summary(list, summary.clone())
        });
        Ok(summary)
    }

    pub async fn add_member(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<GroupMember> {
        let member = self
            .backend
            .add_member(AddMemberRequest {
                group_id: group_id.clone(),
                user_id: user_id.clone(),
            })
            .await?;
        self.cache.update_members(group_id, |members| {
            if !members.iter().any(|existing| existing.user_id == member.user_id) {
                members.push(member.clone());
            }
        });
        Ok(member)
    }

    pub async fn load_members(&self, group_id: &GroupId) -> ApiResult<Vec<GroupMember>> {
        let members = self.backend.list_members(group_id).await?;
        self.cache.set_members(group_id, members.clone());
        Ok(members)
    }

    /// Failures yield an empty result and a [`ClientEvent::SearchFailed`].
    pub async fn search_users(&self, query: &str) -> Vec<UserProfile> {
        let result = match validate_search_query(query) {
            Ok(()) => self.backend.search_users(query.trim()).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(users) => users,
            Err(error) => {
                warn!(error = %error, "search: failed");
                self.emit(ClientEvent::SearchFailed {
                    query: query.to_string(),
                    error,
                });
                Vec::new()
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        guard.drain_cancel.cancel();
        if let Some(task) = guard.drain_task.take() {
            task.abort();
        }
        if let Some(task) = guard.pump_task.take() {
            task.abort();
        }
        if let Some(transport) = guard.transport.take() {
            transport.shutdown();
        }
        guard.sink = Arc::new(MissingBroadcastSink);
        drop(guard);
        self.typing.clear_all();
        info!("engine: shut down");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
