use super::*;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone};
use serde_json::{json, Value};
use shared::{
    domain::GroupRole,
    error::ErrorCode,
    protocol::ChangeOperation,
};
use tokio::{sync::Notify, time::timeout};

#[derive(Default)]
struct FakeBackend {
    calls: StdMutex<Vec<String>>,
    lists: StdMutex<HashMap<ListKind, Vec<ConversationSummary>>>,
    history: StdMutex<HashMap<ThreadKey, Vec<Message>>>,
    members: StdMutex<HashMap<GroupId, Vec<GroupMember>>>,
    mark_reads: StdMutex<Vec<MarkReadRequest>>,
    resets: StdMutex<Vec<ResetUnreadRequest>>,
    fail_sends: AtomicBool,
    fail_edits: AtomicBool,
    fail_search: AtomicBool,
    hold_sends: AtomicBool,
    release: Notify,
    next_id: AtomicU32,
}

impl FakeBackend {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls").push(call.into());
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn with_list(self, kind: ListKind, list: Vec<ConversationSummary>) -> Self {
        self.replace_list(kind, list);
        self
    }

    fn replace_list(&self, kind: ListKind, list: Vec<ConversationSummary>) {
        self.lists.lock().expect("lists").insert(kind, list);
    }

    /// `messages` newest first.
    fn with_history(self, thread: ThreadKey, messages: Vec<Message>) -> Self {
        self.history.lock().expect("history").insert(thread, messages);
        self
    }

    fn mark_reads(&self) -> Vec<MarkReadRequest> {
        self.mark_reads.lock().expect("mark reads").clone()
    }

    fn resets(&self) -> usize {
        self.resets.lock().expect("resets").len()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn send_message(&self, request: SendMessageRequest) -> ApiResult<Message> {
        self.record(format!("send {}", request.thread));
        if self.hold_sends.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ApiError::network("send failed"));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let message = Message {
            id: MessageId::new(format!("m-{n}")),
            thread: request.thread.clone(),
            sender_id: request.sender_id,
            content: request.content,
            kind: request.kind,
            media: request.media,
            status: DeliveryStatus::Sent,
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };
        self.history
            .lock()
            .expect("history")
            .entry(request.thread)
            .or_default()
            .insert(0, message.clone());
        Ok(message)
    }

    async fn edit_message(&self, request: EditMessageRequest) -> ApiResult<Message> {
        self.record(format!("edit {}", request.message_id));
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(ApiError::new(ErrorCode::PermissionDenied, "not your message"));
        }
        let mut history = self.history.lock().expect("history");
        let message = history
            .get_mut(&request.thread)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == request.message_id))
            .ok_or_else(|| ApiError::not_found("Message not found"))?;
        message.content = Some(request.content);
        message.is_edited = true;
        message.updated_at = Utc::now();
        Ok(message.clone())
    }

    async fn mark_read(&self, request: MarkReadRequest) -> ApiResult<()> {
        self.record("mark_read");
        self.mark_reads.lock().expect("mark reads").push(request);
        Ok(())
    }

    async fn reset_unread(&self, request: ResetUnreadRequest) -> ApiResult<()> {
        self.record("reset_unread");
        self.resets.lock().expect("resets").push(request);
        Ok(())
    }

    async fn add_member(&self, request: AddMemberRequest) -> ApiResult<GroupMember> {
        self.record("add_member");
        Ok(GroupMember {
            group_id: request.group_id,
            user_id: request.user_id.clone(),
            display_name: format!("user {}", request.user_id),
            role: GroupRole::Member,
            joined_at: Utc::now(),
        })
    }

    async fn create_group(&self, request: CreateGroupRequest) -> ApiResult<ConversationSummary> {
        self.record("create_group");
        let mut summary = ConversationSummary::new(ThreadKey::group("g-new"), request.name);
        summary.participant_ids = request.member_ids;
        Ok(summary)
    }

    async fn search_users(&self, query: &str) -> ApiResult<Vec<UserProfile>> {
        self.record(format!("search {query}"));
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(ApiError::network("search down"));
        }
        Ok(vec![UserProfile {
            user_id: UserId::new("u-9"),
            display_name: query.to_string(),
            avatar_url: None,
        }])
    }

    async fn upload_media(&self, upload: MediaUpload) -> ApiResult<MediaRef> {
        self.record("upload");
        Ok(MediaRef {
            url: format!("https://cdn.example/{}", upload.filename),
            width: upload.width,
            height: upload.height,
        })
    }

    async fn list_threads(&self, kind: ListKind) -> ApiResult<Vec<ConversationSummary>> {
        self.record(format!("list {kind:?}"));
        Ok(self
            .lists
            .lock()
            .expect("lists")
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_members(&self, group_id: &GroupId) -> ApiResult<Vec<GroupMember>> {
        self.record("list_members");
        Ok(self
            .members
            .lock()
            .expect("members")
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_messages(&self, request: FetchMessagesRequest) -> ApiResult<Vec<Message>> {
        self.record(format!("fetch {}", request.thread));
        let history = self.history.lock().expect("history");
        Ok(history
            .get(&request.thread)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| request.before.map_or(true, |before| m.created_at < before))
                    .take(request.limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeSink {
    joined: StdMutex<Vec<String>>,
    left: StdMutex<Vec<String>>,
    broadcasts: StdMutex<Vec<(String, String, Value)>>,
}

#[async_trait]
impl BroadcastSink for FakeSink {
    async fn join(&self, topic: &str) -> Result<()> {
        self.joined.lock().expect("joined").push(topic.to_string());
        Ok(())
    }

    async fn leave(&self, topic: &str) -> Result<()> {
        self.left.lock().expect("left").push(topic.to_string());
        Ok(())
    }

    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> Result<()> {
        self.broadcasts
            .lock()
            .expect("broadcasts")
            .push((topic.to_string(), event.to_string(), payload));
        Ok(())
    }
}

fn base_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_690_000_000 + secs, 0).single().expect("timestamp")
}

fn direct() -> ThreadKey {
    ThreadKey::direct("c-1")
}

fn other_direct() -> ThreadKey {
    ThreadKey::direct("c-2")
}

fn summary(thread: ThreadKey, last_secs: i64, unread: u32) -> ConversationSummary {
    let mut entry = ConversationSummary::new(thread.clone(), format!("chat {thread}"));
    entry.last_message_time = Some(base_time(last_secs));
    entry.unread_count = unread;
    entry
}

fn inbound(id: &str, thread: &ThreadKey, secs: i64) -> Message {
    Message {
        id: MessageId::new(id),
        thread: thread.clone(),
        sender_id: UserId::new("u-2"),
        content: Some(format!("text {id}")),
        kind: MessageKind::Text,
        media: None,
        status: DeliveryStatus::Delivered,
        is_edited: false,
        is_deleted: false,
        created_at: base_time(secs),
        updated_at: base_time(secs),
    }
}

/// `count` inbound messages, newest first.
fn inbound_history(thread: &ThreadKey, count: i64) -> Vec<Message> {
    (0..count)
        .rev()
        .map(|i| inbound(&format!("h-{i}"), thread, i))
        .collect()
}

fn session() -> Session {
    Session {
        user_id: UserId::new("u-1"),
        display_name: "Ada".into(),
        avatar_url: None,
        access_token: Some("token".into()),
    }
}

fn test_settings() -> EngineSettings {
    EngineSettings {
        visibility_refresh_after_secs: 0,
        offline_max_retries: 2,
        ..EngineSettings::default()
    }
}

fn default_backend() -> FakeBackend {
    FakeBackend::default()
        .with_list(
            ListKind::Conversations,
            vec![summary(direct(), 10, 0), summary(other_direct(), 5, 0)],
        )
        .with_list(ListKind::Groups, Vec::new())
}

async fn engine_with(backend: Arc<FakeBackend>) -> (Arc<ChatEngine>, Arc<FakeSink>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    engine_on(storage, backend).await
}

async fn engine_on(storage: Storage, backend: Arc<FakeBackend>) -> (Arc<ChatEngine>, Arc<FakeSink>) {
    let sink = Arc::new(FakeSink::default());
    let engine = ChatEngine::new_with_dependencies(
        test_settings(),
        session(),
        storage,
        backend,
        sink.clone(),
    );
    for kind in [ListKind::Conversations, ListKind::Groups] {
        engine.refresh_thread_list(kind).await.expect("list");
    }
    (engine, sink)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn expect_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    wanted: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("event in time")
}

fn change_frame(table: &str, row: Value) -> InboundFrame {
    InboundFrame::Change {
        table: table.to_string(),
        operation: ChangeOperation::Insert,
        row,
    }
}

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.0.clone()).collect()
}

#[tokio::test]
async fn send_shows_provisional_then_confirms() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");

    let provisional = engine.send_text(&direct(), "hello").await.expect("send");
    assert!(provisional.is_provisional());
    let shown = engine.messages(&direct());
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].status, DeliveryStatus::Sending);
    assert_eq!(
        engine.thread_list(ListKind::Conversations)[0].thread,
        direct(),
        "sending bumps the thread to the top"
    );

    wait_until(|| ids(&engine.messages(&direct())) == vec!["m-1"]).await;
    assert_eq!(engine.messages(&direct())[0].status, DeliveryStatus::Sent);

    let echo = change_frame(
        "messages",
        json!({
            "id": "m-1",
            "conversation_id": "c-1",
            "sender_id": "u-1",
            "content": "hello",
            "created_at": Utc::now().to_rfc3339(),
        }),
    );
    engine.handle_frame(echo).await;
    assert_eq!(ids(&engine.messages(&direct())), vec!["m-1"]);
}

#[tokio::test]
async fn echo_before_response_reconciles_to_one_entry() {
    let backend = Arc::new(default_backend());
    backend.hold_sends.store(true, Ordering::SeqCst);
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");

    let provisional = engine.send_text(&direct(), "race").await.expect("send");
    let sent_at = engine.messages(&direct())[0].created_at;

    let echo = change_frame(
        "messages",
        json!({
            "id": "m-1",
            "conversation_id": "c-1",
            "sender_id": "u-1",
            "content": "race",
            "created_at": (sent_at + ChronoDuration::milliseconds(800)).to_rfc3339(),
        }),
    );
    engine.handle_frame(echo).await;
    let shown = engine.messages(&direct());
    assert_eq!(ids(&shown), vec!["m-1"]);
    assert_eq!(shown[0].created_at, sent_at);

    backend.release.notify_one();
    wait_until(|| backend.count("send") == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let shown = engine.messages(&direct());
    assert_eq!(ids(&shown), vec!["m-1"]);
    assert!(!shown.iter().any(|m| m.id == provisional));
}

#[tokio::test]
async fn failed_send_rolls_back_and_notifies() {
    let backend = Arc::new(default_backend());
    backend.fail_sends.store(true, Ordering::SeqCst);
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    let mut events = engine.subscribe_events();

    let provisional = engine.send_text(&direct(), "doomed").await.expect("send");
    let event = expect_event(&mut events, |e| matches!(e, ClientEvent::SendFailed { .. })).await;
    match event {
        ClientEvent::SendFailed {
            message_id, error, ..
        } => {
            assert_eq!(message_id, provisional);
            assert!(error.is_network());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(engine.messages(&direct()).is_empty());
    let preview = engine
        .cache()
        .thread_summary(&direct())
        .and_then(|s| s.last_message);
    assert!(preview.is_none());
}

#[tokio::test]
async fn invalid_text_is_rejected_before_any_write() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    let err = engine.send_text(&direct(), "   ").await.expect_err("blank");
    assert_eq!(err.code, ErrorCode::Validation);
    assert!(engine.messages(&direct()).is_empty());
    assert_eq!(backend.count("send"), 0);
}

#[tokio::test]
async fn offline_send_is_queued_and_drained_on_reconnect() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    engine.set_online(false).await;

    engine.send_text(&direct(), "first").await.expect("queue first");
    engine.send_text(&direct(), "second").await.expect("queue second");
    assert_eq!(backend.count("send"), 0);
    assert_eq!(engine.offline_queue().len().await.expect("len"), 2);
    assert!(engine
        .messages(&direct())
        .iter()
        .all(|m| m.status == DeliveryStatus::Sending));

    engine.set_online(true).await;
    engine.wait_for_drain().await;

    assert_eq!(engine.offline_queue().len().await.expect("len"), 0);
    let shown = engine.messages(&direct());
    assert_eq!(ids(&shown), vec!["m-1", "m-2"]);
    assert_eq!(shown[0].content.as_deref(), Some("first"));
}

#[tokio::test]
async fn queued_send_is_dropped_after_retry_ceiling() {
    let backend = Arc::new(default_backend());
    backend.fail_sends.store(true, Ordering::SeqCst);
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    let mut events = engine.subscribe_events();

    engine.set_online(false).await;
    let provisional = engine.send_text(&direct(), "never").await.expect("queue");

    engine.set_online(true).await;
    engine.wait_for_drain().await;
    assert_eq!(engine.offline_queue().len().await.expect("len"), 1);
    assert_eq!(engine.messages(&direct()).len(), 1);

    engine.set_online(false).await;
    engine.set_online(true).await;
    engine.wait_for_drain().await;

    let event = expect_event(&mut events, |e| matches!(e, ClientEvent::QueuedSendDropped { .. })).await;
    assert!(matches!(event, ClientEvent::QueuedSendDropped { message_id, .. } if message_id == provisional));
    assert_eq!(engine.offline_queue().len().await.expect("len"), 0);
    assert!(engine.messages(&direct()).is_empty());
    assert_eq!(backend.count("send"), 2);
}

#[tokio::test]
async fn reconnect_during_drain_still_sends_every_entry() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    engine.set_online(false).await;
    engine.send_text(&direct(), "a").await.expect("queue a");
    engine.send_text(&direct(), "b").await.expect("queue b");

    backend.hold_sends.store(true, Ordering::SeqCst);
    engine.set_online(true).await;
    wait_until(|| backend.count("send") == 1).await;
    engine.set_online(false).await;
    engine.set_online(true).await;

    backend.hold_sends.store(false, Ordering::SeqCst);
    backend.release.notify_one();
    engine.wait_for_drain().await;

    assert!(engine.view().is_online());
    assert_eq!(engine.offline_queue().len().await.expect("len"), 0);
    assert_eq!(backend.count("send"), 2);
    let shown = engine.messages(&direct());
    assert_eq!(ids(&shown), vec!["m-1", "m-2"]);
    assert_eq!(shown[1].content.as_deref(), Some("b"));
}

#[tokio::test]
async fn bootstrap_restores_and_drains_queued_sends() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let backend = Arc::new(default_backend());
    {
        let (engine, _sink) = engine_on(storage.clone(), backend.clone()).await;
        engine.set_online(false).await;
        engine.send_text(&direct(), "survives restart").await.expect("queue");
        engine.shutdown().await;
    }

    let (engine, _sink) = engine_on(storage, backend.clone()).await;
    engine.bootstrap().await.expect("bootstrap");
    engine.wait_for_drain().await;

    assert_eq!(engine.offline_queue().len().await.expect("len"), 0);
    assert_eq!(backend.count("send"), 1);
    let cached = engine.cache().messages(&direct()).expect("restored thread");
    assert_eq!(cached.newest().map(|m| m.id.0.as_str()), Some("m-1"));
}

#[tokio::test]
async fn bootstrap_keeps_tombstones_when_ttl_overflows() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let old = Utc::now() - ChronoDuration::days(400);
    storage
        .set_tombstone(&UserId::new("u-1"), &other_direct(), old)
        .await
        .expect("tombstone");
    let settings = EngineSettings {
        tombstone_ttl_days: i64::MAX,
        ..test_settings()
    };
    let engine = ChatEngine::new_with_dependencies(
        settings,
        session(),
        storage.clone(),
        Arc::new(default_backend()),
        Arc::new(FakeSink::default()),
    );

    engine.bootstrap().await.expect("bootstrap");
    let tombstones = storage.tombstones(&UserId::new("u-1")).await.expect("tombstones");
    assert!(tombstones.contains_key(&other_direct()));
    let shown: Vec<ThreadKey> = engine
        .thread_list(ListKind::Conversations)
        .into_iter()
        .map(|entry| entry.thread)
        .collect();
    assert_eq!(shown, vec![direct()]);
}

#[tokio::test]
async fn failed_edit_reverts_and_notifies() {
    let mut own = inbound("m-7", &direct(), 1);
    own.sender_id = UserId::new("u-1");
    own.content = Some("before".into());
    let backend = Arc::new(default_backend().with_history(direct(), vec![own.clone()]));
    backend.fail_edits.store(true, Ordering::SeqCst);
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    let mut events = engine.subscribe_events();

    let err = engine
        .edit_message(&direct(), &own.id, "after")
        .await
        .expect_err("rejected");
    assert_eq!(err.code, ErrorCode::PermissionDenied);

    let shown = engine.messages(&direct());
    assert_eq!(shown[0].content.as_deref(), Some("before"));
    assert!(!shown[0].is_edited);
    expect_event(&mut events, |e| matches!(e, ClientEvent::EditFailed { .. })).await;
}

#[tokio::test]
async fn successful_edit_applies_server_copy() {
    let mut own = inbound("m-7", &direct(), 1);
    own.sender_id = UserId::new("u-1");
    let backend = Arc::new(default_backend().with_history(direct(), vec![own.clone()]));
    let (engine, _sink) = engine_with(backend).await;
    engine.select_thread(Some(direct())).await.expect("select");

    engine
        .edit_message(&direct(), &own.id, "after")
        .await
        .expect("edit");
    let shown = engine.messages(&direct());
    assert_eq!(shown[0].content.as_deref(), Some("after"));
    assert!(shown[0].is_edited);
}

#[tokio::test]
async fn editing_a_sending_message_is_refused() {
    let backend = Arc::new(default_backend());
    backend.hold_sends.store(true, Ordering::SeqCst);
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    let provisional = engine.send_text(&direct(), "wait").await.expect("send");

    let err = engine
        .edit_message(&direct(), &provisional, "changed")
        .await
        .expect_err("still sending");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(backend.count("edit"), 0);
    backend.release.notify_one();
}

#[tokio::test]
async fn opening_a_thread_marks_it_read_and_broadcasts_receipt() {
    let backend = Arc::new(
        FakeBackend::default()
            .with_list(ListKind::Conversations, vec![summary(direct(), 10, 2)])
            .with_history(direct(), inbound_history(&direct(), 2)),
    );
    let (engine, sink) = engine_with(backend.clone()).await;

    engine.select_thread(Some(direct())).await.expect("select");

    let reads = backend.mark_reads();
    assert_eq!(reads.len(), 1);
    assert_eq!(
        reads[0].message_ids,
        vec![MessageId::new("h-0"), MessageId::new("h-1")]
    );
    assert_eq!(backend.resets(), 1);
    assert_eq!(
        engine.thread_list(ListKind::Conversations)[0].unread_count,
        0
    );
    assert!(engine
        .messages(&direct())
        .iter()
        .all(|m| m.status == DeliveryStatus::Read));

    let topic = thread_topic(&direct());
    assert_eq!(*sink.joined.lock().expect("joined"), vec![topic.clone()]);
    let broadcasts = sink.broadcasts.lock().expect("broadcasts").clone();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].0, topic);
    assert_eq!(broadcasts[0].1, EVENT_MESSAGES_READ);
    assert_eq!(broadcasts[0].2["reader_id"], "u-1");
}

#[tokio::test]
async fn switching_threads_trims_and_leaves_previous() {
    let backend = Arc::new(default_backend().with_history(direct(), inbound_history(&direct(), 30)));
    let (engine, sink) = engine_with(backend.clone()).await;

    engine.select_thread(Some(direct())).await.expect("select");
    assert_eq!(engine.messages(&direct()).len(), 16);
    assert_eq!(engine.fetch_older(&direct()).await.expect("older"), 5);
    assert_eq!(engine.messages(&direct()).len(), 21);

    engine.select_thread(Some(other_direct())).await.expect("switch");
    let trimmed = engine.cache().messages(&direct()).expect("still cached");
    assert_eq!(trimmed.len(), 20);
    assert_eq!(trimmed.pages.len(), 1);
    assert!(trimmed.has_more());
    assert_eq!(
        *sink.left.lock().expect("left"),
        vec![thread_topic(&direct())]
    );

    let fetches_before = backend.count("fetch direct:c-1");
    engine.select_thread(Some(direct())).await.expect("back");
    assert_eq!(backend.count("fetch direct:c-1"), fetches_before);
}

#[tokio::test]
async fn older_pages_run_until_history_is_exhausted() {
    let backend = Arc::new(default_backend().with_history(direct(), inbound_history(&direct(), 24)));
    let (engine, _sink) = engine_with(backend).await;
    engine.select_thread(Some(direct())).await.expect("select");

    assert_eq!(engine.fetch_older(&direct()).await.expect("page 2"), 5);
    assert_eq!(engine.fetch_older(&direct()).await.expect("page 3"), 3);
    assert_eq!(engine.fetch_older(&direct()).await.expect("exhausted"), 0);

    let shown = engine.messages(&direct());
    assert_eq!(shown.len(), 24);
    assert_eq!(shown.first().map(|m| m.id.0.as_str()), Some("h-0"));
    assert!(!engine.cache().messages(&direct()).expect("pages").has_more());
}

#[tokio::test]
async fn inbound_message_in_open_thread_is_marked_read() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");

    let frame = change_frame(
        "messages",
        json!({
            "id": "m-50",
            "conversation_id": "c-1",
            "sender_id": "u-2",
            "content": "ping",
            "created_at": Utc::now().to_rfc3339(),
        }),
    );
    engine.handle_frame(frame).await;

    wait_until(|| {
        backend
            .mark_reads()
            .iter()
            .any(|req| req.message_ids == vec![MessageId::new("m-50")])
    })
    .await;
    assert_eq!(engine.messages(&direct())[0].status, DeliveryStatus::Read);
}

#[tokio::test]
async fn message_for_unknown_thread_refetches_list() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    let lists_before = backend.count("list Conversations");

    let frame = change_frame(
        "messages",
        json!({
            "id": "m-60",
            "conversation_id": "c-unknown",
            "sender_id": "u-3",
            "content": "hello stranger",
            "created_at": Utc::now().to_rfc3339(),
        }),
    );
    engine.handle_frame(frame).await;
    wait_until(|| backend.count("list Conversations") > lists_before).await;
}

#[tokio::test]
async fn inbound_message_for_background_thread_moves_it_to_top() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    assert_eq!(engine.thread_list(ListKind::Conversations)[1].thread, other_direct());

    let frame = change_frame(
        "messages",
        json!({
            "id": "m-80",
            "conversation_id": "c-2",
            "sender_id": "u-3",
            "content": "over here",
            "created_at": Utc::now().to_rfc3339(),
        }),
    );
    engine.handle_frame(frame).await;
    engine
        .handle_frame(change_frame(
            "unread_counters",
            json!({ "user_id": "u-1", "conversation_id": "c-2", "unread_count": 1 }),
        ))
        .await;

    let top = &engine.thread_list(ListKind::Conversations)[0];
    assert_eq!(top.thread, other_direct());
    assert_eq!(top.unread_count, 1);
    assert_eq!(
        top.last_message.as_ref().map(|p| p.content.as_str()),
        Some("over here")
    );
    let cached = engine.cache().messages(&other_direct()).expect("cached in background");
    assert_eq!(cached.newest().map(|m| m.status), Some(DeliveryStatus::Delivered));
    assert!(backend.mark_reads().is_empty());
}

#[tokio::test]
async fn unread_counter_for_open_thread_is_reset() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    let resets_before = backend.resets();

    let frame = change_frame(
        "unread_counters",
        json!({ "user_id": "u-1", "conversation_id": "c-1", "unread_count": 3 }),
    );
    engine.handle_frame(frame).await;

    assert_eq!(engine.thread_list(ListKind::Conversations)[0].unread_count, 0);
    wait_until(|| backend.resets() > resets_before).await;
}

#[tokio::test]
async fn unread_counter_for_background_thread_is_shown() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    let frame = change_frame(
        "unread_counters",
        json!({ "user_id": "u-1", "conversation_id": "c-2", "unread_count": 4 }),
    );
    engine.handle_frame(frame).await;
    let entry = engine
        .cache()
        .thread_summary(&other_direct())
        .expect("summary");
    assert_eq!(entry.unread_count, 4);
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend).await;
    let before = engine.thread_list(ListKind::Conversations);

    engine
        .handle_frame(change_frame("messages", json!({ "id": 42 })))
        .await;
    engine
        .handle_frame(change_frame("audit_log", json!({})))
        .await;
    engine
        .handle_frame(InboundFrame::Broadcast {
            topic: "lobby".into(),
            event: "typing".into(),
            payload: json!({}),
        })
        .await;

    assert_eq!(engine.thread_list(ListKind::Conversations), before);
    assert!(engine.messages(&ThreadKey::direct("c-1")).is_empty());
}

#[tokio::test]
async fn typing_broadcast_updates_presence() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend).await;
    let mut events = engine.subscribe_events();

    engine
        .handle_frame(InboundFrame::Broadcast {
            topic: thread_topic(&direct()),
            event: EVENT_TYPING.into(),
            payload: json!({ "user_id": "u-2", "display_name": "Bo", "is_typing": true }),
        })
        .await;

    let event = expect_event(&mut events, |e| matches!(e, ClientEvent::TypingChanged { .. })).await;
    match event {
        ClientEvent::TypingChanged { thread, label, .. } => {
            assert_eq!(thread, direct());
            assert_eq!(label.as_deref(), Some("Bo is typing…"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(engine.typing().typists(&direct()).len(), 1);
}

#[tokio::test]
async fn read_receipt_broadcast_upgrades_own_messages() {
    let mut own = inbound("m-8", &direct(), 1);
    own.sender_id = UserId::new("u-1");
    own.status = DeliveryStatus::Delivered;
    let backend = Arc::new(default_backend().with_history(direct(), vec![own]));
    let (engine, _sink) = engine_with(backend).await;
    engine.select_thread(Some(direct())).await.expect("select");

    engine
        .handle_frame(InboundFrame::Broadcast {
            topic: thread_topic(&direct()),
            event: EVENT_MESSAGES_READ.into(),
            payload: json!({ "reader_id": "u-2", "message_ids": ["m-8"] }),
        })
        .await;
    assert_eq!(engine.messages(&direct())[0].status, DeliveryStatus::Read);
}

#[tokio::test]
async fn notify_typing_broadcasts_on_thread_topic() {
    let backend = Arc::new(default_backend());
    let (engine, sink) = engine_with(backend).await;
    engine.notify_typing(&direct(), true).await.expect("typing");

    let broadcasts = sink.broadcasts.lock().expect("broadcasts").clone();
    assert_eq!(broadcasts[0].0, thread_topic(&direct()));
    assert_eq!(broadcasts[0].1, EVENT_TYPING);
    assert_eq!(broadcasts[0].2["display_name"], "Ada");
    assert_eq!(broadcasts[0].2["is_typing"], true);
}

#[tokio::test]
async fn search_failure_yields_empty_result_and_event() {
    let backend = Arc::new(default_backend());
    backend.fail_search.store(true, Ordering::SeqCst);
    let (engine, _sink) = engine_with(backend.clone()).await;
    let mut events = engine.subscribe_events();

    assert!(engine.search_users("ada").await.is_empty());
    let event = expect_event(&mut events, |e| matches!(e, ClientEvent::SearchFailed { .. })).await;
    assert!(matches!(event, ClientEvent::SearchFailed { query, .. } if query == "ada"));

    backend.fail_search.store(false, Ordering::SeqCst);
    assert_eq!(engine.search_users("  bo ").await.len(), 1);
    assert_eq!(backend.count("search bo"), 1);
    assert!(engine.search_users("").await.is_empty());
}

#[tokio::test]
async fn pinning_persists_across_refresh() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend).await;
    assert_eq!(engine.thread_list(ListKind::Conversations)[0].thread, direct());

    assert!(engine.toggle_pinned(&other_direct()).await.expect("pin"));
    assert_eq!(engine.thread_list(ListKind::Conversations)[0].thread, other_direct());

    engine
        .refresh_thread_list(ListKind::Conversations)
        .await
        .expect("refresh");
    let list = engine.thread_list(ListKind::Conversations);
    assert_eq!(list[0].thread, other_direct());
    assert!(list[0].is_pinned);

    assert!(!engine.toggle_pinned(&other_direct()).await.expect("unpin"));
    assert_eq!(engine.thread_list(ListKind::Conversations)[0].thread, direct());
    assert!(engine.toggle_favorite(&direct()).await.expect("favorite"));
    assert!(engine.thread_list(ListKind::Conversations)[0].is_favorite);
}

#[tokio::test]
async fn deleted_thread_stays_hidden_until_new_activity() {
    let backend = Arc::new(default_backend());
    let (engine, sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");

    engine.delete_thread_for_me(&direct()).await.expect("delete");
    assert!(engine.view().active_thread().is_none());
    assert!(!engine.cache().has_messages(&direct()));
    assert!(sink.left.lock().expect("left").contains(&thread_topic(&direct())));

    engine
        .refresh_thread_list(ListKind::Conversations)
        .await
        .expect("refresh");
    let threads: Vec<ThreadKey> = engine
        .thread_list(ListKind::Conversations)
        .into_iter()
        .map(|s| s.thread)
        .collect();
    assert_eq!(threads, vec![other_direct()]);

    let mut revived = summary(direct(), 0, 1);
    revived.last_message_time = Some(Utc::now() + ChronoDuration::seconds(5));
    backend.replace_list(
        ListKind::Conversations,
        vec![revived, summary(other_direct(), 5, 0)],
    );
    engine
        .refresh_thread_list(ListKind::Conversations)
        .await
        .expect("refresh");
    assert_eq!(engine.thread_list(ListKind::Conversations).len(), 2);
}

#[tokio::test]
async fn returning_after_long_absence_reconciles() {
    let backend = Arc::new(default_backend().with_history(direct(), inbound_history(&direct(), 3)));
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    let lists_before = backend.count("list");
    let fetches_before = backend.count("fetch");

    assert!(!engine.set_visibility(false).await.expect("hide"));
    assert!(engine.set_visibility(true).await.expect("show"));

    assert_eq!(backend.count("list"), lists_before + 2);
    assert_eq!(backend.count("fetch"), fetches_before + 1);
    assert!(!engine
        .cache()
        .is_stale(&QueryKey::ThreadList(ListKind::Conversations)));
}

#[tokio::test]
async fn hidden_view_does_not_mark_inbound_read() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");
    engine.set_visibility(false).await.expect("hide");

    let frame = change_frame(
        "messages",
        json!({
            "id": "m-70",
            "conversation_id": "c-1",
            "sender_id": "u-2",
            "content": "while away",
            "created_at": Utc::now().to_rfc3339(),
        }),
    );
    engine.handle_frame(frame).await;
    assert_eq!(engine.messages(&direct())[0].status, DeliveryStatus::Delivered);

    engine.set_visibility(true).await.expect("show");
    assert!(backend
        .mark_reads()
        .iter()
        .any(|req| req.message_ids.contains(&MessageId::new("m-70"))));
}

#[tokio::test]
async fn image_send_uploads_then_confirms() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.select_thread(Some(direct())).await.expect("select");

    let upload = MediaUpload {
        filename: "cat.png".into(),
        mime_type: Some("image/png".into()),
        bytes: vec![0; 8],
        width: Some(10),
        height: Some(20),
    };
    engine
        .send_image(&direct(), upload, Some("look".into()))
        .await
        .expect("send image");
    let shown = engine.messages(&direct());
    assert_eq!(
        shown[0].media.as_ref().map(|m| m.url.as_str()),
        Some("local://cat.png")
    );

    wait_until(|| ids(&engine.messages(&direct())) == vec!["m-1"]).await;
    let confirmed = &engine.messages(&direct())[0];
    assert_eq!(
        confirmed.media.as_ref().map(|m| m.url.as_str()),
        Some("https://cdn.example/cat.png")
    );
    assert_eq!(backend.count("upload"), 1);
}

#[tokio::test]
async fn image_send_requires_connectivity() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend.clone()).await;
    engine.set_online(false).await;
    let upload = MediaUpload {
        filename: "cat.png".into(),
        mime_type: None,
        bytes: vec![1],
        width: None,
        height: None,
    };
    let err = engine
        .send_image(&direct(), upload, None)
        .await
        .expect_err("offline");
    assert!(err.is_network());
    assert_eq!(backend.count("upload"), 0);
}

#[tokio::test]
async fn groups_and_members_update_cache() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend).await;

    let created = engine
        .create_group(" Book club ", vec![UserId::new("u-2")])
        .await
        .expect("create");
    assert_eq!(created.title, "Book club");
    assert_eq!(
        engine.thread_list(ListKind::Groups)[0].thread,
        ThreadKey::group("g-new")
    );
    assert_eq!(
        engine.create_group("  ", Vec::new()).await.expect_err("blank").code,
        ErrorCode::Validation
    );

    let group = GroupId::new("g-new");
    assert!(engine.load_members(&group).await.expect("members").is_empty());
    engine
        .add_member(&group, &UserId::new("u-3"))
        .await
        .expect("add");
    engine
        .add_member(&group, &UserId::new("u-3"))
        .await
        .expect("add twice");
    assert_eq!(engine.cache().members(&group).map(|m| m.len()), Some(1));
}

#[tokio::test]
async fn shutdown_clears_presence_and_disconnects_sink() {
    let backend = Arc::new(default_backend());
    let (engine, _sink) = engine_with(backend).await;
    engine
        .handle_frame(InboundFrame::Broadcast {
            topic: thread_topic(&direct()),
            event: EVENT_TYPING.into(),
            payload: json!({ "user_id": "u-2", "display_name": "Bo", "is_typing": true }),
        })
        .await;
    engine.shutdown().await;

    assert!(engine.typing().typists(&direct()).is_empty());
    assert!(engine.notify_typing(&direct(), true).await.is_err());
}

#[tokio::test]
async fn connect_realtime_requires_token() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut anonymous = session();
    anonymous.access_token = None;
    let engine = ChatEngine::new_with_dependencies(
        test_settings(),
        anonymous,
        storage,
        Arc::new(MissingChatBackend),
        Arc::new(MissingBroadcastSink),
    );
    assert!(engine.connect_realtime().await.is_err());
    assert!(engine
        .refresh_thread_list(ListKind::Conversations)
        .await
        .expect_err("no backend")
        .is_network());
}
