use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        ConversationId, DeliveryStatus, GroupId, MediaRef, Message, MessageId, MessageKind,
        ThreadKey, UserId,
    },
    error::ProtocolError,
};

pub const TABLE_MESSAGES: &str = "messages";
pub const TABLE_GROUP_MESSAGES: &str = "group_messages";
pub const TABLE_UNREAD_COUNTERS: &str = "unread_counters";

pub const EVENT_TYPING: &str = "typing";
pub const EVENT_MESSAGES_READ: &str = "messages_read";

const THREAD_TOPIC_PREFIX: &str = "thread:";

/// Broadcast topic carrying typing and read-receipt hints for one thread.
pub fn thread_topic(thread: &ThreadKey) -> String {
    format!("{THREAD_TOPIC_PREFIX}{thread}")
}

pub fn thread_from_topic(topic: &str) -> Option<ThreadKey> {
    let rest = topic.strip_prefix(THREAD_TOPIC_PREFIX)?;
    let (kind, id) = rest.split_once(':')?;
    if id.is_empty() {
        return None;
    }
    ThreadKey::from_parts(kind, id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Frame received from the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Change {
        table: String,
        operation: ChangeOperation,
        row: Value,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },
    Joined {
        topic: String,
    },
    Error {
        message: String,
    },
}

/// Frame sent over the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Join {
        topic: String,
    },
    Leave {
        topic: String,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_width: Option<u32>,
    #[serde(default)]
    pub media_height: Option<u32>,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessageRow {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_width: Option<u32>,
    #[serde(default)]
    pub media_height: Option<u32>,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn media_from_columns(
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
) -> Option<MediaRef> {
    url.map(|url| MediaRef { url, width, height })
}

impl From<DirectMessageRow> for Message {
    fn from(row: DirectMessageRow) -> Self {
        Message {
            id: row.id,
            thread: ThreadKey::Direct(row.conversation_id),
            sender_id: row.sender_id,
            content: row.content,
            kind: row.message_type,
            media: media_from_columns(row.media_url, row.media_width, row.media_height),
            status: row.status,
            is_edited: row.is_edited,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at.unwrap_or(row.created_at),
        }
    }
}

impl From<GroupMessageRow> for Message {
    fn from(row: GroupMessageRow) -> Self {
        Message {
            id: row.id,
            thread: ThreadKey::Group(row.group_id),
            sender_id: row.sender_id,
            content: row.content,
            kind: row.message_type,
            media: media_from_columns(row.media_url, row.media_width, row.media_height),
            status: row.status,
            is_edited: row.is_edited,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at.unwrap_or(row.created_at),
        }
    }
}

/// One row per user x thread, pushed whenever the backend trigger moves the counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCounterRow {
    pub user_id: UserId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadCounter {
    pub user_id: UserId,
    pub thread: ThreadKey,
    pub unread_count: u32,
}

impl TryFrom<UnreadCounterRow> for UnreadCounter {
    type Error = ProtocolError;

    fn try_from(row: UnreadCounterRow) -> Result<Self, Self::Error> {
        let thread = match (row.conversation_id, row.group_id) {
            (Some(id), _) => ThreadKey::Direct(id),
            (None, Some(id)) => ThreadKey::Group(id),
            (None, None) => return Err(ProtocolError::CounterWithoutThread),
        };
        Ok(UnreadCounter {
            user_id: row.user_id,
            thread,
            unread_count: u32::try_from(row.unread_count.max(0)).unwrap_or(u32::MAX),
        })
    }
}

/// Change-feed row validated against its table.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    UnreadCounter(UnreadCounter),
}

fn decode_row<T: DeserializeOwned>(table: &str, row: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(row).map_err(|source| ProtocolError::MalformedRow {
        table: table.to_string(),
        source,
    })
}

fn decode_message(table: &str, row: Value) -> Result<Message, ProtocolError> {
    match table {
        TABLE_MESSAGES => decode_row::<DirectMessageRow>(table, row).map(Message::from),
        TABLE_GROUP_MESSAGES => decode_row::<GroupMessageRow>(table, row).map(Message::from),
        other => Err(ProtocolError::UnknownTable(other.to_string())),
    }
}

impl ChangeEvent {
    pub fn decode(table: &str, operation: ChangeOperation, row: Value) -> Result<Self, ProtocolError> {
        match (table, operation) {
            (TABLE_MESSAGES | TABLE_GROUP_MESSAGES, ChangeOperation::Insert) => {
                decode_message(table, row).map(Self::MessageInserted)
            }
            (TABLE_MESSAGES | TABLE_GROUP_MESSAGES, ChangeOperation::Update) => {
                decode_message(table, row).map(Self::MessageUpdated)
            }
            (TABLE_UNREAD_COUNTERS, ChangeOperation::Insert | ChangeOperation::Update) => {
                let row: UnreadCounterRow = decode_row(table, row)?;
                UnreadCounter::try_from(row).map(Self::UnreadCounter)
            }
            (TABLE_MESSAGES | TABLE_GROUP_MESSAGES | TABLE_UNREAD_COUNTERS, op) => {
                Err(ProtocolError::UnsupportedOperation {
                    table: table.to_string(),
                    operation: op.as_str().to_string(),
                })
            }
            (other, _) => Err(ProtocolError::UnknownTable(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesReadPayload {
    pub reader_id: UserId,
    pub message_ids: Vec<MessageId>,
}

/// Ephemeral broadcast validated against its event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    Typing {
        thread: ThreadKey,
        payload: TypingPayload,
    },
    MessagesRead {
        thread: ThreadKey,
        payload: MessagesReadPayload,
    },
}

fn decode_payload<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::MalformedPayload {
        event: event.to_string(),
        source,
    })
}

impl BroadcastEvent {
    pub fn decode(topic: &str, event: &str, payload: Value) -> Result<Self, ProtocolError> {
        let thread =
            thread_from_topic(topic).ok_or_else(|| ProtocolError::UnknownTopic(topic.to_string()))?;
        match event {
            EVENT_TYPING => Ok(Self::Typing {
                thread,
                payload: decode_payload(event, payload)?,
            }),
            EVENT_MESSAGES_READ => Ok(Self::MessagesRead {
                thread,
                payload: decode_payload(event, payload)?,
            }),
            other => Err(ProtocolError::UnknownEvent {
                topic: topic.to_string(),
                event: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub thread: ThreadKey,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub thread: ThreadKey,
    pub message_id: MessageId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub thread: ThreadKey,
    pub reader_id: UserId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetUnreadRequest {
    pub thread: ThreadKey,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub owner_id: UserId,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMemberRequest {
    pub group_id: GroupId,
    pub user_id: UserId,
}

#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMessagesRequest {
    pub thread: ThreadKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
    pub limit: u32,
}
