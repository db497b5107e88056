use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{ConversationSummary, GroupId, GroupMember, MediaRef, Message, UserProfile},
    error::{ApiError, ApiResult},
    protocol::{
        AddMemberRequest, CreateGroupRequest, EditMessageRequest, FetchMessagesRequest,
        MarkReadRequest, MediaUpload, ResetUnreadRequest, SendMessageRequest,
    },
};

use crate::cache::ListKind;

/// Request/response operations against the hosted backend. Every call returns a tagged
/// result; callers decide what a failure means for the cache.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, request: SendMessageRequest) -> ApiResult<Message>;
    async fn edit_message(&self, request: EditMessageRequest) -> ApiResult<Message>;
    async fn mark_read(&self, request: MarkReadRequest) -> ApiResult<()>;
    async fn reset_unread(&self, request: ResetUnreadRequest) -> ApiResult<()>;
    async fn add_member(&self, request: AddMemberRequest) -> ApiResult<GroupMember>;
    async fn create_group(&self, request: CreateGroupRequest) -> ApiResult<ConversationSummary>;
    async fn search_users(&self, query: &str) -> ApiResult<Vec<UserProfile>>;
    async fn upload_media(&self, upload: MediaUpload) -> ApiResult<MediaRef>;
    async fn list_threads(&self, kind: ListKind) -> ApiResult<Vec<ConversationSummary>>;
    async fn list_members(&self, group_id: &GroupId) -> ApiResult<Vec<GroupMember>>;
    /// Newest first, strictly older than `request.before` when set.
    async fn fetch_messages(&self, request: FetchMessagesRequest) -> ApiResult<Vec<Message>>;
}

pub struct MissingChatBackend;

fn backend_unavailable<T>() -> ApiResult<T> {
    Err(ApiError::network("chat backend unavailable"))
}

#[async_trait]
impl ChatBackend for MissingChatBackend {
    async fn send_message(&self, _request: SendMessageRequest) -> ApiResult<Message> {
        backend_unavailable()
    }

    async fn edit_message(&self, _request: EditMessageRequest) -> ApiResult<Message> {
        backend_unavailable()
    }

    async fn mark_read(&self, _request: MarkReadRequest) -> ApiResult<()> {
        backend_unavailable()
    }

    async fn reset_unread(&self, _request: ResetUnreadRequest) -> ApiResult<()> {
        backend_unavailable()
    }

    async fn add_member(&self, _request: AddMemberRequest) -> ApiResult<GroupMember> {
        backend_unavailable()
    }

    async fn create_group(&self, _request: CreateGroupRequest) -> ApiResult<ConversationSummary> {
        backend_unavailable()
    }

    async fn search_users(&self, _query: &str) -> ApiResult<Vec<UserProfile>> {
        backend_unavailable()
    }

    async fn upload_media(&self, _upload: MediaUpload) -> ApiResult<MediaRef> {
        backend_unavailable()
    }

    async fn list_threads(&self, _kind: ListKind) -> ApiResult<Vec<ConversationSummary>> {
        backend_unavailable()
    }

    async fn list_members(&self, _group_id: &GroupId) -> ApiResult<Vec<GroupMember>> {
        backend_unavailable()
    }

    async fn fetch_messages(&self, _request: FetchMessagesRequest) -> ApiResult<Vec<Message>> {
        backend_unavailable()
    }
}

/// Outbound side of the ephemeral broadcast channel.
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn join(&self, topic: &str) -> Result<()>;
    async fn leave(&self, topic: &str) -> Result<()>;
    async fn broadcast(&self, topic: &str, event: &str, payload: Value) -> Result<()>;
}

pub struct MissingBroadcastSink;

#[async_trait]
impl BroadcastSink for MissingBroadcastSink {
    async fn join(&self, topic: &str) -> Result<()> {
        Err(anyhow!("realtime transport not connected; cannot join {topic}"))
    }

    async fn leave(&self, topic: &str) -> Result<()> {
        Err(anyhow!("realtime transport not connected; cannot leave {topic}"))
    }

    async fn broadcast(&self, topic: &str, event: &str, _payload: Value) -> Result<()> {
        Err(anyhow!(
            "realtime transport not connected; dropped {event} on {topic}"
        ))
    }
}
