use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationSummary, GroupId, GroupMember, MediaRef, Message, ThreadKey, UserProfile},
    error::{ApiError, ApiResult, ErrorCode},
    protocol::{
        AddMemberRequest, CreateGroupRequest, EditMessageRequest, FetchMessagesRequest,
        MarkReadRequest, MediaUpload, ResetUnreadRequest, SendMessageRequest,
    },
};
use tracing::warn;

use crate::{backend::ChatBackend, cache::ListKind};

/// [`ChatBackend`] over the backend's REST surface.
pub struct HttpChatBackend {
    http: Client,
    api_url: String,
    access_token: Option<String>,
}

#[derive(Serialize)]
struct FetchMessagesQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<String>,
}

#[derive(Serialize)]
struct EditMessageBody<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct MediaQuery<'a> {
    filename: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
}

impl HttpChatBackend {
    pub fn new(api_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn thread_url(&self, thread: &ThreadKey, rest: &str) -> String {
        format!(
            "{}/threads/{}/{}{rest}",
            self.api_url,
            thread.kind_str(),
            thread.id_str()
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> ApiResult<RequestBuilder> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| ApiError::auth("not signed in"))?;
        Ok(builder.bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder) -> ApiResult<Response> {
        let response = self
            .authorized(builder)?
            .send()
            .await
            .map_err(|err| ApiError::network(format!("request failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
            ApiError::new(
                ErrorCode::from_http_status(status.as_u16()),
                if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            )
        });
        warn!(status = status.as_u16(), code = ?err.code, "backend: request rejected");
        Err(err)
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        self.send(builder)
            .await?
            .json()
            .await
            .map_err(|err| ApiError::new(ErrorCode::Unknown, format!("invalid response body: {err}")))
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn send_message(&self, request: SendMessageRequest) -> ApiResult<Message> {
        let url = self.thread_url(&request.thread, "/messages");
        self.json(self.http.post(url).json(&request)).await
    }

    async fn edit_message(&self, request: EditMessageRequest) -> ApiResult<Message> {
        let url = self.thread_url(
            &request.thread,
            &format!("/messages/{}", request.message_id),
        );
        self.json(self.http.patch(url).json(&EditMessageBody {
            content: &request.content,
        }))
        .await
    }

    async fn mark_read(&self, request: MarkReadRequest) -> ApiResult<()> {
        let url = self.thread_url(&request.thread, "/read");
        self.send(self.http.post(url).json(&request)).await?;
        Ok(())
    }

    async fn reset_unread(&self, request: ResetUnreadRequest) -> ApiResult<()> {
        let url = self.thread_url(&request.thread, "/unread/reset");
        self.send(self.http.post(url).json(&request)).await?;
        Ok(())
    }

    async fn add_member(&self, request: AddMemberRequest) -> ApiResult<GroupMember> {
        let url = format!("{}/groups/{}/members", self.api_url, request.group_id);
        self.json(self.http.post(url).json(&request)).await
    }

    async fn create_group(&self, request: CreateGroupRequest) -> ApiResult<ConversationSummary> {
        let url = format!("{}/groups", self.api_url);
        self.json(self.http.post(url).json(&request)).await
    }

    async fn search_users(&self, query: &str) -> ApiResult<Vec<UserProfile>> {
        let url = format!("{}/users/search", self.api_url);
        self.json(self.http.get(url).query(&[("q", query)])).await
    }

    async fn upload_media(&self, upload: MediaUpload) -> ApiResult<MediaRef> {
        let url = format!("{}/media", self.api_url);
        let mime_type = upload
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let query = MediaQuery {
            filename: &upload.filename,
            width: upload.width,
            height: upload.height,
        };
        let builder = self
            .http
            .post(url)
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(upload.bytes);
        self.json(builder).await
    }

    async fn list_threads(&self, kind: ListKind) -> ApiResult<Vec<ConversationSummary>> {
        let path = match kind {
            ListKind::Conversations => "conversations",
            ListKind::Groups => "groups",
        };
        let url = format!("{}/{path}", self.api_url);
        self.json(self.http.get(url)).await
    }

    async fn list_members(&self, group_id: &GroupId) -> ApiResult<Vec<GroupMember>> {
        let url = format!("{}/groups/{group_id}/members", self.api_url);
        self.json(self.http.get(url)).await
    }

    async fn fetch_messages(&self, request: FetchMessagesRequest) -> ApiResult<Vec<Message>> {
        let url = self.thread_url(&request.thread, "/messages");
        let query = FetchMessagesQuery {
            limit: request.limit,
            before: request.before.map(|before| before.to_rfc3339()),
        };
        self.json(self.http.get(url).query(&query)).await
    }
}

#[cfg(test)]
#[path = "tests/http_backend_tests.rs"]
mod tests;
