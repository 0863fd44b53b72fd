//! HTTP API client for the chat backend's request/response surface.
//!
//! This is the fallback path: history pages, conversation management, and
//! message sends while the push transport is down.

use async_trait::async_trait;
use chatsync_shared::{
    bearer, ApiError, ApiResponse, ConversationId, ConversationSummary,
    CreateConversationRequest, MarkAsReadRequest, Message, MessageId, Page, SendMessageRequest,
    HEADER_AUTHORIZATION,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The request/response calls the sync layer consumes.
///
/// Retry and error semantics belong to the implementation; callers surface
/// failures and never retry automatically.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn create_conversation(&self, initial_message: &str) -> Result<ConversationSummary, ApiError>;

    async fn list_conversations(&self, page: u32, size: u32) -> Result<Page<ConversationSummary>, ApiError>;

    /// Messages of one conversation, newest first.
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        size: u32,
    ) -> Result<Page<Message>, ApiError>;

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, ApiError>;

    async fn mark_as_read(
        &self,
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
    ) -> Result<(), ApiError>;

    async fn close_conversation(&self, conversation_id: ConversationId) -> Result<ConversationSummary, ApiError>;
}

/// HTTP client for making authenticated API requests to the chat backend.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credential: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            credential: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Attach a bearer credential to every request
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Some(credential) => rb.header(HEADER_AUTHORIZATION, bearer(credential)),
            None => rb,
        }
    }

    async fn execute<TRes: DeserializeOwned>(&self, rb: RequestBuilder) -> Result<TRes, ApiError> {
        let resp = self
            .authorize(rb)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }

        if text.is_empty() {
            serde_json::from_str("null").map_err(|e| ApiError::Deserialize(e.to_string()))
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
        }
    }

    /// GET a wrapped response and return its `data`
    pub async fn get_json<TRes: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<TRes, ApiError> {
        let rb = self.client.get(self.url(path)).query(query);
        let wrapped: ApiResponse<TRes> = self.execute(rb).await?;
        Ok(wrapped.data)
    }

    /// POST a JSON body and return the response's `data`
    pub async fn post_json<TReq: Serialize + ?Sized, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let rb = self.client.post(self.url(path)).json(body);
        let wrapped: ApiResponse<TRes> = self.execute(rb).await?;
        Ok(wrapped.data)
    }

    /// PUT an optional JSON body and return the response's `data`
    pub async fn put_json<TReq: Serialize + ?Sized, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&TReq>,
    ) -> Result<TRes, ApiError> {
        let mut rb = self.client.put(self.url(path));
        if let Some(body) = body {
            rb = rb.json(body);
        }
        let wrapped: ApiResponse<TRes> = self.execute(rb).await?;
        Ok(wrapped.data)
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn create_conversation(&self, initial_message: &str) -> Result<ConversationSummary, ApiError> {
        let body = CreateConversationRequest {
            initial_message: initial_message.to_string(),
        };
        self.post_json("/api/v1/chat/conversations", &body).await
    }

    async fn list_conversations(&self, page: u32, size: u32) -> Result<Page<ConversationSummary>, ApiError> {
        self.get_json(
            "/api/v1/chat/conversations",
            &[("page", page.to_string()), ("size", size.to_string())],
        )
        .await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        size: u32,
    ) -> Result<Page<Message>, ApiError> {
        self.get_json(
            &format!("/api/v1/chat/conversations/{conversation_id}/messages"),
            &[("page", page.to_string()), ("size", size.to_string())],
        )
        .await
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, ApiError> {
        self.post_json("/api/v1/chat/messages", request).await
    }

    async fn mark_as_read(
        &self,
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
    ) -> Result<(), ApiError> {
        let body = MarkAsReadRequest {
            conversation_id,
            message_id,
        };
        let _: Option<serde_json::Value> = self.put_json("/api/v1/chat/messages/read", Some(&body)).await?;
        Ok(())
    }

    async fn close_conversation(&self, conversation_id: ConversationId) -> Result<ConversationSummary, ApiError> {
        self.put_json::<(), _>(&format!("/api/v1/chat/conversations/{conversation_id}/close"), None)
            .await
    }
}
