//! In-memory fakes for the transport and the REST collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chatsync_shared::{
    ApiError, ChatUser, ConversationId, ConversationStatus, ConversationSummary, Message,
    MessageId, MessageType, Page, SendMessageRequest,
};
use chrono::{DateTime, TimeZone, Utc};

use crate::api_client::ChatApi;
use crate::transport::{
    ConnectionState, Identity, SubscriptionHandle, Transport, TransportError,
};

/// Everything the fake transport was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Publish { destination: String, body: String },
    Subscribe { destination: String },
    Unsubscribe { destination: String },
}

#[derive(Default)]
struct Recorded {
    connected: bool,
    epoch: u64,
    next_id: u64,
    live: Vec<SubscriptionHandle>,
    unsubscribed: Vec<SubscriptionHandle>,
    ops: Vec<Op>,
    connects: usize,
    disconnects: usize,
}

/// A transport that records calls instead of talking to a broker. Clones
/// share the same record.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingTransport {
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.lock().connected = true;
        transport
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Simulate a drop: every live handle dies with the session.
    pub fn drop_connection(&self) {
        let mut inner = self.lock();
        inner.connected = false;
        inner.live.clear();
    }

    /// Simulate a successful (re)connect as a new logical session.
    pub fn restore_connection(&self) {
        let mut inner = self.lock();
        inner.connected = true;
        inner.epoch += 1;
        inner.live.clear();
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Bodies published to `destination`, in order.
    pub fn published_to(&self, destination: &str) -> Vec<String> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Publish { destination: d, body } if d == destination => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live_subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.lock().live.clone()
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.lock().unsubscribed.clone()
    }

    /// Id of the live subscription on `destination`.
    pub fn subscription_id(&self, destination: &str) -> Option<String> {
        self.lock()
            .live
            .iter()
            .find(|h| h.destination == destination)
            .map(|h| h.id.clone())
    }

    /// Live subscription count per destination.
    pub fn live_per_destination(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for handle in self.lock().live.iter() {
            *counts.entry(handle.destination.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnects
    }
}

impl Transport for RecordingTransport {
    fn connect(&mut self, _credential: &str, _identity: &Identity) {
        self.lock().connects += 1;
    }

    fn disconnect(&mut self) {
        let mut inner = self.lock();
        inner.disconnects += 1;
        let released: Vec<_> = inner.live.drain(..).collect();
        inner.unsubscribed.extend(released);
        inner.connected = false;
    }

    fn state(&self) -> ConnectionState {
        if self.lock().connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn publish(&self, destination: &str, payload: String) {
        let mut inner = self.lock();
        if !inner.connected {
            return;
        }
        inner.ops.push(Op::Publish {
            destination: destination.to_string(),
            body: payload,
        });
    }

    fn subscribe(&self, destination: &str) -> Result<SubscriptionHandle, TransportError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        let handle = SubscriptionHandle {
            id: format!("sub-{}", inner.next_id),
            destination: destination.to_string(),
            epoch: inner.epoch,
        };
        inner.next_id += 1;
        inner.live.push(handle.clone());
        inner.ops.push(Op::Subscribe {
            destination: destination.to_string(),
        });
        Ok(handle)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut inner = self.lock();
        let Some(pos) = inner.live.iter().position(|h| h.id == handle.id) else {
            return;
        };
        let removed = inner.live.remove(pos);
        inner.unsubscribed.push(removed);
        inner.ops.push(Op::Unsubscribe {
            destination: handle.destination.clone(),
        });
    }
}

// --- Fixtures ---

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_767_607_200 + secs, 0)
        .single()
        .unwrap_or_default()
}

pub fn message(id: MessageId, conversation_id: ConversationId, sender_id: i64, content: &str) -> Message {
    Message {
        id,
        conversation_id,
        sender_id,
        sender_name: None,
        sender_role: None,
        content: content.to_string(),
        message_type: MessageType::Text,
        is_read: None,
        read_at: None,
        created_at: at(id),
    }
}

pub fn user(id: i64, online: bool) -> ChatUser {
    ChatUser {
        id,
        first_name: Some(format!("User{id}")),
        last_name: None,
        email: None,
        is_online: Some(online),
        last_seen: None,
    }
}

/// A conversation between customer `customer` and agent `agent`.
pub fn summary(id: ConversationId, customer: i64, agent: Option<i64>) -> ConversationSummary {
    ConversationSummary {
        id,
        customer: Some(user(customer, false)),
        super_admin: agent.map(|a| user(a, false)),
        status: ConversationStatus::Open,
        last_message: None,
        unread_count: Some(0),
        last_message_at: None,
        created_at: Some(at(0)),
    }
}

pub fn page<T>(content: Vec<T>) -> Page<T> {
    let total = content.len() as u64;
    Page {
        content,
        total_elements: total,
        total_pages: 1,
        number: 0,
        size: 50,
    }
}

// --- Scripted REST collaborator ---

#[derive(Default)]
struct Script {
    conversations: Vec<ConversationSummary>,
    messages: HashMap<ConversationId, Vec<Message>>,
    next_message_id: MessageId,
    fail_sends: bool,
    fail_history: bool,
    sent: Vec<SendMessageRequest>,
    marked: Vec<(ConversationId, Option<MessageId>)>,
    closed: Vec<ConversationId>,
}

/// A [`ChatApi`] answering from in-memory data.
#[derive(Clone, Default)]
pub struct FakeApi {
    script: Arc<Mutex<Script>>,
}

impl FakeApi {
    pub fn new() -> Self {
        let api = Self::default();
        api.lock().next_message_id = 55;
        api
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn with_conversations(self, conversations: Vec<ConversationSummary>) -> Self {
        self.lock().conversations = conversations;
        self
    }

    /// History for a conversation, stored newest first like the server.
    pub fn with_messages(self, conversation_id: ConversationId, mut messages: Vec<Message>) -> Self {
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        self.lock().messages.insert(conversation_id, messages);
        self
    }

    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn fail_history(&self, fail: bool) {
        self.lock().fail_history = fail;
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.lock().sent.clone()
    }

    pub fn marked(&self) -> Vec<(ConversationId, Option<MessageId>)> {
        self.lock().marked.clone()
    }

    pub fn closed(&self) -> Vec<ConversationId> {
        self.lock().closed.clone()
    }
}

fn server_error() -> ApiError {
    ApiError::Http {
        status: 500,
        body: r#"{"message":"Internal error"}"#.to_string(),
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn create_conversation(&self, initial_message: &str) -> Result<ConversationSummary, ApiError> {
        let mut script = self.lock();
        let id = script.conversations.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        let mut created = summary(id, 7, None);
        let first = message(script.next_message_id, id, 7, initial_message);
        script.next_message_id += 1;
        created.last_message = Some(first);
        script.conversations.insert(0, created.clone());
        Ok(created)
    }

    async fn list_conversations(&self, page_no: u32, size: u32) -> Result<Page<ConversationSummary>, ApiError> {
        let script = self.lock();
        let start = (page_no * size) as usize;
        let content: Vec<_> = script
            .conversations
            .iter()
            .skip(start)
            .take(size as usize)
            .cloned()
            .collect();
        let total = script.conversations.len() as u64;
        Ok(Page {
            content,
            total_elements: total,
            total_pages: total.div_ceil(u64::from(size.max(1))) as u32,
            number: page_no,
            size,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        _page: u32,
        _size: u32,
    ) -> Result<Page<Message>, ApiError> {
        let script = self.lock();
        if script.fail_history {
            return Err(server_error());
        }
        Ok(page(
            script
                .messages
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default(),
        ))
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, ApiError> {
        let mut script = self.lock();
        script.sent.push(request.clone());
        if script.fail_sends {
            return Err(server_error());
        }
        let created = message(script.next_message_id, request.conversation_id, 7, &request.content);
        script.next_message_id += 1;
        Ok(created)
    }

    async fn mark_as_read(
        &self,
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
    ) -> Result<(), ApiError> {
        self.lock().marked.push((conversation_id, message_id));
        Ok(())
    }

    async fn close_conversation(&self, conversation_id: ConversationId) -> Result<ConversationSummary, ApiError> {
        let mut script = self.lock();
        script.closed.push(conversation_id);
        let conversation = script
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or(ApiError::Http {
                status: 404,
                body: r#"{"message":"Conversation not found"}"#.to_string(),
            })?;
        conversation.status = ConversationStatus::Closed;
        Ok(conversation.clone())
    }
}
