//! Conversation sync controller.
//!
//! Owns the transport, the subscription registry, the presence driver and the
//! typing coordinator, and reconciles every inbound event against the cached
//! [`ChatState`]. All methods run on the single event-processing context;
//! asynchronous work (history loads, fallback sends) is described by the
//! returned requests and fed back through the `apply_*`/`complete_*` methods.
//!
//! Sends take exactly one of two paths:
//!
//! - connected: publish and wait for the echo on the conversation topic;
//!   nothing is inserted locally.
//! - disconnected: the caller performs the fallback call and hands the
//!   returned message to [`SyncController::complete_fallback_send`], which
//!   inserts it. Insertion dedups by id, so a later echo is harmless.

use chatsync_shared::{
    app, topic, ApiError, ConversationId, ConversationStatus, ConversationSummary,
    MarkAsReadRequest, Message, MessageId, MessageType, Page, PresenceUpdate, ReadReceipt,
    SendMessageRequest, UserId,
};

use crate::config::ClientConfig;
use crate::presence::PresenceDriver;
use crate::state::{ActiveConversation, ChatState, Conversation, Notice, ReadWatermark};
use crate::subscriptions::{
    message_handler, presence_handler, read_handler, typing_handler, InboundEvent,
    SubscriptionRegistry,
};
use crate::timer::{TimerEvent, TimerSender};
use crate::transport::{publish_json, Identity, Transport, TransportEvent};
use crate::typing::TypingCoordinator;

/// A history page to fetch for the selection made at `epoch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRequest {
    pub epoch: u64,
    pub conversation_id: ConversationId,
}

/// How a send left the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Published on the push path; the echo will insert it.
    Published,
    /// The transport is down; perform this request on the fallback path.
    Fallback(SendMessageRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("message is empty")]
    EmptyContent,
    #[error("no conversation selected")]
    NoConversation,
    #[error("conversation is closed")]
    ConversationClosed,
    #[error("a send is already in flight")]
    InFlight,
    #[error("client has stopped")]
    Stopped,
}

/// Follow-up work a transport event asks of the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Notify(Notice),
    LoadHistory(HistoryRequest),
}

pub struct SyncController<T: Transport> {
    transport: T,
    identity: Identity,
    registry: SubscriptionRegistry,
    presence: PresenceDriver,
    typing: TypingCoordinator,
    state: ChatState,
    selection_epoch: u64,
    send_in_flight: bool,
}

impl<T: Transport> SyncController<T> {
    pub fn new(transport: T, identity: Identity, config: &ClientConfig, timers: TimerSender) -> Self {
        let presence = PresenceDriver::new(
            &identity,
            &config.device_info,
            config.heartbeat_interval,
            timers.clone(),
        );
        let typing = TypingCoordinator::new(&identity.principal, config.typing_timeout, timers);
        let state = ChatState {
            connection: transport.state(),
            ..ChatState::default()
        };
        Self {
            transport,
            identity,
            registry: SubscriptionRegistry::new(),
            presence,
            typing,
            state,
            selection_epoch: 0,
            send_in_flight: false,
        }
    }

    pub fn connect(&mut self, credential: &str) {
        self.transport.connect(credential, &self.identity);
        self.sync_connection();
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn send_in_flight(&self) -> bool {
        self.send_in_flight
    }

    // --- Transport lifecycle ---

    pub fn on_transport_event(&mut self, event: TransportEvent) -> Option<Effect> {
        let effect = match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => {
                self.on_disconnected();
                Some(Effect::Notify(Notice::ConnectionLost))
            }
            TransportEvent::Error { reason } => {
                crate::log_warn!("Transport error: {}", reason);
                Some(Effect::Notify(Notice::ConnectionError { reason }))
            }
            TransportEvent::Message {
                subscription,
                destination,
                body,
            } => {
                match self.registry.dispatch(&subscription, &body) {
                    Some(event) => self.apply_event(event),
                    None => crate::log_debug!("Unrouted frame on {}", destination),
                }
                None
            }
        };
        self.sync_connection();
        effect
    }

    /// A new logical session: nothing from the previous one survives, so
    /// presence and the active conversation's topics are set up again.
    fn on_connected(&mut self) -> Option<Effect> {
        self.sync_connection();
        crate::log_info!("Connected as {}", self.identity.principal);
        // A burst started offline never announced its start.
        self.typing.cancel_all();
        if let Err(e) = self
            .registry
            .attach(&self.transport, topic::PRESENCE, presence_handler())
        {
            crate::log_warn!("Cannot attach presence: {}", e);
        }
        self.presence.on_connected(&self.transport);

        let active = self.state.active.as_ref()?;
        if !active.history_loaded {
            // Topics go up once the pending history load lands.
            return None;
        }
        let conversation_id = active.id;
        self.attach_conversation(conversation_id);
        // Events may have been missed while offline.
        Some(Effect::LoadHistory(HistoryRequest {
            epoch: self.selection_epoch,
            conversation_id,
        }))
    }

    fn on_disconnected(&mut self) {
        crate::log_warn!("Connection lost");
        self.registry.detach_all(&self.transport);
        self.presence.on_disconnected();
        self.typing.cancel_all();
        if let Some(active) = self.state.active.as_mut() {
            active.typing_users.clear();
        }
    }

    pub fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Heartbeat { epoch } => self.presence.on_heartbeat(&self.transport, epoch),
            TimerEvent::TypingIdle {
                conversation_id,
                epoch,
            } => self.typing.expire(&self.transport, conversation_id, epoch),
        }
    }

    /// Explicit logout: stop typing, leave, announce offline, release every
    /// subscription and close the session.
    pub fn shutdown(&mut self) {
        if let Some(active_id) = self.state.active_id() {
            self.typing.stop(&self.transport, active_id);
            self.publish_membership(&app::leave(&self.identity.principal), active_id);
        }
        self.typing.cancel_all();
        self.presence.announce_offline(&self.transport);
        self.registry.detach_all(&self.transport);
        self.transport.disconnect();
        self.sync_connection();
        crate::log_info!("Session for {} shut down", self.identity.principal);
    }

    // --- Selection & history ---

    /// Switch the active conversation. The previous conversation's typing
    /// burst is stopped and its topics released before anything about the
    /// new one is set up.
    pub fn select_conversation(&mut self, conversation_id: ConversationId) -> HistoryRequest {
        if let Some(previous) = self.state.active.take() {
            self.typing.stop(&self.transport, previous.id);
            self.publish_membership(&app::leave(&self.identity.principal), previous.id);
            for topic_name in topic::for_conversation(previous.id) {
                self.registry.detach(&self.transport, &topic_name);
            }
        }

        self.selection_epoch += 1;
        self.state.active = Some(ActiveConversation::new(conversation_id));
        if let Some(conversation) = self.state.conversation_mut(conversation_id) {
            conversation.unread_count = 0;
        }
        crate::log_debug!("Selected conversation {}", conversation_id);
        HistoryRequest {
            epoch: self.selection_epoch,
            conversation_id,
        }
    }

    /// Land a history page. Results for a superseded selection are dropped.
    /// The live topics are attached even when the load failed, so the
    /// conversation never sits selected without subscriptions.
    pub fn apply_history(
        &mut self,
        request: HistoryRequest,
        result: Result<Page<Message>, ApiError>,
    ) -> Option<Notice> {
        if request.epoch != self.selection_epoch
            || self.state.active_id() != Some(request.conversation_id)
        {
            crate::log_debug!("Dropping stale history for {}", request.conversation_id);
            return None;
        }
        let conversation_id = request.conversation_id;

        let notice = match result {
            Ok(page) => {
                if let Some(active) = self.state.active.as_mut() {
                    let mut messages = page.content;
                    for message in messages.iter_mut() {
                        active.apply_watermark(message);
                    }
                    let added = active.messages.merge_history(messages);
                    crate::log_debug!("Loaded {} messages for {}", added, conversation_id);
                }
                None
            }
            Err(e) => {
                crate::log_error!("History load for {} failed: {}", conversation_id, e);
                Some(Notice::RequestFailed {
                    action: "load messages",
                    reason: e.user_message(),
                })
            }
        };

        let newest = self.state.active.as_mut().and_then(|active| {
            active.history_loaded = true;
            active.messages.last().cloned()
        });
        if let Some(last) = newest.as_ref() {
            if let Some(conversation) = self.state.conversation_mut(conversation_id) {
                conversation.record_message(last);
            }
        }

        if !self.registry.contains(&topic::conversation(conversation_id)) {
            self.attach_conversation(conversation_id);
        }
        if let Some(last) = newest {
            self.publish_read(conversation_id, last.id);
        }
        notice
    }

    fn attach_conversation(&mut self, conversation_id: ConversationId) {
        let [messages, typing, read] = topic::for_conversation(conversation_id);
        let mut attached = true;
        for (name, handler) in [
            (messages, message_handler()),
            (typing, typing_handler(conversation_id)),
            (read, read_handler(conversation_id)),
        ] {
            if let Err(e) = self.registry.attach(&self.transport, &name, handler) {
                crate::log_warn!("Cannot attach {}: {}", name, e);
                attached = false;
            }
        }
        if attached {
            self.publish_membership(&app::join(&self.identity.principal), conversation_id);
        }
    }

    // --- Sending ---

    pub fn begin_send(&mut self, content: &str) -> Result<SendOutcome, SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyContent);
        }
        let conversation_id = self.state.active_id().ok_or(SendError::NoConversation)?;
        if self
            .state
            .conversation(conversation_id)
            .is_some_and(|c| c.status == ConversationStatus::Closed)
        {
            return Err(SendError::ConversationClosed);
        }
        if self.send_in_flight {
            return Err(SendError::InFlight);
        }

        self.typing.stop(&self.transport, conversation_id);
        let request = SendMessageRequest {
            conversation_id,
            content: content.to_string(),
            message_type: MessageType::Text,
        };

        if self.transport.is_connected() {
            publish_json(&self.transport, &app::send(&self.identity.principal), &request);
            Ok(SendOutcome::Published)
        } else {
            crate::log_info!("Transport down, sending to {} via fallback", conversation_id);
            self.send_in_flight = true;
            Ok(SendOutcome::Fallback(request))
        }
    }

    /// Land a fallback send. No echo follows, so the returned message is
    /// inserted and the last-message projection updated here.
    pub fn complete_fallback_send(
        &mut self,
        request: SendMessageRequest,
        result: Result<Message, ApiError>,
    ) -> Option<Notice> {
        self.send_in_flight = false;
        match result {
            Ok(message) => {
                self.insert_own_message(message);
                None
            }
            Err(e) => {
                crate::log_error!("Fallback send to {} failed: {}", request.conversation_id, e);
                Some(Notice::SendFailed {
                    conversation_id: request.conversation_id,
                    draft: request.content,
                    reason: e.user_message(),
                })
            }
        }
    }

    fn insert_own_message(&mut self, mut message: Message) {
        if let Some(conversation) = self.state.conversation_mut(message.conversation_id) {
            conversation.record_message(&message);
        }
        if let Some(active) = self.state.active.as_mut() {
            if active.id == message.conversation_id {
                active.apply_watermark(&mut message);
                active.messages.insert(message);
            }
        }
    }

    pub fn on_keystroke(&mut self) {
        let Some(conversation_id) = self.state.active_id() else {
            return;
        };
        if self
            .state
            .conversation(conversation_id)
            .is_some_and(|c| !c.status.is_open())
        {
            return;
        }
        self.typing.keystroke(&self.transport, conversation_id);
    }

    // --- Inbound events ---

    pub fn apply_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::MessageCreated(message) => self.on_message(message),
            InboundEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => self.on_typing(conversation_id, user_id, is_typing),
            InboundEvent::ReadReceipt {
                conversation_id,
                receipt,
            } => self.on_read_receipt(conversation_id, receipt),
            InboundEvent::Presence(update) => self.on_presence(update),
        }
    }

    fn on_message(&mut self, mut message: Message) {
        let conversation_id = message.conversation_id;
        let from_other = message.sender_id != self.identity.user_id;
        let is_active = self.state.is_active(conversation_id);

        match self.state.conversation_mut(conversation_id) {
            Some(conversation) => {
                conversation.record_message(&message);
                if !is_active && from_other {
                    conversation.unread_count += 1;
                }
            }
            None => crate::log_debug!("Message for uncached conversation {}", conversation_id),
        }

        let Some(active) = self.state.active.as_mut().filter(|a| a.id == conversation_id) else {
            return;
        };
        active.typing_users.remove(&message.sender_id);
        active.apply_watermark(&mut message);
        let id = message.id;
        if active.messages.append(message) && from_other {
            self.publish_read(conversation_id, id);
        }
    }

    fn on_typing(&mut self, conversation_id: ConversationId, user_id: UserId, is_typing: bool) {
        if user_id == self.identity.user_id {
            return;
        }
        let Some(active) = self.state.active.as_mut().filter(|a| a.id == conversation_id) else {
            return;
        };
        if is_typing {
            active.typing_users.insert(user_id);
        } else {
            active.typing_users.remove(&user_id);
        }
    }

    fn on_read_receipt(&mut self, conversation_id: ConversationId, receipt: ReadReceipt) {
        if receipt.user_id == self.identity.user_id {
            return;
        }
        if let Some(conversation) = self.state.conversation_mut(conversation_id) {
            if let Some(last) = conversation.last_message.as_mut() {
                if receipt.message_id.map_or(true, |up_to| last.id <= up_to) {
                    last.mark_read(receipt.timestamp);
                }
            }
        }

        let Some(active) = self.state.active.as_mut().filter(|a| a.id == conversation_id) else {
            return;
        };
        let changed = active.messages.apply_read(receipt.message_id, receipt.timestamp);
        // Remember the receipt for messages that are not cached yet. A receipt
        // without an id covers what is cached now, not what arrives later.
        let up_to: Option<MessageId> = receipt.message_id.or_else(|| active.messages.newest_id());
        if let Some(up_to) = up_to {
            active.read_watermark = Some(ReadWatermark::raise(
                active.read_watermark,
                ReadWatermark {
                    up_to,
                    at: receipt.timestamp,
                },
            ));
        }
        crate::log_debug!(
            "Read receipt from {} in {} marked {} messages",
            receipt.user_id,
            conversation_id,
            changed
        );
    }

    fn on_presence(&mut self, update: PresenceUpdate) {
        let matched = self
            .state
            .conversations
            .iter_mut()
            .map(|c| usize::from(c.set_presence(update.user_id, update.is_online)))
            .sum::<usize>();
        if matched == 0 {
            crate::log_debug!("Presence for {} matches no conversation", update.user_id);
        }
    }

    // --- Conversation list ---

    /// Replace the list with a first page.
    pub fn set_conversations(&mut self, page: Page<ConversationSummary>) {
        self.state.conversations.clear();
        self.append_conversations(page);
    }

    /// Append a further page, skipping ids already cached.
    pub fn append_conversations(&mut self, page: Page<ConversationSummary>) {
        self.state.conversations_page = page.number;
        self.state.has_more_conversations = page.has_next();
        let local = self.identity.user_id;
        for summary in &page.content {
            if self.state.conversation(summary.id).is_none() {
                self.state
                    .conversations
                    .push(Conversation::from_summary(summary, local));
            }
        }
    }

    /// A newly created conversation goes to the head of the list.
    pub fn insert_conversation(&mut self, summary: &ConversationSummary) {
        let conversation = Conversation::from_summary(summary, self.identity.user_id);
        self.state.conversations.retain(|c| c.id != summary.id);
        self.state.conversations.insert(0, conversation);
    }

    /// Apply an updated conversation in place (e.g. after closing it).
    pub fn update_conversation(&mut self, summary: &ConversationSummary) {
        match self.state.conversation_mut(summary.id) {
            Some(conversation) => {
                conversation.status = summary.status;
                if let Some(last) = summary.last_message.as_ref() {
                    conversation.record_message(last);
                }
            }
            None => self.insert_conversation(summary),
        }
    }

    pub fn mark_conversation_read(&mut self, conversation_id: ConversationId) {
        if let Some(conversation) = self.state.conversation_mut(conversation_id) {
            conversation.unread_count = 0;
        }
    }

    // --- Publishing helpers ---

    fn publish_read(&self, conversation_id: ConversationId, message_id: MessageId) {
        if !self.transport.is_connected() {
            crate::log_debug!("Offline, skipping read receipt for {}", conversation_id);
            return;
        }
        publish_json(
            &self.transport,
            &app::read(&self.identity.principal),
            &MarkAsReadRequest {
                conversation_id,
                message_id: Some(message_id),
            },
        );
    }

    /// Join/leave carry the raw conversation id as their body.
    fn publish_membership(&self, destination: &str, conversation_id: ConversationId) {
        if self.transport.is_connected() {
            self.transport.publish(destination, conversation_id.to_string());
        }
    }

    fn sync_connection(&mut self) {
        self.state.connection = self.transport.state();
    }
}
