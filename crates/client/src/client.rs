//! Chat client: the event-processing context and its handle.
//!
//! [`ChatClient::login`] owns the whole session for one user. It spawns a
//! single loop task that owns the [`SyncController`] and selects over UI
//! commands, transport events, timer ticks and completions of fallback
//! calls. Fallback calls run as their own tasks so a slow request never
//! stalls topic delivery; their results come back to the loop as
//! completions.

use std::sync::Arc;

use chatsync_shared::{ApiError, ConversationId, ConversationSummary, Message, Page, SendMessageRequest};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api_client::{ApiClient, ChatApi};
use crate::config::ClientConfig;
use crate::controller::{Effect, HistoryRequest, SendError, SendOutcome, SyncController};
use crate::state::{ChatState, Notice};
use crate::timer::TimerEvent;
use crate::transport::{Identity, ReconnectConfig, Session, Transport, TransportEvent};

const NOTICE_CAPACITY: usize = 64;

enum ClientCommand {
    Select(ConversationId),
    Send {
        content: String,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Keystroke,
    LoadConversations { page: u32 },
    CreateConversation(String),
    CloseConversation(ConversationId),
    MarkRead(ConversationId),
    Logout(oneshot::Sender<()>),
}

/// Results of fallback calls, delivered back to the loop.
enum Completion {
    History(HistoryRequest, Result<Page<Message>, ApiError>),
    Sent(SendMessageRequest, Result<Message, ApiError>),
    Conversations {
        page: u32,
        result: Result<Page<ConversationSummary>, ApiError>,
    },
    Created(Result<ConversationSummary, ApiError>),
    Closed(Result<ConversationSummary, ApiError>),
    MarkedRead(ConversationId, Result<(), ApiError>),
}

/// Handle to a running chat session.
pub struct ChatClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<ChatState>,
    notices: broadcast::Sender<Notice>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Start a session against the configured backend and load the first
    /// conversation page.
    pub fn login(config: ClientConfig, credential: &str, identity: Identity) -> Self {
        let reconnect = ReconnectConfig {
            delay: config.reconnect_delay,
            ..ReconnectConfig::default()
        };
        let (session, events) = Session::new(config.ws_url.clone(), reconnect);
        let api = ApiClient::new()
            .with_base_url(config.api_url.clone())
            .with_credential(credential);
        Self::start(session, events, Arc::new(api), config, credential, identity)
    }

    /// Start a session over any transport and REST collaborator.
    pub fn start<T, A>(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        api: Arc<A>,
        config: ClientConfig,
        credential: &str,
        identity: Identity,
    ) -> Self
    where
        T: Transport + 'static,
        A: ChatApi + 'static,
    {
        let (timers_tx, timers) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let mut controller = SyncController::new(transport, identity, &config, timers_tx);
        controller.connect(credential);
        let (state_tx, state) = watch::channel(controller.state().clone());

        let event_loop = EventLoop {
            controller,
            api,
            page_size: config.page_size,
            state: state_tx,
            notices: notices.clone(),
            commands: commands_rx,
            events,
            timers,
            completions,
            completions_tx,
        };
        let task = tokio::spawn(event_loop.run());

        let client = Self {
            commands,
            state,
            notices,
            task,
        };
        client.load_conversations(0);
        client
    }

    /// Watch the state snapshot.
    pub fn state(&self) -> watch::Receiver<ChatState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn select(&self, conversation_id: ConversationId) {
        self.command(ClientCommand::Select(conversation_id));
    }

    /// Send to the active conversation. Resolves once the send was published
    /// or handed to the fallback path; a failed fallback is reported as a
    /// [`Notice::SendFailed`].
    pub async fn send(&self, content: impl Into<String>) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.command(ClientCommand::Send {
            content: content.into(),
            reply,
        });
        rx.await.unwrap_or(Err(SendError::Stopped))
    }

    pub fn keystroke(&self) {
        self.command(ClientCommand::Keystroke);
    }

    pub fn load_conversations(&self, page: u32) {
        self.command(ClientCommand::LoadConversations { page });
    }

    pub fn create_conversation(&self, initial_message: impl Into<String>) {
        self.command(ClientCommand::CreateConversation(initial_message.into()));
    }

    pub fn close_conversation(&self, conversation_id: ConversationId) {
        self.command(ClientCommand::CloseConversation(conversation_id));
    }

    /// Mark every message of a conversation read through the REST path.
    pub fn mark_read(&self, conversation_id: ConversationId) {
        self.command(ClientCommand::MarkRead(conversation_id));
    }

    /// Announce offline, release everything and wait for the loop to end.
    pub async fn logout(self) {
        let (done, rx) = oneshot::channel();
        self.command(ClientCommand::Logout(done));
        let _ = rx.await;
        let _ = self.task.await;
    }

    fn command(&self, command: ClientCommand) {
        if self.commands.send(command).is_err() {
            crate::log_warn!("Chat client has stopped, dropping command");
        }
    }
}

struct EventLoop<T: Transport, A: ChatApi> {
    controller: SyncController<T>,
    api: Arc<A>,
    page_size: u32,
    state: watch::Sender<ChatState>,
    notices: broadcast::Sender<Notice>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completions_tx: mpsc::UnboundedSender<Completion>,
}

impl<T, A> EventLoop<T, A>
where
    T: Transport + 'static,
    A: ChatApi + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Logout(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                Some(event) = self.events.recv() => {
                    match self.controller.on_transport_event(event) {
                        Some(Effect::Notify(notice)) => self.notify(notice),
                        Some(Effect::LoadHistory(request)) => self.load_history(request),
                        None => {}
                    }
                }
                Some(tick) = self.timers.recv() => self.controller.on_timer(tick),
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
            }
            self.publish_state();
        }
    }

    fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Select(conversation_id) => {
                let request = self.controller.select_conversation(conversation_id);
                self.load_history(request);
            }
            ClientCommand::Send { content, reply } => {
                let result = match self.controller.begin_send(&content) {
                    Ok(SendOutcome::Published) => Ok(()),
                    Ok(SendOutcome::Fallback(request)) => {
                        self.spawn_call(move |api| async move {
                            let result = api.send_message(&request).await;
                            Completion::Sent(request, result)
                        });
                        Ok(())
                    }
                    Err(e) => {
                        crate::log_debug!("Send rejected: {}", e);
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            ClientCommand::Keystroke => self.controller.on_keystroke(),
            ClientCommand::LoadConversations { page } => {
                let size = self.page_size;
                self.spawn_call(move |api| async move {
                    let result = api.list_conversations(page, size).await;
                    Completion::Conversations { page, result }
                });
            }
            ClientCommand::CreateConversation(initial_message) => {
                self.spawn_call(move |api| async move {
                    Completion::Created(api.create_conversation(&initial_message).await)
                });
            }
            ClientCommand::CloseConversation(conversation_id) => {
                self.spawn_call(move |api| async move {
                    Completion::Closed(api.close_conversation(conversation_id).await)
                });
            }
            ClientCommand::MarkRead(conversation_id) => {
                self.spawn_call(move |api| async move {
                    let result = api.mark_as_read(conversation_id, None).await;
                    Completion::MarkedRead(conversation_id, result)
                });
            }
            ClientCommand::Logout(_) => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let notice = match completion {
            Completion::History(request, result) => self.controller.apply_history(request, result),
            Completion::Sent(request, result) => self.controller.complete_fallback_send(request, result),
            Completion::Conversations { page, result } => match result {
                Ok(conversations) if page == 0 => {
                    self.controller.set_conversations(conversations);
                    None
                }
                Ok(conversations) => {
                    self.controller.append_conversations(conversations);
                    None
                }
                Err(e) => Some(failed("load conversations", e)),
            },
            Completion::Created(result) => match result {
                Ok(summary) => {
                    self.controller.insert_conversation(&summary);
                    None
                }
                Err(e) => Some(failed("create conversation", e)),
            },
            Completion::Closed(result) => match result {
                Ok(summary) => {
                    self.controller.update_conversation(&summary);
                    None
                }
                Err(e) => Some(failed("close conversation", e)),
            },
            Completion::MarkedRead(conversation_id, result) => match result {
                Ok(()) => {
                    self.controller.mark_conversation_read(conversation_id);
                    None
                }
                Err(e) => Some(failed("mark as read", e)),
            },
        };
        if let Some(notice) = notice {
            self.notify(notice);
        }
    }

    fn load_history(&self, request: HistoryRequest) {
        let size = self.page_size;
        self.spawn_call(move |api| async move {
            let result = api.list_messages(request.conversation_id, 0, size).await;
            Completion::History(request, result)
        });
    }

    /// Run one fallback call off the loop and feed its result back in.
    fn spawn_call<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<A>) -> Fut,
        Fut: std::future::Future<Output = Completion> + Send + 'static,
    {
        let future = call(self.api.clone());
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(future.await);
        });
    }

    fn shutdown(&mut self) {
        self.controller.shutdown();
        self.publish_state();
    }

    fn notify(&self, notice: Notice) {
        // No receivers is fine: notices are advisory.
        let _ = self.notices.send(notice);
    }

    fn publish_state(&self) {
        let next = self.controller.state();
        self.state.send_if_modified(|current| {
            if *current == *next {
                return false;
            }
            *current = next.clone();
            true
        });
    }
}

fn failed(action: &'static str, error: ApiError) -> Notice {
    crate::log_error!("Failed to {}: {}", action, error);
    Notice::RequestFailed {
        action,
        reason: error.user_message(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, summary, FakeApi, RecordingTransport};
    use std::time::Duration;

    fn identity() -> Identity {
        Identity {
            user_id: 7,
            principal: "uid-7".to_string(),
        }
    }

    struct Harness {
        client: ChatClient,
        transport: RecordingTransport,
        api: FakeApi,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    fn start(connected: bool, api: FakeApi) -> Harness {
        let transport = if connected {
            RecordingTransport::connected()
        } else {
            RecordingTransport::disconnected()
        };
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = ChatClient::start(
            transport.clone(),
            events_rx,
            Arc::new(api.clone()),
            ClientConfig::default(),
            "token",
            identity(),
        );
        Harness {
            client,
            transport,
            api,
            events,
        }
    }

    async fn wait_until(client: &ChatClient, what: impl Fn(&ChatState) -> bool) -> ChatState {
        let mut rx = client.state();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| what(s)))
            .await
            .expect("timed out waiting for state")
            .expect("client stopped")
            .clone();
        state
    }

    fn active_ids(state: &ChatState) -> Vec<i64> {
        state
            .active
            .as_ref()
            .map(|a| a.messages.as_slice().iter().map(|m| m.id).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn login_connects_and_loads_conversations() {
        let api = FakeApi::new().with_conversations(vec![summary(42, 7, Some(9))]);
        let h = start(true, api);
        let state = wait_until(&h.client, |s| !s.conversations.is_empty()).await;
        assert_eq!(state.conversations[0].id, 42);
        assert_eq!(h.transport.connect_calls(), 1);
        h.client.logout().await;
    }

    #[tokio::test]
    async fn select_loads_history_then_attaches_topics() {
        let api = FakeApi::new()
            .with_conversations(vec![summary(42, 7, Some(9))])
            .with_messages(42, vec![message(100, 42, 9, "a"), message(101, 42, 7, "b")]);
        let h = start(true, api);
        h.events.send(TransportEvent::Connected).unwrap();
        wait_until(&h.client, |s| !s.conversations.is_empty()).await;

        h.client.select(42);
        let state = wait_until(&h.client, |s| {
            s.active.as_ref().is_some_and(|a| a.history_loaded)
        })
        .await;
        assert_eq!(active_ids(&state), vec![100, 101]);
        assert!(h.transport.subscription_id("/topic/conversation/42").is_some());

        let subscription = h.transport.subscription_id("/topic/conversation/42").unwrap();
        h.events
            .send(TransportEvent::Message {
                subscription,
                destination: "/topic/conversation/42".to_string(),
                body: r#"{"id":102,"conversationId":42,"senderId":9,"content":"c","createdAt":"2026-01-05T10:00:00Z"}"#.to_string(),
            })
            .unwrap();
        let state = wait_until(&h.client, |s| active_ids(s).len() == 3).await;
        assert_eq!(active_ids(&state), vec![100, 101, 102]);
        h.client.logout().await;
    }

    #[tokio::test]
    async fn offline_send_goes_through_fallback() {
        let api = FakeApi::new().with_conversations(vec![summary(42, 7, Some(9))]);
        let h = start(false, api);
        wait_until(&h.client, |s| !s.conversations.is_empty()).await;
        h.client.select(42);
        wait_until(&h.client, |s| s.active.as_ref().is_some_and(|a| a.history_loaded)).await;

        assert_eq!(h.client.send("  ").await, Err(SendError::EmptyContent));
        assert_eq!(h.client.send("hello").await, Ok(()));
        let state = wait_until(&h.client, |s| !active_ids(s).is_empty()).await;
        assert_eq!(active_ids(&state), vec![55]);
        assert_eq!(h.api.sent().len(), 1);
        assert_eq!(
            state.conversation(42).unwrap().last_message.as_ref().map(|m| m.content.as_str()),
            Some("hello")
        );
        h.client.logout().await;
    }

    #[tokio::test]
    async fn failed_fallback_send_publishes_notice_with_draft() {
        let api = FakeApi::new().with_conversations(vec![summary(42, 7, Some(9))]);
        api.fail_sends(true);
        let h = start(false, api);
        let mut notices = h.client.notices();
        wait_until(&h.client, |s| !s.conversations.is_empty()).await;
        h.client.select(42);
        wait_until(&h.client, |s| s.active.as_ref().is_some_and(|a| a.history_loaded)).await;

        h.client.send("hello").await.unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            notice,
            Notice::SendFailed {
                conversation_id: 42,
                draft: "hello".to_string(),
                reason: "Internal error".to_string(),
            }
        );
        h.client.logout().await;
    }

    #[tokio::test]
    async fn failed_history_load_is_reported() {
        let api = FakeApi::new().with_conversations(vec![summary(42, 7, Some(9))]);
        api.fail_history(true);
        let h = start(true, api);
        let mut notices = h.client.notices();
        wait_until(&h.client, |s| !s.conversations.is_empty()).await;

        h.client.select(42);
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            notice,
            Notice::RequestFailed {
                action: "load messages",
                reason: "Internal error".to_string(),
            }
        );
        let state = wait_until(&h.client, |s| s.active.as_ref().is_some_and(|a| a.history_loaded)).await;
        assert!(active_ids(&state).is_empty());
        assert!(h.transport.subscription_id("/topic/conversation/42").is_some());
        h.client.logout().await;
    }

    #[tokio::test]
    async fn create_close_and_mark_read_use_the_rest_path() {
        let api = FakeApi::new().with_conversations(vec![summary(42, 7, Some(9))]);
        let h = start(true, api);
        wait_until(&h.client, |s| s.conversations.len() == 1).await;

        h.client.create_conversation("need help");
        let state = wait_until(&h.client, |s| s.conversations.len() == 2).await;
        assert_eq!(state.conversations[0].id, 43);

        h.client.close_conversation(42);
        wait_until(&h.client, |s| {
            s.conversation(42).is_some_and(|c| !c.status.is_open())
        })
        .await;

        h.client.mark_read(42);
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.api.marked().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.api.marked(), vec![(42, None)]);
        assert_eq!(h.api.closed(), vec![42]);
        h.client.logout().await;
    }

    #[tokio::test]
    async fn logout_releases_everything() {
        let api = FakeApi::new().with_conversations(vec![summary(42, 7, Some(9))]);
        let h = start(true, api);
        h.events.send(TransportEvent::Connected).unwrap();
        wait_until(&h.client, |s| !s.conversations.is_empty()).await;
        h.client.select(42);
        wait_until(&h.client, |s| s.active.as_ref().is_some_and(|a| a.history_loaded)).await;

        let transport = h.transport.clone();
        h.client.logout().await;
        assert!(transport.live_subscriptions().is_empty());
        assert_eq!(transport.published_to("/app/presence/offline/uid-7").len(), 1);
        assert_eq!(transport.disconnect_calls(), 1);
    }
}
