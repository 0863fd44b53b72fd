//! Native STOMP-over-WebSocket session using tokio-tungstenite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatsync_shared::{Command, Frame, HEADER_DESTINATION, HEADER_MESSAGE, HEADER_SUBSCRIPTION};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{
    ConnectionState, Identity, ReconnectConfig, SubscriptionHandle, Transport, TransportError,
    TransportEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Commands from the session handle to the connection loop
enum Outbound {
    /// Frames are tagged with the logical session they were issued on;
    /// frames from an earlier session are never written to a later one.
    Frame { epoch: u64, frame: Frame },
    Shutdown,
}

/// Counters shared between the handle and the loop task
#[derive(Default)]
struct Shared {
    epoch: AtomicU64,
    /// Bumped on every `connect`; only the newest loop may publish state.
    generation: AtomicU64,
    next_subscription: AtomicU64,
}

struct Worker {
    cmd_tx: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// A managed STOMP session to the chat broker
pub struct Session {
    url: String,
    reconnect: ReconnectConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    shared: Arc<Shared>,
    /// Subscriptions made on the current logical session, by id.
    live: Mutex<HashMap<String, u64>>,
    worker: Option<Worker>,
    /// Loop that was told to shut down and may still be sending DISCONNECT.
    closing: Option<JoinHandle<()>>,
}

impl Session {
    /// Create an idle session. Events are delivered on the returned receiver.
    pub fn new(
        url: impl Into<String>,
        reconnect: ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let session = Self {
            url: url.into(),
            reconnect,
            state_tx: Arc::new(state_tx),
            events_tx,
            shared: Arc::new(Shared::default()),
            live: Mutex::new(HashMap::new()),
            worker: None,
            closing: None,
        };
        (session, events_rx)
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Wait for the connection loop to finish after [`Transport::disconnect`].
    pub async fn closed(&mut self) {
        let task = match self.closing.take() {
            Some(task) => Some(task),
            None => self.worker.take().map(|worker| worker.task),
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn current_epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    fn enqueue(&self, epoch: u64, frame: Frame) -> Result<(), TransportError> {
        let worker = self.worker.as_ref().ok_or(TransportError::NotConnected)?;
        worker
            .cmd_tx
            .send(Outbound::Frame { epoch, frame })
            .map_err(|_| TransportError::Closed)
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for Session {
    fn connect(&mut self, credential: &str, identity: &Identity) {
        if let Some(worker) = self.worker.as_ref() {
            if !worker.task.is_finished() {
                crate::log_debug!("Session for {} already active", identity.principal);
                return;
            }
        }

        crate::log_info!("Starting session to {} as {}", self.url, identity.principal);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection_loop(
            self.url.clone(),
            credential.to_string(),
            self.reconnect.clone(),
            StateCell {
                tx: self.state_tx.clone(),
                shared: self.shared.clone(),
                generation,
            },
            self.events_tx.clone(),
            cmd_rx,
        ));
        self.worker = Some(Worker { cmd_tx, task });
    }

    fn disconnect(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let epoch = self.current_epoch();
        let released: Vec<(String, u64)> = self.live().drain().collect();
        if self.is_connected() {
            for (id, sub_epoch) in released {
                if sub_epoch == epoch {
                    let _ = worker.cmd_tx.send(Outbound::Frame {
                        epoch,
                        frame: Frame::unsubscribe(&id),
                    });
                }
            }
        }
        let _ = worker.cmd_tx.send(Outbound::Shutdown);
        self.closing = Some(worker.task);
        crate::log_info!("Session to {} disconnecting", self.url);
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn publish(&self, destination: &str, payload: String) {
        if !self.is_connected() {
            crate::log_warn!("Not connected, dropping publish to {}", destination);
            return;
        }
        if let Err(e) = self.enqueue(self.current_epoch(), Frame::send(destination, payload)) {
            crate::log_warn!("Dropping publish to {}: {}", destination, e);
        }
    }

    fn subscribe(&self, destination: &str) -> Result<SubscriptionHandle, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let epoch = self.current_epoch();
        let id = format!(
            "sub-{}",
            self.shared.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        self.enqueue(epoch, Frame::subscribe(&id, destination))?;
        self.live().insert(id.clone(), epoch);
        crate::log_debug!("Subscribed to {} as {}", destination, id);
        Ok(SubscriptionHandle {
            id,
            destination: destination.to_string(),
            epoch,
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if self.live().remove(&handle.id).is_none() {
            return;
        }
        // A handle from an earlier logical session died with it.
        if handle.epoch == self.current_epoch() && self.is_connected() {
            let _ = self.enqueue(handle.epoch, Frame::unsubscribe(&handle.id));
            crate::log_debug!("Unsubscribed {} from {}", handle.id, handle.destination);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.cmd_tx.send(Outbound::Shutdown);
        }
    }
}

/// Connection state as seen by one loop. Once a newer loop has been started,
/// writes from the older one are discarded.
struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
    shared: Arc<Shared>,
    generation: u64,
}

impl StateCell {
    fn set(&self, next: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if self.shared.generation.load(Ordering::SeqCst) != self.generation {
                return false;
            }
            let changed = *current != next;
            *current = next;
            changed
        });
    }
}

enum ConnectError {
    /// Worth retrying after the backoff delay.
    Retry(String),
    /// No retry can succeed.
    Fatal(String),
}

enum PumpExit {
    Shutdown,
    Dropped(String),
}

/// Connection management loop: connect, pump frames, retry after a fixed
/// delay, until shutdown is requested.
async fn run_connection_loop(
    url: String,
    credential: String,
    reconnect: ReconnectConfig,
    state: StateCell,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut attempt = 0u32;

    loop {
        state.set(ConnectionState::Connecting);

        let result = tokio::select! {
            result = establish(&url, &credential, reconnect.connect_timeout) => result,
            _ = wait_for_shutdown(&mut cmd_rx) => {
                state.set(ConnectionState::Idle);
                return;
            }
        };

        match result {
            Ok(ws) => {
                attempt = 0;
                let epoch = state.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                state.set(ConnectionState::Connected);
                let _ = events.send(TransportEvent::Connected);
                crate::log_info!("STOMP session {} established to {}", epoch, url);

                match pump(ws, epoch, &events, &mut cmd_rx).await {
                    PumpExit::Shutdown => {
                        state.set(ConnectionState::Idle);
                        crate::log_info!("Session to {} closed", url);
                        return;
                    }
                    PumpExit::Dropped(reason) => {
                        crate::log_warn!("Session to {} dropped: {}", url, reason);
                        state.set(ConnectionState::Disconnected);
                        let _ = events.send(TransportEvent::Disconnected);
                    }
                }
            }
            Err(ConnectError::Fatal(reason)) => {
                crate::log_error!("Cannot connect to {}: {}", url, reason);
                state.set(ConnectionState::Failed {
                    reason: reason.clone(),
                });
                let _ = events.send(TransportEvent::Error { reason });
                return;
            }
            Err(ConnectError::Retry(reason)) => {
                crate::log_error!("Connection to {} failed: {}", url, reason);
                state.set(ConnectionState::Disconnected);
                let _ = events.send(TransportEvent::Error { reason });
            }
        }

        attempt += 1;
        crate::log_info!(
            "Reconnecting to {} in {}ms (attempt {})",
            url,
            reconnect.delay.as_millis(),
            attempt
        );
        tokio::select! {
            _ = tokio::time::sleep(reconnect.delay) => {}
            _ = wait_for_shutdown(&mut cmd_rx) => {
                state.set(ConnectionState::Idle);
                return;
            }
        }
    }
}

/// Resolve once shutdown is requested, discarding frames that were queued
/// for a session that no longer exists.
async fn wait_for_shutdown(cmd_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match cmd_rx.recv().await {
            Some(Outbound::Shutdown) | None => return,
            Some(Outbound::Frame { frame, .. }) => {
                crate::log_debug!("Dropping {} queued while offline", frame.command.as_str());
            }
        }
    }
}

/// Open the WebSocket and complete the STOMP CONNECT handshake.
async fn establish(url: &str, credential: &str, timeout: Duration) -> Result<WsStream, ConnectError> {
    let parsed = Url::parse(url).map_err(|e| ConnectError::Fatal(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(ConnectError::Fatal(format!(
            "unsupported scheme {:?}",
            parsed.scheme()
        )));
    }
    let host = parsed.host_str().unwrap_or("localhost").to_string();

    let handshake = async {
        let (mut ws, _response) = connect_async(url)
            .await
            .map_err(|e| ConnectError::Retry(e.to_string()))?;

        ws.send(Message::text(Frame::connect(&host, credential).encode()))
            .await
            .map_err(|e| ConnectError::Retry(e.to_string()))?;

        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                    Ok(Some(frame)) if frame.command == Command::Connected => return Ok(ws),
                    Ok(Some(frame)) if frame.command == Command::Error => {
                        return Err(ConnectError::Retry(broker_error(&frame)));
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(ConnectError::Retry(format!("bad handshake frame: {e}"))),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(ConnectError::Retry(e.to_string())),
            }
        }
        Err(ConnectError::Retry("closed during handshake".to_string()))
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| ConnectError::Retry("handshake timed out".to_string()))?
}

/// Move frames in both directions until the session ends.
async fn pump(
    ws: WsStream,
    epoch: u64,
    events: &mpsc::UnboundedSender<TransportEvent>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> PumpExit {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(reason) = route_inbound(text.as_str(), events) {
                        return PumpExit::Dropped(reason);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return PumpExit::Dropped("closed by server".to_string());
                }
                Some(Ok(_)) => {
                    // Pong is handled automatically by tungstenite; binary is unused.
                }
                Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
            },
            outbound = cmd_rx.recv() => match outbound {
                Some(Outbound::Frame { epoch: frame_epoch, frame }) if frame_epoch == epoch => {
                    crate::log_debug!("Sending {} frame", frame.command.as_str());
                    if let Err(e) = write.send(Message::text(frame.encode())).await {
                        return PumpExit::Dropped(format!("send failed: {e}"));
                    }
                }
                Some(Outbound::Frame { frame, .. }) => {
                    crate::log_debug!("Dropping stale {} frame", frame.command.as_str());
                }
                Some(Outbound::Shutdown) | None => {
                    let _ = write.send(Message::text(Frame::disconnect().encode())).await;
                    let _ = write.close().await;
                    return PumpExit::Shutdown;
                }
            },
        }
    }
}

/// Forward one inbound text message. An ERROR frame ends the session.
fn route_inbound(text: &str, events: &mpsc::UnboundedSender<TransportEvent>) -> Result<(), String> {
    let frame = match Frame::decode(text) {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(e) => {
            crate::log_error!("Failed to parse frame: {}", e);
            return Ok(());
        }
    };

    match frame.command {
        Command::Message => {
            let (Some(subscription), Some(destination)) =
                (frame.get(HEADER_SUBSCRIPTION), frame.get(HEADER_DESTINATION))
            else {
                crate::log_warn!("MESSAGE frame without subscription/destination");
                return Ok(());
            };
            let _ = events.send(TransportEvent::Message {
                subscription: subscription.to_string(),
                destination: destination.to_string(),
                body: frame.body.clone(),
            });
            Ok(())
        }
        Command::Error => {
            let reason = broker_error(&frame);
            let _ = events.send(TransportEvent::Error {
                reason: reason.clone(),
            });
            Err(reason)
        }
        other => {
            crate::log_debug!("Ignoring {} frame", other.as_str());
            Ok(())
        }
    }
}

fn broker_error(frame: &Frame) -> String {
    match frame.get(HEADER_MESSAGE) {
        Some(message) if !message.is_empty() => format!("broker error: {message}"),
        _ if !frame.body.is_empty() => format!("broker error: {}", frame.body),
        _ => "broker error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn identity() -> Identity {
        Identity {
            user_id: 7,
            principal: "uid-7".to_string(),
        }
    }

    fn fast_retry() -> ReconnectConfig {
        ReconnectConfig {
            delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn next_frame(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> Frame {
        loop {
            let msg = ws.next().await.expect("stream ended").expect("ws error");
            if let Message::Text(text) = msg {
                if let Some(frame) = Frame::decode(text.as_str()).expect("bad frame") {
                    return frame;
                }
            }
        }
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn handshake_subscribe_route_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let connect = next_frame(&mut ws).await;
            assert_eq!(connect.command, Command::Connect);
            assert_eq!(connect.get("Authorization"), Some("Bearer secret"));
            ws.send(Message::text(
                Frame::new(Command::Connected).header("version", "1.2").encode(),
            ))
            .await
            .unwrap();

            let sub = next_frame(&mut ws).await;
            assert_eq!(sub.command, Command::Subscribe);
            assert_eq!(sub.get("destination"), Some("/topic/presence"));
            let sub_id = sub.get("id").unwrap().to_string();

            ws.send(Message::text(
                Frame::new(Command::Message)
                    .header("subscription", sub_id.clone())
                    .header("destination", "/topic/presence")
                    .body(r#"{"userId":9,"isOnline":true}"#)
                    .encode(),
            ))
            .await
            .unwrap();

            let send = next_frame(&mut ws).await;
            assert_eq!(send.command, Command::Send);
            assert_eq!(send.get("destination"), Some("/app/presence/online/uid-7"));

            let unsub = next_frame(&mut ws).await;
            assert_eq!(unsub.command, Command::Unsubscribe);
            assert_eq!(unsub.get("id"), Some(sub_id.as_str()));

            let bye = next_frame(&mut ws).await;
            assert_eq!(bye.command, Command::Disconnect);
        });

        let (mut session, mut events) = Session::new(format!("ws://{addr}/ws"), fast_retry());
        let mut states = session.state_changes();
        session.connect("secret", &identity());
        wait_for_state(&mut states, ConnectionState::Connected).await;
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        // Already active: no second socket, no second Connected.
        session.connect("secret", &identity());
        assert_eq!(session.state(), ConnectionState::Connected);

        let handle = session.subscribe("/topic/presence").unwrap();
        match events.recv().await {
            Some(TransportEvent::Message {
                subscription, body, ..
            }) => {
                assert_eq!(subscription, handle.id);
                assert!(body.contains("\"userId\":9"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        session.publish("/app/presence/online/uid-7", r#"{"deviceInfo":"test"}"#.to_string());
        session.disconnect();
        session.closed().await;
        assert_eq!(session.state(), ConnectionState::Idle);
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn connect_right_after_disconnect_starts_a_new_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let mut commands = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                commands.push(next_frame(&mut ws).await.command);
                ws.send(Message::text(Frame::new(Command::Connected).encode()))
                    .await
                    .unwrap();
                commands.push(next_frame(&mut ws).await.command);
            }
            commands
        });

        let (mut session, mut events) = Session::new(format!("ws://{addr}/ws"), fast_retry());
        session.connect("secret", &identity());
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        session.disconnect();
        session.connect("secret", &identity());
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for the second session");
        assert_eq!(event, Some(TransportEvent::Connected));
        assert_eq!(session.state(), ConnectionState::Connected);

        // Let the first loop finish; its exit must not touch the new state.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.state(), ConnectionState::Connected);

        session.disconnect();
        session.closed().await;
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(
            broker.await.unwrap(),
            vec![
                Command::Connect,
                Command::Disconnect,
                Command::Connect,
                Command::Disconnect,
            ]
        );
    }

    #[tokio::test]
    async fn offline_calls_are_dropped_and_disconnect_is_safe() {
        let (mut session, _events) = Session::new("ws://127.0.0.1:9/ws", fast_retry());
        assert_eq!(
            session.subscribe("/topic/presence"),
            Err(TransportError::NotConnected)
        );
        session.publish("/app/x", "{}".to_string());
        session.disconnect();

        session.connect("secret", &identity());
        session.disconnect();
        session.closed().await;
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn failed_attempts_retry_until_broker_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            // First attempt: reject the CONNECT.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = next_frame(&mut ws).await;
            ws.send(Message::text(
                Frame::new(Command::Error).header("message", "bad token").encode(),
            ))
            .await
            .unwrap();
            let _ = ws.close(None).await;

            // Second attempt: accept, then drop the socket.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = next_frame(&mut ws).await;
            ws.send(Message::text(Frame::new(Command::Connected).encode()))
                .await
                .unwrap();
            drop(ws);

            // Third attempt: accept and hold until the client leaves.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = next_frame(&mut ws).await;
            ws.send(Message::text(Frame::new(Command::Connected).encode()))
                .await
                .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (mut session, mut events) = Session::new(format!("ws://{addr}/ws"), fast_retry());
        session.connect("secret", &identity());

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out")
                .expect("closed");
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                TransportEvent::Error {
                    reason: "broker error: bad token".to_string()
                },
                TransportEvent::Connected,
                TransportEvent::Disconnected,
                TransportEvent::Connected,
            ]
        );

        session.disconnect();
        session.closed().await;
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn unusable_url_fails_without_retrying() {
        let (mut session, mut events) = Session::new("http://example.invalid/ws", fast_retry());
        session.connect("secret", &identity());
        match events.recv().await {
            Some(TransportEvent::Error { reason }) => assert!(reason.contains("unsupported scheme")),
            other => panic!("unexpected event {other:?}"),
        }
        session.closed().await;
        assert!(matches!(session.state(), ConnectionState::Failed { .. }));
    }

    #[test]
    fn error_frames_end_the_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let raw = Frame::new(Command::Error).body("boom").encode();
        assert_eq!(route_inbound(&raw, &tx), Err("broker error: boom".to_string()));
        assert_eq!(
            rx.try_recv().ok(),
            Some(TransportEvent::Error {
                reason: "broker error: boom".to_string()
            })
        );
        assert_eq!(route_inbound("\n", &tx), Ok(()));
        assert_eq!(route_inbound("garbage", &tx), Ok(()));
    }
}
