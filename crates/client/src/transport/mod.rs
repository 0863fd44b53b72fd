//! Transport session: one logical STOMP connection over a reconnecting
//! WebSocket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐   Outbound frames   ┌──────────────────────┐
//! │ Session (Transport impl) │ ──────────────────▶ │ connection loop task │
//! │  publish / subscribe     │                     │  connect, pump,      │
//! │  state (watch)           │ ◀── state ───────── │  fixed-delay retry   │
//! └──────────────────────────┘                     └──────────────────────┘
//!                                                             │
//!                                  TransportEvent (mpsc)      ▼
//!                                               ┌──────────────────────────┐
//!                                               │ event-processing context │
//!                                               │ (SyncController)         │
//!                                               └──────────────────────────┘
//! ```
//!
//! Every successful (re)connection is a new logical session. Subscriptions
//! made before a drop are not restored by the transport; the layer above
//! re-establishes them when it sees [`TransportEvent::Connected`].

mod session;

use std::time::Duration;

use chatsync_shared::UserId;
use serde::Serialize;

pub use session::Session;

/// Connection state of a transport session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session has been requested, or it was explicitly disconnected.
    Idle,
    Connecting,
    Connected,
    /// The previous connection dropped or an attempt failed; a retry is pending.
    Disconnected,
    /// The session cannot be established at all (e.g. an unusable URL).
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }
}

/// Who the session acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Numeric id used in event payloads (sender ids, receipt subjects).
    pub user_id: UserId,
    /// Identifier the backend routes application destinations by.
    pub principal: String,
}

/// Retry behavior for connection attempts.
///
/// The delay is fixed; attempts continue until an explicit disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub delay: Duration,
    /// Upper bound on the WebSocket plus STOMP handshake.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A live subscription on one logical session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub destination: String,
    /// Logical session the subscription was made on.
    pub epoch: u64,
}

/// Why a transport primitive could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection loop has stopped")]
    Closed,
}

/// Lifecycle and inbound events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A new logical session is up. Emitted once per transition.
    Connected,
    /// An attempt failed or the broker reported an error. Emitted once per
    /// transition; the transport keeps retrying on its own.
    Error { reason: String },
    /// An established session was lost.
    Disconnected,
    /// A MESSAGE frame for one of our subscriptions.
    Message {
        subscription: String,
        destination: String,
        body: String,
    },
}

/// Publish/subscribe primitives over one logical connection.
pub trait Transport: Send {
    /// Start the session. A call while a session is active is a no-op.
    fn connect(&mut self, credential: &str, identity: &Identity);

    /// Release every subscription then tear the channel down. Safe to call
    /// when not connected.
    fn disconnect(&mut self);

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Fire-and-forget. Dropped (and logged) when not connected.
    fn publish(&self, destination: &str, payload: String);

    fn subscribe(&self, destination: &str) -> Result<SubscriptionHandle, TransportError>;

    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

/// Serialize `payload` and publish it.
pub fn publish_json<T: Transport + ?Sized, P: Serialize>(transport: &T, destination: &str, payload: &P) {
    match serde_json::to_string(payload) {
        Ok(body) => transport.publish(destination, body),
        Err(e) => crate::log_error!("Serialize failed for {}: {}", destination, e),
    }
}
