//! Chatsync client - real-time chat sync over STOMP
//!
//! Keeps a user's view of conversations, messages, typing state, presence
//! and read receipts consistent with the chat backend over a reconnecting
//! push transport, falling back to the REST API while it is down.

pub mod logging;

pub mod api_client;
pub mod client;
pub mod config;
pub mod controller;
pub mod presence;
pub mod state;
pub mod subscriptions;
pub mod timer;
pub mod transport;
pub mod typing;

#[cfg(test)]
mod testing;

pub use api_client::{ApiClient, ChatApi};
pub use client::ChatClient;
pub use config::ClientConfig;
pub use controller::{SendError, SendOutcome, SyncController};
pub use state::{ChatState, Conversation, Notice};
pub use transport::{ConnectionState, Identity, Session, Transport, TransportEvent};
