//! Destination names and header constants for the chat broker.
//!
//! Topics (`/topic/...`) are subscribed to; application destinations
//! (`/app/...`) are published to and are routed by the sender's principal.

use crate::models::ConversationId;

pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_DESTINATION: &str = "destination";
pub const HEADER_SUBSCRIPTION: &str = "subscription";
pub const HEADER_ID: &str = "id";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_MESSAGE: &str = "message";

pub const STOMP_VERSION: &str = "1.2";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Topic names the client subscribes to.
pub mod topic {
    use super::ConversationId;

    pub const PRESENCE: &str = "/topic/presence";

    pub fn conversation(id: ConversationId) -> String {
        format!("/topic/conversation/{id}")
    }

    pub fn typing(id: ConversationId) -> String {
        format!("/topic/conversation/{id}/typing")
    }

    pub fn read(id: ConversationId) -> String {
        format!("/topic/conversation/{id}/read")
    }

    /// The three per-conversation topics, in attach order.
    pub fn for_conversation(id: ConversationId) -> [String; 3] {
        [conversation(id), typing(id), read(id)]
    }
}

/// Application destinations the client publishes to.
pub mod app {
    pub fn send(principal: &str) -> String {
        format!("/app/chat/send/{principal}")
    }

    pub fn typing(principal: &str) -> String {
        format!("/app/chat/typing/{principal}")
    }

    pub fn read(principal: &str) -> String {
        format!("/app/chat/read/{principal}")
    }

    pub fn join(principal: &str) -> String {
        format!("/app/chat/join/{principal}")
    }

    pub fn leave(principal: &str) -> String {
        format!("/app/chat/leave/{principal}")
    }

    pub fn online(principal: &str) -> String {
        format!("/app/presence/online/{principal}")
    }

    pub fn offline(principal: &str) -> String {
        format!("/app/presence/offline/{principal}")
    }

    pub fn heartbeat(principal: &str) -> String {
        format!("/app/presence/heartbeat/{principal}")
    }
}

/// Format a bearer credential for the `Authorization` header.
pub fn bearer(credential: &str) -> String {
    format!("Bearer {credential}")
}
