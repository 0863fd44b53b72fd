//! Topic-keyed subscription registry.
//!
//! At most one live subscription exists per topic. Attaching a topic that is
//! already tracked releases the old handle before subscribing again, so
//! re-selecting a conversation never leaks subscriptions or doubles
//! delivery.

use std::collections::HashMap;

use chatsync_shared::{
    ConversationId, Message, PresenceUpdate, ReadReceipt, TypingEvent, UserId,
};

use crate::transport::{SubscriptionHandle, Transport, TransportError};

/// A decoded push event, tagged with the conversation its topic belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    MessageCreated(Message),
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        receipt: ReadReceipt,
    },
    Presence(PresenceUpdate),
}

/// Decodes a frame body for one topic.
pub type TopicHandler = Box<dyn Fn(&str) -> serde_json::Result<InboundEvent> + Send>;

struct Entry {
    handle: SubscriptionHandle,
    handler: TopicHandler,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `topic`, replacing any live subscription it already has.
    pub fn attach<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        topic: &str,
        handler: TopicHandler,
    ) -> Result<(), TransportError> {
        if let Some(previous) = self.entries.remove(topic) {
            transport.unsubscribe(&previous.handle);
        }
        let handle = transport.subscribe(topic)?;
        crate::log_debug!("Attached {} ({})", topic, handle.id);
        self.entries.insert(topic.to_string(), Entry { handle, handler });
        Ok(())
    }

    /// Release one topic. Returns false if it was not tracked.
    pub fn detach<T: Transport + ?Sized>(&mut self, transport: &T, topic: &str) -> bool {
        match self.entries.remove(topic) {
            Some(entry) => {
                transport.unsubscribe(&entry.handle);
                true
            }
            None => false,
        }
    }

    /// Release every tracked subscription and clear the map.
    pub fn detach_all<T: Transport + ?Sized>(&mut self, transport: &T) {
        for (_, entry) in self.entries.drain() {
            transport.unsubscribe(&entry.handle);
        }
    }

    /// Decode a frame for one of our subscriptions.
    ///
    /// Frames for unknown subscription ids (already released, or from an
    /// earlier session) are dropped. A body that fails to decode is logged
    /// and dropped; the subscription stays live.
    pub fn dispatch(&self, subscription: &str, body: &str) -> Option<InboundEvent> {
        let Some((topic, entry)) = self
            .entries
            .iter()
            .find(|(_, entry)| entry.handle.id == subscription)
        else {
            crate::log_debug!("Dropping frame for released subscription {}", subscription);
            return None;
        };

        match (entry.handler)(body) {
            Ok(event) => Some(event),
            Err(e) => {
                crate::log_warn!("Malformed payload on {}: {}", topic, e);
                None
            }
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn live_count(&self) -> usize {
        self.entries.len()
    }
}

// --- Handlers ---

/// `/topic/conversation/{id}`: new messages.
pub fn message_handler() -> TopicHandler {
    Box::new(|body| serde_json::from_str::<Message>(body).map(InboundEvent::MessageCreated))
}

/// `/topic/conversation/{id}/typing`
pub fn typing_handler(conversation_id: ConversationId) -> TopicHandler {
    Box::new(move |body| {
        let event: TypingEvent = serde_json::from_str(body)?;
        Ok(InboundEvent::Typing {
            conversation_id: event.conversation_id.unwrap_or(conversation_id),
            user_id: event.user_id,
            is_typing: event.is_typing,
        })
    })
}

/// `/topic/conversation/{id}/read`
pub fn read_handler(conversation_id: ConversationId) -> TopicHandler {
    Box::new(move |body| {
        let receipt: ReadReceipt = serde_json::from_str(body)?;
        Ok(InboundEvent::ReadReceipt {
            conversation_id: receipt.conversation_id.unwrap_or(conversation_id),
            receipt,
        })
    })
}

/// `/topic/presence`
pub fn presence_handler() -> TopicHandler {
    Box::new(|body| serde_json::from_str::<PresenceUpdate>(body).map(InboundEvent::Presence))
}
