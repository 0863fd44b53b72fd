//! Observed client state: the conversation list projection and the active
//! conversation's message sequence.

use std::collections::BTreeSet;

use chatsync_shared::{
    ChatUser, ConversationId, ConversationStatus, ConversationSummary, Message, MessageId, UserId,
};
use chrono::{DateTime, Utc};

use crate::transport::ConnectionState;

/// Snapshot published to observers after every handled event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatState {
    pub connection: ConnectionState,
    pub conversations: Vec<Conversation>,
    /// Last conversation page loaded, and whether another one exists.
    pub conversations_page: u32,
    pub has_more_conversations: bool,
    pub active: Option<ActiveConversation>,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Idle,
            conversations: Vec::new(),
            conversations_page: 0,
            has_more_conversations: false,
            active: None,
        }
    }
}

impl ChatState {
    pub fn conversation(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn conversation_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    pub fn active_id(&self) -> Option<ConversationId> {
        self.active.as_ref().map(|a| a.id)
    }

    pub fn is_active(&self, id: ConversationId) -> bool {
        self.active_id() == Some(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    pub online: bool,
}

impl From<&ChatUser> for Participant {
    fn from(user: &ChatUser) -> Self {
        Self {
            id: user.id,
            name: user.display_name(),
            online: user.is_online.unwrap_or(false),
        }
    }
}

/// Cached projection of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<Participant>,
    pub status: ConversationStatus,
    pub last_message: Option<Message>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u64,
    /// True when any participant other than the local user is online.
    pub participant_online: bool,
    local_user: UserId,
}

impl Conversation {
    pub fn from_summary(summary: &ConversationSummary, local_user: UserId) -> Self {
        let participants: Vec<Participant> = [summary.customer.as_ref(), summary.super_admin.as_ref()]
            .into_iter()
            .flatten()
            .map(Participant::from)
            .collect();
        let mut conversation = Self {
            id: summary.id,
            participants,
            status: summary.status,
            last_message: summary.last_message.clone(),
            last_message_at: summary
                .last_message_at
                .or_else(|| summary.last_message.as_ref().map(|m| m.created_at)),
            unread_count: summary.unread_count.unwrap_or(0),
            participant_online: false,
            local_user,
        };
        conversation.refresh_online();
        conversation
    }

    pub fn counterparts(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(move |p| p.id != self.local_user)
    }

    /// Apply a presence event. Returns false when `user_id` is not a
    /// counterpart here.
    pub fn set_presence(&mut self, user_id: UserId, online: bool) -> bool {
        if user_id == self.local_user {
            return false;
        }
        let Some(participant) = self.participants.iter_mut().find(|p| p.id == user_id) else {
            return false;
        };
        participant.online = online;
        self.refresh_online();
        true
    }

    /// Refresh the last-message projection.
    pub fn record_message(&mut self, message: &Message) {
        let newer = self
            .last_message
            .as_ref()
            .map_or(true, |last| message.id >= last.id);
        if newer {
            self.last_message = Some(message.clone());
            self.last_message_at = Some(message.created_at);
        }
    }

    fn refresh_online(&mut self) {
        let online = self.counterparts().any(|p| p.online);
        self.participant_online = online;
    }
}

/// Highest read receipt seen from another user in the active conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWatermark {
    pub up_to: MessageId,
    pub at: DateTime<Utc>,
}

impl ReadWatermark {
    /// Keep whichever watermark reaches further.
    pub fn raise(current: Option<Self>, next: Self) -> Self {
        match current {
            Some(current) if current.up_to >= next.up_to => current,
            _ => next,
        }
    }

    pub fn covers(&self, id: MessageId) -> bool {
        id <= self.up_to
    }
}

/// Message sequence of one conversation, ordered by id, without duplicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationMessages {
    messages: Vec<Message>,
}

impl ConversationMessages {
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.messages.last().map(|m| m.id)
    }

    /// Append a pushed message at the tail.
    /// Returns false if a message with the same id is already cached.
    pub fn append(&mut self, message: Message) -> bool {
        if self.contains(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Insert at the position its id sorts to.
    /// Returns false if a message with the same id is already cached.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(message.id) {
            return false;
        }
        let pos = self.messages.partition_point(|m| m.id < message.id);
        self.messages.insert(pos, message);
        true
    }

    /// Merge a history page (any order) into the sequence.
    pub fn merge_history(&mut self, page: Vec<Message>) -> usize {
        page.into_iter().map(|m| usize::from(self.insert(m))).sum()
    }

    /// Set `read_at` on every message with id <= `up_to` that has none.
    /// `None` covers every cached message. Returns how many changed.
    pub fn apply_read(&mut self, up_to: Option<MessageId>, at: DateTime<Utc>) -> usize {
        self.messages
            .iter_mut()
            .filter(|m| up_to.map_or(true, |limit| m.id <= limit))
            .map(|m| usize::from(m.mark_read(at)))
            .sum()
    }
}

/// The selected conversation and its ephemeral state.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveConversation {
    pub id: ConversationId,
    pub messages: ConversationMessages,
    /// Other users currently typing here.
    pub typing_users: BTreeSet<UserId>,
    pub history_loaded: bool,
    pub read_watermark: Option<ReadWatermark>,
}

impl ActiveConversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            messages: ConversationMessages::default(),
            typing_users: BTreeSet::new(),
            history_loaded: false,
            read_watermark: None,
        }
    }

    /// Stamp `message` with the watermark if it falls under it.
    pub fn apply_watermark(&self, message: &mut Message) {
        if let Some(watermark) = self.read_watermark {
            if watermark.covers(message.id) {
                message.mark_read(watermark.at);
            }
        }
    }
}

/// User-visible outcomes that are not part of the state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A connection attempt failed or the broker reported an error. The
    /// session keeps retrying.
    ConnectionError { reason: String },
    ConnectionLost,
    /// A fallback send failed; `draft` is the unsent text.
    SendFailed {
        conversation_id: ConversationId,
        draft: String,
        reason: String,
    },
    RequestFailed { action: &'static str, reason: String },
}
