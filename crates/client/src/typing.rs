//! Debounced local typing announcements.
//!
//! Per conversation: `Idle -> Typing` on the first keystroke (announce
//! start), each further keystroke pushes the inactivity deadline out, and
//! expiry or an explicit stop goes back to `Idle` (announce stop). At most
//! one start and one stop go out per burst.

use std::collections::HashMap;
use std::time::Duration;

use chatsync_shared::{app, ConversationId, TypingRequest};

use crate::timer::{TimerEvent, TimerHandle, TimerSender};
use crate::transport::{publish_json, Transport};

struct Burst {
    epoch: u64,
    _timer: TimerHandle,
}

pub struct TypingCoordinator {
    principal: String,
    timeout: Duration,
    timers: TimerSender,
    bursts: HashMap<ConversationId, Burst>,
    next_epoch: u64,
}

impl TypingCoordinator {
    pub fn new(principal: &str, timeout: Duration, timers: TimerSender) -> Self {
        Self {
            principal: principal.to_string(),
            timeout,
            timers,
            bursts: HashMap::new(),
            next_epoch: 0,
        }
    }

    /// A local keystroke in `conversation_id`.
    pub fn keystroke<T: Transport + ?Sized>(&mut self, transport: &T, conversation_id: ConversationId) {
        if !self.bursts.contains_key(&conversation_id) {
            self.announce(transport, conversation_id, true);
        }
        // Replacing the burst drops (and so cancels) the previous timer.
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let timer = TimerHandle::once(
            self.timeout,
            self.timers.clone(),
            TimerEvent::TypingIdle {
                conversation_id,
                epoch,
            },
        );
        self.bursts.insert(conversation_id, Burst { epoch, _timer: timer });
    }

    /// The inactivity timer fired. Ticks from a superseded timer are ignored.
    pub fn expire<T: Transport + ?Sized>(&mut self, transport: &T, conversation_id: ConversationId, epoch: u64) {
        let current = self.bursts.get(&conversation_id).map(|b| b.epoch);
        if current != Some(epoch) {
            return;
        }
        self.bursts.remove(&conversation_id);
        self.announce(transport, conversation_id, false);
    }

    /// End a burst now (message sent, or conversation switched away).
    /// Returns true if a stop was announced.
    pub fn stop<T: Transport + ?Sized>(&mut self, transport: &T, conversation_id: ConversationId) -> bool {
        if self.bursts.remove(&conversation_id).is_none() {
            return false;
        }
        self.announce(transport, conversation_id, false);
        true
    }

    /// Drop every burst without announcing. Used when the session is gone.
    pub fn cancel_all(&mut self) {
        self.bursts.clear();
    }

    pub fn is_typing(&self, conversation_id: ConversationId) -> bool {
        self.bursts.contains_key(&conversation_id)
    }

    fn announce<T: Transport + ?Sized>(&self, transport: &T, conversation_id: ConversationId, is_typing: bool) {
        publish_json(
            transport,
            &app::typing(&self.principal),
            &TypingRequest {
                conversation_id,
                is_typing,
            },
        );
    }
}
