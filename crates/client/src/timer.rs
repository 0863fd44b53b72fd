//! Cancellable timers that report back into the event loop.
//!
//! A timer never touches state itself; it sends a [`TimerEvent`] to the
//! event-processing context, which checks the event's epoch before acting.
//! Dropping the [`TimerHandle`] cancels the timer.

use std::time::Duration;

use chatsync_shared::ConversationId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// Ticks delivered to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Heartbeat { epoch: u64 },
    TypingIdle { conversation_id: ConversationId, epoch: u64 },
}

pub type TimerSender = mpsc::UnboundedSender<TimerEvent>;

/// Owner of one scheduled timer task.
#[derive(Debug)]
pub struct TimerHandle(JoinHandle<()>);

impl TimerHandle {
    /// Fire `event` once after `delay`.
    pub fn once(delay: Duration, tx: TimerSender, event: TimerEvent) -> Self {
        Self(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(event);
        }))
    }

    /// Fire `event` every `period`, first after one full period.
    pub fn every(period: Duration, tx: TimerSender, event: TimerEvent) -> Self {
        Self(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if tx.send(event).is_err() {
                    break;
                }
            }
        }))
    }

    pub fn cancel(self) {}
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}
