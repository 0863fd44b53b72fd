//! Presence announcements and the heartbeat timer.
//!
//! Presence is advisory: announcements and heartbeats are fire-and-forget,
//! and a heartbeat tick that lands after the session went away publishes
//! nothing.

use std::time::Duration;

use chatsync_shared::{app, DeviceInfo};

use crate::timer::{TimerEvent, TimerHandle, TimerSender};
use crate::transport::{publish_json, Identity, Transport};

pub struct PresenceDriver {
    principal: String,
    device: DeviceInfo,
    interval: Duration,
    timers: TimerSender,
    heartbeat: Option<TimerHandle>,
    /// Bumped whenever the heartbeat is (re)started or stopped; ticks from an
    /// older timer are ignored.
    epoch: u64,
}

impl PresenceDriver {
    pub fn new(identity: &Identity, device_info: &str, interval: Duration, timers: TimerSender) -> Self {
        Self {
            principal: identity.principal.clone(),
            device: DeviceInfo {
                device_info: device_info.to_string(),
            },
            interval,
            timers,
            heartbeat: None,
            epoch: 0,
        }
    }

    /// Announce online and start the heartbeat.
    pub fn on_connected<T: Transport + ?Sized>(&mut self, transport: &T) {
        publish_json(transport, &app::online(&self.principal), &self.device);
        self.epoch += 1;
        self.heartbeat = Some(TimerHandle::every(
            self.interval,
            self.timers.clone(),
            TimerEvent::Heartbeat { epoch: self.epoch },
        ));
        crate::log_debug!("Heartbeat started every {:?}", self.interval);
    }

    pub fn on_heartbeat<T: Transport + ?Sized>(&mut self, transport: &T, epoch: u64) {
        if epoch != self.epoch || self.heartbeat.is_none() {
            return;
        }
        if !transport.is_connected() {
            self.stop();
            return;
        }
        publish_json(transport, &app::heartbeat(&self.principal), &self.device);
    }

    /// The session dropped: stop pinging a dead connection.
    pub fn on_disconnected(&mut self) {
        self.stop();
    }

    /// Explicit logout: announce offline, then stop.
    pub fn announce_offline<T: Transport + ?Sized>(&mut self, transport: &T) {
        publish_json(transport, &app::offline(&self.principal), &self.device);
        self.stop();
    }

    pub fn is_beating(&self) -> bool {
        self.heartbeat.is_some()
    }

    fn stop(&mut self) {
        if let Some(timer) = self.heartbeat.take() {
            timer.cancel();
            self.epoch += 1;
        }
    }
}
