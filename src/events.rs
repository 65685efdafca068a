//! Event Bus
//!
//! Fan-out of observable state to any number of frontends over tokio
//! broadcast channels. Delivery is lossy by design: a slow subscriber drops
//! old events rather than stalling the coordinator, and every device-list
//! snapshot carries a `state_id` so consumers can detect staleness.

use tokio::sync::broadcast;

use crate::registry::DeviceListSnapshot;
use crate::session::SessionEvent;
use crate::transport::bridge::PortActivity;
use crate::types::FrostKey;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for coordinator state
#[derive(Clone)]
pub struct EventBus {
    device_list: broadcast::Sender<DeviceListSnapshot>,
    key_list: broadcast::Sender<Vec<FrostKey>>,
    sessions: broadcast::Sender<SessionEvent>,
    port_activity: broadcast::Sender<PortActivity>,
}

impl EventBus {
    pub fn new() -> Self {
        let (device_list, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (key_list, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (sessions, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (port_activity, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus {
            device_list,
            key_list,
            sessions,
            port_activity,
        }
    }

    pub fn subscribe_device_list(&self) -> broadcast::Receiver<DeviceListSnapshot> {
        self.device_list.subscribe()
    }

    pub fn subscribe_key_list(&self) -> broadcast::Receiver<Vec<FrostKey>> {
        self.key_list.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }

    /// Publish the current device list; a send with no subscribers is fine
    pub fn publish_device_list(&self, snapshot: DeviceListSnapshot) {
        let _ = self.device_list.send(snapshot);
    }

    pub fn publish_key_list(&self, keys: Vec<FrostKey>) {
        let _ = self.key_list.send(keys);
    }

    pub fn publish_session_event(&self, event: SessionEvent) {
        let _ = self.sessions.send(event);
    }

    pub fn subscribe_port_activity(&self) -> broadcast::Receiver<PortActivity> {
        self.port_activity.subscribe()
    }

    pub fn publish_port_activity(&self, activity: PortActivity) {
        let _ = self.port_activity.send(activity);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
