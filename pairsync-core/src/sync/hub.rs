//! Per-device push channels.
//!
//! Each connected companion gets a bounded queue. Publishing never blocks the
//! writer: a device whose queue is full or closed is dropped from the hub and
//! catches up by pulling on reconnect.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::SyncMessage;

struct Subscriber {
    profile_scope: String,
    tx: mpsc::Sender<SyncMessage>,
}

/// Registry of open duplex channels, keyed by device.
pub struct PushHub {
    buffer: usize,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl PushHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Open a channel for `device_id`, replacing any previous one.
    pub fn subscribe(&self, device_id: Uuid, profile_scope: &str) -> mpsc::Receiver<SyncMessage> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if let Ok(mut subs) = self.subscribers.lock() {
            let previous = subs.insert(
                device_id,
                Subscriber {
                    profile_scope: profile_scope.to_string(),
                    tx,
                },
            );
            if previous.is_some() {
                debug!("Replaced push channel for device {}", device_id);
            }
        }
        rx
    }

    /// Deliver a message to every device subscribed to `profile_scope`.
    /// Returns how many devices accepted it.
    pub fn publish(&self, profile_scope: &str, message: &SyncMessage) -> usize {
        let Ok(mut subs) = self.subscribers.lock() else {
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|device_id, sub| {
            if sub.profile_scope != profile_scope {
                return true;
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Push queue full for device {}; it will resume by pulling", device_id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Push channel for device {} closed", device_id);
                    false
                }
            }
        });
        delivered
    }

    /// Deliver a message to one device.
    pub fn send_to(&self, device_id: &Uuid, message: SyncMessage) -> bool {
        let Ok(mut subs) = self.subscribers.lock() else {
            return false;
        };
        match subs.get(device_id) {
            Some(sub) => {
                if sub.tx.try_send(message).is_ok() {
                    true
                } else {
                    subs.remove(device_id);
                    false
                }
            }
            None => false,
        }
    }

    /// Close a device's channel, optionally sending one last message.
    ///
    /// Returns true only if a channel was open and `last`, when given, was
    /// queued on it. A full queue drops the channel and the message with it.
    pub fn disconnect(&self, device_id: &Uuid, last: Option<SyncMessage>) -> bool {
        let removed = self
            .subscribers
            .lock()
            .ok()
            .and_then(|mut subs| subs.remove(device_id));
        let Some(sub) = removed else {
            return false;
        };
        debug!("Disconnected push channel for device {}", device_id);
        match last {
            Some(message) => match sub.tx.try_send(message) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Final message for device {} not queued: {}", device_id, e);
                    false
                }
            },
            None => true,
        }
    }

    pub fn is_subscribed(&self, device_id: &Uuid) -> bool {
        self.subscribers
            .lock()
            .map(|subs| subs.contains_key(device_id))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_only_matching_profile() {
        let hub = PushHub::new(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(a, "personal");
        let mut rx_b = hub.subscribe(b, "work");

        let delivered = hub.publish("personal", &SyncMessage::Resync);
        assert_eq!(delivered, 1);
        assert_eq!(rx_a.try_recv().unwrap(), SyncMessage::Resync);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn slow_subscriber_is_dropped() {
        let hub = PushHub::new(1);
        let device = Uuid::new_v4();
        let _rx = hub.subscribe(device, "personal");

        assert_eq!(hub.publish("personal", &SyncMessage::Heartbeat { head_version: 1 }), 1);
        assert_eq!(hub.publish("personal", &SyncMessage::Heartbeat { head_version: 2 }), 0);
        assert!(!hub.is_subscribed(&device));
    }

    #[test]
    fn closed_receiver_is_dropped() {
        let hub = PushHub::new(4);
        let device = Uuid::new_v4();
        drop(hub.subscribe(device, "personal"));
        assert_eq!(hub.publish("personal", &SyncMessage::Resync), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn disconnect_sends_final_message() {
        let hub = PushHub::new(4);
        let device = Uuid::new_v4();
        let mut rx = hub.subscribe(device, "personal");

        assert!(hub.disconnect(&device, Some(SyncMessage::Wipe)));
        assert_eq!(rx.try_recv().unwrap(), SyncMessage::Wipe);
        assert!(rx.try_recv().is_err());
        assert!(!hub.disconnect(&device, None));
    }

    #[test]
    fn disconnect_reports_undelivered_final_message() {
        let hub = PushHub::new(1);
        let device = Uuid::new_v4();
        let mut rx = hub.subscribe(device, "personal");
        assert!(hub.send_to(&device, SyncMessage::Heartbeat { head_version: 0 }));

        assert!(!hub.disconnect(&device, Some(SyncMessage::Wipe)));
        assert!(!hub.is_subscribed(&device));
        assert_eq!(rx.try_recv().unwrap(), SyncMessage::Heartbeat { head_version: 0 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_to_targets_one_device() {
        let hub = PushHub::new(4);
        let device = Uuid::new_v4();
        let mut rx = hub.subscribe(device, "personal");
        assert!(hub.send_to(&device, SyncMessage::Resync));
        assert!(!hub.send_to(&Uuid::new_v4(), SyncMessage::Resync));
        assert_eq!(rx.try_recv().unwrap(), SyncMessage::Resync);
    }
}
