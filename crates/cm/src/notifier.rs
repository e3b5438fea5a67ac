//! Device lifecycle notifications.
//!
//! Subscribers get an unbounded crossbeam receiver. Senders whose receiver
//! was dropped are pruned on the next publish.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Created { device: u64 },
    Destroyed { device: u64 },
}

#[derive(Debug, Default)]
pub struct DeviceNotifier {
    subscribers: Mutex<Vec<Sender<DeviceEvent>>>,
}

impl DeviceNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: DeviceEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event).is_ok());
        trace!(?event, listeners = subscribers.len(), "Device event published");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_the_event() {
        let notifier = DeviceNotifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe();
        notifier.publish(DeviceEvent::Created { device: 1 });
        assert_eq!(a.try_recv().unwrap(), DeviceEvent::Created { device: 1 });
        assert_eq!(b.try_recv().unwrap(), DeviceEvent::Created { device: 1 });
    }

    #[test]
    fn dropped_receivers_pruned() {
        let notifier = DeviceNotifier::new();
        let kept = notifier.subscribe();
        drop(notifier.subscribe());
        notifier.publish(DeviceEvent::Destroyed { device: 7 });
        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(kept.recv().unwrap(), DeviceEvent::Destroyed { device: 7 });
    }
}
