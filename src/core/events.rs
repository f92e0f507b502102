//! In-process publish/subscribe.
//!
//! Each subscriber owns an unbounded crossbeam channel. Events from one
//! producer reach every live subscriber in emission order; subscribers whose
//! receiver was dropped are pruned on the next emit.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// A fan-out event bus.
pub struct EventBus<E> {
    subscribers: Mutex<Vec<Sender<E>>>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers as of the last emit.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_preserves_order() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        for i in 0..5 {
            bus.emit(i);
        }

        assert_eq!(a.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(b.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit("hello");
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.recv().unwrap(), "hello");
    }
}
