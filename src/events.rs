use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Delivers every emitted event to every live subscriber, in emission order.
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: Mutex<Vec<UnboundedSender<E>>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.emit(i);
        }
        for expected in 0..5 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.emit("before");
        let mut rx = bus.subscribe();
        bus.emit("after");
        assert_eq!(tokio_test::block_on(rx.recv()), Some("after"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);
        bus.emit("x");
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }
}
