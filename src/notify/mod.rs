//! Cross-instance change notification.
//!
//! Best-effort, fire-and-forget. Events carry only a tag; subscribers re-read the store
//! for data. Without a bus the notifier degrades to a no-op.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const BUS_CAPACITY: usize = 64;

/// Events exchanged between instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// Persisted state changed; re-read the store.
    StateUpdated,
}

impl StoreEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreEvent::StateUpdated => "state-updated",
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    event: StoreEvent,
}

/// Shared channel that instances connect to.
#[derive(Debug, Clone)]
pub struct NotifierBus {
    sender: broadcast::Sender<Envelope>,
}

impl NotifierBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }
}

impl Default for NotifierBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One instance's endpoint on the bus.
#[derive(Debug, Clone)]
pub struct Notifier {
    origin: Uuid,
    sender: Option<broadcast::Sender<Envelope>>,
}

impl Notifier {
    /// Notifier for environments without a shared channel.
    pub fn disabled() -> Self {
        Self {
            origin: Uuid::new_v4(),
            sender: None,
        }
    }

    pub fn connect(bus: &NotifierBus) -> Self {
        Self {
            origin: Uuid::new_v4(),
            sender: Some(bus.sender.clone()),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_some()
    }

    /// Publish `event` to every other instance. Never fails.
    pub fn publish(&self, event: StoreEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        // No receivers is not an error.
        let _ = sender.send(Envelope {
            origin: self.origin,
            event,
        });
    }

    /// Run `handler` for every event published by other instances.
    ///
    /// Returns `None` when the notifier is disabled. Lagging subscribers skip the
    /// events they missed.
    pub fn subscribe<F>(&self, handler: F) -> Option<JoinHandle<()>>
    where
        F: Fn(StoreEvent) + Send + 'static,
    {
        let mut receiver = self.sender.as_ref()?.subscribe();
        let origin = self.origin;
        Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) if envelope.origin != origin => handler(envelope.event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "Notifier subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_other_instances_receive_events() {
        let bus = NotifierBus::new();
        let writer = Notifier::connect(&bus);
        let reader = Notifier::connect(&bus);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_reader = seen.clone();
        reader
            .subscribe(move |event| {
                assert_eq!(event, StoreEvent::StateUpdated);
                seen_by_reader.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let seen_by_writer = Arc::new(AtomicUsize::new(0));
        let own = seen_by_writer.clone();
        writer
            .subscribe(move |_| {
                own.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        writer.publish(StoreEvent::StateUpdated);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(seen_by_writer.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_noop() {
        let notifier = Notifier::disabled();
        notifier.publish(StoreEvent::StateUpdated);
        assert!(notifier.subscribe(|_| {}).is_none());
        assert!(!notifier.is_connected());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = NotifierBus::new();
        Notifier::connect(&bus).publish(StoreEvent::StateUpdated);
        assert_eq!(StoreEvent::StateUpdated.as_str(), "state-updated");
    }
}
