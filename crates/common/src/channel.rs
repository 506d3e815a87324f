//! Bounded channel bridge between the backend context and the consumer pump
//!
//! Backend threads never invoke user callbacks. They only mutate shared
//! completion queues and snapshot state, then post a [`PumpEvent`] here. The
//! consumer context drains the queue once per pump cycle and performs every
//! callback itself.
//!
//! Posting never blocks: a backend thread stuck on a full queue could keep a
//! controller from being joined. When the queue is full the notifier raises an
//! overflow flag instead, and the consumer answers it with a full sweep.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{trace, warn};

/// Events posted from the backend context
#[derive(Debug)]
pub enum PumpEvent<D> {
    /// A device has completed requests awaiting delivery
    RequestsCompleted(D),
    /// A controller published a new device-list snapshot
    DevicesChanged,
}

/// Backend-side handle (cheap to clone, never blocks)
pub struct PumpNotifier<D> {
    tx: Sender<PumpEvent<D>>,
    overflowed: Arc<AtomicBool>,
}

impl<D> Clone for PumpNotifier<D> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            overflowed: self.overflowed.clone(),
        }
    }
}

impl<D> PumpNotifier<D> {
    /// Post an event for the next pump cycle
    ///
    /// Returns `false` when the event could not be queued. A full queue is
    /// recorded as an overflow; a closed queue means the consumer is gone.
    pub fn notify(&self, event: PumpEvent<D>) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    warn!("Pump queue full, consumer will fall back to a full sweep");
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Pump queue closed, dropping event");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Result of draining the queue once
#[derive(Debug)]
pub struct Drained<D> {
    pub events: Vec<PumpEvent<D>>,
    /// Events were lost since the previous drain
    pub overflowed: bool,
}

/// Consumer-side handle
pub struct PumpReceiver<D> {
    rx: Receiver<PumpEvent<D>>,
    overflowed: Arc<AtomicBool>,
}

impl<D> PumpReceiver<D> {
    /// Take every queued event without blocking
    pub fn drain(&self) -> Drained<D> {
        let overflowed = self.overflowed.swap(false, Ordering::AcqRel);
        let mut events = Vec::with_capacity(self.rx.len());
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        Drained { events, overflowed }
    }

    /// Wait for the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<PumpEvent<D>> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Wait for the next event
    pub async fn recv(&self) -> crate::Result<PumpEvent<D>> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Close the queue; subsequent notifications are dropped
    pub fn close(&self) {
        self.rx.close();
    }
}

/// Create the bridge between backend threads and the consumer pump
///
/// Returns (PumpNotifier for backends, PumpReceiver for the consumer)
pub fn create_pump_bridge<D>(capacity: usize) -> (PumpNotifier<D>, PumpReceiver<D>) {
    let (tx, rx) = bounded(capacity.max(1));
    let overflowed = Arc::new(AtomicBool::new(false));

    (
        PumpNotifier {
            tx,
            overflowed: overflowed.clone(),
        },
        PumpReceiver { rx, overflowed },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let (notifier, receiver) = create_pump_bridge::<u32>(8);
        assert!(notifier.notify(PumpEvent::RequestsCompleted(1)));
        assert!(notifier.notify(PumpEvent::DevicesChanged));
        assert!(notifier.notify(PumpEvent::RequestsCompleted(2)));

        let drained = receiver.drain();
        assert!(!drained.overflowed);
        assert_eq!(drained.events.len(), 3);
        assert!(matches!(drained.events[0], PumpEvent::RequestsCompleted(1)));
        assert!(matches!(drained.events[1], PumpEvent::DevicesChanged));
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_full_queue_sets_overflow_once() {
        let (notifier, receiver) = create_pump_bridge::<u32>(1);
        assert!(notifier.notify(PumpEvent::DevicesChanged));
        assert!(!notifier.notify(PumpEvent::RequestsCompleted(7)));

        let drained = receiver.drain();
        assert!(drained.overflowed);
        assert_eq!(drained.events.len(), 1);

        // flag is reset by the drain
        assert!(!receiver.drain().overflowed);
    }

    #[test]
    fn test_closed_queue_drops_events() {
        let (notifier, receiver) = create_pump_bridge::<u32>(4);
        receiver.close();
        assert!(notifier.is_closed());
        assert!(!notifier.notify(PumpEvent::DevicesChanged));
        assert!(!receiver.drain().overflowed);
    }

    #[tokio::test]
    async fn test_async_recv_from_backend_thread() {
        let (notifier, receiver) = create_pump_bridge::<u32>(4);

        let handle = std::thread::spawn(move || notifier.notify(PumpEvent::RequestsCompleted(3)));

        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, PumpEvent::RequestsCompleted(3)));
        assert!(handle.join().unwrap());
    }
}
