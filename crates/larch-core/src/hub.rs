//! Best-effort in-process notification of blob arrivals.
//!
//! Every successful receive on a storage announces the new reference to
//! all current subscribers. Each subscriber owns a one-slot channel;
//! delivery never blocks the publisher and is dropped when the slot is
//! full. Subscribers must tolerate missed events and re-poll.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Publisher side of the arrival notifications for one storage.
#[derive(Default)]
pub struct BlobHub {
    subscribers: Mutex<Vec<mpsc::Sender<crate::BlobRef>>>,
}

impl BlobHub {
    pub fn new() -> BlobHub {
        BlobHub::default()
    }

    /// Register a subscriber. The returned receiver holds a single slot;
    /// dropping it unregisters on the next publish.
    pub fn subscribe(&self) -> mpsc::Receiver<crate::BlobRef> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Announce an arrival to all current subscribers, dropping the event
    /// for any subscriber whose slot is full.
    pub fn notify(&self, br: &crate::BlobRef) {
        self.subscribers.lock().retain(|tx| match tx.try_send(br.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Block up to `wait` for any arrival. Returns true if something
    /// arrived, false on deadline (or a zero wait).
    pub async fn wait_any(&self, wait: Duration) -> bool {
        if wait.is_zero() {
            return false;
        }
        let mut rx = self.subscribe();
        matches!(tokio::time::timeout(wait, rx.recv()).await, Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlobRef;

    #[tokio::test]
    async fn subscriber_gets_notification() {
        let hub = BlobHub::new();
        let mut rx = hub.subscribe();
        let br = BlobRef::must_parse("sha1-00ff");
        hub.notify(&br);
        assert_eq!(rx.recv().await, Some(br));
    }

    #[tokio::test]
    async fn full_slot_drops_instead_of_blocking() {
        let hub = BlobHub::new();
        let mut rx = hub.subscribe();
        let a = BlobRef::must_parse("sha1-aa");
        let b = BlobRef::must_parse("sha1-bb");
        hub.notify(&a);
        hub.notify(&b); // slot already full, dropped
        assert_eq!(rx.recv().await, Some(a));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let hub = BlobHub::new();
        let rx = hub.subscribe();
        drop(rx);
        hub.notify(&BlobRef::must_parse("sha1-aa"));
        assert_eq!(hub.subscribers.lock().len(), 0);
    }

    #[tokio::test]
    async fn wait_any_times_out() {
        let hub = BlobHub::new();
        assert!(!hub.wait_any(Duration::from_millis(10)).await);
        assert!(!hub.wait_any(Duration::ZERO).await);
    }
}
