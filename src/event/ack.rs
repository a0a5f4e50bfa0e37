//! Acknowledgement correlation.
//!
//! Each session hands out increasing ack ids. An emit that expects a reply
//! registers a waiter under its id; the matching `ack` packet fulfills it
//! exactly once. Closing the session drops every waiter, which the caller
//! observes as [`ProtocolError::AckAbandoned`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::packet::Arg;
use crate::core::ProtocolError;

/// Pending acknowledgements for one session.
#[derive(Debug, Default)]
pub struct AckCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<Arg>>>>,
}

impl AckCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and register a waiter for it.
    pub fn register(&self) -> AckReceiver {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        AckReceiver { id, rx }
    }

    /// Fulfill the waiter for `id`.
    ///
    /// Returns `false` when nothing is waiting.
    pub fn fulfill(&self, id: u64, values: Vec<Arg>) -> bool {
        let Some(tx) = self.pending.lock().remove(&id) else {
            return false;
        };
        // The caller may have dropped its receiver; the ack is still consumed.
        let _ = tx.send(values);
        true
    }

    /// Forget the waiter for `id` without fulfilling it.
    pub fn cancel(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Drop every waiter.
    pub fn abandon_all(&self) {
        self.pending.lock().clear();
    }

    /// Number of outstanding acknowledgements.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Resolves to the reply values of an acknowledged emit.
#[derive(Debug)]
pub struct AckReceiver {
    id: u64,
    rx: oneshot::Receiver<Vec<Arg>>,
}

impl AckReceiver {
    /// The ack id carried by the emitted event.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for AckReceiver {
    type Output = Result<Vec<Arg>, ProtocolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| ProtocolError::AckAbandoned))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_ids_increase() {
        let acks = AckCorrelator::new();
        let ids: Vec<u64> = (0..4).map(|_| acks.register().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fulfill_once() {
        let acks = AckCorrelator::new();
        let rx = acks.register();
        let id = rx.id();

        assert!(acks.fulfill(id, vec!["ok".into()]));
        assert!(!acks.fulfill(id, vec!["again".into()]));
        assert_eq!(rx.await.unwrap(), vec![Arg::from("ok")]);
        assert_eq!(acks.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let acks = AckCorrelator::new();
        let first = acks.register();
        let second = acks.register();

        assert!(acks.fulfill(second.id(), vec!["b".into()]));
        assert!(acks.fulfill(first.id(), vec!["a".into()]));
        assert_eq!(first.await.unwrap(), vec![Arg::from("a")]);
        assert_eq!(second.await.unwrap(), vec![Arg::from("b")]);
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let acks = AckCorrelator::new();
        assert!(!acks.fulfill(42, vec![]));
    }

    #[tokio::test]
    async fn test_abandon_resolves_waiters() {
        let acks = AckCorrelator::new();
        let rx = acks.register();
        acks.abandon_all();
        assert!(matches!(rx.await, Err(ProtocolError::AckAbandoned)));
    }

    #[tokio::test]
    async fn test_concurrent_registration_yields_unique_ids() {
        let acks = Arc::new(AckCorrelator::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let acks = Arc::clone(&acks);
                tokio::spawn(async move { acks.register().id() })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }
}
