//! Outbound emitter for the accepting role.
//!
//! Every write to every session goes through one bounded queue drained by a
//! single task, so writes to a session keep their enqueue order and a slow
//! peer applies backpressure to producers instead of growing memory.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::{TransportError, TransportResult};
use crate::event::Outbound;
use crate::transport::{Packet, Session};

type Outgoing = (Arc<Session>, Vec<Packet>);

/// Bounded single-consumer write queue.
#[derive(Debug)]
pub struct Emitter {
    tx: mpsc::Sender<Outgoing>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Emitter {
    /// Start the consumer task. It stops once `shutdown` fires and the
    /// queue has been drained.
    pub fn spawn(capacity: usize, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(rx, shutdown));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue `packets` for `session`, waiting while the queue is full.
    pub async fn enqueue(&self, session: &Arc<Session>, packets: Vec<Packet>) -> TransportResult<()> {
        if session.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        self.tx
            .send((Arc::clone(session), packets))
            .await
            .map_err(|_| TransportError::SessionClosed)
    }

    /// Wait for the consumer task to finish.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "emitter task failed");
            }
        }
    }
}

#[async_trait]
impl Outbound for Emitter {
    async fn send(&self, session: &Arc<Session>, packets: Vec<Packet>) -> TransportResult<()> {
        self.enqueue(session, packets).await
    }
}

async fn run(mut rx: mpsc::Receiver<Outgoing>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some((session, packets)) => deliver(&session, packets).await,
                None => return,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Some((session, packets)) = rx.recv().await {
        if session.is_closed() {
            continue;
        }
        deliver(&session, packets).await;
        drained += 1;
    }
    debug!(drained, "emitter stopped");
}

async fn deliver(session: &Arc<Session>, packets: Vec<Packet>) {
    trace!(sid = %session.id(), count = packets.len(), "write");
    if let Err(e) = session.write_all(packets).await {
        if matches!(e, TransportError::SessionClosed) {
            return;
        }
        warn!(sid = %session.id(), error = %e, "write failed, closing session");
        if let Err(e) = session.close().await {
            debug!(sid = %session.id(), error = %e, "close after write failure");
        }
    }
}
