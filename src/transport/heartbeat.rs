//! Heartbeat monitor.
//!
//! The connecting role sends a `ping` every ping interval. Liveness is
//! enforced implicitly: every read and write on the session carries a
//! deadline derived from the same parameters, and a single missed deadline
//! closes the session. There is no retry or backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::packet::{Packet, Parameters, Payload};
use super::session::{Deadlines, Session};

/// Heartbeat parameters for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

impl Heartbeat {
    /// Create a heartbeat with explicit timing.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Use the timing negotiated in a handshake.
    pub fn from_parameters(params: &Parameters) -> Self {
        Self::new(params.ping_interval(), params.ping_timeout())
    }

    /// Interval between pings.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time allowed for a ping round trip.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read/write deadlines enforcing liveness on the session.
    pub fn deadlines(&self) -> Deadlines {
        Deadlines::from_heartbeat(self.interval, self.timeout)
    }

    /// Start sending pings on `session` until it closes or `shutdown` fires.
    ///
    /// A failed ping write closes the session.
    pub fn spawn(self, session: Arc<Session>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    () = session.closed() => break,
                    () = tokio::time::sleep(self.interval) => {}
                }
                if let Err(e) = session.write(Packet::ping(Payload::empty())).await {
                    warn!(sid = %session.id(), error = %e, "ping failed");
                    let _ = session.close().await;
                    break;
                }
            }
            debug!(sid = %session.id(), "heartbeat stopped");
        })
    }
}
