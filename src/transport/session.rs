//! Session lifecycle and the transport-upgrade state machine.
//!
//! ```text
//!            pause()               resume_with(T', conn')
//!   Active(T) ─────────▶ Paused ───────────────────────▶ Active(T')
//!       │                  │
//!       └──── close() ─────┴──────────────▶ Closed
//! ```
//!
//! The connection reference, the held-packet queue and the state are all
//! changed under one per-session lock, so a writer either sees `Active` and
//! writes to the current connection, or sees `Paused` and queues.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, Request};
use super::packet::Packet;
use crate::core::{TransportError, TransportResult};

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reads and writes go to the current connection.
    Active,
    /// An upgrade is in progress; writes are held.
    Paused,
    /// Terminal.
    Closed,
}

/// Read and write deadlines applied to every connection operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    /// Maximum wait for the next inbound packet.
    pub read: Duration,
    /// Maximum time for a single outbound packet.
    pub write: Duration,
}

impl Deadlines {
    /// Derive deadlines from negotiated heartbeat parameters.
    ///
    /// Reads must tolerate a full ping interval plus its timeout.
    pub fn from_heartbeat(ping_interval: Duration, ping_timeout: Duration) -> Self {
        Self {
            read: ping_interval + ping_timeout,
            write: ping_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Phase {
    state: SessionState,
    /// Bumped each time the connection is swapped.
    generation: u64,
}

struct Link {
    conn: Option<Arc<dyn Connection>>,
    held: VecDeque<Packet>,
}

/// One logical connection, independent of the transport carrying it.
pub struct Session {
    id: String,
    transport: RwLock<String>,
    deadlines: Deadlines,
    link: Mutex<Link>,
    phase: watch::Sender<Phase>,
    closed: CancellationToken,
    close_once: AtomicBool,
}

impl Session {
    /// Create an active session on `conn`.
    pub fn new(
        id: impl Into<String>,
        transport: impl Into<String>,
        conn: Arc<dyn Connection>,
        deadlines: Deadlines,
    ) -> Self {
        let (phase, _) = watch::channel(Phase {
            state: SessionState::Active,
            generation: 0,
        });
        Self {
            id: id.into(),
            transport: RwLock::new(transport.into()),
            deadlines,
            link: Mutex::new(Link {
                conn: Some(conn),
                held: VecDeque::new(),
            }),
            phase,
            closed: CancellationToken::new(),
            close_once: AtomicBool::new(false),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the transport currently carrying the session.
    pub fn transport(&self) -> String {
        self.transport.read().clone()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.phase.borrow().state
    }

    /// Check if the session has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Deadlines applied to connection I/O.
    pub fn deadlines(&self) -> Deadlines {
        self.deadlines
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of packets held while paused.
    pub async fn held_len(&self) -> usize {
        self.link.lock().await.held.len()
    }

    /// Write one packet.
    pub async fn write(&self, packet: Packet) -> TransportResult<()> {
        self.write_all(vec![packet]).await
    }

    /// Write packets back to back; no other writer can interleave.
    ///
    /// Queues while paused, fails immediately once closed.
    pub async fn write_all(&self, packets: Vec<Packet>) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let mut link = self.link.lock().await;
        match self.state() {
            SessionState::Closed => Err(TransportError::SessionClosed),
            SessionState::Paused => {
                link.held.extend(packets);
                Ok(())
            }
            SessionState::Active => {
                let conn = link.conn.clone().ok_or(TransportError::SessionClosed)?;
                for packet in packets {
                    self.write_to(&conn, packet).await?;
                }
                Ok(())
            }
        }
    }

    async fn write_to(&self, conn: &Arc<dyn Connection>, packet: Packet) -> TransportResult<()> {
        tracing::trace!(sid = %self.id, kind = ?packet.kind, "write packet");
        tokio::time::timeout(self.deadlines.write, conn.write_packet(packet))
            .await
            .map_err(|_| TransportError::DeadlineExceeded)?
    }

    /// Read the next packet, following connection swaps.
    ///
    /// A read already in flight on a connection that gets retired is allowed
    /// to finish; its packet is still delivered. No new read is started
    /// while the session is paused.
    pub async fn read(&self) -> TransportResult<Packet> {
        let mut phase_rx = self.phase.subscribe();
        loop {
            let phase = *phase_rx.borrow_and_update();
            match phase.state {
                SessionState::Closed => return Err(TransportError::SessionClosed),
                SessionState::Paused => {
                    tokio::select! {
                        () = self.closed.cancelled() => return Err(TransportError::SessionClosed),
                        changed = phase_rx.changed() => {
                            if changed.is_err() {
                                return Err(TransportError::SessionClosed);
                            }
                        }
                    }
                    continue;
                }
                SessionState::Active => {}
            }

            let conn = self
                .link
                .lock()
                .await
                .conn
                .clone()
                .ok_or(TransportError::SessionClosed)?;

            let res = tokio::select! {
                () = self.closed.cancelled() => return Err(TransportError::SessionClosed),
                res = tokio::time::timeout(self.deadlines.read, conn.read_packet()) => res,
            };

            let now = *self.phase.borrow();
            let superseded =
                now.generation != phase.generation || now.state == SessionState::Paused;
            match res {
                Ok(Ok(packet)) => return Ok(packet),
                _ if superseded => {
                    debug!(sid = %self.id, "read on retired connection ended");
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(TransportError::DeadlineExceeded),
            }
        }
    }

    /// Enter `Paused`: writes are held until [`resume_with`](Self::resume_with).
    pub async fn pause(&self) -> TransportResult<()> {
        let _link = self.link.lock().await;
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        self.phase.send_modify(|phase| phase.state = SessionState::Paused);
        debug!(sid = %self.id, "session paused");
        Ok(())
    }

    /// Swap to `conn`, flush held packets in order, and return to `Active`.
    ///
    /// A write failure during the flush is terminal: both connections are
    /// released and the session ends `Closed`.
    ///
    /// The old connection is retired after the swap; an in-flight write on
    /// it has already completed because writers hold the same lock.
    pub async fn resume_with(
        &self,
        transport: impl Into<String>,
        conn: Arc<dyn Connection>,
    ) -> TransportResult<()> {
        let transport = transport.into();
        let mut link = self.link.lock().await;
        if self.is_closed() {
            drop(link);
            let _ = conn.close().await;
            return Err(TransportError::SessionClosed);
        }

        let old = link.conn.replace(Arc::clone(&conn));
        *self.transport.write() = transport.clone();

        while let Some(packet) = link.held.pop_front() {
            if let Err(e) = self.write_to(&conn, packet).await {
                drop(link);
                warn!(sid = %self.id, %transport, error = %e, "flush after swap failed, closing session");
                if let Some(old) = old {
                    if let Err(e) = old.retire().await {
                        debug!(sid = %self.id, error = %e, "retiring connection failed");
                    }
                }
                // Closes the new connection and drops what is still held.
                if let Err(e) = self.close().await {
                    debug!(sid = %self.id, error = %e, "close after failed flush");
                }
                return Err(e);
            }
        }
        self.phase.send_modify(|phase| {
            phase.state = SessionState::Active;
            phase.generation += 1;
        });
        drop(link);

        if let Some(old) = old {
            let sid = self.id.clone();
            tokio::spawn(async move {
                if let Err(e) = old.retire().await {
                    debug!(%sid, error = %e, "retiring connection failed");
                }
            });
        }
        info!(sid = %self.id, %transport, "session upgraded");
        Ok(())
    }

    /// Move the session onto a new transport: pause, swap, resume.
    pub async fn upgrade(
        &self,
        transport: impl Into<String>,
        conn: Arc<dyn Connection>,
    ) -> TransportResult<()> {
        self.pause().await?;
        self.resume_with(transport, conn).await
    }

    /// Forward a follow-up request to the current connection.
    pub async fn serve(&self, request: Request) -> TransportResult<()> {
        let conn = self
            .link
            .lock()
            .await
            .conn
            .clone()
            .ok_or(TransportError::SessionClosed)?;
        conn.serve(request).await
    }

    /// Close the session. Only the first call tears down; later calls are no-ops.
    pub async fn close(&self) -> TransportResult<()> {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closed.cancel();
        self.phase
            .send_modify(|phase| phase.state = SessionState::Closed);

        let conn = {
            let mut link = self.link.lock().await;
            link.held.clear();
            link.conn.take()
        };
        info!(sid = %self.id, "session closed");
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &*self.transport.read())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryConnection, pair};
    use crate::transport::packet::{PacketKind, Payload};

    fn deadlines() -> Deadlines {
        Deadlines::from_heartbeat(Duration::from_secs(25), Duration::from_secs(5))
    }

    fn session_on(transport: &str) -> (Arc<Session>, MemoryConnection) {
        let (local, remote) = pair(16);
        let session = Session::new("sid-1", transport, Arc::new(local), deadlines());
        (Arc::new(session), remote)
    }

    async fn text_of(conn: &MemoryConnection) -> String {
        match conn.read_packet().await.unwrap().payload {
            Payload::Text(text) => text,
            Payload::Binary(_) => panic!("expected text"),
        }
    }

    #[test]
    fn test_deadlines_from_heartbeat() {
        let d = deadlines();
        assert_eq!(d.read, Duration::from_secs(30));
        assert_eq!(d.write, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_writes_arrive_in_order() {
        let (session, peer) = session_on("websocket");
        for i in 0..10 {
            session.write(Packet::message(i.to_string())).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(text_of(&peer).await, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_failed_flush_closes_session() {
        let (session, old_peer) = session_on("polling");
        session.pause().await.unwrap();
        session.write(Packet::message("held-1")).await.unwrap();
        session.write(Packet::message("held-2")).await.unwrap();

        let (local, new_peer) = pair(16);
        new_peer.close().await.unwrap();
        let err = session
            .resume_with("websocket", Arc::new(local))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::ConnectionClosed));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_closed());
        assert_eq!(session.held_len().await, 0);
        assert!(old_peer.is_closed());
        assert!(matches!(
            session.write(Packet::message("late")).await,
            Err(TransportError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_paused_writes_are_held_then_flushed() {
        let (session, old_peer) = session_on("polling");
        session.write(Packet::message("before")).await.unwrap();

        session.pause().await.unwrap();
        assert_eq!(session.state(), SessionState::Paused);
        session.write(Packet::message("held-1")).await.unwrap();
        session.write(Packet::message("held-2")).await.unwrap();
        assert_eq!(session.held_len().await, 2);

        let (local, new_peer) = pair(16);
        session.resume_with("websocket", Arc::new(local)).await.unwrap();
        session.write(Packet::message("after")).await.unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.transport(), "websocket");
        assert_eq!(text_of(&old_peer).await, "before");
        assert_eq!(text_of(&new_peer).await, "held-1");
        assert_eq!(text_of(&new_peer).await, "held-2");
        assert_eq!(text_of(&new_peer).await, "after");
    }

    #[tokio::test]
    async fn test_old_connection_is_retired() {
        let (session, old_peer) = session_on("polling");
        let (local, _new_peer) = pair(16);
        session.upgrade("websocket", Arc::new(local)).await.unwrap();

        // Retirement runs on a spawned task.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !old_peer.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_read_follows_upgrade() {
        let (session, old_peer) = session_on("polling");
        old_peer.write_packet(Packet::message("old")).await.unwrap();
        let first = session.read().await.unwrap();
        assert_eq!(first.payload, Payload::Text("old".into()));

        // This read parks on the old connection until it is retired.
        let reader = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.read().await })
        };
        tokio::task::yield_now().await;

        let (local, new_peer) = pair(16);
        session.upgrade("websocket", Arc::new(local)).await.unwrap();
        new_peer.write_packet(Packet::message("new")).await.unwrap();

        let second = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.payload, Payload::Text("new".into()));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_writes() {
        let (session, peer) = session_on("websocket");
        session.close().await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());
        assert!(matches!(
            session.write(Packet::noop()).await,
            Err(TransportError::SessionClosed)
        ));
        assert!(matches!(
            session.read().await,
            Err(TransportError::SessionClosed)
        ));
        assert!(session.pause().await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_under_concurrency() {
        let (session, _peer) = session_on("websocket");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.close().await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (session, _peer) = session_on("websocket");
        let reader = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.read().await })
        };
        tokio::task::yield_now().await;
        session.close().await.unwrap();

        let res = reader.await.unwrap();
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_is_fatal() {
        let (session, _peer) = session_on("websocket");
        let err = session.read().await.unwrap_err();
        assert!(matches!(err, TransportError::DeadlineExceeded));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_write_all_is_contiguous() {
        let (session, peer) = session_on("websocket");
        session
            .write_all(vec![
                Packet::message("51-[\"up\",{\"_placeholder\":true,\"num\":0}]"),
                Packet::binary(vec![1u8, 2]),
            ])
            .await
            .unwrap();
        assert_eq!(peer.read_packet().await.unwrap().kind, PacketKind::Message);
        assert!(peer.read_packet().await.unwrap().payload.is_binary());
    }
}
