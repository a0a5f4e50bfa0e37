//! In-process transport.
//!
//! A frame-level duplex pipe that behaves like a persistent full-duplex
//! transport. Packets are encoded to [`Frame`]s on write and decoded on read,
//! so the control codec runs exactly as it would over a socket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::connection::{Acceptor, Connection, Dialer, Headers, Request};
use super::packet::{Frame, Packet};
use crate::core::{QUERY_TRANSPORT, TransportError, TransportResult};

/// Default number of frames buffered per direction.
pub const DEFAULT_PIPE_CAPACITY: usize = 64;

/// One end of an in-memory pipe.
#[derive(Debug)]
pub struct MemoryConnection {
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    closed: CancellationToken,
}

/// Create a connected pair of in-memory connections.
///
/// Closing either end closes both.
pub fn pair(capacity: usize) -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    let closed = CancellationToken::new();

    let a = MemoryConnection {
        tx: a_tx,
        rx: Mutex::new(a_rx),
        closed: closed.clone(),
    };
    let b = MemoryConnection {
        tx: b_tx,
        rx: Mutex::new(b_rx),
        closed,
    };
    (a, b)
}

impl MemoryConnection {
    /// Write a raw frame, bypassing the packet encoder.
    pub async fn write_frame(&self, frame: Frame) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            sent = self.tx.send(frame) => sent.map_err(|_| TransportError::ConnectionClosed),
        }
    }

    /// Read a raw frame.
    ///
    /// Frames already buffered are still delivered after close.
    pub async fn read_frame(&self) -> TransportResult<Frame> {
        let mut rx = self.rx.lock().await;
        if let Ok(frame) = rx.try_recv() {
            return Ok(frame);
        }
        tokio::select! {
            biased;
            frame = rx.recv() => frame.ok_or(TransportError::ConnectionClosed),
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }

    /// Check if the pipe has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read_packet(&self) -> TransportResult<Packet> {
        let frame = self.read_frame().await?;
        Ok(Packet::decode(frame)?)
    }

    async fn write_packet(&self, packet: Packet) -> TransportResult<()> {
        self.write_frame(packet.encode()).await
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Dials by handing the far end of a fresh pipe to a request channel.
///
/// Whoever drains the channel plays the accepting role, typically by
/// passing each [`Request`] to a server's request handler.
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    transport: String,
    requests: mpsc::Sender<Request>,
    capacity: usize,
}

impl MemoryDialer {
    /// Create a dialer for the named transport.
    pub fn new(transport: impl Into<String>, requests: mpsc::Sender<Request>) -> Self {
        Self {
            transport: transport.into(),
            requests,
            capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    /// Set the per-direction buffer size of dialed pipes.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    fn transport_name(&self) -> &str {
        &self.transport
    }

    async fn dial(&self, url: &str, headers: &Headers) -> TransportResult<Arc<dyn Connection>> {
        let url = Url::parse(url).map_err(|e| TransportError::Unsupported(e.to_string()))?;
        let mut query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        query
            .entry(QUERY_TRANSPORT.to_string())
            .or_insert_with(|| self.transport.clone());

        let (local, remote) = pair(self.capacity);
        let request = Request::new(query)
            .with_headers(headers.clone())
            .with_upgrade(remote);
        self.requests
            .send(request)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(Arc::new(local))
    }
}

/// Accepts requests that carry a [`MemoryConnection`].
#[derive(Debug, Clone)]
pub struct MemoryAcceptor {
    transport: String,
}

impl MemoryAcceptor {
    /// Create an acceptor for the named transport.
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
        }
    }
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    fn transport_name(&self) -> &str {
        &self.transport
    }

    async fn accept(&self, request: &mut Request) -> TransportResult<Arc<dyn Connection>> {
        let conn = request.take_upgrade::<MemoryConnection>().ok_or_else(|| {
            TransportError::Unsupported("request carries no in-memory connection".into())
        })?;
        Ok(Arc::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DecodeError;
    use crate::transport::packet::{PacketKind, Payload};

    #[tokio::test]
    async fn test_pair_exchanges_packets() {
        let (a, b) = pair(4);
        a.write_packet(Packet::message("hello")).await.unwrap();

        let packet = b.read_packet().await.unwrap();
        assert_eq!(packet.kind, PacketKind::Message);
        assert_eq!(packet.payload, Payload::Text("hello".into()));
    }

    #[tokio::test]
    async fn test_buffered_frames_survive_close() {
        let (a, b) = pair(4);
        a.write_packet(Packet::noop()).await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.read_packet().await.unwrap().kind, PacketKind::Noop);
        assert!(matches!(
            b.read_packet().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            b.write_packet(Packet::noop()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let (a, b) = pair(4);
        a.write_frame(Frame::Text("x".into())).await.unwrap();
        a.write_packet(Packet::noop()).await.unwrap();

        let err = b.read_packet().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Frame(DecodeError::UnknownControlKind(b'x'))
        ));
        assert!(!err.is_fatal());
        assert_eq!(b.read_packet().await.unwrap().kind, PacketKind::Noop);
    }

    #[tokio::test]
    async fn test_dialer_hands_pipe_to_acceptor() {
        let (tx, mut rx) = mpsc::channel(1);
        let dialer = MemoryDialer::new("websocket", tx);

        let client = dialer
            .dial("mem://server/socket?EIO=3", &Headers::new())
            .await
            .unwrap();
        let mut request = rx.recv().await.unwrap();
        assert_eq!(request.protocol_version(), Some("3"));
        assert_eq!(request.transport(), Some("websocket"));

        let acceptor = MemoryAcceptor::new("websocket");
        let server = acceptor.accept(&mut request).await.unwrap();
        server.write_packet(Packet::noop()).await.unwrap();
        assert_eq!(client.read_packet().await.unwrap().kind, PacketKind::Noop);

        // The payload is consumed by the first accept.
        assert!(acceptor.accept(&mut request).await.is_err());
    }
}
