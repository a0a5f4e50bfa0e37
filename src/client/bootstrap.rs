//! Client bootstrap and handshake.
//!
//! Handles the initial connection setup:
//! - Adding protocol query values to the target URL
//! - Dialing through the chosen transport
//! - Reading and validating the `open` packet

use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::client::{ClientConfig, ClientError};
use crate::core::{PROTOCOL_VERSION, QUERY_TRANSPORT, QUERY_VERSION};
use crate::transport::{Connection, Dialer, Parameters};

/// A dialed connection and the parameters the server announced on it.
pub struct Handshake {
    /// The connection the `open` packet arrived on.
    pub conn: Arc<dyn Connection>,
    /// Negotiated parameters.
    pub params: Parameters,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Build the dial URL: `url` plus the protocol version and transport name,
/// unless already present.
pub fn dial_url(url: &str, transport: &str) -> Result<String, ClientError> {
    let mut url = Url::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    let present: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
    {
        let mut query = url.query_pairs_mut();
        if !present.iter().any(|k| k == QUERY_VERSION) {
            query.append_pair(QUERY_VERSION, PROTOCOL_VERSION);
        }
        if !present.iter().any(|k| k == QUERY_TRANSPORT) {
            query.append_pair(QUERY_TRANSPORT, transport);
        }
    }
    Ok(url.into())
}

/// Dial and wait for the `open` packet, all within the connect timeout.
pub async fn handshake(dialer: &dyn Dialer, config: &ClientConfig) -> Result<Handshake, ClientError> {
    let url = dial_url(&config.url, dialer.transport_name())?;
    debug!(%url, transport = dialer.transport_name(), "dialing");

    let attempt = async {
        let conn = dialer
            .dial(&url, &config.headers)
            .await
            .map_err(ClientError::ConnectionFailed)?;
        let first = match conn.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                let _ = conn.close().await;
                return Err(ClientError::HandshakeFailed(e.to_string()));
            }
        };
        match Parameters::from_packet(&first) {
            Ok(params) => Ok(Handshake { conn, params }),
            Err(e) => {
                let _ = conn.close().await;
                Err(ClientError::HandshakeFailed(e.to_string()))
            }
        }
    };

    tokio::time::timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| ClientError::Timeout)?
}
