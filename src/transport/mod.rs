//! Transports that carry serialized GELF payloads to the collector.
//!
//! - [`StreamTransport`]: a long-lived TCP (optionally TLS) connection with
//!   null-byte framing and a reconnecting supervisor.
//! - [`RequestTransport`]: one HTTP(S) `POST` per message over a pooled client.
//!
//! Both are fire-and-forget: `send` never blocks and never reports failures
//! back to the caller. Network errors are logged and the message is dropped.

use crate::config::{GelfConfig, Protocol};
use crate::error::BuildError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

mod request;
mod stream;
mod supervisor;
#[cfg(feature = "tls")]
mod tls;

pub use request::RequestTransport;
pub use stream::{StreamConfig, StreamTransport};
pub use supervisor::{CloseAction, ConnectionState, Supervisor};

/// Capability set shared by every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one serialized payload to the transport.
    ///
    /// Returns immediately. The eventual write happens in the background and
    /// its outcome is never reported; a message that can't be written is
    /// dropped.
    fn send(&self, msg: Bytes);

    /// Stop the transport. Pending reconnects are cancelled and no new
    /// connections are made; messages already handed over are flushed on a
    /// best-effort basis.
    fn end(&self);

    /// Wait until the transport has finished its background work after
    /// [`Transport::end`].
    ///
    /// Default implementation returns immediately.
    async fn closed(&self) {}
}

/// Construct the transport selected by `config.protocol`.
///
/// Must be called from within a Tokio runtime.
pub fn build_transport(config: &GelfConfig) -> Result<Arc<dyn Transport>, BuildError> {
    match config.protocol {
        Protocol::Tcp | Protocol::Tls => {
            let stream = StreamTransport::connect(StreamConfig::from_config(config)?);
            Ok(Arc::new(stream) as Arc<dyn Transport>)
        }
        Protocol::Http | Protocol::Https => {
            let request = RequestTransport::new(config)?;
            Ok(Arc::new(request) as Arc<dyn Transport>)
        }
    }
}
