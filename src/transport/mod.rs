//! The seam between the client and the WebSocket implementation that does the actual I/O.
//!
//! The client never touches sockets, TLS or frame encoding itself. It asks a [`Connector`] for a
//! [`Transport`] and then only reads frames into its own buffer, sends complete text messages
//! and closes. [`TungsteniteConnector`] is the default implementation.

#[cfg(test)]
pub(crate) mod mock;
pub mod tungstenite;

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

pub use self::tungstenite::{TungsteniteConnector, TungsteniteTransport};
use crate::Result;

/// Outcome of a single [`Transport::receive`] call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// `len` bytes of the current message were written to the caller's buffer.
    Frame {
        len: usize,
        /// Set on the call that delivers the last byte of the message
        end_of_message: bool,
    },
    /// The peer closed the connection or the stream ended.
    Close,
}

/// An established connection.
///
/// All methods take `&self` so that sends can run concurrently with the receive loop.
/// Implementations serialize concurrent writes themselves.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Receive the next part of the current text message into `buf`.
    ///
    /// At most `buf.len()` bytes are written. Whatever does not fit is returned by the next call.
    /// Dropping the returned future must not lose data.
    async fn receive(&self, buf: &mut [u8]) -> Result<Received>;

    /// Send `text` as a single, final text frame.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Send a normal closure (1000) close frame. Closing an already closed transport succeeds.
    async fn close(&self) -> Result<()>;
}

/// Establishes [`Transport`]s.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Perform the opening handshake against `url`, adding `headers` to the upgrade request.
    async fn connect(&self, url: &Url, headers: &[(String, String)])
    -> Result<Arc<dyn Transport>>;
}

#[async_trait]
impl<C: Connector> Connector for Arc<C> {
    async fn connect(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<Arc<dyn Transport>> {
        (**self).connect(url, headers).await
    }
}
