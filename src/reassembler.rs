//! Turns the frames of a [`Transport`] into complete text messages.

use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::buffer::ReceiveBuffer;
use crate::error::{Error, TransportError};
use crate::transport::{Received, Transport};

/// Reads frames into a [`ReceiveBuffer`] until a message is complete.
///
/// The buffer is owned exclusively by the reassembler. It starts every message at offset zero,
/// keeps whatever capacity earlier messages grew it to, and doubles it when a message does not
/// fit (or fails with [`Kind::BufferOverflow`](crate::error::Kind) if growth is disabled).
///
/// ```rust,no_run
/// # use textsock::buffer::ReceiveBuffer;
/// # use textsock::reassembler::Reassembler;
/// # use textsock::transport::Transport;
/// # use tokio_util::sync::CancellationToken;
/// # async fn example(transport: &dyn Transport) -> textsock::Result<()> {
/// let mut reassembler = Reassembler::new(ReceiveBuffer::with_capacity(1024)?, true);
/// let token = CancellationToken::new();
///
/// while let Some(text) = reassembler.next_message(transport, &token).await? {
///     println!("{text}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Reassembler {
    buffer: ReceiveBuffer,
    auto_grow: bool,
}

impl Reassembler {
    #[must_use]
    pub fn new(buffer: ReceiveBuffer, auto_grow: bool) -> Self {
        Self { buffer, auto_grow }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Give the buffer back, e.g. to reuse it for the next connection.
    #[must_use]
    pub fn into_buffer(self) -> ReceiveBuffer {
        self.buffer
    }

    /// Receive the next complete message.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection. A partially received message
    /// is discarded in that case and on any error. Cancellation of `token` while waiting for a
    /// frame yields [`Kind::Cancelled`](crate::error::Kind).
    pub async fn next_message<T>(
        &mut self,
        transport: &T,
        token: &CancellationToken,
    ) -> Result<Option<String>>
    where
        T: Transport + ?Sized,
    {
        self.buffer.clear();

        loop {
            let received = tokio::select! {
                biased;

                () = token.cancelled() => return Err(Error::cancelled()),
                received = transport.receive(self.buffer.spare_mut()) => received?,
            };

            let end_of_message = match received {
                Received::Frame {
                    len,
                    end_of_message,
                } => {
                    self.buffer.advance(len);
                    end_of_message
                }
                Received::Close => return Ok(None),
            };

            if end_of_message {
                let text = std::str::from_utf8(self.buffer.filled())
                    .map_err(TransportError::InvalidUtf8)?
                    .to_owned();

                #[cfg(feature = "tracing")]
                tracing::trace!(len = text.len(), "Reassembled text message");

                return Ok(Some(text));
            }

            if self.buffer.is_full() {
                if !self.auto_grow {
                    return Err(Error::buffer_overflow(self.buffer.capacity()));
                }

                self.buffer.grow()?;

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    capacity = self.buffer.capacity(),
                    "Grew receive buffer for oversized message"
                );
            }
        }
    }
}
