use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{Connector, Received, Transport};
use crate::Result;
use crate::error::{Error, Kind, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens connections with [`tokio_tungstenite::connect_async`]. Supports `ws://` and `wss://`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<Arc<dyn Transport>> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::connection(TransportError::WebSocket(e)))?;

        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_e| {
                Error::with_source(Kind::Configuration, TransportError::InvalidHeader(key.clone()))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_e| {
                Error::with_source(Kind::Configuration, TransportError::InvalidHeader(key.clone()))
            })?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| Error::connection(TransportError::WebSocket(e)))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%url, "WebSocket handshake completed");

        let transport: Arc<dyn Transport> = Arc::new(TungsteniteTransport::new(stream));
        Ok(transport)
    }
}

/// [`Transport`] over a split [`WebSocketStream`].
///
/// tungstenite hands out whole messages, so the remainder of a text message that did not fit
/// the caller's buffer is kept here and returned by the following [`Transport::receive`] calls.
pub struct TungsteniteTransport {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<Reader>,
}

struct Reader {
    stream: SplitStream<WsStream>,
    pending: Option<Pending>,
}

struct Pending {
    text: Utf8Bytes,
    offset: usize,
}

impl TungsteniteTransport {
    #[must_use]
    pub fn new(stream: WsStream) -> Self {
        let (writer, stream) = stream.split();

        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(Reader {
                stream,
                pending: None,
            }),
        }
    }
}

impl Reader {
    /// Next text payload, or `None` once the peer has closed.
    async fn next_text(&mut self) -> Result<Option<Utf8Bytes>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Close(_)) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    return Ok(None);
                }
                Ok(Message::Binary(_data)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(len = _data.len(), "Ignoring binary WebSocket message");
                }
                Ok(_) => {
                    // Ping/pong are answered by tungstenite itself.
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn receive(&self, buf: &mut [u8]) -> Result<Received> {
        let mut reader = self.reader.lock().await;

        if reader.pending.is_none() {
            let Some(text) = reader.next_text().await? else {
                return Ok(Received::Close);
            };
            reader.pending = Some(Pending { text, offset: 0 });
        }

        let Some(pending) = reader.pending.as_mut() else {
            return Ok(Received::Close);
        };

        let bytes = pending.text.as_bytes();
        let remaining = &bytes[pending.offset..];
        let len = remaining.len().min(buf.len());
        buf[..len].copy_from_slice(&remaining[..len]);
        pending.offset += len;

        let end_of_message = pending.offset == bytes.len();
        if end_of_message {
            reader.pending = None;
        }

        Ok(Received::Frame {
            len,
            end_of_message,
        })
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text.to_owned().into())).await?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: String::new().into(),
        };

        let mut writer = self.writer.lock().await;
        match writer.send(Message::Close(Some(frame))).await {
            Ok(())
            | Err(
                WsError::ConnectionClosed
                | WsError::AlreadyClosed
                | WsError::Protocol(ProtocolError::SendAfterClosing),
            ) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
