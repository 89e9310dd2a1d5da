use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::str::Utf8Error;

use crate::connection::ConnectionState;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Invalid construction arguments, reported before any resource is created
    Configuration,
    /// Handshake or transport failure while establishing a connection
    Connection,
    /// A message outgrew the receive buffer while growth was disabled
    BufferOverflow,
    /// Cooperative shutdown. Never reported through the error event
    Cancelled,
    /// Operation is not valid in the current connection state
    InvalidState,
    /// Any other failure while sending or receiving
    Transport,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    /// Whether this error is the benign result of cooperative shutdown.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == Kind::Cancelled
    }

    pub fn configuration<S: Into<String>>(reason: S) -> Self {
        Configuration {
            reason: reason.into(),
        }
        .into()
    }

    #[must_use]
    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        InvalidState { operation, state }.into()
    }

    #[must_use]
    pub fn buffer_overflow(capacity: usize) -> Self {
        BufferOverflow { capacity }.into()
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Cancelled.into()
    }

    #[must_use]
    pub fn connection(source: TransportError) -> Self {
        Error::with_source(Kind::Connection, source)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Configuration {
    pub reason: String,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl StdError for Configuration {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct InvalidState {
    pub operation: &'static str,
    pub state: ConnectionState,
}

impl fmt::Display for InvalidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} while the connection is {:?}",
            self.operation, self.state
        )
    }
}

impl StdError for InvalidState {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct BufferOverflow {
    /// Capacity of the receive buffer when the overflow was detected
    pub capacity: usize,
}

impl fmt::Display for BufferOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message exceeds the {} byte receive buffer and growth is disabled",
            self.capacity
        )
    }
}

impl StdError for BufferOverflow {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl StdError for Cancelled {}

/// Transport-level failure variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error reported by the underlying WebSocket implementation
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// Header could not be applied to the upgrade request
    InvalidHeader(String),
    /// A completed text message was not valid UTF-8
    InvalidUtf8(Utf8Error),
    /// The connection was closed underneath the operation
    ConnectionClosed,
    /// An event stream fell behind and missed events
    Lagged {
        /// Number of events that were missed
        count: u64,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::InvalidHeader(name) => write!(f, "Invalid header: {name}"),
            Self::InvalidUtf8(e) => write!(f, "Text message is not valid UTF-8: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Lagged { count } => write!(f, "Event stream lagged, missed {count} events"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::WebSocket(e) => Some(e),
            Self::InvalidUtf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::with_source(Kind::Transport, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Transport, TransportError::WebSocket(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Configuration, e)
    }
}

impl From<Configuration> for Error {
    fn from(err: Configuration) -> Self {
        Error::with_source(Kind::Configuration, err)
    }
}

impl From<InvalidState> for Error {
    fn from(err: InvalidState) -> Self {
        Error::with_source(Kind::InvalidState, err)
    }
}

impl From<BufferOverflow> for Error {
    fn from(err: BufferOverflow) -> Self {
        Error::with_source(Kind::BufferOverflow, err)
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        Error::with_source(Kind::Cancelled, err)
    }
}
