use std::time::Duration;

use bon::Builder;

use crate::Result;
use crate::error::Error;

const DEFAULT_INITIAL_BUFFER_SIZE: usize = 1024;
const DEFAULT_CLOSE_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Configuration for [`Client`](crate::Client) behavior.
///
/// ```rust
/// use textsock::Config;
///
/// let config = Config::builder()
///     .initial_buffer_size(4096)
///     .auto_grow_buffer(false)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Size in bytes of the receive buffer allocated when the client is constructed. Must be
    /// greater than zero.
    #[builder(default = DEFAULT_INITIAL_BUFFER_SIZE)]
    pub initial_buffer_size: usize,
    /// Whether the receive buffer doubles when a message does not fit. When disabled, an
    /// oversized message is reported as [`Kind::BufferOverflow`](crate::error::Kind) and ends
    /// the receive loop.
    #[builder(default = true)]
    pub auto_grow_buffer: bool,
    /// How long `disconnect` waits for the peer to answer the close frame before tearing the
    /// connection down anyway.
    #[builder(default = DEFAULT_CLOSE_TIMEOUT_DURATION)]
    pub close_timeout: Duration,
    /// Capacity of the broadcast channel behind [`Client::events`](crate::Client::events).
    /// Must be greater than zero.
    #[builder(default = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
            auto_grow_buffer: true,
            close_timeout: DEFAULT_CLOSE_TIMEOUT_DURATION,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    /// Check the invariants that must hold before any resource is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.initial_buffer_size == 0 {
            return Err(Error::configuration(
                "initial_buffer_size must be greater than zero",
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::configuration(
                "event_capacity must be greater than zero",
            ));
        }

        Ok(())
    }
}
