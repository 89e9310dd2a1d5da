#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod reassembler;
pub mod transport;

pub use config::Config;
pub use connection::{Client, ConnectionState};
pub use error::{Error, Kind};
pub use events::{Event, EventKind, ListenerId};
/// Cancellation handle accepted by [`Client::connect`].
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;
