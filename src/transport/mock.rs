//! Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use url::Url;

use super::{Connector, Received, Transport};
use crate::Result;
use crate::error::{Error, TransportError};

/// What the fake peer delivers next.
#[derive(Debug)]
pub(crate) enum Script {
    Frame(Vec<u8>, bool),
    Close,
    Fail,
}

pub(crate) struct MockTransport {
    incoming: Mutex<Incoming>,
    loopback: mpsc::UnboundedSender<Script>,
    sent: mpsc::UnboundedSender<String>,
    closes: AtomicUsize,
    fail_sends: AtomicBool,
    ignore_close: AtomicBool,
}

struct Incoming {
    rx: mpsc::UnboundedReceiver<Script>,
    pending: Option<(Vec<u8>, usize, bool)>,
}

/// The test's end of a [`MockTransport`].
pub(crate) struct MockPeer {
    pub transport: Arc<MockTransport>,
    frames: mpsc::UnboundedSender<Script>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl MockTransport {
    pub(crate) fn pair() -> MockPeer {
        let (frames, rx) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();

        let transport = Arc::new(MockTransport {
            incoming: Mutex::new(Incoming { rx, pending: None }),
            loopback: frames.clone(),
            sent: sent_tx,
            closes: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            ignore_close: AtomicBool::new(false),
        });

        MockPeer {
            transport,
            frames,
            sent,
        }
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// The peer never answers a close frame.
    pub(crate) fn ignore_close(&self) {
        self.ignore_close.store(true, Ordering::SeqCst);
    }
}

impl MockPeer {
    /// Deliver `text` split into frames of at most `fragment` bytes.
    pub(crate) fn send_fragmented(&self, text: &str, fragment: usize) {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            self.push(Script::Frame(Vec::new(), true));
            return;
        }

        let mut chunks = bytes.chunks(fragment).peekable();
        while let Some(chunk) = chunks.next() {
            self.push(Script::Frame(chunk.to_vec(), chunks.peek().is_none()));
        }
    }

    pub(crate) fn send_text(&self, text: &str) {
        self.push(Script::Frame(text.as_bytes().to_vec(), true));
    }

    pub(crate) fn push(&self, script: Script) {
        drop(self.frames.send(script));
    }

    pub(crate) async fn recv_sent(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn receive(&self, buf: &mut [u8]) -> Result<Received> {
        let mut incoming = self.incoming.lock().await;

        if incoming.pending.is_none() {
            match incoming.rx.recv().await {
                Some(Script::Frame(bytes, end)) => incoming.pending = Some((bytes, 0, end)),
                Some(Script::Close) | None => return Ok(Received::Close),
                Some(Script::Fail) => return Err(TransportError::ConnectionClosed.into()),
            }
        }

        let Some((bytes, offset, end)) = incoming.pending.as_mut() else {
            return Ok(Received::Close);
        };

        let len = (bytes.len() - *offset).min(buf.len());
        buf[..len].copy_from_slice(&bytes[*offset..*offset + len]);
        *offset += len;

        let exhausted = *offset == bytes.len();
        let end_of_message = exhausted && *end;
        if exhausted {
            incoming.pending = None;
        }

        Ok(Received::Frame {
            len,
            end_of_message,
        })
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed.into());
        }

        drop(self.sent.send(text.to_owned()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_close.load(Ordering::SeqCst) {
            // The peer answers the close frame.
            drop(self.loopback.send(Script::Close));
        }
        Ok(())
    }
}

/// Hands out queued transports in order. A `None` entry, or an empty queue, fails the handshake.
#[derive(Default)]
pub(crate) struct MockConnector {
    transports: StdMutex<VecDeque<Option<Arc<MockTransport>>>>,
    headers: StdMutex<Vec<(String, String)>>,
    delay: Option<Duration>,
}

impl MockConnector {
    pub(crate) fn with(transports: impl IntoIterator<Item = Arc<MockTransport>>) -> Self {
        Self::scripted(transports.into_iter().map(Some))
    }

    pub(crate) fn scripted(
        transports: impl IntoIterator<Item = Option<Arc<MockTransport>>>,
    ) -> Self {
        Self {
            transports: StdMutex::new(transports.into_iter().collect()),
            ..Self::default()
        }
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn headers(&self) -> Vec<(String, String)> {
        self.headers.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _url: &Url,
        headers: &[(String, String)],
    ) -> Result<Arc<dyn Transport>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        *self.headers.lock().unwrap() = headers.to_vec();

        let transport = self.transports.lock().unwrap().pop_front().flatten();
        match transport {
            Some(transport) => Ok(transport as Arc<dyn Transport>),
            None => Err(Error::connection(TransportError::ConnectionClosed)),
        }
    }
}
