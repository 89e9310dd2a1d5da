use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::Result;
use crate::buffer::ReceiveBuffer;
use crate::config::Config;
use crate::error::{Error, TransportError};
use crate::events::{Dispatcher, Event, EventKind, ListenerId};
use crate::reassembler::Reassembler;
use crate::transport::{Connector, Transport, TungsteniteConnector};

/// Connection lifecycle.
///
/// `Idle` → `Connecting` → `Open` → `Closing` → `Closed`, with `Faulted` reached when the
/// opening handshake fails.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never connected
    Idle,
    /// Opening handshake in progress
    Connecting,
    /// Handshake completed and the receive loop is running
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Close frame sent, waiting for the peer
    Closing,
    /// Shut down, either gracefully or through disposal
    Closed,
    /// The last opening handshake failed
    Faulted,
}

impl ConnectionState {
    /// Check if the connection is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Exchanges whole text messages over a single WebSocket connection.
///
/// Incoming messages are reassembled by a background receive loop and delivered as events,
/// either to listeners registered with `on_*` methods or through [`Client::events`] and
/// [`Client::messages`]. All methods take `&self`; wrap the client in an [`Arc`] to share it.
///
/// ```rust,no_run
/// use textsock::{Client, Config};
///
/// #[tokio::main]
/// async fn main() -> textsock::Result<()> {
///     let client = Client::new(Config::default())?;
///     client.on_message(|text| println!("received: {text}"));
///     client.on_error(|error, context| eprintln!("{context:?}: {error}"));
///
///     client.connect("wss://echo.websocket.org", None).await?;
///     client.send("hello").await?;
///     client.disconnect().await?;
///
///     Ok(())
/// }
/// ```
pub struct Client<C: Connector = TungsteniteConnector> {
    shared: Arc<Shared>,
    connector: C,
}

/// State reachable from the background tasks.
struct Shared {
    config: Config,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    headers: Mutex<Vec<(String, String)>>,
    /// Parked here between connections, owned by the receive loop while one is open
    buffer: Mutex<Option<ReceiveBuffer>>,
    events: Dispatcher,
    disposed: AtomicBool,
}

/// Everything belonging to one `connect` call.
struct Session {
    id: Uuid,
    token: CancellationToken,
    /// Cancelled by the receive loop when it exits
    receive_done: CancellationToken,
    transport: Option<Arc<dyn Transport>>,
    tasks: Vec<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // None of the guarded values can be left half-updated by a panic.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for Client<TungsteniteConnector> {
    fn default() -> Self {
        Self::new(Config::default()).expect("Client with default configuration should succeed")
    }
}

impl Client<TungsteniteConnector> {
    /// Create a client that connects with [`TungsteniteConnector`].
    pub fn new(config: Config) -> Result<Self> {
        Self::with_connector(config, TungsteniteConnector)
    }
}

impl<C: Connector> Client<C> {
    /// Create a client that opens its connections through `connector`.
    ///
    /// The configuration is validated before anything is allocated.
    pub fn with_connector(config: Config, connector: C) -> Result<Self> {
        config.validate()?;

        let buffer = ReceiveBuffer::with_capacity(config.initial_buffer_size)?;
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let events = Dispatcher::new(config.event_capacity);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state_tx,
                session: Mutex::new(None),
                headers: Mutex::new(Vec::new()),
                buffer: Mutex::new(Some(buffer)),
                events,
                disposed: AtomicBool::new(false),
            }),
            connector,
        })
    }

    /// Add a header to the opening handshake request. Takes effect on the next
    /// [`Client::connect`]; setting an existing header replaces its value.
    pub fn add_header<K: Into<String>, V: Into<String>>(&self, key: K, value: V) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Open { .. } | ConnectionState::Closing
        ) {
            return Err(Error::invalid_state("add a header", state));
        }

        let (key, value) = (key.into(), value.into());
        let mut headers = lock(&self.shared.headers);
        match headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&key))
        {
            Some(header) => header.1 = value,
            None => headers.push((key, value)),
        }

        Ok(())
    }

    /// Open a connection to `url`.
    ///
    /// Each call creates a fresh cancellation token, linked to `cancellation` when one is given.
    /// Cancelling either starts a graceful [`Client::disconnect`] in the background. On success
    /// the state is [`ConnectionState::Open`], [`Event::Opened`] has been emitted and the
    /// receive loop is running. A failed handshake leaves the client
    /// [`ConnectionState::Faulted`] and returns the error.
    pub async fn connect(&self, url: &str, cancellation: Option<CancellationToken>) -> Result<()> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::configuration(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        let shared = &self.shared;
        let token = cancellation
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let id = Uuid::new_v4();

        {
            let mut session = lock(&shared.session);
            if shared.disposed.load(Ordering::SeqCst) {
                return Err(Error::invalid_state("connect", ConnectionState::Closed));
            }

            shared
                .transition(ConnectionState::Connecting, |state| {
                    matches!(
                        state,
                        ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Faulted
                    )
                })
                .map_err(|state| Error::invalid_state("connect", state))?;

            let watcher = tokio::spawn(Arc::clone(shared).watch(id, token.clone()));
            *session = Some(Session {
                id,
                token: token.clone(),
                receive_done: CancellationToken::new(),
                transport: None,
                tasks: vec![watcher],
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%url, "Connecting");

        let headers = lock(&shared.headers).clone();
        let handshake = tokio::select! {
            biased;

            () = token.cancelled() => Err(Error::cancelled()),
            result = self.connector.connect(&url, &headers) => result,
        };

        let transport = match handshake {
            Ok(transport) => transport,
            Err(e) if e.is_cancelled() => {
                _ = shared.disconnect(Some(id)).await;
                return Err(e);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%url, error = %e, "Unable to connect");
                shared.fault(id);
                return Err(e);
            }
        };

        let buffer = lock(&shared.buffer).take().map_or_else(
            || ReceiveBuffer::with_capacity(shared.config.initial_buffer_size),
            Ok,
        )?;

        let receive_done = {
            let mut session = lock(&shared.session);
            match session.as_mut().filter(|session| session.id == id) {
                Some(current)
                    if shared
                        .transition(
                            ConnectionState::Open {
                                since: Instant::now(),
                            },
                            |state| matches!(state, ConnectionState::Connecting),
                        )
                        .is_ok() =>
                {
                    current.transport = Some(Arc::clone(&transport));
                    Some(current.receive_done.clone())
                }
                _ => None,
            }
        };

        let Some(receive_done) = receive_done else {
            // Disconnected or disposed while the handshake was completing
            _ = transport.close().await;
            shared.restore_buffer(buffer);
            return Err(Error::cancelled());
        };

        shared.events.emit(Event::Opened);

        let reassembler = Reassembler::new(buffer, shared.config.auto_grow_buffer);
        let receiver = tokio::spawn(Arc::clone(shared).receive_loop(
            transport,
            token,
            receive_done,
            reassembler,
        ));

        if let Some(current) = lock(&shared.session)
            .as_mut()
            .filter(|session| session.id == id)
        {
            current.tasks.push(receiver);
        }

        Ok(())
    }

    /// Send `text` as one complete message.
    ///
    /// Fails with [`Kind::Cancelled`](crate::error::Kind) once the connection's cancellation
    /// token has fired and with [`Kind::InvalidState`](crate::error::Kind) when the connection
    /// is not open. A transport failure is returned and also ends the connection.
    pub async fn send(&self, text: &str) -> Result<()> {
        let (transport, token) = {
            let session = lock(&self.shared.session);
            let state = self.state();

            match session.as_ref() {
                Some(session) if session.token.is_cancelled() => {
                    return Err(Error::cancelled());
                }
                Some(Session {
                    transport: Some(transport),
                    token,
                    ..
                }) if state.is_open() => (Arc::clone(transport), token.clone()),
                _ => return Err(Error::invalid_state("send", state)),
            }
        };

        let result = tokio::select! {
            biased;

            () = token.cancelled() => Err(Error::cancelled()),
            result = transport.send_text(text) => result,
        };

        if let Err(e) = &result
            && !e.is_cancelled()
        {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "Send failed, closing connection");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            token.cancel();
        }

        result
    }

    /// Serialize `request` to JSON and send it as one text message.
    pub async fn send_json<R: Serialize>(&self, request: &R) -> Result<()> {
        let json = serde_json::to_string(request)?;
        self.send(&json).await
    }

    /// Close the connection gracefully.
    ///
    /// Sends a normal closure frame, waits up to [`Config::close_timeout`] for the peer to
    /// answer, fires the cancellation token and emits [`Event::Closed`]. Does nothing unless
    /// the connection is connecting or open. The connection is always torn down; an error is
    /// only returned if the close frame could not be sent.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.disconnect(None).await
    }

    /// Release the connection without a close handshake.
    ///
    /// Background tasks are stopped, the transport is dropped and the receive buffer discarded.
    /// Emits [`Event::Closed`] unless the client was already closed. The client cannot connect
    /// again afterwards. Also runs when the client is dropped.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn on_opened<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared
            .events
            .add(EventKind::Opened, Arc::new(move |_: &Event| listener()))
    }

    pub fn on_closed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared
            .events
            .add(EventKind::Closed, Arc::new(move |_: &Event| listener()))
    }

    /// Register a listener for complete text messages.
    ///
    /// Listeners run on the receive loop, one after the other, so a message has been handed to
    /// every listener before the next message is delivered. Keep them short.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.events.add(
            EventKind::MessageReceived,
            Arc::new(move |event: &Event| {
                if let Event::MessageReceived(text) = event {
                    listener(text);
                }
            }),
        )
    }

    /// Register a listener for receive loop failures. The connection is closing when it fires.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Error, Option<&str>) + Send + Sync + 'static,
    {
        self.shared.events.add(
            EventKind::ErrorReceived,
            Arc::new(move |event: &Event| {
                if let Event::ErrorReceived { error, context } = event {
                    listener(error, context.as_deref());
                }
            }),
        )
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, listener: ListenerId) -> bool {
        self.shared.events.remove(listener)
    }

    /// Subscribe to all events.
    ///
    /// Each call returns a new independent receiver. A receiver that falls more than
    /// [`Config::event_capacity`] events behind misses the oldest ones.
    #[must_use]
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Stream of received messages, ending when the connection closes.
    pub fn messages(&self) -> impl Stream<Item = Result<String>> + use<C> {
        let mut rx = self.shared.events.subscribe();

        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(Event::MessageReceived(text)) => yield Ok(text),
                    Ok(Event::Closed) | Err(RecvError::Closed) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(count)) => {
                        yield Err(Error::from(TransportError::Lagged { count }));
                    }
                }
            }
        }
    }
}

impl<C: Connector> Drop for Client<C> {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl<C: Connector> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Move to `to` if the current state satisfies `allowed`. Returns the previous state, or the
    /// current one if the transition was refused. Racing callers cannot both succeed.
    fn transition<F>(
        &self,
        to: ConnectionState,
        allowed: F,
    ) -> std::result::Result<ConnectionState, ConnectionState>
    where
        F: FnOnce(&ConnectionState) -> bool,
    {
        let mut outcome = Err(to);
        self.state_tx.send_if_modified(|state| {
            if allowed(state) {
                outcome = Ok(*state);
                *state = to;
                true
            } else {
                outcome = Err(*state);
                false
            }
        });

        #[cfg(feature = "tracing")]
        if let Ok(from) = outcome {
            tracing::debug!(?from, ?to, "Connection state changed");
        }

        outcome
    }

    /// Turns cancellation of a session's token into a graceful disconnect.
    async fn watch(self: Arc<Self>, id: Uuid, token: CancellationToken) {
        token.cancelled().await;

        if let Err(e) = self.disconnect(Some(id)).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Close after cancellation failed");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        token: CancellationToken,
        receive_done: CancellationToken,
        mut reassembler: Reassembler,
    ) {
        loop {
            match reassembler.next_message(&*transport, &token).await {
                Ok(Some(text)) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(%text, "Received WebSocket text message");
                    self.events.emit(Event::MessageReceived(text));
                }
                Ok(None) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Peer closed the connection");
                    break;
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    let shutting_down = token.is_cancelled()
                        || matches!(
                            self.state(),
                            ConnectionState::Closing | ConnectionState::Closed
                        );

                    if shutting_down {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(error = %e, "Receive failed during shutdown");
                    } else {
                        #[cfg(feature = "tracing")]
                        tracing::error!(error = %e, "Receive loop terminated");
                        self.events
                            .emit_error(e, Some("receive loop terminated".to_owned()));
                    }
                    break;
                }
            }
        }

        self.restore_buffer(reassembler.into_buffer());
        receive_done.cancel();
        token.cancel();
    }

    /// Graceful close of the session `id`, or of the current session when `None`.
    async fn disconnect(&self, id: Option<Uuid>) -> Result<()> {
        let (id, transport, token, receive_done) = {
            let session = lock(&self.session);
            let Some(session) = session
                .as_ref()
                .filter(|session| id.is_none_or(|id| session.id == id))
            else {
                return Ok(());
            };

            if self
                .transition(ConnectionState::Closing, |state| {
                    matches!(
                        state,
                        ConnectionState::Connecting | ConnectionState::Open { .. }
                    )
                })
                .is_err()
            {
                return Ok(());
            }

            (
                session.id,
                session.transport.clone(),
                session.token.clone(),
                session.receive_done.clone(),
            )
        };

        let mut result = Ok(());
        if let Some(transport) = transport {
            let graceful = async {
                transport.close().await?;
                // The receive loop exits once it reads the peer's close frame.
                receive_done.cancelled().await;
                Ok::<(), Error>(())
            };

            match timeout(self.config.close_timeout, graceful).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Unable to send close frame");
                    result = Err(e);
                }
                Err(_elapsed) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Peer did not complete the close handshake within {:?}",
                        self.config.close_timeout
                    );
                }
            }
        }

        token.cancel();

        let closed = {
            let mut session = lock(&self.session);
            if session.as_ref().is_some_and(|session| session.id == id) {
                *session = None;
            }
            self.transition(ConnectionState::Closed, |state| {
                matches!(state, ConnectionState::Closing)
            })
            .is_ok()
        };

        if closed {
            self.events.emit(Event::Closed);
        }

        result
    }

    /// Handshake for session `id` failed.
    fn fault(&self, id: Uuid) {
        let session = {
            let mut session = lock(&self.session);
            if !session.as_ref().is_some_and(|session| session.id == id) {
                return;
            }
            _ = self.transition(ConnectionState::Faulted, |state| {
                matches!(state, ConnectionState::Connecting)
            });
            session.take()
        };

        // Lets the watcher finish; it finds no session left to close.
        if let Some(session) = session {
            session.token.cancel();
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = lock(&self.session).take();
        if let Some(session) = session {
            for task in &session.tasks {
                task.abort();
            }
            session.token.cancel();
            session.receive_done.cancel();
        }
        drop(lock(&self.buffer).take());

        let previous = self.transition(ConnectionState::Closed, |state| {
            !matches!(state, ConnectionState::Closed)
        });

        #[cfg(feature = "tracing")]
        tracing::debug!("Client disposed");

        if previous.is_ok() {
            self.events.emit(Event::Closed);
        }
    }

    fn restore_buffer(&self, mut buffer: ReceiveBuffer) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        buffer.clear();
        *lock(&self.buffer) = Some(buffer);
    }
}
