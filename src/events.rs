//! Connection lifecycle and message notifications.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Error;

/// A notification delivered to listeners and [`Client::events`](crate::Client::events)
/// receivers.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    /// The opening handshake completed
    Opened,
    /// The connection reached its closed state, gracefully or through disposal
    Closed,
    /// A complete text message arrived
    MessageReceived(String),
    /// The receive loop failed and has stopped. A fresh `connect` is required.
    ErrorReceived {
        error: Arc<Error>,
        /// What the client was doing when the error occurred
        context: Option<String>,
    },
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Opened => EventKind::Opened,
            Self::Closed => EventKind::Closed,
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::ErrorReceived { .. } => EventKind::ErrorReceived,
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Opened,
    Closed,
    MessageReceived,
    ErrorReceived,
}

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    kind: EventKind,
    id: Uuid,
}

impl ListenerId {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.kind, self.id)
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Fans events out to registered listeners and to broadcast receivers.
///
/// Listeners are called one after the other on the emitting task, so an event is fully
/// delivered before the next one is emitted. The listener table is snapshotted before the calls
/// are made, which allows listeners to be added or removed from any thread at any time,
/// including from inside a listener.
pub(crate) struct Dispatcher {
    listeners: DashMap<EventKind, DashMap<Uuid, Handler>>,
    broadcast_tx: broadcast::Sender<Event>,
}

impl Dispatcher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);

        Self {
            listeners: DashMap::new(),
            broadcast_tx,
        }
    }

    pub(crate) fn add(&self, kind: EventKind, handler: Handler) -> ListenerId {
        let id = Uuid::new_v4();
        self.listeners.entry(kind).or_default().insert(id, handler);

        ListenerId { kind, id }
    }

    /// Returns whether a listener was removed.
    pub(crate) fn remove(&self, listener: ListenerId) -> bool {
        self.listeners
            .get(&listener.kind)
            .is_some_and(|handlers| handlers.remove(&listener.id).is_some())
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        let handlers: Vec<Handler> = self
            .listeners
            .get(&event.kind())
            .map(|handlers| handlers.iter().map(|entry| Arc::clone(entry.value())).collect())
            .unwrap_or_default();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(kind = ?event.kind(), "Event listener panicked");
            }
        }

        // No receivers is fine
        _ = self.broadcast_tx.send(event);
    }

    pub(crate) fn emit_error(&self, error: Error, context: Option<String>) {
        self.emit(Event::ErrorReceived {
            error: Arc::new(error),
            context,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter(dispatcher: &Dispatcher, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let handler_count = Arc::clone(&count);
        dispatcher.add(
            kind,
            Arc::new(move |_: &Event| {
                handler_count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    #[test]
    fn every_listener_of_a_kind_observes_the_event() {
        let dispatcher = Dispatcher::new(8);
        let first = counter(&dispatcher, EventKind::Opened);
        let second = counter(&dispatcher, EventKind::Opened);
        let other = counter(&dispatcher, EventKind::Closed);

        dispatcher.emit(Event::Opened);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let dispatcher = Dispatcher::new(8);
        let count = Arc::new(AtomicUsize::new(0));
        let handler_count = Arc::clone(&count);
        let id = dispatcher.add(
            EventKind::Closed,
            Arc::new(move |_: &Event| {
                handler_count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(dispatcher.remove(id));
        assert!(!dispatcher.remove(id));
        dispatcher.emit(Event::Closed);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let dispatcher = Dispatcher::new(8);
        dispatcher.add(
            EventKind::MessageReceived,
            Arc::new(|event: &Event| {
                assert!(matches!(event, Event::Opened), "listener failure");
            }),
        );
        let count = counter(&dispatcher, EventKind::MessageReceived);

        dispatcher.emit(Event::MessageReceived("one".to_owned()));
        dispatcher.emit(Event::MessageReceived("two".to_owned()));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new(8));
        let added = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::clone(&dispatcher);
        let inner_added = Arc::clone(&added);
        dispatcher.add(
            EventKind::Opened,
            Arc::new(move |_: &Event| {
                let id = inner.add(EventKind::Opened, Arc::new(|_: &Event| {}));
                inner_added.lock().unwrap().push(id);
            }),
        );

        dispatcher.emit(Event::Opened);

        assert_eq!(added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_receivers_see_events_in_order() {
        let dispatcher = Dispatcher::new(8);
        let mut rx = dispatcher.subscribe();

        dispatcher.emit(Event::MessageReceived("first".to_owned()));
        dispatcher.emit(Event::MessageReceived("second".to_owned()));

        let Event::MessageReceived(first) = rx.recv().await.unwrap() else {
            panic!("unexpected event");
        };
        let Event::MessageReceived(second) = rx.recv().await.unwrap() else {
            panic!("unexpected event");
        };
        assert_eq!(first, "first");
        assert_eq!(second, "second");
    }
}
