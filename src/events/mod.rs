//! Event types emitted by the client and the dispatcher that delivers them.
//!
//! Handlers are registered per [`EventKind`]. Events are queued in arrival order and
//! delivered by a single consumer task; a failing or panicking handler is logged and
//! the next handler still runs.

use crate::types::{Jid, MessageId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub use crate::error::ConnectFailureReason;

/// Events emitted by [Client](crate::Client) to registered handlers.
#[derive(Clone, Debug)]
pub enum Event {
    /// All QR refs received from the server, in display order.
    Qr { codes: Vec<String> },

    /// The QR code to show now, valid for `timeout`.
    QrCode { code: String, timeout: Duration },

    /// Every QR ref expired without a scan. The client disconnects.
    QrTimeout,

    /// Pairing completed.
    PairSuccess {
        id: Jid,
        lid: Option<Jid>,
        business_name: Option<String>,
        platform: Option<String>,
    },

    /// Pair-success from the server could not be verified.
    PairError { id: Option<Jid>, error: String },

    /// Connected and logged in.
    Connected,

    /// Connection lost. The client reconnects unless auto-reconnect is off.
    Disconnected { reason: String },

    /// Keepalive pings timing out.
    KeepAliveTimeout {
        error_count: u32,
        last_success: Option<SystemTime>,
    },

    KeepAliveRestored,

    /// The server revoked this device. No reconnect is attempted.
    LoggedOut {
        on_connect: bool,
        reason: Option<ConnectFailureReason>,
    },

    /// Another client connected with the same keys.
    StreamReplaced,

    TemporaryBan {
        code: Option<TempBanReason>,
        expire: Duration,
    },

    /// Incoming message (decrypted).
    Message(MessageEvent),

    /// A message that could not be decrypted. A retry receipt has been sent.
    UndecryptableMessage { info: MessageInfo, error: String },

    Receipt(ReceiptEvent),

    CallOffer(CallOfferEvent),

    Presence(PresenceEvent),

    /// A peer's identity key changed. Its old sessions were replaced.
    IdentityChange { jid: Jid, timestamp: SystemTime },
}

/// Discriminant of [`Event`], used as the handler registry key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Qr,
    QrCode,
    QrTimeout,
    PairSuccess,
    PairError,
    Connected,
    Disconnected,
    KeepAliveTimeout,
    KeepAliveRestored,
    LoggedOut,
    StreamReplaced,
    TemporaryBan,
    Message,
    UndecryptableMessage,
    Receipt,
    CallOffer,
    Presence,
    IdentityChange,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Qr { .. } => EventKind::Qr,
            Self::QrCode { .. } => EventKind::QrCode,
            Self::QrTimeout => EventKind::QrTimeout,
            Self::PairSuccess { .. } => EventKind::PairSuccess,
            Self::PairError { .. } => EventKind::PairError,
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::KeepAliveTimeout { .. } => EventKind::KeepAliveTimeout,
            Self::KeepAliveRestored => EventKind::KeepAliveRestored,
            Self::LoggedOut { .. } => EventKind::LoggedOut,
            Self::StreamReplaced => EventKind::StreamReplaced,
            Self::TemporaryBan { .. } => EventKind::TemporaryBan,
            Self::Message(_) => EventKind::Message,
            Self::UndecryptableMessage { .. } => EventKind::UndecryptableMessage,
            Self::Receipt(_) => EventKind::Receipt,
            Self::CallOffer(_) => EventKind::CallOffer,
            Self::Presence(_) => EventKind::Presence,
            Self::IdentityChange { .. } => EventKind::IdentityChange,
        }
    }
}

/// Routing information of an incoming message.
#[derive(Clone, Debug)]
pub struct MessageInfo {
    /// Chat the message belongs to (user or group).
    pub chat: Jid,
    /// Device that sent it.
    pub sender: Jid,
    pub id: MessageId,
    pub timestamp: SystemTime,
    pub is_group: bool,
    pub is_from_me: bool,
    pub push_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub info: MessageInfo,
    /// Decrypted application payload with padding removed. Decoding is up to the caller.
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Sender,
    Read,
    ReadSelf,
    Played,
    Retry,
    Other(String),
}

impl ReceiptKind {
    pub fn from_attr(t: Option<&str>) -> Self {
        match t {
            None | Some("") => Self::Delivered,
            Some("sender") => Self::Sender,
            Some("read") => Self::Read,
            Some("read-self") => Self::ReadSelf,
            Some("played") => Self::Played,
            Some("retry") => Self::Retry,
            Some(other) => Self::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReceiptEvent {
    pub chat: Jid,
    pub sender: Jid,
    pub ids: Vec<MessageId>,
    pub kind: ReceiptKind,
    pub timestamp: SystemTime,
}

#[derive(Clone, Debug)]
pub struct CallOfferEvent {
    pub from: Jid,
    pub call_id: String,
    pub call_creator: Option<Jid>,
    pub timestamp: SystemTime,
}

#[derive(Clone, Debug)]
pub struct PresenceEvent {
    pub from: Jid,
    pub unavailable: bool,
    pub last_seen: Option<SystemTime>,
}

/// Temporary ban reason.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TempBanReason {
    SentToTooManyPeople = 101,
    BlockedByUsers = 102,
    CreatedTooManyGroups = 103,
    SentTooManySameMessage = 104,
    BroadcastList = 106,
}

impl TempBanReason {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            101 => Some(Self::SentToTooManyPeople),
            102 => Some(Self::BlockedByUsers),
            103 => Some(Self::CreatedTooManyGroups),
            104 => Some(Self::SentTooManySameMessage),
            106 => Some(Self::BroadcastList),
            _ => None,
        }
    }
}

/// Event handler. Errors are logged and never reach the connection.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Returned by [`Dispatcher::add_handler`], used to remove it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<(HandlerId, EventHandler)>>,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

/// FIFO event queue with per-kind ordered handler lists.
pub struct Dispatcher {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Register a handler for one event kind. Handlers of the same kind run in
    /// registration order.
    pub fn add_handler<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut reg) = self.registry.write() {
            reg.by_kind
                .entry(kind)
                .or_default()
                .push((id, Arc::new(handler)));
        }
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let Ok(mut reg) = self.registry.write() else {
            return false;
        };
        let mut removed = false;
        for list in reg.by_kind.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Receive every event on a channel, after the handlers for it have run.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut reg) = self.registry.write() {
            reg.subscribers.push(tx);
        }
        rx
    }

    /// Queue an event. Never blocks.
    pub fn emit(&self, event: Event) {
        debug!(kind = ?event.kind(), "queue event");
        if self.tx.send(event).is_err() {
            warn!("event queue closed, dropping event");
        }
    }

    /// Spawn the consumer task. Events emitted before this call are delivered first.
    /// Returns `None` if the consumer was already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().ok()?.take()?;
        // the queue sender lives in the dispatcher, so the task ends once it is dropped
        let this = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match this.upgrade() {
                    Some(dispatcher) => dispatcher.deliver(&event),
                    None => break,
                }
            }
        }))
    }

    /// Run every handler for the event's kind, then forward it to subscribers.
    pub(crate) fn deliver(&self, event: &Event) {
        let kind = event.kind();
        let handlers: Vec<(HandlerId, EventHandler)> = self
            .registry
            .read()
            .map(|reg| reg.by_kind.get(&kind).cloned().unwrap_or_default())
            .unwrap_or_default();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(?kind, handler = id.0, error = %e, "event handler failed"),
                Err(_) => error!(?kind, handler = id.0, "event handler panicked"),
            }
        }

        if let Ok(mut reg) = self.registry.write() {
            reg.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn disconnected(n: u32) -> Event {
        Event::Disconnected {
            reason: n.to_string(),
        }
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Event::Connected.kind(), EventKind::Connected);
        assert_eq!(disconnected(1).kind(), EventKind::Disconnected);
        assert_eq!(ReceiptKind::from_attr(None), ReceiptKind::Delivered);
        assert_eq!(ReceiptKind::from_attr(Some("read")), ReceiptKind::Read);
        assert_eq!(TempBanReason::from_code(103), Some(TempBanReason::CreatedTooManyGroups));
    }

    #[test]
    fn same_kind_runs_in_registration_order_and_isolates_failures() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        dispatcher.add_handler(EventKind::Connected, move |_| {
            s.lock().unwrap().push("first");
            anyhow::bail!("boom")
        });
        dispatcher.add_handler(EventKind::Connected, |_| panic!("handler bug"));
        let s = Arc::clone(&seen);
        dispatcher.add_handler(EventKind::Connected, move |_| {
            s.lock().unwrap().push("third");
            Ok(())
        });
        let s = Arc::clone(&seen);
        dispatcher.add_handler(EventKind::Disconnected, move |_| {
            s.lock().unwrap().push("other kind");
            Ok(())
        });

        dispatcher.deliver(&Event::Connected);
        dispatcher.deliver(&disconnected(0));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "third", "other kind"]);
    }

    #[test]
    fn removed_handler_is_not_called() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = dispatcher.add_handler(EventKind::Connected, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        dispatcher.deliver(&Event::Connected);
        assert!(dispatcher.remove_handler(id));
        assert!(!dispatcher.remove_handler(id));
        dispatcher.deliver(&Event::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_events_arrive_in_order() {
        let dispatcher = Arc::new(Dispatcher::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        dispatcher.add_handler(EventKind::Disconnected, move |evt| {
            if let Event::Disconnected { reason } = evt {
                s.lock().unwrap().push(reason.clone());
            }
            Ok(())
        });
        let mut sub = dispatcher.subscribe();

        // emitted before the consumer starts
        dispatcher.emit(disconnected(0));
        assert!(dispatcher.start().is_some());
        assert!(dispatcher.start().is_none());
        for i in 1..50 {
            dispatcher.emit(disconnected(i));
        }
        for i in 0..50u32 {
            match sub.recv().await.unwrap() {
                Event::Disconnected { reason } => assert_eq!(reason, i.to_string()),
                other => panic!("unexpected {:?}", other),
            }
        }
        let expected: Vec<String> = (0..50u32).map(|i| i.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }
}
