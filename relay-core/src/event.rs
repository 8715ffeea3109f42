//! Events published by relay handles.
//!
//! Every event type names its [`EventKind`]. Dispatchers map kinds to slot
//! indices through an [`EventCatalogue`] fixed at loop construction, so the
//! index of a kind never depends on which event happened to be used first.

use crate::buffer::Buffer;
use crate::error::status_of;
use crate::resource::Resource;
use crate::stream::StreamKind;
use bytes::Bytes;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Stream transports an accept event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Pipe,
}

/// Identity of an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    Ref,
    Destroy,
    Close,
    BufferRecycled,
    Connect,
    Accept(Transport),
    Read,
    Write,
    Shutdown,
    Timeout,
    AfterWork,
    Datagram,
    Sent,
}

impl EventKind {
    /// Every kind the standard catalogue knows about, in slot order.
    pub const ALL: [EventKind; 15] = [
        EventKind::Error,
        EventKind::Ref,
        EventKind::Destroy,
        EventKind::Close,
        EventKind::BufferRecycled,
        EventKind::Connect,
        EventKind::Accept(Transport::Tcp),
        EventKind::Accept(Transport::Pipe),
        EventKind::Read,
        EventKind::Write,
        EventKind::Shutdown,
        EventKind::Timeout,
        EventKind::AfterWork,
        EventKind::Datagram,
        EventKind::Sent,
    ];

    /// Lifecycle-terminal kinds: only one-shot handlers ever fire.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Ref | Self::Destroy)
    }

    /// Kinds whose persistent registrations are stored as one-shot.
    /// Close is included: a handle closes at most once.
    #[must_use]
    pub const fn fires_once(self) -> bool {
        self.is_terminal() || matches!(self, Self::Close)
    }
}

/// A type that can be published through a dispatcher.
pub trait Event: 'static {
    const KIND: EventKind;
}

/// Initialization-time mapping from event kind to dispatcher slot.
#[derive(Debug)]
pub struct EventCatalogue {
    slots: HashMap<EventKind, usize>,
}

static STANDARD: Lazy<EventCatalogue> = Lazy::new(|| EventCatalogue::new(EventKind::ALL));

impl EventCatalogue {
    /// Build a catalogue; slots follow iteration order, duplicates are
    /// ignored.
    pub fn new(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        let mut slots = HashMap::new();
        for kind in kinds {
            let next = slots.len();
            slots.entry(kind).or_insert(next);
        }
        Self { slots }
    }

    /// Catalogue covering every built-in event.
    #[must_use]
    pub fn standard() -> &'static EventCatalogue {
        &STANDARD
    }

    #[must_use]
    pub fn slot(&self, kind: EventKind) -> Option<usize> {
        self.slots.get(&kind).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Asynchronous failure. `status` is a negative errno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub status: i32,
    pub message: String,
    pub op: &'static str,
}

impl Error {
    pub fn new(op: &'static str, status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            op,
        }
    }

    #[must_use]
    pub fn from_io(op: &'static str, err: &io::Error) -> Self {
        Self::new(op, status_of(err), err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.op, self.status, self.message)
    }
}

/// Releases a `ref_until::<Ref>()` keep-alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ref;

/// Published once from the handle's destructor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Destroy;

/// Published once after the native object is released.
#[derive(Debug, Clone, Copy, Default)]
pub struct Close;

#[derive(Debug, Clone, Copy, Default)]
pub struct Connect;

#[derive(Debug, Clone, Copy, Default)]
pub struct Write;

#[derive(Debug, Clone, Copy, Default)]
pub struct Shutdown;

#[derive(Debug, Clone, Copy, Default)]
pub struct Timeout;

/// A datagram left the socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sent;

/// A chunk of inbound stream data.
#[derive(Debug, Clone)]
pub struct Read {
    pub data: Bytes,
}

/// An inbound datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub peer: Option<SocketAddr>,
}

/// A background job finished (or was skipped after `cancel`).
#[derive(Debug, Clone, Copy)]
pub struct AfterWork {
    pub cancelled: bool,
}

/// A submitted buffer coming back to its owner.
///
/// Handlers that want to reuse the buffer move it out with [`take`].
///
/// [`take`]: BufferRecycled::take
pub struct BufferRecycled {
    buffer: RefCell<Option<Buffer>>,
}

impl BufferRecycled {
    pub(crate) fn new(buffer: Buffer) -> Self {
        Self {
            buffer: RefCell::new(Some(buffer)),
        }
    }

    /// Claim the buffer. Later calls return `None`.
    pub fn take(&self) -> Option<Buffer> {
        self.buffer.borrow_mut().take()
    }

    /// Length of the buffer if it has not been claimed yet.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        self.buffer.borrow().as_ref().map(Buffer::len)
    }

    /// Capacity of the buffer if it has not been claimed yet.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.buffer.borrow().as_ref().map(Buffer::capacity)
    }
}

/// A new peer, exclusively owned by whichever handler takes it.
///
/// A peer nobody takes is dropped after the publish returns.
pub struct Accept<K: StreamKind> {
    client: RefCell<Option<Resource<K>>>,
}

impl<K: StreamKind> Accept<K> {
    pub(crate) fn new(client: Resource<K>) -> Self {
        Self {
            client: RefCell::new(Some(client)),
        }
    }

    /// Claim the peer. Later calls return `None`.
    pub fn take(&self) -> Option<Resource<K>> {
        self.client.borrow_mut().take()
    }
}

macro_rules! impl_event {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(impl Event for $ty {
            const KIND: EventKind = $kind;
        })*
    };
}

impl_event! {
    Error => EventKind::Error,
    Ref => EventKind::Ref,
    Destroy => EventKind::Destroy,
    Close => EventKind::Close,
    BufferRecycled => EventKind::BufferRecycled,
    Connect => EventKind::Connect,
    Read => EventKind::Read,
    Write => EventKind::Write,
    Shutdown => EventKind::Shutdown,
    Timeout => EventKind::Timeout,
    AfterWork => EventKind::AfterWork,
    Datagram => EventKind::Datagram,
    Sent => EventKind::Sent,
}

impl<K: StreamKind> Event for Accept<K> {
    const KIND: EventKind = EventKind::Accept(K::TRANSPORT);
}
