//! Duplex byte streams.
//!
//! Behaviour shared by every stream transport: listen/accept, connect,
//! read start/stop, queued and immediate writes, write-side shutdown and
//! close with buffer recycling. Transports plug in through [`StreamKind`].
//!
//! Each stream runs up to four engine tasks (acceptor, connector, reader,
//! writer). Tasks hold a weak reference to the stream and keep the loop
//! alive while they exist. The writer is the only task that touches the
//! pending-write queue after submission, so completions are strictly FIFO.
//!
//! Close while a write is in flight shuts the socket down so the write
//! fails fast; the writer then recycles what is left and finishes the
//! close itself.

use crate::buffer::{Buffer, PendingWrite, PendingWrites, ReadBuf, Submission};
use crate::error::{RelayError, Result, WriteRejected};
use crate::event_loop::{cancel_task, detach_task};
use crate::event::{self, Accept, BufferRecycled, Close, Connect, Read, Transport, Write};
use crate::handoff;
use crate::resource::{HandleKind, Kind, Resource, WeakResource};
use crate::sys;
use bytes::Bytes;
use compio::buf::{BufResult, IoBuf, IoBufMut};
use compio::runtime::Task;
use socket2::Socket;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

mod private {
    pub trait Sealed {}
}

pub(crate) use private::Sealed;

/// A stream transport.
///
/// Implemented by [`TcpKind`](crate::tcp::TcpKind) and
/// [`PipeKind`](crate::pipe::PipeKind) only.
pub trait StreamKind: HandleKind + Sealed {
    /// Connected engine socket.
    type Conn: AsRawFd + 'static;
    /// Listening engine socket.
    type Listener: AsRawFd + 'static;
    /// Tag carried by this transport's accept event.
    const TRANSPORT: Transport;

    fn io(&self) -> &StreamIo<Self>;

    /// Kind value for a peer accepted on `listener`.
    fn accepted(listener: &Resource<Self>) -> Self;

    fn wrap_conn(socket: Socket) -> io::Result<Self::Conn>;

    fn wrap_listener(socket: Socket) -> io::Result<Self::Listener>;

    fn accept(listener: &Self::Listener) -> impl Future<Output = io::Result<Self::Conn>>;

    fn read<B: IoBufMut>(conn: &Self::Conn, buf: B) -> impl Future<Output = BufResult<usize, B>>;

    fn write_all<B: IoBuf>(conn: &Self::Conn, buf: B) -> impl Future<Output = BufResult<(), B>>;

    /// Record the remote address of a fresh connection, falling back to
    /// the local one.
    fn resolve_peer(res: &Resource<Self>) -> io::Result<()>;

    fn spawn_reader(res: &Resource<Self>, initial: Option<Bytes>) -> Task<()> {
        spawn_reader(res, initial)
    }
}

pub(crate) enum Native<K: StreamKind> {
    Empty,
    /// Plain socket not yet handed to the engine: freshly bound, or
    /// received through a descriptor handoff.
    Raw(Socket),
    Listener(Rc<K::Listener>),
    Stream(Rc<K::Conn>),
}

/// Per-stream state shared by all transports.
pub struct StreamIo<K: StreamKind> {
    pub(crate) native: RefCell<Native<K>>,
    pub(crate) pending: PendingWrites,
    pub(crate) reading: Cell<bool>,
    pub(crate) in_flight: Cell<bool>,
    pub(crate) shutdown_requested: Cell<bool>,
    pub(crate) stash: RefCell<Option<Bytes>>,
    pub(crate) reader: RefCell<Option<Task<()>>>,
    pub(crate) writer: RefCell<Option<Task<()>>>,
    pub(crate) acceptor: RefCell<Option<Task<()>>>,
    pub(crate) connector: RefCell<Option<Task<()>>>,
}

impl<K: StreamKind> Default for StreamIo<K> {
    fn default() -> Self {
        Self {
            native: RefCell::new(Native::Empty),
            pending: PendingWrites::default(),
            reading: Cell::new(false),
            in_flight: Cell::new(false),
            shutdown_requested: Cell::new(false),
            stash: RefCell::new(None),
            reader: RefCell::new(None),
            writer: RefCell::new(None),
            acceptor: RefCell::new(None),
            connector: RefCell::new(None),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

impl<K: StreamKind> StreamIo<K> {
    pub(crate) fn set_raw(&self, socket: Socket) {
        *self.native.borrow_mut() = Native::Raw(socket);
    }

    pub(crate) fn set_conn(&self, conn: K::Conn) {
        *self.native.borrow_mut() = Native::Stream(Rc::new(conn));
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        match &*self.native.borrow() {
            Native::Empty => None,
            Native::Raw(socket) => Some(socket.as_raw_fd()),
            Native::Listener(listener) => Some(listener.as_raw_fd()),
            Native::Stream(conn) => Some(conn.as_raw_fd()),
        }
    }

    fn is_connected(&self) -> bool {
        matches!(&*self.native.borrow(), Native::Raw(_) | Native::Stream(_))
    }

    /// Engine stream for I/O, converting a raw socket on first use.
    /// Must run inside an engine task.
    pub(crate) fn ensure_conn(&self) -> io::Result<Rc<K::Conn>> {
        let mut native = self.native.borrow_mut();
        let (next, result) = match mem::replace(&mut *native, Native::Empty) {
            Native::Stream(conn) => (Native::Stream(Rc::clone(&conn)), Ok(conn)),
            Native::Raw(socket) => match K::wrap_conn(socket) {
                Ok(conn) => {
                    let conn = Rc::new(conn);
                    (Native::Stream(Rc::clone(&conn)), Ok(conn))
                }
                Err(err) => (Native::Empty, Err(err)),
            },
            other => (other, Err(not_connected())),
        };
        *native = next;
        result
    }

    fn ensure_listener(&self) -> io::Result<Rc<K::Listener>> {
        let mut native = self.native.borrow_mut();
        let (next, result) = match mem::replace(&mut *native, Native::Empty) {
            Native::Listener(listener) => (Native::Listener(Rc::clone(&listener)), Ok(listener)),
            Native::Raw(socket) => match K::wrap_listener(socket) {
                Ok(listener) => {
                    let listener = Rc::new(listener);
                    (Native::Listener(Rc::clone(&listener)), Ok(listener))
                }
                Err(err) => (Native::Empty, Err(err)),
            },
            other => (other, Err(io::Error::from(io::ErrorKind::InvalidInput))),
        };
        *native = next;
        result
    }
}

impl<K: StreamKind> Resource<K> {
    /// Start accepting connections on a bound socket.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let io = self.kind().io();
        if io.acceptor.borrow().is_some() {
            return Err(RelayError::InvalidState("already listening"));
        }
        match &*io.native.borrow() {
            Native::Raw(socket) => socket.listen(backlog)?,
            _ => return Err(RelayError::InvalidState("listen requires a bound socket")),
        }
        let task = spawn_acceptor(self);
        *io.acceptor.borrow_mut() = Some(task);
        debug!(id = self.id(), kind = K::NAME, backlog, "[Stream] listening");
        Ok(())
    }

    /// `listen` with the loop's configured backlog.
    pub fn listen_default(&self) -> Result<()> {
        self.listen(self.event_loop().options().listen_backlog)
    }

    /// Deliver a `Read` event per inbound chunk until `read_stop`.
    pub fn read_start(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let io = self.kind().io();
        if io.reading.get() {
            return Ok(());
        }
        if !io.is_connected() {
            return Err(RelayError::InvalidState("stream is not connected"));
        }
        io.reading.set(true);
        if io.reader.borrow().is_none() {
            let initial = io.stash.borrow_mut().take();
            let task = K::spawn_reader(self, initial);
            *io.reader.borrow_mut() = Some(task);
        }
        Ok(())
    }

    /// Stop delivering `Read` events. A read already in flight completes
    /// into a stash that the next `read_start` delivers first.
    pub fn read_stop(&self) {
        self.kind().io().reading.set(false);
    }

    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.kind().io().reading.get()
    }

    /// Queue `buffer` for writing. Completion is reported later through
    /// `BufferRecycled` followed by `Write` or `Error`.
    ///
    /// A stream that is closing refuses the write and hands the buffer back.
    pub fn write_async(&self, buffer: Buffer) -> std::result::Result<(), WriteRejected> {
        if !self.is_valid() {
            return Err(WriteRejected::new(buffer, RelayError::Closed));
        }
        let io = self.kind().io();
        let mut entry = PendingWrite::data(buffer);
        if io.pending.is_empty() && io.connector.borrow().is_none() {
            if let Some(fd) = io.raw_fd() {
                try_send_now(fd, &mut entry);
            }
        }
        io.pending.push(entry);
        ensure_writer(self);
        Ok(())
    }

    /// Immediate non-blocking write. Never queues; fails with `WouldBlock`
    /// while queued writes are pending.
    pub fn write_sync(&self, data: &[u8]) -> Result<usize> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let io = self.kind().io();
        if !io.pending.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock).into());
        }
        let fd = io
            .raw_fd()
            .ok_or(RelayError::InvalidState("stream is not connected"))?;
        Ok(sys::send_nonblocking(fd, data)?)
    }

    /// Half-close the outbound direction once queued writes have drained.
    pub fn shutdown(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let io = self.kind().io();
        if io.raw_fd().is_none() {
            return Err(RelayError::InvalidState("stream is not connected"));
        }
        io.shutdown_requested.set(true);
        ensure_writer(self);
        Ok(())
    }

    /// Writes submitted and not yet completed.
    #[must_use]
    pub fn write_queue_size(&self) -> usize {
        self.kind().io().pending.len()
    }
}

fn try_send_now(fd: RawFd, entry: &mut PendingWrite) {
    let Some(buffer) = entry.buffer_mut() else { return };
    let len = buffer.remaining().len();
    match sys::send_nonblocking(fd, buffer.remaining()) {
        Ok(n) if n >= len => entry.complete(Ok(())),
        Ok(n) => buffer.advance(n),
        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
        Err(err) => entry.complete(Err(err)),
    }
}

/// Spawn the writer unless one is running or a connect is pending.
pub(crate) fn ensure_writer<K: StreamKind>(res: &Resource<K>) {
    let io = res.kind().io();
    if res.is_closing() || io.writer.borrow().is_some() || io.connector.borrow().is_some() {
        return;
    }
    let weak = res.downgrade();
    let guard = res.event_loop().keep_alive();
    let task = res.event_loop().spawn(async move {
        let _guard = guard;
        drive_writes(weak).await;
    });
    *io.writer.borrow_mut() = Some(task);
}

enum Outgoing<C> {
    Data(Rc<C>, Buffer),
    Descriptor { fd: RawFd, marker: u8, passed: RawFd, slice: Duration },
}

async fn drive_writes<K: StreamKind>(weak: WeakResource<K>) {
    loop {
        let outgoing = {
            let Some(res) = weak.upgrade() else { return };
            complete_finished(&res);
            if res.is_destroyed() {
                return;
            }
            let io = res.kind().io();
            if res.is_closing() {
                detach_task(&io.writer);
                res.finish_close();
                return;
            }
            match io.pending.start_head() {
                None => {
                    detach_task(&io.writer);
                    if io.shutdown_requested.replace(false) {
                        finish_shutdown(&res);
                    }
                    return;
                }
                Some(Submission::Data { buffer, .. }) => match io.ensure_conn() {
                    Ok(conn) => Outgoing::Data(conn, buffer),
                    Err(err) => {
                        io.pending.finish_head(Err(err), Some(buffer));
                        continue;
                    }
                },
                Some(Submission::Descriptor { marker, fd: passed }) => match io.raw_fd() {
                    Some(fd) => Outgoing::Descriptor {
                        fd,
                        marker,
                        passed,
                        slice: res.event_loop().options().handoff_poll_interval,
                    },
                    None => {
                        io.pending.finish_head(Err(not_connected()), None);
                        continue;
                    }
                },
            }
        };

        if let Some(res) = weak.upgrade() {
            res.kind().io().in_flight.set(true);
        }
        let (outcome, buffer) = match outgoing {
            Outgoing::Data(conn, buffer) => {
                let BufResult(result, buffer) = K::write_all(&conn, buffer).await;
                (result, Some(buffer))
            }
            Outgoing::Descriptor { fd, marker, passed, slice } => {
                (handoff::send_descriptor(fd, marker, passed, slice).await, None)
            }
        };

        let Some(res) = weak.upgrade() else { return };
        let io = res.kind().io();
        io.in_flight.set(false);
        io.pending.finish_head(outcome, buffer);
    }
}

/// Pop completed writes from the head and report them.
fn complete_finished<K: StreamKind>(res: &Resource<K>) {
    while let Some(entry) = res.kind().io().pending.pop_finished() {
        let closing = res.is_closing();
        let (buffer, outcome) = entry.into_parts();
        if let Some(buffer) = buffer {
            res.publish(&BufferRecycled::new(buffer));
        }
        match outcome {
            Some(Ok(())) => res.publish(&Write),
            Some(Err(err)) if closing => {
                trace!(id = res.id(), kind = K::NAME, error = %err, "[Stream] write cancelled by close");
            }
            Some(Err(err)) => {
                debug!(id = res.id(), kind = K::NAME, error = %err, "[Stream] write failed");
                res.report_error("write", &err);
            }
            None => {}
        }
        if res.is_destroyed() {
            return;
        }
    }
}

fn finish_shutdown<K: StreamKind>(res: &Resource<K>) {
    let result = res
        .kind()
        .io()
        .raw_fd()
        .ok_or_else(not_connected)
        .and_then(|fd| sys::shutdown(fd, std::net::Shutdown::Write));
    match result {
        Ok(()) => {
            trace!(id = res.id(), kind = K::NAME, "[Stream] write side shut down");
            res.publish(&event::Shutdown);
        }
        Err(err) => res.report_error("shutdown", &err),
    }
}

pub(crate) fn spawn_reader<K: StreamKind>(res: &Resource<K>, initial: Option<Bytes>) -> Task<()> {
    let weak = res.downgrade();
    let size = res.event_loop().options().read_buffer_size;
    let guard = res.event_loop().keep_alive();
    res.event_loop().spawn(async move {
        let _guard = guard;
        if let Some(data) = initial {
            if !deliver(&weak, data) {
                return;
            }
        }
        let mut buf = ReadBuf::new(size);
        loop {
            let conn = {
                let Some(res) = weak.upgrade() else { return };
                match res.kind().io().ensure_conn() {
                    Ok(conn) => conn,
                    Err(err) => {
                        fail_read(&res, &err);
                        return;
                    }
                }
            };
            buf.prepare();
            let BufResult(result, back) = K::read(&conn, buf).await;
            buf = back;
            drop(conn);

            match result {
                Ok(0) => {
                    let Some(res) = weak.upgrade() else { return };
                    debug!(id = res.id(), kind = K::NAME, "[Stream] end of stream");
                    detach_task(&res.kind().io().reader);
                    res.close();
                    return;
                }
                Ok(n) => {
                    if !deliver(&weak, buf.take_chunk(n)) {
                        return;
                    }
                }
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {}
                Err(err) => {
                    let Some(res) = weak.upgrade() else { return };
                    fail_read(&res, &err);
                    return;
                }
            }
        }
    })
}

/// Publish one inbound chunk. Returns false when the reader should exit.
pub(crate) fn deliver<K: StreamKind>(weak: &WeakResource<K>, data: Bytes) -> bool {
    let Some(res) = weak.upgrade() else { return false };
    let io = res.kind().io();
    if !io.reading.get() {
        *io.stash.borrow_mut() = Some(data);
        detach_task(&io.reader);
        return false;
    }
    res.publish(&Read { data });
    if res.is_destroyed() || res.is_closing() {
        return false;
    }
    if !io.reading.get() {
        detach_task(&io.reader);
        return false;
    }
    true
}

pub(crate) fn fail_read<K: StreamKind>(res: &Resource<K>, err: &io::Error) {
    error!(id = res.id(), kind = K::NAME, error = %err, "[Stream] read failed");
    detach_task(&res.kind().io().reader);
    res.report_error("read", err);
    res.close();
}

fn spawn_acceptor<K: StreamKind>(res: &Resource<K>) -> Task<()> {
    let weak = res.downgrade();
    let guard = res.event_loop().keep_alive();
    res.event_loop().spawn(async move {
        let _guard = guard;
        let listener = {
            let Some(res) = weak.upgrade() else { return };
            match res.kind().io().ensure_listener() {
                Ok(listener) => listener,
                Err(err) => {
                    error!(id = res.id(), kind = K::NAME, error = %err, "[Stream] listener setup failed");
                    res.report_error("listen", &err);
                    return;
                }
            }
        };
        loop {
            let accepted = K::accept(&listener).await;
            let Some(res) = weak.upgrade() else { return };
            match accepted {
                Ok(conn) => accept_peer(&res, conn),
                Err(err) => {
                    error!(id = res.id(), kind = K::NAME, error = %err, "[Stream] accept failed");
                    match err.raw_os_error() {
                        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
                            drop(res);
                            compio::time::sleep(Duration::from_millis(100)).await;
                        }
                        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP) => {
                            detach_task(&res.kind().io().acceptor);
                            res.report_error("accept", &err);
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
    })
}

/// Wrap an inbound connection and hand it to the listener's handlers.
/// The listener is never affected by a failed peer.
pub(crate) fn accept_peer<K: StreamKind>(listener: &Resource<K>, conn: K::Conn) {
    let peer = match Resource::create_with(listener.event_loop(), K::accepted(listener)) {
        Ok(peer) => peer,
        Err(err) => {
            error!(id = listener.id(), kind = K::NAME, error = %err, "[Stream] cannot create accepted peer");
            return;
        }
    };
    peer.kind().io().set_conn(conn);
    publish_accepted(listener, peer);
}

/// Resolve the new peer's address and publish `Accept` on `target`, or
/// close the peer if it cannot be set up.
pub(crate) fn publish_accepted<L: Kind, K: StreamKind>(target: &Resource<L>, peer: Resource<K>) {
    if let Err(err) = K::resolve_peer(&peer) {
        error!(id = target.id(), kind = K::NAME, error = %err, "[Stream] accepted peer setup failed");
        let peer = Rc::new(peer);
        peer.ref_until::<Close>();
        peer.close();
        return;
    }
    trace!(id = target.id(), peer = peer.id(), kind = K::NAME, "[Stream] accepted");
    target.publish(&Accept::new(peer));
}

/// Start an engine connect. `connecting` must not touch the engine before
/// it is first polled.
pub(crate) fn start_connect<K, F>(res: &Resource<K>, connecting: F) -> Result<()>
where
    K: StreamKind,
    F: Future<Output = io::Result<K::Conn>> + 'static,
{
    if !res.is_valid() {
        return Err(RelayError::Closed);
    }
    let io = res.kind().io();
    if io.connector.borrow().is_some() {
        return Err(RelayError::InvalidState("connect already in progress"));
    }
    if io.is_connected() || io.acceptor.borrow().is_some() {
        return Err(RelayError::InvalidState("stream is already connected"));
    }

    let weak = res.downgrade();
    let guard = res.event_loop().keep_alive();
    let task = res.event_loop().spawn(async move {
        let _guard = guard;
        let result = connecting.await;
        let Some(res) = weak.upgrade() else { return };
        let io = res.kind().io();
        detach_task(&io.connector);
        match result {
            Ok(conn) => {
                io.set_conn(conn);
                if let Err(err) = K::resolve_peer(&res) {
                    trace!(id = res.id(), kind = K::NAME, error = %err, "[Stream] peer address unavailable");
                }
                debug!(id = res.id(), kind = K::NAME, "[Stream] connected");
                res.publish(&Connect);
                if !io.pending.is_empty() || io.shutdown_requested.get() {
                    ensure_writer(&res);
                }
            }
            Err(err) => {
                warn!(id = res.id(), kind = K::NAME, error = %err, "[Stream] connect failed");
                res.report_error("connect", &err);
            }
        }
    });
    *io.connector.borrow_mut() = Some(task);
    Ok(())
}

pub(crate) fn begin_close<K: StreamKind>(res: &Resource<K>) {
    let io = res.kind().io();
    io.reading.set(false);
    cancel_task(&io.reader);
    cancel_task(&io.acceptor);
    cancel_task(&io.connector);

    if io.writer.borrow().is_none() {
        res.finish_close_deferred();
        return;
    }
    // the writer finishes the close; make a blocked write fail now
    if io.in_flight.get() {
        if let Some(fd) = io.raw_fd() {
            if let Err(err) = sys::shutdown(fd, std::net::Shutdown::Both) {
                trace!(id = res.id(), kind = K::NAME, error = %err, "[Stream] shutdown on close failed");
            }
        }
    }
}

/// A writer task still owns a submitted buffer.
pub(crate) fn holds_buffers<K: StreamKind>(res: &Resource<K>) -> bool {
    res.kind().io().writer.borrow().is_some()
}

/// Drop the native socket and hand every queued buffer back.
pub(crate) fn release<K: StreamKind>(res: &Resource<K>) {
    let io = res.kind().io();
    io.reading.set(false);
    cancel_task(&io.reader);
    cancel_task(&io.acceptor);
    cancel_task(&io.connector);
    cancel_task(&io.writer);

    let native = mem::replace(&mut *io.native.borrow_mut(), Native::Empty);
    drop(native);
    io.stash.borrow_mut().take();

    for entry in io.pending.drain() {
        if let (Some(buffer), _) = entry.into_parts() {
            res.publish(&BufferRecycled::new(buffer));
        }
    }
}
