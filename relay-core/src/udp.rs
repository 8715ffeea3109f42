//! UDP datagram handles.
//!
//! Sends go through the same pending-write queue as streams: each buffer
//! comes back through `BufferRecycled`, followed by `Sent` or `Error`, in
//! submission order. A socket that sends or receives before `bind` is
//! bound to the unspecified address on an ephemeral port.

use crate::buffer::{Buffer, PendingWrite, PendingWrites, ReadBuf, Submission};
use crate::error::{RelayError, Result, WriteRejected};
use crate::event::{BufferRecycled, Datagram, Sent};
use crate::event_loop::{cancel_task, detach_task};
use crate::resource::{HandleKind, Kind, Resource, WeakResource};
use crate::sys;
use compio::buf::BufResult;
use compio::net::UdpSocket;
use compio::runtime::Task;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::{debug, error, info, trace, warn};

enum Native {
    Empty,
    Raw(Socket),
    Bound(Rc<UdpSocket>),
}

/// UDP socket state.
pub struct UdpKind {
    native: RefCell<Native>,
    destination: Cell<Option<SocketAddr>>,
    pending: PendingWrites,
    receiving: Cell<bool>,
    receiver: RefCell<Option<Task<()>>>,
    sender: RefCell<Option<Task<()>>>,
}

/// A UDP socket handle.
pub type Udp = Resource<UdpKind>;

impl Default for UdpKind {
    fn default() -> Self {
        Self {
            native: RefCell::new(Native::Empty),
            destination: Cell::new(None),
            pending: PendingWrites::default(),
            receiving: Cell::new(false),
            receiver: RefCell::new(None),
            sender: RefCell::new(None),
        }
    }
}

impl UdpKind {
    fn raw_fd(&self) -> Option<RawFd> {
        match &*self.native.borrow() {
            Native::Empty => None,
            Native::Raw(socket) => Some(socket.as_raw_fd()),
            Native::Bound(socket) => Some(socket.as_raw_fd()),
        }
    }

    /// Engine socket, converting the raw one on first use. Must run inside
    /// an engine task.
    fn ensure_socket(&self) -> io::Result<Rc<UdpSocket>> {
        let mut native = self.native.borrow_mut();
        let (next, result) = match mem::replace(&mut *native, Native::Empty) {
            Native::Bound(socket) => (Native::Bound(Rc::clone(&socket)), Ok(socket)),
            Native::Raw(socket) => match sys::adopt::<UdpSocket>(socket) {
                Ok(socket) => {
                    let socket = Rc::new(socket);
                    (Native::Bound(Rc::clone(&socket)), Ok(socket))
                }
                Err(err) => (Native::Empty, Err(err)),
            },
            Native::Empty => (Native::Empty, Err(io::Error::from(io::ErrorKind::NotConnected))),
        };
        *native = next;
        result
    }
}

fn new_socket(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl Kind for UdpKind {
    const NAME: &'static str = "Udp";

    fn init(res: &Resource<Self>) -> Result<()> {
        res.register_handle();
        Ok(())
    }

    fn release(res: &Resource<Self>) {
        let kind = res.kind();
        kind.receiving.set(false);
        cancel_task(&kind.receiver);
        cancel_task(&kind.sender);
        let native = mem::replace(&mut *kind.native.borrow_mut(), Native::Empty);
        drop(native);
        for entry in kind.pending.drain() {
            if let (Some(buffer), _) = entry.into_parts() {
                res.publish(&BufferRecycled::new(buffer));
            }
        }
    }

    fn holds_buffers(res: &Resource<Self>) -> bool {
        res.kind().sender.borrow().is_some()
    }
}

impl HandleKind for UdpKind {
    fn begin_close(res: &Resource<Self>) {
        let kind = res.kind();
        kind.receiving.set(false);
        cancel_task(&kind.receiver);
        // a running sender finishes the close once its datagram is out
        if kind.sender.borrow().is_none() {
            res.finish_close_deferred();
        }
    }
}

impl Resource<UdpKind> {
    /// Bind to `addr`.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let mut native = self.kind().native.borrow_mut();
        if !matches!(&*native, Native::Empty) {
            return Err(RelayError::InvalidState("udp socket already bound"));
        }
        let socket = new_socket(Domain::for_address(addr))?;
        if let Err(err) = socket.bind(&addr.into()) {
            warn!(id = self.id(), %addr, error = %err, "[Udp] bind failed");
            return Err(err.into());
        }
        let bound = socket.local_addr().ok().and_then(|a| a.as_socket()).unwrap_or(addr);
        info!(id = self.id(), addr = %bound, "[Udp] bound");
        *native = Native::Raw(socket);
        Ok(())
    }

    /// Parse and bind, e.g. `"127.0.0.1:0"`.
    pub fn bind_str(&self, addr: &str) -> Result<()> {
        let parsed: SocketAddr = addr
            .parse()
            .map_err(|_| RelayError::invalid_address(addr))?;
        self.bind(parsed)
    }

    /// Adopt an existing datagram socket.
    pub fn open(&self, socket: Socket) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let mut native = self.kind().native.borrow_mut();
        if !matches!(&*native, Native::Empty) {
            return Err(RelayError::InvalidState("udp socket already bound"));
        }
        socket.set_nonblocking(true)?;
        *native = Native::Raw(socket);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let fd = self
            .kind()
            .raw_fd()
            .ok_or(RelayError::InvalidState("udp socket not bound"))?;
        let addr = sys::with_sock(fd, |sock| sock.local_addr())?;
        addr.as_socket()
            .ok_or_else(|| RelayError::invalid_address("not an inet socket"))
    }

    /// Default target for [`send`](Self::send).
    pub fn set_destination(&self, addr: SocketAddr) {
        self.kind().destination.set(Some(addr));
    }

    /// Send to the address set with `set_destination`.
    pub fn send(&self, buffer: Buffer) -> std::result::Result<(), WriteRejected> {
        match self.kind().destination.get() {
            Some(target) => self.send_to(buffer, target),
            None => Err(WriteRejected::new(
                buffer,
                RelayError::InvalidState("udp destination not set"),
            )),
        }
    }

    /// Queue one datagram for `target`.
    pub fn send_to(&self, buffer: Buffer, target: SocketAddr) -> std::result::Result<(), WriteRejected> {
        if !self.is_valid() {
            return Err(WriteRejected::new(buffer, RelayError::Closed));
        }
        if let Err(err) = self.autobind(target.is_ipv6()) {
            return Err(WriteRejected::new(buffer, err));
        }
        let kind = self.kind();
        let mut entry = PendingWrite::datagram(buffer, target);
        if kind.pending.is_empty() {
            if let Some(fd) = kind.raw_fd() {
                try_send_now(fd, &mut entry, target);
            }
        }
        kind.pending.push(entry);
        ensure_sender(self);
        Ok(())
    }

    /// Datagrams queued and not yet reported.
    #[must_use]
    pub fn send_queue_size(&self) -> usize {
        self.kind().pending.len()
    }

    /// Publish a `Datagram` event per inbound datagram until `recv_stop`.
    pub fn recv_start(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let kind = self.kind();
        if kind.receiving.get() {
            return Ok(());
        }
        self.autobind(false)?;
        kind.receiving.set(true);
        let task = spawn_receiver(self);
        *kind.receiver.borrow_mut() = Some(task);
        Ok(())
    }

    /// Stop receiving. A datagram in flight is discarded.
    pub fn recv_stop(&self) {
        let kind = self.kind();
        kind.receiving.set(false);
        cancel_task(&kind.receiver);
    }

    #[must_use]
    pub fn is_receiving(&self) -> bool {
        self.kind().receiving.get()
    }

    fn autobind(&self, ipv6: bool) -> Result<()> {
        if self.kind().raw_fd().is_some() {
            return Ok(());
        }
        let any = if ipv6 {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        trace!(id = self.id(), addr = %any, "[Udp] implicit bind");
        self.bind(any)
    }
}

fn try_send_now(fd: RawFd, entry: &mut PendingWrite, target: SocketAddr) {
    let Some(buffer) = entry.buffer_mut() else { return };
    match sys::send_to_nonblocking(fd, buffer.remaining(), &SockAddr::from(target)) {
        Ok(_) => entry.complete(Ok(())),
        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
        Err(err) => entry.complete(Err(err)),
    }
}

fn ensure_sender(res: &Udp) {
    let kind = res.kind();
    if res.is_closing() || kind.sender.borrow().is_some() {
        return;
    }
    let weak = res.downgrade();
    let guard = res.event_loop().keep_alive();
    let task = res.event_loop().spawn(async move {
        let _guard = guard;
        drive_sends(weak).await;
    });
    *kind.sender.borrow_mut() = Some(task);
}

async fn drive_sends(weak: WeakResource<UdpKind>) {
    loop {
        let (socket, buffer, target) = {
            let Some(res) = weak.upgrade() else { return };
            complete_finished(&res);
            if res.is_destroyed() {
                return;
            }
            let kind = res.kind();
            if res.is_closing() {
                detach_task(&kind.sender);
                res.finish_close();
                return;
            }
            match kind.pending.start_head() {
                None => {
                    detach_task(&kind.sender);
                    return;
                }
                Some(Submission::Data { buffer, target }) => {
                    let target = target.or_else(|| kind.destination.get());
                    match (kind.ensure_socket(), target) {
                        (Ok(socket), Some(target)) => (socket, buffer, target),
                        (Err(err), _) => {
                            kind.pending.finish_head(Err(err), Some(buffer));
                            continue;
                        }
                        (Ok(_), None) => {
                            let err = io::Error::from(io::ErrorKind::AddrNotAvailable);
                            kind.pending.finish_head(Err(err), Some(buffer));
                            continue;
                        }
                    }
                }
                Some(Submission::Descriptor { .. }) => {
                    let err = io::Error::from(io::ErrorKind::Unsupported);
                    kind.pending.finish_head(Err(err), None);
                    continue;
                }
            }
        };

        let BufResult(result, buffer) = socket.send_to(buffer, target).await;
        drop(socket);
        let Some(res) = weak.upgrade() else { return };
        res.kind().pending.finish_head(result.map(|_| ()), Some(buffer));
    }
}

fn complete_finished(res: &Udp) {
    while let Some(entry) = res.kind().pending.pop_finished() {
        let closing = res.is_closing();
        let (buffer, outcome) = entry.into_parts();
        if let Some(buffer) = buffer {
            res.publish(&BufferRecycled::new(buffer));
        }
        match outcome {
            Some(Ok(())) => res.publish(&Sent),
            Some(Err(err)) if closing => {
                trace!(id = res.id(), error = %err, "[Udp] send cancelled by close");
            }
            Some(Err(err)) => {
                debug!(id = res.id(), error = %err, "[Udp] send failed");
                res.report_error("send", &err);
            }
            None => {}
        }
        if res.is_destroyed() {
            return;
        }
    }
}

fn spawn_receiver(res: &Udp) -> Task<()> {
    let weak = res.downgrade();
    let size = res.event_loop().options().datagram_buffer_size;
    let guard = res.event_loop().keep_alive();
    res.event_loop().spawn(async move {
        let _guard = guard;
        let mut buf = ReadBuf::new(size);
        loop {
            let socket = {
                let Some(res) = weak.upgrade() else { return };
                match res.kind().ensure_socket() {
                    Ok(socket) => socket,
                    Err(err) => {
                        fail_recv(&res, &err);
                        return;
                    }
                }
            };
            buf.prepare();
            let BufResult(result, back) = socket.recv_from(buf).await;
            buf = back;
            drop(socket);

            let Some(res) = weak.upgrade() else { return };
            match result {
                Ok((n, peer)) => {
                    res.publish(&Datagram {
                        data: buf.take_chunk(n),
                        peer: Some(peer),
                    });
                    if res.is_closing() || !res.kind().receiving.get() {
                        detach_task(&res.kind().receiver);
                        return;
                    }
                }
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {}
                Err(err) => {
                    fail_recv(&res, &err);
                    return;
                }
            }
        }
    })
}

fn fail_recv(res: &Udp, err: &io::Error) {
    error!(id = res.id(), error = %err, "[Udp] receive failed");
    detach_task(&res.kind().receiver);
    res.kind().receiving.set(false);
    res.report_error("recv", err);
    res.close();
}
