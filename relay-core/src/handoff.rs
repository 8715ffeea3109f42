//! Live socket handoff over a cross-process pipe.
//!
//! The sender writes a single marker byte carrying the socket as
//! `SCM_RIGHTS` ancillary data. The receiving pipe collects descriptors
//! with every read; when exactly one is pending after a read it is
//! inspected and claimed:
//!
//! - a TCP stream socket becomes a new [`Tcp`] published as
//!   `Accept<TcpKind>`,
//! - a Unix stream socket becomes a new [`Pipe`] published as
//!   `Accept<PipeKind>`,
//! - anything else is logged and left queued.
//!
//! The engine has no `sendmsg`/`recvmsg` operation, so both ends wait for
//! readiness on the runtime's blocking pool: a `poll` on a duplicate of the
//! pipe descriptor, bounded by `handoff_poll_interval`, after which the
//! task drains the socket with non-blocking `recvmsg` calls.

use crate::buffer::{Buffer, PendingWrite};
use crate::error::{RelayError, Result};
use crate::event_loop::detach_task;
use crate::pipe::{Pipe, PipeKind};
use crate::resource::{Resource, WeakResource};
use crate::stream::{self, StreamKind};
use crate::sys;
use crate::tcp::{Tcp, TcpKind};
use bytes::Bytes;
use compio::runtime::Task;
use socket2::{Domain, Socket, Type};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Payload byte of a handoff message. Its value carries no meaning.
const HANDOFF_MARKER: u8 = b'.';

/// Transport of a descriptor waiting on a receiving pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingHandle {
    Tcp,
    Pipe,
    Other,
}

/// Classify a received descriptor by socket type and bound address family.
fn inspect(fd: &OwnedFd) -> PendingHandle {
    sys::with_sock(fd.as_raw_fd(), |sock| {
        match sock.r#type() {
            Ok(ty) if ty == Type::STREAM => {}
            _ => return PendingHandle::Other,
        }
        match sock.local_addr().map(|addr| addr.domain()) {
            Ok(domain) if domain == Domain::UNIX => PendingHandle::Pipe,
            Ok(domain) if domain == Domain::IPV4 || domain == Domain::IPV6 => PendingHandle::Tcp,
            _ => PendingHandle::Other,
        }
    })
}

impl Resource<PipeKind> {
    /// Send a TCP socket to the peer process or loop. The local handle
    /// stays open; close it once the peer has taken over.
    pub fn send_tcp_handle(&self, handle: &Tcp) -> Result<()> {
        self.send_handle(handle.kind().io().raw_fd())
    }

    /// Send a local-channel socket to the peer.
    pub fn send_pipe_handle(&self, handle: &Pipe) -> Result<()> {
        self.send_handle(handle.kind().io().raw_fd())
    }

    fn send_handle(&self, passed: Option<RawFd>) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        if !self.is_cross_process() {
            return Err(RelayError::NotCrossProcess);
        }
        let passed = passed.ok_or(RelayError::InvalidState("handle has no socket to send"))?;
        let io = self.kind().io();
        let channel = io
            .raw_fd()
            .ok_or(RelayError::InvalidState("pipe is not connected"))?;

        // the queue keeps its own copy so the sender may close its handle
        let copy: OwnedFd = sys::with_sock(passed, |sock| sock.try_clone())?.into();
        let mut entry = PendingWrite::descriptor(Buffer::from_slice(&[HANDOFF_MARKER]), copy);
        if io.pending.is_empty() && io.connector.borrow().is_none() {
            match sys::send_with_descriptor(channel, HANDOFF_MARKER, passed) {
                Ok(_) => entry.complete(Ok(())),
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
                Err(err) => entry.complete(Err(err)),
            }
        }
        trace!(id = self.id(), fd = passed, "[Pipe] handle queued for handoff");
        io.pending.push(entry);
        stream::ensure_writer(self);
        Ok(())
    }

    /// Descriptors received and not yet claimed.
    #[must_use]
    pub fn pending_handle_count(&self) -> usize {
        self.kind().pending_fds.borrow().len()
    }

    /// Transport of the oldest unclaimed descriptor.
    #[must_use]
    pub fn pending_handle_type(&self) -> Option<PendingHandle> {
        self.kind().pending_fds.borrow().front().map(inspect)
    }
}

/// Claim the pending descriptor if exactly one is waiting.
fn process_pending(channel: &Pipe) {
    let count = channel.pending_handle_count();
    if count != 1 {
        if count > 1 {
            warn!(id = channel.id(), count, "[Pipe] several handles pending, none claimed");
        }
        return;
    }
    match channel.pending_handle_type() {
        Some(PendingHandle::Tcp) => {
            let Some(fd) = channel.kind().pending_fds.borrow_mut().pop_front() else { return };
            claim(channel, Tcp::create(channel.event_loop()), fd);
        }
        Some(PendingHandle::Pipe) => {
            let Some(fd) = channel.kind().pending_fds.borrow_mut().pop_front() else { return };
            let kind = PipeKind::accepted(channel);
            claim(channel, Pipe::create_with(channel.event_loop(), kind), fd);
        }
        Some(PendingHandle::Other) => {
            warn!(id = channel.id(), "[Pipe] pending handle is not a stream socket, ignored");
        }
        None => {}
    }
}

/// Adopt `fd` into a freshly created handle and publish it on `channel`.
/// A failure closes the descriptor and leaves the channel untouched.
fn claim<K>(channel: &Pipe, created: Result<Resource<K>>, fd: OwnedFd)
where
    K: StreamKind,
    Resource<K>: Adopt,
{
    let handle = match created {
        Ok(handle) => handle,
        Err(err) => {
            error!(id = channel.id(), kind = K::NAME, error = %err, "[Pipe] cannot create handle for received socket");
            return;
        }
    };
    if let Err(err) = handle.adopt(Socket::from(fd)) {
        error!(id = channel.id(), kind = K::NAME, error = %err, "[Pipe] cannot adopt received socket");
        return;
    }
    debug!(id = channel.id(), handle = handle.id(), kind = K::NAME, "[Pipe] received handle");
    stream::publish_accepted(channel, handle);
}

/// Handles that can take over a received socket.
trait Adopt {
    fn adopt(&self, socket: Socket) -> Result<()>;
}

impl Adopt for Resource<TcpKind> {
    fn adopt(&self, socket: Socket) -> Result<()> {
        self.open(socket)
    }
}

impl Adopt for Resource<PipeKind> {
    fn adopt(&self, socket: Socket) -> Result<()> {
        self.open(socket)
    }
}

#[derive(Clone, Copy)]
enum Readiness {
    Readable,
    Writable,
}

/// Wait on the blocking pool for up to `slice`. The pool job owns its
/// descriptor copy, so a cancelled wait never outlives its slice.
async fn wait_ready(fd: &Arc<OwnedFd>, readiness: Readiness, slice: Duration) -> io::Result<bool> {
    let fd = Arc::clone(fd);
    compio::runtime::spawn_blocking(move || match readiness {
        Readiness::Readable => sys::wait_readable(fd.as_raw_fd(), slice),
        Readiness::Writable => sys::wait_writable(fd.as_raw_fd(), slice),
    })
    .await
}

fn duplicate(fd: RawFd) -> io::Result<Arc<OwnedFd>> {
    let copy = sys::with_sock(fd, |sock| sock.try_clone())?;
    Ok(Arc::new(copy.into()))
}

/// Send one handoff message, waiting for room while the channel is full.
pub(crate) async fn send_descriptor(fd: RawFd, marker: u8, passed: RawFd, slice: Duration) -> io::Result<()> {
    let mut channel = None;
    loop {
        match sys::send_with_descriptor(fd, marker, passed) {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                let copy = match &channel {
                    Some(copy) => Arc::clone(copy),
                    None => {
                        let copy = duplicate(fd)?;
                        channel = Some(Arc::clone(&copy));
                        copy
                    }
                };
                wait_ready(&copy, Readiness::Writable, slice).await?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

enum Drain {
    Idle,
    Stop,
}

/// Reader for a cross-process pipe: data is published as `Read`, passed
/// descriptors are queued and then claimed.
pub(crate) fn spawn_handoff_reader(res: &Pipe, initial: Option<Bytes>) -> Task<()> {
    let weak = res.downgrade();
    let options = res.event_loop().options();
    let (size, max_fds, slice) = (
        options.read_buffer_size,
        options.max_pending_handles,
        options.handoff_poll_interval,
    );
    let guard = res.event_loop().keep_alive();
    res.event_loop().spawn(async move {
        let _guard = guard;
        if let Some(data) = initial {
            if !stream::deliver(&weak, data) {
                return;
            }
        }

        let watched = {
            let Some(res) = weak.upgrade() else { return };
            let copy = res
                .kind()
                .io()
                .raw_fd()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
                .and_then(duplicate);
            match copy {
                Ok(copy) => copy,
                Err(err) => {
                    stream::fail_read(&res, &err);
                    return;
                }
            }
        };

        let mut buf = vec![0_u8; size];
        loop {
            match wait_ready(&watched, Readiness::Readable, slice).await {
                Ok(false) => {
                    if weak.upgrade().is_none() {
                        return;
                    }
                }
                Ok(true) => {
                    if let Drain::Stop = drain(&weak, &mut buf, max_fds) {
                        return;
                    }
                }
                Err(err) => {
                    let Some(res) = weak.upgrade() else { return };
                    warn!(id = res.id(), error = %err, "[Pipe] readiness poll failed");
                    stream::fail_read(&res, &err);
                    return;
                }
            }
        }
    })
}

/// Read until the socket would block.
fn drain(weak: &WeakResource<PipeKind>, buf: &mut [u8], max_fds: usize) -> Drain {
    loop {
        let received = {
            let Some(res) = weak.upgrade() else { return Drain::Stop };
            let Some(fd) = res.kind().io().raw_fd() else { return Drain::Stop };
            match sys::recv_with_descriptors(fd, buf, max_fds) {
                Ok((n, fds)) => {
                    if !fds.is_empty() {
                        trace!(id = res.id(), count = fds.len(), "[Pipe] descriptors received");
                        res.kind().pending_fds.borrow_mut().extend(fds);
                    }
                    n
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Drain::Idle,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    stream::fail_read(&res, &err);
                    return Drain::Stop;
                }
            }
        };

        if received == 0 {
            let Some(res) = weak.upgrade() else { return Drain::Stop };
            debug!(id = res.id(), "[Pipe] end of stream");
            detach_task(&res.kind().io().reader);
            res.close();
            return Drain::Stop;
        }

        let keep = stream::deliver(weak, Bytes::copy_from_slice(&buf[..received]));
        let Some(res) = weak.upgrade() else { return Drain::Stop };
        if !res.is_closing() {
            process_pending(&res);
        }
        if !keep || res.is_closing() {
            return Drain::Stop;
        }
    }
}
