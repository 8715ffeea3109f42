//! Local-channel (Unix domain socket) stream handles.
//!
//! A pipe created in cross-process mode can carry live sockets to its peer
//! (see [`handoff`](crate::handoff)); its reads go through `recvmsg` so
//! that passed descriptors are collected alongside the data.

use crate::error::{RelayError, Result};
use crate::event::Transport;
use crate::handoff;
use crate::resource::{HandleKind, Kind, Resource};
use crate::stream::{self, Native, Sealed, StreamIo, StreamKind};
use crate::sys;
use bytes::Bytes;
use compio::buf::{BufResult, IoBuf, IoBufMut};
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::{UnixListener, UnixStream};
use compio::runtime::Task;
use socket2::{Domain, SockAddr, Socket, Type};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Local-channel stream state.
pub struct PipeKind {
    io: StreamIo<PipeKind>,
    cross_process: bool,
    name: RefCell<Option<PathBuf>>,
    owns_path: Cell<bool>,
    pub(crate) pending_fds: RefCell<VecDeque<OwnedFd>>,
}

/// A local-channel stream handle.
pub type Pipe = Resource<PipeKind>;

impl PipeKind {
    /// `cross_process` pipes can send and receive live handles.
    #[must_use]
    pub fn new(cross_process: bool) -> Self {
        Self {
            io: StreamIo::default(),
            cross_process,
            name: RefCell::new(None),
            owns_path: Cell::new(false),
            pending_fds: RefCell::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn cross_process() -> Self {
        Self::new(true)
    }
}

impl Default for PipeKind {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Kind for PipeKind {
    const NAME: &'static str = "Pipe";

    fn init(res: &Resource<Self>) -> Result<()> {
        res.register_handle();
        Ok(())
    }

    fn release(res: &Resource<Self>) {
        stream::release(res);
        let kind = res.kind();
        let stranded = kind.pending_fds.borrow_mut().len();
        if stranded > 0 {
            debug!(id = res.id(), count = stranded, "[Pipe] closing unclaimed handles");
        }
        kind.pending_fds.borrow_mut().clear();
        if kind.owns_path.replace(false) {
            if let Some(path) = kind.name.borrow().as_deref() {
                if let Err(err) = fs::remove_file(path) {
                    trace!(id = res.id(), path = %path.display(), error = %err, "[Pipe] unlink failed");
                }
            }
        }
    }

    fn holds_buffers(res: &Resource<Self>) -> bool {
        stream::holds_buffers(res)
    }
}

impl HandleKind for PipeKind {
    fn begin_close(res: &Resource<Self>) {
        stream::begin_close(res);
    }
}

impl Sealed for PipeKind {}

impl StreamKind for PipeKind {
    type Conn = UnixStream;
    type Listener = UnixListener;
    const TRANSPORT: Transport = Transport::Pipe;

    fn io(&self) -> &StreamIo<Self> {
        &self.io
    }

    fn accepted(listener: &Resource<Self>) -> Self {
        let kind = Self::new(listener.kind().cross_process);
        *kind.name.borrow_mut() = listener.kind().name.borrow().clone();
        kind
    }

    fn wrap_conn(socket: Socket) -> io::Result<UnixStream> {
        sys::adopt(socket)
    }

    fn wrap_listener(socket: Socket) -> io::Result<UnixListener> {
        sys::adopt(socket)
    }

    async fn accept(listener: &UnixListener) -> io::Result<UnixStream> {
        let (stream, _addr) = listener.accept().await?;
        Ok(stream)
    }

    async fn read<B: IoBufMut>(conn: &UnixStream, buf: B) -> BufResult<usize, B> {
        let mut stream = conn;
        AsyncRead::read(&mut stream, buf).await
    }

    async fn write_all<B: IoBuf>(conn: &UnixStream, buf: B) -> BufResult<(), B> {
        let mut stream = conn;
        stream.write_all(buf).await
    }

    fn resolve_peer(res: &Resource<Self>) -> io::Result<()> {
        let fd = res
            .kind()
            .io
            .raw_fd()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let path = sys::with_sock(fd, |sock| {
            let peer = sock.peer_addr().ok().and_then(|a| a.as_pathname().map(Path::to_path_buf));
            match peer {
                Some(path) => Ok(Some(path)),
                None => sock.local_addr().map(|a| a.as_pathname().map(Path::to_path_buf)),
            }
        })?;
        // unnamed on both ends: keep whatever name we inherited
        if let Some(path) = path {
            *res.kind().name.borrow_mut() = Some(path);
        }
        Ok(())
    }

    fn spawn_reader(res: &Resource<Self>, initial: Option<Bytes>) -> Task<()> {
        if res.kind().cross_process {
            handoff::spawn_handoff_reader(res, initial)
        } else {
            stream::spawn_reader(res, initial)
        }
    }
}

fn new_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl Resource<PipeKind> {
    /// Bind to a filesystem path. A stale socket file at `path` is removed
    /// first; the file is unlinked again when the pipe is released.
    pub fn bind(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let path = path.as_ref();
        let io = &self.kind().io;
        if !matches!(&*io.native.borrow(), Native::Empty) {
            return Err(RelayError::InvalidState("pipe socket already in use"));
        }
        if path.exists() {
            fs::remove_file(path)?;
        }
        let addr = SockAddr::unix(path)?;
        let socket = new_socket()?;
        if let Err(err) = socket.bind(&addr) {
            warn!(id = self.id(), path = %path.display(), error = %err, "[Pipe] bind failed");
            return Err(err.into());
        }
        info!(id = self.id(), path = %path.display(), "[Pipe] bound");
        io.set_raw(socket);
        *self.kind().name.borrow_mut() = Some(path.to_path_buf());
        self.kind().owns_path.set(true);
        Ok(())
    }

    /// Connect to the pipe bound at `path`; `Connect` or `Error` follows.
    pub fn connect(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        debug!(id = self.id(), path = %path.display(), "[Pipe] connecting");
        *self.kind().name.borrow_mut() = Some(path.clone());
        stream::start_connect(self, UnixStream::connect(path))
    }

    /// Adopt an existing connected or bound socket, e.g. one end of a
    /// socket pair.
    pub fn open(&self, socket: Socket) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let io = &self.kind().io;
        if !matches!(&*io.native.borrow(), Native::Empty) {
            return Err(RelayError::InvalidState("pipe socket already in use"));
        }
        socket.set_nonblocking(true)?;
        io.set_raw(socket);
        Ok(())
    }

    /// Path this pipe is bound or connected to, if known. Diagnostic only.
    #[must_use]
    pub fn name(&self) -> Option<PathBuf> {
        self.kind().name.borrow().clone()
    }

    #[must_use]
    pub fn is_cross_process(&self) -> bool {
        self.kind().cross_process
    }
}
