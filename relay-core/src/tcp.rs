//! TCP stream handles.
//!
//! A [`Tcp`] starts without a socket unless created with
//! [`TcpKind::with_domain`]; `bind` creates one on demand. Listening
//! sockets stay plain `socket2` sockets until the acceptor task hands them
//! to the engine, which is what lets a listening socket travel to another
//! loop through a descriptor handoff.

use crate::error::{RelayError, Result};
use crate::event::Transport;
use crate::resource::{HandleKind, Kind, Resource};
use crate::stream::{self, Native, Sealed, StreamIo, StreamKind};
use crate::sys;
use compio::buf::{BufResult, IoBuf, IoBufMut};
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// TCP stream state.
pub struct TcpKind {
    io: StreamIo<TcpKind>,
    domain: Option<Domain>,
    peer: Cell<Option<SocketAddr>>,
}

/// A TCP stream handle.
pub type Tcp = Resource<TcpKind>;

impl Default for TcpKind {
    fn default() -> Self {
        Self {
            io: StreamIo::default(),
            domain: None,
            peer: Cell::new(None),
        }
    }
}

impl TcpKind {
    /// Create the socket up front for `domain`, so options can be set
    /// before `bind`.
    #[must_use]
    pub fn with_domain(domain: Domain) -> Self {
        Self {
            domain: Some(domain),
            ..Self::default()
        }
    }
}

fn new_socket(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl Kind for TcpKind {
    const NAME: &'static str = "Tcp";

    fn init(res: &Resource<Self>) -> Result<()> {
        if let Some(domain) = res.kind().domain {
            res.kind().io.set_raw(new_socket(domain)?);
        }
        res.register_handle();
        Ok(())
    }

    fn release(res: &Resource<Self>) {
        stream::release(res);
    }

    fn holds_buffers(res: &Resource<Self>) -> bool {
        stream::holds_buffers(res)
    }
}

impl HandleKind for TcpKind {
    fn begin_close(res: &Resource<Self>) {
        stream::begin_close(res);
    }
}

impl Sealed for TcpKind {}

impl StreamKind for TcpKind {
    type Conn = TcpStream;
    type Listener = TcpListener;
    const TRANSPORT: Transport = Transport::Tcp;

    fn io(&self) -> &StreamIo<Self> {
        &self.io
    }

    fn accepted(_listener: &Resource<Self>) -> Self {
        Self::default()
    }

    fn wrap_conn(socket: Socket) -> io::Result<TcpStream> {
        sys::adopt(socket)
    }

    fn wrap_listener(socket: Socket) -> io::Result<TcpListener> {
        sys::adopt(socket)
    }

    async fn accept(listener: &TcpListener) -> io::Result<TcpStream> {
        let (stream, _addr) = listener.accept().await?;
        Ok(stream)
    }

    async fn read<B: IoBufMut>(conn: &TcpStream, buf: B) -> BufResult<usize, B> {
        let mut stream = conn;
        AsyncRead::read(&mut stream, buf).await
    }

    async fn write_all<B: IoBuf>(conn: &TcpStream, buf: B) -> BufResult<(), B> {
        let mut stream = conn;
        stream.write_all(buf).await
    }

    fn resolve_peer(res: &Resource<Self>) -> io::Result<()> {
        let fd = res
            .kind()
            .io
            .raw_fd()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        // a listening socket has no peer; its bound address stands in
        let addr = sys::with_sock(fd, |sock| sock.peer_addr().or_else(|_| sock.local_addr()))?;
        res.kind().peer.set(addr.as_socket());
        Ok(())
    }
}

impl Resource<TcpKind> {
    fn with_socket<R>(&self, f: impl FnOnce(SockRef<'_>) -> io::Result<R>) -> Result<R> {
        let fd = self
            .kind()
            .io
            .raw_fd()
            .ok_or(RelayError::InvalidState("tcp socket not created yet"))?;
        sys::with_sock(fd, f).map_err(RelayError::from)
    }

    /// Bind to `addr`, creating the socket if needed. `SO_REUSEADDR` is
    /// set before binding.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let io = &self.kind().io;
        let mut native = io.native.borrow_mut();
        let fresh = match &*native {
            Native::Raw(_) => None,
            Native::Empty => Some(new_socket(Domain::for_address(addr))?),
            _ => return Err(RelayError::InvalidState("tcp socket already in use")),
        };
        if let Some(socket) = fresh {
            *native = Native::Raw(socket);
        }
        let Native::Raw(socket) = &*native else {
            return Err(RelayError::InvalidState("tcp socket already in use"));
        };

        socket.set_reuse_address(true)?;
        if let Err(err) = socket.bind(&addr.into()) {
            warn!(id = self.id(), %addr, error = %err, "[Tcp] bind failed");
            return Err(err.into());
        }
        let bound = socket.local_addr().ok().and_then(|a| a.as_socket()).unwrap_or(addr);
        info!(id = self.id(), addr = %bound, "[Tcp] bound");
        Ok(())
    }

    /// Parse and bind, e.g. `"127.0.0.1:0"`.
    pub fn bind_str(&self, addr: &str) -> Result<()> {
        let parsed: SocketAddr = addr
            .parse()
            .map_err(|_| RelayError::invalid_address(addr))?;
        self.bind(parsed)
    }

    /// Adopt an existing socket, connected or listening-ready.
    pub fn open(&self, socket: Socket) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let io = &self.kind().io;
        if !matches!(&*io.native.borrow(), Native::Empty | Native::Raw(_)) {
            return Err(RelayError::InvalidState("tcp socket already in use"));
        }
        socket.set_nonblocking(true)?;
        io.set_raw(socket);
        Ok(())
    }

    /// Connect to `addr`; `Connect` or `Error` follows.
    ///
    /// The connection uses a fresh socket; an unbound socket created by
    /// `with_domain` is discarded.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        {
            let io = &self.kind().io;
            let mut native = io.native.borrow_mut();
            if let Native::Raw(socket) = &*native {
                let bound = socket
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_socket())
                    .is_some_and(|a| a.port() != 0);
                if bound {
                    return Err(RelayError::InvalidState("connect on a bound tcp socket"));
                }
                *native = Native::Empty;
            }
        }
        debug!(id = self.id(), %addr, "[Tcp] connecting");
        stream::start_connect(self, TcpStream::connect(addr))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self.with_socket(|sock| sock.local_addr())?;
        addr.as_socket()
            .ok_or_else(|| RelayError::invalid_address("not an inet socket"))
    }

    /// Remote address recorded at connect or accept time. For a socket
    /// with no peer this is its own bound address. Diagnostic only.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.kind().peer.get()
    }

    /// Enable or disable Nagle's algorithm.
    pub fn set_nodelay(&self, enable: bool) -> Result<()> {
        self.with_socket(|sock| sock.set_nodelay(enable))
    }

    /// Toggle keepalive probes. Probes start after the loop's
    /// `keepalive_delay` of idle time.
    pub fn set_keepalive(&self, enable: bool) -> Result<()> {
        let delay = self.event_loop().options().keepalive_delay;
        self.with_socket(|sock| {
            if enable {
                sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(delay))
            } else {
                sock.set_keepalive(false)
            }
        })
    }

    pub fn set_reuse_address(&self, enable: bool) -> Result<()> {
        self.with_socket(|sock| sock.set_reuse_address(enable))
    }

    /// Raw integer `setsockopt`.
    pub fn set_socket_option(&self, level: i32, name: i32, value: i32) -> Result<()> {
        let fd = self
            .kind()
            .io
            .raw_fd()
            .ok_or(RelayError::InvalidState("tcp socket not created yet"))?;
        Ok(sys::set_int_option(fd, level, name, value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::event_loop::Loop;

    #[test]
    fn test_bind_assigns_port() {
        let lp = Loop::new().unwrap();
        let tcp = Tcp::create(&lp).unwrap();
        tcp.bind_str("127.0.0.1:0").unwrap();
        let addr = tcp.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bad_address_rejected() {
        let lp = Loop::new().unwrap();
        let tcp = Tcp::create(&lp).unwrap();
        assert!(matches!(
            tcp.bind_str("not-an-address"),
            Err(RelayError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_options_need_socket() {
        let lp = Loop::new().unwrap();
        let tcp = Tcp::create(&lp).unwrap();
        assert!(matches!(tcp.set_nodelay(true), Err(RelayError::InvalidState(_))));

        let eager = Tcp::create_with(&lp, TcpKind::with_domain(Domain::IPV4)).unwrap();
        eager.set_nodelay(true).unwrap();
        eager.set_keepalive(true).unwrap();
        eager
            .set_socket_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .unwrap();
        eager.bind_str("127.0.0.1:0").unwrap();
    }

    #[test]
    fn test_listen_requires_bind() {
        let lp = Loop::new().unwrap();
        let tcp = Tcp::create(&lp).unwrap();
        assert!(matches!(tcp.listen(16), Err(RelayError::InvalidState(_))));
        assert!(matches!(tcp.read_start(), Err(RelayError::InvalidState(_))));
    }

    #[test]
    fn test_write_after_close_is_rejected() {
        let lp = Loop::new().unwrap();
        let tcp = Tcp::create(&lp).unwrap();
        tcp.close();
        let rejected = tcp.write_async(Buffer::from_slice(b"late")).unwrap_err();
        assert!(matches!(rejected.reason, RelayError::Closed));
        assert_eq!(rejected.into_buffer().as_slice(), b"late");
        assert!(matches!(tcp.shutdown(), Err(RelayError::Closed)));
        lp.run();
    }

    #[test]
    fn test_failed_peer_setup_closes_peer_only() {
        use crate::event::{Accept, Close, Destroy};
        use std::rc::Rc;

        let lp = Loop::new().unwrap();
        let listener = Tcp::create(&lp).unwrap();
        listener.bind_str("127.0.0.1:0").unwrap();
        listener.listen_default().unwrap();
        let accepts = Rc::new(Cell::new(0));
        let a = accepts.clone();
        listener.on::<Accept<TcpKind>>(move |_, _| a.set(a.get() + 1));

        // no socket, so its address cannot be resolved
        let peer = Tcp::create(&lp).unwrap();
        let closes = Rc::new(Cell::new(0));
        let c = closes.clone();
        peer.on::<Close>(move |_, _| c.set(c.get() + 1));
        let destroyed = Rc::new(Cell::new(false));
        let d = destroyed.clone();
        peer.on::<Destroy>(move |_, peer| {
            d.set(true);
            // the listener's acceptor would keep the loop running
            peer.event_loop().stop();
        });

        stream::publish_accepted(&listener, peer);
        assert_eq!(accepts.get(), 0);
        lp.run();

        assert_eq!(closes.get(), 1);
        assert!(destroyed.get());
        assert_eq!(accepts.get(), 0);
        assert!(listener.is_valid());
        assert!(listener.kind().io().acceptor.borrow().is_some());
    }
}
