//! Raw socket helpers.
//!
//! Synchronous, non-blocking calls the engine has no operation for:
//! immediate sends, `SCM_RIGHTS` ancillary data and readiness polling.
//!
//! # Safety
//!
//! Callers pass descriptors they keep open for the duration of the call.
//! Every function here borrows the descriptor; none of them closes it.

#![allow(unsafe_code)]

use smallvec::SmallVec;
use socket2::{SockAddr, SockRef, Socket};
use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::fd::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;
use tracing::warn;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// Descriptors received in one message.
pub(crate) type ReceivedFds = SmallVec<[OwnedFd; 4]>;

/// Run `f` against a borrowed view of `fd`.
pub(crate) fn with_sock<R>(fd: RawFd, f: impl FnOnce(SockRef<'_>) -> R) -> R {
    // SAFETY: the caller keeps `fd` open until we return
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    f(SockRef::from(&borrowed))
}

/// Hand ownership of `socket` to an engine socket type.
pub(crate) fn adopt<T: FromRawFd>(socket: Socket) -> io::Result<T> {
    socket.set_nonblocking(true)?;
    let fd = socket.into_raw_fd();
    // SAFETY: `fd` was just released by `socket`; `T` becomes its only owner
    Ok(unsafe { T::from_raw_fd(fd) })
}

/// Immediate send; `WouldBlock` instead of waiting.
pub(crate) fn send_nonblocking(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    with_sock(fd, |sock| sock.send_with_flags(data, SEND_FLAGS))
}

pub(crate) fn send_to_nonblocking(fd: RawFd, data: &[u8], target: &SockAddr) -> io::Result<usize> {
    with_sock(fd, |sock| sock.send_to_with_flags(data, target, SEND_FLAGS))
}

pub(crate) fn shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    with_sock(fd, |sock| sock.shutdown(how))
}

/// Raw integer `setsockopt`.
pub(crate) fn set_int_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: `value` outlives the call and its size is passed along
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            ptr::addr_of!(value).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Control buffer with `cmsghdr` alignment.
fn control_buffer(fd_count: usize) -> (Vec<u64>, usize) {
    let payload = (fd_count * mem::size_of::<RawFd>()) as libc::c_uint;
    // SAFETY: pure size computation
    let space = unsafe { libc::CMSG_SPACE(payload) } as usize;
    (vec![0_u64; space.div_ceil(mem::size_of::<u64>())], space)
}

/// Send one `marker` byte carrying `passed` as `SCM_RIGHTS` ancillary data.
pub(crate) fn send_with_descriptor(fd: RawFd, marker: u8, passed: RawFd) -> io::Result<usize> {
    let mut payload = [marker];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let (mut control, space) = control_buffer(1);

    // SAFETY: msghdr is plain data; every pointer in it refers to a local
    // that outlives the sendmsg call, and the control buffer holds exactly
    // one cmsghdr sized for one descriptor.
    let sent = unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), passed);

        libc::sendmsg(fd, &msg, SEND_FLAGS)
    };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

/// Non-blocking receive that also collects up to `max_fds` passed
/// descriptors. Returns the byte count and the descriptors, now owned.
pub(crate) fn recv_with_descriptors(
    fd: RawFd,
    buf: &mut [u8],
    max_fds: usize,
) -> io::Result<(usize, ReceivedFds)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let (mut control, space) = control_buffer(max_fds.max(1));
    let mut fds = ReceivedFds::new();

    // SAFETY: as in send_with_descriptor; cmsg traversal stays within
    // msg_controllen as reported back by the kernel, and each received
    // descriptor is owned by us exactly once.
    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let received = libc::recvmsg(fd, &mut msg, RECV_FLAGS);
        if received < 0 {
            return Err(io::Error::last_os_error());
        }

        let header = libc::CMSG_LEN(0) as usize;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(header) / mem::size_of::<RawFd>();
                for i in 0..count {
                    let raw = ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            warn!(fd, kept = fds.len(), "[Sys] ancillary data truncated, extra descriptors dropped");
        }
        Ok((received as usize, fds))
    }
}

/// Block up to `timeout` until `fd` is readable. Hang-up and error
/// conditions count as readable.
pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    poll_one(fd, libc::POLLIN, timeout)
}

/// Block up to `timeout` until `fd` can take more data.
pub(crate) fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    poll_one(fd, libc::POLLOUT, timeout)
}

fn poll_one(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: one valid pollfd
    let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ready > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_descriptor_round_trip() {
        let (left, right) = UnixStream::pair().unwrap();
        let (carried, mut other_end) = UnixStream::pair().unwrap();

        let sent = send_with_descriptor(left.as_raw_fd(), b'x', carried.as_raw_fd()).unwrap();
        assert_eq!(sent, 1);

        let mut buf = [0_u8; 8];
        let (n, fds) = recv_with_descriptors(right.as_raw_fd(), &mut buf, 4).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'x');
        assert_eq!(fds.len(), 1);

        // the received descriptor is the same socket
        let mut received = UnixStream::from(fds.into_iter().next().unwrap());
        received.write_all(b"ok").unwrap();
        let mut out = [0_u8; 2];
        other_end.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ok");
        drop(carried);
    }

    #[test]
    fn test_recv_would_block_when_empty() {
        let (left, _right) = UnixStream::pair().unwrap();
        let mut buf = [0_u8; 8];
        let err = recv_with_descriptors(left.as_raw_fd(), &mut buf, 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_wait_readable() {
        let (mut left, right) = UnixStream::pair().unwrap();
        assert!(!wait_readable(right.as_raw_fd(), Duration::from_millis(10)).unwrap());
        left.write_all(b"a").unwrap();
        assert!(wait_readable(right.as_raw_fd(), Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_send_nonblocking() {
        let (left, mut right) = UnixStream::pair().unwrap();
        assert_eq!(send_nonblocking(left.as_raw_fd(), b"abc").unwrap(), 3);
        let mut out = [0_u8; 3];
        right.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"abc");
    }
}
