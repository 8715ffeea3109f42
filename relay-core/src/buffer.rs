//! Buffer lifecycle for relay handles.
//!
//! - [`Buffer`]: caller-owned, move-only byte container. It moves into a
//!   write request, through the engine, and back out via `BufferRecycled`.
//! - [`ReadBuf`]: per-instance receive buffer. Each completed read is split
//!   off as an immutable `Bytes`; once handlers drop their chunk the
//!   allocation is reclaimed by the next read.
//! - [`PendingWrites`]: FIFO of in-flight write requests per handle.
//!
//! The compio `IoBuf` impls are the only unsafe code here.

#![allow(unsafe_code)]

use bytes::{Bytes, BytesMut};
use compio::buf::{IoBuf, IoBufMut, SetBufInit};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Move-only byte buffer submitted to write operations.
///
/// The engine borrows the unwritten tail (`[offset, len)`) while the write
/// is in flight; the buffer is rewound before being handed back.
pub struct Buffer {
    data: BytesMut,
    offset: usize,
}

impl Buffer {
    /// Empty buffer able to hold `capacity` bytes without reallocating.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            offset: 0,
        }
    }

    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            offset: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Replace the contents with `bytes`, growing if needed.
    pub fn assign(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.offset = 0;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
    }

    /// Freeze into immutable `Bytes`.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Bytes not yet written.
    #[inline]
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.offset + n <= self.data.len());
        self.offset = (self.offset + n).min(self.data.len());
    }

    pub(crate) fn rewind(&mut self) {
        self.offset = 0;
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(vec: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&vec[..]),
            offset: 0,
        }
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("offset", &self.offset)
            .finish()
    }
}

// SAFETY: Buffer exposes the initialized, unwritten tail of its BytesMut:
// - the pointer stays valid while the buffer is owned by the operation
// - [ptr, ptr + buf_len) is initialized
// - nothing else can touch the storage while the engine holds the buffer
unsafe impl IoBuf for Buffer {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.remaining().as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.data.len() - self.offset
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.data.capacity() - self.offset
    }
}

/// Per-instance read buffer.
///
/// Always cleared before a read is submitted, so the engine fills it from
/// the start and reports the filled length through `set_buf_init`.
pub(crate) struct ReadBuf {
    inner: BytesMut,
    size: usize,
}

impl ReadBuf {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(size),
            size,
        }
    }

    /// Ready the buffer for the next read. Reuses the allocation when every
    /// previously delivered chunk has been dropped.
    pub(crate) fn prepare(&mut self) {
        self.inner.clear();
        self.inner.reserve(self.size);
    }

    /// Split off the first `n` filled bytes.
    pub(crate) fn take_chunk(&mut self, n: usize) -> Bytes {
        let n = n.min(self.inner.len());
        self.inner.split_to(n).freeze()
    }
}

// SAFETY: same invariants as SlabMut: the region is exclusively owned for
// the duration of the operation and only [0, len) is reported initialized.
unsafe impl IoBuf for ReadBuf {
    #[inline]
    fn as_buf_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    #[inline]
    fn buf_len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    fn buf_capacity(&self) -> usize {
        self.inner.capacity()
    }
}

// SAFETY: [ptr, ptr + capacity) is writable and owned by this buffer.
unsafe impl IoBufMut for ReadBuf {
    #[inline]
    fn as_buf_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }
}

impl SetBufInit for ReadBuf {
    #[inline]
    unsafe fn set_buf_init(&mut self, len: usize) {
        debug_assert!(len <= self.inner.capacity());
        if len > self.inner.len() {
            self.inner.set_len(len);
        }
    }
}

/// One queued write request.
pub(crate) struct PendingWrite {
    buffer: Option<Buffer>,
    descriptor: Option<OwnedFd>,
    target: Option<SocketAddr>,
    outcome: Option<io::Result<()>>,
}

/// What the writer must perform for the head entry.
pub(crate) enum Submission {
    Data {
        buffer: Buffer,
        target: Option<SocketAddr>,
    },
    /// One marker byte carrying `fd` as ancillary data.
    Descriptor { marker: u8, fd: RawFd },
}

impl PendingWrite {
    pub(crate) fn data(buffer: Buffer) -> Self {
        Self {
            buffer: Some(buffer),
            descriptor: None,
            target: None,
            outcome: None,
        }
    }

    pub(crate) fn datagram(buffer: Buffer, target: SocketAddr) -> Self {
        Self {
            target: Some(target),
            ..Self::data(buffer)
        }
    }

    pub(crate) fn descriptor(marker: Buffer, fd: OwnedFd) -> Self {
        Self {
            descriptor: Some(fd),
            ..Self::data(marker)
        }
    }

    pub(crate) fn buffer_mut(&mut self) -> Option<&mut Buffer> {
        self.buffer.as_mut()
    }

    pub(crate) fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    pub(crate) fn descriptor_fd(&self) -> Option<RawFd> {
        self.descriptor.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn complete(&mut self, outcome: io::Result<()>) {
        self.outcome = Some(outcome);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    /// Buffer (rewound) and outcome. A missing outcome means the request
    /// was torn down before it finished.
    pub(crate) fn into_parts(self) -> (Option<Buffer>, Option<io::Result<()>>) {
        let buffer = self.buffer.map(|mut b| {
            b.rewind();
            b
        });
        (buffer, self.outcome)
    }
}

/// FIFO of write requests. Completions are always taken from the head.
#[derive(Default)]
pub(crate) struct PendingWrites {
    entries: RefCell<VecDeque<PendingWrite>>,
}

impl PendingWrites {
    /// Queue at the tail. Returns true if the queue was empty.
    pub(crate) fn push(&self, entry: PendingWrite) -> bool {
        let mut entries = self.entries.borrow_mut();
        let was_empty = entries.is_empty();
        entries.push_back(entry);
        was_empty
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Pop the head if it already has an outcome.
    pub(crate) fn pop_finished(&self) -> Option<PendingWrite> {
        let mut entries = self.entries.borrow_mut();
        if entries.front().is_some_and(PendingWrite::is_complete) {
            entries.pop_front()
        } else {
            None
        }
    }

    /// Hand the head's work to the writer. Data buffers leave the queue
    /// until `finish_head` puts them back.
    pub(crate) fn start_head(&self) -> Option<Submission> {
        let mut entries = self.entries.borrow_mut();
        let head = entries.front_mut()?;
        if head.is_complete() {
            return None;
        }
        if let Some(fd) = head.descriptor_fd() {
            let marker = head.buffer.as_ref().and_then(|b| b.as_slice().first().copied());
            return Some(Submission::Descriptor {
                marker: marker.unwrap_or(0),
                fd,
            });
        }
        let buffer = head.buffer.take()?;
        Some(Submission::Data {
            buffer,
            target: head.target,
        })
    }

    /// Record the outcome of the head's submission.
    pub(crate) fn finish_head(&self, outcome: io::Result<()>, buffer: Option<Buffer>) {
        let mut entries = self.entries.borrow_mut();
        if let Some(head) = entries.front_mut() {
            if let Some(buffer) = buffer {
                head.buffer = Some(buffer);
            }
            head.complete(outcome);
        }
    }

    /// Remove every entry for forced teardown, in submission order.
    pub(crate) fn drain(&self) -> Vec<PendingWrite> {
        self.entries.borrow_mut().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_assign_and_capacity() {
        let mut buf = Buffer::with_capacity(32);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 32);

        buf.assign(b"greet");
        assert_eq!(buf.as_slice(), b"greet");
        assert_eq!(buf.len(), 5);

        buf.assign(b"a longer message than before");
        assert_eq!(buf.len(), 28);
    }

    #[test]
    fn test_buffer_advance_exposes_tail() {
        let mut buf = Buffer::from_slice(b"hello");
        buf.advance(2);
        assert_eq!(buf.remaining(), b"llo");
        assert_eq!(buf.buf_len(), 3);
        buf.rewind();
        assert_eq!(buf.buf_len(), 5);
    }

    #[test]
    fn test_read_buf_reclaims_after_chunk_dropped() {
        let mut rb = ReadBuf::new(64);
        rb.prepare();
        unsafe {
            std::ptr::copy_nonoverlapping(b"abc".as_ptr(), rb.as_buf_mut_ptr(), 3);
            rb.set_buf_init(3);
        }
        let chunk = rb.take_chunk(3);
        assert_eq!(&chunk[..], b"abc");
        drop(chunk);

        rb.prepare();
        assert_eq!(rb.buf_len(), 0);
        assert!(rb.buf_capacity() >= 64);
    }

    #[test]
    fn test_pending_writes_fifo() {
        let queue = PendingWrites::default();
        assert!(queue.push(PendingWrite::data(Buffer::from_slice(b"1"))));
        assert!(!queue.push(PendingWrite::data(Buffer::from_slice(b"2"))));
        assert_eq!(queue.len(), 2);

        // head not finished yet
        assert!(queue.pop_finished().is_none());

        let Some(Submission::Data { buffer, target }) = queue.start_head() else {
            panic!("expected a data submission");
        };
        assert!(target.is_none());
        assert_eq!(buffer.as_slice(), b"1");
        // head is in flight: nothing else to start
        assert!(queue.start_head().is_none());

        queue.finish_head(Ok(()), Some(buffer));
        let done = queue.pop_finished().unwrap();
        let (buf, outcome) = done.into_parts();
        assert_eq!(buf.unwrap().as_slice(), b"1");
        assert!(outcome.unwrap().is_ok());

        let rest = queue.drain();
        assert_eq!(rest.len(), 1);
        let (buf, outcome) = rest.into_iter().next().unwrap().into_parts();
        assert_eq!(buf.unwrap().as_slice(), b"2");
        assert!(outcome.is_none());
        assert!(queue.is_empty());
    }
}
