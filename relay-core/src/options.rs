//! Loop configuration options
//!
//! Every handle created against a loop reads its sizes and tunables from
//! the loop's [`LoopOptions`].

use crate::event::EventCatalogue;
use std::time::Duration;

/// Loop configuration options.
///
/// # Examples
///
/// ```
/// use relay_core::options::LoopOptions;
/// use std::time::Duration;
///
/// let opts = LoopOptions::default()
///     .with_read_buffer_size(16 * 1024)
///     .with_keepalive_delay(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Per-stream read buffer size (bytes)
    ///
    /// Each stream owns one buffer of this size; every `Read` event carries
    /// at most this many bytes.
    /// - Default: 4096
    pub read_buffer_size: usize,

    /// Per-socket datagram buffer size (bytes)
    ///
    /// Larger datagrams are truncated by the OS.
    /// - Default: 32768
    pub datagram_buffer_size: usize,

    /// Backlog used by `listen_default()`
    /// - Default: 128
    pub listen_backlog: i32,

    /// Idle time before TCP keepalive probes start
    /// - Default: 60 seconds
    pub keepalive_delay: Duration,

    /// Descriptors accepted per receive on a cross-process pipe
    ///
    /// Extra descriptors in one message are truncated by the OS.
    /// - Default: 4
    pub max_pending_handles: usize,

    /// Readiness poll slice for cross-process pipes
    ///
    /// Upper bound on how long a closed pipe's readiness wait keeps a
    /// blocking-pool thread and a descriptor copy.
    /// - Default: 50ms
    pub handoff_poll_interval: Duration,

    /// Threads in the background work pool
    ///
    /// The pool is process-wide and sized by the first loop that submits work.
    /// - Default: number of CPUs
    pub work_threads: usize,

    /// Event kind to dispatcher slot mapping
    /// - Default: [`EventCatalogue::standard`]
    pub catalogue: &'static EventCatalogue,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            datagram_buffer_size: 32 * 1024,
            listen_backlog: 128,
            keepalive_delay: Duration::from_secs(60),
            max_pending_handles: 4,
            handoff_poll_interval: Duration::from_millis(50),
            work_threads: num_cpus::get().max(1),
            catalogue: EventCatalogue::standard(),
        }
    }
}

impl LoopOptions {
    /// Create new loop options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-stream read buffer size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the datagram buffer size.
    #[must_use]
    pub fn with_datagram_buffer_size(mut self, size: usize) -> Self {
        self.datagram_buffer_size = size.max(1);
        self
    }

    /// Set the default listen backlog.
    #[must_use]
    pub const fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Set the TCP keepalive delay.
    #[must_use]
    pub const fn with_keepalive_delay(mut self, delay: Duration) -> Self {
        self.keepalive_delay = delay;
        self
    }

    /// Set how many descriptors one receive may carry.
    #[must_use]
    pub fn with_max_pending_handles(mut self, count: usize) -> Self {
        self.max_pending_handles = count.max(1);
        self
    }

    /// Set the cross-process pipe readiness poll slice.
    #[must_use]
    pub const fn with_handoff_poll_interval(mut self, interval: Duration) -> Self {
        self.handoff_poll_interval = interval;
        self
    }

    /// Set the background pool size.
    #[must_use]
    pub fn with_work_threads(mut self, threads: usize) -> Self {
        self.work_threads = threads.max(1);
        self
    }

    /// Use a custom event catalogue.
    #[must_use]
    pub const fn with_catalogue(mut self, catalogue: &'static EventCatalogue) -> Self {
        self.catalogue = catalogue;
        self
    }
}
