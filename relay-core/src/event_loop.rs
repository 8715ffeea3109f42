//! Single-threaded event loop.
//!
//! A [`Loop`] wraps one compio runtime and adds what handles need on top of
//! it:
//! - a deferred queue for work that must run on the loop but not inside the
//!   current call (close notifications, completion reports),
//! - an alive count: `run()` returns once no handle has an operation
//!   pending and the deferred queue is empty,
//! - a pin registry that keeps shared handles alive until an event fires,
//! - a handle registry for [`Loop::close_all`],
//! - a cross-thread job queue reachable through [`LoopHandle`].
//!
//! Everything except `LoopHandle` is `!Send`: a loop and its handles live
//! and die on one thread.

use crate::error::{RelayError, Result};
use crate::event::EventCatalogue;
use crate::options::LoopOptions;
use compio::runtime::{Runtime, Task};
use futures::Stream;
use hashbrown::HashMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace, warn};

type Job = Box<dyn FnOnce()>;

/// Job submitted to a loop from another thread.
pub type RemoteJob = Box<dyn FnOnce(&Loop) + Send>;

type RemoteJobs = Pin<Box<flume::r#async::RecvStream<'static, RemoteJob>>>;

/// A live handle as seen by `close_all`.
pub(crate) trait LiveHandle {
    fn close_from_loop(self: Rc<Self>);
}

struct LoopInner {
    options: LoopOptions,
    deferred: RefCell<VecDeque<Job>>,
    waker: RefCell<Option<Waker>>,
    active: Cell<usize>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    next_id: Cell<u64>,
    pins: RefCell<HashMap<u64, Rc<dyn Any>>>,
    handles: RefCell<HashMap<u64, Weak<dyn LiveHandle>>>,
    remote_tx: flume::Sender<RemoteJob>,
    remote_rx: RefCell<RemoteJobs>,
    // dropped last: tasks may still reference the queues above
    runtime: Runtime,
}

impl LoopInner {
    fn wake(&self) {
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Single-threaded run-to-completion context.
///
/// Cloning is cheap; all clones refer to the same loop.
#[derive(Clone)]
pub struct Loop {
    inner: Rc<LoopInner>,
}

impl Loop {
    /// Create a loop with default options.
    pub fn new() -> Result<Self> {
        Self::with_options(LoopOptions::default())
    }

    pub fn with_options(options: LoopOptions) -> Result<Self> {
        let runtime = Runtime::new().map_err(RelayError::Io)?;
        let (remote_tx, remote_rx) = flume::unbounded::<RemoteJob>();
        Ok(Self {
            inner: Rc::new(LoopInner {
                options,
                deferred: RefCell::new(VecDeque::new()),
                waker: RefCell::new(None),
                active: Cell::new(0),
                running: Cell::new(false),
                stop_requested: Cell::new(false),
                next_id: Cell::new(1),
                pins: RefCell::new(HashMap::new()),
                handles: RefCell::new(HashMap::new()),
                remote_tx,
                remote_rx: RefCell::new(Box::pin(remote_rx.into_stream())),
                runtime,
            }),
        })
    }

    #[must_use]
    pub fn options(&self) -> &LoopOptions {
        &self.inner.options
    }

    pub(crate) fn catalogue(&self) -> &'static EventCatalogue {
        self.inner.options.catalogue
    }

    /// Run until nothing keeps the loop alive or `stop()` is called.
    ///
    /// Calling `run` from inside a handler is ignored.
    pub fn run(&self) {
        if self.inner.running.replace(true) {
            warn!("[Loop] run() called while already running");
            return;
        }
        self.inner.stop_requested.set(false);
        debug!(active = self.inner.active.get(), "[Loop] running");

        let lp = self.clone();
        self.inner.runtime.block_on(poll_fn(move |cx| lp.drive(cx)));

        self.inner.running.set(false);
        debug!(active = self.inner.active.get(), "[Loop] run returned");
    }

    /// Make `run()` return after the current iteration.
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
        self.inner.wake();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Number of pending operations keeping the loop alive.
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.inner.active.get()
    }

    /// Sendable handle for submitting work to this loop from other threads.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.inner.remote_tx.clone(),
        }
    }

    /// Close every live handle created against this loop.
    pub fn close_all(&self) {
        let live: Vec<Rc<dyn LiveHandle>> = self
            .inner
            .handles
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        debug!(count = live.len(), "[Loop] closing all handles");
        for handle in live {
            handle.close_from_loop();
        }
    }

    fn drive(&self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            let mut progressed = false;

            loop {
                let next = self.inner.remote_rx.borrow_mut().as_mut().poll_next(cx);
                let Poll::Ready(Some(job)) = next else { break };
                trace!("[Loop] running remote job");
                job(self);
                progressed = true;
            }

            loop {
                let job = self.inner.deferred.borrow_mut().pop_front();
                let Some(job) = job else { break };
                job();
                progressed = true;
            }

            if self.inner.stop_requested.get() {
                return Poll::Ready(());
            }
            if !progressed {
                break;
            }
        }

        if self.inner.active.get() == 0 {
            return Poll::Ready(());
        }
        *self.inner.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Run `job` on the loop after the current call stack unwinds.
    pub(crate) fn defer(&self, job: impl FnOnce() + 'static) {
        self.inner.deferred.borrow_mut().push_back(Box::new(job));
        self.inner.wake();
    }

    /// Spawn an engine task on this loop's runtime. Dropping the returned
    /// task cancels it.
    pub(crate) fn spawn<F>(&self, future: F) -> Task<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.runtime.spawn(future)
    }

    /// Count one pending operation until the guard drops.
    pub(crate) fn keep_alive(&self) -> ActiveGuard {
        self.inner.active.set(self.inner.active.get() + 1);
        ActiveGuard {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    /// Hold `value` until `unpin` is called with the returned key.
    pub(crate) fn pin(&self, value: Rc<dyn Any>) -> u64 {
        let key = self.next_id();
        self.inner.pins.borrow_mut().insert(key, value);
        key
    }

    pub(crate) fn unpin(&self, key: u64) {
        // the value may be the last owner of a handle; drop it outside the borrow
        let released = self.inner.pins.borrow_mut().remove(&key);
        drop(released);
    }

    pub(crate) fn pinned_count(&self) -> usize {
        self.inner.pins.borrow().len()
    }

    pub(crate) fn register_handle(&self, id: u64, handle: Weak<dyn LiveHandle>) {
        self.inner.handles.borrow_mut().insert(id, handle);
    }

    pub(crate) fn forget_handle(&self, id: u64) {
        let removed = self.inner.handles.borrow_mut().remove(&id);
        drop(removed);
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("running", &self.inner.running.get())
            .field("active", &self.inner.active.get())
            .field("handles", &self.inner.handles.borrow().len())
            .finish()
    }
}

/// Keeps its loop's `run()` from returning while alive.
pub(crate) struct ActiveGuard {
    inner: Weak<LoopInner>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.active.set(inner.active.get().saturating_sub(1));
            inner.wake();
        }
    }
}

/// Forget a task that is finishing on its own.
pub(crate) fn detach_task(slot: &RefCell<Option<Task<()>>>) {
    let task = slot.borrow_mut().take();
    if let Some(task) = task {
        task.detach();
    }
}

/// Cancel a task. The future is dropped outside the borrow.
pub(crate) fn cancel_task(slot: &RefCell<Option<Task<()>>>) {
    let task = slot.borrow_mut().take();
    drop(task);
}

/// Sendable reference to a loop's job queue.
///
/// Handles are `!Send`; to act on another loop's handles, submit a closure
/// that runs on that loop's thread.
#[derive(Clone)]
pub struct LoopHandle {
    tx: flume::Sender<RemoteJob>,
}

impl LoopHandle {
    /// Queue `job` to run on the target loop.
    ///
    /// Fails with [`RelayError::LoopGone`] once the loop has been dropped.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&Loop) + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .map_err(|_| RelayError::LoopGone)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_without_work_returns() {
        let lp = Loop::new().unwrap();
        lp.run();
        assert!(!lp.is_running());
        assert_eq!(lp.alive_count(), 0);
    }

    #[test]
    fn test_deferred_jobs_run_in_order() {
        let lp = Loop::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        let inner_lp = lp.clone();
        lp.defer(move || {
            l.borrow_mut().push(1);
            let l = l.clone();
            inner_lp.defer(move || l.borrow_mut().push(3));
        });
        let l = log.clone();
        lp.defer(move || l.borrow_mut().push(2));

        lp.run();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_guard_keeps_loop_alive() {
        let lp = Loop::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let guard = lp.keep_alive();
        let f = fired.clone();
        let task = lp.spawn(async move {
            compio::time::sleep(Duration::from_millis(20)).await;
            f.set(true);
            drop(guard);
        });

        lp.run();
        assert!(fired.get());
        assert_eq!(lp.alive_count(), 0);
        drop(task);
    }

    #[test]
    fn test_stop_from_other_thread() {
        let lp = Loop::new().unwrap();
        let guard = lp.keep_alive();
        let handle = lp.handle();

        let remote = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.submit(|lp| lp.stop()).unwrap();
        });

        lp.run();
        remote.join().unwrap();
        assert_eq!(lp.alive_count(), 1);
        drop(guard);
        assert_eq!(lp.alive_count(), 0);
    }

    #[test]
    fn test_submit_after_drop_fails() {
        let lp = Loop::new().unwrap();
        let handle = lp.handle();
        drop(lp);
        assert!(matches!(handle.submit(|_| {}), Err(RelayError::LoopGone)));
    }

    #[test]
    fn test_pin_releases_value() {
        let lp = Loop::new().unwrap();
        let value = Rc::new(5_u32);
        let key = lp.pin(value.clone());
        assert_eq!(Rc::strong_count(&value), 2);
        assert_eq!(lp.pinned_count(), 1);
        lp.unpin(key);
        assert_eq!(Rc::strong_count(&value), 1);
        assert_eq!(lp.pinned_count(), 0);
    }
}
