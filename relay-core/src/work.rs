//! Background jobs.
//!
//! [`Work::start`] hands a `Send` closure to a process-wide pool of OS
//! threads and publishes [`AfterWork`] back on the submitting loop when it
//! is done. The pool is created on first use, sized by the submitting
//! loop's `work_threads` option; later loops share it.

use crate::error::{RelayError, Result};
use crate::event::AfterWork;
use crate::event_loop::{cancel_task, detach_task};
use crate::resource::{Kind, Resource};
use compio::runtime::Task;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, trace};

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

enum Outcome {
    Done,
    Cancelled,
    Panicked(String),
}

struct Job {
    run: Box<dyn FnOnce() + Send>,
    state: Arc<AtomicU8>,
    done: flume::Sender<Outcome>,
}

static POOL: OnceCell<flume::Sender<Job>> = OnceCell::new();

fn pool(threads: usize) -> io::Result<&'static flume::Sender<Job>> {
    POOL.get_or_try_init(|| {
        let (tx, rx) = flume::unbounded::<Job>();
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("relay-work-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let _ = job.done.send(execute(job.run, &job.state));
                    }
                })?;
        }
        debug!(threads, "[Work] pool started");
        Ok(tx)
    })
}

fn execute(run: Box<dyn FnOnce() + Send>, state: &AtomicU8) -> Outcome {
    if state
        .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Outcome::Cancelled;
    }
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(()) => Outcome::Done,
        Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

/// Work request state.
#[derive(Default)]
pub struct WorkKind {
    state: RefCell<Option<Arc<AtomicU8>>>,
    waiter: RefCell<Option<Task<()>>>,
}

/// A background job request. Requests have no close; dropping one cancels
/// its job if it has not started and discards its result.
pub type Work = Resource<WorkKind>;

impl Kind for WorkKind {
    const NAME: &'static str = "Work";

    fn release(res: &Resource<Self>) {
        let kind = res.kind();
        if let Some(state) = kind.state.borrow_mut().take() {
            let _ = state.compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
        }
        cancel_task(&kind.waiter);
    }
}

impl Resource<WorkKind> {
    /// Run `job` on the pool. `AfterWork` follows on this loop; a job that
    /// panics reports `Error` instead.
    pub fn start<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let kind = self.kind();
        if kind.waiter.borrow().is_some() {
            return Err(RelayError::InvalidState("work already queued"));
        }
        let pool = pool(self.event_loop().options().work_threads)?;

        let state = Arc::new(AtomicU8::new(QUEUED));
        let (done_tx, done_rx) = flume::bounded(1);
        pool.send(Job {
            run: Box::new(job),
            state: Arc::clone(&state),
            done: done_tx,
        })
        .map_err(|_| RelayError::Io(io::Error::other("work pool is gone")))?;
        *kind.state.borrow_mut() = Some(state);

        let weak = self.downgrade();
        let guard = self.event_loop().keep_alive();
        let task = self.event_loop().spawn(async move {
            let _guard = guard;
            let outcome = done_rx.recv_async().await;
            let Some(res) = weak.upgrade() else { return };
            detach_task(&res.kind().waiter);
            res.kind().state.borrow_mut().take();
            match outcome {
                Ok(Outcome::Done) => res.publish(&AfterWork { cancelled: false }),
                Ok(Outcome::Cancelled) => {
                    trace!(id = res.id(), "[Work] skipped after cancel");
                    res.publish(&AfterWork { cancelled: true });
                }
                Ok(Outcome::Panicked(message)) => {
                    error!(id = res.id(), %message, "[Work] job panicked");
                    res.report_error("work", &io::Error::other(message));
                }
                Err(_) => {
                    error!(id = res.id(), "[Work] pool dropped the job");
                    res.report_error("work", &io::Error::other("work pool dropped the job"));
                }
            }
        });
        *kind.waiter.borrow_mut() = Some(task);
        Ok(())
    }

    /// Skip the job if no pool thread has picked it up yet. Returns false
    /// when it is already running or finished.
    pub fn cancel(&self) -> bool {
        self.kind().state.borrow().as_ref().is_some_and(|state| {
            state
                .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.kind().waiter.borrow().is_some()
    }
}
