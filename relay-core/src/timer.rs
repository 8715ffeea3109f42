//! One-shot and repeating timers.

use crate::error::{RelayError, Result};
use crate::event::Timeout;
use crate::event_loop::{cancel_task, detach_task};
use crate::resource::{HandleKind, Kind, Resource};
use compio::runtime::Task;
use std::cell::{Cell, RefCell};
use std::time::Duration;
use tracing::trace;

/// Timer state.
#[derive(Default)]
pub struct TimerKind {
    task: RefCell<Option<Task<()>>>,
    repeat: Cell<Duration>,
}

/// A timer handle publishing [`Timeout`].
pub type Timer = Resource<TimerKind>;

impl Kind for TimerKind {
    const NAME: &'static str = "Timer";

    fn init(res: &Resource<Self>) -> Result<()> {
        res.register_handle();
        Ok(())
    }

    fn release(res: &Resource<Self>) {
        cancel_task(&res.kind().task);
    }
}

impl HandleKind for TimerKind {
    fn begin_close(res: &Resource<Self>) {
        cancel_task(&res.kind().task);
        res.finish_close_deferred();
    }
}

impl Resource<TimerKind> {
    /// Fire after `timeout`, then every `repeat` unless it is zero.
    /// Restarting replaces the previous schedule.
    pub fn start(&self, timeout: Duration, repeat: Duration) -> Result<()> {
        if !self.is_valid() {
            return Err(RelayError::Closed);
        }
        let kind = self.kind();
        cancel_task(&kind.task);
        kind.repeat.set(repeat);

        let weak = self.downgrade();
        let guard = self.event_loop().keep_alive();
        let task = self.event_loop().spawn(async move {
            let _guard = guard;
            let mut wait = timeout;
            loop {
                compio::time::sleep(wait).await;
                let Some(res) = weak.upgrade() else { return };
                let repeat = res.kind().repeat.get();
                if repeat.is_zero() {
                    detach_task(&res.kind().task);
                    res.publish(&Timeout);
                    return;
                }
                res.publish(&Timeout);
                if res.is_closing() {
                    return;
                }
                wait = repeat;
            }
        });
        *kind.task.borrow_mut() = Some(task);
        trace!(id = self.id(), ?timeout, ?repeat, "[Timer] started");
        Ok(())
    }

    /// Cancel the schedule. No `Timeout` fires afterwards.
    pub fn stop(&self) {
        cancel_task(&self.kind().task);
    }

    /// Change the interval used after the next expiry.
    pub fn set_repeat(&self, repeat: Duration) {
        self.kind().repeat.set(repeat);
    }

    #[must_use]
    pub fn repeat(&self) -> Duration {
        self.kind().repeat.get()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.kind().task.borrow().is_some()
    }
}
