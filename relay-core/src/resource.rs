//! Resource and handle lifecycle.
//!
//! A [`Resource<K>`] binds one native object (described by its [`Kind`]) to
//! a dispatcher and a loop. Ownership is either exclusive (`Resource<K>`,
//! move-only) or shared (`Rc<Resource<K>>`).
//!
//! Lifecycle:
//! ```text
//! created -> initialized -> active -> closing -> closed -> destroyed
//!                                     (close)   (Close)   (Drop, Destroy)
//! ```
//! `Close` fires at most once, `Destroy` exactly once and always after the
//! native object has been released. Dropping a handle that was never closed
//! releases the native object without a `Close` event.
//!
//! Engine tasks never own a resource: they hold a [`WeakResource`] and
//! upgrade it for the duration of one completion.

#![allow(unsafe_code)]

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::event::{Close, Destroy, Error, Event, Ref};
use crate::event_loop::{LiveHandle, Loop};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// Behaviour of one native object type.
pub trait Kind: Sized + 'static {
    /// Component name used in log messages.
    const NAME: &'static str;

    /// Allocate the native object. A failure discards the resource.
    fn init(_res: &Resource<Self>) -> Result<()> {
        Ok(())
    }

    /// Release the native object. Called exactly once, on close or on drop.
    fn release(_res: &Resource<Self>) {}

    /// True while an engine operation still owns caller buffers. A close
    /// requested before the last owner drops then runs to completion.
    fn holds_buffers(_res: &Resource<Self>) -> bool {
        false
    }
}

/// A kind with a close operation.
pub trait HandleKind: Kind {
    /// Start tearing the native object down. Must eventually call
    /// `finish_close` on the loop, never synchronously.
    fn begin_close(res: &Resource<Self>) {
        res.finish_close_deferred();
    }
}

pub(crate) struct Core<K: Kind> {
    id: u64,
    lp: Loop,
    events: Dispatcher<Resource<K>>,
    closing: Cell<bool>,
    close_requested: Cell<bool>,
    closed: Cell<bool>,
    released: Cell<bool>,
    destroyed: Cell<bool>,
    // publishes running on this resource; teardown waits for them
    publishing: Cell<usize>,
    drop_pending: Cell<bool>,
    // pin key while a dropped handle waits for its close to finish
    linger: Cell<Option<u64>>,
    kind: K,
}

/// A native object bound to a loop and a dispatcher.
#[repr(transparent)]
pub struct Resource<K: Kind> {
    core: Rc<Core<K>>,
}

fn view<K: Kind>(core: &Rc<Core<K>>) -> &Resource<K> {
    // SAFETY: Resource<K> is repr(transparent) over Rc<Core<K>>, and the
    // returned reference borrows `core`.
    unsafe { &*(core as *const Rc<Core<K>>).cast::<Resource<K>>() }
}

impl<K: Kind> Resource<K> {
    /// Construct with an explicit kind value and run its init.
    pub fn create_with(lp: &Loop, kind: K) -> Result<Self> {
        let core = Rc::new(Core {
            id: lp.next_id(),
            lp: lp.clone(),
            events: Dispatcher::new(lp.catalogue()),
            closing: Cell::new(false),
            close_requested: Cell::new(false),
            closed: Cell::new(false),
            released: Cell::new(false),
            destroyed: Cell::new(false),
            publishing: Cell::new(0),
            drop_pending: Cell::new(false),
            linger: Cell::new(None),
            kind,
        });
        let res = Self { core };
        if let Err(err) = K::init(&res) {
            debug!(kind = K::NAME, error = %err, "[Resource] init failed");
            res.core.released.set(true);
            return Err(err);
        }
        trace!(id = res.id(), kind = K::NAME, "[Resource] created");
        Ok(res)
    }

    pub fn create_shared_with(lp: &Loop, kind: K) -> Result<Rc<Self>> {
        Self::create_with(lp, kind).map(Rc::new)
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    #[inline]
    #[must_use]
    pub fn event_loop(&self) -> &Loop {
        &self.core.lp
    }

    /// Register a handler that runs on every publish of `E`.
    pub fn on<E: Event>(&self, handler: impl FnMut(&E, &Self) + 'static) {
        self.core.events.on::<E, _>(handler);
    }

    /// Register a handler that runs on the next publish of `E` only.
    pub fn once<E: Event>(&self, handler: impl FnOnce(&E, &Self) + 'static) {
        self.core.events.once::<E, _>(handler);
    }

    /// Keep this shared resource alive until `E` fires once.
    pub fn ref_until<E: Event>(self: &Rc<Self>) {
        let lp = self.core.lp.clone();
        let key = lp.pin(Rc::clone(self) as Rc<dyn Any>);
        trace!(id = self.id(), kind = K::NAME, pin = key, "[Resource] pinned");
        self.once::<E>(move |_, _| lp.unpin(key));
    }

    /// Publish `Ref`, releasing any `ref_until::<Ref>()` pin.
    pub fn release_ref(&self) {
        self.publish(&Ref);
    }

    pub(crate) fn kind(&self) -> &K {
        &self.core.kind
    }

    pub(crate) fn downgrade(&self) -> WeakResource<K> {
        WeakResource(Rc::downgrade(&self.core))
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.core.closing.get()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.core.destroyed.get()
    }

    /// Run the handlers for `event`. Handlers may drop the last owner; the
    /// core stays alive until they return and is torn down afterwards.
    pub(crate) fn publish<E: Event>(&self, event: &E) {
        if self.core.destroyed.get() {
            return;
        }
        let keep = Rc::clone(&self.core);
        keep.publishing.set(keep.publishing.get() + 1);
        keep.events.publish(event, view(&keep));
        let depth = keep.publishing.get() - 1;
        keep.publishing.set(depth);
        if depth == 0 && keep.drop_pending.replace(false) {
            retire(&keep);
        }
    }

    /// Publish an asynchronous failure of `op`.
    pub(crate) fn report_error(&self, op: &'static str, err: &io::Error) {
        self.publish(&Error::from_io(op, err));
    }

    pub(crate) fn release_native(&self) {
        if !self.core.released.replace(true) {
            K::release(self);
        }
    }

    /// Release the native object and publish `Close`. Only the first call
    /// has an effect.
    pub(crate) fn finish_close(&self) {
        if self.core.closed.replace(true) {
            return;
        }
        self.release_native();
        self.core.lp.forget_handle(self.core.id);
        debug!(id = self.id(), kind = K::NAME, "[Resource] closed");
        self.publish(&Close);
        if let Some(key) = self.core.linger.take() {
            let keep = Rc::clone(&self.core);
            teardown(&keep);
            keep.lp.unpin(key);
        }
    }

    pub(crate) fn finish_close_deferred(&self) {
        let weak = self.downgrade();
        self.core.lp.defer(move || {
            if let Some(res) = weak.upgrade() {
                res.finish_close();
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn handler_count<E: Event>(&self) -> usize {
        self.core.events.handler_count::<E>()
    }
}

impl<K: Kind + Default> Resource<K> {
    pub fn create(lp: &Loop) -> Result<Self> {
        Self::create_with(lp, K::default())
    }

    pub fn create_shared(lp: &Loop) -> Result<Rc<Self>> {
        Self::create_shared_with(lp, K::default())
    }
}

impl<K: HandleKind> Resource<K> {
    /// Request teardown. `Close` fires once, later, on the loop; repeated
    /// calls are no-ops.
    pub fn close(&self) {
        if self.core.closing.replace(true) {
            trace!(id = self.id(), kind = K::NAME, "[Handle] already closing");
            return;
        }
        debug!(id = self.id(), kind = K::NAME, "[Handle] closing");
        self.core.close_requested.set(true);
        K::begin_close(self);
    }

    /// True until `close()` has been requested.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.core.closing.get()
    }

    /// Make the handle reachable from `Loop::close_all` and close it on the
    /// first asynchronous error. Called from each handle kind's init.
    pub(crate) fn register_handle(&self) {
        let weak: Weak<dyn LiveHandle> = Rc::downgrade(&self.core) as Weak<dyn LiveHandle>;
        self.core.lp.register_handle(self.core.id, weak);
        self.once::<Error>(|err, res| {
            debug!(id = res.id(), kind = K::NAME, error = %err, "[Handle] closing on error");
            res.close();
        });
    }
}

impl<K: HandleKind> LiveHandle for Core<K> {
    fn close_from_loop(self: Rc<Self>) {
        view(&self).close();
    }
}

impl<K: Kind> Drop for Resource<K> {
    fn drop(&mut self) {
        // nothing may be queued against a handle that is going away
        self.core.closing.set(true);
        if self.core.publishing.get() > 0 {
            // dropped from one of its own handlers
            self.core.drop_pending.set(true);
            return;
        }
        retire(&self.core);
    }
}

/// Tear down a resource whose last owner is gone, unless a requested close
/// still has buffers in the engine: then the loop keeps the core until
/// that close finishes.
fn retire<K: Kind>(core: &Rc<Core<K>>) {
    let res = view(core);
    if core.close_requested.get() && !core.closed.get() && K::holds_buffers(res) {
        trace!(id = core.id, kind = K::NAME, "[Resource] dropped while closing, lingering");
        let key = core.lp.pin(Rc::clone(core) as Rc<dyn Any>);
        core.linger.set(Some(key));
        return;
    }
    teardown(core);
}

/// Release the native object and publish `Destroy`. The pending-write
/// buffers still reach their `BufferRecycled` handlers.
fn teardown<K: Kind>(core: &Rc<Core<K>>) {
    if core.destroyed.get() {
        return;
    }
    let res = view(core);
    res.release_native();
    core.lp.forget_handle(core.id);
    trace!(id = core.id, kind = K::NAME, "[Resource] destroyed");
    core.events.publish(&Destroy, res);
    core.destroyed.set(true);
    core.events.clear();
}

impl<K: Kind> fmt::Debug for Resource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &K::NAME)
            .field("id", &self.core.id)
            .field("closing", &self.core.closing.get())
            .field("closed", &self.core.closed.get())
            .finish()
    }
}

/// Non-owning reference held by engine tasks.
pub(crate) struct WeakResource<K: Kind>(Weak<Core<K>>);

impl<K: Kind> Clone for WeakResource<K> {
    fn clone(&self) -> Self {
        Self(Weak::clone(&self.0))
    }
}

impl<K: Kind> WeakResource<K> {
    /// Borrow the resource for one completion. `None` once it is destroyed.
    pub(crate) fn upgrade(&self) -> Option<LiveRef<K>> {
        let core = self.0.upgrade()?;
        if core.destroyed.get() {
            return None;
        }
        Some(LiveRef(core))
    }
}

/// Temporary strong reference produced by [`WeakResource::upgrade`].
pub(crate) struct LiveRef<K: Kind>(Rc<Core<K>>);

impl<K: Kind> Deref for LiveRef<K> {
    type Target = Resource<K>;

    fn deref(&self) -> &Resource<K> {
        view(&self.0)
    }
}
