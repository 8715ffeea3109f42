//! Typed event dispatcher.
//!
//! Each dispatcher owns two tables indexed by catalogue slot: persistent
//! handlers (run on every publish, in registration order) and one-shot
//! handlers (run once, then dropped). Handlers are stored type-erased and
//! recovered by downcasting at publish time; registration and publication
//! both go through `E::KIND`, so a slot only ever holds handlers for one
//! event type.
//!
//! Reentrancy: a publish runs a snapshot of the persistent table, so
//! handlers may register, publish, or drop the target freely. Handlers
//! registered during a publish wait for the next one. A nested publish skips
//! a handler that is still running further up the stack.

use crate::event::{Event, EventCatalogue};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem;
use std::rc::Rc;
use tracing::{trace, warn};

type Persistent<E, R> = RefCell<Box<dyn FnMut(&E, &R)>>;
type OneShot<E, R> = Box<dyn FnOnce(&E, &R)>;

pub struct Dispatcher<R: 'static> {
    catalogue: &'static EventCatalogue,
    persistent: RefCell<Vec<Vec<Rc<dyn Any>>>>,
    once: RefCell<Vec<Vec<Box<dyn Any>>>>,
    // bumped by `clear`; a publish that sees it change stops
    generation: Cell<u64>,
    _target: PhantomData<fn(&R)>,
}

impl<R: 'static> Dispatcher<R> {
    #[must_use]
    pub fn new(catalogue: &'static EventCatalogue) -> Self {
        Self {
            catalogue,
            persistent: RefCell::new((0..catalogue.len()).map(|_| Vec::new()).collect()),
            once: RefCell::new((0..catalogue.len()).map(|_| Vec::new()).collect()),
            generation: Cell::new(0),
            _target: PhantomData,
        }
    }

    fn slot<E: Event>(&self) -> Option<usize> {
        let slot = self.catalogue.slot(E::KIND);
        if slot.is_none() {
            warn!("[Dispatcher] {:?} is not in the event catalogue", E::KIND);
        }
        slot
    }

    /// Register a persistent handler. Kinds that can only fire once are
    /// stored as one-shot.
    pub fn on<E, F>(&self, mut handler: F)
    where
        E: Event,
        F: FnMut(&E, &R) + 'static,
    {
        if E::KIND.fires_once() {
            self.once::<E, _>(move |event, target| handler(event, target));
            return;
        }
        let Some(slot) = self.slot::<E>() else { return };
        let handler: Persistent<E, R> = RefCell::new(Box::new(handler));
        self.persistent.borrow_mut()[slot].push(Rc::new(handler));
    }

    /// Register a one-shot handler.
    pub fn once<E, F>(&self, handler: F)
    where
        E: Event,
        F: FnOnce(&E, &R) + 'static,
    {
        let Some(slot) = self.slot::<E>() else { return };
        let handler: OneShot<E, R> = Box::new(handler);
        self.once.borrow_mut()[slot].push(Box::new(handler));
    }

    /// Run the handlers registered for `E` against `target`.
    pub fn publish<E: Event>(&self, event: &E, target: &R) {
        let Some(slot) = self.catalogue.slot(E::KIND) else { return };
        let generation = self.generation.get();

        if !E::KIND.is_terminal() {
            let snapshot = self.persistent.borrow()[slot].clone();
            for entry in snapshot {
                if self.generation.get() != generation {
                    // a handler tore the target down
                    return;
                }
                let Some(handler) = entry.downcast_ref::<Persistent<E, R>>() else { continue };
                match handler.try_borrow_mut() {
                    Ok(mut handler) => (&mut *handler)(event, target),
                    Err(_) => trace!("[Dispatcher] {:?} handler is already running", E::KIND),
                }
            }
            if self.generation.get() != generation {
                return;
            }
        }

        let batch = mem::take(&mut self.once.borrow_mut()[slot]);
        for handler in batch {
            if let Ok(handler) = handler.downcast::<OneShot<E, R>>() {
                (*handler)(event, target);
            }
        }
    }

    /// Number of handlers currently waiting for `E`.
    #[must_use]
    pub fn handler_count<E: Event>(&self) -> usize {
        self.catalogue.slot(E::KIND).map_or(0, |slot| {
            self.persistent.borrow()[slot].len() + self.once.borrow()[slot].len()
        })
    }

    /// Drop every handler. Handlers may own references back to the target,
    /// so the tables are swapped out before anything is dropped.
    pub fn clear(&self) {
        self.generation.set(self.generation.get() + 1);
        let persistent = mem::take(&mut *self.persistent.borrow_mut());
        let once = mem::take(&mut *self.once.borrow_mut());
        *self.persistent.borrow_mut() = persistent.iter().map(|_| Vec::new()).collect();
        *self.once.borrow_mut() = once.iter().map(|_| Vec::new()).collect();
        drop(persistent);
        drop(once);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Close, Destroy, Error, Read};
    use bytes::Bytes;
    use once_cell::sync::Lazy;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Target;

    fn dispatcher() -> Rc<Dispatcher<Target>> {
        Rc::new(Dispatcher::new(EventCatalogue::standard()))
    }

    fn read(data: &'static [u8]) -> Read {
        Read {
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_persistent_handlers_run_in_order_every_time() {
        let d = dispatcher();
        let log = Rc::new(RefCell::new(Vec::new()));
        for id in 0..3 {
            let log = log.clone();
            d.on::<Read, _>(move |_, _| log.borrow_mut().push(id));
        }

        d.publish(&read(b"a"), &Target);
        d.publish(&read(b"b"), &Target);
        assert_eq!(*log.borrow(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_once_runs_after_persistent_and_only_once() {
        let d = dispatcher();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        d.once::<Read, _>(move |_, _| l.borrow_mut().push("once"));
        let l = log.clone();
        d.on::<Read, _>(move |_, _| l.borrow_mut().push("on"));

        d.publish(&read(b"a"), &Target);
        d.publish(&read(b"b"), &Target);
        assert_eq!(*log.borrow(), vec!["on", "once", "on"]);
    }

    #[test]
    fn test_once_registered_during_batch_waits_for_next_publish() {
        let d = dispatcher();
        let hits = Rc::new(Cell::new(0));

        let inner_d = d.clone();
        let inner_hits = hits.clone();
        d.once::<Read, _>(move |_, _| {
            inner_hits.set(inner_hits.get() + 1);
            let h = inner_hits.clone();
            inner_d.once::<Read, _>(move |_, _| h.set(h.get() + 10));
        });

        d.publish(&read(b"1"), &Target);
        assert_eq!(hits.get(), 1);
        d.publish(&read(b"2"), &Target);
        assert_eq!(hits.get(), 11);
        d.publish(&read(b"3"), &Target);
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn test_persistent_registered_during_publish_is_kept() {
        let d = dispatcher();
        let hits = Rc::new(Cell::new(0));
        let registered = Rc::new(Cell::new(false));

        let inner_d = d.clone();
        let h = hits.clone();
        let r = registered.clone();
        d.on::<Read, _>(move |_, _| {
            if !r.replace(true) {
                let h = h.clone();
                inner_d.on::<Read, _>(move |_, _| h.set(h.get() + 1));
            }
        });

        d.publish(&read(b"1"), &Target);
        assert_eq!(hits.get(), 0);
        d.publish(&read(b"2"), &Target);
        assert_eq!(hits.get(), 1);
        assert_eq!(d.handler_count::<Read>(), 2);
    }

    #[test]
    fn test_nested_publish_keeps_handlers() {
        let d = dispatcher();
        let outer = Rc::new(Cell::new(0));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let inner_d = d.clone();
        let o = outer.clone();
        d.on::<Read, _>(move |_, target| {
            o.set(o.get() + 1);
            if o.get() == 1 {
                inner_d.publish(&read(b"nested"), target);
            }
        });
        let s = seen.clone();
        d.on::<Read, _>(move |read, _| s.borrow_mut().push(read.data.clone()));

        d.publish(&read(b"outer"), &Target);
        // the running handler is skipped by the nested publish, the other one is not
        assert_eq!(outer.get(), 1);
        assert_eq!(*seen.borrow(), vec![Bytes::from_static(b"nested"), Bytes::from_static(b"outer")]);
        assert_eq!(d.handler_count::<Read>(), 2);

        d.publish(&read(b"again"), &Target);
        assert_eq!(outer.get(), 2);
        assert_eq!(seen.borrow().len(), 3);
    }

    #[test]
    fn test_terminal_events_skip_persistent_table() {
        let d = dispatcher();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        // `on` for a terminal kind is stored as one-shot
        d.on::<Error, _>(move |_, _| h.set(h.get() + 1));
        let h = hits.clone();
        d.on::<Destroy, _>(move |_, _| h.set(h.get() + 100));

        let err = Error::new("test", -libc::EIO, "boom");
        d.publish(&err, &Target);
        d.publish(&err, &Target);
        d.publish(&Destroy, &Target);
        d.publish(&Destroy, &Target);
        assert_eq!(hits.get(), 101);
    }

    #[test]
    fn test_close_registration_fires_once() {
        let d = dispatcher();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        d.on::<Close, _>(move |_, _| h.set(h.get() + 1));
        d.publish(&Close, &Target);
        d.publish(&Close, &Target);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_uncatalogued_kind_is_ignored() {
        static ONLY_READ: Lazy<EventCatalogue> =
            Lazy::new(|| EventCatalogue::new([crate::event::EventKind::Read]));
        let d: Dispatcher<Target> = Dispatcher::new(&ONLY_READ);
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        d.on::<Close, _>(move |_, _| h.set(h.get() + 1));
        d.publish(&Close, &Target);
        assert_eq!(hits.get(), 0);
        assert_eq!(d.handler_count::<Close>(), 0);
    }

    #[test]
    fn test_clear_during_publish_is_final() {
        let d = dispatcher();
        let token = Rc::new(());
        let t = token.clone();
        let inner_d = d.clone();
        d.on::<Read, _>(move |_, _| {
            let _ = &t;
            inner_d.clear();
        });
        d.publish(&read(b"x"), &Target);
        assert_eq!(d.handler_count::<Read>(), 0);
        assert_eq!(Rc::strong_count(&token), 1);
    }

    #[test]
    fn test_clear_drops_captured_state() {
        let d = dispatcher();
        let token = Rc::new(());
        let t = token.clone();
        d.on::<Read, _>(move |_, _| {
            let _ = &t;
        });
        assert_eq!(Rc::strong_count(&token), 2);
        d.clear();
        assert_eq!(Rc::strong_count(&token), 1);
        assert_eq!(d.handler_count::<Read>(), 0);
    }
}
