//! A callback registry that survives mutation from within its own
//! notification pass.
//!
//! Observers come and go while a notification is being delivered: a callback
//! may remove itself, remove a peer, or register a new one. Removal during a
//! pass leaves a hole instead of shifting the vector, so the in-progress
//! traversal stays valid, and the holes are compacted once the pass is over.
//! Entries added during a pass are not visited until the next one.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::error;

use crate::error::Result;

/// What the list needs of its entries.
pub trait Callback {
    fn is_closed(&self) -> bool;
    fn close(&self);
    /// One-line diagnostic prefix used when a notification fails.
    fn dump_context(&self) -> String {
        String::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unlocked,
    Locked,
    Compress,
}

pub struct CallbackList<C: ?Sized> {
    callbacks: RefCell<Vec<Option<Rc<C>>>>,
    state: Cell<State>,
}

impl<C: Callback + ?Sized> CallbackList<C> {
    pub fn new() -> CallbackList<C> {
        CallbackList {
            callbacks: RefCell::new(Vec::new()),
            state: Cell::new(State::Unlocked),
        }
    }

    /// Register a callback; registering one twice is refused.
    pub fn add(&self, callback: &Rc<C>) -> Result<()> {
        let mut callbacks = self.callbacks.borrow_mut();
        let duplicate = callbacks
            .iter()
            .any(|slot| slot.as_ref().map_or(false, |c| Rc::ptr_eq(c, callback)));
        if duplicate {
            return Err(crate::error::Error::internal("adding duplicate callback"));
        }
        callbacks.push(Some(Rc::clone(callback)));
        Ok(())
    }

    /// Drop a callback. During a notification pass the slot is only nulled;
    /// the vector is compacted after the pass returns.
    pub fn remove(&self, callback: &Rc<C>) {
        let mut callbacks = self.callbacks.borrow_mut();
        let found = callbacks
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |c| Rc::ptr_eq(c, callback)));
        if let Some(idx) = found {
            if self.state.get() == State::Unlocked {
                callbacks.swap_remove(idx);
            } else {
                callbacks[idx] = None;
                self.state.set(State::Compress);
            }
        }
    }

    /// Number of slots, holes included while a pass is running.
    pub fn count(&self) -> usize {
        self.callbacks.borrow().len()
    }

    /// Invoke `f` on every live entry present when the pass started.
    ///
    /// A callback that fails is dumped, closed and removed; the pass carries
    /// on with the rest.
    pub fn notify<F: FnMut(&Rc<C>) -> Result<()>>(&self, mut f: F) {
        let count = self.callbacks.borrow().len();
        if count == 0 {
            return;
        }
        self.state.set(State::Locked);
        for idx in 0..count {
            // take a clone so the list is free for re-entrant add/remove
            let callback = match self.callbacks.borrow()[idx].clone() {
                Some(callback) => callback,
                None => continue,
            };
            if callback.is_closed() {
                continue;
            }
            if let Err(err) = f(&callback) {
                error!(
                    "{}{}: unexpected error in callback",
                    callback.dump_context(),
                    err
                );
                callback.close();
                self.remove(&callback);
            }
        }
        if self.state.get() == State::Compress {
            self.callbacks.borrow_mut().retain(|slot| slot.is_some());
        }
        self.state.set(State::Unlocked);
    }
}

impl<C: Callback + ?Sized> Default for CallbackList<C> {
    fn default() -> Self {
        CallbackList::new()
    }
}
