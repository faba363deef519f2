/* Copyright (c) [2023] [Syswonder Community]
 *   [Ruxos] is licensed under Mulan PSL v2.
 *   You can use this software according to the terms and conditions of the Mulan PSL v2.
 *   You may obtain a copy of Mulan PSL v2 at:
 *               http://license.coscl.org.cn/MulanPSL2
 *   THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
 *   See the Mulan PSL v2 for more details.
 */

//! Reference-counted, per-index event notification for device drivers.
//!
//! An [`EventSource`] multiplexes a fixed number of asynchronous hardware
//! event lines (identified by small integer indices) to any number of
//! listeners. Listeners attach to an index with [`EventSource::get`] and
//! detach with [`EventSource::put`]; the interrupt path fans an occurrence
//! out to all listeners of one index with [`EventSource::trigger`].
//!
//! Each index keeps a count of active registrations. The [`EventOps::enable`]
//! hook is invoked exactly when that count rises from zero and
//! [`EventOps::disable`] exactly when it falls back to zero, so the embedding
//! driver unmasks a hardware source only while someone is listening and masks
//! it again as soon as nobody is. A handler may also unregister itself from
//! the dispatch path by returning [`Disposition::Drop`]; all removals of one
//! dispatch pass collapse into a single batched disable-accounting step.
//!
//! All state is protected by one source-wide IRQ-safe spin lock
//! ([`kspin::SpinNoIrq`]), making get/put/trigger safe to call from both
//! thread and interrupt context. An optional [`ToggleLock`] lets the embedder
//! serialize the enable/disable hooks with state of its own; it is always
//! acquired after the primary lock.
//!
//! # Examples
//!
//! ```
//! use driver_event::{Disposition, EventHandlerRef, EventSource};
//! use std::sync::Arc;
//!
//! let source = EventSource::new(4).unwrap();
//! let handler: EventHandlerRef = Arc::new(|_index: usize| Disposition::Keep);
//! source.get(1, &handler);
//! source.trigger(1);
//! source.put(1, &handler);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod refcount;


pub use refcount::ActiveCount;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kspin::{SpinNoIrq, SpinNoIrqGuard};
use log::trace;

/// The error type for event source operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    /// Not enough memory to allocate the per-index state.
    NoMemory,
}

/// A specialized `Result` type for event source operations.
pub type EventResult<T = ()> = Result<T, EventError>;

/// What a handler wants done with its registration after it has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler stays registered and fires again on the next trigger.
    Keep,
    /// The handler is unregistered immediately and never fires again.
    Drop,
}

/// A listener attached to one index of an [`EventSource`].
///
/// Handlers are invoked from the dispatch path with the source's primary lock
/// held, possibly in interrupt context. They must be short, must not block
/// and must not call back into the same source.
pub trait EventHandler: Send + Sync {
    /// Handles one occurrence of the event on `index`.
    ///
    /// Returning [`Disposition::Drop`] unregisters the handler as part of the
    /// current dispatch pass, as if [`EventSource::put`] had been called.
    fn handle(&self, index: usize) -> Disposition;
}

impl<F> EventHandler for F
where
    F: Fn(usize) -> Disposition + Send + Sync,
{
    fn handle(&self, index: usize) -> Disposition {
        self(index)
    }
}

/// A shared reference to a registered handler.
///
/// Registration is by identity: [`EventSource::put`] unlinks exactly the
/// `Arc` that was passed to [`EventSource::get`].
pub type EventHandlerRef = Arc<dyn EventHandler>;

/// Hardware enable/disable hooks provided by the embedding driver.
///
/// Both hooks are invoked with the source's primary lock (and the toggle
/// lock, if one is set) held, so they must not block, sleep, or call back
/// into the same [`EventSource`]. Both default to doing nothing; an embedder
/// overrides only what its hardware needs.
pub trait EventOps: Send + Sync {
    /// Called when `index` gains its first active registration.
    ///
    /// Typically unmasks the corresponding interrupt/event source.
    fn enable(&self, _index: usize) {}

    /// Called when `index` loses its last active registration.
    fn disable(&self, _index: usize) {}
}

/// An externally owned lock coordinating the enable/disable hooks with state
/// outside the event source.
///
/// Its meaning is opaque to this crate. When set, it is acquired after the
/// primary lock and released before it, in every path that runs enable or
/// disable accounting. Other subsystem code may therefore take it on its own
/// and rely on not racing with the hooks.
pub trait ToggleLock: Send + Sync {
    /// Acquires the lock, blocking (spinning) until it is held.
    fn acquire(&self);
    /// Releases the lock.
    fn release(&self);
}

/// Per-index state: the registered handlers and the active-reference count.
struct IndexSlot {
    /// Most recently registered handler at the front.
    handlers: VecDeque<EventHandlerRef>,
    refs: ActiveCount,
}

impl IndexSlot {
    const fn new() -> Self {
        Self {
            handlers: VecDeque::new(),
            refs: ActiveCount::new(),
        }
    }
}

/// A reference-counted, per-index event notification source.
///
/// The number of indices is fixed at construction. Operations on an index
/// greater than or equal to [`index_nr`] are silent no-ops, so callers may
/// address a superset of the indices their hardware actually has without
/// per-call bounds checks.
///
/// Dropping the source releases only its own storage. Callers should have
/// removed their registrations via [`put`] first; a registration that is
/// still linked at drop time is released with the source (a logic error, but
/// not a memory-safety one, since handlers are shared via [`Arc`]).
///
/// [`index_nr`]: EventSource::index_nr
/// [`put`]: EventSource::put
pub struct EventSource {
    index_nr: usize,
    slots: SpinNoIrq<Vec<IndexSlot>>,
    ops: Option<Arc<dyn EventOps>>,
    toggle_lock: Option<Arc<dyn ToggleLock>>,
}

impl EventSource {
    /// Creates a new source with `index_nr` indices, all inactive.
    ///
    /// The enable/disable hooks and the toggle lock are unset; the embedder
    /// populates them with [`set_ops`] and [`set_toggle_lock`] before sharing
    /// the source.
    ///
    /// Returns [`EventError::NoMemory`] if the per-index state cannot be
    /// allocated, leaving nothing behind.
    ///
    /// [`set_ops`]: EventSource::set_ops
    /// [`set_toggle_lock`]: EventSource::set_toggle_lock
    pub fn new(index_nr: usize) -> EventResult<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(index_nr)
            .map_err(|_| EventError::NoMemory)?;
        slots.resize_with(index_nr, IndexSlot::new);
        Ok(Self {
            index_nr,
            slots: SpinNoIrq::new(slots),
            ops: None,
            toggle_lock: None,
        })
    }

    /// Returns the number of indices this source was created with.
    pub const fn index_nr(&self) -> usize {
        self.index_nr
    }

    /// Sets the hardware enable/disable hooks.
    pub fn set_ops(&mut self, ops: Arc<dyn EventOps>) {
        self.ops = Some(ops);
    }

    /// Sets the external toggle lock taken around enable/disable accounting.
    pub fn set_toggle_lock(&mut self, lock: Arc<dyn ToggleLock>) {
        self.toggle_lock = Some(lock);
    }

    /// Registers `handler` on `index`.
    ///
    /// The handler is linked at the front of the index's list, so the most
    /// recently registered handler fires first on [`trigger`]. If this is the
    /// first active registration for `index`, the [`EventOps::enable`] hook
    /// fires under the lock.
    ///
    /// No-op if `index` is out of range. The caller keeps ownership of the
    /// handler and must eventually remove it with [`put`] (unless the handler
    /// drops itself from the dispatch path).
    ///
    /// [`trigger`]: EventSource::trigger
    /// [`put`]: EventSource::put
    pub fn get(&self, index: usize, handler: &EventHandlerRef) {
        if index >= self.index_nr {
            return;
        }
        trace!("event get: index {}", index);
        let mut slots = self.slots.lock();
        let slot = &mut slots[index];
        slot.handlers.push_front(handler.clone());
        self.with_toggle(|| self.enable_accounting(&mut slot.refs, index));
    }

    /// Unregisters `handler` from `index`.
    ///
    /// The caller must have registered this exact handler on this index via
    /// [`get`] and not yet removed it; removing it twice, or removing a
    /// handler that already dropped itself during [`trigger`], corrupts the
    /// accounting. If this was the last active registration for `index`, the
    /// [`EventOps::disable`] hook fires under the lock.
    ///
    /// No-op if `index` is out of range.
    ///
    /// [`get`]: EventSource::get
    /// [`trigger`]: EventSource::trigger
    pub fn put(&self, index: usize, handler: &EventHandlerRef) {
        if index >= self.index_nr {
            return;
        }
        trace!("event put: index {}", index);
        let mut slots = self.slots.lock();
        let slot = &mut slots[index];
        if let Some(pos) = slot.handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
            slot.handlers.remove(pos);
        }
        self.with_toggle(|| self.disable_accounting(&mut slot.refs, index, 1));
    }

    /// Fans one occurrence of the event on `index` out to its handlers.
    ///
    /// Handlers fire in reverse registration order (most recently registered
    /// first). A handler returning [`Disposition::Drop`] is unlinked as part
    /// of this pass; after the pass, all removals are accounted in a single
    /// batched step, so at most one [`EventOps::disable`] invocation results
    /// no matter how many handlers dropped.
    ///
    /// No-op if `index` is out of range. Must not be called re-entrantly from
    /// a handler or hook of the same source (self-deadlock).
    pub fn trigger(&self, index: usize) {
        if index >= self.index_nr {
            return;
        }
        let mut slots = self.slots.lock();
        let slot = &mut slots[index];
        let mut dropped = 0;
        slot.handlers.retain(|h| match h.handle(index) {
            Disposition::Keep => true,
            Disposition::Drop => {
                dropped += 1;
                false
            }
        });
        if dropped > 0 {
            trace!("event trigger: index {} dropped {}", index, dropped);
            self.with_toggle(|| self.disable_accounting(&mut slot.refs, index, dropped));
        }
    }

    /// Returns the current active-reference count of `index`.
    ///
    /// Zero for out-of-range indices. The value is stale as soon as the lock
    /// is released; use it for diagnostics, not for synchronization.
    pub fn active_refs(&self, index: usize) -> usize {
        if index >= self.index_nr {
            return 0;
        }
        self.slots.lock()[index].refs.get()
    }

    /// Locks the source and returns a guard exposing raw enable/disable
    /// accounting.
    ///
    /// For embedders that adjust the accounting of several indices under one
    /// lock acquisition, without touching the handler lists. The primary lock
    /// and then the toggle lock (if set) are held for the guard's lifetime.
    pub fn lock(&self) -> LockedEventSource<'_> {
        let slots = self.slots.lock();
        if let Some(lock) = self.toggle_lock.as_deref() {
            lock.acquire();
        }
        LockedEventSource {
            source: self,
            slots,
        }
    }

    /// Runs `f` with the toggle lock held, or directly if none is set.
    ///
    /// The caller already holds the primary lock, preserving the fixed
    /// primary -> toggle acquisition order.
    fn with_toggle<R>(&self, f: impl FnOnce() -> R) -> R {
        if let Some(lock) = self.toggle_lock.as_deref() {
            lock.acquire();
            let ret = f();
            lock.release();
            ret
        } else {
            f()
        }
    }

    /// Adds one active registration to `index`, firing the enable hook on
    /// the rising edge. Caller holds the primary and toggle locks.
    fn enable_accounting(&self, refs: &mut ActiveCount, index: usize) {
        if refs.inc() {
            trace!("event enable: index {}", index);
            if let Some(ops) = self.ops.as_deref() {
                ops.enable(index);
            }
        }
    }

    /// Removes `n` active registrations from `index` at once, firing the
    /// disable hook on the falling edge. Caller holds the primary and toggle
    /// locks.
    fn disable_accounting(&self, refs: &mut ActiveCount, index: usize, n: usize) {
        if refs.dec(n) {
            trace!("event disable: index {}", index);
            if let Some(ops) = self.ops.as_deref() {
                ops.disable(index);
            }
        }
    }
}

impl core::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("EventSource")
            .field("index_nr", &self.index_nr)
            .finish_non_exhaustive()
    }
}

/// A locked view of an [`EventSource`] exposing raw accounting steps.
///
/// Obtained from [`EventSource::lock`]. While the guard lives, no get/put/
/// trigger on the same source can run, so a batch of [`enable`]/[`disable`]
/// steps over several indices is observed atomically.
///
/// [`enable`]: LockedEventSource::enable
/// [`disable`]: LockedEventSource::disable
pub struct LockedEventSource<'a> {
    source: &'a EventSource,
    slots: SpinNoIrqGuard<'a, Vec<IndexSlot>>,
}

impl LockedEventSource<'_> {
    /// Adds one active registration to `index` without linking a handler,
    /// firing the enable hook if the count rises from zero.
    ///
    /// No-op if `index` is out of range.
    pub fn enable(&mut self, index: usize) {
        if index >= self.source.index_nr {
            return;
        }
        let slot = &mut self.slots[index];
        self.source.enable_accounting(&mut slot.refs, index);
    }

    /// Removes `refs` active registrations from `index` at once, firing the
    /// disable hook if the count reaches zero.
    ///
    /// No-op if `index` is out of range. The caller must not remove more
    /// registrations than it added.
    pub fn disable(&mut self, index: usize, refs: usize) {
        if index >= self.source.index_nr {
            return;
        }
        let slot = &mut self.slots[index];
        self.source.disable_accounting(&mut slot.refs, index, refs);
    }

    /// Returns the current active-reference count of `index`.
    pub fn active_refs(&self, index: usize) -> usize {
        if index >= self.source.index_nr {
            return 0;
        }
        self.slots[index].refs.get()
    }
}

impl Drop for LockedEventSource<'_> {
    fn drop(&mut self) {
        // Release order is the reverse of acquisition: toggle first, then the
        // primary lock when the inner guard drops.
        if let Some(lock) = self.source.toggle_lock.as_deref() {
            lock.release();
        }
    }
}
