// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Interrupt-saving spinlocks with a two-level ordering check.
//!
//! The scheduler has two lock granularities: one lock per pCPU guarding that
//! pCPU's materialized schedule, and one scheduler-wide private lock guarding
//! the schedule store, the domain list and every UNIT record. The private
//! lock nests strictly inside a pCPU lock. Taking a pCPU lock while the
//! private lock is held would deadlock against schedule installation, so
//! debug builds assert on it.
//!
//! Local interrupt state is modelled per thread: each thread stands in for
//! the pCPU it runs on.

use std::cell::Cell;
use std::ops::Deref;
use std::ops::DerefMut;

thread_local! {
    static IRQS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static PCPU_LOCKS_HELD: Cell<u32> = const { Cell::new(0) };
    static PRIVATE_LOCKS_HELD: Cell<u32> = const { Cell::new(0) };
}

/// Whether local interrupts are enabled on the calling pCPU.
pub fn local_irq_is_enabled() -> bool {
    IRQS_ENABLED.with(|e| e.get())
}

fn local_irq_save() -> bool {
    IRQS_ENABLED.with(|e| e.replace(false))
}

fn local_irq_restore(were_enabled: bool) {
    IRQS_ENABLED.with(|e| e.set(were_enabled));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockClass {
    /// Per-pCPU scheduler lock. Outer.
    Pcpu,
    /// Scheduler-wide private lock. Inner.
    Private,
}

impl LockClass {
    fn counter(self) -> &'static std::thread::LocalKey<Cell<u32>> {
        match self {
            LockClass::Pcpu => &PCPU_LOCKS_HELD,
            LockClass::Private => &PRIVATE_LOCKS_HELD,
        }
    }

    fn check_acquire(self) {
        let private_held = PRIVATE_LOCKS_HELD.with(|c| c.get());
        match self {
            LockClass::Pcpu => debug_assert!(
                private_held == 0,
                "lock order violation: pCPU lock taken under the private lock"
            ),
            LockClass::Private => debug_assert!(
                private_held == 0,
                "private lock taken recursively"
            ),
        }
    }
}

/// Number of locks of `class` the calling thread holds.
pub fn held(class: LockClass) -> u32 {
    class.counter().with(|c| c.get())
}

/// A busy-waiting lock that disables local interrupts while held.
pub struct IrqSpinLock<T> {
    class: LockClass,
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(class: LockClass, data: T) -> Self {
        Self {
            class,
            inner: spin::Mutex::new(data),
        }
    }

    /// Disable local interrupts, then spin until the lock is ours.
    pub fn lock_irqsave(&self) -> IrqSpinGuard<'_, T> {
        self.class.check_acquire();
        let irqs_were_enabled = local_irq_save();
        let guard = self.inner.lock();
        self.class.counter().with(|c| c.set(c.get() + 1));
        IrqSpinGuard {
            guard,
            _held: Held {
                class: self.class,
                irqs_were_enabled,
            },
        }
    }
}

/// Released before interrupts come back on: `guard` drops ahead of `_held`.
pub struct IrqSpinGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _held: Held,
}

struct Held {
    class: LockClass,
    irqs_were_enabled: bool,
}

impl Drop for Held {
    fn drop(&mut self) {
        self.class.counter().with(|c| c.set(c.get() - 1));
        local_irq_restore(self.irqs_were_enabled);
    }
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
