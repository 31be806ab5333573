use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{Lock, RawLock};
use crate::cpu::{self, cpuid};

/// No hart holds the lock.
const NOHART: usize = usize::MAX;

/// Mutual exclusion spin lock.
pub struct RawSpinlock {
    /// Is the lock held?
    locked: AtomicBool,

    /// Name of lock, for debugging.
    name: &'static str,

    /// The hart holding the lock.
    cpu: AtomicUsize,
}

pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = super::Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    /// Mutual exclusion spin locks.
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            cpu: AtomicUsize::new(NOHART),
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock.
    /// Loops (spins) until the lock is acquired.
    fn acquire(&self) {
        // disable interrupts to avoid deadlock.
        cpu::push_off();

        assert!(!self.holding_unguarded(), "acquire {}", self.name);

        // The Acquire success ordering ensures that the critical section's
        // memory references happen after the lock is acquired.
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        // Record info about lock acquisition for holding() and debugging.
        self.cpu.store(cpuid(), Ordering::Relaxed);
    }

    /// Releases the lock.
    fn release(&self) {
        assert!(self.holding_unguarded(), "release {}", self.name);
        self.cpu.store(NOHART, Ordering::Relaxed);

        // The Release ordering ensures that all the stores in the critical
        // section are visible to other harts before the lock is released.
        self.locked.store(false, Ordering::Release);

        cpu::pop_off();
    }

    /// Check whether this hart is holding the lock.
    /// Interrupts must be off.
    fn holding(&self) -> bool {
        cpu::push_off();
        let r = self.holding_unguarded();
        cpu::pop_off();
        r
    }
}

impl RawSpinlock {
    /// `holding` without the interrupt dance. Only valid while interrupts
    /// are already off on this hart.
    fn holding_unguarded(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpuid()
    }
}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSpinlock::new(name), data)
    }
}
