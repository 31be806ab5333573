//! Per-hart state.
//!
//! Each hart of the emulated machine is driven by one host thread at a time:
//! a scheduler thread while idle, or the kernel thread of the process it
//! dispatched. `swtch` hands the hart over between those threads, so the
//! fields of a `Cpu` are only ever touched by the thread currently bound to
//! that hart (the one whose thread-local hart id names it).
//!
//! A host thread must be bound to a machine's `Cpus` (see `Cpus::bind`)
//! before it touches any spinlock of that machine.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::param::NCPU;
use crate::swtch::Context;

std::thread_local! {
    /// The hart id of the current thread; the emulated analogue of the `tp`
    /// register. Updated by `swtch` when a hart is handed over.
    static HART: Cell<usize> = Cell::new(0);

    /// The `Cpus` of the machine the current thread belongs to.
    static MACHINE: Cell<*const Cpus> = Cell::new(ptr::null());
}

/// Return this hart's ID.
pub fn cpuid() -> usize {
    HART.with(|h| h.get())
}

pub(crate) fn set_hart(id: usize) {
    HART.with(|h| h.set(id));
}

/// Returns the `Cpus` of the machine the current thread is bound to.
///
/// The returned reference is valid because every bound thread keeps the
/// kernel that owns the `Cpus` alive for as long as it runs kernel code.
pub(crate) fn current_cpus() -> &'static Cpus {
    let p = MACHINE.with(|c| c.get());
    assert!(!p.is_null(), "no hart bound to this thread");
    // SAFETY: set by `Cpus::bind` from a live machine; see above.
    unsafe { &*p }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let cpus = current_cpus();
    let old = intr_get();
    // SAFETY: interrupt state of the current hart is per-thread.
    unsafe {
        intr_off();
        (*cpus.current()).push_off(old);
    }
}

/// pop_off() should be paired with push_off().
/// See push_off() for more details.
pub fn pop_off() {
    let cpus = current_cpus();
    assert!(!intr_get(), "pop_off - interruptible");
    // SAFETY: interrupt state of the current hart is per-thread.
    unsafe {
        (*cpus.current()).pop_off();
    }
}

/// Are interrupts enabled on this hart?
pub fn intr_get() -> bool {
    // SAFETY: only the current thread reads its own hart's flag.
    unsafe { (*current_cpus().current()).intr_on }
}

/// Enable interrupts on this hart.
///
/// # Safety
///
/// Must not be called while any spinlock is held by this hart.
pub unsafe fn intr_on() {
    (*current_cpus().current()).intr_on = true;
}

/// Disable interrupts on this hart.
pub unsafe fn intr_off() {
    (*current_cpus().current()).intr_on = false;
}

// The `Cpu` struct of the current hart can be mutated. To do so, we need to
// obtain mutable pointers to `Cpu`s from a shared reference of a `Cpus`.
// It requires interior mutability, so we use `UnsafeCell`.
pub struct Cpus {
    cpus: [core::cell::UnsafeCell<Cpu>; NCPU],

    /// Timer-interrupt-pending flags, one per hart. Written by the timer
    /// thread, consumed by whichever thread currently runs the hart.
    pending: [AtomicBool; NCPU],

    /// Harts actually in use by this machine (<= NCPU).
    ncpu: usize,
}

// SAFETY: each thread accesses only the cpu struct of the hart it is bound
// to; the pending flags are atomic.
unsafe impl Sync for Cpus {}

impl Cpus {
    pub fn new(ncpu: usize) -> Self {
        assert!(ncpu >= 1 && ncpu <= NCPU, "Cpus::new");
        Self {
            cpus: array![_ => core::cell::UnsafeCell::new(Cpu::new()); NCPU],
            pending: array![_ => AtomicBool::new(false); NCPU],
            ncpu,
        }
    }

    pub fn ncpu(&self) -> usize {
        self.ncpu
    }

    /// Bind the calling host thread to hart `id` of this machine.
    pub fn bind(&self, id: usize) {
        assert!(id < self.ncpu, "Cpus::bind");
        MACHINE.with(|c| c.set(self as *const _));
        set_hart(id);
    }

    /// Bind the calling host thread to this machine without choosing a hart
    /// yet; the hart id arrives with the first `swtch` into this thread.
    pub(crate) fn bind_machine(&self) {
        MACHINE.with(|c| c.set(self as *const _));
    }

    /// Return this hart's cpu struct.
    pub fn current(&self) -> *mut Cpu {
        self.cpus[cpuid()].get()
    }

    /// Raise the timer-interrupt-pending flag on every hart.
    pub fn raise_tick(&self) {
        for p in self.pending[..self.ncpu].iter() {
            p.store(true, Ordering::Release);
        }
    }

    /// Consume a pending timer interrupt on the given hart, if any.
    pub fn take_tick(&self, hart: usize) -> bool {
        self.pending[hart].swap(false, Ordering::Acquire)
    }
}

/// Per-hart state.
pub struct Cpu {
    /// The process table slot of the process running on this hart, or None.
    proc: Option<usize>,

    /// swtch() here to enter the scheduler.
    pub context: Context,

    /// Depth of push_off() nesting.
    noff: i32,

    /// Were interrupts enabled before push_off()?
    interrupt_enabled: bool,

    /// Are interrupts enabled right now? The emulated analogue of the
    /// sstatus SIE bit.
    intr_on: bool,
}

impl Cpu {
    fn new() -> Self {
        Self {
            proc: None,
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
            intr_on: false,
        }
    }

    fn push_off(&mut self, old: bool) {
        if self.noff == 0 {
            self.interrupt_enabled = old;
        }
        self.noff += 1;
    }

    fn pop_off(&mut self) {
        assert!(self.noff >= 1, "pop_off");
        self.noff -= 1;
        if self.noff == 0 && self.interrupt_enabled {
            self.intr_on = true;
        }
    }

    pub fn noff(&self) -> i32 {
        self.noff
    }

    pub fn get_interrupt(&self) -> bool {
        self.interrupt_enabled
    }

    pub fn set_interrupt(&mut self, interrupt: bool) {
        self.interrupt_enabled = interrupt;
    }

    pub fn set_proc(&mut self, slot: Option<usize>) {
        self.proc = slot;
    }

    pub fn get_proc(&self) -> Option<usize> {
        self.proc
    }
}
