//! The process table and everything hanging off one slot of it.

use core::mem::{self, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::cpu;
use crate::file::RcFile;
use crate::lock::Spinlock;
use crate::param::{MAXPROCNAME, NOFILE};
use crate::swtch::{swtch, Context};
use crate::vm::UserMemory;

mod kernel_ctx;
mod procs;
mod trap_frame;
mod wait_channel;

pub use kernel_ctx::*;
pub use procs::*;
pub use trap_frame::*;
pub use wait_channel::*;

pub type Pid = i32;

/// A slot index that is not a process: the initial process has no parent.
pub const NO_PARENT: usize = usize::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Procstate {
    Unused,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl Procstate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Procstate::Unused => "unused",
            Procstate::Sleeping => "sleep ",
            Procstate::Runnable => "runble",
            Procstate::Running => "run   ",
            Procstate::Zombie => "zombie",
        }
    }
}

/// Proc::info's spinlock must be held when using these.
pub struct ProcInfo {
    /// Process state.
    pub state: Procstate,

    /// If non-null, sleeping on this wait channel. Only compared for
    /// identity, never dereferenced.
    pub(super) waitchannel: *const WaitChannel,

    /// Exit status to be returned to parent's wait.
    pub(super) xstate: i32,

    /// Process ID.
    pub(super) pid: Pid,
}

// SAFETY: `waitchannel` is only used as an identity, never dereferenced.
unsafe impl Send for ProcInfo {}

/// Proc::data are private to the process, so its lock need not be held.
pub struct ProcData {
    /// The trap frame page, holding saved user registers.
    pub(super) trap_frame: *mut TrapFrame,

    /// The process's address space.
    pub(super) memory: MaybeUninit<UserMemory>,

    /// swtch() here to run the process.
    pub(super) context: Context,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

// SAFETY: the raw pointers inside refer to resources owned by this process
// slot; ProcData moves between threads only via the slot's locks.
unsafe impl Send for ProcData {}

impl ProcData {
    fn new() -> Self {
        Self {
            trap_frame: ptr::null_mut(),
            memory: MaybeUninit::uninit(),
            context: Context::new(),
            open_files: array![_ => None; NOFILE],
            name: [0; MAXPROCNAME],
        }
    }
}

/// Per-process state.
///
/// # Safety
///
/// * If `info.state` ≠ `Unused`, then `data.trap_frame` points at a valid
///   allocator page and `data.memory` has been initialized.
/// * `parent` is only read or written while holding `Procs::wait_lock`. It
///   is `NO_PARENT` only for the initial process (or an unused slot).
pub struct Proc {
    /// Parent process (a slot index into the pool).
    parent: core::cell::UnsafeCell<usize>,

    pub info: Spinlock<ProcInfo>,

    data: core::cell::UnsafeCell<ProcData>,

    /// WaitChannel saying a child proc is dead.
    pub(super) child_waitchannel: WaitChannel,

    /// If true, the process has been killed.
    killed: AtomicBool,
}

// SAFETY: see the invariants above; `info` is a lock and `killed` is atomic,
// `data` is only touched by the thread that owns the slot, `parent` only
// under the wait lock.
unsafe impl Send for Proc {}
unsafe impl Sync for Proc {}

impl Proc {
    fn new() -> Self {
        Self {
            parent: core::cell::UnsafeCell::new(NO_PARENT),
            info: Spinlock::new(
                "proc",
                ProcInfo {
                    state: Procstate::Unused,
                    waitchannel: ptr::null(),
                    xstate: 0,
                    pid: 0,
                },
            ),
            data: core::cell::UnsafeCell::new(ProcData::new()),
            child_waitchannel: WaitChannel::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// Mark the process killed; it tears itself down at the next
    /// observation point (syscall entry, sleep loop, return to user).
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Returns a mutable reference to this proc's parent slot.
    /// The wait lock of the owning `Procs` must be held.
    pub(super) fn get_mut_parent<'b>(&self, _guard: &'b mut WaitGuard<'_>) -> &'b mut usize {
        // SAFETY: the wait lock serializes all accesses to `parent`.
        unsafe { &mut *self.parent.get() }
    }

    /// Acquire this proc's info lock and wrap it in a guard.
    pub fn lock(&self) -> ProcGuard<'_> {
        mem::forget(self.info.lock());
        ProcGuard { proc: self }
    }
}

/// # Safety
///
/// `proc.info` is locked.
pub struct ProcGuard<'s> {
    proc: &'s Proc,
}

impl<'s> ProcGuard<'s> {
    pub(super) fn deref_info(&self) -> &ProcInfo {
        // SAFETY: self.info is locked.
        unsafe { &*self.info.get_mut_raw() }
    }

    pub(super) fn deref_mut_info(&mut self) -> &mut ProcInfo {
        // SAFETY: self.info is locked and &mut self is exclusive.
        unsafe { &mut *self.info.get_mut_raw() }
    }

    /// This method returns a mutable reference to its `ProcData`. There is
    /// no data race between `ProcGuard`s since this method can be called
    /// only after acquiring the lock of `info`. However, the running
    /// process's `CurrentProc` accesses the same data without the lock.
    ///
    /// # Safety
    ///
    /// This method must be called only when no `CurrentProc` refers to the
    /// same `Proc` (i.e. the process is not currently running).
    pub(super) unsafe fn deref_mut_data(&mut self) -> &mut ProcData {
        &mut *self.data.get()
    }

    pub fn state(&self) -> Procstate {
        self.deref_info().state
    }

    /// Wake process from sleep().
    pub(super) fn wakeup(&mut self) {
        if self.state() == Procstate::Sleeping {
            self.deref_mut_info().state = Procstate::Runnable;
        }
    }

    /// Switch to the scheduler. Must hold only this proc's lock and have
    /// changed proc->state. Saves and restores the hart's interrupt-enable
    /// flag because that flag is a property of this kernel thread, not of
    /// the hart.
    pub(super) unsafe fn sched(&mut self) {
        assert!(!cpu::intr_get(), "sched interruptible");
        assert_ne!(self.state(), Procstate::Running, "sched running");

        let cpus = cpu::current_cpus();
        // SAFETY: interrupts are disabled.
        let c = cpus.current();
        assert_eq!((*c).noff(), 1, "sched locks");

        let interrupt_enabled = (*c).get_interrupt();
        let proc_ctx = self.deref_mut_data().context.clone();
        let cpu_ctx = (*c).context.clone();
        swtch(proc_ctx, cpu_ctx);

        // We may have been resumed on a different hart.
        let c = cpus.current();
        (*c).set_interrupt(interrupt_enabled);
    }

    /// Frees a `Proc` structure and the data hanging from it, including user
    /// pages, and clears the parent slot. The slot becomes `Unused`.
    ///
    /// # Safety
    ///
    /// `self.info.state` must be `Zombie` (the process cannot be running).
    pub(super) unsafe fn clear(&mut self, kernel: &crate::kernel::Kernel, parent_guard: &mut WaitGuard<'_>) {
        // SAFETY: this process cannot be the current process any longer.
        let data = self.deref_mut_data();
        let trap_frame = mem::replace(&mut data.trap_frame, ptr::null_mut());
        let kmem = kernel.kmem();
        // SAFETY: trap_frame uniquely refers to a valid page.
        kmem.lock().free(crate::page::Page::from_usize(trap_frame as usize));
        // SAFETY: memory has been initialized according to the invariant,
        // and replacing it with uninit is fine because state becomes Unused.
        mem::replace(&mut data.memory, MaybeUninit::uninit())
            .assume_init()
            .free(kmem);

        // Clear the name.
        data.name[0] = 0;

        // Clear the parent slot.
        *self.get_mut_parent(parent_guard) = NO_PARENT;

        // Clear the `ProcInfo`.
        let info = self.deref_mut_info();
        info.waitchannel = ptr::null();
        info.pid = 0;
        info.xstate = 0;
        info.state = Procstate::Unused;

        self.killed.store(false, Ordering::Release);
    }
}

impl<'s> core::ops::Deref for ProcGuard<'s> {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.proc
    }
}

impl Drop for ProcGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard holds the lock.
        unsafe { self.proc.info.unlock() };
    }
}
