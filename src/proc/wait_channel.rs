use core::ptr;

use super::{KernelCtx, Procstate};
use crate::kernel::Kernel;
use crate::lock::{Guard, RawLock};

pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels may have the same address, spuriously waking
    /// up more processes than intended.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically release the given lock and sleep on this channel.
    /// Reacquires the lock when awakened.
    ///
    /// The process's own lock is taken before the caller's lock is dropped,
    /// so a concurrent `wakeup` on another hart cannot slip in between the
    /// condition check and the state change: no lost wakeups. Since
    /// unrelated sleepers may share a channel by coincidence, callers must
    /// re-check their wake condition in a loop.
    pub fn sleep<R: RawLock, T>(&self, lock_guard: &mut Guard<'_, R, T>, ctx: &KernelCtx<'_>) {
        // Must acquire p->lock in order to change p->state and then call
        // sched. Once we hold p->lock, we can be guaranteed that we won't
        // miss any wakeup (wakeup locks p->lock), so it's okay to release
        // the caller's lock.
        let mut guard = ctx.proc().lock();
        lock_guard.reacquire_after(move || {
            // Go to sleep.
            guard.deref_mut_info().waitchannel = self as *const _;
            guard.deref_mut_info().state = Procstate::Sleeping;
            // SAFETY: we hold p.lock, changed the process's state, and
            // interrupts are disabled while the lock is held.
            unsafe { guard.sched() };

            // Tidy up.
            guard.deref_mut_info().waitchannel = ptr::null();

            // Drop the process guard before reacquiring the caller's lock.
            drop(guard);
        });
    }

    /// Wake up all processes sleeping on this channel.
    /// Must be called without any p->lock.
    pub fn wakeup(&self, kernel: &Kernel) {
        kernel.procs().wakeup_pool(self, kernel);
    }
}
