//! Kernel context switch.
//!
//! On hardware this is a dozen instructions of assembly saving and restoring
//! callee-saved registers. On the emulated machine every kernel context is a
//! host thread, and `swtch` hands the current hart over: it resumes the
//! thread parked in `new` and parks the caller in `old`. The hart id travels
//! with the hand-off, so a process may well wake up on a different hart than
//! the one it slept on.
//!
//! The xv6 locking discipline is preserved unchanged: the process lock is
//! held across the switch and released by the other side, and the
//! `noff`/interrupt-enable bookkeeping lives in the per-hart `Cpu`, which
//! the hand-off carries along.

use std::sync::{Arc, Condvar, Mutex};

use crate::cpu;

struct Handoff {
    /// Has this context been told to run?
    pending: bool,

    /// The hart the context should run on.
    hart: usize,
}

struct ContextInner {
    state: Mutex<Handoff>,
    resumed: Condvar,
}

/// A suspended kernel context: the parking spot of one kernel thread.
///
/// Cloning yields another handle to the same parking spot; `Context::new`
/// makes a fresh one. A process table slot gets a fresh `Context` each time
/// it is allocated, so a thread parked on a stale context can never be woken
/// by the slot's next tenant.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                state: Mutex::new(Handoff {
                    pending: false,
                    hart: 0,
                }),
                resumed: Condvar::new(),
            }),
        }
    }

    /// Tell the thread parked in this context to run on hart `hart`.
    fn resume(&self, hart: usize) {
        let mut state = self.inner.state.lock().unwrap();
        assert!(!state.pending, "swtch: double resume");
        state.pending = true;
        state.hart = hart;
        self.inner.resumed.notify_one();
    }

    /// Park the calling thread in this context until someone resumes it.
    /// Binds the thread to the hart it was resumed on and returns its id.
    pub(crate) fn suspend(&self) -> usize {
        let mut state = self.inner.state.lock().unwrap();
        while !state.pending {
            state = self.inner.resumed.wait(state).unwrap();
        }
        state.pending = false;
        let hart = state.hart;
        drop(state);
        cpu::set_hart(hart);
        hart
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch the current hart from the calling context to `new`.
/// Returns when someone switches back into `old`.
///
/// A zombie's final switch into the scheduler never returns: nothing ever
/// resumes its context again, and the host thread stays parked until the
/// machine is torn down.
pub fn swtch(old: Context, new: Context) {
    new.resume(cpu::cpuid());
    old.suspend();
}
