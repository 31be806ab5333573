use core::ops::Deref;

use super::{Pid, Proc, ProcData, Procstate, TrapFrame};
use crate::kernel::Kernel;
use crate::vm::UserMemory;

/// The running process on the current hart, as seen by the thread that runs
/// it. The owning thread may access `ProcData` without holding the process
/// lock: the data is private to the process by invariant.
pub struct CurrentProc<'s> {
    proc: &'s Proc,
    slot: usize,
    pid: Pid,
}

impl<'s> CurrentProc<'s> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn deref_data(&self) -> &ProcData {
        // SAFETY: the current process's data is only accessed by its own
        // thread, which is this one.
        unsafe { &*self.proc.data.get() }
    }

    pub fn deref_mut_data(&mut self) -> &mut ProcData {
        // SAFETY: as in deref_data, and &mut self is exclusive.
        unsafe { &mut *self.proc.data.get() }
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        // SAFETY: trap_frame is valid while the process is not Unused.
        unsafe { &*self.deref_data().trap_frame }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: as in trap_frame.
        unsafe { &mut *self.deref_mut_data().trap_frame }
    }

    pub fn memory(&self) -> &UserMemory {
        // SAFETY: memory is initialized while the process is not Unused.
        unsafe { self.deref_data().memory.assume_init_ref() }
    }

    pub fn memory_mut(&mut self) -> &mut UserMemory {
        // SAFETY: as in memory.
        unsafe { self.deref_mut_data().memory.assume_init_mut() }
    }
}

impl<'s> Deref for CurrentProc<'s> {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.proc
    }
}

/// The context a process runs kernel code in: the kernel it belongs to plus
/// its own `CurrentProc`.
pub struct KernelCtx<'s> {
    kernel: &'s Kernel,
    proc: CurrentProc<'s>,
}

impl<'s> KernelCtx<'s> {
    /// Build the context for the process in the given pool slot. Called by
    /// the process's own kernel thread right after its first dispatch.
    pub(crate) fn new(kernel: &'s Kernel, slot: usize) -> Self {
        let proc = &kernel.procs().pool()[slot];
        let pid = proc.info.lock().pid;
        Self {
            kernel,
            proc: CurrentProc { proc, slot, pid },
        }
    }

    pub fn kernel(&self) -> &'s Kernel {
        self.kernel
    }

    pub fn proc(&self) -> &CurrentProc<'s> {
        &self.proc
    }

    pub fn proc_mut(&mut self) -> &mut CurrentProc<'s> {
        &mut self.proc
    }

    /// Give up the hart for one scheduling round.
    pub fn yield_cpu(&self) {
        let mut guard = self.proc().lock();
        guard.deref_mut_info().state = Procstate::Runnable;
        // SAFETY: we hold p.lock and changed the state.
        unsafe { guard.sched() };
    }
}
