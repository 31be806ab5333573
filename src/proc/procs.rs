use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use array_macro::array;
use itertools::izip;

use super::{
    KernelCtx, Pid, Proc, ProcGuard, Procstate, TrapFrame, WaitChannel, NO_PARENT,
};
use crate::addr::UVAddr;
use crate::cpu;
use crate::file;
use crate::kernel::Kernel;
use crate::lock::{Spinlock, SpinlockGuard};
use crate::page::Page;
use crate::param::{MAXPROCNAME, NOFILE, NPROC};
use crate::swtch::swtch;
use crate::vm::UserMemory;

/// Process system type containing & managing all processes.
pub struct Procs {
    nextpid: AtomicI32,

    pool: [Proc; NPROC],

    /// Slot of the initial process; NO_PARENT until it exists.
    initial_proc: AtomicUsize,

    // Helps ensure that wakeups of wait()ing parents are not lost. Protects
    // every proc's `parent` field. Must be acquired before any p->lock.
    wait_lock: Spinlock<()>,
}

/// Holds the guard of `Procs::wait_lock`. Accessing any proc's `parent`
/// field requires one of these.
pub struct WaitGuard<'s>(SpinlockGuard<'s, ()>);

impl<'s> WaitGuard<'s> {
    pub(crate) fn inner_mut(&mut self) -> &mut SpinlockGuard<'s, ()> {
        &mut self.0
    }
}

impl Procs {
    pub fn new() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            pool: array![_ => Proc::new(); NPROC],
            initial_proc: AtomicUsize::new(NO_PARENT),
            wait_lock: Spinlock::new("wait_lock", ()),
        }
    }

    pub(crate) fn pool(&self) -> &[Proc; NPROC] {
        &self.pool
    }

    fn allocpid(&self) -> Pid {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    fn initial_proc(&self) -> usize {
        let slot = self.initial_proc.load(Ordering::Acquire);
        assert_ne!(slot, NO_PARENT, "initial_proc");
        slot
    }

    /// Acquires the wait lock of this `Procs` and returns the `WaitGuard`.
    pub fn wait_guard(&self) -> WaitGuard<'_> {
        WaitGuard(self.wait_lock.lock())
    }

    /// Look in the process table for an Unused slot. If found, initialize
    /// the state required to run in the kernel — trap frame, address space,
    /// a fresh kernel thread parked on the slot's context so that the first
    /// dispatch lands in the fork-return path — and return with the slot's
    /// lock held. The slot stays `Unused` until the caller publishes it as
    /// `Runnable`; callers racing to claim slots are serialized by the wait
    /// lock they already hold.
    ///
    /// If there are no free slots, frees `trap_frame` and `memory` and
    /// returns Err.
    fn alloc(
        &self,
        kernel: &Arc<Kernel>,
        trap_frame: Page,
        memory: UserMemory,
    ) -> Result<(ProcGuard<'_>, usize), ()> {
        for (slot, p) in self.pool.iter().enumerate() {
            let mut guard = p.lock();
            if guard.deref_info().state == Procstate::Unused {
                // SAFETY: this process cannot be the current process yet.
                let data = unsafe { guard.deref_mut_data() };

                // Initialize trap frame and address space.
                data.trap_frame = trap_frame.into_usize() as *mut TrapFrame;
                // SAFETY: the page is ours and properly aligned.
                unsafe { data.trap_frame.write(TrapFrame::new()) };
                data.memory = core::mem::MaybeUninit::new(memory);

                // A fresh context, so the slot's previous tenant (parked
                // forever after its exit) can never be woken by mistake.
                data.context = crate::swtch::Context::new();

                // The kernel thread that will run this process; it parks on
                // the context until the scheduler dispatches it, then lands
                // in the fork-return path.
                let ctx0 = data.context.clone();
                let kernel = Arc::clone(kernel);
                thread::Builder::new()
                    .name(format!("proc-{}", slot))
                    .spawn(move || proc_entry(kernel, slot, ctx0))
                    .expect("Procs::alloc: spawn");

                guard.deref_mut_info().pid = self.allocpid();
                return Ok((guard, slot));
            }
            drop(guard);
        }

        let kmem = kernel.kmem();
        kmem.lock().free(trap_frame);
        memory.free(kmem);
        Err(())
    }

    /// Set up the first user process: a page of hand-assembled code that
    /// exec's "/init", with the console already open on fds 0, 1 and 2.
    pub fn user_proc_init(&self, kernel: &Arc<Kernel>) {
        let kmem = kernel.kmem();
        let trap_frame = kmem.lock().alloc().expect("user_proc_init: alloc");
        let initcode = crate::umode::initcode();
        let memory = UserMemory::new(trap_frame.addr(), Some(&initcode), kmem)
            .expect("user_proc_init: UserMemory::new");

        let (mut guard, slot) = self
            .alloc(kernel, trap_frame, memory)
            .expect("user_proc_init: Procs::alloc");

        // SAFETY: this process cannot be the current process yet.
        let data = unsafe { guard.deref_mut_data() };

        // Prepare for the very first "return" from kernel to user.
        // SAFETY: trap_frame has been initialized by alloc.
        unsafe {
            // User program counter.
            (*data.trap_frame).epc = 0;
            // User stack pointer; initcode needs no real stack.
            (*data.trap_frame).sp = crate::riscv::PGSIZE as u64;
        }

        let name = b"initcode";
        data.name[..name.len()].copy_from_slice(name);

        for fd in 0..3 {
            data.open_files[fd] = Some(file::console(true, true));
        }

        self.initial_proc.store(slot, Ordering::Release);
        guard.deref_mut_info().state = Procstate::Runnable;
    }

    /// Wake up all processes sleeping on the channel.
    /// Must be called without any p->lock.
    pub fn wakeup_pool(&self, target: &WaitChannel, kernel: &Kernel) {
        let current = kernel.current_proc_slot();
        for (slot, p) in self.pool.iter().enumerate() {
            if Some(slot) != current {
                let mut guard = p.lock();
                if guard.deref_info().waitchannel == target as *const _ {
                    guard.wakeup();
                }
            }
        }
    }

    /// Pass the exiting process's abandoned children to init.
    /// The caller holds the wait lock.
    fn reparent(&self, dead: usize, parent_guard: &mut WaitGuard<'_>, kernel: &Kernel) {
        let init = self.initial_proc();
        for pp in self.pool.iter() {
            let parent = pp.get_mut_parent(parent_guard);
            if *parent == dead {
                *parent = init;
                self.pool[init].child_waitchannel.wakeup(kernel);
            }
        }
    }

    /// Create a new process, copying the parent's address space
    /// copy-on-write. Sets up the child to return as if from the fork()
    /// system call: same saved registers, but a0 forced to zero.
    /// Returns Ok(child's pid) on success, Err(()) on error.
    pub fn fork(&self, ctx: &mut KernelCtx<'_>) -> Result<Pid, ()> {
        let kmem = ctx.kernel().kmem();

        // Allocate a trap frame page and duplicate the address space first:
        // both can fail, and neither needs any lock on the table.
        let trap_frame = kmem.lock().alloc().ok_or(())?;
        let tf_addr = trap_frame.addr();
        let memory = match ctx.proc_mut().memory_mut().clone_cow(tf_addr, kmem) {
            Some(memory) => memory,
            None => {
                kmem.lock().free(trap_frame);
                return Err(());
            }
        };

        // Claim and publish the child under the wait lock, so no one can see
        // (or re-claim) a half-built slot and the parent field is set before
        // the child can possibly exit.
        let arc = ctx.kernel().shared();
        let mut parent_guard = self.wait_guard();
        let (mut np, _slot) = self.alloc(&arc, trap_frame, memory)?;

        // SAFETY: the child cannot be the current process yet.
        let npdata = unsafe { np.deref_mut_data() };

        // Copy saved user registers.
        // SAFETY: both trap frames are valid and disjoint.
        unsafe { *npdata.trap_frame = ctx.proc().trap_frame().clone() };

        // Cause fork to return 0 in the child.
        unsafe { (*npdata.trap_frame).a0 = 0 };

        // Increment reference counts on open file descriptors.
        for (nf, f) in izip!(
            npdata.open_files.iter_mut(),
            ctx.proc().deref_data().open_files.iter()
        ) {
            if let Some(file) = f {
                *nf = Some(file.clone());
            }
        }

        npdata.name.copy_from_slice(&ctx.proc().deref_data().name);

        let pid = np.deref_mut_info().pid;

        *np.get_mut_parent(&mut parent_guard) = ctx.proc().slot();
        np.deref_mut_info().state = Procstate::Runnable;

        drop(np);
        drop(parent_guard);
        Ok(pid)
    }

    /// Wait for a child process to exit, reap it, and return its pid. If
    /// `addr` is non-null the child's exit status is copied there first.
    /// Returns Err(()) immediately if this process has no children.
    pub fn wait(&self, addr: UVAddr, ctx: &mut KernelCtx<'_>) -> Result<Pid, ()> {
        let kmem = ctx.kernel().kmem();
        let mut parent_guard = self.wait_guard();

        loop {
            // Scan through the table looking for exited children.
            let mut havekids = false;
            for np in self.pool.iter() {
                if *np.get_mut_parent(&mut parent_guard) == ctx.proc().slot() {
                    // Found a child. Make sure it isn't still in exit() or
                    // swtch().
                    let mut np = np.lock();

                    havekids = true;
                    if np.state() == Procstate::Zombie {
                        let pid = np.deref_info().pid;
                        let xstate = np.deref_info().xstate;
                        if !addr.is_null()
                            && ctx
                                .proc_mut()
                                .memory_mut()
                                .copy_out(addr, &xstate.to_le_bytes(), kmem)
                                .is_err()
                        {
                            return Err(());
                        }
                        // Reap the zombie child.
                        // SAFETY: np is a Zombie, so not running.
                        unsafe { np.clear(ctx.kernel(), &mut parent_guard) };
                        return Ok(pid);
                    }
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || ctx.proc().killed() {
                return Err(());
            }

            // Wait for a child to exit.
            ctx.proc()
                .child_waitchannel
                .sleep(parent_guard.inner_mut(), ctx);
        }
    }

    /// Kill the process with the given pid. The victim won't exit until it
    /// next crosses one of the kill observation points (see usertrap).
    /// Returns Ok(()) on success, Err(()) if no such process.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        for p in self.pool.iter() {
            let mut guard = p.lock();
            if guard.deref_info().pid == pid && guard.state() != Procstate::Unused {
                p.kill();
                guard.wakeup();
                return Ok(());
            }
        }
        Err(())
    }

    /// Exit the current process. Does not return. An exited process remains
    /// in the zombie state until its parent calls wait().
    pub fn exit_current(&self, status: i32, ctx: &mut KernelCtx<'_>) -> ! {
        assert_ne!(
            ctx.proc().slot(),
            self.initial_proc(),
            "init exiting"
        );

        // Close all open files.
        for i in 0..NOFILE {
            if let Some(f) = ctx.proc_mut().deref_mut_data().open_files[i].take() {
                file::fileclose(f, ctx.kernel());
            }
        }

        // Give any children to init, and wake our parent in case it is in
        // wait(). The parent cannot disappear from under us: only a parent
        // reaps, and ours is blocked on the wait lock we hold.
        let mut parent_guard = self.wait_guard();
        self.reparent(ctx.proc().slot(), &mut parent_guard, ctx.kernel());

        let parent = *ctx.proc().get_mut_parent(&mut parent_guard);
        assert_ne!(parent, NO_PARENT, "exit: no parent");
        self.pool[parent].child_waitchannel.wakeup(ctx.kernel());

        let mut guard = ctx.proc().lock();
        guard.deref_mut_info().xstate = status;
        guard.deref_mut_info().state = Procstate::Zombie;

        // Should manually drop since this function never returns.
        drop(parent_guard);

        // Jump into the scheduler, never to return.
        // SAFETY: we hold p.lock and changed the state.
        unsafe { guard.sched() };

        unreachable!("zombie exit")
    }

    /// Per-hart scheduler loop. Runs on a bound scheduler thread; returns
    /// only when the machine halts. It loops, doing:
    ///  - choose a Runnable process to run.
    ///  - swtch to start running that process.
    ///  - eventually that process transfers control back via swtch.
    pub fn scheduler(&self, kernel: &Kernel) {
        let cpus = kernel.cpus();
        'outer: loop {
            if kernel.is_halted() {
                break;
            }

            // Take a pending timer interrupt even with nothing to run, so
            // ticks advance and tick sleepers wake.
            kernel.poll_tick();

            // Make sure interrupts can be taken once we run something.
            // SAFETY: this thread holds no spinlock here.
            unsafe { cpu::intr_on() };

            let mut found = false;
            for (slot, p) in self.pool.iter().enumerate() {
                let mut guard = p.lock();
                if guard.state() == Procstate::Runnable {
                    // Switch to the chosen process. It is the process's job
                    // to release its lock and then reacquire it before
                    // jumping back to us.
                    guard.deref_mut_info().state = Procstate::Running;
                    // SAFETY: interrupts are disabled while p.lock is held.
                    let c = cpus.current();
                    unsafe { (*c).set_proc(Some(slot)) };
                    // SAFETY: the process is not running; no CurrentProc
                    // aliases its data.
                    let proc_ctx = unsafe { guard.deref_mut_data() }.context.clone();
                    let cpu_ctx = unsafe { &*c }.context.clone();
                    swtch(cpu_ctx, proc_ctx);

                    // Process is done running for now. It should have
                    // changed its state before coming back.
                    let c = cpus.current();
                    unsafe { (*c).set_proc(None) };
                    found = true;
                }
                drop(guard);
                if kernel.is_halted() {
                    break 'outer;
                }
            }

            if !found {
                // Nothing runnable: wait for the next interrupt.
                thread::sleep(Duration::from_micros(200));
            }
        }
    }

    /// Print a process listing for debugging, xv6 ^P style.
    /// Doesn't acquire locks in order not to wedge a stuck machine further.
    pub fn dump(&self) {
        for p in self.pool.iter() {
            // SAFETY: debugging only; racy reads are acceptable here.
            let info = unsafe { &*p.info.get_mut_raw() };
            if info.state != Procstate::Unused {
                let name = unsafe { &(*p.data.get()).name };
                let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
                log::warn!(
                    "{} {} {}",
                    info.pid,
                    info.state.as_str(),
                    core::str::from_utf8(&name[..len]).unwrap_or("???")
                );
            }
        }
    }
}

/// Body of every process's kernel thread. Parks until the scheduler's first
/// dispatch, then acts as the fork-return path: release the lock the
/// scheduler handed us and drop to user mode.
fn proc_entry(kernel: Arc<Kernel>, slot: usize, ctx0: crate::swtch::Context) {
    kernel.cpus().bind_machine();
    ctx0.suspend();

    // Still holding p->lock from the scheduler.
    let proc = &kernel.procs().pool()[slot];
    // SAFETY: the dispatching scheduler acquired it.
    unsafe { proc.info.unlock() };

    let mut ctx = KernelCtx::new(&kernel, slot);
    crate::trap::user_loop(&mut ctx);
}

/// exec publishes the new program name here.
pub(crate) fn set_proc_name(data: &mut super::ProcData, name: &[u8]) {
    let n = core::cmp::min(name.len(), MAXPROCNAME - 1);
    data.name[..n].copy_from_slice(&name[..n]);
    data.name[n] = 0;
}
