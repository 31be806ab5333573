//! The user/kernel boundary.
//!
//! `user_loop` alternates between running the process in user mode and
//! handling whatever trap brought it back: a system call, a page fault to
//! classify and repair, a timer interrupt, or garbage. A process found
//! killed at any of the observation points exits here instead of returning
//! to user mode.

use crate::addr::UVAddr;
use crate::cpu;
use crate::proc::KernelCtx;
use crate::syscall::syscall;
use crate::umode::{self, Scause, INSN_SIZE};
use crate::vm::AccessType;

/// Drive one process forever: user mode, trap, repeat. The final exit
/// happens inside `usertrap` via `exit_current`, which never returns.
pub fn user_loop(ctx: &mut KernelCtx<'_>) -> ! {
    loop {
        let cause = umode::run(ctx);
        usertrap(ctx, cause);
    }
}

/// Handle an interrupt, exception, or system call from user space.
pub fn usertrap(ctx: &mut KernelCtx<'_>, cause: Scause) {
    // interrupts are taken in the kernel only at chosen points
    // SAFETY: we just came from user mode.
    unsafe { cpu::intr_off() };

    ctx.proc_mut().trap_frame_mut().kernel_hartid = cpu::cpuid() as u64;

    let mut timer = false;
    match cause {
        Scause::Ecall => {
            // system call
            if ctx.proc().killed() {
                ctx.kernel().procs().exit_current(-1, ctx);
            }

            // epc points to the ecall instruction, but we want to return to
            // the next instruction.
            ctx.proc_mut().trap_frame_mut().epc += INSN_SIZE as u64;

            // An interrupt will clobber trap state, so only enable now that
            // we are done with those registers.
            // SAFETY: no spinlock is held.
            unsafe { cpu::intr_on() };
            syscall(ctx);
        }
        Scause::StorePageFault(va) | Scause::LoadPageFault(va)
        | Scause::InstructionPageFault(va) => {
            let access = match cause {
                Scause::StorePageFault(_) => AccessType::Write,
                Scause::LoadPageFault(_) => AccessType::Read,
                _ => AccessType::Exec,
            };
            let stack_floor = ctx.proc().trap_frame().sp as usize;
            let kmem = ctx.kernel().kmem();
            if ctx
                .proc_mut()
                .memory_mut()
                .handle_fault(UVAddr::new(va), access, stack_floor, kmem)
                .is_err()
            {
                log::warn!(
                    "usertrap: unexpected {:?} va={:#x} pid={}",
                    cause,
                    va,
                    ctx.proc().pid()
                );
                ctx.proc().kill();
            }
        }
        Scause::TimerIntr => {
            // The hart consumed its pending flag on the way out of user
            // mode; hart 0 drives the global clock.
            if cpu::cpuid() == 0 {
                ctx.kernel().clockintr();
            }
            timer = true;
        }
        Scause::IllegalInstruction(epc) => {
            log::warn!(
                "usertrap: illegal instruction epc={:#x} pid={}",
                epc,
                ctx.proc().pid()
            );
            ctx.proc().kill();
        }
    }

    if ctx.proc().killed() {
        ctx.kernel().procs().exit_current(-1, ctx);
    }

    // give up the hart if this was a timer interrupt
    if timer {
        ctx.yield_cpu();
    }
}
