//! Process lifecycle, driven by real user programs: fork return values and
//! pid allocation, wait with and without children, cooperative kill, and
//! tick sleeping.

mod common;

use kestrel::kernel::KernelConfig;
use kestrel::proc::Reg::*;
use kestrel::syscall::*;
use kestrel::umode::Asm;

/// 100 consecutive fork/wait rounds: the child must observe 0, the parent a
/// strictly increasing pid (no reuse before the wait), and each child's exit
/// status must come back intact.
#[test]
fn fork_returns_and_pids_are_monotonic() {
    let mut a = Asm::new();
    let fail = a.new_label();
    let parent = a.new_label();
    let pid_ok = a.new_label();

    a.li(S0, 0); // round counter
    a.li(S1, 0); // last pid seen
    let round = a.here();
    a.li(A7, SYS_FORK as i64);
    a.ecall();
    a.bne(A0, Zero, parent);
    // child: exit(7)
    a.li(A0, 7);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();
    a.bind(parent);
    // pids must grow: last < pid
    a.blt(S1, A0, pid_ok);
    a.jmp(fail);
    a.bind(pid_ok);
    a.addi(S1, A0, 0);
    // wait(&status)
    a.addi(A0, Sp, -16);
    a.li(A7, SYS_WAIT as i64);
    a.ecall();
    a.bne(A0, S1, fail);
    a.ld(T0, Sp, -16);
    a.li(T1, 7);
    a.bne(T0, T1, fail);
    a.addi(S0, S0, 1);
    a.li(T2, 100);
    a.blt(S0, T2, round);
    a.li(A0, 0);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();
    a.bind(fail);
    a.li(A0, 1);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    let mut machine = common::boot_with_init(a.finish(), KernelConfig::default(), vec![]);
    assert_eq!(machine.run(), 0);
}

/// wait() with no children must fail immediately, not block.
#[test]
fn wait_without_children_errors() {
    let mut a = Asm::new();
    let fail = a.new_label();

    a.li(A0, 0);
    a.li(A7, SYS_WAIT as i64);
    a.ecall();
    a.li(T0, -1);
    a.bne(A0, T0, fail);
    a.li(A0, 0);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();
    a.bind(fail);
    a.li(A0, 1);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    let mut machine = common::boot_with_init(a.finish(), KernelConfig::default(), vec![]);
    assert_eq!(machine.run(), 0);
}

/// Killing a sleeping child makes it runnable and it exits with status -1
/// the next time it would reach user mode; the parent reaps it via wait.
#[test]
fn kill_sleeping_child() {
    let mut a = Asm::new();
    let fail = a.new_label();
    let parent = a.new_label();

    a.li(A7, SYS_FORK as i64);
    a.ecall();
    a.bne(A0, Zero, parent);
    // child: sleep essentially forever
    a.li(A0, 100_000);
    a.li(A7, SYS_SLEEP as i64);
    a.ecall();
    // only reached if the kill never lands
    a.li(A0, 5);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();

    a.bind(parent);
    a.addi(S0, A0, 0);
    // let the child fall asleep
    a.li(A0, 3);
    a.li(A7, SYS_SLEEP as i64);
    a.ecall();
    a.addi(A0, S0, 0);
    a.li(A7, SYS_KILL as i64);
    a.ecall();
    a.bne(A0, Zero, fail);
    a.addi(A0, Sp, -16);
    a.li(A7, SYS_WAIT as i64);
    a.ecall();
    a.bne(A0, S0, fail);
    // status -1 reads back as 0xffffffff (4 status bytes, 4 zeroed)
    a.ld(T0, Sp, -16);
    a.li(T1, 0xffff_ffff);
    a.bne(T0, T1, fail);
    a.li(A0, 0);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();
    a.bind(fail);
    a.li(A0, 1);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    let mut machine = common::boot_with_init(a.finish(), KernelConfig::default(), vec![]);
    assert_eq!(machine.run(), 0);
}

/// sleep(n) must not return before n ticks have elapsed.
#[test]
fn sleep_advances_ticks() {
    let mut a = Asm::new();
    let fail = a.new_label();

    a.li(A7, SYS_UPTIME as i64);
    a.ecall();
    a.addi(S0, A0, 0);
    a.li(A0, 3);
    a.li(A7, SYS_SLEEP as i64);
    a.ecall();
    a.li(A7, SYS_UPTIME as i64);
    a.ecall();
    a.addi(T0, S0, 3);
    a.blt(A0, T0, fail);
    a.li(A0, 0);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();
    a.bind(fail);
    a.li(A0, 1);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    let mut machine = common::boot_with_init(a.finish(), KernelConfig::default(), vec![]);
    assert_eq!(machine.run(), 0);
}
