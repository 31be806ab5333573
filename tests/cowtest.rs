//! Byte-level copy-on-write isolation around a fork, end to end: the parent
//! writes after forking, the child must keep seeing the pre-fork value, and
//! the child's own write must never leak back into the parent.

mod common;

use kestrel::kernel::KernelConfig;
use kestrel::proc::Reg::*;
use kestrel::syscall::*;
use kestrel::umode::Asm;

#[test]
fn fork_write_isolation() {
    let mut a = Asm::new();
    let fail = a.new_label();
    let parent = a.new_label();
    let child_fail = a.new_label();
    let cell = a.data_label(&[0u8; 8]);

    // the shared byte starts as 'A'
    a.la(S0, cell);
    a.li(T0, 0x41);
    a.sb(S0, 0, T0);

    a.li(A7, SYS_FORK as i64);
    a.ecall();
    a.bne(A0, Zero, parent);

    // child: must see the pre-write value no matter who ran first, then its
    // own write must stick locally
    a.lb(T1, S0, 0);
    a.li(T2, 0x41);
    a.bne(T1, T2, child_fail);
    a.li(T0, 0x43);
    a.sb(S0, 0, T0);
    a.lb(T1, S0, 0);
    a.li(T2, 0x43);
    a.bne(T1, T2, child_fail);
    a.li(A0, 0);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();
    a.bind(child_fail);
    a.li(A0, 1);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();

    // parent: write 'B' over the shared page, reap the child, and check the
    // child's write never surfaced here
    a.bind(parent);
    a.li(T0, 0x42);
    a.sb(S0, 0, T0);
    a.addi(A0, Sp, -16);
    a.li(A7, SYS_WAIT as i64);
    a.ecall();
    a.ld(T0, Sp, -16);
    a.bne(T0, Zero, fail);
    a.lb(T1, S0, 0);
    a.li(T2, 0x42);
    a.bne(T1, T2, fail);
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

/// Deep fork chains share pages transitively; every level must see its own
/// private value after writing.
#[test]
fn nested_forks_stay_isolated() {
    let mut a = Asm::new();
    let fail = a.new_label();
    let reap = a.new_label();
    let cell = a.data_label(&[0u8; 8]);

    // S2 = depth (0..4); each level writes depth+1 into the cell, forks,
    // then checks its own value survived the child's writes.
    a.la(S0, cell);
    a.li(S2, 0);
    let level = a.here();
    a.addi(T0, S2, 1);
    a.sb(S0, 0, T0);
    a.li(A7, SYS_FORK as i64);
    a.ecall();
    a.bne(A0, Zero, reap);
    // child: next level down
    a.addi(S2, S2, 1);
    a.li(T1, 4);
    a.blt(S2, T1, level);
    // deepest child just exits clean
    a.li(A0, 0);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();

    a.bind(reap);
    a.addi(A0, Sp, -16);
    a.li(A7, SYS_WAIT as i64);
    a.ecall();
    a.ld(T0, Sp, -16);
    a.bne(T0, Zero, fail);
    // our value must still be depth+1
    a.lb(T1, S0, 0);
    a.addi(T2, S2, 1);
    a.bne(T1, T2, fail);
    // inner levels report upward via exit; the root powers off
    let root_done = a.new_label();
    a.beq(S2, Zero, root_done);
    a.li(A0, 0);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();
    a.bind(root_done);
    a.li(A0, 0);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    a.bind(fail);
    let root_fail = a.new_label();
    a.beq(S2, Zero, root_fail);
    a.li(A0, 1);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();
    a.bind(root_fail);
    a.li(A0, 1);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    let mut machine = common::boot_with_init(a.finish(), KernelConfig::default(), vec![]);
    assert_eq!(machine.run(), 0);
}
