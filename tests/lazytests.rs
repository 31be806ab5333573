//! Lazy heap allocation, end to end: a gigabyte reservation on a machine
//! with a few megabytes of memory, sparse touches, and the sbrk shrink
//! guard rails.

mod common;

use kestrel::kernel::KernelConfig;
use kestrel::proc::Reg::*;
use kestrel::syscall::*;
use kestrel::umode::Asm;

#[test]
fn gigabyte_reservation_with_sparse_touches() {
    let mut a = Asm::new();
    let fail = a.new_label();

    // shrinking below the stack must fail up front
    a.li(A0, -8192);
    a.li(A7, SYS_SBRK as i64);
    a.ecall();
    a.li(T0, -1);
    a.bne(A0, T0, fail);

    // reserve 1 GiB; the machine only has a few MiB of real memory, so this
    // works only if nothing is materialized yet
    a.li(A0, 0x4000_0000);
    a.li(A7, SYS_SBRK as i64);
    a.ecall();
    a.li(T0, -1);
    a.beq(A0, T0, fail);
    a.addi(S0, A0, 0); // base of the reservation

    // touch every 64th page: write round+1, read it back
    a.addi(S2, S0, 0); // cursor
    a.li(S1, 0); // round
    let touch = a.here();
    a.addi(T1, S1, 1);
    a.sd(S2, 0, T1);
    a.ld(T2, S2, 0);
    a.bne(T2, T1, fail);
    a.addi(S2, S2, 64 * 4096);
    a.addi(S1, S1, 1);
    a.li(T3, 32);
    a.blt(S1, T3, touch);

    // the first touched page still holds its value
    a.ld(T2, S0, 0);
    a.li(T1, 1);
    a.bne(T2, T1, fail);

    a.li(A0, 0);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();
    a.bind(fail);
    a.li(A0, 1);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    let config = KernelConfig {
        mem_pages: 2048, // 8 MiB of "physical" memory
        ..KernelConfig::default()
    };
    let mut machine = common::boot_with_init(a.finish(), config, vec![]);
    assert_eq!(machine.run(), 0);
}

/// A fault below the reservation (or beyond it) kills the process instead
/// of materializing memory; init reaps the victim with an abnormal status.
#[test]
fn wild_access_kills_only_the_offender() {
    let mut a = Asm::new();
    let fail = a.new_label();
    let parent = a.new_label();

    a.li(A7, SYS_FORK as i64);
    a.ecall();
    a.bne(A0, Zero, parent);
    // child: read far past its address space
    a.li(T0, 0x3f00_0000_0000);
    a.ld(T1, T0, 0);
    // unreachable: the fault kills us
    a.li(A0, 0);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();

    a.bind(parent);
    a.addi(S0, A0, 0);
    a.addi(A0, Sp, -16);
    a.li(A7, SYS_WAIT as i64);
    a.ecall();
    a.bne(A0, S0, fail);
    // abnormal termination: status -1
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
