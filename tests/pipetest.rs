//! Producer/consumer pairs over pipes across multiple harts: the sleep and
//! wakeup rendezvous under real contention. Each pair pushes more bytes than
//! the pipe buffer holds, so both sides sleep and wake repeatedly; the byte
//! pattern catches lost or duplicated wakeup-driven transfers.

mod common;

use std::time::Duration;

use kestrel::kernel::KernelConfig;
use kestrel::proc::Reg::*;
use kestrel::syscall::*;
use kestrel::umode::Asm;

const NBYTES: i64 = 2000;
const NPAIRS: i64 = 3;

#[test]
fn producer_consumer_pairs() {
    let mut a = Asm::new();
    let fail = a.new_label();
    let producer = a.new_label();
    let cons_eof = a.new_label();
    let cons_bad = a.new_label();

    a.li(S0, 0); // pair counter
    let pair = a.here();

    // pipe(&fds) at sp-16; fds are two little-endian i32s
    a.addi(A0, Sp, -16);
    a.li(A7, SYS_PIPE as i64);
    a.ecall();
    a.bne(A0, Zero, fail);
    a.lb(S1, Sp, -16); // read end
    a.lb(S2, Sp, -12); // write end

    a.li(A7, SYS_FORK as i64);
    a.ecall();
    a.bne(A0, Zero, producer);

    // consumer: drop the write end so EOF can arrive
    a.addi(A0, S2, 0);
    a.li(A7, SYS_CLOSE as i64);
    a.ecall();
    a.li(S3, 0); // received
    a.li(S4, 0); // expected byte value
    let cons_loop = a.here();
    a.addi(A0, S1, 0);
    a.addi(A1, Sp, -24);
    a.li(A2, 1);
    a.li(A7, SYS_READ as i64);
    a.ecall();
    a.beq(A0, Zero, cons_eof);
    a.lb(T0, Sp, -24);
    a.bne(T0, S4, cons_bad);
    a.addi(S4, S4, 1);
    let no_wrap = a.new_label();
    a.li(T1, 256);
    a.bne(S4, T1, no_wrap);
    a.li(S4, 0);
    a.bind(no_wrap);
    a.addi(S3, S3, 1);
    a.jmp(cons_loop);
    a.bind(cons_eof);
    a.li(T0, NBYTES);
    a.bne(S3, T0, cons_bad);
    a.li(A0, 0);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();
    a.bind(cons_bad);
    a.li(A0, 1);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();

    // producer: drop the read end, push the pattern, close, reap
    a.bind(producer);
    a.addi(A0, S1, 0);
    a.li(A7, SYS_CLOSE as i64);
    a.ecall();
    a.li(S3, 0); // sent
    a.li(S4, 0); // byte value
    let prod_loop = a.here();
    a.sb(Sp, -24, S4);
    a.addi(A0, S2, 0);
    a.addi(A1, Sp, -24);
    a.li(A2, 1);
    a.li(A7, SYS_WRITE as i64);
    a.ecall();
    a.li(T0, 1);
    a.bne(A0, T0, fail);
    a.addi(S4, S4, 1);
    let p_no_wrap = a.new_label();
    a.li(T1, 256);
    a.bne(S4, T1, p_no_wrap);
    a.li(S4, 0);
    a.bind(p_no_wrap);
    a.addi(S3, S3, 1);
    a.li(T0, NBYTES);
    a.blt(S3, T0, prod_loop);

    a.addi(A0, S2, 0);
    a.li(A7, SYS_CLOSE as i64);
    a.ecall();
    a.addi(A0, Sp, -32);
    a.li(A7, SYS_WAIT as i64);
    a.ecall();
    a.ld(T0, Sp, -32);
    a.bne(T0, Zero, fail);

    a.addi(S0, S0, 1);
    a.li(T1, NPAIRS);
    a.blt(S0, T1, pair);
    a.li(A0, 0);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();
    a.bind(fail);
    a.li(A0, 1);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    let config = KernelConfig {
        ncpu: 4,
        tick_interval: Some(Duration::from_millis(1)),
        ..KernelConfig::default()
    };
    let mut machine = common::boot_with_init(a.finish(), config, vec![]);
    assert_eq!(machine.run(), 0);
}

/// Reading from a pipe whose writer vanished without writing yields EOF,
/// not a hang: exit tears open files down like close does.
#[test]
fn reader_sees_eof_when_writer_exits() {
    let mut a = Asm::new();
    let fail = a.new_label();
    let parent = a.new_label();

    a.addi(A0, Sp, -16);
    a.li(A7, SYS_PIPE as i64);
    a.ecall();
    a.bne(A0, Zero, fail);
    a.lb(S1, Sp, -16);
    a.lb(S2, Sp, -12);

    a.li(A7, SYS_FORK as i64);
    a.ecall();
    a.bne(A0, Zero, parent);
    // child: exit immediately; its copy of both ends closes with it
    a.li(A0, 0);
    a.li(A7, SYS_EXIT as i64);
    a.ecall();

    a.bind(parent);
    // drop our own write end, then read: must return 0 (EOF), not block
    a.addi(A0, S2, 0);
    a.li(A7, SYS_CLOSE as i64);
    a.ecall();
    a.addi(A0, S1, 0);
    a.addi(A1, Sp, -24);
    a.li(A2, 1);
    a.li(A7, SYS_READ as i64);
    a.ecall();
    a.bne(A0, Zero, fail);
    // reap the child
    a.li(A0, 0);
    a.li(A7, SYS_WAIT as i64);
    a.ecall();
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
