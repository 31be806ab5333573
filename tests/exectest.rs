//! exec: image loading, argument passing through the fresh user stack, and
//! console output all the way out of the machine.

mod common;

use kestrel::image::single_segment_image;
use kestrel::kernel::KernelConfig;
use kestrel::proc::Reg::*;
use kestrel::syscall::*;
use kestrel::umode::Asm;

/// /init execs /hello with argv ["/hello", "mind the gap"]; /hello finds
/// argv[1] on its stack and writes it to the console.
#[test]
fn exec_passes_argv_and_console_collects_output() {
    // /hello: a0 = argc, a1 = argv
    let mut h = Asm::new();
    let fail = h.new_label();

    h.li(T0, 2);
    h.bne(A0, T0, fail);
    h.ld(S0, A1, 8); // argv[1]
    // strlen
    h.addi(T0, S0, 0);
    h.li(S1, 0);
    let len_loop = h.here();
    let len_done = h.new_label();
    h.lb(T1, T0, 0);
    h.beq(T1, Zero, len_done);
    h.addi(T0, T0, 1);
    h.addi(S1, S1, 1);
    h.jmp(len_loop);
    h.bind(len_done);
    // write(1, argv[1], len)
    h.li(A0, 1);
    h.addi(A1, S0, 0);
    h.addi(A2, S1, 0);
    h.li(A7, SYS_WRITE as i64);
    h.ecall();
    h.li(A0, 0);
    h.li(A7, SYS_POWEROFF as i64);
    h.ecall();
    h.bind(fail);
    h.li(A0, 1);
    h.li(A7, SYS_POWEROFF as i64);
    h.ecall();
    let hello = single_segment_image(&h.finish());

    // /init: build argv in its data area and exec /hello
    let mut a = Asm::new();
    let path = a.data_label(b"/hello\0");
    let arg = a.data_label(b"mind the gap\0");
    let argv = a.data_label(&[0u8; 24]);

    a.la(T0, argv);
    a.la(T1, path);
    a.sd(T0, 0, T1);
    a.la(T1, arg);
    a.sd(T0, 8, T1);
    // argv[2] stays 0
    a.la(A0, path);
    a.addi(A1, T0, 0);
    a.li(A7, SYS_EXEC as i64);
    a.ecall();
    // exec only returns on failure
    a.li(A0, 9);
    a.li(A7, SYS_POWEROFF as i64);
    a.ecall();

    let mut machine = common::boot_with_init(
        a.finish(),
        KernelConfig::default(),
        vec![("/hello", hello)],
    );
    assert_eq!(machine.run(), 0);
    assert_eq!(machine.console(), b"mind the gap".to_vec());
}

/// exec of a missing path or a corrupt image fails with -1 and leaves the
/// caller running.
#[test]
fn exec_failure_leaves_caller_intact() {
    let mut a = Asm::new();
    let fail = a.new_label();
    let missing = a.data_label(b"/nonesuch\0");
    let corrupt = a.data_label(b"/corrupt\0");

    a.la(A0, missing);
    a.li(A1, 0);
    a.li(A7, SYS_EXEC as i64);
    a.ecall();
    a.li(T0, -1);
    a.bne(A0, T0, fail);

    a.la(A0, corrupt);
    a.li(A1, 0);
    a.li(A7, SYS_EXEC as i64);
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

    let mut machine = common::boot_with_init(
        a.finish(),
        KernelConfig::default(),
        vec![("/corrupt", b"this is not an image at all".to_vec())],
    );
    assert_eq!(machine.run(), 0);
}
