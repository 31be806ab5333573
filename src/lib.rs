//! kestrel: a time-sharing kernel for an emulated multi-hart RISC-V-class
//! machine.
//!
//! The kernel core is the real thing — Sv39 page tables in allocator pages,
//! copy-on-write fork with a per-page reference count table, lazily grown
//! heaps, a fixed process table with per-slot spinlocks, per-hart scheduler
//! loops and sleep/wakeup rendezvous. The hardware under it is emulated:
//! harts are host threads, the context switch is a thread hand-off, and
//! user mode is a small fixed-width instruction set interpreted against the
//! process's own address space, so page faults, preemption and system calls
//! all cross the same boundaries they would on metal.
//!
//! Boot a machine with [`kernel::Machine::boot`], giving it a
//! [`fs::MemFs`] holding an image for `/init` (see [`image`] and
//! [`umode::Asm`]), then [`kernel::Machine::run`] it until some process
//! calls the poweroff system call.

pub mod addr;
pub mod cpu;
pub mod exec;
pub mod file;
pub mod fs;
pub mod image;
pub mod kalloc;
pub mod kernel;
pub mod lock;
pub mod memlayout;
pub mod page;
pub mod param;
pub mod pipe;
pub mod proc;
pub mod riscv;
pub mod swtch;
pub mod syscall;
mod sysfile;
mod sysproc;
pub mod trap;
pub mod umode;
pub mod vm;
