//! User address space layout.
//!
//! User memory starts at virtual address zero and grows up: text and data,
//! then a guard page, the stack, and the lazily-populated heap. The trap
//! frame sits in a page by itself at the highest usable virtual address, in
//! every process's page table, so the trap entry path can always find it.

use crate::riscv::{MAXVA, PGSIZE};

/// The trap frame page, mapped (non-user-accessible) at the same virtual
/// address in every user page table.
pub const TRAPFRAME: usize = MAXVA - PGSIZE;
