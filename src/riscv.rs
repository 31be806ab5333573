//! Sv39 paging format of the emulated machine.
//!
//! The layout is the real RISC-V Sv39 one: a 64-bit PTE holds a 44-bit PPN
//! shifted left by 10, flag bits below, and the two RSW bits are available to
//! software (we use one of them to mark copy-on-write mappings).

use bitflags::bitflags;

use crate::addr::PAddr;

/// bytes per page
pub const PGSIZE: usize = 4096;

/// bits of offset within a page
pub const PGSHIFT: usize = 12;

/// one beyond the highest possible virtual address.
/// MAXVA is actually one bit less than the max allowed by
/// Sv39, to avoid having to sign-extend virtual addresses
/// that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

pub const fn pgroundup(sz: usize) -> usize {
    sz.wrapping_add(PGSIZE).wrapping_sub(1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

bitflags! {
    /// Page-table entry flag bits.
    pub struct PteFlags: usize {
        /// valid
        const V = 1 << 0;
        /// readable
        const R = 1 << 1;
        /// writable
        const W = 1 << 2;
        /// executable
        const X = 1 << 3;
        /// user-accessible
        const U = 1 << 4;
        /// copy-on-write shared (RSW bit 8, reserved for software)
        const C = 1 << 8;
    }
}

/// Raw page-table entry.
pub type PteT = usize;

const PTE_FLAG_MASK: usize = 0x3ff;

/// shift a physical address to the right place for a PTE.
pub fn pa2pte(pa: PAddr) -> PteT {
    (pa.into_usize() >> 12) << 10
}

pub fn pte2pa(pte: PteT) -> PAddr {
    PAddr::new((pte >> 10) << 12)
}

pub fn pte_flags(pte: PteT) -> PteFlags {
    PteFlags::from_bits_truncate(pte & PTE_FLAG_MASK)
}

/// extract the three 9-bit page table indices from a virtual address.
const PXMASK: usize = 0x1ff;

const fn pxshift(level: usize) -> usize {
    PGSHIFT + 9 * level
}

pub const fn px(level: usize, va: usize) -> usize {
    (va >> pxshift(level)) & PXMASK
}
