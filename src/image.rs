//! Format of a loadable program image.
//!
//! A header names the entry point and a sequence of loadable segments; each
//! segment gives a virtual address, an offset into the image, a file-backed
//! length, and a total in-memory length whose tail beyond `filesz` is
//! zero-filled by the loader.

use zerocopy::{AsBytes, FromBytes};

use crate::riscv::PGSIZE;

pub const IMAGE_MAGIC: u32 = 0x6b65_7331;

/// Image file header.
#[derive(Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
pub struct ImageHdr {
    pub magic: u32,
    pub pad: u32,
    /// Initial program counter.
    pub entry: u64,
    /// Number of `SegHdr`s following this header.
    pub nseg: u64,
}

/// Loadable segment header.
#[derive(Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
pub struct SegHdr {
    /// Where the segment lives in the address space; page-aligned.
    pub vaddr: u64,
    /// Offset of the segment's bytes within the image file.
    pub off: u64,
    /// Bytes present in the file.
    pub filesz: u64,
    /// Bytes in memory; `memsz >= filesz`, remainder zero-filled.
    pub memsz: u64,
}

/// Wrap a single blob of code+data, loaded at address zero with entry zero.
/// The in-memory size is rounded up a page so small programs get a little
/// zeroed scratch space above their data.
pub fn single_segment_image(code: &[u8]) -> Vec<u8> {
    let hdr = ImageHdr {
        magic: IMAGE_MAGIC,
        pad: 0,
        entry: 0,
        nseg: 1,
    };
    let off = core::mem::size_of::<ImageHdr>() + core::mem::size_of::<SegHdr>();
    let seg = SegHdr {
        vaddr: 0,
        off: off as u64,
        filesz: code.len() as u64,
        memsz: ((code.len() + PGSIZE - 1) & !(PGSIZE - 1)) as u64,
    };
    let mut out = Vec::with_capacity(off + code.len());
    out.extend_from_slice(hdr.as_bytes());
    out.extend_from_slice(seg.as_bytes());
    out.extend_from_slice(code);
    out
}
