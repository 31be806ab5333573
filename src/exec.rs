//! Replace the current process image with one loaded from storage.
//!
//! The new address space is built completely before the old one is touched,
//! so any failure leaves the caller running its old program with a plain
//! error return. Segments are mapped eagerly; the heap above them stays
//! lazy. The stack is one page with a guard page below it, argv strings
//! copied on top, xv6 style.

use core::mem;

use arrayvec::ArrayVec;
use scopeguard::ScopeGuard;
use zerocopy::FromBytes;

use crate::addr::{PAddr, UVAddr};
use crate::fs::read_exact;
use crate::image::{ImageHdr, SegHdr, IMAGE_MAGIC};
use crate::param::{MAXARG, MAXPATH};
use crate::proc::{self, KernelCtx};
use crate::riscv::{pgroundup, PGSIZE};
use crate::vm::UserMemory;

pub fn exec(ctx: &mut KernelCtx<'_>, path: &str, argv_addr: UVAddr) -> Result<usize, ()> {
    let kernel = ctx.kernel();
    let kmem = kernel.kmem();
    let storage = kernel.storage();
    let handle = storage.resolve_path(path).ok_or(())?;

    // Check the image header.
    let mut hdr_bytes = [0u8; mem::size_of::<ImageHdr>()];
    read_exact(storage, handle, &mut hdr_bytes, 0)?;
    let hdr = ImageHdr::read_from(&hdr_bytes[..]).ok_or(())?;
    if hdr.magic != IMAGE_MAGIC {
        return Err(());
    }

    // Build the new address space around the existing trap frame page; it
    // is torn down wholesale if anything below fails.
    let trap_frame = PAddr::new(ctx.proc().deref_data().trap_frame as usize);
    let memory = UserMemory::new(trap_frame, None, kmem).ok_or(())?;
    let mut memory = scopeguard::guard(memory, |memory| memory.free(kmem));

    // Load each segment.
    let mut sz = 0;
    for i in 0..hdr.nseg as usize {
        let mut seg_bytes = [0u8; mem::size_of::<SegHdr>()];
        let off = mem::size_of::<ImageHdr>() + i * mem::size_of::<SegHdr>();
        read_exact(storage, handle, &mut seg_bytes, off)?;
        let seg = SegHdr::read_from(&seg_bytes[..]).ok_or(())?;

        if seg.memsz < seg.filesz {
            return Err(());
        }
        if seg.vaddr.checked_add(seg.memsz).is_none() {
            return Err(());
        }
        if seg.vaddr as usize % PGSIZE != 0 {
            return Err(());
        }
        sz = memory.alloc_range(sz, (seg.vaddr + seg.memsz) as usize, kmem)?;

        // Copy the file-backed part in; alloc_range already zeroed the rest.
        let mut buf = [0u8; PGSIZE];
        let mut done = 0;
        while done < seg.filesz as usize {
            let n = core::cmp::min(PGSIZE, seg.filesz as usize - done);
            read_exact(storage, handle, &mut buf[..n], seg.off as usize + done)?;
            memory.copy_out(UVAddr::new(seg.vaddr as usize + done), &buf[..n], kmem)?;
            done += n;
        }
    }

    // Two more pages: the first is the stack guard (inaccessible to user
    // code), the second the user stack.
    sz = pgroundup(sz);
    sz = memory.alloc_range(sz, sz + 2 * PGSIZE, kmem)?;
    memory.clear_user(sz - 2 * PGSIZE);
    let stackbase = sz - PGSIZE;
    memory.set_stack_base(stackbase);
    let mut sp = sz;

    // Push argument strings, then the array of argv[] pointers.
    let mut ustack = ArrayVec::<u64, { MAXARG + 1 }>::new();
    if !argv_addr.is_null() {
        for i in 0.. {
            if i >= MAXARG {
                return Err(());
            }
            let uarg = ctx.fetchaddr(argv_addr.plus(i * mem::size_of::<usize>()))?;
            if uarg == 0 {
                break;
            }
            let mut buf = [0u8; MAXPATH];
            let arg = ctx.fetchstr(UVAddr::new(uarg), &mut buf)?;

            sp -= arg.len() + 1;
            sp &= !7; // keep loads/stores aligned
            if sp < stackbase {
                return Err(());
            }
            memory.copy_out(UVAddr::new(sp), arg.as_bytes(), kmem)?;
            memory.copy_out(UVAddr::new(sp + arg.len()), &[0], kmem)?;
            ustack.push(sp as u64);
        }
    }
    ustack.push(0);
    let argc = ustack.len() - 1;

    sp -= ustack.len() * 8;
    if sp < stackbase {
        return Err(());
    }
    let mut argv_bytes = Vec::with_capacity(ustack.len() * 8);
    for p in &ustack {
        argv_bytes.extend_from_slice(&p.to_le_bytes());
    }
    memory.copy_out(UVAddr::new(sp), &argv_bytes, kmem)?;

    // Commit to the new image.
    let memory = ScopeGuard::into_inner(memory);
    let last = path.rsplit('/').next().unwrap_or(path);
    let data = ctx.proc_mut().deref_mut_data();
    proc::set_proc_name(data, last.as_bytes());
    let old = mem::replace(&mut data.memory, mem::MaybeUninit::new(memory));
    // SAFETY: the old memory was initialized (the process was running it).
    unsafe { old.assume_init() }.free(kmem);

    let tf = ctx.proc_mut().trap_frame_mut();
    tf.epc = hdr.entry;
    tf.sp = sp as u64;
    tf.a1 = sp as u64;

    // the syscall return value lands in a0: argc
    Ok(argc)
}
