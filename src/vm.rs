//! Virtual memory: Sv39 three-level page tables and per-process address
//! spaces.
//!
//! Page-table pages live in allocator pages, exactly as on hardware; leaf
//! entries may share physical pages with another address space under
//! copy-on-write, tracked by the allocator's reference counts. Absent leaf
//! entries inside `[0, size)` are legal: the heap is populated lazily on
//! first touch, so every routine that walks a range must skip holes rather
//! than fail.

use core::cmp;
use core::mem;
use core::ptr;
use core::slice;

use num_iter::range_step;

use crate::addr::{PAddr, UVAddr};
use crate::kalloc::Kmem;
use crate::lock::Spinlock;
use crate::memlayout::TRAPFRAME;
use crate::riscv::{
    pa2pte, pgrounddown, pgroundup, pte2pa, pte_flags, px, PteFlags, PteT, MAXVA, PGSIZE,
};
use crate::page::Page;

/// The kind of access that faulted or is about to be performed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessType {
    Read,
    Write,
    Exec,
}

impl AccessType {
    fn required(self) -> PteFlags {
        match self {
            AccessType::Read => PteFlags::R,
            AccessType::Write => PteFlags::W,
            AccessType::Exec => PteFlags::X,
        }
    }
}

#[derive(Default)]
#[repr(transparent)]
pub struct PageTableEntry {
    inner: PteT,
}

impl PageTableEntry {
    fn get_flags(&self) -> PteFlags {
        pte_flags(self.inner)
    }

    fn check_flag(&self, flag: PteFlags) -> bool {
        self.get_flags().contains(flag)
    }

    fn set_flag(&mut self, flag: PteFlags) {
        self.inner |= flag.bits();
    }

    fn clear_flag(&mut self, flag: PteFlags) {
        self.inner &= !flag.bits();
    }

    fn set_inner(&mut self, inner: PteT) {
        self.inner = inner;
    }

    fn get_pa(&self) -> PAddr {
        pte2pa(self.inner)
    }

    /// A valid entry without R/W/X is a pointer to the next-level table.
    fn is_table(&self) -> bool {
        self.check_flag(PteFlags::V)
            && !self.check_flag(PteFlags::R)
            && !self.check_flag(PteFlags::W)
            && !self.check_flag(PteFlags::X)
    }
}

const PTE_PER_PT: usize = PGSIZE / mem::size_of::<PageTableEntry>();
static_assertions::const_assert_eq!(PTE_PER_PT, 512);

#[repr(transparent)]
struct RawPageTable {
    inner: [PageTableEntry; PTE_PER_PT],
}

/// A three-level Sv39 page table. Owns its root and intermediate table
/// pages; leaf pages are owned by the mappings (see `Kmem`'s refcounts).
pub struct PageTable {
    ptr: *mut RawPageTable,
}

impl PageTable {
    /// Create an empty page table. Returns None if the allocation fails.
    pub fn new(kmem: &Spinlock<Kmem>) -> Option<Self> {
        let mut page = kmem.lock().alloc()?;
        page.write_bytes(0);
        Some(Self {
            ptr: page.into_usize() as *mut RawPageTable,
        })
    }

    /// Return a pointer to the PTE in this page table that corresponds to
    /// virtual address va. If `alloc` is Some, create any required
    /// page-table pages.
    ///
    /// The risc-v Sv39 scheme has three levels of page-table pages. A
    /// page-table page contains 512 64-bit PTEs. A 64-bit virtual address is
    /// split into five fields:
    ///   39..63 -- must be zero.
    ///   30..38 -- 9 bits of level-2 index.
    ///   21..29 -- 9 bits of level-1 index.
    ///   12..20 -- 9 bits of level-0 index.
    ///    0..11 -- 12 bits of byte offset within the page.
    fn walk_ptr(&self, va: usize, alloc: Option<&Spinlock<Kmem>>) -> Option<*mut PageTableEntry> {
        assert!(va < MAXVA, "walk");
        let mut pagetable = self.ptr;
        for level in (1..3).rev() {
            // SAFETY: pagetable points at a valid page-table page of this
            // table, which we own.
            let pte = unsafe { &mut (*pagetable).inner[px(level, va)] };
            if pte.check_flag(PteFlags::V) {
                pagetable = pte.get_pa().into_usize() as *mut RawPageTable;
            } else {
                let kmem = alloc?;
                let mut page = kmem.lock().alloc()?;
                page.write_bytes(0);
                let pa = page.addr();
                // The page is now owned by this table; freed in free().
                let _ = page.into_usize();
                pte.set_inner(pa2pte(pa) | PteFlags::V.bits());
                pagetable = pa.into_usize() as *mut RawPageTable;
            }
        }
        // SAFETY: as above.
        Some(unsafe { &mut (*pagetable).inner[px(0, va)] as *mut PageTableEntry })
    }

    fn walk_mut(
        &mut self,
        va: usize,
        alloc: Option<&Spinlock<Kmem>>,
    ) -> Option<&mut PageTableEntry> {
        // SAFETY: the pointer is into this table's pages and &mut self makes
        // the access exclusive.
        self.walk_ptr(va, alloc).map(|p| unsafe { &mut *p })
    }

    fn walk_ref(&self, va: usize) -> Option<&PageTableEntry> {
        // SAFETY: the pointer is into this table's pages.
        self.walk_ptr(va, None).map(|p| unsafe { &*p })
    }

    /// Create PTEs for virtual addresses starting at va that refer to
    /// physical addresses starting at pa. va and size might not be
    /// page-aligned. Returns Err if walk() couldn't allocate a needed
    /// page-table page. Mapping over an existing entry is a kernel bug and
    /// panics: remap is never silently allowed.
    pub fn map(
        &mut self,
        va: usize,
        size: usize,
        mut pa: usize,
        perm: PteFlags,
        kmem: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        assert!(size > 0, "mappages: size");
        let mut a = pgrounddown(va);
        let last = pgrounddown(va + size - 1);
        loop {
            let pte = self.walk_mut(a, Some(kmem)).ok_or(())?;
            assert!(!pte.check_flag(PteFlags::V), "remap");
            pte.set_inner(pa2pte(PAddr::new(pa)) | perm.bits() | PteFlags::V.bits());
            if a == last {
                break;
            }
            a += PGSIZE;
            pa += PGSIZE;
        }
        Ok(())
    }

    /// Remove npages of mappings starting from va, optionally freeing
    /// (dropping a reference to) the physical memory. va must be
    /// page-aligned. Addresses that were never materialized under the lazy
    /// allocation policy are skipped, not errors.
    pub fn unmap(&mut self, va: usize, npages: usize, free: bool, kmem: &Spinlock<Kmem>) {
        assert!(va % PGSIZE == 0, "uvmunmap: not aligned");
        for a in range_step(va, va + npages * PGSIZE, PGSIZE) {
            let pte = match self.walk_mut(a, None) {
                Some(pte) => pte,
                // the intermediate table itself was never allocated
                None => continue,
            };
            if !pte.check_flag(PteFlags::V) {
                // a hole left by lazy allocation
                continue;
            }
            assert!(!pte.is_table(), "uvmunmap: not a leaf");
            if free {
                // SAFETY: the mapping owned a reference to this page.
                let page = unsafe { Page::from_usize(pte.get_pa().into_usize()) };
                kmem.lock().free(page);
            }
            pte.set_inner(0);
        }
    }

    /// Recursively free page-table pages.
    /// All leaf mappings must already have been removed.
    fn freewalk(pagetable: *mut RawPageTable, kmem: &Spinlock<Kmem>) {
        // There are 2^9 = 512 PTEs in a page table.
        for i in 0..PTE_PER_PT {
            // SAFETY: pagetable points at a valid page-table page.
            let pte = unsafe { &mut (*pagetable).inner[i] };
            if pte.is_table() {
                Self::freewalk(pte.get_pa().into_usize() as *mut RawPageTable, kmem);
                pte.set_inner(0);
            } else {
                assert!(!pte.check_flag(PteFlags::V), "freewalk: leaf");
            }
        }
        // SAFETY: the table page was allocated in walk()/new() and is owned
        // by this page table.
        let page = unsafe { Page::from_usize(pagetable as usize) };
        kmem.lock().free(page);
    }

    /// Free all page-table pages. Leaf mappings must be gone already.
    pub fn free(self, kmem: &Spinlock<Kmem>) {
        Self::freewalk(self.ptr, kmem);
    }
}

/// A process's address space: its page table, the byte count of valid user
/// addresses below the heap ceiling, and the floor of the stack region (the
/// guard page sits just below `stack_base`).
pub struct UserMemory {
    page_table: PageTable,
    size: usize,
    stack_base: usize,
}

// SAFETY: UserMemory is owned by one process and only touched by the thread
// currently running it (or by fork/exit holding the appropriate locks).
unsafe impl Send for UserMemory {}

impl UserMemory {
    /// Create an address space containing only the fixed trap-frame mapping,
    /// plus, if `initcode` is given, one page at address zero holding it.
    /// Returns None if an allocation fails.
    pub fn new(
        trap_frame: PAddr,
        initcode: Option<&[u8]>,
        kmem: &Spinlock<Kmem>,
    ) -> Option<Self> {
        let page_table = PageTable::new(kmem)?;
        let mut memory = Self {
            page_table,
            size: 0,
            stack_base: 0,
        };

        // The trap frame page is mapped high and without U: user code can
        // never touch it, but it has a fixed home in every address space.
        if memory
            .page_table
            .map(
                TRAPFRAME,
                PGSIZE,
                trap_frame.into_usize(),
                PteFlags::R | PteFlags::W,
                kmem,
            )
            .is_err()
        {
            memory.free(kmem);
            return None;
        }

        if let Some(src) = initcode {
            assert!(src.len() < PGSIZE, "inituvm: more than a page");
            // take the page in its own statement: the freeing paths below
            // need the allocator lock back
            let page = kmem.lock().alloc();
            let mut page = match page {
                Some(page) => page,
                None => {
                    memory.free(kmem);
                    return None;
                }
            };
            page.write_bytes(0);
            page[..src.len()].copy_from_slice(src);
            let pa = page.into_usize();
            if memory
                .page_table
                .map(
                    0,
                    PGSIZE,
                    pa,
                    PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                    kmem,
                )
                .is_err()
            {
                // SAFETY: we just took it out of the allocator.
                kmem.lock().free(unsafe { Page::from_usize(pa) });
                memory.free(kmem);
                return None;
            }
            memory.size = PGSIZE;
        }

        Some(memory)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    pub(crate) fn set_stack_base(&mut self, stack_base: usize) {
        self.stack_base = stack_base;
    }

    /// Duplicate this address space for a fork, sharing the leaf pages
    /// copy-on-write: the writable bit is stripped and the COW bit set on
    /// both sides, and each shared page gains a reference. Lazy holes stay
    /// holes in the child. Frees everything it built on failure; the parent
    /// is left valid either way.
    pub fn clone_cow(&mut self, trap_frame: PAddr, kmem: &Spinlock<Kmem>) -> Option<Self> {
        let mut new = Self::new(trap_frame, None, kmem)?;
        new.size = self.size;
        new.stack_base = self.stack_base;

        for va in range_step(0, self.size, PGSIZE) {
            let pte = match self.page_table.walk_mut(va, None) {
                Some(pte) => pte,
                None => continue,
            };
            if !pte.check_flag(PteFlags::V) {
                // never materialized; the child inherits the hole
                continue;
            }
            if pte.check_flag(PteFlags::W) {
                pte.clear_flag(PteFlags::W);
                pte.set_flag(PteFlags::C);
            }
            let pa = pte.get_pa();
            let flags = pte.get_flags();
            if new
                .page_table
                .map(va, PGSIZE, pa.into_usize(), flags & !PteFlags::V, kmem)
                .is_err()
            {
                // The child unmaps with free=true, handing back the
                // references taken so far.
                new.free(kmem);
                return None;
            }
            kmem.lock().share(pa);
        }
        Some(new)
    }

    /// Look up a virtual address for the given access, returning the
    /// physical address (offset included), or Err if the mapping is absent
    /// or lacks the permission. No repair happens here; this is the MMU.
    pub fn translate(&self, va: UVAddr, access: AccessType) -> Result<PAddr, ()> {
        let v = va.into_usize();
        if v >= MAXVA {
            return Err(());
        }
        let pte = self.page_table.walk_ref(pgrounddown(v)).ok_or(())?;
        if !pte.check_flag(PteFlags::V) || !pte.check_flag(PteFlags::U) {
            return Err(());
        }
        if !pte.check_flag(access.required()) {
            return Err(());
        }
        Ok(PAddr::new(pte.get_pa().into_usize() + (v - pgrounddown(v))))
    }

    /// Classify and repair a page fault at va: a write to a copy-on-write
    /// page gets a private copy (or the write bit back, if the faulting
    /// process is the sole owner); a touch of a never-materialized address
    /// below `size` and at or above `stack_floor` gets a fresh zeroed page;
    /// anything else is a genuine access violation and an error.
    pub fn handle_fault(
        &mut self,
        va: UVAddr,
        access: AccessType,
        stack_floor: usize,
        kmem: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        let v = va.into_usize();
        if v >= MAXVA {
            return Err(());
        }

        let cow = match self.page_table.walk_ref(pgrounddown(v)) {
            Some(pte) if pte.check_flag(PteFlags::V) => {
                if access == AccessType::Write
                    && pte.check_flag(PteFlags::U)
                    && pte.check_flag(PteFlags::C)
                {
                    true
                } else {
                    // present but not permitted (e.g. the stack guard page)
                    return Err(());
                }
            }
            _ => false,
        };
        if cow {
            self.resolve_write_fault(v, kmem)
        } else {
            self.resolve_lazy_fault(v, stack_floor, kmem)
        }
    }

    /// COW repair. The caller verified the leaf is a valid, user, COW page.
    fn resolve_write_fault(&mut self, va: usize, kmem: &Spinlock<Kmem>) -> Result<(), ()> {
        let pte = self.page_table.walk_mut(pgrounddown(va), None).ok_or(())?;
        let pa = pte.get_pa();

        let mut kmem_guard = kmem.lock();
        if kmem_guard.refcount(pa) > 1 {
            // Someone else still maps the page: break the share.
            let mut page = kmem_guard.alloc().ok_or(())?;
            // SAFETY: pa points at a whole mapped page in the arena.
            let src = unsafe { slice::from_raw_parts(pa.into_usize() as *const u8, PGSIZE) };
            page[..].copy_from_slice(src);

            let flags = (pte.get_flags() | PteFlags::W) & !PteFlags::C;
            let new_pa = page.into_usize();
            pte.set_inner(pa2pte(PAddr::new(new_pa)) | flags.bits());

            // Drop our reference to the shared page.
            // SAFETY: this mapping owned one reference.
            kmem_guard.free(unsafe { Page::from_usize(pa.into_usize()) });
        } else {
            // Sole remaining owner: just take the page private again.
            pte.set_flag(PteFlags::W);
            pte.clear_flag(PteFlags::C);
        }
        Ok(())
    }

    /// Lazy-allocation repair: materialize one zeroed page.
    fn resolve_lazy_fault(
        &mut self,
        va: usize,
        stack_floor: usize,
        kmem: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        if va >= self.size || va < stack_floor {
            return Err(());
        }
        let va0 = pgrounddown(va);
        let mut page = kmem.lock().alloc().ok_or(())?;
        page.write_bytes(0);
        let pa = page.into_usize();
        if self
            .page_table
            .map(
                va0,
                PGSIZE,
                pa,
                PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                kmem,
            )
            .is_err()
        {
            // SAFETY: we just took it out of the allocator.
            kmem.lock().free(unsafe { Page::from_usize(pa) });
            return Err(());
        }
        Ok(())
    }

    /// Allocate PTEs and physical memory to grow the address space from
    /// oldsz to newsz, which need not be page aligned, eagerly (used by
    /// exec). Updates `size` and returns it, or Err on allocation failure
    /// after rolling its own work back (`size` is then unchanged).
    pub fn alloc_range(
        &mut self,
        oldsz: usize,
        newsz: usize,
        kmem: &Spinlock<Kmem>,
    ) -> Result<usize, ()> {
        if newsz < oldsz {
            return Ok(oldsz);
        }
        let oldsz = pgroundup(oldsz);
        let mut a = oldsz;
        while a < newsz {
            // take the page in its own statement: the rollback path below
            // needs the allocator lock back
            let page = kmem.lock().alloc();
            let mut page = match page {
                Some(page) => page,
                None => {
                    self.dealloc(a, oldsz, kmem);
                    return Err(());
                }
            };
            page.write_bytes(0);
            let pa = page.into_usize();
            if self
                .page_table
                .map(
                    a,
                    PGSIZE,
                    pa,
                    PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                    kmem,
                )
                .is_err()
            {
                // SAFETY: we just took it out of the allocator.
                kmem.lock().free(unsafe { Page::from_usize(pa) });
                self.dealloc(a, oldsz, kmem);
                return Err(());
            }
            a += PGSIZE;
        }
        self.size = newsz;
        Ok(newsz)
    }

    /// Deallocate user pages to bring the process size from oldsz to newsz.
    /// oldsz and newsz need not be page-aligned. Returns the new size.
    pub fn dealloc(&mut self, oldsz: usize, newsz: usize, kmem: &Spinlock<Kmem>) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }
        let newup = pgroundup(newsz);
        if newup < pgroundup(oldsz) {
            self.page_table
                .unmap(newup, (pgroundup(oldsz) - newup) / PGSIZE, true, kmem);
        }
        newsz
    }

    /// Grow or shrink the heap by n bytes; growth is lazy (no pages are
    /// allocated until first touch), shrinking unmaps eagerly and refuses to
    /// cut below the user stack pointer. Returns the old size.
    pub fn resize(&mut self, n: i32, sp: usize, kmem: &Spinlock<Kmem>) -> Result<usize, ()> {
        let old = self.size;
        if n >= 0 {
            let new = old.checked_add(n as usize).ok_or(())?;
            if new > TRAPFRAME - PGSIZE {
                return Err(());
            }
            self.size = new;
        } else {
            let dec = n.unsigned_abs() as usize;
            if dec > old || old - dec < sp {
                return Err(());
            }
            self.size = self.dealloc(old, old - dec, kmem);
        }
        Ok(old)
    }

    /// Mark a PTE invalid for user access.
    /// Used by exec for the user stack guard page.
    pub fn clear_user(&mut self, va: usize) {
        self.page_table
            .walk_mut(va, None)
            .expect("uvmclear")
            .clear_flag(PteFlags::U);
    }

    /// Translate for an access from kernel code, repairing COW and lazy
    /// faults on the way, like the hardware path would have.
    fn translate_or_fix(
        &mut self,
        va: UVAddr,
        access: AccessType,
        kmem: &Spinlock<Kmem>,
    ) -> Result<PAddr, ()> {
        match self.translate(va, access) {
            Ok(pa) => Ok(pa),
            Err(()) => {
                let stack_floor = self.stack_base;
                self.handle_fault(va, access, stack_floor, kmem)?;
                self.translate(va, access)
            }
        }
    }

    /// Copy from kernel to user: copy `src` to virtual address dstva.
    /// Unmapped but in-bounds destination pages are materialized on the way;
    /// returns Err cleanly if the address range is out of bounds (bytes
    /// before the failing page stay written).
    pub fn copy_out(
        &mut self,
        dstva: UVAddr,
        mut src: &[u8],
        kmem: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        let mut dst = dstva.into_usize();
        while !src.is_empty() {
            let va0 = pgrounddown(dst);
            let pa0 = self
                .translate_or_fix(UVAddr::new(va0), AccessType::Write, kmem)?
                .into_usize();
            let n = cmp::min(PGSIZE - (dst - va0), src.len());
            // SAFETY: pa0 points at a whole mapped page in the arena.
            unsafe { ptr::copy(src.as_ptr(), (pa0 + (dst - va0)) as *mut u8, n) };
            src = &src[n..];
            dst = va0 + PGSIZE;
        }
        Ok(())
    }

    /// Copy from user to kernel: fill `dst` from virtual address srcva.
    pub fn copy_in(
        &mut self,
        dst: &mut [u8],
        srcva: UVAddr,
        kmem: &Spinlock<Kmem>,
    ) -> Result<(), ()> {
        let mut src = srcva.into_usize();
        let mut copied = 0;
        while copied < dst.len() {
            let va0 = pgrounddown(src);
            let pa0 = self
                .translate_or_fix(UVAddr::new(va0), AccessType::Read, kmem)?
                .into_usize();
            let n = cmp::min(PGSIZE - (src - va0), dst.len() - copied);
            // SAFETY: pa0 points at a whole mapped page in the arena.
            unsafe { ptr::copy((pa0 + (src - va0)) as *const u8, dst[copied..].as_mut_ptr(), n) };
            copied += n;
            src = va0 + PGSIZE;
        }
        Ok(())
    }

    /// Copy a null-terminated string from user to kernel: copy bytes into
    /// `dst` from virtual address srcva until a '\0', or the buffer runs
    /// out. Returns the string length (not counting the nul) on success.
    pub fn copy_in_str(
        &mut self,
        dst: &mut [u8],
        srcva: UVAddr,
        kmem: &Spinlock<Kmem>,
    ) -> Result<usize, ()> {
        let mut src = srcva.into_usize();
        let mut copied = 0;
        while copied < dst.len() {
            let va0 = pgrounddown(src);
            let pa0 = self
                .translate_or_fix(UVAddr::new(va0), AccessType::Read, kmem)?
                .into_usize();
            let n = cmp::min(PGSIZE - (src - va0), dst.len() - copied);
            // SAFETY: pa0 points at a whole mapped page in the arena.
            let bytes = unsafe { slice::from_raw_parts((pa0 + (src - va0)) as *const u8, n) };
            for &b in bytes {
                dst[copied] = b;
                if b == 0 {
                    return Ok(copied);
                }
                copied += 1;
            }
            src = va0 + PGSIZE;
        }
        Err(())
    }

    /// An aligned load from user memory, as the emulated hart performs it.
    /// No repair: a miss is reported to the trap path.
    pub fn load_u64(&self, va: UVAddr) -> Result<u64, ()> {
        let v = va.into_usize();
        if v % 8 != 0 {
            return Err(());
        }
        let pa = self.translate(va, AccessType::Read)?.into_usize();
        // SAFETY: pa is inside a mapped arena page and 8-byte aligned.
        Ok(unsafe { ptr::read(pa as *const u64) })
    }

    pub fn load_u8(&self, va: UVAddr) -> Result<u8, ()> {
        let pa = self.translate(va, AccessType::Read)?.into_usize();
        // SAFETY: pa is inside a mapped arena page.
        Ok(unsafe { ptr::read(pa as *const u8) })
    }

    pub fn store_u64(&self, va: UVAddr, value: u64) -> Result<(), ()> {
        let v = va.into_usize();
        if v % 8 != 0 {
            return Err(());
        }
        let pa = self.translate(va, AccessType::Write)?.into_usize();
        // SAFETY: pa is inside a mapped, writable arena page.
        unsafe { ptr::write(pa as *mut u64, value) };
        Ok(())
    }

    pub fn store_u8(&self, va: UVAddr, value: u8) -> Result<(), ()> {
        let pa = self.translate(va, AccessType::Write)?.into_usize();
        // SAFETY: pa is inside a mapped, writable arena page.
        unsafe { ptr::write(pa as *mut u8, value) };
        Ok(())
    }

    /// Instruction fetch: one aligned 16-byte instruction slot.
    pub fn fetch(&self, va: UVAddr, insn: &mut [u8; 16]) -> Result<(), ()> {
        let v = va.into_usize();
        if v % 16 != 0 {
            return Err(());
        }
        let pa = self.translate(va, AccessType::Exec)?.into_usize();
        // SAFETY: pa is inside a mapped, executable arena page and the slot
        // cannot cross a page boundary.
        insn.copy_from_slice(unsafe { slice::from_raw_parts(pa as *const u8, 16) });
        Ok(())
    }

    /// Free user memory pages, then free page-table pages. The trap frame
    /// page itself is not freed here: the process owns it separately.
    pub fn free(mut self, kmem: &Spinlock<Kmem>) {
        self.page_table.unmap(TRAPFRAME, 1, false, kmem);
        if self.size > 0 {
            self.page_table
                .unmap(0, pgroundup(self.size) / PGSIZE, true, kmem);
        }
        self.page_table.free(kmem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpus;

    fn setup(npages: usize) -> (&'static Cpus, Spinlock<Kmem>) {
        // the registry must outlive the thread-local binding, so leak it
        let cpus: &'static Cpus = Box::leak(Box::new(Cpus::new(1)));
        cpus.bind(0);
        (cpus, Spinlock::new("kmem", Kmem::new(npages)))
    }

    fn new_memory(kmem: &Spinlock<Kmem>) -> (UserMemory, Page) {
        let tf = kmem.lock().alloc().expect("trap frame");
        let pa = tf.addr();
        let code = [0u8; 8];
        let memory = UserMemory::new(pa, Some(&code), kmem).expect("UserMemory::new");
        (memory, tf)
    }

    fn teardown(memory: UserMemory, tf: Page, kmem: &Spinlock<Kmem>) {
        memory.free(kmem);
        kmem.lock().free(tf);
    }

    #[test]
    fn map_then_translate() {
        let (_cpus, kmem) = setup(64);
        let (mut memory, tf) = new_memory(&kmem);

        let pa = memory
            .translate(UVAddr::new(3), AccessType::Read)
            .expect("initcode page should be mapped");
        assert_eq!(pa.into_usize() % PGSIZE, 3);

        // the trap frame is mapped but not user-accessible
        assert!(memory
            .translate(UVAddr::new(TRAPFRAME), AccessType::Read)
            .is_err());
        // beyond the end of the address space
        assert!(memory
            .translate(UVAddr::new(MAXVA + PGSIZE), AccessType::Read)
            .is_err());

        teardown(memory, tf, &kmem);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_is_fatal() {
        let (_cpus, kmem) = setup(64);
        let (mut memory, tf) = new_memory(&kmem);
        // keep the unwinder away from Page's drop bomb
        mem::forget(tf);
        let page = kmem.lock().alloc().unwrap();
        let pa = page.into_usize();
        // address 0 is already mapped by the initcode page
        let _ = memory
            .page_table
            .map(0, PGSIZE, pa, PteFlags::R | PteFlags::U, &kmem);
    }

    #[test]
    fn unmap_skips_lazy_holes() {
        let (_cpus, kmem) = setup(64);
        let (mut memory, tf) = new_memory(&kmem);
        let before = kmem.lock().free_pages();

        // reserve 16 pages, touch only two of them
        memory.resize((16 * PGSIZE) as i32, 0, &kmem).unwrap();
        memory
            .handle_fault(UVAddr::new(2 * PGSIZE), AccessType::Write, 0, &kmem)
            .unwrap();
        memory
            .handle_fault(UVAddr::new(9 * PGSIZE), AccessType::Write, 0, &kmem)
            .unwrap();
        assert_eq!(before - kmem.lock().free_pages(), 2);

        // shrinking back across the holes must skip them
        memory.resize(-((16 * PGSIZE) as i32), 0, &kmem).unwrap();
        assert_eq!(before, kmem.lock().free_pages());

        teardown(memory, tf, &kmem);
    }

    #[test]
    fn lazy_faults_consume_only_touched_pages() {
        let (_cpus, kmem) = setup(256);
        let (mut memory, tf) = new_memory(&kmem);
        let before = kmem.lock().free_pages();

        // a large reservation: 2048 pages, touch every 64th
        let npages = 2048;
        memory.resize((npages * PGSIZE) as i32, 0, &kmem).unwrap();
        assert_eq!(before, kmem.lock().free_pages(), "reservation must be free");

        let mut touched = 0;
        // start past the eagerly mapped initcode page
        for i in (64..npages).step_by(64) {
            let va = UVAddr::new(i * PGSIZE + 8);
            memory
                .handle_fault(va, AccessType::Write, 0, &kmem)
                .unwrap();
            memory.store_u64(va, 0xdead).unwrap();
            touched += 1;
        }
        let consumed = before - kmem.lock().free_pages();
        // touched pages plus a handful of intermediate table pages
        assert!(consumed >= touched, "consumed {} touched {}", consumed, touched);
        assert!(
            consumed <= touched + 2 + npages / 512,
            "consumed {} touched {}",
            consumed,
            touched
        );

        // a second identical access must not fault again
        assert!(memory
            .translate(UVAddr::new(64 * PGSIZE + 8), AccessType::Write)
            .is_ok());

        teardown(memory, tf, &kmem);
    }

    #[test]
    fn lazy_fault_outside_bounds_is_violation() {
        let (_cpus, kmem) = setup(64);
        let (mut memory, tf) = new_memory(&kmem);

        // beyond size
        assert!(memory
            .handle_fault(UVAddr::new(memory.size() + PGSIZE), AccessType::Write, 0, &kmem)
            .is_err());

        // below the stack floor
        memory.resize((8 * PGSIZE) as i32, 0, &kmem).unwrap();
        assert!(memory
            .handle_fault(UVAddr::new(2 * PGSIZE), AccessType::Write, 4 * PGSIZE, &kmem)
            .is_err());

        teardown(memory, tf, &kmem);
    }

    #[test]
    fn cow_write_isolation() {
        let (_cpus, kmem) = setup(64);
        let (mut parent, ptf) = new_memory(&kmem);

        let v = UVAddr::new(16);
        parent.copy_out(v, &[0x41], &kmem).unwrap();

        let ctf = kmem.lock().alloc().unwrap();
        let mut child = parent.clone_cow(ctf.addr(), &kmem).expect("clone_cow");

        // both see the original byte, from the same physical page
        assert_eq!(parent.load_u8(v).unwrap(), 0x41);
        assert_eq!(child.load_u8(v).unwrap(), 0x41);
        let ppa = parent.translate(v, AccessType::Read).unwrap();
        let cpa = child.translate(v, AccessType::Read).unwrap();
        assert_eq!(ppa, cpa);
        assert_eq!(kmem.lock().refcount(PAddr::new(pgrounddown(ppa.into_usize()))), 2);

        // neither may write without a fault
        assert!(parent.store_u8(v, 0x42).is_err());
        assert!(child.store_u8(v, 0x43).is_err());

        // parent writes: gets a private copy, child keeps the old byte
        parent.copy_out(v, &[0x42], &kmem).unwrap();
        assert_eq!(parent.load_u8(v).unwrap(), 0x42);
        assert_eq!(child.load_u8(v).unwrap(), 0x41);

        // child writes: sole owner now, so the page is taken in place
        let shared = child.translate(v, AccessType::Read).unwrap();
        child
            .handle_fault(v, AccessType::Write, 0, &kmem)
            .unwrap();
        child.store_u8(v, 0x43).unwrap();
        assert_eq!(child.translate(v, AccessType::Read).unwrap(), shared);
        assert_eq!(child.load_u8(v).unwrap(), 0x43);
        assert_eq!(parent.load_u8(v).unwrap(), 0x42);

        child.free(&kmem);
        kmem.lock().free(ctf);
        teardown(parent, ptf, &kmem);
    }

    #[test]
    fn cow_preserves_refcounts_through_teardown() {
        let (_cpus, kmem) = setup(64);
        let before = kmem.lock().free_pages();
        let (mut parent, ptf) = new_memory(&kmem);

        let ctf = kmem.lock().alloc().unwrap();
        let child = parent.clone_cow(ctf.addr(), &kmem).expect("clone_cow");

        child.free(&kmem);
        kmem.lock().free(ctf);
        teardown(parent, ptf, &kmem);

        // every page went back: no leak, no double free
        assert_eq!(before, kmem.lock().free_pages());
    }

    #[test]
    fn copy_in_out_roundtrip_across_pages() {
        let (_cpus, kmem) = setup(64);
        let (mut memory, tf) = new_memory(&kmem);
        memory.resize((4 * PGSIZE) as i32, 0, &kmem).unwrap();

        // straddles the boundary between two lazily materialized pages
        let data: Vec<u8> = (0..PGSIZE + 100).map(|i| (i % 251) as u8).collect();
        let dst = UVAddr::new(2 * PGSIZE - 50);
        memory.copy_out(dst, &data, &kmem).unwrap();

        let mut back = vec![0u8; data.len()];
        memory.copy_in(&mut back, dst, &kmem).unwrap();
        assert_eq!(data, back);

        // out of bounds fails cleanly
        assert!(memory
            .copy_out(UVAddr::new(memory.size() + PGSIZE), &data, &kmem)
            .is_err());

        teardown(memory, tf, &kmem);
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let (_cpus, kmem) = setup(64);
        let (mut memory, tf) = new_memory(&kmem);
        memory.resize((2 * PGSIZE) as i32, 0, &kmem).unwrap();

        let src = UVAddr::new(PGSIZE);
        memory.copy_out(src, b"/init\0garbage", &kmem).unwrap();

        let mut buf = [0u8; 32];
        let len = memory.copy_in_str(&mut buf, src, &kmem).unwrap();
        assert_eq!(&buf[..len], b"/init");

        // an unterminated string that fills the buffer is an error
        let mut tiny = [0u8; 3];
        assert!(memory.copy_in_str(&mut tiny, src, &kmem).is_err());

        teardown(memory, tf, &kmem);
    }

    #[test]
    fn guard_page_faults_are_fatal() {
        let (_cpus, kmem) = setup(64);
        let (mut memory, tf) = new_memory(&kmem);

        // build a two-page stack area the way exec does
        let sz = memory
            .alloc_range(memory.size(), memory.size() + 2 * PGSIZE, &kmem)
            .unwrap();
        let guard = sz - 2 * PGSIZE;
        memory.clear_user(guard);
        memory.set_stack_base(guard + PGSIZE);

        // present but not user-accessible: no repair allowed
        assert!(memory
            .handle_fault(UVAddr::new(guard + 8), AccessType::Write, memory.stack_base(), &kmem)
            .is_err());

        teardown(memory, tf, &kmem);
    }
}
