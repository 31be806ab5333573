use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr;

use crate::addr::PAddr;
use crate::riscv::PGSIZE;

/// Page type.
#[repr(align(4096))]
pub struct RawPage {
    inner: [u8; PGSIZE],
}

/// An owned physical page.
///
/// Internal safety invariant:
/// - `inner` is 4096-byte aligned and lies inside the arena of the `Kmem`
///   that handed it out.
/// - Two different `Page`s never overlap.
///
/// A `Page` must be returned to its allocator with `Kmem::free`; it must
/// never be dropped.
pub struct Page {
    inner: *mut RawPage,
}

// SAFETY: a Page is an exclusive handle to its memory.
unsafe impl Send for Page {}

impl RawPage {
    pub fn write_bytes(&mut self, value: u8) {
        unsafe {
            ptr::write_bytes(&mut self.inner, value, 1);
        }
    }
}

impl Deref for RawPage {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for RawPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Page {
    pub fn into_usize(self) -> usize {
        let result = self.inner as _;
        mem::forget(self);
        result
    }

    /// # Safety
    ///
    /// The given address must uphold the invariant of `Page`:
    /// - `addr` is a multiple of 4096 and lies inside the allocator arena.
    /// - No other live `Page` refers to the same memory.
    pub unsafe fn from_usize(addr: usize) -> Self {
        Self {
            inner: addr as *mut _,
        }
    }

    pub fn addr(&self) -> PAddr {
        PAddr::new(self.inner as _)
    }
}

impl Deref for Page {
    type Target = RawPage;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.inner }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.inner }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        panic!("Page must never drop.");
    }
}
