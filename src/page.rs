use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::addr::{Addr, KVAddr, PGSIZE};

/// The storage of a physical page.
#[repr(align(4096))]
pub struct RawPage {
    inner: [u8; PGSIZE],
}

impl RawPage {
    pub const ZERO: Self = Self { inner: [0; PGSIZE] };

    pub fn bytes(&self) -> &[u8; PGSIZE] {
        &self.inner
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; PGSIZE] {
        &mut self.inner
    }
}

/// An owned physical page, identified by its kernel virtual address.
///
/// # Safety
///
/// `ptr` always refers to a valid `RawPage` inside a pool arena, and
/// at most one `Page` for a given address exists at a time. A `Page`
/// must be returned to its pool (or released with `into_usize` by code
/// that re-creates it later); dropping one is a leak of physical
/// memory and panics.
pub struct Page {
    ptr: NonNull<RawPage>,
}

impl Page {
    /// Creates a page handle from a raw page address.
    ///
    /// # Safety
    ///
    /// `addr` must be the page-aligned address of a `RawPage` that is
    /// not owned by any other `Page`.
    pub unsafe fn from_usize(addr: usize) -> Self {
        debug_assert!(addr % PGSIZE == 0, "Page::from_usize");
        Self {
            // SAFETY: addr is nonzero since page 0 is never handed out
            // by a pool arena.
            ptr: unsafe { NonNull::new_unchecked(addr as *mut RawPage) },
        }
    }

    /// Releases ownership, returning the page address.
    pub fn into_usize(self) -> usize {
        let addr = self.ptr.as_ptr() as usize;
        core::mem::forget(self);
        addr
    }

    pub fn addr(&self) -> KVAddr {
        KVAddr::from(self.ptr.as_ptr() as usize)
    }

    pub fn write_bytes(&mut self, value: u8) {
        self.fill(value);
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        // SAFETY: self.ptr refers to a valid, uniquely owned RawPage.
        unsafe { &self.ptr.as_ref().inner }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: self.ptr refers to a valid, uniquely owned RawPage.
        unsafe { &mut self.ptr.as_mut().inner }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:p})", self.ptr)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        panic!("page must never be dropped");
    }
}
