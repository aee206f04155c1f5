//! The virtual-memory core: page kinds, the supplemental page table,
//! the global frame table, and the claim/eviction machinery that moves
//! pages between them.
//!
//! All system-wide VM state lives in one explicitly constructed [`Vm`]
//! passed by reference, so several subsystems can exist side by side
//! under test.

use core::ptr;

use alloc::boxed::Box;
use log::{debug, warn};
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

use crate::addr::Addr;
use crate::error::Result;
use crate::palloc::PagePool;
use crate::param::{KERNEL_POOL_PAGES, SWAP_SLOTS, USER_POOL_PAGES};
use crate::pml4::Pml4;
use crate::some_or;

pub mod anon;
pub mod file;
pub mod frame;
pub mod page;
pub mod spt;
pub mod swap;
pub mod uninit;

use frame::{Frame, FrameTable};
use page::VmPage;
use swap::Swap;

/// Page-type tag. The low three bits select the kind; the bits above
/// carry markers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VmType(u32);

impl VmType {
    pub const UNINIT: Self = Self(0);
    pub const ANON: Self = Self(1);
    pub const FILE: Self = Self(2);
    /// Reserved for a page-cache kind; nothing constructs it.
    pub const PAGE_CACHE: Self = Self(3);

    /// Marker stamped on stack pages.
    pub const MARKER_0: Self = Self(1 << 3);
    pub const MARKER_1: Self = Self(1 << 4);

    /// The kind alone, markers masked off.
    pub const fn ty(self) -> Self {
        Self(self.0 & 7)
    }

    pub const fn with(self, marker: Self) -> Self {
        Self(self.0 | marker.0)
    }

    pub const fn has(self, marker: Self) -> bool {
        self.0 & marker.0 != 0
    }
}

// Markers must stay clear of the sign bit of a 32-bit word.
const_assert!(VmType::MARKER_1.0 < 1u32 << 31);

/// The virtual-memory subsystem: page pools, the frame table, the swap
/// device, and the global filesystem lock.
pub struct Vm {
    pool: PagePool,
    frames: FrameTable,
    swap: Swap,
    fs: Mutex<()>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_capacity(USER_POOL_PAGES, KERNEL_POOL_PAGES, SWAP_SLOTS)
    }

    pub fn with_capacity(user_pages: usize, kernel_pages: usize, swap_slots: usize) -> Self {
        Self {
            pool: PagePool::new(user_pages, kernel_pages),
            frames: FrameTable::new(),
            swap: Swap::new(swap_slots),
            fs: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &Swap {
        &self.swap
    }

    /// The single lock serializing every filesystem call reached from
    /// syscall and VM paths. Never held across pool allocation.
    pub fn fs_lock(&self) -> MutexGuard<'_, ()> {
        self.fs.lock()
    }

    /// Returns a frame bound to a fresh physical page, evicting one if
    /// the user pool is exhausted. Panics when there is nothing left
    /// to evict.
    fn get_frame(&self) -> Box<Frame> {
        match self.pool.alloc_user() {
            Some(mem) => Frame::new(mem),
            None => self.evict_frame(),
        }
    }

    /// Picks a victim, swaps it out, and hands back its now-free
    /// frame.
    fn evict_frame(&self) -> Box<Frame> {
        let victim = some_or!(
            self.frames.pick_victim(),
            panic!("vm: out of memory with nothing evictable")
        );
        let mut frame = self.frames.pop(victim);

        // Clear the mapping before swap-out so user code cannot reach
        // the stale frame, checkpointing the dirty bit for the kind's
        // writeback decision.
        // SAFETY: the frame was just popped from the ring, so its
        // back-references are still the victim page and its pml4, and
        // nothing else can touch them while the page is mid-eviction.
        let hw_dirty = unsafe {
            let page = &mut *frame.page;
            let pml4 = &mut *frame.pml4;
            let dirty = pml4.is_dirty(page.va());
            let _ = pml4.clear_page(page.va());
            dirty
        };

        // Swap out without any lock held; the frame is out of the
        // ring, so the hand cannot pick it again mid-I/O.
        unsafe {
            let page = &mut *frame.page;
            debug!("evict {:#x}", page.va().into_usize());
            if let Err(err) = page.swap_out(self, hw_dirty, frame.kva()) {
                warn!(
                    "swap-out of {:#x} failed: {}; contents dropped",
                    page.va().into_usize(),
                    err
                );
            }
            page.set_frame(ptr::null_mut());
        }
        frame.page = ptr::null_mut();
        frame.pml4 = ptr::null_mut();
        frame
    }

    /// Claims `page`: obtains a frame, installs the hardware mapping,
    /// and populates the contents via the kind's swap-in.
    pub(crate) fn claim_page(&self, pml4: &mut Pml4, page: &mut VmPage) -> Result<()> {
        if page.is_resident() {
            // Someone beat us to it; the established mapping stands.
            return Ok(());
        }
        let mut frame = self.get_frame();
        frame.page = page as *mut VmPage;
        frame.pml4 = pml4 as *mut Pml4;
        page.set_frame(&mut *frame);

        if let Err(err) = pml4.set_page(&self.pool, page.va(), frame.kva(), page.writable()) {
            page.set_frame(ptr::null_mut());
            frame.free(&self.pool);
            return Err(err);
        }
        if let Err(err) = page.swap_in(self, frame.kva()) {
            let _ = pml4.clear_page(page.va());
            page.set_frame(ptr::null_mut());
            frame.free(&self.pool);
            return Err(err);
        }
        self.frames.push(frame);
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
