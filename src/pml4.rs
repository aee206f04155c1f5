//! The hardware page table, modeled in software.
//!
//! A four-level radix table over page-table pages from the kernel
//! pool. Leaf entries map page-aligned user virtual addresses to the
//! kernel virtual address of the backing frame, with present, write,
//! user, accessed, and dirty bits. The VM core drives it exclusively
//! with `va -> kva` pairs.

use bitflags::bitflags;

use crate::addr::{Addr, KVAddr, UVAddr, VAddr, PLNUM, PLSIZE};
use crate::error::{Result, VmError};
use crate::memlayout::is_user_vaddr;
use crate::page::Page;
use crate::palloc::PagePool;

bitflags! {
    pub struct PteFlags: usize {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
        /// Accessed since the bit was last cleared.
        const A = 1 << 5;
        /// Written since the bit was last cleared.
        const D = 1 << 6;
    }
}

const PTE_FLAGS_MASK: usize = 0xfff;

/// # Safety
///
/// A valid entry in an interior table refers to a page-table page; a
/// valid entry in a leaf table refers to a data page. Which one an
/// entry is follows from its level, which every walk tracks.
///
/// Because of #[derive(Default)], inner is initially 0: not valid.
#[derive(Default)]
struct PageTableEntry {
    inner: usize,
}

impl PageTableEntry {
    fn get_flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn get_kva(&self) -> KVAddr {
        KVAddr::from(self.inner & !PTE_FLAGS_MASK)
    }

    fn is_valid(&self) -> bool {
        self.get_flags().contains(PteFlags::P)
    }

    /// Make the entry refer to a given page-table page.
    fn set_table(&mut self, table: *mut RawPageTable) {
        self.inner = table as usize | PteFlags::P.bits();
    }

    /// Make the entry map a data page with the given permission.
    fn set_entry(&mut self, kva: KVAddr, perm: PteFlags) {
        self.inner = kva.into_usize() | (perm | PteFlags::P).bits();
    }

    fn set_flag(&mut self, flag: PteFlags, value: bool) {
        if value {
            self.inner |= flag.bits();
        } else {
            self.inner &= !flag.bits();
        }
    }

    /// Invalidate the entry by making every bit 0.
    fn invalidate(&mut self) {
        self.inner = 0;
    }
}

/// # Safety
///
/// Converting `self` back to a `Page` with
/// `Page::from_usize(self as *mut _ as usize)` must not break the
/// invariants of `Page`: every `RawPageTable` lives in a kernel-pool
/// page allocated by `RawPageTable::new`.
struct RawPageTable {
    inner: [PageTableEntry; PLSIZE],
}

impl RawPageTable {
    /// Makes a new empty table by allocating a kernel-pool page.
    /// Returns `None` if the allocation failed.
    fn new(pool: &PagePool) -> Option<*mut RawPageTable> {
        let mut page = pool.alloc_kernel()?;
        page.write_bytes(0);
        // This line guarantees the invariant.
        Some(page.into_usize() as *mut RawPageTable)
    }

    /// Returns the page-table page the `index`th entry refers to,
    /// allocating it first when the entry is invalid and `pool` is
    /// given. `None` when the entry is invalid and cannot be filled.
    ///
    /// Must be called on interior tables only.
    fn get_table_mut(&mut self, index: usize, pool: Option<&PagePool>) -> Option<&mut RawPageTable> {
        let pte = &mut self.inner[index];
        if !pte.is_valid() {
            let table = Self::new(pool?)?;
            pte.set_table(table);
        }
        // SAFETY: a valid interior entry refers to a page-table page
        // by the invariant.
        Some(unsafe { &mut *(pte.get_kva().into_usize() as *mut RawPageTable) })
    }

    /// Recursively frees page-table pages. `level` counts down to the
    /// leaf tables at 0, whose entries map frames owned elsewhere and
    /// are left alone.
    ///
    /// # Safety
    ///
    /// This method frees the table itself, so it must not be used
    /// after an invocation of this method.
    unsafe fn free_walk(&mut self, level: usize, pool: &PagePool) {
        if level > 0 {
            for pte in &mut self.inner {
                if pte.is_valid() {
                    let table = pte.get_kva().into_usize() as *mut RawPageTable;
                    // SAFETY: table will not be used anymore.
                    unsafe { (*table).free_walk(level - 1, pool) };
                    pte.invalidate();
                }
            }
        }
        // SAFETY: converting self to a Page is fine by the invariant.
        let page = unsafe { Page::from_usize(self as *mut _ as usize) };
        pool.free_kernel(page);
    }
}

/// # Safety
///
/// While `ptr` is non-null it uniquely refers to a valid 4-level
/// `RawPageTable`. It becomes null after `destroy`.
pub struct Pml4 {
    ptr: *mut RawPageTable,
}

impl Pml4 {
    pub fn new(pool: &PagePool) -> Result<Self> {
        Ok(Self {
            ptr: RawPageTable::new(pool).ok_or(VmError::OutOfMemory)?,
        })
    }

    /// Returns the leaf entry for `va`, creating any required
    /// page-table pages when `pool` is given.
    fn get_mut(&mut self, va: UVAddr, pool: Option<&PagePool>) -> Option<&mut PageTableEntry> {
        assert!(is_user_vaddr(va), "Pml4::get_mut");
        assert!(!self.ptr.is_null(), "Pml4::get_mut: destroyed");
        // SAFETY: self.ptr uniquely refers to a valid RawPageTable
        // according to the invariant.
        let mut table = unsafe { &mut *self.ptr };
        for level in (1..PLNUM).rev() {
            table = table.get_table_mut(va.page_table_index(level), pool)?;
        }
        Some(&mut table.inner[va.page_table_index(0)])
    }

    /// Returns the leaf entry for `va` without allocating. `None` when
    /// an interior table along the walk is missing.
    fn get(&self, va: UVAddr) -> Option<&PageTableEntry> {
        assert!(is_user_vaddr(va), "Pml4::get");
        assert!(!self.ptr.is_null(), "Pml4::get: destroyed");
        // SAFETY: as in get_mut; shared access only.
        let mut table = unsafe { &*self.ptr };
        for level in (1..PLNUM).rev() {
            let pte = &table.inner[va.page_table_index(level)];
            if !pte.is_valid() {
                return None;
            }
            // SAFETY: a valid interior entry refers to a page-table page.
            table = unsafe { &*(pte.get_kva().into_usize() as *const RawPageTable) };
        }
        Some(&table.inner[va.page_table_index(0)])
    }

    /// Installs the mapping `va -> kva` with the given writable bit.
    /// The entry starts out accessed, as a freshly used TLB entry
    /// would. Fails with `OutOfMemory` when an interior page-table
    /// page cannot be allocated.
    pub fn set_page(
        &mut self,
        pool: &PagePool,
        va: UVAddr,
        kva: KVAddr,
        writable: bool,
    ) -> Result<()> {
        assert!(va.is_page_aligned() && kva.is_page_aligned(), "Pml4::set_page");
        let pte = self.get_mut(va, Some(pool)).ok_or(VmError::OutOfMemory)?;
        assert!(!pte.is_valid(), "Pml4::set_page: already mapped");
        let mut perm = PteFlags::U | PteFlags::A;
        if writable {
            perm |= PteFlags::W;
        }
        pte.set_entry(kva, perm);
        Ok(())
    }

    /// The frame mapped at `va`, if any.
    pub fn get_page(&self, va: UVAddr) -> Option<KVAddr> {
        let pte = self.get(va)?;
        if pte.is_valid() {
            Some(pte.get_kva())
        } else {
            None
        }
    }

    /// Removes the mapping at `va`, returning the frame it mapped.
    pub fn clear_page(&mut self, va: UVAddr) -> Option<KVAddr> {
        let pte = self.get_mut(va, None)?;
        if !pte.is_valid() {
            return None;
        }
        let kva = pte.get_kva();
        pte.invalidate();
        Some(kva)
    }

    pub fn is_dirty(&self, va: UVAddr) -> bool {
        self.get(va)
            .map_or(false, |pte| pte.get_flags().contains(PteFlags::P | PteFlags::D))
    }

    pub fn set_dirty(&mut self, va: UVAddr, dirty: bool) {
        if let Some(pte) = self.get_mut(va, None) {
            if pte.is_valid() {
                pte.set_flag(PteFlags::D, dirty);
            }
        }
    }

    pub fn is_accessed(&self, va: UVAddr) -> bool {
        self.get(va)
            .map_or(false, |pte| pte.get_flags().contains(PteFlags::P | PteFlags::A))
    }

    pub fn set_accessed(&mut self, va: UVAddr, accessed: bool) {
        if let Some(pte) = self.get_mut(va, None) {
            if pte.is_valid() {
                pte.set_flag(PteFlags::A, accessed);
            }
        }
    }

    pub fn is_writable(&self, va: UVAddr) -> bool {
        self.get(va)
            .map_or(false, |pte| pte.get_flags().contains(PteFlags::P | PteFlags::W))
    }

    /// Frees every page-table page. Leaf mappings are simply dropped;
    /// the frames they map are owned by the frame table and must be
    /// released through SPT teardown, which runs first.
    pub fn destroy(&mut self, pool: &PagePool) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: self.ptr is valid and will not be used anymore.
        unsafe { (*self.ptr).free_walk(PLNUM - 1, pool) };
        self.ptr = core::ptr::null_mut();
    }
}
