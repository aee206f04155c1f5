//! The process as the VM sees it: a hardware page table, a
//! supplemental page table, the saved user stack pointer, and the
//! mmap regions. The page-fault pipeline and the loader-facing
//! population calls live here.

use core::cmp;
use core::slice;

use alloc::boxed::Box;
use alloc::sync::Arc;
use arrayvec::{ArrayString, ArrayVec};
use log::{debug, info};
use num_iter::range_step;
use zerocopy::{AsBytes, FromBytes};

use crate::addr::{pg_ofs, pg_round_down, Addr, UVAddr, VAddr, PGSIZE};
use crate::error::{Result, VmError};
use crate::memlayout::{in_stack_region, is_user_vaddr, USER_STACK};
use crate::param::{MAXPROCNAME, NMMAP};
use crate::pml4::Pml4;
use crate::some_or;
use crate::vm::file::{FileMapping, MmapRegion, VmFile};
use crate::vm::page::{PageKind, VmPage};
use crate::vm::spt::Spt;
use crate::vm::uninit::{InitFn, UninitPage};
use crate::vm::{Vm, VmType};

/// What the trap frame tells the fault handler.
#[derive(Clone, Copy, Debug)]
pub struct Fault {
    /// The faulting address; not necessarily page-aligned.
    pub addr: usize,
    /// The user stack pointer at fault time, from the trap frame.
    pub rsp: usize,
    /// Fault taken in user mode.
    pub user: bool,
    /// The access was a write.
    pub write: bool,
    /// Missing mapping (as opposed to a protection violation).
    pub not_present: bool,
}

/// A user process's memory context.
///
/// The teardown is explicit: call [`Proc::exit`] before dropping, or
/// the process's frames and page-table pages leak.
pub struct Proc {
    name: ArrayString<MAXPROCNAME>,
    /// Boxed so frames can keep a stable pointer to it while the
    /// `Proc` value itself moves around.
    pml4: Box<Pml4>,
    spt: Spt,
    mmaps: ArrayVec<MmapRegion, NMMAP>,
    /// Last user rsp, stashed at syscall entry for kernel-mode faults.
    user_rsp: usize,
}

impl Proc {
    pub fn new(vm: &Vm, name: &str) -> Result<Self> {
        let mut n = ArrayString::new();
        for c in name.chars() {
            if n.try_push(c).is_err() {
                break;
            }
        }
        Ok(Self {
            name: n,
            pml4: Box::new(Pml4::new(vm.pool())?),
            spt: Spt::new(),
            mmaps: ArrayVec::new(),
            user_rsp: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spt(&self) -> &Spt {
        &self.spt
    }

    pub fn pml4(&self) -> &Pml4 {
        &self.pml4
    }

    /// The syscall dispatcher calls this on entry so a fault taken in
    /// kernel mode can still judge stack growth.
    pub fn syscall_enter(&mut self, rsp: usize) {
        self.user_rsp = rsp;
    }

    /// Registers a lazily populated page at `va`.
    pub fn alloc_page_with_initializer(
        &mut self,
        va: UVAddr,
        writable: bool,
        init: UninitPage,
    ) -> Result<()> {
        debug_assert!(va.is_page_aligned(), "alloc_page_with_initializer");
        self.spt
            .insert_page(VmPage::new(va, writable, PageKind::Uninit(init)))
    }

    /// Claims the page at `va`: binds a frame, installs the mapping,
    /// populates the contents.
    pub fn claim_page(&mut self, vm: &Vm, va: UVAddr) -> Result<()> {
        let page = some_or!(self.spt.find_page_mut(va), return Err(VmError::NoPage));
        vm.claim_page(&mut self.pml4, page)
    }

    /// Removes and destroys the page covering `va`.
    pub(crate) fn remove_page(&mut self, vm: &Vm, va: UVAddr) -> Option<()> {
        self.spt.remove_page(vm, &mut self.pml4, va)
    }

    /// Resolves a page fault. An error terminates the faulting
    /// process at the trap dispatcher.
    pub fn handle_fault(&mut self, vm: &Vm, fault: &Fault) -> Result<()> {
        if fault.addr == 0 {
            return Err(VmError::BadAddress);
        }
        let vaddr = UVAddr::from(pg_round_down(fault.addr));
        if !is_user_vaddr(UVAddr::from(fault.addr)) {
            return Err(VmError::BadAddress);
        }
        if !fault.not_present {
            // A protection fault; there is no copy-on-write to serve.
            return Err(VmError::Protection);
        }

        // In kernel mode the trap frame holds a kernel rsp; judge
        // stack growth against the rsp stashed at syscall entry.
        let rsp = if fault.user { fault.rsp } else { self.user_rsp };

        // A push faults 8 bytes below rsp; ordinary in-frame accesses
        // land at or above it.
        if in_stack_region(fault.addr)
            && (fault.addr + 8 == rsp || (rsp <= fault.addr && fault.addr <= USER_STACK))
            && self.spt.find_page(vaddr).is_none()
        {
            self.grow_stack(vaddr)?;
        }

        let page = some_or!(self.spt.find_page_mut(vaddr), return Err(VmError::NoPage));
        if fault.write && !page.writable() {
            return Err(VmError::Protection);
        }
        debug!("fault {:#x} -> claim {:#x}", fault.addr, vaddr.into_usize());
        vm.claim_page(&mut self.pml4, page)
    }

    /// Installs one more stack page at `vaddr`.
    fn grow_stack(&mut self, vaddr: UVAddr) -> Result<()> {
        debug!("stack growth to {:#x}", vaddr.into_usize());
        self.alloc_page_with_initializer(
            vaddr,
            true,
            UninitPage::new(VmType::ANON.with(VmType::MARKER_0), None, None),
        )
    }

    /// Loader entry point: registers `read_bytes + zero_bytes` bytes
    /// of a segment, page by page, each carrying its slice of `file`
    /// and the deferred segment reader.
    pub fn map_segment(
        &mut self,
        file: &Arc<dyn VmFile>,
        ofs: usize,
        va: UVAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        assert!((read_bytes + zero_bytes) % PGSIZE == 0, "map_segment");
        assert!(va.is_page_aligned() && pg_ofs(ofs) == 0, "map_segment");
        let mut remaining = read_bytes;
        for i in range_step(0, read_bytes + zero_bytes, PGSIZE) {
            let page_read = cmp::min(remaining, PGSIZE);
            let mapping = FileMapping::new(file.clone(), ofs + i, page_read, PGSIZE - page_read);
            self.alloc_page_with_initializer(
                va + i,
                writable,
                UninitPage::new(VmType::FILE, Some(mapping), Some(load_segment as InitFn)),
            )?;
            remaining -= page_read;
        }
        Ok(())
    }

    /// Installs and immediately claims the first stack page.
    pub fn setup_stack(&mut self, vm: &Vm) -> Result<()> {
        let va = UVAddr::from(USER_STACK - PGSIZE);
        self.alloc_page_with_initializer(
            va,
            true,
            UninitPage::new(VmType::ANON.with(VmType::MARKER_0), None, None),
        )?;
        self.claim_page(vm, va)
    }

    /// Duplicates this process's address space into a new process.
    /// Uninitialized pages stay lazy; anonymous pages are copied
    /// eagerly; file-backed pages keep their descriptor and are
    /// copied only while resident.
    pub fn fork(&self, vm: &Vm, name: &str) -> Result<Proc> {
        let mut child = scopeguard::guard(Proc::new(vm, name)?, |mut child| child.teardown(vm));
        let c = &mut *child;
        c.user_rsp = self.user_rsp;
        c.mmaps = self.mmaps.clone();
        c.spt.copy_from(vm, &mut c.pml4, &self.spt, &self.pml4)?;
        Ok(scopeguard::ScopeGuard::into_inner(child))
    }

    /// Terminates the process: writes mapped files back, destroys
    /// every page, and releases the page tables.
    pub fn exit(mut self, vm: &Vm, status: i32) {
        info!("{}: exit({})", self.name, status);
        self.teardown(vm);
    }

    fn teardown(&mut self, vm: &Vm) {
        while let Some(region) = self.mmaps.pop() {
            for i in range_step(0, region.pages() * PGSIZE, PGSIZE) {
                let _ = self.remove_page(vm, region.addr() + i);
            }
        }
        self.spt.kill(vm, &mut self.pml4);
        self.pml4.destroy(vm.pool());
    }

    pub(crate) fn mmap_regions(&self) -> &ArrayVec<MmapRegion, NMMAP> {
        &self.mmaps
    }

    pub(crate) fn push_mmap_region(&mut self, region: MmapRegion) {
        self.mmaps.push(region);
    }

    pub(crate) fn take_mmap_region(&mut self, addr: UVAddr) -> Option<MmapRegion> {
        let idx = self.mmaps.iter().position(|r| r.addr() == addr)?;
        Some(self.mmaps.swap_remove(idx))
    }

    /// Checks a user range without touching it: every page mapped,
    /// and writable where `write` asks for it. Nothing is claimed.
    fn check_range(&self, va: UVAddr, len: usize, write: bool) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let start = va.into_usize();
        let end = start.checked_add(len - 1).ok_or(VmError::BadAddress)?;
        if start == 0 || !is_user_vaddr(UVAddr::from(end)) {
            return Err(VmError::BadAddress);
        }
        for a in range_step(pg_round_down(start), end + 1, PGSIZE) {
            let page = some_or!(
                self.spt.find_page(UVAddr::from(a)),
                return Err(VmError::BadAddress)
            );
            if write && !page.writable() {
                return Err(VmError::Protection);
            }
        }
        Ok(())
    }

    /// The page covering `va` as a kernel slice, claimed on demand.
    /// Tracks the accessed and dirty bits the hardware would set.
    fn user_page_slice(&mut self, vm: &Vm, va: UVAddr, write: bool) -> Result<&mut [u8]> {
        let vaddr = va.page_down();
        let page = some_or!(
            self.spt.find_page_mut(vaddr),
            return Err(VmError::BadAddress)
        );
        if write && !page.writable() {
            return Err(VmError::Protection);
        }
        vm.claim_page(&mut self.pml4, page)?;
        let kva = some_or!(self.pml4.get_page(vaddr), return Err(VmError::BadAddress));
        self.pml4.set_accessed(vaddr, true);
        if write {
            self.pml4.set_dirty(vaddr, true);
        }
        // SAFETY: kva maps a frame owned by this process's resident
        // page for as long as the caller's borrow of self lasts.
        Ok(unsafe { slice::from_raw_parts_mut(kva.into_usize() as *mut u8, PGSIZE) })
    }

    /// Copy from kernel to user. The whole destination is validated
    /// before the first byte moves.
    pub fn copy_out_bytes(&mut self, vm: &Vm, dstva: UVAddr, src: &[u8]) -> Result<()> {
        self.check_range(dstva, src.len(), true)?;
        let mut dst = dstva.into_usize();
        let mut len = src.len();
        let mut offset = 0;
        while len > 0 {
            let va = pg_round_down(dst);
            let poffset = dst - va;
            let page = self.user_page_slice(vm, UVAddr::from(va), true)?;
            let n = cmp::min(PGSIZE - poffset, len);
            page[poffset..poffset + n].copy_from_slice(&src[offset..offset + n]);
            len -= n;
            offset += n;
            dst += n;
        }
        Ok(())
    }

    /// Copy from user to kernel.
    pub fn copy_in_bytes(&mut self, vm: &Vm, dst: &mut [u8], srcva: UVAddr) -> Result<()> {
        self.check_range(srcva, dst.len(), false)?;
        let mut src = srcva.into_usize();
        let mut len = dst.len();
        let mut offset = 0;
        while len > 0 {
            let va = pg_round_down(src);
            let poffset = src - va;
            let page = self.user_page_slice(vm, UVAddr::from(va), false)?;
            let n = cmp::min(PGSIZE - poffset, len);
            dst[offset..offset + n].copy_from_slice(&page[poffset..poffset + n]);
            len -= n;
            offset += n;
            src += n;
        }
        Ok(())
    }

    /// Copy a value from kernel to user.
    pub fn copy_out<T: AsBytes>(&mut self, vm: &Vm, dstva: UVAddr, src: &T) -> Result<()> {
        self.copy_out_bytes(vm, dstva, src.as_bytes())
    }

    /// Copy a value from user to kernel.
    pub fn copy_in<T: AsBytes + FromBytes>(
        &mut self,
        vm: &Vm,
        dst: &mut T,
        srcva: UVAddr,
    ) -> Result<()> {
        self.copy_in_bytes(vm, dst.as_bytes_mut(), srcva)
    }
}

/// The deferred segment reader the loader hands to
/// [`Proc::map_segment`]: reads the page's file slice and zero-fills
/// the tail.
pub fn load_segment(vm: &Vm, backing: Option<&FileMapping>, dst: &mut [u8]) -> Result<()> {
    let m = some_or!(backing, return Err(VmError::Io));
    {
        let _fs = vm.fs_lock();
        let n = m.file().read_at(&mut dst[..m.read_bytes()], m.offset())?;
        if n != m.read_bytes() {
            return Err(VmError::Io);
        }
    }
    dst[m.read_bytes()..].fill(0);
    Ok(())
}
