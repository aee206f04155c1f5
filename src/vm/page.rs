//! The page record and its kind dispatch.
//!
//! A page is a tagged record; swap-in, swap-out, and destroy select
//! their behavior by kind through exhaustive match. The record lives
//! in exactly one SPT, which keys it by its page-aligned user virtual
//! address.

use core::mem;
use core::ptr;
use core::slice;

use alloc::boxed::Box;
use log::warn;

use crate::hash::{HashElem, HashKeyed};
use crate::some_or;
use crate::addr::{Addr, KVAddr, UVAddr, PGSIZE};
use crate::error::{Result, VmError};
use crate::pml4::Pml4;
use crate::vm::anon::AnonPage;
use crate::vm::file::FilePage;
use crate::vm::uninit::UninitPage;
use crate::vm::frame::Frame;
use crate::vm::{Vm, VmType};

pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// A user page.
///
/// # Safety
///
/// - `va` is page-aligned; it is the SPT key and never changes.
/// - `frame` is null iff the page is not resident. A non-null `frame`
///   points to the ring frame whose `page` points back here; both
///   links change together under the frame-table lock.
#[repr(C)]
pub struct VmPage {
    /// SPT chain node. Must remain the first field.
    elem: HashElem,
    va: UVAddr,
    writable: bool,
    kind: PageKind,
    frame: *mut Frame,
}

// SAFETY: VmPage is repr(C) and its HashElem is the first field.
unsafe impl HashKeyed for VmPage {
    type Key = usize;

    fn key(&self) -> usize {
        self.va.into_usize()
    }
}

impl VmPage {
    pub(crate) fn new(va: UVAddr, writable: bool, kind: PageKind) -> Box<VmPage> {
        debug_assert!(va.is_page_aligned(), "VmPage::new");
        Box::new(VmPage {
            // SAFETY: used only through the SPT's hash table.
            elem: unsafe { HashElem::new() },
            va,
            writable,
            kind,
            frame: ptr::null_mut(),
        })
    }

    pub fn va(&self) -> UVAddr {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut PageKind {
        &mut self.kind
    }

    pub fn is_resident(&self) -> bool {
        !self.frame.is_null()
    }

    /// The type of the page. For a page still awaiting
    /// initialization, the type it will have afterward.
    pub fn ty(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit(u) => u.ty().ty(),
            PageKind::Anon(_) => VmType::ANON,
            PageKind::File(_) => VmType::FILE,
        }
    }

    /// The frame address this page is resident in, if any.
    pub fn kva(&self) -> Option<KVAddr> {
        if self.frame.is_null() {
            None
        } else {
            // SAFETY: a non-null frame link is valid by the invariant.
            Some(unsafe { (*self.frame).kva() })
        }
    }

    pub(crate) fn frame_ptr(&self) -> *mut Frame {
        self.frame
    }

    pub(crate) fn set_frame(&mut self, frame: *mut Frame) {
        self.frame = frame;
    }

    /// Populates the freshly bound frame at `kva`. For an
    /// uninitialized page this first transmutes the record into its
    /// target kind.
    pub(crate) fn swap_in(&mut self, vm: &Vm, kva: KVAddr) -> Result<()> {
        // SAFETY: kva is the frame the claim path just bound to this
        // page; the frame owns that memory and is not in the ring yet.
        let dst = unsafe { slice::from_raw_parts_mut(kva.into_usize() as *mut u8, PGSIZE) };
        if let PageKind::Uninit(_) = self.kind {
            return self.initialize(vm, dst);
        }
        match &mut self.kind {
            PageKind::Uninit(_) => unreachable!(),
            PageKind::Anon(anon) => anon.swap_in(vm, dst),
            PageKind::File(file) => file.swap_in(vm, dst),
        }
    }

    /// One-shot Uninit transition: become the target kind in place,
    /// then run the deferred initializer. The record address is
    /// stable across the transition; the SPT keys by va.
    fn initialize(&mut self, vm: &Vm, dst: &mut [u8]) -> Result<()> {
        let uninit = match mem::replace(&mut self.kind, PageKind::Anon(AnonPage::new())) {
            PageKind::Uninit(u) => u,
            _ => unreachable!("initialize: not uninit"),
        };
        let (ty, backing, init) = uninit.into_parts();
        if ty.ty() == VmType::FILE {
            self.kind = PageKind::File(FilePage::new(some_or!(
                backing,
                return Err(VmError::Io)
            )));
        }
        match init {
            Some(init) => {
                if let PageKind::Anon(_) = self.kind {
                    // Anonymous pages start zeroed no matter what the
                    // initializer fills in afterward.
                    dst.fill(0);
                }
                let backing = match &self.kind {
                    PageKind::File(file) => Some(file.mapping()),
                    _ => None,
                };
                init(vm, backing, dst)
            }
            None => match &mut self.kind {
                PageKind::Anon(anon) => anon.swap_in(vm, dst),
                PageKind::File(file) => file.swap_in(vm, dst),
                PageKind::Uninit(_) => unreachable!(),
            },
        }
    }

    /// Preserves the page's contents on eviction. `hw_dirty` is the
    /// hardware dirty bit, checkpointed before the mapping was
    /// cleared.
    pub(crate) fn swap_out(&mut self, vm: &Vm, hw_dirty: bool, kva: KVAddr) -> Result<()> {
        // SAFETY: kva is the evicting frame's page, which stays alive
        // until the eviction rebinds it.
        let src = unsafe { slice::from_raw_parts(kva.into_usize() as *const u8, PGSIZE) };
        let writable = self.writable;
        match &mut self.kind {
            PageKind::Uninit(_) => unreachable!("swap_out: uninit page resident"),
            PageKind::Anon(anon) => anon.swap_out(vm, src),
            PageKind::File(file) => file.flush(vm, writable, hw_dirty, src),
        }
    }

    /// Releases everything the page holds: the hardware mapping and
    /// frame when resident (flushing a dirty file page first), a swap
    /// slot when evicted.
    pub(crate) fn destroy(&mut self, vm: &Vm, pml4: &mut Pml4) {
        if !self.frame.is_null() {
            let hw_dirty = pml4.is_dirty(self.va);
            let _ = pml4.clear_page(self.va);
            let frame = vm.frames().pop(self.frame);
            self.frame = ptr::null_mut();
            let writable = self.writable;
            if let PageKind::File(file) = &mut self.kind {
                if let Err(err) = file.flush(vm, writable, hw_dirty, frame.bytes()) {
                    warn!(
                        "writeback of {:#x} failed on destroy: {}",
                        self.va.into_usize(),
                        err
                    );
                }
            }
            frame.free(vm.pool());
        }
        if let PageKind::Anon(anon) = &mut self.kind {
            anon.destroy(vm);
        }
    }
}
