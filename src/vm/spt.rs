//! The supplemental page table: the per-process index from user
//! virtual address to page record. Owns its page records; the copy
//! operation implements the fork semantics.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::addr::{pg_round_down, Addr, UVAddr};
use crate::error::{Result, VmError};
use crate::hash::HashTable;
use crate::pml4::Pml4;
use crate::vm::file::{FileMapping, FilePage};
use crate::vm::page::{PageKind, VmPage};
use crate::vm::uninit::UninitPage;
use crate::vm::Vm;

pub struct Spt {
    table: HashTable<VmPage>,
}

/// What one parent entry contributes to a fork, captured up front so
/// the copy loop holds no borrow into the parent while it claims
/// child pages (claiming may evict, which rewrites parent records).
enum CopyPlan {
    Uninit(UninitPage),
    Anon,
    File(FileMapping, bool),
}

impl Spt {
    pub fn new() -> Self {
        Self {
            table: HashTable::new(),
        }
    }

    /// Looks up the page covering `va`; `va` need not be aligned.
    pub fn find_page(&self, va: UVAddr) -> Option<&VmPage> {
        self.table.find(pg_round_down(va.into_usize()))
    }

    pub(crate) fn find_page_mut(&mut self, va: UVAddr) -> Option<&mut VmPage> {
        self.table.find_mut(pg_round_down(va.into_usize()))
    }

    /// Succeeds iff no page with the same aligned address exists.
    pub(crate) fn insert_page(&mut self, page: Box<VmPage>) -> Result<()> {
        self.table.insert(page).map_err(|_| VmError::AlreadyMapped)
    }

    /// Removes and destroys the page covering `va`.
    pub(crate) fn remove_page(&mut self, vm: &Vm, pml4: &mut Pml4, va: UVAddr) -> Option<()> {
        let mut page = self.table.delete(pg_round_down(va.into_usize()))?;
        page.destroy(vm, pml4);
        Some(())
    }

    pub fn len(&self) -> usize {
        self.table.size()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmPage> {
        self.table.iter()
    }

    /// Destroys every page. The table stays reusable; the structure
    /// itself is released when its owner drops.
    pub(crate) fn kill(&mut self, vm: &Vm, pml4: &mut Pml4) {
        self.table.clear(|mut page| page.destroy(vm, pml4));
    }

    /// Populates this (empty) SPT with a copy of `src`, claiming
    /// child frames where laziness cannot be preserved. On failure the
    /// caller tears the partial copy down via `kill`.
    pub(crate) fn copy_from(
        &mut self,
        vm: &Vm,
        pml4: &mut Pml4,
        src: &Spt,
        src_pml4: &Pml4,
    ) -> Result<()> {
        let plans: Vec<(UVAddr, bool, CopyPlan)> = src
            .iter()
            .map(|page| {
                let plan = match page.kind() {
                    PageKind::Uninit(u) => CopyPlan::Uninit(u.clone()),
                    PageKind::Anon(_) => CopyPlan::Anon,
                    PageKind::File(f) => CopyPlan::File(
                        f.mapping().clone(),
                        f.dirty() || src_pml4.is_dirty(page.va()),
                    ),
                };
                (page.va(), page.writable(), plan)
            })
            .collect();

        for (va, writable, plan) in plans {
            match plan {
                // Laziness is preserved: same target kind, same
                // deferred initializer, same backing.
                CopyPlan::Uninit(u) => {
                    self.insert_page(VmPage::new(va, writable, PageKind::Uninit(u)))?;
                }
                // Eager copy; no copy-on-write here.
                CopyPlan::Anon => {
                    self.insert_page(VmPage::new(
                        va,
                        writable,
                        PageKind::Anon(crate::vm::anon::AnonPage::new()),
                    ))?;
                    let child = self.find_page_mut(va).expect("copy_from: child vanished");
                    vm.claim_page(pml4, child)?;
                    let dst = child.kva().expect("copy_from: child not resident");
                    // SAFETY: dst is the child's freshly claimed frame.
                    let dst =
                        unsafe { &mut *(dst.into_usize() as *mut [u8; crate::addr::PGSIZE]) };
                    // The claim may have evicted the parent page;
                    // consult it again.
                    match src.find_page(va).and_then(|p| p.kva()) {
                        Some(kva) => {
                            // SAFETY: the parent frame stays put for
                            // the duration of this copy.
                            let s = unsafe {
                                &*(kva.into_usize() as *const [u8; crate::addr::PGSIZE])
                            };
                            dst.copy_from_slice(s);
                        }
                        None => {
                            let parent = src.find_page(va).expect("copy_from: parent vanished");
                            match parent.kind() {
                                PageKind::Anon(a) => {
                                    let slot =
                                        a.slot().expect("copy_from: parent neither resident nor swapped");
                                    vm.swap().read(slot, dst);
                                }
                                _ => unreachable!("copy_from: parent changed kind"),
                            }
                        }
                    }
                }
                // Same descriptor; eager copy only when the parent is
                // resident, so un-flushed writes carry over. Frames
                // are never shared between parent and child.
                CopyPlan::File(mapping, dirty) => {
                    self.insert_page(VmPage::new(
                        va,
                        writable,
                        PageKind::File(FilePage::new(mapping)),
                    ))?;
                    if src.find_page(va).map_or(false, |p| p.is_resident()) {
                        let child = self.find_page_mut(va).expect("copy_from: child vanished");
                        vm.claim_page(pml4, child)?;
                        let dst = child.kva().expect("copy_from: child not resident");
                        // SAFETY: dst is the child's freshly claimed frame.
                        let dst =
                            unsafe { &mut *(dst.into_usize() as *mut [u8; crate::addr::PGSIZE]) };
                        if let Some(kva) = src.find_page(va).and_then(|p| p.kva()) {
                            // SAFETY: parent frame valid for this copy.
                            let s = unsafe {
                                &*(kva.into_usize() as *const [u8; crate::addr::PGSIZE])
                            };
                            dst.copy_from_slice(s);
                        }
                        if dirty {
                            // The copied bytes are ahead of the file;
                            // make sure the child flushes them too.
                            if let Some(child) = self.find_page_mut(va) {
                                if let PageKind::File(f) = child.kind_mut() {
                                    f.note_dirty(true);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}
