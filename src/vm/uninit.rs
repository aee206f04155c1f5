//! Uninitialized pages: the lazy-loading placeholder.
//!
//! Every page enters the SPT in this state. The first fault binds a
//! frame, transmutes the record into its target kind in place, and
//! runs the deferred content initializer. The transition is one-shot;
//! a page never returns to this state.

use crate::error::Result;
use crate::vm::file::FileMapping;
use crate::vm::{Vm, VmType};

/// Deferred content initializer, supplied by the loader or the mmap
/// layer. Runs after the record has become its target kind; `backing`
/// is the page's file slice, when it has one. A plain function plus
/// owned data rather than a closure, so fork can duplicate it.
pub type InitFn = fn(vm: &Vm, backing: Option<&FileMapping>, dst: &mut [u8]) -> Result<()>;

#[derive(Clone)]
pub struct UninitPage {
    ty: VmType,
    backing: Option<FileMapping>,
    init: Option<InitFn>,
}

impl UninitPage {
    /// `ty` is the target kind (markers allowed), never `UNINIT`.
    pub fn new(ty: VmType, backing: Option<FileMapping>, init: Option<InitFn>) -> Self {
        assert!(
            ty.ty() == VmType::ANON || ty.ty() == VmType::FILE,
            "UninitPage::new: bad target type"
        );
        debug_assert!(ty.ty() != VmType::FILE || backing.is_some());
        Self { ty, backing, init }
    }

    /// The target type this page will have after its first fault,
    /// marker bits included.
    pub fn ty(&self) -> VmType {
        self.ty
    }

    pub(crate) fn into_parts(self) -> (VmType, Option<FileMapping>, Option<InitFn>) {
        (self.ty, self.backing, self.init)
    }
}
