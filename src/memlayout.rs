//! User address-space layout.
//!
//! User virtual addresses run from 0 up to `KERN_BASE`; everything at
//! or above `KERN_BASE` belongs to the kernel and is never mapped on
//! behalf of a user process. The user stack starts at `USER_STACK` and
//! grows down, at most `STACK_LIMIT` bytes.

use crate::addr::{Addr, UVAddr};

/// First kernel virtual address; user space ends here.
pub const KERN_BASE: usize = 0x8004_000000;

/// Initial top of the user stack.
pub const USER_STACK: usize = 0x4748_0000;

/// Maximum user stack size in bytes.
pub const STACK_LIMIT: usize = 1 << 20;

#[inline]
pub fn is_user_vaddr(va: UVAddr) -> bool {
    va.into_usize() < KERN_BASE
}

/// True iff `addr` lies in the stack-growth region
/// `[USER_STACK - STACK_LIMIT, USER_STACK)`.
#[inline]
pub fn in_stack_region(addr: usize) -> bool {
    (USER_STACK - STACK_LIMIT..USER_STACK).contains(&addr)
}
