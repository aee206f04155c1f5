//! Physical page allocator. One arena, split into a user pool that
//! backs user frames and a kernel pool that backs page-table pages.
//! Allocates whole 4096-byte pages.

use core::mem;
use core::ptr::{self, NonNull};

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use spin::Mutex;

use crate::addr::PGSIZE;
use crate::page::{Page, RawPage};

struct Run {
    next: *mut Run,
}

/// A free list of pages inside `[start, start + pages * PGSIZE)`.
///
/// # Safety
///
/// - This singly linked list does not have a cycle.
/// - If head is null, the list is empty. Otherwise head is its first
///   element, which is a free page inside the range.
pub struct Kmem {
    head: *mut Run,
    start: usize,
    pages: usize,
    nfree: usize,
}

impl Kmem {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            start: 0,
            pages: 0,
            nfree: 0,
        }
    }

    /// Builds the free list over `pages` pages starting at `start`.
    ///
    /// # Safety
    ///
    /// The range must be valid, page-aligned memory owned by the
    /// caller and not covered by any other `Kmem` or outstanding
    /// `Page`. Must be called exactly once.
    unsafe fn init(&mut self, start: usize, pages: usize) {
        self.start = start;
        self.pages = pages;
        for pa in num_iter::range_step(start, start + pages * PGSIZE, PGSIZE) {
            // SAFETY: pa is a page inside the exclusively owned range.
            self.free(unsafe { Page::from_usize(pa) });
        }
    }

    fn free(&mut self, page: Page) {
        let pa = page.into_usize();
        debug_assert!(
            pa % PGSIZE == 0 && (self.start..self.start + self.pages * PGSIZE).contains(&pa),
            "Kmem::free"
        );
        let r = pa as *mut Run;
        // SAFETY: pa was uniquely owned by the given page, so linking
        // it in cannot create a cycle.
        unsafe { (*r).next = self.head };
        self.head = r;
        self.nfree += 1;
    }

    fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head is not null and the structure of this list is
        // maintained by the invariant.
        let next = unsafe { (*self.head).next };
        self.nfree -= 1;
        // SAFETY: the first element is a free page by the invariant.
        Some(unsafe { Page::from_usize(mem::replace(&mut self.head, next) as _) })
    }
}

/// The page pools. Owns the arena backing every `Page` in the system.
pub struct PagePool {
    base: NonNull<RawPage>,
    pages: usize,
    user: Mutex<Kmem>,
    kernel: Mutex<Kmem>,
}

impl PagePool {
    pub fn new(user_pages: usize, kernel_pages: usize) -> Self {
        let pages = user_pages + kernel_pages;
        assert!(pages > 0, "PagePool::new: empty arena");
        let layout = Layout::array::<RawPage>(pages).expect("PagePool::new: layout");
        // SAFETY: layout has nonzero size.
        let base = unsafe { alloc_zeroed(layout) } as *mut RawPage;
        let base = NonNull::new(base).expect("PagePool::new: arena allocation failed");

        let mut user = Kmem::new();
        let mut kernel = Kmem::new();
        // SAFETY: the two ranges partition the freshly allocated arena,
        // which nothing else owns.
        unsafe {
            user.init(base.as_ptr() as usize, user_pages);
            kernel.init(base.as_ptr() as usize + user_pages * PGSIZE, kernel_pages);
        }

        Self {
            base,
            pages,
            user: Mutex::new(user),
            kernel: Mutex::new(kernel),
        }
    }

    /// Allocates a user frame. `None` when the user pool is exhausted;
    /// the caller is expected to evict.
    pub fn alloc_user(&self) -> Option<Page> {
        self.user.lock().alloc()
    }

    pub fn free_user(&self, page: Page) {
        self.user.lock().free(page);
    }

    /// Allocates a page-table page.
    pub fn alloc_kernel(&self) -> Option<Page> {
        self.kernel.lock().alloc()
    }

    pub fn free_kernel(&self, page: Page) {
        self.kernel.lock().free(page);
    }

    pub fn user_free(&self) -> usize {
        self.user.lock().nfree
    }

    pub fn kernel_free(&self) -> usize {
        self.kernel.lock().nfree
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let layout = Layout::array::<RawPage>(self.pages).expect("PagePool::drop: layout");
        // SAFETY: base was allocated in new() with the same layout.
        // Outstanding pages would now dangle, but the teardown
        // discipline (process exit before dropping the Vm) returns
        // every page first.
        unsafe { dealloc(self.base.as_ptr() as *mut u8, layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_reuse() {
        let pool = PagePool::new(2, 1);
        let a = pool.alloc_user().unwrap();
        let b = pool.alloc_user().unwrap();
        assert!(pool.alloc_user().is_none());
        assert_eq!(pool.user_free(), 0);
        let addr = a.addr();
        pool.free_user(a);
        let c = pool.alloc_user().unwrap();
        assert_eq!(c.addr(), addr);
        pool.free_user(b);
        pool.free_user(c);
        assert_eq!(pool.user_free(), 2);
    }

    #[test]
    fn pools_are_disjoint() {
        let pool = PagePool::new(1, 1);
        let u = pool.alloc_user().unwrap();
        let k = pool.alloc_kernel().unwrap();
        assert_ne!(u.addr(), k.addr());
        pool.free_user(u);
        pool.free_kernel(k);
    }

    #[test]
    fn arena_is_zeroed() {
        let pool = PagePool::new(1, 0);
        let page = pool.alloc_user().unwrap();
        assert!(page.iter().all(|b| *b == 0));
        pool.free_user(page);
    }
}
