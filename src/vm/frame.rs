//! The global frame table.
//!
//! Every resident frame sits in one circular ring guarded by a single
//! lock; the clock hand sweeps it for victims. A frame in flight —
//! between allocation and a successful claim, or between victim
//! selection and rebinding — is out of the ring, so the hand can never
//! steal a frame whose contents are still moving.

use core::ptr;

use alloc::boxed::Box;
use spin::Mutex;

use crate::addr::{Addr, KVAddr, PGSIZE};
use crate::list::ListEntry;
use crate::page::Page;
use crate::palloc::PagePool;
use crate::pml4::Pml4;
use crate::vm::page::VmPage;

/// A physical frame and its current occupant.
///
/// # Safety
///
/// - The physical page at `kva` is owned by this record for its whole
///   life and released only through `free`.
/// - While the frame is in the ring, `page` and `pml4` are non-null
///   and valid: `page` is the single resident page record whose own
///   `frame` link points back here, and `pml4` is the hardware table
///   of the process owning that page. Both links change only under
///   the frame-table lock.
#[repr(C)]
pub struct Frame {
    /// Ring node. Must remain the first field.
    elem: ListEntry,
    kva: KVAddr,
    pub(crate) page: *mut VmPage,
    pub(crate) pml4: *mut Pml4,
}

impl Frame {
    /// Wraps a freshly allocated user page. The frame takes over the
    /// page's ownership.
    pub(crate) fn new(mem: Page) -> Box<Frame> {
        let kva = mem.addr();
        let _ = mem.into_usize();
        Box::new(Frame {
            // SAFETY: linked when the frame enters the ring.
            elem: unsafe { ListEntry::new() },
            kva,
            page: ptr::null_mut(),
            pml4: ptr::null_mut(),
        })
    }

    pub(crate) fn kva(&self) -> KVAddr {
        self.kva
    }

    pub(crate) fn bytes(&self) -> &[u8; PGSIZE] {
        // SAFETY: the frame owns the page at kva.
        unsafe { &*(self.kva.into_usize() as *const [u8; PGSIZE]) }
    }

    /// Returns the physical page to the user pool and drops the record.
    pub(crate) fn free(self: Box<Self>, pool: &PagePool) {
        // SAFETY: the frame owned the page at kva exclusively.
        pool.free_user(unsafe { Page::from_usize(self.kva.into_usize()) });
    }
}

struct FrameRing {
    /// The clock hand; null iff the ring is empty.
    hand: *mut Frame,
    len: usize,
}

/// # Safety
///
/// Ring membership and the back-references of member frames are
/// mutated only while holding this lock.
pub struct FrameTable {
    ring: Mutex<FrameRing>,
}

impl FrameTable {
    pub(crate) fn new() -> Self {
        Self {
            ring: Mutex::new(FrameRing {
                hand: ptr::null_mut(),
                len: 0,
            }),
        }
    }

    /// Enters a claimed frame into the ring.
    pub(crate) fn push(&self, frame: Box<Frame>) {
        let mut ring = self.ring.lock();
        let p = Box::into_raw(frame);
        if ring.hand.is_null() {
            // SAFETY: p is a live frame we exclusively own.
            unsafe { (*p).elem.init() };
            ring.hand = p;
        } else {
            // Joins just behind the hand: the youngest frame is the
            // last the current sweep will reach.
            unsafe { (*ring.hand).elem.push_back(&mut (*p).elem) };
        }
        ring.len += 1;
    }

    /// Takes `frame` out of the ring, regaining ownership.
    pub(crate) fn pop(&self, frame: *mut Frame) -> Box<Frame> {
        let mut ring = self.ring.lock();
        debug_assert!(!frame.is_null() && ring.len > 0, "FrameTable::pop");
        // SAFETY: callers pass a frame that is in the ring (their
        // page's non-null frame link), so it is live and linked.
        unsafe {
            if ptr::eq(ring.hand, frame) {
                let next = (*frame).elem.next() as *mut Frame;
                ring.hand = if ptr::eq(next, frame) {
                    ptr::null_mut()
                } else {
                    next
                };
            }
            (*frame).elem.remove();
            ring.len -= 1;
            Box::from_raw(frame)
        }
    }

    /// Second-chance victim selection. Advances the hand, giving every
    /// referenced frame one pass; the first unreferenced frame is the
    /// victim, which the caller then pops. `None` iff the ring is
    /// empty.
    pub(crate) fn pick_victim(&self) -> Option<*mut Frame> {
        let mut ring = self.ring.lock();
        if ring.hand.is_null() {
            return None;
        }
        for _ in 0..2 * ring.len {
            let f = ring.hand;
            // SAFETY: ring frames have valid back-references under the
            // frame-table lock, per the invariant.
            unsafe {
                ring.hand = (*f).elem.next() as *mut Frame;
                let va = (*(*f).page).va();
                let pml4 = &mut *(*f).pml4;
                if pml4.is_accessed(va) {
                    pml4.set_accessed(va, false);
                } else {
                    return Some(f);
                }
            }
        }
        // One full sweep cleared every accessed bit, so the second
        // finds a victim; reaching here still yields the hand to keep
        // eviction making progress.
        Some(ring.hand)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the reciprocal page<->frame links of every ring member.
    pub fn consistent(&self) -> bool {
        let ring = self.ring.lock();
        if ring.hand.is_null() {
            return true;
        }
        let mut f = ring.hand;
        loop {
            // SAFETY: ring frames are live and linked; back-references
            // are valid under the lock.
            unsafe {
                let page = (*f).page;
                if page.is_null() || !ptr::eq((*page).frame_ptr(), f) {
                    return false;
                }
                f = (*f).elem.next() as *mut Frame;
            }
            if ptr::eq(f, ring.hand) {
                return true;
            }
        }
    }
}
