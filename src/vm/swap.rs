//! The swap device. A fixed array of page-sized slots; one slot owns
//! the bytes of one evicted anonymous page. The lock is held only
//! around slot accounting and slot I/O.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitmaps::Bitmap;
use spin::Mutex;

use crate::addr::PGSIZE;
use crate::page::RawPage;
use crate::param::SWAP_SLOTS;

struct SwapInner {
    map: Bitmap<SWAP_SLOTS>,
    nslots: usize,
    used: usize,
    data: Box<[RawPage]>,
}

pub struct Swap {
    inner: Mutex<SwapInner>,
}

impl Swap {
    pub fn new(nslots: usize) -> Self {
        assert!(0 < nslots && nslots <= SWAP_SLOTS, "Swap::new");
        let data: Vec<RawPage> = (0..nslots).map(|_| RawPage::ZERO).collect();
        Self {
            inner: Mutex::new(SwapInner {
                map: Bitmap::new(),
                nslots,
                used: 0,
                data: data.into_boxed_slice(),
            }),
        }
    }

    /// Reserves a free slot. Exhausting swap leaves eviction nowhere
    /// to put the victim, which is fatal in this kernel.
    pub(crate) fn alloc(&self) -> usize {
        let mut inner = self.inner.lock();
        let slot = match inner.map.first_false_index() {
            Some(slot) if slot < inner.nslots => slot,
            _ => panic!("swap: out of slots"),
        };
        let _ = inner.map.set(slot, true);
        inner.used += 1;
        slot
    }

    pub(crate) fn free(&self, slot: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.map.get(slot), "Swap::free: slot not in use");
        let _ = inner.map.set(slot, false);
        inner.used -= 1;
    }

    /// Copies a page into `slot`.
    pub(crate) fn write(&self, slot: usize, src: &[u8]) {
        debug_assert_eq!(src.len(), PGSIZE);
        let mut inner = self.inner.lock();
        debug_assert!(inner.map.get(slot), "Swap::write: slot not in use");
        inner.data[slot].bytes_mut().copy_from_slice(src);
    }

    /// Copies `slot` into a page. Does not release the slot.
    pub(crate) fn read(&self, slot: usize, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), PGSIZE);
        let inner = self.inner.lock();
        debug_assert!(inner.map.get(slot), "Swap::read: slot not in use");
        dst.copy_from_slice(inner.data[slot].bytes());
    }

    /// Slots currently holding an evicted page.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_round_trip_and_reuse() {
        let swap = Swap::new(2);
        let a = swap.alloc();
        let b = swap.alloc();
        assert_ne!(a, b);
        assert_eq!(swap.used(), 2);

        let src = [0xaa_u8; PGSIZE];
        swap.write(a, &src);
        let mut dst = [0_u8; PGSIZE];
        swap.read(a, &mut dst);
        assert_eq!(&dst[..], &src[..]);

        swap.free(a);
        assert_eq!(swap.used(), 1);
        let c = swap.alloc();
        assert_eq!(c, a);
        swap.free(b);
        swap.free(c);
    }

    #[test]
    #[should_panic(expected = "out of slots")]
    fn exhaustion_panics() {
        let swap = Swap::new(1);
        let _ = swap.alloc();
        let _ = swap.alloc();
    }
}
