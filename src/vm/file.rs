//! File-backed pages and memory-mapped files.
//!
//! A file page mirrors one page-sized byte range of a file:
//! `read_bytes` from `offset`, then `zero_bytes` of zero fill. Dirty
//! writable pages flow back to the file on eviction, unmap, and
//! teardown. Every file access happens under the global filesystem
//! lock of the owning [`Vm`].

use core::cmp;

use alloc::sync::Arc;
use log::debug;
use num_iter::range_step;

use crate::addr::{pg_ofs, pg_round_up, UVAddr, PGSIZE};
use crate::error::{Result, VmError};
use crate::memlayout::KERN_BASE;
use crate::proc::Proc;
use crate::vm::uninit::UninitPage;
use crate::vm::{Vm, VmType};

/// The filesystem surface the VM consumes. Implementations back
/// executables and memory-mapped files; reads and writes may block.
pub trait VmFile {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `buf.len()` bytes at `off`. Short reads reach the
    /// caller, which treats them as errors where exact counts matter.
    fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize>;

    fn write_at(&self, buf: &[u8], off: usize) -> Result<usize>;
}

/// One page's slice of a file.
#[derive(Clone)]
pub struct FileMapping {
    file: Arc<dyn VmFile>,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
}

impl FileMapping {
    pub fn new(file: Arc<dyn VmFile>, offset: usize, read_bytes: usize, zero_bytes: usize) -> Self {
        assert!(read_bytes + zero_bytes == PGSIZE, "FileMapping::new");
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
        }
    }

    pub fn file(&self) -> &Arc<dyn VmFile> {
        &self.file
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }
}

/// The file-backed page kind.
pub struct FilePage {
    mapping: FileMapping,
    /// Dirty bit checkpointed from the hardware entry whenever the
    /// mapping is torn down; cleared by a successful writeback.
    dirty: bool,
}

impl FilePage {
    pub(crate) fn new(mapping: FileMapping) -> Self {
        Self {
            mapping,
            dirty: false,
        }
    }

    pub fn mapping(&self) -> &FileMapping {
        &self.mapping
    }

    pub(crate) fn dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn note_dirty(&mut self, dirty: bool) {
        self.dirty |= dirty;
    }

    /// Reads `read_bytes` at `offset` into the frame and zero-fills
    /// the tail.
    pub(crate) fn swap_in(&mut self, vm: &Vm, dst: &mut [u8]) -> Result<()> {
        let m = &self.mapping;
        {
            let _fs = vm.fs_lock();
            let n = m.file.read_at(&mut dst[..m.read_bytes], m.offset)?;
            if n != m.read_bytes {
                return Err(VmError::Io);
            }
        }
        dst[m.read_bytes..].fill(0);
        Ok(())
    }

    /// Writes `read_bytes` back to the file iff the page is dirty and
    /// was writable. `hw_dirty` is the checkpointed hardware bit.
    pub(crate) fn flush(&mut self, vm: &Vm, writable: bool, hw_dirty: bool, src: &[u8]) -> Result<()> {
        self.dirty |= hw_dirty;
        if !self.dirty || !writable {
            return Ok(());
        }
        let m = &self.mapping;
        let _fs = vm.fs_lock();
        let n = m.file.write_at(&src[..m.read_bytes], m.offset)?;
        if n != m.read_bytes {
            return Err(VmError::Io);
        }
        self.dirty = false;
        Ok(())
    }
}

/// A contiguous mmap'd range, remembered so `munmap(addr)` can find
/// its extent. The region keeps the file open for its pages.
#[derive(Clone)]
pub struct MmapRegion {
    addr: UVAddr,
    pages: usize,
    file: Arc<dyn VmFile>,
}

impl MmapRegion {
    pub fn addr(&self) -> UVAddr {
        self.addr
    }

    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl Proc {
    /// Maps `length` bytes of `file` starting at `offset` into the
    /// address space at `addr`, lazily. Returns the mapped address.
    pub fn mmap(
        &mut self,
        vm: &Vm,
        addr: usize,
        length: usize,
        writable: bool,
        file: Arc<dyn VmFile>,
        offset: usize,
    ) -> Result<UVAddr> {
        if addr == 0 || pg_ofs(addr) != 0 || pg_ofs(offset) != 0 || length == 0 {
            return Err(VmError::BadAddress);
        }
        let end = addr.checked_add(length).ok_or(VmError::BadAddress)?;
        if end > KERN_BASE {
            return Err(VmError::BadAddress);
        }
        {
            let _fs = vm.fs_lock();
            if file.is_empty() {
                return Err(VmError::Io);
            }
        }
        let va = UVAddr::from(addr);
        let pages = pg_round_up(length) / PGSIZE;
        for i in range_step(0, pages * PGSIZE, PGSIZE) {
            if self.spt().find_page(va + i).is_some() {
                return Err(VmError::AlreadyMapped);
            }
        }
        if self.mmap_regions().len() == self.mmap_regions().capacity() {
            return Err(VmError::OutOfMemory);
        }

        let mut remaining = length;
        for i in range_step(0, pages * PGSIZE, PGSIZE) {
            let read_bytes = cmp::min(remaining, PGSIZE);
            let mapping = FileMapping::new(file.clone(), offset + i, read_bytes, PGSIZE - read_bytes);
            self.alloc_page_with_initializer(
                va + i,
                writable,
                UninitPage::new(VmType::FILE, Some(mapping), None),
            )?;
            remaining -= read_bytes;
        }
        self.push_mmap_region(MmapRegion { addr: va, pages, file });
        debug!("mmap {:#x} ({} pages)", addr, pages);
        Ok(va)
    }

    /// Unmaps the region mapped at `addr`, writing dirty pages back.
    /// `addr` must be the address a previous `mmap` returned.
    pub fn munmap(&mut self, vm: &Vm, addr: usize) -> Result<()> {
        let va = UVAddr::from(addr);
        let region = self.take_mmap_region(va).ok_or(VmError::BadAddress)?;
        for i in range_step(0, region.pages * PGSIZE, PGSIZE) {
            // Destruction of a resident dirty file page performs the
            // writeback.
            let _ = self.remove_page(vm, region.addr + i);
        }
        debug!("munmap {:#x} ({} pages)", addr, region.pages);
        Ok(())
    }
}

/// An in-memory file, for wiring the VM to tests and demo loaders.
pub struct MemFile {
    data: spin::Mutex<alloc::vec::Vec<u8>>,
}

impl MemFile {
    pub fn new(data: alloc::vec::Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: spin::Mutex::new(data),
        })
    }

    pub fn snapshot(&self) -> alloc::vec::Vec<u8> {
        self.data.lock().clone()
    }
}

impl VmFile for MemFile {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        let data = self.data.lock();
        if off >= data.len() {
            return Ok(0);
        }
        let n = cmp::min(buf.len(), data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], off: usize) -> Result<usize> {
        let mut data = self.data.lock();
        if off >= data.len() {
            return Ok(0);
        }
        let n = cmp::min(buf.len(), data.len() - off);
        data[off..off + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }
}
