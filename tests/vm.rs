//! System-level scenarios: lazy loading, stack growth, mmap
//! writeback, fork, and eviction round-trips.

use std::sync::Arc;

use uvm::addr::{Addr, UVAddr, PGSIZE};
use uvm::memlayout::{STACK_LIMIT, USER_STACK};
use uvm::proc::{Fault, Proc};
use uvm::vm::file::{MemFile, VmFile};
use uvm::vm::page::PageKind;
use uvm::vm::uninit::UninitPage;
use uvm::{Vm, VmError, VmType};

fn small_vm() -> Vm {
    Vm::with_capacity(64, 64, 64)
}

fn user_fault(addr: usize, rsp: usize, write: bool) -> Fault {
    Fault {
        addr,
        rsp,
        user: true,
        write,
        not_present: true,
    }
}

/// Checks the published invariants over one process and the frame
/// table: reciprocal links, mapping agreement, alignment, and that
/// uninitialized pages are never resident.
fn check_invariants(vm: &Vm, proc: &Proc) {
    assert!(vm.frames().consistent());
    for page in proc.spt().iter() {
        assert!(page.va().is_page_aligned());
        match page.kva() {
            Some(kva) => {
                assert_eq!(proc.pml4().get_page(page.va()), Some(kva));
                assert_eq!(proc.pml4().is_writable(page.va()), page.writable());
            }
            None => assert!(proc.pml4().get_page(page.va()).is_none()),
        }
        if let PageKind::Uninit(_) = page.kind() {
            assert!(!page.is_resident());
        }
    }
}

#[test]
fn lazy_load_populates_one_page_at_a_time() {
    let vm = small_vm();
    let mut image = vec![0u8; 4 * PGSIZE];
    for (i, b) in image.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let file = MemFile::new(image.clone());
    let file: Arc<dyn VmFile> = file;

    let mut proc = Proc::new(&vm, "lazy").unwrap();
    // .text: three read-only pages; .data: one writable page.
    proc.map_segment(&file, 0, UVAddr::from(0x40_0000), 3 * PGSIZE, 0, false)
        .unwrap();
    proc.map_segment(&file, 3 * PGSIZE, UVAddr::from(0x60_0000), PGSIZE, 0, true)
        .unwrap();

    assert_eq!(proc.spt().len(), 4);
    for page in proc.spt().iter() {
        assert!(!page.is_resident());
        assert_eq!(page.ty(), VmType::FILE);
        assert!(matches!(page.kind(), PageKind::Uninit(_)));
    }

    // Reading the first text byte faults exactly one page in.
    let mut buf = [0u8; 16];
    proc.copy_in_bytes(&vm, &mut buf, UVAddr::from(0x40_0000))
        .unwrap();
    assert_eq!(&buf[..], &image[..16]);

    let resident: Vec<usize> = proc
        .spt()
        .iter()
        .filter(|p| p.is_resident())
        .map(|p| p.va().into_usize())
        .collect();
    assert_eq!(resident, [0x40_0000]);
    assert_eq!(
        proc.spt()
            .iter()
            .filter(|p| matches!(p.kind(), PageKind::Uninit(_)))
            .count(),
        3
    );

    check_invariants(&vm, &proc);
    proc.exit(&vm, 0);
    assert!(vm.frames().is_empty());
}

#[test]
fn stack_growth_covers_100_kib_of_pushes() {
    let vm = small_vm();
    let mut proc = Proc::new(&vm, "stack").unwrap();
    proc.setup_stack(&vm).unwrap();

    // The program has pushed 100 KiB of locals; rsp sits at the
    // bottom and the frames above it get touched page by page.
    let rsp = USER_STACK - 25 * PGSIZE;
    for k in 2..=25 {
        let addr = USER_STACK - k * PGSIZE;
        proc.handle_fault(&vm, &user_fault(addr, rsp, true)).unwrap();
    }

    assert_eq!(proc.spt().len(), 25);
    for k in 1..=25 {
        let page = proc
            .spt()
            .find_page(UVAddr::from(USER_STACK - k * PGSIZE))
            .unwrap();
        assert!(page.writable());
        assert_eq!(page.ty(), VmType::ANON);
        assert!(!matches!(page.kind(), PageKind::Uninit(_)));
    }
    check_invariants(&vm, &proc);
    proc.exit(&vm, 0);
}

#[test]
fn stack_growth_boundaries() {
    let vm = small_vm();
    let mut proc = Proc::new(&vm, "bounds").unwrap();

    // A push faults 8 bytes below rsp.
    let rsp = USER_STACK - PGSIZE;
    proc.handle_fault(&vm, &user_fault(rsp - 8, rsp, true)).unwrap();

    // An access above rsp inside the stack region grows too, right up
    // to the last byte below USER_STACK.
    proc.handle_fault(&vm, &user_fault(USER_STACK - 1, USER_STACK - 16, true))
        .unwrap();

    // One byte past the 1 MiB limit does not grow.
    let below = USER_STACK - (STACK_LIMIT + 1);
    assert_eq!(
        proc.handle_fault(&vm, &user_fault(below, below, true)),
        Err(VmError::NoPage)
    );

    // Null and kernel addresses fail outright.
    assert_eq!(
        proc.handle_fault(&vm, &user_fault(0, rsp, false)),
        Err(VmError::BadAddress)
    );
    assert_eq!(
        proc.handle_fault(&vm, &user_fault(0x80_0400_0000, rsp, false)),
        Err(VmError::BadAddress)
    );

    // Protection faults are not serviced; there is no copy-on-write.
    assert_eq!(
        proc.handle_fault(
            &vm,
            &Fault {
                addr: USER_STACK - 32,
                rsp: USER_STACK - 32,
                user: true,
                write: true,
                not_present: false,
            }
        ),
        Err(VmError::Protection)
    );

    proc.exit(&vm, 0);
}

#[test]
fn write_fault_on_read_only_page_fails() {
    let vm = small_vm();
    let file: Arc<dyn VmFile> = MemFile::new(vec![7u8; PGSIZE]);
    let mut proc = Proc::new(&vm, "ro").unwrap();
    proc.map_segment(&file, 0, UVAddr::from(0x40_0000), PGSIZE, 0, false)
        .unwrap();
    assert_eq!(
        proc.handle_fault(&vm, &user_fault(0x40_0000, USER_STACK, true)),
        Err(VmError::Protection)
    );
    // A read fault on the same page still succeeds.
    proc.handle_fault(&vm, &user_fault(0x40_0000, USER_STACK, false))
        .unwrap();
    proc.exit(&vm, 0);
}

#[test]
fn mmap_writes_back_exactly_the_dirty_page() {
    let vm = small_vm();
    let base = 0x1000_0000;
    let mut data = vec![0u8; 5000];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let file = MemFile::new(data.clone());
    let mut proc = Proc::new(&vm, "mmap").unwrap();

    let mapped = proc
        .mmap(&vm, base, 5000, true, file.clone(), 0)
        .unwrap();
    assert_eq!(mapped.into_usize(), base);
    assert_eq!(proc.spt().len(), 2);

    // Dirty one byte in the first page.
    proc.copy_out_bytes(&vm, UVAddr::from(base + 0x100), &[0x5a])
        .unwrap();
    check_invariants(&vm, &proc);

    proc.munmap(&vm, base).unwrap();
    assert_eq!(proc.spt().len(), 0);

    let mut expected = data.clone();
    expected[0x100] = 0x5a;
    // Only the first page flowed back; the tail past read_bytes of
    // page two was never touched.
    assert_eq!(file.snapshot(), expected);

    // Unmapping an unmapped address is an error, not corruption.
    assert_eq!(proc.munmap(&vm, base), Err(VmError::BadAddress));
    proc.exit(&vm, 0);
}

#[test]
fn mmap_rejects_overlap_and_bad_args() {
    let vm = small_vm();
    let file: Arc<dyn VmFile> = MemFile::new(vec![1u8; PGSIZE]);
    let mut proc = Proc::new(&vm, "overlap").unwrap();

    proc.mmap(&vm, 0x1000_0000, 100, true, file.clone(), 0).unwrap();
    assert_eq!(
        proc.mmap(&vm, 0x1000_0000, 100, true, file.clone(), 0),
        Err(VmError::AlreadyMapped)
    );
    assert_eq!(
        proc.mmap(&vm, 0, 100, true, file.clone(), 0),
        Err(VmError::BadAddress)
    );
    assert_eq!(
        proc.mmap(&vm, 0x1000_0123, 100, true, file.clone(), 0),
        Err(VmError::BadAddress)
    );
    let empty: Arc<dyn VmFile> = MemFile::new(vec![]);
    assert_eq!(
        proc.mmap(&vm, 0x2000_0000, 100, true, empty, 0),
        Err(VmError::Io)
    );
    proc.exit(&vm, 0);
}

#[test]
fn fork_copies_anon_pages_deeply() {
    let vm = small_vm();
    let mut parent = Proc::new(&vm, "parent").unwrap();
    let va = UVAddr::from(0x2_0000);
    parent
        .alloc_page_with_initializer(va, true, UninitPage::new(VmType::ANON, None, None))
        .unwrap();
    parent.claim_page(&vm, va).unwrap();
    parent.copy_out_bytes(&vm, va, &[0xaa; PGSIZE]).unwrap();

    let mut child = parent.fork(&vm, "child").unwrap();
    let cpage = child.spt().find_page(va).unwrap();
    assert!(cpage.writable());
    assert_eq!(cpage.ty(), VmType::ANON);
    assert_ne!(cpage.kva(), parent.spt().find_page(va).unwrap().kva());

    let mut buf = [0u8; PGSIZE];
    child.copy_in_bytes(&vm, &mut buf, va).unwrap();
    assert!(buf.iter().all(|b| *b == 0xaa));

    // Mutating the parent leaves the child alone.
    parent.copy_out_bytes(&vm, va, &[0x11; PGSIZE]).unwrap();
    child.copy_in_bytes(&vm, &mut buf, va).unwrap();
    assert!(buf.iter().all(|b| *b == 0xaa));

    check_invariants(&vm, &parent);
    check_invariants(&vm, &child);
    parent.exit(&vm, 0);
    child.exit(&vm, 0);
    assert!(vm.frames().is_empty());
}

#[test]
fn fork_preserves_laziness_of_uninit_pages() {
    let vm = small_vm();
    let mut image = vec![0u8; 2 * PGSIZE];
    for (i, b) in image.iter_mut().enumerate() {
        *b = (i % 13) as u8;
    }
    let file: Arc<dyn VmFile> = MemFile::new(image.clone());
    let mut parent = Proc::new(&vm, "lazyfork").unwrap();
    parent
        .map_segment(&file, 0, UVAddr::from(0x40_0000), 2 * PGSIZE, 0, false)
        .unwrap();

    let mut child = parent.fork(&vm, "child").unwrap();
    assert_eq!(child.spt().len(), 2);
    for page in child.spt().iter() {
        assert!(!page.is_resident());
        assert!(matches!(page.kind(), PageKind::Uninit(_)));
    }

    // The child materializes its own copy from the file.
    let mut buf = [0u8; 32];
    child
        .copy_in_bytes(&vm, &mut buf, UVAddr::from(0x40_0000 + PGSIZE))
        .unwrap();
    assert_eq!(&buf[..], &image[PGSIZE..PGSIZE + 32]);

    parent.exit(&vm, 0);
    child.exit(&vm, 0);
}

#[test]
fn eviction_round_trips_through_swap() {
    // Eight user frames, busily overcommitted.
    let vm = Vm::with_capacity(8, 64, 64);
    let mut proc = Proc::new(&vm, "evict").unwrap();

    let npages = 12;
    for k in 0..npages {
        let va = UVAddr::from(0x2_0000 + k * PGSIZE);
        proc.alloc_page_with_initializer(va, true, UninitPage::new(VmType::ANON, None, None))
            .unwrap();
        proc.copy_out_bytes(&vm, va, &[k as u8; PGSIZE]).unwrap();
    }
    // More pages than frames: something must have gone to swap.
    assert!(vm.swap().used() > 0);
    assert!(vm.frames().len() <= 8);
    check_invariants(&vm, &proc);

    // Touching every page again faults the evicted ones back in with
    // their bytes intact.
    let mut buf = [0u8; PGSIZE];
    for k in 0..npages {
        let va = UVAddr::from(0x2_0000 + k * PGSIZE);
        proc.copy_in_bytes(&vm, &mut buf, va).unwrap();
        assert!(buf.iter().all(|b| *b == k as u8), "page {} corrupted", k);
    }

    proc.exit(&vm, 0);
    assert!(vm.frames().is_empty());
    assert_eq!(vm.swap().used(), 0);
    assert_eq!(vm.pool().user_free(), 8);
}

#[test]
fn dirty_file_pages_survive_eviction() {
    let vm = Vm::with_capacity(4, 64, 64);
    let file = MemFile::new(vec![0u8; 4 * PGSIZE]);
    let mut proc = Proc::new(&vm, "filewb").unwrap();
    proc.mmap(&vm, 0x1000_0000, 4 * PGSIZE, true, file.clone(), 0)
        .unwrap();

    // Dirty every page, overcommitting the four frames with anon
    // pages so the file pages get evicted and written back.
    for k in 0..4 {
        let va = UVAddr::from(0x1000_0000 + k * PGSIZE);
        proc.copy_out_bytes(&vm, va, &[k as u8 + 1; 64]).unwrap();
    }
    for k in 0..6 {
        let va = UVAddr::from(0x2_0000 + k * PGSIZE);
        proc.alloc_page_with_initializer(va, true, UninitPage::new(VmType::ANON, None, None))
            .unwrap();
        proc.copy_out_bytes(&vm, va, &[0xee; 8]).unwrap();
    }

    // Rereading the mapped pages gives the written bytes, whether
    // they came from a still-resident frame or went through the file.
    let mut buf = [0u8; 64];
    for k in 0..4 {
        let va = UVAddr::from(0x1000_0000 + k * PGSIZE);
        proc.copy_in_bytes(&vm, &mut buf, va).unwrap();
        assert!(buf.iter().all(|b| *b == k as u8 + 1));
    }

    proc.munmap(&vm, 0x1000_0000).unwrap();
    let snapshot = file.snapshot();
    for k in 0..4 {
        assert!(snapshot[k * PGSIZE..k * PGSIZE + 64]
            .iter()
            .all(|b| *b == k as u8 + 1));
    }
    proc.exit(&vm, 0);
}

#[test]
fn copy_out_into_read_only_buffer_moves_nothing() {
    let vm = small_vm();
    let file: Arc<dyn VmFile> = MemFile::new(vec![3u8; PGSIZE]);
    let mut proc = Proc::new(&vm, "robuf").unwrap();
    proc.map_segment(&file, 0, UVAddr::from(0x40_0000), PGSIZE, 0, false)
        .unwrap();

    // read(fd, buf, n) with buf in a read-only page: rejected before
    // any byte is transferred, so the page is not even faulted in.
    assert_eq!(
        proc.copy_out_bytes(&vm, UVAddr::from(0x40_0000), &[0u8; 128]),
        Err(VmError::Protection)
    );
    assert!(!proc.spt().find_page(UVAddr::from(0x40_0000)).unwrap().is_resident());

    // A buffer outside the address space is just as dead.
    assert_eq!(
        proc.copy_out_bytes(&vm, UVAddr::from(0x9_0000), &[0u8; 8]),
        Err(VmError::BadAddress)
    );
    proc.exit(&vm, 0);
}

#[test]
fn exit_of_empty_process_is_a_no_op() {
    let vm = small_vm();
    let proc = Proc::new(&vm, "empty").unwrap();
    proc.exit(&vm, 0);
    assert!(vm.frames().is_empty());
}
