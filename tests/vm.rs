//! Demand paging scenarios: lazy anonymous pages, swap pressure, the
//! stack-growth policy, fault denials, and fork's address-space copy.

mod common;

use pv6_core::param::{PGSIZE, STACK_PAGES, USER_STACK};
use pv6_core::proc::Proc;
use pv6_core::vm::PageKind;
use pv6_core::KernelError;

const HEAP: usize = 0x1000_0000;

#[test]
fn lazy_anon_page_faults_in_zeroed() {
    let k = common::boot();
    let mut p = Proc::new();

    p.map_anon(HEAP, true).unwrap();
    // Nothing resident until the first touch.
    assert_eq!(k.frames.len(), 0);

    let mut buf = [1u8; 32];
    p.read_bytes(&k, HEAP + 100, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 32]);
    assert_eq!(k.frames.len(), 1);

    p.exit(&k);
    k.shutdown();
}

#[test]
fn write_to_readonly_page_is_denied() {
    let k = common::boot();
    let mut p = Proc::new();

    p.map_anon(HEAP, false).unwrap();
    let mut b = [0u8; 4];
    p.read_bytes(&k, HEAP, &mut b).unwrap();
    assert_eq!(p.write_bytes(&k, HEAP, &[1]), Err(KernelError::Denied));

    p.exit(&k);
    k.shutdown();
}

#[test]
fn kernel_addresses_and_unmapped_reads_are_denied() {
    let k = common::boot();
    let mut p = Proc::new();

    assert!(!p.handle_fault(&k, pv6_core::param::KERN_BASE + 0x1000, true, true));
    // A read of an address nobody mapped is not stack growth.
    assert_eq!(
        p.read_bytes(&k, 0x7000_0000, &mut [0u8; 1]),
        Err(KernelError::Denied)
    );

    p.exit(&k);
    k.shutdown();
}

#[test]
fn stack_growth_honors_the_push_boundary() {
    let k = common::boot();
    let mut p = Proc::new();
    p.rsp = USER_STACK - 64 * PGSIZE;

    // One byte below the PUSH window: denied.
    assert!(!p.handle_fault(&k, p.rsp - 9, true, true));
    // Exactly rsp - 8: the stack grows.
    assert!(p.handle_fault(&k, p.rsp - 8, true, true));

    // Reads do not grow the stack.
    let mut p2 = Proc::new();
    p2.rsp = USER_STACK - 64 * PGSIZE;
    assert!(!p2.handle_fault(&k, p2.rsp - 8, false, true));

    // Outside the 256-page stack region: denied even for writes above
    // rsp.
    let mut p3 = Proc::new();
    p3.rsp = USER_STACK - (STACK_PAGES + 8) * PGSIZE;
    assert!(!p3.handle_fault(&k, p3.rsp - 8, true, true));
    assert!(!p3.handle_fault(&k, USER_STACK, true, true));

    p.exit(&k);
    p2.exit(&k);
    p3.exit(&k);
    k.shutdown();
}

#[test]
fn grown_stack_pages_read_back_zero_then_hold_data() {
    let k = common::boot();
    let mut p = Proc::new();
    p.rsp = USER_STACK - 8;

    p.write_bytes(&k, p.rsp - 8, &[0xaa; 8]).unwrap();
    let mut b = [0u8; 8];
    p.read_bytes(&k, p.rsp - 8, &mut b).unwrap();
    assert_eq!(b, [0xaa; 8]);

    p.exit(&k);
    k.shutdown();
}

/// 200 anonymous pages against 8 physical frames: every touch past the
/// pool size forces an eviction to swap, and a second pass still reads
/// the value each page was given.
#[test]
fn swap_pressure_round_trip() {
    let k = common::boot();
    let mut p = Proc::new();

    const PAGES: usize = 200;
    for i in 0..PAGES {
        p.map_anon(HEAP + i * PGSIZE, true).unwrap();
    }
    for i in 0..PAGES {
        // Value in the first sector, another near the end of the page so
        // two sectors carry data.
        let va = HEAP + i * PGSIZE;
        p.write_bytes(&k, va + 16, &[i as u8; 8]).unwrap();
        p.write_bytes(&k, va + PGSIZE - 8, &[(i * 7) as u8; 8]).unwrap();
    }
    assert_eq!(k.frames.len(), 8);

    for i in 0..PAGES {
        let va = HEAP + i * PGSIZE;
        let mut head = [0u8; 8];
        let mut tail = [0u8; 8];
        let mut zeros = [1u8; 8];
        p.read_bytes(&k, va + 16, &mut head).unwrap();
        p.read_bytes(&k, va + PGSIZE - 8, &mut tail).unwrap();
        // Untouched sectors of a swapped page come back as zeros.
        p.read_bytes(&k, va + 2048, &mut zeros).unwrap();
        assert_eq!(head, [i as u8; 8], "page {}", i);
        assert_eq!(tail, [(i * 7) as u8; 8], "page {}", i);
        assert_eq!(zeros, [0u8; 8], "page {}", i);
    }

    p.exit(&k);
    k.shutdown();
}

/// The resident/slot invariant: an anonymous page holds a swap slot
/// exactly while it is not resident.
#[test]
fn anon_slot_tracks_residency() {
    let k = common::boot();
    let mut p = Proc::new();

    const PAGES: usize = 24;
    for i in 0..PAGES {
        let va = HEAP + i * PGSIZE;
        p.map_anon(va, true).unwrap();
        p.write_bytes(&k, va, &[0x42]).unwrap();
    }

    for i in 0..PAGES {
        let page_ref = p.spt.find(HEAP + i * PGSIZE).unwrap();
        let page = page_ref.lock().unwrap();
        match &page.kind {
            PageKind::Anon(anon) => {
                assert_eq!(anon.slot.is_some(), page.frame.is_none(), "page {}", i)
            }
            _ => panic!("page {} is not anonymous", i),
        }
    }

    p.exit(&k);
    k.shutdown();
}

/// Fork copies the address space eagerly: the child's writes never show
/// through to the parent.
#[test]
fn fork_isolates_parent_and_child() {
    let k = common::boot();
    let mut parent = Proc::new();

    parent.map_anon(0x1000_0000, true).unwrap();
    parent.write_bytes(&k, 0x1000_0000, &[0x55]).unwrap();

    let mut child = parent.fork(&k).unwrap();
    child.write_bytes(&k, 0x1000_0000, &[0xaa]).unwrap();

    let mut b = [0u8; 1];
    child.read_bytes(&k, 0x1000_0000, &mut b).unwrap();
    assert_eq!(b[0], 0xaa);
    child.exit(&k);

    parent.read_bytes(&k, 0x1000_0000, &mut b).unwrap();
    assert_eq!(b[0], 0x55);

    parent.exit(&k);
    k.shutdown();
}

/// Fork under memory pressure: the copied space spans more pages than
/// there are frames, so source pages fault back in from swap during the
/// copy.
#[test]
fn fork_copies_swapped_pages() {
    let k = common::boot();
    let mut parent = Proc::new();

    const PAGES: usize = 20;
    for i in 0..PAGES {
        let va = HEAP + i * PGSIZE;
        parent.map_anon(va, true).unwrap();
        parent.write_bytes(&k, va, &[i as u8 + 1; 4]).unwrap();
    }

    let mut child = parent.fork(&k).unwrap();
    for i in 0..PAGES {
        let mut b = [0u8; 4];
        child.read_bytes(&k, HEAP + i * PGSIZE, &mut b).unwrap();
        assert_eq!(b, [i as u8 + 1; 4], "page {}", i);
    }

    child.exit(&k);
    parent.exit(&k);
    k.shutdown();
}

/// Exit releases every frame and swap slot the process held.
#[test]
fn exit_returns_frames_to_the_pool() {
    let k = common::boot();
    let mut p = Proc::new();

    for i in 0..16 {
        let va = HEAP + i * PGSIZE;
        p.map_anon(va, true).unwrap();
        p.write_bytes(&k, va, &[1]).unwrap();
    }
    assert_eq!(k.frames.len(), 8);
    p.exit(&k);
    assert_eq!(k.frames.len(), 0);

    // The pool is fully usable again.
    let mut q = Proc::new();
    for i in 0..16 {
        let va = HEAP + i * PGSIZE;
        q.map_anon(va, true).unwrap();
        q.write_bytes(&k, va, &[2]).unwrap();
    }
    q.exit(&k);
    k.shutdown();
}

#[test]
fn duplicate_mapping_is_rejected() {
    let k = common::boot();
    let mut p = Proc::new();

    p.map_anon(HEAP, true).unwrap();
    assert_eq!(p.map_anon(HEAP, true), Err(KernelError::AlreadyExists));

    p.exit(&k);
    k.shutdown();
}
