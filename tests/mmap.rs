//! Memory-mapped files: lazy loading, writeback at munmap, region
//! reference counting, and failure unwinding.

mod common;

use pv6_core::fs::ROOT_CLUSTER;
use pv6_core::param::PGSIZE;
use pv6_core::proc::Proc;
use pv6_core::KernelError;

const MAP: usize = 0x2000_0000;

fn make_file(k: &pv6_core::Kernel, p: &mut Proc, name: &str, len: usize) {
    p.create(k, name, 0).unwrap();
    let fd = p.open(k, name).unwrap();
    let data = common::pattern(len);
    let mut written = 0;
    while written < len {
        written += p.write(k, fd, &data[written..]).unwrap();
    }
    p.close(k, fd).unwrap();
}

fn read_file(k: &pv6_core::Kernel, p: &mut Proc, name: &str) -> Vec<u8> {
    let fd = p.open(k, name).unwrap();
    let len = p.filesize(fd).unwrap();
    let mut data = vec![0u8; len];
    let mut read = 0;
    while read < len {
        let n = p.read(k, fd, &mut data[read..]).unwrap();
        assert!(n > 0);
        read += n;
    }
    p.close(k, fd).unwrap();
    data
}

/// Modifications through a mapping land in the file at munmap; bytes the
/// process never wrote stay untouched, and the length does not change.
#[test]
fn dirty_pages_write_back_at_munmap() {
    let k = common::boot();
    let mut p = Proc::new();
    make_file(&k, &mut p, "m", 9000);

    let fd = p.open(&k, "m").unwrap();
    assert_eq!(p.mmap(&k, MAP, 9000, true, fd, 0).unwrap(), MAP);

    p.write_bytes(&k, MAP, &[0xff]).unwrap();
    p.write_bytes(&k, MAP + 8192, &[0xee]).unwrap();
    p.munmap(&k, MAP).unwrap();
    p.close(&k, fd).unwrap();

    let mut expect = common::pattern(9000);
    expect[0] = 0xff;
    expect[8192] = 0xee;
    assert_eq!(read_file(&k, &mut p, "m"), expect);

    k.shutdown();
}

/// Reading through a mapping sees the file, and a clean munmap leaves it
/// byte-identical.
#[test]
fn clean_region_leaves_file_identical() {
    let k = common::boot();
    let mut p = Proc::new();
    make_file(&k, &mut p, "c", 5000);

    let fd = p.open(&k, "c").unwrap();
    p.mmap(&k, MAP, 5000, true, fd, 0).unwrap();

    let mut b = [0u8; 16];
    p.read_bytes(&k, MAP + 4096, &mut b).unwrap();
    assert_eq!(&b[..], &common::pattern(5000)[4096..4112]);
    // The tail past end of file is zero-filled.
    let mut tail = [1u8; 8];
    p.read_bytes(&k, MAP + 5000, &mut tail).unwrap();
    assert_eq!(tail, [0u8; 8]);

    p.munmap(&k, MAP).unwrap();
    p.close(&k, fd).unwrap();

    assert_eq!(read_file(&k, &mut p, "c"), common::pattern(5000));
    k.shutdown();
}

/// A mapping stays usable after the descriptor that spawned it closes:
/// the region holds its own reopened handle.
#[test]
fn mapping_outlives_the_descriptor() {
    let k = common::boot();
    let mut p = Proc::new();
    make_file(&k, &mut p, "o", 4096);

    let fd = p.open(&k, "o").unwrap();
    p.mmap(&k, MAP, 4096, true, fd, 0).unwrap();
    p.close(&k, fd).unwrap();

    p.write_bytes(&k, MAP + 10, b"through the map").unwrap();
    p.munmap(&k, MAP).unwrap();

    let data = read_file(&k, &mut p, "o");
    assert_eq!(&data[10..25], b"through the map");
    k.shutdown();
}

/// Two mappings of one file keep the inode open until both are gone.
#[test]
fn two_regions_both_contribute_to_the_close() {
    let k = common::boot();
    let mut p = Proc::new();
    make_file(&k, &mut p, "two", 2 * PGSIZE);

    let ip = k.fs.open(ROOT_CLUSTER, "two").unwrap();
    let cluster = ip.cluster;
    k.fs.inode_close(ip);

    let fd = p.open(&k, "two").unwrap();
    p.mmap(&k, MAP, PGSIZE, true, fd, 0).unwrap();
    p.mmap(&k, MAP + 0x10_0000, PGSIZE, true, fd, PGSIZE).unwrap();
    p.close(&k, fd).unwrap();
    // One reference per region.
    assert_eq!(k.fs.itable.open_count(cluster), 2);

    p.munmap(&k, MAP).unwrap();
    assert_eq!(k.fs.itable.open_count(cluster), 1);
    p.munmap(&k, MAP + 0x10_0000).unwrap();
    assert_eq!(k.fs.itable.open_count(cluster), 0);

    k.shutdown();
}

/// Pages never faulted in still tear down correctly: mmap immediately
/// followed by munmap releases the region and the file handle.
#[test]
fn unfaulted_region_unmaps_cleanly() {
    let k = common::boot();
    let mut p = Proc::new();
    make_file(&k, &mut p, "u", 3 * PGSIZE);

    let fd = p.open(&k, "u").unwrap();
    p.mmap(&k, MAP, 3 * PGSIZE, true, fd, 0).unwrap();
    p.munmap(&k, MAP).unwrap();
    p.close(&k, fd).unwrap();

    let ip = k.fs.open(ROOT_CLUSTER, "u").unwrap();
    let cluster = ip.cluster;
    k.fs.inode_close(ip);
    assert_eq!(k.fs.itable.open_count(cluster), 0);
    assert_eq!(read_file(&k, &mut p, "u"), common::pattern(3 * PGSIZE));
    k.shutdown();
}

/// Bad arguments are rejected up front; a range collision unwinds the
/// pages already created, leaving no partial mapping behind.
#[test]
fn invalid_and_overlapping_mappings_fail_atomically() {
    let k = common::boot();
    let mut p = Proc::new();
    make_file(&k, &mut p, "v", 4 * PGSIZE);
    let fd = p.open(&k, "v").unwrap();

    assert_eq!(
        p.mmap(&k, MAP + 1, PGSIZE, true, fd, 0),
        Err(KernelError::InvalidArg)
    );
    assert_eq!(
        p.mmap(&k, MAP, PGSIZE, true, fd, 100),
        Err(KernelError::InvalidArg)
    );
    assert_eq!(p.mmap(&k, MAP, 0, true, fd, 0), Err(KernelError::InvalidArg));
    // Offset beyond end of file.
    assert_eq!(
        p.mmap(&k, MAP, PGSIZE, true, fd, 16 * PGSIZE),
        Err(KernelError::InvalidArg)
    );

    // Occupy the third page of the target range, then try to map four
    // pages across it.
    p.map_anon(MAP + 2 * PGSIZE, true).unwrap();
    assert_eq!(p.spt.len(), 1);
    assert_eq!(
        p.mmap(&k, MAP, 4 * PGSIZE, true, fd, 0),
        Err(KernelError::AlreadyExists)
    );
    // The two pages created before the collision are gone again.
    assert_eq!(p.spt.len(), 1);

    p.close(&k, fd).unwrap();
    p.exit(&k);
    k.shutdown();
}

/// Offsets map page-for-page: a mapping at a nonzero offset sees that
/// part of the file and writes back to it.
#[test]
fn nonzero_offset_maps_the_right_pages() {
    let k = common::boot();
    let mut p = Proc::new();
    make_file(&k, &mut p, "ofs", 3 * PGSIZE);

    let fd = p.open(&k, "ofs").unwrap();
    p.mmap(&k, MAP, PGSIZE, true, fd, PGSIZE).unwrap();

    let mut b = [0u8; 4];
    p.read_bytes(&k, MAP, &mut b).unwrap();
    assert_eq!(&b[..], &common::pattern(3 * PGSIZE)[PGSIZE..PGSIZE + 4]);

    p.write_bytes(&k, MAP + 5, b"patch").unwrap();
    p.munmap(&k, MAP).unwrap();
    p.close(&k, fd).unwrap();

    let data = read_file(&k, &mut p, "ofs");
    assert_eq!(&data[PGSIZE + 5..PGSIZE + 10], b"patch");
    assert_eq!(&data[..PGSIZE], &common::pattern(3 * PGSIZE)[..PGSIZE]);
    k.shutdown();
}
