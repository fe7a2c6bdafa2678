//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk structure is one
//! sector long and holds the head of the file's data chain, its length and
//! its type; the data chain itself lives in the FAT. The inode image
//! occupies the first sector of the inode's own cluster, so an open file
//! costs one cluster for metadata plus its data chain.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple processes. At most
//! one in-memory inode exists per cluster. The table serializes open and
//! close; everything else on an inode is protected by its own lock.
//!
//! Lifecycle: the first open reads the image from disk and registers the
//! inode; further opens of the same cluster return the same object with a
//! raised open count. The last close either writes the image back, or, if
//! the inode was removed in the meantime, frees both its chains. Closing
//! also forces the file's cached sector groups out of the buffer cache so
//! a clean shutdown leaves the disk image complete.

use std::collections::HashMap;
use std::convert::{TryFrom, TryInto};
use std::sync::{Arc, Mutex};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::fat::{ClusterNo, EOCHAIN};
use super::FileSys;
use crate::error::Result;
use crate::param::{CLUSTER_SIZE, INODE_MAGIC, SECTOR_SIZE};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum InodeType {
    File = 0,
    Dir = 1,
    Symlink = 2,
}

/// On-disk inode. Must be exactly one sector long.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct DiskInode {
    /// First data cluster.
    start: u32,
    /// File size in bytes.
    length: i32,
    typ: u32,
    magic: u32,
    reserved: [u8; 496],
}

const_assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

pub struct InodeInner {
    pub start: ClusterNo,
    pub length: u32,
    pub removed: bool,
    pub deny_write_cnt: u32,
}

/// In-memory inode.
pub struct Inode {
    /// Cluster holding the on-disk image. Doubles as the inode number.
    pub cluster: ClusterNo,
    typ: InodeType,
    inner: Mutex<InodeInner>,
}

struct ItableEntry {
    ip: Arc<Inode>,
    open_cnt: u32,
}

/// Table of open inodes.
pub struct Itable {
    inner: Mutex<HashMap<ClusterNo, ItableEntry>>,
}

impl Itable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn open_count(&self, cluster: ClusterNo) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .get(&cluster)
            .map_or(0, |e| e.open_cnt)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Inode {
    /// Writes a fresh inode image at `cluster` and allocates a zeroed data
    /// chain covering `length` bytes. Every file owns at least one data
    /// cluster so offset walks always have a place to start.
    pub fn create(fs: &FileSys, cluster: ClusterNo, length: usize, typ: InodeType) -> Result<()> {
        let nclusters = core::cmp::max(1, (length + CLUSTER_SIZE - 1) / CLUSTER_SIZE);
        let start = fs.fat.allocate(nclusters)?;
        for c in fs.fat.chain(start) {
            fs.zero_cluster(c);
        }

        let mut image = DiskInode::new_zeroed();
        image.start = start;
        image.length = length as i32;
        image.typ = typ.into();
        image.magic = INODE_MAGIC;
        fs.write_inode_image(cluster, &image);
        Ok(())
    }

    pub fn typ(&self) -> InodeType {
        self.typ
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().length as usize
    }

    pub fn start_cluster(&self) -> ClusterNo {
        self.inner.lock().unwrap().start
    }

    /// Marks the inode for deletion at its last close.
    pub fn mark_removed(&self) {
        self.inner.lock().unwrap().removed = true;
    }

    /// Disables writes. May be called once per opener.
    pub fn deny_write(&self) {
        self.inner.lock().unwrap().deny_write_cnt += 1;
    }

    /// Re-enables writes; pairs with `deny_write`.
    pub fn allow_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.deny_write_cnt > 0, "allow_write without deny_write");
        inner.deny_write_cnt -= 1;
    }

    /// Reads up to `buf.len()` bytes at `offset`, returning how many were
    /// read. Short reads happen only at end of file. Data is served
    /// through the buffer cache; a completed read queues a read-ahead of
    /// the cluster past the last one touched.
    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], offset: usize) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        let length = inner.length as usize;
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let end = core::cmp::min(length, offset + buf.len());

        // Walk the chain to the cluster containing `offset`; reads never
        // grow the chain.
        let mut cluster = inner.start;
        assert!(cluster != 0, "inode {} has no data chain", self.cluster);
        for _ in 0..offset / CLUSTER_SIZE {
            cluster = fs.fat.get(cluster);
            if cluster == EOCHAIN {
                return Ok(0);
            }
        }

        let mut pos = offset;
        let mut read = 0;
        while pos < end {
            let sector =
                fs.fat.cluster_to_sector(cluster) + ((pos % CLUSTER_SIZE) / SECTOR_SIZE) as u32;
            let sector_off = pos % SECTOR_SIZE;
            let chunk = core::cmp::min(end - pos, SECTOR_SIZE - sector_off);
            fs.cache
                .read(&*fs.disk, sector, sector_off, &mut buf[read..read + chunk]);
            pos += chunk;
            read += chunk;
            if pos < end && pos % CLUSTER_SIZE == 0 {
                cluster = fs.fat.get(cluster);
                if cluster == EOCHAIN {
                    break;
                }
            }
        }

        // Read ahead past the last touched cluster. The FAT lookup happens
        // outside the cache locks.
        if cluster != EOCHAIN {
            let next = fs.fat.get(cluster);
            if next != EOCHAIN {
                fs.cache.prefetch(fs.fat.cluster_to_sector(next));
            }
        }
        Ok(read)
    }

    /// Writes `buf` at `offset`, growing the data chain and the length as
    /// needed. Returns 0 without writing when writes are denied.
    pub fn write_at(&self, fs: &FileSys, buf: &[u8], offset: usize) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.deny_write_cnt > 0 {
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset + buf.len();
        if end > inner.length as usize {
            inner.length = end as u32;
        }

        let mut cluster = inner.start;
        assert!(cluster != 0, "inode {} has no data chain", self.cluster);
        for _ in 0..offset / CLUSTER_SIZE {
            let next = fs.fat.get(cluster);
            cluster = if next == EOCHAIN {
                fs.grow_cluster(cluster)?
            } else {
                next
            };
        }

        let mut pos = offset;
        let mut written = 0;
        while pos < end {
            let sector =
                fs.fat.cluster_to_sector(cluster) + ((pos % CLUSTER_SIZE) / SECTOR_SIZE) as u32;
            let sector_off = pos % SECTOR_SIZE;
            let chunk = core::cmp::min(end - pos, SECTOR_SIZE - sector_off);
            fs.cache
                .write(&*fs.disk, sector, sector_off, &buf[written..written + chunk]);
            pos += chunk;
            written += chunk;
            if pos < end && pos % CLUSTER_SIZE == 0 {
                let next = fs.fat.get(cluster);
                cluster = if next == EOCHAIN {
                    fs.grow_cluster(cluster)?
                } else {
                    next
                };
            }
        }
        Ok(written)
    }
}

impl FileSys {
    /// Returns the open inode at `cluster`, reading it from disk on first
    /// open.
    ///
    /// Panics if the sector does not carry an inode image: a directory
    /// entry pointing at garbage means the volume is inconsistent.
    pub fn inode_open(&self, cluster: ClusterNo) -> Result<Arc<Inode>> {
        let mut table = self.itable.inner.lock().unwrap();
        if let Some(entry) = table.get_mut(&cluster) {
            entry.open_cnt += 1;
            return Ok(Arc::clone(&entry.ip));
        }

        let image = self.read_inode_image(cluster);
        if image.magic != INODE_MAGIC {
            panic!(
                "inode_open: cluster {} has bad magic {:#x}",
                cluster, image.magic
            );
        }
        let typ = InodeType::try_from(image.typ)
            .unwrap_or_else(|_| panic!("inode_open: cluster {} has bad type {}", cluster, image.typ));
        let ip = Arc::new(Inode {
            cluster,
            typ,
            inner: Mutex::new(InodeInner {
                start: image.start,
                length: image.length as u32,
                removed: false,
                deny_write_cnt: 0,
            }),
        });
        table.insert(
            cluster,
            ItableEntry {
                ip: Arc::clone(&ip),
                open_cnt: 1,
            },
        );
        Ok(ip)
    }

    /// Takes another reference to an already-open inode.
    pub fn inode_reopen(&self, ip: &Arc<Inode>) {
        let mut table = self.itable.inner.lock().unwrap();
        table
            .get_mut(&ip.cluster)
            .expect("inode_reopen: inode not open")
            .open_cnt += 1;
    }

    /// Drops one reference. The last close flushes the file's cached
    /// groups and persists the image, or frees both chains if the inode
    /// was removed.
    pub fn inode_close(&self, ip: Arc<Inode>) {
        // The table lock is held across the flush; opens of the same
        // cluster must not observe a half-written image.
        let mut table = self.itable.inner.lock().unwrap();
        let entry = table
            .get_mut(&ip.cluster)
            .expect("inode_close: inode not open");
        entry.open_cnt -= 1;
        if entry.open_cnt > 0 {
            return;
        }
        table.remove(&ip.cluster);

        let inner = ip.inner.lock().unwrap();
        if inner.removed {
            log::debug!("inode {}: freeing chains on last close", ip.cluster);
            for c in self.fat.chain(inner.start) {
                self.cache.discard(self.fat.cluster_to_sector(c));
            }
            self.fat.remove_chain(inner.start, 0);
            self.fat.remove_chain(ip.cluster, 0);
            return;
        }

        // Force the file's groups out of the cache, then persist the
        // inode image itself.
        for c in self.fat.chain(inner.start) {
            self.cache.evict(&*self.disk, self.fat.cluster_to_sector(c));
        }
        let mut image = DiskInode::new_zeroed();
        image.start = inner.start;
        image.length = inner.length as i32;
        image.typ = ip.typ.into();
        image.magic = INODE_MAGIC;
        self.write_inode_image(ip.cluster, &image);
    }

    pub(crate) fn read_inode_image(&self, cluster: ClusterNo) -> DiskInode {
        let mut sector = [0u8; SECTOR_SIZE];
        self.disk.read(self.fat.cluster_to_sector(cluster), &mut sector);
        DiskInode::read_from(&sector[..]).unwrap()
    }

    pub(crate) fn write_inode_image(&self, cluster: ClusterNo, image: &DiskInode) {
        let sector: &[u8; SECTOR_SIZE] = image.as_bytes().try_into().unwrap();
        self.disk.write(self.fat.cluster_to_sector(cluster), sector);
    }

    /// Zeroes all sectors of `c` directly on disk. Only valid for
    /// clusters that cannot be cached (freshly allocated ones).
    pub(crate) fn zero_cluster(&self, c: ClusterNo) {
        let zeros = [0u8; SECTOR_SIZE];
        let base = self.fat.cluster_to_sector(c);
        for i in 0..crate::param::SECTORS_PER_CLUSTER as u32 {
            self.disk.write(base + i, &zeros);
        }
    }

    /// Extends the chain ending at `prev` by one zeroed cluster.
    pub(crate) fn grow_cluster(&self, prev: ClusterNo) -> Result<ClusterNo> {
        let c = self.fat.create_chain(prev)?;
        self.zero_cluster(c);
        Ok(c)
    }
}

pub(crate) fn disk_inode_start(image: &DiskInode) -> ClusterNo {
    image.start
}
