//! FAT cluster map.
//!
//! The file system allocates space in clusters of 8 sectors (4096 bytes,
//! one page). The FAT maps every cluster to its successor in a chain, to
//! `EOCHAIN` at the end of a chain, or to 0 when free. The whole table is
//! loaded into memory at mount time and written back at shutdown.
//!
//! Disk layout:
//! [ header | FAT | data clusters ]
//!
//! The header occupies sector 0 and records where the FAT and the data
//! region live. The data region starts on an 8-sector boundary so that a
//! cluster's sectors always form one aligned 8-sector group, which is the
//! buffer cache's indexing granularity. Cluster 0 is reserved; cluster 1
//! holds the root directory inode.

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::disk::{Disk, SectorNo};
use crate::error::{KernelError, Result};
use crate::param::{FAT_MAGIC, SECTORS_PER_CLUSTER, SECTOR_SIZE};

/// Index of a cluster within the data region.
pub type ClusterNo = u32;

/// FAT entry marking the end of a cluster chain.
pub const EOCHAIN: ClusterNo = 0xffff_ffff;

/// Cluster of the root directory inode.
pub const ROOT_CLUSTER: ClusterNo = 1;

/// Volume header, stored in sector 0.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
struct FatHeader {
    magic: u32,
    fat_start: u32,
    fat_sectors: u32,
    data_start: u32,
    nclusters: u32,
    total_sectors: u32,
}

const_assert!(core::mem::size_of::<FatHeader>() <= SECTOR_SIZE);

struct FatInner {
    /// `map[c]` is the successor of cluster `c`, `EOCHAIN`, or 0 if free.
    map: Vec<ClusterNo>,
    /// Next cluster to consider in the free scan.
    hint: ClusterNo,
}

pub struct Fat {
    inner: spin::Mutex<FatInner>,
    fat_start: SectorNo,
    fat_sectors: u32,
    data_start: SectorNo,
    nclusters: u32,
}

/// Computes the volume layout for a device of `total` sectors. The FAT is
/// sized for the largest possible cluster count so the data region start
/// does not depend on the final cluster count.
fn layout(total: u32) -> (u32, u32, u32) {
    let nclusters_max = total as usize / SECTORS_PER_CLUSTER;
    let fat_bytes = nclusters_max * core::mem::size_of::<ClusterNo>();
    let fat_sectors = ((fat_bytes + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32;
    let meta = 1 + fat_sectors;
    let data_start = (meta + SECTORS_PER_CLUSTER as u32 - 1) & !(SECTORS_PER_CLUSTER as u32 - 1);
    assert!(
        data_start + 2 * SECTORS_PER_CLUSTER as u32 <= total,
        "device too small for a FAT volume: {} sectors",
        total
    );
    let nclusters = (total - data_start) / SECTORS_PER_CLUSTER as u32;
    (fat_sectors, data_start, nclusters)
}

impl Fat {
    /// Creates a fresh FAT on `disk`, reserving cluster 0 and the root
    /// directory cluster, and writes it out.
    pub fn format(disk: &dyn Disk) -> Fat {
        let total = disk.size_sectors();
        let (fat_sectors, data_start, nclusters) = layout(total);

        let mut map = vec![0 as ClusterNo; nclusters as usize];
        map[0] = EOCHAIN;
        map[ROOT_CLUSTER as usize] = EOCHAIN;

        let fat = Fat {
            inner: spin::Mutex::new(FatInner { map, hint: 2 }),
            fat_start: 1,
            fat_sectors,
            data_start,
            nclusters,
        };

        let header = FatHeader {
            magic: FAT_MAGIC,
            fat_start: 1,
            fat_sectors,
            data_start,
            nclusters,
            total_sectors: total,
        };
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..core::mem::size_of::<FatHeader>()].copy_from_slice(header.as_bytes());
        disk.write(0, &sector);

        fat.flush(disk);
        log::info!("formatted FAT volume: {} clusters", nclusters);
        fat
    }

    /// Loads an existing FAT from `disk`.
    ///
    /// Panics if sector 0 does not carry a FAT header: mounting a garbage
    /// volume is an unrecoverable configuration error.
    pub fn mount(disk: &dyn Disk) -> Fat {
        let mut sector = [0u8; SECTOR_SIZE];
        disk.read(0, &mut sector);
        let header = FatHeader::read_from_prefix(&sector[..]).unwrap();
        if header.magic != FAT_MAGIC {
            panic!("Fat::mount: bad volume magic {:#x}", header.magic);
        }
        if header.total_sectors != disk.size_sectors() {
            panic!(
                "Fat::mount: header says {} sectors, device has {}",
                header.total_sectors,
                disk.size_sectors()
            );
        }

        let mut map = vec![0 as ClusterNo; header.nclusters as usize];
        let mut read = 0;
        let bytes = map.as_bytes_mut();
        for s in 0..header.fat_sectors {
            disk.read(header.fat_start + s, &mut sector);
            let n = core::cmp::min(SECTOR_SIZE, bytes.len() - read);
            bytes[read..read + n].copy_from_slice(&sector[..n]);
            read += n;
            if read == bytes.len() {
                break;
            }
        }

        log::info!("mounted FAT volume: {} clusters", header.nclusters);
        Fat {
            inner: spin::Mutex::new(FatInner { map, hint: 2 }),
            fat_start: header.fat_start,
            fat_sectors: header.fat_sectors,
            data_start: header.data_start,
            nclusters: header.nclusters,
        }
    }

    /// Writes the in-memory table back to `disk`.
    pub fn flush(&self, disk: &dyn Disk) {
        // Copy the image out first: disk I/O does not belong under a
        // spin lock.
        let map = self.inner.lock().map.clone();
        let bytes = map.as_bytes();
        let mut sector = [0u8; SECTOR_SIZE];
        let mut written = 0;
        for s in 0..self.fat_sectors {
            if written >= bytes.len() {
                break;
            }
            let n = core::cmp::min(SECTOR_SIZE, bytes.len() - written);
            sector[..n].copy_from_slice(&bytes[written..written + n]);
            sector[n..].fill(0);
            disk.write(self.fat_start + s, &sector);
            written += n;
        }
    }

    /// First sector of cluster `c`. Always a multiple of 8.
    pub fn cluster_to_sector(&self, c: ClusterNo) -> SectorNo {
        assert!(c != 0 && c < self.nclusters, "cluster {} out of range", c);
        self.data_start + c * SECTORS_PER_CLUSTER as u32
    }

    pub fn nclusters(&self) -> u32 {
        self.nclusters
    }

    /// Successor of `c` in its chain.
    pub fn get(&self, c: ClusterNo) -> ClusterNo {
        let inner = self.inner.lock();
        let next = inner.map[c as usize];
        assert!(next != c, "FAT self-loop at cluster {}", c);
        next
    }

    fn find_free(inner: &mut FatInner, nclusters: u32) -> Option<ClusterNo> {
        // Linear scan from the hint; on wraparound, retry once from the
        // first allocatable cluster.
        let start = if inner.hint >= nclusters { 2 } else { inner.hint };
        let scan = (start..nclusters).chain(2..start);
        for c in scan {
            if inner.map[c as usize] == 0 {
                inner.hint = c + 1;
                return Some(c);
            }
        }
        None
    }

    /// Allocates one free cluster and terminates it with `EOCHAIN`. If
    /// `prev` is not 0 it must currently end a chain; the new cluster is
    /// linked behind it.
    pub fn create_chain(&self, prev: ClusterNo) -> Result<ClusterNo> {
        let mut inner = self.inner.lock();
        let c = Self::find_free(&mut inner, self.nclusters).ok_or(KernelError::OutOfSpace)?;
        inner.map[c as usize] = EOCHAIN;
        if prev != 0 {
            assert_eq!(
                inner.map[prev as usize], EOCHAIN,
                "create_chain: cluster {} does not end a chain",
                prev
            );
            inner.map[prev as usize] = c;
        }
        Ok(c)
    }

    /// Allocates a chain of `n` clusters, all or nothing, and returns its
    /// head.
    pub fn allocate(&self, n: usize) -> Result<ClusterNo> {
        assert!(n > 0);
        let mut inner = self.inner.lock();
        let mut chain = Vec::with_capacity(n);
        for _ in 0..n {
            match Self::find_free(&mut inner, self.nclusters) {
                Some(c) => {
                    // Claim it immediately so the scan cannot return it
                    // twice.
                    inner.map[c as usize] = EOCHAIN;
                    chain.push(c);
                }
                None => {
                    for c in chain {
                        inner.map[c as usize] = 0;
                    }
                    return Err(KernelError::OutOfSpace);
                }
            }
        }
        for pair in chain.windows(2) {
            inner.map[pair[0] as usize] = pair[1];
        }
        Ok(chain[0])
    }

    /// Frees the chain starting at `head`, walking until `stop_at`
    /// (exclusive) or the end of the chain. `head` may be 0.
    pub fn remove_chain(&self, head: ClusterNo, stop_at: ClusterNo) {
        if head == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let mut c = head;
        let mut steps = 0;
        while c != EOCHAIN && c != stop_at {
            let next = inner.map[c as usize];
            inner.map[c as usize] = 0;
            c = next;
            steps += 1;
            assert!(steps <= self.nclusters, "remove_chain: FAT chain cycle");
        }
        if inner.hint > head {
            inner.hint = head;
        }
    }

    /// Collects the clusters of the chain starting at `head`, in order.
    pub fn chain(&self, head: ClusterNo) -> Vec<ClusterNo> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut c = head;
        while c != 0 && c != EOCHAIN {
            out.push(c);
            c = inner.map[c as usize];
            assert!(
                out.len() <= self.nclusters as usize,
                "chain: FAT chain cycle at cluster {}",
                head
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    fn fresh() -> (MemDisk, Fat) {
        let disk = MemDisk::new(1024);
        let fat = Fat::format(&disk);
        (disk, fat)
    }

    #[test]
    fn format_reserves_low_clusters() {
        let (_disk, fat) = fresh();
        assert_eq!(fat.get(0), EOCHAIN);
        assert_eq!(fat.get(ROOT_CLUSTER), EOCHAIN);
    }

    #[test]
    fn chains_grow_and_terminate() {
        let (_disk, fat) = fresh();
        let head = fat.create_chain(0).unwrap();
        let second = fat.create_chain(head).unwrap();
        assert_eq!(fat.get(head), second);
        assert_eq!(fat.get(second), EOCHAIN);
        assert_eq!(fat.chain(head), vec![head, second]);
    }

    #[test]
    fn allocate_is_all_or_nothing() {
        let (_disk, fat) = fresh();
        let free = (2..fat.nclusters()).count();
        assert!(fat.allocate(free + 1).is_err());
        // The failed allocation must not leak clusters.
        let head = fat.allocate(free).unwrap();
        assert_eq!(fat.chain(head).len(), free);
    }

    #[test]
    fn remove_chain_stops_at_boundary() {
        let (_disk, fat) = fresh();
        let head = fat.allocate(4).unwrap();
        let chain = fat.chain(head);

        // Free the front half only; the tail chain survives.
        fat.remove_chain(head, chain[2]);
        assert_eq!(fat.chain(chain[2]), vec![chain[2], chain[3]]);

        // Freed clusters are allocatable again.
        let reused = fat.create_chain(0).unwrap();
        assert!(chain[..2].contains(&reused));
    }

    #[test]
    fn mount_reads_back_flushed_table() {
        let (disk, fat) = fresh();
        let head = fat.allocate(3).unwrap();
        fat.flush(&disk);

        let reloaded = Fat::mount(&disk);
        assert_eq!(reloaded.chain(head), fat.chain(head));
        assert_eq!(reloaded.nclusters(), fat.nclusters());
    }

    #[test]
    fn cluster_sectors_are_group_aligned() {
        let (_disk, fat) = fresh();
        for c in 1..8 {
            assert_eq!(fat.cluster_to_sector(c) % SECTORS_PER_CLUSTER as u32, 0);
        }
    }
}
