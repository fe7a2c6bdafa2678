//! System-wide parameters.

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per cluster. A cluster is the file system's allocation unit.
pub const SECTORS_PER_CLUSTER: usize = 8;

/// Size of a cluster in bytes. Equal to one machine page.
pub const CLUSTER_SIZE: usize = SECTOR_SIZE * SECTORS_PER_CLUSTER;

/// Size of a machine page in bytes.
pub const PGSIZE: usize = 4096;

/// Number of buffer cache frames.
pub const NCACHE: usize = 8;

/// Default number of user frames backing process pages.
pub const NFRAME: usize = 8;

/// Sectors per swap slot. One slot holds one evicted page.
pub const SLOT_SECTORS: usize = 8;

/// Maximum number of swap slots tracked by the swap bitmap.
pub const NSWAPSLOT: usize = 1024;

/// Top of the user stack.
pub const USER_STACK: usize = 0x4748_0000;

/// Maximum stack size, in pages.
pub const STACK_PAGES: usize = 256;

/// First kernel virtual address. User addresses lie below it.
pub const KERN_BASE: usize = 0x80_0400_0000;

/// Open files per process.
pub const NOFILE: usize = 64;

/// Maximum file name length within a directory entry.
pub const DIRSIZ: usize = 27;

/// Maximum symlink hops followed during one open.
pub const MAX_SYMLINK_HOPS: usize = 8;

/// Interval between periodic cache writebacks, in milliseconds.
pub const WRITEBACK_INTERVAL_MS: u64 = 3000;

/// Magic number identifying an on-disk inode.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Magic number identifying a formatted FAT volume.
pub const FAT_MAGIC: u32 = 0x4641_5431;
