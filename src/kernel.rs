//! The kernel context.
//!
//! One long-lived value owns every "process-wide" structure of the core:
//! the file system (FAT, open-inode table, buffer cache), the swap table
//! and the frame table. Nothing in the crate reaches for a global;
//! subsystems receive the context by reference.

use std::sync::Arc;

use crate::disk::Disk;
use crate::fs::FileSys;
use crate::param::{NFRAME, WRITEBACK_INTERVAL_MS};
use crate::vm::{FrameTable, SwapTable};

pub struct KernelConfig {
    /// Number of user frames in the pool.
    pub frames: usize,
    /// Period of the cache writeback daemon.
    pub writeback_interval_ms: u64,
    /// Format the file-system device instead of mounting it.
    pub format: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            frames: NFRAME,
            writeback_interval_ms: WRITEBACK_INTERVAL_MS,
            format: true,
        }
    }
}

pub struct Kernel {
    pub fs: FileSys,
    pub swap: SwapTable,
    pub frames: FrameTable,
}

impl Kernel {
    /// Brings the core up on the two devices and starts the daemons.
    pub fn boot(config: KernelConfig, fs_disk: Arc<dyn Disk>, swap_disk: Arc<dyn Disk>) -> Kernel {
        let fs = FileSys::mount(fs_disk, config.format, config.writeback_interval_ms);
        let swap = SwapTable::new(swap_disk);
        let frames = FrameTable::new(config.frames);
        log::info!("kernel up: {} user frames", config.frames);
        Kernel { fs, swap, frames }
    }

    /// Clean shutdown: stops the daemons and flushes the cache and the
    /// FAT. On return the file-system device is consistent.
    pub fn shutdown(&self) {
        self.fs.shutdown();
    }
}
