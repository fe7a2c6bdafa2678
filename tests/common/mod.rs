#![allow(dead_code)]

use std::sync::Arc;

use pv6_core::disk::MemDisk;
use pv6_core::{Kernel, KernelConfig};

/// A kernel on fresh in-memory devices: a 4 MiB file-system disk and a
/// 4 MiB swap disk. The writeback period is long so tests control
/// durability themselves unless they say otherwise.
pub fn boot() -> Kernel {
    let _ = env_logger::builder().is_test(true).try_init();
    let fs_disk = Arc::new(MemDisk::new(8192));
    let swap_disk = Arc::new(MemDisk::new(8192));
    Kernel::boot(
        KernelConfig {
            writeback_interval_ms: 60_000,
            ..KernelConfig::default()
        },
        fs_disk,
        swap_disk,
    )
}

/// The byte pattern used by the file round-trip tests.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}
