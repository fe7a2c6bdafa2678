//! Anonymous pages and the swap device.
//!
//! An anonymous page has no file behind it. While resident its contents
//! live only in its frame; on eviction they go to a swap slot of 8
//! sectors. A per-sector presence bitmap records which sectors were
//! actually written, so all-zero sectors are neither written nor read:
//! swap-in rebuilds them with memset.

use bitmaps::Bitmap;
use std::convert::TryInto;
use std::sync::Arc;

use crate::disk::{Disk, SectorNo};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::param::{NSWAPSLOT, SECTORS_PER_CLUSTER, SECTOR_SIZE, SLOT_SECTORS};

use super::FrameData;

/// Index of an 8-sector slot on the swap device.
pub type SlotNo = u32;

/// Swap slot allocator.
///
/// The bitmap spans the whole device at slot granularity; allocation is a
/// first-fit scan-and-flip under the table's own lock. Callers never hold
/// the frame-table lock while asking for a slot.
pub struct SwapTable {
    disk: Arc<dyn Disk>,
    bitmap: spin::Mutex<Bitmap<NSWAPSLOT>>,
    nslots: usize,
}

impl SwapTable {
    pub fn new(disk: Arc<dyn Disk>) -> SwapTable {
        let nslots = core::cmp::min(disk.size_sectors() as usize / SLOT_SECTORS, NSWAPSLOT);
        log::info!("swap device: {} slots", nslots);
        SwapTable {
            disk,
            bitmap: spin::Mutex::new(Bitmap::new()),
            nslots,
        }
    }

    /// Claims a free slot. Swap exhaustion is not a survivable error for
    /// a teaching kernel; it panics rather than silently killing the
    /// faulting process.
    pub fn allocate(&self) -> SlotNo {
        let mut bitmap = self.bitmap.lock();
        match bitmap.first_false_index() {
            Some(idx) if idx < self.nslots => {
                bitmap.set(idx, true);
                idx as SlotNo
            }
            _ => panic!("no available space at swap device"),
        }
    }

    pub fn release(&self, slot: SlotNo) {
        let was = self.bitmap.lock().set(slot as usize, false);
        assert!(was, "release of free swap slot {}", slot);
    }

    fn sector(&self, slot: SlotNo, idx: usize) -> SectorNo {
        debug_assert!(idx < SLOT_SECTORS);
        slot * SLOT_SECTORS as u32 + idx as u32
    }

    pub fn read_sector(&self, slot: SlotNo, idx: usize, buf: &mut [u8]) {
        let chunk: &mut [u8; SECTOR_SIZE] = buf.try_into().unwrap();
        self.disk.read(self.sector(slot, idx), chunk);
    }

    pub fn write_sector(&self, slot: SlotNo, idx: usize, buf: &[u8]) {
        let chunk: &[u8; SECTOR_SIZE] = buf.try_into().unwrap();
        self.disk.write(self.sector(slot, idx), chunk);
    }
}

/// Per-page anonymous state.
pub struct AnonPage {
    /// Swap slot holding the evicted contents, if any. Present exactly
    /// while the page is non-resident.
    pub slot: Option<SlotNo>,
    /// Which sectors of the slot hold real (non-zero) data.
    present: Bitmap<8>,
}

impl AnonPage {
    pub fn new() -> AnonPage {
        AnonPage {
            slot: None,
            present: Bitmap::new(),
        }
    }

    /// Writes the page out to a fresh swap slot. When the page is dirty
    /// the sectors are rescanned and only non-zero ones written;
    /// otherwise the previously recorded presence map still describes
    /// the contents and is mirrored as-is.
    pub fn swap_out(&mut self, k: &Kernel, frame: &FrameData, dirty: bool) {
        assert!(self.slot.is_none(), "anon page already swapped out");
        let slot = k.swap.allocate();
        let buf = frame.lock_buf();
        if dirty {
            self.present = Bitmap::new();
            for i in 0..SECTORS_PER_CLUSTER {
                let sector = &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
                if sector.iter().any(|b| *b != 0) {
                    k.swap.write_sector(slot, i, sector);
                    self.present.set(i, true);
                }
            }
        } else {
            for i in 0..SECTORS_PER_CLUSTER {
                if self.present.get(i) {
                    k.swap
                        .write_sector(slot, i, &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
                }
            }
        }
        self.slot = Some(slot);
        log::trace!("anon swap-out to slot {}", slot);
    }

    /// Reads the page back from its slot and releases the slot. A page
    /// with no slot has no contents to bring back: the fault is an error,
    /// not a zero-fill (zero-fill happens only through stack growth).
    pub fn swap_in(&mut self, k: &Kernel, frame: &FrameData) -> Result<()> {
        let slot = self.slot.take().ok_or(KernelError::NotFound)?;
        let mut buf = frame.lock_buf();
        for i in 0..SECTORS_PER_CLUSTER {
            let sector = &mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            if self.present.get(i) {
                k.swap.read_sector(slot, i, sector);
            } else {
                sector.fill(0);
            }
        }
        drop(buf);
        k.swap.release(slot);
        log::trace!("anon swap-in from slot {}", slot);
        Ok(())
    }

    pub fn destroy(&mut self, k: &Kernel) {
        if let Some(slot) = self.slot.take() {
            k.swap.release(slot);
        }
    }
}
