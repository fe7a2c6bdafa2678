//! Buffer cache.
//!
//! A fixed set of 8 page-sized frames caches file-system sectors in
//! aligned 8-sector groups (one group is exactly one cluster's sectors).
//! All inode data I/O goes through here; raw sector transfers happen only
//! on a miss, on eviction, and in the periodic writeback.
//!
//! Locking discipline:
//! * `state` (the cache lock) covers lookup, the eviction decision and
//!   frame assignment.
//! * Each frame's `data` lock covers the payload and its dirty bitmap.
//! * Handoff order is always cache lock, then frame lock, then release
//!   the cache lock, then release the frame lock. A frame-lock holder
//!   never re-acquires the cache lock.
//! * FAT lookups happen outside both locks.
//!
//! Two daemons run for the lifetime of the kernel: a read-ahead worker
//! consuming prefetch requests from an mpsc channel, and a writeback
//! worker flushing dirty sectors every few seconds.

use std::convert::TryInto;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use array_macro::array;
use bitmaps::Bitmap;

use crate::disk::{Disk, SectorNo};
use crate::param::{NCACHE, PGSIZE, SECTORS_PER_CLUSTER, SECTOR_SIZE};

/// Aligned base sector of the 8-sector group containing `sector`.
pub fn group_of(sector: SectorNo) -> SectorNo {
    sector & !(SECTORS_PER_CLUSTER as u32 - 1)
}

struct CacheState {
    /// Group held by each frame, or `None` for an empty frame.
    groups: [Option<SectorNo>; NCACHE],
    /// Second-chance bits for the clock hand.
    accessed: [bool; NCACHE],
    hand: usize,
}

struct FrameBuf {
    bytes: Box<[u8; PGSIZE]>,
    /// One bit per sector that differs from the disk copy.
    dirty: Bitmap<8>,
}

struct CacheFrame {
    data: Mutex<FrameBuf>,
}

impl CacheFrame {
    fn new() -> Self {
        Self {
            data: Mutex::new(FrameBuf {
                bytes: Box::new([0; PGSIZE]),
                dirty: Bitmap::new(),
            }),
        }
    }
}

pub struct PageCache {
    state: Mutex<CacheState>,
    frames: [CacheFrame; NCACHE],
    readahead: Mutex<Option<Sender<SectorNo>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                groups: [None; NCACHE],
                accessed: [false; NCACHE],
                hand: 0,
            }),
            frames: array![_ => CacheFrame::new(); NCACHE],
            readahead: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Spawns the read-ahead and writeback daemons.
    pub fn start(cache: &Arc<PageCache>, disk: Arc<dyn Disk>, writeback_interval_ms: u64) {
        let (tx, rx) = mpsc::channel();
        *cache.readahead.lock().unwrap() = Some(tx);

        let mut workers = cache.workers.lock().unwrap();

        let c = Arc::clone(cache);
        let d = Arc::clone(&disk);
        workers.push(
            std::thread::Builder::new()
                .name("pcache_worker".into())
                .spawn(move || c.readahead_worker(&*d, rx))
                .unwrap(),
        );

        let c = Arc::clone(cache);
        workers.push(
            std::thread::Builder::new()
                .name("writeback_worker".into())
                .spawn(move || c.writeback_worker(&*disk, writeback_interval_ms))
                .unwrap(),
        );
        log::info!("buffer cache started: {} frames", NCACHE);
    }

    /// Stops both daemons, then flushes everything still dirty.
    pub fn shutdown(&self, disk: &dyn Disk) {
        // Closing the channel ends the read-ahead worker's receive loop.
        self.readahead.lock().unwrap().take();
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.flush_all(disk);
    }

    /// Copies `dst.len()` bytes out of `sector` at byte offset `off`,
    /// loading the sector's group on a miss.
    pub fn read(&self, disk: &dyn Disk, sector: SectorNo, off: usize, dst: &mut [u8]) {
        debug_assert!(off + dst.len() <= SECTOR_SIZE);
        let g = group_of(sector);
        let mut state = self.state.lock().unwrap();
        let i = self.ensure_loaded(&mut state, disk, g);
        let buf = self.frames[i].data.lock().unwrap();
        state.accessed[i] = true;
        drop(state);

        let base = (sector & 7) as usize * SECTOR_SIZE + off;
        dst.copy_from_slice(&buf.bytes[base..base + dst.len()]);
    }

    /// Copies `src` into `sector` at byte offset `off` and marks the
    /// sector dirty.
    pub fn write(&self, disk: &dyn Disk, sector: SectorNo, off: usize, src: &[u8]) {
        debug_assert!(off + src.len() <= SECTOR_SIZE);
        let g = group_of(sector);
        let mut state = self.state.lock().unwrap();
        let i = self.ensure_loaded(&mut state, disk, g);
        let mut buf = self.frames[i].data.lock().unwrap();
        state.accessed[i] = true;
        drop(state);

        let base = (sector & 7) as usize * SECTOR_SIZE + off;
        buf.bytes[base..base + src.len()].copy_from_slice(src);
        buf.dirty.set((sector & 7) as usize, true);
    }

    /// Queues a best-effort prefetch of `sector`'s group.
    pub fn prefetch(&self, sector: SectorNo) {
        if let Some(tx) = &*self.readahead.lock().unwrap() {
            let _ = tx.send(group_of(sector));
        }
    }

    /// Writes back and drops the group containing `sector`, if cached.
    pub fn evict(&self, disk: &dyn Disk, sector: SectorNo) {
        let g = group_of(sector);
        let mut state = self.state.lock().unwrap();
        if let Some(i) = Self::find(&state, g) {
            let mut buf = self.frames[i].data.lock().unwrap();
            state.groups[i] = None;
            state.accessed[i] = false;
            drop(state);
            Self::writeback_locked(&mut buf, disk, g);
        }
    }

    /// Drops the group containing `sector` without writing it back. Used
    /// when the clusters behind it have been freed.
    pub fn discard(&self, sector: SectorNo) {
        let g = group_of(sector);
        let mut state = self.state.lock().unwrap();
        if let Some(i) = Self::find(&state, g) {
            let mut buf = self.frames[i].data.lock().unwrap();
            state.groups[i] = None;
            state.accessed[i] = false;
            drop(state);
            buf.dirty = Bitmap::new();
        }
    }

    /// Flushes the dirty sectors of every occupied frame.
    pub fn flush_all(&self, disk: &dyn Disk) {
        let state = self.state.lock().unwrap();
        for i in 0..NCACHE {
            if let Some(g) = state.groups[i] {
                let mut buf = self.frames[i].data.lock().unwrap();
                Self::writeback_locked(&mut buf, disk, g);
            }
        }
    }

    #[cfg(test)]
    pub fn cached(&self, sector: SectorNo) -> bool {
        let state = self.state.lock().unwrap();
        Self::find(&state, group_of(sector)).is_some()
    }

    fn find(state: &CacheState, g: SectorNo) -> Option<usize> {
        state.groups.iter().position(|slot| *slot == Some(g))
    }

    /// Returns the frame index holding group `g`, loading it first if
    /// necessary. Runs under the cache lock; eviction takes the victim's
    /// frame lock on top of it.
    fn ensure_loaded(&self, state: &mut CacheState, disk: &dyn Disk, g: SectorNo) -> usize {
        if let Some(i) = Self::find(state, g) {
            return i;
        }

        // Clock eviction: an empty frame is taken immediately; an
        // accessed frame loses its bit and gets a second chance.
        let i = loop {
            let i = state.hand;
            state.hand = (state.hand + 1) % NCACHE;
            match state.groups[i] {
                None => break i,
                Some(_) if state.accessed[i] => state.accessed[i] = false,
                Some(_) => break i,
            }
        };

        let mut buf = self.frames[i].data.lock().unwrap();
        if let Some(old) = state.groups[i] {
            log::trace!("cache evict: group {} for group {}", old, g);
            Self::writeback_locked(&mut buf, disk, old);
        }
        for k in 0..SECTORS_PER_CLUSTER {
            let chunk: &mut [u8; SECTOR_SIZE] = (&mut buf.bytes
                [k * SECTOR_SIZE..(k + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            disk.read(g + k as u32, chunk);
        }
        buf.dirty = Bitmap::new();
        state.groups[i] = Some(g);
        state.accessed[i] = true;
        i
    }

    fn writeback_locked(buf: &mut FrameBuf, disk: &dyn Disk, g: SectorNo) {
        for k in 0..SECTORS_PER_CLUSTER {
            if buf.dirty.get(k) {
                let chunk: &[u8; SECTOR_SIZE] = (&buf.bytes
                    [k * SECTOR_SIZE..(k + 1) * SECTOR_SIZE])
                    .try_into()
                    .unwrap();
                disk.write(g + k as u32, chunk);
                buf.dirty.set(k, false);
            }
        }
    }

    fn readahead_worker(&self, disk: &dyn Disk, rx: Receiver<SectorNo>) {
        log::info!("pcache_worker running");
        for g in rx.iter() {
            let mut state = self.state.lock().unwrap();
            if Self::find(&state, g).is_some() {
                // Already cached; drop the request.
                continue;
            }
            log::trace!("read-ahead: group {}", g);
            self.ensure_loaded(&mut state, disk, g);
        }
        log::info!("pcache_worker stopped");
    }

    fn writeback_worker(&self, disk: &dyn Disk, interval_ms: u64) {
        log::info!("writeback_worker running");
        loop {
            let (lock, cvar) = &*self.stop;
            let mut stopped = lock.lock().unwrap();
            loop {
                if *stopped {
                    log::info!("writeback_worker stopped");
                    return;
                }
                let (guard, timeout) = cvar
                    .wait_timeout(stopped, Duration::from_millis(interval_ms))
                    .unwrap();
                stopped = guard;
                if timeout.timed_out() {
                    break;
                }
            }
            drop(stopped);
            self.flush_all(disk);
            log::trace!("periodic writeback");
        }
    }
}
