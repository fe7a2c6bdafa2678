//! Virtual memory.
//!
//! * Frame table: the fixed pool of user frames, with clock eviction
//!   (here).
//! * Page objects: per-kind swap-in/swap-out/destroy (`page`, `anon`,
//!   `file`).
//! * Supplemental page table: per-process map from user page address to
//!   page object (here).
//! * Fault handler and the stack-growth policy (here).
//! * mmap/munmap (`file`).
//!
//! Eviction rules: the clock hand runs under the frame-table lock
//! (`ft_access`), but the victim's swap-out happens after the lock is
//! dropped; the victim's user mapping is torn down before its backing
//! store is touched, so a racing fault re-enters the SPT path and blocks
//! on the swap or cache locks instead of reading stale memory; and a
//! swap slot is never requested while the frame-table lock is held.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::param::{KERN_BASE, PGSIZE, STACK_PAGES, USER_STACK};

pub mod anon;
pub mod file;
pub mod page;
pub mod pml4;

pub use anon::SwapTable;
pub use file::{do_mmap, do_munmap};
pub use page::{Page, PageFlags, PageInit, PageKind, PageType};
pub use pml4::{Pml4, Pte, PteFlags};

/// Key of a frame in the frame table.
pub type FrameId = usize;

/// Shared handle to a page. The SPT holds the owning reference; the frame
/// table keeps only a weak back-pointer.
pub type PageRef = Arc<Mutex<Page>>;

pub fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// A physical frame's contents plus the accessed/dirty bits of its
/// kernel alias. The user alias bits live in the owning process's pml4.
pub struct FrameData {
    buf: Mutex<Box<[u8; PGSIZE]>>,
    kaccessed: AtomicBool,
    kdirty: AtomicBool,
}

impl FrameData {
    fn new() -> FrameData {
        FrameData {
            buf: Mutex::new(Box::new([0; PGSIZE])),
            kaccessed: AtomicBool::new(false),
            kdirty: AtomicBool::new(false),
        }
    }

    /// Raw access for the swap machinery; no accessed/dirty side effects.
    pub fn lock_buf(&self) -> MutexGuard<'_, Box<[u8; PGSIZE]>> {
        self.buf.lock().unwrap()
    }

    /// Kernel-alias read access.
    pub fn kread<R>(&self, f: impl FnOnce(&[u8; PGSIZE]) -> R) -> R {
        self.kaccessed.store(true, Ordering::Relaxed);
        let buf = self.buf.lock().unwrap();
        f(&buf)
    }

    /// Kernel-alias write access.
    pub fn kwrite<R>(&self, f: impl FnOnce(&mut [u8; PGSIZE]) -> R) -> R {
        self.kaccessed.store(true, Ordering::Relaxed);
        self.kdirty.store(true, Ordering::Relaxed);
        let mut buf = self.buf.lock().unwrap();
        f(&mut buf)
    }

    pub fn kaccessed(&self) -> bool {
        self.kaccessed.load(Ordering::Relaxed)
    }

    pub fn kdirty(&self) -> bool {
        self.kdirty.load(Ordering::Relaxed)
    }

    fn set_kaccessed(&self, value: bool) {
        self.kaccessed.store(value, Ordering::Relaxed);
    }

    pub fn clear_kflags(&self) {
        self.kaccessed.store(false, Ordering::Relaxed);
        self.kdirty.store(false, Ordering::Relaxed);
    }
}

struct FrameEntry {
    data: Arc<FrameData>,
    page: Weak<Mutex<Page>>,
}

struct Ft {
    frames: BTreeMap<FrameId, FrameEntry>,
    hand: FrameId,
    next: FrameId,
}

/// Kernel-wide table of user frames. Capacity is fixed at boot; once it
/// is reached, allocation evicts.
pub struct FrameTable {
    inner: spin::Mutex<Ft>,
    capacity: usize,
}

enum Pick {
    Fresh(FrameId, Arc<FrameData>),
    Victim(FrameId, Arc<FrameData>, PageRef),
}

impl FrameTable {
    pub fn new(capacity: usize) -> FrameTable {
        assert!(capacity > 0);
        FrameTable {
            inner: spin::Mutex::new(Ft {
                frames: BTreeMap::new(),
                hand: 0,
                next: 1,
            }),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn data(&self, id: FrameId) -> Option<Arc<FrameData>> {
        self.inner.lock().frames.get(&id).map(|e| Arc::clone(&e.data))
    }

    pub fn set_owner(&self, id: FrameId, page: Weak<Mutex<Page>>) {
        if let Some(entry) = self.inner.lock().frames.get_mut(&id) {
            entry.page = page;
        }
    }

    /// The page currently backing `id`, if any.
    pub fn owner(&self, id: FrameId) -> Option<PageRef> {
        self.inner
            .lock()
            .frames
            .get(&id)
            .and_then(|e| e.page.upgrade())
    }

    /// Returns the frame to the pool.
    pub fn free(&self, id: FrameId) {
        self.inner.lock().frames.remove(&id);
    }

    /// Hands out a frame, evicting a victim page when the pool is full.
    pub fn alloc(&self, k: &Kernel) -> Result<(FrameId, Arc<FrameData>)> {
        loop {
            let pick = {
                let mut ft = self.inner.lock();
                if ft.frames.len() < self.capacity {
                    let id = ft.next;
                    ft.next += 1;
                    let data = Arc::new(FrameData::new());
                    ft.frames.insert(
                        id,
                        FrameEntry {
                            data: Arc::clone(&data),
                            page: Weak::new(),
                        },
                    );
                    Pick::Fresh(id, data)
                } else {
                    let (id, data, page_ref) = Self::pick_victim(&mut ft);
                    Pick::Victim(id, data, page_ref)
                }
            };

            let (id, data, page_ref) = match pick {
                Pick::Fresh(id, data) => return Ok((id, data)),
                Pick::Victim(id, data, page_ref) => (id, data, page_ref),
            };

            // Re-take the victim's lock now that ft_access is dropped; the
            // selection could have raced with a destroy or another evictor.
            let mut page = page_ref.lock().unwrap();
            if page.frame != Some(id) {
                continue;
            }
            let dirty = page.pml4.is_dirty(page.va) || data.kdirty();
            // Unmap first: a fault taken from here on re-enters the SPT
            // path and waits on the backing store locks.
            page.pml4.clear_page(page.va);
            page.swap_out(k, &data, dirty);
            page.frame = None;
            log::debug!("evicted page {:#x} from frame {}", page.va, id);
            drop(page);

            if let Some(entry) = self.inner.lock().frames.get_mut(&id) {
                entry.page = Weak::new();
            }
            data.clear_kflags();
            return Ok((id, data));
        }
    }

    /// Clock sweep. Pages whose accessed bit is set on either alias lose
    /// the bit and get a second chance; busy pages and frames mid-claim
    /// are skipped.
    fn pick_victim(ft: &mut Ft) -> (FrameId, Arc<FrameData>, PageRef) {
        let len = ft.frames.len();
        let mut passes = 0;
        loop {
            passes += 1;
            assert!(passes <= 4 * len + 8, "frame table: no evictable frame");

            let id = ft
                .frames
                .range((Bound::Excluded(ft.hand), Bound::Unbounded))
                .next()
                .map(|(id, _)| *id)
                .unwrap_or_else(|| *ft.frames.keys().next().unwrap());
            ft.hand = id;

            let entry = ft.frames.get(&id).unwrap();
            let page_ref = match entry.page.upgrade() {
                Some(p) => p,
                None => continue,
            };
            let guard = match page_ref.try_lock() {
                Ok(g) => g,
                Err(_) => continue,
            };
            if guard.pml4.is_accessed(guard.va) || entry.data.kaccessed() {
                guard.pml4.set_accessed(guard.va, false);
                entry.data.set_kaccessed(false);
                continue;
            }
            let data = Arc::clone(&entry.data);
            drop(guard);
            return (id, data, page_ref);
        }
    }
}

/// Per-process supplemental page table: user page address to page object.
pub struct Spt {
    map: HashMap<usize, PageRef>,
}

impl Spt {
    pub fn new() -> Spt {
        Spt {
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn find(&self, va: usize) -> Option<PageRef> {
        self.map.get(&pg_round_down(va)).map(Arc::clone)
    }

    pub fn insert(&mut self, page: Page) -> Result<PageRef> {
        let va = page.va;
        if self.map.contains_key(&va) {
            return Err(KernelError::AlreadyExists);
        }
        let page_ref = Arc::new(Mutex::new(page));
        self.map.insert(va, Arc::clone(&page_ref));
        Ok(page_ref)
    }

    /// Removes and destroys the page at `va`.
    pub fn remove(&mut self, k: &Kernel, va: usize) -> Result<()> {
        let page_ref = self
            .map
            .remove(&pg_round_down(va))
            .ok_or(KernelError::NotFound)?;
        destroy_page(k, &page_ref);
        Ok(())
    }

    /// Destroys every page, writing dirty file pages back. Called when
    /// the owning process dies.
    pub fn kill(&mut self, k: &Kernel) {
        for (_, page_ref) in self.map.drain() {
            destroy_page(k, &page_ref);
        }
    }

    /// Builds this table as a copy of `src` for a forked child. Each
    /// source page gets a matching pending page; both are claimed at
    /// once and the contents copied. This is copy-through-initialization,
    /// not copy-on-write. A failure destroys everything built so far.
    pub fn copy_from(&mut self, k: &Kernel, src: &Spt, pml4: &Arc<Pml4>) -> Result<()> {
        use itertools::Itertools;

        let result = (|| -> Result<()> {
            for (&va, src_ref) in src.map.iter().sorted_by_key(|(va, _)| **va) {
                let (target, flags, backing) = {
                    let src_pg = src_ref.lock().unwrap();
                    let backing = match &src_pg.kind {
                        PageKind::Uninit(u) => u.backing.clone(),
                        PageKind::Anon(_) => None,
                        PageKind::File(f) => Some(f.backing.clone()),
                    };
                    (src_pg.page_type(), src_pg.flags, backing)
                };
                let page = Page::new_uninit(va, flags, Arc::clone(pml4), target, None, backing);
                let dst_ref = self.insert(page)?;

                // Claim both and copy the resident bytes. Claiming one
                // side can evict the other under tight memory, so retry
                // until both are resident at the same time; the accessed
                // bit keeps the clock off the pair between claims.
                loop {
                    if src_ref.lock().unwrap().frame.is_none() {
                        claim_page(k, src_ref)?;
                    }
                    {
                        let g = src_ref.lock().unwrap();
                        g.pml4.set_accessed(g.va, true);
                    }
                    if dst_ref.lock().unwrap().frame.is_none() {
                        claim_page(k, &dst_ref)?;
                    }
                    {
                        let g = dst_ref.lock().unwrap();
                        g.pml4.set_accessed(g.va, true);
                    }
                    let src_pg = src_ref.lock().unwrap();
                    let dst_pg = dst_ref.lock().unwrap();
                    let pair = match (src_pg.frame, dst_pg.frame) {
                        (Some(s), Some(d)) => (s, d),
                        _ => continue,
                    };
                    let sdata = k.frames.data(pair.0).unwrap();
                    let ddata = k.frames.data(pair.1).unwrap();
                    let sbuf = sdata.lock_buf();
                    ddata.kwrite(|dst| dst.copy_from_slice(&sbuf[..]));
                    break;
                }
            }
            Ok(())
        })();

        if result.is_err() {
            self.kill(k);
        }
        result
    }
}

/// Destroys a page and returns its frame, if any, to the pool.
fn destroy_page(k: &Kernel, page_ref: &PageRef) {
    let mut page = page_ref.lock().unwrap();
    page.destroy(k);
    if let Some(id) = page.frame.take() {
        page.pml4.clear_page(page.va);
        k.frames.free(id);
    }
}

/// Registers a pending page at `va`. The page materializes on its first
/// claim. This is how every user page comes to exist; external loaders
/// use it too.
pub fn alloc_page_with_initializer(
    spt: &mut Spt,
    pml4: &Arc<Pml4>,
    target: PageType,
    va: usize,
    flags: PageFlags,
    init: Option<PageInit>,
    backing: Option<file::FileBacking>,
) -> Result<PageRef> {
    spt.insert(Page::new_uninit(va, flags, Arc::clone(pml4), target, init, backing))
}

/// Makes the page resident: takes a frame (evicting if the pool is
/// full), installs the mapping, and swaps the contents in.
pub fn claim_page(k: &Kernel, page_ref: &PageRef) -> Result<()> {
    let mut page = page_ref.lock().unwrap();
    if page.frame.is_some() {
        return Ok(());
    }
    let (id, data) = k.frames.alloc(k)?;
    k.frames.set_owner(id, Arc::downgrade(page_ref));
    page.frame = Some(id);
    if !page.pml4.set_page(page.va, id, page.writable()) {
        panic!("claim_page: {:#x} already mapped", page.va);
    }
    if let Err(e) = page.swap_in(k, &data) {
        page.pml4.clear_page(page.va);
        page.frame = None;
        k.frames.free(id);
        return Err(e);
    }
    Ok(())
}

/// Grows the stack by one zeroed, stack-marked anonymous page at `va`.
fn stack_growth(k: &Kernel, spt: &mut Spt, pml4: &Arc<Pml4>, va: usize) -> Result<()> {
    let page_ref = alloc_page_with_initializer(
        spt,
        pml4,
        PageType::Anon,
        va,
        PageFlags::WRITABLE | PageFlags::STACK,
        None,
        None,
    )?;
    claim_page(k, &page_ref)?;
    let page = page_ref.lock().unwrap();
    let data = k.frames.data(page.frame.unwrap()).unwrap();
    data.kwrite(|buf| buf.fill(0));
    Ok(())
}

/// Classifies a fault at `addr` and resolves it, returning whether the
/// faulting access may be retried.
///
/// `rsp` is the user stack pointer: from the trap frame for user faults,
/// from the value saved at syscall entry for kernel faults. Stack growth
/// honors the `PUSH` idiom: the implied fault address is `rsp - 8`, and
/// anything at or above it (within the stack region) grows the stack.
pub fn try_handle_fault(
    k: &Kernel,
    spt: &mut Spt,
    pml4: &Arc<Pml4>,
    rsp: usize,
    addr: usize,
    user: bool,
    write: bool,
    _not_present: bool,
) -> bool {
    if user && addr >= KERN_BASE {
        return false;
    }
    let va = pg_round_down(addr);
    match spt.find(va) {
        Some(page_ref) => {
            let (resident, writable) = {
                let page = page_ref.lock().unwrap();
                (page.frame.is_some(), page.writable())
            };
            if resident {
                // Permission fault on a present page. Copy-on-write is
                // prepared for here but not implemented; the hook
                // succeeds for writable pages and everything else is
                // denied.
                return writable && write;
            }
            claim_page(k, &page_ref).is_ok()
        }
        None => {
            let in_stack_region =
                addr < USER_STACK && addr >= USER_STACK - STACK_PAGES * PGSIZE;
            if write && addr >= rsp.wrapping_sub(8) && in_stack_region {
                stack_growth(k, spt, pml4, va).is_ok()
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::kernel::KernelConfig;
    use crate::vm::page::{PageFlags, PageType};

    fn tiny_kernel(frames: usize) -> Kernel {
        Kernel::boot(
            KernelConfig {
                frames,
                writeback_interval_ms: 60_000,
                format: true,
            },
            Arc::new(MemDisk::new(2048)),
            Arc::new(MemDisk::new(1024)),
        )
    }

    fn anon_page(
        spt: &mut Spt,
        pml4: &Arc<Pml4>,
        va: usize,
        flags: PageFlags,
    ) -> PageRef {
        alloc_page_with_initializer(spt, pml4, PageType::Anon, va, flags, None, None).unwrap()
    }

    #[test]
    fn claim_links_page_frame_and_mapping() {
        let k = tiny_kernel(2);
        let mut spt = Spt::new();
        let pml4 = Arc::new(Pml4::new());

        let p = anon_page(&mut spt, &pml4, 0x4000, PageFlags::WRITABLE);
        claim_page(&k, &p).unwrap();

        let id = p.lock().unwrap().frame.unwrap();
        let pte = pml4.lookup(0x4000).unwrap();
        assert_eq!(pte.frame, id);
        assert!(pte.flags.contains(PteFlags::WRITABLE));
        // The frame's back-pointer leads to this very page.
        assert!(Arc::ptr_eq(&k.frames.owner(id).unwrap(), &p));

        spt.kill(&k);
        assert_eq!(k.frames.len(), 0);
        k.shutdown();
    }

    #[test]
    fn readonly_pages_map_without_the_write_bit() {
        let k = tiny_kernel(2);
        let mut spt = Spt::new();
        let pml4 = Arc::new(Pml4::new());

        let p = anon_page(&mut spt, &pml4, 0x8000, PageFlags::empty());
        claim_page(&k, &p).unwrap();
        assert!(!pml4.lookup(0x8000).unwrap().flags.contains(PteFlags::WRITABLE));

        spt.kill(&k);
        k.shutdown();
    }

    #[test]
    fn eviction_detaches_the_victim_completely() {
        let k = tiny_kernel(2);
        let mut spt = Spt::new();
        let pml4 = Arc::new(Pml4::new());

        let pages: Vec<PageRef> = (0..3)
            .map(|i| anon_page(&mut spt, &pml4, 0x10000 + i * PGSIZE, PageFlags::WRITABLE))
            .collect();
        for p in &pages {
            claim_page(&k, p).unwrap();
        }

        // Two frames, three claims: exactly one page is out.
        let out: Vec<usize> = (0..3)
            .filter(|i| pages[*i].lock().unwrap().frame.is_none())
            .collect();
        assert_eq!(out.len(), 1);
        let victim = pages[out[0]].lock().unwrap();
        assert!(pml4.lookup(victim.va).is_none());
        match &victim.kind {
            PageKind::Anon(a) => assert!(a.slot.is_some()),
            _ => panic!("victim is not anonymous"),
        }
        drop(victim);

        // Faulting it back in restores the links and frees the slot.
        claim_page(&k, &pages[out[0]]).unwrap();
        let back = pages[out[0]].lock().unwrap();
        assert!(back.frame.is_some());
        match &back.kind {
            PageKind::Anon(a) => assert!(a.slot.is_none()),
            _ => unreachable!(),
        }
        drop(back);

        spt.kill(&k);
        k.shutdown();
    }

    #[test]
    fn duplicate_spt_insert_fails() {
        let k = tiny_kernel(2);
        let mut spt = Spt::new();
        let pml4 = Arc::new(Pml4::new());

        anon_page(&mut spt, &pml4, 0x4000, PageFlags::WRITABLE);
        let dup = alloc_page_with_initializer(
            &mut spt,
            &pml4,
            PageType::Anon,
            0x4000,
            PageFlags::WRITABLE,
            None,
            None,
        );
        assert!(matches!(dup, Err(KernelError::AlreadyExists)));

        spt.kill(&k);
        k.shutdown();
    }
}
