//! Per-process page map.
//!
//! The hosted model of the hardware page table: a map from user page
//! address to a frame plus the writable/accessed/dirty bits the MMU would
//! maintain. The user access path sets the accessed and dirty bits here;
//! the kernel alias of a frame tracks its own bits on the frame itself.

use std::collections::HashMap;

use bitflags::bitflags;

use super::{pg_round_down, FrameId};

bitflags! {
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY    = 1 << 2;
    }
}

#[derive(Clone, Copy)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: PteFlags,
}

pub struct Pml4 {
    map: spin::Mutex<HashMap<usize, Pte>>,
}

impl Pml4 {
    pub fn new() -> Pml4 {
        Pml4 {
            map: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Installs a mapping. Fails if the page is already mapped.
    pub fn set_page(&self, va: usize, frame: FrameId, writable: bool) -> bool {
        let va = pg_round_down(va);
        let mut map = self.map.lock();
        if map.contains_key(&va) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        map.insert(va, Pte { frame, flags });
        true
    }

    /// Removes a mapping, returning the entry as it stood.
    pub fn clear_page(&self, va: usize) -> Option<Pte> {
        self.map.lock().remove(&pg_round_down(va))
    }

    pub fn lookup(&self, va: usize) -> Option<Pte> {
        self.map.lock().get(&pg_round_down(va)).copied()
    }

    pub fn is_accessed(&self, va: usize) -> bool {
        self.lookup(va)
            .map_or(false, |pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    pub fn set_accessed(&self, va: usize, value: bool) {
        if let Some(pte) = self.map.lock().get_mut(&pg_round_down(va)) {
            pte.flags.set(PteFlags::ACCESSED, value);
        }
    }

    pub fn is_dirty(&self, va: usize) -> bool {
        self.lookup(va)
            .map_or(false, |pte| pte.flags.contains(PteFlags::DIRTY))
    }

    pub fn set_dirty(&self, va: usize, value: bool) {
        if let Some(pte) = self.map.lock().get_mut(&pg_round_down(va)) {
            pte.flags.set(PteFlags::DIRTY, value);
        }
    }

    /// The MMU's side effect of a user access.
    pub fn mark_access(&self, va: usize, write: bool) {
        if let Some(pte) = self.map.lock().get_mut(&pg_round_down(va)) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_mapping_is_rejected() {
        let pml4 = Pml4::new();
        assert!(pml4.set_page(0x1000, 1, true));
        assert!(!pml4.set_page(0x1fff, 2, true));
        assert_eq!(pml4.lookup(0x1000).unwrap().frame, 1);
    }

    #[test]
    fn access_bits_track_reads_and_writes() {
        let pml4 = Pml4::new();
        pml4.set_page(0x2000, 3, true);
        assert!(!pml4.is_accessed(0x2000));

        pml4.mark_access(0x2000, false);
        assert!(pml4.is_accessed(0x2000));
        assert!(!pml4.is_dirty(0x2000));

        pml4.mark_access(0x2345, true);
        assert!(pml4.is_dirty(0x2000));

        pml4.set_accessed(0x2000, false);
        pml4.set_dirty(0x2000, false);
        assert!(!pml4.is_accessed(0x2000) && !pml4.is_dirty(0x2000));
    }
}
