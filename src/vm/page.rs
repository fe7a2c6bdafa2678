//! Page objects.
//!
//! Every user page tracked by a supplemental page table is one of three
//! kinds, modelled as a sum type dispatching swap-in, swap-out and
//! destroy per variant:
//!
//! * `Uninit` pages are pending: they carry a boxed one-shot initializer
//!   and the kind they will become. The first claim runs the initializer
//!   and rewrites the variant to the real kind.
//! * `Anon` pages swap to the swap device (`anon`).
//! * `File` pages are backed by a shared mmap region and write back to
//!   their file (`file`).
//!
//! Buffer-cache frames are not pages; the cache keeps its own frames and
//! metadata (`fs::pcache`).
//!
//! Ownership: the SPT owns pages (behind `Arc<Mutex<..>>` so the evictor
//! can reach them), the frame table owns frames, and the links between
//! them are weak.

use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Result;
use crate::kernel::Kernel;
use crate::param::PGSIZE;

use super::anon::AnonPage;
use super::file::{FileBacking, FilePage};
use super::pml4::Pml4;
use super::{FrameData, FrameId};

bitflags! {
    pub struct PageFlags: u8 {
        const WRITABLE = 1 << 0;
        /// Page belongs to the grown stack region.
        const STACK    = 1 << 1;
        /// Final page of an mmap region; munmap stops after it.
        const LAST     = 1 << 2;
    }
}

/// The kind a pending page will materialize into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Anon,
    File,
}

/// One-shot initializer run on the first claim. It fills the frame and
/// returns the page's real kind.
pub type PageInit = Box<dyn FnOnce(&Kernel, &mut [u8; PGSIZE]) -> Result<PageKind> + Send>;

pub struct UninitPage {
    pub target: PageType,
    init: Option<PageInit>,
    /// File behind the pending page, if any. Kept alongside the
    /// initializer so an unfaulted page still releases its region
    /// reference on destroy.
    pub(crate) backing: Option<FileBacking>,
}

impl UninitPage {
    /// Runs the initializer, or the default for the target kind: file
    /// pages load from their backing, anonymous pages start zeroed.
    fn materialize(mut self, k: &Kernel, frame: &FrameData) -> Result<PageKind> {
        if let Some(init) = self.init.take() {
            let mut buf = frame.lock_buf();
            return init(k, &mut buf);
        }
        if let Some(backing) = self.backing.take() {
            {
                let mut buf = frame.lock_buf();
                backing.load(k, &mut buf)?;
            }
            return Ok(PageKind::File(FilePage { backing }));
        }
        frame.lock_buf().fill(0);
        Ok(PageKind::Anon(AnonPage::new()))
    }

    fn release(mut self, k: &Kernel) {
        // The initializer may hold a region reference of its own.
        drop(self.init.take());
        if let Some(backing) = self.backing.take() {
            backing.release(k);
        }
    }
}

pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

pub struct Page {
    pub va: usize,
    pub flags: PageFlags,
    pub pml4: Arc<Pml4>,
    /// Backing frame while resident. The frame table owns the frame; this
    /// is only a key into it.
    pub frame: Option<FrameId>,
    pub kind: PageKind,
}

impl Page {
    pub fn new_uninit(
        va: usize,
        flags: PageFlags,
        pml4: Arc<Pml4>,
        target: PageType,
        init: Option<PageInit>,
        backing: Option<FileBacking>,
    ) -> Page {
        assert!(va % PGSIZE == 0, "unaligned page va {:#x}", va);
        Page {
            va,
            flags,
            pml4,
            frame: None,
            kind: PageKind::Uninit(UninitPage {
                target,
                init,
                backing,
            }),
        }
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITABLE)
    }

    /// The page's kind, seeing through pending pages to their target.
    pub fn page_type(&self) -> PageType {
        match &self.kind {
            PageKind::Uninit(u) => u.target,
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    /// Fills `frame` with the page's contents: the initializer on first
    /// claim, the swap slot or the file afterwards. Leaves the page with
    /// clean accessed/dirty bits on both aliases.
    pub fn swap_in(&mut self, k: &Kernel, frame: &FrameData) -> Result<()> {
        let kind = core::mem::replace(&mut self.kind, PageKind::Anon(AnonPage::new()));
        self.kind = match kind {
            PageKind::Uninit(u) => u.materialize(k, frame)?,
            PageKind::Anon(mut a) => {
                a.swap_in(k, frame)?;
                PageKind::Anon(a)
            }
            PageKind::File(f) => {
                let mut buf = frame.lock_buf();
                f.backing.load(k, &mut buf)?;
                drop(buf);
                PageKind::File(f)
            }
        };
        self.pml4.set_accessed(self.va, false);
        self.pml4.set_dirty(self.va, false);
        frame.clear_kflags();
        Ok(())
    }

    /// Saves the page's contents to its backing store before the frame is
    /// taken away. `dirty` is the page's dirtiness as sampled from both
    /// aliases before the mapping was torn down.
    pub fn swap_out(&mut self, k: &Kernel, frame: &FrameData, dirty: bool) {
        match &mut self.kind {
            PageKind::Uninit(_) => panic!("swap_out of a pending page"),
            PageKind::Anon(a) => a.swap_out(k, frame, dirty),
            PageKind::File(f) => {
                if dirty {
                    let buf = frame.lock_buf();
                    f.backing.writeback(k, &buf);
                }
            }
        }
    }

    /// Releases everything the page holds: dirty file pages write back,
    /// swap slots are freed, region references are dropped (the last one
    /// closes the shared file handle). The caller unmaps and frees the
    /// frame afterwards.
    pub fn destroy(&mut self, k: &Kernel) {
        let kind = core::mem::replace(&mut self.kind, PageKind::Anon(AnonPage::new()));
        match kind {
            PageKind::Uninit(u) => u.release(k),
            PageKind::Anon(mut a) => a.destroy(k),
            PageKind::File(f) => {
                if let Some(id) = self.frame {
                    if let Some(data) = k.frames.data(id) {
                        let dirty = self.pml4.is_dirty(self.va) || data.kdirty();
                        if dirty {
                            let buf = data.lock_buf();
                            f.backing.writeback(k, &buf);
                        }
                    }
                }
                f.backing.release(k);
            }
        }
    }
}
