//! Memory-mapped file pages.
//!
//! `do_mmap` covers a user range with pending pages that lazily read from
//! a shared, reopened file handle; `do_munmap` walks the range forward
//! and tears the pages down, writing dirty ones back. All pages of one
//! mapping share a region object; the reference dropping last closes the
//! file handle.

use std::sync::{Arc, Mutex};

use crate::error::{KernelError, Result};
use crate::file::File;
use crate::fs::FileSys;
use crate::kernel::Kernel;
use crate::param::{KERN_BASE, PGSIZE};

use super::page::{PageFlags, PageInit, PageKind, PageType};
use super::pml4::Pml4;
use super::{Spt, alloc_page_with_initializer};

/// The file handle shared by every page of one mmap region.
pub struct MmapRegion {
    file: Mutex<File>,
}

impl MmapRegion {
    fn new(file: File) -> MmapRegion {
        MmapRegion {
            file: Mutex::new(file),
        }
    }

    fn close(self, fs: &FileSys) {
        self.file.into_inner().unwrap().close(fs);
    }
}

/// One page's slice of an mmap region.
#[derive(Clone)]
pub struct FileBacking {
    pub region: Arc<MmapRegion>,
    pub ofs: usize,
    pub read_bytes: usize,
}

impl FileBacking {
    /// Reads `read_bytes` from the file and zero-fills the tail. A short
    /// read (mapping reaching past end of file) zero-fills the rest.
    pub fn load(&self, k: &Kernel, buf: &mut [u8; PGSIZE]) -> Result<()> {
        let file = self.region.file.lock().unwrap();
        let n = file.read_at(&k.fs, &mut buf[..self.read_bytes], self.ofs)?;
        buf[n..].fill(0);
        Ok(())
    }

    /// Writes the page's `read_bytes` back to the file. Failure here has
    /// nowhere to surface (eviction and teardown cannot fail upward), so
    /// it is logged and dropped.
    pub fn writeback(&self, k: &Kernel, buf: &[u8; PGSIZE]) {
        let file = self.region.file.lock().unwrap();
        if let Err(e) = file.write_at(&k.fs, &buf[..self.read_bytes], self.ofs) {
            log::warn!("mmap writeback at offset {} failed: {}", self.ofs, e);
        }
    }

    /// Drops this reference to the region; the last one closes the file.
    pub fn release(self, k: &Kernel) {
        let FileBacking { region, .. } = self;
        if let Ok(region) = Arc::try_unwrap(region) {
            log::debug!("mmap region fully unmapped; closing file handle");
            region.close(&k.fs);
        }
    }
}

pub struct FilePage {
    pub backing: FileBacking,
}

/// Maps `length` bytes of `file` starting at `offset` into the range
/// beginning at `addr`. All pages are created pending and fault in
/// lazily. On any failure the pages created so far are destroyed, leaving
/// no state visible to the caller.
pub fn do_mmap(
    k: &Kernel,
    spt: &mut Spt,
    pml4: &Arc<Pml4>,
    addr: usize,
    length: usize,
    writable: bool,
    file: &Arc<Mutex<File>>,
    offset: usize,
) -> Result<usize> {
    if addr == 0 || addr % PGSIZE != 0 || offset % PGSIZE != 0 || length == 0 {
        return Err(KernelError::InvalidArg);
    }
    let end = addr.checked_add(length).ok_or(KernelError::InvalidArg)?;
    if end > KERN_BASE {
        return Err(KernelError::Denied);
    }

    let region = {
        let f = file.lock().unwrap();
        if offset > f.len() {
            return Err(KernelError::InvalidArg);
        }
        Arc::new(MmapRegion::new(f.reopen(&k.fs)))
    };

    let npages = (length + PGSIZE - 1) / PGSIZE;
    let mut created = 0;
    let result = (|| -> Result<()> {
        for i in 0..npages {
            let page_va = addr + i * PGSIZE;
            let read_bytes = core::cmp::min(PGSIZE, length - i * PGSIZE);
            let backing = FileBacking {
                region: Arc::clone(&region),
                ofs: offset + i * PGSIZE,
                read_bytes,
            };
            let for_init = backing.clone();
            let init: PageInit = Box::new(move |k, buf| {
                for_init.load(k, buf)?;
                Ok(PageKind::File(FilePage { backing: for_init }))
            });

            let mut flags = PageFlags::empty();
            if writable {
                flags |= PageFlags::WRITABLE;
            }
            if i == npages - 1 {
                flags |= PageFlags::LAST;
            }
            alloc_page_with_initializer(
                spt,
                pml4,
                PageType::File,
                page_va,
                flags,
                Some(init),
                Some(backing),
            )?;
            created += 1;
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            drop(region);
            log::debug!("mmap: {} pages at {:#x}", npages, addr);
            Ok(addr)
        }
        Err(e) => {
            for i in 0..created {
                let _ = spt.remove(k, addr + i * PGSIZE);
            }
            if let Ok(region) = Arc::try_unwrap(region) {
                region.close(&k.fs);
            }
            Err(e)
        }
    }
}

/// Unmaps the region starting at `addr`: destroys each file page in
/// order (writing dirty ones back) and stops after the page tagged as the
/// region's last.
pub fn do_munmap(k: &Kernel, spt: &mut Spt, addr: usize) -> Result<()> {
    let mut va = addr;
    loop {
        let page_ref = spt.find(va).ok_or(KernelError::NotFound)?;
        let last = {
            let page = page_ref.lock().unwrap();
            if page.page_type() != PageType::File {
                return Err(KernelError::InvalidArg);
            }
            page.flags.contains(PageFlags::LAST)
        };
        spt.remove(k, va)?;
        if last {
            break;
        }
        va += PGSIZE;
    }
    log::debug!("munmap: region at {:#x}", addr);
    Ok(())
}
