//! Processes.
//!
//! A `Proc` owns what the core needs from a process: its pml4, its
//! supplemental page table, its file descriptor table, its working
//! directory, and the user stack pointer saved at syscall entry. The
//! scheduler, ELF loading and the syscall dispatcher live outside the
//! core; tests and embedders drive a `Proc` directly.
//!
//! `read_bytes` and `write_bytes` are the user-memory access path, the
//! hosted analogue of the MMU: they walk the pml4, raise a fault on a
//! missing or read-only mapping, and set the accessed/dirty bits of the
//! user alias on success.

use std::sync::{Arc, Mutex};

use scopeguard::ScopeGuard;

use crate::error::{KernelError, Result};
use crate::file::File;
use crate::fs::{ClusterNo, InodeType, ROOT_CLUSTER};
use crate::kernel::Kernel;
use crate::param::{NOFILE, PGSIZE, USER_STACK};
use crate::vm::{
    self, alloc_page_with_initializer, pg_round_down, PageFlags, PageType, Pml4, PteFlags, Spt,
};

pub struct Proc {
    pub pml4: Arc<Pml4>,
    pub spt: Spt,
    fds: Vec<Option<Arc<Mutex<File>>>>,
    pub cwd: ClusterNo,
    /// User stack pointer captured at the last kernel entry.
    pub rsp: usize,
}

impl Proc {
    pub fn new() -> Proc {
        let mut fds = Vec::new();
        fds.resize_with(NOFILE, || None);
        Proc {
            pml4: Arc::new(Pml4::new()),
            spt: Spt::new(),
            fds,
            cwd: ROOT_CLUSTER,
            rsp: USER_STACK,
        }
    }

    // ------------------------------------------------------------------
    // File descriptors.

    fn file(&self, fd: usize) -> Result<&Arc<Mutex<File>>> {
        self.fds
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .ok_or(KernelError::NotFound)
    }

    /// Shared handle for an open descriptor, e.g. to hand to `mmap`.
    pub fn file_handle(&self, fd: usize) -> Result<Arc<Mutex<File>>> {
        self.file(fd).map(Arc::clone)
    }

    pub fn open(&mut self, k: &Kernel, path: &str) -> Result<usize> {
        let ip = k.fs.open(self.cwd, path)?;
        let fd = match self.fds.iter().position(|slot| slot.is_none()) {
            Some(fd) => fd,
            None => {
                k.fs.inode_close(ip);
                return Err(KernelError::OutOfMemory);
            }
        };
        self.fds[fd] = Some(Arc::new(Mutex::new(File::new(ip))));
        Ok(fd)
    }

    /// Closes a descriptor. The file handle itself closes only when no
    /// other descriptor (via `dup2`) still shares it.
    pub fn close(&mut self, k: &Kernel, fd: usize) -> Result<()> {
        let slot = self
            .fds
            .get_mut(fd)
            .ok_or(KernelError::NotFound)?
            .take()
            .ok_or(KernelError::NotFound)?;
        if let Ok(file) = Arc::try_unwrap(slot) {
            file.into_inner().unwrap().close(&k.fs);
        }
        Ok(())
    }

    /// Makes `newfd` another name for `oldfd`; the two share one handle
    /// and one offset.
    pub fn dup2(&mut self, k: &Kernel, oldfd: usize, newfd: usize) -> Result<usize> {
        if newfd >= NOFILE {
            return Err(KernelError::InvalidArg);
        }
        let shared = Arc::clone(self.file(oldfd)?);
        if oldfd == newfd {
            return Ok(newfd);
        }
        if self.fds[newfd].is_some() {
            self.close(k, newfd)?;
        }
        self.fds[newfd] = Some(shared);
        Ok(newfd)
    }

    pub fn read(&mut self, k: &Kernel, fd: usize, buf: &mut [u8]) -> Result<usize> {
        self.file(fd)?.lock().unwrap().read(&k.fs, buf)
    }

    pub fn write(&mut self, k: &Kernel, fd: usize, buf: &[u8]) -> Result<usize> {
        self.file(fd)?.lock().unwrap().write(&k.fs, buf)
    }

    pub fn seek(&mut self, fd: usize, pos: usize) -> Result<()> {
        self.file(fd)?.lock().unwrap().seek(pos);
        Ok(())
    }

    pub fn tell(&self, fd: usize) -> Result<usize> {
        Ok(self.file(fd)?.lock().unwrap().tell())
    }

    pub fn filesize(&self, fd: usize) -> Result<usize> {
        Ok(self.file(fd)?.lock().unwrap().len())
    }

    // ------------------------------------------------------------------
    // Names.

    pub fn create(&self, k: &Kernel, path: &str, initial_size: usize) -> Result<()> {
        k.fs.create(self.cwd, path, initial_size)
    }

    pub fn remove(&self, k: &Kernel, path: &str) -> Result<()> {
        k.fs.remove(self.cwd, path)
    }

    pub fn mkdir(&self, k: &Kernel, path: &str) -> Result<()> {
        k.fs.mkdir(self.cwd, path)
    }

    pub fn chdir(&mut self, k: &Kernel, path: &str) -> Result<()> {
        self.cwd = k.fs.chdir(self.cwd, path)?;
        Ok(())
    }

    pub fn symlink(&self, k: &Kernel, target: &str, linkpath: &str) -> Result<()> {
        k.fs.symlink(self.cwd, target, linkpath)
    }

    // ------------------------------------------------------------------
    // Memory.

    /// Registers a lazy anonymous page at `va`, the way a loader maps a
    /// zero-filled segment. The page materializes on first touch.
    pub fn map_anon(&mut self, va: usize, writable: bool) -> Result<()> {
        let mut flags = PageFlags::empty();
        if writable {
            flags |= PageFlags::WRITABLE;
        }
        alloc_page_with_initializer(
            &mut self.spt,
            &self.pml4,
            PageType::Anon,
            pg_round_down(va),
            flags,
            None,
            None,
        )
        .map(|_| ())
    }

    pub fn mmap(
        &mut self,
        k: &Kernel,
        addr: usize,
        length: usize,
        writable: bool,
        fd: usize,
        offset: usize,
    ) -> Result<usize> {
        let file = self.file_handle(fd)?;
        if file.lock().unwrap().typ() != InodeType::File {
            return Err(KernelError::InvalidArg);
        }
        vm::do_mmap(
            k,
            &mut self.spt,
            &self.pml4,
            addr,
            length,
            writable,
            &file,
            offset,
        )
    }

    pub fn munmap(&mut self, k: &Kernel, addr: usize) -> Result<()> {
        vm::do_munmap(k, &mut self.spt, addr)
    }

    pub fn handle_fault(&mut self, k: &Kernel, addr: usize, write: bool, not_present: bool) -> bool {
        vm::try_handle_fault(
            k,
            &mut self.spt,
            &self.pml4,
            self.rsp,
            addr,
            true,
            write,
            not_present,
        )
    }

    /// Copies `buf` into user memory at `va`, faulting pages in on the
    /// way. Fails with `Denied` when the fault handler rejects an access.
    pub fn write_bytes(&mut self, k: &Kernel, va: usize, buf: &[u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let addr = va + off;
            let n = core::cmp::min(PGSIZE - addr % PGSIZE, buf.len() - off);
            self.access(k, addr, n, true, |slice| {
                slice.copy_from_slice(&buf[off..off + n])
            })?;
            off += n;
        }
        Ok(())
    }

    /// Copies user memory at `va` out into `buf`.
    pub fn read_bytes(&mut self, k: &Kernel, va: usize, buf: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let addr = va + off;
            let n = core::cmp::min(PGSIZE - addr % PGSIZE, buf.len() - off);
            let dst = &mut buf[off..off + n];
            self.access(k, addr, n, false, |slice| dst.copy_from_slice(slice))?;
            off += n;
        }
        Ok(())
    }

    /// One MMU access within a single page: translate, fault on miss or
    /// protection, run `f` on the mapped bytes, and set the user-alias
    /// accessed/dirty bits.
    fn access<R>(
        &mut self,
        k: &Kernel,
        addr: usize,
        len: usize,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        debug_assert!(addr % PGSIZE + len <= PGSIZE);
        let va = pg_round_down(addr);
        // Bounded retries: eviction can pull the frame out from under us
        // between the lookup and the copy.
        for _ in 0..64 {
            let pte = match self.pml4.lookup(va) {
                Some(pte) => pte,
                None => {
                    if !self.handle_fault(k, addr, write, true) {
                        return Err(KernelError::Denied);
                    }
                    continue;
                }
            };
            if write && !pte.flags.contains(PteFlags::WRITABLE) {
                if !self.handle_fault(k, addr, write, false) {
                    return Err(KernelError::Denied);
                }
                continue;
            }
            let data = match k.frames.data(pte.frame) {
                Some(data) => data,
                None => continue,
            };
            let mut guard = data.lock_buf();
            // The mapping may have been torn down while we took the
            // frame lock; check again before touching the bytes.
            match self.pml4.lookup(va) {
                Some(now) if now.frame == pte.frame => {}
                _ => continue,
            }
            self.pml4.mark_access(va, write);
            let start = addr % PGSIZE;
            return Ok(f(&mut guard[start..start + len]));
        }
        Err(KernelError::Denied)
    }

    // ------------------------------------------------------------------
    // Process lifecycle.

    /// Forks the process: the child gets duplicated file handles (own
    /// offsets), the same working directory, and an eagerly-copied
    /// address space. A failed copy unwinds the partially built child.
    pub fn fork(&self, k: &Kernel) -> Result<Proc> {
        let mut child = Proc::new();
        child.cwd = self.cwd;
        child.rsp = self.rsp;
        for (fd, slot) in self.fds.iter().enumerate() {
            if let Some(file) = slot {
                let dup = file.lock().unwrap().duplicate(&k.fs);
                child.fds[fd] = Some(Arc::new(Mutex::new(dup)));
            }
        }

        let mut child = scopeguard::guard(child, |mut child| child.exit(k));
        {
            let child = &mut *child;
            child.spt.copy_from(k, &self.spt, &child.pml4)?;
        }
        Ok(ScopeGuard::into_inner(child))
    }

    /// Tears the process down: destroys the address space (writing dirty
    /// file pages back) and drops every descriptor.
    pub fn exit(&mut self, k: &Kernel) {
        self.spt.kill(k);
        for fd in 0..self.fds.len() {
            if self.fds[fd].is_some() {
                let _ = self.close(k, fd);
            }
        }
    }
}
