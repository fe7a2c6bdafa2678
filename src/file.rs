//! Open file handles.
//!
//! A `File` pairs an open inode with a seek position. Handles are
//! duplicated two ways: `reopen` yields an independent handle with its own
//! position (used by mmap and by fork), while the fd table shares one
//! handle between descriptors (used by dup2), so shared descriptors share
//! the offset. The inode itself closes when its last handle goes away.

use std::sync::Arc;

use crate::error::Result;
use crate::fs::{FileSys, Inode, InodeType};

pub struct File {
    pub ip: Arc<Inode>,
    pos: usize,
    deny_write: bool,
}

impl File {
    pub fn new(ip: Arc<Inode>) -> File {
        File {
            ip,
            pos: 0,
            deny_write: false,
        }
    }

    pub fn len(&self) -> usize {
        self.ip.len()
    }

    pub fn typ(&self) -> InodeType {
        self.ip.typ()
    }

    pub fn read(&mut self, fs: &FileSys, buf: &mut [u8]) -> Result<usize> {
        let n = self.ip.read_at(fs, buf, self.pos)?;
        self.pos += n;
        Ok(n)
    }

    pub fn write(&mut self, fs: &FileSys, buf: &[u8]) -> Result<usize> {
        let n = self.ip.write_at(fs, buf, self.pos)?;
        self.pos += n;
        Ok(n)
    }

    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.ip.read_at(fs, buf, offset)
    }

    pub fn write_at(&self, fs: &FileSys, buf: &[u8], offset: usize) -> Result<usize> {
        self.ip.write_at(fs, buf, offset)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// A fresh handle on the same inode with its own position.
    pub fn reopen(&self, fs: &FileSys) -> File {
        fs.inode_reopen(&self.ip);
        File::new(Arc::clone(&self.ip))
    }

    /// A handle for a forked child: same inode, same position.
    pub fn duplicate(&self, fs: &FileSys) -> File {
        fs.inode_reopen(&self.ip);
        File {
            ip: Arc::clone(&self.ip),
            pos: self.pos,
            deny_write: false,
        }
    }

    /// Blocks writes through any handle until `close` (or `allow_write`).
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.ip.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.ip.allow_write();
        }
    }

    pub fn close(mut self, fs: &FileSys) {
        self.allow_write();
        let File { ip, .. } = self;
        fs.inode_close(ip);
    }
}
