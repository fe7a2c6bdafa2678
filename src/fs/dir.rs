//! Directories.
//!
//! A directory is a file containing a sequence of fixed-size entries
//! mapping names to inode clusters. An entry with cluster 0 is free.
//! Every directory carries "." and ".." entries; they are created by
//! `mkdir` (and by the root format) and hidden from the emptiness check.

use std::convert::TryInto;
use std::sync::Arc;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::fat::ClusterNo;
use super::inode::{Inode, InodeType};
use super::FileSys;
use crate::error::{KernelError, Result};
use crate::param::DIRSIZ;

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct Dirent {
    cluster: u32,
    /// NUL-padded name; a full-length name has no terminator.
    name: [u8; DIRSIZ],
    _pad: u8,
}

pub const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();
const_assert!(DIRENT_SIZE == 32);

impl Dirent {
    fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        self.name[..bytes.len()].copy_from_slice(bytes);
        for b in &mut self.name[bytes.len()..] {
            *b = 0;
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > DIRSIZ || name.contains('/') || name.contains('\0') {
        return Err(KernelError::InvalidArg);
    }
    Ok(())
}

fn read_entry(fs: &FileSys, dir: &Inode, idx: usize) -> Result<Dirent> {
    let mut buf = [0u8; DIRENT_SIZE];
    let n = dir.read_at(fs, &mut buf, idx * DIRENT_SIZE)?;
    if n != DIRENT_SIZE {
        panic!("directory {} has a truncated entry at {}", dir.cluster, idx);
    }
    Ok(Dirent::read_from(&buf[..]).unwrap())
}

fn write_entry(fs: &FileSys, dir: &Inode, idx: usize, entry: &Dirent) -> Result<()> {
    let buf: &[u8; DIRENT_SIZE] = entry.as_bytes().try_into().unwrap();
    let n = dir.write_at(fs, buf, idx * DIRENT_SIZE)?;
    if n != DIRENT_SIZE {
        return Err(KernelError::OutOfSpace);
    }
    Ok(())
}

fn entries(dir: &Inode) -> usize {
    dir.len() / DIRENT_SIZE
}

/// Finds `name` in `dir` and returns its cluster.
pub fn lookup(fs: &FileSys, dir: &Arc<Inode>, name: &str) -> Result<ClusterNo> {
    check_name(name)?;
    debug_assert_eq!(dir.typ(), InodeType::Dir);
    for idx in 0..entries(dir) {
        let entry = read_entry(fs, dir, idx)?;
        if entry.cluster != 0 && entry.name_bytes() == name.as_bytes() {
            return Ok(entry.cluster);
        }
    }
    Err(KernelError::NotFound)
}

/// Adds an entry for `name`, reusing a free slot if one exists.
pub fn add(fs: &FileSys, dir: &Arc<Inode>, name: &str, cluster: ClusterNo) -> Result<()> {
    check_name(name)?;
    assert!(cluster != 0);
    let mut free = None;
    for idx in 0..entries(dir) {
        let entry = read_entry(fs, dir, idx)?;
        if entry.cluster == 0 {
            free.get_or_insert(idx);
        } else if entry.name_bytes() == name.as_bytes() {
            return Err(KernelError::AlreadyExists);
        }
    }
    let idx = free.unwrap_or_else(|| entries(dir));

    let mut entry = Dirent::new_zeroed();
    entry.cluster = cluster;
    entry.set_name(name);
    write_entry(fs, dir, idx, &entry)
}

/// Removes the entry for `name`.
pub fn remove(fs: &FileSys, dir: &Arc<Inode>, name: &str) -> Result<()> {
    check_name(name)?;
    for idx in 0..entries(dir) {
        let entry = read_entry(fs, dir, idx)?;
        if entry.cluster != 0 && entry.name_bytes() == name.as_bytes() {
            return write_entry(fs, dir, idx, &Dirent::new_zeroed());
        }
    }
    Err(KernelError::NotFound)
}

/// True when `dir` holds nothing besides "." and "..".
pub fn is_empty(fs: &FileSys, dir: &Arc<Inode>) -> Result<bool> {
    for idx in 0..entries(dir) {
        let entry = read_entry(fs, dir, idx)?;
        if entry.cluster != 0 && entry.name_bytes() != b"." && entry.name_bytes() != b".." {
            return Ok(false);
        }
    }
    Ok(true)
}
