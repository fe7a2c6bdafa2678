//! File system.
//!
//! Layers, bottom up:
//! * FAT: chain allocator over 4096-byte clusters (`fat`).
//! * Buffer cache: 8 page frames over aligned sector groups, with
//!   read-ahead and periodic writeback daemons (`pcache`).
//! * Inodes: file metadata and data I/O through the cache (`inode`).
//! * Directories: name -> cluster entries inside directory inodes (`dir`).
//! * Names: path resolution and the create/open/remove/mkdir/chdir/symlink
//!   surface, here.
//!
//! There is no implicit global state: one `FileSys` value owns the disk
//! handle, the FAT image, the open-inode table and the cache, and is
//! injected wherever file I/O happens.

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::disk::Disk;
use crate::error::{KernelError, Result};
use crate::param::MAX_SYMLINK_HOPS;

pub mod dir;
pub mod fat;
pub mod inode;
pub mod pcache;

pub use fat::{ClusterNo, Fat, EOCHAIN, ROOT_CLUSTER};
pub use inode::{Inode, InodeType, Itable};
pub use pcache::PageCache;

pub struct FileSys {
    pub disk: Arc<dyn Disk>,
    pub fat: Fat,
    pub itable: Itable,
    pub cache: Arc<PageCache>,
}

impl FileSys {
    /// Brings the file system up on `disk`, formatting it first when
    /// `format` is set, and starts the cache daemons.
    pub fn mount(disk: Arc<dyn Disk>, format: bool, writeback_interval_ms: u64) -> FileSys {
        let fat = if format {
            Fat::format(&*disk)
        } else {
            Fat::mount(&*disk)
        };
        let cache = Arc::new(PageCache::new());
        PageCache::start(&cache, Arc::clone(&disk), writeback_interval_ms);

        let fs = FileSys {
            disk,
            fat,
            itable: Itable::new(),
            cache,
        };
        if format {
            Inode::create(&fs, ROOT_CLUSTER, 0, InodeType::Dir)
                .expect("root directory creation failed");
            let root = fs.inode_open(ROOT_CLUSTER).unwrap();
            dir::add(&fs, &root, ".", ROOT_CLUSTER).unwrap();
            dir::add(&fs, &root, "..", ROOT_CLUSTER).unwrap();
            fs.inode_close(root);
        }
        fs
    }

    /// Stops the daemons and writes everything unwritten back to disk.
    pub fn shutdown(&self) {
        if self.itable.len() > 0 {
            log::warn!("shutdown with {} inodes still open", self.itable.len());
        }
        self.cache.shutdown(&*self.disk);
        self.fat.flush(&*self.disk);
        log::info!("file system shut down");
    }

    /// Creates a file named `path` with `initial_size` zeroed bytes.
    pub fn create(&self, cwd: ClusterNo, path: &str, initial_size: usize) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = self.create_inode_at(&parent, &name, initial_size, InodeType::File);
        self.inode_close(parent);
        res.map(|_| ())
    }

    /// Opens `path`, following symlinks (at most `MAX_SYMLINK_HOPS`).
    pub fn open(&self, cwd: ClusterNo, path: &str) -> Result<Arc<Inode>> {
        let (mut parent, mut name) = self.resolve_parent(cwd, path)?;
        let mut hops: ArrayVec<ClusterNo, MAX_SYMLINK_HOPS> = ArrayVec::new();
        loop {
            let cluster = match dir::lookup(self, &parent, &name) {
                Ok(c) => c,
                Err(e) => {
                    self.inode_close(parent);
                    return Err(e);
                }
            };
            let ip = self.inode_open(cluster)?;
            if ip.typ() != InodeType::Symlink {
                self.inode_close(parent);
                return Ok(ip);
            }

            // Follow the link. The hop chain doubles as the cycle check.
            if hops.contains(&cluster) || hops.is_full() {
                log::warn!("open {:?}: symlink loop", path);
                self.inode_close(ip);
                self.inode_close(parent);
                return Err(KernelError::NotFound);
            }
            hops.push(cluster);

            let mut target = vec![0u8; ip.len()];
            let n = ip.read_at(self, &mut target, 0)?;
            self.inode_close(ip);
            target.truncate(n);
            // Stored as a NUL-terminated string.
            if let Some(pos) = target.iter().position(|b| *b == 0) {
                target.truncate(pos);
            }
            let target = String::from_utf8(target).map_err(|_| KernelError::InvalidArg)?;

            // The target resolves relative to the symlink's directory.
            let (next_parent, next_name) = self.resolve_parent(parent.cluster, &target)?;
            self.inode_close(parent);
            parent = next_parent;
            name = next_name;
        }
    }

    /// Removes `path`. Directories must be empty. The storage is freed
    /// when the last opener closes the inode.
    pub fn remove(&self, cwd: ClusterNo, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = (|| {
            let cluster = dir::lookup(self, &parent, &name)?;
            let ip = self.inode_open(cluster)?;
            if ip.typ() == InodeType::Dir && !dir::is_empty(self, &ip)? {
                self.inode_close(ip);
                return Err(KernelError::Denied);
            }
            if name == "." || name == ".." {
                self.inode_close(ip);
                return Err(KernelError::InvalidArg);
            }
            dir::remove(self, &parent, &name)?;
            ip.mark_removed();
            self.inode_close(ip);
            Ok(())
        })();
        self.inode_close(parent);
        res
    }

    /// Creates a directory named `path`, with "." and ".." entries.
    pub fn mkdir(&self, cwd: ClusterNo, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        let res = (|| {
            let cluster = self.create_inode_at(&parent, &name, 0, InodeType::Dir)?;
            let new_dir = self.inode_open(cluster)?;
            let filled = dir::add(self, &new_dir, ".", cluster)
                .and_then(|_| dir::add(self, &new_dir, "..", parent.cluster));
            self.inode_close(new_dir);
            filled
        })();
        self.inode_close(parent);
        res
    }

    /// Resolves `path` to a directory and returns its cluster, the new
    /// working directory of the caller.
    pub fn chdir(&self, cwd: ClusterNo, path: &str) -> Result<ClusterNo> {
        let ip = self.open(cwd, path)?;
        if ip.typ() != InodeType::Dir {
            self.inode_close(ip);
            return Err(KernelError::NotFound);
        }
        let cluster = ip.cluster;
        self.inode_close(ip);
        Ok(cluster)
    }

    /// Creates a symlink at `linkpath` whose content is `target`,
    /// NUL-terminated, in its first cluster.
    pub fn symlink(&self, cwd: ClusterNo, target: &str, linkpath: &str) -> Result<()> {
        if target.is_empty() || target.contains('\0') {
            return Err(KernelError::InvalidArg);
        }
        let (parent, name) = self.resolve_parent(cwd, linkpath)?;
        let res = (|| {
            let cluster =
                self.create_inode_at(&parent, &name, target.len() + 1, InodeType::Symlink)?;
            let ip = self.inode_open(cluster)?;
            let mut content = target.as_bytes().to_vec();
            content.push(0);
            let written = ip.write_at(self, &content, 0);
            self.inode_close(ip);
            written.map(|_| ())
        })();
        self.inode_close(parent);
        res
    }

    /// Allocates an inode cluster, writes a fresh image of `typ`, and
    /// links it into `parent` under `name`. Unwinds the allocations when
    /// the directory insert fails.
    fn create_inode_at(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        initial_size: usize,
        typ: InodeType,
    ) -> Result<ClusterNo> {
        if dir::lookup(self, parent, name).is_ok() {
            return Err(KernelError::AlreadyExists);
        }
        let cluster = self.fat.create_chain(0)?;
        if let Err(e) = Inode::create(self, cluster, initial_size, typ) {
            self.fat.remove_chain(cluster, 0);
            return Err(e);
        }
        if let Err(e) = dir::add(self, parent, name, cluster) {
            let start = inode::disk_inode_start(&self.read_inode_image(cluster));
            // Cached groups of the dying chain must not survive into the
            // clusters' next life.
            for c in self.fat.chain(start) {
                self.cache.discard(self.fat.cluster_to_sector(c));
            }
            self.fat.remove_chain(start, 0);
            self.fat.remove_chain(cluster, 0);
            return Err(e);
        }
        log::debug!("created inode {} ({:?}) as {:?}", cluster, typ, name);
        Ok(cluster)
    }

    /// Walks `path` down to its final component. Returns the opened
    /// parent directory and the component's name; the caller closes the
    /// directory. A trailing "/" (or the path "/") resolves to the
    /// directory itself under the name ".".
    fn resolve_parent(&self, cwd: ClusterNo, path: &str) -> Result<(Arc<Inode>, String)> {
        if path.is_empty() {
            return Err(KernelError::InvalidArg);
        }
        let start = if path.starts_with('/') { ROOT_CLUSTER } else { cwd };
        let mut parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let last = parts.pop().unwrap_or(".").to_string();

        let mut dir_ip = self.inode_open(start)?;
        if dir_ip.typ() != InodeType::Dir {
            self.inode_close(dir_ip);
            return Err(KernelError::NotFound);
        }
        for comp in parts {
            let next = (|| {
                let cluster = dir::lookup(self, &dir_ip, comp)?;
                let next = self.inode_open(cluster)?;
                if next.typ() != InodeType::Dir {
                    self.inode_close(next);
                    return Err(KernelError::NotFound);
                }
                Ok(next)
            })();
            self.inode_close(dir_ip);
            dir_ip = next?;
        }
        Ok((dir_ip, last))
    }
}
