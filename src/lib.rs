//! Memory and storage core of the pv6 teaching operating system.
//!
//! Two subsystems, modelled as a hosted crate so the whole machine is
//! drivable from tests:
//!
//! * Virtual memory (`vm`, `proc`): demand paging over a fixed frame
//!   pool with clock eviction, anonymous pages swapping to a dedicated
//!   device, memory-mapped files, the page-fault handler and its
//!   stack-growth policy, and fork-time address space copy.
//! * Storage (`fs`, `file`, `disk`): a FAT file system whose data I/O
//!   runs through an 8-frame buffer cache with asynchronous read-ahead
//!   and periodic writeback, plus directories, symlinks and open-file
//!   handles.
//!
//! A `kernel::Kernel` value ties the two together; `proc::Proc` is the
//! per-process view. See the module docs for the locking rules.

pub mod disk;
pub mod error;
pub mod file;
pub mod fs;
pub mod kernel;
pub mod param;
pub mod proc;
pub mod vm;

pub use error::{KernelError, Result};
pub use kernel::{Kernel, KernelConfig};
