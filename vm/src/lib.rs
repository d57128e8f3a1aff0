//! User-page virtual memory: frame allocation, supplemental page tables,
//! second-chance eviction, and a swap store for evicted pages.
//!
//! The crate is the core of a kernel's VM subsystem, written against three
//! host seams: a physical page allocator ([`palloc::PageAllocator`]), an
//! address-translation primitive ([`pagedir::PageDirectory`]), and a file
//! primitive ([`file::BackingFile`]). In-tree implementations of each seam
//! ([`palloc::FramePool`], [`pagedir::SoftPageDir`], [`file::MemFile`])
//! back the tests and any host without hardware access.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod file;
pub mod frame;
pub mod page;
pub mod pagedir;
pub mod palloc;
pub mod swap;
pub mod sync;
pub mod system;

pub use error::{Result, VmError};
pub use page::AddressSpace;
pub use system::VmSystem;

/// Process identifier of a frame's owner. Assigned by the hosting kernel.
pub type Pid = u16;
