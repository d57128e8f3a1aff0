//! Address-translation primitive.
//!
//! [`PageDirectory`] is the contract the hosting kernel's page tables must
//! satisfy: install/clear/lookup plus the hardware accessed and dirty bits
//! the eviction clock reads. One instance per address space.
//!
//! [`SoftPageDir`] is a software implementation (a map under a lock) with
//! the same observable semantics as an x86 page directory: install sets
//! the accessed bit and clears dirty, user stores set both.

use crate::palloc::FramePtr;
use crate::sync::TicketMutex;
use alloc::collections::BTreeMap;
use bitbybit::bitfield;
use nephron_shared::mem::{is_page_aligned, page_offset, page_round_down, PAGE_FRAME_SIZE};

pub trait PageDirectory: Send + Sync {
    /// Map `vaddr` (page-aligned) to `frame`.
    ///
    /// Returns false if the mapping cannot be created (translation-table
    /// exhaustion, or `vaddr` already maps a different frame). Re-installing
    /// the same frame is idempotent and refreshes the writable bit.
    fn install(&self, vaddr: usize, frame: FramePtr, writable: bool) -> bool;

    /// Remove the mapping for `vaddr`. No-op if not mapped.
    fn clear(&self, vaddr: usize);

    fn lookup_frame(&self, vaddr: usize) -> Option<FramePtr>;

    fn is_accessed(&self, vaddr: usize) -> bool;
    fn set_accessed(&self, vaddr: usize, accessed: bool);

    fn is_dirty(&self, vaddr: usize) -> bool;
    fn set_dirty(&self, vaddr: usize, dirty: bool);
}

#[bitfield(u8, default = 0)]
struct PteFlags {
    #[bit(0, rw)]
    writable: bool,
    #[bit(1, rw)]
    accessed: bool,
    #[bit(2, rw)]
    dirty: bool,
}

#[derive(Clone, Copy)]
struct SoftPte {
    frame: FramePtr,
    flags: PteFlags,
}

/// Software page directory for hosts without MMU access, and for tests.
pub struct SoftPageDir {
    entries: TicketMutex<BTreeMap<usize, SoftPte>>,
    capacity: Option<usize>,
}

impl SoftPageDir {
    pub fn new() -> Self {
        Self {
            entries: TicketMutex::new(BTreeMap::new()),
            capacity: None,
        }
    }

    /// A directory that refuses installs beyond `capacity` mappings,
    /// to exercise translation-exhaustion paths.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: TicketMutex::new(BTreeMap::new()),
            capacity: Some(capacity),
        }
    }

    /// Emulate a user-mode store: copies `data` into the mapped frame and
    /// sets the accessed and dirty bits, as the MMU would.
    ///
    /// Returns false on an unmapped page, a write to a read-only page, or
    /// a write crossing the page boundary.
    pub fn write_user(&self, addr: usize, data: &[u8]) -> bool {
        let page = page_round_down(addr);
        let offset = page_offset(addr);
        if offset + data.len() > PAGE_FRAME_SIZE {
            return false;
        }
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&page) else {
            return false;
        };
        if !pte.flags.writable() {
            return false;
        }
        pte.flags = pte.flags.with_accessed(true).with_dirty(true);
        let frame = pte.frame;
        // Copy while still holding the entries lock: `clear` must not be
        // able to retire the frame (and an evictor drop the page as
        // clean) between the dirty-bit update and the store landing.
        // SAFETY: the frame is mapped, so the frame table holds it live;
        // offset + len was bounds-checked above.
        unsafe {
            frame.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
        }
        true
    }

    /// Emulate a user-mode load, setting the accessed bit.
    pub fn read_user(&self, addr: usize, buf: &mut [u8]) -> bool {
        let page = page_round_down(addr);
        let offset = page_offset(addr);
        if offset + buf.len() > PAGE_FRAME_SIZE {
            return false;
        }
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&page) else {
            return false;
        };
        pte.flags = pte.flags.with_accessed(true);
        let frame = pte.frame;
        // SAFETY: as in write_user; the copy stays under the entries lock
        // so the mapping cannot be cleared mid-read.
        unsafe {
            buf.copy_from_slice(&frame.bytes()[offset..offset + buf.len()]);
        }
        true
    }
}

impl Default for SoftPageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory for SoftPageDir {
    fn install(&self, vaddr: usize, frame: FramePtr, writable: bool) -> bool {
        debug_assert!(is_page_aligned(vaddr));
        let mut entries = self.entries.lock();
        if let Some(pte) = entries.get_mut(&vaddr) {
            if pte.frame != frame {
                return false;
            }
            pte.flags = pte.flags.with_writable(writable);
            return true;
        }
        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity {
                return false;
            }
        }
        entries.insert(
            vaddr,
            SoftPte {
                frame,
                flags: PteFlags::default().with_writable(writable).with_accessed(true),
            },
        );
        true
    }

    fn clear(&self, vaddr: usize) {
        self.entries.lock().remove(&vaddr);
    }

    fn lookup_frame(&self, vaddr: usize) -> Option<FramePtr> {
        self.entries
            .lock()
            .get(&page_round_down(vaddr))
            .map(|pte| pte.frame)
    }

    fn is_accessed(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&vaddr)
            .is_some_and(|pte| pte.flags.accessed())
    }

    fn set_accessed(&self, vaddr: usize, accessed: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&vaddr) {
            pte.flags = pte.flags.with_accessed(accessed);
        }
    }

    fn is_dirty(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&vaddr)
            .is_some_and(|pte| pte.flags.dirty())
    }

    fn set_dirty(&self, vaddr: usize, dirty: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&vaddr) {
            pte.flags = pte.flags.with_dirty(dirty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palloc::{FramePool, PageAllocator};

    #[test]
    fn install_lookup_clear() {
        let pool = FramePool::new(1);
        let frame = pool.alloc_page(true).expect("frame");
        let dir = SoftPageDir::new();
        assert!(dir.install(0x1000, frame, true));
        assert_eq!(dir.lookup_frame(0x1234), Some(frame));
        assert!(dir.is_accessed(0x1000));
        assert!(!dir.is_dirty(0x1000));
        dir.clear(0x1000);
        assert_eq!(dir.lookup_frame(0x1000), None);
        pool.free_page(frame);
    }

    #[test]
    fn reinstall_same_frame_is_idempotent() {
        let pool = FramePool::new(2);
        let frame = pool.alloc_page(true).expect("frame");
        let other = pool.alloc_page(true).expect("frame");
        let dir = SoftPageDir::new();
        assert!(dir.install(0x1000, frame, false));
        assert!(dir.install(0x1000, frame, true));
        assert!(!dir.install(0x1000, other, true));
        pool.free_page(frame);
        pool.free_page(other);
    }

    #[test]
    fn user_store_sets_dirty() {
        let pool = FramePool::new(1);
        let frame = pool.alloc_page(true).expect("frame");
        let dir = SoftPageDir::new();
        assert!(dir.install(0x1000, frame, true));
        dir.set_accessed(0x1000, false);
        assert!(dir.write_user(0x1010, b"hi"));
        assert!(dir.is_accessed(0x1000));
        assert!(dir.is_dirty(0x1000));
        let mut buf = [0u8; 2];
        assert!(dir.read_user(0x1010, &mut buf));
        assert_eq!(&buf, b"hi");
        pool.free_page(frame);
    }

    #[test]
    fn read_only_store_rejected() {
        let pool = FramePool::new(1);
        let frame = pool.alloc_page(true).expect("frame");
        let dir = SoftPageDir::new();
        assert!(dir.install(0x1000, frame, false));
        assert!(!dir.write_user(0x1000, b"x"));
        pool.free_page(frame);
    }

    #[test]
    fn capacity_limit() {
        let pool = FramePool::new(2);
        let a = pool.alloc_page(true).expect("frame");
        let b = pool.alloc_page(true).expect("frame");
        let dir = SoftPageDir::with_capacity(1);
        assert!(dir.install(0x1000, a, true));
        assert!(!dir.install(0x2000, b, true));
        pool.free_page(a);
        pool.free_page(b);
    }
}
