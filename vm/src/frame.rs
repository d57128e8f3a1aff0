//! Frame table: the global registry of physical frames backing resident
//! user pages, and the second-chance eviction that feeds allocation under
//! memory pressure.
//!
//! Lock order: a faulting thread holds its page entry's lock, then takes
//! the table lock; the clock only ever `try_lock`s other entries, so the
//! two directions cannot deadlock. The table lock is dropped across
//! write-back I/O and re-acquired to finalize removal.

use crate::error::{Result, VmError};
use crate::page::{PageBacking, PageEntry};
use crate::pagedir::PageDirectory;
use crate::palloc::{FramePtr, PageAllocator};
use crate::sync::TicketMutex;
use crate::system::VmSystem;
use crate::Pid;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::{debug, trace};

/// One physical frame currently mapped into some address space.
///
/// Both back-references are weak: the frame table supports lookup and
/// invalidation but never extends the lifetime of an entry or a page
/// directory (the supplemental page table and the process own those).
struct Frame {
    ptr: FramePtr,
    owner: Pid,
    vaddr: usize,
    pagedir: Weak<dyn PageDirectory>,
    entry: Weak<TicketMutex<PageEntry>>,
    /// Held out of victim selection while its write-back is in flight.
    pinned: bool,
}

struct FrameTableInner {
    frames: Vec<Frame>,
    /// Clock hand for second-chance selection.
    hand: usize,
}

pub struct FrameTable {
    palloc: Box<dyn PageAllocator>,
    inner: TicketMutex<FrameTableInner>,
}

impl FrameTable {
    pub fn new(palloc: Box<dyn PageAllocator>) -> Self {
        Self {
            palloc,
            inner: TicketMutex::new(FrameTableInner {
                frames: Vec::new(),
                hand: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn contains(&self, ptr: FramePtr) -> bool {
        self.inner.lock().frames.iter().any(|f| f.ptr == ptr)
    }

    /// Obtain a frame for `entry` (at `vaddr` in `pagedir`'s space),
    /// evicting a resident page if the allocator is exhausted.
    ///
    /// The caller must hold `entry`'s lock; that keeps the new frame out
    /// of victim selection until population completes.
    pub fn allocate(
        &self,
        system: &VmSystem,
        zero: bool,
        owner: Pid,
        pagedir: &Arc<dyn PageDirectory>,
        entry: &Arc<TicketMutex<PageEntry>>,
        vaddr: usize,
    ) -> Result<FramePtr> {
        let ptr = match self.palloc.alloc_page(zero) {
            Some(ptr) => ptr,
            None => {
                let ptr = match self.evict(system) {
                    Ok(ptr) => Ok(ptr),
                    // A concurrent release may have freed a frame while
                    // the clock came up empty.
                    Err(e) => self.palloc.alloc_page(zero).ok_or(e),
                }?;
                if zero {
                    // SAFETY: the frame was reclaimed by eviction and is
                    // not yet visible to anyone else.
                    unsafe { ptr.zero() };
                }
                ptr
            }
        };

        let mut inner = self.inner.lock();
        inner.frames.push(Frame {
            ptr,
            owner,
            vaddr,
            pagedir: Arc::downgrade(pagedir),
            entry: Arc::downgrade(entry),
            pinned: false,
        });
        trace!("frame {:#x} -> pid {} vaddr {:#x}", ptr.addr(), owner, vaddr);
        Ok(ptr)
    }

    /// Remove `ptr` from the table, clear its translation mapping, and
    /// return the page to the allocator.
    ///
    /// Idempotent: a frame that was already evicted (or never inserted)
    /// is a no-op. Entry state is not touched; callers that care hold the
    /// entry lock and update it themselves.
    pub fn release(&self, ptr: FramePtr) {
        let mut inner = self.inner.lock();
        let Some(position) = inner.frames.iter().position(|f| f.ptr == ptr) else {
            return;
        };
        let frame = inner.frames.remove(position);
        debug_assert!(!frame.pinned, "release of frame mid-eviction");
        drop(inner);

        if let Some(pagedir) = frame.pagedir.upgrade() {
            pagedir.clear(frame.vaddr);
        }
        self.palloc.free_page(ptr);
    }

    /// Second-chance clock: scan resident frames circularly, clearing the
    /// accessed bit on the first encounter and selecting the first frame
    /// seen with accessed == 0. Pinned frames, entries whose lock is taken
    /// (population or write-back in flight), and non-evictable entries are
    /// skipped. Returns the reclaimed frame without reinserting it.
    fn evict(&self, system: &VmSystem) -> Result<FramePtr> {
        loop {
            let mut transient_skips = 0;
            let mut inner = self.inner.lock();
            let len = inner.frames.len();
            if len == 0 {
                return Err(VmError::OutOfMemory);
            }

            // Each frame gets at most two visits: one to lose its accessed
            // bit, one to be chosen.
            for _ in 0..2 * len {
                let index = inner.hand % len;
                inner.hand = (inner.hand + 1) % len;

                let (entry, pagedir, vaddr, ptr, owner) = {
                    let frame = &inner.frames[index];
                    if frame.pinned {
                        transient_skips += 1;
                        continue;
                    }
                    let Some(entry) = frame.entry.upgrade() else {
                        continue;
                    };
                    let Some(pagedir) = frame.pagedir.upgrade() else {
                        continue;
                    };
                    (entry, pagedir, frame.vaddr, frame.ptr, frame.owner)
                };

                let Some(mut guard) = entry.try_lock() else {
                    // Population in flight; never a victim.
                    transient_skips += 1;
                    continue;
                };
                if !guard.resident() || !guard.flags().evictable() {
                    continue;
                }
                if pagedir.is_accessed(vaddr) {
                    pagedir.set_accessed(vaddr, false);
                    continue;
                }

                inner.frames[index].pinned = true;
                drop(inner);

                let dirty = pagedir.is_dirty(vaddr);
                pagedir.clear(vaddr);
                debug!(
                    "evicting pid {} vaddr {:#x} (frame {:#x}, dirty: {})",
                    owner,
                    vaddr,
                    ptr.addr(),
                    dirty
                );

                if let Err(e) = write_back(system, &mut guard, ptr, dirty) {
                    // Swap exhausted: restore the mapping and give the
                    // frame back to its owner. Reinstalling reset the
                    // dirty bit, so put it back or the contents would be
                    // dropped as clean on the next eviction.
                    let restored = pagedir.install(vaddr, ptr, guard.flags().writable());
                    debug_assert!(restored, "failed to restore mapping after aborted eviction");
                    if dirty {
                        pagedir.set_dirty(vaddr, true);
                    }
                    let mut inner = self.inner.lock();
                    if let Some(frame) = inner.frames.iter_mut().find(|f| f.ptr == ptr) {
                        frame.pinned = false;
                    }
                    return Err(e);
                }

                guard.set_resident(false);
                let mut inner = self.inner.lock();
                let position = inner
                    .frames
                    .iter()
                    .position(|f| f.ptr == ptr)
                    .expect("pinned frame vanished from table");
                inner.frames.remove(position);
                return Ok(ptr);
            }

            drop(inner);
            if transient_skips == 0 {
                // Nothing will ever become evictable on its own.
                return Err(VmError::OutOfMemory);
            }
            // Every candidate was mid-population or mid-write-back; those
            // resolve without our help, so scan again.
            core::hint::spin_loop();
        }
    }
}

/// Write a victim's contents to their backing destination. The entry lock
/// is held by the caller; the frame table lock is not.
fn write_back(
    system: &VmSystem,
    entry: &mut PageEntry,
    ptr: FramePtr,
    dirty: bool,
) -> Result<()> {
    debug_assert!(
        !matches!(entry.backing(), PageBacking::Swap(_)),
        "resident page still holds a swap slot"
    );
    let needs_swap = match entry.backing() {
        // Dirty mmap pages go back to their file; clean file pages and
        // never-written zero pages can always be reproduced, so their
        // frames are dropped without any write.
        PageBacking::File(slice) if entry.flags().mmap() => {
            if dirty {
                // SAFETY: the frame is pinned and its mapping cleared; we
                // are the only reader.
                let bytes = unsafe { ptr.bytes() };
                let _fs = system.fs_lock.lock();
                let written = slice.file.write_at(&bytes[..slice.read_bytes], slice.offset);
                if written != slice.read_bytes {
                    panic!(
                        "mmap write-back failed, page contents lost: {written} of {} bytes",
                        slice.read_bytes
                    );
                }
            }
            false
        }
        PageBacking::File(_) | PageBacking::Zero if !dirty => false,
        // Anonymous data (and dirtied private file or zero pages) only
        // exist in the frame: they must reach swap or eviction fails.
        _ => true,
    };
    if needs_swap {
        // SAFETY: as above.
        let slot = system.swap.write_page(unsafe { ptr.bytes() })?;
        entry.set_backing(PageBacking::Swap(slot));
    }
    Ok(())
}
