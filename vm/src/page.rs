//! Supplemental page tables and fault resolution.
//!
//! Each process owns a [`SupplementalPageTable`]: one [`PageEntry`] per
//! user virtual page it has ever referenced, describing how to repopulate
//! the page when it is not resident. [`AddressSpace`] bundles the table
//! with the process's translation tables and exposes the three operations
//! the rest of the kernel calls: `insert_mapping` (loader / mmap path),
//! `resolve_fault` (trap handler), and `destroy` (process teardown).
//!
//! Per-entry locking: an entry's `TicketMutex` is held for the whole of a
//! fault's population, so a second fault on the same page waits instead of
//! re-populating, and the eviction clock (which only `try_lock`s) can
//! never pick a page mid-flight.

use crate::error::{Result, VmError};
use crate::file::FileSlice;
use crate::pagedir::PageDirectory;
use crate::sync::TicketMutex;
use crate::system::VmSystem;
use crate::Pid;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bitbybit::bitfield;
use log::trace;
use nephron_shared::mem::{is_page_aligned, page_round_down};

#[bitfield(u8, default = 0)]
pub struct PageFlags {
    #[bit(0, rw)]
    writable: bool,
    /// Clear while population or write-back is in flight; such a page
    /// must not be chosen as an eviction victim.
    #[bit(1, rw)]
    evictable: bool,
    /// Page belongs to a shared file mapping: dirty contents go back to
    /// the file on eviction and teardown, never to swap.
    #[bit(2, rw)]
    mmap: bool,
}

/// Where a page's contents live (or come from) when it is not resident.
///
/// A tagged sum: a page cannot be simultaneously on swap and file-backed.
#[derive(Clone, Debug)]
pub enum PageBacking {
    /// Never-written page; populated by zero fill.
    Zero,
    /// Anonymous page whose only copy is in its frame (e.g. after a swap
    /// slot was read back and freed). Eviction must write it to swap.
    Anon,
    /// Evicted to the given swap slot.
    Swap(crate::swap::SlotId),
    /// Contents come from (and, for mmap pages, go back to) a file range.
    File(FileSlice),
}

/// Supplemental page-table entry for one user virtual page.
pub struct PageEntry {
    vaddr: usize,
    flags: PageFlags,
    resident: bool,
    backing: PageBacking,
}

impl PageEntry {
    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn resident(&self) -> bool {
        self.resident
    }

    pub fn backing(&self) -> &PageBacking {
        &self.backing
    }

    pub(crate) fn set_resident(&mut self, resident: bool) {
        self.resident = resident;
    }

    pub(crate) fn set_backing(&mut self, backing: PageBacking) {
        self.backing = backing;
    }

    fn set_evictable(&mut self, evictable: bool) {
        self.flags = self.flags.with_evictable(evictable);
    }
}

/// Per-process map from page-aligned virtual address to entry.
///
/// The map lock is held only for lookup and insert; all per-page work
/// happens under the individual entry locks.
pub struct SupplementalPageTable {
    entries: TicketMutex<BTreeMap<usize, Arc<TicketMutex<PageEntry>>>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            entries: TicketMutex::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, vaddr: usize) -> Option<Arc<TicketMutex<PageEntry>>> {
        self.entries
            .lock()
            .get(&page_round_down(vaddr))
            .map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn insert(
        &self,
        vaddr: usize,
        backing: PageBacking,
        writable: bool,
        mmap: bool,
    ) -> Result<()> {
        assert!(is_page_aligned(vaddr), "mapping key must be page-aligned");
        let mut entries = self.entries.lock();
        if entries.contains_key(&vaddr) {
            return Err(VmError::DuplicateMapping);
        }
        entries.insert(
            vaddr,
            Arc::new(TicketMutex::new(PageEntry {
                vaddr,
                flags: PageFlags::default()
                    .with_writable(writable)
                    .with_evictable(true)
                    .with_mmap(mmap),
                resident: false,
                backing,
            })),
        );
        Ok(())
    }

    fn take_all(&self) -> BTreeMap<usize, Arc<TicketMutex<PageEntry>>> {
        core::mem::take(&mut *self.entries.lock())
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One process's view of virtual memory: its translation tables plus its
/// supplemental page table. Only the process's own threads fault through
/// it; `destroy` runs once, after the last of them has exited.
pub struct AddressSpace {
    pid: Pid,
    pagedir: Arc<dyn PageDirectory>,
    table: SupplementalPageTable,
}

impl AddressSpace {
    pub fn new(pid: Pid, pagedir: Arc<dyn PageDirectory>) -> Self {
        Self {
            pid,
            pagedir,
            table: SupplementalPageTable::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pagedir(&self) -> &Arc<dyn PageDirectory> {
        &self.pagedir
    }

    pub fn table(&self) -> &SupplementalPageTable {
        &self.table
    }

    /// Register a fresh virtual page (stack growth, executable segment).
    ///
    /// New pages are zero-fill or file-backed; `Swap`/`Anon` states only
    /// arise from eviction.
    pub fn insert_mapping(&self, vaddr: usize, backing: PageBacking, writable: bool) -> Result<()> {
        assert!(
            matches!(backing, PageBacking::Zero | PageBacking::File(_)),
            "new mappings are zero-fill or file-backed"
        );
        self.table.insert(vaddr, backing, writable, false)
    }

    /// Register one page of a shared file mapping.
    pub fn insert_mmap(&self, vaddr: usize, slice: FileSlice, writable: bool) -> Result<()> {
        self.table.insert(vaddr, PageBacking::File(slice), writable, true)
    }

    /// Satisfy a page fault at `vaddr` (any address within the page).
    ///
    /// `SegFault` means the caller should terminate the process: the
    /// address was never mapped, a write hit a read-only resident page,
    /// or population could not complete. `OutOfMemory` is fatal to the
    /// faulting operation only.
    pub fn resolve_fault(&self, system: &VmSystem, vaddr: usize) -> Result<()> {
        let page = page_round_down(vaddr);
        let Some(entry) = self.table.lookup(page) else {
            return Err(VmError::SegFault);
        };
        let mut guard = entry.lock();

        if guard.resident {
            // Spurious fault: either a write to a read-only page, or the
            // page became resident while we waited on the entry lock.
            if !guard.flags.writable() {
                return Err(VmError::SegFault);
            }
            let frame = self.pagedir.lookup_frame(page).ok_or(VmError::SegFault)?;
            if !self.pagedir.install(page, frame, true) {
                return Err(VmError::SegFault);
            }
            return Ok(());
        }

        guard.set_evictable(false);
        let zero = matches!(guard.backing, PageBacking::Zero);
        let frame = match system
            .frame_table
            .allocate(system, zero, self.pid, &self.pagedir, &entry, page)
        {
            Ok(frame) => frame,
            Err(e) => {
                guard.set_evictable(true);
                return Err(e);
            }
        };

        match guard.backing.clone() {
            PageBacking::Zero => {}
            PageBacking::Anon => unreachable!("anonymous data cannot be absent from memory"),
            PageBacking::Swap(slot) => {
                // SAFETY: the frame was allocated for this entry, whose
                // lock we hold; nobody else touches it.
                system.swap.read_page(slot, unsafe { frame.bytes_mut() });
                // The slot stays reserved until install succeeds: if the
                // frame is released below it is still the only copy.
            }
            PageBacking::File(slice) => {
                // SAFETY: as above.
                let bytes = unsafe { frame.bytes_mut() };
                let read = {
                    let _fs = system.fs_lock.lock();
                    slice.file.read_at(&mut bytes[..slice.read_bytes], slice.offset)
                };
                if read != slice.read_bytes {
                    system.frame_table.release(frame);
                    guard.set_evictable(true);
                    return Err(VmError::SegFault);
                }
                bytes[slice.read_bytes..].fill(0);
            }
        }

        if !self.pagedir.install(page, frame, guard.flags.writable()) {
            system.frame_table.release(frame);
            guard.set_evictable(true);
            return Err(VmError::SegFault);
        }

        if let PageBacking::Swap(slot) = guard.backing {
            system.swap.free(slot);
            guard.backing = PageBacking::Anon;
        }
        guard.resident = true;
        guard.set_evictable(true);
        trace!("pid {} fault at {:#x} resolved", self.pid, page);
        Ok(())
    }

    /// Tear down the address space: write back dirty mmap pages, release
    /// every resident frame, and free every swap slot still referenced.
    ///
    /// Called exactly once, after the process's last thread has exited;
    /// it must not race with faults from this address space.
    pub fn destroy(&self, system: &VmSystem) {
        for (vaddr, entry) in self.table.take_all() {
            // The lock also waits out an eviction that has this very
            // page pinned for write-back.
            let mut guard = entry.lock();
            if guard.resident {
                if let PageBacking::File(slice) = &guard.backing {
                    if guard.flags.mmap() && self.pagedir.is_dirty(vaddr) {
                        if let Some(frame) = self.pagedir.lookup_frame(vaddr) {
                            // SAFETY: destroy is the only actor left in
                            // this address space.
                            let bytes = unsafe { frame.bytes() };
                            let _fs = system.fs_lock.lock();
                            let written =
                                slice.file.write_at(&bytes[..slice.read_bytes], slice.offset);
                            if written != slice.read_bytes {
                                panic!(
                                    "mmap write-back failed, page contents lost: {written} of {} bytes",
                                    slice.read_bytes
                                );
                            }
                        }
                    }
                }
                guard.resident = false;
                if let Some(frame) = self.pagedir.lookup_frame(vaddr) {
                    system.frame_table.release(frame);
                }
            } else if let PageBacking::Swap(slot) = guard.backing {
                system.swap.free(slot);
                guard.backing = PageBacking::Zero;
            }
        }
    }
}
