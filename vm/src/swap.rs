//! Swap store: page-sized slots over a sector block device.
//!
//! Slot occupancy is a free-set bitmap guarded by one lock; the lock is
//! held only for bitmap updates, never across device I/O, so reserved
//! slots can be read and written concurrently by different faulting
//! threads. A device error during swap I/O panics: swap is the last copy
//! of an evicted page's contents, there is nothing safe to fall back to.

use crate::error::{Result, VmError};
use crate::sync::TicketMutex;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::error::Error;
use core::fmt::{Debug, Display, Formatter};
use log::warn;
use nephron_shared::mem::PAGE_FRAME_SIZE;
use nephron_shared::sizes::SECTOR_SIZE;

/// Sectors making up one page-sized swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE;

/// Identifies one page-sized slot in the swap store. Referenced by at most
/// one `OnSwap` page entry at a time; the store's bitmap is the sole
/// authority on slot lifetime.
pub type SlotId = u32;

/// Error type for block device operations.
pub enum BlockError {
    /// The sector is past the end of the device.
    SectorOutOfBounds,
    /// Error reading from the device.
    ReadError,
    /// Error writing to the device.
    WriteError,
}

impl Debug for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            BlockError::SectorOutOfBounds => write!(f, "SectorOutOfBounds"),
            BlockError::ReadError => write!(f, "ReadError"),
            BlockError::WriteError => write!(f, "WriteError"),
        }
    }
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Error for BlockError {}

/// A fixed-size device of 512-byte sectors.
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> usize;

    /// Read one sector into `buf` (`SECTOR_SIZE` bytes).
    fn read_sector(&self, sector: usize, buf: &mut [u8]) -> core::result::Result<(), BlockError>;

    /// Write one sector from `buf` (`SECTOR_SIZE` bytes).
    fn write_sector(&self, sector: usize, buf: &[u8]) -> core::result::Result<(), BlockError>;
}

/// Memory-backed block device.
pub struct RamDisk {
    data: TicketMutex<Box<[u8]>>,
    sectors: usize,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            data: TicketMutex::new(vec![0; sectors * SECTOR_SIZE].into_boxed_slice()),
            sectors,
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> usize {
        self.sectors
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8]) -> core::result::Result<(), BlockError> {
        if sector >= self.sectors {
            return Err(BlockError::SectorOutOfBounds);
        }
        let data = self.data.lock();
        buf.copy_from_slice(&data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: usize, buf: &[u8]) -> core::result::Result<(), BlockError> {
        if sector >= self.sectors {
            return Err(BlockError::SectorOutOfBounds);
        }
        let mut data = self.data.lock();
        data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

/// Free-slot bitmap with a queue of non-full groups.
///
/// A set bit means the slot is free. `allocate` and `free` are O(1):
/// the queue remembers which 64-slot groups still have free bits.
struct SlotMap {
    bitmap: Vec<u64>,
    queue: Vec<u32>,
}

impl SlotMap {
    fn new_all_free(count: u32) -> Self {
        let group_count = count.div_ceil(64);
        let mut bitmap = vec![u64::MAX; group_count as usize];
        let tail = count % 64;
        if tail != 0 {
            // Bits past `count` must never be handed out.
            bitmap[group_count as usize - 1] = (1u64 << tail) - 1;
        }
        Self {
            bitmap,
            queue: (0..group_count).collect(),
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        let group_index = self.queue.pop()?;
        let group = &mut self.bitmap[group_index as usize];
        debug_assert_ne!(*group, 0, "SlotMap consistency error");
        let index_in_group = group.trailing_zeros();
        *group &= !(1 << index_in_group);
        if *group != 0 {
            self.queue.push(group_index);
        }
        Some(group_index * 64 + index_in_group)
    }

    fn free(&mut self, index: u32) {
        let group_index = index / 64;
        let index_in_group = index % 64;
        let group = &mut self.bitmap[group_index as usize];
        let add = *group == 0;
        debug_assert!(
            (*group & (1 << index_in_group)) == 0,
            "SlotMap::free called on already free slot"
        );
        *group |= 1 << index_in_group;
        if add {
            self.queue.push(group_index);
        }
    }

    fn is_allocated(&self, index: u32) -> bool {
        (self.bitmap[(index / 64) as usize] & (1 << (index % 64))) == 0
    }
}

struct SlotState {
    map: SlotMap,
    used: usize,
}

/// Page-granular store for evicted anonymous pages.
pub struct SwapStore {
    device: Box<dyn BlockDevice>,
    slots: TicketMutex<SlotState>,
    slot_count: usize,
}

impl SwapStore {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slot_count = device.sector_count() / SECTORS_PER_PAGE;
        Self {
            device,
            slots: TicketMutex::new(SlotState {
                map: SlotMap::new_all_free(u32::try_from(slot_count).expect("swap too large")),
                used: 0,
            }),
            slot_count,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().used
    }

    /// Reserve a slot and write a page's contents into it.
    ///
    /// Fails with `OutOfMemory` when every slot is referenced; eviction
    /// cannot proceed and the faulting operation is abandoned.
    pub fn write_page(&self, bytes: &[u8]) -> Result<SlotId> {
        assert_eq!(bytes.len(), PAGE_FRAME_SIZE);
        let slot = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.map.allocate() else {
                warn!("swap store exhausted ({} slots in use)", slots.used);
                return Err(VmError::OutOfMemory);
            };
            slots.used += 1;
            slot
        };
        // The slot is reserved; device I/O happens outside the bitmap lock.
        let base = slot as usize * SECTORS_PER_PAGE;
        for (i, chunk) in bytes.chunks_exact(SECTOR_SIZE).enumerate() {
            if let Err(e) = self.device.write_sector(base + i, chunk) {
                panic!("swap write-back failed, page contents lost: {e}");
            }
        }
        Ok(slot)
    }

    /// Read a reserved slot back into `buf` (one page).
    pub fn read_page(&self, slot: SlotId, buf: &mut [u8]) {
        assert_eq!(buf.len(), PAGE_FRAME_SIZE);
        debug_assert!(
            self.slots.lock().map.is_allocated(slot),
            "read of unreserved swap slot {slot}"
        );
        let base = slot as usize * SECTORS_PER_PAGE;
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            if let Err(e) = self.device.read_sector(base + i, chunk) {
                panic!("swap read failed, page contents lost: {e}");
            }
        }
    }

    /// Release a slot. The id may be handed out again afterwards.
    pub fn free(&self, slot: SlotId) {
        let mut slots = self.slots.lock();
        slots.map.free(slot);
        slots.used -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(slots: usize) -> SwapStore {
        SwapStore::new(Box::new(RamDisk::new(slots * SECTORS_PER_PAGE)))
    }

    #[test]
    fn round_trip() {
        let swap = store(2);
        let mut page = [0u8; PAGE_FRAME_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let slot = swap.write_page(&page).expect("slot");
        let mut back = [0u8; PAGE_FRAME_SIZE];
        swap.read_page(slot, &mut back);
        assert_eq!(page[..], back[..]);
    }

    #[test]
    fn distinct_slots_while_reserved() {
        let swap = store(3);
        let page = [7u8; PAGE_FRAME_SIZE];
        let a = swap.write_page(&page).expect("slot");
        let b = swap.write_page(&page).expect("slot");
        let c = swap.write_page(&page).expect("slot");
        assert!(a != b && b != c && a != c);
        assert_eq!(swap.slots_in_use(), 3);
    }

    #[test]
    fn exhaustion_then_reuse() {
        let swap = store(1);
        let page = [1u8; PAGE_FRAME_SIZE];
        let slot = swap.write_page(&page).expect("slot");
        assert_eq!(swap.write_page(&page), Err(VmError::OutOfMemory));
        swap.free(slot);
        let again = swap.write_page(&page).expect("slot after free");
        assert_eq!(again, slot);
    }

    #[test]
    fn slot_map_tail_group() {
        let mut map = SlotMap::new_all_free(65);
        let mut seen = std::collections::BTreeSet::new();
        while let Some(slot) = map.allocate() {
            assert!(slot < 65);
            assert!(seen.insert(slot));
        }
        assert_eq!(seen.len(), 65);
        map.free(64);
        assert_eq!(map.allocate(), Some(64));
    }

    #[test]
    fn ram_disk_bounds() {
        let disk = RamDisk::new(1);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(disk.read_sector(0, &mut buf).is_ok());
        assert!(disk.read_sector(1, &mut buf).is_err());
    }
}
