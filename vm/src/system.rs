//! Process-wide VM state.
//!
//! The frame table and swap store are singletons shared by every address
//! space; the hosting kernel builds one [`VmSystem`] at boot and passes it
//! by reference into fault resolution and teardown. Tests build isolated
//! instances instead of sharing a global.

use crate::frame::FrameTable;
use crate::palloc::PageAllocator;
use crate::swap::{BlockDevice, SwapStore};
use crate::sync::TicketMutex;
use alloc::boxed::Box;

pub struct VmSystem {
    pub frame_table: FrameTable,
    pub swap: SwapStore,
    /// Filesystem-wide lock, taken around every `BackingFile` call and
    /// never held across a swap operation.
    pub fs_lock: TicketMutex<()>,
}

impl VmSystem {
    pub fn new(palloc: Box<dyn PageAllocator>, swap_device: Box<dyn BlockDevice>) -> Self {
        Self {
            frame_table: FrameTable::new(palloc),
            swap: SwapStore::new(swap_device),
            fs_lock: TicketMutex::new(()),
        }
    }
}
