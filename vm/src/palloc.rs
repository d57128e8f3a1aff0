//! Physical page allocation.
//!
//! [`PageAllocator`] is the seam to the host's physical allocator; the
//! frame table only ever asks it for single page frames. [`FramePool`] is
//! a self-contained implementation over a fixed slab: a core map of
//! per-frame bitfield entries scanned next-fit, the shape used for user
//! pools in teaching kernels.

use crate::sync::TicketMutex;
use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use alloc::boxed::Box;
use alloc::vec;
use bitbybit::bitfield;
use core::fmt;
use core::ptr::{self, NonNull};
use nephron_shared::mem::PAGE_FRAME_SIZE;

/// Opaque handle to one physical page frame.
///
/// The pointee is page-aligned and `PAGE_FRAME_SIZE` bytes long. The
/// handle is plain identity; whoever holds it is responsible for knowing
/// whether the frame is currently allocated.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FramePtr(NonNull<u8>);

// Frame contents are only touched through the unsafe accessors below,
// whose callers must hold the frame exclusively.
unsafe impl Send for FramePtr {}
unsafe impl Sync for FramePtr {}

impl FramePtr {
    /// # Safety
    ///
    /// `ptr` must be page-aligned and point to `PAGE_FRAME_SIZE`
    /// addressable bytes.
    pub const unsafe fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// View the frame's contents.
    ///
    /// # Safety
    ///
    /// The caller must hold the frame (allocated, and either pinned in the
    /// frame table or not yet inserted) and ensure no concurrent writer.
    pub unsafe fn bytes<'a>(self) -> &'a [u8] {
        core::slice::from_raw_parts(self.0.as_ptr(), PAGE_FRAME_SIZE)
    }

    /// Mutable view of the frame's contents.
    ///
    /// # Safety
    ///
    /// As [`FramePtr::bytes`], and additionally no concurrent reader.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut<'a>(self) -> &'a mut [u8] {
        core::slice::from_raw_parts_mut(self.0.as_ptr(), PAGE_FRAME_SIZE)
    }

    /// Zero the frame.
    ///
    /// # Safety
    ///
    /// As [`FramePtr::bytes_mut`].
    pub unsafe fn zero(self) {
        ptr::write_bytes(self.0.as_ptr(), 0, PAGE_FRAME_SIZE);
    }
}

impl fmt::Debug for FramePtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FramePtr({:#x})", self.addr())
    }
}

/// The host's physical page allocator.
///
/// `alloc_page(true)` must return a zero-filled frame; `alloc_page(false)`
/// may return one with arbitrary contents (the caller overwrites it
/// fully). Exhaustion is `None`, not an error: the frame table answers it
/// with eviction.
pub trait PageAllocator: Send + Sync {
    fn alloc_page(&self, zero: bool) -> Option<FramePtr>;

    /// Return a frame obtained from [`PageAllocator::alloc_page`].
    fn free_page(&self, frame: FramePtr);
}

impl<A: PageAllocator + ?Sized> PageAllocator for alloc::sync::Arc<A> {
    fn alloc_page(&self, zero: bool) -> Option<FramePtr> {
        (**self).alloc_page(zero)
    }

    fn free_page(&self, frame: FramePtr) {
        (**self).free_page(frame)
    }
}

#[bitfield(u8, default = 0)]
struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    /// Frame is known to be all zeroes, so a zeroed allocation can skip
    /// the memset. True for every frame of a fresh pool.
    #[bit(1, rw)]
    zeroed: bool,
}

struct PoolInner {
    core_map: Box<[CoreMapEntry]>,
    position: usize,
    frames_allocated: usize,
}

impl PoolInner {
    /// Next-fit: scan circularly from `position`, wrapping at most once.
    fn place(&mut self) -> Option<usize> {
        let total = self.core_map.len();
        for step in 0..total {
            let index = (self.position + step) % total;
            if !self.core_map[index].allocated() {
                self.position = (index + 1) % total;
                return Some(index);
            }
        }
        None
    }
}

/// A fixed pool of page frames backed by one page-aligned slab.
pub struct FramePool {
    base: NonNull<u8>,
    layout: Layout,
    inner: TicketMutex<PoolInner>,
}

// The slab is only reachable through FramePtrs handed out under the core
// map lock.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Allocate a pool of `frames` page frames.
    ///
    /// # Panics
    ///
    /// Panics if `frames` is zero or the slab allocation fails.
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "empty frame pool");
        let layout = Layout::from_size_align(frames * PAGE_FRAME_SIZE, PAGE_FRAME_SIZE)
            .expect("frame pool layout overflow");
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout);
        };
        Self {
            base,
            layout,
            inner: TicketMutex::new(PoolInner {
                core_map: vec![CoreMapEntry::default().with_zeroed(true); frames]
                    .into_boxed_slice(),
                position: 0,
                frames_allocated: 0,
            }),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.layout.size() / PAGE_FRAME_SIZE
    }

    pub fn frames_allocated(&self) -> usize {
        self.inner.lock().frames_allocated
    }

    fn frame_at(&self, index: usize) -> FramePtr {
        // SAFETY: index came from the core map, so the page is inside the
        // slab and inherits its alignment.
        unsafe {
            FramePtr::new(NonNull::new_unchecked(
                self.base.as_ptr().add(index * PAGE_FRAME_SIZE),
            ))
        }
    }
}

impl PageAllocator for FramePool {
    fn alloc_page(&self, zero: bool) -> Option<FramePtr> {
        let mut inner = self.inner.lock();
        let index = inner.place()?;
        let entry = inner.core_map[index];
        assert!(!entry.allocated());
        inner.core_map[index] = entry.with_allocated(true).with_zeroed(false);
        inner.frames_allocated += 1;
        let was_zeroed = entry.zeroed();
        drop(inner);

        let frame = self.frame_at(index);
        if zero && !was_zeroed {
            // SAFETY: the frame was just marked allocated; we are its only
            // holder until it is returned.
            unsafe { frame.zero() };
        }
        Some(frame)
    }

    fn free_page(&self, frame: FramePtr) {
        let offset = frame.addr() - self.base.as_ptr() as usize;
        assert!(
            offset % PAGE_FRAME_SIZE == 0 && offset < self.layout.size(),
            "free_page of pointer not from this pool"
        );
        let index = offset / PAGE_FRAME_SIZE;
        let mut inner = self.inner.lock();
        assert!(inner.core_map[index].allocated(), "double free of frame");
        inner.core_map[index] = inner.core_map[index]
            .with_allocated(false)
            .with_zeroed(false);
        inner.frames_allocated -= 1;
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        // SAFETY: base/layout came from alloc_zeroed in new.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_reuse() {
        let pool = FramePool::new(2);
        let a = pool.alloc_page(false).expect("first frame");
        let b = pool.alloc_page(false).expect("second frame");
        assert_ne!(a, b);
        assert!(pool.alloc_page(false).is_none());
        pool.free_page(a);
        let c = pool.alloc_page(false).expect("freed frame reusable");
        assert_eq!(c, a);
        assert_eq!(pool.frames_allocated(), 2);
    }

    #[test]
    fn zeroed_allocation() {
        let pool = FramePool::new(1);
        let frame = pool.alloc_page(false).expect("frame");
        unsafe { frame.bytes_mut().fill(0xAB) };
        pool.free_page(frame);
        let frame = pool.alloc_page(true).expect("frame");
        assert!(unsafe { frame.bytes() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn fresh_pool_frames_are_zero() {
        let pool = FramePool::new(1);
        let frame = pool.alloc_page(true).expect("frame");
        assert!(unsafe { frame.bytes() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn next_fit_advances() {
        let pool = FramePool::new(3);
        let a = pool.alloc_page(false).expect("frame");
        pool.free_page(a);
        // Next-fit resumes past the freed slot rather than restarting.
        let b = pool.alloc_page(false).expect("frame");
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pool = FramePool::new(1);
        let frame = pool.alloc_page(false).expect("frame");
        pool.free_page(frame);
        pool.free_page(frame);
    }
}
