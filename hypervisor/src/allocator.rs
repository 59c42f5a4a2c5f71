//! Physical frame allocator backing guest memory.
//!
//! Guest RAM is handed out one 4 KiB frame at a time from a contiguous host
//! region. Every frame carries a reference count; the EPT mapping a frame into
//! a guest holds one reference, and the frame returns to the free list when the
//! last reference is dropped. All bookkeeping lives behind a single
//! `spin::Mutex`, so guests exiting on different CPUs can allocate concurrently.
//!
//! Host virtual addresses are derived through the kernel's direct map:
//! `kva = direct_map_base + pa`, for pool frames and for MMIO alike.

use {
    crate::global_const::PAGE_SIZE,
    alloc::vec::Vec,
    log::{debug, trace, warn},
    spin::Mutex,
};

/// A host physical frame handed out by a [`PhysicalMemory`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysFrame {
    pa: u64,
}

impl PhysFrame {
    /// The frame starting at host physical `pa` (page-aligned).
    pub fn from_start_address(pa: u64) -> Self {
        Self { pa }
    }

    /// Host physical address of the first byte of the frame.
    pub fn start_address(&self) -> u64 {
        self.pa
    }
}

/// Whether a freshly allocated frame must be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFlags {
    None,
    Zero,
}

/// The global physical-frame allocator as seen by the exit handlers.
///
/// Implementations must serialize concurrent callers; handlers for different
/// guests call into the same allocator from different CPUs.
pub trait PhysicalMemory: Sync {
    /// Takes one frame off the free list. The reference count of the returned frame is zero.
    fn page_alloc(&self, flags: AllocFlags) -> Option<PhysFrame>;

    /// Records one more owner of `frame`.
    fn page_incref(&self, frame: PhysFrame);

    /// Drops one owner of `frame`, freeing it when no owner remains.
    fn page_decref(&self, frame: PhysFrame);

    /// Host virtual address of an arbitrary host physical address.
    fn pa2kva(&self, pa: u64) -> u64;

    /// Host virtual address of a frame.
    fn page2kva(&self, frame: PhysFrame) -> u64 {
        self.pa2kva(frame.start_address())
    }
}

/// A reference-counted pool of 4 KiB frames over one contiguous physical range.
pub struct FramePool {
    base_pa: u64,
    frame_count: usize,
    direct_map_base: u64,
    inner: Mutex<FramePoolInner>,
}

struct FramePoolInner {
    free_list: Vec<usize>,
    refs: Vec<u32>,
    allocated: Vec<bool>,
}

impl FramePool {
    /// Creates a pool over `frame_count` frames starting at host physical `base_pa`.
    ///
    /// # Safety
    ///
    /// - `base_pa` must be page-aligned.
    /// - `direct_map_base + base_pa` must point to `frame_count * PAGE_SIZE` bytes of
    ///   writable memory owned by the pool for as long as it lives.
    pub unsafe fn new(base_pa: u64, frame_count: usize, direct_map_base: u64) -> Self {
        debug!("Frame pool at PA {:#x}, {} frames ({} KiB)", base_pa, frame_count, frame_count * PAGE_SIZE / 1024);

        // Pop from the back, so the lowest frame goes out first.
        let free_list = (0..frame_count).rev().collect();

        Self {
            base_pa,
            frame_count,
            direct_map_base,
            inner: Mutex::new(FramePoolInner {
                free_list,
                refs: alloc::vec![0; frame_count],
                allocated: alloc::vec![false; frame_count],
            }),
        }
    }

    /// Number of frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Current reference count of `frame`.
    pub fn refcount(&self, frame: PhysFrame) -> u32 {
        self.index_of(frame).map(|i| self.inner.lock().refs[i]).unwrap_or(0)
    }

    fn index_of(&self, frame: PhysFrame) -> Option<usize> {
        let offset = frame.pa.checked_sub(self.base_pa)?;
        let index = (offset / PAGE_SIZE as u64) as usize;
        (index < self.frame_count).then_some(index)
    }

    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame {
            pa: self.base_pa + (index * PAGE_SIZE) as u64,
        }
    }
}

impl PhysicalMemory for FramePool {
    fn page_alloc(&self, flags: AllocFlags) -> Option<PhysFrame> {
        let frame = {
            let mut inner = self.inner.lock();
            let index = inner.free_list.pop()?;
            inner.allocated[index] = true;
            self.frame_at(index)
        };

        if flags == AllocFlags::Zero {
            // The frame is off the free list, no one else can touch it.
            unsafe { core::ptr::write_bytes(self.page2kva(frame) as *mut u8, 0, PAGE_SIZE) };
        }

        trace!("Allocated frame {:#x}", frame.pa);
        Some(frame)
    }

    fn page_incref(&self, frame: PhysFrame) {
        match self.index_of(frame) {
            Some(index) => self.inner.lock().refs[index] += 1,
            None => warn!("page_incref on foreign frame {:#x}", frame.pa),
        }
    }

    fn page_decref(&self, frame: PhysFrame) {
        let Some(index) = self.index_of(frame) else {
            warn!("page_decref on foreign frame {:#x}", frame.pa);
            return;
        };

        let mut inner = self.inner.lock();
        if !inner.allocated[index] {
            warn!("page_decref on free frame {:#x}", frame.pa);
            return;
        }

        inner.refs[index] = inner.refs[index].saturating_sub(1);
        if inner.refs[index] == 0 {
            inner.allocated[index] = false;
            inner.free_list.push(index);
            trace!("Freed frame {:#x}", frame.pa);
        }
    }

    fn pa2kva(&self, pa: u64) -> u64 {
        self.direct_map_base.wrapping_add(pa)
    }
}
