use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// A simple bump allocator for physical memory frames used for kernel-side
/// structures (page tables, the heap). Never reclaims frames — acceptable
/// for the handful of long-lived allocations it serves; the reclaimable
/// user-page pool lives in `memory::frame`.
pub struct BumpFrameAllocator {
    next_free_frame: PhysFrame,
    current_limit: PhysFrame,
}

impl BumpFrameAllocator {
    /// Create a new Empty BumpFrameAllocator.
    pub fn new() -> Self {
        BumpFrameAllocator {
            next_free_frame: PhysFrame::containing_address(PhysAddr::new(0)),
            current_limit: PhysFrame::containing_address(PhysAddr::new(0)),
        }
    }

    /// Initialize the allocator with a start and end physical address.
    /// In a fully featured OS, this parses the multiboot memory map.
    pub unsafe fn init(&mut self, start: PhysAddr, end: PhysAddr) {
        self.next_free_frame = PhysFrame::containing_address(start);
        self.current_limit = PhysFrame::containing_address(end);
    }

    /// Carve a contiguous run of `count` frames off the top of the region,
    /// shrinking the bump allocator's limit. Used once, at boot, to hand a
    /// fixed range to the reclaimable user-frame pool (`memory::frame`).
    pub fn carve_pool(&mut self, count: usize) -> Option<PhysFrame> {
        let mut end = self.current_limit;
        for _ in 0..count {
            if end <= self.next_free_frame {
                return None;
            }
            end -= 1;
        }
        let pool_start = end + 1u64;
        self.current_limit = end;
        Some(pool_start)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BumpFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.next_free_frame <= self.current_limit {
            let frame = self.next_free_frame;
            self.next_free_frame += 1;
            Some(frame)
        } else {
            None
        }
    }
}

impl FrameDeallocator<Size4KiB> for BumpFrameAllocator {
    /// No-op: the bump allocator never reclaims. Present only so callers
    /// generic over `FrameDeallocator` compile; nothing actually frees here.
    unsafe fn deallocate_frame(&mut self, _frame: PhysFrame) {}
}
