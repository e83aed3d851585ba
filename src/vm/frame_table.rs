//! The reclaimable user-frame pool and clock (second-chance) eviction.
//!
//! Every frame the pool hands out is tracked alongside the `PageHandle`
//! currently occupying it. When the pool is exhausted, `alloc_frame` walks
//! the table starting at `clock_hand`: a frame whose owning page has its
//! hardware accessed bit clear is evicted; otherwise the bit is cleared and
//! the hand advances. This is the textbook clock algorithm.

use super::page::{PageHandle, VmError};
use crate::memory::frame_allocator::BumpFrameAllocator;
use crate::memory::paging::AddressSpace;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

struct FrameEntry {
    phys: PhysAddr,
    owner: Option<PageHandle>,
}

pub struct FrameTable {
    entries: Vec<FrameEntry>,
    clock_hand: usize,
}

impl FrameTable {
    fn new() -> Self {
        FrameTable { entries: Vec::new(), clock_hand: 0 }
    }

    fn populate(&mut self, allocator: &mut BumpFrameAllocator, pool_start: PhysFrame, count: usize) {
        let mut frame = pool_start;
        for _ in 0..count {
            self.entries.push(FrameEntry { phys: frame.start_address(), owner: None });
            frame += 1;
        }
        let _ = allocator; // frames are handed over wholesale; bump allocator plays no further part
    }

    fn find_free(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.owner.is_none())
    }

    /// Run one pass of the clock algorithm, evicting exactly one frame and
    /// returning its index. Requires that every entry currently has an
    /// owner (the table is full).
    fn evict_one(&mut self) -> Result<usize, VmError> {
        let n = self.entries.len();
        if n == 0 {
            return Err(VmError::OutOfFrames);
        }
        loop {
            let idx = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % n;

            let owner = self.entries[idx].owner.clone().expect("full table has an owner");
            let (va, p4) = {
                let page = owner.lock();
                (page.va, page.p4)
            };
            let space = AddressSpace { p4_phys: p4 };

            if space.is_accessed(va) {
                space.clear_accessed(va);
                continue;
            }

            let mut page = owner.lock();
            page.evict(&space).map_err(|_| VmError::SwapFailed)?;
            drop(page);
            self.entries[idx].owner = None;
            return Ok(idx);
        }
    }
}

lazy_static::lazy_static! {
    static ref FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable::new());
}

/// Hand the frame table a contiguous physical range to manage. Called once
/// at boot after the bump allocator has carved off the pool.
pub fn init(allocator: &mut BumpFrameAllocator, pool_start: PhysFrame, count: usize) {
    FRAME_TABLE.lock().populate(allocator, pool_start, count);
}

pub fn total_frames() -> usize {
    FRAME_TABLE.lock().entries.len()
}

pub fn free_frames() -> usize {
    FRAME_TABLE.lock().entries.iter().filter(|e| e.owner.is_none()).count()
}

/// Allocate a frame for `owner`, evicting a victim via the clock algorithm
/// if the pool is exhausted.
pub fn alloc_frame(owner: PageHandle) -> Result<PhysAddr, VmError> {
    let mut table = FRAME_TABLE.lock();
    let idx = match table.find_free() {
        Some(idx) => idx,
        None => table.evict_one()?,
    };
    table.entries[idx].owner = Some(owner);
    Ok(table.entries[idx].phys)
}

/// Release the frame backing `owner` back to the free pool without
/// persisting its content (used on process exit / explicit unmap, where the
/// page's data no longer matters).
pub fn free_frame_for(owner: &PageHandle) {
    let mut table = FRAME_TABLE.lock();
    for entry in table.entries.iter_mut() {
        if let Some(o) = &entry.owner {
            if alloc::sync::Arc::ptr_eq(o, owner) {
                entry.owner = None;
                return;
            }
        }
    }
}
