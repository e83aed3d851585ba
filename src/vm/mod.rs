//! Virtual memory: lazy loading, demand paging, stack growth, and clock
//! eviction with swap. Everything a process touches through here is a
//! `Page` living in its `SupplementalPageTable`; the frame table underneath
//! is shared across all processes.

pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod spt;

pub use mmap::{MmapError, MmapTable};
pub use page::{Backing, Page, PageHandle, VmError};
pub use spt::SupplementalPageTable;

use crate::memory::frame_allocator::BumpFrameAllocator;
use crate::memory::paging::AddressSpace;
use x86_64::VirtAddr;

/// Conceptual top of user address space (`0x47480000`). User stacks grow
/// downward from here with a hard 1 MiB cap.
pub const USER_STACK: u64 = 0x4747_8000;
pub const STACK_LIMIT_BYTES: u64 = 1024 * 1024;
const PGSIZE: u64 = 4096;

pub fn init(allocator: &mut BumpFrameAllocator, pool_frames: usize) {
    let pool_start = allocator
        .carve_pool(pool_frames)
        .expect("not enough physical memory for the user frame pool");
    frame_table::init(allocator, pool_start, pool_frames);
    crate::log_info!(
        "VM: user frame pool initialized with {} frames ({} KiB)",
        pool_frames,
        pool_frames * 4
    );
}

fn page_floor(addr: u64) -> u64 {
    addr & !(PGSIZE - 1)
}

/// Handle a page fault. `fault_addr` is the CR2 value; `user` is whether
/// the faulting code ran in ring 3; `write` is bit 1 of the error code.
/// `saved_rsp` is the process's last known user stack pointer, used to
/// decide whether this looks like stack growth. Returns `true` if the
/// fault was resolved and the faulting instruction may be retried.
pub fn try_handle_fault(
    spt: &mut SupplementalPageTable,
    space: &AddressSpace,
    fault_addr: VirtAddr,
    user: bool,
    write: bool,
    saved_rsp: VirtAddr,
) -> bool {
    if user && fault_addr.as_u64() >= USER_STACK {
        return false;
    }

    if write && looks_like_stack_growth(fault_addr, saved_rsp) {
        return grow_stack(spt, space, fault_addr);
    }

    let page = match spt.find(fault_addr) {
        Some(p) => p,
        None => return false,
    };

    if page.lock().loaded {
        // Present but faulted again: nothing more this handler can offer
        // (e.g. a genuine write-protection violation on a read-only page).
        return false;
    }

    Page::claim(&page, space).is_ok()
}

fn looks_like_stack_growth(fault_addr: VirtAddr, saved_rsp: VirtAddr) -> bool {
    let fault = fault_addr.as_u64();
    let rsp_page = page_floor(saved_rsp.as_u64());
    let stack_limit = USER_STACK.saturating_sub(STACK_LIMIT_BYTES);

    fault < USER_STACK && fault >= stack_limit && fault >= rsp_page.saturating_sub(PGSIZE)
}

/// Allocate and claim ANON pages downward from the current stack bottom to
/// (and including) the page containing `fault_addr`. Only pages marked
/// `is_stack` count towards "the current stack bottom" — without that
/// filter, the much lower virtual addresses ELF load segments live at would
/// always win the scan and make every growth fault look like it's already
/// satisfied.
fn grow_stack(spt: &mut SupplementalPageTable, space: &AddressSpace, fault_addr: VirtAddr) -> bool {
    let target_page = page_floor(fault_addr.as_u64());

    let mut lowest_existing = USER_STACK;
    for (va, page) in spt.iter() {
        if page.lock().is_stack && va.as_u64() < lowest_existing {
            lowest_existing = va.as_u64();
        }
    }
    if lowest_existing <= target_page {
        // Already have a stack page there or below; let the caller re-check SPT.
        let page = match spt.find(fault_addr) {
            Some(p) => p,
            None => return false,
        };
        return Page::claim(&page, space).is_ok();
    }

    let mut va = lowest_existing - PGSIZE;
    loop {
        let page = Page::new_stack(VirtAddr::new(va), true, space.p4_phys);
        if !spt.insert(page.clone()) {
            return false;
        }
        if Page::claim(&page, space).is_err() {
            return false;
        }
        if va == target_page {
            break;
        }
        va -= PGSIZE;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_growth_window_accepts_address_just_below_rsp() {
        let rsp = VirtAddr::new(USER_STACK - PGSIZE);
        let fault = VirtAddr::new(USER_STACK - 2 * PGSIZE);
        assert!(looks_like_stack_growth(fault, rsp));
    }

    #[test]
    fn stack_growth_window_rejects_address_past_the_cap() {
        let rsp = VirtAddr::new(USER_STACK - PGSIZE);
        let fault = VirtAddr::new(USER_STACK - STACK_LIMIT_BYTES - 2 * PGSIZE);
        assert!(!looks_like_stack_growth(fault, rsp));
    }

    #[test]
    fn stack_growth_window_rejects_address_far_below_rsp() {
        let rsp = VirtAddr::new(USER_STACK - PGSIZE);
        let fault = VirtAddr::new(USER_STACK - 64 * PGSIZE);
        assert!(!looks_like_stack_growth(fault, rsp));
    }
}

