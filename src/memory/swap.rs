//! Swap slots on the dedicated swap disk. A slot is exactly one page
//! (`PGSIZE` = 4096 bytes = 8 sectors); `SwapTable` is a bitmap of free/used
//! slots, same shape as Pintos's `bitmap` over `swap_table`.

use crate::drivers::ata::{pio::AtaError, SWAP_DISK};
use alloc::vec::Vec;
use spin::Mutex;

pub const SECTORS_PER_SLOT: u32 = 8; // 4096 / 512
pub const PGSIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    NoFreeSlots,
    DiskError,
    NotAllocated,
}

impl From<AtaError> for SwapError {
    fn from(_: AtaError) -> Self {
        SwapError::DiskError
    }
}

pub struct SwapTable {
    used: Vec<bool>,
}

impl SwapTable {
    pub fn new(slot_count: usize) -> Self {
        SwapTable { used: alloc::vec![false; slot_count] }
    }

    fn alloc_slot(&mut self) -> Result<usize, SwapError> {
        for (i, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(i);
            }
        }
        Err(SwapError::NoFreeSlots)
    }

    fn free_slot(&mut self, slot: usize) -> Result<(), SwapError> {
        match self.used.get_mut(slot) {
            Some(used) => {
                *used = false;
                Ok(())
            }
            None => Err(SwapError::NotAllocated),
        }
    }
}

lazy_static::lazy_static! {
    pub static ref SWAP_TABLE: Mutex<SwapTable> = Mutex::new(SwapTable::new(0));
}

/// Reinitialize the global swap table with the given slot count, computed
/// at boot from the swap disk's reported size.
pub fn init(slot_count: usize) {
    *SWAP_TABLE.lock() = SwapTable::new(slot_count);
}

/// Write a full page out to a freshly-allocated swap slot, returning its
/// index. The page content is read from `page` (exactly `PGSIZE` bytes).
pub fn swap_out(page: &[u8; PGSIZE]) -> Result<usize, SwapError> {
    let slot = SWAP_TABLE.lock().alloc_slot()?;
    let disk = SWAP_DISK.lock();
    let base_lba = slot as u32 * SECTORS_PER_SLOT;
    for sector in 0..SECTORS_PER_SLOT {
        let mut buf = [0u8; 512];
        let offset = sector as usize * 512;
        buf.copy_from_slice(&page[offset..offset + 512]);
        disk.write_sector(base_lba + sector, &buf)
            .map_err(SwapError::from)?;
    }
    Ok(slot)
}

/// Read a page back from `slot` into `page` and free the slot.
pub fn swap_in(slot: usize, page: &mut [u8; PGSIZE]) -> Result<(), SwapError> {
    let disk = SWAP_DISK.lock();
    let base_lba = slot as u32 * SECTORS_PER_SLOT;
    for sector in 0..SECTORS_PER_SLOT {
        let mut buf = [0u8; 512];
        disk.read_sector(base_lba + sector, &mut buf)
            .map_err(SwapError::from)?;
        let offset = sector as usize * 512;
        page[offset..offset + 512].copy_from_slice(&buf);
    }
    drop(disk);
    SWAP_TABLE.lock().free_slot(slot)
}

/// Release a slot without reading it back (used when a page is discarded
/// rather than faulted back in, e.g. process exit).
pub fn discard(slot: usize) -> Result<(), SwapError> {
    SWAP_TABLE.lock().free_slot(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_free_slot_then_reuses_after_free() {
        let mut table = SwapTable::new(4);
        let a = table.alloc_slot().unwrap();
        let b = table.alloc_slot().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        table.free_slot(a).unwrap();
        let c = table.alloc_slot().unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn exhausted_table_errors() {
        let mut table = SwapTable::new(1);
        table.alloc_slot().unwrap();
        assert_eq!(table.alloc_slot(), Err(SwapError::NoFreeSlots));
    }

    #[test]
    fn freeing_unallocated_slot_errors() {
        let mut table = SwapTable::new(2);
        assert_eq!(table.free_slot(1), Err(SwapError::NotAllocated));
    }

    #[test]
    fn freeing_out_of_range_slot_errors() {
        let mut table = SwapTable::new(2);
        assert_eq!(table.free_slot(5), Err(SwapError::NotAllocated));
    }
}
