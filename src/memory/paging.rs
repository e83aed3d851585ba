//! The page-map-level-4 primitive. Everyone outside this module treats an
//! [`AddressSpace`] as opaque: `map`, `unmap`, `translate`,
//! `is_accessed`/`is_dirty`. Physical memory is identity-mapped into the
//! kernel's virtual address space (the bootloader maps the first chunk of
//! RAM 1:1 at boot), so a physical address can always be dereferenced
//! directly with no extra offset bookkeeping.

use x86_64::{
    structures::paging::{
        page_table::FrameError, FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page,
        PageTable, PageTableFlags, PhysFrame, Size4KiB, Translate,
    },
    PhysAddr, VirtAddr,
};

const PHYS_OFFSET: u64 = 0;

pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + PHYS_OFFSET)
}

/// Build the kernel's initial mapper over the currently-active CR3 table.
pub unsafe fn init_paging(physical_memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    let level_4_table = active_level_4_table(physical_memory_offset);
    OffsetPageTable::new(level_4_table, physical_memory_offset)
}

unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    use x86_64::registers::control::Cr3;

    let (level_4_table_frame, _) = Cr3::read();
    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    &mut *page_table_ptr
}

fn table_at(phys: PhysAddr) -> &'static mut PageTable {
    let virt = phys_to_virt(phys);
    unsafe { &mut *(virt.as_mut_ptr()) }
}

/// A process's address space root, identified by the physical address of
/// its level-4 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub p4_phys: PhysAddr,
}

impl AddressSpace {
    /// Allocate a fresh level-4 table, copying the kernel's higher-half
    /// entries (indices 256..512) from the currently-active table so
    /// kernel code/heap/VGA stay mapped after switching CR3, and zeroing
    /// the user half.
    pub fn new(frame_allocator: &mut impl FrameAllocator<Size4KiB>) -> Option<Self> {
        let frame = frame_allocator.allocate_frame()?;
        let new_table = table_at(frame.start_address());
        new_table.zero();

        let current_phys = {
            use x86_64::registers::control::Cr3;
            Cr3::read().0.start_address()
        };
        let current_table = table_at(current_phys);
        for i in 256..512 {
            new_table[i] = current_table[i].clone();
        }

        Some(AddressSpace { p4_phys: frame.start_address() })
    }

    pub fn activate(&self) {
        unsafe {
            core::arch::asm!("mov cr3, {0}", in(reg) self.p4_phys.as_u64());
        }
    }

    fn mapper(&self) -> OffsetPageTable<'static> {
        let table = table_at(self.p4_phys);
        unsafe { OffsetPageTable::new(table, VirtAddr::new(PHYS_OFFSET)) }
    }

    /// Map `va` to `pa` with the given writability. Returns false on
    /// allocation failure or if a mapping already exists at `va`.
    pub fn map(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        writable: bool,
        frame_allocator: &mut impl FrameAllocator<Size4KiB>,
    ) -> bool {
        let mut mapper = self.mapper();
        let page = Page::<Size4KiB>::containing_address(va);
        let frame = PhysFrame::containing_address(pa);
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        unsafe {
            match mapper.map_to(page, frame, flags, frame_allocator) {
                Ok(flush) => {
                    flush.flush();
                    true
                }
                Err(_) => false,
            }
        }
    }

    /// Remove the mapping at `va`. Returns the physical frame that was
    /// backing it, if any — the caller owns freeing it back to the pool.
    pub fn unmap(&self, va: VirtAddr) -> Option<PhysAddr> {
        let mut mapper = self.mapper();
        let page = Page::<Size4KiB>::containing_address(va);
        match mapper.unmap(page) {
            Ok((frame, flush)) => {
                flush.flush();
                Some(frame.start_address())
            }
            Err(_) => None,
        }
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.mapper().translate_addr(va)
    }

    fn entry_flags(&self, va: VirtAddr) -> Option<PageTableFlags> {
        let addr = va.as_u64();
        let indices = [
            (addr >> 39) & 0x1ff,
            (addr >> 30) & 0x1ff,
            (addr >> 21) & 0x1ff,
            (addr >> 12) & 0x1ff,
        ];
        let mut table = table_at(self.p4_phys);
        for (depth, idx) in indices.iter().enumerate() {
            let entry = &table[*idx as usize];
            if depth == 3 {
                return Some(entry.flags());
            }
            match entry.frame() {
                Ok(frame) => table = table_at(frame.start_address()),
                Err(FrameError::FrameNotPresent) => return None,
                Err(FrameError::HugeFrame) => return Some(entry.flags()),
            }
        }
        None
    }

    fn set_flag(&self, va: VirtAddr, flag: PageTableFlags, value: bool) {
        let addr = va.as_u64();
        let indices = [
            (addr >> 39) & 0x1ff,
            (addr >> 30) & 0x1ff,
            (addr >> 21) & 0x1ff,
            (addr >> 12) & 0x1ff,
        ];
        let mut table = table_at(self.p4_phys);
        for (depth, idx) in indices.iter().enumerate() {
            if depth == 3 {
                let entry = &mut table[*idx as usize];
                let mut flags = entry.flags();
                flags.set(flag, value);
                if let Ok(frame) = entry.frame() {
                    unsafe {
                        entry.set_frame(frame, flags);
                    }
                }
                return;
            }
            match table[*idx as usize].frame() {
                Ok(frame) => table = table_at(frame.start_address()),
                Err(FrameError::FrameNotPresent) => return,
                Err(FrameError::HugeFrame) => return,
            }
        }
    }

    pub fn is_accessed(&self, va: VirtAddr) -> bool {
        self.entry_flags(va)
            .map(|f| f.contains(PageTableFlags::ACCESSED))
            .unwrap_or(false)
    }

    pub fn clear_accessed(&self, va: VirtAddr) {
        self.set_flag(va, PageTableFlags::ACCESSED, false);
    }

    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.entry_flags(va)
            .map(|f| f.contains(PageTableFlags::DIRTY))
            .unwrap_or(false)
    }

    pub fn clear_dirty(&self, va: VirtAddr) {
        self.set_flag(va, PageTableFlags::DIRTY, false);
    }

    /// Tear down the level-4 table itself. The caller must already have
    /// unmapped (and freed) every user page; this only reclaims the
    /// table frames of the user half.
    pub fn destroy(&self, frame_allocator: &mut impl FrameDeallocator<Size4KiB>) {
        let p4 = table_at(self.p4_phys);
        for i in 0..256 {
            if p4[i].is_unused() {
                continue;
            }
            if let Ok(p3_frame) = p4[i].frame() {
                free_table_tree(p3_frame, 3, frame_allocator);
            }
        }
        unsafe {
            frame_allocator.deallocate_frame(PhysFrame::containing_address(self.p4_phys));
        }
    }
}

fn free_table_tree(
    frame: PhysFrame,
    level: u8,
    frame_allocator: &mut impl FrameDeallocator<Size4KiB>,
) {
    if level > 1 {
        let table = table_at(frame.start_address());
        for entry in table.iter() {
            if entry.is_unused() {
                continue;
            }
            if let Ok(child) = entry.frame() {
                free_table_tree(child, level - 1, frame_allocator);
            }
        }
    }
    unsafe {
        frame_allocator.deallocate_frame(frame);
    }
}
