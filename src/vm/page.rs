//! A single supplemental-page-table entry. Tracks how to produce the page's
//! content (`Backing`) and whether it currently has a physical frame behind
//! it. Unloaded pages are the "UNINIT" case from the reference design;
//! `loaded` goes true the first time `claim` runs.

use crate::fs::VFS;
use crate::memory::paging::AddressSpace;
use crate::memory::swap::{self, PGSIZE};
use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Zero-filled on first touch; swapped to the disk-backed swap slots
    /// under memory pressure.
    Anon,
    /// Backed by a VFS file. `read_bytes` come from `path` at `offset`;
    /// the remaining `zero_bytes` of the page are zero-filled. Used for
    /// ELF segments and mmap'd regions.
    File { path: String, offset: usize, read_bytes: usize, zero_bytes: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfFrames,
    SwapFailed,
    FileReadFailed,
    NotPresent,
    AlreadyMapped,
}

pub struct Page {
    pub va: VirtAddr,
    pub writable: bool,
    pub backing: Backing,
    pub loaded: bool,
    pub frame: Option<PhysAddr>,
    pub swap_slot: Option<usize>,
    pub p4: PhysAddr,
    /// True for the writable portion of an mmap region: dirty file-backed
    /// pages get written back to the VFS instead of discarded on eviction.
    pub mmap_writeback: bool,
    /// True for a `Backing::File` page created by `mmap`, as opposed to one
    /// created by the ELF loader. Both use the same backing representation;
    /// this is what lets `fork` tell them apart, since mmap'd regions are
    /// not inherited by a child but ELF segments are.
    pub from_mmap: bool,
    /// True for a page claimed as part of a process's growable stack
    /// region, whether from the initial allocation or a later stack-growth
    /// fault. Lets the stack-growth heuristic restrict its "how far down
    /// has the stack already grown" scan to stack pages, instead of
    /// picking up the much lower addresses ELF load segments sit at.
    pub is_stack: bool,
}

pub type PageHandle = Arc<Mutex<Page>>;

impl Page {
    fn new_anon_inner(va: VirtAddr, writable: bool, p4: PhysAddr, is_stack: bool) -> PageHandle {
        Arc::new(Mutex::new(Page {
            va,
            writable,
            backing: Backing::Anon,
            loaded: false,
            frame: None,
            swap_slot: None,
            p4,
            mmap_writeback: false,
            from_mmap: false,
            is_stack,
        }))
    }

    pub fn new_anon(va: VirtAddr, writable: bool, p4: PhysAddr) -> PageHandle {
        Self::new_anon_inner(va, writable, p4, false)
    }

    /// A page claimed as part of a process's growable stack region.
    pub fn new_stack(va: VirtAddr, writable: bool, p4: PhysAddr) -> PageHandle {
        Self::new_anon_inner(va, writable, p4, true)
    }

    /// Used by `fork_from` to duplicate an `Anon` page while preserving
    /// whether it was a stack page, which `new_anon`/`new_stack` can't
    /// express from the caller's side alone.
    pub(crate) fn new_anon_with_marker(va: VirtAddr, writable: bool, p4: PhysAddr, is_stack: bool) -> PageHandle {
        Self::new_anon_inner(va, writable, p4, is_stack)
    }

    pub fn new_file(
        va: VirtAddr,
        writable: bool,
        p4: PhysAddr,
        path: String,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        from_mmap: bool,
        mmap_writeback: bool,
    ) -> PageHandle {
        Arc::new(Mutex::new(Page {
            va,
            writable,
            backing: Backing::File { path, offset, read_bytes, zero_bytes },
            loaded: false,
            frame: None,
            swap_slot: None,
            p4,
            mmap_writeback,
            from_mmap,
            is_stack: false,
        }))
    }

    /// Fill a freshly-allocated, zeroed frame with this page's content.
    fn populate(&self, frame_data: &mut [u8; PGSIZE]) -> Result<(), VmError> {
        match &self.backing {
            Backing::Anon => Ok(()),
            Backing::File { path, offset, read_bytes, .. } => {
                if *read_bytes > 0 {
                    let vfs = VFS.lock();
                    vfs.read_file(path, *offset, &mut frame_data[..*read_bytes])
                        .map_err(|_| VmError::FileReadFailed)?;
                }
                Ok(())
            }
        }
    }

    /// Restore content from its swap slot into a freshly-allocated frame.
    fn restore_from_swap(&mut self, frame_data: &mut [u8; PGSIZE]) -> Result<(), VmError> {
        let slot = self.swap_slot.take().ok_or(VmError::NotPresent)?;
        swap::swap_in(slot, frame_data).map_err(|_| VmError::SwapFailed)
    }

    /// Back this page with a physical frame: allocate one through the
    /// global frame table, populate it (from the swap slot if this page
    /// was previously evicted, otherwise from its backing source), and
    /// install the mapping in `space`.
    pub fn claim(this: &PageHandle, space: &AddressSpace) -> Result<(), VmError> {
        let was_swapped = {
            let page = this.lock();
            page.swap_slot.is_some()
        };

        let frame = super::frame_table::alloc_frame(this.clone())?;
        let frame_virt = crate::memory::paging::phys_to_virt(frame);
        let frame_data: &mut [u8; PGSIZE] = unsafe { &mut *(frame_virt.as_mut_ptr()) };
        for b in frame_data.iter_mut() {
            *b = 0;
        }

        {
            let mut page = this.lock();
            if was_swapped {
                page.restore_from_swap(frame_data)?;
            } else {
                page.populate(frame_data)?;
            }
            page.frame = Some(frame);
            page.loaded = true;
            let va = page.va;
            let writable = page.writable;
            drop(page);
            let mut fa = crate::memory::FRAME_ALLOCATOR.lock();
            if !space.map(va, frame, writable, &mut *fa) {
                return Err(VmError::AlreadyMapped);
            }
        }

        Ok(())
    }

    /// Called by the frame table during clock eviction: persist dirty
    /// content (swap for anon pages, write-back for writable mmap'd file
    /// pages) and unmap from the owning address space. The frame itself is
    /// reclaimed by the caller.
    pub fn evict(&mut self, space: &AddressSpace) -> Result<PhysAddr, VmError> {
        let frame = self.frame.ok_or(VmError::NotPresent)?;
        let dirty = space.is_dirty(self.va);

        if dirty {
            let frame_virt = crate::memory::paging::phys_to_virt(frame);
            let frame_data: &[u8; PGSIZE] = unsafe { &*(frame_virt.as_ptr()) };
            match &self.backing {
                Backing::Anon => {
                    let slot = swap::swap_out(frame_data).map_err(|_| VmError::SwapFailed)?;
                    self.swap_slot = Some(slot);
                }
                Backing::File { path, offset, read_bytes, .. } => {
                    if self.mmap_writeback && *read_bytes > 0 {
                        let mut vfs = VFS.lock();
                        let _ = vfs.write_file_at(path, *offset, &frame_data[..*read_bytes]);
                    }
                    // Non-writeback file pages (ELF text/rodata) are simply
                    // discarded; re-fault re-reads them from the file.
                }
            }
        }

        space.unmap(self.va);
        self.frame = None;
        self.loaded = false;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_anon_page_starts_unloaded() {
        let page = Page::new_anon(VirtAddr::new(0x1000), true, PhysAddr::new(0));
        let p = page.lock();
        assert!(!p.loaded);
        assert!(p.frame.is_none());
        assert_eq!(p.backing, Backing::Anon);
    }

    #[test]
    fn new_file_page_records_backing_fields() {
        let page = Page::new_file(
            VirtAddr::new(0x2000),
            false,
            PhysAddr::new(0),
            String::from("/boot/kernel.bin"),
            0,
            100,
            4096 - 100,
            false,
            false,
        );
        let p = page.lock();
        match &p.backing {
            Backing::File { path, offset, read_bytes, zero_bytes } => {
                assert_eq!(path, "/boot/kernel.bin");
                assert_eq!(*offset, 0);
                assert_eq!(*read_bytes, 100);
                assert_eq!(*zero_bytes, 4096 - 100);
            }
            _ => panic!("expected file backing"),
        }
    }
}
