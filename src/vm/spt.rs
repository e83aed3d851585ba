//! Supplemental page table: per-process map from virtual page to its
//! [`PageHandle`], consulted on every page fault and on `fork` to decide
//! what a faulting or duplicated address actually contains.

use super::page::{Page, PageHandle};
use alloc::collections::BTreeMap;
use x86_64::VirtAddr;

fn page_floor(va: VirtAddr) -> VirtAddr {
    VirtAddr::new(va.as_u64() & !0xfff)
}

pub struct SupplementalPageTable {
    pages: BTreeMap<VirtAddr, PageHandle>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable { pages: BTreeMap::new() }
    }

    pub fn insert(&mut self, page: PageHandle) -> bool {
        let va = page.lock().va;
        if self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, page);
        true
    }

    pub fn find(&self, va: VirtAddr) -> Option<PageHandle> {
        self.pages.get(&page_floor(va)).cloned()
    }

    pub fn remove(&mut self, va: VirtAddr) -> Option<PageHandle> {
        self.pages.remove(&page_floor(va))
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.pages.contains_key(&page_floor(va))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VirtAddr, &PageHandle)> {
        self.pages.iter()
    }

    /// Duplicate every entry for `fork`, structurally: each child page
    /// starts unloaded with the same backing as its parent. The caller
    /// (`process::fork`) is responsible for eagerly materializing and
    /// copying any parent page that already has a resident frame, since
    /// doing so needs both address spaces at once.
    ///
    /// `mmap`'d regions are not inherited: a `Backing::File` page created by
    /// `mmap` (`from_mmap`) vanishes from the child, the same way the
    /// region itself is absent from the child's (freshly empty) mmap table.
    /// ELF-loaded `Backing::File` pages are not mmap'd and are copied like
    /// any other page.
    pub fn fork_from(&mut self, parent: &SupplementalPageTable, child_p4: x86_64::PhysAddr) {
        for (va, page) in parent.pages.iter() {
            let src = page.lock();
            let cloned = match &src.backing {
                super::page::Backing::Anon => Page::new_anon_with_marker(*va, src.writable, child_p4, src.is_stack),
                super::page::Backing::File { .. } if src.from_mmap => continue,
                super::page::Backing::File { path, offset, read_bytes, zero_bytes } => Page::new_file(
                    *va,
                    src.writable,
                    child_p4,
                    path.clone(),
                    *offset,
                    *read_bytes,
                    *zero_bytes,
                    false,
                    src.mmap_writeback,
                ),
            };
            drop(src);
            self.pages.insert(*va, cloned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    #[test]
    fn insert_rejects_duplicate_va() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x4000);
        assert!(spt.insert(Page::new_anon(va, true, PhysAddr::new(0))));
        assert!(!spt.insert(Page::new_anon(va, true, PhysAddr::new(0))));
    }

    #[test]
    fn find_rounds_down_to_page_boundary() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x5000);
        spt.insert(Page::new_anon(va, true, PhysAddr::new(0)));
        assert!(spt.find(VirtAddr::new(0x5123)).is_some());
        assert!(spt.find(VirtAddr::new(0x6000)).is_none());
    }

    #[test]
    fn remove_drops_entry() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x7000);
        spt.insert(Page::new_anon(va, true, PhysAddr::new(0)));
        assert!(spt.remove(va).is_some());
        assert!(!spt.contains(va));
    }

    #[test]
    fn fork_from_skips_mmap_pages_but_keeps_elf_pages() {
        let mut parent = SupplementalPageTable::new();
        let elf_va = VirtAddr::new(0x40_0000);
        let mmap_va = VirtAddr::new(0x50_0000);
        parent.insert(Page::new_file(
            elf_va,
            false,
            PhysAddr::new(0),
            alloc::string::String::from("/bin/echo"),
            0,
            4096,
            0,
            false,
            false,
        ));
        parent.insert(Page::new_file(
            mmap_va,
            true,
            PhysAddr::new(0),
            alloc::string::String::from("/data"),
            0,
            4096,
            0,
            true,
            true,
        ));

        let mut child = SupplementalPageTable::new();
        child.fork_from(&parent, PhysAddr::new(0));

        assert!(child.find(elf_va).is_some());
        assert!(child.find(mmap_va).is_none());
    }

    #[test]
    fn fork_from_preserves_stack_marker() {
        let mut parent = SupplementalPageTable::new();
        let va = VirtAddr::new(0x4747_7000);
        parent.insert(Page::new_stack(va, true, PhysAddr::new(0)));

        let mut child = SupplementalPageTable::new();
        child.fork_from(&parent, PhysAddr::new(0));

        let page = child.find(va).unwrap();
        assert!(page.lock().is_stack);
    }
}
