//! Per-process file descriptor table. Slots 0/1 are sentinel STDIN/STDOUT
//! tags (console I/O, no underlying VFS file); every other slot holds a
//! handle to a regular file, shareable across slots (and across processes,
//! via `fork`) through a reference count.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub const FD_TABLE_SIZE: usize = 512;
pub const STDIN_FILENO: i32 = 0;
pub const STDOUT_FILENO: i32 = 1;

/// A single open regular file. Shared by every FD slot that refers to it
/// (directly, via `dup2`, or across a `fork`).
pub struct FileHandle {
    pub path: String,
    pub offset: Mutex<usize>,
    pub dup_count: Mutex<usize>,
}

impl FileHandle {
    pub fn new(path: String) -> Arc<FileHandle> {
        Arc::new(FileHandle { path, offset: Mutex::new(0), dup_count: Mutex::new(1) })
    }
}

#[derive(Clone)]
pub enum FdSlot {
    Empty,
    Stdin,
    Stdout,
    File(Arc<FileHandle>),
}

pub struct FdTable {
    slots: Vec<FdSlot>,
    /// How many STDIN slots this process currently has open (sentinel
    /// handles aren't reference-counted objects, so the table tracks the
    /// count directly).
    stdin_count: usize,
    stdout_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdError {
    TableFull,
    BadFd,
    WrongDirection,
}

impl FdTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(FD_TABLE_SIZE);
        slots.push(FdSlot::Stdin);
        slots.push(FdSlot::Stdout);
        for _ in 2..FD_TABLE_SIZE {
            slots.push(FdSlot::Empty);
        }
        FdTable { slots, stdin_count: 1, stdout_count: 1 }
    }

    fn slot(&self, fd: i32) -> Result<&FdSlot, FdError> {
        self.slots.get(fd as usize).ok_or(FdError::BadFd)
    }

    pub fn get(&self, fd: i32) -> Result<FdSlot, FdError> {
        self.slot(fd).cloned().map_err(|_| FdError::BadFd)
    }

    /// Install a fresh regular-file handle into the first free slot.
    pub fn open(&mut self, path: String) -> Result<i32, FdError> {
        let idx = self.slots.iter().position(|s| matches!(s, FdSlot::Empty)).ok_or(FdError::TableFull)?;
        self.slots[idx] = FdSlot::File(FileHandle::new(path));
        Ok(idx as i32)
    }

    /// Close `fd`. For STDIN/STDOUT this decrements the per-thread count;
    /// for a file handle it decrements `dup_count`, actually dropping the
    /// handle only when it reaches zero.
    pub fn close(&mut self, fd: i32) -> Result<(), FdError> {
        let idx = fd as usize;
        if idx >= self.slots.len() {
            return Err(FdError::BadFd);
        }
        match &self.slots[idx] {
            FdSlot::Empty => return Err(FdError::BadFd),
            FdSlot::Stdin => self.stdin_count = self.stdin_count.saturating_sub(1),
            FdSlot::Stdout => self.stdout_count = self.stdout_count.saturating_sub(1),
            FdSlot::File(handle) => {
                let mut count = handle.dup_count.lock();
                *count = count.saturating_sub(1);
            }
        }
        self.slots[idx] = FdSlot::Empty;
        Ok(())
    }

    /// `dup2(old, new)`: if `old == new`, return `new` unchanged; otherwise
    /// close whatever `new` currently holds, then install a shared copy of
    /// `old`'s slot into `new`.
    pub fn dup2(&mut self, old: i32, new: i32) -> Result<i32, FdError> {
        if old == new {
            if matches!(self.slot(old)?, FdSlot::Empty) {
                return Err(FdError::BadFd);
            }
            return Ok(new);
        }

        let old_slot = self.slot(old)?.clone();
        if matches!(old_slot, FdSlot::Empty) {
            return Err(FdError::BadFd);
        }

        if !matches!(self.slot(new)?, FdSlot::Empty) {
            self.close(new)?;
        }

        match &old_slot {
            FdSlot::Stdin => self.stdin_count += 1,
            FdSlot::Stdout => self.stdout_count += 1,
            FdSlot::File(handle) => {
                *handle.dup_count.lock() += 1;
            }
            FdSlot::Empty => unreachable!(),
        }

        let new_idx = new as usize;
        if new_idx >= self.slots.len() {
            return Err(FdError::BadFd);
        }
        self.slots[new_idx] = old_slot;
        Ok(new)
    }

    /// Clone this table for `fork`, preserving sharing: two parent slots
    /// backed by the same `FileHandle` still share one handle in the child.
    pub fn fork(&self) -> FdTable {
        let mut slots = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            match slot {
                FdSlot::File(handle) => {
                    *handle.dup_count.lock() += 1;
                    slots.push(FdSlot::File(handle.clone()));
                }
                other => slots.push(other.clone()),
            }
        }
        FdTable { slots, stdin_count: self.stdin_count, stdout_count: self.stdout_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_has_stdin_stdout_sentinels() {
        let table = FdTable::new();
        assert!(matches!(table.get(STDIN_FILENO).unwrap(), FdSlot::Stdin));
        assert!(matches!(table.get(STDOUT_FILENO).unwrap(), FdSlot::Stdout));
    }

    #[test]
    fn open_assigns_first_free_slot() {
        let mut table = FdTable::new();
        let fd = table.open(String::from("/a")).unwrap();
        assert_eq!(fd, 2);
    }

    #[test]
    fn dup2_same_fd_is_a_noop_on_open_fd() {
        let mut table = FdTable::new();
        let fd = table.open(String::from("/a")).unwrap();
        assert_eq!(table.dup2(fd, fd).unwrap(), fd);
    }

    #[test]
    fn dup2_same_fd_on_closed_slot_errors() {
        let mut table = FdTable::new();
        assert_eq!(table.dup2(5, 5), Err(FdError::BadFd));
    }

    #[test]
    fn dup2_shares_handle_and_close_on_one_slot_does_not_affect_other() {
        let mut table = FdTable::new();
        let fd = table.open(String::from("/a")).unwrap();
        let new_fd = fd + 10;
        table.dup2(fd, new_fd).unwrap();

        if let FdSlot::File(h) = table.get(fd).unwrap() {
            assert_eq!(*h.dup_count.lock(), 2);
        } else {
            panic!("expected file slot");
        }

        table.close(fd).unwrap();
        assert!(matches!(table.get(fd).unwrap(), FdSlot::Empty));
        assert!(matches!(table.get(new_fd).unwrap(), FdSlot::File(_)));
    }

    #[test]
    fn dup2_closes_existing_target_slot_first() {
        let mut table = FdTable::new();
        let a = table.open(String::from("/a")).unwrap();
        let b = table.open(String::from("/b")).unwrap();
        table.dup2(a, b).unwrap();
        if let FdSlot::File(h) = table.get(b).unwrap() {
            assert_eq!(h.path, "/a");
        } else {
            panic!("expected file slot");
        }
    }

    #[test]
    fn fork_preserves_shared_handle_between_parent_and_child() {
        let mut table = FdTable::new();
        let fd = table.open(String::from("/a")).unwrap();
        let dup_fd = fd + 1;
        table.dup2(fd, dup_fd).unwrap();

        let child = table.fork();
        if let (FdSlot::File(h1), FdSlot::File(h2)) = (child.get(fd).unwrap(), child.get(dup_fd).unwrap()) {
            assert!(Arc::ptr_eq(&h1, &h2));
        } else {
            panic!("expected file slots");
        }
    }

    #[test]
    fn close_on_empty_slot_errors() {
        let mut table = FdTable::new();
        assert_eq!(table.close(10), Err(FdError::BadFd));
    }

    #[test]
    fn out_of_range_fd_errors() {
        let table = FdTable::new();
        assert_eq!(table.get(FD_TABLE_SIZE as i32 + 1), Err(FdError::BadFd));
    }
}
