//! Thread control block. A kernel-only thread has `user` set to `None`; a
//! process is a thread whose `user` is populated with an address space, an
//! SPT, and a file-descriptor table.

use super::context::Context;
use super::mlfq::{Fixed, PRI_DEFAULT};
use super::sync::Semaphore;
use crate::fs::fd::FdTable;
use crate::interrupts::usermode::Trapframe;
use crate::memory::paging::AddressSpace;
use crate::vm::{MmapTable, SupplementalPageTable};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Magic canary written at thread-block creation, checked on every
/// `current()` to detect kernel-stack overflow.
pub const THREAD_MAGIC: u32 = 0xCD6A_BF4B;

/// Process-only state: present iff this thread owns a user address space.
pub struct UserContext {
    pub address_space: AddressSpace,
    pub spt: SupplementalPageTable,
    pub mmap_table: MmapTable,
    pub fd_table: FdTable,
    /// The executable file this process was loaded from; held open
    /// (write-denied) for the process's lifetime.
    pub exe_path: String,
    /// Last observed user-mode stack pointer, consulted by the page-fault
    /// handler's stack-growth heuristic.
    pub saved_user_rsp: u64,
    /// Entry point and initial argc/argv this process was loaded with. Used
    /// by `user_entry_trampoline` for a freshly loaded or exec'd process;
    /// unused when `resume_frame` is set.
    pub entry: u64,
    pub entry_argc: u64,
    pub entry_argv_addr: u64,
    /// Set only for a `fork`'d child: the parent's exact Ring-3 register
    /// file at the moment of the `fork()` syscall, with `rax` forced to 0.
    /// `user_entry_trampoline` resumes here instead of jumping to `entry`.
    pub resume_frame: Option<Trapframe>,
}

pub struct Thread {
    pub tid: ThreadId,
    pub name: String,
    pub status: ThreadStatus,

    pub base_priority: i32,
    pub priority: i32,
    pub donors: Vec<ThreadId>,
    pub wait_on_lock: Option<usize>,

    pub nice: i32,
    pub recent_cpu: Fixed,

    pub wake_tick: u64,
    pub ticks_this_slice: u32,

    pub context: Context,
    pub kernel_stack: Box<[u8]>,
    pub magic: u32,

    pub parent: Option<ThreadId>,
    pub children: Vec<ThreadId>,
    pub exit_status: Option<i64>,

    /// Boxed so its address is stable across the thread table's internal
    /// rebalancing: `scheduler::wait_sema_{down,up}` take a raw pointer to
    /// it after a brief locked lookup, then call the blocking `down`/`up`
    /// with the scheduler lock released (required, since both can trigger
    /// a context switch that re-locks the scheduler).
    pub wait_sema: Box<Semaphore>,

    pub user: Option<UserContext>,
}

impl Thread {
    pub fn new_kernel(tid: ThreadId, name: String, entry: u64, stack: Box<[u8]>) -> Self {
        let stack_top = stack.as_ptr() as u64 + stack.len() as u64;
        Thread {
            tid,
            name,
            status: ThreadStatus::Ready,
            base_priority: PRI_DEFAULT,
            priority: PRI_DEFAULT,
            donors: Vec::new(),
            wait_on_lock: None,
            nice: 0,
            recent_cpu: Fixed::zero(),
            wake_tick: 0,
            ticks_this_slice: 0,
            context: Context::new(entry, stack_top),
            kernel_stack: stack,
            magic: THREAD_MAGIC,
            parent: None,
            children: Vec::new(),
            exit_status: None,
            wait_sema: Box::new(Semaphore::new(0)),
            user: None,
        }
    }

    pub fn is_process(&self) -> bool {
        self.user.is_some()
    }

    pub fn check_magic(&self) {
        assert_eq!(self.magic, THREAD_MAGIC, "thread {:?} stack canary corrupted", self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_kernel_thread_starts_ready_with_default_priority() {
        let stack = alloc::vec![0u8; 4096].into_boxed_slice();
        let t = Thread::new_kernel(ThreadId(1), String::from("test"), 0, stack);
        assert_eq!(t.status, ThreadStatus::Ready);
        assert_eq!(t.priority, PRI_DEFAULT);
        assert!(!t.is_process());
        assert_eq!(t.magic, THREAD_MAGIC);
    }
}
