//! Process management: creating the first user process, `fork`, `wait`, and
//! `exit`. A process is a [`Thread`](crate::scheduler::thread::Thread) whose
//! `user` field is populated; this module is where that field gets built
//! and torn down.

pub mod args;
pub mod elf;

use crate::fs::fd::FdTable;
use crate::memory::paging::AddressSpace;
use crate::memory::FRAME_ALLOCATOR;
use crate::scheduler::thread::{Thread, ThreadId, UserContext};
use crate::vm::{MmapTable, Page, SupplementalPageTable};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use x86_64::VirtAddr;

const KERNEL_STACK_SIZE: usize = 16 * 1024;
const PGSIZE: u64 = 4096;

#[derive(Debug)]
pub enum ProcessError {
    OutOfMemory,
    Exec(elf::ExecError),
    NotAProcess,
    NoSuchChild,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::OutOfMemory => write!(f, "out of memory"),
            ProcessError::Exec(e) => write!(f, "exec failed: {}", e),
            ProcessError::NotAProcess => write!(f, "not a process"),
            ProcessError::NoSuchChild => write!(f, "no such child"),
        }
    }
}

/// Entered by every freshly-scheduled process thread. A `fork`'d child has
/// `resume_frame` set and resumes mid-instruction, exactly where its parent
/// was when it called `fork()`, with `rax` forced to 0. A freshly loaded or
/// exec'd process has no `resume_frame` and jumps to its ELF entry point
/// instead.
extern "C" fn user_entry_trampoline() -> ! {
    let tid = crate::scheduler::current_tid();
    let resume_frame = crate::scheduler::with_thread(tid, |t| {
        let u = t.user.as_ref().expect("user_entry_trampoline run on a kernel-only thread");
        u.resume_frame
    })
    .expect("thread vanished before its own trampoline ran");

    if let Some(frame) = resume_frame {
        crate::log_info!("process {:?}: resuming forked child at {:#x}", tid, frame.rip);
        unsafe { crate::interrupts::usermode::resume_trapframe(&frame as *const _) };
    }

    let (entry, stack_top, argc, argv_addr) = crate::scheduler::with_thread(tid, |t| {
        let u = t.user.as_ref().expect("user_entry_trampoline run on a kernel-only thread");
        (u.entry, u.saved_user_rsp, u.entry_argc, u.entry_argv_addr)
    })
    .expect("thread vanished before its own trampoline ran");

    let user_cs = crate::interrupts::gdt::user_code_selector().0;
    let user_ss = crate::interrupts::gdt::user_data_selector().0;

    crate::log_info!("process {:?}: entering Ring 3 at {:#x}, stack {:#x}", tid, entry, stack_top);

    crate::interrupts::usermode::jump_to_usermode(entry, stack_top, user_cs, user_ss, argc, argv_addr);
}

/// Write `data` into the user address space at `va`, which must already be
/// backed by claimed (present) pages. Crosses page boundaries one chunk at
/// a time since the destination frames need not be contiguous.
fn write_user_bytes(space: &AddressSpace, va: u64, data: &[u8]) {
    let mut written = 0usize;
    while written < data.len() {
        let cur = va + written as u64;
        let page_off = (cur & (PGSIZE - 1)) as usize;
        let chunk = core::cmp::min(data.len() - written, PGSIZE as usize - page_off);
        let frame = space.translate(VirtAddr::new(cur)).expect("stack page not mapped");
        let frame_virt = crate::memory::paging::phys_to_virt(frame);
        unsafe {
            let dst = (frame_virt.as_u64() as *mut u8).add(page_off);
            core::ptr::copy_nonoverlapping(data[written..written + chunk].as_ptr(), dst, chunk);
        }
        written += chunk;
    }
}

/// Allocate and claim every page from `from` (rounded down) up to
/// `crate::vm::USER_STACK` (exclusive) as writable anonymous memory.
fn claim_stack_range(
    spt: &mut SupplementalPageTable,
    space: &AddressSpace,
    from: u64,
    p4: x86_64::PhysAddr,
) -> Result<(), ProcessError> {
    let mut va = from & !(PGSIZE - 1);
    while va < crate::vm::USER_STACK {
        let page = Page::new_stack(VirtAddr::new(va), true, p4);
        spt.insert(page.clone());
        Page::claim(&page, space).map_err(|_| ProcessError::OutOfMemory)?;
        va += PGSIZE;
    }
    Ok(())
}

/// Load `path` as a fresh process with `argv` on its initial stack, and
/// hand it to the scheduler ready to run.
pub fn create_initial_process(path: &str, argv: &[&str]) -> Result<ThreadId, ProcessError> {
    let space = {
        let mut fa = FRAME_ALLOCATOR.lock();
        AddressSpace::new(&mut *fa).ok_or(ProcessError::OutOfMemory)?
    };

    let mut spt = SupplementalPageTable::new();
    let loaded = elf::load(path, &mut spt, space.p4_phys).map_err(ProcessError::Exec)?;

    let image = args::build_stack_image(argv, crate::vm::USER_STACK);
    claim_stack_range(&mut spt, &space, image.write_base, space.p4_phys)?;
    write_user_bytes(&space, image.write_base, &image.bytes);

    let tid = crate::scheduler::alloc_tid();
    let kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let mut thread = Thread::new_kernel(
        tid,
        String::from(elf::extract_filename(path)),
        user_entry_trampoline as u64,
        kernel_stack,
    );
    thread.user = Some(UserContext {
        address_space: space,
        spt,
        mmap_table: MmapTable::new(),
        fd_table: FdTable::new(),
        exe_path: String::from(path),
        saved_user_rsp: image.final_rsp,
        entry: loaded.entry,
        entry_argc: image.argc,
        entry_argv_addr: image.argv_addr,
        resume_frame: None,
    });

    Ok(crate::scheduler::insert_thread(thread))
}

/// Replace the calling process's address space with a freshly loaded ELF
/// and jump directly into it. On success this never returns to the caller;
/// on failure the caller's address space and FD table are untouched.
pub fn exec(path: &str, argv: &[&str]) -> Result<(), ProcessError> {
    let tid = crate::scheduler::current_tid();

    let space = {
        let mut fa = FRAME_ALLOCATOR.lock();
        AddressSpace::new(&mut *fa).ok_or(ProcessError::OutOfMemory)?
    };

    let mut spt = SupplementalPageTable::new();
    let loaded = match elf::load(path, &mut spt, space.p4_phys) {
        Ok(l) => l,
        Err(e) => {
            let mut fa = FRAME_ALLOCATOR.lock();
            space.destroy(&mut *fa);
            return Err(ProcessError::Exec(e));
        }
    };

    let image = args::build_stack_image(argv, crate::vm::USER_STACK);
    if let Err(e) = claim_stack_range(&mut spt, &space, image.write_base, space.p4_phys) {
        let mut fa = FRAME_ALLOCATOR.lock();
        space.destroy(&mut *fa);
        return Err(e);
    }
    write_user_bytes(&space, image.write_base, &image.bytes);

    let exe_name = String::from(elf::extract_filename(path));
    let user_cs = crate::interrupts::gdt::user_code_selector().0;
    let user_ss = crate::interrupts::gdt::user_data_selector().0;

    crate::scheduler::with_thread_mut(tid, |t| {
        t.name = exe_name;
        let old_fd_table = t.user.take().map(|old| {
            let UserContext { address_space: old_space, mut spt: old_spt, mut mmap_table, fd_table, .. } = old;
            let vas: Vec<VirtAddr> = old_spt.iter().map(|(va, _)| *va).collect();
            for va in vas {
                let _ = mmap_table.unmap(&mut old_spt, va, &old_space);
            }
            for (_, page) in old_spt.iter() {
                let mut p = page.lock();
                if p.frame.is_some() {
                    let _ = p.evict(&old_space);
                    crate::vm::frame_table::free_frame_for(page);
                }
            }
            let mut fa = FRAME_ALLOCATOR.lock();
            old_space.destroy(&mut *fa);
            fd_table
        });

        t.user = Some(UserContext {
            address_space: space,
            spt,
            mmap_table: MmapTable::new(),
            fd_table: old_fd_table.unwrap_or_else(FdTable::new),
            exe_path: String::from(path),
            saved_user_rsp: image.final_rsp,
            entry: loaded.entry,
            entry_argc: image.argc,
            entry_argv_addr: image.argv_addr,
            resume_frame: None,
        });
    });

    crate::log_info!("process {:?}: exec {:?}", tid, path);
    crate::interrupts::usermode::jump_to_usermode(loaded.entry, image.final_rsp, user_cs, user_ss, image.argc, image.argv_addr);
}

/// Duplicate the calling process into a new child, returning the child's
/// tid. Loaded pages are eagerly materialized and byte-copied; unloaded
/// pages stay structural and will populate themselves independently on
/// first fault.
///
/// The child resumes at the exact Ring-3 instruction after the `fork`
/// syscall, not at the process's entry point: `fork` is only ever called
/// from inside the `int 0x80` handler, so `current_trapframe` hands back
/// the parent's complete register file as it stood at the trap, and the
/// child's `user_entry_trampoline` replays it verbatim via
/// `resume_trapframe` except for `rax`, forced to 0 here so `if (pid == 0)`
/// in the caller sees the child branch.
pub fn fork(parent_tid: ThreadId) -> Result<ThreadId, ProcessError> {
    let child_tid = crate::scheduler::alloc_tid();

    let child_space = {
        let mut fa = FRAME_ALLOCATOR.lock();
        AddressSpace::new(&mut *fa).ok_or(ProcessError::OutOfMemory)?
    };

    let mut child_frame = crate::interrupts::usermode::current_trapframe();
    child_frame.rax = 0;

    let mut child_spt = SupplementalPageTable::new();
    let snapshot = crate::scheduler::with_thread(parent_tid, |parent| {
        let user = parent.user.as_ref()?;
        child_spt.fork_from(&user.spt, child_space.p4_phys);
        Some((
            user.fd_table.fork(),
            user.exe_path.clone(),
            user.entry,
            user.entry_argc,
            user.entry_argv_addr,
        ))
    })
    .flatten()
    .ok_or(ProcessError::NotAProcess)?;

    let (fd_table, exe_path, entry, entry_argc, entry_argv_addr) = snapshot;
    let saved_user_rsp = child_frame.rsp;

    // Materialize any page that was already resident in the parent so the
    // child sees identical content, not a fresh zero/re-read.
    let child_vas: Vec<VirtAddr> = child_spt.iter().map(|(va, _)| *va).collect();
    for va in child_vas {
        let parent_loaded = crate::scheduler::with_thread(parent_tid, |parent| {
            parent.user.as_ref().and_then(|u| u.spt.find(va)).map(|p| p.lock().loaded)
        })
        .flatten()
        .unwrap_or(false);

        if !parent_loaded {
            continue;
        }

        let child_page = child_spt.find(va).expect("just inserted by fork_from");
        Page::claim(&child_page, &child_space).map_err(|_| ProcessError::OutOfMemory)?;

        let parent_frame =
            crate::scheduler::with_thread(parent_tid, |parent| parent.user.as_ref().unwrap().address_space.translate(va))
                .flatten();
        if let Some(parent_frame) = parent_frame {
            let parent_virt = crate::memory::paging::phys_to_virt(parent_frame);
            let child_phys_frame = child_space.translate(va).expect("just claimed");
            let child_virt = crate::memory::paging::phys_to_virt(child_phys_frame);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    parent_virt.as_u64() as *const u8,
                    child_virt.as_u64() as *mut u8,
                    PGSIZE as usize,
                );
            }
        }
    }

    let kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let mut child = Thread::new_kernel(child_tid, String::from("forked"), user_entry_trampoline as u64, kernel_stack);
    child.parent = Some(parent_tid);
    child.user = Some(UserContext {
        address_space: child_space,
        spt: child_spt,
        mmap_table: MmapTable::new(),
        fd_table,
        exe_path,
        saved_user_rsp,
        entry,
        entry_argc,
        entry_argv_addr,
        resume_frame: Some(child_frame),
    });

    crate::scheduler::with_thread_mut(parent_tid, |parent| parent.children.push(child_tid));

    let tid = crate::scheduler::insert_thread(child);

    Ok(tid)
}

/// Block until child `child_tid` exits, returning its exit status. The child
/// posts its `wait_sema` from `exit` just before retiring; once woken, its
/// thread has already run `retire_current` and will never be scheduled
/// again, so it's safe to reap immediately.
pub fn wait(parent_tid: ThreadId, child_tid: ThreadId) -> Result<i64, ProcessError> {
    let is_child = crate::scheduler::with_thread(parent_tid, |p| p.children.contains(&child_tid)).unwrap_or(false);
    if !is_child {
        return Err(ProcessError::NoSuchChild);
    }

    crate::scheduler::wait_sema_down(child_tid);

    let status = crate::scheduler::with_thread(child_tid, |c| c.exit_status.unwrap_or(-1)).unwrap_or(-1);

    crate::scheduler::with_thread_mut(parent_tid, |p| p.children.retain(|&t| t != child_tid));
    crate::scheduler::reap(child_tid);

    Ok(status)
}

/// Block until `tid` exits, the same way [`wait`] does, but without
/// requiring a parent/child relationship. Used to run the boot-time `run`
/// action, which has no parent process to own it.
pub fn wait_for_boot_process(tid: ThreadId) -> i64 {
    crate::scheduler::wait_sema_down(tid);
    let status = crate::scheduler::with_thread(tid, |t| t.exit_status.unwrap_or(-1)).unwrap_or(-1);
    crate::scheduler::reap(tid);
    status
}

/// Terminate the calling process: tear down its address space, release its
/// frames, record the exit status for a waiting parent, and schedule away
/// from it permanently.
pub fn exit(status: i64) -> ! {
    let tid = crate::scheduler::current_tid();

    crate::scheduler::with_thread_mut(tid, |t| {
        t.exit_status = Some(status);

        if let Some(user) = t.user.take() {
            let UserContext { address_space, mut spt, mut mmap_table, .. } = user;
            let vas: Vec<VirtAddr> = spt.iter().map(|(va, _)| *va).collect();
            for va in vas {
                let _ = mmap_table.unmap(&mut spt, va, &address_space);
            }
            for (_, page) in spt.iter() {
                let mut p = page.lock();
                if p.frame.is_some() {
                    let _ = p.evict(&address_space);
                    crate::vm::frame_table::free_frame_for(page);
                }
            }
            let mut fa = FRAME_ALLOCATOR.lock();
            address_space.destroy(&mut *fa);
        }
    });

    crate::log_info!("process {:?}: exited with status {}", tid, status);

    crate::scheduler::wait_sema_up(tid);
    crate::scheduler::retire_current();
}
