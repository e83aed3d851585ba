//! System-call dispatcher. `int 0x80`'s handler (`interrupts::usermode`)
//! lands here with the call number in `number` and up to five arguments
//! already shuffled into the Rust calling convention; `dispatch` reads a
//! fixed table and returns a result in rax.

pub mod check;

use crate::fs::fd::{FdError, FdSlot, STDIN_FILENO, STDOUT_FILENO};
use crate::process;
use crate::scheduler::{self, thread::ThreadId};
use crate::vm::MmapError;
use alloc::string::String;
use alloc::vec;
use check::Access;
use core::fmt::Write as _;
use x86_64::VirtAddr;

pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXEC: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_CREATE: u64 = 5;
pub const SYS_REMOVE: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_SEEK: u64 = 11;
pub const SYS_TELL: u64 = 12;
pub const SYS_CLOSE: u64 = 13;
pub const SYS_DUP2: u64 = 14;
pub const SYS_MMAP: u64 = 15;
pub const SYS_MUNMAP: u64 = 16;

const MAX_STRING_LEN: usize = 4096;
const MAX_IO_LEN: usize = 1024 * 1024;

/// Central syscall dispatcher, called from the `int 0x80` handler.
/// Arguments arrive as rdi/rsi/rdx/r10/r8; result goes out in rax.
pub extern "C" fn dispatch(number: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    // `int 0x80` runs through an interrupt gate, which masks IF on entry;
    // re-enable it so a syscall can itself be preempted by the timer.
    x86_64::instructions::interrupts::enable();

    match number {
        SYS_HALT => halt(),
        SYS_EXIT => sys_exit(a0 as i64),
        SYS_FORK => sys_fork(),
        SYS_EXEC => sys_exec(a0),
        SYS_WAIT => sys_wait(a0),
        SYS_CREATE => sys_create(a0, a1),
        SYS_REMOVE => sys_remove(a0),
        SYS_OPEN => sys_open(a0),
        SYS_FILESIZE => sys_filesize(a0 as i32),
        SYS_READ => sys_read(a0 as i32, a1, a2 as usize),
        SYS_WRITE => sys_write(a0 as i32, a1, a2 as usize),
        SYS_SEEK => sys_seek(a0 as i32, a1 as usize),
        SYS_TELL => sys_tell(a0 as i32),
        SYS_CLOSE => sys_close(a0 as i32),
        SYS_DUP2 => sys_dup2(a0 as i32, a1 as i32),
        SYS_MMAP => sys_mmap(a0, a1 as usize, a2 != 0, a3 as i32, a4 as usize),
        SYS_MUNMAP => sys_munmap(a0),
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            sys_exit(-1)
        }
    }
}

/// Power off the machine via the QEMU/Bochs `isa-debug-exit`-style ACPI
/// shutdown port, matching how this kernel talks to hardware everywhere
/// else: a raw port write, no firmware call.
pub fn halt() -> ! {
    crate::log_info!("system halted");
    unsafe {
        let mut port: x86_64::instructions::port::Port<u16> = x86_64::instructions::port::Port::new(0x604);
        port.write(0x2000u16);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

fn current() -> ThreadId {
    scheduler::current_tid()
}

/// Read a NUL-terminated user string whose length isn't known up front
/// (syscall arguments pass bare pointers, not `(ptr, len)` pairs).
fn copy_user_cstr(ptr: u64) -> Option<String> {
    let tid = current();
    scheduler::with_thread(tid, |t| {
        let user = t.user.as_ref()?;
        if !check::check_address(&user.spt, ptr) {
            return None;
        }
        let space = &user.address_space;
        let mut bytes = alloc::vec::Vec::new();
        let mut cur = ptr;
        loop {
            if bytes.len() >= MAX_STRING_LEN {
                return None;
            }
            if !check::check_address(&user.spt, cur) {
                return None;
            }
            let frame = space.translate(VirtAddr::new(cur))?;
            let frame_virt = crate::memory::paging::phys_to_virt(frame);
            let byte = unsafe { *((frame_virt.as_u64() as *const u8).add((cur & 0xfff) as usize)) };
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cur += 1;
        }
        String::from_utf8(bytes).ok()
    })
    .flatten()
}

fn sys_exit(status: i64) -> i64 {
    process::exit(status)
}

fn sys_fork() -> i64 {
    match process::fork(current()) {
        Ok(child) => child.0 as i64,
        Err(e) => {
            crate::log_warn!("fork failed: {}", e);
            -1
        }
    }
}

fn sys_exec(path_ptr: u64) -> i64 {
    let Some(path) = copy_user_cstr(path_ptr) else { return -1 };
    // A command line is "program arg1 arg2 ..."; split on spaces, no quoting.
    let parts: alloc::vec::Vec<&str> = path.split_whitespace().collect();
    let Some(&prog) = parts.first() else { return -1 };
    match process::exec(prog, &parts) {
        Ok(()) => unreachable!("exec only returns on failure"),
        Err(e) => {
            crate::log_warn!("exec {} failed: {}", prog, e);
            -1
        }
    }
}

fn sys_wait(tid: u64) -> i64 {
    match process::wait(current(), ThreadId(tid)) {
        Ok(status) => status,
        Err(_) => -1,
    }
}

fn sys_create(name_ptr: u64, initial_size: u64) -> i64 {
    let Some(name) = copy_user_cstr(name_ptr) else { return -1 };
    let mut vfs = crate::fs::VFS.lock();
    match vfs.create(&name) {
        Ok(_) => {
            if initial_size > 0 {
                let zeros = vec![0u8; initial_size as usize];
                let _ = vfs.write_file(&name, &zeros);
            }
            1
        }
        Err(_) => 0,
    }
}

fn sys_remove(name_ptr: u64) -> i64 {
    let Some(name) = copy_user_cstr(name_ptr) else { return -1 };
    let mut vfs = crate::fs::VFS.lock();
    i64::from(vfs.unlink(&name).is_ok())
}

fn sys_open(name_ptr: u64) -> i64 {
    let Some(name) = copy_user_cstr(name_ptr) else { return -1 };
    {
        let vfs = crate::fs::VFS.lock();
        if vfs.lookup(&name).is_err() {
            return -1;
        }
    }
    let tid = current();
    scheduler::with_thread_mut(tid, |t| {
        let user = t.user.as_mut()?;
        user.fd_table.open(name).ok()
    })
    .flatten()
    .map(|fd| fd as i64)
    .unwrap_or(-1)
}

fn sys_filesize(fd: i32) -> i64 {
    let tid = current();
    let path = scheduler::with_thread(tid, |t| {
        let user = t.user.as_ref()?;
        match user.fd_table.get(fd).ok()? {
            FdSlot::File(h) => Some(h.path.clone()),
            _ => None,
        }
    })
    .flatten();
    match path {
        Some(p) => crate::fs::VFS.lock().lookup(&p).map(|i| i.size as i64).unwrap_or(-1),
        None => -1,
    }
}

fn sys_read(fd: i32, buf_ptr: u64, len: usize) -> i64 {
    if len > MAX_IO_LEN {
        return -1;
    }
    let tid = current();
    let ok = scheduler::with_thread(tid, |t| {
        t.user.as_ref().map(|u| check::check_range(&u.spt, buf_ptr, len.max(1), Access::Write)).unwrap_or(false)
    })
    .unwrap_or(false);
    if !ok {
        return -1;
    }

    if fd == STDIN_FILENO {
        return read_stdin(buf_ptr, len);
    }

    let slot = scheduler::with_thread(tid, |t| t.user.as_ref().and_then(|u| u.fd_table.get(fd).ok())).flatten();
    let (path, offset) = match slot {
        Some(FdSlot::File(h)) => (h.path.clone(), *h.offset.lock()),
        _ => return -1,
    };

    let mut bytes = vec![0u8; len];
    let n = {
        let vfs = crate::fs::VFS.lock();
        match vfs.read_file(&path, offset, &mut bytes) {
            Ok(n) => n,
            Err(_) => return -1,
        }
    };

    if !write_user_bytes_checked(buf_ptr, &bytes[..n]) {
        return -1;
    }

    scheduler::with_thread_mut(tid, |t| {
        if let Some(user) = t.user.as_mut() {
            if let Ok(FdSlot::File(h)) = user.fd_table.get(fd) {
                *h.offset.lock() += n;
            }
        }
    });
    n as i64
}

fn read_stdin(buf_ptr: u64, len: usize) -> i64 {
    use crate::drivers::keyboard::scancodes::KeyCode;
    let mut bytes = vec![0u8; len];
    let mut n = 0;
    while n < len {
        match crate::drivers::keyboard::read_char() {
            KeyCode::Char(c) => {
                bytes[n] = c as u8;
                n += 1;
                if c == '\n' {
                    break;
                }
            }
            KeyCode::Enter => {
                bytes[n] = b'\n';
                n += 1;
                break;
            }
            _ => continue,
        }
    }
    if write_user_bytes_checked(buf_ptr, &bytes[..n]) {
        n as i64
    } else {
        -1
    }
}

fn write_user_bytes_checked(ptr: u64, data: &[u8]) -> bool {
    let tid = current();
    scheduler::with_thread(tid, |t| {
        let user = t.user.as_ref()?;
        let mut written = 0usize;
        while written < data.len() {
            let cur = ptr + written as u64;
            let page_off = (cur & 0xfff) as usize;
            let chunk = core::cmp::min(data.len() - written, 4096 - page_off);
            let frame = user.address_space.translate(VirtAddr::new(cur))?;
            let frame_virt = crate::memory::paging::phys_to_virt(frame);
            unsafe {
                let dst = (frame_virt.as_u64() as *mut u8).add(page_off);
                core::ptr::copy_nonoverlapping(data[written..written + chunk].as_ptr(), dst, chunk);
            }
            written += chunk;
        }
        Some(())
    })
    .flatten()
    .is_some()
}

fn sys_write(fd: i32, buf_ptr: u64, len: usize) -> i64 {
    if len > MAX_IO_LEN {
        return -1;
    }
    let Some(data) = copy_user_string_bytes(buf_ptr, len) else { return -1 };

    if fd == STDOUT_FILENO {
        if let Ok(s) = core::str::from_utf8(&data) {
            let _ = crate::vga::WRITER.lock().write_str(s);
            let _ = crate::serial::SERIAL1.lock().write_str(s);
        }
        return len as i64;
    }

    let tid = current();
    let slot = scheduler::with_thread(tid, |t| t.user.as_ref().and_then(|u| u.fd_table.get(fd).ok())).flatten();
    match slot {
        Some(FdSlot::File(h)) => {
            let offset = *h.offset.lock();
            let n = {
                let mut vfs = crate::fs::VFS.lock();
                match vfs.write_file_at(&h.path, offset, &data) {
                    Ok(n) => n,
                    Err(_) => return -1,
                }
            };
            *h.offset.lock() += n;
            n as i64
        }
        _ => -1,
    }
}

fn copy_user_string_bytes(ptr: u64, len: usize) -> Option<alloc::vec::Vec<u8>> {
    if len == 0 {
        return Some(alloc::vec::Vec::new());
    }
    let tid = current();
    scheduler::with_thread(tid, |t| {
        let user = t.user.as_ref()?;
        if !check::check_range(&user.spt, ptr, len, Access::Read) {
            return None;
        }
        let space = &user.address_space;
        let mut bytes = vec![0u8; len];
        let mut read = 0usize;
        while read < len {
            let cur = ptr + read as u64;
            let page_off = (cur & 0xfff) as usize;
            let chunk = core::cmp::min(len - read, 4096 - page_off);
            let frame = space.translate(VirtAddr::new(cur))?;
            let frame_virt = crate::memory::paging::phys_to_virt(frame);
            unsafe {
                let src = (frame_virt.as_u64() as *const u8).add(page_off);
                core::ptr::copy_nonoverlapping(src, bytes.as_mut_ptr().add(read), chunk);
            }
            read += chunk;
        }
        Some(bytes)
    })
    .flatten()
}

fn sys_seek(fd: i32, pos: usize) -> i64 {
    let tid = current();
    scheduler::with_thread(tid, |t| {
        let user = t.user.as_ref()?;
        match user.fd_table.get(fd).ok()? {
            FdSlot::File(h) => {
                *h.offset.lock() = pos;
                Some(0i64)
            }
            _ => None,
        }
    })
    .flatten()
    .unwrap_or(-1)
}

fn sys_tell(fd: i32) -> i64 {
    let tid = current();
    scheduler::with_thread(tid, |t| {
        let user = t.user.as_ref()?;
        match user.fd_table.get(fd).ok()? {
            FdSlot::File(h) => Some(*h.offset.lock() as i64),
            _ => None,
        }
    })
    .flatten()
    .unwrap_or(-1)
}

fn sys_close(fd: i32) -> i64 {
    let tid = current();
    scheduler::with_thread_mut(tid, |t| t.user.as_mut().map(|u| u.fd_table.close(fd)))
        .flatten()
        .map(|r| i64::from(r.is_ok()))
        .unwrap_or(-1)
}

fn sys_dup2(old: i32, new: i32) -> i64 {
    let tid = current();
    scheduler::with_thread_mut(tid, |t| t.user.as_mut().map(|u| u.fd_table.dup2(old, new)))
        .flatten()
        .map(|r: Result<i32, FdError>| r.map(i64::from).unwrap_or(-1))
        .unwrap_or(-1)
}

fn sys_mmap(addr: u64, length: usize, writable: bool, fd: i32, offset: usize) -> i64 {
    if addr == 0 || length == 0 || addr % 4096 != 0 || offset % 4096 != 0 {
        return 0;
    }
    let tid = current();
    let path = scheduler::with_thread(tid, |t| {
        let user = t.user.as_ref()?;
        match user.fd_table.get(fd).ok()? {
            FdSlot::File(h) => Some(h.path.clone()),
            _ => None,
        }
    })
    .flatten();
    let Some(path) = path else { return 0 };

    let file_size = match crate::fs::VFS.lock().lookup(&path) {
        Ok(inode) => inode.size,
        Err(_) => return 0,
    };

    let result = scheduler::with_thread_mut(tid, |t| {
        let user = t.user.as_mut()?;
        let p4 = user.address_space.p4_phys;
        match user.mmap_table.map(&mut user.spt, VirtAddr::new(addr), length, &path, offset, file_size, writable, p4) {
            Ok(()) => Some(addr),
            Err(MmapError::Overlaps) | Err(MmapError::Unaligned) | Err(MmapError::ZeroLength) | Err(MmapError::NotFound) => None,
        }
    })
    .flatten();

    result.unwrap_or(0) as i64
}

fn sys_munmap(addr: u64) -> i64 {
    let tid = current();
    scheduler::with_thread_mut(tid, |t| {
        let user = t.user.as_mut()?;
        Some(user.mmap_table.unmap(&mut user.spt, VirtAddr::new(addr), &user.address_space).is_ok())
    })
    .flatten()
    .map(i64::from)
    .unwrap_or(-1)
}

pub fn init() {
    crate::log_info!("syscall interface initialized ({} entries)", SYS_MUNMAP + 1);
}
