#![no_std]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]

extern crate alloc;

pub mod allocator;
pub mod config;
pub mod vga;
pub mod serial;
pub mod interrupts;
pub mod memory;
pub mod scheduler;
pub mod vm;
pub mod process;
pub mod syscalls;
pub mod drivers;
pub mod fs;

use alloc::string::ToString;
use alloc::vec::Vec;
use core::panic::PanicInfo;

/// Kernel entry point, reached from the bootloader's 64-bit trampoline with
/// the physical address of the multiboot2 information structure in `rdi`.
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    vga::init();
    serial::init();
    interrupts::init();
    log_info!("kernel started");

    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("invalid multiboot2 info")
    };
    let cmdline = boot_info
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .unwrap_or("");
    let config = config::parse(cmdline).unwrap_or_else(|e| panic!("bad kernel command line: {}", e));

    let _mapper = memory::init(multiboot_info_addr, &config);
    log_info!("memory initialized");

    scheduler::init(&config);
    syscalls::init();
    drivers::init();
    fs::init();

    if config.format || needs_disk(&config) {
        fs::mount_fat32();
    }

    println!("teachos is running");
    x86_64::instructions::interrupts::enable();

    run_actions(&config);

    if config.power_off {
        syscalls::halt();
    }

    loop {
        x86_64::instructions::hlt();
    }
}

fn needs_disk(config: &config::KernelConfig) -> bool {
    config
        .actions
        .iter()
        .any(|a| matches!(a, config::Action::Put(_) | config::Action::Get(_)))
}

/// Execute the boot-time actions in order. There is no interactive shell:
/// each action runs once, synchronously, before the kernel either powers
/// off (`-q`) or falls into the idle halt loop.
fn run_actions(config: &config::KernelConfig) {
    for action in &config.actions {
        match action {
            config::Action::Run(cmdline) => run_action(cmdline),
            config::Action::Ls => ls_action(),
            config::Action::Cat(path) => cat_action(path),
            config::Action::Rm(path) => rm_action(path),
            config::Action::Put(path) => put_action(path),
            config::Action::Get(path) => get_action(path),
        }
    }
}

fn run_action(cmdline: &str) {
    let parts: Vec<&str> = cmdline.split_whitespace().collect();
    let Some(&prog) = parts.first() else {
        log_warn!("run: empty command line");
        return;
    };

    match process::create_initial_process(prog, &parts[1..]) {
        Ok(tid) => {
            let status = process::wait_for_boot_process(tid);
            println!("{}: exit({})", prog, status);
        }
        Err(e) => {
            println!("{}: {}", prog, e);
        }
    }
}

fn ls_action() {
    let vfs = fs::VFS.lock();
    match vfs.readdir("/") {
        Ok(entries) => {
            for entry in entries {
                println!("{}", entry.name);
            }
        }
        Err(e) => println!("ls: {}", e),
    }
}

fn cat_action(path: &str) {
    let abs = to_abs_path(path);
    let vfs = fs::VFS.lock();
    let size = match vfs.lookup(&abs) {
        Ok(inode) => inode.size,
        Err(e) => {
            println!("cat: {}: {}", path, e);
            return;
        }
    };
    let mut buf = alloc::vec![0u8; size];
    match vfs.read_file(&abs, 0, &mut buf) {
        Ok(n) => {
            let text = core::str::from_utf8(&buf[..n]).unwrap_or("<binary>");
            print!("{}", text);
        }
        Err(e) => println!("cat: {}: {}", path, e),
    }
}

fn rm_action(path: &str) {
    let abs = to_abs_path(path);
    let mut vfs = fs::VFS.lock();
    if let Err(e) = vfs.unlink(&abs) {
        println!("rm: {}: {}", path, e);
    }
}

/// Copy a ramfs file to the mounted FAT32 disk at `/disk/<name>`.
fn put_action(path: &str) {
    let abs = to_abs_path(path);
    let mut vfs = fs::VFS.lock();
    let size = match vfs.lookup(&abs) {
        Ok(inode) => inode.size,
        Err(e) => {
            println!("put: {}: {}", path, e);
            return;
        }
    };
    let mut buf = alloc::vec![0u8; size];
    if let Err(e) = vfs.read_file(&abs, 0, &mut buf) {
        println!("put: {}: {}", path, e);
        return;
    }
    let dest = alloc::format!("/disk/{}", path.trim_start_matches('/'));
    let _ = vfs.create(&dest);
    if let Err(e) = vfs.write_file(&dest, &buf) {
        println!("put: {}: {}", path, e);
    }
}

/// Copy a file off the mounted FAT32 disk into ramfs at `/<name>`.
fn get_action(path: &str) {
    let src = alloc::format!("/disk/{}", path.trim_start_matches('/'));
    let mut vfs = fs::VFS.lock();
    let size = match vfs.lookup(&src) {
        Ok(inode) => inode.size,
        Err(e) => {
            println!("get: {}: {}", path, e);
            return;
        }
    };
    let mut buf = alloc::vec![0u8; size];
    if let Err(e) = vfs.read_file(&src, 0, &mut buf) {
        println!("get: {}: {}", path, e);
        return;
    }
    let dest = to_abs_path(path);
    let _ = vfs.create(&dest);
    if let Err(e) = vfs.write_file(&dest, &buf) {
        println!("get: {}: {}", path, e);
    }
}

fn to_abs_path(path: &str) -> alloc::string::String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        alloc::format!("/{}", path)
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
