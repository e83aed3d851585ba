/// Usermode support — int 0x80 syscall handler and Ring 3 transition.

use core::arch::naked_asm;
use core::sync::atomic::{AtomicU64, Ordering};

/// The full Ring-3 register file captured at `int 0x80` entry, laid out to
/// exactly overlay `syscall_handler_asm`'s stack frame (see the offsets
/// used there). `rax` is the syscall number on entry; `fork` clones this
/// struct, forces `rax` to 0, and hands it to the child so the child can
/// resume mid-instruction instead of restarting at the program's entry
/// point.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Trapframe {
    pub rax: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Points at the trapframe `syscall_handler_asm` most recently saved, valid
/// only for the duration of the syscall in flight: the `int 0x80` gate is an
/// interrupt gate (IF cleared on entry), and dispatch doesn't block before a
/// syscall that needs it (`fork`) reads it, so there is never more than one
/// live writer on this single-core kernel.
static CURRENT_TRAPFRAME: AtomicU64 = AtomicU64::new(0);

extern "C" fn record_trapframe(ptr: u64) {
    CURRENT_TRAPFRAME.store(ptr, Ordering::Relaxed);
}

/// Clone the trapframe of the syscall currently being handled on this core.
/// Only meaningful when called from inside a `sys_*` function.
pub fn current_trapframe() -> Trapframe {
    let ptr = CURRENT_TRAPFRAME.load(Ordering::Relaxed) as *const Trapframe;
    unsafe { *ptr }
}

/// The int 0x80 handler — entered from Ring 3.
/// Saves user registers, calls Rust syscall dispatcher, restores and iretq back.
///
/// Convention: RAX=syscall number, RDI=arg0, RSI=arg1, RDX=arg2, R10=arg3, R8=arg4
/// (R10 stands in for RCX, which `int` itself doesn't clobber but which we
/// need free to shuffle arguments into the Rust calling convention).
/// Returns: RAX=result
#[unsafe(naked)]
pub extern "C" fn syscall_handler_asm() {
    naked_asm!(
        // Save all general-purpose registers, including rax (the syscall
        // number), so the stack holds a complete Trapframe. 15 pushes here
        // plus the 5 the CPU already pushed (SS/RSP/RFLAGS/CS/RIP) = 20
        // qwords = 160 bytes, already 16-byte aligned — no padding needed.
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbx",
        "push rcx",
        "push rax",

        "mov rdi, rsp",
        "call {record_trapframe}",

        // Reload the syscall args from the saved frame rather than trusting
        // the registers survived the call above.
        "mov rax, [rsp + 0x00]",   // syscall number
        "mov rdi, [rsp + 0x18]",   // arg0
        "mov rsi, [rsp + 0x20]",   // arg1
        "mov rdx, [rsp + 0x28]",   // arg2
        "mov r10, [rsp + 0x48]",   // arg3
        "mov r8,  [rsp + 0x38]",   // arg4

        // Call Rust dispatcher: dispatch(rax, rdi, rsi, rdx, r10, r8)
        // System V ABI param regs: rdi, rsi, rdx, rcx, r8, r9.
        // Shuffle high to low so each source is read before it's clobbered.
        "mov r9, r8",     // arg4(was r8) → r9 (6th param)
        "mov r8, r10",    // arg3(was r10) → r8 (5th param)
        "mov rcx, rdx",   // arg2(was rdx) → rcx (4th param)
        "mov rdx, rsi",   // arg1(was rsi) → rdx (3rd param)
        "mov rsi, rdi",   // arg0(was rdi) → rsi (2nd param)
        "mov rdi, rax",   // number(was rax) → rdi (1st param)
        "call {dispatch}",

        // Overwrite the saved rax slot with the real return value, so the
        // final pop below restores it instead of the stale syscall number.
        "mov [rsp + 0x00], rax",

        "pop rax",
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",

        "iretq",
        record_trapframe = sym record_trapframe,
        dispatch = sym crate::syscalls::dispatch,
    );
}

/// Resume a thread at the exact point a `Trapframe` describes, forging the
/// iretq frame and register file from the struct instead of a live stack.
/// Used to land a forked child back in user mode mid-instruction, with the
/// same registers its parent had at the `fork()` syscall except `rax`
/// (forced to 0 by `process::fork`).
///
/// # Safety
/// `frame` must describe a valid Ring-3 return: a canonical `rip`/`rsp` and
/// a `cs`/`ss` pair the GDT actually has entries for.
#[unsafe(naked)]
pub unsafe extern "C" fn resume_trapframe(frame: *const Trapframe) -> ! {
    naked_asm!(
        // rdi = frame ptr. Build the iretq frame on our own (fresh) stack
        // first, then load the GPRs, touching rdi last since we're reading
        // through it.
        "push [rdi + 0x98]",   // ss
        "push [rdi + 0x90]",   // rsp (user)
        "push [rdi + 0x88]",   // rflags
        "push [rdi + 0x80]",   // cs
        "push [rdi + 0x78]",   // rip

        "mov rax, [rdi + 0x00]",
        "mov rcx, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov rsi, [rdi + 0x20]",
        "mov rdx, [rdi + 0x28]",
        "mov rbp, [rdi + 0x30]",
        "mov r8,  [rdi + 0x38]",
        "mov r9,  [rdi + 0x40]",
        "mov r10, [rdi + 0x48]",
        "mov r11, [rdi + 0x50]",
        "mov r12, [rdi + 0x58]",
        "mov r13, [rdi + 0x60]",
        "mov r14, [rdi + 0x68]",
        "mov r15, [rdi + 0x70]",
        "mov rdi, [rdi + 0x18]",

        "iretq",
    );
}

/// Jump to Ring 3 and execute user code, with `rdi`/`rsi` preloaded to
/// `argc`/`argv` per the calling convention a freshly exec'd process expects
/// at its entry point.
/// Pushes the iretq frame: SS, RSP, RFLAGS, CS, RIP.
pub fn jump_to_usermode(
    entry: u64,
    user_stack_top: u64,
    user_cs: u16,
    user_ss: u16,
    argc: u64,
    argv_addr: u64,
) -> ! {
    unsafe {
        core::arch::asm!(
            "cli",                  // Disable interrupts during transition
            "push rax",             // SS (user data segment)
            "push r9",              // RSP (user stack)
            "pushfq",               // RFLAGS — will set IF below
            "pop r11",
            "or r11, 0x200",        // Set IF (interrupt enable)
            "push r11",
            "push r10",             // CS (user code segment)
            "push r8",              // RIP (entry point)
            "iretq",
            in("r8") entry,
            in("r9") user_stack_top,
            in("r10") user_cs as u64,
            in("rax") user_ss as u64,
            in("rdi") argc,
            in("rsi") argv_addr,
            options(noreturn),
        );
    }
}
