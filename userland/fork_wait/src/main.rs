#![no_std]
#![no_main]

#[no_mangle]
pub extern "C" fn _start(_argc: u64, _argv: *const *const u8) -> ! {
    let pid = atomiclibc::fork();
    if pid < 0 {
        atomiclibc::puts("fork failed\n");
        atomiclibc::exit(-1);
    }

    if pid == 0 {
        atomiclibc::puts("child: running\n");
        atomiclibc::exit(42);
    }

    atomiclibc::puts("parent: waiting\n");
    let status = atomiclibc::wait(pid);

    if status == 42 {
        atomiclibc::puts("parent: child exited with expected status\n");
        atomiclibc::exit(0);
    }
    atomiclibc::puts("parent: unexpected child status\n");
    atomiclibc::exit(-1);
}
