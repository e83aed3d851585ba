#![no_std]
#![no_main]

use atomiclibc::Args;

#[no_mangle]
pub extern "C" fn _start(argc: u64, argv: *const *const u8) -> ! {
    let mut args = unsafe { Args::new(argc, argv) };
    let _prog = args.next();

    atomiclibc::puts("hello");
    for arg in args {
        atomiclibc::puts(" ");
        atomiclibc::puts(arg);
    }
    atomiclibc::puts("\n");

    atomiclibc::exit(0);
}
