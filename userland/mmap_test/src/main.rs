#![no_std]
#![no_main]

const PATH: &str = "/mmap_test.dat\0";
const MAP_ADDR: u64 = 0x4000_0000;

#[no_mangle]
pub extern "C" fn _start(_argc: u64, _argv: *const *const u8) -> ! {
    atomiclibc::create(PATH, 4096);
    let fd = atomiclibc::open(PATH);
    if fd < 0 {
        atomiclibc::puts("open failed\n");
        atomiclibc::exit(-1);
    }

    let message = b"mapped content";
    atomiclibc::write(fd, message);

    let mapped = atomiclibc::mmap(MAP_ADDR, 4096, true, fd, 0);
    if mapped == 0 {
        atomiclibc::puts("mmap failed\n");
        atomiclibc::exit(-1);
    }

    let region = unsafe { core::slice::from_raw_parts(mapped as *const u8, message.len()) };
    if region == message {
        atomiclibc::puts("mmap round-trip ok\n");
    } else {
        atomiclibc::puts("mmap round-trip mismatch\n");
    }

    atomiclibc::munmap(mapped);
    atomiclibc::close(fd);
    atomiclibc::exit(0);
}
