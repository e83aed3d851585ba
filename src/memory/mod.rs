pub mod frame_allocator;
pub mod paging;
pub mod swap;

use frame_allocator::BumpFrameAllocator;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::{structures::paging::OffsetPageTable, PhysAddr, VirtAddr};

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<BumpFrameAllocator> = Mutex::new(BumpFrameAllocator::new());
}

/// Physical memory is identity-mapped at boot (see `paging::phys_to_virt`),
/// so the kernel mapper itself never needs to move again after this call.
pub fn init(multiboot_info_addr: usize, config: &crate::config::KernelConfig) -> OffsetPageTable<'static> {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("failed to load multiboot2 info")
    };
    let memory_map_tag = boot_info.memory_map_tag().expect("memory map tag required");

    // Materialize the raw memory-area slice: `alloc` isn't available yet, so
    // we borrow directly from the boot_info pointer's (static) memory.
    let areas = memory_map_tag.memory_areas();
    let static_areas: &'static [multiboot2::MemoryArea] =
        unsafe { core::slice::from_raw_parts(areas.as_ptr(), areas.len()) };

    // Use the largest usable region reported by the bootloader for the
    // kernel-side bump allocator, leaving the first few MiB alone (kernel
    // image, stack, boot structures live there).
    let region = static_areas
        .iter()
        .max_by_key(|area| area.end_address() - area.start_address())
        .expect("no usable memory region reported by multiboot2");

    let reserve_below: u64 = 4 * 1024 * 1024;
    let start = PhysAddr::new(core::cmp::max(region.start_address(), reserve_below));
    let end = PhysAddr::new(region.end_address());

    let mut allocator = FRAME_ALLOCATOR.lock();
    unsafe { allocator.init(start, end) };
    crate::log_info!(
        "Physical memory frame allocator initialized over {:#x}..{:#x}",
        start.as_u64(),
        end.as_u64()
    );

    // Physical memory is identity-mapped (boot.asm maps the first 1 GiB),
    // so physical address 0 doubles as virtual address 0.
    let phys_mem_offset = VirtAddr::new(0);
    let mut mapper = unsafe { paging::init_paging(phys_mem_offset) };
    crate::log_info!("Paging subsystem initialized.");

    crate::allocator::init_heap(&mut mapper, &mut *allocator).expect("heap initialization failed");
    crate::log_info!("Kernel heap initialized.");

    let pool_frames = config.user_pool_pages.unwrap_or(2048);
    crate::vm::init(&mut allocator, pool_frames);

    let swap_slots = pool_frames * 2;
    swap::init(swap_slots);
    crate::log_info!("Swap table initialized with {} slots.", swap_slots);

    mapper
}
