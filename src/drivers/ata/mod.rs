pub mod pio;

use pio::AtaDevice;
use spin::Mutex;
use lazy_static::lazy_static;

lazy_static! {
    pub static ref PRIMARY_ATA: Mutex<AtaDevice> = Mutex::new(AtaDevice::new(0x1F0, 0x3F6, true));
    /// Secondary channel, master drive: dedicated swap backing store.
    pub static ref SWAP_DISK: Mutex<AtaDevice> = Mutex::new(AtaDevice::new(0x170, 0x376, true));
}

pub fn init() {
    let mut dev = PRIMARY_ATA.lock();
    if dev.identify().is_ok() {
        crate::log_info!("ATA PIO: Primary master disk detected.");
    } else {
        crate::log_warn!("ATA PIO: No disk detected.");
    }
    drop(dev);

    let mut swap = SWAP_DISK.lock();
    if swap.identify().is_ok() {
        crate::log_info!("ATA PIO: Swap disk detected on secondary channel.");
    } else {
        crate::log_warn!("ATA PIO: No swap disk detected; swapping will fail if attempted.");
    }
}
