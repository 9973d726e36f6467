//! PC platform assembly: every chipset device wired to its canonical
//! ports and MMIO windows, the device scheduler, reset broadcast, and the
//! CPU's bus view (`PcCpuBus`).

mod adapters;
mod bus;
mod pam;
mod platform;

pub use bus::{PcCpuBus, PlatformIntrCtrl};
pub use pam::PamState;
pub use platform::{PcPlatform, PcPlatformConfig};
pub use corten_platform::ResetEvent;

pub use corten_pc_constants::{IOAPIC_MMIO_BASE, LAPIC_MMIO_BASE, VBE_LFB_BASE};
