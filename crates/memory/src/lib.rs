//! Guest physical memory and the MMIO routing layer.
//!
//! `GuestRam` is the flat RAM buffer owned by the machine. `MmioRouter`
//! maps physical windows (the VGA hole, the LAPIC/IOAPIC pages, option-ROM
//! apertures, everything above top-of-RAM) onto device callbacks. The two
//! are combined by the platform into a physical memory view, which is what
//! the CPU bus and DMA talk to through the `MemoryBus` trait.

mod bus;
mod ram;
mod router;

pub use bus::MemoryBus;
pub use ram::GuestRam;
pub use router::{MmioHandler, MmioRouter};

/// Page size used for SMC tracking and the TLB.
pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_SHIFT: u32 = 12;
