//! Platform glue below the devices: the port I/O bus, the A20 gate, the
//! reset-event plumbing, and the interrupt complex that arbitrates between
//! the legacy PIC pair and the APICs on their way to the CPU's INTR pin.

pub mod a20;
pub mod interrupts;
pub mod io;
pub mod reset;

pub use a20::A20Gate;
pub use interrupts::{InterruptInput, PlatformInterruptMode, PlatformInterrupts};
pub use io::{IoPortBus, PortIoDevice};
pub use reset::{ResetEvent, ResetEvents};
