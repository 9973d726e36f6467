//! Interrupt controllers: the legacy 8259 pair, the local APIC, and the
//! IOAPIC. These are pure register-level state machines; the platform's
//! interrupt complex owns one of each and carries bus messages between
//! them, so no controller ever holds a pointer into another component.

pub mod apic;
pub mod ioapic;
pub mod pic;

pub use apic::{BusMessage, DeliveryMode, LocalApic, TriggerMode};
pub use ioapic::IoApic;
pub use pic::PicPair;
