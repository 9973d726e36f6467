//! The platform interrupt complex: one 8259 pair, one local APIC and one
//! IOAPIC behind a single facade.
//!
//! Devices raise [`InterruptInput`]s here; the facade fans an ISA IRQ out
//! to both the PIC and the IOAPIC (matching real chipset wiring, where the
//! 8259 inputs and IOAPIC pins are fed in parallel), carries IOAPIC bus
//! messages into the LAPIC, and routes LAPIC EOI broadcasts back. The CPU
//! sees only three things: the INTR level, the NMI level, and an
//! acknowledge cycle that resolves a vector.

use corten_interrupts::apic::{BusMessage, DeliveryMode, TriggerMode};
use corten_interrupts::{IoApic, LocalApic, PicPair};
use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformInterruptMode {
    /// Legacy: 8259 vectors reach the CPU directly.
    Pic,
    /// IOAPIC routes to the LAPIC; the 8259 survives as virtual-wire.
    Apic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptInput {
    /// Legacy ISA line 0..=15 (fans out to PIC and the matching IOAPIC pin).
    IsaIrq(u8),
    /// Raw IOAPIC pin.
    Gsi(u32),
}

/// ISA IRQ 0 arrives on IOAPIC pin 2 by PC convention; everything else is
/// wired identity.
fn isa_to_gsi(irq: u8) -> u32 {
    match irq {
        0 => 2,
        n => n as u32,
    }
}

pub struct PlatformInterrupts {
    mode: PlatformInterruptMode,
    pic: PicPair,
    lapic: LocalApic,
    ioapic: IoApic,
    nmi_pending: bool,
}

impl PlatformInterrupts {
    pub fn new(apic_enabled: bool) -> Self {
        Self {
            mode: PlatformInterruptMode::Pic,
            pic: PicPair::new(true),
            lapic: LocalApic::new(apic_enabled),
            ioapic: IoApic::new(),
            nmi_pending: false,
        }
    }

    pub fn reset(&mut self) {
        self.pic.reset();
        self.lapic.reset();
        self.ioapic.reset();
        self.nmi_pending = false;
        self.mode = PlatformInterruptMode::Pic;
    }

    pub fn mode(&self) -> PlatformInterruptMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PlatformInterruptMode) {
        self.mode = mode;
    }

    pub fn pic(&self) -> &PicPair {
        &self.pic
    }

    pub fn pic_mut(&mut self) -> &mut PicPair {
        &mut self.pic
    }

    pub fn lapic(&self) -> &LocalApic {
        &self.lapic
    }

    pub fn lapic_mut(&mut self) -> &mut LocalApic {
        &mut self.lapic
    }

    pub fn ioapic_mut(&mut self) -> &mut IoApic {
        &mut self.ioapic
    }

    pub fn raise_irq(&mut self, input: InterruptInput) {
        match input {
            InterruptInput::IsaIrq(irq) => {
                self.pic.raise_irq(irq);
                self.ioapic.set_irq(isa_to_gsi(irq) as usize, true);
            }
            InterruptInput::Gsi(gsi) => self.ioapic.set_irq(gsi as usize, true),
        }
        self.pump_ioapic();
    }

    pub fn lower_irq(&mut self, input: InterruptInput) {
        match input {
            InterruptInput::IsaIrq(irq) => {
                self.pic.lower_irq(irq);
                self.ioapic.set_irq(isa_to_gsi(irq) as usize, false);
            }
            InterruptInput::Gsi(gsi) => self.ioapic.set_irq(gsi as usize, false),
        }
        self.pump_ioapic();
    }

    pub fn raise_nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending) | self.lapic.take_pending_nmi()
    }

    /// Non-destructive view of the NMI line.
    pub fn nmi_line(&self) -> bool {
        self.nmi_pending || self.lapic.nmi_pending()
    }

    /// Drains any queued IOAPIC messages; callers that poke the IOAPIC
    /// registers directly use this to complete delivery.
    pub fn pump(&mut self) {
        self.pump_ioapic();
    }

    /// Moves queued IOAPIC bus messages into the LAPIC (single-CPU: only
    /// physical destination 0 or broadcast is accepted).
    fn pump_ioapic(&mut self) {
        for routed in self.ioapic.take_messages() {
            if !self.lapic.enabled() {
                continue;
            }
            let accept = routed.logical
                || routed.dest == 0xFF
                || routed.dest as u32 == self.lapic.id() >> 24
                || routed.dest as u32 == self.lapic.id();
            if !accept {
                tracing::debug!(target: "ioapic", dest = routed.dest, "message for absent APIC dropped");
                continue;
            }
            match routed.msg.mode {
                DeliveryMode::ExtInt => {
                    // Vector comes from the 8259 at acknowledge time; the
                    // PIC INTR output already covers delivery.
                }
                _ => self.lapic.receive_bus_message(routed.msg),
            }
        }
    }

    /// LAPIC MMIO access wrappers; EOI broadcasts are routed back into the
    /// IOAPIC synchronously, and any re-delivery is pumped forward again.
    pub fn lapic_mmio_write(&mut self, addr: u32, data: u32, now: u64) {
        self.lapic.mmio_write(addr, data, now);
        self.finish_lapic_access();
    }

    pub fn lapic_mmio_write8(&mut self, addr: u32, data: u8, now: u64) {
        self.lapic.mmio_write8(addr, data, now);
        self.finish_lapic_access();
    }

    pub fn lapic_mmio_read(&mut self, addr: u32, now: u64) -> u32 {
        self.lapic.mmio_read(addr, now)
    }

    fn finish_lapic_access(&mut self) {
        for vector in self.lapic.take_eoi_broadcasts() {
            self.ioapic.remote_eoi(vector);
        }
        self.pump_ioapic();
    }

    /// Fires the APIC timer if due; returns ticks until its next event.
    pub fn apic_timer_deadline(&mut self, now: u64) -> Option<u64> {
        let next = self.lapic.next_deadline(now);
        self.pump_ioapic();
        next
    }

    /// Level of the INTR pin as the CPU sees it.
    pub fn intr_asserted(&self) -> bool {
        self.lapic.intr_output() || self.pic.intr_output()
    }

    /// The interrupt-acknowledge cycle. The APIC wins when it has a vector
    /// pending; otherwise the acknowledge resolves through the 8259 pair.
    pub fn acknowledge(&mut self) -> u8 {
        if self.lapic.intr_output() {
            self.lapic.acknowledge()
        } else {
            self.pic.acknowledge()
        }
    }

    /// Drains the request to break the CPU out of its run loop.
    pub fn take_fast_return(&mut self) -> bool {
        let a = self.pic.take_fast_return();
        let b = self.lapic.take_fast_return();
        a || b
    }

    pub fn take_init_request(&mut self) -> bool {
        self.lapic.take_pending_init()
    }

    /// Test/diagnostic view: the vector the CPU would get if it acknowledged
    /// right now, without disturbing controller state.
    pub fn pending_vector_hint(&self) -> Option<u8> {
        if self.lapic.intr_output() {
            self.lapic.pending_vector()
        } else if self.pic.intr_output() {
            Some(0) // PIC vector is only resolved by a real acknowledge
        } else {
            None
        }
    }
}

impl IoSnapshot for PlatformInterrupts {
    const NAME: &'static str = "interrupts";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        obj.put_u8(
            "mode",
            match self.mode {
                PlatformInterruptMode::Pic => 0,
                PlatformInterruptMode::Apic => 1,
            },
        );
        obj.put_bool("nmi_pending", self.nmi_pending);
        obj.put_object("pic", self.pic.save_state());
        obj.put_object("lapic", self.lapic.save_state());
        obj.put_object("ioapic", self.ioapic.save_state());
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        self.mode = if state.get_u8("mode") == 1 {
            PlatformInterruptMode::Apic
        } else {
            PlatformInterruptMode::Pic
        };
        self.nmi_pending = state.get_bool("nmi_pending");
        if let Some(o) = state.object("pic") {
            self.pic.load_state(o)?;
        }
        if let Some(o) = state.object("lapic") {
            self.lapic.load_state(o)?;
        }
        if let Some(o) = state.object("ioapic") {
            self.ioapic.load_state(o)?;
        }
        Ok(())
    }
}

/// Convenience capability handed to a device that owns one ISA line.
#[derive(Clone)]
pub struct IrqLine {
    interrupts: std::rc::Rc<std::cell::RefCell<PlatformInterrupts>>,
    irq: u8,
}

impl IrqLine {
    pub fn new(
        interrupts: std::rc::Rc<std::cell::RefCell<PlatformInterrupts>>,
        irq: u8,
    ) -> Self {
        Self { interrupts, irq }
    }

    pub fn irq(&self) -> u8 {
        self.irq
    }

    pub fn raise(&self) {
        self.interrupts
            .borrow_mut()
            .raise_irq(InterruptInput::IsaIrq(self.irq));
    }

    pub fn lower(&self) {
        self.interrupts
            .borrow_mut()
            .lower_irq(InterruptInput::IsaIrq(self.irq));
    }

    /// Edge pulse: lower-then-raise so back-to-back events are distinct.
    pub fn pulse(&self) {
        self.lower();
        self.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corten_pc_constants::{IOAPIC_MMIO_BASE, LAPIC_MMIO_BASE};

    #[test]
    fn isa_irq_reaches_cpu_through_pic() {
        let mut ints = PlatformInterrupts::new(true);
        ints.pic_mut().set_offsets(0x20, 0x28);
        ints.raise_irq(InterruptInput::IsaIrq(1));
        assert!(ints.intr_asserted());
        assert!(ints.take_fast_return());
        assert_eq!(ints.acknowledge(), 0x21);
    }

    #[test]
    fn gsi_routes_through_ioapic_to_lapic() {
        let mut ints = PlatformInterrupts::new(true);
        // Program IOAPIC pin 10 -> vector 0x40, unmasked, edge, dest 0.
        ints.ioapic_mut().mmio_write(IOAPIC_MMIO_BASE, 0x10 + 10 * 2);
        ints.ioapic_mut().mmio_write(IOAPIC_MMIO_BASE + 0x10, 0x40);
        ints.raise_irq(InterruptInput::Gsi(10));
        ints.lower_irq(InterruptInput::Gsi(10));
        assert!(ints.intr_asserted());
        assert_eq!(ints.acknowledge(), 0x40);
    }

    #[test]
    fn level_gsi_redelivers_after_lapic_eoi() {
        let mut ints = PlatformInterrupts::new(true);
        ints.ioapic_mut().mmio_write(IOAPIC_MMIO_BASE, 0x10 + 5 * 2);
        ints.ioapic_mut()
            .mmio_write(IOAPIC_MMIO_BASE + 0x10, 0x60 | 1 << 15);
        ints.raise_irq(InterruptInput::Gsi(5));
        assert_eq!(ints.acknowledge(), 0x60);

        // Line still asserted: EOI must bounce the vector straight back.
        ints.lapic_mmio_write(LAPIC_MMIO_BASE + 0xB0, 0, 0);
        assert!(ints.intr_asserted());
        assert_eq!(ints.acknowledge(), 0x60);

        ints.lower_irq(InterruptInput::Gsi(5));
        ints.lapic_mmio_write(LAPIC_MMIO_BASE + 0xB0, 0, 0);
        assert!(!ints.intr_asserted());
    }

    #[test]
    fn apic_vector_wins_over_pic_at_acknowledge() {
        let mut ints = PlatformInterrupts::new(true);
        ints.pic_mut().set_offsets(0x20, 0x28);
        ints.raise_irq(InterruptInput::IsaIrq(3));
        ints.lapic_mut().receive_bus_message(BusMessage {
            vector: 0x91,
            mode: DeliveryMode::Fixed,
            trigger: TriggerMode::Edge,
        });
        assert_eq!(ints.acknowledge(), 0x91);
        // The PIC request is still there for the next acknowledge.
        assert!(ints.intr_asserted());
        assert_eq!(ints.acknowledge(), 0x23);
    }
}
