//! 82093AA-style IOAPIC: 24 redirection entries behind the
//! IOREGSEL/IOWIN indirection window at `0xFEC00000`.
//!
//! The IOAPIC never talks to the LAPIC directly; delivered interrupts are
//! queued as routed bus messages that the platform interrupt complex drains
//! and hands to the LAPIC, and LAPIC EOIs for level-triggered vectors come
//! back through `remote_eoi`.

use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};
use corten_pc_constants::IOAPIC_MMIO_BASE;

use crate::apic::{BusMessage, DeliveryMode, TriggerMode};

pub const IOAPIC_PIN_COUNT: usize = 24;

const REDIR_MASKED: u64 = 1 << 16;
const REDIR_TRIGGER_LEVEL: u64 = 1 << 15;
const REDIR_REMOTE_IRR: u64 = 1 << 14;
const REDIR_DEST_LOGICAL: u64 = 1 << 11;

/// A message plus its destination field from the redirection entry.
#[derive(Debug, Clone, Copy)]
pub struct RoutedMessage {
    pub msg: BusMessage,
    pub dest: u8,
    pub logical: bool,
}

pub struct IoApic {
    id: u32,
    ioregsel: u32,
    redirection: [u64; IOAPIC_PIN_COUNT],
    pin_level: [bool; IOAPIC_PIN_COUNT],
    out: Vec<RoutedMessage>,
}

impl Default for IoApic {
    fn default() -> Self {
        Self::new()
    }
}

impl IoApic {
    pub fn new() -> Self {
        let mut ioapic = Self {
            id: 0,
            ioregsel: 0,
            redirection: [0; IOAPIC_PIN_COUNT],
            pin_level: [false; IOAPIC_PIN_COUNT],
            out: Vec::new(),
        };
        ioapic.reset();
        ioapic
    }

    pub fn reset(&mut self) {
        self.id = 0;
        self.ioregsel = 0;
        self.redirection = [REDIR_MASKED; IOAPIC_PIN_COUNT];
        self.pin_level = [false; IOAPIC_PIN_COUNT];
        self.out.clear();
    }

    pub fn take_messages(&mut self) -> Vec<RoutedMessage> {
        std::mem::take(&mut self.out)
    }

    pub fn redirection_entry(&self, pin: usize) -> u64 {
        self.redirection[pin]
    }

    fn deliver(&mut self, pin: usize) {
        let entry = self.redirection[pin];
        if entry & REDIR_MASKED != 0 {
            return;
        }
        let Some(mode) = DeliveryMode::from_bits((entry >> 8) as u32) else {
            tracing::debug!(target: "ioapic", pin, "reserved delivery mode; dropped");
            return;
        };
        let trigger = if entry & REDIR_TRIGGER_LEVEL != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        };
        if trigger == TriggerMode::Level {
            if entry & REDIR_REMOTE_IRR != 0 {
                // Awaiting remote EOI; no re-delivery.
                return;
            }
            self.redirection[pin] |= REDIR_REMOTE_IRR;
        }
        self.out.push(RoutedMessage {
            msg: BusMessage {
                vector: (entry & 0xFF) as u8,
                mode,
                trigger,
            },
            dest: (entry >> 56) as u8,
            logical: entry & REDIR_DEST_LOGICAL != 0,
        });
    }

    /// Pin assertion/deassertion. Edge entries deliver on the rising edge;
    /// level entries deliver while the line is high and remote-IRR is clear.
    pub fn set_irq(&mut self, pin: usize, high: bool) {
        if pin >= IOAPIC_PIN_COUNT {
            return;
        }
        let was_high = self.pin_level[pin];
        self.pin_level[pin] = high;
        if high && !was_high {
            self.deliver(pin);
        }
    }

    /// LAPIC EOI broadcast for a level-triggered vector: clears remote-IRR
    /// on every matching entry and re-delivers any line still asserted.
    pub fn remote_eoi(&mut self, vector: u8) {
        for pin in 0..IOAPIC_PIN_COUNT {
            let entry = self.redirection[pin];
            if entry & REDIR_REMOTE_IRR != 0
                && entry & REDIR_TRIGGER_LEVEL != 0
                && (entry & 0xFF) as u8 == vector
            {
                self.redirection[pin] &= !REDIR_REMOTE_IRR;
                if self.pin_level[pin] {
                    self.deliver(pin);
                }
            }
        }
    }

    fn reg_read(&self, reg: u32) -> u32 {
        match reg {
            0x00 => self.id,
            // Version 0x11, max redirection entry 23.
            0x01 => 0x11 | ((IOAPIC_PIN_COUNT as u32 - 1) << 16),
            0x02 => self.id << 24,
            0x10..=0x3F => {
                let pin = ((reg - 0x10) / 2) as usize;
                let entry = self.redirection[pin];
                if reg & 1 == 0 {
                    entry as u32
                } else {
                    (entry >> 32) as u32
                }
            }
            _ => {
                tracing::debug!(target: "ioapic", reg, "read of reserved register");
                u32::MAX
            }
        }
    }

    fn reg_write(&mut self, reg: u32, data: u32) {
        match reg {
            0x00 => self.id = data & 0x0F00_0000 | data & 0x0F,
            0x01 | 0x02 => {}
            0x10..=0x3F => {
                let pin = ((reg - 0x10) / 2) as usize;
                let entry = &mut self.redirection[pin];
                if reg & 1 == 0 {
                    // Remote-IRR and delivery status are read-only.
                    let keep = *entry & (REDIR_REMOTE_IRR | 1 << 12);
                    *entry = *entry & !0xFFFF_FFFF | data as u64 & !(REDIR_REMOTE_IRR | 1 << 12) | keep;
                } else {
                    *entry = *entry & 0xFFFF_FFFF | (data as u64) << 32;
                }
                // Unmasking a level line that is already high delivers.
                let e = self.redirection[pin];
                if e & REDIR_MASKED == 0
                    && e & REDIR_TRIGGER_LEVEL != 0
                    && self.pin_level[pin]
                    && e & REDIR_REMOTE_IRR == 0
                {
                    self.deliver(pin);
                }
            }
            _ => {
                tracing::debug!(target: "ioapic", reg, data, "write to reserved register");
            }
        }
    }

    pub fn mmio_read(&mut self, addr: u32) -> u32 {
        match addr.wrapping_sub(IOAPIC_MMIO_BASE) & 0xFF {
            0x00 => self.ioregsel,
            0x10 => self.reg_read(self.ioregsel & 0xFF),
            _ => u32::MAX,
        }
    }

    pub fn mmio_write(&mut self, addr: u32, data: u32) {
        match addr.wrapping_sub(IOAPIC_MMIO_BASE) & 0xFF {
            0x00 => self.ioregsel = data & 0xFF,
            0x10 => self.reg_write(self.ioregsel & 0xFF, data),
            _ => {}
        }
    }
}

impl IoSnapshot for IoApic {
    const NAME: &'static str = "ioapic";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        obj.put_u32("id", self.id);
        obj.put_u32("ioregsel", self.ioregsel);
        let mut redir = Vec::with_capacity(IOAPIC_PIN_COUNT * 8);
        for e in &self.redirection {
            redir.extend_from_slice(&e.to_le_bytes());
        }
        obj.put_bytes("redirection", &redir);
        let levels: Vec<u8> = self.pin_level.iter().map(|&b| b as u8).collect();
        obj.put_bytes("pin_level", &levels);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        self.id = state.get_u32("id");
        self.ioregsel = state.get_u32("ioregsel");
        if let Some(bytes) = state.bytes("redirection") {
            for (i, chunk) in bytes.chunks_exact(8).take(IOAPIC_PIN_COUNT).enumerate() {
                self.redirection[i] = u64::from_le_bytes(chunk.try_into().unwrap());
            }
        }
        if let Some(levels) = state.bytes("pin_level") {
            for (i, &b) in levels.iter().take(IOAPIC_PIN_COUNT).enumerate() {
                self.pin_level[i] = b != 0;
            }
        }
        self.out.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(ioapic: &mut IoApic, pin: u32, low: u32, high: u32) {
        ioapic.mmio_write(IOAPIC_MMIO_BASE, 0x10 + pin * 2);
        ioapic.mmio_write(IOAPIC_MMIO_BASE + 0x10, low);
        ioapic.mmio_write(IOAPIC_MMIO_BASE, 0x11 + pin * 2);
        ioapic.mmio_write(IOAPIC_MMIO_BASE + 0x10, high);
    }

    #[test]
    fn version_reports_24_entries() {
        let mut ioapic = IoApic::new();
        ioapic.mmio_write(IOAPIC_MMIO_BASE, 0x01);
        assert_eq!(ioapic.mmio_read(IOAPIC_MMIO_BASE + 0x10), 0x11 | 23 << 16);
    }

    #[test]
    fn edge_entry_delivers_once_per_rising_edge() {
        let mut ioapic = IoApic::new();
        program(&mut ioapic, 4, 0x40, 0);
        ioapic.set_irq(4, true);
        ioapic.set_irq(4, true); // still high; no new edge
        let msgs = ioapic.take_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg.vector, 0x40);
        assert_eq!(msgs[0].dest, 0);
        ioapic.set_irq(4, false);
        ioapic.set_irq(4, true);
        assert_eq!(ioapic.take_messages().len(), 1);
    }

    #[test]
    fn masked_entry_swallows_edges() {
        let mut ioapic = IoApic::new();
        program(&mut ioapic, 2, 0x42 | 1 << 16, 0);
        ioapic.set_irq(2, true);
        assert!(ioapic.take_messages().is_empty());
    }

    #[test]
    fn level_entry_holds_remote_irr_until_eoi() {
        let mut ioapic = IoApic::new();
        program(&mut ioapic, 9, 0x61 | 1 << 15, 0);
        ioapic.set_irq(9, true);
        let msgs = ioapic.take_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg.trigger, TriggerMode::Level);
        assert_ne!(ioapic.redirection_entry(9) & REDIR_REMOTE_IRR, 0);

        // No re-delivery while remote-IRR is pending.
        ioapic.set_irq(9, false);
        ioapic.set_irq(9, true);
        assert!(ioapic.take_messages().is_empty());

        // EOI with the line still high re-delivers immediately.
        ioapic.remote_eoi(0x61);
        assert_eq!(ioapic.take_messages().len(), 1);

        ioapic.set_irq(9, false);
        ioapic.remote_eoi(0x61);
        assert_eq!(ioapic.redirection_entry(9) & REDIR_REMOTE_IRR, 0);
        assert!(ioapic.take_messages().is_empty());
    }

    #[test]
    fn destination_field_is_carried_through() {
        let mut ioapic = IoApic::new();
        program(&mut ioapic, 10, 0x40 | 1 << 13, 1 << 24);
        ioapic.set_irq(10, true);
        let msgs = ioapic.take_messages();
        assert_eq!(msgs[0].dest, 1);
        assert!(!msgs[0].logical);
    }
}
