//! Intel 8259A programmable interrupt controller, as a master/slave pair
//! cascaded on IRQ 2.
//!
//! Interrupt flow without an APIC:
//!  - a device raises an IRQ, the owning controller latches it in IRR
//!  - a slave request pulses the master's IR2
//!  - if the request is unmasked and outranks everything in service, the
//!    master raises its INT output (the CPU's INTR line)
//!  - the CPU acknowledges when IF permits, which resolves the vector

use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};

pub const MASTER_CMD_PORT: u16 = 0x20;
pub const MASTER_DATA_PORT: u16 = 0x21;
pub const SLAVE_CMD_PORT: u16 = 0xA0;
pub const SLAVE_DATA_PORT: u16 = 0xA1;
pub const ELCR0_PORT: u16 = 0x4D0;
pub const ELCR1_PORT: u16 = 0x4D1;

const MASTER: usize = 0;
const SLAVE: usize = 1;
const CASCADE_IRQ: u8 = 2;

/// Reorders an 8-bit request mask so that priorities run 0..7 from bit 0.
/// With `priority_base == 7` (the reset state) this is the identity.
#[inline]
fn rol(value: u8, priority_base: u8) -> u8 {
    value.rotate_left((priority_base ^ 7) as u32)
}

#[derive(Default, Clone)]
struct Controller {
    vector_offset: u8,
    imr: u8,
    irr: u8,
    isr: u8,
    /// Raw input pin levels, for edge detection.
    pin_state: u8,
    icw: [u8; 5],
    icw_index: u8,
    ocw3: u8,
    read_isr: bool,
    autoeoi: bool,
    rotate_on_autoeoi: bool,
    /// Lowest-priority position; (base + 1) & 7 is the highest priority.
    priority_base: u8,
    in_initialization: bool,
    pending_irq: u8,
    elcr: u8,
}

impl Controller {
    fn reset(&mut self) {
        self.vector_offset = 0;
        self.imr = 0xFF;
        self.irr = 0;
        self.isr = 0;
        self.pin_state = 0;
        self.in_initialization = false;
        self.read_isr = false;
        self.elcr = 0;
    }

    /// Picks the next deliverable request, if any, honoring rotation,
    /// masking, in-service priority and special mask mode.
    fn evaluate(&mut self) -> Option<u8> {
        let unmasked = self.irr & !self.imr;
        if unmasked == 0 {
            return None;
        }
        let unmasked = rol(unmasked, self.priority_base);
        let isr = rol(self.isr, self.priority_base);

        if self.ocw3 & 0x60 == 0x60 {
            // Special mask mode: in-service bits do not block lower
            // priorities, they are simply excluded.
            let candidates = unmasked & !isr;
            for i in 0..8 {
                if candidates & (1 << i) != 0 {
                    let irq = (self.priority_base + 1 + i) & 7;
                    self.pending_irq = irq;
                    return Some(irq);
                }
            }
        } else {
            for i in 0..8 {
                if isr & (1 << i) != 0 {
                    // A higher-or-equal priority interrupt is in service.
                    return None;
                }
                if unmasked & (1 << i) != 0 {
                    let irq = (self.priority_base + 1 + i) & 7;
                    self.pending_irq = irq;
                    return Some(irq);
                }
            }
        }
        None
    }

    fn clear_highest_in_service(&mut self) {
        let highest = (self.priority_base + 1) & 7;
        for i in 0..8 {
            let mask = 1 << ((highest + i) & 7);
            if self.isr & mask != 0 {
                self.isr ^= mask;
                return;
            }
        }
    }

    fn write_icw(&mut self, id: u8, value: u8) {
        match id {
            1 => {
                self.icw_index = 2;
                self.icw[1] = value;
                self.imr = 0;
                self.isr = 0;
                self.irr = 0;
                self.priority_base = 7;
            }
            2 => {
                self.vector_offset = value & !7;
                self.icw[2] = value;
                self.icw_index = if self.icw[1] & 2 != 0 {
                    // Single-controller mode skips ICW3.
                    if self.icw[1] & 1 != 0 {
                        4
                    } else {
                        5
                    }
                } else {
                    3
                };
            }
            3 => {
                self.icw[3] = value;
                self.icw_index = 5 ^ (self.icw[1] & 1);
            }
            _ => {
                self.icw[4] = value;
                self.autoeoi = value & 2 != 0;
                self.icw_index = 5;
            }
        }
        self.in_initialization = self.icw_index != 5;
    }
}

/// Master/slave 8259 pair with the cascade wired on IR2.
pub struct PicPair {
    ctrl: [Controller; 2],
    /// State of the INT output toward the CPU.
    intr_output: bool,
    /// Set whenever the INT output goes high; the dispatcher drains it and
    /// breaks out of its run loop at the next instruction boundary.
    fast_return: bool,
    elcr_enabled: bool,
}

impl Default for PicPair {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PicPair {
    pub fn new(elcr_enabled: bool) -> Self {
        let mut pic = Self {
            ctrl: [Controller::default(), Controller::default()],
            intr_output: false,
            fast_return: false,
            elcr_enabled,
        };
        pic.reset();
        pic
    }

    pub fn reset(&mut self) {
        for c in &mut self.ctrl {
            c.reset();
        }
        self.intr_output = false;
        self.fast_return = false;
    }

    /// Programs both vector offsets directly; tests and firmware-free
    /// bring-up use this instead of the full ICW dance.
    pub fn set_offsets(&mut self, master: u8, slave: u8) {
        self.ctrl[MASTER].vector_offset = master & !7;
        self.ctrl[SLAVE].vector_offset = slave & !7;
        self.ctrl[MASTER].imr = 0;
        self.ctrl[SLAVE].imr = 0;
        self.ctrl[MASTER].priority_base = 7;
        self.ctrl[SLAVE].priority_base = 7;
    }

    pub fn intr_output(&self) -> bool {
        self.intr_output
    }

    /// Drains the fast-return request raised by a delivery edge.
    pub fn take_fast_return(&mut self) -> bool {
        std::mem::take(&mut self.fast_return)
    }

    pub fn irr(&self, ctrl: usize) -> u8 {
        self.ctrl[ctrl].irr
    }

    pub fn isr(&self, ctrl: usize) -> u8 {
        self.ctrl[ctrl].isr
    }

    pub fn imr(&self, ctrl: usize) -> u8 {
        self.ctrl[ctrl].imr
    }

    pub fn raise_irq(&mut self, irq: u8) {
        debug_assert!(irq < 16);
        let idx = (irq >= 8) as usize;
        let mask = 1 << (irq & 7);
        let c = &mut self.ctrl[idx];
        if c.pin_state & mask == 0 {
            c.pin_state |= mask;
            c.irr |= mask;
            self.update(idx);
        }
    }

    pub fn lower_irq(&mut self, irq: u8) {
        debug_assert!(irq < 16);
        let idx = (irq >= 8) as usize;
        let mask = 1 << (irq & 7);
        let c = &mut self.ctrl[idx];
        c.irr &= !mask;
        c.pin_state &= !mask;
        if idx == SLAVE && self.ctrl[SLAVE].irr == 0 {
            self.lower_irq(CASCADE_IRQ);
        }
    }

    /// Re-evaluates one controller and propagates toward the CPU (master)
    /// or the cascade pin (slave).
    fn update(&mut self, idx: usize) {
        if self.ctrl[idx].evaluate().is_some() {
            if idx == MASTER {
                if !self.intr_output {
                    self.intr_output = true;
                    self.fast_return = true;
                }
            } else {
                // Pulse the cascade line so the master sees an edge even if
                // a previous slave request was already pending.
                self.lower_irq(CASCADE_IRQ);
                self.raise_irq(CASCADE_IRQ);
            }
        }
    }

    /// The CPU's interrupt acknowledge cycle. Resolves and returns the
    /// vector, updating IRR/ISR. A request that vanished between delivery
    /// and acknowledge yields the spurious vector `offset | 7`.
    pub fn acknowledge(&mut self) -> u8 {
        self.intr_output = false;
        self.ack_controller(MASTER)
    }

    fn ack_controller(&mut self, idx: usize) -> u8 {
        let level = self.elcr_enabled && {
            let c = &self.ctrl[idx];
            c.elcr & (1 << c.pending_irq) != 0
        };
        let c = &mut self.ctrl[idx];
        let irq = c.pending_irq;
        let mask = 1 << irq;

        if c.irr & mask == 0 {
            return c.vector_offset | 7;
        }
        // Level-triggered requests stay latched until the line drops; edge
        // requests are consumed by the acknowledge.
        if !level {
            c.irr &= !mask;
        }
        if c.autoeoi {
            if c.rotate_on_autoeoi {
                c.priority_base = irq;
            }
        } else {
            c.isr |= mask;
        }
        let vector = c.vector_offset + irq;
        if idx == MASTER && irq == CASCADE_IRQ {
            self.ack_controller(SLAVE)
        } else {
            vector
        }
    }

    fn write_ocw2(&mut self, idx: usize, data: u8) {
        let rotate = data & 0x80 != 0;
        let specific = data & 0x40 != 0;
        let eoi = data & 0x20 != 0;
        let level = data & 7;
        if eoi {
            let c = &mut self.ctrl[idx];
            if specific {
                c.isr &= !(1 << level);
            } else {
                c.clear_highest_in_service();
            }
            if rotate {
                c.priority_base = level;
            }
            self.update(idx);
        } else if specific {
            if rotate {
                self.ctrl[idx].priority_base = level;
            }
        } else {
            self.ctrl[idx].rotate_on_autoeoi = rotate;
        }
    }

    fn write_ocw3(&mut self, idx: usize, data: u8) {
        let c = &mut self.ctrl[idx];
        c.ocw3 = data;
        if data & 2 != 0 {
            c.read_isr = data & 1 != 0;
        } else if data & 0x44 != 0 {
            tracing::debug!(target: "pic", data, "unimplemented OCW3 feature");
        }
    }

    pub fn io_write(&mut self, port: u16, data: u8) {
        match port {
            ELCR0_PORT | ELCR1_PORT => {
                self.ctrl[(port & 1) as usize].elcr = data;
                return;
            }
            _ => {}
        }
        let idx = (port >> 7 & 1) as usize;
        if port & 1 == 0 {
            match data >> 3 & 3 {
                0 => self.write_ocw2(idx, data),
                1 => self.write_ocw3(idx, data),
                _ => {
                    // ICW1: restart the initialization sequence.
                    let c = &mut self.ctrl[idx];
                    c.in_initialization = true;
                    c.imr = 0;
                    c.isr = 0;
                    c.irr = 0;
                    c.priority_base = 7;
                    c.autoeoi = false;
                    c.rotate_on_autoeoi = false;
                    self.intr_output = false;
                    self.ctrl[idx].write_icw(1, data);
                }
            }
        } else if self.ctrl[idx].in_initialization {
            let icw_index = self.ctrl[idx].icw_index;
            self.ctrl[idx].write_icw(icw_index, data);
        } else {
            // OCW1: interrupt mask. Unmasking may finally let a latched
            // request through, so re-evaluate.
            self.ctrl[idx].imr = data;
            self.update(idx);
        }
    }

    pub fn io_read(&mut self, port: u16) -> u8 {
        match port {
            ELCR0_PORT | ELCR1_PORT => return self.ctrl[(port & 1) as usize].elcr,
            _ => {}
        }
        let c = &self.ctrl[(port >> 7 & 1) as usize];
        if port & 1 != 0 {
            c.imr
        } else if c.read_isr {
            c.isr
        } else {
            c.irr
        }
    }
}

impl IoSnapshot for PicPair {
    const NAME: &'static str = "pic";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        for (i, c) in self.ctrl.iter().enumerate() {
            let mut co = StateObject::new();
            co.put_u8("vector_offset", c.vector_offset);
            co.put_u8("imr", c.imr);
            co.put_u8("irr", c.irr);
            co.put_u8("isr", c.isr);
            co.put_u8("pin_state", c.pin_state);
            co.put_bytes("icw", &c.icw);
            co.put_u8("icw_index", c.icw_index);
            co.put_u8("ocw3", c.ocw3);
            co.put_bool("read_isr", c.read_isr);
            co.put_bool("autoeoi", c.autoeoi);
            co.put_bool("rotate_on_autoeoi", c.rotate_on_autoeoi);
            co.put_u8("priority_base", c.priority_base);
            co.put_bool("in_initialization", c.in_initialization);
            co.put_u8("pending_irq", c.pending_irq);
            co.put_u8("elcr", c.elcr);
            obj.put_object(if i == MASTER { "master" } else { "slave" }, co);
        }
        obj.put_bool("intr_output", self.intr_output);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        for (i, c) in self.ctrl.iter_mut().enumerate() {
            let key = if i == MASTER { "master" } else { "slave" };
            let co = state
                .object(key)
                .ok_or(SnapshotError::Inconsistent("missing PIC controller"))?;
            c.vector_offset = co.get_u8("vector_offset");
            c.imr = co.get_u8("imr");
            c.irr = co.get_u8("irr");
            c.isr = co.get_u8("isr");
            c.pin_state = co.get_u8("pin_state");
            co.copy_into("icw", &mut c.icw);
            c.icw_index = co.get_u8("icw_index");
            c.ocw3 = co.get_u8("ocw3");
            c.read_isr = co.get_bool("read_isr");
            c.autoeoi = co.get_bool("autoeoi");
            c.rotate_on_autoeoi = co.get_bool("rotate_on_autoeoi");
            c.priority_base = co.get_u8("priority_base");
            c.in_initialization = co.get_bool("in_initialization");
            c.pending_irq = co.get_u8("pending_irq");
            c.elcr = co.get_u8("elcr");
        }
        self.intr_output = state.get_bool("intr_output");
        self.fast_return = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programmed_pair() -> PicPair {
        let mut pic = PicPair::new(true);
        // ICW1/2/3/4 on both controllers, offsets 0x08 and 0x70.
        pic.io_write(0x20, 0x11);
        pic.io_write(0x21, 0x08);
        pic.io_write(0x21, 0x04);
        pic.io_write(0x21, 0x01);
        pic.io_write(0xA0, 0x11);
        pic.io_write(0xA1, 0x70);
        pic.io_write(0xA1, 0x02);
        pic.io_write(0xA1, 0x01);
        pic
    }

    #[test]
    fn icw_sequence_programs_offsets_and_unmasks() {
        let pic = programmed_pair();
        assert_eq!(pic.ctrl[MASTER].vector_offset, 0x08);
        assert_eq!(pic.ctrl[SLAVE].vector_offset, 0x70);
        assert_eq!(pic.imr(MASTER), 0);
        assert!(!pic.ctrl[MASTER].in_initialization);
    }

    #[test]
    fn raise_then_lower_is_a_net_noop_on_irr() {
        let mut pic = programmed_pair();
        pic.io_write(0x21, 0xFF); // mask everything so nothing is consumed
        let before = (pic.irr(MASTER), pic.irr(SLAVE));
        pic.raise_irq(5);
        pic.lower_irq(5);
        assert_eq!((pic.irr(MASTER), pic.irr(SLAVE)), before);
    }

    #[test]
    fn master_irq_delivers_vector() {
        let mut pic = programmed_pair();
        pic.raise_irq(0);
        assert!(pic.intr_output());
        assert_eq!(pic.acknowledge(), 0x08);
        assert!(!pic.intr_output());
        // Edge request consumed; ISR holds IRQ 0 until EOI.
        assert_eq!(pic.irr(MASTER), 0);
        assert_eq!(pic.isr(MASTER), 1);
    }

    #[test]
    fn slave_irq_cascades_through_ir2() {
        let mut pic = programmed_pair();
        pic.raise_irq(8);
        assert!(pic.intr_output());
        assert_eq!(pic.acknowledge(), 0x70);
        assert_eq!(pic.isr(MASTER), 1 << 2);
        assert_eq!(pic.isr(SLAVE), 1 << 0);
    }

    #[test]
    fn masked_cascade_parks_request_in_master_irr() {
        let mut pic = programmed_pair();
        pic.io_write(0x21, 1 << 2); // mask IR2
        pic.raise_irq(8);
        assert!(!pic.intr_output());
        assert_eq!(pic.irr(MASTER) & (1 << 2), 1 << 2);

        pic.io_write(0x21, 0x00); // unmask; delivery resumes
        assert!(pic.intr_output());
        assert_eq!(pic.acknowledge(), 0x70);
    }

    #[test]
    fn spurious_vector_when_request_disappears() {
        let mut pic = programmed_pair();
        pic.raise_irq(3);
        assert!(pic.intr_output());
        pic.lower_irq(3);
        assert_eq!(pic.acknowledge(), 0x08 | 7);
    }

    #[test]
    fn in_service_blocks_lower_priority_until_eoi() {
        let mut pic = programmed_pair();
        pic.raise_irq(1);
        assert_eq!(pic.acknowledge(), 0x09);
        pic.raise_irq(4);
        // IRQ 4 ranks below the in-service IRQ 1.
        assert!(!pic.intr_output());
        pic.io_write(0x20, 0x20); // non-specific EOI
        assert!(pic.intr_output());
        assert_eq!(pic.acknowledge(), 0x0C);
    }

    #[test]
    fn rotate_on_eoi_moves_priority_base() {
        let mut pic = programmed_pair();
        pic.raise_irq(0);
        assert_eq!(pic.acknowledge(), 0x08);
        // Rotate-on-non-specific-EOI: priority base becomes 0, so IRQ 1 is
        // now the highest priority (base + 1).
        pic.io_write(0x20, 0xA0);
        assert_eq!(pic.ctrl[MASTER].priority_base, 0);
        pic.raise_irq(0);
        pic.raise_irq(1);
        assert_eq!(pic.acknowledge(), 0x09);
    }

    #[test]
    fn ocw3_selects_isr_readback() {
        let mut pic = programmed_pair();
        pic.raise_irq(6);
        pic.acknowledge();
        pic.io_write(0x20, 0x0B); // OCW3: read ISR
        assert_eq!(pic.io_read(0x20), 1 << 6);
        pic.io_write(0x20, 0x0A); // OCW3: read IRR
        assert_eq!(pic.io_read(0x20), 0);
    }

    #[test]
    fn elcr_level_irq_redelivers_until_lowered() {
        let mut pic = programmed_pair();
        pic.io_write(ELCR0_PORT, 1 << 5); // IRQ 5 level-triggered
        pic.raise_irq(5);
        assert_eq!(pic.acknowledge(), 0x0D);
        // Level request stays latched across the acknowledge.
        assert_eq!(pic.irr(MASTER) & (1 << 5), 1 << 5);
        pic.io_write(0x20, 0x20); // EOI, line still high: redelivers
        assert!(pic.intr_output());
        pic.lower_irq(5);
        pic.io_write(0x20, 0x20);
        assert!(pic.acknowledge() == 0x08 | 7 || !pic.intr_output());
    }
}
