//! Intel 8254 programmable interval timer.
//!
//! Channel 0 drives IRQ 0, channel 1 models DRAM refresh (only its output
//! toggle is observable through port 0x61), channel 2 feeds the speaker
//! gate. Modes 0, 2 and 3 are implemented; they are the only modes PC
//! firmware and the supported guests program.

use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};
use corten_platform::interrupts::IrqLine;
use corten_platform::PortIoDevice;

use crate::clock::Clock;

pub const PIT_CH0_PORT: u16 = 0x40;
pub const PIT_CTRL_PORT: u16 = 0x43;
pub const SYSTEM_CTRL_PORT: u16 = 0x61;

pub const PIT_HZ: u64 = 1_193_182;
const NS_PER_SEC: u128 = 1_000_000_000;

#[inline]
fn ticks_to_ns(ticks: u64) -> u64 {
    (ticks as u128 * NS_PER_SEC / PIT_HZ as u128) as u64
}

#[inline]
fn ns_to_ticks(ns: u64) -> u64 {
    (ns as u128 * PIT_HZ as u128 / NS_PER_SEC) as u64
}

#[derive(Default, Clone)]
struct Channel {
    reload: u16, // 0 encodes 65536
    mode: u8,
    bcd: bool,
    access: u8, // 1 = lobyte, 2 = hibyte, 3 = lobyte/hibyte
    write_hi: bool,
    read_hi: bool,
    latched_count: Option<u16>,
    latched_status: Option<u8>,
    partial_reload: u8,
    armed: bool,
    start_ns: u64,
    next_fire_ns: u64,
    gate: bool,
    output: bool,
}

impl Channel {
    fn period_ticks(&self) -> u64 {
        if self.reload == 0 {
            65536
        } else {
            self.reload as u64
        }
    }

    fn period_ns(&self) -> u64 {
        ticks_to_ns(self.period_ticks())
    }

    fn current_count(&self, now_ns: u64) -> u16 {
        if !self.armed {
            return self.reload;
        }
        let elapsed = ns_to_ticks(now_ns.saturating_sub(self.start_ns));
        let n = self.period_ticks();
        match self.mode {
            0 => n.saturating_sub(elapsed) as u16,
            _ => (n - elapsed % n) as u16,
        }
    }

    fn status(&self, now_ns: u64) -> u8 {
        let _ = now_ns;
        (self.output as u8) << 7
            | (self.access & 3) << 4
            | (self.mode & 7) << 1
            | self.bcd as u8
    }

    fn arm(&mut self, now_ns: u64) {
        self.armed = true;
        self.start_ns = now_ns;
        self.next_fire_ns = now_ns + self.period_ns();
        self.output = self.mode != 0;
    }
}

pub struct Pit {
    channels: [Channel; 3],
    clock: Clock,
    irq0: IrqLine,
    /// Port 0x61 latch: bit 0 channel-2 gate, bit 1 speaker data.
    system_ctrl: u8,
    refresh_toggle: bool,
}

impl Pit {
    pub fn new(clock: Clock, irq0: IrqLine) -> Self {
        let mut pit = Self {
            channels: Default::default(),
            clock,
            irq0,
            system_ctrl: 0,
            refresh_toggle: false,
        };
        pit.reset();
        pit
    }

    pub fn reset(&mut self) {
        for ch in &mut self.channels {
            *ch = Channel::default();
            ch.access = 3;
            ch.output = true;
        }
        self.channels[2].gate = false;
        self.system_ctrl = 0;
        self.refresh_toggle = false;
    }

    /// Fires channel 0 if its deadline has passed; returns ns to its next
    /// interrupt.
    pub fn next_deadline(&mut self, now_ns: u64) -> Option<u64> {
        let ch = &mut self.channels[0];
        if !ch.armed {
            return None;
        }
        if ch.next_fire_ns <= now_ns {
            self.irq0.pulse();
            let ch = &mut self.channels[0];
            match ch.mode {
                0 => {
                    ch.output = true;
                    ch.armed = false;
                    return None;
                }
                _ => {
                    let period = ch.period_ns().max(1);
                    while ch.next_fire_ns <= now_ns {
                        ch.next_fire_ns += period;
                    }
                }
            }
        }
        Some(self.channels[0].next_fire_ns - now_ns)
    }

    fn write_control(&mut self, value: u8) {
        let sel = value >> 6;
        if sel == 3 {
            // Read-back command: latch count and/or status of the
            // channels named in bits 1..3.
            let latch_count = value & 0x20 == 0;
            let latch_status = value & 0x10 == 0;
            let now = self.clock.now_ns();
            for i in 0..3 {
                if value & (2 << i) != 0 {
                    let current = self.channels[i].current_count(now);
                    let status = self.channels[i].status(now);
                    let ch = &mut self.channels[i];
                    if latch_count && ch.latched_count.is_none() {
                        ch.latched_count = Some(current);
                    }
                    if latch_status && ch.latched_status.is_none() {
                        ch.latched_status = Some(status);
                    }
                }
            }
            return;
        }
        let access = value >> 4 & 3;
        let ch = &mut self.channels[sel as usize];
        if access == 0 {
            // Counter-latch command.
            let now = self.clock.now_ns();
            let current = ch.current_count(now);
            if ch.latched_count.is_none() {
                ch.latched_count = Some(current);
            }
            return;
        }
        ch.access = access;
        ch.mode = value >> 1 & 7;
        ch.bcd = value & 1 != 0;
        ch.write_hi = false;
        ch.read_hi = false;
        ch.latched_count = None;
        ch.latched_status = None;
        ch.armed = false;
        ch.output = ch.mode != 0;
        if ch.bcd {
            tracing::debug!(target: "pit", "BCD counting requested; treated as binary");
        }
    }

    fn write_counter(&mut self, idx: usize, value: u8) {
        let now = self.clock.now_ns();
        let ch = &mut self.channels[idx];
        let complete = match ch.access {
            1 => {
                ch.reload = ch.reload & 0xFF00 | value as u16;
                true
            }
            2 => {
                ch.reload = ch.reload & 0x00FF | (value as u16) << 8;
                true
            }
            _ => {
                if !ch.write_hi {
                    ch.partial_reload = value;
                    ch.write_hi = true;
                    false
                } else {
                    ch.reload = ch.partial_reload as u16 | (value as u16) << 8;
                    ch.write_hi = false;
                    true
                }
            }
        };
        if complete {
            ch.arm(now);
        }
    }

    fn read_counter(&mut self, idx: usize) -> u8 {
        let now = self.clock.now_ns();
        let ch = &mut self.channels[idx];
        if let Some(status) = ch.latched_status.take() {
            return status;
        }
        let count = ch
            .latched_count
            .unwrap_or_else(|| ch.current_count(now));
        match ch.access {
            1 => {
                ch.latched_count = None;
                count as u8
            }
            2 => {
                ch.latched_count = None;
                (count >> 8) as u8
            }
            _ => {
                if !ch.read_hi {
                    ch.read_hi = true;
                    count as u8
                } else {
                    ch.read_hi = false;
                    ch.latched_count = None;
                    (count >> 8) as u8
                }
            }
        }
    }

    fn speaker_output(&self) -> bool {
        // Channel 2 output, observable when the gate is open.
        let ch = &self.channels[2];
        if !ch.gate || !ch.armed {
            return ch.output;
        }
        let elapsed = ns_to_ticks(self.clock.now_ns().saturating_sub(ch.start_ns));
        let n = ch.period_ticks();
        match ch.mode {
            3 => elapsed % n < n / 2,
            _ => elapsed % n == 0,
        }
    }
}

impl PortIoDevice for Pit {
    fn port_read(&mut self, port: u16, _size: u8) -> u32 {
        match port {
            0x40..=0x42 => self.read_counter((port - 0x40) as usize) as u32,
            PIT_CTRL_PORT => 0xFF, // control register is write-only
            SYSTEM_CTRL_PORT => {
                // Bit 4 is the refresh toggle; flipping it on every read is
                // enough for the delay loops that poll it.
                self.refresh_toggle = !self.refresh_toggle;
                (self.system_ctrl & 0x03) as u32
                    | (self.refresh_toggle as u32) << 4
                    | (self.speaker_output() as u32) << 5
            }
            _ => 0xFF,
        }
    }

    fn port_write(&mut self, port: u16, value: u32, _size: u8) {
        let value = value as u8;
        match port {
            0x40..=0x42 => self.write_counter((port - 0x40) as usize, value),
            PIT_CTRL_PORT => self.write_control(value),
            SYSTEM_CTRL_PORT => {
                self.system_ctrl = value & 0x03;
                self.channels[2].gate = value & 1 != 0;
            }
            _ => {}
        }
    }
}

impl IoSnapshot for Pit {
    const NAME: &'static str = "pit";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        for (i, ch) in self.channels.iter().enumerate() {
            let mut co = StateObject::new();
            co.put_u16("reload", ch.reload);
            co.put_u8("mode", ch.mode);
            co.put_bool("bcd", ch.bcd);
            co.put_u8("access", ch.access);
            co.put_bool("write_hi", ch.write_hi);
            co.put_bool("read_hi", ch.read_hi);
            co.put_u16("latched_count", ch.latched_count.unwrap_or(0));
            co.put_bool("has_latched_count", ch.latched_count.is_some());
            co.put_u8("latched_status", ch.latched_status.unwrap_or(0));
            co.put_bool("has_latched_status", ch.latched_status.is_some());
            co.put_u8("partial_reload", ch.partial_reload);
            co.put_bool("armed", ch.armed);
            co.put_u64("start_ns", ch.start_ns);
            co.put_u64("next_fire_ns", ch.next_fire_ns);
            co.put_bool("gate", ch.gate);
            co.put_bool("output", ch.output);
            obj.put_object(&format!("channel{i}"), co);
        }
        obj.put_u8("system_ctrl", self.system_ctrl);
        obj.put_bool("refresh_toggle", self.refresh_toggle);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        for (i, ch) in self.channels.iter_mut().enumerate() {
            let co = state
                .object(&format!("channel{i}"))
                .ok_or(SnapshotError::Inconsistent("missing PIT channel"))?;
            ch.reload = co.get_u16("reload");
            ch.mode = co.get_u8("mode");
            ch.bcd = co.get_bool("bcd");
            ch.access = co.get_u8("access");
            ch.write_hi = co.get_bool("write_hi");
            ch.read_hi = co.get_bool("read_hi");
            ch.latched_count = co
                .get_bool("has_latched_count")
                .then(|| co.get_u16("latched_count"));
            ch.latched_status = co
                .get_bool("has_latched_status")
                .then(|| co.get_u8("latched_status"));
            ch.partial_reload = co.get_u8("partial_reload");
            ch.armed = co.get_bool("armed");
            ch.start_ns = co.get_u64("start_ns");
            ch.next_fire_ns = co.get_u64("next_fire_ns");
            ch.gate = co.get_bool("gate");
            ch.output = co.get_bool("output");
        }
        self.system_ctrl = state.get_u8("system_ctrl");
        self.refresh_toggle = state.get_bool("refresh_toggle");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corten_platform::PlatformInterrupts;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fixture() -> (Pit, Clock, Rc<RefCell<PlatformInterrupts>>) {
        let clock = Clock::new();
        let ints = Rc::new(RefCell::new(PlatformInterrupts::new(false)));
        ints.borrow_mut().pic_mut().set_offsets(0x08, 0x70);
        let pit = Pit::new(clock.clone(), IrqLine::new(ints.clone(), 0));
        (pit, clock, ints)
    }

    #[test]
    fn mode2_fires_periodically_on_irq0() {
        let (mut pit, clock, ints) = fixture();
        // Control: channel 0, lobyte/hibyte, mode 2.
        pit.port_write(0x43, 0x34, 1);
        pit.port_write(0x40, 0xA9, 1); // 11931 = ~10ms
        pit.port_write(0x40, 0x2E, 1);

        let first = pit.next_deadline(0).unwrap();
        assert!(first > 9_000_000 && first < 11_000_000, "{first}");
        assert!(!ints.borrow().intr_asserted());

        clock.advance_ns(first);
        let next = pit.next_deadline(first).unwrap();
        assert!(ints.borrow().intr_asserted(), "deadline expiry raises IRQ 0");
        assert_eq!(ints.borrow_mut().acknowledge(), 0x08);
        assert!(next > 9_000_000 && next < 11_000_000);
    }

    #[test]
    fn mode0_fires_once() {
        let (mut pit, _clock, ints) = fixture();
        pit.port_write(0x43, 0x30, 1); // channel 0, lobyte/hibyte, mode 0
        pit.port_write(0x40, 0x00, 1);
        pit.port_write(0x40, 0x10, 1); // 0x1000 ticks
        let first = pit.next_deadline(0).unwrap();
        assert_eq!(pit.next_deadline(first), None);
        assert!(ints.borrow().intr_asserted());
    }

    #[test]
    fn latch_freezes_the_read_value() {
        let (mut pit, clock, _) = fixture();
        pit.port_write(0x43, 0x34, 1);
        pit.port_write(0x40, 0x00, 1);
        pit.port_write(0x40, 0x80, 1); // reload 0x8000
        clock.advance_ns(ticks_to_ns(0x100) + 1);
        pit.port_write(0x43, 0x00, 1); // latch channel 0
        clock.advance_ns(ticks_to_ns(0x500) + 1);
        let lo = pit.port_read(0x40, 1) as u16;
        let hi = pit.port_read(0x40, 1) as u16;
        let latched = lo | hi << 8;
        assert_eq!(latched, 0x8000 - 0x100);
    }

    #[test]
    fn port61_refresh_bit_toggles_per_read() {
        let (mut pit, _, _) = fixture();
        let a = pit.port_read(0x61, 1) & 0x10;
        let b = pit.port_read(0x61, 1) & 0x10;
        assert_ne!(a, b);
    }
}
