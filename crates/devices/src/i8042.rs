//! Intel 8042 keyboard controller with both PS/2 ports.
//!
//! Commands arrive at 0x64, parameters and device traffic at 0x60. The
//! controller multiplexes the keyboard and aux queues onto a single output
//! byte: draining port 0x60 refills the byte from the highest-priority
//! non-empty queue and re-raises the matching IRQ. Mouse motion accumulates
//! between packets and a packet is only emitted once the previous one has
//! been fully drained.

use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};
use corten_platform::interrupts::IrqLine;
use corten_platform::{A20Gate, PortIoDevice, ResetEvent, ResetEvents};

pub const I8042_DATA_PORT: u16 = 0x60;
pub const I8042_STATUS_PORT: u16 = 0x64;

const STATUS_OFULL: u8 = 0x01;
const STATUS_SYSFLAG: u8 = 0x04;
const STATUS_CMD: u8 = 0x08;
const STATUS_KEYLOCK: u8 = 0x10;
const STATUS_AUX: u8 = 0x20;
const STATUS_TIME_OUT: u8 = 0x40;

const CMDBYTE_KBD_IRQ: u8 = 0x01;
const CMDBYTE_AUX_IRQ: u8 = 0x02;
const CMDBYTE_KBD_DISABLED: u8 = 0x10;
const CMDBYTE_AUX_DISABLED: u8 = 0x20;

const MOUSE_LEFT: u8 = 1;
const MOUSE_RIGHT: u8 = 2;
const MOUSE_MIDDLE: u8 = 4;

const NO_COMMAND: u8 = 0;

#[derive(Clone)]
struct ByteQueue {
    data: [u8; 256],
    read_pos: u8,
    write_pos: u8,
}

impl Default for ByteQueue {
    fn default() -> Self {
        ByteQueue {
            data: [0; 256],
            read_pos: 0,
            write_pos: 0,
        }
    }
}

impl ByteQueue {
    fn push(&mut self, byte: u8) {
        self.data[self.write_pos as usize] = byte;
        self.write_pos = self.write_pos.wrapping_add(1);
    }

    fn pop(&mut self) -> u8 {
        let byte = self.data[self.read_pos as usize];
        self.read_pos = self.read_pos.wrapping_add(1);
        byte
    }

    fn has_data(&self) -> bool {
        self.read_pos != self.write_pos
    }

    fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

const KBD_QUEUE: usize = 0;
const AUX_QUEUE: usize = 1;

pub struct I8042 {
    queues: [ByteQueue; 2],
    /// Controller RAM; byte 0 is the command byte.
    ram: [u8; 32],
    output: u8,
    output_consumed: bool,
    raised_irq: Option<u8>,
    status: u8,
    pending_command: u8,
    keyboard_command: u8,
    mouse_command: u8,
    keyboard_scanning_disabled: bool,
    mouse_scaling_1to2: bool,
    mouse_stream_mode: bool,
    mouse_stream_inactive: bool,
    mouse_resolution: u8,
    mouse_sample_rate: u8,
    mouse_button_state: u8,
    /// IntelliMouse promotion: the 200/100/80 sample-rate knock.
    mouse_knock: u8,
    mouse_wheel_mode: bool,
    xrel: i32,
    yrel: i32,
    a20: A20Gate,
    reset_events: ResetEvents,
    irq1: IrqLine,
    irq12: IrqLine,
}

impl I8042 {
    pub fn new(a20: A20Gate, reset_events: ResetEvents, irq1: IrqLine, irq12: IrqLine) -> Self {
        let mut kbc = Self {
            queues: Default::default(),
            ram: [0; 32],
            output: 0,
            output_consumed: true,
            raised_irq: None,
            status: 0,
            pending_command: NO_COMMAND,
            keyboard_command: NO_COMMAND,
            mouse_command: NO_COMMAND,
            keyboard_scanning_disabled: false,
            mouse_scaling_1to2: false,
            mouse_stream_mode: true,
            mouse_stream_inactive: true,
            mouse_resolution: 4,
            mouse_sample_rate: 100,
            mouse_button_state: 0,
            mouse_knock: 0,
            mouse_wheel_mode: false,
            xrel: 0,
            yrel: 0,
            a20,
            reset_events,
            irq1,
            irq12,
        };
        kbc.reset();
        kbc
    }

    pub fn reset(&mut self) {
        for q in &mut self.queues {
            q.clear();
        }
        self.output_consumed = true;
        self.raised_irq = None;
        self.status = STATUS_CMD | STATUS_KEYLOCK;
        self.reset_keyboard_port();
        self.reset_mouse_port();
    }

    fn reset_keyboard_port(&mut self) {
        self.keyboard_scanning_disabled = false;
        self.ram[0] = CMDBYTE_KBD_IRQ | STATUS_SYSFLAG;
    }

    fn reset_mouse_port(&mut self) {
        self.mouse_scaling_1to2 = false;
        self.mouse_stream_mode = true;
        self.mouse_stream_inactive = true;
        self.mouse_resolution = 4;
        self.mouse_sample_rate = 100;
        self.mouse_knock = 0;
        self.mouse_wheel_mode = false;
    }

    fn raise_irq_for(&mut self, aux: bool) {
        self.status |= STATUS_OFULL;
        if aux {
            self.status |= STATUS_AUX;
        } else {
            self.status &= !STATUS_AUX;
        }
        let enable_bit = if aux { CMDBYTE_AUX_IRQ } else { CMDBYTE_KBD_IRQ };
        if self.ram[0] & enable_bit != 0 {
            let line = if aux { &self.irq12 } else { &self.irq1 };
            line.pulse();
            self.raised_irq = Some(if aux { 12 } else { 1 });
        }
    }

    /// Moves the next queued byte into the output register if it has been
    /// consumed, raising the matching IRQ.
    fn refill_output(&mut self) {
        if !self.output_consumed {
            // Output still full: make sure the status/IRQ reflect whichever
            // queue is still waiting.
            if self.queues[KBD_QUEUE].has_data() {
                self.raise_irq_for(false);
            } else if self.queues[AUX_QUEUE].has_data() {
                self.raise_irq_for(true);
            }
            return;
        }
        for (i, aux) in [(KBD_QUEUE, false), (AUX_QUEUE, true)] {
            if self.queues[i].has_data() {
                self.output = self.queues[i].pop();
                self.output_consumed = false;
                self.raise_irq_for(aux);
                return;
            }
        }
    }

    fn push(&mut self, queue: usize, byte: u8) {
        self.queues[queue].push(byte);
        self.refill_output();
    }

    /// Host-side key event (set-1 scancode byte, prefixes included).
    pub fn inject_scancode(&mut self, byte: u8) {
        if !self.keyboard_scanning_disabled {
            self.push(KBD_QUEUE, byte);
        }
    }

    /// Host-side mouse button change; `None` leaves a button untouched.
    pub fn inject_mouse_buttons(
        &mut self,
        left: Option<bool>,
        middle: Option<bool>,
        right: Option<bool>,
    ) {
        let old = self.mouse_button_state;
        let mut set = |mask: u8, state: Option<bool>, buttons: &mut u8| {
            if let Some(down) = state {
                *buttons = *buttons & !mask | if down { mask } else { 0 };
            }
        };
        set(MOUSE_LEFT, left, &mut self.mouse_button_state);
        set(MOUSE_MIDDLE, middle, &mut self.mouse_button_state);
        set(MOUSE_RIGHT, right, &mut self.mouse_button_state);
        if old != self.mouse_button_state {
            self.emit_mouse_packet(true);
        }
    }

    /// Host-side relative motion. Accumulates until the previous packet has
    /// drained, so a slow guest never sees interleaved packet fragments.
    pub fn inject_mouse_motion(&mut self, xrel: i32, yrel: i32) {
        if self.mouse_stream_mode && !self.mouse_stream_inactive {
            self.xrel += xrel;
            self.yrel += yrel;
            if !self.queues[AUX_QUEUE].has_data() {
                self.emit_mouse_packet(false);
            }
        }
    }

    fn emit_mouse_packet(&mut self, forced: bool) {
        if !forced && self.xrel == 0 && self.yrel == 0 {
            return;
        }
        let dx = self.xrel.clamp(-255, 255);
        let dy = (-self.yrel).clamp(-255, 255);
        let mut head = 0x08 | self.mouse_button_state;
        if dx < 0 {
            head |= 0x10;
        }
        if dy < 0 {
            head |= 0x20;
        }
        self.push(AUX_QUEUE, head);
        self.push(AUX_QUEUE, dx as u8);
        self.push(AUX_QUEUE, dy as u8);
        if self.mouse_wheel_mode {
            self.push(AUX_QUEUE, 0); // wheel not modelled
        }
        self.xrel = 0;
        self.yrel = 0;
    }

    fn note_sample_rate(&mut self, rate: u8) {
        self.mouse_sample_rate = rate;
        self.mouse_knock = match (self.mouse_knock, rate) {
            (0, 200) => 1,
            (1, 100) => 2,
            (2, 80) => {
                self.mouse_wheel_mode = true;
                0
            }
            (_, 200) => 1,
            _ => 0,
        };
    }

    fn write_command_port(&mut self, data: u8) {
        self.status &= !STATUS_CMD;
        match data {
            0x20..=0x3F => {
                let address = (data & 0x1F) as usize;
                let byte = if address == 0 {
                    self.ram[0] | self.status & STATUS_SYSFLAG
                } else {
                    self.ram[address]
                };
                self.push(KBD_QUEUE, byte);
            }
            0x60..=0x7F | 0xD1..=0xD4 => {
                // Needs a parameter byte on port 0x60.
                self.status |= STATUS_CMD;
                self.pending_command = data;
            }
            0xA1 => self.push(KBD_QUEUE, 0), // firmware version
            0xA7 | 0xA8 => {
                self.ram[0] &= !CMDBYTE_AUX_DISABLED;
                if data == 0xA7 {
                    self.ram[0] |= CMDBYTE_AUX_DISABLED;
                } else {
                    self.refill_output();
                    if !self.output_consumed {
                        self.raise_irq_for(true);
                    }
                }
            }
            0xA9 => self.push(KBD_QUEUE, 0), // aux port test: OK
            0xAA => {
                // Controller self-test sets the system flag everywhere.
                self.status |= STATUS_SYSFLAG;
                self.ram[0] |= STATUS_SYSFLAG;
                self.push(KBD_QUEUE, 0x55);
            }
            0xAB => self.push(KBD_QUEUE, 0), // keyboard port test: OK
            0xAD | 0xAE => {
                self.ram[0] &= !CMDBYTE_KBD_DISABLED;
                if data == 0xAD {
                    self.ram[0] |= CMDBYTE_KBD_DISABLED;
                } else {
                    self.refill_output();
                    if !self.output_consumed {
                        self.raise_irq_for(false);
                    }
                }
            }
            0xC0 => self.push(KBD_QUEUE, 0x40), // input port
            0xF0..=0xFF => {
                // Pulse output lines; bit 0 low means system reset.
                if data & 1 == 0 {
                    self.reset_events.request(ResetEvent::System);
                }
            }
            _ => {
                tracing::debug!(target: "i8042", command = data, "unimplemented controller command");
            }
        }
    }

    fn write_keyboard_byte(&mut self, data: u8) {
        match data {
            0xED | 0xF3 | 0xF0 => {
                // Commands with one parameter byte.
                self.keyboard_command = data;
                self.push(KBD_QUEUE, 0xFA);
            }
            0xEE => self.push(KBD_QUEUE, 0xEE), // echo
            0xF2 => {
                self.push(KBD_QUEUE, 0xFA);
                self.push(KBD_QUEUE, 0xAB);
                self.push(KBD_QUEUE, 0x41);
            }
            0xF4 | 0xF5 => {
                self.keyboard_scanning_disabled = data & 1 != 0;
                self.push(KBD_QUEUE, 0xFA);
            }
            0xF6 => {
                self.reset_keyboard_port();
                self.keyboard_scanning_disabled = false;
                self.push(KBD_QUEUE, 0xFA);
            }
            0xFF => {
                self.reset_keyboard_port();
                self.push(KBD_QUEUE, 0xFA);
                self.push(KBD_QUEUE, 0xAA);
            }
            0x05 => self.push(KBD_QUEUE, 0xFE), // resend
            0xFA | 0xE8 => self.push(AUX_QUEUE, 0xFE),
            _ => {
                tracing::debug!(target: "i8042", command = data, "unimplemented keyboard command");
                self.push(KBD_QUEUE, 0xFE);
            }
        }
    }

    fn write_keyboard_parameter(&mut self, command: u8, data: u8) {
        match command {
            0xED => self.push(KBD_QUEUE, 0xFA), // LED state: accepted
            0xF0 => {
                self.push(KBD_QUEUE, 0xFA);
                if data == 0 {
                    self.push(KBD_QUEUE, 2); // scancode set 2
                }
            }
            _ => self.push(KBD_QUEUE, 0xFA), // 0xF3 typematic
        }
    }

    fn write_mouse_byte(&mut self, data: u8) {
        match self.mouse_command {
            0xE8 => {
                self.mouse_resolution = data;
                self.push(AUX_QUEUE, 0xFA);
                self.mouse_command = NO_COMMAND;
            }
            0xF3 => {
                self.note_sample_rate(data);
                self.push(AUX_QUEUE, 0xFA);
                self.mouse_command = NO_COMMAND;
            }
            _ => match data {
                0xE6 | 0xE7 => {
                    self.mouse_scaling_1to2 = data & 1 != 0;
                    self.push(AUX_QUEUE, 0xFA);
                }
                0xE8 | 0xF3 => {
                    self.mouse_command = data;
                    self.push(AUX_QUEUE, 0xFA);
                }
                0xE9 => {
                    self.push(AUX_QUEUE, 0xFA);
                    let status = (self.mouse_stream_mode as u8) << 6
                        | (!self.mouse_stream_inactive as u8) << 5
                        | (!self.mouse_scaling_1to2 as u8) << 4
                        | self.mouse_button_state;
                    self.push(AUX_QUEUE, status);
                    let resolution = self.mouse_resolution;
                    let sample_rate = self.mouse_sample_rate;
                    self.push(AUX_QUEUE, resolution);
                    self.push(AUX_QUEUE, sample_rate);
                }
                0xEA => {
                    self.mouse_stream_mode = true;
                    self.push(AUX_QUEUE, 0xFA);
                }
                0xF2 => {
                    self.push(AUX_QUEUE, 0xFA);
                    let id = if self.mouse_wheel_mode { 3 } else { 0 };
                    self.push(AUX_QUEUE, id);
                }
                0xF4 | 0xF5 => {
                    self.mouse_stream_inactive = data & 1 != 0;
                    self.push(AUX_QUEUE, 0xFA);
                }
                0xF6 => {
                    self.reset_mouse_port();
                    self.push(AUX_QUEUE, 0xFA);
                }
                0xFF => {
                    self.reset_mouse_port();
                    self.push(AUX_QUEUE, 0xFA);
                    self.push(AUX_QUEUE, 0xAA);
                    self.push(AUX_QUEUE, 0x00);
                }
                0xBB => {} // OS/2 probes this; no response expected
                _ => {
                    tracing::debug!(target: "i8042", command = data, "unimplemented mouse command");
                    self.push(AUX_QUEUE, 0xFE);
                }
            },
        }
    }

    fn write_data_port(&mut self, data: u8) {
        self.status &= !STATUS_CMD;
        let command = std::mem::replace(&mut self.pending_command, NO_COMMAND);
        match command {
            NO_COMMAND => {
                let kbd_cmd = std::mem::replace(&mut self.keyboard_command, NO_COMMAND);
                if kbd_cmd != NO_COMMAND {
                    self.write_keyboard_parameter(kbd_cmd, data);
                } else {
                    self.write_keyboard_byte(data);
                }
            }
            0x60..=0x7F => {
                self.ram[(command & 0x1F) as usize] = data;
                self.refill_output();
            }
            0xD1 => {
                // Controller output port: bit 1 is the A20 gate, bit 0 low
                // asserts the CPU reset line.
                self.a20.set_enabled(data & 2 != 0);
                if data & 1 == 0 {
                    self.reset_events.request(ResetEvent::System);
                }
            }
            0xD2 => self.push(KBD_QUEUE, data),
            0xD3 => self.push(AUX_QUEUE, data),
            0xD4 => self.write_mouse_byte(data),
            _ => {
                tracing::debug!(target: "i8042", command, data, "unexpected parameter byte");
            }
        }
    }
}

impl PortIoDevice for I8042 {
    fn port_read(&mut self, port: u16, _size: u8) -> u32 {
        if port == I8042_STATUS_PORT {
            self.status &= !STATUS_TIME_OUT;
            self.status as u32
        } else {
            self.status &= !(STATUS_AUX | STATUS_OFULL);
            if let Some(irq) = self.raised_irq.take() {
                if irq == 1 {
                    self.irq1.lower();
                } else {
                    self.irq12.lower();
                }
            }
            let data = self.output;
            self.output_consumed = true;
            self.refill_output();
            data as u32
        }
    }

    fn port_write(&mut self, port: u16, value: u32, _size: u8) {
        let value = value as u8;
        if port == I8042_STATUS_PORT {
            self.write_command_port(value);
        } else {
            self.write_data_port(value);
        }
    }
}

impl IoSnapshot for I8042 {
    const NAME: &'static str = "i8042";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        for (i, q) in self.queues.iter().enumerate() {
            let mut qo = StateObject::new();
            qo.put_bytes("data", &q.data);
            qo.put_u8("read_pos", q.read_pos);
            qo.put_u8("write_pos", q.write_pos);
            obj.put_object(if i == KBD_QUEUE { "kbd_queue" } else { "aux_queue" }, qo);
        }
        obj.put_bytes("ram", &self.ram);
        obj.put_u8("output", self.output);
        obj.put_bool("output_consumed", self.output_consumed);
        obj.put_u8("raised_irq", self.raised_irq.unwrap_or(0));
        obj.put_u8("status", self.status);
        obj.put_u8("pending_command", self.pending_command);
        obj.put_u8("keyboard_command", self.keyboard_command);
        obj.put_u8("mouse_command", self.mouse_command);
        obj.put_bool("keyboard_scanning_disabled", self.keyboard_scanning_disabled);
        obj.put_bool("mouse_scaling_1to2", self.mouse_scaling_1to2);
        obj.put_bool("mouse_stream_mode", self.mouse_stream_mode);
        obj.put_bool("mouse_stream_inactive", self.mouse_stream_inactive);
        obj.put_u8("mouse_resolution", self.mouse_resolution);
        obj.put_u8("mouse_sample_rate", self.mouse_sample_rate);
        obj.put_u8("mouse_button_state", self.mouse_button_state);
        obj.put_u8("mouse_knock", self.mouse_knock);
        obj.put_bool("mouse_wheel_mode", self.mouse_wheel_mode);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        for (i, key) in [(KBD_QUEUE, "kbd_queue"), (AUX_QUEUE, "aux_queue")] {
            let qo = state
                .object(key)
                .ok_or(SnapshotError::Inconsistent("missing 8042 queue"))?;
            qo.copy_into("data", &mut self.queues[i].data);
            self.queues[i].read_pos = qo.get_u8("read_pos");
            self.queues[i].write_pos = qo.get_u8("write_pos");
        }
        state.copy_into("ram", &mut self.ram);
        self.output = state.get_u8("output");
        self.output_consumed = state.get_bool("output_consumed");
        self.raised_irq = match state.get_u8("raised_irq") {
            0 => None,
            n => Some(n),
        };
        self.status = state.get_u8("status");
        self.pending_command = state.get_u8("pending_command");
        self.keyboard_command = state.get_u8("keyboard_command");
        self.mouse_command = state.get_u8("mouse_command");
        self.keyboard_scanning_disabled = state.get_bool("keyboard_scanning_disabled");
        self.mouse_scaling_1to2 = state.get_bool("mouse_scaling_1to2");
        self.mouse_stream_mode = state.get_bool("mouse_stream_mode");
        self.mouse_stream_inactive = state.get_bool("mouse_stream_inactive");
        self.mouse_resolution = state.get_u8("mouse_resolution");
        self.mouse_sample_rate = state.get_u8("mouse_sample_rate");
        self.mouse_button_state = state.get_u8("mouse_button_state");
        self.mouse_knock = state.get_u8("mouse_knock");
        self.mouse_wheel_mode = state.get_bool("mouse_wheel_mode");
        // Buttons are host state; start released after restore.
        self.xrel = 0;
        self.yrel = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corten_platform::PlatformInterrupts;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Fixture {
        kbc: I8042,
        a20: A20Gate,
        resets: ResetEvents,
        ints: Rc<RefCell<PlatformInterrupts>>,
    }

    fn fixture() -> Fixture {
        let a20 = A20Gate::new();
        let resets = ResetEvents::new();
        let ints = Rc::new(RefCell::new(PlatformInterrupts::new(false)));
        ints.borrow_mut().pic_mut().set_offsets(0x08, 0x70);
        let kbc = I8042::new(
            a20.clone(),
            resets.clone(),
            IrqLine::new(ints.clone(), 1),
            IrqLine::new(ints.clone(), 12),
        );
        Fixture {
            kbc,
            a20,
            resets,
            ints,
        }
    }

    fn read_data(kbc: &mut I8042) -> u8 {
        kbc.port_read(I8042_DATA_PORT, 1) as u8
    }

    #[test]
    fn self_test_reports_0x55() {
        let mut f = fixture();
        f.kbc.port_write(0x64, 0xAA, 1);
        assert_ne!(f.kbc.port_read(0x64, 1) as u8 & STATUS_OFULL, 0);
        assert_eq!(read_data(&mut f.kbc), 0x55);
        assert_eq!(f.kbc.port_read(0x64, 1) as u8 & STATUS_OFULL, 0);
    }

    #[test]
    fn command_byte_round_trips_through_ram() {
        let mut f = fixture();
        f.kbc.port_write(0x64, 0x60, 1);
        f.kbc.port_write(0x60, 0x45, 1);
        f.kbc.port_write(0x64, 0x20, 1);
        assert_eq!(read_data(&mut f.kbc) & !STATUS_SYSFLAG, 0x45 & !STATUS_SYSFLAG);
    }

    #[test]
    fn output_port_write_drives_a20() {
        let mut f = fixture();
        f.kbc.port_write(0x64, 0xD1, 1);
        f.kbc.port_write(0x60, 0x03, 1); // A20 on, reset line deasserted
        assert!(f.a20.enabled());
        assert!(f.resets.take().is_empty());

        // 0xDD is the classic "A20 off" output-port value: bit 1 clear
        // drops the gate, bit 0 set keeps the CPU out of reset.
        f.kbc.port_write(0x64, 0xD1, 1);
        f.kbc.port_write(0x60, 0xDD, 1);
        assert!(!f.a20.enabled());
        assert!(f.resets.take().is_empty());
    }

    #[test]
    fn pulse_command_with_low_bit0_requests_reset() {
        let mut f = fixture();
        f.kbc.port_write(0x64, 0xFE, 1);
        assert_eq!(f.resets.take(), vec![ResetEvent::System]);
    }

    #[test]
    fn key_injection_raises_irq1_and_drains() {
        let mut f = fixture();
        f.kbc.inject_scancode(0x1C);
        assert!(f.ints.borrow().intr_asserted());
        let status = f.kbc.port_read(0x64, 1) as u8;
        assert_ne!(status & STATUS_OFULL, 0);
        assert_eq!(status & STATUS_AUX, 0);
        assert_eq!(read_data(&mut f.kbc), 0x1C);
    }

    #[test]
    fn mouse_packet_reflects_motion_and_buttons() {
        let mut f = fixture();
        // Enable mouse reporting: 0xD4 prefix routes 0xF4 to the mouse.
        f.kbc.port_write(0x64, 0xD4, 1);
        f.kbc.port_write(0x60, 0xF4, 1);
        assert_eq!(read_data(&mut f.kbc), 0xFA);

        f.kbc.inject_mouse_motion(5, 3);
        let head = read_data(&mut f.kbc);
        let dx = read_data(&mut f.kbc);
        let dy = read_data(&mut f.kbc);
        assert_eq!(head & 0x08, 0x08);
        assert_eq!(head & 0x30, 0x20, "negative dy after axis flip");
        assert_eq!(dx, 5);
        assert_eq!(dy, (-3i32) as u8);
    }

    #[test]
    fn motion_accumulates_while_queue_is_full() {
        let mut f = fixture();
        f.kbc.port_write(0x64, 0xD4, 1);
        f.kbc.port_write(0x60, 0xF4, 1);
        assert_eq!(read_data(&mut f.kbc), 0xFA);

        f.kbc.inject_mouse_motion(1, 0);
        // Aux queue still holds the first packet; more motion accumulates.
        f.kbc.inject_mouse_motion(2, 0);
        f.kbc.inject_mouse_motion(3, 0);

        let _head = read_data(&mut f.kbc);
        let dx = read_data(&mut f.kbc);
        let _dy = read_data(&mut f.kbc);
        assert_eq!(dx, 1);
        // Drain triggers the accumulated second packet.
        f.kbc.inject_mouse_motion(0, 0);
        let _head = read_data(&mut f.kbc);
        let dx = read_data(&mut f.kbc);
        assert_eq!(dx, 5);
    }

    #[test]
    fn intellimouse_knock_promotes_mouse_id() {
        let mut f = fixture();
        for rate in [200u8, 100, 80] {
            f.kbc.port_write(0x64, 0xD4, 1);
            f.kbc.port_write(0x60, 0xF3, 1);
            assert_eq!(read_data(&mut f.kbc), 0xFA);
            f.kbc.port_write(0x64, 0xD4, 1);
            f.kbc.port_write(0x60, rate as u32, 1);
            assert_eq!(read_data(&mut f.kbc), 0xFA);
        }
        f.kbc.port_write(0x64, 0xD4, 1);
        f.kbc.port_write(0x60, 0xF2, 1);
        assert_eq!(read_data(&mut f.kbc), 0xFA);
        assert_eq!(read_data(&mut f.kbc), 3);
    }

    #[test]
    fn aux_traffic_sets_status_aux_and_irq12() {
        let mut f = fixture();
        f.kbc.port_write(0x64, 0xD3, 1); // loop a byte into the aux queue
        f.kbc.port_write(0x60, 0x99, 1);
        let status = f.kbc.port_read(0x64, 1) as u8;
        assert_ne!(status & STATUS_AUX, 0);
        assert!(f.ints.borrow().intr_asserted());
        assert_eq!(f.ints.borrow_mut().acknowledge(), 0x70 + 4);
        assert_eq!(read_data(&mut f.kbc), 0x99);
    }
}
