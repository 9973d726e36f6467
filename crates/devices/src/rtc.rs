//! MC146818-compatible CMOS real-time clock.
//!
//! Guests lean on three behaviors beyond simple timekeeping: a periodic
//! interrupt whose rate is picked by REG-A (OS/2 drives its scheduler off a
//! 32 ms rate), the alarm/update-ended interrupt reasons combining with the
//! periodic one in a single tick, and the UIP flag in REG-A reading as 1
//! for the final ~244 µs of every second (Windows XP calibrates its TSC
//! against that window).

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};
use corten_platform::interrupts::IrqLine;
use corten_platform::PortIoDevice;

use crate::clock::Clock;

pub const CMOS_INDEX_PORT: u16 = 0x70;
pub const CMOS_DATA_PORT: u16 = 0x71;

const REG_SECONDS: u8 = 0x00;
const REG_ALARM_SECONDS: u8 = 0x01;
const REG_MINUTES: u8 = 0x02;
const REG_ALARM_MINUTES: u8 = 0x03;
const REG_HOURS: u8 = 0x04;
const REG_ALARM_HOURS: u8 = 0x05;
const REG_A: u8 = 0x0A;
const REG_B: u8 = 0x0B;
const REG_C: u8 = 0x0C;
const REG_D: u8 = 0x0D;
/// Century byte, by PC convention.
pub const REG_CENTURY: u8 = 0x32;

const REG_C_PERIODIC: u8 = 0x40;
const REG_C_ALARM: u8 = 0x20;
const REG_C_UPDATE: u8 = 0x10;

const BASE_FREQUENCY: u32 = 32768;
const NS_PER_SEC: u64 = 1_000_000_000;
/// UIP asserts this long before each seconds rollover.
const UIP_WINDOW_NS: u64 = 244_000;

/// Fallback power-on time (2020-01-01 00:00:00 UTC) keeps runs
/// deterministic when the host does not inject wall time.
pub const DEFAULT_EPOCH_SECONDS: i64 = 1_577_836_800;

pub struct Rtc {
    ram: [u8; 128],
    index: u8,
    nmi_disabled: bool,
    /// Guest-visible time in seconds since the Unix epoch.
    now_seconds: i64,
    periodic_ticks: u32,
    periodic_ticks_max: u32,
    period_ns: u64,
    last_called_ns: u64,
    last_second_update_ns: u64,
    clock: Clock,
    irq8: IrqLine,
}

impl Rtc {
    pub fn new(clock: Clock, irq8: IrqLine, epoch_seconds: Option<i64>) -> Self {
        let mut rtc = Self {
            ram: [0; 128],
            index: 0,
            nmi_disabled: false,
            now_seconds: epoch_seconds.unwrap_or(DEFAULT_EPOCH_SECONDS),
            periodic_ticks: 0,
            periodic_ticks_max: 0,
            period_ns: NS_PER_SEC,
            last_called_ns: clock.now_ns(),
            last_second_update_ns: clock.now_ns(),
            clock,
            irq8,
        };
        rtc.reset();
        rtc
    }

    pub fn reset(&mut self) {
        self.ram[REG_A as usize] = 0x26;
        self.ram[REG_B as usize] = 0x02;
        self.ram[REG_C as usize] = 0x00;
        self.ram[REG_D as usize] = 0x80;
        self.period_ns = NS_PER_SEC;
    }

    /// Battery-RAM poke for firmware-provided configuration bytes.
    pub fn set_ram(&mut self, index: u8, value: u8) {
        self.ram[(index & 0x7F) as usize] = value;
    }

    pub fn ram(&self, index: u8) -> u8 {
        self.ram[(index & 0x7F) as usize]
    }

    fn is_24h(&self) -> bool {
        self.ram[REG_B as usize] & 2 != 0
    }

    fn is_binary(&self) -> bool {
        self.ram[REG_B as usize] & 4 != 0
    }

    fn to_bcd(&self, val: u8) -> u8 {
        if self.is_binary() {
            val
        } else {
            (val / 10) << 4 | val % 10
        }
    }

    fn from_bcd(&self, val: u8) -> u8 {
        if self.is_binary() {
            val
        } else {
            ((val & 0xF0) >> 1) + ((val & 0xF0) >> 3) + (val & 0x0F)
        }
    }

    fn civil(&self) -> NaiveDateTime {
        NaiveDateTime::from_timestamp_opt(self.now_seconds, 0)
            .unwrap_or_else(|| NaiveDateTime::from_timestamp_opt(0, 0).unwrap())
    }

    fn read_time_register(&self, index: u8) -> u8 {
        let now = self.civil();
        match index {
            REG_SECONDS => self.to_bcd(now.second() as u8),
            REG_MINUTES => self.to_bcd(now.minute() as u8),
            REG_HOURS => {
                let hour = now.hour() as u8;
                if self.is_24h() {
                    self.to_bcd(hour)
                } else {
                    self.to_bcd(hour % 12) | ((hour > 12) as u8) << 7
                }
            }
            0x06 => self.to_bcd(now.weekday().num_days_from_sunday() as u8 + 1),
            0x07 => self.to_bcd(now.day() as u8),
            0x08 => self.to_bcd(now.month() as u8),
            _ => self.to_bcd((now.year() % 100) as u8),
        }
    }

    fn write_time_register(&mut self, index: u8, data: u8) {
        let now = self.civil();
        let (mut year, mut month, mut day) = (now.year(), now.month(), now.day());
        let (mut hour, mut minute, mut second) = (now.hour(), now.minute(), now.second());
        match index {
            REG_SECONDS => second = self.from_bcd(data) as u32,
            REG_MINUTES => minute = self.from_bcd(data) as u32,
            REG_HOURS => {
                hour = self.from_bcd(data & 0x7F) as u32;
                if !self.is_24h() && data & 0x80 != 0 {
                    hour += 12;
                }
            }
            0x06 => return, // weekday is derived, not stored
            0x07 => day = self.from_bcd(data) as u32,
            0x08 => month = self.from_bcd(data) as u32,
            _ => {
                let century = self.from_bcd(self.ram[REG_CENTURY as usize]) as i32;
                let century = if century >= 19 { century } else { 20 };
                year = century * 100 + self.from_bcd(data) as i32;
            }
        }
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            if let Some(dt) = date.and_hms_opt(hour % 24, minute % 60, second % 60) {
                self.now_seconds = dt.and_utc().timestamp();
            }
        }
    }

    fn update_timer(&mut self) {
        let rate = self.ram[REG_A as usize] & 0x0F;
        if rate == 0 {
            return;
        }
        // Rates 1 and 2 alias down the divider chain.
        let rate = if rate < 3 { rate + 7 } else { rate };
        let freq = BASE_FREQUENCY >> (rate - 1);
        if self.ram[REG_B as usize] & REG_C_PERIODIC != 0 {
            self.period_ns = NS_PER_SEC / freq as u64;
            self.periodic_ticks = 0;
            self.periodic_ticks_max = freq;
        } else {
            self.period_ns = NS_PER_SEC;
        }
        self.last_called_ns = self.clock.now_ns();
    }

    fn uip_asserted(&self, now_ns: u64) -> bool {
        let next_second = self.last_second_update_ns + NS_PER_SEC;
        now_ns >= next_second.saturating_sub(UIP_WINDOW_NS) && now_ns < next_second
    }

    fn read_register(&mut self, index: u8) -> u8 {
        match index {
            REG_SECONDS | REG_MINUTES | REG_HOURS | 0x06..=0x09 => self.read_time_register(index),
            REG_ALARM_SECONDS | REG_ALARM_MINUTES | REG_ALARM_HOURS => self.ram[index as usize],
            REG_A => {
                let mut val = self.ram[REG_A as usize] & 0x7F;
                if self.uip_asserted(self.clock.now_ns()) {
                    val |= 0x80;
                }
                val
            }
            REG_B => self.ram[REG_B as usize],
            REG_C => {
                self.irq8.lower();
                std::mem::take(&mut self.ram[REG_C as usize])
            }
            REG_D => 0x80, // battery good
            _ => self.ram[(index & 0x7F) as usize],
        }
    }

    fn write_register(&mut self, index: u8, data: u8) {
        match index {
            REG_SECONDS | REG_MINUTES | REG_HOURS | 0x06..=0x09 => {
                self.write_time_register(index, data)
            }
            REG_ALARM_SECONDS | REG_ALARM_MINUTES | REG_ALARM_HOURS => {
                self.ram[index as usize] = data;
            }
            REG_A => {
                self.ram[REG_A as usize] =
                    data & 0x7F | self.ram[REG_A as usize] & 0x80;
                self.update_timer();
            }
            REG_B => {
                self.ram[REG_B as usize] = data;
                self.update_timer();
            }
            REG_C | REG_D => {}
            _ => self.ram[(index & 0x7F) as usize] = data,
        }
    }

    fn alarm_matches(&self) -> bool {
        self.ram[REG_ALARM_SECONDS as usize] == self.read_time_register(REG_SECONDS)
            && self.ram[REG_ALARM_MINUTES as usize] == self.read_time_register(REG_MINUTES)
            && self.ram[REG_ALARM_HOURS as usize] == self.read_time_register(REG_HOURS)
    }

    /// One scheduler tick. Several interrupt reasons may combine: the
    /// periodic rate fires every period, and every Nth period the seconds
    /// counter advances, which is when alarm and update-ended are checked.
    pub fn tick(&mut self, now_ns: u64) {
        let next = self.last_called_ns + self.period_ns;
        if now_ns < next {
            return;
        }
        let reg_b = self.ram[REG_B as usize];
        let mut why = 0u8;
        let mut update_seconds = true;
        if reg_b & REG_C_PERIODIC != 0 {
            why |= REG_C_PERIODIC;
            self.periodic_ticks += 1;
            if self.periodic_ticks != self.periodic_ticks_max {
                update_seconds = false;
            } else {
                self.periodic_ticks = 0;
            }
        }
        if update_seconds {
            self.now_seconds += 1;
            if reg_b & REG_C_ALARM != 0 && self.alarm_matches() {
                why |= REG_C_ALARM;
            }
            if reg_b & REG_C_UPDATE != 0 {
                why |= REG_C_UPDATE;
            }
            self.last_second_update_ns = now_ns;
        }
        self.last_called_ns = self.clock.now_ns();
        if why != 0 {
            self.ram[REG_C as usize] = 0x80 | why;
            self.irq8.raise();
        }
    }

    pub fn next_deadline(&mut self, now_ns: u64) -> Option<u64> {
        self.tick(now_ns);
        Some((self.last_called_ns + self.period_ns).saturating_sub(now_ns))
    }
}

impl PortIoDevice for Rtc {
    fn port_read(&mut self, port: u16, _size: u8) -> u32 {
        if port & 1 == 0 {
            // Reading the index port yields open bus on real hardware;
            // Windows XP probes this to pick its dummy-write port.
            0xFF
        } else {
            self.read_register(self.index) as u32
        }
    }

    fn port_write(&mut self, port: u16, value: u32, _size: u8) {
        let value = value as u8;
        if port & 1 == 0 {
            self.nmi_disabled = value & 0x80 != 0;
            self.index = value & 0x7F;
        } else {
            self.write_register(self.index, value);
        }
    }
}

impl IoSnapshot for Rtc {
    const NAME: &'static str = "rtc";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        obj.put_bytes("ram", &self.ram);
        obj.put_u8("index", self.index);
        obj.put_bool("nmi_disabled", self.nmi_disabled);
        obj.put_u64("now_seconds", self.now_seconds as u64);
        obj.put_u32("periodic_ticks", self.periodic_ticks);
        obj.put_u32("periodic_ticks_max", self.periodic_ticks_max);
        obj.put_u64("period_ns", self.period_ns);
        obj.put_u64("last_called_ns", self.last_called_ns);
        obj.put_u64("last_second_update_ns", self.last_second_update_ns);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        state.copy_into("ram", &mut self.ram);
        self.index = state.get_u8("index");
        self.nmi_disabled = state.get_bool("nmi_disabled");
        self.now_seconds = state.get_u64("now_seconds") as i64;
        self.periodic_ticks = state.get_u32("periodic_ticks");
        self.periodic_ticks_max = state.get_u32("periodic_ticks_max");
        self.period_ns = state.get_u64("period_ns");
        self.last_called_ns = state.get_u64("last_called_ns");
        self.last_second_update_ns = state.get_u64("last_second_update_ns");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corten_platform::PlatformInterrupts;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fixture() -> (Rtc, Clock, Rc<RefCell<PlatformInterrupts>>) {
        let clock = Clock::new();
        let ints = Rc::new(RefCell::new(PlatformInterrupts::new(false)));
        ints.borrow_mut().pic_mut().set_offsets(0x08, 0x70);
        let rtc = Rtc::new(clock.clone(), IrqLine::new(ints.clone(), 8), None);
        (rtc, clock, ints)
    }

    fn read(rtc: &mut Rtc, index: u8) -> u8 {
        rtc.port_write(0x70, index as u32, 1);
        rtc.port_read(0x71, 1) as u8
    }

    fn write(rtc: &mut Rtc, index: u8, value: u8) {
        rtc.port_write(0x70, index as u32, 1);
        rtc.port_write(0x71, value as u32, 1);
    }

    #[test]
    fn bcd_time_round_trips() {
        let (mut rtc, _, _) = fixture();
        // Default REG-B: BCD, 24-hour.
        write(&mut rtc, 0x04, 0x13); // 13:00
        assert_eq!(read(&mut rtc, 0x04), 0x13);
        write(&mut rtc, 0x00, 0x59);
        assert_eq!(read(&mut rtc, 0x00), 0x59);
        write(&mut rtc, 0x07, 0x28);
        assert_eq!(read(&mut rtc, 0x07), 0x28);
    }

    #[test]
    fn binary_mode_round_trips() {
        let (mut rtc, _, _) = fixture();
        write(&mut rtc, 0x0B, 0x06); // binary + 24h
        write(&mut rtc, 0x02, 47);
        assert_eq!(read(&mut rtc, 0x02), 47);
    }

    #[test]
    fn uip_asserts_only_in_the_final_window() {
        let (mut rtc, clock, _) = fixture();
        assert_eq!(read(&mut rtc, 0x0A) & 0x80, 0);
        // 244 us before the next second boundary.
        clock.advance_ns(NS_PER_SEC - 100_000);
        assert_eq!(read(&mut rtc, 0x0A) & 0x80, 0x80);
        // Past the boundary the seconds roll over and UIP drops.
        clock.advance_ns(200_000);
        rtc.tick(clock.now_ns());
        assert_eq!(read(&mut rtc, 0x0A) & 0x80, 0);
    }

    #[test]
    fn periodic_interrupt_fires_at_programmed_rate() {
        let (mut rtc, clock, ints) = fixture();
        // REG-A rate 6 = 1024 Hz, REG-B periodic enable.
        write(&mut rtc, 0x0A, 0x26);
        write(&mut rtc, 0x0B, 0x42);
        let deadline = rtc.next_deadline(clock.now_ns()).unwrap();
        assert_eq!(deadline, NS_PER_SEC / 1024);

        clock.advance_ns(deadline);
        rtc.tick(clock.now_ns());
        assert!(ints.borrow().intr_asserted());
        assert_eq!(ints.borrow_mut().acknowledge(), 0x70); // slave IRQ 8

        // REG-C reports the periodic reason once, then clears.
        let c = read(&mut rtc, 0x0C);
        assert_eq!(c & 0xC0, 0xC0);
        assert_eq!(read(&mut rtc, 0x0C), 0);
    }

    #[test]
    fn update_ended_interrupt_once_per_second() {
        let (mut rtc, clock, ints) = fixture();
        write(&mut rtc, 0x0B, 0x12); // UIE, 24h
        let start_sec = read(&mut rtc, 0x00);
        clock.advance_ns(NS_PER_SEC);
        rtc.tick(clock.now_ns());
        assert!(ints.borrow().intr_asserted());
        assert_eq!(read(&mut rtc, 0x0C) & 0x10, 0x10);
        assert_ne!(read(&mut rtc, 0x00), start_sec);
    }

    #[test]
    fn alarm_fires_when_fields_match() {
        let (mut rtc, clock, _) = fixture();
        // Alarm = current time + 1 second (default epoch starts at :00).
        write(&mut rtc, 0x01, 0x01);
        let hour = read(&mut rtc, 0x02);
        write(&mut rtc, 0x03, hour);
        let min = read(&mut rtc, 0x04);
        write(&mut rtc, 0x05, min);
        write(&mut rtc, 0x0B, 0x22); // AIE, 24h
        clock.advance_ns(NS_PER_SEC);
        rtc.tick(clock.now_ns());
        assert_eq!(read(&mut rtc, 0x0C) & 0x20, 0x20);
    }
}
