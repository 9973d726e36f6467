//! Local APIC model (xAPIC, memory-mapped at `0xFEE00000`).
//!
//! The register bank, acceptance rules and dispatch decision follow the
//! Intel SDM vol. 3 §10.8: a pending vector is delivered when it outranks
//! both the highest in-service vector and the task-priority class. The
//! platform interrupt complex carries bus messages in from the IOAPIC/ICR
//! and EOI broadcasts back out.

use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};
use corten_pc_constants::LAPIC_MMIO_BASE;

pub const APIC_ERROR_SEND_ACCEPT: u32 = 4;
pub const APIC_ERROR_RECV_ACCEPT: u32 = 8;
pub const APIC_ERROR_SEND_INVALID_VECTOR: u32 = 32;
pub const APIC_ERROR_RECV_INVALID_VECTOR: u32 = 64;
pub const APIC_ERROR_ILLEGAL_REGISTER: u32 = 128;

const LVT_DISABLED: u32 = 1 << 16;
const LVT_COUNT: usize = 7;

const LVT_INDEX_TIMER: usize = 1;
const LVT_INDEX_ERROR: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed,
    LowestPriority,
    Smi,
    Nmi,
    Init,
    ExtInt,
}

impl DeliveryMode {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits & 7 {
            0 => Some(Self::Fixed),
            1 => Some(Self::LowestPriority),
            2 => Some(Self::Smi),
            4 => Some(Self::Nmi),
            5 => Some(Self::Init),
            7 => Some(Self::ExtInt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

/// One interrupt message on the (virtual) APIC bus.
#[derive(Debug, Clone, Copy)]
pub struct BusMessage {
    pub vector: u8,
    pub mode: DeliveryMode,
    pub trigger: TriggerMode,
}

#[inline]
fn bit_get(bank: &[u32; 8], bit: u8) -> bool {
    bank[(bit >> 5) as usize] & (1 << (bit & 31)) != 0
}

#[inline]
fn bit_set(bank: &mut [u32; 8], bit: u8, value: bool) {
    let idx = (bit >> 5) as usize;
    let mask = 1 << (bit & 31);
    if value {
        bank[idx] |= mask;
    } else {
        bank[idx] &= !mask;
    }
}

fn highest_set_bit(bank: &[u32; 8]) -> Option<u8> {
    for i in (0..8).rev() {
        if bank[i] != 0 {
            return Some((i as u32 * 32 + 31 - bank[i].leading_zeros()) as u8);
        }
    }
    None
}

#[inline]
fn vector_invalid(vector: u8) -> bool {
    vector < 16 || vector == 255
}

pub struct LocalApic {
    enabled: bool,
    id: u32,
    spurious_vector: u32,
    lvt: [u32; LVT_COUNT],
    isr: [u32; 8],
    tmr: [u32; 8],
    irr: [u32; 8],
    icr: [u32; 2],
    error: u32,
    cached_error: u32,
    timer_divide: u32,
    timer_initial_count: u32,
    timer_reload_time: u64,
    timer_next: u64,
    destination_format: u32,
    logical_destination: u32,
    task_priority: u32,
    processor_priority: u32,
    intr_output: bool,
    fast_return: bool,
    /// Byte-lane write latch for sub-dword MMIO access.
    lane_latch: u32,
    /// Level-triggered vectors whose EOI must be forwarded to the IOAPIC.
    eoi_broadcasts: Vec<u8>,
    pending_nmi: bool,
    pending_init: bool,
}

impl Default for LocalApic {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LocalApic {
    pub fn new(enabled: bool) -> Self {
        let mut apic = Self {
            enabled,
            id: 0,
            spurious_vector: 0xFF,
            lvt: [LVT_DISABLED; LVT_COUNT],
            isr: [0; 8],
            tmr: [0; 8],
            irr: [0; 8],
            icr: [0; 2],
            error: 0,
            cached_error: 0,
            timer_divide: 0,
            timer_initial_count: 0,
            timer_reload_time: 0,
            timer_next: 0,
            destination_format: !0,
            logical_destination: 0,
            task_priority: 0,
            processor_priority: 0,
            intr_output: false,
            fast_return: false,
            lane_latch: 0,
            eoi_broadcasts: Vec::new(),
            pending_nmi: false,
            pending_init: false,
        };
        apic.reset();
        apic
    }

    pub fn reset(&mut self) {
        self.spurious_vector = 0xFF;
        self.id = 0;
        self.error = 0;
        self.cached_error = 0;
        self.destination_format = !0;
        self.logical_destination = 0;
        self.lvt = [LVT_DISABLED; LVT_COUNT];
        self.isr = [0; 8];
        self.tmr = [0; 8];
        self.irr = [0; 8];
        self.icr = [0; 2];
        self.task_priority = 0;
        self.processor_priority = 0;
        self.timer_divide = 0;
        self.timer_initial_count = 0;
        self.timer_next = 0;
        self.intr_output = false;
        self.fast_return = false;
        self.eoi_broadcasts.clear();
        self.pending_nmi = false;
        self.pending_init = false;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn intr_output(&self) -> bool {
        self.intr_output
    }

    pub fn take_fast_return(&mut self) -> bool {
        std::mem::take(&mut self.fast_return)
    }

    pub fn take_eoi_broadcasts(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.eoi_broadcasts)
    }

    pub fn take_pending_nmi(&mut self) -> bool {
        std::mem::take(&mut self.pending_nmi)
    }

    pub fn nmi_pending(&self) -> bool {
        self.pending_nmi
    }

    pub fn take_pending_init(&mut self) -> bool {
        std::mem::take(&mut self.pending_init)
    }

    /// Highest pending-but-undelivered vector, for diagnostics and tests.
    pub fn pending_vector(&self) -> Option<u8> {
        highest_set_bit(&self.irr)
    }

    /// SDM §10.8 dispatch: raise INTR when the highest requested vector
    /// outranks the highest in-service vector and the TPR class.
    fn send_highest_priority(&mut self) {
        if self.intr_output {
            // Already signalled; the CPU has not acknowledged yet.
            return;
        }
        let Some(highest_irr) = highest_set_bit(&self.irr) else {
            return;
        };
        let highest_isr = highest_set_bit(&self.isr).map_or(-1i32, |v| v as i32);
        if (highest_irr as i32) > highest_isr
            && (highest_irr as u32 & 0xF0) > (self.task_priority & 0xF0)
        {
            self.processor_priority = highest_irr as u32 & 0xF0;
            self.intr_output = true;
            self.fast_return = true;
        }
    }

    /// Interrupt acknowledge: moves the winning vector from IRR to ISR and
    /// drops the INTR line.
    pub fn acknowledge(&mut self) -> u8 {
        self.intr_output = false;
        let Some(vector) = highest_set_bit(&self.irr) else {
            // The request vanished between delivery and acknowledge.
            return (self.spurious_vector & 0xFF) as u8;
        };
        bit_set(&mut self.irr, vector, false);
        bit_set(&mut self.isr, vector, true);
        vector
    }

    pub fn receive_bus_message(&mut self, msg: BusMessage) {
        match msg.mode {
            DeliveryMode::Init => {
                self.pending_init = true;
            }
            DeliveryMode::Nmi => {
                self.pending_nmi = true;
                self.fast_return = true;
            }
            DeliveryMode::Smi => {
                tracing::warn!(target: "apic", "SMI delivery not implemented; dropped");
            }
            DeliveryMode::ExtInt => {
                // Legacy vector supplied by the 8259 at acknowledge time;
                // the interrupt complex consults the PIC directly.
            }
            DeliveryMode::Fixed | DeliveryMode::LowestPriority => {
                if vector_invalid(msg.vector) {
                    self.error |= APIC_ERROR_RECV_INVALID_VECTOR;
                    self.raise_error_interrupt();
                    return;
                }
                if bit_get(&self.irr, msg.vector) {
                    return;
                }
                bit_set(&mut self.irr, msg.vector, true);
                bit_set(&mut self.tmr, msg.vector, msg.trigger == TriggerMode::Level);
                self.send_highest_priority();
            }
        }
    }

    fn raise_error_interrupt(&mut self) {
        let lvt = self.lvt[LVT_INDEX_ERROR];
        if lvt & LVT_DISABLED == 0 {
            let vector = (lvt & 0xFF) as u8;
            if !vector_invalid(vector) {
                self.receive_bus_message(BusMessage {
                    vector,
                    mode: DeliveryMode::Fixed,
                    trigger: TriggerMode::Edge,
                });
            }
        }
    }

    fn send_ipi(&mut self, vector: u8, mode: DeliveryMode, trigger: TriggerMode, dest: Option<u32>) {
        if vector_invalid(vector) && matches!(mode, DeliveryMode::Fixed | DeliveryMode::LowestPriority) {
            self.error |= APIC_ERROR_SEND_INVALID_VECTOR;
        }
        // Single-CPU machine: anything addressed elsewhere is dropped.
        if let Some(dest) = dest {
            if dest != self.id {
                self.error |= APIC_ERROR_SEND_ACCEPT;
                return;
            }
        }
        self.receive_bus_message(BusMessage { vector, mode, trigger });
    }

    fn timer_divide_shift(&self) -> u32 {
        (((self.timer_divide >> 1 & 4) | (self.timer_divide & 3)) + 1) & 7
    }

    fn timer_period(&self) -> u64 {
        (self.timer_initial_count as u64) << self.timer_divide_shift()
    }

    fn timer_current_count(&self, now: u64) -> u32 {
        if self.timer_initial_count == 0 {
            return 0;
        }
        let elapsed = (now.wrapping_sub(self.timer_reload_time) >> self.timer_divide_shift()) as u32;
        self.timer_initial_count - elapsed % self.timer_initial_count
    }

    /// Fires the timer if due and returns ticks until the next event.
    pub fn next_deadline(&mut self, now: u64) -> Option<u64> {
        if !self.enabled || self.timer_initial_count == 0 || self.timer_next == 0 {
            return None;
        }
        let lvt = self.lvt[LVT_INDEX_TIMER];
        if self.timer_next <= now {
            if lvt & LVT_DISABLED == 0 {
                self.receive_bus_message(BusMessage {
                    vector: (lvt & 0xFF) as u8,
                    mode: DeliveryMode::Fixed,
                    trigger: TriggerMode::Edge,
                });
            }
            match lvt >> 17 & 3 {
                1 => self.timer_next += self.timer_period(),
                0 => {
                    self.timer_next = 0;
                    return None;
                }
                _ => {
                    // TSC-deadline mode is accepted but never fires.
                    self.timer_next = 0;
                    return None;
                }
            }
        }
        Some(self.timer_next - now)
    }

    pub fn mmio_read(&mut self, addr: u32, now: u64) -> u32 {
        let reg = addr.wrapping_sub(LAPIC_MMIO_BASE) >> 4;
        match reg {
            0x02 => self.id,
            // Version 0x14, six usable LVT entries.
            0x03 => 0x14 | 5 << 16,
            0x08 => self.task_priority,
            0x09 => self.processor_priority,
            0x0B => 0,
            0x0D => self.logical_destination,
            0x0E => self.destination_format,
            0x0F => self.spurious_vector,
            0x10..=0x17 => self.isr[(reg & 7) as usize],
            0x18..=0x1F => self.tmr[(reg & 7) as usize],
            0x20..=0x27 => self.irr[(reg & 7) as usize],
            0x28 => self.cached_error,
            0x2F | 0x32..=0x37 => self.lvt[Self::lvt_slot(reg)],
            0x30 | 0x31 => self.icr[(reg & 1) as usize],
            0x38 => self.timer_initial_count,
            0x39 => self.timer_current_count(now),
            0x3E => self.timer_divide,
            _ => {
                tracing::debug!(target: "apic", reg, "read of reserved register");
                self.error |= APIC_ERROR_ILLEGAL_REGISTER;
                0
            }
        }
    }

    fn lvt_slot(reg: u32) -> usize {
        match reg {
            0x2F => 0,            // CMCI
            0x32 => 1,            // Timer
            0x33 => 2,            // Thermal
            0x34 => 3,            // Performance counter
            0x35 => 4,            // LINT0
            0x36 => 5,            // LINT1
            _ => LVT_INDEX_ERROR, // 0x37
        }
    }

    pub fn mmio_write(&mut self, addr: u32, data: u32, now: u64) {
        let reg = addr.wrapping_sub(LAPIC_MMIO_BASE) >> 4;
        match reg {
            0x02 => self.id = data,
            0x03 => self.error |= APIC_ERROR_ILLEGAL_REGISTER,
            0x08 => {
                self.task_priority = data & 0xFF;
                // PPR is max(TPR class, highest-in-service class).
                self.processor_priority = match highest_set_bit(&self.isr) {
                    None => self.task_priority,
                    Some(isrv) => {
                        if (self.task_priority & 0xF0) as i32 > (isrv as i32 & 0xF0) {
                            self.task_priority
                        } else {
                            isrv as u32 & 0xF0
                        }
                    }
                };
                self.send_highest_priority();
            }
            0x0B => {
                if let Some(vector) = highest_set_bit(&self.isr) {
                    bit_set(&mut self.isr, vector, false);
                    if bit_get(&self.tmr, vector) {
                        // Level-triggered: tell the IOAPIC so it can clear
                        // its remote-IRR (EOI-broadcast suppression is not
                        // supported).
                        self.eoi_broadcasts.push(vector);
                    }
                    self.send_highest_priority();
                }
            }
            0x0D => self.logical_destination = data & 0xFF00_0000,
            0x0E => {
                self.destination_format = self.destination_format & !0xF000_0000 | data & 0xF000_0000;
            }
            0x0F => {
                self.spurious_vector = data;
                if data & 0x100 == 0 {
                    // Software-disable masks every LVT entry.
                    for lvt in &mut self.lvt {
                        *lvt |= LVT_DISABLED;
                    }
                }
            }
            0x10..=0x17 => self.isr[(reg & 7) as usize] = data,
            0x18..=0x1F => self.tmr[(reg & 7) as usize] = data,
            0x20..=0x27 => self.irr[(reg & 7) as usize] = data,
            0x28 => {
                // Write arms the ESR: latch accumulated errors, clear live.
                self.cached_error = self.error;
                self.error = 0;
            }
            0x2F | 0x32..=0x37 => self.lvt[Self::lvt_slot(reg)] = data,
            0x30 => {
                self.icr[0] = data;
                let vector = (data & 0xFF) as u8;
                let Some(mode) = DeliveryMode::from_bits(data >> 8) else {
                    self.error |= APIC_ERROR_SEND_ACCEPT;
                    return;
                };
                let level = data >> 14 & 1;
                let trigger = if data >> 15 & 1 != 0 {
                    TriggerMode::Level
                } else {
                    TriggerMode::Edge
                };
                if mode == DeliveryMode::Init && level == 0 && trigger == TriggerMode::Level {
                    // INIT level de-assert: not an INIT.
                    return;
                }
                match data >> 18 & 3 {
                    0 => {
                        let dest = self.icr[1] >> 24;
                        self.send_ipi(vector, mode, trigger, Some(dest));
                    }
                    1 => self.send_ipi(vector, DeliveryMode::Fixed, trigger, None),
                    2 => self.send_ipi(vector, mode, trigger, None),
                    _ => {} // all-excluding-self: nobody else exists
                }
            }
            0x31 => self.icr[1] = data,
            0x38 => {
                self.timer_initial_count = data;
                self.timer_reload_time = now;
                self.timer_next = if data == 0 { 0 } else { now + self.timer_period() };
                self.fast_return = true;
            }
            0x39 => {}
            0x3E => {
                self.timer_divide = data;
                self.fast_return = true;
            }
            _ => {
                tracing::debug!(target: "apic", reg, data, "write to reserved register");
                self.error |= APIC_ERROR_ILLEGAL_REGISTER;
            }
        }
    }

    /// Sub-dword MMIO access. Reads shift out of the aligned register;
    /// writes latch bytes and commit on the top lane.
    pub fn mmio_read8(&mut self, addr: u32, now: u64) -> u8 {
        (self.mmio_read(addr & !3, now) >> ((addr & 3) * 8)) as u8
    }

    pub fn mmio_write8(&mut self, addr: u32, data: u8, now: u64) {
        let shift = (addr & 3) * 8;
        self.lane_latch = self.lane_latch & !(0xFF << shift) | (data as u32) << shift;
        if addr & 3 == 3 {
            let latch = self.lane_latch;
            self.mmio_write(addr & !3, latch, now);
        }
    }
}

impl IoSnapshot for LocalApic {
    const NAME: &'static str = "apic";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        obj.put_bool("enabled", self.enabled);
        obj.put_u32("id", self.id);
        obj.put_u32("spurious_vector", self.spurious_vector);
        obj.put_u32_slice("lvt", &self.lvt);
        obj.put_u32_slice("isr", &self.isr);
        obj.put_u32_slice("tmr", &self.tmr);
        obj.put_u32_slice("irr", &self.irr);
        obj.put_u32_slice("icr", &self.icr);
        obj.put_u32("error", self.error);
        obj.put_u32("cached_error", self.cached_error);
        obj.put_u32("timer_divide", self.timer_divide);
        obj.put_u32("timer_initial_count", self.timer_initial_count);
        obj.put_u64("timer_reload_time", self.timer_reload_time);
        obj.put_u64("timer_next", self.timer_next);
        obj.put_u32("destination_format", self.destination_format);
        obj.put_u32("logical_destination", self.logical_destination);
        obj.put_u32("task_priority", self.task_priority);
        obj.put_u32("processor_priority", self.processor_priority);
        obj.put_bool("intr_output", self.intr_output);
        obj.put_u32("lane_latch", self.lane_latch);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        self.enabled = state.get_bool("enabled");
        self.id = state.get_u32("id");
        self.spurious_vector = state.get_u32("spurious_vector");
        let lvt: [u32; LVT_COUNT] = state.get_u32_array("lvt");
        self.lvt = lvt;
        self.isr = state.get_u32_array("isr");
        self.tmr = state.get_u32_array("tmr");
        self.irr = state.get_u32_array("irr");
        let icr: [u32; 2] = state.get_u32_array("icr");
        self.icr = icr;
        self.error = state.get_u32("error");
        self.cached_error = state.get_u32("cached_error");
        self.timer_divide = state.get_u32("timer_divide");
        self.timer_initial_count = state.get_u32("timer_initial_count");
        self.timer_reload_time = state.get_u64("timer_reload_time");
        self.timer_next = state.get_u64("timer_next");
        self.destination_format = state.get_u32("destination_format");
        self.logical_destination = state.get_u32("logical_destination");
        self.task_priority = state.get_u32("task_priority");
        self.processor_priority = state.get_u32("processor_priority");
        self.intr_output = state.get_bool("intr_output");
        self.lane_latch = state.get_u32("lane_latch");
        self.fast_return = false;
        self.eoi_broadcasts.clear();
        self.pending_nmi = false;
        self.pending_init = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(vector: u8) -> BusMessage {
        BusMessage {
            vector,
            mode: DeliveryMode::Fixed,
            trigger: TriggerMode::Edge,
        }
    }

    #[test]
    fn fixed_delivery_raises_intr_and_acknowledges() {
        let mut apic = LocalApic::new(true);
        apic.receive_bus_message(msg(0x41));
        assert!(apic.intr_output());
        assert!(apic.take_fast_return());
        assert_eq!(apic.acknowledge(), 0x41);
        assert!(!apic.intr_output());
        assert!(bit_get(&apic.isr, 0x41));
    }

    #[test]
    fn tpr_class_suppresses_lower_vectors() {
        let mut apic = LocalApic::new(true);
        apic.mmio_write(LAPIC_MMIO_BASE + 0x80, 0xF0, 0);
        apic.receive_bus_message(msg(0x90));
        assert!(!apic.intr_output(), "vector below TPR class must not deliver");
        apic.mmio_write(LAPIC_MMIO_BASE + 0x80, 0x00, 0);
        assert!(apic.intr_output(), "lowering TPR re-evaluates delivery");
    }

    #[test]
    fn higher_vector_preempts_in_service() {
        let mut apic = LocalApic::new(true);
        apic.receive_bus_message(msg(0x40));
        assert_eq!(apic.acknowledge(), 0x40);
        apic.receive_bus_message(msg(0x30));
        assert!(!apic.intr_output(), "lower vector must wait for EOI");
        apic.receive_bus_message(msg(0x80));
        assert!(apic.intr_output(), "higher vector preempts");
    }

    #[test]
    fn eoi_unblocks_and_broadcasts_level_vectors() {
        let mut apic = LocalApic::new(true);
        apic.receive_bus_message(BusMessage {
            vector: 0x51,
            mode: DeliveryMode::Fixed,
            trigger: TriggerMode::Level,
        });
        assert_eq!(apic.acknowledge(), 0x51);
        apic.mmio_write(LAPIC_MMIO_BASE + 0xB0, 0, 0);
        assert_eq!(apic.take_eoi_broadcasts(), vec![0x51]);
        assert!(!bit_get(&apic.isr, 0x51));
    }

    #[test]
    fn invalid_vector_sets_error_bit() {
        let mut apic = LocalApic::new(true);
        apic.receive_bus_message(msg(3));
        assert!(!apic.intr_output());
        // ESR is write-to-arm.
        apic.mmio_write(LAPIC_MMIO_BASE + 0x280, 0, 0);
        assert_eq!(
            apic.mmio_read(LAPIC_MMIO_BASE + 0x280, 0) & APIC_ERROR_RECV_INVALID_VECTOR,
            APIC_ERROR_RECV_INVALID_VECTOR
        );
    }

    #[test]
    fn self_ipi_via_icr_shorthand() {
        let mut apic = LocalApic::new(true);
        apic.mmio_write(LAPIC_MMIO_BASE + 0x300, (1 << 18) | 0x66, 0);
        assert!(apic.intr_output());
        assert_eq!(apic.acknowledge(), 0x66);
    }

    #[test]
    fn periodic_timer_fires_and_rearms() {
        let mut apic = LocalApic::new(true);
        // Timer LVT: vector 0x20, periodic, unmasked.
        apic.mmio_write(LAPIC_MMIO_BASE + 0x320, 0x20 | 1 << 17, 0);
        // Divide-by-2 encoding 0b0000 -> shift 1.
        apic.mmio_write(LAPIC_MMIO_BASE + 0x3E0, 0, 0);
        apic.mmio_write(LAPIC_MMIO_BASE + 0x380, 100, 0);
        assert!(apic.take_fast_return());

        // Period is 100 << 1 = 200 cycles.
        assert_eq!(apic.next_deadline(0), Some(200));
        assert_eq!(apic.next_deadline(200), Some(200));
        assert!(apic.intr_output());
        assert_eq!(apic.acknowledge(), 0x20);
    }

    #[test]
    fn one_shot_timer_disables_after_firing() {
        let mut apic = LocalApic::new(true);
        apic.mmio_write(LAPIC_MMIO_BASE + 0x320, 0x20, 0);
        // Divide-by-1 encoding 0b1011 -> shift 0.
        apic.mmio_write(LAPIC_MMIO_BASE + 0x3E0, 0xB, 0);
        apic.mmio_write(LAPIC_MMIO_BASE + 0x380, 64, 0);
        assert_eq!(apic.next_deadline(0), Some(64));
        assert_eq!(apic.next_deadline(64), None);
        assert!(apic.intr_output());
        assert_eq!(apic.next_deadline(1000), None);
    }

    #[test]
    fn byte_lane_access_round_trips() {
        let mut apic = LocalApic::new(true);
        for (i, b) in 0xCAFE_0042u32.to_le_bytes().iter().enumerate() {
            apic.mmio_write8(LAPIC_MMIO_BASE + 0xD0 + i as u32, *b, 0);
        }
        assert_eq!(apic.mmio_read(LAPIC_MMIO_BASE + 0xD0, 0), 0xCA00_0000);
        assert_eq!(apic.mmio_read8(LAPIC_MMIO_BASE + 0xD3, 0), 0xCA);
    }
}
