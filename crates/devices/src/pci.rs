//! PCI host bridge (configuration mechanism #1) with the i440FX PMC and
//! the PIIX3 ISA/IDE functions on bus 0.
//!
//! Each function owns a 256-byte configuration space plus a write filter.
//! Filters enforce read-only bits and translate configuration writes into
//! typed [`PciEvent`]s (PAM permission changes, window remaps, option-ROM
//! moves) that the platform applies; the PCI layer itself never touches
//! the port bus or memory map.

use std::cell::RefCell;
use std::rc::Rc;

use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};
use corten_platform::interrupts::IrqLine;
use corten_platform::PortIoDevice;

pub use corten_pc_constants::{PCI_CFG_ADDR_PORT, PCI_CFG_DATA_PORT};

pub type PciConfigSpace = [u8; 256];

/// Side effects of configuration writes, applied by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciEvent {
    /// One 16 KiB shadow window in C0000..FFFFF changed permissions.
    /// Bit 0 of `perms` = readable, bit 1 = writable.
    PamChanged { window: usize, perms: u8 },
    AcpiPmBaseChanged { old: u16, new: u16 },
    AcpiSmbBaseChanged { old: u16, new: u16 },
    IdeBusMasterBaseChanged { new: u16 },
    VgaRomBaseChanged { old: u32, new: u32 },
}

/// Write filter: updates `config` (enforcing read-only bits) and reports
/// any platform-visible side effects.
pub type ConfigWriteFilter = Box<dyn FnMut(&mut PciConfigSpace, u8, u8) -> Vec<PciEvent>>;

struct PciFunction {
    config: Box<PciConfigSpace>,
    filter: ConfigWriteFilter,
}

pub struct PciHost {
    config_address: u32,
    functions: Vec<Option<PciFunction>>,
    events: Vec<PciEvent>,
}

impl Default for PciHost {
    fn default() -> Self {
        Self::new()
    }
}

impl PciHost {
    pub fn new() -> Self {
        Self {
            config_address: 0,
            functions: (0..256).map(|_| None).collect(),
            events: Vec::new(),
        }
    }

    /// Registers a function at `(device, function)` on bus 0.
    pub fn add_function(
        &mut self,
        device: u8,
        function: u8,
        image: &[u8],
        filter: ConfigWriteFilter,
    ) {
        assert!(device < 32 && function < 8, "bad PCI address");
        let mut config: Box<PciConfigSpace> = Box::new([0; 256]);
        config[..image.len()].copy_from_slice(image);
        self.functions[(device as usize) << 3 | function as usize] = Some(PciFunction {
            config,
            filter,
        });
    }

    pub fn config(&self, device: u8, function: u8) -> Option<&PciConfigSpace> {
        self.functions[(device as usize) << 3 | function as usize]
            .as_ref()
            .map(|f| &*f.config)
    }

    pub fn config_mut(&mut self, device: u8, function: u8) -> Option<&mut PciConfigSpace> {
        self.functions[(device as usize) << 3 | function as usize]
            .as_mut()
            .map(|f| &mut *f.config)
    }

    pub fn take_events(&mut self) -> Vec<PciEvent> {
        std::mem::take(&mut self.events)
    }

    /// Direct configuration-space write used by firmware-free bring-up and
    /// restore paths; runs the write filter like a guest access.
    pub fn config_write8(&mut self, device: u8, function: u8, addr: u8, data: u8) {
        let slot = (device as usize) << 3 | function as usize;
        if let Some(func) = self.functions[slot].as_mut() {
            let events = (func.filter)(&mut func.config, addr, data);
            self.events.extend(events);
        }
    }

    fn selected(&self) -> Option<(usize, u8)> {
        if self.config_address & 0x8000_0000 == 0 {
            return None;
        }
        let bus = self.config_address >> 16 & 0xFF;
        if bus != 0 {
            return None;
        }
        let slot = (self.config_address >> 8 & 0xFF) as usize;
        let offset = (self.config_address & 0xFC) as u8;
        Some((slot, offset))
    }

    fn data_read8(&mut self, lane: u8) -> u8 {
        match self.selected() {
            Some((slot, offset)) => match &self.functions[slot] {
                Some(func) => func.config[(offset | lane & 3) as usize],
                None => 0xFF,
            },
            None => 0xFF,
        }
    }

    fn data_write8(&mut self, lane: u8, data: u8) {
        if let Some((slot, offset)) = self.selected() {
            if let Some(func) = self.functions[slot].as_mut() {
                let addr = offset | lane & 3;
                let events = (func.filter)(&mut func.config, addr, data);
                self.events.extend(events);
            }
        }
    }
}

impl PortIoDevice for PciHost {
    fn port_read(&mut self, port: u16, size: u8) -> u32 {
        let lane = (port & 3) as u8;
        match port & !3 {
            PCI_CFG_ADDR_PORT => {
                let v = self.config_address >> (lane * 8);
                match size {
                    1 => v & 0xFF,
                    2 => v & 0xFFFF,
                    _ => v,
                }
            }
            _ => {
                let mut v = 0u32;
                for i in 0..size {
                    v |= (self.data_read8(lane + i) as u32) << (i * 8);
                }
                v
            }
        }
    }

    fn port_write(&mut self, port: u16, value: u32, size: u8) {
        let lane = (port & 3) as u8;
        match port & !3 {
            PCI_CFG_ADDR_PORT => {
                for i in 0..size {
                    let shift = (lane + i) * 8;
                    self.config_address = self.config_address & !(0xFF << shift)
                        | ((value >> (i * 8)) & 0xFF) << shift;
                }
                // Reserved bits read back as zero.
                self.config_address &= !0x7F00_0003;
            }
            _ => {
                for i in 0..size {
                    self.data_write8(lane + i, (value >> (i * 8)) as u8);
                }
            }
        }
    }
}

impl IoSnapshot for PciHost {
    const NAME: &'static str = "pci";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        obj.put_u32("config_address", self.config_address);
        let mut spaces = StateObject::new();
        for (slot, func) in self.functions.iter().enumerate() {
            if let Some(func) = func {
                spaces.put_bytes(&format!("function{slot}"), &func.config[..]);
            }
        }
        obj.put_object("configuration", spaces);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        self.config_address = state.get_u32("config_address");
        if let Some(spaces) = state.object("configuration") {
            for (slot, func) in self.functions.iter_mut().enumerate() {
                if let Some(func) = func {
                    if let Some(bytes) = spaces.bytes(&format!("function{slot}")) {
                        let n = bytes.len().min(256);
                        func.config[..n].copy_from_slice(&bytes[..n]);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Intel 82441FX PMC (host bridge, device 0 function 0)
// ---------------------------------------------------------------------------

pub const I440FX_DEVICE: u8 = 0;

const I440FX_CONFIG: [u8; 128] = [
    0x86, 0x80, 0x37, 0x12, 0x06, 0x00, 0x80, 0x02, // vendor/device/command/status
    0x02, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x01, // 0x50: DRAM config
    0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // 0x58: PAM
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, // 0x70: SMRAM
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
];

/// Power-on configuration images for the platform to install.
pub fn i440fx_config_image() -> [u8; 128] {
    I440FX_CONFIG
}

pub fn piix3_isa_config_image() -> [u8; 192] {
    PIIX3_ISA_CONFIG
}

pub fn piix3_ide_config_image() -> [u8; 64] {
    PIIX3_IDE_CONFIG
}

/// PAM register byte -> affected 16 KiB windows. Window indices count up
/// from C0000 in 16 KiB steps; permissions are 2-bit {read, write}.
fn pam_events(addr: u8, data: u8) -> Vec<PciEvent> {
    let mut events = Vec::new();
    match addr {
        0x59 => {
            // The F segment: one nibble covers all four windows.
            let perms = data >> 4 & 3;
            for window in 12..16 {
                events.push(PciEvent::PamChanged { window, perms });
            }
        }
        0x5A..=0x5F => {
            let first = (addr - 0x5A) as usize * 2;
            events.push(PciEvent::PamChanged {
                window: first,
                perms: data & 3,
            });
            events.push(PciEvent::PamChanged {
                window: first + 1,
                perms: data >> 4 & 3,
            });
        }
        _ => {}
    }
    events
}

pub fn i440fx_filter() -> ConfigWriteFilter {
    Box::new(|config, addr, data| {
        let mut events = Vec::new();
        let value = match addr {
            // Read-only registers keep their current value.
            0x00..=0x03 | 0x06 | 0x08..=0x0C | 0x10..=0x4F | 0x69..=0x6F | 0x73..=0x8F
            | 0x92 | 0x94..=0xFF => config[addr as usize],
            0x04 => (data & 0x40) | 6,
            0x05 => data & 1,
            0x07 => config[addr as usize] & !(data & 0xF9),
            0x0D => data & 0xF8,
            0x50 => data & 0x70,
            0x51 => (data & 0x80) | 1,
            0x59..=0x5F => {
                events = pam_events(addr, data);
                data
            }
            0x60..=0x67 => data, // DRB registers: stored, no side effects
            _ => data,
        };
        config[addr as usize] = value;
        events
    })
}

// ---------------------------------------------------------------------------
// Intel 82371SB (PIIX3) ISA bridge, device 1 function 0
// ---------------------------------------------------------------------------

pub const PIIX3_DEVICE: u8 = 1;

const PIIX3_ISA_CONFIG: [u8; 192] = [
    0x86, 0x80, 0x00, 0x70, 0x07, 0x00, 0x00, 0x02, //
    0x00, 0x00, 0x01, 0x06, 0x00, 0x00, 0x80, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x4D, 0x00, 0x03, 0x00, // 0x4C: ISA config
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x80, 0x80, 0x80, 0x80, 0x00, 0x00, 0x00, 0x00, // 0x60: PIRQ routes
    0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C, //
    0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // 0xA8
    0x0F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
];

pub fn piix3_isa_filter() -> ConfigWriteFilter {
    Box::new(|config, addr, data| {
        let value = match addr {
            0x00..=0x03 | 0x08..=0x4B | 0x4D | 0x50..=0x5F | 0x64..=0x68 | 0x6C..=0x6F
            | 0x71..=0x75 | 0x7A..=0x7F | 0x81 | 0x83..=0x9F | 0xA1 | 0xA9 | 0xAD
            | 0xAF..=0xFF => config[addr as usize],
            0x04 => (data & 8) | 7,
            0x05 => data & 1,
            0x07 => (config[addr as usize] & !(data & 0x78)) | 2,
            0x4F => data & 1, // IOAPIC enable
            0x60..=0x63 => data & 0x8F,
            0x6A => data & 0xD7,
            0x80 => data & 0x80,
            _ => data,
        };
        config[addr as usize] = value;
        Vec::new()
    })
}

// ---------------------------------------------------------------------------
// PIIX3 IDE function (device 1 function 1): only the bus-master BAR matters
// ---------------------------------------------------------------------------

const PIIX3_IDE_CONFIG: [u8; 64] = [
    0x86, 0x80, 0x10, 0x70, 0x01, 0x00, 0x80, 0x02, //
    0x00, 0x80, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // 0x20: BAR4
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
];

pub const IDE_BUS_MASTER_DEFAULT_BASE: u16 = 0xC000;

fn bar4_base(config: &PciConfigSpace) -> u16 {
    u16::from_le_bytes([config[0x20], config[0x21]]) & 0xFFFC
}

pub fn piix3_ide_filter() -> ConfigWriteFilter {
    Box::new(|config, addr, data| {
        let value = match addr {
            0x00..=0x03 | 0x08..=0x0C | 0x0E..=0x1F | 0x24..=0x3F | 0x45..=0xFF => {
                config[addr as usize]
            }
            0x20 => data | 1, // I/O space indicator is hardwired
            _ => data,
        };
        config[addr as usize] = value;
        // Remap only once the last BAR byte lands, like real firmware
        // programs it; the platform compares against the currently mapped
        // base and moves the window if needed.
        if addr == 0x23 {
            vec![PciEvent::IdeBusMasterBaseChanged {
                new: bar4_base(config),
            }]
        } else {
            Vec::new()
        }
    })
}

/// Bus-master IDE register stub behind BAR4. There is no disk model in the
/// core; the window exists so BAR reprogramming has something real to move.
#[derive(Default)]
pub struct BusMasterIde {
    regs: [u8; 16],
    base: u16,
}

impl BusMasterIde {
    pub fn new() -> Self {
        Self {
            regs: [0; 16],
            base: IDE_BUS_MASTER_DEFAULT_BASE,
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn set_base(&mut self, base: u16) {
        self.base = base;
    }
}

impl PortIoDevice for BusMasterIde {
    fn port_read(&mut self, port: u16, _size: u8) -> u32 {
        self.regs[(port.wrapping_sub(self.base) & 15) as usize] as u32
    }

    fn port_write(&mut self, port: u16, value: u32, _size: u8) {
        self.regs[(port.wrapping_sub(self.base) & 15) as usize] = value as u8;
    }
}

/// PIRQ routing: a device's INTx pin and slot select one of the four PIRQ
/// route registers; the register names the ISA IRQ to drive, bit 7
/// disables the route. Routed lines are treated as level-triggered.
pub struct PciIrqRouter {
    host: Rc<RefCell<PciHost>>,
    lines: [IrqLine; 16],
}

impl PciIrqRouter {
    pub fn new(host: Rc<RefCell<PciHost>>, lines: [IrqLine; 16]) -> Self {
        Self { host, lines }
    }

    pub fn set_irq_line(&self, device: u8, asserted: bool) {
        let host = self.host.borrow();
        let Some(dev_config) = host.config(device, 0) else {
            tracing::warn!(target: "pci", device, "INTx from a device with no configuration space");
            return;
        };
        let pin = dev_config[0x3D];
        if pin == 0 {
            return; // no INTx pin
        }
        let Some(piix) = host.config(PIIX3_DEVICE, 0) else {
            return;
        };
        let index = (pin - 1 + device.wrapping_sub(1)) & 3;
        let route = piix[0x60 + index as usize];
        drop(host);
        if route & 0x80 != 0 || route & 0x0F > 15 {
            return;
        }
        let line = &self.lines[(route & 0x0F) as usize];
        if asserted {
            line.raise();
        } else {
            line.lower();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corten_platform::PlatformInterrupts;

    fn host_with_chipset() -> PciHost {
        let mut host = PciHost::new();
        host.add_function(I440FX_DEVICE, 0, &I440FX_CONFIG, i440fx_filter());
        host.add_function(PIIX3_DEVICE, 0, &PIIX3_ISA_CONFIG, piix3_isa_filter());
        host.add_function(PIIX3_DEVICE, 1, &PIIX3_IDE_CONFIG, piix3_ide_filter());
        host
    }

    fn cfg_addr(device: u8, function: u8, offset: u8) -> u32 {
        0x8000_0000 | (device as u32) << 11 | (function as u32) << 8 | offset as u32
    }

    #[test]
    fn host_bridge_identifies_as_i440fx() {
        let mut host = host_with_chipset();
        host.port_write(0xCF8, cfg_addr(0, 0, 0), 4);
        let id = host.port_read(0xCFC, 4);
        assert_eq!(id, 0x1237_8086);
    }

    #[test]
    fn byte_fractions_of_config_registers_work() {
        let mut host = host_with_chipset();
        host.port_write(0xCF8, cfg_addr(0, 0, 0), 4);
        assert_eq!(host.port_read(0xCFC, 1), 0x86);
        assert_eq!(host.port_read(0xCFD, 1), 0x80);
        assert_eq!(host.port_read(0xCFE, 2), 0x1237);
    }

    #[test]
    fn absent_function_reads_all_ones() {
        let mut host = host_with_chipset();
        host.port_write(0xCF8, cfg_addr(9, 0, 0), 4);
        assert_eq!(host.port_read(0xCFC, 4), 0xFFFF_FFFF);
    }

    #[test]
    fn pam_write_emits_window_permissions() {
        let mut host = host_with_chipset();
        host.port_write(0xCF8, cfg_addr(0, 0, 0x58), 4);
        // Byte lane 1 = register 0x59: F-segment read+write.
        host.port_write(0xCFD, 0x30, 1);
        let events = host.take_events();
        assert_eq!(events.len(), 4);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(
                *e,
                PciEvent::PamChanged {
                    window: 12 + i,
                    perms: 3
                }
            );
        }

        // Register 0x5A: C0000 nibble low, C4000 nibble high.
        host.port_write(0xCF8, cfg_addr(0, 0, 0x58), 4);
        host.port_write(0xCFE, 0x21, 1);
        let events = host.take_events();
        assert_eq!(
            events,
            vec![
                PciEvent::PamChanged { window: 0, perms: 1 },
                PciEvent::PamChanged { window: 1, perms: 2 },
            ]
        );
    }

    #[test]
    fn ide_bar4_byte3_write_triggers_remap() {
        let mut host = host_with_chipset();
        // Seed BAR4 with the canonical default.
        host.config_write8(1, 1, 0x20, 0x01);
        host.config_write8(1, 1, 0x21, 0xC0);
        host.config_write8(1, 1, 0x23, 0x00);
        host.take_events();

        host.port_write(0xCF8, cfg_addr(1, 1, 0x20), 4);
        host.port_write(0xCFC, 0xD801, 2);
        assert!(host.take_events().is_empty(), "remap waits for byte 3");
        host.port_write(0xCFE, 0x0000, 2);
        assert_eq!(
            host.take_events(),
            vec![PciEvent::IdeBusMasterBaseChanged { new: 0xD800 }]
        );
    }

    #[test]
    fn read_only_regions_reject_writes() {
        let mut host = host_with_chipset();
        host.port_write(0xCF8, cfg_addr(0, 0, 0), 4);
        host.port_write(0xCFC, 0xFFFF_FFFF, 4);
        host.port_write(0xCF8, cfg_addr(0, 0, 0), 4);
        assert_eq!(host.port_read(0xCFC, 4), 0x1237_8086);
    }

    #[test]
    fn pirq_routing_raises_the_programmed_isa_line() {
        let mut host = host_with_chipset();
        // Give device 3 an INTA# pin.
        host.add_function(3, 0, &[0u8; 64], Box::new(|config, addr, data| {
            config[addr as usize] = data;
            Vec::new()
        }));
        host.config_write8(3, 0, 0x3D, 1);
        // Route PIRQ the swizzle picks for dev 3 pin 1 -> IRQ 11.
        let index = (1u8 - 1 + 3 - 1) & 3;
        host.config_write8(PIIX3_DEVICE, 0, 0x60 + index, 11);

        let host = Rc::new(RefCell::new(host));
        let ints = Rc::new(RefCell::new(PlatformInterrupts::new(false)));
        ints.borrow_mut().pic_mut().set_offsets(0x20, 0x28);
        let lines: [IrqLine; 16] =
            std::array::from_fn(|i| IrqLine::new(ints.clone(), i as u8));
        let router = PciIrqRouter::new(host, lines);

        router.set_irq_line(3, true);
        assert!(ints.borrow().intr_asserted());
        assert_eq!(ints.borrow_mut().acknowledge(), 0x28 + 3); // IRQ 11
        router.set_irq_line(3, false);
    }
}
