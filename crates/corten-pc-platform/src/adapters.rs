//! Glue types bridging shared device handles onto the port and MMIO
//! dispatch traits.

use std::cell::RefCell;
use std::rc::Rc;

use corten_devices::clock::Clock;
use corten_platform::{PlatformInterrupts, PortIoDevice};
use corten_vga::Vga;
use memory::{GuestRam, MmioHandler};

use crate::pam::PamState;

/// 8259 pair register ports, routed into the interrupt complex.
pub struct PicPorts {
    pub interrupts: Rc<RefCell<PlatformInterrupts>>,
}

impl PortIoDevice for PicPorts {
    fn port_read(&mut self, port: u16, _size: u8) -> u32 {
        self.interrupts.borrow_mut().pic_mut().io_read(port) as u32
    }

    fn port_write(&mut self, port: u16, value: u32, _size: u8) {
        self.interrupts
            .borrow_mut()
            .pic_mut()
            .io_write(port, value as u8);
    }
}

/// VGA register file ports (0x3B0-0x3DF plus the Bochs VBE pair).
pub struct VgaPorts {
    pub vga: Rc<RefCell<Vga>>,
}

impl PortIoDevice for VgaPorts {
    fn port_read(&mut self, port: u16, size: u8) -> u32 {
        let mut vga = self.vga.borrow_mut();
        match port {
            corten_vga::VBE_INDEX_PORT | corten_vga::VBE_DATA_PORT => {
                vga.vbe_port_read(port) as u32
            }
            _ => {
                if size == 2 {
                    let lo = vga.port_read(port) as u32;
                    let hi = vga.port_read(port + 1) as u32;
                    lo | hi << 8
                } else {
                    vga.port_read(port) as u32
                }
            }
        }
    }

    fn port_write(&mut self, port: u16, value: u32, size: u8) {
        let mut vga = self.vga.borrow_mut();
        match port {
            corten_vga::VBE_INDEX_PORT | corten_vga::VBE_DATA_PORT => {
                vga.vbe_port_write(port, value as u16);
            }
            _ => {
                // 16-bit index+data writes hit index then data ports.
                vga.port_write(port, value as u8);
                if size == 2 {
                    vga.port_write(port + 1, (value >> 8) as u8);
                }
            }
        }
    }
}

/// Local APIC page; register access is routed through the interrupt
/// complex so EOI broadcasts reach the IOAPIC.
pub struct LapicWindow {
    pub interrupts: Rc<RefCell<PlatformInterrupts>>,
    pub clock: Clock,
}

impl MmioHandler for LapicWindow {
    fn mmio_read8(&mut self, addr: u32) -> u8 {
        let now = self.clock.now_ns();
        let mut ints = self.interrupts.borrow_mut();
        let dword = ints.lapic_mmio_read(addr & !3, now);
        (dword >> ((addr & 3) * 8)) as u8
    }

    fn mmio_write8(&mut self, addr: u32, value: u8) {
        let now = self.clock.now_ns();
        self.interrupts
            .borrow_mut()
            .lapic_mmio_write8(addr, value, now);
    }

    fn mmio_read32(&mut self, addr: u32) -> u32 {
        let now = self.clock.now_ns();
        self.interrupts.borrow_mut().lapic_mmio_read(addr, now)
    }

    fn mmio_write32(&mut self, addr: u32, value: u32) {
        let now = self.clock.now_ns();
        self.interrupts
            .borrow_mut()
            .lapic_mmio_write(addr, value, now);
    }
}

pub struct IoapicWindow {
    pub interrupts: Rc<RefCell<PlatformInterrupts>>,
}

impl MmioHandler for IoapicWindow {
    fn mmio_read8(&mut self, addr: u32) -> u8 {
        let dword = self.mmio_read32(addr & !3);
        (dword >> ((addr & 3) * 8)) as u8
    }

    fn mmio_write8(&mut self, addr: u32, value: u8) {
        // Sub-dword IOAPIC writes commit the whole lane-extended dword.
        self.mmio_write32(addr & !3, value as u32);
    }

    fn mmio_read32(&mut self, addr: u32) -> u32 {
        let mut ints = self.interrupts.borrow_mut();
        ints.ioapic_mut().mmio_read(addr)
    }

    fn mmio_write32(&mut self, addr: u32, value: u32) {
        let mut ints = self.interrupts.borrow_mut();
        ints.ioapic_mut().mmio_write(addr, value);
        // Programming an entry may immediately deliver a pending level.
        ints.pump();
    }
}

/// Legacy VGA window (A0000..BFFFF) and the VBE linear framebuffer.
pub struct VgaWindow {
    pub vga: Rc<RefCell<Vga>>,
}

impl MmioHandler for VgaWindow {
    fn mmio_read8(&mut self, addr: u32) -> u8 {
        self.vga.borrow_mut().mem_read(addr)
    }

    fn mmio_write8(&mut self, addr: u32, value: u8) {
        self.vga.borrow_mut().mem_write(addr, value);
    }
}

/// VGA option-ROM aperture.
pub struct VgaRomWindow {
    pub vga: Rc<RefCell<Vga>>,
}

impl MmioHandler for VgaRomWindow {
    fn mmio_read8(&mut self, addr: u32) -> u8 {
        self.vga.borrow().rom_read(addr)
    }

    fn mmio_write8(&mut self, _addr: u32, _value: u8) {}
}

/// Shadow RAM under PAM control (C0000..FFFFF). Reads pass through;
/// writes require the window's write-enable bit.
pub struct ShadowRamWindow {
    pub ram: Rc<RefCell<GuestRam>>,
    pub pam: Rc<RefCell<PamState>>,
}

impl MmioHandler for ShadowRamWindow {
    fn mmio_read8(&mut self, addr: u32) -> u8 {
        let ram = self.ram.borrow();
        if ram.contains(addr) {
            ram.read(addr)
        } else {
            0xFF
        }
    }

    fn mmio_write8(&mut self, addr: u32, value: u8) {
        if self.pam.borrow().write_allowed(addr) {
            let mut ram = self.ram.borrow_mut();
            if ram.contains(addr) {
                ram.write(addr, value);
            }
        } else {
            tracing::trace!(
                target: "pam",
                addr = format_args!("{addr:#07x}"),
                "write to read-only shadow window dropped"
            );
        }
    }
}
