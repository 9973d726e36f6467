use std::cell::RefCell;
use std::rc::Rc;

use corten_devices::a20_gate::{FastA20, A20_GATE_PORT};
use corten_devices::acpi_pm::AcpiPm;
use corten_devices::clock::Clock;
use corten_devices::dma::Dma8237;
use corten_devices::i8042::{I8042, I8042_DATA_PORT, I8042_STATUS_PORT};
use corten_devices::pci::{
    self, BusMasterIde, PciEvent, PciHost, PciIrqRouter, I440FX_DEVICE, PIIX3_DEVICE,
};
use corten_devices::pit::{Pit, PIT_CH0_PORT, SYSTEM_CTRL_PORT};
use corten_devices::reset_ctrl::{ResetCtrl, RESET_CTRL_PORT};
use corten_devices::rtc::{Rtc, CMOS_INDEX_PORT};
use corten_interrupts::pic;
use corten_io_snapshot::IoSnapshot;
use corten_pc_constants::{
    IOAPIC_MMIO_BASE, IOAPIC_MMIO_SIZE, LAPIC_MMIO_BASE, LAPIC_MMIO_SIZE, SHADOW_BASE,
    VBE_LFB_BASE, VGA_ROM_DEFAULT_BASE, VGA_WINDOW_BASE,
};
use corten_platform::interrupts::IrqLine;
use corten_platform::io::{WIDTH_16, WIDTH_32, WIDTH_8};
use corten_platform::{A20Gate, IoPortBus, PlatformInterrupts, ResetEvent, ResetEvents};
use corten_vga::Vga;
use memory::{GuestRam, MmioRouter};

use crate::adapters::{
    IoapicWindow, LapicWindow, PicPorts, ShadowRamWindow, VgaPorts, VgaRomWindow, VgaWindow,
};
use crate::pam::PamState;

#[derive(Debug, Clone)]
pub struct PcPlatformConfig {
    pub ram_size_bytes: u32,
    pub apic_enabled: bool,
    pub enable_vga: bool,
    pub enable_i8042: bool,
    pub enable_pci: bool,
    pub enable_acpi: bool,
    pub vga_vram_size: u32,
    /// Wall-clock seed for the RTC; `None` keeps the deterministic default.
    pub rtc_epoch_seconds: Option<i64>,
}

impl Default for PcPlatformConfig {
    fn default() -> Self {
        Self {
            ram_size_bytes: 16 << 20,
            apic_enabled: true,
            enable_vga: true,
            enable_i8042: true,
            enable_pci: true,
            enable_acpi: true,
            vga_vram_size: corten_vga::DEFAULT_VRAM_SIZE,
            rtc_epoch_seconds: None,
        }
    }
}

pub struct PcPlatform {
    pub config: PcPlatformConfig,
    pub io: IoPortBus,
    pub mmio: MmioRouter,
    pub ram: Rc<RefCell<GuestRam>>,
    pub a20: A20Gate,
    pub clock: Clock,
    pub reset_events: ResetEvents,
    pub interrupts: Rc<RefCell<PlatformInterrupts>>,
    pit: Rc<RefCell<Pit>>,
    rtc: Rc<RefCell<Rtc>>,
    dma: Rc<RefCell<Dma8237>>,
    i8042: Option<Rc<RefCell<I8042>>>,
    acpi: Option<Rc<RefCell<AcpiPm>>>,
    pci: Option<Rc<RefCell<PciHost>>>,
    pci_irq_router: Option<PciIrqRouter>,
    bm_ide: Option<Rc<RefCell<BusMasterIde>>>,
    vga: Option<Rc<RefCell<Vga>>>,
    pam: Rc<RefCell<PamState>>,
    /// Physical ranges whose cached traces must drop (PAM flips).
    trace_invalidations: Vec<(u32, u32)>,
}

impl PcPlatform {
    pub fn new(ram_size_bytes: u32) -> Self {
        Self::new_with_config(PcPlatformConfig {
            ram_size_bytes,
            ..Default::default()
        })
    }

    pub fn new_with_config(config: PcPlatformConfig) -> Self {
        let clock = Clock::new();
        let a20 = A20Gate::new();
        let reset_events = ResetEvents::new();
        let ram = Rc::new(RefCell::new(GuestRam::new(config.ram_size_bytes)));
        let interrupts = Rc::new(RefCell::new(PlatformInterrupts::new(config.apic_enabled)));
        let mut io = IoPortBus::new();
        let mut mmio = MmioRouter::new();
        let pam = Rc::new(RefCell::new(PamState::new()));

        // Interrupt controller ports.
        let pic_ports = Rc::new(RefCell::new(PicPorts {
            interrupts: interrupts.clone(),
        }));
        io.register(pic::MASTER_CMD_PORT, 2, WIDTH_8, pic_ports.clone());
        io.register(pic::SLAVE_CMD_PORT, 2, WIDTH_8, pic_ports.clone());
        if config.enable_pci {
            io.register(pic::ELCR0_PORT, 2, WIDTH_8, pic_ports);
        }

        // PIT plus the system control latch.
        let pit = Rc::new(RefCell::new(Pit::new(
            clock.clone(),
            IrqLine::new(interrupts.clone(), 0),
        )));
        io.register(PIT_CH0_PORT, 4, WIDTH_8, pit.clone());
        io.register(SYSTEM_CTRL_PORT, 1, WIDTH_8, pit.clone());

        // CMOS/RTC.
        let rtc = Rc::new(RefCell::new(Rtc::new(
            clock.clone(),
            IrqLine::new(interrupts.clone(), 8),
            config.rtc_epoch_seconds,
        )));
        io.register(CMOS_INDEX_PORT, 2, WIDTH_8, rtc.clone());

        // DMA controllers, page registers included.
        let dma = Rc::new(RefCell::new(Dma8237::new()));
        io.register(0x00, 16, WIDTH_8, dma.clone());
        io.register(0xC0, 32, WIDTH_8, dma.clone());
        io.register(0x80, 16, WIDTH_8, dma.clone());
        io.register(0x480, 16, WIDTH_8, dma.clone());

        // Fast A20 and reset control.
        let fast_a20 = Rc::new(RefCell::new(FastA20::new(a20.clone())));
        io.register(A20_GATE_PORT, 1, WIDTH_8, fast_a20);
        let reset_ctrl = Rc::new(RefCell::new(ResetCtrl::new(reset_events.clone())));
        io.register(RESET_CTRL_PORT, 1, WIDTH_8, reset_ctrl);

        // Keyboard controller.
        let i8042 = config.enable_i8042.then(|| {
            let kbc = Rc::new(RefCell::new(I8042::new(
                a20.clone(),
                reset_events.clone(),
                IrqLine::new(interrupts.clone(), 1),
                IrqLine::new(interrupts.clone(), 12),
            )));
            io.register(I8042_DATA_PORT, 1, WIDTH_8, kbc.clone());
            io.register(I8042_STATUS_PORT, 1, WIDTH_8, kbc.clone());
            kbc
        });

        // PCI host bridge with the i440FX/PIIX3 functions.
        let (pci_host, pci_irq_router, bm_ide) = if config.enable_pci {
            let mut host = PciHost::new();
            host.add_function(
                I440FX_DEVICE,
                0,
                &pci::i440fx_config_image(),
                pci::i440fx_filter(),
            );
            host.add_function(
                PIIX3_DEVICE,
                0,
                &pci::piix3_isa_config_image(),
                pci::piix3_isa_filter(),
            );
            host.add_function(
                PIIX3_DEVICE,
                1,
                &pci::piix3_ide_config_image(),
                pci::piix3_ide_filter(),
            );
            let host = Rc::new(RefCell::new(host));
            let lines: [IrqLine; 16] =
                std::array::from_fn(|i| IrqLine::new(interrupts.clone(), i as u8));
            let router = PciIrqRouter::new(host.clone(), lines);

            let bm_ide = Rc::new(RefCell::new(BusMasterIde::new()));
            (Some(host), Some(router), Some(bm_ide))
        } else {
            (None, None, None)
        };
        if let Some(host) = &pci_host {
            io.register(0xCF8, 8, WIDTH_8 | WIDTH_16 | WIDTH_32, host.clone());
        }
        if let Some(bm) = &bm_ide {
            let base = bm.borrow().base();
            io.register(base, 16, WIDTH_8, bm.clone());
        }

        // ACPI power management (a PCI function plus its I/O windows).
        let acpi = (config.enable_acpi && config.enable_pci).then(|| {
            let acpi = Rc::new(RefCell::new(AcpiPm::new(
                clock.clone(),
                IrqLine::new(interrupts.clone(), 9),
            )));
            let (pm, smb) = {
                let a = acpi.borrow();
                (a.pm_base(), a.smb_base())
            };
            io.register(pm, 64, WIDTH_8 | WIDTH_16 | WIDTH_32, acpi.clone());
            io.register(smb, 16, WIDTH_8, acpi.clone());
            if let Some(host) = &pci_host {
                host.borrow_mut().add_function(
                    7,
                    0,
                    &corten_devices::acpi_pm::acpi_pci_config_image(),
                    corten_devices::acpi_pm::acpi_pci_filter(acpi.clone()),
                );
            }
            acpi
        });

        // VGA: register ports, the legacy window, the LFB, and when PCI is
        // on, the display function with its option-ROM aperture.
        let vga = config.enable_vga.then(|| {
            let vga = Rc::new(RefCell::new(Vga::new(config.vga_vram_size)));
            let ports = Rc::new(RefCell::new(VgaPorts { vga: vga.clone() }));
            io.register(0x3B0, 48, WIDTH_8 | WIDTH_16, ports.clone());
            io.register(
                corten_vga::VBE_INDEX_PORT,
                2,
                WIDTH_8 | WIDTH_16,
                ports,
            );
            let window = Rc::new(RefCell::new(VgaWindow { vga: vga.clone() }));
            mmio.register(VGA_WINDOW_BASE, 0x20000, window.clone());
            mmio.register(VBE_LFB_BASE, config.vga_vram_size, window);
            if config.enable_pci {
                vga.borrow_mut().set_rom_base(VGA_ROM_DEFAULT_BASE);
                let rom = Rc::new(RefCell::new(VgaRomWindow { vga: vga.clone() }));
                mmio.register(VGA_ROM_DEFAULT_BASE, 0x20000, rom);
                if let Some(host) = &pci_host {
                    host.borrow_mut().add_function(
                        2,
                        0,
                        &corten_vga_pci_image(),
                        corten_vga_pci_filter(vga.clone()),
                    );
                }
            }
            vga
        });

        // APIC MMIO pages.
        let lapic_window = Rc::new(RefCell::new(LapicWindow {
            interrupts: interrupts.clone(),
            clock: clock.clone(),
        }));
        mmio.register(LAPIC_MMIO_BASE, LAPIC_MMIO_SIZE, lapic_window);
        let ioapic_window = Rc::new(RefCell::new(IoapicWindow {
            interrupts: interrupts.clone(),
        }));
        mmio.register(IOAPIC_MMIO_BASE, IOAPIC_MMIO_SIZE, ioapic_window);

        // PAM shadow region.
        let shadow = Rc::new(RefCell::new(ShadowRamWindow {
            ram: ram.clone(),
            pam: pam.clone(),
        }));
        mmio.register(SHADOW_BASE, 0x40000, shadow);

        Self {
            config,
            io,
            mmio,
            ram,
            a20,
            clock,
            reset_events,
            interrupts,
            pit,
            rtc,
            dma,
            i8042,
            acpi,
            pci: pci_host,
            pci_irq_router,
            bm_ide,
            vga,
            pam,
            trace_invalidations: Vec::new(),
        }
    }

    pub fn pit(&self) -> Rc<RefCell<Pit>> {
        self.pit.clone()
    }

    pub fn rtc(&self) -> Rc<RefCell<Rtc>> {
        self.rtc.clone()
    }

    pub fn dma(&self) -> Rc<RefCell<Dma8237>> {
        self.dma.clone()
    }

    pub fn i8042(&self) -> Option<Rc<RefCell<I8042>>> {
        self.i8042.clone()
    }

    pub fn acpi(&self) -> Option<Rc<RefCell<AcpiPm>>> {
        self.acpi.clone()
    }

    pub fn pci(&self) -> Option<Rc<RefCell<PciHost>>> {
        self.pci.clone()
    }

    pub fn vga(&self) -> Option<Rc<RefCell<Vga>>> {
        self.vga.clone()
    }

    pub fn pam(&self) -> Rc<RefCell<PamState>> {
        self.pam.clone()
    }

    /// Asserts a device INTx line through the PIRQ router.
    pub fn pci_set_irq_line(&self, device: u8, asserted: bool) {
        if let Some(router) = &self.pci_irq_router {
            router.set_irq_line(device, asserted);
        }
    }

    pub fn take_reset_events(&mut self) -> Vec<ResetEvent> {
        self.reset_events.take()
    }

    pub fn take_trace_invalidations(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.trace_invalidations)
    }

    /// Post-dispatch housekeeping: PCI side effects and pending DMA.
    /// Runs after every guest port access and device tick, which keeps it
    /// between instructions.
    pub fn service(&mut self) {
        let events = match &self.pci {
            Some(host) => host.borrow_mut().take_events(),
            None => Vec::new(),
        };
        for event in events {
            self.apply_pci_event(event);
        }
        if self.dma.borrow().needs_service() {
            let mut ram = self.ram.borrow_mut();
            self.dma.borrow_mut().service(&mut ram);
        }
    }

    fn apply_pci_event(&mut self, event: PciEvent) {
        match event {
            PciEvent::PamChanged { window, perms } => {
                let old = self.pam.borrow().perms(window);
                if old != perms {
                    self.pam.borrow_mut().set_perms(window, perms);
                    let (begin, end) = PamState::window_range(window);
                    self.trace_invalidations.push((begin, end));
                }
            }
            PciEvent::AcpiPmBaseChanged { old, new } => {
                if let Some(acpi) = &self.acpi {
                    self.io.unregister(old, 64);
                    if new != 0 {
                        self.io
                            .register(new, 64, WIDTH_8 | WIDTH_16 | WIDTH_32, acpi.clone());
                    }
                }
            }
            PciEvent::AcpiSmbBaseChanged { old, new } => {
                if let Some(acpi) = &self.acpi {
                    self.io.unregister(old, 16);
                    if new != 0 {
                        self.io.register(new, 16, WIDTH_8, acpi.clone());
                    }
                }
            }
            PciEvent::IdeBusMasterBaseChanged { new } => {
                if let Some(bm) = &self.bm_ide {
                    let old = bm.borrow().base();
                    if old != new {
                        self.io.unregister(old, 16);
                        bm.borrow_mut().set_base(new);
                        if new != 0 {
                            self.io.register(new, 16, WIDTH_8, bm.clone());
                        }
                    }
                }
            }
            PciEvent::VgaRomBaseChanged { old, new } => {
                if let Some(vga) = &self.vga {
                    self.mmio.remap(old, new);
                    vga.borrow_mut().set_rom_base(new);
                }
            }
        }
    }

    /// Advances the shared timebase and fires every due device.
    pub fn tick(&mut self, delta_ns: u64) {
        self.clock.advance_ns(delta_ns);
        self.run_timers();
    }

    /// Fires due timers and returns ns until the nearest next event.
    pub fn run_timers(&mut self) -> Option<u64> {
        let now = self.clock.now_ns();
        let mut next: Option<u64> = None;
        let mut consider = |candidate: Option<u64>| {
            if let Some(c) = candidate {
                next = Some(next.map_or(c, |n| n.min(c)));
            }
        };
        consider(self.pit.borrow_mut().next_deadline(now));
        consider(self.rtc.borrow_mut().next_deadline(now));
        if let Some(acpi) = &self.acpi {
            consider(acpi.borrow_mut().next_deadline(now));
        }
        consider(self.interrupts.borrow_mut().apic_timer_deadline(now));
        self.service();
        next
    }

    /// Broadcast reset: every device returns to power-on state. RAM and
    /// the wall clock survive, matching a warm reboot.
    pub fn reset(&mut self) {
        self.interrupts.borrow_mut().reset();
        self.pit.borrow_mut().reset();
        self.rtc.borrow_mut().reset();
        self.dma.borrow_mut().reset();
        if let Some(kbc) = &self.i8042 {
            kbc.borrow_mut().reset();
        }
        if let Some(acpi) = &self.acpi {
            acpi.borrow_mut().reset();
        }
        if let Some(vga) = &self.vga {
            vga.borrow_mut().reset();
        }
        self.pam.borrow_mut().reset();
        self.a20.set_enabled(false);
        self.trace_invalidations.push((0, u32::MAX));
    }

    /// Collects every device's savestate section.
    pub fn save_device_states(&self) -> corten_io_snapshot::StateObject {
        let mut obj = corten_io_snapshot::StateObject::new();
        obj.put_object("interrupts", self.interrupts.borrow().save_state());
        obj.put_object("pit", self.pit.borrow().save_state());
        obj.put_object("rtc", self.rtc.borrow().save_state());
        obj.put_object("dma", self.dma.borrow().save_state());
        if let Some(kbc) = &self.i8042 {
            obj.put_object("i8042", kbc.borrow().save_state());
        }
        if let Some(acpi) = &self.acpi {
            obj.put_object("acpi", acpi.borrow().save_state());
        }
        if let Some(pci) = &self.pci {
            obj.put_object("pci", pci.borrow().save_state());
        }
        if let Some(vga) = &self.vga {
            obj.put_object("vga", vga.borrow().save_state());
        }
        obj.put_object("pam", self.pam.borrow().save_state());
        obj.put_bool("a20", self.a20.enabled());
        obj.put_u64("clock_ns", self.clock.now_ns());
        obj
    }

    pub fn load_device_states(
        &mut self,
        obj: &corten_io_snapshot::StateObject,
    ) -> Result<(), corten_io_snapshot::SnapshotError> {
        let pre_acpi_bases = self.acpi.as_ref().map(|a| {
            let a = a.borrow();
            (a.pm_base(), a.smb_base())
        });
        if let Some(o) = obj.object("interrupts") {
            self.interrupts.borrow_mut().load_state(o)?;
        }
        if let Some(o) = obj.object("pit") {
            self.pit.borrow_mut().load_state(o)?;
        }
        if let Some(o) = obj.object("rtc") {
            self.rtc.borrow_mut().load_state(o)?;
        }
        if let Some(o) = obj.object("dma") {
            self.dma.borrow_mut().load_state(o)?;
        }
        if let (Some(kbc), Some(o)) = (&self.i8042, obj.object("i8042")) {
            kbc.borrow_mut().load_state(o)?;
        }
        if let (Some(acpi), Some(o)) = (&self.acpi, obj.object("acpi")) {
            acpi.borrow_mut().load_state(o)?;
        }
        if let (Some(pci), Some(o)) = (&self.pci, obj.object("pci")) {
            pci.borrow_mut().load_state(o)?;
        }
        if let (Some(vga), Some(o)) = (&self.vga, obj.object("vga")) {
            vga.borrow_mut().load_state(o)?;
        }
        if let Some(o) = obj.object("pam") {
            self.pam.borrow_mut().load_state(o)?;
        }
        self.a20.set_enabled(obj.get_bool("a20"));
        self.clock.set_ns(obj.get_u64("clock_ns"));
        self.trace_invalidations.push((0, u32::MAX));
        // Move the relocatable I/O windows to wherever the restored
        // configuration put them.
        if let Some(acpi) = &self.acpi {
            let (pm, smb) = {
                let a = acpi.borrow();
                (a.pm_base(), a.smb_base())
            };
            if let Some((old_pm, old_smb)) = pre_acpi_bases {
                self.io.unregister(old_pm, 64);
                self.io.unregister(old_smb, 16);
            }
            self.io.register(pm, 64, WIDTH_8 | WIDTH_16 | WIDTH_32, acpi.clone());
            self.io.register(smb, 16, WIDTH_8, acpi.clone());
        }
        Ok(())
    }
}

/// Dummy PCI display function: vendor 0x1234/0x1111 (the Bochs display),
/// BAR0 reporting the LFB, expansion ROM relocatable.
fn corten_vga_pci_image() -> [u8; 64] {
    let mut image = [0u8; 64];
    image[0] = 0x34;
    image[1] = 0x12;
    image[2] = 0x11;
    image[3] = 0x11;
    image[10] = 0x00;
    image[11] = 0x03; // display controller class
    let bar0 = VBE_LFB_BASE | 0x8; // prefetchable memory BAR
    image[0x10..0x14].copy_from_slice(&bar0.to_le_bytes());
    let rom = VGA_ROM_DEFAULT_BASE;
    image[0x30..0x34].copy_from_slice(&rom.to_le_bytes());
    image
}

fn corten_vga_pci_filter(
    vga: Rc<RefCell<Vga>>,
) -> corten_devices::pci::ConfigWriteFilter {
    Box::new(move |config, addr, data| {
        let mut events = Vec::new();
        match addr {
            0x10 => {
                // Keep the low nibble (flags) hardwired.
                config[0x10] = config[0x10] & 0x0F | data & 0xF0;
            }
            0x11..=0x13 => config[addr as usize] = data,
            0x30..=0x33 => {
                config[addr as usize] = data;
                if addr == 0x33 {
                    let raw = u32::from_le_bytes(config[0x30..0x34].try_into().unwrap());
                    let new = raw & !1;
                    let old = vga.borrow().rom_base();
                    if new != old && new != 0 && new != 0xFFFF_FFFE {
                        events.push(PciEvent::VgaRomBaseChanged { old, new });
                    }
                }
            }
            _ => config[addr as usize] = data,
        }
        events
    })
}
