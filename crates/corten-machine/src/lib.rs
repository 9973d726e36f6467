//! The machine front-end: one guest CPU plus the PC platform, driven in
//! deadline-bounded slices.

use corten_cpu_core::exec::{run_batch, BatchExit, CpuCore};
use corten_cpu_core::state::CpuMode;
use corten_io_snapshot::StateObject;
use corten_pc_platform::{PcCpuBus, PcPlatform, PcPlatformConfig};
use corten_platform::interrupts::InterruptInput;
use corten_snapshot::MachineSnapshotError;
use corten_vga::{BufferDisplay, DisplaySink};

pub use corten_cpu_core::state::CpuState;
pub use corten_pc_platform::ResetEvent;
pub use corten_platform::PlatformInterruptMode;

use corten_pc_platform::PlatformIntrCtrl;

/// Stable host-facing exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitReason {
    Normal = 0,
    /// Internal only: an interrupt broke the run loop; `run` never
    /// returns this.
    Irq = 1,
    Async = 2,
    Hlt = 3,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ram_size_bytes: u32,
    pub apic_enabled: bool,
    pub enable_vga: bool,
    pub enable_i8042: bool,
    pub enable_pci: bool,
    pub enable_acpi: bool,
    pub vga_vram_size: u32,
    pub rtc_epoch_seconds: Option<i64>,
    /// Start in flat 32-bit protected mode instead of the reset vector
    /// (firmware-free bring-up).
    pub start_protected: bool,
}

impl Default for MachineConfig {
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
            start_protected: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("RAM size must be at least 1 MiB")]
    RamTooSmall,
}

pub struct Machine {
    config: MachineConfig,
    cpu: CpuCore,
    bus: PcCpuBus,
    ctrl: PlatformIntrCtrl,
    display: BufferDisplay,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Machine, MachineError> {
        if config.ram_size_bytes < 1 << 20 {
            return Err(MachineError::RamTooSmall);
        }
        let platform = PcPlatform::new_with_config(PcPlatformConfig {
            ram_size_bytes: config.ram_size_bytes,
            apic_enabled: config.apic_enabled,
            enable_vga: config.enable_vga,
            enable_i8042: config.enable_i8042,
            enable_pci: config.enable_pci,
            enable_acpi: config.enable_acpi,
            vga_vram_size: config.vga_vram_size,
            rtc_epoch_seconds: config.rtc_epoch_seconds,
        });
        let ctrl = PlatformIntrCtrl {
            interrupts: platform.interrupts.clone(),
        };
        let mut bus = PcCpuBus::new(platform);
        let mode = if config.start_protected {
            CpuMode::Protected
        } else {
            CpuMode::Real
        };
        let mut cpu = CpuCore::new(mode);
        if !config.start_protected {
            cpu.state.reset();
        }
        corten_cpu_core::mem::CpuBus::sync(&mut bus, &cpu.state);
        Ok(Machine {
            config,
            cpu,
            bus,
            ctrl,
            display: BufferDisplay::new(),
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn cpu_state(&self) -> &CpuState {
        &self.cpu.state
    }

    pub fn cpu_state_mut(&mut self) -> &mut CpuState {
        &mut self.cpu.state
    }

    /// Pushes mode/paging changes made through `cpu_state_mut` into the
    /// bus (TLB flushes etc.).
    pub fn sync_cpu(&mut self) {
        self.cpu.state.update_mode();
        corten_cpu_core::mem::CpuBus::sync(&mut self.bus, &self.cpu.state);
    }

    pub fn platform(&self) -> &PcPlatform {
        &self.bus.platform
    }

    pub fn platform_mut(&mut self) -> &mut PcPlatform {
        &mut self.bus.platform
    }

    /// Full system reset (power-on, triple fault, 0xCF9, 8042 pulse).
    pub fn reset(&mut self) {
        self.bus.platform.reset();
        self.bus.flush_tlb();
        self.cpu.reset(&mut self.bus);
    }

    /// Runs up to `cycles` guest instructions, servicing device deadlines
    /// between slices.
    pub fn run(&mut self, cycles: u64) -> ExitReason {
        let mut remaining = cycles;
        while remaining > 0 {
            if self.bus.platform.reset_events.is_pending() {
                self.bus.platform.take_reset_events();
                self.reset();
            }
            let deadline = self.bus.platform.run_timers();
            // The timebase runs at one cycle per nanosecond, so device
            // deadlines bound the slice directly. Slices are additionally
            // capped: a timer armed mid-slice (the guest reprogramming the
            // PIT, say) must not wait out an arbitrarily long run.
            const MAX_SLICE: u64 = 1_000_000;
            let slice = deadline
                .unwrap_or(remaining)
                .min(MAX_SLICE)
                .clamp(1, remaining);
            let outcome = run_batch(&mut self.cpu, &mut self.bus, &mut self.ctrl, slice);
            self.bus.platform.clock.advance_ns(outcome.cycles);
            remaining = remaining.saturating_sub(outcome.cycles);

            match outcome.exit {
                BatchExit::Completed | BatchExit::Async => {}
                BatchExit::TripleFault => {
                    tracing::warn!(target: "machine", "triple fault; resetting");
                    self.reset();
                }
                BatchExit::Halted => {
                    // Idle until the next device event or the budget ends.
                    match self.bus.platform.run_timers() {
                        Some(sleep_ns) => {
                            if self.intr_deliverable() {
                                continue;
                            }
                            let skip = sleep_ns.min(remaining).max(1);
                            self.bus.platform.clock.advance_ns(skip);
                            remaining -= skip;
                        }
                        None => return ExitReason::Hlt,
                    }
                }
            }
        }
        if self.cpu.state.halted {
            ExitReason::Hlt
        } else {
            ExitReason::Normal
        }
    }

    fn intr_deliverable(&self) -> bool {
        let ints = self.bus.platform.interrupts.borrow();
        ints.nmi_line() || ints.intr_asserted() && self.cpu.state.if_enabled()
    }

    // -- guest-visible buses ------------------------------------------------

    pub fn io_read(&mut self, port: u16, size: u8) -> u32 {
        let v = self.bus.platform.io.read(port, size);
        self.bus.platform.service();
        v
    }

    pub fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.bus.platform.io.write(port, size, value);
        self.bus.platform.service();
    }

    pub fn read_physical_u8(&mut self, paddr: u32) -> u8 {
        self.bus.read_physical_u8(paddr)
    }

    pub fn write_physical_u8(&mut self, paddr: u32, value: u8) {
        self.bus.write_physical_u8(paddr, value);
    }

    pub fn read_physical_u32(&mut self, paddr: u32) -> u32 {
        self.bus.read_physical_u32(paddr)
    }

    pub fn write_physical_u32(&mut self, paddr: u32, value: u32) {
        self.bus.write_physical_u32(paddr, value);
    }

    pub fn write_physical(&mut self, paddr: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bus.write_physical_u8(paddr + i as u32, *b);
        }
    }

    /// Loads a firmware image so its tail ends at 1 MiB (and mirrors the
    /// BIOS convention of aliasing the top of ROM below 0x100000).
    pub fn load_firmware(&mut self, image: &[u8]) {
        let base = 0x10_0000 - image.len() as u32;
        let mut ram = self.bus.platform.ram.borrow_mut();
        for (i, b) in image.iter().enumerate() {
            let addr = base + i as u32;
            if ram.contains(addr) {
                ram.write(addr, *b);
            }
        }
    }

    // -- interrupt lines ----------------------------------------------------

    pub fn raise_irq(&mut self, irq: u8) {
        self.bus
            .platform
            .interrupts
            .borrow_mut()
            .raise_irq(InterruptInput::IsaIrq(irq));
    }

    pub fn lower_irq(&mut self, irq: u8) {
        self.bus
            .platform
            .interrupts
            .borrow_mut()
            .lower_irq(InterruptInput::IsaIrq(irq));
    }

    pub fn raise_gsi(&mut self, gsi: u32) {
        self.bus
            .platform
            .interrupts
            .borrow_mut()
            .raise_irq(InterruptInput::Gsi(gsi));
    }

    pub fn lower_gsi(&mut self, gsi: u32) {
        self.bus
            .platform
            .interrupts
            .borrow_mut()
            .lower_irq(InterruptInput::Gsi(gsi));
    }

    // -- host input ---------------------------------------------------------

    pub fn inject_scancode(&mut self, byte: u8) {
        if let Some(kbc) = self.bus.platform.i8042() {
            kbc.borrow_mut().inject_scancode(byte);
        }
    }

    pub fn inject_mouse_motion(&mut self, dx: i32, dy: i32) {
        if let Some(kbc) = self.bus.platform.i8042() {
            kbc.borrow_mut().inject_mouse_motion(dx, dy);
        }
    }

    pub fn inject_mouse_buttons(
        &mut self,
        left: Option<bool>,
        middle: Option<bool>,
        right: Option<bool>,
    ) {
        if let Some(kbc) = self.bus.platform.i8042() {
            kbc.borrow_mut().inject_mouse_buttons(left, middle, right);
        }
    }

    // -- display ------------------------------------------------------------

    /// Renders one frame into the machine-owned surface.
    pub fn render_frame(&mut self) {
        if let Some(vga) = self.bus.platform.vga() {
            vga.borrow_mut().render_frame(&mut self.display);
        }
    }

    pub fn display(&self) -> &BufferDisplay {
        &self.display
    }

    pub fn display_resolution(&self) -> (u32, u32) {
        self.display.resolution()
    }

    // -- savestate ----------------------------------------------------------

    pub fn take_snapshot_full(&mut self) -> Result<Vec<u8>, MachineSnapshotError> {
        let mut root = StateObject::new();
        root.put_u32("ram_size", self.config.ram_size_bytes);
        root.put_object(
            "cpu",
            corten_io_snapshot::IoSnapshot::save_state(&self.cpu.state),
        );
        root.put_object("devices", self.bus.platform.save_device_states());
        // RAM is captured raw, bypassing A20 masking and MMIO routing.
        corten_snapshot::put_blob(&mut root, "ram", self.bus.platform.ram.borrow().raw());
        if let Some(vga) = self.bus.platform.vga() {
            corten_snapshot::put_blob(&mut root, "vram", vga.borrow().vram());
        }
        Ok(corten_snapshot::seal(root))
    }

    pub fn restore_snapshot_bytes(&mut self, bytes: &[u8]) -> Result<(), MachineSnapshotError> {
        let root = corten_snapshot::unseal(bytes)?;
        let ram_size = root.get_u32("ram_size");
        if ram_size != self.config.ram_size_bytes {
            return Err(MachineSnapshotError::RamSize {
                expected: self.config.ram_size_bytes,
                found: ram_size,
            });
        }
        let cpu_obj = root
            .object("cpu")
            .ok_or(MachineSnapshotError::MissingSection("cpu"))?;
        corten_io_snapshot::IoSnapshot::load_state(&mut self.cpu.state, cpu_obj)?;
        let devices = root
            .object("devices")
            .ok_or(MachineSnapshotError::MissingSection("devices"))?;
        self.bus.platform.load_device_states(devices)?;

        let ram = corten_snapshot::get_blob(&root, "ram")?;
        if ram.len() != self.config.ram_size_bytes as usize {
            return Err(MachineSnapshotError::RamSize {
                expected: self.config.ram_size_bytes,
                found: ram.len() as u32,
            });
        }
        self.bus.platform.ram.borrow_mut().raw_mut().copy_from_slice(&ram);
        if let Some(vga) = self.bus.platform.vga() {
            if let Ok(vram) = corten_snapshot::get_blob(&root, "vram") {
                let mut vga = vga.borrow_mut();
                let n = vram.len().min(vga.vram_mut().len());
                vga.vram_mut()[..n].copy_from_slice(&vram[..n]);
            }
        }

        // Derived execution state is rebuilt, not restored.
        self.bus.flush_tlb();
        self.cpu.flush_traces(&mut self.bus);
        corten_cpu_core::mem::CpuBus::sync(&mut self.bus, &self.cpu.state);
        Ok(())
    }
}
