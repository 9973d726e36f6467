use corten_devices::acpi_pm::{DEFAULT_PM_BASE, PM1_CNT_SCI_EN};
use corten_devices::i8042::I8042_STATUS_PORT;
use corten_devices::reset_ctrl::RESET_CTRL_RESET_VALUE;
use corten_io_snapshot::IoSnapshot;
use corten_pc_platform::{PcPlatform, ResetEvent};

#[test]
fn pc_platform_wires_canonical_ports_and_mmio() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    // Unmapped ports float high.
    assert_eq!(pc.io.read_u8(0x10), 0xFF);

    // PCI config mechanism #1: host bridge vendor ID.
    pc.io.write(0xCF8, 4, 0x8000_0000);
    let id = pc.io.read(0xCFC, 4);
    assert_eq!(id & 0xFFFF, 0x8086);

    // ACPI PM1_CNT resets with SCI_EN set.
    let pm1_cnt = pc.io.read(DEFAULT_PM_BASE + 4, 2) as u16;
    assert_ne!(pm1_cnt & PM1_CNT_SCI_EN, 0);

    // LAPIC version register through its MMIO page.
    let version = pc.mmio.read(0xFEE0_0030, 4);
    assert_eq!(version & 0xFF, 0x14);

    // IOAPIC indirection: select the version register.
    pc.mmio.write(0xFEC0_0000, 0x01, 4);
    let ioapic_ver = pc.mmio.read(0xFEC0_0010, 4);
    assert_eq!(ioapic_ver & 0xFF, 0x11);

    // Reset control port 0xCF9 queues a reset event.
    pc.io.write_u8(0xCF9, RESET_CTRL_RESET_VALUE);
    assert_eq!(pc.take_reset_events(), vec![ResetEvent::System]);

    // The 8042 pulse command (0xFE, bit 0 low) does too.
    pc.io.write_u8(I8042_STATUS_PORT, 0xFE);
    assert_eq!(pc.take_reset_events(), vec![ResetEvent::System]);
}

#[test]
fn pc_platform_exposes_snapshot_devices_via_accessors() {
    let pc = PcPlatform::new(2 * 1024 * 1024);
    let _pit_state = pc.pit().borrow().save_state();
    let _rtc_state = pc.rtc().borrow().save_state();
    let _dma_state = pc.dma().borrow().save_state();

    // The clock handle is shared; advancing one handle moves them all.
    let clock = pc.clock.clone();
    clock.advance_ns(123);
    assert_eq!(pc.clock.now_ns(), 123);
}

#[test]
fn fast_a20_port_drives_the_shared_gate() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);
    assert!(!pc.a20.enabled());
    pc.io.write_u8(0x92, 0x02);
    assert!(pc.a20.enabled());
    assert_eq!(pc.io.read_u8(0x92), 0x02);
    pc.io.write_u8(0x92, 0x00);
    assert!(!pc.a20.enabled());
}

#[test]
fn pam_writes_reach_the_shadow_permission_table() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    // Writes to the F segment are dropped while the window is read-only.
    pc.ram.borrow_mut().write(0xF0000, 0xAA);
    pc.mmio.write(0xF0000, 0xBB, 1);
    assert_eq!(pc.ram.borrow().read(0xF0000), 0xAA);

    // PAM register 0x59 high nibble opens the whole F segment.
    pc.io.write(0xCF8, 4, 0x8000_0058);
    pc.io.write_u8(0xCFD, 0x30);
    pc.service();
    assert_eq!(pc.pam().borrow().perms(12), 3);

    pc.mmio.write(0xF0000, 0xBB, 1);
    assert_eq!(pc.ram.borrow().read(0xF0000), 0xBB);

    // A permission flip queues a trace invalidation for that window.
    let invals = pc.take_trace_invalidations();
    assert!(invals.contains(&(0xF0000, 0xF4000)));
}

#[test]
fn piix3_ide_bar4_write_moves_the_bus_master_window() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    // Scribble into the default window.
    pc.io.write_u8(0xC004, 0x5A);
    assert_eq!(pc.io.read_u8(0xC004), 0x5A);

    // Reprogram BAR4 (device 1 function 1, offset 0x20) to 0xD800.
    pc.io.write(0xCF8, 4, 0x8000_0920);
    pc.io.write(0xCFC, 4, 0x0000_D801);
    pc.service();

    assert_eq!(pc.io.read_u8(0xC004), 0xFF, "old window unmapped");
    assert_eq!(pc.io.read_u8(0xD804), 0x5A, "registers moved with the window");
}

#[test]
fn platform_reset_returns_devices_to_power_on_state() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);
    // Program the PIC offsets, then reset.
    pc.io.write_u8(0x20, 0x11);
    pc.io.write_u8(0x21, 0x40);
    pc.io.write_u8(0x21, 0x04);
    pc.io.write_u8(0x21, 0x01);
    pc.reset();
    // After reset the mask register reads 0xFF again.
    assert_eq!(pc.io.read_u8(0x21), 0xFF);
    assert!(!pc.a20.enabled());
}
