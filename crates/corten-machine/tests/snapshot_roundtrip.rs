mod common;

use common::machine_with_program;
use corten_machine::{Machine, MachineConfig};
use pretty_assertions::assert_eq;

/// A restored machine must continue a deterministic workload with results
/// identical to the original.
#[test]
fn snapshot_restore_resumes_bit_identical_execution() {
    // Counter loop: inc word [0x3000]; dec cx; jnz; hlt.
    let code = [
        0xFF, 0x06, 0x00, 0x30, // inc word [0x3000]
        0x49, // dec cx
        0x75, 0xF9, // jnz -7
        0xF4, // hlt
    ];
    let mut original = machine_with_program(0x200, &code);
    original.cpu_state_mut().write_reg16(1, 500);
    original.sync_cpu();

    // Run part of the loop, snapshot mid-flight.
    original.run(300);
    let snap = original.take_snapshot_full().unwrap();

    let mut restored = Machine::new(MachineConfig {
        ram_size_bytes: 4 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    restored.restore_snapshot_bytes(&snap).unwrap();

    assert_eq!(
        restored.cpu_state().read_reg16(1),
        original.cpu_state().read_reg16(1)
    );
    assert_eq!(
        restored.read_physical_u32(0x3000),
        original.read_physical_u32(0x3000)
    );

    // Finish both machines; every observable must match.
    original.run(100_000);
    restored.run(100_000);
    assert_eq!(
        restored.read_physical_u32(0x3000),
        original.read_physical_u32(0x3000)
    );
    assert_eq!(restored.read_physical_u32(0x3000) & 0xFFFF, 500);
    assert_eq!(restored.cpu_state().eip(), original.cpu_state().eip());
    assert_eq!(restored.cpu_state().read_reg16(1), 0);
}

#[test]
fn snapshot_captures_ram_without_a20_masking() {
    let mut src = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();

    src.write_physical_u8(0x0, 0x11);
    src.write_physical_u8(0x10_0000, 0x22);
    // A20 disabled at snapshot time must not alias the captured bytes.
    src.platform_mut().a20.set_enabled(false);
    let snap = src.take_snapshot_full().unwrap();

    let mut restored = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    restored.restore_snapshot_bytes(&snap).unwrap();
    assert_eq!(restored.read_physical_u8(0x0), 0x11);
    assert_eq!(restored.read_physical_u8(0x10_0000), 0x22);
}

#[test]
fn snapshot_preserves_device_register_state() {
    let mut src = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();

    // Leave fingerprints in several register banks.
    src.io_write(0x70, 1, 0x34); // CMOS index + battery RAM
    src.io_write(0x71, 1, 0x77);
    src.io_write(0x21, 1, 0xA5); // PIC mask
    src.io_write(0x3C8, 1, 9); // DAC entry 9
    for c in [0x10, 0x20, 0x30] {
        src.io_write(0x3C9, 1, c);
    }

    let snap = src.take_snapshot_full().unwrap();
    let mut restored = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    restored.restore_snapshot_bytes(&snap).unwrap();

    assert_eq!(restored.io_read(0x21, 1), 0xA5);
    restored.io_write(0x70, 1, 0x34);
    assert_eq!(restored.io_read(0x71, 1), 0x77);
    restored.io_write(0x3C7, 1, 9);
    assert_eq!(restored.io_read(0x3C9, 1), 0x10);
    assert_eq!(restored.io_read(0x3C9, 1), 0x20);
    assert_eq!(restored.io_read(0x3C9, 1), 0x30);
}

#[test]
fn mismatched_ram_size_is_rejected() {
    let mut src = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    let snap = src.take_snapshot_full().unwrap();

    let mut other = Machine::new(MachineConfig {
        ram_size_bytes: 4 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    assert!(other.restore_snapshot_bytes(&snap).is_err());
}
