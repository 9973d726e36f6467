mod common;

use common::machine_with_program;
use pretty_assertions::assert_eq;

/// With A20 cleared through the keyboard controller's output port, a guest
/// read of linear 0x100000 must return the byte at physical 0x000000.
#[test]
fn kbc_output_port_gates_the_a20_line() {
    // out 0x64, 0xD1 ; out 0x60, 0xDD  (A20 off, reset deasserted)
    // mov ax, 0xFFFF ; mov ds, ax
    // mov al, [0x10]                   (linear 0x100000)
    // hlt
    let code = [
        0xB0, 0xD1, // mov al, 0xD1
        0xE6, 0x64, // out 0x64, al
        0xB0, 0xDD, // mov al, 0xDD
        0xE6, 0x60, // out 0x60, al
        0xB8, 0xFF, 0xFF, // mov ax, 0xFFFF
        0x8E, 0xD8, // mov ds, ax
        0xA0, 0x10, 0x00, // mov al, [0x10]
        0xF4, // hlt
    ];
    let mut m = machine_with_program(0x200, &code);
    m.write_physical_u8(0x0, 0x5A);
    m.write_physical_u8(0x10_0000, 0xA5);
    // Start with the gate open so the test exercises the KBC-driven close.
    m.platform_mut().a20.set_enabled(true);

    m.run(64);
    assert!(!m.platform().a20.enabled(), "0xD1/0xDD closed the gate");
    assert_eq!(m.cpu_state().read_reg8(0), 0x5A, "1 MiB wrapped onto 0");

    // Reopen through the same path (0xD1/0xDF) and re-run the read.
    let code = [
        0xB0, 0xD1, 0xE6, 0x64, 0xB0, 0xDF, 0xE6, 0x60, //
        0xB8, 0xFF, 0xFF, 0x8E, 0xD8, 0xA0, 0x10, 0x00, 0xF4,
    ];
    let mut m = machine_with_program(0x200, &code);
    m.write_physical_u8(0x0, 0x5A);
    m.write_physical_u8(0x10_0000, 0xA5);
    m.run(64);
    assert!(m.platform().a20.enabled());
    assert_eq!(m.cpu_state().read_reg8(0), 0xA5);
}
