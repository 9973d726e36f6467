mod common;

use common::{machine_with_program, set_ivt_entry};

/// End to end: the guest programs the PIC and PIT, enables interrupts and
/// idles; the timer interrupt must tick a counter in guest memory.
#[test]
fn pit_periodic_interrupt_drives_a_guest_handler() {
    // Handler at 0000:0x500: inc word [0x3000]; mov al, 0x20; out 0x20, al; iret
    let handler = [
        0xFF, 0x06, 0x00, 0x30, // inc word [0x3000]
        0xB0, 0x20, // mov al, 0x20
        0xE6, 0x20, // out 0x20, al (EOI)
        0xCF, // iret
    ];
    // Main program at 0000:0x200:
    //   ICW1..ICW4 for the master PIC (offset 0x08), unmask all
    //   PIT channel 0, mode 2, reload 0x1000
    //   sti; loop: jmp loop
    let code = [
        0xB0, 0x11, 0xE6, 0x20, // icw1
        0xB0, 0x08, 0xE6, 0x21, // icw2: vectors 0x08..0x0F
        0xB0, 0x04, 0xE6, 0x21, // icw3
        0xB0, 0x01, 0xE6, 0x21, // icw4
        0xB0, 0x00, 0xE6, 0x21, // ocw1: unmask everything
        0xB0, 0x34, 0xE6, 0x43, // pit: channel 0, lobyte/hibyte, mode 2
        0xB0, 0x00, 0xE6, 0x40, // reload low
        0xB0, 0x10, 0xE6, 0x40, // reload high (0x1000 ticks ~ 3.4 ms)
        0xFB, // sti
        0xEB, 0xFE, // idle: jmp $
    ];
    let mut m = machine_with_program(0x200, &code);
    m.write_physical(0x500, &handler);
    set_ivt_entry(&mut m, 0x08, 0x0000, 0x500);

    // ~20 ms of guest time; the 3.4 ms period should fire several times.
    m.run(20_000_000);

    let ticks = m.read_physical_u32(0x3000) & 0xFFFF;
    assert!(
        (3..=10).contains(&ticks),
        "expected a handful of timer interrupts, got {ticks}"
    );
}
