use corten_machine::{Machine, MachineConfig};

fn machine() -> Machine {
    Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap()
}

fn read_reg_a(m: &mut Machine) -> u8 {
    m.io_write(0x70, 1, 0x0A);
    m.io_read(0x71, 1) as u8
}

/// REG-A.UIP asserts for the final ~244 us of every second and nowhere
/// else; calibration loops depend on both edges.
#[test]
fn uip_reads_high_only_in_the_update_window() {
    let mut m = machine();

    assert_eq!(read_reg_a(&mut m) & 0x80, 0, "start of second: UIP clear");

    // 100 us before the rollover: inside the window.
    m.platform_mut().tick(1_000_000_000 - 100_000);
    assert_eq!(read_reg_a(&mut m) & 0x80, 0x80);

    // 1 ms past the rollover: the seconds updated and UIP dropped.
    m.platform_mut().tick(1_100_000);
    assert_eq!(read_reg_a(&mut m) & 0x80, 0);

    // 500 ms into the next second: still clear.
    m.platform_mut().tick(500_000_000);
    assert_eq!(read_reg_a(&mut m) & 0x80, 0);

    // And high again just before the next rollover.
    m.platform_mut().tick(499_900_000);
    assert_eq!(read_reg_a(&mut m) & 0x80, 0x80);
}

/// BCD round-trip through the date/time registers under the default
/// BCD/24-hour configuration.
#[test]
fn cmos_bcd_time_round_trips() {
    let mut m = machine();
    let pairs = [(0x04u32, 0x21u32), (0x02, 0x45), (0x00, 0x30), (0x07, 0x15)];
    for (reg, value) in pairs {
        m.io_write(0x70, 1, reg);
        m.io_write(0x71, 1, value);
        m.io_write(0x70, 1, reg);
        assert_eq!(m.io_read(0x71, 1), value, "register {reg:#x}");
    }
}
