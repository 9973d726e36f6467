use corten_machine::{Machine, MachineConfig};
use pretty_assertions::assert_eq;

#[test]
fn vga_ports_minimal_semantics() {
    let cfg = MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        enable_i8042: false,
        ..Default::default()
    };
    let mut m = Machine::new(cfg).unwrap();

    // ---------------------------------------------------------------------
    // Misc output selects color emulation so the 3Dx decode opens up.
    // ---------------------------------------------------------------------
    m.io_write(0x3C2, 1, 0x67);
    assert_eq!(m.io_read(0x3CC, 1) as u8, 0x67);

    // ---------------------------------------------------------------------
    // Sequencer index/data
    // ---------------------------------------------------------------------
    m.io_write(0x3C4, 1, 0x02);
    m.io_write(0x3C5, 1, 0x0E);
    m.io_write(0x3C4, 1, 0x02);
    assert_eq!(m.io_read(0x3C5, 1) as u8, 0x0E);

    // 16-bit "index+data" writes through the index port.
    m.io_write(0x3C4, 2, 0x0A03); // idx=0x03, data=0x0A
    m.io_write(0x3C4, 1, 0x03);
    assert_eq!(m.io_read(0x3C5, 1) as u8, 0x0A);

    // ---------------------------------------------------------------------
    // Graphics controller index/data
    // ---------------------------------------------------------------------
    m.io_write(0x3CE, 1, 0x08);
    m.io_write(0x3CF, 1, 0x4F);
    m.io_write(0x3CE, 1, 0x08);
    assert_eq!(m.io_read(0x3CF, 1) as u8, 0x4F);

    // ---------------------------------------------------------------------
    // CRTC index/data behind the color base
    // ---------------------------------------------------------------------
    m.io_write(0x3D4, 1, 0x0E);
    m.io_write(0x3D5, 1, 0x12);
    m.io_write(0x3D4, 1, 0x0E);
    assert_eq!(m.io_read(0x3D5, 1) as u8, 0x12);
    // The mono decode is disabled while MISC bit 0 is set.
    assert_eq!(m.io_read(0x3B5, 1) as u8, 0xFF);

    // ---------------------------------------------------------------------
    // Attribute controller flip-flop reset via Input Status 1
    // ---------------------------------------------------------------------
    m.io_read(0x3DA, 1);
    m.io_write(0x3C0, 1, 0x11);
    m.io_write(0x3C0, 1, 0xAA);
    m.io_write(0x3C0, 1, 0x11);
    m.io_read(0x3DA, 1); // resets to index state
    m.io_write(0x3C0, 1, 0x12); // index select, must not clobber data
    m.io_read(0x3DA, 1);
    m.io_write(0x3C0, 1, 0x11);
    assert_eq!(m.io_read(0x3C1, 1) as u8, 0xAA);

    // ---------------------------------------------------------------------
    // DAC palette round-trip
    // ---------------------------------------------------------------------
    m.io_write(0x3C8, 1, 0x10);
    for c in [0x01, 0x02, 0x03, 0x11, 0x12, 0x13] {
        m.io_write(0x3C9, 1, c);
    }
    m.io_write(0x3C7, 1, 0x10);
    let got: Vec<u32> = (0..6).map(|_| m.io_read(0x3C9, 1)).collect();
    assert_eq!(got, vec![0x01, 0x02, 0x03, 0x11, 0x12, 0x13]);

    // ---------------------------------------------------------------------
    // Unimplemented reads float high
    // ---------------------------------------------------------------------
    assert_eq!(m.io_read(0x3C3, 1) as u8, 0xFF);
}
