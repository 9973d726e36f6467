use super::*;

fn text_mode_vga() -> Vga {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    // Misc output: color emulation, so the 3Dx range decodes.
    vga.port_write(0x3C2, 0x67);
    // Sequencer: screen on, 8-dot characters, odd/even write access.
    vga.port_write(0x3C4, 0x01);
    vga.port_write(0x3C5, 0x01);
    vga.port_write(0x3C4, 0x02);
    vga.port_write(0x3C5, 0x03);
    vga.port_write(0x3C4, 0x04);
    vga.port_write(0x3C5, 0x02);
    // Graphics: text mode, B8000 window.
    vga.port_write(0x3CE, 0x06);
    vga.port_write(0x3CF, 0x0E);
    vga.port_write(0x3CE, 0x05);
    vga.port_write(0x3CF, 0x10);
    // Attribute: screen enable + identity palette.
    vga.port_read(0x3DA);
    for i in 0..16u8 {
        vga.port_write(0x3C0, i);
        vga.port_write(0x3C0, i);
    }
    vga.port_write(0x3C0, 0x20);
    // CRTC: 80x25 cells of 8x16.
    let crtc: [(u8, u8); 8] = [
        (0x01, 79),   // horizontal display end
        (0x02, 80),   // horizontal blanking start
        (0x07, 0x1F), // overflow: vde bits 8/9
        (0x09, 0x0F), // 16 scanlines per character row
        (0x12, 0x8F), // vertical display end = 399
        (0x15, 0x96), // vertical blanking start
        (0x13, 40),   // row stride: 80 bytes
        (0x17, 0xA3),
    ];
    for (index, value) in crtc {
        vga.port_write(0x3D4, index);
        vga.port_write(0x3D5, value);
    }
    // Simple grayscale-ish DAC: index n -> 6-bit n.
    vga.port_write(0x3C8, 0);
    for i in 0..=255u32 {
        let v = (i & 63) as u8;
        vga.port_write(0x3C9, v);
        vga.port_write(0x3C9, v);
        vga.port_write(0x3C9, v);
    }
    vga
}

#[test]
fn index_data_register_files_round_trip() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.port_write(0x3C4, 0x02);
    vga.port_write(0x3C5, 0xBE);
    vga.port_write(0x3C4, 0x02);
    assert_eq!(vga.port_read(0x3C5), 0xBE & 0x0F);

    vga.port_write(0x3CE, 0x06);
    vga.port_write(0x3CF, 0x4F);
    vga.port_write(0x3CE, 0x06);
    assert_eq!(vga.port_read(0x3CF), 0x4F & 0x0F);

    // With MISC bit 0 clear only the mono range decodes.
    vga.port_write(0x3B4, 0x0E);
    vga.port_write(0x3B5, 0x12);
    assert_eq!(vga.port_read(0x3B5), 0x12);
    vga.port_write(0x3D5, 0x34); // ignored: color range not decoded
    assert_eq!(vga.port_read(0x3B5), 0x12);

    // Flip to color emulation and the same register file appears at 3Dx.
    vga.port_write(0x3C2, 0x01);
    assert_eq!(vga.port_read(0x3D5), 0x12);
    assert_eq!(vga.port_read(0x3B5), 0xFF);
}

#[test]
fn attribute_flipflop_resets_on_input_status_read() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.port_read(0x3DA);
    vga.port_write(0x3C0, 0x11); // index
    vga.port_write(0x3C0, 0xAA); // data
    vga.port_write(0x3C0, 0x11); // back to index state...
    vga.port_read(0x3DA); // ...but status read resets to index state
    vga.port_write(0x3C0, 0x12); // so this must select index 0x12, not write data
    vga.port_read(0x3DA);
    vga.port_write(0x3C0, 0x11);
    assert_eq!(vga.port_read(0x3C1), 0xAA);
}

#[test]
fn dac_palette_round_trips() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.port_write(0x3C8, 5);
    for rgb in [0x10, 0x20, 0x30, 0x11, 0x21, 0x31] {
        vga.port_write(0x3C9, rgb);
    }
    vga.port_write(0x3C7, 5);
    let got: Vec<u8> = (0..6).map(|_| vga.port_read(0x3C9)).collect();
    assert_eq!(got, vec![0x10, 0x20, 0x30, 0x11, 0x21, 0x31]);
    // 6-bit components expand to 8 bits in the resolved palette.
    assert_eq!(vga.dac_palette[5] & 0x00FF_0000, 0x0040_0000);
}

#[test]
fn write_mode0_rotate_and_set_reset() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    // Normal write access, write mode 0, all planes enabled.
    vga.port_write(0x3C4, 0x04);
    vga.port_write(0x3C5, 0x06);
    vga.port_write(0x3C4, 0x02);
    vga.port_write(0x3C5, 0x0F);
    // Bit mask fully open (firmware state), rotate by 1.
    vga.port_write(0x3CE, 0x08);
    vga.port_write(0x3CF, 0xFF);
    vga.port_write(0x3CE, 0x03);
    vga.port_write(0x3CF, 0x01);
    vga.mem_write(0xA0000, 0b1000_0001);
    assert_eq!(vga.vram[0], 0b1100_0000);

    // Set/reset plane 1 under enable-set/reset.
    vga.port_write(0x3CE, 0x03);
    vga.port_write(0x3CF, 0x00);
    vga.port_write(0x3CE, 0x00);
    vga.port_write(0x3CF, 0x02);
    vga.port_write(0x3CE, 0x01);
    vga.port_write(0x3CF, 0x02);
    vga.mem_write(0xA0001, 0x55);
    assert_eq!(vga.vram[4], 0x55, "plane 0 takes the CPU byte");
    assert_eq!(vga.vram[5], 0xFF, "plane 1 takes expanded set/reset");
}

#[test]
fn write_mode2_with_zero_bit_mask_preserves_latch() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.port_write(0x3C4, 0x04);
    vga.port_write(0x3C5, 0x06); // normal access
    vga.port_write(0x3C4, 0x02);
    vga.port_write(0x3C5, 0x0F);
    // Seed planes, then load the latch with a read.
    vga.vram[0..4].copy_from_slice(&[0x12, 0x34, 0x56, 0x78]);
    let _ = vga.mem_read(0xA0000);
    // Write mode 2, bit mask 0.
    vga.port_write(0x3CE, 0x05);
    vga.port_write(0x3CF, 0x02);
    vga.port_write(0x3CE, 0x08);
    vga.port_write(0x3CF, 0x00);
    vga.mem_write(0xA0000, 0x0F);
    assert_eq!(&vga.vram[0..4], &[0x12, 0x34, 0x56, 0x78]);
}

#[test]
fn write_mode1_copies_latch_between_locations() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.port_write(0x3C4, 0x04);
    vga.port_write(0x3C5, 0x06);
    vga.port_write(0x3C4, 0x02);
    vga.port_write(0x3C5, 0x0F);
    vga.vram[0..4].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
    let _ = vga.mem_read(0xA0000);
    vga.port_write(0x3CE, 0x05);
    vga.port_write(0x3CF, 0x01); // write mode 1
    vga.mem_write(0xA0010, 0);
    assert_eq!(&vga.vram[0x40..0x44], &[0xAA, 0xBB, 0xCC, 0xDD]);
}

#[test]
fn read_mode1_color_compare() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.port_write(0x3C4, 0x04);
    vga.port_write(0x3C5, 0x06);
    // Pixel column j matches when planes under the don't-care mask equal
    // the compare color.
    vga.vram[0..4].copy_from_slice(&[0xF0, 0x00, 0x00, 0x00]);
    vga.port_write(0x3CE, 0x05);
    vga.port_write(0x3CF, 0x08); // read mode 1
    vga.port_write(0x3CE, 0x02);
    vga.port_write(0x3CF, 0x01); // compare color: plane0 set
    vga.port_write(0x3CE, 0x07);
    vga.port_write(0x3CF, 0x01); // only plane 0 participates
    assert_eq!(vga.mem_read(0xA0000), 0xF0);
}

#[test]
fn chain4_maps_low_bits_to_planes() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.port_write(0x3C4, 0x04);
    vga.port_write(0x3C5, 0x0E); // chain-4
    vga.port_write(0x3C4, 0x02);
    vga.port_write(0x3C5, 0x0F);
    vga.port_write(0x3CE, 0x05);
    vga.port_write(0x3CF, 0x00);
    vga.port_write(0x3CE, 0x08);
    vga.port_write(0x3CF, 0xFF);
    for (i, v) in [0x11u8, 0x22, 0x33, 0x44].iter().enumerate() {
        vga.mem_write(0xA0000 + i as u32, *v);
    }
    assert_eq!(&vga.vram[0..4], &[0x11, 0x22, 0x33, 0x44]);
    for i in 0..4u32 {
        assert_eq!(vga.mem_read(0xA0000 + i), [0x11, 0x22, 0x33, 0x44][i as usize]);
    }
}

#[test]
fn vbe_mode_set_resizes_and_clears() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.vram_mut()[100] = 0x77;
    vga.vbe_port_write(VBE_INDEX_PORT, 1);
    vga.vbe_port_write(VBE_DATA_PORT, 1024);
    vga.vbe_port_write(VBE_INDEX_PORT, 2);
    vga.vbe_port_write(VBE_DATA_PORT, 768);
    vga.vbe_port_write(VBE_INDEX_PORT, 3);
    vga.vbe_port_write(VBE_DATA_PORT, 32);
    vga.vbe_port_write(VBE_INDEX_PORT, 4);
    vga.vbe_port_write(VBE_DATA_PORT, VBE_DISPI_ENABLED | VBE_DISPI_LFB_ENABLED);

    assert_eq!(vga.resolution(), (1024, 768));
    assert_eq!(vga.vram()[100], 0, "mode set clears VRAM");

    let mut display = BufferDisplay::new();
    // Pixel (3, 2) through the linear framebuffer.
    let addr = VBE_LFB_BASE + (2 * 1024 + 3) * 4;
    for (i, b) in 0x00FF_8040u32.to_le_bytes().iter().enumerate() {
        vga.mem_write(addr + i as u32, *b);
    }
    vga.render_frame(&mut display);
    assert_eq!(display.pixel(3, 2), 0xFFFF_8040);
    assert_eq!(display.pixel(4, 2), 0xFF00_0000);
}

#[test]
fn vbe_noclearmem_preserves_vram() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.vram_mut()[0] = 0x55;
    vga.vbe_port_write(VBE_INDEX_PORT, 3);
    vga.vbe_port_write(VBE_DATA_PORT, 8);
    vga.vbe_port_write(VBE_INDEX_PORT, 4);
    vga.vbe_port_write(VBE_DATA_PORT, VBE_DISPI_ENABLED | VBE_DISPI_NOCLEARMEM);
    assert_eq!(vga.vram()[0], 0x55);
}

#[test]
fn vbe_getcaps_reports_maximums() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.vbe_port_write(VBE_INDEX_PORT, 4);
    vga.vbe_port_write(VBE_DATA_PORT, VBE_DISPI_GETCAPS);
    vga.vbe_port_write(VBE_INDEX_PORT, 1);
    assert_eq!(vga.vbe_port_read(VBE_DATA_PORT), VBE_MAX_XRES as u16);
    vga.vbe_port_write(VBE_INDEX_PORT, 3);
    assert_eq!(vga.vbe_port_read(VBE_DATA_PORT), VBE_MAX_BPP as u16);
}

#[test]
fn text_cursor_blinks_in_scanline_window() {
    let mut vga = text_mode_vga();
    assert!(matches!(vga.renderer, Renderer::Alphanumeric));
    assert_eq!(vga.resolution(), (640, 400));

    // Cell (row 2, col 0): "space" with white-on-black attribute.
    // Odd/even text writes land character/attribute in planes 0/1.
    vga.mem_write(0xB8000 + 2 * 160, b' ');
    vga.mem_write(0xB8000 + 2 * 160 + 1, 0x0F);
    // Cursor at that cell (character address 160), scanlines 13..=14.
    for (index, value) in [(0x0A, 0x0D), (0x0B, 0x0E), (0x0E, 0x00), (0x0F, 0xA0)] {
        vga.port_write(0x3D4, index);
        vga.port_write(0x3D5, value as u8);
    }

    let mut display = BufferDisplay::new();
    // Frames 1..31: cursor hidden (frame counter below the blink point).
    vga.render_frame(&mut display);
    let fg = vga.dac_palette[(vga.dac_mask & vga.attr_palette[15]) as usize];
    let bg = vga.dac_palette[(vga.dac_mask & vga.attr_palette[0]) as usize];
    let cursor_row = 2 * 16 + 13;
    assert_eq!(display.pixel(0, cursor_row), bg, "cursor not visible yet");

    for _ in 0..32 {
        vga.render_frame(&mut display);
    }
    // Now the frame counter is past 0x20: scanlines 13 and 14 of the cell
    // render as a solid block of foreground.
    for col in 0..8 {
        assert_eq!(display.pixel(col, cursor_row), fg);
        assert_eq!(display.pixel(col, cursor_row + 1), fg);
    }
    // The scanline just above the cursor window is untouched.
    assert_eq!(display.pixel(0, 2 * 16 + 12), bg);
}

#[test]
fn mode13_renders_chained_pixels() {
    let mut vga = Vga::new(DEFAULT_VRAM_SIZE);
    vga.port_write(0x3C2, 0x63);
    // Mode 13h: chain-4, 256-color graphics; the dot-clock halve doubles
    // every column so the visible 320x200 renders as 640x400.
    vga.port_write(0x3C4, 0x01);
    vga.port_write(0x3C5, 0x09);
    vga.port_write(0x3C4, 0x04);
    vga.port_write(0x3C5, 0x0E);
    vga.port_write(0x3CE, 0x06);
    vga.port_write(0x3CF, 0x05);
    vga.port_write(0x3CE, 0x05);
    vga.port_write(0x3CF, 0x40);
    vga.port_read(0x3DA);
    vga.port_write(0x3C0, 0x10);
    vga.port_write(0x3C0, 0x41);
    for i in 0..16u8 {
        vga.port_read(0x3DA);
        vga.port_write(0x3C0, i);
        vga.port_write(0x3C0, i);
    }
    vga.port_read(0x3DA);
    vga.port_write(0x3C0, 0x20);
    let crtc: [(u8, u8); 6] = [
        (0x01, 79),
        (0x02, 80),
        (0x07, 0x1F),
        (0x09, 0x41), // double scan + 2 scanlines per row
        (0x12, 0x8F),
        (0x13, 40),
    ];
    for (index, value) in crtc {
        vga.port_write(0x3D4, index);
        vga.port_write(0x3D5, value);
    }
    // DAC entry 42 = pure red-ish.
    vga.port_write(0x3C8, 42);
    vga.port_write(0x3C9, 63);
    vga.port_write(0x3C9, 0);
    vga.port_write(0x3C9, 0);

    assert!(matches!(vga.renderer, Renderer::Mode13 { .. }));
    // Pixel (0,0) through the chained A0000 window.
    vga.mem_write(0xA0000, 42);
    let mut display = BufferDisplay::new();
    vga.render_frame(&mut display);
    let red = vga.dac_palette[42];
    assert_eq!(display.pixel(0, 0), red);
    assert_eq!(display.pixel(1, 0), red, "dot clock halving doubles columns");
}

#[test]
fn snapshot_round_trips_register_state() {
    use corten_io_snapshot::IoSnapshot;

    let mut vga = text_mode_vga();
    vga.port_write(0x3D4, 0x0E);
    vga.port_write(0x3D5, 0x12);
    let state = vga.save_state();

    let mut other = Vga::new(DEFAULT_VRAM_SIZE);
    other.load_state(&state).unwrap();
    other.vram_mut().copy_from_slice(vga.vram());
    other.port_write(0x3D4, 0x0E);
    assert_eq!(other.port_read(0x3D5), 0x12);
    assert!(matches!(other.renderer, Renderer::Alphanumeric));
    assert_eq!(other.resolution(), (640, 400));
}
