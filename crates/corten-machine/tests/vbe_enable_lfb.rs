use corten_machine::{Machine, MachineConfig};
use corten_pc_constants::VBE_LFB_BASE;
use pretty_assertions::assert_eq;

const VBE_INDEX: u16 = 0x1CE;
const VBE_DATA: u16 = 0x1CF;

fn vbe_write(m: &mut Machine, index: u16, value: u16) {
    m.io_write(VBE_INDEX, 2, index as u32);
    m.io_write(VBE_DATA, 2, value as u32);
}

#[test]
fn vbe_mode_set_resizes_surface_and_maps_lfb_pixels() {
    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 4 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();

    // Seed VRAM so the clear-on-enable is observable.
    {
        let vga = m.platform().vga().unwrap();
        vga.borrow_mut().vram_mut()[64] = 0x77;
    }

    vbe_write(&mut m, 1, 1024);
    vbe_write(&mut m, 2, 768);
    vbe_write(&mut m, 3, 32);
    vbe_write(&mut m, 4, 0x41); // ENABLED | LFB
    {
        let vga = m.platform().vga().unwrap();
        assert_eq!(vga.borrow().vram()[64], 0, "mode set cleared VRAM");
    }

    // Plot pixel (x=7, y=5) through the linear framebuffer.
    let addr = VBE_LFB_BASE + (5 * 1024 + 7) * 4;
    for (i, b) in 0x00AB_CDEFu32.to_le_bytes().iter().enumerate() {
        m.write_physical_u8(addr + i as u32, *b);
    }

    m.render_frame();
    assert_eq!(m.display_resolution(), (1024, 768));
    assert_eq!(m.display().pixel(7, 5), 0xFFAB_CDEF);
    assert_eq!(m.display().pixel(8, 5), 0xFF00_0000);
}

#[test]
fn vbe_noclearmem_preserves_vram_across_enable() {
    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 4 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    {
        let vga = m.platform().vga().unwrap();
        vga.borrow_mut().vram_mut()[100] = 0x55;
    }
    vbe_write(&mut m, 1, 640);
    vbe_write(&mut m, 2, 480);
    vbe_write(&mut m, 3, 8);
    vbe_write(&mut m, 4, 0x41 | 0x80); // NOCLEARMEM
    let vga = m.platform().vga().unwrap();
    assert_eq!(vga.borrow().vram()[100], 0x55);
}
