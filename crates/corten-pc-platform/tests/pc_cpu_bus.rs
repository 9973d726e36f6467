use corten_cpu_core::exception::Exception;
use corten_cpu_core::mem::CpuBus;
use corten_cpu_core::state::{CpuMode, CpuState, CR0_PE, CR0_PG, CR0_WP};
use corten_pc_platform::{PcCpuBus, PcPlatform};

const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;

fn paged_bus() -> PcCpuBus {
    PcCpuBus::new(PcPlatform::new(2 * 1024 * 1024))
}

fn paged_state(cr3: u32) -> CpuState {
    let mut state = CpuState::new(CpuMode::Protected);
    state.control.cr0 |= CR0_PE | CR0_PG;
    state.control.cr3 = cr3;
    state.update_mode();
    state
}

/// Builds a single legacy-32 mapping vaddr -> page_phys.
fn map_page(bus: &mut PcCpuBus, pd: u32, pt: u32, vaddr: u32, page: u32, flags: u32) {
    let pde = pd + (vaddr >> 22) * 4;
    let pte = pt + (vaddr >> 12 & 0x3FF) * 4;
    bus.write_physical_u32(pde, pt | PTE_P | PTE_RW | PTE_US);
    bus.write_physical_u32(pte, page | flags);
}

#[test]
fn legacy32_walk_sets_accessed_and_dirty_bits() {
    let mut bus = paged_bus();
    let vaddr = 0x0040_0000;
    map_page(&mut bus, 0x1000, 0x2000, vaddr, 0x5000, PTE_P | PTE_RW | PTE_US);
    bus.write_physical_u8(0x5000, 0xAA);

    let state = paged_state(0x1000);
    bus.sync(&state);

    assert_eq!(bus.read_u8(vaddr, false).unwrap(), 0xAA);
    let pte = bus.read_physical_u32(0x2000);
    assert_ne!(pte & 1 << 5, 0, "accessed set on read");
    assert_eq!(pte & 1 << 6, 0, "no dirty on read");

    bus.write_u8(vaddr, 0xBB, false).unwrap();
    assert_eq!(bus.read_physical_u8(0x5000), 0xBB);
    let pte = bus.read_physical_u32(0x2000);
    assert_ne!(pte & 1 << 6, 0, "dirty set on write, even after a TLB hit");
}

#[test]
fn unmapped_page_faults_with_architectural_error_code() {
    let mut bus = paged_bus();
    let state = paged_state(0x1000);
    bus.sync(&state);
    assert_eq!(
        bus.read_u8(0x0040_0000, false),
        Err(Exception::PageFault {
            addr: 0x0040_0000,
            error_code: 0,
        })
    );
    assert_eq!(
        bus.write_u8(0x0040_0000, 1, true),
        Err(Exception::PageFault {
            addr: 0x0040_0000,
            error_code: 1 << 1 | 1 << 2,
        })
    );
}

#[test]
fn split_write_across_unmapped_page_commits_nothing() {
    let mut bus = paged_bus();
    // Map only one page; its successor stays absent.
    map_page(&mut bus, 0x1000, 0x2000, 0x0040_0000, 0x5000, PTE_P | PTE_RW | PTE_US);
    bus.write_physical_u8(0x5FFF, 0x77);

    let state = paged_state(0x1000);
    bus.sync(&state);

    let err = bus.write_u16(0x0040_0FFF, 0x1234, false).unwrap_err();
    assert_eq!(
        err,
        Exception::PageFault {
            addr: 0x0040_1000,
            error_code: 1 << 1,
        }
    );
    // First byte did not commit.
    assert_eq!(bus.read_physical_u8(0x5FFF), 0x77);
}

#[test]
fn supervisor_write_to_readonly_page_respects_wp() {
    let mut bus = paged_bus();
    map_page(&mut bus, 0x1000, 0x2000, 0, 0x5000, PTE_P | PTE_US);
    bus.write_physical_u8(0x5000, 0xAA);

    // WP clear: supervisor ignores the read-only bit.
    let state = paged_state(0x1000);
    bus.sync(&state);
    bus.write_u8(0, 0xBB, false).unwrap();
    assert_eq!(bus.read_physical_u8(0x5000), 0xBB);

    // WP set: same write faults.
    let mut bus = paged_bus();
    map_page(&mut bus, 0x1000, 0x2000, 0, 0x5000, PTE_P | PTE_US);
    let mut state = paged_state(0x1000);
    state.control.cr0 |= CR0_WP;
    bus.sync(&state);
    assert_eq!(
        bus.write_u8(0, 0xBB, false),
        Err(Exception::PageFault {
            addr: 0,
            error_code: 1 << 0 | 1 << 1,
        })
    );
}

#[test]
fn invlpg_flushes_a_single_translation() {
    let mut bus = paged_bus();
    let vaddr = 0x0040_0000;
    map_page(&mut bus, 0x1000, 0x2000, vaddr, 0x5000, PTE_P | PTE_RW | PTE_US);
    bus.write_physical_u8(0x5000, 0xAA);
    bus.write_physical_u8(0x6000, 0xBB);

    let state = paged_state(0x1000);
    bus.sync(&state);
    assert_eq!(bus.read_u8(vaddr, false).unwrap(), 0xAA);

    // Swap the leaf mapping; the stale translation persists until INVLPG.
    bus.write_physical_u32(0x2000, 0x6000 | PTE_P | PTE_RW | PTE_US);
    assert_eq!(bus.read_u8(vaddr, false).unwrap(), 0xAA);
    bus.invlpg(vaddr);
    assert_eq!(bus.read_u8(vaddr, false).unwrap(), 0xBB);
}

#[test]
fn cr3_reload_flushes_cached_translations() {
    let mut bus = paged_bus();
    let vaddr = 0x0040_0000;
    map_page(&mut bus, 0x1000, 0x2000, vaddr, 0x5000, PTE_P | PTE_RW | PTE_US);
    map_page(&mut bus, 0x7000, 0x8000, vaddr, 0x6000, PTE_P | PTE_RW | PTE_US);
    bus.write_physical_u8(0x5000, 0xAA);
    bus.write_physical_u8(0x6000, 0xBB);

    let mut state = paged_state(0x1000);
    bus.sync(&state);
    assert_eq!(bus.read_u8(vaddr, false).unwrap(), 0xAA);

    state.control.cr3 = 0x7000;
    bus.sync(&state);
    assert_eq!(bus.read_u8(vaddr, false).unwrap(), 0xBB);
}

#[test]
fn a20_gate_folds_linear_addresses_without_paging() {
    let mut bus = paged_bus();
    let state = CpuState::new(CpuMode::Real);
    bus.sync(&state);

    bus.write_physical_u8(0x0, 0x11);
    bus.write_physical_u8(0x10_0000, 0x22);

    // Gate closed: 1 MiB wraps onto 0.
    assert!(!bus.platform.a20.enabled());
    assert_eq!(bus.read_u8(0x10_0000, false).unwrap(), 0x11);

    bus.platform.a20.set_enabled(true);
    assert_eq!(bus.read_u8(0x10_0000, false).unwrap(), 0x22);
}

#[test]
fn vga_hole_routes_to_mmio_not_ram() {
    let mut bus = paged_bus();
    let state = CpuState::new(CpuMode::Real);
    bus.sync(&state);

    // Put the VGA into chain-4 write access so the byte lands in VRAM.
    let vga = bus.platform.vga().unwrap();
    {
        let mut v = vga.borrow_mut();
        v.port_write(0x3C4, 0x04);
        v.port_write(0x3C5, 0x0E);
        v.port_write(0x3C4, 0x02);
        v.port_write(0x3C5, 0x0F);
        v.port_write(0x3CE, 0x08);
        v.port_write(0x3CF, 0xFF);
    }
    bus.write_u8(0xA0000, 0x42, false).unwrap();
    assert_eq!(vga.borrow().vram()[0], 0x42);
    // Guest RAM at the same physical address is untouched.
    assert_eq!(bus.platform.ram.borrow().read(0xA0000), 0);
}
