use corten_machine::{Machine, MachineConfig};

/// Machine with a real-mode program loaded at `addr` and CS:IP pointing at
/// it; the stack sits at 0:0x7000.
pub fn machine_with_program(addr: u32, code: &[u8]) -> Machine {
    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 4 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    m.write_physical(addr, code);
    {
        let state = m.cpu_state_mut();
        state.segments.cs.selector = 0;
        state.segments.cs.base = 0;
        state.set_eip(addr);
        state.set_esp(0x7000);
        // The IVT lives at 0 with the architectural real-mode limit.
        state.tables.idtr.base = 0;
        state.tables.idtr.limit = 0x3FF;
    }
    m.sync_cpu();
    m
}

pub fn set_ivt_entry(m: &mut Machine, vector: u8, segment: u16, offset: u16) {
    let base = vector as u32 * 4;
    m.write_physical(base, &offset.to_le_bytes());
    m.write_physical(base + 2, &segment.to_le_bytes());
}
