//! System instructions: segment loads, descriptor tables, control and
//! debug registers, MSRs, port I/O, privilege checks.

use super::{pop, push, read_operand_sized, write_operand_sized, Control};
use crate::decode::{Instr, Op, Operand};
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::seg::{load_seg, read_descriptor};
use crate::state::{CpuState, Eflags, OpSize, SegReg, CR0_EM, CR0_PE, CR0_PG, CR0_TS, CR4_TSD};

pub(super) fn mov_seg(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    match (instr.dst, instr.src) {
        (Operand::Seg(seg), src) => {
            let selector = read_operand_sized(state, bus, instr, src, OpSize::Word)? as u16;
            load_seg(state, bus, seg, selector)?;
            if seg == SegReg::Ss {
                state.interrupt_shadow = true;
            }
            bus.sync(state);
            Ok(Control::Advance)
        }
        (dst, Operand::Seg(seg)) => {
            let value = state.segments.get(seg).selector as u32;
            // Register destinations zero-extend to the operand size;
            // memory destinations store 16 bits regardless.
            match dst {
                Operand::Reg(_) => write_operand_sized(state, bus, instr, dst, instr.size, value)?,
                _ => write_operand_sized(state, bus, instr, dst, OpSize::Word, value)?,
            }
            Ok(Control::Advance)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

pub(super) fn pop_rm(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    // POP r/m evaluates the address after the pop (ESP-relative operands
    // see the updated stack pointer).
    let value = pop(state, bus, instr.size)?;
    if let Err(e) = super::write_operand(state, bus, instr, instr.dst, value) {
        // Undo the pop so the faulting instruction can restart.
        let mask = state.stack_mask();
        let esp = state.esp().wrapping_sub(instr.size.bytes()) & mask | state.esp() & !mask;
        state.set_esp(esp);
        return Err(e);
    }
    Ok(Control::Advance)
}

pub(super) fn pushf(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    if state.vm86() && state.iopl() != 3 {
        return Err(Exception::gp0());
    }
    let flags = state.eflags() & !(Eflags::VM.bits() | Eflags::RF.bits());
    push(state, bus, flags & instr.size.mask(), instr.size)?;
    Ok(Control::Advance)
}

pub(super) fn popf(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    if state.vm86() && state.iopl() != 3 {
        return Err(Exception::gp0());
    }
    let value = pop(state, bus, instr.size)?;
    let mut mask = if instr.size == OpSize::Word {
        0xFFFFu32
    } else {
        0x003F_7FD5 & !Eflags::VM.bits()
    };
    if state.protected_mode() && state.cpl != 0 {
        mask &= !Eflags::IOPL.bits();
        if state.cpl > state.iopl() {
            mask &= !Eflags::IF.bits();
        }
    }
    state.set_eflags_masked(value, mask);
    Ok(Control::Advance)
}

pub(super) fn cli(state: &mut CpuState) -> Result<Control, Exception> {
    if state.protected_mode() && (state.vm86() || state.cpl > state.iopl()) && state.iopl() != 3 {
        return Err(Exception::gp0());
    }
    state.set_flag(Eflags::IF, false);
    Ok(Control::Advance)
}

pub(super) fn sti(state: &mut CpuState) -> Result<Control, Exception> {
    if state.protected_mode() && (state.vm86() || state.cpl > state.iopl()) && state.iopl() != 3 {
        return Err(Exception::gp0());
    }
    if !state.if_enabled() {
        // Interrupts stay held off until after the next instruction.
        state.interrupt_shadow = true;
    }
    state.set_flag(Eflags::IF, true);
    Ok(Control::Advance)
}

/// IOPL/VM86 gate for IN/OUT/INS/OUTS. The TSS I/O-permission bitmap is
/// not modelled; IOPL alone decides.
pub(crate) fn check_io_permission(state: &mut CpuState) -> Result<(), Exception> {
    if state.protected_mode() && (state.vm86() || state.cpl > state.iopl()) {
        return Err(Exception::gp0());
    }
    Ok(())
}

pub(super) fn port_io(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    check_io_permission(state)?;
    let size_bytes = instr.size.bytes() as u8;
    match instr.op {
        Op::In => {
            let port = match instr.src {
                Operand::Imm(p) => p as u16,
                Operand::Reg(2) => state.read_reg16(2),
                _ => return Err(Exception::InvalidOpcode),
            };
            let value = bus.io_read(port, size_bytes);
            state.write_reg(0, value & instr.size.mask(), instr.size);
        }
        _ => {
            let port = match instr.dst {
                Operand::Imm(p) => p as u16,
                Operand::Reg(2) => state.read_reg16(2),
                _ => return Err(Exception::InvalidOpcode),
            };
            let value = state.read_reg(0, instr.size);
            bus.io_write(port, size_bytes, value);
        }
    }
    Ok(Control::Advance)
}

pub(super) fn hlt(state: &mut CpuState) -> Result<Control, Exception> {
    if state.protected_mode() && state.cpl != 0 {
        return Err(Exception::gp0());
    }
    state.halted = true;
    Ok(Control::Halt)
}

pub(super) fn dtable(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let load = matches!(instr.op, Op::Lgdt | Op::Lidt);
    if load && state.protected_mode() && state.cpl != 0 && !state.vm86() {
        return Err(Exception::gp0());
    }
    let lin = super::mem_linear(state, instr, 6, !load)?;
    let user = state.user_access();
    if load {
        let limit = bus.read_u16(lin, user)?;
        let mut base = bus.read_u32(lin.wrapping_add(2), user)?;
        if instr.size == OpSize::Word {
            base &= 0x00FF_FFFF;
        }
        let table = if matches!(instr.op, Op::Lgdt) {
            &mut state.tables.gdtr
        } else {
            &mut state.tables.idtr
        };
        table.base = base;
        table.limit = limit;
    } else {
        let table = if matches!(instr.op, Op::Sgdt) {
            state.tables.gdtr
        } else {
            state.tables.idtr
        };
        bus.write_u16(lin, table.limit, user)?;
        bus.write_u32(lin.wrapping_add(2), table.base, user)?;
    }
    Ok(Control::Advance)
}

pub(super) fn lldt(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    if !state.protected_mode() || state.vm86() {
        return Err(Exception::InvalidOpcode);
    }
    if state.cpl != 0 {
        return Err(Exception::gp0());
    }
    let selector = read_operand_sized(state, bus, instr, instr.src, OpSize::Word)? as u16;
    if selector & !3 == 0 {
        state.tables.ldtr.selector = selector;
        state.tables.ldtr.valid = false;
        return Ok(Control::Advance);
    }
    if selector & 4 != 0 {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let desc = read_descriptor(state, bus, selector)?;
    if desc.system_type() & 0x1F != 0x02 {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    if !desc.present() {
        return Err(Exception::SegmentNotPresent(selector & !3));
    }
    state.tables.ldtr = desc.to_segment(selector);
    Ok(Control::Advance)
}

pub(super) fn ltr(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    if !state.protected_mode() || state.vm86() {
        return Err(Exception::InvalidOpcode);
    }
    if state.cpl != 0 {
        return Err(Exception::gp0());
    }
    let selector = read_operand_sized(state, bus, instr, instr.src, OpSize::Word)? as u16;
    if selector & !3 == 0 || selector & 4 != 0 {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let desc = read_descriptor(state, bus, selector)?;
    // Available 16- or 32-bit TSS only; busy variants fault.
    if !matches!(desc.system_type() & 0x0F, 0x01 | 0x09) || desc.system_type() & 0x10 != 0 {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    if !desc.present() {
        return Err(Exception::SegmentNotPresent(selector & !3));
    }
    state.tables.tr = desc.to_segment(selector);
    // Mark busy in the descriptor.
    let base = state.tables.gdtr.base.wrapping_add((selector & !7) as u32);
    let high = bus.read_u32(base + 4, false)?;
    bus.write_u32(base + 4, high | 0x200, false)?;
    Ok(Control::Advance)
}

pub(super) fn lmsw(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    if state.protected_mode() && state.cpl != 0 {
        return Err(Exception::gp0());
    }
    let value = read_operand_sized(state, bus, instr, instr.src, OpSize::Word)?;
    // LMSW can set PE but never clear it, and touches only the low nibble
    // plus NE.
    let mut cr0 = state.control.cr0;
    cr0 = cr0 & !0x0000_000E | value & 0x0000_000E;
    if value & CR0_PE != 0 {
        cr0 |= CR0_PE;
    }
    state.control.cr0 = cr0;
    state.update_mode();
    bus.sync(state);
    Ok(Control::Advance)
}

pub(super) fn lar_lsl(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    lar: bool,
) -> Result<Control, Exception> {
    if !state.protected_mode() || state.vm86() {
        return Err(Exception::InvalidOpcode);
    }
    let selector = read_operand_sized(state, bus, instr, instr.src, OpSize::Word)? as u16;
    let accessible = if selector & !3 == 0 {
        false
    } else {
        match read_descriptor(state, bus, selector) {
            Ok(desc) => {
                let seg = desc.to_segment(selector);
                let rpl = (selector & 3) as u8;
                if seg.is_system() {
                    // LAR accepts most system types, LSL fewer; both
                    // reject gates without limits.
                    matches!(desc.system_type() & 0x1F, 0x01 | 0x02 | 0x03 | 0x09 | 0x0B)
                } else if seg.code_conforming() {
                    true
                } else {
                    seg.dpl() >= state.cpl && seg.dpl() >= rpl
                }
            }
            Err(_) => false,
        }
    };
    if !accessible {
        state.set_flag(Eflags::ZF, false);
        return Ok(Control::Advance);
    }
    let desc = read_descriptor(state, bus, selector)?;
    let value = if lar {
        desc.high & 0x00FF_FF00
    } else {
        desc.to_segment(selector).limit
    };
    super::write_operand(state, bus, instr, instr.dst, value & instr.size.mask())?;
    state.set_flag(Eflags::ZF, true);
    Ok(Control::Advance)
}

pub(super) fn verr_verw(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    write: bool,
) -> Result<Control, Exception> {
    if !state.protected_mode() || state.vm86() {
        return Err(Exception::InvalidOpcode);
    }
    let selector = read_operand_sized(state, bus, instr, instr.src, OpSize::Word)? as u16;
    let ok = if selector & !3 == 0 {
        false
    } else {
        match read_descriptor(state, bus, selector) {
            Ok(desc) => {
                let seg = desc.to_segment(selector);
                let rpl = (selector & 3) as u8;
                if seg.is_system() {
                    false
                } else if write {
                    !seg.is_code()
                        && seg.data_writable()
                        && seg.dpl() >= state.cpl
                        && seg.dpl() >= rpl
                } else if seg.is_code() {
                    seg.code_readable()
                        && (seg.code_conforming()
                            || (seg.dpl() >= state.cpl && seg.dpl() >= rpl))
                } else {
                    seg.dpl() >= state.cpl && seg.dpl() >= rpl
                }
            }
            Err(_) => false,
        }
    };
    state.set_flag(Eflags::ZF, ok);
    Ok(Control::Advance)
}

pub(super) fn invlpg(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    if state.protected_mode() && state.cpl != 0 {
        return Err(Exception::gp0());
    }
    let lin = super::effective_offset(state, instr);
    let lin = state
        .segments
        .get(instr.seg)
        .base
        .wrapping_add(lin);
    bus.invlpg(lin);
    Ok(Control::Advance)
}

pub(super) fn mov_cr(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    if state.protected_mode() && state.cpl != 0 {
        return Err(Exception::gp0());
    }
    if matches!(instr.op, Op::MovFromCr) {
        let cr = match instr.src {
            Operand::Cr(n) => n,
            _ => return Err(Exception::InvalidOpcode),
        };
        let value = match cr {
            0 => state.control.cr0,
            2 => state.control.cr2,
            3 => state.control.cr3,
            4 => state.control.cr4,
            _ => return Err(Exception::InvalidOpcode),
        };
        if let Operand::Reg(r) = instr.dst {
            state.write_reg32(r, value);
        }
        return Ok(Control::Advance);
    }
    let cr = match instr.dst {
        Operand::Cr(n) => n,
        _ => return Err(Exception::InvalidOpcode),
    };
    let value = match instr.src {
        Operand::Reg(r) => state.read_reg32(r),
        _ => return Err(Exception::InvalidOpcode),
    };
    match cr {
        0 => {
            if value & CR0_PG != 0 && value & CR0_PE == 0 {
                return Err(Exception::gp0());
            }
            state.control.cr0 = value | 0x0002_0000; // ET hardwired
            state.update_mode();
        }
        2 => state.control.cr2 = value,
        3 => state.control.cr3 = value,
        4 => {
            const CR4_KNOWN: u32 = 0x0000_07FF;
            if value & !CR4_KNOWN != 0 {
                return Err(Exception::gp0());
            }
            state.control.cr4 = value;
        }
        _ => return Err(Exception::InvalidOpcode),
    }
    bus.sync(state);
    Ok(Control::Advance)
}

pub(super) fn mov_dr(state: &mut CpuState, instr: &Instr) -> Result<Control, Exception> {
    if state.protected_mode() && state.cpl != 0 {
        return Err(Exception::gp0());
    }
    match instr.op {
        Op::MovFromDr => {
            let dr = match instr.src {
                Operand::Dr(n) => n,
                _ => return Err(Exception::InvalidOpcode),
            };
            if let Operand::Reg(r) = instr.dst {
                state.write_reg32(r, state.dr[dr as usize & 7]);
            }
        }
        _ => {
            let dr = match instr.dst {
                Operand::Dr(n) => n,
                _ => return Err(Exception::InvalidOpcode),
            };
            if let Operand::Reg(r) = instr.src {
                state.dr[dr as usize & 7] = state.read_reg32(r);
            }
        }
    }
    Ok(Control::Advance)
}

pub(super) fn rdtsc(state: &mut CpuState) -> Result<Control, Exception> {
    if state.control.cr4 & CR4_TSD != 0 && state.cpl != 0 {
        return Err(Exception::gp0());
    }
    let tsc = state.msr.tsc;
    state.write_reg32(0, tsc as u32);
    state.write_reg32(2, (tsc >> 32) as u32);
    Ok(Control::Advance)
}

pub(super) fn rdmsr(state: &mut CpuState) -> Result<Control, Exception> {
    if state.protected_mode() && state.cpl != 0 {
        return Err(Exception::gp0());
    }
    let index = state.read_reg32(1);
    let value: u64 = match index {
        0x10 => state.msr.tsc,
        0x1B => state.msr.apic_base,
        0x174 => state.msr.sysenter_cs as u64,
        0x175 => state.msr.sysenter_esp as u64,
        0x176 => state.msr.sysenter_eip as u64,
        0x250 => state.msr.mtrr_fixed[0],
        0x258 => state.msr.mtrr_fixed[1],
        0x259 => state.msr.mtrr_fixed[2],
        0x268..=0x26F => state.msr.mtrr_fixed[(index - 0x268 + 3) as usize],
        0x200..=0x20F => state.msr.mtrr_variable[(index - 0x200) as usize],
        0x2FF => state.msr.mtrr_deftype,
        0x277 => state.msr.pat,
        0xFE => 0x508, // MTRRcap: 8 variable, fixed supported
        _ => {
            tracing::debug!(target: "cpu", msr = format_args!("{index:#x}"), "RDMSR of unknown MSR");
            return Err(Exception::gp0());
        }
    };
    state.write_reg32(0, value as u32);
    state.write_reg32(2, (value >> 32) as u32);
    Ok(Control::Advance)
}

pub(super) fn wrmsr(state: &mut CpuState, bus: &mut dyn CpuBus) -> Result<Control, Exception> {
    if state.protected_mode() && state.cpl != 0 {
        return Err(Exception::gp0());
    }
    let index = state.read_reg32(1);
    let value = (state.read_reg32(2) as u64) << 32 | state.read_reg32(0) as u64;
    match index {
        0x10 => state.msr.tsc = value,
        0x1B => state.msr.apic_base = value,
        0x174 => state.msr.sysenter_cs = value as u32,
        0x175 => state.msr.sysenter_esp = value as u32,
        0x176 => state.msr.sysenter_eip = value as u32,
        0x250 => state.msr.mtrr_fixed[0] = value,
        0x258 => state.msr.mtrr_fixed[1] = value,
        0x259 => state.msr.mtrr_fixed[2] = value,
        0x268..=0x26F => state.msr.mtrr_fixed[(index - 0x268 + 3) as usize] = value,
        0x200..=0x20F => state.msr.mtrr_variable[(index - 0x200) as usize] = value,
        0x2FF => state.msr.mtrr_deftype = value,
        0x277 => state.msr.pat = value,
        _ => {
            tracing::debug!(target: "cpu", msr = format_args!("{index:#x}"), "WRMSR to unknown MSR");
            return Err(Exception::gp0());
        }
    }
    bus.sync(state);
    Ok(Control::Advance)
}

pub(super) fn sysenter(state: &mut CpuState, bus: &mut dyn CpuBus) -> Result<Control, Exception> {
    if !state.protected_mode() || state.msr.sysenter_cs & !3 == 0 {
        return Err(Exception::gp0());
    }
    let cs = (state.msr.sysenter_cs & !3) as u16;
    state.set_flag(Eflags::IF, false);
    state.set_flag(Eflags::VM, false);
    state.cpl = 0;
    // Flat ring-0 code and stack, by architectural definition.
    state.segments.cs = crate::state::Segment {
        selector: cs,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: 0x409B,
        valid: true,
    };
    state.segments.ss = crate::state::Segment {
        selector: cs + 8,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: 0x4093,
        valid: true,
    };
    state.update_mode();
    state.set_esp(state.msr.sysenter_esp);
    state.set_eip(state.msr.sysenter_eip);
    bus.sync(state);
    Ok(Control::Branch)
}

pub(super) fn sysexit(state: &mut CpuState) -> Result<Control, Exception> {
    if !state.protected_mode() || state.cpl != 0 || state.msr.sysenter_cs & !3 == 0 {
        return Err(Exception::gp0());
    }
    let cs = (state.msr.sysenter_cs as u16 & !3) + 16 | 3;
    state.segments.cs = crate::state::Segment {
        selector: cs,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: 0x40FB,
        valid: true,
    };
    state.segments.ss = crate::state::Segment {
        selector: cs + 8,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: 0x40F3,
        valid: true,
    };
    state.cpl = 3;
    state.update_mode();
    state.set_esp(state.read_reg32(1)); // ECX
    state.set_eip(state.read_reg32(2)); // EDX
    Ok(Control::Branch)
}

pub(super) fn arpl(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    if !state.protected_mode() || state.vm86() {
        return Err(Exception::InvalidOpcode);
    }
    let dst = read_operand_sized(state, bus, instr, instr.dst, OpSize::Word)? as u16;
    let src = read_operand_sized(state, bus, instr, instr.src, OpSize::Word)? as u16;
    if dst & 3 < src & 3 {
        let adjusted = dst & !3 | src & 3;
        write_operand_sized(state, bus, instr, instr.dst, OpSize::Word, adjusted as u32)?;
        state.set_flag(Eflags::ZF, true);
    } else {
        state.set_flag(Eflags::ZF, false);
    }
    Ok(Control::Advance)
}

pub(super) fn load_far(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    seg: SegReg,
) -> Result<Control, Exception> {
    let (selector, offset) = super::read_far_pointer(state, bus, instr)?;
    load_seg(state, bus, seg, selector)?;
    super::write_operand(state, bus, instr, instr.dst, offset)?;
    Ok(Control::Advance)
}

/// #NM gate for x87 use.
pub(super) fn fpu_usable(state: &CpuState) -> Result<(), Exception> {
    if state.control.cr0 & (CR0_EM | CR0_TS) != 0 {
        return Err(Exception::DeviceNotAvailable);
    }
    Ok(())
}
