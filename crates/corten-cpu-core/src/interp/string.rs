//! String instructions with REP/REPE/REPNE.
//!
//! Repeats run in bounded bursts: after a chunk of iterations the
//! instruction yields with EIP still pointing at itself, so pending
//! interrupts get a boundary and giant REP MOVS loops cannot starve the
//! platform. The counter register carries all the state needed to resume.

use super::Control;
use crate::decode::{Instr, Rep, StringOp};
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::seg::seg_linear;
use crate::state::{CpuState, Eflags, FlagOp, OpSize, SegReg};

/// Iterations executed before yielding back to the dispatcher.
const REP_BURST: u32 = 4096;

fn counter(state: &CpuState, addr32: bool) -> u32 {
    if addr32 {
        state.read_reg32(1)
    } else {
        state.read_reg32(1) & 0xFFFF
    }
}

fn set_counter(state: &mut CpuState, addr32: bool, value: u32) {
    if addr32 {
        state.write_reg32(1, value);
    } else {
        state.write_reg16(1, value as u16);
    }
}

fn index(state: &CpuState, reg: u8, addr32: bool) -> u32 {
    if addr32 {
        state.read_reg32(reg)
    } else {
        state.read_reg32(reg) & 0xFFFF
    }
}

fn advance_index(state: &mut CpuState, reg: u8, addr32: bool, delta: i32) {
    if addr32 {
        let v = state.read_reg32(reg).wrapping_add(delta as u32);
        state.write_reg32(reg, v);
    } else {
        let v = (state.read_reg16(reg)).wrapping_add(delta as u16);
        state.write_reg16(reg, v);
    }
}

pub(super) fn strings(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    op: StringOp,
) -> Result<Control, Exception> {
    let size = instr.size;
    let unit = size.bytes() as i32;
    let delta = if state.flag(Eflags::DF) { -unit } else { unit };
    let addr32 = instr.addr32;
    let user = state.user_access();

    if matches!(op, StringOp::Ins | StringOp::Outs) {
        super::system::check_io_permission(state)?;
    }

    let repeated = instr.rep != Rep::None;
    let mut remaining = if repeated {
        counter(state, addr32)
    } else {
        1
    };
    if repeated && remaining == 0 {
        return Ok(Control::Advance);
    }

    let mut executed = 0u32;
    while remaining > 0 && executed < REP_BURST {
        let src_off = index(state, 6, addr32);
        let dst_off = index(state, 7, addr32);

        let mut terminate = false;
        match op {
            StringOp::Movs => {
                let src = seg_linear(state, instr.seg, src_off, size.bytes(), false)?;
                let dst = seg_linear(state, SegReg::Es, dst_off, size.bytes(), true)?;
                let value = read_unit(bus, src, size, user)?;
                write_unit(bus, dst, size, value, user)?;
                advance_index(state, 6, addr32, delta);
                advance_index(state, 7, addr32, delta);
            }
            StringOp::Stos => {
                let dst = seg_linear(state, SegReg::Es, dst_off, size.bytes(), true)?;
                write_unit(bus, dst, size, state.read_reg(0, size), user)?;
                advance_index(state, 7, addr32, delta);
            }
            StringOp::Lods => {
                let src = seg_linear(state, instr.seg, src_off, size.bytes(), false)?;
                let value = read_unit(bus, src, size, user)?;
                state.write_reg(0, value, size);
                advance_index(state, 6, addr32, delta);
            }
            StringOp::Cmps => {
                let src = seg_linear(state, instr.seg, src_off, size.bytes(), false)?;
                let dst = seg_linear(state, SegReg::Es, dst_off, size.bytes(), false)?;
                let lhs = read_unit(bus, src, size, user)?;
                let rhs = read_unit(bus, dst, size, user)?;
                let result = lhs.wrapping_sub(rhs) & size.mask();
                super::set_lazy(state, FlagOp::Sub, size, lhs, rhs, result, 0);
                advance_index(state, 6, addr32, delta);
                advance_index(state, 7, addr32, delta);
                terminate = rep_terminates(state, instr.rep);
            }
            StringOp::Scas => {
                let dst = seg_linear(state, SegReg::Es, dst_off, size.bytes(), false)?;
                let rhs = read_unit(bus, dst, size, user)?;
                let lhs = state.read_reg(0, size);
                let result = lhs.wrapping_sub(rhs) & size.mask();
                super::set_lazy(state, FlagOp::Sub, size, lhs, rhs, result, 0);
                advance_index(state, 7, addr32, delta);
                terminate = rep_terminates(state, instr.rep);
            }
            StringOp::Ins => {
                let dst = seg_linear(state, SegReg::Es, dst_off, size.bytes(), true)?;
                let value = bus.io_read(state.read_reg16(2), size.bytes() as u8);
                write_unit(bus, dst, size, value, user)?;
                advance_index(state, 7, addr32, delta);
            }
            StringOp::Outs => {
                let src = seg_linear(state, instr.seg, src_off, size.bytes(), false)?;
                let value = read_unit(bus, src, size, user)?;
                bus.io_write(state.read_reg16(2), size.bytes() as u8, value);
                advance_index(state, 6, addr32, delta);
            }
        }

        executed += 1;
        if repeated {
            remaining -= 1;
            set_counter(state, addr32, remaining);
            if terminate {
                return Ok(Control::Advance);
            }
        } else {
            return Ok(Control::Advance);
        }
    }

    if remaining == 0 {
        Ok(Control::Advance)
    } else {
        // Yield mid-repeat: EIP still points at this instruction, so the
        // next dispatch resumes with the updated counter.
        Ok(Control::Branch)
    }
}

fn rep_terminates(state: &mut CpuState, rep: Rep) -> bool {
    match rep {
        Rep::Rep => !state.flag(Eflags::ZF),
        Rep::Repne => state.flag(Eflags::ZF),
        Rep::None => false,
    }
}

fn read_unit(
    bus: &mut dyn CpuBus,
    lin: u32,
    size: OpSize,
    user: bool,
) -> Result<u32, Exception> {
    Ok(match size {
        OpSize::Byte => bus.read_u8(lin, user)? as u32,
        OpSize::Word => bus.read_u16(lin, user)? as u32,
        OpSize::Dword => bus.read_u32(lin, user)?,
    })
}

fn write_unit(
    bus: &mut dyn CpuBus,
    lin: u32,
    size: OpSize,
    value: u32,
    user: bool,
) -> Result<(), Exception> {
    match size {
        OpSize::Byte => bus.write_u8(lin, value as u8, user),
        OpSize::Word => bus.write_u16(lin, value as u16, user),
        OpSize::Dword => bus.write_u32(lin, value, user),
    }
}
