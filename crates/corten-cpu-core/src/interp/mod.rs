//! The interpreter: executes one decoded [`Instr`] against CPU state and
//! the bus. Returns whether to advance sequentially, whether a branch
//! already redirected EIP, or whether the CPU halted.

mod alu;
mod ctrl;
mod fpu;
mod simd;
mod string;
mod system;

use crate::decode::{Instr, Op, Operand};
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuState, Eflags, FlagOp, LazyFlags, OpSize, SegReg};

pub use ctrl::deliver_interrupt;
pub use ctrl::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Fall through to the next instruction (EIP += len).
    Advance,
    /// The handler redirected EIP.
    Branch,
    /// HLT executed.
    Halt,
}

/// Effective-address offset for the instruction's memory operand.
pub(crate) fn effective_offset(state: &CpuState, instr: &Instr) -> u32 {
    let m = &instr.mem;
    let mut offset = m.disp;
    if let Some(base) = m.base {
        offset = offset.wrapping_add(state.read_reg32(base));
    }
    if let Some(index) = m.index {
        offset = offset.wrapping_add(state.read_reg32(index) << m.scale);
    }
    if instr.addr32 {
        offset
    } else {
        offset & 0xFFFF
    }
}

/// Linear address for the memory operand, after segmentation checks.
pub(crate) fn mem_linear(
    state: &CpuState,
    instr: &Instr,
    len: u32,
    write: bool,
) -> Result<u32, Exception> {
    let offset = effective_offset(state, instr);
    crate::seg::seg_linear(state, instr.seg, offset, len, write)
}

pub(crate) fn read_mem_sized(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    size: OpSize,
) -> Result<u32, Exception> {
    let lin = mem_linear(state, instr, size.bytes(), false)?;
    let user = state.user_access();
    Ok(match size {
        OpSize::Byte => bus.read_u8(lin, user)? as u32,
        OpSize::Word => bus.read_u16(lin, user)? as u32,
        OpSize::Dword => bus.read_u32(lin, user)?,
    })
}

pub(crate) fn write_mem_sized(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    size: OpSize,
    value: u32,
) -> Result<(), Exception> {
    let lin = mem_linear(state, instr, size.bytes(), true)?;
    let user = state.user_access();
    match size {
        OpSize::Byte => bus.write_u8(lin, value as u8, user),
        OpSize::Word => bus.write_u16(lin, value as u16, user),
        OpSize::Dword => bus.write_u32(lin, value, user),
    }
}

/// Reads any operand at the instruction's operand size.
pub(crate) fn read_operand(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    operand: Operand,
) -> Result<u32, Exception> {
    read_operand_sized(state, bus, instr, operand, instr.size)
}

pub(crate) fn read_operand_sized(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    operand: Operand,
    size: OpSize,
) -> Result<u32, Exception> {
    match operand {
        Operand::Reg(r) => Ok(state.read_reg(r, size)),
        Operand::Imm(v) => Ok(v & size.mask()),
        Operand::Mem => read_mem_sized(state, bus, instr, size),
        Operand::Seg(s) => Ok(state.segments.get(s).selector as u32),
        _ => Err(Exception::InvalidOpcode),
    }
}

pub(crate) fn write_operand(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    operand: Operand,
    value: u32,
) -> Result<(), Exception> {
    write_operand_sized(state, bus, instr, operand, instr.size, value)
}

pub(crate) fn write_operand_sized(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    operand: Operand,
    size: OpSize,
    value: u32,
) -> Result<(), Exception> {
    match operand {
        Operand::Reg(r) => {
            state.write_reg(r, value & size.mask(), size);
            Ok(())
        }
        Operand::Mem => write_mem_sized(state, bus, instr, size, value),
        _ => Err(Exception::InvalidOpcode),
    }
}

// -- stack ------------------------------------------------------------------

pub(crate) fn push(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    value: u32,
    size: OpSize,
) -> Result<(), Exception> {
    let mask = state.stack_mask();
    let esp = state.esp().wrapping_sub(size.bytes()) & mask | state.esp() & !mask;
    let lin = crate::seg::seg_linear(state, SegReg::Ss, esp & mask, size.bytes(), true)?;
    let user = state.user_access();
    match size {
        OpSize::Word => bus.write_u16(lin, value as u16, user)?,
        _ => bus.write_u32(lin, value, user)?,
    }
    state.set_esp(esp);
    Ok(())
}

pub(crate) fn pop(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    size: OpSize,
) -> Result<u32, Exception> {
    let mask = state.stack_mask();
    let esp = state.esp();
    let lin = crate::seg::seg_linear(state, SegReg::Ss, esp & mask, size.bytes(), false)?;
    let user = state.user_access();
    let value = match size {
        OpSize::Word => bus.read_u16(lin, user)? as u32,
        _ => bus.read_u32(lin, user)?,
    };
    state.set_esp(esp.wrapping_add(size.bytes()) & mask | esp & !mask);
    Ok(value)
}

// -- flags ------------------------------------------------------------------

pub(crate) fn set_lazy(
    state: &mut CpuState,
    op: FlagOp,
    size: OpSize,
    src1: u32,
    src2: u32,
    result: u32,
    carry_in: u32,
) {
    if matches!(op, FlagOp::Inc | FlagOp::Dec) {
        // CF survives; pin it into the image before going lazy.
        state.materialize_flags();
    }
    state.lazy = LazyFlags {
        op,
        size,
        src1,
        src2,
        result,
        carry_in,
    };
}

/// Condition-code predicate (the Jcc/SETcc/CMOVcc nibble).
pub(crate) fn condition(state: &mut CpuState, cc: u8) -> bool {
    let result = match cc >> 1 {
        0 => state.flag(Eflags::OF),
        1 => state.flag(Eflags::CF),
        2 => state.flag(Eflags::ZF),
        3 => state.flag(Eflags::CF) || state.flag(Eflags::ZF),
        4 => state.flag(Eflags::SF),
        5 => state.flag(Eflags::PF),
        6 => state.flag(Eflags::SF) != state.flag(Eflags::OF),
        _ => state.flag(Eflags::ZF) || state.flag(Eflags::SF) != state.flag(Eflags::OF),
    };
    result ^ (cc & 1 != 0)
}

/// Executes one instruction. `next_eip` is the sequential successor used
/// by call-style ops; on `Control::Advance` the caller commits it.
pub fn execute(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    next_eip: u32,
) -> Result<Control, Exception> {
    match instr.op {
        Op::Alu(op) => alu::alu(state, bus, instr, op),
        Op::Test => alu::test(state, bus, instr),
        Op::Not => alu::not(state, bus, instr),
        Op::Neg => alu::neg(state, bus, instr),
        Op::Inc => alu::incdec(state, bus, instr, true),
        Op::Dec => alu::incdec(state, bus, instr, false),
        Op::Mul => alu::mul(state, bus, instr),
        Op::Imul1 => alu::imul1(state, bus, instr),
        Op::Imul => alu::imul(state, bus, instr),
        Op::Div => alu::div(state, bus, instr),
        Op::Idiv => alu::idiv(state, bus, instr),
        Op::Shift(shift) => alu::shift(state, bus, instr, shift),
        Op::ShiftD { left } => alu::shiftd(state, bus, instr, left),
        Op::Bit(op) => alu::bit(state, bus, instr, op),
        Op::Bsf => alu::bit_scan(state, bus, instr, true),
        Op::Bsr => alu::bit_scan(state, bus, instr, false),
        Op::Daa => alu::daa(state, true),
        Op::Das => alu::daa(state, false),
        Op::Aaa => alu::aaa(state, true),
        Op::Aas => alu::aaa(state, false),
        Op::Aam(base) => alu::aam(state, base),
        Op::Aad(base) => alu::aad(state, base),

        Op::Mov => {
            let value = read_operand(state, bus, instr, instr.src)?;
            write_operand(state, bus, instr, instr.dst, value)?;
            Ok(Control::Advance)
        }
        Op::MovSeg => system::mov_seg(state, bus, instr),
        Op::Lea => {
            let offset = effective_offset(state, instr);
            write_operand(state, bus, instr, instr.dst, offset & instr.size.mask())?;
            Ok(Control::Advance)
        }
        Op::Xchg => {
            let a = read_operand(state, bus, instr, instr.dst)?;
            let b = read_operand(state, bus, instr, instr.src)?;
            write_operand(state, bus, instr, instr.dst, b)?;
            write_operand(state, bus, instr, instr.src, a)?;
            Ok(Control::Advance)
        }
        Op::Movzx | Op::Movsx => {
            let src_bits = match instr.src2 {
                Operand::Imm(b) => b,
                _ => 8,
            };
            let src_size = if src_bits == 8 {
                OpSize::Byte
            } else {
                OpSize::Word
            };
            let raw = read_operand_sized(state, bus, instr, instr.src, src_size)?;
            let value = if matches!(instr.op, Op::Movsx) {
                if src_size == OpSize::Byte {
                    raw as u8 as i8 as i32 as u32
                } else {
                    raw as u16 as i16 as i32 as u32
                }
            } else {
                raw
            };
            write_operand(state, bus, instr, instr.dst, value & instr.size.mask())?;
            Ok(Control::Advance)
        }
        Op::Xlat => {
            let base = if instr.addr32 {
                state.read_reg32(3)
            } else {
                state.read_reg32(3) & 0xFFFF
            };
            let offset = base.wrapping_add(state.read_reg8(0) as u32);
            let offset = if instr.addr32 { offset } else { offset & 0xFFFF };
            let lin = crate::seg::seg_linear(state, instr.seg, offset, 1, false)?;
            let user = state.user_access();
            let value = bus.read_u8(lin, user)?;
            state.write_reg8(0, value);
            Ok(Control::Advance)
        }
        Op::Bswap => {
            let r = match instr.dst {
                Operand::Reg(r) => r,
                _ => return Err(Exception::InvalidOpcode),
            };
            state.write_reg32(r, state.read_reg32(r).swap_bytes());
            Ok(Control::Advance)
        }
        Op::Xadd => alu::xadd(state, bus, instr),
        Op::Cmpxchg => alu::cmpxchg(state, bus, instr),
        Op::Cmpxchg8b => alu::cmpxchg8b(state, bus, instr),
        Op::Lahf => {
            let flags = state.eflags() as u8;
            state.write_reg8(4, flags | 0x02);
            Ok(Control::Advance)
        }
        Op::Sahf => {
            let ah = state.read_reg8(4) as u32;
            state.set_eflags_masked(ah, 0xD5);
            Ok(Control::Advance)
        }
        Op::Cbw => {
            if instr.size == OpSize::Word {
                let al = state.read_reg8(0) as i8 as i16;
                state.write_reg16(0, al as u16);
            } else {
                let ax = state.read_reg16(0) as i16 as i32;
                state.write_reg32(0, ax as u32);
            }
            Ok(Control::Advance)
        }
        Op::Cwd => {
            if instr.size == OpSize::Word {
                let sign = if state.read_reg16(0) & 0x8000 != 0 { 0xFFFF } else { 0 };
                state.write_reg16(2, sign);
            } else {
                let sign = if state.read_reg32(0) & 0x8000_0000 != 0 {
                    0xFFFF_FFFF
                } else {
                    0
                };
                state.write_reg32(2, sign);
            }
            Ok(Control::Advance)
        }
        Op::Salc => {
            let value = if state.flag(Eflags::CF) { 0xFF } else { 0 };
            state.write_reg8(0, value);
            Ok(Control::Advance)
        }
        Op::Setcc(cc) => {
            let value = condition(state, cc) as u32;
            write_operand_sized(state, bus, instr, instr.dst, OpSize::Byte, value)?;
            Ok(Control::Advance)
        }
        Op::Cmovcc(cc) => {
            let value = read_operand(state, bus, instr, instr.src)?;
            if condition(state, cc) {
                write_operand(state, bus, instr, instr.dst, value)?;
            }
            Ok(Control::Advance)
        }

        Op::Push => {
            let value = read_operand(state, bus, instr, instr.src)?;
            push(state, bus, value, instr.size)?;
            Ok(Control::Advance)
        }
        Op::Pop => system::pop_rm(state, bus, instr),
        Op::PushSeg(seg) => {
            let value = state.segments.get(seg).selector as u32;
            push(state, bus, value, instr.size)?;
            Ok(Control::Advance)
        }
        Op::PopSeg(seg) => {
            let value = pop(state, bus, instr.size)?;
            crate::seg::load_seg(state, bus, seg, value as u16)?;
            if seg == SegReg::Ss {
                state.interrupt_shadow = true;
            }
            Ok(Control::Advance)
        }
        Op::Pusha => {
            let esp = state.esp();
            let regs = [
                state.read_reg32(0),
                state.read_reg32(1),
                state.read_reg32(2),
                state.read_reg32(3),
                esp,
                state.read_reg32(5),
                state.read_reg32(6),
                state.read_reg32(7),
            ];
            for value in regs {
                push(state, bus, value & instr.size.mask(), instr.size)?;
            }
            Ok(Control::Advance)
        }
        Op::Popa => {
            for reg in [7u8, 6, 5, 4, 3, 2, 1, 0] {
                let value = pop(state, bus, instr.size)?;
                if reg != 4 {
                    state.write_reg(reg, value, instr.size);
                }
            }
            Ok(Control::Advance)
        }
        Op::Pushf => system::pushf(state, bus, instr),
        Op::Popf => system::popf(state, bus, instr),
        Op::Enter => {
            let (alloc, nesting) = match (instr.src, instr.src2) {
                (Operand::Imm(a), Operand::Imm(n)) => (a as u16, (n & 0x1F) as u8),
                _ => return Err(Exception::InvalidOpcode),
            };
            let old_ebp = state.read_reg32(5) & instr.size.mask();
            push(state, bus, old_ebp, instr.size)?;
            let frame = state.esp();
            if nesting > 0 {
                for level in 1..nesting {
                    let mask = state.stack_mask();
                    let ebp = state
                        .read_reg32(5)
                        .wrapping_sub((level as u32) * instr.size.bytes());
                    let lin = crate::seg::seg_linear(
                        state,
                        SegReg::Ss,
                        ebp & mask,
                        instr.size.bytes(),
                        false,
                    )?;
                    let user = state.user_access();
                    let value = match instr.size {
                        OpSize::Word => bus.read_u16(lin, user)? as u32,
                        _ => bus.read_u32(lin, user)?,
                    };
                    push(state, bus, value, instr.size)?;
                }
                push(state, bus, frame & instr.size.mask(), instr.size)?;
            }
            if instr.size == OpSize::Word {
                state.write_reg16(5, frame as u16);
            } else {
                state.write_reg32(5, frame);
            }
            state.set_esp(state.esp().wrapping_sub(alloc as u32) & state.stack_mask()
                | state.esp() & !state.stack_mask());
            Ok(Control::Advance)
        }
        Op::Leave => {
            let mask = state.stack_mask();
            let ebp = state.read_reg32(5);
            state.set_esp(ebp & mask | state.esp() & !mask);
            let value = pop(state, bus, instr.size)?;
            if instr.size == OpSize::Word {
                state.write_reg16(5, value as u16);
            } else {
                state.write_reg32(5, value);
            }
            Ok(Control::Advance)
        }

        Op::Strings(op) => string::strings(state, bus, instr, op),

        Op::Jmp
        | Op::JmpFar
        | Op::JmpFarInd
        | Op::Jcc(_)
        | Op::Jcxz
        | Op::Loop
        | Op::Loope
        | Op::Loopne
        | Op::Call
        | Op::CallFar
        | Op::CallFarInd
        | Op::Ret { .. }
        | Op::RetFar { .. }
        | Op::Iret
        | Op::Int(_)
        | Op::Int3
        | Op::Into
        | Op::Bound => ctrl::control_flow(state, bus, instr, next_eip),

        Op::Arpl => system::arpl(state, bus, instr),
        Op::Clc => {
            state.set_flag(Eflags::CF, false);
            Ok(Control::Advance)
        }
        Op::Stc => {
            state.set_flag(Eflags::CF, true);
            Ok(Control::Advance)
        }
        Op::Cmc => {
            let cf = state.flag(Eflags::CF);
            state.set_flag(Eflags::CF, !cf);
            Ok(Control::Advance)
        }
        Op::Cld => {
            state.set_flag(Eflags::DF, false);
            Ok(Control::Advance)
        }
        Op::Std => {
            state.set_flag(Eflags::DF, true);
            Ok(Control::Advance)
        }
        Op::Cli => system::cli(state),
        Op::Sti => system::sti(state),
        Op::In | Op::Out => system::port_io(state, bus, instr),
        Op::Hlt => system::hlt(state),
        Op::Lgdt | Op::Lidt | Op::Sgdt | Op::Sidt => system::dtable(state, bus, instr),
        Op::Lldt => system::lldt(state, bus, instr),
        Op::Sldt => {
            let value = state.tables.ldtr.selector as u32;
            write_operand_sized(state, bus, instr, instr.dst, OpSize::Word, value)?;
            Ok(Control::Advance)
        }
        Op::Ltr => system::ltr(state, bus, instr),
        Op::Str => {
            let value = state.tables.tr.selector as u32;
            write_operand_sized(state, bus, instr, instr.dst, OpSize::Word, value)?;
            Ok(Control::Advance)
        }
        Op::Lmsw => system::lmsw(state, bus, instr),
        Op::Smsw => {
            let value = state.control.cr0 & 0xFFFF;
            write_operand_sized(state, bus, instr, instr.dst, OpSize::Word, value)?;
            Ok(Control::Advance)
        }
        Op::Lar => system::lar_lsl(state, bus, instr, true),
        Op::Lsl => system::lar_lsl(state, bus, instr, false),
        Op::Verr => system::verr_verw(state, bus, instr, false),
        Op::Verw => system::verr_verw(state, bus, instr, true),
        Op::Clts => {
            if state.cpl != 0 {
                return Err(Exception::gp0());
            }
            state.control.cr0 &= !crate::state::CR0_TS;
            Ok(Control::Advance)
        }
        Op::Invd | Op::Wbinvd => {
            if state.cpl != 0 {
                return Err(Exception::gp0());
            }
            Ok(Control::Advance)
        }
        Op::Invlpg => system::invlpg(state, bus, instr),
        Op::MovToCr | Op::MovFromCr => system::mov_cr(state, bus, instr),
        Op::MovToDr | Op::MovFromDr => system::mov_dr(state, instr),
        Op::Cpuid => {
            crate::cpuid::cpuid(state);
            Ok(Control::Advance)
        }
        Op::Rdtsc => system::rdtsc(state),
        Op::Rdmsr => system::rdmsr(state),
        Op::Wrmsr => system::wrmsr(state, bus),
        Op::Sysenter => system::sysenter(state, bus),
        Op::Sysexit => system::sysexit(state),
        Op::Nop | Op::Prefetch => Ok(Control::Advance),
        Op::Ud2 => Err(Exception::InvalidOpcode),
        Op::Wait => fpu::wait(state),
        Op::LoadFar(seg) => system::load_far(state, bus, instr, seg),
        Op::Fpu { esc, modrm } => fpu::escape(state, bus, instr, esc, modrm),
        Op::Emms => fpu::emms(state),
        Op::Ldmxcsr | Op::Stmxcsr | Op::Fxsave | Op::Fxrstor => {
            simd::sse_control(state, bus, instr)
        }
        Op::SimdMov { width } => simd::simd_mov(state, bus, instr, width),
        Op::PackedInt { op, lanes } => simd::packed_int(state, bus, instr, op, lanes),
        Op::SseArith { op, scalar, double } => {
            simd::sse_arith(state, bus, instr, op, scalar, double)
        }
    }
}

/// Memory operand reference for INT-style helpers needing a raw far
/// pointer (m16:16 / m16:32).
pub(crate) fn read_far_pointer(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<(u16, u32), Exception> {
    let bytes = instr.size.bytes() + 2;
    let lin = mem_linear(state, instr, bytes, false)?;
    let user = state.user_access();
    let offset = match instr.size {
        OpSize::Word => bus.read_u16(lin, user)? as u32,
        _ => bus.read_u32(lin, user)?,
    };
    let selector = bus.read_u16(lin.wrapping_add(instr.size.bytes()), user)?;
    Ok((selector, offset))
}

