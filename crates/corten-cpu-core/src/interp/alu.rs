//! Integer ALU: arithmetic, logic, shifts, multiply/divide, bit ops and
//! the BCD adjusts. Flag-bearing results go through the lazy-flags record;
//! shifts and the exotic ops materialize directly.

use super::{read_operand, read_operand_sized, set_lazy, write_operand, Control};
use crate::decode::{Alu, BitOp, Instr, Operand, Shift};
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuState, Eflags, FlagOp, OpSize};

pub(super) fn alu(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    op: Alu,
) -> Result<Control, Exception> {
    let size = instr.size;
    let mask = size.mask();
    let dst = read_operand(state, bus, instr, instr.dst)?;
    let src = read_operand(state, bus, instr, instr.src)?;
    let carry = state.flag(Eflags::CF) as u32;

    let (result, flag_op, carry_in) = match op {
        Alu::Add => (dst.wrapping_add(src), FlagOp::Add, 0),
        Alu::Adc => (dst.wrapping_add(src).wrapping_add(carry), FlagOp::Adc, carry),
        Alu::Sub | Alu::Cmp => (dst.wrapping_sub(src), FlagOp::Sub, 0),
        Alu::Sbb => (dst.wrapping_sub(src).wrapping_sub(carry), FlagOp::Sbb, carry),
        Alu::And => (dst & src, FlagOp::Logic, 0),
        Alu::Or => (dst | src, FlagOp::Logic, 0),
        Alu::Xor => (dst ^ src, FlagOp::Logic, 0),
    };
    let result = result & mask;
    if op != Alu::Cmp {
        write_operand(state, bus, instr, instr.dst, result)?;
    }
    set_lazy(state, flag_op, size, dst, src, result, carry_in);
    Ok(Control::Advance)
}

pub(super) fn test(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let dst = read_operand(state, bus, instr, instr.dst)?;
    let src = read_operand(state, bus, instr, instr.src)?;
    let result = dst & src & instr.size.mask();
    set_lazy(state, FlagOp::Logic, instr.size, dst, src, result, 0);
    Ok(Control::Advance)
}

pub(super) fn not(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let dst = read_operand(state, bus, instr, instr.dst)?;
    write_operand(state, bus, instr, instr.dst, !dst & instr.size.mask())?;
    Ok(Control::Advance)
}

pub(super) fn neg(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let dst = read_operand(state, bus, instr, instr.dst)?;
    let result = 0u32.wrapping_sub(dst) & instr.size.mask();
    write_operand(state, bus, instr, instr.dst, result)?;
    set_lazy(state, FlagOp::Sub, instr.size, 0, dst, result, 0);
    Ok(Control::Advance)
}

pub(super) fn incdec(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    inc: bool,
) -> Result<Control, Exception> {
    let dst = read_operand(state, bus, instr, instr.dst)?;
    let result = if inc {
        dst.wrapping_add(1)
    } else {
        dst.wrapping_sub(1)
    } & instr.size.mask();
    write_operand(state, bus, instr, instr.dst, result)?;
    let op = if inc { FlagOp::Inc } else { FlagOp::Dec };
    set_lazy(state, op, instr.size, dst, 1, result, 0);
    Ok(Control::Advance)
}

pub(super) fn mul(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let src = read_operand(state, bus, instr, instr.dst)?;
    let overflow = match instr.size {
        OpSize::Byte => {
            let result = state.read_reg8(0) as u32 * src;
            state.write_reg16(0, result as u16);
            result > 0xFF
        }
        OpSize::Word => {
            let result = state.read_reg16(0) as u32 * src;
            state.write_reg16(0, result as u16);
            state.write_reg16(2, (result >> 16) as u16);
            result > 0xFFFF
        }
        OpSize::Dword => {
            let result = state.read_reg32(0) as u64 * src as u64;
            state.write_reg32(0, result as u32);
            state.write_reg32(2, (result >> 32) as u32);
            result > 0xFFFF_FFFF
        }
    };
    state.set_flag(Eflags::CF, overflow);
    state.set_flag(Eflags::OF, overflow);
    Ok(Control::Advance)
}

pub(super) fn imul1(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let src = read_operand(state, bus, instr, instr.dst)?;
    let overflow = match instr.size {
        OpSize::Byte => {
            let result = state.read_reg8(0) as i8 as i32 * src as u8 as i8 as i32;
            state.write_reg16(0, result as u16);
            result != result as i8 as i32
        }
        OpSize::Word => {
            let result = state.read_reg16(0) as i16 as i32 * src as u16 as i16 as i32;
            state.write_reg16(0, result as u16);
            state.write_reg16(2, (result >> 16) as u16);
            result != result as i16 as i32
        }
        OpSize::Dword => {
            let result = state.read_reg32(0) as i32 as i64 * src as i32 as i64;
            state.write_reg32(0, result as u32);
            state.write_reg32(2, (result >> 32) as u32);
            result != result as i32 as i64
        }
    };
    state.set_flag(Eflags::CF, overflow);
    state.set_flag(Eflags::OF, overflow);
    Ok(Control::Advance)
}

/// Two- and three-operand IMUL.
pub(super) fn imul(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let lhs = read_operand(state, bus, instr, instr.src)?;
    let rhs = match instr.src2 {
        Operand::Imm(v) => v & instr.size.mask(),
        Operand::Reg(r) => state.read_reg(r, instr.size),
        _ => return Err(Exception::InvalidOpcode),
    };
    let (result, overflow) = match instr.size {
        OpSize::Word => {
            let r = lhs as u16 as i16 as i32 * rhs as u16 as i16 as i32;
            (r as u32 & 0xFFFF, r != r as i16 as i32)
        }
        _ => {
            let r = lhs as i32 as i64 * rhs as i32 as i64;
            (r as u32, r != r as i32 as i64)
        }
    };
    write_operand(state, bus, instr, instr.dst, result)?;
    state.set_flag(Eflags::CF, overflow);
    state.set_flag(Eflags::OF, overflow);
    Ok(Control::Advance)
}

pub(super) fn div(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let divisor = read_operand(state, bus, instr, instr.dst)?;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    match instr.size {
        OpSize::Byte => {
            let dividend = state.read_reg16(0) as u32;
            let q = dividend / divisor;
            if q > 0xFF {
                return Err(Exception::DivideError);
            }
            state.write_reg8(0, q as u8);
            state.write_reg8(4, (dividend % divisor) as u8);
        }
        OpSize::Word => {
            let dividend = (state.read_reg16(2) as u32) << 16 | state.read_reg16(0) as u32;
            let q = dividend / divisor;
            if q > 0xFFFF {
                return Err(Exception::DivideError);
            }
            state.write_reg16(0, q as u16);
            state.write_reg16(2, (dividend % divisor) as u16);
        }
        OpSize::Dword => {
            let dividend = (state.read_reg32(2) as u64) << 32 | state.read_reg32(0) as u64;
            let q = dividend / divisor as u64;
            if q > 0xFFFF_FFFF {
                return Err(Exception::DivideError);
            }
            state.write_reg32(0, q as u32);
            state.write_reg32(2, (dividend % divisor as u64) as u32);
        }
    }
    Ok(Control::Advance)
}

pub(super) fn idiv(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let divisor_raw = read_operand(state, bus, instr, instr.dst)?;
    match instr.size {
        OpSize::Byte => {
            let divisor = divisor_raw as u8 as i8 as i32;
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend = state.read_reg16(0) as i16 as i32;
            let q = dividend / divisor;
            if q > 127 || q < -128 {
                return Err(Exception::DivideError);
            }
            state.write_reg8(0, q as u8);
            state.write_reg8(4, (dividend % divisor) as u8);
        }
        OpSize::Word => {
            let divisor = divisor_raw as u16 as i16 as i32;
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend =
                ((state.read_reg16(2) as u32) << 16 | state.read_reg16(0) as u32) as i32;
            let q = dividend / divisor;
            if q > 32767 || q < -32768 {
                return Err(Exception::DivideError);
            }
            state.write_reg16(0, q as u16);
            state.write_reg16(2, (dividend % divisor) as u16);
        }
        OpSize::Dword => {
            let divisor = divisor_raw as i32 as i64;
            if divisor == 0 {
                return Err(Exception::DivideError);
            }
            let dividend =
                ((state.read_reg32(2) as u64) << 32 | state.read_reg32(0) as u64) as i64;
            let q = dividend / divisor;
            if q > i32::MAX as i64 || q < i32::MIN as i64 {
                return Err(Exception::DivideError);
            }
            state.write_reg32(0, q as u32);
            state.write_reg32(2, (dividend % divisor) as u32);
        }
    }
    Ok(Control::Advance)
}

pub(super) fn shift(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    op: Shift,
) -> Result<Control, Exception> {
    let size = instr.size;
    let bits = size.bits();
    let mask = size.mask();
    let value = read_operand(state, bus, instr, instr.dst)?;
    let count_raw = read_operand_sized(state, bus, instr, instr.src, OpSize::Byte)?;
    let count = count_raw & 0x1F;
    if count == 0 {
        // Rotates through carry still need the masked-count semantics;
        // with zero count nothing changes, flags included.
        return Ok(Control::Advance);
    }

    let mut cf = state.flag(Eflags::CF);
    let mut of = state.flag(Eflags::OF);
    let result = match op {
        Shift::Shl | Shift::Sal => {
            let r = if count >= bits { 0 } else { value << count } & mask;
            cf = if count <= bits {
                value >> (bits - count) & 1 != 0
            } else {
                false
            };
            of = (r & size.sign_bit() != 0) != cf;
            r
        }
        Shift::Shr => {
            let r = if count >= bits { 0 } else { value >> count };
            cf = if count <= bits {
                value >> (count - 1) & 1 != 0
            } else {
                false
            };
            of = value & size.sign_bit() != 0;
            r
        }
        Shift::Sar => {
            let signed = match size {
                OpSize::Byte => value as u8 as i8 as i32,
                OpSize::Word => value as u16 as i16 as i32,
                OpSize::Dword => value as i32,
            };
            let r = (signed >> count) as u32 & mask;
            cf = (signed >> (count - 1)) & 1 != 0;
            of = false;
            r
        }
        Shift::Rol => {
            let c = count % bits;
            let r = if c == 0 {
                value
            } else {
                (value << c | value >> (bits - c)) & mask
            };
            cf = r & 1 != 0;
            of = (r & size.sign_bit() != 0) != cf;
            r
        }
        Shift::Ror => {
            let c = count % bits;
            let r = if c == 0 {
                value
            } else {
                (value >> c | value << (bits - c)) & mask
            };
            cf = r & size.sign_bit() != 0;
            of = ((r ^ r << 1) & size.sign_bit()) != 0;
            r
        }
        Shift::Rcl => {
            let c = count % (bits + 1);
            let wide = (value as u64) | (cf as u64) << bits;
            let r = if c == 0 {
                wide
            } else {
                (wide << c | wide >> (bits + 1 - c)) & ((1u64 << (bits + 1)) - 1)
            };
            cf = r >> bits & 1 != 0;
            let out = (r as u32) & mask;
            of = (out & size.sign_bit() != 0) != cf;
            out
        }
        Shift::Rcr => {
            let c = count % (bits + 1);
            let wide = (value as u64) | (cf as u64) << bits;
            let r = if c == 0 {
                wide
            } else {
                (wide >> c | wide << (bits + 1 - c)) & ((1u64 << (bits + 1)) - 1)
            };
            cf = r >> bits & 1 != 0;
            let out = (r as u32) & mask;
            of = ((out ^ out << 1) & size.sign_bit()) != 0;
            out
        }
    };

    write_operand(state, bus, instr, instr.dst, result)?;
    if matches!(op, Shift::Shl | Shift::Sal | Shift::Shr | Shift::Sar) {
        // SF/ZF/PF from the result, CF/OF as computed above.
        set_lazy(state, FlagOp::Logic, size, result, result, result, 0);
        state.materialize_flags();
    }
    state.set_flag(Eflags::CF, cf);
    state.set_flag(Eflags::OF, of);
    Ok(Control::Advance)
}

pub(super) fn shiftd(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    left: bool,
) -> Result<Control, Exception> {
    let size = instr.size;
    let bits = size.bits();
    let mask = size.mask();
    let dst = read_operand(state, bus, instr, instr.dst)?;
    let src = read_operand(state, bus, instr, instr.src)?;
    let count = match instr.src2 {
        Operand::Imm(v) => v,
        Operand::Reg(r) => state.read_reg8(r) as u32,
        _ => return Err(Exception::InvalidOpcode),
    } & 0x1F;
    if count == 0 {
        return Ok(Control::Advance);
    }
    if count >= bits {
        // Undefined for 16-bit; produce the natural wide-shift result.
        let r = if left { src << (count - bits) } else { src >> (count - bits) } & mask;
        write_operand(state, bus, instr, instr.dst, r)?;
        return Ok(Control::Advance);
    }
    let (result, cf) = if left {
        let wide = (dst as u64) << bits | src as u64;
        let r = (wide << count >> bits) as u32 & mask;
        (r, dst >> (bits - count) & 1 != 0)
    } else {
        let wide = (src as u64) << bits | dst as u64;
        let r = (wide >> count) as u32 & mask;
        (r, dst >> (count - 1) & 1 != 0)
    };
    write_operand(state, bus, instr, instr.dst, result)?;
    set_lazy(state, FlagOp::Logic, size, result, result, result, 0);
    state.materialize_flags();
    state.set_flag(Eflags::CF, cf);
    state.set_flag(Eflags::OF, (result ^ dst) & size.sign_bit() != 0);
    Ok(Control::Advance)
}

pub(super) fn bit(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    op: BitOp,
) -> Result<Control, Exception> {
    let size = instr.size;
    let bits = size.bits();
    let offset_raw = match instr.src {
        Operand::Reg(r) => state.read_reg(r, size),
        Operand::Imm(v) => v,
        _ => return Err(Exception::InvalidOpcode),
    };

    let (value, commit): (u32, Option<(Operand, bool)>) = match instr.dst {
        Operand::Reg(_) => {
            let v = read_operand(state, bus, instr, instr.dst)?;
            (v, Some((instr.dst, false)))
        }
        Operand::Mem => {
            // Memory forms address the bit string: the effective address
            // moves by whole operand units for register offsets.
            let signed = offset_raw as i32;
            let unit = bits as i32;
            let element = if matches!(instr.src, Operand::Imm(_)) {
                0
            } else {
                signed.div_euclid(unit)
            };
            let byte_offset = element * (bits as i32 / 8);
            let mut adjusted = *instr;
            adjusted.mem.disp = instr.mem.disp.wrapping_add(byte_offset as u32);
            let v = super::read_mem_sized(state, bus, &adjusted, size)?;
            (v, Some((Operand::Mem, true)))
        }
        _ => return Err(Exception::InvalidOpcode),
    };

    let bit_index = offset_raw as u32 % bits;
    let mask_bit = 1u32 << bit_index;
    let carried = value & mask_bit != 0;
    let new_value = match op {
        BitOp::Bt => value,
        BitOp::Bts => value | mask_bit,
        BitOp::Btr => value & !mask_bit,
        BitOp::Btc => value ^ mask_bit,
    };
    if op != BitOp::Bt {
        match commit {
            Some((Operand::Mem, true)) => {
                let signed = offset_raw as i32;
                let element = if matches!(instr.src, Operand::Imm(_)) {
                    0
                } else {
                    signed.div_euclid(bits as i32)
                };
                let byte_offset = element * (bits as i32 / 8);
                let mut adjusted = *instr;
                adjusted.mem.disp = instr.mem.disp.wrapping_add(byte_offset as u32);
                super::write_mem_sized(state, bus, &adjusted, size, new_value)?;
            }
            _ => write_operand(state, bus, instr, instr.dst, new_value)?,
        }
    }
    state.set_flag(Eflags::CF, carried);
    Ok(Control::Advance)
}

pub(super) fn bit_scan(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    forward: bool,
) -> Result<Control, Exception> {
    let value = read_operand(state, bus, instr, instr.src)?;
    if value == 0 {
        state.set_flag(Eflags::ZF, true);
        return Ok(Control::Advance);
    }
    let index = if forward {
        value.trailing_zeros()
    } else {
        31 - value.leading_zeros()
    };
    write_operand(state, bus, instr, instr.dst, index)?;
    state.set_flag(Eflags::ZF, false);
    Ok(Control::Advance)
}

pub(super) fn xadd(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let dst = read_operand(state, bus, instr, instr.dst)?;
    let src = read_operand(state, bus, instr, instr.src)?;
    let sum = dst.wrapping_add(src) & instr.size.mask();
    write_operand(state, bus, instr, instr.src, dst)?;
    write_operand(state, bus, instr, instr.dst, sum)?;
    set_lazy(state, FlagOp::Add, instr.size, dst, src, sum, 0);
    Ok(Control::Advance)
}

pub(super) fn cmpxchg(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let dst = read_operand(state, bus, instr, instr.dst)?;
    let acc = state.read_reg(0, instr.size);
    let result = acc.wrapping_sub(dst) & instr.size.mask();
    set_lazy(state, FlagOp::Sub, instr.size, acc, dst, result, 0);
    if acc == dst {
        let src = read_operand(state, bus, instr, instr.src)?;
        write_operand(state, bus, instr, instr.dst, src)?;
    } else {
        state.write_reg(0, dst, instr.size);
        // The destination is written back unchanged (locked semantics).
        write_operand(state, bus, instr, instr.dst, dst)?;
    }
    Ok(Control::Advance)
}

pub(super) fn cmpxchg8b(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let lin = super::mem_linear(state, instr, 8, true)?;
    let user = state.user_access();
    let current = bus.read_u64(lin, user)?;
    let expected = (state.read_reg32(2) as u64) << 32 | state.read_reg32(0) as u64;
    if current == expected {
        let replacement = (state.read_reg32(1) as u64) << 32 | state.read_reg32(3) as u64;
        bus.write_u64(lin, replacement, user)?;
        state.set_flag(Eflags::ZF, true);
    } else {
        state.write_reg32(0, current as u32);
        state.write_reg32(2, (current >> 32) as u32);
        state.set_flag(Eflags::ZF, false);
    }
    Ok(Control::Advance)
}

pub(super) fn daa(state: &mut CpuState, add: bool) -> Result<Control, Exception> {
    let mut al = state.read_reg8(0);
    let old_al = al;
    let mut cf = state.flag(Eflags::CF);
    let af = state.flag(Eflags::AF);
    let old_cf = cf;
    cf = false;
    if al & 0x0F > 9 || af {
        let adjusted = if add {
            al.wrapping_add(6)
        } else {
            al.wrapping_sub(6)
        };
        cf = old_cf || (add && adjusted < al) || (!add && al < 6);
        al = adjusted;
        state.set_flag(Eflags::AF, true);
    } else {
        state.set_flag(Eflags::AF, false);
    }
    if old_al > 0x99 || old_cf {
        al = if add {
            al.wrapping_add(0x60)
        } else {
            al.wrapping_sub(0x60)
        };
        cf = true;
    }
    state.write_reg8(0, al);
    state.set_flag(Eflags::CF, cf);
    state.set_flag(Eflags::ZF, al == 0);
    state.set_flag(Eflags::SF, al & 0x80 != 0);
    state.set_flag(Eflags::PF, al.count_ones() % 2 == 0);
    Ok(Control::Advance)
}

pub(super) fn aaa(state: &mut CpuState, add: bool) -> Result<Control, Exception> {
    let al = state.read_reg8(0);
    let af = state.flag(Eflags::AF);
    if al & 0x0F > 9 || af {
        if add {
            state.write_reg16(0, state.read_reg16(0).wrapping_add(0x106));
        } else {
            let ax = state.read_reg16(0).wrapping_sub(6);
            state.write_reg16(0, ax);
            state.write_reg8(4, state.read_reg8(4).wrapping_sub(1));
        }
        state.set_flag(Eflags::AF, true);
        state.set_flag(Eflags::CF, true);
    } else {
        state.set_flag(Eflags::AF, false);
        state.set_flag(Eflags::CF, false);
    }
    let al = state.read_reg8(0) & 0x0F;
    state.write_reg8(0, al);
    Ok(Control::Advance)
}

pub(super) fn aam(state: &mut CpuState, base: u8) -> Result<Control, Exception> {
    if base == 0 {
        return Err(Exception::DivideError);
    }
    let al = state.read_reg8(0);
    state.write_reg8(4, al / base);
    let al = al % base;
    state.write_reg8(0, al);
    set_lazy(
        state,
        FlagOp::Logic,
        OpSize::Byte,
        al as u32,
        al as u32,
        al as u32,
        0,
    );
    Ok(Control::Advance)
}

pub(super) fn aad(state: &mut CpuState, base: u8) -> Result<Control, Exception> {
    let al = state
        .read_reg8(0)
        .wrapping_add(state.read_reg8(4).wrapping_mul(base));
    state.write_reg8(0, al);
    state.write_reg8(4, 0);
    set_lazy(
        state,
        FlagOp::Logic,
        OpSize::Byte,
        al as u32,
        al as u32,
        al as u32,
        0,
    );
    Ok(Control::Advance)
}
