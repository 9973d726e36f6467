//! x87 state machine. Register-stack management, tags, control/status
//! words and the escape-opcode dispatch live here; the arithmetic itself
//! goes through the softfloat facade.

use super::{mem_linear, Control};
use crate::decode::Instr;
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::softfloat::{
    f64_add, f64_compare, f64_div, f64_mul, f64_round, f64_sqrt, f64_sub, f64_to_i32,
    f64_to_i64, f80_from_f64, f80_to_f64, Float80, FpCompare, FpStatus, Rounding,
};
use crate::state::{CpuState, Eflags};

const SW_IE: u16 = 1 << 0;
const SW_ZE: u16 = 1 << 2;
const SW_C0: u16 = 1 << 8;
const SW_C1: u16 = 1 << 9;
const SW_C2: u16 = 1 << 10;
const SW_C3: u16 = 1 << 14;

const TAG_VALID: u8 = 0;
const TAG_ZERO: u8 = 1;
const TAG_SPECIAL: u8 = 2;
const TAG_EMPTY: u8 = 3;

pub(super) fn wait(state: &mut CpuState) -> Result<Control, Exception> {
    // FWAIT only checks for pending unmasked exceptions under CR0.MP/TS.
    super::system::fpu_usable(state)?;
    Ok(Control::Advance)
}

pub(super) fn emms(state: &mut CpuState) -> Result<Control, Exception> {
    super::system::fpu_usable(state)?;
    state.fpu.tag = 0xFFFF;
    Ok(Control::Advance)
}

fn tag_for(v: f64) -> u8 {
    if v == 0.0 {
        TAG_ZERO
    } else if v.is_nan() || v.is_infinite() {
        TAG_SPECIAL
    } else {
        TAG_VALID
    }
}

fn st_get(state: &CpuState, i: u8) -> f64 {
    let phys = state.fpu.st_phys(i);
    if state.fpu.tag_of(phys) == TAG_EMPTY {
        return f64::NAN;
    }
    f80_to_f64(Float80::from_bytes(&state.fpu.regs[phys]))
}

fn st_set(state: &mut CpuState, i: u8, v: f64) {
    let phys = state.fpu.st_phys(i);
    state.fpu.regs[phys] = f80_from_f64(v).to_bytes();
    state.fpu.set_tag(phys, tag_for(v));
}

fn st_is_empty(state: &CpuState, i: u8) -> bool {
    state.fpu.tag_of(state.fpu.st_phys(i)) == TAG_EMPTY
}

fn fpush(state: &mut CpuState, v: f64) {
    let top = state.fpu.top().wrapping_sub(1) & 7;
    state.fpu.set_top(top);
    if state.fpu.tag_of(top as usize) != TAG_EMPTY {
        // Stack overflow.
        state.fpu.status |= SW_IE | SW_C1;
    }
    state.fpu.regs[top as usize] = f80_from_f64(v).to_bytes();
    state.fpu.set_tag(top as usize, tag_for(v));
}

fn fpop(state: &mut CpuState) {
    let top = state.fpu.top();
    state.fpu.set_tag(top as usize, TAG_EMPTY);
    state.fpu.set_top((top + 1) & 7);
}

fn apply_status(state: &mut CpuState, status: FpStatus) {
    state.fpu.status |= status.x87_bits();
}

fn rounding(state: &CpuState) -> Rounding {
    Rounding::from_x87(state.fpu.control)
}

fn set_compare_flags(state: &mut CpuState, cmp: FpCompare) {
    state.fpu.status &= !(SW_C0 | SW_C2 | SW_C3);
    match cmp {
        FpCompare::Less => state.fpu.status |= SW_C0,
        FpCompare::Equal => state.fpu.status |= SW_C3,
        FpCompare::Greater => {}
        FpCompare::Unordered => state.fpu.status |= SW_C0 | SW_C2 | SW_C3,
    }
}

fn set_compare_eflags(state: &mut CpuState, cmp: FpCompare) {
    state.set_flag(Eflags::ZF, matches!(cmp, FpCompare::Equal | FpCompare::Unordered));
    state.set_flag(Eflags::PF, cmp == FpCompare::Unordered);
    state.set_flag(Eflags::CF, matches!(cmp, FpCompare::Less | FpCompare::Unordered));
    state.set_flag(Eflags::OF, false);
    state.set_flag(Eflags::SF, false);
    state.set_flag(Eflags::AF, false);
}

/// Two-operand arithmetic selected by the common /r encoding.
fn arith(op: u8, a: f64, b: f64, status: &mut FpStatus) -> Option<f64> {
    Some(match op {
        0 => f64_add(a, b, status),
        1 => f64_mul(a, b, status),
        2 | 3 => return None, // FCOM/FCOMP handled by caller
        4 => f64_sub(a, b, status),
        5 => f64_sub(b, a, status),
        6 => f64_div(a, b, status),
        _ => f64_div(b, a, status),
    })
}

fn read_mem_f32(state: &mut CpuState, bus: &mut dyn CpuBus, instr: &Instr) -> Result<f64, Exception> {
    let lin = mem_linear(state, instr, 4, false)?;
    let user = state.user_access();
    Ok(f32::from_bits(bus.read_u32(lin, user)?) as f64)
}

fn read_mem_f64(state: &mut CpuState, bus: &mut dyn CpuBus, instr: &Instr) -> Result<f64, Exception> {
    let lin = mem_linear(state, instr, 8, false)?;
    let user = state.user_access();
    Ok(f64::from_bits(bus.read_u64(lin, user)?))
}

/// Dispatches one x87 escape instruction.
pub(super) fn escape(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    esc: u8,
    modrm: u8,
) -> Result<Control, Exception> {
    super::system::fpu_usable(state)?;
    state.fpu.opcode = ((esc as u16) << 8 | modrm as u16) & 0x7FF;
    let reg_field = modrm >> 3 & 7;
    let is_reg = modrm >= 0xC0;
    let rm = modrm & 7;
    let mut status = FpStatus::default();

    match (esc, is_reg) {
        // D8: single-precision memory or ST(i) arithmetic into ST(0).
        (0, false) | (0, true) => {
            let operand = if is_reg {
                st_get(state, rm)
            } else {
                read_mem_f32(state, bus, instr)?
            };
            let st0 = st_get(state, 0);
            match reg_field {
                2 | 3 => {
                    set_compare_flags(state, f64_compare(st0, operand));
                    if reg_field == 3 {
                        fpop(state);
                    }
                }
                op => {
                    if let Some(r) = arith(op, st0, operand, &mut status) {
                        st_set(state, 0, r);
                    }
                }
            }
        }
        // D9 memory: FLD/FST/FSTP m32, environment, control word.
        (1, false) => {
            let user = state.user_access();
            match reg_field {
                0 => {
                    let v = read_mem_f32(state, bus, instr)?;
                    fpush(state, v);
                }
                2 | 3 => {
                    let lin = mem_linear(state, instr, 4, true)?;
                    let v = st_get(state, 0) as f32;
                    bus.write_u32(lin, v.to_bits(), user)?;
                    if reg_field == 3 {
                        fpop(state);
                    }
                }
                4 => fldenv(state, bus, instr)?,
                5 => {
                    let lin = mem_linear(state, instr, 2, false)?;
                    state.fpu.control = bus.read_u16(lin, user)?;
                }
                6 => fnstenv(state, bus, instr)?,
                7 => {
                    let lin = mem_linear(state, instr, 2, true)?;
                    bus.write_u16(lin, state.fpu.control, user)?;
                }
                _ => return Err(Exception::InvalidOpcode),
            }
        }
        // D9 register forms.
        (1, true) => match modrm {
            0xC0..=0xC7 => {
                let v = st_get(state, rm);
                fpush(state, v);
            }
            0xC8..=0xCF => {
                let a = st_get(state, 0);
                let b = st_get(state, rm);
                st_set(state, 0, b);
                st_set(state, rm, a);
            }
            0xD0 => {} // FNOP
            0xE0 => {
                let v = st_get(state, 0);
                st_set(state, 0, -v);
            }
            0xE1 => {
                let v = st_get(state, 0);
                st_set(state, 0, v.abs());
            }
            0xE4 => {
                let v = st_get(state, 0);
                set_compare_flags(state, f64_compare(v, 0.0));
            }
            0xE5 => {
                // FXAM.
                let v = st_get(state, 0);
                state.fpu.status &= !(SW_C0 | SW_C1 | SW_C2 | SW_C3);
                if v.is_sign_negative() {
                    state.fpu.status |= SW_C1;
                }
                if st_is_empty(state, 0) {
                    state.fpu.status |= SW_C0 | SW_C3;
                } else if v.is_nan() {
                    state.fpu.status |= SW_C0;
                } else if v.is_infinite() {
                    state.fpu.status |= SW_C0 | SW_C2;
                } else if v == 0.0 {
                    state.fpu.status |= SW_C3;
                } else {
                    state.fpu.status |= SW_C2;
                }
            }
            0xE8 => fpush(state, 1.0),
            0xE9 => fpush(state, std::f64::consts::LOG2_10),
            0xEA => fpush(state, std::f64::consts::LOG2_E),
            0xEB => fpush(state, std::f64::consts::PI),
            0xEC => fpush(state, std::f64::consts::LOG10_2),
            0xED => fpush(state, std::f64::consts::LN_2),
            0xEE => fpush(state, 0.0),
            0xF0 => {
                let v = st_get(state, 0);
                st_set(state, 0, v.exp2() - 1.0);
            }
            0xF1 => {
                let x = st_get(state, 1);
                let y = st_get(state, 0);
                st_set(state, 1, x * y.log2());
                fpop(state);
            }
            0xF2 => {
                let v = st_get(state, 0);
                st_set(state, 0, v.tan());
                fpush(state, 1.0);
                state.fpu.status &= !SW_C2;
            }
            0xF3 => {
                let x = st_get(state, 1);
                let y = st_get(state, 0);
                st_set(state, 1, x.atan2(y));
                fpop(state);
            }
            0xF4 => {
                // FXTRACT: exponent and significand.
                let v = st_get(state, 0);
                if v == 0.0 {
                    st_set(state, 0, f64::NEG_INFINITY);
                    fpush(state, 0.0);
                    status.divide_by_zero = true;
                } else {
                    let exp = v.abs().log2().floor();
                    st_set(state, 0, exp);
                    fpush(state, v / exp.exp2());
                }
            }
            0xF5 | 0xF8 => {
                // FPREM1/FPREM.
                let a = st_get(state, 0);
                let b = st_get(state, 1);
                if b == 0.0 {
                    status.invalid = true;
                } else {
                    let r = if modrm == 0xF5 {
                        a - (a / b).round() * b
                    } else {
                        a % b
                    };
                    st_set(state, 0, r);
                    state.fpu.status &= !SW_C2;
                }
            }
            0xF6 => {
                let top = state.fpu.top();
                state.fpu.set_top(top.wrapping_sub(1) & 7);
            }
            0xF7 => {
                let top = state.fpu.top();
                state.fpu.set_top((top + 1) & 7);
            }
            0xF9 => {
                let x = st_get(state, 1);
                let y = st_get(state, 0);
                st_set(state, 1, x * (y + 1.0).log2());
                fpop(state);
            }
            0xFA => {
                let v = st_get(state, 0);
                st_set(state, 0, f64_sqrt(v, &mut status));
            }
            0xFB => {
                let v = st_get(state, 0);
                st_set(state, 0, v.sin());
                fpush(state, v.cos());
                state.fpu.status &= !SW_C2;
            }
            0xFC => {
                let v = st_get(state, 0);
                st_set(state, 0, f64_round(v, rounding(state)));
            }
            0xFD => {
                let scale = st_get(state, 1).trunc();
                let v = st_get(state, 0);
                st_set(state, 0, v * scale.exp2());
            }
            0xFE => {
                let v = st_get(state, 0);
                st_set(state, 0, v.sin());
                state.fpu.status &= !SW_C2;
            }
            0xFF => {
                let v = st_get(state, 0);
                st_set(state, 0, v.cos());
                state.fpu.status &= !SW_C2;
            }
            _ => return Err(Exception::InvalidOpcode),
        },
        // DA: 32-bit integer arithmetic / FCMOV / FUCOMPP.
        (2, false) => {
            let lin = mem_linear(state, instr, 4, false)?;
            let user = state.user_access();
            let operand = bus.read_u32(lin, user)? as i32 as f64;
            let st0 = st_get(state, 0);
            match reg_field {
                2 | 3 => {
                    set_compare_flags(state, f64_compare(st0, operand));
                    if reg_field == 3 {
                        fpop(state);
                    }
                }
                op => {
                    if let Some(r) = arith(op, st0, operand, &mut status) {
                        st_set(state, 0, r);
                    }
                }
            }
        }
        (2, true) => match modrm {
            0xC0..=0xDF => {
                let cc = match reg_field {
                    0 => state.flag(Eflags::CF),
                    1 => state.flag(Eflags::ZF),
                    2 => state.flag(Eflags::CF) || state.flag(Eflags::ZF),
                    _ => state.flag(Eflags::PF),
                };
                if cc {
                    let v = st_get(state, rm);
                    st_set(state, 0, v);
                }
            }
            0xE9 => {
                let cmp = f64_compare(st_get(state, 0), st_get(state, 1));
                set_compare_flags(state, cmp);
                fpop(state);
                fpop(state);
            }
            _ => return Err(Exception::InvalidOpcode),
        },
        // DB: 32-bit integer loads/stores, 80-bit loads, control ops.
        (3, false) => {
            let user = state.user_access();
            match reg_field {
                0 => {
                    let lin = mem_linear(state, instr, 4, false)?;
                    let v = bus.read_u32(lin, user)? as i32 as f64;
                    fpush(state, v);
                }
                1..=3 => {
                    let lin = mem_linear(state, instr, 4, true)?;
                    let rnd = if reg_field == 1 {
                        Rounding::TowardZero
                    } else {
                        rounding(state)
                    };
                    let v = f64_to_i32(st_get(state, 0), rnd, &mut status);
                    bus.write_u32(lin, v as u32, user)?;
                    if reg_field != 2 {
                        fpop(state);
                    }
                }
                5 => {
                    let lin = mem_linear(state, instr, 10, false)?;
                    let mut raw = [0u8; 10];
                    bus.read_bytes(lin, &mut raw, user)?;
                    let v = f80_to_f64(Float80::from_bytes(&raw));
                    fpush(state, v);
                }
                7 => {
                    let lin = mem_linear(state, instr, 10, true)?;
                    let raw = f80_from_f64(st_get(state, 0)).to_bytes();
                    bus.write_bytes(lin, &raw, user)?;
                    fpop(state);
                }
                _ => return Err(Exception::InvalidOpcode),
            }
        }
        (3, true) => match modrm {
            0xC0..=0xDF => {
                let cc = match reg_field {
                    0 => !state.flag(Eflags::CF),
                    1 => !state.flag(Eflags::ZF),
                    2 => !state.flag(Eflags::CF) && !state.flag(Eflags::ZF),
                    _ => !state.flag(Eflags::PF),
                };
                if cc {
                    let v = st_get(state, rm);
                    st_set(state, 0, v);
                }
            }
            0xE2 => {
                state.fpu.status &= !0x80FF; // FNCLEX
            }
            0xE3 => {
                state.fpu = Default::default(); // FNINIT
            }
            0xE8..=0xEF | 0xF0..=0xF7 => {
                let cmp = f64_compare(st_get(state, 0), st_get(state, rm));
                set_compare_eflags(state, cmp);
            }
            _ => return Err(Exception::InvalidOpcode),
        },
        // DC: double-precision memory / ST(i) destination arithmetic.
        (4, false) => {
            let operand = read_mem_f64(state, bus, instr)?;
            let st0 = st_get(state, 0);
            match reg_field {
                2 | 3 => {
                    set_compare_flags(state, f64_compare(st0, operand));
                    if reg_field == 3 {
                        fpop(state);
                    }
                }
                op => {
                    if let Some(r) = arith(op, st0, operand, &mut status) {
                        st_set(state, 0, r);
                    }
                }
            }
        }
        (4, true) => {
            // Destination is ST(i); the sub/div senses swap.
            let sti = st_get(state, rm);
            let st0 = st_get(state, 0);
            let op = match reg_field {
                4 => 5,
                5 => 4,
                6 => 7,
                7 => 6,
                other => other,
            };
            if let Some(r) = arith(op, sti, st0, &mut status) {
                st_set(state, rm, r);
            }
        }
        // DD: double loads/stores, FNSTSW, FFREE, FUCOM.
        (5, false) => {
            let user = state.user_access();
            match reg_field {
                0 => {
                    let v = read_mem_f64(state, bus, instr)?;
                    fpush(state, v);
                }
                2 | 3 => {
                    let lin = mem_linear(state, instr, 8, true)?;
                    bus.write_u64(lin, st_get(state, 0).to_bits(), user)?;
                    if reg_field == 3 {
                        fpop(state);
                    }
                }
                4 => frstor(state, bus, instr)?,
                6 => fnsave(state, bus, instr)?,
                7 => {
                    let lin = mem_linear(state, instr, 2, true)?;
                    bus.write_u16(lin, state.fpu.status, user)?;
                }
                _ => return Err(Exception::InvalidOpcode),
            }
        }
        (5, true) => match modrm {
            0xC0..=0xC7 => {
                let phys = state.fpu.st_phys(rm);
                state.fpu.set_tag(phys, TAG_EMPTY);
            }
            0xD0..=0xD7 => {
                let v = st_get(state, 0);
                st_set(state, rm, v);
            }
            0xD8..=0xDF => {
                let v = st_get(state, 0);
                st_set(state, rm, v);
                fpop(state);
            }
            0xE0..=0xE7 => {
                let cmp = f64_compare(st_get(state, 0), st_get(state, rm));
                set_compare_flags(state, cmp);
            }
            0xE8..=0xEF => {
                let cmp = f64_compare(st_get(state, 0), st_get(state, rm));
                set_compare_flags(state, cmp);
                fpop(state);
            }
            _ => return Err(Exception::InvalidOpcode),
        },
        // DE: 16-bit integer arithmetic / pop forms.
        (6, false) => {
            let lin = mem_linear(state, instr, 2, false)?;
            let user = state.user_access();
            let operand = bus.read_u16(lin, user)? as i16 as f64;
            let st0 = st_get(state, 0);
            match reg_field {
                2 | 3 => {
                    set_compare_flags(state, f64_compare(st0, operand));
                    if reg_field == 3 {
                        fpop(state);
                    }
                }
                op => {
                    if let Some(r) = arith(op, st0, operand, &mut status) {
                        st_set(state, 0, r);
                    }
                }
            }
        }
        (6, true) => {
            if modrm == 0xD9 {
                // FCOMPP.
                let cmp = f64_compare(st_get(state, 0), st_get(state, 1));
                set_compare_flags(state, cmp);
                fpop(state);
                fpop(state);
            } else {
                let sti = st_get(state, rm);
                let st0 = st_get(state, 0);
                let op = match reg_field {
                    4 => 5,
                    5 => 4,
                    6 => 7,
                    7 => 6,
                    other => other,
                };
                if let Some(r) = arith(op, sti, st0, &mut status) {
                    st_set(state, rm, r);
                    fpop(state);
                }
            }
        }
        // DF: 16/64-bit integers, BCD, FNSTSW AX.
        (7, false) => {
            let user = state.user_access();
            match reg_field {
                0 => {
                    let lin = mem_linear(state, instr, 2, false)?;
                    let v = bus.read_u16(lin, user)? as i16 as f64;
                    fpush(state, v);
                }
                1..=3 => {
                    let lin = mem_linear(state, instr, 2, true)?;
                    let rnd = if reg_field == 1 {
                        Rounding::TowardZero
                    } else {
                        rounding(state)
                    };
                    let v = f64_to_i32(st_get(state, 0), rnd, &mut status);
                    bus.write_u16(lin, v as i16 as u16, user)?;
                    if reg_field != 2 {
                        fpop(state);
                    }
                }
                4 => {
                    // FBLD: ten-byte packed BCD.
                    let lin = mem_linear(state, instr, 10, false)?;
                    let mut raw = [0u8; 10];
                    bus.read_bytes(lin, &mut raw, user)?;
                    let mut value = 0i64;
                    for digit_pair in raw[..9].iter().rev() {
                        value = value * 100 + (digit_pair >> 4) as i64 * 10 + (digit_pair & 0xF) as i64;
                    }
                    if raw[9] & 0x80 != 0 {
                        value = -value;
                    }
                    fpush(state, value as f64);
                }
                5 => {
                    let lin = mem_linear(state, instr, 8, false)?;
                    let v = bus.read_u64(lin, user)? as i64 as f64;
                    fpush(state, v);
                }
                6 => {
                    // FBSTP.
                    let lin = mem_linear(state, instr, 10, true)?;
                    let v = f64_to_i64(st_get(state, 0), rounding(state), &mut status);
                    let mut raw = [0u8; 10];
                    let mut abs = v.unsigned_abs();
                    for b in raw[..9].iter_mut() {
                        let pair = (abs % 10) as u8 | (((abs / 10) % 10) as u8) << 4;
                        abs /= 100;
                        *b = pair;
                    }
                    if v < 0 {
                        raw[9] = 0x80;
                    }
                    bus.write_bytes(lin, &raw, user)?;
                    fpop(state);
                }
                7 => {
                    let lin = mem_linear(state, instr, 8, true)?;
                    let v = f64_to_i64(st_get(state, 0), rounding(state), &mut status);
                    bus.write_u64(lin, v as u64, user)?;
                    fpop(state);
                }
                _ => return Err(Exception::InvalidOpcode),
            }
        }
        (7, true) => match modrm {
            0xE0 => {
                let sw = state.fpu.status;
                state.write_reg16(0, sw);
            }
            0xE8..=0xEF | 0xF0..=0xF7 => {
                let cmp = f64_compare(st_get(state, 0), st_get(state, rm));
                set_compare_eflags(state, cmp);
                fpop(state);
            }
            _ => return Err(Exception::InvalidOpcode),
        },
        _ => return Err(Exception::InvalidOpcode),
    }
    apply_status(state, status);
    Ok(Control::Advance)
}

/// 32-bit protected-mode environment image (28 bytes).
fn fnstenv(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<(), Exception> {
    let lin = mem_linear(state, instr, 28, true)?;
    let user = state.user_access();
    bus.write_u32(lin, state.fpu.control as u32, user)?;
    bus.write_u32(lin + 4, state.fpu.status as u32, user)?;
    bus.write_u32(lin + 8, state.fpu.tag as u32, user)?;
    bus.write_u32(lin + 12, state.fpu.last_ip, user)?;
    bus.write_u32(lin + 16, state.fpu.last_cs as u32 | (state.fpu.opcode as u32) << 16, user)?;
    bus.write_u32(lin + 20, state.fpu.last_dp, user)?;
    bus.write_u32(lin + 24, state.fpu.last_ds as u32, user)?;
    // Exceptions are masked after an environment store.
    state.fpu.control |= 0x3F;
    Ok(())
}

fn fldenv(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<(), Exception> {
    let lin = mem_linear(state, instr, 28, false)?;
    let user = state.user_access();
    state.fpu.control = bus.read_u32(lin, user)? as u16;
    state.fpu.status = bus.read_u32(lin + 4, user)? as u16;
    state.fpu.tag = bus.read_u32(lin + 8, user)? as u16;
    state.fpu.last_ip = bus.read_u32(lin + 12, user)?;
    let cs_op = bus.read_u32(lin + 16, user)?;
    state.fpu.last_cs = cs_op as u16;
    state.fpu.opcode = (cs_op >> 16) as u16 & 0x7FF;
    state.fpu.last_dp = bus.read_u32(lin + 20, user)?;
    state.fpu.last_ds = bus.read_u32(lin + 24, user)? as u16;
    Ok(())
}

fn fnsave(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<(), Exception> {
    fnstenv(state, bus, instr)?;
    let lin = mem_linear(state, instr, 108, true)?;
    let user = state.user_access();
    for i in 0..8u8 {
        let phys = state.fpu.st_phys(i);
        let bytes = state.fpu.regs[phys];
        bus.write_bytes(lin + 28 + i as u32 * 10, &bytes, user)?;
    }
    state.fpu = Default::default();
    Ok(())
}

fn frstor(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<(), Exception> {
    fldenv(state, bus, instr)?;
    let lin = mem_linear(state, instr, 108, false)?;
    let user = state.user_access();
    for i in 0..8u8 {
        let mut bytes = [0u8; 10];
        bus.read_bytes(lin + 28 + i as u32 * 10, &mut bytes, user)?;
        let phys = state.fpu.st_phys(i);
        state.fpu.regs[phys] = bytes;
    }
    Ok(())
}
