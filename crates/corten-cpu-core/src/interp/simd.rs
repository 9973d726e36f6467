//! MMX/SSE operand plumbing: register-file moves, packed-integer ALU and
//! the scalar/packed float operations routed through the softfloat facade.

use super::{mem_linear, Control};
use crate::decode::{FloatOp, Instr, Operand, PackedOp};
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::softfloat::{
    f64_add, f64_div, f64_max, f64_min, f64_mul, f64_sqrt, f64_sub, FpStatus,
};
use crate::state::{CpuState, OpSize, CR0_EM, CR4_OSFXSR};

fn sse_usable(state: &CpuState) -> Result<(), Exception> {
    if state.control.cr0 & CR0_EM != 0 || state.control.cr4 & CR4_OSFXSR == 0 {
        return Err(Exception::InvalidOpcode);
    }
    if state.control.cr0 & crate::state::CR0_TS != 0 {
        return Err(Exception::DeviceNotAvailable);
    }
    Ok(())
}

fn mmx_usable(state: &mut CpuState) -> Result<(), Exception> {
    super::system::fpu_usable(state)?;
    // MMX use clears the tag word and pins TOP to 0.
    state.fpu.tag = 0;
    state.fpu.set_top(0);
    Ok(())
}

/// 64-bit MMX register view over the x87 significands.
fn mmx_read(state: &CpuState, reg: u8) -> u64 {
    u64::from_le_bytes(state.fpu.regs[reg as usize & 7][..8].try_into().unwrap())
}

fn mmx_write(state: &mut CpuState, reg: u8, value: u64) {
    let r = &mut state.fpu.regs[reg as usize & 7];
    r[..8].copy_from_slice(&value.to_le_bytes());
    // Exponent field reads as all-ones for MMX writes.
    r[8] = 0xFF;
    r[9] = 0xFF;
}

fn xmm_read(state: &CpuState, reg: u8) -> [u32; 4] {
    state.sse.xmm[reg as usize & 7]
}

fn xmm_write(state: &mut CpuState, reg: u8, value: [u32; 4]) {
    state.sse.xmm[reg as usize & 7] = value;
}

fn read_mem128(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<[u32; 4], Exception> {
    let lin = mem_linear(state, instr, 16, false)?;
    let user = state.user_access();
    let mut out = [0u32; 4];
    for (i, w) in out.iter_mut().enumerate() {
        *w = bus.read_u32(lin + i as u32 * 4, user)?;
    }
    Ok(out)
}

fn write_mem128(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    value: [u32; 4],
) -> Result<(), Exception> {
    let lin = mem_linear(state, instr, 16, true)?;
    let user = state.user_access();
    for (i, w) in value.iter().enumerate() {
        bus.write_u32(lin + i as u32 * 4, *w, user)?;
    }
    Ok(())
}

pub(super) fn simd_mov(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    width: u8,
) -> Result<Control, Exception> {
    let mmx_involved = matches!(instr.dst, Operand::Mmx(_)) || matches!(instr.src, Operand::Mmx(_));
    if mmx_involved {
        mmx_usable(state)?;
    } else {
        sse_usable(state)?;
    }
    let user = state.user_access();
    match width {
        4 => {
            // MOVD.
            let value = match instr.src {
                Operand::Reg(r) => state.read_reg32(r),
                Operand::Mem => {
                    let lin = mem_linear(state, instr, 4, false)?;
                    bus.read_u32(lin, user)?
                }
                Operand::Mmx(m) => mmx_read(state, m) as u32,
                Operand::Xmm(x) => xmm_read(state, x)[0],
                _ => return Err(Exception::InvalidOpcode),
            };
            match instr.dst {
                Operand::Reg(r) => state.write_reg32(r, value),
                Operand::Mem => {
                    let lin = mem_linear(state, instr, 4, true)?;
                    bus.write_u32(lin, value, user)?;
                }
                Operand::Mmx(m) => mmx_write(state, m, value as u64),
                Operand::Xmm(x) => xmm_write(state, x, [value, 0, 0, 0]),
                _ => return Err(Exception::InvalidOpcode),
            }
        }
        8 => {
            let value = match instr.src {
                Operand::Mmx(m) => mmx_read(state, m),
                Operand::Xmm(x) => {
                    let v = xmm_read(state, x);
                    v[0] as u64 | (v[1] as u64) << 32
                }
                Operand::Mem => {
                    let lin = mem_linear(state, instr, 8, false)?;
                    bus.read_u64(lin, user)?
                }
                _ => return Err(Exception::InvalidOpcode),
            };
            match instr.dst {
                Operand::Mmx(m) => mmx_write(state, m, value),
                Operand::Xmm(x) => xmm_write(state, x, [value as u32, (value >> 32) as u32, 0, 0]),
                Operand::Mem => {
                    let lin = mem_linear(state, instr, 8, true)?;
                    bus.write_u64(lin, value, user)?;
                }
                _ => return Err(Exception::InvalidOpcode),
            }
        }
        _ => {
            let value = match instr.src {
                Operand::Xmm(x) => xmm_read(state, x),
                Operand::Mem => read_mem128(state, bus, instr)?,
                _ => return Err(Exception::InvalidOpcode),
            };
            match instr.dst {
                Operand::Xmm(x) => xmm_write(state, x, value),
                Operand::Mem => write_mem128(state, bus, instr, value)?,
                _ => return Err(Exception::InvalidOpcode),
            }
        }
    }
    Ok(Control::Advance)
}

fn lane_op(op: PackedOp, lanes: OpSize, a: u64, b: u64) -> u64 {
    match op {
        PackedOp::And => a & b,
        PackedOp::Andn => !a & b,
        PackedOp::Or => a | b,
        PackedOp::Xor => a ^ b,
        PackedOp::Add | PackedOp::Sub | PackedOp::CmpEq => {
            let lane_bits = lanes.bits() as u64;
            let lane_mask = lanes.mask() as u64;
            let mut out = 0u64;
            let mut shift = 0;
            while shift < 64 {
                let la = a >> shift & lane_mask;
                let lb = b >> shift & lane_mask;
                let r = match op {
                    PackedOp::Add => la.wrapping_add(lb) & lane_mask,
                    PackedOp::Sub => la.wrapping_sub(lb) & lane_mask,
                    _ => {
                        if la == lb {
                            lane_mask
                        } else {
                            0
                        }
                    }
                };
                out |= r << shift;
                shift += lane_bits;
            }
            out
        }
    }
}

pub(super) fn packed_int(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    op: PackedOp,
    lanes: OpSize,
) -> Result<Control, Exception> {
    match instr.dst {
        Operand::Mmx(d) => {
            mmx_usable(state)?;
            let a = mmx_read(state, d);
            let b = match instr.src {
                Operand::Mmx(s) => mmx_read(state, s),
                Operand::Mem => {
                    let lin = mem_linear(state, instr, 8, false)?;
                    let user = state.user_access();
                    bus.read_u64(lin, user)?
                }
                _ => return Err(Exception::InvalidOpcode),
            };
            mmx_write(state, d, lane_op(op, lanes, a, b));
        }
        Operand::Xmm(d) => {
            sse_usable(state)?;
            let a = xmm_read(state, d);
            let b = match instr.src {
                Operand::Xmm(s) => xmm_read(state, s),
                Operand::Mem => read_mem128(state, bus, instr)?,
                _ => return Err(Exception::InvalidOpcode),
            };
            let lo = lane_op(
                op,
                lanes,
                a[0] as u64 | (a[1] as u64) << 32,
                b[0] as u64 | (b[1] as u64) << 32,
            );
            let hi = lane_op(
                op,
                lanes,
                a[2] as u64 | (a[3] as u64) << 32,
                b[2] as u64 | (b[3] as u64) << 32,
            );
            xmm_write(
                state,
                d,
                [lo as u32, (lo >> 32) as u32, hi as u32, (hi >> 32) as u32],
            );
        }
        _ => return Err(Exception::InvalidOpcode),
    }
    Ok(Control::Advance)
}

fn float_op(op: FloatOp, a: f64, b: f64, status: &mut FpStatus) -> f64 {
    match op {
        FloatOp::Add => f64_add(a, b, status),
        FloatOp::Sub => f64_sub(a, b, status),
        FloatOp::Mul => f64_mul(a, b, status),
        FloatOp::Div => f64_div(a, b, status),
        FloatOp::Min => f64_min(a, b, status),
        FloatOp::Max => f64_max(a, b, status),
        FloatOp::Sqrt => f64_sqrt(b, status),
    }
}

pub(super) fn sse_arith(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    op: FloatOp,
    scalar: bool,
    double: bool,
) -> Result<Control, Exception> {
    sse_usable(state)?;
    let d = match instr.dst {
        Operand::Xmm(d) => d,
        _ => return Err(Exception::InvalidOpcode),
    };
    let a = xmm_read(state, d);
    let b = match instr.src {
        Operand::Xmm(s) => xmm_read(state, s),
        Operand::Mem => {
            // Scalar forms only touch the low element.
            if scalar {
                let user = state.user_access();
                if double {
                    let lin = mem_linear(state, instr, 8, false)?;
                    let v = bus.read_u64(lin, user)?;
                    [v as u32, (v >> 32) as u32, 0, 0]
                } else {
                    let lin = mem_linear(state, instr, 4, false)?;
                    [bus.read_u32(lin, user)?, 0, 0, 0]
                }
            } else {
                read_mem128(state, bus, instr)?
            }
        }
        _ => return Err(Exception::InvalidOpcode),
    };

    let mut status = FpStatus::default();
    let mut out = a;
    if double {
        let lanes = if scalar { 1 } else { 2 };
        for lane in 0..lanes {
            let av = f64::from_bits(a[lane * 2] as u64 | (a[lane * 2 + 1] as u64) << 32);
            let bv = f64::from_bits(b[lane * 2] as u64 | (b[lane * 2 + 1] as u64) << 32);
            let r = float_op(op, av, bv, &mut status).to_bits();
            out[lane * 2] = r as u32;
            out[lane * 2 + 1] = (r >> 32) as u32;
        }
    } else {
        let lanes = if scalar { 1 } else { 4 };
        for (lane, slot) in out.iter_mut().enumerate().take(lanes) {
            let av = f32::from_bits(a[lane]) as f64;
            let bv = f32::from_bits(b[lane]) as f64;
            *slot = (float_op(op, av, bv, &mut status) as f32).to_bits();
        }
    }
    xmm_write(state, d, out);
    state.sse.mxcsr |= status.mxcsr_bits();
    Ok(Control::Advance)
}

pub(super) fn sse_control(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    use crate::decode::Op;
    let user = state.user_access();
    match instr.op {
        Op::Ldmxcsr => {
            sse_usable(state)?;
            let lin = mem_linear(state, instr, 4, false)?;
            let value = bus.read_u32(lin, user)?;
            if value & !0xFFFF != 0 {
                return Err(Exception::gp0());
            }
            state.sse.mxcsr = value;
        }
        Op::Stmxcsr => {
            sse_usable(state)?;
            let lin = mem_linear(state, instr, 4, true)?;
            bus.write_u32(lin, state.sse.mxcsr, user)?;
        }
        Op::Fxsave => {
            super::system::fpu_usable(state)?;
            let lin = mem_linear(state, instr, 512, true)?;
            bus.write_u16(lin, state.fpu.control, user)?;
            bus.write_u16(lin + 2, state.fpu.status, user)?;
            // Abridged tag: one bit per non-empty register.
            let mut abridged = 0u8;
            for i in 0..8 {
                if state.fpu.tag_of(i) != 3 {
                    abridged |= 1 << i;
                }
            }
            bus.write_u8(lin + 4, abridged, user)?;
            bus.write_u16(lin + 6, state.fpu.opcode, user)?;
            bus.write_u32(lin + 8, state.fpu.last_ip, user)?;
            bus.write_u32(lin + 16, state.fpu.last_dp, user)?;
            bus.write_u32(lin + 24, state.sse.mxcsr, user)?;
            bus.write_u32(lin + 28, 0xFFFF, user)?; // MXCSR_MASK
            for i in 0..8u32 {
                let bytes = state.fpu.regs[i as usize];
                bus.write_bytes(lin + 32 + i * 16, &bytes, user)?;
            }
            for i in 0..8u32 {
                let xmm = state.sse.xmm[i as usize];
                for (j, w) in xmm.iter().enumerate() {
                    bus.write_u32(lin + 160 + i * 16 + j as u32 * 4, *w, user)?;
                }
            }
        }
        Op::Fxrstor => {
            super::system::fpu_usable(state)?;
            let lin = mem_linear(state, instr, 512, false)?;
            state.fpu.control = bus.read_u16(lin, user)?;
            state.fpu.status = bus.read_u16(lin + 2, user)?;
            let abridged = bus.read_u8(lin + 4, user)?;
            let mut tag = 0u16;
            for i in 0..8 {
                if abridged & 1 << i == 0 {
                    tag |= 3 << (i * 2);
                }
            }
            state.fpu.tag = tag;
            state.fpu.opcode = bus.read_u16(lin + 6, user)?;
            state.fpu.last_ip = bus.read_u32(lin + 8, user)?;
            state.fpu.last_dp = bus.read_u32(lin + 16, user)?;
            let mxcsr = bus.read_u32(lin + 24, user)?;
            if mxcsr & !0xFFFF != 0 {
                return Err(Exception::gp0());
            }
            state.sse.mxcsr = mxcsr;
            for i in 0..8u32 {
                let mut bytes = [0u8; 10];
                bus.read_bytes(lin + 32 + i * 16, &mut bytes, user)?;
                state.fpu.regs[i as usize] = bytes;
            }
            for i in 0..8u32 {
                for j in 0..4u32 {
                    state.sse.xmm[i as usize][j as usize] =
                        bus.read_u32(lin + 160 + i * 16 + j * 4, user)?;
                }
            }
        }
        _ => return Err(Exception::InvalidOpcode),
    }
    Ok(Control::Advance)
}
