//! Control transfer: near/far jumps and calls, returns, software
//! interrupts, IRET, and the interrupt/exception delivery path shared with
//! the executor.

use super::{condition, pop, push, read_far_pointer, read_operand, Control};
use crate::decode::{Instr, Op, Operand};
use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::seg::{load_cs_checked, load_seg, read_descriptor};
use crate::state::{CpuState, Eflags, OpSize, SegReg, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Hardware interrupt (IAC supplied the vector).
    External,
    /// INT n / INT3 / INTO: gate DPL is checked against CPL.
    Software,
    /// CPU-raised exception.
    Exception,
}

fn branch_to(state: &mut CpuState, target: u32, size: OpSize) {
    let masked = if size == OpSize::Word {
        target & 0xFFFF
    } else {
        target
    };
    state.set_eip(masked);
}

pub(super) fn control_flow(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    next_eip: u32,
) -> Result<Control, Exception> {
    match instr.op {
        Op::Jmp => {
            let target = match (instr.src, instr.src2) {
                (Operand::Imm(rel), Operand::None) => next_eip.wrapping_add(rel),
                _ => read_operand(state, bus, instr, instr.src)?,
            };
            branch_to(state, target, instr.size);
            Ok(Control::Branch)
        }
        Op::Jcc(cc) => {
            if condition(state, cc) {
                let rel = match instr.src {
                    Operand::Imm(rel) => rel,
                    _ => return Err(Exception::InvalidOpcode),
                };
                branch_to(state, next_eip.wrapping_add(rel), instr.size);
                Ok(Control::Branch)
            } else {
                Ok(Control::Advance)
            }
        }
        Op::Jcxz | Op::Loop | Op::Loope | Op::Loopne => {
            let counter = if instr.addr32 {
                state.read_reg32(1)
            } else {
                state.read_reg32(1) & 0xFFFF
            };
            let taken = if matches!(instr.op, Op::Jcxz) {
                counter == 0
            } else {
                let counter = counter.wrapping_sub(1);
                if instr.addr32 {
                    state.write_reg32(1, counter);
                } else {
                    state.write_reg16(1, counter as u16);
                }
                let nonzero = if instr.addr32 {
                    counter != 0
                } else {
                    counter & 0xFFFF != 0
                };
                match instr.op {
                    Op::Loop => nonzero,
                    Op::Loope => nonzero && state.flag(Eflags::ZF),
                    _ => nonzero && !state.flag(Eflags::ZF),
                }
            };
            if taken {
                let rel = match instr.src {
                    Operand::Imm(rel) => rel,
                    _ => return Err(Exception::InvalidOpcode),
                };
                branch_to(state, next_eip.wrapping_add(rel), instr.size);
                Ok(Control::Branch)
            } else {
                Ok(Control::Advance)
            }
        }
        Op::Call => {
            let target = match (instr.src, instr.src2) {
                (Operand::Imm(rel), Operand::None) => next_eip.wrapping_add(rel),
                _ => read_operand(state, bus, instr, instr.src)?,
            };
            push(state, bus, next_eip & instr.size.mask(), instr.size)?;
            branch_to(state, target, instr.size);
            Ok(Control::Branch)
        }
        Op::Ret { pop: extra } => {
            let target = pop(state, bus, instr.size)?;
            let mask = state.stack_mask();
            let esp = state.esp().wrapping_add(extra as u32) & mask | state.esp() & !mask;
            state.set_esp(esp);
            branch_to(state, target, instr.size);
            Ok(Control::Branch)
        }
        Op::JmpFar | Op::CallFar => {
            let (selector, offset) = match (instr.src, instr.src2) {
                (Operand::Imm(off), Operand::Imm(sel)) => (sel as u16, off),
                _ => return Err(Exception::InvalidOpcode),
            };
            far_transfer(state, bus, instr, selector, offset, next_eip, instr.op == Op::CallFar)
        }
        Op::JmpFarInd | Op::CallFarInd => {
            let (selector, offset) = read_far_pointer(state, bus, instr)?;
            let call = instr.op == Op::CallFarInd;
            far_transfer(state, bus, instr, selector, offset, next_eip, call)
        }
        Op::RetFar { pop: extra } => ret_far(state, bus, instr, extra),
        Op::Iret => iret(state, bus, instr),
        Op::Int(vector) => software_int(state, bus, instr, vector, next_eip),
        Op::Int3 => deliver_soft_vector(state, bus, 3, next_eip),
        Op::Into => {
            if state.flag(Eflags::OF) {
                deliver_soft_vector(state, bus, 4, next_eip)
            } else {
                Ok(Control::Advance)
            }
        }
        Op::Bound => {
            let index = read_operand(state, bus, instr, instr.dst)? as i32;
            let lin = super::mem_linear(state, instr, instr.size.bytes() * 2, false)?;
            let user = state.user_access();
            let (lower, upper) = if instr.size == OpSize::Word {
                (
                    bus.read_u16(lin, user)? as i16 as i32,
                    bus.read_u16(lin.wrapping_add(2), user)? as i16 as i32,
                )
            } else {
                (
                    bus.read_u32(lin, user)? as i32,
                    bus.read_u32(lin.wrapping_add(4), user)? as i32,
                )
            };
            let index = if instr.size == OpSize::Word {
                index as i16 as i32
            } else {
                index
            };
            if index < lower || index > upper {
                return Err(Exception::BoundRange);
            }
            Ok(Control::Advance)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

fn far_transfer(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    selector: u16,
    offset: u32,
    next_eip: u32,
    is_call: bool,
) -> Result<Control, Exception> {
    if state.protected_mode() && !state.vm86() {
        // Only code descriptors are supported as far targets; call gates
        // and task gates fault (nothing in the supported guests uses
        // them for forward transfers).
        let desc = read_descriptor(state, bus, selector)?;
        if desc.access() & 0x10 == 0 {
            return Err(Exception::GeneralProtection(selector & !3));
        }
        let old_cs = state.segments.cs.selector;
        if is_call {
            push(state, bus, old_cs as u32, instr.size)?;
            push(state, bus, next_eip & instr.size.mask(), instr.size)?;
        }
        load_cs_checked(state, bus, selector, state.cpl)?;
        branch_to(state, offset, if state.segments.cs.db() { OpSize::Dword } else { OpSize::Word });
        bus.sync(state);
        Ok(Control::Branch)
    } else {
        if is_call {
            let old_cs = state.segments.cs.selector as u32;
            push(state, bus, old_cs, instr.size)?;
            push(state, bus, next_eip & instr.size.mask(), instr.size)?;
        }
        load_seg(state, bus, SegReg::Cs, selector)?;
        state.segments.cs.access = 0x9B;
        state.update_mode();
        branch_to(state, offset, instr.size);
        bus.sync(state);
        Ok(Control::Branch)
    }
}

fn ret_far(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
    extra: u16,
) -> Result<Control, Exception> {
    let size = instr.size;
    let offset = pop(state, bus, size)?;
    let selector = pop(state, bus, size)? as u16;
    let adjust = |state: &mut CpuState, extra: u16| {
        let mask = state.stack_mask();
        let esp = state.esp().wrapping_add(extra as u32) & mask | state.esp() & !mask;
        state.set_esp(esp);
    };

    if !state.protected_mode() || state.vm86() {
        adjust(state, extra);
        load_seg(state, bus, SegReg::Cs, selector)?;
        state.segments.cs.access = 0x9B;
        state.update_mode();
        branch_to(state, offset, size);
        bus.sync(state);
        return Ok(Control::Branch);
    }

    let rpl = (selector & 3) as u8;
    if rpl < state.cpl {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    if rpl == state.cpl {
        adjust(state, extra);
        load_cs_checked(state, bus, selector, rpl)?;
        branch_to(state, offset, size);
        bus.sync(state);
        return Ok(Control::Branch);
    }
    // Return to an outer ring: the inner stack also holds SS:ESP.
    adjust(state, extra);
    let new_esp = pop(state, bus, size)?;
    let new_ss = pop(state, bus, size)? as u16;
    load_cs_checked(state, bus, selector, rpl)?;
    load_seg(state, bus, SegReg::Ss, new_ss)?;
    state.set_esp(new_esp);
    drop_invalid_segments(state);
    branch_to(state, offset, size);
    bus.sync(state);
    Ok(Control::Branch)
}

/// After lowering privilege, data segments whose DPL is above the new CPL
/// are force-invalidated (the hardware nulls them).
fn drop_invalid_segments(state: &mut CpuState) {
    for reg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
        let seg = *state.segments.get(reg);
        if seg.valid && !seg.is_code() && seg.dpl() < state.cpl {
            let s = state.segments.get_mut(reg);
            s.valid = false;
            s.selector = 0;
        }
    }
}

fn iret(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    instr: &Instr,
) -> Result<Control, Exception> {
    let size = instr.size;
    if state.vm86() {
        if state.iopl() != 3 {
            return Err(Exception::gp0());
        }
        let offset = pop(state, bus, size)?;
        let selector = pop(state, bus, size)? as u16;
        let flags = pop(state, bus, size)?;
        load_seg(state, bus, SegReg::Cs, selector)?;
        // VM and IOPL cannot change from VM86.
        let mask = if size == OpSize::Word { 0xFFFF } else { 0xFFFF_FFFF };
        let keep = Eflags::VM.bits() | Eflags::IOPL.bits();
        state.set_eflags_masked(flags, mask & !keep);
        branch_to(state, offset, size);
        bus.sync(state);
        return Ok(Control::Branch);
    }
    if !state.protected_mode() {
        let offset = pop(state, bus, size)?;
        let selector = pop(state, bus, size)? as u16;
        let flags = pop(state, bus, size)?;
        load_seg(state, bus, SegReg::Cs, selector)?;
        let mask = if size == OpSize::Word { 0xFFFF } else { 0x00FF_FFFF };
        state.set_eflags_masked(flags, mask);
        branch_to(state, offset, size);
        bus.sync(state);
        return Ok(Control::Branch);
    }

    if state.flag(Eflags::NT) {
        // Hardware task returns are not modelled.
        return Err(Exception::gp0());
    }
    let offset = pop(state, bus, size)?;
    let selector = pop(state, bus, size)? as u16;
    let flags = pop(state, bus, size)?;

    if size == OpSize::Dword && flags & Eflags::VM.bits() != 0 && state.cpl == 0 {
        // Resuming a VM86 task: the remainder of the frame restores the
        // 16-bit world.
        let new_esp = pop(state, bus, OpSize::Dword)?;
        let new_ss = pop(state, bus, OpSize::Dword)? as u16;
        let new_es = pop(state, bus, OpSize::Dword)? as u16;
        let new_ds = pop(state, bus, OpSize::Dword)? as u16;
        let new_fs = pop(state, bus, OpSize::Dword)? as u16;
        let new_gs = pop(state, bus, OpSize::Dword)? as u16;
        state.set_eflags(flags | Eflags::VM.bits());
        for (reg, sel) in [
            (SegReg::Cs, selector),
            (SegReg::Ss, new_ss),
            (SegReg::Es, new_es),
            (SegReg::Ds, new_ds),
            (SegReg::Fs, new_fs),
            (SegReg::Gs, new_gs),
        ] {
            *state.segments.get_mut(reg) = Segment::real_mode(sel);
        }
        state.cpl = 3;
        state.update_mode();
        state.set_esp(new_esp);
        branch_to(state, offset, OpSize::Word);
        bus.sync(state);
        return Ok(Control::Branch);
    }

    let rpl = (selector & 3) as u8;
    if rpl < state.cpl {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let outer = rpl > state.cpl;
    let (new_esp, new_ss) = if outer {
        (pop(state, bus, size)?, pop(state, bus, size)? as u16)
    } else {
        (0, 0)
    };
    let old_cpl = state.cpl;
    load_cs_checked(state, bus, selector, rpl)?;
    // Privileged flag bits are gated on the *previous* CPL.
    let mut mask = if size == OpSize::Word { 0xFFFF } else { EFLAGS_RESTORE_MASK };
    if old_cpl != 0 {
        mask &= !Eflags::IOPL.bits();
        if old_cpl as u32 > (state.eflags() >> 12 & 3) {
            mask &= !Eflags::IF.bits();
        }
    }
    state.set_eflags_masked(flags, mask);
    if outer {
        load_seg(state, bus, SegReg::Ss, new_ss)?;
        state.set_esp(new_esp);
        drop_invalid_segments(state);
    }
    branch_to(state, offset, size);
    bus.sync(state);
    Ok(Control::Branch)
}

const EFLAGS_RESTORE_MASK: u32 = 0x003F_7FD5 & !Eflags::VM.bits();

fn software_int(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    _instr: &Instr,
    vector: u8,
    next_eip: u32,
) -> Result<Control, Exception> {
    if state.vm86() && state.iopl() != 3 {
        return Err(Exception::gp0());
    }
    deliver_soft_vector(state, bus, vector, next_eip)
}

fn deliver_soft_vector(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    next_eip: u32,
) -> Result<Control, Exception> {
    // A fault while vectoring must leave the INT instruction restartable.
    let saved_eip = state.eip();
    let saved_esp = state.esp();
    let saved_cs = state.segments.cs;
    let saved_ss = state.segments.ss;
    let saved_cpl = state.cpl;
    state.set_eip(next_eip);
    if let Err(e) = deliver_interrupt(state, bus, vector, EventKind::Software, None) {
        state.set_eip(saved_eip);
        state.set_esp(saved_esp);
        state.segments.cs = saved_cs;
        state.segments.ss = saved_ss;
        state.cpl = saved_cpl;
        state.update_mode();
        return Err(e);
    }
    Ok(Control::Branch)
}

/// Vectors an event through the IVT (real mode) or the IDT. On entry EIP
/// must already hold the return address to push.
pub fn deliver_interrupt(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    kind: EventKind,
    error_code: Option<u32>,
) -> Result<(), Exception> {
    state.halted = false;
    if !state.protected_mode() {
        return deliver_real(state, bus, vector);
    }
    deliver_protected(state, bus, vector, kind, error_code)
}

fn deliver_real(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
) -> Result<(), Exception> {
    let entry = (vector as u32) * 4;
    if entry + 3 > state.tables.idtr.limit as u32 {
        return Err(Exception::GeneralProtection(entry as u16 + 2));
    }
    let addr = state.tables.idtr.base.wrapping_add(entry);
    let offset = bus.read_u16(addr, false)?;
    let segment = bus.read_u16(addr.wrapping_add(2), false)?;
    let flags = state.eflags();
    let old_cs = state.segments.cs.selector as u32;
    let old_ip = state.eip() & 0xFFFF;
    push(state, bus, flags & 0xFFFF, OpSize::Word)?;
    push(state, bus, old_cs, OpSize::Word)?;
    push(state, bus, old_ip, OpSize::Word)?;
    state.set_eflags(flags & !(Eflags::IF.bits() | Eflags::TF.bits() | Eflags::AC.bits()));
    state.segments.cs = Segment::real_mode(segment);
    state.segments.cs.access = 0x9B;
    state.update_mode();
    state.set_eip(offset as u32);
    bus.sync(state);
    Ok(())
}

fn deliver_protected(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    vector: u8,
    kind: EventKind,
    error_code: Option<u32>,
) -> Result<(), Exception> {
    let entry = (vector as u32) * 8;
    let ext_bit = (kind != EventKind::Software) as u16;
    if entry + 7 > state.tables.idtr.limit as u32 {
        return Err(Exception::GeneralProtection(entry as u16 | 2 | ext_bit));
    }
    let gate_addr = state.tables.idtr.base.wrapping_add(entry);
    let low = bus.read_u32(gate_addr, false)?;
    let high = bus.read_u32(gate_addr.wrapping_add(4), false)?;

    let gate_type = (high >> 8 & 0x1F) as u8;
    let gate_dpl = (high >> 13 & 3) as u8;
    let present = high & 0x8000 != 0;
    let (is_32, clears_if) = match gate_type {
        0x06 => (false, true),  // 16-bit interrupt gate
        0x07 => (false, false), // 16-bit trap gate
        0x0E => (true, true),
        0x0F => (true, false),
        0x05 => {
            // Task gates require hardware task switching.
            return Err(Exception::GeneralProtection(entry as u16 | 2 | ext_bit));
        }
        _ => return Err(Exception::GeneralProtection(entry as u16 | 2 | ext_bit)),
    };
    if kind == EventKind::Software && gate_dpl < state.cpl {
        return Err(Exception::GeneralProtection(entry as u16 | 2));
    }
    if !present {
        return Err(Exception::SegmentNotPresent(entry as u16 | 2 | ext_bit));
    }

    let selector = (low >> 16) as u16;
    let offset = low & 0xFFFF | high & 0xFFFF_0000;
    let offset = if is_32 { offset } else { offset & 0xFFFF };
    if selector & !3 == 0 {
        return Err(Exception::GeneralProtection(ext_bit));
    }
    let desc = read_descriptor(state, bus, selector)?;
    let seg = desc.to_segment(selector);
    if !seg.is_code() || !desc.present() {
        return Err(Exception::GeneralProtection(selector & !3 | ext_bit));
    }
    let target_dpl = if seg.code_conforming() {
        state.cpl
    } else {
        seg.dpl()
    };
    if target_dpl > state.cpl {
        return Err(Exception::GeneralProtection(selector & !3 | ext_bit));
    }

    let from_vm86 = state.vm86();
    let old_flags = state.eflags();
    let old_cs = state.segments.cs.selector;
    let old_eip = state.eip();
    let old_ss = state.segments.ss.selector;
    let old_esp = state.esp();
    let push_size = if is_32 { OpSize::Dword } else { OpSize::Word };

    if target_dpl < state.cpl || from_vm86 {
        if from_vm86 && target_dpl != 0 {
            return Err(Exception::GeneralProtection(selector & !3 | ext_bit));
        }
        // Ring transition: the new stack comes from the TSS.
        let (new_ss, new_esp) = read_tss_stack(state, bus, target_dpl)?;
        // Leave VM86 before loading the ring-0 segments.
        if from_vm86 {
            state.set_eflags(old_flags & !Eflags::VM.bits());
            state.update_mode();
        }
        state.cpl = target_dpl;
        crate::seg::load_seg_protected(state, bus, SegReg::Ss, new_ss)
            .map_err(|_| Exception::InvalidTss(new_ss & !3))?;
        state.set_esp(new_esp);
        if from_vm86 {
            let old = [
                state.segments.gs.selector,
                state.segments.fs.selector,
                state.segments.ds.selector,
                state.segments.es.selector,
            ];
            for sel in old {
                push(state, bus, sel as u32, push_size)?;
            }
            for reg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                let s = state.segments.get_mut(reg);
                s.selector = 0;
                s.valid = false;
            }
        }
        push(state, bus, old_ss as u32, push_size)?;
        push(state, bus, old_esp, push_size)?;
    }

    push(state, bus, old_flags, push_size)?;
    push(state, bus, old_cs as u32, push_size)?;
    push(state, bus, old_eip, push_size)?;
    if let Some(code) = error_code {
        push(state, bus, code, push_size)?;
    }

    load_cs_checked(state, bus, selector, target_dpl)?;
    let mut new_flags = state.eflags() & !(Eflags::TF.bits() | Eflags::NT.bits() | Eflags::RF.bits() | Eflags::VM.bits());
    if clears_if {
        new_flags &= !Eflags::IF.bits();
    }
    state.set_eflags(new_flags);
    state.set_eip(offset);
    bus.sync(state);
    Ok(())
}

/// SS:ESP for a privilege level from the current TSS (32-bit layout).
fn read_tss_stack(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    dpl: u8,
) -> Result<(u16, u32), Exception> {
    let tr = state.tables.tr;
    if !tr.valid || tr.selector & !3 == 0 {
        return Err(Exception::InvalidTss(tr.selector & !3));
    }
    let offset = 4 + dpl as u32 * 8;
    if offset + 5 > tr.limit {
        return Err(Exception::InvalidTss(tr.selector & !3));
    }
    let esp = bus.read_u32(tr.base.wrapping_add(offset), false)?;
    let ss = bus.read_u16(tr.base.wrapping_add(offset + 4), false)?;
    Ok((ss, esp))
}
