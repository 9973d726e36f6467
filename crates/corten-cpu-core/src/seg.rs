//! Segmentation: selector loads, descriptor-cache population and the
//! protection checks that happen at load time (never per access).

use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuState, SegReg, Segment};

/// Raw 8-byte descriptor split into its two dwords.
#[derive(Debug, Clone, Copy)]
pub struct RawDescriptor {
    pub low: u32,
    pub high: u32,
}

impl RawDescriptor {
    pub fn base(&self) -> u32 {
        self.low >> 16 | (self.high & 0xFF) << 16 | self.high & 0xFF00_0000
    }

    pub fn limit(&self) -> u32 {
        let raw = self.low & 0xFFFF | self.high & 0x000F_0000;
        if self.high & 0x0080_0000 != 0 {
            raw << 12 | 0xFFF
        } else {
            raw
        }
    }

    /// Access byte plus attribute nibble, in `Segment::access` layout.
    pub fn access(&self) -> u16 {
        (self.high >> 8 & 0xFF) as u16 | (self.high >> 16 & 0xF000) as u16
    }

    pub fn dpl(&self) -> u8 {
        (self.high >> 13 & 3) as u8
    }

    pub fn present(&self) -> bool {
        self.high & 0x8000 != 0
    }

    pub fn system_type(&self) -> u8 {
        (self.high >> 8 & 0x1F) as u8
    }

    pub fn to_segment(&self, selector: u16) -> Segment {
        Segment {
            selector,
            base: self.base(),
            limit: self.limit(),
            access: self.access(),
            valid: true,
        }
    }
}

/// Reads an 8-byte descriptor for `selector` from the GDT or LDT.
pub fn read_descriptor(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    selector: u16,
) -> Result<RawDescriptor, Exception> {
    let index = (selector & !7) as u32;
    let (base, limit) = if selector & 4 != 0 {
        if !state.tables.ldtr.valid || state.tables.ldtr.selector & !7 == 0 {
            return Err(Exception::GeneralProtection(selector & !3));
        }
        (state.tables.ldtr.base, state.tables.ldtr.limit)
    } else {
        (state.tables.gdtr.base, state.tables.gdtr.limit as u32)
    };
    if index + 7 > limit {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let addr = base.wrapping_add(index);
    let low = bus.read_u32(addr, false)?;
    let high = bus.read_u32(addr.wrapping_add(4), false)?;
    Ok(RawDescriptor { low, high })
}

/// Writes back the accessed bit of a loaded descriptor.
fn set_accessed(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    selector: u16,
    desc: &RawDescriptor,
) -> Result<(), Exception> {
    if desc.high & 0x100 != 0 {
        return Ok(());
    }
    let base = if selector & 4 != 0 {
        state.tables.ldtr.base
    } else {
        state.tables.gdtr.base
    };
    let addr = base.wrapping_add((selector & !7) as u32) + 4;
    bus.write_u32(addr, desc.high | 0x100, false)
}

/// Loads a data-capable segment register (ES/SS/DS/FS/GS) in protected
/// mode with full checks. CS is loaded only by control transfers.
pub fn load_seg_protected(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    reg: SegReg,
    selector: u16,
) -> Result<(), Exception> {
    debug_assert!(reg != SegReg::Cs);
    let rpl = (selector & 3) as u8;
    if selector & !3 == 0 {
        // Null selector: legal except for SS; access faults later.
        if reg == SegReg::Ss {
            return Err(Exception::gp0());
        }
        *state.segments.get_mut(reg) = Segment {
            selector,
            base: 0,
            limit: 0,
            access: 0,
            valid: false,
        };
        return Ok(());
    }
    let desc = read_descriptor(state, bus, selector)?;
    if desc.access() & 0x10 == 0 {
        // System descriptor in a data slot.
        return Err(Exception::GeneralProtection(selector & !3));
    }
    let seg = desc.to_segment(selector);
    if reg == SegReg::Ss {
        if rpl != state.cpl || seg.dpl() != state.cpl || !seg.data_writable() {
            return Err(Exception::GeneralProtection(selector & !3));
        }
        if !desc.present() {
            return Err(Exception::StackFault(selector & !3));
        }
    } else {
        let readable = !seg.is_code() || seg.code_readable();
        if !readable {
            return Err(Exception::GeneralProtection(selector & !3));
        }
        // Data and non-conforming code: DPL must dominate CPL and RPL.
        if !seg.code_conforming() && seg.dpl() < state.cpl.max(rpl) {
            return Err(Exception::GeneralProtection(selector & !3));
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(selector & !3));
        }
    }
    set_accessed(state, bus, selector, &desc)?;
    *state.segments.get_mut(reg) = seg;
    if reg == SegReg::Ss {
        state.update_mode();
    }
    Ok(())
}

/// Selector load in any mode; real and VM86 loads just reload the cache
/// base.
pub fn load_seg(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    reg: SegReg,
    selector: u16,
) -> Result<(), Exception> {
    if state.protected_mode() && !state.vm86() {
        load_seg_protected(state, bus, reg, selector)
    } else {
        *state.segments.get_mut(reg) = Segment::real_mode(selector);
        if reg == SegReg::Ss {
            // MOV/POP SS holds off interrupts for one instruction.
            state.interrupt_shadow = true;
            state.update_mode();
        }
        Ok(())
    }
}

/// Loads CS for a far control transfer (JMP/CALL/RET/IRET paths supply
/// their own RPL/CPL policy; this validates the descriptor itself).
pub fn load_cs_checked(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    selector: u16,
    new_cpl: u8,
) -> Result<(), Exception> {
    if !state.protected_mode() || state.vm86() {
        state.segments.cs = Segment::real_mode(selector);
        state.segments.cs.access = 0x9B;
        state.update_mode();
        return Ok(());
    }
    if selector & !3 == 0 {
        return Err(Exception::gp0());
    }
    let desc = read_descriptor(state, bus, selector)?;
    let seg = desc.to_segment(selector);
    if !seg.is_code() {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    if !desc.present() {
        return Err(Exception::SegmentNotPresent(selector & !3));
    }
    if seg.code_conforming() {
        if seg.dpl() > new_cpl {
            return Err(Exception::GeneralProtection(selector & !3));
        }
    } else if seg.dpl() != new_cpl {
        return Err(Exception::GeneralProtection(selector & !3));
    }
    set_accessed(state, bus, selector, &desc)?;
    state.segments.cs = seg;
    state.segments.cs.selector = selector & !3 | new_cpl as u16;
    state.cpl = new_cpl;
    state.update_mode();
    Ok(())
}

/// Linear address for an access through a segment, with limit checking.
pub fn seg_linear(
    state: &CpuState,
    reg: SegReg,
    offset: u32,
    len: u32,
    write: bool,
) -> Result<u32, Exception> {
    let seg = state.segments.get(reg);
    if state.protected_mode() && !state.vm86() {
        if !seg.valid {
            return Err(if reg == SegReg::Ss {
                Exception::StackFault(0)
            } else {
                Exception::gp0()
            });
        }
        if write && (seg.is_code() || !seg.data_writable()) {
            return Err(if reg == SegReg::Ss {
                Exception::StackFault(0)
            } else {
                Exception::gp0()
            });
        }
        let end = offset.wrapping_add(len.saturating_sub(1));
        let out_of_bounds = if seg.data_expand_down() {
            offset <= seg.limit
        } else {
            end < offset || end > seg.limit
        };
        if out_of_bounds {
            return Err(if reg == SegReg::Ss {
                Exception::StackFault(0)
            } else {
                Exception::gp0()
            });
        }
    }
    Ok(seg.base.wrapping_add(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_descriptor_fields() {
        // Flat 4 GiB 32-bit code descriptor.
        let desc = RawDescriptor {
            low: 0x0000_FFFF,
            high: 0x00CF_9B00,
        };
        assert_eq!(desc.base(), 0);
        assert_eq!(desc.limit(), 0xFFFF_FFFF);
        assert_eq!(desc.access() & 0xFF, 0x9B);
        assert!(desc.present());
        assert_eq!(desc.dpl(), 0);
        let seg = desc.to_segment(0x08);
        assert!(seg.is_code());
        assert!(seg.db());

        // 16-bit data at base 0x12345.
        let desc = RawDescriptor {
            low: 0x2345_FFFF,
            high: 0x0000_9301,
        };
        assert_eq!(desc.base(), 0x1_2345);
        assert_eq!(desc.limit(), 0xFFFF);
        let seg = desc.to_segment(0x10);
        assert!(!seg.is_code());
        assert!(seg.data_writable());
        assert!(!seg.db());
    }
}
