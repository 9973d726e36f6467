//! Architectural register state.

use bitflags::bitflags;
use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_VME: u32 = 1 << 0;
pub const CR4_TSD: u32 = 1 << 2;
pub const CR4_PSE: u32 = 1 << 4;
pub const CR4_PAE: u32 = 1 << 5;
pub const CR4_PGE: u32 = 1 << 7;
pub const CR4_OSFXSR: u32 = 1 << 9;
pub const CR4_OSXMMEXCPT: u32 = 1 << 10;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
        const AC = 1 << 18;
        const VIF = 1 << 19;
        const VIP = 1 << 20;
        const ID = 1 << 21;
    }
}

/// Bits that exist on this CPU model; everything else reads back as the
/// fixed reserved pattern.
pub const EFLAGS_VALID: u32 = 0x003F_7FD5;
pub const EFLAGS_FIXED: u32 = 0x0000_0002;

/// GPR indices in ModRM encoding order.
pub mod gpr {
    pub const EAX: u8 = 0;
    pub const ECX: u8 = 1;
    pub const EDX: u8 = 2;
    pub const EBX: u8 = 3;
    pub const ESP: u8 = 4;
    pub const EBP: u8 = 5;
    pub const ESI: u8 = 6;
    pub const EDI: u8 = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub fn from_index(i: u8) -> Option<SegReg> {
        match i {
            0 => Some(SegReg::Es),
            1 => Some(SegReg::Cs),
            2 => Some(SegReg::Ss),
            3 => Some(SegReg::Ds),
            4 => Some(SegReg::Fs),
            5 => Some(SegReg::Gs),
            _ => None,
        }
    }
}

/// Segment register with its shadow descriptor cache. The cache is loaded
/// and validated at selector-load time; ordinary accesses only consult the
/// cached base/limit/attributes.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    /// Access byte plus the high attribute nibble (G/DB/AVL) in bits 8..
    pub access: u16,
    pub valid: bool,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            selector: 0,
            base: 0,
            limit: 0xFFFF,
            access: 0x93, // present writable data
            valid: true,
        }
    }
}

impl Segment {
    pub fn dpl(&self) -> u8 {
        (self.access >> 5 & 3) as u8
    }

    pub fn present(&self) -> bool {
        self.access & 0x80 != 0
    }

    pub fn is_code(&self) -> bool {
        self.access & 0x18 == 0x18
    }

    pub fn is_system(&self) -> bool {
        self.access & 0x10 == 0
    }

    pub fn code_conforming(&self) -> bool {
        self.access & 0x1C == 0x1C
    }

    pub fn code_readable(&self) -> bool {
        self.access & 0x1A == 0x1A
    }

    pub fn data_writable(&self) -> bool {
        self.access & 0x1A == 0x12
    }

    pub fn data_expand_down(&self) -> bool {
        self.access & 0x1C == 0x14
    }

    /// Default-operation-size bit (D/B).
    pub fn db(&self) -> bool {
        self.access & 0x4000 != 0
    }

    /// Flat real-mode style descriptor for a raw selector.
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            access: 0x93,
            valid: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Segments {
    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
}

impl Segments {
    pub fn get(&self, reg: SegReg) -> &Segment {
        match reg {
            SegReg::Es => &self.es,
            SegReg::Cs => &self.cs,
            SegReg::Ss => &self.ss,
            SegReg::Ds => &self.ds,
            SegReg::Fs => &self.fs,
            SegReg::Gs => &self.gs,
        }
    }

    pub fn get_mut(&mut self, reg: SegReg) -> &mut Segment {
        match reg {
            SegReg::Es => &mut self.es,
            SegReg::Cs => &mut self.cs,
            SegReg::Ss => &mut self.ss,
            SegReg::Ds => &mut self.ds,
            SegReg::Fs => &mut self.fs,
            SegReg::Gs => &mut self.gs,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DescTable {
    pub base: u32,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tables {
    pub gdtr: DescTable,
    pub idtr: DescTable,
    pub ldtr: Segment,
    pub tr: Segment,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Control {
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Msrs {
    pub sysenter_cs: u32,
    pub sysenter_esp: u32,
    pub sysenter_eip: u32,
    pub apic_base: u64,
    pub tsc: u64,
    pub mtrr_fixed: [u64; 11],
    pub mtrr_variable: [u64; 16],
    pub mtrr_deftype: u64,
    pub pat: u64,
}

impl Default for Msrs {
    fn default() -> Self {
        Self {
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            apic_base: 0xFEE0_0000 | 0x900, // enabled + BSP
            tsc: 0,
            mtrr_fixed: [0; 11],
            mtrr_variable: [0; 16],
            mtrr_deftype: 0,
            pat: 0x0007_0406_0007_0406,
        }
    }
}

/// Last-arithmetic-operation record; the status flags are folded into the
/// flat EFLAGS image only on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    /// Flags are current in the EFLAGS image.
    Known,
    Add,
    Adc,
    Sub,
    Sbb,
    Logic,
    /// INC/DEC preserve CF; the recorded CF lives in EFLAGS.
    Inc,
    Dec,
}

#[derive(Debug, Clone, Copy)]
pub struct LazyFlags {
    pub op: FlagOp,
    pub size: OpSize,
    pub src1: u32,
    pub src2: u32,
    pub result: u32,
    /// Carry-in for ADC/SBB.
    pub carry_in: u32,
}

impl Default for LazyFlags {
    fn default() -> Self {
        Self {
            op: FlagOp::Known,
            size: OpSize::Dword,
            src1: 0,
            src2: 0,
            result: 0,
            carry_in: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    Byte,
    Word,
    Dword,
}

impl OpSize {
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            OpSize::Byte => 8,
            OpSize::Word => 16,
            OpSize::Dword => 32,
        }
    }

    #[inline]
    pub fn mask(self) -> u32 {
        match self {
            OpSize::Byte => 0xFF,
            OpSize::Word => 0xFFFF,
            OpSize::Dword => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }
}

/// x87 register bank plus the MMX alias view.
#[derive(Debug, Clone, Copy)]
pub struct Fpu {
    /// Physical registers as 80-bit little-endian images.
    pub regs: [[u8; 10]; 8],
    pub control: u16,
    pub status: u16,
    pub tag: u16,
    pub opcode: u16,
    pub last_ip: u32,
    pub last_cs: u16,
    pub last_dp: u32,
    pub last_ds: u16,
}

impl Default for Fpu {
    fn default() -> Self {
        Self {
            regs: [[0; 10]; 8],
            control: 0x037F,
            status: 0,
            tag: 0xFFFF,
            opcode: 0,
            last_ip: 0,
            last_cs: 0,
            last_dp: 0,
            last_ds: 0,
        }
    }
}

impl Fpu {
    pub fn top(&self) -> u8 {
        (self.status >> 11 & 7) as u8
    }

    pub fn set_top(&mut self, top: u8) {
        self.status = self.status & !0x3800 | ((top as u16 & 7) << 11);
    }

    /// Physical register index for ST(i).
    pub fn st_phys(&self, i: u8) -> usize {
        ((self.top() + i) & 7) as usize
    }

    pub fn tag_of(&self, phys: usize) -> u8 {
        (self.tag >> (phys * 2) & 3) as u8
    }

    pub fn set_tag(&mut self, phys: usize, tag: u8) {
        self.tag = self.tag & !(3 << (phys * 2)) | ((tag as u16 & 3) << (phys * 2));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sse {
    pub xmm: [[u32; 4]; 8],
    pub mxcsr: u32,
}

impl Default for Sse {
    fn default() -> Self {
        Self {
            xmm: [[0; 4]; 8],
            mxcsr: 0x1F80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
}

pub struct CpuState {
    pub gpr: [u32; 8],
    pub segments: Segments,
    pub tables: Tables,
    pub control: Control,
    pub dr: [u32; 8],
    pub msr: Msrs,
    pub fpu: Fpu,
    pub sse: Sse,
    eflags: u32,
    pub lazy: LazyFlags,
    eip: u32,
    pub cpl: u8,
    /// Derived mode bits, refreshed by `update_mode`.
    code32: bool,
    stack32: bool,
    vm86: bool,
    /// One-instruction interrupt shadow (MOV SS / STI).
    pub interrupt_shadow: bool,
    pub halted: bool,
    /// A20 view, mirrored from the platform gate at sync time.
    pub a20_enabled: bool,
}

impl CpuState {
    pub fn new(mode: CpuMode) -> Self {
        let mut state = Self {
            gpr: [0; 8],
            segments: Segments::default(),
            tables: Tables::default(),
            control: Control::default(),
            dr: [0, 0, 0, 0, 0, 0, 0xFFFF_0FF0, 0x0000_0400],
            msr: Msrs::default(),
            fpu: Fpu::default(),
            sse: Sse::default(),
            eflags: EFLAGS_FIXED,
            lazy: LazyFlags::default(),
            eip: 0,
            cpl: 0,
            code32: false,
            stack32: false,
            vm86: false,
            interrupt_shadow: false,
            halted: false,
            a20_enabled: false,
        };
        // Architectural reset values: descriptor tables at 0 with a 64 KiB
        // limit, which is what makes the real-mode IVT reachable.
        state.tables.gdtr.limit = 0xFFFF;
        state.tables.idtr.limit = 0xFFFF;
        if mode == CpuMode::Protected {
            state.control.cr0 |= CR0_PE;
            // Flat 32-bit descriptors, ring 0.
            for seg in [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                *state.segments.get_mut(seg) = Segment {
                    selector: if seg == SegReg::Cs { 0x08 } else { 0x10 },
                    base: 0,
                    limit: 0xFFFF_FFFF,
                    access: if seg == SegReg::Cs { 0x409B } else { 0x4093 },
                    valid: true,
                };
            }
        }
        state.update_mode();
        state
    }

    /// Power-on reset: real mode at F000:FFF0.
    pub fn reset(&mut self) {
        let a20 = self.a20_enabled;
        *self = CpuState::new(CpuMode::Real);
        self.segments.cs = Segment {
            selector: 0xF000,
            base: 0xF_0000,
            limit: 0xFFFF,
            access: 0x9B,
            valid: true,
        };
        self.eip = 0xFFF0;
        self.a20_enabled = a20;
    }

    // -- instruction pointer ----------------------------------------------

    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip;
    }

    pub fn linear_eip(&self) -> u32 {
        self.segments.cs.base.wrapping_add(self.eip)
    }

    // -- general registers -------------------------------------------------

    #[inline]
    pub fn read_reg32(&self, reg: u8) -> u32 {
        self.gpr[reg as usize]
    }

    #[inline]
    pub fn write_reg32(&mut self, reg: u8, value: u32) {
        self.gpr[reg as usize] = value;
    }

    #[inline]
    pub fn read_reg16(&self, reg: u8) -> u16 {
        self.gpr[reg as usize] as u16
    }

    #[inline]
    pub fn write_reg16(&mut self, reg: u8, value: u16) {
        let r = &mut self.gpr[reg as usize];
        *r = *r & 0xFFFF_0000 | value as u32;
    }

    /// Byte registers: 0-3 are AL/CL/DL/BL, 4-7 are AH/CH/DH/BH.
    #[inline]
    pub fn read_reg8(&self, reg: u8) -> u8 {
        let v = self.gpr[(reg & 3) as usize];
        if reg < 4 {
            v as u8
        } else {
            (v >> 8) as u8
        }
    }

    #[inline]
    pub fn write_reg8(&mut self, reg: u8, value: u8) {
        let r = &mut self.gpr[(reg & 3) as usize];
        if reg < 4 {
            *r = *r & !0xFF | value as u32;
        } else {
            *r = *r & !0xFF00 | (value as u32) << 8;
        }
    }

    pub fn read_reg(&self, reg: u8, size: OpSize) -> u32 {
        match size {
            OpSize::Byte => self.read_reg8(reg) as u32,
            OpSize::Word => self.read_reg16(reg) as u32,
            OpSize::Dword => self.read_reg32(reg),
        }
    }

    pub fn write_reg(&mut self, reg: u8, value: u32, size: OpSize) {
        match size {
            OpSize::Byte => self.write_reg8(reg, value as u8),
            OpSize::Word => self.write_reg16(reg, value as u16),
            OpSize::Dword => self.write_reg32(reg, value),
        }
    }

    // -- flags -------------------------------------------------------------

    fn parity_even(value: u8) -> bool {
        value.count_ones() % 2 == 0
    }

    /// Folds the lazy record into the flat EFLAGS image.
    pub fn materialize_flags(&mut self) {
        let lazy = self.lazy;
        if lazy.op == FlagOp::Known {
            return;
        }
        let size = lazy.size;
        let mask = size.mask();
        let sign = size.sign_bit();
        let result = lazy.result & mask;
        let src1 = lazy.src1 & mask;
        let src2 = lazy.src2 & mask;

        let mut flags = Eflags::from_bits_truncate(self.eflags);
        let keep_cf = flags.contains(Eflags::CF);
        flags.remove(
            Eflags::CF | Eflags::PF | Eflags::AF | Eflags::ZF | Eflags::SF | Eflags::OF,
        );
        flags.set(Eflags::ZF, result == 0);
        flags.set(Eflags::SF, result & sign != 0);
        flags.set(Eflags::PF, Self::parity_even(result as u8));

        match lazy.op {
            FlagOp::Add | FlagOp::Adc => {
                let full = src1 as u64 + src2 as u64 + lazy.carry_in as u64;
                flags.set(Eflags::CF, full > mask as u64);
                flags.set(Eflags::AF, (src1 ^ src2 ^ result) & 0x10 != 0);
                flags.set(Eflags::OF, (src1 ^ result) & (src2 ^ result) & sign != 0);
            }
            FlagOp::Sub | FlagOp::Sbb => {
                let rhs = src2 as u64 + lazy.carry_in as u64;
                flags.set(Eflags::CF, (src1 as u64) < rhs);
                flags.set(Eflags::AF, (src1 ^ src2 ^ result) & 0x10 != 0);
                flags.set(Eflags::OF, (src1 ^ src2) & (src1 ^ result) & sign != 0);
            }
            FlagOp::Logic => {
                // CF and OF cleared, AF undefined (cleared).
            }
            FlagOp::Inc => {
                flags.set(Eflags::CF, keep_cf);
                flags.set(Eflags::AF, result & 0x0F == 0);
                flags.set(Eflags::OF, result == sign);
            }
            FlagOp::Dec => {
                flags.set(Eflags::CF, keep_cf);
                flags.set(Eflags::AF, result & 0x0F == 0x0F);
                flags.set(Eflags::OF, result == sign.wrapping_sub(1) & mask);
            }
            FlagOp::Known => unreachable!(),
        }
        self.eflags = flags.bits() | EFLAGS_FIXED;
        self.lazy.op = FlagOp::Known;
    }

    pub fn eflags(&mut self) -> u32 {
        self.materialize_flags();
        self.eflags | EFLAGS_FIXED
    }

    /// Raw image without materializing; only for state dumps.
    pub fn eflags_image(&self) -> u32 {
        self.eflags
    }

    pub fn set_eflags(&mut self, value: u32) {
        self.eflags = value & EFLAGS_VALID | EFLAGS_FIXED;
        self.lazy.op = FlagOp::Known;
        self.update_mode();
    }

    /// Writes with a bit mask, as POPF/IRET with privilege rules do.
    pub fn set_eflags_masked(&mut self, value: u32, mask: u32) {
        let current = self.eflags();
        self.set_eflags(current & !mask | value & mask);
    }

    pub fn flag(&mut self, flag: Eflags) -> bool {
        self.materialize_flags();
        Eflags::from_bits_truncate(self.eflags).contains(flag)
    }

    pub fn set_flag(&mut self, flag: Eflags, value: bool) {
        self.materialize_flags();
        let mut f = Eflags::from_bits_truncate(self.eflags);
        f.set(flag, value);
        self.eflags = f.bits() | EFLAGS_FIXED;
    }

    /// IF without materializing (it is never lazy).
    #[inline]
    pub fn if_enabled(&self) -> bool {
        self.eflags & Eflags::IF.bits() != 0
    }

    pub fn iopl(&self) -> u8 {
        (self.eflags >> 12 & 3) as u8
    }

    // -- modes -------------------------------------------------------------

    pub fn protected_mode(&self) -> bool {
        self.control.cr0 & CR0_PE != 0
    }

    pub fn paging_enabled(&self) -> bool {
        self.control.cr0 & CR0_PG != 0
    }

    pub fn vm86(&self) -> bool {
        self.vm86
    }

    pub fn code32(&self) -> bool {
        self.code32
    }

    pub fn stack32(&self) -> bool {
        self.stack32
    }

    /// Effective privilege for memory access (VM86 runs at CPL 3).
    pub fn user_access(&self) -> bool {
        self.cpl == 3
    }

    /// Refreshes the derived mode bits; must run after any change to CR0,
    /// EFLAGS.VM, CPL or the CS/SS caches.
    pub fn update_mode(&mut self) {
        self.vm86 = self.eflags & Eflags::VM.bits() != 0 && self.protected_mode();
        if self.vm86 {
            self.cpl = 3;
            self.code32 = false;
            self.stack32 = false;
        } else if self.protected_mode() {
            self.code32 = self.segments.cs.db();
            self.stack32 = self.segments.ss.db();
        } else {
            self.cpl = 0;
            self.code32 = self.segments.cs.db();
            self.stack32 = self.segments.ss.db();
        }
    }

    /// Execution-mode fingerprint keying the trace cache: any transition
    /// that changes decode or privilege semantics changes the hash.
    pub fn state_hash(&self) -> u8 {
        self.code32 as u8
            | (self.stack32 as u8) << 1
            | (self.cpl & 3) << 2
            | (self.paging_enabled() as u8) << 4
            | (self.vm86 as u8) << 5
    }

    // -- stack helpers (width depends on SS.D) ------------------------------

    pub fn esp(&self) -> u32 {
        self.gpr[gpr::ESP as usize]
    }

    pub fn set_esp(&mut self, value: u32) {
        self.gpr[gpr::ESP as usize] = value;
    }

    pub fn stack_mask(&self) -> u32 {
        if self.stack32 {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }
}

impl IoSnapshot for CpuState {
    const NAME: &'static str = "cpu";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        obj.put_u32_slice("gpr", &self.gpr);
        let mut segs = StateObject::new();
        for (name, seg) in [
            ("es", &self.segments.es),
            ("cs", &self.segments.cs),
            ("ss", &self.segments.ss),
            ("ds", &self.segments.ds),
            ("fs", &self.segments.fs),
            ("gs", &self.segments.gs),
            ("ldtr", &self.tables.ldtr),
            ("tr", &self.tables.tr),
        ] {
            let mut so = StateObject::new();
            so.put_u16("selector", seg.selector);
            so.put_u32("base", seg.base);
            so.put_u32("limit", seg.limit);
            so.put_u16("access", seg.access);
            so.put_bool("valid", seg.valid);
            segs.put_object(name, so);
        }
        obj.put_object("segments", segs);
        obj.put_u32("gdtr_base", self.tables.gdtr.base);
        obj.put_u16("gdtr_limit", self.tables.gdtr.limit);
        obj.put_u32("idtr_base", self.tables.idtr.base);
        obj.put_u16("idtr_limit", self.tables.idtr.limit);
        obj.put_u32("cr0", self.control.cr0);
        obj.put_u32("cr2", self.control.cr2);
        obj.put_u32("cr3", self.control.cr3);
        obj.put_u32("cr4", self.control.cr4);
        obj.put_u32_slice("dr", &self.dr);
        obj.put_u32("sysenter_cs", self.msr.sysenter_cs);
        obj.put_u32("sysenter_esp", self.msr.sysenter_esp);
        obj.put_u32("sysenter_eip", self.msr.sysenter_eip);
        obj.put_u64("apic_base", self.msr.apic_base);
        obj.put_u64("tsc", self.msr.tsc);
        let mut mtrr = Vec::new();
        for v in self.msr.mtrr_fixed.iter().chain(self.msr.mtrr_variable.iter()) {
            mtrr.extend_from_slice(&v.to_le_bytes());
        }
        obj.put_bytes("mtrr", &mtrr);
        obj.put_u64("mtrr_deftype", self.msr.mtrr_deftype);
        obj.put_u64("pat", self.msr.pat);
        let mut fpu = StateObject::new();
        let mut regs = Vec::with_capacity(80);
        for r in &self.fpu.regs {
            regs.extend_from_slice(r);
        }
        fpu.put_bytes("regs", &regs);
        fpu.put_u16("control", self.fpu.control);
        fpu.put_u16("status", self.fpu.status);
        fpu.put_u16("tag", self.fpu.tag);
        fpu.put_u16("opcode", self.fpu.opcode);
        fpu.put_u32("last_ip", self.fpu.last_ip);
        fpu.put_u16("last_cs", self.fpu.last_cs);
        fpu.put_u32("last_dp", self.fpu.last_dp);
        fpu.put_u16("last_ds", self.fpu.last_ds);
        obj.put_object("fpu", fpu);
        let mut xmm = Vec::with_capacity(128);
        for r in &self.sse.xmm {
            for w in r {
                xmm.extend_from_slice(&w.to_le_bytes());
            }
        }
        obj.put_bytes("xmm", &xmm);
        obj.put_u32("mxcsr", self.sse.mxcsr);
        // Materialized view; lazy records never cross a snapshot.
        let mut probe = CpuStateFlagsProbe {
            eflags: self.eflags,
            lazy: self.lazy,
        };
        probe.materialize();
        obj.put_u32("eflags", probe.eflags);
        obj.put_u32("eip", self.eip);
        obj.put_u8("cpl", self.cpl);
        obj.put_bool("interrupt_shadow", self.interrupt_shadow);
        obj.put_bool("halted", self.halted);
        obj.put_bool("a20_enabled", self.a20_enabled);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        self.gpr = state.get_u32_array("gpr");
        if let Some(segs) = state.object("segments") {
            let mut load = |name: &str, seg: &mut Segment| {
                if let Some(so) = segs.object(name) {
                    seg.selector = so.get_u16("selector");
                    seg.base = so.get_u32("base");
                    seg.limit = so.get_u32("limit");
                    seg.access = so.get_u16("access");
                    seg.valid = so.get_bool("valid");
                }
            };
            load("es", &mut self.segments.es);
            load("cs", &mut self.segments.cs);
            load("ss", &mut self.segments.ss);
            load("ds", &mut self.segments.ds);
            load("fs", &mut self.segments.fs);
            load("gs", &mut self.segments.gs);
            load("ldtr", &mut self.tables.ldtr);
            load("tr", &mut self.tables.tr);
        }
        self.tables.gdtr.base = state.get_u32("gdtr_base");
        self.tables.gdtr.limit = state.get_u16("gdtr_limit");
        self.tables.idtr.base = state.get_u32("idtr_base");
        self.tables.idtr.limit = state.get_u16("idtr_limit");
        self.control.cr0 = state.get_u32("cr0");
        self.control.cr2 = state.get_u32("cr2");
        self.control.cr3 = state.get_u32("cr3");
        self.control.cr4 = state.get_u32("cr4");
        self.dr = state.get_u32_array("dr");
        self.msr.sysenter_cs = state.get_u32("sysenter_cs");
        self.msr.sysenter_esp = state.get_u32("sysenter_esp");
        self.msr.sysenter_eip = state.get_u32("sysenter_eip");
        self.msr.apic_base = state.get_u64("apic_base");
        self.msr.tsc = state.get_u64("tsc");
        if let Some(bytes) = state.bytes("mtrr") {
            for (i, chunk) in bytes.chunks_exact(8).enumerate() {
                let v = u64::from_le_bytes(chunk.try_into().unwrap());
                if i < 11 {
                    self.msr.mtrr_fixed[i] = v;
                } else if i < 27 {
                    self.msr.mtrr_variable[i - 11] = v;
                }
            }
        }
        self.msr.mtrr_deftype = state.get_u64("mtrr_deftype");
        self.msr.pat = state.get_u64("pat");
        if let Some(fpu) = state.object("fpu") {
            if let Some(regs) = fpu.bytes("regs") {
                for (i, chunk) in regs.chunks_exact(10).take(8).enumerate() {
                    self.fpu.regs[i].copy_from_slice(chunk);
                }
            }
            self.fpu.control = fpu.get_u16("control");
            self.fpu.status = fpu.get_u16("status");
            self.fpu.tag = fpu.get_u16("tag");
            self.fpu.opcode = fpu.get_u16("opcode");
            self.fpu.last_ip = fpu.get_u32("last_ip");
            self.fpu.last_cs = fpu.get_u16("last_cs");
            self.fpu.last_dp = fpu.get_u32("last_dp");
            self.fpu.last_ds = fpu.get_u16("last_ds");
        }
        if let Some(bytes) = state.bytes("xmm") {
            for (i, chunk) in bytes.chunks_exact(4).take(32).enumerate() {
                self.sse.xmm[i / 4][i % 4] = u32::from_le_bytes(chunk.try_into().unwrap());
            }
        }
        self.sse.mxcsr = state.get_u32("mxcsr");
        self.eflags = state.get_u32("eflags") & EFLAGS_VALID | EFLAGS_FIXED;
        self.lazy = LazyFlags::default();
        self.eip = state.get_u32("eip");
        self.cpl = state.get_u8("cpl");
        self.interrupt_shadow = state.get_bool("interrupt_shadow");
        self.halted = state.get_bool("halted");
        self.a20_enabled = state.get_bool("a20_enabled");
        self.update_mode();
        Ok(())
    }
}

/// Standalone materialization used by the (immutable) snapshot path.
struct CpuStateFlagsProbe {
    eflags: u32,
    lazy: LazyFlags,
}

impl CpuStateFlagsProbe {
    fn materialize(&mut self) {
        let mut tmp = CpuState::new(CpuMode::Real);
        tmp.eflags = self.eflags;
        tmp.lazy = self.lazy;
        tmp.materialize_flags();
        self.eflags = tmp.eflags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_register_aliasing() {
        let mut state = CpuState::new(CpuMode::Real);
        state.write_reg32(gpr::EAX, 0x1122_3344);
        assert_eq!(state.read_reg8(0), 0x44); // AL
        assert_eq!(state.read_reg8(4), 0x33); // AH
        state.write_reg8(4, 0xAB);
        assert_eq!(state.read_reg32(gpr::EAX), 0x1122_AB44);
        state.write_reg16(gpr::EAX, 0xCCDD);
        assert_eq!(state.read_reg32(gpr::EAX), 0x1122_CCDD);
    }

    #[test]
    fn lazy_add_materializes_carry_and_overflow() {
        let mut state = CpuState::new(CpuMode::Real);
        state.lazy = LazyFlags {
            op: FlagOp::Add,
            size: OpSize::Byte,
            src1: 0x7F,
            src2: 0x01,
            result: 0x80,
            carry_in: 0,
        };
        assert!(!state.flag(Eflags::CF));
        assert!(state.flag(Eflags::OF));
        assert!(state.flag(Eflags::SF));
        assert!(state.flag(Eflags::AF));

        state.lazy = LazyFlags {
            op: FlagOp::Add,
            size: OpSize::Byte,
            src1: 0xFF,
            src2: 0x01,
            result: 0x00,
            carry_in: 0,
        };
        assert!(state.flag(Eflags::CF));
        assert!(state.flag(Eflags::ZF));
        assert!(!state.flag(Eflags::OF));
    }

    #[test]
    fn lazy_sub_borrow() {
        let mut state = CpuState::new(CpuMode::Real);
        state.lazy = LazyFlags {
            op: FlagOp::Sub,
            size: OpSize::Dword,
            src1: 0,
            src2: 1,
            result: 0xFFFF_FFFF,
            carry_in: 0,
        };
        assert!(state.flag(Eflags::CF));
        assert!(state.flag(Eflags::SF));
        assert!(!state.flag(Eflags::OF));
    }

    #[test]
    fn inc_preserves_carry() {
        let mut state = CpuState::new(CpuMode::Real);
        state.set_flag(Eflags::CF, true);
        state.lazy = LazyFlags {
            op: FlagOp::Inc,
            size: OpSize::Dword,
            src1: 1,
            src2: 1,
            result: 2,
            carry_in: 0,
        };
        assert!(state.flag(Eflags::CF));
        assert!(!state.flag(Eflags::ZF));
    }

    #[test]
    fn state_hash_tracks_mode_transitions() {
        let mut state = CpuState::new(CpuMode::Real);
        let real = state.state_hash();
        state.control.cr0 |= CR0_PE;
        state.segments.cs.access |= 0x4000;
        state.update_mode();
        assert_ne!(state.state_hash(), real);
        state.control.cr0 |= CR0_PG;
        let paged = state.state_hash();
        assert_ne!(paged, real);
    }

    #[test]
    fn vm86_forces_cpl3_and_16bit() {
        let mut state = CpuState::new(CpuMode::Protected);
        let eflags = state.eflags() | Eflags::VM.bits();
        state.set_eflags(eflags);
        assert!(state.vm86());
        assert_eq!(state.cpl, 3);
        assert!(!state.code32());
        assert_eq!(state.state_hash() & 0x20, 0x20);
    }

    #[test]
    fn eflags_snapshot_materializes_lazy_state() {
        use corten_io_snapshot::IoSnapshot;
        let mut state = CpuState::new(CpuMode::Real);
        state.lazy = LazyFlags {
            op: FlagOp::Sub,
            size: OpSize::Byte,
            src1: 5,
            src2: 5,
            result: 0,
            carry_in: 0,
        };
        let snap = state.save_state();
        assert_ne!(snap.get_u32("eflags") & Eflags::ZF.bits(), 0);
    }
}
