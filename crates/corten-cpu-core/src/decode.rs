//! IA-32 instruction decoder.
//!
//! Produces a flat [`Instr`] record per instruction: operation, operand
//! descriptors, immediate/displacement data and total length. The decoder
//! is pure; effective-address arithmetic, segmentation and access checks
//! all happen at execution time.

use crate::state::{OpSize, SegReg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Invalid or unsupported encoding (#UD).
    Ud,
    /// More than 15 bytes of prefixes+encoding (#GP on real silicon).
    TooLong,
    /// The supplied window ended mid-instruction.
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rep {
    None,
    Rep,
    Repne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemRef {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// GPR; width comes from `Instr::size`.
    Reg(u8),
    Seg(SegReg),
    Mem,
    Imm(u32),
    Cr(u8),
    Dr(u8),
    Xmm(u8),
    Mmx(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sal,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedOp {
    And,
    Andn,
    Or,
    Xor,
    Add,
    Sub,
    CmpEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Op {
    Alu(Alu),
    Test,
    Not,
    Neg,
    Inc,
    Dec,
    Mul,
    Imul1,
    /// Two/three-operand IMUL (src2 holds the multiplier).
    Imul,
    Div,
    Idiv,
    Mov,
    MovSeg,
    Lea,
    Xchg,
    Movzx,
    Movsx,
    Xlat,
    Bswap,
    Xadd,
    Cmpxchg,
    Cmpxchg8b,
    Lahf,
    Sahf,
    Cbw,
    Cwd,
    Salc,
    Setcc(u8),
    Cmovcc(u8),
    Push,
    Pop,
    PushSeg(SegReg),
    PopSeg(SegReg),
    Pusha,
    Popa,
    Pushf,
    Popf,
    Enter,
    Leave,
    Shift(Shift),
    ShiftD { left: bool },
    Bit(BitOp),
    Bsf,
    Bsr,
    Strings(StringOp),
    Jmp,
    JmpFar,
    JmpFarInd,
    Jcc(u8),
    Jcxz,
    Loop,
    Loope,
    Loopne,
    Call,
    CallFar,
    CallFarInd,
    Ret { pop: u16 },
    RetFar { pop: u16 },
    Iret,
    Int(u8),
    Int3,
    Into,
    Bound,
    Arpl,
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,
    In,
    Out,
    Hlt,
    Lgdt,
    Lidt,
    Sgdt,
    Sidt,
    Lldt,
    Sldt,
    Ltr,
    Str,
    Lmsw,
    Smsw,
    Lar,
    Lsl,
    Verr,
    Verw,
    Clts,
    Invd,
    Wbinvd,
    Invlpg,
    MovToCr,
    MovFromCr,
    MovToDr,
    MovFromDr,
    Cpuid,
    Rdtsc,
    Rdmsr,
    Wrmsr,
    Sysenter,
    Sysexit,
    Nop,
    Ud2,
    Wait,
    /// Load far pointer into a segment + register (LES/LDS/LSS/LFS/LGS).
    LoadFar(SegReg),
    Aam(u8),
    Aad(u8),
    Daa,
    Das,
    Aaa,
    Aas,
    /// x87 escape; `esc` is the low three bits of the opcode (D8..DF).
    Fpu { esc: u8, modrm: u8 },
    Emms,
    Ldmxcsr,
    Stmxcsr,
    Fxsave,
    Fxrstor,
    /// MOVD/MOVQ and the aligned/unaligned 128-bit moves.
    SimdMov { width: u8 },
    PackedInt { op: PackedOp, lanes: OpSize },
    SseArith { op: FloatOp, scalar: bool, double: bool },
    Prefetch,
}

#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub op: Op,
    pub dst: Operand,
    pub src: Operand,
    pub src2: Operand,
    pub mem: MemRef,
    /// Effective segment for the memory operand.
    pub seg: SegReg,
    pub size: OpSize,
    pub addr32: bool,
    pub rep: Rep,
    pub locked: bool,
    pub len: u8,
}

impl Instr {
    fn new(op: Op) -> Self {
        Self {
            op,
            dst: Operand::None,
            src: Operand::None,
            src2: Operand::None,
            mem: MemRef::default(),
            seg: SegReg::Ds,
            size: OpSize::Dword,
            addr32: true,
            rep: Rep::None,
            locked: false,
            len: 0,
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(self.u8()? as u16 | (self.u8()? as u16) << 8)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(self.u16()? as u32 | (self.u16()? as u32) << 16)
    }

    fn imm(&mut self, size: OpSize) -> Result<u32, DecodeError> {
        match size {
            OpSize::Byte => Ok(self.u8()? as u32),
            OpSize::Word => Ok(self.u16()? as u32),
            OpSize::Dword => self.u32(),
        }
    }

    fn simm8(&mut self, size: OpSize) -> Result<u32, DecodeError> {
        Ok(self.u8()? as i8 as i32 as u32 & size.mask())
    }
}

struct Prefixes {
    seg: Option<SegReg>,
    opsize: bool,
    addrsize: bool,
    rep: Rep,
    locked: bool,
}

/// Decoded ModRM memory/register reference.
struct ModRm {
    modrm: u8,
    reg: u8,
    is_mem: bool,
    mem: MemRef,
    default_seg: SegReg,
}

impl ModRm {
    fn rm_operand(&self) -> Operand {
        if self.is_mem {
            Operand::Mem
        } else {
            Operand::Reg(self.modrm & 7)
        }
    }
}

fn decode_modrm(cur: &mut Cursor, addr32: bool) -> Result<ModRm, DecodeError> {
    let modrm = cur.u8()?;
    let md = modrm >> 6;
    let reg = modrm >> 3 & 7;
    let rm = modrm & 7;
    if md == 3 {
        return Ok(ModRm {
            modrm,
            reg,
            is_mem: false,
            mem: MemRef::default(),
            default_seg: SegReg::Ds,
        });
    }
    let mut mem = MemRef::default();
    let mut default_seg = SegReg::Ds;
    if addr32 {
        let mut base = Some(rm);
        if rm == 4 {
            // SIB byte.
            let sib = cur.u8()?;
            let scale = sib >> 6;
            let index = sib >> 3 & 7;
            let sib_base = sib & 7;
            mem.scale = scale;
            if index != 4 {
                mem.index = Some(index);
            }
            base = Some(sib_base);
            if sib_base == 5 && md == 0 {
                base = None;
                mem.disp = cur.u32()?;
            }
        } else if rm == 5 && md == 0 {
            base = None;
            mem.disp = cur.u32()?;
        }
        match md {
            1 => mem.disp = cur.u8()? as i8 as i32 as u32,
            2 => mem.disp = cur.u32()?,
            _ => {}
        }
        mem.base = base;
        if matches!(mem.base, Some(4) | Some(5)) {
            default_seg = SegReg::Ss;
        }
    } else {
        // 16-bit addressing forms.
        let (base, index): (Option<u8>, Option<u8>) = match rm {
            0 => (Some(3), Some(6)), // BX + SI
            1 => (Some(3), Some(7)), // BX + DI
            2 => (Some(5), Some(6)), // BP + SI
            3 => (Some(5), Some(7)), // BP + DI
            4 => (Some(6), None),    // SI
            5 => (Some(7), None),    // DI
            6 => (Some(5), None),    // BP (or disp16 when mod == 0)
            _ => (Some(3), None),    // BX
        };
        let (base, index) = if rm == 6 && md == 0 {
            mem.disp = cur.u16()? as u32;
            (None, None)
        } else {
            (base, index)
        };
        match md {
            1 => mem.disp = cur.u8()? as i8 as i16 as u16 as u32,
            2 => mem.disp = cur.u16()? as u32,
            _ => {}
        }
        mem.base = base;
        mem.index = index;
        if matches!(mem.base, Some(5)) {
            default_seg = SegReg::Ss;
        }
    }
    Ok(ModRm {
        modrm,
        reg,
        is_mem: true,
        mem,
        default_seg,
    })
}

/// Decodes one instruction from `bytes` with the given default operand
/// size. `bytes` should hold at least the full instruction (15 bytes is
/// always enough).
pub fn decode(bytes: &[u8], code32: bool) -> Result<Instr, DecodeError> {
    let mut cur = Cursor { bytes, pos: 0 };
    let mut pfx = Prefixes {
        seg: None,
        opsize: false,
        addrsize: false,
        rep: Rep::None,
        locked: false,
    };

    // Prefix bytes.
    loop {
        if cur.pos >= 15 {
            return Err(DecodeError::TooLong);
        }
        match cur.u8()? {
            0x26 => pfx.seg = Some(SegReg::Es),
            0x2E => pfx.seg = Some(SegReg::Cs),
            0x36 => pfx.seg = Some(SegReg::Ss),
            0x3E => pfx.seg = Some(SegReg::Ds),
            0x64 => pfx.seg = Some(SegReg::Fs),
            0x65 => pfx.seg = Some(SegReg::Gs),
            0x66 => pfx.opsize = true,
            0x67 => pfx.addrsize = true,
            0xF0 => pfx.locked = true,
            0xF2 => pfx.rep = Rep::Repne,
            0xF3 => pfx.rep = Rep::Rep,
            opcode => {
                let mut instr = decode_opcode(&mut cur, &pfx, code32, opcode)?;
                if cur.pos > 15 {
                    return Err(DecodeError::TooLong);
                }
                instr.len = cur.pos as u8;
                instr.rep = pfx.rep;
                instr.locked = pfx.locked;
                return Ok(instr);
            }
        }
    }
}

fn opsize(pfx: &Prefixes, code32: bool) -> OpSize {
    if code32 ^ pfx.opsize {
        OpSize::Dword
    } else {
        OpSize::Word
    }
}

fn build(
    op: Op,
    pfx: &Prefixes,
    code32: bool,
    size: OpSize,
    modrm: Option<&ModRm>,
) -> Instr {
    let mut instr = Instr::new(op);
    instr.size = size;
    instr.addr32 = code32 ^ pfx.addrsize;
    if let Some(m) = modrm {
        instr.mem = m.mem;
        instr.seg = pfx.seg.unwrap_or(m.default_seg);
    } else {
        instr.seg = pfx.seg.unwrap_or(SegReg::Ds);
    }
    instr
}

fn decode_opcode(
    cur: &mut Cursor,
    pfx: &Prefixes,
    code32: bool,
    opcode: u8,
) -> Result<Instr, DecodeError> {
    let osz = opsize(pfx, code32);
    let addr32 = code32 ^ pfx.addrsize;

    // The regular ALU block: op r/m,r | r,r/m | acc,imm. Rows end at /6;
    // the /6 and /7 columns are the segment push/pops and BCD adjusts.
    if opcode < 0x40 && opcode & 7 < 6 {
        let alu = match opcode >> 3 {
            0 => Alu::Add,
            1 => Alu::Or,
            2 => Alu::Adc,
            3 => Alu::Sbb,
            4 => Alu::And,
            5 => Alu::Sub,
            6 => Alu::Xor,
            _ => Alu::Cmp,
        };
        let form = opcode & 7;
        let size = if form & 1 == 0 { OpSize::Byte } else { osz };
        return Ok(match form {
            0 | 1 => {
                let m = decode_modrm(cur, addr32)?;
                let mut i = build(Op::Alu(alu), pfx, code32, size, Some(&m));
                i.dst = m.rm_operand();
                i.src = Operand::Reg(m.reg);
                i
            }
            2 | 3 => {
                let m = decode_modrm(cur, addr32)?;
                let mut i = build(Op::Alu(alu), pfx, code32, size, Some(&m));
                i.dst = Operand::Reg(m.reg);
                i.src = m.rm_operand();
                i
            }
            _ => {
                let imm = cur.imm(size)?;
                let mut i = build(Op::Alu(alu), pfx, code32, size, None);
                i.dst = Operand::Reg(0);
                i.src = Operand::Imm(imm);
                i
            }
        });
    }

    match opcode {
        0x06 => Ok(build(Op::PushSeg(SegReg::Es), pfx, code32, osz, None)),
        0x07 => Ok(build(Op::PopSeg(SegReg::Es), pfx, code32, osz, None)),
        0x0E => Ok(build(Op::PushSeg(SegReg::Cs), pfx, code32, osz, None)),
        0x16 => Ok(build(Op::PushSeg(SegReg::Ss), pfx, code32, osz, None)),
        0x17 => Ok(build(Op::PopSeg(SegReg::Ss), pfx, code32, osz, None)),
        0x1E => Ok(build(Op::PushSeg(SegReg::Ds), pfx, code32, osz, None)),
        0x1F => Ok(build(Op::PopSeg(SegReg::Ds), pfx, code32, osz, None)),
        0x27 => Ok(build(Op::Daa, pfx, code32, OpSize::Byte, None)),
        0x2F => Ok(build(Op::Das, pfx, code32, OpSize::Byte, None)),
        0x37 => Ok(build(Op::Aaa, pfx, code32, OpSize::Byte, None)),
        0x3F => Ok(build(Op::Aas, pfx, code32, OpSize::Byte, None)),
        0x0F => decode_0f(cur, pfx, code32),
        0x40..=0x47 => {
            let mut i = build(Op::Inc, pfx, code32, osz, None);
            i.dst = Operand::Reg(opcode & 7);
            Ok(i)
        }
        0x48..=0x4F => {
            let mut i = build(Op::Dec, pfx, code32, osz, None);
            i.dst = Operand::Reg(opcode & 7);
            Ok(i)
        }
        0x50..=0x57 => {
            let mut i = build(Op::Push, pfx, code32, osz, None);
            i.src = Operand::Reg(opcode & 7);
            Ok(i)
        }
        0x58..=0x5F => {
            let mut i = build(Op::Pop, pfx, code32, osz, None);
            i.dst = Operand::Reg(opcode & 7);
            Ok(i)
        }
        0x60 => Ok(build(Op::Pusha, pfx, code32, osz, None)),
        0x61 => Ok(build(Op::Popa, pfx, code32, osz, None)),
        0x62 => {
            let m = decode_modrm(cur, addr32)?;
            if !m.is_mem {
                return Err(DecodeError::Ud);
            }
            let mut i = build(Op::Bound, pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = Operand::Mem;
            Ok(i)
        }
        0x63 => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Arpl, pfx, code32, OpSize::Word, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Reg(m.reg);
            Ok(i)
        }
        0x68 => {
            let imm = cur.imm(osz)?;
            let mut i = build(Op::Push, pfx, code32, osz, None);
            i.src = Operand::Imm(imm);
            Ok(i)
        }
        0x69 | 0x6B => {
            let m = decode_modrm(cur, addr32)?;
            let imm = if opcode == 0x69 {
                cur.imm(osz)?
            } else {
                cur.simm8(osz)?
            };
            let mut i = build(Op::Imul, pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = m.rm_operand();
            i.src2 = Operand::Imm(imm);
            Ok(i)
        }
        0x6A => {
            let imm = cur.simm8(osz)?;
            let mut i = build(Op::Push, pfx, code32, osz, None);
            i.src = Operand::Imm(imm);
            Ok(i)
        }
        0x6C | 0x6D => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            Ok(build(Op::Strings(StringOp::Ins), pfx, code32, size, None))
        }
        0x6E | 0x6F => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            Ok(build(Op::Strings(StringOp::Outs), pfx, code32, size, None))
        }
        0x70..=0x7F => {
            let target = cur.u8()? as i8 as i32;
            let mut i = build(Op::Jcc(opcode & 15), pfx, code32, osz, None);
            i.src = Operand::Imm(target as u32);
            Ok(i)
        }
        0x80 | 0x82 | 0x81 | 0x83 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let imm = if opcode == 0x83 {
                cur.simm8(size)?
            } else {
                cur.imm(size)?
            };
            let alu = [
                Alu::Add,
                Alu::Or,
                Alu::Adc,
                Alu::Sbb,
                Alu::And,
                Alu::Sub,
                Alu::Xor,
                Alu::Cmp,
            ][m.reg as usize];
            let mut i = build(Op::Alu(alu), pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Imm(imm);
            Ok(i)
        }
        0x84 | 0x85 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Test, pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Reg(m.reg);
            Ok(i)
        }
        0x86 | 0x87 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Xchg, pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Reg(m.reg);
            Ok(i)
        }
        0x88 | 0x89 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Mov, pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Reg(m.reg);
            Ok(i)
        }
        0x8A | 0x8B => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Mov, pfx, code32, size, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = m.rm_operand();
            Ok(i)
        }
        0x8C => {
            let m = decode_modrm(cur, addr32)?;
            let seg = SegReg::from_index(m.reg).ok_or(DecodeError::Ud)?;
            // Register destinations take the operand size (zero-extended);
            // memory destinations store 16 bits regardless.
            let mut i = build(Op::MovSeg, pfx, code32, osz, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Seg(seg);
            Ok(i)
        }
        0x8D => {
            let m = decode_modrm(cur, addr32)?;
            if !m.is_mem {
                return Err(DecodeError::Ud);
            }
            let mut i = build(Op::Lea, pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = Operand::Mem;
            Ok(i)
        }
        0x8E => {
            let m = decode_modrm(cur, addr32)?;
            let seg = SegReg::from_index(m.reg).ok_or(DecodeError::Ud)?;
            if seg == SegReg::Cs {
                return Err(DecodeError::Ud);
            }
            let mut i = build(Op::MovSeg, pfx, code32, OpSize::Word, Some(&m));
            i.dst = Operand::Seg(seg);
            i.src = m.rm_operand();
            Ok(i)
        }
        0x8F => {
            let m = decode_modrm(cur, addr32)?;
            if m.reg != 0 {
                return Err(DecodeError::Ud);
            }
            let mut i = build(Op::Pop, pfx, code32, osz, Some(&m));
            i.dst = m.rm_operand();
            Ok(i)
        }
        0x90 => {
            if pfx.rep == Rep::Rep {
                // PAUSE; architecturally a NOP here.
                return Ok(build(Op::Nop, pfx, code32, osz, None));
            }
            Ok(build(Op::Nop, pfx, code32, osz, None))
        }
        0x91..=0x97 => {
            let mut i = build(Op::Xchg, pfx, code32, osz, None);
            i.dst = Operand::Reg(0);
            i.src = Operand::Reg(opcode & 7);
            Ok(i)
        }
        0x98 => Ok(build(Op::Cbw, pfx, code32, osz, None)),
        0x99 => Ok(build(Op::Cwd, pfx, code32, osz, None)),
        0x9A => {
            let off = cur.imm(osz)?;
            let sel = cur.u16()?;
            let mut i = build(Op::CallFar, pfx, code32, osz, None);
            i.src = Operand::Imm(off);
            i.src2 = Operand::Imm(sel as u32);
            Ok(i)
        }
        0x9B => Ok(build(Op::Wait, pfx, code32, osz, None)),
        0x9C => Ok(build(Op::Pushf, pfx, code32, osz, None)),
        0x9D => Ok(build(Op::Popf, pfx, code32, osz, None)),
        0x9E => Ok(build(Op::Sahf, pfx, code32, OpSize::Byte, None)),
        0x9F => Ok(build(Op::Lahf, pfx, code32, OpSize::Byte, None)),
        0xA0..=0xA3 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let disp = if addr32 { cur.u32()? } else { cur.u16()? as u32 };
            let mut i = build(Op::Mov, pfx, code32, size, None);
            i.mem = MemRef {
                base: None,
                index: None,
                scale: 0,
                disp,
            };
            if opcode < 0xA2 {
                i.dst = Operand::Reg(0);
                i.src = Operand::Mem;
            } else {
                i.dst = Operand::Mem;
                i.src = Operand::Reg(0);
            }
            Ok(i)
        }
        0xA4 | 0xA5 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            Ok(build(Op::Strings(StringOp::Movs), pfx, code32, size, None))
        }
        0xA6 | 0xA7 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            Ok(build(Op::Strings(StringOp::Cmps), pfx, code32, size, None))
        }
        0xA8 | 0xA9 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let imm = cur.imm(size)?;
            let mut i = build(Op::Test, pfx, code32, size, None);
            i.dst = Operand::Reg(0);
            i.src = Operand::Imm(imm);
            Ok(i)
        }
        0xAA | 0xAB => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            Ok(build(Op::Strings(StringOp::Stos), pfx, code32, size, None))
        }
        0xAC | 0xAD => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            Ok(build(Op::Strings(StringOp::Lods), pfx, code32, size, None))
        }
        0xAE | 0xAF => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            Ok(build(Op::Strings(StringOp::Scas), pfx, code32, size, None))
        }
        0xB0..=0xB7 => {
            let imm = cur.u8()? as u32;
            let mut i = build(Op::Mov, pfx, code32, OpSize::Byte, None);
            i.dst = Operand::Reg(opcode & 7);
            i.src = Operand::Imm(imm);
            Ok(i)
        }
        0xB8..=0xBF => {
            let imm = cur.imm(osz)?;
            let mut i = build(Op::Mov, pfx, code32, osz, None);
            i.dst = Operand::Reg(opcode & 7);
            i.src = Operand::Imm(imm);
            Ok(i)
        }
        0xC0 | 0xC1 | 0xD0..=0xD3 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let shift = [
                Shift::Rol,
                Shift::Ror,
                Shift::Rcl,
                Shift::Rcr,
                Shift::Shl,
                Shift::Shr,
                Shift::Sal,
                Shift::Sar,
            ][m.reg as usize];
            let mut i = build(Op::Shift(shift), pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = match opcode {
                0xC0 | 0xC1 => Operand::Imm(cur.u8()? as u32),
                0xD0 | 0xD1 => Operand::Imm(1),
                _ => Operand::Reg(1), // CL
            };
            Ok(i)
        }
        0xC2 => {
            let pop = cur.u16()?;
            Ok(build(Op::Ret { pop }, pfx, code32, osz, None))
        }
        0xC3 => Ok(build(Op::Ret { pop: 0 }, pfx, code32, osz, None)),
        0xC4 | 0xC5 => {
            let m = decode_modrm(cur, addr32)?;
            if !m.is_mem {
                return Err(DecodeError::Ud);
            }
            let seg = if opcode == 0xC4 { SegReg::Es } else { SegReg::Ds };
            let mut i = build(Op::LoadFar(seg), pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = Operand::Mem;
            Ok(i)
        }
        0xC6 | 0xC7 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            if m.reg != 0 {
                return Err(DecodeError::Ud);
            }
            let imm = cur.imm(size)?;
            let mut i = build(Op::Mov, pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Imm(imm);
            Ok(i)
        }
        0xC8 => {
            let alloc = cur.u16()?;
            let nesting = cur.u8()?;
            let mut i = build(Op::Enter, pfx, code32, osz, None);
            i.src = Operand::Imm(alloc as u32);
            i.src2 = Operand::Imm(nesting as u32);
            Ok(i)
        }
        0xC9 => Ok(build(Op::Leave, pfx, code32, osz, None)),
        0xCA => {
            let pop = cur.u16()?;
            Ok(build(Op::RetFar { pop }, pfx, code32, osz, None))
        }
        0xCB => Ok(build(Op::RetFar { pop: 0 }, pfx, code32, osz, None)),
        0xCC => Ok(build(Op::Int3, pfx, code32, osz, None)),
        0xCD => {
            let vector = cur.u8()?;
            Ok(build(Op::Int(vector), pfx, code32, osz, None))
        }
        0xCE => Ok(build(Op::Into, pfx, code32, osz, None)),
        0xCF => Ok(build(Op::Iret, pfx, code32, osz, None)),
        0xD4 => Ok(build(Op::Aam(cur.u8()?), pfx, code32, OpSize::Byte, None)),
        0xD5 => Ok(build(Op::Aad(cur.u8()?), pfx, code32, OpSize::Byte, None)),
        0xD6 => Ok(build(Op::Salc, pfx, code32, OpSize::Byte, None)),
        0xD7 => Ok(build(Op::Xlat, pfx, code32, OpSize::Byte, None)),
        0xD8..=0xDF => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(
                Op::Fpu {
                    esc: opcode & 7,
                    modrm: m.modrm,
                },
                pfx,
                code32,
                osz,
                Some(&m),
            );
            i.src = m.rm_operand();
            Ok(i)
        }
        0xE0 => {
            let rel = cur.u8()? as i8 as i32 as u32;
            let mut i = build(Op::Loopne, pfx, code32, osz, None);
            i.src = Operand::Imm(rel);
            Ok(i)
        }
        0xE1 => {
            let rel = cur.u8()? as i8 as i32 as u32;
            let mut i = build(Op::Loope, pfx, code32, osz, None);
            i.src = Operand::Imm(rel);
            Ok(i)
        }
        0xE2 => {
            let rel = cur.u8()? as i8 as i32 as u32;
            let mut i = build(Op::Loop, pfx, code32, osz, None);
            i.src = Operand::Imm(rel);
            Ok(i)
        }
        0xE3 => {
            let rel = cur.u8()? as i8 as i32 as u32;
            let mut i = build(Op::Jcxz, pfx, code32, osz, None);
            i.src = Operand::Imm(rel);
            Ok(i)
        }
        0xE4 | 0xE5 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let port = cur.u8()? as u32;
            let mut i = build(Op::In, pfx, code32, size, None);
            i.src = Operand::Imm(port);
            Ok(i)
        }
        0xE6 | 0xE7 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let port = cur.u8()? as u32;
            let mut i = build(Op::Out, pfx, code32, size, None);
            i.dst = Operand::Imm(port);
            Ok(i)
        }
        0xE8 => {
            let rel = cur.imm(osz)?;
            let rel = if osz == OpSize::Word {
                rel as u16 as i16 as i32 as u32
            } else {
                rel
            };
            let mut i = build(Op::Call, pfx, code32, osz, None);
            i.src = Operand::Imm(rel);
            Ok(i)
        }
        0xE9 => {
            let rel = cur.imm(osz)?;
            let rel = if osz == OpSize::Word {
                rel as u16 as i16 as i32 as u32
            } else {
                rel
            };
            let mut i = build(Op::Jmp, pfx, code32, osz, None);
            i.src = Operand::Imm(rel);
            Ok(i)
        }
        0xEA => {
            let off = cur.imm(osz)?;
            let sel = cur.u16()?;
            let mut i = build(Op::JmpFar, pfx, code32, osz, None);
            i.src = Operand::Imm(off);
            i.src2 = Operand::Imm(sel as u32);
            Ok(i)
        }
        0xEB => {
            let rel = cur.u8()? as i8 as i32 as u32;
            let mut i = build(Op::Jmp, pfx, code32, osz, None);
            i.src = Operand::Imm(rel);
            Ok(i)
        }
        0xEC | 0xED => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let mut i = build(Op::In, pfx, code32, size, None);
            i.src = Operand::Reg(2); // DX
            Ok(i)
        }
        0xEE | 0xEF => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let mut i = build(Op::Out, pfx, code32, size, None);
            i.dst = Operand::Reg(2); // DX
            Ok(i)
        }
        0xF1 => Ok(build(Op::Int(1), pfx, code32, osz, None)),
        0xF4 => Ok(build(Op::Hlt, pfx, code32, osz, None)),
        0xF5 => Ok(build(Op::Cmc, pfx, code32, osz, None)),
        0xF6 | 0xF7 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let (op, needs_imm) = match m.reg {
                0 | 1 => (Op::Test, true),
                2 => (Op::Not, false),
                3 => (Op::Neg, false),
                4 => (Op::Mul, false),
                5 => (Op::Imul1, false),
                6 => (Op::Div, false),
                _ => (Op::Idiv, false),
            };
            let mut i = build(op, pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            if needs_imm {
                i.src = Operand::Imm(cur.imm(size)?);
            }
            Ok(i)
        }
        0xF8 => Ok(build(Op::Clc, pfx, code32, osz, None)),
        0xF9 => Ok(build(Op::Stc, pfx, code32, osz, None)),
        0xFA => Ok(build(Op::Cli, pfx, code32, osz, None)),
        0xFB => Ok(build(Op::Sti, pfx, code32, osz, None)),
        0xFC => Ok(build(Op::Cld, pfx, code32, osz, None)),
        0xFD => Ok(build(Op::Std, pfx, code32, osz, None)),
        0xFE => {
            let m = decode_modrm(cur, addr32)?;
            let op = match m.reg {
                0 => Op::Inc,
                1 => Op::Dec,
                _ => return Err(DecodeError::Ud),
            };
            let mut i = build(op, pfx, code32, OpSize::Byte, Some(&m));
            i.dst = m.rm_operand();
            Ok(i)
        }
        0xFF => {
            let m = decode_modrm(cur, addr32)?;
            match m.reg {
                0 | 1 => {
                    let op = if m.reg == 0 { Op::Inc } else { Op::Dec };
                    let mut i = build(op, pfx, code32, osz, Some(&m));
                    i.dst = m.rm_operand();
                    Ok(i)
                }
                2 => {
                    let mut i = build(Op::Call, pfx, code32, osz, Some(&m));
                    i.src = m.rm_operand();
                    i.src2 = Operand::Imm(1); // marker: indirect
                    Ok(i)
                }
                3 => {
                    if !m.is_mem {
                        return Err(DecodeError::Ud);
                    }
                    let mut i = build(Op::CallFarInd, pfx, code32, osz, Some(&m));
                    i.src = Operand::Mem;
                    Ok(i)
                }
                4 => {
                    let mut i = build(Op::Jmp, pfx, code32, osz, Some(&m));
                    i.src = m.rm_operand();
                    i.src2 = Operand::Imm(1);
                    Ok(i)
                }
                5 => {
                    if !m.is_mem {
                        return Err(DecodeError::Ud);
                    }
                    let mut i = build(Op::JmpFarInd, pfx, code32, osz, Some(&m));
                    i.src = Operand::Mem;
                    Ok(i)
                }
                6 => {
                    let mut i = build(Op::Push, pfx, code32, osz, Some(&m));
                    i.src = m.rm_operand();
                    Ok(i)
                }
                _ => Err(DecodeError::Ud),
            }
        }
        _ => Err(DecodeError::Ud),
    }
}

fn decode_0f(cur: &mut Cursor, pfx: &Prefixes, code32: bool) -> Result<Instr, DecodeError> {
    let osz = opsize(pfx, code32);
    let addr32 = code32 ^ pfx.addrsize;
    let opcode = cur.u8()?;
    match opcode {
        0x00 => {
            let m = decode_modrm(cur, addr32)?;
            let op = match m.reg {
                0 => Op::Sldt,
                1 => Op::Str,
                2 => Op::Lldt,
                3 => Op::Ltr,
                4 => Op::Verr,
                5 => Op::Verw,
                _ => return Err(DecodeError::Ud),
            };
            let mut i = build(op, pfx, code32, OpSize::Word, Some(&m));
            i.dst = m.rm_operand();
            i.src = m.rm_operand();
            Ok(i)
        }
        0x01 => {
            let m = decode_modrm(cur, addr32)?;
            let op = match m.reg {
                0 => Op::Sgdt,
                1 => Op::Sidt,
                2 => Op::Lgdt,
                3 => Op::Lidt,
                4 => Op::Smsw,
                6 => Op::Lmsw,
                7 => {
                    if !m.is_mem {
                        return Err(DecodeError::Ud);
                    }
                    Op::Invlpg
                }
                _ => return Err(DecodeError::Ud),
            };
            if matches!(op, Op::Sgdt | Op::Sidt | Op::Lgdt | Op::Lidt | Op::Invlpg) && !m.is_mem {
                return Err(DecodeError::Ud);
            }
            let size = if matches!(op, Op::Smsw | Op::Lmsw) {
                OpSize::Word
            } else {
                osz
            };
            let mut i = build(op, pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = m.rm_operand();
            Ok(i)
        }
        0x02 | 0x03 => {
            let m = decode_modrm(cur, addr32)?;
            let op = if opcode == 0x02 { Op::Lar } else { Op::Lsl };
            let mut i = build(op, pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = m.rm_operand();
            Ok(i)
        }
        0x06 => Ok(build(Op::Clts, pfx, code32, osz, None)),
        0x08 => Ok(build(Op::Invd, pfx, code32, osz, None)),
        0x09 => Ok(build(Op::Wbinvd, pfx, code32, osz, None)),
        0x0B => Ok(build(Op::Ud2, pfx, code32, osz, None)),
        0x10 | 0x11 => {
            // MOVUPS/MOVSS/MOVUPD/MOVSD xmm <-> xmm/m.
            let m = decode_modrm(cur, addr32)?;
            let width = match pfx.rep {
                Rep::Rep => 4,
                Rep::Repne => 8,
                Rep::None => 16,
            };
            let mut i = build(Op::SimdMov { width }, pfx, code32, osz, Some(&m));
            let rm = if m.is_mem { Operand::Mem } else { Operand::Xmm(m.modrm & 7) };
            if opcode == 0x10 {
                i.dst = Operand::Xmm(m.reg);
                i.src = rm;
            } else {
                i.dst = rm;
                i.src = Operand::Xmm(m.reg);
            }
            Ok(i)
        }
        0x18..=0x1F => {
            // Hint/NOP group (prefetches, multi-byte NOP).
            let m = decode_modrm(cur, addr32)?;
            Ok(build(Op::Prefetch, pfx, code32, osz, Some(&m)))
        }
        0x20 => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::MovFromCr, pfx, code32, OpSize::Dword, None);
            i.dst = Operand::Reg(m.modrm & 7);
            i.src = Operand::Cr(m.reg);
            Ok(i)
        }
        0x21 => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::MovFromDr, pfx, code32, OpSize::Dword, None);
            i.dst = Operand::Reg(m.modrm & 7);
            i.src = Operand::Dr(m.reg);
            Ok(i)
        }
        0x22 => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::MovToCr, pfx, code32, OpSize::Dword, None);
            i.dst = Operand::Cr(m.reg);
            i.src = Operand::Reg(m.modrm & 7);
            Ok(i)
        }
        0x23 => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::MovToDr, pfx, code32, OpSize::Dword, None);
            i.dst = Operand::Dr(m.reg);
            i.src = Operand::Reg(m.modrm & 7);
            Ok(i)
        }
        0x28 | 0x29 => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::SimdMov { width: 16 }, pfx, code32, osz, Some(&m));
            let rm = if m.is_mem { Operand::Mem } else { Operand::Xmm(m.modrm & 7) };
            if opcode == 0x28 {
                i.dst = Operand::Xmm(m.reg);
                i.src = rm;
            } else {
                i.dst = rm;
                i.src = Operand::Xmm(m.reg);
            }
            Ok(i)
        }
        0x30 => Ok(build(Op::Wrmsr, pfx, code32, osz, None)),
        0x31 => Ok(build(Op::Rdtsc, pfx, code32, osz, None)),
        0x32 => Ok(build(Op::Rdmsr, pfx, code32, osz, None)),
        0x34 => Ok(build(Op::Sysenter, pfx, code32, osz, None)),
        0x35 => Ok(build(Op::Sysexit, pfx, code32, osz, None)),
        0x40..=0x4F => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Cmovcc(opcode & 15), pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = m.rm_operand();
            Ok(i)
        }
        0x51 | 0x58 | 0x59 | 0x5C | 0x5D | 0x5E | 0x5F => {
            let m = decode_modrm(cur, addr32)?;
            let op = match opcode {
                0x51 => FloatOp::Sqrt,
                0x58 => FloatOp::Add,
                0x59 => FloatOp::Mul,
                0x5C => FloatOp::Sub,
                0x5D => FloatOp::Min,
                0x5E => FloatOp::Div,
                _ => FloatOp::Max,
            };
            let (scalar, double) = match (pfx.rep, pfx.opsize) {
                (Rep::Rep, _) => (true, false),
                (Rep::Repne, _) => (true, true),
                (Rep::None, true) => (false, true),
                (Rep::None, false) => (false, false),
            };
            let mut i = build(
                Op::SseArith { op, scalar, double },
                pfx,
                code32,
                osz,
                Some(&m),
            );
            i.dst = Operand::Xmm(m.reg);
            i.src = if m.is_mem { Operand::Mem } else { Operand::Xmm(m.modrm & 7) };
            Ok(i)
        }
        0x6E | 0x7E => {
            let m = decode_modrm(cur, addr32)?;
            if opcode == 0x7E && pfx.rep == Rep::Rep {
                // MOVQ xmm, xmm/m64.
                let mut i = build(Op::SimdMov { width: 8 }, pfx, code32, osz, Some(&m));
                i.dst = Operand::Xmm(m.reg);
                i.src = if m.is_mem { Operand::Mem } else { Operand::Xmm(m.modrm & 7) };
                return Ok(i);
            }
            let simd_reg = if pfx.opsize {
                Operand::Xmm(m.reg)
            } else {
                Operand::Mmx(m.reg)
            };
            let rm = if m.is_mem { Operand::Mem } else { Operand::Reg(m.modrm & 7) };
            let mut i = build(Op::SimdMov { width: 4 }, pfx, code32, OpSize::Dword, Some(&m));
            if opcode == 0x6E {
                i.dst = simd_reg;
                i.src = rm;
            } else {
                i.dst = rm;
                i.src = simd_reg;
            }
            Ok(i)
        }
        0x6F | 0x7F => {
            let m = decode_modrm(cur, addr32)?;
            // MMX: 64-bit; with 66/F3: 128-bit dqa/dqu.
            let width = if pfx.opsize || pfx.rep == Rep::Rep { 16 } else { 8 };
            let simd_reg = if width == 16 {
                Operand::Xmm(m.reg)
            } else {
                Operand::Mmx(m.reg)
            };
            let rm = if m.is_mem {
                Operand::Mem
            } else if width == 16 {
                Operand::Xmm(m.modrm & 7)
            } else {
                Operand::Mmx(m.modrm & 7)
            };
            let mut i = build(Op::SimdMov { width }, pfx, code32, osz, Some(&m));
            if opcode == 0x6F {
                i.dst = simd_reg;
                i.src = rm;
            } else {
                i.dst = rm;
                i.src = simd_reg;
            }
            Ok(i)
        }
        0x77 => Ok(build(Op::Emms, pfx, code32, osz, None)),
        0x80..=0x8F => {
            let rel = cur.imm(osz)?;
            let rel = if osz == OpSize::Word {
                rel as u16 as i16 as i32 as u32
            } else {
                rel
            };
            let mut i = build(Op::Jcc(opcode & 15), pfx, code32, osz, None);
            i.src = Operand::Imm(rel);
            Ok(i)
        }
        0x90..=0x9F => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Setcc(opcode & 15), pfx, code32, OpSize::Byte, Some(&m));
            i.dst = m.rm_operand();
            Ok(i)
        }
        0xA0 => Ok(build(Op::PushSeg(SegReg::Fs), pfx, code32, osz, None)),
        0xA1 => Ok(build(Op::PopSeg(SegReg::Fs), pfx, code32, osz, None)),
        0xA2 => Ok(build(Op::Cpuid, pfx, code32, osz, None)),
        0xA3 | 0xAB | 0xB3 | 0xBB => {
            let m = decode_modrm(cur, addr32)?;
            let op = match opcode {
                0xA3 => BitOp::Bt,
                0xAB => BitOp::Bts,
                0xB3 => BitOp::Btr,
                _ => BitOp::Btc,
            };
            let mut i = build(Op::Bit(op), pfx, code32, osz, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Reg(m.reg);
            Ok(i)
        }
        0xA4 | 0xAC | 0xA5 | 0xAD => {
            let m = decode_modrm(cur, addr32)?;
            let left = opcode & 8 == 0;
            let mut i = build(Op::ShiftD { left }, pfx, code32, osz, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Reg(m.reg);
            i.src2 = if opcode & 1 == 0 {
                Operand::Imm(cur.u8()? as u32)
            } else {
                Operand::Reg(1) // CL
            };
            Ok(i)
        }
        0xA8 => Ok(build(Op::PushSeg(SegReg::Gs), pfx, code32, osz, None)),
        0xA9 => Ok(build(Op::PopSeg(SegReg::Gs), pfx, code32, osz, None)),
        0xAE => {
            let m = decode_modrm(cur, addr32)?;
            let op = match m.reg {
                0 => Op::Fxsave,
                1 => Op::Fxrstor,
                2 => Op::Ldmxcsr,
                3 => Op::Stmxcsr,
                5 | 6 | 7 => return Ok(build(Op::Nop, pfx, code32, osz, Some(&m))), // fences
                _ => return Err(DecodeError::Ud),
            };
            if !m.is_mem {
                return Err(DecodeError::Ud);
            }
            let mut i = build(op, pfx, code32, osz, Some(&m));
            i.src = Operand::Mem;
            i.dst = Operand::Mem;
            Ok(i)
        }
        0xAF => {
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Imul, pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = m.rm_operand();
            i.src2 = Operand::Reg(m.reg);
            Ok(i)
        }
        0xB0 | 0xB1 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Cmpxchg, pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Reg(m.reg);
            Ok(i)
        }
        0xB2 | 0xB4 | 0xB5 => {
            let m = decode_modrm(cur, addr32)?;
            if !m.is_mem {
                return Err(DecodeError::Ud);
            }
            let seg = match opcode {
                0xB2 => SegReg::Ss,
                0xB4 => SegReg::Fs,
                _ => SegReg::Gs,
            };
            let mut i = build(Op::LoadFar(seg), pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = Operand::Mem;
            Ok(i)
        }
        0xB6 | 0xB7 | 0xBE | 0xBF => {
            let m = decode_modrm(cur, addr32)?;
            let op = if opcode < 0xBE { Op::Movzx } else { Op::Movsx };
            let src_size = if opcode & 1 == 0 {
                OpSize::Byte
            } else {
                OpSize::Word
            };
            let mut i = build(op, pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = m.rm_operand();
            // Source width travels in src2 as a marker.
            i.src2 = Operand::Imm(src_size.bits());
            Ok(i)
        }
        0xBA => {
            let m = decode_modrm(cur, addr32)?;
            let op = match m.reg {
                4 => BitOp::Bt,
                5 => BitOp::Bts,
                6 => BitOp::Btr,
                7 => BitOp::Btc,
                _ => return Err(DecodeError::Ud),
            };
            let imm = cur.u8()?;
            let mut i = build(Op::Bit(op), pfx, code32, osz, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Imm(imm as u32);
            Ok(i)
        }
        0xBC | 0xBD => {
            let m = decode_modrm(cur, addr32)?;
            let op = if opcode == 0xBC { Op::Bsf } else { Op::Bsr };
            let mut i = build(op, pfx, code32, osz, Some(&m));
            i.dst = Operand::Reg(m.reg);
            i.src = m.rm_operand();
            Ok(i)
        }
        0xC0 | 0xC1 => {
            let size = if opcode & 1 == 0 { OpSize::Byte } else { osz };
            let m = decode_modrm(cur, addr32)?;
            let mut i = build(Op::Xadd, pfx, code32, size, Some(&m));
            i.dst = m.rm_operand();
            i.src = Operand::Reg(m.reg);
            Ok(i)
        }
        0xC7 => {
            let m = decode_modrm(cur, addr32)?;
            if m.reg != 1 || !m.is_mem {
                return Err(DecodeError::Ud);
            }
            let mut i = build(Op::Cmpxchg8b, pfx, code32, osz, Some(&m));
            i.dst = Operand::Mem;
            Ok(i)
        }
        0xC8..=0xCF => {
            let mut i = build(Op::Bswap, pfx, code32, OpSize::Dword, None);
            i.dst = Operand::Reg(opcode & 7);
            Ok(i)
        }
        0xDB | 0xDF | 0xEB | 0xEF | 0xFC..=0xFE | 0xF8..=0xFA | 0x74..=0x76 => {
            // Packed-integer ALU subset (MMX or SSE2 with 66).
            let m = decode_modrm(cur, addr32)?;
            let (op, lanes) = match opcode {
                0xDB => (PackedOp::And, OpSize::Dword),
                0xDF => (PackedOp::Andn, OpSize::Dword),
                0xEB => (PackedOp::Or, OpSize::Dword),
                0xEF => (PackedOp::Xor, OpSize::Dword),
                0xFC => (PackedOp::Add, OpSize::Byte),
                0xFD => (PackedOp::Add, OpSize::Word),
                0xFE => (PackedOp::Add, OpSize::Dword),
                0xF8 => (PackedOp::Sub, OpSize::Byte),
                0xF9 => (PackedOp::Sub, OpSize::Word),
                0xFA => (PackedOp::Sub, OpSize::Dword),
                0x74 => (PackedOp::CmpEq, OpSize::Byte),
                0x75 => (PackedOp::CmpEq, OpSize::Word),
                _ => (PackedOp::CmpEq, OpSize::Dword),
            };
            let mut i = build(Op::PackedInt { op, lanes }, pfx, code32, osz, Some(&m));
            if pfx.opsize {
                i.dst = Operand::Xmm(m.reg);
                i.src = if m.is_mem { Operand::Mem } else { Operand::Xmm(m.modrm & 7) };
            } else {
                i.dst = Operand::Mmx(m.reg);
                i.src = if m.is_mem { Operand::Mem } else { Operand::Mmx(m.modrm & 7) };
            }
            Ok(i)
        }
        _ => {
            tracing::debug!(target: "decode", opcode = format_args!("0f {opcode:02x}"), "unimplemented opcode");
            Err(DecodeError::Ud)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_imm32() {
        let i = decode(&[0xB8, 0x78, 0x56, 0x34, 0x12], true).unwrap();
        assert!(matches!(i.op, Op::Mov));
        assert_eq!(i.dst, Operand::Reg(0));
        assert_eq!(i.src, Operand::Imm(0x1234_5678));
        assert_eq!(i.len, 5);
        assert_eq!(i.size, OpSize::Dword);
    }

    #[test]
    fn opsize_prefix_flips_width() {
        let i = decode(&[0x66, 0xB8, 0x34, 0x12], true).unwrap();
        assert_eq!(i.size, OpSize::Word);
        assert_eq!(i.len, 4);
        let i = decode(&[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12], false).unwrap();
        assert_eq!(i.size, OpSize::Dword);
        assert_eq!(i.len, 6);
    }

    #[test]
    fn modrm_sib_disp() {
        // mov eax, [ebx + esi*4 + 0x10]
        let i = decode(&[0x8B, 0x44, 0xB3, 0x10], true).unwrap();
        assert_eq!(i.dst, Operand::Reg(0));
        assert_eq!(i.src, Operand::Mem);
        assert_eq!(i.mem.base, Some(3));
        assert_eq!(i.mem.index, Some(6));
        assert_eq!(i.mem.scale, 2);
        assert_eq!(i.mem.disp, 0x10);
    }

    #[test]
    fn modrm16_bp_uses_stack_segment() {
        // mov ax, [bp+2] in 16-bit code
        let i = decode(&[0x8B, 0x46, 0x02], false).unwrap();
        assert_eq!(i.seg, SegReg::Ss);
        assert_eq!(i.mem.base, Some(5));
        assert_eq!(i.mem.disp, 2);
        assert!(!i.addr32);
    }

    #[test]
    fn segment_override_wins() {
        let i = decode(&[0x26, 0x8B, 0x46, 0x02], false).unwrap();
        assert_eq!(i.seg, SegReg::Es);
    }

    #[test]
    fn group_83_sign_extends() {
        // add dword [eax], -1
        let i = decode(&[0x83, 0x00, 0xFF], true).unwrap();
        assert!(matches!(i.op, Op::Alu(Alu::Add)));
        assert_eq!(i.src, Operand::Imm(0xFFFF_FFFF));
    }

    #[test]
    fn rep_string_ops() {
        let i = decode(&[0xF3, 0xA5], true).unwrap();
        assert!(matches!(i.op, Op::Strings(StringOp::Movs)));
        assert_eq!(i.rep, Rep::Rep);
        assert_eq!(i.size, OpSize::Dword);
    }

    #[test]
    fn far_jump_direct() {
        let i = decode(&[0xEA, 0x00, 0x10, 0x00, 0xF0], false).unwrap();
        assert!(matches!(i.op, Op::JmpFar));
        assert_eq!(i.src, Operand::Imm(0x1000));
        assert_eq!(i.src2, Operand::Imm(0xF000));
        assert_eq!(i.len, 5);
    }

    #[test]
    fn two_byte_ops() {
        let i = decode(&[0x0F, 0xB6, 0xC0], true).unwrap();
        assert!(matches!(i.op, Op::Movzx));
        let i = decode(&[0x0F, 0xA2], true).unwrap();
        assert!(matches!(i.op, Op::Cpuid));
        let i = decode(&[0x0F, 0x01, 0x10], true).unwrap();
        assert!(matches!(i.op, Op::Lgdt));
        let i = decode(&[0x0F, 0x20, 0xC0], true).unwrap();
        assert!(matches!(i.op, Op::MovFromCr));
        assert_eq!(i.src, Operand::Cr(0));
    }

    #[test]
    fn invalid_opcode_is_ud() {
        assert_eq!(decode(&[0x0F, 0xFF], true).unwrap_err(), DecodeError::Ud);
        // LEA with a register operand.
        assert_eq!(decode(&[0x8D, 0xC0], true).unwrap_err(), DecodeError::Ud);
    }

    #[test]
    fn truncated_window_reports_truncation() {
        assert_eq!(decode(&[0xB8, 0x01], true).unwrap_err(), DecodeError::Truncated);
    }

    #[test]
    fn fpu_escape_carries_modrm() {
        // fld dword [eax]
        let i = decode(&[0xD9, 0x00], true).unwrap();
        match i.op {
            Op::Fpu { esc, modrm } => {
                assert_eq!(esc, 1);
                assert_eq!(modrm, 0x00);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(i.src, Operand::Mem);
    }

    #[test]
    fn shifts_and_groups() {
        let i = decode(&[0xC1, 0xE0, 0x04], true).unwrap();
        assert!(matches!(i.op, Op::Shift(Shift::Shl)));
        assert_eq!(i.src, Operand::Imm(4));
        let i = decode(&[0xD3, 0xE8], true).unwrap();
        assert!(matches!(i.op, Op::Shift(Shift::Shr)));
        assert_eq!(i.src, Operand::Reg(1));
        let i = decode(&[0xF7, 0xF9], true).unwrap();
        assert!(matches!(i.op, Op::Idiv));
    }

    #[test]
    fn prefix_storm_hits_length_limit() {
        let bytes = [0x66; 20];
        assert_eq!(decode(&bytes, true).unwrap_err(), DecodeError::TooLong);
    }
}
