use crate::{
    emulator::{EmuResult, EmulatorError},
    memory::CodeReader,
};

pub const EAX: u8 = 0;
pub const ECX: u8 = 1;
pub const EDX: u8 = 2;
pub const EBX: u8 = 3;
pub const ESP: u8 = 4;
pub const EBP: u8 = 5;
pub const ESI: u8 = 6;
pub const EDI: u8 = 7;

const MAX_INSTRUCTION_LENGTH: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    Byte,
    Word,
    Dword,
}

impl OperandSize {
    pub fn bytes(self) -> u32 {
        match self {
            OperandSize::Byte => 1,
            OperandSize::Word => 2,
            OperandSize::Dword => 4,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    pub fn mask(self) -> u32 {
        match self {
            OperandSize::Byte => 0xFF,
            OperandSize::Word => 0xFFFF,
            OperandSize::Dword => 0xFFFF_FFFF,
        }
    }

    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }
}

/// `[base + index*scale + disp]`, flat 32-bit addressing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: i32,
}

impl MemoryOperand {
    fn absolute(addr: u32) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            disp: addr as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Register number; its width comes from the instruction's operand size
    /// (with byte size, 4..7 name AH, CH, DH, BH).
    Register(u8),
    Memory(MemoryOperand),
    Immediate(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 | 6 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            _ => ShiftOp::Sar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftCount {
    One,
    Cl,
    Immediate(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulDivOp {
    Mul,
    Imul,
    Div,
    Idiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Overflow,
    NotOverflow,
    Below,
    AboveOrEqual,
    Equal,
    NotEqual,
    BelowOrEqual,
    Above,
    Sign,
    NotSign,
    Parity,
    NotParity,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
}

impl From<u8> for Condition {
    fn from(bits: u8) -> Self {
        match bits & 0xF {
            0x0 => Condition::Overflow,
            0x1 => Condition::NotOverflow,
            0x2 => Condition::Below,
            0x3 => Condition::AboveOrEqual,
            0x4 => Condition::Equal,
            0x5 => Condition::NotEqual,
            0x6 => Condition::BelowOrEqual,
            0x7 => Condition::Above,
            0x8 => Condition::Sign,
            0x9 => Condition::NotSign,
            0xA => Condition::Parity,
            0xB => Condition::NotParity,
            0xC => Condition::Less,
            0xD => Condition::GreaterOrEqual,
            0xE => Condition::LessOrEqual,
            _ => Condition::Greater,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    None,
    /// `rep` / `repe`
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Loop,
    LoopEqual,
    LoopNotEqual,
    JumpIfEcxZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitTestOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    Direct(u32),
    Indirect(Operand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Alu {
        op: AluOp,
        size: OperandSize,
        dst: Operand,
        src: Operand,
    },
    Test {
        size: OperandSize,
        dst: Operand,
        src: Operand,
    },
    Mov {
        size: OperandSize,
        dst: Operand,
        src: Operand,
    },
    MovExtend {
        signed: bool,
        size: OperandSize,
        src_size: OperandSize,
        dst: u8,
        src: Operand,
    },
    Lea {
        size: OperandSize,
        dst: u8,
        src: MemoryOperand,
    },
    Xchg {
        size: OperandSize,
        a: Operand,
        b: Operand,
    },
    IncDec {
        inc: bool,
        size: OperandSize,
        dst: Operand,
    },
    Not {
        size: OperandSize,
        dst: Operand,
    },
    Neg {
        size: OperandSize,
        dst: Operand,
    },
    MulDiv {
        op: MulDivOp,
        size: OperandSize,
        src: Operand,
    },
    /// Two- and three-operand `imul`.
    Imul {
        size: OperandSize,
        dst: u8,
        src: Operand,
        imm: Option<u32>,
    },
    Shift {
        op: ShiftOp,
        size: OperandSize,
        dst: Operand,
        count: ShiftCount,
    },
    DoubleShift {
        left: bool,
        size: OperandSize,
        dst: Operand,
        src: u8,
        count: ShiftCount,
    },
    Push {
        size: OperandSize,
        src: Operand,
    },
    Pop {
        size: OperandSize,
        dst: Operand,
    },
    Pushad,
    Popad,
    Pushfd,
    Popfd,
    Jmp {
        target: BranchTarget,
    },
    Call {
        target: BranchTarget,
    },
    Ret {
        pop: u16,
    },
    Jcc {
        condition: Condition,
        target: u32,
    },
    Setcc {
        condition: Condition,
        dst: Operand,
    },
    Cmovcc {
        condition: Condition,
        size: OperandSize,
        dst: u8,
        src: Operand,
    },
    Loop {
        kind: LoopKind,
        target: u32,
    },
    /// `cbw` / `cwde`
    ExtendAccumulator {
        size: OperandSize,
    },
    /// `cwd` / `cdq`
    ExtendIntoDx {
        size: OperandSize,
    },
    Leave,
    Nop,
    Int {
        vector: u8,
    },
    Rdtsc,
    Flag(FlagOp),
    Bswap {
        reg: u8,
    },
    BitScan {
        reverse: bool,
        size: OperandSize,
        dst: u8,
        src: Operand,
    },
    BitTest {
        op: BitTestOp,
        size: OperandSize,
        dst: Operand,
        bit: Operand,
    },
    String {
        op: StringOp,
        size: OperandSize,
        repeat: Repeat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub address: u32,
    pub length: u32,
    pub opcode: Opcode,
}

impl Instruction {
    pub fn branch_target(&self) -> Option<u32> {
        match self.opcode {
            Opcode::Jmp {
                target: BranchTarget::Direct(target),
            }
            | Opcode::Call {
                target: BranchTarget::Direct(target),
            }
            | Opcode::Jcc { target, .. }
            | Opcode::Loop { target, .. } => Some(target),
            _ => None,
        }
    }
}

struct Cursor<'a, R: CodeReader + ?Sized> {
    reader: &'a R,
    start: u32,
    pos: u32,
    operand_size: OperandSize,
    repeat: Repeat,
}

impl<R: CodeReader + ?Sized> Cursor<'_, R> {
    fn length(&self) -> u32 {
        self.pos.wrapping_sub(self.start)
    }

    fn invalid(&self, reason: &str) -> EmulatorError {
        let opcode = self.reader.read_u8(self.start).unwrap_or(0) as u32;
        EmulatorError::decode(self.start, opcode, reason)
    }

    fn u8(&mut self) -> EmuResult<u8> {
        if self.length() >= MAX_INSTRUCTION_LENGTH {
            return Err(self.invalid("instruction longer than 15 bytes"));
        }
        let value = self.reader.read_u8(self.pos)?;
        self.pos = self.pos.wrapping_add(1);
        Ok(value)
    }

    fn u16(&mut self) -> EmuResult<u16> {
        let lo = self.u8()? as u16;
        let hi = self.u8()? as u16;
        Ok(lo | (hi << 8))
    }

    fn u32(&mut self) -> EmuResult<u32> {
        let lo = self.u16()? as u32;
        let hi = self.u16()? as u32;
        Ok(lo | (hi << 16))
    }

    fn imm8_signed(&mut self) -> EmuResult<u32> {
        Ok(self.u8()? as i8 as i32 as u32)
    }

    /// Immediate of the current operand size (Iz/Iv).
    fn imm(&mut self, size: OperandSize) -> EmuResult<u32> {
        Ok(match size {
            OperandSize::Byte => self.u8()? as u32,
            OperandSize::Word => self.u16()? as u32,
            OperandSize::Dword => self.u32()?,
        })
    }

    fn rel8(&mut self) -> EmuResult<u32> {
        let disp = self.imm8_signed()?;
        Ok(self.pos.wrapping_add(disp))
    }

    fn rel32(&mut self) -> EmuResult<u32> {
        if self.operand_size == OperandSize::Word {
            return Err(self.invalid("16-bit branch displacements are not supported"));
        }
        let disp = self.u32()?;
        Ok(self.pos.wrapping_add(disp))
    }

    /// Returns the reg field and the r/m operand.
    fn modrm(&mut self) -> EmuResult<(u8, Operand)> {
        let byte = self.u8()?;
        let mode = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;
        if mode == 3 {
            return Ok((reg, Operand::Register(rm)));
        }

        let mut mem = MemoryOperand {
            base: Some(rm),
            index: None,
            scale: 1,
            disp: 0,
        };
        if rm == 4 {
            let sib = self.u8()?;
            let index = (sib >> 3) & 7;
            let base = sib & 7;
            mem.scale = 1 << (sib >> 6);
            mem.index = (index != ESP).then_some(index);
            mem.base = Some(base);
            if base == EBP && mode == 0 {
                mem.base = None;
                mem.disp = self.u32()? as i32;
            }
        } else if rm == EBP && mode == 0 {
            mem.base = None;
            mem.disp = self.u32()? as i32;
        }
        match mode {
            1 => mem.disp = self.u8()? as i8 as i32,
            2 => mem.disp = self.u32()? as i32,
            _ => {}
        }
        Ok((reg, Operand::Memory(mem)))
    }

    fn modrm_memory(&mut self) -> EmuResult<(u8, MemoryOperand)> {
        match self.modrm()? {
            (reg, Operand::Memory(mem)) => Ok((reg, mem)),
            _ => Err(self.invalid("register operand where memory is required")),
        }
    }
}

pub fn decode<R: CodeReader + ?Sized>(reader: &R, address: u32) -> EmuResult<Instruction> {
    let mut cur = Cursor {
        reader,
        start: address,
        pos: address,
        operand_size: OperandSize::Dword,
        repeat: Repeat::None,
    };

    let mut byte = cur.u8()?;
    loop {
        match byte {
            0x66 => cur.operand_size = OperandSize::Word,
            0xF2 => cur.repeat = Repeat::NotEqual,
            0xF3 => cur.repeat = Repeat::Equal,
            // cs/ss/ds/es overrides and lock are meaningless in a flat space
            0x26 | 0x2E | 0x36 | 0x3E | 0xF0 => {}
            0x64 | 0x65 => return Err(cur.invalid("fs/gs segment overrides are not supported")),
            0x67 => return Err(cur.invalid("16-bit addressing is not supported")),
            _ => break,
        }
        byte = cur.u8()?;
    }

    let opcode = if byte == 0x0F {
        let second = cur.u8()?;
        decode_two_byte(&mut cur, second)?
    } else {
        decode_one_byte(&mut cur, byte)?
    };
    Ok(Instruction {
        address,
        length: cur.length(),
        opcode,
    })
}

fn decode_one_byte<R: CodeReader + ?Sized>(cur: &mut Cursor<'_, R>, byte: u8) -> EmuResult<Opcode> {
    let v = cur.operand_size;
    let b = OperandSize::Byte;
    let reg = byte & 7;

    let opcode = match byte {
        0x00..=0x3F if byte & 7 <= 5 => {
            let op = AluOp::from_bits(byte >> 3);
            match byte & 7 {
                0 | 1 => {
                    let size = if byte & 1 == 0 { b } else { v };
                    let (r, rm) = cur.modrm()?;
                    Opcode::Alu {
                        op,
                        size,
                        dst: rm,
                        src: Operand::Register(r),
                    }
                }
                2 | 3 => {
                    let size = if byte & 1 == 0 { b } else { v };
                    let (r, rm) = cur.modrm()?;
                    Opcode::Alu {
                        op,
                        size,
                        dst: Operand::Register(r),
                        src: rm,
                    }
                }
                4 => Opcode::Alu {
                    op,
                    size: b,
                    dst: Operand::Register(EAX),
                    src: Operand::Immediate(cur.u8()? as u32),
                },
                _ => Opcode::Alu {
                    op,
                    size: v,
                    dst: Operand::Register(EAX),
                    src: Operand::Immediate(cur.imm(v)?),
                },
            }
        }
        0x40..=0x47 => Opcode::IncDec {
            inc: true,
            size: v,
            dst: Operand::Register(reg),
        },
        0x48..=0x4F => Opcode::IncDec {
            inc: false,
            size: v,
            dst: Operand::Register(reg),
        },
        0x50..=0x57 => Opcode::Push {
            size: v,
            src: Operand::Register(reg),
        },
        0x58..=0x5F => Opcode::Pop {
            size: v,
            dst: Operand::Register(reg),
        },
        0x60 => Opcode::Pushad,
        0x61 => Opcode::Popad,
        0x68 => Opcode::Push {
            size: v,
            src: Operand::Immediate(cur.imm(v)?),
        },
        0x6A => Opcode::Push {
            size: v,
            src: Operand::Immediate(cur.imm8_signed()? & v.mask()),
        },
        0x69 | 0x6B => {
            let (r, rm) = cur.modrm()?;
            let imm = if byte == 0x69 {
                cur.imm(v)?
            } else {
                cur.imm8_signed()?
            };
            Opcode::Imul {
                size: v,
                dst: r,
                src: rm,
                imm: Some(imm),
            }
        }
        0x70..=0x7F => Opcode::Jcc {
            condition: Condition::from(byte),
            target: cur.rel8()?,
        },
        0x80..=0x83 => {
            let size = if byte & 1 == 0 { b } else { v };
            let (r, rm) = cur.modrm()?;
            let imm = match byte {
                0x81 => cur.imm(v)?,
                0x83 => cur.imm8_signed()? & v.mask(),
                _ => cur.u8()? as u32,
            };
            Opcode::Alu {
                op: AluOp::from_bits(r),
                size,
                dst: rm,
                src: Operand::Immediate(imm),
            }
        }
        0x84 | 0x85 => {
            let (r, rm) = cur.modrm()?;
            Opcode::Test {
                size: if byte == 0x84 { b } else { v },
                dst: rm,
                src: Operand::Register(r),
            }
        }
        0x86 | 0x87 => {
            let (r, rm) = cur.modrm()?;
            Opcode::Xchg {
                size: if byte == 0x86 { b } else { v },
                a: rm,
                b: Operand::Register(r),
            }
        }
        0x88..=0x8B => {
            let size = if byte & 1 == 0 { b } else { v };
            let (r, rm) = cur.modrm()?;
            let (dst, src) = if byte & 2 == 0 {
                (rm, Operand::Register(r))
            } else {
                (Operand::Register(r), rm)
            };
            Opcode::Mov { size, dst, src }
        }
        0x8D => {
            let (r, mem) = cur.modrm_memory()?;
            Opcode::Lea {
                size: v,
                dst: r,
                src: mem,
            }
        }
        0x8F => match cur.modrm()? {
            (0, rm) => Opcode::Pop { size: v, dst: rm },
            _ => return Err(cur.invalid("invalid pop encoding")),
        },
        0x90 => Opcode::Nop,
        0x91..=0x97 => Opcode::Xchg {
            size: v,
            a: Operand::Register(EAX),
            b: Operand::Register(reg),
        },
        0x98 => Opcode::ExtendAccumulator { size: v },
        0x99 => Opcode::ExtendIntoDx { size: v },
        0x9C => Opcode::Pushfd,
        0x9D => Opcode::Popfd,
        0xA0..=0xA3 => {
            let size = if byte & 1 == 0 { b } else { v };
            let mem = Operand::Memory(MemoryOperand::absolute(cur.u32()?));
            let acc = Operand::Register(EAX);
            let (dst, src) = if byte & 2 == 0 { (acc, mem) } else { (mem, acc) };
            Opcode::Mov { size, dst, src }
        }
        0xA4..=0xA7 | 0xAA..=0xAF => {
            let op = match byte & 0xFE {
                0xA4 => StringOp::Movs,
                0xA6 => StringOp::Cmps,
                0xAA => StringOp::Stos,
                0xAC => StringOp::Lods,
                _ => StringOp::Scas,
            };
            Opcode::String {
                op,
                size: if byte & 1 == 0 { b } else { v },
                repeat: cur.repeat,
            }
        }
        0xA8 => Opcode::Test {
            size: b,
            dst: Operand::Register(EAX),
            src: Operand::Immediate(cur.u8()? as u32),
        },
        0xA9 => Opcode::Test {
            size: v,
            dst: Operand::Register(EAX),
            src: Operand::Immediate(cur.imm(v)?),
        },
        0xB0..=0xB7 => Opcode::Mov {
            size: b,
            dst: Operand::Register(reg),
            src: Operand::Immediate(cur.u8()? as u32),
        },
        0xB8..=0xBF => Opcode::Mov {
            size: v,
            dst: Operand::Register(reg),
            src: Operand::Immediate(cur.imm(v)?),
        },
        0xC0 | 0xC1 | 0xD0..=0xD3 => {
            let size = if byte & 1 == 0 { b } else { v };
            let (r, rm) = cur.modrm()?;
            let count = match byte {
                0xC0 | 0xC1 => ShiftCount::Immediate(cur.u8()?),
                0xD0 | 0xD1 => ShiftCount::One,
                _ => ShiftCount::Cl,
            };
            Opcode::Shift {
                op: ShiftOp::from_bits(r),
                size,
                dst: rm,
                count,
            }
        }
        0xC2 => Opcode::Ret { pop: cur.u16()? },
        0xC3 => Opcode::Ret { pop: 0 },
        0xC6 | 0xC7 => {
            let size = if byte == 0xC6 { b } else { v };
            match cur.modrm()? {
                (0, rm) => Opcode::Mov {
                    size,
                    dst: rm,
                    src: Operand::Immediate(cur.imm(size)?),
                },
                _ => return Err(cur.invalid("invalid mov encoding")),
            }
        }
        0xC9 => Opcode::Leave,
        0xCC => Opcode::Int { vector: 3 },
        0xCD => Opcode::Int { vector: cur.u8()? },
        0xE0..=0xE3 => {
            let kind = match byte {
                0xE0 => LoopKind::LoopNotEqual,
                0xE1 => LoopKind::LoopEqual,
                0xE2 => LoopKind::Loop,
                _ => LoopKind::JumpIfEcxZero,
            };
            Opcode::Loop {
                kind,
                target: cur.rel8()?,
            }
        }
        0xE8 => Opcode::Call {
            target: BranchTarget::Direct(cur.rel32()?),
        },
        0xE9 => Opcode::Jmp {
            target: BranchTarget::Direct(cur.rel32()?),
        },
        0xEB => Opcode::Jmp {
            target: BranchTarget::Direct(cur.rel8()?),
        },
        0xF5 => Opcode::Flag(FlagOp::Cmc),
        0xF6 | 0xF7 => {
            let size = if byte == 0xF6 { b } else { v };
            let (r, rm) = cur.modrm()?;
            match r {
                0 | 1 => Opcode::Test {
                    size,
                    dst: rm,
                    src: Operand::Immediate(cur.imm(size)?),
                },
                2 => Opcode::Not { size, dst: rm },
                3 => Opcode::Neg { size, dst: rm },
                _ => Opcode::MulDiv {
                    op: match r {
                        4 => MulDivOp::Mul,
                        5 => MulDivOp::Imul,
                        6 => MulDivOp::Div,
                        _ => MulDivOp::Idiv,
                    },
                    size,
                    src: rm,
                },
            }
        }
        0xF8 => Opcode::Flag(FlagOp::Clc),
        0xF9 => Opcode::Flag(FlagOp::Stc),
        0xFC => Opcode::Flag(FlagOp::Cld),
        0xFD => Opcode::Flag(FlagOp::Std),
        0xFE => match cur.modrm()? {
            (r @ (0 | 1), rm) => Opcode::IncDec {
                inc: r == 0,
                size: b,
                dst: rm,
            },
            _ => return Err(cur.invalid("invalid group 4 encoding")),
        },
        0xFF => match cur.modrm()? {
            (r @ (0 | 1), rm) => Opcode::IncDec {
                inc: r == 0,
                size: v,
                dst: rm,
            },
            (2, rm) => Opcode::Call {
                target: BranchTarget::Indirect(rm),
            },
            (4, rm) => Opcode::Jmp {
                target: BranchTarget::Indirect(rm),
            },
            (6, rm) => Opcode::Push { size: v, src: rm },
            _ => return Err(cur.invalid("far transfers are not supported")),
        },
        0xE4..=0xE7 | 0xEC..=0xEF | 0xF4 | 0xFA | 0xFB | 0x6C..=0x6F => {
            return Err(cur.invalid("privileged instruction"));
        }
        _ => return Err(cur.invalid("unsupported opcode")),
    };
    Ok(opcode)
}

fn decode_two_byte<R: CodeReader + ?Sized>(cur: &mut Cursor<'_, R>, byte: u8) -> EmuResult<Opcode> {
    let v = cur.operand_size;
    let opcode = match byte {
        0x1F => {
            cur.modrm()?;
            Opcode::Nop
        }
        0x31 => Opcode::Rdtsc,
        0x40..=0x4F => {
            let (r, rm) = cur.modrm()?;
            Opcode::Cmovcc {
                condition: Condition::from(byte),
                size: v,
                dst: r,
                src: rm,
            }
        }
        0x80..=0x8F => Opcode::Jcc {
            condition: Condition::from(byte),
            target: cur.rel32()?,
        },
        0x90..=0x9F => {
            let (_, rm) = cur.modrm()?;
            Opcode::Setcc {
                condition: Condition::from(byte),
                dst: rm,
            }
        }
        0xA3 | 0xAB | 0xB3 | 0xBB => {
            let (r, rm) = cur.modrm()?;
            let op = match byte {
                0xA3 => BitTestOp::Bt,
                0xAB => BitTestOp::Bts,
                0xB3 => BitTestOp::Btr,
                _ => BitTestOp::Btc,
            };
            Opcode::BitTest {
                op,
                size: v,
                dst: rm,
                bit: Operand::Register(r),
            }
        }
        0xBA => {
            let (r, rm) = cur.modrm()?;
            let op = match r {
                4 => BitTestOp::Bt,
                5 => BitTestOp::Bts,
                6 => BitTestOp::Btr,
                7 => BitTestOp::Btc,
                _ => return Err(cur.invalid("invalid group 8 encoding")),
            };
            Opcode::BitTest {
                op,
                size: v,
                dst: rm,
                bit: Operand::Immediate(cur.u8()? as u32),
            }
        }
        0xA4 | 0xA5 | 0xAC | 0xAD => {
            let (r, rm) = cur.modrm()?;
            let count = if byte & 1 == 0 {
                ShiftCount::Immediate(cur.u8()?)
            } else {
                ShiftCount::Cl
            };
            Opcode::DoubleShift {
                left: byte < 0xA8,
                size: v,
                dst: rm,
                src: r,
                count,
            }
        }
        0xAF => {
            let (r, rm) = cur.modrm()?;
            Opcode::Imul {
                size: v,
                dst: r,
                src: rm,
                imm: None,
            }
        }
        0xB6 | 0xB7 | 0xBE | 0xBF => {
            let (r, rm) = cur.modrm()?;
            Opcode::MovExtend {
                signed: byte >= 0xBE,
                size: v,
                src_size: if byte & 1 == 0 {
                    OperandSize::Byte
                } else {
                    OperandSize::Word
                },
                dst: r,
                src: rm,
            }
        }
        0xBC | 0xBD => {
            let (r, rm) = cur.modrm()?;
            Opcode::BitScan {
                reverse: byte == 0xBD,
                size: v,
                dst: r,
                src: rm,
            }
        }
        0xC8..=0xCF => Opcode::Bswap { reg: byte & 7 },
        0x00 | 0x01 | 0x06 | 0x08 | 0x09 | 0x20..=0x23 | 0x30 | 0x32 => {
            return Err(cur.invalid("privileged instruction"));
        }
        _ => return Err(cur.invalid("unsupported two-byte opcode")),
    };
    Ok(opcode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CodeSlice;

    fn decode_bytes(bytes: &[u8]) -> EmuResult<Instruction> {
        decode(&CodeSlice::new(bytes, 0x1000), 0x1000)
    }

    #[test]
    fn sib_with_displacement() {
        // mov eax, [ebx+esi*4+0x10]
        let inst = decode_bytes(&[0x8B, 0x44, 0xB3, 0x10]).unwrap();
        assert_eq!(inst.length, 4);
        assert_eq!(
            inst.opcode,
            Opcode::Mov {
                size: OperandSize::Dword,
                dst: Operand::Register(EAX),
                src: Operand::Memory(MemoryOperand {
                    base: Some(EBX),
                    index: Some(ESI),
                    scale: 4,
                    disp: 0x10
                })
            }
        );
    }

    #[test]
    fn absolute_disp32_without_base() {
        // add dword [0x2000], 5
        let inst = decode_bytes(&[0x83, 0x05, 0x00, 0x20, 0x00, 0x00, 0x05]).unwrap();
        assert_eq!(
            inst.opcode,
            Opcode::Alu {
                op: AluOp::Add,
                size: OperandSize::Dword,
                dst: Operand::Memory(MemoryOperand::absolute(0x2000)),
                src: Operand::Immediate(5),
            }
        );
    }

    #[test]
    fn operand_size_prefix() {
        // mov ax, 0x1234
        let inst = decode_bytes(&[0x66, 0xB8, 0x34, 0x12]).unwrap();
        assert_eq!(inst.length, 4);
        assert!(matches!(
            inst.opcode,
            Opcode::Mov {
                size: OperandSize::Word,
                src: Operand::Immediate(0x1234),
                ..
            }
        ));
    }

    #[test]
    fn relative_branches() {
        // jne -2 (to itself)
        let inst = decode_bytes(&[0x75, 0xFE]).unwrap();
        assert_eq!(inst.branch_target(), Some(0x1000));
        // call +0
        let inst = decode_bytes(&[0xE8, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(inst.branch_target(), Some(0x1005));
    }

    #[test]
    fn rep_string_ops() {
        let inst = decode_bytes(&[0xF3, 0xA5]).unwrap();
        assert_eq!(
            inst.opcode,
            Opcode::String {
                op: StringOp::Movs,
                size: OperandSize::Dword,
                repeat: Repeat::Equal
            }
        );
    }

    #[test]
    fn privileged_and_truncated() {
        assert!(matches!(decode_bytes(&[0xF4]), Err(EmulatorError::Decode { .. })));
        assert!(matches!(decode_bytes(&[0xFA]), Err(EmulatorError::Decode { .. })));
        assert!(matches!(decode_bytes(&[0xB8, 0x01]), Err(EmulatorError::Memory(_))));
    }
}
