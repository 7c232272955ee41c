use crate::{
    emulator::{EmuResult, EmulatorError},
    memory::CodeReader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Byte,
    Word,
    Long,
}

impl Size {
    pub fn bytes(self) -> u32 {
        match self {
            Size::Byte => 1,
            Size::Word => 2,
            Size::Long => 4,
        }
    }

    /// The common `00/01/10` size field.
    fn from_bits(bits: u16) -> Option<Self> {
        match bits & 3 {
            0 => Some(Size::Byte),
            1 => Some(Size::Word),
            2 => Some(Size::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    True,
    False,
    Higher,
    LowerOrSame,
    CarryClear,
    CarrySet,
    NotEqual,
    Equal,
    OverflowClear,
    OverflowSet,
    Plus,
    Minus,
    GreaterOrEqual,
    LessThan,
    GreaterThan,
    LessOrEqual,
}

impl From<u16> for Condition {
    fn from(bits: u16) -> Self {
        match bits & 0xF {
            0x0 => Condition::True,
            0x1 => Condition::False,
            0x2 => Condition::Higher,
            0x3 => Condition::LowerOrSame,
            0x4 => Condition::CarryClear,
            0x5 => Condition::CarrySet,
            0x6 => Condition::NotEqual,
            0x7 => Condition::Equal,
            0x8 => Condition::OverflowClear,
            0x9 => Condition::OverflowSet,
            0xA => Condition::Plus,
            0xB => Condition::Minus,
            0xC => Condition::GreaterOrEqual,
            0xD => Condition::LessThan,
            0xE => Condition::GreaterThan,
            _ => Condition::LessOrEqual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRegister {
    pub is_address: bool,
    pub reg: u8,
    pub long: bool,
    pub scale: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indirection {
    None,
    PreIndexed,
    PostIndexed,
}

/// Brief (68000) or full (68020) index extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexExtension {
    pub index: Option<IndexRegister>,
    pub base_disp: i32,
    pub base_suppressed: bool,
    pub indirection: Indirection,
    pub outer_disp: i32,
    pub full: bool,
}

/// A fully decoded operand. PC-relative forms carry the address of their
/// extension word, which is what the displacement is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveAddress {
    DataReg(u8),
    AddrReg(u8),
    Indirect(u8),
    PostIncrement(u8),
    PreDecrement(u8),
    Displacement { reg: u8, disp: i16 },
    Indexed { reg: u8, ext: IndexExtension },
    PcDisplacement { base: u32, disp: i16 },
    PcIndexed { base: u32, ext: IndexExtension },
    AbsoluteShort(i16),
    AbsoluteLong(u32),
    Immediate(u32),
}

impl EffectiveAddress {
    /// Address computable without any register state (PC-relative and
    /// absolute forms). Execution and disassembly both go through this.
    pub fn static_target(&self) -> Option<u32> {
        match *self {
            EffectiveAddress::PcDisplacement { base, disp } => {
                Some(base.wrapping_add(disp as i32 as u32))
            }
            EffectiveAddress::AbsoluteShort(addr) => Some(addr as i32 as u32),
            EffectiveAddress::AbsoluteLong(addr) => Some(addr),
            _ => None,
        }
    }

    fn is_pc_relative(&self) -> bool {
        matches!(
            self,
            EffectiveAddress::PcDisplacement { .. } | EffectiveAddress::PcIndexed { .. }
        )
    }

    fn is_data_alterable(&self) -> bool {
        !matches!(self, EffectiveAddress::AddrReg(_) | EffectiveAddress::Immediate(_))
            && !self.is_pc_relative()
    }

    fn is_memory_alterable(&self) -> bool {
        self.is_data_alterable() && !matches!(self, EffectiveAddress::DataReg(_))
    }

    fn is_control(&self) -> bool {
        !matches!(
            self,
            EffectiveAddress::DataReg(_)
                | EffectiveAddress::AddrReg(_)
                | EffectiveAddress::PostIncrement(_)
                | EffectiveAddress::PreDecrement(_)
                | EffectiveAddress::Immediate(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmediateOp {
    Or,
    And,
    Sub,
    Add,
    Eor,
    Cmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Sub,
    Add,
    Cmp,
    Eor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    EaToDn { src: EffectiveAddress, dst: u8 },
    DnToEa { src: u8, dst: EffectiveAddress },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOp {
    Add,
    Sub,
    Cmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedOp {
    Addx,
    Subx,
    Abcd,
    Sbcd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negx,
    Clr,
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    Tst,
    Chg,
    Clr,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitNumber {
    Immediate(u8),
    Register(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Arithmetic,
    Logical,
    RotateExtend,
    Rotate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightOrLeft {
    Right,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftCount {
    Immediate(u8),
    Register(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtMode {
    ByteToWord,
    WordToLong,
    ByteToLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExgMode {
    DataData,
    AddrAddr,
    DataAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Reset,
    Nop,
    Rts,
    Rtr,
    Rtd {
        displacement: i16,
    },
    TrapV,
    Trap {
        vector: u8,
    },
    /// A-line opcode; the whole word is the trap payload.
    ATrap {
        word: u16,
    },
    Move {
        size: Size,
        src: EffectiveAddress,
        dst: EffectiveAddress,
    },
    Movea {
        size: Size,
        src: EffectiveAddress,
        dst: u8,
    },
    Moveq {
        data: i8,
        dst: u8,
    },
    Movem {
        size: Size,
        to_memory: bool,
        mask: u16,
        ea: EffectiveAddress,
    },
    Movep {
        size: Size,
        data_reg: u8,
        addr_reg: u8,
        displacement: i16,
        to_memory: bool,
    },
    MoveFromSr {
        dst: EffectiveAddress,
    },
    MoveToCcr {
        src: EffectiveAddress,
    },
    Lea {
        src: EffectiveAddress,
        dst: u8,
    },
    Pea {
        src: EffectiveAddress,
    },
    Immediate {
        op: ImmediateOp,
        size: Size,
        imm: u32,
        dst: EffectiveAddress,
    },
    ImmediateToCcr {
        op: ImmediateOp,
        imm: u8,
    },
    Binary {
        op: BinaryOp,
        size: Size,
        operands: Operands,
    },
    AddressArith {
        op: AddressOp,
        size: Size,
        src: EffectiveAddress,
        dst: u8,
    },
    Quick {
        add: bool,
        size: Size,
        data: u8,
        dst: EffectiveAddress,
    },
    Extended {
        op: ExtendedOp,
        size: Size,
        src: u8,
        dst: u8,
        memory: bool,
    },
    Cmpm {
        size: Size,
        src: u8,
        dst: u8,
    },
    Unary {
        op: UnaryOp,
        size: Size,
        dst: EffectiveAddress,
    },
    Nbcd {
        dst: EffectiveAddress,
    },
    Tst {
        size: Size,
        src: EffectiveAddress,
    },
    Tas {
        dst: EffectiveAddress,
    },
    Bit {
        op: BitOp,
        bit: BitNumber,
        dst: EffectiveAddress,
    },
    ShiftRegister {
        op: ShiftOp,
        direction: RightOrLeft,
        size: Size,
        count: ShiftCount,
        reg: u8,
    },
    ShiftMemory {
        op: ShiftOp,
        direction: RightOrLeft,
        dst: EffectiveAddress,
    },
    Swap {
        reg: u8,
    },
    Ext {
        reg: u8,
        mode: ExtMode,
    },
    MulWord {
        signed: bool,
        src: EffectiveAddress,
        dst: u8,
    },
    DivWord {
        signed: bool,
        src: EffectiveAddress,
        dst: u8,
    },
    MulLong {
        signed: bool,
        src: EffectiveAddress,
        low: u8,
        high: Option<u8>,
    },
    DivLong {
        signed: bool,
        src: EffectiveAddress,
        quotient: u8,
        remainder: u8,
        wide: bool,
    },
    Exg {
        mode: ExgMode,
        x: u8,
        y: u8,
    },
    Link {
        reg: u8,
        displacement: i32,
    },
    Unlk {
        reg: u8,
    },
    Jmp {
        target: EffectiveAddress,
    },
    Jsr {
        target: EffectiveAddress,
    },
    Bra {
        target: u32,
    },
    Bsr {
        target: u32,
    },
    Bcc {
        condition: Condition,
        target: u32,
    },
    DBcc {
        condition: Condition,
        reg: u8,
        target: u32,
    },
    Scc {
        condition: Condition,
        dst: EffectiveAddress,
    },
    Chk {
        size: Size,
        src: EffectiveAddress,
        reg: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub address: u32,
    pub opcode: u16,
    pub length: u32,
    pub kind: InstructionKind,
}

impl Instruction {
    /// Statically known control-flow or data target, used to place labels.
    pub fn branch_target(&self) -> Option<u32> {
        match self.kind {
            InstructionKind::Bra { target }
            | InstructionKind::Bsr { target }
            | InstructionKind::Bcc { target, .. }
            | InstructionKind::DBcc { target, .. } => Some(target),
            InstructionKind::Jmp { target } | InstructionKind::Jsr { target } => {
                target.static_target()
            }
            InstructionKind::Lea { src, .. } | InstructionKind::Pea { src } => {
                if src.is_pc_relative() {
                    src.static_target()
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

struct Cursor<'a, R: CodeReader + ?Sized> {
    reader: &'a R,
    start: u32,
    pos: u32,
    opcode: u16,
}

impl<R: CodeReader + ?Sized> Cursor<'_, R> {
    fn next_u16(&mut self) -> EmuResult<u16> {
        let word = self.reader.read_u16b(self.pos)?;
        self.pos = self.pos.wrapping_add(2);
        Ok(word)
    }

    fn next_u32(&mut self) -> EmuResult<u32> {
        let long = self.reader.read_u32b(self.pos)?;
        self.pos = self.pos.wrapping_add(4);
        Ok(long)
    }

    fn immediate(&mut self, size: Size) -> EmuResult<u32> {
        match size {
            Size::Byte => Ok((self.next_u16()? & 0xFF) as u32),
            Size::Word => Ok(self.next_u16()? as u32),
            Size::Long => self.next_u32(),
        }
    }

    fn invalid(&self, reason: &str) -> EmulatorError {
        EmulatorError::decode(self.start, self.opcode as u32, reason)
    }

    fn ea(&mut self, mode: u16, reg: u16, size: Size) -> EmuResult<EffectiveAddress> {
        let reg = (reg & 7) as u8;
        Ok(match mode & 7 {
            0 => EffectiveAddress::DataReg(reg),
            1 => EffectiveAddress::AddrReg(reg),
            2 => EffectiveAddress::Indirect(reg),
            3 => EffectiveAddress::PostIncrement(reg),
            4 => EffectiveAddress::PreDecrement(reg),
            5 => EffectiveAddress::Displacement {
                reg,
                disp: self.next_u16()? as i16,
            },
            6 => EffectiveAddress::Indexed {
                reg,
                ext: self.index_extension()?,
            },
            _ => match reg {
                0 => EffectiveAddress::AbsoluteShort(self.next_u16()? as i16),
                1 => EffectiveAddress::AbsoluteLong(self.next_u32()?),
                2 => {
                    let base = self.pos;
                    EffectiveAddress::PcDisplacement {
                        base,
                        disp: self.next_u16()? as i16,
                    }
                }
                3 => {
                    let base = self.pos;
                    EffectiveAddress::PcIndexed {
                        base,
                        ext: self.index_extension()?,
                    }
                }
                4 => EffectiveAddress::Immediate(self.immediate(size)?),
                _ => return Err(self.invalid("invalid addressing mode")),
            },
        })
    }

    /// Source operand from the low six bits of the opcode.
    fn low_ea(&mut self, size: Size) -> EmuResult<EffectiveAddress> {
        self.ea(self.opcode >> 3, self.opcode, size)
    }

    fn index_extension(&mut self) -> EmuResult<IndexExtension> {
        let ext = self.next_u16()?;
        let index = IndexRegister {
            is_address: ext & 0x8000 != 0,
            reg: ((ext >> 12) & 7) as u8,
            long: ext & 0x0800 != 0,
            scale: 1 << ((ext >> 9) & 3),
        };
        if ext & 0x0100 == 0 {
            return Ok(IndexExtension {
                index: Some(index),
                base_disp: ext as u8 as i8 as i32,
                base_suppressed: false,
                indirection: Indirection::None,
                outer_disp: 0,
                full: false,
            });
        }

        let index_suppressed = ext & 0x0040 != 0;
        let base_disp = match (ext >> 4) & 3 {
            1 => 0,
            2 => self.next_u16()? as i16 as i32,
            3 => self.next_u32()? as i32,
            _ => return Err(self.invalid("reserved base displacement size")),
        };
        let iis = ext & 7;
        let indirection = match (index_suppressed, iis) {
            (_, 0) => Indirection::None,
            (_, 1..=3) => Indirection::PreIndexed,
            (false, 5..=7) => Indirection::PostIndexed,
            _ => return Err(self.invalid("reserved index/indirect selection")),
        };
        let outer_disp = match iis & 3 {
            2 => self.next_u16()? as i16 as i32,
            3 => self.next_u32()? as i32,
            _ => 0,
        };
        Ok(IndexExtension {
            index: (!index_suppressed).then_some(index),
            base_disp,
            base_suppressed: ext & 0x0080 != 0,
            indirection,
            outer_disp,
            full: true,
        })
    }

    fn branch_target(&mut self, disp8: u8) -> EmuResult<u32> {
        let base = self.start.wrapping_add(2);
        let disp = match disp8 {
            0x00 => self.next_u16()? as i16 as i32,
            0xFF => self.next_u32()? as i32,
            d => d as i8 as i32,
        };
        Ok(base.wrapping_add(disp as u32))
    }
}

/// Decode the instruction at `address`. Extension words are read as needed,
/// so the reader only has to cover the bytes the instruction actually uses.
pub fn decode<R: CodeReader + ?Sized>(reader: &R, address: u32) -> EmuResult<Instruction> {
    let opcode = reader.read_u16b(address)?;
    let mut cur = Cursor {
        reader,
        start: address,
        pos: address.wrapping_add(2),
        opcode,
    };
    let kind = match opcode >> 12 {
        0x0 => decode_group_0(&mut cur)?,
        0x1 | 0x2 | 0x3 => decode_move(&mut cur)?,
        0x4 => decode_group_4(&mut cur)?,
        0x5 => decode_group_5(&mut cur)?,
        0x6 => {
            let target = cur.branch_target(opcode as u8)?;
            match Condition::from(opcode >> 8) {
                Condition::True => InstructionKind::Bra { target },
                Condition::False => InstructionKind::Bsr { target },
                condition => InstructionKind::Bcc { condition, target },
            }
        }
        0x7 => {
            if opcode & 0x0100 != 0 {
                return Err(cur.invalid("invalid moveq encoding"));
            }
            InstructionKind::Moveq {
                data: opcode as u8 as i8,
                dst: ((opcode >> 9) & 7) as u8,
            }
        }
        0x8 => decode_or_div(&mut cur)?,
        0x9 | 0xD => decode_add_sub(&mut cur)?,
        0xA => InstructionKind::ATrap { word: opcode },
        0xB => decode_cmp_eor(&mut cur)?,
        0xC => decode_and_mul(&mut cur)?,
        0xE => decode_shift(&mut cur)?,
        _ => return Err(cur.invalid("F-line (coprocessor) opcode")),
    };
    Ok(Instruction {
        address,
        opcode,
        length: cur.pos.wrapping_sub(address),
        kind,
    })
}

fn decode_group_0<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let mode = (op >> 3) & 7;

    if op & 0x0100 != 0 {
        let data_reg = ((op >> 9) & 7) as u8;
        if mode == 1 {
            let size = if op & 0x0040 != 0 { Size::Long } else { Size::Word };
            return Ok(InstructionKind::Movep {
                size,
                data_reg,
                addr_reg: (op & 7) as u8,
                displacement: cur.next_u16()? as i16,
                to_memory: op & 0x0080 != 0,
            });
        }
        let bit_op = bit_op_from_bits(op >> 6);
        let dst = cur.low_ea(Size::Byte)?;
        if bit_op != BitOp::Tst && !dst.is_data_alterable() {
            return Err(cur.invalid("bit operation on a non-alterable operand"));
        }
        return Ok(InstructionKind::Bit {
            op: bit_op,
            bit: BitNumber::Register(data_reg),
            dst,
        });
    }

    let imm_op = match (op >> 9) & 7 {
        0 => ImmediateOp::Or,
        1 => ImmediateOp::And,
        2 => ImmediateOp::Sub,
        3 => ImmediateOp::Add,
        4 => {
            let bit_op = bit_op_from_bits(op >> 6);
            let bit = (cur.next_u16()? & 0xFF) as u8;
            let dst = cur.low_ea(Size::Byte)?;
            if matches!(dst, EffectiveAddress::AddrReg(_) | EffectiveAddress::Immediate(_)) {
                return Err(cur.invalid("bit operation on an invalid operand"));
            }
            return Ok(InstructionKind::Bit {
                op: bit_op,
                bit: BitNumber::Immediate(bit),
                dst,
            });
        }
        5 => ImmediateOp::Eor,
        6 => ImmediateOp::Cmp,
        _ => return Err(cur.invalid("moves is privileged")),
    };

    if matches!(imm_op, ImmediateOp::Or | ImmediateOp::And | ImmediateOp::Eor) {
        match op & 0xFF {
            0x3C => {
                let imm = (cur.next_u16()? & 0xFF) as u8;
                return Ok(InstructionKind::ImmediateToCcr { op: imm_op, imm });
            }
            0x7C => return Err(cur.invalid("immediate to SR is privileged")),
            _ => {}
        }
    }

    let size = Size::from_bits(op >> 6).ok_or_else(|| cur.invalid("unsupported 68020 immediate form"))?;
    let imm = cur.immediate(size)?;
    let dst = cur.low_ea(size)?;
    let valid = if imm_op == ImmediateOp::Cmp {
        !matches!(dst, EffectiveAddress::AddrReg(_) | EffectiveAddress::Immediate(_))
    } else {
        dst.is_data_alterable()
    };
    if !valid {
        return Err(cur.invalid("invalid destination for immediate operation"));
    }
    Ok(InstructionKind::Immediate {
        op: imm_op,
        size,
        imm,
        dst,
    })
}

fn bit_op_from_bits(bits: u16) -> BitOp {
    match bits & 3 {
        0 => BitOp::Tst,
        1 => BitOp::Chg,
        2 => BitOp::Clr,
        _ => BitOp::Set,
    }
}

fn decode_move<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let size = match op >> 12 {
        1 => Size::Byte,
        3 => Size::Word,
        _ => Size::Long,
    };
    let src = cur.low_ea(size)?;
    let dst_mode = (op >> 6) & 7;
    let dst_reg = (op >> 9) & 7;
    if dst_mode == 1 {
        if size == Size::Byte {
            return Err(cur.invalid("movea.b does not exist"));
        }
        return Ok(InstructionKind::Movea {
            size,
            src,
            dst: dst_reg as u8,
        });
    }
    if size == Size::Byte && matches!(src, EffectiveAddress::AddrReg(_)) {
        return Err(cur.invalid("byte move from an address register"));
    }
    let dst = cur.ea(dst_mode, dst_reg, size)?;
    if !dst.is_data_alterable() {
        return Err(cur.invalid("invalid move destination"));
    }
    Ok(InstructionKind::Move { size, src, dst })
}

fn decode_group_4<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let reg = (op & 7) as u8;
    let mode = (op >> 3) & 7;

    match op {
        0x4AFC => return Err(cur.invalid("illegal instruction")),
        0x4E70 => return Ok(InstructionKind::Reset),
        0x4E71 => return Ok(InstructionKind::Nop),
        0x4E72 | 0x4E73 | 0x4E7A | 0x4E7B => {
            return Err(cur.invalid("privileged instruction"));
        }
        0x4E74 => {
            return Ok(InstructionKind::Rtd {
                displacement: cur.next_u16()? as i16,
            });
        }
        0x4E75 => return Ok(InstructionKind::Rts),
        0x4E76 => return Ok(InstructionKind::TrapV),
        0x4E77 => return Ok(InstructionKind::Rtr),
        _ => {}
    }

    match op & 0xFFF0 {
        0x4E40 => return Ok(InstructionKind::Trap { vector: (op & 0xF) as u8 }),
        0x4E60 => return Err(cur.invalid("move usp is privileged")),
        _ => {}
    }

    match op & 0xFFF8 {
        0x4E50 => {
            return Ok(InstructionKind::Link {
                reg,
                displacement: cur.next_u16()? as i16 as i32,
            });
        }
        0x4E58 => return Ok(InstructionKind::Unlk { reg }),
        0x4808 => {
            return Ok(InstructionKind::Link {
                reg,
                displacement: cur.next_u32()? as i32,
            });
        }
        0x4840 => return Ok(InstructionKind::Swap { reg }),
        0x4848 => return Err(cur.invalid("bkpt")),
        0x4880 => {
            return Ok(InstructionKind::Ext {
                reg,
                mode: ExtMode::ByteToWord,
            });
        }
        0x48C0 => {
            return Ok(InstructionKind::Ext {
                reg,
                mode: ExtMode::WordToLong,
            });
        }
        0x49C0 => {
            return Ok(InstructionKind::Ext {
                reg,
                mode: ExtMode::ByteToLong,
            });
        }
        _ => {}
    }

    match op & 0xFFC0 {
        0x4E80 | 0x4EC0 => {
            let target = cur.low_ea(Size::Long)?;
            if !target.is_control() {
                return Err(cur.invalid("jump to a non-control operand"));
            }
            return Ok(if op & 0x0040 == 0 {
                InstructionKind::Jsr { target }
            } else {
                InstructionKind::Jmp { target }
            });
        }
        0x4840 => {
            let src = cur.low_ea(Size::Long)?;
            if !src.is_control() {
                return Err(cur.invalid("pea of a non-control operand"));
            }
            return Ok(InstructionKind::Pea { src });
        }
        0x4800 => {
            let dst = cur.low_ea(Size::Byte)?;
            if !dst.is_data_alterable() {
                return Err(cur.invalid("invalid nbcd operand"));
            }
            return Ok(InstructionKind::Nbcd { dst });
        }
        0x40C0 => {
            let dst = cur.low_ea(Size::Word)?;
            if !dst.is_data_alterable() {
                return Err(cur.invalid("invalid move from sr destination"));
            }
            return Ok(InstructionKind::MoveFromSr { dst });
        }
        0x44C0 => {
            let src = cur.low_ea(Size::Word)?;
            return Ok(InstructionKind::MoveToCcr { src });
        }
        0x46C0 => return Err(cur.invalid("move to sr is privileged")),
        0x4AC0 => {
            let dst = cur.low_ea(Size::Byte)?;
            if !dst.is_data_alterable() {
                return Err(cur.invalid("invalid tas operand"));
            }
            return Ok(InstructionKind::Tas { dst });
        }
        0x4C00 | 0x4C40 => {
            let ext = cur.next_u16()?;
            let src = cur.low_ea(Size::Long)?;
            let signed = ext & 0x0800 != 0;
            let wide = ext & 0x0400 != 0;
            let low = ((ext >> 12) & 7) as u8;
            let other = (ext & 7) as u8;
            return Ok(if op & 0x0040 == 0 {
                InstructionKind::MulLong {
                    signed,
                    src,
                    low,
                    high: wide.then_some(other),
                }
            } else {
                InstructionKind::DivLong {
                    signed,
                    src,
                    quotient: low,
                    remainder: other,
                    wide,
                }
            });
        }
        _ => {}
    }

    if op & 0xFB80 == 0x4880 && mode >= 2 {
        let size = if op & 0x0040 != 0 { Size::Long } else { Size::Word };
        let to_memory = op & 0x0400 == 0;
        let mask = cur.next_u16()?;
        let ea = cur.low_ea(size)?;
        let valid = if to_memory {
            (ea.is_control() && !ea.is_pc_relative())
                || matches!(ea, EffectiveAddress::PreDecrement(_))
        } else {
            ea.is_control() || matches!(ea, EffectiveAddress::PostIncrement(_))
        };
        if !valid {
            return Err(cur.invalid("invalid movem operand"));
        }
        return Ok(InstructionKind::Movem {
            size,
            to_memory,
            mask,
            ea,
        });
    }

    if op & 0xF1C0 == 0x41C0 {
        let src = cur.low_ea(Size::Long)?;
        if !src.is_control() {
            return Err(cur.invalid("lea of a non-control operand"));
        }
        return Ok(InstructionKind::Lea {
            src,
            dst: ((op >> 9) & 7) as u8,
        });
    }

    if op & 0xF140 == 0x4100 {
        let size = match (op >> 7) & 3 {
            3 => Size::Word,
            2 => Size::Long,
            _ => return Err(cur.invalid("invalid chk size")),
        };
        let src = cur.low_ea(size)?;
        return Ok(InstructionKind::Chk {
            size,
            src,
            reg: ((op >> 9) & 7) as u8,
        });
    }

    let Some(size) = Size::from_bits(op >> 6) else {
        return Err(cur.invalid("unknown group 4 opcode"));
    };
    let unary = match (op >> 8) & 0xF {
        0x0 => Some(UnaryOp::Negx),
        0x2 => Some(UnaryOp::Clr),
        0x4 => Some(UnaryOp::Neg),
        0x6 => Some(UnaryOp::Not),
        0xA => None,
        _ => return Err(cur.invalid("unknown group 4 opcode")),
    };
    let ea = cur.low_ea(size)?;
    match unary {
        Some(op) => {
            if !ea.is_data_alterable() {
                return Err(cur.invalid("invalid unary operand"));
            }
            Ok(InstructionKind::Unary { op, size, dst: ea })
        }
        None => {
            if size == Size::Byte && matches!(ea, EffectiveAddress::AddrReg(_)) {
                return Err(cur.invalid("tst.b of an address register"));
            }
            Ok(InstructionKind::Tst { size, src: ea })
        }
    }
}

fn decode_group_5<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let condition = Condition::from(op >> 8);
    match Size::from_bits(op >> 6) {
        None => {
            let mode = (op >> 3) & 7;
            if mode == 1 {
                let base = cur.pos;
                let disp = cur.next_u16()? as i16;
                return Ok(InstructionKind::DBcc {
                    condition,
                    reg: (op & 7) as u8,
                    target: base.wrapping_add(disp as i32 as u32),
                });
            }
            if mode == 7 && (op & 7) >= 2 {
                return Err(cur.invalid("trapcc is not supported"));
            }
            let dst = cur.low_ea(Size::Byte)?;
            if !dst.is_data_alterable() {
                return Err(cur.invalid("invalid scc operand"));
            }
            Ok(InstructionKind::Scc { condition, dst })
        }
        Some(size) => {
            let data = match ((op >> 9) & 7) as u8 {
                0 => 8,
                d => d,
            };
            let dst = cur.low_ea(size)?;
            let valid = match dst {
                EffectiveAddress::AddrReg(_) => size != Size::Byte,
                other => other.is_data_alterable(),
            };
            if !valid {
                return Err(cur.invalid("invalid quick operand"));
            }
            Ok(InstructionKind::Quick {
                add: op & 0x0100 == 0,
                size,
                data,
                dst,
            })
        }
    }
}

/// The shared `Dn op <ea>` / `<ea> op Dn` layout of groups 8, 9, B, C, D.
fn decode_binary<R: CodeReader + ?Sized>(
    cur: &mut Cursor<R>,
    op: BinaryOp,
) -> EmuResult<InstructionKind> {
    let opcode = cur.opcode;
    let reg = ((opcode >> 9) & 7) as u8;
    let opmode = (opcode >> 6) & 7;
    let size = Size::from_bits(opmode).ok_or_else(|| cur.invalid("invalid size"))?;
    let ea = cur.low_ea(size)?;
    let operands = if opmode & 4 == 0 {
        if size == Size::Byte && matches!(ea, EffectiveAddress::AddrReg(_)) {
            return Err(cur.invalid("byte operation on an address register"));
        }
        if matches!(op, BinaryOp::Or | BinaryOp::And) && matches!(ea, EffectiveAddress::AddrReg(_))
        {
            return Err(cur.invalid("logical operation on an address register"));
        }
        Operands::EaToDn { src: ea, dst: reg }
    } else {
        let valid = if op == BinaryOp::Eor {
            ea.is_data_alterable()
        } else {
            ea.is_memory_alterable()
        };
        if !valid {
            return Err(cur.invalid("invalid destination operand"));
        }
        Operands::DnToEa { src: reg, dst: ea }
    };
    Ok(InstructionKind::Binary { op, size, operands })
}

fn decode_extended<R: CodeReader + ?Sized>(
    cur: &mut Cursor<R>,
    op: ExtendedOp,
    size: Size,
) -> InstructionKind {
    let opcode = cur.opcode;
    InstructionKind::Extended {
        op,
        size,
        src: (opcode & 7) as u8,
        dst: ((opcode >> 9) & 7) as u8,
        memory: opcode & 0x0008 != 0,
    }
}

fn decode_or_div<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let dst = ((op >> 9) & 7) as u8;
    match (op >> 6) & 7 {
        3 | 7 => {
            let src = cur.low_ea(Size::Word)?;
            if matches!(src, EffectiveAddress::AddrReg(_)) {
                return Err(cur.invalid("divide by an address register"));
            }
            return Ok(InstructionKind::DivWord {
                signed: op & 0x0100 != 0,
                src,
                dst,
            });
        }
        _ => {}
    }
    match op & 0x01F0 {
        0x0100 => return Ok(decode_extended(cur, ExtendedOp::Sbcd, Size::Byte)),
        0x0140 | 0x0180 => return Err(cur.invalid("pack/unpk are not supported")),
        _ => {}
    }
    decode_binary(cur, BinaryOp::Or)
}

fn decode_add_sub<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let is_add = op >> 12 == 0xD;
    let opmode = (op >> 6) & 7;
    if opmode == 3 || opmode == 7 {
        let size = if opmode == 7 { Size::Long } else { Size::Word };
        return Ok(InstructionKind::AddressArith {
            op: if is_add { AddressOp::Add } else { AddressOp::Sub },
            size,
            src: cur.low_ea(size)?,
            dst: ((op >> 9) & 7) as u8,
        });
    }
    if opmode & 4 != 0 && (op >> 3) & 6 == 0 {
        let size = Size::from_bits(opmode).ok_or_else(|| cur.invalid("invalid size"))?;
        let ext = if is_add { ExtendedOp::Addx } else { ExtendedOp::Subx };
        return Ok(decode_extended(cur, ext, size));
    }
    decode_binary(cur, if is_add { BinaryOp::Add } else { BinaryOp::Sub })
}

fn decode_cmp_eor<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let opmode = (op >> 6) & 7;
    let reg = ((op >> 9) & 7) as u8;
    match opmode {
        3 | 7 => {
            let size = if opmode == 7 { Size::Long } else { Size::Word };
            Ok(InstructionKind::AddressArith {
                op: AddressOp::Cmp,
                size,
                src: cur.low_ea(size)?,
                dst: reg,
            })
        }
        0..=2 => decode_binary(cur, BinaryOp::Cmp),
        _ => {
            if (op >> 3) & 7 == 1 {
                let size = Size::from_bits(opmode).ok_or_else(|| cur.invalid("invalid size"))?;
                return Ok(InstructionKind::Cmpm {
                    size,
                    src: (op & 7) as u8,
                    dst: reg,
                });
            }
            decode_binary(cur, BinaryOp::Eor)
        }
    }
}

fn decode_and_mul<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let x = ((op >> 9) & 7) as u8;
    let y = (op & 7) as u8;
    match (op >> 6) & 7 {
        3 | 7 => {
            let src = cur.low_ea(Size::Word)?;
            if matches!(src, EffectiveAddress::AddrReg(_)) {
                return Err(cur.invalid("multiply by an address register"));
            }
            return Ok(InstructionKind::MulWord {
                signed: op & 0x0100 != 0,
                src,
                dst: x,
            });
        }
        _ => {}
    }
    match op & 0x01F8 {
        0x0140 => {
            return Ok(InstructionKind::Exg {
                mode: ExgMode::DataData,
                x,
                y,
            });
        }
        0x0148 => {
            return Ok(InstructionKind::Exg {
                mode: ExgMode::AddrAddr,
                x,
                y,
            });
        }
        0x0188 => {
            return Ok(InstructionKind::Exg {
                mode: ExgMode::DataAddr,
                x,
                y,
            });
        }
        _ => {}
    }
    if op & 0x01F0 == 0x0100 {
        return Ok(decode_extended(cur, ExtendedOp::Abcd, Size::Byte));
    }
    decode_binary(cur, BinaryOp::And)
}

fn shift_op_from_bits(bits: u16) -> ShiftOp {
    match bits & 3 {
        0 => ShiftOp::Arithmetic,
        1 => ShiftOp::Logical,
        2 => ShiftOp::RotateExtend,
        _ => ShiftOp::Rotate,
    }
}

fn decode_shift<R: CodeReader + ?Sized>(cur: &mut Cursor<R>) -> EmuResult<InstructionKind> {
    let op = cur.opcode;
    let direction = if op & 0x0100 != 0 {
        RightOrLeft::Left
    } else {
        RightOrLeft::Right
    };
    match Size::from_bits(op >> 6) {
        None => {
            if op & 0x0800 != 0 {
                return Err(cur.invalid("bit field instructions are not supported"));
            }
            let dst = cur.low_ea(Size::Word)?;
            if !dst.is_memory_alterable() {
                return Err(cur.invalid("invalid memory shift operand"));
            }
            Ok(InstructionKind::ShiftMemory {
                op: shift_op_from_bits(op >> 9),
                direction,
                dst,
            })
        }
        Some(size) => {
            let field = ((op >> 9) & 7) as u8;
            let count = if op & 0x0020 != 0 {
                ShiftCount::Register(field)
            } else {
                ShiftCount::Immediate(if field == 0 { 8 } else { field })
            };
            Ok(InstructionKind::ShiftRegister {
                op: shift_op_from_bits(op >> 3),
                direction,
                size,
                count,
                reg: (op & 7) as u8,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CodeSlice;

    fn decode_bytes(bytes: &[u8], address: u32) -> EmuResult<Instruction> {
        decode(&CodeSlice::new(bytes, address), address)
    }

    #[test]
    fn move_long_immediate() {
        let inst = decode_bytes(&[0x20, 0x3C, 0x00, 0x00, 0x00, 0x2A], 0x1000).unwrap();
        assert_eq!(inst.length, 6);
        assert_eq!(
            inst.kind,
            InstructionKind::Move {
                size: Size::Long,
                src: EffectiveAddress::Immediate(0x2A),
                dst: EffectiveAddress::DataReg(0),
            }
        );
    }

    #[test]
    fn pc_relative_base_is_the_extension_word() {
        // btst #3, (0x10,pc): the displacement follows the bit number.
        let inst = decode_bytes(&[0x08, 0x3A, 0x00, 0x03, 0x00, 0x10], 0x2000).unwrap();
        let InstructionKind::Bit { dst, .. } = inst.kind else {
            panic!("expected a bit operation, got {:?}", inst.kind);
        };
        assert_eq!(dst.static_target(), Some(0x2004 + 0x10));
    }

    #[test]
    fn branches_record_targets() {
        let inst = decode_bytes(&[0x66, 0xFC], 0x100).unwrap();
        assert_eq!(
            inst.kind,
            InstructionKind::Bcc {
                condition: Condition::NotEqual,
                target: 0xFE
            }
        );
        let inst = decode_bytes(&[0x61, 0xFF, 0x00, 0x00, 0x01, 0x00], 0x100).unwrap();
        assert_eq!(inst.kind, InstructionKind::Bsr { target: 0x202 });
        assert_eq!(inst.branch_target(), Some(0x202));
    }

    #[test]
    fn full_format_index() {
        // move.l ([0x10,a0],d1.l*4,0x20), d2
        let bytes = [0x24, 0x30, 0x1D, 0x26, 0x00, 0x10, 0x00, 0x20];
        let inst = decode_bytes(&bytes, 0).unwrap();
        let InstructionKind::Move { src, .. } = inst.kind else {
            panic!("expected move");
        };
        let EffectiveAddress::Indexed { reg: 0, ext } = src else {
            panic!("expected indexed operand, got {src:?}");
        };
        assert!(ext.full);
        assert_eq!(ext.base_disp, 0x10);
        assert_eq!(ext.outer_disp, 0x20);
        assert_eq!(ext.indirection, Indirection::PostIndexed);
        assert_eq!(ext.index.map(|i| i.scale), Some(4));
        assert_eq!(inst.length, 8);
    }

    #[test]
    fn a_line_and_reset() {
        assert_eq!(
            decode_bytes(&[0xA9, 0xF0], 0).unwrap().kind,
            InstructionKind::ATrap { word: 0xA9F0 }
        );
        assert_eq!(decode_bytes(&[0x4E, 0x70], 0).unwrap().kind, InstructionKind::Reset);
    }

    #[test]
    fn privileged_and_unknown_opcodes_fail() {
        for word in [0x46FCu16, 0x4E73, 0x4AFC, 0xF200, 0x007C] {
            let bytes = word.to_be_bytes();
            let err = decode_bytes(&[bytes[0], bytes[1], 0, 0, 0, 0], 0).unwrap_err();
            assert!(
                matches!(err, EmulatorError::Decode { opcode, .. } if opcode == word as u32),
                "{word:04X}: {err}"
            );
        }
    }

    #[test]
    fn truncated_extension_is_a_memory_error() {
        let err = decode_bytes(&[0x20, 0x3C, 0x00], 0).unwrap_err();
        assert!(matches!(err, EmulatorError::Memory(_)));
    }
}
