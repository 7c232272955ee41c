use crate::emulator::{EmuResult, EmulatorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }
}

/// Second half of a load/store effective address: `d(rA)` or `rA + rB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    Displacement(i16),
    Indexed(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spr {
    Xer,
    Lr,
    Ctr,
    Srr0,
    Srr1,
}

impl Spr {
    fn from_number(n: u16) -> Option<Self> {
        match n {
            1 => Some(Spr::Xer),
            8 => Some(Spr::Lr),
            9 => Some(Spr::Ctr),
            26 => Some(Spr::Srr0),
            27 => Some(Spr::Srr1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalImmOp {
    Ori,
    Oris,
    Xori,
    Xoris,
    Andi,
    Andis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Addc,
    Adde,
    Subf,
    Subfc,
    Subfe,
    Mullw,
    Mulhw,
    Mulhwu,
    Divw,
    Divwu,
}

/// XO-form arithmetic that has no rB operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithUnaryOp {
    Neg,
    Addze,
    Addme,
    Subfze,
    Subfme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Andc,
    Or,
    Orc,
    Xor,
    Nand,
    Nor,
    Eqv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Slw,
    Srw,
    Sraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Extsb,
    Extsh,
    Cntlzw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrOp {
    And,
    Andc,
    Eqv,
    Nand,
    Nor,
    Or,
    Orc,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRegister {
    Lr,
    Ctr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    Sync,
    Isync,
    Eieio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Dcbf,
    Dcbst,
    Dcbt,
    Dcbtst,
    Icbi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOperand {
    Register(u8),
    Immediate(i16),
}

/// One decoded PowerPC instruction. Branch targets are already absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// `addi` / `addis`; rA = 0 reads as the literal zero.
    AddImmediate {
        rd: u8,
        ra: u8,
        imm: i16,
        shifted: bool,
    },
    AddImmediateCarrying {
        rd: u8,
        ra: u8,
        imm: i16,
        record: bool,
    },
    SubtractFromImmediate {
        rd: u8,
        ra: u8,
        imm: i16,
    },
    MultiplyImmediate {
        rd: u8,
        ra: u8,
        imm: i16,
    },
    CompareImmediate {
        crf: u8,
        ra: u8,
        imm: i16,
    },
    CompareLogicalImmediate {
        crf: u8,
        ra: u8,
        imm: u16,
    },
    Compare {
        crf: u8,
        ra: u8,
        rb: u8,
        logical: bool,
    },
    LogicalImmediate {
        op: LogicalImmOp,
        ra: u8,
        rs: u8,
        imm: u16,
    },
    Arith {
        op: ArithOp,
        rd: u8,
        ra: u8,
        rb: u8,
        oe: bool,
        record: bool,
    },
    ArithUnary {
        op: ArithUnaryOp,
        rd: u8,
        ra: u8,
        oe: bool,
        record: bool,
    },
    Logical {
        op: LogicalOp,
        ra: u8,
        rs: u8,
        rb: u8,
        record: bool,
    },
    Shift {
        op: ShiftOp,
        ra: u8,
        rs: u8,
        rb: u8,
        record: bool,
    },
    ShiftRightAlgebraicImmediate {
        ra: u8,
        rs: u8,
        sh: u8,
        record: bool,
    },
    Unary {
        op: UnaryOp,
        ra: u8,
        rs: u8,
        record: bool,
    },
    /// `rlwinm` (insert = false) or `rlwimi` (insert = true).
    RotateMask {
        insert: bool,
        ra: u8,
        rs: u8,
        sh: u8,
        mb: u8,
        me: u8,
        record: bool,
    },
    RotateMaskRegister {
        ra: u8,
        rs: u8,
        rb: u8,
        mb: u8,
        me: u8,
        record: bool,
    },
    Branch {
        target: u32,
        link: bool,
    },
    BranchConditional {
        bo: u8,
        bi: u8,
        target: u32,
        link: bool,
    },
    BranchConditionalToRegister {
        bo: u8,
        bi: u8,
        to: BranchRegister,
        link: bool,
    },
    ConditionRegisterLogical {
        op: CrOp,
        bt: u8,
        ba: u8,
        bb: u8,
    },
    MoveConditionRegisterField {
        crfd: u8,
        crfs: u8,
    },
    Load {
        width: Width,
        algebraic: bool,
        rd: u8,
        ra: u8,
        offset: Offset,
        update: bool,
    },
    Store {
        width: Width,
        rs: u8,
        ra: u8,
        offset: Offset,
        update: bool,
    },
    LoadMultiple {
        rd: u8,
        ra: u8,
        disp: i16,
    },
    StoreMultiple {
        rs: u8,
        ra: u8,
        disp: i16,
    },
    LoadByteReversed {
        width: Width,
        rd: u8,
        ra: u8,
        rb: u8,
    },
    StoreByteReversed {
        width: Width,
        rs: u8,
        ra: u8,
        rb: u8,
    },
    MoveFromSpr {
        rd: u8,
        spr: Spr,
    },
    MoveToSpr {
        rs: u8,
        spr: Spr,
    },
    MoveFromTimeBase {
        rd: u8,
        upper: bool,
    },
    MoveFromCr {
        rd: u8,
    },
    MoveToCrFields {
        mask: u8,
        rs: u8,
    },
    TrapWord {
        to: u8,
        ra: u8,
        operand: TrapOperand,
    },
    SystemCall,
    ReturnFromInterrupt,
    Barrier(BarrierKind),
    CacheHint {
        op: CacheOp,
        ra: u8,
        rb: u8,
    },
    ZeroCacheBlock {
        ra: u8,
        rb: u8,
    },
}

impl Instruction {
    /// Statically known branch target, used to place listing labels.
    pub fn branch_target(&self) -> Option<u32> {
        match *self {
            Instruction::Branch { target, .. } | Instruction::BranchConditional { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }
}

/// Field accessors for a raw instruction word.
#[derive(Clone, Copy)]
struct Word(u32);

impl Word {
    fn primary(self) -> u32 {
        self.0 >> 26
    }
    fn d(self) -> u8 {
        ((self.0 >> 21) & 0x1F) as u8
    }
    fn a(self) -> u8 {
        ((self.0 >> 16) & 0x1F) as u8
    }
    fn b(self) -> u8 {
        ((self.0 >> 11) & 0x1F) as u8
    }
    fn c(self) -> u8 {
        ((self.0 >> 6) & 0x1F) as u8
    }
    fn e(self) -> u8 {
        ((self.0 >> 1) & 0x1F) as u8
    }
    fn simm(self) -> i16 {
        self.0 as u16 as i16
    }
    fn uimm(self) -> u16 {
        self.0 as u16
    }
    fn rc(self) -> bool {
        self.0 & 1 != 0
    }
    fn oe(self) -> bool {
        self.0 & 0x400 != 0
    }
    fn xo10(self) -> u32 {
        (self.0 >> 1) & 0x3FF
    }
    fn xo9(self) -> u32 {
        (self.0 >> 1) & 0x1FF
    }
    fn crf(self) -> u8 {
        self.d() >> 2
    }
    fn spr(self) -> u16 {
        (self.a() as u16) | ((self.b() as u16) << 5)
    }
}

pub fn decode(word: u32, address: u32) -> EmuResult<Instruction> {
    let w = Word(word);
    let invalid = |reason: &str| EmulatorError::decode(address, word, reason);

    let inst = match w.primary() {
        3 => Instruction::TrapWord {
            to: w.d(),
            ra: w.a(),
            operand: TrapOperand::Immediate(w.simm()),
        },
        7 => Instruction::MultiplyImmediate {
            rd: w.d(),
            ra: w.a(),
            imm: w.simm(),
        },
        8 => Instruction::SubtractFromImmediate {
            rd: w.d(),
            ra: w.a(),
            imm: w.simm(),
        },
        10 | 11 if w.d() & 0x3 != 0 => return Err(invalid("64-bit compare")),
        10 => Instruction::CompareLogicalImmediate {
            crf: w.crf(),
            ra: w.a(),
            imm: w.uimm(),
        },
        11 => Instruction::CompareImmediate {
            crf: w.crf(),
            ra: w.a(),
            imm: w.simm(),
        },
        12 | 13 => Instruction::AddImmediateCarrying {
            rd: w.d(),
            ra: w.a(),
            imm: w.simm(),
            record: w.primary() == 13,
        },
        14 | 15 => Instruction::AddImmediate {
            rd: w.d(),
            ra: w.a(),
            imm: w.simm(),
            shifted: w.primary() == 15,
        },
        16 => {
            let disp = (word & 0xFFFC) as u16 as i16 as i32 as u32;
            let target = if word & 2 != 0 {
                disp
            } else {
                address.wrapping_add(disp)
            };
            Instruction::BranchConditional {
                bo: w.d(),
                bi: w.a(),
                target,
                link: w.rc(),
            }
        }
        17 if word & 2 != 0 => Instruction::SystemCall,
        18 => {
            // sign-extend the 26-bit LI field
            let disp = (((word & 0x03FF_FFFC) << 6) as i32 >> 6) as u32;
            let target = if word & 2 != 0 {
                disp
            } else {
                address.wrapping_add(disp)
            };
            Instruction::Branch {
                target,
                link: w.rc(),
            }
        }
        19 => decode_group_19(w).ok_or_else(|| invalid("unknown opcode 19 extension"))?,
        20 | 21 => Instruction::RotateMask {
            insert: w.primary() == 20,
            ra: w.a(),
            rs: w.d(),
            sh: w.b(),
            mb: w.c(),
            me: w.e(),
            record: w.rc(),
        },
        23 => Instruction::RotateMaskRegister {
            ra: w.a(),
            rs: w.d(),
            rb: w.b(),
            mb: w.c(),
            me: w.e(),
            record: w.rc(),
        },
        24..=29 => {
            let op = match w.primary() {
                24 => LogicalImmOp::Ori,
                25 => LogicalImmOp::Oris,
                26 => LogicalImmOp::Xori,
                27 => LogicalImmOp::Xoris,
                28 => LogicalImmOp::Andi,
                _ => LogicalImmOp::Andis,
            };
            Instruction::LogicalImmediate {
                op,
                ra: w.a(),
                rs: w.d(),
                imm: w.uimm(),
            }
        }
        31 => decode_group_31(w).ok_or_else(|| invalid("unknown opcode 31 extension"))?,
        op @ 32..=45 => {
            let (width, algebraic, store) = match (op - 32) / 2 {
                0 => (Width::Word, false, false),
                1 => (Width::Byte, false, false),
                2 => (Width::Word, false, true),
                3 => (Width::Byte, false, true),
                4 => (Width::Half, false, false),
                5 => (Width::Half, true, false),
                _ => (Width::Half, false, true),
            };
            let update = op & 1 != 0;
            if update && (w.a() == 0 || (!store && w.a() == w.d())) {
                return Err(invalid("invalid update form"));
            }
            let offset = Offset::Displacement(w.simm());
            if store {
                Instruction::Store {
                    width,
                    rs: w.d(),
                    ra: w.a(),
                    offset,
                    update,
                }
            } else {
                Instruction::Load {
                    width,
                    algebraic,
                    rd: w.d(),
                    ra: w.a(),
                    offset,
                    update,
                }
            }
        }
        46 => Instruction::LoadMultiple {
            rd: w.d(),
            ra: w.a(),
            disp: w.simm(),
        },
        47 => Instruction::StoreMultiple {
            rs: w.d(),
            ra: w.a(),
            disp: w.simm(),
        },
        48..=55 => return Err(invalid("floating-point instructions are not supported")),
        _ => return Err(invalid("unknown primary opcode")),
    };
    Ok(inst)
}

fn decode_group_19(w: Word) -> Option<Instruction> {
    let cr_op = |op| Instruction::ConditionRegisterLogical {
        op,
        bt: w.d(),
        ba: w.a(),
        bb: w.b(),
    };
    Some(match w.xo10() {
        0 => Instruction::MoveConditionRegisterField {
            crfd: w.crf(),
            crfs: w.a() >> 2,
        },
        16 => Instruction::BranchConditionalToRegister {
            bo: w.d(),
            bi: w.a(),
            to: BranchRegister::Lr,
            link: w.rc(),
        },
        528 => Instruction::BranchConditionalToRegister {
            bo: w.d(),
            bi: w.a(),
            to: BranchRegister::Ctr,
            link: w.rc(),
        },
        33 => cr_op(CrOp::Nor),
        50 => Instruction::ReturnFromInterrupt,
        129 => cr_op(CrOp::Andc),
        150 => Instruction::Barrier(BarrierKind::Isync),
        193 => cr_op(CrOp::Xor),
        225 => cr_op(CrOp::Nand),
        257 => cr_op(CrOp::And),
        289 => cr_op(CrOp::Eqv),
        417 => cr_op(CrOp::Orc),
        449 => cr_op(CrOp::Or),
        _ => return None,
    })
}

fn decode_group_31(w: Word) -> Option<Instruction> {
    let (rd, ra, rb, record) = (w.d(), w.a(), w.b(), w.rc());
    let logical = |op| Instruction::Logical {
        op,
        ra,
        rs: rd,
        rb,
        record,
    };
    let shift = |op| Instruction::Shift {
        op,
        ra,
        rs: rd,
        rb,
        record,
    };
    let unary = |op| Instruction::Unary {
        op,
        ra,
        rs: rd,
        record,
    };
    let indexed_load = |width, algebraic, update| Instruction::Load {
        width,
        algebraic,
        rd,
        ra,
        offset: Offset::Indexed(rb),
        update,
    };
    let indexed_store = |width, update| Instruction::Store {
        width,
        rs: rd,
        ra,
        offset: Offset::Indexed(rb),
        update,
    };
    let cache = |op| Instruction::CacheHint { op, ra, rb };

    let inst = match w.xo10() {
        0 | 32 if rd & 0x3 == 0 => Instruction::Compare {
            crf: w.crf(),
            ra,
            rb,
            logical: w.xo10() == 32,
        },
        4 => Instruction::TrapWord {
            to: rd,
            ra,
            operand: TrapOperand::Register(rb),
        },
        19 => Instruction::MoveFromCr { rd },
        23 => indexed_load(Width::Word, false, false),
        24 => shift(ShiftOp::Slw),
        26 => unary(UnaryOp::Cntlzw),
        28 => logical(LogicalOp::And),
        54 => cache(CacheOp::Dcbst),
        55 => indexed_load(Width::Word, false, true),
        60 => logical(LogicalOp::Andc),
        86 => cache(CacheOp::Dcbf),
        87 => indexed_load(Width::Byte, false, false),
        119 => indexed_load(Width::Byte, false, true),
        124 => logical(LogicalOp::Nor),
        144 => Instruction::MoveToCrFields {
            mask: ((w.0 >> 12) & 0xFF) as u8,
            rs: rd,
        },
        151 => indexed_store(Width::Word, false),
        183 => indexed_store(Width::Word, true),
        215 => indexed_store(Width::Byte, false),
        246 => cache(CacheOp::Dcbtst),
        247 => indexed_store(Width::Byte, true),
        278 => cache(CacheOp::Dcbt),
        279 => indexed_load(Width::Half, false, false),
        284 => logical(LogicalOp::Eqv),
        311 => indexed_load(Width::Half, false, true),
        316 => logical(LogicalOp::Xor),
        339 | 371 if matches!(w.spr(), 268 | 269) => Instruction::MoveFromTimeBase {
            rd,
            upper: w.spr() == 269,
        },
        339 => Instruction::MoveFromSpr {
            rd,
            spr: Spr::from_number(w.spr())?,
        },
        343 => indexed_load(Width::Half, true, false),
        375 => indexed_load(Width::Half, true, true),
        407 => indexed_store(Width::Half, false),
        412 => logical(LogicalOp::Orc),
        439 => indexed_store(Width::Half, true),
        444 => logical(LogicalOp::Or),
        467 => Instruction::MoveToSpr {
            rs: rd,
            spr: Spr::from_number(w.spr())?,
        },
        476 => logical(LogicalOp::Nand),
        534 => Instruction::LoadByteReversed {
            width: Width::Word,
            rd,
            ra,
            rb,
        },
        536 => shift(ShiftOp::Srw),
        598 => Instruction::Barrier(BarrierKind::Sync),
        662 => Instruction::StoreByteReversed {
            width: Width::Word,
            rs: rd,
            ra,
            rb,
        },
        790 => Instruction::LoadByteReversed {
            width: Width::Half,
            rd,
            ra,
            rb,
        },
        792 => shift(ShiftOp::Sraw),
        824 => Instruction::ShiftRightAlgebraicImmediate {
            ra,
            rs: rd,
            sh: rb,
            record,
        },
        854 => Instruction::Barrier(BarrierKind::Eieio),
        918 => Instruction::StoreByteReversed {
            width: Width::Half,
            rs: rd,
            ra,
            rb,
        },
        922 => unary(UnaryOp::Extsh),
        954 => unary(UnaryOp::Extsb),
        982 => cache(CacheOp::Icbi),
        1014 => Instruction::ZeroCacheBlock { ra, rb },
        _ => return decode_arith(w),
    };

    match inst {
        Instruction::Load { update: true, .. } | Instruction::Store { update: true, .. }
            if ra == 0 =>
        {
            None
        }
        _ => Some(inst),
    }
}

fn decode_arith(w: Word) -> Option<Instruction> {
    let (rd, ra, rb, oe, record) = (w.d(), w.a(), w.b(), w.oe(), w.rc());
    let arith = |op| Instruction::Arith {
        op,
        rd,
        ra,
        rb,
        oe,
        record,
    };
    let unary = |op| Instruction::ArithUnary {
        op,
        rd,
        ra,
        oe,
        record,
    };
    Some(match w.xo9() {
        8 => arith(ArithOp::Subfc),
        10 => arith(ArithOp::Addc),
        11 if !oe => arith(ArithOp::Mulhwu),
        40 => arith(ArithOp::Subf),
        75 if !oe => arith(ArithOp::Mulhw),
        104 => unary(ArithUnaryOp::Neg),
        136 => arith(ArithOp::Subfe),
        138 => arith(ArithOp::Adde),
        200 => unary(ArithUnaryOp::Subfze),
        202 => unary(ArithUnaryOp::Addze),
        232 => unary(ArithUnaryOp::Subfme),
        234 => unary(ArithUnaryOp::Addme),
        235 => arith(ArithOp::Mullw),
        266 => arith(ArithOp::Add),
        459 => arith(ArithOp::Divwu),
        491 => arith(ArithOp::Divw),
        _ => return None,
    })
}
