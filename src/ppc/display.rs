use std::fmt;

use super::decoder::{
    ArithOp, ArithUnaryOp, BarrierKind, BranchRegister, CacheOp, CrOp, Instruction,
    LogicalImmOp, LogicalOp, Offset, ShiftOp, Spr, TrapOperand, UnaryOp, Width,
};
use crate::emulator::format_signed_hex;

struct R(u8);

impl fmt::Display for R {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

fn dot(record: bool) -> &'static str {
    if record { "." } else { "" }
}

impl fmt::Display for Spr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Spr::Xer => "xer",
            Spr::Lr => "lr",
            Spr::Ctr => "ctr",
            Spr::Srr0 => "srr0",
            Spr::Srr1 => "srr1",
        })
    }
}

impl ArithOp {
    fn mnemonic(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Addc => "addc",
            ArithOp::Adde => "adde",
            ArithOp::Subf => "subf",
            ArithOp::Subfc => "subfc",
            ArithOp::Subfe => "subfe",
            ArithOp::Mullw => "mullw",
            ArithOp::Mulhw => "mulhw",
            ArithOp::Mulhwu => "mulhwu",
            ArithOp::Divw => "divw",
            ArithOp::Divwu => "divwu",
        }
    }
}

impl ArithUnaryOp {
    fn mnemonic(self) -> &'static str {
        match self {
            ArithUnaryOp::Neg => "neg",
            ArithUnaryOp::Addze => "addze",
            ArithUnaryOp::Addme => "addme",
            ArithUnaryOp::Subfze => "subfze",
            ArithUnaryOp::Subfme => "subfme",
        }
    }
}

impl LogicalOp {
    fn mnemonic(self) -> &'static str {
        match self {
            LogicalOp::And => "and",
            LogicalOp::Andc => "andc",
            LogicalOp::Or => "or",
            LogicalOp::Orc => "orc",
            LogicalOp::Xor => "xor",
            LogicalOp::Nand => "nand",
            LogicalOp::Nor => "nor",
            LogicalOp::Eqv => "eqv",
        }
    }
}

impl CrOp {
    fn mnemonic(self) -> &'static str {
        match self {
            CrOp::And => "crand",
            CrOp::Andc => "crandc",
            CrOp::Eqv => "creqv",
            CrOp::Nand => "crnand",
            CrOp::Nor => "crnor",
            CrOp::Or => "cror",
            CrOp::Orc => "crorc",
            CrOp::Xor => "crxor",
        }
    }
}

/// Simplified mnemonic stem for a conditional branch, e.g. `bne` or `bdnz`.
/// `None` when only the raw `bc BO, BI` form describes it.
fn branch_stem(bo: u8, bi: u8) -> Option<String> {
    const TRUE: [&str; 4] = ["lt", "gt", "eq", "so"];
    const FALSE: [&str; 4] = ["ge", "le", "ne", "ns"];
    let cond = (bi & 3) as usize;
    let field = bi >> 2;
    let stem = match bo & 0x1E {
        0x04 | 0x06 => format!("b{}", FALSE[cond]),
        0x0C | 0x0E => format!("b{}", TRUE[cond]),
        0x10 | 0x18 => return Some(String::from("bdnz")),
        0x12 | 0x1A => return Some(String::from("bdz")),
        0x14 => return Some(String::from("b")),
        _ => return None,
    };
    Some(if field != 0 {
        format!("{stem} cr{field},")
    } else {
        stem
    })
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::AddImmediate {
                rd,
                ra: 0,
                imm,
                shifted,
            } => {
                let name = if shifted { "lis" } else { "li" };
                write!(f, "{name} {}, {}", R(rd), format_signed_hex(imm as i32))
            }
            Instruction::AddImmediate {
                rd,
                ra,
                imm,
                shifted,
            } => {
                let name = if shifted { "addis" } else { "addi" };
                write!(f, "{name} {}, {}, {}", R(rd), R(ra), format_signed_hex(imm as i32))
            }
            Instruction::AddImmediateCarrying {
                rd,
                ra,
                imm,
                record,
            } => write!(
                f,
                "addic{} {}, {}, {}",
                dot(record),
                R(rd),
                R(ra),
                format_signed_hex(imm as i32)
            ),
            Instruction::SubtractFromImmediate { rd, ra, imm } => {
                write!(f, "subfic {}, {}, {}", R(rd), R(ra), format_signed_hex(imm as i32))
            }
            Instruction::MultiplyImmediate { rd, ra, imm } => {
                write!(f, "mulli {}, {}, {}", R(rd), R(ra), format_signed_hex(imm as i32))
            }
            Instruction::CompareImmediate { crf, ra, imm } => {
                write!(f, "cmpwi cr{crf}, {}, {}", R(ra), format_signed_hex(imm as i32))
            }
            Instruction::CompareLogicalImmediate { crf, ra, imm } => {
                write!(f, "cmplwi cr{crf}, {}, 0x{imm:x}", R(ra))
            }
            Instruction::Compare {
                crf,
                ra,
                rb,
                logical,
            } => {
                let name = if logical { "cmplw" } else { "cmpw" };
                write!(f, "{name} cr{crf}, {}, {}", R(ra), R(rb))
            }
            Instruction::LogicalImmediate {
                op: LogicalImmOp::Ori,
                ra: 0,
                rs: 0,
                imm: 0,
            } => f.write_str("nop"),
            Instruction::LogicalImmediate { op, ra, rs, imm } => {
                let name = match op {
                    LogicalImmOp::Ori => "ori",
                    LogicalImmOp::Oris => "oris",
                    LogicalImmOp::Xori => "xori",
                    LogicalImmOp::Xoris => "xoris",
                    LogicalImmOp::Andi => "andi.",
                    LogicalImmOp::Andis => "andis.",
                };
                write!(f, "{name} {}, {}, 0x{imm:x}", R(ra), R(rs))
            }
            Instruction::Arith {
                op,
                rd,
                ra,
                rb,
                oe,
                record,
            } => write!(
                f,
                "{}{}{} {}, {}, {}",
                op.mnemonic(),
                if oe { "o" } else { "" },
                dot(record),
                R(rd),
                R(ra),
                R(rb)
            ),
            Instruction::ArithUnary {
                op,
                rd,
                ra,
                oe,
                record,
            } => write!(
                f,
                "{}{}{} {}, {}",
                op.mnemonic(),
                if oe { "o" } else { "" },
                dot(record),
                R(rd),
                R(ra)
            ),
            Instruction::Logical {
                op: LogicalOp::Or,
                ra,
                rs,
                rb,
                record,
            } if rs == rb => write!(f, "mr{} {}, {}", dot(record), R(ra), R(rs)),
            Instruction::Logical {
                op,
                ra,
                rs,
                rb,
                record,
            } => write!(f, "{}{} {}, {}, {}", op.mnemonic(), dot(record), R(ra), R(rs), R(rb)),
            Instruction::Shift {
                op,
                ra,
                rs,
                rb,
                record,
            } => {
                let name = match op {
                    ShiftOp::Slw => "slw",
                    ShiftOp::Srw => "srw",
                    ShiftOp::Sraw => "sraw",
                };
                write!(f, "{name}{} {}, {}, {}", dot(record), R(ra), R(rs), R(rb))
            }
            Instruction::ShiftRightAlgebraicImmediate { ra, rs, sh, record } => {
                write!(f, "srawi{} {}, {}, {sh}", dot(record), R(ra), R(rs))
            }
            Instruction::Unary { op, ra, rs, record } => {
                let name = match op {
                    UnaryOp::Extsb => "extsb",
                    UnaryOp::Extsh => "extsh",
                    UnaryOp::Cntlzw => "cntlzw",
                };
                write!(f, "{name}{} {}, {}", dot(record), R(ra), R(rs))
            }
            Instruction::RotateMask {
                insert,
                ra,
                rs,
                sh,
                mb,
                me,
                record,
            } => {
                let name = if insert { "rlwimi" } else { "rlwinm" };
                write!(f, "{name}{} {}, {}, {sh}, {mb}, {me}", dot(record), R(ra), R(rs))
            }
            Instruction::RotateMaskRegister {
                ra,
                rs,
                rb,
                mb,
                me,
                record,
            } => write!(
                f,
                "rlwnm{} {}, {}, {}, {mb}, {me}",
                dot(record),
                R(ra),
                R(rs),
                R(rb)
            ),
            Instruction::Branch { target, link } => {
                write!(f, "b{} 0x{target:08x}", if link { "l" } else { "" })
            }
            Instruction::BranchConditional {
                bo,
                bi,
                target,
                link,
            } => {
                let l = if link { "l" } else { "" };
                match branch_stem(bo, bi) {
                    Some(stem) => match stem.split_once(' ') {
                        Some((name, field)) => write!(f, "{name}{l} {field} 0x{target:08x}"),
                        None => write!(f, "{stem}{l} 0x{target:08x}"),
                    },
                    None => write!(f, "bc{l} {bo}, {bi}, 0x{target:08x}"),
                }
            }
            Instruction::BranchConditionalToRegister { bo, bi, to, link } => {
                let reg = match to {
                    BranchRegister::Lr => "lr",
                    BranchRegister::Ctr => "ctr",
                };
                let l = if link { "l" } else { "" };
                match branch_stem(bo, bi) {
                    Some(stem) => match stem.split_once(' ') {
                        Some((name, field)) => {
                            write!(f, "{name}{reg}{l} {}", field.trim_end_matches(','))
                        }
                        None => write!(f, "{stem}{reg}{l}"),
                    },
                    None => write!(f, "bc{reg}{l} {bo}, {bi}"),
                }
            }
            Instruction::ConditionRegisterLogical { op, bt, ba, bb } => {
                write!(f, "{} {bt}, {ba}, {bb}", op.mnemonic())
            }
            Instruction::MoveConditionRegisterField { crfd, crfs } => {
                write!(f, "mcrf cr{crfd}, cr{crfs}")
            }
            Instruction::Load {
                width,
                algebraic,
                rd,
                ra,
                offset,
                update,
            } => {
                let stem = match (width, algebraic) {
                    (Width::Byte, _) => "lbz",
                    (Width::Half, false) => "lhz",
                    (Width::Half, true) => "lha",
                    (Width::Word, _) => "lwz",
                };
                write_memory_op(f, stem, update, rd, ra, offset)
            }
            Instruction::Store {
                width,
                rs,
                ra,
                offset,
                update,
            } => {
                let stem = match width {
                    Width::Byte => "stb",
                    Width::Half => "sth",
                    Width::Word => "stw",
                };
                write_memory_op(f, stem, update, rs, ra, offset)
            }
            Instruction::LoadMultiple { rd, ra, disp } => {
                write!(f, "lmw {}, {}({})", R(rd), format_signed_hex(disp as i32), R(ra))
            }
            Instruction::StoreMultiple { rs, ra, disp } => {
                write!(f, "stmw {}, {}({})", R(rs), format_signed_hex(disp as i32), R(ra))
            }
            Instruction::LoadByteReversed { width, rd, ra, rb } => {
                let name = if width == Width::Half { "lhbrx" } else { "lwbrx" };
                write!(f, "{name} {}, {}, {}", R(rd), R(ra), R(rb))
            }
            Instruction::StoreByteReversed { width, rs, ra, rb } => {
                let name = if width == Width::Half { "sthbrx" } else { "stwbrx" };
                write!(f, "{name} {}, {}, {}", R(rs), R(ra), R(rb))
            }
            Instruction::MoveFromSpr { rd, spr } => write!(f, "mf{spr} {}", R(rd)),
            Instruction::MoveToSpr { rs, spr } => write!(f, "mt{spr} {}", R(rs)),
            Instruction::MoveFromTimeBase { rd, upper } => {
                write!(f, "mftb{} {}", if upper { "u" } else { "" }, R(rd))
            }
            Instruction::MoveFromCr { rd } => write!(f, "mfcr {}", R(rd)),
            Instruction::MoveToCrFields { mask: 0xFF, rs } => write!(f, "mtcr {}", R(rs)),
            Instruction::MoveToCrFields { mask, rs } => write!(f, "mtcrf 0x{mask:02x}, {}", R(rs)),
            Instruction::TrapWord {
                to: 31,
                ra: 0,
                operand: TrapOperand::Register(0),
            } => f.write_str("trap"),
            Instruction::TrapWord { to, ra, operand } => match operand {
                TrapOperand::Register(rb) => write!(f, "tw {to}, {}, {}", R(ra), R(rb)),
                TrapOperand::Immediate(imm) => {
                    write!(f, "twi {to}, {}, {}", R(ra), format_signed_hex(imm as i32))
                }
            },
            Instruction::SystemCall => f.write_str("sc"),
            Instruction::ReturnFromInterrupt => f.write_str("rfi"),
            Instruction::Barrier(kind) => f.write_str(match kind {
                BarrierKind::Sync => "sync",
                BarrierKind::Isync => "isync",
                BarrierKind::Eieio => "eieio",
            }),
            Instruction::CacheHint { op, ra, rb } => {
                let name = match op {
                    CacheOp::Dcbf => "dcbf",
                    CacheOp::Dcbst => "dcbst",
                    CacheOp::Dcbt => "dcbt",
                    CacheOp::Dcbtst => "dcbtst",
                    CacheOp::Icbi => "icbi",
                };
                write!(f, "{name} {}, {}", R(ra), R(rb))
            }
            Instruction::ZeroCacheBlock { ra, rb } => write!(f, "dcbz {}, {}", R(ra), R(rb)),
        }
    }
}

fn write_memory_op(
    f: &mut fmt::Formatter<'_>,
    stem: &str,
    update: bool,
    rt: u8,
    ra: u8,
    offset: Offset,
) -> fmt::Result {
    let u = if update { "u" } else { "" };
    match offset {
        Offset::Displacement(disp) => write!(
            f,
            "{stem}{u} {}, {}({})",
            R(rt),
            format_signed_hex(disp as i32),
            R(ra)
        ),
        Offset::Indexed(rb) => write!(f, "{stem}{u}x {}, {}, {}", R(rt), R(ra), R(rb)),
    }
}
