use std::fmt;

use crate::emulator::format_signed_hex;

use super::decoder::{
    AddressOp, BinaryOp, BitNumber, BitOp, Condition, EffectiveAddress, ExgMode, ExtMode,
    ExtendedOp, ImmediateOp, IndexExtension, IndexRegister, Indirection, Instruction,
    InstructionKind, Operands, RightOrLeft, ShiftCount, ShiftOp, Size, UnaryOp,
};

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Size::Byte => ".b",
            Size::Word => ".w",
            Size::Long => ".l",
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Condition::True => "t",
            Condition::False => "f",
            Condition::Higher => "hi",
            Condition::LowerOrSame => "ls",
            Condition::CarryClear => "cc",
            Condition::CarrySet => "cs",
            Condition::NotEqual => "ne",
            Condition::Equal => "eq",
            Condition::OverflowClear => "vc",
            Condition::OverflowSet => "vs",
            Condition::Plus => "pl",
            Condition::Minus => "mi",
            Condition::GreaterOrEqual => "ge",
            Condition::LessThan => "lt",
            Condition::GreaterThan => "gt",
            Condition::LessOrEqual => "le",
        })
    }
}

struct D(u8);
struct A(u8);

impl fmt::Display for D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%d{}", self.0)
    }
}

impl fmt::Display for A {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 7 {
            f.write_str("%sp")
        } else {
            write!(f, "%a{}", self.0)
        }
    }
}

impl fmt::Display for IndexRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_address {
            write!(f, "{}", A(self.reg))?;
        } else {
            write!(f, "{}", D(self.reg))?;
        }
        write!(f, "{}", if self.long { ".l" } else { ".w" })?;
        if self.scale != 1 {
            write!(f, "*{}", self.scale)?;
        }
        Ok(())
    }
}

fn format_indexed(f: &mut fmt::Formatter<'_>, base: &str, ext: &IndexExtension) -> fmt::Result {
    let base = if ext.base_suppressed { "" } else { base };
    if !ext.full {
        let index = ext.index.map(|i| i.to_string()).unwrap_or_default();
        return write!(f, "{}({base},{index})", format_signed_hex(ext.base_disp));
    }
    let bd = format_signed_hex(ext.base_disp);
    let index = ext.index.map(|i| format!(",{i}")).unwrap_or_default();
    match ext.indirection {
        Indirection::None => write!(f, "({bd},{base}{index})"),
        Indirection::PreIndexed => write!(
            f,
            "([{bd},{base}{index}],{})",
            format_signed_hex(ext.outer_disp)
        ),
        Indirection::PostIndexed => write!(
            f,
            "([{bd},{base}]{index},{})",
            format_signed_hex(ext.outer_disp)
        ),
    }
}

impl fmt::Display for EffectiveAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EffectiveAddress::DataReg(reg) => write!(f, "{}", D(reg)),
            EffectiveAddress::AddrReg(reg) => write!(f, "{}", A(reg)),
            EffectiveAddress::Indirect(reg) => write!(f, "({})", A(reg)),
            EffectiveAddress::PostIncrement(reg) => write!(f, "({})+", A(reg)),
            EffectiveAddress::PreDecrement(reg) => write!(f, "-({})", A(reg)),
            EffectiveAddress::Displacement { reg, disp } => {
                write!(f, "{}({})", format_signed_hex(disp as i32), A(reg))
            }
            EffectiveAddress::Indexed { reg, ext } => format_indexed(f, &A(reg).to_string(), &ext),
            EffectiveAddress::PcDisplacement { disp, .. } => {
                let target = self.static_target().unwrap_or_default();
                write!(f, "{}(%pc) [0x{target:08x}]", format_signed_hex(disp as i32))
            }
            EffectiveAddress::PcIndexed { ext, .. } => format_indexed(f, "%pc", &ext),
            EffectiveAddress::AbsoluteShort(value) => write!(f, "0x{:04x}.w", value as u16),
            EffectiveAddress::AbsoluteLong(value) => write!(f, "0x{value:08x}.l"),
            EffectiveAddress::Immediate(value) => write!(f, "#0x{value:x}"),
        }
    }
}

impl fmt::Display for ShiftCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShiftCount::Immediate(value) => write!(f, "#{value}"),
            ShiftCount::Register(reg) => write!(f, "{}", D(*reg)),
        }
    }
}

fn shift_mnemonic(op: ShiftOp, direction: RightOrLeft) -> String {
    let stem = match op {
        ShiftOp::Arithmetic => "as",
        ShiftOp::Logical => "ls",
        ShiftOp::RotateExtend => "rox",
        ShiftOp::Rotate => "ro",
    };
    let dir = match direction {
        RightOrLeft::Left => 'l',
        RightOrLeft::Right => 'r',
    };
    format!("{stem}{dir}")
}

fn immediate_mnemonic(op: ImmediateOp) -> &'static str {
    match op {
        ImmediateOp::Or => "ori",
        ImmediateOp::And => "andi",
        ImmediateOp::Sub => "subi",
        ImmediateOp::Add => "addi",
        ImmediateOp::Eor => "eori",
        ImmediateOp::Cmp => "cmpi",
    }
}

/// Register list in `%d0-%d2/%a6` form. `mask` is always in D0 = bit 0 order.
fn format_register_list(mask: u16) -> String {
    let mut groups = Vec::new();
    let mut bit = 0;
    while bit < 16 {
        if mask & (1 << bit) == 0 {
            bit += 1;
            continue;
        }
        let start = bit;
        while bit + 1 < 16 && (bit + 1) % 8 != 0 && mask & (1 << (bit + 1)) != 0 {
            bit += 1;
        }
        let name = |n: u16| {
            if n < 8 {
                D(n as u8).to_string()
            } else {
                A((n - 8) as u8).to_string()
            }
        };
        if start == bit {
            groups.push(name(start));
        } else {
            groups.push(format!("{}-{}", name(start), name(bit)));
        }
        bit += 1;
    }
    groups.join("/")
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            InstructionKind::Reset => f.write_str("reset"),
            InstructionKind::Nop => f.write_str("nop"),
            InstructionKind::Rts => f.write_str("rts"),
            InstructionKind::Rtr => f.write_str("rtr"),
            InstructionKind::Rtd { displacement } => {
                write!(f, "rtd #{}", format_signed_hex(displacement as i32))
            }
            InstructionKind::TrapV => f.write_str("trapv"),
            InstructionKind::Trap { vector } => write!(f, "trap #{vector}"),
            InstructionKind::ATrap { word } => {
                if word & 0x0800 != 0 {
                    write!(f, "trap 0x{word:04x} ; toolbox 0x{:03x}", word & 0x0BFF)
                } else {
                    write!(f, "trap 0x{word:04x} ; os 0x{:02x}", word & 0x00FF)
                }
            }
            InstructionKind::Move { size, src, dst } => write!(f, "move{size} {src}, {dst}"),
            InstructionKind::Movea { size, src, dst } => {
                write!(f, "movea{size} {src}, {}", A(dst))
            }
            InstructionKind::Moveq { data, dst } => {
                write!(f, "moveq #{}, {}", format_signed_hex(data as i32), D(dst))
            }
            InstructionKind::Movem {
                size,
                to_memory,
                mask,
                ea,
            } => {
                let mask = if matches!(ea, EffectiveAddress::PreDecrement(_)) {
                    mask.reverse_bits()
                } else {
                    mask
                };
                let list = format_register_list(mask);
                if to_memory {
                    write!(f, "movem{size} {list}, {ea}")
                } else {
                    write!(f, "movem{size} {ea}, {list}")
                }
            }
            InstructionKind::Movep {
                size,
                data_reg,
                addr_reg,
                displacement,
                to_memory,
            } => {
                let mem = format!("{}({})", format_signed_hex(displacement as i32), A(addr_reg));
                if to_memory {
                    write!(f, "movep{size} {}, {mem}", D(data_reg))
                } else {
                    write!(f, "movep{size} {mem}, {}", D(data_reg))
                }
            }
            InstructionKind::MoveFromSr { dst } => write!(f, "move.w %sr, {dst}"),
            InstructionKind::MoveToCcr { src } => write!(f, "move.w {src}, %ccr"),
            InstructionKind::Lea { src, dst } => write!(f, "lea {src}, {}", A(dst)),
            InstructionKind::Pea { src } => write!(f, "pea {src}"),
            InstructionKind::Immediate { op, size, imm, dst } => {
                write!(f, "{}{size} #0x{imm:x}, {dst}", immediate_mnemonic(op))
            }
            InstructionKind::ImmediateToCcr { op, imm } => {
                write!(f, "{}.b #0x{imm:x}, %ccr", immediate_mnemonic(op))
            }
            InstructionKind::Binary { op, size, operands } => {
                let mnemonic = match op {
                    BinaryOp::Or => "or",
                    BinaryOp::And => "and",
                    BinaryOp::Sub => "sub",
                    BinaryOp::Add => "add",
                    BinaryOp::Cmp => "cmp",
                    BinaryOp::Eor => "eor",
                };
                match operands {
                    Operands::EaToDn { src, dst } => write!(f, "{mnemonic}{size} {src}, {}", D(dst)),
                    Operands::DnToEa { src, dst } => write!(f, "{mnemonic}{size} {}, {dst}", D(src)),
                }
            }
            InstructionKind::AddressArith { op, size, src, dst } => {
                let mnemonic = match op {
                    AddressOp::Add => "adda",
                    AddressOp::Sub => "suba",
                    AddressOp::Cmp => "cmpa",
                };
                write!(f, "{mnemonic}{size} {src}, {}", A(dst))
            }
            InstructionKind::Quick {
                add,
                size,
                data,
                dst,
            } => {
                let mnemonic = if add { "addq" } else { "subq" };
                write!(f, "{mnemonic}{size} #{data}, {dst}")
            }
            InstructionKind::Extended {
                op,
                size,
                src,
                dst,
                memory,
            } => {
                let mnemonic = match op {
                    ExtendedOp::Addx => "addx",
                    ExtendedOp::Subx => "subx",
                    ExtendedOp::Abcd => "abcd",
                    ExtendedOp::Sbcd => "sbcd",
                };
                let size = if matches!(op, ExtendedOp::Abcd | ExtendedOp::Sbcd) {
                    String::new()
                } else {
                    size.to_string()
                };
                if memory {
                    write!(f, "{mnemonic}{size} -({}), -({})", A(src), A(dst))
                } else {
                    write!(f, "{mnemonic}{size} {}, {}", D(src), D(dst))
                }
            }
            InstructionKind::Cmpm { size, src, dst } => {
                write!(f, "cmpm{size} ({})+, ({})+", A(src), A(dst))
            }
            InstructionKind::Unary { op, size, dst } => {
                let mnemonic = match op {
                    UnaryOp::Negx => "negx",
                    UnaryOp::Clr => "clr",
                    UnaryOp::Neg => "neg",
                    UnaryOp::Not => "not",
                };
                write!(f, "{mnemonic}{size} {dst}")
            }
            InstructionKind::Nbcd { dst } => write!(f, "nbcd {dst}"),
            InstructionKind::Tst { size, src } => write!(f, "tst{size} {src}"),
            InstructionKind::Tas { dst } => write!(f, "tas {dst}"),
            InstructionKind::Bit { op, bit, dst } => {
                let mnemonic = match op {
                    BitOp::Tst => "btst",
                    BitOp::Chg => "bchg",
                    BitOp::Clr => "bclr",
                    BitOp::Set => "bset",
                };
                match bit {
                    BitNumber::Immediate(n) => write!(f, "{mnemonic} #{n}, {dst}"),
                    BitNumber::Register(r) => write!(f, "{mnemonic} {}, {dst}", D(r)),
                }
            }
            InstructionKind::ShiftRegister {
                op,
                direction,
                size,
                count,
                reg,
            } => write!(
                f,
                "{}{size} {count}, {}",
                shift_mnemonic(op, direction),
                D(reg)
            ),
            InstructionKind::ShiftMemory { op, direction, dst } => {
                write!(f, "{}.w {dst}", shift_mnemonic(op, direction))
            }
            InstructionKind::Swap { reg } => write!(f, "swap {}", D(reg)),
            InstructionKind::Ext { reg, mode } => match mode {
                ExtMode::ByteToWord => write!(f, "ext.w {}", D(reg)),
                ExtMode::WordToLong => write!(f, "ext.l {}", D(reg)),
                ExtMode::ByteToLong => write!(f, "extb.l {}", D(reg)),
            },
            InstructionKind::MulWord { signed, src, dst } => {
                let mnemonic = if signed { "muls" } else { "mulu" };
                write!(f, "{mnemonic}.w {src}, {}", D(dst))
            }
            InstructionKind::DivWord { signed, src, dst } => {
                let mnemonic = if signed { "divs" } else { "divu" };
                write!(f, "{mnemonic}.w {src}, {}", D(dst))
            }
            InstructionKind::MulLong {
                signed,
                src,
                low,
                high,
            } => {
                let mnemonic = if signed { "muls" } else { "mulu" };
                match high {
                    Some(high) => write!(f, "{mnemonic}.l {src}, {}:{}", D(high), D(low)),
                    None => write!(f, "{mnemonic}.l {src}, {}", D(low)),
                }
            }
            InstructionKind::DivLong {
                signed,
                src,
                quotient,
                remainder,
                wide,
            } => {
                let mnemonic = if signed { "divs" } else { "divu" };
                if wide {
                    write!(f, "{mnemonic}.l {src}, {}:{}", D(remainder), D(quotient))
                } else if remainder != quotient {
                    write!(f, "{mnemonic}l.l {src}, {}:{}", D(remainder), D(quotient))
                } else {
                    write!(f, "{mnemonic}.l {src}, {}", D(quotient))
                }
            }
            InstructionKind::Exg { mode, x, y } => match mode {
                ExgMode::DataData => write!(f, "exg {}, {}", D(x), D(y)),
                ExgMode::AddrAddr => write!(f, "exg {}, {}", A(x), A(y)),
                ExgMode::DataAddr => write!(f, "exg {}, {}", D(x), A(y)),
            },
            InstructionKind::Link { reg, displacement } => {
                let size = if (i16::MIN as i32..=i16::MAX as i32).contains(&displacement)
                    && self.length == 4
                {
                    ".w"
                } else {
                    ".l"
                };
                write!(
                    f,
                    "link{size} {}, #{}",
                    A(reg),
                    format_signed_hex(displacement)
                )
            }
            InstructionKind::Unlk { reg } => write!(f, "unlk {}", A(reg)),
            InstructionKind::Jmp { target } => write!(f, "jmp {target}"),
            InstructionKind::Jsr { target } => write!(f, "jsr {target}"),
            InstructionKind::Bra { target } => write!(f, "bra 0x{target:08x}"),
            InstructionKind::Bsr { target } => write!(f, "bsr 0x{target:08x}"),
            InstructionKind::Bcc { condition, target } => {
                write!(f, "b{condition} 0x{target:08x}")
            }
            InstructionKind::DBcc {
                condition,
                reg,
                target,
            } => write!(f, "db{condition} {}, 0x{target:08x}", D(reg)),
            InstructionKind::Scc { condition, dst } => write!(f, "s{condition} {dst}"),
            InstructionKind::Chk { size, src, reg } => write!(f, "chk{size} {src}, {}", D(reg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{m68k::decoder::decode, memory::CodeSlice};

    fn text(bytes: &[u8]) -> String {
        decode(&CodeSlice::new(bytes, 0x1000), 0x1000)
            .unwrap()
            .to_string()
    }

    #[test]
    fn formats_common_instructions() {
        assert_eq!(text(&[0x20, 0x3C, 0x00, 0x00, 0x00, 0x2A]), "move.l #0x2a, %d0");
        assert_eq!(text(&[0x4E, 0x75]), "rts");
        assert_eq!(text(&[0x70, 0xFF]), "moveq #-0x1, %d0");
        assert_eq!(text(&[0x2F, 0x08]), "move.l %a0, -(%sp)");
        assert_eq!(text(&[0x41, 0xE8, 0xFF, 0xFC]), "lea -0x4(%a0), %a0");
    }

    #[test]
    fn pc_relative_shows_resolved_target() {
        // lea (0x10,pc), a0
        assert_eq!(
            text(&[0x41, 0xFA, 0x00, 0x10]),
            "lea 0x10(%pc) [0x00001012], %a0"
        );
    }

    #[test]
    fn movem_register_lists() {
        // movem.l d0-d2/a6, -(sp)
        assert_eq!(
            text(&[0x48, 0xE7, 0xE0, 0x02]),
            "movem.l %d0-%d2/%a6, -(%sp)"
        );
        // movem.l (sp)+, d0-d2/a6
        assert_eq!(
            text(&[0x4C, 0xDF, 0x40, 0x07]),
            "movem.l (%sp)+, %d0-%d2/%a6"
        );
    }
}
