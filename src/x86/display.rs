use std::fmt;

use super::decoder::{
    AluOp, BitTestOp, BranchTarget, Condition, FlagOp, Instruction, LoopKind, MemoryOperand,
    MulDivOp, Opcode, Operand, OperandSize, Repeat, ShiftCount, ShiftOp, StringOp,
};
use crate::emulator::format_signed_hex;

const NAMES32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const NAMES16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
const NAMES8: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];

pub fn register_name(reg: u8, size: OperandSize) -> &'static str {
    let names = match size {
        OperandSize::Byte => &NAMES8,
        OperandSize::Word => &NAMES16,
        OperandSize::Dword => &NAMES32,
    };
    names[reg as usize & 7]
}

fn size_keyword(size: OperandSize) -> &'static str {
    match size {
        OperandSize::Byte => "byte",
        OperandSize::Word => "word",
        OperandSize::Dword => "dword",
    }
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.base.is_none() && self.index.is_none() {
            return write!(f, "[0x{:08x}]", self.disp as u32);
        }
        f.write_str("[")?;
        let mut first = true;
        if let Some(base) = self.base {
            f.write_str(NAMES32[base as usize])?;
            first = false;
        }
        if let Some(index) = self.index {
            if !first {
                f.write_str("+")?;
            }
            f.write_str(NAMES32[index as usize])?;
            if self.scale > 1 {
                write!(f, "*{}", self.scale)?;
            }
        }
        if self.disp != 0 {
            let disp = format_signed_hex(self.disp);
            if !disp.starts_with('-') {
                f.write_str("+")?;
            }
            f.write_str(&disp)?;
        }
        f.write_str("]")
    }
}

/// An operand printed at a particular width.
struct Width(Operand, OperandSize);

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Operand::Register(reg) => f.write_str(register_name(reg, self.1)),
            Operand::Memory(mem) => write!(f, "{} {mem}", size_keyword(self.1)),
            Operand::Immediate(value) => write!(f, "0x{value:x}"),
        }
    }
}

fn reg(reg: u8, size: OperandSize) -> Width {
    Width(Operand::Register(reg), size)
}

impl Condition {
    fn suffix(self) -> &'static str {
        match self {
            Condition::Overflow => "o",
            Condition::NotOverflow => "no",
            Condition::Below => "b",
            Condition::AboveOrEqual => "ae",
            Condition::Equal => "e",
            Condition::NotEqual => "ne",
            Condition::BelowOrEqual => "be",
            Condition::Above => "a",
            Condition::Sign => "s",
            Condition::NotSign => "ns",
            Condition::Parity => "p",
            Condition::NotParity => "np",
            Condition::Less => "l",
            Condition::GreaterOrEqual => "ge",
            Condition::LessOrEqual => "le",
            Condition::Greater => "g",
        }
    }
}

impl AluOp {
    fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::Adc => "adc",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        }
    }
}

impl ShiftOp {
    fn mnemonic(self) -> &'static str {
        match self {
            ShiftOp::Rol => "rol",
            ShiftOp::Ror => "ror",
            ShiftOp::Rcl => "rcl",
            ShiftOp::Rcr => "rcr",
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sar => "sar",
        }
    }
}

impl fmt::Display for ShiftCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShiftCount::One => f.write_str("1"),
            ShiftCount::Cl => f.write_str("cl"),
            ShiftCount::Immediate(n) => write!(f, "0x{n:x}"),
        }
    }
}

fn string_suffix(size: OperandSize) -> &'static str {
    match size {
        OperandSize::Byte => "b",
        OperandSize::Word => "w",
        OperandSize::Dword => "d",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Opcode::Alu { op, size, dst, src } => {
                write!(f, "{} {}, {}", op.mnemonic(), Width(dst, size), Width(src, size))
            }
            Opcode::Test { size, dst, src } => {
                write!(f, "test {}, {}", Width(dst, size), Width(src, size))
            }
            Opcode::Mov { size, dst, src } => {
                write!(f, "mov {}, {}", Width(dst, size), Width(src, size))
            }
            Opcode::MovExtend {
                signed,
                size,
                src_size,
                dst,
                src,
            } => write!(
                f,
                "{} {}, {}",
                if signed { "movsx" } else { "movzx" },
                reg(dst, size),
                Width(src, src_size)
            ),
            Opcode::Lea { size, dst, src } => write!(f, "lea {}, {src}", reg(dst, size)),
            Opcode::Xchg { size, a, b } => {
                write!(f, "xchg {}, {}", Width(a, size), Width(b, size))
            }
            Opcode::IncDec { inc, size, dst } => {
                write!(f, "{} {}", if inc { "inc" } else { "dec" }, Width(dst, size))
            }
            Opcode::Not { size, dst } => write!(f, "not {}", Width(dst, size)),
            Opcode::Neg { size, dst } => write!(f, "neg {}", Width(dst, size)),
            Opcode::MulDiv { op, size, src } => {
                let name = match op {
                    MulDivOp::Mul => "mul",
                    MulDivOp::Imul => "imul",
                    MulDivOp::Div => "div",
                    MulDivOp::Idiv => "idiv",
                };
                write!(f, "{name} {}", Width(src, size))
            }
            Opcode::Imul {
                size,
                dst,
                src,
                imm,
            } => {
                write!(f, "imul {}, {}", reg(dst, size), Width(src, size))?;
                match imm {
                    Some(imm) => write!(f, ", {}", format_signed_hex(imm as i32)),
                    None => Ok(()),
                }
            }
            Opcode::Shift {
                op,
                size,
                dst,
                count,
            } => write!(f, "{} {}, {count}", op.mnemonic(), Width(dst, size)),
            Opcode::DoubleShift {
                left,
                size,
                dst,
                src,
                count,
            } => write!(
                f,
                "{} {}, {}, {count}",
                if left { "shld" } else { "shrd" },
                Width(dst, size),
                reg(src, size)
            ),
            Opcode::Push { size, src } => write!(f, "push {}", Width(src, size)),
            Opcode::Pop { size, dst } => write!(f, "pop {}", Width(dst, size)),
            Opcode::Pushad => f.write_str("pushad"),
            Opcode::Popad => f.write_str("popad"),
            Opcode::Pushfd => f.write_str("pushfd"),
            Opcode::Popfd => f.write_str("popfd"),
            Opcode::Jmp { target } | Opcode::Call { target } => {
                let name = if matches!(self.opcode, Opcode::Jmp { .. }) {
                    "jmp"
                } else {
                    "call"
                };
                match target {
                    BranchTarget::Direct(addr) => write!(f, "{name} 0x{addr:08x}"),
                    BranchTarget::Indirect(op) => {
                        write!(f, "{name} {}", Width(op, OperandSize::Dword))
                    }
                }
            }
            Opcode::Ret { pop: 0 } => f.write_str("ret"),
            Opcode::Ret { pop } => write!(f, "ret 0x{pop:x}"),
            Opcode::Jcc { condition, target } => {
                write!(f, "j{} 0x{target:08x}", condition.suffix())
            }
            Opcode::Setcc { condition, dst } => {
                write!(f, "set{} {}", condition.suffix(), Width(dst, OperandSize::Byte))
            }
            Opcode::Cmovcc {
                condition,
                size,
                dst,
                src,
            } => write!(
                f,
                "cmov{} {}, {}",
                condition.suffix(),
                reg(dst, size),
                Width(src, size)
            ),
            Opcode::Loop { kind, target } => {
                let name = match kind {
                    LoopKind::Loop => "loop",
                    LoopKind::LoopEqual => "loope",
                    LoopKind::LoopNotEqual => "loopne",
                    LoopKind::JumpIfEcxZero => "jecxz",
                };
                write!(f, "{name} 0x{target:08x}")
            }
            Opcode::ExtendAccumulator { size } => f.write_str(match size {
                OperandSize::Word => "cbw",
                _ => "cwde",
            }),
            Opcode::ExtendIntoDx { size } => f.write_str(match size {
                OperandSize::Word => "cwd",
                _ => "cdq",
            }),
            Opcode::Leave => f.write_str("leave"),
            Opcode::Nop => f.write_str("nop"),
            Opcode::Int { vector } => write!(f, "int 0x{vector:x}"),
            Opcode::Rdtsc => f.write_str("rdtsc"),
            Opcode::Flag(op) => f.write_str(match op {
                FlagOp::Clc => "clc",
                FlagOp::Stc => "stc",
                FlagOp::Cmc => "cmc",
                FlagOp::Cld => "cld",
                FlagOp::Std => "std",
            }),
            Opcode::Bswap { reg: r } => write!(f, "bswap {}", reg(r, OperandSize::Dword)),
            Opcode::BitScan {
                reverse,
                size,
                dst,
                src,
            } => write!(
                f,
                "{} {}, {}",
                if reverse { "bsr" } else { "bsf" },
                reg(dst, size),
                Width(src, size)
            ),
            Opcode::BitTest { op, size, dst, bit } => {
                let name = match op {
                    BitTestOp::Bt => "bt",
                    BitTestOp::Bts => "bts",
                    BitTestOp::Btr => "btr",
                    BitTestOp::Btc => "btc",
                };
                write!(f, "{name} {}, {}", Width(dst, size), Width(bit, size))
            }
            Opcode::String { op, size, repeat } => {
                let prefix = match (repeat, op) {
                    (Repeat::None, _) => "",
                    (Repeat::Equal, StringOp::Cmps | StringOp::Scas) => "repe ",
                    (Repeat::Equal, _) => "rep ",
                    (Repeat::NotEqual, _) => "repne ",
                };
                let name = match op {
                    StringOp::Movs => "movs",
                    StringOp::Cmps => "cmps",
                    StringOp::Stos => "stos",
                    StringOp::Lods => "lods",
                    StringOp::Scas => "scas",
                };
                write!(f, "{prefix}{name}{}", string_suffix(size))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{memory::CodeSlice, x86::decoder::decode};

    fn text(bytes: &[u8]) -> String {
        decode(&CodeSlice::new(bytes, 0x401000), 0x401000)
            .unwrap()
            .to_string()
    }

    #[test]
    fn memory_operands() {
        assert_eq!(text(&[0x8B, 0x44, 0xB3, 0x10]), "mov eax, dword [ebx+esi*4+0x10]");
        assert_eq!(text(&[0x89, 0x45, 0xF8]), "mov dword [ebp-0x8], eax");
        assert_eq!(text(&[0xA1, 0x00, 0x20, 0x00, 0x00]), "mov eax, dword [0x00002000]");
        assert_eq!(text(&[0x8D, 0x04, 0x49]), "lea eax, [ecx+ecx*2]");
    }

    #[test]
    fn byte_and_word_registers() {
        assert_eq!(text(&[0x88, 0xE0]), "mov al, ah");
        assert_eq!(text(&[0x66, 0x01, 0xD8]), "add ax, bx");
        assert_eq!(text(&[0x0F, 0xB6, 0xC1]), "movzx eax, cl");
    }

    #[test]
    fn control_flow() {
        assert_eq!(text(&[0xEB, 0xFE]), "jmp 0x00401000");
        assert_eq!(text(&[0x0F, 0x84, 0x00, 0x00, 0x00, 0x00]), "je 0x00401006");
        assert_eq!(text(&[0xFF, 0x10]), "call dword [eax]");
        assert_eq!(text(&[0xC2, 0x08, 0x00]), "ret 0x8");
        assert_eq!(text(&[0xCD, 0xFF]), "int 0xff");
    }

    #[test]
    fn prefixed_string_ops_and_shifts() {
        assert_eq!(text(&[0xF3, 0xAB]), "rep stosd");
        assert_eq!(text(&[0xF3, 0xA6]), "repe cmpsb");
        assert_eq!(text(&[0xC1, 0xE0, 0x04]), "shl eax, 0x4");
        assert_eq!(text(&[0xD3, 0xF8]), "sar eax, cl");
        assert_eq!(text(&[0x6B, 0xC1, 0xF4]), "imul eax, ecx, -0xc");
    }
}
