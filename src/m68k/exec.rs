use log::debug;

use super::{
    FLAG_C, FLAG_N, FLAG_V, FLAG_X, FLAG_Z, M68kEmulator, M68kRegisters,
    decoder::{
        AddressOp, BinaryOp, BitNumber, BitOp, Condition, EffectiveAddress, ExgMode, ExtMode,
        ExtendedOp, ImmediateOp, IndexExtension, IndexRegister, Indirection, Instruction,
        InstructionKind, Operands, RightOrLeft, ShiftCount, ShiftOp, Size, UnaryOp,
    },
};
use crate::emulator::{EmuResult, EmulatorError, call_syscall_handler};

/// Where an operand lives once side effects of its addressing mode have been
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedAddress {
    DataRegister(u8),
    AddressRegister(u8),
    Memory(u32),
    Immediate(u32),
}

/// Size-related constants bundled together
struct SizeInfo {
    mask: u32,
    sign_bit: u32,
    bits: u32,
}

impl SizeInfo {
    fn new(size: Size) -> Self {
        match size {
            Size::Byte => Self {
                mask: 0xFF,
                sign_bit: 0x80,
                bits: 8,
            },
            Size::Word => Self {
                mask: 0xFFFF,
                sign_bit: 0x8000,
                bits: 16,
            },
            Size::Long => Self {
                mask: 0xFFFF_FFFF,
                sign_bit: 0x8000_0000,
                bits: 32,
            },
        }
    }

    fn apply(&self, value: u32) -> u32 {
        value & self.mask
    }

    fn is_negative(&self, value: u32) -> bool {
        value & self.sign_bit != 0
    }

    fn sign_extend(&self, value: u32) -> i64 {
        let value = self.apply(value);
        if self.is_negative(value) {
            value as i64 - (self.mask as i64 + 1)
        } else {
            value as i64
        }
    }
}

fn write_sized(orig: u32, value: u32, size: Size) -> u32 {
    match size {
        Size::Byte => (orig & 0xFFFF_FF00) | (value & 0xFF),
        Size::Word => (orig & 0xFFFF_0000) | (value & 0xFFFF),
        Size::Long => value,
    }
}

fn set_nz(regs: &mut M68kRegisters, value: u32, size: Size) {
    let si = SizeInfo::new(size);
    regs.set_flag(FLAG_N, si.is_negative(value));
    regs.set_flag(FLAG_Z, si.apply(value) == 0);
}

/// N and Z from the result, V and C cleared. X untouched.
fn set_logic_flags(regs: &mut M68kRegisters, value: u32, size: Size) {
    set_nz(regs, value, size);
    regs.set_flag(FLAG_V, false);
    regs.set_flag(FLAG_C, false);
}

/// Add with full flag computation (N, Z, V, C, X)
fn add_with_flags(src: u32, dst: u32, size: Size, regs: &mut M68kRegisters) -> u32 {
    let si = SizeInfo::new(size);
    let src = si.apply(src);
    let dst = si.apply(dst);
    let result = si.apply(src.wrapping_add(dst));

    let c = (src as u64 + dst as u64) > si.mask as u64;
    let v = (si.is_negative(src) == si.is_negative(dst))
        && (si.is_negative(result) != si.is_negative(src));

    regs.set_flag(FLAG_N, si.is_negative(result));
    regs.set_flag(FLAG_Z, result == 0);
    regs.set_flag(FLAG_V, v);
    regs.set_flag(FLAG_C, c);
    regs.set_flag(FLAG_X, c);
    result
}

/// Subtract with full flag computation. Computes dst - src.
fn sub_with_flags(dst: u32, src: u32, size: Size, regs: &mut M68kRegisters) -> u32 {
    let result = cmp_with_flags(dst, src, size, regs);
    regs.set_flag(FLAG_X, regs.flag(FLAG_C));
    result
}

/// dst - src setting N, Z, V, C but not X.
fn cmp_with_flags(dst: u32, src: u32, size: Size, regs: &mut M68kRegisters) -> u32 {
    let si = SizeInfo::new(size);
    let src = si.apply(src);
    let dst = si.apply(dst);
    let result = si.apply(dst.wrapping_sub(src));

    let v = (si.is_negative(src) != si.is_negative(dst))
        && (si.is_negative(result) != si.is_negative(dst));

    regs.set_flag(FLAG_N, si.is_negative(result));
    regs.set_flag(FLAG_Z, result == 0);
    regs.set_flag(FLAG_V, v);
    regs.set_flag(FLAG_C, src > dst);
    result
}

/// ADDX: Z is only ever cleared, so multi-precision chains test the whole value.
fn addx_with_flags(src: u32, dst: u32, x: u32, size: Size, regs: &mut M68kRegisters) -> u32 {
    let si = SizeInfo::new(size);
    let src = si.apply(src);
    let dst = si.apply(dst);
    let result = si.apply(src.wrapping_add(dst).wrapping_add(x));

    let c = (src as u64 + dst as u64 + x as u64) > si.mask as u64;
    let v = (si.is_negative(src) == si.is_negative(dst))
        && (si.is_negative(result) != si.is_negative(src));

    if result != 0 {
        regs.set_flag(FLAG_Z, false);
    }
    regs.set_flag(FLAG_N, si.is_negative(result));
    regs.set_flag(FLAG_V, v);
    regs.set_flag(FLAG_C, c);
    regs.set_flag(FLAG_X, c);
    result
}

/// SUBX (and NEGX as 0 - src - X). Z is only ever cleared.
fn subx_with_flags(dst: u32, src: u32, x: u32, size: Size, regs: &mut M68kRegisters) -> u32 {
    let si = SizeInfo::new(size);
    let src = si.apply(src);
    let dst = si.apply(dst);
    let result = si.apply(dst.wrapping_sub(src).wrapping_sub(x));

    let c = (src as u64 + x as u64) > dst as u64;
    let v = (si.is_negative(src) != si.is_negative(dst))
        && (si.is_negative(result) != si.is_negative(dst));

    if result != 0 {
        regs.set_flag(FLAG_Z, false);
    }
    regs.set_flag(FLAG_N, si.is_negative(result));
    regs.set_flag(FLAG_V, v);
    regs.set_flag(FLAG_C, c);
    regs.set_flag(FLAG_X, c);
    result
}

fn add_bcd(src: u8, dst: u8, x: u8) -> (u8, bool) {
    let mut low = (dst & 0x0F) + (src & 0x0F) + x;
    let mut high = (dst >> 4) + (src >> 4);
    if low > 9 {
        low += 6;
        high += 1;
    }
    let carry = high > 9;
    if carry {
        high += 6;
    }
    (((high & 0x0F) << 4) | (low & 0x0F), carry)
}

fn sub_bcd(dst: u8, src: u8, x: u8) -> (u8, bool) {
    let mut low = (dst & 0x0F) as i16 - (src & 0x0F) as i16 - x as i16;
    let mut high = (dst >> 4) as i16 - (src >> 4) as i16;
    if low < 0 {
        low += 10;
        high -= 1;
    }
    let borrow = high < 0;
    if borrow {
        high += 10;
    }
    ((((high as u8) & 0x0F) << 4) | ((low as u8) & 0x0F), borrow)
}

struct ShiftOutcome {
    result: u32,
    /// Last bit shifted out; `None` when the count was zero.
    carry: Option<bool>,
    overflow: bool,
}

fn shift_value(
    op: ShiftOp,
    direction: RightOrLeft,
    size: Size,
    value: u32,
    count: u32,
    x: bool,
) -> ShiftOutcome {
    let si = SizeInfo::new(size);
    let value = si.apply(value);
    if count == 0 {
        return ShiftOutcome {
            result: value,
            carry: None,
            overflow: false,
        };
    }
    let bits = si.bits;
    let wide = value as u64;
    let mask = si.mask as u64;

    let (result, carry, overflow) = match (op, direction) {
        (ShiftOp::Arithmetic | ShiftOp::Logical, RightOrLeft::Left) => {
            let (result, carry) = if count < bits {
                ((wide << count) & mask, (wide >> (bits - count)) & 1 != 0)
            } else if count == bits {
                (0, wide & 1 != 0)
            } else {
                (0, false)
            };
            let overflow = op == ShiftOp::Arithmetic
                && if count < bits {
                    let top = wide >> (bits - 1 - count);
                    let all_ones = (1u64 << (count + 1)) - 1;
                    top != 0 && top != all_ones
                } else {
                    value != 0
                };
            (result as u32, carry, overflow)
        }
        (ShiftOp::Arithmetic, RightOrLeft::Right) => {
            let signed = si.sign_extend(value);
            if count >= bits {
                let negative = signed < 0;
                (if negative { si.mask } else { 0 }, negative, false)
            } else {
                let result = ((signed >> count) as u64 & mask) as u32;
                (result, (signed >> (count - 1)) & 1 != 0, false)
            }
        }
        (ShiftOp::Logical, RightOrLeft::Right) => {
            if count > bits {
                (0, false, false)
            } else {
                let result = if count == bits { 0 } else { (wide >> count) as u32 };
                (result, (wide >> (count - 1)) & 1 != 0, false)
            }
        }
        (ShiftOp::Rotate, _) => {
            let n = count % bits;
            let result = if n == 0 {
                value
            } else {
                match direction {
                    RightOrLeft::Left => si.apply(((wide << n) | (wide >> (bits - n))) as u32),
                    RightOrLeft::Right => si.apply(((wide >> n) | (wide << (bits - n))) as u32),
                }
            };
            let carry = match direction {
                RightOrLeft::Left => result & 1 != 0,
                RightOrLeft::Right => si.is_negative(result),
            };
            (result, carry, false)
        }
        (ShiftOp::RotateExtend, _) => {
            let mut val = value;
            let mut x_bit = x;
            for _ in 0..count % (bits + 1) {
                match direction {
                    RightOrLeft::Left => {
                        let msb = si.is_negative(val);
                        val = si.apply((val << 1) | u32::from(x_bit));
                        x_bit = msb;
                    }
                    RightOrLeft::Right => {
                        let lsb = val & 1 != 0;
                        val = (val >> 1) | (u32::from(x_bit) << (bits - 1));
                        x_bit = lsb;
                    }
                }
            }
            (val, x_bit, false)
        }
    };
    ShiftOutcome {
        result,
        carry: Some(carry),
        overflow,
    }
}

impl M68kEmulator {
    pub(super) fn execute_instruction(&mut self, inst: &Instruction) -> EmuResult<()> {
        match inst.kind {
            InstructionKind::Reset => {
                debug!("reset at {:08X}: terminating", inst.address);
                return Err(EmulatorError::Terminate);
            }
            InstructionKind::Nop => {}
            InstructionKind::Rts => self.regs.pc = self.pop_long()?,
            InstructionKind::Rtr => {
                let ccr = self.pop_word()?;
                self.regs.set_ccr(ccr as u8);
                self.regs.pc = self.pop_long()?;
            }
            InstructionKind::Rtd { displacement } => {
                self.regs.pc = self.pop_long()?;
                self.regs.a[7] = self.regs.a[7].wrapping_add(displacement as i32 as u32);
            }
            InstructionKind::TrapV => {
                if self.regs.flag(FLAG_V) {
                    return Err(EmulatorError::UnimplementedCall(format!(
                        "trapv taken at {:08X}",
                        inst.address
                    )));
                }
            }
            InstructionKind::Trap { vector } => {
                call_syscall_handler(self, 0x4E40 | vector as u16)?;
            }
            InstructionKind::ATrap { word } => {
                debug!("A-line trap {word:04X} at {:08X}", inst.address);
                call_syscall_handler(self, word)?;
            }
            InstructionKind::Move { size, src, dst } => {
                let value = self.read_operand(&src, size)?;
                self.write_operand(&dst, size, value)?;
                set_logic_flags(&mut self.regs, value, size);
            }
            InstructionKind::Movea { size, src, dst } => {
                let value = self.read_operand(&src, size)?;
                self.regs.a[dst as usize] = sign_extend_word(value, size);
            }
            InstructionKind::Moveq { data, dst } => {
                let value = data as i32 as u32;
                self.regs.d[dst as usize] = value;
                set_logic_flags(&mut self.regs, value, Size::Long);
            }
            InstructionKind::Movem {
                size,
                to_memory,
                mask,
                ea,
            } => self.exec_movem(size, to_memory, mask, &ea)?,
            InstructionKind::Movep {
                size,
                data_reg,
                addr_reg,
                displacement,
                to_memory,
            } => {
                let base = self.regs.a[addr_reg as usize].wrapping_add(displacement as i32 as u32);
                let count = size.bytes();
                if to_memory {
                    let value = self.regs.d[data_reg as usize];
                    for i in 0..count {
                        let byte = (value >> (8 * (count - 1 - i))) as u8;
                        self.memory.borrow_mut().write_u8(base.wrapping_add(2 * i), byte)?;
                    }
                } else {
                    let mut value = 0u32;
                    for i in 0..count {
                        let byte = self.memory.borrow().read_u8(base.wrapping_add(2 * i))?;
                        value = (value << 8) | byte as u32;
                    }
                    let reg = &mut self.regs.d[data_reg as usize];
                    *reg = write_sized(*reg, value, size);
                }
            }
            InstructionKind::MoveFromSr { dst } => {
                let sr = self.regs.sr as u32;
                self.write_operand(&dst, Size::Word, sr)?;
            }
            InstructionKind::MoveToCcr { src } => {
                let value = self.read_operand(&src, Size::Word)?;
                self.regs.set_ccr(value as u8);
            }
            InstructionKind::Lea { src, dst } => {
                self.regs.a[dst as usize] = self.control_address(&src)?;
            }
            InstructionKind::Pea { src } => {
                let addr = self.control_address(&src)?;
                self.push_long(addr)?;
            }
            InstructionKind::Immediate { op, size, imm, dst } => {
                let loc = self.resolve(&dst, size)?;
                let value = self.read_resolved(loc, size)?;
                let result = match op {
                    ImmediateOp::Or => logic(&mut self.regs, value | imm, size),
                    ImmediateOp::And => logic(&mut self.regs, value & imm, size),
                    ImmediateOp::Eor => logic(&mut self.regs, value ^ imm, size),
                    ImmediateOp::Add => Some(add_with_flags(imm, value, size, &mut self.regs)),
                    ImmediateOp::Sub => Some(sub_with_flags(value, imm, size, &mut self.regs)),
                    ImmediateOp::Cmp => {
                        cmp_with_flags(value, imm, size, &mut self.regs);
                        None
                    }
                };
                if let Some(result) = result {
                    self.write_resolved(loc, size, result)?;
                }
            }
            InstructionKind::ImmediateToCcr { op, imm } => {
                let ccr = self.regs.ccr();
                let ccr = match op {
                    ImmediateOp::Or => ccr | imm,
                    ImmediateOp::And => ccr & imm,
                    _ => ccr ^ imm,
                };
                self.regs.set_ccr(ccr);
            }
            InstructionKind::Binary { op, size, operands } => {
                self.exec_binary(op, size, operands)?
            }
            InstructionKind::AddressArith { op, size, src, dst } => {
                let src = sign_extend_word(self.read_operand(&src, size)?, size);
                let reg = dst as usize;
                match op {
                    AddressOp::Add => self.regs.a[reg] = self.regs.a[reg].wrapping_add(src),
                    AddressOp::Sub => self.regs.a[reg] = self.regs.a[reg].wrapping_sub(src),
                    AddressOp::Cmp => {
                        cmp_with_flags(self.regs.a[reg], src, Size::Long, &mut self.regs);
                    }
                }
            }
            InstructionKind::Quick {
                add,
                size,
                data,
                dst,
            } => {
                if let EffectiveAddress::AddrReg(reg) = dst {
                    let reg = &mut self.regs.a[reg as usize];
                    *reg = if add {
                        reg.wrapping_add(data as u32)
                    } else {
                        reg.wrapping_sub(data as u32)
                    };
                } else {
                    let loc = self.resolve(&dst, size)?;
                    let value = self.read_resolved(loc, size)?;
                    let result = if add {
                        add_with_flags(data as u32, value, size, &mut self.regs)
                    } else {
                        sub_with_flags(value, data as u32, size, &mut self.regs)
                    };
                    self.write_resolved(loc, size, result)?;
                }
            }
            InstructionKind::Extended {
                op,
                size,
                src,
                dst,
                memory,
            } => self.exec_extended(op, size, src, dst, memory)?,
            InstructionKind::Cmpm { size, src, dst } => {
                let src = self.read_operand(&EffectiveAddress::PostIncrement(src), size)?;
                let dst = self.read_operand(&EffectiveAddress::PostIncrement(dst), size)?;
                cmp_with_flags(dst, src, size, &mut self.regs);
            }
            InstructionKind::Unary { op, size, dst } => {
                let loc = self.resolve(&dst, size)?;
                let result = match op {
                    UnaryOp::Clr => {
                        set_logic_flags(&mut self.regs, 0, size);
                        0
                    }
                    UnaryOp::Not => {
                        let value = !self.read_resolved(loc, size)?;
                        set_logic_flags(&mut self.regs, value, size);
                        value
                    }
                    UnaryOp::Neg => {
                        let value = self.read_resolved(loc, size)?;
                        sub_with_flags(0, value, size, &mut self.regs)
                    }
                    UnaryOp::Negx => {
                        let value = self.read_resolved(loc, size)?;
                        let x = u32::from(self.regs.flag(FLAG_X));
                        subx_with_flags(0, value, x, size, &mut self.regs)
                    }
                };
                self.write_resolved(loc, size, result)?;
            }
            InstructionKind::Nbcd { dst } => {
                let loc = self.resolve(&dst, Size::Byte)?;
                let value = self.read_resolved(loc, Size::Byte)? as u8;
                let x = u8::from(self.regs.flag(FLAG_X));
                let (result, borrow) = sub_bcd(0, value, x);
                self.set_bcd_flags(result, borrow);
                self.write_resolved(loc, Size::Byte, result as u32)?;
            }
            InstructionKind::Tst { size, src } => {
                let value = self.read_operand(&src, size)?;
                set_logic_flags(&mut self.regs, value, size);
            }
            InstructionKind::Tas { dst } => {
                let loc = self.resolve(&dst, Size::Byte)?;
                let value = self.read_resolved(loc, Size::Byte)?;
                set_logic_flags(&mut self.regs, value, Size::Byte);
                self.write_resolved(loc, Size::Byte, value | 0x80)?;
            }
            InstructionKind::Bit { op, bit, dst } => self.exec_bit(op, bit, &dst)?,
            InstructionKind::ShiftRegister {
                op,
                direction,
                size,
                count,
                reg,
            } => {
                let count = match count {
                    ShiftCount::Immediate(n) => n as u32,
                    ShiftCount::Register(r) => self.regs.d[r as usize] % 64,
                };
                let value = self.regs.d[reg as usize];
                let result = self.apply_shift(op, direction, size, value, count);
                let reg = &mut self.regs.d[reg as usize];
                *reg = write_sized(*reg, result, size);
            }
            InstructionKind::ShiftMemory { op, direction, dst } => {
                let loc = self.resolve(&dst, Size::Word)?;
                let value = self.read_resolved(loc, Size::Word)?;
                let result = self.apply_shift(op, direction, Size::Word, value, 1);
                self.write_resolved(loc, Size::Word, result)?;
            }
            InstructionKind::Swap { reg } => {
                let value = self.regs.d[reg as usize].rotate_left(16);
                self.regs.d[reg as usize] = value;
                set_logic_flags(&mut self.regs, value, Size::Long);
            }
            InstructionKind::Ext { reg, mode } => {
                let orig = self.regs.d[reg as usize];
                let (value, size) = match mode {
                    ExtMode::ByteToWord => {
                        (write_sized(orig, orig as u8 as i8 as i16 as u16 as u32, Size::Word), Size::Word)
                    }
                    ExtMode::WordToLong => (orig as u16 as i16 as i32 as u32, Size::Long),
                    ExtMode::ByteToLong => (orig as u8 as i8 as i32 as u32, Size::Long),
                };
                self.regs.d[reg as usize] = value;
                set_logic_flags(&mut self.regs, value, size);
            }
            InstructionKind::MulWord { signed, src, dst } => {
                let src = self.read_operand(&src, Size::Word)?;
                let dst_val = self.regs.d[dst as usize];
                let result = if signed {
                    (src as u16 as i16 as i32).wrapping_mul(dst_val as u16 as i16 as i32) as u32
                } else {
                    (src & 0xFFFF) * (dst_val & 0xFFFF)
                };
                self.regs.d[dst as usize] = result;
                set_logic_flags(&mut self.regs, result, Size::Long);
            }
            InstructionKind::DivWord { signed, src, dst } => {
                self.exec_div_word(inst, signed, &src, dst)?
            }
            InstructionKind::MulLong {
                signed,
                src,
                low,
                high,
            } => self.exec_mul_long(signed, &src, low, high)?,
            InstructionKind::DivLong {
                signed,
                src,
                quotient,
                remainder,
                wide,
            } => self.exec_div_long(inst, signed, &src, quotient, remainder, wide)?,
            InstructionKind::Exg { mode, x, y } => {
                let (x, y) = (x as usize, y as usize);
                match mode {
                    ExgMode::DataData => self.regs.d.swap(x, y),
                    ExgMode::AddrAddr => self.regs.a.swap(x, y),
                    ExgMode::DataAddr => std::mem::swap(&mut self.regs.d[x], &mut self.regs.a[y]),
                }
            }
            InstructionKind::Link { reg, displacement } => {
                let value = self.regs.a[reg as usize];
                self.push_long(value)?;
                self.regs.a[reg as usize] = self.regs.a[7];
                self.regs.a[7] = self.regs.a[7].wrapping_add(displacement as u32);
            }
            InstructionKind::Unlk { reg } => {
                self.regs.a[7] = self.regs.a[reg as usize];
                self.regs.a[reg as usize] = self.pop_long()?;
            }
            InstructionKind::Jmp { target } => self.regs.pc = self.control_address(&target)?,
            InstructionKind::Jsr { target } => {
                let target = self.control_address(&target)?;
                let ret = self.regs.pc;
                self.push_long(ret)?;
                self.regs.pc = target;
            }
            InstructionKind::Bra { target } => self.regs.pc = target,
            InstructionKind::Bsr { target } => {
                let ret = self.regs.pc;
                self.push_long(ret)?;
                self.regs.pc = target;
            }
            InstructionKind::Bcc { condition, target } => {
                if self.test_condition(condition) {
                    self.regs.pc = target;
                }
            }
            InstructionKind::DBcc {
                condition,
                reg,
                target,
            } => {
                if !self.test_condition(condition) {
                    let r = &mut self.regs.d[reg as usize];
                    let counter = (*r as u16).wrapping_sub(1);
                    *r = write_sized(*r, counter as u32, Size::Word);
                    if counter != 0xFFFF {
                        self.regs.pc = target;
                    }
                }
            }
            InstructionKind::Scc { condition, dst } => {
                let value = if self.test_condition(condition) { 0xFF } else { 0 };
                self.write_operand(&dst, Size::Byte, value)?;
            }
            InstructionKind::Chk { size, src, reg } => {
                let si = SizeInfo::new(size);
                let bound = si.sign_extend(self.read_operand(&src, size)?);
                let value = si.sign_extend(self.regs.d[reg as usize]);
                if value < 0 || value > bound {
                    self.regs.set_flag(FLAG_N, value < 0);
                    return Err(EmulatorError::UnimplementedCall(format!(
                        "chk exception at {:08X}",
                        inst.address
                    )));
                }
            }
        }
        Ok(())
    }

    fn exec_binary(&mut self, op: BinaryOp, size: Size, operands: Operands) -> EmuResult<()> {
        match operands {
            Operands::EaToDn { src, dst } => {
                let src = self.read_operand(&src, size)?;
                let dst_val = self.regs.d[dst as usize];
                if let Some(result) = self.binary_result(op, size, src, dst_val) {
                    let reg = &mut self.regs.d[dst as usize];
                    *reg = write_sized(*reg, result, size);
                }
            }
            Operands::DnToEa { src, dst } => {
                let src = self.regs.d[src as usize];
                let loc = self.resolve(&dst, size)?;
                let dst_val = self.read_resolved(loc, size)?;
                if let Some(result) = self.binary_result(op, size, src, dst_val) {
                    self.write_resolved(loc, size, result)?;
                }
            }
        }
        Ok(())
    }

    /// `dst op src`; `None` for compares, which only set flags.
    fn binary_result(&mut self, op: BinaryOp, size: Size, src: u32, dst: u32) -> Option<u32> {
        let regs = &mut self.regs;
        match op {
            BinaryOp::Or => logic(regs, dst | src, size),
            BinaryOp::And => logic(regs, dst & src, size),
            BinaryOp::Eor => logic(regs, dst ^ src, size),
            BinaryOp::Add => Some(add_with_flags(src, dst, size, regs)),
            BinaryOp::Sub => Some(sub_with_flags(dst, src, size, regs)),
            BinaryOp::Cmp => {
                cmp_with_flags(dst, src, size, regs);
                None
            }
        }
    }

    fn exec_extended(
        &mut self,
        op: ExtendedOp,
        size: Size,
        src: u8,
        dst: u8,
        memory: bool,
    ) -> EmuResult<()> {
        let (src_loc, dst_loc) = if memory {
            let src = self.resolve(&EffectiveAddress::PreDecrement(src), size)?;
            let dst = self.resolve(&EffectiveAddress::PreDecrement(dst), size)?;
            (src, dst)
        } else {
            (
                ResolvedAddress::DataRegister(src),
                ResolvedAddress::DataRegister(dst),
            )
        };
        let src = self.read_resolved(src_loc, size)?;
        let dst = self.read_resolved(dst_loc, size)?;
        let x = u32::from(self.regs.flag(FLAG_X));
        let result = match op {
            ExtendedOp::Addx => addx_with_flags(src, dst, x, size, &mut self.regs),
            ExtendedOp::Subx => subx_with_flags(dst, src, x, size, &mut self.regs),
            ExtendedOp::Abcd => {
                let (result, carry) = add_bcd(src as u8, dst as u8, x as u8);
                self.set_bcd_flags(result, carry);
                result as u32
            }
            ExtendedOp::Sbcd => {
                let (result, borrow) = sub_bcd(dst as u8, src as u8, x as u8);
                self.set_bcd_flags(result, borrow);
                result as u32
            }
        };
        self.write_resolved(dst_loc, size, result)
    }

    fn set_bcd_flags(&mut self, result: u8, carry: bool) {
        if result != 0 {
            self.regs.set_flag(FLAG_Z, false);
        }
        self.regs.set_flag(FLAG_C, carry);
        self.regs.set_flag(FLAG_X, carry);
    }

    fn exec_bit(&mut self, op: BitOp, bit: BitNumber, dst: &EffectiveAddress) -> EmuResult<()> {
        let bit_num = match bit {
            BitNumber::Immediate(n) => n as u32,
            BitNumber::Register(r) => self.regs.d[r as usize],
        };
        let (size, modulo) = if matches!(dst, EffectiveAddress::DataReg(_)) {
            (Size::Long, 32)
        } else {
            (Size::Byte, 8)
        };
        let mask = 1u32 << (bit_num % modulo);
        let loc = self.resolve(dst, size)?;
        let value = self.read_resolved(loc, size)?;
        self.regs.set_flag(FLAG_Z, value & mask == 0);
        let result = match op {
            BitOp::Tst => return Ok(()),
            BitOp::Chg => value ^ mask,
            BitOp::Clr => value & !mask,
            BitOp::Set => value | mask,
        };
        self.write_resolved(loc, size, result)
    }

    fn apply_shift(
        &mut self,
        op: ShiftOp,
        direction: RightOrLeft,
        size: Size,
        value: u32,
        count: u32,
    ) -> u32 {
        let x = self.regs.flag(FLAG_X);
        let outcome = shift_value(op, direction, size, value, count, x);
        set_nz(&mut self.regs, outcome.result, size);
        self.regs.set_flag(FLAG_V, outcome.overflow);
        match outcome.carry {
            Some(carry) => {
                self.regs.set_flag(FLAG_C, carry);
                if op != ShiftOp::Rotate {
                    self.regs.set_flag(FLAG_X, carry);
                }
            }
            None => {
                let c = op == ShiftOp::RotateExtend && x;
                self.regs.set_flag(FLAG_C, c);
            }
        }
        outcome.result
    }

    fn exec_movem(
        &mut self,
        size: Size,
        to_memory: bool,
        mask: u16,
        ea: &EffectiveAddress,
    ) -> EmuResult<()> {
        let step = size.bytes();
        let all: [u32; 16] = std::array::from_fn(|i| {
            if i < 8 { self.regs.d[i] } else { self.regs.a[i - 8] }
        });

        if to_memory {
            if let EffectiveAddress::PreDecrement(reg) = *ea {
                // Mask is reversed here: bit 0 is A7, bit 15 is D0.
                let mut addr = self.regs.a[reg as usize];
                for bit in 0..16 {
                    if mask & (1 << bit) != 0 {
                        addr = addr.wrapping_sub(step);
                        self.write_mem(addr, size, all[15 - bit])?;
                    }
                }
                self.regs.a[reg as usize] = addr;
            } else {
                let mut addr = self.control_address(ea)?;
                for (i, value) in all.iter().enumerate() {
                    if mask & (1 << i) != 0 {
                        self.write_mem(addr, size, *value)?;
                        addr = addr.wrapping_add(step);
                    }
                }
            }
            return Ok(());
        }

        let (mut addr, post_increment) = match *ea {
            EffectiveAddress::PostIncrement(reg) => (self.regs.a[reg as usize], Some(reg)),
            _ => (self.control_address(ea)?, None),
        };
        for i in 0..16 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let value = sign_extend_word(self.read_mem(addr, size)?, size);
            if i < 8 {
                self.regs.d[i] = value;
            } else {
                self.regs.a[i - 8] = value;
            }
            addr = addr.wrapping_add(step);
        }
        if let Some(reg) = post_increment {
            self.regs.a[reg as usize] = addr;
        }
        Ok(())
    }

    fn exec_div_word(
        &mut self,
        inst: &Instruction,
        signed: bool,
        src: &EffectiveAddress,
        dst: u8,
    ) -> EmuResult<()> {
        let divisor = self.read_operand(src, Size::Word)? as u16;
        if divisor == 0 {
            return Err(divide_by_zero(inst));
        }
        let dividend = self.regs.d[dst as usize];
        let (quotient, remainder) = if signed {
            let q = dividend as i32 as i64 / divisor as i16 as i64;
            let r = dividend as i32 as i64 % divisor as i16 as i64;
            if q < i16::MIN as i64 || q > i16::MAX as i64 {
                self.regs.set_flag(FLAG_V, true);
                self.regs.set_flag(FLAG_C, false);
                return Ok(());
            }
            (q as u16, r as u16)
        } else {
            let q = dividend / divisor as u32;
            if q > 0xFFFF {
                self.regs.set_flag(FLAG_V, true);
                self.regs.set_flag(FLAG_C, false);
                return Ok(());
            }
            (q as u16, (dividend % divisor as u32) as u16)
        };
        self.regs.d[dst as usize] = ((remainder as u32) << 16) | quotient as u32;
        set_logic_flags(&mut self.regs, quotient as u32, Size::Word);
        Ok(())
    }

    fn exec_mul_long(
        &mut self,
        signed: bool,
        src: &EffectiveAddress,
        low: u8,
        high: Option<u8>,
    ) -> EmuResult<()> {
        let src = self.read_operand(src, Size::Long)?;
        let dst = self.regs.d[low as usize];
        let (product, fits) = if signed {
            let p = (src as i32 as i64) * (dst as i32 as i64);
            (p as u64, p == p as i32 as i64)
        } else {
            let p = src as u64 * dst as u64;
            (p, p <= u32::MAX as u64)
        };
        match high {
            Some(high) => {
                self.regs.d[high as usize] = (product >> 32) as u32;
                self.regs.d[low as usize] = product as u32;
                self.regs.set_flag(FLAG_N, product >> 63 != 0);
                self.regs.set_flag(FLAG_Z, product == 0);
                self.regs.set_flag(FLAG_V, false);
            }
            None => {
                self.regs.d[low as usize] = product as u32;
                set_nz(&mut self.regs, product as u32, Size::Long);
                self.regs.set_flag(FLAG_V, !fits);
            }
        }
        self.regs.set_flag(FLAG_C, false);
        Ok(())
    }

    fn exec_div_long(
        &mut self,
        inst: &Instruction,
        signed: bool,
        src: &EffectiveAddress,
        quotient: u8,
        remainder: u8,
        wide: bool,
    ) -> EmuResult<()> {
        let divisor = self.read_operand(src, Size::Long)?;
        if divisor == 0 {
            return Err(divide_by_zero(inst));
        }
        let low = self.regs.d[quotient as usize];
        let high = self.regs.d[remainder as usize];
        let result = if signed {
            let dividend: i128 = if wide {
                (((high as u64) << 32) | low as u64) as i64 as i128
            } else {
                low as i32 as i128
            };
            let divisor = divisor as i32 as i128;
            let q = dividend / divisor;
            let r = dividend % divisor;
            (q >= i32::MIN as i128 && q <= i32::MAX as i128).then_some((q as u32, r as u32))
        } else {
            let dividend: u64 = if wide {
                ((high as u64) << 32) | low as u64
            } else {
                low as u64
            };
            let q = dividend / divisor as u64;
            let r = dividend % divisor as u64;
            (q <= u32::MAX as u64).then_some((q as u32, r as u32))
        };
        let Some((q, r)) = result else {
            self.regs.set_flag(FLAG_V, true);
            self.regs.set_flag(FLAG_C, false);
            return Ok(());
        };
        if remainder != quotient {
            self.regs.d[remainder as usize] = r;
        }
        self.regs.d[quotient as usize] = q;
        set_logic_flags(&mut self.regs, q, Size::Long);
        Ok(())
    }

    pub(super) fn test_condition(&self, condition: Condition) -> bool {
        let c = self.regs.flag(FLAG_C);
        let v = self.regs.flag(FLAG_V);
        let z = self.regs.flag(FLAG_Z);
        let n = self.regs.flag(FLAG_N);
        match condition {
            Condition::True => true,
            Condition::False => false,
            Condition::Higher => !c && !z,
            Condition::LowerOrSame => c || z,
            Condition::CarryClear => !c,
            Condition::CarrySet => c,
            Condition::NotEqual => !z,
            Condition::Equal => z,
            Condition::OverflowClear => !v,
            Condition::OverflowSet => v,
            Condition::Plus => !n,
            Condition::Minus => n,
            Condition::GreaterOrEqual => n == v,
            Condition::LessThan => n != v,
            Condition::GreaterThan => !z && n == v,
            Condition::LessOrEqual => z || n != v,
        }
    }

    /// Apply addressing-mode side effects and say where the operand lives.
    pub(super) fn resolve(
        &mut self,
        ea: &EffectiveAddress,
        size: Size,
    ) -> EmuResult<ResolvedAddress> {
        Ok(match *ea {
            EffectiveAddress::DataReg(r) => ResolvedAddress::DataRegister(r),
            EffectiveAddress::AddrReg(r) => ResolvedAddress::AddressRegister(r),
            EffectiveAddress::Immediate(value) => ResolvedAddress::Immediate(value),
            EffectiveAddress::PostIncrement(r) => {
                let addr = self.regs.a[r as usize];
                self.regs.a[r as usize] = addr.wrapping_add(ea_step(size, r));
                ResolvedAddress::Memory(addr)
            }
            EffectiveAddress::PreDecrement(r) => {
                let addr = self.regs.a[r as usize].wrapping_sub(ea_step(size, r));
                self.regs.a[r as usize] = addr;
                ResolvedAddress::Memory(addr)
            }
            _ => ResolvedAddress::Memory(self.control_address(ea)?),
        })
    }

    /// Address of a memory operand that has no side effects.
    pub(super) fn control_address(&self, ea: &EffectiveAddress) -> EmuResult<u32> {
        match *ea {
            EffectiveAddress::Indirect(r) => Ok(self.regs.a[r as usize]),
            EffectiveAddress::Displacement { reg, disp } => {
                Ok(self.regs.a[reg as usize].wrapping_add(disp as i32 as u32))
            }
            EffectiveAddress::Indexed { reg, ext } => {
                self.indexed_address(self.regs.a[reg as usize], &ext)
            }
            EffectiveAddress::PcIndexed { base, ext } => self.indexed_address(base, &ext),
            other => other.static_target().ok_or_else(|| {
                EmulatorError::decode(self.regs.pc, 0, format!("{other} has no address"))
            }),
        }
    }

    fn index_value(&self, index: IndexRegister) -> u32 {
        let raw = if index.is_address {
            self.regs.a[index.reg as usize]
        } else {
            self.regs.d[index.reg as usize]
        };
        let value = if index.long { raw } else { raw as i16 as i32 as u32 };
        value.wrapping_mul(index.scale as u32)
    }

    fn indexed_address(&self, base: u32, ext: &IndexExtension) -> EmuResult<u32> {
        let base = if ext.base_suppressed { 0 } else { base };
        let base = base.wrapping_add(ext.base_disp as u32);
        let index = ext.index.map(|i| self.index_value(i)).unwrap_or(0);
        let outer = ext.outer_disp as u32;
        Ok(match ext.indirection {
            Indirection::None => base.wrapping_add(index),
            Indirection::PreIndexed => {
                let pointer = self.memory.borrow().read_u32b(base.wrapping_add(index))?;
                pointer.wrapping_add(outer)
            }
            Indirection::PostIndexed => {
                let pointer = self.memory.borrow().read_u32b(base)?;
                pointer.wrapping_add(index).wrapping_add(outer)
            }
        })
    }

    pub(super) fn read_resolved(&self, loc: ResolvedAddress, size: Size) -> EmuResult<u32> {
        let si = SizeInfo::new(size);
        Ok(match loc {
            ResolvedAddress::DataRegister(r) => si.apply(self.regs.d[r as usize]),
            ResolvedAddress::AddressRegister(r) => si.apply(self.regs.a[r as usize]),
            ResolvedAddress::Immediate(value) => si.apply(value),
            ResolvedAddress::Memory(addr) => self.read_mem(addr, size)?,
        })
    }

    pub(super) fn write_resolved(
        &mut self,
        loc: ResolvedAddress,
        size: Size,
        value: u32,
    ) -> EmuResult<()> {
        match loc {
            ResolvedAddress::DataRegister(r) => {
                let reg = &mut self.regs.d[r as usize];
                *reg = write_sized(*reg, value, size);
            }
            ResolvedAddress::AddressRegister(r) => self.regs.a[r as usize] = value,
            ResolvedAddress::Memory(addr) => self.write_mem(addr, size, value)?,
            ResolvedAddress::Immediate(_) => {
                return Err(EmulatorError::decode(
                    self.regs.pc,
                    0,
                    "write to an immediate operand",
                ));
            }
        }
        Ok(())
    }

    fn read_operand(&mut self, ea: &EffectiveAddress, size: Size) -> EmuResult<u32> {
        let loc = self.resolve(ea, size)?;
        self.read_resolved(loc, size)
    }

    fn write_operand(&mut self, ea: &EffectiveAddress, size: Size, value: u32) -> EmuResult<()> {
        let loc = self.resolve(ea, size)?;
        self.write_resolved(loc, size, value)
    }

    fn read_mem(&self, addr: u32, size: Size) -> EmuResult<u32> {
        let mem = self.memory.borrow();
        Ok(match size {
            Size::Byte => mem.read_u8(addr)? as u32,
            Size::Word => mem.read_u16b(addr)? as u32,
            Size::Long => mem.read_u32b(addr)?,
        })
    }

    fn write_mem(&mut self, addr: u32, size: Size, value: u32) -> EmuResult<()> {
        let mut mem = self.memory.borrow_mut();
        match size {
            Size::Byte => mem.write_u8(addr, value as u8)?,
            Size::Word => mem.write_u16b(addr, value as u16)?,
            Size::Long => mem.write_u32b(addr, value)?,
        }
        Ok(())
    }

    pub(crate) fn push_long(&mut self, value: u32) -> EmuResult<()> {
        let sp = self.regs.a[7].wrapping_sub(4);
        self.memory.borrow_mut().write_u32b(sp, value)?;
        self.regs.a[7] = sp;
        Ok(())
    }

    pub(crate) fn pop_long(&mut self) -> EmuResult<u32> {
        let value = self.memory.borrow().read_u32b(self.regs.a[7])?;
        self.regs.a[7] = self.regs.a[7].wrapping_add(4);
        Ok(value)
    }

    pub(crate) fn pop_word(&mut self) -> EmuResult<u16> {
        let value = self.memory.borrow().read_u16b(self.regs.a[7])?;
        self.regs.a[7] = self.regs.a[7].wrapping_add(2);
        Ok(value)
    }
}

fn logic(regs: &mut M68kRegisters, value: u32, size: Size) -> Option<u32> {
    set_logic_flags(regs, value, size);
    Some(value)
}

fn sign_extend_word(value: u32, size: Size) -> u32 {
    match size {
        Size::Word => value as u16 as i16 as i32 as u32,
        _ => value,
    }
}

/// The stack pointer always stays word-aligned, even for byte accesses.
fn ea_step(size: Size, reg: u8) -> u32 {
    match (size, reg) {
        (Size::Byte, 7) => 2,
        (size, _) => size.bytes(),
    }
}

fn divide_by_zero(inst: &Instruction) -> EmulatorError {
    EmulatorError::UnimplementedCall(format!(
        "integer divide by zero exception at {:08X}",
        inst.address
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emulator::{Emulator, shared},
        m68k::M68kEmulator,
        memory::AddressSpace,
    };

    const CODE: u32 = 0x1000;
    const STACK_TOP: u32 = 0x9000;

    fn emulator_with(code: &[u8]) -> M68kEmulator {
        let mut space = AddressSpace::new();
        space.allocate_at(CODE, 0x1000).unwrap();
        space.allocate_at(0x8000, 0x1000).unwrap();
        space.write(CODE, code).unwrap();
        let mut emu = M68kEmulator::new(shared(space));
        emu.registers_mut().pc = CODE;
        emu.registers_mut().a[7] = STACK_TOP;
        emu
    }

    fn run(code: &[u8]) -> M68kEmulator {
        let mut emu = emulator_with(code);
        emu.execute().unwrap();
        emu
    }

    #[test]
    fn move_and_rts_to_reset_sentinel() {
        let mut emu = emulator_with(&[0x20, 0x3C, 0x00, 0x00, 0x00, 0x2A, 0x4E, 0x75]);
        // Return address points at a reset opcode.
        emu.memory().borrow_mut().write_u16b(0x1800, 0x4E70).unwrap();
        emu.push_long(0x1800).unwrap();
        emu.execute().unwrap();
        assert_eq!(emu.registers().d[0], 0x2A);
        assert_eq!(emu.registers().pc, 0x1802);
        assert_eq!(emu.cycles(), 2);
    }

    #[test]
    fn add_overflow_without_carry() {
        // move.l #$7FFFFFFF,d0; moveq #1,d1; add.l d1,d0; reset
        let emu = run(&[
            0x20, 0x3C, 0x7F, 0xFF, 0xFF, 0xFF, 0x72, 0x01, 0xD0, 0x81, 0x4E, 0x70,
        ]);
        let regs = emu.registers();
        assert_eq!(regs.d[0], 0x8000_0000);
        assert!(regs.flag(FLAG_V));
        assert!(!regs.flag(FLAG_C));
        assert!(regs.flag(FLAG_N));
        assert!(!regs.flag(FLAG_Z));
    }

    #[test]
    fn dbf_loop_counts_down() {
        // moveq #4,d0; moveq #0,d1; loop: addq.l #2,d1; dbf d0,loop; reset
        let emu = run(&[0x70, 0x04, 0x72, 0x00, 0x54, 0x81, 0x51, 0xC8, 0xFF, 0xFC, 0x4E, 0x70]);
        assert_eq!(emu.registers().d[1], 10);
        assert_eq!(emu.registers().d[0] & 0xFFFF, 0xFFFF);
    }

    #[test]
    fn movem_round_trip_through_stack() {
        // moveq #1,d0; moveq #2,d1; movea.l #$1234,a2
        // movem.l d0-d1/a2,-(sp); clr.l d0; clr.l d1; suba.l a2,a2
        // movem.l (sp)+,d0-d1/a2; reset
        let emu = run(&[
            0x70, 0x01, 0x72, 0x02, 0x24, 0x7C, 0x00, 0x00, 0x12, 0x34, 0x48, 0xE7, 0xC0, 0x20,
            0x42, 0x80, 0x42, 0x81, 0x95, 0xCA, 0x4C, 0xDF, 0x04, 0x03, 0x4E, 0x70,
        ]);
        let regs = emu.registers();
        assert_eq!(regs.d[0], 1);
        assert_eq!(regs.d[1], 2);
        assert_eq!(regs.a[2], 0x1234);
        assert_eq!(regs.a[7], STACK_TOP);
    }

    #[test]
    fn pc_relative_read_matches_disassembly() {
        // move.w (4,pc),d0; reset; dc.w $BEEF
        let code = [0x30, 0x3A, 0x00, 0x04, 0x4E, 0x70, 0xBE, 0xEF];
        let text = M68kEmulator::disassemble_one(&code, CODE);
        assert!(text.contains("[0x00001006]"), "{text}");
        let emu = run(&code);
        assert_eq!(emu.registers().d[0] & 0xFFFF, 0xBEEF);
    }

    #[test]
    fn postincrement_byte_on_stack_pointer_steps_by_two() {
        // move.b (sp)+,d0; reset
        let mut emu = emulator_with(&[0x10, 0x1F, 0x4E, 0x70]);
        emu.registers_mut().a[7] = 0x8800;
        emu.memory().borrow_mut().write_u8(0x8800, 0x7F).unwrap();
        emu.execute().unwrap();
        assert_eq!(emu.registers().a[7], 0x8802);
        assert_eq!(emu.registers().d[0] & 0xFF, 0x7F);
    }

    #[test]
    fn a_line_trap_reaches_handler() {
        // _NewPtr (A11E); reset
        let mut emu = emulator_with(&[0xA1, 0x1E, 0x4E, 0x70]);
        emu.set_syscall_handler(Box::new(|emu, word| {
            assert_eq!(word, 0xA11E);
            assert_eq!(emu.registers().pc, CODE + 2);
            emu.registers_mut().a[0] = 0x5000;
            Ok(())
        }));
        emu.execute().unwrap();
        assert_eq!(emu.registers().a[0], 0x5000);
    }

    #[test]
    fn a_line_without_handler_is_fatal() {
        let mut emu = emulator_with(&[0xA1, 0x1E]);
        let err = emu.execute().unwrap_err();
        assert!(matches!(err, EmulatorError::UnimplementedCall(_)));
    }

    #[test]
    fn unmapped_fetch_is_a_memory_error() {
        let mut emu = emulator_with(&[0x4E, 0xF9, 0x00, 0x10, 0x00, 0x00]);
        let err = emu.execute().unwrap_err();
        assert!(matches!(err, EmulatorError::Memory(_)));
    }

    #[test]
    fn shifts_and_rotates() {
        let asl = shift_value(ShiftOp::Arithmetic, RightOrLeft::Left, Size::Byte, 0x40, 1, false);
        assert_eq!(asl.result, 0x80);
        assert!(asl.overflow);
        assert_eq!(asl.carry, Some(false));

        let lsr = shift_value(ShiftOp::Logical, RightOrLeft::Right, Size::Long, 1, 1, false);
        assert_eq!((lsr.result, lsr.carry), (0, Some(true)));

        let asr = shift_value(ShiftOp::Arithmetic, RightOrLeft::Right, Size::Word, 0x8000, 20, false);
        assert_eq!((asr.result, asr.carry), (0xFFFF, Some(true)));

        let rol = shift_value(ShiftOp::Rotate, RightOrLeft::Left, Size::Long, 0x8000_0001, 1, false);
        assert_eq!((rol.result, rol.carry), (0x0000_0003, Some(true)));

        let roxr = shift_value(ShiftOp::RotateExtend, RightOrLeft::Right, Size::Byte, 0x01, 1, true);
        assert_eq!((roxr.result, roxr.carry), (0x80, Some(true)));

        let lsl32 = shift_value(ShiftOp::Logical, RightOrLeft::Left, Size::Long, 1, 32, false);
        assert_eq!((lsl32.result, lsl32.carry), (0, Some(true)));
    }

    #[test]
    fn bcd_arithmetic() {
        assert_eq!(add_bcd(0x45, 0x38, 0), (0x83, false));
        assert_eq!(add_bcd(0x99, 0x01, 0), (0x00, true));
        assert_eq!(sub_bcd(0x10, 0x01, 0), (0x09, false));
        assert_eq!(sub_bcd(0x00, 0x01, 0), (0x99, true));
    }

    #[test]
    fn divide_word_overflow_leaves_register() {
        // move.l #$10000000,d0; divu.w #1,d0; reset
        let emu = run(&[
            0x20, 0x3C, 0x10, 0x00, 0x00, 0x00, 0x80, 0xFC, 0x00, 0x01, 0x4E, 0x70,
        ]);
        assert_eq!(emu.registers().d[0], 0x1000_0000);
        assert!(emu.registers().flag(FLAG_V));
    }

    #[test]
    fn long_multiply_into_register_pair() {
        // move.l #$10000,d0; mulu.l d0,d1:d0 (with d0 = 0x10000) ; reset
        let emu = run(&[
            0x20, 0x3C, 0x00, 0x01, 0x00, 0x00, 0x4C, 0x00, 0x04, 0x01, 0x4E, 0x70,
        ]);
        assert_eq!(emu.registers().d[1], 1);
        assert_eq!(emu.registers().d[0], 0);
    }

    #[test]
    fn max_cycles_stops_cleanly() {
        // bra.s *
        let mut emu = emulator_with(&[0x60, 0xFE]);
        emu.set_max_cycles(Some(100));
        emu.execute().unwrap();
        assert_eq!(emu.cycles(), 100);
        assert_eq!(emu.registers().pc, CODE);
    }
}
