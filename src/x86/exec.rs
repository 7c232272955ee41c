use super::{
    AF, CF, DF, OF, PF, SF, USER_FLAGS, X86Emulator, ZF,
    decoder::{
        AluOp, BitTestOp, BranchTarget, Condition, EAX, EBP, EBX, ECX, EDI, EDX, ESI, ESP, FlagOp,
        Instruction, LoopKind, MemoryOperand, MulDivOp, Opcode, Operand, OperandSize, Repeat,
        ShiftCount, ShiftOp, StringOp,
    },
    full_register,
    trace::Location,
};
use crate::emulator::{Behavior, EmuResult, EmulatorError, call_syscall_handler};

/// Where an operand lives once its address has been computed.
#[derive(Debug, Clone, Copy)]
enum Place {
    Register(u8),
    Memory(u32),
    Immediate(u32),
}

fn sign_extend(value: u32, size: OperandSize) -> i64 {
    match size {
        OperandSize::Byte => value as u8 as i8 as i64,
        OperandSize::Word => value as u16 as i16 as i64,
        OperandSize::Dword => value as i32 as i64,
    }
}

fn even_parity(value: u32) -> bool {
    (value as u8).count_ones() % 2 == 0
}

fn msb(value: u32, size: OperandSize) -> bool {
    value & size.sign_bit() != 0
}

impl X86Emulator {
    pub(super) fn execute_instruction(&mut self, inst: &Instruction) -> EmuResult<()> {
        match inst.opcode {
            Opcode::Alu { op, size, dst, src } => {
                let dst = self.resolve(dst);
                let b = self.read_operand(src, size)?;
                let a = self.read_place(dst, size)?;
                let result = match op {
                    AluOp::Add => self.add_flags(a, b, 0, size),
                    AluOp::Adc => {
                        let carry = self.carry_in();
                        self.add_flags(a, b, carry, size)
                    }
                    AluOp::Sub | AluOp::Cmp => self.sub_flags(a, b, 0, size),
                    AluOp::Sbb => {
                        let borrow = self.carry_in();
                        self.sub_flags(a, b, borrow, size)
                    }
                    AluOp::And => self.logic_flags(a & b, size),
                    AluOp::Or => self.logic_flags(a | b, size),
                    AluOp::Xor => self.logic_flags(a ^ b, size),
                };
                if op != AluOp::Cmp {
                    self.write_place(dst, size, result)?;
                }
            }
            Opcode::Test { size, dst, src } => {
                let a = self.read_operand(dst, size)?;
                let b = self.read_operand(src, size)?;
                self.logic_flags(a & b, size);
            }
            Opcode::Mov { size, dst, src } => {
                let value = self.read_operand(src, size)?;
                self.write_operand(dst, size, value)?;
            }
            Opcode::MovExtend {
                signed,
                size,
                src_size,
                dst,
                src,
            } => {
                let value = self.read_operand(src, src_size)?;
                let value = if signed {
                    sign_extend(value, src_size) as u32
                } else {
                    value
                };
                self.write_reg(dst, size, value);
            }
            Opcode::Lea { size, dst, src } => {
                let addr = self.effective_address(&src, true);
                self.write_reg(dst, size, addr);
            }
            Opcode::Xchg { size, a, b } => {
                let a = self.resolve(a);
                let b = self.resolve(b);
                let va = self.read_place(a, size)?;
                let vb = self.read_place(b, size)?;
                self.write_place(a, size, vb)?;
                self.write_place(b, size, va)?;
            }
            Opcode::IncDec { inc, size, dst } => {
                let dst = self.resolve(dst);
                let value = self.read_place(dst, size)?;
                let carry = self.regs.flag(CF);
                let result = if inc {
                    self.add_flags(value, 1, 0, size)
                } else {
                    self.sub_flags(value, 1, 0, size)
                };
                self.regs.set_flag(CF, carry);
                self.write_place(dst, size, result)?;
            }
            Opcode::Not { size, dst } => {
                let dst = self.resolve(dst);
                let value = self.read_place(dst, size)?;
                self.write_place(dst, size, !value & size.mask())?;
            }
            Opcode::Neg { size, dst } => {
                let dst = self.resolve(dst);
                let value = self.read_place(dst, size)?;
                let result = self.sub_flags(0, value, 0, size);
                self.write_place(dst, size, result)?;
            }
            Opcode::MulDiv { op, size, src } => {
                let src = self.read_operand(src, size)?;
                match op {
                    MulDivOp::Mul | MulDivOp::Imul => self.multiply(op == MulDivOp::Imul, size, src),
                    MulDivOp::Div => self.divide_unsigned(inst, size, src)?,
                    MulDivOp::Idiv => self.divide_signed(inst, size, src)?,
                }
            }
            Opcode::Imul {
                size,
                dst,
                src,
                imm,
            } => {
                let b = self.read_operand(src, size)?;
                let a = match imm {
                    Some(imm) => imm,
                    None => self.read_reg(dst, size),
                };
                let product = sign_extend(a, size) * sign_extend(b, size);
                let low = product as u32 & size.mask();
                self.set_multiply_flags(product != sign_extend(low, size), low, size);
                self.write_reg(dst, size, low);
            }
            Opcode::Shift {
                op,
                size,
                dst,
                count,
            } => {
                let count = self.shift_count(count) & 0x1F;
                if count != 0 {
                    let dst = self.resolve(dst);
                    let value = self.read_place(dst, size)?;
                    let result = self.shift(op, size, value, count);
                    self.write_place(dst, size, result)?;
                }
            }
            Opcode::DoubleShift {
                left,
                size,
                dst,
                src,
                count,
            } => {
                let count = self.shift_count(count) & 0x1F;
                if count != 0 {
                    let dst = self.resolve(dst);
                    let value = self.read_place(dst, size)?;
                    let fill = self.read_reg(src, size);
                    let result = self.double_shift(left, size, value, fill, count);
                    self.write_place(dst, size, result)?;
                }
            }
            Opcode::Push { size, src } => {
                let value = self.read_operand(src, size)?;
                self.push(size, value)?;
            }
            Opcode::Pop { size, dst } => {
                let value = self.pop(size)?;
                self.write_operand(dst, size, value)?;
            }
            Opcode::Pushad => {
                let original_esp = self.regs.regs[ESP as usize];
                for reg in [EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI] {
                    let value = if reg == ESP {
                        original_esp
                    } else {
                        self.read_reg(reg, OperandSize::Dword)
                    };
                    self.push(OperandSize::Dword, value)?;
                }
            }
            Opcode::Popad => {
                for reg in [EDI, ESI, EBP, ESP, EBX, EDX, ECX, EAX] {
                    let value = self.pop(OperandSize::Dword)?;
                    if reg != ESP {
                        self.write_reg(reg, OperandSize::Dword, value);
                    }
                }
            }
            Opcode::Pushfd => {
                self.trace_read(Location::Flags);
                self.push(OperandSize::Dword, self.regs.eflags & 0x00FC_FFFF)?;
            }
            Opcode::Popfd => {
                let value = self.pop(OperandSize::Dword)?;
                self.regs.eflags = (self.regs.eflags & !USER_FLAGS) | (value & USER_FLAGS);
                self.trace_write(Location::Flags);
            }
            Opcode::Jmp { target } => {
                self.regs.eip = self.branch_target(target)?;
            }
            Opcode::Call { target } => {
                let target = self.branch_target(target)?;
                self.push(OperandSize::Dword, self.regs.eip)?;
                self.regs.eip = target;
            }
            Opcode::Ret { pop } => {
                self.regs.eip = self.pop(OperandSize::Dword)?;
                let esp = &mut self.regs.regs[ESP as usize];
                *esp = esp.wrapping_add(pop as u32);
            }
            Opcode::Jcc { condition, target } => {
                if self.condition(condition) {
                    self.regs.eip = target;
                }
            }
            Opcode::Setcc { condition, dst } => {
                let value = self.condition(condition) as u32;
                self.write_operand(dst, OperandSize::Byte, value)?;
            }
            Opcode::Cmovcc {
                condition,
                size,
                dst,
                src,
            } => {
                let value = self.read_operand(src, size)?;
                if self.condition(condition) {
                    self.write_reg(dst, size, value);
                }
            }
            Opcode::Loop { kind, target } => {
                let count = self.read_reg(ECX, OperandSize::Dword);
                let taken = if kind == LoopKind::JumpIfEcxZero {
                    count == 0
                } else {
                    let count = count.wrapping_sub(1);
                    self.write_reg(ECX, OperandSize::Dword, count);
                    count != 0
                        && match kind {
                            LoopKind::LoopEqual => self.condition(Condition::Equal),
                            LoopKind::LoopNotEqual => self.condition(Condition::NotEqual),
                            _ => true,
                        }
                };
                if taken {
                    self.regs.eip = target;
                }
            }
            Opcode::ExtendAccumulator { size } => {
                let half = if size == OperandSize::Word {
                    OperandSize::Byte
                } else {
                    OperandSize::Word
                };
                let value = self.read_reg(EAX, half);
                self.write_reg(EAX, size, sign_extend(value, half) as u32);
            }
            Opcode::ExtendIntoDx { size } => {
                let value = self.read_reg(EAX, size);
                let fill = if msb(value, size) { size.mask() } else { 0 };
                self.write_reg(EDX, size, fill);
            }
            Opcode::Leave => {
                self.regs.regs[ESP as usize] = self.regs.regs[EBP as usize];
                let value = self.pop(OperandSize::Dword)?;
                self.write_reg(EBP, OperandSize::Dword, value);
            }
            Opcode::Nop => {}
            Opcode::Int { vector } => call_syscall_handler(self, vector)?,
            Opcode::Rdtsc => {
                let value = self.time_base.read(self.cycles);
                self.write_reg(EAX, OperandSize::Dword, value as u32);
                self.write_reg(EDX, OperandSize::Dword, (value >> 32) as u32);
            }
            Opcode::Flag(op) => {
                match op {
                    FlagOp::Clc => self.regs.set_flag(CF, false),
                    FlagOp::Stc => self.regs.set_flag(CF, true),
                    FlagOp::Cmc => {
                        self.trace_read(Location::Flags);
                        let carry = self.regs.flag(CF);
                        self.regs.set_flag(CF, !carry);
                    }
                    FlagOp::Cld => self.regs.set_flag(DF, false),
                    FlagOp::Std => self.regs.set_flag(DF, true),
                }
                self.trace_write(Location::Flags);
            }
            Opcode::Bswap { reg } => {
                let value = self.read_reg(reg, OperandSize::Dword);
                self.write_reg(reg, OperandSize::Dword, value.swap_bytes());
            }
            Opcode::BitScan {
                reverse,
                size,
                dst,
                src,
            } => {
                let value = self.read_operand(src, size)? & size.mask();
                self.regs.set_flag(ZF, value == 0);
                self.trace_write(Location::Flags);
                if value != 0 {
                    let index = if reverse {
                        31 - value.leading_zeros()
                    } else {
                        value.trailing_zeros()
                    };
                    self.write_reg(dst, size, index);
                } else if self.behavior == Behavior::WindowsArmEmulator {
                    self.write_reg(dst, size, 0);
                }
            }
            Opcode::BitTest { op, size, dst, bit } => self.bit_test(op, size, dst, bit)?,
            Opcode::String { op, size, repeat } => self.string_op(op, size, repeat)?,
        }
        Ok(())
    }

    fn carry_in(&mut self) -> u32 {
        self.trace_read(Location::Flags);
        self.regs.flag(CF) as u32
    }

    fn condition(&mut self, condition: Condition) -> bool {
        self.trace_read(Location::Flags);
        let r = &self.regs;
        match condition {
            Condition::Overflow => r.flag(OF),
            Condition::NotOverflow => !r.flag(OF),
            Condition::Below => r.flag(CF),
            Condition::AboveOrEqual => !r.flag(CF),
            Condition::Equal => r.flag(ZF),
            Condition::NotEqual => !r.flag(ZF),
            Condition::BelowOrEqual => r.flag(CF) || r.flag(ZF),
            Condition::Above => !r.flag(CF) && !r.flag(ZF),
            Condition::Sign => r.flag(SF),
            Condition::NotSign => !r.flag(SF),
            Condition::Parity => r.flag(PF),
            Condition::NotParity => !r.flag(PF),
            Condition::Less => r.flag(SF) != r.flag(OF),
            Condition::GreaterOrEqual => r.flag(SF) == r.flag(OF),
            Condition::LessOrEqual => r.flag(ZF) || r.flag(SF) != r.flag(OF),
            Condition::Greater => !r.flag(ZF) && r.flag(SF) == r.flag(OF),
        }
    }

    fn set_result_flags(&mut self, result: u32, size: OperandSize) {
        self.regs.set_flag(ZF, result & size.mask() == 0);
        self.regs.set_flag(SF, msb(result, size));
        self.regs.set_flag(PF, even_parity(result));
        self.trace_write(Location::Flags);
    }

    fn add_flags(&mut self, a: u32, b: u32, carry: u32, size: OperandSize) -> u32 {
        let wide = a as u64 + b as u64 + carry as u64;
        let result = wide as u32 & size.mask();
        self.regs.set_flag(CF, wide > size.mask() as u64);
        self.regs
            .set_flag(OF, (a ^ result) & (b ^ result) & size.sign_bit() != 0);
        self.regs.set_flag(AF, (a ^ b ^ result) & 0x10 != 0);
        self.set_result_flags(result, size);
        result
    }

    fn sub_flags(&mut self, a: u32, b: u32, borrow: u32, size: OperandSize) -> u32 {
        let result = a.wrapping_sub(b).wrapping_sub(borrow) & size.mask();
        self.regs
            .set_flag(CF, (a as u64) < b as u64 + borrow as u64);
        self.regs
            .set_flag(OF, (a ^ b) & (a ^ result) & size.sign_bit() != 0);
        self.regs.set_flag(AF, (a ^ b ^ result) & 0x10 != 0);
        self.set_result_flags(result, size);
        result
    }

    fn logic_flags(&mut self, result: u32, size: OperandSize) -> u32 {
        self.regs.set_flag(CF, false);
        self.regs.set_flag(OF, false);
        if self.behavior == Behavior::Specification {
            self.regs.set_flag(AF, false);
        }
        self.set_result_flags(result, size);
        result
    }

    /// CF and OF report a significant upper half; SF, ZF and PF follow the
    /// low half except under the ARM emulator profile, which leaves them.
    fn set_multiply_flags(&mut self, overflow: bool, low: u32, size: OperandSize) {
        self.regs.set_flag(CF, overflow);
        self.regs.set_flag(OF, overflow);
        if self.behavior == Behavior::Specification {
            self.set_result_flags(low, size);
        } else {
            self.trace_write(Location::Flags);
        }
    }

    fn multiply(&mut self, signed: bool, size: OperandSize, src: u32) {
        let acc = self.read_reg(EAX, size);
        let bits = size.bits();
        let (product, overflow) = if signed {
            let product = sign_extend(acc, size) * sign_extend(src, size);
            let low = product as u32 & size.mask();
            (product as u64, product != sign_extend(low, size))
        } else {
            let product = acc as u64 * src as u64;
            (product, product >> bits != 0)
        };
        let low = product as u32 & size.mask();
        let high = (product >> bits) as u32 & size.mask();
        match size {
            OperandSize::Byte => self.write_reg(EAX, OperandSize::Word, (high << 8) | low),
            _ => {
                self.write_reg(EAX, size, low);
                self.write_reg(EDX, size, high);
            }
        }
        self.set_multiply_flags(overflow, low, size);
    }

    fn dividend(&mut self, size: OperandSize) -> u64 {
        match size {
            OperandSize::Byte => self.read_reg(EAX, OperandSize::Word) as u64,
            _ => {
                let high = self.read_reg(EDX, size) as u64;
                let low = self.read_reg(EAX, size) as u64;
                (high << size.bits()) | low
            }
        }
    }

    fn store_division(&mut self, size: OperandSize, quotient: u32, remainder: u32) {
        match size {
            OperandSize::Byte => self.write_reg(
                EAX,
                OperandSize::Word,
                ((remainder & 0xFF) << 8) | (quotient & 0xFF),
            ),
            _ => {
                self.write_reg(EAX, size, quotient);
                self.write_reg(EDX, size, remainder);
            }
        }
    }

    fn divide_unsigned(&mut self, inst: &Instruction, size: OperandSize, src: u32) -> EmuResult<()> {
        let dividend = self.dividend(size);
        let divisor = (src & size.mask()) as u64;
        let quotient = dividend.checked_div(divisor).ok_or_else(|| divide_error(inst))?;
        if quotient > size.mask() as u64 {
            return Err(divide_error(inst));
        }
        self.store_division(size, quotient as u32, (dividend % divisor) as u32);
        Ok(())
    }

    fn divide_signed(&mut self, inst: &Instruction, size: OperandSize, src: u32) -> EmuResult<()> {
        let raw = self.dividend(size);
        let dividend = match size {
            OperandSize::Byte => raw as u16 as i16 as i64,
            OperandSize::Word => raw as u32 as i32 as i64,
            OperandSize::Dword => raw as i64,
        };
        let divisor = sign_extend(src, size);
        let quotient = dividend.checked_div(divisor).ok_or_else(|| divide_error(inst))?;
        let limit = size.sign_bit() as i64;
        if quotient < -limit || quotient >= limit {
            return Err(divide_error(inst));
        }
        let remainder = dividend.checked_rem(divisor).ok_or_else(|| divide_error(inst))?;
        self.store_division(size, quotient as u32, remainder as u32);
        Ok(())
    }

    fn shift_count(&mut self, count: ShiftCount) -> u32 {
        match count {
            ShiftCount::One => 1,
            ShiftCount::Cl => self.read_reg(ECX, OperandSize::Byte),
            ShiftCount::Immediate(n) => n as u32,
        }
    }

    /// `count` is already masked to 1..=31.
    fn shift(&mut self, op: ShiftOp, size: OperandSize, value: u32, count: u32) -> u32 {
        let bits = size.bits();
        let mask = size.mask();
        let value = value & mask;
        if matches!(op, ShiftOp::Rcl | ShiftOp::Rcr) {
            self.trace_read(Location::Flags);
        }

        let (result, carry, overflow) = match op {
            ShiftOp::Shl => {
                let result = ((value as u64) << count) as u32 & mask;
                let carry = count <= bits && (value as u64 >> (bits - count)) & 1 != 0;
                (result, carry, msb(result, size) != carry)
            }
            ShiftOp::Shr => {
                let result = (value as u64 >> count) as u32;
                let carry = count <= bits && (value >> (count - 1)) & 1 != 0;
                (result, carry, msb(value, size))
            }
            ShiftOp::Sar => {
                let signed = sign_extend(value, size);
                let result = (signed >> count) as u32 & mask;
                let carry = (signed >> (count - 1)) & 1 != 0;
                (result, carry, false)
            }
            ShiftOp::Rol => {
                let n = count % bits;
                let result = if n == 0 {
                    value
                } else {
                    ((value << n) | (value >> (bits - n))) & mask
                };
                let carry = result & 1 != 0;
                (result, carry, msb(result, size) != carry)
            }
            ShiftOp::Ror => {
                let n = count % bits;
                let result = if n == 0 {
                    value
                } else {
                    ((value >> n) | (value << (bits - n))) & mask
                };
                let top = msb(result, size);
                (result, top, top != msb(result << 1, size))
            }
            ShiftOp::Rcl | ShiftOp::Rcr => {
                let n = count % (bits + 1);
                let mut carry = self.regs.flag(CF);
                let mut result = value;
                for _ in 0..n {
                    if op == ShiftOp::Rcl {
                        let out = msb(result, size);
                        result = ((result << 1) | carry as u32) & mask;
                        carry = out;
                    } else {
                        let out = result & 1 != 0;
                        result = (result >> 1) | ((carry as u32) << (bits - 1));
                        carry = out;
                    }
                }
                let overflow = if op == ShiftOp::Rcl {
                    msb(result, size) != carry
                } else {
                    msb(result, size) != msb(result << 1, size)
                };
                (result, carry, overflow)
            }
        };

        self.regs.set_flag(CF, carry);
        if count == 1 || self.behavior == Behavior::Specification {
            self.regs.set_flag(OF, overflow);
        }
        if matches!(op, ShiftOp::Shl | ShiftOp::Shr | ShiftOp::Sar) {
            self.set_result_flags(result, size);
        } else {
            self.trace_write(Location::Flags);
        }
        result
    }

    fn double_shift(&mut self, left: bool, size: OperandSize, value: u32, fill: u32, count: u32) -> u32 {
        let bits = size.bits();
        let mask = size.mask();
        let (result, carry) = if left {
            let combined = ((value as u128) << bits) | fill as u128;
            let result = ((combined << count) >> bits) as u32 & mask;
            (result, (combined >> (2 * bits - count)) & 1 != 0)
        } else {
            let combined = ((fill as u128) << bits) | value as u128;
            let result = (combined >> count) as u32 & mask;
            (result, (combined >> (count - 1)) & 1 != 0)
        };
        self.regs.set_flag(CF, carry);
        if count == 1 || self.behavior == Behavior::Specification {
            self.regs.set_flag(OF, msb(result, size) != msb(value, size));
        }
        self.set_result_flags(result, size);
        result
    }

    fn bit_test(&mut self, op: BitTestOp, size: OperandSize, dst: Operand, bit: Operand) -> EmuResult<()> {
        let bits = size.bits();
        let offset = self.read_operand(bit, size)?;
        let (place, index) = match (dst, bit) {
            // A register bit offset can reach outside the addressed operand.
            (Operand::Memory(mem), Operand::Register(_)) => {
                let base = self.effective_address(&mem, false);
                let signed = sign_extend(offset, size);
                let units = signed.div_euclid(bits as i64);
                let addr = base.wrapping_add((units * size.bytes() as i64) as u32);
                (Place::Memory(addr), signed.rem_euclid(bits as i64) as u32)
            }
            (dst, _) => (self.resolve(dst), offset % bits),
        };
        let value = self.read_place(place, size)?;
        let mask = 1 << index;
        self.regs.set_flag(CF, value & mask != 0);
        self.trace_write(Location::Flags);
        let updated = match op {
            BitTestOp::Bt => return Ok(()),
            BitTestOp::Bts => value | mask,
            BitTestOp::Btr => value & !mask,
            BitTestOp::Btc => value ^ mask,
        };
        self.write_place(place, size, updated)
    }

    fn string_op(&mut self, op: StringOp, size: OperandSize, repeat: Repeat) -> EmuResult<()> {
        self.trace_read(Location::Flags);
        let step = if self.regs.flag(DF) {
            size.bytes().wrapping_neg()
        } else {
            size.bytes()
        };
        loop {
            if repeat != Repeat::None && self.regs.regs[ECX as usize] == 0 {
                break;
            }
            let esi = self.regs.regs[ESI as usize];
            let edi = self.regs.regs[EDI as usize];
            match op {
                StringOp::Movs => {
                    self.trace_address_read(Location::Register(ESI));
                    self.trace_address_read(Location::Register(EDI));
                    let value = self.load(esi, size)?;
                    self.store(edi, size, value)?;
                }
                StringOp::Stos => {
                    self.trace_address_read(Location::Register(EDI));
                    let value = self.read_reg(EAX, size);
                    self.store(edi, size, value)?;
                }
                StringOp::Lods => {
                    self.trace_address_read(Location::Register(ESI));
                    let value = self.load(esi, size)?;
                    self.write_reg(EAX, size, value);
                }
                StringOp::Cmps => {
                    self.trace_address_read(Location::Register(ESI));
                    self.trace_address_read(Location::Register(EDI));
                    let a = self.load(esi, size)?;
                    let b = self.load(edi, size)?;
                    self.sub_flags(a, b, 0, size);
                }
                StringOp::Scas => {
                    self.trace_address_read(Location::Register(EDI));
                    let a = self.read_reg(EAX, size);
                    let b = self.load(edi, size)?;
                    self.sub_flags(a, b, 0, size);
                }
            }
            if matches!(op, StringOp::Movs | StringOp::Lods | StringOp::Cmps) {
                self.regs.regs[ESI as usize] = esi.wrapping_add(step);
            }
            if op != StringOp::Lods {
                self.regs.regs[EDI as usize] = edi.wrapping_add(step);
            }
            if repeat == Repeat::None {
                break;
            }
            let ecx = &mut self.regs.regs[ECX as usize];
            *ecx = ecx.wrapping_sub(1);
            if matches!(op, StringOp::Cmps | StringOp::Scas) {
                let zero = self.regs.flag(ZF);
                if (repeat == Repeat::Equal && !zero) || (repeat == Repeat::NotEqual && zero) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn branch_target(&mut self, target: BranchTarget) -> EmuResult<u32> {
        match target {
            BranchTarget::Direct(addr) => Ok(addr),
            BranchTarget::Indirect(op) => self.read_operand(op, OperandSize::Dword),
        }
    }

    fn push(&mut self, size: OperandSize, value: u32) -> EmuResult<()> {
        let esp = self.regs.regs[ESP as usize].wrapping_sub(size.bytes());
        self.store(esp, size, value)?;
        self.regs.regs[ESP as usize] = esp;
        Ok(())
    }

    fn pop(&mut self, size: OperandSize) -> EmuResult<u32> {
        let esp = self.regs.regs[ESP as usize];
        let value = self.load(esp, size)?;
        self.regs.regs[ESP as usize] = esp.wrapping_add(size.bytes());
        Ok(value)
    }

    fn read_reg(&mut self, reg: u8, size: OperandSize) -> u32 {
        self.trace_read(Location::Register(full_register(reg, size)));
        self.regs.read(reg, size)
    }

    fn write_reg(&mut self, reg: u8, size: OperandSize, value: u32) {
        self.trace_write(Location::Register(full_register(reg, size)));
        self.regs.write(reg, size, value);
    }

    /// `as_data` marks address arithmetic whose result is itself the value
    /// (`lea`), so the registers always count as inputs.
    fn effective_address(&mut self, mem: &MemoryOperand, as_data: bool) -> u32 {
        let mut addr = mem.disp as u32;
        for (reg, scale) in [(mem.base, 1), (mem.index, mem.scale as u32)] {
            let Some(reg) = reg else { continue };
            if as_data {
                self.trace_read(Location::Register(reg));
            } else {
                self.trace_address_read(Location::Register(reg));
            }
            addr = addr.wrapping_add(self.regs.regs[reg as usize].wrapping_mul(scale));
        }
        addr
    }

    fn resolve(&mut self, op: Operand) -> Place {
        match op {
            Operand::Register(reg) => Place::Register(reg),
            Operand::Memory(mem) => Place::Memory(self.effective_address(&mem, false)),
            Operand::Immediate(value) => Place::Immediate(value),
        }
    }

    fn read_place(&mut self, place: Place, size: OperandSize) -> EmuResult<u32> {
        match place {
            Place::Register(reg) => Ok(self.read_reg(reg, size)),
            Place::Memory(addr) => self.load(addr, size),
            Place::Immediate(value) => Ok(value & size.mask()),
        }
    }

    fn write_place(&mut self, place: Place, size: OperandSize, value: u32) -> EmuResult<()> {
        match place {
            Place::Register(reg) => {
                self.write_reg(reg, size, value);
                Ok(())
            }
            Place::Memory(addr) => self.store(addr, size, value),
            Place::Immediate(_) => Err(EmulatorError::decode(
                self.regs.eip,
                0,
                "immediate operand used as a destination",
            )),
        }
    }

    fn read_operand(&mut self, op: Operand, size: OperandSize) -> EmuResult<u32> {
        let place = self.resolve(op);
        self.read_place(place, size)
    }

    fn write_operand(&mut self, op: Operand, size: OperandSize, value: u32) -> EmuResult<()> {
        let place = self.resolve(op);
        self.write_place(place, size, value)
    }

    fn load(&mut self, addr: u32, size: OperandSize) -> EmuResult<u32> {
        let value = {
            let mem = self.memory.borrow();
            match size {
                OperandSize::Byte => mem.read_u8(addr)? as u32,
                OperandSize::Word => mem.read_u16l(addr)? as u32,
                OperandSize::Dword => mem.read_u32l(addr)?,
            }
        };
        if self.tracer.is_some() {
            for i in 0..size.bytes() {
                self.trace_read(Location::Memory(addr.wrapping_add(i)));
            }
        }
        Ok(value)
    }

    fn store(&mut self, addr: u32, size: OperandSize, value: u32) -> EmuResult<()> {
        {
            let mut mem = self.memory.borrow_mut();
            match size {
                OperandSize::Byte => mem.write_u8(addr, value as u8)?,
                OperandSize::Word => mem.write_u16l(addr, value as u16)?,
                OperandSize::Dword => mem.write_u32l(addr, value)?,
            }
        }
        if self.tracer.is_some() {
            for i in 0..size.bytes() {
                self.trace_write(Location::Memory(addr.wrapping_add(i)));
            }
        }
        Ok(())
    }
}

fn divide_error(inst: &Instruction) -> EmulatorError {
    EmulatorError::UnimplementedCall(format!(
        "divide error at {:08X}: {inst}",
        inst.address
    ))
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;
    use crate::{
        emulator::{Emulator, TimeBase, shared},
        memory::AddressSpace,
    };

    const CODE: u32 = 0x0040_1000;
    const DATA: u32 = 0x0000_2000;
    const STACK: u32 = 0x0001_0000;

    fn emulator(code: &[u8]) -> X86Emulator {
        let mut mem = AddressSpace::new();
        mem.allocate_at(CODE, 0x1000).unwrap();
        mem.write(CODE, code).unwrap();
        mem.allocate_at(DATA, 0x1000).unwrap();
        mem.allocate_at(STACK - 0x1000, 0x1000).unwrap();
        let mut emu = X86Emulator::new(shared(mem));
        emu.set_pc(CODE);
        emu.set_stack_pointer(STACK);
        emu
    }

    fn steps(emu: &mut X86Emulator, n: usize) {
        for _ in 0..n {
            emu.step().unwrap();
        }
    }

    #[test]
    fn signed_overflow_without_carry() {
        // mov eax, 0x7fffffff; add eax, 1
        let mut emu = emulator(&[0xB8, 0xFF, 0xFF, 0xFF, 0x7F, 0x83, 0xC0, 0x01]);
        steps(&mut emu, 2);
        let regs = emu.registers();
        assert_eq!(regs.regs[0], 0x8000_0000);
        assert!(regs.flag(OF));
        assert!(!regs.flag(CF));
        assert!(regs.flag(SF));
        assert!(regs.flag(AF));
    }

    #[test]
    fn unsigned_wrap_sets_carry_and_zero() {
        // mov eax, -1; add eax, 1; adc ebx, 0
        let mut emu = emulator(&[
            0xB8, 0xFF, 0xFF, 0xFF, 0xFF, 0x83, 0xC0, 0x01, 0x83, 0xD3, 0x00,
        ]);
        steps(&mut emu, 3);
        let regs = emu.registers();
        assert_eq!(regs.regs[0], 0);
        assert_eq!(regs.regs[EBX as usize], 1);
        assert!(!regs.flag(CF));
        assert!(!regs.flag(ZF));
    }

    #[test]
    fn int_goes_to_handler() {
        // mov eax, 1; int 0x21; int 0x21
        let mut emu = emulator(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xCD, 0x21, 0xCD, 0x21]);
        let seen = Rc::new(Cell::new(0u32));
        let seen_in = seen.clone();
        emu.set_syscall_handler(Box::new(move |emu: &mut X86Emulator, vector: u8| {
            assert_eq!(vector, 0x21);
            seen_in.set(seen_in.get() + 1);
            if seen_in.get() == 2 {
                return Err(EmulatorError::Terminate);
            }
            emu.registers_mut().regs[0] += 1;
            Ok(())
        }));
        emu.execute().unwrap();
        assert_eq!(seen.get(), 2);
        assert_eq!(emu.registers().regs[0], 2);
        assert_eq!(emu.cycles(), 2);
    }

    #[test]
    fn unhandled_int_is_fatal() {
        let mut emu = emulator(&[0xCC]);
        assert!(matches!(emu.step(), Err(EmulatorError::UnimplementedCall(_))));
    }

    #[test]
    fn rdtsc_consumes_overrides() {
        // rdtsc; mov ebx, eax; rdtsc
        let mut emu = emulator(&[0x0F, 0x31, 0x89, 0xC3, 0x0F, 0x31]);
        emu.set_time_base(TimeBase::with_overrides([0x1_0000_0005, 7]))
            .unwrap();
        steps(&mut emu, 3);
        let regs = emu.registers();
        assert_eq!(regs.regs[EBX as usize], 5);
        assert_eq!(regs.regs[0], 7);
        assert_eq!(regs.regs[EDX as usize], 0);
    }

    #[test]
    fn call_and_ret_with_pop() {
        // push 9; call f; nop
        // f: mov eax, [esp+4]; ret 4
        let mut emu = emulator(&[
            0x6A, 0x09, // push 9
            0xE8, 0x01, 0x00, 0x00, 0x00, // call +1
            0x90, // nop
            0x8B, 0x44, 0x24, 0x04, // mov eax, [esp+4]
            0xC2, 0x04, 0x00, // ret 4
        ]);
        steps(&mut emu, 4);
        assert_eq!(emu.registers().regs[0], 9);
        assert_eq!(emu.pc(), CODE + 7);
        assert_eq!(emu.stack_pointer(), STACK);
    }

    #[test]
    fn shift_overflow_depends_on_behavior() {
        // mov eax, 0x10000000; shl eax, 4
        let code = [0xB8, 0x00, 0x00, 0x00, 0x10, 0xC1, 0xE0, 0x04];
        let mut emu = emulator(&code);
        steps(&mut emu, 2);
        assert_eq!(emu.registers().regs[0], 0);
        assert!(emu.registers().flag(CF));
        assert!(emu.registers().flag(OF));

        let mut emu = emulator(&code);
        emu.set_behavior(Behavior::WindowsArmEmulator);
        steps(&mut emu, 2);
        assert!(emu.registers().flag(CF));
        assert!(!emu.registers().flag(OF));
    }

    #[test]
    fn logic_clears_aux_carry_only_in_specification_mode() {
        // mov al, 0x0f; add al, 1 (sets AF); and eax, eax
        let code = [0xB0, 0x0F, 0x04, 0x01, 0x21, 0xC0];
        let mut emu = emulator(&code);
        steps(&mut emu, 3);
        assert!(!emu.registers().flag(AF));

        let mut emu = emulator(&code);
        emu.set_behavior_by_name("windows-arm-emu").unwrap();
        steps(&mut emu, 3);
        assert!(emu.registers().flag(AF));
    }

    #[test]
    fn divide_by_zero_is_reported() {
        // xor ecx, ecx; div ecx
        let mut emu = emulator(&[0x31, 0xC9, 0xF7, 0xF1]);
        emu.step().unwrap();
        assert!(matches!(emu.step(), Err(EmulatorError::UnimplementedCall(_))));
        assert_eq!(emu.cycles(), 1);
    }

    #[test]
    fn signed_division_and_wide_multiply() {
        // mov eax, -7; cdq; mov ecx, 2; idiv ecx
        let mut emu = emulator(&[
            0xB8, 0xF9, 0xFF, 0xFF, 0xFF, 0x99, 0xB9, 0x02, 0x00, 0x00, 0x00, 0xF7, 0xF9,
        ]);
        steps(&mut emu, 4);
        assert_eq!(emu.registers().regs[0] as i32, -3);
        assert_eq!(emu.registers().regs[EDX as usize] as i32, -1);

        // mov eax, 0x80000000; mov ecx, 4; mul ecx
        let mut emu = emulator(&[
            0xB8, 0x00, 0x00, 0x00, 0x80, 0xB9, 0x04, 0x00, 0x00, 0x00, 0xF7, 0xE1,
        ]);
        steps(&mut emu, 3);
        assert_eq!(emu.registers().regs[0], 0);
        assert_eq!(emu.registers().regs[EDX as usize], 2);
        assert!(emu.registers().flag(CF) && emu.registers().flag(OF));
    }

    #[test]
    fn rep_movs_and_repne_scas() {
        let mut emu = emulator(&[
            0xBE, 0x00, 0x20, 0x00, 0x00, // mov esi, 0x2000
            0xBF, 0x00, 0x21, 0x00, 0x00, // mov edi, 0x2100
            0xB9, 0x02, 0x00, 0x00, 0x00, // mov ecx, 2
            0xF3, 0xA5, // rep movsd
            0xBF, 0x00, 0x21, 0x00, 0x00, // mov edi, 0x2100
            0x31, 0xC0, // xor eax, eax
            0xB9, 0xFF, 0xFF, 0xFF, 0xFF, // mov ecx, -1
            0xF2, 0xAE, // repne scasb
        ]);
        emu.memory()
            .borrow_mut()
            .write(DATA, b"hello\0\0\0")
            .unwrap();
        steps(&mut emu, 8);
        assert_eq!(emu.memory().borrow().read(0x2100, 8).unwrap(), b"hello\0\0\0");
        // six bytes scanned, including the terminator
        assert_eq!(emu.registers().regs[EDI as usize], 0x2106);
        assert_eq!(!emu.registers().regs[ECX as usize], 6);
    }

    #[test]
    fn loop_counts_down() {
        // mov ecx, 3; xor eax, eax; l: add eax, 2; loop l
        let mut emu = emulator(&[
            0xB9, 0x03, 0x00, 0x00, 0x00, 0x31, 0xC0, 0x83, 0xC0, 0x02, 0xE2, 0xFB,
        ]);
        emu.set_max_cycles(Some(8));
        emu.execute().unwrap();
        assert_eq!(emu.registers().regs[0], 6);
        assert_eq!(emu.registers().regs[ECX as usize], 0);
        assert_eq!(emu.pc(), CODE + 12);
    }

    #[test]
    fn rotates_and_arithmetic_shift() {
        // mov eax, 0x80000001; rol eax, 1; mov ebx, -16; sar ebx, 2
        let mut emu = emulator(&[
            0xB8, 0x01, 0x00, 0x00, 0x80, 0xD1, 0xC0, 0xBB, 0xF0, 0xFF, 0xFF, 0xFF, 0xC1, 0xFB,
            0x02,
        ]);
        steps(&mut emu, 2);
        assert_eq!(emu.registers().regs[0], 3);
        assert!(emu.registers().flag(CF));
        steps(&mut emu, 2);
        assert_eq!(emu.registers().regs[EBX as usize] as i32, -4);
    }

    #[test]
    fn source_trace_follows_memory() {
        let mut emu = emulator(&[
            0xB9, 0x05, 0x00, 0x00, 0x00, // mov ecx, 5
            0x89, 0x0D, 0x00, 0x20, 0x00, 0x00, // mov [0x2000], ecx
            0xA1, 0x00, 0x20, 0x00, 0x00, // mov eax, [0x2000]
            0x01, 0xD8, // add eax, ebx
        ]);
        assert!(matches!(
            emu.source_trace("eax", 2),
            Err(EmulatorError::InvalidState(_))
        ));
        emu.set_trace_data_sources(true).unwrap();
        steps(&mut emu, 4);

        let text = emu.source_trace("eax", 8).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "eax <- @4 00401010 add eax, ebx");
        assert!(lines.contains(&"  ebx <- initial value"), "{text}");
        assert!(lines.contains(&"  eax <- @3 0040100B mov eax, dword [0x00002000]"));
        assert!(lines.contains(&"    [00002000:4] <- @2 00401005 mov dword [0x00002000], ecx"));
        assert!(lines.contains(&"      ecx <- @1 00401000 mov ecx, 0x5"));

        let shallow = emu.source_trace("eax", 1).unwrap();
        assert_eq!(shallow.lines().count(), 3);
    }

    #[test]
    fn address_registers_are_inputs_only_when_requested() {
        // mov ebx, 0x2000; mov eax, [ebx]
        let code = [0xBB, 0x00, 0x20, 0x00, 0x00, 0x8B, 0x03];
        let mut emu = emulator(&code);
        emu.set_trace_data_sources(true).unwrap();
        steps(&mut emu, 2);
        assert!(!emu.source_trace("eax", 4).unwrap().contains("ebx <-"));

        let mut emu = emulator(&code);
        emu.set_trace_data_sources(true).unwrap();
        emu.set_trace_data_source_addrs(true).unwrap();
        steps(&mut emu, 2);
        assert!(emu
            .source_trace("eax", 4)
            .unwrap()
            .contains("ebx <- @1 00401000 mov ebx, 0x2000"));
    }
}
