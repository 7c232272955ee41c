use super::{
    CR_EQ, CR_GT, CR_LT, CR_SO, PpcEmulator, XER_CA, XER_OV, XER_SO,
    decoder::{
        ArithOp, ArithUnaryOp, BranchRegister, CrOp, Instruction, LogicalImmOp, LogicalOp, Offset,
        ShiftOp, Spr, TrapOperand, UnaryOp, Width,
    },
};
use crate::emulator::{EmuResult, EmulatorError, call_syscall_handler};

/// `x + y + carry_in` with the carry out and the signed-overflow bit.
fn add3(x: u32, y: u32, carry_in: bool) -> (u32, bool, bool) {
    let wide = x as u64 + y as u64 + u64::from(carry_in);
    let result = wide as u32;
    let overflow = ((x ^ result) & (y ^ result)) >> 31 != 0;
    (result, wide > u32::MAX as u64, overflow)
}

/// MB..ME mask with bit 0 as the most significant; wraps when MB > ME.
fn rotate_mask(mb: u8, me: u8) -> u32 {
    let from_mb = u32::MAX >> mb;
    let to_me = u32::MAX << (31 - me as u32);
    if mb <= me {
        from_mb & to_me
    } else {
        from_mb | to_me
    }
}

fn compare_bits(lt: bool, gt: bool) -> u32 {
    if lt {
        CR_LT
    } else if gt {
        CR_GT
    } else {
        CR_EQ
    }
}

impl PpcEmulator {
    pub(super) fn execute_instruction(&mut self, inst: &Instruction) -> EmuResult<()> {
        match *inst {
            Instruction::AddImmediate {
                rd,
                ra,
                imm,
                shifted,
            } => {
                let imm = if shifted {
                    (imm as u32) << 16
                } else {
                    imm as i32 as u32
                };
                self.regs.r[rd as usize] = self.reg_or_zero(ra).wrapping_add(imm);
            }
            Instruction::AddImmediateCarrying {
                rd,
                ra,
                imm,
                record,
            } => {
                let (result, carry, _) = add3(self.gpr(ra), imm as i32 as u32, false);
                self.set_carry(carry);
                self.write_result(rd, result, record);
            }
            Instruction::SubtractFromImmediate { rd, ra, imm } => {
                let (result, carry, _) = add3(!self.gpr(ra), imm as i32 as u32, true);
                self.set_carry(carry);
                self.regs.r[rd as usize] = result;
            }
            Instruction::MultiplyImmediate { rd, ra, imm } => {
                let product = (self.gpr(ra) as i32).wrapping_mul(imm as i32);
                self.regs.r[rd as usize] = product as u32;
            }
            Instruction::CompareImmediate { crf, ra, imm } => {
                let a = self.gpr(ra) as i32;
                let b = imm as i32;
                self.set_compare(crf, a < b, a > b);
            }
            Instruction::CompareLogicalImmediate { crf, ra, imm } => {
                let a = self.gpr(ra);
                let b = imm as u32;
                self.set_compare(crf, a < b, a > b);
            }
            Instruction::Compare {
                crf,
                ra,
                rb,
                logical,
            } => {
                let (a, b) = (self.gpr(ra), self.gpr(rb));
                if logical {
                    self.set_compare(crf, a < b, a > b);
                } else {
                    self.set_compare(crf, (a as i32) < (b as i32), (a as i32) > (b as i32));
                }
            }
            Instruction::LogicalImmediate { op, ra, rs, imm } => {
                let s = self.gpr(rs);
                let imm = imm as u32;
                let (result, record) = match op {
                    LogicalImmOp::Ori => (s | imm, false),
                    LogicalImmOp::Oris => (s | (imm << 16), false),
                    LogicalImmOp::Xori => (s ^ imm, false),
                    LogicalImmOp::Xoris => (s ^ (imm << 16), false),
                    LogicalImmOp::Andi => (s & imm, true),
                    LogicalImmOp::Andis => (s & (imm << 16), true),
                };
                self.write_result(ra, result, record);
            }
            Instruction::Arith {
                op,
                rd,
                ra,
                rb,
                oe,
                record,
            } => {
                let (result, overflow) = self.arith(op, self.gpr(ra), self.gpr(rb));
                if oe {
                    self.set_overflow(overflow);
                }
                self.write_result(rd, result, record);
            }
            Instruction::ArithUnary {
                op,
                rd,
                ra,
                oe,
                record,
            } => {
                let a = self.gpr(ra);
                let ca = self.regs.carry();
                let (result, carry, overflow) = match op {
                    ArithUnaryOp::Neg => add3(!a, 0, true),
                    ArithUnaryOp::Addze => add3(a, 0, ca),
                    ArithUnaryOp::Addme => add3(a, u32::MAX, ca),
                    ArithUnaryOp::Subfze => add3(!a, 0, ca),
                    ArithUnaryOp::Subfme => add3(!a, u32::MAX, ca),
                };
                if op != ArithUnaryOp::Neg {
                    self.set_carry(carry);
                }
                if oe {
                    self.set_overflow(overflow);
                }
                self.write_result(rd, result, record);
            }
            Instruction::Logical {
                op,
                ra,
                rs,
                rb,
                record,
            } => {
                let (s, b) = (self.gpr(rs), self.gpr(rb));
                let result = match op {
                    LogicalOp::And => s & b,
                    LogicalOp::Andc => s & !b,
                    LogicalOp::Or => s | b,
                    LogicalOp::Orc => s | !b,
                    LogicalOp::Xor => s ^ b,
                    LogicalOp::Nand => !(s & b),
                    LogicalOp::Nor => !(s | b),
                    LogicalOp::Eqv => !(s ^ b),
                };
                self.write_result(ra, result, record);
            }
            Instruction::Shift {
                op,
                ra,
                rs,
                rb,
                record,
            } => {
                let s = self.gpr(rs);
                let n = self.gpr(rb) & 0x3F;
                let result = match op {
                    ShiftOp::Slw => s.checked_shl(n).unwrap_or(0),
                    ShiftOp::Srw => s.checked_shr(n).unwrap_or(0),
                    ShiftOp::Sraw => self.shift_right_algebraic(s, n),
                };
                self.write_result(ra, result, record);
            }
            Instruction::ShiftRightAlgebraicImmediate { ra, rs, sh, record } => {
                let result = self.shift_right_algebraic(self.gpr(rs), sh as u32);
                self.write_result(ra, result, record);
            }
            Instruction::Unary { op, ra, rs, record } => {
                let s = self.gpr(rs);
                let result = match op {
                    UnaryOp::Extsb => s as u8 as i8 as i32 as u32,
                    UnaryOp::Extsh => s as u16 as i16 as i32 as u32,
                    UnaryOp::Cntlzw => s.leading_zeros(),
                };
                self.write_result(ra, result, record);
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
                let mask = rotate_mask(mb, me);
                let rotated = self.gpr(rs).rotate_left(sh as u32);
                let result = if insert {
                    (rotated & mask) | (self.gpr(ra) & !mask)
                } else {
                    rotated & mask
                };
                self.write_result(ra, result, record);
            }
            Instruction::RotateMaskRegister {
                ra,
                rs,
                rb,
                mb,
                me,
                record,
            } => {
                let rotated = self.gpr(rs).rotate_left(self.gpr(rb) & 0x1F);
                self.write_result(ra, rotated & rotate_mask(mb, me), record);
            }
            Instruction::Branch { target, link } => {
                if link {
                    self.regs.lr = self.regs.pc;
                }
                self.regs.pc = target;
            }
            Instruction::BranchConditional {
                bo,
                bi,
                target,
                link,
            } => {
                let taken = self.branch_condition(bo, bi, true);
                if link {
                    self.regs.lr = self.regs.pc;
                }
                if taken {
                    self.regs.pc = target;
                }
            }
            Instruction::BranchConditionalToRegister { bo, bi, to, link } => {
                let target = match to {
                    BranchRegister::Lr => self.regs.lr,
                    BranchRegister::Ctr => self.regs.ctr,
                } & !3;
                let taken = self.branch_condition(bo, bi, to == BranchRegister::Lr);
                if link {
                    self.regs.lr = self.regs.pc;
                }
                if taken {
                    self.regs.pc = target;
                }
            }
            Instruction::ConditionRegisterLogical { op, bt, ba, bb } => {
                let (a, b) = (self.regs.cr_bit(ba), self.regs.cr_bit(bb));
                let value = match op {
                    CrOp::And => a & b,
                    CrOp::Andc => a & !b,
                    CrOp::Eqv => a == b,
                    CrOp::Nand => !(a & b),
                    CrOp::Nor => !(a | b),
                    CrOp::Or => a | b,
                    CrOp::Orc => a | !b,
                    CrOp::Xor => a ^ b,
                };
                self.regs.set_cr_bit(bt, value);
            }
            Instruction::MoveConditionRegisterField { crfd, crfs } => {
                let value = self.regs.cr_field(crfs);
                self.regs.set_cr_field(crfd, value);
            }
            Instruction::Load {
                width,
                algebraic,
                rd,
                ra,
                offset,
                update,
            } => {
                let addr = self.effective_address(ra, offset);
                let value = {
                    let mem = self.memory.borrow();
                    match (width, algebraic) {
                        (Width::Byte, _) => mem.read_u8(addr)? as u32,
                        (Width::Half, false) => mem.read_u16b(addr)? as u32,
                        (Width::Half, true) => mem.read_u16b(addr)? as i16 as i32 as u32,
                        (Width::Word, _) => mem.read_u32b(addr)?,
                    }
                };
                self.regs.r[rd as usize] = value;
                if update {
                    self.regs.r[ra as usize] = addr;
                }
            }
            Instruction::Store {
                width,
                rs,
                ra,
                offset,
                update,
            } => {
                let addr = self.effective_address(ra, offset);
                let value = self.gpr(rs);
                {
                    let mut mem = self.memory.borrow_mut();
                    match width {
                        Width::Byte => mem.write_u8(addr, value as u8)?,
                        Width::Half => mem.write_u16b(addr, value as u16)?,
                        Width::Word => mem.write_u32b(addr, value)?,
                    }
                }
                if update {
                    self.regs.r[ra as usize] = addr;
                }
            }
            Instruction::LoadMultiple { rd, ra, disp } => {
                let mut addr = self.effective_address(ra, Offset::Displacement(disp));
                for reg in rd as usize..32 {
                    self.regs.r[reg] = self.memory.borrow().read_u32b(addr)?;
                    addr = addr.wrapping_add(4);
                }
            }
            Instruction::StoreMultiple { rs, ra, disp } => {
                let mut addr = self.effective_address(ra, Offset::Displacement(disp));
                for reg in rs as usize..32 {
                    self.memory.borrow_mut().write_u32b(addr, self.regs.r[reg])?;
                    addr = addr.wrapping_add(4);
                }
            }
            Instruction::LoadByteReversed { width, rd, ra, rb } => {
                let addr = self.effective_address(ra, Offset::Indexed(rb));
                let mem = self.memory.borrow();
                let value = match width {
                    Width::Half => mem.read_u16l(addr)? as u32,
                    _ => mem.read_u32l(addr)?,
                };
                drop(mem);
                self.regs.r[rd as usize] = value;
            }
            Instruction::StoreByteReversed { width, rs, ra, rb } => {
                let addr = self.effective_address(ra, Offset::Indexed(rb));
                let value = self.gpr(rs);
                let mut mem = self.memory.borrow_mut();
                match width {
                    Width::Half => mem.write_u16l(addr, value as u16)?,
                    _ => mem.write_u32l(addr, value)?,
                }
            }
            Instruction::MoveFromSpr { rd, spr } => {
                self.regs.r[rd as usize] = match spr {
                    Spr::Xer => self.regs.xer,
                    Spr::Lr => self.regs.lr,
                    Spr::Ctr => self.regs.ctr,
                    Spr::Srr0 => self.regs.srr0,
                    Spr::Srr1 => self.regs.srr1,
                };
            }
            Instruction::MoveToSpr { rs, spr } => {
                let value = self.gpr(rs);
                match spr {
                    Spr::Xer => self.regs.xer = value,
                    Spr::Lr => self.regs.lr = value,
                    Spr::Ctr => self.regs.ctr = value,
                    Spr::Srr0 => self.regs.srr0 = value,
                    Spr::Srr1 => self.regs.srr1 = value,
                }
            }
            Instruction::MoveFromTimeBase { rd, upper } => {
                let tb = self.time_base.read(self.cycles);
                self.regs.r[rd as usize] = if upper { (tb >> 32) as u32 } else { tb as u32 };
            }
            Instruction::MoveFromCr { rd } => self.regs.r[rd as usize] = self.regs.cr,
            Instruction::MoveToCrFields { mask, rs } => {
                let value = self.gpr(rs);
                for field in 0..8u8 {
                    if mask & (0x80 >> field) != 0 {
                        let shift = 28 - 4 * field as u32;
                        self.regs.set_cr_field(field, value >> shift);
                    }
                }
            }
            Instruction::TrapWord { to, ra, operand } => {
                let a = self.gpr(ra);
                let b = match operand {
                    TrapOperand::Register(rb) => self.gpr(rb),
                    TrapOperand::Immediate(imm) => imm as i32 as u32,
                };
                let trapped = (to & 0x10 != 0 && (a as i32) < (b as i32))
                    || (to & 0x08 != 0 && (a as i32) > (b as i32))
                    || (to & 0x04 != 0 && a == b)
                    || (to & 0x02 != 0 && a < b)
                    || (to & 0x01 != 0 && a > b);
                if trapped {
                    return Err(EmulatorError::UnimplementedCall(format!(
                        "trap taken at {:08X}",
                        self.regs.pc.wrapping_sub(4)
                    )));
                }
            }
            Instruction::SystemCall => call_syscall_handler(self, ())?,
            Instruction::ReturnFromInterrupt => {
                self.regs.pc = self.regs.srr0 & !3;
                self.regs.msr = self.regs.srr1;
            }
            Instruction::Barrier(_) | Instruction::CacheHint { .. } => {}
            Instruction::ZeroCacheBlock { ra, rb } => {
                let addr = self.effective_address(ra, Offset::Indexed(rb)) & !0x1F;
                self.memory.borrow_mut().memset(addr, 0, 32)?;
            }
        }
        Ok(())
    }

    fn gpr(&self, reg: u8) -> u32 {
        self.regs.r[reg as usize]
    }

    /// rA as an address base: r0 reads as zero.
    fn reg_or_zero(&self, reg: u8) -> u32 {
        if reg == 0 { 0 } else { self.gpr(reg) }
    }

    pub(super) fn effective_address(&self, ra: u8, offset: Offset) -> u32 {
        let base = self.reg_or_zero(ra);
        match offset {
            Offset::Displacement(disp) => base.wrapping_add(disp as i32 as u32),
            Offset::Indexed(rb) => base.wrapping_add(self.gpr(rb)),
        }
    }

    fn arith(&mut self, op: ArithOp, a: u32, b: u32) -> (u32, bool) {
        let ca = self.regs.carry();
        match op {
            ArithOp::Add => {
                let (result, _, overflow) = add3(a, b, false);
                (result, overflow)
            }
            ArithOp::Addc | ArithOp::Adde => {
                let (result, carry, overflow) = add3(a, b, op == ArithOp::Adde && ca);
                self.set_carry(carry);
                (result, overflow)
            }
            ArithOp::Subf => {
                let (result, _, overflow) = add3(!a, b, true);
                (result, overflow)
            }
            ArithOp::Subfc | ArithOp::Subfe => {
                let carry_in = op == ArithOp::Subfc || ca;
                let (result, carry, overflow) = add3(!a, b, carry_in);
                self.set_carry(carry);
                (result, overflow)
            }
            ArithOp::Mullw => {
                let product = a as i32 as i64 * b as i32 as i64;
                (product as u32, product != product as i32 as i64)
            }
            ArithOp::Mulhw => (((a as i32 as i64 * b as i32 as i64) >> 32) as u32, false),
            ArithOp::Mulhwu => (((a as u64 * b as u64) >> 32) as u32, false),
            ArithOp::Divw => {
                let (a, b) = (a as i32, b as i32);
                match a.checked_div(b) {
                    Some(q) => (q as u32, false),
                    None => (0, true),
                }
            }
            ArithOp::Divwu => match a.checked_div(b) {
                Some(q) => (q, false),
                None => (0, true),
            },
        }
    }

    fn shift_right_algebraic(&mut self, s: u32, n: u32) -> u32 {
        let negative = (s as i32) < 0;
        if n > 31 {
            self.set_carry(negative);
            return if negative { u32::MAX } else { 0 };
        }
        let lost = s & ((1u32 << n) - 1);
        self.set_carry(negative && lost != 0);
        ((s as i32) >> n) as u32
    }

    /// Evaluate BO/BI, decrementing CTR first when BO asks for it.
    fn branch_condition(&mut self, bo: u8, bi: u8, may_decrement: bool) -> bool {
        let ctr_ok = if bo & 0x04 == 0 && may_decrement {
            self.regs.ctr = self.regs.ctr.wrapping_sub(1);
            (self.regs.ctr != 0) != (bo & 0x02 != 0)
        } else {
            true
        };
        let cond_ok = bo & 0x10 != 0 || self.regs.cr_bit(bi) == (bo & 0x08 != 0);
        ctr_ok && cond_ok
    }

    fn set_carry(&mut self, carry: bool) {
        if carry {
            self.regs.xer |= XER_CA;
        } else {
            self.regs.xer &= !XER_CA;
        }
    }

    /// OV follows the last overflow-enabled op; SO sticks until cleared.
    fn set_overflow(&mut self, overflow: bool) {
        if overflow {
            self.regs.xer |= XER_OV | XER_SO;
        } else {
            self.regs.xer &= !XER_OV;
        }
    }

    fn set_compare(&mut self, crf: u8, lt: bool, gt: bool) {
        let so = if self.regs.xer & XER_SO != 0 { CR_SO } else { 0 };
        self.regs.set_cr_field(crf, compare_bits(lt, gt) | so);
    }

    fn write_result(&mut self, rd: u8, value: u32, record: bool) {
        self.regs.r[rd as usize] = value;
        if record {
            let v = value as i32;
            self.set_compare(0, v < 0, v > 0);
        }
    }
}
