//! 32-bit PowerPC user-mode integer emulator.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    io::{self, Write},
    rc::Rc,
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    emulator::{
        Architecture, EmuResult, Emulator, EmulatorError, Hooks, ListingLine, SharedMemory,
        TimeBase, collect_listing, render_listing,
    },
    interrupts::InterruptSource,
};

pub mod decoder;
mod display;
mod exec;

pub use decoder::{Instruction, decode};

pub const XER_SO: u32 = 0x8000_0000;
pub const XER_OV: u32 = 0x4000_0000;
pub const XER_CA: u32 = 0x2000_0000;

/// External interrupt enable.
pub const MSR_EE: u32 = 0x8000;

pub const CR_LT: u32 = 8;
pub const CR_GT: u32 = 4;
pub const CR_EQ: u32 = 2;
pub const CR_SO: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PpcRegisters {
    pub r: [u32; 32],
    pub cr: u32,
    pub xer: u32,
    pub lr: u32,
    pub ctr: u32,
    pub pc: u32,
    pub msr: u32,
    pub srr0: u32,
    pub srr1: u32,
}

impl PpcRegisters {
    /// Four-bit field `n` of CR (field 0 is the most significant).
    pub fn cr_field(&self, n: u8) -> u32 {
        (self.cr >> (28 - 4 * n as u32)) & 0xF
    }

    pub fn set_cr_field(&mut self, n: u8, value: u32) {
        let shift = 28 - 4 * n as u32;
        self.cr = (self.cr & !(0xF << shift)) | ((value & 0xF) << shift);
    }

    /// CR bit `bit`, numbered from the most significant bit.
    pub fn cr_bit(&self, bit: u8) -> bool {
        (self.cr >> (31 - bit as u32)) & 1 != 0
    }

    pub fn set_cr_bit(&mut self, bit: u8, value: bool) {
        let mask = 1 << (31 - bit as u32);
        if value {
            self.cr |= mask;
        } else {
            self.cr &= !mask;
        }
    }

    pub fn carry(&self) -> bool {
        self.xer & XER_CA != 0
    }
}

pub struct PpcEmulator {
    regs: PpcRegisters,
    memory: SharedMemory,
    cycles: u64,
    max_cycles: Option<u64>,
    hooks: Hooks<Self>,
    time_base: TimeBase,
    interrupts: Option<Rc<RefCell<dyn InterruptSource>>>,
}

impl PpcEmulator {
    /// Poll `source` at every instruction boundary. The caller keeps its own
    /// handle so it can raise more requests while the emulator runs.
    pub fn set_interrupt_source<S: InterruptSource + 'static>(&mut self, source: Rc<RefCell<S>>) {
        self.interrupts = Some(source);
    }

    pub fn clear_interrupt_source(&mut self) {
        self.interrupts = None;
    }

    /// Enter the handler of the best pending request, if external interrupts
    /// are enabled.
    fn take_pending_interrupt(&mut self) {
        if self.regs.msr & MSR_EE == 0 {
            return;
        }
        let Some(source) = &self.interrupts else {
            return;
        };
        let Some(request) = source.borrow().highest_pending(self.cycles) else {
            return;
        };
        if request.priority == 0 {
            return;
        }
        source.borrow_mut().acknowledge(request);
        debug!(
            "taking interrupt vector {:X} at {:08X}",
            request.vector, self.regs.pc
        );
        self.regs.srr0 = self.regs.pc;
        self.regs.srr1 = self.regs.msr;
        self.regs.msr &= !MSR_EE;
        self.regs.pc = request.vector.wrapping_mul(0x100);
    }

    fn fetch(&self, address: u32) -> EmuResult<Instruction> {
        let word = self.memory.borrow().read_u32b(address)?;
        decode(word, address)
    }
}

impl Emulator for PpcEmulator {
    type Registers = PpcRegisters;
    type Trap = ();

    const ARCHITECTURE: Architecture = Architecture::Ppc32;
    const LITTLE_ENDIAN: bool = false;

    fn new(memory: SharedMemory) -> Self {
        Self {
            regs: PpcRegisters::default(),
            memory,
            cycles: 0,
            max_cycles: None,
            hooks: Hooks::default(),
            time_base: TimeBase::default(),
            interrupts: None,
        }
    }

    fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    fn registers(&self) -> &PpcRegisters {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut PpcRegisters {
        &mut self.regs
    }

    fn pc(&self) -> u32 {
        self.regs.pc
    }

    fn set_pc(&mut self, pc: u32) {
        self.regs.pc = pc;
    }

    fn stack_pointer(&self) -> u32 {
        self.regs.r[1]
    }

    fn set_stack_pointer(&mut self, sp: u32) {
        self.regs.r[1] = sp;
    }

    fn cycles(&self) -> u64 {
        self.cycles
    }

    fn max_cycles(&self) -> Option<u64> {
        self.max_cycles
    }

    fn set_max_cycles(&mut self, max: Option<u64>) {
        self.max_cycles = max;
    }

    fn hooks(&mut self) -> &mut Hooks<Self> {
        &mut self.hooks
    }

    fn step(&mut self) -> EmuResult<()> {
        self.take_pending_interrupt();
        let inst = self.fetch(self.regs.pc)?;
        self.regs.pc = self.regs.pc.wrapping_add(4);
        self.execute_instruction(&inst)?;
        self.cycles += 1;
        Ok(())
    }

    fn set_time_base(&mut self, time_base: TimeBase) -> EmuResult<()> {
        self.time_base = time_base;
        Ok(())
    }

    fn set_register_by_name(&mut self, name: &str, value: u32) -> EmuResult<()> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "pc" => self.regs.pc = value,
            "lr" => self.regs.lr = value,
            "ctr" => self.regs.ctr = value,
            "cr" => self.regs.cr = value,
            "xer" => self.regs.xer = value,
            "msr" => self.regs.msr = value,
            "srr0" => self.regs.srr0 = value,
            "srr1" => self.regs.srr1 = value,
            "sp" => self.regs.r[1] = value,
            _ => match lower
                .strip_prefix('r')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|&n| n < 32)
            {
                Some(n) => self.regs.r[n] = value,
                None => return Err(EmulatorError::UnknownRegister(name.to_string())),
            },
        }
        Ok(())
    }

    fn print_state_header(&self, out: &mut dyn Write) -> io::Result<()> {
        for n in 0..32 {
            write!(out, "{:-^8} ", format!("R{n}"))?;
        }
        writeln!(out, "---CR--- ---XER--- ---LR--- ---CTR-- ---PC--- = INSTRUCTION")
    }

    fn print_state(&self, out: &mut dyn Write) -> io::Result<()> {
        for value in &self.regs.r {
            write!(out, "{value:08X} ")?;
        }
        write!(
            out,
            "{:08X} {:08X}  {:08X} {:08X} {:08X} = ",
            self.regs.cr, self.regs.xer, self.regs.lr, self.regs.ctr, self.regs.pc
        )?;
        match self.fetch(self.regs.pc) {
            Ok(inst) => writeln!(out, "{inst}"),
            Err(err) => writeln!(out, "<{err}>"),
        }
    }

    fn disassemble_one(bytes: &[u8], address: u32) -> String {
        disassemble_line(bytes, address).text
    }

    fn disassemble(bytes: &[u8], address: u32, labels: &BTreeMap<u32, String>) -> String {
        let lines = collect_listing(bytes, address, |pc, rest| disassemble_line(rest, pc));
        render_listing(bytes, address, &lines, labels)
    }
}

fn disassemble_line(bytes: &[u8], address: u32) -> ListingLine {
    let Some(word) = bytes.first_chunk::<4>().map(|b| u32::from_be_bytes(*b)) else {
        let text = bytes
            .iter()
            .map(|b| format!("0x{b:02x}"))
            .collect::<Vec<_>>()
            .join(", ");
        return ListingLine {
            address,
            length: bytes.len() as u32,
            text: format!(".byte {text}"),
            branch_target: None,
        };
    };
    match decode(word, address) {
        Ok(inst) => ListingLine {
            address,
            length: 4,
            text: inst.to_string(),
            branch_target: inst.branch_target(),
        },
        Err(err) => ListingLine {
            address,
            length: 4,
            text: format!(".long 0x{word:08x} ; {err}"),
            branch_target: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emulator::shared, memory::AddressSpace};

    #[test]
    fn cr_fields_and_bits() {
        let mut regs = PpcRegisters::default();
        regs.set_cr_field(0, CR_EQ);
        regs.set_cr_field(7, CR_LT | CR_SO);
        assert_eq!(regs.cr, 0x2000_0009);
        assert!(regs.cr_bit(2));
        assert!(regs.cr_bit(28));
        regs.set_cr_bit(2, false);
        assert_eq!(regs.cr_field(0), 0);
    }

    #[test]
    fn register_names() {
        let mut emu = PpcEmulator::new(shared(AddressSpace::new()));
        emu.set_register_by_name("r31", 5).unwrap();
        emu.set_register_by_name("LR", 0x100).unwrap();
        emu.set_register_by_name("sp", 0x8000).unwrap();
        assert_eq!(emu.registers().r[31], 5);
        assert_eq!(emu.registers().lr, 0x100);
        assert_eq!(emu.stack_pointer(), 0x8000);
        assert!(emu.set_register_by_name("r32", 0).is_err());
    }

    #[test]
    fn listing_labels_loop_heads() {
        // loop: addi r3,r3,2; bdnz loop; blr
        let code = [
            0x38, 0x63, 0x00, 0x02, 0x42, 0x00, 0xFF, 0xFC, 0x4E, 0x80, 0x00, 0x20,
        ];
        let text = PpcEmulator::disassemble(&code, 0x3000, &BTreeMap::new());
        assert!(text.starts_with("label_00003000:\n"), "{text}");
        assert!(text.contains("bdnz 0x00003000"));
        assert!(text.contains("blr"));
    }

    #[test]
    fn short_input_is_data() {
        assert_eq!(PpcEmulator::disassemble_one(&[0x38, 0x60], 0), ".byte 0x38, 0x60");
    }
}
