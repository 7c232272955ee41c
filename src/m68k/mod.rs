//! Motorola 68000 user-mode emulator (plus the common 68020 integer extras
//! classic Mac code relies on: 32-bit branches, `extb`, long multiply/divide,
//! full-format indexing).

use std::{
    collections::BTreeMap,
    io::{self, Write},
};

use serde::{Deserialize, Serialize};

use crate::{
    emulator::{
        Architecture, EmuResult, Emulator, EmulatorError, Hooks, ListingLine, SharedMemory,
        collect_listing, render_listing,
    },
    memory::CodeSlice,
};

pub mod decoder;
mod display;
mod exec;

pub use decoder::{Instruction, InstructionKind, decode};

pub const FLAG_C: u16 = 0x0001;
pub const FLAG_V: u16 = 0x0002;
pub const FLAG_Z: u16 = 0x0004;
pub const FLAG_N: u16 = 0x0008;
pub const FLAG_X: u16 = 0x0010;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct M68kRegisters {
    pub d: [u32; 8],
    pub a: [u32; 8],
    pub pc: u32,
    pub sr: u16,
}

impl M68kRegisters {
    pub fn sp(&self) -> u32 {
        self.a[7]
    }

    pub fn flag(&self, mask: u16) -> bool {
        self.sr & mask != 0
    }

    pub fn set_flag(&mut self, mask: u16, value: bool) {
        if value {
            self.sr |= mask;
        } else {
            self.sr &= !mask;
        }
    }

    pub fn ccr(&self) -> u8 {
        (self.sr & 0x1F) as u8
    }

    pub fn set_ccr(&mut self, ccr: u8) {
        self.sr = (self.sr & 0xFF00) | (ccr as u16 & 0x1F);
    }
}

/// How the Mac toolbox splits an A-line trap word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapWord {
    Toolbox { number: u16, auto_pop: bool },
    Os { number: u16, flags: u8 },
}

impl TrapWord {
    pub fn parse(word: u16) -> Self {
        if word & 0x0800 != 0 {
            TrapWord::Toolbox {
                number: word & 0x0BFF,
                auto_pop: word & 0x0400 != 0,
            }
        } else {
            TrapWord::Os {
                number: word & 0x00FF,
                flags: ((word >> 9) & 3) as u8,
            }
        }
    }
}

pub struct M68kEmulator {
    regs: M68kRegisters,
    memory: SharedMemory,
    cycles: u64,
    max_cycles: Option<u64>,
    hooks: Hooks<Self>,
}

impl M68kEmulator {
    fn read_instruction_at(&self, address: u32) -> EmuResult<Instruction> {
        let mem = self.memory.borrow();
        decode(&*mem, address)
    }
}

impl Emulator for M68kEmulator {
    type Registers = M68kRegisters;
    type Trap = u16;

    const ARCHITECTURE: Architecture = Architecture::M68k;
    const LITTLE_ENDIAN: bool = false;

    fn new(memory: SharedMemory) -> Self {
        Self {
            regs: M68kRegisters::default(),
            memory,
            cycles: 0,
            max_cycles: None,
            hooks: Hooks::default(),
        }
    }

    fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    fn registers(&self) -> &M68kRegisters {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut M68kRegisters {
        &mut self.regs
    }

    fn pc(&self) -> u32 {
        self.regs.pc
    }

    fn set_pc(&mut self, pc: u32) {
        self.regs.pc = pc;
    }

    fn stack_pointer(&self) -> u32 {
        self.regs.a[7]
    }

    fn set_stack_pointer(&mut self, sp: u32) {
        self.regs.a[7] = sp;
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
        let inst = self.read_instruction_at(self.regs.pc)?;
        self.regs.pc = inst.address.wrapping_add(inst.length);
        self.execute_instruction(&inst)?;
        self.cycles += 1;
        Ok(())
    }

    fn set_register_by_name(&mut self, name: &str, value: u32) -> EmuResult<()> {
        let lower = name.to_ascii_lowercase();
        let index = |s: &str| s.parse::<usize>().ok().filter(|&n| n < 8);
        match lower.as_str() {
            "pc" => self.regs.pc = value,
            "sr" => self.regs.sr = value as u16,
            "ccr" => self.regs.set_ccr(value as u8),
            "sp" => self.regs.a[7] = value,
            _ => {
                let (bank, number) = lower.split_at(1.min(lower.len()));
                match (bank, index(number)) {
                    ("d", Some(n)) => self.regs.d[n] = value,
                    ("a", Some(n)) => self.regs.a[n] = value,
                    _ => return Err(EmulatorError::UnknownRegister(name.to_string())),
                }
            }
        }
        Ok(())
    }

    fn print_state_header(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "---D0--- ---D1--- ---D2--- ---D3--- ---D4--- ---D5--- ---D6--- ---D7--- \
             ---A0--- ---A1--- ---A2--- ---A3--- ---A4--- ---A5--- ---A6--- -A7--SP- \
             CBITS ---PC--- = INSTRUCTION"
        )
    }

    fn print_state(&self, out: &mut dyn Write) -> io::Result<()> {
        for value in self.regs.d.iter().chain(self.regs.a.iter()) {
            write!(out, "{value:08X} ")?;
        }
        let flags: String = [(FLAG_X, 'x'), (FLAG_N, 'n'), (FLAG_Z, 'z'), (FLAG_V, 'v'), (FLAG_C, 'c')]
            .iter()
            .map(|&(mask, c)| {
                if self.regs.flag(mask) {
                    c.to_ascii_uppercase()
                } else {
                    c
                }
            })
            .collect();
        let text = match self.read_instruction_at(self.regs.pc) {
            Ok(inst) => inst.to_string(),
            Err(err) => format!("<{err}>"),
        };
        writeln!(out, "{flags} {:08X} = {text}", self.regs.pc)
    }

    fn disassemble_one(bytes: &[u8], address: u32) -> String {
        match decode(&CodeSlice::new(bytes, address), address) {
            Ok(inst) => inst.to_string(),
            Err(err) => invalid_text(bytes, &err),
        }
    }

    fn disassemble(bytes: &[u8], address: u32, labels: &BTreeMap<u32, String>) -> String {
        let code = CodeSlice::new(bytes, address);
        let lines = collect_listing(bytes, address, |pc, rest| match decode(&code, pc) {
            Ok(inst) => ListingLine {
                address: pc,
                length: inst.length,
                text: inst.to_string(),
                branch_target: inst.branch_target(),
            },
            Err(err) => ListingLine {
                address: pc,
                length: rest.len().min(2) as u32,
                text: invalid_text(rest, &err),
                branch_target: None,
            },
        });
        render_listing(bytes, address, &lines, labels)
    }
}

fn invalid_text(bytes: &[u8], err: &EmulatorError) -> String {
    match bytes {
        [hi, lo, ..] => format!(".dc.w 0x{:04x} ; {err}", u16::from_be_bytes([*hi, *lo])),
        [b] => format!(".dc.b 0x{b:02x}"),
        [] => String::from(".end"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emulator::shared, memory::AddressSpace};

    #[test]
    fn trap_word_split() {
        assert_eq!(
            TrapWord::parse(0xA9F0),
            TrapWord::Toolbox {
                number: 0x9F0,
                auto_pop: false
            }
        );
        assert_eq!(
            TrapWord::parse(0xAD22),
            TrapWord::Toolbox {
                number: 0x922 & 0x0BFF,
                auto_pop: true
            }
        );
        assert_eq!(TrapWord::parse(0xA322), TrapWord::Os { number: 0x22, flags: 1 });
    }

    #[test]
    fn register_names() {
        let mut emu = M68kEmulator::new(shared(AddressSpace::new()));
        emu.set_register_by_name("D3", 7).unwrap();
        emu.set_register_by_name("a6", 0x100).unwrap();
        emu.set_register_by_name("sp", 0x200).unwrap();
        assert_eq!(emu.registers().d[3], 7);
        assert_eq!(emu.registers().a[6], 0x100);
        assert_eq!(emu.registers().a[7], 0x200);
        assert!(matches!(
            emu.set_register_by_name("d8", 0),
            Err(EmulatorError::UnknownRegister(_))
        ));
    }

    #[test]
    fn listing_marks_branch_targets() {
        // loop: subq.l #1,d0; bne loop; rts
        let code = [0x53, 0x80, 0x66, 0xFC, 0x4E, 0x75];
        let text = M68kEmulator::disassemble(&code, 0x4000, &BTreeMap::new());
        assert!(text.starts_with("label_00004000:\n"), "{text}");
        assert!(text.contains("bne 0x00004000"));
        assert!(text.contains("rts"));
    }

    #[test]
    fn invalid_words_disassemble_as_data() {
        let text = M68kEmulator::disassemble_one(&[0xF2, 0x00], 0);
        assert!(text.starts_with(".dc.w 0xf200"), "{text}");
    }
}
