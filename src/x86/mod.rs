//! 32-bit x86 user-mode integer emulator with optional data-source tracing.

use std::{
    collections::BTreeMap,
    io::{self, Write},
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    emulator::{
        Architecture, Behavior, EmuResult, Emulator, EmulatorError, Hooks, ListingLine,
        SharedMemory, TimeBase, collect_listing, render_listing,
    },
    memory::CodeSlice,
};

pub mod decoder;
mod display;
mod exec;
pub mod trace;

pub use decoder::{Instruction, Opcode, decode};
pub use display::register_name;

use decoder::{ESP, OperandSize};
use trace::{DataSourceTracer, Location};

pub const CF: u32 = 0x0001;
pub const PF: u32 = 0x0004;
pub const AF: u32 = 0x0010;
pub const ZF: u32 = 0x0040;
pub const SF: u32 = 0x0080;
pub const DF: u32 = 0x0400;
pub const OF: u32 = 0x0800;

/// Flags user code may change through `popfd`.
const USER_FLAGS: u32 = CF | PF | AF | ZF | SF | DF | OF;
/// Bit 1 always reads as set; IF is on in user mode.
const FIXED_FLAGS: u32 = 0x0000_0202;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X86Registers {
    /// eax, ecx, edx, ebx, esp, ebp, esi, edi
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
}

impl Default for X86Registers {
    fn default() -> Self {
        Self {
            regs: [0; 8],
            eip: 0,
            eflags: FIXED_FLAGS,
        }
    }
}

impl X86Registers {
    pub fn flag(&self, mask: u32) -> bool {
        self.eflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u32, value: bool) {
        if value {
            self.eflags |= mask;
        } else {
            self.eflags &= !mask;
        }
    }

    pub fn read(&self, reg: u8, size: OperandSize) -> u32 {
        let reg = reg as usize & 7;
        match size {
            OperandSize::Dword => self.regs[reg],
            OperandSize::Word => self.regs[reg] & 0xFFFF,
            OperandSize::Byte if reg < 4 => self.regs[reg] & 0xFF,
            OperandSize::Byte => (self.regs[reg - 4] >> 8) & 0xFF,
        }
    }

    pub fn write(&mut self, reg: u8, size: OperandSize, value: u32) {
        let reg = reg as usize & 7;
        match size {
            OperandSize::Dword => self.regs[reg] = value,
            OperandSize::Word => self.regs[reg] = (self.regs[reg] & !0xFFFF) | (value & 0xFFFF),
            OperandSize::Byte if reg < 4 => {
                self.regs[reg] = (self.regs[reg] & !0xFF) | (value & 0xFF)
            }
            OperandSize::Byte => {
                self.regs[reg - 4] = (self.regs[reg - 4] & !0xFF00) | ((value & 0xFF) << 8)
            }
        }
    }
}

/// Which 32-bit register a sized register number lives in.
pub(crate) fn full_register(reg: u8, size: OperandSize) -> u8 {
    if size == OperandSize::Byte { reg & 3 } else { reg & 7 }
}

pub struct X86Emulator {
    regs: X86Registers,
    memory: SharedMemory,
    cycles: u64,
    max_cycles: Option<u64>,
    hooks: Hooks<Self>,
    behavior: Behavior,
    time_base: TimeBase,
    tracer: Option<DataSourceTracer>,
    trace_addresses: bool,
}

impl X86Emulator {
    pub fn with_behavior(memory: SharedMemory, behavior: Behavior) -> Self {
        let mut emu = Self::new(memory);
        emu.behavior = behavior;
        emu
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    pub fn set_behavior(&mut self, behavior: Behavior) {
        self.behavior = behavior;
    }

    fn fetch(&self, address: u32) -> EmuResult<Instruction> {
        decode(&*self.memory.borrow(), address)
    }

    fn trace_read(&mut self, location: Location) {
        if let Some(tracer) = &mut self.tracer {
            tracer.record_read(location);
        }
    }

    /// Registers used to form an address only count as inputs when address
    /// tracing is on.
    fn trace_address_read(&mut self, location: Location) {
        if self.trace_addresses {
            self.trace_read(location);
        }
    }

    fn trace_write(&mut self, location: Location) {
        if let Some(tracer) = &mut self.tracer {
            tracer.record_write(location);
        }
    }
}

impl Emulator for X86Emulator {
    type Registers = X86Registers;
    /// The `int` vector.
    type Trap = u8;

    const ARCHITECTURE: Architecture = Architecture::X86;
    const LITTLE_ENDIAN: bool = true;

    fn new(memory: SharedMemory) -> Self {
        Self {
            regs: X86Registers::default(),
            memory,
            cycles: 0,
            max_cycles: None,
            hooks: Hooks::default(),
            behavior: Behavior::default(),
            time_base: TimeBase::default(),
            tracer: None,
            trace_addresses: false,
        }
    }

    fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    fn registers(&self) -> &X86Registers {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut X86Registers {
        &mut self.regs
    }

    fn pc(&self) -> u32 {
        self.regs.eip
    }

    fn set_pc(&mut self, pc: u32) {
        self.regs.eip = pc;
    }

    fn stack_pointer(&self) -> u32 {
        self.regs.regs[ESP as usize]
    }

    fn set_stack_pointer(&mut self, sp: u32) {
        self.regs.regs[ESP as usize] = sp;
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
        let inst = self.fetch(self.regs.eip)?;
        self.regs.eip = inst.address.wrapping_add(inst.length);
        if let Err(err) = self.execute_instruction(&inst) {
            if let Some(tracer) = &mut self.tracer {
                tracer.discard();
            }
            return Err(err);
        }
        self.cycles += 1;
        if let Some(tracer) = &mut self.tracer {
            tracer.commit(self.cycles, inst.address, || inst.to_string());
        }
        Ok(())
    }

    fn set_register_by_name(&mut self, name: &str, value: u32) -> EmuResult<()> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "eip" | "pc" => self.regs.eip = value,
            "eflags" | "flags" => self.regs.eflags = value | 2,
            "sp" => self.regs.regs[ESP as usize] = value,
            _ => match (0..8).find(|&r| register_name(r, OperandSize::Dword) == lower) {
                Some(reg) => self.regs.regs[reg as usize] = value,
                None => return Err(EmulatorError::UnknownRegister(name.to_string())),
            },
        }
        Ok(())
    }

    fn set_behavior_by_name(&mut self, name: &str) -> EmuResult<()> {
        self.behavior = name.parse()?;
        Ok(())
    }

    fn set_time_base(&mut self, time_base: TimeBase) -> EmuResult<()> {
        self.time_base = time_base;
        Ok(())
    }

    fn set_trace_data_sources(&mut self, enabled: bool) -> EmuResult<()> {
        match (enabled, self.tracer.is_some()) {
            (true, false) => {
                info!("data source tracing enabled");
                self.tracer = Some(DataSourceTracer::new());
            }
            (false, true) => {
                info!("data source tracing disabled");
                self.tracer = None;
            }
            _ => {}
        }
        Ok(())
    }

    fn set_trace_data_source_addrs(&mut self, enabled: bool) -> EmuResult<()> {
        self.trace_addresses = enabled;
        Ok(())
    }

    fn source_trace(&self, what: &str, max_depth: usize) -> EmuResult<String> {
        let Some(tracer) = &self.tracer else {
            return Err(EmulatorError::InvalidState(
                "data source tracing is not enabled".to_string(),
            ));
        };
        Ok(tracer.render(what.parse()?, max_depth))
    }

    fn print_state_header(&self, out: &mut dyn Write) -> io::Result<()> {
        for reg in 0..8 {
            let name = register_name(reg, OperandSize::Dword).to_ascii_uppercase();
            write!(out, "{name:-^8} ")?;
        }
        writeln!(out, "-EFLAGS-(ODSZAPC) ---EIP--- = INSTRUCTION")
    }

    fn print_state(&self, out: &mut dyn Write) -> io::Result<()> {
        for value in &self.regs.regs {
            write!(out, "{value:08X} ")?;
        }
        let flags: String = [(OF, 'O'), (DF, 'D'), (SF, 'S'), (ZF, 'Z'), (AF, 'A'), (PF, 'P'), (CF, 'C')]
            .iter()
            .map(|&(mask, c)| if self.regs.flag(mask) { c } else { '-' })
            .collect();
        write!(out, "{:08X}({flags})  {:08X} = ", self.regs.eflags, self.regs.eip)?;
        match self.fetch(self.regs.eip) {
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
    match decode(&CodeSlice::new(bytes, address), address) {
        Ok(inst) => ListingLine {
            address,
            length: inst.length,
            text: inst.to_string(),
            branch_target: inst.branch_target(),
        },
        Err(err) => ListingLine {
            address,
            length: 1,
            text: format!(".byte 0x{:02x} ; {err}", bytes.first().copied().unwrap_or(0)),
            branch_target: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emulator::shared, memory::AddressSpace};

    #[test]
    fn partial_register_writes() {
        let mut regs = X86Registers::default();
        regs.regs[0] = 0x1122_3344;
        regs.write(4, OperandSize::Byte, 0xAA); // ah
        assert_eq!(regs.regs[0], 0x1122_AA44);
        regs.write(0, OperandSize::Word, 0xBEEF);
        assert_eq!(regs.regs[0], 0x1122_BEEF);
        assert_eq!(regs.read(4, OperandSize::Byte), 0xBE);
        assert_eq!(full_register(7, OperandSize::Byte), 3);
    }

    #[test]
    fn behavior_by_name() {
        let mut emu = X86Emulator::new(shared(AddressSpace::new()));
        assert_eq!(emu.behavior(), Behavior::Specification);
        emu.set_behavior_by_name("windows-arm-emu").unwrap();
        assert_eq!(emu.behavior(), Behavior::WindowsArmEmulator);
        assert!(matches!(
            emu.set_behavior_by_name("bochs"),
            Err(EmulatorError::UnsupportedBehavior(_))
        ));
    }

    #[test]
    fn register_names_and_state_line() {
        let mut emu = X86Emulator::new(shared(AddressSpace::new()));
        emu.set_register_by_name("EBX", 0x1234).unwrap();
        emu.set_register_by_name("sp", 0x8000).unwrap();
        assert_eq!(emu.registers().regs[3], 0x1234);
        assert_eq!(emu.stack_pointer(), 0x8000);
        assert!(emu.set_register_by_name("r8", 0).is_err());

        let mut out = Vec::new();
        emu.print_state(&mut out).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.contains("00001234"));
        assert!(line.contains("00000202(-------)"));
        assert!(line.ends_with(">\n"), "{line}");
    }

    #[test]
    fn listing_labels_backward_jump() {
        // loop: dec ecx; jnz loop; ret
        let code = [0x49, 0x75, 0xFD, 0xC3];
        let text = X86Emulator::disassemble(&code, 0x401000, &BTreeMap::new());
        assert!(text.starts_with("label_00401000:\n"), "{text}");
        assert!(text.contains("jne 0x00401000"));
        assert!(text.contains("ret"));
    }

    #[test]
    fn invalid_byte_is_data() {
        assert!(X86Emulator::disassemble_one(&[0xF4], 0).starts_with(".byte 0xf4 ;"));
    }
}
