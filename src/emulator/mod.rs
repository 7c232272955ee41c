//! The contract every CPU variant implements, plus the run loop they share.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    io::{self, Read, Write},
    rc::Rc,
    str::FromStr,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::memory::{AddressSpace, MemoryError};

pub mod state;

/// One address space may back several emulators; nothing here is thread-safe.
pub type SharedMemory = Rc<RefCell<AddressSpace>>;

pub fn shared(space: AddressSpace) -> SharedMemory {
    Rc::new(RefCell::new(space))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    M68k,
    Ppc32,
    X86,
}

impl Architecture {
    pub fn tag(self) -> u8 {
        match self {
            Architecture::M68k => 1,
            Architecture::Ppc32 => 2,
            Architecture::X86 => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Architecture::M68k),
            2 => Some(Architecture::Ppc32),
            3 => Some(Architecture::X86),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::M68k => "68K",
            Architecture::Ppc32 => "PPC32",
            Architecture::X86 => "X86",
        })
    }
}

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("cannot decode opcode {opcode:#x} at {address:#010x}: {reason}")]
    Decode {
        address: u32,
        opcode: u32,
        reason: String,
    },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("unimplemented call: {0}")]
    UnimplementedCall(String),
    #[error("execution terminated")]
    Terminate,
    #[error("state was saved by a {found} emulator and cannot be loaded into a {expected} one")]
    ArchitectureMismatch {
        expected: Architecture,
        found: Architecture,
    },
    #[error("invalid saved state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unknown register: {0}")]
    UnknownRegister(String),
    #[error("unsupported behavior: {0}")]
    UnsupportedBehavior(String),
    #[error("data source tracing is not available on this emulator")]
    TracingUnsupported,
}

pub type EmuResult<T> = std::result::Result<T, EmulatorError>;

impl EmulatorError {
    pub(crate) fn decode(address: u32, opcode: u32, reason: impl Into<String>) -> Self {
        EmulatorError::Decode {
            address,
            opcode,
            reason: reason.into(),
        }
    }
}

/// Selects between real-hardware semantics and the quirks of another
/// emulator for flags the ISA leaves undefined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Behavior {
    #[default]
    Specification,
    WindowsArmEmulator,
}

impl FromStr for Behavior {
    type Err = EmulatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "specification" => Ok(Behavior::Specification),
            "windows-arm-emu" => Ok(Behavior::WindowsArmEmulator),
            other => Err(EmulatorError::UnsupportedBehavior(other.to_string())),
        }
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Behavior::Specification => "specification",
            Behavior::WindowsArmEmulator => "windows-arm-emu",
        })
    }
}

/// Source of values for `mftb` / `rdtsc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBase {
    base: u64,
    overrides: VecDeque<u64>,
    last_override: Option<u64>,
}

impl TimeBase {
    /// Counter that starts at `base` and advances by one per retired instruction.
    pub fn fixed(base: u64) -> Self {
        Self {
            base,
            overrides: VecDeque::new(),
            last_override: None,
        }
    }

    /// Each query consumes one value; once the list runs out the last value
    /// keeps being returned.
    pub fn with_overrides(values: impl IntoIterator<Item = u64>) -> Self {
        Self {
            base: 0,
            overrides: values.into_iter().collect(),
            last_override: None,
        }
    }

    pub fn read(&mut self, cycles: u64) -> u64 {
        if let Some(value) = self.overrides.pop_front() {
            self.last_override = Some(value);
            return value;
        }
        self.last_override
            .unwrap_or_else(|| self.base.wrapping_add(cycles))
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::fixed(0)
    }
}

pub type DebugHook<E> = Box<dyn FnMut(&mut E) -> EmuResult<()>>;
pub type SyscallHandler<E> = Box<dyn FnMut(&mut E, <E as Emulator>::Trap) -> EmuResult<()>>;

/// Callback slots owned by an emulator.
pub struct Hooks<E: Emulator> {
    debug: Option<DebugHook<E>>,
    syscall: Option<SyscallHandler<E>>,
}

impl<E: Emulator> Default for Hooks<E> {
    fn default() -> Self {
        Self {
            debug: None,
            syscall: None,
        }
    }
}

impl<E: Emulator> fmt::Debug for Hooks<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("debug", &self.debug.is_some())
            .field("syscall", &self.syscall.is_some())
            .finish()
    }
}

/// An instruction-level virtual machine for one ISA.
pub trait Emulator: Sized + 'static {
    type Registers: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned;
    /// What the trap boundary hands to the syscall handler.
    type Trap: Copy + fmt::Debug;

    const ARCHITECTURE: Architecture;
    const LITTLE_ENDIAN: bool;

    fn new(memory: SharedMemory) -> Self;

    fn memory(&self) -> &SharedMemory;
    fn registers(&self) -> &Self::Registers;
    fn registers_mut(&mut self) -> &mut Self::Registers;

    fn pc(&self) -> u32;
    fn set_pc(&mut self, pc: u32);
    fn stack_pointer(&self) -> u32;
    fn set_stack_pointer(&mut self, sp: u32);

    /// Number of retired instructions.
    fn cycles(&self) -> u64;
    fn max_cycles(&self) -> Option<u64>;
    fn set_max_cycles(&mut self, max: Option<u64>);

    #[doc(hidden)]
    fn hooks(&mut self) -> &mut Hooks<Self>;

    /// Fetch, decode and execute exactly one instruction, bumping the cycle
    /// counter. The debug hook is not called.
    fn step(&mut self) -> EmuResult<()>;

    fn set_register_by_name(&mut self, name: &str, value: u32) -> EmuResult<()>;

    fn print_state_header(&self, out: &mut dyn Write) -> io::Result<()>;
    fn print_state(&self, out: &mut dyn Write) -> io::Result<()>;

    /// Disassemble the first instruction in `bytes`, located at `address`.
    fn disassemble_one(bytes: &[u8], address: u32) -> String;
    fn disassemble(bytes: &[u8], address: u32, labels: &BTreeMap<u32, String>) -> String;

    /// Run until the cycle limit, a terminate request, or a fault.
    fn execute(&mut self) -> EmuResult<()> {
        match run_until_stopped(self) {
            Err(EmulatorError::Terminate) => Ok(()),
            other => other,
        }
    }

    fn set_syscall_handler(&mut self, handler: SyscallHandler<Self>) {
        self.hooks().syscall = Some(handler);
    }

    fn set_debug_hook(&mut self, hook: DebugHook<Self>) {
        self.hooks().debug = Some(hook);
    }

    fn clear_debug_hook(&mut self) {
        self.hooks().debug = None;
    }

    fn set_behavior_by_name(&mut self, name: &str) -> EmuResult<()> {
        match name {
            "specification" => Ok(()),
            other => Err(EmulatorError::UnsupportedBehavior(other.to_string())),
        }
    }

    fn set_time_base(&mut self, _time_base: TimeBase) -> EmuResult<()> {
        Err(EmulatorError::UnsupportedBehavior(format!(
            "{} has no time base register",
            Self::ARCHITECTURE
        )))
    }

    fn set_trace_data_sources(&mut self, enabled: bool) -> EmuResult<()> {
        if enabled {
            Err(EmulatorError::TracingUnsupported)
        } else {
            Ok(())
        }
    }

    fn set_trace_data_source_addrs(&mut self, enabled: bool) -> EmuResult<()> {
        self.set_trace_data_sources(enabled)
    }

    fn source_trace(&self, _what: &str, _max_depth: usize) -> EmuResult<String> {
        Err(EmulatorError::TracingUnsupported)
    }

    fn export_state(&self, out: &mut dyn Write) -> EmuResult<()> {
        state::write_snapshot(
            out,
            Self::ARCHITECTURE,
            self.registers(),
            &self.memory().borrow(),
        )
    }

    fn import_state(&mut self, input: &mut dyn Read) -> EmuResult<()> {
        let (registers, space) = state::read_snapshot(input, Self::ARCHITECTURE)?;
        *self.registers_mut() = registers;
        *self.memory().borrow_mut() = space;
        Ok(())
    }

    /// Push a 32-bit value in the architecture's byte order.
    fn push_u32(&mut self, value: u32) -> EmuResult<()> {
        let sp = self.stack_pointer().wrapping_sub(4);
        {
            let mut mem = self.memory().borrow_mut();
            if Self::LITTLE_ENDIAN {
                mem.write_u32l(sp, value)?;
            } else {
                mem.write_u32b(sp, value)?;
            }
        }
        self.set_stack_pointer(sp);
        Ok(())
    }
}

fn cycle_limit_reached<E: Emulator>(emu: &E) -> bool {
    emu.max_cycles().is_some_and(|max| emu.cycles() >= max)
}

/// The debug hook sees every boundary, including the one before the first
/// fetch, so a hook can stop on the entry instruction.
fn run_until_stopped<E: Emulator>(emu: &mut E) -> EmuResult<()> {
    if cycle_limit_reached(emu) {
        return Ok(());
    }
    call_debug_hook(emu)?;
    while !cycle_limit_reached(emu) {
        emu.step()?;
        call_debug_hook(emu)?;
    }
    Ok(())
}

pub(crate) fn call_debug_hook<E: Emulator>(emu: &mut E) -> EmuResult<()> {
    let Some(mut hook) = emu.hooks().debug.take() else {
        return Ok(());
    };
    let result = hook(emu);
    // The hook may have replaced or cleared itself.
    let slot = &mut emu.hooks().debug;
    if slot.is_none() {
        *slot = Some(hook);
    }
    result
}

/// Hand a trap to the installed handler. Without one the trap is fatal.
pub(crate) fn call_syscall_handler<E: Emulator>(emu: &mut E, trap: E::Trap) -> EmuResult<()> {
    let Some(mut handler) = emu.hooks().syscall.take() else {
        return Err(EmulatorError::UnimplementedCall(format!(
            "{} trap {trap:X?} with no handler installed",
            E::ARCHITECTURE
        )));
    };
    let result = handler(emu, trap);
    let slot = &mut emu.hooks().syscall;
    if slot.is_none() {
        *slot = Some(handler);
    }
    result
}

/// `0x10` / `-0x10`, the way every disassembler here prints displacements.
pub fn format_signed_hex(value: i32) -> String {
    if value < 0 {
        format!("-0x{:x}", -(value as i64))
    } else {
        format!("0x{value:x}")
    }
}

/// One decoded line of a disassembly listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListingLine {
    pub address: u32,
    pub length: u32,
    pub text: String,
    pub branch_target: Option<u32>,
}

/// Walk `bytes` from `start`, decoding one line at a time. `decode_at` gets
/// the address and the remaining bytes and must report a non-zero length.
pub(crate) fn collect_listing(
    bytes: &[u8],
    start: u32,
    mut decode_at: impl FnMut(u32, &[u8]) -> ListingLine,
) -> Vec<ListingLine> {
    let mut lines = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let address = start.wrapping_add(offset as u32);
        let mut line = decode_at(address, &bytes[offset..]);
        line.length = line.length.max(1);
        offset += line.length as usize;
        lines.push(line);
    }
    lines
}

/// Lay out decoded lines with their raw bytes, emitting a `label_XXXXXXXX:`
/// line before every branch target that falls inside the listing.
pub(crate) fn render_listing(
    bytes: &[u8],
    start: u32,
    lines: &[ListingLine],
    labels: &BTreeMap<u32, String>,
) -> String {
    let starts: BTreeSet<u32> = lines.iter().map(|line| line.address).collect();
    let targets: BTreeSet<u32> = lines
        .iter()
        .filter_map(|line| line.branch_target)
        .filter(|target| starts.contains(target))
        .collect();

    let mut out = String::new();
    for line in lines {
        if let Some(name) = labels.get(&line.address) {
            out.push_str(&format!("{name}:\n"));
        }
        if targets.contains(&line.address) {
            out.push_str(&format!("label_{:08X}:\n", line.address));
        }
        let offset = line.address.wrapping_sub(start) as usize;
        let end = (offset + line.length as usize).min(bytes.len());
        let hex: String = bytes[offset..end]
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect();
        out.push_str(&format!("  {:08X}  {hex:<20} {}\n", line.address, line.text));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_base_overrides_repeat_last() {
        let mut tb = TimeBase::with_overrides([0x10, 0x20, 0x30]);
        assert_eq!(tb.read(0), 0x10);
        assert_eq!(tb.read(5), 0x20);
        assert_eq!(tb.read(9), 0x30);
        assert_eq!(tb.read(100), 0x30);
    }

    #[test]
    fn fixed_time_base_counts_cycles() {
        let mut tb = TimeBase::fixed(0x1000);
        assert_eq!(tb.read(0), 0x1000);
        assert_eq!(tb.read(3), 0x1003);
    }

    #[test]
    fn behavior_names() {
        assert_eq!(
            "windows-arm-emu".parse::<Behavior>().unwrap(),
            Behavior::WindowsArmEmulator
        );
        assert_eq!(Behavior::Specification.to_string(), "specification");
        assert!("qemu".parse::<Behavior>().is_err());
    }

    #[test]
    fn listing_labels_branch_targets() {
        let lines = vec![
            ListingLine {
                address: 0x100,
                length: 2,
                text: "bra 0x00000102".into(),
                branch_target: Some(0x102),
            },
            ListingLine {
                address: 0x102,
                length: 2,
                text: "rts".into(),
                branch_target: None,
            },
        ];
        let mut labels = BTreeMap::new();
        labels.insert(0x100, "entry".to_string());
        let text = render_listing(&[0x60, 0x00, 0x4E, 0x75], 0x100, &lines, &labels);
        assert!(text.starts_with("entry:\n"));
        assert!(text.contains("label_00000102:\n  00000102  4E75"));
    }
}
