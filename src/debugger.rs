//! Interactive stepping and tracing for any [`Emulator`].
//!
//! A [`Debugger`] is bound to an emulator as its per-instruction hook. It
//! runs once before the first fetch and then after each instruction retires,
//! so the cycle count it sees already includes that instruction and the
//! program counter is the next one to run.

use std::{
    cell::RefCell,
    collections::BTreeSet,
    fmt,
    fs::File,
    io::{self, BufRead, BufReader, Write},
    marker::PhantomData,
    num::ParseIntError,
    path::{Path, PathBuf},
    rc::Rc,
    str::FromStr,
};

use log::info;
use thiserror::Error;

use crate::emulator::{EmuResult, Emulator, EmulatorError};

const HEADER_INTERVAL: usize = 32;
const DEFAULT_DISASSEMBLY_SIZE: u32 = 0x20;
const DEFAULT_TRACE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebuggerMode {
    #[default]
    None,
    Step,
    Trace,
    PeriodicTrace,
}

impl fmt::Display for DebuggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DebuggerMode::None => "none",
            DebuggerMode::Step => "step",
            DebuggerMode::Trace => "trace",
            DebuggerMode::PeriodicTrace => "periodic trace",
        })
    }
}

/// Everything about a debugging session the caller may want to inspect or
/// change while the emulator runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerState {
    pub mode: DebuggerMode,
    pub trace_period: u64,
    pub breakpoints: BTreeSet<u32>,
    pub cycle_breakpoints: BTreeSet<u64>,
    pub max_cycles: Option<u64>,
    pub print_state_headers: bool,
    pub print_memory_accesses: bool,
}

impl Default for DebuggerState {
    fn default() -> Self {
        Self {
            mode: DebuggerMode::None,
            trace_period: 0x100,
            breakpoints: BTreeSet::new(),
            cycle_breakpoints: BTreeSet::new(),
            max_cycles: None,
            print_state_headers: true,
            print_memory_accesses: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command {0:?} (h for help)")]
    Unknown(String),
    #[error("{command} needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("invalid hex data {0:?}")]
    InvalidData(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Step,
    Continue,
    Trace,
    Quit,
    Registers,
    Memory { address: u32, size: u32 },
    Write { address: u32, data: Vec<u8> },
    SetRegister { name: String, value: u32 },
    Break(u32),
    Unbreak(u32),
    BreakCycles(u64),
    UnbreakCycles(u64),
    Disassemble { address: u32, size: Option<u32> },
    Save(PathBuf),
    Load(PathBuf),
    SourceTrace { what: String, depth: usize },
    Help,
}

fn number<T>(
    text: &str,
    parse: fn(&str, u32) -> Result<T, ParseIntError>,
) -> Result<T, CommandError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    parse(digits, 16).map_err(|_| CommandError::InvalidNumber(text.to_string()))
}

fn hex_bytes(text: &str) -> Result<Vec<u8>, CommandError> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(CommandError::InvalidData(text.to_string()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| CommandError::InvalidData(text.to_string()))
        })
        .collect()
}

impl FromStr for Command {
    type Err = CommandError;

    /// Numbers are hex except the source-trace depth.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(Command::Step);
        };
        let mut arg = |command: &'static str, argument: &'static str| {
            words
                .next()
                .ok_or(CommandError::MissingArgument { command, argument })
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "s" | "step" => Command::Step,
            "c" | "continue" => Command::Continue,
            "t" | "trace" => Command::Trace,
            "q" | "quit" => Command::Quit,
            "r" | "regs" => Command::Registers,
            "h" | "help" | "?" => Command::Help,
            "m" => Command::Memory {
                address: number(arg("m", "an address")?, u32::from_str_radix)?,
                size: number(arg("m", "a size")?, u32::from_str_radix)?,
            },
            "w" => Command::Write {
                address: number(arg("w", "an address")?, u32::from_str_radix)?,
                data: hex_bytes(arg("w", "hex data")?)?,
            },
            "set" => Command::SetRegister {
                name: arg("set", "a register name")?.to_string(),
                value: number(arg("set", "a value")?, u32::from_str_radix)?,
            },
            "b" => Command::Break(number(arg("b", "an address")?, u32::from_str_radix)?),
            "u" => Command::Unbreak(number(arg("u", "an address")?, u32::from_str_radix)?),
            "bc" => Command::BreakCycles(number(
                arg("bc", "a cycle count")?,
                u64::from_str_radix,
            )?),
            "uc" => Command::UnbreakCycles(number(
                arg("uc", "a cycle count")?,
                u64::from_str_radix,
            )?),
            "d" => {
                let address = number(arg("d", "an address")?, u32::from_str_radix)?;
                let size = words
                    .next()
                    .map(|s| number(s, u32::from_str_radix))
                    .transpose()?;
                Command::Disassemble { address, size }
            }
            "save" => Command::Save(PathBuf::from(arg("save", "a file name")?)),
            "load" => Command::Load(PathBuf::from(arg("load", "a file name")?)),
            "st" => {
                let what = arg("st", "a register or address")?.to_string();
                let depth = match words.next() {
                    Some(text) => text
                        .parse()
                        .map_err(|_| CommandError::InvalidNumber(text.to_string()))?,
                    None => DEFAULT_TRACE_DEPTH,
                };
                Command::SourceTrace { what, depth }
            }
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

const HELP: &str = "\
commands (numbers are hex):
  s, step             run one instruction, then stop again
  c, continue         run until a breakpoint
  t, trace            run, printing state after every instruction
  q, quit             stop execution
  r, regs             print registers
  m ADDR SIZE         dump memory
  w ADDR DATA         write hex bytes to memory
  set REG VALUE       change a register
  b ADDR / u ADDR     add / remove an address breakpoint
  bc N / uc N         add / remove a cycle-count breakpoint
  d ADDR [SIZE]       disassemble memory
  save FILE           write the emulator state to FILE
  load FILE           replace the emulator state with FILE
  st WHAT [DEPTH]     show where a value came from (x86 only)
  h, help             show this text
  (empty line)        same as s
";

/// What the prompt loop does after a command.
enum Flow {
    Prompt,
    Resume,
}

pub struct Debugger<E: Emulator> {
    state: Rc<RefCell<DebuggerState>>,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
    lines_since_header: usize,
    _emulator: PhantomData<fn(&mut E)>,
}

impl<E: Emulator> Debugger<E> {
    /// Prompts on stdin; everything else goes to stderr.
    pub fn new(state: DebuggerState) -> Self {
        Self::with_io(state, BufReader::new(io::stdin()), io::stderr())
    }

    pub fn with_io(
        state: DebuggerState,
        input: impl BufRead + 'static,
        output: impl Write + 'static,
    ) -> Self {
        Self {
            state: Rc::new(RefCell::new(state)),
            input: Box::new(input),
            output: Box::new(output),
            lines_since_header: 0,
            _emulator: PhantomData,
        }
    }

    pub fn state(&self) -> Rc<RefCell<DebuggerState>> {
        Rc::clone(&self.state)
    }

    /// Install this debugger as `emu`'s per-instruction hook. The returned
    /// handle stays live for as long as the hook is installed.
    pub fn bind(mut self, emu: &mut E) -> Rc<RefCell<DebuggerState>> {
        let state = self.state();
        emu.memory().borrow_mut().set_access_logging(true);
        emu.set_debug_hook(Box::new(move |emu: &mut E| self.on_boundary(emu)));
        state
    }

    pub fn unbind(emu: &mut E) {
        emu.clear_debug_hook();
        emu.memory().borrow_mut().set_access_logging(false);
    }

    pub fn set_mode(&mut self, mode: DebuggerMode) {
        let mut state = self.state.borrow_mut();
        if state.mode != mode {
            info!("debugger mode: {} -> {mode}", state.mode);
            state.mode = mode;
        }
    }

    pub fn on_boundary(&mut self, emu: &mut E) -> EmuResult<()> {
        let cycles = emu.cycles();
        let pc = emu.pc();
        {
            let state = self.state.borrow();
            if state.max_cycles.is_some_and(|max| cycles >= max) {
                info!("cycle limit {cycles:#x} reached");
                return Err(EmulatorError::Terminate);
            }
        }
        let cycle_hit = self.state.borrow().cycle_breakpoints.contains(&cycles);
        let address_hit = self.state.borrow().breakpoints.contains(&pc);
        if cycle_hit {
            info!("cycle breakpoint at {cycles:#x}");
            self.set_mode(DebuggerMode::Step);
        }
        if address_hit {
            info!("breakpoint at {pc:08X}");
            self.set_mode(DebuggerMode::Step);
        }

        let accesses = emu.memory().borrow().take_accesses();
        let (mode, period, print_accesses) = {
            let state = self.state.borrow();
            (state.mode, state.trace_period, state.print_memory_accesses)
        };
        let show_state = match mode {
            DebuggerMode::None => false,
            DebuggerMode::Trace | DebuggerMode::Step => true,
            DebuggerMode::PeriodicTrace => period != 0 && cycles % period == 0,
        };
        if !show_state {
            return Ok(());
        }
        if print_accesses {
            for access in accesses {
                writeln!(self.output, "{access}")?;
            }
        }
        let step = mode == DebuggerMode::Step;
        self.print_state(emu, step)?;
        if step {
            self.prompt(emu)
        } else {
            Ok(())
        }
    }

    fn prompt(&mut self, emu: &mut E) -> EmuResult<()> {
        loop {
            write!(self.output, "[{}] {:08X}> ", emu.cycles(), emu.pc())?;
            self.output.flush()?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                info!("debugger input closed");
                return Err(EmulatorError::Terminate);
            }
            let command = match line.parse::<Command>() {
                Ok(command) => command,
                Err(err) => {
                    writeln!(self.output, "{err}")?;
                    continue;
                }
            };
            match self.run_command(emu, command) {
                Ok(Flow::Resume) => return Ok(()),
                Ok(Flow::Prompt) => {}
                Err(EmulatorError::Terminate) => return Err(EmulatorError::Terminate),
                Err(err) => writeln!(self.output, "failed: {err}")?,
            }
        }
    }

    fn run_command(&mut self, emu: &mut E, command: Command) -> EmuResult<Flow> {
        match command {
            Command::Step => {
                self.set_mode(DebuggerMode::Step);
                return Ok(Flow::Resume);
            }
            Command::Continue => {
                self.set_mode(DebuggerMode::None);
                return Ok(Flow::Resume);
            }
            Command::Trace => {
                self.set_mode(DebuggerMode::Trace);
                return Ok(Flow::Resume);
            }
            Command::Quit => return Err(EmulatorError::Terminate),
            Command::Registers => self.print_state(emu, true)?,
            Command::Memory { address, size } => self.dump_memory(emu, address, size)?,
            Command::Write { address, data } => self.write_memory(emu, address, &data)?,
            Command::SetRegister { name, value } => emu.set_register_by_name(&name, value)?,
            Command::Break(address) => self.add_breakpoint(address),
            Command::Unbreak(address) => self.remove_breakpoint(address),
            Command::BreakCycles(count) => self.add_cycle_breakpoint(count),
            Command::UnbreakCycles(count) => self.remove_cycle_breakpoint(count),
            Command::Disassemble { address, size } => self.disassemble(emu, address, size)?,
            Command::Save(path) => self.save_state(emu, &path)?,
            Command::Load(path) => self.load_state(emu, &path)?,
            Command::SourceTrace { what, depth } => self.source_trace(emu, &what, depth)?,
            Command::Help => self.output.write_all(HELP.as_bytes())?,
        }
        Ok(Flow::Prompt)
    }

    pub fn print_state(&mut self, emu: &E, force_header: bool) -> EmuResult<()> {
        if self.state.borrow().print_state_headers
            && (force_header || self.lines_since_header == 0)
        {
            emu.print_state_header(&mut *self.output)?;
            self.lines_since_header = 0;
        }
        emu.print_state(&mut *self.output)?;
        self.lines_since_header = (self.lines_since_header + 1) % HEADER_INTERVAL;
        Ok(())
    }

    pub fn dump_memory(&mut self, emu: &E, address: u32, size: u32) -> EmuResult<()> {
        let bytes = emu.memory().borrow().read(address, size as usize)?;
        for (index, chunk) in bytes.chunks(16).enumerate() {
            let line_address = address.wrapping_add(index as u32 * 16);
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
            let text: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            writeln!(self.output, "{line_address:08X} | {:<47} | {text}", hex.join(" "))?;
        }
        Ok(())
    }

    pub fn write_memory(&mut self, emu: &E, address: u32, data: &[u8]) -> EmuResult<()> {
        emu.memory().borrow_mut().write(address, data)?;
        Ok(())
    }

    pub fn add_breakpoint(&mut self, address: u32) {
        self.state.borrow_mut().breakpoints.insert(address);
    }

    pub fn remove_breakpoint(&mut self, address: u32) {
        self.state.borrow_mut().breakpoints.remove(&address);
    }

    pub fn add_cycle_breakpoint(&mut self, count: u64) {
        self.state.borrow_mut().cycle_breakpoints.insert(count);
    }

    pub fn remove_cycle_breakpoint(&mut self, count: u64) {
        self.state.borrow_mut().cycle_breakpoints.remove(&count);
    }

    pub fn disassemble(&mut self, emu: &E, address: u32, size: Option<u32>) -> EmuResult<()> {
        let size = size.unwrap_or(DEFAULT_DISASSEMBLY_SIZE) as usize;
        let (bytes, labels) = {
            let mem = emu.memory().borrow();
            (mem.read(address, size)?, mem.labels())
        };
        self.output
            .write_all(E::disassemble(&bytes, address, &labels).as_bytes())?;
        Ok(())
    }

    pub fn save_state(&mut self, emu: &E, path: &Path) -> EmuResult<()> {
        let mut file = File::create(path)?;
        emu.export_state(&mut file)?;
        writeln!(self.output, "state saved to {}", path.display())?;
        Ok(())
    }

    pub fn load_state(&mut self, emu: &mut E, path: &Path) -> EmuResult<()> {
        let mut file = File::open(path)?;
        emu.import_state(&mut file)?;
        writeln!(self.output, "state loaded from {}", path.display())?;
        Ok(())
    }

    pub fn source_trace(&mut self, emu: &E, what: &str, depth: usize) -> EmuResult<()> {
        let text = emu.source_trace(what, depth)?;
        self.output.write_all(text.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emulator::shared, memory::AddressSpace, ppc::PpcEmulator};

    /// A `Write` the test keeps a handle to after the debugger takes it.
    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    fn nop_machine(count: u32) -> PpcEmulator {
        let mut mem = AddressSpace::new();
        mem.allocate_at(0x1000, count * 4).unwrap();
        for i in 0..count {
            mem.write_u32b(0x1000 + i * 4, 0x6000_0000).unwrap();
        }
        let mut emu = PpcEmulator::new(shared(mem));
        emu.set_pc(0x1000);
        emu
    }

    fn quiet() -> DebuggerState {
        DebuggerState {
            print_memory_accesses: false,
            print_state_headers: false,
            ..DebuggerState::default()
        }
    }

    #[test]
    fn cycle_breakpoint_stops_right_after_that_instruction() {
        let mut emu = nop_machine(16);
        let mut state = quiet();
        state.cycle_breakpoints.insert(3);
        let out = Capture::default();
        let debugger = Debugger::with_io(state, io::Cursor::new(b"q\n".to_vec()), out.clone());
        let handle = debugger.bind(&mut emu);

        emu.execute().unwrap();

        assert_eq!(emu.cycles(), 3);
        assert_eq!(handle.borrow().mode, DebuggerMode::Step);
        let text = out.text();
        assert_eq!(text.matches("> ").count(), 1, "{text}");
        assert!(text.ends_with("[3] 0000100C> "), "{text}");
    }

    #[test]
    fn address_breakpoint_then_single_steps() {
        let mut emu = nop_machine(16);
        let mut state = quiet();
        state.breakpoints.insert(0x1008);
        let out = Capture::default();
        let input = io::Cursor::new(b"s\n\nc\n".to_vec());
        Debugger::with_io(state, input, out.clone()).bind(&mut emu);
        emu.set_max_cycles(Some(10));

        emu.execute().unwrap();

        let text = out.text();
        assert!(text.contains("[2] 00001008> "), "{text}");
        assert!(text.contains("[3] 0000100C> "), "{text}");
        assert!(text.contains("[4] 00001010> "), "{text}");
        assert!(!text.contains("[5]"), "{text}");
        assert_eq!(emu.cycles(), 10);
    }

    #[test]
    fn end_of_input_terminates() {
        let mut emu = nop_machine(8);
        let mut state = quiet();
        state.mode = DebuggerMode::Step;
        Debugger::with_io(state, io::Cursor::new(Vec::new()), io::sink()).bind(&mut emu);
        emu.execute().unwrap();
        assert_eq!(emu.cycles(), 0);
    }

    #[test]
    fn step_mode_prompts_before_the_first_instruction() {
        let mut emu = nop_machine(8);
        let mut state = quiet();
        state.mode = DebuggerMode::Step;
        let out = Capture::default();
        let input = io::Cursor::new(b"s\nq\n".to_vec());
        Debugger::with_io(state, input, out.clone()).bind(&mut emu);

        emu.execute().unwrap();

        let text = out.text();
        assert!(text.contains("[0] 00001000> "), "{text}");
        assert!(text.ends_with("[1] 00001004> "), "{text}");
        assert_eq!(emu.cycles(), 1);
    }

    #[test]
    fn breakpoint_on_the_entry_instruction() {
        let mut emu = nop_machine(16);
        let mut state = quiet();
        state.breakpoints.insert(0x1000);
        let out = Capture::default();
        let handle = Debugger::with_io(state, io::Cursor::new(b"q\n".to_vec()), out.clone())
            .bind(&mut emu);
        emu.set_max_cycles(Some(10));

        emu.execute().unwrap();

        assert_eq!(emu.cycles(), 0);
        assert_eq!(handle.borrow().mode, DebuggerMode::Step);
        let text = out.text();
        assert!(text.ends_with("[0] 00001000> "), "{text}");
    }

    #[test]
    fn cycle_breakpoint_zero_stops_at_entry() {
        let mut emu = nop_machine(8);
        let mut state = quiet();
        state.cycle_breakpoints.insert(0);
        let out = Capture::default();
        Debugger::with_io(state, io::Cursor::new(b"c\n".to_vec()), out.clone()).bind(&mut emu);
        emu.set_max_cycles(Some(4));

        emu.execute().unwrap();

        let text = out.text();
        assert_eq!(text.matches("> ").count(), 1, "{text}");
        assert!(text.ends_with("[0] 00001000> "), "{text}");
        assert_eq!(emu.cycles(), 4);
    }

    #[test]
    fn periodic_trace_prints_every_nth_boundary() {
        let mut emu = nop_machine(10);
        let mut state = quiet();
        state.mode = DebuggerMode::PeriodicTrace;
        state.trace_period = 3;
        state.max_cycles = Some(9);
        let out = Capture::default();
        Debugger::with_io(state, io::empty(), out.clone()).bind(&mut emu);

        emu.execute().unwrap();

        let text = out.text();
        let pcs: Vec<&str> = text
            .lines()
            .map(|line| line.split(" = ").next().unwrap_or("").rsplit(' ').next().unwrap_or(""))
            .collect();
        assert_eq!(pcs, ["00001000", "0000100C", "00001018"], "{text}");
        assert_eq!(emu.cycles(), 9);
    }

    #[test]
    fn max_cycles_terminates() {
        let mut emu = nop_machine(8);
        let mut state = quiet();
        state.max_cycles = Some(5);
        Debugger::with_io(state, io::empty(), io::sink()).bind(&mut emu);
        emu.execute().unwrap();
        assert_eq!(emu.cycles(), 5);
    }

    #[test]
    fn trace_prints_every_instruction() {
        let mut emu = nop_machine(4);
        let mut state = quiet();
        state.mode = DebuggerMode::Trace;
        state.max_cycles = Some(3);
        let out = Capture::default();
        Debugger::with_io(state, io::empty(), out.clone()).bind(&mut emu);
        emu.execute().unwrap();
        // one line before each of the three instructions
        assert_eq!(out.text().lines().count(), 3);
    }

    #[test]
    fn commands_inspect_and_modify_state() {
        let mut emu = nop_machine(8);
        let mut state = quiet();
        state.mode = DebuggerMode::Step;
        let input = "set r3 2A\nw 1004 38600001\nm 1000 8\nd 1004 4\nbogus\nq\n";
        let out = Capture::default();
        Debugger::with_io(state, io::Cursor::new(input.as_bytes().to_vec()), out.clone())
            .bind(&mut emu);
        emu.execute().unwrap();

        assert_eq!(emu.registers().r[3], 0x2A);
        assert_eq!(
            emu.memory().borrow().read_u32b(0x1004).unwrap(),
            0x3860_0001
        );
        let text = out.text();
        assert!(text.contains("00001000 | 60 00 00 00 38 60 00 01"), "{text}");
        assert!(text.contains("li r3, 0x1"), "{text}");
        assert!(text.contains("unknown command \"bogus\""), "{text}");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let mut emu = nop_machine(8);
        emu.registers_mut().r[5] = 0x55;

        let mut debugger = Debugger::<PpcEmulator>::with_io(quiet(), io::empty(), io::sink());
        debugger.save_state(&emu, &path).unwrap();
        emu.registers_mut().r[5] = 0;
        debugger.load_state(&mut emu, &path).unwrap();
        assert_eq!(emu.registers().r[5], 0x55);
    }

    #[test]
    fn unbind_leaves_emulator_untouched() {
        let mut emu = nop_machine(8);
        let mut state = quiet();
        state.mode = DebuggerMode::Step;
        Debugger::with_io(state, io::empty(), io::sink()).bind(&mut emu);
        let before = emu.registers().clone();
        Debugger::unbind(&mut emu);
        assert_eq!(emu.registers(), &before);
        emu.set_max_cycles(Some(4));
        emu.execute().unwrap();
        assert_eq!(emu.cycles(), 4);
    }

    #[test]
    fn parse_commands() {
        assert_eq!("".parse::<Command>().unwrap(), Command::Step);
        assert_eq!("C".parse::<Command>().unwrap(), Command::Continue);
        assert_eq!(
            "m 0x1000 10".parse::<Command>().unwrap(),
            Command::Memory {
                address: 0x1000,
                size: 0x10
            }
        );
        assert_eq!(
            "w 2000 4e75".parse::<Command>().unwrap(),
            Command::Write {
                address: 0x2000,
                data: vec![0x4E, 0x75]
            }
        );
        assert_eq!("bc 1F".parse::<Command>().unwrap(), Command::BreakCycles(0x1F));
        assert_eq!(
            "d 1000".parse::<Command>().unwrap(),
            Command::Disassemble {
                address: 0x1000,
                size: None
            }
        );
        assert_eq!(
            "st eax 3".parse::<Command>().unwrap(),
            Command::SourceTrace {
                what: "eax".into(),
                depth: 3
            }
        );
        assert_eq!(
            "m 1000".parse::<Command>(),
            Err(CommandError::MissingArgument {
                command: "m",
                argument: "a size"
            })
        );
        assert!(matches!(
            "w 1000 abc".parse::<Command>(),
            Err(CommandError::InvalidData(_))
        ));
        assert!(matches!(
            "b zz".parse::<Command>(),
            Err(CommandError::InvalidNumber(_))
        ));
    }
}
