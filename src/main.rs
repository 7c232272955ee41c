use std::{fs, fs::File, io, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::{info, warn};

use resemu::{
    AddressSpace, Emulator, TimeBase,
    debugger::{Debugger, DebuggerMode, DebuggerState},
    loader::{
        SegmentDefinition, load_elf, parse_hex_u32, parse_hex_u64, parse_patch,
        parse_register_assignment, parse_symbol,
    },
    m68k::M68kEmulator,
    ppc::PpcEmulator,
    shared,
    syscall::{MacToolboxEnvironment, Win32StubEnvironment, ppc_terminate_on_sentinel},
    x86::X86Emulator,
};

const DEFAULT_STACK_SIZE: u32 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Arch {
    M68k,
    Ppc32,
    X86,
}

/// Run a piece of 68K, PowerPC or x86 code in an emulated address space.
/// All numbers are hex.
#[derive(Parser, Debug)]
#[command(name = "resemu", version)]
struct Args {
    /// CPU to emulate.
    #[arg(long, value_enum, default_value_t = Arch::M68k)]
    arch: Arch,

    /// Create a memory region: ADDR:SIZE, ADDR+FILE, ADDR:SIZE+FILE,
    /// ADDR/HEXDATA or ADDR:SIZE/HEXDATA.
    #[arg(long = "mem", value_name = "DESCRIPTOR")]
    segments: Vec<SegmentDefinition>,

    /// Map the PT_LOAD segments of an ELF file; its entry point becomes the
    /// initial pc unless --pc is given.
    #[arg(long, value_name = "FILE")]
    load_elf: Vec<PathBuf>,

    /// Overwrite existing memory after everything is loaded.
    #[arg(long = "patch", value_name = "ADDR/HEXDATA", value_parser = parse_patch)]
    patches: Vec<(u32, Vec<u8>)>,

    /// Name an address in disassembly.
    #[arg(long = "symbol", value_name = "ADDR=NAME", value_parser = parse_symbol)]
    symbols: Vec<(u32, String)>,

    /// Initial program counter.
    #[arg(long, value_parser = parse_hex_u32)]
    pc: Option<u32>,

    /// Set a register before running.
    #[arg(long = "reg", value_name = "REG:VALUE", value_parser = parse_register_assignment)]
    registers: Vec<(String, u32)>,

    /// Push a 32-bit value on the stack; the last one pushed ends up on top.
    #[arg(long = "push", value_name = "VALUE", value_parser = parse_hex_u32)]
    push: Vec<u32>,

    /// Start from a saved state instead of a blank machine.
    #[arg(long, value_name = "FILE")]
    load_state: Option<PathBuf>,

    /// Write the final state here.
    #[arg(long, value_name = "FILE")]
    save_state: Option<PathBuf>,

    /// Execution quirks to imitate (x86: specification or windows-arm-emu).
    #[arg(long)]
    behavior: Option<String>,

    /// Time base / TSC: one starting value, or a comma-separated list of
    /// values to return from successive reads.
    #[arg(long, value_name = "VALUE[,VALUE...]", value_parser = parse_time_base)]
    time_base: Option<TimeBase>,

    /// Do not install a trap handler; any trap stops execution.
    #[arg(long)]
    no_syscalls: bool,

    /// Fail accesses past the requested size of a region.
    #[arg(long)]
    strict_memory: bool,

    /// Stop in the debugger when execution reaches this address.
    #[arg(
        long = "break",
        visible_alias = "breakpoint",
        value_name = "ADDR",
        value_parser = parse_hex_u32
    )]
    breakpoints: Vec<u32>,

    /// Stop in the debugger after this many instructions.
    #[arg(long = "break-cycles", value_name = "COUNT", value_parser = parse_hex_u64)]
    cycle_breakpoints: Vec<u64>,

    /// Print the machine state after every instruction.
    #[arg(long)]
    trace: bool,

    /// Print the machine state every N instructions.
    #[arg(long, value_name = "N", value_parser = parse_hex_u64)]
    periodic_trace: Option<u64>,

    /// Start in single-step mode.
    #[arg(long)]
    step: bool,

    /// Stop after this many instructions.
    #[arg(long, value_parser = parse_hex_u64)]
    max_cycles: Option<u64>,

    #[arg(long)]
    no_state_headers: bool,

    #[arg(long)]
    no_memory_log: bool,

    /// Track where every value came from (x86 only).
    #[arg(long)]
    trace_data_sources: bool,

    /// Also track the registers used to compute addresses (x86 only).
    #[arg(long)]
    trace_data_source_addrs: bool,
}

fn parse_time_base(text: &str) -> Result<TimeBase> {
    if text.contains(',') {
        let values = text
            .split(',')
            .map(parse_hex_u64)
            .collect::<Result<Vec<_>>>()?;
        Ok(TimeBase::with_overrides(values))
    } else {
        Ok(TimeBase::fixed(parse_hex_u64(text)?))
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let result = match args.arch {
        Arch::M68k => run::<M68kEmulator>(&args, |emu| MacToolboxEnvironment::new().install(emu)),
        Arch::Ppc32 => run::<PpcEmulator>(&args, |emu| {
            emu.set_syscall_handler(Box::new(ppc_terminate_on_sentinel))
        }),
        Arch::X86 => run::<X86Emulator>(&args, |emu| Win32StubEnvironment::new().install(emu)),
    };
    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn debugger_state(args: &Args) -> DebuggerState {
    let mut state = DebuggerState {
        breakpoints: args.breakpoints.iter().copied().collect(),
        cycle_breakpoints: args.cycle_breakpoints.iter().copied().collect(),
        max_cycles: args.max_cycles,
        print_state_headers: !args.no_state_headers,
        print_memory_accesses: !args.no_memory_log,
        ..DebuggerState::default()
    };
    if args.step {
        state.mode = DebuggerMode::Step;
    } else if args.trace {
        state.mode = DebuggerMode::Trace;
    } else if let Some(period) = args.periodic_trace {
        state.mode = DebuggerMode::PeriodicTrace;
        state.trace_period = period;
    }
    state
}

fn load_memory<E: Emulator>(emu: &mut E, args: &Args) -> Result<()> {
    let mut mem = emu.memory().borrow_mut();
    for segment in &args.segments {
        segment.apply(&mut mem)?;
    }
    let mut entry = None;
    for path in &args.load_elf {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let loaded = load_elf(&mut mem, &bytes)
            .with_context(|| format!("failed to load {}", path.display()))?;
        if let Some(arch) = loaded.architecture
            && arch != E::ARCHITECTURE
        {
            warn!("{} is a {arch} image, running it as {}", path.display(), E::ARCHITECTURE);
        }
        entry.get_or_insert(loaded.entry);
    }
    for (address, name) in &args.symbols {
        mem.set_symbol(name, *address);
    }
    drop(mem);

    if let Some(pc) = args.pc.or(entry) {
        emu.set_pc(pc);
    }
    Ok(())
}

fn run<E: Emulator>(args: &Args, install_environment: impl FnOnce(&mut E)) -> Result<()> {
    let mut space = AddressSpace::new();
    space.set_strict(args.strict_memory);
    let mut emu = E::new(shared(space));

    if let Some(path) = &args.load_state {
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        emu.import_state(&mut file)
            .with_context(|| format!("failed to load state from {}", path.display()))?;
        emu.memory().borrow_mut().set_strict(args.strict_memory);
    }

    load_memory(&mut emu, args)?;
    for (name, value) in &args.registers {
        emu.set_register_by_name(name, *value)?;
    }

    if emu.stack_pointer() == 0 {
        let base = emu.memory().borrow_mut().allocate(DEFAULT_STACK_SIZE);
        if base == 0 {
            bail!("cannot allocate a stack");
        }
        let top = base + DEFAULT_STACK_SIZE;
        info!("no stack pointer given; using a stack at {base:08X}:{DEFAULT_STACK_SIZE:X}");
        emu.set_stack_pointer(top);
    }
    for value in &args.push {
        emu.push_u32(*value)?;
    }

    {
        let mut mem = emu.memory().borrow_mut();
        for (address, data) in &args.patches {
            mem.write(*address, data)
                .with_context(|| format!("cannot patch {address:08X}"))?;
        }
    }

    if !args.no_syscalls {
        install_environment(&mut emu);
    }
    if let Some(behavior) = &args.behavior {
        emu.set_behavior_by_name(behavior)?;
    }
    if let Some(time_base) = &args.time_base {
        emu.set_time_base(time_base.clone())?;
    }
    if args.trace_data_sources || args.trace_data_source_addrs {
        emu.set_trace_data_sources(true).with_context(|| {
            format!("--trace-data-sources is not supported for {}", E::ARCHITECTURE)
        })?;
    }
    if args.trace_data_source_addrs {
        emu.set_trace_data_source_addrs(true)?;
    }

    Debugger::new(debugger_state(args)).bind(&mut emu);
    let result = emu.execute();

    let mut stderr = io::stderr();
    if !args.no_state_headers {
        emu.print_state_header(&mut stderr)?;
    }
    emu.print_state(&mut stderr)?;
    eprintln!("{:#x} instructions executed", emu.cycles());

    if let Some(path) = &args.save_state {
        let mut file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        emu.export_state(&mut file)?;
    }
    result.context("execution failed")
}
