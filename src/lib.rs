//! Instruction-level emulators for running legacy 68K, PowerPC and x86
//! routines inside a synthetic 32-bit address space.

pub mod debugger;
pub mod decompress;
pub mod emulator;
pub mod interrupts;
pub mod loader;
pub mod m68k;
pub mod memory;
pub mod ppc;
pub mod syscall;
pub mod x86;

pub use emulator::{
    Architecture, Behavior, EmuResult, Emulator, EmulatorError, SharedMemory, TimeBase, shared,
};
pub use memory::{AddressSpace, MemoryError};
