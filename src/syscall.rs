//! Host environments that answer traps raised by guest code.
//!
//! Each environment is a plain struct with a `handle` method; `install` moves
//! it into the emulator's syscall slot.

use std::{collections::HashMap, sync::LazyLock};

use log::{debug, warn};

use crate::{
    emulator::{EmuResult, Emulator, EmulatorError},
    m68k::{M68kEmulator, TrapWord},
    ppc::PpcEmulator,
    x86::{
        X86Emulator,
        decoder::{EAX, ESP},
    },
};

const MEM_FULL_ERR: i32 = -108;
const MEM_WZ_ERR: i32 = -111;

/// Names of the OS traps classic Mac decompressors tend to reach for.
static OS_TRAP_NAMES: LazyLock<HashMap<u16, &'static str>> = LazyLock::new(|| {
    [
        (0x1E, "NewPtr"),
        (0x1F, "DisposePtr"),
        (0x22, "NewHandle"),
        (0x23, "DisposeHandle"),
        (0x25, "GetHandleSize"),
        (0x29, "HLock"),
        (0x2A, "HUnlock"),
        (0x2E, "BlockMove"),
        (0x46, "GetTrapAddress"),
    ]
    .into_iter()
    .collect()
});

pub fn os_trap_name(number: u16) -> Option<&'static str> {
    OS_TRAP_NAMES.get(&number).copied()
}

/// The memory manager subset of the classic Mac OS, enough for `dcmp`
/// resources and small test programs.
#[derive(Debug, Clone, Default)]
pub struct MacToolboxEnvironment {
    lenient: bool,
    trap_stubs: HashMap<u16, u32>,
}

impl MacToolboxEnvironment {
    /// Unknown traps stop execution with an error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown traps are logged and skipped.
    pub fn lenient() -> Self {
        Self {
            lenient: true,
            ..Self::default()
        }
    }

    pub fn install(mut self, emu: &mut M68kEmulator) {
        emu.set_syscall_handler(Box::new(move |emu, word| self.handle(emu, word)));
    }

    pub fn handle(&mut self, emu: &mut M68kEmulator, word: u16) -> EmuResult<()> {
        if word & 0xF000 != 0xA000 {
            return self.unknown(format!("trap #{} (opcode {word:04X})", word & 0x000F));
        }
        match TrapWord::parse(word) {
            TrapWord::Os { number, flags } => self.os_trap(emu, number, flags),
            TrapWord::Toolbox { number, auto_pop } => self.unknown(format!(
                "toolbox trap {number:03X} (auto_pop={auto_pop})"
            )),
        }
    }

    fn unknown(&self, what: String) -> EmuResult<()> {
        if self.lenient {
            warn!("skipping unimplemented {what}");
            Ok(())
        } else {
            Err(EmulatorError::UnimplementedCall(what))
        }
    }

    fn os_trap(&mut self, emu: &mut M68kEmulator, number: u16, flags: u8) -> EmuResult<()> {
        if let Some(name) = os_trap_name(number) {
            debug!("{name} (flags={flags})");
        }
        let regs = emu.registers().clone();
        let (d0, a0, a1) = (regs.d[0], regs.a[0], regs.a[1]);
        let mut mem = emu.memory().borrow_mut();
        let (result, new_a0) = match number {
            0x1E => {
                let addr = mem.allocate(d0);
                if addr == 0 {
                    (MEM_FULL_ERR, Some(0))
                } else {
                    (0, Some(addr))
                }
            }
            0x1F | 0x23 => match mem.free(a0) {
                Ok(()) => (0, None),
                Err(_) => (MEM_WZ_ERR, None),
            },
            0x22 => {
                let addr = mem.allocate(d0.wrapping_add(4));
                if addr == 0 {
                    (MEM_FULL_ERR, Some(0))
                } else {
                    mem.write_u32b(addr, addr.wrapping_add(4))?;
                    (0, Some(addr))
                }
            }
            0x25 => {
                // A handle from NewHandle shares its block with its master pointer.
                let size = mem.read_u32b(a0).ok().and_then(|ptr| {
                    if ptr == a0.wrapping_add(4) {
                        mem.block_size(a0).ok().map(|size| size.saturating_sub(4))
                    } else {
                        mem.block_size(ptr).ok()
                    }
                });
                (size.map_or(MEM_WZ_ERR, |size| size as i32), None)
            }
            0x29 | 0x2A => (0, None),
            0x2E => {
                mem.memcpy(a1, a0, d0 as usize)?;
                (0, None)
            }
            0x46 => {
                let mut trap = (d0 & 0xFFFF) as u16;
                if trap > 0x4F && trap != 0x54 && trap != 0x57 {
                    trap |= 0x0800;
                }
                let stub = match self.trap_stubs.get(&trap) {
                    Some(&stub) => stub,
                    None => {
                        let stub = mem.allocate(4);
                        if stub == 0 {
                            return Err(EmulatorError::UnimplementedCall(format!(
                                "no memory for a trap {trap:03X} stub"
                            )));
                        }
                        mem.write_u16b(stub, 0xA000 | trap)?;
                        mem.write_u16b(stub + 2, 0x4E75)?;
                        self.trap_stubs.insert(trap, stub);
                        stub
                    }
                };
                debug!("GetTrapAddress({trap:03X}) => {stub:08X}");
                // D0 still holds the trap number on return
                (d0 as i32, Some(stub))
            }
            _ => {
                drop(mem);
                return self.unknown(format!("OS trap {number:02X} (flags={flags})"));
            }
        };
        drop(mem);

        let regs = emu.registers_mut();
        regs.d[0] = result as u32;
        if let Some(a0) = new_a0 {
            regs.a[0] = a0;
        }
        Ok(())
    }
}

pub type Win32Function = Box<dyn FnMut(&mut X86Emulator) -> EmuResult<u32>>;

/// Stands in for DLL imports: each import is a small stub that raises
/// `int 0xFF` with its own `"library.dll:Function"` name on the stack.
pub struct Win32StubEnvironment {
    functions: HashMap<String, Win32Function>,
}

impl Default for Win32StubEnvironment {
    fn default() -> Self {
        let mut env = Self {
            functions: HashMap::new(),
        };
        env.register("kernel32.dll:GetCurrentThreadId", Box::new(|_| Ok(0xEEEE_EEEE)));
        env
    }
}

impl Win32StubEnvironment {
    pub const CALL_VECTOR: u8 = 0xFF;
    const STUB_REGION_START: u32 = 0xF000_0000;
    const STUB_REGION_END: u32 = 0xFFFF_FFFF;

    pub fn new() -> Self {
        Self::default()
    }

    /// The function's return value lands in `eax`.
    pub fn register(&mut self, name: &str, function: Win32Function) {
        self.functions.insert(name.to_string(), function);
    }

    pub fn install(mut self, emu: &mut X86Emulator) {
        emu.set_syscall_handler(Box::new(move |emu, vector| self.handle(emu, vector)));
    }

    /// Write a stub for `name` high in memory and return its address, or 0
    /// if there is no room for it.
    ///
    /// ```text
    /// call +len(name)+1     ; pushes the address of the name
    /// db   name, 0
    /// int  0xFF
    /// add  esp, 4
    /// ret
    /// ```
    pub fn make_import_stub(emu: &X86Emulator, name: &str) -> EmuResult<u32> {
        let mut code = vec![0xE8];
        code.extend_from_slice(&(name.len() as u32 + 1).to_le_bytes());
        code.extend_from_slice(name.as_bytes());
        code.push(0);
        code.extend_from_slice(&[0xCD, Self::CALL_VECTOR, 0x83, 0xC4, 0x04, 0xC3]);

        let mut mem = emu.memory().borrow_mut();
        let addr = mem.allocate_within(
            Self::STUB_REGION_START,
            Self::STUB_REGION_END,
            code.len() as u32,
        );
        if addr != 0 {
            mem.write(addr, &code)?;
            debug!("import stub for {name} at {addr:08X}");
        }
        Ok(addr)
    }

    pub fn handle(&mut self, emu: &mut X86Emulator, vector: u8) -> EmuResult<()> {
        if vector != Self::CALL_VECTOR {
            return Err(EmulatorError::UnimplementedCall(format!(
                "unhandled interrupt {vector:02X}"
            )));
        }
        let name_addr = pop_u32(emu)?;
        let return_addr = pop_u32(emu)?;
        let name = emu.memory().borrow().read_cstring(name_addr)?;
        let Some(function) = self.functions.get_mut(&name) else {
            return Err(EmulatorError::UnimplementedCall(format!(
                "unhandled library call {name}"
            )));
        };
        debug!("{name} called from {return_addr:08X}");
        let result = function(emu)?;
        let regs = emu.registers_mut();
        regs.regs[EAX as usize] = result;
        regs.eip = return_addr;
        Ok(())
    }
}

fn pop_u32(emu: &mut X86Emulator) -> EmuResult<u32> {
    let esp = emu.registers().regs[ESP as usize];
    let value = emu.memory().borrow().read_u32l(esp)?;
    emu.registers_mut().regs[ESP as usize] = esp.wrapping_add(4);
    Ok(value)
}

/// PowerPC `sc` handler for code run by the decompression driver: the
/// return sentinel loads `r2 = -1` before its `sc`; anything else is a
/// genuine system call nobody implements.
pub fn ppc_terminate_on_sentinel(emu: &mut PpcEmulator, _trap: ()) -> EmuResult<()> {
    let r2 = emu.registers().r[2];
    if r2 == 0xFFFF_FFFF {
        Err(EmulatorError::Terminate)
    } else {
        Err(EmulatorError::UnimplementedCall(format!(
            "syscall at {:08X} with r2={r2:08X}",
            emu.pc()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emulator::shared, memory::AddressSpace};

    fn mac(code: &[u16]) -> M68kEmulator {
        let mut mem = AddressSpace::new();
        mem.allocate_at(0x1000, 0x100).unwrap();
        for (i, word) in code.iter().enumerate() {
            mem.write_u16b(0x1000 + 2 * i as u32, *word).unwrap();
        }
        mem.allocate_at(0x8000, 0x100).unwrap();
        let mut emu = M68kEmulator::new(shared(mem));
        emu.set_pc(0x1000);
        emu.set_stack_pointer(0x8100);
        emu
    }

    #[test]
    fn new_ptr_and_block_move() {
        let mut emu = mac(&[]);
        let mut env = MacToolboxEnvironment::new();
        emu.registers_mut().d[0] = 0x20;
        env.handle(&mut emu, 0xA11E).unwrap();
        let ptr = emu.registers().a[0];
        assert_ne!(ptr, 0);
        assert_eq!(emu.registers().d[0], 0);
        assert_eq!(emu.memory().borrow().block_size(ptr).unwrap(), 0x20);

        emu.memory().borrow_mut().write(0x1000, b"hello").unwrap();
        let regs = emu.registers_mut();
        regs.a[0] = 0x1000;
        regs.a[1] = ptr;
        regs.d[0] = 5;
        env.handle(&mut emu, 0xA02E).unwrap();
        assert_eq!(emu.memory().borrow().read(ptr, 5).unwrap(), b"hello");
    }

    #[test]
    fn handles_report_their_size() {
        let mut emu = mac(&[]);
        let mut env = MacToolboxEnvironment::new();
        emu.registers_mut().d[0] = 0x40;
        env.handle(&mut emu, 0xA122).unwrap();
        let handle = emu.registers().a[0];
        let master = emu.memory().borrow().read_u32b(handle).unwrap();
        assert_eq!(master, handle + 4);

        env.handle(&mut emu, 0xA029).unwrap();
        assert_eq!(emu.registers().d[0], 0);
        env.handle(&mut emu, 0xA025).unwrap();
        assert_eq!(emu.registers().d[0], 0x40);

        emu.registers_mut().a[0] = 0x12345678;
        env.handle(&mut emu, 0xA025).unwrap();
        assert_eq!(emu.registers().d[0] as i32, MEM_WZ_ERR);
    }

    #[test]
    fn unknown_traps_depend_on_leniency() {
        let mut emu = mac(&[]);
        let err = MacToolboxEnvironment::new()
            .handle(&mut emu, 0xA9F0)
            .unwrap_err();
        assert!(err.to_string().contains("toolbox trap 9F0"), "{err}");
        assert!(matches!(
            MacToolboxEnvironment::new().handle(&mut emu, 0x4E41),
            Err(EmulatorError::UnimplementedCall(_))
        ));
        MacToolboxEnvironment::lenient()
            .handle(&mut emu, 0xA9F0)
            .unwrap();
        MacToolboxEnvironment::lenient()
            .handle(&mut emu, 0xA0FF)
            .unwrap();
    }

    #[test]
    fn trap_address_stub_runs_from_fresh_memory() {
        let mut emu = mac(&[
            0x701E, // moveq #0x1e, d0
            0xA146, // GetTrapAddress
            0x7010, // moveq #0x10, d0
            0x4E90, // jsr (a0)
            0x4E70, // reset
        ]);
        MacToolboxEnvironment::new().install(&mut emu);
        emu.execute().unwrap();

        let regs = emu.registers();
        assert_eq!(regs.d[0], 0);
        assert_eq!(regs.pc, 0x100A);
        let mem = emu.memory().borrow();
        assert_eq!(mem.block_size(regs.a[0]).unwrap(), 0x10);
        let stub = mem
            .regions()
            .find(|r| r.logical_size() == 4)
            .map(|r| r.base())
            .unwrap();
        assert_eq!(mem.read(stub, 4).unwrap(), vec![0xA0, 0x1E, 0x4E, 0x75]);
    }

    #[test]
    fn trap_address_stubs_are_cached() {
        let mut emu = mac(&[]);
        let mut env = MacToolboxEnvironment::new();
        emu.registers_mut().d[0] = 0x1E;
        env.handle(&mut emu, 0xA146).unwrap();
        let first = emu.registers().a[0];
        assert_eq!(emu.registers().d[0], 0x1E);
        env.handle(&mut emu, 0xA146).unwrap();
        assert_eq!(emu.registers().a[0], first);

        // toolbox numbers get the toolbox bit
        emu.registers_mut().d[0] = 0x1F0;
        env.handle(&mut emu, 0xA146).unwrap();
        let stub = emu.registers().a[0];
        assert_eq!(emu.memory().borrow().read_u16b(stub).unwrap(), 0xA9F0);
    }

    fn win32_machine() -> X86Emulator {
        let mut mem = AddressSpace::new();
        mem.allocate_at(0x1000, 0x100).unwrap();
        mem.allocate_at(0x8000, 0x1000).unwrap();
        let mut emu = X86Emulator::new(shared(mem));
        emu.set_pc(0x1000);
        emu.set_stack_pointer(0x9000);
        emu
    }

    #[test]
    fn import_stub_calls_back_into_the_host() {
        let mut emu = win32_machine();
        let stub =
            Win32StubEnvironment::make_import_stub(&emu, "kernel32.dll:GetCurrentThreadId")
                .unwrap();
        assert!(stub >= 0xF000_0000);
        let rel = stub.wrapping_sub(0x1005);
        let mut call = vec![0xE8];
        call.extend_from_slice(&rel.to_le_bytes());
        emu.memory().borrow_mut().write(0x1000, &call).unwrap();

        Win32StubEnvironment::new().install(&mut emu);
        // call stub; call over the name; int 0xff
        emu.set_max_cycles(Some(3));
        emu.execute().unwrap();

        let regs = emu.registers();
        assert_eq!(regs.regs[EAX as usize], 0xEEEE_EEEE);
        assert_eq!(regs.eip, 0x1005);
        assert_eq!(regs.regs[ESP as usize], 0x9000);
    }

    #[test]
    fn unknown_imports_and_vectors_fail() {
        let mut emu = win32_machine();
        let name = 0x8800;
        emu.memory().borrow_mut().write(name, b"user32.dll:MessageBoxA\0").unwrap();
        emu.push_u32(0x1234).unwrap();
        emu.push_u32(name).unwrap();
        let mut env = Win32StubEnvironment::new();
        let err = env.handle(&mut emu, 0xFF).unwrap_err();
        assert!(err.to_string().contains("user32.dll:MessageBoxA"), "{err}");
        let err = env.handle(&mut emu, 0x21).unwrap_err();
        assert!(err.to_string().contains("unhandled interrupt 21"), "{err}");
    }

    #[test]
    fn registered_functions_are_dispatched_by_name() {
        let mut emu = win32_machine();
        emu.memory().borrow_mut().write(0x8800, b"a.dll:F\0").unwrap();
        emu.push_u32(0x1234).unwrap();
        emu.push_u32(0x8800).unwrap();
        let mut env = Win32StubEnvironment::new();
        env.register("a.dll:F", Box::new(|_| Ok(7)));
        env.handle(&mut emu, 0xFF).unwrap();
        assert_eq!(emu.registers().regs[EAX as usize], 7);
        assert_eq!(emu.pc(), 0x1234);
    }

    #[test]
    fn ppc_sentinel_terminates_only_on_minus_one() {
        let mut emu = PpcEmulator::new(shared(AddressSpace::new()));
        emu.registers_mut().r[2] = 0xFFFF_FFFF;
        assert!(matches!(
            ppc_terminate_on_sentinel(&mut emu, ()),
            Err(EmulatorError::Terminate)
        ));
        emu.registers_mut().r[2] = 0;
        assert!(matches!(
            ppc_terminate_on_sentinel(&mut emu, ()),
            Err(EmulatorError::UnimplementedCall(_))
        ));
    }
}
