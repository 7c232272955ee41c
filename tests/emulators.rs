use rand::{Rng, SeedableRng, rngs::StdRng};

use resemu::{
    AddressSpace, Emulator, EmulatorError, TimeBase,
    m68k::{FLAG_C, FLAG_V, M68kEmulator},
    ppc::{PpcEmulator, XER_OV},
    shared,
    x86::{CF, OF, X86Emulator},
};

fn emulator_with_code<E: Emulator>(address: u32, code: &[u8]) -> E {
    let mut space = AddressSpace::new();
    space.allocate_at(address, code.len() as u32).unwrap();
    space.write(address, code).unwrap();
    let mut emu = E::new(shared(space));
    emu.set_pc(address);
    emu
}

fn be_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

#[test]
fn random_allocations_never_overlap() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut space = AddressSpace::new();
    let mut live: Vec<(u32, u32)> = Vec::new();

    for _ in 0..500 {
        if !live.is_empty() && rng.random_bool(0.3) {
            let (addr, _) = live.swap_remove(rng.random_range(0..live.len()));
            space.free(addr).unwrap();
            continue;
        }
        let size = rng.random_range(1..0x3000);
        let addr = space.allocate(size);
        assert_ne!(addr, 0);
        assert_eq!(space.block_size(addr).unwrap(), size);
        for &(other, other_size) in &live {
            let disjoint = addr as u64 + size as u64 <= other as u64
                || other as u64 + other_size as u64 <= addr as u64;
            assert!(disjoint, "{addr:08X}:{size:X} overlaps {other:08X}:{other_size:X}");
        }
        live.push((addr, size));
    }
}

#[test]
fn bounded_allocations_stay_in_range() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut space = AddressSpace::new();
    for _ in 0..64 {
        let size = rng.random_range(1..0x100);
        let addr = space.allocate_within(0xF000_0000, 0xF000_FFFF, size);
        assert!(addr >= 0xF000_0000);
        assert!(addr as u64 + size as u64 <= 0xF001_0000);
    }
    assert_eq!(space.allocate_within(0x100, 0x1FF, 0x200), 0);
}

#[test]
fn strict_mode_rejects_writes_past_the_requested_size() {
    let mut space = AddressSpace::new();
    space.allocate_at(0x4000, 0x10).unwrap();
    space.write_u8(0x4010, 1).unwrap();

    space.set_strict(true);
    space.write_u8(0x400F, 1).unwrap();
    assert!(space.write_u8(0x4010, 1).is_err());
    assert!(space.read(0x4008, 0x10).is_err());
}

#[test]
fn signed_overflow_without_carry_on_m68k() {
    // move.l #$7FFFFFFF,d0; moveq #1,d1; add.l d1,d0
    let code = [0x20, 0x3C, 0x7F, 0xFF, 0xFF, 0xFF, 0x72, 0x01, 0xD0, 0x81];
    let mut emu: M68kEmulator = emulator_with_code(0x1000, &code);
    for _ in 0..3 {
        emu.step().unwrap();
    }
    assert_eq!(emu.registers().d[0], 0x8000_0000);
    assert!(emu.registers().flag(FLAG_V));
    assert!(!emu.registers().flag(FLAG_C));
}

#[test]
fn signed_overflow_without_carry_on_ppc() {
    // lis r3,0x7FFF; ori r3,r3,0xFFFF; li r4,1; addo r5,r3,r4
    let code = be_words(&[0x3C60_7FFF, 0x6063_FFFF, 0x3880_0001, 0x7CA3_2614]);
    let mut emu: PpcEmulator = emulator_with_code(0x1000, &code);
    for _ in 0..4 {
        emu.step().unwrap();
    }
    let regs = emu.registers();
    assert_eq!(regs.r[5], 0x8000_0000);
    assert_ne!(regs.xer & XER_OV, 0);
}

#[test]
fn signed_overflow_without_carry_on_x86() {
    // mov eax,0x7FFFFFFF; add eax,1
    let code = [0xB8, 0xFF, 0xFF, 0xFF, 0x7F, 0x83, 0xC0, 0x01];
    let mut emu: X86Emulator = emulator_with_code(0x1000, &code);
    emu.step().unwrap();
    emu.step().unwrap();
    assert_eq!(emu.registers().regs[0], 0x8000_0000);
    assert!(emu.registers().flag(OF));
    assert!(!emu.registers().flag(CF));
}

#[test]
fn m68k_routine_returns_into_reset_sentinel() {
    // move.l #$2A,d0; rts; reset
    let code = [0x20, 0x3C, 0x00, 0x00, 0x00, 0x2A, 0x4E, 0x75, 0x4E, 0x70];
    let mut emu: M68kEmulator = emulator_with_code(0x1000, &code);
    let stack = emu.memory().borrow_mut().allocate(0x100);
    emu.set_stack_pointer(stack + 0x100);
    emu.push_u32(0x1008).unwrap();

    emu.execute().unwrap();
    assert_eq!(emu.registers().d[0], 0x2A);
    assert_eq!(emu.pc(), 0x100A);
    assert_eq!(emu.cycles(), 2);
}

#[test]
fn time_base_overrides_then_repeats() {
    let code: Vec<u8> = [0x0F, 0x31].repeat(4);
    let mut emu: X86Emulator = emulator_with_code(0x1000, &code);
    emu.set_time_base(TimeBase::with_overrides([0x10, 0x20, 0x30])).unwrap();
    let mut seen = Vec::new();
    for _ in 0..4 {
        emu.step().unwrap();
        seen.push(emu.registers().regs[0]);
    }
    assert_eq!(seen, [0x10, 0x20, 0x30, 0x30]);
}

#[test]
fn m68k_has_no_time_base() {
    let mut emu: M68kEmulator = emulator_with_code(0x1000, &[0x4E, 0x71]);
    assert!(matches!(
        emu.set_time_base(TimeBase::fixed(0)),
        Err(EmulatorError::UnsupportedBehavior(_))
    ));
}

fn state_round_trip<E: Emulator>(code: &[u8], steps: usize) {
    let mut emu: E = emulator_with_code(0x2000, code);
    for _ in 0..steps {
        emu.step().unwrap();
    }
    emu.memory().borrow_mut().set_symbol("start", 0x2000);
    let mut saved = Vec::new();
    emu.export_state(&mut saved).unwrap();

    let mut restored = E::new(shared(AddressSpace::new()));
    restored.import_state(&mut saved.as_slice()).unwrap();
    assert_eq!(restored.registers(), emu.registers());
    assert_eq!(*restored.memory().borrow(), *emu.memory().borrow());
    assert_eq!(restored.memory().borrow().symbol("start"), Some(0x2000));
}

#[test]
fn saved_state_round_trips_on_every_architecture() {
    state_round_trip::<M68kEmulator>(&[0x70, 0x05, 0x72, 0x07], 2);
    state_round_trip::<PpcEmulator>(&be_words(&[0x3860_0005, 0x3880_0007]), 2);
    state_round_trip::<X86Emulator>(&[0xB8, 5, 0, 0, 0, 0x43], 2);
}

#[test]
fn saved_state_cannot_cross_architectures() {
    let emu: PpcEmulator = emulator_with_code(0x2000, &[0; 4]);
    let mut saved = Vec::new();
    emu.export_state(&mut saved).unwrap();

    let mut other = X86Emulator::new(shared(AddressSpace::new()));
    let err = other.import_state(&mut saved.as_slice()).unwrap_err();
    assert!(matches!(err, EmulatorError::ArchitectureMismatch { .. }));
}
