//! Decompressing classic Mac resources by running their decompressor.
//!
//! A compressed resource names a decompressor by id. The driver tries, in
//! order: a native implementation registered for that id, the `dcmp` and
//! `ncmp` supplied by the resource's own file, then the system's. External
//! decompressors run inside a fresh [`AddressSpace`] on the matching emulator.

use std::{cell::RefCell, collections::HashMap, fs, path::PathBuf, rc::Rc};

use anyhow::{Context, Result, bail, ensure};
use log::{debug, info, warn};

use crate::{
    debugger::{Debugger, DebuggerMode, DebuggerState},
    emulator::{Emulator, SharedMemory, shared},
    interrupts::InterruptQueue,
    m68k::M68kEmulator,
    memory::AddressSpace,
    ppc::PpcEmulator,
    syscall::{MacToolboxEnvironment, ppc_terminate_on_sentinel},
};

pub const COMPRESSED_RESOURCE_MAGIC: u32 = 0xA89F_6572;

pub const CODE_ADDRESS: u32 = 0xF000_0000;
const STACK_ADDRESS: u32 = 0x1000_0000;
const STACK_SIZE: u32 = 0x4000;
const OUTPUT_ADDRESS: u32 = 0x2000_0000;
const WORKING_ADDRESS: u32 = 0x8000_0000;
const INPUT_ADDRESS: u32 = 0xC000_0000;
const INPUT_PADDING: u32 = 0x100;

/// The 0x12-byte header at the start of every compressed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedResourceHeader {
    pub header_length: u16,
    pub header_version: u8,
    pub attributes: u8,
    pub decompressed_size: u32,
    pub decompressor_id: i16,
    pub output_extra_bytes: u16,
    /// Version 8 only.
    pub working_buffer_fraction: u8,
}

impl CompressedResourceHeader {
    pub const SIZE: usize = 0x12;

    /// `Ok(None)` when the magic number is missing: such resources are
    /// treated as not compressed at all.
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        ensure!(
            data.len() >= Self::SIZE,
            "resource marked as compressed but is too small ({} bytes)",
            data.len()
        );
        let u16_at = |offset: usize| u16::from_be_bytes([data[offset], data[offset + 1]]);
        let u32_at = |offset: usize| {
            u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
        };
        if u32_at(0) != COMPRESSED_RESOURCE_MAGIC {
            return Ok(None);
        }

        let attributes = data[7];
        ensure!(
            attributes & 0x01 != 0,
            "resource marked as compressed but does not have the compression attribute"
        );
        let header_version = data[6];
        let (decompressor_id, output_extra_bytes, working_buffer_fraction) = match header_version {
            8 => (u16_at(14) as i16, data[13] as u16, data[12]),
            9 => (u16_at(12) as i16, u16_at(14), 0),
            other => bail!("compressed resource header version {other} is not 8 or 9"),
        };
        Ok(Some(Self {
            header_length: u16_at(4),
            header_version,
            attributes,
            decompressed_size: u32_at(8),
            decompressor_id,
            output_extra_bytes,
            working_buffer_fraction,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceFlags {
    pub compressed: bool,
    pub decompressed: bool,
    pub decompression_failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resource {
    pub flags: ResourceFlags,
    pub data: Vec<u8>,
}

impl Resource {
    pub fn compressed(data: Vec<u8>) -> Self {
        Self {
            flags: ResourceFlags {
                compressed: true,
                ..ResourceFlags::default()
            },
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecompressorKind {
    /// 68K code resource.
    Dcmp,
    /// PowerPC code fragment.
    Ncmp,
}

impl DecompressorKind {
    fn four_cc(self) -> u32 {
        u32::from_be_bytes(match self {
            DecompressorKind::Dcmp => *b"dcmp",
            DecompressorKind::Ncmp => *b"ncmp",
        })
    }
}

/// An `ncmp` fragment already loaded and relocated for [`CODE_ADDRESS`].
/// Parsing the container it ships in is the caller's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpcFragment {
    pub image: Vec<u8>,
    /// Offset in `image` of the exported transition vector (entry pc, r2).
    pub transition_vector: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecompressorCode {
    M68k(Vec<u8>),
    Ppc(PpcFragment),
}

/// Somewhere decompressor code can be looked up by id.
pub trait DecompressorSource {
    fn find(&self, kind: DecompressorKind, id: i16) -> Option<DecompressorCode>;
}

/// Decompressors held in memory, e.g. the ones a resource file carries.
#[derive(Debug, Clone, Default)]
pub struct DecompressorSet {
    dcmp: HashMap<i16, Vec<u8>>,
    ncmp: HashMap<i16, PpcFragment>,
}

impl DecompressorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_dcmp(&mut self, id: i16, code: Vec<u8>) {
        self.dcmp.insert(id, code);
    }

    pub fn insert_ncmp(&mut self, id: i16, fragment: PpcFragment) {
        self.ncmp.insert(id, fragment);
    }
}

impl DecompressorSource for DecompressorSet {
    fn find(&self, kind: DecompressorKind, id: i16) -> Option<DecompressorCode> {
        match kind {
            DecompressorKind::Dcmp => self.dcmp.get(&id).cloned().map(DecompressorCode::M68k),
            DecompressorKind::Ncmp => self.ncmp.get(&id).cloned().map(DecompressorCode::Ppc),
        }
    }
}

/// System `dcmp`s stored as `dcmp_<id>.bin` files in one directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DecompressorSource for DirectorySource {
    fn find(&self, kind: DecompressorKind, id: i16) -> Option<DecompressorCode> {
        match kind {
            DecompressorKind::Dcmp => {
                let path = self.root.join(format!("dcmp_{id}.bin"));
                fs::read(&path).ok().map(DecompressorCode::M68k)
            }
            // System ncmps ship as fragment containers, which need a loader.
            DecompressorKind::Ncmp => None,
        }
    }
}

/// A decompressor implemented natively rather than emulated.
pub trait InternalDecompressor {
    /// `payload` is everything after the header.
    fn decompress(&self, header: &CompressedResourceHeader, payload: &[u8]) -> Result<Vec<u8>>;
}

impl<F> InternalDecompressor for F
where
    F: Fn(&CompressedResourceHeader, &[u8]) -> Result<Vec<u8>>,
{
    fn decompress(&self, header: &CompressedResourceHeader, payload: &[u8]) -> Result<Vec<u8>> {
        self(header, payload)
    }
}

/// System decompressors loaded so far, plus the native implementations.
/// Owned by the caller and passed to every [`decompress_resource`] call.
#[derive(Default)]
pub struct DecompressorCache {
    system: Option<Box<dyn DecompressorSource>>,
    loaded: HashMap<u64, Option<Rc<DecompressorCode>>>,
    internal: HashMap<i16, Box<dyn InternalDecompressor>>,
}

impl DecompressorCache {
    /// An empty cache. No native decompressors are built in: the classic
    /// system ids 0 through 3 only get an internal fast path if the caller
    /// registers one with [`register_internal`](Self::register_internal);
    /// otherwise they fall through to file and system `dcmp`/`ncmp` code.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(source: impl DecompressorSource + 'static) -> Self {
        Self {
            system: Some(Box::new(source)),
            ..Self::default()
        }
    }

    pub fn register_internal(&mut self, id: i16, decompressor: impl InternalDecompressor + 'static) {
        self.internal.insert(id, Box::new(decompressor));
    }

    pub fn has_internal(&self, id: i16) -> bool {
        self.internal.contains_key(&id)
    }

    pub fn system(&mut self, kind: DecompressorKind, id: i16) -> Option<Rc<DecompressorCode>> {
        let key = ((kind.four_cc() as u64) << 16) | id as u16 as u64;
        let system = &self.system;
        self.loaded
            .entry(key)
            .or_insert_with(|| {
                let code = system.as_ref()?.find(kind, id)?;
                debug!("loaded system {kind:?} {id}");
                Some(Rc::new(code))
            })
            .clone()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecompressFlags {
    pub disabled: bool,
    /// Try again even if an earlier attempt on this resource failed.
    pub retry: bool,
    pub trace_execution: bool,
    /// Single-step emulated decompressors in the debugger.
    pub debug_execution: bool,
    pub skip_internal: bool,
    pub skip_file_dcmp: bool,
    pub skip_file_ncmp: bool,
    pub skip_system_dcmp: bool,
    pub skip_system_ncmp: bool,
    pub max_cycles: Option<u64>,
}

enum Candidate {
    Internal,
    Code {
        origin: &'static str,
        code: Rc<DecompressorCode>,
    },
}

impl Candidate {
    fn describe(&self) -> String {
        match self {
            Candidate::Internal => "internal implementation".to_string(),
            Candidate::Code { origin, code } => match code.as_ref() {
                DecompressorCode::M68k(_) => format!("{origin} dcmp"),
                DecompressorCode::Ppc(_) => format!("{origin} ncmp"),
            },
        }
    }
}

/// Replace `resource.data` with its decompressed contents.
///
/// Resources without the compressed flag are left alone, as are ones whose
/// data lacks the compressed-resource magic (the flag is cleared instead).
pub fn decompress_resource(
    resource: &mut Resource,
    context: Option<&dyn DecompressorSource>,
    cache: &mut DecompressorCache,
    flags: &DecompressFlags,
) -> Result<()> {
    if !resource.flags.compressed || flags.disabled {
        return Ok(());
    }
    if resource.flags.decompression_failed && !flags.retry {
        return Ok(());
    }

    let Some(header) = CompressedResourceHeader::parse(&resource.data)? else {
        debug!("compressed flag set without the magic number; treating as uncompressed");
        resource.flags.compressed = false;
        return Ok(());
    };
    let id = header.decompressor_id;

    let mut candidates = Vec::new();
    if !flags.skip_internal && cache.has_internal(id) {
        candidates.push(Candidate::Internal);
    }
    if let Some(context) = context {
        for (kind, skip) in [
            (DecompressorKind::Dcmp, flags.skip_file_dcmp),
            (DecompressorKind::Ncmp, flags.skip_file_ncmp),
        ] {
            if skip {
                continue;
            }
            if let Some(code) = context.find(kind, id) {
                candidates.push(Candidate::Code {
                    origin: "file",
                    code: Rc::new(code),
                });
            }
        }
    }
    for (kind, skip) in [
        (DecompressorKind::Dcmp, flags.skip_system_dcmp),
        (DecompressorKind::Ncmp, flags.skip_system_ncmp),
    ] {
        if skip {
            continue;
        }
        if let Some(code) = cache.system(kind, id) {
            candidates.push(Candidate::Code {
                origin: "system",
                code,
            });
        }
    }

    if candidates.is_empty() {
        resource.flags.decompression_failed = true;
        bail!("no decompressors are available for decompressor id {id}");
    }
    info!(
        "decompressing with id {id} ({} implementation(s) available); {:#x} -> {:#x} bytes",
        candidates.len(),
        resource.data.len(),
        header.decompressed_size
    );

    let total = candidates.len();
    for (index, candidate) in candidates.iter().enumerate() {
        info!("attempt {} of {total}: {}", index + 1, candidate.describe());
        let attempt = match candidate {
            Candidate::Internal => run_internal(cache, &header, &resource.data),
            Candidate::Code { code, .. } => run_emulated(&header, code, &resource.data, flags),
        };
        match attempt {
            Ok(data) => {
                info!("{} succeeded", candidate.describe());
                resource.data = data;
                resource.flags.compressed = false;
                resource.flags.decompressed = true;
                resource.flags.decompression_failed = false;
                return Ok(());
            }
            Err(err) => warn!("{} failed: {err:#}", candidate.describe()),
        }
    }

    resource.flags.decompression_failed = true;
    bail!("no decompressor succeeded")
}

fn run_internal(
    cache: &DecompressorCache,
    header: &CompressedResourceHeader,
    data: &[u8],
) -> Result<Vec<u8>> {
    let Some(decompressor) = cache.internal.get(&header.decompressor_id) else {
        bail!("no internal decompressor {}", header.decompressor_id);
    };
    let output = decompressor.decompress(header, &data[CompressedResourceHeader::SIZE..])?;
    ensure!(
        output.len() == header.decompressed_size as usize,
        "internal decompressor produced the wrong amount of data ({:#x} bytes expected, {:#x} received)",
        header.decompressed_size,
        output.len()
    );
    Ok(output)
}

/// Where everything lives in the decompressor's address space.
struct Layout {
    input_size: u32,
    stack_end: u32,
}

fn prepare_memory(
    mem: &mut AddressSpace,
    header: &CompressedResourceHeader,
    data: &[u8],
) -> Result<Layout> {
    let data_len = u32::try_from(data.len()).context("resource is too large")?;
    let input_size = data_len
        .checked_add(INPUT_PADDING)
        .context("resource is too large")?;
    let output_size = header
        .decompressed_size
        .checked_add(header.output_extra_bytes as u32)
        .context("decompressed size is too large")?;
    let working_size = data_len
        .checked_mul(256)
        .context("resource is too large for a working buffer")?;

    for (name, address, size) in [
        ("stack", STACK_ADDRESS, STACK_SIZE),
        ("output", OUTPUT_ADDRESS, output_size),
        ("working", WORKING_ADDRESS, working_size),
        ("input", INPUT_ADDRESS, input_size),
    ] {
        mem.allocate_at_named(address, size.max(1), Some(name))
            .with_context(|| format!("cannot allocate {name} region"))?;
        debug!("{name} region at {address:08X}:{size:X}");
    }
    mem.write(INPUT_ADDRESS, data)?;
    Ok(Layout {
        input_size,
        stack_end: STACK_ADDRESS + STACK_SIZE,
    })
}

fn run_emulated(
    header: &CompressedResourceHeader,
    code: &DecompressorCode,
    data: &[u8],
    flags: &DecompressFlags,
) -> Result<Vec<u8>> {
    let mut mem = AddressSpace::new();
    let layout = prepare_memory(&mut mem, header, data)?;
    let memory = shared(mem);
    match code {
        DecompressorCode::M68k(bytes) => run_dcmp(&memory, header, &layout, bytes, flags)?,
        DecompressorCode::Ppc(fragment) => run_ncmp(&memory, header, &layout, fragment, flags)?,
    }
    let output = memory
        .borrow()
        .read(OUTPUT_ADDRESS, header.decompressed_size as usize)?;
    Ok(output)
}

fn load_code(memory: &SharedMemory, code: &[u8]) -> Result<()> {
    let size = u32::try_from(code.len()).context("decompressor is too large")?;
    let mut mem = memory.borrow_mut();
    mem.allocate_at_named(CODE_ADDRESS, size.max(1), Some("code"))
        .context("cannot allocate code region")?;
    mem.write(CODE_ADDRESS, code)?;
    debug!("loaded code at {CODE_ADDRESS:08X}:{size:X}");
    Ok(())
}

fn attach_debugger<E: Emulator>(emu: &mut E, flags: &DecompressFlags) {
    if !(flags.trace_execution || flags.debug_execution) {
        return;
    }
    let mode = if flags.debug_execution {
        DebuggerMode::Step
    } else {
        DebuggerMode::Trace
    };
    Debugger::new(DebuggerState {
        mode,
        ..DebuggerState::default()
    })
    .bind(emu);
}

fn execute<E: Emulator>(emu: &mut E, flags: &DecompressFlags) -> Result<()> {
    emu.set_max_cycles(flags.max_cycles);
    emu.execute()?;
    if let Some(max) = flags.max_cycles
        && emu.cycles() >= max
    {
        bail!("decompressor did not return within {max:#x} instructions");
    }
    info!("decompressor returned after {:#x} instructions", emu.cycles());
    Ok(())
}

fn run_dcmp(
    memory: &SharedMemory,
    header: &CompressedResourceHeader,
    layout: &Layout,
    code: &[u8],
    flags: &DecompressFlags,
) -> Result<()> {
    ensure!(code.len() >= 10, "decompressor resource is too short");
    // Either execution starts at byte 0 and bytes 4..8 read "dcmp", or the
    // second word is the offset of the entry point.
    let entry_offset = if &code[4..8] == b"dcmp" {
        0
    } else {
        u16::from_be_bytes([code[2], code[3]]) as u32
    };
    load_code(memory, code)?;

    // return address, four arguments, then the `reset` the return lands on
    let frame = layout.stack_end - 24;
    let source = INPUT_ADDRESS + CompressedResourceHeader::SIZE as u32;
    let data_size = layout.input_size - CompressedResourceHeader::SIZE as u32;
    let args = if header.header_version == 9 {
        [INPUT_ADDRESS, OUTPUT_ADDRESS, source, data_size]
    } else {
        [data_size, WORKING_ADDRESS, OUTPUT_ADDRESS, source]
    };
    {
        let mut mem = memory.borrow_mut();
        mem.write_u32b(frame, frame + 20)?;
        for (i, arg) in args.iter().enumerate() {
            mem.write_u32b(frame + 4 + 4 * i as u32, *arg)?;
        }
        mem.write_u16b(frame + 20, 0x4E70)?;
        mem.write_u16b(frame + 22, 0)?;
    }

    let mut emu = M68kEmulator::new(Rc::clone(memory));
    emu.set_pc(CODE_ADDRESS + entry_offset);
    emu.set_stack_pointer(frame);
    debug!("dcmp entry at {:08X}, stack at {frame:08X}", emu.pc());
    attach_debugger(&mut emu, flags);
    MacToolboxEnvironment::lenient().install(&mut emu);
    execute(&mut emu, flags)
}

fn run_ncmp(
    memory: &SharedMemory,
    header: &CompressedResourceHeader,
    layout: &Layout,
    fragment: &PpcFragment,
    flags: &DecompressFlags,
) -> Result<()> {
    load_code(memory, &fragment.image)?;
    let vector = CODE_ADDRESS.wrapping_add(fragment.transition_vector);
    let (entry_pc, entry_r2) = {
        let mem = memory.borrow();
        (mem.read_u32b(vector)?, mem.read_u32b(vector.wrapping_add(4))?)
    };
    debug!("ncmp entry pc is {entry_pc:08X} with r2 = {entry_r2:08X}");

    // saved r1, cr, lr, two reserved words, saved r2, two unused words, then
    // `li r2, -1; sc`, which the return lands on
    let frame = layout.stack_end - 40;
    let return_addr = frame + 32;
    {
        let mut mem = memory.borrow_mut();
        for (i, word) in [
            0xAAAA_AAAA,
            0,
            return_addr,
            0,
            0,
            entry_r2,
            0,
            0,
            0x3840_FFFF,
            0x4400_0002,
        ]
        .into_iter()
        .enumerate()
        {
            mem.write_u32b(frame + 4 * i as u32, word)?;
        }
    }

    let mut emu = PpcEmulator::new(Rc::clone(memory));
    emu.set_interrupt_source(Rc::new(RefCell::new(InterruptQueue::new())));
    {
        let regs = emu.registers_mut();
        regs.r[1] = frame;
        regs.r[2] = entry_r2;
        regs.r[3] = INPUT_ADDRESS + CompressedResourceHeader::SIZE as u32;
        regs.r[4] = OUTPUT_ADDRESS;
        regs.r[5] = if header.header_version == 9 {
            INPUT_ADDRESS
        } else {
            WORKING_ADDRESS
        };
        regs.r[6] = layout.input_size - CompressedResourceHeader::SIZE as u32;
        regs.lr = return_addr;
        regs.pc = entry_pc;
    }
    attach_debugger(&mut emu, flags);
    emu.set_syscall_handler(Box::new(ppc_terminate_on_sentinel));
    execute(&mut emu, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressed(version: u8, id: i16, decompressed_size: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = COMPRESSED_RESOURCE_MAGIC.to_be_bytes().to_vec();
        data.extend_from_slice(&0x12u16.to_be_bytes());
        data.push(version);
        data.push(0x01);
        data.extend_from_slice(&decompressed_size.to_be_bytes());
        if version == 9 {
            data.extend_from_slice(&id.to_be_bytes());
            data.extend_from_slice(&[0, 0, 0, 0]);
        } else {
            data.extend_from_slice(&[0, 0]);
            data.extend_from_slice(&id.to_be_bytes());
            data.extend_from_slice(&[0, 0]);
        }
        data.extend_from_slice(payload);
        data
    }

    /// bra.s to the copy loop, the "dcmp" tag, then: copy 8 bytes from the
    /// source argument to the destination argument and return.
    fn copying_dcmp(source_arg: i16, dest_arg: i16) -> Vec<u8> {
        let words: [u16; 14] = [
            0x6008, 0x0000, 0x6463, 0x6D70, 0x0000, // bra.s +8; "dcmp"
            0x226F, dest_arg as u16, // movea.l d(a7), a1
            0x206F, source_arg as u16, // movea.l d(a7), a0
            0x7007, // moveq #7, d0
            0x12D8, // move.b (a0)+, (a1)+
            0x51C8, 0xFFFC, // dbf d0, loop
            0x4E75, // rts
        ];
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    fn copying_ncmp() -> PpcFragment {
        let words = [
            0x38E0_0008, // li r7, 8
            0x7CE9_03A6, // mtctr r7
            0x3863_FFFF, // addi r3, r3, -1
            0x3884_FFFF, // addi r4, r4, -1
            0x8C03_0001, // lbzu r0, 1(r3)
            0x9C04_0001, // stbu r0, 1(r4)
            0x4200_FFF8, // bdnz loop
            0x4E80_0020, // blr
            CODE_ADDRESS,
            0x1234_5678,
        ];
        PpcFragment {
            image: words.iter().flat_map(|w: &u32| w.to_be_bytes()).collect(),
            transition_vector: 32,
        }
    }

    #[test]
    fn header_versions() {
        let v9 = CompressedResourceHeader::parse(&compressed(9, 2, 0x40, &[]))
            .unwrap()
            .unwrap();
        assert_eq!(v9.decompressor_id, 2);
        assert_eq!(v9.decompressed_size, 0x40);
        let v8 = CompressedResourceHeader::parse(&compressed(8, -3, 0x10, &[]))
            .unwrap()
            .unwrap();
        assert_eq!(v8.decompressor_id, -3);

        let mut bad_version = compressed(9, 2, 0x40, &[]);
        bad_version[6] = 7;
        assert!(CompressedResourceHeader::parse(&bad_version).is_err());
        let mut no_attribute = compressed(9, 2, 0x40, &[]);
        no_attribute[7] = 0;
        assert!(CompressedResourceHeader::parse(&no_attribute).is_err());
        assert!(CompressedResourceHeader::parse(&[0; 4]).is_err());
        assert_eq!(CompressedResourceHeader::parse(&[0; 0x20]).unwrap(), None);
    }

    #[test]
    fn internal_implementation_is_tried_first() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut cache = DecompressorCache::new();
        let seen = Rc::clone(&calls);
        cache.register_internal(
            2,
            move |header: &CompressedResourceHeader, payload: &[u8]| -> Result<Vec<u8>> {
                seen.borrow_mut().push(header.decompressor_id);
                Ok(payload.iter().rev().copied().collect())
            },
        );
        // This one would copy the payload forwards if it were ever run.
        let mut file = DecompressorSet::new();
        file.insert_dcmp(2, copying_dcmp(12, 8));

        let mut resource = Resource::compressed(compressed(9, 2, 8, b"ABCDEFGH"));
        decompress_resource(&mut resource, Some(&file), &mut cache, &DecompressFlags::default())
            .unwrap();

        assert_eq!(*calls.borrow(), vec![2]);
        assert_eq!(resource.data, b"HGFEDCBA");
        assert!(!resource.flags.compressed);
        assert!(resource.flags.decompressed);
    }

    #[test]
    fn system_ids_need_a_registered_internal_implementation() {
        let mut cache = DecompressorCache::new();
        assert!((0..4).all(|id| !cache.has_internal(id)));

        let mut resource = Resource::compressed(compressed(9, 0, 8, b"ABCDEFGH"));
        let err = decompress_resource(&mut resource, None, &mut cache, &DecompressFlags::default())
            .unwrap_err();
        assert!(err.to_string().contains("decompressor id 0"), "{err}");

        cache.register_internal(
            0,
            |_: &CompressedResourceHeader, payload: &[u8]| -> Result<Vec<u8>> {
                Ok(payload[..8].to_vec())
            },
        );
        assert!(cache.has_internal(0));
        let retry = DecompressFlags {
            retry: true,
            ..DecompressFlags::default()
        };
        decompress_resource(&mut resource, None, &mut cache, &retry).unwrap();
        assert_eq!(resource.data, b"ABCDEFGH");
    }

    #[test]
    fn wrong_sized_internal_output_falls_back_to_dcmp() {
        let mut cache = DecompressorCache::new();
        cache.register_internal(2, |_: &CompressedResourceHeader, _: &[u8]| -> Result<Vec<u8>> {
            Ok(vec![0; 3])
        });
        let mut file = DecompressorSet::new();
        // v9 frame: (a7) return, 4 header, 8 dest, 12 source, 16 size
        file.insert_dcmp(2, copying_dcmp(12, 8));

        let mut resource = Resource::compressed(compressed(9, 2, 8, b"ABCDEFGHxyz"));
        decompress_resource(&mut resource, Some(&file), &mut cache, &DecompressFlags::default())
            .unwrap();
        assert_eq!(resource.data, b"ABCDEFGH");
        assert!(resource.flags.decompressed);
    }

    #[test]
    fn version_8_frame_passes_working_buffer() {
        let mut system = DecompressorSet::new();
        // v8 frame: (a7) return, 4 size, 8 working, 12 dest, 16 source
        system.insert_dcmp(-1, copying_dcmp(16, 12));
        let mut cache = DecompressorCache::with_system(system);

        let mut resource = Resource::compressed(compressed(8, -1, 8, b"12345678"));
        decompress_resource(&mut resource, None, &mut cache, &DecompressFlags::default())
            .unwrap();
        assert_eq!(resource.data, b"12345678");
    }

    #[test]
    fn ncmp_runs_on_the_powerpc_emulator() {
        let mut file = DecompressorSet::new();
        file.insert_ncmp(5, copying_ncmp());
        let mut cache = DecompressorCache::new();
        let mut resource = Resource::compressed(compressed(9, 5, 8, b"powerpc!"));
        decompress_resource(&mut resource, Some(&file), &mut cache, &DecompressFlags::default())
            .unwrap();
        assert_eq!(resource.data, b"powerpc!");
    }

    #[test]
    fn missing_magic_clears_the_flag() {
        let mut resource = Resource::compressed(vec![0; 0x20]);
        decompress_resource(
            &mut resource,
            None,
            &mut DecompressorCache::new(),
            &DecompressFlags::default(),
        )
        .unwrap();
        assert!(!resource.flags.compressed);
        assert!(!resource.flags.decompressed);
        assert_eq!(resource.data, vec![0; 0x20]);
    }

    #[test]
    fn failures_are_remembered_until_retry() {
        let mut file = DecompressorSet::new();
        // An illegal instruction as the entry point.
        file.insert_dcmp(2, vec![0x4A, 0xFC, 0, 0, b'd', b'c', b'm', b'p', 0, 0]);
        let mut cache = DecompressorCache::new();
        let mut resource = Resource::compressed(compressed(9, 2, 8, b"ABCDEFGH"));
        let flags = DecompressFlags::default();

        let err = decompress_resource(&mut resource, Some(&file), &mut cache, &flags).unwrap_err();
        assert_eq!(err.to_string(), "no decompressor succeeded");
        assert!(resource.flags.decompression_failed);

        // skipped silently the second time
        decompress_resource(&mut resource, Some(&file), &mut cache, &flags).unwrap();
        assert!(resource.flags.compressed);

        let retry = DecompressFlags {
            retry: true,
            skip_file_dcmp: true,
            ..flags
        };
        let err = decompress_resource(&mut resource, Some(&file), &mut cache, &retry).unwrap_err();
        assert!(err.to_string().contains("no decompressors are available"), "{err}");
    }

    #[test]
    fn runaway_decompressors_are_cut_off() {
        let mut file = DecompressorSet::new();
        // bra.s to itself
        file.insert_dcmp(2, vec![0x60, 0xFE, 0, 0, b'd', b'c', b'm', b'p', 0, 0]);
        let mut resource = Resource::compressed(compressed(9, 2, 8, b"ABCDEFGH"));
        let flags = DecompressFlags {
            max_cycles: Some(0x100),
            ..DecompressFlags::default()
        };
        assert!(
            decompress_resource(&mut resource, Some(&file), &mut DecompressorCache::new(), &flags)
                .is_err()
        );
    }

    #[test]
    fn system_lookups_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dcmp_3.bin"), copying_dcmp(12, 8)).unwrap();
        let mut cache = DecompressorCache::with_system(DirectorySource::new(dir.path()));
        let first = cache.system(DecompressorKind::Dcmp, 3).unwrap();
        fs::remove_file(dir.path().join("dcmp_3.bin")).unwrap();
        let second = cache.system(DecompressorKind::Dcmp, 3).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert!(cache.system(DecompressorKind::Ncmp, 3).is_none());
        assert!(cache.system(DecompressorKind::Dcmp, 4).is_none());
    }
}
