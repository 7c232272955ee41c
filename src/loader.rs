//! Getting guest bytes into an address space before the first instruction
//! runs: segment descriptors from the command line and ELF `PT_LOAD` images.

use std::{fs, path::PathBuf, str::FromStr};

use anyhow::{Context, Error, Result, bail};
use goblin::elf::{Elf, header, program_header};
use log::debug;

use crate::{emulator::Architecture, memory::AddressSpace};

fn strip_hex_prefix(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text)
}

pub fn parse_hex_u32(text: &str) -> Result<u32> {
    u32::from_str_radix(strip_hex_prefix(text), 16)
        .with_context(|| format!("invalid 32-bit hex value {text:?}"))
}

pub fn parse_hex_u64(text: &str) -> Result<u64> {
    u64::from_str_radix(strip_hex_prefix(text), 16)
        .with_context(|| format!("invalid hex value {text:?}"))
}

/// Hex digits, optionally separated by whitespace, two per byte.
pub fn parse_hex_data(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        bail!("hex data {text:?} has an odd number of digits");
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).context("hex data is not ASCII")?;
            u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex byte {pair:?}"))
        })
        .collect()
}

/// Where a segment's initial contents come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentSource {
    Zeroed,
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// A block of guest memory to create before execution.
///
/// Text forms (all numbers hex):
///
/// * `ADDR:SIZE` zero-filled block
/// * `ADDR+FILE` block sized to the file
/// * `ADDR:SIZE+FILE` file contents truncated or zero-padded to `SIZE`
/// * `ADDR/DATA` block holding the given bytes
/// * `ADDR:SIZE/DATA` bytes truncated or zero-padded to `SIZE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDefinition {
    pub address: u32,
    pub size: Option<u32>,
    pub source: SegmentSource,
}

impl FromStr for SegmentDefinition {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let Some(split) = text.find([':', '+', '/']) else {
            bail!("segment {text:?} needs a size, a file or data after the address");
        };
        let address = parse_hex_u32(&text[..split])?;
        let mut rest = &text[split..];

        let mut size = None;
        if let Some(after_colon) = rest.strip_prefix(':') {
            let end = after_colon.find(['+', '/']).unwrap_or(after_colon.len());
            size = Some(parse_hex_u32(&after_colon[..end])?);
            rest = &after_colon[end..];
        }

        let source = if let Some(path) = rest.strip_prefix('+') {
            if path.is_empty() {
                bail!("segment {text:?} names an empty file");
            }
            SegmentSource::File(PathBuf::from(path))
        } else if let Some(data) = rest.strip_prefix('/') {
            SegmentSource::Bytes(parse_hex_data(data)?)
        } else if rest.is_empty() {
            SegmentSource::Zeroed
        } else {
            bail!("unexpected {rest:?} in segment {text:?}");
        };

        Ok(SegmentDefinition {
            address,
            size,
            source,
        })
    }
}

impl SegmentDefinition {
    /// The bytes this segment starts out with, already sized.
    pub fn contents(&self) -> Result<Vec<u8>> {
        let mut data = match &self.source {
            SegmentSource::Zeroed => Vec::new(),
            SegmentSource::Bytes(bytes) => bytes.clone(),
            SegmentSource::File(path) => fs::read(path)
                .with_context(|| format!("failed to read segment file {}", path.display()))?,
        };
        if let Some(size) = self.size {
            data.resize(size as usize, 0);
        }
        Ok(data)
    }

    pub fn apply(&self, mem: &mut AddressSpace) -> Result<()> {
        let data = self.contents()?;
        let Ok(size) = u32::try_from(data.len()) else {
            bail!("segment at {:#010x} is larger than the address space", self.address);
        };
        if size == 0 {
            bail!("segment at {:#010x} is empty", self.address);
        }
        mem.allocate_at(self.address, size)
            .with_context(|| format!("cannot place segment at {:#010x}", self.address))?;
        mem.write(self.address, &data)?;
        debug!("segment {:#010x}:{size:#x} loaded", self.address);
        Ok(())
    }
}

/// `ADDR/DATA`: bytes written over memory that already exists.
pub fn parse_patch(text: &str) -> Result<(u32, Vec<u8>)> {
    let Some((address, data)) = text.split_once('/') else {
        bail!("patch {text:?} must look like ADDR/HEXDATA");
    };
    Ok((parse_hex_u32(address)?, parse_hex_data(data)?))
}

/// `ADDR=NAME`
pub fn parse_symbol(text: &str) -> Result<(u32, String)> {
    let Some((address, name)) = text.split_once('=') else {
        bail!("symbol {text:?} must look like ADDR=NAME");
    };
    if name.is_empty() {
        bail!("symbol {text:?} has an empty name");
    }
    Ok((parse_hex_u32(address)?, name.to_string()))
}

/// `REG:VALUE`
pub fn parse_register_assignment(text: &str) -> Result<(String, u32)> {
    let Some((name, value)) = text.split_once(':') else {
        bail!("register assignment {text:?} must look like REG:VALUE");
    };
    Ok((name.to_string(), parse_hex_u32(value)?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedElf {
    pub entry: u32,
    pub architecture: Option<Architecture>,
    pub segments: usize,
}

/// Map every `PT_LOAD` segment of a 32-bit ELF image at its virtual address
/// and register the image's function symbols as labels.
pub fn load_elf(mem: &mut AddressSpace, file_bytes: &[u8]) -> Result<LoadedElf> {
    let elf = Elf::parse(file_bytes).context("failed to parse ELF image")?;
    if elf.is_64 {
        bail!("64-bit ELF images cannot be loaded into a 32-bit address space");
    }

    let architecture = match elf.header.e_machine {
        header::EM_68K => Some(Architecture::M68k),
        header::EM_PPC => Some(Architecture::Ppc32),
        header::EM_386 => Some(Architecture::X86),
        _ => None,
    };

    let mut segments = 0;
    for ph in &elf.program_headers {
        if ph.p_type != program_header::PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        if ph.p_memsz < ph.p_filesz {
            bail!(
                "Segment memsz ({}) smaller than filesz ({}) at vaddr {:#x}",
                ph.p_memsz,
                ph.p_filesz,
                ph.p_vaddr
            );
        }

        let offset = ph.p_offset as usize;
        let file_size = ph.p_filesz as usize;
        if offset
            .checked_add(file_size)
            .is_none_or(|end| end > file_bytes.len())
        {
            bail!(
                "Segment at offset {:#x} with size {:#x} exceeds file ({} bytes)",
                ph.p_offset,
                ph.p_filesz,
                file_bytes.len()
            );
        }

        let (Ok(vaddr), Ok(mem_size)) = (u32::try_from(ph.p_vaddr), u32::try_from(ph.p_memsz))
        else {
            bail!("Segment at vaddr {:#x} does not fit in 32 bits", ph.p_vaddr);
        };
        mem.allocate_at(vaddr, mem_size)
            .with_context(|| format!("cannot map segment at vaddr {vaddr:#x}"))?;
        mem.write(vaddr, &file_bytes[offset..offset + file_size])?;
        debug!("PT_LOAD {vaddr:#010x}:{mem_size:#x} ({file_size:#x} from file)");
        segments += 1;
    }
    if segments == 0 {
        bail!("ELF image has no loadable segments");
    }

    for sym in elf.syms.iter() {
        if sym.st_value == 0 || !sym.is_function() {
            continue;
        }
        if let Some(name) = elf.strtab.get_at(sym.st_name).filter(|n| !n.is_empty()) {
            mem.set_symbol(name, sym.st_value as u32);
        }
    }

    Ok(LoadedElf {
        entry: elf.entry as u32,
        architecture,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Big-endian ELF32 with one PT_LOAD segment of `code` at `vaddr`.
    fn tiny_elf(machine: u16, entry: u32, vaddr: u32, code: &[u8], mem_size: u32) -> Vec<u8> {
        let mut out = vec![0x7F, b'E', b'L', b'F', 1, 2, 1, 0];
        out.resize(16, 0);
        out.extend_from_slice(&2u16.to_be_bytes()); // ET_EXEC
        out.extend_from_slice(&machine.to_be_bytes());
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&entry.to_be_bytes());
        out.extend_from_slice(&52u32.to_be_bytes()); // phoff
        out.extend_from_slice(&0u32.to_be_bytes()); // shoff
        out.extend_from_slice(&0u32.to_be_bytes()); // flags
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&32u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&40u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        for word in [
            program_header::PT_LOAD,
            84,
            vaddr,
            vaddr,
            code.len() as u32,
            mem_size,
            program_header::PF_R | program_header::PF_X,
            0x1000,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(code);
        out
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(parse_hex_u32("0x1F").unwrap(), 0x1F);
        assert_eq!(parse_hex_u32("ffffffff").unwrap(), 0xFFFF_FFFF);
        assert!(parse_hex_u32("100000000").is_err());
        assert_eq!(parse_hex_u64("10000000000").unwrap(), 0x100_0000_0000);
        assert_eq!(parse_hex_data("4e 75 4E71").unwrap(), vec![0x4E, 0x75, 0x4E, 0x71]);
        assert!(parse_hex_data("4e7").is_err());
        assert!(parse_hex_data("zz").is_err());
    }

    #[test]
    fn descriptor_forms() {
        assert_eq!(
            "1000:20".parse::<SegmentDefinition>().unwrap(),
            SegmentDefinition {
                address: 0x1000,
                size: Some(0x20),
                source: SegmentSource::Zeroed
            }
        );
        assert_eq!(
            "2000+code.bin".parse::<SegmentDefinition>().unwrap().source,
            SegmentSource::File(PathBuf::from("code.bin"))
        );
        let sized_file: SegmentDefinition = "2000:10+/tmp/a:b".parse().unwrap();
        assert_eq!(sized_file.size, Some(0x10));
        assert_eq!(sized_file.source, SegmentSource::File(PathBuf::from("/tmp/a:b")));
        assert_eq!(
            "3000/4E75".parse::<SegmentDefinition>().unwrap().source,
            SegmentSource::Bytes(vec![0x4E, 0x75])
        );
        let padded: SegmentDefinition = "3000:8/4E75".parse().unwrap();
        assert_eq!(padded.contents().unwrap(), vec![0x4E, 0x75, 0, 0, 0, 0, 0, 0]);

        assert!("1000".parse::<SegmentDefinition>().is_err());
        assert!("xyz:10".parse::<SegmentDefinition>().is_err());
        assert!("1000:10?".parse::<SegmentDefinition>().is_err());
    }

    #[test]
    fn file_segments_are_truncated_or_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        fs::write(&path, [1, 2, 3, 4, 5, 6]).unwrap();

        let mut mem = AddressSpace::new();
        let whole: SegmentDefinition = format!("1000+{}", path.display()).parse().unwrap();
        whole.apply(&mut mem).unwrap();
        assert_eq!(mem.block_size(0x1000).unwrap(), 6);

        let short: SegmentDefinition = format!("2000:4+{}", path.display()).parse().unwrap();
        short.apply(&mut mem).unwrap();
        assert_eq!(mem.read(0x2000, 4).unwrap(), vec![1, 2, 3, 4]);

        let long: SegmentDefinition = format!("3000:8+{}", path.display()).parse().unwrap();
        long.apply(&mut mem).unwrap();
        assert_eq!(mem.read(0x3000, 8).unwrap(), vec![1, 2, 3, 4, 5, 6, 0, 0]);

        let missing: SegmentDefinition = "4000+/definitely/not/here".parse().unwrap();
        assert!(missing.apply(&mut mem).is_err());
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let mut mem = AddressSpace::new();
        "1000:100".parse::<SegmentDefinition>().unwrap().apply(&mut mem).unwrap();
        let err = "1080:10"
            .parse::<SegmentDefinition>()
            .unwrap()
            .apply(&mut mem)
            .unwrap_err();
        assert!(err.to_string().contains("cannot place segment"), "{err:#}");
    }

    #[test]
    fn small_parsers() {
        assert_eq!(parse_patch("1004/4E71").unwrap(), (0x1004, vec![0x4E, 0x71]));
        assert!(parse_patch("1004").is_err());
        assert_eq!(parse_symbol("1000=entry").unwrap(), (0x1000, "entry".to_string()));
        assert!(parse_symbol("1000=").is_err());
        assert_eq!(
            parse_register_assignment("d0:2A").unwrap(),
            ("d0".to_string(), 0x2A)
        );
    }

    #[test]
    fn elf_segments_land_at_their_vaddr() {
        let image = tiny_elf(header::EM_68K, 0x2000, 0x2000, &[0x70, 0x2A, 0x4E, 0x75], 0x10);
        let mut mem = AddressSpace::new();
        let loaded = load_elf(&mut mem, &image).unwrap();
        assert_eq!(loaded.entry, 0x2000);
        assert_eq!(loaded.architecture, Some(Architecture::M68k));
        assert_eq!(loaded.segments, 1);
        assert_eq!(mem.read(0x2000, 4).unwrap(), vec![0x70, 0x2A, 0x4E, 0x75]);
        // bss tail is zeroed
        assert_eq!(mem.read(0x2004, 0xC).unwrap(), vec![0; 0xC]);
    }

    #[test]
    fn elf_with_bad_sizes_is_rejected() {
        let image = tiny_elf(header::EM_PPC, 0x2000, 0x2000, &[0; 8], 4);
        let mut mem = AddressSpace::new();
        let err = load_elf(&mut mem, &image).unwrap_err();
        assert!(err.to_string().contains("smaller than filesz"), "{err}");
        assert!(load_elf(&mut mem, b"not an elf").is_err());
    }
}
