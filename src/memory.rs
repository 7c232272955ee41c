use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Physical allocation granule. Logical sizes are rounded up to this, so guest
/// code can usually touch a little past the end of a block unless strict mode
/// is on.
pub const PAGE_SIZE: u32 = 0x1000;

/// Lowest address `allocate` will hand out; keeps the null page unmapped.
const ALLOCATION_FLOOR: u64 = 0x0000_1000;
const ADDRESS_SPACE_END: u64 = 0x1_0000_0000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("no region covers {addr:#010x}..{end:#x}", end = *addr as u64 + *size as u64)]
    Unmapped { addr: u32, size: usize },
    #[error("access {addr:#010x}..{end:#x} runs past the logical end of the region at {base:#010x} (strict mode)", end = *addr as u64 + *size as u64)]
    StrictViolation { addr: u32, size: usize, base: u32 },
    #[error("region {addr:#010x}:{size:#x} overlaps the region at {existing:#010x}")]
    Overlap { addr: u32, size: u32, existing: u32 },
    #[error("address overflow at {addr:#010x} (size {size:#x})")]
    AddressOverflow { addr: u32, size: u64 },
    #[error("no region starts at {addr:#010x}")]
    NoSuchRegion { addr: u32 },
    #[error("region {addr:#010x}:{size:#x} carries only {data_len:#x} bytes of data")]
    TruncatedRegion { addr: u32, size: u32, data_len: usize },
}

/// Something instruction bytes can be fetched from: the live address space
/// while executing, or a detached byte slice while disassembling.
pub trait CodeReader {
    fn read_u8(&self, addr: u32) -> Result<u8, MemoryError>;

    fn read_u16b(&self, addr: u32) -> Result<u16, MemoryError> {
        Ok(u16::from_be_bytes([self.read_u8(addr)?, self.read_u8(next(addr, 1)?)?]))
    }

    fn read_u16l(&self, addr: u32) -> Result<u16, MemoryError> {
        Ok(u16::from_le_bytes([self.read_u8(addr)?, self.read_u8(next(addr, 1)?)?]))
    }

    fn read_u32b(&self, addr: u32) -> Result<u32, MemoryError> {
        let hi = self.read_u16b(addr)? as u32;
        let lo = self.read_u16b(next(addr, 2)?)? as u32;
        Ok((hi << 16) | lo)
    }

    fn read_u32l(&self, addr: u32) -> Result<u32, MemoryError> {
        let lo = self.read_u16l(addr)? as u32;
        let hi = self.read_u16l(next(addr, 2)?)? as u32;
        Ok((hi << 16) | lo)
    }
}

fn next(addr: u32, delta: u32) -> Result<u32, MemoryError> {
    addr.checked_add(delta).ok_or(MemoryError::AddressOverflow {
        addr,
        size: delta as u64,
    })
}

/// Raw bytes positioned at a guest address, used by the pure disassemblers.
#[derive(Debug, Clone, Copy)]
pub struct CodeSlice<'a> {
    pub base: u32,
    pub bytes: &'a [u8],
}

impl<'a> CodeSlice<'a> {
    pub fn new(bytes: &'a [u8], base: u32) -> Self {
        Self { base, bytes }
    }

    pub fn end(&self) -> u64 {
        self.base as u64 + self.bytes.len() as u64
    }
}

impl CodeReader for CodeSlice<'_> {
    fn read_u8(&self, addr: u32) -> Result<u8, MemoryError> {
        addr.checked_sub(self.base)
            .and_then(|offset| self.bytes.get(offset as usize).copied())
            .ok_or(MemoryError::Unmapped { addr, size: 1 })
    }
}

/// One contiguous block of guest memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    base: u32,
    logical_size: u32,
    data: Vec<u8>,
    name: Option<String>,
}

impl Region {
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Size the block was requested with.
    pub fn logical_size(&self) -> u32 {
        self.logical_size
    }

    /// Size of the backing allocation (always >= the logical size).
    pub fn physical_size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn end(&self) -> u64 {
        self.base as u64 + self.data.len() as u64
    }

    fn logical_end(&self) -> u64 {
        self.base as u64 + self.logical_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub kind: AccessKind,
    pub addr: u32,
    pub size: usize,
}

impl fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
        };
        write!(f, "[memory] {verb} {:08X}:{:X}", self.addr, self.size)
    }
}

/// Serializable image of an address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpaceState {
    pub regions: Vec<Region>,
    pub symbols: BTreeMap<String, u32>,
    pub strict: bool,
}

/// The guest's emulated memory: non-overlapping regions plus a symbol table.
#[derive(Debug, Clone, Default)]
pub struct AddressSpace {
    regions: BTreeMap<u32, Region>,
    symbols: BTreeMap<String, u32>,
    strict: bool,
    access_log: Option<RefCell<Vec<MemoryAccess>>>,
}

impl PartialEq for AddressSpace {
    fn eq(&self, other: &Self) -> bool {
        self.regions == other.regions
            && self.symbols == other.symbols
            && self.strict == other.strict
    }
}

impl Eq for AddressSpace {}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session-wide strict mode: reject any access past a region's logical size.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn region_containing(&self, addr: u32) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| (addr as u64) < region.end())
    }

    /// Logical size of the block starting at `addr`.
    pub fn block_size(&self, addr: u32) -> Result<u32, MemoryError> {
        self.regions
            .get(&addr)
            .map(|region| region.logical_size)
            .ok_or(MemoryError::NoSuchRegion { addr })
    }

    /// Reserve `size` bytes anywhere. Returns 0 when nothing fits; guest code
    /// is expected to check for that.
    pub fn allocate(&mut self, size: u32) -> u32 {
        let addr = self
            .find_free(ALLOCATION_FLOOR, ADDRESS_SPACE_END, size as u64, PAGE_SIZE as u64)
            .unwrap_or(0);
        if addr != 0 {
            self.insert_region(addr, size, ADDRESS_SPACE_END, None);
        }
        debug!("allocate({size:#x}) => {addr:#010x}");
        addr
    }

    /// Reserve `size` bytes so that the block lies entirely inside
    /// `low..=high`. Returns 0 when nothing fits.
    pub fn allocate_within(&mut self, low: u32, high: u32, size: u32) -> u32 {
        let limit = high as u64 + 1;
        let addr = self
            .find_free(low.max(1) as u64, limit, size as u64, 4)
            .unwrap_or(0);
        if addr != 0 {
            self.insert_region(addr, size, limit, None);
        }
        debug!("allocate_within({low:#010x}, {high:#010x}, {size:#x}) => {addr:#010x}");
        addr
    }

    pub fn allocate_at(&mut self, addr: u32, size: u32) -> Result<(), MemoryError> {
        self.allocate_at_named(addr, size, None)
    }

    /// Reserve a fixed block. Fails if it overlaps the logical extent of any
    /// existing block; spare physical slack of a neighbour is reclaimed.
    pub fn allocate_at_named(
        &mut self,
        addr: u32,
        size: u32,
        name: Option<&str>,
    ) -> Result<(), MemoryError> {
        let end = addr as u64 + size.max(1) as u64;
        if end > ADDRESS_SPACE_END {
            return Err(MemoryError::AddressOverflow {
                addr,
                size: size as u64,
            });
        }

        let mut to_trim = Vec::new();
        for region in self.regions.values() {
            if region.base as u64 >= end {
                break;
            }
            if region.end() <= addr as u64 {
                continue;
            }
            let logical_end = region.logical_end().max(region.base as u64 + 1);
            if logical_end > addr as u64 {
                return Err(MemoryError::Overlap {
                    addr,
                    size,
                    existing: region.base,
                });
            }
            to_trim.push(region.base);
        }
        for base in to_trim {
            if let Some(region) = self.regions.get_mut(&base) {
                region.data.truncate((addr - base) as usize);
            }
        }

        self.insert_region(addr, size, ADDRESS_SPACE_END, name);
        debug!("allocate_at({addr:#010x}, {size:#x})");
        Ok(())
    }

    pub fn free(&mut self, addr: u32) -> Result<(), MemoryError> {
        self.regions
            .remove(&addr)
            .map(|_| ())
            .ok_or(MemoryError::NoSuchRegion { addr })
    }

    fn insert_region(&mut self, addr: u32, size: u32, limit: u64, name: Option<&str>) {
        let next_start = self
            .regions
            .range(addr..)
            .next()
            .map(|(base, _)| *base as u64)
            .unwrap_or(ADDRESS_SPACE_END);
        let rounded = (size.max(1) as u64).next_multiple_of(PAGE_SIZE as u64);
        let physical = rounded
            .min(next_start - addr as u64)
            .min(limit - addr as u64)
            .max(size as u64);
        self.regions.insert(
            addr,
            Region {
                base: addr,
                logical_size: size,
                data: vec![0u8; physical as usize],
                name: name.map(str::to_string),
            },
        );
    }

    fn find_free(&self, low: u64, limit: u64, size: u64, align: u64) -> Option<u32> {
        let size = size.max(1);
        let mut candidate = low.next_multiple_of(align);
        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if candidate + size <= region.base as u64 {
                break;
            }
            candidate = region.end().next_multiple_of(align);
        }
        (candidate + size <= limit && candidate + size <= ADDRESS_SPACE_END)
            .then_some(candidate as u32)
    }

    fn locate(&self, addr: u32, size: usize) -> Result<(u32, usize), MemoryError> {
        let Some(region) = self.region_containing(addr) else {
            debug!("unmapped access {addr:#010x}:{size:#x}");
            return Err(MemoryError::Unmapped { addr, size });
        };
        let end = addr as u64 + size as u64;
        if end > region.end() {
            return Err(MemoryError::Unmapped { addr, size });
        }
        if self.strict && end > region.logical_end() {
            return Err(MemoryError::StrictViolation {
                addr,
                size,
                base: region.base,
            });
        }
        Ok((region.base, (addr - region.base) as usize))
    }

    /// Bounds-checked view into one region's storage.
    pub fn view(&self, addr: u32, size: usize) -> Result<&[u8], MemoryError> {
        if size == 0 {
            return Ok(&[]);
        }
        let (base, offset) = self.locate(addr, size)?;
        self.record(AccessKind::Read, addr, size);
        Ok(&self.regions[&base].data[offset..offset + size])
    }

    pub fn view_mut(&mut self, addr: u32, size: usize) -> Result<&mut [u8], MemoryError> {
        if size == 0 {
            return Ok(&mut []);
        }
        let (base, offset) = self.locate(addr, size)?;
        self.record(AccessKind::Write, addr, size);
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(MemoryError::Unmapped { addr, size })?;
        Ok(&mut region.data[offset..offset + size])
    }

    pub fn exists(&self, addr: u32, size: usize) -> bool {
        self.locate(addr, size).is_ok()
    }

    pub fn read(&self, addr: u32, size: usize) -> Result<Vec<u8>, MemoryError> {
        Ok(self.view(addr, size)?.to_vec())
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.view_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_cstring(&self, addr: u32) -> Result<String, MemoryError> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        loop {
            let byte = self.read_u8(cursor)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = next(cursor, 1)?;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn memcpy(&mut self, dst: u32, src: u32, size: usize) -> Result<(), MemoryError> {
        let data = self.read(src, size)?;
        self.write(dst, &data)
    }

    pub fn memset(&mut self, addr: u32, value: u8, size: usize) -> Result<(), MemoryError> {
        self.view_mut(addr, size)?.fill(value);
        Ok(())
    }

    fn read_array<const N: usize>(&self, addr: u32) -> Result<[u8; N], MemoryError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.view(addr, N)?);
        Ok(out)
    }

    pub fn read_u8(&self, addr: u32) -> Result<u8, MemoryError> {
        Ok(self.read_array::<1>(addr)?[0])
    }

    pub fn read_u16b(&self, addr: u32) -> Result<u16, MemoryError> {
        Ok(u16::from_be_bytes(self.read_array(addr)?))
    }

    pub fn read_u16l(&self, addr: u32) -> Result<u16, MemoryError> {
        Ok(u16::from_le_bytes(self.read_array(addr)?))
    }

    pub fn read_u32b(&self, addr: u32) -> Result<u32, MemoryError> {
        Ok(u32::from_be_bytes(self.read_array(addr)?))
    }

    pub fn read_u32l(&self, addr: u32) -> Result<u32, MemoryError> {
        Ok(u32::from_le_bytes(self.read_array(addr)?))
    }

    pub fn read_u64b(&self, addr: u32) -> Result<u64, MemoryError> {
        Ok(u64::from_be_bytes(self.read_array(addr)?))
    }

    pub fn read_u64l(&self, addr: u32) -> Result<u64, MemoryError> {
        Ok(u64::from_le_bytes(self.read_array(addr)?))
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u16b(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_be_bytes())
    }

    pub fn write_u16l(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32b(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_be_bytes())
    }

    pub fn write_u32l(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64b(&mut self, addr: u32, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_be_bytes())
    }

    pub fn write_u64l(&mut self, addr: u32, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn set_symbol(&mut self, name: &str, addr: u32) {
        self.symbols.insert(name.to_string(), addr);
    }

    pub fn symbol(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }

    pub fn symbols(&self) -> &BTreeMap<String, u32> {
        &self.symbols
    }

    /// Reverse symbol table, used to label disassembly.
    pub fn labels(&self) -> BTreeMap<u32, String> {
        self.symbols
            .iter()
            .map(|(name, addr)| (*addr, name.clone()))
            .collect()
    }

    /// Start (or stop) recording every access for the debugger's memory log.
    pub fn set_access_logging(&mut self, enabled: bool) {
        self.access_log = enabled.then(|| RefCell::new(Vec::new()));
    }

    pub fn take_accesses(&self) -> Vec<MemoryAccess> {
        self.access_log
            .as_ref()
            .map(|log| std::mem::take(&mut *log.borrow_mut()))
            .unwrap_or_default()
    }

    fn record(&self, kind: AccessKind, addr: u32, size: usize) {
        if let Some(log) = &self.access_log {
            log.borrow_mut().push(MemoryAccess { kind, addr, size });
        }
    }

    pub fn export_state(&self) -> AddressSpaceState {
        AddressSpaceState {
            regions: self.regions.values().cloned().collect(),
            symbols: self.symbols.clone(),
            strict: self.strict,
        }
    }

    pub fn import_state(state: AddressSpaceState) -> Result<Self, MemoryError> {
        let mut space = AddressSpace {
            strict: state.strict,
            symbols: state.symbols,
            ..Self::default()
        };
        let mut previous: Option<(u32, u64)> = None;
        let mut regions = state.regions;
        regions.sort_by_key(|region| region.base);
        for region in regions {
            if let Some((existing, end)) = previous
                && (region.base as u64) < end
            {
                return Err(MemoryError::Overlap {
                    addr: region.base,
                    size: region.logical_size,
                    existing,
                });
            }
            if region.end() > ADDRESS_SPACE_END {
                return Err(MemoryError::AddressOverflow {
                    addr: region.base,
                    size: region.data.len() as u64,
                });
            }
            if region.data.len() < region.logical_size as usize {
                return Err(MemoryError::TruncatedRegion {
                    addr: region.base,
                    size: region.logical_size,
                    data_len: region.data.len(),
                });
            }
            previous = Some((region.base, region.end()));
            space.regions.insert(region.base, region);
        }
        Ok(space)
    }
}

impl CodeReader for AddressSpace {
    fn read_u8(&self, addr: u32) -> Result<u8, MemoryError> {
        AddressSpace::read_u8(self, addr)
    }

    fn read_u16b(&self, addr: u32) -> Result<u16, MemoryError> {
        AddressSpace::read_u16b(self, addr)
    }

    fn read_u16l(&self, addr: u32) -> Result<u16, MemoryError> {
        AddressSpace::read_u16l(self, addr)
    }

    fn read_u32b(&self, addr: u32) -> Result<u32, MemoryError> {
        AddressSpace::read_u32b(self, addr)
    }

    fn read_u32l(&self, addr: u32) -> Result<u32, MemoryError> {
        AddressSpace::read_u32l(self, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_never_overlap() {
        let mut mem = AddressSpace::new();
        let mut spans = Vec::new();
        for size in [4u32, 0x10, 0x1000, 0x1001, 1, 0x3000, 7] {
            let addr = mem.allocate(size);
            assert_ne!(addr, 0);
            spans.push((addr as u64, addr as u64 + size as u64));
        }
        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                assert!(a.1 <= b.0 || b.1 <= a.0, "{a:x?} overlaps {b:x?}");
            }
        }
    }

    #[test]
    fn allocate_within_respects_bounds() {
        let mut mem = AddressSpace::new();
        let addr = mem.allocate_within(0xF000_0000, 0xFFFF_FFFF, 0x20);
        assert!(addr >= 0xF000_0000);
        assert!(addr as u64 + 0x20 <= 0x1_0000_0000);

        let addr = mem.allocate_within(0x2000, 0x200F, 0x10);
        assert_eq!(addr, 0x2000);
        assert_eq!(mem.allocate_within(0x2000, 0x200F, 0x10), 0);
    }

    #[test]
    fn allocate_at_rejects_overlap() {
        let mut mem = AddressSpace::new();
        mem.allocate_at(0x1000, 0x100).unwrap();
        let err = mem.allocate_at(0x10F0, 0x20).unwrap_err();
        assert!(matches!(err, MemoryError::Overlap { existing: 0x1000, .. }));
        // Slack past the logical end of the first block can be reclaimed.
        mem.allocate_at(0x1800, 0x10).unwrap();
        assert_eq!(mem.region_containing(0x1000).unwrap().physical_size(), 0x800);
    }

    #[test]
    fn strict_mode_catches_reads_past_logical_size() {
        let mut mem = AddressSpace::new();
        let addr = mem.allocate(4);
        mem.write_u8(addr + 4, 0xAA).unwrap();

        mem.set_strict(true);
        let err = mem.write_u8(addr + 4, 0xAA).unwrap_err();
        assert!(matches!(err, MemoryError::StrictViolation { .. }));
        mem.write_u32b(addr, 0x1234_5678).unwrap();
    }

    #[test]
    fn unmapped_access_fails() {
        let mut mem = AddressSpace::new();
        mem.allocate_at(0x4000, 0x10).unwrap();
        assert!(mem.read_u32b(0x3FFE).is_err());
        assert!(mem.read_u32b(0x10).is_err());
        assert!(mem.view(0x4000, 0x2000).is_err());
    }

    #[test]
    fn byte_orders() {
        let mut mem = AddressSpace::new();
        mem.allocate_at(0x1000, 0x10).unwrap();
        mem.write_u32b(0x1000, 0x0102_0304).unwrap();
        assert_eq!(mem.read_u32l(0x1000).unwrap(), 0x0403_0201);
        assert_eq!(mem.read_u16b(0x1002).unwrap(), 0x0304);
        mem.write_u64l(0x1008, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem.read_u64b(0x1008).unwrap(), 0x8877_6655_4433_2211);
    }

    #[test]
    fn memcpy_memset_and_cstrings() {
        let mut mem = AddressSpace::new();
        mem.allocate_at(0x1000, 0x100).unwrap();
        mem.write(0x1000, b"hello\0").unwrap();
        mem.memcpy(0x1080, 0x1000, 6).unwrap();
        assert_eq!(mem.read_cstring(0x1080).unwrap(), "hello");
        mem.memset(0x1080, b'x', 3).unwrap();
        assert_eq!(mem.read_cstring(0x1080).unwrap(), "xxxlo");
    }

    #[test]
    fn state_round_trip() {
        let mut mem = AddressSpace::new();
        mem.allocate_at_named(0x2000, 0x30, Some("stack")).unwrap();
        let heap = mem.allocate(0x44);
        mem.write_u32b(heap, 0xDEAD_BEEF).unwrap();
        mem.set_symbol("entry", 0x2004);
        mem.set_strict(true);

        let restored = AddressSpace::import_state(mem.export_state()).unwrap();
        assert_eq!(restored, mem);
        assert_eq!(restored.symbol("entry"), Some(0x2004));
        assert_eq!(restored.block_size(heap).unwrap(), 0x44);
    }

    fn raw_region(base: u32, logical_size: u32, len: usize) -> Region {
        Region {
            base,
            logical_size,
            data: vec![0; len],
            name: None,
        }
    }

    fn import(regions: Vec<Region>) -> Result<AddressSpace, MemoryError> {
        AddressSpace::import_state(AddressSpaceState {
            regions,
            symbols: BTreeMap::new(),
            strict: false,
        })
    }

    #[test]
    fn import_names_the_broken_region() {
        assert!(matches!(
            import(vec![raw_region(0x1000, 0x20, 0x10)]),
            Err(MemoryError::TruncatedRegion {
                addr: 0x1000,
                size: 0x20,
                data_len: 0x10
            })
        ));
        assert!(matches!(
            import(vec![raw_region(0xFFFF_F000, 0x10, 0x2000)]),
            Err(MemoryError::AddressOverflow { addr: 0xFFFF_F000, .. })
        ));
        assert!(matches!(
            import(vec![raw_region(0x1000, 0x10, 0x1000), raw_region(0x1800, 0x10, 0x10)]),
            Err(MemoryError::Overlap {
                addr: 0x1800,
                existing: 0x1000,
                ..
            })
        ));
        let adjacent = vec![raw_region(0x1000, 0x10, 0x1000), raw_region(0x2000, 0x10, 0x10)];
        assert!(import(adjacent).is_ok());
    }

    #[test]
    fn access_log_records_reads_and_writes() {
        let mut mem = AddressSpace::new();
        mem.allocate_at(0x1000, 0x10).unwrap();
        mem.set_access_logging(true);
        mem.write_u16b(0x1000, 1).unwrap();
        mem.read_u8(0x1001).unwrap();
        let log = mem.take_accesses();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind, AccessKind::Write);
        assert_eq!(log[1].addr, 0x1001);
        assert!(mem.take_accesses().is_empty());
    }

    #[test]
    fn code_slice_reads() {
        let bytes = [0x4E, 0x75, 0x12, 0x34];
        let slice = CodeSlice::new(&bytes, 0x100);
        assert_eq!(slice.read_u16b(0x100).unwrap(), 0x4E75);
        assert_eq!(slice.read_u16l(0x102).unwrap(), 0x3412);
        assert!(slice.read_u16b(0x103).is_err());
    }
}
