//! Causal data-source tracking: for every value written, remember which
//! instruction produced it and which values that instruction consumed.

use std::{collections::HashMap, fmt, fmt::Write as _, str::FromStr};

use super::{decoder::OperandSize, display::register_name};
use crate::emulator::EmulatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// A whole 32-bit register; partial writes count as writes to it.
    Register(u8),
    Flags,
    /// One byte of guest memory.
    Memory(u32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Register(reg) => f.write_str(register_name(*reg, OperandSize::Dword)),
            Location::Flags => f.write_str("eflags"),
            Location::Memory(addr) => write!(f, "[{addr:08X}]"),
        }
    }
}

impl FromStr for Location {
    type Err = EmulatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "eflags" || lower == "flags" {
            return Ok(Location::Flags);
        }
        if let Some(reg) = (0..8).find(|&r| register_name(r, OperandSize::Dword) == lower) {
            return Ok(Location::Register(reg));
        }
        let digits = lower
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_start_matches("0x");
        u32::from_str_radix(digits, 16)
            .map(Location::Memory)
            .map_err(|_| EmulatorError::UnknownRegister(s.to_string()))
    }
}

#[derive(Debug, Clone)]
struct Producer {
    cycle: u64,
    address: u32,
    text: String,
    /// Each input with the cycle that last wrote it (`None` if it was never
    /// written during the run).
    inputs: Vec<(Location, Option<u64>)>,
}

#[derive(Debug, Default)]
pub struct DataSourceTracer {
    last_writer: HashMap<Location, u64>,
    producers: Vec<Producer>,
    written_by: HashMap<(Location, u64), usize>,
    reads: Vec<Location>,
    writes: Vec<Location>,
}

impl DataSourceTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&mut self, location: Location) {
        if !self.reads.contains(&location) {
            self.reads.push(location);
        }
    }

    pub fn record_write(&mut self, location: Location) {
        if !self.writes.contains(&location) {
            self.writes.push(location);
        }
    }

    /// Forget what the current instruction touched; it did not retire.
    pub fn discard(&mut self) {
        self.reads.clear();
        self.writes.clear();
    }

    /// Close out the instruction that just retired as cycle `cycle`.
    pub fn commit(&mut self, cycle: u64, address: u32, text: impl FnOnce() -> String) {
        if self.writes.is_empty() {
            self.reads.clear();
            return;
        }
        let inputs = self
            .reads
            .drain(..)
            .map(|loc| (loc, self.last_writer.get(&loc).copied()))
            .collect();
        let index = self.producers.len();
        self.producers.push(Producer {
            cycle,
            address,
            text: text(),
            inputs,
        });
        for loc in self.writes.drain(..) {
            self.written_by.insert((loc, cycle), index);
            self.last_writer.insert(loc, cycle);
        }
    }

    /// Render the producer tree of the current value of `location`.
    pub fn render(&self, location: Location, max_depth: usize) -> String {
        let mut out = String::new();
        let writer = self.last_writer.get(&location).copied();
        self.render_node(&mut out, &location.to_string(), location, writer, 0, max_depth);
        out
    }

    fn render_node(
        &self,
        out: &mut String,
        label: &str,
        location: Location,
        writer: Option<u64>,
        depth: usize,
        max_depth: usize,
    ) {
        let indent = "  ".repeat(depth);
        let producer = writer
            .and_then(|cycle| self.written_by.get(&(location, cycle)))
            .map(|&index| &self.producers[index]);
        let Some(producer) = producer else {
            let _ = writeln!(out, "{indent}{label} <- initial value");
            return;
        };
        let _ = writeln!(
            out,
            "{indent}{label} <- @{} {:08X} {}",
            producer.cycle, producer.address, producer.text
        );
        if depth >= max_depth {
            return;
        }
        for (label, location, writer) in group_inputs(&producer.inputs) {
            self.render_node(out, &label, location, writer, depth + 1, max_depth);
        }
    }
}

/// Merge runs of adjacent memory bytes with the same producer into one
/// `[ADDR:LEN]` entry.
fn group_inputs(inputs: &[(Location, Option<u64>)]) -> Vec<(String, Location, Option<u64>)> {
    let mut groups: Vec<(String, Location, Option<u64>)> = Vec::new();
    let mut run: Option<(u32, u32, Option<u64>)> = None;

    let flush = |run: &mut Option<(u32, u32, Option<u64>)>,
                 groups: &mut Vec<(String, Location, Option<u64>)>| {
        if let Some((start, len, writer)) = run.take() {
            let label = if len == 1 {
                Location::Memory(start).to_string()
            } else {
                format!("[{start:08X}:{len}]")
            };
            groups.push((label, Location::Memory(start), writer));
        }
    };

    for &(location, writer) in inputs {
        match location {
            Location::Memory(addr) => {
                if let Some((start, len, run_writer)) = run.as_mut()
                    && start.wrapping_add(*len) == addr
                    && *run_writer == writer
                {
                    *len += 1;
                    continue;
                }
                flush(&mut run, &mut groups);
                run = Some((addr, 1, writer));
            }
            other => {
                flush(&mut run, &mut groups);
                groups.push((other.to_string(), other, writer));
            }
        }
    }
    flush(&mut run, &mut groups);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_locations() {
        assert_eq!("EAX".parse::<Location>().unwrap(), Location::Register(0));
        assert_eq!("flags".parse::<Location>().unwrap(), Location::Flags);
        assert_eq!("[0x1000]".parse::<Location>().unwrap(), Location::Memory(0x1000));
        assert_eq!("2000".parse::<Location>().unwrap(), Location::Memory(0x2000));
        assert!("xmm0".parse::<Location>().is_err());
    }

    #[test]
    fn producers_chain_through_inputs() {
        let mut t = DataSourceTracer::new();
        // cycle 1: mov [1000], ecx (4 bytes)
        t.record_read(Location::Register(1));
        for a in 0x1000..0x1004 {
            t.record_write(Location::Memory(a));
        }
        t.commit(1, 0x400000, || "mov dword [0x00001000], ecx".into());
        // cycle 2: mov eax, [1000]
        for a in 0x1000..0x1004 {
            t.record_read(Location::Memory(a));
        }
        t.record_write(Location::Register(0));
        t.commit(2, 0x400006, || "mov eax, dword [0x00001000]".into());

        let text = t.render(Location::Register(0), 4);
        assert_eq!(
            text,
            "eax <- @2 00400006 mov eax, dword [0x00001000]\n\
             \x20\x20[00001000:4] <- @1 00400000 mov dword [0x00001000], ecx\n\
             \x20\x20\x20\x20ecx <- initial value\n"
        );
        assert_eq!(t.render(Location::Register(0), 0).lines().count(), 1);
    }

    #[test]
    fn discarded_instruction_leaves_no_trace() {
        let mut t = DataSourceTracer::new();
        t.record_write(Location::Register(3));
        t.discard();
        t.commit(1, 0, || unreachable!());
        assert_eq!(t.render(Location::Register(3), 2), "ebx <- initial value\n");
    }
}
