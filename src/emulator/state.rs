//! Snapshot encoding shared by every emulator.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{Architecture, EmuResult, EmulatorError};
use crate::memory::{AddressSpace, AddressSpaceState};

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"RESEMU\0\x01";

#[derive(Serialize)]
struct SnapshotOut<'a, R> {
    registers: &'a R,
    memory: AddressSpaceState,
}

#[derive(Deserialize)]
struct SnapshotIn<R> {
    registers: R,
    memory: AddressSpaceState,
}

pub fn write_snapshot<R: Serialize>(
    out: &mut dyn Write,
    arch: Architecture,
    registers: &R,
    memory: &AddressSpace,
) -> EmuResult<()> {
    let payload = bincode::serde::encode_to_vec(
        SnapshotOut {
            registers,
            memory: memory.export_state(),
        },
        bincode::config::standard(),
    )
    .map_err(|err| EmulatorError::InvalidState(err.to_string()))?;

    out.write_all(SNAPSHOT_MAGIC)?;
    out.write_all(&[arch.tag()])?;
    out.write_all(&payload)?;
    Ok(())
}

pub fn read_snapshot<R: DeserializeOwned>(
    input: &mut dyn Read,
    expected: Architecture,
) -> EmuResult<(R, AddressSpace)> {
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;

    let Some(rest) = data.strip_prefix(SNAPSHOT_MAGIC.as_slice()) else {
        return Err(EmulatorError::InvalidState("bad snapshot magic".into()));
    };
    let Some((&tag, payload)) = rest.split_first() else {
        return Err(EmulatorError::InvalidState("truncated snapshot".into()));
    };
    let found = Architecture::from_tag(tag).ok_or_else(|| {
        EmulatorError::InvalidState(format!("unknown architecture tag {tag}"))
    })?;
    if found != expected {
        return Err(EmulatorError::ArchitectureMismatch { expected, found });
    }

    let (snapshot, _): (SnapshotIn<R>, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|err| EmulatorError::InvalidState(err.to_string()))?;
    let space = AddressSpace::import_state(snapshot.memory)
        .map_err(|err| EmulatorError::InvalidState(err.to_string()))?;
    Ok((snapshot.registers, space))
}
