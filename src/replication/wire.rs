//! Log entry encoding.
//!
//! Entries are JSON envelopes `{"version": N, "command": {...}}`. Decoding
//! checks the version before touching the command so that an entry from an
//! incompatible encoder is refused rather than misread.

use serde::{Deserialize, Serialize};

use super::Command;
use crate::error::ReplicationError;

/// Version written by [`marshal`].
pub const WIRE_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    command: &'a Command,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    command: serde_json::Value,
}

/// Encode a command as a log entry.
///
/// # Errors
///
/// Returns [`ReplicationError::Codec`] if the command cannot be serialized.
pub fn marshal(command: &Command) -> Result<Vec<u8>, ReplicationError> {
    serde_json::to_vec(&EnvelopeRef {
        version: WIRE_VERSION,
        command,
    })
    .map_err(ReplicationError::Codec)
}

/// Decode a log entry.
///
/// # Errors
///
/// Returns [`ReplicationError::UnsupportedVersion`] for entries written with
/// another version, or [`ReplicationError::Codec`] for malformed entries.
pub fn unmarshal(entry: &[u8]) -> Result<Command, ReplicationError> {
    let envelope: Envelope = serde_json::from_slice(entry).map_err(ReplicationError::Codec)?;
    if envelope.version != WIRE_VERSION {
        return Err(ReplicationError::UnsupportedVersion(envelope.version));
    }
    serde_json::from_value(envelope.command).map_err(ReplicationError::Codec)
}
