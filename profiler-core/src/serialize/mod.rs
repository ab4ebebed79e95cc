//! Stats serialization (spec §6): a native bincode format for
//! save/load round-trips, a Callgrind-compatible text export, and a
//! pstat-compatible rendition for interop with external analysis tools.

pub mod callgrind;
pub mod native;
pub mod pstat;

use crate::error::{ProfilerError, Result};
use crate::stats::StatsStore;

/// The output formats `save` recognizes (spec §6 `-f native|callgrind|pstat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeFormat {
    Native,
    Callgrind,
    Pstat,
}

impl SerializeFormat {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "native" => Ok(SerializeFormat::Native),
            "callgrind" => Ok(SerializeFormat::Callgrind),
            "pstat" => Ok(SerializeFormat::Pstat),
            other => Err(ProfilerError::NotSupported(format!(
                "unknown serialization format '{other}' (expected native, callgrind, or pstat)"
            ))),
        }
    }
}

/// Encodes `store` in `format`, the single entry point the spec's §6 `-f`
/// flag and any future save API should go through — the one place an
/// unrecognized format name actually surfaces [`ProfilerError::NotSupported`]
/// (spec §7), rather than each caller hand-rolling its own format match.
pub fn encode(store: &StatsStore, format: SerializeFormat) -> Result<Vec<u8>> {
    match format {
        SerializeFormat::Native => native::encode(store),
        SerializeFormat::Callgrind => {
            let mut buf = Vec::new();
            callgrind::write(store, &mut buf)?;
            Ok(buf)
        }
        SerializeFormat::Pstat => Ok(pstat::to_json(store)?.into_bytes()),
    }
}
