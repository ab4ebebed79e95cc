//! Native binary format: a direct bincode encoding of a [`StatsStore`]
//! snapshot, framed with a magic number and format version so `load`
//! rejects garbage or future-incompatible input up front (spec §6).
//!
//! bincode already length-prefixes every `Vec`, which is exactly the
//! "sequence of length-prefixed records" shape the save/load contract
//! calls for — see 0xMiden-miden-vm's use of bincode for its own
//! proof/trace artifacts (SPEC_FULL.md §G).

use serde::{Deserialize, Serialize};

use crate::clock::ClockMode;
use crate::error::{ProfilerError, Result};
use crate::stats::{ChildEdgeView, StatsEntryView, StatsStore};

const MAGIC: [u8; 4] = *b"PRF1";
const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct NativeChildEdge {
    callee_full_name: String,
    ncall: u64,
    nactualcall: u64,
    ttot: u64,
    tsub: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct NativeEntry {
    full_name: String,
    name: String,
    module: String,
    line_number: u32,
    is_builtin: bool,
    ncall: u64,
    nactualcall: u64,
    ttot: u64,
    tsub: u64,
    ctx_id: i64,
    ctx_name: String,
    tag: i64,
    children: Vec<NativeChildEdge>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NativeDocument {
    magic: [u8; 4],
    version: u16,
    clock_mode: u8,
    entries: Vec<NativeEntry>,
}

fn to_native(view: &StatsEntryView) -> NativeEntry {
    NativeEntry {
        full_name: view.full_name.clone(),
        name: view.name.clone(),
        module: view.module.clone(),
        line_number: view.line_number,
        is_builtin: view.is_builtin,
        ncall: view.ncall,
        nactualcall: view.nactualcall,
        ttot: view.ttot,
        tsub: view.tsub,
        ctx_id: view.ctx_id,
        ctx_name: view.ctx_name.clone(),
        tag: view.tag,
        children: view
            .children
            .iter()
            .map(|c: &ChildEdgeView| NativeChildEdge {
                callee_full_name: c.callee_full_name.clone(),
                ncall: c.ncall,
                nactualcall: c.nactualcall,
                ttot: c.ttot,
                tsub: c.tsub,
            })
            .collect(),
    }
}

fn from_native(entry: &NativeEntry) -> StatsEntryView {
    StatsEntryView {
        index: 0,
        full_name: entry.full_name.clone(),
        name: entry.name.clone(),
        module: entry.module.clone(),
        line_number: entry.line_number,
        is_builtin: entry.is_builtin,
        ncall: entry.ncall,
        nactualcall: entry.nactualcall,
        ttot: entry.ttot,
        tsub: entry.tsub,
        tavg: if entry.ncall == 0 {
            0.0
        } else {
            entry.ttot as f64 / entry.ncall as f64
        },
        ctx_id: entry.ctx_id,
        ctx_name: entry.ctx_name.clone(),
        tag: entry.tag,
        children: entry
            .children
            .iter()
            .map(|c| ChildEdgeView {
                callee_index: 0,
                callee_full_name: c.callee_full_name.clone(),
                ncall: c.ncall,
                nactualcall: c.nactualcall,
                ttot: c.ttot,
                tsub: c.tsub,
                tavg: if c.ncall == 0 {
                    0.0
                } else {
                    c.ttot as f64 / c.ncall as f64
                },
            })
            .collect(),
    }
}

pub fn encode(store: &StatsStore) -> Result<Vec<u8>> {
    let document = NativeDocument {
        magic: MAGIC,
        version: FORMAT_VERSION,
        clock_mode: store.clock_mode().as_tag(),
        entries: store.raw_entries().iter().map(to_native).collect(),
    };
    bincode::serialize(&document)
        .map_err(|e| ProfilerError::DecodeError(format!("failed to encode native stats: {e}")))
}

pub fn decode(bytes: &[u8]) -> Result<StatsStore> {
    let document: NativeDocument = bincode::deserialize(bytes)
        .map_err(|e| ProfilerError::DecodeError(format!("failed to decode native stats: {e}")))?;

    if document.magic != MAGIC {
        return Err(ProfilerError::DecodeError(
            "not a profiler native stats file (bad magic)".to_string(),
        ));
    }
    if document.version != FORMAT_VERSION {
        return Err(ProfilerError::DecodeError(format!(
            "unsupported native stats format version {}",
            document.version
        )));
    }
    let clock_mode = ClockMode::from_tag(document.clock_mode).ok_or_else(|| {
        ProfilerError::DecodeError(format!("unknown clock mode tag {}", document.clock_mode))
    })?;

    let views: Vec<StatsEntryView> = document.entries.iter().map(from_native).collect();
    Ok(StatsStore::from_entries(clock_mode, &views))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FunctionKey;

    #[test]
    fn round_trips_entries_and_child_edges() {
        let mut store = StatsStore::new(ClockMode::Cpu);
        let (f, _) = store.find_or_create(
            &FunctionKey {
                module: "mod".to_string(),
                name: "f".to_string(),
                line_number: 1,
                is_builtin: false,
            },
            0,
            "MainThread",
            -1,
        );
        let (g, _) = store.find_or_create(
            &FunctionKey {
                module: "mod".to_string(),
                name: "g".to_string(),
                line_number: 2,
                is_builtin: false,
            },
            0,
            "MainThread",
            -1,
        );
        store.get_mut_by_index(f).unwrap().ncall = 3;
        store.get_mut_by_index(f).unwrap().ttot = 300;
        store.get_mut_by_index(f).unwrap().child_edge_mut(g).ncall = 3;
        store.get_mut_by_index(f).unwrap().child_edge_mut(g).ttot = 100;

        let bytes = encode(&store).unwrap();
        let restored = decode(&bytes).unwrap();

        assert_eq!(restored.clock_mode(), ClockMode::Cpu);
        let f_restored = restored.get_by_full_name("mod:1 f").unwrap();
        assert_eq!(f_restored.ncall, 3);
        assert_eq!(f_restored.ttot, 300);
        let edge = f_restored
            .children
            .get(&restored.get_by_full_name("mod:2 g").unwrap().index)
            .unwrap();
        assert_eq!(edge.ncall, 3);
        assert_eq!(edge.ttot, 100);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let document = NativeDocument {
            magic: *b"XXXX",
            version: FORMAT_VERSION,
            clock_mode: ClockMode::Cpu.as_tag(),
            entries: Vec::new(),
        };
        let bytes = bincode::serialize(&document).unwrap();
        assert!(matches!(decode(&bytes), Err(ProfilerError::DecodeError(_))));
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let document = NativeDocument {
            magic: MAGIC,
            version: 9999,
            clock_mode: ClockMode::Cpu.as_tag(),
            entries: Vec::new(),
        };
        let bytes = bincode::serialize(&document).unwrap();
        assert!(matches!(decode(&bytes), Err(ProfilerError::DecodeError(_))));
    }

    #[test]
    fn empty_store_round_trips() {
        let store = StatsStore::new(ClockMode::Wall);
        let bytes = encode(&store).unwrap();
        let restored = decode(&bytes).unwrap();
        assert_eq!(restored.len(), 0);
        assert_eq!(restored.clock_mode(), ClockMode::Wall);
    }
}
