//! pstat-compatible export (spec §6), for tools that otherwise consume
//! Python's `pstats`-format dumps.
//!
//! yappi itself renders this format with `pickle`; pickle has no Rust
//! equivalent and isn't an idiom this codebase reaches for elsewhere, so
//! this is rendered as JSON instead — same field set, interoperable
//! tooling substitution. See DESIGN.md for this deviation.

use itertools::Itertools;
use serde::Serialize;

use crate::error::Result;
use crate::stats::StatsStore;

#[derive(Debug, Serialize)]
struct PstatChildEntry {
    callee: String,
    ncall: u64,
    nactualcall: u64,
    ttot: f64,
    tsub: f64,
}

#[derive(Debug, Clone, Serialize)]
struct PstatCallerEntry {
    caller: String,
    ncall: u64,
    nactualcall: u64,
    ttot: f64,
    tsub: f64,
}

#[derive(Debug, Serialize)]
struct PstatEntry {
    full_name: String,
    module: String,
    line_number: u32,
    name: String,
    ncall: u64,
    nactualcall: u64,
    ttot: f64,
    tsub: f64,
    children: Vec<PstatChildEntry>,
    /// Inverted from every other entry's child table (pstats' "callers"
    /// dict): who calls this function, rather than who it calls.
    callers: Vec<PstatCallerEntry>,
}

pub fn to_json(store: &StatsStore) -> Result<String> {
    let raw = store.raw_entries();

    // `pstats` keys its callers dict per-callee; build the inverse of the
    // child tables once up front rather than rescanning per entry.
    let callers_by_callee: std::collections::HashMap<&str, Vec<PstatCallerEntry>> = raw
        .iter()
        .flat_map(|caller| {
            caller.children.iter().map(move |child| {
                (
                    child.callee_full_name.as_str(),
                    PstatCallerEntry {
                        caller: caller.full_name.clone(),
                        ncall: child.ncall,
                        nactualcall: child.nactualcall,
                        ttot: crate::clock::Clock::ticks_to_seconds(child.ttot),
                        tsub: crate::clock::Clock::ticks_to_seconds(child.tsub),
                    },
                )
            })
        })
        .into_group_map();

    let entries: Vec<PstatEntry> = raw
        .iter()
        .map(|e| PstatEntry {
            full_name: e.full_name.clone(),
            module: e.module.clone(),
            line_number: e.line_number,
            name: e.name.clone(),
            ncall: e.ncall,
            nactualcall: e.nactualcall,
            ttot: crate::clock::Clock::ticks_to_seconds(e.ttot),
            tsub: crate::clock::Clock::ticks_to_seconds(e.tsub),
            children: e
                .children
                .iter()
                .map(|c| PstatChildEntry {
                    callee: c.callee_full_name.clone(),
                    ncall: c.ncall,
                    nactualcall: c.nactualcall,
                    ttot: crate::clock::Clock::ticks_to_seconds(c.ttot),
                    tsub: crate::clock::Clock::ticks_to_seconds(c.tsub),
                })
                .collect(),
            callers: callers_by_callee
                .get(e.full_name.as_str())
                .cloned()
                .unwrap_or_default(),
        })
        .collect();

    Ok(serde_json::to_string_pretty(&entries)?)
}
