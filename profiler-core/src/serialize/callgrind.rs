//! Callgrind-compatible text export (spec §6), readable by KCachegrind and
//! similar tools. Mirrors the subset of the format yappi's
//! `save(..., type="callgrind")` emits: a `fl=`/`fn=` header per function
//! with its self cost, followed by `cfl=`/`cfn=`/`calls=` blocks per callee.
//!
//! Costs are reported in microseconds. Internal ticks are nanoseconds in
//! both clock modes (spec §4.1), so the conversion is a plain division
//! rather than yappi's float-seconds-to-micros multiply; see DESIGN.md.

use std::collections::HashMap;
use std::io::Write;

use crate::error::Result;
use crate::stats::StatsStore;

const NANOS_PER_MICRO: u64 = 1_000;

fn ticks_to_micros(ticks: u64) -> u64 {
    ticks / NANOS_PER_MICRO
}

fn module_of(full_name: &str) -> &str {
    full_name.split_once(':').map(|(m, _)| m).unwrap_or(full_name)
}

fn name_of(full_name: &str) -> &str {
    full_name.rsplit_once(' ').map(|(_, n)| n).unwrap_or(full_name)
}

/// Assigns the `(N)` ids callgrind uses to avoid repeating a file or
/// function name at every reference; the full `name (N)` form is only
/// emitted the first time an id is interned.
struct IdTable {
    ids: HashMap<String, u64>,
    next: u64,
}

impl IdTable {
    fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next: 1,
        }
    }

    fn intern(&mut self, key: &str) -> (u64, bool) {
        if let Some(&id) = self.ids.get(key) {
            return (id, false);
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(key.to_string(), id);
        (id, true)
    }
}

pub fn write<W: Write>(store: &StatsStore, out: &mut W) -> Result<()> {
    let entries = store.raw_entries();

    writeln!(out, "version: 1")?;
    writeln!(out, "creator: profiler-core")?;
    writeln!(out, "pid: {}", std::process::id())?;
    writeln!(out, "cmd: profiler-cli")?;
    writeln!(out, "part: 1")?;
    writeln!(out, "positions: line")?;
    writeln!(out, "events: Ticks")?;
    writeln!(out)?;

    let mut files = IdTable::new();
    let mut funcs = IdTable::new();

    for entry in &entries {
        let (file_id, file_new) = files.intern(&entry.module);
        let (func_id, func_new) = funcs.intern(&entry.full_name);

        if file_new {
            writeln!(out, "fl=({file_id}) {}", entry.module)?;
        } else {
            writeln!(out, "fl=({file_id})")?;
        }
        if func_new {
            writeln!(
                out,
                "fn=({func_id}) {} {}:{}",
                entry.name, entry.module, entry.line_number
            )?;
        } else {
            writeln!(out, "fn=({func_id})")?;
        }
        writeln!(out, "{} {}", entry.line_number, ticks_to_micros(entry.tsub))?;

        for child in &entry.children {
            let child_module = module_of(&child.callee_full_name);
            let child_name = name_of(&child.callee_full_name);
            let (cfile_id, cfile_new) = files.intern(child_module);
            let (cfunc_id, cfunc_new) = funcs.intern(&child.callee_full_name);

            if cfile_new {
                writeln!(out, "cfl=({cfile_id}) {child_module}")?;
            } else {
                writeln!(out, "cfl=({cfile_id})")?;
            }
            if cfunc_new {
                writeln!(out, "cfn=({cfunc_id}) {child_name}")?;
            } else {
                writeln!(out, "cfn=({cfunc_id})")?;
            }
            writeln!(out, "calls={} 0", child.ncall)?;
            writeln!(out, "0 {}", ticks_to_micros(child.ttot))?;
        }
        writeln!(out)?;
    }

    Ok(())
}
