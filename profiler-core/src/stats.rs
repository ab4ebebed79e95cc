//! The function-stat table and embedded caller→callee child tables
//! (spec §3, §4.6).

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::clock::ClockMode;
use crate::error::{ProfilerError, Result};
use crate::ordered_map::OrderedMap;

/// Identifies a callable for aggregation purposes (spec §3: "full name").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionKey {
    pub module: String,
    pub name: String,
    pub line_number: u32,
    pub is_builtin: bool,
}

impl FunctionKey {
    pub fn full_name(&self) -> String {
        full_name(self.is_builtin, &self.module, self.line_number, &self.name)
    }
}

/// `"<module>:<lineno> <name>"` for interpreted functions, `"<module>.<name>"`
/// for native/builtin ones (spec §3).
pub fn full_name(is_builtin: bool, module: &str, line_number: u32, name: &str) -> String {
    if is_builtin {
        format!("{module}.{name}")
    } else {
        format!("{module}:{line_number} {name}")
    }
}

#[derive(Debug, Clone)]
pub struct ChildEdge {
    pub callee_index: u64,
    pub ncall: u64,
    pub nactualcall: u64,
    pub ttot: u64,
    pub tsub: u64,
}

impl ChildEdge {
    fn new(callee_index: u64) -> Self {
        Self {
            callee_index,
            ncall: 0,
            nactualcall: 0,
            ttot: 0,
            tsub: 0,
        }
    }

    pub fn tavg(&self) -> f64 {
        if self.ncall == 0 {
            0.0
        } else {
            self.ttot as f64 / self.ncall as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsEntry {
    pub index: u64,
    pub full_name: String,
    pub name: String,
    pub module: String,
    pub line_number: u32,
    pub is_builtin: bool,
    pub ncall: u64,
    pub nactualcall: u64,
    pub ttot: u64,
    pub tsub: u64,
    pub ctx_id: i64,
    pub ctx_name: String,
    pub tag: i64,
    pub(crate) children: OrderedMap<u64, ChildEdge>,
}

impl StatsEntry {
    pub fn tavg(&self) -> f64 {
        if self.ncall == 0 {
            0.0
        } else {
            self.ttot as f64 / self.ncall as f64
        }
    }

    /// A function is "recursive" if at least one of its entries was a
    /// re-entry (see §4.5 step 2). Mirrors `YFuncStat.is_recursive`.
    pub fn is_recursive(&self) -> bool {
        self.nactualcall != 0 && self.ncall != self.nactualcall
    }

    pub(crate) fn child_edge_mut(&mut self, callee_index: u64) -> &mut ChildEdge {
        self.children
            .entry_or_insert_with(callee_index, || ChildEdge::new(callee_index))
    }
}

/// Owned, read-only snapshot of a [`StatsEntry`] plus its child edges,
/// resolved to the callees' full names. Returned by [`StatsStore::iterate`]
/// so callers aren't tied to the store's internal borrow.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEdgeView {
    pub callee_index: u64,
    pub callee_full_name: String,
    pub ncall: u64,
    pub nactualcall: u64,
    pub ttot: u64,
    pub tsub: u64,
    pub tavg: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsEntryView {
    pub index: u64,
    pub full_name: String,
    pub name: String,
    pub module: String,
    pub line_number: u32,
    pub is_builtin: bool,
    pub ncall: u64,
    pub nactualcall: u64,
    pub ttot: u64,
    pub tsub: u64,
    pub tavg: f64,
    pub ctx_id: i64,
    pub ctx_name: String,
    pub tag: i64,
    pub children: Vec<ChildEdgeView>,
}

impl StatsEntryView {
    pub fn is_recursive(&self) -> bool {
        self.nactualcall != 0 && self.ncall != self.nactualcall
    }

    /// Rewrites `module` to its basename and recomputes `full_name`
    /// (recovered from yappi's `YFuncStat.strip_dirs`; see SPEC_FULL.md §F).
    pub fn strip_dirs(mut self) -> Self {
        self.module = std::path::Path::new(&self.module)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(self.module);
        self.full_name = full_name(self.is_builtin, &self.module, self.line_number, &self.name);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsFilter {
    pub name: Option<String>,
    pub module: Option<String>,
    pub ctx_id: Option<i64>,
    pub ctx_name: Option<String>,
    pub tag: Option<i64>,
    pub min_ttot: Option<u64>,
    pub min_tsub: Option<u64>,
    pub min_ncall: Option<u64>,
    pub strip_dirs: bool,
}

impl StatsFilter {
    fn matches(&self, entry: &StatsEntry) -> bool {
        if let Some(name) = &self.name {
            if &entry.name != name {
                return false;
            }
        }
        if let Some(module) = &self.module {
            if &entry.module != module {
                return false;
            }
        }
        if let Some(ctx_id) = self.ctx_id {
            if entry.ctx_id != ctx_id {
                return false;
            }
        }
        if let Some(ctx_name) = &self.ctx_name {
            if &entry.ctx_name != ctx_name {
                return false;
            }
        }
        if let Some(tag) = self.tag {
            if entry.tag != tag {
                return false;
            }
        }
        if let Some(min_ttot) = self.min_ttot {
            if entry.ttot < min_ttot {
                return false;
            }
        }
        if let Some(min_tsub) = self.min_tsub {
            if entry.tsub < min_tsub {
                return false;
            }
        }
        if let Some(min_ncall) = self.min_ncall {
            if entry.ncall < min_ncall {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Ncall,
    Ttot,
    Tsub,
    Tavg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// The function-stat table: indexes every observed [`StatsEntry`] by both
/// its dense integer index and its full name (spec §4.6, invariants I5/I6).
#[derive(Debug, Clone)]
pub struct StatsStore {
    clock_mode: ClockMode,
    by_index: OrderedMap<u64, StatsEntry>,
    index_of_full_name: HashMap<String, u64>,
    next_index: u64,
}

impl StatsStore {
    pub fn new(clock_mode: ClockMode) -> Self {
        Self {
            clock_mode,
            by_index: OrderedMap::new(),
            index_of_full_name: HashMap::new(),
            next_index: 0,
        }
    }

    pub fn clock_mode(&self) -> ClockMode {
        self.clock_mode
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Looks up `key`'s entry, creating it (with a fresh, store-unique
    /// index — invariant I5) on first observation. Returns the index and
    /// whether it was just created.
    pub fn find_or_create(
        &mut self,
        key: &FunctionKey,
        ctx_id: i64,
        ctx_name: &str,
        tag: i64,
    ) -> (u64, bool) {
        let full_name = key.full_name();
        if let Some(&index) = self.index_of_full_name.get(&full_name) {
            return (index, false);
        }

        let index = self.next_index;
        self.next_index += 1;

        let entry = StatsEntry {
            index,
            full_name: full_name.clone(),
            name: key.name.clone(),
            module: key.module.clone(),
            line_number: key.line_number,
            is_builtin: key.is_builtin,
            ncall: 0,
            nactualcall: 0,
            ttot: 0,
            tsub: 0,
            ctx_id,
            ctx_name: ctx_name.to_string(),
            tag,
            children: OrderedMap::new(),
        };
        self.index_of_full_name.insert(full_name, index);
        self.by_index.put(index, entry);
        (index, true)
    }

    pub fn get_by_index(&self, index: u64) -> Option<&StatsEntry> {
        self.by_index.get(&index)
    }

    pub(crate) fn get_mut_by_index(&mut self, index: u64) -> Option<&mut StatsEntry> {
        self.by_index.get_mut(&index)
    }

    pub fn get_by_full_name(&self, full_name: &str) -> Option<&StatsEntry> {
        let index = *self.index_of_full_name.get(full_name)?;
        self.by_index.get(&index)
    }

    pub fn clear(&mut self) {
        self.by_index.clear();
        self.index_of_full_name.clear();
        self.next_index = 0;
    }

    fn resolve_full_name(&self, index: u64) -> String {
        self.by_index
            .get(&index)
            .map(|e| e.full_name.clone())
            .unwrap_or_default()
    }

    fn to_view(&self, e: &StatsEntry, strip_dirs: bool) -> StatsEntryView {
        let children = e
            .children
            .iter()
            .map(|(_, edge)| ChildEdgeView {
                callee_index: edge.callee_index,
                callee_full_name: self.resolve_full_name(edge.callee_index),
                ncall: edge.ncall,
                nactualcall: edge.nactualcall,
                ttot: edge.ttot,
                tsub: edge.tsub,
                tavg: edge.tavg(),
            })
            .collect();
        let view = StatsEntryView {
            index: e.index,
            full_name: e.full_name.clone(),
            name: e.name.clone(),
            module: e.module.clone(),
            line_number: e.line_number,
            is_builtin: e.is_builtin,
            ncall: e.ncall,
            nactualcall: e.nactualcall,
            ttot: e.ttot,
            tsub: e.tsub,
            tavg: e.tavg(),
            ctx_id: e.ctx_id,
            ctx_name: e.ctx_name.clone(),
            tag: e.tag,
            children,
        };
        if strip_dirs {
            view.strip_dirs()
        } else {
            view
        }
    }

    pub fn iterate(
        &self,
        filter: &StatsFilter,
        predicate: Option<&dyn Fn(&StatsEntry) -> bool>,
        sort_key: SortKey,
        sort_order: SortOrder,
    ) -> Vec<StatsEntryView> {
        let mut views: Vec<StatsEntryView> = self
            .by_index
            .values()
            .filter(|e| filter.matches(e))
            .filter(|e| predicate.map(|p| p(e)).unwrap_or(true))
            .map(|e| self.to_view(e, filter.strip_dirs))
            .collect();

        sort_views(&mut views, sort_key, sort_order);
        views
    }

    /// Every entry, in insertion order, unfiltered and unsorted — the form
    /// serializers round-trip (spec §6).
    pub fn raw_entries(&self) -> Vec<StatsEntryView> {
        self.by_index
            .values()
            .map(|e| self.to_view(e, false))
            .collect()
    }

    /// Rebuilds a store from entries produced by [`StatsStore::raw_entries`]
    /// (or an equivalent external source), re-deriving indexes rather than
    /// trusting the ones embedded in `entries` — they may have come from a
    /// different process (spec §6, §4.6 invariant I5).
    pub fn from_entries(clock_mode: ClockMode, entries: &[StatsEntryView]) -> Self {
        let mut store = Self::new(clock_mode);
        let mut full_name_to_index = HashMap::with_capacity(entries.len());

        for view in entries {
            let key = FunctionKey {
                module: view.module.clone(),
                name: view.name.clone(),
                line_number: view.line_number,
                is_builtin: view.is_builtin,
            };
            let (index, _created) = store.find_or_create(&key, view.ctx_id, &view.ctx_name, view.tag);
            let entry = store
                .get_mut_by_index(index)
                .expect("find_or_create just ensured this index exists");
            entry.ncall = view.ncall;
            entry.nactualcall = view.nactualcall;
            entry.ttot = view.ttot;
            entry.tsub = view.tsub;
            full_name_to_index.insert(view.full_name.clone(), index);
        }

        for view in entries {
            let Some(&caller_index) = full_name_to_index.get(&view.full_name) else {
                continue;
            };
            for child in &view.children {
                let Some(&callee_index) = full_name_to_index.get(&child.callee_full_name) else {
                    continue;
                };
                let caller = store
                    .get_mut_by_index(caller_index)
                    .expect("resolved above");
                let edge = caller.child_edge_mut(callee_index);
                edge.ncall = child.ncall;
                edge.nactualcall = child.nactualcall;
                edge.ttot = child.ttot;
                edge.tsub = child.tsub;
            }
        }

        store
    }

    /// Merges `other`'s entries into `self` (spec §4.6).
    ///
    /// Pre-existing indexes in `self` are never modified; only entries
    /// imported from `other` receive fresh indexes (invariant I5).
    pub fn merge(&mut self, other: &StatsStore) -> Result<()> {
        if self.is_empty() {
            self.clock_mode = other.clock_mode;
        } else if self.clock_mode != other.clock_mode {
            return Err(ProfilerError::ClockModeMismatch(format!(
                "cannot merge a {:?}-clock store into a {:?}-clock store",
                other.clock_mode, self.clock_mode
            )));
        }

        let mut other_to_self: HashMap<u64, u64> = HashMap::with_capacity(other.by_index.len());

        for (other_index, x) in other.by_index.iter() {
            let self_index = match self.index_of_full_name.get(&x.full_name).copied() {
                Some(self_index) => {
                    let y = self
                        .by_index
                        .get_mut(&self_index)
                        .expect("index_of_full_name always points at a live entry");
                    y.ncall += x.ncall;
                    y.nactualcall += x.nactualcall;
                    y.ttot += x.ttot;
                    y.tsub += x.tsub;
                    self_index
                }
                None => {
                    let self_index = self.next_index;
                    self.next_index += 1;
                    let mut copy = x.clone();
                    copy.index = self_index;
                    copy.children = OrderedMap::new();
                    self.index_of_full_name
                        .insert(copy.full_name.clone(), self_index);
                    self.by_index.put(self_index, copy);
                    self_index
                }
            };
            other_to_self.insert(*other_index, self_index);
        }

        for (other_index, x) in other.by_index.iter() {
            let self_index = other_to_self[other_index];
            for (callee_other_index, edge) in x.children.iter() {
                let callee_self_index = other_to_self[callee_other_index];
                let target = self
                    .by_index
                    .get_mut(&self_index)
                    .expect("just inserted or found above");
                let merged = target.child_edge_mut(callee_self_index);
                merged.ncall += edge.ncall;
                merged.nactualcall += edge.nactualcall;
                merged.ttot += edge.ttot;
                merged.tsub += edge.tsub;
            }
        }

        Ok(())
    }

    /// Human-readable dump of every entry and its child edges, recovered
    /// from yappi's `YFuncStats.debug_print` (SPEC_FULL.md §F).
    pub fn debug_dump<W: std::fmt::Write>(&self, out: &mut W) -> std::fmt::Result {
        for entry in self.by_index.values() {
            writeln!(out, "index: {}", entry.index)?;
            writeln!(out, "full_name: {}", entry.full_name)?;
            writeln!(out, "ncall: {}/{}", entry.ncall, entry.nactualcall)?;
            writeln!(out, "ttot: {}", entry.ttot)?;
            writeln!(out, "tsub: {}", entry.tsub)?;
            writeln!(out, "children:")?;
            for (_, edge) in entry.children.iter() {
                let callee = self.resolve_full_name(edge.callee_index);
                writeln!(
                    out,
                    "    {callee}: ncall={}/{} ttot={} tsub={}",
                    edge.ncall, edge.nactualcall, edge.ttot, edge.tsub
                )?;
            }
        }
        Ok(())
    }
}

fn sort_views(views: &mut [StatsEntryView], key: SortKey, order: SortOrder) {
    views.sort_by(|a, b| {
        let ordering = match key {
            SortKey::Name => a.full_name.to_lowercase().cmp(&b.full_name.to_lowercase()),
            SortKey::Ncall => a.ncall.cmp(&b.ncall),
            SortKey::Ttot => a.ttot.cmp(&b.ttot),
            SortKey::Tsub => a.tsub.cmp(&b.tsub),
            SortKey::Tavg => a.tavg.partial_cmp(&b.tavg).unwrap_or(Ordering::Equal),
        };
        match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    });
}
