//! Execution contexts (OS threads or language-level fibers/greenlets) and
//! the id/name/tag callback contracts used to identify them (spec §4.4).

use crate::arena::Slot;
use crate::ordered_map::OrderedMap;

/// What a user-supplied id/name/tag callback may hand back.
///
/// Modeled as a plain enum rather than catching a panic out of the callback
/// (the host language's "raise" from spec §4.4): the callback is ordinary
/// Rust code here, so the idiomatic contract is a `Result`-returning
/// function, not `std::panic::catch_unwind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome<T> {
    /// The callback produced a definite value.
    Value(T),
    /// The callback has no opinion yet (e.g. the language runtime hasn't
    /// finished bootstrapping the context). The dispatcher keeps using the
    /// previous value, or a default if there isn't one yet.
    NotYetKnown,
    /// The callback asked for this event to be ignored entirely (distinct
    /// from `NotYetKnown`: used by tag callbacks to mean "don't attribute
    /// this call to any tag").
    Ignore,
}

#[derive(Debug)]
pub struct CallbackError(pub String);

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "context callback failed: {}", self.0)
    }
}

impl std::error::Error for CallbackError {}

pub type CallbackResult<T> = Result<CallbackOutcome<T>, CallbackError>;

pub type IdCallback = Box<dyn Fn() -> CallbackResult<i64> + Send + Sync>;
pub type NameCallback = Box<dyn Fn(i64) -> CallbackResult<String> + Send + Sync>;
pub type TagCallback = Box<dyn Fn() -> CallbackResult<i64> + Send + Sync>;

pub const DEFAULT_CONTEXT_ID: i64 = 0;
pub const DEFAULT_CONTEXT_NAME: &str = "MainThread";
pub const NO_TAG: i64 = -1;

/// Reserved id-callback return value meaning "unknown/ignore": the event
/// this context id was resolved for should be dropped entirely, rather than
/// attributed to any context (spec §4.4).
pub const RESERVED_IGNORE_ID: i64 = -1;

/// One observed execution context: its own call stack, scheduling
/// statistics, and accumulated clock offset (spec §4.4, §5).
#[derive(Debug)]
pub struct Context {
    pub id: i64,
    pub name: String,
    /// Handles into the shared [`crate::arena::FreeList`] that owns the
    /// actual [`crate::callstack::ActiveFrame`] storage — a call stack is
    /// just a LIFO sequence of arena slots.
    pub call_stack: Vec<Slot>,
    pub sched_count: u64,
    pub peak_depth: usize,
    /// Sum of `ttot` attributed to this context across its top-level call
    /// returns (spec §3: `cumulative_ttot`).
    pub cumulative_ttot: u64,
    /// Set while this context is suspended (a fiber switched out from under
    /// a cooperative scheduler): events observed for it are dropped until
    /// [`Context::resume`] (spec §4.4's per-context `paused` flag, §5
    /// suspension points).
    pub paused: bool,
    pub paused_at_tick: Option<u64>,
    pub last_resumed_at_tick: u64,
}

impl Context {
    pub(crate) fn new(id: i64, name: String) -> Self {
        Self {
            id,
            name,
            call_stack: Vec::new(),
            sched_count: 0,
            peak_depth: 0,
            cumulative_ttot: 0,
            paused: false,
            paused_at_tick: None,
            last_resumed_at_tick: 0,
        }
    }

    pub fn record_schedule(&mut self) {
        self.sched_count += 1;
    }

    pub fn note_depth(&mut self, depth: usize) {
        if depth > self.peak_depth {
            self.peak_depth = depth;
        }
    }

    /// Marks this context suspended as of `now` (a cooperative scheduler
    /// switching away from its fiber). Events for it are dropped until
    /// [`Context::resume`] (spec §5).
    pub fn suspend(&mut self, now: u64) {
        self.paused = true;
        self.paused_at_tick = Some(now);
    }

    /// Marks this context runnable again as of `now` and counts the
    /// schedule (spec §3: `sched_count`, "times this context has been
    /// entered from a suspended state").
    pub fn resume(&mut self, now: u64) {
        self.paused = false;
        self.paused_at_tick = None;
        self.last_resumed_at_tick = now;
        self.record_schedule();
    }
}

/// Read-only snapshot of a [`Context`] for the enumeration API (spec §6:
/// `get_context_stats`).
#[derive(Debug, Clone)]
pub struct ContextStatsView {
    pub id: i64,
    pub name: String,
    pub sched_count: u64,
    pub peak_depth: usize,
    pub ttot: u64,
}

/// Fields the enumeration API (spec §4.4) may sort contexts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSortKey {
    Id,
    Name,
    Ttot,
    SchedCount,
}

/// Tracks every context seen since the last `clear_stats`, keyed by the id
/// the id-callback (or the default, single-context fallback) hands back.
pub struct ContextRegistry {
    contexts: OrderedMap<i64, Context>,
    multi_context_enabled: bool,
    id_callback: Option<IdCallback>,
    name_callback: Option<NameCallback>,
    tag_callback: Option<TagCallback>,
}

impl ContextRegistry {
    pub fn new(multi_context_enabled: bool) -> Self {
        Self {
            contexts: OrderedMap::new(),
            multi_context_enabled,
            id_callback: None,
            name_callback: None,
            tag_callback: None,
        }
    }

    pub fn set_id_callback(&mut self, callback: Option<IdCallback>) {
        self.id_callback = callback;
    }

    pub fn set_name_callback(&mut self, callback: Option<NameCallback>) {
        self.name_callback = callback;
    }

    pub fn set_tag_callback(&mut self, callback: Option<TagCallback>) {
        self.tag_callback = callback;
    }

    /// Flips multi-context tracking for the next session (spec §6
    /// `start(builtins, multi_context)`): callers may enable/disable this
    /// per `start()` call rather than only at construction.
    pub fn set_multi_context_enabled(&mut self, enabled: bool) {
        self.multi_context_enabled = enabled;
    }

    pub fn clear(&mut self) {
        self.contexts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Resolves the id of the context that is "current" right now, by
    /// invoking the id callback (when multi-context tracking is enabled and
    /// one is installed) and falling back to [`DEFAULT_CONTEXT_ID`]
    /// otherwise, per spec §4.4.
    ///
    /// Returns `None` when the event this id is being resolved for should be
    /// dropped entirely: either the callback returned the reserved
    /// [`RESERVED_IGNORE_ID`] sentinel, or declined via
    /// [`CallbackOutcome::Ignore`]. A callback that raises, or returns a
    /// negative id other than the reserved sentinel, is uninstalled on the
    /// spot and the default id is used from then on (spec §4.4, §7).
    pub fn resolve_current_id(&mut self) -> Option<i64> {
        if !self.multi_context_enabled {
            return Some(DEFAULT_CONTEXT_ID);
        }
        let Some(callback) = &self.id_callback else {
            return Some(DEFAULT_CONTEXT_ID);
        };
        match callback() {
            Ok(CallbackOutcome::Value(id)) if id == RESERVED_IGNORE_ID => None,
            Ok(CallbackOutcome::Value(id)) if id < 0 => {
                tracing::warn!(id, "id callback returned an invalid negative id; uninstalling");
                self.id_callback = None;
                Some(DEFAULT_CONTEXT_ID)
            }
            Ok(CallbackOutcome::Value(id)) => Some(id),
            Ok(CallbackOutcome::NotYetKnown) => Some(DEFAULT_CONTEXT_ID),
            Ok(CallbackOutcome::Ignore) => None,
            Err(err) => {
                tracing::warn!(%err, "id callback failed; uninstalling");
                self.id_callback = None;
                Some(DEFAULT_CONTEXT_ID)
            }
        }
    }

    fn resolve_name(&mut self, id: i64) -> String {
        if id == DEFAULT_CONTEXT_ID {
            return DEFAULT_CONTEXT_NAME.to_string();
        }
        let Some(callback) = &self.name_callback else {
            return format!("Context-{id}");
        };
        match callback(id) {
            Ok(CallbackOutcome::Value(name)) => name,
            Ok(CallbackOutcome::NotYetKnown | CallbackOutcome::Ignore) => {
                format!("Context-{id}")
            }
            Err(err) => {
                tracing::warn!(%err, "name callback failed; uninstalling");
                self.name_callback = None;
                format!("Context-{id}")
            }
        }
    }

    /// Resolves the active tag (spec §4.4), defaulting to [`NO_TAG`] when no
    /// callback is installed, it declines to answer, or it fails (in which
    /// case it is also uninstalled, per spec §7).
    pub fn resolve_current_tag(&mut self) -> i64 {
        let Some(callback) = &self.tag_callback else {
            return NO_TAG;
        };
        match callback() {
            Ok(CallbackOutcome::Value(tag)) => tag,
            Ok(CallbackOutcome::NotYetKnown | CallbackOutcome::Ignore) => NO_TAG,
            Err(err) => {
                tracing::warn!(%err, "tag callback failed; uninstalling");
                self.tag_callback = None;
                NO_TAG
            }
        }
    }

    /// Finds the context for `id`, creating it (resolving its name and
    /// counting it as newly scheduled) on first observation.
    pub fn resolve_or_create(&mut self, id: i64) -> &mut Context {
        if !self.contexts.contains_key(&id) {
            let name = self.resolve_name(id);
            let mut ctx = Context::new(id, name);
            ctx.record_schedule();
            self.contexts.put(id, ctx);
        }
        self.contexts
            .get_mut(&id)
            .expect("just inserted if missing")
    }

    pub fn get(&self, id: i64) -> Option<&Context> {
        self.contexts.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut Context> {
        self.contexts.get_mut(&id)
    }

    pub fn iterate(&self, sort_key: ContextSortKey) -> Vec<ContextStatsView> {
        let mut views: Vec<ContextStatsView> = self
            .contexts
            .values()
            .map(|c| ContextStatsView {
                id: c.id,
                name: c.name.clone(),
                sched_count: c.sched_count,
                peak_depth: c.peak_depth,
                ttot: c.cumulative_ttot,
            })
            .collect();
        views.sort_by(|a, b| match sort_key {
            ContextSortKey::Id => a.id.cmp(&b.id),
            ContextSortKey::Name => a.name.cmp(&b.name),
            ContextSortKey::Ttot => b.ttot.cmp(&a.ttot),
            ContextSortKey::SchedCount => b.sched_count.cmp(&a.sched_count),
        });
        views
    }
}
