//! The profiler facade (spec §5, §6): owns the clock, context registry and
//! stats store behind a single lock, and dispatches call/return/exception
//! events into [`crate::callstack`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::FreeList;
use crate::callstack;
use crate::clock::{Clock, ClockInfo, ClockMode};
use crate::context::{
    ContextRegistry, ContextSortKey, ContextStatsView, IdCallback, NameCallback, TagCallback,
};
use crate::error::{ProfilerError, Result};
use crate::stats::{FunctionKey, SortKey, SortOrder, StatsEntryView, StatsFilter, StatsStore};

/// Upper bound on concurrently-live call stack frames across all contexts,
/// sized well past any reasonable interpreter recursion limit; exceeding it
/// means the host is feeding the dispatcher call events without matching
/// returns (spec §4.2, §7).
const DEFAULT_FRAME_ARENA_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Call,
    CCall,
    Return,
    CReturn,
    /// The callee raised/threw instead of returning normally. Accounted for
    /// exactly like `Return` (spec §4.5: unwinding still produces a
    /// deterministic pop), kept distinct so callers can observe it.
    Exception,
}

/// What the host runtime reports about the function being entered/left.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub module: String,
    pub name: String,
    pub line_number: u32,
    pub is_builtin: bool,
}

impl FrameInfo {
    fn key(&self) -> FunctionKey {
        FunctionKey {
            module: self.module.clone(),
            name: self.name.clone(),
            line_number: self.line_number,
            is_builtin: self.is_builtin,
        }
    }
}

struct Inner {
    running: bool,
    /// Pause/resume nesting depth (spec §4.7: "pause(N times) requires
    /// resume(N times)"). Events are dropped whenever this is nonzero, same
    /// as when `running` is false, but independently of it — `stop()` does
    /// not reset it and a paused-but-running profiler still reports
    /// `is_running() == true`.
    pause_depth: u32,
    /// Nesting depth for [`ProfileScope`] acquisitions (spec §6
    /// `profile_scope`, SPEC_FULL.md §F item 1): only the outermost `enter`
    /// actually starts the profiler, only the outermost drop stops it.
    scope_depth: u32,
    /// Set when the outermost [`ProfileScope::enter`] is the one that
    /// transitioned the profiler from stopped to running. Cleared once that
    /// scope unwinds. If a scope is entered over an already-running
    /// profiler (e.g. one started explicitly via [`Profiler::start`]),
    /// this stays `false` so the scope's own exit doesn't stop a profiler
    /// it didn't start.
    scope_owns_start: bool,
    clock: Clock,
    contexts: ContextRegistry,
    stats: StatsStore,
    /// Shared pool backing every context's call stack (spec §4.2): a call
    /// stack is a LIFO sequence of handles into this arena.
    frame_arena: FreeList<crate::callstack::ActiveFrame>,
    builtins_enabled: bool,
    dispatch_error_count: u64,
    /// Terminal error recorded the last time the dispatcher force-stopped
    /// the profiler (spec §7: arena exhaustion stops the profiler
    /// atomically and leaves a terminal error visible via
    /// [`Profiler::get_last_error`]). Cleared on the next successful
    /// `start()`.
    last_error: Option<ProfilerError>,
}

thread_local! {
    /// Guards against the dispatcher being re-entered from inside a user
    /// callback it itself invoked (spec §4.4: callbacks must not recurse
    /// into the profiler).
    static DISPATCH_GUARD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Thread-safe handle to the profiler engine. Clones share the same
/// underlying state (spec §5: a single profiler instance per process).
#[derive(Clone)]
pub struct Profiler {
    inner: Arc<Mutex<Inner>>,
}

impl Profiler {
    /// Builds a profiler bound to `clock_mode` for its whole lifetime (spec
    /// §4.1: changing clock mode is only legal via [`Profiler::set_clock_type`]
    /// while stopped and empty). `builtins`/`multi_context` are NOT fixed
    /// here — spec §6's `start(builtins, multi_context)` lets each session
    /// choose them independently, so they start disabled and are set by
    /// every [`Profiler::start`] call.
    pub fn new(clock_mode: ClockMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                running: false,
                pause_depth: 0,
                scope_depth: 0,
                scope_owns_start: false,
                clock: Clock::new(clock_mode),
                contexts: ContextRegistry::new(false),
                stats: StatsStore::new(clock_mode),
                frame_arena: FreeList::new(DEFAULT_FRAME_ARENA_CAPACITY),
                builtins_enabled: false,
                dispatch_error_count: 0,
                last_error: None,
            })),
        }
    }

    /// Starts dispatching events (spec §6 `start(builtins, multi_context)`).
    /// Both flags apply for this session only; a later `start()` (after a
    /// `stop()`) may choose different ones.
    pub fn start(&self, builtins: bool, multi_context: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.running {
            return Err(ProfilerError::IllegalState(
                "profiler is already running".to_string(),
            ));
        }
        inner.running = true;
        inner.pause_depth = 0;
        inner.last_error = None;
        inner.builtins_enabled = builtins;
        inner.contexts.set_multi_context_enabled(multi_context);
        tracing::info!(
            clock = inner.clock.mode().as_str(),
            builtins,
            multi_context,
            "profiler started"
        );
        Ok(())
    }

    /// The terminal error, if any, that most recently force-stopped the
    /// profiler (spec §7). Cleared by the next `start()`.
    pub fn get_last_error(&self) -> Option<ProfilerError> {
        self.inner.lock().last_error.clone()
    }

    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.running {
            return Err(ProfilerError::IllegalState(
                "profiler is not running".to_string(),
            ));
        }
        inner.running = false;
        tracing::info!("profiler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Suspends dispatch without stopping the profiler (spec §4.7): events
    /// are dropped while `pause_depth > 0`, but `is_running()` is unaffected
    /// and stats already collected are left untouched. Nests: `N` calls to
    /// `pause` require `N` calls to [`Profiler::resume`] before dispatch
    /// resumes.
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.running {
            return Err(ProfilerError::IllegalState(
                "cannot pause a profiler that is not running".to_string(),
            ));
        }
        inner.pause_depth += 1;
        tracing::debug!(depth = inner.pause_depth, "profiler paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pause_depth == 0 {
            return Err(ProfilerError::IllegalState(
                "resume called without a matching pause".to_string(),
            ));
        }
        inner.pause_depth -= 1;
        tracing::debug!(depth = inner.pause_depth, "profiler resumed");
        Ok(())
    }

    /// Entry point for [`crate::ProfileScope`] (spec §6 `profile_scope`,
    /// SPEC_FULL.md §F item 1): only the outermost acquisition actually
    /// starts the profiler, so nested scopes compose without one scope's
    /// exit silencing an outer one still in flight.
    pub(crate) fn enter_scope(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.scope_depth += 1;
        if inner.scope_depth == 1 {
            if !inner.running {
                inner.running = true;
                inner.scope_owns_start = true;
                tracing::info!(clock = inner.clock.mode().as_str(), "profiler started (scope)");
            } else {
                inner.scope_owns_start = false;
            }
        }
        Ok(())
    }

    pub(crate) fn exit_scope(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.scope_depth == 0 {
            return Err(ProfilerError::IllegalState(
                "exit_scope called without a matching enter_scope".to_string(),
            ));
        }
        inner.scope_depth -= 1;
        if inner.scope_depth == 0 && inner.scope_owns_start {
            inner.running = false;
            inner.scope_owns_start = false;
            tracing::info!("profiler stopped (scope)");
        }
        Ok(())
    }

    pub fn clear_stats(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.running {
            return Err(ProfilerError::IllegalState(
                "cannot clear stats while the profiler is running".to_string(),
            ));
        }
        inner.stats.clear();
        inner.contexts.clear();
        tracing::debug!("stats cleared");
        Ok(())
    }

    pub fn get_clock_type(&self) -> ClockMode {
        self.inner.lock().clock.mode()
    }

    /// Changes the active clock mode. Only legal while stopped and with no
    /// accumulated stats, mirroring yappi's `set_clock_type` guard — mixing
    /// ticks from two clock sources inside one store would violate §4.6's
    /// merge precondition.
    pub fn set_clock_type(&self, mode: ClockMode) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.running {
            return Err(ProfilerError::IllegalState(
                "cannot change clock type while running".to_string(),
            ));
        }
        if !inner.stats.is_empty() {
            return Err(ProfilerError::IllegalState(
                "cannot change clock type with existing stats; call clear_stats first".to_string(),
            ));
        }
        tracing::info!(from = inner.clock.mode().as_str(), to = mode.as_str(), "clock mode changed");
        inner.clock.set_mode(mode);
        inner.stats = StatsStore::new(mode);
        Ok(())
    }

    pub fn get_clock_info(&self) -> ClockInfo {
        self.inner.lock().clock.info()
    }

    pub fn get_clock_time(&self) -> u64 {
        self.inner.lock().clock.tick()
    }

    /// Approximate memory footprint of retained profiling state, in bytes:
    /// the number of call-stack frames currently in flight across all
    /// contexts times the size of an active frame (spec §6: `get_mem_usage`).
    pub fn get_mem_usage(&self) -> usize {
        let inner = self.inner.lock();
        std::mem::size_of::<crate::callstack::ActiveFrame>() * inner.frame_arena.len()
    }

    pub fn set_context_id_callback(&self, callback: Option<IdCallback>) {
        self.inner.lock().contexts.set_id_callback(callback);
    }

    pub fn set_context_name_callback(&self, callback: Option<NameCallback>) {
        self.inner.lock().contexts.set_name_callback(callback);
    }

    pub fn set_tag_callback(&self, callback: Option<TagCallback>) {
        self.inner.lock().contexts.set_tag_callback(callback);
    }

    pub fn get_context_stats(&self, sort_key: ContextSortKey) -> Vec<ContextStatsView> {
        self.inner.lock().contexts.iterate(sort_key)
    }

    /// Shifts every currently open frame in context `ctx_id` by
    /// `delta_ticks` (spec §4.7.1): a negative delta increases the ttot
    /// attributed to those frames at return, a positive one decreases it.
    /// Used to splice out time the profiler shouldn't attribute to any
    /// function, e.g. time spent blocked in a syscall the caller excludes.
    pub fn shift_context_time(&self, ctx_id: i64, delta_ticks: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner {
            contexts,
            frame_arena,
            ..
        } = &mut *inner;
        let ctx = contexts
            .get(ctx_id)
            .ok_or_else(|| ProfilerError::InvalidArgument(format!("unknown context {ctx_id}")))?;
        callstack::shift_open_frames(ctx, frame_arena, delta_ticks);
        Ok(())
    }

    pub fn get_func_stats(
        &self,
        filter: &StatsFilter,
        sort_key: SortKey,
        sort_order: SortOrder,
    ) -> Vec<StatsEntryView> {
        self.inner
            .lock()
            .stats
            .iterate(filter, None, sort_key, sort_order)
    }

    /// Copies the current stats table out from behind the lock, e.g. for
    /// serialization (spec §4.6, §6).
    pub fn snapshot_stats(&self) -> StatsStore {
        self.inner.lock().stats.clone()
    }

    pub fn merge_stats(&self, other: &StatsStore) -> Result<()> {
        self.inner.lock().stats.merge(other)
    }

    /// Dispatches one call/return/exception event (spec §4.5).
    ///
    /// If the profiler isn't running, or this call re-enters the dispatcher
    /// from inside a callback it invoked, the event is dropped silently:
    /// neither counts as an error (spec §7 reserves `Err` for misuse of the
    /// public API, not for dropped events while stopped).
    pub fn on_event(&self, kind: EventKind, frame: Option<&FrameInfo>) {
        let already_dispatching = DISPATCH_GUARD.with(|guard| guard.replace(true));
        if already_dispatching {
            return;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.dispatch(kind, frame)
        }));
        DISPATCH_GUARD.with(|guard| guard.set(false));
        if let Err(err) = result {
            tracing::warn!(?err, "dispatcher callback panicked; event dropped");
        }
    }

    fn dispatch(&self, kind: EventKind, frame: Option<&FrameInfo>) {
        let mut inner = self.inner.lock();
        if !inner.running || inner.pause_depth > 0 {
            return;
        }
        // Builtin calls are tracked only when enabled; otherwise c_call/
        // c_return are ignored entirely (spec §4.5, §4.7) — checked by event
        // kind, not by inspecting `frame`, so a c_return (which carries no
        // frame info) is dropped in lockstep with the c_call it answers,
        // instead of popping whatever real frame happens to be on top.
        if matches!(kind, EventKind::CCall | EventKind::CReturn) && !inner.builtins_enabled {
            return;
        }

        // A reserved id (or an id callback that declines to answer) means
        // this event isn't attributable to any context and is dropped
        // outright (spec §4.4); a misbehaving callback has already
        // uninstalled itself inside `resolve_current_id`, so there is
        // nothing further to report here.
        let Some(ctx_id) = inner.contexts.resolve_current_id() else {
            return;
        };
        let tag = inner.contexts.resolve_current_tag();
        let now = inner.clock.tick();

        match kind {
            EventKind::Call | EventKind::CCall => {
                let Some(frame) = frame else {
                    tracing::warn!("call event dispatched with no frame info; dropped");
                    return;
                };
                if frame.is_builtin && !inner.builtins_enabled {
                    return;
                }
                let key = frame.key();
                let ctx_name = inner.contexts.resolve_or_create(ctx_id).name.clone();
                let Inner {
                    contexts,
                    stats,
                    frame_arena,
                    ..
                } = &mut *inner;
                let ctx = contexts.resolve_or_create(ctx_id);
                if ctx.paused {
                    return;
                }
                if let Err(err) =
                    callstack::on_call(ctx, frame_arena, stats, &key, ctx_id, &ctx_name, tag, now)
                {
                    tracing::error!(%err, "call-stack arena exhausted; stopping profiler");
                    inner.dispatch_error_count += 1;
                    inner.running = false;
                    inner.last_error = Some(err);
                }
            }
            EventKind::Return | EventKind::CReturn | EventKind::Exception => {
                let Inner {
                    contexts,
                    stats,
                    frame_arena,
                    ..
                } = &mut *inner;
                let Some(ctx) = contexts.get_mut(ctx_id) else {
                    return;
                };
                if ctx.paused {
                    return;
                }
                if let Some(elapsed) = callstack::on_return(ctx, frame_arena, stats, now) {
                    ctx.cumulative_ttot += elapsed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str) -> FrameInfo {
        FrameInfo {
            module: "mod".to_string(),
            name: name.to_string(),
            line_number: 1,
            is_builtin: false,
        }
    }

    #[test]
    fn start_twice_is_illegal_state() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        assert!(matches!(profiler.start(false, false), Err(ProfilerError::IllegalState(_))));
    }

    #[test]
    fn stop_when_not_running_is_illegal_state() {
        let profiler = Profiler::new(ClockMode::Cpu);
        assert!(matches!(profiler.stop(), Err(ProfilerError::IllegalState(_))));
    }

    #[test]
    fn events_before_start_are_dropped_without_error() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        profiler.on_event(EventKind::Return, None);
        let stats = profiler.get_func_stats(&StatsFilter::default(), SortKey::Name, SortOrder::Ascending);
        assert!(stats.is_empty());
    }

    #[test]
    fn call_then_return_produces_one_stat_entry() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        profiler.on_event(EventKind::Return, None);
        let stats = profiler.get_func_stats(&StatsFilter::default(), SortKey::Name, SortOrder::Ascending);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].ncall, 1);
    }

    #[test]
    fn clear_stats_while_running_is_rejected() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        assert!(matches!(profiler.clear_stats(), Err(ProfilerError::IllegalState(_))));
    }

    #[test]
    fn set_clock_type_rejected_once_stats_exist() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        profiler.on_event(EventKind::Return, None);
        profiler.stop().unwrap();
        assert!(matches!(
            profiler.set_clock_type(ClockMode::Wall),
            Err(ProfilerError::IllegalState(_))
        ));
    }

    #[test]
    fn pause_without_running_is_illegal_state() {
        let profiler = Profiler::new(ClockMode::Cpu);
        assert!(matches!(profiler.pause(), Err(ProfilerError::IllegalState(_))));
    }

    #[test]
    fn resume_without_pause_is_illegal_state() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        assert!(matches!(profiler.resume(), Err(ProfilerError::IllegalState(_))));
    }

    #[test]
    fn nested_pause_requires_matching_nested_resume() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        profiler.pause().unwrap();
        profiler.pause().unwrap();
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        profiler.on_event(EventKind::Return, None);
        assert!(profiler.is_running());
        profiler.resume().unwrap();
        // Still paused once: events are still dropped.
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        profiler.on_event(EventKind::Return, None);
        let stats = profiler.get_func_stats(&StatsFilter::default(), SortKey::Name, SortOrder::Ascending);
        assert!(stats.is_empty());
        profiler.resume().unwrap();
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        profiler.on_event(EventKind::Return, None);
        let stats = profiler.get_func_stats(&StatsFilter::default(), SortKey::Name, SortOrder::Ascending);
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn enter_scope_starts_only_at_the_outermost_depth() {
        let profiler = Profiler::new(ClockMode::Cpu);
        assert!(!profiler.is_running());
        profiler.enter_scope().unwrap();
        assert!(profiler.is_running());
        profiler.enter_scope().unwrap();
        assert!(profiler.is_running());
        profiler.exit_scope().unwrap();
        // Still held open by the outer scope.
        assert!(profiler.is_running());
        profiler.exit_scope().unwrap();
        assert!(!profiler.is_running());
    }

    #[test]
    fn exit_scope_without_enter_is_illegal_state() {
        let profiler = Profiler::new(ClockMode::Cpu);
        assert!(matches!(profiler.exit_scope(), Err(ProfilerError::IllegalState(_))));
    }

    #[test]
    fn top_level_return_accumulates_context_cumulative_ttot() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, true).unwrap();
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        profiler.on_event(EventKind::Return, None);
        let ctx = profiler
            .get_context_stats(ContextSortKey::Id)
            .into_iter()
            .find(|c| c.id == crate::context::DEFAULT_CONTEXT_ID)
            .unwrap();
        assert_eq!(ctx.sched_count, 1);
        let stats = profiler.get_func_stats(&StatsFilter::default(), SortKey::Name, SortOrder::Ascending);
        assert_eq!(stats[0].ttot, profiler.inner.lock().contexts.get(ctx.id).unwrap().cumulative_ttot);
    }

    #[test]
    fn builtins_are_dropped_unless_enabled() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        let mut builtin = frame("len");
        builtin.is_builtin = true;
        profiler.on_event(EventKind::CCall, Some(&builtin));
        profiler.on_event(EventKind::CReturn, None);
        let stats = profiler.get_func_stats(&StatsFilter::default(), SortKey::Name, SortOrder::Ascending);
        assert!(stats.is_empty());
    }

    #[test]
    fn skipped_c_call_does_not_corrupt_the_enclosing_call_stack() {
        // A builtin call/return pair nested inside a real call, with
        // builtins disabled: the c_call is dropped before it ever touches
        // the stack, so the matching c_return must be dropped too rather
        // than popping the enclosing frame.
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        profiler.on_event(EventKind::Call, Some(&frame("outer")));
        let mut builtin = frame("len");
        builtin.is_builtin = true;
        profiler.on_event(EventKind::CCall, Some(&builtin));
        profiler.on_event(EventKind::CReturn, None);
        profiler.on_event(EventKind::Return, None);

        let stats = profiler.get_func_stats(&StatsFilter::default(), SortKey::Name, SortOrder::Ascending);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "outer");
        assert_eq!(stats[0].ncall, 1);
        assert!(stats[0].ttot > 0);
    }

    #[test]
    fn shift_context_time_inflates_ttot_of_a_still_open_frame() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        // Shift the open frame's entry tick 1000 ticks into the past.
        profiler.shift_context_time(crate::context::DEFAULT_CONTEXT_ID, -1000).unwrap();
        profiler.on_event(EventKind::Return, None);
        let stats = profiler.get_func_stats(&StatsFilter::default(), SortKey::Name, SortOrder::Ascending);
        assert!(stats[0].ttot >= 1000);
    }

    #[test]
    fn get_last_error_is_none_until_the_dispatcher_force_stops() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        assert!(profiler.get_last_error().is_none());
        profiler.on_event(EventKind::Call, Some(&frame("f")));
        profiler.on_event(EventKind::Return, None);
        assert!(profiler.get_last_error().is_none());
    }

    #[test]
    fn get_last_error_is_cleared_by_the_next_start() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        profiler.inner.lock().last_error = Some(ProfilerError::OutOfMemory("arena exhausted".to_string()));
        profiler.stop().unwrap();
        assert!(profiler.get_last_error().is_some());
        profiler.start(false, false).unwrap();
        assert!(profiler.get_last_error().is_none());
    }

    #[test]
    fn shift_context_time_on_unknown_context_is_invalid_argument() {
        let profiler = Profiler::new(ClockMode::Cpu);
        assert!(matches!(
            profiler.shift_context_time(999, 10),
            Err(ProfilerError::InvalidArgument(_))
        ));
    }
}
