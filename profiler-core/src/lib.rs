//! Deterministic, multi-context call/return function profiler.
//!
//! The engine observes call/return (and C-call/C-return, and exception)
//! events handed to it by a host language runtime and produces per-function
//! statistics: call counts, cumulative (`ttot`) and self (`tsub`) time, and
//! a caller→callee child-edge table, all attributed per execution context
//! (an OS thread, fiber, or greenlet) and optionally per user-defined tag.
//!
//! Driving this from a real interpreter is outside this crate's scope; see
//! `profiler-cli` for a demo harness that replays a synthetic event trace
//! through the same engine.

pub mod arena;
pub mod callstack;
pub mod clock;
pub mod context;
pub mod error;
pub mod filters;
pub mod ordered_map;
pub mod profiler;
pub mod serialize;
pub mod stats;

mod scope;

pub use clock::{Clock, ClockInfo, ClockMode};
pub use context::{
    CallbackError, CallbackOutcome, CallbackResult, ContextSortKey, ContextStatsView, IdCallback,
    NameCallback, TagCallback,
};
pub use error::{ProfilerError, Result};
pub use profiler::{EventKind, FrameInfo, Profiler};
pub use scope::ProfileScope;
pub use stats::{
    ChildEdgeView, FunctionKey, SortKey, SortOrder, StatsEntryView, StatsFilter, StatsStore,
};
