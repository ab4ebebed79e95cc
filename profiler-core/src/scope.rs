//! Scoped start/stop instrumentation, recovered from yappi's `@profile`
//! decorator (SPEC_FULL.md §F item 1): the decorator doesn't instrument one
//! function call, it starts the profiler on first entry and stops it once
//! every nested use has unwound. [`ProfileScope`] is the RAII form of that:
//! only the outermost acquisition actually starts the profiler, only the
//! outermost drop stops it.

use crate::error::Result;
use crate::profiler::Profiler;

/// Guard returned by entering a profiled scope. Dropping it releases one
/// level of nesting; the profiler only actually stops once every
/// outstanding guard has been dropped.
pub struct ProfileScope<'a> {
    profiler: &'a Profiler,
}

impl<'a> ProfileScope<'a> {
    /// Enters a profiled scope, starting the profiler if this is the
    /// outermost one currently held.
    pub fn enter(profiler: &'a Profiler) -> Result<Self> {
        profiler.enter_scope()?;
        Ok(Self { profiler })
    }
}

impl Drop for ProfileScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.profiler.exit_scope() {
            tracing::warn!(%err, "profile scope exited out of order");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockMode;
    use crate::profiler::{EventKind, FrameInfo};
    use crate::stats::StatsFilter;

    fn frame(name: &str) -> FrameInfo {
        FrameInfo {
            module: "mod".to_string(),
            name: name.to_string(),
            line_number: 1,
            is_builtin: false,
        }
    }

    #[test]
    fn scope_starts_the_profiler_on_enter_and_stops_it_on_drop() {
        let profiler = Profiler::new(ClockMode::Cpu);
        assert!(!profiler.is_running());
        {
            let _scope = ProfileScope::enter(&profiler).unwrap();
            assert!(profiler.is_running());
            profiler.on_event(EventKind::Call, Some(&frame("f")));
            profiler.on_event(EventKind::Return, None);
        }
        assert!(!profiler.is_running());
        let stats = profiler.get_func_stats(
            &StatsFilter::default(),
            crate::stats::SortKey::Name,
            crate::stats::SortOrder::Ascending,
        );
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].ncall, 1);
    }

    #[test]
    fn nested_scopes_only_stop_the_profiler_once_the_outermost_drops() {
        let profiler = Profiler::new(ClockMode::Cpu);
        {
            let _outer = ProfileScope::enter(&profiler).unwrap();
            {
                let _inner = ProfileScope::enter(&profiler).unwrap();
                assert!(profiler.is_running());
            }
            // Inner dropped, outer still holds the profiler open.
            assert!(profiler.is_running());
        }
        assert!(!profiler.is_running());
    }

    #[test]
    fn scope_over_an_already_running_profiler_does_not_stop_it_early() {
        let profiler = Profiler::new(ClockMode::Cpu);
        profiler.start(false, false).unwrap();
        {
            let _scope = ProfileScope::enter(&profiler).unwrap();
        }
        // The scope didn't start the profiler, so it shouldn't stop it either.
        assert!(profiler.is_running());
        profiler.stop().unwrap();
    }
}
