//! Convenience predicate constructors for [`crate::stats::StatsStore::iterate`],
//! recovered from yappi's `module_matches`/`func_matches` helpers
//! (SPEC_FULL.md §F).

use regex::Regex;

use crate::error::{ProfilerError, Result};
use crate::stats::StatsEntry;

/// Matches entries whose module equals, or is a submodule of, `prefix`
/// (`"pkg"` matches `"pkg"` and `"pkg.sub"`, not `"pkgsub"`).
pub fn by_module_prefix(prefix: impl Into<String>) -> impl Fn(&StatsEntry) -> bool {
    let prefix = prefix.into();
    move |entry: &StatsEntry| {
        entry.module == prefix || entry.module.starts_with(&format!("{prefix}."))
    }
}

/// Matches entries whose function name starts with `prefix`.
pub fn by_name_prefix(prefix: impl Into<String>) -> impl Fn(&StatsEntry) -> bool {
    let prefix = prefix.into();
    move |entry: &StatsEntry| entry.name.starts_with(&prefix)
}

/// Matches entries whose full name matches `pattern`, for callers that want
/// more than a prefix test (e.g. excluding test helpers with `^(?!test_)`).
pub fn by_full_name_regex(pattern: &str) -> Result<impl Fn(&StatsEntry) -> bool> {
    let re = Regex::new(pattern)
        .map_err(|e| ProfilerError::InvalidArgument(format!("invalid filter regex: {e}")))?;
    Ok(move |entry: &StatsEntry| re.is_match(&entry.full_name))
}
