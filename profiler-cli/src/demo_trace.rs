//! Bundled, deterministic event traces used to exercise the profiler engine
//! without hooking a live interpreter — that hook is out of scope for this
//! crate (SPEC_FULL.md §A); this is the harness that stands in for it.

use profiler_core::{EventKind, FrameInfo};

pub struct TraceStep {
    pub kind: EventKind,
    pub frame: Option<FrameInfo>,
}

fn call(module: &str, name: &str, line: u32) -> TraceStep {
    TraceStep {
        kind: EventKind::Call,
        frame: Some(FrameInfo {
            module: module.to_string(),
            name: name.to_string(),
            line_number: line,
            is_builtin: false,
        }),
    }
}

fn ccall(module: &str, name: &str) -> TraceStep {
    TraceStep {
        kind: EventKind::CCall,
        frame: Some(FrameInfo {
            module: module.to_string(),
            name: name.to_string(),
            line_number: 0,
            is_builtin: true,
        }),
    }
}

fn ret() -> TraceStep {
    TraceStep {
        kind: EventKind::Return,
        frame: None,
    }
}

fn creturn() -> TraceStep {
    TraceStep {
        kind: EventKind::CReturn,
        frame: None,
    }
}

/// Recursive `fib(5)`, exercising recursion accounting (ncall vs
/// nactualcall) and deep caller→callee nesting.
pub fn fibonacci() -> Vec<TraceStep> {
    fn fib(n: u32, steps: &mut Vec<TraceStep>) {
        steps.push(call("demo.fib", "fib", 10));
        if n > 1 {
            fib(n - 1, steps);
            fib(n - 2, steps);
        }
        steps.push(ret());
    }

    let mut steps = vec![call("demo.main", "main", 1)];
    fib(5, &mut steps);
    steps.push(ret());
    steps
}

/// A flat `load` → `parse` → `render` pipeline, each stage calling a shared
/// builtin — exercises the builtins filter and a shared child edge fanning
/// in from three distinct callers.
pub fn pipeline() -> Vec<TraceStep> {
    let mut steps = vec![call("demo.main", "main", 1)];
    for stage in ["load", "parse", "render"] {
        steps.push(call("demo.pipeline", stage, 20));
        steps.push(ccall("builtins", "validate"));
        steps.push(creturn());
        steps.push(ret());
    }
    steps.push(ret());
    steps
}

pub fn by_name(name: &str) -> Option<Vec<TraceStep>> {
    match name {
        "fibonacci" => Some(fibonacci()),
        "pipeline" => Some(pipeline()),
        _ => None,
    }
}

pub const AVAILABLE: &[&str] = &["fibonacci", "pipeline"];
