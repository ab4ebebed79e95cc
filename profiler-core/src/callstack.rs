//! Call/return accounting (spec §4.5): recursion detection, `ttot`/`tsub`
//! bookkeeping, and caller→callee child-edge updates.

use crate::arena::FreeList;
use crate::context::Context;
use crate::error::Result;
use crate::stats::{FunctionKey, StatsStore};

/// One live call on a context's stack, from the moment it's entered until
/// its matching return. Lives inside the shared frame arena; a `Context`
/// only holds the [`crate::arena::Slot`] handle.
#[derive(Debug)]
pub struct ActiveFrame {
    pub func_index: u64,
    pub(crate) entered_at: u64,
    /// Sum of `ttot` already attributed to callees entered while this frame
    /// was on top of the stack; subtracted from this frame's own elapsed
    /// time to get `tsub` (spec §4.5 step 4).
    child_ttot_accum: u64,
    /// Whether `func_index` already appeared somewhere below this frame on
    /// the same stack when it was pushed (spec §4.5 step 2, recursion).
    is_recursive_entry: bool,
}

/// Handles a call event: resolves/creates the callee's stats entry, bumps
/// `ncall`/`nactualcall`, and pushes a new [`ActiveFrame`] into `arena`.
///
/// Caller→callee child-edge bookkeeping happens on the matching return,
/// once the callee's elapsed time is known.
pub fn on_call(
    ctx: &mut Context,
    arena: &mut FreeList<ActiveFrame>,
    stats: &mut StatsStore,
    key: &FunctionKey,
    ctx_id: i64,
    ctx_name: &str,
    tag: i64,
    now: u64,
) -> Result<()> {
    let (func_index, _created) = stats.find_or_create(key, ctx_id, ctx_name, tag);

    let is_recursive_entry = ctx.call_stack.iter().any(|slot| {
        arena
            .get(*slot)
            .map(|frame| frame.func_index == func_index)
            .unwrap_or(false)
    });

    let entry = stats
        .get_mut_by_index(func_index)
        .expect("find_or_create just ensured this index exists");
    entry.ncall += 1;
    if !is_recursive_entry {
        entry.nactualcall += 1;
    }

    let slot = arena.allocate(ActiveFrame {
        func_index,
        entered_at: now,
        child_ttot_accum: 0,
        is_recursive_entry,
    })?;
    ctx.call_stack.push(slot);
    ctx.note_depth(ctx.call_stack.len());
    Ok(())
}

/// Handles a return event: pops the top frame, attributes `ttot`/`tsub` to
/// its function, and folds its elapsed time into the new top frame's
/// self-time deduction and child-edge table.
///
/// A return with an empty call stack (a stale return — e.g. `clear_stats`
/// ran mid-call, or the host delivered a return with no matching call) is
/// silently dropped rather than treated as an error, per spec §4.5 edge
/// cases.
///
/// Returns the elapsed ttot of the frame that just returned when the call
/// stack unwound all the way to empty, i.e. this was the context's
/// outermost call — used to maintain [`Context::cumulative_ttot`] (spec §3).
pub fn on_return(
    ctx: &mut Context,
    arena: &mut FreeList<ActiveFrame>,
    stats: &mut StatsStore,
    now: u64,
) -> Option<u64> {
    let slot = ctx.call_stack.pop()?;
    let frame = arena.free(slot)?;

    let elapsed = now.saturating_sub(frame.entered_at);
    let self_time = elapsed.saturating_sub(frame.child_ttot_accum);

    // A recursive re-entry's cost is already folded into the outermost
    // non-recursive frame's `ttot`/`tsub` once it unwinds that far (spec
    // §4.5 step 3); crediting it here too would double-count under
    // recursion (invariant P4).
    if !frame.is_recursive_entry {
        if let Some(entry) = stats.get_mut_by_index(frame.func_index) {
            entry.ttot += elapsed;
            entry.tsub += self_time;
        }
    }

    let Some(&caller_slot) = ctx.call_stack.last() else {
        // Stack unwound to empty: this was the context's outermost call.
        return Some(elapsed);
    };
    let Some(caller_frame) = arena.get_mut(caller_slot) else {
        return None;
    };
    let caller_func_index = caller_frame.func_index;

    // Recursive returns add 0 to the caller's subtracted time and to the
    // edge's time fields, to avoid double-subtraction (spec §4.5 step 4).
    if !frame.is_recursive_entry {
        caller_frame.child_ttot_accum += elapsed;
    }

    if let Some(caller_entry) = stats.get_mut_by_index(caller_func_index) {
        let edge = caller_entry.child_edge_mut(frame.func_index);
        edge.ncall += 1;
        if !frame.is_recursive_entry {
            edge.nactualcall += 1;
            edge.ttot += elapsed;
            edge.tsub += self_time;
        }
    }

    None
}

/// Adjusts every currently-open frame in `ctx` by adding `delta` to its
/// entry tick (spec §4.7.1 `shift_context_time`): a negative `delta` moves
/// `entered_at` earlier, inflating the elapsed time attributed at return; a
/// positive one shrinks it.
pub fn shift_open_frames(ctx: &Context, arena: &mut FreeList<ActiveFrame>, delta: i64) {
    for &slot in &ctx.call_stack {
        if let Some(frame) = arena.get_mut(slot) {
            frame.entered_at = (frame.entered_at as i64 + delta).max(0) as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockMode;
    use crate::context::Context;
    use test_case::test_case;

    fn key(name: &str) -> FunctionKey {
        FunctionKey {
            module: "mod".to_string(),
            name: name.to_string(),
            line_number: 1,
            is_builtin: false,
        }
    }

    fn new_context() -> Context {
        Context::new(
            crate::context::DEFAULT_CONTEXT_ID,
            crate::context::DEFAULT_CONTEXT_NAME.to_string(),
        )
    }

    fn new_arena() -> FreeList<ActiveFrame> {
        FreeList::new(64)
    }

    #[test]
    fn simple_call_return_attributes_full_time_as_self_time() {
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);

        on_call(&mut ctx, &mut arena, &mut stats, &key("f"), 0, "MainThread", -1, 100).unwrap();
        on_return(&mut ctx, &mut arena, &mut stats, 150);

        let f = stats.get_by_full_name("mod:1 f").unwrap();
        assert_eq!(f.ncall, 1);
        assert_eq!(f.nactualcall, 1);
        assert_eq!(f.ttot, 50);
        assert_eq!(f.tsub, 50);
        assert!(ctx.call_stack.is_empty());
        assert!(arena.is_empty());
    }

    #[test]
    fn nested_call_deducts_child_time_from_parent_self_time() {
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);

        on_call(&mut ctx, &mut arena, &mut stats, &key("outer"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("inner"), 0, "MainThread", -1, 10).unwrap();
        on_return(&mut ctx, &mut arena, &mut stats, 40); // inner: ttot=30
        on_return(&mut ctx, &mut arena, &mut stats, 100); // outer: ttot=100, tsub=100-30=70

        let outer = stats.get_by_full_name("mod:1 outer").unwrap();
        let inner = stats.get_by_full_name("mod:1 inner").unwrap();
        assert_eq!(inner.ttot, 30);
        assert_eq!(inner.tsub, 30);
        assert_eq!(outer.ttot, 100);
        assert_eq!(outer.tsub, 70);

        let edge = outer.children.get(&inner.index).unwrap();
        assert_eq!(edge.ncall, 1);
        assert_eq!(edge.ttot, 30);
    }

    #[test]
    fn direct_recursion_increments_ncall_but_not_nactualcall() {
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);

        on_call(&mut ctx, &mut arena, &mut stats, &key("rec"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("rec"), 0, "MainThread", -1, 5).unwrap();
        on_return(&mut ctx, &mut arena, &mut stats, 20);
        on_return(&mut ctx, &mut arena, &mut stats, 30);

        let rec = stats.get_by_full_name("mod:1 rec").unwrap();
        assert_eq!(rec.ncall, 2);
        assert_eq!(rec.nactualcall, 1);
        assert!(rec.is_recursive());
        // Only the outermost (non-recursive) frame contributes ttot/tsub;
        // the inner recursive re-entry's cost is already folded into it.
        assert_eq!(rec.ttot, 30);
        assert_eq!(rec.tsub, 30);
    }

    #[test]
    fn three_level_direct_recursion_counts_ttot_once_at_the_outermost_frame() {
        // f -> f -> f, returns (innermost first) at ticks 3, 6, 10, matching
        // spec §8 B2.
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);

        on_call(&mut ctx, &mut arena, &mut stats, &key("f"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("f"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("f"), 0, "MainThread", -1, 0).unwrap();
        on_return(&mut ctx, &mut arena, &mut stats, 3);
        on_return(&mut ctx, &mut arena, &mut stats, 6);
        on_return(&mut ctx, &mut arena, &mut stats, 10);

        let f = stats.get_by_full_name("mod:1 f").unwrap();
        assert_eq!(f.ncall, 3);
        assert_eq!(f.nactualcall, 1);
        assert_eq!(f.ttot, 10);
        assert_eq!(f.tsub, 10);

        let edge = f.children.get(&f.index).unwrap();
        assert_eq!(edge.ncall, 2);
        assert_eq!(edge.nactualcall, 0);
        assert_eq!(edge.ttot, 0);
        assert_eq!(edge.tsub, 0);
    }

    /// Table-driven variant of the three-level case above (spec §8 B2):
    /// whatever the recursion depth, the outermost return is the only one
    /// that contributes to `ttot`/`tsub`, `nactualcall` stays pinned at 1,
    /// and `ncall` tracks depth exactly.
    #[test_case(&[3], 1, 1, 3)]
    #[test_case(&[3, 6], 2, 1, 6)]
    #[test_case(&[3, 6, 10], 3, 1, 10)] // spec §8 B2
    #[test_case(&[3, 6, 10, 15, 21], 5, 1, 21)]
    fn direct_recursion_depth_variations_collapse_to_the_outermost_return(
        return_ticks: &[u64],
        expected_ncall: u64,
        expected_nactualcall: u64,
        expected_ttot: u64,
    ) {
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);

        for _ in 0..return_ticks.len() {
            on_call(&mut ctx, &mut arena, &mut stats, &key("f"), 0, "MainThread", -1, 0).unwrap();
        }
        for &tick in return_ticks {
            on_return(&mut ctx, &mut arena, &mut stats, tick);
        }

        let f = stats.get_by_full_name("mod:1 f").unwrap();
        assert_eq!(f.ncall, expected_ncall);
        assert_eq!(f.nactualcall, expected_nactualcall);
        assert_eq!(f.ttot, expected_ttot);
        assert_eq!(f.tsub, expected_ttot);
    }

    #[test]
    fn four_level_non_recursive_chain_deducts_full_callee_elapsed_at_each_level() {
        // a -> b -> c -> d, matching spec §8 B4.
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);

        on_call(&mut ctx, &mut arena, &mut stats, &key("a"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("b"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("c"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("d"), 0, "MainThread", -1, 0).unwrap();
        on_return(&mut ctx, &mut arena, &mut stats, 1); // d
        on_return(&mut ctx, &mut arena, &mut stats, 3); // c
        on_return(&mut ctx, &mut arena, &mut stats, 5); // b
        on_return(&mut ctx, &mut arena, &mut stats, 6); // a

        let get = |n: &str| stats.get_by_full_name(&format!("mod:1 {n}")).unwrap();
        assert_eq!((get("d").ttot, get("d").tsub), (1, 1));
        assert_eq!((get("c").ttot, get("c").tsub), (3, 2));
        assert_eq!((get("b").ttot, get("b").tsub), (5, 2));
        assert_eq!((get("a").ttot, get("a").tsub), (6, 1));
    }

    #[test]
    fn mutual_recursion_counts_ttot_once_per_outermost_entry_per_function() {
        // a -> b -> a (recursive), returns at ticks 13 (a, inner), 19 (b), 20 (a, outer).
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);

        on_call(&mut ctx, &mut arena, &mut stats, &key("a"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("b"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("a"), 0, "MainThread", -1, 0).unwrap();
        on_return(&mut ctx, &mut arena, &mut stats, 13); // inner a, recursive
        on_return(&mut ctx, &mut arena, &mut stats, 19); // b
        on_return(&mut ctx, &mut arena, &mut stats, 20); // outer a

        let a = stats.get_by_full_name("mod:1 a").unwrap();
        let b = stats.get_by_full_name("mod:1 b").unwrap();
        assert_eq!(a.ncall, 2);
        assert_eq!(a.nactualcall, 1);
        assert_eq!(a.ttot, 20);
        assert_eq!(b.ncall, 1);
        assert_eq!(b.nactualcall, 1);
        assert_eq!(b.ttot, 19);
        // P1/P2 hold regardless of how the ambiguous recursive-apportionment
        // corner of §4.5/§9 is resolved (see DESIGN.md).
        assert!(a.tsub <= a.ttot);
        assert!(b.tsub <= b.ttot);
    }

    #[test]
    fn stale_return_on_empty_stack_is_a_no_op() {
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);
        on_return(&mut ctx, &mut arena, &mut stats, 100);
        assert!(ctx.call_stack.is_empty());
        assert_eq!(stats.len(), 0);
    }

    #[test]
    fn peak_depth_tracks_the_deepest_call_stack_reached() {
        let mut ctx = new_context();
        let mut arena = new_arena();
        let mut stats = StatsStore::new(ClockMode::Cpu);
        on_call(&mut ctx, &mut arena, &mut stats, &key("a"), 0, "MainThread", -1, 0).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("b"), 0, "MainThread", -1, 1).unwrap();
        on_call(&mut ctx, &mut arena, &mut stats, &key("c"), 0, "MainThread", -1, 2).unwrap();
        on_return(&mut ctx, &mut arena, &mut stats, 3);
        on_return(&mut ctx, &mut arena, &mut stats, 4);
        on_return(&mut ctx, &mut arena, &mut stats, 5);
        assert_eq!(ctx.peak_depth, 3);
    }

    #[test]
    fn arena_exhaustion_surfaces_as_out_of_memory() {
        let mut ctx = new_context();
        let mut arena: FreeList<ActiveFrame> = FreeList::new(1);
        let mut stats = StatsStore::new(ClockMode::Cpu);
        on_call(&mut ctx, &mut arena, &mut stats, &key("a"), 0, "MainThread", -1, 0).unwrap();
        let err = on_call(&mut ctx, &mut arena, &mut stats, &key("b"), 0, "MainThread", -1, 1);
        assert!(matches!(err, Err(crate::error::ProfilerError::OutOfMemory(_))));
    }
}
