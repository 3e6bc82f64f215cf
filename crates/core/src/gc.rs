//! GC driver: the five-step cycle from spec 4.2, run across both heaps.
//!
//! 1. advance the region epoch
//! 2. enumerate roots (environment scopes, plus any caller-supplied
//!    temporaries still live on the evaluator's "saved env" / pending-value
//!    stack during expression evaluation)
//! 3. mark: walk every root transitively, recording live bytes and which
//!    region ids are still reachable
//! 4. sweep: regions not found reachable are dropped as a unit
//! 5. publish fresh stats (current bytes, region count) for `diagnostics`
//!
//! Ordinary Rust ownership already reclaims flux-heap memory; there is no
//! "free" step for it here by design (see `heap.rs` and `arena.rs`).

use std::collections::HashSet;

use crate::arena::{RegionRef, RegionStore};
use crate::environment::Environment;
use crate::heap::FluxHeap;
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct GcReport {
    pub live_bytes: usize,
    pub regions_collected: usize,
    pub epoch: u64,
}

fn walk(value: &Value, live_bytes: &mut usize, reachable_regions: &mut HashSet<u64>) {
    *live_bytes += value.approx_size();
    if let RegionRef::Id(id) = value.region {
        reachable_regions.insert(id);
    }
    for child in value.children() {
        walk(child, live_bytes, reachable_regions);
    }
}

/// Runs one full GC cycle. `extra_roots` covers values not yet bound into
/// `env` — intermediate results the evaluator is holding onto mid-expression
/// (spec 4.2 step 2's "saved environments / pending call frames").
pub fn gc_cycle(
    env: &Environment,
    extra_roots: &[&Value],
    heap: &FluxHeap,
    regions: &mut RegionStore,
) -> GcReport {
    let mut live_bytes = 0usize;
    let mut reachable = HashSet::new();

    for value in env.all_values() {
        walk(value, &mut live_bytes, &mut reachable);
    }
    for value in extra_roots {
        walk(value, &mut live_bytes, &mut reachable);
    }

    let regions_collected = regions.sweep(&reachable);
    heap.reset_to(live_bytes);

    GcReport { live_bytes, regions_collected, epoch: regions.epoch() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Phase, Value, ValueKind};

    #[test]
    fn unreachable_region_is_swept() {
        let mut regions = RegionStore::new();
        let id = regions.create_region();
        let heap = FluxHeap::default();
        let env = Environment::new();

        let report = gc_cycle(&env, &[], &heap, &mut regions);
        assert_eq!(report.regions_collected, 1);
        assert!(!regions.contains(id));
    }

    #[test]
    fn reachable_region_survives() {
        let mut regions = RegionStore::new();
        let id = regions.create_region();
        let heap = FluxHeap::default();
        let mut env = Environment::new();
        let mut v = Value::new(ValueKind::Int(1), Phase::Crystal);
        v.region = RegionRef::Id(id);
        env.define("x", v);

        let report = gc_cycle(&env, &[], &heap, &mut regions);
        assert_eq!(report.regions_collected, 0);
        assert!(regions.contains(id));
    }
}
