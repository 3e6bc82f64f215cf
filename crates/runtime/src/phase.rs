//! Phase algebra (spec §4.6/§4.7): freeze/thaw/anneal/sublimate/crystallize/
//! borrow/partial-freeze/freeze-except, plus bond graphs, react callbacks,
//! seed contracts, pressure modes, and track/history/rewind.
//!
//! No teacher analog for the transitions themselves (there is no phase
//! concept in a concatenative stack VM); region creation/retention is
//! grounded on `core::arena::RegionStore`, and the fixed-capacity history
//! cap follows the same reasoning as the teacher's `StrandRegistry`
//! (DESIGN.md).

use std::collections::{HashMap, HashSet, VecDeque};

use phase_core::{Phase, PressureMode, RegionRef, RegionStore, Value, ValueKind};

use crate::error::EvalError;

/// Recursively re-tags `v` and every owned child with `phase`, leaving
/// `region` untouched — used as the last step of each transition below.
fn retag_phase(v: &mut Value, phase: Phase) {
    v.phase = phase;
    for child in v.children_mut() {
        retag_phase(child, phase);
    }
}

fn retag_region(v: &mut Value, region: RegionRef) {
    v.region = region;
    for child in v.children_mut() {
        retag_region(child, region);
    }
}

/// `freeze(v)`: deep-clones `v`, tags the clone and every descendant
/// Crystal, creates a durable region, and retains the clone there so the
/// region can be collected as a whole once unreachable (spec 4.6a).
pub fn freeze(v: &Value, regions: &mut RegionStore) -> Value {
    let mut clone = v.clone();
    retag_phase(&mut clone, Phase::Crystal);
    let id = regions.create_region();
    retag_region(&mut clone, RegionRef::Id(id));
    if let Some(region) = regions.get_mut(id) {
        region.retain(clone.clone());
    }
    clone
}

/// `thaw(v)`: deep-clones `v` back to Flux, detached from any region
/// (spec 4.6b). `thaw(freeze(v)) == v` structurally (P1 thaw∘freeze).
pub fn thaw(v: &Value) -> Value {
    let mut clone = v.clone();
    retag_phase(&mut clone, Phase::Flux);
    retag_region(&mut clone, RegionRef::None);
    clone
}

/// `anneal(v)`: freezes in place without an intervening deep clone —
/// intended for a value about to be moved out of flux ownership anyway
/// (e.g. `let y = anneal(x)` immediately following `x`'s last use).
/// Consumes `v` to make that "no more mutable aliases survive" intent
/// explicit at the type level.
pub fn anneal(mut v: Value, regions: &mut RegionStore) -> Value {
    retag_phase(&mut v, Phase::Crystal);
    let id = regions.create_region();
    retag_region(&mut v, RegionRef::Id(id));
    if let Some(region) = regions.get_mut(id) {
        region.retain(v.clone());
    }
    v
}

/// `sublimate(v)`: shallow freeze — only the top-level value becomes
/// immutable; direct children keep their existing phase (spec 4.6c).
pub fn sublimate(v: &Value) -> Value {
    let mut clone = v.clone();
    clone.phase = Phase::Sublimated;
    clone
}

/// `crystallize(v)`: like `freeze`, but the region created is `Ephemeral`
/// rather than a durable, GC-tracked id — it's reclaimed on the very next
/// GC cycle unless something later promotes it (spec 4.6d, GLOSSARY
/// "ephemeral region").
pub fn crystallize(v: &Value) -> Value {
    let mut clone = v.clone();
    retag_phase(&mut clone, Phase::Crystal);
    retag_region(&mut clone, RegionRef::Ephemeral);
    clone
}

/// `borrow(v)`: a temporary, read-only alias of `v` that does not change
/// its owning phase. Implemented as a `Sublimated`-tagged clone: the
/// borrower can read through it like the original, but attempts to use it
/// as an lvalue are rejected by the same phase check a real sublimated
/// value gets. A literal zero-copy borrow would need `Value` to carry a
/// lifetime, which would infect every container in the evaluator; this is
/// the safe-Rust approximation, noted in DESIGN.md.
pub fn borrow(v: &Value) -> Value {
    let mut clone = v.clone();
    if clone.phase == Phase::Flux {
        clone.phase = Phase::Sublimated;
    }
    clone
}

/// `partial_freeze(v, fields)`: only on `Struct` — freezes the named
/// fields, recording per-field overrides so the rest of the struct keeps
/// its original phase (spec 4.6e).
pub fn partial_freeze(v: &Value, fields: &[String], regions: &mut RegionStore) -> Result<Value, EvalError> {
    let mut clone = v.clone();
    let ValueKind::Struct(s) = &mut clone.kind else {
        return Err(EvalError::type_error(format!(
            "partial_freeze expects a struct, got {}",
            v.type_name()
        )));
    };
    let mut overrides = s.field_phases.clone().unwrap_or_default();
    for name in fields {
        let idx = s
            .field_index(name)
            .ok_or_else(|| EvalError::type_error(format!("no such field `{name}`")))?;
        let frozen = freeze(&s.field_values[idx], regions);
        s.field_values[idx] = frozen;
        overrides.insert(name.clone(), Phase::Crystal);
    }
    s.field_phases = Some(overrides);
    Ok(clone)
}

/// `freeze_except(v, fields)`: the inverse of `partial_freeze` — freezes
/// every field except the named ones (spec 4.6f).
pub fn freeze_except(v: &Value, excluded: &[String], regions: &mut RegionStore) -> Result<Value, EvalError> {
    let mut clone = v.clone();
    let ValueKind::Struct(s) = &mut clone.kind else {
        return Err(EvalError::type_error(format!(
            "freeze_except expects a struct, got {}",
            v.type_name()
        )));
    };
    let excluded: HashSet<&String> = excluded.iter().collect();
    let mut overrides = s.field_phases.clone().unwrap_or_default();
    for (idx, name) in s.field_names.clone().iter().enumerate() {
        if excluded.contains(name) {
            continue;
        }
        s.field_values[idx] = freeze(&s.field_values[idx], regions);
        overrides.insert(name.clone(), Phase::Crystal);
    }
    s.field_phases = Some(overrides);
    Ok(clone)
}

/// `pressurize(v, mode)`: tags a flux container with an allocation
/// constraint, checked by the relevant mutating method before it resizes
/// the backing storage (spec 4.7 pressure modes).
pub fn pressurize(v: &Value, mode: PressureMode) -> Value {
    let mut clone = v.clone();
    clone.pressure = Some(mode);
    clone
}

/// Checks a pending resize against a value's pressure mode, returning a
/// `PressureViolation` if it's disallowed.
pub fn check_pressure(v: &Value, old_len: usize, new_len: usize) -> Result<(), EvalError> {
    let Some(mode) = v.pressure else { return Ok(()) };
    let violated = match mode {
        PressureMode::NoGrow => new_len > old_len,
        PressureMode::NoShrink => new_len < old_len,
        PressureMode::NoResize => new_len != old_len,
        PressureMode::ReadHeavy => false,
    };
    if violated {
        Err(EvalError::PressureViolation {
            message: format!("{mode:?} forbids resizing from {old_len} to {new_len}"),
            trace: Vec::new(),
        })
    } else {
        Ok(())
    }
}

/// Bounded history of snapshots per tracked variable (spec 4.7
/// `track`/`history`/`rewind`; cap documented in DESIGN.md).
#[derive(Default)]
pub struct TrackStore {
    tracked: HashSet<String>,
    snapshots: HashMap<String, VecDeque<Value>>,
    cap: usize,
}

impl TrackStore {
    pub fn new(cap: usize) -> Self {
        TrackStore { tracked: HashSet::new(), snapshots: HashMap::new(), cap }
    }

    pub fn track(&mut self, name: &str) {
        self.tracked.insert(name.to_string());
        self.snapshots.entry(name.to_string()).or_default();
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.tracked.contains(name)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Records `value` as the variable's state *before* the mutation about
    /// to replace it; call this just before assigning a new value in.
    pub fn record(&mut self, name: &str, value: Value) {
        if !self.tracked.contains(name) {
            return;
        }
        let entries = self.snapshots.entry(name.to_string()).or_default();
        entries.push_back(value);
        while entries.len() > self.cap {
            entries.pop_front();
        }
    }

    pub fn history(&self, name: &str) -> Vec<Value> {
        self.snapshots.get(name).map(|d| d.iter().cloned().collect()).unwrap_or_default()
    }

    /// Reverts `name` `steps` snapshots back, returning the restored value
    /// and discarding everything newer, or `None` if there isn't enough
    /// history.
    pub fn rewind(&mut self, name: &str, steps: usize) -> Option<Value> {
        let entries = self.snapshots.get_mut(name)?;
        if steps == 0 || steps > entries.len() {
            return None;
        }
        let keep = entries.len() - steps;
        entries.truncate(keep);
        entries.back().cloned()
    }
}

/// How a bonded target value tracks its source (spec 4.7 `bond`).
#[derive(Debug, Clone)]
pub enum BondStrategy {
    /// Target always equals the source.
    Mirror,
    /// Target always equals the logical negation/inverse of the source
    /// (booleans invert, numbers negate).
    Inverse,
    /// Target only follows the source while a guard predicate (evaluated
    /// by the caller against the new source value) holds.
    Gate,
}

pub struct Bond {
    pub source: String,
    pub target: String,
    pub strategy: BondStrategy,
}

/// Bond graph: which variables propagate into which others, and with what
/// strategy. Cascade termination (P8) is enforced by the caller tracking
/// a `visiting` set while walking edges — `out_edges` just exposes the
/// graph, it doesn't walk it itself, since walking requires evaluating the
/// target assignment (an evaluator concern).
#[derive(Default)]
pub struct BondGraph {
    edges: Vec<Bond>,
}

impl BondGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, source: impl Into<String>, target: impl Into<String>, strategy: BondStrategy) {
        self.edges.push(Bond { source: source.into(), target: target.into(), strategy });
    }

    pub fn out_edges(&self, source: &str) -> impl Iterator<Item = &Bond> {
        self.edges.iter().filter(move |b| b.source == source)
    }
}

/// Applies a bond's strategy to a freshly-assigned source value, producing
/// the value to assign to the target (spec 4.7). `Gate` is resolved by the
/// caller before calling this (it needs to evaluate a predicate closure);
/// by the time `apply` runs, a gated bond that didn't pass has already
/// been filtered out.
pub fn apply_bond_strategy(strategy: &BondStrategy, source_value: &Value) -> Value {
    match strategy {
        BondStrategy::Mirror | BondStrategy::Gate => source_value.clone(),
        BondStrategy::Inverse => {
            let mut v = source_value.clone();
            v.kind = match v.kind {
                ValueKind::Bool(b) => ValueKind::Bool(!b),
                ValueKind::Int(n) => ValueKind::Int(-n),
                ValueKind::Float(n) => ValueKind::Float(-n),
                other => other,
            };
            v
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phase_core::ValueKind;

    #[test]
    fn thaw_undoes_freeze() {
        let mut regions = RegionStore::new();
        let v = Value::array(vec![Value::int(1), Value::int(2)]);
        let frozen = freeze(&v, &mut regions);
        assert_eq!(frozen.phase, Phase::Crystal);
        let thawed = thaw(&frozen);
        assert_eq!(thawed.phase, Phase::Flux);
        assert!(thawed.eq_value(&v));
    }

    #[test]
    fn freeze_is_idempotent_structurally() {
        let mut regions = RegionStore::new();
        let v = Value::int(5);
        let once = freeze(&v, &mut regions);
        let twice = freeze(&once, &mut regions);
        assert!(once.eq_value(&twice));
        assert_eq!(twice.phase, Phase::Crystal);
    }

    #[test]
    fn sublimate_is_shallow() {
        let inner = Value::int(1);
        let v = Value::array(vec![inner]);
        let sub = sublimate(&v);
        assert_eq!(sub.phase, Phase::Sublimated);
        let ValueKind::Array(items) = &sub.kind else { panic!() };
        assert_eq!(items[0].phase, Phase::Flux);
    }

    #[test]
    fn pressure_no_grow_rejects_growth() {
        let v = pressurize(&Value::array(vec![Value::int(1)]), PressureMode::NoGrow);
        assert!(check_pressure(&v, 1, 2).is_err());
        assert!(check_pressure(&v, 1, 1).is_ok());
        assert!(check_pressure(&v, 1, 0).is_ok());
    }

    #[test]
    fn history_cap_evicts_oldest() {
        let mut store = TrackStore::new(2);
        store.track("x");
        store.record("x", Value::int(1));
        store.record("x", Value::int(2));
        store.record("x", Value::int(3));
        let hist = store.history("x");
        assert_eq!(hist.len(), 2);
        assert!(hist[0].eq_value(&Value::int(2)));
    }

    #[test]
    fn rewind_reverts_and_drops_newer() {
        let mut store = TrackStore::new(10);
        store.track("x");
        store.record("x", Value::int(1));
        store.record("x", Value::int(2));
        let restored = store.rewind("x", 1).unwrap();
        assert!(restored.eq_value(&Value::int(1)));
        assert_eq!(store.history("x").len(), 1);
    }
}
