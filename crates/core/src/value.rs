//! Value: what the language talks about.
//!
//! Mirrors the split the teacher's `crates/core/src/value.rs` draws between
//! "pure data" variants (cloned structurally, no sharing) and the few
//! variants that are refcounted on purpose (`Channel`, `Ref` here; `Closure`
//! and `Variant` there). Here, `Closure` environments are *not* refcounted:
//! spec 4.1 requires `deep_clone` to deep-clone a closure's captured
//! environment rather than share it, so `Closure` is plain owned data behind
//! a `Box` (needed only to give the recursive type a known size) and
//! `#[derive(Clone)]` on `Value` already performs the correct deep clone.
//! `Channel` and `Ref` use `Arc` because spec 4.1 says they clone by
//! refcount bump, matching the teacher's `Arc<ChannelData>` exactly.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::arena::RegionRef;

/// Phase tag carried by every value (spec 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Mutable; lives on the flux heap.
    Flux,
    /// Deeply immutable; lives in an arena region.
    Crystal,
    /// Shallow-immutable: top level frozen, children still mutable.
    Sublimated,
    /// No explicit phase was given (only legal in casual mode).
    Unphased,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Flux => "flux",
            Phase::Crystal => "crystal",
            Phase::Sublimated => "sublimated",
            Phase::Unphased => "unphased",
        };
        f.write_str(s)
    }
}

impl Phase {
    /// Crystal and sublimated values reject mutation of their own slots (spec 3.1).
    pub fn blocks_own_mutation(self) -> bool {
        matches!(self, Phase::Crystal | Phase::Sublimated)
    }
}

/// Channel data: MPMC sender/receiver pair, refcounted so duplicating a
/// `Value::Channel` just shares the underlying queue (spec 3.1, 4.9).
/// Grounded directly on the teacher's `ChannelData` (crates/core/src/value.rs).
pub struct ChannelData {
    pub sender: may::sync::mpmc::Sender<Value>,
    pub receiver: may::sync::mpmc::Receiver<Value>,
    pub closed: std::sync::atomic::AtomicBool,
}

impl fmt::Debug for ChannelData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelData")
            .field("closed", &self.closed.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

/// A record declaration instance: name, parallel field name/value arrays,
/// and an optional per-field phase override map used by partial freeze /
/// freeze-except (spec 3.1, 4.6).
#[derive(Debug, Clone)]
pub struct StructData {
    pub name: String,
    pub field_names: Vec<String>,
    pub field_values: Vec<Value>,
    pub field_phases: Option<HashMap<String, Phase>>,
}

impl StructData {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|n| n == name)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.field_index(name).map(|i| &self.field_values[i])
    }

    pub fn field_phase(&self, name: &str) -> Option<Phase> {
        self.field_phases.as_ref().and_then(|m| m.get(name).copied())
    }
}

/// A tagged-sum payload: enum name, variant name, ordered payload (spec 3.1).
#[derive(Debug, Clone)]
pub struct EnumData {
    pub enum_name: String,
    pub variant_name: String,
    pub payload: Vec<Value>,
}

/// A single formal parameter (spec 3.4).
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub type_name: Option<String>,
    pub phase: Option<Phase>,
    pub default: Option<Arc<crate::ast::Expr>>,
    pub variadic: bool,
}

/// A closure: parameters, a reference to the (externally owned) AST body,
/// the environment captured at creation time, and an optional native
/// function pointer standing in for a compiled/builtin implementation
/// (spec 3.1, 3.4, open question "compiled closures repurpose region_id" —
/// resolved here by using a distinct field instead of overloading `region`,
/// per the spec's own suggested alternative).
pub struct ClosureData {
    pub params: Vec<Param>,
    pub body: Arc<crate::ast::Expr>,
    pub env: crate::environment::Environment,
    pub variadic: bool,
    pub native: Option<NativeFn>,
}

/// Native function pointer: the "extension" ABI convention from spec §6 —
/// returns a `Value` or errors by returning the sentinel-prefixed string
/// `"EVAL_ERROR:..."`, unwrapped by the caller. The "VM-style" convention
/// (thread-local error slot) is `crate::error`.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

impl Clone for ClosureData {
    fn clone(&self) -> Self {
        ClosureData {
            params: self.params.clone(),
            body: self.body.clone(),
            env: self.env.clone(),
            variadic: self.variadic,
            native: self.native.clone(),
        }
    }
}

impl fmt::Debug for ClosureData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureData")
            .field("params", &self.params)
            .field("variadic", &self.variadic)
            .field("native", &self.native.is_some())
            .finish()
    }
}

impl PartialEq for ClosureData {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// The value payload, independent of phase/region metadata (spec 3.1).
#[derive(Debug, Clone)]
pub enum ValueKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
    Unit,
    Str(String),
    Array(Vec<Value>),
    /// Open-addressed in spec prose; `HashMap` gives the same O(1) contract
    /// without hand-rolling probing, matching how the teacher treats `Map`
    /// as "just" a `HashMap` wrapper (crates/runtime/src/value.rs `MapKey`).
    Map(HashMap<String, Value>),
    /// A hash table used as a set. Values need not all be structurally
    /// hashable (arrays/maps/structs can be set members per spec 3.1), so
    /// membership is by `eq()` over a flat `Vec` rather than a real hash
    /// table — documented trade-off, see DESIGN.md.
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    Buffer(Vec<u8>),
    Struct(StructData),
    Enum(EnumData),
    /// Inclusive start, exclusive end.
    Range(i64, i64),
    Closure(Box<ClosureData>),
    Channel(Arc<ChannelData>),
    Ref(Arc<Mutex<Value>>),
}

/// A pressure mode constrains how a flux container may be reallocated
/// in place (spec 3.1 / §4.7 `pressurize`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PressureMode {
    NoGrow,
    NoShrink,
    NoResize,
    ReadHeavy,
}

/// A value: payload plus phase/region metadata (spec 3.1).
#[derive(Debug, Clone)]
pub struct Value {
    pub kind: ValueKind,
    pub phase: Phase,
    pub region: RegionRef,
    pub pressure: Option<PressureMode>,
}

impl Value {
    pub fn new(kind: ValueKind, phase: Phase) -> Self {
        Value { kind, phase, region: RegionRef::None, pressure: None }
    }

    pub fn flux(kind: ValueKind) -> Self {
        Value::new(kind, Phase::Flux)
    }

    pub fn int(n: i64) -> Self {
        Value::flux(ValueKind::Int(n))
    }
    pub fn float(n: f64) -> Self {
        Value::flux(ValueKind::Float(n))
    }
    pub fn bool(b: bool) -> Self {
        Value::flux(ValueKind::Bool(b))
    }
    pub fn nil() -> Self {
        Value::flux(ValueKind::Nil)
    }
    pub fn unit() -> Self {
        Value::flux(ValueKind::Unit)
    }
    pub fn string(s: impl Into<String>) -> Self {
        Value::flux(ValueKind::Str(s.into()))
    }
    pub fn array(items: Vec<Value>) -> Self {
        Value::flux(ValueKind::Array(items))
    }

    /// `is_truthy` (spec 4.1): false for Nil, Unit, Bool(false), zero
    /// Int/Float, and empty String/Array/Map/Set; true otherwise.
    pub fn is_truthy(&self) -> bool {
        match &self.kind {
            ValueKind::Nil | ValueKind::Unit => false,
            ValueKind::Bool(b) => *b,
            ValueKind::Int(n) => *n != 0,
            ValueKind::Float(n) => *n != 0.0,
            ValueKind::Str(s) => !s.is_empty(),
            ValueKind::Array(a) => !a.is_empty(),
            ValueKind::Map(m) => !m.is_empty(),
            ValueKind::Set(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// `eq` (spec 4.1): structural equality; Nil equals only Nil; unrelated
    /// types compare unequal. Reflexive/symmetric/transitive (P6).
    pub fn eq_value(&self, other: &Value) -> bool {
        use ValueKind::*;
        match (&self.kind, &other.kind) {
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Bool(a), Bool(b)) => a == b,
            (Nil, Nil) => true,
            (Unit, Unit) => true,
            (Str(a), Str(b)) => a == b,
            (Array(a), Array(b)) | (Tuple(a), Tuple(b)) | (Set(a), Set(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_value(y))
            }
            (Map(a), Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| v.eq_value(bv)))
            }
            (Buffer(a), Buffer(b)) => a == b,
            (Range(s1, e1), Range(s2, e2)) => s1 == s2 && e1 == e2,
            (Struct(a), Struct(b)) => {
                a.name == b.name
                    && a.field_names == b.field_names
                    && a.field_values.len() == b.field_values.len()
                    && a.field_values.iter().zip(&b.field_values).all(|(x, y)| x.eq_value(y))
            }
            (Enum(a), Enum(b)) => {
                a.enum_name == b.enum_name
                    && a.variant_name == b.variant_name
                    && a.payload.len() == b.payload.len()
                    && a.payload.iter().zip(&b.payload).all(|(x, y)| x.eq_value(y))
            }
            (Channel(a), Channel(b)) => Arc::ptr_eq(a, b),
            (Ref(a), Ref(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Rough type tag name, used in error messages and method dispatch.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ValueKind::Int(_) => "Int",
            ValueKind::Float(_) => "Float",
            ValueKind::Bool(_) => "Bool",
            ValueKind::Nil => "Nil",
            ValueKind::Unit => "Unit",
            ValueKind::Str(_) => "String",
            ValueKind::Array(_) => "Array",
            ValueKind::Map(_) => "Map",
            ValueKind::Set(_) => "Set",
            ValueKind::Tuple(_) => "Tuple",
            ValueKind::Buffer(_) => "Buffer",
            ValueKind::Struct(s) => {
                // Leaked once per distinct struct name is acceptable: struct
                // declarations are finite and registered once at startup.
                &*Box::leak(s.name.clone().into_boxed_str())
            }
            ValueKind::Enum(_) => "Enum",
            ValueKind::Range(_, _) => "Range",
            ValueKind::Closure(_) => "Closure",
            ValueKind::Channel(_) => "Channel",
            ValueKind::Ref(_) => "Ref",
        }
    }

    /// Rough byte-size estimate, used for heap/region byte accounting
    /// (spec 3.3). Not exact (doesn't walk into nested Arc-shared data
    /// twice), but monotonic and adequate for the GC trigger policy.
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Value>();
        base + match &self.kind {
            ValueKind::Str(s) => s.len(),
            ValueKind::Array(a) | ValueKind::Set(a) | ValueKind::Tuple(a) => {
                a.iter().map(Value::approx_size).sum()
            }
            ValueKind::Map(m) => m.iter().map(|(k, v)| k.len() + v.approx_size()).sum(),
            ValueKind::Buffer(b) => b.len(),
            ValueKind::Struct(s) => s.field_values.iter().map(Value::approx_size).sum(),
            ValueKind::Enum(e) => e.payload.iter().map(Value::approx_size).sum(),
            _ => 0,
        }
    }

    /// Walks every directly-owned child value (one level), used by the GC
    /// marker and by phase-propagation (freeze/thaw) to recurse.
    pub fn children(&self) -> Vec<&Value> {
        match &self.kind {
            ValueKind::Array(a) | ValueKind::Set(a) | ValueKind::Tuple(a) => a.iter().collect(),
            ValueKind::Map(m) => m.values().collect(),
            ValueKind::Struct(s) => s.field_values.iter().collect(),
            ValueKind::Enum(e) => e.payload.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Value> {
        match &mut self.kind {
            ValueKind::Array(a) | ValueKind::Set(a) | ValueKind::Tuple(a) => a.iter_mut().collect(),
            ValueKind::Map(m) => m.values_mut().collect(),
            ValueKind::Struct(s) => s.field_values.iter_mut().collect(),
            ValueKind::Enum(e) => e.payload.iter_mut().collect(),
            _ => Vec::new(),
        }
    }
}

/// `deep_clone(v) = v` structurally, with mutation of the clone never
/// touching the original (P5) — for every variant except the
/// intentionally-shared `Channel`/`Ref`, which is exactly what
/// `#[derive(Clone)]` already gives us (see module doc comment).
pub fn deep_clone(v: &Value) -> Value {
    v.clone()
}
