//! Tree-walking evaluator, phase algebra, dispatch and concurrency for the
//! Prism scripting language.
//!
//! Module layout mirrors `phase-core`: a handful of focused modules,
//! re-exported flat from the crate root so an embedder only needs
//! `phase_runtime::{Evaluator, EvaluatorConfig, EvalError}` to get going.
//! `evaluator` is the only module with no direct teacher analog (the
//! teacher is a stack-based VM, not a tree-walker); everywhere else the
//! split follows modules already grounded in DESIGN.md.

pub mod builtins;
pub mod concurrency;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod evaluator;
pub mod methods;
pub mod module;
pub mod phase;

pub use builtins::{BuiltinRegistry, ExtensionFn, NativeConvention, VmStyleFn, ERROR_SENTINEL_PREFIX};
pub use concurrency::{ScopeJoin, SelectCandidate, SelectOutcome};
pub use config::{EvalMode, EvaluatorConfig};
pub use diagnostics::{DiagnosticsSnapshot, HeapStatsView, RegionStatsView};
pub use dispatch::FnRegistry;
pub use error::{EvalError, EvalResult, Flow, SignalKind, Trace, TraceFrame};
pub use evaluator::Evaluator;
pub use methods::Segment;
pub use module::{ModuleLoader, ModuleParser};
pub use phase::{Bond, BondGraph, BondStrategy, TrackStore};
