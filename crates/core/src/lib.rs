//! Value model and dual-heap memory manager.
//!
//! Module layout mirrors the teacher's `crates/core/src/lib.rs`: a small
//! number of focused modules, each re-exported flat from the crate root so
//! `phase_runtime` can pull in `phase_core::{Value, Environment, ...}`
//! without chasing submodule paths.

pub mod arena;
pub mod ast;
pub mod environment;
pub mod error;
pub mod gc;
pub mod heap;
pub mod value;

pub use arena::{Region, RegionRef, RegionStats, RegionStore};
pub use environment::{Environment, Scope};
pub use ast::Contract;
pub use error::{clear_runtime_error, format_panic_payload, has_runtime_error, set_runtime_error, take_runtime_error};
pub use gc::{gc_cycle, GcReport};
pub use heap::{FluxHeap, HeapStats};
pub use value::{deep_clone, ChannelData, ClosureData, EnumData, NativeFn, Param, Phase, PressureMode, StructData, Value, ValueKind};
