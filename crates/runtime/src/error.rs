//! Evaluator error taxonomy (spec §7).
//!
//! The teacher never reaches for `thiserror`/`anyhow` anywhere in its
//! workspace (it propagates errors as raw `String`s through the
//! `patch_seq_*` FFI boundary). `ph1losof-ecolog-lsp`'s `Cargo.toml` shows
//! the idiom this codebase actually wants for a rich, structured error
//! enum with a derive-generated `Display`, so that's where this is
//! borrowed from.

use std::fmt;

/// One evaluation frame, for error traces (spec §7 "optional trace").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub location: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "in {} ({})", self.function, loc),
            None => write!(f, "in {}", self.function),
        }
    }
}

pub type Trace = Vec<TraceFrame>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    #[error("arity error: {message}")]
    Arity { message: String, trace: Trace },

    #[error("type error: {message}")]
    Type { message: String, trace: Trace, suggestion: Option<String> },

    #[error("phase violation: {message}")]
    PhaseViolation { message: String, trace: Trace },

    #[error("contract violation: {message}")]
    ContractViolation { message: String, trace: Trace },

    #[error("bounds error: {message}")]
    Bounds { message: String, trace: Trace },

    #[error("division by zero")]
    DivisionByZero { trace: Trace },

    #[error("undefined name: {name}{}", suggestion.as_ref().map(|s| format!(" (did you mean `{s}`?)")).unwrap_or_default())]
    UndefinedName { name: String, suggestion: Option<String>, trace: Trace },

    #[error("pressure violation: {message}")]
    PressureViolation { message: String, trace: Trace },

    #[error("channel closed")]
    ChannelClosed { trace: Trace },

    #[error("concurrency misuse: {message}")]
    ConcurrencyMisuse { message: String, trace: Trace },

    #[error("io error: {message}")]
    Io { message: String, trace: Trace },

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("internal error: {message}")]
    Internal { message: String, trace: Trace },
}

impl EvalError {
    pub fn trace(&self) -> &[TraceFrame] {
        match self {
            EvalError::Arity { trace, .. }
            | EvalError::Type { trace, .. }
            | EvalError::PhaseViolation { trace, .. }
            | EvalError::ContractViolation { trace, .. }
            | EvalError::Bounds { trace, .. }
            | EvalError::DivisionByZero { trace }
            | EvalError::UndefinedName { trace, .. }
            | EvalError::PressureViolation { trace, .. }
            | EvalError::ChannelClosed { trace }
            | EvalError::ConcurrencyMisuse { trace, .. }
            | EvalError::Io { trace, .. }
            | EvalError::Internal { trace, .. } => trace,
            EvalError::Parse { .. } => &[],
        }
    }

    pub fn push_frame(mut self, frame: TraceFrame) -> Self {
        match &mut self {
            EvalError::Arity { trace, .. }
            | EvalError::Type { trace, .. }
            | EvalError::PhaseViolation { trace, .. }
            | EvalError::ContractViolation { trace, .. }
            | EvalError::Bounds { trace, .. }
            | EvalError::DivisionByZero { trace }
            | EvalError::UndefinedName { trace, .. }
            | EvalError::PressureViolation { trace, .. }
            | EvalError::ChannelClosed { trace }
            | EvalError::ConcurrencyMisuse { trace, .. }
            | EvalError::Io { trace, .. }
            | EvalError::Internal { trace, .. } => trace.push(frame),
            EvalError::Parse { .. } => {}
        }
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EvalError::Internal { message: message.into(), trace: Vec::new() }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        EvalError::Type { message: message.into(), trace: Vec::new(), suggestion: None }
    }

    pub fn undefined_name(name: impl Into<String>, suggestion: Option<String>) -> Self {
        EvalError::UndefinedName { name: name.into(), suggestion, trace: Vec::new() }
    }
}

/// Non-error control-flow signals: `return`/`break`/`continue` propagate as
/// data, never as host-language exceptions (spec §4, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Return,
    Break,
    Continue,
}

#[derive(Debug, Clone)]
pub enum Flow {
    Value(phase_core::Value),
    Signal(SignalKind, phase_core::Value),
}

impl Flow {
    /// Unwraps a plain value, turning a stray `break`/`continue`/`return`
    /// into an internal error — used at the top of blocks/arguments where a
    /// signal reaching this far is a contract violation of the evaluator's
    /// own invariants, not of the user's program.
    pub fn into_value(self) -> Result<phase_core::Value, EvalError> {
        match self {
            Flow::Value(v) => Ok(v),
            Flow::Signal(kind, _) => Err(EvalError::internal(format!(
                "unexpected {:?} signal outside of its enclosing construct",
                kind
            ))),
        }
    }
}

pub type EvalResult = Result<Flow, EvalError>;

pub fn ok(v: phase_core::Value) -> EvalResult {
    Ok(Flow::Value(v))
}
