//! Native function ABI (spec §6): two calling conventions coexist because
//! embedders wire in native functions written against either shape.
//!
//! - "Extension" convention: the function returns a `Value` on success, or
//!   a `Value::Str` carrying the sentinel prefix `"EVAL_ERROR:"` on
//!   failure. The caller is responsible for checking the sentinel.
//! - "VM-style" convention: the function returns its `Value` result
//!   unconditionally and reports failure by writing into the
//!   `phase_core::error` thread-local slot first; the caller checks
//!   `has_runtime_error()` immediately after the call returns.
//!
//! Both are ported in spirit from the teacher's `patch_seq_*` functions
//! (`crates/runtime/src/error.rs`), which use exactly the thread-local
//! slot convention for its whole `extern "C"` surface; the sentinel-string
//! convention is the natural "extension" counterpart spec §6 calls for
//! when no thread-local is available to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use phase_core::{clear_runtime_error, has_runtime_error, take_runtime_error, Value, ValueKind};

use crate::error::EvalError;

pub const ERROR_SENTINEL_PREFIX: &str = "EVAL_ERROR:";

pub type ExtensionFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;
pub type VmStyleFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

#[derive(Clone)]
pub enum NativeConvention {
    Extension(ExtensionFn),
    VmStyle(VmStyleFn),
}

#[derive(Default, Clone)]
pub struct BuiltinRegistry {
    fns: HashMap<String, NativeConvention>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_extension(&mut self, name: impl Into<String>, f: ExtensionFn) {
        self.fns.insert(name.into(), NativeConvention::Extension(f));
    }

    pub fn register_vm_style(&mut self, name: impl Into<String>, f: VmStyleFn) {
        self.fns.insert(name.into(), NativeConvention::VmStyle(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let convention = self
            .fns
            .get(name)
            .ok_or_else(|| EvalError::undefined_name(name, None))?;

        match convention {
            NativeConvention::Extension(f) => {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(args)))
                    .map_err(|p| EvalError::internal(phase_core::format_panic_payload(p)))?;
                match &result.kind {
                    phase_core::ValueKind::Str(s) if s.starts_with(ERROR_SENTINEL_PREFIX) => {
                        Err(EvalError::internal(s[ERROR_SENTINEL_PREFIX.len()..].to_string()))
                    }
                    _ => Ok(result),
                }
            }
            NativeConvention::VmStyle(f) => {
                clear_runtime_error();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(args)))
                    .map_err(|p| EvalError::internal(phase_core::format_panic_payload(p)))?;
                if has_runtime_error() {
                    Err(EvalError::internal(take_runtime_error().unwrap_or_default()))
                } else {
                    Ok(result)
                }
            }
        }
    }
}

/// Registers the small set of always-available builtins. Embedders extend
/// this registry with their own native functions via `register_extension`/
/// `register_vm_style`.
pub fn install_defaults(registry: &mut BuiltinRegistry) {
    registry.register_extension(
        "type_of",
        Arc::new(|args: &[Value]| match args.first() {
            Some(v) => Value::string(v.type_name()),
            None => Value::string(format!("{ERROR_SENTINEL_PREFIX}type_of expects 1 argument")),
        }),
    );

    registry.register_extension(
        "len",
        Arc::new(|args: &[Value]| {
            use phase_core::ValueKind::*;
            match args.first().map(|v| &v.kind) {
                Some(Array(a)) | Some(Set(a)) | Some(Tuple(a)) => Value::int(a.len() as i64),
                Some(Map(m)) => Value::int(m.len() as i64),
                Some(Str(s)) => Value::int(s.chars().count() as i64),
                Some(Buffer(b)) => Value::int(b.len() as i64),
                _ => Value::string(format!("{ERROR_SENTINEL_PREFIX}len expects a collection")),
            }
        }),
    );

    registry.register_vm_style(
        "assert",
        Arc::new(|args: &[Value]| {
            let ok = args.first().is_some_and(Value::is_truthy);
            if !ok {
                let message = match args.get(1) {
                    Some(v) => format!("assertion failed: {v:?}"),
                    None => "assertion failed".to_string(),
                };
                phase_core::set_runtime_error(message);
            }
            Value::unit()
        }),
    );

    registry.register_extension(
        "json_stringify",
        Arc::new(|args: &[Value]| match args.first() {
            Some(v) => match value_to_json(v) {
                Ok(json) => Value::string(json.to_string()),
                Err(e) => Value::string(format!("{ERROR_SENTINEL_PREFIX}{e}")),
            },
            None => Value::string(format!("{ERROR_SENTINEL_PREFIX}json_stringify expects 1 argument")),
        }),
    );

    registry.register_extension(
        "json_parse",
        Arc::new(|args: &[Value]| match args.first().map(|v| &v.kind) {
            Some(ValueKind::Str(s)) => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(json) => json_to_value(&json),
                Err(e) => Value::string(format!("{ERROR_SENTINEL_PREFIX}invalid JSON: {e}")),
            },
            _ => Value::string(format!("{ERROR_SENTINEL_PREFIX}json_parse expects a String argument")),
        }),
    );
}

/// Converts a `Value` to its JSON representation (spec §8.2 round-trip
/// property). Types with no JSON counterpart (`Channel`, `Closure`, `Ref`,
/// ...) are rejected rather than silently coerced.
fn value_to_json(v: &Value) -> Result<serde_json::Value, String> {
    match &v.kind {
        ValueKind::Nil | ValueKind::Unit => Ok(serde_json::Value::Null),
        ValueKind::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        ValueKind::Int(n) => Ok(serde_json::Value::Number((*n).into())),
        ValueKind::Float(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| "cannot JSON-encode a non-finite Float".to_string()),
        ValueKind::Str(s) => Ok(serde_json::Value::String(s.clone())),
        ValueKind::Array(a) | ValueKind::Tuple(a) | ValueKind::Set(a) => {
            a.iter().map(value_to_json).collect::<Result<Vec<_>, _>>().map(serde_json::Value::Array)
        }
        ValueKind::Map(m) => {
            let mut obj = serde_json::Map::with_capacity(m.len());
            for (k, v) in m {
                obj.insert(k.clone(), value_to_json(v)?);
            }
            Ok(serde_json::Value::Object(obj))
        }
        other => Err(format!("cannot JSON-encode a value of type `{}`", Value::new(other.clone(), v.phase).type_name())),
    }
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::nil(),
        serde_json::Value::Bool(b) => Value::bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::int(i)
            } else {
                Value::float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::string(s.clone()),
        serde_json::Value::Array(items) => Value::array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(obj) => {
            let map: HashMap<String, Value> = obj.iter().map(|(k, v)| (k.clone(), json_to_value(v))).collect();
            Value::flux(ValueKind::Map(map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_convention_reports_sentinel_as_error() {
        let mut registry = BuiltinRegistry::new();
        install_defaults(&mut registry);
        let err = registry.call("len", &[Value::int(1)]).unwrap_err();
        assert!(matches!(err, EvalError::Internal { .. }));
    }

    #[test]
    fn extension_convention_success() {
        let mut registry = BuiltinRegistry::new();
        install_defaults(&mut registry);
        let v = registry.call("type_of", &[Value::int(1)]).unwrap();
        assert!(v.eq_value(&Value::string("Int")));
    }

    #[test]
    fn vm_style_convention_reports_via_thread_local() {
        let mut registry = BuiltinRegistry::new();
        install_defaults(&mut registry);
        let err = registry.call("assert", &[Value::bool(false)]).unwrap_err();
        assert!(matches!(err, EvalError::Internal { .. }));
        assert!(registry.call("assert", &[Value::bool(true)]).is_ok());
    }
}
