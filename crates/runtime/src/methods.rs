//! Indexing, field access, and the built-in method catalogue (spec §4.8)
//! for `Array`/`Map`/`Set`/`String`/`Buffer`/`Tuple`/`Channel`/`Ref`.
//!
//! No teacher analog (`navicore-cem3`'s words operate on an untyped stack,
//! not named containers); the method set here is the minimal vocabulary
//! spec 4.8's method table implies, plus the phase/pressure checks every
//! mutating entry point needs before it touches a container in place.

use std::collections::HashMap;

use phase_core::{Value, ValueKind};

use crate::concurrency;
use crate::error::EvalError;
use crate::phase;

/// One step of a decomposed assignment target (`a.b[0].c = ...`).
pub enum Segment {
    Field(String),
    Index(Value),
}

fn type_err(msg: impl Into<String>) -> EvalError {
    EvalError::type_error(msg)
}

fn normalize_index(i: i64, len: usize) -> Result<usize, EvalError> {
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved as usize >= len {
        return Err(EvalError::Bounds { message: format!("index {i} out of bounds for length {len}"), trace: Vec::new() });
    }
    Ok(resolved as usize)
}

pub fn index_get(base: &Value, idx: &Value) -> Result<Value, EvalError> {
    match (&base.kind, &idx.kind) {
        (ValueKind::Array(a), ValueKind::Int(i)) | (ValueKind::Tuple(a), ValueKind::Int(i)) => {
            Ok(a[normalize_index(*i, a.len())?].clone())
        }
        (ValueKind::Str(s), ValueKind::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len())?;
            Ok(Value::string(chars[idx].to_string()))
        }
        (ValueKind::Buffer(b), ValueKind::Int(i)) => {
            let idx = normalize_index(*i, b.len())?;
            Ok(Value::int(b[idx] as i64))
        }
        (ValueKind::Map(m), ValueKind::Str(k)) => m
            .get(k)
            .cloned()
            .ok_or_else(|| EvalError::Bounds { message: format!("no such key `{k}` in map"), trace: Vec::new() }),
        (ValueKind::Range(start, end), ValueKind::Int(i)) => {
            let len = (end - start).max(0) as usize;
            let idx = normalize_index(*i, len)?;
            Ok(Value::int(start + idx as i64))
        }
        _ => Err(type_err(format!("cannot index a {} with a {}", base.type_name(), idx.type_name()))),
    }
}

pub fn field_get(base: &Value, name: &str) -> Result<Value, EvalError> {
    match &base.kind {
        ValueKind::Struct(s) => s
            .field(name)
            .cloned()
            .ok_or_else(|| EvalError::type_error(format!("no such field `{name}` on struct `{}`", s.name))),
        _ => Err(type_err(format!("{} has no field `{name}`", base.type_name()))),
    }
}

pub(crate) fn check_mutable(v: &Value) -> Result<(), EvalError> {
    if v.phase.blocks_own_mutation() {
        return Err(EvalError::PhaseViolation {
            message: format!("cannot mutate a {:?} value", v.phase),
            trace: Vec::new(),
        });
    }
    Ok(())
}

fn navigate_mut_step<'v>(cur: &'v mut Value, seg: &Segment) -> Result<&'v mut Value, EvalError> {
    match seg {
        Segment::Field(name) => {
            let ValueKind::Struct(s) = &mut cur.kind else {
                return Err(type_err(format!("cannot access field `{name}` on a {}", cur.type_name())));
            };
            let idx = s.field_index(name).ok_or_else(|| type_err(format!("no such field `{name}`")))?;
            Ok(&mut s.field_values[idx])
        }
        Segment::Index(key) => match (&mut cur.kind, &key.kind) {
            (ValueKind::Array(a), ValueKind::Int(i)) => {
                let idx = normalize_index(*i, a.len())?;
                Ok(&mut a[idx])
            }
            (ValueKind::Map(m), ValueKind::Str(k)) => {
                m.entry(k.clone()).or_insert_with(Value::nil);
                Ok(m.get_mut(k).expect("just inserted"))
            }
            _ => Err(type_err(format!("cannot navigate into a {}", cur.type_name()))),
        },
    }
}

fn set_final(cur: &mut Value, seg: &Segment, value: Value) -> Result<(), EvalError> {
    check_mutable(cur)?;
    match seg {
        Segment::Field(name) => {
            let ValueKind::Struct(s) = &mut cur.kind else {
                return Err(type_err(format!("cannot set field `{name}` on a {}", cur.type_name())));
            };
            if let Some(p) = s.field_phase(name) {
                if p.blocks_own_mutation() {
                    return Err(EvalError::PhaseViolation {
                        message: format!("field `{name}` is individually frozen"),
                        trace: Vec::new(),
                    });
                }
            }
            let idx = s.field_index(name).ok_or_else(|| type_err(format!("no such field `{name}`")))?;
            s.field_values[idx] = value;
            Ok(())
        }
        Segment::Index(key) => match (&mut cur.kind, &key.kind) {
            (ValueKind::Array(a), ValueKind::Int(i)) => {
                let idx = normalize_index(*i, a.len())?;
                a[idx] = value;
                Ok(())
            }
            (ValueKind::Map(m), ValueKind::Str(k)) => {
                // Maps have no separate per-key phase table like
                // `StructData::field_phases`; a key individually frozen via
                // `freeze(x["k"])` carries that phase on its own stored
                // value, so the existing entry's phase doubles as the
                // per-key override check.
                if let Some(existing) = m.get(k) {
                    if existing.phase.blocks_own_mutation() {
                        return Err(EvalError::PhaseViolation {
                            message: format!("key `{k}` is individually frozen"),
                            trace: Vec::new(),
                        });
                    }
                }
                m.insert(k.clone(), value);
                Ok(())
            }
            _ => Err(type_err(format!("cannot assign into a {}", cur.type_name()))),
        },
    }
}

/// Walks every segment, returning a mutable reference to the final target —
/// used by method calls, which (unlike `assign_path`) need the target
/// itself rather than a slot to overwrite.
pub fn navigate_mut<'v>(root: &'v mut Value, segments: &[Segment]) -> Result<&'v mut Value, EvalError> {
    let mut cur = root;
    for seg in segments {
        cur = navigate_mut_step(cur, seg)?;
    }
    Ok(cur)
}

/// Applies a fully-resolved assignment path to an owned root value (the
/// caller re-inserts `root` into its binding afterward; see
/// `Evaluator::assign`).
pub fn assign_path(root: &mut Value, segments: &[Segment], value: Value) -> Result<(), EvalError> {
    if segments.is_empty() {
        check_mutable(root)?;
        *root = value;
        return Ok(());
    }
    let mut cur = root;
    for seg in &segments[..segments.len() - 1] {
        cur = navigate_mut_step(cur, seg)?;
    }
    set_final(cur, segments.last().expect("non-empty"), value)
}

/// Runs a built-in method on `recv` in place, returning `Some(result)` if
/// `method` is recognized for `recv`'s type, or `None` so the caller can
/// fall back to a user-defined method of the same name (spec 4.8 dispatch
/// order: built-ins first, then inherent impls).
pub fn dispatch_builtin_method(recv: &mut Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    let result = match &mut recv.kind {
        ValueKind::Array(_) | ValueKind::Tuple(_) => array_method(recv, method, args)?,
        ValueKind::Map(_) => map_method(recv, method, args)?,
        ValueKind::Set(_) => set_method(recv, method, args)?,
        ValueKind::Str(_) => string_method(recv, method, args)?,
        ValueKind::Buffer(_) => buffer_method(recv, method, args)?,
        ValueKind::Channel(_) => channel_method(recv, method, args)?,
        ValueKind::Ref(_) => ref_method(recv, method, args)?,
        ValueKind::Range(start, end) => range_method(*start, *end, method, args)?,
        ValueKind::Enum(_) => enum_method(recv, method, args)?,
        _ => None,
    };
    Ok(result)
}

fn enum_method(recv: &Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    let ValueKind::Enum(e) = &recv.kind else { unreachable!() };
    Ok(Some(match method {
        "variant_name" => Value::string(e.variant_name.clone()),
        "enum_name" => Value::string(e.enum_name.clone()),
        "payload" => Value::array(e.payload.clone()),
        "is_variant" => Value::bool(e.variant_name == str_arg(args, "is_variant")?),
        _ => return Ok(None),
    }))
}

fn one_int_arg(args: &[Value], who: &str) -> Result<i64, EvalError> {
    match args.first().map(|v| &v.kind) {
        Some(ValueKind::Int(n)) => Ok(*n),
        _ => Err(EvalError::Arity { message: format!("{who} expects one Int argument"), trace: Vec::new() }),
    }
}

fn array_len(recv: &Value) -> usize {
    let ValueKind::Array(a) | ValueKind::Tuple(a) = &recv.kind else { unreachable!() };
    a.len()
}

fn array_method(recv: &mut Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    Ok(Some(match method {
        "len" => Value::int(array_len(recv) as i64),
        "first" => {
            let ValueKind::Array(a) | ValueKind::Tuple(a) = &recv.kind else { unreachable!() };
            a.first().cloned().unwrap_or_else(Value::nil)
        }
        "last" => {
            let ValueKind::Array(a) | ValueKind::Tuple(a) = &recv.kind else { unreachable!() };
            a.last().cloned().unwrap_or_else(Value::nil)
        }
        "contains" => {
            let needle = args.first().ok_or_else(|| EvalError::Arity { message: "contains expects one argument".into(), trace: Vec::new() })?;
            let ValueKind::Array(a) | ValueKind::Tuple(a) = &recv.kind else { unreachable!() };
            Value::bool(a.iter().any(|v| v.eq_value(needle)))
        }
        "index_of" => {
            let needle = args.first().ok_or_else(|| EvalError::Arity { message: "index_of expects one argument".into(), trace: Vec::new() })?;
            let ValueKind::Array(a) | ValueKind::Tuple(a) = &recv.kind else { unreachable!() };
            match a.iter().position(|v| v.eq_value(needle)) {
                Some(i) => Value::int(i as i64),
                None => Value::int(-1),
            }
        }
        "reverse" => {
            check_mutable(recv)?;
            let ValueKind::Array(a) | ValueKind::Tuple(a) = &mut recv.kind else { unreachable!() };
            a.reverse();
            Value::unit()
        }
        "push" => {
            check_mutable(recv)?;
            let value = args.first().cloned().ok_or_else(|| EvalError::Arity { message: "push expects one argument".into(), trace: Vec::new() })?;
            let old_len = array_len(recv);
            phase::check_pressure(recv, old_len, old_len + 1)?;
            let ValueKind::Array(a) | ValueKind::Tuple(a) = &mut recv.kind else { unreachable!() };
            a.push(value);
            Value::unit()
        }
        "pop" => {
            check_mutable(recv)?;
            let old_len = array_len(recv);
            if old_len > 0 {
                phase::check_pressure(recv, old_len, old_len - 1)?;
            }
            let ValueKind::Array(a) | ValueKind::Tuple(a) = &mut recv.kind else { unreachable!() };
            a.pop().unwrap_or_else(Value::nil)
        }
        "clear" => {
            check_mutable(recv)?;
            let old_len = array_len(recv);
            phase::check_pressure(recv, old_len, 0)?;
            let ValueKind::Array(a) | ValueKind::Tuple(a) = &mut recv.kind else { unreachable!() };
            a.clear();
            Value::unit()
        }
        _ => return Ok(None),
    }))
}

fn map_method(recv: &mut Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    let ValueKind::Map(_) = &recv.kind else { unreachable!() };
    Ok(Some(match method {
        "len" => {
            let ValueKind::Map(m) = &recv.kind else { unreachable!() };
            Value::int(m.len() as i64)
        }
        "has" => {
            let key = str_arg(args, "has")?;
            let ValueKind::Map(m) = &recv.kind else { unreachable!() };
            Value::bool(m.contains_key(&key))
        }
        "get" => {
            let key = str_arg(args, "get")?;
            let ValueKind::Map(m) = &recv.kind else { unreachable!() };
            m.get(&key).cloned().unwrap_or_else(Value::nil)
        }
        "keys" => {
            let ValueKind::Map(m) = &recv.kind else { unreachable!() };
            Value::array(m.keys().map(|k| Value::string(k.clone())).collect())
        }
        "values" => {
            let ValueKind::Map(m) = &recv.kind else { unreachable!() };
            Value::array(m.values().cloned().collect())
        }
        "entries" => {
            let ValueKind::Map(m) = &recv.kind else { unreachable!() };
            Value::array(m.iter().map(|(k, v)| Value::array(vec![Value::string(k.clone()), v.clone()])).collect())
        }
        "merge" => {
            check_mutable(recv)?;
            let other = match args.first().map(|v| &v.kind) {
                Some(ValueKind::Map(m)) => m.clone(),
                _ => return Err(EvalError::Arity { message: "merge expects a Map argument".into(), trace: Vec::new() }),
            };
            let ValueKind::Map(m) = &mut recv.kind else { unreachable!() };
            m.extend(other);
            Value::unit()
        }
        "set" | "insert" => {
            check_mutable(recv)?;
            let key = str_arg(args, "set")?;
            let value = args.get(1).cloned().ok_or_else(|| EvalError::Arity { message: "set expects a key and a value".into(), trace: Vec::new() })?;
            let ValueKind::Map(m) = &mut recv.kind else { unreachable!() };
            m.insert(key, value);
            Value::unit()
        }
        "remove" => {
            check_mutable(recv)?;
            let key = str_arg(args, "remove")?;
            let ValueKind::Map(m) = &mut recv.kind else { unreachable!() };
            m.remove(&key).unwrap_or_else(Value::nil)
        }
        "clear" => {
            check_mutable(recv)?;
            let ValueKind::Map(m) = &mut recv.kind else { unreachable!() };
            m.clear();
            Value::unit()
        }
        _ => return Ok(None),
    }))
}

fn set_arg(args: &[Value], who: &str) -> Result<Vec<Value>, EvalError> {
    match args.first().map(|v| &v.kind) {
        Some(ValueKind::Set(s)) => Ok(s.clone()),
        Some(ValueKind::Array(a)) => Ok(a.clone()),
        _ => Err(EvalError::Arity { message: format!("{who} expects a Set or Array argument"), trace: Vec::new() }),
    }
}

fn set_method(recv: &mut Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    Ok(Some(match method {
        "len" => {
            let ValueKind::Set(s) = &recv.kind else { unreachable!() };
            Value::int(s.len() as i64)
        }
        "has" => {
            let needle = args.first().ok_or_else(|| EvalError::Arity { message: "has expects one argument".into(), trace: Vec::new() })?;
            let ValueKind::Set(s) = &recv.kind else { unreachable!() };
            Value::bool(s.iter().any(|v| v.eq_value(needle)))
        }
        "add" => {
            check_mutable(recv)?;
            let value = args.first().cloned().ok_or_else(|| EvalError::Arity { message: "add expects one argument".into(), trace: Vec::new() })?;
            let ValueKind::Set(s) = &mut recv.kind else { unreachable!() };
            if !s.iter().any(|v| v.eq_value(&value)) {
                s.push(value);
            }
            Value::unit()
        }
        "remove" => {
            check_mutable(recv)?;
            let needle = args.first().ok_or_else(|| EvalError::Arity { message: "remove expects one argument".into(), trace: Vec::new() })?;
            let ValueKind::Set(s) = &mut recv.kind else { unreachable!() };
            s.retain(|v| !v.eq_value(needle));
            Value::unit()
        }
        "union" => {
            let other = set_arg(args, "union")?;
            let ValueKind::Set(s) = &recv.kind else { unreachable!() };
            let mut out = s.clone();
            for v in other {
                if !out.iter().any(|existing| existing.eq_value(&v)) {
                    out.push(v);
                }
            }
            Value::flux(ValueKind::Set(out))
        }
        "intersection" => {
            let other = set_arg(args, "intersection")?;
            let ValueKind::Set(s) = &recv.kind else { unreachable!() };
            let out: Vec<Value> = s.iter().filter(|v| other.iter().any(|o| o.eq_value(v))).cloned().collect();
            Value::flux(ValueKind::Set(out))
        }
        "difference" => {
            let other = set_arg(args, "difference")?;
            let ValueKind::Set(s) = &recv.kind else { unreachable!() };
            let out: Vec<Value> = s.iter().filter(|v| !other.iter().any(|o| o.eq_value(v))).cloned().collect();
            Value::flux(ValueKind::Set(out))
        }
        "is_subset" => {
            let other = set_arg(args, "is_subset")?;
            let ValueKind::Set(s) = &recv.kind else { unreachable!() };
            Value::bool(s.iter().all(|v| other.iter().any(|o| o.eq_value(v))))
        }
        "is_superset" => {
            let other = set_arg(args, "is_superset")?;
            let ValueKind::Set(s) = &recv.kind else { unreachable!() };
            Value::bool(other.iter().all(|o| s.iter().any(|v| v.eq_value(o))))
        }
        "to_array" => {
            let ValueKind::Set(s) = &recv.kind else { unreachable!() };
            Value::array(s.clone())
        }
        _ => return Ok(None),
    }))
}

fn str_arg(args: &[Value], who: &str) -> Result<String, EvalError> {
    match args.first().map(|v| &v.kind) {
        Some(ValueKind::Str(s)) => Ok(s.clone()),
        _ => Err(EvalError::Arity { message: format!("{who} expects a String argument"), trace: Vec::new() }),
    }
}

/// camelCase/PascalCase word splitting shared by the `*_case` conversions:
/// a run of uppercase-then-lowercase starts a new word, as does any
/// existing `_`/`-`/space separator.
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in s.chars() {
        if c == '_' || c == '-' || c == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn string_method(recv: &Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    let ValueKind::Str(s) = &recv.kind else { unreachable!() };
    Ok(Some(match method {
        "len" => Value::int(s.chars().count() as i64),
        "upper" | "to_upper" => Value::string(s.to_uppercase()),
        "lower" | "to_lower" => Value::string(s.to_lowercase()),
        "trim" => Value::string(s.trim().to_string()),
        "contains" => Value::bool(s.contains(&str_arg(args, "contains")?)),
        "starts_with" => Value::bool(s.starts_with(&str_arg(args, "starts_with")? as &str)),
        "ends_with" => Value::bool(s.ends_with(&str_arg(args, "ends_with")? as &str)),
        "is_empty" => Value::bool(s.is_empty()),
        "count" => {
            let needle = str_arg(args, "count")?;
            Value::int(if needle.is_empty() { 0 } else { s.matches(&needle as &str).count() as i64 })
        }
        "capitalize" => {
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => Value::string(format!("{}{}", first.to_uppercase(), chars.as_str())),
                None => Value::string(String::new()),
            }
        }
        "title_case" => Value::string(
            split_words(s)
                .iter()
                .map(|w| {
                    let mut c = w.chars();
                    match c.next() {
                        Some(first) => format!("{}{}", first.to_uppercase(), c.as_str().to_lowercase()),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        ),
        "snake_case" => Value::string(split_words(s).iter().map(|w| w.to_lowercase()).collect::<Vec<_>>().join("_")),
        "kebab_case" => Value::string(split_words(s).iter().map(|w| w.to_lowercase()).collect::<Vec<_>>().join("-")),
        "camel_case" => {
            let words = split_words(s);
            let mut out = String::new();
            for (i, w) in words.iter().enumerate() {
                let lower = w.to_lowercase();
                if i == 0 {
                    out.push_str(&lower);
                } else {
                    let mut c = lower.chars();
                    if let Some(first) = c.next() {
                        out.push_str(&first.to_uppercase().to_string());
                        out.push_str(c.as_str());
                    }
                }
            }
            Value::string(out)
        }
        "reverse" => Value::string(s.chars().rev().collect::<String>()),
        "repeat" => Value::string(s.repeat(one_int_arg(args, "repeat")?.max(0) as usize)),
        "pad_left" => {
            let width = one_int_arg(args, "pad_left")?.max(0) as usize;
            let fill = args.get(1).map(|v| match &v.kind {
                ValueKind::Str(f) => f.chars().next().unwrap_or(' '),
                _ => ' ',
            }).unwrap_or(' ');
            let len = s.chars().count();
            if len >= width { Value::string(s.clone()) } else { Value::string(format!("{}{}", fill.to_string().repeat(width - len), s)) }
        }
        "pad_right" => {
            let width = one_int_arg(args, "pad_right")?.max(0) as usize;
            let fill = args.get(1).map(|v| match &v.kind {
                ValueKind::Str(f) => f.chars().next().unwrap_or(' '),
                _ => ' ',
            }).unwrap_or(' ');
            let len = s.chars().count();
            if len >= width { Value::string(s.clone()) } else { Value::string(format!("{}{}", s, fill.to_string().repeat(width - len))) }
        }
        "substring" => {
            let chars: Vec<char> = s.chars().collect();
            let start = one_int_arg(args, "substring")?.max(0) as usize;
            let end = match args.get(1).map(|v| &v.kind) {
                Some(ValueKind::Int(n)) => (*n).max(0) as usize,
                _ => chars.len(),
            };
            let start = start.min(chars.len());
            let end = end.min(chars.len()).max(start);
            Value::string(chars[start..end].iter().collect::<String>())
        }
        "split" => {
            let sep = str_arg(args, "split")?;
            Value::array(s.split(&sep as &str).map(Value::string).collect())
        }
        "replace" => {
            let from = str_arg(args, "replace")?;
            let to = args.get(1).map(|v| match &v.kind {
                ValueKind::Str(s) => Ok(s.clone()),
                _ => Err(EvalError::Arity { message: "replace expects two String arguments".into(), trace: Vec::new() }),
            }).ok_or_else(|| EvalError::Arity { message: "replace expects two arguments".into(), trace: Vec::new() })??;
            Value::string(s.replace(&from, &to))
        }
        "chars" => Value::array(s.chars().map(|c| Value::string(c.to_string())).collect()),
        "bytes" => Value::array(s.bytes().map(|b| Value::int(b as i64)).collect()),
        _ => return Ok(None),
    }))
}

fn byte_arg(args: &[Value], who: &str) -> Result<u8, EvalError> {
    match args.first().map(|v| &v.kind) {
        Some(ValueKind::Int(n)) => Ok(*n as u8),
        _ => Err(EvalError::Arity { message: format!("{who} expects an Int byte"), trace: Vec::new() }),
    }
}

fn buf_offset(args: &[Value], who: &str) -> Result<usize, EvalError> {
    Ok(one_int_arg(args, who)?.max(0) as usize)
}

/// Reads `n` little-endian bytes starting at `offset`, bounds-checked
/// against the buffer's current length.
fn read_le<'a>(b: &'a [u8], offset: usize, n: usize, who: &str) -> Result<&'a [u8], EvalError> {
    if offset.checked_add(n).is_none_or(|end| end > b.len()) {
        return Err(EvalError::Bounds { message: format!("{who} at offset {offset} out of bounds for length {}", b.len()), trace: Vec::new() });
    }
    Ok(&b[offset..offset + n])
}

fn buffer_method(recv: &mut Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    Ok(Some(match method {
        "len" => {
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            Value::int(b.len() as i64)
        }
        "capacity" => {
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            Value::int(b.capacity() as i64)
        }
        "get" => {
            let i = one_int_arg(args, "get")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            Value::int(b[normalize_index(i, b.len())?] as i64)
        }
        "set" => {
            check_mutable(recv)?;
            let i = one_int_arg(args, "set")?;
            let byte = match args.get(1).map(|v| &v.kind) {
                Some(ValueKind::Int(n)) => *n as u8,
                _ => return Err(EvalError::Arity { message: "set expects (index, byte)".into(), trace: Vec::new() }),
            };
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            let idx = normalize_index(i, b.len())?;
            b[idx] = byte;
            Value::unit()
        }
        "push" => {
            check_mutable(recv)?;
            let byte = byte_arg(args, "push")?;
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            b.push(byte);
            Value::unit()
        }
        "push_u16" => {
            check_mutable(recv)?;
            let n = one_int_arg(args, "push_u16")? as u16;
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            b.extend_from_slice(&n.to_le_bytes());
            Value::unit()
        }
        "push_u32" => {
            check_mutable(recv)?;
            let n = one_int_arg(args, "push_u32")? as u32;
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            b.extend_from_slice(&n.to_le_bytes());
            Value::unit()
        }
        "write_u8" => {
            check_mutable(recv)?;
            let offset = buf_offset(args, "write_u8")?;
            let byte = match args.get(1).map(|v| &v.kind) {
                Some(ValueKind::Int(n)) => *n as u8,
                _ => return Err(EvalError::Arity { message: "write_u8 expects (offset, value)".into(), trace: Vec::new() }),
            };
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            let idx = normalize_index(offset as i64, b.len())?;
            b[idx] = byte;
            Value::unit()
        }
        "write_u16" => {
            check_mutable(recv)?;
            let offset = buf_offset(args, "write_u16")?;
            let n = match args.get(1).map(|v| &v.kind) {
                Some(ValueKind::Int(n)) => *n as u16,
                _ => return Err(EvalError::Arity { message: "write_u16 expects (offset, value)".into(), trace: Vec::new() }),
            };
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            if offset + 2 > b.len() {
                return Err(EvalError::Bounds { message: format!("write_u16 at offset {offset} out of bounds for length {}", b.len()), trace: Vec::new() });
            }
            b[offset..offset + 2].copy_from_slice(&n.to_le_bytes());
            Value::unit()
        }
        "write_u32" => {
            check_mutable(recv)?;
            let offset = buf_offset(args, "write_u32")?;
            let n = match args.get(1).map(|v| &v.kind) {
                Some(ValueKind::Int(n)) => *n as u32,
                _ => return Err(EvalError::Arity { message: "write_u32 expects (offset, value)".into(), trace: Vec::new() }),
            };
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            if offset + 4 > b.len() {
                return Err(EvalError::Bounds { message: format!("write_u32 at offset {offset} out of bounds for length {}", b.len()), trace: Vec::new() });
            }
            b[offset..offset + 4].copy_from_slice(&n.to_le_bytes());
            Value::unit()
        }
        "read_u8" => {
            let offset = buf_offset(args, "read_u8")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            Value::int(read_le(b, offset, 1, "read_u8")?[0] as i64)
        }
        "read_i8" => {
            let offset = buf_offset(args, "read_i8")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            Value::int(read_le(b, offset, 1, "read_i8")?[0] as i8 as i64)
        }
        "read_u16" => {
            let offset = buf_offset(args, "read_u16")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            let bytes = read_le(b, offset, 2, "read_u16")?;
            Value::int(u16::from_le_bytes([bytes[0], bytes[1]]) as i64)
        }
        "read_i16" => {
            let offset = buf_offset(args, "read_i16")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            let bytes = read_le(b, offset, 2, "read_i16")?;
            Value::int(i16::from_le_bytes([bytes[0], bytes[1]]) as i64)
        }
        "read_u32" => {
            let offset = buf_offset(args, "read_u32")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            let bytes = read_le(b, offset, 4, "read_u32")?;
            Value::int(u32::from_le_bytes(bytes.try_into().unwrap()) as i64)
        }
        "read_i32" => {
            let offset = buf_offset(args, "read_i32")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            let bytes = read_le(b, offset, 4, "read_i32")?;
            Value::int(i32::from_le_bytes(bytes.try_into().unwrap()) as i64)
        }
        "read_f32" => {
            let offset = buf_offset(args, "read_f32")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            let bytes = read_le(b, offset, 4, "read_f32")?;
            Value::float(f32::from_le_bytes(bytes.try_into().unwrap()) as f64)
        }
        "read_f64" => {
            let offset = buf_offset(args, "read_f64")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            let bytes = read_le(b, offset, 8, "read_f64")?;
            Value::float(f64::from_le_bytes(bytes.try_into().unwrap()))
        }
        "slice" => {
            let start = buf_offset(args, "slice")?;
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            let end = match args.get(1).map(|v| &v.kind) {
                Some(ValueKind::Int(n)) => (*n).max(0) as usize,
                _ => b.len(),
            };
            let start = start.min(b.len());
            let end = end.min(b.len()).max(start);
            Value::flux(ValueKind::Buffer(b[start..end].to_vec()))
        }
        "clear" => {
            check_mutable(recv)?;
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            b.clear();
            Value::unit()
        }
        "fill" => {
            check_mutable(recv)?;
            let byte = byte_arg(args, "fill")?;
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            b.iter_mut().for_each(|x| *x = byte);
            Value::unit()
        }
        "resize" => {
            check_mutable(recv)?;
            let new_len = buf_offset(args, "resize")?;
            let fill = args.get(1).map(|v| match &v.kind {
                ValueKind::Int(n) => *n as u8,
                _ => 0,
            }).unwrap_or(0);
            let ValueKind::Buffer(b) = &mut recv.kind else { unreachable!() };
            b.resize(new_len, fill);
            Value::unit()
        }
        "to_string" => {
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            Value::string(String::from_utf8_lossy(b).into_owned())
        }
        "to_array" => {
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            Value::array(b.iter().map(|byte| Value::int(*byte as i64)).collect())
        }
        "to_hex" => {
            let ValueKind::Buffer(b) = &recv.kind else { unreachable!() };
            Value::string(b.iter().map(|byte| format!("{byte:02x}")).collect::<String>())
        }
        _ => return Ok(None),
    }))
}

fn channel_method(recv: &Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    Ok(Some(match method {
        "send" => {
            let value = args.first().cloned().ok_or_else(|| EvalError::Arity { message: "send expects one argument".into(), trace: Vec::new() })?;
            concurrency::send(recv, value)?;
            Value::unit()
        }
        "recv" | "receive" => concurrency::receive(recv)?.unwrap_or_else(Value::nil),
        "try_receive" => match concurrency::try_receive(recv)? {
            Some(v) => v,
            None => Value::nil(),
        },
        "try_send" => {
            let value = args.first().cloned().ok_or_else(|| EvalError::Arity { message: "try_send expects one argument".into(), trace: Vec::new() })?;
            Value::bool(concurrency::try_send(recv, value)?)
        }
        "close" => {
            concurrency::close(recv)?;
            Value::unit()
        }
        "is_closed" => Value::bool(concurrency::is_closed(recv)?),
        _ => return Ok(None),
    }))
}

fn ref_method(recv: &Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
    let ValueKind::Ref(cell) = &recv.kind else { unreachable!() };
    Ok(Some(match method {
        "get" | "deref" => cell.lock().expect("ref mutex poisoned").clone(),
        "set" => {
            let value = args.first().cloned().ok_or_else(|| EvalError::Arity { message: "set expects one argument".into(), trace: Vec::new() })?;
            *cell.lock().expect("ref mutex poisoned") = value;
            Value::unit()
        }
        "inner_type" => Value::string(cell.lock().expect("ref mutex poisoned").type_name()),
        _ => return Ok(None),
    }))
}

fn range_method(start: i64, end: i64, method: &str, _args: &[Value]) -> Result<Option<Value>, EvalError> {
    Ok(Some(match method {
        "len" => Value::int((end - start).max(0)),
        "contains" => {
            let Some(v) = _args.first() else {
                return Err(EvalError::Arity { message: "contains expects one argument".into(), trace: Vec::new() });
            };
            let ValueKind::Int(n) = &v.kind else { return Ok(Some(Value::bool(false))) };
            Value::bool(*n >= start && *n < end)
        }
        "to_array" => Value::array((start..end).map(Value::int).collect()),
        _ => return Ok(None),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(recv: &mut Value, method: &str, args: &[Value]) -> Value {
        dispatch_builtin_method(recv, method, args).unwrap().unwrap()
    }

    #[test]
    fn string_case_conversions() {
        let mut s = Value::string("hello world");
        assert!(call(&mut s, "snake_case", &[]).eq_value(&Value::string("hello_world")));
        assert!(call(&mut s, "kebab_case", &[]).eq_value(&Value::string("hello-world")));
        assert!(call(&mut s, "camel_case", &[]).eq_value(&Value::string("helloWorld")));
        assert!(call(&mut s, "title_case", &[]).eq_value(&Value::string("Hello World")));
        assert!(call(&mut s, "capitalize", &[]).eq_value(&Value::string("Hello world")));
    }

    #[test]
    fn string_padding_and_substring() {
        let mut s = Value::string("ab");
        assert!(call(&mut s, "pad_left", &[Value::int(5)]).eq_value(&Value::string("   ab")));
        assert!(call(&mut s, "pad_right", &[Value::int(5)]).eq_value(&Value::string("ab   ")));
        let mut s2 = Value::string("hello");
        assert!(call(&mut s2, "substring", &[Value::int(1), Value::int(3)]).eq_value(&Value::string("el")));
        assert!(call(&mut s2, "reverse", &[]).eq_value(&Value::string("olleh")));
        assert!(call(&mut s2, "count", &[Value::string("l")]).eq_value(&Value::int(2)));
    }

    #[test]
    fn buffer_little_endian_round_trip() {
        let mut b = Value::flux(ValueKind::Buffer(Vec::new()));
        call(&mut b, "push_u32", &[Value::int(0x01020304)]);
        assert!(call(&mut b, "read_u32", &[Value::int(0)]).eq_value(&Value::int(0x01020304)));
        assert!(call(&mut b, "read_u8", &[Value::int(0)]).eq_value(&Value::int(0x04)));
        assert!(call(&mut b, "to_hex", &[]).eq_value(&Value::string("04030201")));
    }

    #[test]
    fn buffer_bounds_checked() {
        let mut b = Value::flux(ValueKind::Buffer(vec![1, 2]));
        assert!(dispatch_builtin_method(&mut b, "read_u32", &[Value::int(0)]).is_err());
    }

    #[test]
    fn set_boolean_algebra() {
        let mut s = Value::flux(ValueKind::Set(vec![Value::int(1), Value::int(2)]));
        let other = Value::flux(ValueKind::Set(vec![Value::int(2), Value::int(3)]));
        let union = call(&mut s, "union", std::slice::from_ref(&other));
        let ValueKind::Set(items) = &union.kind else { panic!() };
        assert_eq!(items.len(), 3);
        assert!(call(&mut s, "intersection", std::slice::from_ref(&other)).eq_value(&Value::flux(ValueKind::Set(vec![Value::int(2)]))));
        assert!(call(&mut s, "is_subset", std::slice::from_ref(&other)).eq_value(&Value::bool(false)));
    }

    #[test]
    fn map_entries_and_merge() {
        let mut m = Value::flux(ValueKind::Map(HashMap::from([("a".to_string(), Value::int(1))])));
        let other = Value::flux(ValueKind::Map(HashMap::from([("b".to_string(), Value::int(2))])));
        call(&mut m, "merge", std::slice::from_ref(&other));
        let ValueKind::Map(m2) = &m.kind else { panic!() };
        assert_eq!(m2.len(), 2);
    }

    #[test]
    fn enum_accessors() {
        let e = Value::flux(ValueKind::Enum(phase_core::EnumData {
            enum_name: "Color".into(),
            variant_name: "Red".into(),
            payload: vec![],
        }));
        assert!(dispatch_builtin_method(&mut e.clone(), "variant_name", &[]).unwrap().unwrap().eq_value(&Value::string("Red")));
        assert!(dispatch_builtin_method(&mut e.clone(), "is_variant", &[Value::string("Red")]).unwrap().unwrap().eq_value(&Value::bool(true)));
    }
}
