//! Tree-walking evaluator (spec C5/C6: expression/statement evaluation).
//!
//! No direct teacher analog exists for the walk itself — `navicore-cem3`
//! is a stack-based concatenative VM, not a tree-walker — so the shape
//! here (one `eval_expr`/`eval_stmt` pair, `Flow` distinguishing plain
//! values from `return`/`break`/`continue` signals) follows the general
//! pattern spec §4 describes rather than a specific teacher file. Where
//! the evaluator touches the dual-heap model, dispatch, phase algebra, or
//! concurrency, it calls into the modules already grounded in DESIGN.md.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use phase_core::ast::{
    BinOp, Contract, Expr, FnDecl, ImportForm, Item, Literal, ParamDecl, Pattern, PhaseOpKind, Program, SelectArm,
    Stmt, UnOp,
};
use phase_core::{
    gc_cycle, ClosureData, Environment, EnumData, FluxHeap, Param, Phase, PressureMode, RegionStore, StructData,
    Value, ValueKind,
};

use crate::builtins::{install_defaults, BuiltinRegistry};
use crate::concurrency::{self, ScopeJoin, SelectCandidate, SelectOutcome};
use crate::config::{EvalMode, EvaluatorConfig};
use crate::dispatch::{self, FnRegistry};
use crate::error::{EvalError, EvalResult, Flow, SignalKind, TraceFrame};
use crate::methods;
use crate::module::ModuleLoader;
use crate::phase::{self, Bond, BondGraph, BondStrategy, TrackStore};

pub struct Evaluator {
    pub env: Environment,
    pub heap: FluxHeap,
    pub regions: RegionStore,
    pub config: EvaluatorConfig,
    pub fns: FnRegistry,
    pub structs: std::collections::HashMap<String, phase_core::ast::StructDecl>,
    pub enums: std::collections::HashMap<String, phase_core::ast::EnumDecl>,
    pub builtins: BuiltinRegistry,
    pub tracks: TrackStore,
    pub bonds: BondGraph,
    pub reactions: std::collections::HashMap<String, Vec<Value>>,
    pub contracts: std::collections::HashMap<String, Value>,
    /// `defer` bodies not yet run, tagged with the scope depth they were
    /// registered at (spec §4.5): flushed LIFO whenever a scope at or below
    /// that depth exits, normally or abnormally.
    defers: Vec<(usize, Vec<Stmt>)>,
    /// Host-supplied module resolver/cache for `import` (spec §6). `None`
    /// until an embedder configures one via `set_module_loader`.
    pub module_loader: Option<ModuleLoader>,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        let heap = FluxHeap::new(config.gc_threshold_bytes, config.gc_stress);
        let tracks = TrackStore::new(config.history_cap);
        let mut builtins = BuiltinRegistry::new();
        install_defaults(&mut builtins);
        Evaluator {
            env: Environment::new(),
            heap,
            regions: RegionStore::new(),
            config,
            fns: FnRegistry::new(),
            structs: Default::default(),
            enums: Default::default(),
            builtins,
            tracks,
            bonds: BondGraph::new(),
            reactions: Default::default(),
            contracts: Default::default(),
            defers: Vec::new(),
            module_loader: None,
        }
    }

    /// Configures the module resolver used by `import` statements (spec §6).
    pub fn set_module_loader(&mut self, loader: ModuleLoader) {
        self.module_loader = Some(loader);
    }

    pub fn run_program(&mut self, program: &Program) -> Result<Value, EvalError> {
        for item in &program.items {
            self.register_item(item)?;
        }
        let mut last = Value::unit();
        for item in &program.items {
            if let Item::Stmt(stmt) = item {
                last = self.eval_stmt(stmt)?.into_value()?;
            }
        }
        Ok(last)
    }

    fn register_item(&mut self, item: &Item) -> Result<(), EvalError> {
        match item {
            Item::Fn(decl) => self.fns.register_fn(Arc::new(decl.clone())),
            Item::Struct(decl) => {
                self.structs.insert(decl.name.clone(), decl.clone());
            }
            Item::Enum(decl) => {
                self.enums.insert(decl.name.clone(), decl.clone());
            }
            Item::Trait(_) => {}
            Item::Impl(block) => {
                for method in &block.methods {
                    let decl = Arc::new(method.clone());
                    match &block.trait_name {
                        Some(trait_name) => {
                            self.fns.register_trait_method(trait_name.clone(), block.type_name.clone(), decl)
                        }
                        None => self.fns.register_method(block.type_name.clone(), decl),
                    }
                }
            }
            Item::Stmt(_) => {}
        }
        Ok(())
    }

    /// Consults the GC trigger policy at a statement boundary (spec 4.2
    /// step 0) and runs a cycle if warranted.
    fn maybe_gc(&mut self) {
        if self.heap.should_collect() {
            let report = gc_cycle(&self.env, &[], &self.heap, &mut self.regions);
            tracing::debug!(live_bytes = report.live_bytes, regions_collected = report.regions_collected, epoch = report.epoch, "gc cycle");
        }
    }

    /// Point-in-time heap/region/tracking occupancy, for embedders that
    /// want to surface the dual-heap's state (spec §6 diagnostics).
    pub fn diagnostics(&self) -> crate::diagnostics::DiagnosticsSnapshot {
        let heap_stats = self.heap.stats();
        crate::diagnostics::DiagnosticsSnapshot {
            heap: heap_stats.into(),
            regions: self.regions.stats().into(),
            tracked_variable_count: self.tracks.tracked_count(),
            gc_epoch: heap_stats.cycles_run as u64,
        }
    }

    pub fn eval_block(&mut self, stmts: &[Stmt]) -> EvalResult {
        self.env.push_scope();
        let depth = self.env.depth();
        let result = self.eval_block_body(stmts);
        let result = self.run_defers_since(depth, result);
        self.env.pop_scope();
        result
    }

    /// Flushes every registered `defer` tagged at or deeper than `depth`,
    /// LIFO, on exit from the scope at `depth` (spec §4.5). A defer error
    /// replaces an `Ok` outcome; if an error is already propagating, the
    /// defer's own error is discarded rather than masking it.
    fn run_defers_since(&mut self, depth: usize, outcome: EvalResult) -> EvalResult {
        let mut result = outcome;
        while self.defers.last().is_some_and(|(d, _)| *d >= depth) {
            let (_, body) = self.defers.pop().expect("checked by is_some_and above");
            let defer_result = self.eval_block_body(&body).and_then(|f| f.into_value());
            result = match (result, defer_result) {
                (Ok(flow), Ok(_)) => Ok(flow),
                (Ok(_), Err(e)) => Err(e),
                (Err(e), _) => Err(e),
            };
        }
        result
    }

    fn eval_block_body(&mut self, stmts: &[Stmt]) -> EvalResult {
        if stmts.is_empty() {
            return Ok(Flow::Value(Value::unit()));
        }
        for stmt in &stmts[..stmts.len() - 1] {
            match self.eval_stmt(stmt)? {
                Flow::Value(_) => {}
                signal @ Flow::Signal(..) => return Ok(signal),
            }
        }
        self.eval_stmt(&stmts[stmts.len() - 1])
    }

    pub fn eval_stmt(&mut self, stmt: &Stmt) -> EvalResult {
        self.maybe_gc();
        match stmt {
            Stmt::Let { name, phase, value, .. } => {
                let v = self.eval_expr(value)?.into_value()?;
                let tagged = self.apply_declared_phase(v, *phase)?;
                self.env.define(name.clone(), tagged);
                Ok(Flow::Value(Value::unit()))
            }
            Stmt::Assign { target, value } => {
                let new_val = self.eval_expr(value)?.into_value()?;
                self.assign(target, new_val)
            }
            Stmt::Expr(e) => self.eval_expr(e),
            Stmt::Return(e) => {
                let v = match e {
                    Some(e) => self.eval_expr(e)?.into_value()?,
                    None => Value::unit(),
                };
                Ok(Flow::Signal(SignalKind::Return, v))
            }
            Stmt::Break(e) => {
                let v = match e {
                    Some(e) => self.eval_expr(e)?.into_value()?,
                    None => Value::unit(),
                };
                Ok(Flow::Signal(SignalKind::Break, v))
            }
            Stmt::Continue => Ok(Flow::Signal(SignalKind::Continue, Value::unit())),
            Stmt::While { cond, body } => self.eval_while(cond, body),
            Stmt::For { binding, iterable, body } => self.eval_for(binding, iterable, body),
            Stmt::Loop(body) => self.eval_loop(body),
            Stmt::Defer(body) => {
                self.defers.push((self.env.depth(), body.clone()));
                Ok(Flow::Value(Value::unit()))
            }
            Stmt::Destructure { pattern, phase, value } => self.eval_destructure(pattern, *phase, value),
            Stmt::Import { path, form } => self.eval_import(path, form),
            Stmt::Item(item) => {
                self.register_item(item)?;
                Ok(Flow::Value(Value::unit()))
            }
        }
    }

    fn eval_loop(&mut self, body: &[Stmt]) -> EvalResult {
        loop {
            match self.eval_block(body)? {
                Flow::Value(_) => {}
                Flow::Signal(SignalKind::Continue, _) => continue,
                Flow::Signal(SignalKind::Break, _) => return Ok(Flow::Value(Value::unit())),
                signal @ Flow::Signal(SignalKind::Return, _) => return Ok(signal),
            }
        }
    }

    fn eval_destructure(&mut self, pattern: &phase_core::ast::DestructurePattern, phase: Option<Phase>, value: &Expr) -> EvalResult {
        use phase_core::ast::DestructurePattern;

        let v = self.eval_expr(value)?.into_value()?;
        match pattern {
            DestructurePattern::Array { elements, rest } => {
                let items = match &v.kind {
                    ValueKind::Array(a) | ValueKind::Tuple(a) => a.clone(),
                    other => return Err(EvalError::type_error(format!("cannot destructure a {} as an array", Value::new(other.clone(), v.phase).type_name()))),
                };
                for (i, name) in elements.iter().enumerate() {
                    let bound = items.get(i).cloned().unwrap_or_else(Value::nil);
                    let tagged = self.apply_declared_phase(bound, phase)?;
                    self.env.define(name.clone(), tagged);
                }
                if let Some(rest_name) = rest {
                    let tail: Vec<Value> = items.get(elements.len()..).unwrap_or(&[]).to_vec();
                    let tagged = self.apply_declared_phase(Value::array(tail), phase)?;
                    self.env.define(rest_name.clone(), tagged);
                }
            }
            DestructurePattern::Fields(pairs) => {
                for (source_key, binding_name) in pairs {
                    let bound = match &v.kind {
                        ValueKind::Map(m) => m.get(source_key).cloned().unwrap_or_else(Value::nil),
                        ValueKind::Struct(_) => methods::field_get(&v, source_key)?,
                        other => return Err(EvalError::type_error(format!("cannot destructure a {} by field/key name", Value::new(other.clone(), v.phase).type_name()))),
                    };
                    let tagged = self.apply_declared_phase(bound, phase)?;
                    self.env.define(binding_name.clone(), tagged);
                }
            }
        }
        Ok(Flow::Value(Value::unit()))
    }

    fn apply_declared_phase(&self, v: Value, declared: Option<Phase>) -> Result<Value, EvalError> {
        match declared {
            Some(Phase::Flux) if self.config.mode == EvalMode::Strict && v.phase == Phase::Crystal => {
                Err(EvalError::PhaseViolation {
                    message: "strict mode: a `flux` binding's computed value is already crystal".into(),
                    trace: Vec::new(),
                })
            }
            Some(phase) => {
                let mut v = v;
                v.phase = phase;
                Ok(v)
            }
            None => match self.config.mode {
                EvalMode::Strict => Err(EvalError::ContractViolation {
                    message: "strict mode requires an explicit phase annotation on every `let`".into(),
                    trace: Vec::new(),
                }),
                EvalMode::Casual => Ok(v),
            },
        }
    }

    fn eval_while(&mut self, cond: &Expr, body: &[Stmt]) -> EvalResult {
        loop {
            let c = self.eval_expr(cond)?.into_value()?;
            if !c.is_truthy() {
                return Ok(Flow::Value(Value::unit()));
            }
            match self.eval_block(body)? {
                Flow::Value(_) => {}
                Flow::Signal(SignalKind::Continue, _) => continue,
                Flow::Signal(SignalKind::Break, _) => return Ok(Flow::Value(Value::unit())),
                signal @ Flow::Signal(SignalKind::Return, _) => return Ok(signal),
            }
        }
    }

    fn eval_for(&mut self, binding: &str, iterable: &Expr, body: &[Stmt]) -> EvalResult {
        let iter_val = self.eval_expr(iterable)?.into_value()?;
        let items = self.iterate(&iter_val)?;
        for item in items {
            self.env.push_scope();
            let depth = self.env.depth();
            self.env.define(binding.to_string(), item);
            let result = self.eval_block_body(body);
            let result = self.run_defers_since(depth, result);
            self.env.pop_scope();
            match result? {
                Flow::Value(_) => {}
                Flow::Signal(SignalKind::Continue, _) => continue,
                Flow::Signal(SignalKind::Break, _) => return Ok(Flow::Value(Value::unit())),
                signal @ Flow::Signal(SignalKind::Return, _) => return Ok(signal),
            }
        }
        Ok(Flow::Value(Value::unit()))
    }

    fn iterate(&self, v: &Value) -> Result<Vec<Value>, EvalError> {
        match &v.kind {
            ValueKind::Array(a) | ValueKind::Tuple(a) | ValueKind::Set(a) => Ok(a.clone()),
            ValueKind::Range(start, end) => Ok((*start..*end).map(Value::int).collect()),
            ValueKind::Map(m) => Ok(m
                .iter()
                .map(|(k, val)| Value::array(vec![Value::string(k.clone()), val.clone()]))
                .collect()),
            ValueKind::Str(s) => Ok(s.chars().map(|c| Value::string(c.to_string())).collect()),
            other => Err(EvalError::type_error(format!("{} is not iterable", Value::new(other.clone(), v.phase).type_name()))),
        }
    }

    pub fn eval_expr(&mut self, expr: &Expr) -> EvalResult {
        match expr {
            Expr::Literal(lit) => Ok(Flow::Value(literal_value(lit))),
            Expr::Ident(name) => {
                let v = self.env.get(name).cloned().ok_or_else(|| {
                    EvalError::undefined_name(name.clone(), self.env.find_similar_name(name))
                })?;
                Ok(Flow::Value(v))
            }
            Expr::Array(items) => {
                let values = self.eval_all(items)?;
                Ok(Flow::Value(Value::array(values)))
            }
            Expr::MapLit(pairs) => {
                let mut map = std::collections::HashMap::new();
                for (k, v) in pairs {
                    let key = self.eval_expr(k)?.into_value()?;
                    let key_str = match &key.kind {
                        ValueKind::Str(s) => s.clone(),
                        other => return Err(EvalError::type_error(format!("map keys must be strings, got {}", Value::new(other.clone(), Phase::Flux).type_name()))),
                    };
                    let val = self.eval_expr(v)?.into_value()?;
                    map.insert(key_str, val);
                }
                Ok(Flow::Value(Value::flux(ValueKind::Map(map))))
            }
            Expr::SetLit(items) => {
                let mut set: Vec<Value> = Vec::new();
                for v in self.eval_all(items)? {
                    if !set.iter().any(|existing| existing.eq_value(&v)) {
                        set.push(v);
                    }
                }
                Ok(Flow::Value(Value::flux(ValueKind::Set(set))))
            }
            Expr::TupleLit(items) => {
                let values = self.eval_all(items)?;
                Ok(Flow::Value(Value::flux(ValueKind::Tuple(values))))
            }
            Expr::StructLit { type_name, fields } => self.eval_struct_lit(type_name, fields),
            Expr::EnumLit { enum_name, variant_name, payload } => {
                let values = self.eval_all(payload)?;
                let resolved_enum = enum_name.clone().or_else(|| self.find_enum_for_variant(variant_name));
                Ok(Flow::Value(Value::flux(ValueKind::Enum(EnumData {
                    enum_name: resolved_enum.unwrap_or_default(),
                    variant_name: variant_name.clone(),
                    payload: values,
                }))))
            }
            Expr::RangeLit { start, end } => {
                let s = self.eval_expr(start)?.into_value()?;
                let e = self.eval_expr(end)?.into_value()?;
                let (ValueKind::Int(s), ValueKind::Int(e)) = (&s.kind, &e.kind) else {
                    return Err(EvalError::type_error("range bounds must be Int"));
                };
                Ok(Flow::Value(Value::flux(ValueKind::Range(*s, *e))))
            }
            Expr::Unary(op, inner) => {
                let v = self.eval_expr(inner)?.into_value()?;
                Ok(Flow::Value(eval_unary(*op, v)?))
            }
            Expr::Binary(BinOp::And, lhs, rhs) => {
                let l = self.eval_expr(lhs)?.into_value()?;
                if !l.is_truthy() {
                    return Ok(Flow::Value(l));
                }
                self.eval_expr(rhs)
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                let l = self.eval_expr(lhs)?.into_value()?;
                if l.is_truthy() {
                    return Ok(Flow::Value(l));
                }
                self.eval_expr(rhs)
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval_expr(lhs)?.into_value()?;
                let r = self.eval_expr(rhs)?.into_value()?;
                Ok(Flow::Value(eval_binary(*op, l, r)?))
            }
            Expr::Index(base, idx) => {
                let b = self.eval_expr(base)?.into_value()?;
                let i = self.eval_expr(idx)?.into_value()?;
                Ok(Flow::Value(methods::index_get(&b, &i)?))
            }
            Expr::Field(base, name) => {
                let b = self.eval_expr(base)?.into_value()?;
                Ok(Flow::Value(methods::field_get(&b, name)?))
            }
            Expr::Call { callee, args } => self.eval_call(callee, args),
            Expr::MethodCall { receiver, method, args } => self.eval_method_call(receiver, method, args),
            Expr::Closure { params, body, variadic } => {
                let closure = ClosureData {
                    params: params.iter().map(param_decl_to_param).collect(),
                    body: body.clone(),
                    env: self.env.clone(),
                    variadic: *variadic,
                    native: None,
                };
                Ok(Flow::Value(Value::flux(ValueKind::Closure(Box::new(closure)))))
            }
            Expr::If { cond, then_branch, else_branch } => {
                let c = self.eval_expr(cond)?.into_value()?;
                if c.is_truthy() {
                    self.eval_expr(then_branch)
                } else if let Some(else_branch) = else_branch {
                    self.eval_expr(else_branch)
                } else {
                    Ok(Flow::Value(Value::unit()))
                }
            }
            Expr::Match { scrutinee, arms } => self.eval_match(scrutinee, arms),
            Expr::Block(stmts) => self.eval_block(stmts),
            Expr::PhaseOp { op, target, args } => self.eval_phase_op(*op, target, args),
            Expr::Spawn(stmts) => self.eval_spawn(stmts),
            Expr::Scope(stmts) => self.eval_scope(stmts),
            Expr::Select(arms) => self.eval_select(arms),
            Expr::Forge(stmts) => {
                let v = self.eval_block(stmts)?.into_value()?;
                Ok(Flow::Value(phase::freeze(&v, &mut self.regions)))
            }
            Expr::TryCatch { try_block, catch_var, catch_block } => self.eval_try_catch(try_block, catch_var, catch_block),
            Expr::TryPropagate(inner) => self.eval_try_propagate(inner),
        }
    }

    /// `try`/`catch` (spec §4.4): the try-block runs in a fresh scope; on
    /// `Err` the error message is bound as a string to `catch_var` in a new
    /// scope for the catch-block. `Flow::Signal`s (`return`/`break`/
    /// `continue`) propagate unchanged, bypassing the catch entirely.
    fn eval_try_catch(&mut self, try_block: &[Stmt], catch_var: &str, catch_block: &[Stmt]) -> EvalResult {
        match self.eval_block(try_block) {
            Ok(flow) => Ok(flow),
            Err(e) => {
                self.env.push_scope();
                self.env.define(catch_var.to_string(), Value::string(e.to_string()));
                let result = self.eval_block_body(catch_block);
                self.env.pop_scope();
                result
            }
        }
    }

    /// Postfix `?` (spec §4.4): the operand must evaluate to a map with a
    /// string `tag` field; `"ok"` yields its `value` field, `"err"` signals
    /// a `Return` carrying the whole map up the call stack.
    fn eval_try_propagate(&mut self, inner: &Expr) -> EvalResult {
        let v = self.eval_expr(inner)?.into_value()?;
        let ValueKind::Map(m) = &v.kind else {
            return Err(EvalError::type_error("`?` operand must be a map with a `tag` field"));
        };
        match m.get("tag").map(|t| &t.kind) {
            Some(ValueKind::Str(tag)) if tag == "ok" => Ok(Flow::Value(m.get("value").cloned().unwrap_or_else(Value::nil))),
            Some(ValueKind::Str(tag)) if tag == "err" => Ok(Flow::Signal(SignalKind::Return, v)),
            _ => Err(EvalError::type_error("`?` operand's `tag` field must be \"ok\" or \"err\"")),
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, EvalError> {
        exprs.iter().map(|e| self.eval_expr(e)?.into_value()).collect()
    }

    fn eval_struct_lit(&mut self, type_name: &str, fields: &[(String, Expr)]) -> EvalResult {
        let decl = self
            .structs
            .get(type_name)
            .cloned()
            .ok_or_else(|| EvalError::type_error(format!("no such struct `{type_name}`")))?;
        let mut field_values = Vec::with_capacity(decl.fields.len());
        let mut field_names = Vec::with_capacity(decl.fields.len());
        let mut field_phases = std::collections::HashMap::new();
        for field_decl in &decl.fields {
            let provided = fields.iter().find(|(n, _)| n == &field_decl.name);
            let value = match provided {
                Some((_, e)) => self.eval_expr(e)?.into_value()?,
                None => return Err(EvalError::Arity {
                    message: format!("missing field `{}` in struct literal `{type_name}`", field_decl.name),
                    trace: Vec::new(),
                }),
            };
            let value = match field_decl.phase {
                Some(p) => {
                    field_phases.insert(field_decl.name.clone(), p);
                    let mut v = value;
                    v.phase = p;
                    v
                }
                None => value,
            };
            field_names.push(field_decl.name.clone());
            field_values.push(value);
        }
        Ok(Flow::Value(Value::flux(ValueKind::Struct(StructData {
            name: type_name.to_string(),
            field_names,
            field_values,
            field_phases: if field_phases.is_empty() { None } else { Some(field_phases) },
        }))))
    }

    fn find_enum_for_variant(&self, variant_name: &str) -> Option<String> {
        self.enums
            .values()
            .find(|decl| decl.variants.iter().any(|v| v.name == variant_name))
            .map(|decl| decl.name.clone())
    }

    fn eval_match(&mut self, scrutinee: &Expr, arms: &[(Pattern, Option<Expr>, Expr)]) -> EvalResult {
        let value = self.eval_expr(scrutinee)?.into_value()?;
        for (pattern, guard, body) in arms {
            self.env.push_scope();
            let matched = self.bind_pattern(pattern, &value);
            let guard_ok = match (&matched, guard) {
                (true, Some(g)) => self.eval_expr(g).and_then(|f| f.into_value()).map(|v| v.is_truthy()).unwrap_or(false),
                (true, None) => true,
                (false, _) => false,
            };
            if guard_ok {
                let result = self.eval_expr(body);
                self.env.pop_scope();
                return result;
            }
            self.env.pop_scope();
        }
        Err(EvalError::ContractViolation { message: "match expression is not exhaustive".into(), trace: Vec::new() })
    }

    fn bind_pattern(&mut self, pattern: &Pattern, value: &Value) -> bool {
        match pattern {
            Pattern::Wildcard => true,
            Pattern::Binding(name) => {
                self.env.define(name.clone(), value.clone());
                true
            }
            Pattern::Literal(lit) => literal_value(lit).eq_value(value),
            Pattern::Tuple(pats) => {
                let ValueKind::Tuple(items) | ValueKind::Array(items) = &value.kind else { return false };
                if items.len() != pats.len() {
                    return false;
                }
                pats.iter().zip(items).all(|(p, v)| self.bind_pattern(p, v))
            }
            Pattern::EnumVariant { enum_name, variant_name, payload } => {
                let ValueKind::Enum(e) = &value.kind else { return false };
                if &e.variant_name != variant_name {
                    return false;
                }
                if let Some(name) = enum_name {
                    if name != &e.enum_name {
                        return false;
                    }
                }
                if e.payload.len() != payload.len() {
                    return false;
                }
                payload.iter().zip(&e.payload).all(|(p, v)| self.bind_pattern(p, v))
            }
            Pattern::StructFields { type_name, fields } => {
                let ValueKind::Struct(s) = &value.kind else { return false };
                if &s.name != type_name {
                    return false;
                }
                fields.iter().all(|(name, p)| match s.field(name) {
                    Some(v) => self.bind_pattern(p, &v.clone()),
                    None => false,
                })
            }
            Pattern::Or(pats) => pats.iter().any(|p| self.bind_pattern(p, value)),
        }
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> EvalResult {
        let arg_values = self.eval_all(args)?;

        if let Expr::Ident(name) = callee {
            if let Some(v) = self.env.get(name).cloned() {
                if let ValueKind::Closure(closure) = &v.kind {
                    return self.call_closure(closure, arg_values);
                }
            }
            if self.fns.has_fn(name) {
                return self.call_fn_at_site(name, arg_values, Some(args));
            }
            if self.builtins.contains(name) {
                return Ok(Flow::Value(self.builtins.call(name, &arg_values)?));
            }
            return Err(EvalError::undefined_name(name.clone(), self.env.find_similar_name(name)));
        }

        let callee_val = self.eval_expr(callee)?.into_value()?;
        match &callee_val.kind {
            ValueKind::Closure(closure) => self.call_closure(closure, arg_values),
            other => Err(EvalError::type_error(format!("{} is not callable", Value::new(other.clone(), Phase::Flux).type_name()))),
        }
    }

    pub fn call_fn(&mut self, name: &str, args: Vec<Value>) -> EvalResult {
        self.call_fn_at_site(name, args, None)
    }

    /// `arg_exprs`, when available (a direct `name(...)` call site), drives
    /// the flux-parameter write-back spec §4.7 calls an "output parameter":
    /// a `flux`-phase parameter bound from a plain variable reference has
    /// its value written back to that variable once the call returns.
    fn call_fn_at_site(&mut self, name: &str, args: Vec<Value>, arg_exprs: Option<&[Expr]>) -> EvalResult {
        let decl = self
            .fns
            .resolve(name, &args)
            .ok_or_else(|| EvalError::Arity { message: format!("no overload of `{name}` matches the given arguments"), trace: Vec::new() })?;
        self.call_decl_at_site(&decl, args, arg_exprs)
    }

    fn call_decl(&mut self, decl: &FnDecl, args: Vec<Value>) -> EvalResult {
        self.call_decl_at_site(decl, args, None)
    }

    fn call_decl_at_site(&mut self, decl: &FnDecl, args: Vec<Value>, arg_exprs: Option<&[Expr]>) -> EvalResult {
        let base_env = self.env.clone();
        let call_env = dispatch::bind_params(&decl.params, &args, &base_env, |expr, env| {
            let saved = std::mem::replace(&mut self.env, env.clone());
            let result = self.eval_expr(expr);
            self.env = saved;
            result
        })
        .map_err(|e| e.push_frame(TraceFrame { function: decl.name.clone(), location: None }))?;

        let saved = std::mem::replace(&mut self.env, call_env);

        let outcome: Result<Value, EvalError> = (|| {
            self.run_requires(&decl.requires)?;
            let value = dispatch::unwrap_call_result(self.eval_expr(&decl.body))?;
            self.run_ensures(&decl.ensures, &value)?;
            Ok(value)
        })();

        let flux_writebacks: Vec<(String, Value)> = if outcome.is_ok() {
            match arg_exprs {
                Some(exprs) => decl
                    .params
                    .iter()
                    .zip(exprs.iter())
                    .filter_map(|(p, e)| match (p.phase, e) {
                        (Some(Phase::Flux), Expr::Ident(name)) => self.env.get(&p.name).cloned().map(|v| (name.clone(), v)),
                        _ => None,
                    })
                    .collect(),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        self.env = saved;
        for (name, value) in flux_writebacks {
            self.env.set(&name, value);
        }

        let value = outcome.map_err(|e| e.push_frame(TraceFrame { function: decl.name.clone(), location: None }))?;
        Ok(Flow::Value(value))
    }

    fn run_requires(&mut self, contracts: &[Contract]) -> Result<(), EvalError> {
        for contract in contracts {
            let holds = self.eval_expr(&contract.predicate)?.into_value()?;
            if !holds.is_truthy() {
                let message = self.contract_message(contract)?;
                return Err(EvalError::ContractViolation { message, trace: Vec::new() });
            }
        }
        Ok(())
    }

    /// Ensures run with `result` bound to the return value in a scratch
    /// scope, so `ensure(result > 0)`-style predicates can refer to it
    /// directly rather than needing a re-invoked closure.
    fn run_ensures(&mut self, contracts: &[Contract], result: &Value) -> Result<(), EvalError> {
        if contracts.is_empty() {
            return Ok(());
        }
        self.env.push_scope();
        self.env.define("result", result.clone());
        let outcome = (|| {
            for contract in contracts {
                let holds = self.eval_expr(&contract.predicate)?.into_value()?;
                if !holds.is_truthy() {
                    let message = self.contract_message(contract)?;
                    return Err(EvalError::ContractViolation { message, trace: Vec::new() });
                }
            }
            Ok(())
        })();
        self.env.pop_scope();
        outcome
    }

    fn contract_message(&mut self, contract: &Contract) -> Result<String, EvalError> {
        match &contract.message {
            Some(e) => {
                let v = self.eval_expr(e)?.into_value()?;
                match &v.kind {
                    ValueKind::Str(s) => Ok(s.clone()),
                    _ => Ok(format!("{v:?}")),
                }
            }
            None => Ok("contract violated".to_string()),
        }
    }

    pub fn call_closure(&mut self, closure: &ClosureData, args: Vec<Value>) -> EvalResult {
        if let Some(native) = &closure.native {
            return Ok(Flow::Value(native(&args)));
        }
        let params: Vec<ParamDecl> = closure.params.iter().map(param_to_param_decl).collect();
        let call_env = dispatch::bind_params(&params, &args, &closure.env, |expr, env| {
            let saved = std::mem::replace(&mut self.env, env.clone());
            let result = self.eval_expr(expr);
            self.env = saved;
            result
        })?;
        let saved = std::mem::replace(&mut self.env, call_env);
        let result = self.eval_expr(&closure.body);
        self.env = saved;
        let value = dispatch::unwrap_call_result(result)?;
        Ok(Flow::Value(value))
    }

    /// Closure-accepting methods (`Array.map`/`filter`/`reduce`/`sort`/
    /// `for_each`, `Map.map`/`filter`/`for_each`) that `methods::
    /// dispatch_builtin_method` can't implement itself, since those need
    /// `call_value_as_fn` to re-enter the evaluator for every element.
    /// Checked before the builtin table so a closure-accepting method name
    /// never falls through to a struct/enum's inherent `map`/`filter`
    /// (spec §4.8 dispatch order puts built-ins, including these, first).
    fn try_higher_order_method(&mut self, recv: &mut Value, method: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
        match (&recv.kind, method) {
            (ValueKind::Array(_), "map" | "filter" | "reduce" | "for_each" | "sort") => {}
            (ValueKind::Map(_), "map" | "filter" | "for_each") => {}
            _ => return Ok(None),
        }

        // `Array.sort()` is the one closure-accepting method whose closure
        // is optional — absent, it falls back to scalar ordering.
        let f = if method == "sort" {
            args.first().cloned()
        } else {
            match args.first().cloned() {
                Some(f) => Some(f),
                None => return Err(EvalError::Arity { message: format!("{method} expects a function argument"), trace: Vec::new() }),
            }
        };

        match &recv.kind {
            ValueKind::Array(items) => {
                let items = items.clone();
                match method {
                    "map" => {
                        let f = f.expect("checked above");
                        let mut out = Vec::with_capacity(items.len());
                        for item in items {
                            out.push(self.call_value_as_fn(&f, vec![item])?);
                        }
                        Ok(Some(Value::array(out)))
                    }
                    "filter" => {
                        let f = f.expect("checked above");
                        let mut out = Vec::new();
                        for item in items {
                            if self.call_value_as_fn(&f, vec![item.clone()])?.is_truthy() {
                                out.push(item);
                            }
                        }
                        Ok(Some(Value::array(out)))
                    }
                    "reduce" => {
                        let f = f.expect("checked above");
                        let mut acc = args.get(1).cloned().ok_or_else(|| EvalError::Arity {
                            message: "reduce expects (function, initial) arguments".into(),
                            trace: Vec::new(),
                        })?;
                        for item in items {
                            acc = self.call_value_as_fn(&f, vec![acc, item])?;
                        }
                        Ok(Some(acc))
                    }
                    "for_each" => {
                        let f = f.expect("checked above");
                        for item in items {
                            self.call_value_as_fn(&f, vec![item])?;
                        }
                        Ok(Some(Value::unit()))
                    }
                    "sort" => {
                        methods::check_mutable(recv)?;
                        let mut items = items;
                        let mut sort_err = None;
                        match f {
                            Some(cmp_fn) if matches!(cmp_fn.kind, ValueKind::Closure(_)) => {
                                items.sort_by(|a, b| {
                                    if sort_err.is_some() {
                                        return std::cmp::Ordering::Equal;
                                    }
                                    match self.call_value_as_fn(&cmp_fn, vec![a.clone(), b.clone()]) {
                                        Ok(v) => match &v.kind {
                                            ValueKind::Int(n) => n.cmp(&0),
                                            _ => std::cmp::Ordering::Equal,
                                        },
                                        Err(e) => {
                                            sort_err = Some(e);
                                            std::cmp::Ordering::Equal
                                        }
                                    }
                                });
                            }
                            _ => items.sort_by(default_cmp),
                        }
                        if let Some(e) = sort_err {
                            return Err(e);
                        }
                        recv.kind = ValueKind::Array(items);
                        Ok(Some(Value::unit()))
                    }
                    _ => unreachable!(),
                }
            }
            ValueKind::Map(m) => {
                let f = f.expect("checked above");
                let entries: Vec<(String, Value)> = m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                match method {
                    "for_each" => {
                        for (k, v) in entries {
                            self.call_value_as_fn(&f, vec![Value::string(k), v])?;
                        }
                        Ok(Some(Value::unit()))
                    }
                    "filter" => {
                        let mut out = HashMap::new();
                        for (k, v) in entries {
                            if self.call_value_as_fn(&f, vec![Value::string(k.clone()), v.clone()])?.is_truthy() {
                                out.insert(k, v);
                            }
                        }
                        Ok(Some(Value::flux(ValueKind::Map(out))))
                    }
                    "map" => {
                        let mut out = HashMap::new();
                        for (k, v) in entries {
                            let mapped = self.call_value_as_fn(&f, vec![Value::string(k.clone()), v])?;
                            out.insert(k, mapped);
                        }
                        Ok(Some(Value::flux(ValueKind::Map(out))))
                    }
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        }
    }

    fn call_value_as_fn(&mut self, value: &Value, args: Vec<Value>) -> Result<Value, EvalError> {
        match &value.kind {
            ValueKind::Closure(c) => self.call_closure(c, args)?.into_value(),
            other => Err(EvalError::type_error(format!("{} is not callable", Value::new(other.clone(), Phase::Flux).type_name()))),
        }
    }

    /// Dispatches a method call against its receiver. Container mutators
    /// (`push`, `insert`, ...) need to observe the effect back in the
    /// variable the receiver came from, so an lvalue-shaped receiver is
    /// mutated in place and written back; anything else (a call result, a
    /// fresh literal) is evaluated once into a detached temporary, which is
    /// still correct for `Channel`/`Ref`, since those share through `Arc`
    /// regardless of where the temporary lives.
    fn eval_method_call(&mut self, receiver: &Expr, method: &str, args: &[Expr]) -> EvalResult {
        let arg_values = self.eval_all(args)?;

        if let Ok((root_name, segments)) = self.decompose_lvalue(receiver) {
            let mut root = self
                .env
                .get(&root_name)
                .cloned()
                .ok_or_else(|| EvalError::undefined_name(root_name.clone(), self.env.find_similar_name(&root_name)))?;
            let target = methods::navigate_mut(&mut root, &segments)?;
            if let Some(result) = self.try_higher_order_method(target, method, &arg_values)? {
                self.env.set(&root_name, root);
                return Ok(Flow::Value(result));
            }
            let target = methods::navigate_mut(&mut root, &segments)?;
            if let Some(result) = methods::dispatch_builtin_method(target, method, &arg_values)? {
                self.env.set(&root_name, root);
                return Ok(Flow::Value(result));
            }
            let type_name = target.type_name().to_string();
            if let Some(decl) = self.fns.lookup_method(&type_name, method) {
                let recv_clone = target.clone();
                self.env.set(&root_name, root);
                let mut full_args = vec![recv_clone];
                full_args.extend(arg_values);
                return self.call_decl(&decl, full_args);
            }
            self.env.set(&root_name, root);
            return Err(EvalError::Type {
                message: format!("no method `{method}` on type `{type_name}`"),
                trace: Vec::new(),
                suggestion: None,
            });
        }

        let mut recv = self.eval_expr(receiver)?.into_value()?;
        if let Some(result) = self.try_higher_order_method(&mut recv, method, &arg_values)? {
            return Ok(Flow::Value(result));
        }
        if let Some(result) = methods::dispatch_builtin_method(&mut recv, method, &arg_values)? {
            return Ok(Flow::Value(result));
        }

        let type_name = recv.type_name().to_string();
        if let Some(decl) = self.fns.lookup_method(&type_name, method) {
            let mut full_args = vec![recv];
            full_args.extend(arg_values);
            return self.call_decl(&decl, full_args);
        }

        Err(EvalError::Type {
            message: format!("no method `{method}` on type `{type_name}`"),
            trace: Vec::new(),
            suggestion: None,
        })
    }

    fn decompose_lvalue(&mut self, expr: &Expr) -> Result<(String, Vec<methods::Segment>), EvalError> {
        match expr {
            Expr::Ident(name) => Ok((name.clone(), Vec::new())),
            Expr::Field(base, name) => {
                let (root, mut segs) = self.decompose_lvalue(base)?;
                segs.push(methods::Segment::Field(name.clone()));
                Ok((root, segs))
            }
            Expr::Index(base, idx) => {
                let (root, mut segs) = self.decompose_lvalue(base)?;
                let idx_val = self.eval_expr(idx)?.into_value()?;
                segs.push(methods::Segment::Index(idx_val));
                Ok((root, segs))
            }
            _ => Err(EvalError::type_error("invalid assignment target")),
        }
    }

    fn assign(&mut self, target: &Expr, new_val: Value) -> EvalResult {
        if let Expr::Ident(name) = target {
            self.check_contract(name, &new_val)?;
            if self.tracks.is_tracked(name) {
                if let Some(old) = self.env.get(name).cloned() {
                    self.tracks.record(name, old);
                }
            }
            if !self.env.set(name, new_val.clone()) {
                return Err(EvalError::undefined_name(name.clone(), self.env.find_similar_name(name)));
            }
            self.propagate(name, &new_val)?;
            return Ok(Flow::Value(Value::unit()));
        }

        let (root_name, segments) = self.decompose_lvalue(target)?;
        let mut root = self
            .env
            .get(&root_name)
            .cloned()
            .ok_or_else(|| EvalError::undefined_name(root_name.clone(), self.env.find_similar_name(&root_name)))?;
        methods::assign_path(&mut root, &segments, new_val)?;
        self.env.set(&root_name, root);
        Ok(Flow::Value(Value::unit()))
    }

    fn check_contract(&mut self, name: &str, new_val: &Value) -> Result<(), EvalError> {
        let Some(predicate) = self.contracts.get(name).cloned() else { return Ok(()) };
        let holds = self.call_value_as_fn(&predicate, vec![new_val.clone()])?;
        if !holds.is_truthy() {
            return Err(EvalError::ContractViolation {
                message: format!("seed contract on `{name}` rejected the new value"),
                trace: Vec::new(),
            });
        }
        Ok(())
    }

    /// Fires a variable's registered `react` callbacks on plain assignment.
    /// Bond cascades are *not* driven from here — spec §4.6 ties `mirror`/
    /// `inverse`/`gate` to the `freeze` transition specifically, not to
    /// ordinary assignment, so that logic lives in `cascade_bonds`/
    /// `check_freeze_gates`, called from `freeze_ident`.
    fn propagate(&mut self, name: &str, value: &Value) -> Result<(), EvalError> {
        if let Some(callbacks) = self.reactions.get(name).cloned() {
            for cb in callbacks {
                self.call_value_as_fn(&cb, vec![value.clone()])?;
            }
        }
        Ok(())
    }

    /// Full `freeze(name)` sequence (spec §4.6): validates the variable's
    /// seed contract against its current value, aborts if a `gate` bond
    /// requires a dependency that isn't crystal yet, migrates the value to
    /// a crystal region, fires registered reactions, then cascades
    /// `mirror`/`inverse` bonds onto dependents. `visiting` guards the
    /// mirror cascade against cycles (P8) and against re-entering a
    /// variable already handled earlier in the same freeze.
    fn freeze_ident(&mut self, name: &str, visiting: &mut HashSet<String>) -> Result<Value, EvalError> {
        if !visiting.insert(name.to_string()) {
            return self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::undefined_name(name.to_string(), self.env.find_similar_name(name)));
        }

        let v = self
            .env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::undefined_name(name.to_string(), self.env.find_similar_name(name)))?;
        self.check_contract(name, &v)?;
        self.check_freeze_gates(name)?;

        let frozen = phase::freeze(&v, &mut self.regions);
        self.env.set(name, frozen.clone());

        if let Some(callbacks) = self.reactions.get(name).cloned() {
            for cb in callbacks {
                self.call_value_as_fn(&cb, vec![frozen.clone()])?;
            }
        }

        self.cascade_bonds(name, visiting)?;
        Ok(frozen)
    }

    /// `thaw(name)`: writes the thawed value back and fires reactions
    /// (spec §4.6b "thaw fires fluid reactions") — there is a single
    /// `react` registration per variable, not one list per phase, so the
    /// same callbacks fire here as on freeze.
    fn thaw_ident(&mut self, name: &str) -> Result<Value, EvalError> {
        let v = self
            .env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::undefined_name(name.to_string(), self.env.find_similar_name(name)))?;
        let thawed = phase::thaw(&v);
        self.env.set(name, thawed.clone());
        if let Some(callbacks) = self.reactions.get(name).cloned() {
            for cb in callbacks {
                self.call_value_as_fn(&cb, vec![thawed.clone()])?;
            }
        }
        Ok(thawed)
    }

    /// Pre-check for every `gate` bond sourced at `source_name`: a gate
    /// bond means "target may freeze only if dep is already crystal", so
    /// the whole freeze aborts here, before anything is mutated, if any
    /// gated dependency isn't crystal yet (spec §4.6 P9).
    fn check_freeze_gates(&self, source_name: &str) -> Result<(), EvalError> {
        for edge in self.bonds.out_edges(source_name) {
            if matches!(edge.strategy, BondStrategy::Gate) {
                let dep_is_crystal = self.env.get(&edge.target).is_some_and(|v| v.phase == Phase::Crystal);
                if !dep_is_crystal {
                    return Err(EvalError::PhaseViolation {
                        message: format!(
                            "cannot freeze `{source_name}`: gated on `{}`, which is not yet crystal",
                            edge.target
                        ),
                        trace: Vec::new(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Walks `source_name`'s outgoing bonds after it has already been
    /// frozen, applying `mirror` (freeze the dependent too) and `inverse`
    /// (thaw the dependent). `gate` edges were already validated by
    /// `check_freeze_gates` and need no further action here.
    fn cascade_bonds(&mut self, source_name: &str, visiting: &mut HashSet<String>) -> Result<(), EvalError> {
        let edges: Vec<Bond> = self
            .bonds
            .out_edges(source_name)
            .map(|b| Bond { source: b.source.clone(), target: b.target.clone(), strategy: b.strategy.clone() })
            .collect();
        for edge in edges {
            match edge.strategy {
                BondStrategy::Gate => {}
                BondStrategy::Mirror => {
                    if self.env.contains(&edge.target) {
                        self.freeze_ident(&edge.target, visiting)?;
                    }
                }
                BondStrategy::Inverse => {
                    if let Some(dep) = self.env.get(&edge.target).cloned() {
                        let thawed = phase::thaw(&dep);
                        self.env.set(&edge.target, thawed);
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes `value` back into `target`'s binding when it's a plain
    /// identifier (spec §4.6: whole-value phase operators mutate an
    /// identifier target in place; on a general expression they just
    /// return a fresh value).
    fn write_back_if_ident(&mut self, target: &Expr, value: Value) -> Value {
        if let Expr::Ident(name) = target {
            self.env.set(name, value.clone());
        }
        value
    }

    fn expect_ident<'e>(&self, e: &'e Expr) -> Result<&'e str, EvalError> {
        match e {
            Expr::Ident(name) => Ok(name),
            _ => Err(EvalError::type_error("this phase operation requires a plain variable name")),
        }
    }

    fn eval_phase_op(&mut self, op: PhaseOpKind, target: &Expr, args: &[Expr]) -> EvalResult {
        match op {
            PhaseOpKind::Freeze => self.eval_freeze(target),
            PhaseOpKind::Thaw => match target {
                Expr::Ident(name) => Ok(Flow::Value(self.thaw_ident(name)?)),
                _ => {
                    let v = self.eval_expr(target)?.into_value()?;
                    Ok(Flow::Value(phase::thaw(&v)))
                }
            },
            PhaseOpKind::Anneal => {
                let v = self.eval_expr(target)?.into_value()?;
                let annealed = phase::anneal(v, &mut self.regions);
                Ok(Flow::Value(self.write_back_if_ident(target, annealed)))
            }
            PhaseOpKind::Sublimate => {
                let v = self.eval_expr(target)?.into_value()?;
                let result = phase::sublimate(&v);
                Ok(Flow::Value(self.write_back_if_ident(target, result)))
            }
            PhaseOpKind::Crystallize => {
                let v = self.eval_expr(target)?.into_value()?;
                let result = phase::crystallize(&v);
                Ok(Flow::Value(self.write_back_if_ident(target, result)))
            }
            PhaseOpKind::Borrow => {
                let v = self.eval_expr(target)?.into_value()?;
                let result = phase::borrow(&v);
                Ok(Flow::Value(self.write_back_if_ident(target, result)))
            }
            PhaseOpKind::PartialFreeze => {
                let v = self.eval_expr(target)?.into_value()?;
                let fields = self.eval_field_names(args)?;
                let result = phase::partial_freeze(&v, &fields, &mut self.regions)?;
                Ok(Flow::Value(self.write_back_if_ident(target, result)))
            }
            PhaseOpKind::FreezeExcept => {
                let v = self.eval_expr(target)?.into_value()?;
                let fields = self.eval_field_names(args)?;
                let result = phase::freeze_except(&v, &fields, &mut self.regions)?;
                Ok(Flow::Value(self.write_back_if_ident(target, result)))
            }
            PhaseOpKind::Pressurize => {
                let v = self.eval_expr(target)?.into_value()?;
                let mode_name = self.expect_ident(args.first().ok_or_else(|| EvalError::Arity {
                    message: "pressurize requires a mode argument".into(),
                    trace: Vec::new(),
                })?)?;
                let mode = parse_pressure_mode(mode_name)?;
                Ok(Flow::Value(phase::pressurize(&v, mode)))
            }
            PhaseOpKind::Track => {
                let name = self.expect_ident(target)?.to_string();
                self.tracks.track(&name);
                Ok(Flow::Value(Value::unit()))
            }
            PhaseOpKind::History => {
                let name = self.expect_ident(target)?.to_string();
                Ok(Flow::Value(Value::array(self.tracks.history(&name))))
            }
            PhaseOpKind::Rewind => {
                let name = self.expect_ident(target)?.to_string();
                let steps_val = self.eval_expr(args.first().ok_or_else(|| EvalError::Arity {
                    message: "rewind requires a step count".into(),
                    trace: Vec::new(),
                })?)?.into_value()?;
                let ValueKind::Int(steps) = steps_val.kind else {
                    return Err(EvalError::type_error("rewind's step count must be an Int"));
                };
                let restored = self.tracks.rewind(&name, steps as usize).ok_or_else(|| EvalError::Bounds {
                    message: format!("not enough history on `{name}` to rewind {steps} steps"),
                    trace: Vec::new(),
                })?;
                self.env.set(&name, restored.clone());
                Ok(Flow::Value(restored))
            }
            PhaseOpKind::Bond => {
                let source = self.expect_ident(target)?.to_string();
                let target_name = self.expect_ident(args.first().ok_or_else(|| EvalError::Arity {
                    message: "bond requires a target variable".into(),
                    trace: Vec::new(),
                })?)?.to_string();
                let strategy = match args.get(1).map(|e| self.expect_ident(e)).transpose()? {
                    Some("inverse") => BondStrategy::Inverse,
                    Some("gate") => BondStrategy::Gate,
                    _ => BondStrategy::Mirror,
                };
                self.bonds.add(source, target_name, strategy);
                Ok(Flow::Value(Value::unit()))
            }
            PhaseOpKind::React => {
                let name = self.expect_ident(target)?.to_string();
                let callback = self.eval_expr(args.first().ok_or_else(|| EvalError::Arity {
                    message: "react requires a callback".into(),
                    trace: Vec::new(),
                })?)?.into_value()?;
                self.reactions.entry(name).or_default().push(callback);
                Ok(Flow::Value(Value::unit()))
            }
            PhaseOpKind::Seed => {
                let name = self.expect_ident(target)?.to_string();
                let predicate = self.eval_expr(args.first().ok_or_else(|| EvalError::Arity {
                    message: "seed requires a predicate".into(),
                    trace: Vec::new(),
                })?)?.into_value()?;
                self.contracts.insert(name, predicate);
                Ok(Flow::Value(Value::unit()))
            }
        }
    }

    /// `freeze(target)` dispatch (spec §4.6): a plain identifier freezes
    /// and mutates that binding in place; `x.field`/`x["k"]` partially
    /// freezes just that sub-value, recording a per-field/per-key phase
    /// override; any other expression just returns a fresh frozen value
    /// with nothing to write back.
    fn eval_freeze(&mut self, target: &Expr) -> EvalResult {
        match target {
            Expr::Ident(name) => {
                let mut visiting = HashSet::new();
                let frozen = self.freeze_ident(name, &mut visiting)?;
                Ok(Flow::Value(frozen))
            }
            Expr::Field(base, field_name) => self.freeze_field(base, field_name),
            Expr::Index(base, idx) => self.freeze_index(base, idx),
            _ => {
                let v = self.eval_expr(target)?.into_value()?;
                Ok(Flow::Value(phase::freeze(&v, &mut self.regions)))
            }
        }
    }

    /// `freeze(x.field)` (spec §4.6 "partial freeze via freeze(x.field)"):
    /// errors if the struct itself already blocks mutation (an already-
    /// crystal ancestor), otherwise freezes just that field and records
    /// the per-field override via `phase::partial_freeze`.
    fn freeze_field(&mut self, base: &Expr, field_name: &str) -> EvalResult {
        let (root_name, segments) = self.decompose_lvalue(base)?;
        let mut root = self
            .env
            .get(&root_name)
            .cloned()
            .ok_or_else(|| EvalError::undefined_name(root_name.clone(), self.env.find_similar_name(&root_name)))?;
        let target = methods::navigate_mut(&mut root, &segments)?;
        if target.phase.blocks_own_mutation() {
            return Err(EvalError::PhaseViolation {
                message: format!("cannot freeze a field on a {:?} value", target.phase),
                trace: Vec::new(),
            });
        }
        let frozen = phase::partial_freeze(target, &[field_name.to_string()], &mut self.regions)?;
        *target = frozen;
        let field_value = methods::field_get(target, field_name)?;
        self.env.set(&root_name, root);
        Ok(Flow::Value(field_value))
    }

    /// `freeze(x["k"])`: the map-key analogue of `freeze_field`. Maps have
    /// no separate per-key phase side table, so the key's own stored value
    /// phase doubles as the per-key override that `set_final` (methods.rs)
    /// checks before a later overwrite.
    fn freeze_index(&mut self, base: &Expr, idx: &Expr) -> EvalResult {
        let idx_val = self.eval_expr(idx)?.into_value()?;
        let ValueKind::Str(key) = idx_val.kind else {
            return Err(EvalError::type_error("freeze(x[k]) requires a string key"));
        };
        let (root_name, segments) = self.decompose_lvalue(base)?;
        let mut root = self
            .env
            .get(&root_name)
            .cloned()
            .ok_or_else(|| EvalError::undefined_name(root_name.clone(), self.env.find_similar_name(&root_name)))?;
        let container = methods::navigate_mut(&mut root, &segments)?;
        if container.phase.blocks_own_mutation() {
            return Err(EvalError::PhaseViolation {
                message: format!("cannot freeze a key on a {:?} value", container.phase),
                trace: Vec::new(),
            });
        }
        let ValueKind::Map(m) = &mut container.kind else {
            return Err(EvalError::type_error("freeze(x[k]) requires a map"));
        };
        let current = m.get(&key).cloned().unwrap_or_else(Value::nil);
        let frozen = phase::freeze(&current, &mut self.regions);
        m.insert(key, frozen.clone());
        self.env.set(&root_name, root);
        Ok(Flow::Value(frozen))
    }

    fn eval_field_names(&mut self, args: &[Expr]) -> Result<Vec<String>, EvalError> {
        args.iter()
            .map(|e| {
                let v = self.eval_expr(e)?.into_value()?;
                match &v.kind {
                    ValueKind::Str(s) => Ok(s.clone()),
                    _ => Err(EvalError::type_error("expected a field-name string")),
                }
            })
            .collect()
    }

    fn eval_spawn(&mut self, stmts: &[Stmt]) -> EvalResult {
        // A bare `spawn { ... }` with no enclosing `scope` joins immediately
        // after running: without a parent join barrier there is nowhere
        // else the result could be observed from.
        self.eval_block(stmts)
    }

    fn eval_scope(&mut self, stmts: &[Stmt]) -> EvalResult {
        let join = ScopeJoin::new();
        let mut last = Value::unit();
        for stmt in stmts {
            match stmt {
                Stmt::Expr(Expr::Spawn(body)) => {
                    let mut child = self.fork_for_spawn();
                    let body = body.to_vec();
                    join.spawn(move || match child.eval_block(&body) {
                        Ok(Flow::Value(_)) => Ok(()),
                        Ok(Flow::Signal(kind, _)) => Err(EvalError::ConcurrencyMisuse {
                            message: format!("{kind:?} escaped a spawned block"),
                            trace: Vec::new(),
                        }),
                        Err(e) => Err(e),
                    });
                }
                other => {
                    last = self.eval_stmt(other)?.into_value()?;
                }
            }
        }
        join.join_all()?;
        Ok(Flow::Value(last))
    }

    /// Builds the child evaluator a spawned strand runs with: its own
    /// heap/regions (spec "fresh child evaluator"), but the parent's
    /// declaration tables and current environment snapshot, since a
    /// spawned strand should see everything visible at the `spawn` site.
    fn fork_for_spawn(&self) -> Evaluator {
        Evaluator {
            env: self.env.clone(),
            heap: FluxHeap::new(self.config.gc_threshold_bytes, self.config.gc_stress),
            regions: RegionStore::new(),
            config: self.config.clone(),
            fns: self.fns.clone(),
            structs: self.structs.clone(),
            enums: self.enums.clone(),
            builtins: self.builtins.clone(),
            tracks: TrackStore::new(self.config.history_cap),
            bonds: BondGraph::new(),
            reactions: Default::default(),
            contracts: Default::default(),
            defers: Vec::new(),
            module_loader: self.module_loader.clone(),
        }
    }

    fn eval_import(&mut self, path: &str, form: &ImportForm) -> EvalResult {
        let exports = self.load_module(path)?;
        match form {
            ImportForm::Whole(name) => {
                self.env.define(name.clone(), exports);
            }
            ImportForm::Named(names) => {
                let ValueKind::Map(m) = &exports.kind else {
                    return Err(EvalError::internal("module exports were not a map"));
                };
                for name in names {
                    let value = m
                        .get(name)
                        .cloned()
                        .ok_or_else(|| EvalError::undefined_name(name.clone(), None))?;
                    self.env.define(name.clone(), value);
                }
            }
        }
        Ok(Flow::Value(Value::unit()))
    }

    /// Resolves and runs `import_path`'s module, returning its cached
    /// exports on a repeat import and detecting import cycles (spec §6).
    fn load_module(&mut self, import_path: &str) -> Result<Value, EvalError> {
        if let Some(loader) = &self.module_loader {
            if let Some(cached) = loader.cached_exports(import_path) {
                return Ok(cached);
            }
        }
        {
            let loader = self
                .module_loader
                .as_mut()
                .ok_or_else(|| EvalError::internal("no module loader configured for `import`"))?;
            loader.begin_loading(import_path)?;
        }
        let load_result = self.load_and_run_module(import_path);
        self.module_loader.as_mut().expect("checked above").finish_loading(import_path);
        let exports = load_result?;
        self.module_loader.as_mut().expect("checked above").cache_exports(import_path, exports.clone());
        Ok(exports)
    }

    /// Parses (if needed), registers the module's items, and runs its
    /// top-level statements in a fresh scope, collecting that scope's own
    /// bindings plus its top-level `fn`s as the module's exports.
    fn load_and_run_module(&mut self, import_path: &str) -> Result<Value, EvalError> {
        let program = self.module_loader.as_mut().expect("checked by caller").load_program(import_path)?;

        let mut fn_names = Vec::new();
        for item in &program.items {
            self.register_item(item)?;
            if let Item::Fn(decl) = item {
                fn_names.push(decl.name.clone());
            }
        }

        self.env.push_scope();
        let run: Result<(), EvalError> = (|| {
            for item in program.items.iter() {
                if let Item::Stmt(stmt) = item {
                    self.eval_stmt(stmt)?.into_value()?;
                }
            }
            Ok(())
        })();

        let mut exports = HashMap::new();
        if run.is_ok() {
            for name in self.env.current_scope_names().map(str::to_string).collect::<Vec<_>>() {
                if let Some(value) = self.env.get(&name).cloned() {
                    exports.insert(name, value);
                }
            }
        }
        self.env.pop_scope();
        run?;

        for name in fn_names {
            exports.entry(name.clone()).or_insert_with(|| self.make_module_fn_export(&name));
        }

        Ok(Value::flux(ValueKind::Map(exports)))
    }

    /// A forwarding closure exported for a module's top-level `fn`: since
    /// functions live in the shared `fns` table rather than as env bindings,
    /// `import { f } from "m"` needs a callable `Value` to bind `f` to.
    fn make_module_fn_export(&self, name: &str) -> Value {
        let decl = self.fns.first_overload(name);
        let params: Vec<ParamDecl> = decl.map(|d| d.params.clone()).unwrap_or_default();
        let args: Vec<Expr> = params.iter().map(|p| Expr::Ident(p.name.clone())).collect();
        let body = Arc::new(Expr::Call { callee: Box::new(Expr::Ident(name.to_string())), args });
        Value::flux(ValueKind::Closure(Box::new(ClosureData {
            params: params.iter().map(param_decl_to_param).collect(),
            body,
            env: Environment::new(),
            variadic: params.last().is_some_and(|p| p.variadic),
            native: None,
        })))
    }

    fn eval_select(&mut self, arms: &[SelectArm]) -> EvalResult {
        let mut default_idx = None;
        let mut timeout_idx = None;
        let mut channels = Vec::new();
        let mut send_values = Vec::new();

        for (i, arm) in arms.iter().enumerate() {
            if arm.is_default {
                default_idx = Some(i);
                continue;
            }
            if arm.is_timeout {
                timeout_idx = Some(i);
                continue;
            }
            let chan = self.eval_expr(&arm.channel)?.into_value()?;
            let send_value = match &arm.send_value {
                Some(e) => Some(self.eval_expr(e)?.into_value()?),
                None => None,
            };
            channels.push((i, chan));
            send_values.push(send_value);
        }

        let mut candidates: Vec<SelectCandidate<'_>> = channels
            .iter()
            .zip(send_values)
            .map(|((_, chan), send_value)| SelectCandidate {
                channel: chan,
                is_send: send_value.is_some(),
                send_value,
            })
            .collect();

        let outcome = concurrency::select_blocking(&mut candidates, default_idx.is_some(), None)?;

        match outcome {
            SelectOutcome::Ready(pos, received) => {
                let (arm_idx, _) = channels[pos];
                let arm = &arms[arm_idx];
                self.env.push_scope();
                if let (Some(bind_name), Some(v)) = (&arm.bind_name, received) {
                    self.env.define(bind_name.clone(), v);
                }
                let result = self.eval_block_body(&arm.body);
                self.env.pop_scope();
                result
            }
            SelectOutcome::Default => {
                let arm = &arms[default_idx.expect("default outcome without a default arm")];
                self.eval_block(&arm.body)
            }
            SelectOutcome::TimedOut => {
                let idx = timeout_idx.ok_or_else(|| EvalError::ConcurrencyMisuse {
                    message: "select timed out with no `timeout` arm".into(),
                    trace: Vec::new(),
                })?;
                self.eval_block(&arms[idx].body)
            }
        }
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(n) => Value::int(*n),
        Literal::Float(n) => Value::float(*n),
        Literal::Bool(b) => Value::bool(*b),
        Literal::Str(s) => Value::string(s.clone()),
        Literal::Nil => Value::nil(),
        Literal::Unit => Value::unit(),
    }
}

fn eval_unary(op: UnOp, v: Value) -> Result<Value, EvalError> {
    match (op, &v.kind) {
        (UnOp::Neg, ValueKind::Int(n)) => Ok(Value::int(-n)),
        (UnOp::Neg, ValueKind::Float(n)) => Ok(Value::float(-n)),
        (UnOp::Not, _) => Ok(Value::bool(!v.is_truthy())),
        _ => Err(EvalError::type_error(format!("unary operator not defined for {}", v.type_name()))),
    }
}

fn eval_binary(op: BinOp, l: Value, r: Value) -> Result<Value, EvalError> {
    use BinOp::*;
    use ValueKind::*;

    if matches!(op, Eq) {
        return Ok(Value::bool(l.eq_value(&r)));
    }
    if matches!(op, NotEq) {
        return Ok(Value::bool(!l.eq_value(&r)));
    }

    match (op, &l.kind, &r.kind) {
        (Add, Str(a), Str(b)) => Ok(Value::string(format!("{a}{b}"))),
        (Add, Array(a), Array(b)) => {
            let mut v = a.clone();
            v.extend(b.clone());
            Ok(Value::array(v))
        }
        (Add | Sub | Mul | Div | Mod, Int(a), Int(b)) => int_arith(op, *a, *b),
        (Add | Sub | Mul | Div | Mod, Float(a), Float(b)) => float_arith(op, *a, *b),
        (Add | Sub | Mul | Div | Mod, Int(a), Float(b)) => float_arith(op, *a as f64, *b),
        (Add | Sub | Mul | Div | Mod, Float(a), Int(b)) => float_arith(op, *a, *b as f64),
        (Lt | LtEq | Gt | GtEq, Int(a), Int(b)) => Ok(Value::bool(compare_ord(op, a.partial_cmp(b)))),
        (Lt | LtEq | Gt | GtEq, Float(a), Float(b)) => Ok(Value::bool(compare_ord(op, a.partial_cmp(b)))),
        (Lt | LtEq | Gt | GtEq, Str(a), Str(b)) => Ok(Value::bool(compare_ord(op, a.partial_cmp(b)))),
        _ => Err(EvalError::type_error(format!(
            "operator not defined for {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

/// Default element ordering for `Array.sort()` with no comparator: numeric
/// and lexical ordering for the obvious cases, `Equal` (stable, leaves
/// relative order alone) for anything else rather than erroring.
fn default_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (&a.kind, &b.kind) {
        (ValueKind::Int(x), ValueKind::Int(y)) => x.cmp(y),
        (ValueKind::Float(x), ValueKind::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (ValueKind::Int(x), ValueKind::Float(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (ValueKind::Float(x), ValueKind::Int(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (ValueKind::Str(x), ValueKind::Str(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn compare_ord(op: BinOp, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ord) {
        (BinOp::Lt, Some(Less)) => true,
        (BinOp::LtEq, Some(Less | Equal)) => true,
        (BinOp::Gt, Some(Greater)) => true,
        (BinOp::GtEq, Some(Greater | Equal)) => true,
        _ => false,
    }
}

fn int_arith(op: BinOp, a: i64, b: i64) -> Result<Value, EvalError> {
    match op {
        BinOp::Add => Ok(Value::int(a.wrapping_add(b))),
        BinOp::Sub => Ok(Value::int(a.wrapping_sub(b))),
        BinOp::Mul => Ok(Value::int(a.wrapping_mul(b))),
        BinOp::Div if b == 0 => Err(EvalError::DivisionByZero { trace: Vec::new() }),
        BinOp::Div => Ok(Value::int(a / b)),
        BinOp::Mod if b == 0 => Err(EvalError::DivisionByZero { trace: Vec::new() }),
        BinOp::Mod => Ok(Value::int(a % b)),
        _ => unreachable!(),
    }
}

fn float_arith(op: BinOp, a: f64, b: f64) -> Result<Value, EvalError> {
    match op {
        BinOp::Add => Ok(Value::float(a + b)),
        BinOp::Sub => Ok(Value::float(a - b)),
        BinOp::Mul => Ok(Value::float(a * b)),
        BinOp::Div if b == 0.0 => Err(EvalError::DivisionByZero { trace: Vec::new() }),
        BinOp::Div => Ok(Value::float(a / b)),
        BinOp::Mod if b == 0.0 => Err(EvalError::DivisionByZero { trace: Vec::new() }),
        BinOp::Mod => Ok(Value::float(a % b)),
        _ => unreachable!(),
    }
}

fn parse_pressure_mode(name: &str) -> Result<PressureMode, EvalError> {
    match name {
        "no_grow" => Ok(PressureMode::NoGrow),
        "no_shrink" => Ok(PressureMode::NoShrink),
        "no_resize" => Ok(PressureMode::NoResize),
        "read_heavy" => Ok(PressureMode::ReadHeavy),
        other => Err(EvalError::type_error(format!("unknown pressure mode `{other}`"))),
    }
}

fn param_decl_to_param(p: &ParamDecl) -> Param {
    Param { name: p.name.clone(), type_name: p.type_name.clone(), phase: p.phase, default: p.default.clone(), variadic: p.variadic }
}

fn param_to_param_decl(p: &Param) -> ParamDecl {
    ParamDecl { name: p.name.clone(), type_name: p.type_name.clone(), phase: p.phase, default: p.default.clone(), variadic: p.variadic }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_closure(f: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Value {
        Value::flux(ValueKind::Closure(Box::new(ClosureData {
            params: Vec::new(),
            body: Arc::new(Expr::Literal(Literal::Unit)),
            env: Environment::new(),
            variadic: false,
            native: Some(Arc::new(f)),
        })))
    }

    fn eval() -> Evaluator {
        Evaluator::new(EvaluatorConfig::default())
    }

    #[test]
    fn array_map_applies_closure_to_each_element() {
        let mut ev = eval();
        let mut recv = Value::array(vec![Value::int(1), Value::int(2), Value::int(3)]);
        let double = native_closure(|args| Value::int(match args[0].kind {
            ValueKind::Int(n) => n * 2,
            _ => unreachable!(),
        }));
        let result = ev.try_higher_order_method(&mut recv, "map", &[double]).unwrap().unwrap();
        assert!(result.eq_value(&Value::array(vec![Value::int(2), Value::int(4), Value::int(6)])));
    }

    #[test]
    fn array_filter_keeps_truthy_elements() {
        let mut ev = eval();
        let mut recv = Value::array(vec![Value::int(1), Value::int(2), Value::int(3), Value::int(4)]);
        let is_even = native_closure(|args| Value::bool(match args[0].kind {
            ValueKind::Int(n) => n % 2 == 0,
            _ => unreachable!(),
        }));
        let result = ev.try_higher_order_method(&mut recv, "filter", &[is_even]).unwrap().unwrap();
        assert!(result.eq_value(&Value::array(vec![Value::int(2), Value::int(4)])));
    }

    #[test]
    fn array_reduce_threads_accumulator() {
        let mut ev = eval();
        let mut recv = Value::array(vec![Value::int(1), Value::int(2), Value::int(3)]);
        let sum = native_closure(|args| Value::int(match (&args[0].kind, &args[1].kind) {
            (ValueKind::Int(acc), ValueKind::Int(n)) => acc + n,
            _ => unreachable!(),
        }));
        let result = ev.try_higher_order_method(&mut recv, "reduce", &[sum, Value::int(0)]).unwrap().unwrap();
        assert!(result.eq_value(&Value::int(6)));
    }

    #[test]
    fn array_sort_without_comparator_uses_default_ordering() {
        let mut ev = eval();
        let mut recv = Value::flux(ValueKind::Array(vec![Value::int(3), Value::int(1), Value::int(2)]));
        ev.try_higher_order_method(&mut recv, "sort", &[]).unwrap();
        assert!(recv.eq_value(&Value::array(vec![Value::int(1), Value::int(2), Value::int(3)])));
    }

    #[test]
    fn array_sort_with_comparator_orders_descending() {
        let mut ev = eval();
        let mut recv = Value::flux(ValueKind::Array(vec![Value::int(1), Value::int(3), Value::int(2)]));
        let desc = native_closure(|args| Value::int(match (&args[0].kind, &args[1].kind) {
            (ValueKind::Int(a), ValueKind::Int(b)) => b - a,
            _ => unreachable!(),
        }));
        ev.try_higher_order_method(&mut recv, "sort", &[desc]).unwrap();
        assert!(recv.eq_value(&Value::array(vec![Value::int(3), Value::int(2), Value::int(1)])));
    }

    #[test]
    fn array_sort_rejects_crystal_receiver() {
        let mut ev = eval();
        let mut recv = Value::new(ValueKind::Array(vec![Value::int(2), Value::int(1)]), Phase::Crystal);
        assert!(ev.try_higher_order_method(&mut recv, "sort", &[]).is_err());
    }

    #[test]
    fn map_for_each_visits_every_entry() {
        let mut ev = eval();
        let mut recv = Value::flux(ValueKind::Map(HashMap::from([
            ("a".to_string(), Value::int(1)),
            ("b".to_string(), Value::int(2)),
        ])));
        let seen = Arc::new(std::sync::Mutex::new(0i64));
        let seen2 = seen.clone();
        let collector = native_closure(move |args| {
            if let ValueKind::Int(n) = args[1].kind {
                *seen2.lock().unwrap() += n;
            }
            Value::unit()
        });
        ev.try_higher_order_method(&mut recv, "for_each", &[collector]).unwrap();
        assert_eq!(*seen.lock().unwrap(), 3);
    }

    #[test]
    fn map_filter_keeps_matching_entries() {
        let mut ev = eval();
        let mut recv = Value::flux(ValueKind::Map(HashMap::from([
            ("a".to_string(), Value::int(1)),
            ("b".to_string(), Value::int(2)),
        ])));
        let keep_b = native_closure(|args| Value::bool(matches!(&args[0].kind, ValueKind::Str(s) if s == "b")));
        let result = ev.try_higher_order_method(&mut recv, "filter", &[keep_b]).unwrap().unwrap();
        let ValueKind::Map(m) = &result.kind else { panic!("expected Map") };
        assert_eq!(m.len(), 1);
        assert!(m.get("b").unwrap().eq_value(&Value::int(2)));
    }

    #[test]
    fn non_closure_accepting_type_returns_none() {
        let mut ev = eval();
        let mut recv = Value::int(5);
        assert!(ev.try_higher_order_method(&mut recv, "map", &[Value::int(1)]).unwrap().is_none());
    }

    fn fn_decl(name: &str, params: Vec<ParamDecl>, body: Expr, requires: Vec<Contract>, ensures: Vec<Contract>) -> FnDecl {
        FnDecl { name: name.to_string(), params, body: Arc::new(body), requires, ensures }
    }

    #[test]
    fn require_violation_reports_contract_error() {
        let mut ev = eval();
        let decl = fn_decl(
            "divide",
            vec![
                ParamDecl { name: "a".into(), type_name: None, phase: None, default: None, variadic: false },
                ParamDecl { name: "b".into(), type_name: None, phase: None, default: None, variadic: false },
            ],
            Expr::Binary(BinOp::Div, Box::new(Expr::Ident("a".into())), Box::new(Expr::Ident("b".into()))),
            vec![Contract {
                predicate: Expr::Binary(BinOp::NotEq, Box::new(Expr::Ident("b".into())), Box::new(Expr::Literal(Literal::Int(0)))),
                message: Some(Expr::Literal(Literal::Str("divisor must not be zero".into()))),
            }],
            Vec::new(),
        );
        let err = ev.call_decl(&decl, vec![Value::int(10), Value::int(0)]).unwrap_err();
        match err {
            EvalError::ContractViolation { message, .. } => assert_eq!(message, "divisor must not be zero"),
            other => panic!("expected ContractViolation, got {other:?}"),
        }
    }

    #[test]
    fn ensure_binds_result_for_postcondition_check() {
        let mut ev = eval();
        let decl = fn_decl(
            "negate",
            vec![ParamDecl { name: "x".into(), type_name: None, phase: None, default: None, variadic: false }],
            Expr::Unary(UnOp::Neg, Box::new(Expr::Ident("x".into()))),
            Vec::new(),
            vec![Contract {
                predicate: Expr::Binary(BinOp::Lt, Box::new(Expr::Ident("result".into())), Box::new(Expr::Literal(Literal::Int(0)))),
                message: None,
            }],
        );
        let value = ev.call_decl(&decl, vec![Value::int(5)]).unwrap().into_value().unwrap();
        assert!(value.eq_value(&Value::int(-5)));
    }

    #[test]
    fn flux_parameter_writes_back_to_caller_variable() {
        let mut ev = eval();
        ev.env.define("counter", Value::int(1));
        let decl = fn_decl(
            "increment",
            vec![ParamDecl { name: "n".into(), type_name: None, phase: Some(Phase::Flux), default: None, variadic: false }],
            Expr::Block(vec![
                Stmt::Assign {
                    target: Expr::Ident("n".into()),
                    value: Expr::Binary(BinOp::Add, Box::new(Expr::Ident("n".into())), Box::new(Expr::Literal(Literal::Int(1)))),
                },
                Stmt::Return(Some(Expr::Ident("n".into()))),
            ]),
            Vec::new(),
            Vec::new(),
        );
        ev.fns.register_fn(Arc::new(decl));
        let arg_exprs = [Expr::Ident("counter".into())];
        ev.call_fn_at_site("increment", vec![Value::int(1)], Some(&arg_exprs)).unwrap();
        assert!(ev.env.get("counter").unwrap().eq_value(&Value::int(2)));
    }

    #[test]
    fn loop_runs_until_break() {
        let mut ev = eval();
        ev.env.define("count", Value::int(0));
        let body = vec![
            Stmt::Assign {
                target: Expr::Ident("count".into()),
                value: Expr::Binary(BinOp::Add, Box::new(Expr::Ident("count".into())), Box::new(Expr::Literal(Literal::Int(1)))),
            },
            Stmt::Expr(Expr::If {
                cond: Box::new(Expr::Binary(BinOp::GtEq, Box::new(Expr::Ident("count".into())), Box::new(Expr::Literal(Literal::Int(3))))),
                then_branch: Box::new(Expr::Block(vec![Stmt::Break(None)])),
                else_branch: None,
            }),
        ];
        ev.eval_loop(&body).unwrap();
        assert!(ev.env.get("count").unwrap().eq_value(&Value::int(3)));
    }

    #[test]
    fn defer_runs_lifo_on_block_exit() {
        let mut ev = eval();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log1 = log.clone();
        let log2 = log.clone();
        ev.builtins.register_extension("record_first", Arc::new(move |_args: &[Value]| { log1.lock().unwrap().push(1); Value::unit() }));
        ev.builtins.register_extension("record_second", Arc::new(move |_args: &[Value]| { log2.lock().unwrap().push(2); Value::unit() }));
        let body = vec![
            Stmt::Defer(vec![Stmt::Expr(Expr::Call { callee: Box::new(Expr::Ident("record_first".into())), args: Vec::new() })]),
            Stmt::Defer(vec![Stmt::Expr(Expr::Call { callee: Box::new(Expr::Ident("record_second".into())), args: Vec::new() })]),
        ];
        ev.eval_block(&body).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn defer_error_replaces_ok_outcome() {
        let mut ev = eval();
        let body = vec![Stmt::Defer(vec![Stmt::Expr(Expr::Binary(
            BinOp::Div,
            Box::new(Expr::Literal(Literal::Int(1))),
            Box::new(Expr::Literal(Literal::Int(0))),
        ))])];
        let err = ev.eval_block(&body).unwrap_err();
        assert!(matches!(err, EvalError::DivisionByZero { .. }));
    }

    #[test]
    fn destructure_array_binds_elements_and_rest() {
        let mut ev = eval();
        let pattern = phase_core::ast::DestructurePattern::Array {
            elements: vec!["first".into(), "second".into()],
            rest: Some("tail".into()),
        };
        let value = Expr::Array(vec![Expr::Literal(Literal::Int(1)), Expr::Literal(Literal::Int(2)), Expr::Literal(Literal::Int(3))]);
        ev.eval_destructure(&pattern, None, &value).unwrap();
        assert!(ev.env.get("first").unwrap().eq_value(&Value::int(1)));
        assert!(ev.env.get("second").unwrap().eq_value(&Value::int(2)));
        assert!(ev.env.get("tail").unwrap().eq_value(&Value::array(vec![Value::int(3)])));
    }

    #[test]
    fn destructure_fields_reads_struct_by_name() {
        let mut ev = eval();
        let pattern = phase_core::ast::DestructurePattern::Fields(vec![("x".into(), "px".into())]);
        let s = Value::flux(ValueKind::Struct(StructData {
            name: "Point".into(),
            field_names: vec!["x".into(), "y".into()],
            field_values: vec![Value::int(10), Value::int(20)],
            field_phases: None,
        }));
        ev.env.define("p", s);
        ev.eval_destructure(&pattern, None, &Expr::Ident("p".into())).unwrap();
        assert!(ev.env.get("px").unwrap().eq_value(&Value::int(10)));
    }

    #[test]
    fn destructure_fields_reads_map_by_key() {
        let mut ev = eval();
        let pattern = phase_core::ast::DestructurePattern::Fields(vec![("a".into(), "va".into())]);
        let m = Value::flux(ValueKind::Map(HashMap::from([("a".to_string(), Value::int(99))])));
        ev.env.define("m", m);
        ev.eval_destructure(&pattern, None, &Expr::Ident("m".into())).unwrap();
        assert!(ev.env.get("va").unwrap().eq_value(&Value::int(99)));
    }

    #[test]
    fn forge_block_freezes_its_result() {
        let mut ev = eval();
        let result = ev.eval_expr(&Expr::Forge(vec![Stmt::Expr(Expr::Literal(Literal::Int(7)))])).unwrap().into_value().unwrap();
        assert_eq!(result.phase, Phase::Crystal);
        assert!(result.eq_value(&Value::int(7)));
    }

    #[test]
    fn try_catch_binds_error_message() {
        let mut ev = eval();
        let try_block = vec![Stmt::Expr(Expr::Binary(
            BinOp::Div,
            Box::new(Expr::Literal(Literal::Int(1))),
            Box::new(Expr::Literal(Literal::Int(0))),
        ))];
        let catch_block = vec![Stmt::Expr(Expr::Ident("caught".into()))];
        let result = ev.eval_try_catch(&try_block, "caught", &catch_block).unwrap().into_value().unwrap();
        let ValueKind::Str(msg) = &result.kind else { panic!("expected a bound error string") };
        assert!(msg.contains("division"));
    }

    #[test]
    fn try_propagate_unwraps_ok_tag() {
        let mut ev = eval();
        let ok_map = Value::flux(ValueKind::Map(HashMap::from([
            ("tag".to_string(), Value::string("ok")),
            ("value".to_string(), Value::int(42)),
        ])));
        ev.env.define("result", ok_map);
        let value = ev.eval_try_propagate(&Expr::Ident("result".into())).unwrap().into_value().unwrap();
        assert!(value.eq_value(&Value::int(42)));
    }

    #[test]
    fn try_propagate_signals_return_on_err_tag() {
        let mut ev = eval();
        let err_map = Value::flux(ValueKind::Map(HashMap::from([
            ("tag".to_string(), Value::string("err")),
            ("err".to_string(), Value::string("boom")),
        ])));
        ev.env.define("result", err_map);
        match ev.eval_try_propagate(&Expr::Ident("result".into())).unwrap() {
            Flow::Signal(SignalKind::Return, _) => {}
            other => panic!("expected a Return signal, got {other:?}"),
        }
    }

    #[test]
    fn freeze_writes_back_into_the_bound_identifier() {
        let mut ev = eval();
        ev.env.define("a", Value::array(vec![Value::int(1), Value::int(2)]));
        ev.eval_freeze(&Expr::Ident("a".into())).unwrap();
        assert_eq!(ev.env.get("a").unwrap().phase, Phase::Crystal);
    }

    #[test]
    fn pushing_to_a_frozen_array_is_rejected() {
        let mut ev = eval();
        ev.env.define("a", Value::array(vec![Value::int(1), Value::int(2)]));
        ev.eval_freeze(&Expr::Ident("a".into())).unwrap();
        let err = ev
            .eval_method_call(&Expr::Ident("a".into()), "push", &[Expr::Literal(Literal::Int(4))])
            .unwrap_err();
        assert!(matches!(err, EvalError::PhaseViolation { .. }));
    }

    #[test]
    fn freeze_field_partially_freezes_just_that_field() {
        let mut ev = eval();
        let s = Value::flux(ValueKind::Struct(StructData {
            name: "Point".into(),
            field_names: vec!["x".into(), "y".into()],
            field_values: vec![Value::int(1), Value::int(2)],
            field_phases: None,
        }));
        ev.env.define("p", s);
        ev.eval_freeze(&Expr::Field(Box::new(Expr::Ident("p".into())), "x".into())).unwrap();

        let assign_x = ev.assign(&Expr::Field(Box::new(Expr::Ident("p".into())), "x".into()), Value::int(99));
        assert!(matches!(assign_x.unwrap_err(), EvalError::PhaseViolation { .. }));

        ev.assign(&Expr::Field(Box::new(Expr::Ident("p".into())), "y".into()), Value::int(5)).unwrap();
        let ValueKind::Struct(s) = &ev.env.get("p").unwrap().kind else { panic!("expected struct") };
        assert!(s.field("y").unwrap().eq_value(&Value::int(5)));
    }

    #[test]
    fn freeze_index_partially_freezes_just_that_key() {
        let mut ev = eval();
        let m = Value::flux(ValueKind::Map(HashMap::from([
            ("a".to_string(), Value::int(1)),
            ("b".to_string(), Value::int(2)),
        ])));
        ev.env.define("m", m);
        ev.eval_freeze(&Expr::Index(
            Box::new(Expr::Ident("m".into())),
            Box::new(Expr::Literal(Literal::Str("a".into()))),
        ))
        .unwrap();

        let err = ev
            .assign(
                &Expr::Index(Box::new(Expr::Ident("m".into())), Box::new(Expr::Literal(Literal::Str("a".into())))),
                Value::int(9),
            )
            .unwrap_err();
        assert!(matches!(err, EvalError::PhaseViolation { .. }));

        ev.assign(
            &Expr::Index(Box::new(Expr::Ident("m".into())), Box::new(Expr::Literal(Literal::Str("b".into())))),
            Value::int(9),
        )
        .unwrap();
    }

    #[test]
    fn freeze_runs_the_seed_contract_before_committing() {
        let mut ev = eval();
        ev.env.define("n", Value::flux(ValueKind::Int(-1)));
        let rejects_negative = native_closure(|args| Value::bool(match args[0].kind {
            ValueKind::Int(n) => n >= 0,
            _ => unreachable!(),
        }));
        ev.contracts.insert("n".to_string(), rejects_negative);
        let err = ev.eval_freeze(&Expr::Ident("n".into())).unwrap_err();
        assert!(matches!(err, EvalError::ContractViolation { .. }));
        assert_eq!(ev.env.get("n").unwrap().phase, Phase::Flux);
    }

    #[test]
    fn freeze_fires_registered_reactions() {
        let mut ev = eval();
        ev.env.define("n", Value::flux(ValueKind::Int(1)));
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log2 = log.clone();
        let cb = native_closure(move |args| {
            log2.lock().unwrap().push(args[0].clone());
            Value::unit()
        });
        ev.reactions.entry("n".to_string()).or_default().push(cb);
        ev.eval_freeze(&Expr::Ident("n".into())).unwrap();
        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].phase, Phase::Crystal);
    }

    #[test]
    fn mirror_bond_cascades_a_freeze_to_its_target() {
        let mut ev = eval();
        ev.env.define("a", Value::flux(ValueKind::Int(1)));
        ev.env.define("b", Value::flux(ValueKind::Int(2)));
        ev.bonds.add("a", "b", BondStrategy::Mirror);
        ev.eval_freeze(&Expr::Ident("a".into())).unwrap();
        assert_eq!(ev.env.get("b").unwrap().phase, Phase::Crystal);
    }

    #[test]
    fn inverse_bond_thaws_its_target_on_freeze() {
        let mut ev = eval();
        ev.env.define("a", Value::flux(ValueKind::Int(1)));
        ev.env.define("b", Value::flux(ValueKind::Int(2)));
        ev.eval_freeze(&Expr::Ident("b".into())).unwrap();
        assert_eq!(ev.env.get("b").unwrap().phase, Phase::Crystal);
        ev.bonds.add("a", "b", BondStrategy::Inverse);
        ev.eval_freeze(&Expr::Ident("a".into())).unwrap();
        assert_eq!(ev.env.get("b").unwrap().phase, Phase::Flux);
    }

    #[test]
    fn gate_bond_aborts_the_whole_freeze_until_dependency_is_crystal() {
        let mut ev = eval();
        ev.env.define("a", Value::flux(ValueKind::Int(1)));
        ev.env.define("dep", Value::flux(ValueKind::Int(2)));
        ev.bonds.add("a", "dep", BondStrategy::Gate);

        let err = ev.eval_freeze(&Expr::Ident("a".into())).unwrap_err();
        assert!(matches!(err, EvalError::PhaseViolation { .. }));
        assert_eq!(ev.env.get("a").unwrap().phase, Phase::Flux);

        ev.eval_freeze(&Expr::Ident("dep".into())).unwrap();
        ev.eval_freeze(&Expr::Ident("a".into())).unwrap();
        assert_eq!(ev.env.get("a").unwrap().phase, Phase::Crystal);
    }

    #[test]
    fn strict_mode_rejects_a_flux_declaration_of_an_already_crystal_value() {
        let mut config = EvaluatorConfig::default();
        config.mode = EvalMode::Strict;
        let mut ev = Evaluator::new(config);
        let mut crystal = Value::flux(ValueKind::Int(1));
        crystal.phase = Phase::Crystal;
        let err = ev.apply_declared_phase(crystal, Some(Phase::Flux)).unwrap_err();
        assert!(matches!(err, EvalError::PhaseViolation { .. }));
    }

    #[test]
    fn casual_mode_still_allows_downgrading_a_crystal_value_to_flux() {
        let ev = eval();
        let mut crystal = Value::flux(ValueKind::Int(1));
        crystal.phase = Phase::Crystal;
        let result = ev.apply_declared_phase(crystal, Some(Phase::Flux)).unwrap();
        assert_eq!(result.phase, Phase::Flux);
    }

    #[test]
    fn eval_scope_surfaces_a_spawned_childs_escaped_signal_as_an_error() {
        let mut ev = eval();
        let stmts = vec![Stmt::Expr(Expr::Spawn(vec![Stmt::Break(None)]))];
        let err = ev.eval_scope(&stmts).unwrap_err();
        assert!(matches!(err, EvalError::ConcurrencyMisuse { .. }));
    }

    #[test]
    fn eval_scope_surfaces_a_spawned_childs_eval_error() {
        let mut ev = eval();
        let stmts = vec![Stmt::Expr(Expr::Spawn(vec![Stmt::Expr(Expr::Binary(
            BinOp::Div,
            Box::new(Expr::Literal(Literal::Int(1))),
            Box::new(Expr::Literal(Literal::Int(0))),
        ))]))];
        let err = ev.eval_scope(&stmts).unwrap_err();
        assert!(matches!(err, EvalError::DivisionByZero { .. }));
    }

    struct StubModuleParser {
        program: Program,
    }
    impl crate::module::ModuleParser for StubModuleParser {
        fn parse_file(&self, _path: &std::path::Path) -> Result<Program, EvalError> {
            Ok(self.program.clone())
        }
    }

    #[test]
    fn import_whole_binds_the_exports_map_under_one_name() {
        let mut ev = eval();
        let program = Program {
            items: vec![Item::Stmt(Stmt::Let {
                name: "greeting".into(),
                phase: None,
                type_name: None,
                value: Expr::Literal(Literal::Str("hi".into())),
            })],
        };
        ev.set_module_loader(ModuleLoader::new(Arc::new(StubModuleParser { program }), "/scripts"));
        ev.eval_import("util", &ImportForm::Whole("util".into())).unwrap();
        let ValueKind::Map(m) = &ev.env.get("util").unwrap().kind else { panic!("expected a map") };
        assert!(m.get("greeting").unwrap().eq_value(&Value::string("hi")));
    }

    #[test]
    fn import_named_binds_each_export_directly() {
        let mut ev = eval();
        let program = Program {
            items: vec![Item::Stmt(Stmt::Let {
                name: "answer".into(),
                phase: None,
                type_name: None,
                value: Expr::Literal(Literal::Int(42)),
            })],
        };
        ev.set_module_loader(ModuleLoader::new(Arc::new(StubModuleParser { program }), "/scripts"));
        ev.eval_import("util", &ImportForm::Named(vec!["answer".into()])).unwrap();
        assert!(ev.env.get("answer").unwrap().eq_value(&Value::int(42)));
    }

    #[test]
    fn importing_the_same_module_twice_reuses_cached_exports() {
        let mut ev = eval();
        let program = Program {
            items: vec![Item::Stmt(Stmt::Let {
                name: "x".into(),
                phase: None,
                type_name: None,
                value: Expr::Literal(Literal::Int(1)),
            })],
        };
        ev.set_module_loader(ModuleLoader::new(Arc::new(StubModuleParser { program }), "/scripts"));
        let first = ev.load_module("util").unwrap();
        let second = ev.load_module("util").unwrap();
        assert!(first.eq_value(&second));
    }
}
