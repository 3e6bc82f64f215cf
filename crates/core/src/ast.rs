//! AST types.
//!
//! Lexing and parsing are out of scope (spec §1 Non-goals): this module is
//! the contract the evaluator is handed an already-built tree against. It
//! lives in `phase-core` rather than `phase-runtime` only so `Value::Closure`
//! can hold a `body` reference without a dependency cycle between the two
//! crates — the teacher's own split has `core` own the data types `runtime`
//! walks (`crates/core/src/value.rs` vs `crates/runtime/src/*.rs`).

use std::sync::Arc;

use crate::value::Phase;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Fn(FnDecl),
    Struct(StructDecl),
    Enum(EnumDecl),
    Trait(TraitDecl),
    Impl(ImplBlock),
    Stmt(Stmt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub name: String,
    pub type_name: Option<String>,
    pub phase: Option<Phase>,
    pub default: Option<Arc<Expr>>,
    pub variadic: bool,
}

/// A `require`/`ensure` guard attached to a function declaration (spec
/// §4.7 call_fn: requires checked before the body runs, ensures checked
/// against the return value afterward). `message` is an optional
/// expression evaluated only when the predicate fails, to build the
/// `ContractViolation` text.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub predicate: Expr,
    pub message: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub body: Arc<Expr>,
    pub requires: Vec<Contract>,
    pub ensures: Vec<Contract>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub type_name: Option<String>,
    pub phase: Option<Phase>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantDecl {
    pub name: String,
    pub payload_types: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    pub variants: Vec<VariantDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraitDecl {
    pub name: String,
    pub method_sigs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImplBlock {
    pub trait_name: Option<String>,
    pub type_name: String,
    pub methods: Vec<FnDecl>,
}

/// A binding target for `Destructure` (spec §4.5): array patterns with an
/// optional rest binder, or struct/map patterns keyed by field/key name.
#[derive(Debug, Clone, PartialEq)]
pub enum DestructurePattern {
    Array { elements: Vec<String>, rest: Option<String> },
    Fields(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Wildcard,
    Binding(String),
    Literal(Literal),
    Tuple(Vec<Pattern>),
    EnumVariant { enum_name: Option<String>, variant_name: String, payload: Vec<Pattern> },
    StructFields { type_name: String, fields: Vec<(String, Pattern)> },
    Or(Vec<Pattern>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Nil,
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add, Sub, Mul, Div, Mod,
    Eq, NotEq, Lt, LtEq, Gt, GtEq,
    And, Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    Array(Vec<Expr>),
    MapLit(Vec<(Expr, Expr)>),
    SetLit(Vec<Expr>),
    TupleLit(Vec<Expr>),
    StructLit { type_name: String, fields: Vec<(String, Expr)> },
    EnumLit { enum_name: Option<String>, variant_name: String, payload: Vec<Expr> },
    RangeLit { start: Box<Expr>, end: Box<Expr> },
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Call { callee: Box<Expr>, args: Vec<Expr> },
    MethodCall { receiver: Box<Expr>, method: String, args: Vec<Expr> },
    Closure { params: Vec<ParamDecl>, body: Arc<Expr>, variadic: bool },
    If { cond: Box<Expr>, then_branch: Box<Expr>, else_branch: Option<Box<Expr>> },
    Match { scrutinee: Box<Expr>, arms: Vec<(Pattern, Option<Expr>, Expr)> },
    Block(Vec<Stmt>),
    PhaseOp { op: PhaseOpKind, target: Box<Expr>, args: Vec<Expr> },
    Spawn(Vec<Stmt>),
    Scope(Vec<Stmt>),
    Select(Vec<SelectArm>),
    /// Forge block (spec §4.4): runs `body` in a fresh scope, then freezes
    /// the resulting value.
    Forge(Vec<Stmt>),
    /// `try { try_block } catch(catch_var) { catch_block }` (spec §4.4): on
    /// `Err` the message is bound as a string to `catch_var` for the catch
    /// block; any `Flow::Signal` propagates through untouched.
    TryCatch { try_block: Vec<Stmt>, catch_var: String, catch_block: Vec<Stmt> },
    /// Postfix `?` (spec §4.4): operand must evaluate to a `{tag, value}`-
    /// or `{tag, err}`-shaped map; `"ok"` yields `value`, `"err"` signals a
    /// `Return` carrying the whole map up the call stack.
    TryPropagate(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhaseOpKind {
    Freeze,
    Thaw,
    Anneal,
    Sublimate,
    Crystallize,
    Borrow,
    PartialFreeze,
    FreezeExcept,
    Bond,
    React,
    Seed,
    Pressurize,
    Track,
    History,
    Rewind,
}

/// How an `import` binds the loaded module's exports (spec §6 "Import
/// form"): the whole exports map under one name, or a set of named
/// exports bound directly into the current scope.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportForm {
    Whole(String),
    Named(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectArm {
    pub channel: Expr,
    pub is_send: bool,
    pub send_value: Option<Expr>,
    pub bind_name: Option<String>,
    pub body: Vec<Stmt>,
    pub is_default: bool,
    pub is_timeout: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, phase: Option<Phase>, type_name: Option<String>, value: Expr },
    Assign { target: Expr, value: Expr },
    Expr(Expr),
    Return(Option<Expr>),
    Break(Option<Expr>),
    Continue,
    While { cond: Expr, body: Vec<Stmt> },
    For { binding: String, iterable: Expr, body: Vec<Stmt> },
    /// Unconditional loop (spec §4.5): runs until a `Break` escapes it.
    Loop(Vec<Stmt>),
    /// Registers `body` to run LIFO on normal or abnormal exit from every
    /// enclosing scope at or above the current depth (spec §4.5).
    Defer(Vec<Stmt>),
    Destructure { pattern: DestructurePattern, phase: Option<Phase>, value: Expr },
    /// `import "path" as name` or `import { a, b } from "path"` (spec §4.5,
    /// §6): delegates to the module loader.
    Import { path: String, form: ImportForm },
    Item(Item),
}
