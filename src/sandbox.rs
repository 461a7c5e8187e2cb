//! Sandboxed transform evaluation.
//!
//! Transform expressions are parsed once with `oxc_parser`, lowered into an
//! owned [`SandboxExpr`] tree and memoized by source text. Evaluation is a
//! pure tree walk over `serde_json::Value`:
//!
//! - No assignment, `new`, `await`, sequence, regex or function expressions.
//!   Arrow functions are accepted at the top level and as callbacks to the
//!   array methods.
//! - Free identifiers must resolve in the render scope (or be one of the
//!   small set of globals below). Anything else is rejected before evaluation.
//! - Calls go through a fixed allow-list of string, number and array
//!   methods plus `String`, `Number`, `Boolean`, `Math.*` and
//!   `JSON.stringify`.
//! - Every node visit costs one step; a program that exceeds the budget is
//!   abandoned.

use lazy_static::lazy_static;
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    ArrayExpressionElement, ArrowFunctionExpression, BindingPattern, CallExpression, ChainElement,
    ComputedMemberExpression, Expression, ObjectPropertyKind, PropertyKind, Statement,
    StaticMemberExpression,
};
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::SourceType;
use oxc_syntax::operator::{BinaryOperator, LogicalOperator, UnaryOperator};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::binding::{step, utf16_unit_at};
use crate::expression::Unsupported;
use crate::scope::Scope;
use crate::value::{
    compare, display, is_nullish, is_truthy, loose_equals, number_value, strict_equals, to_number,
    type_of,
};

pub const MAX_STEPS: usize = 10_000;
pub const MAX_STRING_LEN: usize = 1 << 20;
/// Longest array a transform may build. Every element built is also charged
/// against `MAX_STEPS`.
pub const MAX_ARRAY_LEN: usize = MAX_STEPS;
/// Rough heap bound for one built value, nested structure included.
const MAX_VALUE_BYTES: usize = 4 * MAX_STRING_LEN;
const NODE_COST: usize = 16;

lazy_static! {
    static ref ARROW_RE: Regex =
        Regex::new(r"^\s*(?:\(\s*[^()]*\)|[A-Za-z_$][\w$]*)\s*=>").unwrap();

    static ref SANDBOX_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("undefined");
        s.insert("NaN");
        s.insert("Infinity");
        s.insert("String");
        s.insert("Number");
        s.insert("Boolean");
        s.insert("Math");
        s.insert("JSON");
        s
    };

    static ref ALLOWED_METHODS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        // strings
        for name in [
            "toUpperCase", "toLowerCase", "trim", "trimStart", "trimEnd", "startsWith",
            "endsWith", "charAt", "substring", "split", "replace", "replaceAll", "padStart",
            "padEnd", "repeat",
        ] {
            s.insert(name);
        }
        // shared
        for name in ["includes", "indexOf", "slice", "concat", "toString"] {
            s.insert(name);
        }
        // numbers
        s.insert("toFixed");
        // arrays
        for name in [
            "map", "filter", "find", "findIndex", "some", "every", "reduce", "join", "reverse",
        ] {
            s.insert(name);
        }
        s
    };
}

/// Whether `source` is an arrow function (`x => ...`, `(a, b) => ...`).
pub fn is_arrow_function(source: &str) -> bool {
    ARROW_RE.is_match(source)
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOWERED AST
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum SandboxExpr {
    Literal(Value),
    Undefined,
    Ident(String),
    Member {
        object: Box<SandboxExpr>,
        property: String,
        optional: bool,
    },
    Index {
        object: Box<SandboxExpr>,
        index: Box<SandboxExpr>,
        optional: bool,
    },
    Unary(UnaryOperator, Box<SandboxExpr>),
    Binary(BinaryOperator, Box<SandboxExpr>, Box<SandboxExpr>),
    Logical(LogicalOperator, Box<SandboxExpr>, Box<SandboxExpr>),
    Conditional(Box<SandboxExpr>, Box<SandboxExpr>, Box<SandboxExpr>),
    Template {
        quasis: Vec<String>,
        expressions: Vec<SandboxExpr>,
    },
    Array(Vec<ArrayItem>),
    Object(Vec<ObjectEntry>),
    Call {
        callee: Callee,
        args: Vec<SandboxExpr>,
    },
    Lambda(Arc<Lambda>),
}

#[derive(Debug, Clone)]
pub enum ArrayItem {
    Item(SandboxExpr),
    Spread(SandboxExpr),
}

#[derive(Debug, Clone)]
pub enum ObjectEntry {
    Field(String, SandboxExpr),
    Spread(SandboxExpr),
}

#[derive(Debug, Clone)]
pub enum Callee {
    /// `String`, `Number`, `Boolean`, `Math.round`, `JSON.stringify`, ...
    Global(&'static str),
    Method {
        receiver: Box<SandboxExpr>,
        name: String,
        optional: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: SandboxExpr,
}

/// A compiled transform.
#[derive(Debug)]
pub struct Program {
    root: SandboxExpr,
    free_identifiers: Vec<String>,
}

impl Program {
    pub fn free_identifiers(&self) -> &[String] {
        &self.free_identifiers
    }

    pub fn is_function(&self) -> bool {
        matches!(self.root, SandboxExpr::Lambda(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILATION
// ═══════════════════════════════════════════════════════════════════════════════

struct ReferenceCollector {
    references: Vec<String>,
    bindings: HashSet<String>,
}

impl<'a> Visit<'a> for ReferenceCollector {
    fn visit_identifier_reference(&mut self, ident: &oxc_ast::ast::IdentifierReference) {
        self.references.push(ident.name.to_string());
    }

    fn visit_binding_identifier(&mut self, ident: &oxc_ast::ast::BindingIdentifier) {
        self.bindings.insert(ident.name.to_string());
    }
}

pub fn compile(source: &str) -> Result<Program, Unsupported> {
    let allocator = Allocator::default();
    let source_type = SourceType::default();
    let expr = Parser::new(&allocator, source, source_type)
        .parse_expression()
        .map_err(|errors| {
            tracing::debug!(source, errors = errors.len(), "transform failed to parse");
            Unsupported
        })?;

    let mut collector = ReferenceCollector {
        references: vec![],
        bindings: HashSet::new(),
    };
    collector.visit_expression(&expr);

    let mut free_identifiers: Vec<String> = Vec::new();
    for name in collector.references {
        if !collector.bindings.contains(&name)
            && !SANDBOX_GLOBALS.contains(name.as_str())
            && !free_identifiers.contains(&name)
        {
            free_identifiers.push(name);
        }
    }

    let root = lower(&expr)?;
    Ok(Program {
        root,
        free_identifiers,
    })
}

fn lower(expr: &Expression) -> Result<SandboxExpr, Unsupported> {
    match expr {
        Expression::NumericLiteral(n) => Ok(SandboxExpr::Literal(number_value(n.value))),
        Expression::StringLiteral(s) => Ok(SandboxExpr::Literal(Value::String(s.value.to_string()))),
        Expression::BooleanLiteral(b) => Ok(SandboxExpr::Literal(Value::Bool(b.value))),
        Expression::NullLiteral(_) => Ok(SandboxExpr::Literal(Value::Null)),
        Expression::Identifier(id) => Ok(match id.name.as_str() {
            "undefined" => SandboxExpr::Undefined,
            // NaN and Infinity have no JSON form
            "NaN" | "Infinity" => SandboxExpr::Literal(Value::Null),
            name => SandboxExpr::Ident(name.to_string()),
        }),
        Expression::ParenthesizedExpression(paren) => lower(&paren.expression),
        Expression::TemplateLiteral(tpl) => {
            let quasis = tpl
                .quasis
                .iter()
                .map(|q| {
                    q.value
                        .cooked
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| q.value.raw.to_string())
                })
                .collect();
            let expressions = tpl.expressions.iter().map(lower).collect::<Result<_, _>>()?;
            Ok(SandboxExpr::Template {
                quasis,
                expressions,
            })
        }
        Expression::StaticMemberExpression(st) => lower_static_member(st),
        Expression::ComputedMemberExpression(comp) => lower_computed_member(comp),
        Expression::ChainExpression(chain) => match &chain.expression {
            ChainElement::CallExpression(call) => lower_call(call),
            ChainElement::StaticMemberExpression(st) => lower_static_member(st),
            ChainElement::ComputedMemberExpression(comp) => lower_computed_member(comp),
            _ => Err(Unsupported),
        },
        Expression::UnaryExpression(unary) => {
            if matches!(unary.operator, UnaryOperator::Delete) {
                return Err(Unsupported);
            }
            Ok(SandboxExpr::Unary(unary.operator, Box::new(lower(&unary.argument)?)))
        }
        Expression::BinaryExpression(bin) => {
            if matches!(bin.operator, BinaryOperator::In | BinaryOperator::Instanceof) {
                return Err(Unsupported);
            }
            Ok(SandboxExpr::Binary(
                bin.operator,
                Box::new(lower(&bin.left)?),
                Box::new(lower(&bin.right)?),
            ))
        }
        Expression::LogicalExpression(logical) => Ok(SandboxExpr::Logical(
            logical.operator,
            Box::new(lower(&logical.left)?),
            Box::new(lower(&logical.right)?),
        )),
        Expression::ConditionalExpression(cond) => Ok(SandboxExpr::Conditional(
            Box::new(lower(&cond.test)?),
            Box::new(lower(&cond.consequent)?),
            Box::new(lower(&cond.alternate)?),
        )),
        Expression::ArrayExpression(arr) => {
            let mut items = Vec::with_capacity(arr.elements.len());
            for elem in &arr.elements {
                match elem {
                    ArrayExpressionElement::SpreadElement(spread) => {
                        items.push(ArrayItem::Spread(lower(&spread.argument)?));
                    }
                    other => match other.as_expression() {
                        Some(e) => items.push(ArrayItem::Item(lower(e)?)),
                        None => return Err(Unsupported),
                    },
                }
            }
            Ok(SandboxExpr::Array(items))
        }
        Expression::ObjectExpression(obj) => {
            let mut entries = Vec::with_capacity(obj.properties.len());
            for prop in &obj.properties {
                match prop {
                    ObjectPropertyKind::ObjectProperty(p) => {
                        if !matches!(p.kind, PropertyKind::Init) || p.method || p.computed {
                            return Err(Unsupported);
                        }
                        let key = p.key.static_name().ok_or(Unsupported)?;
                        entries.push(ObjectEntry::Field(key.to_string(), lower(&p.value)?));
                    }
                    ObjectPropertyKind::SpreadProperty(s) => {
                        entries.push(ObjectEntry::Spread(lower(&s.argument)?));
                    }
                }
            }
            Ok(SandboxExpr::Object(entries))
        }
        Expression::CallExpression(call) => lower_call(call),
        Expression::ArrowFunctionExpression(func) => lower_arrow(func),
        _ => Err(Unsupported),
    }
}

fn lower_static_member(st: &StaticMemberExpression) -> Result<SandboxExpr, Unsupported> {
    Ok(SandboxExpr::Member {
        object: Box::new(lower(&st.object)?),
        property: st.property.name.to_string(),
        optional: st.optional,
    })
}

fn lower_computed_member(comp: &ComputedMemberExpression) -> Result<SandboxExpr, Unsupported> {
    Ok(SandboxExpr::Index {
        object: Box::new(lower(&comp.object)?),
        index: Box::new(lower(&comp.expression)?),
        optional: comp.optional,
    })
}

fn lower_call(call: &CallExpression) -> Result<SandboxExpr, Unsupported> {
    let callee = match &call.callee {
        Expression::Identifier(id) => match id.name.as_str() {
            "String" => Callee::Global("String"),
            "Number" => Callee::Global("Number"),
            "Boolean" => Callee::Global("Boolean"),
            _ => return Err(Unsupported),
        },
        Expression::StaticMemberExpression(st) => {
            let name = st.property.name.as_str();
            match &st.object {
                Expression::Identifier(obj) if obj.name == "Math" => {
                    Callee::Global(match name {
                        "round" => "Math.round",
                        "floor" => "Math.floor",
                        "ceil" => "Math.ceil",
                        "abs" => "Math.abs",
                        "min" => "Math.min",
                        "max" => "Math.max",
                        _ => return Err(Unsupported),
                    })
                }
                Expression::Identifier(obj) if obj.name == "JSON" => match name {
                    "stringify" => Callee::Global("JSON.stringify"),
                    _ => return Err(Unsupported),
                },
                object => {
                    if !ALLOWED_METHODS.contains(name) {
                        return Err(Unsupported);
                    }
                    Callee::Method {
                        receiver: Box::new(lower(object)?),
                        name: name.to_string(),
                        optional: st.optional,
                    }
                }
            }
        }
        _ => return Err(Unsupported),
    };

    let mut args = Vec::with_capacity(call.arguments.len());
    for arg in &call.arguments {
        match arg.as_expression() {
            Some(e) => args.push(lower(e)?),
            None => return Err(Unsupported),
        }
    }
    Ok(SandboxExpr::Call { callee, args })
}

fn lower_arrow(func: &ArrowFunctionExpression) -> Result<SandboxExpr, Unsupported> {
    if func.r#async || func.params.rest.is_some() {
        return Err(Unsupported);
    }
    let mut params = Vec::with_capacity(func.params.items.len());
    for param in &func.params.items {
        match &param.pattern {
            BindingPattern::BindingIdentifier(id) => params.push(id.name.to_string()),
            _ => return Err(Unsupported),
        }
    }

    // expression bodies and `{ return expr; }` only
    let statements = &func.body.statements;
    let body = match (statements.len(), statements.first()) {
        (1, Some(Statement::ExpressionStatement(stmt))) if func.expression => lower(&stmt.expression)?,
        (1, Some(Statement::ReturnStatement(ret))) => match &ret.argument {
            Some(arg) => lower(arg)?,
            None => SandboxExpr::Undefined,
        },
        _ => return Err(Unsupported),
    };
    Ok(SandboxExpr::Lambda(Arc::new(Lambda { params, body })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVALUATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
enum Fault {
    Budget,
    Type(String),
    Reference(String),
}

type Eval = std::result::Result<Option<Value>, Fault>;

enum Arg {
    Value(Option<Value>),
    Lambda(Arc<Lambda>),
}

impl Arg {
    fn value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => v.as_ref(),
            Arg::Lambda(_) => None,
        }
    }
}

struct Frame<'s> {
    scope: &'s Scope<'s>,
    locals: Vec<(String, Option<Value>)>,
    steps: usize,
}

impl<'s> Frame<'s> {
    fn tick(&mut self) -> Result<(), Fault> {
        self.charge(1)
    }

    fn charge(&mut self, steps: usize) -> Result<(), Fault> {
        self.steps = self.steps.saturating_add(steps);
        if self.steps > MAX_STEPS {
            Err(Fault::Budget)
        } else {
            Ok(())
        }
    }

    /// Charge one step per element of a freshly built value and enforce the
    /// size caps on it.
    fn built(&mut self, value: Option<Value>) -> Eval {
        match &value {
            Some(Value::Array(items)) => self.charge(items.len())?,
            Some(Value::Object(map)) => self.charge(map.len())?,
            _ => {}
        }
        bounded(value)
    }

    fn lookup(&self, name: &str) -> Eval {
        if let Some((_, value)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(value.clone());
        }
        match name {
            "state" if self.scope.state.is_some() => return Ok(self.scope.state.cloned()),
            "bindings" if self.scope.bindings.is_some() => return Ok(self.scope.bindings.cloned()),
            _ => {}
        }
        if let Some(value) = self.scope.lookup_root(name) {
            return Ok(Some(value.clone()));
        }
        if name == "data" {
            return Ok(Some(Value::Object(self.scope.to_merged_object())));
        }
        Err(Fault::Reference(name.to_string()))
    }

    fn call_lambda(&mut self, lambda: &Lambda, args: Vec<Option<Value>>) -> Eval {
        let depth = self.locals.len();
        let mut args = args.into_iter();
        for param in &lambda.params {
            self.locals.push((param.clone(), args.next().flatten()));
        }
        let result = self.eval(&lambda.body);
        self.locals.truncate(depth);
        result
    }

    fn eval(&mut self, expr: &SandboxExpr) -> Eval {
        self.tick()?;
        match expr {
            SandboxExpr::Literal(value) => Ok(Some(value.clone())),
            SandboxExpr::Undefined => Ok(None),
            SandboxExpr::Ident(name) => self.lookup(name),
            SandboxExpr::Member {
                object,
                property,
                optional,
            } => {
                let target = self.eval(object)?;
                member(target, property, *optional)
            }
            SandboxExpr::Index {
                object,
                index,
                optional,
            } => {
                let target = self.eval(object)?;
                let key = self.eval(index)?;
                member(target, &display(key.as_ref()), *optional)
            }
            SandboxExpr::Unary(op, argument) => {
                let value = self.eval(argument)?;
                Ok(unary(*op, value))
            }
            SandboxExpr::Binary(op, left, right) => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary(*op, l, r)
            }
            SandboxExpr::Logical(op, left, right) => {
                let l = self.eval(left)?;
                let short_circuit = match op {
                    LogicalOperator::Or => is_truthy(l.as_ref()),
                    LogicalOperator::And => !is_truthy(l.as_ref()),
                    LogicalOperator::Coalesce => !is_nullish(l.as_ref()),
                };
                if short_circuit {
                    Ok(l)
                } else {
                    self.eval(right)
                }
            }
            SandboxExpr::Conditional(test, consequent, alternate) => {
                let t = self.eval(test)?;
                if is_truthy(t.as_ref()) {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            SandboxExpr::Template {
                quasis,
                expressions,
            } => {
                let mut out = String::new();
                for (i, quasi) in quasis.iter().enumerate() {
                    out.push_str(quasi);
                    if let Some(e) = expressions.get(i) {
                        let value = self.eval(e)?;
                        out.push_str(&display(value.as_ref()));
                    }
                    if out.len() > MAX_STRING_LEN {
                        return Err(Fault::Budget);
                    }
                }
                Ok(Some(Value::String(out)))
            }
            SandboxExpr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        ArrayItem::Item(e) => out.push(self.eval(e)?.unwrap_or(Value::Null)),
                        ArrayItem::Spread(e) => match self.eval(e)? {
                            Some(Value::Array(inner)) => {
                                self.charge(inner.len())?;
                                out.extend(inner)
                            }
                            Some(Value::String(s)) => {
                                self.charge(s.len())?;
                                out.extend(s.chars().map(|c| Value::String(c.to_string())))
                            }
                            other => {
                                return Err(Fault::Type(format!(
                                    "{} is not iterable",
                                    type_of(other.as_ref())
                                )))
                            }
                        },
                    }
                }
                bounded(Some(Value::Array(out)))
            }
            SandboxExpr::Object(entries) => {
                let mut out = Map::new();
                for entry in entries {
                    match entry {
                        ObjectEntry::Field(key, e) => {
                            // undefined fields are dropped, as JSON.stringify would
                            if let Some(value) = self.eval(e)? {
                                out.insert(key.clone(), value);
                            }
                        }
                        ObjectEntry::Spread(e) => {
                            if let Some(Value::Object(inner)) = self.eval(e)? {
                                self.charge(inner.len())?;
                                out.extend(inner);
                            }
                        }
                    }
                }
                bounded(Some(Value::Object(out)))
            }
            SandboxExpr::Call { callee, args } => self.call(callee, args),
            SandboxExpr::Lambda(_) => Err(Fault::Type("functions are not values here".into())),
        }
    }

    fn eval_args(&mut self, args: &[SandboxExpr]) -> Result<Vec<Arg>, Fault> {
        args.iter()
            .map(|arg| match arg {
                SandboxExpr::Lambda(lambda) => Ok(Arg::Lambda(lambda.clone())),
                other => self.eval(other).map(Arg::Value),
            })
            .collect()
    }

    fn call(&mut self, callee: &Callee, args: &[SandboxExpr]) -> Eval {
        match callee {
            Callee::Global(name) => {
                let args = self.eval_args(args)?;
                let result = call_global(name, &args)?;
                bounded(result)
            }
            Callee::Method {
                receiver,
                name,
                optional,
            } => {
                let target = self.eval(receiver)?;
                if is_nullish(target.as_ref()) {
                    if *optional {
                        return Ok(None);
                    }
                    return Err(Fault::Type(format!(
                        "cannot read properties of {} (reading '{}')",
                        display(target.as_ref()),
                        name
                    )));
                }
                let args = self.eval_args(args)?;
                let result = match target {
                    Some(Value::Array(items)) => self.call_array_method(items, name, args)?,
                    Some(Value::String(s)) => call_string_method(&s, name, &args)?,
                    Some(Value::Number(n)) => {
                        call_number_method(n.as_f64().unwrap_or(f64::NAN), name, &args)?
                    }
                    other => match name.as_str() {
                        "toString" => Some(Value::String(display(other.as_ref()))),
                        _ => {
                            return Err(Fault::Type(format!(
                                "{} has no method '{}'",
                                type_of(other.as_ref()),
                                name
                            )))
                        }
                    },
                };
                self.built(result)
            }
        }
    }

    fn call_array_method(&mut self, items: Vec<Value>, name: &str, args: Vec<Arg>) -> Eval {
        let callback = |args: &[Arg]| -> Result<Arc<Lambda>, Fault> {
            match args.first() {
                Some(Arg::Lambda(lambda)) => Ok(lambda.clone()),
                _ => Err(Fault::Type(format!("{} expects a callback", name))),
            }
        };

        match name {
            "map" => {
                let f = callback(&args)?;
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let mapped = self.call_lambda(&f, vec![Some(item), Some(Value::from(i))])?;
                    out.push(mapped.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(out)))
            }
            "filter" => {
                let f = callback(&args)?;
                let mut out = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    let keep = self.call_lambda(&f, vec![Some(item.clone()), Some(Value::from(i))])?;
                    if is_truthy(keep.as_ref()) {
                        out.push(item);
                    }
                }
                Ok(Some(Value::Array(out)))
            }
            "find" | "findIndex" | "some" | "every" => {
                let f = callback(&args)?;
                for (i, item) in items.into_iter().enumerate() {
                    let hit = self.call_lambda(&f, vec![Some(item.clone()), Some(Value::from(i))])?;
                    let hit = is_truthy(hit.as_ref());
                    match name {
                        "find" if hit => return Ok(Some(item)),
                        "findIndex" if hit => return Ok(Some(Value::from(i))),
                        "some" if hit => return Ok(Some(Value::Bool(true))),
                        "every" if !hit => return Ok(Some(Value::Bool(false))),
                        _ => {}
                    }
                }
                Ok(match name {
                    "find" => None,
                    "findIndex" => Some(Value::from(-1)),
                    "some" => Some(Value::Bool(false)),
                    _ => Some(Value::Bool(true)),
                })
            }
            "reduce" => {
                let f = callback(&args)?;
                let mut iter = items.into_iter().enumerate();
                let mut acc = match args.get(1) {
                    Some(Arg::Value(init)) => init.clone(),
                    _ => match iter.next() {
                        Some((_, first)) => Some(first),
                        None => {
                            return Err(Fault::Type(
                                "reduce of empty array with no initial value".into(),
                            ))
                        }
                    },
                };
                for (i, item) in iter {
                    acc = self.call_lambda(&f, vec![acc, Some(item), Some(Value::from(i))])?;
                }
                Ok(acc)
            }
            "join" => {
                let sep = match args.first().and_then(Arg::value) {
                    Some(v) => display(Some(v)),
                    None => ",".to_string(),
                };
                let mut out = String::new();
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(&sep);
                    }
                    if !is_nullish(Some(v)) {
                        out.push_str(&display(Some(v)));
                    }
                    if out.len() > MAX_STRING_LEN {
                        return Err(Fault::Budget);
                    }
                }
                Ok(Some(Value::String(out)))
            }
            "includes" => {
                let needle = args.first().and_then(Arg::value);
                Ok(Some(Value::Bool(
                    items.iter().any(|v| strict_equals(Some(v), needle)),
                )))
            }
            "indexOf" => {
                let needle = args.first().and_then(Arg::value);
                let pos = items.iter().position(|v| strict_equals(Some(v), needle));
                Ok(Some(pos.map(Value::from).unwrap_or_else(|| Value::from(-1))))
            }
            "slice" => {
                let (start, end) = slice_bounds(&args, items.len());
                Ok(Some(Value::Array(items[start..end].to_vec())))
            }
            "concat" => {
                let mut out = items;
                for arg in &args {
                    match arg.value() {
                        Some(Value::Array(more)) => {
                            if out.len().saturating_add(more.len()) > MAX_ARRAY_LEN {
                                return Err(Fault::Budget);
                            }
                            out.extend(more.iter().cloned())
                        }
                        Some(other) => out.push(other.clone()),
                        None => out.push(Value::Null),
                    }
                }
                Ok(Some(Value::Array(out)))
            }
            "reverse" => {
                let mut out = items;
                out.reverse();
                Ok(Some(Value::Array(out)))
            }
            "toString" => Ok(Some(Value::String(display(Some(&Value::Array(items)))))),
            _ => Err(Fault::Type(format!("array has no method '{}'", name))),
        }
    }
}

/// Approximate heap size of `value`; counting stops once `limit` is passed.
fn footprint(value: &Value, limit: usize) -> usize {
    let mut total = 0;
    let mut pending = vec![value];
    while let Some(value) = pending.pop() {
        total += NODE_COST;
        match value {
            Value::String(s) => total += s.len(),
            Value::Array(items) => pending.extend(items),
            Value::Object(map) => {
                for (key, value) in map {
                    total += key.len();
                    pending.push(value);
                }
            }
            _ => {}
        }
        if total > limit {
            break;
        }
    }
    total
}

fn bounded(value: Option<Value>) -> Eval {
    let over = match &value {
        Some(Value::String(s)) => s.len() > MAX_STRING_LEN,
        Some(Value::Array(items)) if items.len() > MAX_ARRAY_LEN => true,
        Some(v @ (Value::Array(_) | Value::Object(_))) => {
            footprint(v, MAX_VALUE_BYTES) > MAX_VALUE_BYTES
        }
        _ => false,
    };
    if over {
        Err(Fault::Budget)
    } else {
        Ok(value)
    }
}

fn member(target: Option<Value>, property: &str, optional: bool) -> Eval {
    match target {
        None | Some(Value::Null) => {
            if optional {
                Ok(None)
            } else {
                Err(Fault::Type(format!(
                    "cannot read properties of {} (reading '{}')",
                    display(target.as_ref()),
                    property
                )))
            }
        }
        Some(value) => Ok(step(&value, property)),
    }
}

fn unary(op: UnaryOperator, value: Option<Value>) -> Option<Value> {
    match op {
        UnaryOperator::LogicalNot => Some(Value::Bool(!is_truthy(value.as_ref()))),
        UnaryOperator::UnaryNegation => Some(number_value(-to_number(value.as_ref()))),
        UnaryOperator::UnaryPlus => Some(number_value(to_number(value.as_ref()))),
        UnaryOperator::BitwiseNot => Some(Value::from(!to_int32(value.as_ref()))),
        UnaryOperator::Typeof => Some(Value::String(type_of(value.as_ref()).to_string())),
        UnaryOperator::Void | UnaryOperator::Delete => None,
    }
}

fn to_int32(value: Option<&Value>) -> i32 {
    let n = to_number(value);
    if n.is_finite() {
        n.trunc() as i64 as i32
    } else {
        0
    }
}

fn is_stringish(value: Option<&Value>) -> bool {
    matches!(
        value,
        Some(Value::String(_)) | Some(Value::Array(_)) | Some(Value::Object(_))
    )
}

fn binary(op: BinaryOperator, left: Option<Value>, right: Option<Value>) -> Eval {
    let (l, r) = (left.as_ref(), right.as_ref());
    let result = match op {
        BinaryOperator::StrictEquality => Value::Bool(strict_equals(l, r)),
        BinaryOperator::StrictInequality => Value::Bool(!strict_equals(l, r)),
        BinaryOperator::Equality => Value::Bool(loose_equals(l, r)),
        BinaryOperator::Inequality => Value::Bool(!loose_equals(l, r)),
        BinaryOperator::LessThan => Value::Bool(compare(l, r).is_some_and(|o| o.is_lt())),
        BinaryOperator::LessEqualThan => Value::Bool(compare(l, r).is_some_and(|o| o.is_le())),
        BinaryOperator::GreaterThan => Value::Bool(compare(l, r).is_some_and(|o| o.is_gt())),
        BinaryOperator::GreaterEqualThan => Value::Bool(compare(l, r).is_some_and(|o| o.is_ge())),
        BinaryOperator::Addition => {
            if is_stringish(l) || is_stringish(r) {
                let joined = format!("{}{}", display(l), display(r));
                if joined.len() > MAX_STRING_LEN {
                    return Err(Fault::Budget);
                }
                Value::String(joined)
            } else {
                number_value(to_number(l) + to_number(r))
            }
        }
        BinaryOperator::Subtraction => number_value(to_number(l) - to_number(r)),
        BinaryOperator::Multiplication => number_value(to_number(l) * to_number(r)),
        BinaryOperator::Division => number_value(to_number(l) / to_number(r)),
        BinaryOperator::Remainder => number_value(to_number(l) % to_number(r)),
        BinaryOperator::Exponential => number_value(to_number(l).powf(to_number(r))),
        BinaryOperator::BitwiseAnd => Value::from(to_int32(l) & to_int32(r)),
        BinaryOperator::BitwiseOR => Value::from(to_int32(l) | to_int32(r)),
        BinaryOperator::BitwiseXOR => Value::from(to_int32(l) ^ to_int32(r)),
        BinaryOperator::ShiftLeft => Value::from(to_int32(l).wrapping_shl(to_int32(r) as u32 & 31)),
        BinaryOperator::ShiftRight => Value::from(to_int32(l).wrapping_shr(to_int32(r) as u32 & 31)),
        BinaryOperator::ShiftRightZeroFill => {
            Value::from((to_int32(l) as u32).wrapping_shr(to_int32(r) as u32 & 31))
        }
        BinaryOperator::In | BinaryOperator::Instanceof => {
            return Err(Fault::Type("operator is not available".into()))
        }
    };
    Ok(Some(result))
}

fn number_arg(args: &[Arg], i: usize) -> Option<f64> {
    args.get(i).and_then(Arg::value).map(|v| to_number(Some(v)))
}

/// JS `slice(start, end)` index normalization.
fn slice_bounds(args: &[Arg], len: usize) -> (usize, usize) {
    let norm = |n: f64| -> usize {
        if n.is_nan() {
            0
        } else if n < 0.0 {
            (len as f64 + n.trunc()).max(0.0) as usize
        } else {
            (n.trunc() as usize).min(len)
        }
    };
    let start = number_arg(args, 0).map(norm).unwrap_or(0);
    let end = number_arg(args, 1).map(norm).unwrap_or(len);
    (start, end.max(start))
}

fn call_global(name: &str, args: &[Arg]) -> Eval {
    let first = args.first().and_then(Arg::value);
    let numbers = || args.iter().map(|a| to_number(a.value())).collect::<Vec<f64>>();

    let result = match name {
        "String" => Value::String(match args.first() {
            Some(arg) => display(arg.value()),
            None => String::new(),
        }),
        "Number" => number_value(match args.first() {
            Some(arg) => to_number(arg.value()),
            None => 0.0,
        }),
        "Boolean" => Value::Bool(is_truthy(first)),
        "Math.round" => number_value((to_number(first) + 0.5).floor()),
        "Math.floor" => number_value(to_number(first).floor()),
        "Math.ceil" => number_value(to_number(first).ceil()),
        "Math.abs" => number_value(to_number(first).abs()),
        "Math.min" => number_value(numbers().into_iter().fold(f64::INFINITY, |acc, n| {
            if n.is_nan() || acc.is_nan() {
                f64::NAN
            } else {
                acc.min(n)
            }
        })),
        "Math.max" => number_value(numbers().into_iter().fold(f64::NEG_INFINITY, |acc, n| {
            if n.is_nan() || acc.is_nan() {
                f64::NAN
            } else {
                acc.max(n)
            }
        })),
        "JSON.stringify" => match first {
            None => return Ok(None),
            Some(value) => Value::String(
                serde_json::to_string(value).map_err(|e| Fault::Type(e.to_string()))?,
            ),
        },
        other => return Err(Fault::Reference(other.to_string())),
    };
    Ok(Some(result))
}

fn call_string_method(s: &str, name: &str, args: &[Arg]) -> Eval {
    let text_arg = |i: usize| args.get(i).and_then(Arg::value).map(|v| display(Some(v)));
    let chars: Vec<char> = s.chars().collect();

    let result = match name {
        "toUpperCase" => Value::String(s.to_uppercase()),
        "toLowerCase" => Value::String(s.to_lowercase()),
        "trim" => Value::String(s.trim().to_string()),
        "trimStart" => Value::String(s.trim_start().to_string()),
        "trimEnd" => Value::String(s.trim_end().to_string()),
        "toString" => Value::String(s.to_string()),
        "includes" => Value::Bool(s.contains(text_arg(0).unwrap_or_default().as_str())),
        "startsWith" => Value::Bool(s.starts_with(text_arg(0).unwrap_or_default().as_str())),
        "endsWith" => Value::Bool(s.ends_with(text_arg(0).unwrap_or_default().as_str())),
        "indexOf" => {
            let needle = text_arg(0).unwrap_or_default();
            match s.find(needle.as_str()) {
                Some(byte_idx) => Value::from(s[..byte_idx].chars().count()),
                None => Value::from(-1),
            }
        }
        "charAt" => {
            let i = number_arg(args, 0).unwrap_or(0.0);
            let c = if i >= 0.0 { utf16_unit_at(s, i as usize) } else { None };
            Value::String(c.unwrap_or_default())
        }
        "slice" => {
            let (start, end) = slice_bounds(args, chars.len());
            Value::String(chars[start..end].iter().collect())
        }
        "substring" => {
            let clamp = |n: f64| -> usize {
                if n.is_nan() || n < 0.0 {
                    0
                } else {
                    (n as usize).min(chars.len())
                }
            };
            let a = number_arg(args, 0).map(clamp).unwrap_or(0);
            let b = number_arg(args, 1).map(clamp).unwrap_or(chars.len());
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            Value::String(chars[start..end].iter().collect())
        }
        "split" => match text_arg(0) {
            None => Value::Array(vec![Value::String(s.to_string())]),
            Some(sep) if sep.is_empty() => Value::Array(
                chars.iter().map(|c| Value::String(c.to_string())).collect(),
            ),
            Some(sep) => Value::Array(
                s.split(sep.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ),
        },
        "replace" | "replaceAll" => {
            let pattern = text_arg(0).unwrap_or_else(|| "undefined".to_string());
            let replacement = text_arg(1).unwrap_or_else(|| "undefined".to_string());
            let hits = match name {
                "replace" => usize::from(s.contains(pattern.as_str())),
                _ => s.matches(pattern.as_str()).count(),
            };
            if s.len().saturating_add(hits.saturating_mul(replacement.len())) > MAX_STRING_LEN {
                return Err(Fault::Budget);
            }
            if name == "replace" {
                Value::String(s.replacen(pattern.as_str(), &replacement, 1))
            } else {
                Value::String(s.replace(pattern.as_str(), &replacement))
            }
        }
        "padStart" | "padEnd" => {
            let target = number_arg(args, 0).unwrap_or(0.0).max(0.0) as usize;
            if target > MAX_STRING_LEN {
                return Err(Fault::Budget);
            }
            let fill = text_arg(1).unwrap_or_else(|| " ".to_string());
            if target <= chars.len() || fill.is_empty() {
                Value::String(s.to_string())
            } else {
                let pad: String = fill.chars().cycle().take(target - chars.len()).collect();
                if name == "padStart" {
                    Value::String(format!("{}{}", pad, s))
                } else {
                    Value::String(format!("{}{}", s, pad))
                }
            }
        }
        "repeat" => {
            let count = number_arg(args, 0).unwrap_or(0.0);
            if count < 0.0 || !count.is_finite() {
                return Err(Fault::Type("invalid repeat count".into()));
            }
            if s.len().saturating_mul(count as usize) > MAX_STRING_LEN {
                return Err(Fault::Budget);
            }
            Value::String(s.repeat(count as usize))
        }
        "concat" => {
            let mut out = s.to_string();
            for arg in args {
                out.push_str(&display(arg.value()));
                if out.len() > MAX_STRING_LEN {
                    return Err(Fault::Budget);
                }
            }
            Value::String(out)
        }
        _ => return Err(Fault::Type(format!("string has no method '{}'", name))),
    };
    Ok(Some(result))
}

fn call_number_method(n: f64, name: &str, args: &[Arg]) -> Eval {
    match name {
        "toFixed" => {
            let digits = number_arg(args, 0).unwrap_or(0.0).clamp(0.0, 100.0) as usize;
            Ok(Some(Value::String(format!("{:.*}", digits, n))))
        }
        "toString" => Ok(Some(Value::String(display(Some(&number_value(n)))))),
        _ => Err(Fault::Type(format!("number has no method '{}'", name))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════════

/// Compiled transforms keyed by source text. Failed compilations are cached
/// too so a bad transform is parsed once per cache.
#[derive(Debug, Default)]
pub struct SandboxCache {
    programs: RwLock<HashMap<String, Result<Arc<Program>, Unsupported>>>,
}

impl SandboxCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.programs.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn program(&self, source: &str) -> Result<Arc<Program>, Unsupported> {
        if let Ok(programs) = self.programs.read() {
            if let Some(cached) = programs.get(source) {
                return cached.clone();
            }
        }
        let compiled = compile(source).map(Arc::new);
        if let Ok(mut programs) = self.programs.write() {
            programs.insert(source.to_string(), compiled.clone());
        }
        compiled
    }

    /// Evaluate `source` against `scope`. Arrow functions are called with
    /// `args`; plain expressions ignore them.
    pub fn evaluate(
        &self,
        source: &str,
        scope: &Scope,
        args: Vec<Option<Value>>,
    ) -> Result<Option<Value>, Unsupported> {
        let program = self.program(source)?;

        for name in program.free_identifiers() {
            let known = scope.has_root(name)
                || name == "data"
                || (name == "state" && scope.state.is_some())
                || (name == "bindings" && scope.bindings.is_some());
            if !known {
                tracing::debug!(source, identifier = %name, "transform references an unknown identifier");
                return Err(Unsupported);
            }
        }

        let mut frame = Frame {
            scope,
            locals: Vec::new(),
            steps: 0,
        };
        let result = match &program.root {
            SandboxExpr::Lambda(lambda) => frame.call_lambda(lambda, args),
            body => frame.eval(body),
        };
        result.map_err(|fault| {
            tracing::debug!(source, ?fault, steps = frame.steps, "transform evaluation failed");
            Unsupported
        })
    }
}
