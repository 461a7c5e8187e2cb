//! Restricted expression evaluator.
//!
//! The grammar is deliberately small: identifier/member paths (relative to
//! an implicit `data` root), literals, `.length`, `!`, a single comparison
//! against a literal or path, `== null` checks, and `left || fallback`
//! chains. Anything else is *unsupported*, which callers treat fail-open:
//! conditions become `true`, bindings keep their fallback.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::binding::lookup_path;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::sandbox::SandboxCache;
use crate::scope::Scope;
use crate::value::{compare, is_truthy, loose_equals, number_value, strict_equals};

lazy_static! {
    static ref PATH_RE: Regex = Regex::new(
        r#"^[A-Za-z_$][\w$]*(?:\s*\.\s*[A-Za-z_$][\w$]*|\.\d+|\[\s*\d+\s*\]|\[\s*(?:'[^']*'|"[^"]*")\s*\])*$"#
    )
    .unwrap();
    static ref NUMBER_RE: Regex = Regex::new(r"^-?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?$").unwrap();
}

/// Marker for input outside the supported grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsupported;

/// Shared evaluation services for one render pass.
#[derive(Clone, Copy)]
pub struct EvalEnv<'e> {
    pub diagnostics: &'e Diagnostics,
    pub sandbox: &'e SandboxCache,
    pub dev_mode: bool,
}

impl<'e> EvalEnv<'e> {
    pub fn new(diagnostics: &'e Diagnostics, sandbox: &'e SandboxCache) -> Self {
        Self {
            diagnostics,
            sandbox,
            dev_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GRAMMAR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    StrictEq,
    StrictNotEq,
    LooseEq,
    LooseNotEq,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Longest operators first so `===` is not read as `==`.
const COMPARE_OPS: &[(&str, CompareOp)] = &[
    ("===", CompareOp::StrictEq),
    ("!==", CompareOp::StrictNotEq),
    ("==", CompareOp::LooseEq),
    ("!=", CompareOp::LooseNotEq),
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

#[derive(Debug, Clone, PartialEq)]
enum Restricted {
    Literal(Option<Value>),
    Path(String),
    Not(Box<Restricted>),
    Compare(Box<Restricted>, CompareOp, Box<Restricted>),
    Fallback(Box<Restricted>, Box<Restricted>),
}

fn parse(expr: &str) -> Result<Restricted, Unsupported> {
    let expr = strip_parens(expr.trim());
    if expr.is_empty() {
        return Err(Unsupported);
    }

    if let Some(idx) = find_top_level(expr, "||") {
        let left = parse_operand(&expr[..idx])?;
        let right = parse_fallback_rhs(&expr[idx + 2..])?;
        return Ok(Restricted::Fallback(Box::new(left), Box::new(right)));
    }

    if let Some((idx, op_text, op)) = find_comparison(expr) {
        let left = parse_operand(&expr[..idx])?;
        let right = parse_operand(&expr[idx + op_text.len()..])?;
        return Ok(Restricted::Compare(Box::new(left), op, Box::new(right)));
    }

    parse_operand(expr)
}

/// Right side of `||`: a literal, a path, or another fallback.
fn parse_fallback_rhs(expr: &str) -> Result<Restricted, Unsupported> {
    let trimmed = expr.trim();
    if let Some(idx) = find_top_level(trimmed, "||") {
        let left = parse_operand(&trimmed[..idx])?;
        let right = parse_fallback_rhs(&trimmed[idx + 2..])?;
        return Ok(Restricted::Fallback(Box::new(left), Box::new(right)));
    }
    match parse_operand(trimmed)? {
        node @ (Restricted::Literal(_) | Restricted::Path(_)) => Ok(node),
        _ => Err(Unsupported),
    }
}

fn parse_operand(expr: &str) -> Result<Restricted, Unsupported> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(Unsupported);
    }
    if let Some(rest) = expr.strip_prefix('!') {
        let rest = rest.trim();
        let inner = if is_wrapped_in_parens(rest) {
            parse(rest)?
        } else {
            parse_operand(rest)?
        };
        return Ok(Restricted::Not(Box::new(inner)));
    }
    if is_wrapped_in_parens(expr) {
        return parse(expr);
    }
    if let Some(literal) = parse_literal(expr) {
        return Ok(Restricted::Literal(literal));
    }
    if PATH_RE.is_match(expr) {
        return Ok(Restricted::Path(expr.chars().filter(|c| !c.is_whitespace()).collect()));
    }
    Err(Unsupported)
}

/// `Some(None)` is the `undefined` literal.
fn parse_literal(expr: &str) -> Option<Option<Value>> {
    match expr {
        "true" => return Some(Some(Value::Bool(true))),
        "false" => return Some(Some(Value::Bool(false))),
        "null" => return Some(Some(Value::Null)),
        "undefined" => return Some(None),
        _ => {}
    }
    if let Some(text) = parse_string_literal(expr) {
        return Some(Some(Value::String(text)));
    }
    if NUMBER_RE.is_match(expr) {
        return expr.parse::<f64>().ok().map(|n| Some(number_value(n)));
    }
    None
}

/// Quoted string with no unescaped inner quote of the same kind.
pub(crate) fn parse_string_literal(expr: &str) -> Option<String> {
    let quote = expr.chars().next()?;
    if !(quote == '"' || quote == '\'') || expr.len() < 2 || !expr.ends_with(quote) {
        return None;
    }
    let inner = &expr[1..expr.len() - 1];
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return None;
        }
    }
    Some(unescape_string(inner))
}

fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some(other) => result.push(other),
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }

    result
}

fn is_wrapped_in_parens(expr: &str) -> bool {
    if !(expr.starts_with('(') && expr.ends_with(')')) {
        return false;
    }
    // the opening paren must close at the very end
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in expr.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && i != expr.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn strip_parens(mut expr: &str) -> &str {
    while is_wrapped_in_parens(expr) {
        expr = expr[1..expr.len() - 1].trim();
    }
    expr
}

/// Byte offset of `needle` outside quotes and brackets.
fn find_top_level(expr: &str, needle: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            _ if depth == 0 && bytes[i..].starts_with(needle.as_bytes()) => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn find_comparison(expr: &str) -> Option<(usize, &'static str, CompareOp)> {
    let mut best: Option<(usize, &'static str, CompareOp)> = None;
    for (text, op) in COMPARE_OPS {
        if let Some(idx) = find_top_level(expr, text) {
            let better = match best {
                None => true,
                Some((b_idx, b_text, _)) => idx < b_idx || (idx == b_idx && text.len() > b_text.len()),
            };
            if better {
                best = Some((idx, text, *op));
            }
        }
    }
    best
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVALUATION
// ═══════════════════════════════════════════════════════════════════════════════

fn eval(node: &Restricted, scope: &Scope) -> Option<Value> {
    match node {
        Restricted::Literal(value) => value.clone(),
        Restricted::Path(path) => lookup_path(path, scope),
        Restricted::Not(inner) => Some(Value::Bool(!is_truthy(eval(inner, scope).as_ref()))),
        Restricted::Compare(left, op, right) => {
            let l = eval(left, scope);
            let r = eval(right, scope);
            let (l, r) = (l.as_ref(), r.as_ref());
            let result = match op {
                CompareOp::StrictEq => strict_equals(l, r),
                CompareOp::StrictNotEq => !strict_equals(l, r),
                CompareOp::LooseEq => loose_equals(l, r),
                CompareOp::LooseNotEq => !loose_equals(l, r),
                CompareOp::Gt => compare(l, r).is_some_and(|o| o.is_gt()),
                CompareOp::Ge => compare(l, r).is_some_and(|o| o.is_ge()),
                CompareOp::Lt => compare(l, r).is_some_and(|o| o.is_lt()),
                CompareOp::Le => compare(l, r).is_some_and(|o| o.is_le()),
            };
            Some(Value::Bool(result))
        }
        Restricted::Fallback(left, right) => {
            let value = eval(left, scope);
            if is_truthy(value.as_ref()) {
                value
            } else {
                eval(right, scope)
            }
        }
    }
}

/// Evaluate without logging; `Err` means the grammar does not cover `expr`.
pub fn evaluate(expr: &str, scope: &Scope) -> Result<Option<Value>, Unsupported> {
    let node = parse(expr)?;
    Ok(eval(&node, scope))
}

pub fn is_supported(expr: &str) -> bool {
    parse(expr).is_ok()
}

/// Conditions fail open: unsupported input renders as if `true`.
pub fn evaluate_condition(expr: &str, scope: &Scope, env: &EvalEnv) -> bool {
    match evaluate(expr, scope) {
        Ok(value) => is_truthy(value.as_ref()),
        Err(Unsupported) => {
            env.diagnostics.warn_once(
                DiagnosticKind::UnsupportedExpression,
                expr,
                "condition is outside the supported grammar; treating it as true",
            );
            true
        }
    }
}

pub fn evaluate_or(expr: &str, scope: &Scope, fallback: Value, env: &EvalEnv) -> Value {
    match evaluate(expr, scope) {
        Ok(Some(value)) => value,
        Ok(None) => fallback,
        Err(Unsupported) => {
            env.diagnostics.warn_once(
                DiagnosticKind::UnsupportedExpression,
                expr,
                "expression is outside the supported grammar; using the fallback value",
            );
            fallback
        }
    }
}

/// Unsupported expressions are logged and read as undefined.
pub fn evaluate_or_undefined(expr: &str, scope: &Scope, env: &EvalEnv) -> Option<Value> {
    match evaluate(expr, scope) {
        Ok(value) => value,
        Err(Unsupported) => {
            env.diagnostics.warn_once(
                DiagnosticKind::UnsupportedExpression,
                expr,
                "expression is outside the supported grammar; reading it as undefined",
            );
            None
        }
    }
}
