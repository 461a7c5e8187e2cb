//! Conditional branches and loop expansion.
//!
//! ## Control Flow Invariants
//!
//! 1. **Branch exclusivity**: a node with a `conditional` renders exactly one
//!    of `then`, `else` or nothing. It never falls back to its own `type`.
//! 2. **Absent vs. explicit nothing**: a missing branch key and an explicit
//!    `null` (or empty list) both render nothing, but are reported apart so
//!    tooling can tell an authoring gap from an intentional blank.
//! 3. **Slot-preserving loops**: an item failing the per-item gate keeps its
//!    index and key. Later items are never renumbered.
//! 4. **Order**: loop items come out in source-array order.

use serde_json::Value;
use std::collections::HashSet;

use crate::binding::{get_path, resolve_binding};
use crate::diagnostics::DiagnosticKind;
use crate::expression::{evaluate_condition, EvalEnv};
use crate::schema::{Branch, Loop, UIComponent};
use crate::scope::{RenderContext, Scope};
use crate::value::{display_text, is_nullish, type_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    /// The active branch key was not declared.
    BranchAbsent,
    /// The active branch was declared as `null` or `[]`.
    ExplicitNothing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConditionalOutcome<'n> {
    /// No conditional on this node.
    Unconditional,
    Empty(EmptyReason),
    Branch(&'n Branch),
}

pub fn evaluate_conditional<'n>(
    node: &'n UIComponent,
    scope: &Scope,
    env: &EvalEnv,
) -> ConditionalOutcome<'n> {
    let Some(conditional) = &node.conditional else {
        return ConditionalOutcome::Unconditional;
    };

    let passed = evaluate_condition(&conditional.condition, scope, env);
    let branch = if passed {
        &conditional.then
    } else {
        &conditional.otherwise
    };

    match branch {
        None => ConditionalOutcome::Empty(EmptyReason::BranchAbsent),
        Some(None) => ConditionalOutcome::Empty(EmptyReason::ExplicitNothing),
        Some(Some(Branch::Nodes(nodes))) if nodes.is_empty() => {
            ConditionalOutcome::Empty(EmptyReason::ExplicitNothing)
        }
        Some(Some(branch)) => ConditionalOutcome::Branch(branch),
    }
}

/// One expanded loop slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopItem {
    pub index: usize,
    pub key: String,
    /// Parent context extended with the item and index variables.
    pub context: RenderContext,
    /// Result of the per-item gate; `false` slots render nothing.
    pub included: bool,
}

pub fn expand_loop(repeat: &Loop, scope: &Scope, env: &EvalEnv) -> Vec<LoopItem> {
    let source = resolve_binding(&repeat.source, scope, env);
    let items = match source {
        Some(Value::Array(items)) => items,
        other => {
            env.diagnostics.warn_once(
                DiagnosticKind::LoopSourceNotArray,
                &repeat.source.describe(),
                format!(
                    "loop source resolved to {}; expanding to nothing",
                    if other.is_none() {
                        "undefined"
                    } else {
                        type_of(other.as_ref())
                    }
                ),
            );
            return Vec::new();
        }
    };

    let mut seen_keys: HashSet<String> = HashSet::with_capacity(items.len());
    let mut expanded = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let mut key = item_key(repeat, &item, index);
        if !seen_keys.insert(key.clone()) {
            key = format!("{}-{}", key, index);
            seen_keys.insert(key.clone());
        }

        let mut context = scope.context.with(&repeat.item_var, item);
        if let Some(index_var) = repeat.index_var.as_deref().filter(|v| !v.is_empty()) {
            context = context.with(index_var, Value::from(index));
        }

        let included = match repeat.condition.as_deref() {
            Some(condition) => evaluate_condition(condition, &scope.rebind(&context), env),
            None => true,
        };

        expanded.push(LoopItem {
            index,
            key,
            context,
            included,
        });
    }

    tracing::trace!(
        source = %repeat.source.describe(),
        items = expanded.len(),
        "expanded loop"
    );
    expanded
}

fn item_key(repeat: &Loop, item: &Value, index: usize) -> String {
    repeat
        .key
        .as_deref()
        .filter(|k| !k.is_empty())
        .and_then(|path| get_path(item, path))
        .filter(|v| !is_nullish(Some(v)))
        .map(|v| display_text(Some(&v)))
        .unwrap_or_else(|| index.to_string())
}
