//! Layered render scopes.
//!
//! ## Scope Invariants
//!
//! 1. **Three layers**: `data` (caller supplied), `context` (loop and branch
//!    variables accumulated during descent) and `state` (caller owned,
//!    read-only here). A fourth optional `bindings` layer backs the
//!    `bindings.` prefix.
//! 2. **Context wins**: a key present in both `context` and `data` resolves
//!    to the context value, since it is the more local scope.
//! 3. **Append-only context**: `RenderContext::with` returns an extended
//!    copy. Sibling subtrees never observe each other's variables.

use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderContext {
    vars: Arc<Map<String, Value>>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(vars: Map<String, Value>) -> Self {
        Self {
            vars: Arc::new(vars),
        }
    }

    /// A new context with `name` bound to `value`; `self` is untouched.
    pub fn with(&self, name: &str, value: Value) -> Self {
        let mut vars = (*self.vars).clone();
        vars.insert(name.to_string(), value);
        Self {
            vars: Arc::new(vars),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }
}

/// Borrowed view over every scope layer, handed to the evaluators.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub data: &'a Value,
    pub context: &'a RenderContext,
    pub state: Option<&'a Value>,
    pub bindings: Option<&'a Value>,
}

impl<'a> Scope<'a> {
    pub fn new(data: &'a Value, context: &'a RenderContext) -> Self {
        Self {
            data,
            context,
            state: None,
            bindings: None,
        }
    }

    pub fn with_state(mut self, state: Option<&'a Value>) -> Self {
        self.state = state;
        self
    }

    pub fn with_bindings(mut self, bindings: Option<&'a Value>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Same layers, different context.
    pub fn rebind<'b>(&self, context: &'b RenderContext) -> Scope<'b>
    where
        'a: 'b,
    {
        Scope {
            data: self.data,
            context,
            state: self.state,
            bindings: self.bindings,
        }
    }

    /// Top-level lookup in `data ∪ context`, context first.
    pub fn lookup_root(&self, key: &str) -> Option<&'a Value> {
        if let Some(value) = self.context.get(key) {
            return Some(value);
        }
        self.data.as_object().and_then(|obj| obj.get(key))
    }

    pub fn has_root(&self, key: &str) -> bool {
        self.lookup_root(key).is_some()
    }

    /// Sorted top-level keys of `data ∪ context`.
    pub fn available_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.context.vars().keys().cloned().collect();
        if let Some(obj) = self.data.as_object() {
            for key in obj.keys() {
                if !self.context.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys.sort();
        keys
    }

    /// `data ∪ context` as one object, context winning collisions.
    pub fn to_merged_object(&self) -> Map<String, Value> {
        let mut merged = self.data.as_object().cloned().unwrap_or_default();
        for (key, value) in self.context.vars() {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}
