//! Binding resolution.
//!
//! Resolution is total: a missing key, a `null` intermediate or an index out
//! of range all produce `None` (undefined) rather than an error.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::diagnostics::DiagnosticKind;
use crate::expression::{self, EvalEnv};
use crate::sandbox;
use crate::schema::{Binding, SourceType, StructuredBinding};
use crate::scope::Scope;
use crate::value::{display_text, length_of, number_value};

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{\{\s*(.+?)\s*\}\}").unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// PATH WALKING
// ═══════════════════════════════════════════════════════════════════════════════

/// Split `a.b[0]["c d"]` into `["a", "b", "0", "c d"]`.
pub fn path_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = path.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut j = i + 1;
                let quote = chars.get(j).copied().filter(|c| *c == '"' || *c == '\'');
                if quote.is_some() {
                    j += 1;
                }
                let mut inner = String::new();
                while j < chars.len() {
                    let c = chars[j];
                    if let Some(q) = quote {
                        if c == q {
                            j += 1;
                            break;
                        }
                    } else if c == ']' {
                        break;
                    }
                    inner.push(c);
                    j += 1;
                }
                // skip to the closing bracket
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                segments.push(inner.trim().to_string());
                i = j;
            }
            c => current.push(c),
        }
        i += 1;
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// One property access step.
pub fn step(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::Object(obj) => obj.get(segment).cloned(),
        Value::Array(items) => {
            if segment == "length" {
                return Some(Value::from(items.len()));
            }
            segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
        }
        Value::String(s) => {
            if segment == "length" {
                return length_of(value).map(|n| number_value(n as f64));
            }
            segment
                .parse::<usize>()
                .ok()
                .and_then(|i| utf16_unit_at(s, i))
                .map(Value::String)
        }
        _ => None,
    }
}

/// Index a string the way `length` counts it, by UTF-16 code unit. Half of a
/// surrogate pair cannot live in a `String` and comes back as U+FFFD.
pub(crate) fn utf16_unit_at(s: &str, index: usize) -> Option<String> {
    let unit = s.encode_utf16().nth(index)?;
    Some(
        char::decode_utf16([unit])
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect(),
    )
}

pub fn get_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root.clone();
    for segment in path_segments(path) {
        current = step(&current, &segment)?;
    }
    Some(current)
}

/// Split off the first path segment: `a.b.c` → (`a`, `b.c`), `a[0]` → (`a`, `[0]`).
fn split_head(path: &str) -> (&str, &str) {
    match path.find(['.', '[']) {
        Some(idx) => {
            let rest = &path[idx..];
            (&path[..idx], rest.strip_prefix('.').unwrap_or(rest))
        }
        None => (path, ""),
    }
}

fn walk(root: &Value, rest: &str) -> Option<Value> {
    if rest.is_empty() {
        Some(root.clone())
    } else {
        get_path(root, rest)
    }
}

/// Resolve a dotted path against the scope layers.
///
/// `state.` and `bindings.` select their layers when supplied; a leading
/// `data.` refers to the implicit data root unless a `data` key shadows it.
pub fn lookup_path(path: &str, scope: &Scope) -> Option<Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let (head, rest) = split_head(path);

    match head {
        "state" if scope.state.is_some() => scope.state.and_then(|state| walk(state, rest)),
        "bindings" if scope.bindings.is_some() => {
            scope.bindings.and_then(|bindings| walk(bindings, rest))
        }
        "data" if !scope.has_root("data") => {
            if rest.is_empty() {
                Some(Value::Object(scope.to_merged_object()))
            } else {
                lookup_path(rest, scope)
            }
        }
        _ => scope.lookup_root(head).and_then(|root| walk(root, rest)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINDING RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

pub fn resolve_binding(binding: &Binding, scope: &Scope, env: &EvalEnv) -> Option<Value> {
    let resolved = match binding {
        Binding::Path(path) => lookup_path(path, scope),
        Binding::Structured(structured) => resolve_structured(structured, scope, env),
    };

    if resolved.is_none() && env.dev_mode {
        env.diagnostics.record(
            DiagnosticKind::UndefinedBinding,
            &binding.describe(),
            format!(
                "binding resolved to undefined; available keys: [{}]",
                scope.available_keys().join(", ")
            ),
        );
    }
    resolved
}

fn resolve_structured(binding: &StructuredBinding, scope: &Scope, env: &EvalEnv) -> Option<Value> {
    let source = binding.source.as_deref().filter(|s| !s.is_empty());
    let base = match binding.source_type.unwrap_or(SourceType::Data) {
        SourceType::Data => match source {
            Some(source) => lookup_path(source, scope),
            None => Some(Value::Object(scope.to_merged_object())),
        },
        SourceType::State => scope
            .state
            .and_then(|state| walk(state, source.unwrap_or(""))),
        SourceType::Bindings => scope
            .bindings
            .and_then(|bindings| walk(bindings, source.unwrap_or(""))),
    };

    let value = match binding.path.as_deref().filter(|p| !p.is_empty()) {
        Some(path) => base.and_then(|b| get_path(&b, path)),
        None => base,
    };

    match binding.transform.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(transform) => apply_transform(transform, value, scope, env),
        None => value,
    }
}

/// Apply a transform expression to `value`.
///
/// Arrow functions go to the sandbox with `(value, scope)` as arguments.
/// Anything else is tried against the restricted grammar with `value` bound
/// in context, then against the sandbox. An unsupported transform leaves
/// the value untouched.
pub fn apply_transform(
    transform: &str,
    value: Option<Value>,
    scope: &Scope,
    env: &EvalEnv,
) -> Option<Value> {
    let result = if sandbox::is_arrow_function(transform) {
        let args = vec![value.clone(), Some(Value::Object(scope.to_merged_object()))];
        env.sandbox.evaluate(transform, scope, args)
    } else {
        let context = scope
            .context
            .with("value", value.clone().unwrap_or(Value::Null));
        let local = scope.rebind(&context);
        expression::evaluate(transform, &local)
            .or_else(|_| env.sandbox.evaluate(transform, &local, Vec::new()))
    };

    match result {
        Ok(transformed) => transformed,
        Err(_) => {
            env.diagnostics.warn_once(
                DiagnosticKind::UnsupportedExpression,
                transform,
                "transform is outside the supported grammar; using the untransformed value",
            );
            value
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEXT INTERPOLATION
// ═══════════════════════════════════════════════════════════════════════════════

pub fn has_placeholders(text: &str) -> bool {
    text.contains("{{") && PLACEHOLDER_RE.is_match(text)
}

/// Expression text of every `{{ expr }}` in `text`, in order.
pub fn placeholder_expressions(text: &str) -> Vec<&str> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Replace every `{{ expr }}` with its display text.
pub fn interpolate(template: &str, scope: &Scope, env: &EvalEnv) -> String {
    if !has_placeholders(template) {
        return template.to_string();
    }
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            let value = expression::evaluate_or_undefined(&caps[1], scope, env);
            display_text(value.as_ref())
        })
        .into_owned()
}

/// A string that is exactly one placeholder keeps the value's type
/// (`"{{ items }}"` yields the array); other strings are interpolated.
pub fn interpolate_value(value: &Value, scope: &Scope, env: &EvalEnv) -> Value {
    let Value::String(text) = value else {
        return value.clone();
    };
    if !has_placeholders(text) {
        return value.clone();
    }
    if let Some(caps) = PLACEHOLDER_RE.captures(text) {
        if caps.get(0).is_some_and(|m| m.as_str() == text.trim()) {
            return expression::evaluate_or_undefined(&caps[1], scope, env).unwrap_or(Value::Null);
        }
    }
    Value::String(interpolate(text, scope, env))
}

/// Interpolate every string in a prop map (one level deep).
pub fn interpolate_props(props: &Map<String, Value>, scope: &Scope, env: &EvalEnv) -> Map<String, Value> {
    props
        .iter()
        .map(|(key, value)| (key.clone(), interpolate_value(value, scope, env)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::sandbox::SandboxCache;
    use crate::scope::RenderContext;
    use serde_json::json;

    fn env<'e>(diag: &'e Diagnostics, cache: &'e SandboxCache) -> EvalEnv<'e> {
        EvalEnv::new(diag, cache)
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("a.b[0].c"), vec!["a", "b", "0", "c"]);
        assert_eq!(path_segments("a['x y'].z"), vec!["a", "x y", "z"]);
        assert_eq!(path_segments("items.0.name"), vec!["items", "0", "name"]);
    }

    #[test]
    fn test_lookup_is_total() {
        let data = json!({"user": {"profile": null}, "items": [1, 2]});
        let ctx = RenderContext::new();
        let scope = Scope::new(&data, &ctx);
        assert_eq!(lookup_path("user.profile.name", &scope), None);
        assert_eq!(lookup_path("missing.deep.path", &scope), None);
        assert_eq!(lookup_path("items[5]", &scope), None);
        assert_eq!(lookup_path("items.length", &scope), Some(json!(2)));
        assert_eq!(lookup_path("", &scope), None);
        assert_eq!(lookup_path("user.profile", &scope), Some(json!(null)));
    }

    #[test]
    fn test_string_index_matches_length_units() {
        let text = json!("a😀b");
        assert_eq!(step(&text, "length"), Some(json!(4)));
        assert_eq!(step(&text, "0"), Some(json!("a")));
        assert_eq!(step(&text, "1"), Some(json!("\u{FFFD}")));
        assert_eq!(step(&text, "3"), Some(json!("b")));
        assert_eq!(step(&text, "4"), None);
    }

    #[test]
    fn test_prefixes_select_scope() {
        let data = json!({"count": 1});
        let state = json!({"count": 2});
        let bindings = json!({"count": 3});
        let ctx = RenderContext::new();
        let scope = Scope::new(&data, &ctx)
            .with_state(Some(&state))
            .with_bindings(Some(&bindings));
        assert_eq!(lookup_path("count", &scope), Some(json!(1)));
        assert_eq!(lookup_path("data.count", &scope), Some(json!(1)));
        assert_eq!(lookup_path("state.count", &scope), Some(json!(2)));
        assert_eq!(lookup_path("bindings.count", &scope), Some(json!(3)));
    }

    #[test]
    fn test_context_precedence_through_paths() {
        let data = json!({"x": {"name": "data"}});
        let ctx = RenderContext::new().with("x", json!({"name": "ctx"}));
        let scope = Scope::new(&data, &ctx);
        assert_eq!(lookup_path("x.name", &scope), Some(json!("ctx")));
        assert_eq!(lookup_path("data.x.name", &scope), Some(json!("ctx")));
    }

    #[test]
    fn test_structured_binding_with_transform() {
        let diag = Diagnostics::new();
        let cache = SandboxCache::new();
        let data = json!({"user": {"name": "ada"}});
        let ctx = RenderContext::new();
        let scope = Scope::new(&data, &ctx);

        let binding: Binding = serde_json::from_value(json!({
            "source": "user",
            "path": "name",
            "transform": "value => value.toUpperCase()"
        }))
        .unwrap();
        assert_eq!(
            resolve_binding(&binding, &scope, &env(&diag, &cache)),
            Some(json!("ADA"))
        );
    }

    #[test]
    fn test_state_binding_without_state_is_undefined() {
        let diag = Diagnostics::new();
        let cache = SandboxCache::new();
        let data = json!({});
        let ctx = RenderContext::new();
        let scope = Scope::new(&data, &ctx);
        let binding: Binding =
            serde_json::from_value(json!({"sourceType": "state", "path": "x"})).unwrap();
        assert_eq!(resolve_binding(&binding, &scope, &env(&diag, &cache)), None);
    }

    #[test]
    fn test_unsupported_transform_keeps_value() {
        let diag = Diagnostics::new();
        let cache = SandboxCache::new();
        let data = json!({"n": 4});
        let ctx = RenderContext::new();
        let scope = Scope::new(&data, &ctx);
        let value = apply_transform(
            "value => window.alert(value)",
            Some(json!(4)),
            &scope,
            &env(&diag, &cache),
        );
        assert_eq!(value, Some(json!(4)));
        assert_eq!(diag.count(DiagnosticKind::UnsupportedExpression), 1);
    }

    #[test]
    fn test_dev_mode_reports_available_keys() {
        let diag = Diagnostics::new();
        let cache = SandboxCache::new();
        let data = json!({"a": 1, "b": 2});
        let ctx = RenderContext::new();
        let scope = Scope::new(&data, &ctx);
        let mut e = env(&diag, &cache);
        e.dev_mode = true;
        assert_eq!(resolve_binding(&Binding::Path("c".into()), &scope, &e), None);
        let entries = diag.into_vec();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.contains("a, b"));
    }

    #[test]
    fn test_interpolation() {
        let diag = Diagnostics::new();
        let cache = SandboxCache::new();
        let data = json!({"user": {"name": "Ada"}, "items": [1, 2, 3]});
        let ctx = RenderContext::new();
        let scope = Scope::new(&data, &ctx);
        let e = env(&diag, &cache);
        assert_eq!(interpolate("Hello {{ user.name }}!", &scope, &e), "Hello Ada!");
        assert_eq!(interpolate("{{ missing }}x", &scope, &e), "x");
        assert_eq!(
            interpolate_value(&json!("{{ items }}"), &scope, &e),
            json!([1, 2, 3])
        );
        assert_eq!(
            interpolate_value(&json!("{{ items.length }} items"), &scope, &e),
            json!("3 items")
        );
    }
}
