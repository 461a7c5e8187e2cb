//! Authoring-time document validation.
//!
//! Validation is separate from rendering: the interpreter accepts any
//! document and degrades, while this module reports what an author should
//! fix. Failures come back as a structured report, never as an `Err`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::binding::placeholder_expressions;
use crate::events::normalize_events;
use crate::expression;
use crate::registry::ComponentRegistry;
use crate::sandbox;
use crate::schema::{Binding, Branch, Children, UIComponent};

// ═══════════════════════════════════════════════════════════════════════════════
// ISSUE CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_INVALID_JSON: &str = "UI-ERR-JSON";
pub const ERR_EMPTY_NODE: &str = "UI-ERR-EMPTY-NODE";
pub const ERR_LOOP_ITEM_VAR: &str = "UI-ERR-LOOP-ITEM-VAR";
pub const ERR_EMPTY_CONDITION: &str = "UI-ERR-EMPTY-CONDITION";
pub const WARN_DUPLICATE_ID: &str = "UI-WARN-DUPLICATE-ID";
pub const WARN_UNKNOWN_TYPE: &str = "UI-WARN-UNKNOWN-TYPE";
pub const WARN_DEPRECATED: &str = "UI-WARN-DEPRECATED";
pub const WARN_UNSUPPORTED_EXPRESSION: &str = "UI-WARN-UNSUPPORTED-EXPR";
pub const WARN_EMPTY_CONDITIONAL: &str = "UI-WARN-EMPTY-CONDITIONAL";
pub const WARN_LOOP_WITHOUT_CHILDREN: &str = "UI-WARN-LOOP-NO-CHILDREN";
pub const WARN_LOOP_WITHOUT_SOURCE: &str = "UI-WARN-LOOP-NO-SOURCE";
pub const WARN_EVENT_WITHOUT_ACTIONS: &str = "UI-WARN-EVENT-NO-ACTIONS";

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_INVALID_JSON => "Documents are JSON objects matching the node schema.",
        ERR_EMPTY_NODE => "Every node renders something: a type, a conditional or children.",
        ERR_LOOP_ITEM_VAR => "Loop items are always reachable through a named variable.",
        ERR_EMPTY_CONDITION => "A conditional always has a condition to evaluate.",
        WARN_DUPLICATE_ID => "Node ids identify one node and its event handlers.",
        WARN_UNKNOWN_TYPE => "Unknown component types render nothing.",
        WARN_DEPRECATED => "Deprecated components still render but may be removed.",
        WARN_UNSUPPORTED_EXPRESSION => {
            "Unsupported conditions render as true; unsupported placeholders and transforms read as undefined or untransformed."
        }
        WARN_EMPTY_CONDITIONAL => "A conditional without branches always renders nothing.",
        WARN_LOOP_WITHOUT_CHILDREN => "A loop repeats its children; without children it renders no items.",
        WARN_LOOP_WITHOUT_SOURCE => "A loop without a source renders no items.",
        WARN_EVENT_WITHOUT_ACTIONS => "An event handler with no actions dispatches nothing.",
        _ => "Unknown validation rule.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPORT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// `$`-rooted path of the offending node or field.
    pub path: String,
    pub message: String,
    pub code: String,
    pub guarantee: String,
}

impl ValidationIssue {
    pub fn new(code: &str, path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
            code: code.to_string(),
            guarantee: get_guarantee(code).to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn error(&mut self, code: &str, path: &str, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(code, path, message));
    }

    fn warn(&mut self, code: &str, path: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(code, path, message));
    }

    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.errors.iter().chain(&self.warnings).any(|i| i.code == code)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

pub fn validate_json(source: &str, registry: Option<&ComponentRegistry>) -> ValidationReport {
    match UIComponent::from_json(source) {
        Ok(node) => validate_document(&node, registry),
        Err(err) => {
            let mut report = ValidationReport::default();
            report.error(ERR_INVALID_JSON, "$", err.to_string());
            report.finish()
        }
    }
}

/// Validate a parsed document. Unknown-type checks need a `registry`.
pub fn validate_document(node: &UIComponent, registry: Option<&ComponentRegistry>) -> ValidationReport {
    let mut validator = Validator {
        registry,
        report: ValidationReport::default(),
        seen_ids: HashMap::new(),
    };
    validator.visit_node(node, "$");
    let report = validator.report.finish();
    tracing::debug!(
        valid = report.valid,
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "validated document"
    );
    report
}

struct Validator<'r> {
    registry: Option<&'r ComponentRegistry>,
    report: ValidationReport,
    /// id → path of its first use
    seen_ids: HashMap<String, String>,
}

impl<'r> Validator<'r> {
    fn visit_node(&mut self, node: &UIComponent, path: &str) {
        if node.component_type.is_empty() && node.conditional.is_none() && node.children.is_none() {
            self.report.error(
                ERR_EMPTY_NODE,
                path,
                "node has no type, conditional or children",
            );
        }

        self.check_id(node, path);
        self.check_type(node, path);
        self.check_props(node, path);
        self.check_events(node, path);

        if let Some(conditional) = &node.conditional {
            let cond_path = format!("{}.conditional", path);
            if conditional.condition.trim().is_empty() {
                self.report.error(ERR_EMPTY_CONDITION, &cond_path, "conditional has an empty `if`");
            } else {
                self.check_expression(&conditional.condition, &format!("{}.if", cond_path));
            }
            if conditional.then.is_none() && conditional.otherwise.is_none() {
                self.report.warn(
                    WARN_EMPTY_CONDITIONAL,
                    &cond_path,
                    "conditional declares neither `then` nor `else`",
                );
            }
            if let Some(Some(branch)) = &conditional.then {
                self.visit_branch(branch, &format!("{}.then", cond_path));
            }
            if let Some(Some(branch)) = &conditional.otherwise {
                self.visit_branch(branch, &format!("{}.else", cond_path));
            }
        }

        if let Some(repeat) = &node.repeat {
            let loop_path = format!("{}.loop", path);
            if repeat.item_var.trim().is_empty() {
                self.report.error(ERR_LOOP_ITEM_VAR, &loop_path, "loop has an empty `itemVar`");
            }
            if repeat.source.is_empty() {
                self.report.warn(WARN_LOOP_WITHOUT_SOURCE, &loop_path, "loop has no source");
            }
            self.check_binding(&repeat.source, &format!("{}.source", loop_path));
            if let Some(condition) = repeat.condition.as_deref() {
                self.check_expression(condition, &format!("{}.condition", loop_path));
            }
            let has_children = match &node.children {
                None => false,
                Some(Children::Nodes(nodes)) => !nodes.is_empty(),
                Some(_) => true,
            };
            if !has_children {
                self.report.warn(
                    WARN_LOOP_WITHOUT_CHILDREN,
                    &loop_path,
                    "loop has no children to repeat",
                );
            }
        }

        match &node.children {
            Some(Children::Text(text)) => self.check_template(text, &format!("{}.children", path)),
            Some(Children::Node(child)) => self.visit_node(child, &format!("{}.children", path)),
            Some(Children::Nodes(children)) => {
                for (index, child) in children.iter().enumerate() {
                    self.visit_node(child, &format!("{}.children[{}]", path, index));
                }
            }
            None => {}
        }
    }

    fn visit_branch(&mut self, branch: &Branch, path: &str) {
        match branch {
            Branch::Text(text) => self.check_template(text, path),
            Branch::Node(node) => self.visit_node(node, path),
            Branch::Nodes(nodes) => {
                for (index, node) in nodes.iter().enumerate() {
                    self.visit_node(node, &format!("{}[{}]", path, index));
                }
            }
        }
    }

    fn check_id(&mut self, node: &UIComponent, path: &str) {
        if node.id.is_empty() {
            return;
        }
        match self.seen_ids.get(&node.id) {
            Some(first) => {
                let message = format!("id '{}' is already used at {}", node.id, first);
                self.report.warn(WARN_DUPLICATE_ID, path, message);
            }
            None => {
                self.seen_ids.insert(node.id.clone(), path.to_string());
            }
        }
    }

    fn check_type(&mut self, node: &UIComponent, path: &str) {
        let Some(registry) = self.registry else {
            return;
        };
        let type_name = node.component_type.as_str();
        if type_name.is_empty() || node.is_slot() {
            return;
        }
        if !registry.has_component(type_name) {
            self.report.warn(
                WARN_UNKNOWN_TYPE,
                path,
                format!("no component registered for type '{}'", type_name),
            );
        } else if registry.is_deprecated(type_name) {
            let notice = registry
                .entry(type_name)
                .and_then(|e| e.deprecated.and_then(|d| d.notice().map(str::to_string)));
            let message = match notice {
                Some(notice) => format!("'{}' is deprecated: {}", type_name, notice),
                None => format!("'{}' is deprecated", type_name),
            };
            self.report.warn(WARN_DEPRECATED, path, message);
        }
    }

    fn check_props(&mut self, node: &UIComponent, path: &str) {
        for (name, value) in &node.props {
            if let Some(text) = value.as_str() {
                self.check_template(text, &format!("{}.props.{}", path, name));
            }
        }
        if let Some(class_name) = node.class_name.as_deref() {
            self.check_template(class_name, &format!("{}.className", path));
        }
        if let Some(style) = &node.style {
            for (name, value) in style {
                if let Some(text) = value.as_str() {
                    self.check_template(text, &format!("{}.style.{}", path, name));
                }
            }
        }
        for (name, binding) in &node.bindings {
            self.check_binding(binding, &format!("{}.bindings.{}", path, name));
        }
        if let Some(binding) = &node.data_binding {
            self.check_binding(binding, &format!("{}.dataBinding", path));
        }
    }

    fn check_events(&mut self, node: &UIComponent, path: &str) {
        let Some(events) = &node.events else {
            return;
        };
        for handler in normalize_events(events) {
            let event_path = format!("{}.events.{}", path, handler.event);
            if handler.actions.is_empty() {
                self.report.warn(
                    WARN_EVENT_WITHOUT_ACTIONS,
                    &event_path,
                    format!("'{}' handler has no actions", handler.event),
                );
            }
            if let Some(condition) = handler.condition.as_deref() {
                self.check_expression(condition, &format!("{}.condition", event_path));
            }
        }
    }

    fn check_binding(&mut self, binding: &Binding, path: &str) {
        let Binding::Structured(structured) = binding else {
            return;
        };
        let Some(transform) = structured.transform.as_deref().filter(|t| !t.trim().is_empty()) else {
            return;
        };
        let supported = if sandbox::is_arrow_function(transform) {
            sandbox::compile(transform).is_ok()
        } else {
            expression::is_supported(transform) || sandbox::compile(transform).is_ok()
        };
        if !supported {
            self.report.warn(
                WARN_UNSUPPORTED_EXPRESSION,
                &format!("{}.transform", path),
                format!("transform '{}' cannot be evaluated; the value is used untransformed", transform),
            );
        }
    }

    fn check_template(&mut self, text: &str, path: &str) {
        for expr in placeholder_expressions(text) {
            self.check_expression(expr, path);
        }
    }

    fn check_expression(&mut self, expr: &str, path: &str) {
        if !expression::is_supported(expr) {
            self.report.warn(
                WARN_UNSUPPORTED_EXPRESSION,
                path,
                format!("'{}' is outside the supported expression grammar", expr),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RegistryManifest;
    use serde_json::json;

    fn validate(value: serde_json::Value) -> ValidationReport {
        validate_document(&UIComponent::from_value(value).unwrap(), None)
    }

    #[test]
    fn test_valid_document() {
        let report = validate(json!({
            "type": "div",
            "children": [
                {"type": "span", "children": "Hello {{ user.name }}"},
                {"conditional": {"if": "count > 0", "then": {"type": "p"}}}
            ]
        }));
        assert!(report.valid);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_invalid_json_is_an_error_not_a_panic() {
        let report = validate_json("{ nope", None);
        assert!(!report.valid);
        assert_eq!(report.errors[0].code, ERR_INVALID_JSON);
        assert_eq!(report.errors[0].path, "$");
    }

    #[test]
    fn test_structural_errors() {
        let report = validate(json!({
            "type": "div",
            "children": [
                {"id": "blank"},
                {"type": "ul", "loop": {"source": "items", "itemVar": ""}, "children": [{"type": "li"}]},
                {"conditional": {"if": "", "then": "x"}}
            ]
        }));
        assert!(!report.valid);
        let codes: Vec<&str> = report.errors.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec![ERR_EMPTY_NODE, ERR_LOOP_ITEM_VAR, ERR_EMPTY_CONDITION]);
        assert_eq!(report.errors[0].path, "$.children[0]");
        assert_eq!(report.errors[1].path, "$.children[1].loop");
    }

    #[test]
    fn test_authoring_warnings() {
        let report = validate(json!({
            "type": "div",
            "children": [
                {"id": "x", "type": "p", "className": "{{ a && b }}"},
                {"id": "x", "type": "p", "events": {"click": {"actions": []}}},
                {"conditional": {"if": "flag"}},
                {"type": "ul", "loop": {"source": "items"}},
                {"type": "span", "bindings": {"v": {"source": "n", "transform": "(v) => window.alert(v)"}}}
            ]
        }));
        assert!(report.valid);
        for code in [
            WARN_UNSUPPORTED_EXPRESSION,
            WARN_DUPLICATE_ID,
            WARN_EVENT_WITHOUT_ACTIONS,
            WARN_EMPTY_CONDITIONAL,
            WARN_LOOP_WITHOUT_CHILDREN,
        ] {
            assert!(report.has_code(code), "missing {}", code);
        }
        let duplicate = report.warnings.iter().find(|w| w.code == WARN_DUPLICATE_ID).unwrap();
        assert_eq!(duplicate.path, "$.children[1]");
        assert!(duplicate.message.contains("$.children[0]"));
    }

    #[test]
    fn test_registry_checks() {
        let manifest: RegistryManifest = serde_json::from_value(json!({
            "components": [{"key": "Legacy", "sourceTier": "ui", "deprecated": "use Modern"}]
        }))
        .unwrap();
        let registry = ComponentRegistry::from_manifest(manifest).unwrap();
        let node = UIComponent::from_value(json!({
            "type": "div",
            "children": [{"type": "Legacy"}, {"type": "Mystery"}, {"type": "Slot"}]
        }))
        .unwrap();

        let report = validate_document(&node, Some(&registry));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings[0].code, WARN_DEPRECATED);
        assert!(report.warnings[0].message.contains("use Modern"));
        assert_eq!(report.warnings[1].code, WARN_UNKNOWN_TYPE);
    }

    #[test]
    fn test_report_serializes_with_guarantees() {
        let report = validate_json("42", None);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["valid"], json!(false));
        assert!(value["errors"][0]["guarantee"].as_str().unwrap().contains("JSON"));
    }
}
