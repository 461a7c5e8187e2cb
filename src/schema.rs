//! JSON UI document schema.
//!
//! These types are the authored-document contract and must stay
//! field-for-field compatible with existing documents: every field is
//! optional on input, names are camelCase, and ordering is preserved.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ═══════════════════════════════════════════════════════════════════════════════
// COMPONENT NODE
// ═══════════════════════════════════════════════════════════════════════════════

/// One node of a UI document. Nodes are immutable once parsed; the
/// interpreter never writes back into the tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UIComponent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub component_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub bindings: IndexMap<String, Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_binding: Option<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<EventsField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<Conditional>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<Loop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Children>,
}

impl UIComponent {
    pub fn from_json(source: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_value(value: Value) -> crate::error::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Child nodes in declared order; a text child yields none.
    pub fn child_nodes(&self) -> &[UIComponent] {
        match &self.children {
            Some(Children::Nodes(nodes)) => nodes,
            Some(Children::Node(node)) => std::slice::from_ref(node.as_ref()),
            _ => &[],
        }
    }

    /// Id if present, else the type, for diagnostics.
    pub fn label(&self) -> &str {
        if !self.id.is_empty() {
            &self.id
        } else if !self.component_type.is_empty() {
            &self.component_type
        } else {
            "<anonymous>"
        }
    }

    /// `Slot` marks where a composite definition places the instance's children.
    pub fn is_slot(&self) -> bool {
        self.component_type.eq_ignore_ascii_case("slot")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Children {
    Text(String),
    Nodes(Vec<UIComponent>),
    Node(Box<UIComponent>),
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINDINGS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binding {
    /// Dotted path; `state.` and `bindings.` prefixes select the scope.
    Path(String),
    Structured(StructuredBinding),
}

impl Default for Binding {
    fn default() -> Self {
        Binding::Path(String::new())
    }
}

impl Binding {
    pub fn is_empty(&self) -> bool {
        match self {
            Binding::Path(path) => path.trim().is_empty(),
            Binding::Structured(s) => s.source.is_none() && s.path.is_none(),
        }
    }

    /// Text used to identify the binding in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Binding::Path(path) => path.clone(),
            Binding::Structured(s) => {
                let scope = s.source_type.map(SourceType::as_str).unwrap_or("data");
                let mut out = scope.to_string();
                for part in [&s.source, &s.path].into_iter().flatten() {
                    out.push('.');
                    out.push_str(part);
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Data,
    Bindings,
    State,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Data => "data",
            SourceType::Bindings => "bindings",
            SourceType::State => "state",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONDITIONALS AND LOOPS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    #[serde(rename = "if", default, deserialize_with = "expression_text")]
    pub condition: String,
    /// `None` = key absent, `Some(None)` = explicit `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub then: Option<Option<Branch>>,
    #[serde(
        rename = "else",
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub otherwise: Option<Option<Branch>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Branch {
    Text(String),
    Nodes(Vec<UIComponent>),
    Node(Box<UIComponent>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loop {
    #[serde(default)]
    pub source: Binding,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    /// Key-path on each item used for stable keys; the index otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Per-item gate evaluated with the item in context.
    #[serde(
        default,
        alias = "conditional",
        deserialize_with = "optional_expression_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub condition: Option<String>,
}

fn default_item_var() -> String {
    "item".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventsField {
    /// Legacy array form, already (mostly) normalized.
    Handlers(Vec<LegacyHandler>),
    Map(IndexMap<String, EventSpec>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventSpec {
    Many(Vec<EventDefinition>),
    One(EventDefinition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventDefinition {
    /// A bare action id, sugar for one custom action.
    ActionId(String),
    Multi(MultiActionDefinition),
    Single(SingleActionDefinition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiActionDefinition {
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(
        default,
        deserialize_with = "optional_expression_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleActionDefinition {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(
        default,
        deserialize_with = "optional_expression_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyHandler {
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(
        default,
        deserialize_with = "optional_expression_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default = "default_action_type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    /// Fields this crate does not interpret, kept for the action executor.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Action {
    pub fn custom(id: &str, params: Option<Map<String, Value>>) -> Self {
        Action {
            action_type: default_action_type(),
            id: Some(id.to_string()),
            params,
            extra: Map::new(),
        }
    }
}

fn default_action_type() -> String {
    "custom".to_string()
}

/// Normalized event handler, keyed by the canonical event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHandler {
    pub event: String,
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY MANIFEST
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceTier {
    /// Host primitives (`div`, `span`, ...).
    Primitive,
    /// Framework UI wrappers, loaded eagerly.
    #[default]
    Ui,
    /// Lazily loaded module, located by load path or file name.
    Module,
    /// Pure-JSON component definition.
    Json,
    Icon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub export_name: String,
    #[serde(default)]
    pub source_tier: SourceTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_path: Option<String>,
    #[serde(default)]
    pub wrapper_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper_component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<Deprecation>,
}

impl RegistryEntry {
    pub fn export_name(&self) -> &str {
        if self.export_name.is_empty() {
            &self.key
        } else {
            &self.export_name
        }
    }

    /// Wrapper substitution target, when this entry demands one.
    pub fn wrapper(&self) -> Option<&str> {
        if self.wrapper_required {
            self.wrapper_component.as_deref().filter(|w| !w.is_empty())
        } else {
            None
        }
    }

    pub fn is_deprecated(&self) -> bool {
        self.deprecated.as_ref().is_some_and(Deprecation::is_set)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Deprecation {
    Flag(bool),
    Notice(String),
}

impl Deprecation {
    pub fn is_set(&self) -> bool {
        match self {
            Deprecation::Flag(flag) => *flag,
            Deprecation::Notice(_) => true,
        }
    }

    pub fn notice(&self) -> Option<&str> {
        match self {
            Deprecation::Notice(text) => Some(text),
            Deprecation::Flag(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryManifest {
    #[serde(default)]
    pub components: Vec<RegistryEntry>,
    #[serde(default)]
    pub icons: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERDE HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Distinguishes an explicit `null` from an absent key.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Conditions may be authored as strings or as bare JSON scalars.
fn expression_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(scalar_to_expression(&value).unwrap_or_default())
}

fn optional_expression_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_to_expression))
}

fn scalar_to_expression(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_full_node() {
        let node = UIComponent::from_value(json!({
            "id": "list",
            "type": "div",
            "className": "list",
            "props": {"role": "list"},
            "bindings": {"title": "page.title"},
            "dataBinding": {"sourceType": "state", "path": "selected"},
            "loop": {"source": "items", "itemVar": "x", "indexVar": "i"},
            "children": [{"type": "span", "dataBinding": "x.name"}]
        }))
        .unwrap();

        assert_eq!(node.component_type, "div");
        assert_eq!(node.class_name.as_deref(), Some("list"));
        assert_eq!(node.bindings["title"], Binding::Path("page.title".into()));
        let repeat = node.repeat.as_ref().unwrap();
        assert_eq!(repeat.item_var, "x");
        assert_eq!(repeat.index_var.as_deref(), Some("i"));
        assert_eq!(node.child_nodes().len(), 1);
        match node.data_binding.unwrap() {
            Binding::Structured(s) => assert_eq!(s.source_type, Some(SourceType::State)),
            other => panic!("expected structured binding, got {:?}", other),
        }
    }

    #[test]
    fn test_conditional_distinguishes_null_from_absent() {
        let cond: Conditional = serde_json::from_value(json!({"if": "x", "else": null})).unwrap();
        assert_eq!(cond.then, None);
        assert_eq!(cond.otherwise, Some(None));

        let cond: Conditional =
            serde_json::from_value(json!({"if": true, "then": "yes"})).unwrap();
        assert_eq!(cond.condition, "true");
        assert_eq!(cond.then, Some(Some(Branch::Text("yes".into()))));
    }

    #[test]
    fn test_event_shapes() {
        let events: EventsField = serde_json::from_value(json!({
            "onClick": "save",
            "change": {"action": "update", "payload": {"field": "name"}},
            "submit": [{"actions": [{"type": "navigate", "params": {"to": "/"}}]}]
        }))
        .unwrap();
        let EventsField::Map(map) = events else {
            panic!("expected map form");
        };
        assert_eq!(
            map["onClick"],
            EventSpec::One(EventDefinition::ActionId("save".into()))
        );
        assert!(matches!(
            map["change"],
            EventSpec::One(EventDefinition::Single(_))
        ));
        assert!(matches!(&map["submit"], EventSpec::Many(defs) if defs.len() == 1));

        let legacy: EventsField =
            serde_json::from_value(json!([{"event": "onClick", "action": "go"}])).unwrap();
        assert!(matches!(legacy, EventsField::Handlers(h) if h.len() == 1));
    }

    #[test]
    fn test_action_keeps_unknown_fields() {
        let action: Action =
            serde_json::from_value(json!({"type": "api", "endpoint": "/save"})).unwrap();
        assert_eq!(action.action_type, "api");
        assert_eq!(action.extra["endpoint"], json!("/save"));
        let back = serde_json::to_value(&action).unwrap();
        assert_eq!(back, json!({"type": "api", "endpoint": "/save"}));
    }

    #[test]
    fn test_registry_entry_defaults() {
        let entry: RegistryEntry = serde_json::from_value(json!({
            "key": "Card",
            "wrapperRequired": true,
            "wrapperComponent": "CardWrapper",
            "deprecated": "use Panel"
        }))
        .unwrap();
        assert_eq!(entry.export_name(), "Card");
        assert_eq!(entry.source_tier, SourceTier::Ui);
        assert_eq!(entry.wrapper(), Some("CardWrapper"));
        assert!(entry.is_deprecated());
    }
}
