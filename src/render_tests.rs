//! Render Tree Interpreter Tests
//!
//! End-to-end passes through `Interpreter::render`: loops, conditionals,
//! props resolution, composites and event dispatch.

#[cfg(test)]
mod tests {
    use crate::config::{RenderConfig, TickCadence};
    use crate::diagnostics::DiagnosticKind;
    use crate::registry::{ComponentRegistry, Renderable};
    use crate::render::{ElementNode, Interpreter, RenderNode, RenderOutput, RenderRequest, RenderStatus};
    use crate::schema::{RegistryManifest, SourceTier, UIComponent};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn config() -> RenderConfig {
        RenderConfig {
            tick: TickCadence::PerRender,
            ..RenderConfig::default()
        }
    }

    fn interpreter_with(registry: ComponentRegistry) -> Interpreter {
        Interpreter::new(Arc::new(registry), config())
    }

    fn interpreter() -> Interpreter {
        interpreter_with(ComponentRegistry::with_builtin_primitives())
    }

    fn doc(value: Value) -> UIComponent {
        UIComponent::from_value(value).unwrap()
    }

    fn collect_elements<'a>(nodes: &'a [RenderNode], out: &mut Vec<&'a ElementNode>) {
        for node in nodes {
            if let RenderNode::Element(element) = node {
                out.push(element);
            }
            collect_elements(node.children(), out);
        }
    }

    fn elements(output: &RenderOutput) -> Vec<&ElementNode> {
        let mut out = Vec::new();
        collect_elements(&output.nodes, &mut out);
        out
    }

    fn texts(nodes: &[RenderNode]) -> Vec<String> {
        let mut out = Vec::new();
        for node in nodes {
            if let RenderNode::Text { text } = node {
                out.push(text.clone());
            }
            out.extend(texts(node.children()));
        }
        out
    }

    fn has_diagnostic(output: &RenderOutput, kind: DiagnosticKind) -> bool {
        output.diagnostics.iter().any(|d| d.kind == kind)
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // LOOPS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_loop_renders_one_span_per_item_in_order() {
        let root = doc(json!({
            "type": "div",
            "loop": {"source": "items", "itemVar": "x"},
            "children": [{"type": "span", "dataBinding": "x.name"}]
        }));
        let data = json!({"items": [{"name": "A"}, {"name": "B"}]});

        let output = interpreter().render(&root, &data, None);
        assert_eq!(output.status, RenderStatus::Rendered);

        let spans: Vec<&ElementNode> = elements(&output)
            .into_iter()
            .filter(|e| e.component_type == "span")
            .collect();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].props["value"], json!("A"));
        assert_eq!(spans[1].props["value"], json!("B"));
        assert_eq!(spans[0].key, "root[0].0");
        assert_eq!(spans[1].key, "root[1].0");
    }

    #[test]
    fn test_loop_variables_interpolate_into_text() {
        let root = doc(json!({
            "type": "ul",
            "loop": {"source": "items", "itemVar": "it", "indexVar": "i"},
            "children": [{"type": "li", "children": "{{ i }}: {{ it }}"}]
        }));
        let data = json!({"items": ["a", "b"]});

        let output = interpreter().render(&root, &data, None);
        assert_eq!(texts(&output.nodes), vec!["0: a", "1: b"]);
    }

    #[test]
    fn test_loop_gate_keeps_item_slots() {
        let root = doc(json!({
            "type": "ul",
            "loop": {"source": "items", "itemVar": "x", "condition": "x.show"},
            "children": [{"type": "li", "children": "{{ x.label }}"}]
        }));
        let data = json!({"items": [
            {"label": "one", "show": true},
            {"label": "two", "show": false},
            {"label": "three", "show": true}
        ]});

        let output = interpreter().render(&root, &data, None);
        let list = output.nodes[0].as_element().unwrap();
        let keys: Vec<&str> = list
            .children
            .iter()
            .map(|child| match child {
                RenderNode::Fragment { key, .. } => key.as_str(),
                other => panic!("expected loop fragment, got {:?}", other),
            })
            .collect();
        assert_eq!(keys, vec!["0", "1", "2"]);
        assert!(list.children[1].children().is_empty());
        assert_eq!(texts(&output.nodes), vec!["one", "three"]);
    }

    #[test]
    fn test_duplicate_loop_keys_are_disambiguated() {
        let root = doc(json!({
            "type": "ul",
            "loop": {"source": "items", "itemVar": "x", "key": "id"},
            "children": [{"type": "li"}]
        }));
        let data = json!({"items": [{"id": "a"}, {"id": "a"}, {"id": "b"}]});

        let output = interpreter().render(&root, &data, None);
        let list = output.nodes[0].as_element().unwrap();
        let keys: Vec<String> = list
            .children
            .iter()
            .filter_map(|child| match child {
                RenderNode::Fragment { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec!["a", "a-1", "b"]);
    }

    #[test]
    fn test_non_array_loop_source_renders_no_items() {
        let root = doc(json!({
            "type": "ul",
            "loop": {"source": "items", "itemVar": "x"},
            "children": [{"type": "li"}]
        }));
        let data = json!({"items": "not a list"});

        let output = interpreter().render(&root, &data, None);
        assert_eq!(output.status, RenderStatus::Rendered);
        assert!(output.nodes[0].children().is_empty());
        assert!(has_diagnostic(&output, DiagnosticKind::LoopSourceNotArray));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // CONDITIONALS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_conditional_renders_then_branch_only_when_true() {
        let root = doc(json!({
            "conditional": {
                "if": "data.count > 0",
                "then": {"type": "span", "children": "Has items"}
            }
        }));
        let interp = interpreter();

        let empty = interp.render(&root, &json!({"count": 0}), None);
        assert_eq!(empty.status, RenderStatus::Empty);
        assert!(empty.nodes.is_empty());

        let full = interp.render(&root, &json!({"count": 2}), None);
        assert_eq!(full.status, RenderStatus::Rendered);
        let span = full.nodes[0].as_element().unwrap();
        assert_eq!(span.component_type, "span");
        assert_eq!(texts(&full.nodes), vec!["Has items"]);
    }

    #[test]
    fn test_conditional_never_renders_own_type() {
        let root = doc(json!({
            "type": "section",
            "conditional": {"if": "flag", "else": "fallback text"},
            "children": [{"type": "p"}]
        }));
        let interp = interpreter();

        let shown = interp.render(&root, &json!({"flag": true}), None);
        assert_eq!(shown.status, RenderStatus::Empty);

        let other = interp.render(&root, &json!({"flag": false}), None);
        assert_eq!(other.nodes, vec![RenderNode::Text { text: "fallback text".into() }]);
    }

    #[test]
    fn test_unsupported_condition_fails_open() {
        let root = doc(json!({
            "conditional": {"if": "a && b", "then": {"type": "span"}}
        }));
        let output = interpreter().render(&root, &json!({"a": false}), None);
        assert_eq!(output.status, RenderStatus::Rendered);
        assert!(has_diagnostic(&output, DiagnosticKind::UnsupportedExpression));
    }

    #[test]
    fn test_state_drives_conditionals() {
        let root = doc(json!({
            "type": "div",
            "children": [{
                "conditional": {
                    "if": "state.open === true",
                    "then": {"id": "panel", "type": "aside"},
                    "else": null
                }
            }]
        }));
        let interp = interpreter();
        let data = json!({});

        let closed = interp.render(&root, &data, Some(&json!({"open": false})));
        assert!(closed.nodes[0].children().is_empty());

        let open = interp.render(&root, &data, Some(&json!({"open": true})));
        let panel = open.nodes[0].children()[0].as_element().unwrap();
        assert_eq!(panel.key, "panel");
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // PROPS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_props_resolution_order() {
        let root = doc(json!({
            "type": "div",
            "props": {
                "title": "static",
                "gone": "x",
                "label": "Hi {{ user.name }}",
                "className": "base",
                "style": {"margin": 0, "color": "blue"},
                "onClick": "shadowed"
            },
            "bindings": {"title": "user.name", "gone": "nope"},
            "dataBinding": "user.tags",
            "className": "card {{ user.role }}",
            "style": {"color": "red"},
            "events": {"click": "go"}
        }));
        let data = json!({"user": {"name": "Ada", "role": "admin", "tags": ["x"]}});

        let output = interpreter().render(&root, &data, None);
        let div = output.nodes[0].as_element().unwrap();

        assert_eq!(div.props["title"], json!("Ada"));
        assert_eq!(div.props["label"], json!("Hi Ada"));
        assert!(!div.props.contains_key("gone"));
        assert_eq!(div.props["data"], json!(["x"]));
        assert_eq!(div.props["className"], json!("base card admin"));
        assert_eq!(div.props["style"], json!({"margin": 0, "color": "red"}));
        assert!(!div.props.contains_key("onClick"));
        assert_eq!(div.handlers.len(), 1);
        assert_eq!(div.handlers[0].host_name, "onClick");
    }

    #[test]
    fn test_structured_binding_with_transform() {
        let root = doc(json!({
            "type": "span",
            "bindings": {
                "text": {"source": "user", "path": "name", "transform": "(v) => v.toUpperCase()"},
                "mode": {"sourceType": "state", "path": "mode"}
            }
        }));
        let data = json!({"user": {"name": "ada"}});

        let output = interpreter().render(&root, &data, Some(&json!({"mode": "dark"})));
        let span = output.nodes[0].as_element().unwrap();
        assert_eq!(span.props["text"], json!("ADA"));
        assert_eq!(span.props["mode"], json!("dark"));
    }

    #[test]
    fn test_bindings_layer_from_request() {
        let root = doc(json!({"type": "span", "dataBinding": "bindings.total"}));
        let data = json!({});
        let bindings = json!({"total": 42});

        let output = interpreter()
            .render_request(RenderRequest::new(&root, &data).with_bindings(Some(&bindings)));
        let span = output.nodes[0].as_element().unwrap();
        assert_eq!(span.props["value"], json!(42));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // RESOLUTION AND COMPOSITES
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_unknown_type_renders_nothing() {
        let output = interpreter().render(&doc(json!({"type": "Nope"})), &json!({}), None);
        assert_eq!(output.status, RenderStatus::Empty);
        assert!(has_diagnostic(&output, DiagnosticKind::UnknownComponentType));
    }

    #[test]
    fn test_empty_type_renders_fragment() {
        let root = doc(json!({"children": [{"type": "span"}, {"type": "em"}]}));
        let output = interpreter().render(&root, &json!({}), None);
        match &output.nodes[0] {
            RenderNode::Fragment { key, children } => {
                assert_eq!(key, "root");
                assert_eq!(children.len(), 2);
            }
            other => panic!("expected fragment, got {:?}", other),
        }
    }

    #[test]
    fn test_composite_receives_props_children_and_handlers() {
        let registry = ComponentRegistry::with_builtin_primitives();
        registry.register_json_component(
            "Card",
            doc(json!({
                "type": "section",
                "className": "card",
                "children": [
                    {"type": "h2", "bindings": {"title": "props.title"}, "children": "{{ props.title }}"},
                    {"type": "Slot"}
                ]
            })),
        );
        let root = doc(json!({
            "type": "Card",
            "props": {"title": "Hello"},
            "events": {"onClick": "open"},
            "children": [{"type": "p", "children": "body"}]
        }));

        let output = interpreter_with(registry).render(&root, &json!({}), None);
        let section = output.nodes[0].as_element().unwrap();
        assert_eq!(section.component_type, "section");
        assert_eq!(section.key, "root");
        assert_eq!(section.handlers.len(), 1);
        assert_eq!(section.handlers[0].event, "click");

        let heading = section.children[0].as_element().unwrap();
        assert_eq!(heading.props["title"], json!("Hello"));
        let body = section.children[1].as_element().unwrap();
        assert_eq!(body.component_type, "p");
        assert_eq!(texts(&output.nodes), vec!["Hello", "body"]);
    }

    #[test]
    fn test_manifest_components_and_icons() {
        let manifest: RegistryManifest = serde_json::from_value(json!({
            "components": [
                {"key": "Button", "exportName": "UiButton", "sourceTier": "ui"},
                {"key": "OldButton", "sourceTier": "ui", "deprecated": "use Button"}
            ],
            "icons": ["search"]
        }))
        .unwrap();
        let registry = ComponentRegistry::from_manifest(manifest).unwrap();
        let root = doc(json!({
            "type": "div",
            "children": [{"type": "Button"}, {"type": "OldButton"}, {"type": "SearchIcon"}]
        }));

        let output = interpreter_with(registry).render(&root, &json!({}), None);
        let children = output.nodes[0].children();
        assert_eq!(
            children[0].as_element().unwrap().renderable,
            Renderable::element("UiButton", SourceTier::Ui)
        );
        assert_eq!(
            children[2].as_element().unwrap().renderable,
            Renderable::Icon { name: "search".into() }
        );
        assert!(has_diagnostic(&output, DiagnosticKind::DeprecatedComponent));
    }

    #[test]
    fn test_deprecation_is_reported_once_with_notice() {
        let manifest: RegistryManifest = serde_json::from_value(json!({
            "components": [{"key": "OldButton", "sourceTier": "ui", "deprecated": "use Button"}]
        }))
        .unwrap();
        let registry = ComponentRegistry::from_manifest(manifest).unwrap();
        let root = doc(json!({
            "type": "div",
            "children": [{"type": "OldButton"}, {"type": "OldButton"}]
        }));

        let output = interpreter_with(registry).render(&root, &json!({}), None);
        assert_eq!(output.nodes[0].children().len(), 2);
        let deprecations: Vec<_> = output
            .diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::DeprecatedComponent)
            .collect();
        assert_eq!(deprecations.len(), 1);
        assert!(deprecations[0].message.ends_with("use Button"));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // EVENTS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_dispatch_uses_loop_context_of_handler() {
        let root = doc(json!({
            "type": "ul",
            "loop": {"source": "items", "itemVar": "item"},
            "children": [{
                "id": "pick",
                "type": "button",
                "events": {"click": {"action": "pick", "condition": "item.enabled"}}
            }]
        }));
        let data = json!({"items": [{"enabled": true}, {"enabled": false}]});
        let interp = interpreter();
        let output = interp.render(&root, &data, None);

        let buttons: Vec<&ElementNode> = elements(&output)
            .into_iter()
            .filter(|e| e.component_type == "button")
            .collect();
        assert_eq!(buttons.len(), 2);

        let mut fired: Vec<String> = Vec::new();
        for button in &buttons {
            interp.dispatch(&button.handlers[0], None, &data, None, |node_id, handler, _| {
                fired.push(format!("{}:{}", node_id, handler.actions[0].id.as_deref().unwrap_or("")));
            });
        }
        assert_eq!(fired, vec!["pick:pick"]);
    }

    #[test]
    fn test_dispatch_condition_sees_data_and_payload() {
        let root = doc(json!({
            "type": "button",
            "events": {
                "click": {"action": "buy", "condition": "data.x > 5"},
                "change": {"action": "set", "condition": "payload.amount >= 10"}
            }
        }));
        let interp = interpreter();
        let low = json!({"x": 3});
        let high = json!({"x": 10});
        let output = interp.render(&root, &low, None);
        let button = output.nodes[0].as_element().unwrap();
        let click = &button.handlers[0];
        let change = &button.handlers[1];

        assert!(!interp.dispatch(click, None, &low, None, |_, _, _| {}));
        assert!(interp.dispatch(click, None, &high, None, |_, _, _| {}));

        let mut seen = None;
        assert!(interp.dispatch(change, Some(&json!({"amount": 12})), &low, None, |_, _, payload| {
            seen = payload.cloned();
        }));
        assert_eq!(seen, Some(json!({"amount": 12})));
        assert!(!interp.dispatch(change, Some(&json!({"amount": 2})), &low, None, |_, _, _| {}));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // OUTPUT SHAPE
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_output_serializes_for_hosts() {
        let root = doc(json!({
            "id": "hello",
            "type": "p",
            "events": {"click": "greet"},
            "children": "Hi {{ name }}"
        }));
        let output = interpreter().render(&root, &json!({"name": "Ada"}), None);
        let value = serde_json::to_value(&output).unwrap();

        assert_eq!(value["status"], json!("rendered"));
        assert_eq!(value["nodes"][0]["kind"], json!("element"));
        assert_eq!(value["nodes"][0]["type"], json!("p"));
        assert_eq!(value["nodes"][0]["key"], json!("hello"));
        assert_eq!(value["nodes"][0]["renderable"]["kind"], json!("element"));
        assert_eq!(value["nodes"][0]["handlers"][0]["hostName"], json!("onClick"));
        assert_eq!(value["nodes"][0]["children"][0], json!({"kind": "text", "text": "Hi Ada"}));
    }
}
