//! Render tree interpreter.
//!
//! ## Interpreter Invariants
//!
//! 1. **Infallible**: `render` never returns an error and never panics on
//!    document content. Every fault degrades to an empty subtree, a bounded
//!    fallback node or a halted pass, plus a diagnostic.
//! 2. **Per-node order**: guard check, conditional gate, props (declared →
//!    `bindings` → `dataBinding` → `className`/`style` merge), handlers
//!    last, component resolution, then children in declared order.
//! 3. **Immutable context**: each descent gets an extended copy of the
//!    render context. Siblings never see each other's loop variables.
//! 4. **Cycle safety**: the ordered set of composite definitions being
//!    rendered is threaded down; re-entering one renders nothing.
//! 5. **Whole-pass halt**: once the tick budget trips, the pass aborts with
//!    status `Halted` and no nodes.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::binding::{interpolate, interpolate_props, interpolate_value, resolve_binding};
use crate::config::RenderConfig;
use crate::control_flow::{evaluate_conditional, expand_loop, ConditionalOutcome};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::events::{fire_handler, host_event_name, normalize_events};
use crate::expression::EvalEnv;
use crate::guard::{GuardDecision, RenderGuard};
use crate::registry::{ComponentRegistry, Renderable};
use crate::sandbox::SandboxCache;
use crate::schema::{Action, Branch, Children, EventHandler, RegistryEntry, UIComponent};
use crate::scope::{RenderContext, Scope};

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderStatus {
    Rendered,
    Empty,
    Halted,
}

/// An event handler bound to the context it was rendered in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundHandler {
    pub node_id: String,
    pub event: String,
    /// `onClick` style name the host attaches the handler under.
    pub host_name: String,
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Loop and branch variables visible where the handler was declared.
    #[serde(skip)]
    pub context: RenderContext,
}

impl BoundHandler {
    pub fn to_event_handler(&self) -> EventHandler {
        EventHandler {
            event: self.event.clone(),
            actions: self.actions.clone(),
            condition: self.condition.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementNode {
    /// Stable key for list reconciliation.
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub renderable: Renderable,
    pub props: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<BoundHandler>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RenderNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RenderNode {
    Element(ElementNode),
    Text {
        text: String,
    },
    Fragment {
        key: String,
        children: Vec<RenderNode>,
    },
    /// Visible marker for a subtree cut off by the depth limit.
    #[serde(rename_all = "camelCase")]
    Fallback {
        node_id: String,
        depth: usize,
    },
}

impl RenderNode {
    pub fn as_element(&self) -> Option<&ElementNode> {
        match self {
            RenderNode::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn children(&self) -> &[RenderNode] {
        match self {
            RenderNode::Element(element) => &element.children,
            RenderNode::Fragment { children, .. } => children,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOutput {
    pub nodes: Vec<RenderNode>,
    pub status: RenderStatus,
    pub diagnostics: Vec<Diagnostic>,
}

/// Everything one render pass reads.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'r> {
    pub root: &'r UIComponent,
    pub data: &'r Value,
    pub state: Option<&'r Value>,
    /// Backs the `bindings.` prefix and `sourceType: "bindings"`.
    pub bindings: Option<&'r Value>,
}

impl<'r> RenderRequest<'r> {
    pub fn new(root: &'r UIComponent, data: &'r Value) -> Self {
        Self {
            root,
            data,
            state: None,
            bindings: None,
        }
    }

    pub fn with_state(mut self, state: Option<&'r Value>) -> Self {
        self.state = state;
        self
    }

    pub fn with_bindings(mut self, bindings: Option<&'r Value>) -> Self {
        self.bindings = bindings;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERPRETER
// ═══════════════════════════════════════════════════════════════════════════════

/// The tick budget tripped somewhere below; the whole pass is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PassHalted;

type Rendered = Result<Vec<RenderNode>, PassHalted>;

/// Where in the tree a node is being rendered.
#[derive(Clone, Copy)]
struct Site<'s> {
    depth: usize,
    /// Composite definitions currently being rendered, outermost first.
    active: &'s [String],
    /// Rendered instance children for `Slot` nodes inside a definition.
    slot: Option<&'s [RenderNode]>,
}

impl<'s> Site<'s> {
    fn deeper(self) -> Self {
        Site {
            depth: self.depth + 1,
            ..self
        }
    }
}

pub struct Interpreter {
    registry: Arc<ComponentRegistry>,
    config: RenderConfig,
    guard: RenderGuard,
    sandbox: SandboxCache,
}

impl Interpreter {
    pub fn new(registry: Arc<ComponentRegistry>, config: RenderConfig) -> Self {
        let guard = RenderGuard::new(&config);
        Self {
            registry,
            config,
            guard,
            sandbox: SandboxCache::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn guard(&self) -> &RenderGuard {
        &self.guard
    }

    /// Host tick boundary: resets the safety counters.
    pub fn tick(&self) {
        self.guard.tick();
    }

    fn env<'e>(&'e self, diagnostics: &'e Diagnostics) -> EvalEnv<'e> {
        EvalEnv {
            diagnostics,
            sandbox: &self.sandbox,
            dev_mode: self.config.dev_mode,
        }
    }

    pub fn render(&self, root: &UIComponent, data: &Value, state: Option<&Value>) -> RenderOutput {
        self.render_request(RenderRequest::new(root, data).with_state(state))
    }

    pub fn render_request(&self, request: RenderRequest) -> RenderOutput {
        self.guard.begin_render();
        let diagnostics = Diagnostics::new();

        let result = {
            let env = self.env(&diagnostics);
            let context = RenderContext::new();
            let scope = Scope::new(request.data, &context)
                .with_state(request.state)
                .with_bindings(request.bindings);
            let key = if request.root.id.is_empty() {
                "root"
            } else {
                request.root.id.as_str()
            };
            let site = Site {
                depth: 0,
                active: &[],
                slot: None,
            };
            self.render_node(request.root, &scope, key, site, &env)
        };

        let (nodes, status) = match result {
            Ok(nodes) if nodes.is_empty() => (nodes, RenderStatus::Empty),
            Ok(nodes) => (nodes, RenderStatus::Rendered),
            Err(PassHalted) => (Vec::new(), RenderStatus::Halted),
        };
        let diagnostics = diagnostics.into_vec();
        tracing::debug!(
            root = request.root.label(),
            ?status,
            nodes = nodes.len(),
            diagnostics = diagnostics.len(),
            "render pass finished"
        );

        RenderOutput {
            nodes,
            status,
            diagnostics,
        }
    }

    /// Fire `handler` for `payload`. The condition is evaluated against the
    /// handler's render context, the current data and state, with the
    /// payload bound as `payload`. Returns whether `on_event` was called.
    pub fn dispatch<F>(
        &self,
        handler: &BoundHandler,
        payload: Option<&Value>,
        data: &Value,
        state: Option<&Value>,
        on_event: F,
    ) -> bool
    where
        F: FnOnce(&str, &EventHandler, Option<&Value>),
    {
        let diagnostics = Diagnostics::new();
        let env = self.env(&diagnostics);
        let context = match payload {
            Some(payload) => handler.context.with("payload", payload.clone()),
            None => handler.context.clone(),
        };
        let scope = Scope::new(data, &context).with_state(state);
        let event_handler = handler.to_event_handler();
        fire_handler(&event_handler, &scope, &env, |h| {
            on_event(&handler.node_id, h, payload)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // NODE RENDERING
    // ═══════════════════════════════════════════════════════════════════════════

    fn render_node(
        &self,
        node: &UIComponent,
        scope: &Scope,
        key: &str,
        site: Site,
        env: &EvalEnv,
    ) -> Rendered {
        match self.guard.enter(site.depth) {
            GuardDecision::Proceed => {}
            GuardDecision::Halted => {
                env.diagnostics.warn_once(
                    DiagnosticKind::FrameBudgetExceeded,
                    "tick",
                    "render budget exceeded; interpretation halted until the next tick",
                );
                return Err(PassHalted);
            }
            GuardDecision::DepthExceeded { show_fallback } => {
                env.diagnostics.warn_once(
                    DiagnosticKind::DepthExceeded,
                    node.label(),
                    format!(
                        "render depth {} exceeds the limit of {}",
                        site.depth,
                        self.guard.max_depth()
                    ),
                );
                return Ok(if show_fallback {
                    vec![RenderNode::Fallback {
                        node_id: node.label().to_string(),
                        depth: site.depth,
                    }]
                } else {
                    Vec::new()
                });
            }
        }

        match evaluate_conditional(node, scope, env) {
            ConditionalOutcome::Unconditional => {}
            ConditionalOutcome::Empty(reason) => {
                tracing::trace!(node = node.label(), ?reason, "conditional rendered nothing");
                return Ok(Vec::new());
            }
            ConditionalOutcome::Branch(branch) => {
                return self.render_branch(branch, scope, key, site.deeper(), env);
            }
        }

        if node.is_slot() {
            return Ok(site.slot.map(<[RenderNode]>::to_vec).unwrap_or_default());
        }

        let mut props = self.resolve_props(node, scope, env);
        let handlers = bind_handlers(node, scope);

        if node.component_type.is_empty() {
            let children = self.render_children(node, scope, key, site.deeper(), env)?;
            return Ok(vec![RenderNode::Fragment {
                key: key.to_string(),
                children,
            }]);
        }

        let Some(renderable) = self.registry.resolve(&node.component_type) else {
            env.diagnostics.warn_once(
                DiagnosticKind::UnknownComponentType,
                &node.component_type,
                format!("no component registered for type '{}'", node.component_type),
            );
            return Ok(Vec::new());
        };

        if let Some(entry) = self
            .registry
            .entry(&node.component_type)
            .filter(RegistryEntry::is_deprecated)
        {
            let message = match entry.deprecated.as_ref().and_then(|d| d.notice()) {
                Some(notice) => format!(
                    "component type '{}' is deprecated: {}",
                    node.component_type, notice
                ),
                None => format!("component type '{}' is deprecated", node.component_type),
            };
            env.diagnostics
                .warn_once(DiagnosticKind::DeprecatedComponent, &node.component_type, message);
        }

        if let Renderable::Composite { name, definition } = &renderable {
            return self.render_composite(
                node, name, definition, props, handlers, scope, key, site, env,
            );
        }

        let children = self.render_children(node, scope, key, site.deeper(), env)?;
        attach_handlers(&mut props, &handlers);

        Ok(vec![RenderNode::Element(ElementNode {
            key: key.to_string(),
            id: node.id.clone(),
            component_type: node.component_type.clone(),
            renderable,
            props,
            handlers,
            children,
        })])
    }

    fn render_branch(
        &self,
        branch: &Branch,
        scope: &Scope,
        key: &str,
        site: Site,
        env: &EvalEnv,
    ) -> Rendered {
        match branch {
            Branch::Text(text) => Ok(vec![RenderNode::Text {
                text: interpolate(text, scope, env),
            }]),
            Branch::Node(node) => {
                let key = if node.id.is_empty() { key } else { node.id.as_str() };
                self.render_node(node, scope, key, site, env)
            }
            Branch::Nodes(nodes) => {
                let mut out = Vec::with_capacity(nodes.len());
                for (index, child) in nodes.iter().enumerate() {
                    let child_key = child_key(key, child, index, false);
                    out.extend(self.render_node(child, scope, &child_key, site, env)?);
                }
                Ok(out)
            }
        }
    }

    /// Children of `node`, expanded once per loop item when it loops.
    fn render_children(
        &self,
        node: &UIComponent,
        scope: &Scope,
        key: &str,
        site: Site,
        env: &EvalEnv,
    ) -> Rendered {
        let Some(repeat) = &node.repeat else {
            return self.render_child_list(node, scope, key, false, site, env);
        };

        let items = expand_loop(repeat, scope, env);
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            // gated items keep their slot
            let children = if item.included {
                let local = scope.rebind(&item.context);
                let parent = format!("{}[{}]", key, item.key);
                self.render_child_list(node, &local, &parent, true, site, env)?
            } else {
                Vec::new()
            };
            out.push(RenderNode::Fragment {
                key: item.key,
                children,
            });
        }
        Ok(out)
    }

    fn render_child_list(
        &self,
        node: &UIComponent,
        scope: &Scope,
        parent_key: &str,
        in_loop: bool,
        site: Site,
        env: &EvalEnv,
    ) -> Rendered {
        match &node.children {
            None => Ok(Vec::new()),
            Some(Children::Text(text)) => Ok(vec![RenderNode::Text {
                text: interpolate(text, scope, env),
            }]),
            Some(_) => {
                let children = node.child_nodes();
                let mut out = Vec::with_capacity(children.len());
                for (index, child) in children.iter().enumerate() {
                    let key = child_key(parent_key, child, index, in_loop);
                    out.extend(self.render_node(child, scope, &key, site, env)?);
                }
                Ok(out)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn render_composite(
        &self,
        node: &UIComponent,
        name: &str,
        definition: &UIComponent,
        props: Map<String, Value>,
        handlers: Vec<BoundHandler>,
        scope: &Scope,
        key: &str,
        site: Site,
        env: &EvalEnv,
    ) -> Rendered {
        if site.active.iter().any(|active| active == name) {
            env.diagnostics.warn_once(
                DiagnosticKind::CircularDefinition,
                name,
                format!(
                    "'{}' is already being rendered ({} -> {}); rendering nothing",
                    name,
                    site.active.join(" -> "),
                    name
                ),
            );
            return Ok(Vec::new());
        }

        // instance children render in the caller's scope
        let slot = self.render_children(node, scope, key, site.deeper(), env)?;

        let context = scope.context.with("props", Value::Object(props));
        let inner_scope = scope.rebind(&context);
        let mut active = site.active.to_vec();
        active.push(name.to_string());
        let inner = Site {
            depth: site.depth + 1,
            active: &active,
            slot: Some(&slot),
        };

        let mut nodes = self.render_node(definition, &inner_scope, key, inner, env)?;
        if !handlers.is_empty() {
            if let Some(RenderNode::Element(root)) = nodes.first_mut() {
                attach_handlers(&mut root.props, &handlers);
                root.handlers.extend(handlers);
            }
        }
        Ok(nodes)
    }

    fn resolve_props(&self, node: &UIComponent, scope: &Scope, env: &EvalEnv) -> Map<String, Value> {
        let mut props = interpolate_props(&node.props, scope, env);

        for (name, binding) in &node.bindings {
            match resolve_binding(binding, scope, env) {
                Some(value) => {
                    props.insert(name.clone(), value);
                }
                None => {
                    props.remove(name);
                }
            }
        }

        if let Some(binding) = &node.data_binding {
            if let Some(value) = resolve_binding(binding, scope, env) {
                let target = if value.is_array() || value.is_object() {
                    "data"
                } else {
                    "value"
                };
                props.insert(target.to_string(), value);
            }
        }

        if let Some(class_name) = node.class_name.as_deref() {
            let class_name = interpolate(class_name, scope, env);
            let class_name = class_name.trim();
            if !class_name.is_empty() {
                let merged = match props
                    .get("className")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                {
                    Some(existing) => format!("{} {}", existing, class_name),
                    None => class_name.to_string(),
                };
                props.insert("className".to_string(), Value::String(merged));
            }
        }

        if let Some(style) = &node.style {
            let mut merged = props
                .get("style")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            for (property, value) in style {
                merged.insert(property.clone(), interpolate_value(value, scope, env));
            }
            props.insert("style".to_string(), Value::Object(merged));
        }

        props
    }
}

fn bind_handlers(node: &UIComponent, scope: &Scope) -> Vec<BoundHandler> {
    let Some(events) = &node.events else {
        return Vec::new();
    };
    normalize_events(events)
        .into_iter()
        .map(|handler| BoundHandler {
            node_id: node.id.clone(),
            host_name: host_event_name(&handler.event),
            event: handler.event,
            actions: handler.actions,
            condition: handler.condition,
            context: scope.context.clone(),
        })
        .collect()
}

/// Handlers win over data-derived props of the same host name.
fn attach_handlers(props: &mut Map<String, Value>, handlers: &[BoundHandler]) {
    for handler in handlers {
        if props.remove(&handler.host_name).is_some() {
            tracing::debug!(
                node = %handler.node_id,
                prop = %handler.host_name,
                "prop shadowed by event handler"
            );
        }
    }
}

/// Declared ids are stable keys outside loops; inside a loop every item
/// repeats the same ids, so keys are positional under the item key.
fn child_key(parent: &str, child: &UIComponent, index: usize, in_loop: bool) -> String {
    if !child.id.is_empty() && !in_loop {
        child.id.clone()
    } else if !child.id.is_empty() {
        format!("{}.{}", parent, child.id)
    } else {
        format!("{}.{}", parent, index)
    }
}
