//! Event normalization and conditional dispatch.
//!
//! Authored documents declare events in three shapes (a legacy handler
//! list, a map to one definition, a map to many). All of them collapse into
//! `EventHandler { event, actions, condition }` keyed by the canonical event
//! name, so `onClick` and `click` reach the same dispatch target.

use serde_json::{Map, Value};

use crate::expression::{evaluate_condition, EvalEnv};
use crate::schema::{Action, EventDefinition, EventHandler, EventSpec, EventsField, LegacyHandler};
use crate::scope::Scope;

/// `onClick` → `click`, `click` → `click`, `onload` → `onload`.
pub fn canonical_event_name(name: &str) -> String {
    let name = name.trim();
    if let Some(rest) = name.strip_prefix("on") {
        let mut chars = rest.chars();
        if let Some(first) = chars.next() {
            if first.is_uppercase() {
                return first.to_lowercase().chain(chars).collect();
            }
        }
    }
    name.to_string()
}

/// `click` → `onClick`.
pub fn host_event_name(canonical: &str) -> String {
    let mut chars = canonical.chars();
    match chars.next() {
        Some(first) => format!("on{}{}", first.to_uppercase(), chars.as_str()),
        None => "on".to_string(),
    }
}

pub fn normalize_events(field: &EventsField) -> Vec<EventHandler> {
    match field {
        EventsField::Handlers(handlers) => handlers.iter().map(normalize_legacy).collect(),
        EventsField::Map(map) => {
            let mut handlers = Vec::new();
            for (name, spec) in map {
                let event = canonical_event_name(name);
                let definitions: &[EventDefinition] = match spec {
                    EventSpec::One(definition) => std::slice::from_ref(definition),
                    EventSpec::Many(definitions) => definitions,
                };
                for definition in definitions {
                    handlers.push(normalize_definition(&event, definition));
                }
            }
            handlers
        }
    }
}

fn normalize_definition(event: &str, definition: &EventDefinition) -> EventHandler {
    match definition {
        EventDefinition::ActionId(id) => EventHandler {
            event: event.to_string(),
            actions: vec![Action::custom(id, None)],
            condition: None,
        },
        EventDefinition::Single(single) => EventHandler {
            event: event.to_string(),
            actions: vec![Action::custom(&single.action, single.payload.clone())],
            condition: single.condition.clone(),
        },
        EventDefinition::Multi(multi) => EventHandler {
            event: event.to_string(),
            actions: with_payload(&multi.actions, multi.payload.as_ref()),
            condition: multi.condition.clone(),
        },
    }
}

fn normalize_legacy(handler: &LegacyHandler) -> EventHandler {
    let actions = if !handler.actions.is_empty() {
        with_payload(&handler.actions, handler.payload.as_ref())
    } else if let Some(action) = &handler.action {
        vec![Action::custom(action, handler.payload.clone())]
    } else {
        Vec::new()
    };
    EventHandler {
        event: canonical_event_name(&handler.event),
        actions,
        condition: handler.condition.clone(),
    }
}

/// Actions that declare their own `params` keep them.
fn with_payload(actions: &[Action], payload: Option<&Map<String, Value>>) -> Vec<Action> {
    actions
        .iter()
        .map(|action| {
            let mut action = action.clone();
            if action.params.is_none() {
                action.params = payload.cloned();
            }
            action
        })
        .collect()
}

/// Evaluate the handler's condition and, if it holds, hand the handler to
/// `dispatch`. Returns whether dispatch happened.
pub fn fire_handler<F>(handler: &EventHandler, scope: &Scope, env: &EvalEnv, dispatch: F) -> bool
where
    F: FnOnce(&EventHandler),
{
    if let Some(condition) = handler.condition.as_deref().filter(|c| !c.trim().is_empty()) {
        if !evaluate_condition(condition, scope, env) {
            tracing::trace!(event = %handler.event, condition, "handler condition false; not dispatching");
            return false;
        }
    }
    dispatch(handler);
    true
}
