//! Node bindings. Every argument and result crosses the boundary as a JSON
//! string so the host needs no generated type definitions.

use lazy_static::lazy_static;
use napi_derive::napi;
use serde_json::Value;
use std::sync::Arc;

use crate::cache::DocumentCache;
use crate::config::RenderConfig;
use crate::events::normalize_events;
use crate::registry::ComponentRegistry;
use crate::render::Interpreter;
use crate::schema::{EventsField, RegistryManifest};
use crate::validate::validate_json;

lazy_static! {
    static ref DOCUMENTS: DocumentCache = DocumentCache::new();
}

fn reason(err: impl std::fmt::Display) -> napi::Error {
    napi::Error::from_reason(err.to_string())
}

fn registry_from(manifest: Option<String>) -> napi::Result<ComponentRegistry> {
    match manifest {
        Some(source) => {
            let manifest: RegistryManifest = serde_json::from_str(&source).map_err(reason)?;
            ComponentRegistry::from_manifest(manifest).map_err(reason)
        }
        None => Ok(ComponentRegistry::with_builtin_primitives()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

#[napi]
pub fn render_document_native(
    document: String,
    data: String,
    state: Option<String>,
    manifest: Option<String>,
    config: Option<String>,
) -> napi::Result<String> {
    let root = DOCUMENTS.parse(&document).map_err(reason)?;
    let data: Value = serde_json::from_str(&data).map_err(reason)?;
    let state: Option<Value> = state
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(reason)?;
    let config = match config {
        Some(source) => RenderConfig::from_json(&source).map_err(reason)?,
        None => RenderConfig::default(),
    };

    let interpreter = Interpreter::new(Arc::new(registry_from(manifest)?), config);
    let output = interpreter.render(&root, &data, state.as_ref());
    serde_json::to_string(&output).map_err(reason)
}

#[napi]
pub fn validate_document_native(document: String, manifest: Option<String>) -> napi::Result<String> {
    let registry = match manifest {
        Some(_) => Some(registry_from(manifest)?),
        None => None,
    };
    let report = validate_json(&document, registry.as_ref());
    serde_json::to_string(&report).map_err(reason)
}

#[napi]
pub fn normalize_events_native(events: String) -> napi::Result<String> {
    let field: EventsField = serde_json::from_str(&events).map_err(reason)?;
    serde_json::to_string(&normalize_events(&field)).map_err(reason)
}
