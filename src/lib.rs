//! # JSON UI Interpreter
//!
//! Turns declarative JSON component trees into an abstract render tree,
//! resolving data bindings, conditionals, loops and events against caller
//! supplied data and state.
//!
//! ## Interpretation Invariants
//!
//! 1. **Fail-open rendering**: `Interpreter::render` never returns an error.
//!    Unknown types, unsupported expressions, cycles and depth overruns all
//!    degrade locally and are reported as diagnostics.
//!
//! 2. **Restricted evaluation**: conditions and placeholders use a small
//!    expression grammar (paths, literals, `!`, comparisons, `||`
//!    fallbacks). Arrow-function transforms run in a sandbox that only
//!    sees the render scope. No source string is ever executed as code.
//!
//! 3. **Explicit scope threading**: loop and branch variables live in an
//!    immutable `RenderContext` that is extended, never mutated, on the way
//!    down. Siblings cannot observe each other's variables.
//!
//! 4. **Strict resolution order**: component types resolve through five
//!    tiers in a fixed order:
//!    1. Wrapper override
//!    2. Eager map (primitives, UI components, runtime registrations)
//!    3. Lazy module loaders
//!    4. Pure-JSON definitions
//!    5. Icons
//!
//! 5. **Bounded work**: recursion depth and interpreter calls per tick are
//!    capped by `RenderGuard`. A tripped budget halts the pass until the
//!    next tick boundary.
//!
//! 6. **Shared registry**: one `ComponentRegistry` per process, passed to
//!    each `Interpreter` through an `Arc`. It is safe to register and
//!    resolve from several threads.

pub mod binding;
pub mod cache;
pub mod config;
pub mod control_flow;
pub mod diagnostics;
pub mod discovery;
pub mod error;
pub mod events;
pub mod expression;
pub mod guard;
pub mod registry;
pub mod render;
pub mod sandbox;
pub mod schema;
pub mod scope;
pub mod validate;
pub mod value;

#[cfg(feature = "napi")]
mod bridge;

#[cfg(test)]
mod registry_tests;
#[cfg(test)]
mod render_tests;

#[cfg(feature = "napi")]
pub use bridge::{normalize_events_native, render_document_native, validate_document_native};

pub use cache::DocumentCache;
pub use config::{RenderConfig, TickCadence};
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use error::{Error, Result};
pub use events::normalize_events;
pub use registry::{ComponentRegistry, LoadState, ModuleLoader, Renderable};
pub use render::{
    BoundHandler, ElementNode, Interpreter, RenderNode, RenderOutput, RenderRequest, RenderStatus,
};
pub use schema::{EventHandler, RegistryEntry, RegistryManifest, UIComponent};
pub use validate::{validate_document, validate_json, ValidationIssue, ValidationReport};
