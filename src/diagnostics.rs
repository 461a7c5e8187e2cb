//! Render-time diagnostics.
//!
//! Nothing the interpreter encounters at render time is fatal. Each fault is
//! logged through `tracing` and recorded here so the host can inspect what
//! degraded during a pass.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashSet;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticKind {
    UnknownComponentType,
    UnsupportedExpression,
    CircularDefinition,
    DepthExceeded,
    FrameBudgetExceeded,
    UndefinedBinding,
    DeprecatedComponent,
    LoopSourceNotArray,
}

impl DiagnosticKind {
    fn is_error(self) -> bool {
        matches!(self, DiagnosticKind::FrameBudgetExceeded)
    }

    fn is_debug(self) -> bool {
        matches!(
            self,
            DiagnosticKind::UndefinedBinding | DiagnosticKind::LoopSourceNotArray
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Expression text, component type or node id the diagnostic is about.
    pub site: String,
    pub message: String,
}

/// Collector for one render pass.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: RefCell<Vec<Diagnostic>>,
    seen: RefCell<HashSet<(DiagnosticKind, String)>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: DiagnosticKind, site: &str, message: impl Into<String>) {
        let message = message.into();
        if kind.is_error() {
            error!(?kind, site, "{}", message);
        } else if kind.is_debug() {
            debug!(?kind, site, "{}", message);
        } else {
            warn!(?kind, site, "{}", message);
        }
        self.entries.borrow_mut().push(Diagnostic {
            kind,
            site: site.to_string(),
            message,
        });
    }

    /// Record only the first occurrence of `(kind, site)` in this pass.
    pub fn warn_once(&self, kind: DiagnosticKind, site: &str, message: impl Into<String>) {
        let first = self.seen.borrow_mut().insert((kind, site.to_string()));
        if first {
            self.record(kind, site, message);
        }
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|d| d.kind == kind)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries.into_inner()
    }
}
