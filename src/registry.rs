//! Component registry: maps a node's `type` string to something renderable.
//!
//! ## Resolution Order
//!
//! Resolution is a strict fallback chain. Later tiers are permissive
//! catch-alls, so the order is what keeps them from shadowing real matches:
//!
//! 1. **Wrapper override**: a manifest entry that requires substitution by
//!    another named component. Wrapper chains are followed with a visited
//!    set; a cycle resolves to nothing.
//! 2. **Eager map**: built-in primitives, UI wrappers and anything
//!    registered at runtime.
//! 3. **Module loaders**: matched by the entry's `loadPath`, or by a loader
//!    whose file stem matches the export or type name. A loader may report
//!    `Pending`; that is "not found" for this pass and is not memoized.
//! 4. **Pure-JSON definitions**: inline sources or files, parsed lazily.
//! 5. **Icons**: registered icon names, tried last.
//!
//! Tiers 3 to 5 are memoized per type. Tiers 1 and 2 are plain map reads.
//!
//! ## Sharing
//!
//! The registry is process-scoped and shared behind an `Arc`. Every tier
//! sits behind its own `RwLock`; reads vastly outnumber registrations.

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::discovery;
use crate::error::{Error, Result};
use crate::schema::{RegistryEntry, RegistryManifest, SourceTier, UIComponent};

/// HTML elements available without any manifest.
pub const BUILTIN_PRIMITIVES: &[&str] = &[
    "div", "span", "p", "a", "button", "input", "textarea", "select", "option", "label", "form",
    "img", "ul", "ol", "li", "table", "thead", "tbody", "tr", "th", "td", "section", "article",
    "header", "footer", "nav", "main", "aside", "h1", "h2", "h3", "h4", "h5", "h6", "strong", "em",
    "small", "code", "pre", "br", "hr",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Renderable {
    /// A host element or framework component, rendered by tag name.
    Element { tag: String, tier: SourceTier },
    /// A pure-JSON definition, interpreted in place of the instance.
    Composite {
        name: String,
        #[serde(skip_serializing)]
        definition: Arc<UIComponent>,
    },
    Icon { name: String },
}

impl Renderable {
    pub fn element(tag: &str, tier: SourceTier) -> Self {
        Renderable::Element {
            tag: tag.to_string(),
            tier,
        }
    }

    pub fn tier(&self) -> SourceTier {
        match self {
            Renderable::Element { tier, .. } => *tier,
            Renderable::Composite { .. } => SourceTier::Json,
            Renderable::Icon { .. } => SourceTier::Icon,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Ready(Renderable),
    /// Still loading; the next pass retries.
    Pending,
    Missing,
}

/// A lazily loaded module (tier 3).
pub trait ModuleLoader: Send + Sync {
    fn load(&self, type_name: &str, export_name: &str) -> LoadState;
}

impl<F> ModuleLoader for F
where
    F: Fn(&str, &str) -> LoadState + Send + Sync,
{
    fn load(&self, type_name: &str, export_name: &str) -> LoadState {
        self(type_name, export_name)
    }
}

#[derive(Debug, Clone)]
enum JsonSource {
    Inline(String),
    File(PathBuf),
    Parsed(Arc<UIComponent>),
    /// Failed to read or parse; not retried until re-registered.
    Broken,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct ComponentRegistry {
    entries: RwLock<IndexMap<String, RegistryEntry>>,
    eager: RwLock<HashMap<String, Renderable>>,
    modules: RwLock<IndexMap<String, Arc<dyn ModuleLoader>>>,
    json: RwLock<HashMap<String, JsonSource>>,
    icons: RwLock<HashSet<String>>,
    memo: RwLock<HashMap<String, Renderable>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("entries", &read(&self.entries).len())
            .field("eager", &read(&self.eager).len())
            .field("modules", &read(&self.modules).len())
            .field("json", &read(&self.json).len())
            .field("icons", &read(&self.icons).len())
            .field("memoized", &read(&self.memo).len())
            .finish()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_primitives() -> Self {
        let registry = Self::new();
        {
            let mut eager = write(&registry.eager);
            for tag in BUILTIN_PRIMITIVES {
                eager.insert(tag.to_string(), Renderable::element(tag, SourceTier::Primitive));
            }
        }
        registry
    }

    /// Built-in primitives plus every manifest entry.
    pub fn from_manifest(manifest: RegistryManifest) -> Result<Self> {
        let registry = Self::with_builtin_primitives();
        let mut seen = HashSet::new();
        for entry in manifest.components {
            if entry.key.is_empty() {
                return Err(Error::Manifest("entry with an empty key".to_string()));
            }
            if !seen.insert(entry.key.clone()) {
                return Err(Error::Manifest(format!("duplicate key '{}'", entry.key)));
            }
            if entry.wrapper_required && entry.wrapper().is_none() {
                return Err(Error::Manifest(format!(
                    "'{}' requires a wrapper but names no wrapperComponent",
                    entry.key
                )));
            }
            registry.register_entry(entry);
        }
        registry.register_icons(manifest.icons);
        Ok(registry)
    }

    pub fn load_manifest_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let manifest: RegistryManifest = serde_json::from_str(&source)?;
        let mut registry = Self::from_manifest(manifest)?;

        // relative JSON load paths are relative to the manifest
        if let Some(base) = path.parent() {
            registry.rebase_json_files(base);
        }
        tracing::debug!(path = %path.display(), "loaded registry manifest");
        Ok(registry)
    }

    fn rebase_json_files(&mut self, base: &Path) {
        let json = self.json.get_mut().unwrap_or_else(PoisonError::into_inner);
        for source in json.values_mut() {
            if let JsonSource::File(file) = source {
                if file.is_relative() {
                    *file = base.join(&*file);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REGISTRATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Record a manifest entry. Primitive and UI entries become eager
    /// elements; JSON entries with a `loadPath` become lazy definitions;
    /// icon entries join the icon set.
    pub fn register_entry(&self, entry: RegistryEntry) {
        match entry.source_tier {
            SourceTier::Primitive | SourceTier::Ui if entry.wrapper().is_none() => {
                let renderable = Renderable::element(entry.export_name(), entry.source_tier);
                write(&self.eager).insert(entry.key.clone(), renderable);
            }
            SourceTier::Json => {
                if let Some(load_path) = entry.load_path.as_deref() {
                    self.register_json_file(&entry.key, load_path);
                }
            }
            SourceTier::Icon => {
                write(&self.icons).insert(entry.key.clone());
            }
            _ => {}
        }
        write(&self.memo).remove(&entry.key);
        write(&self.entries).insert(entry.key.clone(), entry);
    }

    /// Register a concrete renderable (tier 2). Idempotent.
    pub fn register(&self, type_name: &str, renderable: Renderable) {
        write(&self.eager).insert(type_name.to_string(), renderable);
    }

    /// Register a module loader (tier 3). Loaders match by file stem, so any
    /// memoized JSON or icon result may now be shadowed; the memo is dropped.
    pub fn register_module(&self, load_path: &str, loader: Arc<dyn ModuleLoader>) {
        write(&self.modules).insert(load_path.to_string(), loader);
        write(&self.memo).clear();
    }

    /// Register a JSON definition source, parsed on first resolution.
    pub fn register_json_definition(&self, name: &str, source: impl Into<String>) {
        self.set_json(name, JsonSource::Inline(source.into()));
    }

    pub fn register_json_component(&self, name: &str, definition: UIComponent) {
        self.set_json(name, JsonSource::Parsed(Arc::new(definition)));
    }

    pub fn register_json_file(&self, name: &str, path: impl Into<PathBuf>) {
        self.set_json(name, JsonSource::File(path.into()));
    }

    fn set_json(&self, name: &str, source: JsonSource) {
        write(&self.json).insert(name.to_string(), source);
        write(&self.memo).remove(name);
    }

    pub fn register_icons<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut icons = write(&self.icons);
        for name in names {
            icons.insert(name.into());
        }
    }

    /// Register every `*.json` file under `dir` as a lazy definition named by
    /// its file stem. Returns how many were registered.
    pub fn discover_json_components(&self, dir: &Path) -> usize {
        let found = discovery::discover_json_components(dir);
        let count = found.len();
        for component in found {
            self.register_json_file(&component.name, component.path);
        }
        count
    }

    /// Parse every pending JSON definition in parallel. Parsed definitions
    /// still go through the full chain on resolution, so a module loader for
    /// the same type keeps precedence. Returns how many parsed successfully.
    pub fn preload(&self) -> usize {
        let pending: Vec<(String, JsonSource)> = read(&self.json)
            .iter()
            .filter(|(_, source)| matches!(source, JsonSource::Inline(_) | JsonSource::File(_)))
            .map(|(name, source)| (name.clone(), source.clone()))
            .collect();

        let parsed: Vec<(String, Option<Arc<UIComponent>>)> = pending
            .into_par_iter()
            .map(|(name, source)| {
                let definition = parse_json_source(&name, &source);
                (name, definition)
            })
            .collect();

        let mut ok = 0;
        let mut json = write(&self.json);
        for (name, definition) in parsed {
            match definition {
                Some(definition) => {
                    ok += 1;
                    json.insert(name, JsonSource::Parsed(definition));
                }
                None => {
                    json.insert(name, JsonSource::Broken);
                }
            }
        }
        tracing::debug!(parsed = ok, "preloaded JSON components");
        ok
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RESOLUTION
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn entry(&self, type_name: &str) -> Option<RegistryEntry> {
        read(&self.entries).get(type_name).cloned()
    }

    pub fn is_deprecated(&self, type_name: &str) -> bool {
        read(&self.entries)
            .get(type_name)
            .is_some_and(RegistryEntry::is_deprecated)
    }

    pub fn has_component(&self, type_name: &str) -> bool {
        self.resolve(type_name).is_some()
    }

    pub fn resolve(&self, type_name: &str) -> Option<Renderable> {
        if type_name.is_empty() {
            return None;
        }
        let mut visited: Vec<String> = Vec::new();
        self.resolve_chain(type_name, &mut visited)
    }

    fn resolve_chain(&self, type_name: &str, visited: &mut Vec<String>) -> Option<Renderable> {
        if visited.iter().any(|v| v == type_name) {
            visited.push(type_name.to_string());
            tracing::warn!(chain = %visited.join(" -> "), "wrapper cycle; component cannot resolve");
            return None;
        }
        visited.push(type_name.to_string());

        let entry = self.entry(type_name);

        // tier 1
        if let Some(entry) = &entry {
            if let Some(wrapper) = entry.wrapper() {
                tracing::trace!(component = type_name, wrapper, "substituting wrapper");
                return self.resolve_chain(wrapper, visited);
            }
        }

        // tier 2
        if let Some(renderable) = read(&self.eager).get(type_name) {
            return Some(renderable.clone());
        }

        if let Some(renderable) = read(&self.memo).get(type_name) {
            return Some(renderable.clone());
        }

        let export_name = entry
            .as_ref()
            .map(|e| e.export_name().to_string())
            .unwrap_or_else(|| type_name.to_string());

        // tier 3
        let resolved = match self.load_module(type_name, &export_name, entry.as_ref()) {
            LoadState::Ready(renderable) => Some(renderable),
            LoadState::Pending => {
                tracing::debug!(component = type_name, "module still loading");
                return None;
            }
            // tiers 4 and 5
            LoadState::Missing => self
                .load_json(type_name)
                .or_else(|| self.match_icon(type_name)),
        };

        if let Some(renderable) = &resolved {
            write(&self.memo).insert(type_name.to_string(), renderable.clone());
        }
        resolved
    }

    fn load_module(
        &self,
        type_name: &str,
        export_name: &str,
        entry: Option<&RegistryEntry>,
    ) -> LoadState {
        let loader = {
            let modules = read(&self.modules);
            let declared = entry
                .and_then(|e| e.load_path.as_deref())
                .and_then(|path| modules.get(path));
            declared
                .or_else(|| {
                    modules.iter().find_map(|(path, loader)| {
                        let stem = Path::new(path).file_stem().and_then(|s| s.to_str())?;
                        (stem == export_name || stem == type_name).then_some(loader)
                    })
                })
                .cloned()
        };

        match loader {
            Some(loader) => loader.load(type_name, export_name),
            None => LoadState::Missing,
        }
    }

    fn load_json(&self, type_name: &str) -> Option<Renderable> {
        let source = read(&self.json).get(type_name).cloned()?;
        let definition = match source {
            JsonSource::Parsed(definition) => definition,
            JsonSource::Broken => return None,
            pending => match parse_json_source(type_name, &pending) {
                Some(definition) => {
                    write(&self.json)
                        .insert(type_name.to_string(), JsonSource::Parsed(definition.clone()));
                    definition
                }
                None => {
                    write(&self.json).insert(type_name.to_string(), JsonSource::Broken);
                    return None;
                }
            },
        };
        Some(Renderable::Composite {
            name: type_name.to_string(),
            definition,
        })
    }

    fn match_icon(&self, type_name: &str) -> Option<Renderable> {
        let icons = read(&self.icons);
        let bare = type_name.strip_suffix("Icon").filter(|s| !s.is_empty());
        icons
            .iter()
            .find(|icon| {
                icon.eq_ignore_ascii_case(type_name)
                    || bare.is_some_and(|b| icon.eq_ignore_ascii_case(b))
            })
            .map(|icon| Renderable::Icon { name: icon.clone() })
    }
}

fn parse_json_source(name: &str, source: &JsonSource) -> Option<Arc<UIComponent>> {
    let parsed = match source {
        JsonSource::Inline(text) => UIComponent::from_json(text),
        JsonSource::File(path) => fs::read_to_string(path)
            .map_err(|e| Error::io(path, e))
            .and_then(|text| UIComponent::from_json(&text)),
        JsonSource::Parsed(definition) => return Some(definition.clone()),
        JsonSource::Broken => return None,
    };
    match parsed {
        Ok(definition) => Some(Arc::new(definition)),
        Err(err) => {
            tracing::warn!(component = name, error = %err, "failed to load JSON component");
            None
        }
    }
}
