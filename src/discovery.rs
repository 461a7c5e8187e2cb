//! Discovery of on-disk JSON component definitions.
//!
//! Recursively scans a directory for `*.json` files; each file stem becomes
//! a component type name resolved through the pure-JSON registry tier.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// ═══════════════════════════════════════════════════════════════════════════════
// COMPONENT DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

/// A definition file found on disk, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredComponent {
    pub name: String,
    pub path: PathBuf,
}

/// Discover all JSON component definitions under `base_dir`.
///
/// A missing directory yields nothing. Files are returned in path order so
/// that a name collision resolves the same way on every run: the first path
/// wins.
pub fn discover_json_components(base_dir: &Path) -> Vec<DiscoveredComponent> {
    if !base_dir.exists() {
        tracing::debug!(dir = %base_dir.display(), "component directory does not exist");
        return Vec::new();
    }

    let mut files = find_json_files(base_dir);
    files.sort();

    let mut components: Vec<DiscoveredComponent> = Vec::with_capacity(files.len());
    for path in files {
        let Some(name) = component_name(&path) else {
            tracing::warn!(path = %path.display(), "skipping component file with a non UTF-8 name");
            continue;
        };
        if let Some(existing) = components.iter().find(|c| c.name == name) {
            tracing::warn!(
                component = %name,
                kept = %existing.path.display(),
                ignored = %path.display(),
                "duplicate component name"
            );
            continue;
        }
        components.push(DiscoveredComponent { name, path });
    }

    tracing::debug!(dir = %base_dir.display(), count = components.len(), "discovered JSON components");
    components
}

/// Recursively find all .json files in a directory
fn find_json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).follow_links(true).into_iter().flatten() {
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path.to_path_buf());
        }
    }

    files
}

/// Component name from the file stem: `cards/UserCard.json` → `UserCard`.
pub fn component_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
