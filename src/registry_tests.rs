//! Component Registry Tests
//!
//! Resolution order across the five tiers, memoization, manifests and
//! on-disk definitions.

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::registry::{ComponentRegistry, LoadState, ModuleLoader, Renderable};
    use crate::schema::{RegistryManifest, SourceTier};
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manifest(value: serde_json::Value) -> RegistryManifest {
        serde_json::from_value(value).unwrap()
    }

    /// Loader that reports `Ready` for one export and counts its calls.
    struct CountingLoader {
        export: &'static str,
        calls: AtomicUsize,
    }

    impl ModuleLoader for CountingLoader {
        fn load(&self, _type_name: &str, export_name: &str) -> LoadState {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if export_name == self.export {
                LoadState::Ready(Renderable::element(export_name, SourceTier::Module))
            } else {
                LoadState::Missing
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // TIER ORDER
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_eager_tier_wins_over_later_tiers() {
        let registry = ComponentRegistry::with_builtin_primitives();
        let loader = Arc::new(CountingLoader {
            export: "div",
            calls: AtomicUsize::new(0),
        });
        registry.register_module("./shadow/div.js", loader.clone());
        registry.register_json_definition("div", r#"{"type": "span"}"#);
        registry.register_icons(["div"]);

        assert_eq!(
            registry.resolve("div"),
            Some(Renderable::element("div", SourceTier::Primitive))
        );
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wrapper_substitution_comes_first() {
        let registry = ComponentRegistry::from_manifest(manifest(json!({
            "components": [
                {"key": "Dialog", "sourceTier": "ui", "wrapperRequired": true, "wrapperComponent": "SafeDialog"},
                {"key": "SafeDialog", "sourceTier": "ui"}
            ]
        })))
        .unwrap();

        assert_eq!(
            registry.resolve("Dialog"),
            Some(Renderable::element("SafeDialog", SourceTier::Ui))
        );
    }

    #[test]
    fn test_module_tier_precedes_json_and_is_memoized() {
        let registry = ComponentRegistry::with_builtin_primitives();
        let loader = Arc::new(CountingLoader {
            export: "Chart",
            calls: AtomicUsize::new(0),
        });
        registry.register_module("./widgets/Chart.js", loader.clone());
        registry.register_json_definition("Chart", r#"{"type": "div"}"#);

        let first = registry.resolve("Chart");
        let second = registry.resolve("Chart");
        assert_eq!(first, Some(Renderable::element("Chart", SourceTier::Module)));
        assert_eq!(first, second);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_preload_keeps_module_precedence() {
        let registry = ComponentRegistry::with_builtin_primitives();
        let loader = Arc::new(CountingLoader {
            export: "Chart",
            calls: AtomicUsize::new(0),
        });
        registry.register_module("./widgets/Chart.js", loader.clone());
        registry.register_json_definition("Chart", r#"{"type": "div"}"#);
        registry.register_json_definition("Panel", r#"{"type": "section"}"#);

        assert_eq!(registry.preload(), 2);
        assert_eq!(
            registry.resolve("Chart"),
            Some(Renderable::element("Chart", SourceTier::Module))
        );
        assert!(matches!(
            registry.resolve("Panel"),
            Some(Renderable::Composite { name, .. }) if name == "Panel"
        ));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_module_shadows_memoized_json() {
        let registry = ComponentRegistry::with_builtin_primitives();
        registry.register_json_definition("Chart", r#"{"type": "div"}"#);
        assert!(matches!(
            registry.resolve("Chart"),
            Some(Renderable::Composite { .. })
        ));

        registry.register_module(
            "./widgets/Chart.js",
            Arc::new(CountingLoader {
                export: "Chart",
                calls: AtomicUsize::new(0),
            }),
        );
        assert_eq!(
            registry.resolve("Chart"),
            Some(Renderable::element("Chart", SourceTier::Module))
        );
    }

    #[test]
    fn test_manifest_load_path_selects_loader() {
        let registry = ComponentRegistry::from_manifest(manifest(json!({
            "components": [
                {"key": "Map", "exportName": "GeoMap", "sourceTier": "module", "loadPath": "./lazy/geo.js"}
            ]
        })))
        .unwrap();
        registry.register_module(
            "./lazy/geo.js",
            Arc::new(|_: &str, export: &str| {
                LoadState::Ready(Renderable::element(export, SourceTier::Module))
            }),
        );

        assert_eq!(
            registry.resolve("Map"),
            Some(Renderable::element("GeoMap", SourceTier::Module))
        );
    }

    #[test]
    fn test_pending_module_is_not_memoized() {
        let registry = ComponentRegistry::new();
        let ready = Arc::new(AtomicUsize::new(0));
        let flag = ready.clone();
        registry.register_module(
            "Lazy.js",
            Arc::new(move |_: &str, export: &str| {
                if flag.load(Ordering::SeqCst) == 0 {
                    LoadState::Pending
                } else {
                    LoadState::Ready(Renderable::element(export, SourceTier::Module))
                }
            }),
        );

        assert_eq!(registry.resolve("Lazy"), None);
        ready.store(1, Ordering::SeqCst);
        assert_eq!(
            registry.resolve("Lazy"),
            Some(Renderable::element("Lazy", SourceTier::Module))
        );
    }

    #[test]
    fn test_json_definition_resolves_to_composite() {
        let registry = ComponentRegistry::new();
        registry.register_json_definition("Card", r#"{"type": "section", "children": "hi"}"#);

        match registry.resolve("Card") {
            Some(Renderable::Composite { name, definition }) => {
                assert_eq!(name, "Card");
                assert_eq!(definition.component_type, "section");
            }
            other => panic!("expected composite, got {:?}", other),
        }
    }

    #[test]
    fn test_broken_json_definition_is_unresolvable() {
        let registry = ComponentRegistry::new();
        registry.register_json_definition("Bad", "{ not json");
        assert_eq!(registry.resolve("Bad"), None);
        assert!(!registry.has_component("Bad"));

        // re-registering clears the broken state
        registry.register_json_definition("Bad", r#"{"type": "div"}"#);
        assert!(registry.has_component("Bad"));
    }

    #[test]
    fn test_icons_are_the_last_resort() {
        let registry = ComponentRegistry::new();
        registry.register_icons(["Search", "close"]);

        assert_eq!(registry.resolve("SearchIcon"), Some(Renderable::Icon { name: "Search".into() }));
        assert_eq!(registry.resolve("close"), Some(Renderable::Icon { name: "close".into() }));
        assert_eq!(registry.resolve("Missing"), None);
        assert_eq!(registry.resolve("Icon"), None);
    }

    #[test]
    fn test_empty_type_never_resolves() {
        assert_eq!(ComponentRegistry::with_builtin_primitives().resolve(""), None);
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // MANIFESTS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_manifest_rejects_duplicate_keys() {
        let result = ComponentRegistry::from_manifest(manifest(json!({
            "components": [{"key": "Card"}, {"key": "Card"}]
        })));
        assert!(matches!(result, Err(Error::Manifest(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_manifest_rejects_wrapper_without_target() {
        let result = ComponentRegistry::from_manifest(manifest(json!({
            "components": [{"key": "Card", "wrapperRequired": true}]
        })));
        assert!(matches!(result, Err(Error::Manifest(_))));
    }

    #[test]
    fn test_manifest_file_rebases_json_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("defs")).unwrap();
        fs::write(dir.path().join("defs/Hero.json"), r#"{"type": "header"}"#).unwrap();
        fs::write(
            dir.path().join("registry.json"),
            r#"{"components": [{"key": "Hero", "sourceTier": "json", "loadPath": "defs/Hero.json"}]}"#,
        )
        .unwrap();

        let registry = ComponentRegistry::load_manifest_file(&dir.path().join("registry.json")).unwrap();
        assert!(matches!(registry.resolve("Hero"), Some(Renderable::Composite { .. })));
    }

    #[test]
    fn test_missing_manifest_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ComponentRegistry::load_manifest_file(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn test_deprecated_entries_still_resolve() {
        let registry = ComponentRegistry::from_manifest(manifest(json!({
            "components": [{"key": "OldCard", "sourceTier": "ui", "deprecated": true}]
        })))
        .unwrap();
        assert!(registry.is_deprecated("OldCard"));
        assert!(registry.resolve("OldCard").is_some());
        assert!(!registry.is_deprecated("div"));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // DISCOVERY AND PRELOAD
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_discover_and_preload() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("cards")).unwrap();
        fs::write(dir.path().join("cards/UserCard.json"), r#"{"type": "article"}"#).unwrap();
        fs::write(dir.path().join("Footer.json"), r#"{"type": "footer"}"#).unwrap();
        fs::write(dir.path().join("Broken.json"), "nope").unwrap();

        let registry = ComponentRegistry::with_builtin_primitives();
        assert_eq!(registry.discover_json_components(dir.path()), 3);
        assert_eq!(registry.preload(), 2);

        // files can go away once preloaded
        fs::remove_file(dir.path().join("Footer.json")).unwrap();
        assert!(matches!(registry.resolve("Footer"), Some(Renderable::Composite { .. })));
        assert!(registry.has_component("UserCard"));
        assert!(!registry.has_component("Broken"));
    }
}
