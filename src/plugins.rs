//! Plugin registry.
//!
//! A plugin is a closed record: manifest metadata plus optional hook
//! registrations, context probes and commands. Behavior comes from
//! `Plugin` trait objects registered in-process; the plugin directory is
//! scanned for JSON manifests (a bare `<name>.json` or a directory with
//! `plugin.json`) which load as inert metadata and share the same enable
//! state handling. Unknown manifest fields are ignored. Load failures
//! are reported per plugin and never abort discovery.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::hooks::{HookBus, HookFn, HookPoint};
use crate::probes::ContextProbe;

/// Plugin identity and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
}

/// One hook a plugin wants registered.
pub struct HookRegistration {
    pub point: HookPoint,
    /// Short handler name; the registry prefixes it with the plugin name.
    pub name: String,
    pub priority: i32,
    pub handler: HookFn,
}

/// A plugin command handler.
pub type CommandFn = Arc<dyn Fn(&[String]) -> Result<String> + Send + Sync>;

/// A plugin bundle.
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> PluginManifest;

    fn hooks(&self) -> Vec<HookRegistration> {
        Vec::new()
    }

    fn commands(&self) -> Vec<(String, CommandFn)> {
        Vec::new()
    }

    fn probes(&self) -> Vec<Arc<dyn ContextProbe>> {
        Vec::new()
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of loading one discovered plugin path.
#[derive(Debug)]
pub struct PluginLoadReport {
    pub path: PathBuf,
    pub result: Result<String>,
}

struct LoadedPlugin {
    manifest: PluginManifest,
    plugin: Option<Arc<dyn Plugin>>,
    enabled: bool,
}

/// Tracks plugins, wires their hooks and commands, persists enable state.
pub struct PluginRegistry {
    bus: Arc<HookBus>,
    state_path: PathBuf,
    plugins: RwLock<Vec<LoadedPlugin>>,
    commands: RwLock<HashMap<String, (String, CommandFn)>>,
}

impl PluginRegistry {
    /// Registry persisting enable state to `<root>/plugin-state.json`.
    pub fn new(root: impl AsRef<Path>, bus: Arc<HookBus>) -> Self {
        Self {
            bus,
            state_path: root.as_ref().join("plugin-state.json"),
            plugins: RwLock::new(Vec::new()),
            commands: RwLock::new(HashMap::new()),
        }
    }

    fn saved_state(&self) -> HashMap<String, bool> {
        match fs::read(&self.state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn persist_state(&self) -> Result<()> {
        let plugins = self.plugins.read().expect("plugin registry poisoned");
        let state: HashMap<String, bool> = plugins
            .iter()
            .map(|p| (p.manifest.name.clone(), p.enabled))
            .collect();
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&state)?;
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    fn wire(&self, plugin: &Arc<dyn Plugin>) -> Result<()> {
        let manifest = plugin.manifest();
        for registration in plugin.hooks() {
            self.bus.register(
                registration.point,
                format!("{}:{}", manifest.name, registration.name),
                registration.priority,
                registration.handler,
            );
        }

        let mut commands = self.commands.write().expect("plugin registry poisoned");
        for (command, handler) in plugin.commands() {
            match commands.entry(command.clone()) {
                std::collections::hash_map::Entry::Occupied(existing) => {
                    tracing::warn!(
                        command = %command,
                        winner = %existing.get().0,
                        loser = %manifest.name,
                        "command collision, first-loaded plugin wins"
                    );
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert((manifest.name.clone(), handler));
                }
            }
        }
        drop(commands);

        plugin.init()
    }

    fn unwire(&self, plugin: &Arc<dyn Plugin>) -> Result<()> {
        let manifest = plugin.manifest();
        let destroy_result = plugin.destroy();
        self.bus.unregister_prefix(&format!("{}:", manifest.name));

        let mut commands = self.commands.write().expect("plugin registry poisoned");
        commands.retain(|_, entry| entry.0 != manifest.name);
        drop(commands);

        destroy_result
    }

    /// Register an in-process plugin. It is enabled unless the sidecar
    /// has it recorded as disabled.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let manifest = plugin.manifest();
        if manifest.name.trim().is_empty() {
            return Err(Error::InvalidInput("plugin name must not be empty".into()));
        }
        {
            let plugins = self.plugins.read().expect("plugin registry poisoned");
            if plugins.iter().any(|p| p.manifest.name == manifest.name) {
                return Err(Error::InvalidInput(format!(
                    "plugin {} already registered",
                    manifest.name
                )));
            }
        }

        let enabled = *self.saved_state().get(&manifest.name).unwrap_or(&true);
        if enabled {
            self.wire(&plugin)?;
        }

        self.plugins
            .write()
            .expect("plugin registry poisoned")
            .push(LoadedPlugin {
                manifest,
                plugin: Some(plugin),
                enabled,
            });
        self.persist_state()
    }

    /// Scan a directory for plugin manifests. Both forms are accepted:
    /// `<dir>/<name>.json` and `<dir>/<name>/plugin.json`.
    pub fn discover(&self, dir: impl AsRef<Path>) -> Vec<PluginLoadReport> {
        let mut reports = Vec::new();
        let entries = match fs::read_dir(dir.as_ref()) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.as_ref().display(), error = %e, "no plugin directory");
                return reports;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let manifest_path = if path.is_dir() {
                let candidate = path.join("plugin.json");
                if !candidate.exists() {
                    continue;
                }
                candidate
            } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                path.clone()
            } else {
                continue;
            };

            let result = self.load_manifest(&manifest_path);
            if let Err(e) = &result {
                tracing::warn!(path = %manifest_path.display(), error = %e, "plugin failed to load");
            }
            reports.push(PluginLoadReport { path, result });
        }
        reports
    }

    fn load_manifest(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path)?;
        let manifest: PluginManifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidInput(format!("bad manifest: {}", e)))?;
        if manifest.name.trim().is_empty() {
            return Err(Error::InvalidInput("manifest has no name".into()));
        }

        let name = manifest.name.clone();
        {
            let plugins = self.plugins.read().expect("plugin registry poisoned");
            if plugins.iter().any(|p| p.manifest.name == name) {
                return Ok(name); // already known, keep the first load
            }
        }

        let enabled = *self.saved_state().get(&name).unwrap_or(&true);
        self.plugins
            .write()
            .expect("plugin registry poisoned")
            .push(LoadedPlugin {
                manifest,
                plugin: None,
                enabled,
            });
        self.persist_state()?;
        Ok(name)
    }

    /// Enable a plugin: wire hooks and commands, invoke `init`.
    pub fn enable(&self, name: &str) -> Result<()> {
        let plugin = {
            let mut plugins = self.plugins.write().expect("plugin registry poisoned");
            let entry = plugins
                .iter_mut()
                .find(|p| p.manifest.name == name)
                .ok_or_else(|| Error::NotFound(format!("plugin {}", name)))?;
            if entry.enabled {
                return Ok(());
            }
            entry.enabled = true;
            entry.plugin.clone()
        };
        if let Some(plugin) = plugin {
            self.wire(&plugin)?;
        }
        self.persist_state()
    }

    /// Disable a plugin: invoke `destroy`, unregister hooks and commands.
    pub fn disable(&self, name: &str) -> Result<()> {
        let plugin = {
            let mut plugins = self.plugins.write().expect("plugin registry poisoned");
            let entry = plugins
                .iter_mut()
                .find(|p| p.manifest.name == name)
                .ok_or_else(|| Error::NotFound(format!("plugin {}", name)))?;
            if !entry.enabled {
                return Ok(());
            }
            entry.enabled = false;
            entry.plugin.clone()
        };
        if let Some(plugin) = plugin {
            self.unwire(&plugin)?;
        }
        self.persist_state()
    }

    /// Look up a command handler. O(1).
    pub fn command(&self, name: &str) -> Option<CommandFn> {
        self.commands
            .read()
            .expect("plugin registry poisoned")
            .get(name)
            .map(|(_, handler)| handler.clone())
    }

    /// Run a command by name.
    pub fn run_command(&self, name: &str, args: &[String]) -> Result<String> {
        let handler = self
            .command(name)
            .ok_or_else(|| Error::NotFound(format!("command {}", name)))?;
        handler(args)
    }

    /// Context probes contributed by enabled plugins.
    pub fn probes(&self) -> Vec<Arc<dyn ContextProbe>> {
        let plugins = self.plugins.read().expect("plugin registry poisoned");
        plugins
            .iter()
            .filter(|p| p.enabled)
            .filter_map(|p| p.plugin.as_ref())
            .flat_map(|p| p.probes())
            .collect()
    }

    /// `(manifest, enabled)` for every known plugin.
    pub fn list(&self) -> Vec<(PluginManifest, bool)> {
        let plugins = self.plugins.read().expect("plugin registry poisoned");
        plugins
            .iter()
            .map(|p| (p.manifest.clone(), p.enabled))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookState;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct TestPlugin {
        name: &'static str,
        inits: Arc<AtomicU32>,
        destroys: Arc<AtomicU32>,
    }

    impl TestPlugin {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                inits: Arc::new(AtomicU32::new(0)),
                destroys: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl Plugin for TestPlugin {
        fn manifest(&self) -> PluginManifest {
            PluginManifest {
                name: self.name.to_string(),
                version: "1.0.0".to_string(),
                description: "test plugin".to_string(),
                priority: 0,
            }
        }

        fn hooks(&self) -> Vec<HookRegistration> {
            vec![HookRegistration {
                point: HookPoint::BeforeEnhance,
                name: "stamp".to_string(),
                priority: 0,
                handler: Arc::new(|state| {
                    let mut next = state.clone();
                    next.timings.insert("stamped".to_string(), 1);
                    Ok(Some(next))
                }),
            }]
        }

        fn commands(&self) -> Vec<(String, CommandFn)> {
            let name = self.name;
            vec![(
                "greet".to_string(),
                Arc::new(move |args: &[String]| Ok(format!("{} says hi to {:?}", name, args))) as CommandFn,
            )]
        }

        fn init(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn destroy(&self) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry() -> (TempDir, Arc<HookBus>, PluginRegistry) {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(HookBus::new());
        let registry = PluginRegistry::new(dir.path(), bus.clone());
        (dir, bus, registry)
    }

    #[test]
    fn test_register_wires_hooks_and_commands() {
        let (_dir, bus, registry) = registry();
        let plugin = TestPlugin::new("themer");
        let inits = plugin.inits.clone();
        registry.register(Arc::new(plugin)).unwrap();

        assert_eq!(bus.count(HookPoint::BeforeEnhance), 1);
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        let state = bus.run(HookPoint::BeforeEnhance, HookState::for_intent("x"));
        assert_eq!(state.timings.get("stamped"), Some(&1));

        let out = registry.run_command("greet", &["world".to_string()]).unwrap();
        assert!(out.contains("themer"));
    }

    #[test]
    fn test_disable_unwires_and_destroys() {
        let (_dir, bus, registry) = registry();
        let plugin = TestPlugin::new("themer");
        let destroys = plugin.destroys.clone();
        registry.register(Arc::new(plugin)).unwrap();

        registry.disable("themer").unwrap();
        assert_eq!(bus.count(HookPoint::BeforeEnhance), 0);
        assert!(registry.command("greet").is_none());
        assert_eq!(destroys.load(Ordering::SeqCst), 1);

        registry.enable("themer").unwrap();
        assert_eq!(bus.count(HookPoint::BeforeEnhance), 1);
    }

    #[test]
    fn test_command_collision_first_wins() {
        let (_dir, _bus, registry) = registry();
        registry.register(Arc::new(TestPlugin::new("first"))).unwrap();
        registry.register(Arc::new(TestPlugin::new("second"))).unwrap();

        let out = registry.run_command("greet", &[]).unwrap();
        assert!(out.contains("first"));
    }

    #[test]
    fn test_enable_state_persists_across_registries() {
        let dir = TempDir::new().unwrap();
        {
            let bus = Arc::new(HookBus::new());
            let registry = PluginRegistry::new(dir.path(), bus);
            registry.register(Arc::new(TestPlugin::new("themer"))).unwrap();
            registry.disable("themer").unwrap();
        }

        let bus = Arc::new(HookBus::new());
        let registry = PluginRegistry::new(dir.path(), bus.clone());
        registry.register(Arc::new(TestPlugin::new("themer"))).unwrap();
        // The sidecar remembered the disabled state: nothing wired.
        assert_eq!(bus.count(HookPoint::BeforeEnhance), 0);
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].1);
    }

    #[test]
    fn test_discover_both_manifest_forms() {
        let (dir, _bus, registry) = registry();
        let plugin_dir = dir.path().join("plugins");
        fs::create_dir_all(plugin_dir.join("nested")).unwrap();
        fs::write(
            plugin_dir.join("flat.json"),
            br#"{"name": "flat", "version": "0.1.0", "unknown_field": 7}"#,
        )
        .unwrap();
        fs::write(
            plugin_dir.join("nested/plugin.json"),
            br#"{"name": "nested", "version": "0.2.0"}"#,
        )
        .unwrap();
        fs::write(plugin_dir.join("broken.json"), b"not json").unwrap();

        let reports = registry.discover(&plugin_dir);
        assert_eq!(reports.len(), 3);
        let ok = reports.iter().filter(|r| r.result.is_ok()).count();
        assert_eq!(ok, 2);

        let names: Vec<String> = registry.list().into_iter().map(|(m, _)| m.name).collect();
        assert!(names.contains(&"flat".to_string()));
        assert!(names.contains(&"nested".to_string()));
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let (_dir, _bus, registry) = registry();
        let reports = registry.discover("/nonexistent/plugins");
        assert!(reports.is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (_dir, _bus, registry) = registry();
        registry.register(Arc::new(TestPlugin::new("themer"))).unwrap();
        let err = registry
            .register(Arc::new(TestPlugin::new("themer")))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_unknown_plugin_operations_are_not_found() {
        let (_dir, _bus, registry) = registry();
        assert!(matches!(registry.enable("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(
            registry.run_command("ghost", &[]),
            Err(Error::NotFound(_))
        ));
    }
}
