//! Layered configuration.
//!
//! Precedence, highest first: runtime overrides, `FORGE_*` environment
//! variables (dot-path form), the project `.forgerc.json`, the user
//! `.forgerc.json`, built-in defaults. Provider tokens come from the
//! process environment only and are never persisted; a missing token
//! disables that provider without aborting startup.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::router::{ProviderSettings, RouterSettings};

fn default_model() -> String {
    "gemini".to_string()
}

fn default_max_tokens() -> u32 {
    8_192
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8_787
}

fn default_max_requests() -> u32 {
    30
}

fn default_window_secs() -> u64 {
    60
}

fn default_threshold() -> f64 {
    0.70
}

fn default_max_rounds() -> u32 {
    3
}

fn default_patience() -> u32 {
    2
}

fn default_parallelism() -> usize {
    3
}

fn default_debounce_ms() -> u64 {
    500
}

/// Generation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: None,
        }
    }
}

/// Sanitizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub sanitize: bool,
    #[serde(default)]
    pub strip_scripts: bool,
    #[serde(default)]
    pub strip_inline_styles: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            sanitize: true,
            strip_scripts: false,
            strip_inline_styles: false,
        }
    }
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional bearer token; unset means open access.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            token: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Iteration defaults for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub iterate: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_patience")]
    pub patience: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            iterate: false,
            threshold: default_threshold(),
            max_rounds: default_max_rounds(),
            patience: default_patience(),
            parallelism: default_parallelism(),
        }
    }
}

/// Watch-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Persistence root; defaults to the user-local data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
}

/// The full configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Free-form location hint for context probes.
    #[serde(default)]
    pub location: Option<String>,
}

/// Deep-merge `overlay` into `base`; objects merge, scalars replace.
fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Resolve `FORGE_A_B_C` segments against the schema, greedily matching
/// the longest key at each level so snake_case field names survive the
/// underscore split (`SERVER_RATE_LIMIT_MAX_REQUESTS` finds
/// `server.rate_limit.max_requests`).
fn resolve_path(schema: &Value, segments: &[&str]) -> Option<Vec<String>> {
    if segments.is_empty() {
        return Some(Vec::new());
    }
    let object = schema.as_object()?;
    for take in (1..=segments.len()).rev() {
        let candidate = segments[..take].join("_");
        if let Some(child) = object.get(&candidate) {
            if take == segments.len() {
                return Some(vec![candidate]);
            }
            if let Some(mut rest) = resolve_path(child, &segments[take..]) {
                let mut path = vec![candidate];
                path.append(&mut rest);
                return Some(path);
            }
        }
    }
    None
}

fn parse_env_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => raw
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<f64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

fn env_overlay(schema: &Value, vars: &HashMap<String, String>) -> Value {
    let mut overlay = Value::Object(Default::default());
    for (name, raw) in vars {
        let Some(stripped) = name.strip_prefix("FORGE_") else {
            continue;
        };
        let lowered = stripped.to_ascii_lowercase();
        let segments: Vec<&str> = lowered.split('_').filter(|s| !s.is_empty()).collect();
        let Some(path) = resolve_path(schema, &segments) else {
            tracing::debug!(var = %name, "unrecognized FORGE_ variable ignored");
            continue;
        };

        let mut slot = &mut overlay;
        for key in &path[..path.len() - 1] {
            slot = slot
                .as_object_mut()
                .expect("overlay is an object")
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        slot.as_object_mut()
            .expect("overlay is an object")
            .insert(path.last().expect("non-empty path").clone(), parse_env_value(raw));
    }
    overlay
}

/// Assembles a [`ForgeConfig`] from its layers.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    pub user_rc: Option<PathBuf>,
    pub project_rc: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub overrides: Option<Value>,
}

impl ConfigLoader {
    /// Loader wired to the real environment and conventional rc paths.
    pub fn from_environment(project_dir: impl AsRef<Path>) -> Self {
        Self {
            user_rc: dirs::home_dir().map(|home| home.join(".forgerc.json")),
            project_rc: Some(project_dir.as_ref().join(".forgerc.json")),
            env: std::env::vars().collect(),
            overrides: None,
        }
    }

    pub fn with_overrides(mut self, overrides: Value) -> Self {
        self.overrides = Some(overrides);
        self
    }

    fn read_rc(path: Option<&Path>) -> Option<Value> {
        let path = path?;
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable rc file ignored");
                None
            }
        }
    }

    /// Resolve the final configuration.
    pub fn load(&self) -> ForgeConfig {
        let schema = serde_json::to_value(ForgeConfig::default()).expect("defaults serialize");
        let mut tree = schema.clone();

        if let Some(user) = Self::read_rc(self.user_rc.as_deref()) {
            merge(&mut tree, &user);
        }
        if let Some(project) = Self::read_rc(self.project_rc.as_deref()) {
            merge(&mut tree, &project);
        }
        merge(&mut tree, &env_overlay(&schema, &self.env));
        if let Some(overrides) = &self.overrides {
            merge(&mut tree, overrides);
        }

        match serde_json::from_value(tree) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "invalid configuration tree, using defaults");
                ForgeConfig::default()
            }
        }
    }
}

impl ForgeConfig {
    /// Load from conventional locations and the live environment.
    pub fn load(project_dir: impl AsRef<Path>) -> Self {
        ConfigLoader::from_environment(project_dir).load()
    }

    /// Router settings from this config plus provider tokens in `env`.
    pub fn router_settings(&self, env: &HashMap<String, String>) -> RouterSettings {
        RouterSettings {
            gemini: ProviderSettings {
                api_key: env.get("GEMINI_API_KEY").cloned(),
                base_url: env.get("GEMINI_BASE_URL").cloned(),
            },
            openai: ProviderSettings {
                api_key: env.get("OPENAI_API_KEY").cloned(),
                base_url: env.get("OPENAI_BASE_URL").cloned(),
            },
            anthropic: ProviderSettings {
                api_key: env.get("ANTHROPIC_API_KEY").cloned(),
                base_url: env.get("ANTHROPIC_BASE_URL").cloned(),
            },
            ollama: ProviderSettings {
                api_key: None,
                base_url: env.get("OLLAMA_HOST").cloned(),
            },
            default_alias: self.provider.default_model.clone(),
        }
    }

    /// The persistence root.
    pub fn data_dir(&self) -> PathBuf {
        self.paths.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("forge")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ConfigLoader::default().load();
        assert_eq!(config.provider.default_model, "gemini");
        assert_eq!(config.server.rate_limit.max_requests, 30);
        assert!(config.security.sanitize);
        assert_eq!(config.watch.debounce_ms, 500);
    }

    #[test]
    fn test_env_dot_path_mapping() {
        let loader = ConfigLoader {
            env: env(&[("FORGE_SECURITY_SANITIZE", "false")]),
            ..Default::default()
        };
        let config = loader.load();
        assert!(!config.security.sanitize);
    }

    #[test]
    fn test_env_maps_snake_case_leaves() {
        let loader = ConfigLoader {
            env: env(&[
                ("FORGE_SERVER_RATE_LIMIT_MAX_REQUESTS", "2"),
                ("FORGE_PROVIDER_DEFAULT_MODEL", "claude"),
                ("FORGE_PIPELINE_THRESHOLD", "0.9"),
            ]),
            ..Default::default()
        };
        let config = loader.load();
        assert_eq!(config.server.rate_limit.max_requests, 2);
        assert_eq!(config.provider.default_model, "claude");
        assert!((config.pipeline.threshold - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_env_vars_ignored() {
        let loader = ConfigLoader {
            env: env(&[("FORGE_NOT_A_REAL_KEY", "1"), ("PATH", "/usr/bin")]),
            ..Default::default()
        };
        let config = loader.load();
        assert_eq!(config.server.port, 8787);
    }

    #[test]
    fn test_rc_precedence_project_over_user() {
        let dir = TempDir::new().unwrap();
        let user_rc = dir.path().join("user.json");
        let project_rc = dir.path().join("project.json");
        std::fs::write(
            &user_rc,
            br#"{"provider": {"default_model": "gpt"}, "server": {"port": 9000}}"#,
        )
        .unwrap();
        std::fs::write(&project_rc, br#"{"provider": {"default_model": "claude"}}"#).unwrap();

        let config = ConfigLoader {
            user_rc: Some(user_rc),
            project_rc: Some(project_rc),
            ..Default::default()
        }
        .load();

        // Project wins the contested key; user still contributes the port.
        assert_eq!(config.provider.default_model, "claude");
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_env_beats_rc_and_overrides_beat_env() {
        let dir = TempDir::new().unwrap();
        let project_rc = dir.path().join("project.json");
        std::fs::write(&project_rc, br#"{"provider": {"default_model": "gpt"}}"#).unwrap();

        let config = ConfigLoader {
            project_rc: Some(project_rc.clone()),
            env: env(&[("FORGE_PROVIDER_DEFAULT_MODEL", "claude")]),
            ..Default::default()
        }
        .load();
        assert_eq!(config.provider.default_model, "claude");

        let config = ConfigLoader {
            project_rc: Some(project_rc),
            env: env(&[("FORGE_PROVIDER_DEFAULT_MODEL", "claude")]),
            overrides: Some(json!({"provider": {"default_model": "ollama"}})),
            ..Default::default()
        }
        .load();
        assert_eq!(config.provider.default_model, "ollama");
    }

    #[test]
    fn test_broken_rc_is_ignored() {
        let dir = TempDir::new().unwrap();
        let project_rc = dir.path().join("project.json");
        std::fs::write(&project_rc, b"{ half a json").unwrap();

        let config = ConfigLoader {
            project_rc: Some(project_rc),
            ..Default::default()
        }
        .load();
        assert_eq!(config.provider.default_model, "gemini");
    }

    #[test]
    fn test_router_settings_tokens_from_env() {
        let config = ForgeConfig::default();
        let settings = config.router_settings(&env(&[
            ("GEMINI_API_KEY", "g-key"),
            ("OLLAMA_HOST", "http://127.0.0.1:11434"),
        ]));
        assert_eq!(settings.gemini.api_key.as_deref(), Some("g-key"));
        assert!(settings.openai.api_key.is_none());
        assert!(settings.anthropic.api_key.is_none());
        assert_eq!(
            settings.ollama.base_url.as_deref(),
            Some("http://127.0.0.1:11434")
        );
        assert_eq!(settings.default_alias, "gemini");
    }

    #[test]
    fn test_parse_env_value_types() {
        assert_eq!(parse_env_value("false"), Value::Bool(false));
        assert_eq!(parse_env_value("30"), json!(30));
        assert_eq!(parse_env_value("0.7"), json!(0.7));
        assert_eq!(parse_env_value("hello"), json!("hello"));
    }
}
