use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::telemetry::{event_tracing_enabled, is_truthy};

/// Editor-level annotation settings.
///
/// Every field has a default, so an empty or partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationConfig {
    /// Name recorded on every log record and event of this editor.
    #[serde(default = "default_instance")]
    pub instance: String,
    /// Namespace of the replicated annotation map.
    #[serde(default = "default_map_field")]
    pub map_field: String,
    #[serde(default)]
    pub relocation: RelocationConfig,
    #[serde(default)]
    pub trace: TraceConfig,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            map_field: default_map_field(),
            relocation: RelocationConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationConfig {
    /// Queue relocation actions for [`crate::Editor::run_deferred`]. When
    /// `false` they are dispatched right after the structural edit.
    #[serde(default = "default_true")]
    pub defer: bool,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            defer: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Mirror every annotation event to a `tracing` debug record.
    #[serde(default = "event_tracing_enabled")]
    pub events: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            events: event_tracing_enabled(),
        }
    }
}

impl AnnotationConfig {
    /// Apply `MARGINALIA_INSTANCE` and `MARGINALIA_TRACE` from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(instance) = lookup("MARGINALIA_INSTANCE")
            && !instance.trim().is_empty()
        {
            self.instance = instance.trim().to_string();
        }
        if let Some(trace) = lookup("MARGINALIA_TRACE") {
            self.trace.events = is_truthy(&trace);
        }
    }
}

/// Load a config file. A missing file yields the defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<AnnotationConfig> {
    if !path.exists() {
        return Ok(AnnotationConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<AnnotationConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load `<config_dir>/marginalia/config.toml`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<AnnotationConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(AnnotationConfig::default());
    };
    load_config(&config_dir.join("marginalia/config.toml"))
}

const fn default_true() -> bool {
    true
}

fn default_instance() -> String {
    "local".to_string()
}

fn default_map_field() -> String {
    "annotations".to_string()
}
