use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub main_script: Option<PathBuf>,
    #[serde(default = "ScriptConfig::default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "ScriptConfig::default_max_call_levels")]
    pub max_call_levels: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    /// Fire `enterFrame`, `simulate`, menu and cell events from `on_frame`.
    #[serde(default = "EventConfig::default_builtin_events")]
    pub builtin_events: bool,
    #[serde(default = "EventConfig::default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    #[serde(default = "LoggingConfig::default_filter")]
    pub filter: String,
    #[serde(default = "LoggingConfig::default_ansi")]
    pub ansi: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub scripts: ScriptConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub main_script: Option<PathBuf>,
    pub frames: Option<u32>,
    pub log_filter: Option<String>,
}

impl ScriptConfig {
    const fn default_max_operations() -> u64 {
        500_000
    }

    const fn default_max_call_levels() -> usize {
        48
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            main_script: None,
            max_operations: Self::default_max_operations(),
            max_call_levels: Self::default_max_call_levels(),
        }
    }
}

impl EventConfig {
    const fn default_builtin_events() -> bool {
        true
    }

    const fn default_queue_warn_threshold() -> usize {
        4_096
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            builtin_events: Self::default_builtin_events(),
            queue_warn_threshold: Self::default_queue_warn_threshold(),
        }
    }
}

impl LoggingConfig {
    fn default_filter() -> String {
        "info".to_string()
    }

    const fn default_ansi() -> bool {
        true
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: Self::default_filter(), ansi: Self::default_ansi() }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Logging is usually not installed yet when this runs, so failures go to stderr.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &BridgeConfigOverrides) {
        if let Some(script) = &overrides.main_script {
            self.scripts.main_script = Some(script.clone());
        }
        if let Some(filter) = &overrides.log_filter {
            self.logging.filter = filter.clone();
        }
    }
}

impl BridgeConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.config_path.is_none()
            && self.main_script.is_none()
            && self.frames.is_none()
            && self.log_filter.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.config_path.is_some() {
            fields.push("config");
        }
        if self.main_script.is_some() {
            fields.push("script");
        }
        if self.frames.is_some() {
            fields.push("frames");
        }
        if self.log_filter.is_some() {
            fields.push("log");
        }
        fields
    }
}
