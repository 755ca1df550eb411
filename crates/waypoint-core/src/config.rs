use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WaypointError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub waits: WaitsConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Nested invocation limit carried by `ExecutionContext`.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            max_call_depth: default_max_call_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Hard cap on node entries per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            retry_backoff_ms: 0,
        }
    }
}

/// Storage locations. Relative or unset paths resolve under the workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub runs_dir: Option<String>,
    #[serde(default)]
    pub waits_db: Option<String>,
    #[serde(default)]
    pub pause_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitsConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for WaitsConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default = "default_probation_steps")]
    pub probation_steps: usize,
    #[serde(default)]
    pub audit_log: Option<String>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            probation_steps: default_probation_steps(),
            audit_log: None,
        }
    }
}

/// JSONL event journal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run lifecycle, 2 = + node lifecycle, 3 = + decisions and edges.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_workspace() -> String { "~/.waypoint".to_string() }
fn default_max_call_depth() -> u32 { 5 }
fn default_max_steps() -> usize { 1000 }
fn default_tick_interval_ms() -> u64 { 1000 }
fn default_probation_steps() -> usize { 50 }
fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))
    }

    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.runtime.workspace)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.resolve(self.storage.runs_dir.as_deref(), "runs")
    }

    pub fn waits_db_path(&self) -> PathBuf {
        self.resolve(self.storage.waits_db.as_deref(), "waits.db")
    }

    pub fn pause_dir(&self) -> PathBuf {
        self.resolve(self.storage.pause_dir.as_deref(), "pause")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.resolve(self.evolution.audit_log.as_deref(), "logs/evolution.jsonl")
    }

    pub fn log_dir(&self) -> PathBuf {
        let configured = self.log.as_ref().and_then(|l| l.log_dir.as_deref());
        self.resolve(configured, "logs")
    }

    fn resolve(&self, configured: Option<&str>, default: &str) -> PathBuf {
        match configured {
            Some(p) => {
                let path = expand_home(p);
                if path.is_absolute() {
                    path
                } else {
                    self.workspace_dir().join(path)
                }
            }
            None => self.workspace_dir().join(default),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${VAR}` references; unset variables are kept verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
