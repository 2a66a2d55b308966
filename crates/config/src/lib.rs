//! Configuration loading, validation, and management for thinkloop.
//!
//! Loads configuration from `~/.thinkloop/config.toml` with environment
//! variable overrides. Validates all settings before a loop is built.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thinkloop_core::provider::PersonaConfig;

/// The root configuration structure.
///
/// Maps directly to `~/.thinkloop/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Outer-loop iteration budget per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Message count at which the session is compacted
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: usize,

    /// Estimated token count that raises `needs_compaction` (unset = never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<usize>,

    /// Model ↔ tool round trips allowed inside one Execute step
    #[serde(default = "default_max_tool_steps")]
    pub max_tool_steps: u32,

    /// Retry budget handed to the model invoker
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-call timeout handed to the model invoker
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Tool whose call ends the Execute step and the run
    #[serde(default = "default_terminal_tool")]
    pub terminal_tool: String,

    /// Inline reasoning open marker
    #[serde(default = "default_think_open")]
    pub think_open: String,

    /// Inline reasoning close marker
    #[serde(default = "default_think_close")]
    pub think_close: String,

    /// Tools exposed to Execute (absent = every registered tool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,

    /// Persona used by each processor phase
    #[serde(default)]
    pub phases: PhaseConfig,

    /// Persona catalogue
    #[serde(default = "default_personas")]
    pub personas: Vec<PersonaConfig>,

    /// Sub-agent spawning settings
    #[serde(default)]
    pub sub_agent: SubAgentConfig,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_compact_threshold() -> usize {
    40
}
fn default_max_tool_steps() -> u32 {
    5
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_terminal_tool() -> String {
    "finish_task".into()
}
fn default_think_open() -> String {
    "<think>".into()
}
fn default_think_close() -> String {
    "</think>".into()
}

fn default_personas() -> Vec<PersonaConfig> {
    vec![
        PersonaConfig::new("planner").with_system_prompt(
            "Break the task into a global plan. Do not call tools.",
        ),
        PersonaConfig::new("reasoner").with_system_prompt(
            "Reflect on the latest observations and decide the next step. Do not call tools.",
        ),
        PersonaConfig::new("executor").with_system_prompt(
            "Carry out the next step using the available tools. Call finish_task when the task is complete.",
        ),
        PersonaConfig::new("compressor")
            .with_system_prompt("Summarize the conversation so far, keeping every open thread."),
    ]
}

/// Persona name per processor phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(default = "default_plan_persona")]
    pub plan: String,
    #[serde(default = "default_reason_persona")]
    pub reason: String,
    #[serde(default = "default_execute_persona")]
    pub execute: String,
    #[serde(default = "default_compress_persona")]
    pub compress: String,
}

fn default_plan_persona() -> String {
    "planner".into()
}
fn default_reason_persona() -> String {
    "reasoner".into()
}
fn default_execute_persona() -> String {
    "executor".into()
}
fn default_compress_persona() -> String {
    "compressor".into()
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            plan: default_plan_persona(),
            reason: default_reason_persona(),
            execute: default_execute_persona(),
            compress: default_compress_persona(),
        }
    }
}

/// Settings for nested sub-agent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentConfig {
    /// Agent name recorded on sub-agent sessions
    #[serde(default = "default_sub_agent_name")]
    pub agent_name: String,

    /// Execute persona for the nested run
    #[serde(default = "default_execute_persona")]
    pub persona: String,

    /// Iteration budget of the nested run
    #[serde(default = "default_sub_agent_iterations")]
    pub max_iterations: u32,

    /// Extra tools exposed to the nested run. The terminal tool is always
    /// added; see [`LoopConfig::sub_agent_tools`].
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_sub_agent_name() -> String {
    "sub-agent".into()
}
fn default_sub_agent_iterations() -> u32 {
    5
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            agent_name: default_sub_agent_name(),
            persona: default_execute_persona(),
            max_iterations: default_sub_agent_iterations(),
            tools: Vec::new(),
        }
    }
}

impl LoopConfig {
    /// Load configuration from the default path (~/.thinkloop/config.toml),
    /// then apply environment overrides:
    /// - `THINKLOOP_MAX_ITERATIONS`
    /// - `THINKLOOP_COMPACT_THRESHOLD`
    /// - `THINKLOOP_TERMINAL_TOOL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in `load`).
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup("THINKLOOP_MAX_ITERATIONS") {
            self.max_iterations = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("THINKLOOP_MAX_ITERATIONS: invalid value '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup("THINKLOOP_COMPACT_THRESHOLD") {
            self.compact_threshold = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "THINKLOOP_COMPACT_THRESHOLD: invalid value '{raw}'"
                ))
            })?;
        }
        if let Some(tool) = lookup("THINKLOOP_TERMINAL_TOOL") {
            self.terminal_tool = tool;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".thinkloop")
    }

    /// Look up a persona by name.
    pub fn persona(&self, name: &str) -> Option<&PersonaConfig> {
        self.personas.iter().find(|p| p.name == name)
    }

    /// Tools exposed to sub-agent runs: the configured list plus the
    /// current terminal tool.
    pub fn sub_agent_tools(&self) -> Vec<String> {
        let mut tools = self.sub_agent.tools.clone();
        if !tools.contains(&self.terminal_tool) {
            tools.push(self.terminal_tool.clone());
        }
        tools
    }

    /// Per-call model timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "max_iterations must be at least 1".into(),
            ));
        }
        if self.compact_threshold < 2 {
            return Err(ConfigError::ValidationError(
                "compact_threshold must be at least 2".into(),
            ));
        }
        if self.max_tool_steps == 0 {
            return Err(ConfigError::ValidationError(
                "max_tool_steps must be at least 1".into(),
            ));
        }
        if self.think_open.is_empty() || self.think_close.is_empty() {
            return Err(ConfigError::ValidationError(
                "think markers must not be empty".into(),
            ));
        }

        let referenced = [
            ("phases.plan", &self.phases.plan),
            ("phases.reason", &self.phases.reason),
            ("phases.execute", &self.phases.execute),
            ("phases.compress", &self.phases.compress),
            ("sub_agent.persona", &self.sub_agent.persona),
        ];
        for (field, name) in referenced {
            if self.persona(name).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "{field} refers to unknown persona '{name}'"
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            compact_threshold: default_compact_threshold(),
            max_context_tokens: None,
            max_tool_steps: default_max_tool_steps(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            terminal_tool: default_terminal_tool(),
            think_open: default_think_open(),
            think_close: default_think_close(),
            tools: None,
            phases: PhaseConfig::default(),
            personas: default_personas(),
            sub_agent: SubAgentConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for thinkloop_core::Error {
    fn from(err: ConfigError) -> Self {
        thinkloop_core::Error::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = LoopConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.terminal_tool, "finish_task");
        assert_eq!(config.phases.execute, "executor");
        assert!(config.persona("planner").is_some());
    }

    #[test]
    fn config_roundtrip_toml() {
        let toml_str = LoopConfig::default_toml();
        let parsed = LoopConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.max_iterations, 10);
        assert_eq!(parsed.personas.len(), 4);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = LoopConfig::from_toml_str(
            r#"
max_iterations = 3
compact_threshold = 12
tools = ["finish_task", "search"]

[sub_agent]
max_iterations = 2
"#,
        )
        .unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.compact_threshold, 12);
        assert_eq!(config.tools.as_deref().map(|t| t.len()), Some(2));
        assert_eq!(config.sub_agent.max_iterations, 2);
        assert_eq!(config.sub_agent.persona, "executor");
        assert_eq!(config.think_open, "<think>");
    }

    #[test]
    fn unknown_phase_persona_rejected() {
        let err = LoopConfig::from_toml_str(
            r#"
[phases]
execute = "ghost"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn zero_iterations_rejected() {
        let config = LoopConfig {
            max_iterations: 0,
            ..LoopConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = LoopConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "THINKLOOP_MAX_ITERATIONS" => Some("7".into()),
                "THINKLOOP_TERMINAL_TOOL" => Some("done".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.terminal_tool, "done");
        assert_eq!(config.sub_agent_tools(), vec!["done"]);

        let bad = config.apply_env_overrides(|key| {
            (key == "THINKLOOP_COMPACT_THRESHOLD").then(|| "many".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn sub_agent_tools_follow_the_terminal_tool() {
        let config = LoopConfig::from_toml_str("terminal_tool = \"done\"\n").unwrap();
        assert_eq!(config.sub_agent_tools(), vec!["done"]);

        let config = LoopConfig::from_toml_str(
            r#"
[sub_agent]
tools = ["search", "finish_task"]
"#,
        )
        .unwrap();
        assert_eq!(config.sub_agent_tools(), vec!["search", "finish_task"]);

        assert_eq!(LoopConfig::default().sub_agent_tools(), vec!["finish_task"]);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = LoopConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.max_iterations, 10);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "compact_threshold = 8\n").unwrap();
        let config = LoopConfig::load_from(&path).unwrap();
        assert_eq!(config.compact_threshold, 8);

        std::fs::write(&path, "compact_threshold = \"eight\"\n").unwrap();
        assert!(matches!(
            LoopConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
