//! Configuration for the agent system
//!
//! Every section has defaults so a partial (or missing) document still
//! yields a usable configuration. Environment variables override the
//! loaded values; unparsable overrides are logged and ignored.

use crate::error::{ConfigError, Result};
use crate::types::{AgentType, AgentTypeDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSystemConfig {
    pub system: SystemSettings,
    pub api: ApiSettings,
    pub logging: LoggingSettings,
    pub agent_types: Vec<AgentTypeDefinition>,
}

impl Default for AgentSystemConfig {
    fn default() -> Self {
        Self {
            system: SystemSettings::default(),
            api: ApiSettings::default(),
            logging: LoggingSettings::default(),
            agent_types: AgentTypeDefinition::builtin(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub max_agents: usize,
    pub auto_spawn: bool,
    pub min_idle_agents: usize,
    pub cleanup_interval_secs: u64,
    pub auto_spawn_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub result_retention_hours: u64,
    pub purge_task_history: bool,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            max_agents: 10,
            auto_spawn: true,
            min_idle_agents: 2,
            cleanup_interval_secs: 3600,
            auto_spawn_interval_secs: 60,
            health_check_interval_secs: 30,
            result_retention_hours: 24,
            purge_task_history: true,
        }
    }
}

impl SystemSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn auto_spawn_interval(&self) -> Duration {
        Duration::from_secs(self.auto_spawn_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_hours * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub endpoint: String,
    /// When set, the duplex adapter is used instead of plain HTTP
    pub websocket_url: Option<String>,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            websocket_url: None,
            api_key: String::new(),
            timeout_secs: 30,
        }
    }
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AgentSystemConfig {
    pub fn from_path(path: &Path) -> std::result::Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AgentSystemConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.system.max_agents == 0 {
            return Err(ConfigError::InvalidValue {
                field: "system.max_agents",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.system.min_idle_agents > self.system.max_agents {
            return Err(ConfigError::InvalidValue {
                field: "system.min_idle_agents",
                reason: format!(
                    "{} exceeds max_agents ({})",
                    self.system.min_idle_agents, self.system.max_agents
                ),
            });
        }
        if self.api.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.endpoint",
                reason: "must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for definition in &self.agent_types {
            if !seen.insert(definition.agent_type) {
                return Err(ConfigError::InvalidValue {
                    field: "agent_types",
                    reason: format!("duplicate agent type {}", definition.agent_type),
                });
            }
            if let Some(name) = definition.personality.out_of_range() {
                return Err(ConfigError::InvalidValue {
                    field: "agent_types.personality",
                    reason: format!("{} of {} must be in [0, 1]", name, definition.agent_type),
                });
            }
        }
        Ok(())
    }

    pub fn agent_type(&self, agent_type: AgentType) -> Option<&AgentTypeDefinition> {
        self.agent_types
            .iter()
            .find(|definition| definition.agent_type == agent_type)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "MAX_AGENTS", &mut self.system.max_agents);
        override_parsed(&lookup, "MIN_IDLE_AGENTS", &mut self.system.min_idle_agents);
        if let Some(raw) = lookup("AUTO_SPAWN") {
            match parse_bool(&raw) {
                Some(value) => self.system.auto_spawn = value,
                None => warn!("Ignoring AUTO_SPAWN={:?}: not a boolean", raw),
            }
        }
        if let Some(endpoint) = lookup("API_ENDPOINT") {
            self.api.endpoint = endpoint;
        }
        if let Some(url) = lookup("AGENTVM_WS_URL") {
            self.api.websocket_url = Some(url).filter(|url| !url.is_empty());
        }
        if let Some(key) = lookup("AGENTVM_API_KEY") {
            self.api.api_key = key;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        match raw.trim().parse() {
            Ok(value) => {
                debug!("{} overridden from environment", name);
                *target = value;
            }
            Err(_) => warn!("Ignoring {}={:?}: not a valid number", name, raw),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Source of the system configuration
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<AgentSystemConfig>;
}

/// Fixed in-memory configuration
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    config: AgentSystemConfig,
}

impl StaticConfigProvider {
    pub fn new(config: AgentSystemConfig) -> Self {
        Self { config }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn load(&self) -> Result<AgentSystemConfig> {
        self.config.validate()?;
        Ok(self.config.clone())
    }
}

/// JSON document on disk plus environment overrides
#[derive(Debug, Clone)]
pub struct JsonFileConfigProvider {
    path: PathBuf,
    use_env: bool,
}

impl JsonFileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            use_env: true,
        }
    }

    /// Ignore the process environment (tests, embedded use)
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// `<config dir>/agentvm/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("agentvm").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for JsonFileConfigProvider {
    fn default() -> Self {
        Self::new(Self::default_path().unwrap_or_else(|| PathBuf::from("config.json")))
    }
}

impl ConfigProvider for JsonFileConfigProvider {
    fn load(&self) -> Result<AgentSystemConfig> {
        let mut config = if self.path.exists() {
            let config = AgentSystemConfig::from_path(&self.path)?;
            info!("Loaded configuration from {}", self.path.display());
            config
        } else {
            info!(
                "No configuration at {}, using defaults",
                self.path.display()
            );
            AgentSystemConfig::default()
        };

        if self.use_env {
            config.apply_env_overrides();
        }
        config.validate()?;
        Ok(config)
    }
}
