//! Agent descriptor and agent type definitions

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Free-form metadata attached to agents and events
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Closed set of agent kinds the remote backend can run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Aider,
    OpenCode,
    Claude,
    Custom,
}

impl AgentType {
    pub const ALL: [AgentType; 4] = [Self::Aider, Self::OpenCode, Self::Claude, Self::Custom];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aider => "aider",
            Self::OpenCode => "opencode",
            Self::Claude => "claude",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RegistryError::UnknownAgentType(s.to_string()))
    }
}

/// Five bounded personality traits, each in [0, 1]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Personality {
    pub friendliness: f64,
    pub efficiency: f64,
    pub creativity: f64,
    pub talkativeness: f64,
    pub collaboration: f64,
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            friendliness: 0.8,
            efficiency: 0.9,
            creativity: 0.7,
            talkativeness: 0.6,
            collaboration: 0.8,
        }
    }
}

impl Personality {
    pub fn new(
        friendliness: f64,
        efficiency: f64,
        creativity: f64,
        talkativeness: f64,
        collaboration: f64,
    ) -> Self {
        Self {
            friendliness,
            efficiency,
            creativity,
            talkativeness,
            collaboration,
        }
    }

    /// Named trait values, in declaration order
    pub fn traits(&self) -> [(&'static str, f64); 5] {
        [
            ("friendliness", self.friendliness),
            ("efficiency", self.efficiency),
            ("creativity", self.creativity),
            ("talkativeness", self.talkativeness),
            ("collaboration", self.collaboration),
        ]
    }

    /// Name of the first trait outside [0, 1], if any
    pub fn out_of_range(&self) -> Option<&'static str> {
        self.traits()
            .into_iter()
            .find(|(_, v)| !(0.0..=1.0).contains(v))
            .map(|(name, _)| name)
    }
}

/// Spatial position of an agent's entity
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Visual/activity state reported to the entity collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Thinking,
    Coding,
    Speaking,
    Moving,
    Collaborating,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Coding => "coding",
            Self::Speaking => "speaking",
            Self::Moving => "moving",
            Self::Collaborating => "collaborating",
            Self::Error => "error",
        }
    }
}

/// Configured template for one agent type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTypeDefinition {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub personality: Personality,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_color() -> String {
    "#ffffff".to_string()
}

impl AgentTypeDefinition {
    pub fn aider() -> Self {
        Self {
            agent_type: AgentType::Aider,
            name: "Aider".to_string(),
            description: "Multi-file coding specialist".to_string(),
            color: "#0066CC".to_string(),
            personality: Personality::new(0.7, 0.95, 0.6, 0.4, 0.8),
            capabilities: strings(&["refactoring", "debugging", "optimization", "multi_file_editing"]),
        }
    }

    pub fn opencode() -> Self {
        Self {
            agent_type: AgentType::OpenCode,
            name: "OpenCode".to_string(),
            description: "Autonomous coding agent".to_string(),
            color: "#00CC66".to_string(),
            personality: Personality::new(0.9, 0.8, 0.9, 0.8, 0.9),
            capabilities: strings(&[
                "feature_development",
                "code_generation",
                "system_design",
                "autonomous_coding",
            ]),
        }
    }

    pub fn claude() -> Self {
        Self {
            agent_type: AgentType::Claude,
            name: "Claude".to_string(),
            description: "Conversational coding assistant".to_string(),
            color: "#CC6600".to_string(),
            personality: Personality::new(0.95, 0.85, 0.8, 0.9, 0.85),
            capabilities: strings(&[
                "explanation",
                "teaching",
                "code_review",
                "documentation",
                "conversation",
            ]),
        }
    }

    /// Built-in type definitions
    pub fn builtin() -> Vec<Self> {
        vec![Self::aider(), Self::opencode(), Self::claude()]
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// A live agent registered with the registry.
///
/// Everything except `metadata` is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub name: String,
    pub description: String,
    pub color: String,
    pub personality: Personality,
    pub capabilities: Vec<String>,
    pub position: Position,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: Metadata,
}

impl AgentDescriptor {
    /// Instantiate a descriptor from its type definition
    pub fn from_definition(
        id: impl Into<String>,
        definition: &AgentTypeDefinition,
        position: Option<Position>,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: definition.agent_type,
            name: definition.name.clone(),
            description: definition.description.clone(),
            color: definition.color.clone(),
            personality: definition.personality,
            capabilities: definition.capabilities.clone(),
            position: position.unwrap_or_default(),
            created_at: chrono::Utc::now(),
            metadata: metadata.unwrap_or_default(),
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}
