//! Entity-presence collaborator
//!
//! Whatever renders agents (a 3D scene, a dashboard) implements
//! [`EntityAdapter`]. The registry notifies it on create, destroy and
//! state changes; failures are logged and never block the registry.

use crate::error::Result;
use crate::types::{AgentDescriptor, AgentState, Position};
use async_trait::async_trait;

#[async_trait]
pub trait EntityAdapter: Send + Sync {
    async fn create_agent(&self, agent: &AgentDescriptor) -> Result<()>;

    async fn update_agent_state(&self, agent_id: &str, state: AgentState) -> Result<()>;

    async fn destroy_agent(&self, agent_id: &str) -> Result<()>;

    fn agent_position(&self, agent_id: &str) -> Option<Position>;
}
