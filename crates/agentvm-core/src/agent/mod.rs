//! Agent and task bookkeeping
//!
//! This module handles:
//! - Agent creation/destruction under the configured capacity
//! - Task assignment through the configured transport adapter
//! - Idle detection, status snapshots and result retention
//! - Notifying the entity-presence collaborator

mod entity;
mod registry;

pub use entity::EntityAdapter;
pub use registry::{AgentRegistry, MAX_PROMPT_CHARS, MAX_TASK_TIMEOUT};
