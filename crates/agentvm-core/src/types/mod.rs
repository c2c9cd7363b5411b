//! Core type definitions for AgentVM
//!
//! This module contains all shared types used across the crate:
//! agent descriptors, task requests/results, and duplex wire envelopes.

mod agent_types;
mod envelope_types;
mod task_types;

pub use agent_types::*;
pub use envelope_types::*;
pub use task_types::*;
