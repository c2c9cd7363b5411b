//! AgentVM Core Library
//!
//! This crate provides the core of the AgentVM agent system:
//! - Agent/task registry with capacity limits and idle detection
//! - Lifecycle event bus
//! - Transport adapters to the remote execution backend (HTTP and a
//!   correlated duplex channel over WebSocket)
//! - Periodic maintenance (auto-spawn, result cleanup, health checks)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     agentvm-core                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  agent/        - Registry, entity collaborator trait        │
//! │  events/       - Topic-based lifecycle event bus            │
//! │  transport/    - Adapter trait, correlation table,          │
//! │                  duplex/WebSocket and HTTP adapters         │
//! │  maintenance.rs - Periodic loops, shared shutdown           │
//! │  config.rs     - Settings, providers, env overrides         │
//! │  telemetry.rs  - Tracing subscriber setup                   │
//! │  types/        - Shared type definitions                    │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod maintenance;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

pub use agent::{AgentRegistry, EntityAdapter};
pub use config::{
    AgentSystemConfig, ApiSettings, ConfigProvider, JsonFileConfigProvider, LoggingSettings,
    StaticConfigProvider, SystemSettings,
};
pub use events::{topics, EventBus, HandlerId, LifecycleEvent};
pub use maintenance::{spawn_periodic, Maintenance};
pub use transport::{
    CorrelationKey, CorrelationTable, DuplexAdapter, DuplexLink, DuplexSettings, HttpAdapter,
    StatusMap, TaskAdapter, WaitOutcome,
};

use std::sync::Arc;

/// Build the transport adapter selected by the configuration: the duplex
/// adapter when a WebSocket URL is set, plain HTTP otherwise.
pub async fn connect_adapter(api: &ApiSettings) -> Result<Arc<dyn TaskAdapter>> {
    match api.websocket_url.as_deref() {
        Some(url) => {
            let adapter = DuplexAdapter::connect(url, &api.api_key, DuplexSettings::default()).await?;
            Ok(Arc::new(adapter))
        }
        None => {
            let adapter = HttpAdapter::connect(&api.endpoint, &api.api_key, api.timeout()).await?;
            Ok(Arc::new(adapter))
        }
    }
}
