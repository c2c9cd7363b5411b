//! Transport adapters for the remote execution backend
//!
//! The registry only sees the [`TaskAdapter`] trait. Two implementations
//! exist:
//!
//! - [`HttpAdapter`] - stateless, one HTTP call per operation
//! - [`DuplexAdapter`] - one persistent connection shared by every
//!   operation, multiplexed through a [`CorrelationTable`]

mod correlation;
mod duplex;
mod http;
pub mod websocket;

pub use correlation::{CorrelationKey, CorrelationTable, WaitOutcome, Waiter};
pub use duplex::{DuplexAdapter, DuplexLink, DuplexSettings, RemotePeer};
pub use http::HttpAdapter;

use crate::error::Result;
use crate::types::{ExecuteOptions, TaskResult};
use async_trait::async_trait;

/// Free-form status document returned by the backend
pub type StatusMap = serde_json::Map<String, serde_json::Value>;

/// Contract between the registry and a transport to the execution backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskAdapter: Send + Sync {
    /// Run a prompt on the given agent type.
    ///
    /// Remote failures and timeouts come back as a failed `TaskResult`;
    /// an `Err` means the request could not be issued at all.
    async fn execute(
        &self,
        agent_type: &str,
        prompt: &str,
        options: ExecuteOptions,
    ) -> Result<TaskResult>;

    /// Status document for a running task
    async fn get_status(&self, task_id: &str) -> Result<StatusMap>;

    /// Ask the backend to cancel a task
    async fn cancel(&self, task_id: &str) -> Result<bool>;

    /// Last known connectivity; never blocks
    fn is_connected(&self) -> bool;

    /// Refresh connectivity (and any transport bookkeeping)
    async fn health_check(&self) -> bool {
        self.is_connected()
    }
}
