//! Task request/result types and the system status snapshot

use super::Metadata;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default working directory inside the execution backend
pub const DEFAULT_REPO_PATH: &str = "/app/workspace";

/// Default task timeout
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Caller-tunable parameters of a task assignment
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub priority: f64,
    pub timeout: Duration,
    pub repo_path: String,
    pub metadata: Metadata,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: 1.0,
            timeout: DEFAULT_TASK_TIMEOUT,
            repo_path: DEFAULT_REPO_PATH.to_string(),
            metadata: Metadata::new(),
        }
    }
}

impl TaskOptions {
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_repo_path(mut self, repo_path: impl Into<String>) -> Self {
        self.repo_path = repo_path.into();
        self
    }
}

/// Options handed to a transport adapter for one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOptions {
    pub task_id: String,
    pub agent_id: String,
    pub timeout: Duration,
    pub repo_path: String,
}

impl ExecuteOptions {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            timeout: DEFAULT_TASK_TIMEOUT,
            repo_path: DEFAULT_REPO_PATH.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One unit of work assigned to an agent. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub id: String,
    pub agent_id: String,
    pub prompt: String,
    pub task_type: String,
    pub priority: f64,
    pub timeout_ms: u64,
    pub repo_path: String,
    pub metadata: Metadata,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TaskRequest {
    pub fn new(
        agent_id: impl Into<String>,
        prompt: impl Into<String>,
        task_type: impl Into<String>,
        options: &TaskOptions,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            task_type: task_type.into(),
            priority: options.priority,
            timeout_ms: u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX),
            repo_path: options.repo_path.clone(),
            metadata: options.metadata.clone(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Adapter options for executing this request
    pub fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            task_id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            timeout: self.timeout(),
            repo_path: self.repo_path.clone(),
        }
    }
}

/// Terminal outcome of a task; correlates 1:1 with a `TaskRequest`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(rename = "id")]
    pub task_id: String,
    pub agent_id: String,
    pub success: bool,
    pub output: String,
    pub error: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl TaskResult {
    pub fn succeeded(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            success: true,
            output: output.into(),
            error: String::new(),
            started_at: now,
            completed_at: now,
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: error.into(),
            ..Self::succeeded(task_id, agent_id, "")
        }
    }

    /// Wall-clock time between start and completion
    pub fn execution_time(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    /// Execution time in fractional seconds
    pub fn execution_secs(&self) -> f64 {
        self.execution_time().num_milliseconds() as f64 / 1000.0
    }
}

/// Coarse lifecycle of a task as seen by the registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Assigned, no result stored yet
    Running,
    Completed,
    Failed,
    /// Result was garbage-collected; the request is kept for audit
    Collected,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Point-in-time snapshot of the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub active_tasks: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub active_conversations: usize,
    pub api_connected: bool,
    pub max_agents: usize,
    pub auto_spawn: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_result_shape() {
        let result = TaskResult::failed("t-1", "a-1", "boom");
        assert!(!result.success);
        assert_eq!(result.error, "boom");
        assert!(result.output.is_empty());
        assert_eq!(result.execution_time(), chrono::Duration::zero());
    }

    #[test]
    fn test_execution_secs() {
        let mut result = TaskResult::succeeded("t-1", "a-1", "ok");
        result.completed_at = result.started_at + chrono::Duration::milliseconds(1500);
        assert_eq!(result.execution_secs(), 1.5);
    }

    #[test]
    fn test_request_carries_options() {
        let options = TaskOptions::default()
            .with_priority(2.5)
            .with_timeout(Duration::from_secs(30))
            .with_repo_path("/repo");
        let task = TaskRequest::new("a-1", "fix it", "bugfix", &options);

        assert_eq!(task.priority, 2.5);
        assert_eq!(task.timeout(), Duration::from_secs(30));

        let exec = task.execute_options();
        assert_eq!(exec.task_id, task.id);
        assert_eq!(exec.agent_id, "a-1");
        assert_eq!(exec.repo_path, "/repo");
    }

    #[test]
    fn test_request_keeps_sub_second_timeout() {
        let options = TaskOptions::default().with_timeout(Duration::from_millis(1500));
        let task = TaskRequest::new("a-1", "fix it", "bugfix", &options);

        assert_eq!(task.timeout(), Duration::from_millis(1500));
        assert_eq!(task.execute_options().timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_result_serializes_task_id_as_id() {
        let result = TaskResult::succeeded("t-9", "a-1", "ok");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["id"], "t-9");
        assert_eq!(value["agentId"], "a-1");
    }
}
