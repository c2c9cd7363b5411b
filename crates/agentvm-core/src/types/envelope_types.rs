//! Duplex wire envelopes
//!
//! Every frame on the duplex channel is `{ "type": <kind>, "data": {...} }`.
//! Requests carry the caller's correlation key in `data.correlation_id`;
//! replies echo it back when the backend supports it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub type EnvelopeData = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    ExecuteAgent,
    GetStatus,
    CancelTask,
    TaskResult,
    StatusUpdate,
    ConnectionStatus,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub data: EnvelopeData,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => EnvelopeData::new(),
        };
        Self { kind, data }
    }

    pub fn execute_agent(
        correlation_id: &str,
        task_id: &str,
        agent_type: &str,
        prompt: &str,
        timeout_secs: u64,
        repo_path: &str,
    ) -> Self {
        Self::new(
            EnvelopeKind::ExecuteAgent,
            json!({
                "correlation_id": correlation_id,
                "task_id": task_id,
                "agent_type": agent_type,
                "prompt": prompt,
                "timeout": timeout_secs,
                "repo_path": repo_path,
            }),
        )
    }

    pub fn get_status(correlation_id: &str, task_id: &str) -> Self {
        Self::new(
            EnvelopeKind::GetStatus,
            json!({ "correlation_id": correlation_id, "task_id": task_id }),
        )
    }

    pub fn cancel_task(correlation_id: &str, task_id: &str) -> Self {
        Self::new(
            EnvelopeKind::CancelTask,
            json!({ "correlation_id": correlation_id, "task_id": task_id }),
        )
    }

    /// Reply frame for an execution, as produced by the backend
    pub fn task_result(task_id: &str, success: bool, output: &str, error: &str) -> Self {
        Self::new(
            EnvelopeKind::TaskResult,
            json!({
                "task_id": task_id,
                "success": success,
                "output": output,
                "error": error,
            }),
        )
    }

    pub fn connection_status(connected: bool) -> Self {
        Self::new(
            EnvelopeKind::ConnectionStatus,
            json!({ "connected": connected }),
        )
    }

    /// Attach an explicit correlation id
    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.data.insert(
            "correlation_id".to_string(),
            Value::String(correlation_id.to_string()),
        );
        self
    }

    pub fn task_id(&self) -> Option<&str> {
        self.str_field("task_id")
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.str_field("correlation_id")
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    pub fn bool_field(&self, field: &str) -> Option<bool> {
        self.data.get(field).and_then(Value::as_bool)
    }
}
