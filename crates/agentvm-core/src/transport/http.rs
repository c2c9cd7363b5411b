//! Stateless HTTP adapter
//!
//! One request per operation against the execution backend's REST API.
//! Failures never escape as errors from `execute`; they come back as a
//! failed `TaskResult` so the registry can record them.

use super::{StatusMap, TaskAdapter};
use crate::error::{Result, TransportError};
use crate::types::{ExecuteOptions, TaskResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

const CLIENT_USER_AGENT: &str = "AgentSystem/1.0";

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    agent: &'a str,
    prompt: &'a str,
    timeout: u64,
    repo_path: &'a str,
}

pub struct HttpAdapter {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    connected: AtomicBool,
}

impl HttpAdapter {
    /// Build the client; `timeout` bounds the control calls (health,
    /// status, cancel). Executions use the task's own timeout.
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = HeaderValue::from_str(api_key)
            .map_err(|e| TransportError::ConnectionFailed(format!("Invalid API key: {}", e)))?;
        headers.insert("x-api-key", key);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
            connected: AtomicBool::new(false),
        })
    }

    /// Construct and probe `/health` once
    pub async fn connect(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let adapter = Self::new(endpoint, api_key, timeout)?;
        adapter.test_connection().await;
        info!("HTTP API adapter initialized: {}", adapter.endpoint);
        Ok(adapter)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Probe `/health` and record the outcome
    pub async fn test_connection(&self) -> bool {
        let probe = self.client.get(self.url("/health")).timeout(self.timeout);
        let up = match probe.send().await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                warn!("API health check failed: {}", response.status());
                false
            }
            Err(e) => {
                error!("API connection test failed: {}", e);
                false
            }
        };
        self.connected.store(up, Ordering::SeqCst);
        up
    }

    async fn run(
        &self,
        agent_type: &str,
        prompt: &str,
        options: &ExecuteOptions,
    ) -> std::result::Result<TaskResult, String> {
        let body = RunRequest {
            agent: agent_type,
            prompt,
            timeout: options.timeout.as_secs(),
            repo_path: &options.repo_path,
        };

        let response = self
            .client
            .post(self.url("/agent/run"))
            .timeout(options.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;

        let status = response.status();
        let data: Value = response.json().await.unwrap_or(Value::Null);

        if status != StatusCode::OK {
            return Err(data
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16())));
        }

        let text = |field: &str| {
            data.get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let mut result = TaskResult::succeeded(
            options.task_id.clone(),
            options.agent_id.clone(),
            text("stdout"),
        );
        result.success = data.get("success").and_then(Value::as_bool).unwrap_or(false);
        result.error = text("stderr");
        Ok(result)
    }
}

fn error_status(message: String) -> StatusMap {
    let mut status = StatusMap::new();
    status.insert("error".to_string(), Value::String(message));
    status
}

#[async_trait]
impl TaskAdapter for HttpAdapter {
    async fn execute(
        &self,
        agent_type: &str,
        prompt: &str,
        options: ExecuteOptions,
    ) -> Result<TaskResult> {
        let started_at = chrono::Utc::now();
        let mut result = match self.run(agent_type, prompt, &options).await {
            Ok(result) => {
                info!("Agent task executed: {}", result.task_id);
                result
            }
            Err(message) => {
                error!("Agent task {} failed: {}", options.task_id, message);
                TaskResult::failed(options.task_id, options.agent_id, message)
            }
        };
        result.started_at = started_at;
        result.completed_at = chrono::Utc::now();
        Ok(result)
    }

    async fn get_status(&self, task_id: &str) -> Result<StatusMap> {
        let url = self.url(&format!("/agent/status/{}", task_id));
        let response = match self.client.get(url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => return Ok(error_status(format!("Status check failed: {}", e))),
        };

        if response.status() != StatusCode::OK {
            let message = format!("HTTP {}", response.status().as_u16());
            error!("Failed to get agent status: {}", message);
            return Ok(error_status(message));
        }

        match response.json::<Value>().await {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Ok(error_status("Status response was not an object".to_string())),
            Err(e) => Ok(error_status(format!("Status check failed: {}", e))),
        }
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        let url = self.url(&format!("/agent/cancel/{}", task_id));
        match self.client.post(url).timeout(self.timeout).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                info!("Task {} cancelled", task_id);
                Ok(true)
            }
            Ok(response) => {
                error!(
                    "Failed to cancel task {}: HTTP {}",
                    task_id,
                    response.status().as_u16()
                );
                Ok(false)
            }
            Err(e) => {
                error!("Task cancellation failed: {}", e);
                Ok(false)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> bool {
        self.test_connection().await
    }
}
