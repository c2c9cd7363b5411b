//! Duplex adapter
//!
//! All operations share one persistent connection. A single dispatcher
//! task reads inbound envelopes in arrival order and routes replies to
//! the correlation table; when the connection ends it drains every
//! pending waiter.

use super::correlation::{CorrelationKey, CorrelationTable, WaitOutcome};
use super::{StatusMap, TaskAdapter};
use crate::error::{Result, TransportError};
use crate::types::{Envelope, EnvelopeKind, ExecuteOptions, TaskResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

/// In-memory ends of a duplex connection as seen by the adapter
pub struct DuplexLink {
    pub outbound: mpsc::Sender<Envelope>,
    pub inbound: mpsc::Receiver<Envelope>,
}

/// The far side of an in-process [`DuplexLink`]
pub struct RemotePeer {
    pub requests: mpsc::Receiver<Envelope>,
    pub replies: mpsc::Sender<Envelope>,
}

impl DuplexLink {
    pub fn new(outbound: mpsc::Sender<Envelope>, inbound: mpsc::Receiver<Envelope>) -> Self {
        Self { outbound, inbound }
    }

    /// Connected link/peer pair with no network in between
    pub fn pair(buffer: usize) -> (Self, RemotePeer) {
        let (outbound, requests) = mpsc::channel(buffer);
        let (replies, inbound) = mpsc::channel(buffer);
        (Self { outbound, inbound }, RemotePeer { requests, replies })
    }
}

impl RemotePeer {
    /// Next request sent by the adapter
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.requests.recv().await
    }

    /// Push a frame to the adapter's dispatcher
    pub async fn send(&self, envelope: Envelope) -> bool {
        self.replies.send(envelope).await.is_ok()
    }
}

/// Timeouts for the short control operations
#[derive(Debug, Clone)]
pub struct DuplexSettings {
    pub status_timeout: Duration,
    pub cancel_timeout: Duration,
    pub update_buffer: usize,
}

impl Default for DuplexSettings {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(10),
            cancel_timeout: Duration::from_secs(30),
            update_buffer: 256,
        }
    }
}

/// Task adapter multiplexing every operation over one duplex connection
pub struct DuplexAdapter {
    outbound: mpsc::Sender<Envelope>,
    table: CorrelationTable<Envelope>,
    connected: Arc<AtomicBool>,
    update_tx: broadcast::Sender<Envelope>,
    settings: DuplexSettings,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl DuplexAdapter {
    /// Wrap an established link and start its dispatcher
    pub fn new(link: DuplexLink) -> Self {
        Self::with_settings(link, DuplexSettings::default())
    }

    pub fn with_settings(link: DuplexLink, settings: DuplexSettings) -> Self {
        let table = CorrelationTable::new();
        let connected = Arc::new(AtomicBool::new(true));
        let (update_tx, _) = broadcast::channel(settings.update_buffer.max(1));

        let dispatcher = tokio::spawn(Self::dispatch_loop(
            link.inbound,
            table.clone(),
            Arc::clone(&connected),
            update_tx.clone(),
        ));

        Self {
            outbound: link.outbound,
            table,
            connected,
            update_tx,
            settings,
            dispatcher,
        }
    }

    /// Open a WebSocket connection and wrap it
    pub async fn connect(url: &str, api_key: &str, settings: DuplexSettings) -> Result<Self> {
        let link = super::websocket::connect(url, api_key).await?;
        info!("Duplex adapter connected: {}", url);
        Ok(Self::with_settings(link, settings))
    }

    /// Status updates that did not answer a pending status request
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Envelope> {
        self.update_tx.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.table.pending_count()
    }

    /// Register, send, then wait. Registration precedes the send so a
    /// fast reply can never be lost.
    async fn request(
        &self,
        key: String,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<WaitOutcome<Envelope>> {
        let waiter = self.table.register(key, timeout)?;
        trace!("Sending {:?} for {}", envelope.kind, waiter.key());

        // A stalled writer must not hold the caller past its deadline
        match tokio::time::timeout_at(waiter.deadline(), self.outbound.send(envelope)).await {
            Ok(Ok(())) => Ok(waiter.wait().await),
            Ok(Err(_)) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(TransportError::ConnectionClosed.into())
            }
            Err(_) => {
                warn!("Outbound queue full, {} timed out before sending", waiter.key());
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    async fn dispatch_loop(
        mut inbound: mpsc::Receiver<Envelope>,
        table: CorrelationTable<Envelope>,
        connected: Arc<AtomicBool>,
        update_tx: broadcast::Sender<Envelope>,
    ) {
        while let Some(envelope) = inbound.recv().await {
            Self::route(&table, &connected, &update_tx, envelope);
        }

        connected.store(false, Ordering::SeqCst);
        let drained = table.close_all();
        info!(
            "Duplex connection closed, released {} pending requests",
            drained
        );
    }

    fn route(
        table: &CorrelationTable<Envelope>,
        connected: &AtomicBool,
        update_tx: &broadcast::Sender<Envelope>,
        envelope: Envelope,
    ) {
        match envelope.kind {
            EnvelopeKind::ConnectionStatus => {
                let up = envelope.bool_field("connected").unwrap_or(false);
                connected.store(up, Ordering::SeqCst);
                info!("Backend reported connected={}", up);
            }
            EnvelopeKind::TaskResult | EnvelopeKind::StatusUpdate => {
                let Some(key) = Self::correlation_key(&envelope) else {
                    warn!("Dropping {:?} envelope without task_id", envelope.kind);
                    return;
                };
                let kind = envelope.kind;
                match table.try_resolve(&key, envelope) {
                    Ok(()) => debug!("Delivered {:?} for {}", kind, key),
                    Err(envelope) if kind == EnvelopeKind::StatusUpdate => {
                        trace!("Unsolicited status update for {}", key);
                        let _ = update_tx.send(envelope);
                    }
                    Err(_) => warn!("Received {:?} for unknown or expired key: {}", kind, key),
                }
            }
            other => warn!("Ignoring unexpected inbound envelope: {:?}", other),
        }
    }

    /// Explicit `correlation_id` wins; otherwise derive from kind and task id
    fn correlation_key(envelope: &Envelope) -> Option<String> {
        if let Some(id) = envelope.correlation_id() {
            return Some(id.to_string());
        }
        let task_id = envelope.task_id()?;
        match envelope.kind {
            EnvelopeKind::TaskResult => Some(CorrelationKey::execute(task_id)),
            EnvelopeKind::StatusUpdate => Some(CorrelationKey::status(task_id)),
            _ => None,
        }
    }

    fn result_from_reply(options: &ExecuteOptions, reply: &Envelope) -> TaskResult {
        let text = |primary: &str, fallback: &str| {
            reply
                .str_field(primary)
                .or_else(|| reply.str_field(fallback))
                .unwrap_or_default()
                .to_string()
        };

        let mut result = TaskResult::succeeded(
            options.task_id.clone(),
            options.agent_id.clone(),
            text("output", "stdout"),
        );
        result.success = reply.bool_field("success").unwrap_or(false);
        result.error = text("error", "stderr");
        result
    }
}

impl Drop for DuplexAdapter {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.table.close_all();
    }
}

#[async_trait]
impl TaskAdapter for DuplexAdapter {
    async fn execute(
        &self,
        agent_type: &str,
        prompt: &str,
        options: ExecuteOptions,
    ) -> Result<TaskResult> {
        let key = CorrelationKey::execute(&options.task_id);
        let envelope = Envelope::execute_agent(
            &key,
            &options.task_id,
            agent_type,
            prompt,
            options.timeout.as_secs(),
            &options.repo_path,
        );

        let outcome = self.request(key, envelope, options.timeout).await?;
        Ok(match outcome {
            WaitOutcome::Resolved(reply) => {
                let result = Self::result_from_reply(&options, &reply);
                info!(
                    "Task {} finished remotely (success={})",
                    options.task_id, result.success
                );
                result
            }
            WaitOutcome::TimedOut => {
                warn!("Timeout waiting for response: {}", options.task_id);
                TaskResult::failed(
                    options.task_id,
                    options.agent_id,
                    format!("Timeout waiting for response after {:?}", options.timeout),
                )
            }
            WaitOutcome::ConnectionClosed => {
                warn!("Connection closed while waiting for {}", options.task_id);
                TaskResult::failed(
                    options.task_id,
                    options.agent_id,
                    TransportError::ConnectionClosed.to_string(),
                )
            }
        })
    }

    async fn get_status(&self, task_id: &str) -> Result<StatusMap> {
        let key = CorrelationKey::status(task_id);
        let envelope = Envelope::get_status(&key, task_id);

        match self
            .request(key, envelope, self.settings.status_timeout)
            .await?
        {
            WaitOutcome::Resolved(reply) => Ok(reply.data),
            WaitOutcome::TimedOut => {
                let mut status = StatusMap::new();
                status.insert(
                    "error".to_string(),
                    Value::String("No response received".to_string()),
                );
                Ok(status)
            }
            WaitOutcome::ConnectionClosed => Err(TransportError::ConnectionClosed.into()),
        }
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        let key = CorrelationKey::cancel(task_id);
        let envelope = Envelope::cancel_task(&key, task_id);

        match self
            .request(key, envelope, self.settings.cancel_timeout)
            .await?
        {
            WaitOutcome::Resolved(reply) => Ok(reply.bool_field("success").unwrap_or(false)),
            WaitOutcome::TimedOut => {
                warn!("Cancellation of {} was not acknowledged", task_id);
                Ok(false)
            }
            WaitOutcome::ConnectionClosed => Err(TransportError::ConnectionClosed.into()),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.table.is_closed()
    }

    async fn health_check(&self) -> bool {
        let expired = self.table.expire_overdue();
        if expired > 0 {
            debug!("Health check expired {} overdue requests", expired);
        }
        self.is_connected()
    }
}
