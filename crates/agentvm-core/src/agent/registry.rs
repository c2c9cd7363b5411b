//! Agent/task registry
//!
//! In-memory store of agent descriptors, task requests and task results.
//! All three maps sit behind one lock; nothing holds it across an await,
//! so read-only queries never suspend.

use super::EntityAdapter;
use crate::config::{AgentSystemConfig, ConfigProvider, SystemSettings};
use crate::error::{RegistryError, Result};
use crate::events::{payload, topics, EventBus};
use crate::transport::{StatusMap, TaskAdapter};
use crate::types::*;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest accepted prompt, in characters
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// Longest accepted task timeout
pub const MAX_TASK_TIMEOUT: Duration = Duration::from_secs(3600);

const MAX_PRIORITY: f64 = 10.0;

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentDescriptor>,
    agent_states: HashMap<String, AgentState>,
    tasks: HashMap<String, TaskRequest>,
    results: HashMap<String, TaskResult>,
    /// Tasks whose result was removed by cleanup
    collected: HashSet<String>,
    conversations: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn is_outstanding(&self, task: &TaskRequest) -> bool {
        !self.results.contains_key(&task.id) && !self.collected.contains(&task.id)
    }

    fn outstanding_for<'a>(&'a self, agent_id: &'a str) -> impl Iterator<Item = &'a TaskRequest> {
        self.tasks
            .values()
            .filter(move |task| task.agent_id == agent_id && self.is_outstanding(task))
    }

    fn is_idle(&self, agent_id: &str) -> bool {
        self.outstanding_for(agent_id).next().is_none()
    }

    fn idle_count(&self) -> usize {
        self.agents.keys().filter(|id| self.is_idle(id)).count()
    }

    fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        if let Some(result) = self.results.get(task_id) {
            return Some(if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            });
        }
        if self.collected.contains(task_id) {
            return Some(TaskStatus::Collected);
        }
        self.tasks.get(task_id).map(|_| TaskStatus::Running)
    }
}

fn sorted(mut agents: Vec<AgentDescriptor>) -> Vec<AgentDescriptor> {
    agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    agents
}

fn cutoff(older_than: Duration) -> Option<DateTime<Utc>> {
    let span = chrono::Duration::from_std(older_than).ok()?;
    Utc::now().checked_sub_signed(span)
}

fn invalid(field: &'static str, reason: impl Into<String>) -> RegistryError {
    RegistryError::InvalidRequest {
        field,
        reason: reason.into(),
    }
}

/// Reject a request before any TaskRequest exists for it
fn validate_request(prompt: &str, options: &TaskOptions) -> std::result::Result<(), RegistryError> {
    if prompt.trim().is_empty() {
        return Err(invalid("prompt", "must not be empty"));
    }
    let length = prompt.chars().count();
    if length > MAX_PROMPT_CHARS {
        return Err(invalid(
            "prompt",
            format!("{} characters exceeds the limit of {}", length, MAX_PROMPT_CHARS),
        ));
    }
    if !(options.priority > 0.0 && options.priority <= MAX_PRIORITY) {
        return Err(invalid(
            "priority",
            format!("{} is outside (0, {}]", options.priority, MAX_PRIORITY),
        ));
    }
    if options.timeout < Duration::from_secs(1) || options.timeout > MAX_TASK_TIMEOUT {
        return Err(invalid(
            "timeout",
            format!(
                "{}s is outside 1..={}s",
                options.timeout.as_secs(),
                MAX_TASK_TIMEOUT.as_secs()
            ),
        ));
    }
    Ok(())
}

/// Tracks agents and their tasks, and relays execution to the adapter
pub struct AgentRegistry {
    settings: SystemSettings,
    agent_types: Vec<AgentTypeDefinition>,
    state: RwLock<RegistryState>,
    adapter: RwLock<Option<Arc<dyn TaskAdapter>>>,
    entities: RwLock<Option<Arc<dyn EntityAdapter>>>,
    events: EventBus,
}

impl AgentRegistry {
    pub fn new(config: &AgentSystemConfig) -> Self {
        Self {
            settings: config.system.clone(),
            agent_types: config.agent_types.clone(),
            state: RwLock::new(RegistryState::default()),
            adapter: RwLock::new(None),
            entities: RwLock::new(None),
            events: EventBus::new(),
        }
    }

    /// Build from a provider, falling back to defaults if it fails
    pub fn from_provider(provider: &dyn ConfigProvider) -> Self {
        match provider.load() {
            Ok(config) => {
                info!("Configuration loaded successfully");
                Self::new(&config)
            }
            Err(e) => {
                error!("Failed to load configuration, using defaults: {}", e);
                Self::new(&AgentSystemConfig::default())
            }
        }
    }

    pub fn with_adapter(self, adapter: Arc<dyn TaskAdapter>) -> Self {
        self.set_adapter(adapter);
        self
    }

    pub fn set_adapter(&self, adapter: Arc<dyn TaskAdapter>) {
        *self.adapter.write() = Some(adapter);
        info!("Task adapter configured");
    }

    pub fn set_entity_adapter(&self, entities: Arc<dyn EntityAdapter>) {
        *self.entities.write() = Some(entities);
        info!("Entity adapter configured");
    }

    pub fn adapter(&self) -> Option<Arc<dyn TaskAdapter>> {
        self.adapter.read().clone()
    }

    fn entities(&self) -> Option<Arc<dyn EntityAdapter>> {
        self.entities.read().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn agent_types(&self) -> &[AgentTypeDefinition] {
        &self.agent_types
    }

    fn definition(&self, agent_type: AgentType) -> Option<&AgentTypeDefinition> {
        self.agent_types
            .iter()
            .find(|definition| definition.agent_type == agent_type)
    }

    // ----- agents -----

    /// Register a new agent of a configured type
    pub async fn create_agent(
        &self,
        agent_type: &str,
        position: Option<Position>,
        metadata: Option<Metadata>,
    ) -> Result<String> {
        self.ensure_capacity(self.state.read().agents.len())?;

        let kind: AgentType = agent_type.parse()?;
        let definition = self
            .definition(kind)
            .ok_or_else(|| RegistryError::UnknownAgentType(agent_type.to_string()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let descriptor = AgentDescriptor::from_definition(&id, definition, position, metadata);

        {
            let mut state = self.state.write();
            // re-checked under the write lock so concurrent creates stay bounded
            self.ensure_capacity(state.agents.len())?;
            state.agents.insert(id.clone(), descriptor.clone());
            state.agent_states.insert(id.clone(), AgentState::Idle);
        }

        if let Some(entities) = self.entities() {
            if let Err(e) = entities.create_agent(&descriptor).await {
                warn!("Entity creation failed for agent {}: {}", id, e);
            }
        }

        info!("Created agent {} of type {}", id, kind);
        self.events.publish(
            topics::AGENT_CREATED,
            payload(json!({ "agent_id": id, "type": kind.as_str() })),
        );
        Ok(id)
    }

    fn ensure_capacity(&self, live: usize) -> Result<()> {
        if live >= self.settings.max_agents {
            return Err(RegistryError::CapacityExceeded {
                max: self.settings.max_agents,
            }
            .into());
        }
        Ok(())
    }

    /// Remove an agent, cancelling its outstanding tasks first.
    ///
    /// Returns false if the agent is unknown. Cancellation is best-effort
    /// and never prevents removal.
    pub async fn destroy_agent(&self, agent_id: &str) -> bool {
        let outstanding: Vec<String> = {
            let state = self.state.read();
            if !state.agents.contains_key(agent_id) {
                return false;
            }
            state
                .outstanding_for(agent_id)
                .map(|task| task.id.clone())
                .collect()
        };

        self.cancel_outstanding(agent_id, &outstanding).await;

        if let Some(entities) = self.entities() {
            if let Err(e) = entities.destroy_agent(agent_id).await {
                warn!("Entity removal failed for agent {}: {}", agent_id, e);
            }
        }

        let removed = {
            let mut state = self.state.write();
            state.agent_states.remove(agent_id);
            state.agents.remove(agent_id).is_some()
        };
        if !removed {
            return false;
        }

        info!("Destroyed agent {}", agent_id);
        self.events.publish(
            topics::AGENT_DESTROYED,
            payload(json!({ "agent_id": agent_id, "cancelled_tasks": outstanding })),
        );
        true
    }

    async fn cancel_outstanding(&self, agent_id: &str, task_ids: &[String]) {
        if task_ids.is_empty() {
            return;
        }
        let Some(adapter) = self.adapter() else {
            warn!(
                "No adapter to cancel {} tasks of agent {}",
                task_ids.len(),
                agent_id
            );
            return;
        };
        for task_id in task_ids {
            match adapter.cancel(task_id).await {
                Ok(true) => debug!("Cancelled task {}", task_id),
                Ok(false) => warn!("Backend did not cancel task {}", task_id),
                Err(e) => error!("Failed to cancel task {}: {}", task_id, e),
            }
        }
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.state.read().agents.get(agent_id).cloned()
    }

    /// All agents, oldest first
    pub fn list_agents(&self) -> Vec<AgentDescriptor> {
        sorted(self.state.read().agents.values().cloned().collect())
    }

    pub fn agents_by_type(&self, agent_type: AgentType) -> Vec<AgentDescriptor> {
        let state = self.state.read();
        sorted(
            state
                .agents
                .values()
                .filter(|agent| agent.agent_type == agent_type)
                .cloned()
                .collect(),
        )
    }

    /// Agents with no task lacking a result, oldest first
    pub fn list_idle_agents(&self) -> Vec<AgentDescriptor> {
        let state = self.state.read();
        sorted(
            state
                .agents
                .values()
                .filter(|agent| state.is_idle(&agent.id))
                .cloned()
                .collect(),
        )
    }

    /// Merge `metadata` into the agent's metadata
    pub fn update_agent_metadata(&self, agent_id: &str, metadata: Metadata) -> Result<()> {
        let mut state = self.state.write();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        agent.metadata.extend(metadata);
        Ok(())
    }

    pub fn agent_state(&self, agent_id: &str) -> Option<AgentState> {
        self.state.read().agent_states.get(agent_id).copied()
    }

    pub fn agent_position(&self, agent_id: &str) -> Option<Position> {
        if let Some(position) = self
            .entities()
            .and_then(|entities| entities.agent_position(agent_id))
        {
            return Some(position);
        }
        self.state
            .read()
            .agents
            .get(agent_id)
            .map(|agent| agent.position)
    }

    /// Change an agent's visual state, notifying the entity adapter
    pub async fn set_agent_state(&self, agent_id: &str, new_state: AgentState) -> Result<()> {
        let previous = {
            let mut state = self.state.write();
            let slot = state
                .agent_states
                .get_mut(agent_id)
                .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
            std::mem::replace(slot, new_state)
        };
        if previous == new_state {
            return Ok(());
        }

        if let Some(entities) = self.entities() {
            if let Err(e) = entities.update_agent_state(agent_id, new_state).await {
                warn!("Entity state update failed for agent {}: {}", agent_id, e);
            }
        }

        self.events.publish(
            topics::AGENT_STATE_CHANGED,
            payload(json!({
                "agent_id": agent_id,
                "state": new_state.as_str(),
                "previous": previous.as_str(),
            })),
        );
        Ok(())
    }

    async fn mark(&self, agent_id: &str, state: AgentState) {
        if let Err(e) = self.set_agent_state(agent_id, state).await {
            debug!("Skipping state change to {}: {}", state.as_str(), e);
        }
    }

    // ----- tasks -----

    /// Run a task on a specific agent and store its result.
    ///
    /// Validation, unknown agents and a missing adapter raise before any
    /// TaskRequest exists. Transport faults, timeouts and remote failures
    /// all come back as a failed `TaskResult`.
    pub async fn assign_task(
        &self,
        agent_id: &str,
        prompt: &str,
        task_type: &str,
        options: TaskOptions,
    ) -> Result<TaskResult> {
        validate_request(prompt, &options)?;
        if self.get_agent(agent_id).is_none() {
            return Err(RegistryError::UnknownAgent(agent_id.to_string()).into());
        }
        let adapter = self.adapter().ok_or(RegistryError::AdapterUnavailable)?;

        let task = TaskRequest::new(agent_id, prompt, task_type, &options);
        let agent_type = {
            let mut state = self.state.write();
            let agent_type = state
                .agents
                .get(agent_id)
                .map(|agent| agent.agent_type)
                .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
            state.tasks.insert(task.id.clone(), task.clone());
            agent_type
        };

        info!("Task {} assigned to agent {}", task.id, agent_id);
        self.mark(agent_id, AgentState::Coding).await;

        let started_at = Utc::now();
        let mut result = match adapter
            .execute(agent_type.as_str(), &task.prompt, task.execute_options())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Task {} failed for agent {}: {}", task.id, agent_id, e);
                TaskResult::failed(&task.id, agent_id, e.to_string())
            }
        };
        result.task_id = task.id.clone();
        result.agent_id = agent_id.to_string();
        result.started_at = started_at;
        result.completed_at = Utc::now();

        let result = self.store_result(result);
        self.mark(
            agent_id,
            if result.success {
                AgentState::Idle
            } else {
                AgentState::Error
            },
        )
        .await;

        if result.success {
            info!("Task {} completed for agent {}", task.id, agent_id);
            self.events.publish(
                topics::TASK_COMPLETED,
                payload(json!({
                    "task_id": result.task_id,
                    "agent_id": agent_id,
                    "success": true,
                    "output": result.output,
                    "execution_time": result.execution_secs(),
                })),
            );
        } else {
            warn!("Task {} failed for agent {}: {}", task.id, agent_id, result.error);
            self.events.publish(
                topics::TASK_FAILED,
                payload(json!({
                    "task_id": result.task_id,
                    "agent_id": agent_id,
                    "error": result.error,
                })),
            );
        }
        Ok(result)
    }

    /// The first stored result for a task wins
    fn store_result(&self, result: TaskResult) -> TaskResult {
        let mut state = self.state.write();
        match state.results.entry(result.task_id.clone()) {
            Entry::Occupied(existing) => {
                error!(
                    "Result for task {} already stored, discarding the new one",
                    result.task_id
                );
                existing.get().clone()
            }
            Entry::Vacant(slot) => slot.insert(result).clone(),
        }
    }

    /// Pick an agent and run the task on it.
    ///
    /// Preference order: an idle agent of `preferred`, any idle agent, a
    /// freshly spawned agent (when auto-spawn and capacity allow), then
    /// the live agent with the fewest outstanding tasks.
    pub async fn assign_task_to_best_agent(
        &self,
        prompt: &str,
        task_type: &str,
        preferred: Option<AgentType>,
        options: TaskOptions,
    ) -> Result<TaskResult> {
        validate_request(prompt, &options)?;
        let agent_id = self.select_agent(preferred).await?;
        self.assign_task(&agent_id, prompt, task_type, options).await
    }

    async fn select_agent(&self, preferred: Option<AgentType>) -> Result<String> {
        let idle = self.list_idle_agents();
        if let Some(kind) = preferred {
            if let Some(agent) = idle.iter().find(|agent| agent.agent_type == kind) {
                return Ok(agent.id.clone());
            }
        }
        if let Some(agent) = idle.first() {
            return Ok(agent.id.clone());
        }

        if self.settings.auto_spawn {
            let kind = preferred
                .filter(|kind| self.definition(*kind).is_some())
                .or_else(|| self.least_populated_type());
            if let Some(kind) = kind {
                match self.create_agent(kind.as_str(), None, None).await {
                    Ok(id) => return Ok(id),
                    Err(e) => debug!("No agent spawned for assignment: {}", e),
                }
            }
        }

        let state = self.state.read();
        state
            .agents
            .values()
            .min_by_key(|agent| {
                (
                    state.outstanding_for(&agent.id).count(),
                    agent.created_at,
                )
            })
            .map(|agent| agent.id.clone())
            .ok_or_else(|| RegistryError::NoAgentAvailable.into())
    }

    fn least_populated_type(&self) -> Option<AgentType> {
        let state = self.state.read();
        self.agent_types
            .iter()
            .map(|definition| definition.agent_type)
            .min_by_key(|kind| {
                state
                    .agents
                    .values()
                    .filter(|agent| agent.agent_type == *kind)
                    .count()
            })
    }

    /// Spawn agents until `min_idle_agents` are idle or capacity is hit
    pub async fn auto_spawn_check(&self) -> Result<usize> {
        if !self.settings.auto_spawn {
            return Ok(0);
        }

        let mut spawned = 0;
        loop {
            let (idle, total) = {
                let state = self.state.read();
                (state.idle_count(), state.agents.len())
            };
            if idle >= self.settings.min_idle_agents || total >= self.settings.max_agents {
                break;
            }
            let Some(kind) = self.least_populated_type() else {
                break;
            };
            match self.create_agent(kind.as_str(), None, None).await {
                Ok(_) => spawned += 1,
                Err(crate::error::Error::Registry(RegistryError::CapacityExceeded { .. })) => break,
                Err(e) => return Err(e),
            }
        }

        if spawned > 0 {
            info!("Auto-spawned {} agents", spawned);
        }
        Ok(spawned)
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskRequest> {
        self.state.read().tasks.get(task_id).cloned()
    }

    pub fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.state.read().results.get(task_id).cloned()
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state.read().task_status(task_id)
    }

    /// Tasks of an agent still waiting for a result
    pub fn outstanding_tasks(&self, agent_id: &str) -> Vec<TaskRequest> {
        let state = self.state.read();
        let mut tasks: Vec<TaskRequest> = state.outstanding_for(agent_id).cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Ask the backend to cancel a running task; false if it is unknown
    /// or already finished.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        if self.task_status(task_id) != Some(TaskStatus::Running) {
            return Ok(false);
        }
        let adapter = self.adapter().ok_or(RegistryError::AdapterUnavailable)?;
        adapter.cancel(task_id).await
    }

    /// Live status document from the backend
    pub async fn remote_task_status(&self, task_id: &str) -> Result<StatusMap> {
        let adapter = self.adapter().ok_or(RegistryError::AdapterUnavailable)?;
        adapter.get_status(task_id).await
    }

    // ----- conversations -----

    pub fn start_conversation(&self, agent_ids: &[String]) -> Result<String> {
        if agent_ids.is_empty() {
            return Err(invalid("agent_ids", "a conversation needs at least one agent").into());
        }
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.write();
            if let Some(unknown) = agent_ids.iter().find(|id| !state.agents.contains_key(*id)) {
                return Err(RegistryError::UnknownAgent(unknown.clone()).into());
            }
            state.conversations.insert(id.clone(), agent_ids.to_vec());
        }

        info!("Started conversation {} with {} agents", id, agent_ids.len());
        self.events.publish(
            topics::CONVERSATION_STARTED,
            payload(json!({ "conversation_id": id, "agent_ids": agent_ids })),
        );
        Ok(id)
    }

    pub fn end_conversation(&self, conversation_id: &str) -> Result<()> {
        let participants = self
            .state
            .write()
            .conversations
            .remove(conversation_id)
            .ok_or_else(|| RegistryError::UnknownConversation(conversation_id.to_string()))?;

        info!("Ended conversation {}", conversation_id);
        self.events.publish(
            topics::CONVERSATION_ENDED,
            payload(json!({ "conversation_id": conversation_id, "agent_ids": participants })),
        );
        Ok(())
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Vec<String>> {
        self.state.read().conversations.get(conversation_id).cloned()
    }

    // ----- status and maintenance -----

    /// Point-in-time counts; never suspends
    pub fn get_system_status(&self) -> SystemStatus {
        let api_connected = self
            .adapter
            .read()
            .as_ref()
            .map(|adapter| adapter.is_connected())
            .unwrap_or(false);

        let state = self.state.read();
        SystemStatus {
            total_agents: state.agents.len(),
            idle_agents: state.idle_count(),
            active_tasks: state
                .tasks
                .values()
                .filter(|task| state.is_outstanding(task))
                .count(),
            total_tasks: state.tasks.len(),
            completed_tasks: state.results.values().filter(|r| r.success).count(),
            failed_tasks: state.results.values().filter(|r| !r.success).count(),
            active_conversations: state.conversations.len(),
            api_connected,
            max_agents: self.settings.max_agents,
            auto_spawn: self.settings.auto_spawn,
        }
    }

    /// Drop results completed more than `older_than` ago
    pub fn cleanup_completed_tasks(&self, older_than: Duration) -> usize {
        match cutoff(older_than) {
            Some(cutoff) => self.cleanup_completed_before(cutoff),
            None => 0,
        }
    }

    /// Drop results with `completed_at` strictly before `cutoff`.
    ///
    /// The originating TaskRequests stay; their ids are remembered so the
    /// owning agents remain idle.
    pub fn cleanup_completed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let expired: Vec<String> = state
            .results
            .iter()
            .filter(|(_, result)| result.completed_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            state.results.remove(id);
            if state.tasks.contains_key(id) {
                state.collected.insert(id.clone());
            }
        }

        if !expired.is_empty() {
            info!("Cleaned up {} old task results", expired.len());
        }
        expired.len()
    }

    /// Drop collected TaskRequests created more than `older_than` ago
    pub fn purge_task_history(&self, older_than: Duration) -> usize {
        match cutoff(older_than) {
            Some(cutoff) => self.purge_tasks_before(cutoff),
            None => 0,
        }
    }

    pub fn purge_tasks_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let purgeable: Vec<String> = state
            .collected
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .map(|task| task.created_at < cutoff)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        for id in &purgeable {
            state.tasks.remove(id);
            state.collected.remove(id);
        }

        if !purgeable.is_empty() {
            info!("Purged {} collected task requests", purgeable.len());
        }
        purgeable.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigProvider;
    use crate::error::{Error, TransportError};
    use crate::events::LifecycleEvent;
    use crate::transport::{DuplexAdapter, DuplexLink, DuplexSettings, MockTaskAdapter};
    use crate::types::{Envelope, EnvelopeKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn config(max_agents: usize, auto_spawn: bool) -> AgentSystemConfig {
        let mut config = AgentSystemConfig::default();
        config.system.max_agents = max_agents;
        config.system.min_idle_agents = max_agents.min(2);
        config.system.auto_spawn = auto_spawn;
        config
    }

    fn succeeding_adapter() -> Arc<dyn TaskAdapter> {
        let mut mock = MockTaskAdapter::new();
        mock.expect_execute().returning(|_, prompt, options| {
            Ok(TaskResult::succeeded(
                options.task_id,
                options.agent_id,
                format!("done: {}", prompt),
            ))
        });
        mock.expect_is_connected().return_const(true);
        Arc::new(mock)
    }

    fn record(registry: &AgentRegistry, topic: &'static str) -> Arc<Mutex<Vec<LifecycleEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.events().subscribe(topic, move |event| {
            sink.lock().push(event.clone());
            Ok(())
        });
        seen
    }

    #[derive(Default)]
    struct RecordingEntities {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EntityAdapter for RecordingEntities {
        async fn create_agent(&self, agent: &AgentDescriptor) -> Result<()> {
            self.calls.lock().push(format!("create:{}", agent.agent_type));
            Ok(())
        }

        async fn update_agent_state(&self, _agent_id: &str, state: AgentState) -> Result<()> {
            self.calls.lock().push(format!("state:{}", state.as_str()));
            Ok(())
        }

        async fn destroy_agent(&self, _agent_id: &str) -> Result<()> {
            self.calls.lock().push("destroy".to_string());
            Err(Error::Internal("scene unavailable".to_string()))
        }

        fn agent_position(&self, _agent_id: &str) -> Option<Position> {
            Some(Position::new(1.0, 2.0, 3.0))
        }
    }

    #[tokio::test]
    async fn test_capacity_scenario() {
        let registry = AgentRegistry::new(&config(1, false));

        let a = registry.create_agent("aider", None, None).await.unwrap();
        let err = registry.create_agent("claude", None, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::CapacityExceeded { max: 1 })
        ));
        assert_eq!(registry.list_agents().len(), 1);

        // a full registry reports capacity before looking at the type
        for kind in ["custom", "cursor"] {
            let err = registry.create_agent(kind, None, None).await.unwrap_err();
            assert!(matches!(
                err,
                Error::Registry(RegistryError::CapacityExceeded { max: 1 })
            ));
        }

        assert!(registry.destroy_agent(&a).await);
        assert!(registry.get_agent(&a).is_none());
        registry.create_agent("claude", None, None).await.unwrap();
        assert_eq!(registry.list_agents().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_type() {
        let registry = AgentRegistry::new(&config(5, false));

        let err = registry.create_agent("cursor", None, None).await.unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::UnknownAgentType(_))));

        // known kind, but not configured
        let err = registry.create_agent("custom", None, None).await.unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::UnknownAgentType(t)) if t == "custom"));
        assert!(registry.list_agents().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_unknown_is_noop() {
        let registry = AgentRegistry::new(&config(5, false));
        let destroyed = record(&registry, topics::AGENT_DESTROYED);

        assert!(!registry.destroy_agent("missing").await);
        assert!(destroyed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_create_emits_and_notifies_entities() {
        let registry = AgentRegistry::new(&config(5, false));
        let entities = Arc::new(RecordingEntities::default());
        registry.set_entity_adapter(entities.clone());
        let created = record(&registry, topics::AGENT_CREATED);

        let mut metadata = Metadata::new();
        metadata.insert("team".to_string(), json!("blue"));
        let id = registry
            .create_agent("OpenCode", Some(Position::new(4.0, 0.0, 1.0)), Some(metadata))
            .await
            .unwrap();

        let agent = registry.get_agent(&id).unwrap();
        assert_eq!(agent.agent_type, AgentType::OpenCode);
        assert_eq!(agent.metadata["team"], "blue");
        assert_eq!(registry.agent_state(&id), Some(AgentState::Idle));
        assert_eq!(registry.agent_position(&id), Some(Position::new(1.0, 2.0, 3.0)));

        let events = created.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].str_field("agent_id"), Some(id.as_str()));
        assert_eq!(events[0].str_field("type"), Some("opencode"));

        // entity failure on destroy does not block removal
        drop(events);
        assert!(registry.destroy_agent(&id).await);
        assert_eq!(
            *entities.calls.lock(),
            vec!["create:opencode".to_string(), "destroy".to_string()]
        );
    }

    #[tokio::test]
    async fn test_assign_requires_agent_then_adapter() {
        let registry = AgentRegistry::new(&config(5, false));

        let err = registry
            .assign_task("ghost", "do it", "general", TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::UnknownAgent(_))));

        let id = registry.create_agent("aider", None, None).await.unwrap();
        let err = registry
            .assign_task(&id, "do it", "general", TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::AdapterUnavailable)));
        assert!(registry.outstanding_tasks(&id).is_empty());
        assert_eq!(registry.get_system_status().total_tasks, 0);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let registry = AgentRegistry::new(&config(5, false)).with_adapter(succeeding_adapter());
        let id = registry.create_agent("aider", None, None).await.unwrap();

        let cases = [
            ("   ", TaskOptions::default(), "prompt"),
            ("x", TaskOptions::default().with_priority(0.0), "priority"),
            ("x", TaskOptions::default().with_priority(10.5), "priority"),
            ("x", TaskOptions::default().with_timeout(Duration::ZERO), "timeout"),
            ("x", TaskOptions::default().with_timeout(Duration::from_secs(3601)), "timeout"),
        ];
        for (prompt, options, expected) in cases {
            let err = registry
                .assign_task(&id, prompt, "general", options)
                .await
                .unwrap_err();
            assert!(
                matches!(err, Error::Registry(RegistryError::InvalidRequest { field, .. }) if field == expected),
                "expected {} rejection",
                expected
            );
        }

        let long = "a".repeat(MAX_PROMPT_CHARS + 1);
        assert!(registry
            .assign_task(&id, &long, "general", TaskOptions::default())
            .await
            .is_err());
        assert_eq!(registry.get_system_status().total_tasks, 0);
    }

    #[tokio::test]
    async fn test_assign_stores_result_and_emits() {
        let registry = AgentRegistry::new(&config(5, false)).with_adapter(succeeding_adapter());
        let completed = record(&registry, topics::TASK_COMPLETED);
        let states = record(&registry, topics::AGENT_STATE_CHANGED);
        let id = registry.create_agent("claude", None, None).await.unwrap();

        let result = registry
            .assign_task(&id, "explain", "review", TaskOptions::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, "done: explain");
        assert_eq!(result.agent_id, id);
        assert_eq!(registry.get_task_result(&result.task_id), Some(result.clone()));
        assert_eq!(registry.task_status(&result.task_id), Some(TaskStatus::Completed));
        assert_eq!(registry.get_task(&result.task_id).unwrap().task_type, "review");

        let events = completed.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].str_field("task_id"), Some(result.task_id.as_str()));

        let transitions: Vec<_> = states
            .lock()
            .iter()
            .map(|e| e.str_field("state").unwrap_or_default().to_string())
            .collect();
        assert_eq!(transitions, vec!["coding", "idle"]);

        let status = registry.get_system_status();
        assert_eq!(status.total_agents, 1);
        assert_eq!(status.idle_agents, 1);
        assert_eq!(status.active_tasks, 0);
        assert_eq!(status.completed_tasks, 1);
        assert!(status.api_connected);
    }

    #[tokio::test]
    async fn test_adapter_error_becomes_failed_result() {
        let mut mock = MockTaskAdapter::new();
        mock.expect_execute()
            .returning(|_, _, _| Err(TransportError::ConnectionFailed("refused".to_string()).into()));
        mock.expect_is_connected().return_const(false);

        let registry = AgentRegistry::new(&config(5, false)).with_adapter(Arc::new(mock));
        let failed = record(&registry, topics::TASK_FAILED);
        let id = registry.create_agent("aider", None, None).await.unwrap();

        let result = registry
            .assign_task(&id, "fix", "bugfix", TaskOptions::default())
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.contains("refused"));
        assert_eq!(registry.agent_state(&id), Some(AgentState::Error));
        assert_eq!(failed.lock().len(), 1);

        let status = registry.get_system_status();
        assert_eq!(status.failed_tasks, 1);
        assert!(!status.api_connected);
    }

    #[tokio::test]
    async fn test_idle_excludes_agent_with_pending_task() {
        let (link, mut peer) = DuplexLink::pair(8);
        let registry = Arc::new(
            AgentRegistry::new(&config(5, false)).with_adapter(Arc::new(DuplexAdapter::new(link))),
        );
        let id = registry.create_agent("aider", None, None).await.unwrap();
        assert_eq!(registry.list_idle_agents().len(), 1);

        let call = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .assign_task(&id, "refactor", "general", TaskOptions::default())
                    .await
            })
        };

        let request = peer.recv().await.unwrap();
        assert_eq!(request.kind, EnvelopeKind::ExecuteAgent);
        assert!(registry.list_idle_agents().is_empty());
        assert_eq!(registry.outstanding_tasks(&id).len(), 1);
        assert_eq!(registry.get_system_status().active_tasks, 1);

        let task_id = request.task_id().unwrap().to_string();
        peer.send(Envelope::task_result(&task_id, true, "ok", "")).await;

        let result = call.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.task_id, task_id);
        assert_eq!(registry.list_idle_agents().len(), 1);
    }

    #[tokio::test]
    async fn test_duplex_timeout_returns_failed_result() {
        let (link, _peer) = DuplexLink::pair(8);
        let registry =
            AgentRegistry::new(&config(5, false)).with_adapter(Arc::new(DuplexAdapter::new(link)));
        let id = registry.create_agent("aider", None, None).await.unwrap();

        let result = registry
            .assign_task(
                &id,
                "slow job",
                "general",
                TaskOptions::default().with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.contains("Timeout"));
        assert_eq!(registry.task_status(&result.task_id), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_destroy_cancels_outstanding_tasks() {
        let (link, mut peer) = DuplexLink::pair(8);
        let settings = DuplexSettings {
            cancel_timeout: Duration::from_secs(5),
            ..DuplexSettings::default()
        };
        let registry = Arc::new(
            AgentRegistry::new(&config(5, false))
                .with_adapter(Arc::new(DuplexAdapter::with_settings(link, settings))),
        );
        let destroyed = record(&registry, topics::AGENT_DESTROYED);
        let id = registry.create_agent("aider", None, None).await.unwrap();

        let call = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .assign_task(&id, "long job", "general", TaskOptions::default())
                    .await
            })
        };
        let execute = peer.recv().await.unwrap();
        let task_id = execute.task_id().unwrap().to_string();

        let destroy = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { registry.destroy_agent(&id).await })
        };
        let cancel = peer.recv().await.unwrap();
        assert_eq!(cancel.kind, EnvelopeKind::CancelTask);
        assert_eq!(cancel.task_id(), Some(task_id.as_str()));
        peer.send(
            Envelope::new(EnvelopeKind::TaskResult, json!({ "task_id": task_id, "success": true }))
                .with_correlation_id(cancel.correlation_id().unwrap()),
        )
        .await;
        assert!(destroy.await.unwrap());
        assert!(registry.get_agent(&id).is_none());
        assert_eq!(destroyed.lock()[0].get("cancelled_tasks"), Some(&json!([task_id])));

        // the historical task survives its agent
        peer.send(Envelope::task_result(&task_id, false, "", "cancelled")).await;
        let result = call.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(registry.get_task(&task_id).unwrap().agent_id, id);
    }

    #[tokio::test]
    async fn test_cleanup_boundary_and_purge() {
        let registry = AgentRegistry::new(&config(5, false)).with_adapter(succeeding_adapter());
        let id = registry.create_agent("aider", None, None).await.unwrap();
        let result = registry
            .assign_task(&id, "one", "general", TaskOptions::default())
            .await
            .unwrap();

        // a result exactly at the cutoff is kept
        assert_eq!(registry.cleanup_completed_before(result.completed_at), 0);
        assert!(registry.get_task_result(&result.task_id).is_some());

        let later = result.completed_at + chrono::Duration::milliseconds(1);
        assert_eq!(registry.cleanup_completed_before(later), 1);
        assert!(registry.get_task_result(&result.task_id).is_none());
        assert_eq!(registry.task_status(&result.task_id), Some(TaskStatus::Collected));
        assert_eq!(registry.list_idle_agents().len(), 1);
        assert_eq!(registry.get_system_status().total_tasks, 1);

        assert_eq!(registry.purge_tasks_before(later), 1);
        assert!(registry.get_task(&result.task_id).is_none());
        assert_eq!(registry.task_status(&result.task_id), None);

        // recent results survive the retention window
        registry
            .assign_task(&id, "two", "general", TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(registry.cleanup_completed_tasks(Duration::from_secs(24 * 3600)), 0);
        assert_eq!(registry.purge_task_history(Duration::from_secs(24 * 3600)), 0);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_idle_cleanup_tick_logs_nothing() {
        let registry = AgentRegistry::new(&config(5, false)).with_adapter(succeeding_adapter());
        let id = registry.create_agent("aider", None, None).await.unwrap();
        let result = registry
            .assign_task(&id, "one", "general", TaskOptions::default())
            .await
            .unwrap();

        let buffer = LogBuffer::default();
        let subscriber = {
            let buffer = buffer.clone();
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(tracing::Level::INFO)
                .with_writer(move || buffer.clone())
                .finish()
        };

        let later = result.completed_at + chrono::Duration::milliseconds(1);
        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(registry.cleanup_completed_before(result.completed_at), 0);
            assert!(buffer.0.lock().is_empty());

            assert_eq!(registry.cleanup_completed_before(later), 1);
        });

        let logged = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert!(logged.contains("Cleaned up 1 old task results"));
    }

    #[tokio::test]
    async fn test_best_agent_prefers_idle_of_type() {
        let registry = AgentRegistry::new(&config(5, false)).with_adapter(succeeding_adapter());
        registry.create_agent("aider", None, None).await.unwrap();
        let claude = registry.create_agent("claude", None, None).await.unwrap();

        let result = registry
            .assign_task_to_best_agent("review", "review", Some(AgentType::Claude), TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(result.agent_id, claude);
    }

    #[tokio::test]
    async fn test_best_agent_spawns_when_nobody_is_idle() {
        let registry = AgentRegistry::new(&config(5, true)).with_adapter(succeeding_adapter());
        assert!(registry.list_agents().is_empty());

        let result = registry
            .assign_task_to_best_agent("build", "feature", Some(AgentType::OpenCode), TaskOptions::default())
            .await
            .unwrap();
        let agent = registry.get_agent(&result.agent_id).unwrap();
        assert_eq!(agent.agent_type, AgentType::OpenCode);
    }

    #[tokio::test]
    async fn test_best_agent_without_agents_or_spawning() {
        let registry = AgentRegistry::new(&config(5, false)).with_adapter(succeeding_adapter());
        let err = registry
            .assign_task_to_best_agent("x", "general", None, TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::NoAgentAvailable)));
    }

    #[tokio::test]
    async fn test_auto_spawn_fills_idle_pool() {
        let mut cfg = config(3, true);
        cfg.system.min_idle_agents = 2;
        let registry = AgentRegistry::new(&cfg);

        assert_eq!(registry.auto_spawn_check().await.unwrap(), 2);
        assert_eq!(registry.auto_spawn_check().await.unwrap(), 0);

        let kinds: HashSet<AgentType> = registry
            .list_agents()
            .into_iter()
            .map(|agent| agent.agent_type)
            .collect();
        assert_eq!(kinds.len(), 2);

        let disabled = AgentRegistry::new(&config(3, false));
        assert_eq!(disabled.auto_spawn_check().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conversations() {
        let registry = AgentRegistry::new(&config(5, false));
        let started = record(&registry, topics::CONVERSATION_STARTED);
        let a = registry.create_agent("aider", None, None).await.unwrap();
        let b = registry.create_agent("claude", None, None).await.unwrap();

        let conversation = registry.start_conversation(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(registry.get_system_status().active_conversations, 1);
        assert_eq!(registry.conversation(&conversation), Some(vec![a.clone(), b]));
        assert_eq!(started.lock().len(), 1);

        assert!(registry.start_conversation(&[a, "ghost".to_string()]).is_err());
        assert!(registry.start_conversation(&[]).is_err());

        registry.end_conversation(&conversation).unwrap();
        assert!(matches!(
            registry.end_conversation(&conversation),
            Err(Error::Registry(RegistryError::UnknownConversation(_)))
        ));
        assert_eq!(registry.get_system_status().active_conversations, 0);
    }

    #[tokio::test]
    async fn test_metadata_update_and_queries() {
        let registry = AgentRegistry::new(&config(5, false));
        let a = registry.create_agent("aider", None, None).await.unwrap();
        registry.create_agent("claude", None, None).await.unwrap();

        let mut metadata = Metadata::new();
        metadata.insert("branch".to_string(), json!("main"));
        registry.update_agent_metadata(&a, metadata).unwrap();
        assert_eq!(registry.get_agent(&a).unwrap().metadata["branch"], "main");
        assert!(registry.update_agent_metadata("ghost", Metadata::new()).is_err());

        assert_eq!(registry.agents_by_type(AgentType::Aider).len(), 1);
        assert!(registry.agents_by_type(AgentType::OpenCode).is_empty());
        assert_eq!(registry.agent_position(&a), Some(Position::default()));
    }

    #[tokio::test]
    async fn test_cancel_and_remote_status() {
        let mut mock = MockTaskAdapter::new();
        mock.expect_get_status().returning(|task_id| {
            let mut status = StatusMap::new();
            status.insert("task_id".to_string(), json!(task_id));
            Ok(status)
        });
        mock.expect_cancel().never();
        let registry = AgentRegistry::new(&config(5, false)).with_adapter(Arc::new(mock));

        assert!(!registry.cancel_task("unknown").await.unwrap());
        let status = registry.remote_task_status("t-1").await.unwrap();
        assert_eq!(status["task_id"], "t-1");
    }

    #[test]
    fn test_provider_failure_falls_back_to_defaults() {
        let mut broken = AgentSystemConfig::default();
        broken.system.max_agents = 0;
        let registry = AgentRegistry::from_provider(&StaticConfigProvider::new(broken));
        assert_eq!(registry.settings().max_agents, 10);
        assert_eq!(registry.agent_types().len(), 3);
    }
}
