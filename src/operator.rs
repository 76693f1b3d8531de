//! Operator-facing facade over the agent store.

use crate::command::{Command, Response};
use crate::error::{StoreError, StoreResult};
use crate::protocol::Envelope;
use crate::store::{Agent, AgentStore};

/// Selects an agent and queues work for it.
#[derive(Debug, Clone)]
pub struct Operator {
    store: AgentStore,
    selected: Option<Agent>,
}

impl Operator {
    pub fn new(store: AgentStore) -> Self {
        Self {
            store,
            selected: None,
        }
    }

    pub fn store(&self) -> &AgentStore {
        &self.store
    }

    pub fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        self.store.list_agents()
    }

    /// Make `id` the target of later submissions.
    pub fn select_agent(&mut self, id: &str) -> StoreResult<&Agent> {
        let agent = self.store.get_agent(id)?;
        tracing::debug!(agent = %agent.id, "agent selected");
        Ok(self.selected.insert(agent))
    }

    pub fn selected(&self) -> Option<&Agent> {
        self.selected.as_ref()
    }

    fn require_selected(&self) -> StoreResult<&Agent> {
        self.selected.as_ref().ok_or(StoreError::NoAgentSelected)
    }

    /// Queue `command` for the selected agent.
    pub fn submit(&self, command: Command) -> StoreResult<Command> {
        let agent = self.require_selected()?;
        let command = command.for_agent(agent.id.as_str());
        self.store.submit_task(agent, &command)?;
        Ok(command)
    }

    /// Queue a task given in wire form, decoded through the store's registry.
    pub fn submit_envelope(&self, envelope: &Envelope) -> StoreResult<Command> {
        let agent = self.require_selected()?;
        let command = self
            .store
            .registry()
            .dispatch(envelope, None, Some(agent.id.as_str()))?;
        self.store.submit_task(agent, &command)?;
        Ok(command)
    }

    pub fn pending_tasks(&self) -> StoreResult<Vec<Command>> {
        self.store.pending_tasks(self.require_selected()?)
    }

    pub fn responses(&self) -> StoreResult<Vec<Response>> {
        self.store.responses(self.require_selected()?)
    }
}
