//! Per-connection session state and the live-session registry.
//!
//! ```text
//! Init -> CipherNegotiated -> SurveyReceived -> Identified -> Ready
//!      Ready -> Tasking <-> AwaitingResponse
//!      Ready | AwaitingResponse -> Drained
//!      any non-terminal -> Aborted
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};

/// Lifecycle of one agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    CipherNegotiated,
    SurveyReceived,
    Identified,
    Ready,
    Tasking,
    AwaitingResponse,
    Drained,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Drained | Self::Aborted)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal(),
            (Init, CipherNegotiated)
            | (CipherNegotiated, SurveyReceived)
            | (SurveyReceived, Identified)
            | (Identified, Ready)
            | (Ready, Tasking)
            | (Ready, Drained)
            | (Tasking, AwaitingResponse)
            | (AwaitingResponse, Tasking)
            | (AwaitingResponse, Drained) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::CipherNegotiated => "CIPHER_NEGOTIATED",
            Self::SurveyReceived => "SURVEY_RECEIVED",
            Self::Identified => "IDENTIFIED",
            Self::Ready => "READY",
            Self::Tasking => "TASKING",
            Self::AwaitingResponse => "AWAITING_RESPONSE",
            Self::Drained => "DRAINED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// State of one connection: where it is in the lifecycle and which tasks it
/// has already delivered.
#[derive(Debug)]
pub struct AgentSession {
    state: SessionState,
    agent_id: Option<String>,
    delivered: HashSet<Uuid>,
    completed: usize,
}

impl AgentSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Init,
            agent_id: None,
            delivered: HashSet::new(),
            completed: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Move to `next`, refusing transitions outside the lifecycle.
    pub fn advance(&mut self, next: SessionState) -> SessionResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::trace!(from = %self.state, to = %next, "session transition");
        self.state = next;
        Ok(())
    }

    /// Record the identified agent and enter `Identified`.
    pub fn identify(&mut self, agent_id: impl Into<String>) -> SessionResult<()> {
        self.advance(SessionState::Identified)?;
        self.agent_id = Some(agent_id.into());
        Ok(())
    }

    /// Enter `Aborted` unless already terminal.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Aborted;
        }
    }

    /// Note that `id` went out on this connection. `false` if it already had.
    pub fn mark_delivered(&mut self, id: Uuid) -> bool {
        self.delivered.insert(id)
    }

    pub fn was_delivered(&self, id: Uuid) -> bool {
        self.delivered.contains(&id)
    }

    pub fn mark_completed(&mut self) {
        self.completed += 1;
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed
    }
}

impl Default for AgentSession {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Live-session registry
// ---------------------------------------------------------------------------

/// Who holds an agent's session.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub peer: String,
    pub since: DateTime<Utc>,
}

/// Agents that currently have a draining connection.
///
/// At most one session per agent identifier; a claim is released when its
/// [`SessionClaim`] is dropped.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    live: Arc<DashMap<String, LiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `agent_id` for the connection from `peer`.
    pub fn claim(&self, agent_id: &str, peer: &str) -> SessionResult<SessionClaim> {
        match self.live.entry(agent_id.to_string()) {
            Entry::Occupied(existing) => {
                tracing::warn!(
                    agent = %agent_id,
                    holder = %existing.get().peer,
                    peer,
                    "agent already has a live session"
                );
                Err(SessionError::AgentBusy {
                    id: agent_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(LiveSession {
                    peer: peer.to_string(),
                    since: Utc::now(),
                });
                Ok(SessionClaim {
                    live: Arc::clone(&self.live),
                    agent_id: agent_id.to_string(),
                })
            }
        }
    }

    /// Live agents and their peers, sorted by agent identifier.
    pub fn live(&self) -> Vec<(String, LiveSession)> {
        let mut live: Vec<_> = self
            .live
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Exclusive hold on an agent's session; releases on drop.
#[derive(Debug)]
pub struct SessionClaim {
    live: Arc<DashMap<String, LiveSession>>,
    agent_id: String,
}

impl SessionClaim {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.live.remove(&self.agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn happy_path_walks_the_lifecycle() {
        let mut session = AgentSession::new();
        for next in [CipherNegotiated, SurveyReceived] {
            session.advance(next).unwrap();
        }
        session.identify("abc123").unwrap();
        for next in [Ready, Tasking, AwaitingResponse, Tasking, AwaitingResponse, Drained] {
            session.advance(next).unwrap();
        }
        assert_eq!(session.state(), Drained);
        assert_eq!(session.agent_id(), Some("abc123"));
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut session = AgentSession::new();
        let err = session.advance(Ready).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition { ref from, ref to } if from == "INIT" && to == "READY"
        ));
        assert_eq!(session.state(), Init);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut session = AgentSession::new();
        session.abort();
        assert_eq!(session.state(), Aborted);
        assert!(session.advance(CipherNegotiated).is_err());
        assert!(session.advance(Aborted).is_err());
        assert!(!Drained.can_transition_to(Aborted));
    }

    #[test]
    fn every_live_state_can_abort() {
        for state in [
            Init,
            CipherNegotiated,
            SurveyReceived,
            Identified,
            Ready,
            Tasking,
            AwaitingResponse,
        ] {
            assert!(state.can_transition_to(Aborted), "{state} cannot abort");
        }
    }

    #[test]
    fn delivery_is_tracked_once() {
        let mut session = AgentSession::new();
        let id = Uuid::new_v4();
        assert!(session.mark_delivered(id));
        assert!(!session.mark_delivered(id));
        assert!(session.was_delivered(id));
        assert_eq!(session.delivered_count(), 1);
    }

    #[test]
    fn second_claim_is_busy_until_release() {
        let registry = SessionRegistry::new();
        let claim = registry.claim("abc123", "10.0.0.1:5000").unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.claim("abc123", "10.0.0.2:6000"),
            Err(SessionError::AgentBusy { .. })
        ));
        registry.claim("other", "10.0.0.3:7000").map(drop).unwrap();

        drop(claim);
        assert!(registry.is_empty());
        let again = registry.claim("abc123", "10.0.0.2:6000").unwrap();
        assert_eq!(again.agent_id(), "abc123");
        assert_eq!(registry.live()[0].1.peer, "10.0.0.2:6000");
    }
}
