//! Command model: units of work tasked to an agent.
//!
//! Each verb is a type implementing [`CommandAction`] (wire headers plus
//! response handling) and [`DecodeCommand`] (construction from an envelope).
//! A [`Command`] wraps one action with its identity, timestamp, owning agent
//! and the responses received for it. Verbs are looked up through an
//! explicit [`CommandRegistry`].

pub mod download;
pub mod execute;
pub mod file_list;
pub mod handshake;
pub mod proxy;
pub mod registry;
pub mod response;

pub use download::Download;
pub use execute::Execute;
pub use file_list::FileList;
pub use handshake::Handshake;
pub use proxy::Proxy;
pub use registry::{CommandConstructor, CommandRegistry};
pub use response::Response;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CommandError, CommandResult, StoreResult};
use crate::protocol::Envelope;
use crate::store::{Agent, AgentStore};

/// Where a response handler may write and what it is answering.
#[derive(Debug, Clone, Copy)]
pub struct ResponseContext<'a> {
    pub command_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// The owning agent's `collection/` directory.
    pub collection_dir: &'a Path,
}

/// How a command's output was rendered for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEncoding {
    Utf8,
    /// Output was not valid UTF-8 and is shown as base64.
    Base64,
}

/// What a response handler did with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Acknowledged,
    /// Payload written into the collection store.
    Collected { path: PathBuf },
    /// Textual output for display.
    Output { text: String, encoding: OutputEncoding },
    /// Tunnel parameters recorded; the relay itself runs elsewhere.
    TunnelRecorded { path: PathBuf },
    /// The handler could not process the response. It is still in the log.
    Failed { reason: String },
}

/// Behaviour of one command verb.
pub trait CommandAction: Send + Sync + std::fmt::Debug {
    /// Wire verb (`uri`).
    fn verb(&self) -> &'static str;

    /// Verb-specific envelope headers.
    fn headers(&self) -> Map<String, Value>;

    /// Bytes that follow the envelope as chunk records, if this command
    /// carries a streamed payload.
    fn streamed_payload(&self) -> Option<&[u8]> {
        None
    }

    /// Interpret a response to this command.
    fn handle_response(
        &self,
        ctx: &ResponseContext<'_>,
        response: &Response,
    ) -> CommandResult<ResponseOutcome>;
}

/// Construction of a command type from its wire form.
pub trait DecodeCommand: CommandAction + Sized + 'static {
    const VERB: &'static str;

    fn from_envelope(envelope: &Envelope, payload: Option<Vec<u8>>) -> CommandResult<Self>;
}

/// A unit of work addressed to an agent.
#[derive(Debug)]
pub struct Command {
    id: Uuid,
    created_at: DateTime<Utc>,
    agent_id: Option<String>,
    action: Box<dyn CommandAction>,
    responses: Vec<Response>,
}

impl Command {
    /// Wrap `action` with a fresh identifier and timestamp.
    pub fn new(action: impl CommandAction + 'static) -> Self {
        Self::from_boxed(Box::new(action))
    }

    pub fn from_boxed(action: Box<dyn CommandAction>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            agent_id: None,
            action,
            responses: Vec::new(),
        }
    }

    /// Rebuild a persisted command, keeping its identity.
    pub fn restore(id: Uuid, created_at: DateTime<Utc>, action: Box<dyn CommandAction>) -> Self {
        Self {
            id,
            created_at,
            agent_id: None,
            action,
            responses: Vec::new(),
        }
    }

    /// The acknowledgement sent once an agent is identified. Never queued.
    pub fn handshake() -> Self {
        Self::new(Handshake)
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn verb(&self) -> &'static str {
        self.action.verb()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn action(&self) -> &dyn CommandAction {
        self.action.as_ref()
    }

    pub fn streamed_payload(&self) -> Option<&[u8]> {
        self.action.streamed_payload()
    }

    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    /// The envelope sent on the wire.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            uri: self.verb().to_string(),
            headers: self.action.headers(),
            extra: Map::new(),
        }
    }

    /// Link, persist and interpret a response, then keep it on this command.
    ///
    /// The response is logged before the handler runs, so it survives a
    /// handler failure. A failing handler yields [`ResponseOutcome::Failed`];
    /// only a failure to log the response is an error.
    pub fn submit_response(
        &mut self,
        response: Response,
        store: &AgentStore,
        agent: &Agent,
    ) -> StoreResult<ResponseOutcome> {
        let response = response.linked_to(self);
        store.record_response(agent, &response)?;

        let paths = store.agent_paths(&agent.id);
        let ctx = ResponseContext {
            command_id: self.id,
            created_at: self.created_at,
            collection_dir: &paths.collection_dir,
        };
        let outcome = match self.action.handle_response(&ctx, &response) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    agent = %agent.id,
                    command = %self.id,
                    verb = self.verb(),
                    error = %err,
                    "response handler failed"
                );
                ResponseOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        self.responses.push(response);
        Ok(outcome)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.id,
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.envelope()
        )
    }
}

// ---------------------------------------------------------------------------
// Header helpers
// ---------------------------------------------------------------------------

pub(crate) fn require_str(
    envelope: &Envelope,
    verb: &str,
    field: &'static str,
) -> CommandResult<String> {
    match envelope.header(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(invalid(verb, field, format!("expected a string, got {other}"))),
        None => Err(CommandError::MissingField {
            verb: verb.to_string(),
            field,
        }),
    }
}

pub(crate) fn optional_bool(
    envelope: &Envelope,
    verb: &str,
    field: &'static str,
    default: bool,
) -> CommandResult<bool> {
    match envelope.header(field) {
        None => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(invalid(verb, field, format!("expected a boolean, got {other}"))),
    }
}

pub(crate) fn optional_u64(
    envelope: &Envelope,
    verb: &str,
    field: &'static str,
    default: u64,
) -> CommandResult<u64> {
    match envelope.header(field) {
        None => Ok(default),
        Some(value) => value.as_u64().ok_or_else(|| {
            invalid(verb, field, format!("expected an unsigned integer, got {value}"))
        }),
    }
}

pub(crate) fn require_port(
    envelope: &Envelope,
    verb: &str,
    field: &'static str,
) -> CommandResult<u16> {
    let value = envelope.header(field).ok_or(CommandError::MissingField {
        verb: verb.to_string(),
        field,
    })?;
    value
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| invalid(verb, field, format!("expected a port number, got {value}")))
}

fn invalid(verb: &str, field: &'static str, message: String) -> CommandError {
    CommandError::InvalidField {
        verb: verb.to_string(),
        field,
        message,
    }
}

/// Write `data` to `path`, creating parent directories.
pub(crate) fn write_collected(path: &Path, data: &[u8]) -> CommandResult<()> {
    let collection_err = |source| CommandError::Collection {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(collection_err)?;
    }
    std::fs::write(path, data).map_err(collection_err)
}
