//! Rich diagnostic error types for the controller.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains. Connection-level kinds
//! (`ProtocolError`, `CommandError::UnknownCommand`, `SessionError`) end the
//! affected session only; the rest of the controller keeps running.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the controller.
#[derive(Debug, Error, Diagnostic)]
pub enum NestError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ProtocolError {
    #[error("protocol mismatch: {message}")]
    #[diagnostic(
        code(nest::protocol::mismatch),
        help(
            "The peer did not open with the expected magic or reserved byte. \
             Either it is not an agent, or it was built against a different \
             handshake configuration. Compare `[handshake]` in config.toml."
        )
    )]
    ProtocolMismatch { message: String },

    #[error("unsupported cipher method: {method}")]
    #[diagnostic(
        code(nest::protocol::cipher_method),
        help("Only method 0 (none) and method 1 (xor-stream) are understood.")
    )]
    UnsupportedCipherMethod { method: u8 },

    #[error("connection closed while reading {stage}")]
    #[diagnostic(
        code(nest::protocol::truncated),
        help("The peer hung up mid-message. The session cannot be resynchronized.")
    )]
    TruncatedFrame { stage: &'static str },

    #[error("frame body is not a JSON envelope: {message}")]
    #[diagnostic(
        code(nest::protocol::framing),
        help(
            "The deciphered frame did not parse as JSON. This usually means the \
             inbound cipher state drifted from the agent's."
        )
    )]
    FramingError { message: String },

    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    #[diagnostic(
        code(nest::protocol::frame_too_large),
        help("Raise `transport.max_frame_size` if the agent legitimately sends frames this large.")
    )]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid chunk size {size}: must be between 1 and 65535")]
    #[diagnostic(
        code(nest::protocol::chunk_size),
        help("Chunk records carry a 16-bit length. Set `transport.max_chunk_size` within range.")
    )]
    InvalidChunkSize { size: usize },

    #[error("socket I/O error: {source}")]
    #[diagnostic(code(nest::protocol::io))]
    Io {
        #[source]
        source: std::io::Error,
    },
}

impl From<std::io::Error> for ProtocolError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CommandError {
    #[error("unknown command verb: \"{verb}\"")]
    #[diagnostic(
        code(nest::command::unknown),
        help("Register a constructor for this verb in the CommandRegistry before dispatching it.")
    )]
    UnknownCommand { verb: String },

    #[error("{verb}: missing header \"{field}\"")]
    #[diagnostic(
        code(nest::command::missing_field),
        help("The envelope does not carry every header this command needs.")
    )]
    MissingField { verb: String, field: &'static str },

    #[error("{verb}: invalid header \"{field}\": {message}")]
    #[diagnostic(code(nest::command::invalid_field))]
    InvalidField {
        verb: String,
        field: &'static str,
        message: String,
    },

    #[error("failed to write collected artifact {path}")]
    #[diagnostic(
        code(nest::command::collection),
        help("Check that the agent's collection directory is writable and the disk is not full.")
    )]
    Collection {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("agent not found: \"{id}\"")]
    #[diagnostic(
        code(nest::store::agent_not_found),
        help("List known agents with `nest agents`. Agents appear after their first connection.")
    )]
    AgentNotFound { id: String },

    #[error("invalid agent identifier: {id:?}")]
    #[diagnostic(
        code(nest::store::invalid_agent_id),
        help(
            "Agent identifiers name directories on disk. They must be non-empty and \
             must not contain path separators, control characters, or be `.`/`..`."
        )
    )]
    InvalidAgentId { id: String },

    #[error("no agent selected")]
    #[diagnostic(
        code(nest::store::no_selection),
        help("Select an agent first (`--agent <ID>`).")
    )]
    NoAgentSelected,

    #[error("I/O error at {path}: {source}")]
    #[diagnostic(
        code(nest::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error at {path}: {message}")]
    #[diagnostic(
        code(nest::store::serde),
        help("A stored record is not valid JSON. Inspect or remove the file by hand.")
    )]
    Serialization { path: String, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Paths(#[from] crate::paths::PathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Command(#[from] CommandError),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn serde(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("agent sent no survey after the handshake")]
    #[diagnostic(
        code(nest::session::no_survey),
        help("The first frame after the handshake must describe the agent.")
    )]
    NoSurvey,

    #[error("agent \"{id}\" already has a live session")]
    #[diagnostic(
        code(nest::session::busy),
        help(
            "Only one connection per agent may drain its queue. The newer \
             connection is closed; the existing one keeps running."
        )
    )]
    AgentBusy { id: String },

    #[error("invalid session transition: {from} -> {to}")]
    #[diagnostic(code(nest::session::transition))]
    InvalidTransition { from: String, to: String },
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
pub type CommandResult<T> = std::result::Result<T, CommandError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Convenience alias for functions returning controller results.
pub type NestResult<T> = std::result::Result<T, NestError>;
