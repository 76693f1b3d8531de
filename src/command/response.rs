//! Responses returned by agents.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Command, OutputEncoding};
use crate::protocol::Envelope;

/// Metadata envelope plus raw payload bytes, optionally linked to the
/// command that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub metadata: Envelope,
    pub data: Vec<u8>,
    pub command_id: Option<Uuid>,
    pub verb: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// On-disk form of a response in the agent's response log.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResponseRecord {
    /// Payload, base64.
    pub data: String,
    pub metadata: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Response {
    pub fn new(metadata: Envelope, data: Vec<u8>) -> Self {
        Self {
            metadata,
            data,
            command_id: None,
            verb: None,
            received_at: Utc::now(),
        }
    }

    /// Link this response to `command`.
    pub fn linked_to(mut self, command: &Command) -> Self {
        self.command_id = Some(command.id());
        self.verb = Some(command.verb().to_string());
        self
    }

    /// Payload as display text: UTF-8 when valid, base64 otherwise.
    pub fn display_text(&self) -> (String, OutputEncoding) {
        match std::str::from_utf8(&self.data) {
            Ok(text) => (text.to_string(), OutputEncoding::Utf8),
            Err(_) => (STANDARD.encode(&self.data), OutputEncoding::Base64),
        }
    }

    pub(crate) fn to_record(&self) -> ResponseRecord {
        ResponseRecord {
            data: STANDARD.encode(&self.data),
            metadata: self.metadata.clone(),
            command_id: self.command_id,
            verb: self.verb.clone(),
            received_at: self.received_at,
        }
    }

    pub(crate) fn from_record(record: ResponseRecord) -> Result<Self, base64::DecodeError> {
        Ok(Self {
            data: STANDARD.decode(record.data.as_bytes())?,
            metadata: record.metadata,
            command_id: record.command_id,
            verb: record.verb,
            received_at: record.received_at,
        })
    }
}
