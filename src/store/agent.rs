//! Agent identity, parsed from the survey an agent sends after the handshake.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::protocol::Envelope;

const ID: &str = "Trojan-ID";
const CONNECTION_TYPE: &str = "connection-Type";
const HOSTNAME: &str = "Trojan-Hostname";
const LOCAL_IP: &str = "Trojan-IP";
const MACHINE: &str = "Trojan-Machine";
const PLATFORM: &str = "Trojan-Platform";
// The stock agent misspells this key; the corrected spelling is accepted too.
const OS_VERSION: [&str; 2] = ["Trojan-OSersion", "Trojan-OSVersion"];

/// Whether a connection is an agent's main channel or a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionRole {
    #[default]
    #[serde(rename = "main")]
    Primary,
    #[serde(rename = "child")]
    Secondary,
}

impl ConnectionRole {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "main" => Some(Self::Primary),
            "child" => Some(Self::Secondary),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => f.write_str("main"),
            Self::Secondary => f.write_str("child"),
        }
    }
}

/// A remote endpoint under control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub role: ConnectionRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Descriptive fields an agent reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Survey {
    /// Identifier the agent declared, if any.
    pub id: Option<String>,
    pub role: ConnectionRole,
    pub hostname: Option<String>,
    pub local_ip: Option<String>,
    pub architecture: Option<String>,
    pub platform: Option<String>,
    pub operating_system: Option<String>,
}

impl Survey {
    /// Read the survey headers. Missing fields stay `None`.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let role = match header_text(envelope, CONNECTION_TYPE) {
            None => ConnectionRole::default(),
            Some(raw) => ConnectionRole::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(connection_type = %raw, "unknown connection type, assuming main");
                ConnectionRole::Primary
            }),
        };
        Self {
            id: header_text(envelope, ID),
            role,
            hostname: header_text(envelope, HOSTNAME),
            local_ip: header_text(envelope, LOCAL_IP),
            architecture: header_text(envelope, MACHINE),
            platform: header_text(envelope, PLATFORM),
            operating_system: OS_VERSION.iter().find_map(|key| header_text(envelope, key)),
        }
    }
}

impl Agent {
    /// First contact: a new agent with the given identifier.
    pub fn new(id: impl Into<String>, survey: &Survey) -> Self {
        let now = Utc::now();
        let mut agent = Self {
            id: id.into(),
            role: ConnectionRole::default(),
            hostname: None,
            local_ip: None,
            architecture: None,
            platform: None,
            operating_system: None,
            first_seen: now,
            last_seen: now,
        };
        agent.refresh(survey);
        agent
    }

    /// Reconnect: take new descriptive fields, keep identity and `first_seen`.
    pub fn refresh(&mut self, survey: &Survey) {
        self.role = survey.role;
        self.hostname = survey.hostname.clone();
        self.local_ip = survey.local_ip.clone();
        self.architecture = survey.architecture.clone();
        self.platform = survey.platform.clone();
        self.operating_system = survey.operating_system.clone();
        self.last_seen = Utc::now();
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unknown = "?";
        write!(
            f,
            "{} ({}) host={} ip={} {}/{} os={} last seen {}",
            self.id,
            self.role,
            self.hostname.as_deref().unwrap_or(unknown),
            self.local_ip.as_deref().unwrap_or(unknown),
            self.platform.as_deref().unwrap_or(unknown),
            self.architecture.as_deref().unwrap_or(unknown),
            self.operating_system.as_deref().unwrap_or(unknown),
            self.last_seen.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

/// Agent identifiers become directory names.
pub fn validate_agent_id(id: &str) -> StoreResult<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.len() > 255
        || id.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if bad {
        return Err(StoreError::InvalidAgentId { id: id.to_string() });
    }
    Ok(())
}

fn header_text(envelope: &Envelope, key: &str) -> Option<String> {
    match envelope.header(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
