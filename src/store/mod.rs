//! Durable per-agent storage on the filesystem.
//!
//! Each agent owns a directory (see [`AgentPaths`]) holding its identity
//! record, the pending task queue, completed tasks, the response log and the
//! collection store. The queue is shared between an external producer (the
//! operator) and the single session draining it, with no lock: every task is
//! its own file, written under a temporary name and renamed into place, and
//! the pending set is re-read on every call.
//!
//! - [`AgentStore::resolve_or_create_agent`]: identity resolution on survey
//! - [`AgentStore::submit_task`] / [`AgentStore::pending_tasks`] /
//!   [`AgentStore::complete_task`] / [`AgentStore::fail_task`]: the task queue
//! - [`AgentStore::record_response`] / [`AgentStore::responses`]: the
//!   append-only response log

pub mod agent;

pub use agent::{Agent, ConnectionRole, Survey, validate_agent_id};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::response::ResponseRecord;
use crate::command::{Command, CommandRegistry, Response};
use crate::error::{CommandError, StoreError, StoreResult};
use crate::paths::{AgentPaths, NestPaths};
use crate::protocol::Envelope;

const TASK_PREFIX: &str = "task-";
const RESPONSE_PREFIX: &str = "response-";
const UNLINKED_VERB: &str = "unknown";

/// Last submission key handed out by this process.
static LAST_TASK_KEY: AtomicU64 = AtomicU64::new(0);

/// Persisted form of a pending command.
#[derive(Debug, Serialize, Deserialize)]
struct TaskRecord {
    id: Uuid,
    created_at: DateTime<Utc>,
    envelope: Envelope,
    /// Streamed payload, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// A pending task file and its parsed name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TaskEntry {
    key: u64,
    id: Uuid,
    path: PathBuf,
}

/// Filesystem-backed store of agents, tasks and responses.
#[derive(Debug, Clone)]
pub struct AgentStore {
    paths: NestPaths,
    registry: Arc<CommandRegistry>,
}

impl AgentStore {
    /// Open the store rooted at `paths`, creating base directories.
    pub fn open(paths: NestPaths, registry: Arc<CommandRegistry>) -> StoreResult<Self> {
        paths.ensure_dirs()?;
        Ok(Self { paths, registry })
    }

    pub fn paths(&self) -> &NestPaths {
        &self.paths
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn agent_paths(&self, id: &str) -> AgentPaths {
        self.paths.agent(id)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    /// Resolve the agent a survey describes, provisioning it on first contact.
    ///
    /// A declared identifier that matches an existing agent reuses it; an
    /// agent that declares none gets a generated identifier.
    pub fn resolve_or_create_agent(&self, survey: &Envelope) -> StoreResult<Agent> {
        let survey = Survey::from_envelope(survey);
        let id = match &survey.id {
            Some(id) => id.clone(),
            None => {
                let generated = Uuid::new_v4().to_string();
                tracing::warn!(id = %generated, "survey carries no agent id, generated one");
                generated
            }
        };
        validate_agent_id(&id)?;

        let paths = self.paths.agent(&id);
        let agent = if paths.exists() {
            let mut agent = read_json::<Agent>(&paths.record_file)?;
            agent.refresh(&survey);
            tracing::info!(agent = %id, "known agent reconnected");
            agent
        } else {
            tracing::info!(agent = %id, hostname = ?survey.hostname, "new agent");
            Agent::new(id, &survey)
        };

        paths.ensure_dirs()?;
        write_json_atomic(&paths.record_file, &agent)?;
        Ok(agent)
    }

    /// Every provisioned agent, ordered by identifier.
    pub fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let mut agents = Vec::new();
        for id in self.paths.list_agent_ids() {
            let paths = self.paths.agent(&id);
            if paths.exists() {
                agents.push(read_json(&paths.record_file)?);
            }
        }
        Ok(agents)
    }

    pub fn get_agent(&self, id: &str) -> StoreResult<Agent> {
        validate_agent_id(id)?;
        let paths = self.paths.agent(id);
        if !paths.exists() {
            return Err(StoreError::AgentNotFound { id: id.to_string() });
        }
        read_json(&paths.record_file)
    }

    // -----------------------------------------------------------------------
    // Task queue
    // -----------------------------------------------------------------------

    /// Queue `command` for `agent`, after everything already pending.
    pub fn submit_task(&self, agent: &Agent, command: &Command) -> StoreResult<PathBuf> {
        let verb = command.verb();
        if !self.registry.contains(verb) {
            return Err(CommandError::UnknownCommand {
                verb: verb.to_string(),
            }
            .into());
        }

        let paths = self.paths.agent(&agent.id);
        paths.ensure_dirs()?;

        let floor = self
            .task_entries(&paths)?
            .last()
            .map_or(0, |newest| newest.key.saturating_add(1));
        let key = next_task_key(floor);

        let record = TaskRecord {
            id: command.id(),
            created_at: command.created_at(),
            envelope: command.envelope(),
            payload: command.streamed_payload().map(|p| STANDARD.encode(p)),
        };
        let path = paths
            .tasking_dir
            .join(format!("{TASK_PREFIX}{key:020}-{}.json", command.id()));
        write_json_atomic(&path, &record)?;
        tracing::info!(agent = %agent.id, command = %command.id(), verb, "task submitted");
        Ok(path)
    }

    /// Pending commands in submission order. Re-read from disk every call.
    pub fn pending_tasks(&self, agent: &Agent) -> StoreResult<Vec<Command>> {
        let paths = self.paths.agent(&agent.id);
        self.task_entries(&paths)?
            .into_iter()
            .map(|entry| self.load_task(&entry.path, &agent.id))
            .collect()
    }

    /// Move the pending entry for `command` into `completed_tasking/`.
    ///
    /// Returns `false` if no pending entry carries that identifier.
    pub fn complete_task(&self, agent: &Agent, command: &Command) -> StoreResult<bool> {
        let paths = self.paths.agent(&agent.id);
        let moved = self.retire_task(&paths, &paths.completed_dir, command)?;
        if moved {
            tracing::debug!(agent = %agent.id, command = %command.id(), "task completed");
        }
        Ok(moved)
    }

    /// Move the pending entry for `command` into `failed_tasking/`.
    ///
    /// For tasks that were answered but whose response could not be handled.
    /// They leave the queue so later tasks are still delivered.
    pub fn fail_task(&self, agent: &Agent, command: &Command) -> StoreResult<bool> {
        let paths = self.paths.agent(&agent.id);
        let moved = self.retire_task(&paths, &paths.failed_dir, command)?;
        if moved {
            tracing::warn!(agent = %agent.id, command = %command.id(), "task moved to failed");
        }
        Ok(moved)
    }

    fn retire_task(
        &self,
        paths: &AgentPaths,
        dest_dir: &Path,
        command: &Command,
    ) -> StoreResult<bool> {
        let Some(entry) = self
            .task_entries(paths)?
            .into_iter()
            .find(|entry| entry.id == command.id())
        else {
            tracing::warn!(
                agent = %paths.id,
                command = %command.id(),
                "no pending entry to retire"
            );
            return Ok(false);
        };

        std::fs::create_dir_all(dest_dir).map_err(|e| StoreError::io(dest_dir, e))?;
        let Some(name) = entry.path.file_name() else {
            return Ok(false);
        };
        let dest = dest_dir.join(name);
        std::fs::rename(&entry.path, &dest).map_err(|e| StoreError::io(&entry.path, e))?;
        Ok(true)
    }

    fn task_entries(&self, paths: &AgentPaths) -> StoreResult<Vec<TaskEntry>> {
        let dir = &paths.tasking_dir;
        let read = match std::fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut entries = Vec::new();
        for dirent in read {
            let dirent = dirent.map_err(|e| StoreError::io(dir, e))?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((key, id)) = parse_task_name(name) {
                entries.push(TaskEntry {
                    key,
                    id,
                    path: dirent.path(),
                });
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn load_task(&self, path: &Path, agent_id: &str) -> StoreResult<Command> {
        let record: TaskRecord = read_json(path)?;
        let payload = record
            .payload
            .map(|p| STANDARD.decode(p.as_bytes()))
            .transpose()
            .map_err(|e| StoreError::serde(path, e))?;
        let action = self.registry.decode(&record.envelope, payload)?;
        Ok(Command::restore(record.id, record.created_at, action).for_agent(agent_id))
    }

    // -----------------------------------------------------------------------
    // Response log
    // -----------------------------------------------------------------------

    /// Append `response` to the agent's log, linked or not.
    pub fn record_response(&self, agent: &Agent, response: &Response) -> StoreResult<PathBuf> {
        let (verb, id) = match (&response.verb, response.command_id) {
            (Some(verb), Some(id)) => (verb.as_str(), id),
            _ => {
                tracing::warn!(
                    agent = %agent.id,
                    uri = %response.metadata.uri,
                    "response not linked to a command"
                );
                (UNLINKED_VERB, Uuid::new_v4())
            }
        };

        let paths = self.paths.agent(&agent.id);
        let name = format!(
            "{RESPONSE_PREFIX}{}-{verb}-{id}.json",
            response.received_at.format("%Y%m%d-%H%M%S%.6f")
        );
        let path = paths.response_dir.join(name);
        write_json_atomic(&path, &response.to_record())?;
        tracing::debug!(
            agent = %agent.id,
            path = %path.display(),
            bytes = response.data.len(),
            "response recorded"
        );
        Ok(path)
    }

    /// The agent's response log, oldest first.
    pub fn responses(&self, agent: &Agent) -> StoreResult<Vec<Response>> {
        let dir = self.paths.agent(&agent.id).response_dir;
        let read = match std::fs::read_dir(&dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut files: Vec<PathBuf> = read
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(RESPONSE_PREFIX) && n.ends_with(".json"))
            })
            .map(|e| e.path())
            .collect();
        files.sort();

        files
            .iter()
            .map(|path| {
                let record: ResponseRecord = read_json(path)?;
                Response::from_record(record).map_err(|e| StoreError::serde(path, e))
            })
            .collect()
    }
}

/// `task-<20-digit key>-<uuid>.json`; anything else is not a task.
fn parse_task_name(name: &str) -> Option<(u64, Uuid)> {
    let rest = name.strip_prefix(TASK_PREFIX)?.strip_suffix(".json")?;
    let (key, id) = rest.split_once('-')?;
    if key.len() != 20 {
        return None;
    }
    Some((key.parse().ok()?, Uuid::parse_str(id).ok()?))
}

/// Strictly increasing within this process, never below `floor`.
fn next_task_key(floor: u64) -> u64 {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0);
    let mut prev = LAST_TASK_KEY.load(Ordering::Acquire);
    loop {
        let key = now.max(prev.saturating_add(1)).max(floor);
        match LAST_TASK_KEY.compare_exchange_weak(prev, key, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return key,
            Err(actual) => prev = actual,
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let bytes = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::serde(path, e))
}

/// Write pretty JSON to a dot-prefixed sibling, then rename over `path`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::serde(path, e))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = dir.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&tmp, &bytes).map_err(|e| StoreError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}
