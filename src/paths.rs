//! XDG-compliant path resolution for wasp-nest.
//!
//! Provides `NestPaths` (global directories) and `AgentPaths` (per-agent
//! directories) following the XDG Base Directory Specification.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

const APP_DIR: &str = "wasp-nest";

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(nest::paths::no_home),
        help("Set the HOME environment variable, or pass `--data-dir` explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(nest::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

/// Global XDG-compliant directories for wasp-nest.
#[derive(Debug, Clone)]
pub struct NestPaths {
    /// `$XDG_CONFIG_HOME/wasp-nest/`
    pub config_dir: PathBuf,
    /// `$XDG_DATA_HOME/wasp-nest/`
    pub data_dir: PathBuf,
    /// `$XDG_STATE_HOME/wasp-nest/`
    pub state_dir: PathBuf,
}

impl NestPaths {
    /// Resolve XDG directories from environment variables with standard fallbacks.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join(APP_DIR);

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/share"))
            .join(APP_DIR);

        let state_dir = std::env::var("XDG_STATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/state"))
            .join(APP_DIR);

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
        })
    }

    /// Keep everything under one root: `root/{config,data,state}`.
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            state_dir: root.join("state"),
        }
    }

    /// Replace the data directory, leaving config and state alone.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// `data_dir/agents/`
    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }

    /// Per-agent paths. `id` must already be validated.
    pub fn agent(&self, id: &str) -> AgentPaths {
        let root = self.agents_dir().join(id);
        AgentPaths {
            id: id.to_string(),
            record_file: root.join("agent.json"),
            tasking_dir: root.join("tasking"),
            completed_dir: root.join("completed_tasking"),
            failed_dir: root.join("failed_tasking"),
            response_dir: root.join("response"),
            collection_dir: root.join("collection"),
            root,
        }
    }

    /// Names of every agent directory, sorted.
    pub fn list_agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match std::fs::read_dir(self.agents_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }

    /// Create all base directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.state_dir, &self.agents_dir()] {
            create_dir(dir)?;
        }
        Ok(())
    }

    /// Path to the controller config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}

/// Per-agent directory layout.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub id: String,
    /// `data_dir/agents/{id}/`
    pub root: PathBuf,
    /// `root/agent.json` — identity record
    pub record_file: PathBuf,
    /// `root/tasking/` — pending tasks
    pub tasking_dir: PathBuf,
    /// `root/completed_tasking/` — delivered and answered tasks
    pub completed_dir: PathBuf,
    /// `root/failed_tasking/` — answered tasks whose response could not be handled
    pub failed_dir: PathBuf,
    /// `root/response/` — response log
    pub response_dir: PathBuf,
    /// `root/collection/` — downloaded files, listings, tunnel records
    pub collection_dir: PathBuf,
}

impl AgentPaths {
    /// Create all agent directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [
            &self.root,
            &self.tasking_dir,
            &self.completed_dir,
            &self.failed_dir,
            &self.response_dir,
            &self.collection_dir,
        ] {
            create_dir(dir)?;
        }
        Ok(())
    }

    /// Whether the agent has been provisioned (identity record exists).
    pub fn exists(&self) -> bool {
        self.record_file.is_file()
    }
}

fn create_dir(dir: &Path) -> PathResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
        path: dir.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_paths_use_app_dir() {
        // No env mutation here; that is unsafe in edition 2024.
        let paths = NestPaths::resolve().unwrap();
        assert!(paths.config_dir.ends_with(APP_DIR));
        assert!(paths.data_dir.ends_with(APP_DIR));
        assert!(paths.agents_dir().starts_with(&paths.data_dir));
    }

    #[test]
    fn agent_paths_derive_from_id() {
        let paths = NestPaths::rooted("/srv/nest");
        let agent = paths.agent("abc123");
        assert_eq!(agent.root, PathBuf::from("/srv/nest/data/agents/abc123"));
        assert_eq!(
            agent.record_file,
            PathBuf::from("/srv/nest/data/agents/abc123/agent.json")
        );
        assert_eq!(
            agent.completed_dir,
            PathBuf::from("/srv/nest/data/agents/abc123/completed_tasking")
        );
        assert_eq!(
            agent.failed_dir,
            PathBuf::from("/srv/nest/data/agents/abc123/failed_tasking")
        );
        assert_eq!(paths.config_file(), PathBuf::from("/srv/nest/config/config.toml"));
    }

    #[test]
    fn data_dir_override_keeps_config() {
        let paths = NestPaths::rooted("/a").with_data_dir("/b");
        assert_eq!(paths.agents_dir(), PathBuf::from("/b/agents"));
        assert_eq!(paths.config_dir, PathBuf::from("/a/config"));
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = NestPaths::rooted(dir.path());
        let agent = paths.agent("a1");
        agent.ensure_dirs().unwrap();
        agent.ensure_dirs().unwrap();
        assert!(agent.tasking_dir.is_dir());
        assert!(!agent.exists());
        assert_eq!(paths.list_agent_ids(), vec!["a1".to_string()]);
    }

    #[test]
    fn list_agents_missing_dir() {
        assert!(NestPaths::rooted("/nonexistent").list_agent_ids().is_empty());
    }
}
