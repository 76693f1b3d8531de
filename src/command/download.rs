//! Fetch a file from the agent into the collection store.

use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};
use uuid::Uuid;

use super::{
    CommandAction, DecodeCommand, Response, ResponseContext, ResponseOutcome, optional_bool,
    optional_u64, require_str, write_collected,
};
use crate::error::CommandResult;
use crate::protocol::Envelope;

const FILE_PATH: &str = "File-Path";
const BREAK_POINT: &str = "Break-Point";
const BEGIN_POSITION: &str = "Begin-Position";
const END_POSITION: &str = "End-Position";

/// Collection subdirectory for downloaded files.
pub const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// Path on the agent's host.
    pub path: String,
    /// Whether the agent may resume from `begin`.
    pub break_point: bool,
    pub begin: u64,
    pub end: u64,
}

impl Download {
    /// Download `path` with the agent's stock resume window.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            break_point: true,
            begin: 0,
            end: 1024,
        }
    }

    pub fn with_range(mut self, begin: u64, end: u64) -> Self {
        self.begin = begin;
        self.end = end;
        self
    }

    pub fn with_break_point(mut self, break_point: bool) -> Self {
        self.break_point = break_point;
        self
    }

    /// Where the payload for command `command_id` lands under `collection_dir`.
    ///
    /// The remote path is mirrored below `files/`, keeping only normal
    /// components so a hostile path cannot escape the collection. A path with
    /// no normal components (`/`, `.`, empty) is stored as
    /// `files/download-<command id>`.
    pub fn destination(&self, collection_dir: &Path, command_id: Uuid) -> PathBuf {
        let files = collection_dir.join(FILES_DIR);
        let mut dest = files.clone();
        for component in Path::new(&self.path.replace('\\', "/")).components() {
            if let Component::Normal(part) = component {
                dest.push(part);
            }
        }
        if dest == files {
            dest.push(format!("download-{command_id}"));
        }
        dest
    }
}

impl CommandAction for Download {
    fn verb(&self) -> &'static str {
        Self::VERB
    }

    fn headers(&self) -> Map<String, Value> {
        let mut headers = Map::new();
        headers.insert(FILE_PATH.into(), self.path.clone().into());
        headers.insert(BREAK_POINT.into(), self.break_point.into());
        headers.insert(BEGIN_POSITION.into(), self.begin.into());
        headers.insert(END_POSITION.into(), self.end.into());
        headers
    }

    fn handle_response(
        &self,
        ctx: &ResponseContext<'_>,
        response: &Response,
    ) -> CommandResult<ResponseOutcome> {
        let path = self.destination(ctx.collection_dir, ctx.command_id);
        write_collected(&path, &response.data)?;
        tracing::info!(
            remote = %self.path,
            local = %path.display(),
            bytes = response.data.len(),
            "download stored"
        );
        Ok(ResponseOutcome::Collected { path })
    }
}

impl DecodeCommand for Download {
    const VERB: &'static str = "download";

    fn from_envelope(envelope: &Envelope, _payload: Option<Vec<u8>>) -> CommandResult<Self> {
        Ok(Self {
            path: require_str(envelope, Self::VERB, FILE_PATH)?,
            break_point: optional_bool(envelope, Self::VERB, BREAK_POINT, true)?,
            begin: optional_u64(envelope, Self::VERB, BEGIN_POSITION, 0)?,
            end: optional_u64(envelope, Self::VERB, END_POSITION, 1024)?,
        })
    }
}
