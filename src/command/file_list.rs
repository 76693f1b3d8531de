//! Directory listing of a path on the agent.

use std::path::PathBuf;

use serde_json::{Map, Value};

use super::{
    CommandAction, DecodeCommand, Response, ResponseContext, ResponseOutcome, require_str,
    write_collected,
};
use crate::error::CommandResult;
use crate::protocol::Envelope;

const FILE_PATH: &str = "File-Path";

/// Collection subdirectory for listings.
pub const LISTINGS_DIR: &str = "directory_listings";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileList {
    pub path: String,
}

impl FileList {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl CommandAction for FileList {
    fn verb(&self) -> &'static str {
        Self::VERB
    }

    fn headers(&self) -> Map<String, Value> {
        let mut headers = Map::new();
        headers.insert(FILE_PATH.into(), self.path.clone().into());
        headers
    }

    /// Stores the listing as `<created>-DirectoryListing-<id>.txt`.
    fn handle_response(
        &self,
        ctx: &ResponseContext<'_>,
        response: &Response,
    ) -> CommandResult<ResponseOutcome> {
        let name = format!(
            "{}-DirectoryListing-{}.txt",
            ctx.created_at.format("%Y%m%d_%H%M%S"),
            ctx.command_id
        );
        let path: PathBuf = ctx.collection_dir.join(LISTINGS_DIR).join(name);
        write_collected(&path, &response.data)?;
        tracing::info!(
            directory = %self.path,
            "listing stored:\n{}",
            String::from_utf8_lossy(&response.data)
        );
        Ok(ResponseOutcome::Collected { path })
    }
}

impl DecodeCommand for FileList {
    const VERB: &'static str = "filelist";

    fn from_envelope(envelope: &Envelope, _payload: Option<Vec<u8>>) -> CommandResult<Self> {
        Ok(Self {
            path: require_str(envelope, Self::VERB, FILE_PATH)?,
        })
    }
}
