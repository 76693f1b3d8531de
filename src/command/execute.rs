//! Run a command line on the agent (wire verb `command`).

use serde_json::{Map, Value};

use super::{
    CommandAction, DecodeCommand, Response, ResponseContext, ResponseOutcome, require_str,
};
use crate::error::CommandResult;
use crate::protocol::Envelope;

const COMMAND_LINE: &str = "Command-Line";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute {
    pub command_line: String,
}

impl Execute {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
        }
    }
}

impl CommandAction for Execute {
    fn verb(&self) -> &'static str {
        Self::VERB
    }

    fn headers(&self) -> Map<String, Value> {
        let mut headers = Map::new();
        headers.insert(COMMAND_LINE.into(), self.command_line.clone().into());
        headers
    }

    /// Output is shown as text; non-UTF-8 output falls back to base64.
    fn handle_response(
        &self,
        _ctx: &ResponseContext<'_>,
        response: &Response,
    ) -> CommandResult<ResponseOutcome> {
        let (text, encoding) = response.display_text();
        tracing::info!(command_line = %self.command_line, ?encoding, "command output received");
        Ok(ResponseOutcome::Output { text, encoding })
    }
}

impl DecodeCommand for Execute {
    const VERB: &'static str = "command";

    fn from_envelope(envelope: &Envelope, _payload: Option<Vec<u8>>) -> CommandResult<Self> {
        Ok(Self {
            command_line: require_str(envelope, Self::VERB, COMMAND_LINE)?,
        })
    }
}
