//! Acknowledgement sent once an agent has been identified.

use serde_json::{Map, Value};

use super::{CommandAction, DecodeCommand, Response, ResponseContext, ResponseOutcome};
use crate::error::CommandResult;
use crate::protocol::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Handshake;

impl CommandAction for Handshake {
    fn verb(&self) -> &'static str {
        Self::VERB
    }

    fn headers(&self) -> Map<String, Value> {
        Map::new()
    }

    fn handle_response(
        &self,
        _ctx: &ResponseContext<'_>,
        _response: &Response,
    ) -> CommandResult<ResponseOutcome> {
        Ok(ResponseOutcome::Acknowledged)
    }
}

impl DecodeCommand for Handshake {
    const VERB: &'static str = "handshake";

    fn from_envelope(_envelope: &Envelope, _payload: Option<Vec<u8>>) -> CommandResult<Self> {
        Ok(Self)
    }
}
