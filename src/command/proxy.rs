//! Reverse tunnel request. Only the parameters are recorded here; the data
//! relay runs outside the controller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    CommandAction, DecodeCommand, Response, ResponseContext, ResponseOutcome, require_port,
    require_str, write_collected,
};
use crate::error::{CommandError, CommandResult};
use crate::protocol::Envelope;

const REVERSE_PORT: &str = "Reverse-Port";
const DEST_HOST: &str = "Dest-Host";
const DEST_PORT: &str = "Dest-Port";

/// Collection subdirectory for tunnel records.
pub const TUNNELS_DIR: &str = "tunnels";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    /// Port on the controller host the agent connects back to.
    pub reverse_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
}

impl Proxy {
    pub fn new(
        reverse_port: u16,
        destination_host: impl Into<String>,
        destination_port: u16,
    ) -> Self {
        Self {
            reverse_port,
            destination_host: destination_host.into(),
            destination_port,
        }
    }
}

impl CommandAction for Proxy {
    fn verb(&self) -> &'static str {
        Self::VERB
    }

    fn headers(&self) -> Map<String, Value> {
        let mut headers = Map::new();
        headers.insert(REVERSE_PORT.into(), self.reverse_port.into());
        headers.insert(DEST_HOST.into(), self.destination_host.clone().into());
        headers.insert(DEST_PORT.into(), self.destination_port.into());
        headers
    }

    fn handle_response(
        &self,
        ctx: &ResponseContext<'_>,
        _response: &Response,
    ) -> CommandResult<ResponseOutcome> {
        let path: PathBuf = ctx
            .collection_dir
            .join(TUNNELS_DIR)
            .join(format!("{}.json", ctx.command_id));
        let record = serde_json::to_vec_pretty(self).map_err(|e| CommandError::Collection {
            path: path.display().to_string(),
            source: e.into(),
        })?;
        write_collected(&path, &record)?;
        tracing::info!(
            reverse_port = self.reverse_port,
            destination = %format!("{}:{}", self.destination_host, self.destination_port),
            "tunnel parameters recorded"
        );
        Ok(ResponseOutcome::TunnelRecorded { path })
    }
}

impl DecodeCommand for Proxy {
    const VERB: &'static str = "proxy";

    fn from_envelope(envelope: &Envelope, _payload: Option<Vec<u8>>) -> CommandResult<Self> {
        Ok(Self {
            reverse_port: require_port(envelope, Self::VERB, REVERSE_PORT)?,
            destination_host: require_str(envelope, Self::VERB, DEST_HOST)?,
            destination_port: require_port(envelope, Self::VERB, DEST_PORT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn round_trips_through_headers() {
        let proxy = Proxy::new(9001, "10.0.0.5", 3389);
        let env = crate::command::Command::new(proxy.clone()).envelope();
        assert_eq!(env.header("Reverse-Port"), Some(&Value::from(9001u16)));
        assert_eq!(Proxy::from_envelope(&env, None).unwrap(), proxy);
    }

    #[test]
    fn records_tunnel_without_touching_payload() {
        let dir = tempfile::TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let ctx = ResponseContext {
            command_id: id,
            created_at: Utc::now(),
            collection_dir: dir.path(),
        };
        let proxy = Proxy::new(9001, "intranet", 80);
        let outcome = proxy
            .handle_response(&ctx, &Response::new(Envelope::new("proxy"), b"ignored".to_vec()))
            .unwrap();

        let expected = dir.path().join(TUNNELS_DIR).join(format!("{id}.json"));
        assert_eq!(outcome, ResponseOutcome::TunnelRecorded { path: expected.clone() });
        let stored: Proxy = serde_json::from_slice(&std::fs::read(expected).unwrap()).unwrap();
        assert_eq!(stored, proxy);
    }
}
