//! Connection handshake and cipher negotiation.
//!
//! The agent speaks first: magic, reserved byte, and the cipher method it
//! will use for its own traffic (plus an offset byte for XOR). The controller
//! answers with the same magic, its reserved byte, and its own method. The
//! two directions are independent; the controller's choice never has to
//! match the agent's.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::cipher::{Cipher, CipherMethod, KEYSTREAM};
use super::read_full;
use crate::config::HandshakeConfig;
use crate::error::{ProtocolError, ProtocolResult};

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Deciphers everything the agent sends.
    pub inbound: Cipher,
    /// Ciphers everything the controller sends.
    pub outbound: Cipher,
    /// Method the agent declared for its traffic.
    pub agent_method: CipherMethod,
}

/// Read the agent's half of the handshake.
pub async fn read_agent_hello<R>(reader: &mut R, config: &HandshakeConfig) -> ProtocolResult<Cipher>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    read_full(reader, &mut magic, "handshake magic").await?;
    if u32::from_be_bytes(magic) != config.magic {
        return Err(ProtocolError::ProtocolMismatch {
            message: format!(
                "bad magic {:02x?}, expected {:#010x}",
                magic, config.magic
            ),
        });
    }

    let mut reserved = [0u8; 1];
    read_full(reader, &mut reserved, "handshake reserved byte").await?;
    if reserved[0] != config.inbound_reserved {
        return Err(ProtocolError::ProtocolMismatch {
            message: format!(
                "reserved byte {:#04x}, expected {:#04x}",
                reserved[0], config.inbound_reserved
            ),
        });
    }

    let mut method = [0u8; 1];
    read_full(reader, &mut method, "handshake method").await?;
    match CipherMethod::from_byte(method[0])? {
        CipherMethod::None => Ok(Cipher::none()),
        CipherMethod::XorStream => {
            let mut offset = [0u8; 1];
            read_full(reader, &mut offset, "handshake cipher offset").await?;
            tracing::debug!(offset = offset[0], "agent uses xor-stream cipher");
            Ok(Cipher::xor_stream(offset[0]))
        }
    }
}

/// Build the controller's outbound cipher from configuration.
pub fn choose_outbound(config: &HandshakeConfig) -> Cipher {
    match config.outbound_method {
        CipherMethod::None => Cipher::none(),
        CipherMethod::XorStream => {
            let offset = config
                .outbound_offset
                .unwrap_or_else(|| rand::random::<u8>() % KEYSTREAM.len() as u8);
            Cipher::xor_stream(offset)
        }
    }
}

/// Send the controller's half of the handshake.
pub async fn write_controller_hello<W>(
    writer: &mut W,
    config: &HandshakeConfig,
    outbound: &Cipher,
) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut hello = Vec::with_capacity(7);
    hello.extend_from_slice(&config.magic.to_be_bytes());
    hello.push(config.outbound_reserved);
    hello.push(outbound.method().as_byte());
    if let Some(offset) = outbound.offset() {
        hello.push(offset);
    }
    writer.write_all(&hello).await?;
    writer.flush().await?;
    Ok(())
}

/// Run both halves of the handshake over `stream`.
pub async fn negotiate<S>(stream: &mut S, config: &HandshakeConfig) -> ProtocolResult<Negotiated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let inbound = read_agent_hello(stream, config).await?;
    let agent_method = inbound.method();
    tracing::info!(%agent_method, "agent handshake accepted");

    let outbound = choose_outbound(config);
    write_controller_hello(stream, config, &outbound).await?;
    tracing::debug!(method = %outbound.method(), "controller handshake sent");

    Ok(Negotiated {
        inbound,
        outbound,
        agent_method,
    })
}
