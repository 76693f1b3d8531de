//! Chunked sub-framing for payloads that follow an envelope.
//!
//! A payload is a run of records, each a 2-byte length and that many ciphered
//! bytes, closed by a zero-length record.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::cipher::Cipher;
use super::read_full;
use crate::error::{ProtocolError, ProtocolResult};

/// Largest length a chunk record can declare.
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Outgoing chunk size used by the stock agent build.
pub const DEFAULT_CHUNK_SIZE: usize = 255;

const TERMINATOR: [u8; 2] = [0, 0];

#[derive(Debug, Clone, Copy)]
pub struct ChunkTransport {
    max_chunk: usize,
}

impl ChunkTransport {
    /// Create a transport that emits chunks of at most `max_chunk` bytes.
    pub fn new(max_chunk: usize) -> ProtocolResult<Self> {
        if max_chunk == 0 || max_chunk > MAX_CHUNK_LEN {
            return Err(ProtocolError::InvalidChunkSize { size: max_chunk });
        }
        Ok(Self { max_chunk })
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Build the ciphered records for `data`, terminator included.
    ///
    /// Empty input produces a lone terminator.
    pub fn encode(&self, data: &[u8], cipher: &mut Cipher) -> Vec<u8> {
        let records = data.len().div_ceil(self.max_chunk);
        let mut wire = Vec::with_capacity(data.len() + 2 * records + 2);
        for piece in data.chunks(self.max_chunk) {
            wire.extend_from_slice(&(piece.len() as u16).to_be_bytes());
            wire.extend_from_slice(piece);
        }
        wire.extend_from_slice(&TERMINATOR);
        cipher.apply(&mut wire);
        wire
    }

    /// Send `data` as chunk records.
    pub async fn send_chunks<W>(
        &self,
        writer: &mut W,
        cipher: &mut Cipher,
        data: &[u8],
    ) -> ProtocolResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        tracing::debug!(
            bytes = data.len(),
            chunk = self.max_chunk,
            "sending chunked payload"
        );
        let wire = self.encode(data, cipher);
        writer.write_all(&wire).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read chunk records until the terminator and return the joined payload.
    ///
    /// Fails with `FrameTooLarge` once the joined payload would pass
    /// `max_payload` bytes.
    pub async fn receive_chunks<R>(
        reader: &mut R,
        cipher: &mut Cipher,
        max_payload: usize,
    ) -> ProtocolResult<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut payload = Vec::new();
        loop {
            let mut len_buf = [0u8; 2];
            read_full(reader, &mut len_buf, "chunk length").await?;
            cipher.apply(&mut len_buf);
            let len = u16::from_be_bytes(len_buf) as usize;
            if len == 0 {
                tracing::debug!(bytes = payload.len(), "chunked transfer complete");
                return Ok(payload);
            }

            let start = payload.len();
            if start + len > max_payload {
                return Err(ProtocolError::FrameTooLarge {
                    size: start + len,
                    max: max_payload,
                });
            }
            payload.resize(start + len, 0);
            read_full(reader, &mut payload[start..], "chunk body").await?;
            cipher.apply(&mut payload[start..]);
        }
    }
}

impl Default for ChunkTransport {
    fn default() -> Self {
        Self {
            max_chunk: DEFAULT_CHUNK_SIZE,
        }
    }
}
