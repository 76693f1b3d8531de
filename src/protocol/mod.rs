//! Wire protocol: handshake, primary frames, and chunked sub-framing.
//!
//! # Wire Format
//!
//! All integers are big-endian. Every byte after the handshake passes
//! through the sending direction's [`Cipher`].
//!
//! ```text
//! handshake   magic (4) | reserved (1) | method (1) [| offset (1) if method = 1]
//! frame       length (4) | JSON envelope (length bytes)      length 0 = no content
//! chunk       length (2) | payload (length bytes)            length 0 = terminator
//! ```
//!
//! A frame whose envelope carries `"Transfer-Encoding": "chunked"` is followed
//! by chunk records holding its payload.

pub mod chunk;
pub mod cipher;
pub mod envelope;
pub mod frame;
pub mod handshake;

pub use chunk::ChunkTransport;
pub use cipher::{Cipher, CipherMethod, KEYSTREAM};
pub use envelope::Envelope;
pub use frame::{Frame, FrameCodec};
pub use handshake::{Negotiated, negotiate};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtocolError, ProtocolResult};

/// Fill `buf` completely, mapping a premature EOF to `TruncatedFrame`.
pub(crate) async fn read_full<R>(
    reader: &mut R,
    buf: &mut [u8],
    stage: &'static str,
) -> ProtocolResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::TruncatedFrame { stage })
        }
        Err(e) => Err(e.into()),
    }
}
