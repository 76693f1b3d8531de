//! Primary frame codec: 4-byte length + JSON envelope, both ciphered.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::cipher::Cipher;
use super::envelope::Envelope;
use super::read_full;
use crate::error::{ProtocolError, ProtocolResult};

/// Outcome of reading one primary frame.
///
/// A zero-length frame is a valid "nothing to say" reply, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Envelope),
    NoContent,
}

impl Frame {
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            Self::Message(envelope) => Some(envelope),
            Self::NoContent => None,
        }
    }
}

/// Length-prefixed frame codec.
///
/// The declared length is checked against `max_frame_size` before any body
/// buffer is allocated.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Build the ciphered wire bytes for `payload`.
    pub fn encode(&self, payload: &[u8], cipher: &mut Cipher) -> Vec<u8> {
        let mut wire = Vec::with_capacity(4 + payload.len());
        wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        wire.extend_from_slice(payload);
        cipher.apply(&mut wire);
        wire
    }

    /// Encode and send one envelope.
    pub async fn write_envelope<W>(
        &self,
        writer: &mut W,
        cipher: &mut Cipher,
        envelope: &Envelope,
    ) -> ProtocolResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let wire = self.encode(&envelope.to_bytes(), cipher);
        writer.write_all(&wire).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame's deciphered body, or `None` for a zero-length frame.
    pub async fn read_raw<R>(
        &self,
        reader: &mut R,
        cipher: &mut Cipher,
    ) -> ProtocolResult<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        read_full(reader, &mut len_buf, "frame length").await?;
        cipher.apply(&mut len_buf);
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok(None);
        }
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let mut body = vec![0u8; len];
        read_full(reader, &mut body, "frame body").await?;
        cipher.apply(&mut body);
        Ok(Some(body))
    }

    /// Read and parse one frame.
    pub async fn decode<R>(&self, reader: &mut R, cipher: &mut Cipher) -> ProtocolResult<Frame>
    where
        R: AsyncRead + Unpin,
    {
        match self.read_raw(reader, cipher).await? {
            None => Ok(Frame::NoContent),
            Some(body) => {
                let envelope = Envelope::from_slice(&body).inspect_err(|_| {
                    tracing::debug!(
                        "undecodable frame body: {}",
                        String::from_utf8_lossy(&body)
                    );
                })?;
                Ok(Frame::Message(envelope))
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    #[test]
    fn plain_encoding_layout() {
        let wire = codec().encode(br#"{"uri":"handshake"}"#, &mut Cipher::none());
        assert_eq!(&wire[..4], &[0, 0, 0, 19]);
        assert_eq!(&wire[4..], br#"{"uri":"handshake"}"#);
    }

    #[tokio::test]
    async fn zero_length_frame_is_no_content() {
        let mut wire: &[u8] = &[0, 0, 0, 0];
        let frame = codec().decode(&mut wire, &mut Cipher::none()).await.unwrap();
        assert_eq!(frame, Frame::NoContent);
    }

    #[tokio::test]
    async fn zero_length_frame_under_xor_is_no_content() {
        let mut sender = Cipher::xor_stream(42);
        let wire = codec().encode(b"", &mut sender);
        let mut reader: &[u8] = &wire;
        let mut receiver = Cipher::xor_stream(42);
        let frame = codec().decode(&mut reader, &mut receiver).await.unwrap();
        assert_eq!(frame, Frame::NoContent);
        assert_eq!(receiver, sender);
    }

    #[tokio::test]
    async fn xor_frames_decode_in_sequence() {
        let first = Envelope::new("command").with_header("Command-Line", "id");
        let second = Envelope::new("filelist").with_header("File-Path", "/tmp");

        let mut sender = Cipher::xor_stream(200);
        let mut wire = codec().encode(&first.to_bytes(), &mut sender);
        wire.extend(codec().encode(&second.to_bytes(), &mut sender));

        let mut reader: &[u8] = &wire;
        let mut receiver = Cipher::xor_stream(200);
        let a = codec().decode(&mut reader, &mut receiver).await.unwrap();
        let b = codec().decode(&mut reader, &mut receiver).await.unwrap();
        assert_eq!(a, Frame::Message(first));
        assert_eq!(b, Frame::Message(second));
    }

    #[tokio::test]
    async fn non_json_body_is_framing_error() {
        let wire = codec().encode(b"\xde\xad\xbe\xef", &mut Cipher::none());
        let mut reader: &[u8] = &wire;
        let err = codec().decode(&mut reader, &mut Cipher::none()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError { .. }));
    }

    #[tokio::test]
    async fn short_body_is_truncated() {
        let mut wire = codec().encode(br#"{"uri":"survey"}"#, &mut Cipher::none());
        wire.truncate(wire.len() - 3);
        let mut reader: &[u8] = &wire;
        let err = codec().decode(&mut reader, &mut Cipher::none()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedFrame { stage: "frame body" }));
    }

    #[tokio::test]
    async fn short_length_is_truncated() {
        let mut reader: &[u8] = &[0, 0];
        let err = codec().decode(&mut reader, &mut Cipher::none()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedFrame { stage: "frame length" }));
    }

    #[tokio::test]
    async fn oversized_length_rejected_before_body() {
        let mut reader: &[u8] = &[0x7f, 0xff, 0xff, 0xff];
        let err = FrameCodec::new(1024)
            .decode(&mut reader, &mut Cipher::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 1024, .. }));
    }
}
