//! Keystream table and per-direction cipher state.
//!
//! The XOR-stream cipher walks a fixed 255-byte keystream with a rolling
//! offset. Enciphering and deciphering are the same operation, so each
//! direction of a connection owns exactly one [`Cipher`] whose offset advances
//! with every byte it touches.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Fixed keystream shared with every agent build.
pub const KEYSTREAM: [u8; 255] = [
    0xf7, 0xe0, 0xc9, 0xb2, 0x9b, 0x84, 0x6d, 0x56, 0x3f, 0x28, 0x11, 0xf9, 0xe2, 0xcb, 0xb4, 0x9d,
    0x86, 0x6f, 0x58, 0x41, 0x2a, 0x13, 0xfb, 0xe4, 0xcd, 0xb6, 0x9f, 0x88, 0x71, 0x5a, 0x43, 0x2c,
    0x15, 0xfd, 0xe6, 0xcf, 0xb8, 0xa1, 0x8a, 0x73, 0x5c, 0x45, 0x2e, 0x17, 0x00, 0xe8, 0xd1, 0xba,
    0xa3, 0x8c, 0x75, 0x5e, 0x47, 0x30, 0x19, 0x02, 0xea, 0xd3, 0xbc, 0xa5, 0x8e, 0x77, 0x60, 0x49,
    0x32, 0x1b, 0x04, 0xec, 0xd5, 0xbe, 0xa7, 0x90, 0x79, 0x62, 0x4b, 0x34, 0x1d, 0x06, 0xee, 0xd7,
    0xc0, 0xa9, 0x92, 0x7b, 0x64, 0x4d, 0x36, 0x1f, 0x08, 0xf0, 0xd9, 0xc2, 0xab, 0x94, 0x7d, 0x66,
    0x4f, 0x38, 0x21, 0x0a, 0xf2, 0xdb, 0xc4, 0xad, 0x96, 0x7f, 0x68, 0x51, 0x3a, 0x23, 0x0c, 0xf4,
    0xdd, 0xc6, 0xaf, 0x98, 0x81, 0x6a, 0x53, 0x3c, 0x25, 0x0e, 0xf6, 0xdf, 0xc8, 0xb1, 0x9a, 0x83,
    0x6c, 0x55, 0x3e, 0x27, 0x10, 0xf8, 0xe1, 0xca, 0xb3, 0x9c, 0x85, 0x6e, 0x57, 0x40, 0x29, 0x12,
    0xfa, 0xe3, 0xcc, 0xb5, 0x9e, 0x87, 0x70, 0x59, 0x42, 0x2b, 0x14, 0xfc, 0xe5, 0xce, 0xb7, 0xa0,
    0x89, 0x72, 0x5b, 0x44, 0x2d, 0x16, 0xfe, 0xe7, 0xd0, 0xb9, 0xa2, 0x8b, 0x74, 0x5d, 0x46, 0x2f,
    0x18, 0x01, 0xe9, 0xd2, 0xbb, 0xa4, 0x8d, 0x76, 0x5f, 0x48, 0x31, 0x1a, 0x03, 0xeb, 0xd4, 0xbd,
    0xa6, 0x8f, 0x78, 0x61, 0x4a, 0x33, 0x1c, 0x05, 0xed, 0xd6, 0xbf, 0xa8, 0x91, 0x7a, 0x63, 0x4c,
    0x35, 0x1e, 0xef, 0xd8, 0xc1, 0xaa, 0x93, 0x7c, 0x65, 0x4e, 0x37, 0x20, 0x09, 0xf1, 0xda, 0xc3,
    0xac, 0x95, 0x7e, 0x67, 0x50, 0x39, 0x22, 0x0b, 0xf3, 0xdc, 0xc5, 0xae, 0x97, 0x80, 0x69, 0x52,
    0x3b, 0x24, 0x0d, 0xf5, 0xde, 0xc7, 0xb0, 0x99, 0x82, 0x6b, 0x54, 0x3d, 0x26, 0x0f, 0xf7,
];

/// Cipher method byte as carried in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherMethod {
    /// Bytes pass through untouched.
    #[default]
    None,
    /// XOR against [`KEYSTREAM`] with a rolling offset.
    #[serde(rename = "xor")]
    XorStream,
}

impl CipherMethod {
    /// Parse the handshake method byte.
    pub fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::XorStream),
            method => Err(ProtocolError::UnsupportedCipherMethod { method }),
        }
    }

    /// The handshake method byte for this method.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::XorStream => 1,
        }
    }
}

impl std::fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::XorStream => write!(f, "xor-stream"),
        }
    }
}

/// Stateful cipher for one direction of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cipher {
    Plain,
    XorStream { offset: usize },
}

impl Cipher {
    /// The no-op cipher.
    pub fn none() -> Self {
        Self::Plain
    }

    /// An XOR-stream cipher seeded at `offset` (taken modulo the keystream length).
    pub fn xor_stream(offset: u8) -> Self {
        Self::XorStream {
            offset: offset as usize % KEYSTREAM.len(),
        }
    }

    pub fn method(&self) -> CipherMethod {
        match self {
            Self::Plain => CipherMethod::None,
            Self::XorStream { .. } => CipherMethod::XorStream,
        }
    }

    /// Current rolling offset, if this cipher has one.
    pub fn offset(&self) -> Option<u8> {
        match self {
            Self::Plain => None,
            // Always < 255 after construction or `apply`.
            Self::XorStream { offset } => Some(*offset as u8),
        }
    }

    /// Encipher or decipher `buf` in place and advance the offset.
    pub fn apply(&mut self, buf: &mut [u8]) {
        if let Self::XorStream { offset } = self {
            let len = KEYSTREAM.len();
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte ^= KEYSTREAM[(*offset + i) % len];
            }
            *offset = (*offset + buf.len() % len) % len;
        }
    }

    /// Copying variant of [`Cipher::apply`].
    pub fn apply_to_vec(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}

impl Default for Cipher {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn keystream_has_255_entries() {
        assert_eq!(KEYSTREAM.len(), 255);
        assert_eq!(KEYSTREAM[0], 0xf7);
        assert_eq!(KEYSTREAM[254], 0xf7);
    }

    #[test]
    fn plain_cipher_is_identity() {
        let mut cipher = Cipher::none();
        assert_eq!(cipher.apply_to_vec(b"hello"), b"hello");
        assert_eq!(cipher.offset(), None);
        assert_eq!(cipher.method(), CipherMethod::None);
    }

    #[test]
    fn xor_offset_advances_and_wraps() {
        let mut cipher = Cipher::xor_stream(250);
        cipher.apply(&mut [0u8; 10]);
        assert_eq!(cipher.offset(), Some(5));

        let mut cipher = Cipher::xor_stream(0);
        cipher.apply(&mut vec![0u8; 255 * 3 + 1]);
        assert_eq!(cipher.offset(), Some(1));
    }

    #[test]
    fn xor_of_zeroes_reveals_keystream() {
        let mut cipher = Cipher::xor_stream(3);
        let out = cipher.apply_to_vec(&[0u8; 4]);
        assert_eq!(out, KEYSTREAM[3..7]);
    }

    #[test]
    fn offset_byte_255_wraps_to_zero() {
        assert_eq!(Cipher::xor_stream(255), Cipher::XorStream { offset: 0 });
    }

    #[test]
    fn method_byte_parsing() {
        assert_eq!(CipherMethod::from_byte(0).unwrap(), CipherMethod::None);
        assert_eq!(CipherMethod::from_byte(1).unwrap(), CipherMethod::XorStream);
        assert!(matches!(
            CipherMethod::from_byte(2),
            Err(ProtocolError::UnsupportedCipherMethod { method: 2 })
        ));
    }

    proptest! {
        #[test]
        fn xor_stream_is_self_inverse(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            offset in 0u8..255,
        ) {
            let mut enc = Cipher::xor_stream(offset);
            let mut dec = Cipher::xor_stream(offset);
            let ciphered = enc.apply_to_vec(&data);
            prop_assert_eq!(dec.apply_to_vec(&ciphered), data);
            prop_assert_eq!(enc, dec);
        }

        #[test]
        fn split_application_matches_whole(
            data in proptest::collection::vec(any::<u8>(), 0..1024),
            split in 0usize..1024,
            offset in 0u8..255,
        ) {
            let split = split.min(data.len());
            let mut whole = Cipher::xor_stream(offset);
            let expected = whole.apply_to_vec(&data);

            let mut parts = Cipher::xor_stream(offset);
            let mut got = parts.apply_to_vec(&data[..split]);
            got.extend(parts.apply_to_vec(&data[split..]));
            prop_assert_eq!(got, expected);
        }
    }
}
