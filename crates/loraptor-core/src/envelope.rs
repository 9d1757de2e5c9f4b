//! The envelope: the unit of encrypted data a connection puts on the mesh.
//!
//! Plaintext record:
//!
//! ```text
//!   publicWord|epoch|type|content
//! ```
//!
//! `publicWord` is the connection id, `epoch` is unix seconds in decimal,
//! `type` is the `PayloadType` discriminant, and `content` is the remainder
//! of the record. Content is raw bytes: it may contain `|` and need not be
//! UTF-8.
//!
//! On the wire:
//!
//! ```text
//!   base64( AES-128-CBC( PKCS7( len_be32 ++ compress(record) ) ) )
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::compress::{self, CompressError};
use crate::crypto::{self, CryptoError};

const DELIMITER: u8 = b'|';

// ── Payload type ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PayloadType {
    Message = 0,
    Ack = 1,
}

impl PayloadType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Message),
            1 => Ok(Self::Ack),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub public_word: String,
    pub epoch: u32,
    pub kind: PayloadType,
    pub content: Bytes,
}

impl Envelope {
    pub fn message(public_word: impl Into<String>, epoch: u32, content: impl Into<Bytes>) -> Self {
        Self {
            public_word: public_word.into(),
            epoch,
            kind: PayloadType::Message,
            content: content.into(),
        }
    }

    /// ACK envelopes carry the hex hash of the acknowledged message.
    pub fn ack(public_word: impl Into<String>, epoch: u32, hash: impl Into<String>) -> Self {
        Self {
            public_word: public_word.into(),
            epoch,
            kind: PayloadType::Ack,
            content: Bytes::from(hash.into()),
        }
    }

    /// The delimited plaintext record.
    pub fn to_record(&self) -> Vec<u8> {
        let head = format!("{}|{}|{}|", self.public_word, self.epoch, self.kind.as_u8());
        let mut record = Vec::with_capacity(head.len() + self.content.len());
        record.extend_from_slice(head.as_bytes());
        record.extend_from_slice(&self.content);
        record
    }

    /// Parse a delimited plaintext record.
    pub fn from_record(record: &[u8]) -> Result<Self, DecodeError> {
        let mut fields = record.splitn(4, |b| *b == DELIMITER);
        let public_word = fields.next().ok_or(DecodeError::MissingDelimiter)?;
        let epoch = fields.next().ok_or(DecodeError::MissingDelimiter)?;
        let kind = fields.next().ok_or(DecodeError::MissingDelimiter)?;
        let content = fields.next().ok_or(DecodeError::MissingDelimiter)?;

        let epoch = parse_field::<u32>(epoch).ok_or_else(|| DecodeError::InvalidEpoch(lossy(epoch)))?;
        let kind = parse_field::<u8>(kind).ok_or_else(|| DecodeError::InvalidType(lossy(kind)))?;

        Ok(Self {
            public_word: lossy(public_word),
            epoch,
            kind: PayloadType::try_from(kind)?,
            content: Bytes::copy_from_slice(content),
        })
    }

    /// Compress, encrypt and base64-encode under `key`.
    pub fn encode(&self, key: &str) -> Result<String, EncodeError> {
        validate_public_word(&self.public_word)?;
        let record = self.to_record();
        let packed = compress::compress_with_header(&record)?;
        tracing::trace!(
            plain = record.len(),
            packed = packed.len(),
            "envelope compressed"
        );
        Ok(crypto::encrypt(&packed, key)?)
    }

    /// Inverse of `encode`. Any failure, including a wrong key, is a
    /// `DecodeError`.
    pub fn decode(wire: &[u8], key: &str) -> Result<Self, DecodeError> {
        let packed = crypto::decrypt(wire, key)?;
        let plain = compress::decompress_with_header(&packed)?;
        Self::from_record(&plain)
    }
}

fn parse_field<T: std::str::FromStr>(field: &[u8]) -> Option<T> {
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn lossy(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

/// A public word must be non-empty and free of the record delimiter.
pub fn validate_public_word(word: &str) -> Result<(), EncodeError> {
    if word.is_empty() || word.as_bytes().contains(&DELIMITER) {
        return Err(EncodeError::InvalidPublicWord(word.to_string()));
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("invalid public word: {0:?}")]
    InvalidPublicWord(String),

    #[error("compression failed: {0}")]
    Compression(#[from] CompressError),

    #[error("encryption failed: {0}")]
    Encryption(#[from] CryptoError),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("decompression failed: {0}")]
    Decompress(#[from] CompressError),

    #[error("record has fewer than three delimiters")]
    MissingDelimiter,

    #[error("invalid epoch field: {0:?}")]
    InvalidEpoch(String),

    #[error("invalid type field: {0:?}")]
    InvalidType(String),

    #[error("unknown payload type {0}")]
    UnknownType(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
