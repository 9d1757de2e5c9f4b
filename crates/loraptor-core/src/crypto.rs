//! Envelope encryption for LoRaptor.
//!
//! Every connection shares one symmetric key. Envelopes are sealed with
//! AES-128-CBC under a fixed all-zero IV, then base64-encoded so the radio
//! payload is printable text.
//!
//! This is compatibility crypto, not a secure channel: the zero IV makes
//! equal plaintexts produce equal ciphertexts, and there is no MAC. The
//! envelope layer above rejects garbage by failing to decompress or parse.
//!
//! Derived keys are held in `Zeroizing` buffers and wiped on drop.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cbc::cipher::{
    block_padding::NoPadding,
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use thiserror::Error;
use zeroize::Zeroizing;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES block and key size.
pub const BLOCK_LEN: usize = 16;

const ZERO_IV: [u8; BLOCK_LEN] = [0u8; BLOCK_LEN];

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Derive the AES-128 key from a connection key string: the first 16 bytes,
/// zero-padded when shorter.
pub fn derive_key(key: &str) -> Zeroizing<[u8; BLOCK_LEN]> {
    let mut out = Zeroizing::new([0u8; BLOCK_LEN]);
    let bytes = key.as_bytes();
    let n = bytes.len().min(BLOCK_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

// ── Padding ───────────────────────────────────────────────────────────────────

/// Append PKCS#7 padding. Always adds 1..=16 bytes.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_LEN - data.len() % BLOCK_LEN;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strip PKCS#7 padding leniently.
///
/// Only the last byte is consulted. A value of 16 or less (including 0) is
/// removed as the pad length. Anything larger means there is no padding and
/// the input comes back unchanged. Pad bytes are not verified.
pub fn pkcs7_unpad(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(&pad) if (pad as usize) <= BLOCK_LEN => {
            &data[..data.len().saturating_sub(pad as usize)]
        }
        _ => data,
    }
}

// ── Cipher ────────────────────────────────────────────────────────────────────

/// Pad, encrypt and base64-encode `plaintext` under `key`.
pub fn encrypt(plaintext: &[u8], key: &str) -> Result<String, CryptoError> {
    let key = derive_key(key);
    let cipher = Aes128CbcEnc::new_from_slices(&key[..], &ZERO_IV)
        .map_err(|_| CryptoError::KeyLength)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&pkcs7_pad(plaintext));
    Ok(BASE64.encode(ciphertext))
}

/// Base64-decode, decrypt and unpad a wire payload under `key`.
pub fn decrypt(wire: &[u8], key: &str) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = BASE64.decode(wire)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::BadLength(ciphertext.len()));
    }
    let key = derive_key(key);
    let cipher = Aes128CbcDec::new_from_slices(&key[..], &ZERO_IV)
        .map_err(|_| CryptoError::KeyLength)?;
    let padded = cipher
        .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
        .map_err(|_| CryptoError::BadLength(ciphertext.len()))?;
    Ok(pkcs7_unpad(&padded).to_vec())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("ciphertext length {0} is not a non-zero multiple of 16")]
    BadLength(usize),

    #[error("derived key has the wrong length")]
    KeyLength,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
