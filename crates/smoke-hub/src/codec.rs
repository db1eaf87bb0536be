//! AES-256-CFB token codec.
//!
//! Token layout: `base64url(iv[16] || ciphertext)`. There is no
//! authentication tag, so ciphertext is malleable and callers must check
//! the recovered plaintext themselves.

use std::sync::Arc;

use aes::Aes256;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use crate::keys::{KeyError, KeyProvider, SecretKey};

/// AES block size, also the IV length.
pub const IV_LEN: usize = 16;

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("secret key unavailable: {0}")]
    Key(#[from] KeyError),

    #[error("token is empty")]
    Empty,

    #[error("token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("token too short: {0} bytes")]
    Truncated(usize),

    #[error("failed to gather entropy: {0}")]
    Entropy(String),

    #[error("cipher initialization failed")]
    Cipher,
}

/// Encrypts and decrypts opaque, transport-safe tokens.
#[async_trait]
pub trait TokenCodec: Send + Sync {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, CodecError>;
    async fn decrypt(&self, token: &str) -> Result<Vec<u8>, CodecError>;
}

/// Encrypts `plaintext` under `key` with a fresh random IV.
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<String, CodecError> {
    let mut buffer = vec![0u8; IV_LEN + plaintext.len()];
    let (iv, body) = buffer.split_at_mut(IV_LEN);
    OsRng
        .try_fill_bytes(iv)
        .map_err(|e| CodecError::Entropy(e.to_string()))?;
    body.copy_from_slice(plaintext);

    Aes256CfbEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| CodecError::Cipher)?
        .encrypt(body);

    Ok(URL_SAFE.encode(buffer))
}

/// Recovers the plaintext of a token produced by [`seal`].
pub fn open(key: &SecretKey, token: &str) -> Result<Vec<u8>, CodecError> {
    open_bytes(key, decode_token(token)?)
}

/// Decrypts an already decoded `iv || ciphertext` buffer.
pub fn open_bytes(key: &SecretKey, mut buffer: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    if buffer.len() < IV_LEN {
        return Err(CodecError::Truncated(buffer.len()));
    }
    let (iv, body) = buffer.split_at_mut(IV_LEN);

    Aes256CfbDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| CodecError::Cipher)?
        .decrypt(body);

    Ok(buffer.split_off(IV_LEN))
}

fn decode_token(token: &str) -> Result<Vec<u8>, CodecError> {
    if token.is_empty() {
        return Err(CodecError::Empty);
    }
    let bytes = URL_SAFE.decode(token)?;
    if bytes.len() < IV_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    Ok(bytes)
}

/// [`TokenCodec`] keyed by the hub's lazily loaded secret.
pub struct AesCfbCodec {
    keys: Arc<KeyProvider>,
}

impl AesCfbCodec {
    pub fn new(keys: Arc<KeyProvider>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl TokenCodec for AesCfbCodec {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, CodecError> {
        let key = self.keys.secret_key().await?;
        seal(key, plaintext)
    }

    async fn decrypt(&self, token: &str) -> Result<Vec<u8>, CodecError> {
        // Reject malformed input before touching the key store.
        let buffer = decode_token(token)?;
        let key = self.keys.secret_key().await?;
        open_bytes(key, buffer)
    }
}
