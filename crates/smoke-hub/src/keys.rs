//! Symmetric secret key management.
//!
//! The key is loaded from the [`SecretStore`] the first time it is needed,
//! generated and persisted when none exists, and then held for the lifetime
//! of the [`KeyProvider`]. It is never rotated: every issued identity token
//! depends on it.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::store::{SecretStore, StoreError};

/// AES-256 key length in bytes.
pub const SECRET_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("secret store error: {0}")]
    Store(#[from] StoreError),

    #[error("stored secret key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("stored secret key has length {0}, expected 32")]
    Length(usize),

    #[error("failed to gather entropy: {0}")]
    Entropy(String),
}

/// 32-byte symmetric key. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; SECRET_KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = [0u8; SECRET_KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeyError::Entropy(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.0
    }

    /// Encoding used at rest.
    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let mut decoded = URL_SAFE.decode(encoded)?;
        let result = <[u8; SECRET_KEY_LEN]>::try_from(decoded.as_slice())
            .map(Self)
            .map_err(|_| KeyError::Length(decoded.len()));
        decoded.zeroize();
        result
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Lazily loads the secret key once and serves it from memory afterwards.
pub struct KeyProvider {
    store: Arc<dyn SecretStore>,
    key: OnceCell<SecretKey>,
}

impl KeyProvider {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            key: OnceCell::new(),
        }
    }

    /// Provider with a fixed key that never touches its store.
    pub fn with_key(store: Arc<dyn SecretStore>, key: SecretKey) -> Self {
        Self {
            store,
            key: OnceCell::new_with(Some(key)),
        }
    }

    /// Returns the cached key, loading or creating it on first use.
    /// A failed load is not cached; the next call tries again.
    pub async fn secret_key(&self) -> Result<&SecretKey, KeyError> {
        self.key.get_or_try_init(|| self.load()).await
    }

    async fn load(&self) -> Result<SecretKey, KeyError> {
        match self.store.get_secret_key().await {
            Ok(Some(encoded)) => {
                debug!("Loaded persisted secret key");
                return SecretKey::from_base64(&encoded);
            }
            Ok(None) => info!("No secret key persisted, generating a new one"),
            Err(e) => warn!("Failed to read secret key, generating a new one: {}", e),
        }

        let generated = SecretKey::generate()?;
        let stored = self
            .store
            .insert_secret_key_if_absent(generated.to_base64())
            .await?;
        let key = SecretKey::from_base64(&stored)?;
        if key != generated {
            info!("Another instance created the secret key first, adopting it");
        }
        Ok(key)
    }
}
