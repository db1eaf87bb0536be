//! Storage seams for the hub's two pieces of shared state: the address
//! counter and the symmetric secret key.
//!
//! Both backends serialize counter updates inside the store so that two
//! concurrent allocations can never observe the same ordinal.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),
}

/// Decision taken by the caller inside a counter transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Persist this value as the new ordinal.
    To(u64),
    /// Leave the counter untouched.
    Hold,
}

/// Callback run inside a counter transaction. It receives the raw read so
/// the caller decides how a missing or unreadable counter is treated.
pub type AdvanceStep<'a> = &'a (dyn Fn(Result<u64, StoreError>) -> Advance + Send + Sync);

/// Durable home of the allocation ordinal.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Reads the ordinal, hands it to `step`, and persists the decision as a
    /// single isolated unit. A counter that was never written reads as
    /// `Err(StoreError::NotFound)`.
    ///
    /// Returns the persisted value, or `None` when `step` chose to hold.
    async fn advance(&self, step: AdvanceStep<'_>) -> Result<Option<u64>, StoreError>;
}

/// Durable home of the base64-encoded secret key.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret_key(&self) -> Result<Option<String>, StoreError>;

    /// Stores `encoded` unless a key already exists, and returns whichever
    /// value is stored afterwards.
    async fn insert_secret_key_if_absent(&self, encoded: String) -> Result<String, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    ordinal: Option<u64>,
    secret_key: Option<String>,
}

/// Process-local store. State is lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose counter starts at `ordinal`.
    pub fn with_ordinal(ordinal: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                ordinal: Some(ordinal),
                secret_key: None,
            })),
        }
    }

    pub async fn ordinal(&self) -> Option<u64> {
        self.state.lock().await.ordinal
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn advance(&self, step: AdvanceStep<'_>) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.lock().await;
        let read = state
            .ordinal
            .ok_or_else(|| StoreError::NotFound("ordinal".to_string()));

        match step(read) {
            Advance::To(next) => {
                state.ordinal = Some(next);
                Ok(Some(next))
            }
            Advance::Hold => Ok(None),
        }
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get_secret_key(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.secret_key.clone())
    }

    async fn insert_secret_key_if_absent(&self, encoded: String) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.secret_key.get_or_insert(encoded).clone())
    }
}
