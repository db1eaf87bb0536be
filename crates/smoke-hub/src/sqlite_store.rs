//! SQLite-backed persistence for the address counter and secret key.
//!
//! Counter updates run inside a `BEGIN IMMEDIATE` transaction, which takes
//! the database write lock before reading. Separate processes sharing the
//! file are serialized as well as tasks within this one.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use crate::store::{Advance, AdvanceStep, CounterStore, SecretStore, StoreError};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

const ORDINAL_KEY: &str = "dhcp";
const SECRET_KEY: &str = "secret";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and runs migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::OperationFailed(format!("failed to open database: {}", e))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::OperationFailed(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::OperationFailed(format!("failed to open in-memory database: {}", e))
        })?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to create schema_version: {}", e)))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS secrets (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {}", e)))?;

        Ok(())
    }

    fn advance_locked(conn: &mut Connection, step: AdvanceStep<'_>) -> Result<Option<u64>, StoreError> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::OperationFailed(format!("failed to begin transaction: {}", e)))?;

        let read = tx
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![ORDINAL_KEY],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| StoreError::OperationFailed(format!("failed to read ordinal: {}", e)))
            .and_then(|value| value.ok_or_else(|| StoreError::NotFound(ORDINAL_KEY.to_string())))
            .and_then(|value| {
                u64::try_from(value)
                    .map_err(|_| StoreError::DataCorruption(format!("negative ordinal {}", value)))
            });

        let next = match step(read) {
            Advance::To(next) => next,
            // Dropping the transaction rolls it back.
            Advance::Hold => return Ok(None),
        };

        let stored = i64::try_from(next)
            .map_err(|_| StoreError::OperationFailed(format!("ordinal {} out of range", next)))?;

        tx.execute(
            "INSERT INTO counters (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![ORDINAL_KEY, stored],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to write ordinal: {}", e)))?;

        tx.commit()
            .map_err(|e| StoreError::OperationFailed(format!("failed to commit ordinal: {}", e)))?;

        Ok(Some(next))
    }

    fn insert_secret_locked(conn: &mut Connection, encoded: &str) -> Result<String, StoreError> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::OperationFailed(format!("failed to begin transaction: {}", e)))?;

        tx.execute(
            "INSERT INTO secrets (name, value) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
            params![SECRET_KEY, encoded],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to write secret key: {}", e)))?;

        let stored: String = tx
            .query_row(
                "SELECT value FROM secrets WHERE name = ?1",
                params![SECRET_KEY],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::OperationFailed(format!("failed to read secret key: {}", e)))?;

        tx.commit()
            .map_err(|e| StoreError::OperationFailed(format!("failed to commit secret key: {}", e)))?;

        Ok(stored)
    }
}

#[async_trait]
impl CounterStore for SqliteStore {
    async fn advance(&self, step: AdvanceStep<'_>) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.lock().await;
        Self::advance_locked(&mut conn, step)
    }
}

#[async_trait]
impl SecretStore for SqliteStore {
    async fn get_secret_key(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM secrets WHERE name = ?1",
            params![SECRET_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::OperationFailed(format!("failed to read secret key: {}", e)))
    }

    async fn insert_secret_key_if_absent(&self, encoded: String) -> Result<String, StoreError> {
        let mut conn = self.conn.lock().await;
        Self::insert_secret_locked(&mut conn, &encoded)
    }
}
