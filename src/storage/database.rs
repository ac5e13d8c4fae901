//! SQLite database for persistent storage
//!
//! Corrections and telemetry are stored encrypted, one row per record.
//! Rows are insert-only: nothing is ever updated in place, only appended,
//! pruned by age or purged by collection.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::crypto::{self, EncryptedRecord, SessionCredential};
use crate::error::{StoreError, StoreResult};

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Encrypted record collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Corrections,
    Telemetry,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Corrections, Collection::Telemetry];

    pub fn table(&self) -> &'static str {
        match self {
            Collection::Corrections => "corrections",
            Collection::Telemetry => "telemetry",
        }
    }
}

/// Database connection wrapper
pub struct EncryptedStore {
    pub(super) conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl EncryptedStore {
    /// Open or create database at path
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        info!("Opened store at {:?}", path);
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Initialize database schema
    pub fn init_schema(&self) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::Schema {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        let tx = conn.transaction()?;
        while version < CURRENT_SCHEMA_VERSION {
            version += 1;
            apply_migration(&tx, version)?;
            debug!("Applied schema migration {}", version);
        }
        tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
        tx.commit()?;
        Ok(())
    }

    /// Encrypt and append a record stamped with the current time
    pub fn insert<T: Serialize>(
        &self,
        collection: Collection,
        value: &T,
        credential: &SessionCredential,
    ) -> StoreResult<i64> {
        self.insert_at(collection, value, credential, super::now_ms())
    }

    /// Encrypt and append a record with an explicit creation time
    pub fn insert_at<T: Serialize>(
        &self,
        collection: Collection,
        value: &T,
        credential: &SessionCredential,
        created_at: i64,
    ) -> StoreResult<i64> {
        // Key derivation is slow; keep it outside the connection lock
        let record = crypto::encrypt(value, credential, created_at)?;

        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} (payload, iv, salt, created_at) VALUES (?1, ?2, ?3, ?4)",
                collection.table()
            ),
            params![record.payload, record.iv, record.salt, record.created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch and decrypt one record
    ///
    /// A missing row is `Ok(None)`; a row that fails to decrypt is
    /// [`StoreError::Decryption`], never `None`.
    pub fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: i64,
        credential: &SessionCredential,
    ) -> StoreResult<Option<T>> {
        let record = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!(
                    "SELECT payload, iv, salt, created_at FROM {} WHERE id = ?1",
                    collection.table()
                ),
                params![id],
                |row| {
                    Ok(EncryptedRecord {
                        payload: row.get(0)?,
                        iv: row.get(1)?,
                        salt: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?
        };

        match record {
            Some(record) => crypto::decrypt(&record, credential, id).map(Some),
            None => Ok(None),
        }
    }

    /// Fetch and decrypt every record in insertion order
    pub fn load_all<T: DeserializeOwned>(
        &self,
        collection: Collection,
        credential: &SessionCredential,
    ) -> StoreResult<Vec<(i64, T)>> {
        let rows = self.raw_records(collection)?;
        rows.iter()
            .map(|(id, record)| crypto::decrypt(record, credential, *id).map(|value| (*id, value)))
            .collect()
    }

    fn raw_records(&self, collection: Collection) -> StoreResult<Vec<(i64, EncryptedRecord)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, payload, iv, salt, created_at FROM {} ORDER BY id ASC",
            collection.table()
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    EncryptedRecord {
                        payload: row.get(1)?,
                        iv: row.get(2)?,
                        salt: row.get(3)?,
                        created_at: row.get(4)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self, collection: Collection) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", collection.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete records created before `cutoff_ms`; works without the credential
    pub fn delete_older_than(&self, collection: Collection, cutoff_ms: i64) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE created_at < ?1", collection.table()),
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    /// Delete a whole collection
    pub fn purge(&self, collection: Collection) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(&format!("DELETE FROM {}", collection.table()), [])?;
        info!("Purged {} records from {}", deleted, collection.table());
        Ok(deleted)
    }
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> StoreResult<()> {
    match version {
        1 => tx.execute_batch(include_str!("schemas/schema_v1.sql"))?,
        _ => {
            return Err(StoreError::Schema {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
            })
        }
    }
    Ok(())
}
