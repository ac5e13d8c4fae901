//! Consent log and gate
//!
//! Consent is stored as plain JSON so it can be checked before the user has
//! entered a PIN. Every change appends a new record; the most recent one by
//! timestamp is authoritative.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::database::EncryptedStore;
use crate::error::{StoreError, StoreResult};

pub const CONSENT_VERSION: &str = "1.0";

/// What a consent record covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentScope {
    /// Storing corrections and telemetry from on-device recognition
    Ocr,
    /// Contributing to cross-device learning
    Federated,
}

impl std::str::FromStr for ConsentScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ocr" => Ok(ConsentScope::Ocr),
            "federated" => Ok(ConsentScope::Federated),
            other => Err(format!("unknown consent scope '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub version: String,
    pub timestamp_ms: i64,
    pub accepted: bool,
    pub scope: BTreeSet<ConsentScope>,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub revoked_at_ms: Option<i64>,
}

impl ConsentRecord {
    /// Whether this record grants `scope` at `now_ms`
    pub fn grants(&self, scope: ConsentScope, now_ms: i64) -> bool {
        if !self.accepted || self.revoked_at_ms.is_some() {
            return false;
        }
        if matches!(self.expires_at_ms, Some(expires) if now_ms >= expires) {
            return false;
        }
        self.scope.contains(&scope)
    }
}

impl EncryptedStore {
    /// Append a consent record
    pub fn append_consent(&self, record: &ConsentRecord) -> StoreResult<i64> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO consent_records (timestamp_ms, record) VALUES (?1, ?2)",
            params![record.timestamp_ms, json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent consent record, ties broken by insertion order
    pub fn latest_consent(&self) -> StoreResult<Option<ConsentRecord>> {
        let json: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT record FROM consent_records ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
        };
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every consent record, oldest first
    pub fn consent_history(&self) -> StoreResult<Vec<ConsentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT record FROM consent_records ORDER BY timestamp_ms ASC, id ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str::<ConsentRecord>(json).map_err(StoreError::from))
            .collect()
    }
}

/// Read side and state changes of the consent log
#[derive(Clone)]
pub struct ConsentGate {
    store: Arc<EncryptedStore>,
}

impl ConsentGate {
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self { store }
    }

    /// Whether `scope` is currently granted
    ///
    /// Storage failures count as no consent.
    pub fn has_consent(&self, scope: ConsentScope) -> bool {
        self.has_consent_at(scope, super::now_ms())
    }

    pub fn has_consent_at(&self, scope: ConsentScope, now_ms: i64) -> bool {
        match self.store.latest_consent() {
            Ok(Some(record)) => record.grants(scope, now_ms),
            Ok(None) => false,
            Err(e) => {
                warn!("Consent lookup failed, treating as absent: {}", e);
                false
            }
        }
    }

    /// Latest record, whether or not it still grants anything
    pub fn current(&self) -> StoreResult<Option<ConsentRecord>> {
        self.store.latest_consent()
    }

    pub fn history(&self) -> StoreResult<Vec<ConsentRecord>> {
        self.store.consent_history()
    }

    /// Record acceptance of `scopes`, optionally expiring after `ttl`
    pub fn grant(&self, scopes: &[ConsentScope], ttl: Option<Duration>) -> StoreResult<ConsentRecord> {
        self.grant_at(scopes, ttl, super::now_ms())
    }

    pub fn grant_at(&self, scopes: &[ConsentScope], ttl: Option<Duration>, now_ms: i64) -> StoreResult<ConsentRecord> {
        let record = ConsentRecord {
            version: CONSENT_VERSION.to_string(),
            timestamp_ms: now_ms,
            accepted: true,
            scope: scopes.iter().copied().collect(),
            expires_at_ms: ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis() as i64)),
            revoked_at_ms: None,
        };
        self.store.append_consent(&record)?;
        info!("Consent granted for {:?}", record.scope);
        Ok(record)
    }

    /// Append a revocation of the current record
    ///
    /// Returns `None` when nothing was ever granted.
    pub fn revoke(&self) -> StoreResult<Option<ConsentRecord>> {
        self.revoke_at(super::now_ms())
    }

    pub fn revoke_at(&self, now_ms: i64) -> StoreResult<Option<ConsentRecord>> {
        let Some(current) = self.store.latest_consent()? else {
            return Ok(None);
        };

        let record = ConsentRecord {
            timestamp_ms: now_ms,
            revoked_at_ms: Some(now_ms),
            ..current
        };
        self.store.append_consent(&record)?;
        info!("Consent revoked");
        Ok(Some(record))
    }
}
