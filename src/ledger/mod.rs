//! Trust ledger
//!
//! Append-only, hash-chained audit log of every state-changing core event,
//! stored in SQLite. Entry `i` commits to entry `i-1` through `prev_hash`, so
//! any in-place edit is detectable by a full re-walk. Appends run under a
//! single-writer mutex: the previous head is read and the new row inserted in
//! one critical section, so no two writers can observe the same `prev_hash`.
//!
//! Ledger failures during business operations are non-fatal by policy — the
//! caller logs and proceeds. Read endpoints stay available even when boot-time
//! verification reports a mismatch.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::crypto::sha256_hex;
use crate::errors::{RegistryError, Result};

/// `prev_hash` of the genesis entry.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const GENESIS_ACTION: &str = "genesis";
const GENESIS_ACTOR: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub index: i64,
    pub timestamp: DateTime<Utc>,
    pub agent_uri: String,
    pub action: String,
    pub actor: String,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Outcome of a full chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChainStatus {
    Valid { entries: i64 },
    Mismatch { index: i64 },
}

impl ChainStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainStatus::Valid { .. })
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    idx: i64,
    ts: String,
    agent_uri: String,
    action: String,
    actor: String,
    payload: String,
    prev_hash: String,
    hash: String,
}

impl LedgerRow {
    fn into_entry(self) -> Result<LedgerEntry> {
        let timestamp = DateTime::parse_from_rfc3339(&self.ts)
            .map_err(|e| RegistryError::Ledger(format!("bad timestamp at {}: {e}", self.idx)))?
            .with_timezone(&Utc);
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| RegistryError::Ledger(format!("bad payload at {}: {e}", self.idx)))?;
        Ok(LedgerEntry {
            index: self.idx,
            timestamp,
            agent_uri: self.agent_uri,
            action: self.action,
            actor: self.actor,
            payload,
            prev_hash: self.prev_hash,
            hash: self.hash,
        })
    }
}

pub struct TrustLedger {
    pool: SqlitePool,
    /// Serialises head-read + insert; SQLite's single writer does not by
    /// itself prevent two appends from reading the same head.
    write_lock: Mutex<()>,
}

impl TrustLedger {
    /// Open the ledger over an initialised pool, writing the genesis entry if
    /// the chain is empty.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        let ledger = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        ledger.ensure_genesis().await?;
        Ok(ledger)
    }

    async fn ensure_genesis(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(());
        }
        // Fixed content so every registry's chain starts from the same hash.
        let ts = Utc
            .timestamp_opt(0, 0)
            .single()
            .expect("epoch is representable");
        let ts_str = format_ts(&ts);
        let payload = "{}".to_string();
        let hash = entry_hash(0, &ts_str, "", GENESIS_ACTION, GENESIS_ACTOR, &payload, GENESIS_PREV_HASH);
        sqlx::query(
            "INSERT INTO ledger_entries (idx, ts, agent_uri, action, actor, payload, prev_hash, hash)
             VALUES (0, ?, '', ?, ?, ?, ?, ?)",
        )
        .bind(&ts_str)
        .bind(GENESIS_ACTION)
        .bind(GENESIS_ACTOR)
        .bind(&payload)
        .bind(GENESIS_PREV_HASH)
        .bind(&hash)
        .execute(&self.pool)
        .await?;
        debug!(%hash, "ledger genesis written");
        Ok(())
    }

    /// Append one entry and return it.
    pub async fn append(
        &self,
        agent_uri: &str,
        action: &str,
        actor: &str,
        payload: serde_json::Value,
    ) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;

        let head: LedgerRow = sqlx::query_as(
            "SELECT idx, ts, agent_uri, action, actor, payload, prev_hash, hash
             FROM ledger_entries ORDER BY idx DESC LIMIT 1",
        )
        .fetch_one(&self.pool)
        .await?;

        let index = head.idx + 1;
        let timestamp = Utc::now();
        let ts_str = format_ts(&timestamp);
        let payload_str = payload.to_string();
        let hash = entry_hash(
            index,
            &ts_str,
            agent_uri,
            action,
            actor,
            &payload_str,
            &head.hash,
        );

        sqlx::query(
            "INSERT INTO ledger_entries (idx, ts, agent_uri, action, actor, payload, prev_hash, hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(index)
        .bind(&ts_str)
        .bind(agent_uri)
        .bind(action)
        .bind(actor)
        .bind(&payload_str)
        .bind(&head.hash)
        .bind(&hash)
        .execute(&self.pool)
        .await?;

        debug!(index, action, agent_uri, "ledger append");
        Ok(LedgerEntry {
            index,
            timestamp,
            agent_uri: agent_uri.to_string(),
            action: action.to_string(),
            actor: actor.to_string(),
            payload,
            prev_hash: head.hash,
            hash,
        })
    }

    /// Best-effort append used inside business operations: failures are
    /// logged, never propagated.
    pub async fn record(
        &self,
        agent_uri: &str,
        action: &str,
        actor: &str,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self.append(agent_uri, action, actor, payload).await {
            warn!(action, agent_uri, "ledger append failed (continuing): {e}");
        }
    }

    /// Recompute every hash in order; returns the first mismatching index if
    /// the chain has been tampered with.
    pub async fn verify(&self) -> Result<ChainStatus> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT idx, ts, agent_uri, action, actor, payload, prev_hash, hash
             FROM ledger_entries ORDER BY idx ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut prev_hash = GENESIS_PREV_HASH.to_string();
        for (expected_idx, row) in rows.iter().enumerate() {
            let expected_idx = expected_idx as i64;
            if row.idx != expected_idx || row.prev_hash != prev_hash {
                return Ok(ChainStatus::Mismatch { index: row.idx });
            }
            let recomputed = entry_hash(
                row.idx,
                &row.ts,
                &row.agent_uri,
                &row.action,
                &row.actor,
                &row.payload,
                &row.prev_hash,
            );
            if recomputed != row.hash {
                return Ok(ChainStatus::Mismatch { index: row.idx });
            }
            prev_hash = row.hash.clone();
        }
        Ok(ChainStatus::Valid {
            entries: rows.len() as i64,
        })
    }

    /// Hash of the last entry.
    pub async fn root(&self) -> Result<String> {
        let hash: String =
            sqlx::query_scalar("SELECT hash FROM ledger_entries ORDER BY idx DESC LIMIT 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(hash)
    }

    pub async fn get(&self, index: i64) -> Result<LedgerEntry> {
        let row: Option<LedgerRow> = sqlx::query_as(
            "SELECT idx, ts, agent_uri, action, actor, payload, prev_hash, hash
             FROM ledger_entries WHERE idx = ?",
        )
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| RegistryError::NotFound(format!("ledger entry {index}")))?
            .into_entry()
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT idx, ts, agent_uri, action, actor, payload, prev_hash, hash
             FROM ledger_entries ORDER BY idx ASC LIMIT ? OFFSET ?",
        )
        .bind(limit.clamp(1, 1000))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerRow::into_entry).collect()
    }

    pub async fn len(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// The hash serialisation is part of the wire-stable format: fields joined
/// with `|`, timestamp RFC 3339 with microseconds, payload as compact JSON.
fn entry_hash(
    index: i64,
    ts: &str,
    agent_uri: &str,
    action: &str,
    actor: &str,
    payload: &str,
    prev_hash: &str,
) -> String {
    let encoded = format!("{index}|{ts}|{agent_uri}|{action}|{actor}|{payload}|{prev_hash}");
    sha256_hex(encoded.as_bytes())
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
