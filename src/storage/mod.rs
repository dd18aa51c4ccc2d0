//! SQLite storage
//!
//! One shared pool; the schema is bootstrapped at connect time so fresh
//! deployments and tests need no migration step. Row stores hold no in-memory
//! agent state — the database is the single source of truth, and all
//! state-machine serialisation happens through conditional updates.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::Result;

pub mod agents;
pub mod challenges;
pub mod federation;

pub use agents::AgentStore;
pub use challenges::ChallengeStore;
pub use federation::FederationStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL UNIQUE,
    trust_root TEXT NOT NULL,
    capability_node TEXT NOT NULL,
    category TEXT NOT NULL,
    primary_skill TEXT,
    display_name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    endpoint TEXT,
    owner_domain TEXT,
    owner_user TEXT,
    owner_email TEXT,
    registration_type TEXT NOT NULL,
    status TEXT NOT NULL,
    cert_serial TEXT,
    cert_pem TEXT,
    public_key_pem TEXT,
    cert_not_after TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (trust_root, capability_node, agent_id)
);
CREATE INDEX IF NOT EXISTS idx_agents_resolve ON agents (trust_root, agent_id);
CREATE INDEX IF NOT EXISTS idx_agents_owner ON agents (owner_user);

CREATE TABLE IF NOT EXISTS dns_challenges (
    id TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    token TEXT NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_challenges_domain ON dns_challenges (domain);

CREATE TABLE IF NOT EXISTS federated_registries (
    id TEXT PRIMARY KEY,
    trust_root TEXT NOT NULL UNIQUE,
    endpoint_url TEXT NOT NULL,
    contact TEXT NOT NULL DEFAULT '',
    intermediate_ca_pem TEXT,
    status TEXT NOT NULL,
    max_path_len INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    idx INTEGER PRIMARY KEY,
    ts TEXT NOT NULL,
    agent_uri TEXT NOT NULL,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    payload TEXT NOT NULL,
    prev_hash TEXT NOT NULL,
    hash TEXT NOT NULL
);
"#;

/// Connect to SQLite and bootstrap the schema.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement).execute(&pool).await?;
    }
    debug!(database_url, "storage ready");
    Ok(pool)
}
