//! DNS challenge row store
//!
//! Challenges are independent of any agent: a verified, unexpired row is
//! persistent evidence of domain control. `verified` is monotonic — the
//! conditional update can only flip false to true.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::errors::{RegistryError, Result};

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Challenge {
    pub id: String,
    pub domain: String,
    pub token: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone)]
pub struct ChallengeStore {
    pool: SqlitePool,
}

impl ChallengeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, domain: &str, token: &str, ttl_secs: i64) -> Result<Challenge> {
        let now = Utc::now();
        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            domain: domain.to_string(),
            token: token.to_string(),
            verified: false,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
        };
        sqlx::query(
            "INSERT INTO dns_challenges (id, domain, token, verified, created_at, expires_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&challenge.id)
        .bind(&challenge.domain)
        .bind(&challenge.token)
        .bind(challenge.created_at)
        .bind(challenge.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(challenge)
    }

    pub async fn get(&self, id: &str) -> Result<Challenge> {
        let row: Option<Challenge> = sqlx::query_as(
            "SELECT id, domain, token, verified, created_at, expires_at \
             FROM dns_challenges WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| RegistryError::NotFound(format!("challenge {id}")))
    }

    /// Idempotent: concurrent calls converge on a single `verified=true` row.
    pub async fn mark_verified(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE dns_challenges SET verified = 1 WHERE id = ? AND verified = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Any verified, unexpired challenge for this exact domain.
    pub async fn domain_verified(&self, domain: &str, now: DateTime<Utc>) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dns_challenges \
             WHERE domain = ? AND verified = 1 AND expires_at > ?",
        )
        .bind(domain)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Drop unverified rows past their window; returns how many went.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM dns_challenges WHERE verified = 0 AND expires_at < ?")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
