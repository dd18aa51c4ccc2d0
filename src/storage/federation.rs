//! Federation table store
//!
//! One row per peer registry authorised (or applying) to serve a trust-root
//! namespace. Only `active` rows participate in resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::errors::{RegistryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FederationStatus {
    Pending,
    Active,
    Suspended,
}

impl FederationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            other => Err(RegistryError::Validation(format!(
                "unknown federation status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredRegistry {
    pub id: String,
    pub trust_root: String,
    pub endpoint_url: String,
    pub contact: String,
    /// Set once an intermediate CA has been delegated; the key never is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediate_ca_pem: Option<String>,
    pub status: FederationStatus,
    pub max_path_len: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct RegistryRow {
    id: String,
    trust_root: String,
    endpoint_url: String,
    contact: String,
    intermediate_ca_pem: Option<String>,
    status: String,
    max_path_len: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RegistryRow> for RegisteredRegistry {
    type Error = RegistryError;

    fn try_from(row: RegistryRow) -> Result<RegisteredRegistry> {
        Ok(RegisteredRegistry {
            id: row.id,
            trust_root: row.trust_root,
            endpoint_url: row.endpoint_url,
            contact: row.contact,
            intermediate_ca_pem: row.intermediate_ca_pem,
            status: FederationStatus::parse(&row.status)?,
            max_path_len: row.max_path_len,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_REGISTRY: &str = "SELECT id, trust_root, endpoint_url, contact, \
     intermediate_ca_pem, status, max_path_len, created_at, updated_at \
     FROM federated_registries";

#[derive(Clone)]
pub struct FederationStore {
    pool: SqlitePool,
}

impl FederationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        trust_root: &str,
        endpoint_url: &str,
        contact: &str,
    ) -> Result<RegisteredRegistry> {
        let now = Utc::now();
        let registry = RegisteredRegistry {
            id: Uuid::new_v4().to_string(),
            trust_root: trust_root.to_string(),
            endpoint_url: endpoint_url.to_string(),
            contact: contact.to_string(),
            intermediate_ca_pem: None,
            status: FederationStatus::Pending,
            max_path_len: None,
            created_at: now,
            updated_at: now,
        };
        let result = sqlx::query(
            "INSERT INTO federated_registries \
             (id, trust_root, endpoint_url, contact, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&registry.id)
        .bind(&registry.trust_root)
        .bind(&registry.endpoint_url)
        .bind(&registry.contact)
        .bind(registry.status.as_str())
        .bind(registry.created_at)
        .bind(registry.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(registry),
            Err(e)
                if matches!(
                    e.as_database_error().map(|d| d.kind()),
                    Some(sqlx::error::ErrorKind::UniqueViolation)
                ) =>
            {
                Err(RegistryError::Conflict(format!(
                    "trust root {trust_root} already registered"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<RegisteredRegistry> {
        let row: Option<RegistryRow> = sqlx::query_as(&format!("{SELECT_REGISTRY} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| RegistryError::NotFound(format!("registry {id}")))?
            .try_into()
    }

    pub async fn get_by_trust_root(&self, trust_root: &str) -> Result<Option<RegisteredRegistry>> {
        let row: Option<RegistryRow> =
            sqlx::query_as(&format!("{SELECT_REGISTRY} WHERE trust_root = ?"))
                .bind(trust_root)
                .fetch_optional(&self.pool)
                .await?;
        row.map(RegisteredRegistry::try_from).transpose()
    }

    /// The entry resolution consults: active rows only.
    pub async fn active_by_trust_root(
        &self,
        trust_root: &str,
    ) -> Result<Option<RegisteredRegistry>> {
        let row: Option<RegistryRow> = sqlx::query_as(&format!(
            "{SELECT_REGISTRY} WHERE trust_root = ? AND status = 'active'"
        ))
        .bind(trust_root)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RegisteredRegistry::try_from).transpose()
    }

    pub async fn set_status(&self, id: &str, status: FederationStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE federated_registries SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("registry {id}")));
        }
        Ok(())
    }

    /// Record the delegated intermediate certificate (PEM only; the private
    /// key left the process in the issuance response).
    pub async fn set_intermediate(
        &self,
        id: &str,
        intermediate_ca_pem: &str,
        max_path_len: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE federated_registries SET intermediate_ca_pem = ?, max_path_len = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(intermediate_ca_pem)
        .bind(max_path_len)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("registry {id}")));
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<RegisteredRegistry>> {
        let rows: Vec<RegistryRow> =
            sqlx::query_as(&format!("{SELECT_REGISTRY} ORDER BY created_at ASC"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(RegisteredRegistry::try_from).collect()
    }
}
