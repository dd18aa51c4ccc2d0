//! Agent row store
//!
//! All lifecycle serialisation lives in the SQL: activation and revocation
//! are conditional updates on the current status, so concurrent transitions
//! cannot both succeed.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::agents::model::{Agent, AgentStatus, RegistrationType};
use crate::errors::{RegistryError, Result};

#[derive(Debug, sqlx::FromRow)]
struct AgentRow {
    id: String,
    agent_id: String,
    trust_root: String,
    capability_node: String,
    category: String,
    primary_skill: Option<String>,
    display_name: String,
    description: String,
    endpoint: Option<String>,
    owner_domain: Option<String>,
    owner_user: Option<String>,
    owner_email: Option<String>,
    registration_type: String,
    status: String,
    cert_serial: Option<String>,
    public_key_pem: Option<String>,
    cert_not_after: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = RegistryError;

    fn try_from(row: AgentRow) -> Result<Agent> {
        Ok(Agent {
            id: row.id,
            agent_id: row.agent_id,
            trust_root: row.trust_root,
            capability_node: row.capability_node,
            category: row.category,
            primary_skill: row.primary_skill,
            display_name: row.display_name,
            description: row.description,
            endpoint: row.endpoint,
            owner_domain: row.owner_domain,
            owner_user: row.owner_user,
            owner_email: row.owner_email,
            registration_type: RegistrationType::parse(&row.registration_type)?,
            status: AgentStatus::parse(&row.status)?,
            cert_serial: row.cert_serial,
            public_key_pem: row.public_key_pem,
            cert_not_after: row.cert_not_after,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_AGENT: &str = "SELECT id, agent_id, trust_root, capability_node, category, \
     primary_skill, display_name, description, endpoint, owner_domain, owner_user, \
     owner_email, registration_type, status, cert_serial, public_key_pem, \
     cert_not_after, created_at, updated_at FROM agents";

/// Fields a PATCH may touch; everything else is immutable after creation.
#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct AgentPatch {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct AgentFilter {
    pub trust_root: Option<String>,
    pub capability_node: Option<String>,
    pub status: Option<AgentStatus>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Clone)]
pub struct AgentStore {
    pool: SqlitePool,
}

impl AgentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, agent: &Agent) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO agents (id, agent_id, trust_root, capability_node, category, \
             primary_skill, display_name, description, endpoint, owner_domain, owner_user, \
             owner_email, registration_type, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&agent.id)
        .bind(&agent.agent_id)
        .bind(&agent.trust_root)
        .bind(&agent.capability_node)
        .bind(&agent.category)
        .bind(&agent.primary_skill)
        .bind(&agent.display_name)
        .bind(&agent.description)
        .bind(&agent.endpoint)
        .bind(&agent.owner_domain)
        .bind(&agent.owner_user)
        .bind(&agent.owner_email)
        .bind(agent.registration_type.as_str())
        .bind(agent.status.as_str())
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RegistryError::Conflict(format!(
                "agent {} already registered",
                agent.agent_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Lookup by surrogate id or public agent id.
    pub async fn get(&self, id: &str) -> Result<Agent> {
        let row: Option<AgentRow> =
            sqlx::query_as(&format!("{SELECT_AGENT} WHERE id = ? OR agent_id = ?"))
                .bind(id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| RegistryError::NotFound(format!("agent {id}")))?
            .try_into()
    }

    /// Active agent by `(trust_root, agent_id)` with capability-prefix
    /// matching on the stored node; an empty query prefix matches any node.
    pub async fn resolve(
        &self,
        trust_root: &str,
        cap_node: &str,
        agent_id: &str,
    ) -> Result<Option<Agent>> {
        let row: Option<AgentRow> = if cap_node.is_empty() {
            sqlx::query_as(&format!(
                "{SELECT_AGENT} WHERE trust_root = ? AND agent_id = ? AND status = 'active'"
            ))
            .bind(trust_root)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_as(&format!(
                "{SELECT_AGENT} WHERE trust_root = ? AND agent_id = ? AND status = 'active' \
                 AND (capability_node = ? OR substr(capability_node, 1, length(?) + 1) = ? || '>')"
            ))
            .bind(trust_root)
            .bind(agent_id)
            .bind(cap_node)
            .bind(cap_node)
            .bind(cap_node)
            .fetch_optional(&self.pool)
            .await?
        };
        row.map(Agent::try_from).transpose()
    }

    pub async fn list(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_AGENT);
        builder.push(" WHERE 1 = 1");
        if let Some(root) = &filter.trust_root {
            builder.push(" AND trust_root = ").push_bind(root);
        }
        if let Some(cap) = &filter.capability_node {
            builder
                .push(" AND (capability_node = ")
                .push_bind(cap)
                .push(" OR substr(capability_node, 1, length(")
                .push_bind(cap)
                .push(") + 1) = ")
                .push_bind(cap)
                .push(" || '>')");
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit.clamp(1, 100))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows: Vec<AgentRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    /// Non-revoked agents for a hosted owner, for quota checks.
    pub async fn count_for_owner(&self, owner_user: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM agents WHERE owner_user = ? AND status != 'revoked'",
        )
        .bind(owner_user)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Flip `pending` to `active` with the issued certificate material.
    /// Returns false when the row was not pending — the caller lost the race
    /// or the agent is already past activation.
    pub async fn activate(
        &self,
        id: &str,
        cert_serial: &str,
        cert_pem: &str,
        public_key_pem: &str,
        cert_not_after: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agents SET status = 'active', cert_serial = ?, cert_pem = ?, \
             public_key_pem = ?, cert_not_after = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(cert_serial)
        .bind(cert_pem)
        .bind(public_key_pem)
        .bind(cert_not_after)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flip `active` to `revoked`; false when the agent was not active.
    pub async fn revoke(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agents SET status = 'revoked', updated_at = ? \
             WHERE id = ? AND status = 'active'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Active agents whose certificate validity has passed.
    pub async fn list_expirable(&self, now: DateTime<Utc>) -> Result<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(&format!(
            "{SELECT_AGENT} WHERE status = 'active' AND cert_not_after IS NOT NULL \
             AND cert_not_after < ?"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Agent::try_from).collect()
    }

    /// Flip `active` to `expired`; conditional so a concurrent revoke wins.
    pub async fn mark_expired(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agents SET status = 'expired', updated_at = ? \
             WHERE id = ? AND status = 'active'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update(&self, id: &str, patch: &AgentPatch) -> Result<()> {
        let result = sqlx::query(
            "UPDATE agents SET \
             display_name = COALESCE(?, display_name), \
             description = COALESCE(?, description), \
             endpoint = COALESCE(?, endpoint), \
             updated_at = ? \
             WHERE id = ? OR agent_id = ?",
        )
        .bind(&patch.display_name)
        .bind(&patch.description)
        .bind(&patch.endpoint)
        .bind(Utc::now())
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ? OR agent_id = ?")
            .bind(id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }

    /// Stored leaf certificate PEM, when the agent has been activated.
    pub async fn cert_pem(&self, id: &str) -> Result<Option<String>> {
        let pem: Option<Option<String>> =
            sqlx::query_scalar("SELECT cert_pem FROM agents WHERE id = ? OR agent_id = ?")
                .bind(id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(pem.flatten())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e.as_database_error().map(|d| d.kind()),
        Some(sqlx::error::ErrorKind::UniqueViolation)
    )
}
