//! Agent domain model
//!
//! The natural key `(trust_root, capability_node, agent_id)` is globally
//! unique and immutable once the agent is created; everything else on the row
//! is display metadata or lifecycle state.

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::{RegistryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Active,
    Revoked,
    Expired,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            other => Err(RegistryError::Validation(format!(
                "unknown agent status: {other}"
            ))),
        }
    }

    /// `revoked` and `expired` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Revoked | Self::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationType {
    /// Registrant proved control of a DNS domain; trust root is that domain.
    Domain,
    /// Registrant is a verified user; trust root is the registry's own `nap`.
    Hosted,
}

impl RegistrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Hosted => "hosted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "domain" => Ok(Self::Domain),
            "hosted" => Ok(Self::Hosted),
            other => Err(RegistryError::Validation(format!(
                "unknown registration type: {other}"
            ))),
        }
    }
}

/// Derived credibility label; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Trusted,
    Verified,
    Basic,
    Unverified,
}

impl TrustTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Verified => "verified",
            Self::Basic => "basic",
            Self::Unverified => "unverified",
        }
    }
}

/// Pure derivation from `(status, registration_type, cert_serial)`.
pub fn compute_trust_tier(
    status: AgentStatus,
    registration_type: RegistrationType,
    has_cert_serial: bool,
) -> TrustTier {
    match (status, registration_type, has_cert_serial) {
        (AgentStatus::Active, RegistrationType::Domain, true) => TrustTier::Trusted,
        (AgentStatus::Active, RegistrationType::Domain, false) => TrustTier::Verified,
        (AgentStatus::Active, RegistrationType::Hosted, _) => TrustTier::Basic,
        _ => TrustTier::Unverified,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Surrogate id (UUID).
    pub id: String,
    pub agent_id: String,
    pub trust_root: String,
    /// Full `>`-separated capability path, e.g. `finance>accounting`.
    pub capability_node: String,
    /// First capability level; the URI segment.
    pub category: String,
    /// Second capability level as a slug; fixed at registration.
    pub primary_skill: Option<String>,
    pub display_name: String,
    pub description: String,
    pub endpoint: Option<String>,
    pub owner_domain: Option<String>,
    pub owner_user: Option<String>,
    pub owner_email: Option<String>,
    pub registration_type: RegistrationType,
    pub status: AgentStatus,
    pub cert_serial: Option<String>,
    pub public_key_pem: Option<String>,
    pub cert_not_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// `agent://<trust_root>/<category>[/<primary_skill>]/<agent_id>`
    pub fn uri(&self) -> String {
        match &self.primary_skill {
            Some(skill) => format!(
                "agent://{}/{}/{}/{}",
                self.trust_root, self.category, skill, self.agent_id
            ),
            None => format!(
                "agent://{}/{}/{}",
                self.trust_root, self.category, self.agent_id
            ),
        }
    }

    pub fn trust_tier(&self) -> TrustTier {
        compute_trust_tier(
            self.status,
            self.registration_type,
            self.cert_serial.is_some(),
        )
    }
}

/// `agent_` + lowercase base32 of (8-byte big-endian millisecond timestamp ||
/// 10 random bytes): globally unique, naturally sortable, opaque. Never
/// reused — uniqueness is structural, so deletion frees nothing.
pub fn generate_agent_id() -> String {
    let millis = Utc::now().timestamp_millis() as u64;
    let mut bytes = [0u8; 18];
    bytes[..8].copy_from_slice(&millis.to_be_bytes());
    rand::rngs::OsRng.fill_bytes(&mut bytes[8..]);
    format!(
        "agent_{}",
        BASE32_NOPAD.encode(&bytes).to_ascii_lowercase()
    )
}
