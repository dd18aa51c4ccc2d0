//! Registry configuration
//!
//! Loaded by the server binary from an optional TOML file merged with
//! `NAP_`-prefixed environment overrides; every field has a working default so
//! a bare `nap-registry` invocation starts a standalone registry.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{RegistryError, Result};

/// Which position this instance occupies in the certificate hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryRole {
    /// Anchors the PKI and operates the federation table.
    Root,
    /// Delegated intermediate serving its own trust-root namespace.
    Federated,
    /// Whole stack in isolation; behaves like a root with no peers.
    Standalone,
}

impl RegistryRole {
    /// The federation service (and its resolution admission rule) is attached
    /// in every role except `federated`.
    pub fn has_federation(&self) -> bool {
        !matches!(self, RegistryRole::Federated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub role: RegistryRole,
    /// Public base URL of this registry, embedded in endorsements.
    pub registry_url: String,
    /// Domain the registry service itself runs under; reserved as a trust
    /// root so nobody can register agents in the operator's namespace.
    pub own_domain: String,
    pub bind_addr: SocketAddr,
    /// mTLS listener; `None` disables the second port.
    pub mtls_bind_addr: Option<SocketAddr>,
    pub database_url: String,
    pub ca: CaConfig,
    pub tokens: TokenConfig,
    pub dns: DnsConfig,
    pub federation: FederationConfig,
    pub limits: LimitsConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            role: RegistryRole::Standalone,
            registry_url: "https://localhost:8440".to_string(),
            own_domain: "localhost".to_string(),
            bind_addr: "[::]:8440".parse().expect("valid default bind addr"),
            mtls_bind_addr: None,
            database_url: "sqlite://nap-registry.db?mode=rwc".to_string(),
            ca: CaConfig::default(),
            tokens: TokenConfig::default(),
            dns: DnsConfig::default(),
            federation: FederationConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Directory holding the CA key and certificate (key written mode 0600).
    pub dir: PathBuf,
    /// Federated role: operator-supplied intermediate material.
    pub intermediate_cert_path: Option<PathBuf>,
    pub intermediate_key_path: Option<PathBuf>,
    /// Federated role: HTTPS URL the root anchor PEM is fetched from at boot.
    pub root_anchor_url: Option<String>,
    pub root_validity_days: i64,
    pub intermediate_validity_days: i64,
    pub leaf_validity_days: i64,
    /// Upper bound on `max_path_len` accepted by IssueIntermediateCA.
    pub max_delegation_path_len: u32,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./ca"),
            intermediate_cert_path: None,
            intermediate_key_path: None,
            root_anchor_url: None,
            root_validity_days: 3650,
            intermediate_validity_days: 1825,
            leaf_validity_days: 365,
            max_delegation_path_len: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// `iss` claim on every token family.
    pub issuer: String,
    pub task_ttl_secs: i64,
    pub session_ttl_secs: i64,
    pub endorsement_ttl_secs: i64,
    pub oauth_state_ttl_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "nap-registry".to_string(),
            task_ttl_secs: 3600,
            session_ttl_secs: 86_400,
            endorsement_ttl_secs: 365 * 86_400,
            oauth_state_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Label under which challenge TXT records are published
    /// (`_<prefix>.<domain>` = `<prefix>=<token>`).
    pub challenge_prefix: String,
    pub challenge_ttl_secs: i64,
    pub sweep_interval_secs: u64,
    pub lookup_timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            challenge_prefix: "nap-challenge".to_string(),
            challenge_ttl_secs: 900,
            sweep_interval_secs: 300,
            lookup_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Fallback endpoint when neither the table nor DNS yields a registry.
    pub root_registry_url: Option<String>,
    pub resolve_timeout_secs: u64,
    pub resolve_cache_ttl_secs: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            root_registry_url: None,
            resolve_timeout_secs: 5,
            resolve_cache_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Non-revoked agents a hosted owner may hold; 0 means unlimited.
    pub hosted_agent_quota: u32,
    /// Registrations scoring at or above this threshold are rejected.
    pub threat_score_threshold: u8,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            hosted_agent_quota: 10,
            threat_score_threshold: 85,
            request_timeout_secs: 10,
            max_body_bytes: 1024 * 1024,
            rate_limit_per_minute: 120,
            rate_limit_burst: 30,
        }
    }
}

impl RegistryConfig {
    /// Load from a TOML file (optional) with `NAP_` environment overrides,
    /// e.g. `NAP_ROLE=root` or `NAP_CA__DIR=/var/lib/nap/ca`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("NAP").separator("__"))
            .build()
            .map_err(|e| RegistryError::Validation(format!("configuration: {e}")))?;
        // Missing keys fall back to the serde defaults.
        settings
            .try_deserialize()
            .map_err(|e| RegistryError::Validation(format!("configuration: {e}")))
    }

    /// Trust roots no registrant may claim: the hosted-tier constant plus the
    /// operator's own domain.
    pub fn reserved_trust_roots(&self) -> [&str; 2] {
        [crate::HOSTED_TRUST_ROOT, self.own_domain.as_str()]
    }

    pub fn validate(&self) -> Result<()> {
        if self.role == RegistryRole::Federated {
            if self.ca.intermediate_cert_path.is_none() || self.ca.intermediate_key_path.is_none() {
                return Err(RegistryError::Validation(
                    "federated role requires intermediate_cert_path and intermediate_key_path"
                        .into(),
                ));
            }
            if self.ca.root_anchor_url.is_none() {
                return Err(RegistryError::Validation(
                    "federated role requires root_anchor_url".into(),
                ));
            }
        }
        if self.registry_url.is_empty() {
            return Err(RegistryError::Validation("registry_url must be set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_standalone_and_valid() {
        let cfg = RegistryConfig::default();
        assert_eq!(cfg.role, RegistryRole::Standalone);
        assert!(cfg.role.has_federation());
        cfg.validate().expect("default config validates");
    }

    #[test]
    fn federated_role_requires_intermediate_material() {
        let cfg = RegistryConfig {
            role: RegistryRole::Federated,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reserved_roots_cover_hosted_constant_and_own_domain() {
        let cfg = RegistryConfig {
            own_domain: "registry.example".into(),
            ..Default::default()
        };
        let reserved = cfg.reserved_trust_roots();
        assert!(reserved.contains(&"nap"));
        assert!(reserved.contains(&"registry.example"));
    }
}
