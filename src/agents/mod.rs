//! Agent lifecycle service
//!
//! Drives the state machine `pending -> active -> {revoked | expired}` over
//! the relational store. Verification gates sit in front of activation: the
//! domain path requires a verified DNS-01 challenge, the hosted path a
//! confirmed email. The service holds no in-memory agent state; every
//! transition is a conditional update so concurrent calls cannot both win.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::ca::{self, CertificateAuthority};
use crate::config::RegistryConfig;
use crate::dns::{normalize_domain, DnsChallengeService};
use crate::errors::{RegistryError, Result};
use crate::federation::resolver::RemoteResolver;
use crate::ledger::TrustLedger;
use crate::storage::agents::{AgentFilter, AgentPatch};
use crate::storage::AgentStore;
use crate::tokens::TokenService;

pub mod capability;
pub mod card;
pub mod model;

pub use capability::{node_matches_prefix, parse_capability, slugify, Capability};
pub use model::{
    compute_trust_tier, generate_agent_id, Agent, AgentStatus, RegistrationType, TrustTier,
};

/// Checks whether a hosted owner's email address has been confirmed. The
/// confirmation flow itself (SMTP, links) is an external collaborator.
#[async_trait]
pub trait EmailVerifier: Send + Sync {
    async fn is_verified(&self, owner_user: &str) -> Result<bool>;
}

/// Optional registration screening hook; scores at or above the configured
/// threshold reject the registration.
#[async_trait]
pub trait ThreatScorer: Send + Sync {
    async fn score(&self, request: &RegisterRequest) -> Result<u8>;
}

/// Accepts every hosted owner. For deployments where the user/SMTP system is
/// not wired up (standalone and development); production registries inject a
/// verifier backed by their user store.
pub struct PermissiveEmailVerifier;

#[async_trait]
impl EmailVerifier for PermissiveEmailVerifier {
    async fn is_verified(&self, _owner_user: &str) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub registration_type: RegistrationType,
    pub capability: String,
    /// Optional extra URI segment between category and agent id; slugified
    /// and frozen at registration.
    #[serde(default)]
    pub primary_skill: Option<String>,
    #[serde(default)]
    pub owner_domain: Option<String>,
    #[serde(default)]
    pub owner_user: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
    /// Never accepted on the hosted path; the registry controls `nap`.
    #[serde(default)]
    pub trust_root: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Everything returned by a successful activation. `private_key_pem` crosses
/// the boundary exactly once and is not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationBundle {
    pub agent: Agent,
    pub uri: String,
    pub trust_tier: TrustTier,
    pub cert_pem: String,
    pub private_key_pem: String,
    pub ca_pem: String,
    pub endorsement_jwt: String,
    pub task_jwt: String,
    pub agent_card: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_manifest: Option<serde_json::Value>,
}

/// The record a resolve returns, identical for local hits and federated ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAgent {
    pub uri: String,
    pub agent_id: String,
    pub trust_root: String,
    pub capability_node: String,
    pub category: String,
    pub display_name: String,
    pub description: String,
    pub endpoint: Option<String>,
    pub status: AgentStatus,
    pub trust_tier: TrustTier,
    /// Base URL of the registry that answered.
    pub registry_url: String,
}

impl ResolvedAgent {
    pub fn from_agent(agent: &Agent, registry_url: &str) -> Self {
        Self {
            uri: agent.uri(),
            agent_id: agent.agent_id.clone(),
            trust_root: agent.trust_root.clone(),
            capability_node: agent.capability_node.clone(),
            category: agent.category.clone(),
            display_name: agent.display_name.clone(),
            description: agent.description.clone(),
            endpoint: agent.endpoint.clone(),
            status: agent.status,
            trust_tier: agent.trust_tier(),
            registry_url: registry_url.to_string(),
        }
    }
}

pub struct AgentService {
    store: AgentStore,
    ca: Arc<CertificateAuthority>,
    tokens: Arc<TokenService>,
    ledger: Arc<TrustLedger>,
    challenges: Arc<DnsChallengeService>,
    email_verifier: Arc<dyn EmailVerifier>,
    threat_scorer: Option<Arc<dyn ThreatScorer>>,
    resolver: Option<Arc<RemoteResolver>>,
    config: Arc<RegistryConfig>,
}

impl AgentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: AgentStore,
        ca: Arc<CertificateAuthority>,
        tokens: Arc<TokenService>,
        ledger: Arc<TrustLedger>,
        challenges: Arc<DnsChallengeService>,
        email_verifier: Arc<dyn EmailVerifier>,
        threat_scorer: Option<Arc<dyn ThreatScorer>>,
        resolver: Option<Arc<RemoteResolver>>,
        config: Arc<RegistryConfig>,
    ) -> Self {
        Self {
            store,
            ca,
            tokens,
            ledger,
            challenges,
            email_verifier,
            threat_scorer,
            resolver,
            config,
        }
    }

    /// Register a new agent as `pending`.
    pub async fn register(&self, request: RegisterRequest) -> Result<Agent> {
        if let Some(scorer) = &self.threat_scorer {
            let score = scorer.score(&request).await?;
            if score >= self.config.limits.threat_score_threshold {
                warn!(score, "registration rejected by threat screening");
                return Err(RegistryError::Forbidden(
                    "registration rejected by threat screening".into(),
                ));
            }
        }

        let cap = parse_capability(&request.capability)?;
        let (trust_root, owner_domain, owner_user) = match request.registration_type {
            RegistrationType::Hosted => {
                // The only defence against hosted-tier trust-root spoofing is
                // rejecting caller-supplied roots outright.
                if request.trust_root.as_deref().is_some_and(|t| !t.is_empty()) {
                    return Err(RegistryError::Validation(
                        "hosted registrations cannot supply a trust root".into(),
                    ));
                }
                let owner_user = request
                    .owner_user
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        RegistryError::Validation("hosted registration requires owner_user".into())
                    })?
                    .to_string();

                let quota = self.config.limits.hosted_agent_quota;
                if quota > 0 {
                    let held = self.store.count_for_owner(&owner_user).await?;
                    if held >= quota as i64 {
                        return Err(RegistryError::QuotaExceeded(format!(
                            "owner {owner_user} already holds {held} agents"
                        )));
                    }
                }
                (crate::HOSTED_TRUST_ROOT.to_string(), None, Some(owner_user))
            }
            RegistrationType::Domain => {
                let domain = request
                    .owner_domain
                    .as_deref()
                    .ok_or_else(|| {
                        RegistryError::Validation("domain registration requires owner_domain".into())
                    })
                    .and_then(normalize_domain)?;
                if self
                    .config
                    .reserved_trust_roots()
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(&domain))
                {
                    return Err(RegistryError::Validation(format!(
                        "trust root {domain} is reserved"
                    )));
                }
                if request.endpoint.as_deref().unwrap_or_default().is_empty() {
                    return Err(RegistryError::Validation(
                        "domain registration requires an endpoint".into(),
                    ));
                }
                (domain.clone(), Some(domain), request.owner_user.clone())
            }
        };

        let primary_skill = request
            .primary_skill
            .as_deref()
            .map(slugify)
            .filter(|s| !s.is_empty());

        let now = Utc::now();
        let agent = Agent {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: generate_agent_id(),
            trust_root,
            capability_node: cap.node,
            category: cap.category,
            primary_skill,
            display_name: request.display_name.unwrap_or_default(),
            description: request.description.unwrap_or_default(),
            endpoint: request.endpoint,
            owner_domain,
            owner_user,
            owner_email: request.owner_email,
            registration_type: request.registration_type,
            status: AgentStatus::Pending,
            cert_serial: None,
            public_key_pem: None,
            cert_not_after: None,
            created_at: now,
            updated_at: now,
        };

        self.store.insert(&agent).await?;
        info!(agent_id = %agent.agent_id, trust_root = %agent.trust_root, "agent registered");
        self.ledger
            .record(
                &agent.uri(),
                "register",
                self.actor_of(&agent),
                json!({
                    "registration_type": agent.registration_type.as_str(),
                    "capability": agent.capability_node,
                }),
            )
            .await;
        Ok(agent)
    }

    /// Activate a pending agent: verification gate, leaf issuance, conditional
    /// status flip, activation bundle. The loser of a concurrent activation
    /// gets `Conflict`.
    pub async fn activate(&self, id: &str) -> Result<ActivationBundle> {
        let agent = self.store.get(id).await?;
        match agent.status {
            AgentStatus::Pending => {}
            AgentStatus::Active => {
                return Err(RegistryError::Conflict(format!(
                    "agent {} is already active",
                    agent.agent_id
                )))
            }
            status => {
                return Err(RegistryError::Conflict(format!(
                    "agent {} is {} and cannot be activated",
                    agent.agent_id,
                    status.as_str()
                )))
            }
        }

        let owner_email = match agent.registration_type {
            RegistrationType::Domain => {
                let domain = agent.owner_domain.as_deref().unwrap_or_default();
                if !self.challenges.is_domain_verified(domain).await? {
                    return Err(RegistryError::DomainNotVerified(format!(
                        "no verified DNS challenge for {domain}"
                    )));
                }
                None
            }
            RegistrationType::Hosted => {
                let owner = agent.owner_user.as_deref().unwrap_or_default();
                if !self.email_verifier.is_verified(owner).await? {
                    return Err(RegistryError::EmailNotVerified(format!(
                        "owner {owner} has no confirmed email"
                    )));
                }
                Some(
                    agent
                        .owner_email
                        .clone()
                        .unwrap_or_else(|| owner.to_string()),
                )
            }
        };

        let uri = agent.uri();
        let common_name = match agent.registration_type {
            RegistrationType::Domain => agent.owner_domain.clone().unwrap_or_default(),
            RegistrationType::Hosted => {
                format!("{}.{}", agent.agent_id, crate::HOSTED_TRUST_ROOT)
            }
        };

        // Keypair generation is CPU-bound; keep it off the async workers.
        let issued = {
            let ca = self.ca.clone();
            let uri = uri.clone();
            let validity_days = self.config.ca.leaf_validity_days;
            tokio::task::spawn_blocking(move || {
                ca.issue_leaf(&uri, &common_name, validity_days, owner_email.as_deref())
            })
            .await
            .map_err(|e| RegistryError::Certificate(format!("issuance task: {e}")))??
        };

        let public_key_pem = ca::leaf_public_key_pem(&issued.cert_pem)?;
        let won = self
            .store
            .activate(
                &agent.id,
                &issued.serial,
                &issued.cert_pem,
                &public_key_pem,
                issued.not_after,
            )
            .await?;
        if !won {
            // Someone else activated (or revoked) the row between our read
            // and the update; the freshly issued key is dropped here.
            return Err(RegistryError::Conflict(format!(
                "agent {} was activated concurrently",
                agent.agent_id
            )));
        }

        let agent = self.store.get(&agent.id).await?;
        let tier = agent.trust_tier();
        let endorsement_jwt =
            self.tokens
                .issue_endorsement(&uri, tier.as_str(), &issued.serial)?;
        let task_jwt = self
            .tokens
            .issue_task_token(&uri, vec!["resolve".into()], None)?;
        let agent_card =
            card::build_agent_card(&agent, &self.config.registry_url, &endorsement_jwt);
        let mcp_manifest = match agent.registration_type {
            RegistrationType::Hosted => Some(card::build_mcp_manifest(&agent)),
            RegistrationType::Domain => None,
        };

        info!(agent_id = %agent.agent_id, serial = %issued.serial, "agent activated");
        self.ledger
            .record(
                &uri,
                "activate",
                self.actor_of(&agent),
                json!({ "cert_serial": issued.serial, "trust_tier": tier.as_str() }),
            )
            .await;

        Ok(ActivationBundle {
            uri,
            trust_tier: tier,
            cert_pem: issued.cert_pem,
            private_key_pem: issued.key_pem,
            ca_pem: self.ca.ca_chain_pem(),
            endorsement_jwt,
            task_jwt,
            agent_card,
            mcp_manifest,
            agent,
        })
    }

    pub async fn revoke(&self, id: &str, reason: Option<&str>) -> Result<Agent> {
        let agent = self.store.get(id).await?;
        if !self.store.revoke(&agent.id).await? {
            return Err(RegistryError::Conflict(format!(
                "agent {} is not active",
                agent.agent_id
            )));
        }
        info!(agent_id = %agent.agent_id, "agent revoked");
        self.ledger
            .record(
                &agent.uri(),
                "revoke",
                self.actor_of(&agent),
                json!({ "reason": reason.unwrap_or("unspecified") }),
            )
            .await;
        self.store.get(&agent.id).await
    }

    pub async fn update(&self, id: &str, patch: AgentPatch) -> Result<Agent> {
        let agent = self.store.get(id).await?;
        self.store.update(&agent.id, &patch).await?;
        let updated = self.store.get(&agent.id).await?;
        self.ledger
            .record(&updated.uri(), "update", self.actor_of(&updated), json!({}))
            .await;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let agent = self.store.get(id).await?;
        self.store.delete(&agent.id).await?;
        info!(agent_id = %agent.agent_id, "agent deleted");
        self.ledger
            .record(&agent.uri(), "delete", self.actor_of(&agent), json!({}))
            .await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Agent> {
        self.store.get(id).await
    }

    pub async fn cert_pem(&self, id: &str) -> Result<Option<String>> {
        self.store.cert_pem(id).await
    }

    pub async fn list(&self, filter: AgentFilter) -> Result<Vec<Agent>> {
        self.store.list(&filter).await
    }

    /// Published card for an already-active agent, with a fresh endorsement.
    pub async fn agent_card(&self, id: &str) -> Result<serde_json::Value> {
        let agent = self.store.get(id).await?;
        let endorsement = self.tokens.issue_endorsement(
            &agent.uri(),
            agent.trust_tier().as_str(),
            agent.cert_serial.as_deref().unwrap_or_default(),
        )?;
        Ok(card::build_agent_card(&agent, &self.config.registry_url, &endorsement))
    }

    /// Resolve a logical name to a live record: local table first, then the
    /// federated cascade when one is installed.
    pub async fn resolve(
        &self,
        trust_root: &str,
        cap_node: &str,
        agent_id: &str,
    ) -> Result<ResolvedAgent> {
        let trust_root = trust_root.trim().to_lowercase();
        let cap_node = cap_node.trim().to_lowercase().replace('/', ">");

        if let Some(agent) = self.store.resolve(&trust_root, &cap_node, agent_id).await? {
            debug!(agent_id, %trust_root, "resolved locally");
            return Ok(ResolvedAgent::from_agent(&agent, &self.config.registry_url));
        }

        let local_namespace = trust_root == crate::HOSTED_TRUST_ROOT
            || trust_root.eq_ignore_ascii_case(&self.config.own_domain);
        if !local_namespace {
            if let Some(resolver) = &self.resolver {
                return resolver.resolve(&trust_root, &cap_node, agent_id).await;
            }
        }

        Err(RegistryError::NotFound(format!(
            "agent {agent_id} not found under {trust_root}"
        )))
    }

    /// One pass of the expiry sweeper: flip active agents whose certificate
    /// validity has passed.
    pub async fn expire_once(&self) -> Result<u64> {
        let due = self.store.list_expirable(Utc::now()).await?;
        let mut flipped = 0;
        for agent in due {
            if self.store.mark_expired(&agent.id).await? {
                flipped += 1;
                info!(agent_id = %agent.agent_id, "agent certificate expired");
                self.ledger
                    .record(
                        &agent.uri(),
                        "expire",
                        "system",
                        json!({ "cert_serial": agent.cert_serial }),
                    )
                    .await;
            }
        }
        Ok(flipped)
    }

    /// Background expiry loop; runs until the task is aborted.
    pub async fn run_expiry_sweeper(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.expire_once().await {
                warn!("expiry sweep failed: {e}");
            }
        }
    }

    fn actor_of<'a>(&self, agent: &'a Agent) -> &'a str {
        agent
            .owner_user
            .as_deref()
            .or(agent.owner_domain.as_deref())
            .unwrap_or("api")
    }
}
