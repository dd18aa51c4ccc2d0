//! DNS-01 challenge service
//!
//! Domain-ownership proof by publishing a random TXT record, semantically the
//! ACME DNS-01 variant: the registrant publishes
//! `_<prefix>.<domain> TXT "<prefix>=<token>"` and asks the registry to look
//! it up through the system recursive resolver. A verified, unexpired
//! challenge row is durable evidence for the whole domain, not a
//! per-registration artifact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DnsConfig;
use crate::crypto;
use crate::errors::{RegistryError, Result};
use crate::storage::challenges::Challenge;
use crate::storage::ChallengeStore;

pub mod discovery;

/// Recursive TXT lookup seam; tests substitute a fixture resolver.
#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// All TXT strings at `name`; an empty vec when the name has no records.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>>;
}

/// System recursive resolver via hickory.
pub struct SystemTxtLookup {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl SystemTxtLookup {
    pub fn new(timeout: Duration) -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| RegistryError::Dns(format!("system resolver: {e}")))?;
        Ok(Self { resolver, timeout })
    }
}

#[async_trait]
impl TxtLookup for SystemTxtLookup {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.txt_lookup(name.to_string()))
            .await
            .map_err(|_| RegistryError::Dns(format!("txt lookup timed out for {name}")))?;
        let lookup = match lookup {
            Ok(lookup) => lookup,
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(RegistryError::Dns(format!("txt lookup {name}: {e}"))),
        };
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part))
                    .collect::<String>()
            })
            .collect())
    }
}

/// What the registrant must publish, returned by `start` and `get`.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeInstructions {
    pub id: String,
    pub domain: String,
    pub txt_host: String,
    pub txt_value: String,
    pub verified: bool,
    pub expires_at: DateTime<Utc>,
}

pub struct DnsChallengeService {
    store: ChallengeStore,
    lookup: Arc<dyn TxtLookup>,
    config: DnsConfig,
}

impl DnsChallengeService {
    pub fn new(store: ChallengeStore, lookup: Arc<dyn TxtLookup>, config: DnsConfig) -> Self {
        Self {
            store,
            lookup,
            config,
        }
    }

    fn txt_host(&self, domain: &str) -> String {
        format!("_{}.{}", self.config.challenge_prefix, domain)
    }

    fn txt_value(&self, token: &str) -> String {
        format!("{}={}", self.config.challenge_prefix, token)
    }

    fn instructions(&self, challenge: &Challenge) -> ChallengeInstructions {
        ChallengeInstructions {
            id: challenge.id.clone(),
            domain: challenge.domain.clone(),
            txt_host: self.txt_host(&challenge.domain),
            txt_value: self.txt_value(&challenge.token),
            verified: challenge.verified,
            expires_at: challenge.expires_at,
        }
    }

    /// Create a challenge: 32 random bytes, 15-minute window.
    pub async fn start(&self, domain: &str) -> Result<ChallengeInstructions> {
        let domain = normalize_domain(domain)?;
        let token = crypto::random_challenge_token();
        let challenge = self
            .store
            .insert(&domain, &token, self.config.challenge_ttl_secs)
            .await?;
        info!(%domain, id = %challenge.id, "dns challenge started");
        Ok(self.instructions(&challenge))
    }

    pub async fn get(&self, id: &str) -> Result<ChallengeInstructions> {
        let challenge = self.store.get(id).await?;
        Ok(self.instructions(&challenge))
    }

    /// Live TXT lookup; requires at least one record exactly equal to the
    /// expected value. Idempotent — a verified challenge verifies again
    /// without touching DNS.
    pub async fn verify(&self, id: &str) -> Result<ChallengeInstructions> {
        let challenge = self.store.get(id).await?;
        if challenge.verified {
            return Ok(self.instructions(&challenge));
        }
        if challenge.is_expired(Utc::now()) {
            return Err(RegistryError::Expired(format!(
                "challenge {id} window has passed"
            )));
        }

        let host = self.txt_host(&challenge.domain);
        let expected = self.txt_value(&challenge.token);
        let records = self.lookup.lookup_txt(&host).await?;
        debug!(%host, found = records.len(), "challenge txt lookup");

        if !records.iter().any(|r| r == &expected) {
            return Err(RegistryError::VerificationPending(format!(
                "TXT record at {host} not visible yet"
            )));
        }

        self.store.mark_verified(&challenge.id).await?;
        info!(domain = %challenge.domain, id = %challenge.id, "dns challenge verified");
        let refreshed = self.store.get(id).await?;
        Ok(self.instructions(&refreshed))
    }

    /// Activation gate for the domain path.
    pub async fn is_domain_verified(&self, domain: &str) -> Result<bool> {
        let domain = normalize_domain(domain)?;
        self.store.domain_verified(&domain, Utc::now()).await
    }

    /// One sweep of expired, unverified rows.
    pub async fn sweep_once(&self) -> Result<u64> {
        let removed = self.store.sweep_expired(Utc::now()).await?;
        if removed > 0 {
            debug!(removed, "swept expired dns challenges");
        }
        Ok(removed)
    }

    /// Background sweeper loop; runs until the task is aborted.
    pub async fn run_sweeper(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                warn!("challenge sweep failed: {e}");
            }
        }
    }
}

/// Lowercase and syntax-check a DNS domain.
pub fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    if domain.is_empty() || domain.len() > 253 {
        return Err(RegistryError::Validation("invalid domain".into()));
    }
    let valid = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !valid {
        return Err(RegistryError::Validation(format!(
            "invalid domain: {domain}"
        )));
    }
    Ok(domain)
}
