//! NAP registry
//!
//! Federated identity and discovery registry for autonomous agents. Each
//! agent gets a globally resolvable `agent://<trust-root>/<category>/<id>`
//! name backed by a verifiable principal (DNS-controlled domain or verified
//! email), an X.509 leaf certificate, and a signed endorsement token; the
//! resolution API translates names to live endpoints across a federation of
//! registries anchored in one PKI.
//!
//! Subsystems, leaves first: [`ca`] (certificate authority), [`tokens`] and
//! [`ledger`], [`dns`] (DNS-01 challenges and discovery), [`agents`]
//! (lifecycle state machine), [`federation`] (peer table and remote
//! resolver), [`api`] (HTTP surface). [`Registry`] wires them together for
//! the server binary and for tests.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{info, warn};

pub mod agents;
pub mod api;
pub mod ca;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod errors;
pub mod federation;
pub mod ledger;
pub mod storage;
pub mod tokens;

pub use config::{RegistryConfig, RegistryRole};
pub use errors::{RegistryError, Result};

/// Trust root owned by the registry itself; hosted agents live under it and
/// nobody may register it.
pub const HOSTED_TRUST_ROOT: &str = "nap";

use agents::{AgentService, EmailVerifier, ThreatScorer};
use api::{AppState, RateLimiter};
use ca::CertificateAuthority;
use dns::{DnsChallengeService, TxtLookup};
use federation::{FederationService, RemoteResolver};
use ledger::TrustLedger;
use storage::{AgentStore, ChallengeStore, FederationStore};
use tokens::TokenService;

/// A fully wired registry instance.
pub struct Registry {
    pub config: Arc<RegistryConfig>,
    pub pool: SqlitePool,
    pub ca: Arc<CertificateAuthority>,
    pub tokens: Arc<TokenService>,
    pub ledger: Arc<TrustLedger>,
    pub challenges: Arc<DnsChallengeService>,
    pub agents: Arc<AgentService>,
    pub federation: Option<Arc<FederationService>>,
    pub resolver: Arc<RemoteResolver>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl Registry {
    /// Build every subsystem against the configured database and CA
    /// directory. The collaborator seams (recursive DNS, email verification,
    /// threat screening) are injected so servers and tests pick their own.
    pub async fn bootstrap(
        config: RegistryConfig,
        txt_lookup: Arc<dyn TxtLookup>,
        email_verifier: Arc<dyn EmailVerifier>,
        threat_scorer: Option<Arc<dyn ThreatScorer>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = storage::connect(&config.database_url).await?;

        // CA bootstrap may generate an RSA-4096 root; keep it off the
        // async workers.
        let ca = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || load_ca(&config))
                .await
                .map_err(|e| RegistryError::Certificate(format!("ca bootstrap task: {e}")))??
        };
        let ca = Arc::new(ca);

        let tokens = Arc::new(TokenService::new(
            &ca,
            config.tokens.clone(),
            config.registry_url.clone(),
        )?);

        let ledger = Arc::new(TrustLedger::open(pool.clone()).await?);
        match ledger.verify().await {
            Ok(status) if status.is_valid() => {}
            Ok(ledger::ChainStatus::Mismatch { index }) => {
                // Read-only endpoints stay available; integrity state is
                // inspectable through the verify endpoint.
                warn!(index, "ledger chain mismatch detected at boot");
            }
            Ok(_) => {}
            Err(e) => warn!("ledger verification failed at boot: {e}"),
        }

        let challenges = Arc::new(DnsChallengeService::new(
            ChallengeStore::new(pool.clone()),
            txt_lookup.clone(),
            config.dns.clone(),
        ));

        let federation_store = FederationStore::new(pool.clone());
        let resolver = Arc::new(RemoteResolver::new(
            federation_store.clone(),
            txt_lookup,
            &config,
        )?);
        let federation = config.role.has_federation().then(|| {
            Arc::new(FederationService::new(
                federation_store,
                ca.clone(),
                ledger.clone(),
                config.clone(),
            ))
        });

        let agents = Arc::new(AgentService::new(
            AgentStore::new(pool.clone()),
            ca.clone(),
            tokens.clone(),
            ledger.clone(),
            challenges.clone(),
            email_verifier,
            threat_scorer,
            Some(resolver.clone()),
            config.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.limits.rate_limit_per_minute,
            config.limits.rate_limit_burst,
        ));

        info!(role = ?config.role, "registry bootstrapped");
        Ok(Self {
            config,
            pool,
            ca,
            tokens,
            ledger,
            challenges,
            agents,
            federation,
            resolver,
            rate_limiter,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            ca: self.ca.clone(),
            tokens: self.tokens.clone(),
            ledger: self.ledger.clone(),
            agents: self.agents.clone(),
            challenges: self.challenges.clone(),
            federation: self.federation.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }

    pub fn router(&self) -> axum::Router {
        api::router(self.app_state())
    }
}

/// Root/standalone roles load or generate local root material; the federated
/// role loads operator-supplied intermediate material plus the pinned root
/// anchor fetched by the binary before bootstrap.
fn load_ca(config: &RegistryConfig) -> Result<CertificateAuthority> {
    match config.role {
        RegistryRole::Root | RegistryRole::Standalone => {
            CertificateAuthority::bootstrap_root(&config.ca)
        }
        RegistryRole::Federated => {
            let cert_path = config.ca.intermediate_cert_path.as_ref().ok_or_else(|| {
                RegistryError::Validation("missing intermediate_cert_path".into())
            })?;
            let key_path = config.ca.intermediate_key_path.as_ref().ok_or_else(|| {
                RegistryError::Validation("missing intermediate_key_path".into())
            })?;
            let anchor_path = config.ca.dir.join("root-anchor.pem");
            let root_pem = std::fs::read_to_string(&anchor_path).map_err(|e| {
                RegistryError::Validation(format!(
                    "root anchor not pinned at {}: {e}; fetch it from root_anchor_url first",
                    anchor_path.display()
                ))
            })?;
            CertificateAuthority::load_intermediate(cert_path, key_path, root_pem)
        }
    }
}

/// Fetch and pin the root anchor PEM for a federated registry. Called by the
/// server binary before [`Registry::bootstrap`]; the PEM is stored under the
/// CA directory and reused on later boots.
pub async fn pin_root_anchor(config: &RegistryConfig) -> Result<()> {
    let Some(url) = &config.ca.root_anchor_url else {
        return Ok(());
    };
    let anchor_path = config.ca.dir.join("root-anchor.pem");
    if anchor_path.exists() {
        return Ok(());
    }
    if !url.starts_with("https://") {
        return Err(RegistryError::Validation(
            "root_anchor_url must be https".into(),
        ));
    }
    let pem = reqwest::get(url)
        .await
        .map_err(|e| RegistryError::Upstream(format!("fetch root anchor: {e}")))?
        .error_for_status()
        .map_err(|e| RegistryError::Upstream(format!("fetch root anchor: {e}")))?
        .text()
        .await
        .map_err(|e| RegistryError::Upstream(format!("read root anchor: {e}")))?;
    std::fs::create_dir_all(&config.ca.dir)?;
    std::fs::write(&anchor_path, pem)?;
    info!(%url, path = %anchor_path.display(), "root anchor pinned");
    Ok(())
}
