//! Remote resolver
//!
//! Cascading discovery for a foreign trust root: local federation table ->
//! DNS TXT discovery -> configured root fallback. Once an endpoint is chosen
//! the resolver issues a single bounded `GET /api/v1/resolve` against it and
//! never follows a second hop — the owning registry is expected to hold the
//! agent locally.
//!
//! Admission rule: when a federation service is attached (root and standalone
//! roles), a DNS-discovered URL is honoured only for trust roots that are
//! `active` in the federation table. A domain operator cannot enrol as a
//! trust root by publishing TXT records alone.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use std::sync::Arc;

use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agents::ResolvedAgent;
use crate::config::RegistryConfig;
use crate::dns::{discovery, TxtLookup};
use crate::errors::{RegistryError, Result};
use crate::storage::FederationStore;

pub struct RemoteResolver {
    federation: FederationStore,
    lookup: Arc<dyn TxtLookup>,
    http: reqwest::Client,
    /// Root/standalone roles cross-reference DNS discoveries with the table.
    enforce_admission: bool,
    root_fallback: Option<String>,
    cache: Mutex<HashMap<String, (Instant, String)>>,
    cache_ttl: Duration,
    max_body_bytes: usize,
}

impl RemoteResolver {
    pub fn new(
        federation: FederationStore,
        lookup: Arc<dyn TxtLookup>,
        config: &RegistryConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.federation.resolve_timeout_secs))
            .build()
            .map_err(|e| RegistryError::Upstream(format!("http client: {e}")))?;
        Ok(Self {
            federation,
            lookup,
            http,
            enforce_admission: config.role.has_federation(),
            root_fallback: config.federation.root_registry_url.clone(),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(config.federation.resolve_cache_ttl_secs),
            max_body_bytes: config.limits.max_body_bytes,
        })
    }

    pub async fn resolve(
        &self,
        trust_root: &str,
        cap_node: &str,
        agent_id: &str,
    ) -> Result<ResolvedAgent> {
        let endpoint = self
            .discover_endpoint(trust_root)
            .await?
            .ok_or_else(|| {
                RegistryError::NotFound(format!("no registry known for trust root {trust_root}"))
            })?;
        self.fetch_agent(&endpoint, trust_root, cap_node, agent_id)
            .await
    }

    /// The cascade. Returns the endpoint URL to query, if any.
    pub async fn discover_endpoint(&self, trust_root: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cached(trust_root).await {
            return Ok(Some(cached));
        }

        // 1. Federation table.
        if let Some(registry) = self.federation.active_by_trust_root(trust_root).await? {
            debug!(trust_root, endpoint = %registry.endpoint_url, "resolved via federation table");
            self.remember(trust_root, &registry.endpoint_url).await;
            return Ok(Some(registry.endpoint_url));
        }

        // 2. DNS TXT discovery.
        if let Some(url) = discovery::discover_registry_url(&self.lookup, trust_root).await? {
            if self.enforce_admission {
                // The cross-reference requires an active table entry, and
                // step 1 just established there is none.
                warn!(trust_root, url = %url, "dns-discovered registry rejected by admission control");
            } else {
                debug!(trust_root, url = %url, "resolved via dns discovery");
                self.remember(trust_root, &url).await;
                return Ok(Some(url));
            }
        }

        // 3. Root fallback.
        Ok(self.root_fallback.clone())
    }

    async fn cached(&self, trust_root: &str) -> Option<String> {
        let cache = self.cache.lock().await;
        cache
            .get(trust_root)
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, endpoint)| endpoint.clone())
    }

    async fn remember(&self, trust_root: &str, endpoint: &str) {
        self.cache
            .lock()
            .await
            .insert(trust_root.to_string(), (Instant::now(), endpoint.to_string()));
    }

    /// One bounded hop against the chosen peer.
    async fn fetch_agent(
        &self,
        endpoint: &str,
        trust_root: &str,
        cap_node: &str,
        agent_id: &str,
    ) -> Result<ResolvedAgent> {
        let url = format!("{}/api/v1/resolve", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[
                ("trust_root", trust_root),
                ("cap_node", cap_node),
                ("agent_id", agent_id),
            ])
            .send()
            .await
            .map_err(|e| RegistryError::Upstream(format!("peer {endpoint}: {e}")))?;

        match response.status() {
            StatusCode::OK => {
                let body = self.read_capped(response, endpoint).await?;
                serde_json::from_slice(&body).map_err(|e| {
                    RegistryError::Upstream(format!("peer {endpoint} returned malformed record: {e}"))
                })
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(format!(
                "agent {agent_id} not found at peer registry {endpoint}"
            ))),
            status => Err(RegistryError::Upstream(format!(
                "peer {endpoint} answered {status}"
            ))),
        }
    }

    async fn read_capped(&self, mut response: reqwest::Response, endpoint: &str) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| RegistryError::Upstream(format!("peer {endpoint}: {e}")))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(RegistryError::Upstream(format!(
                    "peer {endpoint} response exceeds {} bytes",
                    self.max_body_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}
