//! Federation service
//!
//! Maintains the table of peer registries and, when this instance holds root
//! CA material, delegates issuing authority by signing intermediate CA
//! certificates. The returned private key crosses the boundary once; only the
//! certificate PEM is persisted.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::ca::{CaMode, CertificateAuthority, IssuedCertificate};
use crate::config::RegistryConfig;
use crate::dns::normalize_domain;
use crate::errors::{RegistryError, Result};
use crate::ledger::TrustLedger;
use crate::storage::federation::{FederationStatus, RegisteredRegistry};
use crate::storage::FederationStore;

pub mod resolver;

pub use resolver::RemoteResolver;

pub struct FederationService {
    store: FederationStore,
    ca: Arc<CertificateAuthority>,
    ledger: Arc<TrustLedger>,
    config: Arc<RegistryConfig>,
}

impl FederationService {
    pub fn new(
        store: FederationStore,
        ca: Arc<CertificateAuthority>,
        ledger: Arc<TrustLedger>,
        config: Arc<RegistryConfig>,
    ) -> Self {
        Self {
            store,
            ca,
            ledger,
            config,
        }
    }

    /// Enrol a peer operator as `pending`.
    pub async fn register(
        &self,
        trust_root: &str,
        endpoint_url: &str,
        contact: &str,
    ) -> Result<RegisteredRegistry> {
        let trust_root = normalize_domain(trust_root)?;
        if self
            .config
            .reserved_trust_roots()
            .iter()
            .any(|r| r.eq_ignore_ascii_case(&trust_root))
        {
            return Err(RegistryError::Validation(format!(
                "trust root {trust_root} is reserved"
            )));
        }
        if !endpoint_url.starts_with("https://") {
            return Err(RegistryError::Validation(
                "endpoint_url must be an https URL".into(),
            ));
        }

        let registry = self.store.insert(&trust_root, endpoint_url, contact).await?;
        info!(trust_root = %registry.trust_root, "federated registry registered");
        self.ledger
            .record(
                "",
                "federation_register",
                contact,
                json!({ "trust_root": trust_root, "endpoint_url": endpoint_url }),
            )
            .await;
        Ok(registry)
    }

    pub async fn approve(&self, id: &str) -> Result<RegisteredRegistry> {
        let registry = self.store.get(id).await?;
        self.store
            .set_status(&registry.id, FederationStatus::Active)
            .await?;
        info!(trust_root = %registry.trust_root, "federated registry approved");
        self.ledger
            .record(
                "",
                "federation_approve",
                "operator",
                json!({ "trust_root": registry.trust_root }),
            )
            .await;
        self.store.get(id).await
    }

    /// Suspended registries drop out of resolution immediately.
    pub async fn suspend(&self, id: &str) -> Result<RegisteredRegistry> {
        let registry = self.store.get(id).await?;
        self.store
            .set_status(&registry.id, FederationStatus::Suspended)
            .await?;
        info!(trust_root = %registry.trust_root, "federated registry suspended");
        self.ledger
            .record(
                "",
                "federation_suspend",
                "operator",
                json!({ "trust_root": registry.trust_root }),
            )
            .await;
        self.store.get(id).await
    }

    pub async fn get(&self, id: &str) -> Result<RegisteredRegistry> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<RegisteredRegistry>> {
        self.store.list().await
    }

    /// Delegate issuing authority to an approved peer. Requires root CA
    /// material; the target must be `active`; `max_path_len` is bounded by
    /// configuration and by our own certificate's allotment.
    pub async fn issue_intermediate_ca(
        &self,
        trust_root: &str,
        max_path_len: u32,
    ) -> Result<(RegisteredRegistry, IssuedCertificate)> {
        if self.ca.mode() != CaMode::Root {
            return Err(RegistryError::Forbidden(
                "only a root registry can delegate CA authority".into(),
            ));
        }
        if max_path_len > self.config.ca.max_delegation_path_len {
            return Err(RegistryError::Validation(format!(
                "max_path_len {} exceeds configured maximum {}",
                max_path_len, self.config.ca.max_delegation_path_len
            )));
        }
        let trust_root = normalize_domain(trust_root)?;
        let registry = self
            .store
            .get_by_trust_root(&trust_root)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("registry for {trust_root}")))?;
        if registry.status != FederationStatus::Active {
            return Err(RegistryError::Conflict(format!(
                "registry {trust_root} is not active"
            )));
        }

        let issued = {
            let ca = self.ca.clone();
            let org = trust_root.clone();
            let validity_days = self.config.ca.intermediate_validity_days;
            tokio::task::spawn_blocking(move || {
                ca.issue_subordinate(&org, validity_days, max_path_len)
            })
            .await
            .map_err(|e| RegistryError::Certificate(format!("issuance task: {e}")))??
        };

        self.store
            .set_intermediate(&registry.id, &issued.cert_pem, max_path_len as i64)
            .await?;
        info!(trust_root = %trust_root, max_path_len, serial = %issued.serial, "intermediate CA delegated");
        self.ledger
            .record(
                "",
                "federation_issue_ca",
                "operator",
                json!({
                    "trust_root": trust_root,
                    "max_path_len": max_path_len,
                    "cert_serial": issued.serial,
                }),
            )
            .await;

        let registry = self.store.get(&registry.id).await?;
        Ok((registry, issued))
    }
}
