//! Shared test fixtures: stub collaborator seams, a pre-generated CA (RSA
//! keygen is too slow to repeat per test), and helpers to boot and serve a
//! registry on an ephemeral port.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use nap_registry::agents::{EmailVerifier, RegisterRequest, ThreatScorer};
use nap_registry::ca::CertificateAuthority;
use nap_registry::config::{CaConfig, RegistryRole};
use nap_registry::dns::TxtLookup;
use nap_registry::errors::Result;
use nap_registry::{Registry, RegistryConfig};

/// Fixture recursive resolver backed by a mutable TXT table.
pub struct StubTxt {
    records: Mutex<HashMap<String, Vec<String>>>,
}

impl StubTxt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
        })
    }

    pub async fn set(&self, name: &str, values: Vec<String>) {
        self.records.lock().await.insert(name.to_string(), values);
    }
}

#[async_trait]
impl TxtLookup for StubTxt {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .records
            .lock()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Fixture email verifier: owners are unverified until marked.
pub struct StubEmails {
    verified: Mutex<HashSet<String>>,
}

impl StubEmails {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            verified: Mutex::new(HashSet::new()),
        })
    }

    pub async fn mark_verified(&self, owner: &str) {
        self.verified.lock().await.insert(owner.to_string());
    }
}

#[async_trait]
impl EmailVerifier for StubEmails {
    async fn is_verified(&self, owner_user: &str) -> Result<bool> {
        Ok(self.verified.lock().await.contains(owner_user))
    }
}

/// Threat scorer with a fixed score for every request.
pub struct FixedScore(pub u8);

#[async_trait]
impl ThreatScorer for FixedScore {
    async fn score(&self, _request: &RegisterRequest) -> Result<u8> {
        Ok(self.0)
    }
}

/// One RSA-4096 root for the whole test binary; generating it per test would
/// dominate the run time.
pub fn shared_ca_dir() -> PathBuf {
    static CA: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    CA.get_or_init(|| {
        let dir = TempDir::new().expect("ca tempdir");
        let path = dir.path().to_path_buf();
        CertificateAuthority::bootstrap_root(&CaConfig {
            dir: path.clone(),
            ..Default::default()
        })
        .expect("bootstrap shared test CA");
        (dir, path)
    })
    .1
    .clone()
}

/// Config pointing at the shared CA and a per-test SQLite file, with limits
/// relaxed so debug-mode crypto does not trip the edge timeout.
pub fn test_config(dir: &Path, db_name: &str) -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.role = RegistryRole::Standalone;
    config.registry_url = "https://registry.test".to_string();
    config.own_domain = "registry.test".to_string();
    config.database_url = format!("sqlite://{}/{db_name}?mode=rwc", dir.display());
    config.ca.dir = shared_ca_dir();
    config.limits.request_timeout_secs = 120;
    config.limits.rate_limit_per_minute = 60_000;
    config.limits.rate_limit_burst = 10_000;
    config
}

pub struct TestRegistry {
    pub registry: Registry,
    pub txt: Arc<StubTxt>,
    pub emails: Arc<StubEmails>,
    pub dir: TempDir,
}

pub async fn boot(role: RegistryRole) -> TestRegistry {
    boot_with(role, |_| {}).await
}

pub async fn boot_with(
    role: RegistryRole,
    tweak: impl FnOnce(&mut RegistryConfig),
) -> TestRegistry {
    let dir = TempDir::new().expect("tempdir");
    let mut config = test_config(dir.path(), "registry.db");
    config.role = role;
    tweak(&mut config);

    let txt = StubTxt::new();
    let emails = StubEmails::new();
    let registry = Registry::bootstrap(
        config,
        txt.clone() as Arc<dyn TxtLookup>,
        emails.clone() as Arc<dyn EmailVerifier>,
        None,
    )
    .await
    .expect("bootstrap registry");

    TestRegistry {
        registry,
        txt,
        emails,
        dir,
    }
}

/// Serve the registry's router on an ephemeral local port.
pub async fn serve(registry: &Registry) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let app = registry.router();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("test server");
    });
    addr
}

pub fn base_url(addr: SocketAddr) -> String {
    format!("http://{addr}")
}

/// Count SAN entries of a PEM leaf certificate: (uri, dns, email).
pub fn san_counts(cert_pem: &str) -> (usize, usize, usize, Vec<String>) {
    use x509_parser::prelude::*;
    let pem = ::pem::parse(cert_pem).expect("parse pem");
    let der = pem.into_contents();
    let (_, cert) = parse_x509_certificate(&der).expect("parse cert");
    let san = cert
        .subject_alternative_name()
        .expect("san extension")
        .expect("san present");
    let (mut uris, mut dns, mut emails) = (0, 0, 0);
    let mut uri_values = Vec::new();
    for name in &san.value.general_names {
        match name {
            GeneralName::URI(u) => {
                uris += 1;
                uri_values.push(u.to_string());
            }
            GeneralName::DNSName(_) => dns += 1,
            GeneralName::RFC822Name(_) => emails += 1,
            _ => {}
        }
    }
    (uris, dns, emails, uri_values)
}
