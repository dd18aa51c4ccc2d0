//! NAP registry server
//!
//! Boots the full stack: CA material, SQLite storage, trust ledger, DNS
//! challenge service, agent lifecycle, federation, and the HTTP surface on a
//! cleartext port plus an optional mTLS port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{info, warn};

use nap_registry::agents::PermissiveEmailVerifier;
use nap_registry::api::mtls::{build_server_config, MtlsAcceptor};
use nap_registry::dns::SystemTxtLookup;
use nap_registry::{pin_root_anchor, Registry, RegistryConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = Command::new("nap-registry")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Federated identity and discovery registry for autonomous agents")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (TOML)"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Cleartext listener address, e.g. [::]:8440"),
        )
        .arg(
            Arg::new("mtls-bind")
                .long("mtls-bind")
                .value_name("ADDR")
                .help("mTLS listener address, e.g. [::]:8443"),
        )
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("URL")
                .help("SQLite database URL"),
        )
        .get_matches();

    let mut config = RegistryConfig::load(matches.get_one::<String>("config").map(String::as_str))
        .context("failed to load configuration")?;
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind_addr = bind.parse().context("invalid --bind address")?;
    }
    if let Some(bind) = matches.get_one::<String>("mtls-bind") {
        config.mtls_bind_addr = Some(bind.parse().context("invalid --mtls-bind address")?);
    }
    if let Some(db) = matches.get_one::<String>("database") {
        config.database_url = db.clone();
    }

    info!(role = ?config.role, bind = %config.bind_addr, "starting nap-registry");

    pin_root_anchor(&config)
        .await
        .context("failed to pin root anchor")?;

    let txt_lookup = Arc::new(
        SystemTxtLookup::new(Duration::from_secs(config.dns.lookup_timeout_secs))
            .context("failed to initialise system resolver")?,
    );
    let registry = Registry::bootstrap(
        config,
        txt_lookup,
        Arc::new(PermissiveEmailVerifier),
        None,
    )
    .await
    .context("failed to bootstrap registry")?;

    // Background workers: challenge GC and agent expiry.
    let sweeper = tokio::spawn(registry.challenges.clone().run_sweeper());
    let expirer = tokio::spawn(
        registry
            .agents
            .clone()
            .run_expiry_sweeper(EXPIRY_SWEEP_INTERVAL),
    );

    let router = registry.router();
    let handle = axum_server::Handle::new();

    let http_server = {
        let router = router.clone();
        let handle = handle.clone();
        let addr = registry.config.bind_addr;
        tokio::spawn(async move {
            info!(%addr, "http listener up");
            axum_server::bind(addr)
                .handle(handle)
                .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                .await
        })
    };

    let mtls_server = match registry.config.mtls_bind_addr {
        Some(addr) => {
            let server_cert = {
                let ca = registry.ca.clone();
                let dns_names = vec![registry.config.own_domain.clone()];
                let validity_days = registry.config.ca.leaf_validity_days;
                tokio::task::spawn_blocking(move || {
                    ca.issue_server(&dns_names, &[], validity_days)
                })
                .await
                .context("server certificate task")?
                .context("failed to issue server certificate")?
            };
            let tls_config = build_server_config(&registry.ca, &server_cert)
                .context("failed to build mTLS config")?;
            let router = router.clone();
            let handle = handle.clone();
            Some(tokio::spawn(async move {
                info!(%addr, "mtls listener up");
                axum_server::bind(addr)
                    .handle(handle)
                    .acceptor(MtlsAcceptor::new(tls_config))
                    .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }))
        }
        None => None,
    };

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

    if let Err(e) = http_server.await.context("http listener task")? {
        warn!("http listener exited with error: {e}");
    }
    if let Some(server) = mtls_server {
        if let Err(e) = server.await.context("mtls listener task")? {
            warn!("mtls listener exited with error: {e}");
        }
    }
    sweeper.abort();
    expirer.abort();
    info!("nap-registry stopped");
    Ok(())
}
