//! HTTP API
//!
//! One router serves both listeners: the cleartext port and the mTLS port
//! (which requests, but does not require, client certificates). Bodies are
//! capped at 1 MB, handlers run under the edge timeout, and every source IP
//! passes the token-bucket rate limiter.

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware, Router};
use serde::{Deserialize, Serialize};
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;

use crate::agents::{Agent, AgentService, TrustTier};
use crate::ca::CertificateAuthority;
use crate::config::RegistryConfig;
use crate::dns::DnsChallengeService;
use crate::federation::FederationService;
use crate::ledger::TrustLedger;
use crate::tokens::TokenService;

pub mod auth;
pub mod handlers;
pub mod mtls;
pub mod rate_limiter;

pub use rate_limiter::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RegistryConfig>,
    pub ca: Arc<CertificateAuthority>,
    pub tokens: Arc<TokenService>,
    pub ledger: Arc<TrustLedger>,
    pub agents: Arc<AgentService>,
    pub challenges: Arc<DnsChallengeService>,
    /// Present on root and standalone registries only.
    pub federation: Option<Arc<FederationService>>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Agent row plus its derived name and tier, the shape every agent endpoint
/// returns.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    #[serde(flatten)]
    pub agent: Agent,
    pub uri: String,
    pub trust_tier: TrustTier,
}

impl From<Agent> for AgentResponse {
    fn from(agent: Agent) -> Self {
        let uri = agent.uri();
        let trust_tier = agent.trust_tier();
        Self {
            agent,
            uri,
            trust_tier,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListAgentsQuery {
    pub trust_root: Option<String>,
    pub capability_node: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub trust_root: String,
    #[serde(default)]
    pub cap_node: String,
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StartChallengeBody {
    pub domain: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RevokeBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenExchangeBody {
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
pub struct FederationRegisterBody {
    pub trust_root: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub contact: String,
}

#[derive(Debug, Deserialize)]
pub struct IssueCaBody {
    pub trust_root: String,
    pub max_path_len: u32,
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

pub fn router(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.config.limits.request_timeout_secs);
    let max_body = state.config.limits.max_body_bytes;

    Router::new()
        .route("/healthz", get(handlers::health))
        // Agents
        .route(
            "/api/v1/agents",
            post(handlers::register_agent).get(handlers::list_agents),
        )
        .route(
            "/api/v1/agents/:id",
            get(handlers::get_agent)
                .patch(handlers::update_agent)
                .delete(handlers::delete_agent),
        )
        .route("/api/v1/agents/:id/activate", post(handlers::activate_agent))
        .route("/api/v1/agents/:id/revoke", post(handlers::revoke_agent))
        .route("/api/v1/agents/:id/card", get(handlers::agent_card))
        // Resolution
        .route("/api/v1/resolve", get(handlers::resolve))
        // DNS challenges
        .route("/api/v1/dns/challenge", post(handlers::start_challenge))
        .route("/api/v1/dns/challenge/:id", get(handlers::get_challenge))
        .route(
            "/api/v1/dns/challenge/:id/verify",
            post(handlers::verify_challenge),
        )
        // Tokens and discovery documents
        .route("/api/v1/token", post(handlers::exchange_token))
        .route(
            "/.well-known/openid-configuration",
            get(handlers::oidc_discovery),
        )
        .route("/.well-known/jwks.json", get(handlers::jwks))
        // Ledger inspection
        .route("/api/v1/ledger", get(handlers::ledger_list))
        .route("/api/v1/ledger/verify", get(handlers::ledger_verify))
        .route("/api/v1/ledger/entries/:idx", get(handlers::ledger_entry))
        // Federation (root only)
        .route(
            "/api/v1/federation/register",
            post(handlers::federation_register),
        )
        .route(
            "/api/v1/federation/issue-ca",
            post(handlers::federation_issue_ca),
        )
        .route(
            "/api/v1/federation/registries",
            get(handlers::federation_list),
        )
        .route(
            "/api/v1/federation/registries/:id/approve",
            post(handlers::federation_approve),
        )
        .route(
            "/api/v1/federation/registries/:id/suspend",
            post(handlers::federation_suspend),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limiter::limit_middleware,
        ))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_: tower::BoxError| async {
                    StatusCode::REQUEST_TIMEOUT
                }))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}
