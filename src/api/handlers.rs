//! HTTP endpoint handlers
//!
//! Thin adapters between the router and the domain services: extract, call,
//! shape the response. Status-code selection lives on [`RegistryError`], not
//! here.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::Extension;
use serde_json::json;
use tracing::debug;

use crate::agents::{RegisterRequest, ResolvedAgent};
use crate::dns::ChallengeInstructions;
use crate::errors::{RegistryError, Result};
use crate::ledger::LedgerEntry;
use crate::storage::agents::{AgentFilter, AgentPatch};
use crate::storage::federation::RegisteredRegistry;

use super::auth;
use super::mtls::PeerCertificates;
use super::{
    AgentResponse, AppState, FederationRegisterBody, IssueCaBody, LedgerQuery, ListAgentsQuery,
    ResolveQuery, RevokeBody, StartChallengeBody, TokenExchangeBody, TokenResponse,
};

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "role": state.config.role,
    }))
}

// --- Agents ---

pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AgentResponse>)> {
    let agent = state.agents.register(request).await?;
    Ok((StatusCode::CREATED, Json(agent.into())))
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<Vec<AgentResponse>>> {
    let status = query
        .status
        .as_deref()
        .map(crate::agents::AgentStatus::parse)
        .transpose()?;
    let filter = AgentFilter {
        trust_root: query.trust_root,
        capability_node: query.capability_node,
        status,
        limit: query.limit,
        offset: query.offset,
    };
    let agents = state.agents.list(filter).await?;
    Ok(Json(agents.into_iter().map(AgentResponse::from).collect()))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentResponse>> {
    let agent = state.agents.get(&id).await?;
    Ok(Json(agent.into()))
}

pub async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<AgentPatch>,
) -> Result<Json<AgentResponse>> {
    let agent = state.agents.get(&id).await?;
    auth::require_owner_or_admin(&state, &headers, &agent)?;
    let updated = state.agents.update(&id, patch).await?;
    Ok(Json(updated.into()))
}

pub async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    auth::require_admin(&state, &headers)?;
    state.agents.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn activate_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::agents::ActivationBundle>> {
    let bundle = state.agents.activate(&id).await?;
    Ok(Json(bundle))
}

pub async fn revoke_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<RevokeBody>>,
) -> Result<Json<AgentResponse>> {
    let agent = state.agents.get(&id).await?;
    auth::require_owner_or_admin(&state, &headers, &agent)?;
    let reason = body.as_ref().and_then(|b| b.reason.as_deref());
    let revoked = state.agents.revoke(&id, reason).await?;
    Ok(Json(revoked.into()))
}

pub async fn agent_card(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    Ok(Json(state.agents.agent_card(&id).await?))
}

// --- Resolution ---

pub async fn resolve(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ResolvedAgent>> {
    debug!(trust_root = %query.trust_root, agent_id = %query.agent_id, "resolve request");
    let resolved = state
        .agents
        .resolve(&query.trust_root, &query.cap_node, &query.agent_id)
        .await?;
    Ok(Json(resolved))
}

// --- DNS challenges ---

pub async fn start_challenge(
    State(state): State<AppState>,
    Json(body): Json<StartChallengeBody>,
) -> Result<(StatusCode, Json<ChallengeInstructions>)> {
    let challenge = state.challenges.start(&body.domain).await?;
    Ok((StatusCode::CREATED, Json(challenge)))
}

pub async fn get_challenge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChallengeInstructions>> {
    Ok(Json(state.challenges.get(&id).await?))
}

pub async fn verify_challenge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChallengeInstructions>> {
    Ok(Json(state.challenges.verify(&id).await?))
}

// --- Tokens and discovery documents ---

/// Exchange an mTLS client certificate for a task token. Only meaningful on
/// the mTLS listener; elsewhere no peer certificate extension is present.
pub async fn exchange_token(
    State(state): State<AppState>,
    peer: Option<Extension<PeerCertificates>>,
    body: Option<Json<TokenExchangeBody>>,
) -> Result<Json<TokenResponse>> {
    let leaf = peer
        .as_ref()
        .and_then(|Extension(certs)| certs.leaf())
        .ok_or_else(|| RegistryError::Unauthorized("client certificate required".into()))?;

    let identity = state.ca.verify_peer(leaf)?;
    let agent_uri = identity.agent_uri.ok_or_else(|| {
        RegistryError::Forbidden("certificate carries no agent URI".into())
    })?;

    let scopes = body
        .and_then(|Json(b)| b.scopes)
        .unwrap_or_else(|| vec!["resolve".to_string()]);
    let token = state.tokens.issue_task_token(&agent_uri, scopes, None)?;
    Ok(Json(TokenResponse {
        token,
        token_type: "Bearer",
        expires_in: state.config.tokens.task_ttl_secs,
    }))
}

pub async fn oidc_discovery(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.tokens.oidc_discovery())
}

pub async fn jwks(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.tokens.jwks())
}

// --- Ledger inspection ---

pub async fn ledger_list(
    State(state): State<AppState>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Vec<LedgerEntry>>> {
    Ok(Json(state.ledger.list(query.limit, query.offset).await?))
}

pub async fn ledger_verify(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let status = state.ledger.verify().await?;
    let root = state.ledger.root().await?;
    Ok(Json(json!({ "chain": status, "root": root })))
}

pub async fn ledger_entry(
    State(state): State<AppState>,
    Path(index): Path<i64>,
) -> Result<Json<LedgerEntry>> {
    Ok(Json(state.ledger.get(index).await?))
}

// --- Federation (root only) ---

fn federation(state: &AppState) -> Result<&crate::federation::FederationService> {
    state
        .federation
        .as_deref()
        .ok_or_else(|| RegistryError::Forbidden("federation requires a root registry".into()))
}

pub async fn federation_register(
    State(state): State<AppState>,
    Json(body): Json<FederationRegisterBody>,
) -> Result<(StatusCode, Json<RegisteredRegistry>)> {
    let registry = federation(&state)?
        .register(&body.trust_root, &body.endpoint_url, &body.contact)
        .await?;
    Ok((StatusCode::CREATED, Json(registry)))
}

pub async fn federation_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<RegisteredRegistry>>> {
    auth::require_admin(&state, &headers)?;
    Ok(Json(federation(&state)?.list().await?))
}

pub async fn federation_approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RegisteredRegistry>> {
    auth::require_admin(&state, &headers)?;
    Ok(Json(federation(&state)?.approve(&id).await?))
}

pub async fn federation_suspend(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RegisteredRegistry>> {
    auth::require_admin(&state, &headers)?;
    Ok(Json(federation(&state)?.suspend(&id).await?))
}

pub async fn federation_issue_ca(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IssueCaBody>,
) -> Result<Json<serde_json::Value>> {
    auth::require_admin(&state, &headers)?;
    let (registry, issued) = federation(&state)?
        .issue_intermediate_ca(&body.trust_root, body.max_path_len)
        .await?;
    // The private key appears in this response and nowhere else.
    Ok(Json(json!({
        "registry": registry,
        "cert_pem": issued.cert_pem,
        "key_pem": issued.key_pem,
        "serial": issued.serial,
        "not_after": issued.not_after,
    })))
}
