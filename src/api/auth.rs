//! Bearer authentication helpers
//!
//! Session tokens gate the mutating agent endpoints: owners may patch and
//! revoke their own agents, admins may do anything including delete. Minted
//! by the social-login flow, which is outside this crate.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use crate::agents::Agent;
use crate::errors::{RegistryError, Result};
use crate::tokens::SessionClaims;

use super::AppState;

pub const ROLE_ADMIN: &str = "admin";

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| RegistryError::Unauthorized("missing bearer token".into()))
}

/// Verified session claims from the `Authorization` header.
pub fn session(state: &AppState, headers: &HeaderMap) -> Result<SessionClaims> {
    let token = bearer_token(headers)?;
    state.tokens.verify_session_token(token)
}

/// Admin-only routes.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<SessionClaims> {
    let claims = session(state, headers)?;
    if claims.role != ROLE_ADMIN {
        return Err(RegistryError::Forbidden("admin role required".into()));
    }
    Ok(claims)
}

/// Owner-or-admin routes: the session subject must own the agent unless it
/// carries the admin role.
pub fn require_owner_or_admin(
    state: &AppState,
    headers: &HeaderMap,
    agent: &Agent,
) -> Result<SessionClaims> {
    let claims = session(state, headers)?;
    if claims.role == ROLE_ADMIN {
        return Ok(claims);
    }
    let owns = agent.owner_user.as_deref() == Some(claims.sub.as_str());
    if !owns {
        return Err(RegistryError::Forbidden(
            "session does not own this agent".into(),
        ));
    }
    Ok(claims)
}
