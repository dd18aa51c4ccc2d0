//! Registry error types
//!
//! Every fallible operation in the crate returns [`Result`]. Error kinds map
//! one-to-one onto HTTP statuses at the API boundary; the mapping lives here
//! so handlers never pick status codes ad hoc.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Malformed URI, illegal capability, reserved trust root, bad input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or invalid bearer token / client certificate.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed (scope, role, ownership).
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate natural key or a lost conditional update.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Per-owner registration limit reached.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// DNS TXT record not yet visible to the recursive resolver.
    #[error("verification pending: {0}")]
    VerificationPending(String),

    /// Activation gate: no verified DNS challenge for the owner domain.
    #[error("domain not verified: {0}")]
    DomainNotVerified(String),

    /// Activation gate: owner email address not confirmed.
    #[error("email not verified: {0}")]
    EmailNotVerified(String),

    /// Sub-delegation would exceed the issuer's path-length allotment.
    #[error("path length exceeded: {0}")]
    PathLengthExceeded(String),

    /// CA key material not loaded.
    #[error("issuer not ready")]
    IssuerNotReady,

    /// Peer certificate failed chain or policy verification.
    #[error("peer not trusted: {0}")]
    NotTrusted(String),

    /// Peer registry unreachable or returned a 5xx during fan-out.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Challenge or token window has passed.
    #[error("expired: {0}")]
    Expired(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Stable machine-readable kind, used in JSON error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::VerificationPending(_) => "verification_pending",
            Self::DomainNotVerified(_) => "domain_not_verified",
            Self::EmailNotVerified(_) => "email_not_verified",
            Self::PathLengthExceeded(_) => "path_length_exceeded",
            Self::IssuerNotReady => "issuer_not_ready",
            Self::NotTrusted(_) => "not_trusted",
            Self::Upstream(_) => "upstream_failure",
            Self::Expired(_) => "expired",
            Self::Database(_) => "database_error",
            Self::Certificate(_) => "certificate_error",
            Self::Token(_) => "token_error",
            Self::Dns(_) => "dns_error",
            Self::Ledger(_) => "ledger_error",
            Self::Io(_) => "io_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_)
            | Self::DomainNotVerified(_)
            | Self::EmailNotVerified(_)
            | Self::PathLengthExceeded(_)
            | Self::NotTrusted(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::QuotaExceeded(_) => StatusCode::CONFLICT,
            Self::VerificationPending(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Expired(_) => StatusCode::GONE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::IssuerNotReady => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the local store found nothing, as opposed to a remote peer.
    /// Callers distinguish the two resolve misses only through this source.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// JSON error body returned by every API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
            kind: self.kind().to_string(),
        };
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "request failed: {self}");
        }
        (status, Json(body)).into_response()
    }
}
