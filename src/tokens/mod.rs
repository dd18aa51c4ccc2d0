//! Token service
//!
//! Four JWT families, all RS256-signed with the CA key so a single JWKS
//! endpoint serves every verifier:
//!
//! | family      | subject   | default TTL | purpose                        |
//! |-------------|-----------|-------------|--------------------------------|
//! | task        | agent URI | 1 hour      | agent-to-agent bearer auth     |
//! | session     | user id   | 24 hours    | web/API user auth              |
//! | endorsement | agent URI | 365 days    | signed assertion in agent card |
//! | oauth-state | provider  | 10 minutes  | CSRF token for social login    |
//!
//! Verification checks expiry (zero leeway), issuer, algorithm and the `typ`
//! family discriminator; it never touches network or disk. Endorsements have
//! no revocation list — they are assertions bounded by `exp`, and a verifier
//! needing current status must resolve the agent afresh.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ca::CertificateAuthority;
use crate::config::TokenConfig;
use crate::crypto;
use crate::errors::{RegistryError, Result};

pub const FAMILY_TASK: &str = "task";
pub const FAMILY_SESSION: &str = "session";
pub const FAMILY_ENDORSEMENT: &str = "endorsement";
pub const FAMILY_OAUTH_STATE: &str = "oauth-state";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaims {
    pub iss: String,
    /// Agent URI.
    pub sub: String,
    pub scopes: Vec<String>,
    pub jti: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    /// User id.
    pub sub: String,
    pub email: String,
    pub username: String,
    /// `user` or `admin`.
    pub role: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndorsementClaims {
    pub iss: String,
    /// Agent URI.
    pub sub: String,
    pub trust_tier: String,
    pub cert_serial: String,
    pub registry_url: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthStateClaims {
    pub iss: String,
    /// Provider name.
    pub sub: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    config: TokenConfig,
    registry_url: String,
    /// JWKS key id: SHA-256 over the RSA public components.
    kid: String,
    /// Base64url RSA public components for the JWKS document.
    jwk_n: String,
    jwk_e: String,
}

impl TokenService {
    pub fn new(
        ca: &CertificateAuthority,
        config: TokenConfig,
        registry_url: String,
    ) -> Result<Self> {
        let key_pem = ca.signing_key_pem()?;
        let encoding_key = EncodingKey::from_rsa_pem(key_pem.as_bytes())?;
        let (n, e) = crypto::rsa_public_components(&key_pem)?;
        let jwk_n = URL_SAFE_NO_PAD.encode(&n);
        let jwk_e = URL_SAFE_NO_PAD.encode(&e);
        let decoding_key = DecodingKey::from_rsa_components(&jwk_n, &jwk_e)?;

        let mut hasher = Sha256::new();
        hasher.update(&n);
        hasher.update(&e);
        let kid = hex::encode(&hasher.finalize()[..16]);

        Ok(Self {
            encoding_key,
            decoding_key,
            config,
            registry_url,
            kid,
            jwk_n,
            jwk_e,
        })
    }

    fn sign<C: Serialize>(&self, claims: &C) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        Ok(encode(&header, claims, &self.encoding_key)?)
    }

    fn decode_family<C: DeserializeOwned>(&self, token: &str) -> Result<C> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.config.issuer]);
        // Any verification failure (expiry included) reads as unauthorized at
        // the boundary; only signing failures are internal.
        let data = decode::<C>(token, &self.decoding_key, &validation)
            .map_err(|e| RegistryError::Unauthorized(format!("invalid token: {e}")))?;
        Ok(data.claims)
    }

    /// Clamp a requested TTL to the family ceiling.
    fn ttl(&self, requested: Option<Duration>, cap_secs: i64) -> Duration {
        let cap = Duration::seconds(cap_secs);
        match requested {
            Some(ttl) if ttl < cap => ttl,
            _ => cap,
        }
    }

    pub fn issue_task_token(
        &self,
        agent_uri: &str,
        scopes: Vec<String>,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let now = Utc::now();
        let exp = now + self.ttl(ttl, self.config.task_ttl_secs);
        self.sign(&TaskClaims {
            iss: self.config.issuer.clone(),
            sub: agent_uri.to_string(),
            scopes,
            jti: Uuid::new_v4().to_string(),
            typ: FAMILY_TASK.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        })
    }

    pub fn verify_task_token(&self, token: &str) -> Result<TaskClaims> {
        let claims: TaskClaims = self.decode_family(token)?;
        check_family(&claims.typ, FAMILY_TASK)?;
        Ok(claims)
    }

    pub fn issue_session_token(
        &self,
        user_id: &str,
        email: &str,
        username: &str,
        role: &str,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let now = Utc::now();
        let exp = now + self.ttl(ttl, self.config.session_ttl_secs);
        self.sign(&SessionClaims {
            iss: self.config.issuer.clone(),
            sub: user_id.to_string(),
            email: email.to_string(),
            username: username.to_string(),
            role: role.to_string(),
            typ: FAMILY_SESSION.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        })
    }

    pub fn verify_session_token(&self, token: &str) -> Result<SessionClaims> {
        let claims: SessionClaims = self.decode_family(token)?;
        check_family(&claims.typ, FAMILY_SESSION)?;
        Ok(claims)
    }

    pub fn issue_endorsement(
        &self,
        agent_uri: &str,
        trust_tier: &str,
        cert_serial: &str,
    ) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.config.endorsement_ttl_secs);
        self.sign(&EndorsementClaims {
            iss: self.config.issuer.clone(),
            sub: agent_uri.to_string(),
            trust_tier: trust_tier.to_string(),
            cert_serial: cert_serial.to_string(),
            registry_url: self.registry_url.clone(),
            typ: FAMILY_ENDORSEMENT.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        })
    }

    pub fn verify_endorsement(&self, token: &str) -> Result<EndorsementClaims> {
        let claims: EndorsementClaims = self.decode_family(token)?;
        check_family(&claims.typ, FAMILY_ENDORSEMENT)?;
        Ok(claims)
    }

    pub fn issue_oauth_state(&self, provider: &str) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.config.oauth_state_ttl_secs);
        self.sign(&OauthStateClaims {
            iss: self.config.issuer.clone(),
            sub: provider.to_string(),
            typ: FAMILY_OAUTH_STATE.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        })
    }

    pub fn verify_oauth_state(&self, token: &str) -> Result<OauthStateClaims> {
        let claims: OauthStateClaims = self.decode_family(token)?;
        check_family(&claims.typ, FAMILY_OAUTH_STATE)?;
        Ok(claims)
    }

    /// Public verification keys, RFC 7517 shape.
    pub fn jwks(&self) -> serde_json::Value {
        json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": self.kid,
                "n": self.jwk_n,
                "e": self.jwk_e,
            }]
        })
    }

    /// Minimal OIDC discovery document pointing at the JWKS.
    pub fn oidc_discovery(&self) -> serde_json::Value {
        let base = self.registry_url.trim_end_matches('/');
        json!({
            "issuer": self.config.issuer,
            "jwks_uri": format!("{base}/.well-known/jwks.json"),
            "id_token_signing_alg_values_supported": ["RS256"],
            "subject_types_supported": ["public"],
            "response_types_supported": ["id_token"],
        })
    }
}

fn check_family(got: &str, want: &str) -> Result<()> {
    if got != want {
        return Err(RegistryError::Unauthorized(format!(
            "token family mismatch: expected {want}, got {got}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaConfig;
    use tempfile::TempDir;

    fn service() -> (TempDir, TokenService) {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::bootstrap_root(&CaConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let svc = TokenService::new(
            &ca,
            TokenConfig::default(),
            "https://registry.test".to_string(),
        )
        .unwrap();
        (dir, svc)
    }

    #[test]
    fn task_token_round_trip() {
        let (_dir, svc) = service();
        let token = svc
            .issue_task_token("agent://nap/assistant/agent_x", vec!["resolve".into()], None)
            .unwrap();
        let claims = svc.verify_task_token(&token).unwrap();
        assert_eq!(claims.sub, "agent://nap/assistant/agent_x");
        assert_eq!(claims.scopes, vec!["resolve"]);
        assert!(claims.exp - claims.iat <= 3600);
    }

    #[test]
    fn families_do_not_cross_verify() {
        let (_dir, svc) = service();
        let state = svc.issue_oauth_state("github").unwrap();
        // An oauth-state token must not pass task verification.
        assert!(svc.verify_task_token(&state).is_err());
        let task = svc
            .issue_task_token("agent://nap/a/agent_y", vec![], None)
            .unwrap();
        assert!(svc.verify_session_token(&task).is_err());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let (_dir, svc) = service();
        let token = svc
            .issue_task_token("agent://nap/a/agent_z", vec![], None)
            .unwrap();
        let mut bytes = token.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(svc.verify_task_token(&tampered).is_err());
    }

    #[test]
    fn requested_ttl_is_clamped_to_family_cap() {
        let (_dir, svc) = service();
        let token = svc
            .issue_task_token(
                "agent://nap/a/agent_q",
                vec![],
                Some(Duration::seconds(10 * 3600)),
            )
            .unwrap();
        let claims = svc.verify_task_token(&token).unwrap();
        assert!(claims.exp - claims.iat <= 3600);
    }

    #[test]
    fn jwks_exposes_one_rs256_key() {
        let (_dir, svc) = service();
        let jwks = svc.jwks();
        let keys = jwks["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0]["alg"], "RS256");
        assert_eq!(keys[0]["e"], "AQAB");
        let discovery = svc.oidc_discovery();
        assert_eq!(
            discovery["jwks_uri"],
            "https://registry.test/.well-known/jwks.json"
        );
    }
}
