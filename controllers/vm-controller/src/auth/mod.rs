//! Authentication and authorization of control-plane callers
//!
//! Callers present a JWT signed with the shared HMAC secret. Signature and
//! expiry are verified before any claim is trusted. Verified identities are
//! cached by token hash; a cache miss always falls back to full verification.

pub mod cache;

use crate::config::Config;
use crate::error::ControllerError;
use cache::{token_hash, TokenCache};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Caller role carried in the `role` claim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Every action in every namespace
    Admin,
    /// Full lifecycle within its namespaces
    #[default]
    Operator,
    /// Read-only within its namespaces
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
    Read,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Read => "read",
        };
        f.write_str(s)
    }
}

/// Token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub role: Role,
    /// Namespaces the caller may act in; empty means the default namespace only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
    pub namespaces: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Verifies bearer tokens and decides what their holders may do
pub struct AuthGuard {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_lifetime: Duration,
    cache_ttl: Duration,
    default_namespace: String,
    cache: Arc<TokenCache>,
}

impl fmt::Debug for AuthGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGuard")
            .field("algorithm", &self.algorithm)
            .field("token_lifetime", &self.token_lifetime)
            .field("cache_ttl", &self.cache_ttl)
            .field("default_namespace", &self.default_namespace)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl AuthGuard {
    pub fn new(config: &Config) -> Self {
        let secret = config.secret_key.as_bytes();
        Self {
            algorithm: config.algorithm,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            token_lifetime: config.access_token_expire,
            cache_ttl: config.token_cache_ttl,
            default_namespace: config.namespace.clone(),
            cache: Arc::new(TokenCache::new()),
        }
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    /// Verify a bearer token and return the identity it carries
    pub fn authenticate(&self, token: &str) -> Result<Identity, ControllerError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(ControllerError::Unauthorized("missing bearer token".to_string()));
        }

        let hash = token_hash(token);
        if self.cache.is_revoked(&hash) {
            return Err(ControllerError::Unauthorized("token has been revoked".to_string()));
        }
        if let Some(identity) = self.cache.get(&hash) {
            debug!(subject = %identity.subject, "Token cache hit");
            return Ok(identity);
        }

        let identity = self.verify(token)?;
        self.cache.put(hash, identity.clone(), self.cache_ttl);
        Ok(identity)
    }

    fn verify(&self, token: &str) -> Result<Identity, ControllerError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| ControllerError::Unauthorized(format!("invalid token: {e}")))?;
        let claims = data.claims;

        let expires_at = i64::try_from(claims.exp)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| ControllerError::Unauthorized("invalid exp claim".to_string()))?;

        Ok(Identity {
            subject: claims.sub,
            role: claims.role,
            namespaces: claims.namespaces,
            expires_at,
        })
    }

    /// Whether `identity` may perform `action` in `namespace`
    pub fn authorize(&self, identity: &Identity, action: Action, namespace: &str) -> bool {
        let in_scope = || {
            if identity.namespaces.is_empty() {
                namespace == self.default_namespace
            } else {
                identity.namespaces.iter().any(|ns| ns == namespace)
            }
        };
        match identity.role {
            Role::Admin => true,
            Role::Operator => in_scope(),
            Role::Viewer => action == Action::Read && in_scope(),
        }
    }

    /// [`Self::authorize`] as a `Result`
    pub fn require(&self, identity: &Identity, action: Action, namespace: &str) -> Result<(), ControllerError> {
        if self.authorize(identity, action, namespace) {
            Ok(())
        } else {
            Err(ControllerError::Forbidden(format!(
                "{} '{}' may not {action} in namespace '{namespace}'",
                identity.role, identity.subject
            )))
        }
    }

    /// Sign a token for `subject` valid for the configured lifetime
    pub fn issue(&self, subject: &str, role: Role, namespaces: Vec<String>) -> Result<String, ControllerError> {
        let lifetime = chrono::Duration::from_std(self.token_lifetime)
            .map_err(|e| ControllerError::InvalidConfig(format!("token lifetime: {e}")))?;
        let exp = Utc::now() + lifetime;
        let claims = Claims {
            sub: subject.to_string(),
            exp: u64::try_from(exp.timestamp()).unwrap_or(0),
            role,
            namespaces,
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| ControllerError::Internal(format!("failed to sign token: {e}")))
    }

    /// Reject `token` from now until it expires
    pub fn revoke(&self, token: &str) -> Result<(), ControllerError> {
        let identity = self.authenticate(token)?;
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        self.cache.revoke(token_hash(token), identity.expires_at);
        info!(subject = %identity.subject, "Token revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;

    fn guard() -> AuthGuard {
        AuthGuard::new(&test_config())
    }

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 600
    }

    #[test]
    fn test_authenticate_returns_claims() {
        let guard = guard();
        let token = sign(
            &serde_json::json!({
                "sub": "alice",
                "exp": future_exp(),
                "role": "viewer",
                "namespaces": ["vms", "lab"],
            }),
            "test-secret",
        );

        let identity = guard.authenticate(&format!("Bearer {token}")).unwrap();
        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.role, Role::Viewer);
        assert_eq!(identity.namespaces, vec!["vms", "lab"]);
    }

    #[test]
    fn test_role_defaults_to_operator() {
        let guard = guard();
        let token = sign(&serde_json::json!({"sub": "bob", "exp": future_exp()}), "test-secret");
        assert_eq!(guard.authenticate(&token).unwrap().role, Role::Operator);
    }

    #[test]
    fn test_wrong_secret_is_unauthorized() {
        let guard = guard();
        let token = sign(&serde_json::json!({"sub": "alice", "exp": future_exp()}), "other-secret");
        assert!(matches!(guard.authenticate(&token), Err(ControllerError::Unauthorized(_))));
    }

    #[test]
    fn test_tampered_payload_is_unauthorized() {
        let guard = guard();
        let token = guard.issue("alice", Role::Viewer, vec![]).unwrap();
        let forged = guard.issue("alice", Role::Admin, vec![]).unwrap();

        // Viewer header and signature with an admin payload
        let parts: Vec<&str> = token.split('.').collect();
        let forged_parts: Vec<&str> = forged.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], forged_parts[1], parts[2]);

        assert!(matches!(guard.authenticate(&tampered), Err(ControllerError::Unauthorized(_))));
    }

    #[test]
    fn test_expired_token_is_unauthorized() {
        let guard = guard();
        let token = sign(
            &serde_json::json!({"sub": "alice", "exp": Utc::now().timestamp() - 1}),
            "test-secret",
        );
        assert!(matches!(guard.authenticate(&token), Err(ControllerError::Unauthorized(_))));
    }

    #[test]
    fn test_missing_sub_is_unauthorized() {
        let guard = guard();
        let token = sign(&serde_json::json!({"exp": future_exp()}), "test-secret");
        assert!(matches!(guard.authenticate(&token), Err(ControllerError::Unauthorized(_))));
    }

    #[test]
    fn test_verified_token_is_cached() {
        let guard = guard();
        let token = guard.issue("alice", Role::Operator, vec![]).unwrap();
        assert!(guard.cache().is_empty());
        guard.authenticate(&token).unwrap();
        assert_eq!(guard.cache().len(), 1);
        assert!(guard.cache().get(&token_hash(&token)).is_some());
    }

    #[test]
    fn test_revoked_token_is_rejected() {
        let guard = guard();
        let token = guard.issue("alice", Role::Operator, vec![]).unwrap();
        guard.authenticate(&token).unwrap();
        guard.revoke(&token).unwrap();
        assert!(matches!(guard.authenticate(&token), Err(ControllerError::Unauthorized(_))));
    }

    #[test]
    fn test_authorize_by_role() {
        let guard = guard();
        let identity = |role, namespaces: Vec<&str>| Identity {
            subject: "x".to_string(),
            role,
            namespaces: namespaces.into_iter().map(str::to_string).collect(),
            expires_at: Utc::now(),
        };

        let admin = identity(Role::Admin, vec![]);
        assert!(guard.authorize(&admin, Action::Delete, "anywhere"));

        let operator = identity(Role::Operator, vec![]);
        assert!(guard.authorize(&operator, Action::Create, "vms"));
        assert!(!guard.authorize(&operator, Action::Create, "other"));

        let scoped = identity(Role::Operator, vec!["lab"]);
        assert!(guard.authorize(&scoped, Action::Update, "lab"));
        assert!(!guard.authorize(&scoped, Action::Update, "vms"));

        let viewer = identity(Role::Viewer, vec![]);
        assert!(guard.authorize(&viewer, Action::Read, "vms"));
        assert!(!guard.authorize(&viewer, Action::Delete, "vms"));
        assert!(matches!(
            guard.require(&viewer, Action::Create, "vms"),
            Err(ControllerError::Forbidden(_))
        ));
    }
}
