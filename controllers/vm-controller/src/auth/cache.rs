//! Verified-token cache
//!
//! Entries are keyed by the hex SHA-256 of the raw token so the token itself
//! is never held. An entry never outlives the token it was built from.
//! Revoked hashes are remembered until the token would have expired anyway.

use super::Identity;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Hex SHA-256 of a raw bearer token
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    identity: Identity,
    expires_at: DateTime<Utc>,
}

/// Cache of verified identities
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    revoked: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached identity for a token hash, if present and not expired
    pub fn get(&self, hash: &str) -> Option<Identity> {
        self.get_at(hash, Utc::now())
    }

    /// Cache `identity` until `min(now + ttl, identity.expires_at)`
    pub fn put(&self, hash: String, identity: Identity, ttl: Duration) {
        self.put_at(hash, identity, ttl, Utc::now());
    }

    fn get_at(&self, hash: &str, now: DateTime<Utc>) -> Option<Identity> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(hash)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.identity.clone())
    }

    fn put_at(&self, hash: String, identity: Identity, ttl: Duration, now: DateTime<Utc>) {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map_or(identity.expires_at, |until| until.min(identity.expires_at));
        if expires_at <= now {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(hash, CacheEntry { identity, expires_at });
    }

    /// Drop a cached entry
    pub fn remove(&self, hash: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(hash);
    }

    /// Reject the token behind `hash` until `until`
    pub fn revoke(&self, hash: String, until: DateTime<Utc>) {
        self.remove(&hash);
        let mut revoked = self.revoked.write().unwrap_or_else(PoisonError::into_inner);
        revoked.insert(hash, until);
    }

    pub fn is_revoked(&self, hash: &str) -> bool {
        self.is_revoked_at(hash, Utc::now())
    }

    fn is_revoked_at(&self, hash: &str, now: DateTime<Utc>) -> bool {
        let revoked = self.revoked.read().unwrap_or_else(PoisonError::into_inner);
        revoked.get(hash).is_some_and(|until| *until > now)
    }

    /// Remove expired entries and lapsed revocations
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at > now);
            purged += before - entries.len();
        }
        {
            let mut revoked = self.revoked.write().unwrap_or_else(PoisonError::into_inner);
            let before = revoked.len();
            revoked.retain(|_, until| *until > now);
            purged += before - revoked.len();
        }
        if purged > 0 {
            debug!(purged, "Purged expired token cache entries");
        }
        purged
    }

    /// Number of cached identities (including ones not yet purged)
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
