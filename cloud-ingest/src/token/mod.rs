//! Bearer token caching with per-key refresh locks.
//!
//! Concurrent callers for the same integration credential serialize on a
//! per-key lock while the token is resolved and used, so an expired token is
//! refreshed by exactly one network call no matter how many tasks need it at once.

mod oauth;

pub use oauth::{ClientCredentials, OAuthClientCredentials};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::vendor::VendorError;

/// Tokens this close to expiry are treated as expired.
pub const DEFAULT_EXPIRY_SKEW_SECS: i64 = 60;

/// Cache key: one token per integration credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub integration: String,
    pub credential: String,
}

impl TokenKey {
    pub fn new(integration: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            integration: integration.into(),
            credential: credential.into(),
        }
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.integration, self.credential)
    }
}

/// A cached bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub key: TokenKey,
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("key", &self.key)
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl TokenRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew >= self.expires_at
    }
}

/// Performs the network call that issues a new token.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self, key: &TokenKey) -> Result<TokenRecord, VendorError>;
}

type TokenSlot = Arc<Mutex<Option<TokenRecord>>>;

/// Read-through cache of per-key locks guarding cached tokens.
///
/// A slot is created on first touch of a key and only removed by
/// [`TokenLockManager::prune_idle`] when no caller holds it.
pub struct TokenLockManager {
    fetcher: Arc<dyn TokenFetcher>,
    slots: DashMap<TokenKey, TokenSlot>,
    expiry_skew: Duration,
}

impl TokenLockManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self::with_expiry_skew(fetcher, Duration::seconds(DEFAULT_EXPIRY_SKEW_SECS))
    }

    pub fn with_expiry_skew(fetcher: Arc<dyn TokenFetcher>, expiry_skew: Duration) -> Self {
        Self {
            fetcher,
            slots: DashMap::new(),
            expiry_skew,
        }
    }

    fn slot(&self, key: &TokenKey) -> TokenSlot {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Return the cached token for `key`, fetching a new one under the key's lock if needed.
    pub async fn token(&self, key: &TokenKey) -> Result<TokenRecord, VendorError> {
        let slot = self.slot(key);
        let mut cached = slot.lock().await;
        self.resolve(key, &mut cached).await
    }

    /// Reuse `cached` while it is valid, otherwise fetch and store a new token.
    /// The caller holds the key's lock.
    async fn resolve(
        &self,
        key: &TokenKey,
        cached: &mut Option<TokenRecord>,
    ) -> Result<TokenRecord, VendorError> {
        if let Some(token) = cached.as_ref()
            && !token.is_expired_at(Utc::now(), self.expiry_skew)
        {
            return Ok(token.clone());
        }

        debug!(key = %key, "Fetching new access token");
        let token = self.fetcher.fetch_token(key).await?;
        info!(key = %key, expires_at = %token.expires_at, "Access token refreshed");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Call `f` with a valid token for `key` while holding the key's lock.
    ///
    /// Calls for the same key never overlap, so `f` must not request a token
    /// for `key` itself. When `f` fails with a 401 the cached token is dropped
    /// and the sequence runs once more; a second 401 becomes
    /// [`VendorError::TokenExpired`].
    pub async fn with_token<T, F, Fut>(&self, key: &TokenKey, f: F) -> Result<T, VendorError>
    where
        F: Fn(TokenRecord) -> Fut,
        Fut: Future<Output = Result<T, VendorError>>,
    {
        let slot = self.slot(key);
        let mut cached = slot.lock().await;

        let token = self.resolve(key, &mut cached).await?;
        match f(token).await {
            Err(e) if e.is_unauthorized() => {
                warn!(key = %key, "Access token rejected; refreshing and retrying once");
                *cached = None;
                let token = self.resolve(key, &mut cached).await?;
                match f(token).await {
                    Err(e) if e.is_unauthorized() => {
                        *cached = None;
                        Err(VendorError::TokenExpired)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Drop any cached token for `key`.
    pub async fn invalidate(&self, key: &TokenKey) {
        let slot = self.slot(key);
        *slot.lock().await = None;
    }

    /// Remove slots nobody holds whose token is absent or expired. Returns the number removed.
    pub fn prune_idle(&self) -> usize {
        let now = Utc::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(cached) => cached
                    .as_ref()
                    .is_some_and(|t| !t.is_expired_at(now, self.expiry_skew)),
                Err(_) => true,
            }
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
