//! OAuth2 client-credentials token fetcher.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{TokenFetcher, TokenKey, TokenRecord};
use crate::vendor::VendorError;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Client id/secret pair registered for one credential name.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Fetches tokens from an OAuth2 token endpoint using the client-credentials grant.
pub struct OAuthClientCredentials {
    client: reqwest::Client,
    token_url: String,
    credentials: HashMap<String, ClientCredentials>,
}

impl OAuthClientCredentials {
    pub fn new(client: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            credentials: HashMap::new(),
        }
    }

    /// Register the client credentials used for tokens keyed by `credential`.
    pub fn with_credential(
        mut self,
        credential: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: Option<String>,
    ) -> Self {
        self.credentials.insert(
            credential.into(),
            ClientCredentials {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
                scope,
            },
        );
        self
    }
}

fn token_from_response(
    key: &TokenKey,
    body: &str,
    now: DateTime<Utc>,
) -> Result<TokenRecord, VendorError> {
    let response: TokenResponse = serde_json::from_str(body)
        .map_err(|e| VendorError::Parse(format!("invalid token response: {e}")))?;
    if response.access_token.is_empty() {
        return Err(VendorError::Parse("token response has no access_token".into()));
    }

    let lifetime = response
        .expires_in
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

    Ok(TokenRecord {
        key: key.clone(),
        value: response.access_token,
        issued_at: now,
        expires_at: now + Duration::seconds(lifetime),
    })
}

#[async_trait]
impl TokenFetcher for OAuthClientCredentials {
    async fn fetch_token(&self, key: &TokenKey) -> Result<TokenRecord, VendorError> {
        let creds = self.credentials.get(&key.credential).ok_or_else(|| {
            VendorError::Other(format!("no client credentials registered for {key}"))
        })?;

        let mut form = vec![("grant_type", "client_credentials")];
        if let Some(scope) = creds.scope.as_deref() {
            form.push(("scope", scope));
        }

        debug!(key = %key, url = %self.token_url, "Requesting client-credentials token");
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(VendorError::from_status(status, body));
        }

        token_from_response(key, &body, Utc::now())
    }
}
