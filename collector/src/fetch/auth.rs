//! Request authentication
//!
//! Static credentials go straight into a header. OAuth2 client credentials
//! are exchanged for a bearer token, which is cached on the fetcher until
//! shortly before it expires.

use crate::error::FetchError;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// How a request authenticates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Auth {
    #[default]
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// Arbitrary header, e.g. `Authorization: SSWS <token>`
    Header { name: String, value: String },
    /// OAuth2 client-credentials grant
    ClientCredentials(TokenExchange),
}

impl Auth {
    pub fn bearer(token: impl Into<String>) -> Self {
        Auth::Bearer(token.into())
    }

    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Auth::Header {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Client-credentials token request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenExchange {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Per-fetcher cache of exchanged tokens
#[derive(Default)]
pub(crate) struct TokenCache {
    tokens: Mutex<HashMap<(String, String), CachedToken>>,
}

impl TokenCache {
    /// Resolve `auth` into a header name and value
    pub(crate) async fn header(
        &self,
        client: &Client,
        auth: &Auth,
    ) -> Result<Option<(String, String)>, FetchError> {
        match auth {
            Auth::None => Ok(None),
            Auth::Bearer(token) => Ok(Some(bearer_header(token))),
            Auth::Header { name, value } => Ok(Some((name.clone(), value.clone()))),
            Auth::ClientCredentials(exchange) => {
                let token = self.token(client, exchange).await?;
                Ok(Some(bearer_header(&token)))
            }
        }
    }

    async fn token(&self, client: &Client, exchange: &TokenExchange) -> Result<String, FetchError> {
        let key = (exchange.token_url.clone(), exchange.client_id.clone());
        let cached = self
            .tokens
            .lock()
            .get(&key)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.token.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let (token, lifetime) = exchange_token(client, exchange).await?;
        let expires_at = Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN);
        self.tokens.lock().insert(
            key,
            CachedToken {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(token)
    }
}

fn bearer_header(token: &str) -> (String, String) {
    ("Authorization".to_string(), format!("Bearer {token}"))
}

async fn exchange_token(
    client: &Client,
    exchange: &TokenExchange,
) -> Result<(String, Duration), FetchError> {
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", exchange.client_id.as_str()),
        ("client_secret", exchange.client_secret.as_str()),
        ("scope", exchange.scope.as_str()),
    ];

    let response = client
        .post(&exchange.token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| FetchError::Authentication {
            status: 0,
            message: format!("token endpoint unreachable: {e}"),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(url = %exchange.token_url, status = %status, "token exchange rejected");
        return Err(FetchError::Authentication {
            status: status.as_u16(),
            message: body,
        });
    }

    let token: TokenResponse = response.json().await.map_err(|e| FetchError::Authentication {
        status: status.as_u16(),
        message: format!("token response unreadable: {e}"),
    })?;
    debug!(url = %exchange.token_url, "token exchanged");

    let lifetime = token
        .expires_in
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME);
    Ok((token.access_token, lifetime))
}
