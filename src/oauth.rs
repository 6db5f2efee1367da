//! OAuth2 refresh-token cache for the locations worker's authorized ESI
//! calls.
//!
//! A single cached access token is shared process-wide. `acquire` returns
//! the cached token if it still has life left, otherwise performs the
//! refresh-token grant against the SSO token endpoint and validates the
//! response before caching it. The margin subtracted from `expires_in`
//! guards against a token expiring mid-flight between the check and the
//! request that uses it.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::{SSO_CLIENT_ID, SSO_CLIENT_SECRET, SSO_REFRESH_TOKEN, SecretTable};
use crate::error::{HoarderError, Result};

const TOKEN_URL: &str = "https://login.eveonline.com/v2/oauth/token";
const ACCESS_TOKEN_MAX_LEN: usize = 4096;
const EXPIRES_IN_MAX: u64 = i32::MAX as u64;
/// Subtracted from `expires_in` so a token never gets handed out with
/// less than this much life left in it.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(7);
/// A cached token is only reused if it still has this much life left
/// beyond `Instant::now()`, guarding against expiring mid-flight between
/// the check and the request that uses it.
const CACHE_HIT_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: u64,
    refresh_token: String,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct OAuthCache {
    http: Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuthCache {
    pub fn new(secrets: &SecretTable) -> anyhow::Result<Self> {
        let client_id = secrets.get(SSO_CLIENT_ID)?.to_string();
        let client_secret = secrets.get(SSO_CLIENT_SECRET)?.to_string();
        let refresh_token = secrets.get(SSO_REFRESH_TOKEN)?.to_string();
        Ok(Self {
            http: Client::builder()
                .timeout(Duration::from_secs(7))
                .build()?,
            client_id,
            client_secret,
            refresh_token,
            cached: Mutex::new(None),
        })
    }

    /// Returns a still-valid bearer token, refreshing it first if needed.
    pub async fn acquire(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + CACHE_HIT_MARGIN < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(HoarderError::Transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HoarderError::Auth(format!(
                "sso token refresh failed: {status}: {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| HoarderError::Auth(format!("malformed token response: {e}")))?;

        if parsed.token_type != "Bearer" {
            return Err(HoarderError::Auth(format!(
                "unexpected token_type {:?}",
                parsed.token_type
            )));
        }
        if parsed.refresh_token.as_bytes() != self.refresh_token.as_bytes() {
            return Err(HoarderError::Auth(
                "sso rotated the refresh token unexpectedly".into(),
            ));
        }
        if parsed.expires_in > EXPIRES_IN_MAX {
            return Err(HoarderError::Auth(format!(
                "expires_in {} out of sane range",
                parsed.expires_in
            )));
        }
        if parsed.access_token.len() > ACCESS_TOKEN_MAX_LEN {
            return Err(HoarderError::Auth("access_token too long".into()));
        }

        let expires_at = Instant::now() + Duration::from_secs(parsed.expires_in)
            - EXPIRY_SAFETY_MARGIN.min(Duration::from_secs(parsed.expires_in));

        *cached = Some(CachedToken {
            access_token: parsed.access_token.clone(),
            expires_at,
        });
        Ok(parsed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secrets() -> SecretTable {
        SecretTable::parse(
            &json!({
                "ssoClientId": "id",
                "ssoClientSecret": "secret",
                "ssoRefreshToken": "refresh",
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn constructs_from_secrets() {
        let cache = OAuthCache::new(&secrets()).unwrap();
        assert_eq!(cache.client_id, "id");
        assert_eq!(cache.refresh_token, "refresh");
    }

    #[test]
    fn missing_secret_fails_construction() {
        let empty = SecretTable::parse("{}").unwrap();
        assert!(OAuthCache::new(&empty).is_err());
    }

    #[tokio::test]
    async fn cached_token_short_circuits_before_expiry() {
        let cache = OAuthCache::new(&secrets()).unwrap();
        {
            let mut guard = cache.cached.lock().await;
            *guard = Some(CachedToken {
                access_token: "cached-token".into(),
                expires_at: Instant::now() + Duration::from_secs(60),
            });
        }
        assert_eq!(cache.acquire().await.unwrap(), "cached-token");
    }
}
