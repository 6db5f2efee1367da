//! HTTP fetch layer: a single process-wide rate gate plus a retry table
//! that knows how to read EVE's public market API cooldown signals.
//!
//! Every request goes through [`EsiClient::fetch`]. Before issuing an
//! attempt the gate is checked; if the server is in a cooldown window the
//! call sleeps until it clears. A non-2xx response advances the gate
//! (never retreats it — a slower caller racing a faster one must not
//! shorten the cooldown the faster caller already observed) and is
//! retried up to `max_attempts` times; anything else is reported to the
//! caller as non-retriable.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{HoarderError, Result};
use crate::oauth::OAuthCache;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(7);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(20);
const ERROR_LIMIT_RESET_MIN: u64 = 1;
const ERROR_LIMIT_RESET_MAX: u64 = 120;

/// Process-wide "don't call before this instant" gate. Advances
/// monotonically; a 429/420/500/503/504 response pushes it forward, a
/// success never pulls it back.
pub struct RateGate {
    not_before: Mutex<Instant>,
}

impl RateGate {
    pub fn new() -> Self {
        Self {
            not_before: Mutex::new(Instant::now()),
        }
    }

    /// Sleep, if needed, until the gate clears.
    async fn wait(&self) {
        let target = *self.not_before.lock().expect("rate gate mutex poisoned");
        let now = Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
    }

    /// Push the gate forward by `cooldown`, never backward.
    fn advance(&self, cooldown: Duration) {
        let mut not_before = self.not_before.lock().expect("rate gate mutex poisoned");
        let candidate = Instant::now() + cooldown;
        if candidate > *not_before {
            *not_before = candidate;
        }
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct TimeoutBody {
    timeout: u64,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub body: String,
    pub pages: Option<u32>,
    /// Raw `Expires` header value. The upstream server's `Expires` header
    /// is actually populated from its own "when did I last write this
    /// row" clock rather than a cache-expiry clock; callers that want
    /// last-modified semantics should read this field, not `modified`.
    pub expires: Option<String>,
    pub modified: Option<String>,
}

pub struct EsiClient {
    http: Client,
    rate_gate: RateGate,
    base_url: String,
}

impl EsiClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .gzip(true)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            rate_gate: RateGate::new(),
            base_url: base_url.into(),
        })
    }

    /// Fetch `path` (relative to the base URL) with `method`, retrying up
    /// to `max_attempts` times on retriable statuses. `oauth` is consulted
    /// only when `authorized` is true. `body`, when present, is sent with
    /// an explicit `Content-Length` (used by POST/PUT callers; every
    /// current worker issues GET with no body).
    pub async fn fetch(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&[u8]>,
        authorized: bool,
        oauth: Option<&OAuthCache>,
        max_attempts: u32,
    ) -> Result<FetchResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_gate.wait().await;

            let mut request = self.http.request(method.clone(), &url).query(query);
            if let Some(body) = body {
                request = request
                    .header(reqwest::header::CONTENT_LENGTH, body.len())
                    .body(body.to_vec());
            }
            if authorized {
                let oauth = oauth.expect("authorized fetch requires an oauth cache");
                let token = oauth.acquire().await?;
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(err) => {
                    if attempt >= max_attempts {
                        return Err(HoarderError::Transport(err));
                    }
                    warn!(%err, attempt, "transport error, retrying");
                    self.rate_gate.advance(DEFAULT_COOLDOWN);
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let pages = response
                    .headers()
                    .get("x-pages")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u32>().ok());
                let expires = response
                    .headers()
                    .get("expires")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let modified = response
                    .headers()
                    .get("last-modified")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response.text().await.map_err(HoarderError::Transport)?;
                return Ok(FetchResponse {
                    body,
                    pages,
                    expires,
                    modified,
                });
            }

            let limit_reset = response
                .headers()
                .get("x-esi-error-limit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();

            if !is_retriable(status) {
                return Err(HoarderError::UpstreamRejected(format!(
                    "{status}: {body}"
                )));
            }

            if attempt >= max_attempts {
                return Err(HoarderError::OutOfRetries);
            }

            let cooldown = cooldown_for(status, limit_reset, &body);
            debug!(%status, ?cooldown, attempt, url = %url, "retriable response, backing off");
            self.rate_gate.advance(cooldown);
        }
    }
}

fn is_retriable(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        500 | 503 | 429 | 420 | 504
    )
}

fn cooldown_for(status: StatusCode, limit_reset: Option<u64>, body: &str) -> Duration {
    match status.as_u16() {
        420 => limit_reset
            .filter(|&s| (ERROR_LIMIT_RESET_MIN..=ERROR_LIMIT_RESET_MAX).contains(&s))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COOLDOWN),
        504 => serde_json::from_str::<TimeoutBody>(body)
            .map(|t| Duration::from_secs(t.timeout))
            .unwrap_or(DEFAULT_COOLDOWN),
        _ => DEFAULT_COOLDOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_gate_only_advances() {
        let gate = RateGate::new();
        let before = *gate.not_before.lock().unwrap();
        gate.advance(Duration::from_secs(5));
        let after_long = *gate.not_before.lock().unwrap();
        assert!(after_long > before);
        gate.advance(Duration::from_millis(1));
        let after_short = *gate.not_before.lock().unwrap();
        assert_eq!(after_long, after_short);
    }

    #[test]
    fn retriable_statuses() {
        for code in [500u16, 503, 429, 420, 504] {
            assert!(is_retriable(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200u16, 400, 401, 403, 404] {
            assert!(!is_retriable(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn error_limit_reset_is_clamped_to_valid_range() {
        let status = StatusCode::from_u16(420).unwrap();
        assert_eq!(cooldown_for(status, Some(30), ""), Duration::from_secs(30));
        assert_eq!(cooldown_for(status, Some(0), ""), DEFAULT_COOLDOWN);
        assert_eq!(cooldown_for(status, Some(999), ""), DEFAULT_COOLDOWN);
        assert_eq!(cooldown_for(status, None, ""), DEFAULT_COOLDOWN);
    }

    #[test]
    fn gateway_timeout_reads_json_body() {
        let status = StatusCode::from_u16(504).unwrap();
        assert_eq!(
            cooldown_for(status, None, r#"{"timeout": 42}"#),
            Duration::from_secs(42)
        );
        assert_eq!(cooldown_for(status, None, "not json"), DEFAULT_COOLDOWN);
    }
}
