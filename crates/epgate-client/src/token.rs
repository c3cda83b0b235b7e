//! Access-token cache, keyed by `(corpId, appId)`.
//!
//! Single-flight is achieved with the per-key mutex itself rather than a
//! separate in-flight-future map: concurrent callers block on the same
//! `Mutex<TokenSlot>`, and whichever caller wins the lock race performs the
//! refresh while the rest wait and then observe its result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::error::{ClientError, Result};

const DEFAULT_TTL_SECS: i64 = 7200;
const REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Default)]
struct TokenSlot {
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenSlot {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.token, self.expires_at) {
            (Some(_), Some(exp)) => exp - now > chrono::Duration::seconds(REFRESH_SKEW_SECS),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    errcode: Option<i64>,
    errmsg: Option<String>,
    access_token: Option<String>,
    expires_in: Option<i64>,
}

/// Fetches an access token for `(corp_id, secret)` from EP's token endpoint.
/// Separated as a trait so `TokenCache` can be exercised without network I/O.
#[async_trait::async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self, corp_id: &str, secret: &str) -> Result<(String, i64)>;
}

pub struct HttpTokenFetcher {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTokenFetcher {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch(&self, corp_id: &str, secret: &str) -> Result<(String, i64)> {
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&[("corpid", corp_id), ("corpsecret", secret)])
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        match parsed.access_token {
            Some(token) => Ok((token, parsed.expires_in.unwrap_or(DEFAULT_TTL_SECS))),
            None => Err(ClientError::TokenRefresh(format!(
                "{}: {}",
                parsed.errcode.unwrap_or(-1),
                parsed.errmsg.unwrap_or_else(|| "no access_token in response".into())
            ))),
        }
    }
}

pub struct TokenCache<F: TokenFetcher> {
    fetcher: F,
    slots: DashMap<(String, String), Arc<Mutex<TokenSlot>>>,
}

impl<F: TokenFetcher> TokenCache<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            slots: DashMap::new(),
        }
    }

    fn slot_for(&self, corp_id: &str, app_id: &str) -> Arc<Mutex<TokenSlot>> {
        self.slots
            .entry((corp_id.to_string(), app_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(TokenSlot::default())))
            .clone()
    }

    #[instrument(skip(self, secret), fields(corp_id, app_id))]
    pub async fn get(&self, corp_id: &str, app_id: &str, secret: &str) -> Result<String> {
        let slot = self.slot_for(corp_id, app_id);
        let mut guard = slot.lock().await;

        let now = Utc::now();
        if guard.is_fresh(now) {
            return Ok(guard.token.clone().expect("checked fresh above"));
        }

        match self.fetcher.fetch(corp_id, secret).await {
            Ok((token, ttl_secs)) => {
                guard.token = Some(token.clone());
                guard.expires_at = Some(now + chrono::Duration::seconds(ttl_secs));
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait::async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self, _corp_id: &str, _secret: &str) -> Result<(String, i64)> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                return Err(ClientError::TokenRefresh("simulated failure".into()));
            }
            Ok((format!("token-{n}"), 7200))
        }
    }

    #[tokio::test]
    async fn caches_token_until_near_expiry() {
        let cache = TokenCache::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let t1 = cache.get("corp", "app", "secret").await.unwrap();
        let t2 = cache.get("corp", "app", "secret").await.unwrap();
        assert_eq!(t1, t2, "second call should reuse the cached token");
    }

    #[tokio::test]
    async fn distinct_keys_get_independent_slots() {
        let cache = TokenCache::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let t1 = cache.get("corpA", "appA", "s").await.unwrap();
        let t2 = cache.get("corpB", "appB", "s").await.unwrap();
        assert_ne!(t1, t2);
    }

    #[tokio::test]
    async fn failed_refresh_is_retried_on_next_call() {
        let cache = TokenCache::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            fail_first_n: 1,
        });
        assert!(cache.get("corp", "app", "s").await.is_err());
        assert!(cache.get("corp", "app", "s").await.is_ok());
    }
}
