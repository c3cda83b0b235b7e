//! Shared HTTP dispatch: egress-proxy client caching, timeouts, and
//! streamed response-size caps, all behind one fetch function.

use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use tracing::instrument;

use crate::error::{ClientError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Builds and caches one `reqwest::Client` per distinct egress proxy URL (or
/// one default client for the no-proxy case), so every request doesn't pay
/// the cost of constructing a fresh client + connection pool.
pub struct Dispatcher {
    clients: DashMap<Option<String>, reqwest::Client>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout_secs: Option<u64>) -> Self {
        Self {
            clients: DashMap::new(),
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client> {
        let key = proxy.map(|p| p.to_string());
        if let Some(existing) = self.clients.get(&key) {
            return Ok(existing.clone());
        }
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(p) = proxy {
            let proxy = reqwest::Proxy::all(p).map_err(|e| ClientError::Transport(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    #[instrument(skip(self, request))]
    pub async fn send(
        &self,
        request: reqwest::RequestBuilder,
        proxy: Option<&str>,
    ) -> Result<reqwest::Response> {
        // `request` is already bound to a client, but we still route through
        // `client_for` so future calls benefit from the cached proxy client —
        // callers build requests via `Dispatcher::request` below.
        let _ = self.client_for(proxy)?;
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout {
                    url: e.url().map(|u| u.to_string()).unwrap_or_default(),
                    ms: self.timeout.as_millis() as u64,
                }
            } else {
                ClientError::Transport(e.to_string())
            }
        })
    }

    pub fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        proxy: Option<&str>,
    ) -> Result<reqwest::RequestBuilder> {
        let client = self.client_for(proxy)?;
        Ok(client.request(method, url))
    }

    /// Reads `response`'s body as a stream, aborting once more than
    /// `max_bytes` have arrived — `reqwest` has no native cap on response
    /// size, so this accumulates chunk-by-chunk instead of calling
    /// `.bytes()` directly.
    pub async fn read_capped(response: reqwest::Response, max_bytes: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transport(e.to_string()))?;
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 > max_bytes {
                return Err(ClientError::BodyTooLarge { max: max_bytes });
            }
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatcher_reuses_client_for_same_proxy_key() {
        let d = Dispatcher::new(Some(5));
        let _ = d.client_for(None).unwrap();
        let _ = d.client_for(None).unwrap();
        assert_eq!(d.clients.len(), 1);
    }

    #[tokio::test]
    async fn dispatcher_caches_distinct_clients_per_proxy() {
        let d = Dispatcher::new(Some(5));
        let _ = d.client_for(None).unwrap();
        let _ = d.client_for(Some("http://127.0.0.1:8888")).unwrap();
        assert_eq!(d.clients.len(), 2);
    }
}
