//! Passive-reply URL store: keeps the URL EP gave us for proactive stream
//! updates, and brokers every use of it through one place so
//! `usedAt`/`lastError` bookkeeping can't be skipped by a caller.

use std::future::Future;

use chrono::Utc;
use dashmap::DashMap;
use epgate_core::types::{StreamId, ACTIVE_REPLY_TTL_SECS};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyUrlPolicy {
    Once,
    Multi,
}

pub struct ActiveReplyEntry {
    pub response_url: String,
    pub proxy_url: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub used_at: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<String>,
    pub policy: ReplyUrlPolicy,
}

/// Always runs under `policy = Multi` at runtime — `Once` is modeled
/// because the data shape names it, but nothing in this gateway selects it.
pub struct ActiveReplyStore {
    entries: DashMap<StreamId, ActiveReplyEntry>,
}

impl Default for ActiveReplyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveReplyStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn store(&self, stream_id: StreamId, response_url: String, proxy_url: Option<String>) {
        self.entries.insert(
            stream_id,
            ActiveReplyEntry {
                response_url,
                proxy_url,
                created_at: Utc::now(),
                used_at: None,
                last_error: None,
                policy: ReplyUrlPolicy::Multi,
            },
        );
    }

    pub fn get_url(&self, stream_id: &StreamId) -> Option<(String, Option<String>)> {
        self.entries
            .get(stream_id)
            .map(|e| (e.response_url.clone(), e.proxy_url.clone()))
    }

    /// Invokes `f` with `(responseUrl, proxyUrl)`, recording `usedAt` on
    /// success and `lastError` (re-raising) on failure.
    pub async fn use_url<Fut, T>(
        &self,
        stream_id: &StreamId,
        f: impl FnOnce(String, Option<String>) -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, String>>,
    {
        let (url, proxy) = self
            .get_url(stream_id)
            .ok_or_else(|| StoreError::NoActiveReplyUrl(stream_id.to_string()))?;

        match f(url, proxy).await {
            Ok(value) => {
                if let Some(mut entry) = self.entries.get_mut(stream_id) {
                    entry.used_at = Some(Utc::now());
                }
                Ok(value)
            }
            Err(err) => {
                if let Some(mut entry) = self.entries.get_mut(stream_id) {
                    entry.last_error = Some(err.clone());
                }
                Err(StoreError::ActiveReplyDispatch(err))
            }
        }
    }

    pub fn prune_expired(&self, now: chrono::DateTime<Utc>) {
        self.entries.retain(|_, e| {
            (now - e.created_at).num_seconds() as u64 <= ACTIVE_REPLY_TTL_SECS
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn use_url_records_used_at_on_success() {
        let store = ActiveReplyStore::new();
        let id = StreamId::generate();
        store.store(id.clone(), "https://ep.example/callback".into(), None);

        let result = store
            .use_url(&id, |_url, _proxy| async { Ok::<_, String>(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert!(store.entries.get(&id).unwrap().used_at.is_some());
    }

    #[tokio::test]
    async fn use_url_records_and_reraises_error() {
        let store = ActiveReplyStore::new();
        let id = StreamId::generate();
        store.store(id.clone(), "https://ep.example/callback".into(), None);

        let err = store
            .use_url(&id, |_url, _proxy| async { Err::<(), _>("boom".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACTIVE_REPLY_DISPATCH_FAILED");
        assert_eq!(store.entries.get(&id).unwrap().last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn use_url_fails_for_unknown_stream() {
        let store = ActiveReplyStore::new();
        let id = StreamId::generate();
        let err = store
            .use_url(&id, |_url, _proxy| async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_ACTIVE_REPLY_URL");
    }
}
