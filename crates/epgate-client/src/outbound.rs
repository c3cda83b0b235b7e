//! Outbound API client: sendText, uploadMedia, sendMedia, downloadMedia, all
//! addressed via [`Addressing`] and routed through the shared [`Dispatcher`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use crate::error::{ClientError, Result};
use crate::http::Dispatcher;
use crate::media::{self, MediaKind};
use crate::token::{TokenCache, TokenFetcher};

const DEFAULT_MEDIA_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Non-chat addressing is `{toUser, toParty, toTag}` (any subset); chat
/// addressing is `{chatId}` alone — the two forms are mutually exclusive.
#[derive(Debug, Clone)]
pub enum Addressing {
    NonChat {
        to_user: Option<String>,
        to_party: Option<String>,
        to_tag: Option<String>,
    },
    Chat { chat_id: String },
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    invaliduser: Option<String>,
    #[serde(default)]
    invalidparty: Option<String>,
    #[serde(default)]
    invalidtag: Option<String>,
    #[serde(default)]
    media_id: Option<String>,
}

impl ApiEnvelope {
    fn invalid_recipients(&self) -> Vec<String> {
        [&self.invaliduser, &self.invalidparty, &self.invalidtag]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }

    fn into_result(self, target_desc: &str) -> Result<ApiEnvelope> {
        if self.errcode != 0 {
            return Err(ClientError::Upstream {
                errcode: self.errcode,
                errmsg: self.errmsg,
            });
        }
        let invalid = self.invalid_recipients();
        if !invalid.is_empty() {
            return Err(ClientError::PartialFailure {
                target: target_desc.to_string(),
                invalid,
            });
        }
        Ok(self)
    }
}

#[derive(Debug)]
pub struct DownloadedMedia {
    pub buffer: Vec<u8>,
    pub content_type: Option<String>,
    pub filename: Option<String>,
}

pub struct OutboundClient<F: TokenFetcher> {
    dispatcher: Arc<Dispatcher>,
    tokens: Arc<TokenCache<F>>,
    base_url: String,
    media_max_bytes: u64,
}

impl<F: TokenFetcher> OutboundClient<F> {
    pub fn new(dispatcher: Arc<Dispatcher>, tokens: Arc<TokenCache<F>>, base_url: impl Into<String>) -> Self {
        Self {
            dispatcher,
            tokens,
            base_url: base_url.into(),
            media_max_bytes: DEFAULT_MEDIA_MAX_BYTES,
        }
    }

    pub fn with_media_max_bytes(mut self, max: u64) -> Self {
        self.media_max_bytes = max;
        self
    }

    async fn token(&self, corp_id: &str, app_id: &str, secret: &str) -> Result<String> {
        self.tokens
            .get(corp_id, app_id, secret)
            .await
            .map_err(|e| ClientError::TokenRefresh(e.to_string()))
    }

    fn addressing_json(addressing: &Addressing) -> (Value, String) {
        match addressing {
            Addressing::NonChat { to_user, to_party, to_tag } => {
                let mut obj = serde_json::Map::new();
                if let Some(v) = to_user {
                    obj.insert("touser".into(), json!(v));
                }
                if let Some(v) = to_party {
                    obj.insert("toparty".into(), json!(v));
                }
                if let Some(v) = to_tag {
                    obj.insert("totag".into(), json!(v));
                }
                let desc = format!("{to_user:?}/{to_party:?}/{to_tag:?}");
                (Value::Object(obj), desc)
            }
            Addressing::Chat { chat_id } => (json!({ "chatid": chat_id }), chat_id.clone()),
        }
    }

    #[instrument(skip(self, corp_id, app_id, secret, content))]
    pub async fn send_text(
        &self,
        corp_id: &str,
        app_id: &str,
        secret: &str,
        addressing: &Addressing,
        content: &str,
    ) -> Result<()> {
        let token = self.token(corp_id, app_id, secret).await?;
        let (mut body, desc) = Self::addressing_json(addressing);
        let endpoint = match addressing {
            Addressing::NonChat { .. } => "cgi-bin/message/send",
            Addressing::Chat { .. } => "cgi-bin/appchat/send",
        };
        let obj = body.as_object_mut().expect("addressing_json returns an object");
        obj.insert("msgtype".into(), json!("text"));
        obj.insert("agentid".into(), json!(app_id));
        obj.insert("text".into(), json!({ "content": content }));

        let url = format!("{}/{endpoint}?access_token={token}", self.base_url);
        let request = self
            .dispatcher
            .request(reqwest::Method::POST, &url, None)?
            .json(&body);
        let response = self.dispatcher.send(request, None).await?;
        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        envelope.into_result(&desc)?;
        Ok(())
    }

    #[instrument(skip(self, corp_id, app_id, secret, bytes))]
    pub async fn upload_media(
        &self,
        corp_id: &str,
        app_id: &str,
        secret: &str,
        kind: MediaKind,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let token = self.token(corp_id, app_id, secret).await?;
        let (multipart_content_type, body) = media::build_multipart_body(filename, content_type, bytes);

        let url = format!(
            "{}/cgi-bin/media/upload?type={}&debug=1&access_token={token}",
            self.base_url,
            kind.as_query_value()
        );
        let request = self
            .dispatcher
            .request(reqwest::Method::POST, &url, None)?
            .header("Content-Type", multipart_content_type)
            .body(body);
        let response = self.dispatcher.send(request, None).await?;
        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        let envelope = envelope.into_result(filename)?;
        envelope
            .media_id
            .ok_or_else(|| ClientError::InvalidResponse("missing media_id in upload response".into()))
    }

    #[instrument(skip(self, corp_id, app_id, secret, payload))]
    pub async fn send_media(
        &self,
        corp_id: &str,
        app_id: &str,
        secret: &str,
        addressing: &Addressing,
        msgtype: &str,
        payload: Value,
    ) -> Result<()> {
        let token = self.token(corp_id, app_id, secret).await?;
        let (mut body, desc) = Self::addressing_json(addressing);
        let endpoint = match addressing {
            Addressing::NonChat { .. } => "cgi-bin/message/send",
            Addressing::Chat { .. } => "cgi-bin/appchat/send",
        };
        let obj = body.as_object_mut().expect("addressing_json returns an object");
        obj.insert("msgtype".into(), json!(msgtype));
        obj.insert("agentid".into(), json!(app_id));
        obj.insert(msgtype.to_string(), payload);

        let url = format!("{}/{endpoint}?access_token={token}", self.base_url);
        let request = self
            .dispatcher
            .request(reqwest::Method::POST, &url, None)?
            .json(&body);
        let response = self.dispatcher.send(request, None).await?;
        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        envelope.into_result(&desc)?;
        Ok(())
    }

    #[instrument(skip(self, corp_id, app_id, secret))]
    pub async fn download_media(
        &self,
        corp_id: &str,
        app_id: &str,
        secret: &str,
        media_id: &str,
    ) -> Result<DownloadedMedia> {
        let token = self.token(corp_id, app_id, secret).await?;
        let url = format!("{}/cgi-bin/media/get?media_id={media_id}&access_token={token}", self.base_url);
        let request = self.dispatcher.request(reqwest::Method::GET, &url, None)?;
        let response = self.dispatcher.send(request, None).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if content_type.as_deref().is_some_and(|ct| ct.starts_with("application/json")) {
            let envelope: ApiEnvelope = response
                .json()
                .await
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
            envelope.into_result(media_id)?;
            return Err(ClientError::InvalidResponse(
                "media/get returned a success JSON body with no binary payload".into(),
            ));
        }

        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(media::filename_from_content_disposition);

        let buffer = Dispatcher::read_capped(response, self.media_max_bytes).await?;
        Ok(DownloadedMedia {
            buffer,
            content_type,
            filename,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct VideoPayload {
    pub media_id: String,
    pub title: String,
    pub description: String,
}

impl VideoPayload {
    pub fn new(media_id: impl Into<String>, title: Option<String>, description: Option<String>) -> Self {
        Self {
            media_id: media_id.into(),
            title: title.unwrap_or_else(|| "Video".to_string()),
            description: description.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_payload_applies_defaults() {
        let p = VideoPayload::new("mid", None, None);
        assert_eq!(p.title, "Video");
        assert_eq!(p.description, "");
    }

    #[test]
    fn addressing_json_is_exclusive_between_chat_and_nonchat() {
        let (chat, _) = OutboundClient::<crate::token::HttpTokenFetcher>::addressing_json(&Addressing::Chat {
            chat_id: "wrabc".into(),
        });
        assert!(chat.get("chatid").is_some());
        assert!(chat.get("touser").is_none());

        let (nonchat, _) = OutboundClient::<crate::token::HttpTokenFetcher>::addressing_json(&Addressing::NonChat {
            to_user: Some("u1".into()),
            to_party: None,
            to_tag: None,
        });
        assert!(nonchat.get("touser").is_some());
        assert!(nonchat.get("chatid").is_none());
    }
}
