//! Application webhook handler: GET echo verification, POST XML decrypt +
//! dedupe + media fetch, admission into the shared conversation queue — the
//! same debounce/batch machinery the Bot channel uses; the flush handler,
//! not this crate, invokes the agent.

use std::sync::Arc;

use epgate_client::{OutboundClient, TokenFetcher};
use epgate_core::runtime::MediaSink;
use epgate_core::types::{ChatType, ConversationKey, ResolvedAccount};
use epgate_store::{ConversationStore, FlushHandler};
use tracing::{instrument, warn};

use crate::dedupe::DedupeCache;
use crate::error::{AppError, Result};
use crate::message::{self, InboundPayload};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const PREVIEW_MAX_CHARS: usize = 12_000;
const SNIFF_WINDOW: usize = 4096;
const TEXT_RATIO_THRESHOLD: f64 = 0.98;

pub struct AppQuery {
    pub timestamp: String,
    pub nonce: String,
    pub msg_signature: String,
}

fn find_account<'a>(accounts: &'a [ResolvedAccount], query: &AppQuery, encrypt: &str) -> Option<&'a ResolvedAccount> {
    accounts
        .iter()
        .find(|a| epgate_crypto::signature::verify(&a.token, &query.timestamp, &query.nonce, encrypt, &query.msg_signature))
}

pub struct AppHandler<H: FlushHandler + 'static, F: TokenFetcher> {
    store: Arc<ConversationStore<H>>,
    dedupe: Arc<DedupeCache>,
    media: Arc<dyn MediaSink>,
    outbound: Arc<OutboundClient<F>>,
    debounce_ms: u64,
}

impl<H: FlushHandler + 'static, F: TokenFetcher> AppHandler<H, F> {
    pub fn new(
        store: Arc<ConversationStore<H>>,
        dedupe: Arc<DedupeCache>,
        media: Arc<dyn MediaSink>,
        outbound: Arc<OutboundClient<F>>,
        debounce_ms: u64,
    ) -> Self {
        Self { store, dedupe, media, outbound, debounce_ms }
    }

    /// GET verification: decrypt `echostr` and return the plaintext.
    #[instrument(skip(self, accounts, echostr))]
    pub fn handle_get(&self, accounts: &[ResolvedAccount], query: &AppQuery, echostr: &str) -> Result<String> {
        let account = find_account(accounts, query, echostr).ok_or(AppError::SignatureMismatch)?;
        let plaintext = epgate_crypto::cipher::decrypt(&account.encoding_aes_key, &account.corp_id, echostr)
            .map_err(|e| AppError::Decrypt(e.to_string()))?;
        Ok(String::from_utf8_lossy(&plaintext).to_string())
    }

    /// POST message: always responds `"success"` once admission completes.
    /// Replies go out through the outbound API, not the passive channel.
    #[instrument(skip(self, accounts, body))]
    pub async fn handle_post(&self, accounts: &[ResolvedAccount], query: &AppQuery, body: &[u8]) -> Result<&'static str> {
        if body.len() > MAX_BODY_BYTES {
            return Err(AppError::BodyTooLarge { size: body.len(), max: MAX_BODY_BYTES });
        }
        let envelope = message::parse_envelope(body)?;
        let account = find_account(accounts, query, &envelope.encrypt).ok_or(AppError::SignatureMismatch)?;
        let plaintext = epgate_crypto::cipher::decrypt(&account.encoding_aes_key, &account.corp_id, &envelope.encrypt)
            .map_err(|e| AppError::Decrypt(e.to_string()))?;
        let raw = message::parse_message(&plaintext)?;
        let msg = raw.into_inbound();

        if let Some(msg_id) = &msg.msg_id {
            if self.dedupe.seen_recently(msg_id) {
                return Ok("success");
            }
        }

        let content = self.build_inbound_body(account, &msg).await;
        let user_id = msg.from_user_name.clone().unwrap_or_default();
        // `"app"` rather than `"direct"` keeps an account+user's Application-DM
        // conversation in its own queue, separate from their Bot direct chat;
        // the driver also reads this suffix back to tell the two channels
        // apart when a flushed batch has no other channel marker.
        let conversation_key = ConversationKey::build(&account.name, &user_id.clone().into(), "app");

        let (stream_id, _status) = self.store.add_pending_message(
            conversation_key,
            msg.msg_id.clone(),
            content,
            user_id.into(),
            ChatType::Direct,
            None,
            self.debounce_ms,
        );
        if let Some(mut stream) = self.store.stream_mut(&stream_id) {
            stream.started = true;
        }

        Ok("success")
    }

    /// Builds the raw agent body for an Application-channel message,
    /// downloading and previewing any attached media along the way.
    async fn build_inbound_body(&self, account: &ResolvedAccount, msg: &message::InboundMessage) -> String {
        match &msg.payload {
            InboundPayload::Text { content } => content.clone(),
            InboundPayload::Link { title, description, url } => format!(
                "[link] {} {} {}",
                title.clone().unwrap_or_default(),
                description.clone().unwrap_or_default(),
                url.clone().unwrap_or_default(),
            ),
            InboundPayload::Location { x, y, label } => format!(
                "[location] {} ({}, {})",
                label.clone().unwrap_or_default(),
                x.clone().unwrap_or_default(),
                y.clone().unwrap_or_default(),
            ),
            InboundPayload::Event { event, event_key } => {
                format!("[event] {event} {}", event_key.clone().unwrap_or_default())
            }
            InboundPayload::Unknown { msg_type } => format!("[unknown:{msg_type}]"),
            InboundPayload::Image { .. } | InboundPayload::Voice { .. } | InboundPayload::Video { .. } | InboundPayload::File { .. } => {
                self.describe_media(account, msg).await
            }
        }
    }

    async fn describe_media(&self, account: &ResolvedAccount, msg: &message::InboundMessage) -> String {
        let kind_tag = match &msg.payload {
            InboundPayload::Image { .. } => "image",
            InboundPayload::Voice { .. } => "voice",
            InboundPayload::Video { .. } => "video",
            InboundPayload::File { .. } => "file",
            _ => unreachable!("describe_media only called for media payloads"),
        };
        let Some(media_id) = msg.payload.media_id() else {
            return format!("[{kind_tag}]");
        };

        let downloaded = match self
            .outbound
            .download_media(&account.corp_id, &account.app_id, &account.secret, media_id)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, media_id, "application media download failed");
                return format!("[{kind_tag}] <download failed>");
            }
        };

        let file_name = match &msg.payload {
            InboundPayload::File { file_name, .. } => file_name.clone(),
            _ => None,
        }
        .or(downloaded.filename.clone());

        let content_type = infer_content_type(downloaded.content_type.as_deref(), file_name.as_deref(), &downloaded.buffer);

        let saved_path = match self
            .media
            .save(&downloaded.buffer, Some(&content_type), file_name.as_deref())
            .await
        {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, media_id, "application media sink save failed");
                return format!("[{kind_tag}] <save failed>");
            }
        };

        if is_text_like(&content_type) {
            let preview = preview_text(&downloaded.buffer);
            format!("[{kind_tag}] {saved_path}\n\n{preview}")
        } else {
            format!(
                "[{kind_tag}] {saved_path}\n\n(binary attachment — extractable preview formats: txt, md, json, csv, log, yaml, toml)"
            )
        }
    }
}

/// Prefers the server-reported content-type; for ambiguous/file payloads,
/// sniffs the first 4 KiB and falls back to extension-based text/markdown
/// detection.
fn infer_content_type(server_header: Option<&str>, file_name: Option<&str>, bytes: &[u8]) -> String {
    if let Some(ct) = server_header {
        let bare = ct.split(';').next().unwrap_or(ct).trim();
        if !bare.is_empty() && bare != "application/octet-stream" {
            return bare.to_string();
        }
    }
    if looks_like_text(bytes) {
        let ext = file_name.and_then(|n| n.rsplit('.').next()).unwrap_or("").to_ascii_lowercase();
        if ext == "md" || ext == "markdown" {
            return "text/markdown".to_string();
        }
        return "text/plain".to_string();
    }
    "application/octet-stream".to_string()
}

fn looks_like_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    let printable = window
        .iter()
        .filter(|&&b| b == b'\t' || b == b'\n' || b == b'\r' || (0x20..=0x7e).contains(&b))
        .count();
    (printable as f64) / (window.len() as f64) >= TEXT_RATIO_THRESHOLD
}

fn is_text_like(content_type: &str) -> bool {
    content_type.starts_with("text/") || content_type == "application/json"
}

fn preview_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        text.into_owned()
    } else {
        text.chars().take(PREVIEW_MAX_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epgate_client::http::Dispatcher;
    use epgate_client::TokenCache;
    use std::sync::Mutex as StdMutex;

    struct NoopFlush;

    #[async_trait::async_trait]
    impl FlushHandler for NoopFlush {
        async fn flush(&self, _batch: epgate_core::types::PendingInbound) {}
    }

    struct StubTokenFetcher;

    #[async_trait::async_trait]
    impl TokenFetcher for StubTokenFetcher {
        async fn fetch(&self, _corp_id: &str, _secret: &str) -> epgate_client::Result<(String, i64)> {
            Ok(("tok".to_string(), 7200))
        }
    }

    struct RecordingMediaSink {
        saved: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MediaSink for RecordingMediaSink {
        async fn save(&self, bytes: &[u8], _content_type: Option<&str>, suggested_name: Option<&str>) -> std::result::Result<String, String> {
            let name = suggested_name.unwrap_or("unnamed").to_string();
            self.saved.lock().unwrap().push(name.clone());
            Ok(format!("/media/{name} ({} bytes)", bytes.len()))
        }
    }

    fn account() -> ResolvedAccount {
        ResolvedAccount {
            name: "acct".into(),
            corp_id: "corp1".into(),
            app_id: "1000002".into(),
            secret: "secret".into(),
            token: "QDG6eK".into(),
            encoding_aes_key: "jWmYm7qr5nMoAEWo9FjciXYzjxM4OmKrPG1PGIoQJSv".into(),
            welcome_text: None,
            stream_placeholder_content: "1".into(),
            application_dm_configured: false,
        }
    }

    fn handler() -> AppHandler<NoopFlush, StubTokenFetcher> {
        let store = ConversationStore::new(std::sync::Arc::new(NoopFlush));
        let dedupe = std::sync::Arc::new(DedupeCache::new());
        let media: std::sync::Arc<dyn MediaSink> = std::sync::Arc::new(RecordingMediaSink { saved: StdMutex::new(Vec::new()) });
        let dispatcher = std::sync::Arc::new(Dispatcher::new(None));
        let tokens = std::sync::Arc::new(TokenCache::new(StubTokenFetcher));
        let outbound = std::sync::Arc::new(OutboundClient::new(dispatcher, tokens, "https://example.invalid"));
        AppHandler::new(store, dedupe, media, outbound, 50)
    }

    fn signed_query(account: &ResolvedAccount, timestamp: &str, nonce: &str, encrypt: &str) -> AppQuery {
        let msg_signature = epgate_crypto::signature::compute(&account.token, timestamp, nonce, encrypt);
        AppQuery {
            timestamp: timestamp.to_string(),
            nonce: nonce.to_string(),
            msg_signature,
        }
    }

    #[test]
    fn get_verification_decrypts_echostr() {
        let h = handler();
        let acct = account();
        let echostr = epgate_crypto::cipher::encrypt(&acct.encoding_aes_key, &acct.corp_id, b"hello-echo").unwrap();
        let query = signed_query(&acct, "1234567890", "nonce1", &echostr);
        let accounts = vec![acct];
        let plaintext = h.handle_get(&accounts, &query, &echostr).unwrap();
        assert_eq!(plaintext, "hello-echo");
    }

    #[test]
    fn get_verification_rejects_bad_signature() {
        let h = handler();
        let acct = account();
        let echostr = epgate_crypto::cipher::encrypt(&acct.encoding_aes_key, &acct.corp_id, b"hello-echo").unwrap();
        let query = AppQuery {
            timestamp: "1234567890".into(),
            nonce: "nonce1".into(),
            msg_signature: "deadbeef".into(),
        };
        let accounts = vec![acct];
        let err = h.handle_get(&accounts, &query, &echostr).unwrap_err();
        assert!(matches!(err, AppError::SignatureMismatch));
    }

    #[tokio::test]
    async fn post_admits_text_message_and_returns_success() {
        let h = handler();
        let acct = account();
        let xml = r#"<xml>
            <FromUserName><![CDATA[user1]]></FromUserName>
            <MsgType><![CDATA[text]]></MsgType>
            <Content><![CDATA[hello there]]></Content>
            <MsgId>100</MsgId>
        </xml>"#;
        let encrypt = epgate_crypto::cipher::encrypt(&acct.encoding_aes_key, &acct.corp_id, xml.as_bytes()).unwrap();
        let body = format!(r#"<xml><ToUserName><![CDATA[toUser]]></ToUserName><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>"#);
        let query = signed_query(&acct, "1234567890", "nonce1", &encrypt);
        let accounts = vec![acct];
        let result = h.handle_post(&accounts, &query, body.as_bytes()).await.unwrap();
        assert_eq!(result, "success");
    }

    #[tokio::test]
    async fn post_dedupes_repeated_msg_id() {
        let h = handler();
        let acct = account();
        let xml = r#"<xml>
            <FromUserName><![CDATA[user1]]></FromUserName>
            <MsgType><![CDATA[text]]></MsgType>
            <Content><![CDATA[hello there]]></Content>
            <MsgId>dup-1</MsgId>
        </xml>"#;
        let encrypt = epgate_crypto::cipher::encrypt(&acct.encoding_aes_key, &acct.corp_id, xml.as_bytes()).unwrap();
        let body = format!(r#"<xml><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>"#);
        let query = signed_query(&acct, "1234567890", "nonce1", &encrypt);
        let accounts = vec![acct];

        h.handle_post(&accounts, &query, body.as_bytes()).await.unwrap();
        h.handle_post(&accounts, &query, body.as_bytes()).await.unwrap();
        assert_eq!(h.dedupe.len(), 1);
    }

    #[tokio::test]
    async fn post_rejects_oversized_body() {
        let h = handler();
        let big = vec![0u8; MAX_BODY_BYTES + 1];
        let accounts = vec![account()];
        let query = AppQuery { timestamp: "1".into(), nonce: "n".into(), msg_signature: "s".into() };
        let err = h.handle_post(&accounts, &query, &big).await.unwrap_err();
        assert!(matches!(err, AppError::BodyTooLarge { .. }));
    }

    #[test]
    fn infer_prefers_server_header() {
        let ct = infer_content_type(Some("image/png"), Some("a.png"), b"\x89PNG");
        assert_eq!(ct, "image/png");
    }

    #[test]
    fn infer_sniffs_plain_text_as_text() {
        let body = b"hello world, this is plain text content for a file\n";
        let ct = infer_content_type(None, Some("notes.txt"), body);
        assert_eq!(ct, "text/plain");
    }

    #[test]
    fn infer_sniffs_markdown_extension() {
        let body = b"# Title\n\nsome body text\n";
        let ct = infer_content_type(None, Some("README.md"), body);
        assert_eq!(ct, "text/markdown");
    }

    #[test]
    fn infer_treats_binary_as_octet_stream() {
        let body: Vec<u8> = (0..=255u8).collect();
        let ct = infer_content_type(None, Some("blob.bin"), &body);
        assert_eq!(ct, "application/octet-stream");
    }

    #[test]
    fn preview_truncates_to_char_cap() {
        let body = "x".repeat(20_000);
        let preview = preview_text(body.as_bytes());
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS);
    }
}
