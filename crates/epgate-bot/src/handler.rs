//! Bot webhook handler: path-based dispatch across registered accounts,
//! GET echo verification, and POST message admission.

use std::sync::Arc;

use epgate_core::types::{
    AdmissionStatus, ChatId, ChatType, ConversationKey, ResolvedAccount, StreamId, StreamImage,
};
use epgate_store::{ActiveReplyStore, ConversationStore, FlushHandler};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::{BotError, Result};
use crate::message::{self, ChatTypeField, InboundMessage, InboundPayload};
use crate::reply::{self, MAX_BODY_BYTES};

const QUEUED_PLACEHOLDER: &str = "已收到，已排队处理中...";
const MERGED_PLACEHOLDER: &str = "已收到，已合并排队处理中...";

pub struct BotQuery {
    pub timestamp: String,
    pub nonce: String,
    pub msg_signature: String,
}

/// Finds the first configured account whose signature verifies — accounts
/// are tried in registration order, matching the "first whose
/// signature-verification succeeds" dispatch rule.
pub fn find_account<'a>(accounts: &'a [ResolvedAccount], query: &BotQuery, encrypt: &str) -> Option<&'a ResolvedAccount> {
    accounts
        .iter()
        .find(|a| epgate_crypto::signature::verify(&a.token, &query.timestamp, &query.nonce, encrypt, &query.msg_signature))
}

pub struct BotHandler<H: FlushHandler + 'static> {
    pub store: Arc<ConversationStore<H>>,
    pub active_replies: Arc<ActiveReplyStore>,
    pub debounce_ms: u64,
}

impl<H: FlushHandler + 'static> BotHandler<H> {
    pub fn new(store: Arc<ConversationStore<H>>, active_replies: Arc<ActiveReplyStore>, debounce_ms: u64) -> Self {
        Self { store, active_replies, debounce_ms }
    }

    /// Registers `msg`'s `response_url`, if present, against `stream_id` so
    /// the agent driver can push proactive updates later (timeout/media
    /// fallback, final image frame).
    fn remember_response_url(&self, stream_id: &StreamId, msg: &InboundMessage) {
        if let Some(url) = &msg.response_url {
            self.active_replies.store(stream_id.clone(), url.clone(), None);
        }
    }

    /// GET verification: decrypt `echostr` and return the plaintext.
    #[instrument(skip(self, accounts, echostr))]
    pub fn handle_get(&self, accounts: &[ResolvedAccount], query: &BotQuery, echostr: &str) -> Result<String> {
        let account = find_account(accounts, query, echostr).ok_or(BotError::SignatureMismatch)?;
        let plaintext = epgate_crypto::cipher::decrypt(&account.encoding_aes_key, &account.corp_id, echostr)
            .map_err(|e| BotError::Decrypt(e.to_string()))?;
        Ok(String::from_utf8_lossy(&plaintext).to_string())
    }

    /// POST message: returns the encrypted JSON reply body.
    #[instrument(skip(self, accounts, body))]
    pub async fn handle_post(&self, accounts: &[ResolvedAccount], query: &BotQuery, body: &[u8]) -> Result<Value> {
        if body.len() > MAX_BODY_BYTES {
            return Err(BotError::BodyTooLarge { size: body.len(), max: MAX_BODY_BYTES });
        }
        let envelope: Value = serde_json::from_slice(body).map_err(|e| BotError::InvalidPayload(e.to_string()))?;
        let encrypt = envelope
            .get("encrypt")
            .or_else(|| envelope.get("Encrypt"))
            .and_then(Value::as_str)
            .ok_or_else(|| BotError::InvalidPayload("missing encrypt field".into()))?;

        let account = find_account(accounts, query, encrypt).ok_or(BotError::SignatureMismatch)?;
        let plaintext = epgate_crypto::cipher::decrypt(&account.encoding_aes_key, &account.corp_id, encrypt)
            .map_err(|e| BotError::Decrypt(e.to_string()))?;
        let inner: Value = serde_json::from_slice(&plaintext).map_err(|e| BotError::InvalidPayload(e.to_string()))?;
        let msg = message::parse_inbound_message(&inner);

        self.dispatch(account, query, &msg).await
    }

    async fn dispatch(&self, account: &ResolvedAccount, query: &BotQuery, msg: &InboundMessage) -> Result<Value> {
        match &msg.payload {
            InboundPayload::Event { eventtype, raw } if eventtype == "template_card_event" => {
                self.handle_template_card_event(account, query, msg, raw).await
            }
            InboundPayload::Event { eventtype, .. } if eventtype == "enter_chat" => {
                self.handle_enter_chat(account, query, msg.ai_bot_id.as_deref()).await
            }
            InboundPayload::Stream { id } => self.handle_stream_refresh(account, query, id),
            _ => self.handle_admission(account, query, msg).await,
        }
    }

    async fn handle_template_card_event(
        &self,
        account: &ResolvedAccount,
        query: &BotQuery,
        msg: &InboundMessage,
        raw: &Value,
    ) -> Result<Value> {
        if let Some(msg_id) = &msg.msg_id {
            if let Some(existing) = self.store.stream_for_msg_id(msg_id) {
                return self.placeholder_reply(account, query, &existing);
            }
        }

        let synthetic = synthesize_template_card_text(raw);
        let user_id = msg.from_user_id.clone().unwrap_or_default();
        let chat_type = to_chat_type(msg.chat_type);
        let chat_id = msg.chat_id.clone().map(ChatId::from);
        let conversation_key = ConversationKey::build(&account.name, &user_id.clone().into(), chat_id.as_ref().map(ChatId::as_str).unwrap_or("direct"));

        // Template-card events bypass the debounce window entirely — the
        // interaction already happened, there is nothing to coalesce.
        let (stream_id, _status) = self.store.add_pending_message(
            conversation_key.clone(),
            msg.msg_id.clone(),
            synthetic,
            user_id.into(),
            chat_type,
            chat_id,
            0,
        );
        if let Some(mut stream) = self.store.stream_mut(&stream_id) {
            stream.started = true;
        }
        self.remember_response_url(&stream_id, msg);
        let batch_key = self
            .store
            .stream(&stream_id)
            .map(|s| s.batch_key.clone())
            .unwrap_or(epgate_core::types::BatchKey(conversation_key.0));
        self.store.request_flush(batch_key).await;
        reply::seal_empty(&account.encoding_aes_key, &account.token, &account.corp_id, &query.timestamp, &query.nonce)
            .map_err(Into::into)
    }

    async fn handle_enter_chat(&self, account: &ResolvedAccount, query: &BotQuery, _ai_bot_id: Option<&str>) -> Result<Value> {
        let text = account.welcome_text.clone().unwrap_or_default();
        let payload = serde_json::json!({ "msgtype": "text", "text": { "content": text } });
        reply::seal_reply(&account.encoding_aes_key, &account.token, &account.corp_id, &query.timestamp, &query.nonce, &payload)
            .map_err(Into::into)
    }

    fn handle_stream_refresh(&self, account: &ResolvedAccount, query: &BotQuery, stream_id: &str) -> Result<Value> {
        let id = StreamId(stream_id.to_string());
        let stream = self.store.stream(&id);
        let payload = match stream {
            Some(s) => reply::stream_payload(&s),
            None => serde_json::json!({ "msgtype": "stream", "stream": { "id": stream_id, "finish": true, "content": "" } }),
        };
        reply::seal_reply(&account.encoding_aes_key, &account.token, &account.corp_id, &query.timestamp, &query.nonce, &payload)
            .map_err(Into::into)
    }

    async fn handle_admission(&self, account: &ResolvedAccount, query: &BotQuery, msg: &InboundMessage) -> Result<Value> {
        if let Some(msg_id) = &msg.msg_id {
            if let Some(existing) = self.store.stream_for_msg_id(msg_id) {
                return self.placeholder_reply(account, query, &existing);
            }
        }

        let content = build_inbound_body(msg);
        let user_id = msg.from_user_id.clone().unwrap_or_default();
        let chat_type = to_chat_type(msg.chat_type);
        let chat_id = msg.chat_id.clone().map(ChatId::from);
        let conversation_key = ConversationKey::build(
            &account.name,
            &user_id.clone().into(),
            chat_id.as_ref().map(ChatId::as_str).unwrap_or("direct"),
        );

        let (stream_id, status) = self.store.add_pending_message(
            conversation_key.clone(),
            msg.msg_id.clone(),
            content,
            user_id.clone().into(),
            chat_type,
            chat_id.clone(),
            self.debounce_ms,
        );
        self.remember_response_url(&stream_id, msg);

        match status {
            AdmissionStatus::ActiveNew => {
                if let Some(mut stream) = self.store.stream_mut(&stream_id) {
                    stream.set_content_frame(&account.stream_placeholder_content);
                }
                self.placeholder_reply(account, query, &stream_id)
            }
            AdmissionStatus::QueuedNew => {
                if let Some(mut stream) = self.store.stream_mut(&stream_id) {
                    stream.set_content_frame(QUEUED_PLACEHOLDER);
                }
                self.placeholder_reply(account, query, &stream_id)
            }
            AdmissionStatus::ActiveMerged | AdmissionStatus::QueuedMerged => {
                // `stream_id` here is the batch this message merged into
                // (returned by `add_pending_message`), so its own
                // `batch_key` is authoritative — it may be either the
                // initial batch or a promoted queued batch (Case C).
                let batch_key = self
                    .store
                    .stream(&stream_id)
                    .map(|s| s.batch_key.clone())
                    .unwrap_or_else(|| epgate_core::types::BatchKey(conversation_key.0.clone()));
                let ack_id = StreamId::generate();
                let mut ack_stream = epgate_core::types::StreamState::new(
                    ack_id.clone(),
                    conversation_key.clone(),
                    batch_key.clone(),
                    user_id.into(),
                    chat_type,
                    chat_id,
                );
                ack_stream.started = true;
                ack_stream.set_content_frame(MERGED_PLACEHOLDER);
                self.store.insert_stream(ack_stream);
                self.store.add_ack_stream_for_batch(batch_key, ack_id.clone());
                if let Some(msg_id) = &msg.msg_id {
                    self.store.map_msg_id(msg_id.clone(), ack_id.clone());
                }
                self.placeholder_reply(account, query, &ack_id)
            }
        }
    }

    fn placeholder_reply(&self, account: &ResolvedAccount, query: &BotQuery, stream_id: &StreamId) -> Result<Value> {
        let stream = self.store.stream(stream_id);
        let payload = match stream {
            Some(s) => reply::stream_payload(&s),
            None => {
                warn!(stream_id = %stream_id, "placeholder requested for unknown stream");
                serde_json::json!({ "msgtype": "stream", "stream": { "id": stream_id.as_str(), "finish": false, "content": "" } })
            }
        };
        reply::seal_reply(&account.encoding_aes_key, &account.token, &account.corp_id, &query.timestamp, &query.nonce, &payload)
            .map_err(Into::into)
    }
}

fn to_chat_type(c: ChatTypeField) -> ChatType {
    match c {
        ChatTypeField::Single => ChatType::Direct,
        ChatTypeField::Group => ChatType::Group,
    }
}

/// `buildInboundBody`: normalizes any recognized inbound payload into the
/// raw text the agent driver hands to the runtime.
pub fn build_inbound_body(msg: &InboundMessage) -> String {
    let mut body = match &msg.payload {
        InboundPayload::Text { content } => content.clone(),
        InboundPayload::Voice { content } => content.clone().unwrap_or_else(|| "[voice]".to_string()),
        InboundPayload::Image { url } => format!("[image] {url}"),
        InboundPayload::File { url } => format!("[file] {url}"),
        InboundPayload::Mixed { items } => items
            .iter()
            .map(|item| match item {
                message::MixedItem::Text(t) => t.clone(),
                message::MixedItem::Image { url } => format!("[image] {url}"),
                message::MixedItem::File { url } => format!("[file] {url}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        InboundPayload::Link { title, url } => format!(
            "[link] {} {}",
            title.clone().unwrap_or_default(),
            url.clone().unwrap_or_default()
        ),
        InboundPayload::Location { label } => format!("[location] {}", label.clone().unwrap_or_default()),
        InboundPayload::Event { eventtype, .. } => format!("[event] {eventtype}"),
        InboundPayload::Stream { id } => format!("[stream_refresh] {id}"),
        InboundPayload::Unknown { msgtype, .. } => format!("[unknown:{msgtype}]"),
    };
    if let Some(quote) = &msg.quote {
        body.push_str("\n\n> ");
        body.push_str(&quote.content);
    }
    body
}

fn synthesize_template_card_text(raw: &Value) -> String {
    let button_key = raw.get("button_key").and_then(Value::as_str).unwrap_or("");
    let task_id = raw.get("task_id").and_then(Value::as_str).unwrap_or("");
    let selected = raw
        .get("selected_items")
        .map(|v| v.to_string())
        .unwrap_or_default();
    format!("[template_card_event] button={button_key} task={task_id} selected={selected}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_inbound_body_formats_text() {
        let msg = InboundMessage {
            msg_id: None,
            ai_bot_id: None,
            chat_type: ChatTypeField::Single,
            chat_id: None,
            response_url: None,
            from_user_id: None,
            payload: InboundPayload::Text { content: "hi".into() },
            quote: None,
        };
        assert_eq!(build_inbound_body(&msg), "hi");
    }

    #[test]
    fn build_inbound_body_appends_quote() {
        let msg = InboundMessage {
            msg_id: None,
            ai_bot_id: None,
            chat_type: ChatTypeField::Single,
            chat_id: None,
            response_url: None,
            from_user_id: None,
            payload: InboundPayload::Text { content: "hi".into() },
            quote: Some(message::Quote { content: "earlier message".into() }),
        };
        assert!(build_inbound_body(&msg).ends_with("> earlier message"));
    }

    #[test]
    fn build_inbound_body_formats_mixed_with_placeholders() {
        let msg = InboundMessage {
            msg_id: None,
            ai_bot_id: None,
            chat_type: ChatTypeField::Single,
            chat_id: None,
            response_url: None,
            from_user_id: None,
            payload: InboundPayload::Mixed {
                items: vec![
                    message::MixedItem::Text("see attached".into()),
                    message::MixedItem::Image { url: "https://x/y.png".into() },
                ],
            },
            quote: None,
        };
        let body = build_inbound_body(&msg);
        assert!(body.contains("see attached"));
        assert!(body.contains("[image] https://x/y.png"));
    }
}
