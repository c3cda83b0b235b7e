//! Agent driver and cross-channel failover policy.
//!
//! `Driver<F>` is the [`FlushHandler`] the conversation store invokes once a
//! batch's debounce timer fires. It needs to both implement that trait *and*
//! hold a reference back to the same `ConversationStore` (to read/mutate
//! stream state and advance the queue), which is a construction cycle — the
//! composition root breaks it with [`Driver::attach_store`]:
//!
//! ```ignore
//! let driver = Driver::new(..);
//! let store = ConversationStore::new(driver.clone());
//! driver.attach_store(store);
//! ```

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use epgate_client::media::{self as client_media, MediaKind};
use epgate_client::outbound::Addressing;
use epgate_client::http::Dispatcher;
use epgate_client::{OutboundClient, TokenFetcher};
use epgate_core::runtime::{
    AgentBlock, AgentRuntime, Attachment, AuthVerdict, CommandAuthorizer, InboundContext, MediaSink,
    SessionRecorder, SourceChannel,
};
use epgate_core::types::{
    BatchKey, ChatId, ChatType, ConversationKey, FallbackMode, PendingInbound, ResolvedAccount, StreamId, UserId,
};
use epgate_store::{ActiveReplyStore, ConversationStore, FlushHandler};
use tokio::sync::{mpsc, OnceCell};
use tracing::{error, instrument, warn};

use crate::commands;
use crate::error::{DriverError, Result};
use crate::markdown::{self, TableMode};
use crate::media as local_media;
use crate::template_card;

const FILE_FALLBACK_PROMPT: &str = "文件将通过应用私信发送";
const TIMEOUT_FALLBACK_PROMPT: &str = "剩余内容将通过私信";
const APP_UNCONFIGURED_PROMPT: &str = "应用私信通道尚未配置，请联系管理员完成配置后重试。";
const TEMPLATE_CARD_SENT: &str = "[已发送交互卡片]";
const SEND_INTENT_IMAGE_ACK: &str = "已为您发送图片。";
const MERGED_ACK_DONE: &str = "已合并处理完成，请查看上一条回复。";
const RESET_FALLBACK_ACK: &str = "好的，已处理。";
const DM_CHUNK_BYTES: usize = 20 * 1024;
const MAX_REMOTE_FETCH_BYTES: u64 = 10 * 1024 * 1024;

enum BlockOutcome {
    Continue,
    Stop,
}

/// Processes flushed batches end to end: builds the inbound context, drives
/// the agent runtime, applies the block-delivery rules, and runs the
/// timeout/media failover policy.
pub struct Driver<F: TokenFetcher> {
    outbound: Arc<OutboundClient<F>>,
    active_replies: Arc<ActiveReplyStore>,
    agent: Arc<dyn AgentRuntime>,
    authorizer: Arc<dyn CommandAuthorizer>,
    media_sink: Arc<dyn MediaSink>,
    sessions: Arc<dyn SessionRecorder>,
    http: Arc<Dispatcher>,
    accounts: Arc<DashMap<String, ResolvedAccount>>,
    table_mode: TableMode,
    store: OnceCell<Arc<ConversationStore<Driver<F>>>>,
}

impl<F: TokenFetcher + 'static> Driver<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outbound: Arc<OutboundClient<F>>,
        active_replies: Arc<ActiveReplyStore>,
        agent: Arc<dyn AgentRuntime>,
        authorizer: Arc<dyn CommandAuthorizer>,
        media_sink: Arc<dyn MediaSink>,
        sessions: Arc<dyn SessionRecorder>,
        http: Arc<Dispatcher>,
        accounts: Arc<DashMap<String, ResolvedAccount>>,
        table_mode: TableMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            active_replies,
            agent,
            authorizer,
            media_sink,
            sessions,
            http,
            accounts,
            table_mode,
            store: OnceCell::new(),
        })
    }

    /// Wires this driver back to the store that holds it as a flush handler.
    /// Must be called once, right after `ConversationStore::new(driver)`,
    /// before any webhook traffic is admitted.
    pub fn attach_store(&self, store: Arc<ConversationStore<Self>>) {
        let _ = self.store.set(store);
    }

    fn store(&self) -> &Arc<ConversationStore<Self>> {
        self.store
            .get()
            .expect("Driver::attach_store must run before the driver processes any batch")
    }

    #[instrument(skip(self, batch), fields(stream_id = %batch.stream_id))]
    async fn process_batch(&self, batch: PendingInbound) {
        let stream_id = batch.stream_id.clone();
        let Some((user_id, chat_type, chat_id, conversation_key)) = self.snapshot_stream(&stream_id) else {
            warn!(stream_id = %stream_id, "flushed batch has no live stream, dropping");
            return;
        };

        let account_name = conversation_key.0.split(':').next().unwrap_or_default().to_string();
        let Some(account) = self.accounts.get(&account_name).map(|e| e.clone()) else {
            error!(account = account_name, "flushed batch references an unconfigured account");
            self.store().on_stream_finished(&stream_id).await;
            return;
        };

        let source_channel = classify_channel(&conversation_key, chat_type);
        let raw_body = batch.contents.join("\n\n");

        // A "send this local file" pre-intent short-circuits agent dispatch
        // entirely.
        if local_media::contains_send_intent(&raw_body) {
            let paths = local_media::find_local_paths(&raw_body);
            if !paths.is_empty() {
                self.handle_send_intent(&stream_id, &account, source_channel, user_id.as_str(), &paths).await;
                self.finalize(&stream_id, &batch.batch_key, source_channel, &account).await;
                return;
            }
        }

        let command_token = commands::parse_command(&raw_body).map(str::to_string);
        let session_key = conversation_key.0.clone();
        let mut ctx = InboundContext {
            body: format!("[{source_channel:?}] {raw_body}"),
            raw_body: raw_body.clone(),
            command_body: command_token.clone(),
            attachments: self.decrypt_attached_media(&account, &batch.contents).await,
            source_address: user_id.to_string(),
            target_address: chat_id.as_ref().map(|c| c.to_string()).unwrap_or_else(|| user_id.to_string()),
            session_key: session_key.clone(),
            chat_type,
            source_channel,
            command_authorized: command_token.is_none(),
            stream_id: stream_id.clone(),
            account: account.name.clone(),
            deny_tools: vec!["message".to_string()],
        };

        if self.agent.route(&ctx).await.is_err() {
            self.mark_error(&stream_id, "route resolution failed");
            self.finalize(&stream_id, &batch.batch_key, source_channel, &account).await;
            return;
        }

        if command_token.is_some() {
            match self.authorizer.authorize(&raw_body, &ctx).await {
                AuthVerdict::Allow => ctx.command_authorized = true,
                AuthVerdict::Deny { reason } => {
                    self.deny_command(&stream_id, &account, source_channel, &reason).await;
                    self.finalize(&stream_id, &batch.batch_key, source_channel, &account).await;
                    return;
                }
            }
        }

        self.sessions.record_inbound(&session_key, &ctx).await;

        let is_reset_command = command_token.as_deref().is_some_and(commands::is_session_reset_command);
        // The runtime may emit more than one block for a reset-family command
        // (e.g. an explanatory line ahead of the ack, or a retry that splits
        // the ack across two sends); only the first block is ever the ack.
        let mut ack_pending = is_reset_command;

        let (tx, mut rx) = mpsc::channel::<AgentBlock>(32);
        let agent = self.agent.clone();
        let dispatch_ctx = ctx.clone();
        let dispatch_handle = tokio::spawn(async move { agent.dispatch(dispatch_ctx, tx).await });

        while let Some(block) = rx.recv().await {
            let outcome = self
                .handle_block(&stream_id, &account, user_id.as_str(), chat_type, source_channel, &raw_body, ack_pending, block)
                .await;
            ack_pending = false;
            match outcome {
                BlockOutcome::Continue => {}
                BlockOutcome::Stop => break,
            }
        }
        drop(rx);
        match dispatch_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "agent dispatch returned an error"),
            Err(e) => warn!(error = %e, "agent dispatch task panicked"),
        }

        if is_reset_command {
            let has_content = self.store().stream(&stream_id).map(|s| !s.content().is_empty()).unwrap_or(false);
            if !has_content {
                if let Some(mut s) = self.store().stream_mut(&stream_id) {
                    s.set_content_frame(RESET_FALLBACK_ACK);
                    s.append_dm_content(RESET_FALLBACK_ACK);
                }
            }
        }

        self.finalize(&stream_id, &batch.batch_key, source_channel, &account).await;
    }

    fn snapshot_stream(&self, stream_id: &StreamId) -> Option<(UserId, ChatType, Option<ChatId>, ConversationKey)> {
        let stream = self.store().stream(stream_id)?;
        Some((stream.user_id.clone(), stream.chat_type, stream.chat_id.clone(), stream.conversation_key.clone()))
    }

    fn mark_error(&self, stream_id: &StreamId, msg: &str) {
        const ERROR_ZH: &str = "处理消息时发生内部错误，请稍后重试。";
        if let Some(mut s) = self.store().stream_mut(stream_id) {
            s.error = Some(msg.to_string());
            s.set_content_frame(ERROR_ZH);
            s.append_dm_content(ERROR_ZH);
        }
    }

    /// One delivered agent block.
    #[allow(clippy::too_many_arguments)]
    async fn handle_block(
        &self,
        stream_id: &StreamId,
        account: &ResolvedAccount,
        user_id: &str,
        chat_type: ChatType,
        source_channel: SourceChannel,
        raw_body: &str,
        apply_ack: bool,
        block: AgentBlock,
    ) -> BlockOutcome {
        let Some((already_fallback, past_deadline)) = self.store().stream(stream_id).map(|s| {
            (s.fallback_mode != FallbackMode::None, Utc::now() >= s.bot_window_deadline())
        }) else {
            return BlockOutcome::Stop;
        };
        // The 6-minute window is a Bot passive-stream constraint; the
        // Application channel never holds a stream slot open, so it has
        // nothing to fail over from.
        if source_channel == SourceChannel::Bot && !already_fallback && past_deadline {
            self.enter_timeout_fallback(stream_id, account, source_channel).await;
            return BlockOutcome::Stop;
        }

        let mut text = block.text.clone();

        // Command-ack rewrite, before any markdown processing. Only the
        // block the caller flagged as the ack carrier gets substituted.
        if apply_ack {
            let ack = commands::localized_ack(commands::parse_command(raw_body).unwrap_or_default());
            if source_channel == SourceChannel::Bot {
                if let Some(mut s) = self.store().stream_mut(stream_id) {
                    s.set_content_frame(ack);
                }
                return BlockOutcome::Continue;
            }
            text = ack.to_string();
        }

        text = markdown::apply(&text, self.table_mode);

        if let Some(card) = template_card::parse(&text) {
            let direct_with_url = chat_type == ChatType::Direct && self.active_replies.get_url(stream_id).is_some();
            if direct_with_url && self.push_template_card(stream_id, account, &card).await {
                if let Some(mut s) = self.store().stream_mut(stream_id) {
                    s.set_content_frame(TEMPLATE_CARD_SENT);
                    s.finished = true;
                }
                return BlockOutcome::Stop;
            }
            text = template_card::render_to_text(&card);
        }

        if let Some(mut s) = self.store().stream_mut(stream_id) {
            s.append_dm_content(&text);
        }

        let mut media_items = block.media_urls.clone();
        if let Some(url) = &block.media_url {
            if !media_items.contains(url) {
                media_items.push(url.clone());
            }
        }
        for candidate in local_media::find_local_image_paths(&text) {
            if local_media::accept_candidate(&candidate, raw_body) && !media_items.contains(&candidate) {
                media_items.push(candidate);
            }
        }
        for item in &media_items {
            self.handle_media_item(stream_id, account, source_channel, user_id, item).await;
        }

        let in_fallback = self.store().stream(stream_id).map(|s| s.fallback_mode != FallbackMode::None).unwrap_or(true);
        if !in_fallback {
            if let Some(mut s) = self.store().stream_mut(stream_id) {
                s.append_content(&text);
            }
        }

        BlockOutcome::Continue
    }

    async fn enter_timeout_fallback(&self, stream_id: &StreamId, account: &ResolvedAccount, source_channel: SourceChannel) {
        if let Some(mut s) = self.store().stream_mut(stream_id) {
            s.fallback_mode = FallbackMode::Timeout;
            s.finished = true;
            s.set_content_frame(TIMEOUT_FALLBACK_PROMPT);
            s.fallback_prompt_sent_at = Some(Utc::now());
        }
        if source_channel == SourceChannel::Bot {
            let _ = self.push_stream_frame(stream_id, account).await;
        }
    }

    async fn deny_command(&self, stream_id: &StreamId, account: &ResolvedAccount, source_channel: SourceChannel, reason: &str) {
        let prompt = format!("该指令未获授权：{reason}\n请联系管理员调整私信策略或白名单后重试。");
        if let Some(mut s) = self.store().stream_mut(stream_id) {
            s.finished = true;
            s.set_content_frame(&prompt);
            s.append_dm_content(&prompt);
        }
        if source_channel == SourceChannel::Bot {
            let _ = self.push_stream_frame(stream_id, account).await;
        }
    }

    /// Image-only paths are attached and confirmed inline; anything else
    /// goes through the file-DM fallback. On the Bot channel
    /// the confirmation rides the passive-stream push; on the Application
    /// channel there is no passive slot to push through, so the images are
    /// sent as media messages and the ack is appended to `dmContent` for
    /// ordinary `finalize` delivery.
    async fn handle_send_intent(&self, stream_id: &StreamId, account: &ResolvedAccount, source_channel: SourceChannel, user_id: &str, paths: &[String]) {
        let (images, files): (Vec<_>, Vec<_>) = paths.iter().cloned().partition(|p| local_media::is_image_path(p));

        if !images.is_empty() && files.is_empty() {
            for path in &images {
                match local_media::load_image_as_stream_image(path).await {
                    Ok(img) => {
                        if source_channel == SourceChannel::Application {
                            if let Ok(bytes) = tokio::fs::read(path).await {
                                let filename = path.rsplit('/').next().unwrap_or("image").to_string();
                                let ext = filename.rsplit('.').next().unwrap_or("");
                                let content_type = client_media::content_type_for_extension(ext).to_string();
                                if let Err(e) = self.deliver_image_via_dm(account, user_id, &filename, &content_type, &bytes).await {
                                    warn!(error = %e, path, "send-intent image DM delivery failed");
                                }
                            }
                        }
                        if let Some(mut s) = self.store().stream_mut(stream_id) {
                            s.images.push(img);
                        }
                    }
                    Err(e) => warn!(error = %e, path, "failed to load local image for send-intent"),
                }
            }
            if let Some(mut s) = self.store().stream_mut(stream_id) {
                s.finished = true;
                s.set_content_frame(SEND_INTENT_IMAGE_ACK);
                s.append_dm_content(SEND_INTENT_IMAGE_ACK);
            }
        } else {
            for path in paths {
                if let Ok(bytes) = tokio::fs::read(path).await {
                    let filename = path.rsplit('/').next().unwrap_or("file").to_string();
                    let ext = filename.rsplit('.').next().unwrap_or("");
                    let content_type = client_media::content_type_for_extension(ext).to_string();
                    if let Err(e) = self.deliver_file_via_dm(account, user_id, &filename, &content_type, &bytes).await {
                        warn!(error = %e, path, "send-intent file DM delivery failed");
                    }
                }
            }
            if let Some(mut s) = self.store().stream_mut(stream_id) {
                s.finished = true;
                s.set_content_frame(FILE_FALLBACK_PROMPT);
                s.append_dm_content(FILE_FALLBACK_PROMPT);
            }
        }
        if source_channel == SourceChannel::Bot {
            let _ = self.push_stream_frame(stream_id, account).await;
        }
    }

    async fn handle_media_item(&self, stream_id: &StreamId, account: &ResolvedAccount, source_channel: SourceChannel, user_id: &str, item: &str) {
        let is_local = item.starts_with("/Users/") || item.starts_with("/tmp/");

        if is_local && local_media::is_image_path(item) && tokio::fs::metadata(item).await.is_ok() {
            match tokio::fs::read(item).await {
                Ok(bytes) => {
                    self.deliver_image_if_application(stream_id, account, source_channel, user_id, item, &bytes).await;
                    if let Some(mut s) = self.store().stream_mut(stream_id) {
                        s.images.push(local_media::to_stream_image(&bytes));
                    }
                }
                Err(e) => warn!(error = %e, path = item, "failed to load local image block attachment"),
            }
            return;
        }

        if !is_local && looks_like_remote_image(item) {
            match self.fetch_remote_bytes(item).await {
                Ok(bytes) => {
                    self.deliver_image_if_application(stream_id, account, source_channel, user_id, item, &bytes).await;
                    if let Some(mut s) = self.store().stream_mut(stream_id) {
                        s.images.push(local_media::to_stream_image(&bytes));
                    }
                }
                Err(e) => warn!(error = %e, url = item, "failed to fetch remote image block attachment"),
            }
            return;
        }

        let loaded = if is_local {
            tokio::fs::read(item).await.ok()
        } else {
            self.fetch_remote_bytes(item).await.ok()
        };
        let Some(bytes) = loaded else {
            warn!(item, "failed to load non-image media item for file fallback");
            return;
        };
        let filename = item
            .rsplit('/')
            .next()
            .unwrap_or("file")
            .split('?')
            .next()
            .unwrap_or("file")
            .to_string();
        let ext = filename.rsplit('.').next().unwrap_or("");
        let content_type = client_media::content_type_for_extension(ext).to_string();
        self.file_fallback(stream_id, account, source_channel, user_id, item, bytes, filename, content_type)
            .await;
    }

    /// Non-image file fallback: upload + DM the file, deduped by
    /// `agentMediaKeys`, and on the Bot side mark the stream
    /// finished in `media` fallback with a one-time Chinese prompt.
    #[allow(clippy::too_many_arguments)]
    async fn file_fallback(
        &self,
        stream_id: &StreamId,
        account: &ResolvedAccount,
        source_channel: SourceChannel,
        user_id: &str,
        dedup_key: &str,
        bytes: Vec<u8>,
        filename: String,
        content_type: String,
    ) {
        let already_in_fallback = self.store().stream(stream_id).map(|s| s.fallback_mode != FallbackMode::None).unwrap_or(false);
        if let Some(mut s) = self.store().stream_mut(stream_id) {
            if s.fallback_mode == FallbackMode::None {
                s.fallback_mode = FallbackMode::Media;
            }
        }

        let already_sent = self.store().stream(stream_id).map(|s| s.agent_media_keys.contains(dedup_key)).unwrap_or(true);
        if already_sent {
            return;
        }

        // `application_dm_configured` gates the Bot-side fallback path only —
        // a message already arriving over the Application channel has no
        // such prerequisite, it IS the Application channel.
        if source_channel == SourceChannel::Bot && !account.application_dm_configured {
            self.push_fallback_prompt(stream_id, account, &format!("{APP_UNCONFIGURED_PROMPT}\n{FILE_FALLBACK_PROMPT}"), already_in_fallback)
                .await;
            return;
        }

        match self.deliver_file_via_dm(account, user_id, &filename, &content_type, &bytes).await {
            Ok(()) => {
                if let Some(mut s) = self.store().stream_mut(stream_id) {
                    s.agent_media_keys.insert(dedup_key.to_string());
                }
                if source_channel == SourceChannel::Bot {
                    self.push_fallback_prompt(stream_id, account, FILE_FALLBACK_PROMPT, already_in_fallback).await;
                }
            }
            Err(e) => warn!(error = %e, "file fallback DM delivery failed"),
        }
    }

    /// The Application channel has no passive-stream slot to carry images
    /// back through, so an image block is sent as a DM media message
    /// immediately, deduped via `agentMediaKeys` like the file fallback.
    async fn deliver_image_if_application(&self, stream_id: &StreamId, account: &ResolvedAccount, source_channel: SourceChannel, user_id: &str, dedup_key: &str, bytes: &[u8]) {
        if source_channel != SourceChannel::Application {
            return;
        }
        let already_sent = self.store().stream(stream_id).map(|s| s.agent_media_keys.contains(dedup_key)).unwrap_or(true);
        if already_sent {
            return;
        }
        let filename = dedup_key
            .rsplit('/')
            .next()
            .unwrap_or("image")
            .split('?')
            .next()
            .unwrap_or("image")
            .to_string();
        let ext = filename.rsplit('.').next().unwrap_or("");
        let content_type = client_media::content_type_for_extension(ext).to_string();
        match self.deliver_image_via_dm(account, user_id, &filename, &content_type, bytes).await {
            Ok(()) => {
                if let Some(mut s) = self.store().stream_mut(stream_id) {
                    s.agent_media_keys.insert(dedup_key.to_string());
                }
            }
            Err(e) => warn!(error = %e, item = dedup_key, "application-channel image DM delivery failed"),
        }
    }

    async fn push_fallback_prompt(&self, stream_id: &StreamId, account: &ResolvedAccount, prompt: &str, already_in_fallback: bool) {
        if already_in_fallback {
            return;
        }
        if let Some(mut s) = self.store().stream_mut(stream_id) {
            s.finished = true;
            s.set_content_frame(prompt);
            s.fallback_prompt_sent_at = Some(Utc::now());
        }
        let _ = self.push_stream_frame(stream_id, account).await;
    }

    async fn deliver_file_via_dm(&self, account: &ResolvedAccount, user_id: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Result<()> {
        let addressing = Addressing::NonChat {
            to_user: Some(user_id.to_string()),
            to_party: None,
            to_tag: None,
        };
        let media_id = self
            .outbound
            .upload_media(&account.corp_id, &account.app_id, &account.secret, MediaKind::File, filename, content_type, bytes)
            .await
            .map_err(|e| DriverError::Outbound(e.to_string()))?;
        self.outbound
            .send_media(
                &account.corp_id,
                &account.app_id,
                &account.secret,
                &addressing,
                "file",
                serde_json::json!({ "media_id": media_id }),
            )
            .await
            .map_err(|e| DriverError::Outbound(e.to_string()))
    }

    async fn deliver_image_via_dm(&self, account: &ResolvedAccount, user_id: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Result<()> {
        let addressing = Addressing::NonChat {
            to_user: Some(user_id.to_string()),
            to_party: None,
            to_tag: None,
        };
        let media_id = self
            .outbound
            .upload_media(&account.corp_id, &account.app_id, &account.secret, MediaKind::Image, filename, content_type, bytes)
            .await
            .map_err(|e| DriverError::Outbound(e.to_string()))?;
        self.outbound
            .send_media(
                &account.corp_id,
                &account.app_id,
                &account.secret,
                &addressing,
                "image",
                serde_json::json!({ "media_id": media_id }),
            )
            .await
            .map_err(|e| DriverError::Outbound(e.to_string()))
    }

    async fn fetch_remote_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let request = self
            .http
            .request(reqwest::Method::GET, url, None)
            .map_err(|e| DriverError::Media(e.to_string()))?;
        let response = self.http.send(request, None).await.map_err(|e| DriverError::Media(e.to_string()))?;
        Dispatcher::read_capped(response, MAX_REMOTE_FETCH_BYTES).await.map_err(|e| DriverError::Media(e.to_string()))
    }

    /// Decrypts the first attached media item (if any) using the account's
    /// envelope codec and hands it to the media sink.
    async fn decrypt_attached_media(&self, account: &ResolvedAccount, contents: &[String]) -> Vec<Attachment> {
        let Some(url) = contents.iter().find_map(|c| extract_first_media_url(c)) else {
            return Vec::new();
        };
        let raw = match self.fetch_remote_bytes(&url).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, url, "attached media download failed");
                return Vec::new();
            }
        };
        let plain = match std::str::from_utf8(&raw) {
            Ok(text) => epgate_crypto::cipher::decrypt(&account.encoding_aes_key, &account.corp_id, text.trim()).unwrap_or(raw.clone()),
            Err(_) => raw,
        };
        let ext = url.rsplit('.').next().unwrap_or("");
        let content_type = client_media::content_type_for_extension(ext).to_string();
        let suggested_name = url.rsplit('/').next();
        match self.media_sink.save(&plain, Some(&content_type), suggested_name).await {
            Ok(path) => vec![Attachment {
                path,
                content_type: Some(content_type),
                url: Some(url),
            }],
            Err(e) => {
                warn!(error = %e, "media sink save failed for attached media");
                Vec::new()
            }
        }
    }

    async fn push_template_card(&self, stream_id: &StreamId, account: &ResolvedAccount, card: &serde_json::Value) -> bool {
        let body = card.get("template_card").cloned().unwrap_or_else(|| card.clone());
        let payload = serde_json::json!({ "msgtype": "template_card", "template_card": body });
        self.push_payload(stream_id, account, payload).await.is_ok()
    }

    async fn push_stream_frame(&self, stream_id: &StreamId, account: &ResolvedAccount) -> std::result::Result<(), String> {
        let payload = {
            let stream = self.store().stream(stream_id).ok_or_else(|| "missing stream".to_string())?;
            epgate_bot::reply::stream_payload(&stream)
        };
        self.push_payload(stream_id, account, payload).await
    }

    /// Pushes `payload`, sealed through the account's envelope codec, to the
    /// stream's passive-reply URL.
    async fn push_payload(&self, stream_id: &StreamId, account: &ResolvedAccount, payload: serde_json::Value) -> std::result::Result<(), String> {
        let timestamp = Utc::now().timestamp().to_string();
        let nonce = format!("{:08x}", rand::random::<u32>());
        let account = account.clone();
        let http = self.http.clone();

        self.active_replies
            .use_url(stream_id, move |url, proxy| async move {
                let sealed = epgate_bot::reply::seal_reply(&account.encoding_aes_key, &account.token, &account.corp_id, &timestamp, &nonce, &payload)
                    .map_err(|e| e.to_string())?;
                let request = http
                    .request(reqwest::Method::POST, &url, proxy.as_deref())
                    .map_err(|e| e.to_string())?
                    .json(&sealed);
                http.send(request, proxy.as_deref()).await.map_err(|e| e.to_string())?;
                Ok(())
            })
            .await
            .map_err(|e| e.to_string())
    }

    /// Finalization: timeout DM delivery, the group final-image push,
    /// ack-stream draining, and queue advancement.
    async fn finalize(&self, stream_id: &StreamId, batch_key: &BatchKey, source_channel: SourceChannel, account: &ResolvedAccount) {
        let Some(snapshot) = self.store().stream_mut(stream_id).map(|mut s| {
            s.finished = true;
            (s.fallback_mode, s.chat_type, !s.images.is_empty(), s.final_delivered_at, s.dm_content().into_owned(), s.user_id.clone())
        }) else {
            return;
        };
        let (fallback_mode, chat_type, has_images, final_delivered_at, dm_content, user_id) = snapshot;

        // Bot-channel timeout fallback delivers the overflow via Application
        // DM once its own account is configured for it; the Application
        // channel has no passive slot at all, so every one of its replies is
        // delivered this same way regardless of `fallbackMode`.
        let deliver_via_dm = match (source_channel, fallback_mode) {
            (SourceChannel::Application, _) => true,
            (SourceChannel::Bot, FallbackMode::Timeout) => account.application_dm_configured,
            _ => false,
        };
        if deliver_via_dm && final_delivered_at.is_none() {
            let addressing = Addressing::NonChat {
                to_user: Some(user_id.to_string()),
                to_party: None,
                to_tag: None,
            };
            for chunk in chunk_by_bytes(&dm_content, DM_CHUNK_BYTES) {
                if chunk.trim().is_empty() {
                    continue;
                }
                if let Err(e) = self
                    .outbound
                    .send_text(&account.corp_id, &account.app_id, &account.secret, &addressing, &chunk)
                    .await
                {
                    warn!(error = %e, "DM chunk delivery failed");
                }
            }
            if let Some(mut s) = self.store().stream_mut(stream_id) {
                s.final_delivered_at = Some(Utc::now());
            }
        }

        if chat_type == ChatType::Group && has_images && source_channel == SourceChannel::Bot && self.active_replies.get_url(stream_id).is_some() {
            let _ = self.push_stream_frame(stream_id, account).await;
        }

        for ack_id in self.store().drain_ack_streams(batch_key) {
            if let Some(mut ack) = self.store().stream_mut(&ack_id) {
                ack.set_content_frame(MERGED_ACK_DONE);
                ack.finished = true;
            }
        }

        self.store().on_stream_finished(stream_id).await;
    }
}

#[async_trait::async_trait]
impl<F: TokenFetcher + 'static> FlushHandler for Driver<F> {
    async fn flush(&self, batch: PendingInbound) {
        self.process_batch(batch).await;
    }
}

/// An account+user's Application-DM conversation is keyed with `"app"` as
/// its chat segment (see `epgate_app::handler`) rather than `"direct"`,
/// which keeps it in its own queue and lets the driver read the channel back
/// off the conversation key with no extra per-stream field.
fn classify_channel(conversation_key: &ConversationKey, chat_type: ChatType) -> SourceChannel {
    if chat_type == ChatType::Direct && conversation_key.0.rsplit(':').next() == Some("app") {
        SourceChannel::Application
    } else {
        SourceChannel::Bot
    }
}

fn looks_like_remote_image(url: &str) -> bool {
    (url.starts_with("http://") || url.starts_with("https://"))
        && local_media::is_image_path(url.split('?').next().unwrap_or(url))
}

fn extract_first_media_url(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        line.strip_prefix("[image] ")
            .or_else(|| line.strip_prefix("[file] "))
            .map(|rest| rest.trim().to_string())
    })
}

/// Splits `text` into UTF-8-safe chunks of at most `max` bytes each.
fn chunk_by_bytes(text: &str, max: usize) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + max).min(bytes.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = bytes.len().min(start + max);
        }
        out.push(text[start..end].to_string());
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use epgate_client::http::Dispatcher;
    use epgate_client::{TokenCache, TokenFetcher};
    use epgate_core::runtime::{AgentRuntime, RouteResolution};
    use epgate_core::types::{ChatType, StreamState};
    use epgate_store::ConversationStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn chunk_by_bytes_respects_char_boundaries() {
        let text = "你好".repeat(20); // 3 bytes/char * 40 chars = 120 bytes
        let chunks = chunk_by_bytes(&text, 10);
        for chunk in &chunks {
            assert!(std::str::from_utf8(chunk.as_bytes()).is_ok());
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn classify_channel_reads_app_suffix() {
        let app_key = ConversationKey("acct:u1:app".into());
        let bot_key = ConversationKey("acct:u1:direct".into());
        assert_eq!(classify_channel(&app_key, ChatType::Direct), SourceChannel::Application);
        assert_eq!(classify_channel(&bot_key, ChatType::Direct), SourceChannel::Bot);
    }

    #[test]
    fn extract_first_media_url_finds_image_placeholder() {
        assert_eq!(extract_first_media_url("hi\n[image] https://x/y.png"), Some("https://x/y.png".into()));
        assert_eq!(extract_first_media_url("just text"), None);
    }

    struct StubFetcher;
    #[async_trait::async_trait]
    impl TokenFetcher for StubFetcher {
        async fn fetch(&self, _corp_id: &str, _secret: &str) -> epgate_client::Result<(String, i64)> {
            Ok(("tok".into(), 7200))
        }
    }

    struct EchoRuntime {
        calls: AtomicUsize,
    }
    #[async_trait::async_trait]
    impl AgentRuntime for EchoRuntime {
        async fn route(&self, _ctx: &InboundContext) -> std::result::Result<RouteResolution, String> {
            Ok(RouteResolution {
                agent_id: "a1".into(),
                session_key: "s1".into(),
                account_id: "acct".into(),
            })
        }

        async fn dispatch(&self, ctx: InboundContext, tx: mpsc::Sender<AgentBlock>) -> std::result::Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tx.send(AgentBlock { text: format!("echo: {}", ctx.raw_body), ..Default::default() })
                .await
                .ok();
            Ok(())
        }
    }

    struct AllowAll;
    #[async_trait::async_trait]
    impl CommandAuthorizer for AllowAll {
        async fn authorize(&self, _raw_body: &str, _ctx: &InboundContext) -> AuthVerdict {
            AuthVerdict::Allow
        }
    }

    struct DenyAll;
    #[async_trait::async_trait]
    impl CommandAuthorizer for DenyAll {
        async fn authorize(&self, _raw_body: &str, _ctx: &InboundContext) -> AuthVerdict {
            AuthVerdict::Deny { reason: "not on allowlist".into() }
        }
    }

    struct NoopMediaSink;
    #[async_trait::async_trait]
    impl MediaSink for NoopMediaSink {
        async fn save(&self, bytes: &[u8], _content_type: Option<&str>, _suggested_name: Option<&str>) -> std::result::Result<String, String> {
            Ok(format!("/media/blob ({} bytes)", bytes.len()))
        }
    }

    struct RecordingSessions {
        recorded: StdMutex<Vec<String>>,
    }
    #[async_trait::async_trait]
    impl SessionRecorder for RecordingSessions {
        async fn record_inbound(&self, session_key: &str, _ctx: &InboundContext) {
            self.recorded.lock().unwrap().push(session_key.to_string());
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

    fn build_driver(
        agent: Arc<dyn AgentRuntime>,
        authorizer: Arc<dyn CommandAuthorizer>,
    ) -> (Arc<Driver<StubFetcher>>, Arc<ConversationStore<Driver<StubFetcher>>>) {
        let dispatcher = Arc::new(Dispatcher::new(None));
        let tokens = Arc::new(TokenCache::new(StubFetcher));
        let outbound = Arc::new(OutboundClient::new(dispatcher.clone(), tokens, "https://example.invalid"));
        let active_replies = Arc::new(ActiveReplyStore::new());
        let accounts = Arc::new(DashMap::new());
        accounts.insert("acct".to_string(), account());
        let media_sink: Arc<dyn MediaSink> = Arc::new(NoopMediaSink);
        let sessions: Arc<dyn SessionRecorder> = Arc::new(RecordingSessions { recorded: StdMutex::new(Vec::new()) });

        let driver = Driver::new(outbound, active_replies, agent, authorizer, media_sink, sessions, dispatcher, accounts, TableMode::Off);
        let store = ConversationStore::new(driver.clone());
        driver.attach_store(store.clone());
        (driver, store)
    }

    #[tokio::test]
    async fn happy_path_writes_agent_text_to_stream_content() {
        let agent: Arc<dyn AgentRuntime> = Arc::new(EchoRuntime { calls: AtomicUsize::new(0) });
        let (_driver, store) = build_driver(agent, Arc::new(AllowAll));

        let conversation_key = ConversationKey("acct:u1:direct".into());
        let (stream_id, _status) = store.add_pending_message(conversation_key, Some("m1".into()), "hello".into(), "u1".into(), ChatType::Direct, None, 10);
        store.register_handler().await;
        store.request_flush(BatchKey("acct:u1:direct".into())).await;

        // Flushing spawns; give the scheduler a turn.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stream = store.stream(&stream_id).expect("stream should still exist");
        assert!(stream.content().contains("echo: hello"));
        assert!(stream.finished);
        store.unregister_handler().await;
    }

    #[tokio::test]
    async fn denied_command_writes_chinese_refusal_and_finishes_stream() {
        let agent: Arc<dyn AgentRuntime> = Arc::new(EchoRuntime { calls: AtomicUsize::new(0) });
        let (_driver, store) = build_driver(agent, Arc::new(DenyAll));

        let conversation_key = ConversationKey("acct:u1:direct".into());
        let (stream_id, _status) = store.add_pending_message(conversation_key, Some("m1".into()), "/reset".into(), "u1".into(), ChatType::Direct, None, 10);
        store.request_flush(BatchKey("acct:u1:direct".into())).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stream = store.stream(&stream_id).expect("stream should still exist");
        assert!(stream.finished);
        assert!(stream.content().contains("未获授权"));
    }

    #[tokio::test]
    async fn application_channel_ignores_bot_passive_window_deadline() {
        let agent: Arc<dyn AgentRuntime> = Arc::new(EchoRuntime { calls: AtomicUsize::new(0) });
        let (driver, store) = build_driver(agent, Arc::new(AllowAll));

        let conversation_key = ConversationKey("acct:u1:app".into());
        let (stream_id, _status) =
            store.add_pending_message(conversation_key, Some("m1".into()), "hello".into(), "u1".into(), ChatType::Direct, None, 10);

        // Push the stream well past the Bot channel's 6-minute passive window;
        // the Application channel has no passive slot to time out of.
        if let Some(mut s) = store.stream_mut(&stream_id) {
            s.created_at = chrono::Utc::now() - chrono::Duration::minutes(10);
        }

        let block = AgentBlock { text: "late reply".into(), ..Default::default() };
        let outcome = driver
            .handle_block(&stream_id, &account(), "u1", ChatType::Direct, SourceChannel::Application, "hello", false, block)
            .await;

        assert!(matches!(outcome, BlockOutcome::Continue));
        let stream = store.stream(&stream_id).expect("stream should still exist");
        assert_eq!(stream.fallback_mode, FallbackMode::None);
        assert!(stream.content().contains("late reply"));
        assert!(!stream.finished);
    }

    #[test]
    fn stream_state_construction_smoke() {
        // Exercises the direct `StreamState::new` constructor this module
        // reads fields off of, guarding against upstream signature drift.
        let s = StreamState::new(StreamId::generate(), "a:b:direct".into(), "a:b:direct".into(), "u".into(), ChatType::Direct, None);
        assert!(!s.finished);
    }
}
