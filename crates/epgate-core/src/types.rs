//! Shared data model — stream/conversation state, routing context, and the
//! account snapshot handlers are configured against.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Visible Bot-stream content cap (20 KiB).
pub const STREAM_MAX_BYTES: usize = 20 * 1024;
/// Application DM-fallback content cap (200 KiB).
pub const DM_MAX_BYTES: usize = 200 * 1024;
/// Stream TTL — entries unused for this long are pruned.
pub const STREAM_TTL_SECS: u64 = 10 * 60;
/// Active passive-reply URL TTL.
pub const ACTIVE_REPLY_TTL_SECS: u64 = 60 * 60;
/// Pending-batch TTL before it is discarded unflushed.
pub const PENDING_TTL_SECS: u64 = 10 * 60;
/// Bot passive-stream window before timeout failover kicks in.
pub const BOT_WINDOW_SECS: u64 = 6 * 60;
/// Safety margin subtracted from the window so the prompt lands before EP times out.
pub const BOT_WINDOW_MARGIN_SECS: u64 = 30;
/// Pruner cadence.
pub const PRUNE_INTERVAL_SECS: u64 = 60;

macro_rules! string_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_newtype!(StreamId);
string_newtype!(ConversationKey);
string_newtype!(BatchKey);
string_newtype!(UserId);
string_newtype!(ChatId);
string_newtype!(AgentId);
string_newtype!(TaskKey);

impl StreamId {
    /// 128-bit random hex id, formatted as the low/high halves of a v4 UUID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl ConversationKey {
    /// `"<account>:<user>:<chat>"` per the glossary.
    pub fn build(account: &str, user: &UserId, chat: &str) -> Self {
        Self(format!("{account}:{user}:{chat}"))
    }
}

/// Routing classification for a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Direct,
    Group,
}

/// Why a stream stopped receiving passive-channel updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    None,
    Media,
    Timeout,
    Error,
}

/// Outcome of admitting a message into the conversation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStatus {
    ActiveNew,
    QueuedNew,
    ActiveMerged,
    QueuedMerged,
}

impl AdmissionStatus {
    pub fn is_merged(self) -> bool {
        matches!(self, AdmissionStatus::ActiveMerged | AdmissionStatus::QueuedMerged)
    }
}

/// One accumulated image, ready to be framed into a `msg_item`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamImage {
    pub base64: String,
    pub md5: String,
}

/// One passive-stream reply slot.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub stream_id: StreamId,
    pub msg_id: Option<String>,

    pub conversation_key: ConversationKey,
    pub batch_key: BatchKey,
    pub user_id: UserId,
    pub chat_type: ChatType,
    pub chat_id: Option<ChatId>,
    pub agent_id: Option<AgentId>,
    pub task_key: Option<TaskKey>,

    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub started: bool,
    pub finished: bool,
    pub error: Option<String>,

    /// Visible placeholder/text, right-truncated to `STREAM_MAX_BYTES`.
    content: Vec<u8>,
    pub images: Vec<StreamImage>,
    /// Full text for the Application DM fallback, left-truncated to `DM_MAX_BYTES`.
    dm_content: Vec<u8>,
    pub agent_media_keys: std::collections::HashSet<String>,

    pub fallback_mode: FallbackMode,
    pub fallback_prompt_sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub final_delivered_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StreamState {
    pub fn new(
        stream_id: StreamId,
        conversation_key: ConversationKey,
        batch_key: BatchKey,
        user_id: UserId,
        chat_type: ChatType,
        chat_id: Option<ChatId>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            stream_id,
            msg_id: None,
            conversation_key,
            batch_key,
            user_id,
            chat_type,
            chat_id,
            agent_id: None,
            task_key: None,
            created_at: now,
            updated_at: now,
            started: false,
            finished: false,
            error: None,
            content: Vec::new(),
            images: Vec::new(),
            dm_content: Vec::new(),
            agent_media_keys: std::collections::HashSet::new(),
            fallback_mode: FallbackMode::None,
            fallback_prompt_sent_at: None,
            final_delivered_at: None,
        }
    }

    pub fn content(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    pub fn dm_content(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.dm_content)
    }

    /// Invariant 4: once `finished`, content is frozen except the explicit
    /// fallback-prompt write, which callers perform via `set_content_frame`.
    ///
    /// Appends `text` and right-truncates to `STREAM_MAX_BYTES`, keeping the
    /// *most recent* bytes — i.e. the buffer grows from the front and the
    /// oldest bytes are dropped once the cap is exceeded.
    pub fn append_content(&mut self, text: &str) {
        self.content.extend_from_slice(text.as_bytes());
        if self.content.len() > STREAM_MAX_BYTES {
            let drop = self.content.len() - STREAM_MAX_BYTES;
            self.content.drain(0..drop);
            repair_utf8_prefix(&mut self.content);
        }
        self.touch();
    }

    /// Overwrite the visible content outright (used for fallback prompts and
    /// the synthetic finalization messages — these are not accumulation).
    pub fn set_content_frame(&mut self, text: &str) {
        self.content = text.as_bytes().to_vec();
        if self.content.len() > STREAM_MAX_BYTES {
            self.content.truncate(STREAM_MAX_BYTES);
            repair_utf8_suffix(&mut self.content);
        }
        self.touch();
    }

    /// Invariant 5: `dmContent` is lossy only within its own 200 KiB cap —
    /// independent of the Bot-view `STREAM_MAX_BYTES` truncation.
    pub fn append_dm_content(&mut self, text: &str) {
        self.dm_content.extend_from_slice(text.as_bytes());
        if self.dm_content.len() > DM_MAX_BYTES {
            self.dm_content.truncate(DM_MAX_BYTES);
            repair_utf8_suffix(&mut self.dm_content);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }

    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        (now - self.updated_at).num_seconds() as u64 > STREAM_TTL_SECS
    }

    pub fn bot_window_deadline(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
            + chrono::Duration::seconds((BOT_WINDOW_SECS - BOT_WINDOW_MARGIN_SECS) as i64)
    }
}

/// Truncate any incomplete UTF-8 sequence left dangling at the *start* of
/// `buf` after a front-drain (right-truncation keeps the tail).
fn repair_utf8_prefix(buf: &mut Vec<u8>) {
    // Find the first valid UTF-8 boundary: skip continuation bytes (10xxxxxx).
    let mut start = 0;
    while start < buf.len() && buf[start] & 0xC0 == 0x80 {
        start += 1;
    }
    if start > 0 {
        buf.drain(0..start);
    }
}

/// Truncate any incomplete UTF-8 sequence left dangling at the *end* of
/// `buf` after a back-truncate (left-truncation keeps the head).
fn repair_utf8_suffix(buf: &mut Vec<u8>) {
    while !buf.is_empty() && std::str::from_utf8(buf).is_err() {
        buf.pop();
    }
}

/// One batch awaiting debounce flush.
pub struct PendingInbound {
    pub stream_id: StreamId,
    pub conversation_key: ConversationKey,
    pub batch_key: BatchKey,
    pub contents: Vec<String>,
    pub msg_ids: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub ready_to_flush: bool,
}

impl PendingInbound {
    pub fn new(stream_id: StreamId, conversation_key: ConversationKey, batch_key: BatchKey) -> Self {
        Self {
            stream_id,
            conversation_key,
            batch_key,
            contents: Vec::new(),
            msg_ids: Vec::new(),
            created_at: chrono::Utc::now(),
            ready_to_flush: false,
        }
    }

    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        (now - self.created_at).num_seconds() as u64 > PENDING_TTL_SECS
    }
}

/// One active conversation's queue state.
#[derive(Default)]
pub struct ConversationQueueEntry {
    pub active_batch_key: Option<BatchKey>,
    pub queue: Option<BatchKey>,
    pub next_seq: u64,
}

/// Passive-reply URL kept for proactive stream updates.
#[derive(Debug, Clone)]
pub struct ActiveReplyEntry {
    pub response_url: String,
    pub proxy_url: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub used_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyUrlPolicy {
    Once,
    Multi,
}

/// Immutable per-account config snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAccount {
    pub name: String,
    pub corp_id: String,
    pub app_id: String,
    pub secret: String,
    pub token: String,
    pub encoding_aes_key: String,
    pub welcome_text: Option<String>,
    pub stream_placeholder_content: String,
    pub application_dm_configured: bool,
}

fn default_placeholder() -> String {
    "1".to_string()
}

impl Default for ResolvedAccount {
    fn default() -> Self {
        Self {
            name: String::new(),
            corp_id: String::new(),
            app_id: String::new(),
            secret: String::new(),
            token: String::new(),
            encoding_aes_key: String::new(),
            welcome_text: None,
            stream_placeholder_content: default_placeholder(),
            application_dm_configured: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_content_right_truncates_utf8_clean() {
        let mut s = StreamState::new(
            StreamId::generate(),
            "acct:u:direct".into(),
            "acct:u:direct".into(),
            "u".into(),
            ChatType::Direct,
            None,
        );
        // A multi-byte string whose total exceeds the cap when repeated.
        let chunk = "héllo wörld — 你好 ".repeat(2000);
        s.append_content(&chunk);
        assert!(s.content.len() <= STREAM_MAX_BYTES);
        // Must always be valid UTF-8 after truncation.
        assert!(std::str::from_utf8(&s.content).is_ok());
    }

    #[test]
    fn dm_content_independent_cap_from_stream_content() {
        let mut s = StreamState::new(
            StreamId::generate(),
            "acct:u:direct".into(),
            "acct:u:direct".into(),
            "u".into(),
            ChatType::Direct,
            None,
        );
        let chunk = "x".repeat(STREAM_MAX_BYTES + 100);
        s.append_content(&chunk);
        s.append_dm_content(&chunk);
        assert_eq!(s.content.len(), STREAM_MAX_BYTES);
        assert_eq!(s.dm_content.len(), STREAM_MAX_BYTES + 100);
    }

    #[test]
    fn stream_id_is_128_bit_hex() {
        let id = StreamId::generate();
        assert_eq!(id.0.len(), 32);
        assert!(id.0.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
