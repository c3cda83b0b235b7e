//! External-collaborator seams: `AgentRuntime`, `CommandAuthorizer`,
//! `MediaSink`, and `SessionRecorder` are out of scope for this crate to
//! implement — only their interfaces are specified here.
//!
//! The agent runtime, command-authorization policy, and session/media
//! persistence all live outside this core; every crate that needs to call
//! into them (`epgate-app`, `epgate-driver`) depends on these trait objects
//! rather than a concrete implementation.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{ChatType, StreamId};

/// Which surface originated an inbound message — the driver needs this to
/// decide Bot-stream vs Application-DM delivery semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    Bot,
    Application,
}

/// One piece of content the agent driver attaches to the inbound context:
/// decrypted media, inline text previews, and so on.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub path: String,
    pub content_type: Option<String>,
    pub url: Option<String>,
}

/// Everything the agent needs to process one flushed batch.
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub body: String,
    pub raw_body: String,
    pub command_body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub source_address: String,
    pub target_address: String,
    pub session_key: String,
    pub chat_type: ChatType,
    pub source_channel: SourceChannel,
    pub command_authorized: bool,
    pub stream_id: StreamId,
    pub account: String,
    /// Sandbox tool names the runtime must refuse for this dispatch; the
    /// driver force-adds `"message"` here before every call.
    pub deny_tools: Vec<String>,
}

/// `{agentId, sessionKey, accountId}` from routing.
#[derive(Debug, Clone)]
pub struct RouteResolution {
    pub agent_id: String,
    pub session_key: String,
    pub account_id: String,
}

/// One delivered block from the agent's streaming output:
/// `{text, mediaUrl?, mediaUrls?}`.
#[derive(Debug, Clone, Default)]
pub struct AgentBlock {
    pub text: String,
    pub media_url: Option<String>,
    pub media_urls: Vec<String>,
}

/// Command-authorization verdict.
#[derive(Debug, Clone)]
pub enum AuthVerdict {
    Allow,
    Deny { reason: String },
}

/// Evaluates whether a raw message body that parses as a command is allowed
/// to run — this core only calls the policy and enforces its verdict.
#[async_trait::async_trait]
pub trait CommandAuthorizer: Send + Sync {
    async fn authorize(&self, raw_body: &str, ctx: &InboundContext) -> AuthVerdict;
}

/// Persists decrypted/downloaded media bytes somewhere the agent runtime can
/// read them back from, returning an opaque path/URL reference.
#[async_trait::async_trait]
pub trait MediaSink: Send + Sync {
    async fn save(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
        suggested_name: Option<&str>,
    ) -> Result<String, String>;
}

/// Records inbound session metadata — persistence itself is the agent
/// runtime's job; this is the write-through seam.
#[async_trait::async_trait]
pub trait SessionRecorder: Send + Sync {
    async fn record_inbound(&self, session_key: &str, ctx: &InboundContext);
}

/// The agent runtime itself: resolves a route, then dispatches with a
/// streaming block callback. `dispatch` hands blocks back over `tx` in
/// delivery order rather than a boxed callback, keeping the streaming
/// contract an explicit channel instead of a trait-object callback.
#[async_trait::async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn route(&self, ctx: &InboundContext) -> Result<RouteResolution, String>;

    async fn dispatch(&self, ctx: InboundContext, tx: mpsc::Sender<AgentBlock>) -> Result<(), String>;
}
