//! Concrete implementations of the `epgate_core::runtime` seams. The agent
//! runtime, command-authorization policy, media persistence, and session
//! recording all live outside this core's actual scope; these are the
//! minimal real implementations the composition root wires in so the
//! binary is runnable end to end.

use std::collections::HashMap;
use std::path::PathBuf;

use epgate_core::runtime::{AgentBlock, AgentRuntime, AuthVerdict, CommandAuthorizer, InboundContext, MediaSink, RouteResolution, SessionRecorder};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Denies a command only when the account has a non-empty configured
/// allowlist and the sender isn't on it — an empty allowlist means the
/// account hasn't opted into restricting commands at all.
pub struct AllowlistAuthorizer {
    allowlists: HashMap<String, Vec<String>>,
}

impl AllowlistAuthorizer {
    pub fn new(allowlists: HashMap<String, Vec<String>>) -> Self {
        Self { allowlists }
    }
}

#[async_trait::async_trait]
impl CommandAuthorizer for AllowlistAuthorizer {
    async fn authorize(&self, _raw_body: &str, ctx: &InboundContext) -> AuthVerdict {
        match self.allowlists.get(&ctx.account) {
            Some(allowed) if !allowed.is_empty() && !allowed.contains(&ctx.source_address) => AuthVerdict::Deny {
                reason: "sender is not on this account's command allowlist".to_string(),
            },
            _ => AuthVerdict::Allow,
        }
    }
}

/// Saves attachment bytes under a configured root directory, keyed by
/// stream id so concurrent streams never collide on a filename.
pub struct FsMediaSink {
    root: PathBuf,
}

impl FsMediaSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn extension_for(content_type: Option<&str>, suggested_name: Option<&str>) -> String {
        if let Some(name) = suggested_name {
            if let Some(ext) = name.rsplit('.').next().filter(|e| *e != name) {
                return ext.to_string();
            }
        }
        match content_type {
            Some(ct) if ct.contains("png") => "png".to_string(),
            Some(ct) if ct.contains("jpeg") || ct.contains("jpg") => "jpg".to_string(),
            Some(ct) if ct.contains("gif") => "gif".to_string(),
            Some(ct) if ct.contains("pdf") => "pdf".to_string(),
            Some(ct) if ct.contains("text") => "txt".to_string(),
            _ => "bin".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl MediaSink for FsMediaSink {
    async fn save(&self, bytes: &[u8], content_type: Option<&str>, suggested_name: Option<&str>) -> Result<String, String> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| e.to_string())?;
        let ext = Self::extension_for(content_type, suggested_name);
        let name = format!("{}.{ext}", epgate_core::types::StreamId::generate());
        let path = self.root.join(&name);
        tokio::fs::write(&path, bytes).await.map_err(|e| e.to_string())?;
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Logs inbound session metadata — real session persistence is the agent
/// runtime's job, so this write-through only traces.
pub struct LoggingSessionRecorder;

#[async_trait::async_trait]
impl SessionRecorder for LoggingSessionRecorder {
    async fn record_inbound(&self, session_key: &str, ctx: &InboundContext) {
        info!(session_key, account = %ctx.account, chat_type = ?ctx.chat_type, "inbound session recorded");
    }
}

/// Placeholder agent runtime: the internal agent this gateway forwards to
/// is an external collaborator, not owned by this codebase. This stub
/// routes every message to a single synthetic agent/session and echoes the
/// inbound body back as one block, so the binary is runnable and testable
/// end to end pending the real runtime being wired in at this same seam.
pub struct PlaceholderAgentRuntime;

#[async_trait::async_trait]
impl AgentRuntime for PlaceholderAgentRuntime {
    async fn route(&self, ctx: &InboundContext) -> Result<RouteResolution, String> {
        Ok(RouteResolution {
            agent_id: "default".to_string(),
            session_key: ctx.session_key.clone(),
            account_id: ctx.account.clone(),
        })
    }

    async fn dispatch(&self, ctx: InboundContext, tx: mpsc::Sender<AgentBlock>) -> Result<(), String> {
        warn!(account = %ctx.account, "dispatching to the placeholder agent runtime — wire in the real runtime before production use");
        let block = AgentBlock {
            text: format!("[placeholder agent] received: {}", ctx.raw_body),
            ..Default::default()
        };
        tx.send(block).await.map_err(|e| e.to_string())
    }
}
