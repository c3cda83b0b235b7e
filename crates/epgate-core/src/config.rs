//! Typed configuration tree, loaded from TOML with `EPGATE_`-prefixed
//! environment overrides.

use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::types::ResolvedAccount;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_webhook_base() -> String {
    "/ep".to_string()
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_media_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_token_refresh_skew_secs() -> i64 {
    300
}

fn default_api_base_url() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}

fn default_debounce_ms() -> u64 {
    1500
}

fn default_table_mode() -> String {
    "plain_text".to_string()
}

fn default_media_dir() -> String {
    "./data/media".to_string()
}

/// Per-account entry as it appears under `[accounts.<name>]` in TOML, or via
/// `EPGATE_ACCOUNTS_<NAME>_*` env overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub corp_id: String,
    pub app_id: String,
    pub secret: String,
    pub token: String,
    pub encoding_aes_key: String,
    #[serde(default)]
    pub welcome_text: Option<String>,
    #[serde(default)]
    pub application_dm_configured: bool,
    /// User ids allowed to run slash commands for this account. Empty means
    /// unrestricted — the gateway's default `CommandAuthorizer` only enforces
    /// an allowlist when one is configured.
    #[serde(default)]
    pub command_allowlist: Vec<String>,
}

impl AccountConfig {
    pub fn into_resolved(self, name: String) -> ResolvedAccount {
        ResolvedAccount {
            name,
            corp_id: self.corp_id,
            app_id: self.app_id,
            secret: self.secret,
            token: self.token,
            encoding_aes_key: self.encoding_aes_key,
            welcome_text: self.welcome_text,
            stream_placeholder_content: "1".to_string(),
            application_dm_configured: self.application_dm_configured,
        }
    }
}

/// Webhook mount-path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default = "default_webhook_base")]
    pub base_path: String,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            base_path: default_webhook_base(),
        }
    }
}

/// Outbound network tuning: timeouts, egress proxy, media caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_media_max_bytes")]
    pub media_max_bytes: u64,
    #[serde(default)]
    pub egress_proxy: Option<String>,
    #[serde(default = "default_token_refresh_skew_secs")]
    pub token_refresh_skew_secs: i64,
    /// EP's API origin (outbound client + token fetcher both hang endpoints
    /// off this); overridable for on-prem/sandboxed deployments.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
            media_max_bytes: default_media_max_bytes(),
            egress_proxy: None,
            token_refresh_skew_secs: default_token_refresh_skew_secs(),
            api_base_url: default_api_base_url(),
        }
    }
}

/// Top-level gateway configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    /// How batches debounce before flushing to the agent (`debounceMs`) —
    /// one gateway-wide value rather than per-account, since EP does not
    /// expose per-account timing guidance.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Markdown-table rendering mode applied to delivered blocks, after
    /// think-tag-protected table conversion: `"off"` or `"plain_text"`.
    #[serde(default = "default_table_mode")]
    pub table_mode: String,
    /// Directory the composition root's filesystem media sink saves
    /// decrypted/downloaded attachments under. This core doesn't own durable
    /// message storage, but the `MediaSink` seam it calls into needs
    /// somewhere real to write bytes.
    #[serde(default = "default_media_dir")]
    pub media_dir: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            webhooks: WebhooksConfig::default(),
            network: NetworkConfig::default(),
            accounts: HashMap::new(),
            debounce_ms: default_debounce_ms(),
            table_mode: default_table_mode(),
            media_dir: default_media_dir(),
        }
    }
}

impl GatewayConfig {
    /// Load from an optional TOML file, overlaid with `EPGATE_`-prefixed
    /// environment variables (`EPGATE_BIND_ADDR`, `EPGATE_NETWORK_HTTP_TIMEOUT_SECS`, ...).
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("EPGATE_").split("_"));
        let mut config: GatewayConfig = figment
            .extract()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        // `EGRESS_PROXY_URL` (and its `EGRESS_PROXY` alias) override
        // `network.egressProxyUrl` outside the `EPGATE_`-prefixed scheme.
        if let Ok(proxy) = std::env::var("EGRESS_PROXY_URL").or_else(|_| std::env::var("EGRESS_PROXY")) {
            config.network.egress_proxy = Some(proxy);
        }

        Ok(config)
    }

    pub fn resolved_accounts(&self) -> HashMap<String, ResolvedAccount> {
        self.accounts
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.clone().into_resolved(name.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bind_addr() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.webhooks.base_path, "/ep");
    }

    #[test]
    fn load_with_no_file_falls_back_to_env_and_defaults() {
        std::env::set_var("EPGATE_BIND_ADDR", "127.0.0.1:9000");
        let cfg = GatewayConfig::load(None).expect("load should fall back to defaults");
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        std::env::remove_var("EPGATE_BIND_ADDR");
    }
}
