//! Composition root: replaces module-level singletons with one place that
//! wires stores into handlers. Builds every collaborator once and assembles
//! the Axum router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use epgate_app::{AppHandler, DedupeCache};
use epgate_bot::BotHandler;
use epgate_client::http::Dispatcher;
use epgate_client::token::HttpTokenFetcher;
use epgate_client::{OutboundClient, TokenCache};
use epgate_core::config::GatewayConfig;
use epgate_core::runtime::{AgentRuntime, CommandAuthorizer, MediaSink, SessionRecorder};
use epgate_core::types::ResolvedAccount;
use epgate_driver::{Driver, TableMode};
use epgate_store::{ActiveReplyStore, ConversationStore};

use crate::seams::{AllowlistAuthorizer, FsMediaSink, LoggingSessionRecorder, PlaceholderAgentRuntime};

/// Concrete driver type this binary wires everywhere — the only
/// `TokenFetcher` implementation the composition root needs is the HTTP one.
pub type GatewayDriver = Driver<HttpTokenFetcher>;

pub struct AppState {
    pub config: GatewayConfig,
    pub accounts: Vec<ResolvedAccount>,
    pub store: Arc<ConversationStore<GatewayDriver>>,
    pub bot: Arc<BotHandler<GatewayDriver>>,
    pub app: Arc<AppHandler<GatewayDriver, HttpTokenFetcher>>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let resolved = config.resolved_accounts();
        let accounts: Vec<ResolvedAccount> = resolved.values().cloned().collect();

        let driver_accounts = Arc::new(DashMap::new());
        for account in resolved.values() {
            driver_accounts.insert(account.name.clone(), account.clone());
        }

        let mut token_client_builder = reqwest::Client::builder().timeout(Duration::from_secs(config.network.http_timeout_secs));
        if let Some(proxy_url) = &config.network.egress_proxy {
            if let Ok(proxy) = reqwest::Proxy::all(proxy_url) {
                token_client_builder = token_client_builder.proxy(proxy);
            } else {
                tracing::warn!(proxy = %proxy_url, "egress proxy URL is invalid, ignoring");
            }
        }
        let token_http = token_client_builder.build().unwrap_or_default();
        let token_endpoint = format!("{}/cgi-bin/gettoken", config.network.api_base_url);
        let tokens = Arc::new(TokenCache::new(HttpTokenFetcher::new(token_http, token_endpoint)));

        let dispatcher = Arc::new(Dispatcher::new(Some(config.network.http_timeout_secs)));
        let outbound = Arc::new(OutboundClient::new(dispatcher.clone(), tokens, config.network.api_base_url.clone()));
        let active_replies = Arc::new(ActiveReplyStore::new());

        let allowlists: HashMap<String, Vec<String>> = config
            .accounts
            .iter()
            .map(|(name, account)| (name.clone(), account.command_allowlist.clone()))
            .collect();
        let authorizer: Arc<dyn CommandAuthorizer> = Arc::new(AllowlistAuthorizer::new(allowlists));
        let media_sink: Arc<dyn MediaSink> = Arc::new(FsMediaSink::new(config.media_dir.clone()));
        let sessions: Arc<dyn SessionRecorder> = Arc::new(LoggingSessionRecorder);
        let agent: Arc<dyn AgentRuntime> = Arc::new(PlaceholderAgentRuntime);

        let table_mode = match config.table_mode.as_str() {
            "off" => TableMode::Off,
            _ => TableMode::PlainText,
        };

        let driver = Driver::new(
            outbound.clone(),
            active_replies.clone(),
            agent,
            authorizer,
            media_sink.clone(),
            sessions,
            dispatcher,
            driver_accounts,
            table_mode,
        );
        let store = ConversationStore::new(driver.clone());
        driver.attach_store(store.clone());

        let bot = Arc::new(BotHandler::new(store.clone(), active_replies, config.debounce_ms));
        let app = Arc::new(AppHandler::new(store.clone(), Arc::new(DedupeCache::new()), media_sink, outbound, config.debounce_ms));

        Arc::new(Self { config, accounts, store, bot, app })
    }
}

/// Assembles the full router: `/<base>` and `/<base>/bot` for the Bot
/// channel, `/<base>/agent` for the Application channel.
pub fn build_router(state: Arc<AppState>) -> Router {
    let base = state.config.webhooks.base_path.clone();
    let bot_path = format!("{base}/bot");
    let agent_path = format!("{base}/agent");

    Router::new()
        .route(&base, get(crate::http::bot::handle_get).post(crate::http::bot::handle_post))
        .route(&bot_path, get(crate::http::bot::handle_get).post(crate::http::bot::handle_post))
        .route(&agent_path, get(crate::http::agent::handle_get).post(crate::http::agent::handle_post))
        .route("/health", get(crate::http::health::handle_health))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
