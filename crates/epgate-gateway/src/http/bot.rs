//! Bot-channel webhook routes: `/<base>` and `/<base>/bot`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use epgate_bot::BotQuery;
use serde::Deserialize;
use tracing::warn;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct BotGetParams {
    pub timestamp: String,
    pub nonce: String,
    #[serde(alias = "msgsignature", alias = "signature")]
    pub msg_signature: String,
    pub echostr: String,
}

#[derive(Debug, Deserialize)]
pub struct BotPostParams {
    pub timestamp: String,
    pub nonce: String,
    #[serde(alias = "msgsignature", alias = "signature")]
    pub msg_signature: String,
}

pub async fn handle_get(State(state): State<Arc<AppState>>, Query(params): Query<BotGetParams>) -> Response {
    let query = BotQuery {
        timestamp: params.timestamp,
        nonce: params.nonce,
        msg_signature: params.msg_signature,
    };
    match state.bot.handle_get(&state.accounts, &query, &params.echostr) {
        Ok(plaintext) => (StatusCode::OK, plaintext).into_response(),
        Err(e) => {
            warn!(error = %e, code = e.code(), "bot webhook GET rejected");
            (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST), e.code()).into_response()
        }
    }
}

pub async fn handle_post(State(state): State<Arc<AppState>>, Query(params): Query<BotPostParams>, body: Bytes) -> Response {
    let query = BotQuery {
        timestamp: params.timestamp,
        nonce: params.nonce,
        msg_signature: params.msg_signature,
    };
    match state.bot.handle_post(&state.accounts, &query, &body).await {
        Ok(value) => {
            let body = serde_json::to_string(&value).unwrap_or_default();
            (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
        }
        Err(e) => {
            warn!(error = %e, code = e.code(), "bot webhook POST rejected");
            (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST), e.code()).into_response()
        }
    }
}
