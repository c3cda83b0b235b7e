//! Application-channel webhook route: `/<base>/agent`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use epgate_app::AppQuery;
use serde::Deserialize;
use tracing::warn;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct AppGetParams {
    pub timestamp: String,
    pub nonce: String,
    #[serde(alias = "msgsignature", alias = "signature")]
    pub msg_signature: String,
    pub echostr: String,
}

#[derive(Debug, Deserialize)]
pub struct AppPostParams {
    pub timestamp: String,
    pub nonce: String,
    #[serde(alias = "msgsignature", alias = "signature")]
    pub msg_signature: String,
}

pub async fn handle_get(State(state): State<Arc<AppState>>, Query(params): Query<AppGetParams>) -> Response {
    let query = AppQuery {
        timestamp: params.timestamp,
        nonce: params.nonce,
        msg_signature: params.msg_signature,
    };
    match state.app.handle_get(&state.accounts, &query, &params.echostr) {
        Ok(plaintext) => (StatusCode::OK, plaintext).into_response(),
        Err(e) => {
            warn!(error = %e, code = e.code(), "application webhook GET rejected");
            (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST), e.code()).into_response()
        }
    }
}

/// POST always responds the literal `success` once admission completes —
/// replies ride the outbound API, not this response body.
pub async fn handle_post(State(state): State<Arc<AppState>>, Query(params): Query<AppPostParams>, body: Bytes) -> Response {
    let query = AppQuery {
        timestamp: params.timestamp,
        nonce: params.nonce,
        msg_signature: params.msg_signature,
    };
    match state.app.handle_post(&state.accounts, &query, &body).await {
        Ok(reply) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], reply).into_response(),
        Err(e) => {
            warn!(error = %e, code = e.code(), "application webhook POST rejected");
            (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST), e.code()).into_response()
        }
    }
}
