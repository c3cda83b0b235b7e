use axum::http::StatusCode;

pub async fn handle_health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}
