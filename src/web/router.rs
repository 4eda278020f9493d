use axum::{
    Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::{
    modules,
    web::{AppState, auth},
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/healthz", get(healthz))
        .merge(modules::items::router())
        .merge(modules::transcripts::router())
        .merge(modules::verify::router())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
