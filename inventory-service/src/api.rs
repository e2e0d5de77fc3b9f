use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::ledger::{LedgerError, PgStockLedger, StockLedger};
use crate::models::StockRecord;

#[derive(Clone)]
pub struct AppState {
    pub ledger: PgStockLedger,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Ledger(e) = &self;
        error!("inventory request failed: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "inventory store unavailable".to_string(),
            }),
        )
            .into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/inventory", get(list_inventory))
        .route("/inventory/:product_id", get(get_inventory))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn get_inventory(
    State(state): State<AppState>,
    Path(product_id): Path<i32>,
) -> Result<Response, ApiError> {
    match state.ledger.get(product_id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

pub async fn list_inventory(
    State(state): State<AppState>,
) -> Result<Json<Vec<StockRecord>>, ApiError> {
    Ok(Json(state.ledger.list().await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}
