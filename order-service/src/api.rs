use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::catalog::CatalogClient;
use crate::models::Order;
use crate::store::{self, DbPool};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub catalog: CatalogClient,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub product_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("{0}")]
    Validation(String),
    #[error("insufficient stock available")]
    InsufficientStock,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrderError::Validation(_) | OrderError::InsufficientStock => StatusCode::BAD_REQUEST,
            OrderError::Internal(e) => {
                error!("order request failed: {e:#}");
                StatusCode::BAD_GATEWAY
            }
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), OrderError> {
    validate(&request)?;

    // Advisory check only: the snapshot is stale by the time the order is
    // admitted, and nothing is reserved here. The reconciler's conditional
    // decrement is what actually protects the ledger.
    let info = match state.catalog.check_availability(request.product_id).await {
        Some(info) if info.available && info.stock >= request.quantity => info,
        _ => return Err(OrderError::InsufficientStock),
    };

    let total_price = order_total(info.price, request.quantity)?;
    let order =
        store::create_order(&state.pool, request.product_id, request.quantity, total_price)
            .await?;

    info!(
        "order {} accepted: product {} x{}",
        order.id, order.product_id, order.quantity
    );
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Response, OrderError> {
    match store::get_order(&state.pool, id).await? {
        Some(order) => Ok(Json(order).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

pub async fn list_orders(State(state): State<AppState>) -> Result<Json<Vec<Order>>, OrderError> {
    Ok(Json(store::list_orders(&state.pool).await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}

fn validate(request: &CreateOrderRequest) -> Result<(), OrderError> {
    if request.product_id <= 0 {
        return Err(OrderError::Validation("productId must be positive".to_string()));
    }
    if request.quantity <= 0 {
        return Err(OrderError::Validation("quantity must be positive".to_string()));
    }
    Ok(())
}

// f64 -> decimal via the shortest string form; from_f64 would carry the full
// binary expansion into the stored price.
fn order_total(unit_price: f64, quantity: i32) -> Result<BigDecimal, anyhow::Error> {
    let unit: BigDecimal = unit_price
        .to_string()
        .parse()
        .map_err(|e| anyhow::anyhow!("catalog returned unusable price {unit_price}: {e}"))?;
    Ok(unit * BigDecimal::from(quantity))
}
