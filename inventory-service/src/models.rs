use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

/// Durable per-product counter. `stock` never goes below zero: the only
/// mutation path is the conditional decrement in the ledger.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = crate::schema::stock_records)]
#[serde(rename_all = "camelCase")]
pub struct StockRecord {
    pub product_id: i32,
    pub stock: i32,
    pub updated_at: DateTime<Utc>,
}

/// Per-order dedup record; its presence makes redelivery a no-op.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::processed_orders)]
pub struct NewProcessedOrder {
    pub order_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub outcome: String,
}
