use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::OrderCreatedEvent;
use thiserror::Error;

use crate::models::{NewProcessedOrder, StockRecord};
use crate::schema::{processed_orders, stock_records};

pub type DbPool = Pool<AsyncPgConnection>;

/// Outcome labels stored on the per-order dedup row.
pub mod outcome {
    pub const APPLIED: &str = "applied";
    pub const INSUFFICIENT: &str = "insufficient";
    pub const NOT_FOUND: &str = "not_found";
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("query error: {0}")]
    Query(#[from] diesel::result::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecrementOutcome {
    Applied { record: StockRecord },
    AlreadyApplied,
    InsufficientStock,
    NotFound,
}

/// The stock ledger: the only writer of stock records. All mutation goes
/// through the conditional decrement, so `stock >= 0` always holds.
#[async_trait]
pub trait StockLedger: Send + Sync {
    /// Bootstrap only. Idempotent: a no-op when the product is already seeded.
    async fn seed(&self, product_id: i32, initial_stock: i32) -> Result<(), LedgerError>;

    /// One atomic conditional write. Succeeds with the new record only if
    /// `stock >= quantity`; otherwise the ledger is left untouched. A missing
    /// row fails with `NotFound` and is never materialized.
    async fn decrement(
        &self,
        product_id: i32,
        quantity: i32,
    ) -> Result<DecrementOutcome, LedgerError>;

    /// The decrement guarded by the per-order dedup record, in a single
    /// transaction. Redelivering the same order id is a no-op.
    async fn apply_order(&self, event: &OrderCreatedEvent)
        -> Result<DecrementOutcome, LedgerError>;

    async fn get(&self, product_id: i32) -> Result<Option<StockRecord>, LedgerError>;

    async fn list(&self) -> Result<Vec<StockRecord>, LedgerError>;
}

#[derive(Clone)]
pub struct PgStockLedger {
    pool: DbPool,
}

impl PgStockLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StockLedger for PgStockLedger {
    async fn seed(&self, product_id: i32, initial_stock: i32) -> Result<(), LedgerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LedgerError::Pool(e.to_string()))?;

        diesel::insert_into(stock_records::table)
            .values(&StockRecord {
                product_id,
                stock: initial_stock,
                updated_at: Utc::now(),
            })
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn decrement(
        &self,
        product_id: i32,
        quantity: i32,
    ) -> Result<DecrementOutcome, LedgerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LedgerError::Pool(e.to_string()))?;

        Ok(conditional_decrement(&mut conn, product_id, quantity).await?)
    }

    async fn apply_order(
        &self,
        event: &OrderCreatedEvent,
    ) -> Result<DecrementOutcome, LedgerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LedgerError::Pool(e.to_string()))?;

        let event = event.clone();
        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                let claimed = diesel::insert_into(processed_orders::table)
                    .values(&NewProcessedOrder {
                        order_id: event.order_id,
                        product_id: event.product_id,
                        quantity: event.quantity,
                        outcome: outcome::APPLIED.to_string(),
                    })
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;
                if claimed == 0 {
                    return Ok(DecrementOutcome::AlreadyApplied);
                }

                let result = conditional_decrement(conn, event.product_id, event.quantity).await?;
                let failure = match &result {
                    DecrementOutcome::InsufficientStock => Some(outcome::INSUFFICIENT),
                    DecrementOutcome::NotFound => Some(outcome::NOT_FOUND),
                    _ => None,
                };
                if let Some(label) = failure {
                    diesel::update(processed_orders::table.find(event.order_id))
                        .set(processed_orders::outcome.eq(label))
                        .execute(conn)
                        .await?;
                }

                Ok(result)
            })
        })
        .await
    }

    async fn get(&self, product_id: i32) -> Result<Option<StockRecord>, LedgerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LedgerError::Pool(e.to_string()))?;

        let record = stock_records::table
            .find(product_id)
            .select(StockRecord::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<StockRecord>, LedgerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LedgerError::Pool(e.to_string()))?;

        let records = stock_records::table
            .order(stock_records::product_id.asc())
            .select(StockRecord::as_select())
            .load(&mut conn)
            .await?;
        Ok(records)
    }
}

/// The compare-and-decrement itself: the `stock >= quantity` guard lives in
/// the UPDATE, so there is no read-then-write window. The follow-up probe only
/// classifies a failed guard as short stock versus a missing row.
async fn conditional_decrement(
    conn: &mut AsyncPgConnection,
    product_id: i32,
    quantity: i32,
) -> Result<DecrementOutcome, diesel::result::Error> {
    let updated = diesel::update(
        stock_records::table
            .filter(stock_records::product_id.eq(product_id))
            .filter(stock_records::stock.ge(quantity)),
    )
    .set((
        stock_records::stock.eq(stock_records::stock - quantity),
        stock_records::updated_at.eq(Utc::now()),
    ))
    .returning(StockRecord::as_returning())
    .get_result(conn)
    .await
    .optional()?;

    match updated {
        Some(record) => Ok(DecrementOutcome::Applied { record }),
        None => {
            let exists = diesel::select(diesel::dsl::exists(
                stock_records::table.filter(stock_records::product_id.eq(product_id)),
            ))
            .get_result::<bool>(conn)
            .await?;
            Ok(if exists {
                DecrementOutcome::InsufficientStock
            } else {
                DecrementOutcome::NotFound
            })
        }
    }
}
