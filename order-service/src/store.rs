use anyhow::Result;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::OrderCreatedEvent;
use uuid::Uuid;

use crate::models::{NewOrder, NewOutboxEvent, Order};
use crate::schema::{order_outbox, orders};

pub type DbPool = Pool<AsyncPgConnection>;

/// Persist the order and its outbox row in one local transaction. The relay
/// publishes the event afterwards, so an accepted order can never be stranded
/// without a corresponding `OrderCreated`.
pub async fn create_order(
    pool: &DbPool,
    product_id: i32,
    quantity: i32,
    total_price: BigDecimal,
) -> Result<Order> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("connection pool error: {e}"))?;

    let new_order = NewOrder {
        product_id,
        quantity,
        total_price,
        status: "Created".to_string(),
    };

    let order = conn
        .transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let order: Order = diesel::insert_into(orders::table)
                    .values(&new_order)
                    .returning(Order::as_returning())
                    .get_result(conn)
                    .await?;

                let event = OrderCreatedEvent {
                    order_id: order.id,
                    product_id: order.product_id,
                    quantity: order.quantity,
                };
                let outbox_event = NewOutboxEvent {
                    id: Uuid::new_v4(),
                    aggregate_id: order.id,
                    event_type: OrderCreatedEvent::EVENT_TYPE.to_string(),
                    payload: serde_json::to_value(&event)?,
                };
                diesel::insert_into(order_outbox::table)
                    .values(&outbox_event)
                    .execute(conn)
                    .await?;

                Ok(order)
            })
        })
        .await?;

    Ok(order)
}

pub async fn get_order(pool: &DbPool, id: i32) -> Result<Option<Order>> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("connection pool error: {e}"))?;

    let order = orders::table
        .find(id)
        .select(Order::as_select())
        .first(&mut conn)
        .await
        .optional()?;
    Ok(order)
}

pub async fn list_orders(pool: &DbPool) -> Result<Vec<Order>> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("connection pool error: {e}"))?;

    let orders = orders::table
        .order(orders::created_at.desc())
        .select(Order::as_select())
        .load(&mut conn)
        .await?;
    Ok(orders)
}
