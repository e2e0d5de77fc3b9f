use anyhow::Result;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use shared::{topics, EventPublisher, OrderCreatedEvent};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info};

use crate::models::OutboxEvent;
use crate::schema::order_outbox;
use crate::store::DbPool;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const BATCH_SIZE: i64 = 100;

/// Relays outbox rows to the bus and marks them published only after the
/// broker acks. A failed publish is retried on the next tick, so delivery is
/// at least once.
pub struct OutboxRelay<P: EventPublisher> {
    pool: DbPool,
    publisher: P,
}

impl<P: EventPublisher> OutboxRelay<P> {
    pub fn new(pool: DbPool, publisher: P) -> Self {
        Self { pool, publisher }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("outbox relay stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.drain().await {
                        error!("error draining outbox: {e:#}");
                    }
                }
            }
        }
    }

    async fn drain(&self) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("connection pool error: {e}"))?;

        let pending = order_outbox::table
            .filter(order_outbox::published.eq(false))
            .order(order_outbox::created_at.asc())
            .limit(BATCH_SIZE)
            .select(OutboxEvent::as_select())
            .load::<OutboxEvent>(&mut conn)
            .await?;

        for event in pending {
            let Some(topic) = topic_for(&event.event_type) else {
                // Mark it published so one bad row cannot wedge the relay.
                error!(
                    "outbox event {} has unrecognized type {:?}, dropping",
                    event.id, event.event_type
                );
                diesel::update(order_outbox::table.filter(order_outbox::id.eq(event.id)))
                    .set(order_outbox::published.eq(true))
                    .execute(&mut conn)
                    .await?;
                continue;
            };

            let payload = serde_json::to_vec(&event.payload)?;
            let key = event.aggregate_id.to_string();
            if let Err(e) = self.publisher.publish(topic, &key, &payload).await {
                error!("failed to publish outbox event {}: {e}", event.id);
                continue;
            }

            diesel::update(order_outbox::table.filter(order_outbox::id.eq(event.id)))
                .set(order_outbox::published.eq(true))
                .execute(&mut conn)
                .await?;

            info!("published outbox event {} to {topic}", event.id);
        }

        Ok(())
    }
}

fn topic_for(event_type: &str) -> Option<&'static str> {
    match event_type {
        OrderCreatedEvent::EVENT_TYPE => Some(topics::ORDER_CREATED),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_created_routes_to_its_topic() {
        assert_eq!(topic_for("OrderCreated"), Some("order.created"));
    }

    #[test]
    fn unknown_event_types_have_no_topic() {
        assert_eq!(topic_for("SomethingElse"), None);
    }
}
