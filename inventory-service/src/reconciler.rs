use std::time::Duration;

use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use shared::{topics, BusError, EventPublisher, OrderCreatedEvent, StockUpdatedEvent};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::ledger::{DecrementOutcome, LedgerError, StockLedger};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Publish(#[from] BusError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct Reconciler<L: StockLedger, P: EventPublisher> {
    ledger: L,
    publisher: P,
    dlq_topic: String,
}

impl<L: StockLedger, P: EventPublisher> Reconciler<L, P> {
    pub fn new(ledger: L, publisher: P) -> Self {
        Self {
            ledger,
            publisher,
            dlq_topic: topics::ORDER_CREATED_DLQ.to_string(),
        }
    }

    /// Single consume loop per consumer handle. Blocks on the stream until
    /// shutdown is signalled; the in-flight message is always finished before
    /// the loop exits and the handle is released.
    pub async fn run(self, consumer: StreamConsumer, mut shutdown: watch::Receiver<bool>) {
        let mut stream = consumer.stream();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("reconciler stopping");
                    break;
                }
                message = stream.next() => match message {
                    Some(Ok(m)) => self.process(&consumer, &m).await,
                    Some(Err(e)) => error!("error receiving message: {e}"),
                    None => break,
                },
            }
        }

        drop(stream);
        info!("consumer released");
    }

    async fn process(&self, consumer: &StreamConsumer, m: &BorrowedMessage<'_>) {
        let key = m
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();
        let payload = m.payload().unwrap_or_default();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.handle_payload(&key, payload).await {
                Ok(()) => {
                    // Commit only once the decrement-and-publish sequence is
                    // done; committing on receipt loses messages on crash.
                    if let Err(e) = consumer.commit_message(m, CommitMode::Async) {
                        error!("error committing offset: {e}");
                    }
                    return;
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!("attempt {attempt} failed, retrying: {e}");
                    sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    error!("giving up after {attempt} attempts, dead-lettering: {e}");
                    match self.publisher.publish(&self.dlq_topic, &key, payload).await {
                        Ok(()) => {
                            if let Err(e) = consumer.commit_message(m, CommitMode::Async) {
                                error!("error committing offset: {e}");
                            }
                        }
                        // Leave the offset uncommitted so the message is
                        // redelivered rather than lost.
                        Err(e) => error!("dead-letter publish failed: {e}"),
                    }
                }
            }
        }
    }

    /// Processing for one raw message. Undecodable payloads go straight to the
    /// dead-letter topic; transient ledger or publish failures bubble up to
    /// the bounded-retry policy in `process`.
    pub async fn handle_payload(&self, key: &str, payload: &[u8]) -> Result<(), ReconcileError> {
        let event: OrderCreatedEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("undecodable message on {}: {e}", topics::ORDER_CREATED);
                self.publisher.publish(&self.dlq_topic, key, payload).await?;
                return Ok(());
            }
        };

        match self.ledger.apply_order(&event).await? {
            DecrementOutcome::Applied { record } => {
                let update = StockUpdatedEvent {
                    product_id: record.product_id,
                    new_stock: record.stock,
                    updated_at: record.updated_at,
                };
                let body = serde_json::to_vec(&update)?;
                self.publisher
                    .publish(topics::STOCK_UPDATED, &record.product_id.to_string(), &body)
                    .await?;
                info!(
                    "order {} reconciled: product {} stock now {}",
                    event.order_id, record.product_id, record.stock
                );
            }
            DecrementOutcome::AlreadyApplied => {
                // Redelivery after a crash between decrement and publish lands
                // here without re-emitting stock.updated.
                warn!("order {} already applied, skipping redelivery", event.order_id);
            }
            DecrementOutcome::InsufficientStock => {
                error!(
                    "reconciliation failed for order {}: insufficient stock for product {} x{}",
                    event.order_id, event.product_id, event.quantity
                );
            }
            DecrementOutcome::NotFound => {
                error!(
                    "reconciliation failed for order {}: product {} is not in the ledger",
                    event.order_id, event.product_id
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use shared::MemoryEventPublisher;

    use super::*;
    use crate::models::StockRecord;

    #[derive(Clone, Default)]
    struct MemoryStockLedger {
        inner: Arc<Mutex<LedgerState>>,
    }

    #[derive(Default)]
    struct LedgerState {
        records: HashMap<i32, StockRecord>,
        processed: HashSet<i32>,
    }

    impl MemoryStockLedger {
        fn new() -> Self {
            Self::default()
        }

        fn stock(&self, product_id: i32) -> Option<i32> {
            self.inner
                .lock()
                .unwrap()
                .records
                .get(&product_id)
                .map(|r| r.stock)
        }
    }

    #[async_trait]
    impl StockLedger for MemoryStockLedger {
        async fn seed(&self, product_id: i32, initial_stock: i32) -> Result<(), LedgerError> {
            let mut state = self.inner.lock().unwrap();
            state.records.entry(product_id).or_insert_with(|| StockRecord {
                product_id,
                stock: initial_stock,
                updated_at: Utc::now(),
            });
            Ok(())
        }

        async fn decrement(
            &self,
            product_id: i32,
            quantity: i32,
        ) -> Result<DecrementOutcome, LedgerError> {
            let mut state = self.inner.lock().unwrap();
            match state.records.get_mut(&product_id) {
                None => Ok(DecrementOutcome::NotFound),
                Some(record) if record.stock < quantity => Ok(DecrementOutcome::InsufficientStock),
                Some(record) => {
                    record.stock -= quantity;
                    record.updated_at = Utc::now();
                    Ok(DecrementOutcome::Applied {
                        record: record.clone(),
                    })
                }
            }
        }

        async fn apply_order(
            &self,
            event: &OrderCreatedEvent,
        ) -> Result<DecrementOutcome, LedgerError> {
            let mut state = self.inner.lock().unwrap();
            if !state.processed.insert(event.order_id) {
                return Ok(DecrementOutcome::AlreadyApplied);
            }
            match state.records.get_mut(&event.product_id) {
                None => Ok(DecrementOutcome::NotFound),
                Some(record) if record.stock < event.quantity => {
                    Ok(DecrementOutcome::InsufficientStock)
                }
                Some(record) => {
                    record.stock -= event.quantity;
                    record.updated_at = Utc::now();
                    Ok(DecrementOutcome::Applied {
                        record: record.clone(),
                    })
                }
            }
        }

        async fn get(&self, product_id: i32) -> Result<Option<StockRecord>, LedgerError> {
            Ok(self.inner.lock().unwrap().records.get(&product_id).cloned())
        }

        async fn list(&self) -> Result<Vec<StockRecord>, LedgerError> {
            let mut records: Vec<_> = self
                .inner
                .lock()
                .unwrap()
                .records
                .values()
                .cloned()
                .collect();
            records.sort_by_key(|r| r.product_id);
            Ok(records)
        }
    }

    fn event_payload(order_id: i32, product_id: i32, quantity: i32) -> Vec<u8> {
        serde_json::to_vec(&OrderCreatedEvent {
            order_id,
            product_id,
            quantity,
        })
        .unwrap()
    }

    fn stock_updates(publisher: &MemoryEventPublisher) -> Vec<StockUpdatedEvent> {
        publisher
            .on_topic(topics::STOCK_UPDATED)
            .iter()
            .map(|r| serde_json::from_slice(&r.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn consuming_an_order_decrements_and_publishes() {
        let ledger = MemoryStockLedger::new();
        ledger.seed(2, 10).await.unwrap();
        let publisher = MemoryEventPublisher::new();
        let reconciler = Reconciler::new(ledger.clone(), publisher.clone());

        reconciler
            .handle_payload("1", &event_payload(1, 2, 3))
            .await
            .unwrap();

        assert_eq!(ledger.stock(2), Some(7));
        let updates = stock_updates(&publisher);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].product_id, 2);
        assert_eq!(updates[0].new_stock, 7);
        // stock.updated is partitioned by productId
        assert_eq!(publisher.on_topic(topics::STOCK_UPDATED)[0].key, "2");
    }

    #[tokio::test]
    async fn redelivered_order_is_applied_once() {
        let ledger = MemoryStockLedger::new();
        ledger.seed(2, 10).await.unwrap();
        let publisher = MemoryEventPublisher::new();
        let reconciler = Reconciler::new(ledger.clone(), publisher.clone());

        let payload = event_payload(1, 2, 3);
        reconciler.handle_payload("1", &payload).await.unwrap();
        reconciler.handle_payload("1", &payload).await.unwrap();

        assert_eq!(ledger.stock(2), Some(7));
        assert_eq!(stock_updates(&publisher).len(), 1);
    }

    #[tokio::test]
    async fn insufficient_stock_leaves_the_ledger_untouched() {
        let ledger = MemoryStockLedger::new();
        ledger.seed(2, 10).await.unwrap();
        let publisher = MemoryEventPublisher::new();
        let reconciler = Reconciler::new(ledger.clone(), publisher.clone());

        reconciler
            .handle_payload("1", &event_payload(1, 2, 15))
            .await
            .unwrap();

        assert_eq!(ledger.stock(2), Some(10));
        assert!(stock_updates(&publisher).is_empty());
    }

    #[tokio::test]
    async fn unknown_product_is_never_materialized() {
        let ledger = MemoryStockLedger::new();
        let publisher = MemoryEventPublisher::new();
        let reconciler = Reconciler::new(ledger.clone(), publisher.clone());

        reconciler
            .handle_payload("9", &event_payload(9, 99, 1))
            .await
            .unwrap();

        assert_eq!(ledger.get(99).await.unwrap(), None);
        assert!(stock_updates(&publisher).is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_goes_to_dead_letter() {
        let ledger = MemoryStockLedger::new();
        let publisher = MemoryEventPublisher::new();
        let reconciler = Reconciler::new(ledger.clone(), publisher.clone());

        reconciler
            .handle_payload("k", b"not an event")
            .await
            .unwrap();

        let dead_letters = publisher.on_topic(topics::ORDER_CREATED_DLQ);
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].payload, b"not an event");
        assert_eq!(dead_letters[0].key, "k");
        assert!(stock_updates(&publisher).is_empty());
    }

    #[tokio::test]
    async fn same_product_orders_reconcile_in_publish_order() {
        let ledger = MemoryStockLedger::new();
        ledger.seed(5, 10).await.unwrap();
        let publisher = MemoryEventPublisher::new();
        let reconciler = Reconciler::new(ledger.clone(), publisher.clone());

        reconciler
            .handle_payload("1", &event_payload(1, 5, 4))
            .await
            .unwrap();
        reconciler
            .handle_payload("2", &event_payload(2, 5, 3))
            .await
            .unwrap();

        let new_stocks: Vec<i32> = stock_updates(&publisher).iter().map(|u| u.new_stock).collect();
        assert_eq!(new_stocks, vec![6, 3]);
    }

    #[tokio::test]
    async fn concurrent_orders_cannot_oversell() {
        let ledger = MemoryStockLedger::new();
        ledger.seed(7, 10).await.unwrap();

        let first = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.decrement(7, 6).await.unwrap() }
        });
        let second = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.decrement(7, 6).await.unwrap() }
        });

        let outcomes = [first.await.unwrap(), second.await.unwrap()];
        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, DecrementOutcome::Applied { .. }))
            .count();

        assert_eq!(applied, 1);
        assert_eq!(ledger.stock(7), Some(4));
    }

    #[tokio::test]
    async fn decrement_follows_the_conditional_contract() {
        let ledger = MemoryStockLedger::new();
        ledger.seed(1, 10).await.unwrap();

        match ledger.decrement(1, 5).await.unwrap() {
            DecrementOutcome::Applied { record } => assert_eq!(record.stock, 5),
            other => panic!("expected Applied, got {other:?}"),
        }
        assert_eq!(
            ledger.decrement(1, 15).await.unwrap(),
            DecrementOutcome::InsufficientStock
        );
        assert_eq!(ledger.stock(1), Some(5));
    }

    #[tokio::test]
    async fn seeding_twice_keeps_the_first_value() {
        let ledger = MemoryStockLedger::new();
        ledger.seed(1, 10).await.unwrap();
        ledger.seed(1, 99).await.unwrap();

        assert_eq!(ledger.stock(1), Some(10));
    }
}
