use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bus topic names. Field names and topics together form the wire contract
/// with external consumers.
pub mod topics {
    pub const ORDER_CREATED: &str = "order.created";
    pub const STOCK_UPDATED: &str = "stock.updated";
    pub const ORDER_CREATED_DLQ: &str = "order.created.dlq";
}

/// Emitted once per accepted order, keyed by `orderId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    pub order_id: i32,
    pub product_id: i32,
    pub quantity: i32,
}

impl OrderCreatedEvent {
    pub const EVENT_TYPE: &'static str = "OrderCreated";
}

/// Emitted once per successful decrement, keyed by `productId`. Reflects the
/// ledger state after the decrement was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockUpdatedEvent {
    pub product_id: i32,
    pub new_stock: i32,
    pub updated_at: DateTime<Utc>,
}

impl StockUpdatedEvent {
    pub const EVENT_TYPE: &'static str = "StockUpdated";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_created_uses_contract_field_names() {
        let event = OrderCreatedEvent {
            order_id: 1,
            product_id: 2,
            quantity: 3,
        };

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["orderId"], 1);
        assert_eq!(json["productId"], 2);
        assert_eq!(json["quantity"], 3);
    }

    #[test]
    fn stock_updated_uses_contract_field_names() {
        let event = StockUpdatedEvent {
            product_id: 2,
            new_stock: 7,
            updated_at: Utc::now(),
        };

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["productId"], 2);
        assert_eq!(json["newStock"], 7);
        assert!(json["updatedAt"].is_string());
    }

    #[test]
    fn order_created_decodes_from_external_payload() {
        let event: OrderCreatedEvent =
            serde_json::from_str(r#"{"orderId":42,"productId":7,"quantity":5}"#).unwrap();
        assert_eq!(event.order_id, 42);
        assert_eq!(event.product_id, 7);
        assert_eq!(event.quantity, 5);
    }
}
