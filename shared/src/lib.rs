pub mod bus;
pub mod events;

pub use bus::{build_consumer, BusError, EventPublisher, KafkaEventPublisher, MemoryEventPublisher};
pub use events::{topics, OrderCreatedEvent, StockUpdatedEvent};
