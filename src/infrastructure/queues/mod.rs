//! Queue implementations - Transport adapters for the delivery port

mod factory;
mod memory_queue;
mod sqlite_queue;

pub use factory::{AdapterFactory, DeliveryBackend, SinkBackend};
pub use memory_queue::InMemoryDeliveryQueue;
pub use sqlite_queue::SqliteDeliveryQueue;
