//! Outbound ports - Interfaces that the orchestrator requires from external systems

mod delivery_port;
mod idempotency_port;
mod publisher_port;
mod repository_port;

pub use delivery_port::{Delivery, DeliveryQueuePort, DeliveryTag, QueueError};
pub use idempotency_port::IdempotencyStorePort;
pub use publisher_port::{ClientUpdatePublisher, PushNotificationPublisher, TaskPublisher};
pub use repository_port::{
    finish_transaction, GenerationResultRepository, Guarded, ImageReferenceRepository,
    PlayerGameStateRepository, PlayerProgressRepository, PublishedStoryRepository, RepoError,
    StagedTaskRepository, Store, StoreTransaction, StoryConfigRepository, StorySceneRepository,
    TransactionPort,
};
