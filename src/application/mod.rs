//! Application layer - Orchestration services and the ports they depend on
//!
//! This layer contains:
//! - Ports: storage, transport, idempotency and publisher contracts
//! - DTOs: generated-content shapes and outbound messages
//! - Services: idempotency guard, step manager, counter engine, router,
//!   error/rollback handler, outbox and the notification processor

pub mod dto;
pub mod ports;
pub mod services;
