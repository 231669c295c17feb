//! Offline-first data sync.
//!
//! Local mutations are recorded durably in a pending-operation store, published
//! to a message broker by the sync coordinator, and applied on the receiving side
//! by a batch consumer. Changes made on other devices are pulled from the backend
//! and merged with a logical clock.

/// Backend sync API client
pub mod backend;
/// Message broker client, consumer and transports
pub mod broker;
/// Environment configuration
pub mod config;
/// Prometheus metrics
pub mod metrics;
/// Durable store of operations not yet confirmed
pub mod outbox;
/// Sync coordinator
pub mod sync;
