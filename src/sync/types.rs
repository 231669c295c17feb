//! Status, report and error types of the sync coordinator.

use crate::backend::BackendError;
use crate::broker::BrokerError;
use crate::outbox::OutboxError;
use crate::sync::local_store::LocalStoreError;
use crate::sync::repositories::StateError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Coordinator state as seen by subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Completed(SyncReport),
    Error(SyncFailure),
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed(_) | SyncStatus::Error(_))
    }
}

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Periodic,
    ConnectivityRestored,
    Explicit,
    /// Host background-task hook.
    Background,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Explicit => "explicit",
            SyncTrigger::Background => "background",
        }
    }
}

/// Outcome of one completed cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub published: usize,
    pub confirmed: usize,
    pub fetched: usize,
    pub applied: usize,
    pub kept_local: usize,
    pub skipped_malformed: usize,
    pub clock_counter: u64,
    /// Watermark recorded for the next pull.
    pub watermark: DateTime<Utc>,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        format!(
            "Sync ({:?}): {} published, {} confirmed, {} fetched, {} applied, {} kept local, {} malformed, clock {}",
            self.trigger,
            self.published,
            self.confirmed,
            self.fetched,
            self.applied,
            self.kept_local,
            self.skipped_malformed,
            self.clock_counter
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Backend unreachable; retried on the next trigger.
    Connectivity,
    /// Broker circuit open; try later.
    CircuitOpen,
    Serialization,
    Persistence,
    Timeout,
    Broker,
    Backend,
    LocalStore,
    /// A cycle is already running.
    Busy,
    ShutDown,
}

/// Cycle failure as published on the status stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub kind: SyncErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Backend unreachable")]
    Connectivity,

    #[error("Broker circuit open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Broker error: {0}")]
    Broker(BrokerError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] OutboxError),

    #[error("Local store error: {0}")]
    LocalStore(#[from] LocalStoreError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("A sync cycle is already in progress")]
    AlreadyInProgress,

    #[error("Sync coordinator shut down")]
    ShutDown,
}

impl From<BrokerError> for SyncError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::CircuitOpen { retry_after } => SyncError::CircuitOpen { retry_after },
            BrokerError::Unreachable(_) => SyncError::Connectivity,
            other => SyncError::Broker(other),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Connectivity => SyncErrorKind::Connectivity,
            SyncError::CircuitOpen { .. } => SyncErrorKind::CircuitOpen,
            SyncError::Broker(BrokerError::Codec(_)) => SyncErrorKind::Serialization,
            SyncError::Broker(_) => SyncErrorKind::Broker,
            SyncError::Backend(BackendError::Json(_)) => SyncErrorKind::Serialization,
            SyncError::Backend(_) => SyncErrorKind::Backend,
            SyncError::Persistence(_) | SyncError::State(_) => SyncErrorKind::Persistence,
            SyncError::LocalStore(_) => SyncErrorKind::LocalStore,
            SyncError::Timeout(..) => SyncErrorKind::Timeout,
            SyncError::AlreadyInProgress => SyncErrorKind::Busy,
            SyncError::ShutDown => SyncErrorKind::ShutDown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Broker(e) => e.is_retryable(),
            SyncError::ShutDown => false,
            other => !matches!(other.kind(), SyncErrorKind::Serialization),
        }
    }

    pub fn to_failure(&self) -> SyncFailure {
        SyncFailure {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_maps_across() {
        let err: SyncError = BrokerError::CircuitOpen {
            retry_after: Duration::from_secs(30),
        }
        .into();
        assert_eq!(err.kind(), SyncErrorKind::CircuitOpen);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_closed_broker_is_not_retryable() {
        let err: SyncError = BrokerError::Closed.into();
        assert_eq!(err.kind(), SyncErrorKind::Broker);
        assert!(!err.to_failure().retryable);
    }
}
