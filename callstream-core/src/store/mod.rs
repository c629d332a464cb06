//! Persistence contract.
//!
//! The core never issues ad-hoc queries; everything it needs from a backing
//! store is this trait. Per-call serialization is the engine's job (its
//! key-sharded lock table), so implementations only guarantee atomicity of
//! the individual operations, in particular `insert_packet` against
//! concurrent inserts of the same `(call_id, sequence)`.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::call::{CallRecord, PacketRecord};

/// How many times a transient store failure is retried before it propagates.
pub const TRANSIENT_RETRIES: u32 = 3;
pub const TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// Result of a packet insert. Duplicate is a signal, not an error: the
/// uniqueness invariant held and the caller decides what that means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("call {0} not found")]
    NotFound(String),

    /// Connection-level failure; worth a short retry.
    #[error("store connection failure: {0}")]
    Connection(String),

    /// Lock contention inside the backend; worth a short retry.
    #[error("store busy: {0}")]
    Busy(String),

    #[error("storage failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Busy(_))
    }
}

/// The narrow store contract the engine consumes.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Idempotent creation at the initial IN_PROGRESS state.
    async fn create_if_absent(&self, call_id: &str) -> Result<CallRecord, StoreError>;

    async fn load(&self, call_id: &str) -> Result<Option<CallRecord>, StoreError>;

    /// Write back a mutated call row. The row must already exist.
    async fn save(&self, call: &CallRecord) -> Result<(), StoreError>;

    /// Insert one packet, or report `Duplicate` when `(call_id, sequence)`
    /// already exists. Atomic against concurrent inserts of the same key.
    async fn insert_packet(&self, packet: &PacketRecord) -> Result<InsertOutcome, StoreError>;

    /// All packets for a call, ascending by sequence.
    async fn list_packets_ordered(&self, call_id: &str) -> Result<Vec<PacketRecord>, StoreError>;
}

/// Retry transient store failures (deadlocks, lost connections) a small
/// fixed number of times before letting the error propagate.
pub async fn with_transient_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_transient() && attempt < TRANSIENT_RETRIES => {
                warn!(op = op_name, attempt, error = %e, "transient store failure, retrying");
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
            }
            other => return other,
        }
    }
}
