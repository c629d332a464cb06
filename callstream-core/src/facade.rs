//! Ingest façade.
//!
//! Thin request -> engine adapter. Field validation happens here, before any
//! store I/O, and the response DTOs are shaped here; transports stay dumb.
//! The packet response is built from the commit outcome, so `total_received`
//! and `missing_sequences` are as of the moment of commit.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::{CallEngine, CompleteOutcome};
use crate::error::CoreError;
use crate::store::StoreError;

/// Ingest request body.
#[derive(Debug, Clone, Deserialize)]
pub struct PacketBody {
    /// Non-negative; signed here so a negative value is a validation error,
    /// not a deserialization failure.
    pub sequence: i64,
    pub data: String,
    pub timestamp: f64,
}

/// Ingest response body (the richer contract shape).
#[derive(Debug, Clone, Serialize)]
pub struct PacketResponse {
    pub status: &'static str,
    pub call_id: String,
    pub sequence: u64,
    pub total_received: u64,
    pub missing_sequences: Vec<u64>,
    pub duplicate: bool,
}

/// Completion request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteBody {
    pub total_packets: i64,
}

/// Completion response body.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteResponse {
    pub status: &'static str,
    pub call_id: String,
    pub expected_total_packets: u64,
}

/// Validates requests and shapes responses for the serving surface.
pub struct IngestFacade {
    engine: Arc<CallEngine>,
}

impl IngestFacade {
    pub fn new(engine: Arc<CallEngine>) -> Self {
        Self { engine }
    }

    pub async fn ingest_packet(
        &self,
        call_id: &str,
        body: PacketBody,
    ) -> Result<PacketResponse, CoreError> {
        if body.sequence < 0 {
            return Err(CoreError::InvalidInput(
                "sequence must be non-negative".to_string(),
            ));
        }
        let ack = self
            .engine
            .ingest(call_id, body.sequence as u64, &body.data, body.timestamp)?;

        let outcome = match ack.committed.await {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(CoreError::Store(StoreError::Backend(
                    "mutation task dropped before commit".to_string(),
                )))
            }
        };

        Ok(PacketResponse {
            status: if outcome.duplicate { "duplicate" } else { "accepted" },
            call_id: ack.call_id,
            sequence: ack.sequence,
            total_received: outcome.total_received,
            missing_sequences: outcome.missing_sequences,
            duplicate: outcome.duplicate,
        })
    }

    pub async fn complete_call(
        &self,
        call_id: &str,
        body: CompleteBody,
    ) -> Result<CompleteResponse, CoreError> {
        if body.total_packets <= 0 {
            return Err(CoreError::InvalidInput(
                "total_packets must be positive".to_string(),
            ));
        }
        let total = body.total_packets as u64;
        let outcome = self.engine.complete(call_id, total).await?;

        Ok(CompleteResponse {
            status: match outcome {
                CompleteOutcome::Accepted => "accepted",
                CompleteOutcome::AlreadyCompleted => "already_completed",
                CompleteOutcome::AlreadyTerminal => "already_terminal",
            },
            call_id: call_id.to_string(),
            expected_total_packets: total,
        })
    }
}
