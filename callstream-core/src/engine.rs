//! Call engine.
//!
//! The only writer of call state and the only caller of the analyzer.
//! Per-call mutations are serialized by a key-sharded lock table: at most
//! one mutation task per `call_id` progresses at a time, different calls
//! never contend, and events for a call are published inside its lock scope
//! so subscribers see them in linearization order.
//!
//! The completion pipeline holds no lock across its suspension points (the
//! grace wait and the analyzer call with its backoff sleeps).

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::ai::{retry, Analysis, TranscriptAnalyzer};
use crate::call::{CallRecord, CallState, PacketRecord};
use crate::error::CoreError;
use crate::events::{CallEvent, EventBus};
use crate::sequence;
use crate::store::{with_transient_retry, CallStore, InsertOutcome};

/// Wait between the completion signal and the analysis pipeline, admitting
/// late packets.
pub const GRACE_INTERVAL: Duration = Duration::from_secs(3);

/// Returned from [`CallEngine::ingest`] as soon as validation passes. The
/// mutation commits in the background; `committed` resolves with the commit
/// outcome for callers that want the richer response body. Dropping the
/// receiver does not cancel the mutation.
pub struct IngestAck {
    pub call_id: String,
    pub sequence: u64,
    pub committed: oneshot::Receiver<Result<PacketOutcome, CoreError>>,
}

/// State of the call as of the packet's commit.
#[derive(Debug, Clone)]
pub struct PacketOutcome {
    pub duplicate: bool,
    pub total_received: u64,
    pub missing_sequences: Vec<u64>,
}

/// Result of a completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Call moved to COMPLETED and the pipeline was scheduled.
    Accepted,
    /// Call was already at COMPLETED or PROCESSING_AI; nothing re-ran.
    AlreadyCompleted,
    /// Call was already ARCHIVED or FAILED.
    AlreadyTerminal,
}

/// Orchestrator for every per-call mutation and the completion pipeline.
pub struct CallEngine {
    store: Arc<dyn CallStore>,
    bus: Arc<EventBus>,
    analyzer: Arc<dyn TranscriptAnalyzer>,
    /// Key-sharded lock table; one entry per call seen by this process.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CallEngine {
    pub fn new(
        store: Arc<dyn CallStore>,
        bus: Arc<EventBus>,
        analyzer: Arc<dyn TranscriptAnalyzer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            analyzer,
            locks: DashMap::new(),
        })
    }

    fn call_lock(&self, call_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(call_id.to_string())
            .or_default()
            .clone()
    }

    /// Accept one packet. Validates synchronously, then hands the mutation to
    /// a background task; the acknowledgment path performs no store I/O.
    pub fn ingest(
        self: &Arc<Self>,
        call_id: &str,
        sequence: u64,
        data: &str,
        timestamp: f64,
    ) -> Result<IngestAck, CoreError> {
        if call_id.is_empty() {
            return Err(CoreError::InvalidInput("call_id must be non-empty".to_string()));
        }
        if data.is_empty() {
            return Err(CoreError::InvalidInput("data must be non-empty".to_string()));
        }
        if timestamp <= 0.0 {
            return Err(CoreError::InvalidInput("timestamp must be positive".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(self);
        let task_call_id = call_id.to_string();
        let data = data.to_string();
        tokio::spawn(async move {
            let outcome = engine
                .apply_packet(&task_call_id, sequence, data, timestamp)
                .await;
            if let Err(e) = &outcome {
                error!(call_id = %task_call_id, sequence, error = %e, "packet mutation failed");
            }
            let _ = tx.send(outcome);
        });

        Ok(IngestAck {
            call_id: call_id.to_string(),
            sequence,
            committed: rx,
        })
    }

    /// The asynchronous half of ingest: serialize on the call, insert, classify,
    /// commit, publish.
    async fn apply_packet(
        &self,
        call_id: &str,
        sequence: u64,
        data: String,
        timestamp: f64,
    ) -> Result<PacketOutcome, CoreError> {
        let lock = self.call_lock(call_id);
        let _guard = lock.lock().await;

        let store = &self.store;
        let mut call =
            with_transient_retry("create_if_absent", || store.create_if_absent(call_id)).await?;
        let packet = PacketRecord::new(call_id, sequence, data, timestamp);

        if call.state == CallState::ProcessingAi || call.state.is_terminal() {
            // The pipeline has taken over (or finished). Keep the packet for
            // audit, leave tracking state alone, publish nothing, and never
            // restart analysis.
            let inserted =
                with_transient_retry("insert_packet", || store.insert_packet(&packet)).await?;
            if inserted == InsertOutcome::Inserted {
                call.received_count += 1;
                call.updated_at = Utc::now();
                with_transient_retry("save", || store.save(&call)).await?;
                debug!(call_id = %call_id, sequence, state = %call.state, "stored late packet for closed call");
            }
            return Ok(PacketOutcome {
                duplicate: inserted == InsertOutcome::Duplicate,
                total_received: call.received_count,
                missing_sequences: call.missing_sequences(),
            });
        }

        match with_transient_retry("insert_packet", || store.insert_packet(&packet)).await? {
            InsertOutcome::Duplicate => Ok(PacketOutcome {
                duplicate: true,
                total_received: call.received_count,
                missing_sequences: call.missing_sequences(),
            }),
            InsertOutcome::Inserted => {
                let observation = sequence::observe(
                    call.expected_next,
                    &call.missing,
                    call.missing_truncated,
                    sequence,
                    call.state.is_past_completion(),
                );
                debug!(
                    call_id = %call_id,
                    sequence,
                    class = ?observation.classification,
                    "packet classified"
                );
                call.expected_next = observation.expected_next;
                call.missing = observation.missing;
                call.missing_truncated = observation.truncated;
                call.received_count += 1;
                call.updated_at = Utc::now();
                with_transient_retry("save", || store.save(&call)).await?;

                let missing_sequences = call.missing_sequences();
                self.bus.publish(CallEvent::PacketReceived {
                    call_id: call_id.to_string(),
                    sequence,
                    total_received: call.received_count,
                    missing_sequences: missing_sequences.clone(),
                });
                Ok(PacketOutcome {
                    duplicate: false,
                    total_received: call.received_count,
                    missing_sequences,
                })
            }
        }
    }

    /// Apply the completion signal. Idempotent: a second signal reports the
    /// call's standing without re-running anything.
    pub async fn complete(
        self: &Arc<Self>,
        call_id: &str,
        expected_total: u64,
    ) -> Result<CompleteOutcome, CoreError> {
        if call_id.is_empty() {
            return Err(CoreError::InvalidInput("call_id must be non-empty".to_string()));
        }
        if expected_total == 0 {
            return Err(CoreError::InvalidInput(
                "total_packets must be positive".to_string(),
            ));
        }

        let lock = self.call_lock(call_id);
        let outcome = {
            let _guard = lock.lock().await;
            let store = &self.store;
            let mut call =
                with_transient_retry("create_if_absent", || store.create_if_absent(call_id))
                    .await?;

            match call.state {
                CallState::InProgress => {
                    let from = call.transition(CallState::Completed)?;
                    call.expected_total = Some(expected_total);
                    with_transient_retry("save", || store.save(&call)).await?;
                    self.bus.publish(CallEvent::StateChanged {
                        call_id: call_id.to_string(),
                        from_state: from,
                        to_state: CallState::Completed,
                    });
                    info!(call_id = %call_id, expected_total, "call completed, pipeline scheduled");
                    CompleteOutcome::Accepted
                }
                CallState::Completed | CallState::ProcessingAi => CompleteOutcome::AlreadyCompleted,
                CallState::Archived | CallState::Failed => CompleteOutcome::AlreadyTerminal,
            }
        };

        if outcome == CompleteOutcome::Accepted {
            let engine = Arc::clone(self);
            let call_id = call_id.to_string();
            tokio::spawn(async move {
                engine.run_pipeline(&call_id).await;
            });
        }
        Ok(outcome)
    }

    /// Read-only snapshot for the supervisor surface. No lock needed.
    pub async fn call(&self, call_id: &str) -> Result<Option<CallRecord>, CoreError> {
        let store = &self.store;
        Ok(with_transient_retry("load", || store.load(call_id)).await?)
    }

    /// Grace wait, PROCESSING_AI transition, payload assembly, analysis with
    /// retry, terminal commit. Cannot be cancelled externally; its deadline
    /// is fully determined by the retry policy.
    async fn run_pipeline(self: Arc<Self>, call_id: &str) {
        tokio::time::sleep(GRACE_INTERVAL).await;

        if !self.begin_analysis(call_id).await {
            return;
        }

        let store = &self.store;
        let payload = match with_transient_retry("list_packets", || {
            store.list_packets_ordered(call_id)
        })
        .await
        {
            Ok(packets) => packets
                .iter()
                .map(|p| p.data.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            Err(e) => {
                self.finish_failed(call_id, format!("could not assemble payload: {e}"))
                    .await;
                return;
            }
        };

        info!(call_id = %call_id, payload_bytes = payload.len(), "invoking analyzer");
        match retry::analyze_with_retry(self.analyzer.as_ref(), call_id, &payload).await {
            Ok(analysis) => self.finish_archived(call_id, analysis).await,
            Err(e) => self.finish_failed(call_id, e.to_string()).await,
        }
    }

    /// Move a COMPLETED call into PROCESSING_AI. Returns false when the
    /// pipeline should stop (call vanished, state moved on, store down).
    async fn begin_analysis(&self, call_id: &str) -> bool {
        let lock = self.call_lock(call_id);
        let _guard = lock.lock().await;

        let store = &self.store;
        let mut call = match with_transient_retry("load", || store.load(call_id)).await {
            Ok(Some(call)) => call,
            Ok(None) => {
                error!(call_id = %call_id, "call row vanished before analysis");
                return false;
            }
            Err(e) => {
                error!(call_id = %call_id, error = %e, "store failure entering analysis");
                return false;
            }
        };

        if call.state != CallState::Completed {
            warn!(call_id = %call_id, state = %call.state, "pipeline found call outside COMPLETED, skipping");
            return false;
        }

        if !call.missing.is_empty() || call.missing_truncated {
            warn!(
                call_id = %call_id,
                missing = ?call.missing_sequences(),
                truncated = call.missing_truncated,
                received = call.received_count,
                expected = ?call.expected_total,
                complete = call.expected_total == Some(call.received_count),
                "analyzing despite missing packets"
            );
        }

        let from = match call.transition(CallState::ProcessingAi) {
            Ok(from) => from,
            Err(e) => {
                // Unreachable while the engine is the sole writer; surfaced
                // loudly rather than silently swallowed.
                error!(call_id = %call_id, error = %e, "illegal transition entering analysis");
                return false;
            }
        };
        if let Err(e) = with_transient_retry("save", || store.save(&call)).await {
            error!(call_id = %call_id, error = %e, "could not persist PROCESSING_AI, leaving call for operator");
            return false;
        }
        self.bus.publish(CallEvent::StateChanged {
            call_id: call_id.to_string(),
            from_state: from,
            to_state: CallState::ProcessingAi,
        });
        true
    }

    async fn finish_archived(&self, call_id: &str, analysis: Analysis) {
        let lock = self.call_lock(call_id);
        let _guard = lock.lock().await;

        let store = &self.store;
        let mut call = match with_transient_retry("load", || store.load(call_id)).await {
            Ok(Some(call)) => call,
            Ok(None) | Err(_) => {
                error!(call_id = %call_id, "could not load call to archive analysis result");
                return;
            }
        };

        let from = match call.transition(CallState::Archived) {
            Ok(from) => from,
            Err(e) => {
                drop(_guard);
                self.finish_failed(call_id, e.to_string()).await;
                return;
            }
        };
        call.transcription = Some(analysis.transcription.clone());
        call.sentiment = Some(analysis.sentiment.clone());
        if let Err(e) = with_transient_retry("save", || store.save(&call)).await {
            error!(call_id = %call_id, error = %e, "could not persist ARCHIVED state");
            return;
        }

        info!(call_id = %call_id, sentiment = %analysis.sentiment, "call archived");
        self.bus.publish(CallEvent::AiCompleted {
            call_id: call_id.to_string(),
            transcription: analysis.transcription,
            sentiment: analysis.sentiment,
        });
        self.bus.publish(CallEvent::StateChanged {
            call_id: call_id.to_string(),
            from_state: from,
            to_state: CallState::Archived,
        });
    }

    /// Terminal failure commit. `reason` is already sanitized for subscribers.
    async fn finish_failed(&self, call_id: &str, reason: String) {
        let lock = self.call_lock(call_id);
        let _guard = lock.lock().await;

        let store = &self.store;
        let mut call = match with_transient_retry("load", || store.load(call_id)).await {
            Ok(Some(call)) => call,
            Ok(None) | Err(_) => {
                error!(call_id = %call_id, reason = %reason, "could not load call to record failure");
                return;
            }
        };

        let from = match call.transition(CallState::Failed) {
            Ok(from) => from,
            Err(e) => {
                error!(call_id = %call_id, reason = %reason, error = %e, "call not in a failable state");
                return;
            }
        };
        if let Err(e) = with_transient_retry("save", || store.save(&call)).await {
            error!(call_id = %call_id, error = %e, "could not persist FAILED state, leaving call for operator");
            return;
        }

        warn!(call_id = %call_id, reason = %reason, "call failed");
        self.bus.publish(CallEvent::AiFailed {
            call_id: call_id.to_string(),
            reason,
        });
        self.bus.publish(CallEvent::StateChanged {
            call_id: call_id.to_string(),
            from_state: from,
            to_state: CallState::Failed,
        });
    }
}
