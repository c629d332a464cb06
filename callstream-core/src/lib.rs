//! CallStream Core
//!
//! Real-time ingest and orchestration between a PBX and a downstream AI
//! transcription/sentiment analyzer. A PBX streams many concurrent calls,
//! each split into sequence-numbered packets that arrive out of order,
//! duplicated, or not at all. This crate acknowledges packets fast,
//! reconstructs each call's stream while tracking gaps, drives the call
//! lifecycle through an unreliable AI step with bounded retry, and fans
//! lifecycle events out to subscribed supervisors.
//!
//! # Architecture
//!
//! ```text
//! ingest façade -> call engine -> store (memory | sqlite)
//!                      |   \
//!                      |    `-> analyzer (bounded retry)
//!                      `-> event bus -> subscribers
//! ```
//!
//! Per-call mutations are linearized by a key-sharded lock table inside the
//! engine; different calls never contend. The completion pipeline (grace
//! wait -> PROCESSING_AI -> analysis -> ARCHIVED/FAILED) holds no lock
//! across its suspension points. The bus never blocks the engine: slow
//! subscribers are dropped, events are not.

pub mod ai;
pub mod call;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod facade;
pub mod sequence;
pub mod server;
pub mod store;

// Re-export main types at crate root
pub use ai::{analyze_with_retry, AiError, Analysis, SimulatedAnalyzer, TranscriptAnalyzer};
pub use call::{CallRecord, CallState, InvalidTransition, PacketRecord};
pub use config::StoreConnection;
pub use engine::{CallEngine, CompleteOutcome, IngestAck, PacketOutcome, GRACE_INTERVAL};
pub use error::CoreError;
pub use events::{CallEvent, EventBus, Subscription, SUBSCRIBER_BUFFER};
pub use facade::{CompleteBody, CompleteResponse, IngestFacade, PacketBody, PacketResponse};
pub use sequence::{observe, Classification, Observation, MISSING_CAP};
pub use server::{router, AppState};
pub use store::{CallStore, InsertOutcome, MemoryStore, SqliteStore, StoreError};
