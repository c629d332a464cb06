//! AI analyzer client.
//!
//! The engine works with the [`TranscriptAnalyzer`] trait, never with a
//! concrete backend. The analyzer receives one opaque payload (the ordered
//! packet data joined by single spaces) and returns a transcription plus a
//! sentiment label, or an error. Retry around it lives in [`retry`]; the
//! trait itself is a single attempt.

pub mod retry;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use retry::{
    analyze_with_retry, ATTEMPT_TIMEOUT, CUMULATIVE_DEADLINE, INITIAL_BACKOFF, MAX_ATTEMPTS,
};

/// Successful analyzer output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub transcription: String,
    pub sentiment: String,
    pub confidence: f32,
}

#[derive(Error, Debug)]
pub enum AiError {
    /// A single attempt failed; the retry policy decides what happens next.
    #[error("analyzer error: {0}")]
    Analysis(String),

    /// A single attempt exceeded its time budget.
    #[error("analyzer attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The retry policy gave up. Terminal for the call's pipeline.
    #[error("analyzer unavailable after {attempts} attempts in {elapsed:?}")]
    Unavailable { attempts: u32, elapsed: Duration },
}

/// A transcription/sentiment backend.
#[async_trait]
pub trait TranscriptAnalyzer: Send + Sync {
    /// Backend identifier for logs.
    fn name(&self) -> &str;

    /// One analysis attempt over the assembled payload.
    async fn analyze(&self, payload: &str) -> Result<Analysis, AiError>;
}

const NEGATIVE_MARKERS: &[&str] = &["angry", "refund", "cancel", "terrible", "broken", "complaint"];
const POSITIVE_MARKERS: &[&str] = &["thanks", "thank", "great", "perfect", "love", "excellent"];

/// Stand-in analyzer with the observed profile of the real dependency:
/// roughly a quarter of attempts fail and each attempt takes 1-3 seconds.
/// Lets the server run end-to-end without the external service.
pub struct SimulatedAnalyzer {
    failure_rate: f64,
}

impl SimulatedAnalyzer {
    pub fn new() -> Self {
        Self { failure_rate: 0.25 }
    }

    pub fn with_failure_rate(failure_rate: f64) -> Self {
        Self { failure_rate }
    }
}

impl Default for SimulatedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptAnalyzer for SimulatedAnalyzer {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn analyze(&self, payload: &str) -> Result<Analysis, AiError> {
        let (latency_ms, fails, confidence) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(1_000..=3_000),
                rng.gen_bool(self.failure_rate),
                rng.gen_range(0.70..0.99),
            )
        };
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        if fails {
            return Err(AiError::Analysis("simulated analyzer failure".to_string()));
        }

        let lowered = payload.to_lowercase();
        let negative = NEGATIVE_MARKERS.iter().any(|m| lowered.contains(m));
        let positive = POSITIVE_MARKERS.iter().any(|m| lowered.contains(m));
        let sentiment = match (negative, positive) {
            (true, false) => "negative",
            (false, true) => "positive",
            _ => "neutral",
        };

        Ok(Analysis {
            transcription: payload.to_string(),
            sentiment: sentiment.to_string(),
            confidence,
        })
    }
}
