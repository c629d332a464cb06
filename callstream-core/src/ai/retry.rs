//! Bounded retry around the analyzer.
//!
//! Fixed policy, not configuration: up to 5 attempts, doubling sleeps of
//! 1, 2, 4, 8 seconds between them, a 30-second budget per attempt, and a
//! 60-second cumulative deadline covering attempts and sleeps. If the next
//! sleep would cross the deadline the retry is abandoned early. The policy
//! knows nothing about call state; the engine interprets the outcome.

use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::{AiError, Analysis, TranscriptAnalyzer};

pub const MAX_ATTEMPTS: u32 = 5;
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const CUMULATIVE_DEADLINE: Duration = Duration::from_secs(60);

/// Run the analyzer until it succeeds or the policy is exhausted.
///
/// Succeeds on the first non-error response. On exhaustion returns
/// [`AiError::Unavailable`], the terminal outcome the engine maps to FAILED.
pub async fn analyze_with_retry(
    analyzer: &dyn TranscriptAnalyzer,
    call_id: &str,
    payload: &str,
) -> Result<Analysis, AiError> {
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts = 0;

    while attempts < MAX_ATTEMPTS {
        let remaining = match CUMULATIVE_DEADLINE.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => break,
        };
        attempts += 1;
        let budget = ATTEMPT_TIMEOUT.min(remaining);

        match timeout(budget, analyzer.analyze(payload)).await {
            Ok(Ok(analysis)) => {
                debug!(
                    call_id = %call_id,
                    analyzer = analyzer.name(),
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "analysis succeeded"
                );
                return Ok(analysis);
            }
            Ok(Err(e)) => {
                warn!(
                    call_id = %call_id,
                    analyzer = analyzer.name(),
                    attempt = attempts,
                    error = %e,
                    "analyzer attempt failed"
                );
            }
            Err(_) => {
                warn!(
                    call_id = %call_id,
                    analyzer = analyzer.name(),
                    attempt = attempts,
                    budget_ms = budget.as_millis() as u64,
                    "analyzer attempt timed out"
                );
            }
        }

        if attempts == MAX_ATTEMPTS {
            break;
        }
        if started.elapsed() + backoff > CUMULATIVE_DEADLINE {
            warn!(
                call_id = %call_id,
                attempt = attempts,
                "next backoff would cross the cumulative deadline, giving up"
            );
            break;
        }
        sleep(backoff).await;
        backoff *= 2;
    }

    Err(AiError::Unavailable {
        attempts,
        elapsed: started.elapsed(),
    })
}
