//! Packet sequence classification.
//!
//! Pure logic: given a call's tracking fields and an incoming sequence
//! number, decide how the packet relates to the stream and what the fields
//! become. The engine applies the result to the stored row; nothing here
//! touches the store.

use std::collections::BTreeSet;
use tracing::warn;

/// Upper bound on the tracked missing set. Gaps beyond this are logged and
/// flagged on the call instead of recorded, so a broken producer cannot grow
/// the row without bound.
pub const MISSING_CAP: usize = 100;

/// How an incoming sequence number relates to the stream so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Exactly the next expected sequence.
    InOrder,
    /// Ahead of the expected sequence; everything in between becomes missing.
    Gap,
    /// Fills a previously recorded missing sequence.
    LateFill,
    /// Already accounted for; tracking state is unchanged.
    Duplicate,
}

/// Result of classifying one sequence: the classification plus the updated
/// tracking fields.
#[derive(Debug, Clone)]
pub struct Observation {
    pub classification: Classification,
    pub expected_next: u64,
    pub missing: BTreeSet<u64>,
    pub truncated: bool,
}

/// Classify `sequence` against the current tracking state.
///
/// `completed` marks a call at or past COMPLETED: the window no longer
/// advances, so sequences at or above `expected_next` can only be late fills
/// (if previously recorded missing) or duplicates.
pub fn observe(
    expected_next: u64,
    missing: &BTreeSet<u64>,
    truncated: bool,
    sequence: u64,
    completed: bool,
) -> Observation {
    if !completed && sequence == expected_next {
        return Observation {
            classification: Classification::InOrder,
            expected_next: sequence + 1,
            missing: missing.clone(),
            truncated,
        };
    }

    if !completed && sequence > expected_next {
        let mut missing = missing.clone();
        let mut truncated = truncated;
        for absent in expected_next..sequence {
            if missing.len() >= MISSING_CAP {
                warn!(
                    sequence,
                    expected_next,
                    cap = MISSING_CAP,
                    "missing set at cap, further gap sequences untracked"
                );
                truncated = true;
                break;
            }
            missing.insert(absent);
        }
        return Observation {
            classification: Classification::Gap,
            expected_next: sequence + 1,
            missing,
            truncated,
        };
    }

    if missing.contains(&sequence) {
        let mut missing = missing.clone();
        missing.remove(&sequence);
        return Observation {
            classification: Classification::LateFill,
            expected_next,
            missing,
            truncated,
        };
    }

    Observation {
        classification: Classification::Duplicate,
        expected_next,
        missing: missing.clone(),
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(seqs: &[u64]) -> BTreeSet<u64> {
        seqs.iter().copied().collect()
    }

    #[test]
    fn first_packet_is_in_order() {
        let obs = observe(0, &BTreeSet::new(), false, 0, false);
        assert_eq!(obs.classification, Classification::InOrder);
        assert_eq!(obs.expected_next, 1);
        assert!(obs.missing.is_empty());
    }

    #[test]
    fn gap_records_skipped_sequences() {
        let obs = observe(3, &BTreeSet::new(), false, 6, false);
        assert_eq!(obs.classification, Classification::Gap);
        assert_eq!(obs.expected_next, 7);
        assert_eq!(obs.missing, set(&[3, 4, 5]));
    }

    #[test]
    fn late_fill_shrinks_missing() {
        let obs = observe(7, &set(&[3, 4, 5]), false, 4, false);
        assert_eq!(obs.classification, Classification::LateFill);
        assert_eq!(obs.expected_next, 7);
        assert_eq!(obs.missing, set(&[3, 5]));
    }

    #[test]
    fn below_window_and_not_missing_is_duplicate() {
        let obs = observe(7, &set(&[3]), false, 5, false);
        assert_eq!(obs.classification, Classification::Duplicate);
        assert_eq!(obs.expected_next, 7);
        assert_eq!(obs.missing, set(&[3]));
    }

    #[test]
    fn missing_set_is_capped() {
        let obs = observe(0, &BTreeSet::new(), false, 150, false);
        assert_eq!(obs.classification, Classification::Gap);
        assert_eq!(obs.expected_next, 151);
        assert_eq!(obs.missing.len(), MISSING_CAP);
        assert!(obs.truncated);
        // The cap keeps the lowest sequences; the tail is what goes untracked.
        assert_eq!(obs.missing.iter().next(), Some(&0));
        assert_eq!(obs.missing.iter().last(), Some(&99));
    }

    #[test]
    fn cap_preserves_existing_entries() {
        let existing: BTreeSet<u64> = (0..100).collect();
        let obs = observe(100, &existing, true, 120, false);
        assert_eq!(obs.classification, Classification::Gap);
        assert_eq!(obs.missing, existing);
        assert!(obs.truncated);
    }

    #[test]
    fn completed_call_never_extends_the_window() {
        // At-or-above expected_next after completion: duplicate, no tracking change.
        let obs = observe(5, &set(&[2]), false, 9, true);
        assert_eq!(obs.classification, Classification::Duplicate);
        assert_eq!(obs.expected_next, 5);
        assert_eq!(obs.missing, set(&[2]));

        let obs = observe(5, &set(&[2]), false, 5, true);
        assert_eq!(obs.classification, Classification::Duplicate);
        assert_eq!(obs.expected_next, 5);
    }

    #[test]
    fn completed_call_still_accepts_late_fills() {
        let obs = observe(5, &set(&[2]), false, 2, true);
        assert_eq!(obs.classification, Classification::LateFill);
        assert_eq!(obs.expected_next, 5);
        assert!(obs.missing.is_empty());
    }
}
