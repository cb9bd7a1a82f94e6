//! Per-key sequencing decisions
//!
//! Pure function over the persisted `last_applied_sequence` and the incoming
//! event's sequence. Holds no state, so a restarted worker reaches the same
//! decision from the view store alone.

use crate::event::FIRST_SEQUENCE;

/// What the ingest loop must do with an incoming event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceDecision {
    /// Next in line: project and write
    Apply,
    /// Already applied (replay or redelivery)
    Dedup,
    /// Older than the applied state
    SkipStale,
    /// Ahead of the applied state: hold until the gap closes
    Stash,
}

/// Decide how to handle `incoming` given the key's last applied sequence.
///
/// `last_applied` is `None` for a key the view has never seen, which behaves
/// as if `FIRST_SEQUENCE - 1` had been applied.
pub fn decide(last_applied: Option<u64>, incoming: u64) -> SequenceDecision {
    let last = last_applied.unwrap_or(FIRST_SEQUENCE - 1);

    if incoming == last + 1 {
        SequenceDecision::Apply
    } else if incoming == last {
        // A key that has never applied anything has nothing to dedup against
        if last_applied.is_none() {
            SequenceDecision::SkipStale
        } else {
            SequenceDecision::Dedup
        }
    } else if incoming < last {
        SequenceDecision::SkipStale
    } else {
        SequenceDecision::Stash
    }
}
