//! Per-note failure accounting.
//!
//! The ledger is owned by the scheduler instance, never module-level state,
//! so independent runs cannot share attempt counts.

use std::collections::HashMap;
use tracing::{info, warn};

/// What to do with a note after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Requeue the original link at the back of the pending list. The note is
    /// retried from scratch, not resumed: partial server-side state from the
    /// failed attempt cannot be trusted.
    Requeue,
    /// Retries exhausted: quarantine, count as rejected, never requeue.
    Reject,
}

#[derive(Debug)]
pub struct RetryLedger {
    attempts: HashMap<String, u32>,
    max_retry_per_note: u32,
}

impl RetryLedger {
    pub fn new(max_retry_per_note: u32) -> Self {
        Self {
            attempts: HashMap::new(),
            max_retry_per_note,
        }
    }

    /// Record one observed failure and decide the note's fate. A note is
    /// permanently rejected after exactly `max_retry_per_note + 1` failures.
    pub fn record_failure(&mut self, note_id: &str) -> FailureDisposition {
        let attempts = self.attempts.entry(note_id.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts <= self.max_retry_per_note {
            info!(
                note_id,
                attempt = *attempts,
                max = self.max_retry_per_note,
                "note failed, requeueing for a fresh attempt"
            );
            FailureDisposition::Requeue
        } else {
            warn!(
                note_id,
                attempts = *attempts,
                "retries exhausted, rejecting note"
            );
            FailureDisposition::Reject
        }
    }

    pub fn attempts(&self, note_id: &str) -> u32 {
        self.attempts.get(note_id).copied().unwrap_or(0)
    }
}
