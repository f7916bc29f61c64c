//! Coverage validation: compares the captured comment count against the
//! platform-declared total once a task is judged done.
//!
//! A shortfall is diagnostic, never fatal: the note still counts as complete
//! and persisted. Retry exhaustion is the only path to quarantine.

use chrono::Utc;

use crate::core::types::{NoteTask, ShortfallRecord};

const TAIL_SAMPLE_LEN: usize = 3;
const TAIL_BODY_CHARS: usize = 80;

/// Minimum captured count for a declared total: `ceil(total × ratio)`.
pub fn required_minimum(header_total: u64, ratio: f64) -> u64 {
    (header_total as f64 * ratio).ceil() as u64
}

/// Check a finished task. Returns a shortfall record when the captured count
/// falls below the required minimum; `None` when coverage is satisfied, no
/// positive total was declared, or the task was stopped purely by the hard
/// per-note cap (a capped run under-captures by construction).
pub fn check(task: &NoteTask, ratio: f64) -> Option<ShortfallRecord> {
    if task.stopped_at_cap && !task.reached_end && !task.empty_state {
        return None;
    }
    let header_total = task.total_from_header.filter(|&t| t > 0)?;
    let captured = task.comments.len() as u64;
    let required = required_minimum(header_total, ratio);
    if captured >= required {
        return None;
    }

    let reply_count = task.comments.iter().filter(|c| c.is_reply).count() as u64;
    let identified_count = task
        .comments
        .iter()
        .filter(|c| !c.author.trim().is_empty())
        .count() as u64;
    let tail_sample = task
        .comments
        .iter()
        .rev()
        .take(TAIL_SAMPLE_LEN)
        .map(|c| c.body.chars().take(TAIL_BODY_CHARS).collect())
        .collect();

    Some(ShortfallRecord {
        note_id: task.note_id.clone(),
        header_total,
        required,
        captured,
        reached_end: task.reached_end,
        empty_state: task.empty_state,
        stopped_at_cap: task.stopped_at_cap,
        reply_count,
        identified_count,
        tail_sample,
        at: Utc::now(),
    })
}
