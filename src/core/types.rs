use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ── Catalog ──────────────────────────────────────────────────────────────────

/// Raw NDJSON record as written by the upstream link-discovery stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    #[serde(rename = "noteId")]
    pub note_id: String,
    #[serde(rename = "safeUrl")]
    pub safe_url: String,
    #[serde(rename = "searchUrl")]
    pub search_url: String,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
}

/// One validated candidate note reference. Immutable after catalog validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub note_id: String,
    /// Detail URL carrying the access-token query parameter.
    pub safe_url: String,
    /// Canonicalized search-results URL this link was captured under.
    pub search_url: String,
    pub captured_at: DateTime<Utc>,
}

// ── Extracted content ────────────────────────────────────────────────────────

/// Header/body/media metadata extracted from an open detail view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteDetail {
    pub note_id: String,
    pub title: String,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub like_count: Option<u64>,
}

/// A single captured comment. `key` is the dedup key; two items sharing a
/// key are the same comment regardless of which batch revealed them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentItem {
    pub key: String,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub likes: Option<u64>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub is_reply: bool,
}

/// Result of one bounded comment-expansion call on an open tab.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpansionResult {
    pub new_items: Vec<CommentItem>,
    pub reached_end: bool,
    pub empty_state: bool,
    /// Platform-declared total comment count from the section header, when shown.
    pub header_total: Option<u64>,
    /// True when the expander stopped because it hit `max_new`, not the page end.
    pub stopped_at_cap: bool,
}

/// Verified outcome of opening a note's detail view via UI interaction.
#[derive(Debug, Clone)]
pub struct OpenedDetail {
    pub note_id: String,
    pub detail_url: String,
}

// ── Task ─────────────────────────────────────────────────────────────────────

/// One note's collection state while it owns a tab slot. Created when the
/// scheduler promotes a pending [`LinkEntry`]; destroyed when the note is
/// judged done or permanently rejected. Never outlives its tab slot.
#[derive(Debug, Clone)]
pub struct NoteTask {
    pub note_id: String,
    pub safe_url: String,
    pub search_url: String,
    pub detail_url: String,
    pub detail: NoteDetail,
    pub seen_keys: HashSet<String>,
    pub comments: Vec<CommentItem>,
    pub reached_end: bool,
    pub empty_state: bool,
    pub total_from_header: Option<u64>,
    pub stopped_at_cap: bool,
    pub batch_count: u32,
    pub is_first_batch: bool,
}

impl NoteTask {
    pub fn new(entry: &LinkEntry, detail_url: String, detail: NoteDetail) -> Self {
        Self {
            note_id: entry.note_id.clone(),
            safe_url: entry.safe_url.clone(),
            search_url: entry.search_url.clone(),
            detail_url,
            detail,
            seen_keys: HashSet::new(),
            comments: Vec::new(),
            reached_end: false,
            empty_state: false,
            total_from_header: None,
            stopped_at_cap: false,
            batch_count: 0,
            is_first_batch: true,
        }
    }

    /// Merge newly-revealed items, dropping anything whose dedup key was
    /// already seen. Returns the number of genuinely new comments.
    pub fn merge_comments(&mut self, items: Vec<CommentItem>) -> usize {
        let mut added = 0;
        for item in items {
            if self.seen_keys.insert(item.key.clone()) {
                self.comments.push(item);
                added += 1;
            }
        }
        added
    }

    /// Done when the page reported its end, showed the no-comments state, or
    /// a hard per-note cap stopped further collection.
    pub fn is_done(&self) -> bool {
        self.reached_end || self.empty_state || self.stopped_at_cap
    }

    /// Snapshot for `state.json`: everything the completion filter and the
    /// coverage check need without re-reading the comment list.
    pub fn state_snapshot(&self) -> NoteState {
        NoteState {
            note_id: self.note_id.clone(),
            captured: self.comments.len() as u64,
            header_total: self.total_from_header,
            reached_end: self.reached_end,
            empty_state: self.empty_state,
            stopped_at_cap: self.stopped_at_cap,
            batch_count: self.batch_count,
            updated_at: Utc::now(),
        }
    }
}

/// Durable per-note progress snapshot, overwritten on every batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteState {
    pub note_id: String,
    pub captured: u64,
    #[serde(default)]
    pub header_total: Option<u64>,
    pub reached_end: bool,
    pub empty_state: bool,
    pub stopped_at_cap: bool,
    pub batch_count: u32,
    pub updated_at: DateTime<Utc>,
}

// ── Persistence queries ──────────────────────────────────────────────────────

/// Filter for counting already-complete notes in the output area.
#[derive(Debug, Clone, Default)]
pub struct CompletionCriteria {
    /// When set, `state.json` must show captured ≥ ceil(header_total × ratio).
    /// Notes that never saw a header total always pass this criterion.
    pub min_coverage: Option<f64>,
}

/// Notes already satisfying the completion filter.
#[derive(Debug, Clone, Default)]
pub struct PersistedSet {
    pub count: usize,
    pub note_ids: HashSet<String>,
}

// ── Reporting ────────────────────────────────────────────────────────────────

/// Shortfall log entry, diagnostic only, the note still counts as complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortfallRecord {
    pub note_id: String,
    pub header_total: u64,
    pub required: u64,
    pub captured: u64,
    pub reached_end: bool,
    pub empty_state: bool,
    pub stopped_at_cap: bool,
    pub reply_count: u64,
    pub identified_count: u64,
    /// Last few captured comment bodies, truncated, as evidence of where the
    /// expansion actually stopped.
    pub tail_sample: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Result object of one full harvest run. `execute` always returns this,
/// never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestReport {
    pub success: bool,
    /// Notes newly completed and persisted by this run.
    pub added_count: usize,
    /// Tasks opened (including ones later requeued or rejected).
    pub processed_count: usize,
    /// Notes permanently rejected after retry exhaustion.
    pub rejected_count: usize,
    /// Fully-persisted notes counted at exit.
    pub final_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
