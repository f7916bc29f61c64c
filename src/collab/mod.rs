//! Collaborator contracts consumed by the scheduler.
//!
//! These are the seams of the system: the core drives them as black boxes and
//! converts every error into a retry-or-reject decision. Production
//! implementations live in [`crate::platform`] and [`crate::persist`];
//! tests substitute in-memory doubles.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::browser::TabHandle;
use crate::core::types::{
    CommentItem, CompletionCriteria, ExpansionResult, LinkEntry, NoteDetail, NoteState,
    OpenedDetail, PersistedSet, ShortfallRecord,
};

/// Opens a note's detail view strictly via UI interaction (click), verifying
/// the resulting page names the expected note and carries an access token.
/// Must never construct a navigation URL directly.
#[async_trait]
pub trait DetailOpener: Send + Sync {
    async fn open_detail(&self, tab: TabHandle, link: &LinkEntry) -> Result<OpenedDetail>;
}

/// Extracts header/body/media metadata from the currently-open detail view.
#[async_trait]
pub trait DetailExtractor: Send + Sync {
    async fn extract(&self, tab: TabHandle, note_id: &str) -> Result<NoteDetail>;
}

/// Performs one bounded incremental reveal/extract of comments. Must never
/// return more than `max_new` new items in one call.
#[async_trait]
pub trait CommentBatchExpander: Send + Sync {
    async fn expand(
        &self,
        tab: TabHandle,
        seen_keys: &HashSet<String>,
        max_new: usize,
    ) -> Result<ExpansionResult>;
}

/// Idempotent durable write-through of accumulated per-note state.
///
/// `write_comments` is a full overwrite, never an append, so interrupting the
/// run at any point leaves consistent, resumable output.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn write_detail(&self, note_id: &str, detail: &NoteDetail) -> Result<()>;
    async fn write_comments(
        &self,
        note_id: &str,
        comments: &[CommentItem],
        state: &NoteState,
    ) -> Result<()>;
    /// Marks the note complete. Idempotent.
    async fn finalize(&self, note_id: &str, state: &NoteState) -> Result<()>;
    /// Removes partial comment artifacts before a from-scratch retry.
    async fn discard_comments(&self, note_id: &str) -> Result<()>;
    /// Stores diagnostic bytes (screenshots) next to the note's output.
    async fn write_evidence(&self, note_id: &str, name: &str, bytes: &[u8]) -> Result<()>;
    async fn record_shortfall(&self, record: &ShortfallRecord) -> Result<()>;
    /// How many notes already satisfy the completion filter, and which.
    async fn persisted_count(&self, criteria: &CompletionCriteria) -> Result<PersistedSet>;
}

/// Relocates (never deletes) a note's output into the quarantine area.
#[async_trait]
pub trait QuarantineMover: Send + Sync {
    async fn relocate(&self, note_id: &str, reason: &str, meta: serde_json::Value) -> Result<()>;
}

/// The full collaborator bundle handed to the scheduler.
#[derive(Clone)]
pub struct Collaborators {
    pub opener: Arc<dyn DetailOpener>,
    pub extractor: Arc<dyn DetailExtractor>,
    pub expander: Arc<dyn CommentBatchExpander>,
    pub sink: Arc<dyn PersistenceSink>,
    pub quarantine: Arc<dyn QuarantineMover>,
}
