//! Filesystem-backed persistence: incremental, idempotent write-through of
//! per-note state plus the quarantine area.
//!
//! Layout under the output root:
//!
//! ```text
//! {root}/notes/{note_id}/detail.json     extracted header/body/media record
//! {root}/notes/{note_id}/comments.json   accumulated comments (full overwrite)
//! {root}/notes/{note_id}/state.json      progress snapshot
//! {root}/notes/{note_id}/.complete       completion marker
//! {root}/notes/{note_id}/evidence/*.png  failure screenshots
//! {root}/shortfalls.ndjson               coverage shortfall log (append-only)
//! {root}/quarantine/{note_id}/           relocated output of rejected notes
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::collab::{PersistenceSink, QuarantineMover};
use crate::core::types::{
    CommentItem, CompletionCriteria, NoteDetail, NoteState, PersistedSet, ShortfallRecord,
};

const DETAIL_FILE: &str = "detail.json";
const COMMENTS_FILE: &str = "comments.json";
const STATE_FILE: &str = "state.json";
const COMPLETE_MARKER: &str = ".complete";
const SHORTFALL_LOG: &str = "shortfalls.ndjson";

pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn note_dir(&self, note_id: &str) -> PathBuf {
        self.root.join("notes").join(note_id)
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn remove_if_present(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// The completion filter: required artifacts, marker, and (optionally) a
    /// minimum captured/header-total ratio read from `state.json`. Notes that
    /// never saw a header total always pass the coverage criterion.
    fn is_complete(dir: &Path, criteria: &CompletionCriteria) -> bool {
        let required = [DETAIL_FILE, COMMENTS_FILE, COMPLETE_MARKER];
        if !required.iter().all(|f| dir.join(f).exists()) {
            return false;
        }
        let Some(min_coverage) = criteria.min_coverage else {
            return true;
        };
        let state: NoteState = match std::fs::read_to_string(dir.join(STATE_FILE))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(s) => s,
            None => return false,
        };
        match state.header_total {
            Some(total) if total > 0 => {
                let required = (total as f64 * min_coverage).ceil() as u64;
                state.captured >= required
            }
            _ => true,
        }
    }
}

#[async_trait]
impl PersistenceSink for FsSink {
    async fn write_detail(&self, note_id: &str, detail: &NoteDetail) -> Result<()> {
        let dir = self.note_dir(note_id);
        std::fs::create_dir_all(&dir)?;
        Self::write_json(&dir.join(DETAIL_FILE), detail)
    }

    async fn write_comments(
        &self,
        note_id: &str,
        comments: &[CommentItem],
        state: &NoteState,
    ) -> Result<()> {
        let dir = self.note_dir(note_id);
        std::fs::create_dir_all(&dir)?;
        // Full overwrite, never append, so re-running with identical state
        // yields identical durable output.
        Self::write_json(&dir.join(COMMENTS_FILE), &comments)?;
        Self::write_json(&dir.join(STATE_FILE), state)
    }

    async fn finalize(&self, note_id: &str, state: &NoteState) -> Result<()> {
        let dir = self.note_dir(note_id);
        std::fs::create_dir_all(&dir)?;
        Self::write_json(&dir.join(STATE_FILE), state)?;
        std::fs::write(dir.join(COMPLETE_MARKER), Utc::now().to_rfc3339())
            .with_context(|| format!("writing completion marker for {note_id}"))?;
        Ok(())
    }

    async fn discard_comments(&self, note_id: &str) -> Result<()> {
        let dir = self.note_dir(note_id);
        Self::remove_if_present(&dir.join(COMMENTS_FILE))?;
        Self::remove_if_present(&dir.join(STATE_FILE))?;
        Self::remove_if_present(&dir.join(COMPLETE_MARKER))?;
        Ok(())
    }

    async fn write_evidence(&self, note_id: &str, name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.note_dir(note_id).join("evidence");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(name), bytes)
            .with_context(|| format!("writing evidence {name} for {note_id}"))?;
        Ok(())
    }

    async fn record_shortfall(&self, record: &ShortfallRecord) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(SHORTFALL_LOG))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    async fn persisted_count(&self, criteria: &CompletionCriteria) -> Result<PersistedSet> {
        let notes_root = self.root.join("notes");
        let mut set = PersistedSet::default();
        let entries = match std::fs::read_dir(&notes_root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(set),
            Err(e) => {
                return Err(e).with_context(|| format!("scanning {}", notes_root.display()))
            }
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if Self::is_complete(&entry.path(), criteria) {
                set.count += 1;
                set.note_ids
                    .insert(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(set)
    }
}

// ── Quarantine ───────────────────────────────────────────────────────────────

pub struct FsQuarantine {
    root: PathBuf,
}

impl FsQuarantine {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl QuarantineMover for FsQuarantine {
    /// Relocate, never delete, the note's output directory, and write a
    /// `reason.json` alongside for diagnosis.
    async fn relocate(&self, note_id: &str, reason: &str, meta: serde_json::Value) -> Result<()> {
        let src = self.root.join("notes").join(note_id);
        let quarantine_root = self.root.join("quarantine");
        std::fs::create_dir_all(&quarantine_root)?;

        let mut dest = quarantine_root.join(note_id);
        if dest.exists() {
            // A previous run already quarantined this note; keep both.
            dest = quarantine_root.join(format!("{note_id}-{}", Utc::now().timestamp()));
        }

        if src.exists() {
            std::fs::rename(&src, &dest).with_context(|| {
                format!("moving {} to {}", src.display(), dest.display())
            })?;
        } else {
            // Nothing was persisted before the note failed; still leave a
            // record of the rejection.
            std::fs::create_dir_all(&dest)?;
            warn!(note_id, "quarantining note with no persisted output");
        }

        let record = serde_json::json!({
            "note_id": note_id,
            "reason": reason,
            "at": Utc::now().to_rfc3339(),
            "meta": meta,
        });
        std::fs::write(
            dest.join("reason.json"),
            serde_json::to_vec_pretty(&record)?,
        )?;
        info!(note_id, reason, dest = %dest.display(), "note quarantined");
        Ok(())
    }
}
