//! One bounded increment of comment extraction for one note's task.
//!
//! A batch always re-resolves its tab by note id, repairs detail-URL drift by
//! re-navigating to the safe URL (expected occasional platform behavior, not
//! an error), runs one bounded expansion, merges with dedup, and persists the
//! accumulated state through the sink as a full overwrite, so an interrupted run
//! stays consistent and resumable.

use rand::RngExt;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{HarvestError, HarvestOptions};
use crate::browser::{TabHandle, TabRegistry};
use crate::collab::Collaborators;
use crate::core::types::{ExpansionResult, NoteTask};

/// What one batch did to its task.
#[derive(Debug, Clone, Copy)]
pub struct BatchOutcome {
    pub done: bool,
    /// Genuinely new comments merged this batch.
    pub added: usize,
}

/// Fixed settle pause after a UI action, with a small jitter so the cadence
/// does not look mechanical.
pub async fn settle(base_ms: u64) {
    let jitter = rand::rng().random_range(0..=base_ms / 4 + 1);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
}

/// Run one batch for `task`. Errors are per-note: the caller routes them
/// through the retry ledger, never past the scheduler boundary.
pub async fn run_batch(
    task: &mut NoteTask,
    registry: &mut TabRegistry,
    active_ids: &HashSet<String>,
    collab: &Collaborators,
    opts: &HarvestOptions,
) -> Result<BatchOutcome, HarvestError> {
    // Tab index is never identity; re-derive it now, reopen if the tab is gone.
    let handle = match registry.resolve_tab_for_note(&task.note_id).await? {
        Some(h) => h,
        None => {
            info!(note_id = %task.note_id, "tab lost, reopening at safe url");
            let h = registry.open_or_reuse(&task.safe_url, active_ids).await?;
            settle(opts.settle_ms).await;
            h
        }
    };
    registry.switch_to(handle).await?;

    // Drift repair: the platform occasionally swaps the detail URL from under
    // us. Landing somewhere that no longer names this note (or dropped the
    // access token) gets one re-navigation to the captured safe URL.
    let landed = registry.current_url(handle).await?;
    let token_marker = format!("{}=", opts.token_param);
    if !crate::browser::url_names_note(&landed, &task.note_id) || !landed.contains(&token_marker) {
        warn!(note_id = %task.note_id, landed = %landed, "detail url drifted, re-navigating");
        registry.navigate_to(handle, &task.safe_url).await?;
        settle(opts.settle_ms).await;
    }

    // Per-note cap may already be satisfied from a previous batch.
    let max_new = match opts.note_comment_cap {
        Some(cap) if task.comments.len() >= cap => {
            task.stopped_at_cap = true;
            persist_progress(task, collab).await?;
            return Ok(BatchOutcome { done: true, added: 0 });
        }
        Some(cap) => opts.batch_size.min(cap - task.comments.len()),
        None => opts.batch_size,
    };

    let result = expand_with_one_retry(handle, task, collab, max_new, opts.settle_ms).await?;

    if result.new_items.len() > max_new {
        // Contract breach, not a platform condition, so fail the batch loudly.
        return Err(HarvestError::Collaborator(anyhow::anyhow!(
            "expander returned {} items for max_new={}",
            result.new_items.len(),
            max_new
        )));
    }

    let expander_capped = result.stopped_at_cap;
    let added = task.merge_comments(result.new_items);
    task.reached_end |= result.reached_end;
    task.empty_state |= result.empty_state;
    if result.header_total.is_some() {
        task.total_from_header = result.header_total;
    }
    if let Some(cap) = opts.note_comment_cap {
        if task.comments.len() >= cap {
            task.stopped_at_cap = true;
        }
    }
    task.batch_count += 1;
    task.is_first_batch = false;

    debug!(
        note_id = %task.note_id,
        batch = task.batch_count,
        added,
        total = task.comments.len(),
        "batch merged"
    );

    // Persist before the anomaly check so the broken batch leaves evidence.
    persist_progress(task, collab).await?;

    // Neither finished nor stopped at the batch cap: the scroll/expand layer
    // is malfunctioning. Silently continuing would mask broken pagination.
    if !task.is_done() && !expander_capped {
        return Err(HarvestError::ExtractionAnomaly { new_items: added });
    }

    Ok(BatchOutcome {
        done: task.is_done(),
        added,
    })
}

/// One expansion call with a single retry on transient channel failures
/// (remote-call timeout, connection reset). Anything else surfaces at once.
async fn expand_with_one_retry(
    handle: TabHandle,
    task: &NoteTask,
    collab: &Collaborators,
    max_new: usize,
    settle_ms: u64,
) -> Result<ExpansionResult, HarvestError> {
    match collab
        .expander
        .expand(handle, &task.seen_keys, max_new)
        .await
    {
        Ok(r) => Ok(r),
        Err(e) => {
            let transient = e
                .downcast_ref::<crate::browser::ChannelError>()
                .is_some_and(|c| c.is_transient());
            if !transient {
                return Err(HarvestError::Collaborator(e));
            }
            warn!(note_id = %task.note_id, error = %e, "transient expansion failure, retrying once");
            settle(settle_ms).await;
            collab
                .expander
                .expand(handle, &task.seen_keys, max_new)
                .await
                .map_err(HarvestError::Collaborator)
        }
    }
}

async fn persist_progress(task: &NoteTask, collab: &Collaborators) -> Result<(), HarvestError> {
    collab
        .sink
        .write_comments(&task.note_id, &task.comments, &task.state_snapshot())
        .await
        .map_err(HarvestError::Collaborator)
}
