//! The orchestrating loop: fill tabs up to the budget, rotate one batch per
//! active task, route completions through coverage + final persist and
//! failures through the retry ledger, until the persisted count reaches the
//! target.
//!
//! Execution is cooperative interleaving over one browser session; no two
//! control calls are ever in flight at once. Ordering across tasks follows
//! the round-robin pointer, recomputed modulo the current active length each
//! cycle because tasks are added and removed between cycles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::batch::{self, BatchOutcome};
use super::catalog::LinkCatalog;
use super::coverage;
use super::retry::{FailureDisposition, RetryLedger};
use super::{HarvestError, HarvestOptions};
use crate::browser::{BrowserControl, HttpControlChannel, TabRegistry};
use crate::collab::Collaborators;
use crate::core::types::{CompletionCriteria, HarvestReport, LinkEntry, NoteTask};
use crate::core::HarvestConfig;

pub struct TaskScheduler {
    registry: TabRegistry,
    collab: Collaborators,
    opts: HarvestOptions,
    ledger: RetryLedger,
    pending: VecDeque<LinkEntry>,
    active: Vec<NoteTask>,
    /// Original link per active/requeued note, for from-scratch retries.
    origins: HashMap<String, LinkEntry>,
    /// Round-robin pointer. Only meaningful modulo the current active length.
    rr: usize,
    run_id: String,
    last_persisted: usize,
    added: usize,
    processed: usize,
    rejected: usize,
}

impl TaskScheduler {
    pub fn new(
        control: Arc<dyn BrowserControl>,
        collab: Collaborators,
        opts: HarvestOptions,
    ) -> Self {
        let registry = TabRegistry::new(control, opts.max_tabs);
        let ledger = RetryLedger::new(opts.max_retry_per_note);
        Self {
            registry,
            collab,
            opts,
            ledger,
            pending: VecDeque::new(),
            active: Vec::new(),
            origins: HashMap::new(),
            rr: 0,
            run_id: uuid::Uuid::new_v4().to_string(),
            last_persisted: 0,
            added: 0,
            processed: 0,
            rejected: 0,
        }
    }

    /// Drive the catalog until `target` notes are fully persisted. Never
    /// panics or propagates an error; the report always states the outcome,
    /// including an explicit mismatch when the target was not reached.
    pub async fn execute(
        &mut self,
        catalog: LinkCatalog,
        keyword: &str,
        target: usize,
    ) -> HarvestReport {
        info!(
            run_id = %self.run_id,
            links = catalog.entries.len(),
            target,
            max_tabs = self.opts.max_tabs,
            "harvest run starting"
        );
        // Catalog-level checks abort before any tab is opened.
        if let Err(e) = catalog.verify_keyword(keyword) {
            error!(error = %e, "aborting run before opening any tab");
            return self.report(false, Some(e.to_string()));
        }
        self.pending = catalog.entries.into();

        match self.run(target).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "harvest run failed");
                self.report(false, Some(e.to_string()))
            }
        }
    }

    async fn run(&mut self, target: usize) -> anyhow::Result<HarvestReport> {
        // Resumption: links whose notes are already complete cost nothing.
        let persisted = self
            .collab
            .sink
            .persisted_count(&CompletionCriteria::default())
            .await?;
        self.last_persisted = persisted.count;
        let before = self.pending.len();
        self.pending
            .retain(|e| !persisted.note_ids.contains(&e.note_id));
        if before > self.pending.len() {
            info!(
                skipped = before - self.pending.len(),
                "skipping links already fully persisted"
            );
        }

        loop {
            if self.last_persisted >= target {
                info!(
                    persisted = self.last_persisted,
                    target, "target reached, releasing remaining tabs"
                );
                self.release_remaining().await;
                return Ok(self.report(true, None));
            }

            // Fill phase: open new tasks up to the tab budget.
            while self.active.len() < self.opts.max_tabs {
                let Some(link) = self.pending.pop_front() else {
                    break;
                };
                self.origins.insert(link.note_id.clone(), link.clone());
                match self.open_new_task(&link).await {
                    Ok(task) => {
                        self.processed += 1;
                        self.active.push(task);
                        // A fresh task gets its first batch immediately.
                        let idx = self.active.len() - 1;
                        self.step_task(idx).await?;
                    }
                    Err(e) => {
                        warn!(note_id = %link.note_id, error = %e, "open failed");
                        self.route_failure(&link.note_id, &e.to_string()).await?;
                    }
                }
                if self.last_persisted >= target {
                    break;
                }
            }

            // A completion inside the fill phase may have reached the target
            // after the top-of-loop check already ran; let that check decide
            // before anything else looks at the queues.
            if self.last_persisted >= target {
                continue;
            }

            if self.active.is_empty() {
                if self.pending.is_empty() {
                    let reason =
                        format!("target_not_reached: {}/{}", self.last_persisted, target);
                    warn!(%reason, "harvest run exhausted its catalog");
                    return Ok(self.report(false, Some(reason)));
                }
                // All opens failed and were requeued; try the fill phase again.
                continue;
            }

            // Rotate phase: one batch for the task under the pointer.
            let idx = self.rr % self.active.len();
            self.rr = self.rr.wrapping_add(1);
            self.step_task(idx).await?;
        }
    }

    /// Run one batch for `active[idx]` and route the outcome. The task may be
    /// removed from the active set before this returns.
    async fn step_task(&mut self, idx: usize) -> anyhow::Result<()> {
        let active_ids = self.active_ids();
        let outcome = {
            let Self {
                active,
                registry,
                collab,
                opts,
                ..
            } = self;
            batch::run_batch(&mut active[idx], registry, &active_ids, collab, opts).await
        };
        match outcome {
            Ok(BatchOutcome { done: true, .. }) => self.complete_task(idx).await?,
            Ok(_) => {}
            Err(e) => {
                let note_id = self.active[idx].note_id.clone();
                warn!(%note_id, error = %e, "batch failed");
                self.active.remove(idx);
                self.route_failure(&note_id, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Open a tab for the link, open + verify the detail view via the UI
    /// collaborator, extract metadata, and persist the detail record.
    async fn open_new_task(&mut self, link: &LinkEntry) -> Result<NoteTask, HarvestError> {
        let active_ids = self.active_ids();
        let handle = self.registry.open_or_reuse(&link.safe_url, &active_ids).await?;
        batch::settle(self.opts.settle_ms).await;

        let opened = self
            .collab
            .opener
            .open_detail(handle, link)
            .await
            .map_err(HarvestError::Collaborator)?;
        if opened.note_id != link.note_id {
            return Err(HarvestError::Collaborator(anyhow::anyhow!(
                "detail open landed on note {} but link names {}",
                opened.note_id,
                link.note_id
            )));
        }

        let detail = self
            .collab
            .extractor
            .extract(handle, &link.note_id)
            .await
            .map_err(HarvestError::Collaborator)?;
        self.collab
            .sink
            .write_detail(&link.note_id, &detail)
            .await
            .map_err(HarvestError::Collaborator)?;

        Ok(NoteTask::new(link, opened.detail_url, detail))
    }

    /// Terminal success path: coverage check, completion marker, close, count.
    async fn complete_task(&mut self, idx: usize) -> anyhow::Result<()> {
        let task = self.active.remove(idx);

        if let Some(shortfall) = coverage::check(&task, self.opts.coverage_ratio) {
            warn!(
                note_id = %task.note_id,
                captured = shortfall.captured,
                required = shortfall.required,
                header_total = shortfall.header_total,
                "coverage shortfall (note still counts as complete)"
            );
            if let Err(e) = self.collab.sink.record_shortfall(&shortfall).await {
                warn!(error = %e, "failed to write shortfall record");
            }
        }

        match self
            .collab
            .sink
            .finalize(&task.note_id, &task.state_snapshot())
            .await
        {
            Ok(()) => {
                self.close_tab_for(&task.note_id).await;
                self.origins.remove(&task.note_id);
                self.added += 1;
                info!(
                    note_id = %task.note_id,
                    comments = task.comments.len(),
                    batches = task.batch_count,
                    "note persisted and closed"
                );
                self.refresh_persisted().await?;
            }
            Err(e) => {
                // A note is never half-terminal: a failed finalize goes back
                // through the same retry-or-reject routing as any other failure.
                warn!(note_id = %task.note_id, error = %e, "finalize failed");
                self.route_failure(&task.note_id, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Convert any per-note failure into a retry-or-reject decision.
    async fn route_failure(&mut self, note_id: &str, reason: &str) -> anyhow::Result<()> {
        self.capture_evidence(note_id).await;
        match self.ledger.record_failure(note_id) {
            FailureDisposition::Requeue => {
                // From scratch, not resumed: partial server-side state from
                // the failed attempt cannot be trusted.
                if let Err(e) = self.collab.sink.discard_comments(note_id).await {
                    warn!(note_id, error = %e, "failed to discard partial comments");
                }
                self.close_tab_for(note_id).await;
                match self.origins.remove(note_id) {
                    Some(entry) => self.pending.push_back(entry),
                    None => warn!(note_id, "no origin link to requeue"),
                }
            }
            FailureDisposition::Reject => {
                self.close_tab_for(note_id).await;
                self.rejected += 1;
                self.origins.remove(note_id);
                let meta = serde_json::json!({
                    "run_id": self.run_id,
                    "attempts": self.ledger.attempts(note_id),
                    "error": reason,
                });
                if let Err(e) = self
                    .collab
                    .quarantine
                    .relocate(note_id, "retry_exhausted", meta)
                    .await
                {
                    warn!(note_id, error = %e, "quarantine relocation failed");
                }
            }
        }
        Ok(())
    }

    /// Best-effort failure screenshot. Never masks the original failure.
    async fn capture_evidence(&mut self, note_id: &str) {
        let handle = match self.registry.resolve_tab_for_note(note_id).await {
            Ok(Some(h)) => h,
            _ => return,
        };
        let bytes = match self.registry.screenshot(handle).await {
            Ok(b) if !b.is_empty() => b,
            _ => return,
        };
        let name = format!("failure-attempt-{}.png", self.ledger.attempts(note_id) + 1);
        if let Err(e) = self.collab.sink.write_evidence(note_id, &name, &bytes).await {
            warn!(note_id, error = %e, "failed to store failure evidence");
        }
    }

    async fn close_tab_for(&mut self, note_id: &str) {
        let active_ids = self.active_ids();
        match self.registry.resolve_tab_for_note(note_id).await {
            Ok(Some(handle)) => {
                if let Err(e) = self.registry.close(handle, &active_ids).await {
                    warn!(note_id, error = %e, "tab close failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(note_id, error = %e, "tab resolution failed during close"),
        }
    }

    /// Tabs of tasks still in flight when the target is reached are released;
    /// their per-batch persisted state keeps them resumable.
    async fn release_remaining(&mut self) {
        let leftovers: Vec<String> = self.active.iter().map(|t| t.note_id.clone()).collect();
        self.active.clear();
        self.origins.clear();
        for note_id in leftovers {
            self.close_tab_for(&note_id).await;
        }
    }

    async fn refresh_persisted(&mut self) -> anyhow::Result<()> {
        let set = self
            .collab
            .sink
            .persisted_count(&CompletionCriteria::default())
            .await?;
        self.last_persisted = set.count;
        Ok(())
    }

    fn active_ids(&self) -> HashSet<String> {
        self.active.iter().map(|t| t.note_id.clone()).collect()
    }

    fn report(&self, success: bool, error: Option<String>) -> HarvestReport {
        HarvestReport {
            success,
            added_count: self.added,
            processed_count: self.processed,
            rejected_count: self.rejected,
            final_count: self.last_persisted,
            error,
        }
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────────

/// Build the production stack from config and run one harvest. This is the
/// boundary the binary calls; it always returns a report.
pub async fn run_harvest(
    cfg: &HarvestConfig,
    session_id: &str,
    keyword: &str,
    target: usize,
) -> HarvestReport {
    let opts = HarvestOptions::from_config(cfg);

    let channel = match HttpControlChannel::new(
        &cfg.resolve_control_base_url(),
        session_id,
        cfg.resolve_control_token().as_deref(),
        Duration::from_secs(cfg.resolve_call_timeout_secs()),
    ) {
        Ok(c) => Arc::new(c),
        Err(e) => return failed_report(format!("control channel init: {e}")),
    };
    let control: Arc<dyn BrowserControl> = channel;

    let output_dir = cfg.resolve_output_dir();
    let sink = Arc::new(crate::persist::FsSink::new(output_dir.clone()));
    let quarantine = Arc::new(crate::persist::FsQuarantine::new(output_dir));

    let collab = Collaborators {
        opener: Arc::new(crate::platform::ScriptedOpener::new(
            control.clone(),
            opts.token_param.clone(),
            opts.settle_ms,
        )),
        extractor: Arc::new(crate::platform::ScriptedExtractor::new(control.clone())),
        expander: Arc::new(crate::platform::ScriptedExpander::new(
            control.clone(),
            opts.settle_ms,
        )),
        sink,
        quarantine,
    };

    let catalog = match LinkCatalog::load(&cfg.resolve_links_file(), &opts.token_param) {
        Ok(c) => c,
        Err(e) => return failed_report(e.to_string()),
    };

    let mut scheduler = TaskScheduler::new(control, collab, opts);
    scheduler.execute(catalog, keyword, target).await
}

fn failed_report(error: String) -> HarvestReport {
    HarvestReport {
        success: false,
        added_count: 0,
        processed_count: 0,
        rejected_count: 0,
        final_count: 0,
        error: Some(error),
    }
}
