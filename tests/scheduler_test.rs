//! End-to-end scheduler runs against an in-memory browser session and
//! in-memory collaborators.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use noteharvest::browser::{BrowserControl, ChannelError, TabInfo};
use noteharvest::collab::{
    Collaborators, CommentBatchExpander, DetailExtractor, DetailOpener, PersistenceSink,
    QuarantineMover,
};
use noteharvest::core::types::{
    CommentItem, CompletionCriteria, ExpansionResult, LinkEntry, NoteDetail, NoteState,
    OpenedDetail, PersistedSet, ShortfallRecord,
};
use noteharvest::harvest::{HarvestOptions, LinkCatalog, TaskScheduler};
use noteharvest::browser::TabHandle;

const SEARCH: &str = "https://p.example/search_result?keyword=espresso";

fn catalog_line(note: &str) -> String {
    format!(
        r#"{{"noteId":"{note}","safeUrl":"https://p.example/explore/{note}?xsec_token=tok","searchUrl":"{SEARCH}"}}"#
    )
}

fn catalog_of(notes: &[&str]) -> LinkCatalog {
    let lines: Vec<String> = notes.iter().map(|n| catalog_line(n)).collect();
    LinkCatalog::from_lines(lines.iter().map(String::as_str), "xsec_token").unwrap()
}

fn opts(max_tabs: usize) -> HarvestOptions {
    HarvestOptions {
        max_tabs,
        batch_size: 2,
        max_retry_per_note: 2,
        coverage_ratio: 0.9,
        note_comment_cap: None,
        token_param: "xsec_token".to_string(),
        settle_ms: 0,
    }
}

fn note_id_of(url: &str) -> String {
    url.rsplit('/')
        .next()
        .and_then(|tail| tail.split('?').next())
        .unwrap_or_default()
        .to_string()
}

// ── In-memory browser session ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum SessionEvent {
    Open(String),
    Close(String),
}

/// Tab 0 is the search page; closing renumbers, like the real service.
struct FakeControl {
    urls: Mutex<Vec<String>>,
    events: Mutex<Vec<SessionEvent>>,
    max_concurrent_task_tabs: Mutex<usize>,
}

impl FakeControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            urls: Mutex::new(vec![SEARCH.to_string()]),
            events: Mutex::new(Vec::new()),
            max_concurrent_task_tabs: Mutex::new(0),
        })
    }

    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    fn max_concurrent(&self) -> usize {
        *self.max_concurrent_task_tabs.lock().unwrap()
    }
}

#[async_trait]
impl BrowserControl for FakeControl {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>, ChannelError> {
        Ok(self
            .urls
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(index, url)| TabInfo {
                index,
                url: url.clone(),
                title: String::new(),
            })
            .collect())
    }

    async fn open_tab(&self, url: &str) -> Result<usize, ChannelError> {
        let mut urls = self.urls.lock().unwrap();
        urls.push(url.to_string());
        self.events
            .lock()
            .unwrap()
            .push(SessionEvent::Open(note_id_of(url)));
        let mut max = self.max_concurrent_task_tabs.lock().unwrap();
        *max = (*max).max(urls.len() - 1);
        Ok(urls.len() - 1)
    }

    async fn switch_tab(&self, _index: usize) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn close_tab(&self, index: usize) -> Result<(), ChannelError> {
        let mut urls = self.urls.lock().unwrap();
        if index >= urls.len() {
            return Err(ChannelError::Api {
                status: 404,
                message: "no such tab".into(),
            });
        }
        let url = urls.remove(index);
        self.events
            .lock()
            .unwrap()
            .push(SessionEvent::Close(note_id_of(&url)));
        Ok(())
    }

    async fn navigate(&self, index: usize, url: &str) -> Result<(), ChannelError> {
        self.urls.lock().unwrap()[index] = url.to_string();
        Ok(())
    }

    async fn current_url(&self, index: usize) -> Result<String, ChannelError> {
        Ok(self.urls.lock().unwrap()[index].clone())
    }

    async fn run_script(
        &self,
        _index: usize,
        _script: &str,
    ) -> Result<serde_json::Value, ChannelError> {
        Ok(serde_json::Value::Null)
    }

    async fn screenshot(&self, _index: usize) -> Result<Vec<u8>, ChannelError> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
    }
}

// ── Collaborator doubles ─────────────────────────────────────────────────────

/// Succeeds unless a per-note failure budget was configured.
struct FakeOpener {
    failures_left: Mutex<HashMap<String, u32>>,
}

impl FakeOpener {
    fn new() -> Self {
        Self {
            failures_left: Mutex::new(HashMap::new()),
        }
    }

    fn fail_first(self, note_id: &str, times: u32) -> Self {
        self.failures_left
            .lock()
            .unwrap()
            .insert(note_id.to_string(), times);
        self
    }
}

#[async_trait]
impl DetailOpener for FakeOpener {
    async fn open_detail(&self, _tab: TabHandle, link: &LinkEntry) -> Result<OpenedDetail> {
        if let Some(left) = self.failures_left.lock().unwrap().get_mut(&link.note_id) {
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("detail view never appeared for {}", link.note_id);
            }
        }
        Ok(OpenedDetail {
            note_id: link.note_id.clone(),
            detail_url: link.safe_url.clone(),
        })
    }
}

struct FakeExtractor;

#[async_trait]
impl DetailExtractor for FakeExtractor {
    async fn extract(&self, _tab: TabHandle, note_id: &str) -> Result<NoteDetail> {
        Ok(NoteDetail {
            note_id: note_id.to_string(),
            title: format!("title of {note_id}"),
            author: "someone".into(),
            body: "body".into(),
            ..NoteDetail::default()
        })
    }
}

enum ExpandStep {
    Deliver(ExpansionResult),
    Transient,
}

/// Plays back a scripted batch sequence per note, resolved from the tab's
/// current URL. Once a note's script runs out it reports the end of comments.
struct FakeExpander {
    control: Arc<FakeControl>,
    scripts: Mutex<HashMap<String, VecDeque<ExpandStep>>>,
}

impl FakeExpander {
    fn new(control: Arc<FakeControl>) -> Self {
        Self {
            control,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    fn script(self, note_id: &str, steps: Vec<ExpandStep>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(note_id.to_string(), steps.into());
        self
    }
}

fn items(note_id: &str, from: usize, n: usize) -> Vec<CommentItem> {
    (from..from + n)
        .map(|i| CommentItem {
            key: format!("{note_id}-c{i}"),
            author: "a".into(),
            body: format!("comment {i}"),
            likes: None,
            published_at: None,
            is_reply: false,
        })
        .collect()
}

/// A full batch that stopped at the per-call cap: more may follow.
fn capped(note_id: &str, from: usize, n: usize) -> ExpandStep {
    ExpandStep::Deliver(ExpansionResult {
        new_items: items(note_id, from, n),
        stopped_at_cap: true,
        ..ExpansionResult::default()
    })
}

/// A batch that reached the end of the comment section.
fn finished(note_id: &str, from: usize, n: usize, header_total: Option<u64>) -> ExpandStep {
    ExpandStep::Deliver(ExpansionResult {
        new_items: items(note_id, from, n),
        reached_end: true,
        header_total,
        ..ExpansionResult::default()
    })
}

/// Neither finished nor at the cap: a malfunctioning scroll layer.
fn anomaly(note_id: &str) -> ExpandStep {
    ExpandStep::Deliver(ExpansionResult {
        new_items: items(note_id, 900, 1),
        ..ExpansionResult::default()
    })
}

#[async_trait]
impl CommentBatchExpander for FakeExpander {
    async fn expand(
        &self,
        tab: TabHandle,
        _seen_keys: &HashSet<String>,
        _max_new: usize,
    ) -> Result<ExpansionResult> {
        let url = self.control.current_url(tab.0).await?;
        let note_id = note_id_of(&url);
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&note_id)
            .and_then(|q| q.pop_front());
        match step {
            Some(ExpandStep::Deliver(r)) => Ok(r),
            Some(ExpandStep::Transient) => {
                Err(ChannelError::Timeout("evaluate call timed out".into()).into())
            }
            None => Ok(ExpansionResult {
                reached_end: true,
                ..ExpansionResult::default()
            }),
        }
    }
}

#[derive(Default)]
struct StoredNote {
    detail: Option<NoteDetail>,
    comments: Vec<CommentItem>,
    comments_written: bool,
    complete: bool,
}

#[derive(Default)]
struct MemorySink {
    notes: Mutex<HashMap<String, StoredNote>>,
    shortfalls: Mutex<Vec<ShortfallRecord>>,
    evidence: Mutex<Vec<(String, String)>>,
    discards: Mutex<u32>,
}

impl MemorySink {
    fn seed_complete(&self, note_id: &str) {
        let mut notes = self.notes.lock().unwrap();
        notes.insert(
            note_id.to_string(),
            StoredNote {
                detail: Some(NoteDetail::default()),
                comments: Vec::new(),
                comments_written: true,
                complete: true,
            },
        );
    }

    fn comments_of(&self, note_id: &str) -> Vec<String> {
        self.notes
            .lock()
            .unwrap()
            .get(note_id)
            .map(|n| n.comments.iter().map(|c| c.key.clone()).collect())
            .unwrap_or_default()
    }

    fn evidence_names(&self, note_id: &str) -> Vec<String> {
        self.evidence
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == note_id)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn write_detail(&self, note_id: &str, detail: &NoteDetail) -> Result<()> {
        self.notes
            .lock()
            .unwrap()
            .entry(note_id.to_string())
            .or_default()
            .detail = Some(detail.clone());
        Ok(())
    }

    async fn write_comments(
        &self,
        note_id: &str,
        comments: &[CommentItem],
        _state: &NoteState,
    ) -> Result<()> {
        let mut notes = self.notes.lock().unwrap();
        let record = notes.entry(note_id.to_string()).or_default();
        record.comments = comments.to_vec();
        record.comments_written = true;
        Ok(())
    }

    async fn finalize(&self, note_id: &str, _state: &NoteState) -> Result<()> {
        self.notes
            .lock()
            .unwrap()
            .entry(note_id.to_string())
            .or_default()
            .complete = true;
        Ok(())
    }

    async fn discard_comments(&self, note_id: &str) -> Result<()> {
        *self.discards.lock().unwrap() += 1;
        if let Some(record) = self.notes.lock().unwrap().get_mut(note_id) {
            record.comments.clear();
            record.comments_written = false;
            record.complete = false;
        }
        Ok(())
    }

    async fn write_evidence(&self, note_id: &str, name: &str, _bytes: &[u8]) -> Result<()> {
        self.evidence
            .lock()
            .unwrap()
            .push((note_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn record_shortfall(&self, record: &ShortfallRecord) -> Result<()> {
        self.shortfalls.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn persisted_count(&self, _criteria: &CompletionCriteria) -> Result<PersistedSet> {
        let notes = self.notes.lock().unwrap();
        let mut set = PersistedSet::default();
        for (id, record) in notes.iter() {
            if record.detail.is_some() && record.comments_written && record.complete {
                set.count += 1;
                set.note_ids.insert(id.clone());
            }
        }
        Ok(set)
    }
}

#[derive(Default)]
struct MemoryQuarantine {
    moved: Mutex<Vec<(String, String, serde_json::Value)>>,
}

#[async_trait]
impl QuarantineMover for MemoryQuarantine {
    async fn relocate(&self, note_id: &str, reason: &str, meta: serde_json::Value) -> Result<()> {
        self.moved
            .lock()
            .unwrap()
            .push((note_id.to_string(), reason.to_string(), meta));
        Ok(())
    }
}

struct Harness {
    control: Arc<FakeControl>,
    sink: Arc<MemorySink>,
    quarantine: Arc<MemoryQuarantine>,
    scheduler: TaskScheduler,
}

fn harness(opener: FakeOpener, expander: FakeExpander, options: HarvestOptions) -> Harness {
    let control = expander.control.clone();
    let sink = Arc::new(MemorySink::default());
    let quarantine = Arc::new(MemoryQuarantine::default());
    let collab = Collaborators {
        opener: Arc::new(opener),
        extractor: Arc::new(FakeExtractor),
        expander: Arc::new(expander),
        sink: sink.clone(),
        quarantine: quarantine.clone(),
    };
    let scheduler = TaskScheduler::new(control.clone(), collab, options);
    Harness {
        control,
        sink,
        quarantine,
        scheduler,
    }
}

// ── Runs ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fills_to_the_tab_budget_and_admits_the_fifth_only_after_a_completion() {
    let control = FakeControl::new();
    let notes = ["n1", "n2", "n3", "n4", "n5"];
    let mut expander = FakeExpander::new(control.clone());
    for n in notes {
        // First batch fills the cap, second reaches the end.
        expander = expander.script(n, vec![capped(n, 0, 2), finished(n, 2, 1, Some(3))]);
    }
    let mut h = harness(FakeOpener::new(), expander, opts(4));

    let report = h.scheduler.execute(catalog_of(&notes), "espresso", 5).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.added_count, 5);
    assert_eq!(report.processed_count, 5);
    assert_eq!(report.rejected_count, 0);
    assert_eq!(report.final_count, 5);
    assert_eq!(h.control.max_concurrent(), 4, "tab budget must hold");

    // The first four notes get tabs up front; the fifth only after a close.
    let events = h.control.events();
    let first_close = events
        .iter()
        .position(|e| matches!(e, SessionEvent::Close(_)))
        .unwrap();
    let opens_before = events[..first_close]
        .iter()
        .filter(|e| matches!(e, SessionEvent::Open(_)))
        .count();
    assert_eq!(opens_before, 4);
    assert!(events[first_close..].contains(&SessionEvent::Open("n5".into())));
}

#[tokio::test]
async fn merged_comments_carry_no_duplicates_across_batches() {
    let control = FakeControl::new();
    // Second batch re-delivers n1-c1 alongside the genuinely new item.
    let overlap = ExpandStep::Deliver(ExpansionResult {
        new_items: vec![items("n1", 1, 1), items("n1", 2, 1)].concat(),
        reached_end: true,
        ..ExpansionResult::default()
    });
    let expander = FakeExpander::new(control.clone())
        .script("n1", vec![capped("n1", 0, 2), overlap]);
    let mut h = harness(FakeOpener::new(), expander, opts(2));

    let report = h.scheduler.execute(catalog_of(&["n1"]), "espresso", 1).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(h.sink.comments_of("n1"), vec!["n1-c0", "n1-c1", "n1-c2"]);
}

#[tokio::test]
async fn transient_open_failures_requeue_without_rejecting() {
    let control = FakeControl::new();
    let expander = FakeExpander::new(control.clone());
    let opener = FakeOpener::new().fail_first("n1", 2);
    let mut h = harness(opener, expander, opts(2));

    let report = h.scheduler.execute(catalog_of(&["n1"]), "espresso", 1).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.added_count, 1);
    assert_eq!(report.rejected_count, 0);
    assert!(h.quarantine.moved.lock().unwrap().is_empty());
    // Each requeue discarded the partial output of the failed attempt.
    assert_eq!(*h.sink.discards.lock().unwrap(), 2);
}

#[tokio::test]
async fn batch_failures_requeue_and_a_later_attempt_completes_the_note() {
    let control = FakeControl::new();
    // Two failed batch attempts, then a clean third run of the note.
    let expander = FakeExpander::new(control.clone()).script(
        "n1",
        vec![anomaly("n1"), anomaly("n1"), finished("n1", 0, 1, None)],
    );
    let mut h = harness(FakeOpener::new(), expander, opts(2));

    let report = h.scheduler.execute(catalog_of(&["n1"]), "espresso", 1).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.added_count, 1);
    assert_eq!(report.rejected_count, 0);
    assert_eq!(report.final_count, 1);
    assert!(h.quarantine.moved.lock().unwrap().is_empty());
    // Both requeues went through the from-scratch path.
    assert_eq!(*h.sink.discards.lock().unwrap(), 2);
}

#[tokio::test]
async fn a_note_completing_during_the_fill_phase_still_counts_as_success() {
    let control = FakeControl::new();
    // Done on its very first batch, before any rotate cycle runs.
    let expander =
        FakeExpander::new(control.clone()).script("n1", vec![finished("n1", 0, 2, Some(2))]);
    let mut h = harness(FakeOpener::new(), expander, opts(4));

    let report = h.scheduler.execute(catalog_of(&["n1"]), "espresso", 1).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.error, None);
    assert_eq!(report.added_count, 1);
    assert_eq!(report.final_count, 1);
}

#[tokio::test]
async fn transient_channel_failure_inside_a_batch_retries_once() {
    let control = FakeControl::new();
    let expander = FakeExpander::new(control.clone())
        .script("n1", vec![ExpandStep::Transient, finished("n1", 0, 1, None)]);
    let mut h = harness(FakeOpener::new(), expander, opts(2));

    let report = h.scheduler.execute(catalog_of(&["n1"]), "espresso", 1).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.added_count, 1);
    // The retry happened inside the batch; the ledger never saw a failure.
    assert_eq!(*h.sink.discards.lock().unwrap(), 0);
}

#[tokio::test]
async fn persistent_anomaly_rejects_after_exactly_three_attempts() {
    let control = FakeControl::new();
    let expander = FakeExpander::new(control.clone())
        .script("bad", vec![anomaly("bad"), anomaly("bad"), anomaly("bad")]);
    let mut h = harness(FakeOpener::new(), expander, opts(2));

    let report = h.scheduler.execute(catalog_of(&["bad"]), "espresso", 1).await;

    assert!(!report.success);
    assert_eq!(report.rejected_count, 1);
    assert_eq!(report.added_count, 0);
    assert_eq!(
        report.error.as_deref(),
        Some("target_not_reached: 0/1")
    );

    let moved = h.quarantine.moved.lock().unwrap();
    assert_eq!(moved.len(), 1);
    let (note_id, reason, meta) = &moved[0];
    assert_eq!(note_id, "bad");
    assert_eq!(reason, "retry_exhausted");
    assert_eq!(meta["attempts"], 3);

    // One failure screenshot per attempt.
    assert_eq!(
        h.sink.evidence_names("bad"),
        vec![
            "failure-attempt-1.png",
            "failure-attempt-2.png",
            "failure-attempt-3.png"
        ]
    );
}

#[tokio::test]
async fn a_rejected_note_does_not_stall_the_rest_of_the_catalog() {
    let control = FakeControl::new();
    let expander = FakeExpander::new(control.clone())
        .script("bad", vec![anomaly("bad"), anomaly("bad"), anomaly("bad")])
        .script("good", vec![capped("good", 0, 2), finished("good", 2, 1, None)]);
    let mut h = harness(FakeOpener::new(), expander, opts(4));

    let report = h
        .scheduler
        .execute(catalog_of(&["bad", "good"]), "espresso", 1)
        .await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.added_count, 1);
    assert_eq!(report.rejected_count, 1);
    assert!(h.sink.comments_of("good").len() == 3);
}

#[tokio::test]
async fn keyword_drift_aborts_before_any_tab_is_opened() {
    let control = FakeControl::new();
    let expander = FakeExpander::new(control.clone());
    let mut h = harness(FakeOpener::new(), expander, opts(2));

    let report = h.scheduler.execute(catalog_of(&["n1"]), "matcha", 1).await;

    assert!(!report.success);
    assert!(report.error.as_deref().unwrap_or("").contains("drift"));
    assert!(h.control.events().is_empty(), "no tab may be touched");
    assert_eq!(report.processed_count, 0);
}

#[tokio::test]
async fn already_persisted_notes_are_skipped_on_resumption() {
    let control = FakeControl::new();
    let expander = FakeExpander::new(control.clone());
    let mut h = harness(FakeOpener::new(), expander, opts(2));
    h.sink.seed_complete("n1");

    let report = h.scheduler.execute(catalog_of(&["n1", "n2"]), "espresso", 1).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.processed_count, 0, "nothing to open, target already met");
    assert!(h.control.events().is_empty());
    assert_eq!(report.final_count, 1);
}

#[tokio::test]
async fn exhausting_the_catalog_reports_the_exact_shortfall() {
    let control = FakeControl::new();
    let expander = FakeExpander::new(control.clone());
    let mut h = harness(FakeOpener::new(), expander, opts(2));

    let report = h
        .scheduler
        .execute(catalog_of(&["n1", "n2"]), "espresso", 5)
        .await;

    assert!(!report.success);
    assert_eq!(report.added_count, 2);
    assert_eq!(report.error.as_deref(), Some("target_not_reached: 2/5"));
}

#[tokio::test]
async fn coverage_shortfall_is_logged_but_the_note_still_completes() {
    let control = FakeControl::new();
    // Header claims 100 comments, the page only ever yields 2.
    let expander = FakeExpander::new(control.clone())
        .script("n1", vec![finished("n1", 0, 2, Some(100))]);
    let mut h = harness(FakeOpener::new(), expander, opts(2));

    let report = h.scheduler.execute(catalog_of(&["n1"]), "espresso", 1).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.added_count, 1);
    let shortfalls = h.sink.shortfalls.lock().unwrap();
    assert_eq!(shortfalls.len(), 1);
    assert_eq!(shortfalls[0].required, 90);
    assert_eq!(shortfalls[0].captured, 2);
}
