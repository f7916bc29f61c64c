pub mod batch;
pub mod catalog;
pub mod coverage;
pub mod retry;
pub mod scheduler;

use thiserror::Error;

use crate::browser::error::ChannelError;
use crate::browser::tabs::TabError;
use crate::core::HarvestConfig;

/// Per-note failures caught at the scheduler boundary and converted into a
/// retry-or-reject decision. Only catalog-level errors abort the run.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Tab(#[from] TabError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The batch neither completed nor hit its cap; scroll/extraction is
    /// malfunctioning and continuing would mask broken pagination.
    #[error("extraction anomaly: batch returned {new_items} items without finishing or hitting its cap")]
    ExtractionAnomaly { new_items: usize },

    #[error("collaborator failure: {0}")]
    Collaborator(#[from] anyhow::Error),
}

/// Run-scoped knobs resolved once from [`HarvestConfig`].
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub max_tabs: usize,
    pub batch_size: usize,
    pub max_retry_per_note: u32,
    pub coverage_ratio: f64,
    pub note_comment_cap: Option<usize>,
    pub token_param: String,
    pub settle_ms: u64,
}

impl HarvestOptions {
    pub fn from_config(cfg: &HarvestConfig) -> Self {
        Self {
            max_tabs: cfg.resolve_max_tabs(),
            batch_size: cfg.resolve_batch_size(),
            max_retry_per_note: cfg.resolve_max_retry_per_note(),
            coverage_ratio: cfg.resolve_coverage_ratio(),
            note_comment_cap: cfg.resolve_note_comment_cap(),
            token_param: cfg.resolve_token_param(),
            settle_ms: cfg.resolve_settle_ms(),
        }
    }
}

pub use catalog::{CatalogError, LinkCatalog};
pub use retry::{FailureDisposition, RetryLedger};
pub use scheduler::{run_harvest, TaskScheduler};
