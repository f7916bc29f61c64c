//! Tab registry: note-id identity over volatile tab indices.
//!
//! Closing any tab renumbers the others, so an index is never kept as ground
//! truth between operations. The registry treats the live tab list as a
//! queryable arena: "which tab shows note X" is recomputed immediately before
//! every action, and the internal bookkeeping map is advisory only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::channel::BrowserControl;
use super::error::ChannelError;

/// Tab index reserved for the search-results page. Never assigned to a task.
pub const SEARCH_TAB_INDEX: usize = 0;

/// A tab index captured from the live tab list. Valid only until the next
/// open/close on the session, so use immediately, never store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabHandle(pub usize);

#[derive(Debug, Error)]
pub enum TabError {
    #[error("tab budget exhausted: {open} task tabs open, budget {budget}")]
    BudgetExhausted { open: usize, budget: usize },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// True when `url` carries `note_id` as a complete path segment. A bare
/// substring test would let an id that prefixes a longer id (`n1` vs `n10`)
/// claim the wrong tab.
pub fn url_names_note(url: &str, note_id: &str) -> bool {
    if note_id.is_empty() {
        return false;
    }
    let bytes = url.as_bytes();
    let mut start = 0;
    while let Some(pos) = url[start..].find(note_id) {
        let begin = start + pos;
        let end = begin + note_id.len();
        let bounded_left = begin == 0 || bytes[begin - 1] == b'/';
        let bounded_right =
            end == url.len() || matches!(bytes[end], b'/' | b'?' | b'#' | b'&');
        if bounded_left && bounded_right {
            return true;
        }
        start = end;
    }
    false
}

pub struct TabRegistry {
    control: Arc<dyn BrowserControl>,
    /// Hard bound on task tabs; the reserved search tab is not counted.
    max_tabs: usize,
    /// Advisory note-id → last-seen index map. Rebuilt after every open/close
    /// and never consulted without re-resolution.
    assignments: HashMap<String, usize>,
}

impl TabRegistry {
    pub fn new(control: Arc<dyn BrowserControl>, max_tabs: usize) -> Self {
        Self {
            control,
            max_tabs,
            assignments: HashMap::new(),
        }
    }

    /// Scan currently open tabs for one whose URL names `note_id`.
    pub async fn resolve_tab_for_note(&mut self, note_id: &str) -> Result<Option<TabHandle>, TabError> {
        let tabs = self.control.list_tabs().await?;
        for tab in &tabs {
            if tab.index != SEARCH_TAB_INDEX && url_names_note(&tab.url, note_id) {
                self.assignments.insert(note_id.to_string(), tab.index);
                return Ok(Some(TabHandle(tab.index)));
            }
        }
        self.assignments.remove(note_id);
        Ok(None)
    }

    /// Prefer an existing idle tab (one matching no active note), else open a
    /// new one, up to the pool budget.
    pub async fn open_or_reuse(
        &mut self,
        url: &str,
        active_ids: &HashSet<String>,
    ) -> Result<TabHandle, TabError> {
        let tabs = self.control.list_tabs().await?;
        let task_tabs: Vec<_> = tabs
            .iter()
            .filter(|t| t.index != SEARCH_TAB_INDEX)
            .collect();

        // Idle tab: open, not reserved, not showing any active note.
        if let Some(idle) = task_tabs
            .iter()
            .find(|t| !active_ids.iter().any(|id| url_names_note(&t.url, id)))
        {
            debug!(index = idle.index, "reusing idle tab");
            self.control.navigate(idle.index, url).await?;
            // Navigation does not renumber, but re-associate anyway.
            self.rebuild_bookkeeping(active_ids).await?;
            return Ok(TabHandle(idle.index));
        }

        if task_tabs.len() >= self.max_tabs {
            return Err(TabError::BudgetExhausted {
                open: task_tabs.len(),
                budget: self.max_tabs,
            });
        }

        let index = self.control.open_tab(url).await?;
        self.rebuild_bookkeeping(active_ids).await?;
        Ok(TabHandle(index))
    }

    /// Close a tab and re-scan, since every other index may have shifted.
    pub async fn close(
        &mut self,
        handle: TabHandle,
        active_ids: &HashSet<String>,
    ) -> Result<(), TabError> {
        self.control.close_tab(handle.0).await?;
        self.rebuild_bookkeeping(active_ids).await?;
        Ok(())
    }

    /// Re-scan all open tabs and re-associate them with active notes. Called
    /// after any open/close since indices are volatile.
    pub async fn rebuild_bookkeeping(
        &mut self,
        active_ids: &HashSet<String>,
    ) -> Result<(), TabError> {
        let tabs = self.control.list_tabs().await?;
        self.assignments.clear();
        for tab in &tabs {
            if tab.index == SEARCH_TAB_INDEX {
                continue;
            }
            if let Some(id) = active_ids.iter().find(|id| url_names_note(&tab.url, id)) {
                self.assignments.insert(id.clone(), tab.index);
            }
        }
        let unmatched = active_ids.len() - self.assignments.len();
        if unmatched > 0 {
            // Not fatal here: the owning task re-opens at its safe URL on the
            // next batch when resolution misses.
            warn!(unmatched, "active notes without a matching open tab");
        }
        Ok(())
    }

    // Thin passthroughs for callers holding a freshly-resolved handle. The
    // handle must come from a resolve/open on this registry in the same
    // action sequence, with no open/close in between.

    pub async fn switch_to(&self, handle: TabHandle) -> Result<(), TabError> {
        Ok(self.control.switch_tab(handle.0).await?)
    }

    pub async fn current_url(&self, handle: TabHandle) -> Result<String, TabError> {
        Ok(self.control.current_url(handle.0).await?)
    }

    pub async fn navigate_to(&self, handle: TabHandle, url: &str) -> Result<(), TabError> {
        Ok(self.control.navigate(handle.0, url).await?)
    }

    pub async fn screenshot(&self, handle: TabHandle) -> Result<Vec<u8>, TabError> {
        Ok(self.control.screenshot(handle.0).await?)
    }
}
