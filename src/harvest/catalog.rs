//! Link catalog: loads, deduplicates, and validates candidate note
//! references from the persisted NDJSON link record set.
//!
//! The whole catalog must have been captured under one search context. A
//! single mismatched `searchUrl` invalidates the run (not just the entry):
//! it signals the catalog itself was written under inconsistent state, and
//! collecting from it would silently mix result sets.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::core::types::{LinkEntry, LinkRecord};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("link catalog not readable at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("link catalog is empty after filtering")]
    Empty,

    #[error("search context mismatch: note {note_id} captured under {found}, run expects {expected}")]
    SearchContextMismatch {
        note_id: String,
        found: String,
        expected: String,
    },

    #[error("search keyword drift: {keyword:?} does not appear in search url {search_url}")]
    KeywordDrift {
        keyword: String,
        search_url: String,
    },
}

/// The deduplicated, ordered candidate set plus the single search context all
/// entries share.
#[derive(Debug, Clone)]
pub struct LinkCatalog {
    pub entries: Vec<LinkEntry>,
    pub expected_search_url: String,
}

impl LinkCatalog {
    /// Load and validate the catalog file. Fails the whole run (no tab ever
    /// opened) when the filtered set is empty or the search contexts disagree.
    pub fn load(path: &Path, token_param: &str) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_lines(contents.lines(), token_param)?;
        info!(
            entries = catalog.entries.len(),
            path = %path.display(),
            "link catalog loaded"
        );
        Ok(catalog)
    }

    /// Parse newline-delimited records. Malformed lines and duplicate note
    /// ids are skipped with a warning; entries missing the access-token
    /// parameter are discarded; a search-context disagreement is fatal.
    pub fn from_lines<'a, I>(lines: I, token_param: &str) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let token_marker = format!("{token_param}=");
        let mut entries: Vec<LinkEntry> = Vec::new();
        let mut expected: Option<String> = None;

        for (line_no, line) in lines.into_iter().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: LinkRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "skipping malformed catalog line");
                    continue;
                }
            };
            if record.note_id.is_empty() {
                warn!(line = line_no + 1, "skipping record with empty note id");
                continue;
            }
            if !record.safe_url.contains(&token_marker) {
                warn!(
                    note_id = %record.note_id,
                    "skipping record: safe url carries no {token_param} parameter"
                );
                continue;
            }
            if entries.iter().any(|e| e.note_id == record.note_id) {
                warn!(note_id = %record.note_id, "skipping duplicate note id");
                continue;
            }

            let search_url = canonicalize_search_url(&record.search_url);
            match &expected {
                None => expected = Some(search_url.clone()),
                Some(exp) if *exp != search_url => {
                    return Err(CatalogError::SearchContextMismatch {
                        note_id: record.note_id,
                        found: search_url,
                        expected: exp.clone(),
                    });
                }
                Some(_) => {}
            }

            entries.push(LinkEntry {
                note_id: record.note_id,
                safe_url: record.safe_url,
                search_url,
                captured_at: record.ts.unwrap_or_else(chrono::Utc::now),
            });
        }

        let expected_search_url = expected.ok_or(CatalogError::Empty)?;
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self {
            entries,
            expected_search_url,
        })
    }

    /// Anti-drift guard: the run keyword must appear in the shared search URL,
    /// either literally or percent-encoded (non-ASCII keywords arrive encoded).
    /// A miss is a hard stop, never auto-corrected.
    pub fn verify_keyword(&self, keyword: &str) -> Result<(), CatalogError> {
        let haystack = self.expected_search_url.to_lowercase();
        let literal = keyword.to_lowercase();
        let encoded = utf8_percent_encode(keyword, NON_ALPHANUMERIC)
            .to_string()
            .to_lowercase();
        if haystack.contains(&literal) || haystack.contains(&encoded) {
            return Ok(());
        }
        Err(CatalogError::KeywordDrift {
            keyword: keyword.to_string(),
            search_url: self.expected_search_url.clone(),
        })
    }
}

/// Canonical form used for the strict equality check: parsed, fragment
/// dropped, trailing slash trimmed.
fn canonicalize_search_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut u) => {
            u.set_fragment(None);
            let mut s = u.to_string();
            while s.ends_with('/') && s.len() > 1 {
                s.pop();
            }
            s
        }
        Err(_) => raw.trim().trim_end_matches('/').to_string(),
    }
}
