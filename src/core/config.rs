use std::path::PathBuf;

// ---------------------------------------------------------------------------
// HarvestConfig: file-based config loader (noteharvest.json) with env-var
// fallback for every field.
// ---------------------------------------------------------------------------

/// Top-level config loaded from `noteharvest.json`.
///
/// Every field is optional in the file; `resolve_*` accessors apply the
/// env-var fallback and the built-in default.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct HarvestConfig {
    /// Base URL of the remote browser-control service.
    pub control_base_url: Option<String>,
    /// Bearer token for the control service. Never logged.
    pub control_token: Option<String>,
    /// Hard bound on concurrently open task tabs (the reserved search tab is
    /// not counted). Default: 4.
    pub max_tabs: Option<usize>,
    /// Max new comments revealed per batch. Default: 50.
    pub batch_size: Option<usize>,
    /// Retries per note before permanent rejection. `0` means fail on the
    /// first error. Default: 2.
    pub max_retry_per_note: Option<u32>,
    /// Minimum captured/header-total ratio before a shortfall is logged.
    /// Default: 0.9.
    pub coverage_ratio: Option<f64>,
    /// Optional hard cap on comments collected per note.
    pub note_comment_cap: Option<usize>,
    /// Settle delay after UI actions, in milliseconds. Default: 1200.
    pub settle_ms: Option<u64>,
    /// Per-remote-call timeout, in seconds. Default: 30.
    pub call_timeout_secs: Option<u64>,
    /// Query parameter that carries the platform access token on detail URLs.
    /// Default: `xsec_token`.
    pub token_param: Option<String>,
    /// Link catalog file (NDJSON). Default: `links.ndjson` in the output dir.
    pub links_file: Option<String>,
    /// Output root. Default: `~/.noteharvest/out`.
    pub output_dir: Option<String>,
}

impl HarvestConfig {
    /// Control base URL: JSON field → `NOTEHARVEST_CONTROL_URL` env var →
    /// `http://127.0.0.1:9321`.
    pub fn resolve_control_base_url(&self) -> String {
        if let Some(u) = &self.control_base_url {
            if !u.trim().is_empty() {
                return u.trim_end_matches('/').to_string();
            }
        }
        std::env::var("NOTEHARVEST_CONTROL_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://127.0.0.1:9321".to_string())
    }

    /// Control token: JSON field → `NOTEHARVEST_CONTROL_TOKEN` env var → `None`.
    ///
    /// An explicit empty string in the file means "no token required".
    pub fn resolve_control_token(&self) -> Option<String> {
        if let Some(t) = &self.control_token {
            return Some(t.trim().to_string());
        }
        std::env::var("NOTEHARVEST_CONTROL_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    /// Tab budget: JSON field → `NOTEHARVEST_MAX_TABS` env var → 4.
    /// Clamped to at least 1; a zero budget could never open work.
    pub fn resolve_max_tabs(&self) -> usize {
        self.max_tabs
            .or_else(|| env_parse("NOTEHARVEST_MAX_TABS"))
            .unwrap_or(4)
            .max(1)
    }

    /// Batch size: JSON field → `NOTEHARVEST_BATCH_SIZE` env var → 50.
    pub fn resolve_batch_size(&self) -> usize {
        self.batch_size
            .or_else(|| env_parse("NOTEHARVEST_BATCH_SIZE"))
            .unwrap_or(50)
            .max(1)
    }

    /// Retry bound: JSON field → `NOTEHARVEST_MAX_RETRY` env var → 2.
    pub fn resolve_max_retry_per_note(&self) -> u32 {
        self.max_retry_per_note
            .or_else(|| env_parse("NOTEHARVEST_MAX_RETRY"))
            .unwrap_or(2)
    }

    /// Coverage ratio: JSON field → `NOTEHARVEST_COVERAGE_RATIO` env var → 0.9.
    /// Clamped to (0, 1].
    pub fn resolve_coverage_ratio(&self) -> f64 {
        let r = self
            .coverage_ratio
            .or_else(|| env_parse("NOTEHARVEST_COVERAGE_RATIO"))
            .unwrap_or(0.9);
        r.clamp(f64::EPSILON, 1.0)
    }

    /// Per-note comment cap: JSON field → `NOTEHARVEST_NOTE_CAP` env var → none.
    pub fn resolve_note_comment_cap(&self) -> Option<usize> {
        self.note_comment_cap
            .or_else(|| env_parse("NOTEHARVEST_NOTE_CAP"))
            .filter(|&c| c > 0)
    }

    /// Settle delay ms: JSON field → `NOTEHARVEST_SETTLE_MS` env var → 1200.
    pub fn resolve_settle_ms(&self) -> u64 {
        self.settle_ms
            .or_else(|| env_parse("NOTEHARVEST_SETTLE_MS"))
            .unwrap_or(1200)
    }

    /// Remote-call timeout secs: JSON field → `NOTEHARVEST_CALL_TIMEOUT` → 30.
    pub fn resolve_call_timeout_secs(&self) -> u64 {
        self.call_timeout_secs
            .or_else(|| env_parse("NOTEHARVEST_CALL_TIMEOUT"))
            .unwrap_or(30)
            .max(1)
    }

    /// Access-token parameter name: JSON field → `NOTEHARVEST_TOKEN_PARAM` →
    /// `xsec_token`.
    pub fn resolve_token_param(&self) -> String {
        if let Some(p) = &self.token_param {
            if !p.trim().is_empty() {
                return p.trim().to_string();
            }
        }
        std::env::var("NOTEHARVEST_TOKEN_PARAM")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "xsec_token".to_string())
    }

    /// Output root: JSON field → `NOTEHARVEST_OUTPUT_DIR` env var →
    /// `~/.noteharvest/out` (cwd-relative `noteharvest-out` when no home dir).
    pub fn resolve_output_dir(&self) -> PathBuf {
        if let Some(d) = &self.output_dir {
            if !d.trim().is_empty() {
                return PathBuf::from(d.trim());
            }
        }
        if let Ok(d) = std::env::var("NOTEHARVEST_OUTPUT_DIR") {
            if !d.trim().is_empty() {
                return PathBuf::from(d.trim());
            }
        }
        match dirs::home_dir() {
            Some(home) => home.join(".noteharvest").join("out"),
            None => PathBuf::from("noteharvest-out"),
        }
    }

    /// Link catalog path: JSON field → `NOTEHARVEST_LINKS_FILE` env var →
    /// `links.ndjson` inside the output dir.
    pub fn resolve_links_file(&self) -> PathBuf {
        if let Some(f) = &self.links_file {
            if !f.trim().is_empty() {
                return PathBuf::from(f.trim());
            }
        }
        if let Ok(f) = std::env::var("NOTEHARVEST_LINKS_FILE") {
            if !f.trim().is_empty() {
                return PathBuf::from(f.trim());
            }
        }
        self.resolve_output_dir().join("links.ndjson")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Load `noteharvest.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `NOTEHARVEST_CONFIG` env var path
/// 2. `./noteharvest.json`  (process cwd)
/// 3. `../noteharvest.json` (one level up)
///
/// Missing file → `HarvestConfig::default()` (silent, env-var fallbacks apply).
/// Parse error → log a warning, return `HarvestConfig::default()`.
pub fn load_harvest_config() -> HarvestConfig {
    let candidates: Vec<PathBuf> = {
        let mut v = vec![
            PathBuf::from("noteharvest.json"),
            PathBuf::from("../noteharvest.json"),
        ];
        if let Ok(env_path) = std::env::var("NOTEHARVEST_CONFIG") {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<HarvestConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("noteharvest.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "noteharvest.json parse error at {}: {}; using defaults",
                        path.display(),
                        e
                    );
                    return HarvestConfig::default();
                }
            },
            Err(_) => continue, // not at this path, try next
        }
    }

    HarvestConfig::default()
}
