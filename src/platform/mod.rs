//! Platform-facing collaborators: scripted UI interaction against the note
//! detail view.
//!
//! Everything here drives the page through the control channel only: click
//! scripts, DOM capture, bounded scroll/expand. Direct URL construction is
//! forbidden for the detail open; a note is reached by clicking its card so
//! the page issues its own tokened navigation.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::browser::{url_names_note, BrowserControl, TabHandle};
use crate::collab::{CommentBatchExpander, DetailExtractor, DetailOpener};
use crate::core::types::{CommentItem, ExpansionResult, LinkEntry, NoteDetail, OpenedDetail};
use crate::harvest::batch::settle;

fn sel(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("bad selector {css}: {e}"))
}

/// Last path segment of a detail URL, which names the note.
fn note_id_from_url(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("unparseable detail url {url}"))?;
    parsed
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| anyhow!("detail url has no note segment: {url}"))
}

// ── Opener ───────────────────────────────────────────────────────────────────

/// Clicks the note's card in the current page so the page itself performs the
/// tokened navigation, then verifies where the tab actually landed.
pub struct ScriptedOpener {
    control: Arc<dyn BrowserControl>,
    token_param: String,
    settle_ms: u64,
}

impl ScriptedOpener {
    pub fn new(control: Arc<dyn BrowserControl>, token_param: String, settle_ms: u64) -> Self {
        Self {
            control,
            token_param,
            settle_ms,
        }
    }

    fn landed(&self, url: &str, note_id: &str) -> bool {
        url_names_note(url, note_id) && url.contains(&format!("{}=", self.token_param))
    }
}

const CLICK_CARD_SCRIPT: &str = r#"
(() => {
  const id = __NOTE_ID__;
  const card = document.querySelector(`a[href*="${id}"]`)
    || [...document.querySelectorAll('section a')].find(a => (a.href || '').includes(id));
  if (!card) return { clicked: false };
  card.scrollIntoView({ block: 'center' });
  card.click();
  return { clicked: true };
})()
"#;

#[derive(Deserialize)]
struct ClickBody {
    clicked: bool,
}

#[async_trait]
impl DetailOpener for ScriptedOpener {
    async fn open_detail(&self, tab: TabHandle, link: &LinkEntry) -> Result<OpenedDetail> {
        let url = self.control.current_url(tab.0).await?;
        if !self.landed(&url, &link.note_id) {
            // The tab landed somewhere generic (feed, interstitial). Click the
            // note's own card so the page issues the tokened navigation.
            let script =
                CLICK_CARD_SCRIPT.replace("__NOTE_ID__", &serde_json::to_string(&link.note_id)?);
            let value = self.control.run_script(tab.0, &script).await?;
            let body: ClickBody = serde_json::from_value(value)
                .context("click script returned unexpected shape")?;
            if !body.clicked {
                bail!("no card found for note {} on the open page", link.note_id);
            }
            settle(self.settle_ms).await;
        }

        let detail_url = self.control.current_url(tab.0).await?;
        if !detail_url.contains(&format!("{}=", self.token_param)) {
            bail!("detail url for {} carries no access token", link.note_id);
        }
        let note_id = note_id_from_url(&detail_url)?;
        debug!(%note_id, %detail_url, "detail view open and verified");
        Ok(OpenedDetail {
            note_id,
            detail_url,
        })
    }
}

// ── Extractor ────────────────────────────────────────────────────────────────

/// Captures the open detail view's DOM and parses the header/body/media
/// metadata out of it.
pub struct ScriptedExtractor {
    control: Arc<dyn BrowserControl>,
}

impl ScriptedExtractor {
    pub fn new(control: Arc<dyn BrowserControl>) -> Self {
        Self { control }
    }
}

const CAPTURE_DOM_SCRIPT: &str = "document.documentElement.outerHTML";

#[async_trait]
impl DetailExtractor for ScriptedExtractor {
    async fn extract(&self, tab: TabHandle, note_id: &str) -> Result<NoteDetail> {
        let value = self.control.run_script(tab.0, CAPTURE_DOM_SCRIPT).await?;
        let html = value
            .as_str()
            .ok_or_else(|| anyhow!("dom capture returned non-string"))?
            .to_string();
        parse_detail(&html, note_id)
    }
}

fn parse_detail(html: &str, note_id: &str) -> Result<NoteDetail> {
    let doc = Html::parse_document(html);
    let text_of = |css: &str| -> Result<String> {
        Ok(doc
            .select(&sel(css)?)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .unwrap_or_default())
    };

    let title = text_of("#detail-title, .note-detail .title")?;
    let body = text_of("#detail-desc, .note-detail .desc")?;
    let author = text_of(".author-container .username, .note-detail .author .name")?;
    if title.is_empty() && body.is_empty() {
        bail!("detail view for {note_id} has neither title nor body");
    }

    let media_urls = doc
        .select(&sel(".media-container img, .note-detail .carousel img")?)
        .filter_map(|el| el.value().attr("src"))
        .map(String::from)
        .collect();

    let published_at = {
        let s = text_of(".bottom-container .date, .note-detail .publish-date")?;
        (!s.is_empty()).then_some(s)
    };
    let like_count = doc
        .select(&sel(".engage-bar .like-wrapper .count")?)
        .next()
        .and_then(|el| el.text().collect::<String>().trim().parse::<u64>().ok());

    Ok(NoteDetail {
        note_id: note_id.to_string(),
        title,
        author,
        body,
        media_urls,
        published_at,
        like_count,
    })
}

// ── Expander ─────────────────────────────────────────────────────────────────

/// One bounded scroll-and-reveal pass over the comment section. The script
/// only surfaces items whose keys the caller has not seen, and stops once it
/// has collected the per-call cap.
pub struct ScriptedExpander {
    control: Arc<dyn BrowserControl>,
    settle_ms: u64,
}

impl ScriptedExpander {
    pub fn new(control: Arc<dyn BrowserControl>, settle_ms: u64) -> Self {
        Self { control, settle_ms }
    }
}

const EXPAND_SCRIPT: &str = r#"
(() => {
  const seen = new Set(__SEEN_KEYS__);
  const cap = __MAX_NEW__;
  const section = document.querySelector('.comments-container, .comment-list');
  if (!section) return { items: [], reachedEnd: false, emptyState: true, headerTotal: null };

  if (document.querySelector('.comments-container .empty, .comment-list .no-comments')) {
    return { items: [], reachedEnd: true, emptyState: true, headerTotal: 0 };
  }

  const headerText = (document.querySelector('.comments-container .total, .comment-header .count') || {}).textContent || '';
  const headerMatch = headerText.replace(/,/g, '').match(/\d+/);
  const headerTotal = headerMatch ? parseInt(headerMatch[0], 10) : null;

  section.scrollBy(0, section.clientHeight * 2);
  for (const btn of section.querySelectorAll('.show-more, .reply-expand')) {
    btn.click();
  }

  const items = [];
  for (const node of section.querySelectorAll('.comment-item, .reply-item')) {
    const author = (node.querySelector('.author, .name') || {}).textContent || '';
    const body = (node.querySelector('.content, .note-text') || {}).textContent || '';
    const key = node.id || node.dataset.id || `${author.trim()}|${body.trim().slice(0, 64)}`;
    if (!key || seen.has(key)) continue;
    seen.add(key);
    const likesText = (node.querySelector('.like .count') || {}).textContent || '';
    const likes = parseInt(likesText.replace(/,/g, ''), 10);
    items.push({
      key,
      author: author.trim(),
      body: body.trim(),
      likes: Number.isFinite(likes) ? likes : null,
      publishedAt: ((node.querySelector('.date') || {}).textContent || '').trim() || null,
      isReply: node.classList.contains('reply-item'),
    });
    if (items.length >= cap) break;
  }

  const reachedEnd = !!section.querySelector('.end-container, .comment-end')
    && items.length < cap;
  return { items, reachedEnd, emptyState: false, headerTotal };
})()
"#;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExpansion {
    items: Vec<RawComment>,
    reached_end: bool,
    empty_state: bool,
    header_total: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawComment {
    key: String,
    author: String,
    body: String,
    #[serde(default)]
    likes: Option<u64>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    is_reply: bool,
}

#[async_trait]
impl CommentBatchExpander for ScriptedExpander {
    async fn expand(
        &self,
        tab: TabHandle,
        seen_keys: &HashSet<String>,
        max_new: usize,
    ) -> Result<ExpansionResult> {
        let keys: Vec<&String> = seen_keys.iter().collect();
        let script = EXPAND_SCRIPT
            .replace("__SEEN_KEYS__", &serde_json::to_string(&keys)?)
            .replace("__MAX_NEW__", &max_new.to_string());

        let value = self.control.run_script(tab.0, &script).await?;
        settle(self.settle_ms).await;
        let raw: RawExpansion =
            serde_json::from_value(value).context("expand script returned unexpected shape")?;

        // The script caps itself, but the contract holds regardless of what
        // the page delivered.
        let mut items = raw.items;
        if items.len() > max_new {
            warn!(
                delivered = items.len(),
                cap = max_new,
                "expand script exceeded its cap, truncating"
            );
            items.truncate(max_new);
        }
        let at_cap = items.len() == max_new && !raw.reached_end;

        Ok(ExpansionResult {
            new_items: items
                .into_iter()
                .map(|c| CommentItem {
                    key: c.key,
                    author: c.author,
                    body: c.body,
                    likes: c.likes,
                    published_at: c.published_at,
                    is_reply: c.is_reply,
                })
                .collect(),
            reached_end: raw.reached_end,
            empty_state: raw.empty_state,
            header_total: raw.header_total,
            stopped_at_cap: at_cap,
        })
    }
}
