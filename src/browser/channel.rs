//! Browser-control channel: synchronous request/response calls against the
//! remote session service.
//!
//! The service owns exactly one browser session; tabs are addressed by a
//! volatile numeric index that is renumbered by unrelated open/close
//! operations. Nothing in this module caches indices; callers go through
//! [`super::tabs::TabRegistry`] which re-resolves before every action.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::error::{ChannelError, Result};

/// Snapshot of one open tab as reported by `list_tabs`. The `index` is only
/// valid until the next open/close on the session.
#[derive(Debug, Clone, Deserialize)]
pub struct TabInfo {
    pub index: usize,
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// The remote browser-control contract. Any call may fail or time out and is
/// surfaced as a [`ChannelError`], never silently retried here.
#[async_trait]
pub trait BrowserControl: Send + Sync {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>>;
    /// Opens a new tab showing `url`, returning its current index.
    async fn open_tab(&self, url: &str) -> Result<usize>;
    async fn switch_tab(&self, index: usize) -> Result<()>;
    async fn close_tab(&self, index: usize) -> Result<()>;
    async fn navigate(&self, index: usize, url: &str) -> Result<()>;
    async fn current_url(&self, index: usize) -> Result<String>;
    /// Evaluates a script in the tab and returns its JSON result.
    async fn run_script(&self, index: usize, script: &str) -> Result<serde_json::Value>;
    /// Captures a PNG screenshot of the tab.
    async fn screenshot(&self, index: usize) -> Result<Vec<u8>>;
}

// ── HTTP implementation ──────────────────────────────────────────────────────

/// HTTP client for the session service.
///
/// Endpoints live under `{base}/sessions/{session_id}`; the bearer token is
/// attached when configured. One reqwest client, per-call timeout.
pub struct HttpControlChannel {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct TabListBody {
    tabs: Vec<TabInfo>,
}

#[derive(Deserialize)]
struct TabIndexBody {
    index: usize,
}

#[derive(Deserialize)]
struct TabUrlBody {
    url: String,
}

#[derive(Deserialize)]
struct EvaluateBody {
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct ScreenshotBody {
    /// Base64-encoded PNG.
    data: String,
}

impl HttpControlChannel {
    pub fn new(
        base_url: &str,
        session_id: &str,
        token: Option<&str>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(ChannelError::from)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
            token: token.map(String::from),
        })
    }

    fn endpoint(&self, tail: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, self.session_id, tail)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) if !t.is_empty() => req.bearer_auth(t),
            _ => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, tail: &str) -> Result<T> {
        let resp = self
            .authorize(self.client.get(self.endpoint(tail)))
            .send()
            .await?;
        Self::check(resp)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ChannelError::Decode(e.to_string()))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        tail: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .authorize(self.client.post(self.endpoint(tail)))
            .json(&body)
            .send()
            .await?;
        Self::check(resp)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ChannelError::Decode(e.to_string()))
    }

    async fn post_unit(&self, tail: &str, body: serde_json::Value) -> Result<()> {
        let resp = self
            .authorize(self.client.post(self.endpoint(tail)))
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }
}

#[async_trait]
impl BrowserControl for HttpControlChannel {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        let body: TabListBody = self.get_json("tabs").await?;
        Ok(body.tabs)
    }

    async fn open_tab(&self, url: &str) -> Result<usize> {
        debug!(url, "control: open tab");
        let body: TabIndexBody = self
            .post_json("tabs", serde_json::json!({ "url": url }))
            .await?;
        Ok(body.index)
    }

    async fn switch_tab(&self, index: usize) -> Result<()> {
        self.post_unit(&format!("tabs/{index}/activate"), serde_json::json!({}))
            .await
    }

    async fn close_tab(&self, index: usize) -> Result<()> {
        debug!(index, "control: close tab");
        let resp = self
            .authorize(self.client.delete(self.endpoint(&format!("tabs/{index}"))))
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn navigate(&self, index: usize, url: &str) -> Result<()> {
        debug!(index, url, "control: navigate");
        self.post_unit(
            &format!("tabs/{index}/navigate"),
            serde_json::json!({ "url": url }),
        )
        .await
    }

    async fn current_url(&self, index: usize) -> Result<String> {
        let body: TabUrlBody = self.get_json(&format!("tabs/{index}/url")).await?;
        Ok(body.url)
    }

    async fn run_script(&self, index: usize, script: &str) -> Result<serde_json::Value> {
        let body: EvaluateBody = self
            .post_json(
                &format!("tabs/{index}/evaluate"),
                serde_json::json!({ "script": script }),
            )
            .await?;
        Ok(body.value)
    }

    async fn screenshot(&self, index: usize) -> Result<Vec<u8>> {
        let body: ScreenshotBody = self.get_json(&format!("tabs/{index}/screenshot")).await?;
        base64::engine::general_purpose::STANDARD
            .decode(body.data.as_bytes())
            .map_err(|e| ChannelError::Decode(format!("screenshot base64: {e}")))
    }
}
