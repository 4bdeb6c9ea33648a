//! HTTP client for the browser infrastructure service.
//!
//! The infrastructure layer owns the actual Chromium contexts and exposes
//! them over a small REST surface (`/sessions`, `/sessions/{id}/navigate`,
//! `/sessions/{id}/execute`, `/sessions/{id}/screenshot`, ...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use webquery_core::{Error, Result};

use crate::capability::BrowserCapability;
use crate::types::{BrowserHandle, ExtractMode, Navigation};

const VISIBLE_TEXT_SCRIPT: &str = "document.body ? document.body.innerText : ''";

#[derive(Debug, Deserialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct NavigateResponse {
    page_id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageContentResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ScreenshotResponse {
    screenshot: String,
    format: String,
    size: u64,
}

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    agent_id: &'a str,
}

/// `BrowserCapability` backed by the infrastructure REST API.
pub struct HttpBrowserClient {
    client: Client,
    base_url: String,
    agent_id: String,
}

impl HttpBrowserClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id: "webquery".into(),
        })
    }

    /// Agent id reported when opening sessions.
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute_script(&self, handle: &BrowserHandle, page_id: &str, script: &str) -> Result<String> {
        let resp = self
            .client
            .post(self.url(&format!("/sessions/{}/execute", handle.remote_id)))
            .json(&json!({ "page_id": page_id, "script": script }))
            .send()
            .await
            .map_err(map_transport)?;
        let body: ExecuteResponse = check(resp).await?.json().await.map_err(map_transport)?;
        Ok(body.result.unwrap_or_default())
    }
}

#[async_trait]
impl BrowserCapability for HttpBrowserClient {
    async fn open_session(&self) -> Result<BrowserHandle> {
        let resp = self
            .client
            .post(self.url("/sessions"))
            .json(&CreateSessionBody {
                agent_id: &self.agent_id,
            })
            .send()
            .await
            .map_err(map_transport)?;
        let created: SessionCreated = check(resp).await?.json().await.map_err(map_transport)?;
        debug!("Opened browser session {}", created.session_id);
        Ok(BrowserHandle {
            remote_id: created.session_id,
        })
    }

    async fn navigate(&self, handle: &BrowserHandle, url: &str) -> Result<Navigation> {
        let resp = self
            .client
            .post(self.url(&format!("/sessions/{}/navigate", handle.remote_id)))
            .json(&json!({ "url": url }))
            .send()
            .await
            .map_err(map_transport)?;
        let nav: NavigateResponse = check(resp).await?.json().await.map_err(map_transport)?;
        Ok(Navigation {
            page_id: nav.page_id,
            url: nav.url,
        })
    }

    async fn extract(&self, handle: &BrowserHandle, page_id: &str, mode: &ExtractMode) -> Result<String> {
        match mode {
            ExtractMode::Html => {
                let resp = self
                    .client
                    .get(self.url(&format!(
                        "/sessions/{}/pages/{}/content",
                        handle.remote_id, page_id
                    )))
                    .send()
                    .await
                    .map_err(map_transport)?;
                let page: PageContentResponse = check(resp).await?.json().await.map_err(map_transport)?;
                Ok(page.content)
            }
            ExtractMode::Text => self.execute_script(handle, page_id, VISIBLE_TEXT_SCRIPT).await,
            ExtractMode::Script { script } => self.execute_script(handle, page_id, script).await,
            ExtractMode::Search { keyword } => {
                let text = self.execute_script(handle, page_id, VISIBLE_TEXT_SCRIPT).await?;
                Ok(matching_lines(&text, keyword))
            }
            ExtractMode::Screenshot => {
                let resp = self
                    .client
                    .post(self.url(&format!("/sessions/{}/screenshot", handle.remote_id)))
                    .json(&json!({ "page_id": page_id }))
                    .send()
                    .await
                    .map_err(map_transport)?;
                let shot: ScreenshotResponse = check(resp).await?.json().await.map_err(map_transport)?;
                Ok(screenshot_summary(&shot))
            }
        }
    }

    async fn close_page(&self, handle: &BrowserHandle, page_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/sessions/{}/pages/{}", handle.remote_id, page_id)))
            .send()
            .await
            .map_err(map_transport)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp).await.map(|_| ())
    }

    async fn close(&self, handle: &BrowserHandle) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/sessions/{}", handle.remote_id)))
            .send()
            .await
            .map_err(map_transport)?;
        // Already gone is as good as closed.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp).await.map(|_| ())
    }

    async fn ping(&self) -> bool {
        match self.client.get(self.url("/sessions")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Lines of `text` containing `keyword`, case-insensitively.
pub fn matching_lines(text: &str, keyword: &str) -> String {
    let needle = keyword.trim().to_lowercase();
    if needle.is_empty() {
        return String::new();
    }
    text.lines()
        .map(str::trim)
        .filter(|line| line.to_lowercase().contains(&needle))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Describe a capture without its image data.
fn screenshot_summary(shot: &ScreenshotResponse) -> String {
    format!(
        "Screenshot captured: format {}, {} bytes ({} base64 chars)",
        shot.format,
        shot.size,
        shot.screenshot.len()
    )
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::AutomationFailure(format!(
        "infrastructure returned {}: {}",
        status,
        body.chars().take(300).collect::<String>()
    )))
}

fn map_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("browser infrastructure request: {}", e))
    } else {
        Error::AutomationFailure(format!("browser infrastructure request failed: {}", e))
    }
}
