//! Browser automation capability consumed by the pool and the fetch executor.
//!
//! Implementations talk to whatever drives the actual browser; the core only
//! depends on this trait.

use async_trait::async_trait;
use webquery_core::Result;

use crate::types::{BrowserHandle, ExtractMode, Navigation};

#[async_trait]
pub trait BrowserCapability: Send + Sync {
    /// Open a fresh automation context.
    async fn open_session(&self) -> Result<BrowserHandle>;

    /// Load `url` in the session and return the resulting page.
    async fn navigate(&self, handle: &BrowserHandle, url: &str) -> Result<Navigation>;

    /// Pull content out of a loaded page.
    async fn extract(
        &self,
        handle: &BrowserHandle,
        page_id: &str,
        mode: &ExtractMode,
    ) -> Result<String>;

    /// Release a page opened by [`navigate`](Self::navigate). The session
    /// stays open.
    async fn close_page(&self, handle: &BrowserHandle, page_id: &str) -> Result<()>;

    /// Tear the context down.
    async fn close(&self, handle: &BrowserHandle) -> Result<()>;

    /// Whether the capability is reachable.
    async fn ping(&self) -> bool;
}
