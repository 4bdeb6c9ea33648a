//! Fetch executor: one navigate + extract against a leased session.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webquery_core::{Error, Result};

use crate::capability::BrowserCapability;
use crate::pool::SessionLease;
use crate::types::{FetchResult, FetchSpec};

pub struct FetchExecutor {
    capability: Arc<dyn BrowserCapability>,
    per_call_timeout: Duration,
    max_content_chars: usize,
}

impl FetchExecutor {
    pub fn new(
        capability: Arc<dyn BrowserCapability>,
        per_call_timeout: Duration,
        max_content_chars: usize,
    ) -> Self {
        Self {
            capability,
            per_call_timeout,
            max_content_chars,
        }
    }

    /// Run `spec` on the leased session. The lease itself is untouched; the
    /// caller decides its health from the returned error.
    ///
    /// The page opened by the navigation is closed once extraction finishes,
    /// whether or not it succeeded. A fetch cut short by the timeout or by
    /// cancellation leaves its page to the session teardown that follows an
    /// unhealthy release.
    pub async fn execute(
        &self,
        lease: &SessionLease,
        spec: &FetchSpec,
        cancel: &CancellationToken,
    ) -> Result<FetchResult> {
        let start = Instant::now();
        let handle = lease.handle();

        let call = async {
            let nav = self.capability.navigate(handle, &spec.url).await?;
            let extracted = self
                .capability
                .extract(handle, &nav.page_id, &spec.extract)
                .await;
            self.close_page(lease, &nav.page_id).await;
            extracted.map(|content| (nav, content))
        };

        let (nav, content) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = tokio::time::timeout(self.per_call_timeout, call) => match res {
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "fetching {} exceeded {:?}",
                        spec.url, self.per_call_timeout
                    )))
                }
                Ok(Err(Error::Timeout(msg))) => return Err(Error::Timeout(msg)),
                Ok(Err(Error::Cancelled)) => return Err(Error::Cancelled),
                Ok(Err(Error::AutomationFailure(msg))) => return Err(Error::AutomationFailure(msg)),
                Ok(Err(other)) => return Err(Error::AutomationFailure(other.to_string())),
                Ok(Ok(out)) => out,
            },
        };

        let (content, truncated) = truncate_chars(content, self.max_content_chars);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Fetched {} via session {} ({} chars, {}ms)",
            nav.url,
            lease.session_id(),
            content.chars().count(),
            elapsed_ms
        );

        Ok(FetchResult {
            url: nav.url,
            page_id: nav.page_id,
            content,
            truncated,
            elapsed_ms,
        })
    }

    async fn close_page(&self, lease: &SessionLease, page_id: &str) {
        if let Err(e) = self.capability.close_page(lease.handle(), page_id).await {
            warn!(
                "Failed to close page {} on session {}: {}",
                page_id,
                lease.session_id(),
                e
            );
        }
    }
}

fn truncate_chars(text: String, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (text[..byte_idx].to_string(), true),
        None => (text, false),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::pool::{SessionPool, SessionPoolConfig};
    use crate::types::*;

    struct ScriptedBrowser {
        hang: bool,
        crash: AtomicBool,
        extract_fails: AtomicBool,
        close_page_fails: AtomicBool,
        open_pages: AtomicUsize,
        pages_opened: AtomicUsize,
    }

    #[async_trait]
    impl BrowserCapability for ScriptedBrowser {
        async fn open_session(&self) -> Result<BrowserHandle> {
            Ok(BrowserHandle {
                remote_id: "s1".into(),
            })
        }

        async fn navigate(&self, _handle: &BrowserHandle, url: &str) -> Result<Navigation> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.crash.load(Ordering::SeqCst) {
                return Err(Error::AutomationFailure("target closed".into()));
            }
            let n = self.pages_opened.fetch_add(1, Ordering::SeqCst) + 1;
            self.open_pages.fetch_add(1, Ordering::SeqCst);
            Ok(Navigation {
                page_id: format!("page-{}", n),
                url: format!("{}/final", url),
            })
        }

        async fn extract(&self, _handle: &BrowserHandle, _page_id: &str, mode: &ExtractMode) -> Result<String> {
            if self.extract_fails.load(Ordering::SeqCst) {
                return Err(Error::AutomationFailure("execution context was destroyed".into()));
            }
            Ok(format!("content via {}", mode.label()))
        }

        async fn close_page(&self, _handle: &BrowserHandle, _page_id: &str) -> Result<()> {
            if self.close_page_fails.load(Ordering::SeqCst) {
                return Err(Error::AutomationFailure("page already detached".into()));
            }
            self.open_pages.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self, _handle: &BrowserHandle) -> Result<()> {
            Ok(())
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    async fn setup(hang: bool, max_chars: usize) -> (FetchExecutor, SessionPool, Arc<ScriptedBrowser>) {
        let browser = Arc::new(ScriptedBrowser {
            hang,
            crash: AtomicBool::new(false),
            extract_fails: AtomicBool::new(false),
            close_page_fails: AtomicBool::new(false),
            open_pages: AtomicUsize::new(0),
            pages_opened: AtomicUsize::new(0),
        });
        let pool = SessionPool::new(
            browser.clone(),
            SessionPoolConfig {
                capacity: 1,
                idle_ttl: Duration::from_secs(60),
                open_timeout: Duration::from_secs(1),
            },
        );
        let executor = FetchExecutor::new(browser.clone(), Duration::from_secs(2), max_chars);
        (executor, pool, browser)
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_normalizes_result() {
        let (executor, pool, browser) = setup(false, 1000).await;
        let cancel = CancellationToken::new();
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let result = executor
            .execute(&lease, &FetchSpec::text("https://example.com"), &cancel)
            .await
            .unwrap();
        assert_eq!(result.url, "https://example.com/final");
        assert_eq!(result.page_id, "page-1");
        assert_eq!(browser.open_pages.load(Ordering::SeqCst), 0);
        assert_eq!(result.content, "content via text");
        assert!(!result.truncated);
        lease.release(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_truncates_content() {
        let (executor, pool, _browser) = setup(false, 7).await;
        let cancel = CancellationToken::new();
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let result = executor
            .execute(&lease, &FetchSpec::text("https://example.com"), &cancel)
            .await
            .unwrap();
        assert_eq!(result.content, "content");
        assert!(result.truncated);
        lease.release(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let (executor, pool, _browser) = setup(true, 1000).await;
        let cancel = CancellationToken::new();
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let err = executor
            .execute(&lease, &FetchSpec::text("https://slow.example"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        lease.release(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_reports_automation_failure() {
        let (executor, pool, browser) = setup(false, 1000).await;
        browser.crash.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let err = executor
            .execute(&lease, &FetchSpec::text("https://example.com"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AutomationFailure(_)));
        lease.release(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_observes_cancellation() {
        let (executor, pool, _browser) = setup(true, 1000).await;
        let cancel = CancellationToken::new();
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        cancel.cancel();

        let err = executor
            .execute(&lease, &FetchSpec::text("https://example.com"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        lease.release(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_are_closed_after_each_fetch() {
        let (executor, pool, browser) = setup(false, 1000).await;
        let cancel = CancellationToken::new();
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        for i in 0..20 {
            let spec = FetchSpec::text(format!("https://example.com/{}", i));
            executor.execute(&lease, &spec, &cancel).await.unwrap();
            assert_eq!(browser.open_pages.load(Ordering::SeqCst), 0);
        }
        assert_eq!(browser.pages_opened.load(Ordering::SeqCst), 20);
        lease.release(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_is_closed_when_extraction_fails() {
        let (executor, pool, browser) = setup(false, 1000).await;
        browser.extract_fails.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let err = executor
            .execute(&lease, &FetchSpec::text("https://example.com"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AutomationFailure(ref msg) if msg.contains("context was destroyed")));
        assert_eq!(browser.pages_opened.load(Ordering::SeqCst), 1);
        assert_eq!(browser.open_pages.load(Ordering::SeqCst), 0);
        lease.release(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_page_close_does_not_fail_the_fetch() {
        let (executor, pool, browser) = setup(false, 1000).await;
        browser.close_page_fails.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let result = executor
            .execute(&lease, &FetchSpec::text("https://example.com"), &cancel)
            .await
            .unwrap();
        assert_eq!(result.content, "content via text");
        lease.release(true);
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        let (out, truncated) = truncate_chars("héllo wörld".to_string(), 4);
        assert_eq!(out, "héll");
        assert!(truncated);
        let (out, truncated) = truncate_chars("abc".to_string(), 10);
        assert_eq!(out, "abc");
        assert!(!truncated);
    }
}
