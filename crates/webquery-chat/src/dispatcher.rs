//! Model dispatcher: process-wide concurrency cap, bounded retry, and
//! response normalization in front of the model backends.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webquery_core::{Error, OrchestrationConfig, Result};

use crate::backend::ModelBackend;
use crate::types::{BackendSelector, DispatcherStats, ModelResult, Prompt};

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub concurrency_limit: usize,
    /// Bounds both the slot wait and each backend call.
    pub per_call_timeout: Duration,
    /// Retries after the first attempt, transient failures only.
    pub retry_limit: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl DispatcherConfig {
    pub fn from_orchestration(config: &OrchestrationConfig) -> Self {
        Self {
            concurrency_limit: config.model_concurrency_limit,
            per_call_timeout: config.per_call_timeout(),
            retry_limit: config.model_retry_limit,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

#[derive(Default)]
struct Counters {
    calls: u64,
    retries: u64,
    failures: u64,
}

pub struct ModelDispatcher {
    backends: Vec<Arc<dyn ModelBackend>>,
    permits: Arc<Semaphore>,
    config: DispatcherConfig,
    counters: Mutex<Counters>,
}

impl ModelDispatcher {
    pub fn new(backends: Vec<Arc<dyn ModelBackend>>, config: DispatcherConfig) -> Self {
        let limit = config.concurrency_limit.max(1);
        Self {
            backends,
            permits: Arc::new(Semaphore::new(limit)),
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn has_backends(&self) -> bool {
        !self.backends.is_empty()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    fn select(&self, selector: &BackendSelector) -> Result<Arc<dyn ModelBackend>> {
        let found = match selector {
            BackendSelector::Auto => self.backends.first(),
            BackendSelector::Named(name) => self
                .backends
                .iter()
                .find(|b| b.name().eq_ignore_ascii_case(name)),
        };
        found.cloned().ok_or_else(|| match selector {
            BackendSelector::Auto => Error::ModelPermanentFailure("No model backend configured".into()),
            BackendSelector::Named(name) => {
                Error::ModelPermanentFailure(format!("Unknown model backend '{}'", name))
            }
        })
    }

    /// Run `prompt` on the selected backend, retrying transient failures
    /// with exponential backoff. The concurrency slot is held only for the
    /// duration of each attempt.
    pub async fn dispatch(
        &self,
        prompt: &Prompt,
        selector: &BackendSelector,
        cancel: &CancellationToken,
    ) -> Result<ModelResult> {
        let backend = self.select(selector)?;
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.counters.lock().calls += 1;

            match self.attempt(backend.as_ref(), prompt, cancel).await {
                Ok(completion) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    debug!(
                        "Model call on {} succeeded after {} attempt(s) in {}ms",
                        backend.name(),
                        attempt,
                        elapsed_ms
                    );
                    return Ok(ModelResult {
                        backend: backend.name().to_string(),
                        model: backend.model().to_string(),
                        content: completion.content,
                        tokens_used: completion.tokens_used,
                        attempts: attempt,
                        elapsed_ms,
                    });
                }
                Err(e) if e.is_transient_model() && attempt <= self.config.retry_limit => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "Model call on {} failed (attempt {}): {}. Retrying in {:?}",
                        backend.name(),
                        attempt,
                        e,
                        delay
                    );
                    self.counters.lock().retries += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    if !matches!(e, Error::Cancelled) {
                        self.counters.lock().failures += 1;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(
        &self,
        backend: &dyn ModelBackend,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<crate::types::Completion> {
        let timeout = self.config.per_call_timeout;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, self.permits.clone().acquire_owned()) => match res {
                Err(_) => return Err(Error::Timeout(format!("waiting for a model slot exceeded {:?}", timeout))),
                Ok(Err(_)) => return Err(Error::Internal("model dispatcher closed".into())),
                Ok(Ok(permit)) => permit,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, backend.complete(prompt)) => match res {
                Err(_) => Err(Error::Timeout(format!("{} call exceeded {:?}", backend.name(), timeout))),
                Ok(out) => out,
            },
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let counters = self.counters.lock();
        DispatcherStats {
            backends: self.backend_names(),
            concurrency_limit: self.config.concurrency_limit.max(1),
            available_slots: self.permits.available_permits(),
            calls: counters.calls,
            retries: counters.retries,
            failures: counters.failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::types::Completion;

    /// Backend replaying scripted outcomes, tracking peak concurrency.
    struct FakeBackend {
        name: String,
        script: Mutex<VecDeque<Result<String>>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeBackend {
        fn new(name: &str, script: Vec<Result<String>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                script: Mutex::new(script.into()),
                delay,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for FakeBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn model(&self) -> &str {
            "fake-1"
        }

        async fn complete(&self, _prompt: &Prompt) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| Ok("ok".into())).map(|content| Completion {
                content,
                tokens_used: Some(3),
            })
        }
    }

    fn config(limit: usize, retries: u32) -> DispatcherConfig {
        DispatcherConfig {
            concurrency_limit: limit,
            per_call_timeout: Duration::from_secs(5),
            retry_limit: retries,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let cfg = config(1, 10);
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(2), Duration::from_millis(400));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
        assert_eq!(cfg.backoff(9), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let backend = FakeBackend::new(
            "openai",
            vec![
                Err(Error::ModelTransientFailure("429".into())),
                Err(Error::ModelTransientFailure("503".into())),
                Ok("answer".into()),
            ],
            Duration::from_millis(10),
        );
        let dispatcher = ModelDispatcher::new(vec![backend.clone() as Arc<dyn ModelBackend>], config(2, 2));

        let result = dispatcher
            .dispatch(&Prompt::new("s", "u"), &BackendSelector::Auto, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content, "answer");
        assert_eq!(result.attempts, 3);
        assert_eq!(result.backend, "openai");
        assert_eq!(dispatcher.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_limit_is_respected() {
        let backend = FakeBackend::new(
            "openai",
            vec![
                Err(Error::ModelTransientFailure("a".into())),
                Err(Error::ModelTransientFailure("b".into())),
                Err(Error::ModelTransientFailure("c".into())),
                Ok("too late".into()),
            ],
            Duration::ZERO,
        );
        let dispatcher = ModelDispatcher::new(vec![backend.clone() as Arc<dyn ModelBackend>], config(2, 2));

        let err = dispatcher
            .dispatch(&Prompt::new("s", "u"), &BackendSelector::Auto, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelTransientFailure(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let backend = FakeBackend::new(
            "anthropic",
            vec![Err(Error::ModelPermanentFailure("401".into()))],
            Duration::ZERO,
        );
        let dispatcher = ModelDispatcher::new(vec![backend.clone() as Arc<dyn ModelBackend>], config(2, 2));

        let err = dispatcher
            .dispatch(&Prompt::new("s", "u"), &BackendSelector::Auto, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelPermanentFailure(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_backend_is_permanent() {
        let backend = FakeBackend::new("ollama", vec![], Duration::ZERO);
        let dispatcher = ModelDispatcher::new(vec![backend.clone() as Arc<dyn ModelBackend>], config(1, 2));

        let err = dispatcher
            .dispatch(
                &Prompt::new("s", "u"),
                &BackendSelector::Named("groq".into()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelPermanentFailure(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_selector_picks_backend() {
        let first = FakeBackend::new("ollama", vec![], Duration::ZERO);
        let second = FakeBackend::new("groq", vec![Ok("from groq".into())], Duration::ZERO);
        let dispatcher = ModelDispatcher::new(vec![first.clone() as Arc<dyn ModelBackend>, second.clone()], config(1, 0));

        let result = dispatcher
            .dispatch(&Prompt::new("s", "u"), &BackendSelector::from("Groq"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content, "from groq");
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let backend = FakeBackend::new("openai", vec![], Duration::from_millis(50));
        let dispatcher = Arc::new(ModelDispatcher::new(vec![backend.clone() as Arc<dyn ModelBackend>], config(2, 0)));

        let mut handles = Vec::new();
        for i in 0..8 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher
                    .dispatch(
                        &Prompt::new("s", format!("q{}", i)),
                        &BackendSelector::Auto,
                        &CancellationToken::new(),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 8);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.stats().available_slots, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_and_frees_slot() {
        let backend = FakeBackend::new("openai", vec![], Duration::from_secs(60));
        let dispatcher = ModelDispatcher::new(vec![backend.clone() as Arc<dyn ModelBackend>], config(1, 0));

        let err = dispatcher
            .dispatch(&Prompt::new("s", "u"), &BackendSelector::Auto, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(dispatcher.stats().available_slots, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_dispatch() {
        let backend = FakeBackend::new("openai", vec![], Duration::from_secs(60));
        let dispatcher = Arc::new(ModelDispatcher::new(vec![backend.clone() as Arc<dyn ModelBackend>], config(1, 2)));
        let cancel = CancellationToken::new();

        let task = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&Prompt::new("s", "u"), &BackendSelector::Auto, &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(dispatcher.stats().available_slots, 1);
    }
}
