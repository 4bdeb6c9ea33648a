//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{info, warn};
use webquery_browser::{
    BrowserCapability, FetchExecutor, HttpBrowserClient, SessionPool, SessionPoolConfig,
};
use webquery_cache::ResultCache;
use webquery_chat::{DispatcherConfig, LLMConfig, ModelBackend, ModelDispatcher};
use webquery_core::{Result, WebQueryConfig};
use webquery_runtime::Orchestrator;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: WebQueryConfig,
    pub browser: Arc<dyn BrowserCapability>,
    pub llm_config: RwLock<LLMConfig>,
    pub orchestrator: Orchestrator,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the production browser client and the model backends named by
    /// `llm-config.json` / the environment.
    pub fn new(config: WebQueryConfig) -> Result<Self> {
        let browser: Arc<dyn BrowserCapability> = Arc::new(HttpBrowserClient::new(
            &config.infrastructure_url,
            config.orchestration.per_call_timeout(),
        )?);

        let llm_config = LLMConfig::load(&config.llm_config_file());
        let backends = llm_config.build_backends(config.orchestration.per_call_timeout())?;
        if let Some((provider, model)) = llm_config.resolve_provider() {
            info!("Preferred model backend: {} ({})", provider, model);
        } else {
            warn!("No model backend resolved from configuration");
        }

        Ok(Self::from_parts(config, browser, backends, llm_config))
    }

    /// Assemble state around explicit capabilities.
    pub fn from_parts(
        config: WebQueryConfig,
        browser: Arc<dyn BrowserCapability>,
        backends: Vec<Arc<dyn ModelBackend>>,
        llm_config: LLMConfig,
    ) -> Self {
        let orch = &config.orchestration;
        let pool = SessionPool::new(
            browser.clone(),
            SessionPoolConfig {
                capacity: orch.session_pool_size,
                idle_ttl: orch.session_idle_ttl(),
                open_timeout: orch.acquire_timeout(),
            },
        );
        let fetcher = Arc::new(FetchExecutor::new(
            browser.clone(),
            orch.per_call_timeout(),
            orch.max_content_chars,
        ));
        let dispatcher = Arc::new(ModelDispatcher::new(
            backends,
            DispatcherConfig::from_orchestration(orch),
        ));
        let cache = Arc::new(ResultCache::new(orch.cache_max_entries));
        let orchestrator = Orchestrator::new(pool, fetcher, dispatcher, cache, orch)
            .with_sampling(llm_config.temperature, llm_config.max_tokens);

        Self {
            config,
            browser,
            llm_config: RwLock::new(llm_config),
            orchestrator,
            started_at: Instant::now(),
        }
    }

    pub fn pool(&self) -> &SessionPool {
        self.orchestrator.pool()
    }
}
