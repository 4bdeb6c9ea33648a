//! Orchestrator: executes a query's step DAG against the shared session
//! pool, model dispatcher and result cache.
//!
//! Ready steps are spawned in declaration order as soon as their
//! dependencies succeed. The plan resolves when every step is terminal, a
//! required step fails, or the deadline passes. Outstanding steps are then
//! cancelled cooperatively and, after a grace period, aborted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webquery_browser::{FetchExecutor, FetchResult, FetchSpec, SessionPool};
use webquery_cache::{Fingerprint, ResultCache};
use webquery_chat::ModelDispatcher;
use webquery_core::{Error, ErrorKind, OrchestrationConfig, Query, Result, StepFailure};

use crate::planner::QueryPlanner;
use crate::prompt::answer_prompt;
use crate::types::*;

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Receiver side of plan progress.
pub type EventSink = UnboundedSender<PlanEvent>;

fn emit(events: Option<&EventSink>, event: PlanEvent) {
    if let Some(tx) = events {
        // A dropped receiver only means nobody is listening any more.
        let _ = tx.send(event);
    }
}

fn fetch_backoff(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    DEFAULT_RETRY_BASE_DELAY
        .saturating_mul(factor)
        .min(DEFAULT_RETRY_MAX_DELAY)
}

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

/// Everything a spawned step task needs.
struct StepRunner {
    pool: SessionPool,
    fetcher: Arc<FetchExecutor>,
    dispatcher: Arc<ModelDispatcher>,
    cache: Arc<ResultCache<StepOutput>>,
    acquire_timeout: Duration,
    cache_ttl: Duration,
    retry_limit: u32,
    temperature: f64,
    max_tokens: usize,
}

struct StepOutcome {
    result: Result<StepOutput>,
    attempts: u32,
    cached: bool,
    elapsed_ms: u64,
}

impl StepOutcome {
    fn from_join(joined: std::result::Result<StepOutcome, JoinError>) -> Self {
        match joined {
            Ok(outcome) => outcome,
            Err(e) => StepOutcome {
                result: Err(if e.is_cancelled() {
                    Error::Cancelled
                } else {
                    Error::Internal(format!("step task panicked: {}", e))
                }),
                attempts: 0,
                cached: false,
                elapsed_ms: 0,
            },
        }
    }
}

impl StepRunner {
    async fn run(
        self: Arc<Self>,
        step: PlanStep,
        inputs: Vec<FetchResult>,
        cancel: CancellationToken,
        events: Option<EventSink>,
    ) -> StepOutcome {
        let start = Instant::now();
        let mut attempts = 0u32;

        let work = async {
            match &step.kind {
                StepKind::Fetch(spec) => {
                    self.fetch(step.id, spec, &cancel, events.as_ref(), &mut attempts)
                        .await
                }
                StepKind::ModelCall(model) => {
                    self.answer(model, &inputs, &cancel, &mut attempts).await
                }
            }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = work => res,
        };

        let (result, cached) = match result {
            Ok((output, cached)) => (Ok(output), cached),
            Err(e) => (Err(e), false),
        };
        StepOutcome {
            result,
            attempts,
            cached,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn fetch(
        &self,
        id: StepId,
        spec: &FetchSpec,
        cancel: &CancellationToken,
        events: Option<&EventSink>,
        attempts: &mut u32,
    ) -> Result<(StepOutput, bool)> {
        let fp = Fingerprint::new("fetch", &spec.cache_key());
        self.cache
            .get_or_compute(&fp, self.cache_ttl, move || {
                self.fetch_with_retry(id, spec, cancel, events, attempts)
            })
            .await
    }

    /// Retry retryable failures, each attempt on a freshly leased session.
    async fn fetch_with_retry(
        &self,
        id: StepId,
        spec: &FetchSpec,
        cancel: &CancellationToken,
        events: Option<&EventSink>,
        attempts: &mut u32,
    ) -> Result<StepOutput> {
        loop {
            *attempts += 1;
            match self.fetch_once(spec, cancel).await {
                Ok(result) => return Ok(StepOutput::Fetch(result)),
                Err(e) if e.is_retryable_fetch() && *attempts <= self.retry_limit => {
                    let delay = fetch_backoff(*attempts);
                    warn!(
                        "Fetch of {} failed (attempt {}): {}. Retrying in {:?}",
                        spec.url, attempts, e, delay
                    );
                    emit(
                        events,
                        PlanEvent::StepRetrying {
                            step: id,
                            attempt: *attempts + 1,
                            error: StepFailure::from(&e),
                        },
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, spec: &FetchSpec, cancel: &CancellationToken) -> Result<FetchResult> {
        let lease = self.pool.acquire(self.acquire_timeout, cancel).await?;
        let result = self.fetcher.execute(&lease, spec, cancel).await;
        lease.release(result.is_ok());
        result
    }

    async fn answer(
        &self,
        model: &ModelStep,
        inputs: &[FetchResult],
        cancel: &CancellationToken,
        attempts: &mut u32,
    ) -> Result<(StepOutput, bool)> {
        let sources: Vec<&FetchResult> = inputs.iter().collect();
        let prompt = answer_prompt(&model.instruction, &sources)
            .with_sampling(self.temperature, self.max_tokens);
        let fp = Fingerprint::new(
            "model",
            &format!("{}|{}", model.selector, prompt.render()),
        );

        let result = self
            .cache
            .get_or_compute(&fp, self.cache_ttl, || async {
                self.dispatcher
                    .dispatch(&prompt, &model.selector, cancel)
                    .await
                    .map(StepOutput::Model)
            })
            .await;

        *attempts = match &result {
            Ok((_, true)) => 0,
            Ok((StepOutput::Model(r), false)) => r.attempts,
            _ => 1,
        };
        result
    }
}

// ---------------------------------------------------------------------------
// Plan bookkeeping
// ---------------------------------------------------------------------------

struct StepRecord {
    state: StepState,
    attempts: u32,
    cached: bool,
    elapsed_ms: u64,
    error: Option<StepFailure>,
    output: Option<StepOutput>,
}

impl StepRecord {
    fn new() -> Self {
        Self {
            state: StepState::Pending,
            attempts: 0,
            cached: false,
            elapsed_ms: 0,
            error: None,
            output: None,
        }
    }
}

struct PlanRun<'a> {
    plan: &'a Plan,
    records: Vec<StepRecord>,
    events: Option<&'a EventSink>,
}

impl<'a> PlanRun<'a> {
    fn new(plan: &'a Plan, events: Option<&'a EventSink>) -> Self {
        Self {
            plan,
            records: plan.steps().iter().map(|_| StepRecord::new()).collect(),
            events,
        }
    }

    fn state(&self, id: StepId) -> StepState {
        self.records[id.0].state
    }

    /// Promote pending steps whose dependencies all succeeded and skip those
    /// with a dependency that can no longer succeed. Returns the plan failure
    /// if a required step had to be skipped.
    fn advance(&mut self) -> Option<StepFailure> {
        let mut failure = None;
        loop {
            let mut changed = false;
            for step in self.plan.steps() {
                if self.state(step.id) != StepState::Pending {
                    continue;
                }
                let blocked = step
                    .depends_on
                    .iter()
                    .find(|dep| {
                        matches!(
                            self.state(**dep),
                            StepState::Failed | StepState::Skipped | StepState::Cancelled
                        )
                    })
                    .copied();
                if let Some(dep) = blocked {
                    let cause = self.records[dep.0].error.clone();
                    let dep_name = self.plan.step(dep).map(|s| s.name.as_str()).unwrap_or("?");
                    let skipped = StepFailure::new(
                        cause.as_ref().map_or(ErrorKind::Cancelled, |c| c.kind),
                        format!(
                            "dependency '{}' did not succeed{}",
                            dep_name,
                            cause.map(|c| format!(": {}", c.message)).unwrap_or_default()
                        ),
                    );
                    debug!("Skipping step '{}': {}", step.name, skipped.message);
                    self.records[step.id.0].state = StepState::Skipped;
                    self.records[step.id.0].error = Some(skipped.clone());
                    emit(
                        self.events,
                        PlanEvent::StepSkipped {
                            step: step.id,
                            name: step.name.clone(),
                        },
                    );
                    if !step.optional && failure.is_none() {
                        failure = Some(StepFailure::new(
                            skipped.kind,
                            format!("required step '{}' skipped: {}", step.name, skipped.message),
                        ));
                    }
                    changed = true;
                } else if step
                    .depends_on
                    .iter()
                    .all(|dep| self.state(*dep) == StepState::Succeeded)
                {
                    self.records[step.id.0].state = StepState::Ready;
                    changed = true;
                }
            }
            if !changed {
                return failure;
            }
        }
    }

    /// Fetch outputs of a step's dependencies, in dependency order.
    fn inputs(&self, step: &PlanStep) -> Vec<FetchResult> {
        step.depends_on
            .iter()
            .filter_map(|dep| match &self.records[dep.0].output {
                Some(StepOutput::Fetch(result)) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    /// Record a finished step. Returns the plan failure if a required step
    /// failed.
    fn complete(&mut self, id: StepId, outcome: StepOutcome, cancelling: bool) -> Option<StepFailure> {
        let step = self.plan.step(id)?;
        let record = &mut self.records[id.0];
        record.attempts = record.attempts.max(outcome.attempts);
        record.cached = outcome.cached;
        record.elapsed_ms = outcome.elapsed_ms;

        match outcome.result {
            Ok(output) => {
                debug!(
                    "Step '{}' succeeded in {}ms{}",
                    step.name,
                    outcome.elapsed_ms,
                    if outcome.cached { " (cached)" } else { "" }
                );
                record.state = StepState::Succeeded;
                record.output = Some(output);
                emit(
                    self.events,
                    PlanEvent::StepSucceeded {
                        step: id,
                        name: step.name.clone(),
                        cached: outcome.cached,
                        elapsed_ms: outcome.elapsed_ms,
                    },
                );
                None
            }
            Err(Error::Cancelled) if cancelling => {
                record.state = StepState::Cancelled;
                record.error = Some(StepFailure::from(&Error::Cancelled));
                None
            }
            Err(e) => {
                let failure = StepFailure::from(&e);
                warn!("Step '{}' failed: {}", step.name, failure);
                record.state = if matches!(e, Error::Cancelled) {
                    StepState::Cancelled
                } else {
                    StepState::Failed
                };
                record.error = Some(failure.clone());
                emit(
                    self.events,
                    PlanEvent::StepFailed {
                        step: id,
                        name: step.name.clone(),
                        error: failure.clone(),
                    },
                );
                if step.optional || cancelling {
                    None
                } else {
                    Some(StepFailure::new(
                        failure.kind,
                        format!("required step '{}' failed: {}", step.name, failure.message),
                    ))
                }
            }
        }
    }

    fn skip_unstarted(&mut self) {
        for step in self.plan.steps() {
            let record = &mut self.records[step.id.0];
            if matches!(record.state, StepState::Pending | StepState::Ready) {
                record.state = StepState::Skipped;
                emit(
                    self.events,
                    PlanEvent::StepSkipped {
                        step: step.id,
                        name: step.name.clone(),
                    },
                );
            }
        }
    }

    fn answer(&self) -> Option<String> {
        let answers: Vec<(&PlanStep, &StepOutput)> = self
            .plan
            .answer_steps()
            .iter()
            .filter_map(|id| {
                let output = self.records[id.0].output.as_ref()?;
                Some((self.plan.step(*id)?, output))
            })
            .collect();
        match answers.as_slice() {
            [] => None,
            [(_, output)] if self.plan.answer_steps().len() == 1 => {
                Some(output.content().trim().to_string())
            }
            _ => Some(
                answers
                    .iter()
                    .map(|(step, output)| {
                        let heading = match &step.kind {
                            StepKind::ModelCall(m) => m.instruction.as_str(),
                            StepKind::Fetch(f) => f.url.as_str(),
                        };
                        format!("{}\n{}", heading, output.content().trim())
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
        }
    }

    fn reports(self) -> Vec<StepReport> {
        self.plan
            .steps()
            .iter()
            .zip(self.records)
            .map(|(step, record)| StepReport {
                id: step.id,
                name: step.name.clone(),
                kind: step.kind.label().to_string(),
                status: record.state,
                optional: step.optional,
                attempts: record.attempts,
                cached: record.cached,
                elapsed_ms: record.elapsed_ms,
                error: record.error,
                output: record.output,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    pool: SessionPool,
    fetcher: Arc<FetchExecutor>,
    dispatcher: Arc<ModelDispatcher>,
    cache: Arc<ResultCache<StepOutput>>,
    planner: QueryPlanner,
    acquire_timeout: Duration,
    cache_ttl: Duration,
    retry_limit: u32,
    reclaim_grace: Duration,
    temperature: f64,
    max_tokens: usize,
}

impl Orchestrator {
    pub fn new(
        pool: SessionPool,
        fetcher: Arc<FetchExecutor>,
        dispatcher: Arc<ModelDispatcher>,
        cache: Arc<ResultCache<StepOutput>>,
        config: &OrchestrationConfig,
    ) -> Self {
        Self {
            pool,
            fetcher,
            dispatcher,
            cache,
            planner: QueryPlanner::new(config),
            acquire_timeout: config.acquire_timeout(),
            cache_ttl: config.cache_ttl(),
            retry_limit: config.retry_limit,
            reclaim_grace: config.reclaim_grace(),
            temperature: 0.0,
            max_tokens: 1024,
        }
    }

    pub fn with_planner(mut self, planner: QueryPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Sampling parameters for every model step.
    pub fn with_sampling(mut self, temperature: f64, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn dispatcher(&self) -> &ModelDispatcher {
        &self.dispatcher
    }

    pub fn cache(&self) -> &ResultCache<StepOutput> {
        &self.cache
    }

    /// Plan and execute `query`. Only planning errors are returned as `Err`;
    /// execution failures are reported in the response.
    pub async fn run(&self, query: &Query, events: Option<&EventSink>) -> Result<QueryResponse> {
        let plan = self.planner.plan(query)?;
        Ok(self.execute(query, &plan, events).await)
    }

    fn runner(&self) -> Arc<StepRunner> {
        Arc::new(StepRunner {
            pool: self.pool.clone(),
            fetcher: self.fetcher.clone(),
            dispatcher: self.dispatcher.clone(),
            cache: self.cache.clone(),
            acquire_timeout: self.acquire_timeout,
            cache_ttl: self.cache_ttl,
            retry_limit: self.retry_limit,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        })
    }

    /// Execute a validated plan to completion, failure or deadline.
    pub async fn execute(&self, query: &Query, plan: &Plan, events: Option<&EventSink>) -> QueryResponse {
        let start = Instant::now();
        let deadline = start + plan.deadline();
        let runner = self.runner();
        let cancel = CancellationToken::new();
        let mut run = PlanRun::new(plan, events);

        info!(
            "Executing plan for query {} ({} steps, deadline {:?}, agent {}, session {})",
            plan.query_id(),
            plan.len(),
            plan.deadline(),
            query.agent_id().unwrap_or("-"),
            query.session_name().unwrap_or("-")
        );
        emit(
            events,
            PlanEvent::PlanStarted {
                query_id: plan.query_id().clone(),
                steps: plan.len(),
            },
        );

        let mut running = FuturesUnordered::new();
        let mut aborts: HashMap<StepId, AbortHandle> = HashMap::new();
        let mut failure: Option<StepFailure> = None;
        let mut timed_out = false;

        loop {
            if let Some(f) = run.advance() {
                failure = Some(f);
                break;
            }

            for step in plan.steps() {
                if run.state(step.id) != StepState::Ready {
                    continue;
                }
                run.records[step.id.0].state = StepState::Running;
                emit(
                    events,
                    PlanEvent::StepStarted {
                        step: step.id,
                        name: step.name.clone(),
                        kind: step.kind.label().to_string(),
                    },
                );
                let handle = tokio::spawn(runner.clone().run(
                    step.clone(),
                    run.inputs(step),
                    cancel.clone(),
                    events.cloned(),
                ));
                aborts.insert(step.id, handle.abort_handle());
                let id = step.id;
                running.push(async move { (id, handle.await) });
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Plan for query {} hit its deadline", plan.query_id());
                    timed_out = true;
                    break;
                }
                Some((id, joined)) = running.next() => {
                    aborts.remove(&id);
                    if let Some(f) = run.complete(id, StepOutcome::from_join(joined), false) {
                        failure = Some(f);
                        break;
                    }
                }
            }
        }

        if !running.is_empty() {
            cancel.cancel();
            let grace = tokio::time::sleep(self.reclaim_grace);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    _ = &mut grace => break,
                    next = running.next() => match next {
                        Some((id, joined)) => {
                            aborts.remove(&id);
                            run.complete(id, StepOutcome::from_join(joined), true);
                        }
                        None => break,
                    },
                }
            }
            if !running.is_empty() {
                warn!(
                    "Aborting {} step(s) that did not stop within {:?}",
                    running.len(),
                    self.reclaim_grace
                );
                for handle in aborts.values() {
                    handle.abort();
                }
                while let Some((id, joined)) = running.next().await {
                    run.complete(id, StepOutcome::from_join(joined), true);
                }
            }
        }
        run.skip_unstarted();

        let answers_ok = plan
            .answer_steps()
            .iter()
            .filter(|id| run.state(**id) == StepState::Succeeded)
            .count();
        let all_ok = plan
            .steps()
            .iter()
            .all(|s| run.state(s.id) == StepState::Succeeded);

        let (status, error) = if timed_out {
            (
                PlanStatus::TimedOut,
                Some(StepFailure::from(&Error::PlanTimeout)),
            )
        } else if let Some(f) = failure {
            (PlanStatus::Failed, Some(f))
        } else if answers_ok == 0 {
            let cause = plan
                .answer_steps()
                .iter()
                .find_map(|id| run.records[id.0].error.clone());
            (
                PlanStatus::Failed,
                Some(StepFailure::new(
                    cause.as_ref().map_or(ErrorKind::Internal, |c| c.kind),
                    format!(
                        "no answer step succeeded{}",
                        cause.map(|c| format!(": {}", c.message)).unwrap_or_default()
                    ),
                )),
            )
        } else if all_ok {
            (PlanStatus::Completed, None)
        } else {
            (PlanStatus::PartiallyCompleted, None)
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            "Plan for query {} finished: {:?} in {}ms",
            plan.query_id(),
            status,
            elapsed_ms
        );
        emit(events, PlanEvent::PlanFinished { status, elapsed_ms });

        let answer = run.answer();
        QueryResponse {
            query_id: plan.query_id().clone(),
            query: query.text().to_string(),
            agent_id: query.agent_id().map(str::to_string),
            session_name: query.session_name().map(str::to_string),
            status,
            success: matches!(status, PlanStatus::Completed | PlanStatus::PartiallyCompleted),
            answer,
            steps: run.reports(),
            error,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_backoff() {
        assert_eq!(fetch_backoff(1), Duration::from_millis(200));
        assert_eq!(fetch_backoff(2), Duration::from_millis(400));
        assert_eq!(fetch_backoff(12), Duration::from_secs(5));
    }
}
