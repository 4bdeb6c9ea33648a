//! Plan graph, step state and query outcome types.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use webquery_browser::{FetchResult, FetchSpec};
use webquery_chat::{BackendSelector, ModelResult};
use webquery_core::{Error, QueryId, Result, StepFailure};

// ---------------------------------------------------------------------------
// Plan graph
// ---------------------------------------------------------------------------

/// Index of a step in its plan's step vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub usize);

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Model call parameters: the question to answer from the step's inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStep {
    pub instruction: String,
    #[serde(default)]
    pub selector: BackendSelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    Fetch(FetchSpec),
    ModelCall(ModelStep),
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::ModelCall(_) => "model-call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(rename = "dependsOn")]
    pub depends_on: Vec<StepId>,
    /// Failure of an optional step does not fail the plan.
    pub optional: bool,
}

/// Step DAG for one query.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    #[serde(rename = "queryId")]
    query_id: QueryId,
    query: String,
    steps: Vec<PlanStep>,
    #[serde(rename = "answerSteps")]
    answer_steps: Vec<StepId>,
    #[serde(rename = "deadlineMs", serialize_with = "serialize_millis")]
    deadline: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl Plan {
    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> Option<&PlanStep> {
        self.steps.get(id.0)
    }

    /// Steps whose outputs compose the final answer.
    pub fn answer_steps(&self) -> &[StepId] {
        &self.answer_steps
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check ids, dependency references and acyclicity.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::InvalidPlan("plan has no steps".into()));
        }
        if self.answer_steps.is_empty() {
            return Err(Error::InvalidPlan("plan has no answer step".into()));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            if step.id.0 != idx {
                return Err(Error::InvalidPlan(format!(
                    "step '{}' has id {} at position {}",
                    step.name, step.id, idx
                )));
            }
            for dep in &step.depends_on {
                if dep.0 >= self.steps.len() {
                    return Err(Error::InvalidPlan(format!(
                        "step '{}' depends on unknown step {}",
                        step.name, dep
                    )));
                }
            }
        }
        if let Some(id) = self.answer_steps.iter().find(|id| id.0 >= self.steps.len()) {
            return Err(Error::InvalidPlan(format!("unknown answer step {}", id)));
        }

        // Kahn's algorithm: every step must become reachable from the roots.
        let n = self.steps.len();
        let mut indegree: Vec<usize> = self.steps.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents[dep.0].push(step.id.0);
            }
        }
        let mut queue: VecDeque<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        if visited != n {
            return Err(Error::InvalidPlan("step graph contains a cycle".into()));
        }
        Ok(())
    }
}

/// Incremental plan construction. Ids are assigned in insertion order.
pub struct PlanBuilder {
    query_id: QueryId,
    query: String,
    steps: Vec<PlanStep>,
    answer_steps: Vec<StepId>,
    deadline: Duration,
}

impl PlanBuilder {
    pub fn new(query_id: QueryId, query: impl Into<String>, deadline: Duration) -> Self {
        Self {
            query_id,
            query: query.into(),
            steps: Vec::new(),
            answer_steps: Vec::new(),
            deadline,
        }
    }

    pub fn add_step(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        depends_on: Vec<StepId>,
        optional: bool,
    ) -> StepId {
        let id = StepId(self.steps.len());
        self.steps.push(PlanStep {
            id,
            name: name.into(),
            kind,
            depends_on,
            optional,
        });
        id
    }

    pub fn add_fetch(&mut self, name: impl Into<String>, spec: FetchSpec, optional: bool) -> StepId {
        self.add_step(name, StepKind::Fetch(spec), Vec::new(), optional)
    }

    pub fn add_model(
        &mut self,
        name: impl Into<String>,
        step: ModelStep,
        depends_on: Vec<StepId>,
        optional: bool,
    ) -> StepId {
        self.add_step(name, StepKind::ModelCall(step), depends_on, optional)
    }

    pub fn answer(&mut self, id: StepId) -> &mut Self {
        self.answer_steps.push(id);
        self
    }

    /// Finish and validate. A structural problem is `InvalidPlan`.
    pub fn build(self) -> Result<Plan> {
        let plan = Plan {
            query_id: self.query_id,
            query: self.query,
            steps: self.steps,
            answer_steps: self.answer_steps,
            deadline: self.deadline,
        };
        plan.validate()?;
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// A dependency can no longer succeed.
    Skipped,
    /// Was running when the plan was aborted or timed out.
    Cancelled,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanStatus {
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    TimedOut,
}

/// Value held by a succeeded step (and by the result cache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutput {
    Fetch(FetchResult),
    Model(ModelResult),
}

impl StepOutput {
    pub fn content(&self) -> &str {
        match self {
            Self::Fetch(f) => &f.content,
            Self::Model(m) => &m.content,
        }
    }
}

/// Per-step diagnostics in the query outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub id: StepId,
    pub name: String,
    pub kind: String,
    pub status: StepState,
    pub optional: bool,
    pub attempts: u32,
    pub cached: bool,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
}

/// Aggregated outcome of one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "queryId")]
    pub query_id: QueryId,
    pub query: String,
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
    #[serde(rename = "sessionName")]
    pub session_name: Option<String>,
    pub status: PlanStatus,
    pub success: bool,
    pub answer: Option<String>,
    pub steps: Vec<StepReport>,
    pub error: Option<StepFailure>,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

/// Progress notification emitted while a plan runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanStarted {
        #[serde(rename = "queryId")]
        query_id: QueryId,
        steps: usize,
    },
    StepStarted {
        step: StepId,
        name: String,
        kind: String,
    },
    StepRetrying {
        step: StepId,
        attempt: u32,
        error: StepFailure,
    },
    StepSucceeded {
        step: StepId,
        name: String,
        cached: bool,
        #[serde(rename = "elapsedMs")]
        elapsed_ms: u64,
    },
    StepFailed {
        step: StepId,
        name: String,
        error: StepFailure,
    },
    StepSkipped {
        step: StepId,
        name: String,
    },
    PlanFinished {
        status: PlanStatus,
        #[serde(rename = "elapsedMs")]
        elapsed_ms: u64,
    },
}

impl PlanEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlanStarted { .. } => "plan_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::PlanFinished { .. } => "plan_finished",
        }
    }
}
