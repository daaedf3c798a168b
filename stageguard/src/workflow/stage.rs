//! Stage definitions, the collaborator contract and routing.
//!
//! A stage pairs an external collaborator with a routing function. Routing
//! is data: a pure mapping from the immutable run state to a [`Route`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::WorkflowRun;
use crate::cancellation::CancellationToken;
use crate::errors::{ConfigError, StageFailure};

/// The input handed to a stage collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    /// The run's composite goal.
    pub goal: Value,
    /// Latest real output of every stage completed so far.
    #[serde(default)]
    pub prior_outputs: BTreeMap<String, Value>,
    /// Operator-supplied input from a SUBSTITUTE_INPUT resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitute: Option<Value>,
}

impl StageInput {
    /// Creates an input carrying only the goal.
    #[must_use]
    pub fn new(goal: Value) -> Self {
        Self {
            goal,
            ..Self::default()
        }
    }

    /// Returns a prior stage's output.
    #[must_use]
    pub fn prior(&self, stage_id: &str) -> Option<&Value> {
        self.prior_outputs.get(stage_id)
    }
}

/// One call to a stage collaborator.
#[derive(Debug, Clone)]
pub struct StageCall {
    /// The run making the call.
    pub run_id: String,
    /// The stage being executed.
    pub stage_id: String,
    /// 1-based attempt number within the current execute call.
    pub attempt: u32,
    /// When the executor stops waiting for this attempt.
    pub deadline: Instant,
    /// Stage input.
    pub input: StageInput,
    /// Run-level cancellation signal.
    pub cancel: CancellationToken,
}

impl StageCall {
    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// An external service that performs a stage's work.
///
/// Implementations must return a [`StageFailure`] on error. They should honor
/// `call.cancel` and `call.deadline`; the executor abandons the call when
/// either fires regardless.
#[async_trait]
pub trait StageCollaborator: Send + Sync {
    /// Performs one attempt.
    async fn invoke(&self, call: &StageCall) -> Result<Value, StageFailure>;
}

/// Adapts an async closure into a collaborator.
pub struct FnCollaborator<F, Fut>
where
    F: Fn(StageCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    func: F,
    _phantom: std::marker::PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnCollaborator<F, Fut>
where
    F: Fn(StageCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    /// Creates a new closure-backed collaborator.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnCollaborator<F, Fut>
where
    F: Fn(StageCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCollaborator").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> StageCollaborator for FnCollaborator<F, Fut>
where
    F: Fn(StageCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn invoke(&self, call: &StageCall) -> Result<Value, StageFailure> {
        (self.func)(call.clone()).await.map_err(StageFailure::from)
    }
}

/// The next step chosen by a stage's routing function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    /// Execute the named stage next.
    Goto {
        /// Target stage id.
        stage: String,
    },
    /// Finish the run successfully.
    Terminal,
    /// Pause for human sign-off, then continue at `next` (or finish if `None`).
    AwaitApproval {
        /// The successor taken on approval.
        next: Option<String>,
    },
    /// Hand the run to a human.
    Escalate {
        /// Why the stage asked for a human.
        reason: String,
    },
}

impl Route {
    /// Shorthand for [`Route::Goto`].
    #[must_use]
    pub fn goto(stage: impl Into<String>) -> Self {
        Self::Goto {
            stage: stage.into(),
        }
    }
}

type RouteFn = dyn Fn(&WorkflowRun) -> Route + Send + Sync;

/// How a stage picks its successor.
#[derive(Clone)]
pub enum Routing {
    /// Always the same route; validated when the workflow is built.
    Static(Route),
    /// Computed from the run state; targets are validated at run time.
    Dynamic(Arc<RouteFn>),
}

impl Routing {
    /// Always go to `stage`.
    #[must_use]
    pub fn next(stage: impl Into<String>) -> Self {
        Self::Static(Route::goto(stage))
    }

    /// Always finish the run.
    #[must_use]
    pub fn terminal() -> Self {
        Self::Static(Route::Terminal)
    }

    /// Pause for approval, then go to `stage`.
    #[must_use]
    pub fn approve_then(stage: impl Into<String>) -> Self {
        Self::Static(Route::AwaitApproval {
            next: Some(stage.into()),
        })
    }

    /// Pause for approval, then finish the run.
    #[must_use]
    pub fn approve_then_finish() -> Self {
        Self::Static(Route::AwaitApproval { next: None })
    }

    /// Always escalate.
    #[must_use]
    pub fn escalate(reason: impl Into<String>) -> Self {
        Self::Static(Route::Escalate {
            reason: reason.into(),
        })
    }

    /// Route with a function of the run state. The function must be pure.
    pub fn dynamic<F>(func: F) -> Self
    where
        F: Fn(&WorkflowRun) -> Route + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(func))
    }

    /// Evaluates the routing function.
    #[must_use]
    pub fn decide(&self, run: &WorkflowRun) -> Route {
        match self {
            Self::Static(route) => route.clone(),
            Self::Dynamic(func) => func(run),
        }
    }

    /// The stage a static route can reach, if any.
    #[must_use]
    pub fn static_target(&self) -> Option<&str> {
        match self {
            Self::Static(Route::Goto { stage } | Route::AwaitApproval { next: Some(stage) }) => {
                Some(stage.as_str())
            }
            _ => None,
        }
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self::terminal()
    }
}

impl Debug for Routing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(route) => f.debug_tuple("Static").field(route).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Retry budget and timeout applied to stages that do not set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefaults {
    /// Total attempts per execute call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
}

fn default_max_retries() -> u32 {
    crate::resilience::DEFAULT_MAX_RETRIES
}

fn default_timeout_seconds() -> f64 {
    crate::resilience::DEFAULT_TIMEOUT.as_secs_f64()
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl StageDefaults {
    /// Returns the timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds).unwrap_or(crate::resilience::DEFAULT_TIMEOUT)
    }

    /// Checks the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "stage_defaults.max_retries must be at least 1".to_string(),
            ));
        }
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(ConfigError::Invalid(
                "stage_defaults.timeout_seconds must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named pipeline unit with its own retry, timeout and routing policy.
#[derive(Clone)]
pub struct StageDefinition {
    id: String,
    collaborator: Arc<dyn StageCollaborator>,
    routing: Routing,
    max_retries: Option<u32>,
    timeout: Option<Duration>,
}

impl StageDefinition {
    /// Creates a stage that finishes the run when done.
    #[must_use]
    pub fn new(id: impl Into<String>, collaborator: Arc<dyn StageCollaborator>) -> Self {
        Self {
            id: id.into(),
            collaborator,
            routing: Routing::default(),
            max_retries: None,
            timeout: None,
        }
    }

    /// Sets the routing.
    #[must_use]
    pub fn routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    /// Sets the total attempts per execute call.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The stage id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The collaborator.
    #[must_use]
    pub fn collaborator(&self) -> &Arc<dyn StageCollaborator> {
        &self.collaborator
    }

    /// The routing policy.
    #[must_use]
    pub fn routing_policy(&self) -> &Routing {
        &self.routing
    }

    /// Total attempts, falling back to `defaults`.
    #[must_use]
    pub fn effective_max_retries(&self, defaults: &StageDefaults) -> u32 {
        self.max_retries.unwrap_or(defaults.max_retries)
    }

    /// Per-attempt timeout, falling back to `defaults`.
    #[must_use]
    pub fn effective_timeout(&self, defaults: &StageDefaults) -> Duration {
        self.timeout.unwrap_or_else(|| defaults.timeout())
    }
}

impl Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("id", &self.id)
            .field("routing", &self.routing)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
