use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{Fault, RecoveryError};

pub const DEFAULT_SAGA_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SagaId(pub String);

impl SagaId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Forward or compensating action of a saga step.
#[async_trait]
pub trait SagaAction: Send + Sync {
    async fn run(&self, params: &BTreeMap<String, Value>) -> Result<Value, Fault>;
}

pub struct FnSagaAction<F> {
    func: F,
}

impl<F> FnSagaAction<F> {
    pub fn new<Fut>(func: F) -> Self
    where
        F: Fn(BTreeMap<String, Value>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, Fault>> + Send,
    {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> SagaAction for FnSagaAction<F>
where
    F: Fn(BTreeMap<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Fault>> + Send,
{
    async fn run(&self, params: &BTreeMap<String, Value>) -> Result<Value, Fault> {
        (self.func)(params.clone()).await
    }
}

/// Wraps an async closure as a shareable saga action.
pub fn saga_action<F, Fut>(func: F) -> Arc<dyn SagaAction>
where
    F: Fn(BTreeMap<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
{
    Arc::new(FnSagaAction::new(func))
}

#[derive(Clone)]
pub struct SagaStep {
    pub name: String,
    forward_action: Arc<dyn SagaAction>,
    compensation_action: Option<Arc<dyn SagaAction>>,
    pub params: BTreeMap<String, Value>,
    pub executed: bool,
    pub compensated: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl SagaStep {
    pub fn new(name: impl Into<String>, forward_action: Arc<dyn SagaAction>) -> Self {
        Self {
            name: name.into(),
            forward_action,
            compensation_action: None,
            params: BTreeMap::new(),
            executed: false,
            compensated: false,
            result: None,
            error: None,
        }
    }

    pub fn with_compensation(mut self, compensation_action: Arc<dyn SagaAction>) -> Self {
        self.compensation_action = Some(compensation_action);
        self
    }

    pub fn with_params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    fn snapshot(&self) -> SagaStepSnapshot {
        SagaStepSnapshot {
            name: self.name.clone(),
            executed: self.executed,
            compensated: self.compensated,
            error: self.error.clone(),
        }
    }
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("executed", &self.executed)
            .field("compensated", &self.compensated)
            .field("has_compensation", &self.compensation_action.is_some())
            .field("error", &self.error)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Running,
    Compensating,
    Completed,
    Aborted,
    Failed,
}

impl SagaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Saga {
    pub saga_id: SagaId,
    pub name: String,
    pub steps: Vec<SagaStep>,
    pub state: SagaState,
    pub timeout: Duration,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStepSnapshot {
    pub name: String,
    pub executed: bool,
    pub compensated: bool,
    pub error: Option<String>,
}

/// Final status of a saga, captured before it leaves the active map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SagaOutcome {
    pub saga_id: SagaId,
    pub name: String,
    pub state: SagaState,
    pub steps: Vec<SagaStepSnapshot>,
    pub failed_step: Option<usize>,
    pub results: Vec<Value>,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SagaOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == SagaState::Completed
    }
}

/// Runs sagas step by step and compensates executed steps in reverse order
/// on the first failure. Finished sagas are removed from the active map;
/// the last `history_limit` outcomes are archived.
pub struct SagaOrchestrator {
    active: RwLock<HashMap<SagaId, Saga>>,
    history: RwLock<VecDeque<SagaOutcome>>,
    timeout: Duration,
    history_limit: usize,
}

impl Default for SagaOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_SAGA_TIMEOUT, 0)
    }
}

impl SagaOrchestrator {
    pub fn new(timeout: Duration, history_limit: usize) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            timeout,
            history_limit,
        }
    }

    pub async fn create_saga(
        &self,
        name: impl Into<String>,
        steps: Vec<SagaStep>,
        metadata: BTreeMap<String, Value>,
    ) -> SagaId {
        let saga = Saga {
            saga_id: SagaId::generate(),
            name: name.into(),
            steps,
            state: SagaState::Running,
            timeout: self.timeout,
            metadata,
            created_at: Utc::now(),
        };
        let saga_id = saga.saga_id.clone();
        info!(
            event_name = "recovery.saga.created",
            saga_id = %saga_id,
            saga_name = %saga.name,
            steps = saga.steps.len(),
            "saga created"
        );
        self.active.write().await.insert(saga_id.clone(), saga);
        saga_id
    }

    pub async fn state(&self, saga_id: &SagaId) -> Option<SagaState> {
        self.active.read().await.get(saga_id).map(|saga| saga.state)
    }

    pub async fn active_saga_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Archived outcomes, oldest first.
    pub async fn history(&self) -> Vec<SagaOutcome> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn execute_saga(&self, saga_id: &SagaId) -> Result<SagaOutcome, RecoveryError> {
        let (name, steps, started_at) = {
            let active = self.active.read().await;
            let saga = active.get(saga_id).ok_or_else(|| RecoveryError::SagaNotFound(saga_id.clone()))?;
            (saga.name.clone(), saga.steps.clone(), saga.created_at)
        };

        let outcome = self.run(saga_id, name, steps, started_at).await;

        self.active.write().await.remove(saga_id);
        if self.history_limit > 0 {
            let mut history = self.history.write().await;
            history.push_back(outcome.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        Ok(outcome)
    }

    async fn run(
        &self,
        saga_id: &SagaId,
        name: String,
        mut steps: Vec<SagaStep>,
        started_at: DateTime<Utc>,
    ) -> SagaOutcome {
        let mut failed_step = None;
        let mut results = Vec::new();
        let mut timed_out = false;

        for index in 0..steps.len() {
            if !timed_out && self.past_deadline(started_at) {
                timed_out = true;
                warn!(
                    event_name = "recovery.saga.timeout_exceeded",
                    saga_id = %saga_id,
                    step = index,
                    timeout_secs = self.timeout.as_secs(),
                    "saga exceeded its timeout, continuing"
                );
            }

            let step = &mut steps[index];
            match step.forward_action.run(&step.params).await {
                Ok(value) => {
                    step.executed = true;
                    step.result = Some(value.clone());
                    results.push(value);
                }
                Err(fault) => {
                    warn!(
                        event_name = "recovery.saga.step_failed",
                        saga_id = %saga_id,
                        step = index,
                        step_name = %step.name,
                        error = %fault,
                        "saga step failed"
                    );
                    step.error = Some(fault.to_string());
                    failed_step = Some(index);
                    break;
                }
            }
        }

        let state = match failed_step {
            None => SagaState::Completed,
            Some(index) => {
                self.set_state(saga_id, SagaState::Compensating).await;
                info!(
                    event_name = "recovery.saga.compensating",
                    saga_id = %saga_id,
                    failed_step = index,
                    "compensating executed steps"
                );
                if compensate(saga_id, &mut steps[..index]).await {
                    SagaState::Aborted
                } else {
                    SagaState::Failed
                }
            }
        };
        self.set_state(saga_id, state).await;

        match state {
            SagaState::Completed => info!(
                event_name = "recovery.saga.completed",
                saga_id = %saga_id,
                saga_name = %name,
                "saga completed"
            ),
            SagaState::Aborted => info!(
                event_name = "recovery.saga.aborted",
                saga_id = %saga_id,
                saga_name = %name,
                "saga rolled back cleanly"
            ),
            _ => error!(
                event_name = "recovery.saga.failed",
                saga_id = %saga_id,
                saga_name = %name,
                "saga compensation incomplete"
            ),
        }

        SagaOutcome {
            saga_id: saga_id.clone(),
            name,
            state,
            steps: steps.iter().map(SagaStep::snapshot).collect(),
            failed_step,
            results,
            timed_out,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn past_deadline(&self, started_at: DateTime<Utc>) -> bool {
        match (Utc::now() - started_at).to_std() {
            Ok(elapsed) => elapsed > self.timeout,
            Err(_) => false,
        }
    }

    async fn set_state(&self, saga_id: &SagaId, state: SagaState) {
        if let Some(saga) = self.active.write().await.get_mut(saga_id) {
            saga.state = state;
        }
    }
}

/// Compensates executed steps from last to first. Every step is attempted;
/// returns false if any compensation failed.
async fn compensate(saga_id: &SagaId, steps: &mut [SagaStep]) -> bool {
    let mut clean = true;
    for (index, step) in steps.iter_mut().enumerate().rev() {
        if !step.executed {
            continue;
        }
        let Some(action) = step.compensation_action.clone() else {
            step.compensated = true;
            continue;
        };
        match action.run(&step.params).await {
            Ok(_) => step.compensated = true,
            Err(fault) => {
                clean = false;
                error!(
                    event_name = "recovery.saga.compensation_failed",
                    saga_id = %saga_id,
                    step = index,
                    step_name = %step.name,
                    error = %fault,
                    "step compensation failed"
                );
                step.error = Some(fault.to_string());
            }
        }
    }
    clean
}
