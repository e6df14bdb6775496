use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::db::history::{HistoryError, SharedHistorySink};
use crate::pipeline::approval::ApprovalEvaluator;
use crate::pipeline::capabilities::ModelCapabilities;
use crate::pipeline::ingest::{ingest_request, IngestError, RunRequest, SharedImageSource};
use crate::pipeline::repair::{
    ChainTransitionError, EditStrategy, GenerateStrategy, RepairChainRunner, RepairStrategy,
    DEFAULT_MAX_RETRIES,
};
use crate::pipeline::selection::select_best_original;
use crate::pipeline::state::{
    BestResult, DecisionFeedback, MessageRole, RepairKind, Route, RunState, RunStateError,
};
use crate::storage::{ArtifactError, CandidateArtifactStore};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("ingestion failed: {0}")]
    Ingest(#[from] IngestError),
    #[error("history persistence failed: {0}")]
    Persist(#[from] HistoryError),
    #[error("candidate artifact failed: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("repair chain transition failed: {0}")]
    InvalidTransition(#[from] ChainTransitionError),
    #[error("run state rejected update: {0}")]
    State(#[from] RunStateError),
}

impl WorkflowError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest(_) => "ingest",
            Self::Persist(_) => "persist",
            Self::Artifact(_) => "artifact",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::State(_) => "state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStep {
    Ingest,
    Approval,
    SelectBest,
    RepairChain(RepairKind),
    Persist,
    Done,
}

impl WorkflowStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Approval => "approval",
            Self::SelectBest => "select_best",
            Self::RepairChain(RepairKind::Edit) => "repair_edit",
            Self::RepairChain(RepairKind::Generate) => "repair_generate",
            Self::Persist => "persist",
            Self::Done => "done",
        }
    }
}

/// Branch taken once the initial approval has routed the run. Terminal route
/// letters go straight to persistence.
pub fn next_step_after_approval(route: Route) -> WorkflowStep {
    match route {
        Route::Approved => WorkflowStep::SelectBest,
        Route::NeedsEdit => WorkflowStep::RepairChain(RepairKind::Edit),
        Route::NeedsCompleteChange => WorkflowStep::RepairChain(RepairKind::Generate),
        Route::A | Route::B | Route::C => WorkflowStep::Persist,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSummary {
    pub path: PathBuf,
    pub strategy: RepairKind,
    pub retry_index: u32,
    pub fallback: bool,
    pub accepted: bool,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub product_id: String,
    pub category: String,
    pub route: Option<Route>,
    pub best: Option<BestResult>,
    pub retries_used: u32,
    pub candidates: Vec<CandidateSummary>,
    pub feedback: Option<DecisionFeedback>,
}

impl RunOutcome {
    pub fn from_state(state: &RunState) -> Self {
        let metadata = state.metadata();
        Self {
            run_id: metadata.run_id.clone(),
            product_id: metadata.product_id.clone(),
            category: metadata.category.clone(),
            route: state.decision().map(|decision| decision.route),
            best: state.best().cloned(),
            retries_used: state.retry_count(),
            candidates: state
                .candidates()
                .iter()
                .map(|candidate| CandidateSummary {
                    path: candidate.path.clone(),
                    strategy: candidate.strategy,
                    retry_index: candidate.retry_index,
                    fallback: candidate.fallback,
                    accepted: candidate.accepted,
                    score: candidate.verdict.as_ref().map(|verdict| verdict.score()),
                })
                .collect(),
            feedback: state.decision().map(|decision| decision.feedback.clone()),
        }
    }
}

/// One catalog cover run from ingestion to history. Collaborators are shared,
/// so a single workflow value can serve concurrent runs.
#[derive(Clone)]
pub struct CoverWorkflow {
    image_source: SharedImageSource,
    capabilities: ModelCapabilities,
    history: SharedHistorySink,
    artifacts: CandidateArtifactStore,
    max_retries: u32,
}

impl CoverWorkflow {
    pub fn new(
        image_source: SharedImageSource,
        capabilities: ModelCapabilities,
        history: SharedHistorySink,
        artifacts: CandidateArtifactStore,
    ) -> Self {
        Self {
            image_source,
            capabilities,
            history,
            artifacts,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn run(&self, request: &RunRequest) -> Result<RunOutcome, WorkflowError> {
        let mut step = WorkflowStep::Ingest;
        let mut state = ingest_request(self.image_source.as_ref(), request).map_err(|err| {
            error!(
                product_id = request.product_id.as_str(),
                step = step.as_str(),
                error = %err,
                "run aborted"
            );
            err
        })?;

        let evaluator = ApprovalEvaluator::new(self.capabilities.understanding.clone());
        while step != WorkflowStep::Done {
            step = match step {
                WorkflowStep::Ingest => WorkflowStep::Approval,
                WorkflowStep::Approval => {
                    evaluator.evaluate_originals(&mut state);
                    let route = state
                        .decision()
                        .map(|decision| decision.route)
                        .unwrap_or(Route::NeedsCompleteChange);
                    next_step_after_approval(route)
                }
                WorkflowStep::SelectBest => {
                    let selected = select_best_original(&mut state);
                    self.on_failure(&state, step, selected)?;
                    WorkflowStep::Persist
                }
                WorkflowStep::RepairChain(kind) => {
                    let runner = RepairChainRunner::new(
                        evaluator.clone(),
                        self.artifacts.clone(),
                        self.max_retries,
                    );
                    let strategy = self.strategy_for(kind);
                    let finished = runner.run(strategy.as_ref(), &mut state);
                    self.on_failure(&state, step, finished)?;
                    WorkflowStep::Persist
                }
                WorkflowStep::Persist => {
                    state.push_message(MessageRole::System, "persisted to history");
                    let persisted = self.history.persist_run(&state);
                    self.on_failure(&state, step, persisted)?;
                    info!(
                        run_id = state.run_id(),
                        route = state.decision().map(|d| d.route.as_str()).unwrap_or("none"),
                        retries = state.retry_count(),
                        "run persisted"
                    );
                    WorkflowStep::Done
                }
                WorkflowStep::Done => WorkflowStep::Done,
            };
        }

        Ok(RunOutcome::from_state(&state))
    }

    fn strategy_for(&self, kind: RepairKind) -> Box<dyn RepairStrategy> {
        match kind {
            RepairKind::Edit => Box::new(EditStrategy::new(
                self.capabilities.planning.clone(),
                self.capabilities.editing.clone(),
            )),
            RepairKind::Generate => Box::new(GenerateStrategy::new(
                self.capabilities.planning.clone(),
                self.capabilities.generation.clone(),
            )),
        }
    }

    fn on_failure<T, E>(
        &self,
        state: &RunState,
        step: WorkflowStep,
        result: Result<T, E>,
    ) -> Result<T, WorkflowError>
    where
        E: Into<WorkflowError>,
    {
        result.map_err(|err| {
            let err = err.into();
            error!(
                run_id = state.run_id(),
                step = step.as_str(),
                kind = err.as_str(),
                error = %err,
                "run aborted"
            );
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_routes_map_to_steps() {
        assert_eq!(
            next_step_after_approval(Route::Approved),
            WorkflowStep::SelectBest
        );
        assert_eq!(
            next_step_after_approval(Route::NeedsEdit),
            WorkflowStep::RepairChain(RepairKind::Edit)
        );
        assert_eq!(
            next_step_after_approval(Route::NeedsCompleteChange),
            WorkflowStep::RepairChain(RepairKind::Generate)
        );
        assert_eq!(next_step_after_approval(Route::B), WorkflowStep::Persist);
    }

    #[test]
    fn local_render_failure_is_an_artifact_error() {
        use crate::pipeline::tool_adapters::local_ops::LocalImageOpError;

        let err = WorkflowError::from(ArtifactError::from(LocalImageOpError::Encode(
            String::from("out of memory"),
        )));
        assert_eq!(err.as_str(), "artifact");
        assert!(err.to_string().contains("failed to render local candidate"));
    }

    #[test]
    fn step_names_are_stable() {
        assert_eq!(WorkflowStep::RepairChain(RepairKind::Edit).as_str(), "repair_edit");
        assert_eq!(WorkflowStep::SelectBest.as_str(), "select_best");
    }
}
