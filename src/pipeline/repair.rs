use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::approval::{ApprovalEvaluator, MISSING_VERDICT_REASON};
use crate::pipeline::capabilities::{
    PlanningRequest, SharedEditCapability, SharedGenerationCapability, SharedPlanningCapability,
};
use crate::pipeline::planning::{default_plan, parse_revision_plan};
use crate::pipeline::prompts;
use crate::pipeline::scoring::{round_to_3, AcceptanceThresholds};
use crate::pipeline::state::{
    BestResult, BestWarning, Candidate, DecisionFeedback, DecisionSubject, MessageRole,
    RepairKind, RevisionPlan, RunState, VerdictRecord,
};
use crate::pipeline::tool_adapters::local_ops::{local_placeholder, local_quality_edit};
use crate::pipeline::workflow::WorkflowError;
use crate::storage::{ArtifactError, CandidateArtifactStore};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
const RETRY_HEADLINE: &str = "candidate not yet meeting thresholds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Plan,
    Produce,
    ReEvaluate,
    Retry,
    Accept,
    Exhausted,
}

impl ChainState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Produce => "produce",
            Self::ReEvaluate => "re_evaluate",
            Self::Retry => "retry",
            Self::Accept => "accept",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accept | Self::Exhausted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    PlanReady,
    CandidateProduced,
    CandidateEvaluated {
        acceptable: bool,
        retry: u32,
        max_retries: u32,
    },
    FeedbackRefreshed,
}

impl ChainEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanReady => "plan_ready",
            Self::CandidateProduced => "candidate_produced",
            Self::CandidateEvaluated { .. } => "candidate_evaluated",
            Self::FeedbackRefreshed => "feedback_refreshed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid repair chain transition from '{from}' on '{event}'")]
pub struct ChainTransitionError {
    pub from: &'static str,
    pub event: &'static str,
}

/// Pure transition function of the repair chain.
pub fn transition(
    state: ChainState,
    event: ChainEvent,
) -> Result<ChainState, ChainTransitionError> {
    use ChainState::{Accept, Exhausted, Plan, Produce, ReEvaluate, Retry};

    match (state, event) {
        (Plan, ChainEvent::PlanReady) => Ok(Produce),
        (Produce, ChainEvent::CandidateProduced) => Ok(ReEvaluate),
        (
            ReEvaluate,
            ChainEvent::CandidateEvaluated {
                acceptable,
                retry,
                max_retries,
            },
        ) => {
            if acceptable {
                Ok(Accept)
            } else if retry.saturating_add(1) < max_retries {
                Ok(Retry)
            } else {
                Ok(Exhausted)
            }
        }
        (Retry, ChainEvent::FeedbackRefreshed) => Ok(Plan),
        _ => Err(ChainTransitionError {
            from: state.as_str(),
            event: event.as_str(),
        }),
    }
}

/// Image produced in one repair attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedImage {
    pub bytes: Vec<u8>,
    /// `true` when the local deterministic operation stood in for the
    /// capability.
    pub fallback: bool,
}

pub trait RepairStrategy: Send + Sync {
    fn kind(&self) -> RepairKind;

    fn plan_revision(&self, state: &RunState) -> RevisionPlan;

    fn produce_candidate(
        &self,
        state: &RunState,
        plan: &RevisionPlan,
    ) -> Result<ProducedImage, ArtifactError>;
}

#[derive(Clone)]
pub struct EditStrategy {
    planning: SharedPlanningCapability,
    editing: SharedEditCapability,
}

impl EditStrategy {
    pub fn new(planning: SharedPlanningCapability, editing: SharedEditCapability) -> Self {
        Self { planning, editing }
    }
}

impl RepairStrategy for EditStrategy {
    fn kind(&self) -> RepairKind {
        RepairKind::Edit
    }

    fn plan_revision(&self, state: &RunState) -> RevisionPlan {
        let feedback = current_feedback(state, RepairKind::Edit);
        let request = PlanningRequest {
            kind: RepairKind::Edit,
            category: state.category(),
            feedback: &feedback,
            system_prompt: prompts::PROMPTER_EDIT_SYSTEM,
            user_prompt: prompts::edit_planning_prompt(feedback_json(&feedback).as_str()),
        };
        request_plan(&self.planning, &request, state.run_id())
    }

    fn produce_candidate(
        &self,
        state: &RunState,
        plan: &RevisionPlan,
    ) -> Result<ProducedImage, ArtifactError> {
        let Some(base) = edit_base(state) else {
            warn!(run_id = state.run_id(), "no base image to edit; using placeholder");
            return Ok(ProducedImage {
                bytes: local_placeholder(state.category())?,
                fallback: true,
            });
        };

        match self.editing.edit(plan, base) {
            Ok(Some(bytes)) if !bytes.is_empty() => {
                return Ok(ProducedImage {
                    bytes,
                    fallback: false,
                })
            }
            Ok(_) => warn!(
                run_id = state.run_id(),
                "edit capability returned no image; using local edit"
            ),
            Err(error) => {
                warn!(run_id = state.run_id(), %error, "edit capability failed; using local edit")
            }
        }

        let bytes = match local_quality_edit(base) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(run_id = state.run_id(), %error, "local edit failed; using placeholder");
                local_placeholder(state.category())?
            }
        };
        Ok(ProducedImage {
            bytes,
            fallback: true,
        })
    }
}

#[derive(Clone)]
pub struct GenerateStrategy {
    planning: SharedPlanningCapability,
    generation: SharedGenerationCapability,
}

impl GenerateStrategy {
    pub fn new(planning: SharedPlanningCapability, generation: SharedGenerationCapability) -> Self {
        Self {
            planning,
            generation,
        }
    }
}

impl RepairStrategy for GenerateStrategy {
    fn kind(&self) -> RepairKind {
        RepairKind::Generate
    }

    fn plan_revision(&self, state: &RunState) -> RevisionPlan {
        let feedback = current_feedback(state, RepairKind::Generate);
        let request = PlanningRequest {
            kind: RepairKind::Generate,
            category: state.category(),
            feedback: &feedback,
            system_prompt: prompts::PROMPTER_GEN_SYSTEM,
            user_prompt: prompts::generate_planning_prompt(
                feedback_json(&feedback).as_str(),
                state.category(),
            ),
        };
        request_plan(&self.planning, &request, state.run_id())
    }

    fn produce_candidate(
        &self,
        state: &RunState,
        plan: &RevisionPlan,
    ) -> Result<ProducedImage, ArtifactError> {
        match self.generation.generate(plan, state.category()) {
            Ok(Some(bytes)) if !bytes.is_empty() => {
                return Ok(ProducedImage {
                    bytes,
                    fallback: false,
                })
            }
            Ok(_) => warn!(
                run_id = state.run_id(),
                "generation capability returned no image; using placeholder"
            ),
            Err(error) => warn!(
                run_id = state.run_id(),
                %error,
                "generation capability failed; using placeholder"
            ),
        }
        Ok(ProducedImage {
            bytes: local_placeholder(state.category())?,
            fallback: true,
        })
    }
}

fn current_feedback(state: &RunState, kind: RepairKind) -> DecisionFeedback {
    state
        .decision()
        .map(|decision| decision.feedback.clone())
        .unwrap_or_else(|| DecisionFeedback {
            why: Vec::new(),
            next_action: kind.next_action(),
            required_changes: Vec::new(),
            acceptance_thresholds: Some(AcceptanceThresholds::policy()),
            strategy: Some(kind),
        })
}

fn feedback_json(feedback: &DecisionFeedback) -> String {
    serde_json::to_string(feedback).unwrap_or_else(|_| String::from("{}"))
}

fn request_plan(
    planning: &SharedPlanningCapability,
    request: &PlanningRequest<'_>,
    run_id: &str,
) -> RevisionPlan {
    let raw = match planning.plan(request) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(
                run_id,
                kind = request.kind.as_str(),
                %error,
                "planning call failed; using default plan"
            );
            return default_plan(request.kind);
        }
    };
    match parse_revision_plan(request.kind, raw.as_str()) {
        Ok(plan) => plan,
        Err(error) => {
            warn!(
                run_id,
                kind = request.kind.as_str(),
                %error,
                "planning response unusable; using default plan"
            );
            default_plan(request.kind)
        }
    }
}

/// The favored original, else the first input.
fn edit_base(state: &RunState) -> Option<&[u8]> {
    state
        .decision()
        .and_then(|decision| decision.chosen_fingerprint())
        .and_then(|fingerprint| state.input(fingerprint))
        .or_else(|| state.inputs().first())
        .map(|input| input.bytes())
}

fn refreshed_feedback(
    previous: Option<&DecisionFeedback>,
    verdict: &VerdictRecord,
    kind: RepairKind,
) -> DecisionFeedback {
    let mut why = vec![String::from(RETRY_HEADLINE)];
    for note in verdict.reasons.iter().cloned().chain(verdict.shortcomings()) {
        let note = note.trim().to_string();
        if !note.is_empty() && !why.contains(&note) {
            why.push(note);
        }
    }
    DecisionFeedback {
        why,
        next_action: kind.next_action(),
        required_changes: previous
            .map(|feedback| feedback.required_changes.clone())
            .unwrap_or_default(),
        acceptance_thresholds: Some(AcceptanceThresholds::policy()),
        strategy: Some(kind),
    }
}

/// Bounded plan, produce and re-evaluate loop shared by both strategies.
#[derive(Clone)]
pub struct RepairChainRunner {
    evaluator: ApprovalEvaluator,
    artifacts: CandidateArtifactStore,
    max_retries: u32,
}

impl RepairChainRunner {
    pub fn new(
        evaluator: ApprovalEvaluator,
        artifacts: CandidateArtifactStore,
        max_retries: u32,
    ) -> Self {
        Self {
            evaluator,
            artifacts,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Drives the chain to `Accept` or `Exhausted` and finalizes the run.
    pub fn run(
        &self,
        strategy: &dyn RepairStrategy,
        state: &mut RunState,
    ) -> Result<ChainState, WorkflowError> {
        let kind = strategy.kind();
        let mut chain = ChainState::Plan;
        let mut plan = default_plan(kind);
        let mut produced = Vec::new();
        let mut verdict = VerdictRecord::fail_open(MISSING_VERDICT_REASON);

        info!(
            run_id = state.run_id(),
            strategy = kind.as_str(),
            max_retries = self.max_retries,
            "repair chain started"
        );

        while !chain.is_terminal() {
            let event = match chain {
                ChainState::Plan => {
                    plan = strategy.plan_revision(state);
                    let key = match kind {
                        RepairKind::Edit => "edit_plan",
                        RepairKind::Generate => "gen_plan",
                    };
                    state.push_message(
                        MessageRole::Assistant,
                        json!({ key: plan.body }).to_string(),
                    );
                    ChainEvent::PlanReady
                }
                ChainState::Produce => {
                    let image = strategy.produce_candidate(state, &plan)?;
                    let retry_index = state.retry_count();
                    let path = self.artifacts.write_candidate(
                        kind,
                        state.run_id(),
                        retry_index,
                        image.bytes.as_slice(),
                    )?;
                    debug!(
                        run_id = state.run_id(),
                        path = %path.display(),
                        fallback = image.fallback,
                        "candidate written"
                    );
                    state.push_candidate(Candidate {
                        path,
                        strategy: kind,
                        retry_index,
                        plan: plan.clone(),
                        fallback: image.fallback,
                        verdict: None,
                        accepted: false,
                    });
                    produced = image.bytes;
                    ChainEvent::CandidateProduced
                }
                ChainState::ReEvaluate => {
                    verdict = self
                        .evaluator
                        .reevaluate_candidate(state.category(), produced.as_slice());
                    if let Some(candidate) = state.latest_candidate_mut() {
                        candidate.verdict = Some(verdict.clone());
                    }
                    state.push_message(
                        MessageRole::Assistant,
                        json!({ "reapproval": verdict }).to_string(),
                    );
                    ChainEvent::CandidateEvaluated {
                        acceptable: verdict.is_acceptable(),
                        retry: state.retry_count(),
                        max_retries: self.max_retries,
                    }
                }
                ChainState::Retry => {
                    state.increment_retry();
                    let feedback = refreshed_feedback(
                        state.decision().map(|decision| &decision.feedback),
                        &verdict,
                        kind,
                    );
                    if let Some(decision) = state.decision_mut() {
                        decision.feedback = feedback;
                    }
                    ChainEvent::FeedbackRefreshed
                }
                ChainState::Accept | ChainState::Exhausted => break,
            };
            let next = transition(chain, event)?;
            debug!(
                run_id = state.run_id(),
                from = chain.as_str(),
                to = next.as_str(),
                "repair chain transition"
            );
            chain = next;
        }

        self.finish(chain, kind, &verdict, state)?;
        Ok(chain)
    }

    fn finish(
        &self,
        chain: ChainState,
        kind: RepairKind,
        verdict: &VerdictRecord,
        state: &mut RunState,
    ) -> Result<(), WorkflowError> {
        let path = state.latest_candidate().map(|candidate| candidate.path.clone());
        let warning = (chain == ChainState::Exhausted).then_some(BestWarning::MaxRetriesReached);
        let best = BestResult {
            generated: true,
            path: path.clone(),
            source_fingerprint: None,
            final_score: round_to_3(verdict.score()),
            warning,
        };

        if let (Some(decision), Some(path)) = (state.decision_mut(), path) {
            decision.chosen = Some(DecisionSubject::Candidate(path));
            if chain == ChainState::Accept {
                decision.feedback = DecisionFeedback::accepted();
            }
        }
        match warning {
            Some(_) => warn!(
                run_id = state.run_id(),
                strategy = kind.as_str(),
                retries = state.retry_count(),
                "retry budget exhausted; keeping latest candidate"
            ),
            None => info!(
                run_id = state.run_id(),
                strategy = kind.as_str(),
                retries = state.retry_count(),
                "repair candidate accepted"
            ),
        }
        state.finalize(best, kind.terminal_route())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluated(acceptable: bool, retry: u32, max_retries: u32) -> ChainEvent {
        ChainEvent::CandidateEvaluated {
            acceptable,
            retry,
            max_retries,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let mut state = ChainState::Plan;
        state = transition(state, ChainEvent::PlanReady).expect("plan -> produce");
        assert_eq!(state, ChainState::Produce);
        state = transition(state, ChainEvent::CandidateProduced).expect("produce -> re-evaluate");
        assert_eq!(state, ChainState::ReEvaluate);
        state = transition(state, evaluated(true, 0, 2)).expect("re-evaluate -> accept");
        assert_eq!(state, ChainState::Accept);
        assert!(state.is_terminal());
    }

    #[test]
    fn retry_budget_decides_between_retry_and_exhausted() {
        assert_eq!(
            transition(ChainState::ReEvaluate, evaluated(false, 0, 2)),
            Ok(ChainState::Retry)
        );
        assert_eq!(
            transition(ChainState::ReEvaluate, evaluated(false, 1, 2)),
            Ok(ChainState::Exhausted)
        );
        assert_eq!(
            transition(ChainState::ReEvaluate, evaluated(false, 0, 0)),
            Ok(ChainState::Exhausted)
        );
        assert_eq!(
            transition(ChainState::ReEvaluate, evaluated(false, u32::MAX, u32::MAX)),
            Ok(ChainState::Exhausted)
        );
        assert_eq!(
            transition(ChainState::Retry, ChainEvent::FeedbackRefreshed),
            Ok(ChainState::Plan)
        );
    }

    #[test]
    fn rejects_out_of_order_events() {
        assert_eq!(
            transition(ChainState::Plan, ChainEvent::CandidateProduced),
            Err(ChainTransitionError {
                from: "plan",
                event: "candidate_produced",
            })
        );
        assert!(transition(ChainState::Produce, evaluated(true, 0, 2)).is_err());
        assert!(transition(ChainState::Accept, ChainEvent::PlanReady).is_err());
        assert!(transition(ChainState::Exhausted, ChainEvent::FeedbackRefreshed).is_err());
        assert!(transition(ChainState::ReEvaluate, ChainEvent::PlanReady).is_err());
    }

    #[test]
    fn refreshed_feedback_lists_reasons_then_shortcomings_and_tags_strategy() {
        let verdict = VerdictRecord {
            relevance: 0.9,
            reality: 0.5,
            integrity: 0.99,
            quality: 0.8,
            verdict: crate::pipeline::state::Verdict::NeedsEdit,
            reasons: vec![String::from("looks like CGI")],
        };
        let previous = DecisionFeedback {
            why: vec![String::from("old")],
            next_action: crate::pipeline::state::NextAction::Generate,
            required_changes: vec![String::from("reshoot")],
            acceptance_thresholds: None,
            strategy: None,
        };

        let feedback = refreshed_feedback(Some(&previous), &verdict, RepairKind::Generate);

        assert_eq!(
            feedback.why,
            vec![
                String::from(RETRY_HEADLINE),
                String::from("looks like CGI"),
                String::from("reality 0.50 below 0.70"),
            ]
        );
        assert_eq!(feedback.required_changes, vec![String::from("reshoot")]);
        assert_eq!(feedback.strategy, Some(RepairKind::Generate));
        assert_eq!(
            feedback.acceptance_thresholds,
            Some(AcceptanceThresholds::policy())
        );
    }
}
