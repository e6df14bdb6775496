use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::pipeline::scoring::{self, AcceptanceThresholds};

pub const DEFAULT_CATEGORY: &str = "unknown";

/// Content-derived image key: lowercase hex SHA-256 of the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageProvenance {
    Remote { url: String },
    Inline,
}

impl ImageProvenance {
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Remote { url } => url.as_str(),
            Self::Inline => "inline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    fingerprint: Fingerprint,
    bytes: Vec<u8>,
    provenance: ImageProvenance,
}

impl ImageInput {
    pub fn new(bytes: Vec<u8>, provenance: ImageProvenance) -> Self {
        Self {
            fingerprint: Fingerprint::of_bytes(bytes.as_slice()),
            bytes,
            provenance,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn provenance(&self) -> &ImageProvenance {
        &self.provenance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    NeedsEdit,
    #[default]
    NeedsCompleteChange,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::NeedsEdit => "NEEDS_EDIT",
            Self::NeedsCompleteChange => "NEEDS_COMPLETE_CHANGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub relevance: f64,
    pub reality: f64,
    pub integrity: f64,
    pub quality: f64,
    pub verdict: Verdict,
    pub reasons: Vec<String>,
}

impl VerdictRecord {
    /// Record used whenever the understanding capability gives nothing usable.
    pub fn fail_open(reason: &str) -> Self {
        Self {
            relevance: 0.0,
            reality: 0.0,
            integrity: 0.0,
            quality: 0.0,
            verdict: Verdict::NeedsCompleteChange,
            reasons: vec![reason.to_string()],
        }
    }

    pub fn score(&self) -> f64 {
        scoring::score(self.relevance, self.reality, self.quality)
    }

    pub fn is_acceptable(&self) -> bool {
        scoring::is_acceptable(self.relevance, self.reality, self.integrity)
    }

    pub fn shortcomings(&self) -> Vec<String> {
        scoring::shortcomings(self.relevance, self.reality, self.integrity, self.quality)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "NEEDS_EDIT")]
    NeedsEdit,
    #[serde(rename = "NEEDS_COMPLETE_CHANGE")]
    NeedsCompleteChange,
    /// Original image selected.
    A,
    /// Edit accepted.
    B,
    /// Generation accepted.
    C,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::NeedsEdit => "NEEDS_EDIT",
            Self::NeedsCompleteChange => "NEEDS_COMPLETE_CHANGE",
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::A | Self::B | Self::C)
    }

    pub fn parse_recommendation(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "APPROVED" => Some(Self::Approved),
            "NEEDS_EDIT" => Some(Self::NeedsEdit),
            "NEEDS_COMPLETE_CHANGE" => Some(Self::NeedsCompleteChange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    Edit,
    Generate,
}

impl RepairKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Generate => "generate",
        }
    }

    pub fn terminal_route(self) -> Route {
        match self {
            Self::Edit => Route::B,
            Self::Generate => Route::C,
        }
    }

    pub fn next_action(self) -> NextAction {
        match self {
            Self::Edit => NextAction::Edit,
            Self::Generate => NextAction::Generate,
        }
    }

    /// File-name prefix for produced candidates.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Generate => "gen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    Output,
    Edit,
    Generate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionFeedback {
    pub why: Vec<String>,
    pub next_action: NextAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_thresholds: Option<AcceptanceThresholds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RepairKind>,
}

impl DecisionFeedback {
    pub fn accepted() -> Self {
        Self {
            why: vec![String::from("meets relevance, reality, integrity")],
            next_action: NextAction::Output,
            required_changes: Vec::new(),
            acceptance_thresholds: None,
            strategy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSubject {
    Original(Fingerprint),
    Candidate(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub route: Route,
    pub chosen: Option<DecisionSubject>,
    pub feedback: DecisionFeedback,
}

impl Decision {
    pub fn chosen_fingerprint(&self) -> Option<&Fingerprint> {
        match self.chosen.as_ref() {
            Some(DecisionSubject::Original(fingerprint)) => Some(fingerprint),
            _ => None,
        }
    }
}

/// Opaque, strategy-specific instructions handed unmodified to a repair
/// capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionPlan {
    pub kind: RepairKind,
    pub body: Value,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub path: PathBuf,
    pub strategy: RepairKind,
    pub retry_index: u32,
    pub plan: RevisionPlan,
    pub fallback: bool,
    pub verdict: Option<VerdictRecord>,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BestWarning {
    MaxRetriesReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub generated: bool,
    pub path: Option<PathBuf>,
    pub source_fingerprint: Option<Fingerprint>,
    pub final_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<BestWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMetadata {
    pub run_id: String,
    pub product_id: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStateError {
    #[error("best result for run '{0}' is already set")]
    BestAlreadySet(String),
    #[error("route {0} is not a terminal route letter")]
    NotTerminal(&'static str),
}

/// Aggregate root for one workflow execution.
#[derive(Debug, Clone)]
pub struct RunState {
    metadata: RunMetadata,
    inputs: Vec<ImageInput>,
    approvals: HashMap<Fingerprint, VerdictRecord>,
    decision: Option<Decision>,
    retry_count: u32,
    candidates: Vec<Candidate>,
    best: Option<BestResult>,
    messages: Vec<TraceMessage>,
}

impl RunState {
    pub fn new(metadata: RunMetadata, inputs: Vec<ImageInput>) -> Self {
        Self {
            metadata,
            inputs,
            approvals: HashMap::new(),
            decision: None,
            retry_count: 0,
            candidates: Vec::new(),
            best: None,
            messages: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn run_id(&self) -> &str {
        self.metadata.run_id.as_str()
    }

    pub fn category(&self) -> &str {
        self.metadata.category.as_str()
    }

    pub fn inputs(&self) -> &[ImageInput] {
        self.inputs.as_slice()
    }

    pub fn input(&self, fingerprint: &Fingerprint) -> Option<&ImageInput> {
        self.inputs
            .iter()
            .find(|input| input.fingerprint() == fingerprint)
    }

    pub fn approvals(&self) -> &HashMap<Fingerprint, VerdictRecord> {
        &self.approvals
    }

    pub fn approval(&self, fingerprint: &Fingerprint) -> Option<&VerdictRecord> {
        self.approvals.get(fingerprint)
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn candidates(&self) -> &[Candidate] {
        self.candidates.as_slice()
    }

    pub fn latest_candidate(&self) -> Option<&Candidate> {
        self.candidates.last()
    }

    pub fn best(&self) -> Option<&BestResult> {
        self.best.as_ref()
    }

    pub fn messages(&self) -> &[TraceMessage] {
        self.messages.as_slice()
    }

    pub fn is_complete(&self) -> bool {
        self.best.is_some()
            && self
                .decision
                .as_ref()
                .is_some_and(|decision| decision.route.is_terminal())
    }

    pub(crate) fn record_approvals(&mut self, approvals: HashMap<Fingerprint, VerdictRecord>) {
        self.approvals = approvals;
    }

    pub(crate) fn set_decision(&mut self, decision: Decision) {
        self.decision = Some(decision);
    }

    pub(crate) fn decision_mut(&mut self) -> Option<&mut Decision> {
        self.decision.as_mut()
    }

    pub(crate) fn reset_retries(&mut self) {
        self.retry_count = 0;
    }

    pub(crate) fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    pub(crate) fn push_candidate(&mut self, candidate: Candidate) {
        self.candidates.push(candidate);
    }

    pub(crate) fn latest_candidate_mut(&mut self) -> Option<&mut Candidate> {
        self.candidates.last_mut()
    }

    /// Sets the final result and terminal route letter. Allowed once per run.
    pub(crate) fn finalize(&mut self, best: BestResult, route: Route) -> Result<(), RunStateError> {
        if self.best.is_some() {
            return Err(RunStateError::BestAlreadySet(self.metadata.run_id.clone()));
        }
        if !route.is_terminal() {
            return Err(RunStateError::NotTerminal(route.as_str()));
        }
        if let Some(path) = best.path.as_ref() {
            for candidate in self.candidates.iter_mut() {
                candidate.accepted = &candidate.path == path;
            }
        }
        match self.decision.as_mut() {
            Some(decision) => decision.route = route,
            None => {
                self.decision = Some(Decision {
                    route,
                    chosen: None,
                    feedback: DecisionFeedback::accepted(),
                })
            }
        }
        self.best = Some(best);
        Ok(())
    }

    pub(crate) fn push_message(&mut self, role: MessageRole, content: impl Into<String>) {
        self.messages.push(TraceMessage {
            role,
            content: content.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> RunMetadata {
        RunMetadata {
            run_id: String::from("run_test"),
            product_id: String::from("sku-1"),
            category: String::from(DEFAULT_CATEGORY),
        }
    }

    fn best(path: Option<&str>) -> BestResult {
        BestResult {
            generated: path.is_some(),
            path: path.map(PathBuf::from),
            source_fingerprint: None,
            final_score: 0.5,
            warning: None,
        }
    }

    #[test]
    fn fingerprint_is_sha256_hex_of_bytes() {
        let fp = Fingerprint::of_bytes(b"abc");
        assert_eq!(
            fp.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fp, Fingerprint::of_bytes(b"abc"));
        assert_ne!(fp, Fingerprint::of_bytes(b"abd"));
    }

    #[test]
    fn route_serializes_with_wire_vocabulary() {
        assert_eq!(
            serde_json::to_value(Route::NeedsCompleteChange).expect("route should serialize"),
            serde_json::json!("NEEDS_COMPLETE_CHANGE")
        );
        assert_eq!(
            serde_json::to_value(Route::B).expect("route should serialize"),
            serde_json::json!("B")
        );
        assert_eq!(Route::parse_recommendation(" needs_edit "), Some(Route::NeedsEdit));
        assert_eq!(Route::parse_recommendation("B"), None);
    }

    #[test]
    fn finalize_sets_best_once_and_marks_matching_candidate() {
        let mut state = RunState::new(metadata(), Vec::new());
        for (idx, path) in ["out/a.png", "out/b.png"].iter().enumerate() {
            state.push_candidate(Candidate {
                path: PathBuf::from(path),
                strategy: RepairKind::Edit,
                retry_index: idx as u32,
                plan: RevisionPlan {
                    kind: RepairKind::Edit,
                    body: serde_json::json!({}),
                    is_default: true,
                },
                fallback: false,
                verdict: None,
                accepted: false,
            });
        }

        state
            .finalize(best(Some("out/b.png")), Route::B)
            .expect("first finalize should succeed");
        assert!(!state.candidates()[0].accepted);
        assert!(state.candidates()[1].accepted);
        assert!(state.is_complete());
        assert_eq!(state.decision().map(|d| d.route), Some(Route::B));

        let err = state
            .finalize(best(None), Route::A)
            .expect_err("second finalize should fail");
        assert_eq!(err, RunStateError::BestAlreadySet(String::from("run_test")));
    }

    #[test]
    fn finalize_rejects_non_terminal_routes() {
        let mut state = RunState::new(metadata(), Vec::new());
        let err = state
            .finalize(best(None), Route::Approved)
            .expect_err("non-terminal route should fail");
        assert_eq!(err, RunStateError::NotTerminal("APPROVED"));
        assert!(state.best().is_none());
    }
}
