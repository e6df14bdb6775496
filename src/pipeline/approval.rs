use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::pipeline::capabilities::{SharedUnderstandingCapability, UnderstandingRequest};
use crate::pipeline::prompts;
use crate::pipeline::scoring::{AcceptanceThresholds, EDIT_HEURISTIC_RELEVANCE};
use crate::pipeline::state::{
    Decision, DecisionFeedback, DecisionSubject, Fingerprint, MessageRole, RepairKind, Route,
    RunState, Verdict, VerdictRecord,
};

pub const PARSE_ERROR_REASON: &str = "llm_parse_error";
pub const MISSING_VERDICT_REASON: &str = "missing_verdict";
const UNSUITABLE_REASON: &str = "not suitable as feed cover";
const BRIEF_FALLBACK: &str = "see per-image reasons";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerImageEntry {
    #[serde(default, alias = "fingerprint", skip_serializing_if = "Option::is_none")]
    pub image_hash: Option<String>,
    #[serde(default)]
    pub relevance: f64,
    #[serde(default)]
    pub reality: f64,
    #[serde(default)]
    pub integrity: f64,
    #[serde(default)]
    pub quality: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl PerImageEntry {
    fn to_record(&self) -> VerdictRecord {
        VerdictRecord {
            relevance: self.relevance,
            reality: self.reality,
            integrity: self.integrity,
            quality: self.quality,
            verdict: self
                .verdict
                .as_deref()
                .and_then(parse_verdict)
                .unwrap_or_default(),
            reasons: self.reasons.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRecommendation {
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default, alias = "chosen_fingerprint")]
    pub chosen_image_hash: Option<String>,
    #[serde(default)]
    pub edit_brief: Option<String>,
    #[serde(default)]
    pub gen_brief: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnderstandingPayload {
    #[serde(default)]
    pub per_image: Vec<PerImageEntry>,
    #[serde(default)]
    pub global: GlobalRecommendation,
}

impl UnderstandingPayload {
    /// Synthesized when the capability gives nothing decodable.
    pub fn fail_open(fingerprints: &[&Fingerprint]) -> Self {
        Self {
            per_image: fingerprints
                .iter()
                .map(|fp| PerImageEntry {
                    image_hash: Some(fp.to_string()),
                    verdict: Some(Verdict::NeedsCompleteChange.as_str().to_string()),
                    reasons: vec![PARSE_ERROR_REASON.to_string()],
                    ..PerImageEntry::default()
                })
                .collect(),
            global: GlobalRecommendation {
                decision: Some(Route::NeedsCompleteChange.as_str().to_string()),
                chosen_image_hash: None,
                edit_brief: None,
                gen_brief: Some(String::from("could not parse")),
            },
        }
    }
}

fn parse_verdict(value: &str) -> Option<Verdict> {
    match value.trim().to_ascii_uppercase().as_str() {
        "APPROVE" | "APPROVED" => Some(Verdict::Approve),
        "NEEDS_EDIT" => Some(Verdict::NeedsEdit),
        "NEEDS_COMPLETE_CHANGE" => Some(Verdict::NeedsCompleteChange),
        _ => None,
    }
}

/// Removes a surrounding markdown code fence (optionally tagged `json`).
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    let rest = rest.trim_start();
    let tagged = rest
        .get(..4)
        .is_some_and(|tag| tag.eq_ignore_ascii_case("json"));
    let rest = if tagged { &rest[4..] } else { rest };
    rest.trim()
}

pub fn parse_understanding_response(raw: &str) -> Option<UnderstandingPayload> {
    let body = strip_code_fence(raw);
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<UnderstandingPayload>(body) {
        Ok(payload) => Some(payload),
        Err(error) => {
            debug!(%error, "understanding response is not the expected JSON shape");
            None
        }
    }
}

/// Pairs one record with every input. Entries naming a known fingerprint are
/// matched first; the rest fill unmatched inputs in order. Inputs left over get
/// a fail-open record.
pub fn assign_verdicts(
    fingerprints: &[&Fingerprint],
    entries: &[PerImageEntry],
) -> Vec<(Fingerprint, VerdictRecord)> {
    let mut slots: Vec<Option<VerdictRecord>> = vec![None; fingerprints.len()];
    let mut leftovers = Vec::new();

    for entry in entries {
        let matched = entry.image_hash.as_deref().and_then(|hash| {
            fingerprints
                .iter()
                .position(|fp| fp.as_str().eq_ignore_ascii_case(hash.trim()))
        });
        match matched {
            Some(idx) if slots[idx].is_none() => slots[idx] = Some(entry.to_record()),
            _ => leftovers.push(entry),
        }
    }

    let mut leftovers = leftovers.into_iter();
    for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
        match leftovers.next() {
            Some(entry) => *slot = Some(entry.to_record()),
            None => break,
        }
    }

    fingerprints
        .iter()
        .zip(slots)
        .map(|(fp, slot)| {
            (
                (*fp).clone(),
                slot.unwrap_or_else(|| VerdictRecord::fail_open(MISSING_VERDICT_REASON)),
            )
        })
        .collect()
}

/// Routing over verdicts in input order.
///
/// The first acceptable image wins outright (first-match, not best-match).
/// Otherwise the recommendation is honoured when it names a repair route, and
/// the relevance heuristic decides when it does not.
pub fn route_decision(
    verdicts: &[(Fingerprint, VerdictRecord)],
    global: &GlobalRecommendation,
) -> Decision {
    let mut best: Option<(&Fingerprint, f64)> = None;
    let mut approved: Option<&Fingerprint> = None;

    for (fingerprint, record) in verdicts {
        let score = record.score();
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((fingerprint, score));
        }
        if approved.is_none() && record.is_acceptable() {
            approved = Some(fingerprint);
        }
    }

    if let Some(fingerprint) = approved {
        return Decision {
            route: Route::Approved,
            chosen: Some(DecisionSubject::Original(fingerprint.clone())),
            feedback: DecisionFeedback::accepted(),
        };
    }

    let route = match global
        .decision
        .as_deref()
        .and_then(Route::parse_recommendation)
    {
        Some(route @ (Route::NeedsEdit | Route::NeedsCompleteChange)) => route,
        _ => {
            if verdicts
                .iter()
                .any(|(_, record)| record.relevance >= EDIT_HEURISTIC_RELEVANCE)
            {
                Route::NeedsEdit
            } else {
                Route::NeedsCompleteChange
            }
        }
    };

    let mut why = Vec::<String>::new();
    for (_, record) in verdicts {
        for reason in &record.reasons {
            let reason = reason.trim();
            if !reason.is_empty() && !why.iter().any(|seen| seen == reason) {
                why.push(reason.to_string());
            }
        }
    }
    if why.is_empty() {
        why.push(String::from(UNSUITABLE_REASON));
    }

    let (primary_brief, secondary_brief) = if route == Route::NeedsEdit {
        (global.edit_brief.as_deref(), global.gen_brief.as_deref())
    } else {
        (global.gen_brief.as_deref(), global.edit_brief.as_deref())
    };
    let brief = primary_brief
        .or(secondary_brief)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(BRIEF_FALLBACK)
        .to_string();

    let strategy = if route == Route::NeedsEdit {
        RepairKind::Edit
    } else {
        RepairKind::Generate
    };

    Decision {
        route,
        chosen: best.map(|(fp, _)| DecisionSubject::Original(fp.clone())),
        feedback: DecisionFeedback {
            why,
            next_action: strategy.next_action(),
            required_changes: vec![brief],
            acceptance_thresholds: Some(AcceptanceThresholds::policy()),
            strategy: None,
        },
    }
}

#[derive(Clone)]
pub struct ApprovalEvaluator {
    understanding: SharedUnderstandingCapability,
}

impl ApprovalEvaluator {
    pub fn new(understanding: SharedUnderstandingCapability) -> Self {
        Self { understanding }
    }

    /// Initial pass over every original image. Records one verdict per input,
    /// sets the decision and resets the retry counter.
    pub fn evaluate_originals(&self, state: &mut RunState) {
        let fingerprints = state
            .inputs()
            .iter()
            .map(|input| input.fingerprint())
            .collect::<Vec<_>>();
        let hashes = fingerprints.iter().map(|fp| fp.as_str()).collect::<Vec<_>>();

        let request = UnderstandingRequest {
            category: state.category(),
            system_prompt: prompts::APPROVAL_SYSTEM,
            user_prompt: prompts::approval_user_prompt(state.category(), hashes.as_slice()),
            images: state.inputs().iter().map(|input| input.bytes()).collect(),
        };

        let payload = match self.understanding.evaluate(&request) {
            Ok(raw) => parse_understanding_response(raw.as_str()),
            Err(error) => {
                warn!(run_id = state.run_id(), %error, "understanding call failed; failing open");
                None
            }
        };
        let payload = payload.unwrap_or_else(|| {
            warn!(
                run_id = state.run_id(),
                "approval response unusable; all images need a complete change"
            );
            UnderstandingPayload::fail_open(fingerprints.as_slice())
        });

        let verdicts = assign_verdicts(fingerprints.as_slice(), payload.per_image.as_slice());
        let decision = route_decision(verdicts.as_slice(), &payload.global);
        info!(
            run_id = state.run_id(),
            route = decision.route.as_str(),
            images = verdicts.len(),
            "initial approval routed"
        );

        let trace = json!({ "approval": payload }).to_string();
        let approvals = verdicts.into_iter().collect::<HashMap<_, _>>();
        state.record_approvals(approvals);
        state.set_decision(decision);
        state.reset_retries();
        state.push_message(MessageRole::Assistant, trace);
    }

    /// Single-image pass for one repair candidate.
    pub fn reevaluate_candidate(&self, category: &str, image: &[u8]) -> VerdictRecord {
        let request = UnderstandingRequest {
            category,
            system_prompt: prompts::APPROVAL_SYSTEM,
            user_prompt: prompts::reapproval_user_prompt(category),
            images: vec![image],
        };
        let payload = match self.understanding.evaluate(&request) {
            Ok(raw) => parse_understanding_response(raw.as_str()),
            Err(error) => {
                warn!(%error, "candidate re-evaluation call failed; treating as not approved");
                None
            }
        };
        payload
            .and_then(|payload| payload.per_image.first().map(PerImageEntry::to_record))
            .unwrap_or_else(|| VerdictRecord::fail_open(PARSE_ERROR_REASON))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fp(label: &str) -> Fingerprint {
        Fingerprint::of_bytes(label.as_bytes())
    }

    fn entry(hash: Option<&Fingerprint>, rel: f64, real: f64, integ: f64) -> PerImageEntry {
        PerImageEntry {
            image_hash: hash.map(|fp| fp.to_string()),
            relevance: rel,
            reality: real,
            integrity: integ,
            quality: 0.5,
            verdict: Some(String::from("NEEDS_EDIT")),
            reasons: Vec::new(),
        }
    }

    fn record(rel: f64, real: f64, integ: f64, quality: f64) -> VerdictRecord {
        VerdictRecord {
            relevance: rel,
            reality: real,
            integrity: integ,
            quality,
            verdict: Verdict::NeedsEdit,
            reasons: Vec::new(),
        }
    }

    #[test]
    fn strips_json_code_fences() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```JSON{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[]\n```"), "[]");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn multibyte_text_after_a_fence_is_unparsable_not_a_panic() {
        assert_eq!(strip_code_fence("```€€ not json"), "€€ not json");
        assert_eq!(strip_code_fence("```日本語```"), "日本語");
        assert!(parse_understanding_response("```€€ not json").is_none());
        assert!(parse_understanding_response("```js€").is_none());
    }

    #[test]
    fn parses_fenced_payload_and_tolerates_unknown_verdicts() {
        let raw = r#"```json
        {"per_image":[{"image_hash":"x","relevance":0.9,"reality":0.8,"integrity":1.0,
          "quality":0.4,"verdict":"maybe","reasons":["ok"]}],
         "global":{"decision":"APPROVED","chosen_image_hash":"x"}}
        ```"#;
        let payload = parse_understanding_response(raw).expect("payload should parse");
        assert_eq!(payload.per_image.len(), 1);
        assert_eq!(
            payload.per_image[0].to_record().verdict,
            Verdict::NeedsCompleteChange
        );
        assert_eq!(payload.global.decision.as_deref(), Some("APPROVED"));
    }

    #[test]
    fn rejects_non_json_responses() {
        assert!(parse_understanding_response("I cannot help with that").is_none());
        assert!(parse_understanding_response("").is_none());
        assert!(parse_understanding_response("[1,2,3]").is_none());
    }

    #[test]
    fn assign_verdicts_matches_by_fingerprint_then_by_position() {
        let a = fp("a");
        let b = fp("b");
        let c = fp("c");
        let entries = vec![
            entry(Some(&c), 0.3, 0.0, 0.0),
            entry(None, 0.1, 0.0, 0.0),
            entry(Some(&fp("unknown")), 0.2, 0.0, 0.0),
        ];

        let verdicts = assign_verdicts(&[&a, &b, &c], entries.as_slice());

        assert_eq!(verdicts.len(), 3);
        assert_eq!(verdicts[0].0, a);
        assert_eq!(verdicts[0].1.relevance, 0.1);
        assert_eq!(verdicts[1].1.relevance, 0.2);
        assert_eq!(verdicts[2].1.relevance, 0.3);
    }

    #[test]
    fn assign_verdicts_fails_open_for_inputs_without_entries() {
        let a = fp("a");
        let b = fp("b");
        let verdicts = assign_verdicts(&[&a, &b], &[entry(Some(&a), 0.9, 0.9, 0.9)]);
        assert_eq!(verdicts[1].1, VerdictRecord::fail_open(MISSING_VERDICT_REASON));
    }

    #[test]
    fn approves_the_first_acceptable_image_even_when_a_later_one_scores_higher() {
        let a = fp("a");
        let b = fp("b");
        let verdicts = vec![
            (a.clone(), record(0.81, 0.71, 0.96, 0.0)),
            (b.clone(), record(1.0, 1.0, 1.0, 1.0)),
        ];
        let decision = route_decision(verdicts.as_slice(), &GlobalRecommendation::default());
        assert_eq!(decision.route, Route::Approved);
        assert_eq!(decision.chosen_fingerprint(), Some(&a));
        assert_eq!(decision.feedback, DecisionFeedback::accepted());
    }

    #[test]
    fn honours_repair_recommendation_from_the_capability() {
        let a = fp("a");
        let verdicts = vec![(a.clone(), record(0.9, 0.2, 0.99, 0.5))];
        let global = GlobalRecommendation {
            decision: Some(String::from("NEEDS_COMPLETE_CHANGE")),
            gen_brief: Some(String::from("reshoot on model")),
            ..GlobalRecommendation::default()
        };
        let decision = route_decision(verdicts.as_slice(), &global);
        assert_eq!(decision.route, Route::NeedsCompleteChange);
        assert_eq!(decision.feedback.required_changes, vec!["reshoot on model"]);
    }

    #[test]
    fn ignores_approved_recommendation_when_no_image_passes() {
        let verdicts = vec![(fp("a"), record(0.65, 0.2, 0.5, 0.5))];
        let global = GlobalRecommendation {
            decision: Some(String::from("APPROVED")),
            ..GlobalRecommendation::default()
        };
        let decision = route_decision(verdicts.as_slice(), &global);
        assert_eq!(decision.route, Route::NeedsEdit);
    }

    #[test]
    fn heuristic_chooses_edit_or_complete_change_by_relevance() {
        let edit = route_decision(
            &[
                (fp("a"), record(0.2, 0.9, 0.9, 0.9)),
                (fp("b"), record(0.65, 0.1, 0.1, 0.1)),
            ],
            &GlobalRecommendation::default(),
        );
        assert_eq!(edit.route, Route::NeedsEdit);

        let regenerate = route_decision(
            &[
                (fp("a"), record(0.59, 0.9, 0.9, 0.9)),
                (fp("b"), record(0.1, 0.1, 0.1, 0.1)),
            ],
            &GlobalRecommendation::default(),
        );
        assert_eq!(regenerate.route, Route::NeedsCompleteChange);
    }

    #[test]
    fn repair_feedback_carries_reasons_brief_and_thresholds() {
        let a = fp("a");
        let b = fp("b");
        let mut first = record(0.3, 0.9, 0.9, 0.9);
        first.reasons = vec![String::from("busy background"), String::from("cropped")];
        let mut second = record(0.5, 0.9, 0.9, 0.9);
        second.reasons = vec![String::from("cropped"), String::from("dark")];

        let decision = route_decision(
            &[(a, first), (b.clone(), second)],
            &GlobalRecommendation::default(),
        );

        assert_eq!(decision.route, Route::NeedsCompleteChange);
        assert_eq!(decision.chosen_fingerprint(), Some(&b));
        assert_eq!(
            decision.feedback.why,
            vec!["busy background", "cropped", "dark"]
        );
        assert_eq!(decision.feedback.required_changes, vec![BRIEF_FALLBACK]);
        assert_eq!(
            decision.feedback.acceptance_thresholds,
            Some(AcceptanceThresholds::policy())
        );
    }

    #[test]
    fn best_candidate_keeps_first_maximum() {
        let a = fp("a");
        let b = fp("b");
        let decision = route_decision(
            &[
                (a.clone(), record(0.5, 0.5, 0.5, 0.5)),
                (b, record(0.5, 0.5, 0.5, 0.5)),
            ],
            &GlobalRecommendation::default(),
        );
        assert_eq!(decision.chosen_fingerprint(), Some(&a));
    }

    #[test]
    fn fail_open_payload_routes_to_complete_change() {
        let a = fp("a");
        let payload = UnderstandingPayload::fail_open(&[&a]);
        let verdicts = assign_verdicts(&[&a], payload.per_image.as_slice());
        assert_eq!(verdicts[0].1, VerdictRecord::fail_open(PARSE_ERROR_REASON));
        let decision = route_decision(verdicts.as_slice(), &payload.global);
        assert_eq!(decision.route, Route::NeedsCompleteChange);
        assert_eq!(decision.feedback.why, vec![PARSE_ERROR_REASON]);
    }
}
