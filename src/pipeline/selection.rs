use tracing::info;

use crate::pipeline::scoring::round_to_3;
use crate::pipeline::state::{BestResult, Fingerprint, Route, RunState, RunStateError};

/// First input with the maximum score, in input order. Inputs without a
/// verdict are skipped.
pub fn pick_best_original(state: &RunState) -> Option<(Fingerprint, f64)> {
    let mut best: Option<(&Fingerprint, f64)> = None;
    for input in state.inputs() {
        let Some(record) = state.approval(input.fingerprint()) else {
            continue;
        };
        let score = record.score();
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((input.fingerprint(), score));
        }
    }
    best.map(|(fingerprint, score)| (fingerprint.clone(), score))
}

/// Route A: the best-scoring original becomes the cover. The decision keeps
/// the image that passed approval as its favored subject.
pub fn select_best_original(state: &mut RunState) -> Result<Option<BestResult>, RunStateError> {
    let Some((fingerprint, score)) = pick_best_original(state) else {
        return Ok(None);
    };
    let best = BestResult {
        generated: false,
        path: None,
        source_fingerprint: Some(fingerprint.clone()),
        final_score: round_to_3(score),
        warning: None,
    };
    state.finalize(best.clone(), Route::A)?;
    info!(
        run_id = state.run_id(),
        fingerprint = fingerprint.as_str(),
        final_score = best.final_score,
        "original selected as cover"
    );
    Ok(Some(best))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{
        Decision, DecisionFeedback, ImageInput, ImageProvenance, RunMetadata, Verdict,
        VerdictRecord,
    };
    use std::collections::HashMap;

    fn record(rel: f64, real: f64, quality: f64) -> VerdictRecord {
        VerdictRecord {
            relevance: rel,
            reality: real,
            integrity: 1.0,
            quality,
            verdict: Verdict::Approve,
            reasons: Vec::new(),
        }
    }

    fn state_with(scores: &[(&[u8], VerdictRecord)]) -> RunState {
        let inputs = scores
            .iter()
            .map(|(bytes, _)| ImageInput::new(bytes.to_vec(), ImageProvenance::Inline))
            .collect::<Vec<_>>();
        let approvals = inputs
            .iter()
            .zip(scores.iter())
            .map(|(input, (_, record))| (input.fingerprint().clone(), record.clone()))
            .collect::<HashMap<_, _>>();
        let mut state = RunState::new(
            RunMetadata {
                run_id: String::from("run_sel"),
                product_id: String::from("sku"),
                category: String::from("bag"),
            },
            inputs,
        );
        state.record_approvals(approvals);
        state.set_decision(Decision {
            route: Route::Approved,
            chosen: None,
            feedback: DecisionFeedback::accepted(),
        });
        state
    }

    #[test]
    fn selects_highest_score_and_rounds() {
        let mut state = state_with(&[
            (&b"a"[..], record(0.81, 0.71, 0.0)),
            (&b"b"[..], record(0.9, 0.8, 0.55555)),
        ]);
        let best = select_best_original(&mut state)
            .expect("selection should succeed")
            .expect("a best image should exist");

        assert!(!best.generated);
        assert_eq!(best.source_fingerprint, Some(Fingerprint::of_bytes(b"b")));
        // 0.7*0.9 + 0.2*0.8 + 0.1*0.55555 = 0.845555
        assert_eq!(best.final_score, 0.846);
        assert_eq!(state.decision().map(|d| d.route), Some(Route::A));
        assert!(state.is_complete());
    }

    #[test]
    fn ties_keep_the_first_image() {
        let state = state_with(&[
            (&b"first"[..], record(0.5, 0.5, 0.5)),
            (&b"second"[..], record(0.5, 0.5, 0.5)),
        ]);
        let (fingerprint, _) = pick_best_original(&state).expect("best should exist");
        assert_eq!(fingerprint, Fingerprint::of_bytes(b"first"));
    }
}
