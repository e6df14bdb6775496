use serde::{Deserialize, Serialize};

pub const RELEVANCE_PASS: f64 = 0.80;
pub const REALITY_PASS: f64 = 0.70;
pub const INTEGRITY_PASS: f64 = 0.95;
/// Advisory only; never part of the acceptance gate.
pub const QUALITY_SOFT: f64 = 0.50;

pub const WEIGHT_RELEVANCE: f64 = 0.70;
pub const WEIGHT_REALITY: f64 = 0.20;
pub const WEIGHT_QUALITY: f64 = 0.10;

/// Relevance threshold used to prefer a touch-up edit over full regeneration
/// when the understanding capability gives no usable recommendation.
pub const EDIT_HEURISTIC_RELEVANCE: f64 = 0.60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceThresholds {
    pub relevance: f64,
    pub reality: f64,
    pub integrity: f64,
}

impl AcceptanceThresholds {
    pub const fn policy() -> Self {
        Self {
            relevance: RELEVANCE_PASS,
            reality: REALITY_PASS,
            integrity: INTEGRITY_PASS,
        }
    }
}

/// Weighted suitability score. Inputs are taken as given, without clamping.
pub fn score(relevance: f64, reality: f64, quality: f64) -> f64 {
    WEIGHT_RELEVANCE * relevance + WEIGHT_REALITY * reality + WEIGHT_QUALITY * quality
}

pub fn is_acceptable(relevance: f64, reality: f64, integrity: f64) -> bool {
    relevance >= RELEVANCE_PASS && reality >= REALITY_PASS && integrity >= INTEGRITY_PASS
}

/// Human-readable list of the gate dimensions (and the advisory quality
/// signal) that fall short of policy.
pub fn shortcomings(relevance: f64, reality: f64, integrity: f64, quality: f64) -> Vec<String> {
    let mut out = Vec::new();
    if relevance < RELEVANCE_PASS {
        out.push(format!("relevance {relevance:.2} below {RELEVANCE_PASS:.2}"));
    }
    if reality < REALITY_PASS {
        out.push(format!("reality {reality:.2} below {REALITY_PASS:.2}"));
    }
    if integrity < INTEGRITY_PASS {
        out.push(format!("integrity {integrity:.2} below {INTEGRITY_PASS:.2}"));
    }
    if quality < QUALITY_SOFT {
        out.push(format!("quality {quality:.2} below advisory {QUALITY_SOFT:.2}"));
    }
    out
}

pub fn round_to_3(value: f64) -> f64 {
    (value * 1_000.0).round() / 1_000.0
}
