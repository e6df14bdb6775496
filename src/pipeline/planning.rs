use serde_json::{json, Value};
use thiserror::Error;

use crate::pipeline::approval::strip_code_fence;
use crate::pipeline::prompts::acceptance_sentence;
use crate::pipeline::state::{RepairKind, RevisionPlan};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanParseError {
    #[error("revision plan response is empty")]
    Empty,
    #[error("revision plan response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("revision plan must be a JSON object")]
    RootMustBeObject,
    #[error("revision plan object must not be empty")]
    EmptyObject,
}

pub fn default_edit_plan() -> RevisionPlan {
    RevisionPlan {
        kind: RepairKind::Edit,
        body: json!({
            "mode": "quality_edit",
            "keep_product_pixels": true,
            "operations": [
                "exposure_correct",
                "white_balance",
                "mild_denoise",
                "mild_sharpen",
                "neutral_studio_bg",
                "soft_shadow",
                "center_crop_1x1"
            ],
            "hard_negatives": ["cartoon", "CGI"],
            "acceptance": acceptance_sentence(),
        }),
        is_default: true,
    }
}

pub fn default_generate_plan() -> RevisionPlan {
    RevisionPlan {
        kind: RepairKind::Generate,
        body: json!({
            "mode": "compose_new",
            "scene": "presenter_holding",
            "background": "neutral_studio_offwhite",
            "camera": "front",
            "lighting": "soft",
            "crop": "1x1 centered",
            "preserve": ["color", "pattern", "silhouette"],
            "forbid": ["logos", "CGI vibe"],
        }),
        is_default: true,
    }
}

pub fn default_plan(kind: RepairKind) -> RevisionPlan {
    match kind {
        RepairKind::Edit => default_edit_plan(),
        RepairKind::Generate => default_generate_plan(),
    }
}

/// Decodes a planning response into a plan body. The body stays opaque; only
/// its outer shape is checked.
pub fn parse_revision_plan(kind: RepairKind, raw: &str) -> Result<RevisionPlan, PlanParseError> {
    let body = strip_code_fence(raw);
    if body.is_empty() {
        return Err(PlanParseError::Empty);
    }
    let value = serde_json::from_str::<Value>(body)
        .map_err(|error| PlanParseError::InvalidJson(error.to_string()))?;
    let object = value.as_object().ok_or(PlanParseError::RootMustBeObject)?;
    if object.is_empty() {
        return Err(PlanParseError::EmptyObject);
    }
    Ok(RevisionPlan {
        kind,
        body: value,
        is_default: false,
    })
}
