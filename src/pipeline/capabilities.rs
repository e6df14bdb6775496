use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::state::{DecisionFeedback, RepairKind, RevisionPlan};

/// One call to the image-understanding capability. Responses are raw model
/// text; decoding them is the evaluator's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnderstandingRequest<'a> {
    pub category: &'a str,
    pub system_prompt: &'a str,
    pub user_prompt: String,
    pub images: Vec<&'a [u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanningRequest<'a> {
    pub kind: RepairKind,
    pub category: &'a str,
    pub feedback: &'a DecisionFeedback,
    pub system_prompt: &'a str,
    pub user_prompt: String,
}

pub trait UnderstandingCapability: Send + Sync + 'static {
    fn evaluate(&self, request: &UnderstandingRequest<'_>) -> Result<String, CapabilityError>;
}

pub trait PlanningCapability: Send + Sync + 'static {
    fn plan(&self, request: &PlanningRequest<'_>) -> Result<String, CapabilityError>;
}

/// `Ok(None)` means the capability answered without producing an image.
pub trait EditCapability: Send + Sync + 'static {
    fn edit(
        &self,
        plan: &RevisionPlan,
        base_image: &[u8],
    ) -> Result<Option<Vec<u8>>, CapabilityError>;
}

pub trait GenerationCapability: Send + Sync + 'static {
    fn generate(
        &self,
        plan: &RevisionPlan,
        category: &str,
    ) -> Result<Option<Vec<u8>>, CapabilityError>;
}

pub type SharedUnderstandingCapability = Arc<dyn UnderstandingCapability>;
pub type SharedPlanningCapability = Arc<dyn PlanningCapability>;
pub type SharedEditCapability = Arc<dyn EditCapability>;
pub type SharedGenerationCapability = Arc<dyn GenerationCapability>;

#[derive(Clone)]
pub struct ModelCapabilities {
    pub understanding: SharedUnderstandingCapability,
    pub planning: SharedPlanningCapability,
    pub editing: SharedEditCapability,
    pub generation: SharedGenerationCapability,
}

impl ModelCapabilities {
    /// Wires one adapter that implements every model capability.
    pub fn from_single<T>(adapter: Arc<T>) -> Self
    where
        T: UnderstandingCapability
            + PlanningCapability
            + EditCapability
            + GenerationCapability,
    {
        Self {
            understanding: adapter.clone(),
            planning: adapter.clone(),
            editing: adapter.clone(),
            generation: adapter,
        }
    }
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability is not configured: {0}")]
    NotConfigured(String),
    #[error("capability request failed: {0}")]
    Transport(String),
    #[error("capability returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("capability response could not be decoded: {0}")]
    Decode(String),
}
