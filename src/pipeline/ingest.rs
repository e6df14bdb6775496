use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::pipeline::state::{
    ImageInput, ImageProvenance, MessageRole, RunMetadata, RunState, DEFAULT_CATEGORY,
};

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;

/// One image locator in a run request: `{"url": ...}` or inline base64 as
/// `{"b64": ...}` / `{"base64": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageDescriptor {
    Remote {
        url: String,
    },
    Inline {
        #[serde(alias = "base64")]
        b64: String,
    },
}

impl ImageDescriptor {
    pub fn provenance(&self) -> ImageProvenance {
        match self {
            Self::Remote { url } => ImageProvenance::Remote { url: url.clone() },
            Self::Inline { .. } => ImageProvenance::Inline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub product_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageDescriptor>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("run request must include at least one image")]
    EmptyImageList,
    #[error("run request product_id must not be empty")]
    MissingProductId,
    #[error("image url '{url}' is invalid: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("image url '{0}' must use http or https")]
    UnsupportedScheme(String),
    #[error("failed to fetch image '{url}': {message}")]
    Fetch { url: String, message: String },
    #[error("image fetch '{url}' returned HTTP {status}")]
    Http { url: String, status: u16 },
    #[error("inline image is not valid base64: {0}")]
    Base64(String),
    #[error("image {index} is empty")]
    EmptyImage { index: usize },
}

pub trait ImageSource: Send + Sync + 'static {
    fn fetch(&self, descriptor: &ImageDescriptor) -> Result<Vec<u8>, IngestError>;
}

pub type SharedImageSource = Arc<dyn ImageSource>;

#[derive(Clone)]
pub struct HttpImageSource {
    http: Client,
}

impl HttpImageSource {
    pub fn new(timeout: Duration) -> Result<Self, IngestError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Fetch {
                url: String::new(),
                message: format!("http client init failed: {e}"),
            })?;
        Ok(Self { http })
    }

    pub fn with_default_timeout() -> Result<Self, IngestError> {
        Self::new(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS))
    }

    fn fetch_remote(&self, raw_url: &str) -> Result<Vec<u8>, IngestError> {
        let url = validate_image_url(raw_url)?;
        debug!(url = url.as_str(), "fetching image");
        let resp = self
            .http
            .get(url.clone())
            .send()
            .map_err(|e| IngestError::Fetch {
                url: raw_url.to_string(),
                message: e.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(IngestError::Http {
                url: raw_url.to_string(),
                status: status.as_u16(),
            });
        }
        resp.bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|e| IngestError::Fetch {
                url: raw_url.to_string(),
                message: e.to_string(),
            })
    }
}

impl ImageSource for HttpImageSource {
    fn fetch(&self, descriptor: &ImageDescriptor) -> Result<Vec<u8>, IngestError> {
        match descriptor {
            ImageDescriptor::Remote { url } => self.fetch_remote(url.as_str()),
            ImageDescriptor::Inline { b64 } => decode_inline_image(b64.as_str()),
        }
    }
}

pub fn validate_image_url(raw: &str) -> Result<Url, IngestError> {
    let url = Url::parse(raw.trim()).map_err(|e| IngestError::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(IngestError::UnsupportedScheme(raw.to_string())),
    }
}

/// Decodes standard base64, tolerating a `data:` URL prefix and embedded
/// whitespace.
pub fn decode_inline_image(raw: &str) -> Result<Vec<u8>, IngestError> {
    let trimmed = raw.trim();
    let payload = match trimmed.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => trimmed,
    };
    let compact = payload
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>();
    BASE64_STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| IngestError::Base64(e.to_string()))
}

pub fn resolve_run_id(requested: Option<&str>) -> String {
    requested
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("run_{}", Uuid::new_v4().simple()))
}

/// Fetches every image up front; any failure aborts before a run state exists.
pub fn ingest_request(
    source: &dyn ImageSource,
    request: &RunRequest,
) -> Result<RunState, IngestError> {
    let product_id = request.product_id.trim();
    if product_id.is_empty() {
        return Err(IngestError::MissingProductId);
    }
    if request.images.is_empty() {
        return Err(IngestError::EmptyImageList);
    }

    let mut inputs = Vec::with_capacity(request.images.len());
    for (index, descriptor) in request.images.iter().enumerate() {
        let bytes = source.fetch(descriptor)?;
        if bytes.is_empty() {
            return Err(IngestError::EmptyImage { index });
        }
        inputs.push(ImageInput::new(bytes, descriptor.provenance()));
    }

    let category = request
        .category
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CATEGORY)
        .to_string();
    let metadata = RunMetadata {
        run_id: resolve_run_id(request.run_id.as_deref()),
        product_id: product_id.to_string(),
        category,
    };
    let count = inputs.len();
    let mut state = RunState::new(metadata, inputs);
    state.push_message(MessageRole::System, format!("Ingested {count} images"));
    info!(
        run_id = state.run_id(),
        product_id,
        category = state.category(),
        images = count,
        "run ingested"
    );
    Ok(state)
}
