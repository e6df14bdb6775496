use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::pipeline::capabilities::{
    CapabilityError, EditCapability, GenerationCapability, PlanningCapability, PlanningRequest,
    UnderstandingCapability, UnderstandingRequest,
};
use crate::pipeline::prompts;
use crate::pipeline::state::RevisionPlan;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_VISION_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-preview-image-generation";

const API_KEY_HEADER: &str = "x-goog-api-key";
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_base: String,
    pub text_model: String,
    pub vision_model: String,
    pub image_model: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    http: Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, CapabilityError> {
        if config.api_key.trim().is_empty() {
            return Err(CapabilityError::NotConfigured(String::from(
                "GEMINI_API_KEY is not set",
            )));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CapabilityError::Transport(format!("http client init failed: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.api_base.trim_end_matches('/'),
            model
        )
    }

    /// Authenticates with a header; request URLs carry no secret.
    fn generate_content_request(&self, model: &str, body: &Value) -> RequestBuilder {
        self.http
            .post(self.endpoint(model))
            .header(API_KEY_HEADER, self.config.api_key.as_str())
            .json(body)
    }

    fn generate_content(
        &self,
        model: &str,
        body: &Value,
    ) -> Result<GenerateContentResponse, CapabilityError> {
        debug!(model, "calling generateContent");
        let resp = self
            .generate_content_request(model, body)
            .send()
            .map_err(|e| {
                CapabilityError::Transport(format!("Gemini request failed: {}", e.without_url()))
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(CapabilityError::Http {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<GenerateContentResponse>().map_err(|e| {
            CapabilityError::Decode(format!("Gemini JSON decode failed: {}", e.without_url()))
        })
    }

    fn image_call(
        &self,
        prompt: String,
        image: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, CapabilityError> {
        let images = image.into_iter().collect::<Vec<_>>();
        let body = build_generate_content_body(None, prompt.as_str(), images.as_slice(), true);
        let response = self.generate_content(self.config.image_model.as_str(), &body)?;
        first_inline_image(&response)
    }
}

impl UnderstandingCapability for GeminiClient {
    fn evaluate(&self, request: &UnderstandingRequest<'_>) -> Result<String, CapabilityError> {
        let body = build_generate_content_body(
            Some(request.system_prompt),
            request.user_prompt.as_str(),
            request.images.as_slice(),
            false,
        );
        let response = self.generate_content(self.config.vision_model.as_str(), &body)?;
        Ok(response_text(&response))
    }
}

impl PlanningCapability for GeminiClient {
    fn plan(&self, request: &PlanningRequest<'_>) -> Result<String, CapabilityError> {
        let body = build_generate_content_body(
            Some(request.system_prompt),
            request.user_prompt.as_str(),
            &[],
            false,
        );
        let response = self.generate_content(self.config.text_model.as_str(), &body)?;
        Ok(response_text(&response))
    }
}

impl EditCapability for GeminiClient {
    fn edit(
        &self,
        plan: &RevisionPlan,
        base_image: &[u8],
    ) -> Result<Option<Vec<u8>>, CapabilityError> {
        let prompt = format!(
            "{}\n\n{}",
            prompts::EDITOR_SYSTEM,
            prompts::editor_prompt(plan.body.to_string().as_str())
        );
        self.image_call(prompt, Some(base_image))
    }
}

impl GenerationCapability for GeminiClient {
    fn generate(
        &self,
        plan: &RevisionPlan,
        category: &str,
    ) -> Result<Option<Vec<u8>>, CapabilityError> {
        let prompt = format!(
            "{}\n\n{}",
            prompts::GENERATOR_SYSTEM,
            prompts::generator_prompt(plan.body.to_string().as_str(), category)
        );
        self.image_call(prompt, None)
    }
}

pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(PNG_MAGIC) {
        "image/png"
    } else {
        "image/jpeg"
    }
}

/// Image-output models reject system instructions, so callers fold them into
/// the prompt text and pass `None`.
pub fn build_generate_content_body(
    system_prompt: Option<&str>,
    user_prompt: &str,
    images: &[&[u8]],
    wants_image: bool,
) -> Value {
    let mut parts = vec![json!({ "text": user_prompt })];
    for image in images {
        parts.push(json!({
            "inline_data": {
                "mime_type": sniff_mime(image),
                "data": BASE64_STANDARD.encode(image),
            }
        }));
    }
    let mut body = json!({
        "contents": [{ "role": "user", "parts": parts }],
    });
    if let Some(system) = system_prompt {
        body["system_instruction"] = json!({ "parts": [{ "text": system }] });
    }
    if wants_image {
        body["generationConfig"] = json!({ "responseModalities": ["TEXT", "IMAGE"] });
    }
    body
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "inlineData", alias = "inline_data")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InlineData {
    #[serde(default)]
    data: String,
}

fn response_parts(response: &GenerateContentResponse) -> impl Iterator<Item = &ResponsePart> {
    response
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| content.parts.iter())
        .into_iter()
        .flatten()
}

pub fn response_text(response: &GenerateContentResponse) -> String {
    response_parts(response)
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

pub fn first_inline_image(
    response: &GenerateContentResponse,
) -> Result<Option<Vec<u8>>, CapabilityError> {
    let Some(data) = response_parts(response)
        .filter_map(|part| part.inline_data.as_ref())
        .map(|inline| inline.data.as_str())
        .find(|data| !data.is_empty())
    else {
        return Ok(None);
    };
    BASE64_STANDARD
        .decode(data.as_bytes())
        .map(Some)
        .map_err(|e| CapabilityError::Decode(format!("image base64 decode failed: {e}")))
}
