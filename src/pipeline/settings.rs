use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::pipeline::repair::DEFAULT_MAX_RETRIES;
use crate::pipeline::tool_adapters::gemini::{
    GeminiConfig, DEFAULT_API_BASE, DEFAULT_IMAGE_MODEL, DEFAULT_TEXT_MODEL, DEFAULT_VISION_MODEL,
};

pub const DEFAULT_SETTINGS_REL_PATH: &str = "config/sparkle.settings.toml";
pub const DOTENV_FILE_NAME: &str = ".env";
pub const DEFAULT_CATALOG_DB: &str = "catalog.sqlite";
pub const DEFAULT_OUT_DIR: &str = "./out";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

const KEY_API_KEY: &str = "GEMINI_API_KEY";
const KEY_TEXT_MODEL: &str = "GEMINI_TEXT_MODEL";
const KEY_VISION_MODEL: &str = "GEMINI_VISION_MODEL";
const KEY_IMAGE_MODEL: &str = "GEMINI_IMAGE_MODEL";
const KEY_API_BASE: &str = "GEMINI_API_BASE";
const KEY_CATALOG_DB: &str = "CATALOG_DB";
const KEY_OUT_DIR: &str = "OUT_DIR";
const KEY_MAX_RETRIES: &str = "SPARKLE_MAX_RETRIES";
const KEY_HTTP_TIMEOUT: &str = "SPARKLE_HTTP_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub gemini_api_key: Option<String>,
    pub gemini_api_base: String,
    pub text_model: String,
    pub vision_model: String,
    pub image_model: String,
    pub catalog_db: PathBuf,
    pub out_dir: PathBuf,
    pub max_retries: u32,
    pub http_timeout_secs: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_api_base: String::from(DEFAULT_API_BASE),
            text_model: String::from(DEFAULT_TEXT_MODEL),
            vision_model: String::from(DEFAULT_VISION_MODEL),
            image_model: String::from(DEFAULT_IMAGE_MODEL),
            catalog_db: PathBuf::from(DEFAULT_CATALOG_DB),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            max_retries: DEFAULT_MAX_RETRIES,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl WorkflowSettings {
    pub fn gemini_config(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.gemini_api_key.clone().unwrap_or_default(),
            api_base: self.gemini_api_base.clone(),
            text_model: self.text_model.clone(),
            vision_model: self.vision_model.clone(),
            image_model: self.image_model.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

/// One settings source; unset fields defer to lower layers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SettingsOverlay {
    pub gemini_api_key: Option<String>,
    pub gemini_api_base: Option<String>,
    pub text_model: Option<String>,
    pub vision_model: Option<String>,
    pub image_model: Option<String>,
    pub catalog_db: Option<String>,
    pub out_dir: Option<String>,
    pub max_retries: Option<u32>,
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("settings root must be a table")]
    RootMustBeTable,
    #[error("settings field '{field}' has invalid value")]
    InvalidField { field: String },
}

/// Layers, highest precedence first: process env, `.env`, TOML file, defaults.
pub fn select_settings(
    env: &SettingsOverlay,
    dotenv: &SettingsOverlay,
    file: &SettingsOverlay,
) -> WorkflowSettings {
    let defaults = WorkflowSettings::default();
    WorkflowSettings {
        gemini_api_key: choose_string(
            env.gemini_api_key.as_deref(),
            dotenv.gemini_api_key.as_deref(),
            file.gemini_api_key.as_deref(),
        ),
        gemini_api_base: choose_string(
            env.gemini_api_base.as_deref(),
            dotenv.gemini_api_base.as_deref(),
            file.gemini_api_base.as_deref(),
        )
        .unwrap_or(defaults.gemini_api_base),
        text_model: choose_string(
            env.text_model.as_deref(),
            dotenv.text_model.as_deref(),
            file.text_model.as_deref(),
        )
        .unwrap_or(defaults.text_model),
        vision_model: choose_string(
            env.vision_model.as_deref(),
            dotenv.vision_model.as_deref(),
            file.vision_model.as_deref(),
        )
        .unwrap_or(defaults.vision_model),
        image_model: choose_string(
            env.image_model.as_deref(),
            dotenv.image_model.as_deref(),
            file.image_model.as_deref(),
        )
        .unwrap_or(defaults.image_model),
        catalog_db: choose_string(
            env.catalog_db.as_deref(),
            dotenv.catalog_db.as_deref(),
            file.catalog_db.as_deref(),
        )
        .map(PathBuf::from)
        .unwrap_or(defaults.catalog_db),
        out_dir: choose_string(
            env.out_dir.as_deref(),
            dotenv.out_dir.as_deref(),
            file.out_dir.as_deref(),
        )
        .map(PathBuf::from)
        .unwrap_or(defaults.out_dir),
        max_retries: env
            .max_retries
            .or(dotenv.max_retries)
            .or(file.max_retries)
            .unwrap_or(defaults.max_retries),
        http_timeout_secs: env
            .http_timeout_secs
            .or(dotenv.http_timeout_secs)
            .or(file.http_timeout_secs)
            .unwrap_or(defaults.http_timeout_secs),
    }
}

/// Resolves settings for an app root. `explicit_path` replaces the default
/// TOML location; relative paths resolve against `app_root`.
pub fn load_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<WorkflowSettings, SettingsError> {
    let file = load_settings_file(app_root, explicit_path)?;
    let dotenv = load_dotenv_layer(app_root)?;
    let process_env = std::env::vars().collect::<HashMap<_, _>>();
    let env = overlay_from_env_map(&process_env)?;
    Ok(select_settings(&env, &dotenv, &file))
}

pub fn load_settings_file(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<SettingsOverlay, SettingsError> {
    let path = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) })
        .unwrap_or_else(|| app_root.join(DEFAULT_SETTINGS_REL_PATH));
    if !path.exists() {
        return Ok(SettingsOverlay::default());
    }
    let raw = fs::read_to_string(path.as_path()).map_err(|error| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let parsed = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
        SettingsError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    })?;
    let json_value = serde_json::to_value(parsed).map_err(|error| SettingsError::ParseToml {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    parse_settings_overlay_json(&json_value)
}

/// Accepts either a `[sparkle]` table or top-level keys. Key names are the
/// lowercase forms of the environment variable names.
pub fn parse_settings_overlay_json(value: &Value) -> Result<SettingsOverlay, SettingsError> {
    let root = value.as_object().ok_or(SettingsError::RootMustBeTable)?;
    let section = root
        .get("sparkle")
        .unwrap_or(value)
        .as_object()
        .ok_or(SettingsError::RootMustBeTable)?;

    let mut out = SettingsOverlay::default();
    for (key, v) in section {
        match key.to_ascii_uppercase().as_str() {
            KEY_API_KEY => out.gemini_api_key = Some(parse_string(v, key)?),
            KEY_API_BASE => out.gemini_api_base = Some(parse_string(v, key)?),
            KEY_TEXT_MODEL => out.text_model = Some(parse_string(v, key)?),
            KEY_VISION_MODEL => out.vision_model = Some(parse_string(v, key)?),
            KEY_IMAGE_MODEL => out.image_model = Some(parse_string(v, key)?),
            KEY_CATALOG_DB => out.catalog_db = Some(parse_string(v, key)?),
            KEY_OUT_DIR => out.out_dir = Some(parse_string(v, key)?),
            "MAX_RETRIES" | KEY_MAX_RETRIES => out.max_retries = Some(parse_u32(v, key)?),
            "HTTP_TIMEOUT_SECS" | KEY_HTTP_TIMEOUT => {
                out.http_timeout_secs = Some(u64::from(parse_u32(v, key)?))
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Blank values are treated as unset.
pub fn overlay_from_env_map(
    vars: &HashMap<String, String>,
) -> Result<SettingsOverlay, SettingsError> {
    let get = |key: &str| {
        vars.get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let get_number = |key: &str| -> Result<Option<u64>, SettingsError> {
        get(key)
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| SettingsError::InvalidField {
                    field: key.to_string(),
                })
            })
            .transpose()
    };
    let max_retries = get_number(KEY_MAX_RETRIES)?
        .map(|v| {
            u32::try_from(v).map_err(|_| SettingsError::InvalidField {
                field: KEY_MAX_RETRIES.to_string(),
            })
        })
        .transpose()?;

    Ok(SettingsOverlay {
        gemini_api_key: get(KEY_API_KEY),
        gemini_api_base: get(KEY_API_BASE),
        text_model: get(KEY_TEXT_MODEL),
        vision_model: get(KEY_VISION_MODEL),
        image_model: get(KEY_IMAGE_MODEL),
        catalog_db: get(KEY_CATALOG_DB),
        out_dir: get(KEY_OUT_DIR),
        max_retries,
        http_timeout_secs: get_number(KEY_HTTP_TIMEOUT)?,
    })
}

/// `{app_root}/.env` as a settings layer; a missing file is an empty layer.
pub fn load_dotenv_layer(app_root: &Path) -> Result<SettingsOverlay, SettingsError> {
    let path = app_root.join(DOTENV_FILE_NAME);
    if !path.is_file() {
        return Ok(SettingsOverlay::default());
    }
    let raw = fs::read_to_string(path.as_path()).map_err(|error| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    overlay_from_env_map(&parse_dotenv(raw.as_str()))
}

/// `KEY=value` lines with optional `export`, matching quotes and ` #` comments.
pub fn parse_dotenv(raw: &str) -> HashMap<String, String> {
    raw.lines().filter_map(dotenv_entry).collect()
}

fn dotenv_entry(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let value = match unquote(value) {
        Some(inner) => inner,
        None => value
            .split_once(" #")
            .map_or(value, |(before, _)| before.trim_end()),
    };
    Some((key.to_string(), value.to_string()))
}

fn unquote(value: &str) -> Option<&str> {
    ['"', '\'']
        .iter()
        .find_map(|quote| value.strip_prefix(*quote)?.strip_suffix(*quote))
}

fn choose_string(a: Option<&str>, b: Option<&str>, c: Option<&str>) -> Option<String> {
    a.or(b).or(c).map(str::to_string)
}

fn parse_string(value: &Value, field: &str) -> Result<String, SettingsError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| SettingsError::InvalidField {
            field: field.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(SettingsError::InvalidField {
            field: field.to_string(),
        });
    }
    Ok(parsed.to_string())
}

fn parse_u32(value: &Value, field: &str) -> Result<u32, SettingsError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| SettingsError::InvalidField {
            field: field.to_string(),
        })
}
