use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pipeline::state::{Fingerprint, RepairKind};
use crate::pipeline::tool_adapters::local_ops::LocalImageOpError;

const RUN_TAG_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to create output directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render local candidate: {0}")]
    Render(#[from] LocalImageOpError),
    #[error("failed to write candidate '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Output directory for repair candidates. File names are deterministic per
/// run, strategy and retry index, so re-running a run id overwrites in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateArtifactStore {
    out_dir: PathBuf,
}

impl CandidateArtifactStore {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        self.out_dir.as_path()
    }

    pub fn candidate_path(&self, kind: RepairKind, run_id: &str, retry_index: u32) -> PathBuf {
        self.out_dir.join(candidate_file_name(kind, run_id, retry_index))
    }

    pub fn write_candidate(
        &self,
        kind: RepairKind,
        run_id: &str,
        retry_index: u32,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        fs::create_dir_all(self.out_dir.as_path()).map_err(|source| ArtifactError::CreateDir {
            path: self.out_dir.clone(),
            source,
        })?;
        let path = self.candidate_path(kind, run_id, retry_index);
        fs::write(path.as_path(), bytes).map_err(|source| ArtifactError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// File-safe run ids are used as-is. Any other id is sanitized and tagged
/// with `.` plus a digest prefix of the raw id; sanitized text never holds `.`.
pub fn candidate_file_name(kind: RepairKind, run_id: &str, retry_index: u32) -> String {
    let sanitized = sanitize_file_component(run_id);
    let run = if !sanitized.is_empty() && sanitized == run_id {
        sanitized
    } else {
        let digest = Fingerprint::of_bytes(run_id.as_bytes());
        let tag = digest.as_str().get(..RUN_TAG_LEN).unwrap_or(digest.as_str());
        let stem = if sanitized.is_empty() {
            "run"
        } else {
            sanitized.as_str()
        };
        format!("{stem}.{tag}")
    };
    format!("{}_{}_iter{}.png", kind.file_prefix(), run, retry_index)
}

fn sanitize_file_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_sep = false;
    for ch in value.chars() {
        let keep = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_';
        if keep {
            out.push(ch);
            last_was_sep = false;
            continue;
        }
        if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}
