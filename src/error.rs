use std::path::PathBuf;

/// Errors raised by the PSF fitting pipeline.
///
/// Selection and interpolation failures abort a run. Fit divergence is
/// reported per star and normally recovered by dropping that star; it only
/// surfaces to the caller from the single-star fitting API.
#[derive(thiserror::Error, Debug)]
pub enum PsfError {
    #[error("star selection failed: {0}")]
    Selection(String),
    #[error("fit for star {index} did not converge: {reason}")]
    FitDivergence { index: usize, reason: String },
    #[error("interpolation failed: {0}")]
    Interpolation(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read FITS image {path}: {reason}")]
    Fits { path: PathBuf, reason: String },
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("CSV error")]
    Csv(#[from] csv::Error),
    #[error("YAML error")]
    Yaml(#[from] serde_yml::Error),
    #[error("JSON error")]
    Json(#[from] serde_json::Error),
}

impl PsfError {
    pub fn divergence(index: usize, reason: impl Into<String>) -> Self {
        PsfError::FitDivergence {
            index,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = PsfError> = std::result::Result<T, E>;
