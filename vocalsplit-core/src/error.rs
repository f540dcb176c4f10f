use thiserror::Error;

use crate::jobs::JobStatus;

/// All errors produced by vocalsplit-core.
#[derive(Debug, Error)]
pub enum SeparationError {
    #[error("unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    #[error("model artifact not found: {path}")]
    ModelArtifactNotFound { path: std::path::PathBuf },

    #[error("accelerator hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("remote inference endpoint unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("remote inference error: {0}")]
    RemoteInference(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("backend not built into this binary: {0}")]
    BackendNotBuilt(&'static str),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("separation is unavailable: no inference backend initialised")]
    SeparationUnavailable,

    #[error("operation cancelled")]
    Cancelled,

    #[error("job {job_id} is {status}, operation not allowed")]
    InvalidState { job_id: String, status: JobStatus },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid overlap plan: {0}")]
    InvalidOverlapPlan(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SeparationError {
    /// `true` for failures raised while constructing an estimator adapter
    /// (these drive backend fallback), `false` for runtime failures.
    pub fn is_construction_failure(&self) -> bool {
        matches!(
            self,
            Self::ModelArtifactNotFound { .. }
                | Self::HardwareUnavailable(_)
                | Self::BackendNotBuilt(_)
                | Self::OnnxSession(_)
                | Self::RemoteUnreachable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SeparationError>;
