//! Startup backend selection.
//!
//! A linear priority chain evaluated once per process:
//!
//! ```text
//! Remote (if configured) ──fail──► CPU-optimized (if requested) ──fail──► reference
//!        │ ok                              │ ok                            │ ok / fail
//!        ▼                                 ▼                               ▼
//!     active                            active                   active / unavailable
//! ```
//!
//! Each failure is logged and recorded; exhausting the chain disables
//! separation without failing the process.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, SeparationError};
use crate::inference::remote::RemoteEstimator;
use crate::inference::{
    BackendConfig, BackendDescriptor, BackendKind, EstimatorHandle, StubEstimator,
};

type Constructor = Box<dyn FnOnce() -> Result<EstimatorHandle> + Send>;

/// A candidate that failed to construct, in attempt order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendFailure {
    pub kind: BackendKind,
    pub message: String,
}

/// Ordered list of backend constructors.
#[derive(Default)]
pub struct BackendSelector {
    candidates: Vec<(BackendKind, Constructor)>,
}

impl BackendSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate. Candidates are tried in insertion order.
    pub fn candidate<F>(mut self, kind: BackendKind, constructor: F) -> Self
    where
        F: FnOnce() -> Result<EstimatorHandle> + Send + 'static,
    {
        self.candidates.push((kind, Box::new(constructor)));
        self
    }

    /// Remote (if `remote_url` is set) → CPU-optimized (if `use_optimized`)
    /// → accelerated/reference.
    pub fn from_config(config: &BackendConfig, sample_rate: u32) -> Self {
        let mut kinds = Vec::with_capacity(3);
        if config
            .remote_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty())
        {
            kinds.push(BackendKind::Remote);
        }
        if config.use_optimized {
            kinds.push(BackendKind::CpuOptimized);
        }
        kinds.push(BackendKind::Accelerated);

        kinds.into_iter().fold(Self::new(), |selector, kind| {
            let cfg = config.clone();
            selector.candidate(kind, move || construct(kind, &cfg, sample_rate))
        })
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Try each candidate until one constructs.
    pub fn select(self) -> Selection {
        let mut failures = Vec::new();
        for (kind, constructor) in self.candidates {
            match constructor() {
                Ok(handle) => {
                    let descriptor = handle.descriptor();
                    info!(
                        kind = %descriptor.kind,
                        label = %descriptor.label,
                        detail = %descriptor.detail,
                        skipped = failures.len(),
                        "separation backend active"
                    );
                    return Selection {
                        active: Some((handle, descriptor)),
                        failures,
                    };
                }
                Err(e) => {
                    if e.is_construction_failure() {
                        warn!(%kind, error = %e, "backend unavailable; trying next candidate");
                    } else {
                        warn!(%kind, error = %e, "backend failed unexpectedly during construction");
                    }
                    failures.push(BackendFailure {
                        kind,
                        message: e.to_string(),
                    });
                }
            }
        }
        warn!(
            attempts = failures.len(),
            "no separation backend could be initialised; separation disabled"
        );
        Selection {
            active: None,
            failures,
        }
    }
}

/// Outcome of [`BackendSelector::select`]. Read-only for the rest of the
/// process lifetime.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    active: Option<(EstimatorHandle, BackendDescriptor)>,
    failures: Vec<BackendFailure>,
}

impl Selection {
    /// A selection with a single pre-built backend and no recorded failures.
    pub fn with_estimator(handle: EstimatorHandle) -> Self {
        let descriptor = handle.descriptor();
        Self {
            active: Some((handle, descriptor)),
            failures: Vec::new(),
        }
    }

    /// A selection with nothing active.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        self.active.is_some()
    }

    pub fn estimator(&self) -> Option<&EstimatorHandle> {
        self.active.as_ref().map(|(h, _)| h)
    }

    pub fn descriptor(&self) -> Option<&BackendDescriptor> {
        self.active.as_ref().map(|(_, d)| d)
    }

    pub fn failures(&self) -> &[BackendFailure] {
        &self.failures
    }

    /// # Errors
    /// `SeparationUnavailable` when no backend is active.
    pub fn require(&self) -> Result<&EstimatorHandle> {
        self.estimator()
            .ok_or(SeparationError::SeparationUnavailable)
    }
}

/// Build one backend of `kind` from `config`.
///
/// # Errors
/// The construction failure of that backend (see
/// [`SeparationError::is_construction_failure`]).
pub fn construct(kind: BackendKind, config: &BackendConfig, sample_rate: u32) -> Result<EstimatorHandle> {
    match kind {
        BackendKind::Remote => {
            let url = config.remote_url.as_deref().unwrap_or_default();
            RemoteEstimator::connect(url, config.remote_timeout_secs, config.remote_mode, sample_rate)
                .map(EstimatorHandle::new)
        }
        BackendKind::CpuOptimized => cpu_optimized(config),
        BackendKind::Accelerated => accelerated(config),
        BackendKind::Stub => Ok(EstimatorHandle::new(StubEstimator::new())),
    }
}

#[cfg(feature = "onnx")]
fn cpu_optimized(config: &BackendConfig) -> Result<EstimatorHandle> {
    crate::inference::OnnxEstimator::cpu_optimized(config).map(EstimatorHandle::new)
}

#[cfg(not(feature = "onnx"))]
fn cpu_optimized(config: &BackendConfig) -> Result<EstimatorHandle> {
    // Still report a missing artifact first; it is the more actionable error.
    crate::inference::artifact::resolve_cpu_artifact(
        &config.model_dir,
        &config.model_name,
        config.quantized,
    )?;
    Err(SeparationError::BackendNotBuilt("onnx"))
}

#[cfg(feature = "onnx")]
fn accelerated(config: &BackendConfig) -> Result<EstimatorHandle> {
    crate::inference::OnnxEstimator::accelerated(config).map(EstimatorHandle::new)
}

#[cfg(not(feature = "onnx"))]
fn accelerated(config: &BackendConfig) -> Result<EstimatorHandle> {
    crate::inference::artifact::resolve_reference_artifact(&config.model_dir, &config.model_name)?;
    Err(SeparationError::BackendNotBuilt("onnx"))
}
