//! Vocal estimator ONNX backend via the `ort` crate.
//!
//! Model contract:
//! - input  `[1, channels, chunk_size]` f32 mixture
//! - output `[1, channels, chunk_size]` f32 vocal estimate
//!
//! Input/output names are read from the session, so any export with a single
//! waveform in and a single waveform out works.
//!
//! Two constructors share this type:
//! - [`OnnxEstimator::cpu_optimized`] loads the offline-optimized (optionally
//!   int8-quantized) graph on the CPU EP with an explicit thread count.
//! - [`OnnxEstimator::accelerated`] loads the plain export and registers the
//!   CUDA EP when the `cuda` feature is built in.

use std::path::Path;

use ndarray::{Array2, Axis};
use ort::ep;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, SeparationError};
use crate::inference::artifact::{is_quantized, resolve_cpu_artifact, resolve_reference_artifact};
use crate::inference::{BackendConfig, BackendDescriptor, BackendKind, DevicePreference, Estimator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionTarget {
    Cpu,
    /// CUDA first; `strict` turns a registration failure into an error
    /// instead of a silent CPU fallback.
    Cuda { strict: bool },
}

fn session_error(e: impl std::fmt::Display) -> SeparationError {
    SeparationError::OnnxSession(e.to_string())
}

/// Intra- and inter-op pool sizes for a configured thread count.
fn session_threads(threads: usize) -> (usize, usize) {
    let n = threads.clamp(1, 64);
    (n, n)
}

fn create_session(model_path: &Path, threads: usize, target: ExecutionTarget) -> Result<Session> {
    let (intra_threads, inter_threads) = session_threads(threads);

    let mut builder = SessionBuilder::new()
        .map_err(session_error)?
        .with_intra_threads(intra_threads)
        .map_err(session_error)?
        .with_inter_threads(inter_threads)
        .map_err(session_error)?
        .with_parallel_execution(false)
        .map_err(session_error)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(session_error)?;
    info!(
        intra_threads,
        inter_threads,
        target = ?target,
        "ONNX session threading configured"
    );

    builder = match target {
        ExecutionTarget::Cpu => builder
            .with_execution_providers([ep::CPU::default().build()])
            .map_err(session_error)?,
        ExecutionTarget::Cuda { strict } => register_cuda(builder, strict)?,
    };

    builder.commit_from_file(model_path).map_err(|e| {
        if matches!(target, ExecutionTarget::Cuda { strict: true }) {
            SeparationError::HardwareUnavailable(e.to_string())
        } else {
            session_error(e)
        }
    })
}

#[cfg(feature = "cuda")]
fn register_cuda(builder: SessionBuilder, strict: bool) -> Result<SessionBuilder> {
    let cuda = ep::CUDA::default().with_device_id(0).build();
    let cuda = if strict {
        info!("ONNX EP preference=cuda (strict)");
        cuda.error_on_failure()
    } else {
        info!("ONNX EP preference=auto (cuda -> cpu)");
        cuda.fail_silently()
    };
    builder
        .with_execution_providers([cuda, ep::CPU::default().build()])
        .map_err(|e| {
            if strict {
                SeparationError::HardwareUnavailable(e.to_string())
            } else {
                session_error(e)
            }
        })
}

#[cfg(not(feature = "cuda"))]
fn register_cuda(builder: SessionBuilder, strict: bool) -> Result<SessionBuilder> {
    if strict {
        return Err(SeparationError::HardwareUnavailable(
            "CUDA requested but this binary was built without the `cuda` feature".into(),
        ));
    }
    debug!("cuda feature not built; auto device resolves to CPU EP");
    builder
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(session_error)
}

// ── OnnxEstimator ────────────────────────────────────────────────────────────

pub struct OnnxEstimator {
    session: Session,
    input_name: String,
    output_name: String,
    descriptor: BackendDescriptor,
}

impl OnnxEstimator {
    /// Local-CPU-Optimized backend.
    ///
    /// # Errors
    /// `ModelArtifactNotFound` if neither the quantized, optimized nor plain
    /// graph exists; `OnnxSession` if the graph fails to load.
    pub fn cpu_optimized(config: &BackendConfig) -> Result<Self> {
        let artifact = resolve_cpu_artifact(&config.model_dir, &config.model_name, config.quantized)?;
        if config.quantized && !is_quantized(&artifact) {
            warn!(
                artifact = ?artifact,
                "quantized model requested but no int8 graph found; using full precision"
            );
        }
        let threads = config.effective_threads();
        info!(artifact = ?artifact, threads, "loading CPU-optimized ONNX estimator");
        let session = create_session(&artifact, threads, ExecutionTarget::Cpu)?;

        let label = if is_quantized(&artifact) {
            format!("onnx-cpu int8 ({threads} threads)")
        } else {
            format!("onnx-cpu ({threads} threads)")
        };
        Self::from_session(
            session,
            BackendDescriptor::new(
                BackendKind::CpuOptimized,
                label,
                artifact.display().to_string(),
            ),
        )
    }

    /// Local-Accelerated / reference backend.
    ///
    /// # Errors
    /// `HardwareUnavailable` when `device = cuda` and the CUDA EP cannot be
    /// registered; `ModelArtifactNotFound` if `<model>.onnx` is absent.
    pub fn accelerated(config: &BackendConfig) -> Result<Self> {
        let target = match config.device {
            DevicePreference::Cpu => ExecutionTarget::Cpu,
            DevicePreference::Auto => ExecutionTarget::Cuda { strict: false },
            DevicePreference::Cuda => ExecutionTarget::Cuda { strict: true },
        };
        if target == (ExecutionTarget::Cuda { strict: true }) && !cfg!(feature = "cuda") {
            return Err(SeparationError::HardwareUnavailable(
                "CUDA requested but this binary was built without the `cuda` feature".into(),
            ));
        }
        let artifact = resolve_reference_artifact(&config.model_dir, &config.model_name)?;
        let threads = config.effective_threads();
        info!(artifact = ?artifact, device = ?config.device, "loading reference ONNX estimator");
        let session = create_session(&artifact, threads, target)?;

        let label = match target {
            ExecutionTarget::Cpu => "onnx-reference (cpu)",
            ExecutionTarget::Cuda { strict: true } => "onnx-reference (cuda)",
            ExecutionTarget::Cuda { strict: false } => "onnx-reference (auto)",
        };
        Self::from_session(
            session,
            BackendDescriptor::new(BackendKind::Accelerated, label, artifact.display().to_string()),
        )
    }

    fn from_session(session: Session, descriptor: BackendDescriptor) -> Result<Self> {
        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| SeparationError::OnnxSession("model declares no inputs".into()))?;
        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| SeparationError::OnnxSession("model declares no outputs".into()))?;
        debug!(%input_name, %output_name, "ONNX estimator I/O");
        Ok(Self {
            session,
            input_name,
            output_name,
            descriptor,
        })
    }
}

impl Estimator for OnnxEstimator {
    fn infer(&mut self, chunk: &Array2<f32>) -> Result<Array2<f32>> {
        let (channels, frames) = chunk.dim();
        let batch = chunk.to_owned().insert_axis(Axis(0));
        let input = Value::from_array(batch)
            .map_err(|e: ort::Error| SeparationError::Inference(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| SeparationError::Inference(e.to_string()))?;
        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| SeparationError::Inference(e.to_string()))?;

        let dims: Vec<i64> = shape.iter().copied().collect();
        if dims != [1, channels as i64, frames as i64] {
            return Err(SeparationError::Inference(format!(
                "model output shape {dims:?}, expected [1, {channels}, {frames}]"
            )));
        }
        Array2::from_shape_vec((channels, frames), data.to_vec())
            .map_err(|e| SeparationError::Inference(e.to_string()))
    }

    fn descriptor(&self) -> BackendDescriptor {
        self.descriptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_thread_pools_follow_the_configured_count() {
        assert_eq!(session_threads(6), (6, 6));
        assert_eq!(session_threads(0), (1, 1));
        assert_eq!(session_threads(512), (64, 64));
    }
}
