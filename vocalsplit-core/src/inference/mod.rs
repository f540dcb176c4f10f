//! Estimator abstraction.
//!
//! The `Estimator` trait decouples the overlap-add chunker from any specific
//! execution backend (remote peer, ONNX on CPU, ONNX on an accelerator, stub).
//!
//! `&mut self` on `infer` expresses that sessions and HTTP clients carry
//! state. All calls are serialised through `EstimatorHandle`'s
//! `parking_lot::Mutex`.

pub mod artifact;
pub mod remote;
pub mod selector;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::OnnxEstimator;
pub use remote::RemoteEstimator;
pub use selector::{BackendSelector, Selection};
pub use stub::StubEstimator;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::SeparatedStems;
use crate::error::Result;

/// Contract for vocal-estimation backends.
pub trait Estimator: Send + 'static {
    /// Estimate the vocal component of one `[channels, chunk_size]` chunk.
    ///
    /// # Returns
    /// An array with exactly the input's shape.
    ///
    /// # Errors
    /// `Inference` / `RemoteInference` on runtime failure. A failure here
    /// aborts the whole separation.
    fn infer(&mut self, chunk: &Array2<f32>) -> Result<Array2<f32>>;

    /// Which backend this is, for observability.
    fn descriptor(&self) -> BackendDescriptor;

    /// Optional whole-file path used by backends that separate a complete
    /// recording server-side. `None` means "use chunked `infer`".
    fn separate_file(&mut self, _input: &Path, _out_dir: &Path) -> Option<Result<SeparatedStems>> {
        None
    }
}

/// Thread-safe reference-counted handle to any `Estimator` implementor.
#[derive(Clone)]
pub struct EstimatorHandle(pub Arc<Mutex<dyn Estimator>>);

impl EstimatorHandle {
    pub fn new<E: Estimator>(estimator: E) -> Self {
        Self(Arc::new(Mutex::new(estimator)))
    }

    pub fn descriptor(&self) -> BackendDescriptor {
        self.0.lock().descriptor()
    }
}

impl fmt::Debug for EstimatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstimatorHandle").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    Remote,
    CpuOptimized,
    Accelerated,
    Stub,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Remote => "remote",
            Self::CpuOptimized => "cpu-optimized",
            Self::Accelerated => "accelerated",
            Self::Stub => "stub",
        };
        f.write_str(s)
    }
}

/// Immutable record of the active backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    /// Short human label, e.g. `"onnx-cpu (int8)"`.
    pub label: String,
    /// Artifact path, endpoint URL or device, whichever applies.
    pub detail: String,
}

impl BackendDescriptor {
    pub fn new(kind: BackendKind, label: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl DevicePreference {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "cpu" => Some(Self::Cpu),
            "cuda" | "gpu" => Some(Self::Cuda),
            _ => None,
        }
    }
}

/// What the remote adapter sends per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteMode {
    /// One request per chunk, overlap-add stays local.
    #[default]
    Chunk,
    /// Upload the whole input and download both stems.
    WholeFile,
}

/// Backend selection and construction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// Base URL of a remote inference peer. `None` skips the remote candidate.
    pub remote_url: Option<String>,
    pub remote_timeout_secs: u64,
    pub remote_mode: RemoteMode,
    /// Try the CPU-optimized ONNX graph before the reference backend.
    pub use_optimized: bool,
    /// Prefer the 8-bit quantized artifact when present.
    pub quantized: bool,
    /// ONNX intra-op threads. `None` uses every logical core.
    pub num_threads: Option<usize>,
    pub model_dir: PathBuf,
    pub model_name: String,
    pub device: DevicePreference,
}

pub const DEFAULT_MODEL_NAME: &str = "model_vocals_tommy";
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 600;

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote_timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
            remote_mode: RemoteMode::Chunk,
            use_optimized: true,
            quantized: false,
            num_threads: None,
            model_dir: default_models_dir(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            device: DevicePreference::Auto,
        }
    }
}

impl BackendConfig {
    /// Thread count handed to ONNX Runtime.
    pub fn effective_threads(&self) -> usize {
        self.num_threads.filter(|n| *n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

pub fn default_models_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("vocalsplit").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("vocalsplit")
            .join("models")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_config_defaults() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.remote_timeout_secs, 600);
        assert_eq!(cfg.model_name, "model_vocals_tommy");
        assert!(cfg.use_optimized);
        assert!(!cfg.quantized);
        assert!(cfg.effective_threads() >= 1);
    }

    #[test]
    fn backend_config_fills_missing_fields_from_defaults() {
        let cfg: BackendConfig =
            serde_json::from_str(r#"{"remoteUrl":"http://gpu:8000","quantized":true}"#).unwrap();
        assert_eq!(cfg.remote_url.as_deref(), Some("http://gpu:8000"));
        assert!(cfg.quantized);
        assert_eq!(cfg.remote_mode, RemoteMode::Chunk);
        assert_eq!(cfg.device, DevicePreference::Auto);
    }

    #[test]
    fn descriptor_serialises_camel_case() {
        let d = BackendDescriptor::new(BackendKind::CpuOptimized, "onnx-cpu", "/m/x.onnx");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "cpuOptimized");
        assert_eq!(json["label"], "onnx-cpu");
    }

    #[test]
    fn device_preference_parses_aliases() {
        assert_eq!(DevicePreference::parse(" GPU "), Some(DevicePreference::Cuda));
        assert_eq!(DevicePreference::parse("cpu"), Some(DevicePreference::Cpu));
        assert_eq!(DevicePreference::parse("tpu"), None);
    }
}
