//! # vocalsplit-core
//!
//! Vocal / instrumental source-separation engine.
//!
//! ## Architecture
//!
//! ```text
//! input file → decode (symphonia) → normalise (stereo, rubato) ─┐
//!                                                               │
//!                          OverlapPlan: reflect-pad, chunk, window
//!                                                               │
//!                               Estimator::infer per chunk (selected once:
//!                               remote → ONNX CPU-optimized → ONNX reference)
//!                                                               │
//!                    result / counter → vocals; mix − vocals → instrumental
//!                                                               │
//!                                              hound WAV stems ◄┘
//! ```
//!
//! Long-running separations are tracked in a [`JobRegistry`] with cooperative
//! cancellation at fixed checkpoints.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod engine;
pub mod error;
pub mod inference;
pub mod jobs;
pub mod overlap;

// Convenience re-exports for downstream crates
pub use audio::Waveform;
pub use engine::{EngineConfig, OverlapConfig, SeparatedStems, SeparationEngine};
pub use error::{Result, SeparationError};
pub use inference::{
    BackendConfig, BackendDescriptor, BackendKind, BackendSelector, DevicePreference, Estimator,
    EstimatorHandle, RemoteMode, Selection, StubEstimator,
};
pub use jobs::{CancelToken, JobKind, JobRecord, JobRegistry, JobStatus};
pub use overlap::OverlapPlan;

#[cfg(feature = "onnx")]
pub use inference::OnnxEstimator;
