//! Model artifact lookup.
//!
//! A model named `m` may ship as up to three files in the model directory:
//!
//! | File               | Produced by                    |
//! |--------------------|--------------------------------|
//! | `m_int8.onnx`      | dynamic 8-bit quantization     |
//! | `m_optimized.onnx` | offline graph optimisation     |
//! | `m.onnx`           | plain export (reference graph) |

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SeparationError};

pub fn quantized_path(dir: &Path, model: &str) -> PathBuf {
    dir.join(format!("{model}_int8.onnx"))
}

pub fn optimized_path(dir: &Path, model: &str) -> PathBuf {
    dir.join(format!("{model}_optimized.onnx"))
}

pub fn reference_path(dir: &Path, model: &str) -> PathBuf {
    dir.join(format!("{model}.onnx"))
}

/// Pick the graph for the CPU-optimized backend.
///
/// Order: quantized (only when requested) → optimized → plain export.
///
/// # Errors
/// `ModelArtifactNotFound` naming the most preferred candidate when none exists.
pub fn resolve_cpu_artifact(dir: &Path, model: &str, quantized: bool) -> Result<PathBuf> {
    let mut candidates = Vec::with_capacity(3);
    if quantized {
        candidates.push(quantized_path(dir, model));
    }
    candidates.push(optimized_path(dir, model));
    candidates.push(reference_path(dir, model));

    for path in &candidates {
        if path.is_file() {
            debug!(path = ?path, "resolved CPU model artifact");
            return Ok(path.clone());
        }
    }
    Err(SeparationError::ModelArtifactNotFound {
        path: candidates.swap_remove(0),
    })
}

/// The accelerated/reference backend always loads the plain export.
pub fn resolve_reference_artifact(dir: &Path, model: &str) -> Result<PathBuf> {
    let path = reference_path(dir, model);
    if path.is_file() {
        Ok(path)
    } else {
        Err(SeparationError::ModelArtifactNotFound { path })
    }
}

pub fn is_quantized(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.ends_with("_int8"))
}
