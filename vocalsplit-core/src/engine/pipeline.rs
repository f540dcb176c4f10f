//! Blocking separation pipeline.
//!
//! ## Stages
//!
//! ```text
//! 1. checkpoint
//! 2. copy input into <work_dir>/<op id>/            progress 5
//! 3. checkpoint
//! 4. decode → normalise (stereo, canonical rate)
//! 5. overlap-add over the estimator                  progress 5..95
//! 6. checkpoint
//! 7. instrumental = mix − vocals, write both stems   progress 100
//! ```
//!
//! Backends with a whole-file path replace steps 4–5 and 7.
//!
//! Runs on the caller's thread; `SeparationEngine::submit` puts it on
//! `spawn_blocking` so the async executor stays free. Every file the run
//! creates is tracked by [`TempArtifacts`] and removed on any early return;
//! only the two stems of a successful run survive.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::{
    audio::{self, resample},
    engine::{EngineConfig, EngineDiagnostics, SeparatedStems},
    error::Result,
    inference::EstimatorHandle,
    jobs::CancelToken,
    overlap::{self, OverlapPlan},
};

const PROGRESS_INPUT_STORED: u32 = 5;
const PROGRESS_INFERENCE_DONE: u32 = 95;
const PROGRESS_DONE: u32 = 100;

/// All context the pipeline needs, passed as one struct.
pub struct PipelineContext<'a> {
    pub config: &'a EngineConfig,
    pub plan: &'a OverlapPlan,
    pub estimator: &'a EstimatorHandle,
    pub cancel: &'a CancelToken,
    pub diagnostics: &'a EngineDiagnostics,
}

/// Map chunk progress onto the 5..95 band.
pub fn chunk_progress(done: usize, total: usize) -> u32 {
    if total == 0 {
        return PROGRESS_INFERENCE_DONE;
    }
    let band = (PROGRESS_INFERENCE_DONE - PROGRESS_INPUT_STORED) as usize;
    PROGRESS_INPUT_STORED + (band * done.min(total) / total) as u32
}

pub fn run(
    ctx: PipelineContext<'_>,
    input_path: &Path,
    progress: &mut dyn FnMut(u32),
) -> Result<SeparatedStems> {
    let op_id = Uuid::new_v4().simple().to_string();
    let span = info_span!("separation", op = %op_id);
    let _entered = span.enter();
    let started = Instant::now();

    // ── Checkpoint 1: before touching storage ────────────────────────────────
    ctx.cancel.checkpoint()?;

    let mut artifacts = TempArtifacts::create(ctx.config.work_dir.join(&op_id))?;
    let extension = input_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    let input_copy = artifacts.track(format!("input.{extension}"));
    std::fs::copy(input_path, &input_copy)?;
    debug!(from = ?input_path, to = ?input_copy, "input stored");
    progress(PROGRESS_INPUT_STORED);

    // ── Checkpoint 2: before inference ───────────────────────────────────────
    ctx.cancel.checkpoint()?;

    let vocals_path = artifacts.track("vocals.wav");
    let instrumental_path = artifacts.track("instrumental.wav");

    let whole_file = ctx
        .estimator
        .0
        .lock()
        .separate_file(&input_copy, artifacts.dir());
    if let Some(result) = whole_file {
        let stems = result?;
        // ── Checkpoint 3: before packaging ───────────────────────────────────
        ctx.cancel.checkpoint()?;
        artifacts.keep(&stems.vocals_path);
        artifacts.keep(&stems.instrumental_path);
        progress(PROGRESS_DONE);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "whole-file separation complete"
        );
        return Ok(stems);
    }

    let decoded = audio::decode_file(&input_copy)?;
    let mix = resample::normalize(&decoded, ctx.config.sample_rate)?;
    info!(
        source_rate = decoded.sample_rate(),
        source_channels = decoded.channels(),
        frames = mix.frames(),
        duration_secs = mix.duration_secs(),
        chunks = ctx.plan.chunk_count(mix.frames()),
        "input normalised"
    );

    let inference_started = Instant::now();
    let vocals = overlap::process_with_progress(
        &mix,
        ctx.plan,
        |chunk| {
            ctx.diagnostics
                .chunks_inferred
                .fetch_add(1, Ordering::Relaxed);
            ctx.estimator.0.lock().infer(chunk)
        },
        |done, total| progress(chunk_progress(done, total)),
    )?;
    let inference_secs = inference_started.elapsed().as_secs_f64();
    info!(
        inference_secs,
        realtime_factor = inference_secs / mix.duration_secs().max(f64::EPSILON),
        "overlap-add inference complete"
    );

    // ── Checkpoint 3: before packaging ───────────────────────────────────────
    ctx.cancel.checkpoint()?;

    let instrumental = mix.residual(&vocals)?;
    audio::write_wav(&vocals_path, &vocals)?;
    audio::write_wav(&instrumental_path, &instrumental)?;
    progress(PROGRESS_DONE);

    artifacts.keep(&vocals_path);
    artifacts.keep(&instrumental_path);
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        vocals = ?vocals_path,
        instrumental = ?instrumental_path,
        "separation complete"
    );

    Ok(SeparatedStems {
        vocals_path,
        instrumental_path,
        sample_rate: mix.sample_rate(),
    })
}

/// Scratch directory for one run. Tracked files that were not kept are
/// deleted on drop, and the directory goes too once nothing is kept.
pub struct TempArtifacts {
    dir: PathBuf,
    tracked: Vec<PathBuf>,
    kept: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn create(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            tracked: Vec::new(),
            kept: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Register `name` inside the scratch directory and return its path.
    pub fn track(&mut self, name: impl AsRef<Path>) -> PathBuf {
        let path = self.dir.join(name);
        self.tracked.push(path.clone());
        path
    }

    pub fn keep(&mut self, path: &Path) {
        self.kept.push(path.to_path_buf());
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in &self.tracked {
            if self.kept.contains(path) || !path.exists() {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = ?path, "removed temp artifact"),
                Err(e) => warn!(path = ?path, error = %e, "failed to remove temp artifact"),
            }
        }
        if self.kept.is_empty() {
            if let Err(e) = std::fs::remove_dir(&self.dir) {
                debug!(dir = ?self.dir, error = %e, "scratch directory not removed");
            }
        }
    }
}
