//! `SeparationEngine`: top-level orchestration handle.
//!
//! ## Lifecycle
//!
//! ```text
//! SeparationEngine::from_backend_config()
//!     └─► BackendSelector::select()   → one process-wide estimator (or none)
//!         ├─► separate(path)          → synchronous, no job record
//!         └─► submit(path, title)     → job id; pipeline on spawn_blocking
//!                 └─► run_job()       → complete | fail | (cancelled)
//! ```
//!
//! The engine is `Send + Sync`; wrap it in `Arc<SeparationEngine>` and hand
//! clones to request handlers. Backend choice is fixed at construction.

pub mod pipeline;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    error::{Result, SeparationError},
    inference::{selector::BackendFailure, BackendConfig, BackendDescriptor, BackendSelector, Selection},
    jobs::{CancelToken, JobKind, JobRegistry},
    overlap::OverlapPlan,
};

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
/// 8 s at 44.1 kHz.
pub const DEFAULT_CHUNK_SIZE: usize = 352_800;
pub const DEFAULT_NUM_OVERLAP: usize = 4;

/// Chunk geometry for the overlap-add stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlapConfig {
    /// Model window in samples per channel.
    pub chunk_size: usize,
    /// How many chunks cover each sample.
    pub num_overlap: usize,
}

impl Default for OverlapConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            num_overlap: DEFAULT_NUM_OVERLAP,
        }
    }
}

impl OverlapConfig {
    pub fn plan(&self) -> Result<OverlapPlan> {
        OverlapPlan::new(self.chunk_size, self.num_overlap)
    }
}

/// Configuration for `SeparationEngine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Canonical rate every input is resampled to, and the rate of the
    /// written stems. Default: 44100.
    pub sample_rate: u32,
    pub overlap: OverlapConfig,
    /// Per-operation scratch directories live here. Default: `<tmp>/vocalsplit`.
    pub work_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            overlap: OverlapConfig::default(),
            work_dir: std::env::temp_dir().join("vocalsplit"),
        }
    }
}

/// Output of one separation. The files belong to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeparatedStems {
    pub vocals_path: PathBuf,
    pub instrumental_path: PathBuf,
    pub sample_rate: u32,
}

impl SeparatedStems {
    /// Best-effort removal of both stem files and their directory.
    pub fn remove_files(&self) {
        for path in [&self.vocals_path, &self.instrumental_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?path, error = %e, "failed to remove stem");
                }
            }
        }
        if let Some(dir) = self.vocals_path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Engine-wide counters for observability.
#[derive(Default)]
pub struct EngineDiagnostics {
    pub separations_started: AtomicUsize,
    pub separations_completed: AtomicUsize,
    pub separations_failed: AtomicUsize,
    pub separations_cancelled: AtomicUsize,
    pub chunks_inferred: AtomicUsize,
}

impl EngineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            separations_started: self.separations_started.load(Ordering::Relaxed),
            separations_completed: self.separations_completed.load(Ordering::Relaxed),
            separations_failed: self.separations_failed.load(Ordering::Relaxed),
            separations_cancelled: self.separations_cancelled.load(Ordering::Relaxed),
            chunks_inferred: self.chunks_inferred.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub separations_started: usize,
    pub separations_completed: usize,
    pub separations_failed: usize,
    pub separations_cancelled: usize,
    pub chunks_inferred: usize,
}

/// The top-level engine handle.
pub struct SeparationEngine {
    config: EngineConfig,
    plan: OverlapPlan,
    selection: Selection,
    jobs: JobRegistry,
    diagnostics: EngineDiagnostics,
    /// Blocking workers of submitted jobs that may still be running.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SeparationEngine {
    /// Build an engine around an already-made backend selection.
    ///
    /// # Errors
    /// `InvalidOverlapPlan` if the chunk geometry is unusable.
    pub fn new(config: EngineConfig, selection: Selection) -> Result<Self> {
        let plan = config.overlap.plan()?;
        info!(
            sample_rate = config.sample_rate,
            chunk_size = plan.chunk_size(),
            step = plan.step(),
            fade_size = plan.fade_size(),
            border = plan.border(),
            work_dir = ?config.work_dir,
            available = selection.is_available(),
            "separation engine configured"
        );
        Ok(Self {
            config,
            plan,
            selection,
            jobs: JobRegistry::new(),
            diagnostics: EngineDiagnostics::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Run backend selection for `backend` then build the engine. A failed
    /// selection leaves separation disabled but still returns an engine.
    pub fn from_backend_config(config: EngineConfig, backend: &BackendConfig) -> Result<Self> {
        // Reject bad geometry before loading any model.
        config.overlap.plan()?;
        let selection = BackendSelector::from_config(backend, config.sample_rate).select();
        Self::new(config, selection)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plan(&self) -> &OverlapPlan {
        &self.plan
    }

    pub fn is_available(&self) -> bool {
        self.selection.is_available()
    }

    /// Descriptor of the active backend, `None` when separation is disabled.
    pub fn backend(&self) -> Option<&BackendDescriptor> {
        self.selection.descriptor()
    }

    /// Candidates that failed during startup selection, in attempt order.
    pub fn backend_failures(&self) -> &[BackendFailure] {
        self.selection.failures()
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Separate `input_path` synchronously without creating a job.
    ///
    /// # Errors
    /// `SeparationUnavailable` without a backend; `UnsupportedAudioFormat`,
    /// `Inference`/`RemoteInference` or `Io` from the pipeline.
    pub fn separate(&self, input_path: &Path) -> Result<SeparatedStems> {
        self.selection.require()?;
        let cancel = CancelToken::new();
        let result = self.execute(input_path, &cancel, &mut |_| {});
        self.record_outcome(&result);
        result
    }

    /// Create a job for `input_path` and run it on the blocking pool.
    ///
    /// Must be called from within a Tokio runtime. A panic inside the worker
    /// marks the job `failed`.
    ///
    /// # Errors
    /// `SeparationUnavailable` without a backend (no job is created).
    pub fn submit(self: &Arc<Self>, input_path: impl Into<PathBuf>, title: &str) -> Result<String> {
        self.selection.require()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SeparationError::Other(anyhow::anyhow!("no tokio runtime: {e}")))?;

        let input_path = input_path.into();
        let job_id = self.jobs.create(JobKind::Separation, title);

        let engine = Arc::clone(self);
        let id = job_id.clone();
        let worker = runtime.spawn_blocking(move || {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| engine.run_job(&id, &input_path)));
            // Ok outcomes are already recorded in the registry.
            if let Err(payload) = outcome {
                engine.record_panic(&id, &*payload);
            }
        });

        let mut workers = self.workers.lock();
        workers.retain(|w| !w.is_finished());
        workers.push(worker);
        Ok(job_id)
    }

    /// Wait until every worker started by [`submit`](Self::submit) has
    /// returned. A cancelled job's worker runs on to its next checkpoint and
    /// cleans up its scratch files there; await this before shutting down.
    pub async fn wait_for_workers(&self) {
        loop {
            let pending = std::mem::take(&mut *self.workers.lock());
            if pending.is_empty() {
                return;
            }
            for worker in pending {
                if let Err(e) = worker.await {
                    warn!(error = %e, "separation worker aborted");
                }
            }
        }
    }

    /// Synchronous body of a submitted job. Records the outcome on the job.
    pub fn run_job(&self, job_id: &str, input_path: &Path) -> Result<SeparatedStems> {
        let cancel = self.jobs.cancel_token(job_id)?;
        let mut on_progress = |percent: u32| {
            // Rejected once the job left `running`; the next checkpoint stops us.
            let _ = self.jobs.set_progress(job_id, percent);
        };
        let outcome = self.execute(input_path, &cancel, &mut on_progress);
        let result = self.finish_job(job_id, outcome);
        self.record_outcome(&result);
        result
    }

    /// Move the job to its terminal state for `outcome`.
    ///
    /// Stems of a job cancelled after the last checkpoint are deleted and
    /// the run is reported as `Cancelled`.
    fn finish_job(&self, job_id: &str, outcome: Result<SeparatedStems>) -> Result<SeparatedStems> {
        match outcome {
            Ok(stems) => match self.jobs.complete(job_id, stems.clone()) {
                Ok(()) => Ok(stems),
                Err(e) => {
                    warn!(job_id, error = %e, "job finished after cancellation; discarding stems");
                    stems.remove_files();
                    Err(SeparationError::Cancelled)
                }
            },
            Err(SeparationError::Cancelled) => Err(SeparationError::Cancelled),
            Err(e) => {
                if let Err(state) = self.jobs.fail(job_id, e.to_string()) {
                    warn!(job_id, error = %state, "could not record job failure");
                }
                Err(e)
            }
        }
    }

    fn record_panic(&self, job_id: &str, payload: &(dyn Any + Send)) {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(job_id, %reason, "separation worker panicked");
        if let Err(e) = self.jobs.fail(job_id, format!("separation panicked: {reason}")) {
            warn!(job_id, error = %e, "could not record job failure");
        }
        self.diagnostics
            .separations_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, result: &Result<SeparatedStems>) {
        let counter = match result {
            Ok(_) => &self.diagnostics.separations_completed,
            Err(SeparationError::Cancelled) => &self.diagnostics.separations_cancelled,
            Err(_) => &self.diagnostics.separations_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn execute(
        &self,
        input_path: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u32),
    ) -> Result<SeparatedStems> {
        let estimator = self.selection.require()?;
        self.diagnostics
            .separations_started
            .fetch_add(1, Ordering::Relaxed);

        pipeline::run(
            pipeline::PipelineContext {
                config: &self.config,
                plan: &self.plan,
                estimator,
                cancel,
                diagnostics: &self.diagnostics,
            },
            input_path,
            progress,
        )
    }
}
