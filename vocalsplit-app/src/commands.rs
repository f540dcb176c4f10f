//! Request-layer handlers.
//!
//! Each function maps one operation onto the engine and flattens errors to
//! `String`, the shape any transport (CLI, HTTP, IPC) can carry.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use vocalsplit_core::{JobRecord, SeparatedStems};

use crate::settings::{save_settings, AppSettings};
use crate::state::{AppState, BackendInfo};

/// Separate a file synchronously (no job record). Runs on the blocking pool.
pub async fn separate(state: &AppState, input: PathBuf) -> Result<SeparatedStems, String> {
    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || engine.separate(&input))
        .await
        .map_err(|e| format!("separation task panicked: {e}"))?
        .map_err(|e| e.to_string())
}

/// Start a tracked separation and return its job id.
pub async fn submit_job(state: &AppState, input: PathBuf, title: String) -> Result<String, String> {
    if !input.is_file() {
        return Err(format!("input not found: {}", input.display()));
    }
    let id = state
        .engine
        .submit(input, &title)
        .map_err(|e| e.to_string())?;
    info!(job_id = %id, %title, "job submitted");
    Ok(id)
}

pub async fn job_status(state: &AppState, job_id: &str) -> Result<JobRecord, String> {
    state.engine.jobs().get(job_id).map_err(|e| e.to_string())
}

pub async fn list_jobs(state: &AppState) -> Result<Vec<JobRecord>, String> {
    Ok(state.engine.jobs().list())
}

pub async fn cancel_job(state: &AppState, job_id: &str) -> Result<(), String> {
    state.engine.jobs().cancel(job_id).map_err(|e| e.to_string())
}

/// Remove a finished job. With `remove_files`, its stems are deleted too.
pub async fn delete_job(
    state: &AppState,
    job_id: &str,
    remove_files: bool,
) -> Result<JobRecord, String> {
    let record = state.engine.jobs().delete(job_id).map_err(|e| e.to_string())?;
    if remove_files {
        if let Some(output) = &record.output {
            output.remove_files();
        }
    }
    Ok(record)
}

/// Wait for every job worker to return. Cancelled jobs clean up their
/// scratch files at their next checkpoint, so hosts call this before exit.
pub async fn wait_for_workers(state: &AppState) -> Result<(), String> {
    state.engine.wait_for_workers().await;
    Ok(())
}

pub async fn backend_info(state: &AppState) -> Result<BackendInfo, String> {
    Ok(state.backend_info())
}

pub async fn get_settings(state: &AppState) -> Result<AppSettings, String> {
    Ok(state.settings.lock().clone())
}

/// Normalise and persist new settings. They apply on the next start.
pub async fn update_settings(state: &AppState, mut new: AppSettings) -> Result<AppSettings, String> {
    new.normalize();
    save_settings(&state.settings_path, &new).map_err(|e| e.to_string())?;
    *state.settings.lock() = new.clone();
    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use vocalsplit_core::{
        audio, BackendDescriptor, BackendKind, EngineConfig, Estimator, EstimatorHandle,
        JobStatus, OverlapConfig, Selection, SeparationEngine, StubEstimator, Waveform,
    };

    /// Identity with a delay per chunk, so a run lasts long enough to cancel.
    struct SlowEstimator;

    impl Estimator for SlowEstimator {
        fn infer(&mut self, chunk: &Array2<f32>) -> vocalsplit_core::Result<Array2<f32>> {
            std::thread::sleep(std::time::Duration::from_millis(50));
            Ok(chunk.clone())
        }

        fn descriptor(&self) -> BackendDescriptor {
            BackendDescriptor::new(BackendKind::Stub, "slow", "")
        }
    }

    fn files_under(dir: &std::path::Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    out.extend(files_under(&path));
                } else {
                    out.push(path);
                }
            }
        }
        out
    }

    fn state(dir: &std::path::Path, selection: Selection) -> AppState {
        let settings = AppSettings {
            engine: EngineConfig {
                overlap: OverlapConfig {
                    chunk_size: 4_410,
                    num_overlap: 4,
                },
                work_dir: dir.join("work"),
                ..EngineConfig::default()
            },
            ..AppSettings::default()
        };
        let engine = SeparationEngine::new(settings.engine.clone(), selection).unwrap();
        AppState::new(engine, settings, dir.join("settings.json"))
    }

    fn fixture(dir: &std::path::Path) -> PathBuf {
        let interleaved: Vec<f32> = (0..44_100).map(|i| (i % 64) as f32 / 128.0).collect();
        let waveform = Waveform::from_interleaved(&interleaved, 2, 44_100).unwrap();
        let path = dir.join("in.wav");
        audio::write_wav(&path, &waveform).unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn job_lifecycle_through_commands() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(
            dir.path(),
            Selection::with_estimator(EstimatorHandle::new(StubEstimator::new())),
        );
        let input = fixture(dir.path());

        let id = submit_job(&state, input, "track".into()).await.unwrap();
        let record = loop {
            let record = job_status(&state, &id).await.unwrap();
            if record.status.is_terminal() {
                break record;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(list_jobs(&state).await.unwrap().len(), 1);

        let output = record.output.clone().unwrap();
        assert!(output.vocals_path.exists());
        delete_job(&state, &id, true).await.unwrap();
        assert!(!output.vocals_path.exists());
        assert!(!output.instrumental_path.exists());
        assert!(list_jobs(&state).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_job_leaves_no_scratch_files_once_workers_return() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Selection::with_estimator(EstimatorHandle::new(SlowEstimator)));
        let input = fixture(dir.path());

        let id = submit_job(&state, input, "interrupted".into()).await.unwrap();
        loop {
            let record = job_status(&state, &id).await.unwrap();
            if record.progress >= 5 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel_job(&state, &id).await.unwrap();
        assert_eq!(job_status(&state, &id).await.unwrap().status, JobStatus::Cancelled);

        wait_for_workers(&state).await.unwrap();
        assert!(files_under(&dir.path().join("work")).is_empty());
        assert_eq!(state.engine.diagnostics_snapshot().separations_cancelled, 1);
    }

    #[tokio::test]
    async fn commands_report_errors_as_strings() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Selection::unavailable());

        let err = submit_job(&state, dir.path().join("missing.wav"), "x".into())
            .await
            .unwrap_err();
        assert!(err.contains("input not found"));

        let input = fixture(dir.path());
        let err = submit_job(&state, input.clone(), "x".into()).await.unwrap_err();
        assert!(err.contains("unavailable"));
        let err = separate(&state, input).await.unwrap_err();
        assert!(err.contains("unavailable"));

        assert!(cancel_job(&state, "nope").await.unwrap_err().contains("not found"));
        let info = backend_info(&state).await.unwrap();
        assert!(!info.available);
        assert!(info.active.is_none());
    }

    #[tokio::test]
    async fn update_settings_normalises_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), Selection::unavailable());

        let mut new = get_settings(&state).await.unwrap();
        new.backend.remote_url = Some(" http://gpu:8001/ ".into());
        let saved = update_settings(&state, new).await.unwrap();
        assert_eq!(saved.backend.remote_url.as_deref(), Some("http://gpu:8001"));
        assert_eq!(
            crate::settings::load_settings(&state.settings_path),
            saved
        );
    }
}
