//! In-memory job registry.
//!
//! Tracks long-running separations: status, monotonic progress, error text,
//! output paths and a cooperative cancellation token per job. State is
//! ephemeral and does not survive a restart.
//!
//! ```text
//!            create
//!              │
//!              ▼
//!          running ──complete──► completed
//!              │ ├────fail─────► failed
//!              │ └───cancel────► cancelled
//!              ▼
//!   (terminal states reject every mutation except delete)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::SeparatedStems;
use crate::error::{Result, SeparationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum JobKind {
    /// Vocal/instrumental separation of one input file.
    Separation,
}

/// Shared cancellation flag checked at pipeline checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// # Errors
    /// `Cancelled` once [`CancelToken::cancel`] has been called.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SeparationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Snapshot of a job, as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub label: String,
    pub status: JobStatus,
    /// 0–100, never decreases.
    pub progress: u8,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub output: Option<SeparatedStems>,
}

struct JobEntry {
    record: JobRecord,
    cancel: CancelToken,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new `running` job at progress 0.
    pub fn create(&self, kind: JobKind, label: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = JobRecord {
            id: id.clone(),
            kind,
            label: label.into(),
            status: JobStatus::Running,
            progress: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            output: None,
        };
        info!(job_id = %id, label = %record.label, "job created");
        self.jobs.lock().insert(
            id.clone(),
            JobEntry {
                record,
                cancel: CancelToken::new(),
            },
        );
        id
    }

    pub fn get(&self, job_id: &str) -> Result<JobRecord> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| SeparationError::JobNotFound(job_id.to_string()))
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> =
            self.jobs.lock().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Raise progress; values above 100 clamp, lower values than the stored
    /// one are ignored.
    ///
    /// # Errors
    /// `InvalidState` unless the job is `running`.
    pub fn set_progress(&self, job_id: &str, percent: u32) -> Result<()> {
        self.with_running(job_id, |record, _| {
            let clamped = percent.min(100) as u8;
            if clamped > record.progress {
                record.progress = clamped;
                record.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    /// Flag the job for cancellation and mark it `cancelled` immediately.
    ///
    /// # Errors
    /// `InvalidState` unless the job is `running`; the record is untouched.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        self.with_running(job_id, |record, cancel| {
            cancel.cancel();
            record.status = JobStatus::Cancelled;
            record.updated_at = Utc::now();
            Ok(())
        })?;
        info!(job_id, "job cancelled");
        Ok(())
    }

    /// # Errors
    /// `InvalidState` unless the job is `running`.
    pub fn complete(&self, job_id: &str, output: SeparatedStems) -> Result<()> {
        self.with_running(job_id, |record, _| {
            record.status = JobStatus::Completed;
            record.progress = 100;
            record.output = Some(output);
            record.updated_at = Utc::now();
            Ok(())
        })?;
        info!(job_id, "job completed");
        Ok(())
    }

    /// # Errors
    /// `InvalidState` unless the job is `running`.
    pub fn fail(&self, job_id: &str, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.with_running(job_id, |record, _| {
            record.status = JobStatus::Failed;
            record.error_message = Some(message.clone());
            record.updated_at = Utc::now();
            Ok(())
        })?;
        info!(job_id, error = %message, "job failed");
        Ok(())
    }

    /// The token the executing context polls at its checkpoints.
    pub fn cancel_token(&self, job_id: &str) -> Result<CancelToken> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|e| e.cancel.clone())
            .ok_or_else(|| SeparationError::JobNotFound(job_id.to_string()))
    }

    /// Remove a terminal job and return its final record.
    ///
    /// # Errors
    /// `InvalidState` while the job is `running`.
    pub fn delete(&self, job_id: &str) -> Result<JobRecord> {
        let mut jobs = self.jobs.lock();
        let status = jobs
            .get(job_id)
            .map(|e| e.record.status)
            .ok_or_else(|| SeparationError::JobNotFound(job_id.to_string()))?;
        if !status.is_terminal() {
            return Err(SeparationError::InvalidState {
                job_id: job_id.to_string(),
                status,
            });
        }
        let entry = jobs
            .remove(job_id)
            .ok_or_else(|| SeparationError::JobNotFound(job_id.to_string()))?;
        debug!(job_id, %status, "job deleted");
        Ok(entry.record)
    }

    fn with_running<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobRecord, &CancelToken) -> Result<T>,
    ) -> Result<T> {
        let mut jobs = self.jobs.lock();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SeparationError::JobNotFound(job_id.to_string()))?;
        if entry.record.status != JobStatus::Running {
            return Err(SeparationError::InvalidState {
                job_id: job_id.to_string(),
                status: entry.record.status,
            });
        }
        f(&mut entry.record, &entry.cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn stems() -> SeparatedStems {
        SeparatedStems {
            vocals_path: PathBuf::from("/tmp/v.wav"),
            instrumental_path: PathBuf::from("/tmp/i.wav"),
            sample_rate: 44_100,
        }
    }

    #[test]
    fn new_job_starts_running_at_zero() {
        let reg = JobRegistry::new();
        let id = reg.create(JobKind::Separation, "Song A");
        let job = reg.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 0);
        assert_eq!(job.label, "Song A");
        assert!(job.error_message.is_none());
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn ids_are_unique() {
        let reg = JobRegistry::new();
        let a = reg.create(JobKind::Separation, "a");
        let b = reg.create(JobKind::Separation, "b");
        assert_ne!(a, b);
        assert_eq!(reg.list().len(), 2);
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let reg = JobRegistry::new();
        let id = reg.create(JobKind::Separation, "x");
        reg.set_progress(&id, 40).unwrap();
        reg.set_progress(&id, 10).unwrap();
        assert_eq!(reg.get(&id).unwrap().progress, 40);
        reg.set_progress(&id, 250).unwrap();
        assert_eq!(reg.get(&id).unwrap().progress, 100);
    }

    #[test]
    fn cancel_running_then_delete() {
        let reg = JobRegistry::new();
        let id = reg.create(JobKind::Separation, "x");
        let token = reg.cancel_token(&id).unwrap();
        assert!(token.checkpoint().is_ok());

        reg.cancel(&id).unwrap();
        assert_eq!(reg.get(&id).unwrap().status, JobStatus::Cancelled);
        assert!(token.is_cancelled());
        assert!(matches!(token.checkpoint(), Err(SeparationError::Cancelled)));

        let removed = reg.delete(&id).unwrap();
        assert_eq!(removed.status, JobStatus::Cancelled);
        assert!(matches!(reg.get(&id), Err(SeparationError::JobNotFound(_))));
    }

    #[test]
    fn cancel_completed_job_is_invalid_and_leaves_status() {
        let reg = JobRegistry::new();
        let id = reg.create(JobKind::Separation, "x");
        reg.complete(&id, stems()).unwrap();

        let err = reg.cancel(&id).unwrap_err();
        assert!(matches!(
            err,
            SeparationError::InvalidState {
                status: JobStatus::Completed,
                ..
            }
        ));
        let job = reg.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.output, Some(stems()));
        assert!(!reg.cancel_token(&id).unwrap().is_cancelled());
    }

    #[test]
    fn delete_running_job_is_rejected() {
        let reg = JobRegistry::new();
        let id = reg.create(JobKind::Separation, "x");
        assert!(matches!(
            reg.delete(&id),
            Err(SeparationError::InvalidState {
                status: JobStatus::Running,
                ..
            })
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn terminal_jobs_reject_mutation() {
        let reg = JobRegistry::new();
        let id = reg.create(JobKind::Separation, "x");
        reg.fail(&id, "decode failed").unwrap();
        assert!(reg.set_progress(&id, 50).is_err());
        assert!(reg.complete(&id, stems()).is_err());
        assert!(reg.fail(&id, "again").is_err());
        let job = reg.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("decode failed"));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let reg = JobRegistry::new();
        assert!(matches!(reg.cancel("nope"), Err(SeparationError::JobNotFound(_))));
        assert!(matches!(reg.delete("nope"), Err(SeparationError::JobNotFound(_))));
    }

    #[test]
    fn concurrent_updates_do_not_corrupt_records() {
        let reg = Arc::new(JobRegistry::new());
        let ids: Vec<String> = (0..8)
            .map(|i| reg.create(JobKind::Separation, format!("job {i}")))
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for p in 0..=100 {
                        reg.set_progress(&id, p).unwrap();
                    }
                    reg.complete(&id, stems()).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for id in &ids {
            let job = reg.get(id).unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.progress, 100);
        }
    }

    #[test]
    fn record_serialises_camel_case_lowercase_status() {
        let reg = JobRegistry::new();
        let id = reg.create(JobKind::Separation, "x");
        let json = serde_json::to_value(reg.get(&id).unwrap()).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["kind"], "separation");
        assert!(json.get("errorMessage").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
