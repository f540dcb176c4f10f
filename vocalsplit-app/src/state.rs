//! Host application state.
//!
//! Built once at startup and passed by reference to every command handler.
//! The engine (and with it the selected backend) lives for the whole process.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use vocalsplit_core::{
    engine::DiagnosticsSnapshot, inference::selector::BackendFailure, BackendDescriptor,
    SeparationEngine,
};

use crate::settings::AppSettings;

/// Shared application state, available in every command.
pub struct AppState {
    /// The core engine. `Arc` so blocking tasks can hold it past the command.
    pub engine: Arc<SeparationEngine>,
    /// Settings as loaded at startup (file + environment). Edits are saved to
    /// `settings_path` and apply on next start.
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
}

impl AppState {
    pub fn new(engine: SeparationEngine, settings: AppSettings, settings_path: PathBuf) -> Self {
        Self {
            engine: Arc::new(engine),
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
        }
    }

    pub fn backend_info(&self) -> BackendInfo {
        BackendInfo {
            available: self.engine.is_available(),
            active: self.engine.backend().cloned(),
            failures: self.engine.backend_failures().to_vec(),
            diagnostics: self.engine.diagnostics_snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub available: bool,
    pub active: Option<BackendDescriptor>,
    pub failures: Vec<BackendFailure>,
    pub diagnostics: DiagnosticsSnapshot,
}
