//! Persistent host settings (JSON file in the app data directory), with
//! environment overrides applied on top.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;
use vocalsplit_core::{
    inference::{DEFAULT_MODEL_NAME, DEFAULT_REMOTE_TIMEOUT_SECS},
    BackendConfig, DevicePreference, EngineConfig,
};

const MIN_REMOTE_TIMEOUT_SECS: u64 = 30;
const MAX_REMOTE_TIMEOUT_SECS: u64 = 7_200;
const MAX_THREADS: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub engine: EngineConfig,
    pub backend: BackendConfig,
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let engine_defaults = EngineConfig::default();
        self.engine.sample_rate = self.engine.sample_rate.clamp(8_000, 192_000);
        if self.engine.work_dir.as_os_str().is_empty() {
            self.engine.work_dir = engine_defaults.work_dir;
        }

        let backend = &mut self.backend;
        backend.remote_url = backend
            .remote_url
            .as_ref()
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
        backend.remote_timeout_secs = backend
            .remote_timeout_secs
            .clamp(MIN_REMOTE_TIMEOUT_SECS, MAX_REMOTE_TIMEOUT_SECS);
        backend.num_threads = backend
            .num_threads
            .filter(|n| *n > 0)
            .map(|n| n.min(MAX_THREADS));
        backend.model_name = backend.model_name.trim().to_string();
        if backend.model_name.is_empty() {
            backend.model_name = DEFAULT_MODEL_NAME.into();
        }
    }

    /// Apply `VOCALSPLIT_*` overrides, reading variables through `lookup`.
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let backend = &mut self.backend;
        if let Some(url) = lookup("VOCALSPLIT_REMOTE_URL") {
            backend.remote_url = Some(url);
        }
        if let Some(raw) = lookup("VOCALSPLIT_REMOTE_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => backend.remote_timeout_secs = secs,
                Err(_) => warn!(value = %raw, "ignoring invalid VOCALSPLIT_REMOTE_TIMEOUT_SECS"),
            }
        }
        if let Some(raw) = lookup("VOCALSPLIT_THREADS") {
            match raw.trim().parse::<usize>() {
                Ok(n) => backend.num_threads = Some(n),
                Err(_) => warn!(value = %raw, "ignoring invalid VOCALSPLIT_THREADS"),
            }
        }
        if let Some(raw) = lookup("VOCALSPLIT_QUANTIZED") {
            match parse_flag(&raw) {
                Some(v) => backend.quantized = v,
                None => warn!(value = %raw, "ignoring invalid VOCALSPLIT_QUANTIZED"),
            }
        }
        if let Some(raw) = lookup("VOCALSPLIT_USE_ONNX") {
            match parse_flag(&raw) {
                Some(v) => backend.use_optimized = v,
                None => warn!(value = %raw, "ignoring invalid VOCALSPLIT_USE_ONNX"),
            }
        }
        if let Some(dir) = lookup("VOCALSPLIT_MODEL_DIR").filter(|d| !d.trim().is_empty()) {
            backend.model_dir = PathBuf::from(dir.trim());
        }
        if let Some(raw) = lookup("VOCALSPLIT_DEVICE") {
            match DevicePreference::parse(&raw) {
                Some(device) => backend.device = device,
                None => warn!(value = %raw, "ignoring invalid VOCALSPLIT_DEVICE"),
            }
        }
        self.normalize();
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vocalsplit")
            .join("settings.json")
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
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

/// File settings with process environment overrides on top.
pub fn load_effective_settings(path: &Path) -> AppSettings {
    let mut settings = load_settings(path);
    settings.apply_env_overrides(|key| std::env::var(key).ok());
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
