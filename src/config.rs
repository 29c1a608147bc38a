//! Engine configuration.
//!
//! The heartbeat scanner reads three knobs from a `settings.yaml` at the
//! root of the tasks directory:
//!
//! ```yaml
//! heartbeat:
//!   stale_beats: 3
//!   progress_threshold: 5
//!   auto_transition: true
//! ```
//!
//! A missing file yields the documented defaults; unrecognized keys are
//! ignored. The tasks directory itself comes from `TASK_ENGINE_TASKS_DIR`
//! or defaults to `./tasks`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the tasks directory.
pub const TASKS_DIR_ENV: &str = "TASK_ENGINE_TASKS_DIR";

/// Heartbeat tuning consumed by the checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of consecutive heartbeat entries compared for stuck detection.
    pub stale_beats: usize,
    /// Progress deltas below this (but above zero) across the window count
    /// as "slow".
    pub progress_threshold: i64,
    /// Whether the checker may commit auto-transitions.
    pub auto_transition: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_beats: 3,
            progress_threshold: 5,
            auto_transition: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    heartbeat: EngineConfig,
}

impl EngineConfig {
    /// Load from `settings.yaml` in `dir`, falling back to defaults when
    /// the file is missing or unreadable.
    pub fn load_from(dir: &Path) -> Self {
        let path = dir.join("settings.yaml");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Self::default();
            }
            Err(err) => {
                tracing::warn!("failed to read {}: {}", path.display(), err);
                return Self::default();
            }
        };
        match serde_yaml::from_str::<Settings>(&text) {
            Ok(settings) => settings.heartbeat,
            Err(err) => {
                tracing::warn!("failed to parse {}: {}", path.display(), err);
                Self::default()
            }
        }
    }
}

/// Resolve the tasks directory from the environment or the default.
pub fn tasks_dir() -> PathBuf {
    std::env::var(TASKS_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("tasks"))
}
