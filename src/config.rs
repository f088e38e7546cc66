use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::compact::CompactionConfig;
use crate::model::ModelRef;
use crate::retry::RetryConfig;

// ── Agent data directory ──────────────────────────────────────────────────────

/// Overrides the agent data directory when set.
pub const AGENT_DIR_ENV: &str = "BRAIDCODE_CODING_AGENT_DIR";
/// Overrides the directory templates/packages are resolved from.
pub const PACKAGE_DIR_ENV: &str = "BRAIDCODE_PACKAGE_DIR";

/// Root of all persisted agent state. Resolved once at session construction;
/// every other path derives from this via documented subpaths.
pub fn agent_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(AGENT_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_default()).join(".local/share")
        })
        .join("braidcode")
}

pub fn package_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(PACKAGE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    agent_dir().join("packages")
}

pub fn sessions_dir() -> PathBuf {
    agent_dir().join("sessions")
}

pub fn auth_path() -> PathBuf {
    agent_dir().join("auth.json")
}

pub fn settings_path() -> PathBuf {
    agent_dir().join("settings.json")
}

pub fn models_path() -> PathBuf {
    agent_dir().join("models.json")
}

/// Encode a working directory as a session subdirectory name:
/// slashes and colons become dashes, the whole thing is wrapped in `--`.
pub fn encode_cwd(cwd: &str) -> String {
    let encoded: String = cwd
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            other => other,
        })
        .collect();
    format!("--{encoded}--")
}

/// Directory holding the session files for one working directory.
pub fn session_dir_for_cwd(cwd: &str) -> PathBuf {
    sessions_dir().join(encode_cwd(cwd))
}

// ── Session configuration ─────────────────────────────────────────────────────

/// Runtime knobs for one session. Configuration flows through this struct —
/// the core keeps no module-level mutable state.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Model context window in tokens.
    pub context_window: u64,
    /// Headroom kept free below the context window; crossing
    /// `context_window - reserve_tokens` triggers auto-compaction.
    pub reserve_tokens: u64,
    /// Token budget for the tail kept verbatim after a compaction cut.
    pub keep_recent_tokens: u64,
    pub retry: RetryConfig,
    pub compaction: CompactionConfig,
    /// Per-tool execution timeout. None disables the timeout.
    pub tool_timeout: Option<std::time::Duration>,
    /// Order tool results by tool_use block index instead of completion time.
    pub sort_tool_results_by_block_index: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_window: 200_000,
            reserve_tokens: 16_384,
            keep_recent_tokens: 20_000,
            retry: RetryConfig::default(),
            compaction: CompactionConfig::default(),
            tool_timeout: None,
            sort_tool_results_by_block_index: false,
        }
    }
}

// ── Settings file ─────────────────────────────────────────────────────────────

/// User-editable settings persisted at `settings.json` under the agent dir.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_recent_tokens: Option<u64>,
    /// Hook bundle paths discovered at startup.
    #[serde(default)]
    pub hook_paths: Vec<String>,
    /// Extra provider endpoints keyed by provider name.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

impl Settings {
    /// Load from disk, or return defaults if the file doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&settings_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings at {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings at {}", path.display()))
    }

    /// Fold the file-level overrides into a session config.
    pub fn apply_to(&self, mut config: SessionConfig) -> SessionConfig {
        if let Some(window) = self.context_window {
            config.context_window = window;
        }
        if let Some(reserve) = self.reserve_tokens {
            config.reserve_tokens = reserve;
        }
        if let Some(keep) = self.keep_recent_tokens {
            config.keep_recent_tokens = keep;
        }
        config
    }
}

// ── Model registry ────────────────────────────────────────────────────────────

/// Load the model registry from `models.json` (a JSON array of
/// provider/model pairs). A missing file is an empty registry.
pub fn load_models() -> Result<Vec<ModelRef>> {
    load_models_from(&models_path())
}

pub fn load_models_from(path: &Path) -> Result<Vec<ModelRef>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read models at {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse models at {}", path.display()))
}
