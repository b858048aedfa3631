//! Supervisor configuration.
//!
//! Loaded from TOML, searched in the current directory and the user config
//! directory. Every field has a default so an empty file (or no file) yields
//! a working configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::DEFAULT_MAX_LINE_LEN;

/// Engine invocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the engine binary.
    pub executable: PathBuf,
    /// Arguments passed to the engine.
    pub args: Vec<String>,
    /// Extra environment variables, on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// `RUST_LOG` override for the engine process.
    pub log_level: Option<String>,
    /// Working directory for the engine process.
    pub working_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./target/release/solana-nexus-trader"),
            args: Vec::new(),
            env: HashMap::new(),
            log_level: Some("info".to_string()),
            working_dir: None,
        }
    }
}

/// Build step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Whether to run the build step before launching.
    pub enabled: bool,
    /// Build program.
    pub program: String,
    /// Build arguments.
    pub args: Vec<String>,
    /// Directory the build runs in.
    pub working_dir: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "cargo".to_string(),
            args: vec!["build".to_string(), "--release".to_string()],
            working_dir: None,
        }
    }
}

/// Timing constants for the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for the engine to report readiness after launch, in seconds.
    pub init_secs: u64,
    /// Grace window for cooperative shutdown before force kill, in seconds.
    pub grace_secs: u64,
    /// Default per-command reply timeout, in seconds.
    pub command_secs: u64,
    /// Granularity of the pending-request timeout sweep, in milliseconds.
    pub sweep_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_secs: 30,
            grace_secs: 5,
            command_secs: 10,
            sweep_millis: 100,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn init(&self) -> Duration {
        Duration::from_secs(self.init_secs)
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    #[must_use]
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub fn sweep(&self) -> Duration {
        Duration::from_millis(self.sweep_millis.max(1))
    }
}

/// Line decoder limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Maximum accepted line length in bytes; longer lines are dropped.
    pub max_line_len: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub engine: EngineConfig,
    pub build: BuildConfig,
    pub timeouts: TimeoutConfig,
    pub decoder: DecoderConfig,
}

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default search paths.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = Vec::new();

        // 1. Current directory: .nexus-supervisor.toml
        search_paths.push(PathBuf::from(".nexus-supervisor.toml"));

        // 2. User config directory: ~/.config/nexus-supervisor/config.toml
        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("nexus-supervisor").join("config.toml"));
        }

        Self { search_paths }
    }

    /// Create a config loader with a specific config file path.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            search_paths: vec![path],
        }
    }

    /// Load configuration from the first available file, or return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(&self) -> Result<SupervisorConfig, ConfigError> {
        for path in &self.search_paths {
            if path.exists() {
                tracing::debug!(path = %path.display(), "Loading config file");
                return Self::load_from_path(path);
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(SupervisorConfig::default())
    }

    /// Get the search paths for debugging.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn load_from_path(path: &PathBuf) -> Result<SupervisorConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.clone(),
            source: e,
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}
