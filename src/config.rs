use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::monitor::TrackingOptions;
use crate::providers::DEFAULT_REQUEST_TIMEOUT;
use crate::queue::OrchestratorConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Configuration file structure for buildpilot.
///
/// Holds the server connection and the defaults the CLI passes to the
/// orchestrator and the monitor. The library never reads it on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// TeamCity server base URL
    pub url: Option<String>,

    /// TeamCity access token
    pub token: Option<String>,

    /// Per-request timeout in seconds
    pub timeout_secs: Option<u64>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        self.timeout_secs
            .map_or(DEFAULT_REQUEST_TIMEOUT, |secs| Duration::from_secs(secs.max(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: f64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QueueConfig {
    /// Submissions in flight when queueing several builds
    pub batch_concurrency: usize,

    /// Refuse personal builds once this many are queued for a configuration
    pub max_personal_builds: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MonitorConfig {
    pub polling_interval_ms: u64,
    pub stall_threshold_ms: u64,
    pub max_retries: u32,
    pub max_duration_secs: Option<u64>,
    pub calculate_velocity: bool,
    pub use_historical_data: bool,
    pub track_stages: bool,
    pub calculate_stage_metrics: bool,
    pub include_tests: bool,
    pub include_problems: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            delay_ms: millis(policy.delay),
            backoff: policy.backoff,
            max_delay_ms: millis(policy.max_delay),
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            reset_timeout_ms: millis(config.reset_timeout),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let config = OrchestratorConfig::default();
        Self {
            batch_concurrency: config.batch_concurrency,
            max_personal_builds: config.max_personal_builds,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let options = TrackingOptions::default();
        Self {
            polling_interval_ms: millis(options.polling_interval),
            stall_threshold_ms: millis(options.stall_threshold),
            max_retries: options.max_retries,
            max_duration_secs: options.max_duration.map(|d| d.as_secs()),
            calculate_velocity: options.calculate_velocity,
            use_historical_data: options.use_historical_data,
            track_stages: options.track_stages,
            calculate_stage_metrics: options.calculate_stage_metrics,
            include_tests: options.include_tests,
            include_problems: options.include_problems,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            delay: Duration::from_millis(self.delay_ms),
            backoff: self.backoff,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            success_threshold: self.success_threshold.max(1),
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }
}

impl QueueConfig {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            batch_concurrency: self.batch_concurrency,
            max_personal_builds: self.max_personal_builds,
        }
    }
}

impl MonitorConfig {
    pub fn tracking_options(&self) -> TrackingOptions {
        TrackingOptions {
            polling_interval: Duration::from_millis(self.polling_interval_ms),
            calculate_velocity: self.calculate_velocity,
            use_historical_data: self.use_historical_data,
            track_stages: self.track_stages,
            calculate_stage_metrics: self.calculate_stage_metrics,
            include_tests: self.include_tests,
            include_problems: self.include_problems,
            stall_threshold: Duration::from_millis(self.stall_threshold_ms),
            max_retries: self.max_retries.max(1),
            max_duration: self.max_duration_secs.map(Duration::from_secs),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./buildpilot.toml
    /// 3. ./buildpilot.json
    /// 4. ./buildpilot.yaml
    /// 5. ./buildpilot.yml
    /// 6. `<config dir>/buildpilot/config.toml`
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Ok(Self::default());
            }
            return Self::load_from_path(path);
        }

        let candidates = ["buildpilot.toml", "buildpilot.json", "buildpilot.yaml", "buildpilot.yml"];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        if let Some(path) = Self::user_config_path().filter(|p| p.exists()) {
            return Self::load_from_path(&path);
        }

        Ok(Self::default())
    }

    /// Per-user configuration file location.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("buildpilot").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => {
                // Try TOML first, then JSON, then YAML
                toml::from_str(&contents)
                    .or_else(|_| serde_json::from_str(&contents))
                    .or_else(|_| serde_yaml::from_str(&contents))
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}
