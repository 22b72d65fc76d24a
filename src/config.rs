use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for Ride Sync
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RideSyncConfig {
    /// Ride backend connection
    pub backend: BackendConfig,
    /// Order status polling
    pub tracking: TrackingConfig,
    /// History pagination
    pub history: HistoryConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL of the ride REST API
    pub base_url: String,
    /// Bearer token (can be set via env var)
    pub token: Option<String>,
    /// Client-side request rate limit
    pub requests_per_second: u32,
    /// Burst capacity on top of the steady rate
    pub burst_capacity: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            token: None, // Will be read from env var or ride-sync.toml
            requests_per_second: 5,
            burst_capacity: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    /// Fixed delay between polls of one order
    pub poll_interval_secs: u64,
    /// Consecutive failures before tracking is reported as degraded
    pub degraded_threshold: u32,
    /// Deadline applied to every backend call
    pub timeout: TimeoutConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            degraded_threshold: 3,
            timeout: TimeoutConfig::default(),
        }
    }
}

impl TrackingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    pub timeout_ms: u64,
    pub on_timeout: OnTimeout,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            on_timeout: OnTimeout::TreatAsFailure,
        }
    }
}

/// How the tracking loop counts a timed-out poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    #[default]
    TreatAsFailure,
    Ignore,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    pub page_size: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON lines instead of human-readable logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl RideSyncConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (ride-sync.toml, .ride-sync-rc)
    /// 3. Environment variables (prefixed with RIDE_SYNC_, nested with __)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&RideSyncConfig::default())?);

        if Path::new("ride-sync.toml").exists() {
            builder = builder.add_source(File::with_name("ride-sync"));
        }

        if Path::new(".ride-sync-rc").exists() {
            builder = builder.add_source(File::with_name(".ride-sync-rc").format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("RIDE_SYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut ride_sync_config: RideSyncConfig = builder.build()?.try_deserialize()?;

        if ride_sync_config.backend.token.is_none() {
            if let Ok(token) = std::env::var("RIDE_SYNC_TOKEN") {
                ride_sync_config.backend.token = Some(token);
            }
        }

        Ok(ride_sync_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance, used by the binary
static CONFIG: std::sync::LazyLock<Result<RideSyncConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = RideSyncConfig::load_env_file();
        RideSyncConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static RideSyncConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}
