use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};

pub const DEFAULT_LIVE_URL: &str = "https://telemetry.example.com/api/devices/live";
pub const DEFAULT_OUTBOX_URL: &str = "https://telemetry.example.com/api/positions";
pub const DEFAULT_GEOCODE_URL: &str = "https://nominatim.openstreetmap.org/reverse";

/// Pipeline configuration.
///
/// Every field has a default so a config file only needs to name what it
/// overrides. Durations are stored in milliseconds to keep the JSON flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub device_id: String,
    pub account_id: String,
    pub service_code: String,

    pub live_url: String,
    pub outbox_url: String,
    pub geocode_url: String,
    pub user_agent: String,

    pub sync_interval_ms: u64,
    pub geocode_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub initial_fix_timeout_ms: u64,

    pub cache_ttl_ms: u64,
    pub cache_capacity: usize,
    pub min_displacement_m: f64,

    pub storage_dir: PathBuf,
    pub queue_key: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            device_id: "unregistered-device".to_string(),
            account_id: String::new(),
            service_code: String::new(),
            live_url: DEFAULT_LIVE_URL.to_string(),
            outbox_url: DEFAULT_OUTBOX_URL.to_string(),
            geocode_url: DEFAULT_GEOCODE_URL.to_string(),
            user_agent: format!("vehicle-telemetry/{}", env!("CARGO_PKG_VERSION")),
            sync_interval_ms: 30_000,
            geocode_timeout_ms: 8_000,
            request_timeout_ms: 20_000,
            initial_fix_timeout_ms: 5_000,
            cache_ttl_ms: 300_000,
            cache_capacity: 100,
            min_displacement_m: 2.0,
            storage_dir: PathBuf::from("telemetry_store"),
            queue_key: "outbox_queue".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Load a JSON config file, filling unspecified fields with defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TelemetryError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: TelemetryConfig = serde_json::from_str(&text).map_err(|e| {
            TelemetryError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(TelemetryError::Config("device_id must not be empty".into()));
        }
        if self.sync_interval_ms == 0 {
            return Err(TelemetryError::Config("sync_interval_ms must be > 0".into()));
        }
        if self.cache_capacity == 0 {
            return Err(TelemetryError::Config("cache_capacity must be > 0".into()));
        }
        if !(self.min_displacement_m >= 0.0) {
            return Err(TelemetryError::Config(
                "min_displacement_m must be a non-negative number".into(),
            ));
        }
        if self.queue_key.trim().is_empty() {
            return Err(TelemetryError::Config("queue_key must not be empty".into()));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn geocode_timeout(&self) -> Duration {
        Duration::from_millis(self.geocode_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn initial_fix_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_fix_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}
