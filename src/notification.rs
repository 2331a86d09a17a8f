use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::NotifyError;
use crate::types::EnrichedSample;

/// What the host's foreground status display shows for the latest sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub title: String,
    pub body: String,
    pub speed_kph: f64,
    pub heading: f64,
    /// Truncated to 4 decimals
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: String,
}

impl StatusNotification {
    pub fn from_sample(sample: &EnrichedSample) -> Self {
        let speed_kph = sample.speed_kph();
        let latitude = truncate4(sample.latitude());
        let longitude = truncate4(sample.longitude());
        Self {
            title: "Tracking active".to_string(),
            body: format!(
                "{:.0} km/h, heading {:.0}°, {:.4}, {:.4}",
                speed_kph, sample.heading, latitude, longitude
            ),
            speed_kph,
            heading: sample.heading,
            latitude,
            longitude,
            timestamp: crate::outbox::iso_timestamp(&sample.timestamp),
        }
    }
}

fn truncate4(value: f64) -> f64 {
    (value * 10_000.0).trunc() / 10_000.0
}

/// Best-effort status display. Callers log and drop errors.
pub trait StatusNotifier: Send + Sync {
    fn update(&self, status: &StatusNotification) -> Result<(), NotifyError>;
}

/// Writes the status line to the log at debug level
#[derive(Debug, Default)]
pub struct LogNotifier;

impl StatusNotifier for LogNotifier {
    fn update(&self, status: &StatusNotification) -> Result<(), NotifyError> {
        log::debug!("[status] {}: {}", status.title, status.body);
        Ok(())
    }
}

/// Overwrites a JSON document with the latest status, for external viewers
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusNotifier for StatusFile {
    fn update(&self, status: &StatusNotification) -> Result<(), NotifyError> {
        let json = serde_json::to_string_pretty(status).map_err(|e| NotifyError::Failed(e.to_string()))?;
        fs::write(&self.path, json)
            .map_err(|e| NotifyError::Failed(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fix;
    use chrono::TimeZone;
    use chrono::Utc;

    fn sample() -> EnrichedSample {
        let ts = Utc.with_ymd_and_hms(2025, 11, 19, 8, 30, 0).unwrap();
        EnrichedSample::new(Fix::new(19.432_678, -99.133_219, 12.5, None), 271.4, ts)
    }

    #[test]
    fn test_notification_content() {
        let status = StatusNotification::from_sample(&sample());
        assert_eq!(status.speed_kph, 45.0);
        assert_eq!(status.latitude, 19.4326);
        assert_eq!(status.longitude, -99.1332);
        assert_eq!(status.body, "45 km/h, heading 271°, 19.4326, -99.1332");
        assert_eq!(status.timestamp, "2025-11-19T08:30:00.000Z");
    }

    #[test]
    fn test_status_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let notifier = StatusFile::new(&path);

        let status = StatusNotification::from_sample(&sample());
        notifier.update(&status).unwrap();

        let saved: StatusNotification = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, status);
    }

    #[test]
    fn test_status_file_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = StatusFile::new(dir.path().join("missing").join("status.json"));
        let status = StatusNotification::from_sample(&sample());
        assert!(matches!(notifier.update(&status), Err(NotifyError::Failed(_))));
    }
}
