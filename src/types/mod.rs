use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw position reading from the platform location provider
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed in m/s
    #[serde(default)]
    pub speed: f64,
    /// Sensor-reported course in degrees, when the platform has one
    #[serde(default)]
    pub heading_hint: Option<f64>,
}

impl Fix {
    pub fn new(latitude: f64, longitude: f64, speed: f64, heading_hint: Option<f64>) -> Self {
        Self {
            latitude,
            longitude,
            speed: speed.max(0.0),
            heading_hint,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }

    /// Usable heading hint: present, finite and non-negative
    pub fn valid_heading_hint(&self) -> Option<f64> {
        self.heading_hint
            .filter(|h| h.is_finite() && *h >= 0.0)
            .map(|h| h % 360.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A fix with the heading snapshot taken when it was enriched
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichedSample {
    pub fix: Fix,
    pub heading: f64,
    pub timestamp: DateTime<Utc>,
}

impl EnrichedSample {
    pub fn new(fix: Fix, heading: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            fix,
            heading,
            timestamp,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.fix.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.fix.longitude
    }

    pub fn speed_kph(&self) -> f64 {
        self.fix.speed * 3.6
    }
}

/// An enriched sample plus the address resolved for it
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSample {
    pub sample: EnrichedSample,
    pub address: String,
}
