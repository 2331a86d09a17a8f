use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TelemetryConfig;
use crate::types::ResolvedSample;

/// Who the telemetry belongs to; stamped on every outgoing payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub account_id: String,
    pub service_code: String,
}

impl DeviceIdentity {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            account_id: config.account_id.clone(),
            service_code: config.service_code.clone(),
        }
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2025-11-19T12:00:00.000Z`
pub fn iso_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Durable unit of the POST channel.
///
/// The serde names are the durable endpoint's field names (including the
/// backend's `sepeedKPH` spelling) and double as the persisted format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "fecha")]
    pub timestamp: String,
    #[serde(rename = "codservicio")]
    pub service_code: String,
    #[serde(rename = "accountID")]
    pub account_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "sepeedKPH")]
    pub speed_kph: f64,
    pub heading: f64,
    pub address: String,
}

impl TelemetryRecord {
    pub fn new(resolved: &ResolvedSample, identity: &DeviceIdentity) -> Self {
        let sample = &resolved.sample;
        Self {
            device_id: identity.device_id.clone(),
            timestamp: iso_timestamp(&sample.timestamp),
            service_code: identity.service_code.clone(),
            account_id: identity.account_id.clone(),
            latitude: sample.latitude(),
            longitude: sample.longitude(),
            speed_kph: sample.speed_kph(),
            heading: sample.heading,
            address: resolved.address.clone(),
        }
    }
}
