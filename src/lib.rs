//! Vehicle telemetry relay.
//!
//! Samples device position, derives a stable heading, resolves an address
//! for each sample and relays it over two channels: a latest-wins live PUT
//! and a durable, persisted POST outbox.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod geocode;
pub mod geodesy;
pub mod heading;
pub mod live;
pub mod location;
pub mod notification;
pub mod outbox;
pub mod service;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::TelemetryConfig;
pub use error::{Result, TelemetryError};
pub use service::TelemetryService;
pub use stats::StatsSnapshot;
pub use types::{EnrichedSample, Fix, Position, ResolvedSample};
