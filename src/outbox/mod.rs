pub mod queue;
pub mod record;
pub mod sync;

pub use queue::OutboxQueue;
pub use record::{iso_timestamp, DeviceIdentity, TelemetryRecord};
pub use sync::{FlushOutcome, OutboxSync, TickOutcome};
