use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use super::queue::OutboxQueue;
use super::record::{DeviceIdentity, TelemetryRecord};
use crate::error::TransportError;
use crate::stats::Stats;
use crate::storage::KeyValueStore;
use crate::transport::HttpTransport;
use crate::types::ResolvedSample;

/// Result of a queue flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed(usize),
    Failed,
}

/// Result of one timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No geocoded sample yet
    Skipped,
    /// POST accepted; `flushed` is set when the tick reconnected and drained the queue
    Delivered { flushed: Option<FlushOutcome> },
    /// POST failed and the record was queued
    Queued { depth: usize },
}

struct OutboxState<S: KeyValueStore> {
    queue: OutboxQueue<S>,
    is_online: bool,
    loaded: bool,
    /// Last flush failed; the next successful tick retries it
    flush_pending: bool,
    /// Bumped by `clear`, so a flush started before it cannot touch the new queue
    generation: u64,
}

/// Periodic, durable POST channel.
///
/// # State Machine
/// - Online + POST ok: stay online
/// - POST fails: go offline, queue the record (persisted)
/// - Offline + POST ok: go online, then flush the whole queue as one batch
///
/// A failed flush leaves the queue and the counters alone; the next
/// successful tick tries again, online or not.
pub struct OutboxSync<T: HttpTransport, S: KeyValueStore> {
    transport: Arc<T>,
    url: String,
    identity: DeviceIdentity,
    interval: Duration,
    last_known: watch::Receiver<Option<ResolvedSample>>,
    stats: Arc<Stats>,
    state: Mutex<OutboxState<S>>,
}

impl<T: HttpTransport, S: KeyValueStore> OutboxSync<T, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<T>,
        url: String,
        identity: DeviceIdentity,
        interval: Duration,
        last_known: watch::Receiver<Option<ResolvedSample>>,
        stats: Arc<Stats>,
        store: Arc<S>,
        queue_key: &str,
    ) -> Self {
        Self {
            transport,
            url,
            identity,
            interval,
            last_known,
            stats,
            state: Mutex::new(OutboxState {
                queue: OutboxQueue::new(store, queue_key),
                is_online: true,
                loaded: false,
                flush_pending: false,
                generation: 0,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, OutboxState<S>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load the persisted queue. Only the first call reads storage.
    pub fn load_persisted(&self) -> usize {
        let mut state = self.lock_state();
        if state.loaded {
            return state.queue.len();
        }
        state.loaded = true;
        match state.queue.load() {
            Ok(0) => 0,
            Ok(n) => {
                log::info!("Loaded {} pending outbox records", n);
                n
            }
            Err(e) => {
                log::error!("Failed to load outbox queue, starting empty: {}", e);
                0
            }
        }
    }

    /// Timer loop; returns once `shutdown` flips or its sender is dropped.
    ///
    /// The first tick fires one full interval after start. A tick already in
    /// progress is allowed to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Outbox sync started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
        }

        log::info!("Outbox sync stopped with {} records pending", self.queue_depth());
    }

    pub async fn tick(&self) -> TickOutcome {
        let resolved = self.last_known.borrow().clone();
        let Some(resolved) = resolved else {
            log::debug!("Outbox tick skipped, no sample yet");
            return TickOutcome::Skipped;
        };

        let record = TelemetryRecord::new(&resolved, &self.identity);
        self.stats.outbox.record_attempt();

        match self.post_records(std::slice::from_ref(&record)).await {
            Ok(()) => {
                self.stats.outbox.record_success();
                let (was_offline, should_flush) = {
                    let mut state = self.lock_state();
                    let was_offline = !state.is_online;
                    state.is_online = true;
                    if state.queue.is_empty() {
                        state.flush_pending = false;
                    }
                    let should_flush = (was_offline || state.flush_pending) && !state.queue.is_empty();
                    (was_offline, should_flush)
                };

                if was_offline {
                    log::info!("Outbox back online");
                }
                let flushed = if should_flush {
                    Some(self.flush().await)
                } else {
                    None
                };
                TickOutcome::Delivered { flushed }
            }
            Err(e) => {
                self.stats.outbox.record_failure();
                let mut state = self.lock_state();
                if state.is_online {
                    log::warn!("Outbox went offline: {}", e);
                } else {
                    log::debug!("Outbox still offline: {}", e);
                }
                state.is_online = false;
                if let Err(e) = state.queue.push(record) {
                    log::error!("Outbox record kept in memory only: {}", e);
                }
                TickOutcome::Queued {
                    depth: state.queue.len(),
                }
            }
        }
    }

    /// Send the whole queue as one batch; all-or-nothing
    async fn flush(&self) -> FlushOutcome {
        let (batch, generation) = {
            let state = self.lock_state();
            (state.queue.snapshot(), state.generation)
        };
        if batch.is_empty() {
            return FlushOutcome::Flushed(0);
        }
        log::info!("Flushing {} queued outbox records", batch.len());

        let sent = self.post_records(&batch).await;
        let mut state = self.lock_state();
        if state.generation != generation {
            log::info!(
                "Outbox cleared during flush of {} records, leaving the new queue alone",
                batch.len()
            );
            return match sent {
                Ok(()) => FlushOutcome::Flushed(batch.len()),
                Err(_) => FlushOutcome::Failed,
            };
        }

        match sent {
            Ok(()) => {
                let n = batch.len();
                state.flush_pending = false;
                let removed = match state.queue.remove_front(n) {
                    Ok(removed) => removed,
                    Err(e) => {
                        log::error!("Flushed batch removed in memory only: {}", e);
                        n.min(state.queue.len())
                    }
                };
                if removed != n {
                    log::warn!("Queue changed during flush: sent {}, removed {}", n, removed);
                }
                self.stats.outbox.recover_failures(n as u64);
                self.stats.outbox.record_extra(n as u64);
                FlushOutcome::Flushed(n)
            }
            Err(e) => {
                state.flush_pending = true;
                log::warn!("Outbox flush of {} records failed: {}", batch.len(), e);
                FlushOutcome::Failed
            }
        }
    }

    async fn post_records(&self, records: &[TelemetryRecord]) -> Result<(), TransportError> {
        let body = serde_json::to_string(records).map_err(|e| TransportError::Body(e.to_string()))?;
        self.transport.post_json(&self.url, body).await
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn queued_records(&self) -> Vec<TelemetryRecord> {
        self.lock_state().queue.snapshot()
    }

    pub fn is_online(&self) -> bool {
        self.lock_state().is_online
    }

    /// Drop every queued record, including the persisted copy
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.generation += 1;
        state.flush_pending = false;
        if let Err(e) = state.queue.clear() {
            log::error!("Failed to delete persisted outbox queue: {}", e);
        }
    }
}
