use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;

use crate::geocode::GeocodeCache;
use crate::outbox::{iso_timestamp, DeviceIdentity};
use crate::stats::Stats;
use crate::transport::HttpTransport;
use crate::types::{EnrichedSample, ResolvedSample};

/// Per-submission progress callback for the caller that submitted a sample
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The single outstanding sample waiting for the live worker
pub struct PendingLiveUpdate {
    pub sample: EnrichedSample,
    pub on_log: Option<LogCallback>,
}

/// Body of the live-state PUT
#[derive(Debug, Serialize)]
struct LivePayload<'a> {
    #[serde(rename = "deviceID")]
    device_id: &'a str,
    #[serde(rename = "accountID")]
    account_id: &'a str,
    #[serde(rename = "lastValidLatitude")]
    latitude: f64,
    #[serde(rename = "lastValidLongitude")]
    longitude: f64,
    #[serde(rename = "lastValidHeading")]
    heading: f64,
    /// km/h, same unit as the outbox records
    #[serde(rename = "lastValidSpeed")]
    speed: f64,
    #[serde(rename = "lastValidDate")]
    date: String,
    #[serde(rename = "direccion")]
    address: &'a str,
}

impl<'a> LivePayload<'a> {
    fn new(resolved: &'a ResolvedSample, identity: &'a DeviceIdentity) -> Self {
        let sample = &resolved.sample;
        Self {
            device_id: &identity.device_id,
            account_id: &identity.account_id,
            latitude: sample.latitude(),
            longitude: sample.longitude(),
            heading: sample.heading,
            speed: sample.speed_kph(),
            date: iso_timestamp(&sample.timestamp),
            address: &resolved.address,
        }
    }
}

#[derive(Default)]
struct LiveState {
    in_flight: bool,
    pending: Option<PendingLiveUpdate>,
}

/// Latest-wins PUT channel with at most one request in flight.
///
/// `submit` only parks the sample in the pending slot. A single worker task
/// drains the slot; samples that arrive while it is busy overwrite each other
/// so only the newest one is ever sent. A sample that goes stale while its
/// address is being resolved is dropped before the PUT.
pub struct LiveDispatcher<T: HttpTransport> {
    transport: Arc<T>,
    geocoder: Arc<GeocodeCache<T>>,
    url: String,
    identity: DeviceIdentity,
    stats: Arc<Stats>,
    last_known: watch::Sender<Option<ResolvedSample>>,
    state: Mutex<LiveState>,
}

/// Clears `in_flight` if the worker ends without reaching its normal exit
/// (task aborted or panicked).
struct InFlightGuard<'a, T: HttpTransport> {
    dispatcher: &'a LiveDispatcher<T>,
    armed: bool,
}

impl<T: HttpTransport> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("Live worker ended abnormally, clearing in-flight flag");
            self.dispatcher.lock_state().in_flight = false;
        }
    }
}

impl<T: HttpTransport> LiveDispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        geocoder: Arc<GeocodeCache<T>>,
        url: String,
        identity: DeviceIdentity,
        stats: Arc<Stats>,
        last_known: watch::Sender<Option<ResolvedSample>>,
    ) -> Self {
        Self {
            transport,
            geocoder,
            url,
            identity,
            stats,
            last_known,
            state: Mutex::new(LiveState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `sample` for the live channel, replacing any unsent one.
    ///
    /// Counts as an attempt immediately, even if a newer sample later
    /// supersedes it before transmission.
    pub fn submit(self: &Arc<Self>, sample: EnrichedSample, on_log: Option<LogCallback>) {
        self.stats.live.record_attempt();

        let start_worker = {
            let mut state = self.lock_state();
            let update = PendingLiveUpdate { sample, on_log };
            if let Some(dropped) = state.pending.replace(update) {
                self.stats.live.record_extra(1);
                emit(&dropped.on_log, "superseded by a newer sample before sending");
            }
            if state.in_flight {
                false
            } else {
                state.in_flight = true;
                true
            }
        };

        if start_worker {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drain().await });
        }
    }

    async fn drain(&self) {
        let mut guard = InFlightGuard {
            dispatcher: self,
            armed: true,
        };

        loop {
            // Taking the last pending sample and clearing in_flight happen under
            // one lock, so a concurrent submit either lands here or starts a
            // new worker.
            let next = {
                let mut state = self.lock_state();
                match state.pending.take() {
                    Some(update) => update,
                    None => {
                        state.in_flight = false;
                        guard.armed = false;
                        break;
                    }
                }
            };
            self.process(next).await;
        }
    }

    async fn process(&self, update: PendingLiveUpdate) {
        let PendingLiveUpdate { sample, on_log } = update;
        let resolution = self
            .geocoder
            .resolve(sample.latitude(), sample.longitude())
            .await;
        let resolved = ResolvedSample {
            sample,
            address: resolution.address,
        };

        // The outbox reuses this address instead of geocoding again
        self.last_known.send_replace(Some(resolved.clone()));

        if self.lock_state().pending.is_some() {
            log::debug!("Live sample superseded while resolving address, skipping send");
            self.stats.live.record_extra(1);
            emit(&on_log, "superseded by a newer sample before sending");
            return;
        }

        let body = match serde_json::to_string(&LivePayload::new(&resolved, &self.identity)) {
            Ok(body) => body,
            Err(e) => {
                log::error!("Failed to encode live payload: {}", e);
                self.stats.live.record_failure();
                return;
            }
        };

        match self.transport.put_json(&self.url, body).await {
            Ok(()) => {
                self.stats.live.record_success();
                log::debug!(
                    "Live update sent ({:.5}, {:.5})",
                    resolved.sample.latitude(),
                    resolved.sample.longitude()
                );
                emit(&on_log, &format!("live update sent: {}", resolved.address));
            }
            Err(e) => {
                self.stats.live.record_failure();
                log::warn!("Live update failed: {}", e);
                emit(&on_log, &format!("live update failed: {}", e));
            }
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock_state().in_flight
    }

    pub fn has_pending(&self) -> bool {
        self.lock_state().pending.is_some()
    }

    /// True when no worker is running and nothing is waiting
    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        !state.in_flight && state.pending.is_none()
    }

    /// Drop the unsent sample, if any
    pub fn discard_pending(&self) -> bool {
        self.lock_state().pending.take().is_some()
    }
}

fn emit(on_log: &Option<LogCallback>, message: &str) {
    if let Some(callback) = on_log {
        callback(message);
    }
}
