use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::TelemetryConfig;
use crate::dashboard::StatsSource;
use crate::error::Result;
use crate::geocode::GeocodeCache;
use crate::live::{LiveDispatcher, LogCallback};
use crate::location::{LocationProvider, LocationSampler};
use crate::notification::StatusNotifier;
use crate::outbox::{DeviceIdentity, OutboxSync, TickOutcome};
use crate::stats::{Stats, StatsSnapshot};
use crate::storage::KeyValueStore;
use crate::transport::HttpTransport;
use crate::types::Fix;

/// Handles of a running pipeline. Dropping the shutdown sender also stops
/// both tasks, so a dropped service never leaks a running timer.
struct RunningTasks {
    shutdown: watch::Sender<bool>,
    sampler: JoinHandle<()>,
    outbox: JoinHandle<()>,
}

/// The telemetry pipeline owned by the host.
///
/// One instance per process: it owns the single location subscription, both
/// delivery channels and the shared counters. `start` and `stop` are
/// idempotent. Methods that submit samples spawn tasks and must be called
/// from within a Tokio runtime.
pub struct TelemetryService<T: HttpTransport, S: KeyValueStore, P: LocationProvider> {
    config: TelemetryConfig,
    stats: Arc<Stats>,
    geocoder: Arc<GeocodeCache<T>>,
    live: Arc<LiveDispatcher<T>>,
    outbox: Arc<OutboxSync<T, S>>,
    sampler: Arc<LocationSampler<P>>,
    lifecycle: Mutex<Option<RunningTasks>>,
    running: AtomicBool,
}

impl<T: HttpTransport, S: KeyValueStore, P: LocationProvider> TelemetryService<T, S, P> {
    pub fn new(
        config: TelemetryConfig,
        transport: Arc<T>,
        store: Arc<S>,
        provider: Arc<P>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(Stats::new());
        let identity = DeviceIdentity::from_config(&config);
        let geocoder = Arc::new(GeocodeCache::from_config(Arc::clone(&transport), &config));
        let (last_known_tx, last_known_rx) = watch::channel(None);

        let live = Arc::new(LiveDispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&geocoder),
            config.live_url.clone(),
            identity.clone(),
            Arc::clone(&stats),
            last_known_tx,
        ));
        let outbox = Arc::new(OutboxSync::new(
            transport,
            config.outbox_url.clone(),
            identity,
            config.sync_interval(),
            last_known_rx,
            Arc::clone(&stats),
            store,
            &config.queue_key,
        ));
        let sampler = Arc::new(LocationSampler::new(provider, config.min_displacement_m, notifier));

        Ok(Self {
            config,
            stats,
            geocoder,
            live,
            outbox,
            sampler,
            lifecycle: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Start sampling and the outbox timer. No-op if already running.
    ///
    /// Fails, leaving the service stopped, when the location subscription
    /// cannot be opened.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            log::debug!("Telemetry service already running");
            return Ok(());
        }

        let fixes = self.sampler.subscribe().map_err(|e| {
            log::error!("Cannot start location sampling: {}", e);
            e
        })?;

        let pending = self.outbox.load_persisted();

        if let Some(fix) = self.sampler.initial_fix(self.config.initial_fix_timeout()).await {
            log::debug!("Submitting initial fix ({:.5}, {:.5})", fix.latitude, fix.longitude);
            self.submit(fix);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let live = Arc::clone(&self.live);
        let sampler = tokio::spawn(Arc::clone(&self.sampler).run(
            fixes,
            shutdown_rx.clone(),
            move |sample| live.submit(sample, None),
        ));
        let outbox = tokio::spawn(Arc::clone(&self.outbox).run(shutdown_rx));

        *lifecycle = Some(RunningTasks {
            shutdown: shutdown_tx,
            sampler,
            outbox,
        });
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "Telemetry service started for device {} ({} queued records)",
            self.config.device_id,
            pending
        );
        Ok(())
    }

    /// Stop sampling and the timer. A tick in progress finishes first; an
    /// in-flight live update is left to complete; queued records stay
    /// persisted.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(tasks) = lifecycle.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);

        // Receivers also observe a dropped sender, so a failed send is fine
        let _ = tasks.shutdown.send(true);
        for (name, handle) in [("sampler", tasks.sampler), ("outbox", tasks.outbox)] {
            if let Err(e) = handle.await {
                log::error!("{} task ended abnormally: {}", name, e);
            }
        }
        log::info!("Telemetry service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Feed a raw fix into the pipeline
    pub fn submit(&self, fix: Fix) {
        let sample = self.sampler.enrich(fix);
        self.live.submit(sample, None);
    }

    /// Like `submit`, reporting the live outcome through `on_log`
    pub fn submit_with_log(&self, fix: Fix, on_log: LogCallback) {
        let sample = self.sampler.enrich(fix);
        self.live.submit(sample, Some(on_log));
    }

    /// Run one outbox tick now, outside the timer
    pub async fn sync_now(&self) -> TickOutcome {
        self.outbox.tick().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            live: self.stats.live.snapshot(),
            outbox: self.stats.outbox.snapshot(),
            queue_depth: self.outbox.queue_depth(),
            is_online: self.outbox.is_online(),
        }
    }

    /// Operator reset: zero the counters and drop cached addresses, queued
    /// records (including the persisted copy) and the unsent live sample
    pub fn reset_stats(&self) {
        self.stats.reset();
        self.geocoder.clear();
        self.outbox.clear();
        self.live.discard_pending();
        log::info!("Telemetry stats reset");
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}

impl<T: HttpTransport, S: KeyValueStore, P: LocationProvider> StatsSource for TelemetryService<T, S, P> {
    fn stats(&self) -> StatsSnapshot {
        TelemetryService::stats(self)
    }

    fn reset_stats(&self) {
        TelemetryService::reset_stats(self)
    }
}
