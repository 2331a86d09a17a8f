use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::error::LocationError;
use crate::geodesy::{destination, distance_meters, normalize_degrees};
use crate::heading::HeadingEstimator;
use crate::notification::{StatusNotification, StatusNotifier};
use crate::types::{EnrichedSample, Fix, Position};

/// Buffered fixes per subscription; a full channel drops the newest fix
const FIX_CHANNEL_CAPACITY: usize = 64;

/// Minimum movement between two delivered fixes, like the platform filter
pub const SPATIAL_FILTER_M: f64 = 2.0;

/// Platform position source.
///
/// `watch` opens a continuous subscription; dropping the receiver ends it.
pub trait LocationProvider: Send + Sync + 'static {
    fn watch(&self) -> Result<mpsc::Receiver<Fix>, LocationError>;

    /// One-shot position for fast initial display
    fn current_position(&self) -> impl Future<Output = Result<Fix, LocationError>> + Send;
}

/// Drops fixes closer than `min_m` to the last delivered one
#[derive(Debug, Clone)]
pub struct SpatialFilter {
    min_m: f64,
    last: Option<Position>,
}

impl SpatialFilter {
    pub fn new(min_m: f64) -> Self {
        Self { min_m, last: None }
    }

    pub fn accept(&mut self, fix: &Fix) -> bool {
        let pos = fix.position();
        match self.last {
            Some(last) if distance_meters(last, pos) < self.min_m => false,
            _ => {
                self.last = Some(pos);
                true
            }
        }
    }
}

/// Forward a fix, returning false once the subscriber is gone
fn deliver(tx: &mpsc::Sender<Fix>, fix: Fix, source: &str) -> bool {
    match tx.try_send(fix) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            log::debug!("[{}] Subscriber lagging, fix dropped", source);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Provider fed by the host: every `push` goes to the current subscriber
pub struct ChannelProvider {
    sender: Mutex<Option<mpsc::Sender<Fix>>>,
    last_fix: Mutex<Option<Fix>>,
    permitted: AtomicBool,
    subscriptions: AtomicUsize,
}

impl ChannelProvider {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            last_fix: Mutex::new(None),
            permitted: AtomicBool::new(true),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.permitted.store(granted, Ordering::SeqCst);
    }

    /// Returns false when nobody is subscribed
    pub fn push(&self, fix: Fix) -> bool {
        if let Ok(mut last) = self.last_fix.lock() {
            *last = Some(fix);
        }
        let Ok(sender) = self.sender.lock() else {
            return false;
        };
        match sender.as_ref() {
            Some(tx) => deliver(tx, fix, "channel"),
            None => false,
        }
    }

    /// Subscriptions opened so far
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl Default for ChannelProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationProvider for ChannelProvider {
    fn watch(&self) -> Result<mpsc::Receiver<Fix>, LocationError> {
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(LocationError::PermissionDenied);
        }
        let (tx, rx) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        let mut sender = self
            .sender
            .lock()
            .map_err(|_| LocationError::Unavailable("provider state poisoned".to_string()))?;
        // Replacing the sender closes any previous subscription
        *sender = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn current_position(&self) -> Result<Fix, LocationError> {
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(LocationError::PermissionDenied);
        }
        self.last_fix
            .lock()
            .ok()
            .and_then(|last| *last)
            .ok_or_else(|| LocationError::Unavailable("no fix yet".to_string()))
    }
}

/// Synthetic drive: constant speed with a slowly wandering course
#[derive(Debug, Clone)]
pub struct SimulatedRoute {
    pub start: Position,
    /// m/s
    pub speed: f64,
    pub course: f64,
    pub period: Duration,
}

impl SimulatedRoute {
    pub fn new(start: Position, speed: f64, course: f64) -> Self {
        Self {
            start,
            speed: speed.max(0.0),
            course: normalize_degrees(course),
            period: Duration::from_secs(1),
        }
    }

    /// Position and course after `step` periods
    fn step(&self, from: Position, step: u64) -> (Position, f64) {
        let course = normalize_degrees(self.course + (step as f64 * 0.2).sin() * 15.0);
        let meters = self.speed * self.period.as_secs_f64();
        (destination(from, course, meters), course)
    }
}

impl LocationProvider for SimulatedRoute {
    fn watch(&self) -> Result<mpsc::Receiver<Fix>, LocationError> {
        let (tx, rx) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        let route = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + route.period, route.period);
            let mut filter = SpatialFilter::new(SPATIAL_FILTER_M);
            let mut position = route.start;
            let mut step = 0u64;
            let mut delivered = 0u64;

            loop {
                interval.tick().await;
                step += 1;
                let (next, course) = route.step(position, step);
                position = next;

                let fix = Fix::new(position.latitude, position.longitude, route.speed, Some(course));
                if !filter.accept(&fix) {
                    continue;
                }
                if !deliver(&tx, fix, "sim") {
                    log::info!("[sim] Subscription closed after {} fixes", delivered);
                    break;
                }
                delivered += 1;
            }
        });

        Ok(rx)
    }

    async fn current_position(&self) -> Result<Fix, LocationError> {
        Ok(Fix::new(self.start.latitude, self.start.longitude, 0.0, None))
    }
}

/// Replays a recorded JSON array of fixes at a fixed cadence
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    fixes: Arc<Vec<Fix>>,
    period: Duration,
}

impl ReplayProvider {
    pub fn new(fixes: Vec<Fix>, period: Duration) -> Self {
        Self {
            fixes: Arc::new(fixes),
            period,
        }
    }

    pub fn from_file(path: &Path, period: Duration) -> Result<Self, LocationError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LocationError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let fixes: Vec<Fix> = serde_json::from_str(&content)
            .map_err(|e| LocationError::Unavailable(format!("{}: {}", path.display(), e)))?;
        log::info!("Loaded {} fixes from {}", fixes.len(), path.display());
        Ok(Self::new(fixes, period))
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }
}

impl LocationProvider for ReplayProvider {
    fn watch(&self) -> Result<mpsc::Receiver<Fix>, LocationError> {
        let (tx, rx) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        let fixes = Arc::clone(&self.fixes);
        let period = self.period;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut filter = SpatialFilter::new(SPATIAL_FILTER_M);
            for fix in fixes.iter().copied() {
                interval.tick().await;
                if filter.accept(&fix) && !deliver(&tx, fix, "replay") {
                    return;
                }
            }
            log::info!("[replay] Finished {} fixes", fixes.len());
        });

        Ok(rx)
    }

    async fn current_position(&self) -> Result<Fix, LocationError> {
        self.fixes
            .first()
            .copied()
            .ok_or_else(|| LocationError::Unavailable("empty replay".to_string()))
    }
}

/// Owns the position subscription and turns raw fixes into enriched samples.
pub struct LocationSampler<P: LocationProvider> {
    provider: Arc<P>,
    estimator: Mutex<HeadingEstimator>,
    notifier: Arc<dyn StatusNotifier>,
}

impl<P: LocationProvider> LocationSampler<P> {
    pub fn new(provider: Arc<P>, min_displacement_m: f64, notifier: Arc<dyn StatusNotifier>) -> Self {
        Self {
            provider,
            estimator: Mutex::new(HeadingEstimator::new(min_displacement_m)),
            notifier,
        }
    }

    /// Fold `fix` into the heading estimate and snapshot the result
    pub fn enrich(&self, fix: Fix) -> EnrichedSample {
        let heading = self
            .estimator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .update(&fix);
        let sample = EnrichedSample::new(fix, heading, Utc::now());

        if let Err(e) = self.notifier.update(&StatusNotification::from_sample(&sample)) {
            log::debug!("Status notification skipped: {}", e);
        }
        sample
    }

    pub fn subscribe(&self) -> Result<mpsc::Receiver<Fix>, LocationError> {
        self.provider.watch()
    }

    /// Best-effort first fix; `None` on timeout or provider error
    pub async fn initial_fix(&self, timeout: Duration) -> Option<Fix> {
        match tokio::time::timeout(timeout, self.provider.current_position()).await {
            Ok(Ok(fix)) => Some(fix),
            Ok(Err(e)) => {
                log::warn!("Initial position unavailable: {}", e);
                None
            }
            Err(_) => {
                log::warn!("Initial position timed out after {:?}", timeout);
                None
            }
        }
    }

    /// Consume `fixes` until shutdown or the stream ends
    pub async fn run(
        self: Arc<Self>,
        mut fixes: mpsc::Receiver<Fix>,
        mut shutdown: watch::Receiver<bool>,
        forward: impl Fn(EnrichedSample) + Send,
    ) {
        let mut count = 0u64;
        loop {
            tokio::select! {
                fix = fixes.recv() => match fix {
                    Some(fix) => {
                        count += 1;
                        forward(self.enrich(fix));
                    }
                    None => {
                        log::warn!("Location stream ended");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Location sampler stopped after {} fixes", count);
    }

    pub fn heading(&self) -> f64 {
        self.estimator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .heading()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::notification::LogNotifier;
    use approx::assert_relative_eq;

    struct FailingNotifier;

    impl StatusNotifier for FailingNotifier {
        fn update(&self, _status: &StatusNotification) -> Result<(), NotifyError> {
            Err(NotifyError::Failed("no display".to_string()))
        }
    }

    struct SilentProvider;

    impl LocationProvider for SilentProvider {
        fn watch(&self) -> Result<mpsc::Receiver<Fix>, LocationError> {
            Err(LocationError::Unavailable("disabled".to_string()))
        }

        async fn current_position(&self) -> Result<Fix, LocationError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_spatial_filter() {
        let mut filter = SpatialFilter::new(2.0);
        let origin = Position::new(19.0, -99.0);
        let near = destination(origin, 90.0, 1.0);
        let far = destination(origin, 90.0, 3.0);

        assert!(filter.accept(&Fix::new(origin.latitude, origin.longitude, 0.0, None)));
        assert!(!filter.accept(&Fix::new(near.latitude, near.longitude, 0.0, None)));
        assert!(filter.accept(&Fix::new(far.latitude, far.longitude, 0.0, None)));
    }

    #[tokio::test]
    async fn test_channel_provider_permission() {
        let provider = ChannelProvider::new();
        provider.set_permission(false);
        assert_eq!(provider.watch().unwrap_err(), LocationError::PermissionDenied);
        assert_eq!(
            provider.current_position().await.unwrap_err(),
            LocationError::PermissionDenied
        );
        assert_eq!(provider.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_provider_delivery() {
        let provider = ChannelProvider::new();
        assert!(!provider.push(Fix::new(1.0, 1.0, 0.0, None)));

        let mut first = provider.watch().unwrap();
        assert!(provider.push(Fix::new(2.0, 2.0, 0.0, None)));
        assert_eq!(first.recv().await.unwrap().latitude, 2.0);
        assert_eq!(provider.current_position().await.unwrap().latitude, 2.0);

        // A new subscription supersedes the old one
        let mut second = provider.watch().unwrap();
        assert!(first.recv().await.is_none());
        provider.push(Fix::new(3.0, 3.0, 0.0, None));
        assert_eq!(second.recv().await.unwrap().latitude, 3.0);
        assert_eq!(provider.subscription_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_route_cadence_and_spacing() {
        let route = SimulatedRoute::new(Position::new(37.7749, -122.4194), 10.0, 45.0);
        let mut rx = route.watch().unwrap();

        let started = tokio::time::Instant::now();
        let mut fixes = Vec::new();
        for _ in 0..4 {
            fixes.push(rx.recv().await.unwrap());
        }
        assert_eq!(started.elapsed(), Duration::from_secs(4));

        for pair in fixes.windows(2) {
            let d = distance_meters(pair[0].position(), pair[1].position());
            assert_relative_eq!(d, 10.0, epsilon = 0.01);
        }
        assert!(fixes.iter().all(|f| f.speed == 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_route_respects_spatial_filter() {
        // 1 m per tick, so only every other step clears the filter
        let route = SimulatedRoute::new(Position::new(0.0, 0.0), 1.0, 90.0);
        let mut rx = route.watch().unwrap();

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert!(distance_meters(a.position(), b.position()) >= SPATIAL_FILTER_M);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_provider_from_file() {
        let origin = Position::new(19.0, -99.0);
        let jitter = destination(origin, 0.0, 0.5);
        let moved = destination(origin, 0.0, 25.0);
        let fixes = vec![
            Fix::new(origin.latitude, origin.longitude, 5.0, None),
            Fix::new(jitter.latitude, jitter.longitude, 5.0, None),
            Fix::new(moved.latitude, moved.longitude, 5.0, Some(2.0)),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.json");
        std::fs::write(&path, serde_json::to_string(&fixes).unwrap()).unwrap();

        let replay = ReplayProvider::from_file(&path, Duration::from_millis(100)).unwrap();
        assert_eq!(replay.len(), 3);
        let first = replay.current_position().await.unwrap();
        assert_relative_eq!(first.latitude, fixes[0].latitude, epsilon = 1e-9);

        // The 0.5 m jitter fix is filtered out
        let mut rx = replay.watch().unwrap();
        assert_relative_eq!(rx.recv().await.unwrap().latitude, fixes[0].latitude, epsilon = 1e-9);
        let last = rx.recv().await.unwrap();
        assert_relative_eq!(last.latitude, fixes[2].latitude, epsilon = 1e-9);
        assert_eq!(last.heading_hint, Some(2.0));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_replay_provider_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.json");
        std::fs::write(&path, "[{\"latitude\": 1.0}").unwrap();
        assert!(matches!(
            ReplayProvider::from_file(&path, Duration::from_secs(1)),
            Err(LocationError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_enrich_swallows_notifier_errors() {
        let sampler = LocationSampler::new(Arc::new(ChannelProvider::new()), 2.0, Arc::new(FailingNotifier));

        let origin = Position::new(19.0, -99.0);
        let east = destination(origin, 90.0, 50.0);
        sampler.enrich(Fix::new(origin.latitude, origin.longitude, 3.0, None));
        let sample = sampler.enrich(Fix::new(east.latitude, east.longitude, 3.0, None));

        assert_relative_eq!(sample.heading, 90.0, epsilon = 0.1);
        assert_relative_eq!(sampler.heading(), 90.0, epsilon = 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_fix_timeout() {
        let sampler = LocationSampler::new(Arc::new(SilentProvider), 2.0, Arc::new(LogNotifier));
        assert!(sampler.subscribe().is_err());
        assert!(sampler.initial_fix(Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test]
    async fn test_run_forwards_until_shutdown() {
        let provider = Arc::new(ChannelProvider::new());
        let sampler = Arc::new(LocationSampler::new(provider.clone(), 2.0, Arc::new(LogNotifier)));
        let rx = sampler.subscribe().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(sampler.clone().run(rx, shutdown_rx, move |sample| {
            let _ = out_tx.send(sample);
        }));

        provider.push(Fix::new(19.0, -99.0, 4.0, Some(180.0)));
        let sample = out_rx.recv().await.unwrap();
        assert_eq!(sample.heading, 180.0);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        // Sampler dropped its receiver
        assert!(!provider.push(Fix::new(19.1, -99.0, 4.0, None)));
    }
}
