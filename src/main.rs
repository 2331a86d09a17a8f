use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{interval, Duration};

use vehicle_telemetry_rs::dashboard::{self, StatsSource};
use vehicle_telemetry_rs::location::{LocationProvider, ReplayProvider, SimulatedRoute};
use vehicle_telemetry_rs::notification::{LogNotifier, StatusFile, StatusNotifier};
use vehicle_telemetry_rs::storage::FileStore;
use vehicle_telemetry_rs::transport::ReqwestTransport;
use vehicle_telemetry_rs::{Position, TelemetryConfig, TelemetryService};

#[derive(Parser, Debug)]
#[command(name = "vehicle_telemetry")]
#[command(about = "Vehicle telemetry relay - live PUT + durable POST outbox", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file; unspecified fields use defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the persisted outbox queue
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Override the configured device id
    #[arg(long)]
    device_id: Option<String>,

    /// Replay fixes from a JSON array instead of simulating a drive
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Seconds between replayed fixes
    #[arg(long, default_value = "1.0")]
    replay_period: f64,

    /// Simulated ground speed in m/s
    #[arg(long, default_value = "12.0")]
    sim_speed: f64,

    /// Serve /stats and /ws on this port
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Write the status notification to this JSON file
    #[arg(long)]
    status_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TelemetryConfig::from_file(path)?,
        None => TelemetryConfig::default(),
    };
    if let Some(dir) = &args.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(id) = &args.device_id {
        config.device_id = id.clone();
    }
    config.validate()?;

    log::info!("Vehicle telemetry starting");
    log::info!("  Device: {}", config.device_id);
    log::info!("  Duration: {} seconds (0=continuous)", args.duration);
    log::info!("  Storage: {}", config.storage_dir.display());

    let notifier: Arc<dyn StatusNotifier> = match &args.status_file {
        Some(path) => Arc::new(StatusFile::new(path)),
        None => Arc::new(LogNotifier),
    };

    match &args.replay {
        Some(path) => {
            let period = Duration::from_secs_f64(args.replay_period.max(0.01));
            let provider = ReplayProvider::from_file(path, period)
                .with_context(|| format!("loading replay {}", path.display()))?;
            run(&args, config, provider, notifier).await
        }
        None => {
            let provider = SimulatedRoute::new(Position::new(19.4326, -99.1332), args.sim_speed, 45.0);
            run(&args, config, provider, notifier).await
        }
    }
}

async fn run<P: LocationProvider>(
    args: &Args,
    config: TelemetryConfig,
    provider: P,
    notifier: Arc<dyn StatusNotifier>,
) -> Result<()> {
    let transport = Arc::new(
        ReqwestTransport::new(config.request_timeout(), &config.user_agent)
            .context("building HTTP client")?,
    );
    let store = Arc::new(
        FileStore::open(&config.storage_dir)
            .with_context(|| format!("opening storage {}", config.storage_dir.display()))?,
    );

    let service = Arc::new(TelemetryService::new(
        config,
        transport,
        store,
        Arc::new(provider),
        notifier,
    )?);
    service.start().await?;

    if let Some(port) = args.dashboard_port {
        let source: Arc<dyn StatsSource> = service.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve(source, port).await {
                log::error!("[dashboard] Server failed: {}", e);
            }
        });
    }

    let deadline = async {
        if args.duration > 0 {
            tokio::time::sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut report = interval(Duration::from_secs(10));
    report.tick().await;

    loop {
        tokio::select! {
            _ = report.tick() => log_stats(&service.stats()),
            _ = &mut deadline => {
                log::info!("Duration reached, stopping...");
                break;
            }
            _ = &mut ctrl_c => {
                log::info!("Interrupted, stopping...");
                break;
            }
        }
    }

    service.stop().await;
    log_stats(&service.stats());
    Ok(())
}

fn log_stats(stats: &vehicle_telemetry_rs::StatsSnapshot) {
    log::info!(
        "live {}/{} ok ({:.0}%, {} superseded) | outbox {}/{} ok ({:.0}%, {} recovered) | queued {} | {}",
        stats.live.success,
        stats.live.total,
        stats.live.success_rate,
        stats.live.extra,
        stats.outbox.success,
        stats.outbox.total,
        stats.outbox.success_rate,
        stats.outbox.extra,
        stats.queue_depth,
        if stats.is_online { "online" } else { "offline" }
    );
}
