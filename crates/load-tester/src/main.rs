use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use rvoip_ip_trace::{CallLifecycleTracker, CallRecordStore, CsvFileSink, TraceIngestor};
use rvoip_load_tester::logging::{log_welcome, setup_logging, LogOptions};
use rvoip_load_tester::{
    AppConfig, CallPlacer, DriverSettings, LoadDriver, NetworkSettings, ScriptSettings, ScriptedPlacer, SipPlacer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlacerKind {
    /// Real calls over UDP
    Sip,
    /// Replays a canned call flow without touching the network
    Scripted,
}

#[derive(Parser, Debug)]
#[command(name = "sip-load-tester")]
#[command(version, about = "Places repeated SIP calls and records every IP address seen per call", long_about = None)]
struct Args {
    /// Path to the JSON settings file
    #[arg(short, long, default_value = "appsettings.json")]
    config: PathBuf,

    /// Number of calls to place (overrides SipSettings.CallCount)
    #[arg(short = 'n', long)]
    calls: Option<usize>,

    /// Log level (overrides LogSettings.LogLevel)
    #[arg(short, long)]
    log_level: Option<String>,

    /// CSV output file (default: call_ips_<timestamp>.csv in the log directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// How calls are placed
    #[arg(long, value_enum, default_value_t = PlacerKind::Sip)]
    placer: PlacerKind,

    /// Final status the scripted far end answers with
    #[arg(long, default_value_t = 200)]
    answer_status: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(calls) = args.calls {
        config.sip_settings.call_count = calls;
    }
    if let Some(level) = args.log_level {
        config.log_settings.log_level = level;
    }
    config.validate()?;

    setup_logging(&LogOptions::try_from(&config.log_settings)?)?;
    log_welcome("sip-load-tester", env!("CARGO_PKG_VERSION"));
    info!(
        sip_domain = %config.sip_settings.sip_domain,
        username = %config.sip_settings.username,
        target = %config.target_uri(),
        placer = ?args.placer,
        "Loaded configuration"
    );

    let sink = match args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            CsvFileSink::new(path)
        }
        None => CsvFileSink::in_directory(&config.log_settings.log_directory, Utc::now())?,
    };
    let sink = Arc::new(sink);
    info!(path = %sink.path().display(), "Writing call rows");

    let store = Arc::new(CallRecordStore::new());
    let tracker = Arc::new(
        CallLifecycleTracker::new(store.clone(), sink.clone())
            .with_resolve_timeout(config.trace_settings.resolve_timeout()),
    );
    let (trace, ingest) = TraceIngestor::new(store).spawn(config.trace_settings.channel_capacity);

    let network = match args.placer {
        PlacerKind::Sip => Some(Arc::new(SipPlacer::bind(NetworkSettings::from_config(&config)?).await?)),
        PlacerKind::Scripted => None,
    };
    let placer: Arc<dyn CallPlacer> = match &network {
        Some(network) => network.clone(),
        None => Arc::new(ScriptedPlacer::new(ScriptSettings {
            answer_status: args.answer_status,
            hangup_delay: config.trace_settings.hangup_delay(),
            ..Default::default()
        })),
    };

    let driver = LoadDriver::new(DriverSettings::from_config(&config), tracker, trace, placer);
    let stats = driver.run().await;
    drop(driver);

    if let Some(network) = network {
        if let Err(e) = network.close().await {
            warn!(error = %e, "Failed to close SIP transport");
        }
    }

    let ingest_stats = ingest.shutdown().await;
    if ingest_stats.dropped > 0 || ingest_stats.failed > 0 {
        warn!(
            dropped = ingest_stats.dropped,
            failed = ingest_stats.failed,
            "Some trace events were not recorded"
        );
    }

    info!(
        answered = stats.answered,
        rejected = stats.rejected,
        failed = stats.failed,
        timed_out = stats.timed_out,
        rows = sink.rows_written(),
        path = %sink.path().display(),
        "All calls completed"
    );
    Ok(())
}
