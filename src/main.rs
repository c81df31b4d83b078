//! lamco-input-dispatcher - scenario replay tool
//!
//! Replays window layouts and input sequences through the dispatcher and
//! prints one JSON report per scenario.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

use lamco_input_dispatcher::config::{Config, LoggingConfig};
use lamco_input_dispatcher::replay::{self, Scenario};

/// Command-line arguments for lamco-input-dispatcher
#[derive(Parser, Debug)]
#[command(name = "lamco-input-dispatcher")]
#[command(version, about = "Replay input scenarios through the event dispatcher", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LAMCO_DISPATCHER_CONFIG", default_value = "/etc/lamco-input-dispatcher/config.toml")]
    pub config: String,

    /// Scenario files (TOML or JSON); the built-in demo runs when none are given
    #[arg(short, long)]
    pub scenario: Vec<PathBuf>,

    /// Include a dispatcher state dump in each report
    #[arg(long)]
    pub dump: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config is read before logging so its level applies; the error is
    // reported once a subscriber exists.
    let (config, config_error) = match Config::load(&args.config) {
        Ok(config) => (config, None),
        Err(e) => (Config::default_config()?, Some(e)),
    };

    let _log_guard = init_logging(&args, &config.logging)?;

    info!("════════════════════════════════════════════════════════");
    info!("  lamco-input-dispatcher v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {} {}", env!("BUILD_DATE"), env!("BUILD_TIME"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    if let Some(e) = config_error {
        warn!("Failed to load config: {:#}, using defaults", e);
    } else {
        info!("Configuration loaded from {}", args.config);
    }
    tracing::debug!("Config: {:?}", config);

    let scenarios = if args.scenario.is_empty() {
        info!("No scenario given, running the built-in demo");
        vec![Scenario::demo()]
    } else {
        args.scenario
            .iter()
            .map(Scenario::load)
            .collect::<Result<Vec<_>>>()?
    };

    let tasks = scenarios.into_iter().map(|scenario| {
        let dispatcher_config = config.dispatcher.clone();
        let dump = args.dump;
        tokio::task::spawn_blocking(move || replay::replay(&scenario, dispatcher_config, dump))
    });
    let results = futures::future::try_join_all(tasks)
        .await
        .context("Replay task panicked")?;

    for result in results {
        let report = result?;
        if config.logging.statistics {
            let stats = &report.stats;
            info!(
                "{}: received={} dispatched={} dropped={} throttled={} batched={} streamed={} repeats={} cancelations={} anrs={} broken={}",
                report.scenario,
                stats.events_received,
                stats.events_dispatched,
                stats.total_dropped(),
                stats.throttled,
                stats.samples_batched,
                stats.samples_streamed,
                stats.key_repeats,
                stats.cancelations,
                stats.anrs,
                stats.broken_channels
            );
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}

fn format_layer<W>(format: &str, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(ansi);
    match format {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ => layer.pretty().boxed(),
    }
}

fn init_logging(args: &Args, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let log_level = match args.verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("lamco_input_dispatcher={level},warn", level = log_level))
    });

    // Reports go to stdout, so console logging uses stderr.
    let mut layers = vec![format_layer(&args.log_format, std::io::stderr, true)];

    let file_writer = match (&args.log_file, &logging.log_dir) {
        (Some(path), _) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            Some(tracing_appender::non_blocking(file))
        }
        (None, Some(dir)) => Some(tracing_appender::non_blocking(tracing_appender::rolling::daily(
            dir,
            "lamco-input-dispatcher.log",
        ))),
        (None, None) => None,
    };

    let guard = file_writer.map(|(writer, guard)| {
        layers.push(format_layer(&args.log_format, writer, false));
        guard
    });

    tracing_subscriber::registry().with(layers).with(env_filter).init();

    if let Some(path) = &args.log_file {
        info!("Logging to file: {}", path.display());
    }
    Ok(guard)
}
