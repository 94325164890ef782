use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{select, tick, unbounded};
use indexmap::IndexMap;

use logship::checkpoint::{CheckpointTracker, StatusSnapshot};
use logship::collector::Collector;
use logship::config::{ShipperConfig, TargetSection};
use logship::dispatch::{FileTransport, NullTransport, StdoutTransport, Transport};
use logship::platform::{Ctrl, ExitCode, SignalHandler};
use logship::queue::QueueTable;
use logship::source::Source;

#[derive(Parser, Debug)]
#[command(
    name = "logship",
    version,
    about = "Tail growing log files, reassemble multiline records and ship them to per-target queues"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "logship.json")]
    config: PathBuf,

    /// Override the number of input (reader) threads
    #[arg(long)]
    input_threads: Option<usize>,

    /// Override the number of output (dispatch) threads
    #[arg(long)]
    output_threads: Option<usize>,

    /// Override the checkpoint status file path
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("logship: {:#}", e);
        ExitCode::GeneralError.exit();
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ShipperConfig::load(&cli.config)?;
    if let Some(n) = cli.input_threads {
        config.collector.input_threads = n;
    }
    if let Some(n) = cli.output_threads {
        config.collector.output_threads = n;
    }
    if let Some(path) = cli.status_file {
        config.collector.status_file = Some(path);
    }
    config.validate()?;

    if cli.check {
        println!(
            "configuration OK: {} sources, {} targets",
            config.sources.len(),
            config.targets.len()
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let settings = config.collector_settings()?;

    let checkpoints = Arc::new(CheckpointTracker::new());
    if let Some(path) = &config.collector.status_file {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let snapshot: StatusSnapshot = serde_json::from_str(&contents)
                    .with_context(|| format!("parsing status file: {}", path.display()))?;
                checkpoints.restore(&snapshot);
                tracing::info!(
                    path = %path.display(),
                    files = snapshot.files.len(),
                    "restored checkpoint status"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading status file: {}", path.display()))
            }
        }
    }

    let queues = Arc::new(QueueTable::new(
        &config.target_names(),
        config.collector.queue_capacity,
        config.overflow_policy()?,
    ));

    let mut transports: IndexMap<String, Arc<dyn Transport>> = IndexMap::new();
    for target in &config.targets {
        let transport: Arc<dyn Transport> = match target {
            TargetSection::Stdout { .. } => Arc::new(StdoutTransport),
            TargetSection::File { path, .. } => Arc::new(FileTransport::create(path)?),
            TargetSection::Null { .. } => Arc::new(NullTransport),
        };
        transports.insert(target.name().to_string(), transport);
    }

    let mut sources = Vec::with_capacity(config.sources.len());
    for section in &config.sources {
        sources.push(Source::new(
            section.path.clone(),
            section.targets.clone(),
            section.multiline.compile()?,
        ));
    }

    tracing::info!(
        sources = sources.len(),
        input_threads = settings.input_threads,
        output_threads = settings.output_threads,
        "starting collector"
    );
    let collector = Collector::start(
        sources,
        Arc::clone(&queues),
        Arc::clone(&checkpoints),
        Arc::new(transports),
        settings,
    )?;

    let (ctrl_tx, ctrl_rx) = unbounded();
    let _signals = SignalHandler::new(ctrl_tx)?;
    let status_tick = tick(config.status_interval()?);

    loop {
        select! {
            recv(ctrl_rx) -> msg => match msg {
                Ok(Ctrl::Shutdown { immediate }) => {
                    if immediate {
                        ExitCode::SignalInt.exit();
                    }
                    break;
                }
                Ok(Ctrl::PrintStats) => {
                    tracing::info!("{}", collector.snapshot().format_summary());
                }
                Err(_) => break,
            },
            recv(status_tick) -> _ => {
                persist_status(&config, &checkpoints);
            }
        }
    }

    tracing::info!("shutting down");
    let snapshot = collector.stop();
    persist_status(&config, &checkpoints);
    tracing::info!("{}", snapshot.format_summary());
    Ok(())
}

/// Write the checkpoint table to the status file, via a temp file and
/// rename so a crash never leaves a half-written status.
fn persist_status(config: &ShipperConfig, checkpoints: &CheckpointTracker) {
    let Some(path) = &config.collector.status_file else {
        return;
    };
    let snapshot = checkpoints.snapshot();
    let result = (|| -> Result<()> {
        let contents = serde_json::to_string_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            tracing::debug!(path = %path.display(), files = snapshot.files.len(), "status saved")
        }
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to save status"),
    }
}
