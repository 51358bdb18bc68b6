use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::{bounded, select, tick};
use dotenvy::dotenv;
use game_feed::bus::BusConfig;
use game_feed::capture::CaptureAdapter;
use game_feed::envelope::Source;
use game_feed::pipeline::{Pipeline, PipelineConfig, default_session_id};
use game_feed::reconciler::ReconcilerConfig;
use game_feed::store::StoreConfig;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Game feed recorder: bus -> event store + state reconciler")]
struct Args {
    /// JSON-lines capture input; reads stdin when omitted
    #[arg(long, short = 'i', env = "CAPTURE_INPUT")]
    input: Option<PathBuf>,

    /// Root directory of the partitioned store
    #[arg(long, env = "CAPTURE_ROOT", default_value = "captures")]
    root: PathBuf,

    /// Session id; defaults to the UTC start time (YYYYMMDDTHHMMSSZ)
    #[arg(long, env = "SESSION_ID")]
    session_id: Option<String>,

    /// Source recorded for lines that do not name one
    #[arg(long, env = "CAPTURE_SOURCE", default_value = "public_feed", value_parser = parse_source)]
    source: Source,

    /// Records per doc type that trigger a flush
    #[arg(long, env = "FLUSH_THRESHOLD", default_value_t = 100)]
    flush_threshold: usize,

    /// Maximum age of a buffered record before it is flushed (ms)
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value_t = 5_000)]
    flush_interval_ms: u64,

    /// Bus queue capacity; publishes beyond it are dropped
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 4_096)]
    queue_capacity: usize,

    /// Authoritative/local difference above which drift is reported
    #[arg(long, env = "DRIFT_TOLERANCE", default_value_t = 0.01)]
    drift_tolerance: f64,
}

fn parse_source(s: &str) -> Result<Source, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown source {s:?} (public_feed, authenticated_feed, local, replay)"))
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("game_feed=info".parse()?))
        .init();
    Ok(())
}

fn open_input(path: Option<&PathBuf>) -> Result<Box<dyn BufRead + Send>> {
    Ok(match path {
        Some(p) => Box::new(BufReader::new(File::open(p).with_context(|| format!("open {p:?}"))?)),
        None => Box::new(BufReader::new(io::stdin())),
    })
}

fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing()?;
    let args = Args::parse();

    let flush_interval = Duration::from_millis(args.flush_interval_ms.max(1));
    let config = PipelineConfig {
        bus: BusConfig {
            queue_capacity: args.queue_capacity,
            ..BusConfig::default()
        },
        store: StoreConfig {
            root: args.root.clone(),
            flush_threshold: args.flush_threshold,
            flush_interval,
            ..StoreConfig::default()
        },
        reconciler: ReconcilerConfig {
            drift_tolerance: args.drift_tolerance,
            ..ReconcilerConfig::default()
        },
    };
    let session_id = args.session_id.clone().unwrap_or_else(default_session_id);
    let pipeline = Pipeline::open(config, session_id.as_str())?;
    pipeline.start()?;

    let input = open_input(args.input.as_ref())?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = bounded::<Result<()>>(1);
    let adapter = CaptureAdapter::new(pipeline.bus().clone(), args.source);
    {
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let res = adapter.run(input, &shutdown).map(|_| ()).map_err(anyhow::Error::from);
                let _ = done_tx.send(res);
            })
            .context("spawn capture thread")?;
    }

    let (sig_tx, sig_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = sig_tx.try_send(());
    })
    .context("install Ctrl+C handler")?;

    info!(session_id = %session_id, root = %args.root.display(), "recording");
    let ticker = tick((flush_interval / 2).max(Duration::from_millis(1)));
    let capture_result = loop {
        select! {
            recv(ticker) -> _ => {
                if let Err(e) = pipeline.flush_due() {
                    warn!(error = %format!("{e:#}"), "periodic flush failed");
                }
            }
            recv(done_rx) -> res => {
                break res.unwrap_or_else(|_| Err(anyhow!("capture thread exited without reporting")));
            }
            recv(sig_rx) -> _ => {
                info!("Ctrl+C received; shutting down");
                shutdown.store(true, Ordering::Relaxed);
                break Ok(());
            }
        }
    };
    if let Err(e) = &capture_result {
        error!(error = %format!("{e:#}"), "capture ended with an error");
    }

    let report = pipeline.stop();
    let snap = &report.snapshot;
    println!(
        "session {}: published={} dropped={} persisted={} parts={} abandoned={} callback_failures={}",
        report.session_id,
        report.published,
        report.dropped,
        report.persisted,
        report.store.parts_written,
        report.store.abandoned_records,
        report.callback_failures
    );
    println!(
        "state: balance={:.4} position={:.4} avg_entry={:.4} pnl={:.4} tick={} price={:.4} version={} authoritative={}",
        snap.balance,
        snap.position_qty,
        snap.avg_entry_price,
        snap.cumulative_pnl,
        snap.current_tick,
        snap.current_price,
        snap.authority_version,
        snap.is_authoritative
    );
    capture_result?;
    report.ensure_complete()
}
