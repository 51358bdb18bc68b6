use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use game_feed::envelope::EventKind;
use game_feed::reconciler::{ReconcilerConfig, StateReconciler};
use game_feed::record::PersistedRecord;
use game_feed::store::{part, reader};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Read a persisted session back in total order and optionally replay its state")]
struct Args {
    /// Root directory of the partitioned store
    #[arg(long, env = "CAPTURE_ROOT", default_value = "captures")]
    root: PathBuf,

    /// Session to read; lists the sessions under root when omitted
    #[arg(long, short = 's')]
    session_id: Option<String>,

    /// Print every record as a JSON line
    #[arg(long, default_value_t = false)]
    print: bool,

    /// Only print records of this doc type
    #[arg(long)]
    doc_type: Option<String>,

    /// Replay records through a fresh state reconciler and print the result
    #[arg(long, default_value_t = false)]
    replay: bool,

    /// Drift tolerance used for replay
    #[arg(long, default_value_t = 0.01)]
    drift_tolerance: f64,
}

fn print_record(rec: &PersistedRecord) -> Result<()> {
    let line = serde_json::json!({
        "seq": rec.seq,
        "ts": rec.ts.to_string(),
        "source": rec.source,
        "doc_type": rec.doc_type,
        "event_name": rec.event_name,
        "fields": rec.fields,
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn replay(records: &[PersistedRecord], drift_tolerance: f64) -> StateReconciler {
    let reconciler = StateReconciler::new(ReconcilerConfig {
        drift_tolerance,
        ..ReconcilerConfig::default()
    });
    for rec in records {
        let kind = EventKind::classify(&rec.event_name);
        match kind {
            EventKind::Tick | EventKind::PlayerState => {
                if let Err(e) = reconciler.apply_authoritative(&kind, &rec.fields, rec.ts) {
                    warn!(seq = rec.seq, error = %e, "replay skipped malformed update");
                }
            }
            EventKind::Trade(_) | EventKind::LocalState => {
                reconciler.apply_optimistic(&rec.fields);
            }
            EventKind::SessionBoundary => reconciler.begin_session(),
            EventKind::Unrecognized(_) => {}
        }
    }
    reconciler
}

fn main() -> Result<()> {
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("game_feed=info".parse()?))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let Some(session_id) = args.session_id.as_deref() else {
        for session in reader::sessions(&args.root).with_context(|| format!("scan {:?}", args.root))? {
            println!("{session}");
        }
        return Ok(());
    };

    let records = reader::load_session(&args.root, session_id)?;
    if records.is_empty() {
        bail!("no persisted records for session {session_id} under {:?}", args.root);
    }
    reader::verify_total_order(&records)?;

    for doc_type in reader::doc_types(&args.root)? {
        let dir = part::partition_dir(&args.root, &doc_type, session_id);
        if !dir.is_dir() {
            continue;
        }
        for stray in reader::stray_temp_files(&dir)? {
            warn!(path = %stray.display(), "incomplete part write left behind");
        }
    }

    if args.print {
        for rec in &records {
            if args.doc_type.as_deref().is_none_or(|d| d == rec.doc_type) {
                print_record(rec)?;
            }
        }
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for rec in &records {
        *counts.entry(rec.doc_type.as_str()).or_default() += 1;
    }
    eprintln!("session {session_id}: {} records, seq 0..={}", records.len(), records.len() - 1);
    for (doc_type, n) in &counts {
        eprintln!("  {doc_type:<14} {n}");
    }

    if args.replay {
        let reconciler = replay(&records, args.drift_tolerance);
        let snapshot = reconciler.current_snapshot();
        println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
        eprintln!(
            "replay: malformed={} drift={} optimistic applied={} ignored={}",
            reconciler.malformed_count(),
            reconciler.drift_count(),
            reconciler.optimistic_applied_count(),
            reconciler.optimistic_ignored_count()
        );
    }
    Ok(())
}
