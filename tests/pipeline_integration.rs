use game_feed::bus::BusConfig;
use game_feed::capture::CaptureAdapter;
use game_feed::envelope::{Payload, Source};
use game_feed::pipeline::{Pipeline, PipelineConfig};
use game_feed::store::{StoreConfig, StoreError, reader};
use serde_json::{Value, json};
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

fn config(root: &std::path::Path, threshold: usize) -> PipelineConfig {
    PipelineConfig {
        bus: BusConfig {
            queue_capacity: 8_192,
            ..BusConfig::default()
        },
        store: StoreConfig {
            root: root.to_path_buf(),
            flush_threshold: threshold,
            flush_interval: Duration::from_secs(3600),
            ..StoreConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn payload(v: Value) -> Payload {
    v.as_object().cloned().unwrap_or_default()
}

#[test]
fn end_to_end_record_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path(), 100), "e2e").unwrap();
    pipeline.start().unwrap();
    let bus = pipeline.bus().clone();

    bus.publish(Source::PublicFeed, "gameStarted", Payload::new()).unwrap();
    bus.publish(Source::AuthenticatedFeed, "playerUpdate", payload(json!({"cash": 10.0, "positionQty": 0.0})))
        .unwrap();
    for t in 0..150u64 {
        bus.publish(Source::PublicFeed, "gameStateUpdate", payload(json!({"tickCount": t, "price": 1.0 + t as f64 / 100.0})))
            .unwrap();
    }
    bus.publish(Source::Local, "buyOrder", payload(json!({"cash": 9.0, "positionQty": 1.0}))).unwrap();
    bus.publish(Source::AuthenticatedFeed, "playerUpdate", payload(json!({"cash": 8.95, "positionQty": 1.0})))
        .unwrap();
    bus.publish(Source::PublicFeed, "rugPool", payload(json!({"instarug": true}))).unwrap();
    // Local state is delivered to the reconciler but not persisted by default.
    bus.publish(Source::Local, "localStateUpdate", payload(json!({"avgCost": 1.2}))).unwrap();

    let report = pipeline.stop();
    report.ensure_complete().unwrap();
    assert_eq!(report.published, 156);
    assert_eq!(report.dropped, 0);
    assert_eq!(report.persisted, 155);
    assert_eq!(report.store.abandoned_records, 0);
    assert_eq!(report.snapshot.balance, 8.95);
    assert_eq!(report.snapshot.position_qty, 1.0);
    assert_eq!(report.snapshot.current_tick, 149);
    assert_eq!(report.snapshot.avg_entry_price, 1.2);
    assert_eq!(report.snapshot.sessions_started, 1);

    let records = reader::load_session(dir.path(), "e2e").unwrap();
    assert_eq!(records.len(), 155);
    reader::verify_total_order(&records).unwrap();
    assert_eq!(records[0].event_name, "gameStarted");
    assert_eq!(records[1].source, Source::AuthenticatedFeed);
    assert_eq!(records[2].fields["tickCount"], json!(0));

    let tick_dir = game_feed::store::part::partition_dir(dir.path(), "tick", "e2e");
    let parts = reader::list_parts(&tick_dir).unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(reader::read_part(&parts[0].1).unwrap().len(), 100);
    assert_eq!(reader::read_part(&parts[1].1).unwrap().len(), 50);

    let mut doc_types = reader::doc_types(dir.path()).unwrap();
    doc_types.sort();
    assert_eq!(doc_types, vec!["other", "player_state", "session", "tick", "trade"]);
    assert_eq!(reader::sessions(dir.path()).unwrap(), vec!["e2e".to_string()]);
}

#[test]
fn capture_input_flows_to_store_and_reconciler() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path(), 2), "cap").unwrap();
    pipeline.start().unwrap();

    let input = [
        r#"{"event_name":"playerUpdate","payload":{"cash":5.0},"source":"authenticated_feed"}"#,
        r#"{"event_name":"gameStateUpdate","payload":{"tickCount":3,"price":1.5}}"#,
        r#"{"event_name":"gameStateUpdate","payload":{"tickCount":"x","price":1.5}}"#,
        r#"{oops"#,
        r#"{"event_name":"sellOrder","payload":{"positionQty":0}}"#,
    ]
    .join("\n");
    let adapter = CaptureAdapter::new(pipeline.bus().clone(), Source::PublicFeed);
    let stats = adapter.run(Cursor::new(input), &AtomicBool::new(false)).unwrap();
    assert_eq!((stats.published, stats.malformed), (4, 1));

    let reconciler = pipeline.reconciler().clone();
    let report = pipeline.stop();
    assert!(report.is_complete());
    // Malformed authoritative updates are still persisted as received.
    assert_eq!(report.persisted, 4);
    assert_eq!(reconciler.malformed_count(), 1);
    assert_eq!(report.snapshot.current_tick, 3);
    assert_eq!(report.snapshot.balance, 5.0);
}

#[test]
fn session_is_single_writer_and_reopen_appends() {
    let dir = tempfile::tempdir().unwrap();
    let first = Pipeline::open(config(dir.path(), 10), "solo").unwrap();
    let err = Pipeline::open(config(dir.path(), 10), "solo").err().unwrap();
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::SessionLocked { .. })));

    first.start().unwrap();
    first.bus().publish(Source::PublicFeed, "gameStateUpdate", payload(json!({"tickCount": 1, "price": 1.0}))).unwrap();
    first.stop().ensure_complete().unwrap();

    let second = Pipeline::open(config(dir.path(), 10), "solo").unwrap();
    second.start().unwrap();
    second.bus().publish(Source::PublicFeed, "gameStateUpdate", payload(json!({"tickCount": 2, "price": 1.0}))).unwrap();
    second.stop().ensure_complete().unwrap();

    let tick_dir = game_feed::store::part::partition_dir(dir.path(), "tick", "solo");
    let indexes: Vec<u64> = reader::list_parts(&tick_dir).unwrap().into_iter().map(|(i, _)| i).collect();
    assert_eq!(indexes, vec![0, 1]);
    let records = reader::load_session(dir.path(), "solo").unwrap();
    reader::verify_total_order(&records).unwrap();
    assert_eq!(records[1].fields["tickCount"], json!(2));
}

#[test]
fn failed_final_flush_still_reports_what_was_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path(), 100), "blocked").unwrap();
    // A plain file where the tick partition directory should go.
    fs::write(dir.path().join("doc_type=tick"), b"blocked").unwrap();
    pipeline.start().unwrap();
    pipeline.bus().publish(Source::PublicFeed, "gameStarted", Payload::new()).unwrap();
    for t in 0..3u64 {
        pipeline
            .bus()
            .publish(Source::PublicFeed, "gameStateUpdate", payload(json!({"tickCount": t, "price": 1.0})))
            .unwrap();
    }

    let report = pipeline.stop();
    assert!(!report.is_complete());
    assert_eq!(report.shutdown_errors.len(), 1);
    assert!(report.shutdown_errors[0].contains("stop event store"), "{:?}", report.shutdown_errors);
    assert!(report.ensure_complete().is_err());
    assert_eq!(report.published, 4);
    assert_eq!(report.persisted, 1);
    assert_eq!(report.store.abandoned_records, 3);
    assert_eq!(report.snapshot.current_tick, 2);

    let records = reader::load_session(dir.path(), "blocked").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_name, "gameStarted");
}

#[test]
fn corrupted_part_is_detected_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::open(config(dir.path(), 5), "crc").unwrap();
    pipeline.start().unwrap();
    for t in 0..5u64 {
        pipeline
            .bus()
            .publish(Source::PublicFeed, "gameStateUpdate", payload(json!({"tickCount": t, "price": 2.0})))
            .unwrap();
    }
    pipeline.stop().ensure_complete().unwrap();

    let tick_dir = game_feed::store::part::partition_dir(dir.path(), "tick", "crc");
    let (_, path) = reader::list_parts(&tick_dir).unwrap().remove(0);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x5A;
    let mut f = OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
    f.write_all(&bytes).unwrap();
    drop(f);

    let err = reader::load_session(dir.path(), "crc").unwrap_err();
    assert!(format!("{err:#}").contains("CRC mismatch"), "{err:#}");
}
