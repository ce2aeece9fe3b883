use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use paddock_notify::MemorySink;
use paddock_storage::{JsonFileSeenStore, SeenStoreRepository};
use paddock_sync::{
    describe_store, report_recent_runs, PersistOrder, RunOverrides, SyncConfig, SyncPipeline,
};
use tempfile::{tempdir, TempDir};

const REGISTRY: &str = r#"
sources:
  - source_id: engagements
    display_name: Engagements
    enabled: true
    kind: engagements
    batch_path: batches/engagements.json
  - source_id: results
    display_name: Results
    enabled: false
    kind: results
    batch_path: batches/results.json
"#;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, day, hour, 0, 0)
        .single()
        .expect("ts")
}

fn write_batch(root: &Path, statuses: &[(&str, &str)]) {
    let records: Vec<_> = statuses
        .iter()
        .map(|(subject, status)| {
            serde_json::json!({
                "subject": subject,
                "date": "01/01/2026",
                "location": "Paris",
                "event": "Prix X",
                "status": status,
            })
        })
        .collect();
    std::fs::create_dir_all(root.join("batches")).expect("batches dir");
    std::fs::write(
        root.join("batches/engagements.json"),
        serde_json::to_vec(&records).expect("json"),
    )
    .expect("write batch");
}

fn workspace(order: PersistOrder) -> (TempDir, SyncConfig) {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("sources.yaml"), REGISTRY).expect("registry");
    let config = SyncConfig {
        workspace_root: dir.path().to_path_buf(),
        state_dir: dir.path().join("state"),
        chunk_budget: 200,
        persist_order: order,
        ..Default::default()
    };
    (dir, config)
}

fn at_time(now: DateTime<Utc>) -> RunOverrides {
    RunOverrides {
        now: Some(now),
        ..Default::default()
    }
}

#[tokio::test]
async fn first_run_reports_new_rows_and_second_run_is_quiet() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    write_batch(dir.path(), &[("Horse A", "ENG"), ("Horse B", "ENG"), ("Horse A", "ENG")]);
    let sink = Arc::new(MemorySink::new());
    let pipeline = SyncPipeline::new(config.clone()).with_sink(sink.clone());

    let first = pipeline.run_once(at_time(at(1, 8))).await.expect("first run");
    assert_eq!(first.sources.len(), 1);
    let outcome = &first.sources[0];
    assert!(outcome.first_of_period);
    assert_eq!(outcome.fetched, 3);
    assert_eq!(outcome.duplicates_dropped, 1);
    assert_eq!(outcome.new.len(), 2);
    assert_eq!(outcome.chunks_delivered, 1);
    assert!(Path::new(&first.reports_dir).join("run_brief.md").exists());
    assert!(Path::new(&first.reports_dir).join("reconciliation.json").exists());

    let delivered = sink.delivered().await;
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].contains("Horse A"));
    assert!(delivered[0].contains("Horse B"));

    let second = pipeline.run_once(at_time(at(1, 12))).await.expect("second run");
    let outcome = &second.sources[0];
    assert!(!outcome.first_of_period);
    assert!(!outcome.reportable());
    assert_eq!(outcome.unchanged, 2);
    assert_eq!(outcome.chunks_delivered, 0);
    assert_eq!(sink.delivered().await.len(), 1);

    let store = JsonFileSeenStore::new(config.store_path("engagements"))
        .load()
        .await
        .expect("store");
    assert_eq!(store.len(), 2);
    assert!(store.iter().all(|(_, entry)| entry.last_seen_at == at(1, 12)));
}

#[tokio::test]
async fn status_change_and_next_day_confirmation() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    let sink = Arc::new(MemorySink::new());
    let pipeline = SyncPipeline::new(config).with_sink(sink.clone());

    write_batch(dir.path(), &[("Horse A", "ENG")]);
    pipeline.run_once(at_time(at(1, 8))).await.expect("first run");

    write_batch(dir.path(), &[("Horse A", "DP-P")]);
    let changed = pipeline.run_once(at_time(at(1, 18))).await.expect("change run");
    let outcome = &changed.sources[0];
    assert_eq!(outcome.changed.len(), 1);
    assert_eq!(outcome.changed[0].previous_status, "ENG");
    assert!(outcome.confirmed.is_empty());

    let next_day = pipeline.run_once(at_time(at(2, 8))).await.expect("next day");
    let outcome = &next_day.sources[0];
    assert!(outcome.first_of_period);
    assert!(outcome.changed.is_empty() && outcome.new.is_empty());
    assert_eq!(outcome.confirmed.len(), 1);

    let delivered = sink.delivered().await;
    assert_eq!(delivered.len(), 3);
    assert!(delivered[1].contains("ENG → DP-P"));
    assert!(delivered[2].starts_with("✅"));
}

#[tokio::test]
async fn failed_delivery_keeps_store_untouched_when_persisting_after() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    write_batch(dir.path(), &[("Horse A", "ENG")]);
    let pipeline =
        SyncPipeline::new(config.clone()).with_sink(Arc::new(MemorySink::failing("webhook down")));

    let err = pipeline.run_once(at_time(at(1, 8))).await.unwrap_err();
    assert!(format!("{err:#}").contains("webhook down"));
    assert!(!config.store_path("engagements").exists());
}

#[tokio::test]
async fn failed_delivery_still_persists_when_persisting_before() {
    let (dir, config) = workspace(PersistOrder::BeforeDelivery);
    write_batch(dir.path(), &[("Horse A", "ENG")]);
    let pipeline =
        SyncPipeline::new(config.clone()).with_sink(Arc::new(MemorySink::failing("webhook down")));

    assert!(pipeline.run_once(at_time(at(1, 8))).await.is_err());
    let store = JsonFileSeenStore::new(config.store_path("engagements"))
        .load()
        .await
        .expect("store");
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn force_renotifies_known_rows() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    write_batch(dir.path(), &[("Horse A", "ENG"), ("Horse B", "ENG")]);
    let sink = Arc::new(MemorySink::new());
    let pipeline = SyncPipeline::new(config).with_sink(sink.clone());

    pipeline.run_once(at_time(at(1, 8))).await.expect("first run");
    let forced = pipeline
        .run_once(RunOverrides {
            force: true,
            now: Some(at(1, 9)),
            ..Default::default()
        })
        .await
        .expect("forced run");
    assert!(forced.sources[0].forced);
    assert_eq!(forced.sources[0].new.len(), 2);
    assert_eq!(sink.delivered().await.len(), 2);
}

#[tokio::test]
async fn only_source_runs_disabled_source_and_rejects_unknown() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    std::fs::create_dir_all(dir.path().join("batches")).expect("dir");
    std::fs::write(
        dir.path().join("batches/results.json"),
        r#"[{"subject":"Horse A","date":"01/01/2026","location":"Paris","event":"Prix X","status":"1er"}]"#,
    )
    .expect("results");
    let pipeline = SyncPipeline::new(config).with_sink(Arc::new(MemorySink::new()));

    let summary = pipeline
        .run_once(RunOverrides {
            only_source: Some("results".into()),
            first_of_period: Some(true),
            now: Some(at(1, 20)),
            ..Default::default()
        })
        .await
        .expect("results run");
    assert_eq!(summary.sources[0].source_id, "results");
    assert!(summary.sources[0].confirmed.is_empty());

    let err = pipeline
        .run_once(RunOverrides {
            only_source: Some("nope".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope"));
}

#[tokio::test]
async fn malformed_batch_fails_the_run_without_writing_state() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    std::fs::create_dir_all(dir.path().join("batches")).expect("dir");
    std::fs::write(
        dir.path().join("batches/engagements.json"),
        r#"[{"subject":"Horse A","date":"","location":"Paris"}]"#,
    )
    .expect("batch");
    let pipeline = SyncPipeline::new(config.clone()).with_sink(Arc::new(MemorySink::new()));

    let err = pipeline.run_once(at_time(at(1, 8))).await.unwrap_err();
    assert!(format!("{err:#}").contains("missing its date"));
    assert!(!config.store_path("engagements").exists());
    assert!(!config.period_marker_path("engagements").exists());
}

#[tokio::test]
async fn recent_runs_and_store_description_render() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    write_batch(dir.path(), &[("Horse A", "ENG")]);
    let pipeline = SyncPipeline::new(config.clone()).with_sink(Arc::new(MemorySink::new()));
    let summary = pipeline.run_once(at_time(at(1, 8))).await.expect("run");

    let report = report_recent_runs(5, &config).expect("report");
    assert!(report.contains(&summary.run_id.to_string()));
    assert!(report.contains("engagements: new 1"));

    let described = describe_store(&config, "engagements", 10).await.expect("describe");
    assert!(described.contains("entries: 1"));
    assert!(described.contains("last run day: 2026-01-01"));
    assert!(described.contains("horse a|01/01/2026|paris|prix x|"));
}

#[tokio::test]
async fn failing_source_does_not_stop_the_others_and_the_report_is_written() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    std::fs::write(
        dir.path().join("sources.yaml"),
        REGISTRY.replace("enabled: false", "enabled: true"),
    )
    .expect("registry");
    write_batch(dir.path(), &[("Horse A", "ENG")]);
    std::fs::write(
        dir.path().join("batches/results.json"),
        r#"[{"subject":"Horse A","date":"","location":"Paris","event":"Prix X","status":"1er"}]"#,
    )
    .expect("results");
    let sink = Arc::new(MemorySink::new());
    let pipeline = SyncPipeline::new(config.clone()).with_sink(sink.clone());

    let err = pipeline.run_once(at_time(at(1, 8))).await.unwrap_err();
    assert!(format!("{err:#}").contains("missing its date"));

    assert_eq!(sink.delivered().await.len(), 1);
    assert!(config.store_path("engagements").exists());
    assert!(!config.store_path("results").exists());

    let run_dirs: Vec<_> = std::fs::read_dir(config.reports_root())
        .expect("reports root")
        .filter_map(|entry| entry.ok())
        .collect();
    assert_eq!(run_dirs.len(), 1);
    let summary: serde_json::Value = serde_json::from_slice(
        &std::fs::read(run_dirs[0].path().join("reconciliation.json")).expect("summary"),
    )
    .expect("json");
    assert_eq!(summary["sources"][0]["source_id"], "engagements");
    assert_eq!(summary["failures"][0]["source_id"], "results");
    let brief = std::fs::read_to_string(run_dirs[0].path().join("run_brief.md")).expect("brief");
    assert!(brief.contains("## Failures"));

    let report = report_recent_runs(5, &config).expect("report");
    assert!(report.contains("engagements: new 1"));
    assert!(report.contains("results: FAILED"));
}

#[tokio::test]
async fn forced_not_first_run_leaves_the_day_open() {
    let (dir, config) = workspace(PersistOrder::AfterDelivery);
    write_batch(dir.path(), &[("Horse A", "DP-P")]);
    let pipeline = SyncPipeline::new(config).with_sink(Arc::new(MemorySink::new()));

    pipeline.run_once(at_time(at(1, 8))).await.expect("day one");
    let forced = pipeline
        .run_once(RunOverrides {
            first_of_period: Some(false),
            now: Some(at(2, 7)),
            ..Default::default()
        })
        .await
        .expect("forced run");
    assert!(!forced.sources[0].first_of_period);
    assert!(forced.sources[0].confirmed.is_empty());

    let next = pipeline.run_once(at_time(at(2, 8))).await.expect("scheduled run");
    assert!(next.sources[0].first_of_period);
    assert_eq!(next.sources[0].confirmed.len(), 1);
}
