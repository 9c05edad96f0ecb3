//! Stage and orchestrator tests over in-memory storage and warehouse

mod common;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{init_tracing, test_config, Harness};
use paddock_common::types::{ArtifactName, Record, RecordKey};
use paddock_ingest::orchestrator::{RawRunParams, RunParams};
use paddock_ingest::source::{FetchOutcome, RecordSource, SourceError};
use paddock_ingest::warehouse::DestinationRow;
use paddock_ingest::PipelineError;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "horse_data/";
const DESTINATION: &str = "horse_records";

/// Source holding a fixed set of records; every other id is not found
#[derive(Default)]
struct FixedSource {
    records: HashMap<u64, String>,
    calls: AtomicUsize,
}

impl FixedSource {
    fn with(records: &[(u64, &str)]) -> Self {
        Self {
            records: records
                .iter()
                .map(|(id, name)| (*id, name.to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RecordSource for FixedSource {
    async fn fetch(&self, id: u64) -> Result<FetchOutcome, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match self.records.get(&id) {
            Some(name) => {
                let mut record = Record::bare(RecordKey::new(id as i64).unwrap());
                record.name = Some(name.clone());
                FetchOutcome::Found(Box::new(record))
            }
            None => FetchOutcome::NotFound,
        })
    }
}

/// Tracks how many fetches are in flight at once
#[derive(Default)]
struct GaugedSource {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl RecordSource for GaugedSource {
    async fn fetch(&self, id: u64) -> Result<FetchOutcome, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(5)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let record = Record::bare(RecordKey::new(id as i64).unwrap());
        Ok(FetchOutcome::Found(Box::new(record)))
    }
}

fn at(ms: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn row(id: i64, name: &str) -> DestinationRow {
    let mut record = Record::bare(RecordKey::new(id).unwrap());
    record.name = Some(name.to_string());
    DestinationRow::project(&record, at(0))
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    init_tracing();
    let source = Arc::new(FixedSource::with(&[(1, "Comet"), (3, "Nova")]));
    let harness = Harness::new(source.clone());
    let stages = harness.context.stages();

    // Fetch: id 2 is not found
    let fetch = stages.fetch.fetch_batch(1, 3).await.unwrap();
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(fetch.fetched, 2);
    let shard = harness
        .store
        .get_string(fetch.artifact.as_str())
        .await
        .unwrap();
    assert_eq!(shard.lines().count(), 2);

    // Merge: one leftover shard from an earlier run carries a duplicate of id 3
    let leftover = ArtifactName::shard(PREFIX, 3, 1, at(1_000_000_000_000));
    harness
        .store
        .insert(leftover.as_str(), r#"{"id":3,"name":"Nova"}"#)
        .await;

    let merge = stages.merge.merge_shards().await.unwrap();
    // names order by start id first, so the fresh 1..3 shard comes first
    assert_eq!(merge.shards, vec![fetch.artifact.clone(), leftover.clone()]);
    assert!(merge.cleanup.is_clean());
    assert!(harness.store.get(leftover.as_str()).await.is_none());
    assert!(harness.store.get(fetch.artifact.as_str()).await.is_none());

    // Clean: the duplicate is removed
    let clean = stages.clean.clean_and_dedupe(&merge.master).await.unwrap();
    assert_eq!(clean.counts.total, 3);
    assert_eq!(clean.counts.kept, 2);
    assert_eq!(clean.counts.duplicates, 1);
    assert_eq!(clean.counts.malformed, 0);

    // Upsert: key 1 already exists
    harness
        .warehouse
        .insert_row(DESTINATION, row(1, "Old name"))
        .await;

    let upsert = stages.upsert.upsert(&clean.output).await.unwrap();
    assert_eq!(upsert.updated, 1);
    assert_eq!(upsert.inserted, 1);
    assert!(upsert.cleanup.is_none());

    let updated = harness.warehouse.row(DESTINATION, 1).await.unwrap();
    assert_eq!(updated.name.as_deref(), Some("Comet"));
    assert!(updated.updated_at > at(0));
    assert!(harness.warehouse.row(DESTINATION, 3).await.is_some());
    assert!(harness.warehouse.staging_tables().await.is_empty());
}

#[tokio::test]
async fn test_orchestrated_run_summary() {
    init_tracing();
    let source = Arc::new(FixedSource::with(&[(1, "Comet"), (3, "Nova"), (5, "Vega")]));
    let harness = Harness::new(source);
    harness
        .warehouse
        .insert_row(DESTINATION, row(1, "Old name"))
        .await;

    let raw: RawRunParams =
        serde_json::from_value(json!({"startId": "1", "batchSize": 3, "maxBatches": 2})).unwrap();
    let summary = harness.context.orchestrator().run(&raw).await.unwrap();

    assert_eq!(summary.start_id, 1);
    assert_eq!(summary.max_batches, 2);
    assert_eq!(summary.shard_files.len(), 2);
    assert_eq!(summary.operations.fetch.len(), 2);
    assert!(summary.operations.merge.starts_with("operations/merge-"));
    assert!(summary.operations.clean.starts_with("operations/clean-"));
    assert!(summary.operations.upsert.starts_with("operations/upsert-"));
    assert_eq!(summary.counts.kept, 3);
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.updated, 1);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["masterFile"], summary.master_file.as_str());
    assert_eq!(json["cleanedFile"], summary.cleaned_file.as_str());
    assert_eq!(json["operations"]["warehouseJobs"].as_array().unwrap().len(), 4);

    let record = harness
        .context
        .runner()
        .registry()
        .get(&summary.operations.upsert)
        .await
        .unwrap();
    assert!(record.is_finished());
}

#[tokio::test]
async fn test_rejected_parameters_touch_nothing() {
    let source = Arc::new(FixedSource::default());
    let harness = Harness::new(source.clone());

    for body in [
        json!({"startId": 0, "batchSize": 10}),
        json!({"startId": 1, "batchSize": -5}),
        json!({"startId": "one", "batchSize": 10}),
        json!({"batchSize": 10}),
    ] {
        let raw: RawRunParams = serde_json::from_value(body).unwrap();
        let err = harness.context.orchestrator().run(&raw).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    assert!(harness.store.keys().await.is_empty());
    assert!(harness.context.runner().registry().is_empty().await);
}

#[tokio::test]
async fn test_fetch_respects_concurrency_cap() {
    let source = Arc::new(GaugedSource::default());
    let harness = Harness::with_config(test_config().with_concurrency(3), source.clone());

    let report = harness
        .context
        .stages()
        .fetch
        .fetch_batch(1, 40)
        .await
        .unwrap();

    assert_eq!(report.fetched, 40);
    assert_eq!(source.calls.load(Ordering::SeqCst), 40);
    let peak = source.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight fetches was {}", peak);
    assert!(peak > 1, "fetches never overlapped");
}

#[tokio::test]
async fn test_merge_without_shards_is_not_found() {
    let harness = Harness::new(Arc::new(FixedSource::default()));
    harness
        .store
        .insert("horse_data/master_horse_data_2025-01-01_00:00:00.ndjson", "")
        .await;

    let err = harness
        .context
        .stages()
        .merge
        .merge_shards()
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_misshapen_lines_do_not_block_upsert() {
    init_tracing();
    let harness = Harness::new(Arc::new(FixedSource::default()));
    let stages = harness.context.stages();

    let master = ArtifactName::master(PREFIX, at(0));
    harness
        .store
        .insert(
            master.as_str(),
            concat!(
                r#"{"id":5,"career":"oops"}"#,
                "\n",
                r#"{"id":6,"motherId":"abc"}"#,
                "\n",
                r#"{"id":8,"name":"Vega"}"#,
                "\n",
            ),
        )
        .await;

    let clean = stages.clean.clean_and_dedupe(&master).await.unwrap();
    assert_eq!(clean.counts.total, 3);
    assert_eq!(clean.counts.kept, 1);
    assert_eq!(clean.counts.malformed, 2);

    let upsert = stages.upsert.upsert(&clean.output).await.unwrap();
    assert_eq!(upsert.inserted, 1);
    assert_eq!(upsert.updated, 0);
    assert_eq!(
        harness
            .warehouse
            .row(DESTINATION, 8)
            .await
            .unwrap()
            .name
            .as_deref(),
        Some("Vega")
    );
    assert!(harness.warehouse.row(DESTINATION, 5).await.is_none());
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn shard_body() -> impl Strategy<Value = String> {
    prop::collection::vec((1i64..1000, "[a-z]{0,6}"), 0..4).prop_map(|rows| {
        rows.iter()
            .map(|(id, name)| json!({"id": id, "name": name}).to_string())
            .collect::<Vec<_>>()
            .join("\n")
    })
}

fn document_line() -> impl Strategy<Value = String> {
    prop_oneof![
        (1i64..8, "[a-z]{0,3}").prop_map(|(id, v)| json!({"v": v, "id": id}).to_string()),
        Just("not-json".to_string()),
        Just(r#"{"name":"keyless"}"#.to_string()),
        Just(r#"{"id":5,"career":"oops"}"#.to_string()),
        Just(String::new()),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn merge_concatenates_in_name_order(
        bodies in prop::collection::vec(shard_body(), 1..5),
        order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        runtime().block_on(async {
            let harness = Harness::new(Arc::new(FixedSource::default()));
            let shards: Vec<ArtifactName> = (0..bodies.len())
                .map(|i| ArtifactName::shard(PREFIX, 1, 10, at(1_000 + i as i64)))
                .collect();

            for &i in order.iter().filter(|&&i| i < bodies.len()) {
                harness.store.insert(shards[i].as_str(), bodies[i].clone()).await;
            }

            let merge = harness.context.stages().merge.merge_shards().await.unwrap();
            let master = harness.store.get_string(merge.master.as_str()).await.unwrap();

            let expected: String = bodies.iter().map(|b| format!("{}\n", b)).collect();
            prop_assert_eq!(master, expected);
            prop_assert_eq!(merge.shards, shards);
            Ok(())
        })?;
    }

    #[test]
    fn dedupe_is_idempotent(lines in prop::collection::vec(document_line(), 0..30)) {
        runtime().block_on(async {
            let harness = Harness::new(Arc::new(FixedSource::default()));
            let master = ArtifactName::master(PREFIX, at(0));
            harness.store.insert(master.as_str(), lines.join("\n")).await;

            let clean = &harness.context.stages().clean;
            let first = clean.clean_and_dedupe(&master).await.unwrap();
            let second = clean.clean_and_dedupe(&first.output).await.unwrap();

            let once = harness.store.get(first.output.as_str()).await.unwrap();
            let twice = harness.store.get(second.output.as_str()).await.unwrap();
            prop_assert_eq!(once, twice);
            prop_assert_eq!(second.counts.malformed, 0);
            prop_assert_eq!(second.counts.duplicates, 0);
            prop_assert_eq!(second.counts.kept, first.counts.kept);
            prop_assert_eq!(
                first.counts.total,
                first.counts.kept + first.counts.malformed + first.counts.duplicates
            );
            Ok(())
        })?;
    }
}
