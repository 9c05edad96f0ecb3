//! Clean/dedupe stage
//!
//! Streams an artifact line by line. The only state that grows with the input
//! is the set of keys already kept, and that set is bounded by
//! `dedupe.max_tracked_keys`: a run that would exceed it fails instead of
//! exhausting memory.

use anyhow::{anyhow, Context};
use chrono::Utc;
use paddock_common::types::{ArtifactName, KeyedDocument, Record, RecordKey};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, instrument};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Stage};
use crate::storage::{ArtifactWriter, ObjectStore};

/// Line accounting for one run. `total == kept + malformed + duplicates`;
/// blank lines are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupeCounts {
    pub kept: u64,
    /// Unparsable lines, lines without a usable key, and lines that do not
    /// have the shape of a record
    pub malformed: u64,
    pub duplicates: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanReport {
    pub source: ArtifactName,
    pub output: ArtifactName,
    pub counts: DedupeCounts,
}

/// First-seen key set with a hard capacity
struct SeenKeys {
    keys: HashSet<RecordKey>,
    capacity: usize,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            capacity,
        }
    }

    /// `Ok(true)` when the key is new
    fn insert(&mut self, key: RecordKey) -> anyhow::Result<bool> {
        if self.keys.contains(&key) {
            return Ok(false);
        }
        if self.keys.len() >= self.capacity {
            return Err(anyhow!(
                "more than {} distinct keys; raise PIPELINE_DEDUPE_MAX_KEYS or split the run",
                self.capacity
            ));
        }
        self.keys.insert(key);
        Ok(true)
    }
}

enum LineOutcome {
    Blank,
    Malformed,
    Duplicate,
    Kept(String),
}

pub struct CleanStage {
    store: Arc<dyn ObjectStore>,
    max_tracked_keys: usize,
}

impl CleanStage {
    pub fn new(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            max_tracked_keys: config.dedupe.max_tracked_keys,
        }
    }

    /// Drop malformed and duplicate lines from `source`, keeping the first
    /// occurrence of each key, and publish the rest next to it as a cleaned
    /// artifact.
    #[instrument(skip(self, source), fields(source = %source))]
    pub async fn clean_and_dedupe(
        &self,
        source: &ArtifactName,
    ) -> Result<CleanReport, PipelineError> {
        let stage_err = PipelineError::in_stage(Stage::Clean);

        let mut reader = self.store.reader(source.as_str()).await.map_err(stage_err)?;
        let mut writer = ArtifactWriter::create(source.cleaned(Utc::now()))
            .await
            .map_err(PipelineError::in_stage(Stage::Clean))?;

        let mut seen = SeenKeys::new(self.max_tracked_keys);
        let mut counts = DedupeCounts::default();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .await
                .with_context(|| format!("Failed to read {}", source))
                .map_err(PipelineError::in_stage(Stage::Clean))?;
            if read == 0 {
                break;
            }

            match classify(&buf, &mut seen).map_err(PipelineError::in_stage(Stage::Clean))? {
                LineOutcome::Blank => continue,
                LineOutcome::Malformed => counts.malformed += 1,
                LineOutcome::Duplicate => counts.duplicates += 1,
                LineOutcome::Kept(line) => {
                    writer
                        .write_line(&line)
                        .await
                        .map_err(PipelineError::in_stage(Stage::Clean))?;
                    counts.kept += 1;
                }
            }
            counts.total += 1;
        }

        let output = writer
            .finish(self.store.as_ref())
            .await
            .map_err(PipelineError::in_stage(Stage::Clean))?;

        info!(
            output = %output,
            kept = counts.kept,
            malformed = counts.malformed,
            duplicates = counts.duplicates,
            total = counts.total,
            "Clean stage finished"
        );

        Ok(CleanReport {
            source: source.clone(),
            output,
            counts,
        })
    }
}

fn classify(raw: &[u8], seen: &mut SeenKeys) -> anyhow::Result<LineOutcome> {
    let Ok(text) = std::str::from_utf8(raw) else {
        debug!("Skipping non UTF-8 line");
        return Ok(LineOutcome::Malformed);
    };
    let line = text.trim();
    if line.is_empty() {
        return Ok(LineOutcome::Blank);
    }

    let doc = match KeyedDocument::parse_line(line) {
        Ok(doc) => doc,
        Err(e) => {
            debug!(error = %e, "Skipping malformed line");
            return Ok(LineOutcome::Malformed);
        }
    };

    // A misshapen line never claims its key
    if let Err(e) = serde_json::from_str::<Record>(line) {
        debug!(id = %doc.id, error = %e, "Skipping line that is not a record");
        return Ok(LineOutcome::Malformed);
    }

    if !seen.insert(doc.id)? {
        debug!(id = %doc.id, "Skipping duplicate key");
        return Ok(LineOutcome::Duplicate);
    }

    Ok(LineOutcome::Kept(doc.to_canonical_line()?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use paddock_common::types::ArtifactKind;

    const MASTER: &str = "horse_data/master_horse_data_2025-01-01_00:00:00.ndjson";

    async fn clean(input: &str) -> (CleanReport, String) {
        clean_with(PipelineConfig::default(), input).await.unwrap()
    }

    async fn clean_with(
        config: PipelineConfig,
        input: &str,
    ) -> Result<(CleanReport, String), PipelineError> {
        let store = MemoryStore::new("b");
        store.insert(MASTER, input).await;
        let stage = CleanStage::new(&config, Arc::new(store.clone()));

        let report = stage
            .clean_and_dedupe(&ArtifactName::parse(MASTER).unwrap())
            .await?;
        let body = store.get_string(report.output.as_str()).await.unwrap();
        Ok((report, body))
    }

    #[tokio::test]
    async fn test_first_seen_wins() {
        let (report, body) = clean("{\"id\":1,\"v\":\"a\"}\n{\"id\":1,\"v\":\"b\"}\n").await;

        assert_eq!(body, "{\"id\":1,\"v\":\"a\"}\n");
        assert_eq!(
            report.counts,
            DedupeCounts {
                kept: 1,
                malformed: 0,
                duplicates: 1,
                total: 2
            }
        );
        assert_eq!(report.output.kind(), ArtifactKind::Cleaned);
        assert!(report.output.as_str().starts_with(
            "horse_data/master_horse_data_2025-01-01_00:00:00_cleaned_deduped_"
        ));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_counted() {
        let (report, body) = clean("not-json\n{\"id\":2}\n").await;
        assert_eq!(body, "{\"id\":2}\n");
        assert_eq!(report.counts.kept, 1);
        assert_eq!(report.counts.malformed, 1);
        assert_eq!(report.counts.total, 2);
    }

    #[tokio::test]
    async fn test_missing_key_counts_as_malformed() {
        let (report, body) = clean("{\"name\":\"x\"}").await;
        assert_eq!(body, "");
        assert_eq!(report.counts.malformed, 1);
        assert_eq!(report.counts.kept, 0);
    }

    #[tokio::test]
    async fn test_wrong_field_types_count_as_malformed() {
        let (report, body) = clean(concat!(
            "{\"id\":5,\"career\":\"oops\"}\n",
            "{\"id\":6,\"motherId\":\"abc\"}\n",
            "{\"id\":5,\"name\":\"Comet\"}\n",
            "{\"id\":7,\"races\":[{\"cityName\":\"Sopot\"}]}\n",
        ))
        .await;

        assert_eq!(
            body,
            "{\"id\":5,\"name\":\"Comet\"}\n{\"id\":7,\"races\":[{\"cityName\":\"Sopot\"}]}\n"
        );
        assert_eq!(
            report.counts,
            DedupeCounts {
                kept: 2,
                malformed: 2,
                duplicates: 0,
                total: 4
            }
        );
    }

    #[tokio::test]
    async fn test_blank_lines_and_invalid_utf8() {
        let (report, body) = clean("\n\n{\"id\":3}\r\n  \n\u{0}\n").await;
        assert_eq!(body, "{\"id\":3}\n");
        assert_eq!(report.counts.total, 2);
        assert_eq!(report.counts.malformed, 1);

        let store = MemoryStore::new("b");
        store.insert(MASTER, b"{\"id\":4}\n\xff\xfe\n".to_vec()).await;
        let stage = CleanStage::new(&PipelineConfig::default(), Arc::new(store.clone()));
        let report = stage
            .clean_and_dedupe(&ArtifactName::parse(MASTER).unwrap())
            .await
            .unwrap();
        assert_eq!(report.counts.kept, 1);
        assert_eq!(report.counts.malformed, 1);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let config = PipelineConfig::default().with_max_tracked_keys(2);

        let ok = clean_with(config.clone(), "{\"id\":1}\n{\"id\":2}\n{\"id\":1}\n").await;
        assert_eq!(ok.unwrap().0.counts.kept, 2);

        let err = clean_with(config, "{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n")
            .await
            .unwrap_err();
        assert_eq!(err.failing_stage(), Some(Stage::Clean));
    }

    #[tokio::test]
    async fn test_missing_source_is_a_stage_failure() {
        let store = MemoryStore::new("b");
        let stage = CleanStage::new(&PipelineConfig::default(), Arc::new(store));
        let err = stage
            .clean_and_dedupe(&ArtifactName::parse(MASTER).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.failing_stage(), Some(Stage::Clean));
    }
}
