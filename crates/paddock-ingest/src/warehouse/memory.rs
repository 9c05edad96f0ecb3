use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use paddock_common::types::{ArtifactName, Record};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::RwLock;

use super::{DestinationRow, JobKind, MergeResult, Warehouse, WarehouseJob};
use crate::storage::ObjectStore;

#[derive(Default)]
struct Tables {
    destinations: HashMap<String, BTreeMap<i64, DestinationRow>>,
    staging: HashMap<String, Vec<Value>>,
}

#[derive(Default)]
struct Inner {
    tables: RwLock<Tables>,
    fail_merge: AtomicBool,
    fail_drop: AtomicBool,
}

/// In-process warehouse with the same merge semantics as
/// [`super::PostgresWarehouse`]. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Inner>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a destination row
    pub async fn insert_row(&self, table: &str, row: DestinationRow) {
        self.inner
            .tables
            .write()
            .await
            .destinations
            .entry(table.to_string())
            .or_default()
            .insert(row.id, row);
    }

    pub async fn row(&self, table: &str, id: i64) -> Option<DestinationRow> {
        self.inner
            .tables
            .read()
            .await
            .destinations
            .get(table)
            .and_then(|rows| rows.get(&id))
            .cloned()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .read()
            .await
            .destinations
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    /// Names of staging tables that still exist
    pub async fn staging_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .tables
            .read()
            .await
            .staging
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn fail_merges(&self, fail: bool) {
        self.inner.fail_merge.store(fail, Ordering::SeqCst);
    }

    pub fn fail_drops(&self, fail: bool) {
        self.inner.fail_drop.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_destination(&self, table: &str) -> Result<()> {
        self.inner
            .tables
            .write()
            .await
            .destinations
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn create_staging(&self, table: &str) -> Result<WarehouseJob> {
        let mut tables = self.inner.tables.write().await;
        if tables.staging.contains_key(table) {
            bail!("Table {} already exists", table);
        }
        tables.staging.insert(table.to_string(), Vec::new());
        Ok(WarehouseJob::new(JobKind::CreateTable, table, 0))
    }

    async fn load_staging(
        &self,
        table: &str,
        store: &dyn ObjectStore,
        artifact: &ArtifactName,
    ) -> Result<WarehouseJob> {
        let mut lines = store.reader(artifact.as_str()).await?.lines();
        let mut docs = Vec::new();
        let mut line_no = 0;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Value = serde_json::from_str(&line)
                .with_context(|| format!("{} line {} is not valid JSON", artifact, line_no))?;
            if !doc.is_object() {
                bail!("{} line {} is not a JSON object", artifact, line_no);
            }
            docs.push(doc);
        }

        let rows = docs.len() as u64;
        self.inner
            .tables
            .write()
            .await
            .staging
            .get_mut(table)
            .ok_or_else(|| anyhow!("Staging table {} does not exist", table))?
            .extend(docs);

        Ok(WarehouseJob::new(JobKind::Load, table, rows))
    }

    async fn merge_staging(&self, staging: &str, destination: &str) -> Result<MergeResult> {
        if self.inner.fail_merge.load(Ordering::SeqCst) {
            bail!("Merge into {} rejected", destination);
        }

        let mut tables = self.inner.tables.write().await;
        let docs = tables
            .staging
            .get(staging)
            .ok_or_else(|| anyhow!("Staging table {} does not exist", staging))?
            .clone();

        let now = Utc::now();
        let mut projected = Vec::with_capacity(docs.len());
        let mut seen = HashSet::new();
        for doc in docs {
            let record: Record = serde_json::from_value(doc)
                .context("Staged row does not match the record shape")?;
            if seen.insert(record.id) {
                projected.push(DestinationRow::project(&record, now));
            }
        }

        let rows = tables
            .destinations
            .get_mut(destination)
            .ok_or_else(|| anyhow!("Destination table {} does not exist", destination))?;

        let (mut inserted, mut updated) = (0u64, 0u64);
        for row in projected {
            match rows.insert(row.id, row) {
                Some(_) => updated += 1,
                None => inserted += 1,
            }
        }

        Ok(MergeResult {
            job: WarehouseJob::new(JobKind::Merge, destination, inserted + updated),
            inserted,
            updated,
        })
    }

    async fn drop_table(&self, table: &str) -> Result<WarehouseJob> {
        if self.inner.fail_drop.load(Ordering::SeqCst) {
            bail!("Permission denied dropping {}", table);
        }
        let mut tables = self.inner.tables.write().await;
        tables.staging.remove(table);
        tables.destinations.remove(table);
        Ok(WarehouseJob::new(JobKind::DropTable, table, 0))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const CLEANED: &str = "horse_data/master_cleaned_deduped_x.ndjson";

    #[tokio::test]
    async fn test_merge_inserts_and_updates() {
        let store = MemoryStore::new("b");
        store
            .insert(CLEANED, "{\"id\":1,\"name\":\"New\"}\n{\"id\":3,\"name\":\"Three\"}\n")
            .await;

        let warehouse = MemoryWarehouse::new();
        warehouse.ensure_destination("horse_records").await.unwrap();
        let mut existing = DestinationRow::project(
            &Record::bare(paddock_common::types::RecordKey::new(1).unwrap()),
            Utc::now() - chrono::Duration::days(1),
        );
        existing.name = Some("Old".into());
        let old_stamp = existing.updated_at;
        warehouse.insert_row("horse_records", existing).await;

        warehouse.create_staging("s1").await.unwrap();
        let load = warehouse
            .load_staging("s1", &store, &ArtifactName::parse(CLEANED).unwrap())
            .await
            .unwrap();
        assert_eq!(load.rows, 2);

        let merge = warehouse.merge_staging("s1", "horse_records").await.unwrap();
        assert_eq!((merge.inserted, merge.updated), (1, 1));

        let updated = warehouse.row("horse_records", 1).await.unwrap();
        assert_eq!(updated.name.as_deref(), Some("New"));
        assert!(updated.updated_at > old_stamp);
        assert!(warehouse.row("horse_records", 3).await.is_some());

        warehouse.drop_table("s1").await.unwrap();
        assert!(warehouse.staging_tables().await.is_empty());
    }

    #[tokio::test]
    async fn test_staged_rows_must_match_record_shape() {
        let store = MemoryStore::new("b");
        store
            .insert(CLEANED, "{\"id\":1,\"career\":[{\"raceYear\":\"soon\"}]}\n")
            .await;

        let warehouse = MemoryWarehouse::new();
        warehouse.ensure_destination("horse_records").await.unwrap();
        warehouse.create_staging("s1").await.unwrap();
        warehouse
            .load_staging("s1", &store, &ArtifactName::parse(CLEANED).unwrap())
            .await
            .unwrap();

        assert!(warehouse.merge_staging("s1", "horse_records").await.is_err());
        assert_eq!(warehouse.row_count("horse_records").await, 0);
    }
}
