use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use paddock_common::types::ArtifactName;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, instrument};

use super::{JobKind, MergeResult, Warehouse, WarehouseJob};
use crate::config::{is_plain_identifier, WarehouseConfig};
use crate::storage::ObjectStore;

/// Postgres-backed warehouse
///
/// Staging tables hold one JSONB document per line, so their structure is
/// whatever the artifact carries. The merge projects those documents onto the
/// typed destination columns.
#[derive(Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
    load_chunk_size: usize,
}

impl PostgresWarehouse {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to connect to warehouse")?;

        info!("Warehouse connection pool established");

        Ok(Self::new(pool, config.load_chunk_size))
    }

    pub fn new(pool: PgPool, load_chunk_size: usize) -> Self {
        Self {
            pool,
            load_chunk_size: load_chunk_size.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_chunk(&self, table: &str, rows: &mut Vec<(i64, Value)>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} (line_no, doc) ", quoted(table)?));
        builder.push_values(rows.drain(..), |mut row, (line_no, doc)| {
            row.push_bind(line_no).push_bind(Json(doc));
        });
        builder
            .build()
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to load rows into {}", table))?;
        Ok(())
    }
}

fn quoted(table: &str) -> Result<String> {
    if !is_plain_identifier(table) && !is_staging_identifier(table) {
        bail!("{:?} is not a plain SQL identifier", table);
    }
    Ok(format!("\"{}\"", table))
}

/// `{identifier}_staging_{digits}`
fn is_staging_identifier(table: &str) -> bool {
    match table.rsplit_once("_staging_") {
        Some((base, millis)) => {
            is_plain_identifier(base)
                && !millis.is_empty()
                && millis.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    #[instrument(skip(self))]
    async fn ensure_destination(&self, table: &str) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id            BIGINT PRIMARY KEY,
                name          TEXT,
                gender        TEXT,
                color         TEXT,
                mother        TEXT,
                mother_id     BIGINT,
                father        TEXT,
                father_id     BIGINT,
                trainer       TEXT,
                breed         TEXT,
                breeder       TEXT,
                owner         TEXT,
                date_of_birth TEXT,
                career        JSONB NOT NULL DEFAULT '[]'::jsonb,
                races         JSONB NOT NULL DEFAULT '[]'::jsonb,
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            quoted(table)?
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create destination table {}", table))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_staging(&self, table: &str) -> Result<WarehouseJob> {
        let sql = format!(
            "CREATE TABLE {} (line_no BIGINT NOT NULL, doc JSONB NOT NULL)",
            quoted(table)?
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create staging table {}", table))?;

        let job = WarehouseJob::new(JobKind::CreateTable, table, 0);
        debug!(job_id = %job.job_id, "Staging table created");
        Ok(job)
    }

    #[instrument(skip(self, store, artifact), fields(artifact = %artifact))]
    async fn load_staging(
        &self,
        table: &str,
        store: &dyn ObjectStore,
        artifact: &ArtifactName,
    ) -> Result<WarehouseJob> {
        let mut lines = store.reader(artifact.as_str()).await?.lines();
        let mut chunk = Vec::with_capacity(self.load_chunk_size);
        let mut line_no: i64 = 0;
        let mut loaded: u64 = 0;

        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("Failed to read {}", artifact))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Value = serde_json::from_str(&line)
                .with_context(|| format!("{} line {} is not valid JSON", artifact, line_no))?;
            if !doc.is_object() {
                bail!("{} line {} is not a JSON object", artifact, line_no);
            }

            chunk.push((line_no, doc));
            loaded += 1;
            if chunk.len() >= self.load_chunk_size {
                self.insert_chunk(table, &mut chunk).await?;
            }
        }
        self.insert_chunk(table, &mut chunk).await?;

        let job = WarehouseJob::new(JobKind::Load, table, loaded);
        info!(job_id = %job.job_id, rows = loaded, "Staging table loaded");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn merge_staging(&self, staging: &str, destination: &str) -> Result<MergeResult> {
        let sql = format!(
            r#"
            WITH source AS (
                SELECT DISTINCT ON ((doc->>'id')::bigint)
                    (doc->>'id')::bigint AS id, doc
                FROM {staging}
                WHERE doc ? 'id'
                ORDER BY (doc->>'id')::bigint, line_no
            ),
            merged AS (
                INSERT INTO {destination} AS t (
                    id, name, gender, color, mother, mother_id, father, father_id,
                    trainer, breed, breeder, owner, date_of_birth, career, races, updated_at
                )
                SELECT
                    s.id,
                    s.doc->>'name',
                    s.doc->>'gender',
                    s.doc->>'color',
                    s.doc->>'mother',
                    (s.doc->>'motherId')::bigint,
                    s.doc->>'father',
                    (s.doc->>'fatherId')::bigint,
                    s.doc->>'trainer',
                    s.doc->>'breed',
                    s.doc->>'breeder',
                    s.doc->>'owner',
                    s.doc->>'dateOfBirth',
                    COALESCE((
                        SELECT jsonb_agg(jsonb_build_object(
                            'raceYear',       (e->>'raceYear')::bigint,
                            'raceName',       '',
                            'prize',          e->>'prize',
                            'otherDetails',   '',
                            'horseAge',       (e->>'horseAge')::bigint,
                            'raceType',       e->>'raceType',
                            'raceCount',      (e->>'raceCount')::bigint,
                            'raceWonCount',   (e->>'raceWonCount')::bigint,
                            'racePrizeCount', (e->>'racePrizeCount')::bigint
                        ) ORDER BY n)
                        FROM jsonb_array_elements(COALESCE(s.doc->'career', '[]'::jsonb))
                            WITH ORDINALITY AS c(e, n)
                    ), '[]'::jsonb),
                    COALESCE((
                        SELECT jsonb_agg(jsonb_build_object(
                            'horseOrder',       (e->>'horseOrder')::bigint,
                            'horseFinalPlace',  (e->>'horseFinalPlace')::bigint,
                            'prizeAmount',      e->>'prizeAmount',
                            'prizeCurrency',    e->>'prizeCurrency',
                            'jockeyFirstName',  e->>'jockeyFirstName',
                            'jockeyLastName',   e->>'jockeyLastName',
                            'jockeyWeight',     (e->>'jockeyWeight')::double precision,
                            'trackDistance',    (e->>'trackDistance')::double precision,
                            'temperature',      (e->>'temperature')::double precision,
                            'weather',          e->>'weather',
                            'raceGroup',        e->>'raceGroup',
                            'raceSubtype',      e->>'raceSubtype',
                            'raceCategoryName', e->>'raceCategoryName',
                            'cityName',         e->>'cityName',
                            'trackTypeName',    e->>'trackTypeName'
                        ) ORDER BY n)
                        FROM jsonb_array_elements(COALESCE(s.doc->'races', '[]'::jsonb))
                            WITH ORDINALITY AS r(e, n)
                    ), '[]'::jsonb),
                    now()
                FROM source s
                ON CONFLICT (id) DO UPDATE SET
                    name          = EXCLUDED.name,
                    gender        = EXCLUDED.gender,
                    color         = EXCLUDED.color,
                    mother        = EXCLUDED.mother,
                    mother_id     = EXCLUDED.mother_id,
                    father        = EXCLUDED.father,
                    father_id     = EXCLUDED.father_id,
                    trainer       = EXCLUDED.trainer,
                    breed         = EXCLUDED.breed,
                    breeder       = EXCLUDED.breeder,
                    owner         = EXCLUDED.owner,
                    date_of_birth = EXCLUDED.date_of_birth,
                    career        = EXCLUDED.career,
                    races         = EXCLUDED.races,
                    updated_at    = EXCLUDED.updated_at
                RETURNING (xmax = 0) AS inserted
            )
            SELECT
                COUNT(*) FILTER (WHERE inserted),
                COUNT(*) FILTER (WHERE NOT inserted)
            FROM merged
            "#,
            staging = quoted(staging)?,
            destination = quoted(destination)?,
        );

        let (inserted, updated): (i64, i64) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to merge {} into {}", staging, destination))?;

        let (inserted, updated) = (inserted.max(0) as u64, updated.max(0) as u64);
        let job = WarehouseJob::new(JobKind::Merge, destination, inserted + updated);
        info!(job_id = %job.job_id, inserted, updated, "Merge complete");

        Ok(MergeResult {
            job,
            inserted,
            updated,
        })
    }

    #[instrument(skip(self))]
    async fn drop_table(&self, table: &str) -> Result<WarehouseJob> {
        let sql = format!("DROP TABLE IF EXISTS {}", quoted(table)?);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to drop table {}", table))?;
        Ok(WarehouseJob::new(JobKind::DropTable, table, 0))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quoted("horse_records").unwrap(), "\"horse_records\"");
        assert_eq!(
            quoted("horse_records_staging_1700000000123").unwrap(),
            "\"horse_records_staging_1700000000123\""
        );
        assert!(quoted("horse_records\"; DROP TABLE x; --").is_err());
        assert!(quoted("horse_records_staging_").is_err());
        assert!(quoted("public.horse_records").is_err());
    }
}
