//! Analytical warehouse seam
//!
//! The upsert stage drives a [`Warehouse`] through create, load, merge and
//! drop. Every step returns a [`WarehouseJob`] so the run summary can list
//! each job id.
//!
//! The destination keeps its own sub-collection shapes. [`DestinationCareer`]
//! and [`DestinationRace`] are built field by field from the staged record;
//! nothing is coerced implicitly. [`PostgresWarehouse`] performs the same
//! projection in SQL.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paddock_common::types::{ArtifactName, CareerEntry, RaceEntry, Record};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::ObjectStore;

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresWarehouse;

/// Kind of warehouse job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CreateTable,
    Load,
    Merge,
    DropTable,
}

impl JobKind {
    fn as_str(self) -> &'static str {
        match self {
            JobKind::CreateTable => "create",
            JobKind::Load => "load",
            JobKind::Merge => "merge",
            JobKind::DropTable => "drop",
        }
    }
}

/// One completed warehouse job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseJob {
    pub job_id: String,
    pub kind: JobKind,
    pub table: String,
    pub rows: u64,
}

impl WarehouseJob {
    pub fn new(kind: JobKind, table: &str, rows: u64) -> Self {
        Self {
            job_id: format!("job_{}_{}", kind.as_str(), Uuid::new_v4().simple()),
            kind,
            table: table.to_string(),
            rows,
        }
    }
}

/// Merge job plus its inserted/updated split
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub job: WarehouseJob,
    pub inserted: u64,
    pub updated: u64,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the durable table if it does not exist yet
    async fn ensure_destination(&self, table: &str) -> Result<()>;

    async fn create_staging(&self, table: &str) -> Result<WarehouseJob>;

    /// Bulk-load every line of `artifact` into the staging table
    async fn load_staging(
        &self,
        table: &str,
        store: &dyn ObjectStore,
        artifact: &ArtifactName,
    ) -> Result<WarehouseJob>;

    /// Set-based upsert keyed on `id`: matched rows are overwritten and get a
    /// fresh `updated_at`, unmatched rows are inserted
    async fn merge_staging(&self, staging: &str, destination: &str) -> Result<MergeResult>;

    /// Drop a table; dropping a missing table succeeds
    async fn drop_table(&self, table: &str) -> Result<WarehouseJob>;
}

/// Career entry as stored in the destination table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationCareer {
    pub race_year: Option<i64>,
    pub race_name: String,
    pub prize: Option<String>,
    pub other_details: String,
    pub horse_age: Option<i64>,
    pub race_type: Option<String>,
    pub race_count: Option<i64>,
    pub race_won_count: Option<i64>,
    pub race_prize_count: Option<i64>,
}

impl From<&CareerEntry> for DestinationCareer {
    fn from(entry: &CareerEntry) -> Self {
        Self {
            race_year: entry.race_year,
            race_name: String::new(),
            prize: entry.prize.clone(),
            other_details: String::new(),
            horse_age: entry.horse_age,
            race_type: entry.race_type.clone(),
            race_count: entry.race_count,
            race_won_count: entry.race_won_count,
            race_prize_count: entry.race_prize_count,
        }
    }
}

/// Race entry as stored in the destination table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRace {
    pub horse_order: Option<i64>,
    pub horse_final_place: Option<i64>,
    /// Stored as text, exactly as the staged JSON number reads
    pub prize_amount: Option<String>,
    pub prize_currency: Option<String>,
    pub jockey_first_name: Option<String>,
    pub jockey_last_name: Option<String>,
    pub jockey_weight: Option<f64>,
    pub track_distance: Option<f64>,
    pub temperature: Option<f64>,
    pub weather: Option<String>,
    pub race_group: Option<String>,
    pub race_subtype: Option<String>,
    pub race_category_name: Option<String>,
    pub city_name: Option<String>,
    pub track_type_name: Option<String>,
}

impl From<&RaceEntry> for DestinationRace {
    fn from(entry: &RaceEntry) -> Self {
        Self {
            horse_order: entry.horse_order,
            horse_final_place: entry.horse_final_place,
            prize_amount: entry
                .prize_amount
                .and_then(serde_json::Number::from_f64)
                .map(|n| n.to_string()),
            prize_currency: entry.prize_currency.clone(),
            jockey_first_name: entry.jockey_first_name.clone(),
            jockey_last_name: entry.jockey_last_name.clone(),
            jockey_weight: entry.jockey_weight,
            track_distance: entry.track_distance,
            temperature: entry.temperature,
            weather: entry.weather.clone(),
            race_group: entry.race_group.clone(),
            race_subtype: entry.race_subtype.clone(),
            race_category_name: entry.race_category_name.clone(),
            city_name: entry.city_name.clone(),
            track_type_name: entry.track_type_name.clone(),
        }
    }
}

/// One row of the durable table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRow {
    pub id: i64,
    pub name: Option<String>,
    pub gender: Option<String>,
    pub color: Option<String>,
    pub mother: Option<String>,
    pub mother_id: Option<i64>,
    pub father: Option<String>,
    pub father_id: Option<i64>,
    pub trainer: Option<String>,
    pub breed: Option<String>,
    pub breeder: Option<String>,
    pub owner: Option<String>,
    pub date_of_birth: Option<String>,
    pub career: Vec<DestinationCareer>,
    pub races: Vec<DestinationRace>,
    pub updated_at: DateTime<Utc>,
}

impl DestinationRow {
    pub fn project(record: &Record, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: record.id.get(),
            name: record.name.clone(),
            gender: record.gender.clone(),
            color: record.color.clone(),
            mother: record.mother.clone(),
            mother_id: record.mother_id,
            father: record.father.clone(),
            father_id: record.father_id,
            trainer: record.trainer.clone(),
            breed: record.breed.clone(),
            breeder: record.breeder.clone(),
            owner: record.owner.clone(),
            date_of_birth: record.date_of_birth.clone(),
            career: record.career.iter().map(DestinationCareer::from).collect(),
            races: record.races.iter().map(DestinationRace::from).collect(),
            updated_at,
        }
    }
}

/// Staging table name for one run: `{destination}_staging_{millis}`
pub fn staging_table_name(destination: &str, at: DateTime<Utc>) -> String {
    format!("{}_staging_{}", destination, at.timestamp_millis())
}
