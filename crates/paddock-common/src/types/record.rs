//! Record entity and its unique key

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{PaddockError, Result};

/// Unique record key. Always a positive integer; `0`, negatives, empty
/// strings and `null` are rejected at parse time so a keyless record can
/// never be built.
///
/// Integral floats (`1.0`) and numeric strings (`"1"`) are read as the
/// integer they spell, so `1`, `1.0` and `"1"` are one key. Fractional
/// numbers and non-numeric strings are not keys: the destination table keys
/// rows on a `BIGINT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordKey(i64);

impl RecordKey {
    pub fn new(value: i64) -> Result<Self> {
        if value <= 0 {
            return Err(PaddockError::InvalidRecord(format!(
                "record key must be positive, got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for RecordKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Upstream payloads carry ids as numbers, occasionally as numeric strings.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawKey {
            Int(i64),
            Float(f64),
            Text(String),
        }

        let value = match RawKey::deserialize(deserializer)? {
            RawKey::Int(v) => v,
            RawKey::Float(v) => {
                if v.fract() != 0.0 || !(i64::MIN as f64..i64::MAX as f64).contains(&v) {
                    return Err(serde::de::Error::custom(format!(
                        "invalid record key {}",
                        v
                    )));
                }
                v as i64
            }
            RawKey::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| serde::de::Error::custom(format!("invalid record key {:?}", s)))?,
        };

        RecordKey::new(value).map_err(serde::de::Error::custom)
    }
}

/// A serialized record reduced to what the clean stage needs: the key plus
/// every other field, untouched.
///
/// Re-serializing a `KeyedDocument` is canonical: `id` first, the remaining
/// fields in sorted order, compact JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedDocument {
    pub id: RecordKey,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl KeyedDocument {
    pub fn parse_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn to_canonical_line(&self) -> Result<String> {
        // Sort explicitly; serde_json's Map keeps insertion order under `preserve_order`.
        #[derive(Serialize)]
        struct Canonical<'a> {
            id: RecordKey,
            #[serde(flatten)]
            fields: BTreeMap<&'a String, &'a Value>,
        }

        Ok(serde_json::to_string(&Canonical {
            id: self.id,
            fields: self.fields.iter().collect(),
        })?)
    }
}

/// One fetched entity with its two ordered sub-collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordKey,
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
    #[serde(default)]
    pub career: Vec<CareerEntry>,
    #[serde(default)]
    pub races: Vec<RaceEntry>,
}

impl Record {
    /// A record carrying only its key
    pub fn bare(id: RecordKey) -> Self {
        Self {
            id,
            name: None,
            gender: None,
            color: None,
            mother: None,
            mother_id: None,
            father: None,
            father_id: None,
            trainer: None,
            breed: None,
            breeder: None,
            owner: None,
            date_of_birth: None,
            career: Vec::new(),
            races: Vec::new(),
        }
    }
}

/// Per-season career summary, as emitted by the fetch stage
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CareerEntry {
    pub race_year: Option<i64>,
    pub prize: Option<String>,
    pub horse_age: Option<i64>,
    pub race_type: Option<String>,
    pub race_count: Option<i64>,
    pub race_won_count: Option<i64>,
    pub race_prize_count: Option<i64>,
}

/// One race start, flattened from the nested upstream shape
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceEntry {
    pub horse_order: Option<i64>,
    pub horse_final_place: Option<i64>,
    pub prize_amount: Option<f64>,
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
