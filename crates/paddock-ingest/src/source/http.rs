use async_trait::async_trait;
use paddock_common::types::{CareerEntry, RaceEntry, Record, RecordKey};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{FetchOutcome, RecordSource, SourceError};

/// Registry client: one base lookup plus the career and races collections
#[derive(Clone)]
pub struct HttpRecordSource {
    client: Client,
    base_url: String,
}

impl HttpRecordSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("paddock-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `Ok(None)` on 404
    async fn get_json(&self, url: &str) -> Result<Option<Value>, SourceError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(Some(response.json::<Value>().await?))
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn fetch(&self, id: u64) -> Result<FetchOutcome, SourceError> {
        let key = i64::try_from(id)
            .ok()
            .and_then(|v| RecordKey::new(v).ok())
            .ok_or_else(|| SourceError::Payload(format!("id {} is not a valid key", id)))?;

        let base_url = format!("{}/{}", self.base_url, id);
        let Some(horse) = self.get_json(&base_url).await? else {
            return Ok(FetchOutcome::NotFound);
        };
        let Some(career) = self.get_json(&format!("{}/career", base_url)).await? else {
            return Ok(FetchOutcome::NotFound);
        };
        let Some(races) = self.get_json(&format!("{}/races", base_url)).await? else {
            return Ok(FetchOutcome::NotFound);
        };

        let record = normalize_record(
            key,
            &horse,
            career.get("data").unwrap_or(&Value::Null),
            &races,
        );
        debug!(id, name = ?record.name, "Fetched record");

        Ok(FetchOutcome::Found(Box::new(record)))
    }
}

/// Build a [`Record`] from the three raw payloads
pub fn normalize_record(key: RecordKey, horse: &Value, career: &Value, races: &Value) -> Record {
    Record {
        id: key,
        name: text(horse.get("name")),
        gender: text(horse.get("sex")),
        color: text(horse.pointer("/color/polishName")),
        mother: text(horse.pointer("/mother/name")),
        mother_id: int(horse.pointer("/mother/id")),
        father: text(horse.pointer("/father/name")),
        father_id: int(horse.pointer("/father/id")),
        trainer: text(horse.pointer("/trainer/lastName")),
        breed: text(horse.get("breed")),
        breeder: text(horse.pointer("/breeders/0/name")),
        owner: text(horse.pointer("/raceOwners/0/name")),
        date_of_birth: text(horse.get("dateOfBirth")),
        career: normalize_career(career),
        races: normalize_races(races),
    }
}

/// Entries without a `raceYear` are continuation rows: their prize is folded
/// into the previous dated entry as `"{prev} + {prize}"` and the row dropped.
pub fn normalize_career(raw: &Value) -> Vec<CareerEntry> {
    let Some(rows) = raw.as_array() else {
        warn!(payload = %raw, "Career data is not an array");
        return Vec::new();
    };

    let mut merged: Vec<CareerEntry> = Vec::with_capacity(rows.len());
    for row in rows {
        match int(row.get("raceYear")) {
            Some(year) => merged.push(CareerEntry {
                race_year: Some(year),
                prize: text(row.get("prize")),
                horse_age: int(row.get("horseAge")),
                race_type: text(row.get("raceType")),
                race_count: int(row.get("raceCount")),
                race_won_count: int(row.get("raceWonCount")),
                race_prize_count: int(row.get("racePrizeCount")),
            }),
            None => {
                if let (Some(last), Some(extra)) = (merged.last_mut(), text(row.get("prize"))) {
                    last.prize = Some(match last.prize.take() {
                        Some(prev) => format!("{} + {}", prev, extra),
                        None => extra,
                    });
                }
            }
        }
    }
    merged
}

pub fn normalize_races(raw: &Value) -> Vec<RaceEntry> {
    let Some(rows) = raw.as_array() else {
        warn!(payload = %raw, "Races data is not an array");
        return Vec::new();
    };

    rows.iter()
        .map(|r| RaceEntry {
            horse_order: int(r.get("order")),
            horse_final_place: int(r.get("place")),
            prize_amount: float(r.get("prize")),
            prize_currency: text(r.pointer("/race/currency/code")),
            jockey_first_name: text(r.pointer("/jockey/firstName")),
            jockey_last_name: text(r.pointer("/jockey/lastName")),
            jockey_weight: float(r.get("jockeyWeight")),
            track_distance: float(r.pointer("/race/trackDistance")),
            temperature: float(r.pointer("/race/temperature")),
            weather: text(r.pointer("/race/weather")),
            race_group: text(r.pointer("/race/group")),
            race_subtype: text(r.pointer("/race/subType")),
            race_category_name: text(r.pointer("/race/category/name")),
            city_name: text(r.pointer("/race/city/name")),
            track_type_name: text(r.pointer("/race/trackType/name")),
        })
        .collect()
}

/// Non-empty string, or a number rendered as one
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
