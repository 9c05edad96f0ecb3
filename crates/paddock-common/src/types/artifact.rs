//! Sortable artifact names
//!
//! Stages hand work to each other only through object-storage keys, so the
//! names below are a wire contract. Every timestamp embedded in a name is
//! fixed-width and zero-padded, which makes byte-wise ordering of the keys
//! equal to chronological ordering. [`ArtifactName`] orders by the raw key and
//! nothing else; code that needs "latest" or "in merge order" sorts these
//! values instead of comparing strings ad hoc.
//!
//! | Kind    | File name                                                       |
//! |---------|-----------------------------------------------------------------|
//! | shard   | `horse_data_{start}_to_{end}_{millis:013}.ndjson`               |
//! | master  | `master_horse_data_{YYYY-MM-DD_HH:MM:SS}.ndjson`                |
//! | cleaned | `{source stem}_cleaned_deduped_{YYYY-MM-DDTHH_MM_SS_mmmZ}.ndjson` |

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::sync::OnceLock;

use crate::error::{PaddockError, Result};

/// Dataset stem shared by shard and master names
pub const DATASET_STEM: &str = "horse_data";

/// Marker that opens every master file name
pub const MASTER_MARKER: &str = "master_";

/// Marker embedded in every cleaned file name
pub const CLEANED_MARKER: &str = "_cleaned_deduped_";

const EXTENSION: &str = ".ndjson";

fn shard_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^horse_data_(\d+)_to_(\d+)_.*\.ndjson$").unwrap()
    })
}

/// What a key refers to, recovered from its file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Output of one fetch batch; ids are inclusive
    Shard { start_id: u64, end_id: u64 },
    Master,
    Cleaned,
    /// Any other object under the namespace
    Other,
}

/// A full object key (namespace prefix included) plus its parsed kind
#[derive(Debug, Clone)]
pub struct ArtifactName {
    key: String,
    kind: ArtifactKind,
}

impl ArtifactName {
    /// Classify an existing object key
    pub fn parse(key: &str) -> Result<Self> {
        let file_name = key.rsplit('/').next().unwrap_or_default();
        if file_name.is_empty() {
            return Err(PaddockError::InvalidArtifactName(format!(
                "{:?} does not name an object",
                key
            )));
        }

        let kind = if file_name.contains(CLEANED_MARKER) && file_name.ends_with(EXTENSION) {
            ArtifactKind::Cleaned
        } else if let Some(caps) = shard_pattern().captures(file_name) {
            match (caps[1].parse(), caps[2].parse()) {
                (Ok(start_id), Ok(end_id)) => ArtifactKind::Shard { start_id, end_id },
                _ => ArtifactKind::Other,
            }
        } else if file_name.starts_with(MASTER_MARKER) && file_name.ends_with(EXTENSION) {
            ArtifactKind::Master
        } else {
            ArtifactKind::Other
        };

        Ok(Self {
            key: key.to_string(),
            kind,
        })
    }

    /// Name for the shard covering `[start_id, start_id + batch_size)`
    pub fn shard(prefix: &str, start_id: u64, batch_size: u64, at: DateTime<Utc>) -> Self {
        let end_id = start_id + batch_size.saturating_sub(1);
        Self {
            key: format!(
                "{}{}_{}_to_{}_{:013}{}",
                prefix,
                DATASET_STEM,
                start_id,
                end_id,
                at.timestamp_millis().max(0),
                EXTENSION
            ),
            kind: ArtifactKind::Shard { start_id, end_id },
        }
    }

    pub fn master(prefix: &str, at: DateTime<Utc>) -> Self {
        Self {
            key: format!(
                "{}{}{}_{}{}",
                prefix,
                MASTER_MARKER,
                DATASET_STEM,
                at.format("%Y-%m-%d_%H:%M:%S"),
                EXTENSION
            ),
            kind: ArtifactKind::Master,
        }
    }

    /// Cleaned output for `self`, placed next to it
    pub fn cleaned(&self, at: DateTime<Utc>) -> Self {
        let stem = self
            .file_name()
            .strip_suffix(EXTENSION)
            .unwrap_or_else(|| self.file_name());
        Self {
            key: format!(
                "{}{}{}{}{}",
                self.dir(),
                stem,
                CLEANED_MARKER,
                at.format("%Y-%m-%dT%H_%M_%S_%3fZ"),
                EXTENSION
            ),
            kind: ArtifactKind::Cleaned,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn is_shard(&self) -> bool {
        matches!(self.kind, ArtifactKind::Shard { .. })
    }

    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Everything up to and including the last `/`
    pub fn dir(&self) -> &str {
        match self.key.rfind('/') {
            Some(idx) => &self.key[..=idx],
            None => "",
        }
    }
}

impl PartialEq for ArtifactName {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ArtifactName {}

impl PartialOrd for ArtifactName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArtifactName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.as_bytes().cmp(other.key.as_bytes())
    }
}

impl std::fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl Serialize for ArtifactName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key)
    }
}
