//! Domain types shared by every pipeline stage

pub mod artifact;
pub mod record;

pub use artifact::{ArtifactKind, ArtifactName, CLEANED_MARKER, DATASET_STEM, MASTER_MARKER};
pub use record::{CareerEntry, KeyedDocument, RaceEntry, Record, RecordKey};
