//! Paddock Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Paddock pipeline.
//!
//! # Overview
//!
//! This crate provides functionality used by every Paddock workspace member:
//!
//! - **Error Handling**: [`PaddockError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber bootstrap shared by all binaries
//! - **Types**: the [`Record`](types::Record) entity and the sortable
//!   [`ArtifactName`](types::ArtifactName) contract between stages
//!
//! # Example
//!
//! ```no_run
//! use paddock_common::types::ArtifactName;
//!
//! fn latest(keys: &[String]) -> Option<ArtifactName> {
//!     keys.iter()
//!         .filter_map(|k| ArtifactName::parse(k).ok())
//!         .max()
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{PaddockError, Result};
