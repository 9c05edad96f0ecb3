//! Remote record source
//!
//! The fetch stage only needs "give me the record for this id". A missing id
//! is a normal outcome ([`FetchOutcome::NotFound`]), not an error; every
//! [`SourceError`] is treated as transient and retried by the caller.

use async_trait::async_trait;
use paddock_common::types::Record;
use thiserror::Error;

pub mod http;

pub use http::HttpRecordSource;

/// Result of looking up one id
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(Box<Record>),
    NotFound,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Malformed payload: {0}")]
    Payload(String),
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, id: u64) -> Result<FetchOutcome, SourceError>;
}
