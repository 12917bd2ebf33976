//! Error types for the snapshot and text pipelines.
//!
//! Errors are split by blast radius: a [`ReferenceError`] only ever affects
//! the single reference it was raised for, while a [`JobError`] aborts the
//! whole job before (or instead of) producing output.

use std::path::PathBuf;

use thiserror::Error;

/// A failure scoped to one resource reference. Never aborts a job.
#[derive(Debug, Error)]
pub enum ReferenceError {
    /// The reference could not be used at all (empty, fragment-only, unsupported scheme).
    #[error("skipped reference {value:?}: {reason}")]
    Scan {
        /// Raw attribute or `url(...)` value.
        value: String,
        /// Why the value was skipped.
        reason: String,
    },

    /// Malformed `data:` URI or an unresolvable URL.
    #[error("cannot classify {value:?}: {reason}")]
    Classification {
        /// Raw value that failed classification.
        value: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Network error or non-404 error status. Retried by the fetcher.
    #[error("transient failure fetching {url}: {reason}")]
    FetchTransient {
        /// Absolute URL that was requested.
        url: String,
        /// Status line or transport error text.
        reason: String,
    },

    /// 404, or a transient failure that ran out of retries.
    #[error("permanent failure fetching {url}: {reason}")]
    FetchPermanent {
        /// Absolute URL that was requested.
        url: String,
        /// Status line or transport error text.
        reason: String,
    },

    /// Local filesystem failure while storing a resource.
    #[error("IO error writing {path}: {source}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl ReferenceError {
    pub fn scan(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Scan {
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn classification(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Classification {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that must never be retried.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::FetchTransient { .. })
    }
}

/// A failure that aborts the whole job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid base URL {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to create directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to serialize document: {0}")]
    Serialize(#[source] std::io::Error),

    #[error("failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
