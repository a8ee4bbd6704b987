//! Error taxonomy for the ingestion pipeline.
//!
//! Errors are split by the scope they are fatal to:
//!
//! | Error | Scope | Handling |
//! |-------|-------|----------|
//! | [`FetchError`] | one entrant | retried while transient, then recorded as a skip |
//! | [`ExtractionError`] | one entrant | recorded as a failed entrant, page continues |
//! | [`ListingError`] | one page | page goes to `Failed`, run halts |
//! | [`StoreError`] | one page | transaction rolled back, run halts |
//! | [`SchemaError`] | startup | run never starts |

use thiserror::Error;

use crate::schema::Field;

/// Failure to retrieve a single document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("{url} answered with HTTP {code}")]
    Status { url: String, code: u16 },

    #[error("failed reading body of {url}: {reason}")]
    Body { url: String, reason: String },

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Connect { .. } | FetchError::Body { .. } => {
                true
            }
            FetchError::Status { code, .. } => *code == 429 || *code >= 500,
            FetchError::InvalidUrl { .. } => false,
        }
    }

    pub(crate) fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        let url = url.to_string();
        if e.is_timeout() {
            FetchError::Timeout { url }
        } else if let Some(status) = e.status() {
            FetchError::Status {
                url,
                code: status.as_u16(),
            }
        } else if e.is_connect() || e.is_request() {
            FetchError::Connect {
                url,
                reason: e.to_string(),
            }
        } else if e.is_builder() {
            FetchError::InvalidUrl {
                url,
                reason: e.to_string(),
            }
        } else {
            FetchError::Body {
                url,
                reason: e.to_string(),
            }
        }
    }
}

/// A listing page could not be turned into detail references.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("listing page {page} could not be fetched: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: FetchError,
    },

    #[error("listing page {page} has unexpected structure: {reason}")]
    Parse { page: u32, reason: String },
}

/// A detail document could not be turned into a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("required field '{field}' is missing")]
    MissingField { field: Field },

    #[error("label '{label}' matched {count} times and the schema does not say which to use")]
    AmbiguousMatch { label: String, count: usize },
}

/// Failure inside the record/checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("'{0}' is not a valid table or column name")]
    InvalidIdentifier(String),

    #[error("bib '{bib}' still collides after {attempts} key mutations")]
    CollisionExhausted { bib: String, attempts: usize },

    #[error("store file operation failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure loading or validating an extraction schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed reading schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed parsing schema YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid schema: {0}")]
    Invalid(String),

    #[error("unknown edition '{0}'")]
    UnknownEdition(String),
}

/// Page-level and run-level failures surfaced by the ingestor.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed building HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("page {page} failed ({cause}); resume from page {resume_from}")]
    PageFailed {
        page: u32,
        resume_from: u32,
        cause: PageFailure,
    },
}

/// Why a page reached the `Failed` state.
#[derive(Debug, Error)]
pub enum PageFailure {
    #[error("{0}")]
    Listing(#[from] ListingError),

    #[error("commit failed: {0}")]
    Commit(#[from] StoreError),
}
