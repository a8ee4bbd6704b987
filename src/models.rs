//! Data models flowing through the ingestion pipeline.
//!
//! - [`DetailReference`]: a link to one entrant's detail page, found on a listing page
//! - [`RawDocument`]: the fetched body of a detail page
//! - [`EntrantRecord`]: the normalized per-entrant output row
//! - [`WriteBatch`]: the records of one listing page, committed together
//! - [`PageReport`] / [`RunSummary`]: what a run did, per page

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Country value stored when a name carries no parenthetical country code.
pub const COUNTRY_SENTINEL: &str = "None";

/// A reference to one entrant's detail page.
///
/// Ordering is by `position` first, which keeps batches in listing order no
/// matter in which order the fetches completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetailReference {
    /// Index within the (deduplicated) listing page. Diagnostics only.
    pub position: usize,
    /// The `href` exactly as it appeared on the anchor.
    pub href: String,
    /// `href` resolved against the edition's detail base URL.
    pub url: String,
}

/// A fetched detail page. Only the detail extractor looks inside `body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub url: String,
    pub body: String,
}

/// Split time and differential recorded at one distance marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub marker: String,
    pub time: Option<String>,
    pub diff: Option<String>,
}

impl Split {
    pub fn empty(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
            time: None,
            diff: None,
        }
    }
}

/// One entrant's result.
///
/// Every field the schema maps is present, either with a value or as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrantRecord {
    pub bib_id: String,
    pub name: Option<String>,
    pub country: String,
    pub club: Option<String>,
    pub category: Option<String>,
    pub gender: String,
    pub elite: bool,
    pub place_gender: Option<i64>,
    pub place_category: Option<i64>,
    pub place_overall: Option<i64>,
    /// One entry per schema marker, in schema order.
    pub splits: Vec<Split>,
    pub edition: String,
    pub year: i32,
    pub source_url: String,
}

impl EntrantRecord {
    pub fn split(&self, marker: &str) -> Option<&Split> {
        self.splits.iter().find(|s| s.marker == marker)
    }

    /// Equal in every column except the key.
    pub fn same_entrant(&self, other: &EntrantRecord) -> bool {
        self.name == other.name
            && self.country == other.country
            && self.club == other.club
            && self.category == other.category
            && self.gender == other.gender
            && self.elite == other.elite
            && self.place_gender == other.place_gender
            && self.place_category == other.place_category
            && self.place_overall == other.place_overall
            && self.splits == other.splits
            && self.edition == other.edition
            && self.year == other.year
            && self.source_url == other.source_url
    }
}

/// Records extracted from one listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub page: u32,
    pub records: Vec<EntrantRecord>,
}

impl WriteBatch {
    pub fn new(page: u32) -> Self {
        Self {
            page,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: EntrantRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    /// The detail page could not be fetched.
    Fetch,
    /// The detail page was fetched but no record could be extracted.
    Extraction,
}

/// An entrant left out of a page's batch, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipEvent {
    pub kind: SkipKind,
    pub position: usize,
    pub url: String,
    pub reason: String,
}

/// Outcome of one committed page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageReport {
    pub page: u32,
    /// Rows written by this page's transaction.
    pub committed: usize,
    /// Records already stored by an earlier run, left untouched.
    pub unchanged: usize,
    /// Committed rows whose bib had to be mutated to avoid a collision.
    pub rekeyed: usize,
    /// Entrants whose detail page could not be fetched.
    pub skipped: usize,
    /// Entrants whose detail page could not be extracted.
    pub failed: usize,
    pub skips: Vec<SkipEvent>,
    pub elapsed_ms: u64,
}

/// Everything one invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub edition: String,
    pub table: String,
    pub started_at: DateTime<Utc>,
    pub first_page: u32,
    pub last_page: u32,
    pub pages: Vec<PageReport>,
    /// Set when a page reached `Failed`.
    pub failed_page: Option<u32>,
    pub resume_from: Option<u32>,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(edition: &str, table: &str, first_page: u32, last_page: u32) -> Self {
        Self {
            edition: edition.to_string(),
            table: table.to_string(),
            started_at: Utc::now(),
            first_page,
            last_page,
            pages: Vec::new(),
            failed_page: None,
            resume_from: None,
            error: None,
        }
    }

    pub fn total_committed(&self) -> usize {
        self.pages.iter().map(|p| p.committed).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.pages.iter().map(|p| p.skipped).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.pages.iter().map(|p| p.failed).sum()
    }
}
