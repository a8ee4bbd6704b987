//! Page-at-a-time ingestion with resumable checkpoints.
//!
//! Each listing page walks this state machine:
//!
//! ```text
//! Pending -> Enumerating -> Fetching -> Extracting -> Committing -> Committed
//!                 |             |            |             |
//!                 +-------------+------------+-------------+----> Failed
//! ```
//!
//! An empty listing goes from `Enumerating` straight to `Committing`.
//! Entrant-level problems (a detail page that cannot be fetched or
//! extracted) become skip events and never fail the page. A page fails only
//! when its listing cannot be enumerated or its transaction cannot commit;
//! then nothing from that page is persisted, the checkpoint stays where it
//! was and the run stops.
//!
//! Pages run strictly one after another, since the checkpoint is a single
//! "last committed page" number.

use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::{IngestError, PageFailure, StoreError};
use crate::fetcher::ConcurrentFetcher;
use crate::models::{PageReport, RunSummary, SkipEvent, SkipKind, WriteBatch};
use crate::schema::ExtractionSchema;
use crate::scrapers::detail;
use crate::scrapers::listing::ListingEnumerator;
use crate::source::PageSource;
use crate::store::Store;
use crate::utils::truncate_for_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Pending,
    Enumerating,
    Fetching,
    Extracting,
    Committing,
    Committed,
    Failed,
}

impl PageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PageState::Committed | PageState::Failed)
    }

    pub fn can_advance_to(self, next: PageState) -> bool {
        use PageState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Pending, Enumerating)
            | (Enumerating, Fetching)
            | (Enumerating, Committing)
            | (Fetching, Extracting)
            | (Extracting, Committing)
            | (Committing, Committed) => true,
            _ => false,
        }
    }
}

/// Tracks one page through its states.
#[derive(Debug)]
struct PageProgress {
    page: u32,
    state: PageState,
}

impl PageProgress {
    fn new(page: u32) -> Self {
        Self {
            page,
            state: PageState::Pending,
        }
    }

    fn advance(&mut self, next: PageState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal page transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(page = self.page, from = ?self.state, to = ?next, "Page state transition");
        self.state = next;
    }
}

/// Result of [`PageIngestor::run`]: what got done, and what stopped the run.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub failure: Option<IngestError>,
}

impl RunOutcome {
    pub fn into_result(self) -> Result<RunSummary, IngestError> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.summary),
        }
    }
}

/// Drives listing pages through enumeration, fetching, extraction and
/// commit. The only writer to the [`Store`] it is given.
pub struct PageIngestor<'a, S> {
    schema: &'a ExtractionSchema,
    table: String,
    enumerator: ListingEnumerator<'a, S>,
    fetcher: ConcurrentFetcher<'a, S>,
    store: &'a mut Store,
}

impl<'a, S> PageIngestor<'a, S>
where
    S: PageSource,
{
    /// Prepare ingestion into `table`, creating it if needed.
    pub fn new(
        schema: &'a ExtractionSchema,
        source: &'a S,
        store: &'a mut Store,
        table: &str,
        workers: usize,
    ) -> Result<Self, IngestError> {
        store.ensure_table(schema, table)?;
        Ok(Self {
            schema,
            table: table.to_string(),
            enumerator: ListingEnumerator::new(source, schema)?,
            fetcher: ConcurrentFetcher::new(source, workers),
            store,
        })
    }

    /// First page a run starting no earlier than `start` should process.
    pub fn resume_page(&self, start: u32) -> Result<u32, StoreError> {
        let next = self
            .store
            .last_committed_page(&self.table)?
            .map_or(start, |page| page + 1);
        Ok(next.max(start))
    }

    /// Ingest pages from the checkpoint (or `start`, whichever is later)
    /// through `end`, stopping at the first failed page.
    #[instrument(level = "info", skip(self), fields(table = %self.table, edition = %self.schema.edition))]
    pub async fn run(&mut self, start: u32, end: u32) -> RunOutcome {
        let first = match self.resume_page(start) {
            Ok(first) => first,
            Err(e) => {
                let mut summary = RunSummary::new(&self.schema.edition, &self.table, start, end);
                summary.error = Some(e.to_string());
                return RunOutcome {
                    summary,
                    failure: Some(e.into()),
                };
            }
        };
        let mut summary = RunSummary::new(&self.schema.edition, &self.table, first, end);

        if first > end {
            info!(first, end, "Checkpoint is past the requested range; nothing to do");
            return RunOutcome {
                summary,
                failure: None,
            };
        }
        info!(first, end, workers = self.fetcher.workers(), "Starting ingestion run");

        for page in first..=end {
            match self.ingest_page(page).await {
                Ok(report) => summary.pages.push(report),
                Err(cause) => {
                    let resume_from = self.resume_page(start).unwrap_or(page);
                    error!(page, resume_from, error = %cause, "Page failed; halting run");
                    summary.failed_page = Some(page);
                    summary.resume_from = Some(resume_from);
                    summary.error = Some(cause.to_string());
                    return RunOutcome {
                        summary,
                        failure: Some(IngestError::PageFailed {
                            page,
                            resume_from,
                            cause,
                        }),
                    };
                }
            }
        }

        let stored = self.store.row_count(&self.table).ok();
        info!(
            pages = summary.pages.len(),
            committed = summary.total_committed(),
            stored = ?stored,
            skipped = summary.total_skipped(),
            failed = summary.total_failed(),
            "Ingestion run complete"
        );
        RunOutcome {
            summary,
            failure: None,
        }
    }

    /// Take one page from `Pending` to `Committed`, or to `Failed`.
    #[instrument(level = "info", skip(self))]
    pub async fn ingest_page(&mut self, page: u32) -> Result<PageReport, PageFailure> {
        let t0 = Instant::now();
        let mut progress = PageProgress::new(page);
        let mut report = PageReport {
            page,
            ..Default::default()
        };
        let mut batch = WriteBatch::new(page);

        progress.advance(PageState::Enumerating);
        let refs = match self.enumerator.enumerate(page).await {
            Ok(refs) => refs,
            Err(e) => {
                progress.advance(PageState::Failed);
                return Err(e.into());
            }
        };

        if !refs.is_empty() {
            progress.advance(PageState::Fetching);
            let fetched = self.fetcher.fetch_all(&refs).await;

            progress.advance(PageState::Extracting);
            for (reference, outcome) in fetched {
                let doc = match outcome {
                    Ok(doc) => doc,
                    Err(e) => {
                        report.skipped += 1;
                        report.skips.push(SkipEvent {
                            kind: SkipKind::Fetch,
                            position: reference.position,
                            url: reference.url,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                match detail::extract(&doc, self.schema) {
                    Ok(record) => batch.push(record),
                    Err(e) => {
                        warn!(
                            page,
                            position = reference.position,
                            url = %reference.url,
                            error = %e,
                            body_preview = %truncate_for_log(&doc.body, 200),
                            "Extraction failed; entrant skipped"
                        );
                        report.failed += 1;
                        report.skips.push(SkipEvent {
                            kind: SkipKind::Extraction,
                            position: reference.position,
                            url: reference.url,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        progress.advance(PageState::Committing);
        let summary = match self.store.commit_page(self.schema, &self.table, &batch) {
            Ok(summary) => summary,
            Err(e) => {
                progress.advance(PageState::Failed);
                return Err(e.into());
            }
        };
        progress.advance(PageState::Committed);

        report.committed = summary.inserted;
        report.unchanged = summary.unchanged;
        report.rekeyed = summary.rekeyed;
        report.elapsed_ms = t0.elapsed().as_millis() as u64;
        info!(
            page,
            entrants = refs.len(),
            extracted = batch.len(),
            committed = report.committed,
            unchanged = report.unchanged,
            rekeyed = report.rekeyed,
            skipped = report.skipped,
            failed = report.failed,
            elapsed_secs = t0.elapsed().as_secs_f64(),
            "Page committed"
        );
        Ok(report)
    }
}
