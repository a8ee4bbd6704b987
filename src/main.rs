//! # race_harvest
//!
//! Harvests per-entrant race results from a paginated results website into
//! a SQLite table, one listing page at a time, with a resumable checkpoint.
//!
//! ## Usage
//!
//! ```sh
//! race_harvest --edition london-2013-mass-men --database race_results.db
//! ```
//!
//! ## Architecture
//!
//! The pipeline runs once per listing page:
//! 1. **Enumerating**: fetch the listing page and collect detail references
//! 2. **Fetching**: download every detail page with bounded concurrency
//! 3. **Extracting**: turn each detail page into a record using the edition schema
//! 4. **Committing**: write the page's records and advance the checkpoint in
//!    one SQLite transaction
//!
//! A page that fails to enumerate or commit halts the run; the next run
//! resumes after the last committed page.

use clap::Parser;
use std::error::Error;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod errors;
mod fetcher;
mod ingest;
mod models;
mod outputs;
mod schema;
mod scrapers;
mod source;
mod store;
mod utils;

use cli::Cli;
use errors::IngestError;
use ingest::PageIngestor;
use outputs::json;
use schema::ExtractionSchema;
use source::{HttpSource, RetrySource};
use store::Store;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("race_harvest starting up");

    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    // ---- Schema ----
    let schema = match (&args.schema, &args.edition) {
        (Some(path), _) => ExtractionSchema::from_path(path)?,
        (None, Some(edition)) => ExtractionSchema::bundled(edition)?,
        (None, None) => return Err("either --edition or --schema is required".into()),
    };
    let table = args.table.clone().unwrap_or_else(|| schema.table.clone());
    let end_page = args.end_page.unwrap_or(schema.listing.page_count);
    info!(
        edition = %schema.edition,
        year = schema.year,
        %table,
        markers = schema.markers.len(),
        "Loaded extraction schema"
    );

    // ---- Source & store ----
    let policy = args.fetch_policy();
    let http = HttpSource::new(&policy).map_err(IngestError::Client)?;
    let source = RetrySource::new(http, policy);
    let mut store = Store::open(&args.database)?;

    // ---- Ingest ----
    let outcome = PageIngestor::new(&schema, &source, &mut store, &table, args.workers)?
        .run(args.start_page, end_page)
        .await;

    if let Some(path) = &args.report_json {
        if let Err(e) = json::write_report(&outcome.summary, path).await {
            error!(path = %path.display(), error = %e, "Failed to write run report");
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    outcome.into_result()?;
    Ok(())
}
