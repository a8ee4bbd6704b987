//! JSON run report.
//!
//! The report is the serialized [`RunSummary`]: per-page counts, skip events
//! and, for a halted run, the failed page and where to resume.

use crate::models::RunSummary;
use std::error::Error;
use std::path::Path;
use tokio::fs;
use tracing::{error, info, instrument};

/// Write `summary` as pretty-printed JSON to `path`, creating parent
/// directories as needed.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn write_report(summary: &RunSummary, path: &Path) -> Result<(), Box<dyn Error>> {
    let json = serde_json::to_string_pretty(summary)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create report dir");
            return Err(e.into());
        }
    }

    fs::write(path, json).await?;
    info!(
        pages = summary.pages.len(),
        committed = summary.total_committed(),
        "Wrote JSON run report"
    );
    Ok(())
}
