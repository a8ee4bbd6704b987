//! Command-line interface definitions for race_harvest.
//!
//! Every option can also come from an environment variable, so scheduled
//! runs can be configured without editing the command line.

use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::fetcher::DEFAULT_WORKERS;
use crate::source::FetchPolicy;

/// Command-line arguments for a harvesting run.
///
/// # Examples
///
/// ```sh
/// # Bundled edition, default database
/// race_harvest --edition london-2013-mass-men
///
/// # Custom schema, first five pages only, JSON run report
/// race_harvest --schema ./berlin.yaml --end-page 5 --report-json ./reports/run.json
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(group(ArgGroup::new("source").required(true).args(["edition", "schema"])))]
pub struct Cli {
    /// Name of a bundled edition schema (e.g. london-2013-mass-men)
    #[arg(short, long, env = "RACE_HARVEST_EDITION")]
    pub edition: Option<String>,

    /// Path to an edition schema YAML file
    #[arg(short, long, env = "RACE_HARVEST_SCHEMA")]
    pub schema: Option<PathBuf>,

    /// SQLite database file
    #[arg(short, long, env = "RACE_HARVEST_DATABASE", default_value = "race_results.db")]
    pub database: PathBuf,

    /// Record table to write into (defaults to the schema's table)
    #[arg(short, long, env = "RACE_HARVEST_TABLE")]
    pub table: Option<String>,

    /// First listing page to consider; pages at or below the checkpoint are skipped
    #[arg(long, env = "RACE_HARVEST_START_PAGE", default_value_t = 1)]
    pub start_page: u32,

    /// Last listing page to ingest (defaults to the schema's page_count)
    #[arg(long, env = "RACE_HARVEST_END_PAGE")]
    pub end_page: Option<u32>,

    /// Concurrent detail-page fetches per listing page
    #[arg(short, long, env = "RACE_HARVEST_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "RACE_HARVEST_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Retries for transient fetch failures
    #[arg(long, env = "RACE_HARVEST_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: usize,

    /// Base backoff delay in milliseconds, doubled per retry
    #[arg(long, env = "RACE_HARVEST_RETRY_BASE_MS", default_value_t = 500)]
    pub retry_base_ms: u64,

    /// Write a JSON run report to this path
    #[arg(long, env = "RACE_HARVEST_REPORT_JSON")]
    pub report_json: Option<PathBuf>,
}

impl Cli {
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            ..FetchPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_defaults() {
        let cli = Cli::parse_from(["race_harvest", "--edition", "london-2013-mass-men"]);

        assert_eq!(cli.edition.as_deref(), Some("london-2013-mass-men"));
        assert_eq!(cli.database, PathBuf::from("race_results.db"));
        assert_eq!(cli.start_page, 1);
        assert_eq!(cli.end_page, None);
        assert_eq!(cli.workers, 4);
        assert!(cli.report_json.is_none());
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from([
            "race_harvest",
            "-s",
            "/tmp/berlin.yaml",
            "-d",
            "/tmp/out.db",
            "-t",
            "berlin",
            "-w",
            "8",
        ]);

        assert_eq!(cli.schema, Some(PathBuf::from("/tmp/berlin.yaml")));
        assert_eq!(cli.database, PathBuf::from("/tmp/out.db"));
        assert_eq!(cli.table.as_deref(), Some("berlin"));
        assert_eq!(cli.workers, 8);
    }

    #[test]
    fn test_cli_requires_exactly_one_schema_source() {
        assert!(Cli::try_parse_from(["race_harvest"]).is_err());
        assert!(
            Cli::try_parse_from(["race_harvest", "-e", "x", "-s", "y.yaml"]).is_err()
        );
    }

    #[test]
    fn test_fetch_policy_from_flags() {
        let cli = Cli::parse_from([
            "race_harvest",
            "-e",
            "london-2013-mass-women",
            "--timeout-secs",
            "5",
            "--max-retries",
            "7",
            "--retry-base-ms",
            "250",
        ]);
        let policy = cli.fetch_policy();
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_jitter, FetchPolicy::default().max_jitter);
    }
}
