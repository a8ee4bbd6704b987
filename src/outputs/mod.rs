//! Run artifacts written next to the database.
//!
//! - [`json`]: the [`RunSummary`](crate::models::RunSummary) as a JSON report

pub mod json;
