//! HTML scraping for the two page kinds of a results site.
//!
//! Ingestion follows a two-phase pattern:
//!
//! 1. **Enumeration** ([`listing`]): turn a listing page into detail references
//! 2. **Extraction** ([`detail`]): turn a fetched detail page into a record
//!
//! Both phases are pure transformations over HTML driven by the edition's
//! [`ExtractionSchema`](crate::schema::ExtractionSchema); only enumeration
//! touches the network, to fetch the listing page itself.

pub mod detail;
pub mod listing;
