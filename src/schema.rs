//! Versioned extraction schemas.
//!
//! A schema describes one edition of the results site: where the listing
//! pages live, how anchors to detail pages are picked out, and which header
//! labels on a detail page map onto which record fields. Adding an edition
//! means writing a YAML file, not code.
//!
//! Two editions ship inside the binary (see [`BUNDLED_EDITIONS`]); any other
//! file can be loaded with [`ExtractionSchema::from_path`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use tracing::{debug, instrument};
use url::Url;

use crate::errors::SchemaError;
use crate::store::checkpoint::CHECKPOINT_TABLE;

/// Editions compiled into the binary, by identifier.
pub const BUNDLED_EDITIONS: &[(&str, &str)] = &[
    (
        "london-2013-mass-men",
        include_str!("../schemas/london_2013_mass_men.yaml"),
    ),
    (
        "london-2013-mass-women",
        include_str!("../schemas/london_2013_mass_women.yaml"),
    ),
];

static SQL_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static MARKER_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Whether `s` can be spliced into SQL as a bare identifier.
pub fn is_sql_identifier(s: &str) -> bool {
    SQL_IDENT.is_match(s)
}

/// Semantic record fields a scalar label can map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Club,
    Category,
    Bib,
    PlaceGender,
    PlaceCategory,
    PlaceOverall,
    Gender,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Club => "club",
            Field::Category => "category",
            Field::Bib => "bib",
            Field::PlaceGender => "place_gender",
            Field::PlaceCategory => "place_category",
            Field::PlaceOverall => "place_overall",
            Field::Gender => "gender",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a label still matches more than once after skipping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Duplicates {
    /// Report an ambiguous match.
    #[default]
    Error,
    /// Use the first remaining occurrence.
    First,
}

/// How the listing page renders its anchors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupRule {
    /// Every anchor is a distinct entrant.
    None,
    /// Each entrant is rendered as two alternating anchors; keep the first of each pair.
    Alternate,
    /// Collapse runs of adjacent anchors pointing at the same href.
    #[default]
    AdjacentHref,
}

/// One scalar field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: Field,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    /// Leading occurrences of the label that are known to be spurious.
    #[serde(default)]
    pub skip: usize,
    #[serde(default)]
    pub duplicates: Duplicates,
}

/// One distance marker. The marker's `th` is followed by `td` siblings; the
/// split time and diff are read from the cells at `time_cell` and `diff_cell`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRule {
    pub marker: String,
    pub label: String,
    #[serde(default = "default_time_cell")]
    pub time_cell: usize,
    #[serde(default = "default_diff_cell")]
    pub diff_cell: usize,
    #[serde(default)]
    pub skip: usize,
    #[serde(default)]
    pub duplicates: Duplicates,
}

impl MarkerRule {
    pub fn time_column(&self) -> String {
        format!("split_{}", self.marker)
    }

    pub fn diff_column(&self) -> String {
        format!("split_{}_diff", self.marker)
    }
}

fn default_time_cell() -> usize {
    1
}

fn default_diff_cell() -> usize {
    2
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_gender() -> String {
    "M".to_string()
}

fn default_collision_suffix() -> String {
    "999999".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSchema {
    pub base_url: String,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    /// Filter parameters appended after the page parameter, in order.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    pub anchor_selector: String,
    #[serde(default)]
    pub dedup: DedupRule,
    /// Treat a page without matching anchors as a valid empty page.
    #[serde(default)]
    pub allow_empty: bool,
    pub page_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSchema {
    pub base_url: String,
}

/// Constants filled into every record of this edition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFields {
    #[serde(default = "default_gender")]
    pub gender: String,
    #[serde(default)]
    pub elite: bool,
}

impl Default for DerivedFields {
    fn default() -> Self {
        Self {
            gender: default_gender(),
            elite: false,
        }
    }
}

/// Full description of one site edition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub edition: String,
    pub year: i32,
    pub table: String,
    pub listing: ListingSchema,
    pub detail: DetailSchema,
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub markers: Vec<MarkerRule>,
    #[serde(default)]
    pub derived: DerivedFields,
    #[serde(default = "default_collision_suffix")]
    pub collision_suffix: String,
}

impl ExtractionSchema {
    /// Parse and validate a schema from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SchemaError> {
        let schema: ExtractionSchema = serde_yaml::from_str(yaml)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Load a schema file from disk.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let schema = Self::from_yaml_str(&text)?;
        debug!(edition = %schema.edition, "Loaded schema file");
        Ok(schema)
    }

    /// Look up one of the editions compiled into the binary.
    pub fn bundled(edition: &str) -> Result<Self, SchemaError> {
        BUNDLED_EDITIONS
            .iter()
            .find(|(name, _)| *name == edition)
            .ok_or_else(|| SchemaError::UnknownEdition(edition.to_string()))
            .and_then(|(_, yaml)| Self::from_yaml_str(yaml))
    }

    pub fn field_rule(&self, field: Field) -> Option<&FieldRule> {
        self.fields.iter().find(|rule| rule.field == field)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |msg: String| Err(SchemaError::Invalid(msg));

        if !is_sql_identifier(&self.table) {
            return invalid(format!("table name '{}' is not a plain identifier", self.table));
        }
        if self.table.eq_ignore_ascii_case(CHECKPOINT_TABLE) {
            return invalid(format!("table name '{}' is reserved", self.table));
        }
        for required in [Field::Bib, Field::Name] {
            if self.field_rule(required).is_none() {
                return invalid(format!("no label mapped for field '{}'", required));
            }
        }

        let mut seen_fields = HashSet::new();
        for rule in &self.fields {
            if !seen_fields.insert(rule.field) {
                return invalid(format!("field '{}' is mapped twice", rule.field));
            }
            if rule.label.trim().is_empty() {
                return invalid(format!("field '{}' has an empty label", rule.field));
            }
        }

        let mut seen_markers = HashSet::new();
        for marker in &self.markers {
            if !MARKER_NAME.is_match(&marker.marker) {
                return invalid(format!(
                    "marker '{}' may only contain letters, digits and '_'",
                    marker.marker
                ));
            }
            // SQLite column names are case-insensitive.
            if !seen_markers.insert(marker.marker.to_ascii_lowercase()) {
                return invalid(format!("marker '{}' is listed twice", marker.marker));
            }
            if marker.time_cell == marker.diff_cell {
                return invalid(format!(
                    "marker '{}' reads time and diff from the same cell",
                    marker.marker
                ));
            }
        }

        if let Err(e) = Url::parse(&self.listing.base_url) {
            return invalid(format!("listing base_url: {e}"));
        }
        if let Err(e) = Url::parse(&self.detail.base_url) {
            return invalid(format!("detail base_url: {e}"));
        }
        if let Err(e) = scraper::Selector::parse(&self.listing.anchor_selector) {
            return invalid(format!("anchor_selector: {e}"));
        }
        if self.listing.page_count == 0 {
            return invalid("page_count must be at least 1".to_string());
        }
        if self.collision_suffix.is_empty() {
            return invalid("collision_suffix must not be empty".to_string());
        }
        Ok(())
    }
}
