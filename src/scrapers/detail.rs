//! Detail page extraction.
//!
//! Detail pages are loose stacks of two-column tables: a `th` label followed
//! by its value in a `td`. Split rows carry the marker label in a `th` and
//! several `td` cells (time of day, split time, diff, pace, ...).
//!
//! [`extract`] interprets an [`ExtractionSchema`] against one page; nothing
//! here knows about a particular edition's labels.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{instrument, warn};

use crate::errors::ExtractionError;
use crate::models::{COUNTRY_SENTINEL, EntrantRecord, RawDocument, Split};
use crate::schema::{Duplicates, ExtractionSchema, Field};

static CELLS: Lazy<Selector> = Lazy::new(|| Selector::parse("th, td").unwrap());
static COUNTRY_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([A-Z]+)\)\s*$").unwrap());

/// Country code from a trailing parenthetical, e.g. `"Jane Doe (USA)"` -> `"USA"`.
pub fn country_code(name: &str) -> Option<&str> {
    COUNTRY_CODE
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Integer placement, tolerating thousands separators. Dashes and other
/// non-numeric placeholders yield `None`.
pub fn parse_place(raw: &str) -> Option<i64> {
    raw.replace(',', "").trim().parse().ok()
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

/// All `th`/`td` cells of a document, in document order.
struct Cells<'d> {
    cells: Vec<ElementRef<'d>>,
}

impl<'d> Cells<'d> {
    fn new(document: &'d Html) -> Self {
        Self {
            cells: document.select(&CELLS).collect(),
        }
    }

    fn headers_labelled(&self, label: &str) -> Vec<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.value().name() == "th" && cell_text(**c) == label)
            .map(|(i, _)| i)
            .collect()
    }

    /// The single header occurrence the schema points at, if any.
    fn locate(
        &self,
        label: &str,
        skip: usize,
        duplicates: Duplicates,
    ) -> Result<Option<usize>, ExtractionError> {
        let matches = self.headers_labelled(label);
        let remaining = &matches[skip.min(matches.len())..];
        match (remaining, duplicates) {
            ([], _) => Ok(None),
            ([only], _) => Ok(Some(*only)),
            ([first, ..], Duplicates::First) => Ok(Some(*first)),
            (many, Duplicates::Error) => Err(ExtractionError::AmbiguousMatch {
                label: label.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Text of the first `td` after header `idx` in document order.
    fn value_after(&self, idx: usize) -> Option<String> {
        self.cells[idx + 1..]
            .iter()
            .find(|c| c.value().name() == "td")
            .and_then(|c| non_empty(cell_text(*c)))
    }

    /// The `td` siblings to the right of header `idx`.
    fn row_values(&self, idx: usize) -> Vec<Option<String>> {
        self.cells[idx]
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .filter(|e| e.value().name() == "td")
            .map(|td| non_empty(cell_text(td)))
            .collect()
    }
}

/// Extract one entrant's record from a fetched detail page.
///
/// The bib is always treated as required since it is the record key.
#[instrument(level = "debug", skip_all, fields(url = %doc.url))]
pub fn extract(
    doc: &RawDocument,
    schema: &ExtractionSchema,
) -> Result<EntrantRecord, ExtractionError> {
    let document = Html::parse_document(&doc.body);
    let cells = Cells::new(&document);

    let scalar = |field: Field| -> Result<Option<String>, ExtractionError> {
        let Some(rule) = schema.field_rule(field) else {
            return Ok(None);
        };
        let value = cells
            .locate(&rule.label, rule.skip, rule.duplicates)?
            .and_then(|idx| cells.value_after(idx));
        if value.is_none() && (rule.required || field == Field::Bib) {
            return Err(ExtractionError::MissingField { field });
        }
        Ok(value)
    };

    let bib_id = scalar(Field::Bib)?.ok_or(ExtractionError::MissingField { field: Field::Bib })?;
    let name = scalar(Field::Name)?;
    let club = scalar(Field::Club)?;
    let category = scalar(Field::Category)?;
    let place_gender = scalar(Field::PlaceGender)?.as_deref().and_then(parse_place);
    let place_category = scalar(Field::PlaceCategory)?.as_deref().and_then(parse_place);
    let place_overall = scalar(Field::PlaceOverall)?.as_deref().and_then(parse_place);
    let gender = scalar(Field::Gender)?.unwrap_or_else(|| schema.derived.gender.clone());

    let country = match name.as_deref().and_then(country_code) {
        Some(code) => code.to_string(),
        None => {
            warn!(
                bib = %bib_id,
                name = name.as_deref().unwrap_or(""),
                url = %doc.url,
                "No country code in name; storing sentinel"
            );
            COUNTRY_SENTINEL.to_string()
        }
    };

    let mut splits = Vec::with_capacity(schema.markers.len());
    for marker in &schema.markers {
        let split = match cells.locate(&marker.label, marker.skip, marker.duplicates)? {
            None => Split::empty(&marker.marker),
            Some(idx) => {
                let row = cells.row_values(idx);
                Split {
                    marker: marker.marker.clone(),
                    time: row.get(marker.time_cell).cloned().flatten(),
                    diff: row.get(marker.diff_cell).cloned().flatten(),
                }
            }
        };
        splits.push(split);
    }

    Ok(EntrantRecord {
        bib_id,
        name,
        country,
        club,
        category,
        gender,
        elite: schema.derived.elite,
        place_gender,
        place_category,
        place_overall,
        splits,
        edition: schema.edition.clone(),
        year: schema.year,
        source_url: doc.url.clone(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::tests::test_schema;

    const JANE_DOE: &str = include_str!("../../fixtures/detail_jane_doe.html");
    const WITHDRAWN: &str = include_str!("../../fixtures/detail_withdrawn.html");

    /// A minimal detail page in the 2013 layout, for pipeline tests.
    pub(crate) fn detail_html(bib: &str, name: &str, five_k: &str) -> String {
        format!(
            r#"<html><body>
<table><tr><th>Name</th><td>{name}</td></tr><tr><th>Finish time</th><td>03:00:00</td></tr></table>
<table>
  <tr><th>Name</th><td>{name}</td></tr>
  <tr><th>Club</th><td>Harriers</td></tr>
  <tr><th>Category</th><td>18-39</td></tr>
  <tr><th>Runner no</th><td>{bib}</td></tr>
  <tr><th>Place (M/W)</th><td>1</td></tr>
  <tr><th>Place (AC)</th><td>1</td></tr>
  <tr><th>Place (overall)</th><td>1</td></tr>
</table>
<table>
  <tr><th>5K</th><td>10:00:00</td><td>{five_k}</td><td>{five_k}</td></tr>
  <tr><th>Finish time</th><td>13:00:00</td><td>03:00:00</td><td>02:35:00</td></tr>
</table>
</body></html>"#
        )
    }

    fn doc(body: &str) -> RawDocument {
        RawDocument {
            url: "http://results.test/2013/?content=detail&idp=1".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_fixture_extraction() {
        let schema = test_schema();
        let record = extract(&doc(JANE_DOE), &schema).unwrap();

        assert_eq!(record.bib_id, "12345");
        assert_eq!(record.name.as_deref(), Some("Jane Doe (USA)"));
        assert_eq!(record.country, "USA");
        assert_eq!(record.club.as_deref(), Some("Boston Striders"));
        assert_eq!(record.category.as_deref(), Some("18-39"));
        assert_eq!(record.place_gender, Some(1204));
        assert_eq!(record.place_category, Some(877));
        assert_eq!(record.place_overall, Some(4391));

        let five_k = record.split("5K").unwrap();
        assert_eq!(five_k.time.as_deref(), Some("00:25:10"));
        assert_eq!(five_k.diff.as_deref(), Some("00:25:10"));
        let half = record.split("Half").unwrap();
        assert_eq!(half.time.as_deref(), Some("01:50:48"));
        assert_eq!(half.diff.as_deref(), Some("00:05:53"));
    }

    #[test]
    fn test_spurious_first_finish_label_is_skipped() {
        let schema = test_schema();
        let record = extract(&doc(JANE_DOE), &schema).unwrap();
        let finish = record.split("Finish").unwrap();
        assert_eq!(finish.time.as_deref(), Some("03:41:07"));
        assert_eq!(finish.diff.as_deref(), Some("00:11:27"));
    }

    #[test]
    fn test_doubled_label_without_schema_rule_is_ambiguous() {
        let mut schema = test_schema();
        schema.markers.last_mut().unwrap().skip = 0;

        let err = extract(&doc(JANE_DOE), &schema).unwrap_err();
        assert_eq!(
            err,
            ExtractionError::AmbiguousMatch {
                label: "Finish time".to_string(),
                count: 2
            }
        );
    }

    #[test]
    fn test_derived_fields_come_from_schema() {
        let mut schema = test_schema();
        schema.derived.gender = "W".to_string();
        schema.derived.elite = true;

        let record = extract(&doc(JANE_DOE), &schema).unwrap();
        assert_eq!(record.gender, "W");
        assert!(record.elite);
        assert_eq!(record.year, 2013);
        assert_eq!(record.edition, "test-edition");
    }

    #[test]
    fn test_withdrawn_entrant_gets_null_splits() {
        let schema = test_schema();
        let record = extract(&doc(WITHDRAWN), &schema).unwrap();

        assert_eq!(record.bib_id, "40127");
        assert_eq!(record.country, COUNTRY_SENTINEL);
        assert_eq!(record.club, None);
        assert_eq!(record.place_overall, None);
        assert_eq!(record.splits.len(), schema.markers.len());
        assert_eq!(
            record.split("10K").unwrap().time.as_deref(),
            Some("01:05:12")
        );
        assert_eq!(record.split("Half").unwrap(), &Split::empty("Half"));
        assert_eq!(record.split("Finish").unwrap(), &Split::empty("Finish"));
    }

    #[test]
    fn test_missing_required_field() {
        let schema = test_schema();
        let body = JANE_DOE.replace("<th>Runner no</th>", "<th>Bib</th>");
        assert_eq!(
            extract(&doc(&body), &schema).unwrap_err(),
            ExtractionError::MissingField { field: Field::Bib }
        );
    }

    #[test]
    fn test_generated_detail_page() {
        let schema = test_schema();
        let record = extract(&doc(&detail_html("777", "Ann Lee (KEN)", "00:17:30")), &schema).unwrap();
        assert_eq!(record.bib_id, "777");
        assert_eq!(record.country, "KEN");
        assert_eq!(
            record.split("Finish").unwrap().time.as_deref(),
            Some("03:00:00")
        );
    }

    #[test]
    fn test_country_code() {
        assert_eq!(country_code("Jane Doe (USA)"), Some("USA"));
        assert_eq!(country_code("Jane Doe (USA) "), Some("USA"));
        assert_eq!(country_code("Jane (Jay) Doe"), None);
        assert_eq!(country_code("Jane Doe"), None);
    }

    #[test]
    fn test_parse_place() {
        assert_eq!(parse_place("4,391"), Some(4391));
        assert_eq!(parse_place(" 12 "), Some(12));
        assert_eq!(parse_place("–"), None);
    }
}
