//! Listing page enumeration.
//!
//! A listing page is one page of the paginated results table. Each row links
//! to an entrant's detail page; some editions link the same entrant twice
//! (name cell and bib cell), which the schema's [`DedupRule`] collapses.
//!
//! # URL Pattern
//!
//! ```text
//! {listing.base_url}?{page_param}={page}&{param}={value}&...
//! ```

use itertools::Itertools;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::errors::{ListingError, SchemaError};
use crate::models::DetailReference;
use crate::schema::{DedupRule, ExtractionSchema, ListingSchema};
use crate::source::PageSource;

/// Turns a page number into the ordered detail references it lists.
#[derive(Debug)]
pub struct ListingEnumerator<'a, S> {
    source: &'a S,
    listing: &'a ListingSchema,
    listing_base: Url,
    detail_base: Url,
    selector: Selector,
}

impl<'a, S> ListingEnumerator<'a, S>
where
    S: PageSource,
{
    pub fn new(source: &'a S, schema: &'a ExtractionSchema) -> Result<Self, SchemaError> {
        let listing = &schema.listing;
        let listing_base = Url::parse(&listing.base_url)
            .map_err(|e| SchemaError::Invalid(format!("listing base_url: {e}")))?;
        let detail_base = Url::parse(&schema.detail.base_url)
            .map_err(|e| SchemaError::Invalid(format!("detail base_url: {e}")))?;
        let selector = Selector::parse(&listing.anchor_selector)
            .map_err(|e| SchemaError::Invalid(format!("anchor_selector: {e}")))?;

        Ok(Self {
            source,
            listing,
            listing_base,
            detail_base,
            selector,
        })
    }

    /// The listing URL for `page`, with the page parameter first and the
    /// schema's filter parameters after it.
    pub fn page_url(&self, page: u32) -> Url {
        let mut url = self.listing_base.clone();
        url.query_pairs_mut()
            .append_pair(&self.listing.page_param, &page.to_string())
            .extend_pairs(self.listing.params.iter().map(|(k, v)| (k, v)));
        url
    }

    /// Fetch listing page `page` and extract its detail references.
    #[instrument(level = "info", skip(self))]
    pub async fn enumerate(&self, page: u32) -> Result<Vec<DetailReference>, ListingError> {
        let url = self.page_url(page);
        let html = self
            .source
            .get(url.as_str())
            .await
            .map_err(|source| ListingError::Fetch { page, source })?;
        let refs = self.parse(page, &html)?;
        info!(count = refs.len(), %url, "Enumerated listing page");
        Ok(refs)
    }

    /// Extract detail references from listing HTML.
    pub fn parse(&self, page: u32, html: &str) -> Result<Vec<DetailReference>, ListingError> {
        let document = Html::parse_document(html);
        let anchors: Vec<Option<String>> = document
            .select(&self.selector)
            .map(|a| a.value().attr("href").map(str::to_string))
            .collect();
        let matched = anchors.len();

        if anchors.is_empty() {
            if self.listing.allow_empty {
                debug!(page, "No anchors matched; page accepted as empty");
                return Ok(Vec::new());
            }
            return Err(ListingError::Parse {
                page,
                reason: format!(
                    "no anchors matched selector '{}'",
                    self.listing.anchor_selector
                ),
            });
        }

        let kept: Vec<Option<String>> = match self.listing.dedup {
            DedupRule::None => anchors,
            DedupRule::Alternate => {
                if anchors.len() % 2 != 0 {
                    return Err(ListingError::Parse {
                        page,
                        reason: format!(
                            "expected anchors in pairs but found {} anchors",
                            anchors.len()
                        ),
                    });
                }
                anchors.into_iter().step_by(2).collect()
            }
            DedupRule::AdjacentHref => anchors.into_iter().dedup().collect(),
        };

        let refs = kept
            .into_iter()
            .enumerate()
            .map(|(position, href)| {
                let href = href.ok_or_else(|| ListingError::Parse {
                    page,
                    reason: format!("anchor {position} has no href"),
                })?;
                let url = self
                    .detail_base
                    .join(&href)
                    .map_err(|e| ListingError::Parse {
                        page,
                        reason: format!("href '{href}' does not resolve: {e}"),
                    })?;
                Ok(DetailReference {
                    position,
                    href,
                    url: url.to_string(),
                })
            })
            .collect::<Result<Vec<_>, ListingError>>()?;

        if refs.len() * 2 < matched && self.listing.dedup == DedupRule::AdjacentHref {
            warn!(
                page,
                matched,
                kept = refs.len(),
                "Dedup collapsed more than half the anchors; check the anchor selector"
            );
        }
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FetchError;
    use crate::schema::tests::test_schema;
    use crate::source::tests::FixtureSource;

    const DOUBLE_ANCHOR: &str = include_str!("../../fixtures/listing_double_anchor.html");
    const EMPTY: &str = include_str!("../../fixtures/listing_empty.html");

    #[test]
    fn test_page_url_substitutes_page_first() {
        let schema = test_schema();
        let source = FixtureSource::new();
        let enumerator = ListingEnumerator::new(&source, &schema).unwrap();

        assert_eq!(
            enumerator.page_url(7).as_str(),
            "http://results.test/2013/index.php?page=7&event=MAS&search%5Bsex%5D=M"
        );
    }

    #[test]
    fn test_double_anchor_listing_yields_one_reference_per_entrant() {
        let schema = test_schema();
        let source = FixtureSource::new();
        let enumerator = ListingEnumerator::new(&source, &schema).unwrap();

        let refs = enumerator.parse(1, DOUBLE_ANCHOR).unwrap();
        let ids: Vec<&str> = refs
            .iter()
            .map(|r| r.href.rsplit('=').next().unwrap())
            .collect();
        assert_eq!(
            ids,
            vec![
                "9999990F5ECC830000008B8B",
                "9999990F5ECC830000009A1C",
                "9999990F5ECC83000000771D"
            ]
        );
        assert_eq!(
            refs.iter().map(|r| r.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            refs[0].url,
            "http://results.test/2013/?content=detail&idp=9999990F5ECC830000008B8B"
        );
    }

    #[test]
    fn test_adjacent_href_rule_matches_alternate_on_pairs() {
        let mut schema = test_schema();
        schema.listing.dedup = DedupRule::AdjacentHref;
        let source = FixtureSource::new();
        let enumerator = ListingEnumerator::new(&source, &schema).unwrap();

        let refs = enumerator.parse(1, DOUBLE_ANCHOR).unwrap();
        assert_eq!(refs.len(), 3);
        assert!(refs[2].href.ends_with("771D"));
    }

    #[test]
    fn test_no_dedup_keeps_every_anchor() {
        let mut schema = test_schema();
        schema.listing.dedup = DedupRule::None;
        let source = FixtureSource::new();
        let enumerator = ListingEnumerator::new(&source, &schema).unwrap();

        assert_eq!(enumerator.parse(1, DOUBLE_ANCHOR).unwrap().len(), 6);
    }

    #[test]
    fn test_alternate_rejects_odd_anchor_count() {
        let schema = test_schema();
        let source = FixtureSource::new();
        let enumerator = ListingEnumerator::new(&source, &schema).unwrap();

        let html = r#"<table><tr><td><a href="a">A</a></td><td><a href="a">1</a></td></tr>
                      <tr><td><a href="b">B</a></td></tr></table>"#;
        let err = enumerator.parse(4, html).unwrap_err();
        assert!(matches!(err, ListingError::Parse { page: 4, .. }));
    }

    #[test]
    fn test_empty_page_is_fatal_unless_tolerated() {
        let mut schema = test_schema();
        let source = FixtureSource::new();
        {
            let enumerator = ListingEnumerator::new(&source, &schema).unwrap();
            assert!(matches!(
                enumerator.parse(9, EMPTY),
                Err(ListingError::Parse { page: 9, .. })
            ));
        }

        schema.listing.allow_empty = true;
        let enumerator = ListingEnumerator::new(&source, &schema).unwrap();
        assert!(enumerator.parse(9, EMPTY).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enumerate_fetches_listing_url() {
        let schema = test_schema();
        let url = "http://results.test/2013/index.php?page=2&event=MAS&search%5Bsex%5D=M";
        let source = FixtureSource::new().with_page(url, DOUBLE_ANCHOR);
        let enumerator = ListingEnumerator::new(&source, &schema).unwrap();

        assert_eq!(enumerator.enumerate(2).await.unwrap().len(), 3);
        assert!(matches!(
            enumerator.enumerate(3).await,
            Err(ListingError::Fetch {
                page: 3,
                source: FetchError::Status { code: 404, .. }
            })
        ));
    }
}
