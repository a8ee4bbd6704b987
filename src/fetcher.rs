//! Bounded-concurrency fetching of a page's detail documents.
//!
//! [`ConcurrentFetcher::fetch_all`] is the page barrier: it resolves every
//! reference to either a document or a [`FetchError`] before returning, and
//! one reference failing never cancels its siblings.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::errors::FetchError;
use crate::models::{DetailReference, RawDocument};
use crate::source::PageSource;

/// Default number of in-flight detail requests.
pub const DEFAULT_WORKERS: usize = 4;

/// Per-reference fetch outcomes, ordered by listing position.
pub type FetchResults = BTreeMap<DetailReference, Result<RawDocument, FetchError>>;

#[derive(Debug)]
pub struct ConcurrentFetcher<'a, S> {
    source: &'a S,
    workers: usize,
}

impl<'a, S> ConcurrentFetcher<'a, S>
where
    S: PageSource,
{
    /// A worker count of zero is treated as one.
    pub fn new(source: &'a S, workers: usize) -> Self {
        Self {
            source,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    #[instrument(level = "info", skip_all, fields(refs = refs.len(), workers = self.workers))]
    pub async fn fetch_all(&self, refs: &[DetailReference]) -> FetchResults {
        let t0 = Instant::now();
        let source = self.source;

        let results: FetchResults = stream::iter(refs.iter().cloned())
            .map(|reference| async move {
                let outcome = source.get(&reference.url).await.map(|body| RawDocument {
                    url: reference.url.clone(),
                    body,
                });
                match &outcome {
                    Ok(doc) => debug!(
                        position = reference.position,
                        url = %reference.url,
                        bytes = doc.body.len(),
                        "Fetched detail page"
                    ),
                    Err(e) => warn!(
                        position = reference.position,
                        url = %reference.url,
                        error = %e,
                        "Detail page fetch failed; entrant will be skipped"
                    ),
                }
                (reference, outcome)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let failed = results.values().filter(|r| r.is_err()).count();
        info!(
            fetched = results.len() - failed,
            failed,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Detail fetch barrier reached"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RetrySource;
    use crate::source::tests::{FixtureSource, quick_policy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn refs(n: usize) -> Vec<DetailReference> {
        (0..n)
            .map(|i| DetailReference {
                position: i,
                href: format!("detail?id={i}"),
                url: format!("http://results.test/2013/detail?id={i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_one_reference() {
        let refs = refs(3);
        let source = FixtureSource::new()
            .with_page(&refs[0].url, "zero")
            .with_page(&refs[2].url, "two");
        let fetcher = ConcurrentFetcher::new(&source, 2);

        let results = fetcher.fetch_all(&refs).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[&refs[0]].as_ref().unwrap().body, "zero");
        assert!(matches!(
            results[&refs[1]],
            Err(FetchError::Status { code: 404, .. })
        ));
        assert_eq!(results[&refs[2]].as_ref().unwrap().body, "two");
    }

    #[tokio::test]
    async fn test_results_ordered_by_position_regardless_of_completion() {
        let refs = refs(4);
        let mut source = FixtureSource::new();
        for (i, r) in refs.iter().enumerate() {
            source = source
                .with_page(&r.url, format!("body {i}"))
                .with_delay(&r.url, Duration::from_millis(40 - 10 * i as u64));
        }
        let fetcher = ConcurrentFetcher::new(&source, 4);

        let results = fetcher.fetch_all(&refs).await;
        let positions: Vec<usize> = results.keys().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_retries_happen_per_reference() {
        let refs = refs(2);
        let source = FixtureSource::new()
            .with_page(&refs[0].url, "a")
            .with_page(&refs[1].url, "b")
            .with_failures(
                &refs[1].url,
                1,
                FetchError::Timeout {
                    url: refs[1].url.clone(),
                },
            );
        let retrying = RetrySource::new(source, quick_policy(2));
        let fetcher = ConcurrentFetcher::new(&retrying, 2);

        let results = fetcher.fetch_all(&refs).await;
        assert!(results.values().all(|r| r.is_ok()));
        assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 3);
    }

    struct CountingSource {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl PageSource for CountingSource {
        async fn get(&self, url: &str) -> Result<String, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(url.to_string())
        }
    }

    #[tokio::test]
    async fn test_worker_ceiling_respected() {
        let source = CountingSource {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let fetcher = ConcurrentFetcher::new(&source, 3);
        let results = fetcher.fetch_all(&refs(20)).await;

        assert_eq!(results.len(), 20);
        assert!(source.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(ConcurrentFetcher::new(&source, 0).workers(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let source = FixtureSource::new();
        let fetcher = ConcurrentFetcher::new(&source, DEFAULT_WORKERS);
        assert!(fetcher.fetch_all(&[]).await.is_empty());
    }
}
