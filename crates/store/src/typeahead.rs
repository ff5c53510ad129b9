//! Search box front: minimum query length in front of a debounced search.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use starshelf_api::{ApiError, GitHubApi};
use starshelf_core::SearchResult;
use tracing::{debug, error};

use crate::coalesce::{CoalesceError, Coalescer};

pub type SearchCoalescer = Coalescer<String, Vec<SearchResult>, ApiError>;

pub struct Typeahead {
    coalescer: SearchCoalescer,
    min_len: usize,
}

impl Typeahead {
    pub const DEFAULT_MIN_LEN: usize = 2;

    pub fn new(api: Arc<dyn GitHubApi>, wait: Duration, min_len: usize) -> Self {
        let coalescer = Coalescer::new(wait, move |query: String| {
            let api = Arc::clone(&api);
            async move { api.search(&query).await }
        });
        Self::with_coalescer(coalescer, min_len)
    }

    pub fn with_coalescer(coalescer: SearchCoalescer, min_len: usize) -> Self { Self { coalescer, min_len } }

    pub fn min_len(&self) -> usize { self.min_len }

    fn too_short(&self, text: &str) -> bool { text.trim().chars().count() < self.min_len }

    /// Results for `text`, with errors surfaced. Short input resolves to an
    /// empty list without reaching the search endpoint.
    pub fn try_query(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<Vec<SearchResult>, CoalesceError<ApiError>>> + Send + 'static {
        let pending = if self.too_short(text) {
            debug!(len = text.len(), min = self.min_len, "typeahead: query too short");
            None
        } else {
            Some(self.coalescer.invoke(text.trim().to_string()))
        };
        async move {
            match pending {
                Some(f) => f.await,
                None => Ok(Vec::new()),
            }
        }
    }

    /// Like [`Typeahead::try_query`], but a failed search clears the results.
    pub fn query(&self, text: &str) -> impl Future<Output = Vec<SearchResult>> + Send + 'static {
        let fut = self.try_query(text);
        async move {
            match fut.await {
                Ok(hits) => hits,
                Err(e) => {
                    error!(error = %e, "typeahead: error fetching data");
                    Vec::new()
                }
            }
        }
    }
}
