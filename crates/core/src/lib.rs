//! Starshelf core types: GitHub search results and the saved-repo records
//! mirrored from the collection service.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard ceiling on the number of saved repositories.
pub const SAVED_REPO_CAPACITY: usize = 10;

/// Identifier of a saved repository: the decimal form of GitHub's numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<u64> for RepoId {
    fn from(v: u64) -> Self { Self(v.to_string()) }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Repository summary as returned by the GitHub search and repository endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: u64,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stargazers_count: u64,
    #[serde(default)]
    pub language: Option<String>,
    pub url: String,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
}

impl SearchResult {
    pub fn repo_id(&self) -> RepoId { RepoId::from(self.id) }
}

/// Canonical local record of a saved repository (collection service JSON shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedRepo {
    pub id: RepoId,
    pub full_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "stargazersCount")]
    pub star_count: u64,
    #[serde(default)]
    pub language: Option<String>,
    pub url: String,
}

impl From<&SearchResult> for SavedRepo {
    fn from(r: &SearchResult) -> Self {
        Self {
            id: r.repo_id(),
            full_name: r.full_name.clone(),
            created_at: r.created_at,
            star_count: r.stargazers_count,
            language: r.language.clone(),
            url: r.url.clone(),
        }
    }
}

/// Display order for the saved list, by star count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Stable copy of `repos` ordered by star count; the input is left untouched.
pub fn sorted(repos: &[SavedRepo], order: SortOrder) -> Vec<SavedRepo> {
    let mut out = repos.to_vec();
    match order {
        SortOrder::Ascending => out.sort_by(|a, b| a.star_count.cmp(&b.star_count)),
        SortOrder::Descending => out.sort_by(|a, b| b.star_count.cmp(&a.star_count)),
    }
    out
}

pub mod prelude {
    pub use super::{sorted, RepoId, SavedRepo, SearchResult, SortOrder, SAVED_REPO_CAPACITY};
}
