//! Starshelf remote collaborators.
//!
//! Two surfaces: the saved-repo collection service (`GET/POST/DELETE /repo/`)
//! and GitHub's public search/repository endpoints. Frontends and the store
//! depend on the traits here; HTTP and mock implementations live alongside.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use starshelf_core::{RepoId, SavedRepo, SearchResult};
use tracing::{debug, info, warn};

/// Remote errors. Kept `Clone` so one failure can be handed to several waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("rejected: {what} -> HTTP {status}")]
    Rejected { what: String, status: u16 },
    #[error("decode: {0}")]
    Decode(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Remote collection of saved repositories.
#[async_trait::async_trait]
pub trait SavedRepoApi: Send + Sync {
    /// `GET /repo/`
    async fn list(&self) -> ApiResult<Vec<SavedRepo>>;

    /// `POST /repo/` with the record as JSON body.
    async fn create(&self, repo: &SavedRepo) -> ApiResult<()>;

    /// `DELETE /repo/{id}`
    async fn remove(&self, id: &RepoId) -> ApiResult<()>;
}

/// Third-party repository search and lookup.
#[async_trait::async_trait]
pub trait GitHubApi: Send + Sync {
    async fn search(&self, query: &str) -> ApiResult<Vec<SearchResult>>;

    async fn repository(&self, id: &RepoId) -> ApiResult<SearchResult>;
}

/// Detail record for `id`: `known` when the caller already holds it, otherwise fetched.
pub async fn hydrate(
    api: &dyn GitHubApi,
    id: &RepoId,
    known: Option<SearchResult>,
) -> ApiResult<SearchResult> {
    match known {
        Some(r) => Ok(r),
        None => api.repository(id).await,
    }
}

#[derive(Debug, Deserialize)]
struct RepoListBody {
    repos: Vec<SavedRepo>,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    items: Vec<SearchResult>,
}

// ----------------- HTTP implementation -----------------

const USER_AGENT: &str = concat!("starshelf/", env!("CARGO_PKG_VERSION"));

fn http_client() -> ApiResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ApiError::Transport(e.to_string()))
}

fn map_send_err(e: reqwest::Error) -> ApiError {
    if e.is_decode() { ApiError::Decode(e.to_string()) } else { ApiError::Transport(e.to_string()) }
}

fn ensure_success(resp: reqwest::Response, what: &str) -> ApiResult<reqwest::Response> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ApiError::Rejected { what: what.to_string(), status: status.as_u16() });
    }
    Ok(resp)
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> ApiResult<T> {
    resp.json::<T>().await.map_err(|e| ApiError::Decode(e.to_string()))
}

fn record(op: &'static str, t0: Instant, res: &ApiResult<impl Sized>) {
    histogram!("api_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    match res {
        Ok(_) => debug!(op, took_ms = %t0.elapsed().as_millis(), "api: ok"),
        Err(e) => {
            counter!("api_error_total", 1, "op" => op);
            warn!(op, error = %e, took_ms = %t0.elapsed().as_millis(), "api: failed");
        }
    }
}

/// `reqwest`-backed client for the saved-repo collection service.
pub struct HttpSavedRepoApi {
    client: reqwest::Client,
    base: String,
}

impl HttpSavedRepoApi {
    pub fn new(base: impl Into<String>) -> ApiResult<Self> {
        let base = base.into().trim_end_matches('/').to_string();
        info!(base = %base, "api: saved-repo client ready");
        Ok(Self { client: http_client()?, base })
    }

    fn collection_url(&self) -> String { format!("{}/repo/", self.base) }
}

#[async_trait::async_trait]
impl SavedRepoApi for HttpSavedRepoApi {
    async fn list(&self) -> ApiResult<Vec<SavedRepo>> {
        let t0 = Instant::now();
        let res: ApiResult<Vec<SavedRepo>> = async {
            let resp = self.client.get(self.collection_url()).send().await.map_err(map_send_err)?;
            let body: RepoListBody = decode(ensure_success(resp, "list saved repos")?).await?;
            Ok(body.repos)
        }
        .await;
        record("list", t0, &res);
        res
    }

    async fn create(&self, repo: &SavedRepo) -> ApiResult<()> {
        let t0 = Instant::now();
        let res: ApiResult<()> = async {
            let resp = self
                .client
                .post(self.collection_url())
                .json(repo)
                .send()
                .await
                .map_err(map_send_err)?;
            ensure_success(resp, "save repo").map(|_| ())
        }
        .await;
        record("create", t0, &res);
        res
    }

    async fn remove(&self, id: &RepoId) -> ApiResult<()> {
        let t0 = Instant::now();
        let res: ApiResult<()> = async {
            let url = format!("{}{}", self.collection_url(), id);
            let resp = self.client.delete(url).send().await.map_err(map_send_err)?;
            ensure_success(resp, "delete repo").map(|_| ())
        }
        .await;
        record("remove", t0, &res);
        res
    }
}

/// `reqwest`-backed client for GitHub's REST API.
pub struct HttpGitHubApi {
    client: reqwest::Client,
    base: String,
}

impl HttpGitHubApi {
    pub const DEFAULT_BASE: &'static str = "https://api.github.com";

    pub fn new(base: impl Into<String>) -> ApiResult<Self> {
        let base = base.into().trim_end_matches('/').to_string();
        Ok(Self { client: http_client()?, base })
    }
}

#[async_trait::async_trait]
impl GitHubApi for HttpGitHubApi {
    async fn search(&self, query: &str) -> ApiResult<Vec<SearchResult>> {
        let t0 = Instant::now();
        let res: ApiResult<Vec<SearchResult>> = async {
            let resp = self
                .client
                .get(format!("{}/search/repositories", self.base))
                .query(&[("q", query)])
                .send()
                .await
                .map_err(map_send_err)?;
            let body: SearchBody = decode(ensure_success(resp, "search repositories")?).await?;
            Ok(body.items)
        }
        .await;
        record("search", t0, &res);
        res
    }

    async fn repository(&self, id: &RepoId) -> ApiResult<SearchResult> {
        let t0 = Instant::now();
        let res: ApiResult<SearchResult> = async {
            let resp = self
                .client
                .get(format!("{}/repositories/{}", self.base, id))
                .send()
                .await
                .map_err(map_send_err)?;
            decode(ensure_success(resp, "get repository")?).await
        }
        .await;
        record("repository", t0, &res);
        res
    }
}

// ----------------- Mock implementation -----------------

/// Operation selector for [`MockApi`] failure injection and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    List,
    Create,
    Remove,
    Search,
    Repository,
}

/// Simple in-memory implementation of both remote surfaces, for tests.
#[derive(Default)]
pub struct MockApi {
    saved: Mutex<Vec<SavedRepo>>,
    results: Mutex<Vec<SearchResult>>,
    failures: Mutex<HashMap<MockOp, ApiError>>,
    calls: Mutex<Vec<(MockOp, String)>>,
    latency: Duration,
}

/// Poison-tolerant lock, same as the store's coalescer.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    pub fn with_saved(self, repos: Vec<SavedRepo>) -> Self {
        *lock(&self.saved) = repos;
        self
    }

    pub fn with_results(self, results: Vec<SearchResult>) -> Self {
        *lock(&self.results) = results;
        self
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make `op` fail with `err` until [`MockApi::heal`] is called.
    pub fn fail(&self, op: MockOp, err: ApiError) {
        lock(&self.failures).insert(op, err);
    }

    pub fn heal(&self, op: MockOp) {
        lock(&self.failures).remove(&op);
    }

    /// What the remote side currently holds.
    pub fn remote_saved(&self) -> Vec<SavedRepo> { lock(&self.saved).clone() }

    pub fn calls(&self) -> Vec<(MockOp, String)> { lock(&self.calls).clone() }

    pub fn count(&self, op: MockOp) -> usize {
        lock(&self.calls).iter().filter(|(o, _)| *o == op).count()
    }

    async fn enter(&self, op: MockOp, arg: String) -> ApiResult<()> {
        lock(&self.calls).push((op, arg));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match lock(&self.failures).get(&op) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl SavedRepoApi for MockApi {
    async fn list(&self) -> ApiResult<Vec<SavedRepo>> {
        self.enter(MockOp::List, String::new()).await?;
        Ok(self.remote_saved())
    }

    async fn create(&self, repo: &SavedRepo) -> ApiResult<()> {
        self.enter(MockOp::Create, repo.id.to_string()).await?;
        let mut saved = lock(&self.saved);
        if !saved.iter().any(|r| r.id == repo.id) {
            saved.push(repo.clone());
        }
        Ok(())
    }

    async fn remove(&self, id: &RepoId) -> ApiResult<()> {
        self.enter(MockOp::Remove, id.to_string()).await?;
        lock(&self.saved).retain(|r| &r.id != id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl GitHubApi for MockApi {
    async fn search(&self, query: &str) -> ApiResult<Vec<SearchResult>> {
        self.enter(MockOp::Search, query.to_string()).await?;
        let needle = query.to_lowercase();
        Ok(lock(&self.results)
            .iter()
            .filter(|r| r.full_name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn repository(&self, id: &RepoId) -> ApiResult<SearchResult> {
        self.enter(MockOp::Repository, id.to_string()).await?;
        lock(&self.results)
            .iter()
            .find(|r| &r.repo_id() == id)
            .cloned()
            .ok_or_else(|| ApiError::Rejected { what: "get repository".into(), status: 404 })
    }
}
