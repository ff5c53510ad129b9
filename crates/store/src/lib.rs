//! Starshelf client state.
//!
//! [`SavedRepoStore`] mirrors the remote saved-repo collection and applies
//! optimistic mutations that are rolled back when the remote refuses them.
//! All state changes go through [`reduce`]; readers get immutable snapshots.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::counter;
use rustc_hash::FxHashSet;
use starshelf_api::{ApiError, SavedRepoApi};
use starshelf_core::{RepoId, SavedRepo, SearchResult, SAVED_REPO_CAPACITY};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

mod coalesce;
mod typeahead;

pub use coalesce::{CoalesceError, Coalescer};
pub use typeahead::{SearchCoalescer, Typeahead};

/// Snapshot of the saved list as seen by the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreState {
    /// Insertion order; ids are unique.
    pub saved_repos: Vec<SavedRepo>,
    pub is_fetching: bool,
    /// Bumped on every dispatch.
    pub epoch: u64,
}

impl Default for StoreState {
    /// A fresh store is considered to be loading until the first `Init`.
    fn default() -> Self { Self { saved_repos: Vec::new(), is_fetching: true, epoch: 0 } }
}

impl StoreState {
    pub fn contains(&self, id: &RepoId) -> bool { self.saved_repos.iter().any(|r| &r.id == id) }

    pub fn position(&self, id: &RepoId) -> Option<usize> { self.saved_repos.iter().position(|r| &r.id == id) }
}

/// State transitions. Each variant carries exactly what its transition needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Replace the list with the remote's copy and clear `is_fetching`.
    Init(Vec<SavedRepo>),
    SetFetching(bool),
    /// Append; no-op when the id is already present.
    Add(SavedRepo),
    Delete(RepoId),
    /// Re-insert at `index` (clamped to the list length); no-op when present.
    Restore { index: usize, repo: SavedRepo },
}

/// Pure reducer.
pub fn reduce(state: &StoreState, action: Action) -> StoreState {
    let mut next = state.clone();
    next.epoch = state.epoch.saturating_add(1);
    match action {
        Action::Init(list) => {
            let mut seen = FxHashSet::default();
            next.saved_repos = list.into_iter().filter(|r| seen.insert(r.id.clone())).collect();
            next.is_fetching = false;
        }
        Action::SetFetching(v) => next.is_fetching = v,
        Action::Add(repo) => {
            if !next.contains(&repo.id) {
                next.saved_repos.push(repo);
            }
        }
        Action::Delete(id) => next.saved_repos.retain(|r| r.id != id),
        Action::Restore { index, repo } => {
            if !next.contains(&repo.id) {
                let at = index.min(next.saved_repos.len());
                next.saved_repos.insert(at, repo);
            }
        }
    }
    next
}

/// Why a store operation did not take effect (or was undone).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("already holding the maximum of {cap} saved repositories", cap = SAVED_REPO_CAPACITY)]
    CapacityExceeded,
    #[error("repository {0} is already saved")]
    DuplicateEntry(RepoId),
    #[error("remote: {0}")]
    Remote(#[from] ApiError),
}

/// Pre-flight guards for a save, checked against `state`.
fn admit(state: &StoreState, id: &RepoId) -> Result<(), StoreError> {
    if state.saved_repos.len() >= SAVED_REPO_CAPACITY {
        return Err(StoreError::CapacityExceeded);
    }
    if state.contains(id) {
        return Err(StoreError::DuplicateEntry(id.clone()));
    }
    Ok(())
}

/// Owner of the saved-repo state; construct one per client and pass it around.
pub struct SavedRepoStore {
    api: Arc<dyn SavedRepoApi>,
    state: ArcSwap<StoreState>,
    epoch_tx: watch::Sender<u64>,
}

impl SavedRepoStore {
    pub fn new(api: Arc<dyn SavedRepoApi>) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { api, state: ArcSwap::from_pointee(StoreState::default()), epoch_tx }
    }

    /// Build a store and load the remote collection into it. A store whose
    /// load failed is not handed out; its guards would check an empty list.
    pub async fn init(api: Arc<dyn SavedRepoApi>) -> Result<Self, StoreError> {
        let store = Self::new(api);
        store.fetch_saved_repos().await?;
        Ok(store)
    }

    pub fn snapshot(&self) -> Arc<StoreState> { self.state.load_full() }

    /// Epoch notifications, one per dispatch.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    /// Apply `action` atomically and notify subscribers. Returns the new epoch.
    pub fn dispatch(&self, action: Action) -> u64 { self.apply(action).epoch + 1 }

    /// Returns the state the action was applied to.
    fn apply(&self, action: Action) -> Arc<StoreState> {
        debug!(?action, "store: dispatch");
        let prev = self.state.rcu(|cur| reduce(cur, action.clone()));
        self.publish(prev.epoch + 1);
        prev
    }

    fn publish(&self, epoch: u64) {
        self.epoch_tx.send_if_modified(|cur| {
            if epoch > *cur {
                *cur = epoch;
                true
            } else {
                false
            }
        });
    }

    /// Guard and optimistic `Add` in one atomic step.
    fn admit_and_add(&self, repo: &SavedRepo) -> Result<(), StoreError> {
        let mut verdict = Ok(());
        let prev = self.state.rcu(|cur| {
            verdict = admit(cur, &repo.id);
            match verdict {
                Ok(()) => Arc::new(reduce(cur, Action::Add(repo.clone()))),
                Err(_) => Arc::clone(cur),
            }
        });
        if verdict.is_ok() {
            self.publish(prev.epoch + 1);
        }
        verdict
    }

    /// Reload the list from the remote. On failure the list is left as is.
    pub async fn fetch_saved_repos(&self) -> Result<usize, StoreError> {
        let t0 = Instant::now();
        self.dispatch(Action::SetFetching(true));
        match self.api.list().await {
            Ok(repos) => {
                let count = repos.len();
                self.dispatch(Action::Init(repos));
                info!(count, took_ms = %t0.elapsed().as_millis(), "store: saved repos loaded");
                Ok(count)
            }
            Err(e) => {
                error!(error = %e, "store: error fetching saved repos");
                self.dispatch(Action::SetFetching(false));
                Err(e.into())
            }
        }
    }

    /// Save a search hit: guard, add optimistically, confirm remotely, roll
    /// back with `Delete` if the remote refuses.
    pub async fn save_repo(&self, result: &SearchResult) -> Result<(), StoreError> {
        let repo = SavedRepo::from(result);
        if let Err(e) = self.admit_and_add(&repo) {
            counter!("store_guard_reject_total", 1);
            warn!(id = %repo.id, error = %e, "store: save rejected");
            return Err(e);
        }
        counter!("store_save_total", 1);
        match self.api.create(&repo).await {
            Ok(()) => {
                info!(id = %repo.id, name = %repo.full_name, "store: repo saved");
                Ok(())
            }
            Err(e) => {
                counter!("store_rollback_total", 1, "op" => "save");
                error!(id = %repo.id, error = %e, "store: save failed; rolling back");
                self.dispatch(Action::Delete(repo.id.clone()));
                Err(e.into())
            }
        }
    }

    /// Delete a saved repo: remove optimistically, confirm remotely, put it
    /// back where it was if the remote refuses.
    pub async fn delete_repo(&self, repo: &SavedRepo) -> Result<(), StoreError> {
        let prev = self.apply(Action::Delete(repo.id.clone()));
        let index = prev.position(&repo.id);
        counter!("store_delete_total", 1);
        match self.api.remove(&repo.id).await {
            Ok(()) => {
                info!(id = %repo.id, "store: repo deleted");
                Ok(())
            }
            Err(e) => {
                counter!("store_rollback_total", 1, "op" => "delete");
                error!(id = %repo.id, error = %e, "store: delete failed; restoring");
                let undo = match index {
                    Some(index) => Action::Restore { index, repo: repo.clone() },
                    None => Action::Add(repo.clone()),
                };
                self.dispatch(undo);
                Err(e.into())
            }
        }
    }
}
