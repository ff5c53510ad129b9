#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use starshelf_api::{ApiError, MockApi, MockOp};
use starshelf_core::{RepoId, SavedRepo, SearchResult, SAVED_REPO_CAPACITY};
use starshelf_store::{Action, SavedRepoStore, StoreError};

fn hit(id: u64) -> SearchResult {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "full_name": format!("owner/project-{id}"),
        "description": null,
        "stargazers_count": id * 3,
        "language": "Rust",
        "url": format!("https://api.github.com/repos/owner/project-{id}"),
        "html_url": format!("https://github.com/owner/project-{id}"),
        "created_at": "2017-07-07T07:07:07Z"
    }))
    .unwrap()
}

fn server_error() -> ApiError { ApiError::Rejected { what: "test".into(), status: 500 } }

fn ids(store: &SavedRepoStore) -> Vec<String> {
    store.snapshot().saved_repos.iter().map(|r| r.id.to_string()).collect()
}

fn setup(api: MockApi) -> (Arc<MockApi>, SavedRepoStore) {
    let api = Arc::new(api);
    let store = SavedRepoStore::new(api.clone());
    (api, store)
}

#[tokio::test]
async fn save_then_delete_round_trip() {
    let (api, store) = setup(MockApi::new());
    store.save_repo(&hit(1)).await.unwrap();
    assert_eq!(ids(&store), ["1"]);
    assert_eq!(api.remote_saved().len(), 1);

    let saved = store.snapshot().saved_repos[0].clone();
    assert_eq!(saved.id, RepoId::new("1"));
    store.delete_repo(&saved).await.unwrap();
    assert!(store.snapshot().saved_repos.is_empty());
    assert!(api.remote_saved().is_empty());
}

#[tokio::test]
async fn duplicate_save_is_rejected_before_the_network() {
    let (api, store) = setup(MockApi::new());
    store.save_repo(&hit(5)).await.unwrap();
    let before = store.snapshot();
    let err = store.save_repo(&hit(5)).await.unwrap_err();
    assert_eq!(err, StoreError::DuplicateEntry(RepoId::new("5")));
    assert_eq!(ids(&store), ["5"]);
    assert_eq!(store.snapshot().epoch, before.epoch);
    assert_eq!(api.count(MockOp::Create), 1);
}

#[tokio::test]
async fn eleventh_save_is_rejected_and_state_unchanged() {
    let (api, store) = setup(MockApi::new());
    for id in 1..=SAVED_REPO_CAPACITY as u64 {
        store.save_repo(&hit(id)).await.unwrap();
    }
    assert_eq!(store.snapshot().saved_repos.len(), SAVED_REPO_CAPACITY);
    let before = store.snapshot();

    let err = store.save_repo(&hit(99)).await.unwrap_err();
    assert_eq!(err, StoreError::CapacityExceeded);
    assert_eq!(*store.snapshot(), *before);
    assert_eq!(api.count(MockOp::Create), SAVED_REPO_CAPACITY);
}

#[tokio::test]
async fn failed_save_rolls_back() {
    let (api, store) = setup(MockApi::new());
    store.save_repo(&hit(1)).await.unwrap();
    api.fail(MockOp::Create, server_error());

    let err = store.save_repo(&hit(2)).await.unwrap_err();
    assert_eq!(err, StoreError::Remote(server_error()));
    assert_eq!(ids(&store), ["1"]);

    // Rolled back entries can be saved again once the remote recovers.
    api.heal(MockOp::Create);
    store.save_repo(&hit(2)).await.unwrap();
    assert_eq!(ids(&store), ["1", "2"]);
}

#[tokio::test]
async fn transport_failure_on_save_rolls_back() {
    let (api, store) = setup(MockApi::new());
    api.fail(MockOp::Create, ApiError::Transport("connection refused".into()));
    assert!(matches!(store.save_repo(&hit(4)).await, Err(StoreError::Remote(ApiError::Transport(_)))));
    assert!(store.snapshot().saved_repos.is_empty());
}

#[tokio::test]
async fn failed_delete_restores_original_position() {
    let seeded: Vec<SavedRepo> = [1, 2, 3].iter().map(|&i| SavedRepo::from(&hit(i))).collect();
    let (api, store) = setup(MockApi::new().with_saved(seeded));
    store.fetch_saved_repos().await.unwrap();
    assert_eq!(ids(&store), ["1", "2", "3"]);

    api.fail(MockOp::Remove, server_error());
    let middle = store.snapshot().saved_repos[1].clone();
    let err = store.delete_repo(&middle).await.unwrap_err();
    assert_eq!(err, StoreError::Remote(server_error()));
    assert_eq!(ids(&store), ["1", "2", "3"]);
    assert_eq!(api.remote_saved().len(), 3);
}

#[tokio::test]
async fn failed_delete_of_unlisted_entry_appends_it() {
    let (api, store) = setup(MockApi::new());
    api.fail(MockOp::Remove, server_error());
    let stray = SavedRepo::from(&hit(8));
    assert!(store.delete_repo(&stray).await.is_err());
    assert_eq!(ids(&store), ["8"]);
}

#[tokio::test]
async fn fetch_initializes_from_remote() {
    let seeded: Vec<SavedRepo> = [10, 20].iter().map(|&i| SavedRepo::from(&hit(i))).collect();
    let (_api, store) = setup(MockApi::new().with_saved(seeded.clone()));
    assert!(store.snapshot().is_fetching);
    assert_eq!(store.fetch_saved_repos().await.unwrap(), 2);
    let snap = store.snapshot();
    assert_eq!(snap.saved_repos, seeded);
    assert!(!snap.is_fetching);
}

#[tokio::test]
async fn failed_fetch_keeps_existing_list() {
    let (api, store) = setup(MockApi::new());
    store.save_repo(&hit(1)).await.unwrap();
    api.fail(MockOp::List, ApiError::Decode("expected value".into()));

    let err = store.fetch_saved_repos().await.unwrap_err();
    assert!(matches!(err, StoreError::Remote(ApiError::Decode(_))));
    let snap = store.snapshot();
    assert_eq!(ids(&store), ["1"]);
    assert!(!snap.is_fetching);
}

#[tokio::test]
async fn init_loads_remote_collection() {
    let seeded: Vec<SavedRepo> = [4, 5].iter().map(|&i| SavedRepo::from(&hit(i))).collect();
    let api = Arc::new(MockApi::new().with_saved(seeded));
    let store = SavedRepoStore::init(api.clone()).await.unwrap();
    assert_eq!(ids(&store), ["4", "5"]);
    assert_eq!(api.count(MockOp::List), 1);
}

#[tokio::test]
async fn init_reports_failed_load() {
    let full: Vec<SavedRepo> =
        (1..=SAVED_REPO_CAPACITY as u64).map(|i| SavedRepo::from(&hit(i))).collect();
    let api = Arc::new(MockApi::new().with_saved(full));
    api.fail(MockOp::List, ApiError::Transport("down".into()));

    let err = SavedRepoStore::init(api.clone()).await.err().unwrap();
    assert_eq!(err, StoreError::Remote(ApiError::Transport("down".into())));
    // No store means no save against an unloaded list.
    assert_eq!(api.count(MockOp::Create), 0);
    assert_eq!(api.remote_saved().len(), SAVED_REPO_CAPACITY);
}

#[tokio::test(start_paused = true)]
async fn optimistic_add_is_visible_before_remote_confirms() {
    let api = Arc::new(MockApi::new().with_latency(Duration::from_millis(200)));
    let store = Arc::new(SavedRepoStore::new(api.clone()));
    let mut epochs = store.subscribe();

    let task = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.save_repo(&hit(3)).await }
    });
    epochs.changed().await.unwrap();
    assert_eq!(ids(&store), ["3"]);
    assert!(api.remote_saved().is_empty());

    task.await.unwrap().unwrap();
    assert_eq!(api.remote_saved().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn optimistic_add_is_undone_when_remote_refuses() {
    let api = Arc::new(MockApi::new().with_latency(Duration::from_millis(200)));
    api.fail(MockOp::Create, server_error());
    let store = Arc::new(SavedRepoStore::new(api.clone()));
    let mut epochs = store.subscribe();

    let task = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.save_repo(&hit(3)).await }
    });
    epochs.changed().await.unwrap();
    assert_eq!(ids(&store), ["3"]);

    assert!(task.await.unwrap().is_err());
    assert!(store.snapshot().saved_repos.is_empty());
}

#[tokio::test]
async fn concurrent_duplicate_saves_keep_one_entry() {
    let (_api, store) = setup(MockApi::new());
    let r = hit(77);
    let (a, b) = tokio::join!(store.save_repo(&r), store.save_repo(&r));
    assert!(a.is_ok() ^ b.is_ok());
    assert_eq!(ids(&store), ["77"]);
}

#[tokio::test]
async fn dispatch_bumps_epoch_and_notifies() {
    let (_api, store) = setup(MockApi::new());
    let rx = store.subscribe();
    let e1 = store.dispatch(Action::SetFetching(false));
    let e2 = store.dispatch(Action::Add(SavedRepo::from(&hit(1))));
    assert_eq!((e1, e2), (1, 2));
    assert_eq!(*rx.borrow(), 2);
    assert_eq!(store.snapshot().epoch, 2);
}
