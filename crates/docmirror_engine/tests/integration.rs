//! Integration tests for the bucket, feeds, replication and query views.

use docmirror_core::{
    BucketConfig, CancelFn, Callbacks, CollectionConfig, Completion, Document, RetryConfig,
    Selector, SyncOptions,
};
use docmirror_engine::{
    Bucket, EngineError, FeedState, MemoryStore, ReplicationState, StoreTarget, WriteOutcome,
};
use docmirror_testkit::{docs, ids_of, init_tracing, project};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const REMOTE: &str = "http://couch:5984";
const REMOTE_PROJECTS: &str = "http://couch:5984/projects";

fn bucket(store: &MemoryStore, config: BucketConfig) -> Bucket {
    init_tracing();
    Bucket::builder()
        .config(config)
        .store(store.clone())
        .build()
        .expect("bucket")
}

fn local_only(store: &MemoryStore) -> Bucket {
    bucket(store, BucketConfig::default())
}

fn one_shot(retry: bool) -> SyncOptions {
    SyncOptions {
        live: Some(false),
        retry: Some(retry),
        backoff: Some(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        ),
        ..SyncOptions::default()
    }
}

fn replicated(sync: SyncOptions, callbacks: Callbacks) -> BucketConfig {
    BucketConfig::new(
        CollectionConfig::new()
            .remote(REMOTE)
            .sync(sync)
            .callbacks(callbacks),
    )
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn cached_ids(bucket: &Bucket, name: &str) -> Vec<String> {
    bucket.get(name).map(|docs| ids_of(&docs)).unwrap_or_default()
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn open_fetches_existing_documents_in_order() {
    let store = MemoryStore::new();
    store.seed("projects", docs(["c", "a", "b"]));
    let bucket = local_only(&store);

    bucket.open("projects").unwrap();
    eventually("initial fetch", || cached_ids(&bucket, "projects").len() == 3).await;

    assert_eq!(cached_ids(&bucket, "projects"), vec!["a", "b", "c"]);
    assert_eq!(bucket.names(), vec!["projects"]);
}

#[tokio::test]
async fn open_twice_returns_the_same_handle() {
    let store = MemoryStore::new();
    store.seed("projects", docs(["a"]));
    let bucket = bucket(&store, replicated(SyncOptions::default(), Callbacks::default()));

    let first = bucket.open("projects").unwrap();
    let second = bucket.open("projects").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    eventually("initial fetch", || cached_ids(&bucket, "projects") == ["a"]).await;
    assert_eq!(store.open_count("projects"), 1);
    assert_eq!(store.fetch_count("projects"), 1);
    assert_eq!(store.session_count(), 1);
    assert_eq!(store.feed_count("projects"), 1);
}

#[tokio::test]
async fn unopened_collection_is_not_found() {
    let store = MemoryStore::new();
    let bucket = local_only(&store);

    assert!(matches!(
        bucket.get("projects"),
        Err(EngineError::NotFound { ref name }) if name == "projects"
    ));
    assert!(bucket.close("projects").await.is_ok());
}

#[tokio::test]
async fn close_releases_feed_and_replication() {
    let store = MemoryStore::new();
    let bucket = bucket(&store, replicated(SyncOptions::default(), Callbacks::default()));
    bucket.open("projects").unwrap();
    eventually("replication running", || {
        bucket.replication_state("projects").ok().flatten() == Some(ReplicationState::Paused)
    })
    .await;

    bucket.close("projects").await.unwrap();

    assert!(!bucket.is_open("projects"));
    assert!(bucket.get("projects").is_err());
    assert_eq!(store.feed_count("projects"), 0);
    // Closing again is a no-op
    bucket.close("projects").await.unwrap();
}

#[tokio::test]
async fn close_failure_still_releases_the_collection() {
    let store = MemoryStore::new();
    store.fail_close("projects");
    let bucket = local_only(&store);
    bucket.open("projects").unwrap();

    let err = bucket.close("projects").await.unwrap_err();

    assert!(matches!(err, EngineError::CloseFailure { ref name, .. } if name == "projects"));
    assert!(!bucket.is_open("projects"));
    assert_eq!(store.feed_count("projects"), 0);

    // The name can be opened again
    store.clear_faults();
    bucket.open("projects").unwrap();
    assert_eq!(store.open_count("projects"), 2);
}

#[tokio::test(start_paused = true)]
async fn fetch_completing_after_close_is_discarded() {
    let store = MemoryStore::new();
    store.seed("projects", docs(["a", "b"]));
    store.delay_fetch(Duration::from_secs(1));
    let bucket = local_only(&store);

    bucket.open("projects").unwrap();
    let version = bucket.watch("projects").unwrap();
    bucket.close("projects").await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(*version.borrow(), 0);
    assert!(bucket.state().is_empty());

    bucket.open("projects").unwrap();
    eventually("refetch", || cached_ids(&bucket, "projects").len() == 2).await;
}

#[tokio::test]
async fn shutdown_closes_every_collection() {
    let store = MemoryStore::new();
    let bucket = local_only(&store);
    bucket.open("projects").unwrap();
    bucket.open("people").unwrap();
    assert_eq!(bucket.names(), vec!["people", "projects"]);

    bucket.shutdown().await.unwrap();

    assert!(bucket.names().is_empty());
    assert_eq!(store.feed_count("projects"), 0);
    assert_eq!(store.feed_count("people"), 0);
}

#[tokio::test]
async fn remote_only_collection_has_no_cache() {
    let store = MemoryStore::new();
    let config = BucketConfig::from_json(json!({
        "config": {"remote": REMOTE},
        "audit": {"remoteOnly": true}
    }))
    .unwrap();
    let bucket = bucket(&store, config);

    let handle = bucket.open("audit").unwrap();

    assert_eq!(
        handle.target(),
        &StoreTarget::Remote(format!("{REMOTE}/audit"))
    );
    assert!(matches!(bucket.get("audit"), Err(EngineError::RemoteOnly { .. })));
    assert!(bucket.state().is_empty());
    assert_eq!(store.session_count(), 0);

    handle.put(Document::new("entry")).await.unwrap();
    assert_eq!(store.ids(&format!("{REMOTE}/audit")), vec!["entry"]);
}

#[tokio::test]
async fn open_with_layers_overrides_over_the_bucket() {
    let store = MemoryStore::new();
    let bucket = bucket(
        &store,
        BucketConfig::new(CollectionConfig::new().remote(REMOTE)),
    );

    let handle = bucket
        .open_with("audit", CollectionConfig::new().remote_only(true))
        .unwrap();

    assert_eq!(
        handle.target(),
        &StoreTarget::Remote(format!("{REMOTE}/audit"))
    );
    assert!(matches!(bucket.get("audit"), Err(EngineError::RemoteOnly { .. })));
    assert_eq!(store.session_count(), 0);
    // The bucket configuration itself is untouched
    assert!(!bucket.effective("audit").remote_only());

    // First opener wins
    let again = bucket.open_with("audit", CollectionConfig::new().remote_only(false)).unwrap();
    assert!(Arc::ptr_eq(&handle, &again));
    assert!(matches!(bucket.get("audit"), Err(EngineError::RemoteOnly { .. })));
}

#[tokio::test]
async fn failed_subscription_closes_the_store_handle() {
    let store = MemoryStore::new();
    store.fail_changes("projects");
    let bucket = local_only(&store);

    let err = bucket.open("projects").err().expect("open should fail");

    assert!(err.is_retryable());
    assert!(!bucket.is_open("projects"));
    eventually("handle closed", || store.close_count("projects") == 1).await;

    store.clear_faults();
    bucket.open("projects").unwrap();
    assert_eq!(store.feed_count("projects"), 1);
}

#[tokio::test]
async fn dropping_the_bucket_stops_its_feeds() {
    let store = MemoryStore::new();
    let changes = counter();
    let callbacks = Callbacks::default().on_change({
        let changes = Arc::clone(&changes);
        move |_, _| {
            changes.fetch_add(1, Ordering::SeqCst);
        }
    });
    let bucket = bucket(
        &store,
        BucketConfig::new(CollectionConfig::new().callbacks(callbacks)),
    );
    let handle = bucket.open("projects").unwrap();
    assert_eq!(store.feed_count("projects"), 1);

    drop(bucket);
    eventually("feed released", || store.feed_count("projects") == 0).await;

    handle.put(Document::new("late")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.ids("projects"), vec!["late"]);
    assert_eq!(changes.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Change feed
// ============================================================================

#[tokio::test]
async fn feed_upserts_and_deletes_in_place() {
    let store = MemoryStore::new();
    store.seed("projects", docs(["a", "c"]));
    let bucket = local_only(&store);
    let handle = bucket.open("projects").unwrap();
    eventually("initial fetch", || cached_ids(&bucket, "projects") == ["a", "c"]).await;

    let written = handle.put(Document::new("b")).await.unwrap();
    assert!(written.is_ok());
    eventually("insert", || cached_ids(&bucket, "projects") == ["a", "b", "c"]).await;

    let rev = written.rev.clone();
    let removed = handle.put(Document::tombstone("b", rev)).await.unwrap();
    assert!(removed.is_ok());
    eventually("delete", || cached_ids(&bucket, "projects") == ["a", "c"]).await;

    assert_eq!(bucket.feed_state("projects").unwrap(), FeedState::Active);
}

#[tokio::test]
async fn feed_callbacks_receive_the_collection_name() {
    let store = MemoryStore::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let errors = counter();
    let callbacks = Callbacks::default()
        .on_change({
            let seen = Arc::clone(&seen);
            move |name, change| seen.lock().push(format!("{name}:{}", change.id))
        })
        .on_error({
            let errors = Arc::clone(&errors);
            move |_, _| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        });
    let bucket = bucket(
        &store,
        BucketConfig::new(CollectionConfig::new().callbacks(callbacks)),
    );
    let handle = bucket.open("projects").unwrap();

    handle.put(project("p1", "ann", 2021)).await.unwrap();
    eventually("change callback", || seen.lock().len() == 1).await;
    assert_eq!(seen.lock().as_slice(), ["projects:p1"]);

    store.broadcast("projects", docmirror_core::FeedEvent::Error("disk full".into()));
    eventually("error callback", || errors.load(Ordering::SeqCst) == 1).await;
    assert_eq!(bucket.feed_state("projects").unwrap(), FeedState::Error);
}

#[tokio::test]
async fn failed_fetch_is_reported_through_on_error() {
    let store = MemoryStore::new();
    store.fail_fetch("projects");
    let errors = counter();
    let callbacks = Callbacks::default().on_error({
        let errors = Arc::clone(&errors);
        move |_, _| {
            errors.fetch_add(1, Ordering::SeqCst);
        }
    });
    let bucket = bucket(
        &store,
        BucketConfig::new(CollectionConfig::new().callbacks(callbacks)),
    );

    bucket.open("projects").unwrap();
    eventually("fetch error", || errors.load(Ordering::SeqCst) == 1).await;
    assert!(bucket.get("projects").unwrap().is_empty());
}

// ============================================================================
// Replication
// ============================================================================

#[tokio::test]
async fn one_shot_replication_fills_cache_and_remote() {
    let store = MemoryStore::new();
    store.seed(REMOTE_PROJECTS, docs(["r1", "r2"]));
    store.seed("projects", docs(["l1"]));
    let completions = counter();
    let callbacks = Callbacks::default().on_complete({
        let completions = Arc::clone(&completions);
        move |_, completion| {
            if matches!(completion, Completion::Replication) {
                completions.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    let bucket = bucket(&store, replicated(one_shot(true), callbacks));

    bucket.open("projects").unwrap();
    let state = bucket.wait_replication("projects").await.unwrap();

    assert_eq!(state, Some(ReplicationState::Complete));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(store.ids(REMOTE_PROJECTS), vec!["l1", "r1", "r2"]);
    eventually("pulled documents", || {
        cached_ids(&bucket, "projects") == ["l1", "r1", "r2"]
    })
    .await;

    let stats = bucket.replication_stats("projects").unwrap().unwrap();
    assert_eq!(stats.sessions_started, 1);
    assert_eq!(stats.docs_written, 3);
}

#[tokio::test]
async fn live_replication_pushes_local_writes() {
    let store = MemoryStore::new();
    let bucket = bucket(&store, replicated(SyncOptions::default(), Callbacks::default()));
    let handle = bucket.open("projects").unwrap();

    handle.put(Document::new("fresh")).await.unwrap();

    eventually("push", || store.ids(REMOTE_PROJECTS) == ["fresh"]).await;
    assert!(bucket.replication_state("projects").unwrap().unwrap().is_running());
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_is_retried() {
    let store = MemoryStore::new();
    store.fail_next_session("connection reset", true);
    let errors = counter();
    let callbacks = Callbacks::default().on_error({
        let errors = Arc::clone(&errors);
        move |_, _| {
            errors.fetch_add(1, Ordering::SeqCst);
        }
    });
    let bucket = bucket(&store, replicated(one_shot(true), callbacks));

    bucket.open("projects").unwrap();
    let state = bucket.wait_replication("projects").await.unwrap();

    assert_eq!(state, Some(ReplicationState::Complete));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(store.session_count(), 2);
    let stats = bucket.replication_stats("projects").unwrap().unwrap();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.last_error.as_deref().map(|e| e.contains("connection reset")), Some(true));
}

#[tokio::test(start_paused = true)]
async fn failure_without_retry_is_final() {
    let store = MemoryStore::new();
    store.fail_next_session("connection reset", true);
    let bucket = bucket(&store, replicated(one_shot(false), Callbacks::default()));

    bucket.open("projects").unwrap();
    let state = bucket.wait_replication("projects").await.unwrap();

    assert_eq!(state, Some(ReplicationState::Failed));
    assert_eq!(store.session_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_is_not_retried() {
    let store = MemoryStore::new();
    store.fail_next_session("unauthorized", false);
    let bucket = bucket(&store, replicated(one_shot(true), Callbacks::default()));

    bucket.open("projects").unwrap();

    assert_eq!(
        bucket.wait_replication("projects").await.unwrap(),
        Some(ReplicationState::Failed)
    );
    assert_eq!(store.session_count(), 1);
}

#[tokio::test]
async fn denied_documents_fire_on_denied() {
    let store = MemoryStore::new();
    store.seed("projects", docs(["l1", "l2"]));
    store.deny_replication(REMOTE_PROJECTS);
    let denied = counter();
    let callbacks = Callbacks::default().on_denied({
        let denied = Arc::clone(&denied);
        move |_, _| {
            denied.fetch_add(1, Ordering::SeqCst);
        }
    });
    let bucket = bucket(&store, replicated(one_shot(true), callbacks));

    bucket.open("projects").unwrap();
    bucket.wait_replication("projects").await.unwrap();

    assert_eq!(denied.load(Ordering::SeqCst), 2);
    assert!(store.ids(REMOTE_PROJECTS).is_empty());
    let stats = bucket.replication_stats("projects").unwrap().unwrap();
    assert_eq!(stats.docs_denied, 2);
}

#[tokio::test]
async fn cancel_callback_stops_feed_and_replication() {
    let store = MemoryStore::new();
    let slot: Arc<Mutex<Option<CancelFn>>> = Arc::new(Mutex::new(None));
    let callbacks = Callbacks::default().cancel({
        let slot = Arc::clone(&slot);
        move |_, cancel| *slot.lock() = Some(Arc::clone(cancel))
    });
    let bucket = bucket(&store, replicated(SyncOptions::default(), callbacks));

    bucket.open("projects").unwrap();
    let cancel = slot.lock().clone().expect("cancel handed out on open");
    cancel();

    eventually("feed closed", || {
        bucket.feed_state("projects").ok() == Some(FeedState::Closed)
    })
    .await;
    assert_eq!(
        bucket.replication_state("projects").unwrap(),
        Some(ReplicationState::Stopped)
    );
    // The collection stays open until closed
    assert!(bucket.is_open("projects"));
    bucket.close("projects").await.unwrap();
    cancel();
}

// ============================================================================
// Query views
// ============================================================================

#[tokio::test]
async fn view_filters_the_current_cache() {
    let store = MemoryStore::new();
    store.seed(
        "projects",
        vec![
            project("p2", "bo", 2019),
            project("p1", "ann", 2021),
            Document::new("note").with_field("type", "note"),
        ],
    );
    let bucket = local_only(&store);
    bucket.open("projects").unwrap();
    eventually("initial fetch", || cached_ids(&bucket, "projects").len() == 3).await;

    let live = bucket
        .define(Selector::parse(json!({"_deleted": false})).unwrap())
        .bind("projects");
    let recent = bucket
        .define(Selector::parse(json!({"type": "project", "year": {"$gte": 2020}})).unwrap())
        .bind("projects");

    assert_eq!(ids_of(&live.get().unwrap()), vec!["note", "p1", "p2"]);
    assert_eq!(ids_of(&recent.get().unwrap()), vec!["p1"]);
}

#[tokio::test(start_paused = true)]
async fn debounced_sets_write_only_the_last_payload() {
    let store = MemoryStore::new();
    let bucket = local_only(&store);
    bucket.open("projects").unwrap();
    let view = bucket
        .define(Selector::parse(json!({"_deleted": false})).unwrap())
        .bind("projects");

    let first = view.set(Document::new("draft")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = view
        .set(vec![Document::new("x"), Document::new("y")])
        .unwrap();

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(store.bulk_count("projects"), 0);
    assert!(view.is_pending());

    assert_eq!(first.outcome().await.unwrap(), WriteOutcome::Superseded);
    let WriteOutcome::Written(results) = second.outcome().await.unwrap() else {
        panic!("expected the second payload to be written");
    };
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(store.bulk_count("projects"), 1);
    assert_eq!(store.ids("projects"), vec!["x", "y"]);

    eventually("written documents in view", || {
        view.get().map(|docs| ids_of(&docs)).unwrap_or_default() == ["x", "y"]
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn configured_debounce_window_is_used() {
    let store = MemoryStore::new();
    let config = BucketConfig::default().collection(
        "projects",
        CollectionConfig::new().debounce(Duration::from_millis(50)),
    );
    let bucket = bucket(&store, config);
    bucket.open("projects").unwrap();
    let view = bucket.define(|_: &Document| true).bind("projects");

    let ticket = view.set(Document::new("a")).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(!view.is_pending());
    assert!(matches!(ticket.outcome().await, Ok(WriteOutcome::Written(_))));
}

#[tokio::test]
async fn flush_and_cancel_settle_pending_writes() {
    let store = MemoryStore::new();
    let bucket = local_only(&store);
    bucket.open("projects").unwrap();
    let view = bucket.define(|_: &Document| true).bind("projects");

    let flushed = view.set(Document::new("now")).unwrap();
    assert!(view.flush().await);
    assert!(matches!(flushed.outcome().await, Ok(WriteOutcome::Written(_))));
    assert!(!view.flush().await);

    let cancelled = view.set(Document::new("never")).unwrap();
    assert!(view.cancel());
    assert!(matches!(cancelled.outcome().await, Err(EngineError::Cancelled)));
    assert_eq!(store.ids("projects"), vec!["now"]);
}

#[tokio::test]
async fn write_back_failure_is_reported() {
    let store = MemoryStore::new();
    store.fail_writes("projects");
    let bucket = local_only(&store);
    bucket.open("projects").unwrap();
    let view = bucket.define(|_: &Document| true).bind("projects");

    let ticket = view.set(Document::new("a")).unwrap();
    view.flush().await;

    assert!(matches!(
        ticket.outcome().await,
        Err(EngineError::WriteFailure { .. })
    ));
}

#[tokio::test]
async fn conflicting_write_is_reported_per_document() {
    let store = MemoryStore::new();
    store.seed("projects", docs(["a"]));
    let bucket = local_only(&store);
    bucket.open("projects").unwrap();
    let view = bucket.define(|_: &Document| true).bind("projects");

    let ticket = view
        .set(vec![Document::new("a"), Document::new("b")])
        .unwrap();
    view.flush().await;

    let WriteOutcome::Written(results) = ticket.outcome().await.unwrap() else {
        panic!("expected a written outcome");
    };
    assert_eq!(results[0].error.as_deref(), Some("conflict"));
    assert!(results[1].is_ok());
}

#[tokio::test]
async fn rebinding_redirects_reads() {
    let store = MemoryStore::new();
    store.seed("people", docs(["ann"]));
    let bucket = local_only(&store);
    bucket.open("projects").unwrap();
    bucket.open("people").unwrap();
    eventually("people fetched", || cached_ids(&bucket, "people") == ["ann"]).await;

    let view = bucket.define(|_: &Document| true).bind("projects");
    assert!(view.get().unwrap().is_empty());
    view.rebind("people");
    assert_eq!(view.collection().as_deref(), Some("people"));
    assert_eq!(ids_of(&view.get().unwrap()), vec!["ann"]);
}
