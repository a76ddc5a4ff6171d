//! Reload protocol tests
//!
//! Uses a gated store whose fetch blocks until released, so tests can hold
//! a reload "in flight" and observe what concurrent callers do.

use async_trait::async_trait;
use errlens_core::{Rule, RuleStore, StoreError};
use errlens_detector::{DetectionEngine, ReloadOutcome};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// A store whose fetches wait for an explicit release
pub struct GatedStore {
    rules: Mutex<Vec<Rule>>,
    failure: Mutex<Option<StoreError>>,
    gate: Semaphore,
    fetching: Notify,
    fetch_count: AtomicU64,
}

impl GatedStore {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: Mutex::new(rules),
            failure: Mutex::new(None),
            gate: Semaphore::new(0),
            fetching: Notify::new(),
            fetch_count: AtomicU64::new(0),
        }
    }

    pub fn set_rules(&self, rules: Vec<Rule>) {
        *self.rules.lock() = rules;
    }

    pub fn fail_with(&self, failure: Option<StoreError>) {
        *self.failure.lock() = failure;
    }

    /// Let one pending (or future) fetch complete
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Wait until a fetch has started
    pub async fn wait_until_fetching(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.fetching.notified())
            .await
            .expect("fetch never started");
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleStore for GatedStore {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, StoreError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.fetching.notify_one();

        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();

        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }
        Ok(self.rules.lock().clone())
    }

    fn name(&self) -> &str {
        "gated"
    }
}

fn setup(rules: Vec<Rule>) -> (Arc<GatedStore>, Arc<DetectionEngine>) {
    let store = Arc::new(GatedStore::new(rules));
    let engine = Arc::new(DetectionEngine::new(store.clone()));
    (store, engine)
}

#[tokio::test]
async fn test_concurrent_reload_is_skipped() {
    let (store, engine) = setup(vec![Rule::contains("timeout", "network")]);

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.reload().await }
    });
    store.wait_until_fetching().await;
    assert!(engine.stats().is_reloading);

    let second = engine.reload().await.unwrap();
    assert_eq!(second, ReloadOutcome::Skipped);

    store.release();
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, ReloadOutcome::Completed(ref report) if report.contains == 1));

    assert_eq!(store.fetch_count(), 1);
    assert!(!engine.stats().is_reloading);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_detects_share_one_fetch() {
    let (store, engine) = setup(vec![Rule::contains("refused", "network")]);

    let callers: Vec<_> = (0..32)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.detect(format!("connection {} refused", i).as_str()).await })
        })
        .collect();

    store.wait_until_fetching().await;
    // Give the other callers time to pile up behind the initial load
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.release();

    let results = futures::future::join_all(callers).await;
    for result in results {
        let result = result.unwrap();
        assert!(result.matched);
        assert_eq!(result.category.as_deref(), Some("network"));
    }
    assert_eq!(store.fetch_count(), 1);
}

#[tokio::test]
async fn test_initialization_waits_for_in_flight_reload() {
    let (store, engine) = setup(vec![Rule::exact("disk full", "storage")]);

    let reload = tokio::spawn({
        let engine = engine.clone();
        async move { engine.reload().await }
    });
    store.wait_until_fetching().await;

    let detect = tokio::spawn({
        let engine = engine.clone();
        async move { engine.detect("Disk Full").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!detect.is_finished());

    store.release();
    reload.await.unwrap().unwrap();

    let result = detect.await.unwrap();
    assert!(result.matched);
    assert_eq!(store.fetch_count(), 1);
}

#[tokio::test]
async fn test_detect_now_never_waits_for_a_load() {
    let (store, engine) = setup(vec![Rule::contains("panic", "crash")]);

    let result = engine.detect_now("kernel panic");
    assert!(!result.matched);

    store.wait_until_fetching().await;
    // Still loading: the non-waiting path keeps answering immediately
    assert!(!engine.detect_now("kernel panic").matched);

    store.release();
    tokio::time::timeout(Duration::from_secs(5), engine.ensure_initialized())
        .await
        .unwrap();

    assert!(engine.detect_now("kernel panic").matched);
    assert_eq!(store.fetch_count(), 1);
}

#[tokio::test]
async fn test_lookups_see_old_snapshot_until_swap() {
    let (store, engine) = setup(vec![Rule::contains("timeout", "network")]);

    store.release();
    engine.reload().await.unwrap();

    store.set_rules(vec![Rule::contains("refused", "network")]);
    let reload = tokio::spawn({
        let engine = engine.clone();
        async move { engine.reload().await }
    });
    store.wait_until_fetching().await;

    assert!(engine.detect("read timeout").await.matched);
    assert!(!engine.detect("connection refused").await.matched);

    store.release();
    reload.await.unwrap().unwrap();

    assert!(!engine.detect("read timeout").await.matched);
    assert!(engine.detect("connection refused").await.matched);
}

#[tokio::test]
async fn test_failed_reload_releases_lock() {
    let (store, engine) = setup(vec![Rule::contains("timeout", "network")]);

    store.fail_with(Some(StoreError::Unavailable("connection reset".into())));
    store.release();
    assert!(engine.reload().await.is_err());
    assert!(!engine.stats().is_reloading);

    store.fail_with(None);
    store.release();
    let outcome = engine.reload().await.unwrap();
    assert!(matches!(outcome, ReloadOutcome::Completed(_)));
    assert_eq!(store.fetch_count(), 2);
}
