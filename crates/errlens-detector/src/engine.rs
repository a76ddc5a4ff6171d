//! Detection engine
//!
//! Owns the current [`RuleSnapshot`] and the protocol for replacing it.
//!
//! - At most one fetch-and-swap runs at a time. [`DetectionEngine::reload`]
//!   returns [`ReloadOutcome::Skipped`] instead of queueing behind one that
//!   is already running.
//! - The first async lookup waits for the initial load (or for a load that
//!   is already in flight) so it never sees a half-built snapshot.
//! - A failed fetch leaves the previous snapshot untouched.

use chrono::{DateTime, Utc};
use errlens_core::{DetectionResult, Result, RuleEvent, RuleEventBus, RuleStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DetectorConfig;
use crate::safety::SafetyScreen;
use crate::snapshot::{ReloadReport, RuleSnapshot};

/// Result of a reload request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReloadOutcome {
    /// Another reload was in progress; nothing was fetched
    Skipped,
    /// A new snapshot was installed
    Completed(ReloadReport),
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub contains_count: usize,
    pub exact_count: usize,
    pub regex_count: usize,
    pub total_count: usize,
    pub last_reload: Option<DateTime<Utc>>,
    pub is_reloading: bool,
    pub initialized: bool,
    pub rejected_unsafe: usize,
    pub invalid_rules: usize,
}

/// Multi-tier error message classifier over a rule store
pub struct DetectionEngine {
    store: Arc<dyn RuleStore>,
    config: DetectorConfig,
    screen: SafetyScreen,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    load_lock: Mutex<()>,
    reloading: AtomicBool,
    init: OnceCell<()>,
    init_spawned: AtomicBool,
    /// Fetch-and-swap cycles that ran to completion, successful or not
    attempts: AtomicU64,
}

impl DetectionEngine {
    /// Create an engine with default settings
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self::with_config(store, DetectorConfig::default())
    }

    /// Create an engine with explicit settings
    pub fn with_config(store: Arc<dyn RuleStore>, config: DetectorConfig) -> Self {
        Self {
            store,
            screen: config.safety_screen(),
            config,
            snapshot: RwLock::new(Arc::new(RuleSnapshot::empty())),
            load_lock: Mutex::new(()),
            reloading: AtomicBool::new(false),
            init: OnceCell::new(),
            init_spawned: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        }
    }

    /// Fetch the rule set and install a new snapshot
    ///
    /// Returns [`ReloadOutcome::Skipped`] immediately when another reload is
    /// running. On a store failure the current snapshot is kept and the
    /// error is returned.
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        let guard = match self.load_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Rule reload already in progress, skipping");
                metrics::counter!("errlens_reloads_total", "outcome" => "skipped").increment(1);
                return Ok(ReloadOutcome::Skipped);
            }
        };

        self.load_locked(guard).await.map(ReloadOutcome::Completed)
    }

    /// Make sure the first load has happened
    ///
    /// Concurrent callers share one initialization. If a reload is already
    /// running, this waits for it instead of starting another. The engine
    /// counts as initialized even when that load failed; later change
    /// notifications retry.
    pub async fn ensure_initialized(&self) {
        // Once any load has finished, lookups never wait on later reloads
        if self.attempts.load(Ordering::SeqCst) > 0 {
            return;
        }

        self.init
            .get_or_init(|| async {
                let guard = self.load_lock.lock().await;
                if self.attempts.load(Ordering::SeqCst) > 0 {
                    debug!("Initial rule load already completed by another reload");
                    return;
                }
                if let Err(e) = self.load_locked(guard).await {
                    debug!("Initial rule load failed, continuing in degraded mode: {}", e);
                }
            })
            .await;
    }

    /// Whether a first load has completed (successfully or not)
    pub fn is_initialized(&self) -> bool {
        self.init.initialized() || self.attempts.load(Ordering::SeqCst) > 0
    }

    async fn load_locked(&self, _guard: MutexGuard<'_, ()>) -> Result<ReloadReport> {
        let _flag = ReloadingFlag::raise(&self.reloading);
        let result = self.fetch_and_swap().await;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn fetch_and_swap(&self) -> Result<ReloadReport> {
        let started = Instant::now();
        info!("Loading error patterns from {}", self.store.name());

        let rules = match self.store.fetch_rules().await {
            Ok(rules) => rules,
            Err(e) if e.is_missing_relation() => {
                warn!(
                    "Error pattern table not available yet (pending migration?), keeping current rules: {}",
                    e
                );
                metrics::counter!("errlens_reloads_total", "outcome" => "missing_relation")
                    .increment(1);
                return Err(e.into());
            }
            Err(e) => {
                error!("Failed to load error patterns, keeping current rules: {}", e);
                metrics::counter!("errlens_reloads_total", "outcome" => "error").increment(1);
                return Err(e.into());
            }
        };

        let fetched = rules.len();
        let snapshot = RuleSnapshot::build(rules, &self.screen, &self.config)
            .finish(Utc::now(), started.elapsed().as_millis() as u64);
        let report = snapshot.report().clone();

        *self.snapshot.write() = Arc::new(snapshot);

        metrics::counter!("errlens_reloads_total", "outcome" => "completed").increment(1);
        metrics::histogram!("errlens_reload_duration_us")
            .record(started.elapsed().as_micros() as f64);
        metrics::gauge!("errlens_rules_loaded", "tier" => "contains").set(report.contains as f64);
        metrics::gauge!("errlens_rules_loaded", "tier" => "exact").set(report.exact as f64);
        metrics::gauge!("errlens_rules_loaded", "tier" => "regex").set(report.regex as f64);

        info!(
            "Loaded {} of {} error patterns ({} contains, {} exact, {} regex, {} rejected as unsafe, {} invalid) in {}ms",
            report.total(),
            fetched,
            report.contains,
            report.exact,
            report.regex,
            report.rejected_unsafe,
            report.invalid,
            report.duration_ms
        );

        Ok(report)
    }

    /// Classify a message, waiting for the first load if necessary
    ///
    /// Empty or absent input is "not matched" and never touches the store.
    pub async fn detect<'a>(&self, message: impl Into<Option<&'a str>>) -> DetectionResult {
        let Some(message) = message.into().filter(|m| !m.is_empty()) else {
            return DetectionResult::not_matched();
        };

        self.ensure_initialized().await;
        let result = self.current().detect(message);
        record_detection(&result);
        result
    }

    /// Classify a message without ever waiting
    ///
    /// Before the first load completes this starts one in the background on
    /// the current tokio runtime and reports "not matched".
    pub fn detect_now<'a>(self: &Arc<Self>, message: impl Into<Option<&'a str>>) -> DetectionResult {
        let Some(message) = message.into().filter(|m| !m.is_empty()) else {
            return DetectionResult::not_matched();
        };

        if !self.is_initialized() {
            self.spawn_initialization();
            metrics::counter!("errlens_detections_total", "result" => "cold", "match_type" => "none")
                .increment(1);
            return DetectionResult::not_matched();
        }

        let result = self.current().detect(message);
        record_detection(&result);
        result
    }

    fn spawn_initialization(self: &Arc<Self>) {
        if self.init_spawned.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = Arc::clone(self);
                handle.spawn(async move {
                    engine.ensure_initialized().await;
                });
            }
            Err(_) => {
                self.init_spawned.store(false, Ordering::SeqCst);
                warn!("No tokio runtime available, cannot start background rule load");
            }
        }
    }

    /// The snapshot lookups currently run against
    pub fn current(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&*self.snapshot.read())
    }

    /// Counts per tier and reload state
    pub fn stats(&self) -> EngineStats {
        let snapshot = self.current();
        let report = snapshot.report();

        EngineStats {
            contains_count: snapshot.contains_count(),
            exact_count: snapshot.exact_count(),
            regex_count: snapshot.regex_count(),
            total_count: snapshot.total_count(),
            last_reload: snapshot.loaded_at(),
            is_reloading: self.reloading.load(Ordering::SeqCst),
            initialized: self.is_initialized(),
            rejected_unsafe: report.rejected_unsafe,
            invalid_rules: report.invalid,
        }
    }

    /// True iff no rule is installed in any tier
    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    /// Reload on every `RuleSetUpdated` event published on `bus`
    ///
    /// The task holds only a weak reference and stops when the engine is
    /// dropped, the bus closes, or the returned handle is shut down.
    pub fn subscribe(self: &Arc<Self>, bus: &RuleEventBus) -> RuleSubscription {
        let receiver = bus.subscribe();
        let engine = Arc::downgrade(self);
        let handle = tokio::spawn(run_subscription(engine, receiver));

        info!("Subscribed to '{}' events", RuleEvent::RuleSetUpdated.name());
        RuleSubscription { handle }
    }
}

async fn run_subscription(
    engine: Weak<DetectionEngine>,
    mut receiver: tokio::sync::broadcast::Receiver<RuleEvent>,
) {
    loop {
        match receiver.recv().await {
            Ok(RuleEvent::RuleSetUpdated) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} rule events, reloading once", missed);
            }
            Err(RecvError::Closed) => {
                debug!("Rule event bus closed, stopping subscription");
                break;
            }
        }

        let Some(engine) = engine.upgrade() else {
            break;
        };

        match engine.reload().await {
            Ok(ReloadOutcome::Completed(_)) => {}
            Ok(ReloadOutcome::Skipped) => {
                debug!("Rule change ignored, a reload is already running");
            }
            Err(e) => {
                // Already logged with its severity; never propagate
                debug!("Event-triggered rule reload failed: {}", e);
            }
        }
    }
}

/// Handle to a running event subscription
///
/// Dropping the handle stops the subscription.
pub struct RuleSubscription {
    handle: JoinHandle<()>,
}

impl RuleSubscription {
    /// Stop reacting to rule events
    pub fn shutdown(self) {
        self.handle.abort();
    }

    /// Whether the subscription task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RuleSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Keeps `is_reloading` accurate even if the reload future is dropped
struct ReloadingFlag<'a>(&'a AtomicBool);

impl<'a> ReloadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ReloadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn record_detection(result: &DetectionResult) {
    let (outcome, match_type) = match &result.match_type {
        Some(match_type) if result.matched => ("matched", match_type.as_str().to_string()),
        _ => ("not_matched", "none".to_string()),
    };
    metrics::counter!("errlens_detections_total", "result" => outcome, "match_type" => match_type)
        .increment(1);
}
