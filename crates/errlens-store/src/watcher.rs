//! Change notifications for YAML rule files
//!
//! The watcher observes the rule file's parent directory rather than the
//! file itself, so a file that does not exist yet (the store reports that
//! as a missing relation) is picked up as soon as it is created.

use errlens_core::{Error, Result, RuleEventBus, StoreError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Quiet period that turns a burst of file events into one notification
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Publishes `RuleSetUpdated` on the bus whenever the rule file changes
pub struct YamlRuleWatcher {
    /// Held to keep the OS watch alive
    _watcher: RecommendedWatcher,
    handle: JoinHandle<()>,
}

impl YamlRuleWatcher {
    /// Watch `path` with the default debounce
    pub fn spawn(path: impl Into<PathBuf>, bus: RuleEventBus) -> Result<Self> {
        Self::with_debounce(path, bus, DEFAULT_DEBOUNCE)
    }

    /// Watch `path`, publishing once per burst of changes separated by `debounce`
    pub fn with_debounce(
        path: impl Into<PathBuf>,
        bus: RuleEventBus,
        debounce: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| Error::config(format!("rule path {} has no file name", path.display())))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
                match res {
                    Ok(event) if is_rule_change(&event, &file_name) => {
                        let _ = tx.send(());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Rule file watcher error: {}", e),
                }
            })
            .map_err(|e| watch_error(&dir, e))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(&dir, e))?;

        let handle = tokio::spawn(forward_changes(rx, bus, debounce));
        info!("Watching {} for rule changes", path.display());

        Ok(Self {
            _watcher: watcher,
            handle,
        })
    }

    /// Stop publishing change notifications
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for YamlRuleWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn is_rule_change(event: &Event, file_name: &OsStr) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| p.file_name() == Some(file_name))
}

fn watch_error(dir: &Path, err: notify::Error) -> Error {
    StoreError::Unavailable(format!("cannot watch {}: {}", dir.display(), err)).into()
}

async fn forward_changes(
    mut rx: mpsc::UnboundedReceiver<()>,
    bus: RuleEventBus,
    debounce: Duration,
) {
    while rx.recv().await.is_some() {
        // A single save usually produces several events
        let mut closed = false;
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        debug!("Rule file changed, publishing update");
        bus.notify_rules_updated();

        if closed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errlens_core::RuleEvent;
    use tempfile::TempDir;

    const RULES: &str = "rules:\n  - pattern: disk full\n    category: storage\n    match_type: exact\n";

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_created_file_publishes_update() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        let bus = RuleEventBus::default();
        let mut rx = bus.subscribe();

        let watcher =
            YamlRuleWatcher::with_debounce(&path, bus.clone(), Duration::from_millis(50)).unwrap();
        std::fs::write(&path, RULES).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no update published")
            .unwrap();
        assert_eq!(event, RuleEvent::RuleSetUpdated);

        watcher.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_other_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        let bus = RuleEventBus::default();
        let mut rx = bus.subscribe();

        let _watcher =
            YamlRuleWatcher::with_debounce(&path, bus.clone(), Duration::from_millis(50)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "unrelated").unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_of_writes_publishes_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        let bus = RuleEventBus::default();
        let mut rx = bus.subscribe();

        let _watcher =
            YamlRuleWatcher::with_debounce(&path, bus.clone(), Duration::from_millis(500)).unwrap();
        for _ in 0..5 {
            std::fs::write(&path, RULES).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no update published")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent").join("rules.yaml");

        let result = YamlRuleWatcher::spawn(&path, RuleEventBus::default());
        assert!(result.is_err());
    }
}
