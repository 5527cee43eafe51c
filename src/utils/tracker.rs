use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Snapshot of batch install progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallStatus {
    pub total_modules: usize,
    /// 1-based, for display
    pub current_module_ordinal: usize,
    pub current_module_name: String,
    pub failed_modules: Vec<String>,
}

impl InstallStatus {
    pub fn has_failures(&self) -> bool {
        !self.failed_modules.is_empty()
    }
}

/// Where a batch run currently stands.
///
/// Every update publishes a whole new [`InstallStatus`], so observers holding
/// a receiver never see a half-applied change. Writes come from the
/// orchestrator only and are serialized by it.
#[derive(Debug, Clone)]
pub struct InstallStatusTracker {
    tx: Arc<watch::Sender<InstallStatus>>,
}

impl Default for InstallStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallStatusTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(InstallStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> InstallStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallStatus> {
        self.tx.subscribe()
    }

    fn publish(&self, update: impl FnOnce(&mut InstallStatus)) {
        let mut next = self.snapshot();
        update(&mut next);
        debug!(
            "Install status: {}/{} {:?} failed={:?}",
            next.current_module_ordinal,
            next.total_modules,
            next.current_module_name,
            next.failed_modules
        );
        self.tx.send_replace(next);
    }

    /// Start a fresh batch of `total` modules
    pub fn reset(&self, total: usize) {
        self.publish(|status| {
            *status = InstallStatus {
                total_modules: total,
                current_module_ordinal: if total > 0 { 1 } else { 0 },
                ..InstallStatus::default()
            }
        });
    }

    pub fn begin_module(&self, ordinal: usize, name: &str) {
        self.publish(|status| {
            status.current_module_ordinal = ordinal;
            status.current_module_name = name.to_string();
        });
    }

    /// Mark the current module as failed
    pub fn fail_current(&self) {
        self.publish(|status| {
            let name = status.current_module_name.clone();
            status.failed_modules.push(name);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_starts_at_first_module() {
        let tracker = InstallStatusTracker::new();
        tracker.begin_module(2, "old");
        tracker.fail_current();

        tracker.reset(3);

        assert_eq!(
            tracker.snapshot(),
            InstallStatus {
                total_modules: 3,
                current_module_ordinal: 1,
                current_module_name: String::new(),
                failed_modules: vec![],
            }
        );
    }

    #[test]
    fn failures_are_appended_in_order() {
        let tracker = InstallStatusTracker::new();
        tracker.reset(3);
        tracker.begin_module(1, "Alpha");
        tracker.fail_current();
        tracker.begin_module(3, "Gamma");
        tracker.fail_current();

        let status = tracker.snapshot();
        assert_eq!(status.failed_modules, vec!["Alpha", "Gamma"]);
        assert!(status.has_failures());
    }

    #[tokio::test]
    async fn observers_see_whole_snapshots() {
        let tracker = InstallStatusTracker::new();
        let mut rx = tracker.subscribe();

        tracker.reset(2);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().total_modules, 2);

        tracker.begin_module(2, "Beta");
        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.current_module_ordinal, 2);
        assert_eq!(seen.current_module_name, "Beta");
    }
}
