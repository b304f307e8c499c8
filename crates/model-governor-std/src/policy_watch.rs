// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Policy hot reload.
//!
//! [`PolicyWatcher`] re-reads the policy document on every tick and compares
//! it with the contents it saw last.  Any difference, including a same-size
//! edit landing within the filesystem's timestamp granularity, is handed to the
//! [`PolicyStore`] to swap in.  An unreadable or invalid document is logged and
//! ignored; the previous snapshot stays authoritative.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use model_governor_core::policy::PolicyStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background task that keeps a [`PolicyStore`] in sync with a file.
pub struct PolicyWatcher;

impl PolicyWatcher {
    /// Poll `path` every `interval` until `cancel` fires.
    pub fn spawn(
        store: Arc<PolicyStore>,
        path: impl Into<PathBuf>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let path = path.into();
        tokio::spawn(async move { watch(store, path, interval, cancel).await })
    }
}

async fn watch(store: Arc<PolicyStore>, path: PathBuf, interval: Duration, cancel: CancellationToken) {
    let mut last = tokio::fs::read_to_string(&path).await.ok();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(path = %path.display(), interval_ms = interval.as_millis() as u64, "watching policy file");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Some(raw),
            Err(error) => {
                if last.is_some() {
                    warn!(path = %path.display(), %error, "policy file unreadable; keeping current snapshot");
                }
                None
            }
        };
        if current == last {
            continue;
        }
        if let Some(raw) = &current {
            // The store logs both the swap and the rejection.
            let _ = store.reload_from_str(raw);
        }
        last = current;
    }
    debug!(path = %path.display(), "policy watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_governor_core::policy::PolicySnapshot;

    const INITIAL: &str = r#"{"maxInFlight":1,"dailyBudgetCents":10,"allowedModels":["m"]}"#;

    async fn wait_for(store: &PolicyStore, version: u64) -> bool {
        for _ in 0..200 {
            if store.version() >= version {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn swaps_valid_edits_and_keeps_snapshot_on_invalid_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, INITIAL).unwrap();

        let store = Arc::new(PolicyStore::new(PolicySnapshot::from_json(INITIAL).unwrap()));
        let cancel = CancellationToken::new();
        let handle = PolicyWatcher::spawn(store.clone(), &path, Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        std::fs::write(
            &path,
            r#"{"maxInFlight":5,"dailyBudgetCents":1000,"allowedModels":["m","n"]}"#,
        )
        .unwrap();
        assert!(wait_for(&store, 2).await);
        assert_eq!(store.current().max_in_flight, 5);

        std::fs::write(&path, "{ this is not a policy").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.version(), 2);
        assert_eq!(store.current().max_in_flight, 5);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn same_size_edit_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, INITIAL).unwrap();

        let store = Arc::new(PolicyStore::new(PolicySnapshot::from_json(INITIAL).unwrap()));
        let cancel = CancellationToken::new();
        let handle = PolicyWatcher::spawn(store.clone(), &path, Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let edited = INITIAL.replace("\"maxInFlight\":1", "\"maxInFlight\":7");
        assert_eq!(edited.len(), INITIAL.len());
        std::fs::write(&path, &edited).unwrap();

        assert!(wait_for(&store, 2).await);
        assert_eq!(store.current().max_in_flight, 7);

        cancel.cancel();
        handle.await.unwrap();
    }
}
