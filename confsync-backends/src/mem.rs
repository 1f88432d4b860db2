//! In-memory backend with broadcast change notification.
//!
//! Used by the test suites and selectable as the `mem` backend. Every
//! mutation bumps a global version and records it against the touched key; a
//! `tokio::sync::watch` channel wakes *all* long-poll waiters, and each
//! waiter re-checks its own subscription against the per-key versions. That
//! gives at-least-once "something changed" delivery to every subscriber — a
//! change that lands while a waiter is away (e.g. mid-pipeline) is still
//! observed on its next poll, because the per-key version stays ahead of the
//! waiter's index.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{BackendError, StoreClient};

#[derive(Debug, Default)]
struct MemState {
    values: HashMap<String, String>,
    /// Global version at which each key last changed.
    key_versions: HashMap<String, u64>,
    version: u64,
}

#[derive(Debug)]
pub struct MemClient {
    state: RwLock<MemState>,
    notify_tx: watch::Sender<u64>,
}

impl Default for MemClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemClient {
    pub fn new() -> Self {
        let (notify_tx, _) = watch::channel(1);
        MemClient {
            state: RwLock::new(MemState {
                version: 1,
                ..MemState::default()
            }),
            notify_tx,
        }
    }

    /// Insert or overwrite a key and wake every watcher.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let version = {
            let mut state = self.state.write().expect("mem state poisoned");
            state.version += 1;
            let version = state.version;
            state.values.insert(key.clone(), value.into());
            state.key_versions.insert(key, version);
            version
        };
        let _ = self.notify_tx.send(version);
    }

    /// Delete a key and wake every watcher.
    pub fn remove(&self, key: &str) {
        let version = {
            let mut state = self.state.write().expect("mem state poisoned");
            state.version += 1;
            let version = state.version;
            state.values.remove(key);
            state.key_versions.insert(key.to_string(), version);
            version
        };
        let _ = self.notify_tx.send(version);
    }

    fn changed_since(&self, keys: &[String], wait_index: u64) -> Option<u64> {
        let state = self.state.read().expect("mem state poisoned");
        let woken = keys
            .iter()
            .any(|k| state.key_versions.get(k).copied().unwrap_or(0) > wait_index);
        woken.then_some(state.version)
    }
}

#[async_trait]
impl StoreClient for MemClient {
    async fn get_values(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, String>, BackendError> {
        let state = self.state.read().expect("mem state poisoned");
        let mut values = HashMap::new();
        for key in keys {
            if let Some(value) = state.values.get(key) {
                values.insert(key.clone(), value.clone());
            }
        }
        Ok(values)
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        keys: &[String],
        wait_index: u64,
    ) -> Result<u64, BackendError> {
        if wait_index == 0 {
            return Ok(1);
        }

        let mut notify_rx = self.notify_tx.subscribe();
        loop {
            if let Some(version) = self.changed_since(keys, wait_index) {
                return Ok(version);
            }
            notify_rx
                .changed()
                .await
                .map_err(|_| BackendError::WatchClosed)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn fetch_omits_unknown_keys() {
        let client = MemClient::new();
        client.set("/app/db/host", "10.0.0.1");
        let values = client
            .get_values(&keys(&["/app/db/host", "/app/db/port"]))
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["/app/db/host"], "10.0.0.1");
    }

    #[tokio::test]
    async fn first_watch_is_immediate() {
        let client = MemClient::new();
        let index = client
            .watch_prefix("/app", &keys(&["/app/x"]), 0)
            .await
            .unwrap();
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn watch_wakes_on_subscribed_change() {
        let client = Arc::new(MemClient::new());
        let watcher = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .watch_prefix("/app", &keys(&["/app/db/host"]), 1)
                    .await
            })
        };

        tokio::task::yield_now().await;
        client.set("/app/db/host", "10.0.0.2");

        let index = timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watch should wake")
            .unwrap()
            .unwrap();
        assert!(index > 1);
    }

    #[tokio::test]
    async fn watch_ignores_unsubscribed_change() {
        let client = Arc::new(MemClient::new());
        client.set("/other/key", "x");

        let subscribed = keys(&["/app/db/host"]);
        let watch = client.watch_prefix("/app", &subscribed, 1);
        let timed = timeout(Duration::from_millis(50), watch).await;
        assert!(timed.is_err(), "unsubscribed change must not wake the watcher");
    }

    #[tokio::test]
    async fn change_during_absence_is_not_lost() {
        // A change that lands while no watch is in flight must still be
        // observed by the next poll carrying the older index.
        let client = MemClient::new();
        client.set("/app/db/port", "5432");

        let index = client
            .watch_prefix("/app", &keys(&["/app/db/port"]), 1)
            .await
            .unwrap();
        assert!(index > 1);
    }

    #[tokio::test]
    async fn broadcast_wakes_every_waiter() {
        let client = Arc::new(MemClient::new());
        let mut watchers = Vec::new();
        for _ in 0..3 {
            let client = client.clone();
            watchers.push(tokio::spawn(async move {
                client
                    .watch_prefix("/app", &keys(&["/app/flag"]), 1)
                    .await
            }));
        }

        tokio::task::yield_now().await;
        client.set("/app/flag", "on");

        for watcher in watchers {
            let index = timeout(Duration::from_secs(1), watcher)
                .await
                .expect("every waiter should wake")
                .unwrap()
                .unwrap();
            assert!(index > 1);
        }
    }

    #[tokio::test]
    async fn alternating_changes_on_two_keys_each_wake_once() {
        // One monitor subscribed to two keys: a change on either key wakes
        // it exactly once, and consuming one wake never loses the other
        // key's future changes.
        let client = Arc::new(MemClient::new());
        let ks = keys(&["/app/db/host", "/app/db/port"]);

        let mut index = client.watch_prefix("/app", &ks, 0).await.unwrap();
        assert_eq!(index, 1);

        client.set("/app/db/host", "10.0.0.1");
        index = client.watch_prefix("/app", &ks, index).await.unwrap();

        // The wake was consumed: with no further changes the watch blocks.
        let idle = timeout(
            Duration::from_millis(50),
            client.watch_prefix("/app", &ks, index),
        )
        .await;
        assert!(idle.is_err(), "consumed wake must not fire again");

        client.set("/app/db/port", "5432");
        index = client.watch_prefix("/app", &ks, index).await.unwrap();

        client.set("/app/db/host", "10.0.0.2");
        let next = client.watch_prefix("/app", &ks, index).await.unwrap();
        assert!(next > index);
    }

    #[tokio::test]
    async fn removed_key_wakes_and_disappears_from_fetch() {
        let client = Arc::new(MemClient::new());
        client.set("/app/tmp", "v");
        let index = client
            .watch_prefix("/app", &keys(&["/app/tmp"]), 1)
            .await
            .unwrap();

        client.remove("/app/tmp");
        let next = client
            .watch_prefix("/app", &keys(&["/app/tmp"]), index)
            .await
            .unwrap();
        assert!(next > index);

        let values = client.get_values(&keys(&["/app/tmp"])).await.unwrap();
        assert!(values.is_empty());
    }
}
