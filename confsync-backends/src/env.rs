//! Environment-variable backend.
//!
//! Maps key paths onto environment variable names: `/app/db/host` is read
//! from `APP_DB_HOST`. The environment never notifies changes, so the watch
//! call blocks forever past the initial subscription index; interval
//! scheduling is the natural pairing for this backend.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{BackendError, StoreClient};

#[derive(Debug, Default)]
pub struct EnvClient;

impl EnvClient {
    pub fn new() -> Self {
        Self
    }
}

/// `/app/db/host` → `APP_DB_HOST`.
fn env_name(key: &str) -> String {
    key.trim_start_matches('/')
        .replace(['/', '-', '.'], "_")
        .to_ascii_uppercase()
}

#[async_trait]
impl StoreClient for EnvClient {
    async fn get_values(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, String>, BackendError> {
        let mut values = HashMap::new();
        for key in keys {
            if let Ok(value) = std::env::var(env_name(key)) {
                values.insert(key.clone(), value);
            }
        }
        Ok(values)
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        _keys: &[String],
        wait_index: u64,
    ) -> Result<u64, BackendError> {
        if wait_index == 0 {
            return Ok(1);
        }
        // No change source to wait on; park until the caller cancels.
        std::future::pending::<()>().await;
        unreachable!("pending future resolved")
    }
}
