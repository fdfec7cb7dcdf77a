//! Key-value backend abstraction
//!
//! Every backend implements the same small contract: atomic multi-key
//! set/delete, a recursive prefix read, and optional change notifications.
//! The file backend implements the same surface over an in-memory document;
//! upper layers never special-case it beyond skipping `watch`.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{Error, Result};
use crate::schema::KvChange;

/// A change observed under a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub key: String,
    pub kind: KvEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// Contract shared by all backends.
///
/// All write operations are all-or-nothing: on failure no key is modified
/// (the consul driver is the documented exception, see its module). A delete
/// key ending with the separator denotes a recursive delete of that subtree;
/// missing keys are not an error.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Provider name as it appears in traefik's static `providers` section
    fn provider_name(&self) -> &'static str;

    /// The `providers.<name>` fragment pointing traefik at this backend
    fn provider_config(&self, root_key: &str) -> Value;

    /// All-or-nothing write of multiple scalar values
    async fn atomic_set(&self, entries: BTreeMap<String, Value>) -> Result<()>;

    /// All-or-nothing delete; keys ending with the separator are recursive
    async fn atomic_delete(&self, keys: &[String]) -> Result<()>;

    /// Recursive snapshot of all keys under `prefix`, as flat strings
    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// Apply deletes and sets together, in one transaction where the backend
    /// supports it. The default issues two: deletes first, then sets.
    async fn apply(&self, change: KvChange) -> Result<()> {
        if !change.delete.is_empty() {
            self.atomic_delete(&change.delete).await?;
        }
        if !change.set.is_empty() {
            self.atomic_set(change.set).await?;
        }
        Ok(())
    }

    /// Change notifications under `prefix`. `None` means the backend cannot
    /// notify and the caller falls back to polling.
    fn watch(&self, _prefix: &str) -> Option<mpsc::Receiver<KvEvent>> {
        None
    }

    /// Release connections. Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Retry policy for transient backend failures, shared by all drivers
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// First backoff interval in milliseconds
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Give up once this much time has elapsed, in seconds
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

fn default_initial_interval_ms() -> u64 {
    100
}

fn default_max_interval_ms() -> u64 {
    5_000
}

fn default_max_elapsed_secs() -> u64 {
    30
}

impl RetryConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }
}

/// Run `op` with exponential backoff until it succeeds or the policy's
/// elapsed budget runs out, surfacing the last failure as
/// [`Error::BackendUnavailable`]. Every retry is logged.
pub async fn with_retries<T, E, F, Fut>(what: &str, policy: &RetryConfig, mut op: F) -> Result<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let started = Instant::now();
    let mut interval = policy.initial_interval();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if started.elapsed() + interval > policy.max_elapsed() {
                    return Err(Error::BackendUnavailable {
                        attempts,
                        message: format!("{what}: {err}"),
                    });
                }
                warn!(
                    operation = what,
                    attempt = attempts,
                    backoff_ms = interval.as_millis() as u64,
                    error = %err,
                    "backend operation failed, retrying"
                );
                tokio::time::sleep(interval).await;
                interval = (interval * 2).min(policy.max_interval());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryConfig {
            initial_interval_ms: 1,
            max_interval_ms: 5,
            max_elapsed_secs: 5,
        };
        let result = with_retries("test-op", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("connection refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_elapsed_budget() {
        let policy = RetryConfig {
            initial_interval_ms: 20,
            max_interval_ms: 20,
            max_elapsed_secs: 0,
        };
        let result: Result<()> =
            with_retries("test-op", &policy, || async { Err("always down") }).await;
        match result {
            Err(Error::BackendUnavailable { attempts, message }) => {
                assert_eq!(attempts, 1);
                assert!(message.contains("always down"));
            }
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
    }
}
