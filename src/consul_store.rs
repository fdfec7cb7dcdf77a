//! Consul-backed key-value store (deprecated; prefer redis)
//!
//! Consul's transaction endpoint caps a transaction at 64 operations, so
//! large changes are chunked. If a later chunk fails, keys set by earlier
//! chunks are rolled back by reissuing deletes; that rollback is best-effort
//! and a failure surfaces as [`Error::PartialWrite`].
//!
//! Consul rejects keys starting with `/`, so the configured prefixes must
//! not have a leading separator (the config layer normalizes this).

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ConsulConfig;
use crate::error::{Error, Result};
use crate::schema::scalar_to_kv_string;
use crate::store::{with_retries, KvEvent, KvStore, RetryConfig};

/// Consul's hard limit on operations per transaction
const MAX_TXN_OPS: usize = 64;

#[derive(Debug, Clone, serde::Serialize)]
struct TxnKv {
    #[serde(rename = "Verb")]
    verb: &'static str,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
struct TxnOp {
    #[serde(rename = "KV")]
    kv: TxnKv,
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

pub struct ConsulStore {
    http: reqwest::Client,
    base_url: String,
    endpoint: String,
    token: Option<String>,
    sep: String,
    retry: RetryConfig,
}

impl ConsulStore {
    pub async fn connect(config: &ConsulConfig, sep: &str) -> Result<Self> {
        warn!("the consul backend is deprecated; prefer the redis backend for new deployments");
        let url = url::Url::parse(&config.url).map_err(|err| {
            Error::InvalidDocument(format!("invalid consul url {:?}: {err}", config.url))
        })?;
        let endpoint = format!(
            "{}:{}",
            url.host_str().unwrap_or("127.0.0.1"),
            url.port().unwrap_or(8500)
        );
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| Error::BackendUnavailable {
                attempts: 1,
                message: format!("consul client setup failed: {err}"),
            })?;
        let store = Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            endpoint,
            token: config.token.clone(),
            sep: sep.to_string(),
            retry: config.retry.clone(),
        };
        // fail fast on unreachable agents instead of on the first route
        with_retries("consul status", &store.retry, || async {
            let response = store
                .request(reqwest::Method::GET, "/v1/status/leader")
                .send()
                .await
                .map_err(|err| format!("consul status request failed: {err}"))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(format!("consul status returned {}", response.status()))
            }
        })
        .await?;
        info!(endpoint = %store.endpoint, "connected to consul");
        Ok(store)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            builder = builder.header("X-Consul-Token", token);
        }
        builder
    }

    async fn submit_txn(&self, ops: &[TxnOp]) -> std::result::Result<(), String> {
        let response = self
            .request(reqwest::Method::PUT, "/v1/txn")
            .json(ops)
            .send()
            .await
            .map_err(|err| format!("consul txn request failed: {err}"))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(format!("consul txn returned {status}: {body}"))
    }

    /// Expand a change into verb/key/value operations, resolving recursive
    /// deletes to `delete-tree`.
    fn txn_ops(
        deletes: &[String],
        sets: &BTreeMap<String, Value>,
        sep: &str,
    ) -> Result<Vec<TxnOp>> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let mut ops = Vec::with_capacity(deletes.len() + sets.len());
        for key in deletes {
            let (verb, key) = match key.strip_suffix(sep) {
                Some(prefix) => ("delete-tree", prefix.to_string()),
                None => ("delete", key.clone()),
            };
            ops.push(TxnOp {
                kv: TxnKv {
                    verb,
                    key,
                    value: None,
                },
            });
        }
        for (key, value) in sets {
            ops.push(TxnOp {
                kv: TxnKv {
                    verb: "set",
                    key: key.clone(),
                    value: Some(b64.encode(scalar_to_kv_string(value)?)),
                },
            });
        }
        Ok(ops)
    }

    /// Submit operations in transaction-sized chunks. On a failed chunk,
    /// earlier chunks are rolled back by deleting every key they set.
    async fn run_chunked(&self, ops: Vec<TxnOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let chunks: Vec<&[TxnOp]> = ops.chunks(MAX_TXN_OPS).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            let outcome = with_retries("consul txn", &self.retry, || {
                let chunk = chunk.to_vec();
                async move { self.submit_txn(&chunk).await }
            })
            .await;
            let Err(err) = outcome else { continue };
            if index == 0 {
                return Err(err);
            }

            // best-effort rollback of the chunks that already committed
            warn!(
                failed_chunk = index,
                chunk_count = chunks.len(),
                "consul transaction chunk failed, rolling back earlier chunks"
            );
            let rollback: Vec<TxnOp> = chunks[..index]
                .iter()
                .flat_map(|committed| committed.iter())
                .filter(|op| op.kv.verb == "set")
                .map(|op| TxnOp {
                    kv: TxnKv {
                        verb: "delete",
                        key: op.kv.key.clone(),
                        value: None,
                    },
                })
                .collect();
            for rollback_chunk in rollback.chunks(MAX_TXN_OPS) {
                if let Err(rollback_err) = self.submit_txn(rollback_chunk).await {
                    error!(error = %rollback_err, "consul rollback chunk failed");
                }
            }
            return Err(Error::PartialWrite(format!(
                "chunk {index} of {} failed ({err}); earlier chunks rolled back best-effort",
                chunks.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for ConsulStore {
    fn provider_name(&self) -> &'static str {
        "consul"
    }

    fn provider_config(&self, root_key: &str) -> Value {
        let mut provider = json!({
            "endpoints": [self.endpoint],
            "rootKey": root_key,
        });
        if let Some(token) = &self.token {
            provider["token"] = json!(token);
        }
        provider
    }

    async fn atomic_set(&self, entries: BTreeMap<String, Value>) -> Result<()> {
        debug!(key_count = entries.len(), "setting consul keys");
        let ops = Self::txn_ops(&[], &entries, &self.sep)?;
        self.run_chunked(ops).await
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<()> {
        debug!(key_count = keys.len(), "deleting consul keys");
        let ops = Self::txn_ops(keys, &BTreeMap::new(), &self.sep)?;
        self.run_chunked(ops).await
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        // the trailing separator keeps sibling prefixes from matching
        let mut tree_prefix = prefix.to_string();
        if !tree_prefix.ends_with(self.sep.as_str()) {
            tree_prefix.push_str(&self.sep);
        }
        let path = format!("/v1/kv/{tree_prefix}?recurse=true");
        let entries: Vec<KvEntry> = with_retries("consul get tree", &self.retry, || {
            let path = path.clone();
            async move {
                let response = self
                    .request(reqwest::Method::GET, &path)
                    .send()
                    .await
                    .map_err(|err| format!("consul kv request failed: {err}"))?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(Vec::new());
                }
                if !response.status().is_success() {
                    return Err(format!("consul kv returned {}", response.status()));
                }
                response
                    .json::<Vec<KvEntry>>()
                    .await
                    .map_err(|err| format!("consul kv response decode failed: {err}"))
            }
        })
        .await?;

        let b64 = base64::engine::general_purpose::STANDARD;
        let mut tree = BTreeMap::new();
        for entry in entries {
            let Some(encoded) = entry.value else { continue };
            match b64.decode(&encoded) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(value) => {
                        tree.insert(entry.key, value);
                    }
                    Err(_) => debug!(key = %entry.key, "skipping non-utf8 consul value"),
                },
                Err(err) => {
                    debug!(key = %entry.key, error = %err, "skipping undecodable consul value")
                }
            }
        }
        Ok(tree)
    }

    fn watch(&self, _prefix: &str) -> Option<mpsc::Receiver<KvEvent>> {
        // consul blocking queries are not wired up; callers poll instead
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_entries(n: usize) -> BTreeMap<String, Value> {
        (0..n)
            .map(|i| (format!("traefik/key/{i}"), Value::String(format!("v{i}"))))
            .collect()
    }

    #[test]
    fn test_txn_ops_verbs() {
        let deletes = vec![
            "jupyterhub/routes/a/".to_string(),
            "jupyterhub/routes/a/target".to_string(),
        ];
        let sets = set_entries(1);
        let ops = ConsulStore::txn_ops(&deletes, &sets, "/").unwrap();
        assert_eq!(ops[0].kv.verb, "delete-tree");
        assert_eq!(ops[0].kv.key, "jupyterhub/routes/a");
        assert_eq!(ops[1].kv.verb, "delete");
        assert_eq!(ops[2].kv.verb, "set");
        // values travel base64-encoded
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(ops[2].kv.value.as_ref().unwrap())
            .unwrap();
        assert_eq!(decoded, b"v0");
    }

    #[test]
    fn test_chunking_splits_at_transaction_limit() {
        let ops = ConsulStore::txn_ops(&[], &set_entries(150), "/").unwrap();
        let chunks: Vec<&[TxnOp]> = ops.chunks(MAX_TXN_OPS).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 64);
        assert_eq!(chunks[2].len(), 150 - 2 * 64);
    }
}
