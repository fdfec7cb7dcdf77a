//! etcd v3-backed key-value store
//!
//! Writes go through a single v3 transaction, so a multi-key change is
//! all-or-nothing. Prefix reads and prefix watches map directly onto etcd's
//! range operations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::EtcdConfig;
use crate::error::{Error, Result};
use crate::schema::{scalar_to_kv_string, KvChange};
use crate::store::{with_retries, KvEvent, KvEventKind, KvStore, RetryConfig};

pub struct EtcdStore {
    client: Client,
    endpoint: String,
    scheme: String,
    username: Option<String>,
    password: Option<String>,
    insecure_skip_verify: bool,
    sep: String,
    retry: RetryConfig,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig, sep: &str) -> Result<Self> {
        let url = url::Url::parse(&config.url).map_err(|err| {
            Error::InvalidDocument(format!("invalid etcd url {:?}: {err}", config.url))
        })?;
        let endpoint = format!(
            "{}:{}",
            url.host_str().unwrap_or("127.0.0.1"),
            url.port().unwrap_or(2379)
        );

        let mut options = ConnectOptions::new();
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(username, password);
        }

        let client = with_retries("etcd connect", &config.retry, || {
            let endpoint = endpoint.clone();
            let options = options.clone();
            async move { Client::connect([endpoint], Some(options)).await }
        })
        .await?;
        info!(endpoint = %endpoint, "connected to etcd");

        Ok(Self {
            client,
            endpoint,
            scheme: url.scheme().to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            insecure_skip_verify: config.insecure_skip_verify,
            sep: sep.to_string(),
            retry: config.retry.clone(),
        })
    }

    async fn run_txn(&self, build_ops: impl Fn() -> Result<Vec<TxnOp>>) -> Result<()> {
        if build_ops()?.is_empty() {
            return Ok(());
        }
        let response = with_retries("etcd txn", &self.retry, || {
            let mut client = self.client.clone();
            // rebuilt per attempt; transaction ops are consumed on send
            let ops = build_ops();
            async move {
                let ops = ops.map_err(|err| err.to_string())?;
                client
                    .txn(Txn::new().and_then(ops))
                    .await
                    .map_err(|err| err.to_string())
            }
        })
        .await?;
        if !response.succeeded() {
            // no compares, so this only happens on server-side refusal
            return Err(Error::BackendUnavailable {
                attempts: 1,
                message: "etcd transaction was not applied".to_string(),
            });
        }
        Ok(())
    }

    fn delete_ops(&self, keys: &[String]) -> Vec<TxnOp> {
        keys.iter()
            .map(|key| {
                if key.ends_with(self.sep.as_str()) {
                    TxnOp::delete(key.clone(), Some(DeleteOptions::new().with_prefix()))
                } else {
                    TxnOp::delete(key.clone(), None)
                }
            })
            .collect()
    }

    fn set_ops(entries: &BTreeMap<String, Value>) -> Result<Vec<TxnOp>> {
        entries
            .iter()
            .map(|(key, value)| Ok(TxnOp::put(key.clone(), scalar_to_kv_string(value)?, None)))
            .collect()
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    fn provider_name(&self) -> &'static str {
        "etcd"
    }

    fn provider_config(&self, root_key: &str) -> Value {
        let mut provider = json!({
            "endpoints": [self.endpoint],
            "rootKey": root_key,
        });
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            provider["username"] = json!(username);
            provider["password"] = json!(password);
        }
        if self.scheme == "https" {
            // traefik needs to know the etcd endpoint speaks TLS
            provider["tls"] = json!({ "insecureSkipVerify": self.insecure_skip_verify });
        }
        provider
    }

    async fn atomic_set(&self, entries: BTreeMap<String, Value>) -> Result<()> {
        debug!(key_count = entries.len(), "setting etcd keys");
        self.run_txn(|| Self::set_ops(&entries)).await
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<()> {
        debug!(key_count = keys.len(), "deleting etcd keys");
        self.run_txn(|| Ok(self.delete_ops(keys))).await
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut prefix = prefix.to_string();
        if !prefix.ends_with(self.sep.as_str()) {
            prefix.push_str(&self.sep);
        }
        let response = with_retries("etcd get prefix", &self.retry, || {
            let mut client = self.client.clone();
            let prefix = prefix.clone();
            async move {
                client
                    .get(prefix, Some(GetOptions::new().with_prefix()))
                    .await
            }
        })
        .await?;

        let mut tree = BTreeMap::new();
        for kv in response.kvs() {
            match (kv.key_str(), kv.value_str()) {
                (Ok(key), Ok(value)) => {
                    tree.insert(key.to_string(), value.to_string());
                }
                _ => {
                    debug!("skipping non-utf8 etcd key under watched prefix");
                }
            }
        }
        Ok(tree)
    }

    /// Deletes and sets land in one transaction: replacement is atomic.
    async fn apply(&self, change: KvChange) -> Result<()> {
        debug!(
            delete_count = change.delete.len(),
            set_count = change.set.len(),
            "applying etcd transaction"
        );
        self.run_txn(|| {
            let mut ops = self.delete_ops(&change.delete);
            ops.extend(Self::set_ops(&change.set)?);
            Ok(ops)
        })
        .await
    }

    fn watch(&self, prefix: &str) -> Option<mpsc::Receiver<KvEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let mut client = self.client.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            let (_watcher, mut stream) = match client
                .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
                .await
            {
                Ok(watch) => watch,
                Err(err) => {
                    error!(error = %err, prefix = %prefix, "etcd watch failed");
                    return;
                }
            };
            while let Ok(Some(response)) = stream.message().await {
                for event in response.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    let kind = match event.event_type() {
                        EventType::Delete => KvEventKind::Delete,
                        EventType::Put => KvEventKind::Put,
                    };
                    if tx
                        .send(KvEvent {
                            key: key.to_string(),
                            kind,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });
        Some(rx)
    }
}
