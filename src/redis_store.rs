//! Redis-backed key-value store
//!
//! Atomic multi-key writes use a single `MSET`; recursive deletes run a Lua
//! scan-and-delete script server-side (scanning from the client is far too
//! slow). `watch` relies on keyspace notifications, which must be enabled on
//! the server (`notify-keyspace-events "Kg$"` or broader); durability across
//! server restarts requires append-only persistence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::RedisConfig;
use crate::error::{Error, Result};
use crate::schema::scalar_to_kv_string;
use crate::store::{with_retries, KvEvent, KvEventKind, KvStore, RetryConfig};

// scan-and-delete for one prefix pattern, executed atomically server-side
const DELETE_TREE_SCRIPT: &str = r#"
local all_keys = {};
local cursor = "0";
repeat
    local result = redis.call("SCAN", cursor, "MATCH", ARGV[1], "COUNT", ARGV[2])
    cursor = result[1];
    for i, key in ipairs(result[2]) do
        table.insert(all_keys, key);
    end
until cursor == "0"
for i, key in ipairs(all_keys) do
    redis.call("DEL", key);
end
return #all_keys;
"#;

const SCAN_COUNT: usize = 100;

pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
    sep: String,
    retry: RetryConfig,
    delete_tree: Script,
}

impl RedisStore {
    /// Connect to redis. The connection manager reconnects on its own; the
    /// retry policy bounds how long individual operations keep trying.
    pub async fn connect(config: &RedisConfig, sep: &str) -> Result<Self> {
        let mut url = url::Url::parse(&config.url).map_err(|err| {
            Error::InvalidDocument(format!("invalid redis url {:?}: {err}", config.url))
        })?;
        if let Some(username) = &config.username {
            url.set_username(username)
                .map_err(|_| Error::InvalidDocument("redis url rejects username".into()))?;
        }
        if let Some(password) = &config.password {
            url.set_password(Some(password))
                .map_err(|_| Error::InvalidDocument("redis url rejects password".into()))?;
        }
        let endpoint = format!(
            "{}:{}",
            url.host_str().unwrap_or("127.0.0.1"),
            url.port().unwrap_or(6379)
        );

        let client = Client::open(url.as_str())
            .map_err(|err| Error::BackendUnavailable {
                attempts: 1,
                message: format!("redis client setup failed: {err}"),
            })?;
        let manager = with_retries("redis connect", &config.retry, || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .await?;
        info!(endpoint = %endpoint, "connected to redis");

        Ok(Self {
            client,
            manager,
            endpoint,
            username: config.username.clone(),
            password: config.password.clone(),
            sep: sep.to_string(),
            retry: config.retry.clone(),
            delete_tree: Script::new(DELETE_TREE_SCRIPT),
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn provider_name(&self) -> &'static str {
        "redis"
    }

    fn provider_config(&self, root_key: &str) -> Value {
        let mut provider = json!({
            "endpoints": [self.endpoint],
            "rootKey": root_key,
        });
        if let Some(username) = &self.username {
            provider["username"] = json!(username);
        }
        if let Some(password) = &self.password {
            provider["password"] = json!(password);
        }
        provider
    }

    async fn atomic_set(&self, entries: BTreeMap<String, Value>) -> Result<()> {
        let mut pairs = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            pairs.push((key.clone(), scalar_to_kv_string(value)?));
        }
        debug!(key_count = pairs.len(), "setting redis keys");
        with_retries("redis mset", &self.retry, || {
            let mut conn = self.manager.clone();
            let pairs = pairs.clone();
            async move { conn.mset::<_, _, ()>(&pairs).await }
        })
        .await
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<()> {
        let mut plain = Vec::new();
        for key in keys {
            if let Some(prefix) = key.strip_suffix(self.sep.as_str()) {
                let pattern = format!("{prefix}{}*", self.sep);
                let deleted: i64 = with_retries("redis delete tree", &self.retry, || {
                    let mut conn = self.manager.clone();
                    let pattern = pattern.clone();
                    async move {
                        self.delete_tree
                            .arg(pattern)
                            .arg(SCAN_COUNT)
                            .invoke_async(&mut conn)
                            .await
                    }
                })
                .await?;
                debug!(prefix = %key, deleted, "deleted redis tree");
            } else {
                plain.push(key.clone());
            }
        }
        if !plain.is_empty() {
            debug!(key_count = plain.len(), "deleting redis keys");
            with_retries("redis del", &self.retry, || {
                let mut conn = self.manager.clone();
                let plain = plain.clone();
                async move { conn.del::<_, ()>(plain).await }
            })
            .await?;
        }
        Ok(())
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut pattern = prefix.to_string();
        if !pattern.ends_with(self.sep.as_str()) {
            pattern.push_str(&self.sep);
        }
        pattern.push('*');

        let keys: Vec<String> = with_retries("redis scan", &self.retry, || {
            let mut conn = self.manager.clone();
            let pattern = pattern.clone();
            async move {
                let mut keys = Vec::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await?;
                    keys.extend(batch);
                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Ok::<_, redis::RedisError>(keys)
            }
        })
        .await?;
        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }

        let values: Vec<Option<String>> = with_retries("redis mget", &self.retry, || {
            let mut conn = self.manager.clone();
            let keys = keys.clone();
            async move { conn.mget(keys).await }
        })
        .await?;

        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    /// Keyspace-notification subscription; events arrive only if the server
    /// has `notify-keyspace-events` enabled.
    fn watch(&self, prefix: &str) -> Option<mpsc::Receiver<KvEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let pattern = format!("__keyspace@0__:{prefix}*");
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    error!(error = %err, "redis watch subscription failed");
                    return;
                }
            };
            if let Err(err) = pubsub.psubscribe(&pattern).await {
                error!(error = %err, pattern = %pattern, "redis psubscribe failed");
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let channel = message.get_channel_name().to_string();
                let key = channel
                    .split_once(':')
                    .map(|(_, key)| key.to_string())
                    .unwrap_or(channel);
                let event: String = message.get_payload().unwrap_or_default();
                let kind = match event.as_str() {
                    "del" | "expired" => KvEventKind::Delete,
                    _ => KvEventKind::Put,
                };
                if tx.send(KvEvent { key, kind }).await.is_err() {
                    break;
                }
            }
        });
        Some(rx)
    }

    async fn close(&self) -> Result<()> {
        // connections are dropped with the manager
        Ok(())
    }
}
