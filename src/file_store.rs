//! File-backed provider: the whole dynamic document as one TOML or YAML file
//!
//! Not a real key-value store. The document lives in memory and every
//! mutation rewrites the file atomically (temp file in the same directory,
//! then rename), so traefik never reads a partial routing table. Keys under
//! the traefik prefix land at the document root, where traefik's file
//! provider expects them; all other keys (the jupyterhub index) become
//! top-level sections traefik ignores.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::schema::{self, flatten, scalar_to_kv_string, KvChange};
use crate::store::{KvEvent, KvEventKind, KvStore};

/// On-disk format, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            other => Err(Error::InvalidDocument(format!(
                "config file {} has unsupported extension {other:?}, expected toml or yaml",
                path.display()
            ))),
        }
    }
}

pub struct FileStore {
    path: PathBuf,
    format: ConfigFormat,
    traefik_prefix: String,
    sep: String,
    doc: Mutex<Value>,
    // watchers stay alive as long as the store does
    watchers: parking_lot::Mutex<Vec<notify::RecommendedWatcher>>,
}

impl FileStore {
    /// Open (or create on first write) the dynamic config file at `path`.
    /// An existing file is loaded so the routing table survives restarts.
    pub fn new(path: impl Into<PathBuf>, traefik_prefix: &str, sep: &str) -> Result<Self> {
        let path = path.into();
        let format = ConfigFormat::from_path(&path)?;
        let doc = match std::fs::read_to_string(&path) {
            Ok(content) => parse_document(&content, format)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => json!({}),
            Err(err) => return Err(err.into()),
        };
        info!(path = %path.display(), ?format, "loaded dynamic config file");
        Ok(Self {
            path,
            format,
            traefik_prefix: traefik_prefix.to_string(),
            sep: sep.to_string(),
            doc: Mutex::new(doc),
            watchers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Translate a flat KV key into a document path: keys under the traefik
    /// prefix are rooted at the document top level, everything else keeps its
    /// leading prefix segment as a section name.
    fn doc_path<'a>(&self, key: &'a str) -> Vec<&'a str> {
        let stripped = key
            .strip_prefix(&self.traefik_prefix)
            .and_then(|rest| rest.strip_prefix(&self.sep))
            .unwrap_or(key);
        stripped
            .split(self.sep.as_str())
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    async fn persist(&self, doc: &Value) -> Result<()> {
        let serialized = dump_document(&prune_empty(doc), self.format)?;
        atomic_write(self.path.clone(), serialized).await?;
        debug!(path = %self.path.display(), "dynamic config file rewritten");
        Ok(())
    }

    // recursive (trailing-separator) and single-key deletes are the same
    // tree operation here
    fn apply_delete(&self, doc: &mut Value, key: &str) {
        let trimmed = key.trim_end_matches(self.sep.as_str());
        let segments = self.doc_path(trimmed);
        if segments.is_empty() {
            return;
        }
        remove_path(doc, &segments);
    }

    fn apply_change_locked(&self, doc: &mut Value, change: &KvChange) -> Result<()> {
        for key in &change.delete {
            self.apply_delete(doc, key);
        }
        for (key, value) in &change.set {
            let segments = self.doc_path(key);
            schema::insert_path(doc, &segments, value.clone())?;
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    fn provider_name(&self) -> &'static str {
        "file"
    }

    fn provider_config(&self, _root_key: &str) -> Value {
        json!({
            "filename": self.path.to_string_lossy(),
            "watch": true,
        })
    }

    async fn atomic_set(&self, entries: BTreeMap<String, Value>) -> Result<()> {
        self.apply(KvChange {
            set: entries,
            delete: Vec::new(),
        })
        .await
    }

    async fn atomic_delete(&self, keys: &[String]) -> Result<()> {
        self.apply(KvChange {
            set: BTreeMap::new(),
            delete: keys.to_vec(),
        })
        .await
    }

    async fn get_tree(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let doc = self.doc.lock().await;
        let trimmed = prefix.trim_end_matches(self.sep.as_str());
        let mut node = &*doc;
        for segment in self.doc_path(trimmed) {
            match node.get(segment) {
                Some(child) => node = child,
                None => return Ok(BTreeMap::new()),
            }
        }
        let flat = flatten(node, trimmed, &self.sep)?;
        flat.iter()
            .map(|(key, value)| Ok((key.clone(), scalar_to_kv_string(value)?)))
            .collect()
    }

    /// One in-memory commit and one file rewrite for the whole change
    async fn apply(&self, change: KvChange) -> Result<()> {
        if change.is_empty() {
            return Ok(());
        }
        let mut doc = self.doc.lock().await;
        let mut updated = doc.clone();
        self.apply_change_locked(&mut updated, &change)?;
        self.persist(&updated).await?;
        *doc = updated;
        Ok(())
    }

    fn watch(&self, prefix: &str) -> Option<mpsc::Receiver<KvEvent>> {
        let (tx, rx) = mpsc::channel(16);
        let file_name = self.path.file_name()?.to_owned();
        let watch_dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let prefix = prefix.to_string();

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if ours && (event.kind.is_modify() || event.kind.is_create()) {
                        let _ = tx.try_send(KvEvent {
                            key: prefix.clone(),
                            kind: KvEventKind::Put,
                        });
                    }
                }
                Err(err) => error!(error = %err, "dynamic config watch error"),
            },
        )
        .ok()?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive).ok()?;
        self.watchers.lock().push(watcher);
        Some(rx)
    }
}

/// Write a config file atomically: temp file in the same directory, then
/// rename over the target, so traefik never reads a partial file.
pub(crate) async fn atomic_write(path: PathBuf, content: String) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|err| Error::Io(err.error))?;
        Ok(())
    })
    .await
    .map_err(|err| Error::Serialize(format!("config writer task failed: {err}")))?
}

fn parse_document(content: &str, format: ConfigFormat) -> Result<Value> {
    match format {
        ConfigFormat::Toml => {
            let value: toml::Value = toml::from_str(content)?;
            Ok(serde_json::to_value(value)?)
        }
        ConfigFormat::Yaml => {
            if content.trim().is_empty() {
                return Ok(json!({}));
            }
            let value: Value = serde_yaml::from_str(content)?;
            // a comments-only file parses as null
            Ok(if value.is_null() { json!({}) } else { value })
        }
    }
}

/// Serialize a document in the given format
pub fn dump_document(doc: &Value, format: ConfigFormat) -> Result<String> {
    match format {
        ConfigFormat::Toml => Ok(toml::to_string_pretty(doc)?),
        ConfigFormat::Yaml => Ok(serde_yaml::to_string(doc)?),
    }
}

/// Drop empty mappings recursively; traefik rejects empty tables in the
/// dynamic file.
fn prune_empty(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), prune_empty(v)))
                .filter(|(_, v)| !v.as_object().is_some_and(Map::is_empty))
                .collect();
            Value::Object(pruned)
        }
        Value::Array(items) => Value::Array(items.iter().map(prune_empty).collect()),
        other => other.clone(),
    }
}

fn remove_path(doc: &mut Value, segments: &[&str]) {
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut node = doc;
    for segment in parents {
        match node {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(child) => node = child,
                None => return,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i))
            {
                Some(child) => node = child,
                None => return,
            },
            _ => return,
        }
    }
    match node {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routespec::RouteSpec;
    use crate::schema::{RouteRenderer, RouterTls};

    fn renderer() -> RouteRenderer {
        RouteRenderer::new("jupyterhub", "traefik", "/", "http", RouterTls::default())
    }

    fn temp_store(dir: &tempfile::TempDir, name: &str) -> FileStore {
        FileStore::new(dir.path().join(name), "traefik", "/").unwrap()
    }

    #[tokio::test]
    async fn test_add_then_get_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir, "rules.toml");
        let spec = RouteSpec::parse("/user/alice/").unwrap();
        let change = renderer()
            .render_add(&spec, "http://10.0.0.1:8888", &serde_json::json!({"hub": "a"}))
            .unwrap();
        store.apply(change).await.unwrap();

        let tree = store.get_tree("jupyterhub/routes/").await.unwrap();
        let target_key = format!("jupyterhub/routes/{}/target", spec.escaped());
        assert_eq!(tree[&target_key], "http://10.0.0.1:8888");
    }

    #[tokio::test]
    async fn test_document_shape_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir, "rules.toml");
        let spec = RouteSpec::parse("/user/alice/").unwrap();
        let change = renderer()
            .render_add(&spec, "http://10.0.0.1:8888", &serde_json::json!({}))
            .unwrap();
        store.apply(change).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("rules.toml")).unwrap();
        let doc: toml::Value = toml::from_str(&content).unwrap();
        // traefik sections at the root, jupyterhub index in its own section
        let routers = doc
            .get("http")
            .and_then(|http| http.get("routers"))
            .and_then(toml::Value::as_table)
            .unwrap();
        assert_eq!(routers.len(), 1);
        assert!(doc.get("jupyterhub").is_some());
        assert!(doc.get("traefik").is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir, "rules.toml");
        let renderer = renderer();
        let spec = RouteSpec::parse("/user/alice/").unwrap();
        store
            .apply(renderer.render_add(&spec, "http://t", &serde_json::json!({})).unwrap())
            .await
            .unwrap();
        store.apply(renderer.render_delete(&spec)).await.unwrap();

        assert!(store.get_tree("jupyterhub/routes/").await.unwrap().is_empty());
        assert!(store
            .get_tree("traefik/http/routers/")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let spec = RouteSpec::parse("/a/").unwrap();
        {
            let store = temp_store(&dir, "rules.toml");
            store
                .apply(
                    renderer()
                        .render_add(&spec, "http://t", &serde_json::json!({"k": "v"}))
                        .unwrap(),
                )
                .await
                .unwrap();
        }
        // a new store over the same file sees the persisted routing table
        let store = temp_store(&dir, "rules.toml");
        let tree = store.get_tree("jupyterhub/routes/").await.unwrap();
        let spec_key = format!("jupyterhub/routes/{}/routespec", spec.escaped());
        assert_eq!(tree[&spec_key], "/a/");
    }

    #[tokio::test]
    async fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir, "rules.yaml");
        let spec = RouteSpec::parse("hub.example.com/lab/").unwrap();
        store
            .apply(renderer().render_add(&spec, "http://10.0.0.2:80", &serde_json::json!({})).unwrap())
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("rules.yaml")).unwrap();
        let doc: Value = serde_yaml::from_str(&content).unwrap();
        assert_eq!(
            doc["http"]["routers"][spec.router_name()]["rule"],
            serde_json::json!("Host(`hub.example.com`) && PathPrefix(`/lab`)")
        );
        // booleans survive as booleans in the document formats
        assert_eq!(
            doc["http"]["services"][spec.router_name()]["loadBalancer"]["passHostHeader"],
            serde_json::json!(true)
        );
    }

    #[tokio::test]
    async fn test_watch_sees_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir, "rules.toml");
        let mut events = store.watch("traefik/").unwrap();

        let spec = RouteSpec::parse("/w/").unwrap();
        store
            .apply(renderer().render_add(&spec, "http://t", &serde_json::json!({})).unwrap())
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("no watch event within 5s")
            .expect("watch channel closed");
        assert_eq!(event.kind, KvEventKind::Put);
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("rules.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("rules.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert!(ConfigFormat::from_path(Path::new("rules.conf")).is_err());
    }
}
