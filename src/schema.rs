//! Traefik configuration documents and their flat key-value projection
//!
//! Dynamic configuration is modeled as a nested `serde_json::Value` tree with
//! the fixed traefik sections (`http.routers`, `http.services`,
//! `http.middlewares`, ...). The flattener turns a tree into
//! `key/path -> scalar` pairs following traefik's KV schema (lists become
//! `0`, `1`, ...); the unflattener inverts it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::routespec::RouteSpec;

/// One route as stored in the jupyterhub index subtree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Canonical routespec this entry was added under
    pub routespec: String,
    /// Target URL the proxy forwards to
    pub target: String,
    /// Opaque caller-supplied metadata
    pub data: Value,
}

/// An atomic change against the key-value store.
///
/// Deletes are applied before sets; a delete key ending with the separator is
/// recursive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvChange {
    pub set: BTreeMap<String, Value>,
    pub delete: Vec<String>,
}

impl KvChange {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty()
    }
}

/// Merge `overlay` into `base`, recursing through objects. Overlay wins on
/// conflicts, so caller-supplied config fragments override generated ones.
/// A null overlay is a no-op.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Serialize a scalar leaf for storage in a KV backend.
///
/// Booleans and numbers become the strings traefik's KV provider parses back.
pub fn scalar_to_kv_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::InvalidDocument(format!(
            "cannot store non-scalar value {other} in the key-value store"
        ))),
    }
}

/// Flatten a nested document into `key -> scalar` pairs.
///
/// Keys are joined with `sep` and prefixed with `prefix`. Lists become
/// numeric path components. An empty mapping produces no pairs at all.
pub fn flatten(value: &Value, prefix: &str, sep: &str) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    flatten_into(value, prefix, sep, &mut out)?;
    Ok(out)
}

fn flatten_into(
    value: &Value,
    prefix: &str,
    sep: &str,
    out: &mut BTreeMap<String, Value>,
) -> Result<()> {
    match value {
        Value::Object(map) => {
            if map.is_empty() {
                // traefik chokes on empty mappings, so they are simply not emitted
                debug!(key = %prefix, "skipping empty mapping");
                return Ok(());
            }
            for (key, child) in map {
                let child_key = join_key(prefix, key, sep);
                flatten_into(child, &child_key, sep, out)?;
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let child_key = join_key(prefix, &index.to_string(), sep);
                flatten_into(child, &child_key, sep, out)?;
            }
        }
        scalar => {
            // validate early so an atomic_set never sees an unstorable leaf
            scalar_to_kv_string(scalar)?;
            out.insert(prefix.to_string(), scalar.clone());
        }
    }
    Ok(())
}

fn join_key(prefix: &str, key: &str, sep: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}{sep}{key}")
    }
}

/// Reconstruct a nested document from flat `key -> value` pairs.
///
/// Inverse of [`flatten`] modulo string coercion: all leaves come back as
/// strings, digit-keyed siblings come back as lists. `root_key` selects a
/// subtree of the reconstructed document; if it is absent an empty document
/// is returned.
pub fn unflatten<I>(pairs: I, root_key: &str, sep: &str) -> Result<Value>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut sorted: Vec<(String, String)> = pairs.into_iter().collect();
    // parents must exist before children; shallow keys first guarantees it
    sorted.sort_by_key(|(key, _)| key.split(sep).count());

    let mut tree = Value::Object(Map::new());
    for (key, value) in sorted {
        let segments: Vec<&str> = key.split(sep).collect();
        insert_path(&mut tree, &segments, Value::String(value))?;
    }

    if root_key.is_empty() {
        return Ok(tree);
    }
    let mut node = &tree;
    for segment in root_key.trim_matches(|c: char| sep.contains(c)).split(sep) {
        match node.get(segment) {
            Some(child) => node = child,
            None => {
                debug!(root_key, "root key not present in reconstructed tree");
                return Ok(Value::Object(Map::new()));
            }
        }
    }
    Ok(node.clone())
}

/// Insert a scalar at a `/`-split key path, creating intermediate containers.
/// A digit-keyed child selects a list; an index may replace an existing slot
/// or extend the list by exactly one, never skip.
pub(crate) fn insert_path(tree: &mut Value, segments: &[&str], leaf: Value) -> Result<()> {
    let mut node = tree;
    for depth in 0..segments.len() {
        let segment = segments[depth];
        if depth == segments.len() - 1 {
            match node {
                Value::Object(map) => {
                    map.insert(segment.to_string(), leaf);
                }
                Value::Array(items) => {
                    let index = parse_index(segment, segments)?;
                    if index < items.len() {
                        items[index] = leaf;
                    } else if index == items.len() {
                        items.push(leaf);
                    } else {
                        return Err(Error::InvalidDocument(format!(
                            "list key {segments:?} skips index {}",
                            items.len()
                        )));
                    }
                }
                other => {
                    return Err(Error::InvalidDocument(format!(
                        "key {segments:?} descends into scalar {other}"
                    )));
                }
            }
            return Ok(());
        }

        let child_is_index = segments[depth + 1].bytes().all(|b| b.is_ascii_digit());
        let template = if child_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
        node = match node {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(template),
            Value::Array(items) => {
                let index = parse_index(segment, segments)?;
                if index == items.len() {
                    items.push(template);
                } else if index > items.len() {
                    return Err(Error::InvalidDocument(format!(
                        "list key {segments:?} skips index {}",
                        items.len()
                    )));
                }
                &mut items[index]
            }
            other => {
                return Err(Error::InvalidDocument(format!(
                    "key {segments:?} descends into scalar {other}"
                )));
            }
        };
    }
    Ok(())
}

fn parse_index(segment: &str, segments: &[&str]) -> Result<usize> {
    segment.parse().map_err(|_| {
        Error::InvalidDocument(format!(
            "expected numeric list index in {segments:?}, got {segment:?}"
        ))
    })
}

/// TLS options applied to every generated router when auto-HTTPS is on
#[derive(Debug, Clone, Default)]
pub struct RouterTls {
    pub enabled: bool,
    pub cert_resolver: Option<String>,
}

/// Renders routes into the two KV subtrees the proxy owns.
///
/// The jupyterhub prefix holds the index (source of truth for lookups); the
/// traefik prefix holds the router/service/middleware projection traefik
/// consumes.
#[derive(Debug, Clone)]
pub struct RouteRenderer {
    hub_prefix: String,
    traefik_prefix: String,
    sep: String,
    entrypoint: String,
    tls: RouterTls,
}

impl RouteRenderer {
    pub fn new(
        hub_prefix: impl Into<String>,
        traefik_prefix: impl Into<String>,
        sep: impl Into<String>,
        entrypoint: impl Into<String>,
        tls: RouterTls,
    ) -> Self {
        Self {
            hub_prefix: hub_prefix.into(),
            traefik_prefix: traefik_prefix.into(),
            sep: sep.into(),
            entrypoint: entrypoint.into(),
            tls,
        }
    }

    /// Key of the whole index subtree, with trailing separator
    pub fn index_tree_key(&self) -> String {
        let sep = &self.sep;
        format!("{}{sep}routes{sep}", self.hub_prefix)
    }

    /// Key of one route's index subtree, without trailing separator
    pub fn route_index_key(&self, spec: &RouteSpec) -> String {
        format!("{}{}", self.index_tree_key(), spec.escaped())
    }

    fn traefik_key(&self, path: &[&str]) -> String {
        let mut key = self.traefik_prefix.clone();
        for segment in path {
            key.push_str(&self.sep);
            key.push_str(segment);
        }
        key
    }

    /// The traefik `http` fragment for one route: router, service, and the
    /// strip-prefix middleware when the spec carries a non-root path.
    pub fn route_fragment(&self, spec: &RouteSpec, target: &str) -> Value {
        let name = spec.router_name();
        let mut router = json!({
            "rule": spec.rule(),
            "priority": spec.priority(),
            "service": name,
            "entryPoints": [self.entrypoint],
        });
        if spec.has_path_prefix() {
            router["middlewares"] = json!([spec.middleware_name()]);
        }
        if self.tls.enabled && !spec.is_default() {
            router["tls"] = match &self.tls.cert_resolver {
                Some(resolver) => json!({ "certResolver": resolver }),
                // an empty mapping would be dropped by the flattener
                None => json!({ "options": "default" }),
            };
        }

        let service = json!({
            "loadBalancer": {
                "servers": [{ "url": target }],
                "passHostHeader": true,
            }
        });

        let mut http = Map::new();
        http.insert(
            "routers".to_string(),
            Value::Object(Map::from_iter([(name.clone(), router)])),
        );
        http.insert(
            "services".to_string(),
            Value::Object(Map::from_iter([(name, service)])),
        );
        if spec.has_path_prefix() {
            let strip = json!({ "stripPrefix": { "prefixes": [spec.path_prefix()] } });
            http.insert(
                "middlewares".to_string(),
                Value::Object(Map::from_iter([(spec.middleware_name(), strip)])),
            );
        }
        json!({ "http": http })
    }

    /// The index fragment for one route, rooted at the escaped spec
    pub fn index_fragment(&self, spec: &RouteSpec, target: &str, data: &Value) -> Result<Value> {
        let entry = json!({
            "routespec": spec.as_str(),
            "target": target,
            "data": serde_json::to_string(data)?,
        });
        Ok(Value::Object(Map::from_iter([(spec.escaped(), entry)])))
    }

    /// The minimal atomic change adding (or replacing) one route.
    ///
    /// The route's previous subtrees are deleted in the same transaction, so
    /// a replacement never leaves orphan keys behind (including a middleware
    /// from an earlier spec shape).
    pub fn render_add(&self, spec: &RouteSpec, target: &str, data: &Value) -> Result<KvChange> {
        let mut change = self.render_delete(spec);

        let index = self.index_fragment(spec, target, data)?;
        change.set.extend(flatten(
            &index,
            &format!("{}{}routes", self.hub_prefix, self.sep),
            &self.sep,
        )?);
        change
            .set
            .extend(flatten(&self.route_fragment(spec, target), &self.traefik_prefix, &self.sep)?);
        Ok(change)
    }

    /// Every key belonging to one route, as recursive deletes.
    ///
    /// Keys are a pure function of the spec; no backend read is needed.
    pub fn render_delete(&self, spec: &RouteSpec) -> KvChange {
        let name = spec.router_name();
        let middleware = spec.middleware_name();
        let sep = &self.sep;
        KvChange {
            set: BTreeMap::new(),
            delete: vec![
                format!("{}{sep}", self.route_index_key(spec)),
                format!("{}{sep}", self.traefik_key(&["http", "routers", &name])),
                format!("{}{sep}", self.traefik_key(&["http", "services", &name])),
                format!("{}{sep}", self.traefik_key(&["http", "middlewares", &middleware])),
            ],
        }
    }

    /// Rebuild the full dynamic document from index entries.
    ///
    /// Used by the file backend on first load and for recovery after a
    /// crashed writer.
    pub fn project_from_index(&self, entries: &[RouteEntry]) -> Result<Value> {
        let mut doc = json!({});
        for entry in entries {
            let spec = RouteSpec::parse(&entry.routespec)?;
            deep_merge(&mut doc, &self.route_fragment(&spec, &entry.target));
        }
        Ok(doc)
    }

    /// Decode the index subtree (as returned by `get_tree` on the index key)
    /// into route entries, keyed by canonical routespec.
    pub fn decode_index(&self, flat: &BTreeMap<String, String>) -> Result<Vec<RouteEntry>> {
        let tree = unflatten(
            flat.iter().map(|(k, v)| (k.clone(), v.clone())),
            &self.index_tree_key(),
            &self.sep,
        )?;
        let Value::Object(routes) = tree else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::with_capacity(routes.len());
        for (escaped, node) in routes {
            match decode_entry(&node) {
                Some(entry) => entries.push(entry),
                None => {
                    // orphan left by a crashed writer: tolerated on read,
                    // reaped on the next mutation of the same spec
                    debug!(key = %escaped, "skipping incomplete index entry");
                }
            }
        }
        Ok(entries)
    }
}

fn decode_entry(node: &Value) -> Option<RouteEntry> {
    let routespec = node.get("routespec")?.as_str()?.to_string();
    let target = node.get("target")?.as_str()?.to_string();
    let raw_data = node.get("data")?.as_str()?;
    let data = serde_json::from_str(raw_data).unwrap_or(Value::Null);
    Some(RouteEntry {
        routespec,
        target,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> RouteRenderer {
        RouteRenderer::new("jupyterhub", "traefik", "/", "http", RouterTls::default())
    }

    #[test]
    fn test_flatten_nested_and_lists() {
        let doc = json!({
            "x": { "y": { "z": "a" }, "foo": "bar" },
            "baz": ["a", "b", "c"],
            "port": 8000,
            "watch": true,
        });
        let flat = flatten(&doc, "traefik", "/").unwrap();
        assert_eq!(flat["traefik/x/y/z"], json!("a"));
        assert_eq!(flat["traefik/x/foo"], json!("bar"));
        assert_eq!(flat["traefik/baz/0"], json!("a"));
        assert_eq!(flat["traefik/baz/2"], json!("c"));
        assert_eq!(flat["traefik/port"], json!(8000));
        assert_eq!(flat["traefik/watch"], json!(true));
    }

    #[test]
    fn test_flatten_empty_mapping_emits_nothing() {
        let doc = json!({ "a": { "b": {} }, "c": "kept" });
        let flat = flatten(&doc, "", "/").unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat["c"], json!("kept"));
    }

    #[test]
    fn test_flatten_rejects_null_leaf() {
        let doc = json!({ "a": null });
        assert!(flatten(&doc, "", "/").is_err());
    }

    #[test]
    fn test_unflatten_round_trip() {
        let doc = json!({
            "http": {
                "routers": { "r": { "rule": "PathPrefix(`/`)", "entryPoints": ["http"] } },
                "services": { "s": { "loadBalancer": { "servers": [{ "url": "http://x" }] } } },
            }
        });
        let flat = flatten(&doc, "traefik", "/").unwrap();
        let pairs = flat
            .iter()
            .map(|(k, v)| (k.clone(), scalar_to_kv_string(v).unwrap()));
        let rebuilt = unflatten(pairs, "traefik", "/").unwrap();
        assert_eq!(rebuilt["http"]["routers"]["r"]["rule"], json!("PathPrefix(`/`)"));
        assert_eq!(
            rebuilt["http"]["services"]["s"]["loadBalancer"]["servers"][0]["url"],
            json!("http://x")
        );
    }

    #[test]
    fn test_unflatten_missing_root_is_empty() {
        let rebuilt = unflatten(
            vec![("a/b".to_string(), "c".to_string())],
            "other",
            "/",
        )
        .unwrap();
        assert_eq!(rebuilt, json!({}));
    }

    #[test]
    fn test_unflatten_rejects_index_gap() {
        let pairs = vec![("a/0".to_string(), "x".to_string()), ("a/2".to_string(), "y".to_string())];
        assert!(unflatten(pairs, "", "/").is_err());
    }

    #[test]
    fn test_deep_merge_overlay_wins() {
        let mut base = json!({ "api": { "dashboard": true }, "log": { "level": "ERROR" } });
        deep_merge(
            &mut base,
            &json!({ "log": { "level": "DEBUG" }, "ping": {} }),
        );
        assert_eq!(base["log"]["level"], json!("DEBUG"));
        assert_eq!(base["api"]["dashboard"], json!(true));
        assert!(base["ping"].is_object());
    }

    #[test]
    fn test_render_add_sets_router_service_and_middleware() {
        let spec = RouteSpec::parse("/user/alice/").unwrap();
        let change = renderer()
            .render_add(&spec, "http://10.0.0.1:8888", &json!({"hub": "a"}))
            .unwrap();

        let name = spec.router_name();
        let rule_key = format!("traefik/http/routers/{name}/rule");
        assert_eq!(change.set[&rule_key], json!("PathPrefix(`/user/alice`)"));
        let url_key = format!("traefik/http/services/{name}/loadBalancer/servers/0/url");
        assert_eq!(change.set[&url_key], json!("http://10.0.0.1:8888"));
        let strip_key = format!(
            "traefik/http/middlewares/{}/stripPrefix/prefixes/0",
            spec.middleware_name()
        );
        assert_eq!(change.set[&strip_key], json!("/user/alice"));

        // replacement deletes the old subtrees in the same change
        assert!(change
            .delete
            .iter()
            .any(|k| k.starts_with("jupyterhub/routes/")));
        assert!(change
            .delete
            .iter()
            .any(|k| k.contains("/http/middlewares/")));
    }

    #[test]
    fn test_render_add_default_route_has_no_middleware() {
        let spec = RouteSpec::parse("/").unwrap();
        let change = renderer()
            .render_add(&spec, "http://hub:8081", &json!({}))
            .unwrap();
        assert!(!change.set.keys().any(|k| k.contains("/middlewares/")));
        let priority_key = format!("traefik/http/routers/{}/priority", spec.router_name());
        assert_eq!(change.set[&priority_key], json!(1));
    }

    #[test]
    fn test_render_add_host_root_has_no_middleware() {
        let spec = RouteSpec::parse("hub.example.com/").unwrap();
        let change = renderer()
            .render_add(&spec, "http://10.0.0.2:80", &json!({}))
            .unwrap();
        assert!(!change.set.keys().any(|k| k.contains("/middlewares/")));
        let rule_key = format!("traefik/http/routers/{}/rule", spec.router_name());
        assert_eq!(change.set[&rule_key], json!("Host(`hub.example.com`)"));
    }

    #[test]
    fn test_render_delete_enumerates_all_subtrees() {
        let spec = RouteSpec::parse("/x/").unwrap();
        let change = renderer().render_delete(&spec);
        assert!(change.set.is_empty());
        assert_eq!(change.delete.len(), 4);
        for key in &change.delete {
            assert!(key.ends_with('/'), "delete key {key} is not recursive");
        }
    }

    #[test]
    fn test_index_decode_round_trip() {
        let renderer = renderer();
        let spec = RouteSpec::parse("/user/alice/").unwrap();
        let data = json!({"hub": "a", "n": 3});
        let change = renderer.render_add(&spec, "http://10.0.0.1:8888", &data).unwrap();

        let flat: BTreeMap<String, String> = change
            .set
            .iter()
            .filter(|(k, _)| k.starts_with("jupyterhub/"))
            .map(|(k, v)| (k.clone(), scalar_to_kv_string(v).unwrap()))
            .collect();
        let entries = renderer.decode_index(&flat).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].routespec, "/user/alice/");
        assert_eq!(entries[0].target, "http://10.0.0.1:8888");
        assert_eq!(entries[0].data, data);
    }

    #[test]
    fn test_project_from_index() {
        let renderer = renderer();
        let entries = vec![
            RouteEntry {
                routespec: "/".to_string(),
                target: "http://hub:8081".to_string(),
                data: json!({}),
            },
            RouteEntry {
                routespec: "/user/alice/".to_string(),
                target: "http://10.0.0.1:8888".to_string(),
                data: json!({}),
            },
        ];
        let doc = renderer.project_from_index(&entries).unwrap();
        let routers = doc["http"]["routers"].as_object().unwrap();
        assert_eq!(routers.len(), 2);
        let middlewares = doc["http"]["middlewares"].as_object().unwrap();
        assert_eq!(middlewares.len(), 1);
    }
}
