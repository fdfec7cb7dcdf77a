//! The routing controller: public routing API over a KV backend and traefik
//!
//! `RouteController` owns the backend connection, the optional traefik child
//! process, and an overlay cache of the jupyterhub index subtree that
//! guarantees read-your-writes against eventually-consistent backends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::api_client::{RoutePresence, TraefikApiClient};
use crate::config::{BackendKind, Config};
use crate::consul_store::ConsulStore;
use crate::error::{Error, Result};
use crate::etcd_store::EtcdStore;
use crate::file_store::FileStore;
use crate::launcher::{self, TraefikProcess};
use crate::redis_store::RedisStore;
use crate::routespec::RouteSpec;
use crate::schema::{self, flatten, RouteEntry, RouteRenderer, RouterTls};
use crate::static_config;
use crate::store::KvStore;

/// Controller lifecycle; mutations are only accepted while `Running`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn name(self) -> &'static str {
        match self {
            LifecycleState::New => "new",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// Overlay over backend reads recording our own recent mutations, so a
/// lookup right after a successful mutation always reflects it even if the
/// backend read path is stale.
#[derive(Default)]
struct RouteCache {
    entries: HashMap<String, RouteEntry>,
    tombstones: HashSet<String>,
}

impl RouteCache {
    fn record_add(&mut self, entry: RouteEntry) {
        self.tombstones.remove(&entry.routespec);
        self.entries.insert(entry.routespec.clone(), entry);
    }

    fn record_delete(&mut self, routespec: &str) {
        self.entries.remove(routespec);
        self.tombstones.insert(routespec.to_string());
    }

    fn overlay(&self, routes: &mut HashMap<String, RouteEntry>) {
        for spec in &self.tombstones {
            routes.remove(spec);
        }
        for (spec, entry) in &self.entries {
            routes.insert(spec.clone(), entry.clone());
        }
    }
}

pub struct RouteController {
    config: Config,
    store: Arc<dyn KvStore>,
    api: TraefikApiClient,
    renderer: RouteRenderer,
    state: RwLock<LifecycleState>,
    cache: RwLock<RouteCache>,
    // serializes operations on the same routespec; distinct specs interleave
    spec_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    process: AsyncMutex<Option<TraefikProcess>>,
    // mutations hold it shared; stop() takes it exclusively to drain them
    ops_gate: tokio::sync::RwLock<()>,
}

impl RouteController {
    /// Validate the configuration, connect the chosen backend, and build the
    /// controller in the `new` state. Call [`start`](Self::start) next.
    pub async fn new(mut config: Config) -> Result<Self> {
        config.validate()?;
        let sep = config.kv.separator.clone();
        let store: Arc<dyn KvStore> = match config.backend {
            BackendKind::File => Arc::new(FileStore::new(
                &config.traefik.dynamic_config_file,
                &config.kv.traefik_prefix,
                &sep,
            )?),
            BackendKind::Redis => Arc::new(RedisStore::connect(&config.redis, &sep).await?),
            BackendKind::Etcd => Arc::new(EtcdStore::connect(&config.etcd, &sep).await?),
            BackendKind::Consul => Arc::new(ConsulStore::connect(&config.consul, &sep).await?),
        };
        let api = TraefikApiClient::new(&config.traefik)?;
        let renderer = RouteRenderer::new(
            &config.kv.jupyterhub_prefix,
            &config.kv.traefik_prefix,
            &sep,
            &config.traefik.entrypoint,
            RouterTls {
                enabled: config.traefik.https.enabled,
                cert_resolver: config
                    .traefik
                    .https
                    .enabled
                    .then(|| config.traefik.https.cert_resolver.clone()),
            },
        );

        Ok(Self {
            config,
            store,
            api,
            renderer,
            state: RwLock::new(LifecycleState::New),
            cache: RwLock::new(RouteCache::default()),
            spec_locks: DashMap::new(),
            process: AsyncMutex::new(None),
            ops_gate: tokio::sync::RwLock::new(()),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> Result<()> {
        let mut state = self.state.write();
        if !from.contains(&*state) {
            return Err(Error::InvalidState {
                state: state.name(),
                required: from.first().map(|s| s.name()).unwrap_or("unreachable"),
            });
        }
        info!(from = state.name(), to = to.name(), "controller state transition");
        *state = to;
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        let state = *self.state.read();
        if state != LifecycleState::Running {
            return Err(Error::InvalidState {
                state: state.name(),
                required: "running",
            });
        }
        Ok(())
    }

    /// Write the initial dynamic configuration (admin API auth) and the
    /// static configuration, optionally spawn traefik, wait for readiness,
    /// and seed the overlay cache from the backend.
    pub async fn start(&self) -> Result<()> {
        self.transition(
            &[LifecycleState::New, LifecycleState::Stopped],
            LifecycleState::Starting,
        )?;
        match self.start_inner().await {
            Ok(()) => {
                self.transition(&[LifecycleState::Starting], LifecycleState::Running)?;
                Ok(())
            }
            Err(err) => {
                // do not leak a child whose controller failed to come up
                if let Some(process) = self.process.lock().await.take() {
                    process
                        .stop(self.config.traefik.shutdown_grace_period())
                        .await;
                }
                let _ = self.transition(&[LifecycleState::Starting], LifecycleState::Stopped);
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        // admin API protection lives in the dynamic config, next to the routes
        let initial_dynamic = static_config::build_initial_dynamic_config(&self.config)?;
        let entries = flatten(
            &initial_dynamic,
            &self.config.kv.traefik_prefix,
            &self.config.kv.separator,
        )?;
        self.store.atomic_set(entries).await?;

        if self.config.traefik.should_start {
            let static_doc = static_config::build_static_config(&self.config, self.store.as_ref());
            let process = launcher::launch(&self.config.traefik, &static_doc, &self.api).await?;
            *self.process.lock().await = Some(process);
        } else {
            debug!("should_start is false, assuming externally managed traefik");
        }

        // restart recovery: the routing table outlives any controller instance
        let index = self.store.get_tree(&self.renderer.index_tree_key()).await?;
        let entries = self.renderer.decode_index(&index)?;
        let route_count = entries.len();
        {
            let mut cache = self.cache.write();
            *cache = RouteCache::default();
            for entry in entries {
                cache.entries.insert(entry.routespec.clone(), entry);
            }
        }
        info!(route_count, backend = self.store.provider_name(), "controller started");
        Ok(())
    }

    /// Drain in-flight mutations, stop the traefik child, and release the
    /// backend. The routing table itself is left untouched: other
    /// controllers may be running against the same backend.
    pub async fn stop(&self) -> Result<()> {
        self.transition(&[LifecycleState::Running], LifecycleState::Stopping)?;

        let drain = self.config.traefik.shutdown_grace_period();
        if tokio::time::timeout(drain, self.ops_gate.write()).await.is_err() {
            warn!(
                drain_secs = drain.as_secs(),
                "in-flight mutations did not drain, stopping anyway"
            );
        }

        if let Some(process) = self.process.lock().await.take() {
            process
                .stop(self.config.traefik.shutdown_grace_period())
                .await;
        }
        self.store.close().await?;
        self.transition(&[LifecycleState::Stopping], LifecycleState::Stopped)?;
        Ok(())
    }

    fn spec_lock(&self, spec: &RouteSpec) -> Arc<AsyncMutex<()>> {
        self.spec_locks
            .entry(spec.as_str().to_string())
            .or_default()
            .clone()
    }

    /// Add (or replace) a route. Succeeds only once the route is observable
    /// in the live traefik router set; on convergence timeout the backend
    /// write is kept and [`Error::RouteNotConverged`] is returned.
    pub async fn add_route(&self, routespec: &str, target: &str, data: Value) -> Result<()> {
        self.ensure_running()?;
        let spec = RouteSpec::parse(routespec)?;
        url::Url::parse(target).map_err(|err| Error::InvalidRouteSpec {
            spec: routespec.to_string(),
            reason: format!("target {target:?} is not a valid url: {err}"),
        })?;

        let _op = self.ops_gate.read().await;
        let lock = self.spec_lock(&spec);
        let _guard = lock.lock().await;

        let entry = RouteEntry {
            routespec: spec.as_str().to_string(),
            target: target.to_string(),
            data,
        };
        {
            let cache = self.cache.read();
            if cache.entries.get(spec.as_str()) == Some(&entry) {
                debug!(routespec = %spec, "route already present, nothing to do");
                return Ok(());
            }
        }

        info!(routespec = %spec, target, "adding route");
        let change = self.renderer.render_add(&spec, target, &entry.data)?;
        self.store.apply(change).await?;
        self.cache.write().record_add(entry);

        self.wait_for_route(&spec, RoutePresence::Present).await
    }

    /// Delete a route. Deleting a route that does not exist is a successful
    /// no-op; the keys to delete are a pure function of the spec.
    pub async fn delete_route(&self, routespec: &str) -> Result<()> {
        self.ensure_running()?;
        let spec = RouteSpec::parse(routespec)?;

        let _op = self.ops_gate.read().await;
        let lock = self.spec_lock(&spec);
        let _guard = lock.lock().await;

        info!(routespec = %spec, "deleting route");
        let change = self.renderer.render_delete(&spec);
        self.store.apply(change).await?;
        self.cache.write().record_delete(spec.as_str());

        self.wait_for_route(&spec, RoutePresence::Absent).await
    }

    /// Look up one route by spec. `/x` and `/x/` name the same route.
    pub async fn get_route(&self, routespec: &str) -> Result<Option<RouteEntry>> {
        let spec = RouteSpec::parse(routespec)?;
        {
            let cache = self.cache.read();
            if cache.tombstones.contains(spec.as_str()) {
                return Ok(None);
            }
            if let Some(entry) = cache.entries.get(spec.as_str()) {
                return Ok(Some(entry.clone()));
            }
        }

        // not something this controller wrote recently: ask the backend
        let sep = &self.config.kv.separator;
        let tree = self
            .store
            .get_tree(&format!("{}{sep}", self.renderer.route_index_key(&spec)))
            .await?;
        if tree.is_empty() {
            return Ok(None);
        }
        let entries = self.renderer.decode_index(&tree)?;
        Ok(entries.into_iter().next())
    }

    /// Like [`get_route`](Self::get_route) but a missing route is an error
    pub async fn route(&self, routespec: &str) -> Result<RouteEntry> {
        self.get_route(routespec)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no route for {routespec:?}")))
    }

    /// Snapshot of all routes, keyed by canonical routespec. Not
    /// synchronized against concurrent mutations.
    pub async fn get_all_routes(&self) -> Result<HashMap<String, RouteEntry>> {
        let index = self.store.get_tree(&self.renderer.index_tree_key()).await?;
        let mut routes: HashMap<String, RouteEntry> = self
            .renderer
            .decode_index(&index)?
            .into_iter()
            .map(|entry| (entry.routespec.clone(), entry))
            .collect();
        self.cache.read().overlay(&mut routes);
        Ok(routes)
    }

    /// Rebuild the whole traefik projection from the index subtree.
    ///
    /// Recovery hatch for a projection damaged by a crashed writer: the
    /// projection subtree is wiped and rewritten from the index (plus the
    /// admin-API protection), in one transaction where the backend supports
    /// it.
    pub async fn rebuild_projection(&self) -> Result<()> {
        self.ensure_running()?;
        let _op = self.ops_gate.read().await;

        let index = self.store.get_tree(&self.renderer.index_tree_key()).await?;
        let entries = self.renderer.decode_index(&index)?;
        let mut doc = static_config::build_initial_dynamic_config(&self.config)?;
        schema::deep_merge(&mut doc, &self.renderer.project_from_index(&entries)?);

        let sep = &self.config.kv.separator;
        let traefik_prefix = &self.config.kv.traefik_prefix;
        // wipe the generated sections, then rewrite them from the index
        let change = schema::KvChange {
            delete: ["routers", "services", "middlewares"]
                .iter()
                .map(|section| format!("{traefik_prefix}{sep}http{sep}{section}{sep}"))
                .collect(),
            set: flatten(&doc, traefik_prefix, sep)?,
        };
        info!(route_count = entries.len(), "rebuilding traefik projection from index");
        self.store.apply(change).await
    }

    async fn wait_for_route(&self, spec: &RouteSpec, presence: RoutePresence) -> Result<()> {
        let timeout = self.config.traefik.check_route_timeout();
        if timeout.is_zero() {
            // convergence checking disabled
            return Ok(());
        }
        self.api.wait_for_route(spec, presence, timeout).await
    }

    /// The admin API client, for embedders that want to inspect the live
    /// router set directly.
    pub fn api(&self) -> &TraefikApiClient {
        &self.api
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.traefik.api_password = "secret".to_string();
        config.traefik.should_start = false;
        // no traefik in unit tests: disable the convergence wait
        config.traefik.check_route_timeout_secs = 0;
        config.traefik.dynamic_config_file = dir
            .path()
            .join("rules.toml")
            .to_string_lossy()
            .into_owned();
        config
    }

    async fn running_controller(dir: &tempfile::TempDir) -> RouteController {
        let controller = RouteController::new(test_config(dir)).await.unwrap();
        controller.start().await.unwrap();
        controller
    }

    #[tokio::test]
    async fn test_mutations_rejected_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let controller = RouteController::new(test_config(&dir)).await.unwrap();
        assert_eq!(controller.state(), LifecycleState::New);

        let err = controller
            .add_route("/x/", "http://10.0.0.1:8888", json!({}))
            .await
            .unwrap_err();
        match err {
            Error::InvalidState { state, required } => {
                assert_eq!(state, "new");
                assert_eq!(required, "running");
            }
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_add_then_get_with_either_spelling() {
        let dir = tempfile::tempdir().unwrap();
        let controller = running_controller(&dir).await;
        controller
            .add_route("/user/alice/", "http://10.0.0.1:8888", json!({"hub": "a"}))
            .await
            .unwrap();

        for spelling in ["/user/alice", "/user/alice/"] {
            let route = controller.get_route(spelling).await.unwrap().unwrap();
            assert_eq!(route.routespec, "/user/alice/");
            assert_eq!(route.target, "http://10.0.0.1:8888");
            assert_eq!(route.data, json!({"hub": "a"}));
        }
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = running_controller(&dir).await;
        let err = controller
            .add_route("/x/", "not a url", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRouteSpec { .. }));
    }

    #[tokio::test]
    async fn test_delete_route_and_idempotent_delete() {
        let dir = tempfile::tempdir().unwrap();
        let controller = running_controller(&dir).await;
        controller
            .add_route("/x/", "http://10.0.0.1:8888", json!({}))
            .await
            .unwrap();
        controller.delete_route("/x/").await.unwrap();
        assert!(controller.get_route("/x/").await.unwrap().is_none());

        // deleting a missing route succeeds and changes nothing
        controller.delete_route("/missing/").await.unwrap();
        assert!(controller.get_all_routes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replacement_leaves_single_router_pair() {
        let dir = tempfile::tempdir().unwrap();
        let controller = running_controller(&dir).await;
        controller
            .add_route("/x/", "http://10.0.0.1:1111", json!({}))
            .await
            .unwrap();
        controller
            .add_route("/x/", "http://10.0.0.2:2222", json!({}))
            .await
            .unwrap();

        let route = controller.get_route("/x/").await.unwrap().unwrap();
        assert_eq!(route.target, "http://10.0.0.2:2222");

        let routers = controller
            .store
            .get_tree("traefik/http/routers/")
            .await
            .unwrap();
        let rules: Vec<&String> = routers
            .keys()
            .filter(|k| k.contains("jupyterhub_") && k.ends_with("/rule"))
            .collect();
        assert_eq!(rules.len(), 1, "expected one router, got {routers:?}");
        let services = controller
            .store
            .get_tree("traefik/http/services/")
            .await
            .unwrap();
        let urls: Vec<&String> = services.keys().filter(|k| k.ends_with("/url")).collect();
        assert_eq!(urls.len(), 1);
    }

    #[tokio::test]
    async fn test_identical_add_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let controller = running_controller(&dir).await;
        controller
            .add_route("/x/", "http://10.0.0.1:8888", json!({"a": 1}))
            .await
            .unwrap();
        controller
            .add_route("/x", "http://10.0.0.1:8888", json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(controller.get_all_routes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let controller = running_controller(&dir).await;
            controller
                .add_route("/a/", "http://10.0.0.9:9999", json!({"user": "a"}))
                .await
                .unwrap();
            controller.stop().await.unwrap();
        }

        let controller = running_controller(&dir).await;
        let routes = controller.get_all_routes().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes["/a/"].target, "http://10.0.0.9:9999");
        assert_eq!(routes["/a/"].data, json!({"user": "a"}));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let controller = running_controller(&dir).await;
        assert_eq!(controller.state(), LifecycleState::Running);

        // concurrent start is rejected by the state machine
        assert!(matches!(
            controller.start().await,
            Err(Error::InvalidState { .. })
        ));

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Stopped);

        // mutations are rejected once stopped
        assert!(matches!(
            controller.delete_route("/x/").await,
            Err(Error::InvalidState { .. })
        ));

        // a stopped controller can be started again
        controller.start().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_projection_reaps_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let controller = running_controller(&dir).await;
        controller
            .add_route("/a/", "http://10.0.0.1:8888", json!({}))
            .await
            .unwrap();

        // simulate a crashed writer: a router with no index entry
        let orphan: std::collections::BTreeMap<String, serde_json::Value> = [(
            "traefik/http/routers/jupyterhub_orphan/rule".to_string(),
            json!("PathPrefix(`/orphan`)"),
        )]
        .into_iter()
        .collect();
        controller.store.atomic_set(orphan).await.unwrap();

        controller.rebuild_projection().await.unwrap();

        let routers = controller
            .store
            .get_tree("traefik/http/routers/")
            .await
            .unwrap();
        assert!(!routers.keys().any(|k| k.contains("jupyterhub_orphan")));
        // the real route and the admin-api protection survive
        assert!(routers.keys().any(|k| k.contains("jupyterhub_%2Fa%2F")));
        assert!(routers.keys().any(|k| k.contains("api_access")));
        let middlewares = controller
            .store
            .get_tree("traefik/http/middlewares/")
            .await
            .unwrap();
        assert!(middlewares.keys().any(|k| k.contains("api_auth")));
    }

    #[tokio::test]
    async fn test_required_route_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let controller = running_controller(&dir).await;
        assert!(matches!(
            controller.route("/nope/").await,
            Err(Error::NotFound(_))
        ));
    }
}
