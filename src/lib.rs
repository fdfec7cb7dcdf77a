//! Routegate - a routing-table controller for the traefik reverse proxy
//!
//! This library adapts a JupyterHub-style proxy management API onto traefik:
//! - Routes (`[host]/path/` prefix -> backend URL + opaque metadata) are
//!   translated into traefik routers, services, and middlewares
//! - Dynamic configuration persists into a backend traefik itself consumes:
//!   a TOML/YAML file, redis, etcd, or consul (deprecated)
//! - The jupyterhub index subtree is the source of truth for lookups; the
//!   traefik subtree is a projection
//! - An optional embedded traefik child process is supervised (spawn, log
//!   piping, readiness, SIGTERM/SIGKILL shutdown)
//! - Every mutation is confirmed against traefik's admin API before the
//!   call returns
//!
//! The entry point is [`RouteController`]: build it from a [`Config`], call
//! `start()`, then `add_route` / `delete_route` / `get_route` /
//! `get_all_routes`, and `stop()` on teardown.

pub mod api_client;
pub mod config;
pub mod consul_store;
pub mod controller;
pub mod error;
pub mod etcd_store;
pub mod file_store;
pub mod launcher;
pub mod redis_store;
pub mod routespec;
pub mod schema;
pub mod static_config;
pub mod store;

pub use config::{BackendKind, Config};
pub use controller::{LifecycleState, RouteController};
pub use error::{Error, Result};
pub use routespec::RouteSpec;
pub use schema::RouteEntry;
pub use store::KvStore;
