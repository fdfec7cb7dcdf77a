//! Authenticated client for traefik's admin API
//!
//! After every mutation the proxy polls `/api/http/routers` here until the
//! mutation is reflected in the live router set. Transient 5xx responses and
//! connection resets are tolerated within the timeout window.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TraefikConfig;
use crate::error::{Error, Result};
use crate::routespec::RouteSpec;

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whether a waiter expects the router to appear or disappear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePresence {
    Present,
    Absent,
}

/// Admin API major version; response shapes differ slightly between the two
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V2,
    V3,
}

/// One entry of `GET /api/http/routers`
#[derive(Debug, Clone, Deserialize)]
pub struct RouterStatus {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub rule: Option<String>,
}

impl RouterStatus {
    /// Router names come back suffixed with their provider (`name@redis`)
    fn matches(&self, router_name: &str) -> bool {
        let bare = self
            .name
            .split_once('@')
            .map(|(name, _)| name)
            .unwrap_or(&self.name);
        bare == router_name
    }

    /// v3 always reports a status; v2 omits it on some code paths, where a
    /// listed router is already live
    fn is_enabled(&self, version: ApiVersion) -> bool {
        match (&self.status, version) {
            (Some(status), _) => status == "enabled",
            (None, ApiVersion::V2) => true,
            (None, ApiVersion::V3) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "Version", alias = "version")]
    version: Option<String>,
}

pub struct TraefikApiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    version: tokio::sync::OnceCell<ApiVersion>,
}

impl TraefikApiClient {
    pub fn new(config: &TraefikConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.api_validate_cert)
            .build()
            .map_err(|err| Error::StartupFailed(format!("admin api client setup failed: {err}")))?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            username: config.api_username.clone(),
            password: config.api_password.clone(),
            version: tokio::sync::OnceCell::new(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Readiness probe; any 2xx counts
    pub async fn ping(&self) -> bool {
        match self.get("/ping").send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(error = %err, "traefik ping failed");
                false
            }
        }
    }

    /// Admin API version, detected once and cached. An undetectable version
    /// is treated as v2, the more lenient of the two.
    pub async fn api_version(&self) -> ApiVersion {
        *self
            .version
            .get_or_init(|| async {
                match self.fetch_version().await {
                    Some(version) => version,
                    None => {
                        debug!("could not detect traefik api version, assuming v2");
                        ApiVersion::V2
                    }
                }
            })
            .await
    }

    async fn fetch_version(&self) -> Option<ApiVersion> {
        let response = self.get("/api/version").send().await.ok()?;
        let info: VersionInfo = response.json().await.ok()?;
        let raw = info.version?;
        let version = if raw.starts_with('3') {
            ApiVersion::V3
        } else {
            ApiVersion::V2
        };
        info!(version = %raw, "detected traefik api version");
        Some(version)
    }

    async fn routers(&self) -> std::result::Result<Vec<RouterStatus>, String> {
        let response = self
            .get("/api/http/routers")
            .send()
            .await
            .map_err(|err| format!("routers request failed: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("routers request returned {status}"));
        }
        response
            .json::<Vec<RouterStatus>>()
            .await
            .map_err(|err| format!("routers response decode failed: {err}"))
    }

    /// Poll `/ping` until traefik answers or `timeout` elapses
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let mut interval = INITIAL_POLL_INTERVAL;
        loop {
            if self.ping().await {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "traefik is ready");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::StartupFailed(format!(
                    "traefik did not answer {}/ping within {timeout:?}",
                    self.base_url
                )));
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Poll the live router set until the route's router appears enabled (or
    /// disappears, for deletes), or `timeout` elapses.
    pub async fn wait_for_route(
        &self,
        spec: &RouteSpec,
        presence: RoutePresence,
        timeout: Duration,
    ) -> Result<()> {
        let router_name = spec.router_name();
        let version = self.api_version().await;
        let started = Instant::now();
        let mut interval = INITIAL_POLL_INTERVAL;

        loop {
            match self.routers().await {
                Ok(routers) => {
                    let live = routers
                        .iter()
                        .any(|router| router.matches(&router_name) && router.is_enabled(version));
                    let converged = match presence {
                        RoutePresence::Present => live,
                        RoutePresence::Absent => !live,
                    };
                    if converged {
                        debug!(
                            routespec = %spec,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "route converged"
                        );
                        return Ok(());
                    }
                }
                // transient: traefik may be mid-reload or briefly unreachable
                Err(err) => debug!(routespec = %spec, error = %err, "router poll failed"),
            }

            if started.elapsed() >= timeout {
                warn!(routespec = %spec, ?presence, "route did not converge in time");
                return Err(Error::RouteNotConverged {
                    routespec: spec.as_str().to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Expose transient HTTP errors for callers that poll on their own
    pub async fn list_routers(&self) -> Result<Vec<RouterStatus>> {
        self.routers().await.map_err(|message| Error::BackendUnavailable {
            attempts: 1,
            message,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_status_parses_v2_and_v3_shapes() {
        let v2 = r#"[{"name": "jupyterhub_%2Fx%2F@file", "rule": "PathPrefix(`/x`)"}]"#;
        let routers: Vec<RouterStatus> = serde_json::from_str(v2).unwrap();
        assert!(routers[0].matches("jupyterhub_%2Fx%2F"));
        assert!(routers[0].is_enabled(ApiVersion::V2));
        assert!(!routers[0].is_enabled(ApiVersion::V3));

        let v3 = r#"[{"name": "jupyterhub_%2Fx%2F@redis", "status": "enabled", "using": ["http"]}]"#;
        let routers: Vec<RouterStatus> = serde_json::from_str(v3).unwrap();
        assert!(routers[0].is_enabled(ApiVersion::V3));
    }

    #[test]
    fn test_router_name_matching_strips_provider() {
        let router = RouterStatus {
            name: "jupyterhub_%2Fa%2F@etcd".to_string(),
            status: Some("enabled".to_string()),
            rule: None,
        };
        assert!(router.matches("jupyterhub_%2Fa%2F"));
        assert!(!router.matches("jupyterhub_%2Fa"));
        assert!(!router.matches("jupyterhub_%2Fa%2Fb%2F"));
    }

    #[test]
    fn test_disabled_router_is_not_live() {
        let router = RouterStatus {
            name: "jupyterhub_x@file".to_string(),
            status: Some("disabled".to_string()),
            rule: None,
        };
        assert!(!router.is_enabled(ApiVersion::V2));
        assert!(!router.is_enabled(ApiVersion::V3));
    }
}
