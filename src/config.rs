//! Configuration for the routing controller
//!
//! Loaded from TOML. Every section has serde defaults so a minimal file (or
//! none at all, via `Config::default()`) yields a working file-backed
//! controller.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::store::RetryConfig;

/// Global configuration for the controller
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Traefik process, admin API, and static config settings
    #[serde(default)]
    pub traefik: TraefikConfig,

    /// Key-value store key layout
    #[serde(default)]
    pub kv: KvConfig,

    /// Which backend holds the dynamic configuration
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub etcd: EtcdConfig,

    #[serde(default)]
    pub consul: ConsulConfig,

    /// Caller-supplied fragment merged into the static config (caller wins)
    #[serde(default = "empty_table")]
    pub extra_static_config: Value,

    /// Caller-supplied fragment merged into the initial dynamic config
    /// (caller wins)
    #[serde(default = "empty_table")]
    pub extra_dynamic_config: Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            traefik: TraefikConfig::default(),
            kv: KvConfig::default(),
            backend: BackendKind::default(),
            redis: RedisConfig::default(),
            etcd: EtcdConfig::default(),
            consul: ConsulConfig::default(),
            extra_static_config: empty_table(),
            extra_dynamic_config: empty_table(),
        }
    }
}

/// Backend holding the dynamic configuration
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single TOML or YAML file (default)
    #[default]
    File,
    Redis,
    Etcd,
    /// Deprecated; prefer redis
    Consul,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TraefikConfig {
    /// Authenticated admin API endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Username for the admin API login
    #[serde(default = "default_api_username")]
    pub api_username: String,

    /// Password for the admin API login; hashed with bcrypt unless
    /// `api_hashed_password` is given
    #[serde(default)]
    pub api_password: String,

    /// Pre-hashed admin password, used verbatim when set
    pub api_hashed_password: Option<String>,

    /// Validate the admin API's TLS certificate (default: true)
    #[serde(default = "default_true")]
    pub api_validate_cert: bool,

    /// Spawn traefik as a child process; when false the controller assumes
    /// an externally managed traefik and only talks to its admin API
    #[serde(default = "default_true")]
    pub should_start: bool,

    /// How long to wait for a mutation to appear in the live router set
    #[serde(default = "default_check_route_timeout")]
    pub check_route_timeout_secs: u64,

    /// How long to wait for traefik to answer its readiness probe at startup
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping traefik
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Static configuration file written before launching traefik
    #[serde(default = "default_static_config_file")]
    pub static_config_file: String,

    /// Dynamic configuration file (file backend only)
    #[serde(default = "default_dynamic_config_file")]
    pub dynamic_config_file: String,

    /// Traefik binary to launch
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Traefik's own log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Name of the public entry point routes are attached to
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,

    /// Port of the public entry point
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Serve the dashboard on the authenticated admin entry point
    #[serde(default = "default_true")]
    pub enable_dashboard: bool,

    /// Automatic HTTPS via ACME
    #[serde(default)]
    pub https: HttpsConfig,
}

impl Default for TraefikConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_username: default_api_username(),
            api_password: String::new(),
            api_hashed_password: None,
            api_validate_cert: true,
            should_start: true,
            check_route_timeout_secs: default_check_route_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            static_config_file: default_static_config_file(),
            dynamic_config_file: default_dynamic_config_file(),
            binary: default_binary(),
            log_level: default_log_level(),
            entrypoint: default_entrypoint(),
            http_port: default_http_port(),
            enable_dashboard: true,
            https: HttpsConfig::default(),
        }
    }
}

impl TraefikConfig {
    pub fn check_route_timeout(&self) -> Duration {
        Duration::from_secs(self.check_route_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Port of the admin entry point, taken from `api_url`
    pub fn api_port(&self) -> u16 {
        url::Url::parse(&self.api_url)
            .ok()
            .and_then(|url| url.port())
            .unwrap_or(8099)
    }
}

/// ACME / Let's Encrypt configuration for automatic certificates
#[derive(Debug, Deserialize, Clone)]
pub struct HttpsConfig {
    /// Enable auto-HTTPS; generated routers get a `tls` section and traefik
    /// gets a certificate resolver
    #[serde(default)]
    pub enabled: bool,

    /// Contact email, required when enabled
    pub letsencrypt_email: Option<String>,

    /// Domains to obtain certificates for
    #[serde(default)]
    pub letsencrypt_domains: Vec<String>,

    /// ACME directory URL; use the staging URL for testing
    #[serde(default = "default_acme_server")]
    pub acme_server: String,

    /// Port the HTTP-01 challenge entry point listens on
    #[serde(default = "default_acme_challenge_port")]
    pub acme_challenge_port: u16,

    /// Name of the certificate resolver referenced by generated routers
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            letsencrypt_email: None,
            letsencrypt_domains: Vec::new(),
            acme_server: default_acme_server(),
            acme_challenge_port: default_acme_challenge_port(),
            cert_resolver: default_cert_resolver(),
        }
    }
}

/// Key layout inside the KV store
#[derive(Debug, Deserialize, Clone)]
pub struct KvConfig {
    /// Prefix of the jupyterhub index subtree (source of truth for lookups)
    #[serde(default = "default_jupyterhub_prefix")]
    pub jupyterhub_prefix: String,

    /// Prefix of the traefik projection subtree (what traefik consumes)
    #[serde(default = "default_traefik_prefix")]
    pub traefik_prefix: String,

    /// Path separator used in keys
    #[serde(default = "default_separator")]
    pub separator: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            jupyterhub_prefix: default_jupyterhub_prefix(),
            traefik_prefix: default_traefik_prefix(),
            separator: default_separator(),
        }
    }
}

impl KvConfig {
    /// Strip trailing separators, and leading ones for consul (which rejects
    /// keys starting with the separator)
    fn normalize(&mut self, backend: BackendKind) {
        let sep = self.separator.clone();
        for prefix in [&mut self.jupyterhub_prefix, &mut self.traefik_prefix] {
            while prefix.ends_with(&sep) {
                prefix.truncate(prefix.len() - sep.len());
            }
            if backend == BackendKind::Consul {
                while prefix.starts_with(&sep) {
                    prefix.drain(..sep.len());
                }
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            username: None,
            password: None,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_url")]
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Tell traefik to skip verification of the etcd TLS certificate
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            url: default_etcd_url(),
            username: None,
            password: None,
            insecure_skip_verify: false,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_url")]
    pub url: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            url: default_consul_url(),
            token: None,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.kv.normalize(config.backend);
        config.validate()?;
        Ok(config)
    }

    /// Normalize prefixes and check internal consistency
    pub fn validate(&mut self) -> Result<()> {
        self.kv.normalize(self.backend);
        let sep = &self.kv.separator;
        if sep.is_empty() {
            return Err(Error::InvalidDocument(
                "kv.separator must not be empty".to_string(),
            ));
        }

        let hub = &self.kv.jupyterhub_prefix;
        let traefik = &self.kv.traefik_prefix;
        if hub.is_empty() || traefik.is_empty() {
            return Err(Error::InvalidDocument(
                "kv prefixes must not be empty".to_string(),
            ));
        }
        // the two subtrees must be disjoint: equal or nested prefixes would
        // let the projection clobber the index
        let hub_tree = format!("{hub}{sep}");
        let traefik_tree = format!("{traefik}{sep}");
        if hub == traefik || hub_tree.starts_with(&traefik_tree) || traefik_tree.starts_with(&hub_tree)
        {
            return Err(Error::InvalidDocument(format!(
                "kv prefixes {hub:?} and {traefik:?} are not disjoint"
            )));
        }

        if self.traefik.api_password.is_empty() && self.traefik.api_hashed_password.is_none() {
            return Err(Error::InvalidDocument(
                "traefik.api_password (or api_hashed_password) must be set".to_string(),
            ));
        }

        if self.traefik.https.enabled && self.traefik.https.letsencrypt_email.is_none() {
            return Err(Error::InvalidDocument(
                "traefik.https.letsencrypt_email is required when auto-HTTPS is enabled"
                    .to_string(),
            ));
        }

        if self.backend == BackendKind::File {
            // fail here rather than on the first write
            crate::file_store::ConfigFormat::from_path(Path::new(
                &self.traefik.dynamic_config_file,
            ))?;
        }
        Ok(())
    }
}

fn empty_table() -> Value {
    json!({})
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    "http://127.0.0.1:8099".to_string()
}

fn default_api_username() -> String {
    "api_admin".to_string()
}

fn default_check_route_timeout() -> u64 {
    60
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_static_config_file() -> String {
    "traefik.toml".to_string()
}

fn default_dynamic_config_file() -> String {
    "rules.toml".to_string()
}

fn default_binary() -> String {
    "traefik".to_string()
}

fn default_log_level() -> String {
    "ERROR".to_string()
}

fn default_entrypoint() -> String {
    "http".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_acme_server() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_acme_challenge_port() -> u16 {
    80
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

fn default_jupyterhub_prefix() -> String {
    "jupyterhub".to_string()
}

fn default_traefik_prefix() -> String {
    "traefik".to_string()
}

fn default_separator() -> String {
    "/".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_etcd_url() -> String {
    "http://127.0.0.1:2379".to_string()
}

fn default_consul_url() -> String {
    "http://127.0.0.1:8500".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let toml = r#"
            [traefik]
            api_password = "secret"
        "#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.backend, BackendKind::File);
        assert_eq!(config.traefik.api_url, "http://127.0.0.1:8099");
        assert_eq!(config.traefik.api_port(), 8099);
        assert_eq!(config.traefik.check_route_timeout(), Duration::from_secs(60));
        assert_eq!(config.kv.jupyterhub_prefix, "jupyterhub");
        assert_eq!(config.kv.traefik_prefix, "traefik");
        assert!(config.traefik.should_start);
    }

    #[test]
    fn test_backend_selection_and_driver_urls() {
        let toml = r#"
            backend = "redis"

            [traefik]
            api_password = "secret"

            [redis]
            url = "redis://cache.internal:6380"
            password = "hunter2"

            [redis.retry]
            max_elapsed_secs = 10
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.backend, BackendKind::Redis);
        assert_eq!(config.redis.url, "redis://cache.internal:6380");
        assert_eq!(config.redis.password.as_deref(), Some("hunter2"));
        assert_eq!(config.redis.retry.max_elapsed_secs, 10);
        // untouched sections keep their defaults
        assert_eq!(config.etcd.url, "http://127.0.0.1:2379");
    }

    #[test]
    fn test_prefixes_are_normalized() {
        let toml = r#"
            backend = "consul"

            [traefik]
            api_password = "secret"

            [kv]
            jupyterhub_prefix = "/jupyterhub/"
            traefik_prefix = "/traefik/"
        "#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.kv.jupyterhub_prefix, "jupyterhub");
        assert_eq!(config.kv.traefik_prefix, "traefik");
    }

    #[test]
    fn test_overlapping_prefixes_rejected() {
        let toml = r#"
            [traefik]
            api_password = "secret"

            [kv]
            jupyterhub_prefix = "traefik/jupyterhub"
        "#;
        let mut config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_password_rejected() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.traefik.api_hashed_password =
            Some("$2y$05$ZT3yfeMvdvmdSprMlWBfyOQOLfdhlTqWx5rGQBLKHg3IB0PkvrBnS".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_https_requires_email() {
        let mut config = Config::default();
        config.traefik.api_password = "secret".to_string();
        config.traefik.https.enabled = true;
        assert!(config.validate().is_err());

        config.traefik.https.letsencrypt_email = Some("ops@example.com".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_extra_config_fragments() {
        let toml = r#"
            [traefik]
            api_password = "secret"

            [extra_static_config.log]
            level = "DEBUG"

            [extra_dynamic_config.http.middlewares.compress.compress]
            excludedContentTypes = ["text/event-stream"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.extra_static_config["log"]["level"], json!("DEBUG"));
        assert!(config.extra_dynamic_config["http"]["middlewares"]["compress"].is_object());
    }
}
