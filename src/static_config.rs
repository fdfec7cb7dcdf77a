//! Traefik static configuration and the initial dynamic documents
//!
//! The static document (entry points, admin API, provider, ACME) is read by
//! traefik only at startup; routes land in the dynamic configuration, whose
//! initial content is the basic-auth protection for the admin API.

use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::schema::deep_merge;
use crate::store::KvStore;

/// Entry point name serving ACME HTTP-01 challenges
pub const ACME_ENTRYPOINT: &str = "acme_challenge";
/// Entry point name serving the authenticated admin API
pub const API_ENTRYPOINT: &str = "auth_api";
/// Router name protecting the admin API
pub const API_ROUTER: &str = "api_access";
/// Middleware name carrying the admin basic-auth users
pub const API_MIDDLEWARE: &str = "api_auth";

/// The `user:hash` entry traefik's basicAuth middleware expects.
///
/// A pre-hashed password is used verbatim; otherwise the plaintext password
/// is hashed with bcrypt.
pub fn htpasswd_entry(
    username: &str,
    password: &str,
    hashed_password: Option<&str>,
) -> Result<String> {
    let hash = match hashed_password {
        Some(hash) => hash.to_string(),
        None => bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|err| Error::StartupFailed(format!("bcrypt hashing failed: {err}")))?,
    };
    Ok(format!("{username}:{hash}"))
}

/// Build the static configuration document for the given backend.
///
/// `extra_static_config` is merged last, so caller values win.
pub fn build_static_config(config: &Config, store: &dyn KvStore) -> Value {
    let traefik = &config.traefik;

    let mut entrypoints = Map::new();
    let mut public = json!({ "address": format!(":{}", traefik.http_port) });
    if traefik.https.enabled {
        // TLS by default on the public entry point; certificates come from
        // the ACME resolver for the configured domains
        let domains: Vec<Value> = traefik
            .https
            .letsencrypt_domains
            .iter()
            .map(|domain| json!({ "main": domain }))
            .collect();
        let mut tls = json!({ "certResolver": traefik.https.cert_resolver });
        if !domains.is_empty() {
            tls["domains"] = Value::Array(domains);
        }
        public["http"] = json!({ "tls": tls });
    }
    entrypoints.insert(traefik.entrypoint.clone(), public);
    entrypoints.insert(
        API_ENTRYPOINT.to_string(),
        json!({ "address": format!("127.0.0.1:{}", traefik.api_port()) }),
    );
    if traefik.https.enabled {
        entrypoints.insert(
            ACME_ENTRYPOINT.to_string(),
            json!({ "address": format!(":{}", traefik.https.acme_challenge_port) }),
        );
    }

    let mut providers = Map::new();
    providers.insert(
        store.provider_name().to_string(),
        store.provider_config(&config.kv.traefik_prefix),
    );

    let mut doc = json!({
        "log": { "level": traefik.log_level },
        "entryPoints": entrypoints,
        "api": { "dashboard": traefik.enable_dashboard, "insecure": false },
        "ping": { "entryPoint": API_ENTRYPOINT },
        "providers": providers,
    });

    if traefik.https.enabled {
        let acme = json!({
            "email": traefik.https.letsencrypt_email,
            "caServer": traefik.https.acme_server,
            "storage": "acme.json",
            "httpChallenge": { "entryPoint": ACME_ENTRYPOINT },
        });
        let mut resolvers = Map::new();
        resolvers.insert(traefik.https.cert_resolver.clone(), json!({ "acme": acme }));
        doc["certificatesResolvers"] = Value::Object(resolvers);
    }

    deep_merge(&mut doc, &config.extra_static_config);
    doc
}

/// Build the initial dynamic configuration: the admin API router bound to
/// `api@internal` behind basic auth, plus `extra_dynamic_config`.
pub fn build_initial_dynamic_config(config: &Config) -> Result<Value> {
    let traefik = &config.traefik;
    let users_entry = htpasswd_entry(
        &traefik.api_username,
        &traefik.api_password,
        traefik.api_hashed_password.as_deref(),
    )?;

    let router = json!({
        "rule": "PathPrefix(`/api`) || PathPrefix(`/dashboard`) || PathPrefix(`/ping`)",
        "entryPoints": [API_ENTRYPOINT],
        "service": "api@internal",
        "middlewares": [API_MIDDLEWARE],
    });
    let middleware = json!({ "basicAuth": { "users": [users_entry] } });
    let mut doc = json!({
        "http": {
            "routers": Value::Object(Map::from_iter([(API_ROUTER.to_string(), router)])),
            "middlewares": Value::Object(Map::from_iter([(API_MIDDLEWARE.to_string(), middleware)])),
        }
    });
    deep_merge(&mut doc, &config.extra_dynamic_config);
    Ok(doc)
}
