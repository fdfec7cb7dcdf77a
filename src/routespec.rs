//! Route specifications and the traefik names derived from them
//!
//! A routespec is a URL prefix of the form `[host]/path/`:
//! - `/path/` for host-less (default) routing
//! - `host.tld/path/` for host-based routing
//!
//! Specs are normalized to always end with `/`; `/path` and `/path/` name the
//! same route.

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::{Error, Result};

/// Characters that survive unescaped in key-value store keys.
///
/// Everything else is percent-encoded, including `/`, which is structural in
/// etcd and consul key paths.
const KEY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'_')
    .remove(b'-');

/// A validated, canonicalized route specification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteSpec {
    canonical: String,
}

impl RouteSpec {
    /// Parse and canonicalize a raw routespec.
    ///
    /// Canonicalization appends the trailing `/` if missing, so `/x` and
    /// `/x/` compare equal. A spec that does not contain a path component is
    /// rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidRouteSpec {
                spec: raw.to_string(),
                reason: "routespec is empty".to_string(),
            });
        }
        if !raw.contains('/') {
            return Err(Error::InvalidRouteSpec {
                spec: raw.to_string(),
                reason: "routespec must contain a path starting with '/'".to_string(),
            });
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(Error::InvalidRouteSpec {
                spec: raw.to_string(),
                reason: "routespec must not contain whitespace".to_string(),
            });
        }
        let mut canonical = raw.to_string();
        if !canonical.ends_with('/') {
            canonical.push('/');
        }
        Ok(RouteSpec { canonical })
    }

    /// The canonical form, always ending with `/`
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Whether this is the default route `/`
    pub fn is_default(&self) -> bool {
        self.canonical == "/"
    }

    /// The host part, if this is a host-based route
    pub fn host(&self) -> Option<&str> {
        if self.canonical.starts_with('/') {
            None
        } else {
            let idx = self.canonical.find('/').expect("canonical spec has a '/'");
            Some(&self.canonical[..idx])
        }
    }

    /// The path part, starting and ending with `/`
    pub fn path(&self) -> &str {
        match self.canonical.find('/') {
            Some(idx) => &self.canonical[idx..],
            None => "/",
        }
    }

    /// The path without its trailing slash (except the root path).
    ///
    /// This is what goes into `PathPrefix` and the strip middleware, so that
    /// a route added as `/user/alice/` also matches `/user/alice`.
    pub fn path_prefix(&self) -> &str {
        let path = self.path();
        if path == "/" {
            path
        } else {
            path.trim_end_matches('/')
        }
    }

    /// Whether the route carries a non-root path and therefore needs a
    /// prefix-stripping middleware
    pub fn has_path_prefix(&self) -> bool {
        self.path_prefix() != "/"
    }

    /// The traefik router rule matching this spec
    pub fn rule(&self) -> String {
        match self.host() {
            None => format!("PathPrefix(`{}`)", self.path_prefix()),
            Some(host) => {
                if self.has_path_prefix() {
                    format!("Host(`{}`) && PathPrefix(`{}`)", host, self.path_prefix())
                } else {
                    format!("Host(`{}`)", host)
                }
            }
        }
    }

    /// Router priority: strictly increasing with spec length, so `/a/b/`
    /// beats `/a/` beats the default route `/` (priority 1).
    pub fn priority(&self) -> u64 {
        self.canonical.len() as u64
    }

    /// The escaped form used in KV keys and traefik object names
    pub fn escaped(&self) -> String {
        escape_key(&self.canonical)
    }

    /// The router (and service) name for this route
    pub fn router_name(&self) -> String {
        format!("jupyterhub_{}", self.escaped())
    }

    /// The prefix-stripping middleware name for this route
    pub fn middleware_name(&self) -> String {
        format!("jupyterhub_{}_strip", self.escaped())
    }

    /// Recover a spec from its escaped form
    pub fn from_escaped(escaped: &str) -> Result<Self> {
        let raw = unescape_key(escaped)?;
        RouteSpec::parse(&raw)
    }
}

impl std::fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9._-]`.
///
/// Injective and case-preserving, so escaped specs are safe as single
/// key-path components in any of the supported stores.
pub fn escape_key(value: &str) -> String {
    percent_encode(value.as_bytes(), KEY_ESCAPE).to_string()
}

/// Invert [`escape_key`]
pub fn unescape_key(escaped: &str) -> Result<String> {
    percent_decode_str(escaped)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|err| Error::InvalidDocument(format!("key {escaped:?} is not valid utf-8: {err}")))
}
