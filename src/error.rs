//! Error taxonomy surfaced to the proxy's caller
//!
//! Internal failures (connection resets, transient 5xx from traefik) are
//! retried; only terminal failures cross the API boundary as one of these
//! variants.

use std::time::Duration;

/// Errors produced by the proxy and its key-value backends
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The route specification could not be parsed
    #[error("invalid route specification {spec:?}: {reason}")]
    InvalidRouteSpec { spec: String, reason: String },

    /// The key-value backend stayed unreachable after bounded retries
    #[error("key-value backend unavailable after {attempts} attempt(s): {message}")]
    BackendUnavailable { attempts: u32, message: String },

    /// Traefik did not become ready within the startup timeout
    #[error("traefik startup failed: {0}")]
    StartupFailed(String),

    /// The backend write succeeded but traefik did not pick it up in time.
    /// The write is not rolled back; the caller may retry the wait.
    #[error("route {routespec:?} not visible in traefik after {timeout:?}")]
    RouteNotConverged {
        routespec: String,
        timeout: Duration,
    },

    /// A multi-chunk transaction failed partway and rollback was best-effort
    #[error("partial write to key-value store: {0}")]
    PartialWrite(String),

    /// A key or route that was expected to exist is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not allowed in the proxy's current lifecycle state
    #[error("proxy is {state}, operation requires {required}")]
    InvalidState {
        state: &'static str,
        required: &'static str,
    },

    /// A document could not be flattened or reconstructed for the KV schema
    #[error("invalid configuration document: {0}")]
    InvalidDocument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a retry of the failed backend operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialize(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialize(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialize(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialize(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_route_and_timeout() {
        let err = Error::RouteNotConverged {
            routespec: "/user/alice/".to_string(),
            timeout: Duration::from_secs(60),
        };
        let msg = err.to_string();
        assert!(msg.contains("/user/alice/"));
        assert!(msg.contains("60"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::BackendUnavailable {
            attempts: 3,
            message: "connection refused".to_string(),
        }
        .is_transient());
        assert!(!Error::NotFound("x".to_string()).is_transient());
    }
}
