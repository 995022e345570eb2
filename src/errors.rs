use std::sync::Arc;
use std::time::Duration;

/// All error types that can occur when talking to Hue bridges.
///
/// Errors are cheap to clone so that a single outcome can be delivered to
/// every caller waiting on the same write or request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Failed to serialize data to JSON.
    #[error("failed to dump json: {0:?}")]
    JsonDump(Arc<serde_json::Error>),

    /// Failed to deserialize JSON data from a bridge.
    #[error("failed to load json: {0:?}")]
    JsonLoad(Arc<serde_json::Error>),

    /// The bridge's `description.xml` could not be parsed.
    #[error("failed to parse description xml: {0}")]
    Xml(String),

    /// A network socket operation failed.
    #[error("socket {action} error: {err:?}")]
    Socket {
        action: String,
        err: Arc<std::io::Error>,
    },

    /// The HTTP transport failed before a response was received.
    #[error("http transport error: {0}")]
    Transport(String),

    /// No response arrived within the request's timeout.
    #[error("request timed out")]
    Timeout,

    /// The bridge answered with an unexpected HTTP status.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    /// The bridge answered, but not with anything we understand.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// An operation requiring a verified bridge was attempted too early.
    #[error("bridge {0} has not been verified")]
    NotVerified(String),

    /// Registration was attempted without pressing the bridge's link button.
    #[error("link button not pressed")]
    LinkButtonNotPressed,

    /// The bridge rejected our credential.
    #[error("not registered with bridge: {0}")]
    NotRegistered(String),

    /// Any other error reported by the bridge's API.
    #[error("bridge error {kind} at {address}: {description}")]
    Api {
        kind: u32,
        address: String,
        description: String,
    },

    /// [`crate::Registry::start_discovery`] was called while discovery is active.
    #[error("discovery is already running")]
    AlreadyRunning,

    /// A discovery cycle was requested before discovery was started.
    #[error("discovery has not been started")]
    DiscoveryNotStarted,

    /// The discovery interval is shorter than one second.
    #[error("discovery interval must be at least one second, got {0:?}")]
    InvalidInterval(Duration),

    /// The task that would have completed this operation went away.
    #[error("operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: std::io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err: Arc::new(err),
        }
    }

    /// Create a new JSON load error
    pub fn json_load(err: serde_json::Error) -> Self {
        Error::JsonLoad(Arc::new(err))
    }

    /// Create a new JSON dump error
    pub fn json_dump(err: serde_json::Error) -> Self {
        Error::JsonDump(Arc::new(err))
    }

    /// Create a new API error
    pub fn api(kind: u32, address: &str, description: &str) -> Self {
        Error::Api {
            kind,
            address: address.to_string(),
            description: description.to_string(),
        }
    }

    /// Whether the bridge rejected our credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::NotRegistered(_))
    }

    /// Whether this failure should count against a bridge's consecutive
    /// error budget.
    ///
    /// A rejected credential means the bridge is alive but does not know us,
    /// so it never counts.
    pub fn counts_toward_eviction(&self) -> bool {
        !self.is_unauthorized()
    }
}

/// Hacky implementation of PartialEq for testing
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_does_not_count() {
        assert!(!Error::NotRegistered("whitelist".into()).counts_toward_eviction());
        assert!(Error::Timeout.counts_toward_eviction());
        assert!(Error::MalformedResponse("<html>".into()).counts_toward_eviction());
        assert!(Error::api(7, "/lights/1/state", "invalid value").counts_toward_eviction());
    }
}
