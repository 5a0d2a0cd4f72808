//! Tunables for registries and stubs.

use std::time::Duration;

/// Well-known channel every registry subscribes to.
pub const DEFAULT_DISCOVERY_CHANNEL: &str = "umundo.sd";

/// Options for a [`ServiceRegistry`](crate::ServiceRegistry).
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Channel carrying discovery traffic.
    pub discovery_channel: String,
    /// Default bound for [`find`](crate::ServiceRegistry::find).
    pub find_timeout: Duration,
    /// How long a reply to a not yet joined peer stays queued.
    pub pending_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            discovery_channel: DEFAULT_DISCOVERY_CHANNEL.to_string(),
            find_timeout: Duration::from_millis(3000),
            pending_ttl: Duration::from_secs(30),
        }
    }
}

/// Options for a [`ServiceStub`](crate::ServiceStub).
#[derive(Clone, Debug)]
pub struct StubConfig {
    /// Default bound for a single call.
    pub call_timeout: Duration,
    /// How long binding waits for the service to show up on its channel.
    pub bind_timeout: Duration,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            bind_timeout: Duration::from_secs(5),
        }
    }
}
