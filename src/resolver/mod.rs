use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ResolveError;
use crate::listener::Listener;

pub mod dns;
pub mod registry;
pub mod static_list;

pub use dns::DnsResolver;
pub use registry::{RegistryResolver, ResolverState};
pub use static_list::StaticResolver;

/// Turns a target into a live set of address groups.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Stable identifier of the resolved target, for logging.
    fn service_authority(&self) -> &str;

    /// Begins resolution.  Results arrive only through `listener`.  Calling
    /// `start` a second time, or after `shutdown`, fails with `InvalidState`.
    async fn start(&self, listener: Arc<dyn Listener>) -> Result<(), ResolveError>;

    /// Releases every resource held by the resolver.  Once this returns the
    /// listener is never called again.  Repeated calls are no-ops.
    async fn shutdown(&self);
}

/// Knobs shared by the resolvers that do background work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Bound on opening a registry session, including the handshake.
    pub connect_timeout: Duration,
    /// Bound on a single registry read.
    pub request_timeout: Duration,
    /// Pause before reconnecting after a failed or lost session.
    pub reconnect_delay: Duration,
    /// How often DNS targets are re-resolved.
    pub dns_refresh: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            request_timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(1000),
            dns_refresh: Duration::from_secs(30),
        }
    }
}
