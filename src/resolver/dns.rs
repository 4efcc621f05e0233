//! Resolver for plain DNS names, re-resolved on a fixed interval.
//!
//! Uses [hickory-resolver](https://crates.io/crates/hickory-resolver) with the
//! system configuration, falling back to the library defaults when the
//! system configuration cannot be loaded.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::{Resolver, ResolverOptions};
use crate::error::ResolveError;
use crate::listener::{Dispatcher, Listener};
use crate::target::Target;
use crate::types::{Endpoint, ResolutionResult};

/// Port used when a DNS target does not name one.
pub const DEFAULT_PORT: u16 = 50051;

struct Shared {
    host: String,
    port: u16,
    refresh: Duration,
    dispatcher: Dispatcher,
    shutdown: Notify,
}

/// Resolves `dns://host:port` (or `dns:///host:port`) to one address group
/// per returned IP.
pub struct DnsResolver {
    authority: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DnsResolver {
    pub fn new(host: impl Into<String>, port: u16, refresh: Duration) -> Result<Self, ResolveError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ResolveError::Configuration("DNS target needs a host name".into()));
        }
        let authority = Endpoint::new(host.clone(), port).to_string();
        Ok(Self {
            authority,
            shared: Arc::new(Shared {
                host,
                port,
                refresh,
                dispatcher: Dispatcher::new(),
                shutdown: Notify::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn from_target(target: &Target, options: &ResolverOptions) -> Result<Self, ResolveError> {
        let name = match target.path().trim_start_matches('/') {
            "" => target.authority(),
            path => path,
        };
        if name.is_empty() {
            return Err(ResolveError::Configuration(format!(
                "DNS target {target} has no name"
            )));
        }

        let has_port = name.starts_with('[') || name.matches(':').count() == 1;
        let (host, port) = if has_port {
            let endpoint: Endpoint = name
                .parse()
                .map_err(|e| ResolveError::Configuration(format!("DNS target {target}: {e}")))?;
            (endpoint.host().to_string(), endpoint.port())
        } else {
            (name.to_string(), DEFAULT_PORT)
        };
        Self::new(host, port, options.dns_refresh)
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    fn service_authority(&self) -> &str {
        &self.authority
    }

    async fn start(&self, listener: Arc<dyn Listener>) -> Result<(), ResolveError> {
        self.shared.dispatcher.attach(listener).await?;
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.run().await });
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.shared.dispatcher.detach().await {
            return;
        }
        self.shared.shutdown.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            // Lookups have their own timeouts; nothing else in the loop blocks.
            handle.abort();
            let _ = handle.await;
        }
        info!("DNS resolver for {} shut down", self.authority);
    }
}

impl Shared {
    async fn run(&self) {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!(
                "Failed to load system resolver configuration: {}. Using defaults.",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });

        loop {
            self.resolve_once(&resolver).await;
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = sleep(self.refresh) => {}
            }
        }
    }

    async fn resolve_once(&self, resolver: &TokioAsyncResolver) {
        match resolver.lookup_ip(self.host.as_str()).await {
            Ok(lookup) => {
                let mut ips: Vec<IpAddr> = Vec::new();
                for ip in lookup.iter() {
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
                debug!("{} resolved to {:?}", self.host, ips);
                let result = ResolutionResult::from_endpoints(
                    ips.into_iter()
                        .map(|ip| Endpoint::new(ip.to_string(), self.port)),
                )
                .with_attribute("dns.host", serde_json::json!(self.host));
                self.dispatcher.deliver_result(result).await;
            }
            Err(e) => {
                error!("DNS lookup for {} failed: {}", self.host, e);
                self.dispatcher
                    .deliver_error(ResolveError::Unavailable(format!(
                        "DNS lookup for {} failed: {}",
                        self.host, e
                    )))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_quiet, eps, next_result, recorder, sorted_endpoints};

    fn target(s: &str) -> Result<DnsResolver, ResolveError> {
        DnsResolver::from_target(&s.parse().unwrap(), &ResolverOptions::default())
    }

    #[test]
    fn parses_names_and_ports() {
        assert_eq!(target("dns:///backend:8080").unwrap().service_authority(), "backend:8080");
        assert_eq!(target("dns://backend").unwrap().service_authority(), "backend:50051");
        assert_eq!(target("dns://[::1]:9000").unwrap().service_authority(), "[::1]:9000");
        assert!(matches!(target("dns://"), Err(ResolveError::Configuration(_))));
        assert!(matches!(
            target("dns:///backend:notaport"),
            Err(ResolveError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn resolves_ip_literals_without_queries() {
        let resolver = target("dns:///127.0.0.1:50051").unwrap();
        let (listener, mut rx) = recorder();
        resolver.start(listener).await.unwrap();

        let result = next_result(&mut rx).await;
        assert_eq!(sorted_endpoints(&result), eps(&["127.0.0.1:50051"]));
        assert_eq!(result.attributes()["dns.host"], "127.0.0.1");

        resolver.shutdown().await;
        resolver.shutdown().await;
        assert_quiet(&mut rx, Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn refreshes_on_interval() {
        let resolver = DnsResolver::new("::1", 7000, Duration::from_millis(20)).unwrap();
        let (listener, mut rx) = recorder();
        resolver.start(listener).await.unwrap();

        let first = next_result(&mut rx).await;
        let second = next_result(&mut rx).await;
        assert_eq!(first, second);
        assert_eq!(sorted_endpoints(&first), eps(&["[::1]:7000"]));

        resolver.shutdown().await;
    }
}
