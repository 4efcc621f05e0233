//! Resolver for a fixed, caller-supplied list of endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use super::Resolver;
use crate::error::ResolveError;
use crate::listener::{Dispatcher, Listener};
use crate::target::Target;
use crate::types::{Endpoint, ResolutionResult};

/// Publishes its endpoints exactly once, one address group per endpoint.
pub struct StaticResolver {
    authority: String,
    endpoints: Vec<Endpoint>,
    dispatcher: Dispatcher,
}

impl StaticResolver {
    pub fn new(
        authority: impl Into<String>,
        endpoints: Vec<Endpoint>,
    ) -> Result<Self, ResolveError> {
        if endpoints.is_empty() {
            return Err(ResolveError::Configuration(
                "static resolver needs at least one endpoint".into(),
            ));
        }
        Ok(Self {
            authority: authority.into(),
            endpoints,
            dispatcher: Dispatcher::new(),
        })
    }

    /// Builds from `static://host1:port1,host2:port2,...`.
    pub fn from_target(target: &Target) -> Result<Self, ResolveError> {
        if !target.path().is_empty() && target.path() != "/" {
            return Err(ResolveError::Configuration(format!(
                "static target {target} must not carry a path"
            )));
        }
        let endpoints = target
            .authority()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.parse::<Endpoint>().map_err(|e| {
                    ResolveError::Configuration(format!("static target {target}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(target.authority(), endpoints)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    fn service_authority(&self) -> &str {
        &self.authority
    }

    async fn start(&self, listener: Arc<dyn Listener>) -> Result<(), ResolveError> {
        self.dispatcher.attach(listener).await?;
        info!(
            "Static resolver {} publishing {} endpoints",
            self.authority,
            self.endpoints.len()
        );
        self.dispatcher
            .deliver_result(ResolutionResult::from_endpoints(self.endpoints.clone()))
            .await;
        Ok(())
    }

    async fn shutdown(&self) {
        self.dispatcher.detach().await;
    }
}
