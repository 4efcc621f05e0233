//! Scheme table mapping target URIs to resolver implementations.
//!
//! The table is filled once at initialization and read-only afterwards.  The
//! process-wide instance lives behind a [`OnceLock`]: it is installed once with
//! [`init_global`] and read without locking through [`global`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use log::{debug, info};

use crate::error::ResolveError;
use crate::registry::RegistryConnector;
use crate::resolver::{
    DnsResolver, RegistryResolver, Resolver, ResolverOptions, StaticResolver,
};
use crate::target::Target;

/// Builds a resolver for a parsed target.
pub type SchemeFactory =
    Box<dyn Fn(&Target) -> Result<Box<dyn Resolver>, ResolveError> + Send + Sync>;

#[derive(Default)]
pub struct ResolverFactory {
    schemes: HashMap<String, SchemeFactory>,
}

static GLOBAL: OnceLock<ResolverFactory> = OnceLock::new();

impl ResolverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `static`, `dns` and `registry` (also reachable as `zk`).
    /// Registry sessions are opened through `connector`.
    pub fn with_defaults(options: ResolverOptions, connector: Arc<dyn RegistryConnector>) -> Self {
        let mut factory = Self::new();
        factory.register_scheme("static", |target| {
            Ok(Box::new(StaticResolver::from_target(target)?))
        });

        let dns_options = options.clone();
        factory.register_scheme("dns", move |target| {
            Ok(Box::new(DnsResolver::from_target(target, &dns_options)?))
        });

        for scheme in ["registry", "zk"] {
            let options = options.clone();
            let connector = Arc::clone(&connector);
            factory.register_scheme(scheme, move |target| {
                Ok(Box::new(RegistryResolver::from_target(
                    target,
                    options.clone(),
                    Arc::clone(&connector),
                )?))
            });
        }
        factory
    }

    /// Maps `scheme` to `factory`, replacing any earlier entry.
    pub fn register_scheme<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Target) -> Result<Box<dyn Resolver>, ResolveError> + Send + Sync + 'static,
    {
        let scheme = scheme.to_ascii_lowercase();
        debug!("Registering resolver scheme {}", scheme);
        self.schemes.insert(scheme, Box::new(factory));
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.schemes.keys().map(String::as_str)
    }

    /// Parses `target` and builds a resolver through its scheme's factory.
    pub fn resolver_for(&self, target: &str) -> Result<Box<dyn Resolver>, ResolveError> {
        let target: Target = target.parse()?;
        let factory = self
            .schemes
            .get(target.scheme())
            .ok_or_else(|| ResolveError::UnknownScheme(target.scheme().to_string()))?;
        let resolver = factory(&target)?;
        info!(
            "Built {} resolver for {}",
            target.scheme(),
            resolver.service_authority()
        );
        Ok(resolver)
    }
}

/// Installs the process-wide factory.  Fails if one is already installed.
pub fn init_global(factory: ResolverFactory) -> Result<&'static ResolverFactory, ResolveError> {
    let mut slot = Some(factory);
    let installed = GLOBAL.get_or_init(|| slot.take().unwrap_or_default());
    if slot.is_some() {
        return Err(ResolveError::InvalidState("resolver factory already initialized"));
    }
    Ok(installed)
}

/// The process-wide factory, if installed.
pub fn global() -> Option<&'static ResolverFactory> {
    GLOBAL.get()
}
