//! Namewatch daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

use namewatch::config::Config;
use namewatch::factory::{self, ResolverFactory};
use namewatch::registry::{MemoryRegistry, Registrar, RegistryConnector};
use namewatch::{Endpoint, RoundRobin, Target};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting namewatch with config: {:?}", cfg);
    let options = cfg.resolver_options();

    // Embedded registry backing registry:// targets
    let registry = MemoryRegistry::new();
    let target: Target = cfg.target.parse()?;
    let (registrar_tx, _registrar_rx) = mpsc::unbounded_channel();
    let registrar_session = if matches!(target.scheme(), "registry" | "zk") {
        let session = registry
            .connect(target.authority(), options.connect_timeout, registrar_tx)
            .await
            .context("Failed to open registrar session")?;
        let registrar = Registrar::new(session.as_ref());
        for backend in &cfg.registry_backends {
            let endpoint: Endpoint = backend
                .parse()
                .with_context(|| format!("Invalid registry backend {backend}"))?;
            registrar.register(target.path(), &endpoint).await?;
        }
        Some(session)
    } else {
        None
    };

    // Resolver
    let factory = factory::init_global(ResolverFactory::with_defaults(
        options,
        Arc::new(registry.clone()),
    ))?;
    let resolver = factory.resolver_for(&cfg.target)?;
    let balancer = Arc::new(RoundRobin::new());
    resolver.start(balancer.clone()).await?;

    // Pick loop
    let interval = cfg.pick_interval();
    let picker = Arc::clone(&balancer);
    let pick_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match picker.pick() {
                Ok(endpoint) => info!("Picked {} of {} backends", endpoint, picker.len()),
                Err(e) => warn!("No pick: {}", e),
            }
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    pick_handle.abort();
    resolver.shutdown().await;
    if let Some(session) = registrar_session {
        if let Err(e) = session.close().await {
            warn!("Failed to close registrar session: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}
