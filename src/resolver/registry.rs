//! Resolver backed by the coordination registry.
//!
//! Backends register as children of a service path; the resolver keeps a
//! child watch armed on that path and republishes the full child set every
//! time it fires.  There is no incremental diffing: every notification leads
//! to exactly one fetch, re-watch and push.
//!
//! All registry events of a session land on one channel that a single worker
//! task drains, so a notification is fully handled (children re-read, watch
//! re-armed, listener called) before the next one is looked at.  This holds
//! regardless of how the registry client itself dispatches callbacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};

use super::{Resolver, ResolverOptions};
use crate::error::ResolveError;
use crate::listener::{Dispatcher, Listener};
use crate::registry::{
    validate_path, EventKind, RegistryConnector, RegistryError, RegistrySession, SessionState,
    WatchedEvent,
};
use crate::target::Target;
use crate::types::{Endpoint, ResolutionResult};

/// Lifecycle of a registry-backed resolver.  Only observable through
/// [`RegistryResolver::subscribe_state`]; the listener only ever sees
/// results and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Disconnected,
    Connecting,
    Connected,
    Watching,
    SessionExpired,
    ShuttingDown,
}

/// How a session ended.
enum Exit {
    Shutdown,
    /// Reconnect immediately.
    Reconnect,
    /// Reconnect after the configured delay.
    Retry,
}

struct Shared {
    address: String,
    path: String,
    options: ResolverOptions,
    connector: Arc<dyn RegistryConnector>,
    dispatcher: Dispatcher,
    state: watch::Sender<ResolverState>,
    session_id: Mutex<Option<u64>>,
    shutdown: Notify,
}

/// Watches `registry://host:port/service/path`.
pub struct RegistryResolver {
    authority: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryResolver {
    pub fn new(
        address: impl Into<String>,
        path: impl Into<String>,
        options: ResolverOptions,
        connector: Arc<dyn RegistryConnector>,
    ) -> Result<Self, ResolveError> {
        let address = address.into();
        let path = path.into();
        if address.is_empty() {
            return Err(ResolveError::Configuration(
                "registry target needs a registry address".into(),
            ));
        }
        if path.is_empty() || path == "/" {
            return Err(ResolveError::Configuration(
                "registry target needs a service path".into(),
            ));
        }
        validate_path(&path).map_err(|e| ResolveError::Configuration(e.to_string()))?;

        let (state, _) = watch::channel(ResolverState::Disconnected);
        Ok(Self {
            authority: address.clone(),
            shared: Arc::new(Shared {
                address,
                path,
                options,
                connector,
                dispatcher: Dispatcher::new(),
                state,
                session_id: Mutex::new(None),
                shutdown: Notify::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn from_target(
        target: &Target,
        options: ResolverOptions,
        connector: Arc<dyn RegistryConnector>,
    ) -> Result<Self, ResolveError> {
        Self::new(target.authority(), target.path(), options, connector)
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn state(&self) -> ResolverState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ResolverState> {
        self.shared.state.subscribe()
    }

    /// Id of the registry session currently held, if any.
    pub fn session_id(&self) -> Option<u64> {
        *self.shared.session_id.lock()
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
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
        self.shared.state.send_replace(ResolverState::ShuttingDown);
        self.shared.shutdown.notify_one();

        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle {
            // An in-flight read and the session close are each bounded.
            let options = &self.shared.options;
            let bound = options.connect_timeout * 2 + options.request_timeout;
            if timeout(bound, &mut handle).await.is_err() {
                warn!(
                    "Registry resolver for {} did not stop within {:?}, aborting",
                    self.authority, bound
                );
                handle.abort();
            }
        }
        info!("Registry resolver for {}{} shut down", self.authority, self.shared.path);
    }
}

impl Shared {
    fn set_state(&self, next: ResolverState) {
        self.state.send_if_modified(|current| {
            if *current == ResolverState::ShuttingDown || *current == next {
                return false;
            }
            debug!("Resolver for {}: {:?} -> {:?}", self.path, current, next);
            *current = next;
            true
        });
    }

    async fn run(&self) {
        loop {
            match self.session_cycle().await {
                Exit::Shutdown => break,
                Exit::Reconnect => continue,
                Exit::Retry => {
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = sleep(self.options.reconnect_delay) => {}
                    }
                }
            }
        }
        *self.session_id.lock() = None;
        debug!("Registry worker for {} exited", self.path);
    }

    /// Runs one registry session from connect until it is lost or shut down.
    async fn session_cycle(&self) -> Exit {
        self.set_state(ResolverState::Connecting);
        info!("Connecting to registry at {}", self.address);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let deadline = Instant::now() + self.options.connect_timeout;

        let connect = self
            .connector
            .connect(&self.address, self.options.connect_timeout, events_tx);
        let session = tokio::select! {
            _ = self.shutdown.notified() => return Exit::Shutdown,
            res = timeout_at(deadline, connect) => match res {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    self.connect_failed(e.to_string()).await;
                    return Exit::Retry;
                }
                Err(_) => {
                    self.connect_failed("connect timed out".into()).await;
                    return Exit::Retry;
                }
            },
        };

        let acked = tokio::select! {
            _ = self.shutdown.notified() => {
                self.close(session.as_ref()).await;
                return Exit::Shutdown;
            }
            res = timeout_at(deadline, wait_for_sync(&mut events)) => matches!(res, Ok(true)),
        };
        if !acked {
            self.close(session.as_ref()).await;
            self.connect_failed("session was not acknowledged in time".into())
                .await;
            return Exit::Retry;
        }

        *self.session_id.lock() = Some(session.id());
        self.set_state(ResolverState::Connected);
        info!("Connected to registry at {} (session {})", self.address, session.id());

        if let Some(exit) = self.resync(session.as_ref()).await {
            self.close(session.as_ref()).await;
            return exit;
        }

        loop {
            let event = tokio::select! {
                _ = self.shutdown.notified() => {
                    self.close(session.as_ref()).await;
                    return Exit::Shutdown;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                warn!("Registry event channel for {} closed", self.path);
                self.close(session.as_ref()).await;
                return Exit::Retry;
            };

            if let Some(exit) = self.handle_event(session.as_ref(), event).await {
                self.close(session.as_ref()).await;
                return exit;
            }
        }
    }

    /// Returns `Some` when the session must be abandoned.
    async fn handle_event(
        &self,
        session: &dyn RegistrySession,
        event: WatchedEvent,
    ) -> Option<Exit> {
        if event.kind == EventKind::None {
            return match event.state {
                SessionState::Expired => {
                    warn!("Registry session {} expired, starting a new one", session.id());
                    self.set_state(ResolverState::SessionExpired);
                    Some(Exit::Reconnect)
                }
                SessionState::Closed => {
                    warn!("Registry session {} was closed by the registry", session.id());
                    Some(Exit::Retry)
                }
                SessionState::Disconnected => {
                    warn!("Lost connection to registry at {}", self.address);
                    self.set_state(ResolverState::Disconnected);
                    self.dispatcher
                        .deliver_error(ResolveError::Unavailable(format!(
                            "lost connection to registry at {}",
                            self.address
                        )))
                        .await;
                    None
                }
                SessionState::SyncConnected => {
                    // Changes may have been missed while disconnected.
                    info!("Reconnected to registry at {}, resyncing", self.address);
                    self.set_state(ResolverState::Connected);
                    self.resync(session).await
                }
            };
        }

        if event.path.as_deref() != Some(self.path.as_str()) {
            debug!("Ignoring registry event {:?}", event);
            return None;
        }
        debug!("Registry event {:?} on {}", event.kind, self.path);
        self.resync(session).await
    }

    /// Re-reads the service path, re-arms its watches and publishes the
    /// result.  Returns `Some` when the session must be abandoned.
    async fn resync(&self, session: &dyn RegistrySession) -> Option<Exit> {
        match self.fetch(session).await {
            Ok(parsed) => {
                self.set_state(ResolverState::Watching);
                self.publish(parsed).await;
                None
            }
            Err(RegistryError::ConnectionLoss) => {
                warn!("Registry at {} unreachable while reading {}", self.address, self.path);
                self.set_state(ResolverState::Disconnected);
                self.dispatcher
                    .deliver_error(ResolveError::Unavailable(format!(
                        "registry at {} unreachable",
                        self.address
                    )))
                    .await;
                // Wait for the session to report SyncConnected again.
                None
            }
            Err(RegistryError::Timeout) => {
                warn!(
                    "Reading {} from registry at {} took longer than {:?}, abandoning session {}",
                    self.path,
                    self.address,
                    self.options.request_timeout,
                    session.id()
                );
                self.set_state(ResolverState::Disconnected);
                self.dispatcher
                    .deliver_error(ResolveError::Unavailable(format!(
                        "registry at {} did not answer within {:?}",
                        self.address, self.options.request_timeout
                    )))
                    .await;
                Some(Exit::Retry)
            }
            Err(RegistryError::SessionExpired) => {
                warn!("Registry session {} expired during read", session.id());
                self.set_state(ResolverState::SessionExpired);
                Some(Exit::Reconnect)
            }
            Err(e) => {
                error!("Failed to read {} from registry: {}", self.path, e);
                self.dispatcher.deliver_error(e.into()).await;
                Some(Exit::Retry)
            }
        }
    }

    /// Reads the child set with the watch armed in the same call.  The outer
    /// result carries registry failures, the inner one parse failures.
    async fn fetch(
        &self,
        session: &dyn RegistrySession,
    ) -> Result<Result<Vec<Endpoint>, ResolveError>, RegistryError> {
        let bound = self.options.request_timeout;
        let exists = timeout(bound, session.exists(&self.path, true))
            .await
            .map_err(|_| RegistryError::Timeout)??;
        if exists.is_none() {
            info!("Service path {} does not exist, no backends yet", self.path);
            return Ok(Ok(Vec::new()));
        }
        let children = timeout(bound, session.get_children(&self.path, true))
            .await
            .map_err(|_| RegistryError::Timeout)?;
        let children = match children {
            Ok(children) => children,
            // Deleted since the existence check; that watch will fire.
            Err(RegistryError::NoNode(_)) => return Ok(Ok(Vec::new())),
            Err(e) => return Err(e),
        };
        Ok(self.parse_children(&children))
    }

    fn parse_children(&self, children: &[String]) -> Result<Vec<Endpoint>, ResolveError> {
        let mut endpoints = Vec::with_capacity(children.len());
        for child in children {
            match child.parse::<Endpoint>() {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => warn!(
                    "Skipping unparsable registry entry {:?} under {}: {}",
                    child, self.path, e
                ),
            }
        }
        if endpoints.is_empty() && !children.is_empty() {
            return Err(ResolveError::TotalParseFailure {
                count: children.len(),
            });
        }
        Ok(endpoints)
    }

    async fn publish(&self, parsed: Result<Vec<Endpoint>, ResolveError>) {
        match parsed {
            Ok(endpoints) => {
                info!("{} backends online under {}", endpoints.len(), self.path);
                for endpoint in &endpoints {
                    debug!("online: {}", endpoint);
                }
                let result = ResolutionResult::from_endpoints(endpoints)
                    .with_attribute("registry.path", serde_json::json!(self.path));
                self.dispatcher.deliver_result(result).await;
            }
            Err(e) => {
                error!("No usable registry entries under {}: {}", self.path, e);
                self.dispatcher.deliver_error(e).await;
            }
        }
    }

    async fn connect_failed(&self, reason: String) {
        warn!("Failed to connect to registry at {}: {}", self.address, reason);
        self.set_state(ResolverState::Disconnected);
        self.dispatcher
            .deliver_error(ResolveError::Unavailable(format!(
                "registry at {}: {}",
                self.address, reason
            )))
            .await;
    }

    async fn close(&self, session: &dyn RegistrySession) {
        *self.session_id.lock() = None;
        match timeout(self.options.connect_timeout, session.close()).await {
            Ok(Ok(())) => debug!("Closed registry session {}", session.id()),
            Ok(Err(e)) => debug!("Closing registry session {}: {}", session.id(), e),
            Err(_) => warn!("Timed out closing registry session {}", session.id()),
        }
    }
}

/// Waits for the session handshake.  Returns `false` if the channel closes.
async fn wait_for_sync(events: &mut mpsc::UnboundedReceiver<WatchedEvent>) -> bool {
    while let Some(event) = events.recv().await {
        if event.kind == EventKind::None && event.state == SessionState::SyncConnected {
            return true;
        }
        debug!("Ignoring {:?} before handshake", event);
    }
    false
}
