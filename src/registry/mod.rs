//! Client model of the hierarchical coordination registry.
//!
//! Backends register themselves as ephemeral children of a service path.
//! A child's lifetime is bound to the session that created it, so a backend
//! that dies disappears from the registry once its session is gone.  Watches
//! are one-shot and must be re-armed after they fire; all of a session's
//! watches are lost when the session expires.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod registrar;

pub use memory::MemoryRegistry;
pub use registrar::{Registrar, Registration};

/// What happened to a watched path.  `None` marks a session-state change
/// that is not tied to any path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SyncConnected,
    Disconnected,
    Expired,
    Closed,
}

/// A notification delivered on a session's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub state: SessionState,
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn session(state: SessionState) -> Self {
        Self {
            kind: EventKind::None,
            state,
            path: None,
        }
    }

    pub fn node(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            state: SessionState::SyncConnected,
            path: Some(path.into()),
        }
    }
}

/// Node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub version: i32,
    pub num_children: usize,
    /// Owning session id for ephemeral nodes.
    pub ephemeral_owner: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection to registry lost")]
    ConnectionLoss,
    #[error("registry request timed out")]
    Timeout,
    #[error("registry session expired")]
    SessionExpired,
    #[error("no node at {0}")]
    NoNode(String),
    #[error("node already exists at {0}")]
    NodeExists(String),
    #[error("node {0} has children")]
    NotEmpty(String),
    #[error("version mismatch at {0}")]
    BadVersion(String),
    #[error("invalid path {0:?}")]
    InvalidPath(String),
    #[error("ephemeral node {0} cannot have children")]
    NoChildrenForEphemerals(String),
    #[error("failed to encode node data: {0}")]
    Encoding(String),
}

/// Opens sessions against a registry ensemble.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    /// Opens a session.  The session acknowledges itself by sending a
    /// `SyncConnected` event on `events`; watch notifications for the session
    /// arrive on the same channel.
    async fn connect(
        &self,
        address: &str,
        session_timeout: Duration,
        events: mpsc::UnboundedSender<WatchedEvent>,
    ) -> Result<Box<dyn RegistrySession>, RegistryError>;
}

/// A live registry session.
#[async_trait]
pub trait RegistrySession: Send + Sync {
    fn id(&self) -> u64;

    /// Stat of `path` if it exists.  With `watch`, arms a one-shot watch
    /// that fires on creation, deletion or data change.
    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>, RegistryError>;

    /// Child names of `path`.  With `watch`, the child watch is armed in the
    /// same step as the read, so no change between the two can be missed.
    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>, RegistryError>;

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), RegistryError>;

    /// Creates `path`; the parent must exist.  Returns the created path.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, RegistryError>;

    /// Replaces the data of `path`.  `version` of `None` skips the check.
    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
    ) -> Result<Stat, RegistryError>;

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), RegistryError>;

    /// Ends the session, removing its ephemeral nodes and watches.
    async fn close(&self) -> Result<(), RegistryError>;
}

/// Joins a parent path and a child name.
pub fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Checks the shape of an absolute registry path.
pub fn validate_path(path: &str) -> Result<(), RegistryError> {
    if path == "/" {
        return Ok(());
    }
    let valid = path.starts_with('/')
        && !path.ends_with('/')
        && path[1..].split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths() {
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/svc", "10.0.0.1:1"), "/svc/10.0.0.1:1");
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/svc/a").is_ok());
        assert!(validate_path("svc").is_err());
        assert!(validate_path("/svc/").is_err());
        assert!(validate_path("/svc//a").is_err());
        assert!(validate_path("/svc/..").is_err());
    }
}
