//! In-process registry.
//!
//! Implements the full session model: hierarchical nodes, ephemeral
//! ownership, versioned updates and one-shot data/child watches.  Cloning a
//! [`MemoryRegistry`] yields another handle on the same tree, so a test or the
//! embedded daemon mode can register backends through one session while a
//! resolver watches through another.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    validate_path, CreateMode, EventKind, RegistryConnector, RegistryError,
    RegistrySession, SessionState, Stat, WatchedEvent,
};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<u64>,
}

struct Inner {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, mpsc::UnboundedSender<WatchedEvent>>,
    data_watches: HashMap<String, HashSet<u64>>,
    child_watches: HashMap<String, HashSet<u64>>,
    next_session: u64,
    reachable: bool,
}

impl Inner {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                version: 0,
                ephemeral_owner: None,
            },
        );
        Self {
            nodes,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            next_session: 1,
            reachable: true,
        }
    }

    fn check(&self, session: u64) -> Result<(), RegistryError> {
        if !self.reachable {
            return Err(RegistryError::ConnectionLoss);
        }
        if !self.sessions.contains_key(&session) {
            return Err(RegistryError::SessionExpired);
        }
        Ok(())
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, path: &str, node: &Node) -> Stat {
        Stat {
            version: node.version,
            num_children: self.children(path).len(),
            ephemeral_owner: node.ephemeral_owner,
        }
    }

    fn notify(&self, sessions: HashSet<u64>, event: WatchedEvent) {
        for id in sessions {
            if let Some(tx) = self.sessions.get(&id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn fire_data(&mut self, path: &str, kind: EventKind) {
        if let Some(watchers) = self.data_watches.remove(path) {
            self.notify(watchers, WatchedEvent::node(kind, path));
        }
    }

    fn fire_children(&mut self, path: &str, kind: EventKind) {
        if let Some(watchers) = self.child_watches.remove(path) {
            self.notify(watchers, WatchedEvent::node(kind, path));
        }
    }

    fn insert(&mut self, path: &str, data: Vec<u8>, owner: Option<u64>) -> Result<(), RegistryError> {
        validate_path(path)?;
        if self.nodes.contains_key(path) {
            return Err(RegistryError::NodeExists(path.to_string()));
        }
        let parent = parent_of(path).ok_or_else(|| RegistryError::InvalidPath(path.to_string()))?;
        match self.nodes.get(parent) {
            None => return Err(RegistryError::NoNode(parent.to_string())),
            Some(node) if node.ephemeral_owner.is_some() => {
                return Err(RegistryError::NoChildrenForEphemerals(parent.to_string()))
            }
            Some(_) => {}
        }
        self.nodes.insert(
            path.to_string(),
            Node {
                data,
                version: 0,
                ephemeral_owner: owner,
            },
        );
        self.fire_data(path, EventKind::NodeCreated);
        self.fire_children(parent, EventKind::NodeChildrenChanged);
        Ok(())
    }

    fn remove(&mut self, path: &str, version: Option<i32>) -> Result<(), RegistryError> {
        validate_path(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))?;
        if version.is_some_and(|v| v != node.version) {
            return Err(RegistryError::BadVersion(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(RegistryError::NotEmpty(path.to_string()));
        }
        let parent = parent_of(path).ok_or_else(|| RegistryError::InvalidPath(path.to_string()))?;
        self.nodes.remove(path);
        self.fire_data(path, EventKind::NodeDeleted);
        self.fire_children(path, EventKind::NodeDeleted);
        self.fire_children(parent, EventKind::NodeChildrenChanged);
        Ok(())
    }

    /// Tears down a session: drops its watches and deletes its ephemerals.
    fn end_session(&mut self, id: u64) -> Option<mpsc::UnboundedSender<WatchedEvent>> {
        let tx = self.sessions.remove(&id)?;
        for watchers in self
            .data_watches
            .values_mut()
            .chain(self.child_watches.values_mut())
        {
            watchers.remove(&id);
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            let _ = self.remove(&path, None);
        }
        Some(tx)
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/')? {
        0 if path.len() > 1 => Some("/"),
        0 => None,
        idx => Some(&path[..idx]),
    }
}

/// Shared handle on an in-process registry tree.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Expires a session as if its timeout had elapsed.  The session receives
    /// an `Expired` event; its watches are dropped and its ephemeral nodes
    /// deleted.  Returns `false` if the session was not live.
    pub fn expire_session(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.end_session(id) {
            Some(tx) => {
                info!("Expiring registry session {}", id);
                let _ = tx.send(WatchedEvent::session(SessionState::Expired));
                true
            }
            None => false,
        }
    }

    /// Simulates a network partition between every client and the registry.
    /// While unreachable, new connects and all session operations fail with
    /// `ConnectionLoss`; live sessions see `Disconnected` and, once
    /// reachability returns, `SyncConnected`.
    pub fn set_reachable(&self, reachable: bool) {
        let mut inner = self.inner.lock();
        if inner.reachable == reachable {
            return;
        }
        inner.reachable = reachable;
        let state = if reachable {
            SessionState::SyncConnected
        } else {
            SessionState::Disconnected
        };
        for tx in inner.sessions.values() {
            let _ = tx.send(WatchedEvent::session(state));
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Children of `path`, read without a session.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.lock().children(path)
    }
}

#[async_trait]
impl RegistryConnector for MemoryRegistry {
    async fn connect(
        &self,
        address: &str,
        _session_timeout: Duration,
        events: mpsc::UnboundedSender<WatchedEvent>,
    ) -> Result<Box<dyn RegistrySession>, RegistryError> {
        let mut inner = self.inner.lock();
        if !inner.reachable {
            return Err(RegistryError::ConnectionLoss);
        }
        let id = inner.next_session;
        inner.next_session += 1;
        let _ = events.send(WatchedEvent::session(SessionState::SyncConnected));
        inner.sessions.insert(id, events);
        debug!("Opened registry session {} for {}", id, address);
        Ok(Box::new(MemorySession {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemorySession {
    id: u64,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl RegistrySession for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>, RegistryError> {
        validate_path(path)?;
        let mut inner = self.inner.lock();
        inner.check(self.id)?;
        if watch {
            inner
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.id);
        }
        Ok(inner.nodes.get(path).map(|node| inner.stat(path, node)))
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>, RegistryError> {
        validate_path(path)?;
        let mut inner = self.inner.lock();
        inner.check(self.id)?;
        if !inner.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        if watch {
            inner
                .child_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.id);
        }
        Ok(inner.children(path))
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), RegistryError> {
        validate_path(path)?;
        let inner = self.inner.lock();
        inner.check(self.id)?;
        let node = inner
            .nodes
            .get(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))?;
        Ok((node.data.clone(), inner.stat(path, node)))
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, RegistryError> {
        let mut inner = self.inner.lock();
        inner.check(self.id)?;
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.id),
        };
        inner.insert(path, data, owner)?;
        Ok(path.to_string())
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
    ) -> Result<Stat, RegistryError> {
        validate_path(path)?;
        let mut inner = self.inner.lock();
        inner.check(self.id)?;
        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))?;
        if version.is_some_and(|v| v != node.version) {
            return Err(RegistryError::BadVersion(path.to_string()));
        }
        node.data = data;
        node.version += 1;
        let node = node.clone();
        inner.fire_data(path, EventKind::NodeDataChanged);
        Ok(inner.stat(path, &node))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        inner.check(self.id)?;
        inner.remove(path, version)
    }

    async fn close(&self) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.end_session(self.id).is_some() {
            debug!("Closed registry session {}", self.id);
        }
        Ok(())
    }
}
