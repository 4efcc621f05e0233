//! Backend-side registration: the writer half of the registry contract.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::{child_path, validate_path, CreateMode, RegistryError, RegistrySession};
use crate::types::Endpoint;

/// Payload stored in a backend's registration node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationData {
    pub endpoint: String,
    pub registered_at_ms: u64,
}

impl RegistrationData {
    fn now(endpoint: &Endpoint) -> Self {
        let registered_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            endpoint: endpoint.to_string(),
            registered_at_ms,
        }
    }
}

/// A live registration.  The node disappears on its own when the owning
/// session ends; [`deregister`](Self::deregister) removes it earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    path: String,
    endpoint: Endpoint,
}

impl Registration {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn deregister(self, session: &dyn RegistrySession) -> Result<(), RegistryError> {
        match session.delete(&self.path, None).await {
            Ok(()) | Err(RegistryError::NoNode(_)) => {
                info!("Deregistered {}", self.path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Publishes backend endpoints under a service path.
pub struct Registrar<'a> {
    session: &'a dyn RegistrySession,
}

impl<'a> Registrar<'a> {
    pub fn new(session: &'a dyn RegistrySession) -> Self {
        Self { session }
    }

    /// Creates the persistent service path if needed, then the ephemeral
    /// `service_path/host:port` child.  An existing child has its data
    /// refreshed instead.
    pub async fn register(
        &self,
        service_path: &str,
        endpoint: &Endpoint,
    ) -> Result<Registration, RegistryError> {
        validate_path(service_path)?;
        self.ensure_path(service_path).await?;

        let path = child_path(service_path, &endpoint.to_string());
        let data = serde_json::to_vec(&RegistrationData::now(endpoint))
            .map_err(|e| RegistryError::Encoding(e.to_string()))?;

        match self.session.exists(&path, false).await? {
            None => match self
                .session
                .create(&path, data.clone(), CreateMode::Ephemeral)
                .await
            {
                Ok(_) => {}
                // Lost a race with another writer for the same endpoint.
                Err(RegistryError::NodeExists(_)) => {
                    self.session.set_data(&path, data, None).await?;
                }
                Err(e) => return Err(e),
            },
            Some(stat) => {
                warn!("{} already registered, refreshing its data", path);
                self.session.set_data(&path, data, Some(stat.version)).await?;
            }
        }

        info!("Registered {} under {}", endpoint, service_path);
        Ok(Registration {
            path,
            endpoint: endpoint.clone(),
        })
    }

    /// Creates every missing ancestor of `path` as a persistent node.
    async fn ensure_path(&self, path: &str) -> Result<(), RegistryError> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if self.session.exists(&current, false).await?.is_some() {
                continue;
            }
            match self
                .session
                .create(&current, Vec::new(), CreateMode::Persistent)
                .await
            {
                Ok(_) | Err(RegistryError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::{MemoryRegistry, RegistryConnector};

    async fn session(registry: &MemoryRegistry) -> Box<dyn RegistrySession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        registry
            .connect("memory", Duration::from_secs(2), tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn registers_ephemeral_child_under_nested_path() {
        let registry = MemoryRegistry::new();
        let session = session(&registry).await;
        let endpoint = Endpoint::new("10.0.0.1", 50051);

        let registration = Registrar::new(session.as_ref())
            .register("/services/greeter", &endpoint)
            .await
            .unwrap();
        assert_eq!(registration.path(), "/services/greeter/10.0.0.1:50051");
        assert_eq!(registry.children("/services/greeter"), vec!["10.0.0.1:50051"]);

        let (data, stat) = session.get_data(registration.path()).await.unwrap();
        let data: RegistrationData = serde_json::from_slice(&data).unwrap();
        assert_eq!(data.endpoint, "10.0.0.1:50051");
        assert_eq!(stat.ephemeral_owner, Some(session.id()));
    }

    #[tokio::test]
    async fn registering_twice_refreshes_data() {
        let registry = MemoryRegistry::new();
        let session = session(&registry).await;
        let registrar = Registrar::new(session.as_ref());
        let endpoint = Endpoint::new("10.0.0.1", 50051);

        registrar.register("/svc", &endpoint).await.unwrap();
        let registration = registrar.register("/svc", &endpoint).await.unwrap();
        let (_, stat) = session.get_data(registration.path()).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(registry.children("/svc").len(), 1);
    }

    #[tokio::test]
    async fn registration_ends_with_session() {
        let registry = MemoryRegistry::new();
        let first = session(&registry).await;
        let second = session(&registry).await;

        Registrar::new(first.as_ref())
            .register("/svc", &Endpoint::new("a", 1))
            .await
            .unwrap();
        let kept = Registrar::new(second.as_ref())
            .register("/svc", &Endpoint::new("b", 2))
            .await
            .unwrap();

        first.close().await.unwrap();
        assert_eq!(registry.children("/svc"), vec!["b:2"]);

        kept.deregister(second.as_ref()).await.unwrap();
        assert!(registry.children("/svc").is_empty());
    }
}
