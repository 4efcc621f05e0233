//! Round-robin picking over the latest resolved address set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::RwLock;

use crate::error::ResolveError;
use crate::listener::Listener;
use crate::types::{AddressGroup, Endpoint, ResolutionResult};

/// Consumer that rotates over every endpoint of the most recent result.
///
/// The result is held as an immutable snapshot and replaced wholesale on
/// every `on_result`.  Callers of [`pick`](Self::pick) work against the
/// snapshot they loaded, so a concurrent update never shows them a half-built
/// list.  Errors leave the current snapshot in place.
///
/// All members of a group are equally eligible, so rotation runs over the
/// endpoints of all groups in order.
pub struct RoundRobin {
    snapshot: RwLock<Arc<Snapshot>>,
    cursor: AtomicUsize,
    last_error: RwLock<Option<ResolveError>>,
}

struct Snapshot {
    groups: Arc<[AddressGroup]>,
    endpoints: Vec<Endpoint>,
}

impl Snapshot {
    fn new(groups: Vec<AddressGroup>) -> Self {
        let endpoints = groups
            .iter()
            .flat_map(|group| group.endpoints().iter().cloned())
            .collect();
        Self {
            groups: groups.into(),
            endpoints,
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::new(Vec::new()))),
            cursor: AtomicUsize::new(0),
            last_error: RwLock::new(None),
        }
    }

    /// The next endpoint in rotation.
    pub fn pick(&self) -> Result<Endpoint, ResolveError> {
        let snapshot = Arc::clone(&self.snapshot.read());
        if snapshot.endpoints.is_empty() {
            return Err(ResolveError::NoBackendsAvailable);
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.endpoints.len();
        Ok(snapshot.endpoints[idx].clone())
    }

    /// Address groups of the current result.
    pub fn snapshot(&self) -> Arc<[AddressGroup]> {
        Arc::clone(&self.snapshot.read().groups)
    }

    /// Number of endpoints in rotation.
    pub fn len(&self) -> usize {
        self.snapshot.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent error, cleared by the next result.
    pub fn last_error(&self) -> Option<ResolveError> {
        self.last_error.read().clone()
    }
}

impl Listener for RoundRobin {
    fn on_result(&self, result: ResolutionResult) {
        let snapshot = Snapshot::new(result.into_address_groups());
        debug!(
            "Round robin now balancing over {} endpoints in {} groups",
            snapshot.endpoints.len(),
            snapshot.groups.len()
        );
        *self.snapshot.write() = Arc::new(snapshot);
        *self.last_error.write() = None;
    }

    fn on_error(&self, error: ResolveError) {
        if error.is_transient() {
            warn!(
                "Resolution error, keeping {} known backends: {}",
                self.len(),
                error
            );
        } else {
            error!(
                "Resolution failed permanently, keeping {} known backends: {}",
                self.len(),
                error
            );
        }
        *self.last_error.write() = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::registry::{CreateMode, MemoryRegistry, RegistryConnector, RegistrySession};
    use crate::resolver::{RegistryResolver, Resolver, ResolverOptions, StaticResolver};
    use crate::test_support::WAIT;

    fn endpoints(list: &[&str]) -> Vec<Endpoint> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn empty_set_has_no_backends() {
        let rr = RoundRobin::new();
        assert_eq!(rr.pick(), Err(ResolveError::NoBackendsAvailable));
        rr.on_result(ResolutionResult::default());
        assert_eq!(rr.pick(), Err(ResolveError::NoBackendsAvailable));
        assert!(rr.is_empty());
    }

    #[test]
    fn rotates_in_order() {
        let rr = RoundRobin::new();
        rr.on_result(ResolutionResult::from_endpoints(endpoints(&["a:1", "b:2", "c:3"])));
        let picks: Vec<String> = (0..6).map(|_| rr.pick().unwrap().to_string()).collect();
        assert_eq!(picks, ["a:1", "b:2", "c:3", "a:1", "b:2", "c:3"]);
    }

    #[test]
    fn errors_keep_the_current_set() {
        let rr = RoundRobin::new();
        rr.on_result(ResolutionResult::from_endpoints(endpoints(&["a:1"])));
        rr.on_error(ResolveError::Unavailable("registry down".into()));
        assert_eq!(rr.pick().unwrap().to_string(), "a:1");
        assert_eq!(
            rr.last_error(),
            Some(ResolveError::Unavailable("registry down".into()))
        );

        rr.on_result(ResolutionResult::from_endpoints(endpoints(&["b:2"])));
        assert_eq!(rr.last_error(), None);
        assert_eq!(rr.pick().unwrap().to_string(), "b:2");
    }

    #[test]
    fn old_snapshots_stay_valid_after_shrink() {
        let rr = RoundRobin::new();
        rr.on_result(ResolutionResult::from_endpoints(endpoints(&["a:1", "b:2", "c:3"])));
        let held = rr.snapshot();
        for _ in 0..5 {
            rr.pick().unwrap();
        }

        rr.on_result(ResolutionResult::from_endpoints(endpoints(&["c:3"])));
        assert_eq!(held.len(), 3);
        for _ in 0..5 {
            assert_eq!(rr.pick().unwrap().to_string(), "c:3");
        }
    }

    #[test]
    fn every_group_member_is_picked() {
        let rr = RoundRobin::new();
        let pair = AddressGroup::new(endpoints(&["a:1", "a:2"])).unwrap();
        let single = AddressGroup::from(Endpoint::new("b", 1));
        rr.on_result(ResolutionResult::new(vec![pair, single]));

        assert_eq!(rr.snapshot().len(), 2);
        assert_eq!(rr.len(), 3);
        let picks: Vec<String> = (0..6).map(|_| rr.pick().unwrap().to_string()).collect();
        assert_eq!(picks, ["a:1", "a:2", "b:1", "a:1", "a:2", "b:1"]);
    }

    #[test]
    fn concurrent_picks_are_uniform() {
        let rr = Arc::new(RoundRobin::new());
        rr.on_result(ResolutionResult::from_endpoints(endpoints(&["a:1", "b:2", "c:3"])));

        let counts: HashMap<String, usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..1000)
                .map(|_| {
                    let rr = Arc::clone(&rr);
                    scope.spawn(move || rr.pick().unwrap().to_string())
                })
                .collect();
            let mut counts = HashMap::new();
            for handle in handles {
                *counts.entry(handle.join().unwrap()).or_insert(0) += 1;
            }
            counts
        });

        assert_eq!(counts.len(), 3);
        assert_eq!(counts.values().sum::<usize>(), 1000);
        for count in counts.values() {
            assert!((330..=337).contains(count), "skewed distribution {counts:?}");
        }
    }

    #[tokio::test]
    async fn static_resolver_feeds_round_robin() {
        let rr = Arc::new(RoundRobin::new());
        let resolver =
            StaticResolver::new("fixed", endpoints(&["a:1", "b:2", "c:3"])).unwrap();
        resolver.start(rr.clone()).await.unwrap();
        assert_eq!(rr.len(), 3);
        resolver.shutdown().await;
        assert_eq!(rr.len(), 3);
    }

    #[tokio::test]
    async fn empty_registry_path_leaves_no_backends() {
        let registry = MemoryRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let writer = registry
            .connect("memory", std::time::Duration::from_secs(1), tx)
            .await
            .unwrap();
        writer.create("/svc", Vec::new(), CreateMode::Persistent).await.unwrap();

        let rr = Arc::new(RoundRobin::new());
        // Seed a stale set so the empty result is observable as a change.
        rr.on_result(ResolutionResult::from_endpoints(endpoints(&["old:1"])));

        let resolver = RegistryResolver::new(
            "memory",
            "/svc",
            ResolverOptions::default(),
            Arc::new(registry.clone()),
        )
        .unwrap();
        resolver.start(rr.clone()).await.unwrap();

        tokio::time::timeout(WAIT, async {
            while !rr.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(rr.pick(), Err(ResolveError::NoBackendsAvailable));
        assert_eq!(rr.last_error(), None);

        writer
            .create("/svc/10.0.0.1:50051", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        tokio::time::timeout(WAIT, async {
            while rr.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(rr.pick().unwrap().to_string(), "10.0.0.1:50051");

        resolver.shutdown().await;
        let _ = writer.close().await;
    }
}
