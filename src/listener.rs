//! The push interface between a resolver and whoever consumes its results.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::ResolveError;
use crate::types::ResolutionResult;

/// Receives address updates from a single resolver.
///
/// Calls from one resolver never overlap and arrive in the order the
/// resolver produced them.  Implementations should return quickly; they are
/// invoked from the resolver's worker.
pub trait Listener: Send + Sync {
    /// The authoritative current address set.
    fn on_result(&self, result: ResolutionResult);

    /// Resolution cannot currently produce a result.  A later `on_result`
    /// may still follow.
    fn on_error(&self, error: ResolveError);
}

enum Slot {
    Idle,
    Attached(Arc<dyn Listener>),
    Detached,
}

/// Owns a resolver's listener and serializes every delivery to it.
///
/// Once [`detach`](Self::detach) returns, no further callback can reach the
/// listener: deliveries hold the slot lock for the duration of the call.
pub(crate) struct Dispatcher {
    slot: Mutex<Slot>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
        }
    }

    /// Installs the listener.  Fails if one was ever installed before or the
    /// resolver has already been shut down.
    pub(crate) async fn attach(&self, listener: Arc<dyn Listener>) -> Result<(), ResolveError> {
        let mut slot = self.slot.lock().await;
        match *slot {
            Slot::Idle => {
                *slot = Slot::Attached(listener);
                Ok(())
            }
            Slot::Attached(_) => Err(ResolveError::InvalidState("resolver already started")),
            Slot::Detached => Err(ResolveError::InvalidState("resolver has been shut down")),
        }
    }

    /// Drops the listener.  Returns `false` if it was already detached.
    pub(crate) async fn detach(&self) -> bool {
        let mut slot = self.slot.lock().await;
        !matches!(std::mem::replace(&mut *slot, Slot::Detached), Slot::Detached)
    }

    /// Returns `false` if the result was suppressed because of shutdown.
    pub(crate) async fn deliver_result(&self, result: ResolutionResult) -> bool {
        let slot = self.slot.lock().await;
        match &*slot {
            Slot::Attached(listener) => {
                listener.on_result(result);
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn deliver_error(&self, error: ResolveError) -> bool {
        let slot = self.slot.lock().await;
        match &*slot {
            Slot::Attached(listener) => {
                listener.on_error(error);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{recorder, Delivery};
    use crate::types::Endpoint;

    #[tokio::test]
    async fn attach_only_once() {
        let dispatcher = Dispatcher::new();
        let (listener, _rx) = recorder();
        dispatcher.attach(listener.clone()).await.unwrap();
        assert_eq!(
            dispatcher.attach(listener).await,
            Err(ResolveError::InvalidState("resolver already started"))
        );
    }

    #[tokio::test]
    async fn nothing_reaches_listener_after_detach() {
        let dispatcher = Dispatcher::new();
        let (listener, mut rx) = recorder();
        dispatcher.attach(listener.clone()).await.unwrap();

        let result = ResolutionResult::from_endpoints([Endpoint::new("a", 1)]);
        assert!(dispatcher.deliver_result(result.clone()).await);
        assert_eq!(rx.recv().await, Some(Delivery::Result(result.clone())));

        assert!(dispatcher.detach().await);
        assert!(!dispatcher.detach().await);
        assert!(!dispatcher.deliver_result(result).await);
        assert!(!dispatcher.deliver_error(ResolveError::SessionExpired).await);
        assert!(rx.try_recv().is_err());

        assert_eq!(
            dispatcher.attach(listener).await,
            Err(ResolveError::InvalidState("resolver has been shut down"))
        );
    }
}
