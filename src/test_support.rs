//! Helpers shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::ResolveError;
use crate::listener::Listener;
use crate::types::{Endpoint, ResolutionResult};

/// How long a test waits for a delivery before giving up.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Delivery {
    Result(ResolutionResult),
    Error(ResolveError),
}

/// Forwards every callback into a channel.
pub(crate) struct Recorder {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Listener for Recorder {
    fn on_result(&self, result: ResolutionResult) {
        let _ = self.tx.send(Delivery::Result(result));
    }

    fn on_error(&self, error: ResolveError) {
        let _ = self.tx.send(Delivery::Error(error));
    }
}

pub(crate) fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

pub(crate) async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("listener channel closed")
}

/// Waits for the next delivery and requires it to be a result.
pub(crate) async fn next_result(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> ResolutionResult {
    match next(rx).await {
        Delivery::Result(result) => result,
        Delivery::Error(err) => panic!("expected a result, got error {err}"),
    }
}

/// Skips errors until a result arrives.
pub(crate) async fn next_result_skipping_errors(
    rx: &mut mpsc::UnboundedReceiver<Delivery>,
) -> ResolutionResult {
    loop {
        if let Delivery::Result(result) = next(rx).await {
            return result;
        }
    }
}

/// Asserts nothing is delivered within `window`.
pub(crate) async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Delivery>, window: Duration) {
    if let Ok(Some(delivery)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected delivery {delivery:?}");
    }
}

/// Endpoints of a result, sorted for order-independent comparison.
pub(crate) fn sorted_endpoints(result: &ResolutionResult) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = result.endpoints().cloned().collect();
    endpoints.sort();
    endpoints
}

pub(crate) fn eps(list: &[&str]) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = list.iter().map(|s| s.parse().unwrap()).collect();
    endpoints.sort();
    endpoints
}
