//! Error taxonomy for resolution and picking.

use thiserror::Error;

use crate::registry::RegistryError;

/// Status handed to listeners and returned from fallible operations.
///
/// Only `Configuration`, `InvalidState` and `UnknownScheme` are returned
/// synchronously.  `Unavailable`, `SessionExpired` and `TotalParseFailure`
/// travel through [`Listener::on_error`](crate::listener::Listener::on_error)
/// and never terminate the resolver.  `NoBackendsAvailable` belongs to the
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Bad target or construction input.  Not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("no resolver registered for scheme {0:?}")]
    UnknownScheme(String),

    /// The registry could not be reached.  Retried by the resolver.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("registry session expired")]
    SessionExpired,

    /// None of the entries of a non-empty batch could be parsed.
    #[error("none of {count} registry entries could be parsed")]
    TotalParseFailure { count: usize },

    #[error("no backends available")]
    NoBackendsAvailable,
}

impl ResolveError {
    /// Whether a later result may still arrive after this status.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::SessionExpired | Self::TotalParseFailure { .. }
        )
    }
}

impl From<RegistryError> for ResolveError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::SessionExpired => Self::SessionExpired,
            other => Self::Unavailable(other.to_string()),
        }
    }
}
