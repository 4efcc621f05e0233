//! Client-side name resolution.
//!
//! A target URI is turned into a resolver by the [`ResolverFactory`]; the
//! resolver pushes [`ResolutionResult`]s to a [`Listener`] whenever the backend
//! set changes, and a consumer such as [`RoundRobin`] picks one endpoint per
//! outbound call from the latest set.
//!
//! Three schemes are provided:
//!
//! * `static://host:port,host:port`: a fixed list, published once.
//! * `dns://host:port`: re-resolved on an interval.
//! * `registry://host:port/service/path`: backends registered as ephemeral
//!   children of a path in a coordination registry, kept current through
//!   watches.

pub mod balancer;
pub mod config;
pub mod error;
pub mod factory;
pub mod listener;
pub mod registry;
pub mod resolver;
pub mod target;
pub mod types;

#[cfg(test)]
mod test_support;

pub use balancer::RoundRobin;
pub use error::ResolveError;
pub use factory::ResolverFactory;
pub use listener::Listener;
pub use resolver::{Resolver, ResolverOptions};
pub use target::Target;
pub use types::{AddressGroup, Endpoint, ResolutionResult};
