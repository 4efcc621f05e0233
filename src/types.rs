//! Value types shared by every resolver and consumer.
//!
//! All of these are immutable once built.  A topology change never edits an
//! existing [`ResolutionResult`]; the resolver builds a new one and pushes it
//! to its listener, which swaps it in wholesale.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ResolveError;

/// One reachable network location of a backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

/// Why a `host:port` string could not be turned into an [`Endpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    #[error("missing port in {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("invalid host in {0:?}")]
    InvalidHost(String),
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    /// Parses `host:port` or `[v6addr]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;

        let host = match host.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| EndpointParseError::InvalidHost(s.to_string()))?,
            // An unbracketed colon means an IPv6 address without brackets,
            // which is ambiguous with the port separator.
            None if host.contains(':') => {
                return Err(EndpointParseError::InvalidHost(s.to_string()))
            }
            None => host,
        };
        if host.is_empty()
            || host
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#' | ','))
        {
            return Err(EndpointParseError::InvalidHost(s.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
        if port == 0 {
            return Err(EndpointParseError::InvalidPort(s.to_string()));
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A non-empty set of endpoints the load-balancing policy treats as
/// interchangeable.  Order is only a hint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Endpoint>", into = "Vec<Endpoint>")]
pub struct AddressGroup {
    endpoints: Vec<Endpoint>,
}

impl AddressGroup {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, ResolveError> {
        if endpoints.is_empty() {
            return Err(ResolveError::Configuration(
                "an address group needs at least one endpoint".into(),
            ));
        }
        Ok(Self { endpoints })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

impl TryFrom<Vec<Endpoint>> for AddressGroup {
    type Error = ResolveError;

    fn try_from(endpoints: Vec<Endpoint>) -> Result<Self, Self::Error> {
        Self::new(endpoints)
    }
}

impl From<AddressGroup> for Vec<Endpoint> {
    fn from(group: AddressGroup) -> Self {
        group.endpoints
    }
}

impl From<Endpoint> for AddressGroup {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            endpoints: vec![endpoint],
        }
    }
}

/// Opaque resolver-supplied metadata handed along with a result.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// The unit a resolver pushes to its listener.
///
/// An empty `address_groups` means "currently no backends", which is a valid
/// result and not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    address_groups: Vec<AddressGroup>,
    attributes: Attributes,
}

impl ResolutionResult {
    pub fn new(address_groups: Vec<AddressGroup>) -> Self {
        Self {
            address_groups,
            attributes: Attributes::new(),
        }
    }

    /// One group per endpoint, so a picker can balance across each of them.
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self::new(endpoints.into_iter().map(AddressGroup::from).collect())
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn address_groups(&self) -> &[AddressGroup] {
        &self.address_groups
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn is_empty(&self) -> bool {
        self.address_groups.is_empty()
    }

    /// Every endpoint of every group, in group order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.address_groups.iter().flat_map(|g| g.endpoints().iter())
    }

    pub fn into_address_groups(self) -> Vec<AddressGroup> {
        self.address_groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let ep: Endpoint = "10.0.0.1:50051".parse().unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.1", 50051));
        assert_eq!(ep.to_string(), "10.0.0.1:50051");

        let ep: Endpoint = "backend.internal:8080".parse().unwrap();
        assert_eq!(ep.host(), "backend.internal");
        assert_eq!(ep.port(), 8080);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let ep: Endpoint = "[::1]:50051".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "[::1]:50051");
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!(matches!(
            "garbage".parse::<Endpoint>(),
            Err(EndpointParseError::MissingPort(_))
        ));
        assert!(matches!(
            "host:notaport".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "host:70000".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "host:0".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort(_))
        ));
        assert!(matches!(
            ":50051".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidHost(_))
        ));
        assert!(matches!(
            "::1:50051".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidHost(_))
        ));
        assert!(matches!(
            "a b:1".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidHost(_))
        ));
    }

    #[test]
    fn address_group_must_not_be_empty() {
        assert!(AddressGroup::new(Vec::new()).is_err());
        let group = AddressGroup::new(vec![Endpoint::new("a", 1), Endpoint::new("b", 2)]).unwrap();
        assert_eq!(group.endpoints().len(), 2);
    }

    #[test]
    fn address_group_json_keeps_the_non_empty_rule() {
        let group: AddressGroup =
            serde_json::from_str(r#"[{"host":"a","port":1},{"host":"b","port":2}]"#).unwrap();
        assert_eq!(group.endpoints(), [Endpoint::new("a", 1), Endpoint::new("b", 2)]);
        assert_eq!(
            serde_json::to_value(&group).unwrap(),
            serde_json::json!([{"host": "a", "port": 1}, {"host": "b", "port": 2}])
        );

        let err = serde_json::from_str::<AddressGroup>("[]").unwrap_err();
        assert!(err.to_string().contains("at least one endpoint"), "{err}");
    }

    #[test]
    fn result_from_endpoints_uses_one_group_each() {
        let result = ResolutionResult::from_endpoints([Endpoint::new("a", 1), Endpoint::new("b", 2)])
            .with_attribute("source", serde_json::json!("test"));
        assert_eq!(result.address_groups().len(), 2);
        assert_eq!(result.endpoints().count(), 2);
        assert_eq!(result.attributes()["source"], "test");
        assert!(ResolutionResult::default().is_empty());
    }
}
