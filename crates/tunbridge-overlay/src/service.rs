//! Service directory, intercept lookup and the dialing contract
//!
//! Services are reached by name. A client that only knows a destination
//! (`tcp:api.internal:443`) finds the service through its intercepts: the
//! protocols, addresses and ports a service claims.

use crate::connection::OverlayConnection;
use crate::error::OverlayResult;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// Transport protocol of an intercepted destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid intercept address: {0}")]
pub struct InvalidAddress(String);

/// An address an intercept claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InterceptAddress {
    /// Exact hostname, matched case-insensitively
    Hostname(String),
    /// `*.domain.tld`: any name strictly below `domain.tld`
    Wildcard(String),
    /// An IP network; a bare IP is a /32 or /128
    Cidr(IpNetwork),
}

impl InterceptAddress {
    pub fn parse(s: &str) -> Result<Self, InvalidAddress> {
        let s = s.trim();
        if s.is_empty() {
            return Err(InvalidAddress(s.to_string()));
        }

        if let Some(suffix) = s.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(InvalidAddress(s.to_string()));
            }
            return Ok(Self::Wildcard(suffix.to_ascii_lowercase()));
        }

        if let Ok(ip) = IpAddr::from_str(s) {
            return Ok(Self::Cidr(IpNetwork::from(ip)));
        }

        if s.contains('/') {
            return IpNetwork::from_str(s)
                .map(Self::Cidr)
                .map_err(|_| InvalidAddress(s.to_string()));
        }

        if s.contains('*') {
            return Err(InvalidAddress(s.to_string()));
        }

        Ok(Self::Hostname(s.to_ascii_lowercase()))
    }

    fn matches(&self, host: &DestinationHost<'_>) -> bool {
        match (self, host) {
            (Self::Cidr(net), DestinationHost::Ip(ip)) => net.contains(*ip),
            (Self::Hostname(name), DestinationHost::Name(h)) => name.eq_ignore_ascii_case(h),
            (Self::Wildcard(suffix), DestinationHost::Name(h)) => {
                let h = h.to_ascii_lowercase();
                h.len() > suffix.len() + 1
                    && h.ends_with(suffix.as_str())
                    && h.as_bytes()[h.len() - suffix.len() - 1] == b'.'
            }
            _ => false,
        }
    }
}

impl TryFrom<String> for InterceptAddress {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InterceptAddress> for String {
    fn from(addr: InterceptAddress) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for InterceptAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hostname(name) => f.write_str(name),
            Self::Wildcard(suffix) => write!(f, "*.{}", suffix),
            Self::Cidr(net) => write!(f, "{}", net),
        }
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            low: port,
            high: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.low <= port && port <= self.high
    }
}

/// The destinations one service claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intercept {
    pub protocols: Vec<Protocol>,
    pub addresses: Vec<InterceptAddress>,
    #[serde(default)]
    pub port_ranges: Vec<PortRange>,
}

impl Intercept {
    fn matches(&self, protocol: Protocol, host: &DestinationHost<'_>, port: u16) -> bool {
        self.protocols.contains(&protocol)
            && self.addresses.iter().any(|a| a.matches(host))
            && (self.port_ranges.is_empty() || self.port_ranges.iter().any(|r| r.contains(port)))
    }
}

/// A named service reachable over the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    /// Address of the relay carrying this service (`host:port`)
    #[serde(default)]
    pub relay: Option<String>,
    #[serde(default)]
    pub intercepts: Vec<Intercept>,
}

enum DestinationHost<'a> {
    Ip(IpAddr),
    Name(&'a str),
}

impl<'a> DestinationHost<'a> {
    fn parse(host: &'a str) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match IpAddr::from_str(trimmed) {
            Ok(ip) => DestinationHost::Ip(ip),
            Err(_) => DestinationHost::Name(host),
        }
    }
}

/// Known services and their intercepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceDirectory {
    services: Vec<ServiceEntry>,
}

impl ServiceDirectory {
    pub fn new(services: Vec<ServiceEntry>) -> Self {
        Self { services }
    }

    pub fn insert(&mut self, entry: ServiceEntry) {
        self.services.retain(|s| s.name != entry.name);
        self.services.push(entry);
    }

    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Find the service whose intercept claims `protocol:host:port`.
    /// First registered match wins.
    pub fn service_for_addr(&self, protocol: Protocol, host: &str, port: u16) -> Option<&ServiceEntry> {
        let dest = DestinationHost::parse(host);
        let found = self
            .services
            .iter()
            .find(|s| s.intercepts.iter().any(|i| i.matches(protocol, &dest, port)));

        trace!(
            "intercept lookup {}:{}:{} -> {:?}",
            protocol,
            host,
            port,
            found.map(|s| s.name.as_str())
        );
        found
    }
}

/// Destination metadata attached to a dial (the `app_data` of the request)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationMetadata {
    pub dst_protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_hostname: Option<String>,
    pub dst_port: String,
}

impl DestinationMetadata {
    /// IP literals go to `dst_ip`, anything else to `dst_hostname`
    pub fn new(protocol: Protocol, host: &str, port: u16) -> Self {
        let (dst_ip, dst_hostname) = match DestinationHost::parse(host) {
            DestinationHost::Ip(ip) => (Some(ip.to_string()), None),
            DestinationHost::Name(name) => (None, Some(name.to_string())),
        };
        Self {
            dst_protocol: protocol,
            dst_ip,
            dst_hostname,
            dst_port: port.to_string(),
        }
    }

    pub fn to_app_data(&self) -> Vec<u8> {
        // A struct of strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Options for one dial
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub app_data: Option<Vec<u8>>,
}

impl DialOptions {
    pub fn with_destination(dest: &DestinationMetadata) -> Self {
        Self {
            app_data: Some(dest.to_app_data()),
        }
    }
}

/// Establishes overlay connections to named services
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Dial `service`. Resolves once the overlay connection is established.
    async fn dial(&self, service: &str, options: DialOptions) -> OverlayResult<OverlayConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> ServiceDirectory {
        serde_json::from_str(
            r#"[
                {
                    "name": "web",
                    "relay": "127.0.0.1:7000",
                    "intercepts": [{
                        "protocols": ["tcp"],
                        "addresses": ["web.internal", "*.apps.internal"],
                        "port_ranges": [{"low": 80, "high": 80}, {"low": 8000, "high": 8100}]
                    }]
                },
                {
                    "name": "dns",
                    "intercepts": [{
                        "protocols": ["udp", "tcp"],
                        "addresses": ["10.0.0.0/24", "fd00::53"],
                        "port_ranges": [{"low": 53, "high": 53}]
                    }]
                }
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_intercept_lookup_by_hostname() {
        let dir = directory();
        assert_eq!(dir.len(), 2);

        let svc = dir.service_for_addr(Protocol::Tcp, "WEB.internal", 80).unwrap();
        assert_eq!(svc.name, "web");
        assert_eq!(svc.relay.as_deref(), Some("127.0.0.1:7000"));

        assert!(dir.service_for_addr(Protocol::Tcp, "web.internal", 443).is_none());
        assert!(dir.service_for_addr(Protocol::Udp, "web.internal", 80).is_none());
    }

    #[test]
    fn test_intercept_lookup_wildcard() {
        let dir = directory();
        assert_eq!(
            dir.service_for_addr(Protocol::Tcp, "api.apps.internal", 8080)
                .map(|s| s.name.as_str()),
            Some("web")
        );
        assert!(dir
            .service_for_addr(Protocol::Tcp, "apps.internal", 8080)
            .is_none());
        assert!(dir
            .service_for_addr(Protocol::Tcp, "evilapps.internal", 8080)
            .is_none());
    }

    #[test]
    fn test_intercept_lookup_by_ip() {
        let dir = directory();
        assert_eq!(
            dir.service_for_addr(Protocol::Udp, "10.0.0.9", 53)
                .map(|s| s.name.as_str()),
            Some("dns")
        );
        assert_eq!(
            dir.service_for_addr(Protocol::Tcp, "[fd00::53]", 53)
                .map(|s| s.name.as_str()),
            Some("dns")
        );
        assert!(dir.service_for_addr(Protocol::Udp, "10.0.1.9", 53).is_none());
    }

    #[test]
    fn test_intercept_address_parse() {
        assert!(InterceptAddress::parse("").is_err());
        assert!(InterceptAddress::parse("*.").is_err());
        assert!(InterceptAddress::parse("a.*.com").is_err());
        assert!(InterceptAddress::parse("10.0.0.0/33").is_err());
        assert_eq!(
            InterceptAddress::parse("Host.Example").unwrap(),
            InterceptAddress::Hostname("host.example".to_string())
        );
        assert_eq!(
            InterceptAddress::parse("*.Example.com").unwrap().to_string(),
            "*.example.com"
        );
    }

    #[test]
    fn test_destination_metadata() {
        let by_name = DestinationMetadata::new(Protocol::Tcp, "example.com", 80);
        let json: serde_json::Value = serde_json::from_slice(&by_name.to_app_data()).unwrap();
        assert_eq!(json["dst_protocol"], "tcp");
        assert_eq!(json["dst_hostname"], "example.com");
        assert_eq!(json["dst_port"], "80");
        assert!(json.get("dst_ip").is_none());

        let by_ip = DestinationMetadata::new(Protocol::Tcp, "192.168.1.4", 8443);
        assert_eq!(by_ip.dst_ip.as_deref(), Some("192.168.1.4"));
        assert!(by_ip.dst_hostname.is_none());
    }

    #[test]
    fn test_insert_replaces_by_name() {
        let mut dir = ServiceDirectory::default();
        assert!(dir.is_empty());
        dir.insert(ServiceEntry {
            name: "a".to_string(),
            relay: None,
            intercepts: vec![],
        });
        dir.insert(ServiceEntry {
            name: "a".to_string(),
            relay: Some("h:1".to_string()),
            intercepts: vec![],
        });
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get("a").unwrap().relay.as_deref(), Some("h:1"));
    }
}
